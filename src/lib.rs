//! Program and protect the eFuses of Espressif devices
//!
//! eFuses are one-time programmable bits: once burned they can never be
//! cleared again. This crate models the eFuse blocks and fields of each
//! supported chip, checks that a requested change is possible, and burns all
//! touched blocks in one commit.
//!
//! ```no_run
//! use espfuse::{BurnBatch, BurnOptions, Burner, Chip, KeyPurpose, VirtualTransport};
//!
//! let transport = VirtualTransport::new(Chip::Esp32c3, 4);
//! let mut burner = Burner::new(Chip::Esp32c3, transport)?;
//!
//! let batch = BurnBatch::new().key("BLOCK_KEY0", vec![0x42; 32], Some(KeyPurpose::HmacUp));
//! burner.burn_key(&batch, BurnOptions::default())?;
//! # Ok::<(), espfuse::Error>(())
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub use self::{
    burn::{BurnBatch, BurnOptions, BurnOutcome, Burner},
    coding::CodingScheme,
    efuse::{Block, Efuses, Field, FieldMut, FieldValue, Protection},
    error::Error,
    protect::PurposeChange,
    targets::{Chip, KeyPurpose, Target},
    transport::{Transport, VirtualTransport},
};

pub mod burn;
#[cfg(feature = "cli")]
pub mod cli;
pub mod coding;
pub mod digest;
pub mod efuse;
pub mod error;
#[cfg(feature = "cli")]
pub mod logging;
pub mod targets;
pub mod transport;

mod protect;
