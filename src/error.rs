//! Library and application errors

use std::io;

use miette::Diagnostic;
use thiserror::Error;

use crate::targets::Chip;

/// All possible errors returned by espfuse
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Operation was cancelled by the user")]
    #[diagnostic(code(espfuse::cancelled))]
    Cancelled,

    #[error("Unknown eFuse block '{0}'")]
    #[diagnostic(
        code(espfuse::unknown_block),
        help("Run the `summary` command to list the blocks of this chip")
    )]
    UnknownBlock(String),

    #[error("Unknown eFuse field '{0}'")]
    #[diagnostic(
        code(espfuse::unknown_field),
        help("Run the `summary` command to list the fields of this chip")
    )]
    UnknownField(String),

    #[error("{0} cannot hold a key")]
    #[diagnostic(
        code(espfuse::invalid_key_block),
        help("Keys can only be burned to the key blocks of the chip")
    )]
    InvalidKeyBlock(String),

    #[error("'{0}' is not a secure boot digest purpose")]
    #[diagnostic(code(espfuse::not_a_digest_purpose))]
    NotADigestPurpose(String),

    #[error("The {chip} does not support the key purpose '{purpose}'")]
    #[diagnostic(code(espfuse::unknown_key_purpose))]
    UnknownKeyPurpose { chip: Chip, purpose: String },

    #[error("Incorrect data size for {name}: expected {expected} bytes, got {actual} bytes")]
    #[diagnostic(code(espfuse::size_mismatch))]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Value {value:#x} does not fit into the {width}-bit field {name}")]
    #[diagnostic(code(espfuse::field_overflow))]
    FieldOverflow {
        name: String,
        width: usize,
        value: u64,
    },

    #[error("The name '{0}' was given more than once")]
    #[diagnostic(
        code(espfuse::duplicate_name),
        help("Each block or field may only appear once per command")
    )]
    DuplicateName(String),

    #[error(
        "The number of blocks ({blocks}), payloads ({payloads}) and key purposes ({purposes}) must be the same"
    )]
    #[diagnostic(code(espfuse::count_mismatch))]
    CountMismatch {
        blocks: usize,
        payloads: usize,
        purposes: usize,
    },

    #[error("{actual} bytes do not fit into the {usable} usable bytes of {block}")]
    #[diagnostic(code(espfuse::encoding_overflow))]
    EncodingOverflow {
        block: String,
        usable: usize,
        actual: usize,
    },

    #[error("Coding scheme violation in {block}")]
    #[diagnostic(code(espfuse::coding_scheme))]
    CodingScheme {
        block: String,
        #[source]
        source: CodingError,
    },

    #[error("{block} uses the '{scheme}' coding scheme, this operation only works with the 'None' coding scheme")]
    #[diagnostic(code(espfuse::unsupported_coding_scheme))]
    UnsupportedCodingScheme { block: String, scheme: String },

    #[error("eFuse protection rules forbid this operation")]
    #[diagnostic(transparent)]
    ProtectionViolation(#[source] ProtectionError),

    #[error("{name} must stay readable, refusing to read-protect it")]
    #[diagnostic(code(espfuse::must_be_readable))]
    MustBeReadable { name: String },

    #[error("{operation} requires chip revision v{}.{} or newer, found v{}.{}", .required / 100, .required % 100, .found / 100, .found % 100)]
    #[diagnostic(code(espfuse::unsupported_chip_revision))]
    UnsupportedChipRevision {
        operation: &'static str,
        required: u32,
        found: u32,
    },

    #[error("{purpose} requires two free key blocks")]
    #[diagnostic(
        code(espfuse::insufficient_free_key_blocks),
        help("A free key block is readable, writeable, carries the USER purpose and holds no data")
    )]
    InsufficientFreeKeyBlocks { purpose: String },

    #[error("Invalid offset {offset}: {block} only holds {len} bytes")]
    #[diagnostic(code(espfuse::invalid_offset))]
    InvalidOffset {
        block: String,
        offset: usize,
        len: usize,
    },

    #[error("The offset option can only be used with a single block")]
    #[diagnostic(code(espfuse::offset_with_many_blocks))]
    OffsetWithManyBlocks,

    #[error("Bit {bit} is out of range, {block} has bits 0..={max}")]
    #[diagnostic(code(espfuse::invalid_bit))]
    InvalidBit { block: String, bit: usize, max: usize },

    #[error("Error(s) were detected in eFuses: {0}")]
    #[diagnostic(
        code(espfuse::efuse_errors),
        help("Try the `check-error --recovery` command")
    )]
    EfuseErrors(String),

    #[error("Error while talking to the device")]
    #[diagnostic(transparent)]
    Transport(#[source] TransportError),

    #[error("Communication error while burning {blocks}")]
    #[diagnostic(
        code(espfuse::burning),
        help("The eFuses may be partially burned. Re-read the device before doing anything else")
    )]
    Burning {
        blocks: String,
        #[source]
        source: TransportError,
    },

    #[error("Verification of {block} failed: not all bits were set after burning")]
    #[diagnostic(code(espfuse::verify_failed))]
    VerifyFailed { block: String },

    #[error("Invalid value '{value}' for {name}")]
    #[diagnostic(
        code(espfuse::invalid_value),
        help("Numbers may be decimal or `0x`-prefixed hex, byte strings are hex, MAC addresses look like `aa:bb:cc:dd:ee:ff`")
    )]
    InvalidValue { name: String, value: String },

    #[error("No chip selected")]
    #[diagnostic(
        code(espfuse::no_chip),
        help("Pass `--chip` or set `chip` in espfuse.toml")
    )]
    ChipNotSpecified,

    #[cfg(feature = "cli")]
    #[error(transparent)]
    #[diagnostic(code(espfuse::dialoguer_error))]
    DialoguerError(#[from] dialoguer::Error),

    #[error("Failed to open file: {0}")]
    #[diagnostic(code(espfuse::file_open))]
    FileOpenError(String, #[source] io::Error),

    #[error("Invalid eFuse image: {0}")]
    #[diagnostic(code(espfuse::invalid_image))]
    InvalidImage(String),
}

/// Errors raised by a block's coding scheme
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum CodingError {
    #[error("Check bytes of the 3/4 coding group at byte {offset} are inconsistent")]
    #[diagnostic(code(espfuse::coding::check_mismatch))]
    CheckMismatch { offset: usize },

    #[error("Reed-Solomon data is not correctable")]
    #[diagnostic(code(espfuse::coding::reed_solomon))]
    Uncorrectable,

    #[error("Expected {expected} encoded bytes, got {actual}")]
    #[diagnostic(code(espfuse::coding::length))]
    Length { expected: usize, actual: usize },

    #[error("The block already holds encoded data and can not be written again")]
    #[diagnostic(
        code(espfuse::coding::rewrite),
        help("Coded blocks can only be burned once, changing them corrupts the check bits")
    )]
    Rewrite,
}

/// Violations of the eFuse protection and key-purpose rules
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ProtectionError {
    #[error("Cannot change the key purpose of {block} from {current} to {requested}, {field} is write-protected")]
    #[diagnostic(
        code(espfuse::protection::purpose_locked),
        help("Choose another key block, this one keeps its purpose for good")
    )]
    PurposeLocked {
        block: String,
        field: String,
        current: String,
        requested: String,
    },

    #[error("{name} has bits already burned which the new value would clear")]
    #[diagnostic(
        code(espfuse::protection::clear_burned_bits),
        help("eFuse bits can only be changed from 0 to 1")
    )]
    ClearBurnedBits { name: String },

    #[error("{name} is write-protected")]
    #[diagnostic(
        code(espfuse::protection::write_protected),
        help("Use `--force-write-always` to write anyway")
    )]
    WriteProtected { name: String },

    #[error("{name} is read-only")]
    #[diagnostic(code(espfuse::protection::read_only))]
    ReadOnly { name: String },

    #[error("{name} has no {kind} bit")]
    #[diagnostic(code(espfuse::protection::no_protection_bit))]
    NoProtectionBit { name: String, kind: &'static str },
}

/// Errors reported by a [`Transport`](crate::transport::Transport)
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("Block {0} does not exist on the device")]
    #[diagnostic(code(espfuse::transport::invalid_block))]
    InvalidBlock(u8),

    #[error("Expected {expected} bytes for block {block}, got {actual}")]
    #[diagnostic(code(espfuse::transport::length))]
    Length {
        block: u8,
        expected: usize,
        actual: usize,
    },

    #[error("The device did not respond")]
    #[diagnostic(
        code(espfuse::transport::no_response),
        help("Ensure that the device is connected and in download mode")
    )]
    NoResponse,

    #[error("IO error while talking to the device")]
    #[diagnostic(code(espfuse::transport::io))]
    Io(#[source] io::Error),
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<ProtectionError> for Error {
    fn from(err: ProtectionError) -> Self {
        Self::ProtectionViolation(err)
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

pub(crate) trait ResultExt {
    /// Mark an error as having occurred while burning the listed blocks
    fn burning(self, blocks: &[&str]) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn burning(self, blocks: &[&str]) -> Self {
        match self {
            Err(Error::Transport(source)) => Err(Error::Burning {
                blocks: blocks.join(", "),
                source,
            }),
            res => res,
        }
    }
}
