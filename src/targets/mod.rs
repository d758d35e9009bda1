//! Chip variant descriptors
//!
//! Each supported device provides a [Target] describing its eFuse blocks,
//! the fields mapped onto them, the key purposes it understands and its
//! quirks. The burn engine itself is chip-agnostic and only talks to the
//! descriptor.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, VariantNames};

pub use self::{
    esp32::Esp32,
    esp32c3::Esp32c3,
    esp32c6::Esp32c6,
    esp32h2::Esp32h2,
    esp32p4::Esp32p4,
    esp32s2::Esp32s2,
    esp32s3::Esp32s3,
};
use crate::{coding::CodingScheme, error::Error};

mod esp32;
mod esp32c3;
mod esp32c6;
mod esp32h2;
mod esp32p4;
mod esp32s2;
mod esp32s3;

/// All supported devices
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Display,
    EnumIter,
    EnumString,
    VariantNames,
    Deserialize,
    Serialize,
)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Chip {
    /// ESP32
    Esp32,
    /// ESP32-C3, ESP8685
    Esp32c3,
    /// ESP32-C6
    Esp32c6,
    /// ESP32-H2
    Esp32h2,
    /// ESP32-P4
    Esp32p4,
    /// ESP32-S2
    Esp32s2,
    /// ESP32-S3
    Esp32s3,
}

impl Chip {
    pub fn into_target(&self) -> Box<dyn Target> {
        match self {
            Chip::Esp32 => Box::new(Esp32),
            Chip::Esp32c3 => Box::new(Esp32c3),
            Chip::Esp32c6 => Box::new(Esp32c6),
            Chip::Esp32h2 => Box::new(Esp32h2),
            Chip::Esp32p4 => Box::new(Esp32p4),
            Chip::Esp32s2 => Box::new(Esp32s2),
            Chip::Esp32s3 => Box::new(Esp32s3),
        }
    }
}

/// Static description of an eFuse block
#[derive(Debug, Clone, Copy)]
pub struct BlockDef {
    /// Index of the block, as used by the transport.
    pub index: u8,
    /// Canonical name.
    pub name: &'static str,
    /// Alternative names accepted on the command line.
    pub aliases: &'static [&'static str],
    /// Number of data registers in this block.
    ///
    /// Each register is a single 4-byte word.
    pub length: u8,
    /// Bit in `RD_DIS` which read-protects this block.
    pub read_disable_bit: Option<u8>,
    /// Bit in `WR_DIS` which write-protects this block.
    pub write_disable_bit: Option<u8>,
    /// Name of the field holding the purpose of the key stored in this block.
    pub key_purpose: Option<&'static str>,
    /// Coding scheme unless the target decides otherwise at runtime.
    pub coding: CodingScheme,
}

impl BlockDef {
    pub const fn new(index: u8, name: &'static str, length: u8, coding: CodingScheme) -> Self {
        Self {
            index,
            name,
            aliases: &[],
            length,
            read_disable_bit: None,
            write_disable_bit: None,
            key_purpose: None,
            coding,
        }
    }

    pub const fn aliases(self, aliases: &'static [&'static str]) -> Self {
        Self { aliases, ..self }
    }

    pub const fn rd_dis(self, bit: u8) -> Self {
        Self {
            read_disable_bit: Some(bit),
            ..self
        }
    }

    pub const fn wr_dis(self, bit: u8) -> Self {
        Self {
            write_disable_bit: Some(bit),
            ..self
        }
    }

    pub const fn key(self, purpose_field: &'static str) -> Self {
        Self {
            key_purpose: Some(purpose_field),
            ..self
        }
    }

    /// Size of the data registers in bytes.
    pub fn raw_len(&self) -> usize {
        self.length as usize * 4
    }

    /// Whether `name` refers to this block, either directly or by alias.
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

/// What an eFuse field is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FieldCategory {
    Config,
    Security,
    Identity,
    Key,
    Purpose,
    /// Factory calibration, never written by this crate.
    Calibration,
    User,
}

/// How the bits of a field are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Uint,
    Bytes,
    KeyPurpose,
    Mac,
}

/// Static description of an eFuse field
///
/// `bit_start` is relative to the start of the owning block.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub name: &'static str,
    pub block: u8,
    pub bit_start: u16,
    pub bit_count: u16,
    pub category: FieldCategory,
    pub kind: FieldKind,
    /// Overrides the owning block's read-disable bit.
    pub read_disable_bit: Option<u8>,
    /// Overrides the owning block's write-disable bit.
    pub write_disable_bit: Option<u8>,
}

impl FieldDef {
    pub const fn new(
        name: &'static str,
        block: u8,
        bit_start: u16,
        bit_count: u16,
        category: FieldCategory,
    ) -> Self {
        let kind = match bit_count {
            1 => FieldKind::Bool,
            0..=64 => FieldKind::Uint,
            _ => FieldKind::Bytes,
        };

        Self {
            name,
            block,
            bit_start,
            bit_count,
            category,
            kind,
            read_disable_bit: None,
            write_disable_bit: None,
        }
    }

    pub const fn kind(self, kind: FieldKind) -> Self {
        Self { kind, ..self }
    }

    pub const fn rd_dis(self, bit: u8) -> Self {
        Self {
            read_disable_bit: Some(bit),
            ..self
        }
    }

    pub const fn wr_dis(self, bit: u8) -> Self {
        Self {
            write_disable_bit: Some(bit),
            ..self
        }
    }

    pub fn bit_range(&self) -> std::ops::Range<usize> {
        self.bit_start as usize..(self.bit_start + self.bit_count) as usize
    }
}

/// Purposes a key block can be assigned to
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumIter,
    EnumString,
    VariantNames,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum KeyPurpose {
    #[strum(to_string = "USER", serialize = "UNSET")]
    User,
    Reserved,
    EcdsaKey,
    #[strum(serialize = "XTS_AES_256_KEY_1")]
    XtsAes256Key1,
    #[strum(serialize = "XTS_AES_256_KEY_2")]
    XtsAes256Key2,
    #[strum(serialize = "XTS_AES_128_KEY")]
    XtsAes128Key,
    HmacDownAll,
    HmacDownJtag,
    HmacDownDigitalSignature,
    HmacUp,
    SecureBootDigest0,
    SecureBootDigest1,
    SecureBootDigest2,
    KmInitKey,
    /// 512-bit key, burned as `XTS_AES_256_KEY_1` + `XTS_AES_256_KEY_2`.
    #[strum(serialize = "XTS_AES_256_KEY")]
    XtsAes256Key,
    /// ESP32 BLOCK1
    FlashEncryption,
    /// ESP32 BLOCK2
    SecureBootV1,
    /// ESP32 BLOCK2 holding a secure boot v2 digest
    SecureBootV2,
}

/// How a key purpose is used by the burn engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurposeClass {
    /// Raw key material.
    Key,
    /// A public-key digest produced by the secure boot tooling.
    Digest,
    /// Never stored, expanded into other purposes before burning.
    Virtual,
}

/// A key purpose as understood by one chip
#[derive(Debug, Clone, Copy)]
pub struct KeyPurposeDef {
    pub purpose: KeyPurpose,
    /// Value stored in the `KEY_PURPOSE_n` field, `None` for virtual purposes.
    pub code: Option<u8>,
    pub class: PurposeClass,
    /// The consuming peripheral reads the key most-significant byte first.
    pub reverse: bool,
    pub read_protect: bool,
}

impl KeyPurposeDef {
    pub const fn key(purpose: KeyPurpose, code: u8, reverse: bool, read_protect: bool) -> Self {
        Self {
            purpose,
            code: Some(code),
            class: PurposeClass::Key,
            reverse,
            read_protect,
        }
    }

    pub const fn digest(purpose: KeyPurpose, code: u8) -> Self {
        Self {
            purpose,
            code: Some(code),
            class: PurposeClass::Digest,
            reverse: false,
            read_protect: false,
        }
    }

    pub const fn virtual_key(purpose: KeyPurpose) -> Self {
        Self {
            purpose,
            code: None,
            class: PurposeClass::Virtual,
            reverse: true,
            read_protect: true,
        }
    }
}

/// A 512-bit purpose which is split over two key blocks
#[derive(Debug, Clone, Copy)]
pub struct WideKey {
    pub purpose: KeyPurpose,
    pub first: KeyPurpose,
    pub second: KeyPurpose,
}

/// Fuse which forces the hardware ECDSA countermeasure on older silicon
#[derive(Debug, Clone, Copy)]
pub struct HardwareKFuse {
    pub field: &'static str,
    pub purpose: KeyPurpose,
    /// Newest chip revision which still needs the fuse.
    pub max_revision: u32,
}

/// Fields burned together with a custom MAC address
#[derive(Debug, Clone, Copy)]
pub struct CustomMacCheck {
    /// CRC-8 of the address.
    pub crc: &'static str,
    /// Marks the custom address as valid.
    pub version: &'static str,
}

/// Per-chip eFuse layout and burn quirks
pub trait Target {
    fn chip(&self) -> Chip;

    /// All blocks, ordered by index.
    fn blocks(&self) -> &'static [BlockDef];

    fn fields(&self) -> &'static [FieldDef];

    /// Key purposes understood by this chip, empty for chips without a
    /// key-purpose field.
    fn key_purposes(&self) -> &'static [KeyPurposeDef];

    /// Coding scheme of `block`, given the decoded contents of BLOCK0.
    fn coding_scheme(&self, block: &BlockDef, _block0: &[u8]) -> Result<CodingScheme, Error> {
        Ok(block.coding)
    }

    /// Purpose implied by a block name on chips without key-purpose fields.
    fn implied_purpose(&self, _block_name: &str) -> Option<KeyPurposeDef> {
        None
    }

    /// Block receiving digests on chips without key-purpose fields.
    fn digest_block(&self) -> Option<&'static str> {
        None
    }

    fn wide_key(&self) -> Option<WideKey> {
        None
    }

    /// Minimum chip revision (major * 100 + minor) for secure boot v2
    /// digests, if the chip restricts it.
    fn min_revision_for_secure_boot_v2(&self) -> Option<u32> {
        None
    }

    fn hardware_k_fuse(&self) -> Option<HardwareKFuse> {
        None
    }

    fn custom_mac_check(&self) -> Option<CustomMacCheck> {
        None
    }

    /// Refuse to read-protect `name` if the chip needs it readable.
    fn check_read_protect(&self, _name: &str, _efuses: &crate::efuse::Efuses) -> Result<(), Error> {
        Ok(())
    }

    fn key_purpose(&self, purpose: KeyPurpose) -> Option<&'static KeyPurposeDef> {
        self.key_purposes().iter().find(|p| p.purpose == purpose)
    }

    fn key_purpose_by_code(&self, code: u8) -> Option<&'static KeyPurposeDef> {
        self.key_purposes().iter().find(|p| p.code == Some(code))
    }

    fn block(&self, name: &str) -> Option<&'static BlockDef> {
        self.blocks().iter().find(|b| b.matches(name))
    }

    fn field(&self, name: &str) -> Option<&'static FieldDef> {
        self.fields()
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }
}

/// Blocks shared by all chips with six key blocks and Reed-Solomon coding.
///
/// BLOCK0 and BLOCK1 differ in size between chips and are passed in.
pub(crate) const fn rs_key_blocks(block0_len: u8, block1_len: u8) -> [BlockDef; 11] {
    use CodingScheme::{None, ReedSolomon};

    [
        BlockDef::new(0, "BLOCK0", block0_len, None),
        BlockDef::new(1, "BLOCK_MAC_SYS", block1_len, ReedSolomon)
            .aliases(&["BLOCK1"])
            .wr_dis(20),
        BlockDef::new(2, "BLOCK_SYS_DATA1", 8, ReedSolomon)
            .aliases(&["BLOCK2"])
            .wr_dis(21),
        BlockDef::new(3, "BLOCK_USR_DATA", 8, ReedSolomon)
            .aliases(&["BLOCK3", "USER_DATA"])
            .wr_dis(22),
        BlockDef::new(4, "BLOCK_KEY0", 8, ReedSolomon)
            .aliases(&["BLOCK4", "KEY0"])
            .rd_dis(0)
            .wr_dis(23)
            .key("KEY_PURPOSE_0"),
        BlockDef::new(5, "BLOCK_KEY1", 8, ReedSolomon)
            .aliases(&["BLOCK5", "KEY1"])
            .rd_dis(1)
            .wr_dis(24)
            .key("KEY_PURPOSE_1"),
        BlockDef::new(6, "BLOCK_KEY2", 8, ReedSolomon)
            .aliases(&["BLOCK6", "KEY2"])
            .rd_dis(2)
            .wr_dis(25)
            .key("KEY_PURPOSE_2"),
        BlockDef::new(7, "BLOCK_KEY3", 8, ReedSolomon)
            .aliases(&["BLOCK7", "KEY3"])
            .rd_dis(3)
            .wr_dis(26)
            .key("KEY_PURPOSE_3"),
        BlockDef::new(8, "BLOCK_KEY4", 8, ReedSolomon)
            .aliases(&["BLOCK8", "KEY4"])
            .rd_dis(4)
            .wr_dis(27)
            .key("KEY_PURPOSE_4"),
        BlockDef::new(9, "BLOCK_KEY5", 8, ReedSolomon)
            .aliases(&["BLOCK9", "KEY5"])
            .rd_dis(5)
            .wr_dis(28)
            .key("KEY_PURPOSE_5"),
        BlockDef::new(10, "BLOCK_SYS_DATA2", 8, ReedSolomon)
            .aliases(&["BLOCK10", "SYS_DATA_PART2"])
            .rd_dis(6)
            .wr_dis(29),
    ]
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn fields_do_not_overlap() {
        for chip in Chip::iter() {
            let target = chip.into_target();
            for block in target.blocks() {
                let bits = block.raw_len() * 8;
                let mut ranges = target
                    .fields()
                    .iter()
                    .filter(|f| f.block == block.index)
                    .map(|f| (f.bit_range(), f.name))
                    .collect::<Vec<_>>();
                ranges.sort_by_key(|(r, _)| r.start);

                for (range, name) in &ranges {
                    assert!(range.end <= bits, "{chip}: {name} exceeds {}", block.name);
                }
                for pair in ranges.windows(2) {
                    assert!(
                        pair[0].0.end <= pair[1].0.start,
                        "{chip}: {} overlaps {}",
                        pair[0].1,
                        pair[1].1
                    );
                }
            }
        }
    }

    #[test]
    fn blocks_are_ordered_by_index() {
        for chip in Chip::iter() {
            let target = chip.into_target();
            for (idx, block) in target.blocks().iter().enumerate() {
                assert_eq!(block.index as usize, idx, "{chip}: {}", block.name);
            }
        }
    }

    #[test]
    fn referenced_fields_exist() {
        for chip in Chip::iter() {
            let target = chip.into_target();
            assert!(target.field("WR_DIS").is_some());
            assert!(target.field("RD_DIS").is_some());

            for block in target.blocks() {
                if let Some(purpose) = block.key_purpose {
                    let field = target.field(purpose).unwrap();
                    assert_eq!(field.kind, FieldKind::KeyPurpose);
                }
            }
            if let Some(k) = target.hardware_k_fuse() {
                assert!(target.field(k.field).is_some());
            }
            if let Some(mac) = target.custom_mac_check() {
                assert!(target.field(mac.crc).is_some());
                assert!(target.field(mac.version).is_some());
            }
        }
    }

    #[test]
    fn purpose_codes_are_unique() {
        for chip in Chip::iter() {
            let target = chip.into_target();
            let mut codes = target
                .key_purposes()
                .iter()
                .filter_map(|p| p.code)
                .collect::<Vec<_>>();
            let len = codes.len();
            codes.sort();
            codes.dedup();
            assert_eq!(codes.len(), len, "{chip}");
        }
    }

    #[test]
    fn key_purpose_names() {
        assert_eq!(KeyPurpose::User.to_string(), "USER");
        assert_eq!(KeyPurpose::from_str("UNSET").unwrap(), KeyPurpose::User);
        assert_eq!(
            KeyPurpose::from_str("XTS_AES_256_KEY_1").unwrap(),
            KeyPurpose::XtsAes256Key1
        );
        assert_eq!(
            KeyPurpose::from_str("secure_boot_digest0").unwrap(),
            KeyPurpose::SecureBootDigest0
        );
        assert_eq!(KeyPurpose::HmacDownJtag.to_string(), "HMAC_DOWN_JTAG");
    }

    #[test]
    fn block_lookup_by_alias() {
        let target = Chip::Esp32c6.into_target();
        assert_eq!(target.block("BLOCK4").unwrap().name, "BLOCK_KEY0");
        assert_eq!(target.block("key5").unwrap().index, 9);
        assert!(target.block("BLOCK11").is_none());

        let target = Chip::Esp32.into_target();
        assert_eq!(target.block("flash_encryption").unwrap().index, 1);
        assert_eq!(target.block("secure_boot_v2").unwrap().index, 2);
    }
}
