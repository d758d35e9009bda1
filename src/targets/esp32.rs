use log::warn;

use super::{
    BlockDef, Chip, CustomMacCheck, FieldCategory::*, FieldDef, FieldKind, KeyPurpose,
    KeyPurposeDef, PurposeClass, Target,
};
use crate::{coding::CodingScheme, efuse::Efuses, error::Error};

static BLOCKS: [BlockDef; 4] = [
    BlockDef::new(0, "BLOCK0", 7, CodingScheme::None),
    BlockDef::new(1, "BLOCK1", 8, CodingScheme::None)
        .aliases(&["flash_encryption"])
        .rd_dis(0)
        .wr_dis(7),
    BlockDef::new(2, "BLOCK2", 8, CodingScheme::None)
        .aliases(&["secure_boot_v1", "secure_boot_v2"])
        .rd_dis(1)
        .wr_dis(8),
    BlockDef::new(3, "BLOCK3", 8, CodingScheme::None)
        .rd_dis(2)
        .wr_dis(9),
];

static FIELDS: &[FieldDef] = &[
    FieldDef::new("WR_DIS", 0, 0, 16, Security),
    FieldDef::new("RD_DIS", 0, 16, 4, Security).wr_dis(0),
    FieldDef::new("FLASH_CRYPT_CNT", 0, 20, 7, Security).wr_dis(2),
    FieldDef::new("UART_DOWNLOAD_DIS", 0, 27, 1, Security).wr_dis(2),
    FieldDef::new("MAC", 0, 32, 48, Identity).kind(FieldKind::Mac).wr_dis(3),
    FieldDef::new("MAC_CRC", 0, 80, 8, Identity).wr_dis(3),
    FieldDef::new("CHIP_PACKAGE", 0, 105, 3, Identity).wr_dis(3),
    FieldDef::new("CHIP_VER_REV1", 0, 111, 1, Identity).wr_dis(3),
    FieldDef::new("ADC_VREF", 0, 136, 5, Calibration).wr_dis(4),
    FieldDef::new("CHIP_VER_REV2", 0, 180, 1, Identity).wr_dis(5),
    FieldDef::new("WAFER_VERSION_MINOR", 0, 184, 2, Identity).wr_dis(5),
    FieldDef::new("CODING_SCHEME", 0, 192, 2, Config).wr_dis(10),
    FieldDef::new("CONSOLE_DEBUG_DISABLE", 0, 194, 1, Security).wr_dis(15),
    FieldDef::new("ABS_DONE_0", 0, 196, 1, Security).wr_dis(12),
    FieldDef::new("ABS_DONE_1", 0, 197, 1, Security).wr_dis(13),
    FieldDef::new("JTAG_DISABLE", 0, 198, 1, Security).wr_dis(14),
    FieldDef::new("DISABLE_DL_ENCRYPT", 0, 199, 1, Security).wr_dis(15),
    FieldDef::new("DISABLE_DL_DECRYPT", 0, 200, 1, Security).wr_dis(15),
    FieldDef::new("DISABLE_DL_CACHE", 0, 201, 1, Security).wr_dis(15),
    FieldDef::new("BLOCK1", 1, 0, 256, Key),
    FieldDef::new("BLOCK2", 2, 0, 256, Key),
    FieldDef::new("CUSTOM_MAC_CRC", 3, 0, 8, Identity),
    FieldDef::new("CUSTOM_MAC", 3, 8, 48, Identity).kind(FieldKind::Mac),
    FieldDef::new("MAC_VERSION", 3, 184, 8, Identity),
];

const fn implied(purpose: KeyPurpose, class: PurposeClass, protect: bool) -> KeyPurposeDef {
    KeyPurposeDef {
        purpose,
        code: None,
        class,
        reverse: protect,
        read_protect: protect,
    }
}

static FLASH_ENCRYPTION: KeyPurposeDef =
    implied(KeyPurpose::FlashEncryption, PurposeClass::Key, true);
static SECURE_BOOT_V1: KeyPurposeDef = implied(KeyPurpose::SecureBootV1, PurposeClass::Key, true);
static SECURE_BOOT_V2: KeyPurposeDef =
    implied(KeyPurpose::SecureBootV2, PurposeClass::Digest, false);
static USER: KeyPurposeDef = implied(KeyPurpose::User, PurposeClass::Key, false);

/// ESP32 Target
pub struct Esp32;

impl Target for Esp32 {
    fn chip(&self) -> Chip {
        Chip::Esp32
    }

    fn blocks(&self) -> &'static [BlockDef] {
        &BLOCKS
    }

    fn fields(&self) -> &'static [FieldDef] {
        FIELDS
    }

    fn key_purposes(&self) -> &'static [KeyPurposeDef] {
        &[]
    }

    fn coding_scheme(&self, block: &BlockDef, block0: &[u8]) -> Result<CodingScheme, Error> {
        if block.index == 0 {
            return Ok(CodingScheme::None);
        }

        // CODING_SCHEME lives in bits 192..194 of BLOCK0
        match block0.get(24).map_or(0, |b| b & 0b11) {
            0 | 3 => Ok(CodingScheme::None),
            1 => Ok(CodingScheme::ThreeFourths),
            _ => Err(Error::UnsupportedCodingScheme {
                block: block.name.to_owned(),
                scheme: "Repeat".to_owned(),
            }),
        }
    }

    fn implied_purpose(&self, block_name: &str) -> Option<KeyPurposeDef> {
        // Only the alias selects the byte order, BLOCK1 and BLOCK2 are taken
        // as they are
        let def = match block_name.to_ascii_lowercase().as_str() {
            "flash_encryption" => FLASH_ENCRYPTION,
            "secure_boot_v1" => SECURE_BOOT_V1,
            "secure_boot_v2" => SECURE_BOOT_V2,
            _ => USER,
        };

        Some(def)
    }

    fn digest_block(&self) -> Option<&'static str> {
        Some("BLOCK2")
    }

    fn min_revision_for_secure_boot_v2(&self) -> Option<u32> {
        Some(300)
    }

    fn custom_mac_check(&self) -> Option<CustomMacCheck> {
        Some(CustomMacCheck {
            crc: "CUSTOM_MAC_CRC",
            version: "MAC_VERSION",
        })
    }

    fn check_read_protect(&self, name: &str, efuses: &Efuses) -> Result<(), Error> {
        let is_block2 = BLOCKS[2].matches(name);
        if !is_block2
            || efuses.field("ABS_DONE_0")?.get().as_u64() != 0
            || efuses.chip_revision() < 300
        {
            return Ok(());
        }

        if efuses.field("ABS_DONE_1")?.get().as_u64() != 0 {
            return Err(Error::MustBeReadable {
                name: "BLOCK2 (secure boot v2 is enabled)".to_owned(),
            });
        }

        warn!("If secure boot v2 is used, BLOCK2 must stay readable");
        Ok(())
    }
}
