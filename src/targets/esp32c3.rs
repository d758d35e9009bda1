use super::{
    rs_key_blocks, BlockDef, Chip, FieldCategory::*, FieldDef, FieldKind, KeyPurpose,
    KeyPurposeDef, Target,
};

static BLOCKS: [BlockDef; 11] = rs_key_blocks(6, 6);

static FIELDS: &[FieldDef] = &[
    FieldDef::new("WR_DIS", 0, 0, 32, Security),
    FieldDef::new("RD_DIS", 0, 32, 7, Security).wr_dis(0),
    FieldDef::new("DIS_USB_JTAG", 0, 41, 1, Security).wr_dis(2),
    FieldDef::new("DIS_FORCE_DOWNLOAD", 0, 44, 1, Security).wr_dis(2),
    FieldDef::new("SOFT_DIS_JTAG", 0, 48, 3, Security).wr_dis(31),
    FieldDef::new("DIS_PAD_JTAG", 0, 51, 1, Security).wr_dis(2),
    FieldDef::new("SPI_BOOT_CRYPT_CNT", 0, 82, 3, Security).wr_dis(4),
    FieldDef::new("KEY_PURPOSE_0", 0, 88, 4, Purpose).kind(FieldKind::KeyPurpose).wr_dis(8),
    FieldDef::new("KEY_PURPOSE_1", 0, 92, 4, Purpose).kind(FieldKind::KeyPurpose).wr_dis(9),
    FieldDef::new("KEY_PURPOSE_2", 0, 96, 4, Purpose).kind(FieldKind::KeyPurpose).wr_dis(10),
    FieldDef::new("KEY_PURPOSE_3", 0, 100, 4, Purpose).kind(FieldKind::KeyPurpose).wr_dis(11),
    FieldDef::new("KEY_PURPOSE_4", 0, 104, 4, Purpose).kind(FieldKind::KeyPurpose).wr_dis(12),
    FieldDef::new("KEY_PURPOSE_5", 0, 108, 4, Purpose).kind(FieldKind::KeyPurpose).wr_dis(13),
    FieldDef::new("SECURE_BOOT_EN", 0, 116, 1, Security).wr_dis(15),
    FieldDef::new("DIS_DOWNLOAD_MODE", 0, 128, 1, Security).wr_dis(18),
    FieldDef::new("SECURE_VERSION", 0, 142, 16, Config).wr_dis(18),
    FieldDef::new("MAC", 1, 0, 48, Identity).kind(FieldKind::Mac),
    FieldDef::new("WAFER_VERSION_MINOR_LO", 1, 114, 3, Identity),
    FieldDef::new("PKG_VERSION", 1, 117, 3, Identity),
    FieldDef::new("BLK_VERSION_MINOR", 1, 120, 3, Identity),
    FieldDef::new("K_RTC_LDO", 1, 141, 7, Calibration),
    FieldDef::new("K_DIG_LDO", 1, 148, 7, Calibration),
    FieldDef::new("WAFER_VERSION_MINOR_HI", 1, 183, 1, Identity),
    FieldDef::new("WAFER_VERSION_MAJOR", 1, 184, 2, Identity),
    FieldDef::new("OPTIONAL_UNIQUE_ID", 2, 0, 128, Identity),
    FieldDef::new("BLK_VERSION_MAJOR", 2, 128, 2, Identity),
    FieldDef::new("TEMP_CALIB", 2, 131, 9, Calibration),
    FieldDef::new("OCODE", 2, 140, 8, Calibration),
    FieldDef::new("BLOCK_USR_DATA", 3, 0, 192, User),
    FieldDef::new("CUSTOM_MAC", 3, 200, 48, Identity).kind(FieldKind::Mac),
    FieldDef::new("BLOCK_KEY0", 4, 0, 256, Key),
    FieldDef::new("BLOCK_KEY1", 5, 0, 256, Key),
    FieldDef::new("BLOCK_KEY2", 6, 0, 256, Key),
    FieldDef::new("BLOCK_KEY3", 7, 0, 256, Key),
    FieldDef::new("BLOCK_KEY4", 8, 0, 256, Key),
    FieldDef::new("BLOCK_KEY5", 9, 0, 256, Key),
    FieldDef::new("BLOCK_SYS_DATA2", 10, 0, 256, User),
];

static KEY_PURPOSES: &[KeyPurposeDef] = &[
    KeyPurposeDef::key(KeyPurpose::User, 0, false, false),
    KeyPurposeDef::key(KeyPurpose::Reserved, 1, false, false),
    KeyPurposeDef::key(KeyPurpose::XtsAes128Key, 4, true, true),
    KeyPurposeDef::key(KeyPurpose::HmacDownAll, 5, false, true),
    KeyPurposeDef::key(KeyPurpose::HmacDownJtag, 6, false, true),
    KeyPurposeDef::key(KeyPurpose::HmacDownDigitalSignature, 7, false, true),
    KeyPurposeDef::key(KeyPurpose::HmacUp, 8, false, true),
    KeyPurposeDef::digest(KeyPurpose::SecureBootDigest0, 9),
    KeyPurposeDef::digest(KeyPurpose::SecureBootDigest1, 10),
    KeyPurposeDef::digest(KeyPurpose::SecureBootDigest2, 11),
];

/// ESP32-C3 Target
pub struct Esp32c3;

impl Target for Esp32c3 {
    fn chip(&self) -> Chip {
        Chip::Esp32c3
    }

    fn blocks(&self) -> &'static [BlockDef] {
        &BLOCKS
    }

    fn fields(&self) -> &'static [FieldDef] {
        FIELDS
    }

    fn key_purposes(&self) -> &'static [KeyPurposeDef] {
        KEY_PURPOSES
    }
}
