//! Key purpose and protection rules
//!
//! eFuse protection only ever gets stricter: a key purpose can be assigned
//! while its field is writeable, and read or write protection, once burned,
//! stays for the lifetime of the chip. The functions here decide which bits a
//! burn must stage to move a block into the requested state, and refuse
//! transitions the hardware does not allow.

use log::{info, warn};

use crate::{
    efuse::{Efuses, FieldValue, Protection},
    error::{Error, ProtectionError},
    targets::{BlockDef, FieldDef, KeyPurposeDef},
};

/// Outcome of assigning a key purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurposeChange {
    /// The block already carried the purpose.
    Unchanged,
    /// The new purpose was staged.
    Staged,
    /// The chip has no purpose field, the purpose follows from the block.
    Implied,
}

/// Stage `purpose` for the key stored in `block`.
///
/// Nothing is staged when the transition is refused.
pub(crate) fn assign_purpose(
    efuses: &mut Efuses,
    block: &BlockDef,
    purpose: &KeyPurposeDef,
) -> Result<PurposeChange, Error> {
    let Some(field) = efuses.key_purpose_field(block) else {
        return Ok(PurposeChange::Implied);
    };
    let name = field.name();
    let current = field.get().as_u64();
    let writeable = field.is_writeable();
    let current_name = purpose_name(efuses, current);

    let Some(code) = purpose.code else {
        return Err(Error::UnknownKeyPurpose {
            chip: efuses.chip(),
            purpose: purpose.purpose.to_string(),
        });
    };

    if current == code as u64 {
        info!("'{name}' is already '{}'", purpose.purpose);
        if writeable {
            info!("Disabling write to '{name}'");
            efuses.field_mut(name)?.disable_write()?;
        }

        return Ok(PurposeChange::Unchanged);
    }

    if !writeable {
        return Err(ProtectionError::PurposeLocked {
            block: block.name.to_owned(),
            field: name.to_owned(),
            current: current_name,
            requested: purpose.purpose.to_string(),
        }
        .into());
    }

    info!("'{name}': '{current_name}' -> '{}'", purpose.purpose);
    let mut field = efuses.field_mut(name)?;
    field.save(&FieldValue::Uint(code as u64))?;
    info!("Disabling write to '{name}'");
    field.disable_write()?;

    Ok(PurposeChange::Staged)
}

fn purpose_name(efuses: &Efuses, code: u64) -> String {
    u8::try_from(code)
        .ok()
        .and_then(|code| efuses.target().key_purpose_by_code(code))
        .map_or_else(|| format!("UNKNOWN ({code})"), |p| p.purpose.to_string())
}

/// Stage the read protection of a whole block.
pub(crate) fn disable_block_read(efuses: &mut Efuses, block: &BlockDef) -> Result<bool, Error> {
    let bit = block
        .read_disable_bit
        .ok_or_else(|| ProtectionError::NoProtectionBit {
            name: block.name.to_owned(),
            kind: "read-disable",
        })?;

    efuses.stage_flag("RD_DIS", bit)
}

/// Stage the write protection of a whole block.
pub(crate) fn disable_block_write(efuses: &mut Efuses, block: &BlockDef) -> Result<bool, Error> {
    let bit = block
        .write_disable_bit
        .ok_or_else(|| ProtectionError::NoProtectionBit {
            name: block.name.to_owned(),
            kind: "write-disable",
        })?;

    efuses.stage_flag("WR_DIS", bit)
}

/// Something carrying its own protection bits
#[derive(Clone, Copy)]
enum Protectable {
    Field(&'static str),
    Block(&'static BlockDef),
}

fn resolve(efuses: &Efuses, name: &str) -> Result<Protectable, Error> {
    if let Ok(field) = efuses.field(name) {
        return Ok(Protectable::Field(field.name()));
    }

    efuses
        .target()
        .block(name)
        .map(Protectable::Block)
        .ok_or_else(|| Error::UnknownField(name.to_owned()))
}

/// Stage the read protection of the field or block `name`.
///
/// Returns `false` if it is already read-protected.
pub(crate) fn read_protect(efuses: &mut Efuses, name: &str) -> Result<bool, Error> {
    let (canonical, bit) = match resolve(efuses, name)? {
        Protectable::Field(field) => {
            let field = efuses.field(field)?;
            if !field.is_readable() {
                info!("{} is already read-protected", field.name());
                return Ok(false);
            }
            let block = efuses.block_by_index(field.def().block).def();
            (
                field.name(),
                field.def().read_disable_bit.or(block.read_disable_bit),
            )
        }
        Protectable::Block(block) => (block.name, block.read_disable_bit),
    };

    let shared = &*efuses;
    shared.target().check_read_protect(canonical, shared)?;
    check_key_block_readable(shared, canonical)?;

    let bit = bit.ok_or_else(|| ProtectionError::NoProtectionBit {
        name: canonical.to_owned(),
        kind: "read-disable",
    })?;
    if efuses.is_read_disabled(bit) {
        info!("{canonical} is already read-protected");
        return Ok(false);
    }

    let sharing = sharing_bit(efuses, bit, |f, b| f.read_disable_bit.or(b.read_disable_bit));
    info!(
        "Permanently read-disabling eFuse{} {}",
        if sharing.len() > 1 { "s" } else { "" },
        sharing.join(", ")
    );

    efuses.stage_flag("RD_DIS", bit)
}

/// Stage the write protection of the field or block `name`.
///
/// Returns `false` if it is already write-protected.
pub(crate) fn write_protect(efuses: &mut Efuses, name: &str) -> Result<bool, Error> {
    let (canonical, bit) = match resolve(efuses, name)? {
        Protectable::Field(field) => {
            let field = efuses.field(field)?;
            let block = efuses.block_by_index(field.def().block).def();
            (
                field.name(),
                field.def().write_disable_bit.or(block.write_disable_bit),
            )
        }
        Protectable::Block(block) => (block.name, block.write_disable_bit),
    };

    let bit = bit.ok_or_else(|| ProtectionError::NoProtectionBit {
        name: canonical.to_owned(),
        kind: "write-disable",
    })?;
    if efuses.is_write_disabled(bit) {
        info!("{canonical} is already write-protected");
        return Ok(false);
    }

    let sharing = sharing_bit(efuses, bit, |f, b| {
        f.write_disable_bit.or(b.write_disable_bit)
    });
    info!(
        "Permanently write-disabling eFuse{} {}",
        if sharing.len() > 1 { "s" } else { "" },
        sharing.join(", ")
    );

    efuses.stage_flag("WR_DIS", bit)
}

/// Burned protection of the field or block `name`.
pub(crate) fn protection_of(efuses: &Efuses, name: &str) -> Result<Protection, Error> {
    Ok(match resolve(efuses, name)? {
        Protectable::Field(field) => efuses.field(field)?.protection(),
        Protectable::Block(block) => efuses.protection(block),
    })
}

/// Key blocks whose purpose does not call for read protection must stay
/// readable, the consuming peripheral reads them through the data registers.
fn check_key_block_readable(efuses: &Efuses, name: &str) -> Result<(), Error> {
    let Some(block) = efuses.target().block(name) else {
        return Ok(());
    };
    let Some(field) = efuses.key_purpose_field(block) else {
        return Ok(());
    };

    let needs_protection = u8::try_from(field.get().as_u64())
        .ok()
        .and_then(|code| efuses.target().key_purpose_by_code(code))
        .is_some_and(|purpose| purpose.read_protect);
    if !needs_protection {
        return Err(Error::MustBeReadable {
            name: block.name.to_owned(),
        });
    }

    Ok(())
}

/// Names of all fields guarded by the same protection bit.
fn sharing_bit(
    efuses: &Efuses,
    bit: u8,
    select: impl Fn(&FieldDef, &BlockDef) -> Option<u8>,
) -> Vec<&'static str> {
    let target = efuses.target();
    let names = target
        .fields()
        .iter()
        .filter(|f| select(f, &target.blocks()[f.block as usize]) == Some(bit))
        .map(|f| f.name)
        .collect::<Vec<_>>();

    if names.is_empty() {
        warn!("No field is guarded by protection bit {bit}");
    }

    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::{Chip, KeyPurpose};

    fn purpose(efuses: &Efuses, purpose: KeyPurpose) -> &'static KeyPurposeDef {
        efuses.target().key_purpose(purpose).unwrap()
    }

    fn key_block(efuses: &Efuses, name: &str) -> &'static BlockDef {
        efuses.target().block(name).unwrap()
    }

    #[test]
    fn new_purpose_is_staged_and_locked() {
        let mut efuses = Efuses::new(Chip::Esp32c6, 0);
        let block = key_block(&efuses, "BLOCK_KEY0");
        let xts = purpose(&efuses, KeyPurpose::XtsAes128Key);

        let change = assign_purpose(&mut efuses, block, xts).unwrap();

        assert_eq!(change, PurposeChange::Staged);
        let field = efuses.field("KEY_PURPOSE_0").unwrap();
        assert_eq!(field.get_pending(), FieldValue::Uint(4));
        assert!(efuses.is_write_disable_pending(8));
    }

    #[test]
    fn same_purpose_is_left_alone() {
        let mut efuses = Efuses::new(Chip::Esp32c6, 0);
        let block = key_block(&efuses, "BLOCK_KEY1");
        let hmac = purpose(&efuses, KeyPurpose::HmacUp);

        assign_purpose(&mut efuses, block, hmac).unwrap();
        efuses.assume_burned();

        let change = assign_purpose(&mut efuses, block, hmac).unwrap();
        assert_eq!(change, PurposeChange::Unchanged);
        assert_eq!(efuses.dirty_blocks().count(), 0);
    }

    #[test]
    fn unlocked_same_purpose_gets_locked() {
        let mut efuses = Efuses::new(Chip::Esp32c3, 0);
        let block = key_block(&efuses, "BLOCK_KEY2");
        let user = purpose(&efuses, KeyPurpose::User);

        let change = assign_purpose(&mut efuses, block, user).unwrap();

        assert_eq!(change, PurposeChange::Unchanged);
        assert!(efuses.is_write_disable_pending(10));
    }

    #[test]
    fn locked_purpose_cannot_change() {
        let mut efuses = Efuses::new(Chip::Esp32s3, 0);
        let block = key_block(&efuses, "BLOCK_KEY3");
        let hmac = purpose(&efuses, KeyPurpose::HmacUp);
        let xts = purpose(&efuses, KeyPurpose::XtsAes128Key);

        assign_purpose(&mut efuses, block, hmac).unwrap();
        efuses.assume_burned();

        let before = efuses.block_by_index(0).pending().to_vec();
        let res = assign_purpose(&mut efuses, block, xts);

        assert!(matches!(
            res,
            Err(Error::ProtectionViolation(ProtectionError::PurposeLocked { ref current, .. }))
                if current == "HMAC_UP"
        ));
        assert_eq!(efuses.block_by_index(0).pending(), &before[..]);
    }

    #[test]
    fn esp32_purposes_are_implied() {
        let mut efuses = Efuses::new(Chip::Esp32, 0);
        let block = key_block(&efuses, "flash_encryption");
        let def = efuses.target().implied_purpose("flash_encryption").unwrap();

        let change = assign_purpose(&mut efuses, block, &def).unwrap();
        assert_eq!(change, PurposeChange::Implied);
        assert_eq!(efuses.dirty_blocks().count(), 0);
    }

    #[test]
    fn user_key_blocks_stay_readable() {
        let mut efuses = Efuses::new(Chip::Esp32c6, 0);
        let res = read_protect(&mut efuses, "BLOCK_KEY0");

        assert!(matches!(res, Err(Error::MustBeReadable { .. })));
    }

    #[test]
    fn read_protect_key_block() {
        let mut efuses = Efuses::new(Chip::Esp32c6, 0);
        efuses
            .field_mut("KEY_PURPOSE_4")
            .unwrap()
            .save(&FieldValue::Uint(5))
            .unwrap();
        efuses.assume_burned();

        assert!(read_protect(&mut efuses, "KEY4").unwrap());
        assert!(efuses.is_read_disable_pending(4));

        efuses.assume_burned();
        assert!(!read_protect(&mut efuses, "BLOCK_KEY4").unwrap());
    }

    #[test]
    fn write_protect_shared_bit() {
        let mut efuses = Efuses::new(Chip::Esp32c3, 0);

        assert!(write_protect(&mut efuses, "SECURE_VERSION").unwrap());
        assert!(efuses.is_write_disable_pending(18));
        // same bit, already staged
        assert!(!write_protect(&mut efuses, "DIS_DOWNLOAD_MODE").unwrap());

        efuses.assume_burned();
        assert!(!write_protect(&mut efuses, "SECURE_VERSION").unwrap());
        assert!(!efuses.field("DIS_DOWNLOAD_MODE").unwrap().is_writeable());
    }

    #[test]
    fn blocks_without_protection_bit() {
        let mut efuses = Efuses::new(Chip::Esp32c6, 0);
        let res = read_protect(&mut efuses, "BLOCK_MAC_SYS");

        assert!(matches!(
            res,
            Err(Error::ProtectionViolation(ProtectionError::NoProtectionBit { .. }))
        ));
    }

    #[test]
    fn esp32_secure_boot_v2_block_stays_readable() {
        let mut efuses = Efuses::new(Chip::Esp32, 300);
        efuses
            .field_mut("ABS_DONE_1")
            .unwrap()
            .save(&FieldValue::Bool(true))
            .unwrap();
        efuses.assume_burned();

        let res = read_protect(&mut efuses, "BLOCK2");
        assert!(matches!(res, Err(Error::MustBeReadable { .. })));

        // BLOCK1 has no such restriction
        assert!(read_protect(&mut efuses, "BLOCK1").unwrap());
    }
}
