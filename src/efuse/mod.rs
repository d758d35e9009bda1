//! Runtime eFuse state
//!
//! [Efuses] holds the decoded contents of every block of one device, both as
//! last read from the hardware and as staged for the next commit. Fields are
//! accessed by name through [Field] and [FieldMut] views.

use std::fmt::Write as _;

use log::debug;

pub use self::{
    block::{Block, Protection},
    field::{Field, FieldMut, FieldValue},
};
use crate::{
    coding::CodingScheme,
    error::{Error, ProtectionError},
    targets::{BlockDef, Chip, FieldCategory, FieldKind, Target},
    transport::Transport,
};

mod block;
mod field;

/// Staged contents of every block, used to undo a failed operation
#[derive(Debug, Clone)]
pub(crate) struct Checkpoint(Vec<Vec<u8>>);

/// All eFuses of one device
pub struct Efuses {
    target: Box<dyn Target>,
    blocks: Vec<Block>,
    chip_revision: u32,
    pub(crate) force_write_always: bool,
}

impl Efuses {
    /// eFuses of a blank chip, nothing burned.
    pub fn new(chip: Chip, chip_revision: u32) -> Self {
        let target = chip.into_target();
        let blocks = target
            .blocks()
            .iter()
            .map(|def| Block::new(def, def.coding))
            .collect();

        Self {
            target,
            blocks,
            chip_revision,
            force_write_always: false,
        }
    }

    /// Read all blocks of the device behind `transport`.
    pub fn read<T>(chip: Chip, transport: &mut T) -> Result<Self, Error>
    where
        T: Transport + ?Sized,
    {
        let mut efuses = Self::new(chip, 0);
        efuses.update(transport)?;

        Ok(efuses)
    }

    /// Re-read all blocks, discarding anything staged.
    pub fn update<T>(&mut self, transport: &mut T) -> Result<(), Error>
    where
        T: Transport + ?Sized,
    {
        self.chip_revision = transport.chip_revision()?;

        // BLOCK0 decides the coding scheme of the other blocks on some chips
        let block0 = transport.read_block(0)?;
        self.blocks[0].load(&block0, CodingScheme::None)?;

        for idx in 1..self.blocks.len() {
            let def = self.blocks[idx].def();
            let scheme = self.target.coding_scheme(def, self.blocks[0].burned())?;
            let data = transport.read_block(def.index)?;
            self.blocks[idx].load(&data, scheme)?;
        }

        debug!(
            "Read {} blocks, chip revision v{}.{}",
            self.blocks.len(),
            self.chip_revision / 100,
            self.chip_revision % 100
        );

        Ok(())
    }

    pub fn target(&self) -> &dyn Target {
        self.target.as_ref()
    }

    pub fn chip(&self) -> Chip {
        self.target.chip()
    }

    /// Chip revision as `major * 100 + minor`.
    pub fn chip_revision(&self) -> u32 {
        self.chip_revision
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Look up a block by name or alias.
    pub fn block(&self, name: &str) -> Result<&Block, Error> {
        let def = self.block_def(name)?;
        Ok(self.block_by_index(def.index))
    }

    pub(crate) fn block_def(&self, name: &str) -> Result<&'static BlockDef, Error> {
        self.target
            .block(name)
            .ok_or_else(|| Error::UnknownBlock(name.to_owned()))
    }

    pub fn block_by_index(&self, index: u8) -> &Block {
        &self.blocks[index as usize]
    }

    pub(crate) fn block_by_index_mut(&mut self, index: u8) -> &mut Block {
        &mut self.blocks[index as usize]
    }

    pub(crate) fn block_bit_len(&self, index: u8) -> usize {
        self.block_by_index(index).bit_len()
    }

    pub fn field(&self, name: &str) -> Result<Field<'_>, Error> {
        let def = self
            .target
            .field(name)
            .ok_or_else(|| Error::UnknownField(name.to_owned()))?;

        Ok(Field { def, efuses: self })
    }

    pub fn field_mut(&mut self, name: &str) -> Result<FieldMut<'_>, Error> {
        let def = self
            .target
            .field(name)
            .ok_or_else(|| Error::UnknownField(name.to_owned()))?;

        Ok(FieldMut { def, efuses: self })
    }

    /// Key-purpose field of a key block, if the chip has one.
    pub fn key_purpose_field(&self, block: &BlockDef) -> Option<Field<'_>> {
        block
            .key_purpose
            .and_then(|name| self.field(name).ok())
    }

    /// Protection of a block as burned.
    pub fn protection(&self, block: &BlockDef) -> Protection {
        let mut protection = Protection::empty();

        if let Some(bit) = block.read_disable_bit {
            protection.set(Protection::READ, self.is_read_disabled(bit));
        }
        if let Some(bit) = block.write_disable_bit {
            protection.set(Protection::WRITE, self.is_write_disabled(bit));
        }

        protection
    }

    pub fn is_read_disabled(&self, bit: u8) -> bool {
        self.flag("RD_DIS", bit, false)
    }

    pub fn is_write_disabled(&self, bit: u8) -> bool {
        self.flag("WR_DIS", bit, false)
    }

    /// The protection bit is burned or staged.
    pub fn is_read_disable_pending(&self, bit: u8) -> bool {
        self.flag("RD_DIS", bit, true)
    }

    pub fn is_write_disable_pending(&self, bit: u8) -> bool {
        self.flag("WR_DIS", bit, true)
    }

    fn flag(&self, field: &str, bit: u8, pending: bool) -> bool {
        let Some(def) = self.target.field(field) else {
            return false;
        };
        let range = def.bit_range();
        let pos = range.start + bit as usize;
        if pos >= range.end {
            return false;
        }

        let block = self.block_by_index(def.block);
        let bits = if pending {
            block.pending_bits(pos..pos + 1)
        } else {
            block.burned_bits(pos..pos + 1)
        };

        bits[0] != 0
    }

    /// Stage a single bit of the `RD_DIS` or `WR_DIS` field.
    pub(crate) fn stage_flag(&mut self, field: &str, bit: u8) -> Result<bool, Error> {
        let def = self
            .target
            .field(field)
            .ok_or_else(|| Error::UnknownField(field.to_owned()))?;
        let pos = def.bit_start as usize + bit as usize;

        // RD_DIS can be write-protected itself
        if !self.flag(def.name, bit, true)
            && !self.field(def.name)?.is_writeable()
            && !self.force_write_always
        {
            return Err(ProtectionError::WriteProtected {
                name: def.name.to_owned(),
            }
            .into());
        }

        let changed = self
            .block_by_index_mut(def.block)
            .stage(def.name, pos..pos + 1, &[1])?;
        if changed {
            debug!("Staged {}[{bit}]", def.name);
        }

        Ok(changed)
    }

    /// Blocks with staged changes, in index order.
    pub fn dirty_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.is_dirty())
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.blocks.iter().map(|b| b.pending().to_vec()).collect())
    }

    pub(crate) fn rollback(&mut self, checkpoint: Checkpoint) {
        for (block, pending) in self.blocks.iter_mut().zip(checkpoint.0) {
            block.set_pending(pending);
        }
    }

    /// Drop everything staged.
    pub fn discard_pending(&mut self) {
        for block in &mut self.blocks {
            block.discard_pending();
        }
    }

    /// Pretend everything staged was burned.
    #[cfg(test)]
    pub(crate) fn assume_burned(&mut self) {
        for block in &mut self.blocks {
            block.assume_burned();
        }
    }

    /// Raw contents of every block, one line per block.
    pub fn dump(&self) -> String {
        let mut out = String::new();

        for block in &self.blocks {
            let alias = block.def().aliases.first().copied().unwrap_or(block.name());
            let _ = write!(out, "{:<16} ({alias:<16}) [{:<2}]", block.name(), block.index());
            if !self.protection(block.def()).contains(Protection::READ) {
                let _ = write!(out, " read_regs:");
                for word in block.burned().chunks(4) {
                    let mut bytes = [0u8; 4];
                    bytes[..word.len()].copy_from_slice(word);
                    let _ = write!(out, " {:08x}", u32::from_le_bytes(bytes));
                }
            } else {
                let _ = write!(out, " read-protected");
            }
            out.push('\n');
        }

        out
    }

    /// Decoded value of every field, grouped by category.
    ///
    /// Key material is only shown with `show_sensitive_info`.
    pub fn summary(&self, show_sensitive_info: bool) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} (revision v{}.{})",
            self.chip(),
            self.chip_revision / 100,
            self.chip_revision % 100
        );

        for category in [
            FieldCategory::Config,
            FieldCategory::Security,
            FieldCategory::Identity,
            FieldCategory::Purpose,
            FieldCategory::Key,
            FieldCategory::User,
            FieldCategory::Calibration,
        ] {
            let fields = self
                .target
                .fields()
                .iter()
                .filter(|f| f.category == category)
                .collect::<Vec<_>>();
            if fields.is_empty() {
                continue;
            }

            let _ = writeln!(out, "\n{category} fuses:");
            for def in fields {
                let field = Field { def, efuses: self };
                let rw = format!(
                    "{}/{}",
                    if field.is_readable() { "R" } else { "-" },
                    if field.is_writeable() { "W" } else { "-" }
                );
                let _ = writeln!(
                    out,
                    "{:<32} = {} {rw}",
                    def.name,
                    self.describe(&field, show_sensitive_info)
                );
            }
        }

        out
    }

    fn describe(&self, field: &Field<'_>, show_sensitive_info: bool) -> String {
        let def = field.def();
        if !field.is_readable() {
            return "?? (read-protected)".to_owned();
        }
        if def.category == FieldCategory::Key && !show_sensitive_info {
            return "(hidden)".to_owned();
        }

        let value = field.get();
        match def.kind {
            FieldKind::KeyPurpose => {
                let code = value.as_u64();
                match u8::try_from(code)
                    .ok()
                    .and_then(|code| self.target.key_purpose_by_code(code))
                {
                    Some(purpose) => format!("{} ({code})", purpose.purpose),
                    None => format!("UNKNOWN ({code})"),
                }
            }
            FieldKind::Mac => field
                .get_raw()
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(":"),
            _ => value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::VirtualTransport;

    #[test]
    fn blank_chip() {
        let efuses = Efuses::new(Chip::Esp32c6, 0);

        assert_eq!(efuses.blocks().len(), 11);
        assert_eq!(efuses.block("KEY0").unwrap().index(), 4);
        assert!(efuses.block("BLOCK_KEY6").is_err());
        assert_eq!(efuses.field("KEY_PURPOSE_0").unwrap().get(), FieldValue::Uint(0));
        assert!(efuses.field("KEY_PURPOSE_0").unwrap().is_writeable());
        assert!(matches!(efuses.field("NOPE"), Err(Error::UnknownField(_))));
        assert_eq!(efuses.dirty_blocks().count(), 0);
    }

    #[test]
    fn saved_values_are_staged_only() {
        let mut efuses = Efuses::new(Chip::Esp32c6, 0);
        let changed = efuses
            .field_mut("KEY_PURPOSE_1")
            .unwrap()
            .save(&FieldValue::Uint(4))
            .unwrap();

        assert!(changed);
        let field = efuses.field("KEY_PURPOSE_1").unwrap();
        assert_eq!(field.get(), FieldValue::Uint(0));
        assert_eq!(field.get_pending(), FieldValue::Uint(4));
        // bits 92..96 of BLOCK0
        assert_eq!(efuses.block_by_index(0).pending()[11], 0x40);
    }

    #[test]
    fn calibration_fields_are_read_only() {
        let mut efuses = Efuses::new(Chip::Esp32s3, 0);
        let res = efuses.field_mut("K_RTC_LDO").unwrap().save(&FieldValue::Uint(3));

        assert!(matches!(
            res,
            Err(Error::ProtectionViolation(ProtectionError::ReadOnly { .. }))
        ));
    }

    #[test]
    fn protection_follows_burned_flags() {
        let mut efuses = Efuses::new(Chip::Esp32c3, 0);
        efuses.field_mut("BLOCK_KEY0").unwrap().disable_write().unwrap();
        efuses.field_mut("BLOCK_KEY0").unwrap().disable_read().unwrap();

        // staged, not burned yet
        let key0 = efuses.block("BLOCK_KEY0").unwrap().def();
        assert!(efuses.protection(key0).is_empty());
        assert!(efuses.is_write_disable_pending(23));
        assert!(efuses.is_read_disable_pending(0));

        let mut transport = VirtualTransport::new(Chip::Esp32c3, 0);
        efuses.flush_to(&mut transport);
        efuses.update(&mut transport).unwrap();

        assert_eq!(efuses.protection(key0), Protection::READ | Protection::WRITE);
        let field = efuses.field("BLOCK_KEY0").unwrap();
        assert!(!field.is_readable());
        assert!(!field.is_writeable());
    }

    #[test]
    fn write_protected_fields_are_refused() {
        let mut transport = VirtualTransport::new(Chip::Esp32c3, 0);
        let mut efuses = Efuses::read(Chip::Esp32c3, &mut transport).unwrap();
        efuses.field_mut("KEY_PURPOSE_2").unwrap().disable_write().unwrap();
        efuses.flush_to(&mut transport);
        efuses.update(&mut transport).unwrap();

        let res = efuses
            .field_mut("KEY_PURPOSE_2")
            .unwrap()
            .save(&FieldValue::Uint(5));
        assert!(matches!(
            res,
            Err(Error::ProtectionViolation(ProtectionError::WriteProtected { .. }))
        ));

        // unchanged values are fine
        assert!(!efuses
            .field_mut("KEY_PURPOSE_2")
            .unwrap()
            .save(&FieldValue::Uint(0))
            .unwrap());
    }

    #[test]
    fn rollback_restores_pending_state() {
        let mut efuses = Efuses::new(Chip::Esp32h2, 0);
        let checkpoint = efuses.checkpoint();

        efuses
            .field_mut("SECURE_VERSION")
            .unwrap()
            .save(&FieldValue::Uint(7))
            .unwrap();
        assert_eq!(efuses.dirty_blocks().count(), 1);

        efuses.rollback(checkpoint);
        assert_eq!(efuses.dirty_blocks().count(), 0);
    }

    #[test]
    fn summary_hides_keys() {
        let mut efuses = Efuses::new(Chip::Esp32c6, 0);
        efuses
            .field_mut("KEY_PURPOSE_0")
            .unwrap()
            .save(&FieldValue::Uint(4))
            .unwrap();

        let summary = efuses.summary(false);
        assert!(summary.contains("(hidden)"));
        assert!(summary.contains("KEY_PURPOSE_0"));

        let dump = efuses.dump();
        assert_eq!(dump.lines().count(), 11);
        assert!(dump.starts_with("BLOCK0"));
    }

    impl Efuses {
        /// Write the pending contents straight to `transport`.
        fn flush_to(&self, transport: &mut VirtualTransport) {
            for block in self.dirty_blocks() {
                let data = block.encode_pending().unwrap();
                transport.write_block(block.index(), &data).unwrap();
            }
        }
    }
}
