//! Staging and committing eFuse burns
//!
//! A [Burner] owns the [Efuses] of one device together with the [Transport]
//! used to reach it. Every operation first stages its changes in memory and
//! checks them, and only then burns all touched blocks in a single commit.
//! Anything that fails before the commit leaves the device untouched and the
//! staged state as it was before the operation.

use std::collections::HashSet;

use log::{debug, info, warn};

use crate::{
    coding::CodingScheme,
    digest::pad_left,
    efuse::{Efuses, FieldValue, Protection},
    error::{Error, ProtectionError, ResultExt},
    protect,
    targets::{BlockDef, Chip, KeyPurpose, KeyPurposeDef, PurposeClass, WideKey},
    transport::Transport,
};

/// Flags of the key burn operations
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BurnOptions {
    /// Leave the key block writeable.
    pub no_write_protect: bool,
    /// Leave the key block readable, even if its purpose asks for read
    /// protection.
    pub no_read_protect: bool,
    /// Log key material.
    pub show_sensitive_info: bool,
    /// Burn blocks even if they are write-protected.
    pub force_write_always: bool,
}

/// Keys burned together by one operation
#[derive(Debug, Default, Clone)]
pub struct BurnBatch {
    blocks: Vec<String>,
    payloads: Vec<Vec<u8>>,
    purposes: Vec<KeyPurpose>,
}

impl BurnBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect a batch from argument slots.
    ///
    /// Each list ends at its first unset slot.
    pub fn from_lists(
        blocks: impl IntoIterator<Item = Option<String>>,
        payloads: impl IntoIterator<Item = Option<Vec<u8>>>,
        purposes: impl IntoIterator<Item = Option<KeyPurpose>>,
    ) -> Self {
        Self {
            blocks: blocks.into_iter().map_while(|b| b).collect(),
            payloads: payloads.into_iter().map_while(|p| p).collect(),
            purposes: purposes.into_iter().map_while(|p| p).collect(),
        }
    }

    /// Add a key, `purpose` is left out on chips without key-purpose fields.
    pub fn key(
        mut self,
        block: impl Into<String>,
        payload: Vec<u8>,
        purpose: Option<KeyPurpose>,
    ) -> Self {
        self.blocks.push(block.into());
        self.payloads.push(payload);
        self.purposes.extend(purpose);
        self
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    fn count_mismatch(&self) -> Error {
        Error::CountMismatch {
            blocks: self.blocks.len(),
            payloads: self.payloads.len(),
            purposes: self.purposes.len(),
        }
    }
}

/// Result of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BurnOutcome {
    /// Every eFuse already held the requested value.
    Unchanged,
    /// The listed blocks are staged, waiting for the end of the batch or
    /// because the transport is a dry run.
    Staged(Vec<&'static str>),
    /// The listed blocks were burned and read back.
    Burned(Vec<&'static str>),
}

/// One key block, ready to be staged
#[derive(Debug)]
struct KeyWrite {
    block: &'static BlockDef,
    payload: Vec<u8>,
    purpose: KeyPurposeDef,
}

/// Burn engine for one device
pub struct Burner<T> {
    transport: T,
    efuses: Efuses,
    batch_depth: usize,
    /// Protections to read back once the open batch is burned.
    protection_checks: Vec<(String, Protection)>,
}

impl<T> Burner<T>
where
    T: Transport,
{
    /// Read the eFuses of `chip` through `transport`.
    pub fn new(chip: Chip, mut transport: T) -> Result<Self, Error> {
        let efuses = Efuses::read(chip, &mut transport)?;

        Ok(Self {
            transport,
            efuses,
            batch_depth: 0,
            protection_checks: Vec::new(),
        })
    }

    pub fn efuses(&self) -> &Efuses {
        &self.efuses
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Burn write-protected blocks and fields anyway, for the rest of the
    /// session.
    pub fn set_force_write_always(&mut self, force: bool) {
        if force {
            warn!("Write protection is ignored, burns may have no effect");
        }
        self.efuses.force_write_always = force;
    }

    /// Re-read every block, dropping everything staged.
    ///
    /// Needed after [Error::Burning], when the device state is unknown.
    pub fn reload(&mut self) -> Result<(), Error> {
        self.protection_checks.clear();
        self.efuses.update(&mut self.transport)
    }

    /// Drop everything staged.
    pub fn discard_pending(&mut self) {
        self.protection_checks.clear();
        self.efuses.discard_pending();
    }

    /// Only stage from now on, until the matching [Burner::end_batch].
    ///
    /// Batches nest, only the outermost one commits.
    pub fn begin_batch(&mut self) {
        self.batch_depth += 1;
        debug!("Batch mode, depth {}", self.batch_depth);
    }

    /// Close a batch, committing everything if it was the outermost one.
    pub fn end_batch(&mut self) -> Result<BurnOutcome, Error> {
        self.batch_depth = self.batch_depth.saturating_sub(1);
        self.commit()
    }

    pub fn in_batch(&self) -> bool {
        self.batch_depth > 0
    }

    /// Burn everything staged, unless a batch is open.
    pub fn commit(&mut self) -> Result<BurnOutcome, Error> {
        self.burn(false)
    }

    /// Burn everything staged, even inside a batch.
    pub fn flush(&mut self) -> Result<BurnOutcome, Error> {
        self.burn(true)
    }

    /// Burn keys to key blocks, assigning their purposes and protecting the
    /// blocks.
    pub fn burn_key(
        &mut self,
        batch: &BurnBatch,
        options: BurnOptions,
    ) -> Result<BurnOutcome, Error> {
        let keys = self.plan_keys(batch, false)?;
        self.burn_keys(&keys, options)
    }

    /// Burn secure boot public key digests.
    pub fn burn_key_digest(
        &mut self,
        batch: &BurnBatch,
        options: BurnOptions,
    ) -> Result<BurnOutcome, Error> {
        let keys = if self.efuses.target().key_purposes().is_empty() {
            self.plan_legacy_digest(batch)?
        } else {
            self.plan_keys(batch, true)?
        };
        self.burn_keys(&keys, options)
    }

    /// Stage a key without committing.
    pub fn stage_key_write(
        &mut self,
        block: &str,
        payload: &[u8],
        purpose: Option<KeyPurpose>,
        options: BurnOptions,
    ) -> Result<(), Error> {
        let batch = BurnBatch::new().key(block, payload.to_vec(), purpose);
        let keys = self.plan_keys(&batch, false)?;
        self.stage_all(&keys, options)
    }

    /// Stage a secure boot digest without committing.
    pub fn stage_digest_write(
        &mut self,
        block: &str,
        digest: &[u8],
        purpose: Option<KeyPurpose>,
    ) -> Result<(), Error> {
        let batch = BurnBatch::new().key(block, digest.to_vec(), purpose);
        let keys = if self.efuses.target().key_purposes().is_empty() {
            self.plan_legacy_digest(&batch)?
        } else {
            self.plan_keys(&batch, true)?
        };
        self.stage_all(&keys, BurnOptions::default())
    }

    /// Burn named fields.
    pub fn burn_efuse(&mut self, values: &[(String, FieldValue)]) -> Result<BurnOutcome, Error> {
        check_duplicates(values.iter().map(|(name, _)| name.as_str()))?;
        let mut canonical = Vec::with_capacity(values.len());
        for (name, _) in values {
            canonical.push(self.efuses.field(name)?.name());
        }
        check_duplicates(canonical)?;

        self.apply(|efuses| {
            for (name, value) in values {
                let mut field = efuses.field_mut(name)?;
                let old = field.as_field().get();
                let name = field.as_field().name();
                if field.save(value)? {
                    info!("'{name}' {old} -> {value}");
                } else {
                    info!("'{name}' already holds {value}");
                }
            }
            Ok(())
        })
    }

    /// Read-protect fields or blocks.
    pub fn read_protect_efuse(&mut self, names: &[String]) -> Result<BurnOutcome, Error> {
        check_duplicates(names.iter().map(String::as_str))?;

        let outcome = self.apply(|efuses| {
            for name in names {
                protect::read_protect(efuses, name)?;
            }
            Ok(())
        })?;

        self.verify_protection(&outcome, names, Protection::READ)?;
        Ok(outcome)
    }

    /// Write-protect fields or blocks.
    pub fn write_protect_efuse(&mut self, names: &[String]) -> Result<BurnOutcome, Error> {
        check_duplicates(names.iter().map(String::as_str))?;

        let outcome = self.apply(|efuses| {
            for name in names {
                protect::write_protect(efuses, name)?;
            }
            Ok(())
        })?;

        self.verify_protection(&outcome, names, Protection::WRITE)?;
        Ok(outcome)
    }

    /// Burn raw data to whole blocks.
    ///
    /// With a non-zero `offset`, which only works for a single block, the
    /// data starts `offset` bytes into the block.
    pub fn burn_block_data(
        &mut self,
        data: &[(String, Vec<u8>)],
        offset: usize,
    ) -> Result<BurnOutcome, Error> {
        check_duplicates(data.iter().map(|(name, _)| name.as_str()))?;
        if offset > 0 && data.len() > 1 {
            return Err(Error::OffsetWithManyBlocks);
        }

        let mut canonical = Vec::with_capacity(data.len());
        for (name, _) in data {
            canonical.push(self.efuses.block_def(name)?.name);
        }
        check_duplicates(canonical)?;

        self.apply(|efuses| {
            for (name, bytes) in data {
                let def = efuses.block_def(name)?;
                let block = efuses.block_by_index(def.index);
                let len = block.len();
                if offset >= len {
                    return Err(Error::InvalidOffset {
                        block: def.name.to_owned(),
                        offset,
                        len,
                    });
                }
                if offset + bytes.len() > len {
                    return Err(Error::SizeMismatch {
                        name: def.name.to_owned(),
                        expected: len - offset,
                        actual: bytes.len(),
                    });
                }

                // burned bits stay set, the data only adds to them
                let mut padded = block.pending().to_vec();
                for (dst, src) in padded[offset..].iter_mut().zip(bytes) {
                    *dst |= src;
                }

                info!(
                    "Writing {} byte(s) to {} at offset {offset}",
                    bytes.len(),
                    def.name
                );
                efuses.block_by_index_mut(def.index).stage_data(&padded)?;
            }
            Ok(())
        })
    }

    /// Set individual bits of a block.
    pub fn burn_bit(&mut self, block: &str, bits: &[usize]) -> Result<BurnOutcome, Error> {
        self.apply(|efuses| {
            let def = efuses.block_def(block)?;
            let block = efuses.block_by_index_mut(def.index);
            let bit_len = block.bit_len();

            for &bit in bits {
                if bit >= bit_len {
                    return Err(Error::InvalidBit {
                        block: def.name.to_owned(),
                        bit,
                        max: bit_len.saturating_sub(1),
                    });
                }
                block.stage(def.name, bit..bit + 1, &[1])?;
            }
            info!("Setting bit(s) {bits:?} of {}", def.name);

            Ok(())
        })
    }

    /// Burn a custom MAC address.
    pub fn burn_custom_mac(&mut self, mac: [u8; 6]) -> Result<BurnOutcome, Error> {
        self.apply(|efuses| {
            info!("Custom MAC: {}", format_mac(&mac));
            efuses
                .field_mut("CUSTOM_MAC")?
                .save(&FieldValue::Bytes(mac.to_vec()))?;

            if let Some(check) = efuses.target().custom_mac_check() {
                let crc = mac_crc8(&mac);
                debug!("Custom MAC CRC: {crc:#04x}");
                efuses
                    .field_mut(check.crc)?
                    .save(&FieldValue::Uint(crc as u64))?;
                efuses
                    .field_mut(check.version)?
                    .save(&FieldValue::Uint(1))?;
            }

            Ok(())
        })
    }

    /// Report blocks with coding errors.
    ///
    /// With `recovery`, the corrected contents of those blocks are burned
    /// again, which fixes bits that failed to burn.
    pub fn check_error(&mut self, recovery: bool) -> Result<(), Error> {
        let failing = self.failing_blocks();
        if failing.is_empty() {
            info!("No errors detected");
            return Ok(());
        }

        for def in &failing {
            let block = self.efuses.block_by_index(def.index);
            warn!(
                "{}: corrected {} byte(s), uncorrectable: {}",
                def.name,
                block.corrected(),
                block.failed()
            );
        }

        if recovery {
            self.recover(&failing)?;
        }

        let failing = self.failing_blocks();
        if failing.is_empty() {
            info!("No errors detected");
            return Ok(());
        }

        Err(Error::EfuseErrors(
            failing
                .iter()
                .map(|def| def.name)
                .collect::<Vec<_>>()
                .join(", "),
        ))
    }

    /// Raw contents of every block.
    pub fn dump(&self) -> String {
        self.efuses.dump()
    }

    /// Decoded value of every field.
    pub fn summary(&self, show_sensitive_info: bool) -> String {
        self.efuses.summary(show_sensitive_info)
    }

    fn failing_blocks(&self) -> Vec<&'static BlockDef> {
        self.efuses
            .blocks()
            .iter()
            .filter(|b| b.has_errors())
            .map(|b| b.def())
            .collect()
    }

    fn recover(&mut self, failing: &[&'static BlockDef]) -> Result<(), Error> {
        if self.transport.is_dry_run() {
            warn!("Dry run, the blocks are not burned again");
            return Ok(());
        }

        let names = failing.iter().map(|def| def.name).collect::<Vec<_>>();
        for def in failing.iter().rev() {
            let block = self.efuses.block_by_index(def.index);
            if block.is_empty() {
                continue;
            }

            let data = block.encode_burned()?;
            info!("Burning {} again", def.name);
            self.transport
                .write_block(def.index, &data)
                .map_err(Error::from)
                .burning(&names)?;
        }

        self.transport
            .reset()
            .map_err(Error::from)
            .burning(&names)?;
        self.efuses.update(&mut self.transport).burning(&names)
    }

    fn burn_keys(&mut self, keys: &[KeyWrite], options: BurnOptions) -> Result<BurnOutcome, Error> {
        if options.force_write_always {
            self.set_force_write_always(true);
        }

        self.apply(|efuses| stage_keys(efuses, keys, options))
    }

    fn stage_all(&mut self, keys: &[KeyWrite], options: BurnOptions) -> Result<(), Error> {
        if options.force_write_always {
            self.set_force_write_always(true);
        }

        let checkpoint = self.efuses.checkpoint();
        stage_keys(&mut self.efuses, keys, options).inspect_err(|_| {
            self.efuses.rollback(checkpoint);
        })
    }

    /// Stage with `stage`, then commit.
    ///
    /// The staging is undone unless the device was written to.
    fn apply<F>(&mut self, stage: F) -> Result<BurnOutcome, Error>
    where
        F: FnOnce(&mut Efuses) -> Result<(), Error>,
    {
        let checkpoint = self.efuses.checkpoint();

        let res = stage(&mut self.efuses).and_then(|()| self.commit());
        match res {
            Err(err) if !matches!(err, Error::Burning { .. } | Error::VerifyFailed { .. }) => {
                self.efuses.rollback(checkpoint);
                Err(err)
            }
            res => res,
        }
    }

    /// Checks of [Burner::burn_key] and [Burner::burn_key_digest], before
    /// anything is staged.
    fn plan_keys(&self, batch: &BurnBatch, digests: bool) -> Result<Vec<KeyWrite>, Error> {
        let target = self.efuses.target();
        let implied = target.key_purposes().is_empty();

        check_duplicates(batch.blocks.iter().map(String::as_str))?;

        let purposes_given = batch.purposes.len() == batch.blocks.len()
            || (implied && batch.purposes.is_empty());
        if batch.payloads.len() != batch.blocks.len() || !purposes_given {
            return Err(batch.count_mismatch());
        }

        let mut keys = Vec::with_capacity(batch.len());
        for (idx, name) in batch.blocks.iter().enumerate() {
            let block = self.efuses.block_def(name)?;

            let purpose = if implied {
                if block.index == 0 {
                    return Err(Error::InvalidKeyBlock(block.name.to_owned()));
                }
                target
                    .implied_purpose(name)
                    .ok_or_else(|| Error::InvalidKeyBlock(block.name.to_owned()))?
            } else {
                if block.key_purpose.is_none() {
                    return Err(Error::InvalidKeyBlock(block.name.to_owned()));
                }
                let requested = batch.purposes[idx];
                *target
                    .key_purpose(requested)
                    .ok_or_else(|| Error::UnknownKeyPurpose {
                        chip: target.chip(),
                        purpose: requested.to_string(),
                    })?
            };

            if digests && purpose.class != PurposeClass::Digest {
                return Err(Error::NotADigestPurpose(purpose.purpose.to_string()));
            }

            keys.push(KeyWrite {
                block,
                payload: batch.payloads[idx].clone(),
                purpose,
            });
        }

        // aliases can name the same block twice
        check_duplicates(keys.iter().map(|k| k.block.name))?;

        if let Some(wide) = target.wide_key() {
            keys = self.split_wide_keys(keys, wide)?;
        }

        for key in &mut keys {
            let block = self.efuses.block_by_index(key.block.index);
            if !block.scheme().is_full_width() {
                return Err(Error::UnsupportedCodingScheme {
                    block: block.name().to_owned(),
                    scheme: block.scheme().to_string(),
                });
            }

            if key.purpose.purpose == KeyPurpose::EcdsaKey {
                key.payload = pad_left(std::mem::take(&mut key.payload), block.len());
            }
            if key.payload.len() != block.len() {
                return Err(Error::SizeMismatch {
                    name: block.name().to_owned(),
                    expected: block.len(),
                    actual: key.payload.len(),
                });
            }

            if key.purpose.reverse {
                key.payload.reverse();
            }
        }

        Ok(keys)
    }

    /// Digest burns on chips without key-purpose fields, which keep the
    /// digest in a dedicated block.
    fn plan_legacy_digest(&self, batch: &BurnBatch) -> Result<Vec<KeyWrite>, Error> {
        let target = self.efuses.target();
        let digest_block = target
            .digest_block()
            .ok_or_else(|| Error::UnknownKeyPurpose {
                chip: target.chip(),
                purpose: KeyPurpose::SecureBootV2.to_string(),
            })?;
        let def = self.efuses.block_def(digest_block)?;

        check_duplicates(batch.blocks.iter().map(String::as_str))?;
        if batch.payloads.len() != batch.blocks.len() || !batch.purposes.is_empty() {
            return Err(batch.count_mismatch());
        }
        for name in &batch.blocks {
            if self.efuses.block_def(name)?.index != def.index {
                return Err(Error::InvalidKeyBlock(name.to_owned()));
            }
        }
        check_duplicates(batch.blocks.iter().map(|_| def.name))?;

        let block = self.efuses.block_by_index(def.index);
        if block.scheme() != CodingScheme::None {
            return Err(Error::UnsupportedCodingScheme {
                block: def.name.to_owned(),
                scheme: block.scheme().to_string(),
            });
        }

        if let Some(required) = target.min_revision_for_secure_boot_v2() {
            let found = self.efuses.chip_revision();
            if found < required {
                return Err(Error::UnsupportedChipRevision {
                    operation: "Burning a secure boot v2 digest",
                    required,
                    found,
                });
            }
        }

        let purpose = target
            .implied_purpose("secure_boot_v2")
            .ok_or_else(|| Error::InvalidKeyBlock(def.name.to_owned()))?;

        batch
            .payloads
            .iter()
            .map(|payload| {
                if payload.len() != block.len() {
                    return Err(Error::SizeMismatch {
                        name: def.name.to_owned(),
                        expected: block.len(),
                        actual: payload.len(),
                    });
                }

                Ok(KeyWrite {
                    block: def,
                    payload: payload.clone(),
                    purpose,
                })
            })
            .collect()
    }

    /// Replace every key of the wide purpose by its two halves, the second
    /// half going to the next free key block.
    fn split_wide_keys(&self, keys: Vec<KeyWrite>, wide: WideKey) -> Result<Vec<KeyWrite>, Error> {
        let target = self.efuses.target();
        let lookup = |purpose: KeyPurpose| {
            target
                .key_purpose(purpose)
                .copied()
                .ok_or_else(|| Error::UnknownKeyPurpose {
                    chip: target.chip(),
                    purpose: purpose.to_string(),
                })
        };

        let mut taken = keys.iter().map(|k| k.block.index).collect::<Vec<_>>();
        let mut split = Vec::with_capacity(keys.len() + 1);

        for key in keys {
            if key.purpose.purpose != wide.purpose {
                split.push(key);
                continue;
            }

            let half = self.efuses.block_by_index(key.block.index).len();
            if key.payload.len() != 2 * half {
                return Err(Error::SizeMismatch {
                    name: format!("{} ({})", key.block.name, wide.purpose),
                    expected: 2 * half,
                    actual: key.payload.len(),
                });
            }

            let second = self.free_key_block(key.block, &taken).ok_or_else(|| {
                Error::InsufficientFreeKeyBlocks {
                    purpose: wide.purpose.to_string(),
                }
            })?;
            taken.push(second.index);

            info!(
                "{} is split: {} goes to {}, {} goes to {}",
                wide.purpose, wide.first, key.block.name, wide.second, second.name
            );
            let (low, high) = key.payload.split_at(half);
            split.push(KeyWrite {
                block: key.block,
                payload: low.to_vec(),
                purpose: lookup(wide.first)?,
            });
            split.push(KeyWrite {
                block: second,
                payload: high.to_vec(),
                purpose: lookup(wide.second)?,
            });
        }

        Ok(split)
    }

    /// First free key block after `source`, wrapping around.
    fn free_key_block(&self, source: &BlockDef, taken: &[u8]) -> Option<&'static BlockDef> {
        let key_blocks = self
            .efuses
            .target()
            .blocks()
            .iter()
            .filter(|b| b.key_purpose.is_some())
            .collect::<Vec<_>>();
        let start = key_blocks
            .iter()
            .position(|b| b.index == source.index)
            .unwrap_or(0);

        key_blocks
            .iter()
            .cycle()
            .skip(start)
            .take(key_blocks.len())
            .copied()
            .filter(|b| !taken.contains(&b.index))
            .find(|b| self.is_free_key_block(b))
    }

    /// Readable, writeable, `USER` purpose which can still change, and no
    /// data.
    fn is_free_key_block(&self, def: &BlockDef) -> bool {
        let Some(purpose) = self.efuses.key_purpose_field(def) else {
            return false;
        };
        let block = self.efuses.block_by_index(def.index);

        self.efuses.protection(def).is_empty()
            && purpose.is_writeable()
            && purpose.get().as_u64() == 0
            && block.is_empty()
            && !block.is_dirty()
    }

    /// Read back the requested protections, or remember them until the open
    /// batch is burned.
    fn verify_protection(
        &mut self,
        outcome: &BurnOutcome,
        names: &[String],
        expected: Protection,
    ) -> Result<(), Error> {
        match outcome {
            BurnOutcome::Burned(_) => self.check_protections(names.iter().map(|n| (n, expected))),
            BurnOutcome::Staged(_) if self.in_batch() => {
                self.protection_checks
                    .extend(names.iter().map(|name| (name.clone(), expected)));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn check_protections<'a>(
        &self,
        checks: impl IntoIterator<Item = (&'a String, Protection)>,
    ) -> Result<(), Error> {
        for (name, expected) in checks {
            if !protect::protection_of(&self.efuses, name)?.contains(expected) {
                return Err(Error::VerifyFailed {
                    block: name.to_owned(),
                });
            }
        }

        Ok(())
    }

    fn burn(&mut self, ignore_batch: bool) -> Result<BurnOutcome, Error> {
        let touched = self
            .efuses
            .dirty_blocks()
            .map(|b| b.def())
            .collect::<Vec<_>>();
        if touched.is_empty() {
            if !self.in_batch() {
                self.protection_checks.clear();
            }
            info!("Nothing to burn, every eFuse already holds the requested value");
            return Ok(BurnOutcome::Unchanged);
        }

        for def in &touched {
            if self.efuses.protection(def).contains(Protection::WRITE) {
                if !self.efuses.force_write_always {
                    return Err(ProtectionError::WriteProtected {
                        name: def.name.to_owned(),
                    }
                    .into());
                }
                warn!("{} is write-protected, burning anyway", def.name);
            }
        }

        let mut encoded = touched
            .iter()
            .map(|def| {
                let block = self.efuses.block_by_index(def.index);
                Ok((*def, block.encode_pending()?, block.pending().to_vec()))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let names = touched.iter().map(|def| def.name).collect::<Vec<_>>();

        if self.in_batch() && !ignore_batch {
            info!("Batch mode, staged {}", names.join(", "));
            return Ok(BurnOutcome::Staged(names));
        }
        if self.transport.is_dry_run() {
            self.protection_checks.clear();
            info!("Dry run, staged {}", names.join(", "));
            return Ok(BurnOutcome::Staged(names));
        }

        // BLOCK0 holds the protection bits and goes last
        encoded.sort_by_key(|(def, ..)| std::cmp::Reverse(def.index));
        for (def, data, _) in &encoded {
            info!("Burning {}", def.name);
            debug!("{}: {data:02x?}", def.name);
            self.transport
                .write_block(def.index, data)
                .map_err(Error::from)
                .burning(&names)?;
        }

        self.transport
            .reset()
            .map_err(Error::from)
            .burning(&names)?;
        self.efuses.update(&mut self.transport).burning(&names)?;

        for (def, _, written) in &encoded {
            self.verify_block(def, written)?;
        }
        let checks = std::mem::take(&mut self.protection_checks);
        self.check_protections(checks.iter().map(|(name, expected)| (name, *expected)))?;

        info!("Burned {}", names.join(", "));
        Ok(BurnOutcome::Burned(names))
    }

    /// Every bit of `written` must read back as set.
    fn verify_block(&self, def: &BlockDef, written: &[u8]) -> Result<(), Error> {
        if self.efuses.protection(def).contains(Protection::READ) {
            debug!("{} is read-protected, not verified", def.name);
            return Ok(());
        }

        let block = self.efuses.block_by_index(def.index);
        let complete = block
            .burned()
            .iter()
            .zip(written)
            .all(|(read, want)| read & want == *want);
        if !complete || block.failed() {
            return Err(Error::VerifyFailed {
                block: def.name.to_owned(),
            });
        }

        Ok(())
    }
}

fn stage_keys(efuses: &mut Efuses, keys: &[KeyWrite], options: BurnOptions) -> Result<(), Error> {
    if !options.show_sensitive_info {
        info!("Sensitive data will be hidden (see --show-sensitive-info)");
    }

    for key in keys {
        stage_key(efuses, key, options)?;
    }

    Ok(())
}

fn stage_key(efuses: &mut Efuses, key: &KeyWrite, options: BurnOptions) -> Result<(), Error> {
    let shown = if options.show_sensitive_info {
        key.payload.iter().map(|b| format!("{b:02x}")).collect()
    } else {
        "??".repeat(key.payload.len())
    };
    info!(
        "Burning {} ({}) -> [{shown}]",
        key.block.name, key.purpose.purpose
    );
    if key.purpose.reverse {
        info!("The key is stored in reverse byte order");
    }

    protect::assign_purpose(efuses, key.block, &key.purpose)?;
    if !efuses
        .block_by_index_mut(key.block.index)
        .stage_data(&key.payload)?
    {
        info!("{} already holds this key", key.block.name);
    }
    stage_hardware_k(efuses, &key.purpose)?;

    if key.purpose.read_protect && !options.no_read_protect {
        info!("Disabling read to key block");
        protect::disable_block_read(efuses, key.block)?;
    }
    if !options.no_write_protect {
        info!("Disabling write to key block");
        protect::disable_block_write(efuses, key.block)?;
    }

    Ok(())
}

/// Force the hardware ECDSA nonce on silicon which needs it.
fn stage_hardware_k(efuses: &mut Efuses, purpose: &KeyPurposeDef) -> Result<(), Error> {
    let Some(k) = efuses.target().hardware_k_fuse() else {
        return Ok(());
    };
    if k.purpose != purpose.purpose || efuses.chip_revision() > k.max_revision {
        return Ok(());
    }

    let mut field = efuses.field_mut(k.field)?;
    if field.as_field().get().as_u64() != 0 {
        info!("'{}' is already '1'", k.field);
        return Ok(());
    }

    info!("'{}' -> 1, required for ECDSA keys on this revision", k.field);
    field.save(&FieldValue::Bool(true))?;

    Ok(())
}

fn check_duplicates<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<(), Error> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name.to_ascii_uppercase()) {
            return Err(Error::DuplicateName(name.to_owned()));
        }
    }

    Ok(())
}

/// CRC-8 (Dallas/Maxim) guarding a custom MAC address.
fn mac_crc8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |mut crc, b| {
        crc ^= b;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0x8c
            } else {
                crc >> 1
            };
        }
        crc
    })
}

pub(crate) fn format_mac(mac: &[u8]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}
