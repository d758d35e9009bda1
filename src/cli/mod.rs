//! CLI utilities for the `espfuse` binary
//!
//! No stability guaranties apply

use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use clap::Args;
use dialoguer::{theme::ColorfulTheme, Confirm};
use log::{info, warn};
use miette::Result;

use self::config::Config;
use crate::{
    burn::{BurnBatch, BurnOptions, BurnOutcome, Burner},
    digest::{ecdsa_key_bytes, RawKeyFiles, SecureBootTool},
    efuse::{Efuses, FieldValue},
    error::Error,
    targets::{Chip, FieldCategory, FieldKind, KeyPurpose},
    transport::{Transport, VirtualTransport},
};

pub mod config;

/// Width of an ECDSA private key
const ECDSA_KEY_LEN: usize = 32;

/// Device selection shared by every command
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct ConnectArgs {
    /// Target chip
    #[arg(short = 'c', long, env = "ESPFUSE_CHIP")]
    pub chip: Option<Chip>,
    /// Use a blank in-memory device instead of an eFuse image
    #[arg(long)]
    pub virt: bool,
    /// eFuse image backing the virtual device, created when missing
    #[arg(long, conflicts_with = "virt")]
    pub path_efuse_file: Option<PathBuf>,
    /// Chip revision of a new device, as `major * 100 + minor`
    #[arg(long, default_value_t = 0)]
    pub chip_revision: u32,
    /// Show what would be burned without burning it
    #[arg(long)]
    pub dry_run: bool,
    /// Burn without asking for confirmation
    #[arg(long)]
    pub do_not_confirm: bool,
}

/// Protection switches shared by the key commands
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct KeyArgs {
    /// Leave the key blocks writeable
    #[arg(long)]
    pub no_write_protect: bool,
    /// Leave the key blocks readable
    #[arg(long)]
    pub no_read_protect: bool,
    /// Print key material instead of hiding it
    #[arg(long)]
    pub show_sensitive_info: bool,
    /// Burn even if a block is write-protected
    #[arg(long)]
    pub force_write_always: bool,
}

impl From<&KeyArgs> for BurnOptions {
    fn from(args: &KeyArgs) -> Self {
        BurnOptions {
            no_write_protect: args.no_write_protect,
            no_read_protect: args.no_read_protect,
            show_sensitive_info: args.show_sensitive_info,
            force_write_always: args.force_write_always,
        }
    }
}

/// Burn keys into key blocks
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct BurnKeyArgs {
    /// Repeated `BLOCK KEYFILE PURPOSE`, without `PURPOSE` on the ESP32
    #[arg(required = true, num_args = 1.., value_name = "BLOCK KEYFILE [PURPOSE]")]
    pub keys: Vec<String>,
    #[command(flatten)]
    pub key_args: KeyArgs,
}

/// Burn digests of secure boot public keys
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct BurnKeyDigestArgs {
    /// Repeated `BLOCK KEYFILE PURPOSE`, or only `KEYFILE` on the ESP32
    #[arg(required = true, num_args = 1.., value_name = "BLOCK KEYFILE [PURPOSE]")]
    pub keys: Vec<String>,
    #[command(flatten)]
    pub key_args: KeyArgs,
}

/// Burn values into named fields
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct BurnEfuseArgs {
    /// Repeated `NAME VALUE`
    #[arg(required = true, num_args = 1.., value_name = "NAME VALUE")]
    pub values: Vec<String>,
}

/// Fields or blocks to protect
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct ProtectArgs {
    /// Field or block names
    #[arg(required = true, num_args = 1..)]
    pub names: Vec<String>,
}

/// Burn raw data into blocks
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct BurnBlockDataArgs {
    /// Byte offset into the block, only valid with a single block
    #[arg(long, default_value_t = 0)]
    pub offset: usize,
    /// Repeated `BLOCK DATAFILE`
    #[arg(required = true, num_args = 1.., value_name = "BLOCK DATAFILE")]
    pub data: Vec<String>,
}

/// Burn single bits of a block
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct BurnBitArgs {
    /// Block to burn
    pub block: String,
    /// Bit numbers within the block
    #[arg(required = true, num_args = 1..)]
    pub bits: Vec<usize>,
}

/// Burn a custom MAC address
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct BurnCustomMacArgs {
    /// MAC address as `aa:bb:cc:dd:ee:ff`
    pub mac: String,
}

/// Check the blocks for coding errors
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct CheckErrorArgs {
    /// Re-burn blocks that were not burned completely
    #[arg(long)]
    pub recovery: bool,
}

/// Print the decoded fields
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct SummaryArgs {
    /// Print key material instead of hiding it
    #[arg(long)]
    pub show_sensitive_info: bool,
}

/// Open the device selected by `args`, falling back to `config`.
pub fn connect(args: &ConnectArgs, config: &Config) -> Result<Burner<VirtualTransport>> {
    let chip = args.chip.or(config.chip).ok_or(Error::ChipNotSpecified)?;

    let transport = match args.path_efuse_file.as_ref().or(config.efuse_file.as_ref()) {
        Some(path) if !args.virt => {
            info!("eFuse image: {}", path.display());
            VirtualTransport::open(chip, args.chip_revision, path)?
        }
        _ => {
            info!("Using a blank in-memory {chip}");
            VirtualTransport::new(chip, args.chip_revision)
        }
    };

    if args.dry_run {
        warn!("Dry run, nothing will be burned");
    }

    Ok(Burner::new(chip, transport.with_dry_run(args.dry_run))?)
}

/// Whether burns need to be confirmed interactively
pub fn needs_confirmation(args: &ConnectArgs, config: &Config) -> bool {
    !(args.do_not_confirm || config.do_not_confirm)
}

pub fn burn_key<T: Transport>(
    burner: &mut Burner<T>,
    args: &BurnKeyArgs,
    confirm: bool,
) -> Result<()> {
    let options = BurnOptions::from(&args.key_args);
    let batch = key_batch(burner.efuses(), &args.keys, |path, purpose| {
        if purpose == Some(KeyPurpose::EcdsaKey) {
            ecdsa_key_bytes(&RawKeyFiles, path, ECDSA_KEY_LEN)
        } else {
            read_file(path)
        }
    })?;

    burn_with_confirmation(burner, confirm, options.show_sensitive_info, |burner| {
        burner.burn_key(&batch, options)
    })
}

pub fn burn_key_digest<T: Transport>(
    burner: &mut Burner<T>,
    args: &BurnKeyDigestArgs,
    confirm: bool,
) -> Result<()> {
    let options = BurnOptions::from(&args.key_args);

    let target = burner.efuses().target();
    let keys = match (target.key_purposes().is_empty(), target.digest_block()) {
        (true, Some(block)) if args.keys.len() == 1 => {
            vec![block.to_owned(), args.keys[0].clone()]
        }
        _ => args.keys.clone(),
    };

    let batch = key_batch(burner.efuses(), &keys, |path, _| {
        RawKeyFiles.digest_public_key(path)
    })?;

    burn_with_confirmation(burner, confirm, options.show_sensitive_info, |burner| {
        burner.burn_key_digest(&batch, options)
    })
}

pub fn burn_efuse<T: Transport>(
    burner: &mut Burner<T>,
    args: &BurnEfuseArgs,
    confirm: bool,
) -> Result<()> {
    let mut values = Vec::new();
    for pair in args.values.chunks(2) {
        let [name, raw] = pair else {
            return Err(missing_argument(&pair[0], "value").into());
        };
        values.push((name.clone(), parse_value(burner.efuses(), name, raw)?));
    }

    burn_with_confirmation(burner, confirm, false, |burner| burner.burn_efuse(&values))
}

pub fn read_protect_efuse<T: Transport>(
    burner: &mut Burner<T>,
    args: &ProtectArgs,
    confirm: bool,
) -> Result<()> {
    burn_with_confirmation(burner, confirm, false, |burner| {
        burner.read_protect_efuse(&args.names)
    })
}

pub fn write_protect_efuse<T: Transport>(
    burner: &mut Burner<T>,
    args: &ProtectArgs,
    confirm: bool,
) -> Result<()> {
    burn_with_confirmation(burner, confirm, false, |burner| {
        burner.write_protect_efuse(&args.names)
    })
}

pub fn burn_block_data<T: Transport>(
    burner: &mut Burner<T>,
    args: &BurnBlockDataArgs,
    confirm: bool,
) -> Result<()> {
    let mut data = Vec::new();
    for pair in args.data.chunks(2) {
        let [block, path] = pair else {
            return Err(missing_argument(&pair[0], "data file").into());
        };
        data.push((block.clone(), read_file(Path::new(path))?));
    }

    burn_with_confirmation(burner, confirm, false, |burner| {
        burner.burn_block_data(&data, args.offset)
    })
}

pub fn burn_bit<T: Transport>(
    burner: &mut Burner<T>,
    args: &BurnBitArgs,
    confirm: bool,
) -> Result<()> {
    burn_with_confirmation(burner, confirm, false, |burner| {
        burner.burn_bit(&args.block, &args.bits)
    })
}

pub fn burn_custom_mac<T: Transport>(
    burner: &mut Burner<T>,
    args: &BurnCustomMacArgs,
    confirm: bool,
) -> Result<()> {
    let mac = parse_mac(&args.mac).ok_or_else(|| Error::InvalidValue {
        name: "CUSTOM_MAC".to_owned(),
        value: args.mac.clone(),
    })?;

    burn_with_confirmation(burner, confirm, false, |burner| burner.burn_custom_mac(mac))
}

pub fn check_error<T: Transport>(burner: &mut Burner<T>, args: &CheckErrorArgs) -> Result<()> {
    Ok(burner.check_error(args.recovery)?)
}

pub fn dump<T: Transport>(burner: &Burner<T>) {
    print!("{}", burner.dump());
}

pub fn summary<T: Transport>(burner: &Burner<T>, args: &SummaryArgs) {
    print!("{}", burner.summary(args.show_sensitive_info));
}

/// Stage an operation, show what it changes and burn it once confirmed.
fn burn_with_confirmation<T, F>(
    burner: &mut Burner<T>,
    confirm: bool,
    show_sensitive_info: bool,
    op: F,
) -> Result<()>
where
    T: Transport,
    F: FnOnce(&mut Burner<T>) -> Result<BurnOutcome, Error>,
{
    burner.begin_batch();

    let staged = op(burner).and_then(|outcome| {
        if confirm && !matches!(outcome, BurnOutcome::Unchanged) {
            print_pending(burner.efuses(), show_sensitive_info);
            let proceed = Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt("Burning eFuses cannot be undone. Continue?")
                .interact_opt()?
                .unwrap_or_default();
            if !proceed {
                return Err(Error::Cancelled);
            }
        }
        Ok(outcome)
    });

    if let Err(err) = staged {
        burner.discard_pending();
        burner.end_batch()?;
        return Err(err.into());
    }

    match burner.end_batch()? {
        BurnOutcome::Unchanged => println!("Nothing to burn, the eFuses already hold these values"),
        BurnOutcome::Staged(blocks) => println!("Dry run, would burn: {}", blocks.join(", ")),
        BurnOutcome::Burned(blocks) => println!("Burned: {}", blocks.join(", ")),
    }

    Ok(())
}

fn print_pending(efuses: &Efuses, show_sensitive_info: bool) {
    println!("Changes to burn on {}:", efuses.chip());

    for def in efuses.target().fields() {
        let Ok(field) = efuses.field(def.name) else {
            continue;
        };
        let (old, new) = (field.get(), field.get_pending());
        if old == new {
            continue;
        }

        if def.category == FieldCategory::Key && !show_sensitive_info {
            println!("  {:<32} (hidden)", def.name);
        } else {
            println!("  {:<32} {old} -> {new}", def.name);
        }
    }

    let blocks = efuses
        .dirty_blocks()
        .map(|block| block.name())
        .collect::<Vec<_>>();
    println!("Blocks: {}", blocks.join(", "));
}

/// Collect a key batch from `BLOCK FILE [PURPOSE]` groups.
fn key_batch<F>(efuses: &Efuses, args: &[String], mut read: F) -> Result<BurnBatch, Error>
where
    F: FnMut(&Path, Option<KeyPurpose>) -> Result<Vec<u8>, Error>,
{
    let with_purpose = !efuses.target().key_purposes().is_empty();
    let width = if with_purpose { 3 } else { 2 };

    let mut blocks = Vec::new();
    let mut payloads = Vec::new();
    let mut purposes = Vec::new();

    for group in args.chunks(width) {
        let purpose = match group.get(2).filter(|_| with_purpose) {
            Some(raw) => Some(KeyPurpose::from_str(raw).map_err(|_| {
                Error::UnknownKeyPurpose {
                    chip: efuses.chip(),
                    purpose: raw.clone(),
                }
            })?),
            None => None,
        };

        blocks.push(group.first().cloned());
        payloads.push(
            group
                .get(1)
                .map(|path| read(Path::new(path), purpose))
                .transpose()?,
        );
        purposes.push(purpose);
    }

    Ok(BurnBatch::from_lists(blocks, payloads, purposes))
}

fn read_file(path: &Path) -> Result<Vec<u8>, Error> {
    fs::read(path).map_err(|err| Error::FileOpenError(path.display().to_string(), err))
}

fn missing_argument(name: &str, what: &str) -> Error {
    Error::InvalidValue {
        name: name.to_owned(),
        value: format!("<missing {what}>"),
    }
}

/// Parse a command-line value for the field `name`.
///
/// Byte fields are written most significant byte first and stored reversed.
pub fn parse_value(efuses: &Efuses, name: &str, raw: &str) -> Result<FieldValue, Error> {
    let field = efuses.field(name)?;
    let invalid = || Error::InvalidValue {
        name: field.name().to_owned(),
        value: raw.to_owned(),
    };

    match field.def().kind {
        FieldKind::Mac => parse_mac(raw)
            .map(|mac| FieldValue::Bytes(mac.to_vec()))
            .ok_or_else(invalid),
        FieldKind::Bytes => parse_hex(raw)
            .map(|mut bytes| {
                bytes.reverse();
                FieldValue::Bytes(bytes)
            })
            .ok_or_else(invalid),
        FieldKind::Bool => match raw.to_ascii_lowercase().as_str() {
            "true" => Ok(FieldValue::Bool(true)),
            "false" => Ok(FieldValue::Bool(false)),
            _ => parse_uint(raw).map(FieldValue::Uint).ok_or_else(invalid),
        },
        FieldKind::KeyPurpose => match KeyPurpose::from_str(raw) {
            Ok(purpose) => efuses
                .target()
                .key_purpose(purpose)
                .and_then(|def| def.code)
                .map(|code| FieldValue::Uint(code.into()))
                .ok_or_else(invalid),
            Err(_) => parse_uint(raw).map(FieldValue::Uint).ok_or_else(invalid),
        },
        FieldKind::Uint => parse_uint(raw).map(FieldValue::Uint).ok_or_else(invalid),
    }
}

/// Decimal or `0x`-prefixed hexadecimal number
pub fn parse_uint(raw: &str) -> Option<u64> {
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

/// Hex string, optionally `0x`-prefixed, in written order
pub fn parse_hex(raw: &str) -> Option<Vec<u8>> {
    let hex = raw.strip_prefix("0x").unwrap_or(raw);
    if hex.is_empty() || hex.len() % 2 != 0 {
        return None;
    }

    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// MAC address as `aa:bb:cc:dd:ee:ff`
pub fn parse_mac(raw: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = raw.split(':');

    for byte in &mut mac {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }

    parts.next().is_none().then_some(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers() {
        assert_eq!(parse_uint("42"), Some(42));
        assert_eq!(parse_uint("0x2a"), Some(42));
        assert_eq!(parse_uint("0X2A"), Some(42));
        assert_eq!(parse_uint("forty-two"), None);
        assert_eq!(parse_uint("0x"), None);
    }

    #[test]
    fn hex_strings() {
        assert_eq!(parse_hex("0x0102ff"), Some(vec![0x01, 0x02, 0xff]));
        assert_eq!(parse_hex("abcd"), Some(vec![0xab, 0xcd]));
        assert_eq!(parse_hex("abc"), None);
        assert_eq!(parse_hex("zz"), None);
        assert_eq!(parse_hex(""), None);
    }

    #[test]
    fn mac_addresses() {
        assert_eq!(
            parse_mac("aa:bb:cc:dd:ee:0f"),
            Some([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x0f])
        );
        assert_eq!(parse_mac("aa:bb:cc:dd:ee"), None);
        assert_eq!(parse_mac("aa:bb:cc:dd:ee:ff:00"), None);
        assert_eq!(parse_mac("aabb:cc:dd:ee:ff"), None);
        assert_eq!(parse_mac("aa:bb:cc:dd:ee:fg"), None);
    }

    #[test]
    fn field_values() {
        let efuses = Efuses::new(Chip::Esp32c3, 0);

        assert_eq!(
            parse_value(&efuses, "CUSTOM_MAC", "00:11:22:33:44:55").unwrap(),
            FieldValue::Bytes(vec![0x00, 0x11, 0x22, 0x33, 0x44, 0x55])
        );
        assert_eq!(
            parse_value(&efuses, "DIS_USB_JTAG", "true").unwrap(),
            FieldValue::Bool(true)
        );
        assert!(matches!(
            parse_value(&efuses, "DIS_USB_JTAG", "maybe"),
            Err(Error::InvalidValue { .. })
        ));
        assert_eq!(
            parse_value(&efuses, "KEY_PURPOSE_0", "HMAC_UP").unwrap(),
            FieldValue::Uint(8)
        );
        assert!(matches!(
            parse_value(&efuses, "NO_SUCH_FIELD", "1"),
            Err(Error::UnknownField(_))
        ));
    }

    #[test]
    fn key_groups_are_split_into_lists() {
        let efuses = Efuses::new(Chip::Esp32c3, 0);
        let args = ["BLOCK_KEY0", "key.bin", "HMAC_UP", "BLOCK_KEY1", "other.bin"]
            .map(String::from);

        let mut reads = Vec::new();
        let batch = key_batch(&efuses, &args, |path, purpose| {
            reads.push((path.to_owned(), purpose));
            Ok(vec![0; 32])
        })
        .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(
            reads,
            vec![
                (PathBuf::from("key.bin"), Some(KeyPurpose::HmacUp)),
                (PathBuf::from("other.bin"), None),
            ]
        );
    }

    #[test]
    fn unknown_purposes_are_reported() {
        let efuses = Efuses::new(Chip::Esp32c3, 0);
        let args = ["BLOCK_KEY0", "key.bin", "FOO"].map(String::from);

        let result = key_batch(&efuses, &args, |_, _| Ok(vec![0; 32]));
        assert!(matches!(result, Err(Error::UnknownKeyPurpose { .. })));
    }

    #[test]
    fn esp32_keys_take_no_purpose() {
        let efuses = Efuses::new(Chip::Esp32, 0);
        let args = ["BLOCK1", "key.bin", "BLOCK2", "digest.bin"].map(String::from);

        let batch = key_batch(&efuses, &args, |path, purpose| {
            assert!(purpose.is_none());
            Ok(path.to_string_lossy().into_owned().into_bytes())
        })
        .unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn staged_changes_are_burned_once() {
        let transport = VirtualTransport::new(Chip::Esp32c3, 0);
        let mut burner = Burner::new(Chip::Esp32c3, transport).unwrap();

        let args = BurnEfuseArgs {
            values: ["DIS_USB_JTAG", "1", "DIS_FORCE_DOWNLOAD", "1"].map(String::from).to_vec(),
        };
        burn_efuse(&mut burner, &args, false).unwrap();

        assert_eq!(burner.transport().writes(), 1);
        assert_eq!(
            burner.efuses().field("DIS_USB_JTAG").unwrap().get(),
            FieldValue::Bool(true)
        );
        assert!(!burner.in_batch());
    }

    #[test]
    fn failed_operations_leave_nothing_staged() {
        let transport = VirtualTransport::new(Chip::Esp32c3, 0);
        let mut burner = Burner::new(Chip::Esp32c3, transport).unwrap();

        let args = BurnEfuseArgs {
            values: ["DIS_USB_JTAG", "2"].map(String::from).to_vec(),
        };
        assert!(burn_efuse(&mut burner, &args, false).is_err());

        assert_eq!(burner.efuses().dirty_blocks().count(), 0);
        assert_eq!(burner.transport().writes(), 0);
        assert!(!burner.in_batch());
    }
}
