//! Access to the physical eFuse storage
//!
//! The burn engine only ever talks to a device through the [Transport] trait.
//! [VirtualTransport] emulates a device in memory and can persist its eFuses
//! to a TOML image, which makes it suitable both for trying out commands and
//! for testing.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, TransportError},
    targets::Chip,
};

/// Primitives of a chip programmer
pub trait Transport {
    /// Read the physical (encoded) contents of a block.
    fn read_block(&mut self, index: u8) -> Result<Vec<u8>, TransportError>;

    /// Burn the physical (encoded) contents of a block.
    ///
    /// Bits which are set in `data` are burned, all others are left alone.
    fn write_block(&mut self, index: u8, data: &[u8]) -> Result<(), TransportError>;

    /// Chip revision as `major * 100 + minor`.
    fn chip_revision(&mut self) -> Result<u32, TransportError>;

    /// Reset the eFuse controller so that burned values become readable.
    fn reset(&mut self) -> Result<(), TransportError>;

    /// Writes must not be sent to this transport.
    fn is_dry_run(&self) -> bool {
        false
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn read_block(&mut self, index: u8) -> Result<Vec<u8>, TransportError> {
        (**self).read_block(index)
    }

    fn write_block(&mut self, index: u8, data: &[u8]) -> Result<(), TransportError> {
        (**self).write_block(index, data)
    }

    fn chip_revision(&mut self) -> Result<u32, TransportError> {
        (**self).chip_revision()
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        (**self).reset()
    }

    fn is_dry_run(&self) -> bool {
        (**self).is_dry_run()
    }
}

/// On-disk eFuse image
#[derive(Debug, Deserialize, Serialize)]
struct Image {
    chip: Chip,
    #[serde(default)]
    revision: u32,
    #[serde(with = "hex_blocks")]
    blocks: Vec<Vec<u8>>,
}

mod hex_blocks {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(blocks: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(blocks.iter().map(|block| {
            block
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<String>()
        }))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|hex| {
                let hex = hex.trim_start_matches("0x");
                if hex.len() % 2 != 0 {
                    return Err(D::Error::custom("odd number of hex digits"));
                }

                (0..hex.len())
                    .step_by(2)
                    .map(|i| {
                        let pair = hex
                            .get(i..i + 2)
                            .ok_or_else(|| D::Error::custom("invalid hex digit"))?;
                        u8::from_str_radix(pair, 16).map_err(D::Error::custom)
                    })
                    .collect()
            })
            .collect()
    }
}

/// In-memory device, optionally backed by an image file
#[derive(Debug)]
pub struct VirtualTransport {
    chip: Chip,
    revision: u32,
    blocks: Vec<Vec<u8>>,
    path: Option<PathBuf>,
    dry_run: bool,
    writes: usize,
    fail_after: Option<usize>,
}

impl VirtualTransport {
    /// A blank device.
    pub fn new(chip: Chip, revision: u32) -> Self {
        let blocks = chip
            .into_target()
            .blocks()
            .iter()
            .map(|def| vec![0; def.coding.physical_len(def.raw_len())])
            .collect();

        Self {
            chip,
            revision,
            blocks,
            path: None,
            dry_run: false,
            writes: 0,
            fail_after: None,
        }
    }

    /// Open the image at `path`, every burn is saved back to it.
    ///
    /// A missing file starts out as a blank device of the given `revision`.
    pub fn open(chip: Chip, revision: u32, path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();

        let mut transport = if path.exists() {
            let raw = fs::read_to_string(path)
                .map_err(|err| Error::FileOpenError(path.display().to_string(), err))?;
            let image: Image =
                toml::from_str(&raw).map_err(|err| Error::InvalidImage(err.to_string()))?;

            Self::from_image(chip, image)?
        } else {
            info!("Creating a new eFuse image at {}", path.display());
            Self::new(chip, revision)
        };

        transport.path = Some(path.to_path_buf());
        transport.save().map_err(Error::from)?;

        Ok(transport)
    }

    fn from_image(chip: Chip, image: Image) -> Result<Self, Error> {
        if image.chip != chip {
            return Err(Error::InvalidImage(format!(
                "the image belongs to an {}, not an {chip}",
                image.chip
            )));
        }

        let mut transport = Self::new(chip, image.revision);
        if image.blocks.len() != transport.blocks.len() {
            return Err(Error::InvalidImage(format!(
                "expected {} blocks, found {}",
                transport.blocks.len(),
                image.blocks.len()
            )));
        }
        for (idx, (block, data)) in transport.blocks.iter_mut().zip(image.blocks).enumerate() {
            if block.len() != data.len() {
                return Err(Error::InvalidImage(format!(
                    "block {idx} holds {} bytes, expected {}",
                    data.len(),
                    block.len()
                )));
            }
            *block = data;
        }

        Ok(transport)
    }

    /// Refuse all writes, burns only get staged.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn chip(&self) -> Chip {
        self.chip
    }

    /// Number of physical block writes so far.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Physical contents of a block.
    pub fn block(&self, index: u8) -> Option<&[u8]> {
        self.blocks.get(index as usize).map(Vec::as_slice)
    }

    /// Fail every write after the first `writes` ones.
    pub fn fail_writes_after(&mut self, writes: usize) {
        self.fail_after = Some(writes);
    }

    fn save(&self) -> Result<(), TransportError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let image = Image {
            chip: self.chip,
            revision: self.revision,
            blocks: self.blocks.clone(),
        };
        let raw = toml::to_string_pretty(&image)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        fs::write(path, raw)?;

        Ok(())
    }
}

impl Transport for VirtualTransport {
    fn read_block(&mut self, index: u8) -> Result<Vec<u8>, TransportError> {
        self.blocks
            .get(index as usize)
            .cloned()
            .ok_or(TransportError::InvalidBlock(index))
    }

    fn write_block(&mut self, index: u8, data: &[u8]) -> Result<(), TransportError> {
        if self.fail_after.is_some_and(|n| self.writes >= n) {
            return Err(TransportError::NoResponse);
        }

        let block = self
            .blocks
            .get_mut(index as usize)
            .ok_or(TransportError::InvalidBlock(index))?;
        if block.len() != data.len() {
            return Err(TransportError::Length {
                block: index,
                expected: block.len(),
                actual: data.len(),
            });
        }

        for (stored, new) in block.iter_mut().zip(data) {
            *stored |= new;
        }
        self.writes += 1;
        debug!("Burned block {index} of the virtual {}", self.chip);

        self.save()
    }

    fn chip_revision(&mut self) -> Result<u32, TransportError> {
        Ok(self.revision)
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_only_set_bits() {
        let mut transport = VirtualTransport::new(Chip::Esp32c3, 3);
        let mut data = vec![0u8; 44];
        data[0] = 0b0101;
        transport.write_block(4, &data).unwrap();
        data[0] = 0b1000;
        transport.write_block(4, &data).unwrap();

        assert_eq!(transport.read_block(4).unwrap()[0], 0b1101);
        assert_eq!(transport.writes(), 2);
        assert_eq!(transport.chip_revision().unwrap(), 3);
    }

    #[test]
    fn block_sizes_are_checked() {
        let mut transport = VirtualTransport::new(Chip::Esp32, 0);

        assert_eq!(transport.read_block(0).unwrap().len(), 28);
        assert_eq!(transport.read_block(3).unwrap().len(), 32);
        assert!(matches!(
            transport.read_block(4),
            Err(TransportError::InvalidBlock(4))
        ));
        assert!(matches!(
            transport.write_block(1, &[0; 44]),
            Err(TransportError::Length {
                expected: 32,
                actual: 44,
                ..
            })
        ));
        assert_eq!(transport.writes(), 0);
    }

    #[test]
    fn injected_failures() {
        let mut transport = VirtualTransport::new(Chip::Esp32c6, 0);
        transport.fail_writes_after(1);

        transport.write_block(0, &[0; 24]).unwrap();
        assert!(matches!(
            transport.write_block(0, &[0; 24]),
            Err(TransportError::NoResponse)
        ));
    }

    #[test]
    fn image_format() {
        let image: Image = toml::from_str(
            r#"
            chip = "esp32"
            revision = 300
            blocks = [
                "00010203040506070809000102030405060708090001020304050607",
                "00000000000000000000000000000000000000000000000000000000000000ff",
                "0000000000000000000000000000000000000000000000000000000000000000",
                "0000000000000000000000000000000000000000000000000000000000000000",
            ]
            "#,
        )
        .unwrap();

        let transport = VirtualTransport::from_image(Chip::Esp32, image).unwrap();
        assert_eq!(transport.revision, 300);
        assert_eq!(transport.block(0).unwrap()[2], 0x02);
        assert_eq!(transport.block(1).unwrap()[31], 0xff);
    }

    #[test]
    fn short_blocks_are_rejected() {
        let image: Image = toml::from_str(
            r#"
            chip = "esp32"
            blocks = ["00", "00", "00", "00"]
            "#,
        )
        .unwrap();

        assert!(matches!(
            VirtualTransport::from_image(Chip::Esp32, image),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn non_hex_text_is_rejected() {
        for block in ["aé0", "zz", "abc"] {
            let raw = format!("chip = \"esp32\"\nblocks = [\"{block}\"]");
            assert!(toml::from_str::<Image>(&raw).is_err(), "{block}");
        }
    }

    #[test]
    fn image_must_match_chip() {
        let image = Image {
            chip: Chip::Esp32c3,
            revision: 0,
            blocks: VirtualTransport::new(Chip::Esp32c3, 0).blocks,
        };

        assert!(matches!(
            VirtualTransport::from_image(Chip::Esp32s3, image),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn image_round_trip_through_toml() {
        let mut transport = VirtualTransport::new(Chip::Esp32h2, 102);
        let mut data = vec![0u8; 44];
        data[7] = 0xa5;
        transport.write_block(5, &data).unwrap();

        let image = Image {
            chip: transport.chip,
            revision: transport.revision,
            blocks: transport.blocks.clone(),
        };
        let raw = toml::to_string_pretty(&image).unwrap();
        let loaded = VirtualTransport::from_image(Chip::Esp32h2, toml::from_str(&raw).unwrap())
            .unwrap();

        assert_eq!(loaded.revision, 102);
        assert_eq!(loaded.block(5), transport.block(5));
    }

    #[test]
    fn images_are_saved_after_every_write() {
        let path = std::env::temp_dir().join(format!("espfuse-{}.toml", std::process::id()));
        let _ = fs::remove_file(&path);

        let mut transport = VirtualTransport::open(Chip::Esp32, 300, &path).unwrap();
        assert!(path.exists());
        transport.write_block(3, &[0x11; 32]).unwrap();

        let reopened = VirtualTransport::open(Chip::Esp32, 0, &path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(reopened.revision, 300);
        assert_eq!(reopened.block(3), Some(&[0x11; 32][..]));
    }
}
