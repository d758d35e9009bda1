//! Key and digest material for key burns
//!
//! Parsing signing keys is left to the secure boot tooling. [SecureBootTool]
//! is the seam the command line uses to turn key files into the bytes which
//! end up in a key block.

use std::{fs, path::Path};

use sha2::{Digest, Sha256};

use crate::error::Error;

/// A loaded signing key
#[derive(Clone)]
pub struct SigningKey {
    raw: Vec<u8>,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("len", &self.raw.len())
            .finish_non_exhaustive()
    }
}

/// Secure boot tooling used by the key burn commands
pub trait SecureBootTool {
    /// Digest of the public key in `path`, as burned for secure boot.
    fn digest_public_key(&self, path: &Path) -> Result<Vec<u8>, Error>;

    /// Load the private key in `path`.
    fn load_signing_key(&self, path: &Path) -> Result<SigningKey, Error>;

    /// Raw scalar of a private key.
    fn raw_signing_key_bytes(&self, key: &SigningKey) -> Vec<u8>;
}

/// Works on files holding raw key material
///
/// The public key digest is the SHA-256 of the file contents, and signing
/// keys are taken as they are stored.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawKeyFiles;

impl RawKeyFiles {
    fn read(path: &Path) -> Result<Vec<u8>, Error> {
        fs::read(path).map_err(|err| Error::FileOpenError(path.display().to_string(), err))
    }
}

impl SecureBootTool for RawKeyFiles {
    fn digest_public_key(&self, path: &Path) -> Result<Vec<u8>, Error> {
        let data = Self::read(path)?;
        Ok(Sha256::digest(&data).to_vec())
    }

    fn load_signing_key(&self, path: &Path) -> Result<SigningKey, Error> {
        Ok(SigningKey {
            raw: Self::read(path)?,
        })
    }

    fn raw_signing_key_bytes(&self, key: &SigningKey) -> Vec<u8> {
        key.raw.clone()
    }
}

/// Key file contents, the way the consuming peripheral expects them.
///
/// `ECDSA_KEY` blocks hold the private scalar, shorter curves are padded
/// with leading zeroes up to `width`.
pub fn ecdsa_key_bytes(
    tool: &dyn SecureBootTool,
    path: &Path,
    width: usize,
) -> Result<Vec<u8>, Error> {
    let key = tool.load_signing_key(path)?;
    Ok(pad_left(tool.raw_signing_key_bytes(&key), width))
}

pub(crate) fn pad_left(data: Vec<u8>, width: usize) -> Vec<u8> {
    if data.len() >= width {
        return data;
    }

    let mut padded = vec![0u8; width - data.len()];
    padded.extend(data);
    padded
}
