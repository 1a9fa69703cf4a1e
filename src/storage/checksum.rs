//! Checksum sidecars for data files.
//!
//! The digest of each written file is stored next to it as `<file>.<algorithm>sum`
//! in the format of the coreutils `sha256sum` family, so
//! `sha256sum -c sdR-r2-00000412.fit.sha256sum` verifies the file directly.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use crate::error::{AppResult, DaqError};

/// Digest algorithm of the checksum sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// SHA-224
    Sha224,
    /// SHA-256
    #[default]
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl ChecksumAlgorithm {
    /// Lower-case name, as used in the sidecar extension.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha224 => "sha224",
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha384 => "sha384",
            ChecksumAlgorithm::Sha512 => "sha512",
        }
    }

    /// Hex digest of everything `reader` yields.
    pub fn digest_reader<R: Read>(&self, reader: R) -> AppResult<String> {
        match self {
            ChecksumAlgorithm::Sha224 => hash::<Sha224, R>(reader),
            ChecksumAlgorithm::Sha256 => hash::<Sha256, R>(reader),
            ChecksumAlgorithm::Sha384 => hash::<Sha384, R>(reader),
            ChecksumAlgorithm::Sha512 => hash::<Sha512, R>(reader),
        }
    }

    /// Hex digest of a file.
    pub fn digest_file(&self, path: &Path) -> AppResult<String> {
        self.digest_reader(BufReader::new(File::open(path)?))
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn hash<D: Digest, R: Read>(mut reader: R) -> AppResult<String> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Path of the sidecar for `file`.
pub fn sidecar_path(file: &Path, algorithm: ChecksumAlgorithm) -> PathBuf {
    let mut name = file.as_os_str().to_os_string();
    name.push(format!(".{}sum", algorithm.as_str()));
    PathBuf::from(name)
}

/// Digest `file` and write its sidecar. Returns the sidecar path and the digest.
pub fn write_sidecar(file: &Path, algorithm: ChecksumAlgorithm) -> AppResult<(PathBuf, String)> {
    let digest = algorithm.digest_file(file)?;
    let name = file
        .file_name()
        .ok_or_else(|| DaqError::Configuration(format!("{} has no file name", file.display())))?
        .to_string_lossy();

    let sidecar = sidecar_path(file, algorithm);
    std::fs::write(&sidecar, format!("{digest}  {name}\n"))?;
    Ok((sidecar, digest))
}

/// Check a file against its sidecar.
pub fn verify_sidecar(file: &Path, algorithm: ChecksumAlgorithm) -> AppResult<bool> {
    let sidecar = sidecar_path(file, algorithm);
    let text = std::fs::read_to_string(&sidecar)?;
    let recorded = text
        .split_whitespace()
        .next()
        .ok_or_else(|| DaqError::Configuration(format!("Empty checksum file {}", sidecar.display())))?;
    Ok(recorded == algorithm.digest_file(file)?)
}
