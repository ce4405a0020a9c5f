//! Typed arguments for LUKS2 operations via `cryptsetup`.
//!
//! - `LuksFormatArgs` for `cryptsetup luksFormat`
//! - `LuksOpenArgs` for `cryptsetup open`
//! - `LuksCloseArgs` for `cryptsetup close`
//!
//! # Security Model
//!
//! **CRITICAL**: Passphrases are NEVER passed via CLI arguments (visible in `ps aux`).
//! They are staged into a 0600 keyfile whose path is passed with `--key-file`.
//! The `SecretFile` wrapper overwrites and removes the keyfile even if the
//! command fails.
//!
//! # LUKS2 Defaults
//!
//! - Cipher: aes-xts-plain64, 512-bit key (AES-256 in XTS mode)
//! - Hash: sha256
//! - Key derivation: argon2id
//! - Salt/volume key from `/dev/random` (`--use-random`)

use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::command_traits::CommandArgs;

// ============================================================================
// SecretFile - RAII Wrapper for Keyfile Management
// ============================================================================

/// RAII wrapper for a temporary passphrase keyfile.
///
/// Created with mode 0600 in the given directory (`/tmp`, RAM on the live
/// ISO). The content is overwritten with zeros and the file unlinked on drop.
#[derive(Debug)]
pub struct SecretFile {
    file: NamedTempFile,
    size: usize,
}

impl SecretFile {
    /// Stage `secret` into a new keyfile under `dir`.
    pub fn new_in(dir: &Path, secret: &str) -> std::io::Result<Self> {
        // NamedTempFile creates files 0600 with O_EXCL
        let mut file = tempfile::Builder::new()
            .prefix(".archdisk_keyfile_")
            .tempfile_in(dir)?;

        // cryptsetup reads the keyfile verbatim; no trailing newline
        file.write_all(secret.as_bytes())?;
        file.as_file().sync_all()?;

        debug!(path = %file.path().display(), bytes = secret.len(), "keyfile staged");

        Ok(Self {
            file,
            size: secret.len(),
        })
    }

    /// Stage `secret` under the system temp directory.
    pub fn new(secret: &str) -> std::io::Result<Self> {
        Self::new_in(&std::env::temp_dir(), secret)
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    fn secure_wipe(&mut self) {
        let handle = self.file.as_file_mut();
        let zeros = vec![0u8; self.size];
        let wiped = handle
            .seek(SeekFrom::Start(0))
            .and_then(|_| handle.write_all(&zeros))
            .and_then(|_| handle.sync_all());
        if let Err(e) = wiped {
            warn!("Failed to overwrite keyfile {}: {}", self.path().display(), e);
        }
    }
}

impl Drop for SecretFile {
    // NamedTempFile unlinks itself after this runs
    fn drop(&mut self) {
        self.secure_wipe();
    }
}

/// Where the LUKS passphrase comes from for one apply run.
#[derive(Debug)]
pub enum KeyMaterial {
    /// Staged from the environment; wiped on drop
    Staged(SecretFile),
    /// Operator-supplied `--key-file`; left untouched
    External(PathBuf),
}

impl KeyMaterial {
    pub fn path(&self) -> &Path {
        match self {
            Self::Staged(secret) => secret.path(),
            Self::External(path) => path,
        }
    }
}

// ============================================================================
// LUKS Parameters
// ============================================================================

/// LUKS cipher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
pub enum LuksCipher {
    /// AES-256 in XTS mode (recommended for most uses)
    #[default]
    #[serde(rename = "aes-xts-plain64")]
    #[strum(serialize = "aes-xts-plain64")]
    Aes256Xts,
    #[serde(rename = "serpent-xts-plain64")]
    #[strum(serialize = "serpent-xts-plain64")]
    Serpent256Xts,
    #[serde(rename = "twofish-xts-plain64")]
    #[strum(serialize = "twofish-xts-plain64")]
    Twofish256Xts,
}

impl LuksCipher {
    /// Default key size in bits. XTS splits the key in two, hence 512.
    pub fn key_size(&self) -> u32 {
        match self {
            LuksCipher::Aes256Xts | LuksCipher::Serpent256Xts | LuksCipher::Twofish256Xts => 512,
        }
    }
}

/// LUKS header hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LuksHash {
    #[default]
    Sha256,
    Sha512,
}

/// Password-based key derivation function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Pbkdf {
    #[default]
    Argon2id,
    Argon2i,
    Pbkdf2,
}

// ============================================================================
// LuksFormatArgs
// ============================================================================

/// `cryptsetup luksFormat --type luks2 ... --batch-mode --key-file <kf> <device>`
///
/// | Rust Field | CLI Flag     |
/// |------------|--------------|
/// | `cipher`   | `--cipher`   |
/// | `key_size` | `--key-size` |
/// | `hash`     | `--hash`     |
/// | `pbkdf`    | `--pbkdf`    |
/// | `key_file` | `--key-file` |
/// | `label`    | `--label`    |
#[derive(Debug, Clone)]
pub struct LuksFormatArgs {
    pub device: PathBuf,
    pub cipher: LuksCipher,
    pub key_size: u32,
    pub hash: LuksHash,
    pub pbkdf: Pbkdf,
    pub key_file: PathBuf,
    pub label: Option<String>,
}

impl CommandArgs for LuksFormatArgs {
    fn program(&self) -> &'static str {
        "cryptsetup"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "luksFormat".to_string(),
            "--type".to_string(),
            "luks2".to_string(),
            "--cipher".to_string(),
            self.cipher.to_string(),
            "--key-size".to_string(),
            self.key_size.to_string(),
            "--hash".to_string(),
            self.hash.to_string(),
            "--pbkdf".to_string(),
            self.pbkdf.to_string(),
            "--use-random".to_string(),
            "--batch-mode".to_string(),
            "--key-file".to_string(),
            self.key_file.display().to_string(),
        ];

        if let Some(ref label) = self.label {
            args.push("--label".to_string());
            args.push(label.clone());
        }

        args.push(self.device.display().to_string());
        args
    }

    /// LUKS format erases the partition contents.
    fn is_destructive(&self) -> bool {
        true
    }
}

// ============================================================================
// LuksOpenArgs / LuksCloseArgs
// ============================================================================

/// `cryptsetup open --type luks2 --key-file <kf> <device> <name>`
///
/// The decrypted device appears at `/dev/mapper/<mapper_name>`.
#[derive(Debug, Clone)]
pub struct LuksOpenArgs {
    pub device: PathBuf,
    pub mapper_name: String,
    pub key_file: PathBuf,
}

impl CommandArgs for LuksOpenArgs {
    fn program(&self) -> &'static str {
        "cryptsetup"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "open".to_string(),
            "--type".to_string(),
            "luks2".to_string(),
            "--key-file".to_string(),
            self.key_file.display().to_string(),
            self.device.display().to_string(),
            self.mapper_name.clone(),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct LuksCloseArgs {
    pub mapper_name: String,
}

impl CommandArgs for LuksCloseArgs {
    fn program(&self) -> &'static str {
        "cryptsetup"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["close".to_string(), self.mapper_name.clone()]
    }
}

// ============================================================================
// Tests
// ============================================================================
