//! HMAC signing and verification of archive digests.
//!
//! The signing key is the instance secret concatenated with a fixed salt.
//! Verification tries the instance's active secret first and falls back to
//! the secret embedded in the archive's `config/` tree, which is how an
//! archive created on one instance stays verifiable after moving to another.

use crate::archive::digest::{compute_digest, unreadable, ContentDigest};
use crate::archive::{sidecar_name, EMBEDDED_SECRET_ENTRY, SIGNATURE_ENTRY};
use crate::error::Result;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::fs::File;
use std::io::Read;
use std::path::Path;

type HmacSha256 = Hmac<Sha256>;

const KEY_SALT: &[u8] = b"navboard-vault-signing-v1";

/// Outcome of verifying an archive against the instance's trust material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verification {
    /// Signed with this instance's active secret.
    Trusted,
    /// Signed with the secret embedded in the archive; accepted, but the
    /// archive comes from a different instance.
    ForeignSigned,
    /// No signature present anywhere.
    Unsigned,
    /// A signature is present but matches neither secret.
    Mismatch,
}

impl Verification {
    /// Whether restore and import may proceed with this outcome.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verification::Trusted | Verification::ForeignSigned)
    }
}

fn keyed_mac(secret: &str) -> HmacSha256 {
    let mut key = Vec::with_capacity(secret.len() + KEY_SALT.len());
    key.extend_from_slice(secret.as_bytes());
    key.extend_from_slice(KEY_SALT);
    HmacSha256::new_from_slice(&key).expect("HMAC accepts any key length")
}

/// Signs a digest, returning the signature as lowercase hex.
pub fn sign(digest: &ContentDigest, secret: &str) -> String {
    let mut mac = keyed_mac(secret);
    mac.update(digest.as_hex().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of `signature_hex` against the digest and secret.
pub fn verify(digest: &ContentDigest, signature_hex: &str, secret: &str) -> bool {
    let Ok(raw) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let mut mac = keyed_mac(secret);
    mac.update(digest.as_hex().as_bytes());
    mac.verify_slice(&raw).is_ok()
}

fn read_zip_entry(path: &Path, entry_name: &str) -> Result<Option<String>> {
    let file = File::open(path).map_err(|e| unreadable(path, e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| unreadable(path, e))?;
    // The entry borrows `archive`; the read has to finish inside this
    // statement so the borrow ends before `archive` goes out of scope.
    let content = match archive.by_name(entry_name) {
        Ok(mut entry) => {
            let mut content = String::new();
            entry
                .read_to_string(&mut content)
                .map_err(|e| unreadable(path, e))?;
            Some(content.trim().to_string())
        }
        Err(zip::result::ZipError::FileNotFound) => None,
        Err(e) => return Err(unreadable(path, e)),
    };
    Ok(content)
}

/// Reads the archive's signature, preferring the internal entry and falling
/// back to the detached sidecar next to the file.
pub fn read_signature(path: &Path) -> Result<Option<String>> {
    if let Some(sig) = read_zip_entry(path, SIGNATURE_ENTRY)? {
        return Ok(Some(sig));
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let sidecar = path.with_file_name(sidecar_name(&file_name));
    if sidecar.is_file() {
        let sig = std::fs::read_to_string(&sidecar)?;
        let sig = sig.trim();
        if !sig.is_empty() {
            return Ok(Some(sig.to_string()));
        }
    }
    Ok(None)
}

/// Reads the fallback secret the creating instance embedded under `config/`.
pub fn read_embedded_secret(path: &Path) -> Result<Option<String>> {
    read_zip_entry(path, EMBEDDED_SECRET_ENTRY)
}

/// Full trust check of an archive: digest, signature lookup, active secret,
/// then embedded fallback secret.
pub fn verify_archive(path: &Path, active_secret: &str) -> Result<Verification> {
    let digest = compute_digest(path)?;

    let Some(signature) = read_signature(path)? else {
        return Ok(Verification::Unsigned);
    };

    if verify(&digest, &signature, active_secret) {
        return Ok(Verification::Trusted);
    }

    if let Some(embedded) = read_embedded_secret(path)? {
        if embedded != active_secret && verify(&digest, &signature, &embedded) {
            return Ok(Verification::ForeignSigned);
        }
    }

    Ok(Verification::Mismatch)
}
