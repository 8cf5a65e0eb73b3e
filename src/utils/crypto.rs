// file: src/utils/crypto.rs
// version: 2.0.0
// guid: w4x5y6z7-a8b9-0123-4567-890123456789

//! Digests and signatures used by manifests, checksums and cloud APIs

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use ring::hmac;
use sha2::{Digest, Sha256, Sha512};
use std::io::Read;
use std::path::Path;

use crate::Result;

/// Hex encoded SHA-256 of a byte slice
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Raw HMAC-SHA256 of `data` under `key`
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&key, data).as_ref().to_vec()
}

/// Base64 (standard alphabet, padded)
pub fn base64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Base64 decoding (standard alphabet, padded)
pub fn base64_decode(data: &str) -> Result<Vec<u8>> {
    STANDARD.decode(data.trim()).map_err(|e| {
        crate::error::CloudImagesError::validation(format!("Invalid base64 data: {}", e))
    })
}

/// Digest annotation value in the form `sha512:<base64 without padding>`
pub fn sha512_annotation(digest: &[u8]) -> String {
    format!("sha512:{}", STANDARD_NO_PAD.encode(digest))
}

/// Streaming SHA-256 of a file, returns (hex digest, size)
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// Streaming SHA-512 of a file, returns the raw digest
pub fn sha512_file(path: &Path) -> Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha512::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_of_empty_object() {
        assert_eq!(
            sha256_hex(b"{}"),
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn test_hmac_sha256_rfc4231_case2() {
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_sha512_annotation_has_no_padding() {
        let digest = Sha512::digest(b"").to_vec();
        let value = sha512_annotation(&digest);
        assert!(value.starts_with("sha512:"));
        assert!(!value.ends_with('='));
    }

    #[test]
    fn test_sha256_file_matches_slice() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"debian").unwrap();

        let (digest, size) = sha256_file(file.path()).unwrap();

        assert_eq!(digest, sha256_hex(b"debian"));
        assert_eq!(size, 6);
    }

    #[test]
    fn test_base64_roundtrip() {
        let encoded = base64_encode(b"account-key");
        assert_eq!(base64_decode(&encoded).unwrap(), b"account-key");
        assert!(base64_decode("***").is_err());
    }
}
