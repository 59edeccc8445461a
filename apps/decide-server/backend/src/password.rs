//! Password hashing, stored as `pbkdf2_sha256$<iterations>$<salt>$<hash>`
//! with base64 salt and hash.

use base64::{engine::general_purpose::STANDARD, Engine};
use openssl::hash::MessageDigest;

const ALGORITHM: &str = "pbkdf2_sha256";
const ITERATIONS: usize = 260_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
}

/// Hashes `password` with a fresh random salt.
pub fn hash_password(password: &str) -> Result<String, Error> {
    let mut salt = [0u8; SALT_LEN];
    openssl::rand::rand_bytes(&mut salt)?;
    let hash = derive(password, &salt, ITERATIONS)?;
    Ok(format!(
        "{ALGORITHM}${ITERATIONS}${}${}",
        STANDARD.encode(salt),
        STANDARD.encode(hash)
    ))
}

/// Checks `password` against a stored hash. Malformed hashes never match.
pub fn verify_password(password: &str, encoded: &str) -> bool {
    let mut parts = encoded.split('$');
    let (Some(ALGORITHM), Some(iterations), Some(salt), Some(expected), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };

    let (Ok(iterations), Ok(salt), Ok(expected)) = (
        iterations.parse::<usize>(),
        STANDARD.decode(salt),
        STANDARD.decode(expected),
    ) else {
        return false;
    };

    if iterations == 0 || expected.len() != HASH_LEN {
        return false;
    }

    match derive(password, &salt, iterations) {
        Ok(actual) => openssl::memcmp::eq(&actual, &expected),
        Err(e) => {
            tracing::error!("Failed to derive password hash: {e}");
            false
        }
    }
}

fn derive(password: &str, salt: &[u8], iterations: usize) -> Result<[u8; HASH_LEN], Error> {
    let mut hash = [0u8; HASH_LEN];
    openssl::pkcs5::pbkdf2_hmac(
        password.as_bytes(),
        salt,
        iterations,
        MessageDigest::sha256(),
        &mut hash,
    )?;
    Ok(hash)
}
