//! API key generation and hashing
//!
//! Keys look like `uc_live_<48 hex chars>` (or `uc_test_...`). Only the SHA-256
//! digest and a short display prefix are ever stored.

use crate::{GatekeeperError, Result};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Random bytes behind each key; hex-encoded to 48 characters.
const SECRET_BYTES: usize = 24;

/// Characters of the raw key kept for display.
pub const DISPLAY_PREFIX_LEN: usize = 12;

/// Deployment environment a key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEnvironment {
    Live,
    Test,
}

impl KeyEnvironment {
    pub fn prefix(&self) -> &'static str {
        match self {
            KeyEnvironment::Live => "uc_live_",
            KeyEnvironment::Test => "uc_test_",
        }
    }
}

impl fmt::Display for KeyEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyEnvironment::Live => f.write_str("live"),
            KeyEnvironment::Test => f.write_str("test"),
        }
    }
}

impl FromStr for KeyEnvironment {
    type Err = GatekeeperError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "live" => Ok(KeyEnvironment::Live),
            "test" => Ok(KeyEnvironment::Test),
            other => Err(GatekeeperError::ValidationError(format!(
                "Unknown key environment: {} (expected live or test)",
                other
            ))),
        }
    }
}

/// A freshly minted key. `raw` is shown to the caller once and then dropped.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub raw: String,
    pub hash: String,
    pub prefix: String,
}

pub fn generate_api_key(environment: KeyEnvironment) -> GeneratedKey {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let raw = format!("{}{}", environment.prefix(), hex::encode(bytes));

    GeneratedKey {
        hash: hash_api_key(&raw),
        prefix: raw[..DISPLAY_PREFIX_LEN].to_string(),
        raw,
    }
}

/// SHA-256 hex digest of a raw key
pub fn hash_api_key(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Check that a presented credential has the shape of a key for `environment`.
///
/// Does not touch storage; a well-formed key may still be unknown.
pub fn check_key_format(raw: &str, environment: KeyEnvironment) -> Result<()> {
    let secret = raw.strip_prefix(environment.prefix()).ok_or_else(|| {
        GatekeeperError::ValidationError(format!(
            "API key must start with {}",
            environment.prefix()
        ))
    })?;

    if secret.len() != SECRET_BYTES * 2 || !secret.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(GatekeeperError::ValidationError(
            "API key has an invalid secret part".to_string(),
        ));
    }

    Ok(())
}
