//! Pre-shared-key challenge signatures.
//!
//! The dialing side signs the nonce it received in the connect descriptor:
//!
//! ```text
//! mac  = HMAC-SHA256(secret, date || 0x00 || base64_unpadded(nonce))
//! blob = base64_unpadded(be32(key_id) || mac)
//! ```
//!
//! `date` and `blob` travel as the SOCKS5 username and password.

use std::collections::HashMap;
use std::fmt;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use ring::hmac;
use serde::{Deserialize, Serialize};

use crate::error::{TunnelError, TunnelResult};

/// Maximum distance, in seconds, between the signed date and the validator's clock.
pub const CLOCK_TOLERANCE_SECS: i64 = 15 * 60;

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";
const RFC850_DATE: &str = "%A, %d-%b-%y %H:%M:%S GMT";
const ASCTIME_DATE: &str = "%a %b %e %H:%M:%S %Y";

/// A pre-shared key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    #[serde(rename = "kid")]
    pub key_id: u32,
    #[serde(rename = "data", with = "secret_base64")]
    pub secret: Vec<u8>,
}

impl Key {
    pub fn new(key_id: u32, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            key_id,
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("key_id", &self.key_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Keys accepted by a server, indexed by key id. Read-only once built.
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    keys: HashMap<u32, Key>,
}

impl KeyRing {
    /// Build a key ring, rejecting duplicate key ids.
    pub fn new(keys: impl IntoIterator<Item = Key>) -> TunnelResult<Self> {
        let mut map = HashMap::new();
        for key in keys {
            let id = key.key_id;
            if map.insert(id, key).is_some() {
                return Err(TunnelError::Config(format!("duplicate key id: {id}")));
            }
        }
        Ok(Self { keys: map })
    }

    pub fn get(&self, key_id: u32) -> Option<&Key> {
        self.keys.get(&key_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// A signed challenge, ready to be carried as SOCKS5 credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// HTTP date, sent as the username.
    pub date: String,
    /// Unpadded base64 blob, sent as the password.
    pub blob: String,
}

/// Sign `nonce` with `key` at the current time.
pub fn sign(key: &Key, nonce: &[u8]) -> Signature {
    sign_at(key, nonce, Utc::now())
}

pub fn sign_at(key: &Key, nonce: &[u8], now: DateTime<Utc>) -> Signature {
    let date = now.format(HTTP_DATE).to_string();
    let tag = compute_mac(&key.secret, &date, nonce);

    let mut raw = Vec::with_capacity(4 + tag.as_ref().len());
    raw.extend_from_slice(&key.key_id.to_be_bytes());
    raw.extend_from_slice(tag.as_ref());

    Signature {
        date,
        blob: STANDARD_NO_PAD.encode(raw),
    }
}

/// Validate a signature against this connection's nonce at the current time.
pub fn validate(keys: &KeyRing, nonce: &[u8], date: &str, blob: &str) -> TunnelResult<u32> {
    validate_at(keys, nonce, date, blob, Utc::now())
}

/// Returns the key id that produced the signature.
///
/// Order of checks: blob decoding, key lookup, date parsing and clock
/// tolerance, then a constant-time MAC comparison.
pub fn validate_at(
    keys: &KeyRing,
    nonce: &[u8],
    date: &str,
    blob: &str,
    now: DateTime<Utc>,
) -> TunnelResult<u32> {
    let raw = STANDARD_NO_PAD
        .decode(blob)
        .map_err(|e| TunnelError::Auth(format!("signature is not valid base64: {e}")))?;
    if raw.len() < 4 {
        return Err(TunnelError::Auth(format!(
            "signature too short: {} bytes",
            raw.len()
        )));
    }

    let key_id = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let key = keys
        .get(key_id)
        .ok_or_else(|| TunnelError::Auth(format!("unknown key id: {key_id}")))?;

    let signed_at = parse_http_date(date)?;
    let skew = (now - signed_at).abs();
    if skew > TimeDelta::seconds(CLOCK_TOLERANCE_SECS) {
        return Err(TunnelError::Auth(format!(
            "signature date outside tolerance: skew {}s",
            skew.num_seconds()
        )));
    }

    let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, &key.secret);
    hmac::verify(&hmac_key, &signed_content(date, nonce), &raw[4..])
        .map_err(|_| TunnelError::Auth(format!("invalid signature for key id {key_id}")))?;

    Ok(key_id)
}

/// Parse any of the three HTTP date formats (IMF-fixdate, RFC 850, asctime).
pub fn parse_http_date(date: &str) -> TunnelResult<DateTime<Utc>> {
    [HTTP_DATE, RFC850_DATE, ASCTIME_DATE]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(date, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| TunnelError::Auth(format!("unparseable date: {date:?}")))
}

fn signed_content(date: &str, nonce: &[u8]) -> Vec<u8> {
    let challenge = STANDARD_NO_PAD.encode(nonce);
    let mut data = Vec::with_capacity(date.len() + 1 + challenge.len());
    data.extend_from_slice(date.as_bytes());
    data.push(0);
    data.extend_from_slice(challenge.as_bytes());
    data
}

fn compute_mac(secret: &[u8], date: &str, nonce: &[u8]) -> hmac::Tag {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::sign(&key, &signed_content(date, nonce))
}

/// Secrets are standard (padded) base64 in config and env.
mod secret_base64 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.trim())
            .map_err(serde::de::Error::custom)
    }
}
