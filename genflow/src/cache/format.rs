//! On-disk record encodings for the durable cache.

use crate::errors::CacheError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How durable records are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordFormat {
    /// Human-readable JSON, value base64-encoded.
    #[default]
    Json,
    /// Compact length-prefixed binary.
    Binary,
}

/// One persisted cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DurableRecord {
    pub key: String,
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
    pub created_at: DateTime<Utc>,
    /// 0 means the record never expires.
    pub ttl_ms: u64,
}

const BINARY_MAGIC: &[u8; 4] = b"GFR1";
const BINARY_HEADER_LEN: usize = 4 + 8 + 8 + 4;

impl DurableRecord {
    pub fn new(key: &str, value: Vec<u8>, ttl: Duration) -> Self {
        Self {
            key: key.to_string(),
            value,
            created_at: Utc::now(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        expired_at(self.created_at, self.ttl_ms, now)
    }

    pub fn encode(&self, format: RecordFormat) -> Result<Vec<u8>, CacheError> {
        match format {
            RecordFormat::Json => Ok(serde_json::to_vec(self)?),
            RecordFormat::Binary => {
                let key = self.key.as_bytes();
                let key_len = u32::try_from(key.len())
                    .map_err(|_| CacheError::Serialization("key too long".to_string()))?;
                let mut out = Vec::with_capacity(BINARY_HEADER_LEN + key.len() + self.value.len());
                out.extend_from_slice(BINARY_MAGIC);
                out.extend_from_slice(&self.created_at.timestamp_millis().to_be_bytes());
                out.extend_from_slice(&self.ttl_ms.to_be_bytes());
                out.extend_from_slice(&key_len.to_be_bytes());
                out.extend_from_slice(key);
                out.extend_from_slice(&self.value);
                Ok(out)
            }
        }
    }

    pub fn decode(bytes: &[u8], format: RecordFormat) -> Result<Self, CacheError> {
        match format {
            RecordFormat::Json => Ok(serde_json::from_slice(bytes)?),
            RecordFormat::Binary => decode_binary(bytes),
        }
    }
}

/// True once `now` is past `created_at + ttl_ms`. A zero TTL never expires.
pub(crate) fn expired_at(created_at: DateTime<Utc>, ttl_ms: u64, now: DateTime<Utc>) -> bool {
    if ttl_ms == 0 {
        return false;
    }
    let Some(ttl) = i64::try_from(ttl_ms)
        .ok()
        .and_then(chrono::Duration::try_milliseconds)
    else {
        return false;
    };
    created_at
        .checked_add_signed(ttl)
        .map_or(false, |expires_at| now > expires_at)
}

fn decode_binary(bytes: &[u8]) -> Result<DurableRecord, CacheError> {
    let corrupt = |reason: &str| CacheError::Serialization(format!("binary record: {reason}"));

    if bytes.len() < BINARY_HEADER_LEN || &bytes[..4] != BINARY_MAGIC {
        return Err(corrupt("bad header"));
    }
    let read_u64 = |at: usize| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[at..at + 8]);
        buf
    };
    let created_ms = i64::from_be_bytes(read_u64(4));
    let ttl_ms = u64::from_be_bytes(read_u64(12));
    let mut len_buf = [0u8; 4];
    len_buf.copy_from_slice(&bytes[20..24]);
    let key_len = u32::from_be_bytes(len_buf) as usize;

    let key_end = BINARY_HEADER_LEN
        .checked_add(key_len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| corrupt("key length out of range"))?;
    let key = std::str::from_utf8(&bytes[BINARY_HEADER_LEN..key_end])
        .map_err(|_| corrupt("key is not utf-8"))?
        .to_string();
    let created_at = Utc
        .timestamp_millis_opt(created_ms)
        .single()
        .ok_or_else(|| corrupt("timestamp out of range"))?;

    Ok(DurableRecord {
        key,
        value: bytes[key_end..].to_vec(),
        created_at,
        ttl_ms,
    })
}

pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
