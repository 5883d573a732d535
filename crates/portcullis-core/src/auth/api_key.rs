use crate::limit::RateLimitAlgorithm;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Lifecycle status of an API key. Only `active` keys authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    #[default]
    Active,
    Disabled,
    Revoked,
}

impl KeyStatus {
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "disabled" => Some(Self::Disabled),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
            Self::Revoked => "revoked",
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tenant owning one or more API keys. An inactive tenant fails all
/// authentications for its keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub is_active: bool,
}

/// Opaque bearer credential issued to a tenant.
///
/// Only the lookup hash is stored (`hex(SHA-256(secret))`); the plaintext
/// secret exists once, at issue time. The hash doubles as the authentication
/// index: presented bearers are hashed and matched in O(1) against the
/// config catalog. Keys here are 248-bit random strings, so a fast digest is
/// the appropriate one-way function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub tenant_id: String,
    /// `hex(SHA-256(secret))`; unique across all keys.
    pub hashed_secret: String,
    /// First characters of the plaintext secret, kept for display only.
    pub prefix: String,
    pub status: KeyStatus,
    /// Per-key rate override; `None` falls back to `DEFAULT_RATE_LIMIT_RPS`.
    pub rate_limit_rps: Option<f64>,
    /// Per-key burst override; `None` falls back to `DEFAULT_RATE_LIMIT_BURST`.
    pub rate_limit_burst: Option<u32>,
    pub rate_limit_algorithm: RateLimitAlgorithm,
    /// Daily request quota; `0` means unlimited.
    pub quota_daily: i64,
    /// Monthly request quota; `0` means unlimited.
    pub quota_monthly: i64,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    const SECRET_PREFIX: &'static str = "pc_";
    const SECRET_RANDOM_LEN: usize = 32;
    const DISPLAY_PREFIX_LEN: usize = 12;

    /// Generates a new plaintext secret with the `pc_` prefix.
    ///
    /// Rejection sampling keeps the alphanumeric distribution uniform;
    /// a plain modulo would bias the first `256 % 62` characters.
    #[must_use]
    pub fn generate_secret() -> String {
        const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        const MAX_UNBIASED: u8 = (256 / CHARSET.len() * CHARSET.len() - 1) as u8;

        let mut rng = rand::thread_rng();
        let mut secret = String::with_capacity(Self::SECRET_PREFIX.len() + Self::SECRET_RANDOM_LEN);
        secret.push_str(Self::SECRET_PREFIX);

        while secret.len() < Self::SECRET_PREFIX.len() + Self::SECRET_RANDOM_LEN {
            let byte: u8 = rng.gen();
            if byte <= MAX_UNBIASED {
                secret.push(CHARSET[byte as usize % CHARSET.len()] as char);
            }
        }

        secret
    }

    /// Computes the stored lookup hash for a presented secret.
    #[must_use]
    pub fn hash_secret(secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Display prefix recorded alongside the hash at issue time.
    #[must_use]
    pub fn display_prefix(secret: &str) -> String {
        secret.chars().take(Self::DISPLAY_PREFIX_LEN).collect()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == KeyStatus::Active
    }
}

/// Why a key was soft-blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    RateSpike,
    ErrorRateSpike,
    Manual,
}

impl BlockReason {
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "rate_spike" => Some(Self::RateSpike),
            "error_rate_spike" => Some(Self::ErrorRateSpike),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateSpike => "rate_spike",
            Self::ErrorRateSpike => "error_rate_spike",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted record of a soft block, for the admin surface and audits.
/// The live gate is the TTL'd `abuse:block:<key>` entry in the KV store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedKeyRecord {
    pub api_key_id: String,
    pub reason: BlockReason,
    pub anomaly_score: f64,
    pub blocked_at: DateTime<Utc>,
    pub blocked_until: Option<DateTime<Utc>>,
    pub is_active: bool,
}
