use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use taxonomy_sync_core::{ConfigNotice, SyncConfig, SyncRole};
use tracing::debug;

const FINGERPRINT_HEX_LEN: usize = 12;

/// Read the YAML settings file. A missing or blank file yields the defaults.
///
/// # Errors
/// Returns an error when the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<SyncConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config file not found; using defaults");
        return Ok(SyncConfig::default());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(SyncConfig::default());
    }

    serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Short SHA-256 fingerprint of the shared key, for display in place of the key itself.
#[must_use]
pub fn key_fingerprint(key: &str) -> Option<String> {
    if key.is_empty() {
        return None;
    }
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    Some(digest[..FINGERPRINT_HEX_LEN].to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoticeView {
    pub code: ConfigNotice,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigSummary {
    pub role: SyncRole,
    pub key_fingerprint: Option<String>,
    pub remote_endpoint: Option<String>,
    pub receive_url: Option<String>,
    pub synchronized_taxonomies: Vec<String>,
    pub term_meta: bool,
    pub ready: bool,
    pub notices: Vec<NoticeView>,
}

impl ConfigSummary {
    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            role: config.role,
            key_fingerprint: key_fingerprint(&config.shared_key),
            remote_endpoint: config.remote_endpoint().map(ToString::to_string),
            receive_url: config.receive_url(),
            synchronized_taxonomies: config.synchronized_taxonomies.clone(),
            term_meta: config.term_meta,
            ready: config.is_ready(),
            notices: notice_views(config),
        }
    }
}

#[must_use]
pub fn notice_views(config: &SyncConfig) -> Vec<NoticeView> {
    config
        .notices()
        .into_iter()
        .map(|code| NoticeView { code, message: code.message().to_string() })
        .collect()
}
