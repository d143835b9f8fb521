use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Formatter};

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

pub mod codec;
pub mod dispatcher;
pub mod orchestrator;
pub mod receiver;

pub use codec::{decode_metadata, decode_term, encode, DecodeError, WirePayload};
pub use dispatcher::{DispatchOutcome, Dispatcher, Transport, TransportError, TransportResponse};
pub use orchestrator::{run_full_sync, FullSyncError, FullSyncReport, SyncStatus};
pub use receiver::{receive_term, ReceiveAction, ReceiveError, ReceiveOutcome, ReceiveRequest};

/// Path segment the slave exposes for incoming terms.
pub const SYNC_PATH: &str = "taxonomy_sync_receive_term";

pub const REQUEST_TIMEOUT_SECS: u64 = 45;
pub const MAX_REDIRECTS: u32 = 5;

pub type TermMeta = BTreeMap<String, String>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SyncError {
    #[error("{0}")]
    Store(String),
    #[error("identity conflict: {0}")]
    IdentityConflict(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Term {
    pub term_id: i64,
    pub taxonomy: String,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub parent: Option<i64>,
}

/// Fields a store accepts when creating or editing a term.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TermArgs {
    pub name: String,
    pub slug: String,
    pub description: String,
    pub parent: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TermWriteResult {
    pub term_id: i64,
    pub term_taxonomy_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaxonomyDescriptor {
    pub name: String,
    pub label: String,
    pub public: bool,
    pub show_ui: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaxonomyFilter {
    pub public: Option<bool>,
    pub show_ui: Option<bool>,
}

impl TaxonomyFilter {
    /// Taxonomies an administrator can pick for synchronization.
    #[must_use]
    pub fn selectable() -> Self {
        Self { public: Some(true), show_ui: Some(true) }
    }

    #[must_use]
    pub fn matches(&self, descriptor: &TaxonomyDescriptor) -> bool {
        self.public.map_or(true, |public| public == descriptor.public)
            && self.show_ui.map_or(true, |show_ui| show_ui == descriptor.show_ui)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncRole {
    #[default]
    #[serde(alias = "")]
    Unset,
    Master,
    Slave,
}

impl SyncRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Master => "master",
            Self::Slave => "slave",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" | "unset" => Some(Self::Unset),
            "master" => Some(Self::Master),
            "slave" => Some(Self::Slave),
            _ => None,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SyncConfig {
    pub role: SyncRole,
    pub shared_key: String,
    pub remote_endpoint: Option<String>,
    #[serde(deserialize_with = "deserialize_taxonomy_set")]
    pub synchronized_taxonomies: Vec<String>,
    pub term_meta: bool,
}

impl Debug for SyncConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("role", &self.role)
            .field("shared_key", &if self.shared_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("remote_endpoint", &self.remote_endpoint)
            .field("synchronized_taxonomies", &self.synchronized_taxonomies)
            .field("term_meta", &self.term_meta)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConfigNotice {
    MissingSharedKey,
    MissingRole,
    MissingRemoteEndpoint,
    NoTaxonomies,
}

impl ConfigNotice {
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::MissingSharedKey => concat!(
                "You have not entered the required settings for Taxonomy Sync: ",
                "the shared key is empty."
            ),
            Self::MissingRole => {
                "You have not entered the required settings for Taxonomy Sync: the mode is not set."
            }
            Self::MissingRemoteEndpoint => {
                "The master site has no remote URL configured; terms will not be sent anywhere."
            }
            Self::NoTaxonomies => {
                "No taxonomies are selected; no errors will occur but nothing will be synchronized."
            }
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn new(
        role: SyncRole,
        shared_key: impl Into<String>,
        remote_endpoint: Option<String>,
        taxonomies: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            role,
            shared_key: shared_key.into(),
            remote_endpoint: remote_endpoint.filter(|endpoint| !endpoint.trim().is_empty()),
            synchronized_taxonomies: normalize_taxonomies(taxonomies),
            term_meta: false,
        }
    }

    #[must_use]
    pub fn with_term_meta(mut self, enabled: bool) -> Self {
        self.term_meta = enabled;
        self
    }

    #[must_use]
    pub fn accepts_taxonomy(&self, taxonomy: &str) -> bool {
        self.synchronized_taxonomies.iter().any(|candidate| candidate == taxonomy)
    }

    /// Role and taxonomy set are both present.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.role != SyncRole::Unset && !self.synchronized_taxonomies.is_empty()
    }

    #[must_use]
    pub fn remote_endpoint(&self) -> Option<&str> {
        self.remote_endpoint.as_deref().map(str::trim).filter(|endpoint| !endpoint.is_empty())
    }

    #[must_use]
    pub fn receive_url(&self) -> Option<String> {
        self.remote_endpoint()
            .map(|endpoint| format!("{}/{SYNC_PATH}", endpoint.trim_end_matches('/')))
    }

    /// Compare a presented key against the configured one. An empty configured key never matches.
    #[must_use]
    pub fn key_matches(&self, presented: &str) -> bool {
        if self.shared_key.is_empty() {
            return false;
        }
        let expected = Sha256::digest(self.shared_key.as_bytes());
        let actual = Sha256::digest(presented.as_bytes());
        expected
            .iter()
            .zip(actual.iter())
            .fold(0_u8, |acc, (left, right)| acc | (left ^ right))
            == 0
    }

    #[must_use]
    pub fn notices(&self) -> Vec<ConfigNotice> {
        let mut notices = Vec::new();
        if self.shared_key.is_empty() {
            notices.push(ConfigNotice::MissingSharedKey);
        }
        if self.role == SyncRole::Unset {
            notices.push(ConfigNotice::MissingRole);
        }
        if self.role == SyncRole::Master && self.remote_endpoint().is_none() {
            notices.push(ConfigNotice::MissingRemoteEndpoint);
        }
        if self.synchronized_taxonomies.is_empty() {
            notices.push(ConfigNotice::NoTaxonomies);
        }
        notices
    }
}

/// Trim, drop blanks and duplicates, keep first-seen order.
#[must_use]
pub fn normalize_taxonomies(values: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    values
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty() && seen.insert(value.clone()))
        .collect()
}

fn deserialize_taxonomy_set<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    let values = match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
    };
    Ok(normalize_taxonomies(values))
}

/// Local term storage the sync protocol reads from and writes through.
pub trait TaxonomyStore {
    /// # Errors
    /// Returns an error when the backing store cannot be read.
    fn get_term(&self, term_id: i64, taxonomy: &str) -> Result<Option<Term>, SyncError>;

    /// # Errors
    /// Returns the store's own message when the term is rejected or cannot be written.
    fn insert_term(&mut self, taxonomy: &str, args: &TermArgs)
        -> Result<TermWriteResult, SyncError>;

    /// # Errors
    /// Returns the store's own message when the term is missing, rejected, or cannot be written.
    fn update_term(
        &mut self,
        term_id: i64,
        taxonomy: &str,
        args: &TermArgs,
    ) -> Result<TermWriteResult, SyncError>;

    /// Every term of `taxonomy`, including terms with no attached content.
    ///
    /// # Errors
    /// Returns an error when the backing store cannot be read.
    fn list_terms(&self, taxonomy: &str) -> Result<Vec<Term>, SyncError>;

    /// # Errors
    /// Returns an error when the backing store cannot be read.
    fn list_taxonomies(&self, filter: TaxonomyFilter)
        -> Result<Vec<TaxonomyDescriptor>, SyncError>;
}

/// Master term id to local term id association.
pub trait IdentityMapper {
    /// # Errors
    /// Returns an error when the backing store cannot be read.
    fn resolve_local_id(&self, master_id: i64) -> Result<Option<i64>, SyncError>;

    /// Bind `local_id` to `master_id` once. Recording an identical pair again is a no-op.
    ///
    /// # Errors
    /// Returns `SyncError::IdentityConflict` when either side is already bound elsewhere.
    fn record_identity(&mut self, local_id: i64, master_id: i64) -> Result<(), SyncError>;

    /// Create the local mirror of `master_id` and bind it. Stores that can should do both in
    /// one unit so a failed binding never leaves an unmapped term behind.
    ///
    /// # Errors
    /// Returns the store's message when the term is rejected, or
    /// `SyncError::IdentityConflict` when `master_id` is already mirrored.
    fn insert_mirrored_term(
        &mut self,
        master_id: i64,
        taxonomy: &str,
        args: &TermArgs,
    ) -> Result<TermWriteResult, SyncError>
    where
        Self: TaxonomyStore,
    {
        let written = self.insert_term(taxonomy, args)?;
        self.record_identity(written.term_id, master_id)?;
        Ok(written)
    }
}

pub trait MetadataStore {
    /// # Errors
    /// Returns an error when the backing store cannot be read.
    fn get_metadata(&self, term_id: i64) -> Result<TermMeta, SyncError>;

    /// # Errors
    /// Returns an error when the value cannot be written.
    fn set_metadata(&mut self, term_id: i64, key: &str, value: &str) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TermEvent {
    pub term_id: i64,
    pub term_taxonomy_id: i64,
    pub taxonomy: String,
}

/// Extension points fired by the receiver after a successful mutation.
pub trait TermHooks {
    fn term_created(&mut self, _event: &TermEvent) {}

    fn term_edited(&mut self, _event: &TermEvent) {}

    fn filter_meta_value(&mut self, _key: &str, value: String) -> String {
        value
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl TermHooks for NoopHooks {}


#[cfg(test)]
mod tests {
    use super::*;

    // Test IDs: TCFG-001
    #[test]
    fn config_taxonomies_accept_single_string_and_dedupe_lists() {
        let single: SyncConfig = match serde_json::from_str(
            r#"{"role":"slave","shared_key":"k","synchronized_taxonomies":"genre"}"#,
        ) {
            Ok(config) => config,
            Err(err) => panic!("single taxonomy config should parse: {err}"),
        };
        assert_eq!(single.synchronized_taxonomies, vec!["genre".to_string()]);

        let many: SyncConfig = match serde_json::from_str(
            r#"{"role":"master","synchronized_taxonomies":["genre"," mood ","genre",""]}"#,
        ) {
            Ok(config) => config,
            Err(err) => panic!("taxonomy list config should parse: {err}"),
        };
        assert_eq!(many.synchronized_taxonomies, vec!["genre".to_string(), "mood".to_string()]);
    }

    // Test IDs: TCFG-002
    #[test]
    fn config_defaults_and_unknown_keys_are_tolerated() {
        let config: SyncConfig =
            match serde_json::from_str(r#"{"mode_legacy":"x","initial_sync":false,"role":""}"#) {
                Ok(config) => config,
                Err(err) => panic!("config with unknown keys should parse: {err}"),
            };
        assert_eq!(config.role, SyncRole::Unset);
        assert!(!config.is_ready());
        assert_eq!(
            config.notices(),
            vec![
                ConfigNotice::MissingSharedKey,
                ConfigNotice::MissingRole,
                ConfigNotice::NoTaxonomies
            ]
        );
    }

    // Test IDs: TCFG-003
    #[test]
    fn empty_configured_key_never_matches() {
        let config = SyncConfig::new(SyncRole::Slave, "", None, vec!["genre".to_string()]);
        assert!(!config.key_matches(""));

        let config = SyncConfig::new(SyncRole::Slave, "s3cret", None, vec!["genre".to_string()]);
        assert!(config.key_matches("s3cret"));
        assert!(!config.key_matches("s3cre"));
        assert!(!config.key_matches("s3cret "));
    }

    // Test IDs: TCFG-004
    #[test]
    fn receive_url_joins_endpoint_and_sync_path() {
        let config = SyncConfig::new(
            SyncRole::Master,
            "k",
            Some("https://slave.example/".to_string()),
            vec!["genre".to_string()],
        );
        assert_eq!(
            config.receive_url().as_deref(),
            Some("https://slave.example/taxonomy_sync_receive_term")
        );
        assert!(SyncConfig::new(SyncRole::Master, "k", Some("  ".to_string()), Vec::new())
            .receive_url()
            .is_none());
    }

    // Test IDs: TCFG-005
    #[test]
    fn debug_output_redacts_shared_key() {
        let config = SyncConfig::new(SyncRole::Master, "topsecret", None, Vec::new());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("topsecret"));
        assert!(rendered.contains("<redacted>"));
    }

    // Test IDs: TCFG-006
    #[test]
    fn taxonomy_filter_matches_selectable_descriptors() {
        let visible = TaxonomyDescriptor {
            name: "genre".to_string(),
            label: "Genre".to_string(),
            public: true,
            show_ui: true,
        };
        let hidden = TaxonomyDescriptor { show_ui: false, ..visible.clone() };
        assert!(TaxonomyFilter::selectable().matches(&visible));
        assert!(!TaxonomyFilter::selectable().matches(&hidden));
        assert!(TaxonomyFilter::default().matches(&hidden));
    }
}
