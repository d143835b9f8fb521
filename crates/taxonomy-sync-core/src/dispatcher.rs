use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::encode;
use crate::{MetadataStore, SyncConfig, SyncRole, TaxonomyStore};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TransportError {
    #[error("{0}")]
    Connection(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// Blocking form POST to a remote receiver. Any HTTP response, including error statuses, is
/// returned as `Ok`; only failures to obtain a response are `Err`.
pub trait Transport {
    /// # Errors
    /// Returns an error when no response could be obtained.
    fn post_form(
        &self,
        url: &str,
        fields: &[(&str, &str)],
    ) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// The taxonomy is not synchronized; nothing was sent.
    Skipped,
    Synced { remote_term_id: i64 },
    Failed { error: String },
}

impl DispatchOutcome {
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Sends single terms to the configured slave. One network round trip per term, no retries;
/// failures are captured on the dispatcher for the caller to inspect.
pub struct Dispatcher<'a, T: ?Sized> {
    config: &'a SyncConfig,
    transport: &'a T,
    errors: Vec<String>,
}

impl<'a, T> Dispatcher<'a, T>
where
    T: Transport + ?Sized,
{
    #[must_use]
    pub fn new(config: &'a SyncConfig, transport: &'a T) -> Self {
        Self { config, transport, errors: Vec::new() }
    }

    /// Returns `false` only when a send was attempted and failed.
    pub fn dispatch<S>(
        &mut self,
        store: &S,
        metadata: Option<&dyn MetadataStore>,
        term_id: i64,
        taxonomy: &str,
    ) -> bool
    where
        S: TaxonomyStore + ?Sized,
    {
        !self.dispatch_term(store, metadata, term_id, taxonomy).is_failure()
    }

    pub fn dispatch_term<S>(
        &mut self,
        store: &S,
        metadata: Option<&dyn MetadataStore>,
        term_id: i64,
        taxonomy: &str,
    ) -> DispatchOutcome
    where
        S: TaxonomyStore + ?Sized,
    {
        if !self.config.accepts_taxonomy(taxonomy) {
            debug!(term_id, taxonomy, "taxonomy not synchronized; skipping dispatch");
            return DispatchOutcome::Skipped;
        }

        match self.send(store, metadata, term_id, taxonomy) {
            Ok(remote_term_id) => {
                debug!(term_id, taxonomy, remote_term_id, "term dispatched");
                DispatchOutcome::Synced { remote_term_id }
            }
            Err(error) => {
                warn!(term_id, taxonomy, %error, "term dispatch failed");
                self.errors.push(error.clone());
                DispatchOutcome::Failed { error }
            }
        }
    }

    fn send<S>(
        &self,
        store: &S,
        metadata: Option<&dyn MetadataStore>,
        term_id: i64,
        taxonomy: &str,
    ) -> Result<i64, String>
    where
        S: TaxonomyStore + ?Sized,
    {
        if self.config.role != SyncRole::Master {
            return Err("this site is not configured as the master site".to_string());
        }
        let url = self
            .config
            .receive_url()
            .ok_or_else(|| "no remote URL is defined for the slave site".to_string())?;

        let term = store
            .get_term(term_id, taxonomy)
            .map_err(|err| format!("failed to load term {term_id}: {err}"))?
            .ok_or_else(|| format!("term {term_id} not found in taxonomy {taxonomy}"))?;

        let term_meta = match metadata {
            Some(metadata) => Some(
                metadata
                    .get_metadata(term_id)
                    .map_err(|err| format!("failed to load metadata for term {term_id}: {err}"))?,
            ),
            None => None,
        };

        let payload = encode(&term, &self.config.shared_key, term_meta.as_ref())
            .map_err(|err| format!("failed to encode term {term_id}: {err}"))?;

        let response =
            self.transport.post_form(&url, &payload.form_fields()).map_err(|err| err.to_string())?;

        match response.body.trim().parse::<i64>() {
            Ok(remote_term_id) => Ok(remote_term_id),
            Err(_) if response.body.trim().is_empty() => {
                Err(format!("empty response from slave site (HTTP {})", response.status))
            }
            Err(_) => Err(response.body),
        }
    }

    #[must_use]
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Remove and return the oldest captured error.
    pub fn take_error(&mut self) -> Option<String> {
        if self.errors.is_empty() {
            None
        } else {
            Some(self.errors.remove(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_term;
    use crate::test_support::{term, MemoryMeta, MemoryStore, ScriptedTransport};

    fn master_config() -> SyncConfig {
        SyncConfig::new(
            SyncRole::Master,
            "s3cret",
            Some("https://slave.example".to_string()),
            vec!["genre".to_string()],
        )
    }

    // Test IDs: TDSP-001
    #[test]
    fn dispatch_posts_encoded_term_and_accepts_numeric_body() {
        let mut store = MemoryStore::new();
        store.seed(term(7, "genre", "Jazz", None));
        let transport = ScriptedTransport::with_responses([ScriptedTransport::ok("42")]);
        let config = master_config();
        let mut dispatcher = Dispatcher::new(&config, &transport);

        let outcome = dispatcher.dispatch_term(&store, None, 7, "genre");
        assert_eq!(outcome, DispatchOutcome::Synced { remote_term_id: 42 });
        assert!(dispatcher.errors().is_empty());

        let requests = transport.requests.borrow();
        assert_eq!(requests.len(), 1);
        let (url, fields) = &requests[0];
        assert_eq!(url, "https://slave.example/taxonomy_sync_receive_term");
        assert_eq!(fields.get("key").map(String::as_str), Some("s3cret"));
        assert_eq!(fields.get("taxonomy").map(String::as_str), Some("genre"));
        assert!(!fields.contains_key("term_meta"));
        let sent = decode_term(fields.get("term").map(String::as_str));
        assert_eq!(sent, Ok(term(7, "genre", "Jazz", None)));
    }

    // Test IDs: TDSP-002
    #[test]
    fn unsynchronized_taxonomy_is_a_silent_no_op() {
        let mut store = MemoryStore::new();
        store.seed(term(3, "post_tag", "Loud", None));
        let transport = ScriptedTransport::default();
        let config = master_config();
        let mut dispatcher = Dispatcher::new(&config, &transport);

        assert!(dispatcher.dispatch(&store, None, 3, "post_tag"));
        assert!(transport.requests.borrow().is_empty());
        assert!(dispatcher.errors().is_empty());
    }

    // Test IDs: TDSP-003
    #[test]
    fn non_numeric_body_and_transport_errors_are_captured() {
        let mut store = MemoryStore::new();
        store.seed(term(7, "genre", "Jazz", None));
        let transport = ScriptedTransport::with_responses([
            Ok(TransportResponse { status: 403, body: "Invalid key specified".to_string() }),
            Err(TransportError::Connection("connection refused".to_string())),
            Ok(TransportResponse { status: 500, body: "  ".to_string() }),
        ]);
        let config = master_config();
        let mut dispatcher = Dispatcher::new(&config, &transport);

        assert!(!dispatcher.dispatch(&store, None, 7, "genre"));
        assert!(!dispatcher.dispatch(&store, None, 7, "genre"));
        assert!(!dispatcher.dispatch(&store, None, 7, "genre"));
        assert_eq!(dispatcher.errors().len(), 3);
        assert_eq!(dispatcher.take_error().as_deref(), Some("Invalid key specified"));
        assert_eq!(dispatcher.take_error().as_deref(), Some("connection refused"));
        assert_eq!(
            dispatcher.take_error().as_deref(),
            Some("empty response from slave site (HTTP 500)")
        );
        assert_eq!(dispatcher.take_error(), None);
    }

    // Test IDs: TDSP-004
    #[test]
    fn dispatch_attaches_metadata_when_collaborator_reports_values() {
        let mut store = MemoryStore::new();
        store.seed(term(7, "genre", "Jazz", None));
        let mut meta = MemoryMeta::default();
        meta.values.entry(7).or_default().insert("color".to_string(), "blue".to_string());
        let transport = ScriptedTransport::with_responses([ScriptedTransport::ok("42")]);
        let config = master_config();
        let mut dispatcher = Dispatcher::new(&config, &transport);

        assert!(dispatcher.dispatch(&store, Some(&meta), 7, "genre"));
        let requests = transport.requests.borrow();
        assert_eq!(
            requests[0].1.get("term_meta").map(String::as_str),
            Some(r#"{"color":"blue"}"#)
        );
    }

    // Test IDs: TDSP-005
    #[test]
    fn missing_term_and_misconfiguration_fail_without_network() {
        let store = MemoryStore::new();
        let transport = ScriptedTransport::default();
        let config = master_config();
        let mut dispatcher = Dispatcher::new(&config, &transport);
        assert!(!dispatcher.dispatch(&store, None, 99, "genre"));
        assert_eq!(
            dispatcher.take_error().as_deref(),
            Some("term 99 not found in taxonomy genre")
        );

        let slave = SyncConfig::new(SyncRole::Slave, "k", None, vec!["genre".to_string()]);
        let mut dispatcher = Dispatcher::new(&slave, &transport);
        assert!(!dispatcher.dispatch(&store, None, 99, "genre"));
        assert!(transport.requests.borrow().is_empty());
    }
}
