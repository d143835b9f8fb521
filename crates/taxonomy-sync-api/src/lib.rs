use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use taxonomy_sync_core::{
    receive_term, run_full_sync, DispatchOutcome, Dispatcher, FullSyncReport, MetadataStore,
    ReceiveError, ReceiveOutcome, ReceiveRequest, SyncConfig, SyncError, SyncRole,
    TaxonomyDescriptor, TaxonomyFilter, Term, TermArgs, TermEvent, TermHooks, TermMeta,
    Transport,
};
use taxonomy_sync_store_sqlite::{
    IdentityRecord, SchemaStatus, SqliteStore, SqliteTermMetaStore, SyncEvent, SyncEventKind,
};
use tracing::{debug, warn};

mod config;
mod logging;
mod transport;

pub use config::{key_fingerprint, load_config, notice_views, ConfigSummary, NoticeView};
pub use logging::init_logging;
pub use transport::HttpTransport;

pub const API_CONTRACT_VERSION: &str = "taxonomy-sync.api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// A local create or edit, plus the outbound sync it triggered on a master site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TermMutation {
    pub term: Term,
    pub term_taxonomy_id: i64,
    pub dispatch: Option<DispatchOutcome>,
}

/// HTTP status a receiver failure is reported with.
#[must_use]
pub fn receive_error_status(err: &ReceiveError) -> u16 {
    match err {
        ReceiveError::InvalidKey => 403,
        ReceiveError::NotReceiving => 404,
        ReceiveError::TaxonomyNotAccepted
        | ReceiveError::TermMissing
        | ReceiveError::TermInvalid(_) => 422,
        ReceiveError::Store(_) => 500,
    }
}

/// Collects receiver notifications so they can be written to the event log once the
/// mutation has completed.
#[derive(Debug, Default)]
struct RecordingHooks {
    events: Vec<(SyncEventKind, TermEvent)>,
}

impl TermHooks for RecordingHooks {
    fn term_created(&mut self, event: &TermEvent) {
        self.events.push((SyncEventKind::Created, event.clone()));
    }

    fn term_edited(&mut self, event: &TermEvent) {
        self.events.push((SyncEventKind::Edited, event.clone()));
    }
}

#[derive(Clone)]
pub struct TaxonomySyncApi {
    db_path: PathBuf,
    config: SyncConfig,
    transport: Arc<dyn Transport + Send + Sync>,
}

impl TaxonomySyncApi {
    #[must_use]
    pub fn new(db_path: PathBuf, config: SyncConfig) -> Self {
        Self { db_path, config, transport: Arc::new(HttpTransport::new()) }
    }

    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport + Send + Sync>) -> Self {
        self.transport = transport;
        self
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    fn open_meta(&self) -> Result<Option<SqliteTermMetaStore>> {
        if self.config.term_meta {
            Ok(Some(SqliteTermMetaStore::open(&self.db_path)?))
        } else {
            Ok(None)
        }
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = SqliteStore::open(&self.db_path)?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;

        if dry_run {
            return Ok(MigrateResult {
                dry_run,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when the taxonomy cannot be written.
    pub fn register_taxonomy(&self, descriptor: &TaxonomyDescriptor) -> Result<()> {
        let mut store = self.open_store()?;
        store.register_taxonomy(descriptor)
    }

    /// # Errors
    /// Returns an error when taxonomies cannot be read.
    pub fn list_taxonomies(&self, filter: TaxonomyFilter) -> Result<Vec<TaxonomyDescriptor>> {
        let store = self.open_store()?;
        store.taxonomies(filter)
    }

    /// Create a local term. On a master site the new term is dispatched to the slave
    /// immediately; a failed dispatch does not undo the local write.
    ///
    /// # Errors
    /// Returns an error when the store rejects the term.
    pub fn create_term(&self, taxonomy: &str, args: &TermArgs) -> Result<TermMutation> {
        let mut store = self.open_store()?;
        let written = store.create_term(taxonomy, args)?;
        self.finish_mutation(&store, written.term_id, written.term_taxonomy_id, taxonomy)
    }

    /// Edit a local term in place, dispatching it afterwards on a master site.
    ///
    /// # Errors
    /// Returns an error when the term does not exist or the store rejects the edit.
    pub fn update_term(
        &self,
        term_id: i64,
        taxonomy: &str,
        args: &TermArgs,
    ) -> Result<TermMutation> {
        let mut store = self.open_store()?;
        let written = store.edit_term(term_id, taxonomy, args)?;
        self.finish_mutation(&store, written.term_id, written.term_taxonomy_id, taxonomy)
    }

    fn finish_mutation(
        &self,
        store: &SqliteStore,
        term_id: i64,
        term_taxonomy_id: i64,
        taxonomy: &str,
    ) -> Result<TermMutation> {
        let term = store
            .term(term_id, taxonomy)?
            .ok_or_else(|| anyhow!("term {term_id} vanished after write"))?;

        let dispatch = if self.config.role == SyncRole::Master {
            Some(self.dispatch_with(store, term_id, taxonomy)?)
        } else {
            None
        };

        Ok(TermMutation { term, term_taxonomy_id, dispatch })
    }

    fn dispatch_with(
        &self,
        store: &SqliteStore,
        term_id: i64,
        taxonomy: &str,
    ) -> Result<DispatchOutcome> {
        let meta = self.open_meta()?;
        let mut dispatcher = Dispatcher::new(&self.config, self.transport.as_ref());
        Ok(dispatcher.dispatch_term(
            store,
            meta.as_ref().map(|meta| meta as &dyn MetadataStore),
            term_id,
            taxonomy,
        ))
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_term(&self, term_id: i64, taxonomy: &str) -> Result<Option<Term>> {
        let store = self.open_store()?;
        store.term(term_id, taxonomy)
    }

    /// # Errors
    /// Returns an error when terms cannot be read.
    pub fn list_terms(&self, taxonomy: &str) -> Result<Vec<Term>> {
        let store = self.open_store()?;
        store.terms_in(taxonomy)
    }

    /// Store one metadata value and return the term's full metadata map.
    ///
    /// # Errors
    /// Returns an error when the term does not exist or the value cannot be written.
    pub fn set_term_meta(&self, term_id: i64, key: &str, value: &str) -> Result<TermMeta> {
        drop(self.open_store()?);
        let mut meta = SqliteTermMetaStore::open(&self.db_path)?;
        meta.put(term_id, key, value)?;
        meta.values(term_id)
    }

    /// # Errors
    /// Returns an error when metadata cannot be read.
    pub fn term_meta(&self, term_id: i64) -> Result<TermMeta> {
        drop(self.open_store()?);
        SqliteTermMetaStore::open(&self.db_path)?.values(term_id)
    }

    /// Send one term to the slave regardless of how it was last changed.
    ///
    /// # Errors
    /// Returns an error when the local store cannot be opened; dispatch failures are reported
    /// in the outcome.
    pub fn sync_term(&self, term_id: i64, taxonomy: &str) -> Result<DispatchOutcome> {
        let store = self.open_store()?;
        self.dispatch_with(&store, term_id, taxonomy)
    }

    /// Run a full synchronization of every configured taxonomy.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened, or a
    /// `taxonomy_sync_core::FullSyncError` when a precondition fails.
    pub fn full_sync(&self) -> Result<FullSyncReport> {
        let store = self.open_store()?;
        let meta = self.open_meta()?;
        let report = run_full_sync(
            &self.config,
            &store,
            meta.as_ref().map(|meta| meta as &dyn MetadataStore),
            self.transport.as_ref(),
        )?;
        Ok(report)
    }

    /// Apply a term received from the master and log the resulting notifications.
    ///
    /// # Errors
    /// Returns the receiver's terminal error; database failures surface as
    /// `ReceiveError::Store`.
    pub fn receive(&self, request: &ReceiveRequest) -> Result<ReceiveOutcome, ReceiveError> {
        if !self.config.key_matches(request.key.as_deref().unwrap_or_default()) {
            debug!("rejecting term before opening the store: key mismatch");
            return Err(ReceiveError::InvalidKey);
        }

        let mut store = self.open_store().map_err(store_failure)?;
        let mut meta = self.open_meta().map_err(store_failure)?;
        let mut hooks = RecordingHooks::default();

        let outcome = receive_term(
            &self.config,
            &mut store,
            meta.as_mut().map(|meta| meta as &mut dyn MetadataStore),
            &mut hooks,
            request,
        )?;

        for (kind, event) in &hooks.events {
            if let Err(err) = store.append_event(*kind, event) {
                warn!(
                    term_id = event.term_id,
                    error = %format!("{err:#}"),
                    "failed to log sync event"
                );
            }
        }
        Ok(outcome)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn resolve_identity(&self, master_term_id: i64) -> Result<Option<i64>> {
        let store = self.open_store()?;
        store.local_id_for_master(master_term_id)
    }

    /// # Errors
    /// Returns an error when identity records cannot be read.
    pub fn list_identities(&self) -> Result<Vec<IdentityRecord>> {
        let store = self.open_store()?;
        store.identity_records()
    }

    /// # Errors
    /// Returns an error when events cannot be read.
    pub fn list_events(&self) -> Result<Vec<SyncEvent>> {
        let store = self.open_store()?;
        store.events()
    }

    #[must_use]
    pub fn notices(&self) -> Vec<NoticeView> {
        notice_views(&self.config)
    }

    #[must_use]
    pub fn config_summary(&self) -> ConfigSummary {
        ConfigSummary::from_config(&self.config)
    }
}

fn store_failure(err: anyhow::Error) -> ReceiveError {
    ReceiveError::Store(SyncError::Store(format!("{err:#}")))
}
