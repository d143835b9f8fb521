use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dispatcher::{DispatchOutcome, Dispatcher, Transport};
use crate::{MetadataStore, SyncConfig, SyncRole, TaxonomyStore, Term};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum FullSyncError {
    #[error("Cannot run full synchronization since this is not the master site.")]
    NotMaster,
    #[error("Cannot run full synchronization since no remote URL is defined for the slave site.")]
    MissingRemoteEndpoint,
    #[error("Cannot run full synchronization. No taxonomies are defined.")]
    NoTaxonomies,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    PartialFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FullSyncReport {
    pub status: SyncStatus,
    pub elapsed_seconds: f64,
    pub attempted: usize,
    pub succeeded: usize,
    pub errors: Vec<String>,
}

impl FullSyncReport {
    #[must_use]
    pub fn summary_line(&self) -> String {
        let outcome = match self.status {
            SyncStatus::Success => "successfully",
            SyncStatus::PartialFailure => "unsuccessfully",
        };
        format!("The sync finished {outcome} in {:.2} seconds.", self.elapsed_seconds)
    }

    /// One captured error per line followed by the summary line.
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut lines = self.errors.clone();
        lines.push(self.summary_line());
        lines.join("\n")
    }
}

/// Send every term of every synchronized taxonomy to the slave, one at a time.
///
/// Within a taxonomy, parents are sent before their children so the slave can translate
/// every parent reference. A failed term never stops the run; its error is collected and the
/// loop moves on.
///
/// # Errors
/// Returns a `FullSyncError` when the site is not a master, has no remote endpoint, or has no
/// synchronized taxonomies.
pub fn run_full_sync<S, T>(
    config: &SyncConfig,
    store: &S,
    metadata: Option<&dyn MetadataStore>,
    transport: &T,
) -> Result<FullSyncReport, FullSyncError>
where
    S: TaxonomyStore + ?Sized,
    T: Transport + ?Sized,
{
    if config.role != SyncRole::Master {
        return Err(FullSyncError::NotMaster);
    }
    if config.remote_endpoint().is_none() {
        return Err(FullSyncError::MissingRemoteEndpoint);
    }
    if config.synchronized_taxonomies.is_empty() {
        return Err(FullSyncError::NoTaxonomies);
    }

    let started = Instant::now();
    let mut dispatcher = Dispatcher::new(config, transport);
    let mut errors = Vec::new();
    let mut attempted = 0;
    let mut succeeded = 0;

    for taxonomy in &config.synchronized_taxonomies {
        let terms = match store.list_terms(taxonomy) {
            Ok(terms) => terms,
            Err(err) => {
                warn!(taxonomy = %taxonomy, %err, "failed to enumerate taxonomy");
                errors.push(format!("failed to list terms for taxonomy {taxonomy}: {err}"));
                continue;
            }
        };

        for term in parents_first(terms) {
            attempted += 1;
            match dispatcher.dispatch_term(store, metadata, term.term_id, taxonomy) {
                DispatchOutcome::Failed { .. } => {
                    if let Some(error) = dispatcher.take_error() {
                        errors.push(error);
                    }
                }
                DispatchOutcome::Synced { .. } | DispatchOutcome::Skipped => succeeded += 1,
            }
        }
    }

    let status = if errors.is_empty() { SyncStatus::Success } else { SyncStatus::PartialFailure };
    let report = FullSyncReport {
        status,
        elapsed_seconds: started.elapsed().as_secs_f64(),
        attempted,
        succeeded,
        errors,
    };
    info!(
        attempted = report.attempted,
        succeeded = report.succeeded,
        failed = report.errors.len(),
        "{}",
        report.summary_line()
    );
    Ok(report)
}

/// Reorder `terms` so every parent precedes its children. Otherwise the incoming order is
/// kept. Parents outside the list and parent cycles are ignored.
fn parents_first(terms: Vec<Term>) -> Vec<Term> {
    let position_of: HashMap<i64, usize> =
        terms.iter().enumerate().map(|(position, term)| (term.term_id, position)).collect();
    let mut placed = vec![false; terms.len()];
    let mut order = Vec::with_capacity(terms.len());

    for start in 0..terms.len() {
        let mut chain = Vec::new();
        let mut cursor = Some(start);
        while let Some(position) = cursor {
            if placed[position] || chain.contains(&position) {
                break;
            }
            chain.push(position);
            cursor = terms[position].parent.and_then(|parent| position_of.get(&parent).copied());
        }
        for position in chain.into_iter().rev() {
            placed[position] = true;
            order.push(position);
        }
    }

    let mut slots: Vec<Option<Term>> = terms.into_iter().map(Some).collect();
    order.into_iter().filter_map(|position| slots[position].take()).collect()
}
