//! Slave-side handling of one incoming term.
//!
//! Steps run in a fixed order and every failure is terminal for the request:
//! authenticate, check role, authorize taxonomy, decode, translate the parent,
//! create or update, then replay metadata. Nothing about the taxonomy or the term is
//! inspected before the key has been verified.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::{decode_metadata, decode_term, DecodeError};
use crate::{
    IdentityMapper, MetadataStore, SyncConfig, SyncError, SyncRole, TaxonomyStore, TermArgs,
    TermEvent, TermHooks,
};

/// Form fields as presented by the remote caller. Every field is optional so presence can be
/// checked in protocol order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub key: Option<String>,
    pub taxonomy: Option<String>,
    pub term: Option<String>,
    pub term_meta: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReceiveError {
    #[error("Invalid key specified")]
    InvalidKey,
    #[error("This site is not configured to receive terms")]
    NotReceiving,
    #[error("Taxonomy not specified for synchronization at slave site")]
    TaxonomyNotAccepted,
    #[error("Term not included in the request")]
    TermMissing,
    #[error("The term object was invalid.")]
    TermInvalid(#[source] DecodeError),
    #[error("{0}")]
    Store(#[from] SyncError),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveAction {
    Created,
    Updated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReceiveOutcome {
    pub local_term_id: i64,
    pub term_taxonomy_id: i64,
    pub master_term_id: i64,
    pub action: ReceiveAction,
    pub parent: Option<i64>,
    pub metadata_written: usize,
    pub metadata_failed: usize,
}

/// Apply one received term to the local store.
///
/// # Errors
/// Returns the terminal `ReceiveError` for the first step that rejects the request.
pub fn receive_term<S>(
    config: &SyncConfig,
    store: &mut S,
    metadata: Option<&mut dyn MetadataStore>,
    hooks: &mut dyn TermHooks,
    request: &ReceiveRequest,
) -> Result<ReceiveOutcome, ReceiveError>
where
    S: TaxonomyStore + IdentityMapper + ?Sized,
{
    if !config.key_matches(request.key.as_deref().unwrap_or_default()) {
        debug!("rejecting term: key mismatch");
        return Err(ReceiveError::InvalidKey);
    }

    if config.role != SyncRole::Slave {
        return Err(ReceiveError::NotReceiving);
    }

    let taxonomy = match request.taxonomy.as_deref() {
        Some(taxonomy) if config.accepts_taxonomy(taxonomy) => taxonomy,
        _ => return Err(ReceiveError::TaxonomyNotAccepted),
    };

    let mut term = decode_term(request.term.as_deref()).map_err(|err| match err {
        DecodeError::Missing => ReceiveError::TermMissing,
        other => ReceiveError::TermInvalid(other),
    })?;
    if term.taxonomy.is_empty() {
        term.taxonomy = taxonomy.to_string();
    } else if term.taxonomy != taxonomy {
        return Err(ReceiveError::TaxonomyNotAccepted);
    }

    let parent = match term.parent {
        Some(master_parent) => {
            let resolved = store.resolve_local_id(master_parent)?;
            if resolved.is_none() {
                debug!(master_parent, "parent has no local mirror; storing term at root");
            }
            resolved
        }
        None => None,
    };

    let args = TermArgs {
        name: term.name.clone(),
        slug: term.slug.clone(),
        description: term.description.clone(),
        parent,
    };

    let (written, action) = match store.resolve_local_id(term.term_id)? {
        None => {
            let written = store.insert_mirrored_term(term.term_id, &term.taxonomy, &args)?;
            hooks.term_created(&TermEvent {
                term_id: written.term_id,
                term_taxonomy_id: written.term_taxonomy_id,
                taxonomy: term.taxonomy.clone(),
            });
            info!(
                master_term_id = term.term_id,
                local_term_id = written.term_id,
                taxonomy = %term.taxonomy,
                "created mirrored term"
            );
            (written, ReceiveAction::Created)
        }
        Some(local_id) => {
            let written = store.update_term(local_id, &term.taxonomy, &args)?;
            hooks.term_edited(&TermEvent {
                term_id: written.term_id,
                term_taxonomy_id: written.term_taxonomy_id,
                taxonomy: term.taxonomy.clone(),
            });
            info!(
                master_term_id = term.term_id,
                local_term_id = written.term_id,
                taxonomy = %term.taxonomy,
                "updated mirrored term"
            );
            (written, ReceiveAction::Updated)
        }
    };

    let mut metadata_written = 0;
    let mut metadata_failed = 0;
    if let (Some(raw), Some(metadata)) = (request.term_meta.as_deref(), metadata) {
        match decode_metadata(raw) {
            Ok(values) => {
                for (key, value) in values {
                    let value = hooks.filter_meta_value(&key, value);
                    match metadata.set_metadata(written.term_id, &key, &value) {
                        Ok(()) => metadata_written += 1,
                        Err(err) => {
                            warn!(
                                term_id = written.term_id,
                                key = %key,
                                %err,
                                "term meta write failed"
                            );
                            metadata_failed += 1;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(term_id = written.term_id, %err, "ignoring undecodable term meta");
            }
        }
    }

    Ok(ReceiveOutcome {
        local_term_id: written.term_id,
        term_taxonomy_id: written.term_taxonomy_id,
        master_term_id: term.term_id,
        action,
        parent,
        metadata_written,
        metadata_failed,
    })
}
