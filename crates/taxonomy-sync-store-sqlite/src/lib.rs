use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use taxonomy_sync_core::{
    IdentityMapper, MetadataStore, SyncError, TaxonomyDescriptor, TaxonomyFilter, TaxonomyStore,
    Term, TermArgs, TermEvent, TermMeta, TermWriteResult,
};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS taxonomies (
  name TEXT PRIMARY KEY,
  label TEXT NOT NULL,
  public INTEGER NOT NULL CHECK (public IN (0, 1)),
  show_ui INTEGER NOT NULL CHECK (show_ui IN (0, 1)),
  registered_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS terms (
  term_id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL CHECK (length(name) > 0),
  slug TEXT NOT NULL CHECK (length(slug) > 0)
);

CREATE TABLE IF NOT EXISTS term_taxonomy (
  term_taxonomy_id INTEGER PRIMARY KEY AUTOINCREMENT,
  term_id INTEGER NOT NULL UNIQUE,
  taxonomy TEXT NOT NULL,
  description TEXT NOT NULL,
  parent INTEGER,
  FOREIGN KEY (term_id) REFERENCES terms(term_id),
  FOREIGN KEY (taxonomy) REFERENCES taxonomies(name),
  FOREIGN KEY (parent) REFERENCES terms(term_id)
);

CREATE TABLE IF NOT EXISTS identity_records (
  local_term_id INTEGER PRIMARY KEY,
  master_term_id INTEGER NOT NULL UNIQUE CHECK (master_term_id > 0),
  created_at TEXT NOT NULL,
  FOREIGN KEY (local_term_id) REFERENCES terms(term_id)
);

CREATE TABLE IF NOT EXISTS term_meta (
  term_id INTEGER NOT NULL,
  meta_key TEXT NOT NULL,
  meta_value TEXT NOT NULL,
  PRIMARY KEY (term_id, meta_key),
  FOREIGN KEY (term_id) REFERENCES terms(term_id)
);

CREATE INDEX IF NOT EXISTS idx_term_taxonomy_taxonomy ON term_taxonomy(taxonomy);
CREATE INDEX IF NOT EXISTS idx_term_taxonomy_parent ON term_taxonomy(parent);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS sync_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  event TEXT NOT NULL CHECK (event IN ('created', 'edited')),
  local_term_id INTEGER NOT NULL,
  term_taxonomy_id INTEGER NOT NULL,
  taxonomy TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (local_term_id) REFERENCES terms(term_id)
);

CREATE INDEX IF NOT EXISTS idx_sync_events_term ON sync_events(local_term_id);
";

const MIGRATIONS: [(i64, &str); 2] = [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)];

pub struct SqliteStore {
    conn: Connection,
}

/// Term metadata collaborator. Holds its own connection so it can be handed to the receiver
/// alongside a mutable `SqliteStore`.
pub struct SqliteTermMetaStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityRecord {
    pub local_term_id: i64,
    pub master_term_id: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventKind {
    Created,
    Edited,
}

impl SyncEventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Edited => "edited",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "edited" => Some(Self::Edited),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncEvent {
    pub id: i64,
    pub event: SyncEventKind,
    pub local_term_id: i64,
    pub term_taxonomy_id: i64,
    pub taxonomy: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed taxonomy store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { conn: open_connection(path)? })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer than supported.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let current = current_schema_version(&self.conn)?;
        if current > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {current}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (version, sql) in MIGRATIONS {
            if version <= current {
                continue;
            }
            let tx = self
                .conn
                .transaction()
                .with_context(|| format!("failed to start migration v{version} transaction"))?;
            tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![version, now_rfc3339()?],
            )
            .with_context(|| format!("failed to record migration version {version}"))?;
            tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        }

        Ok(())
    }

    /// Register a taxonomy, or refresh the label and visibility of an existing one.
    ///
    /// # Errors
    /// Returns an error when the name is blank or the write fails.
    pub fn register_taxonomy(&mut self, descriptor: &TaxonomyDescriptor) -> Result<()> {
        let name = descriptor.name.trim();
        if name.is_empty() {
            return Err(anyhow!("taxonomy name MUST be provided"));
        }
        let label = if descriptor.label.trim().is_empty() { name } else { descriptor.label.trim() };

        self.conn
            .execute(
                "INSERT INTO taxonomies(name, label, public, show_ui, registered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(name) DO UPDATE SET
                   label = excluded.label,
                   public = excluded.public,
                   show_ui = excluded.show_ui",
                params![name, label, descriptor.public, descriptor.show_ui, now_rfc3339()?],
            )
            .with_context(|| format!("failed to register taxonomy {name}"))?;
        Ok(())
    }

    /// List registered taxonomies matching `filter`, ordered by label.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn taxonomies(&self, filter: TaxonomyFilter) -> Result<Vec<TaxonomyDescriptor>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, label, public, show_ui FROM taxonomies ORDER BY label ASC, name ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(TaxonomyDescriptor {
                name: row.get(0)?,
                label: row.get(1)?,
                public: row.get(2)?,
                show_ui: row.get(3)?,
            })
        })?;

        let mut descriptors = Vec::new();
        for row in rows {
            let descriptor = row?;
            if filter.matches(&descriptor) {
                descriptors.push(descriptor);
            }
        }
        Ok(descriptors)
    }

    /// Load one term of `taxonomy`.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn term(&self, term_id: i64, taxonomy: &str) -> Result<Option<Term>> {
        self.conn
            .query_row(
                "SELECT t.term_id, tt.taxonomy, t.name, t.slug, tt.description, tt.parent
                 FROM terms t JOIN term_taxonomy tt ON tt.term_id = t.term_id
                 WHERE t.term_id = ?1 AND tt.taxonomy = ?2",
                params![term_id, taxonomy],
                term_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load term {term_id}"))
    }

    /// Every term of `taxonomy`, parents before children where ids allow, by ascending id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn terms_in(&self, taxonomy: &str) -> Result<Vec<Term>> {
        let mut stmt = self.conn.prepare(
            "SELECT t.term_id, tt.taxonomy, t.name, t.slug, tt.description, tt.parent
             FROM terms t JOIN term_taxonomy tt ON tt.term_id = t.term_id
             WHERE tt.taxonomy = ?1
             ORDER BY t.term_id ASC",
        )?;
        let rows = stmt.query_map(params![taxonomy], term_from_row)?;
        let mut terms = Vec::new();
        for row in rows {
            terms.push(row?);
        }
        Ok(terms)
    }

    /// Create a term. Slugs are derived from the name when blank and made unique within the
    /// taxonomy by a numeric suffix.
    ///
    /// # Errors
    /// Returns an error when the taxonomy is unknown, the name is blank, a sibling already has
    /// the name, the parent does not exist, or the write fails.
    pub fn create_term(&mut self, taxonomy: &str, args: &TermArgs) -> Result<TermWriteResult> {
        self.insert_term_row(taxonomy, args, None)
    }

    /// Create a term and its identity record for `master_term_id` in one transaction.
    ///
    /// # Errors
    /// Returns the same errors as [`SqliteStore::create_term`], or an error when
    /// `master_term_id` is already mirrored. Nothing is written on failure.
    pub fn create_mirrored_term(
        &mut self,
        master_term_id: i64,
        taxonomy: &str,
        args: &TermArgs,
    ) -> Result<TermWriteResult> {
        self.insert_term_row(taxonomy, args, Some(master_term_id))
    }

    fn insert_term_row(
        &mut self,
        taxonomy: &str,
        args: &TermArgs,
        master_term_id: Option<i64>,
    ) -> Result<TermWriteResult> {
        self.ensure_taxonomy(taxonomy)?;
        let name = args.name.trim();
        if name.is_empty() {
            return Err(anyhow!("A name is required for this term."));
        }
        if let Some(parent) = args.parent {
            if self.term(parent, taxonomy)?.is_none() {
                return Err(anyhow!("Parent term does not exist."));
            }
        }
        if self.sibling_named(taxonomy, name, args.parent, None)? {
            return Err(anyhow!("A term with the name provided already exists with this parent."));
        }

        let base_slug = sanitize_slug(if args.slug.trim().is_empty() { name } else { &args.slug });
        let slug = self.unique_slug(taxonomy, &base_slug, None)?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute("INSERT INTO terms(name, slug) VALUES (?1, ?2)", params![name, slug])
            .context("failed to insert term")?;
        let term_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO term_taxonomy(term_id, taxonomy, description, parent)
             VALUES (?1, ?2, ?3, ?4)",
            params![term_id, taxonomy, args.description, args.parent],
        )
        .context("failed to insert term taxonomy relation")?;
        let term_taxonomy_id = tx.last_insert_rowid();
        if let Some(master_term_id) = master_term_id {
            let created_at = now_rfc3339()?;
            tx.execute(
                "INSERT INTO identity_records(local_term_id, master_term_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![term_id, master_term_id, created_at],
            )
            .with_context(|| format!("failed to bind master term {master_term_id}"))?;
        }
        tx.commit().context("failed to commit term insert")?;

        Ok(TermWriteResult { term_id, term_taxonomy_id })
    }

    /// Overwrite name, slug, description and parent of an existing term.
    ///
    /// # Errors
    /// Returns an error when the term does not exist in `taxonomy`, the name is blank, the
    /// parent is invalid, the slug belongs to another term, or the write fails.
    pub fn edit_term(
        &mut self,
        term_id: i64,
        taxonomy: &str,
        args: &TermArgs,
    ) -> Result<TermWriteResult> {
        let term_taxonomy_id = self
            .term_taxonomy_id(term_id, taxonomy)?
            .ok_or_else(|| anyhow!("Term {term_id} does not exist in taxonomy {taxonomy}."))?;
        let name = args.name.trim();
        if name.is_empty() {
            return Err(anyhow!("A name is required for this term."));
        }
        if let Some(parent) = args.parent {
            if parent == term_id {
                return Err(anyhow!("A term cannot be its own parent."));
            }
            if self.term(parent, taxonomy)?.is_none() {
                return Err(anyhow!("Parent term does not exist."));
            }
        }

        let slug = sanitize_slug(if args.slug.trim().is_empty() { name } else { &args.slug });
        if self.slug_taken(taxonomy, &slug, Some(term_id))? {
            return Err(anyhow!(
                "The slug \u{201c}{slug}\u{201d} is already in use by another term."
            ));
        }

        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "UPDATE terms SET name = ?1, slug = ?2 WHERE term_id = ?3",
            params![name, slug, term_id],
        )
        .context("failed to update term")?;
        tx.execute(
            "UPDATE term_taxonomy SET description = ?1, parent = ?2 WHERE term_taxonomy_id = ?3",
            params![args.description, args.parent, term_taxonomy_id],
        )
        .context("failed to update term taxonomy relation")?;
        tx.commit().context("failed to commit term update")?;

        Ok(TermWriteResult { term_id, term_taxonomy_id })
    }

    /// Local term id mirroring `master_term_id`, if any.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn local_id_for_master(&self, master_term_id: i64) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT local_term_id FROM identity_records WHERE master_term_id = ?1",
                params![master_term_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .with_context(|| format!("failed to resolve master term {master_term_id}"))
    }

    /// Master term id mirrored by `local_term_id`, if any.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn master_id_for_local(&self, local_term_id: i64) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT master_term_id FROM identity_records WHERE local_term_id = ?1",
                params![local_term_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .with_context(|| format!("failed to look up identity of local term {local_term_id}"))
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn identity_records(&self) -> Result<Vec<IdentityRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT local_term_id, master_term_id, created_at
             FROM identity_records ORDER BY master_term_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(IdentityRecord {
                local_term_id: row.get(0)?,
                master_term_id: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// # Errors
    /// Returns an error when the event cannot be written.
    pub fn append_event(&mut self, kind: SyncEventKind, event: &TermEvent) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO sync_events(
                     event, local_term_id, term_taxonomy_id, taxonomy, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    kind.as_str(),
                    event.term_id,
                    event.term_taxonomy_id,
                    event.taxonomy,
                    now_rfc3339()?
                ],
            )
            .context("failed to append sync event")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// # Errors
    /// Returns an error when rows cannot be read or hold an unknown event kind.
    pub fn events(&self) -> Result<Vec<SyncEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, event, local_term_id, term_taxonomy_id, taxonomy, created_at
             FROM sync_events ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            let event_raw: String = row.get(1)?;
            events.push(SyncEvent {
                id: row.get(0)?,
                event: SyncEventKind::parse(&event_raw)
                    .ok_or_else(|| anyhow!("unknown sync event: {event_raw}"))?,
                local_term_id: row.get(2)?,
                term_taxonomy_id: row.get(3)?,
                taxonomy: row.get(4)?,
                created_at: row.get(5)?,
            });
        }
        Ok(events)
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    fn ensure_taxonomy(&self, taxonomy: &str) -> Result<()> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM taxonomies WHERE name = ?1)",
                params![taxonomy],
                |row| row.get::<_, bool>(0),
            )
            .with_context(|| format!("failed to check taxonomy {taxonomy}"))?;
        if exists {
            Ok(())
        } else {
            Err(anyhow!("Invalid taxonomy: {taxonomy}"))
        }
    }

    fn term_taxonomy_id(&self, term_id: i64, taxonomy: &str) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT term_taxonomy_id FROM term_taxonomy WHERE term_id = ?1 AND taxonomy = ?2",
                params![term_id, taxonomy],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .with_context(|| format!("failed to look up term taxonomy of term {term_id}"))
    }

    fn sibling_named(
        &self,
        taxonomy: &str,
        name: &str,
        parent: Option<i64>,
        exclude: Option<i64>,
    ) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(
                   SELECT 1 FROM terms t JOIN term_taxonomy tt ON tt.term_id = t.term_id
                   WHERE tt.taxonomy = ?1 AND lower(t.name) = lower(?2)
                     AND tt.parent IS ?3 AND t.term_id IS NOT ?4
                 )",
                params![taxonomy, name, parent, exclude],
                |row| row.get::<_, bool>(0),
            )
            .context("failed to check for duplicate term name")
    }

    fn slug_taken(&self, taxonomy: &str, slug: &str, exclude: Option<i64>) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(
                   SELECT 1 FROM terms t JOIN term_taxonomy tt ON tt.term_id = t.term_id
                   WHERE tt.taxonomy = ?1 AND t.slug = ?2 AND t.term_id IS NOT ?3
                 )",
                params![taxonomy, slug, exclude],
                |row| row.get::<_, bool>(0),
            )
            .context("failed to check for duplicate slug")
    }

    fn unique_slug(&self, taxonomy: &str, base: &str, exclude: Option<i64>) -> Result<String> {
        if !self.slug_taken(taxonomy, base, exclude)? {
            return Ok(base.to_string());
        }
        let mut suffix = 2_u32;
        loop {
            let candidate = format!("{base}-{suffix}");
            if !self.slug_taken(taxonomy, &candidate, exclude)? {
                return Ok(candidate);
            }
            suffix += 1;
        }
    }
}

impl SqliteTermMetaStore {
    /// Open a metadata handle on the same database file as a `SqliteStore`. The schema must
    /// already be migrated.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { conn: open_connection(path)? })
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn values(&self, term_id: i64) -> Result<TermMeta> {
        let mut stmt = self.conn.prepare(
            "SELECT meta_key, meta_value FROM term_meta WHERE term_id = ?1 ORDER BY meta_key ASC",
        )?;
        let rows = stmt.query_map(params![term_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut values = TermMeta::new();
        for row in rows {
            let (key, value) = row?;
            values.insert(key, value);
        }
        Ok(values)
    }

    /// # Errors
    /// Returns an error when the key is blank, the term does not exist, or the write fails.
    pub fn put(&mut self, term_id: i64, key: &str, value: &str) -> Result<()> {
        if key.trim().is_empty() {
            return Err(anyhow!("meta key MUST be provided"));
        }
        self.conn
            .execute(
                "INSERT INTO term_meta(term_id, meta_key, meta_value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(term_id, meta_key) DO UPDATE SET meta_value = excluded.meta_value",
                params![term_id, key, value],
            )
            .with_context(|| format!("failed to write meta {key} for term {term_id}"))?;
        Ok(())
    }
}

impl TaxonomyStore for SqliteStore {
    fn get_term(&self, term_id: i64, taxonomy: &str) -> Result<Option<Term>, SyncError> {
        self.term(term_id, taxonomy).map_err(store_error)
    }

    fn insert_term(
        &mut self,
        taxonomy: &str,
        args: &TermArgs,
    ) -> Result<TermWriteResult, SyncError> {
        self.create_term(taxonomy, args).map_err(store_error)
    }

    fn update_term(
        &mut self,
        term_id: i64,
        taxonomy: &str,
        args: &TermArgs,
    ) -> Result<TermWriteResult, SyncError> {
        self.edit_term(term_id, taxonomy, args).map_err(store_error)
    }

    fn list_terms(&self, taxonomy: &str) -> Result<Vec<Term>, SyncError> {
        self.terms_in(taxonomy).map_err(store_error)
    }

    fn list_taxonomies(
        &self,
        filter: TaxonomyFilter,
    ) -> Result<Vec<TaxonomyDescriptor>, SyncError> {
        self.taxonomies(filter).map_err(store_error)
    }
}

impl IdentityMapper for SqliteStore {
    fn resolve_local_id(&self, master_id: i64) -> Result<Option<i64>, SyncError> {
        self.local_id_for_master(master_id).map_err(store_error)
    }

    fn record_identity(&mut self, local_id: i64, master_id: i64) -> Result<(), SyncError> {
        if let Some(existing) = self.master_id_for_local(local_id).map_err(store_error)? {
            if existing == master_id {
                return Ok(());
            }
            return Err(SyncError::IdentityConflict(format!(
                "local term {local_id} already mirrors master term {existing}"
            )));
        }
        if let Some(claimed_by) = self.local_id_for_master(master_id).map_err(store_error)? {
            return Err(SyncError::IdentityConflict(format!(
                "master term {master_id} is already mirrored by local term {claimed_by}"
            )));
        }

        let created_at = now_rfc3339().map_err(store_error)?;
        self.conn
            .execute(
                "INSERT INTO identity_records(local_term_id, master_term_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![local_id, master_id, created_at],
            )
            .context("failed to persist identity record")
            .map_err(store_error)?;
        Ok(())
    }

    fn insert_mirrored_term(
        &mut self,
        master_id: i64,
        taxonomy: &str,
        args: &TermArgs,
    ) -> Result<TermWriteResult, SyncError> {
        if let Some(claimed_by) = self.local_id_for_master(master_id).map_err(store_error)? {
            return Err(SyncError::IdentityConflict(format!(
                "master term {master_id} is already mirrored by local term {claimed_by}"
            )));
        }
        self.create_mirrored_term(master_id, taxonomy, args).map_err(store_error)
    }
}

impl MetadataStore for SqliteTermMetaStore {
    fn get_metadata(&self, term_id: i64) -> Result<TermMeta, SyncError> {
        self.values(term_id).map_err(store_error)
    }

    fn set_metadata(&mut self, term_id: i64, key: &str, value: &str) -> Result<(), SyncError> {
        self.put(term_id, key, value).map_err(store_error)
    }
}

/// Whether `err` came from SQLite itself rather than from a rejected term or argument.
#[must_use]
pub fn is_storage_failure(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.downcast_ref::<rusqlite::Error>().is_some())
}

fn store_error(err: anyhow::Error) -> SyncError {
    SyncError::Store(format!("{err:#}"))
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;

    Ok(conn)
}

fn term_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Term> {
    Ok(Term {
        term_id: row.get(0)?,
        taxonomy: row.get(1)?,
        name: row.get(2)?,
        slug: row.get(3)?,
        description: row.get(4)?,
        parent: row.get(5)?,
    })
}

/// Lowercase, keep alphanumerics, collapse everything else into single dashes.
#[must_use]
pub fn sanitize_slug(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;
    for ch in input.trim().chars() {
        if ch.is_alphanumeric() || ch == '_' {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(ch.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "term".to_string()
    } else {
        slug
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
