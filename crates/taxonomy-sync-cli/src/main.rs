use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use taxonomy_sync_api::{init_logging, load_config, TaxonomySyncApi};
use taxonomy_sync_core::{TaxonomyDescriptor, TaxonomyFilter, TermArgs};
use taxonomy_sync_store_sqlite::SqliteStore;
use tracing::debug;

const CLI_CONTRACT_VERSION: &str = "taxonomy-sync.cli.v1";

#[derive(Debug, Parser)]
#[command(name = "tsync")]
#[command(about = "Taxonomy Sync CLI")]
struct Cli {
    #[arg(long, default_value = "./taxonomy_sync.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = "./taxonomy_sync.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Taxonomy {
        #[command(subcommand)]
        command: TaxonomyCommand,
    },
    Term {
        #[command(subcommand)]
        command: Box<TermCommand>,
    },
    Sync {
        #[command(subcommand)]
        command: SyncCommand,
    },
    Identity {
        #[command(subcommand)]
        command: IdentityCommand,
    },
    Events {
        #[command(subcommand)]
        command: EventsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Show,
    Check,
}

#[derive(Debug, Subcommand)]
enum TaxonomyCommand {
    Register(TaxonomyRegisterArgs),
    List(TaxonomyListArgs),
}

#[derive(Debug, Args)]
struct TaxonomyRegisterArgs {
    name: String,
    #[arg(long)]
    label: Option<String>,
    #[arg(long, default_value_t = false)]
    private: bool,
    #[arg(long, default_value_t = false)]
    hidden: bool,
}

#[derive(Debug, Args)]
struct TaxonomyListArgs {
    /// Include taxonomies that are not public or have no UI.
    #[arg(long, default_value_t = false)]
    all: bool,
}

#[derive(Debug, Subcommand)]
enum TermCommand {
    Add(TermAddArgs),
    Edit(TermEditArgs),
    List(TermListArgs),
    MetaSet(TermMetaSetArgs),
}

#[derive(Debug, Args)]
struct TermAddArgs {
    taxonomy: String,
    name: String,
    #[arg(long, default_value = "")]
    slug: String,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long)]
    parent: Option<i64>,
}

#[derive(Debug, Args)]
struct TermEditArgs {
    taxonomy: String,
    term_id: i64,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    slug: Option<String>,
    #[arg(long)]
    description: Option<String>,
    /// New parent id; `0` moves the term to the root.
    #[arg(long)]
    parent: Option<i64>,
}

#[derive(Debug, Args)]
struct TermListArgs {
    taxonomy: String,
}

#[derive(Debug, Args)]
struct TermMetaSetArgs {
    term_id: i64,
    key: String,
    value: String,
}

#[derive(Debug, Subcommand)]
enum SyncCommand {
    Term(SyncTermArgs),
    Full,
}

#[derive(Debug, Args)]
struct SyncTermArgs {
    taxonomy: String,
    term_id: i64,
}

#[derive(Debug, Subcommand)]
enum IdentityCommand {
    Resolve(IdentityResolveArgs),
    List,
}

#[derive(Debug, Args)]
struct IdentityResolveArgs {
    master_term_id: i64,
}

#[derive(Debug, Subcommand)]
enum EventsCommand {
    List,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging("info")?;
    let config = load_config(&cli.config)?;
    debug!(config = ?config, "loaded configuration");
    let api = TaxonomySyncApi::new(cli.db, config);

    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Config { command } => run_config(&command, &api),
        Command::Taxonomy { command } => run_taxonomy(command, &api),
        Command::Term { command } => run_term(*command, &api),
        Command::Sync { command } => run_sync(command, &api),
        Command::Identity { command } => run_identity(command, &api),
        Command::Events { command } => run_events(&command, &api),
    }
}

fn run_db(command: DbCommand, api: &TaxonomySyncApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::IntegrityCheck => {
            let store = SqliteStore::open(api.db_path())?;
            let report = store.integrity_check()?;
            let value =
                serde_json::to_value(&report).context("failed to serialize integrity report")?;
            emit_json(value)
        }
    }
}

fn run_config(command: &ConfigCommand, api: &TaxonomySyncApi) -> Result<()> {
    let summary = api.config_summary();
    match command {
        ConfigCommand::Show => {
            emit_json(serde_json::to_value(&summary).context("failed to serialize config")?)
        }
        ConfigCommand::Check => emit_json(serde_json::json!({
            "ready": summary.ready,
            "notices": summary.notices
        })),
    }
}

fn run_taxonomy(command: TaxonomyCommand, api: &TaxonomySyncApi) -> Result<()> {
    match command {
        TaxonomyCommand::Register(args) => {
            let descriptor = TaxonomyDescriptor {
                label: args.label.unwrap_or_else(|| args.name.clone()),
                name: args.name,
                public: !args.private,
                show_ui: !args.hidden,
            };
            api.register_taxonomy(&descriptor)?;
            emit_json(serde_json::json!({ "taxonomy": descriptor }))
        }
        TaxonomyCommand::List(args) => {
            let filter =
                if args.all { TaxonomyFilter::default() } else { TaxonomyFilter::selectable() };
            let taxonomies = api.list_taxonomies(filter)?;
            emit_json(serde_json::json!({ "taxonomies": taxonomies }))
        }
    }
}

fn run_term(command: TermCommand, api: &TaxonomySyncApi) -> Result<()> {
    match command {
        TermCommand::Add(args) => {
            let mutation = api.create_term(
                &args.taxonomy,
                &TermArgs {
                    name: args.name,
                    slug: args.slug,
                    description: args.description,
                    parent: args.parent.filter(|parent| *parent > 0),
                },
            )?;
            emit_json(serde_json::to_value(&mutation).context("failed to serialize term")?)
        }
        TermCommand::Edit(args) => {
            let current = api
                .get_term(args.term_id, &args.taxonomy)?
                .ok_or_else(|| anyhow!("term {} not found in {}", args.term_id, args.taxonomy))?;
            let update = TermArgs {
                name: args.name.unwrap_or(current.name),
                slug: args.slug.unwrap_or(current.slug),
                description: args.description.unwrap_or(current.description),
                parent: match args.parent {
                    Some(parent) => Some(parent).filter(|parent| *parent > 0),
                    None => current.parent,
                },
            };
            let mutation = api.update_term(args.term_id, &args.taxonomy, &update)?;
            emit_json(serde_json::to_value(&mutation).context("failed to serialize term")?)
        }
        TermCommand::List(args) => {
            let terms = api.list_terms(&args.taxonomy)?;
            emit_json(serde_json::json!({ "taxonomy": args.taxonomy, "terms": terms }))
        }
        TermCommand::MetaSet(args) => {
            let meta = api.set_term_meta(args.term_id, &args.key, &args.value)?;
            emit_json(serde_json::json!({ "term_id": args.term_id, "term_meta": meta }))
        }
    }
}

fn run_sync(command: SyncCommand, api: &TaxonomySyncApi) -> Result<()> {
    match command {
        SyncCommand::Term(args) => {
            let outcome = api.sync_term(args.term_id, &args.taxonomy)?;
            emit_json(serde_json::json!({
                "term_id": args.term_id,
                "taxonomy": args.taxonomy,
                "outcome": outcome
            }))
        }
        SyncCommand::Full => {
            let report = api.full_sync()?;
            emit_json(serde_json::json!({
                "report": report,
                "summary": report.summary_line()
            }))
        }
    }
}

fn run_identity(command: IdentityCommand, api: &TaxonomySyncApi) -> Result<()> {
    match command {
        IdentityCommand::Resolve(args) => {
            let local = api.resolve_identity(args.master_term_id)?;
            emit_json(serde_json::json!({
                "master_term_id": args.master_term_id,
                "local_term_id": local
            }))
        }
        IdentityCommand::List => {
            let records = api.list_identities()?;
            emit_json(serde_json::json!({ "identities": records }))
        }
    }
}

fn run_events(command: &EventsCommand, api: &TaxonomySyncApi) -> Result<()> {
    match command {
        EventsCommand::List => {
            let events = api.list_events()?;
            emit_json(serde_json::json!({ "events": events }))
        }
    }
}
