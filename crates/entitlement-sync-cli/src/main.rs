use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use entitlement_sync_core::{
    reconcile, EntitlementRecord, RandomTokenSource, ReconcileContext, SyncConfig,
};
use entitlement_sync_store_sqlite::{
    render_upsert_sql, EntitlementStore, MembershipSource, SchemaStatus, WriteOutcome,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{info, info_span, warn};
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "esync")]
#[command(about = "Reconcile membership plans into entitlement records")]
struct Cli {
    #[arg(long, short = 'f', default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Sync(SyncArgs),
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Read both databases but never write to the entitlement store.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Write the rendered upsert statement to this file.
    #[arg(long, short = 'o')]
    out: Option<PathBuf>,
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

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::load(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;

    match cli.command {
        Command::Sync(args) => run_sync(&args, &config),
        Command::Db { command } => run_db(command, &config),
        Command::Config { command: ConfigCommand::Show } => {
            emit_json(serde_json::to_value(&config).context("failed to serialize config")?)
        }
    }
}

fn run_sync(args: &SyncArgs, config: &SyncConfig) -> Result<()> {
    let run_id = Ulid::new();
    let span = info_span!("sync", %run_id, dry_run = args.dry_run);
    let _guard = span.enter();

    let memberships = MembershipSource::open(&config.membership_source.database)?
        .list_memberships()
        .context("failed to read memberships")?;

    let store_path = &config.entitlement_store.database;
    let mut store = if args.dry_run {
        None
    } else {
        let mut store = EntitlementStore::open(store_path)?;
        store.migrate()?;
        Some(store)
    };
    let existing = match &store {
        Some(store) => store.list_entitlements()?,
        None => read_existing_read_only(store_path)?,
    };

    let now = OffsetDateTime::now_utc()
        .replace_nanosecond(0)
        .context("failed to truncate run timestamp")?;
    let mut tokens = RandomTokenSource::default();
    let mut ctx = ReconcileContext::new(config.entitlement_store.stamps(), now, &mut tokens);
    let reconciliation = reconcile(
        &config.plans,
        &config.blessed_accounts,
        &memberships,
        &existing,
        &mut ctx,
    );

    let summary = &reconciliation.summary;
    for plan_id in &summary.unknown_plans {
        warn!(%plan_id, "membership references a plan with no configured resources");
    }
    if summary.skipped_memberships > 0 || summary.skipped_existing > 0 {
        warn!(
            skipped_memberships = summary.skipped_memberships,
            skipped_existing = summary.skipped_existing,
            "skipped rows without an email"
        );
    }
    info!(
        total = summary.total_records,
        created = summary.created,
        status_changed = summary.status_changed,
        unchanged = summary.unchanged,
        "reconciled entitlements"
    );

    let statement = render_upsert_sql(&reconciliation.records)?;
    let preview_file = match (&args.out, &statement) {
        (Some(out), Some(statement)) => {
            write_preview(out, statement)?;
            Some(out.clone())
        }
        _ => None,
    };

    let outcome = match store.as_mut() {
        _ if !reconciliation.has_changes() => {
            info!("no entitlement changes since the last run");
            "no_changes"
        }
        Some(store) => match store.upsert_entitlements(&reconciliation.records)? {
            WriteOutcome::Written { .. } => "written",
            WriteOutcome::NoOp => "no_changes",
        },
        None => {
            info!("dry run; entitlement store left untouched");
            "dry_run"
        }
    };

    let changed_records = reconciliation.changed().collect::<Vec<&EntitlementRecord>>();
    emit_json(serde_json::json!({
        "run_id": run_id.to_string(),
        "dry_run": args.dry_run,
        "outcome": outcome,
        "summary": summary,
        "changed_records": changed_records,
        "statement_sha256": statement.as_deref().map(|text| sha256_hex(text.as_bytes())),
        "preview_file": preview_file.map(|path| path.display().to_string()),
    }))
}

/// Existing entitlements for a dry run. A missing or unmigrated store previews as empty.
fn read_existing_read_only(path: &Path) -> Result<Vec<EntitlementRecord>> {
    if !path.exists() {
        warn!(path = %path.display(), "entitlement store does not exist; previewing against an empty store");
        return Ok(Vec::new());
    }

    let store = EntitlementStore::open_read_only(path)?;
    if store.schema_status()?.current_version == 0 {
        warn!(path = %path.display(), "entitlement store is not migrated; previewing against an empty store");
        return Ok(Vec::new());
    }
    store.list_entitlements()
}

fn write_preview(path: &Path, statement: &str) -> Result<()> {
    fs::write(path, statement)
        .with_context(|| format!("failed to write statement to {}", path.display()))?;
    info!(path = %path.display(), "wrote upsert statement");
    Ok(())
}

fn run_db(command: DbCommand, config: &SyncConfig) -> Result<()> {
    let path = &config.entitlement_store.database;
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(&read_schema_status(path)?),
        DbCommand::Migrate(args) => run_db_migrate(&args, path),
        DbCommand::IntegrityCheck => {
            run_db_integrity_check(&EntitlementStore::open_read_only(path)?)
        }
    }
}

/// Schema status without creating the store file or changing its journal mode.
fn read_schema_status(path: &Path) -> Result<SchemaStatus> {
    if !path.exists() {
        return Ok(SchemaStatus::missing());
    }
    EntitlementStore::open_read_only(path)?.schema_status()
}

fn run_db_schema_version(status: &SchemaStatus) -> Result<()> {
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, path: &Path) -> Result<()> {
    if args.dry_run {
        let before = read_schema_status(path)?;
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }))?;
        return Ok(());
    }

    let mut store = EntitlementStore::open(path)?;
    let before = store.schema_status()?;
    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_integrity_check(store: &EntitlementStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
