use std::path::Path;

use anyhow::{anyhow, Context, Result};
use entitlement_sync_core::{
    EntitlementRecord, EntitlementStatus, Membership, MembershipRow, ZERO_TIMESTAMP,
};
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::{debug, info};

pub const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS entitlements (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  resource_id INTEGER NOT NULL CHECK (resource_id >= 0),
  email TEXT NOT NULL CHECK (length(email) BETWEEN 1 AND 255),
  token TEXT NOT NULL UNIQUE CHECK (length(token) = 64),
  status TEXT NOT NULL CHECK (status IN ('active','suspended')),
  created_by INTEGER NOT NULL,
  updated_by INTEGER NOT NULL,
  created_at TEXT,
  updated_at TEXT,
  UNIQUE(email, resource_id)
);

CREATE INDEX IF NOT EXISTS idx_entitlements_status ON entitlements(status);
";

const ENTITLEMENT_COLUMNS: &str =
    "resource_id, email, token, status, created_by, updated_by, created_at, updated_at";

// Tokens and creation metadata are immutable once a row exists.
const UPSERT_CONFLICT_SQL: &str = "ON CONFLICT(email, resource_id) DO UPDATE SET
  status = excluded.status,
  updated_by = excluded.updated_by,
  updated_at = excluded.updated_at";

/// Active and lapsed subscriptions joined to the member's email. Within one
/// email and plan, active rows sort last so a live subscription outranks lapsed ones.
pub const MEMBERSHIP_QUERY: &str = "SELECT
  m.email AS email,
  mscs.status AS status,
  mscs.plan_id AS plan_id
FROM members_stripe_customers AS msc
INNER JOIN members_stripe_customers_subscriptions AS mscs ON msc.customer_id = mscs.customer_id
INNER JOIN members AS m ON m.id = msc.member_id
ORDER BY m.email ASC, mscs.plan_id ASC, (mscs.status = 'active') ASC, mscs.status ASC";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

impl SchemaStatus {
    fn at_version(current_version: i64, inferred_from_legacy: bool) -> Self {
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Self {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        }
    }

    /// Status of a store file that does not exist yet.
    #[must_use]
    pub fn missing() -> Self {
        Self::at_version(0, false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub entitlement_rows: i64,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WriteOutcome {
    NoOp,
    Written { records: usize },
}

/// Read-only view of the upstream membership database.
pub struct MembershipSource {
    conn: Connection,
}

impl MembershipSource {
    /// Open the membership database without write access.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open membership database at {}", path.display()))?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .context("failed to configure membership database pragmas")?;
        Ok(Self { conn })
    }

    /// Load every membership row, stopping at the first row that fails validation.
    ///
    /// # Errors
    /// Returns an error when the query fails or any row is missing a required field.
    pub fn list_memberships(&self) -> Result<Vec<Membership>> {
        let mut stmt =
            self.conn.prepare(MEMBERSHIP_QUERY).context("failed to prepare membership query")?;
        let mut rows = stmt.query([]).context("failed to query memberships")?;
        let mut memberships = Vec::new();

        while let Some(row) = rows.next()? {
            let raw = MembershipRow {
                email: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                status: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                plan_id: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            };
            let membership = Membership::from_row(raw).map_err(|err| {
                anyhow!("membership row {} rejected: {err}", memberships.len() + 1)
            })?;
            debug!(
                email = %membership.email,
                plan_id = %membership.plan_id,
                status = membership.status.as_str(),
                "read membership"
            );
            memberships.push(membership);
        }

        info!(count = memberships.len(), "loaded memberships");
        Ok(memberships)
    }
}

/// The target entitlement table and its schema bookkeeping.
pub struct EntitlementStore {
    conn: Connection,
}

impl EntitlementStore {
    /// Open (creating if needed) the entitlement database for reads and writes.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open entitlement database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Open an existing entitlement database that refuses every write.
    ///
    /// # Errors
    /// Returns an error when the database does not exist or cannot be opened.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| {
            format!("failed to open entitlement database read-only at {}", path.display())
        })?;

        conn.execute_batch(
            "PRAGMA query_only = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure read-only sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        Ok(SchemaStatus::at_version(current_version, inferred_from_legacy))
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&mut self) -> Result<i64> {
        if table_has_column(&self.conn, "entitlements", "token")? {
            // Table created outside this tool; adopt it as version 1.
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        if table_exists(&self.conn, "entitlements")? {
            return Err(anyhow!("database schema is invalid: entitlements has no token column"));
        }

        let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
        record_schema_version(&tx, 1)?;
        tx.commit().context("failed to commit migration v1")?;
        info!(version = 1, "applied entitlement store migration");
        Ok(1)
    }

    /// Load every persisted entitlement exactly as stored.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or a status/timestamp cannot be decoded.
    pub fn list_entitlements(&self) -> Result<Vec<EntitlementRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT id, {ENTITLEMENT_COLUMNS} FROM entitlements
                 ORDER BY email ASC, resource_id ASC"
            ))
            .context("failed to prepare entitlement query")?;

        let mut rows = stmt.query([]).context("failed to query entitlements")?;
        let mut records = Vec::new();

        while let Some(row) = rows.next()? {
            let status_raw: String = row.get(4)?;
            let created_at: Option<String> = row.get(7)?;
            let updated_at: Option<String> = row.get(8)?;

            records.push(EntitlementRecord {
                id: row.get(0)?,
                resource_id: row.get(1)?,
                email: row.get(2)?,
                token: row.get(3)?,
                status: EntitlementStatus::parse(&status_raw)
                    .ok_or_else(|| anyhow!("unknown entitlement status: {status_raw}"))?,
                created_by: row.get(5)?,
                updated_by: row.get(6)?,
                created_at: parse_store_timestamp(created_at.as_deref())?,
                updated_at: parse_store_timestamp(updated_at.as_deref())?,
                changed: false,
            });
        }

        info!(count = records.len(), "loaded entitlements");
        Ok(records)
    }

    /// Insert or update every `changed` record in one transaction, keyed on
    /// `(email, resource_id)`. Unchanged records are ignored.
    ///
    /// # Errors
    /// Returns an error when any row is rejected; nothing is written in that case.
    pub fn upsert_entitlements(&mut self, records: &[EntitlementRecord]) -> Result<WriteOutcome> {
        let changed = records.iter().filter(|record| record.changed).collect::<Vec<_>>();
        if changed.is_empty() {
            info!("no entitlement changes to write");
            return Ok(WriteOutcome::NoOp);
        }

        let tx = self.conn.transaction().context("failed to start transaction")?;
        {
            let mut stmt = tx
                .prepare(&format!(
                    "INSERT INTO entitlements ({ENTITLEMENT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     {UPSERT_CONFLICT_SQL}"
                ))
                .context("failed to prepare entitlement upsert")?;

            for record in &changed {
                stmt.execute(params![
                    record.resource_id,
                    record.email,
                    record.token,
                    record.status.as_str(),
                    record.created_by,
                    record.updated_by,
                    format_store_timestamp(record.created_at)?,
                    format_store_timestamp(record.updated_at)?,
                ])
                .with_context(|| {
                    format!("failed to upsert entitlement {}", record.key())
                })?;
                debug!(key = %record.key(), status = record.status.as_str(), "upserted entitlement");
            }
        }
        tx.commit().context("failed to commit entitlement upsert")?;

        info!(records = changed.len(), "wrote entitlement changes");
        Ok(WriteOutcome::Written { records: changed.len() })
    }

    /// Run quick-check and report row count plus schema status.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let entitlement_rows = if table_exists(&self.conn, "entitlements")? {
            self.conn
                .query_row("SELECT COUNT(*) FROM entitlements", [], |row| row.get::<_, i64>(0))
                .context("failed to count entitlements")?
        } else {
            0
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            entitlement_rows,
            schema_status: self.schema_status()?,
        })
    }
}

/// Render the upsert for every `changed` record as one standalone SQL statement,
/// suitable for review or for running by hand. `None` when nothing changed.
///
/// # Errors
/// Returns an error when a timestamp cannot be formatted.
pub fn render_upsert_sql(records: &[EntitlementRecord]) -> Result<Option<String>> {
    let mut values = Vec::new();
    for record in records.iter().filter(|record| record.changed) {
        values.push(format!(
            "({}, {}, {}, {}, {}, {}, {}, {})",
            record.resource_id,
            sql_literal(&record.email),
            sql_literal(&record.token),
            sql_literal(record.status.as_str()),
            record.created_by,
            record.updated_by,
            sql_literal(&format_store_timestamp(record.created_at)?),
            sql_literal(&format_store_timestamp(record.updated_at)?),
        ));
    }

    if values.is_empty() {
        return Ok(None);
    }

    Ok(Some(format!(
        "INSERT INTO entitlements ({ENTITLEMENT_COLUMNS}) VALUES\n{}\n{UPSERT_CONFLICT_SQL};\n",
        values.join(",\n")
    )))
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    if !table_exists(conn, "schema_migrations")? {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if table_has_column(conn, "entitlements", "token")? {
        return Ok((1, true));
    }

    Ok((0, false))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = format_store_timestamp(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn format_store_timestamp(value: OffsetDateTime) -> Result<String> {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    value.to_offset(UtcOffset::UTC).format(format).context("failed to format store timestamp")
}

/// Parse `YYYY-MM-DD HH:MM:SS` as UTC. A NULL column reads as [`ZERO_TIMESTAMP`].
fn parse_store_timestamp(value: Option<&str>) -> Result<OffsetDateTime> {
    let Some(raw) = value else {
        return Ok(ZERO_TIMESTAMP);
    };
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    PrimitiveDateTime::parse(raw, format)
        .map(PrimitiveDateTime::assume_utc)
        .with_context(|| format!("invalid store timestamp: {raw}"))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::*;
    use entitlement_sync_core::{
        reconcile, ActorStamps, BlessedOverrides, MembershipStatus, PlanCatalog,
        ReconcileContext, SequenceTokenSource,
    };
    use time::macros::datetime;
    use ulid::Ulid;

    const MEMBERSHIP_SCHEMA_SQL: &str = r"
    CREATE TABLE members (id TEXT PRIMARY KEY, email TEXT);
    CREATE TABLE members_stripe_customers (member_id TEXT NOT NULL, customer_id TEXT NOT NULL);
    CREATE TABLE members_stripe_customers_subscriptions (
      customer_id TEXT NOT NULL,
      status TEXT,
      plan_id TEXT
    );
    ";

    fn fixture_time() -> OffsetDateTime {
        datetime!(2024-03-01 12:30:45 UTC)
    }

    fn temp_db_path(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{prefix}-{}.sqlite3", Ulid::new()))
    }

    fn migrated_store() -> Result<EntitlementStore> {
        let mut store = EntitlementStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn mk_record(email: &str, resource_id: u32, token_seed: char) -> EntitlementRecord {
        EntitlementRecord {
            id: None,
            resource_id,
            email: email.to_string(),
            token: std::iter::repeat(token_seed).take(64).collect(),
            status: EntitlementStatus::Active,
            created_by: 1,
            updated_by: 1,
            created_at: fixture_time(),
            updated_at: fixture_time(),
            changed: true,
        }
    }

    fn write_membership_fixture(path: &Path, rows: &[(&str, Option<&str>, Option<&str>)]) -> Result<()> {
        let conn = Connection::open(path)?;
        conn.execute_batch(MEMBERSHIP_SCHEMA_SQL)?;
        for (index, (email, status, plan_id)) in rows.iter().enumerate() {
            let member_id = format!("m{index}");
            let customer_id = format!("cus_{index}");
            conn.execute("INSERT INTO members(id, email) VALUES (?1, ?2)", params![member_id, email])?;
            conn.execute(
                "INSERT INTO members_stripe_customers(member_id, customer_id) VALUES (?1, ?2)",
                params![member_id, customer_id],
            )?;
            conn.execute(
                "INSERT INTO members_stripe_customers_subscriptions(customer_id, status, plan_id)
                 VALUES (?1, ?2, ?3)",
                params![customer_id, status, plan_id],
            )?;
        }
        Ok(())
    }

    #[test]
    fn migrate_creates_schema_and_reports_status() -> Result<()> {
        let mut store = EntitlementStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1]);

        store.migrate()?;
        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        assert!(!after.inferred_from_legacy);
        Ok(())
    }

    #[test]
    fn missing_store_status_matches_empty_database() -> Result<()> {
        let store = EntitlementStore::open(Path::new(":memory:"))?;
        assert_eq!(SchemaStatus::missing(), store.schema_status()?);
        Ok(())
    }

    #[test]
    fn migrate_adopts_existing_entitlements_table() -> Result<()> {
        let mut store = EntitlementStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(MIGRATION_001_SQL)?;

        let before = store.schema_status()?;
        assert_eq!(before.current_version, 1);
        assert!(before.inferred_from_legacy);

        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, 1);
        assert!(!after.inferred_from_legacy);
        Ok(())
    }

    #[test]
    fn migrate_rejects_entitlements_table_without_token() -> Result<()> {
        let mut store = EntitlementStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch("CREATE TABLE entitlements (id INTEGER PRIMARY KEY, email TEXT);")?;

        let result = store.migrate();
        assert!(result.is_err(), "migration should reject an unknown entitlements shape");
        Ok(())
    }

    #[test]
    fn sqlite_checks_reject_invalid_rows() -> Result<()> {
        let store = migrated_store()?;
        let token = "a".repeat(64);

        let bad_status = store.conn.execute(
            &format!("INSERT INTO entitlements ({ENTITLEMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![1, "a@example.com", token, "pending", 1, 1, "2024-01-01 00:00:00", "2024-01-01 00:00:00"],
        );
        assert!(bad_status.is_err(), "status outside active/suspended must be rejected");

        let short_token = store.conn.execute(
            &format!("INSERT INTO entitlements ({ENTITLEMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![1, "a@example.com", "short", "active", 1, 1, "2024-01-01 00:00:00", "2024-01-01 00:00:00"],
        );
        assert!(short_token.is_err(), "tokens must be 64 characters");
        Ok(())
    }

    #[test]
    fn upsert_then_list_round_trips_records() -> Result<()> {
        let mut store = migrated_store()?;
        let records = vec![mk_record("a@example.com", 2, 'a'), mk_record("a@example.com", 1, 'b')];

        let outcome = store.upsert_entitlements(&records)?;
        assert_eq!(outcome, WriteOutcome::Written { records: 2 });

        let listed = store.list_entitlements()?;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].resource_id, 1);
        assert_eq!(listed[0].token, "b".repeat(64));
        assert_eq!(listed[0].created_at, fixture_time());
        assert!(listed.iter().all(|record| record.id.is_some() && !record.changed));
        Ok(())
    }

    #[test]
    fn upsert_updates_status_in_place_and_keeps_identity() -> Result<()> {
        let mut store = migrated_store()?;
        store.upsert_entitlements(&[mk_record("a@example.com", 1, 'a')])?;
        let original = store.list_entitlements()?.remove(0);

        let mut update = original.clone();
        update.status = EntitlementStatus::Suspended;
        update.updated_by = 9;
        update.updated_at = fixture_time() + time::Duration::hours(1);
        update.changed = true;
        // Identity fields on the conflicting row are never rewritten.
        update.token = "z".repeat(64);
        update.created_by = 42;

        store.upsert_entitlements(&[update])?;
        let listed = store.list_entitlements()?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, original.id);
        assert_eq!(listed[0].token, original.token);
        assert_eq!(listed[0].created_by, original.created_by);
        assert_eq!(listed[0].created_at, original.created_at);
        assert_eq!(listed[0].status, EntitlementStatus::Suspended);
        assert_eq!(listed[0].updated_by, 9);
        assert_eq!(listed[0].updated_at, fixture_time() + time::Duration::hours(1));
        Ok(())
    }

    #[test]
    fn upsert_without_changes_is_a_no_op() -> Result<()> {
        let mut store = migrated_store()?;
        let mut record = mk_record("a@example.com", 1, 'a');
        record.changed = false;

        assert_eq!(store.upsert_entitlements(&[record])?, WriteOutcome::NoOp);
        assert_eq!(store.upsert_entitlements(&[])?, WriteOutcome::NoOp);
        assert!(store.list_entitlements()?.is_empty());
        Ok(())
    }

    #[test]
    fn failed_upsert_writes_nothing() -> Result<()> {
        let mut store = migrated_store()?;
        let mut bad = mk_record("b@example.com", 1, 'b');
        bad.token = "short".to_string();

        let result = store.upsert_entitlements(&[mk_record("a@example.com", 1, 'a'), bad]);
        assert!(result.is_err());
        assert!(store.list_entitlements()?.is_empty());
        Ok(())
    }

    #[test]
    fn null_timestamps_read_as_zero_value() -> Result<()> {
        let store = migrated_store()?;
        store.conn.execute(
            &format!("INSERT INTO entitlements ({ENTITLEMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL)"),
            params![3, "a@example.com", "c".repeat(64), "suspended", 1, 1],
        )?;

        let listed = store.list_entitlements()?;
        assert_eq!(listed[0].created_at, ZERO_TIMESTAMP);
        assert_eq!(listed[0].updated_at, ZERO_TIMESTAMP);
        assert_eq!(listed[0].status, EntitlementStatus::Suspended);
        Ok(())
    }

    #[test]
    fn malformed_timestamp_is_a_read_error() -> Result<()> {
        let store = migrated_store()?;
        store.conn.execute(
            &format!("INSERT INTO entitlements ({ENTITLEMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)"),
            params![3, "a@example.com", "c".repeat(64), "active", 1, 1, "2024-03-01T12:30:45Z"],
        )?;

        assert!(store.list_entitlements().is_err());
        Ok(())
    }

    #[test]
    fn store_timestamps_use_fixed_text_format() -> Result<()> {
        assert_eq!(format_store_timestamp(fixture_time())?, "2024-03-01 12:30:45");
        assert_eq!(format_store_timestamp(ZERO_TIMESTAMP)?, "0001-01-01 00:00:00");
        assert_eq!(parse_store_timestamp(Some("2024-03-01 12:30:45"))?, fixture_time());
        Ok(())
    }

    #[test]
    fn rendered_sql_covers_only_changed_records_and_escapes_literals() -> Result<()> {
        let mut unchanged = mk_record("keep@example.com", 1, 'k');
        unchanged.changed = false;
        assert_eq!(render_upsert_sql(&[unchanged.clone()])?, None);

        let quoted = mk_record("o'neil@example.com", 2, 'q');
        let Some(sql) = render_upsert_sql(&[unchanged, quoted])? else {
            panic!("changed records should render a statement");
        };
        assert!(sql.contains("'o''neil@example.com'"));
        assert!(!sql.contains("keep@example.com"));
        assert!(sql.contains("ON CONFLICT(email, resource_id)"));
        assert!(sql.trim_end().ends_with(';'));
        Ok(())
    }

    #[test]
    fn rendered_sql_matches_transactional_upsert() -> Result<()> {
        let existing = mk_record("a@example.com", 1, 'a');
        let mut flipped = existing.clone();
        flipped.status = EntitlementStatus::Suspended;
        let records = vec![flipped, mk_record("o'neil@example.com", 4, 'b')];

        let mut via_params = migrated_store()?;
        via_params.upsert_entitlements(&[existing.clone()])?;
        via_params.upsert_entitlements(&records)?;

        let via_text = migrated_store()?;
        let Some(seed) = render_upsert_sql(&[existing])? else {
            panic!("seed should render");
        };
        let Some(sql) = render_upsert_sql(&records)? else {
            panic!("records should render");
        };
        via_text.conn.execute_batch(&seed)?;
        via_text.conn.execute_batch(&sql)?;

        assert_eq!(via_params.list_entitlements()?, via_text.list_entitlements()?);
        Ok(())
    }

    #[test]
    fn read_only_store_refuses_writes() -> Result<()> {
        let path = temp_db_path("esync-readonly");
        {
            let mut store = EntitlementStore::open(&path)?;
            store.migrate()?;
            store.upsert_entitlements(&[mk_record("a@example.com", 1, 'a')])?;
        }

        let mut read_only = EntitlementStore::open_read_only(&path)?;
        assert_eq!(read_only.list_entitlements()?.len(), 1);
        assert_eq!(read_only.schema_status()?.current_version, LATEST_SCHEMA_VERSION);
        assert!(read_only.upsert_entitlements(&[mk_record("b@example.com", 1, 'b')]).is_err());

        drop(read_only);
        for suffix in ["", "-wal", "-shm"] {
            let _ = fs::remove_file(format!("{}{suffix}", path.display()));
        }
        Ok(())
    }

    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let mut store = migrated_store()?;
        store.upsert_entitlements(&[mk_record("a@example.com", 1, 'a')])?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert_eq!(report.entitlement_rows, 1);
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn membership_source_reads_and_maps_rows() -> Result<()> {
        let path = temp_db_path("esync-members");
        write_membership_fixture(
            &path,
            &[
                ("b@example.com", Some("active"), Some("plan-b")),
                ("a@example.com", Some("canceled"), Some("plan-a")),
            ],
        )?;

        let source = MembershipSource::open(&path)?;
        let memberships = source.list_memberships()?;
        assert_eq!(memberships.len(), 2);
        assert_eq!(memberships[0].email, "a@example.com");
        assert_eq!(memberships[0].status, MembershipStatus::Inactive);
        assert_eq!(memberships[1].status, MembershipStatus::Active);
        assert_eq!(memberships[1].plan_id, "plan-b");

        drop(source);
        fs::remove_file(&path)
            .with_context(|| format!("failed to cleanup {}", path.display()))?;
        Ok(())
    }

    #[test]
    fn active_subscription_sorts_after_lapsed_ones_for_same_plan() -> Result<()> {
        let path = temp_db_path("esync-members-resubscribed");
        write_membership_fixture(&path, &[("a@example.com", Some("active"), Some("plan-a"))])?;
        {
            let conn = Connection::open(&path)?;
            for status in ["canceled", "past_due"] {
                conn.execute(
                    "INSERT INTO members_stripe_customers_subscriptions(customer_id, status, plan_id)
                     VALUES ('cus_0', ?1, 'plan-a')",
                    params![status],
                )?;
            }
        }

        let source = MembershipSource::open(&path)?;
        let memberships = source.list_memberships()?;
        let statuses = memberships.iter().map(|membership| membership.status).collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![MembershipStatus::Inactive, MembershipStatus::Inactive, MembershipStatus::Active]
        );

        let catalog: PlanCatalog = [("plan-a", vec![1])].into_iter().collect();
        let mut tokens = SequenceTokenSource::new("resub");
        let mut ctx = ReconcileContext::new(ActorStamps::default(), fixture_time(), &mut tokens);
        let result =
            reconcile(&catalog, &BlessedOverrides::default(), &memberships, &[], &mut ctx);
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].status, EntitlementStatus::Active);

        drop(source);
        fs::remove_file(&path)
            .with_context(|| format!("failed to cleanup {}", path.display()))?;
        Ok(())
    }

    #[test]
    fn membership_source_fails_fast_on_incomplete_row() -> Result<()> {
        let path = temp_db_path("esync-members-invalid");
        write_membership_fixture(
            &path,
            &[("a@example.com", Some("active"), Some("plan-a")), ("b@example.com", None, Some("plan-b"))],
        )?;

        let source = MembershipSource::open(&path)?;
        let err = match source.list_memberships() {
            Ok(memberships) => panic!("expected rejection, got {memberships:?}"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("status"), "unexpected error: {err}");

        drop(source);
        fs::remove_file(&path)
            .with_context(|| format!("failed to cleanup {}", path.display()))?;
        Ok(())
    }

    #[test]
    fn reconciled_changes_persist_and_second_run_is_a_no_op() -> Result<()> {
        let mut store = migrated_store()?;
        let catalog: PlanCatalog = [("plan-a", vec![1, 2])].into_iter().collect();
        let overrides: BlessedOverrides = [("admin@example.com", vec![3])].into_iter().collect();
        let memberships = vec![Membership {
            email: "a@example.com".to_string(),
            status: MembershipStatus::Active,
            plan_id: "plan-a".to_string(),
        }];

        let mut tokens = SequenceTokenSource::new("run");
        let mut ctx = ReconcileContext::new(ActorStamps::default(), fixture_time(), &mut tokens);
        let first = reconcile(&catalog, &overrides, &memberships, &store.list_entitlements()?, &mut ctx);
        assert_eq!(store.upsert_entitlements(&first.records)?, WriteOutcome::Written { records: 3 });

        let second =
            reconcile(&catalog, &overrides, &memberships, &store.list_entitlements()?, &mut ctx);
        assert!(!second.has_changes());
        assert_eq!(store.upsert_entitlements(&second.records)?, WriteOutcome::NoOp);
        assert_eq!(store.list_entitlements()?.len(), 3);
        Ok(())
    }
}
