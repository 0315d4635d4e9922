use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::macros::datetime;
use time::OffsetDateTime;
use uuid::Uuid;

pub type ResourceId = u32;
pub type ActorId = u32;

/// Actor stamped on created/updated records when the config leaves it unset.
pub const DEFAULT_ACTOR_ID: ActorId = 1;

pub const TOKEN_LEN: usize = 64;

/// Stand-in for a timestamp the store never recorded.
pub const ZERO_TIMESTAMP: OffsetDateTime = datetime!(0001-01-01 0:00 UTC);

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SyncError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("config error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    Active,
    Inactive,
}

impl MembershipStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    /// Map an upstream subscription status. Only a literal `active` grants access;
    /// `canceled`, `past_due`, `trialing` and anything else count as inactive.
    #[must_use]
    pub fn from_source(value: &str) -> Self {
        if value == "active" {
            Self::Active
        } else {
            Self::Inactive
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementStatus {
    Active,
    Suspended,
}

impl EntitlementStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "suspended" => Some(Self::Suspended),
            _ => None,
        }
    }

    #[must_use]
    pub fn for_membership(status: MembershipStatus) -> Self {
        match status {
            MembershipStatus::Active => Self::Active,
            MembershipStatus::Inactive => Self::Suspended,
        }
    }
}

/// One row as read from the membership source, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MembershipRow {
    pub email: String,
    pub status: String,
    pub plan_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Membership {
    pub email: String,
    pub status: MembershipStatus,
    pub plan_id: String,
}

impl Membership {
    /// Validate one raw membership row.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when `email`, `status`, or `plan_id` is empty.
    pub fn from_row(row: MembershipRow) -> Result<Self, SyncError> {
        for (field, value) in [("email", &row.email), ("status", &row.status), ("plan_id", &row.plan_id)]
        {
            if value.trim().is_empty() {
                return Err(SyncError::Validation(format!(
                    "{field} MUST be provided for every membership row"
                )));
            }
        }

        Ok(Self {
            status: MembershipStatus::from_source(&row.status),
            email: row.email,
            plan_id: row.plan_id,
        })
    }
}

/// Natural key of an entitlement record.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntitlementKey {
    pub email: String,
    pub resource_id: ResourceId,
}

impl EntitlementKey {
    #[must_use]
    pub fn new(email: impl Into<String>, resource_id: ResourceId) -> Self {
        Self { email: email.into(), resource_id }
    }
}

impl Display for EntitlementKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.email, self.resource_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EntitlementRecord {
    /// Store-assigned row id; `None` until the record has been written once.
    pub id: Option<i64>,
    pub resource_id: ResourceId,
    pub email: String,
    pub token: String,
    pub status: EntitlementStatus,
    pub created_by: ActorId,
    pub updated_by: ActorId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    /// Set when this run altered the record relative to the store. Never persisted.
    #[serde(default)]
    pub changed: bool,
}

impl EntitlementRecord {
    #[must_use]
    pub fn key(&self) -> EntitlementKey {
        EntitlementKey::new(self.email.clone(), self.resource_id)
    }
}

/// Ascending resource ids per key. Shared storage for plan catalogs and overrides.
type ResourceSets = BTreeMap<String, BTreeSet<ResourceId>>;

fn collect_resource_sets<K, I>(entries: impl IntoIterator<Item = (K, I)>) -> ResourceSets
where
    K: Into<String>,
    I: IntoIterator<Item = ResourceId>,
{
    let mut sets = ResourceSets::new();
    for (key, resources) in entries {
        sets.entry(key.into()).or_default().extend(resources);
    }
    sets
}

/// Plan identifier to the resources the plan grants.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct PlanCatalog(ResourceSets);

impl PlanCatalog {
    #[must_use]
    pub fn resources(&self, plan_id: &str) -> Option<&BTreeSet<ResourceId>> {
        self.0.get(plan_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<ResourceId>)> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, I> FromIterator<(K, I)> for PlanCatalog
where
    K: Into<String>,
    I: IntoIterator<Item = ResourceId>,
{
    fn from_iter<T: IntoIterator<Item = (K, I)>>(iter: T) -> Self {
        Self(collect_resource_sets(iter))
    }
}

/// Manually granted email to resource access, independent of membership status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct BlessedOverrides(ResourceSets);

impl BlessedOverrides {
    #[must_use]
    pub fn resources(&self, email: &str) -> Option<&BTreeSet<ResourceId>> {
        self.0.get(email)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<ResourceId>)> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn drop_blank_emails(&mut self) {
        self.0.retain(|email, _| !email.trim().is_empty());
    }
}

impl<K, I> FromIterator<(K, I)> for BlessedOverrides
where
    K: Into<String>,
    I: IntoIterator<Item = ResourceId>,
{
    fn from_iter<T: IntoIterator<Item = (K, I)>>(iter: T) -> Self {
        Self(collect_resource_sets(iter))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ActorStamps {
    pub created_by: ActorId,
    pub updated_by: ActorId,
}

impl Default for ActorStamps {
    fn default() -> Self {
        Self { created_by: DEFAULT_ACTOR_ID, updated_by: DEFAULT_ACTOR_ID }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MembershipSourceConfig {
    pub database: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EntitlementStoreConfig {
    pub database: PathBuf,
    #[serde(default)]
    pub created_by: ActorId,
    #[serde(default)]
    pub updated_by: ActorId,
}

impl EntitlementStoreConfig {
    #[must_use]
    pub fn stamps(&self) -> ActorStamps {
        ActorStamps { created_by: self.created_by, updated_by: self.updated_by }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SyncConfig {
    pub membership_source: MembershipSourceConfig,
    pub entitlement_store: EntitlementStoreConfig,
    #[serde(default)]
    pub plans: PlanCatalog,
    #[serde(default)]
    pub blessed_accounts: BlessedOverrides,
}

impl SyncConfig {
    /// Read a JSON config file, resolve relative database paths against the
    /// file's directory, and apply defaults.
    ///
    /// # Errors
    /// Returns [`SyncError::Config`] when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let body = std::fs::read_to_string(path).map_err(|err| {
            SyncError::Config(format!("failed to load config from {}: {err}", path.display()))
        })?;
        let mut config = Self::from_json(&body).map_err(|err| {
            SyncError::Config(format!("failed to parse config from {}: {err}", path.display()))
        })?;

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    /// Parse a JSON config document and apply defaults.
    ///
    /// # Errors
    /// Returns [`SyncError::Config`] when the document is not a valid config.
    pub fn from_json(body: &str) -> Result<Self, SyncError> {
        let mut config: Self =
            serde_json::from_str(body).map_err(|err| SyncError::Config(err.to_string()))?;
        config.apply_defaults();
        Ok(config)
    }

    /// Fill unset actor ids and drop override entries without an email.
    /// Resource sets are already ascending and duplicate-free.
    pub fn apply_defaults(&mut self) {
        if self.entitlement_store.created_by == 0 {
            self.entitlement_store.created_by = DEFAULT_ACTOR_ID;
        }
        if self.entitlement_store.updated_by == 0 {
            self.entitlement_store.updated_by = DEFAULT_ACTOR_ID;
        }
        self.blessed_accounts.drop_blank_emails();
    }

    fn resolve_paths(&mut self, base: &Path) {
        for database in
            [&mut self.membership_source.database, &mut self.entitlement_store.database]
        {
            if database.is_relative() {
                *database = base.join(&*database);
            }
        }
    }
}

/// Source of fresh entitlement tokens.
pub trait TokenSource {
    fn next_token(&mut self) -> String;
}

impl<F> TokenSource for F
where
    F: FnMut() -> String,
{
    fn next_token(&mut self) -> String {
        self()
    }
}

/// Two random v4 UUIDs without hyphens. Never repeats a token within one source.
#[derive(Debug, Default)]
pub struct RandomTokenSource {
    issued: HashSet<String>,
}

impl TokenSource for RandomTokenSource {
    fn next_token(&mut self) -> String {
        loop {
            let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
            if self.issued.insert(token.clone()) {
                return token;
            }
        }
    }
}

/// Longest prefix a [`SequenceTokenSource`] keeps; the rest of the token holds
/// any `u64` counter.
pub const SEQUENCE_PREFIX_MAX: usize = TOKEN_LEN - 20;

/// Deterministic tokens: `prefix` followed by a zero-padded counter, 64 chars total.
#[derive(Debug, Clone)]
pub struct SequenceTokenSource {
    prefix: String,
    next: u64,
}

impl SequenceTokenSource {
    /// Non-ASCII characters are dropped and the prefix is cut to
    /// [`SEQUENCE_PREFIX_MAX`] characters.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix =
            prefix.into().chars().filter(char::is_ascii).take(SEQUENCE_PREFIX_MAX).collect();
        Self { prefix, next: 1 }
    }
}

impl TokenSource for SequenceTokenSource {
    fn next_token(&mut self) -> String {
        let width = TOKEN_LEN.saturating_sub(self.prefix.len());
        let token = format!("{}{:0>width$}", self.prefix, self.next);
        self.next = self.next.wrapping_add(1);
        token
    }
}

/// Per-run inputs besides the data: who is stamping, when, and where tokens come from.
pub struct ReconcileContext<'a> {
    pub stamps: ActorStamps,
    pub now: OffsetDateTime,
    pub tokens: &'a mut dyn TokenSource,
}

impl<'a> ReconcileContext<'a> {
    pub fn new(stamps: ActorStamps, now: OffsetDateTime, tokens: &'a mut dyn TokenSource) -> Self {
        Self { stamps, now, tokens }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReconcileSummary {
    pub total_records: usize,
    pub created: usize,
    pub status_changed: usize,
    pub unchanged: usize,
    pub skipped_existing: usize,
    pub skipped_memberships: usize,
    pub unknown_plans: Vec<String>,
}

impl ReconcileSummary {
    #[must_use]
    pub fn changed(&self) -> usize {
        self.created + self.status_changed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Reconciliation {
    /// Every desired record, ordered by email then resource id.
    pub records: Vec<EntitlementRecord>,
    pub summary: ReconcileSummary,
}

impl Reconciliation {
    pub fn changed(&self) -> impl Iterator<Item = &EntitlementRecord> {
        self.records.iter().filter(|record| record.changed)
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.records.iter().any(|record| record.changed)
    }
}

type IdentityIndex = BTreeMap<EntitlementKey, EntitlementRecord>;

/// Status and update stamps of a record as the store holds it.
struct StoredState {
    status: EntitlementStatus,
    updated_by: ActorId,
    updated_at: OffsetDateTime,
}

impl StoredState {
    fn of(record: &EntitlementRecord) -> Self {
        Self { status: record.status, updated_by: record.updated_by, updated_at: record.updated_at }
    }
}

/// A stored record whose final status equals its stored status is unchanged,
/// however many intermediate steps touched it.
fn settle_against_store(
    index: &mut IdentityIndex,
    stored: &BTreeMap<EntitlementKey, StoredState>,
) {
    for (key, record) in index.iter_mut() {
        let Some(state) = stored.get(key) else {
            continue;
        };
        if record.status == state.status {
            record.changed = false;
            record.updated_by = state.updated_by;
            record.updated_at = state.updated_at;
        }
    }
}

fn new_record(
    key: &EntitlementKey,
    status: EntitlementStatus,
    ctx: &mut ReconcileContext<'_>,
) -> EntitlementRecord {
    EntitlementRecord {
        id: None,
        resource_id: key.resource_id,
        email: key.email.clone(),
        token: ctx.tokens.next_token(),
        status,
        created_by: ctx.stamps.created_by,
        updated_by: ctx.stamps.updated_by,
        created_at: ctx.now,
        updated_at: ctx.now,
        changed: true,
    }
}

fn apply_status(
    index: &mut IdentityIndex,
    key: EntitlementKey,
    desired: EntitlementStatus,
    ctx: &mut ReconcileContext<'_>,
) {
    match index.entry(key) {
        Entry::Vacant(slot) => {
            let record = new_record(slot.key(), desired, ctx);
            slot.insert(record);
        }
        Entry::Occupied(mut slot) => {
            let record = slot.get_mut();
            // Equal status leaves `changed` as an earlier step set it.
            if record.status != desired {
                record.status = desired;
                record.updated_at = ctx.now;
                record.updated_by = ctx.stamps.updated_by;
                record.changed = true;
            }
        }
    }
}

/// Compute the complete desired entitlement set.
///
/// Existing records seed the identity index and are never dropped. Memberships
/// then set status per plan resource, and blessed overrides run last, only ever
/// raising a record to active. A record is `changed` when it is new or its
/// status differs from the stored one once both passes are done; creation
/// metadata and tokens of existing records are kept.
///
/// A record whose membership row vanished from the feed keeps its last status:
/// only an explicit inactive row suspends it.
pub fn reconcile(
    catalog: &PlanCatalog,
    overrides: &BlessedOverrides,
    memberships: &[Membership],
    existing: &[EntitlementRecord],
    ctx: &mut ReconcileContext<'_>,
) -> Reconciliation {
    let mut summary = ReconcileSummary::default();
    let mut index = IdentityIndex::new();

    for record in existing {
        if record.email.is_empty() {
            summary.skipped_existing += 1;
            continue;
        }
        let mut seeded = record.clone();
        seeded.changed = false;
        index.insert(seeded.key(), seeded);
    }
    let stored = index
        .iter()
        .map(|(key, record)| (key.clone(), StoredState::of(record)))
        .collect::<BTreeMap<_, _>>();

    let mut unknown_plans = BTreeSet::new();
    for membership in memberships {
        if membership.email.is_empty() {
            summary.skipped_memberships += 1;
            continue;
        }

        let Some(resources) = catalog.resources(&membership.plan_id) else {
            unknown_plans.insert(membership.plan_id.clone());
            continue;
        };

        let desired = EntitlementStatus::for_membership(membership.status);
        for &resource_id in resources {
            apply_status(
                &mut index,
                EntitlementKey::new(membership.email.as_str(), resource_id),
                desired,
                ctx,
            );
        }
    }

    for (email, resources) in overrides.iter() {
        if email.is_empty() {
            continue;
        }
        for &resource_id in resources {
            apply_status(
                &mut index,
                EntitlementKey::new(email.as_str(), resource_id),
                EntitlementStatus::Active,
                ctx,
            );
        }
    }

    settle_against_store(&mut index, &stored);

    for (key, record) in &index {
        if !record.changed {
            summary.unchanged += 1;
        } else if stored.contains_key(key) {
            summary.status_changed += 1;
        } else {
            summary.created += 1;
        }
    }
    summary.total_records = index.len();
    summary.unknown_plans = unknown_plans.into_iter().collect();

    Reconciliation { records: index.into_values().collect(), summary }
}
