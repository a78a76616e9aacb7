use std::path::PathBuf;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use zakat_kernel_core::{
    aggregate_wealth, apply_edit, compute_threshold, evaluate_cycle, finalize, refinalize,
    suggested_flags, unlock, AuditEntry, Currency, CycleEvent, CycleRecord, Deduction,
    DeductionId, Item, ItemCategory, ItemId, Methodology, PriceQuote, QuotePair, RecordEdit,
    RecordId, RecordStatus, Threshold, WealthSummary,
};
use zakat_kernel_store_sqlite::{
    ExportManifest, IntegrityReport, SchemaStatus, SqliteStore, UserSettings,
};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddItemRequest {
    pub user_id: String,
    pub category: ItemCategory,
    pub value_minor: i64,
    pub currency: Currency,
    #[serde(with = "time::serde::rfc3339::option")]
    pub acquired_at: Option<OffsetDateTime>,
    /// When absent, the category's suggested defaults apply.
    pub is_passive_holding: Option<bool>,
    pub is_restricted_access: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddDeductionRequest {
    pub user_id: String,
    pub label: String,
    pub amount_minor: i64,
    pub currency: Currency,
    pub eligible: bool,
}

/// Result of one idempotent detection pass for one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CycleOutcome {
    pub event: CycleEvent,
    pub wealth_minor: i64,
    pub threshold: Threshold,
    /// The open (or newly opened) record, absent when idle or interrupted.
    pub record: Option<CycleRecord>,
}

/// Orchestration over the calculation core and the SQLite store. Each call
/// opens the store and migrates it, so callers never observe a stale schema.
#[derive(Debug, Clone)]
pub struct ZakatKernelApi {
    db_path: PathBuf,
}

impl ZakatKernelApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or queried.
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
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        info!(after_version = after.current_version, "schema migrated");
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Add one item. Valuation flags default to the category's suggestion
    /// and are always caller-overridable.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn add_item(&self, input: AddItemRequest, now: OffsetDateTime) -> Result<Item> {
        let (suggested_passive, suggested_restricted) = suggested_flags(input.category);
        let item = Item {
            item_id: ItemId::new(),
            user_id: input.user_id,
            category: input.category,
            value_minor: input.value_minor,
            currency: input.currency,
            acquired_at: input.acquired_at.unwrap_or(now),
            is_passive_holding: input.is_passive_holding.unwrap_or(suggested_passive),
            is_restricted_access: input.is_restricted_access.unwrap_or(suggested_restricted),
            active: true,
        };

        let mut store = self.open_store()?;
        store.insert_item(&item)?;
        debug!(item_id = %item.item_id, category = item.category.as_str(), "item added");
        self.refresh_open_draft(&mut store, &item.user_id, now)?;
        Ok(item)
    }

    /// Update an item's value, currency, or valuation flags.
    ///
    /// # Errors
    /// Returns an error when the item is missing or validation fails.
    pub fn update_item(
        &self,
        item_id: ItemId,
        value_minor: Option<i64>,
        currency: Option<Currency>,
        is_passive_holding: Option<bool>,
        is_restricted_access: Option<bool>,
        now: OffsetDateTime,
    ) -> Result<Item> {
        let mut store = self.open_store()?;
        let mut item = store
            .get_item(item_id)?
            .ok_or_else(|| anyhow!("no item found with id {item_id}"))?;

        if let Some(value_minor) = value_minor {
            item.value_minor = value_minor;
        }
        if let Some(currency) = currency {
            item.currency = currency;
        }
        if let Some(passive) = is_passive_holding {
            item.is_passive_holding = passive;
        }
        if let Some(restricted) = is_restricted_access {
            item.is_restricted_access = restricted;
        }

        store.update_item(&item)?;
        self.refresh_open_draft(&mut store, &item.user_id, now)?;
        Ok(item)
    }

    /// Change an item's category. Both valuation flags reset to false.
    ///
    /// # Errors
    /// Returns an error when the item is missing or the write fails.
    pub fn set_item_category(
        &self,
        item_id: ItemId,
        category: ItemCategory,
        now: OffsetDateTime,
    ) -> Result<Item> {
        let mut store = self.open_store()?;
        store.set_item_category(item_id, category)?;
        let item = store
            .get_item(item_id)?
            .ok_or_else(|| anyhow!("no item found with id {item_id}"))?;
        self.refresh_open_draft(&mut store, &item.user_id, now)?;
        Ok(item)
    }

    /// Soft-deactivate an item.
    ///
    /// # Errors
    /// Returns an error when the item is missing or the write fails.
    pub fn deactivate_item(&self, item_id: ItemId, now: OffsetDateTime) -> Result<Item> {
        let mut store = self.open_store()?;
        store.deactivate_item(item_id)?;
        let item = store
            .get_item(item_id)?
            .ok_or_else(|| anyhow!("no item found with id {item_id}"))?;
        self.refresh_open_draft(&mut store, &item.user_id, now)?;
        Ok(item)
    }

    /// List a user's items in a deterministic order.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_items(&self, user_id: &str) -> Result<Vec<Item>> {
        let store = self.open_store()?;
        store.list_items(user_id)
    }

    /// Add one qualifying liability.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn add_deduction(&self, input: AddDeductionRequest, now: OffsetDateTime) -> Result<Deduction> {
        let deduction = Deduction {
            deduction_id: DeductionId::new(),
            user_id: input.user_id,
            label: input.label,
            amount_minor: input.amount_minor,
            currency: input.currency,
            eligible: input.eligible,
        };
        let mut store = self.open_store()?;
        store.insert_deduction(&deduction)?;
        self.refresh_open_draft(&mut store, &deduction.user_id, now)?;
        Ok(deduction)
    }

    /// List a user's deductions in a deterministic order.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_deductions(&self, user_id: &str) -> Result<Vec<Deduction>> {
        let store = self.open_store()?;
        store.list_deductions(user_id)
    }

    /// Register or replace an exchange rate into the user's base currency.
    ///
    /// # Errors
    /// Returns an error for a non-positive rate or when the write fails.
    pub fn set_rate(&self, user_id: &str, currency: &Currency, rate_ppm: i64) -> Result<()> {
        let mut store = self.open_store()?;
        store.set_rate(user_id, currency, rate_ppm)
    }

    /// Cache the most recent reference price for a commodity.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn record_quote(&self, quote: &PriceQuote) -> Result<()> {
        let mut store = self.open_store()?;
        store.record_quote(quote)?;
        debug!(commodity = quote.commodity.as_str(), "price quote cached");
        Ok(())
    }

    /// The cached reference quotes; either side may be absent.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn get_quotes(&self) -> Result<QuotePair> {
        let store = self.open_store()?;
        store.load_quotes()
    }

    /// Select a methodology and base currency for a user.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn set_methodology(
        &self,
        user_id: &str,
        methodology: &Methodology,
        base_currency: &Currency,
    ) -> Result<UserSettings> {
        let mut store = self.open_store()?;
        store.set_user_methodology(user_id, methodology, base_currency)?;
        store.get_user_settings(user_id)
    }

    /// The user's effective settings.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn get_settings(&self, user_id: &str) -> Result<UserSettings> {
        let store = self.open_store()?;
        store.get_user_settings(user_id)
    }

    /// Compute the obligation threshold for a user from cached quotes.
    ///
    /// # Errors
    /// Returns an error when a required quote is missing or malformed.
    pub fn compute_threshold(&self, user_id: &str, as_of: OffsetDateTime) -> Result<Threshold> {
        let store = self.open_store()?;
        let settings = store.get_user_settings(user_id)?;
        let quotes = store.load_quotes()?;
        let threshold = compute_threshold(&settings.methodology.config().basis, &quotes, as_of)?;
        if threshold.stale {
            warn!(user_id, "threshold computed from a stale quote");
        }
        Ok(threshold)
    }

    /// Aggregate a user's wealth under their methodology.
    ///
    /// # Errors
    /// Returns an error when aggregation or the store read fails.
    pub fn aggregate_wealth(&self, user_id: &str, as_of: OffsetDateTime) -> Result<WealthSummary> {
        let store = self.open_store()?;
        Self::aggregate_with(&store, user_id, as_of)
    }

    /// One idempotent detection pass for a user: opens a draft on a
    /// threshold crossing, discards it on interruption, refreshes its
    /// amounts otherwise.
    ///
    /// # Errors
    /// Returns an error when any computation or store operation fails.
    pub fn detect_cycle(&self, user_id: &str, as_of: OffsetDateTime) -> Result<CycleOutcome> {
        let mut store = self.open_store()?;
        let settings = store.get_user_settings(user_id)?;
        let quotes = store.load_quotes()?;
        let threshold = compute_threshold(&settings.methodology.config().basis, &quotes, as_of)?;
        let summary = Self::aggregate_with(&store, user_id, as_of)?;
        let open_draft = store.open_draft(user_id)?;

        let event = evaluate_cycle(
            open_draft.as_ref(),
            summary.zakatable_minor,
            threshold.value_minor,
            as_of,
        );
        debug!(user_id, event = ?event, wealth = summary.zakatable_minor, "detection pass");

        let record = match (event, open_draft) {
            (CycleEvent::Started, None) => {
                let (record, entry) = CycleRecord::open_draft(
                    user_id,
                    as_of,
                    &threshold,
                    settings.methodology.clone(),
                    summary.zakatable_minor,
                )?;
                store.insert_record(&record, &entry)?;
                info!(user_id, record_id = %record.record_id, "cycle started");
                Some(record)
            }
            (CycleEvent::Interrupted, Some(draft)) => {
                store.delete_draft(draft.record_id)?;
                info!(user_id, record_id = %draft.record_id, "cycle interrupted; draft discarded");
                None
            }
            (CycleEvent::Continued | CycleEvent::Completable, Some(mut draft)) => {
                draft.refresh_amounts(summary.zakatable_minor)?;
                store.update_draft_amounts(
                    draft.record_id,
                    draft.aggregate_minor,
                    draft.obligation_minor,
                )?;
                Some(draft)
            }
            _ => None,
        };

        Ok(CycleOutcome { event, wealth_minor: summary.zakatable_minor, threshold, record })
    }

    /// Finalize a draft whose observation period has completed.
    ///
    /// # Errors
    /// Returns an error when the record is missing, not a draft, or not yet
    /// completable without the premature acknowledgement.
    pub fn finalize(
        &self,
        record_id: RecordId,
        actor: &str,
        now: OffsetDateTime,
        acknowledge_premature: bool,
    ) -> Result<CycleRecord> {
        let mut store = self.open_store()?;
        let record = Self::load_record(&store, record_id)?;
        let (record, entry) = finalize(record, actor, now, acknowledge_premature)?;
        store.apply_transition(&record, RecordStatus::Draft, &entry)?;
        info!(record_id = %record.record_id, "record finalized");
        Ok(record)
    }

    /// Unlock a finalized record for correction.
    ///
    /// # Errors
    /// Returns an error when the record is missing, not finalized, or the
    /// justification is too short.
    pub fn unlock(
        &self,
        record_id: RecordId,
        actor: &str,
        now: OffsetDateTime,
        justification: &str,
    ) -> Result<CycleRecord> {
        let mut store = self.open_store()?;
        let record = Self::load_record(&store, record_id)?;
        let (record, entry) = unlock(record, actor, now, justification)?;
        store.apply_transition(&record, RecordStatus::Finalized, &entry)?;
        info!(record_id = %record.record_id, "record unlocked for correction");
        Ok(record)
    }

    /// Apply one logical batch of edits to an unlocked record.
    ///
    /// # Errors
    /// Returns an error when the record is missing, not unlocked, or the
    /// edit is empty or invalid.
    pub fn edit_unlocked(
        &self,
        record_id: RecordId,
        actor: &str,
        now: OffsetDateTime,
        edit: &RecordEdit,
    ) -> Result<CycleRecord> {
        let mut store = self.open_store()?;
        let record = Self::load_record(&store, record_id)?;
        let (record, entry) = apply_edit(record, actor, now, edit)?;
        store.apply_transition(&record, RecordStatus::Unlocked, &entry)?;
        Ok(record)
    }

    /// Re-lock an unlocked record.
    ///
    /// # Errors
    /// Returns an error when the record is missing or not unlocked.
    pub fn refinalize(
        &self,
        record_id: RecordId,
        actor: &str,
        now: OffsetDateTime,
    ) -> Result<CycleRecord> {
        let mut store = self.open_store()?;
        let record = Self::load_record(&store, record_id)?;
        let (record, entry) = refinalize(record, actor, now)?;
        store.apply_transition(&record, RecordStatus::Unlocked, &entry)?;
        info!(record_id = %record.record_id, "record refinalized");
        Ok(record)
    }

    /// The ledger for one record, in append order.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn audit_trail(&self, record_id: RecordId) -> Result<Vec<AuditEntry>> {
        let store = self.open_store()?;
        store.audit_trail(record_id)
    }

    /// Load one record by id.
    ///
    /// # Errors
    /// Returns an error when the record is missing or the store cannot be read.
    pub fn get_record(&self, record_id: RecordId) -> Result<CycleRecord> {
        let store = self.open_store()?;
        Self::load_record(&store, record_id)
    }

    /// List a user's records in a deterministic order.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_records(&self, user_id: &str) -> Result<Vec<CycleRecord>> {
        let store = self.open_store()?;
        store.list_records(user_id)
    }

    /// Delete a record, permitted only while it is a draft.
    ///
    /// # Errors
    /// Returns an error when the record is missing or locked.
    pub fn delete_record(&self, record_id: RecordId) -> Result<()> {
        let mut store = self.open_store()?;
        store.delete_draft(record_id)
    }

    /// Export all tables as NDJSON plus a SHA-256 manifest.
    ///
    /// # Errors
    /// Returns an error when export fails.
    pub fn export_snapshot(&self, out_dir: &std::path::Path) -> Result<ExportManifest> {
        let store = self.open_store()?;
        store.export_snapshot(out_dir)
    }

    /// Create a SQLite backup file.
    ///
    /// # Errors
    /// Returns an error when the backup fails.
    pub fn backup(&self, out_file: &std::path::Path) -> Result<()> {
        let store = self.open_store()?;
        store.backup_database(out_file)
    }

    /// Restore from a SQLite backup file, then migrate.
    ///
    /// # Errors
    /// Returns an error when the restore or migration fails.
    pub fn restore(&self, in_file: &std::path::Path) -> Result<()> {
        let mut store = self.open_store()?;
        store.restore_database(in_file)
    }

    /// Run the database health probes.
    ///
    /// # Errors
    /// Returns an error when any probe fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    fn aggregate_with(
        store: &SqliteStore,
        user_id: &str,
        as_of: OffsetDateTime,
    ) -> Result<WealthSummary> {
        let settings = store.get_user_settings(user_id)?;
        let items = store.list_items(user_id)?;
        let deductions = store.list_deductions(user_id)?;
        let rates = store.load_rates(user_id)?;
        let summary =
            aggregate_wealth(&items, &deductions, &rates, &settings.methodology.config(), as_of)?;
        Ok(summary)
    }

    /// Keep an open draft's amounts current with the user's item set.
    fn refresh_open_draft(
        &self,
        store: &mut SqliteStore,
        user_id: &str,
        as_of: OffsetDateTime,
    ) -> Result<()> {
        let Some(mut draft) = store.open_draft(user_id)? else {
            return Ok(());
        };
        let summary = Self::aggregate_with(store, user_id, as_of)?;
        draft.refresh_amounts(summary.zakatable_minor)?;
        store.update_draft_amounts(draft.record_id, draft.aggregate_minor, draft.obligation_minor)?;
        debug!(user_id, record_id = %draft.record_id, "open draft recalculated");
        Ok(())
    }

    fn load_record(store: &SqliteStore, record_id: RecordId) -> Result<CycleRecord> {
        store
            .get_record(record_id)?
            .ok_or_else(|| anyhow!("no record found with id {record_id}"))
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;
    use time::Duration;
    use ulid::Ulid;
    use zakat_kernel_core::{AuditEventKind, Commodity};

    use super::*;

    fn usd() -> Currency {
        match Currency::parse("USD") {
            Ok(currency) => currency,
            Err(err) => panic!("USD should parse: {err}"),
        }
    }

    fn temp_api() -> ZakatKernelApi {
        let dir = std::env::temp_dir().join(format!("zakat-api-test-{}", Ulid::new()));
        if let Err(err) = std::fs::create_dir_all(&dir) {
            panic!("temp dir should be creatable: {err}");
        }
        ZakatKernelApi::new(dir.join("kernel.db"))
    }

    fn seed_silver_quote(api: &ZakatKernelApi, price_minor_per_gram: i64, as_of: OffsetDateTime) {
        let quote = PriceQuote {
            commodity: Commodity::Silver,
            price_minor_per_gram,
            currency: usd(),
            as_of,
        };
        if let Err(err) = api.record_quote(&quote) {
            panic!("quote should store: {err}");
        }
    }

    fn add_cash(api: &ZakatKernelApi, user_id: &str, value_minor: i64, now: OffsetDateTime) -> Item {
        let request = AddItemRequest {
            user_id: user_id.to_owned(),
            category: ItemCategory::Cash,
            value_minor,
            currency: usd(),
            acquired_at: Some(now - Duration::days(10)),
            is_passive_holding: None,
            is_restricted_access: None,
        };
        match api.add_item(request, now) {
            Ok(item) => item,
            Err(err) => panic!("item should add: {err}"),
        }
    }

    #[test]
    fn retirement_accounts_default_to_restricted_access() {
        let api = temp_api();
        let now = datetime!(2025-06-27 12:00 UTC);
        let request = AddItemRequest {
            user_id: "user-1".to_owned(),
            category: ItemCategory::RetirementAccount,
            value_minor: 10_000_000,
            currency: usd(),
            acquired_at: None,
            is_passive_holding: None,
            is_restricted_access: None,
        };
        let item = match api.add_item(request, now) {
            Ok(item) => item,
            Err(err) => panic!("item should add: {err}"),
        };
        assert!(item.is_restricted_access);
        assert!(!item.is_passive_holding);

        let summary = match api.aggregate_wealth("user-1", now) {
            Ok(summary) => summary,
            Err(err) => panic!("aggregate should succeed: {err}"),
        };
        assert_eq!(summary.zakatable_minor, 0);
    }

    #[test]
    fn threshold_fails_without_a_cached_quote() {
        let api = temp_api();
        let now = datetime!(2025-06-27 12:00 UTC);
        assert!(api.compute_threshold("user-1", now).is_err());
    }

    #[test]
    fn interruption_discards_the_draft() {
        // Wealth crosses the threshold on day 0, falls below it on day 100.
        let api = temp_api();
        let day_0 = datetime!(2025-06-27 12:00 UTC);
        // 8.00/g silver puts the threshold near 4,898.89.
        seed_silver_quote(&api, 800, day_0);
        let item = add_cash(&api, "user-1", 600_000, day_0);

        let started = match api.detect_cycle("user-1", day_0) {
            Ok(outcome) => outcome,
            Err(err) => panic!("detection should succeed: {err}"),
        };
        assert_eq!(started.event, CycleEvent::Started);
        let record = match started.record {
            Some(record) => record,
            None => panic!("started cycle should carry a draft"),
        };

        let day_100 = day_0 + Duration::days(100);
        seed_silver_quote(&api, 800, day_100);
        if let Err(err) = api.update_item(item.item_id, Some(400_000), None, None, None, day_100) {
            panic!("update should succeed: {err}");
        }

        let interrupted = match api.detect_cycle("user-1", day_100) {
            Ok(outcome) => outcome,
            Err(err) => panic!("detection should succeed: {err}"),
        };
        assert_eq!(interrupted.event, CycleEvent::Interrupted);
        assert!(interrupted.record.is_none());
        assert!(api.get_record(record.record_id).is_err());
    }

    #[test]
    fn detection_is_idempotent_for_a_running_cycle() {
        let api = temp_api();
        let day_0 = datetime!(2025-06-27 12:00 UTC);
        seed_silver_quote(&api, 800, day_0);
        add_cash(&api, "user-1", 600_000, day_0);

        let first = match api.detect_cycle("user-1", day_0) {
            Ok(outcome) => outcome,
            Err(err) => panic!("detection should succeed: {err}"),
        };
        assert_eq!(first.event, CycleEvent::Started);

        let day_1 = day_0 + Duration::days(1);
        let second = match api.detect_cycle("user-1", day_1) {
            Ok(outcome) => outcome,
            Err(err) => panic!("detection should succeed: {err}"),
        };
        assert_eq!(second.event, CycleEvent::Continued);
        let (first_record, second_record) = match (first.record, second.record) {
            (Some(first_record), Some(second_record)) => (first_record, second_record),
            _ => panic!("both passes should carry the draft"),
        };
        assert_eq!(first_record.record_id, second_record.record_id);
    }

    #[test]
    fn item_changes_recalculate_the_open_draft() {
        let api = temp_api();
        let day_0 = datetime!(2025-06-27 12:00 UTC);
        seed_silver_quote(&api, 800, day_0);
        let item = add_cash(&api, "user-1", 600_000, day_0);

        let outcome = match api.detect_cycle("user-1", day_0) {
            Ok(outcome) => outcome,
            Err(err) => panic!("detection should succeed: {err}"),
        };
        let record = match outcome.record {
            Some(record) => record,
            None => panic!("started cycle should carry a draft"),
        };
        assert_eq!(record.aggregate_minor, 600_000);

        if let Err(err) = api.update_item(item.item_id, Some(800_000), None, None, None, day_0) {
            panic!("update should succeed: {err}");
        }
        let refreshed = match api.get_record(record.record_id) {
            Ok(refreshed) => refreshed,
            Err(err) => panic!("record should load: {err}"),
        };
        assert_eq!(refreshed.aggregate_minor, 800_000);
        assert_eq!(refreshed.obligation_minor, 20_000);
    }

    #[test]
    fn full_lifecycle_yields_the_five_entry_ledger() {
        let api = temp_api();
        let day_0 = datetime!(2025-06-27 12:00 UTC);
        seed_silver_quote(&api, 800, day_0);
        add_cash(&api, "user-1", 600_000, day_0);

        let outcome = match api.detect_cycle("user-1", day_0) {
            Ok(outcome) => outcome,
            Err(err) => panic!("detection should succeed: {err}"),
        };
        let record = match outcome.record {
            Some(record) => record,
            None => panic!("started cycle should carry a draft"),
        };
        let record_id = record.record_id;
        let completion = record.scheduled_completion;

        // Premature finalize is refused without the acknowledgement.
        assert!(api.finalize(record_id, "user-1", day_0 + Duration::days(30), false).is_err());

        if let Err(err) = api.finalize(record_id, "user-1", completion, false) {
            panic!("finalize should succeed: {err}");
        }
        if let Err(err) = api.unlock(
            record_id,
            "user-1",
            completion + Duration::days(2),
            "corrected clerical entry error",
        ) {
            panic!("unlock should succeed: {err}");
        }
        let edit = RecordEdit { aggregate_minor: Some(550_000), ..RecordEdit::default() };
        if let Err(err) =
            api.edit_unlocked(record_id, "user-1", completion + Duration::days(2), &edit)
        {
            panic!("edit should succeed: {err}");
        }
        let record = match api.refinalize(record_id, "user-1", completion + Duration::days(2)) {
            Ok(record) => record,
            Err(err) => panic!("refinalize should succeed: {err}"),
        };
        assert_eq!(record.status, RecordStatus::Finalized);
        assert_eq!(record.aggregate_minor, 550_000);

        let trail = match api.audit_trail(record_id) {
            Ok(trail) => trail,
            Err(err) => panic!("trail should load: {err}"),
        };
        let kinds: Vec<AuditEventKind> = trail.iter().map(|entry| entry.kind).collect();
        assert_eq!(
            kinds,
            vec![
                AuditEventKind::Created,
                AuditEventKind::Finalized,
                AuditEventKind::Unlocked,
                AuditEventKind::Edited,
                AuditEventKind::Refinalized,
            ]
        );

        // Finalized records cannot be deleted.
        assert!(api.delete_record(record_id).is_err());
    }
}
