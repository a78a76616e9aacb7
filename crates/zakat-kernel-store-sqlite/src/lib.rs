use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;
use zakat_kernel_core::{
    AuditEntry, AuditEntryId, AuditEventKind, Commodity, Currency, CycleRecord, Deduction,
    DeductionId, ExchangeRates, HijriDate, Item, ItemCategory, ItemId, Methodology,
    KernelError, MethodologyConfig, PriceQuote, QuotePair, RecordId, RecordStatus,
};

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS items (
  item_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  category TEXT NOT NULL CHECK (category IN ('cash','precious-metal','security','retirement-account','business-inventory','property','other')),
  value_minor INTEGER NOT NULL CHECK (value_minor >= 0),
  currency TEXT NOT NULL,
  acquired_at TEXT NOT NULL,
  is_passive_holding INTEGER NOT NULL CHECK (is_passive_holding IN (0, 1)),
  is_restricted_access INTEGER NOT NULL CHECK (is_restricted_access IN (0, 1)),
  active INTEGER NOT NULL CHECK (active IN (0, 1))
);

CREATE TABLE IF NOT EXISTS deductions (
  deduction_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  label TEXT NOT NULL,
  amount_minor INTEGER NOT NULL CHECK (amount_minor >= 0),
  currency TEXT NOT NULL,
  eligible INTEGER NOT NULL CHECK (eligible IN (0, 1))
);

CREATE TABLE IF NOT EXISTS exchange_rates (
  user_id TEXT NOT NULL,
  currency TEXT NOT NULL,
  rate_ppm INTEGER NOT NULL CHECK (rate_ppm > 0),
  updated_at TEXT NOT NULL,
  PRIMARY KEY (user_id, currency)
);

CREATE TABLE IF NOT EXISTS price_quotes (
  commodity TEXT PRIMARY KEY CHECK (commodity IN ('gold','silver')),
  price_minor_per_gram INTEGER NOT NULL CHECK (price_minor_per_gram > 0),
  currency TEXT NOT NULL,
  as_of TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS custom_methodologies (
  user_id TEXT NOT NULL,
  name TEXT NOT NULL,
  config_json TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (user_id, name)
);

CREATE TABLE IF NOT EXISTS user_methodologies (
  user_id TEXT PRIMARY KEY,
  methodology TEXT NOT NULL CHECK (methodology IN ('hanafi','shafii','maliki','hanbali','custom')),
  custom_name TEXT,
  base_currency TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cycle_records (
  record_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  cycle_start TEXT NOT NULL,
  hijri_year INTEGER NOT NULL,
  hijri_month INTEGER NOT NULL CHECK (hijri_month BETWEEN 1 AND 12),
  hijri_day INTEGER NOT NULL CHECK (hijri_day BETWEEN 1 AND 30),
  scheduled_completion TEXT NOT NULL,
  threshold_minor INTEGER NOT NULL CHECK (threshold_minor > 0),
  threshold_currency TEXT NOT NULL,
  methodology_name TEXT NOT NULL,
  methodology_json TEXT NOT NULL,
  aggregate_minor INTEGER NOT NULL CHECK (aggregate_minor >= 0),
  obligation_minor INTEGER NOT NULL CHECK (obligation_minor >= 0),
  status TEXT NOT NULL CHECK (status IN ('draft','finalized','unlocked')),
  finalized_at TEXT
);

CREATE TABLE IF NOT EXISTS audit_entries (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  audit_entry_id TEXT NOT NULL UNIQUE,
  record_id TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('created','finalized','unlocked','edited','refinalized')),
  actor TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  justification TEXT,
  before_json TEXT,
  after_json TEXT,
  FOREIGN KEY (record_id) REFERENCES cycle_records(record_id)
);

CREATE INDEX IF NOT EXISTS idx_items_user ON items(user_id);
CREATE INDEX IF NOT EXISTS idx_deductions_user ON deductions(user_id);
CREATE INDEX IF NOT EXISTS idx_cycle_records_user ON cycle_records(user_id);
CREATE INDEX IF NOT EXISTS idx_cycle_records_status ON cycle_records(status);
CREATE UNIQUE INDEX IF NOT EXISTS idx_cycle_records_open_draft
  ON cycle_records(user_id) WHERE status = 'draft';
CREATE INDEX IF NOT EXISTS idx_audit_entries_record ON audit_entries(record_id);
";

pub struct SqliteStore {
    conn: Connection,
}

/// A user's effective calculation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSettings {
    pub user_id: String,
    pub methodology: Methodology,
    pub base_currency: Currency,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
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
    /// Open a SQLite-backed store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
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
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Insert a new item after core validation.
    ///
    /// # Errors
    /// Returns an error when validation or the insert fails.
    pub fn insert_item(&mut self, item: &Item) -> Result<()> {
        item.validate().map_err(|err| anyhow!("item validation failed: {err}"))?;

        self.conn
            .execute(
                "INSERT INTO items(
                    item_id, user_id, category, value_minor, currency, acquired_at,
                    is_passive_holding, is_restricted_access, active
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    item.item_id.to_string(),
                    item.user_id,
                    item.category.as_str(),
                    item.value_minor,
                    item.currency.as_str(),
                    rfc3339(item.acquired_at)?,
                    i64::from(item.is_passive_holding),
                    i64::from(item.is_restricted_access),
                    i64::from(item.active),
                ],
            )
            .context("failed to insert item")?;
        Ok(())
    }

    /// Update an item's value, currency, and flags in place.
    ///
    /// # Errors
    /// Returns an error when validation fails or the item does not exist.
    pub fn update_item(&mut self, item: &Item) -> Result<()> {
        item.validate().map_err(|err| anyhow!("item validation failed: {err}"))?;

        let affected = self
            .conn
            .execute(
                "UPDATE items SET
                    value_minor = ?2, currency = ?3,
                    is_passive_holding = ?4, is_restricted_access = ?5
                 WHERE item_id = ?1",
                params![
                    item.item_id.to_string(),
                    item.value_minor,
                    item.currency.as_str(),
                    i64::from(item.is_passive_holding),
                    i64::from(item.is_restricted_access),
                ],
            )
            .context("failed to update item")?;
        if affected == 0 {
            return Err(anyhow!("no item found with id {}", item.item_id));
        }
        Ok(())
    }

    /// Change an item's category. Both valuation flags are reset to false.
    ///
    /// # Errors
    /// Returns an error when the item does not exist or the write fails.
    pub fn set_item_category(&mut self, item_id: ItemId, category: ItemCategory) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "UPDATE items SET category = ?2, is_passive_holding = 0, is_restricted_access = 0
                 WHERE item_id = ?1",
                params![item_id.to_string(), category.as_str()],
            )
            .context("failed to change item category")?;
        if affected == 0 {
            return Err(anyhow!("no item found with id {item_id}"));
        }
        Ok(())
    }

    /// Soft-deactivate an item so historical aggregates stay reproducible.
    ///
    /// # Errors
    /// Returns an error when the item does not exist or the write fails.
    pub fn deactivate_item(&mut self, item_id: ItemId) -> Result<()> {
        let affected = self
            .conn
            .execute("UPDATE items SET active = 0 WHERE item_id = ?1", params![
                item_id.to_string()
            ])
            .context("failed to deactivate item")?;
        if affected == 0 {
            return Err(anyhow!("no item found with id {item_id}"));
        }
        Ok(())
    }

    /// Load one item by id.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_item(&self, item_id: ItemId) -> Result<Option<Item>> {
        let mut stmt = self.conn.prepare(
            "SELECT item_id, user_id, category, value_minor, currency, acquired_at,
                    is_passive_holding, is_restricted_access, active
             FROM items WHERE item_id = ?1",
        )?;
        let mut rows = stmt.query(params![item_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(decode_item_row(row)?)),
            None => Ok(None),
        }
    }

    /// Load all items for one user in a deterministic order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_items(&self, user_id: &str) -> Result<Vec<Item>> {
        let mut stmt = self.conn.prepare(
            "SELECT item_id, user_id, category, value_minor, currency, acquired_at,
                    is_passive_holding, is_restricted_access, active
             FROM items WHERE user_id = ?1
             ORDER BY item_id ASC",
        )?;
        let mut rows = stmt.query(params![user_id])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(decode_item_row(row)?);
        }
        Ok(items)
    }

    /// Insert a deduction after core validation.
    ///
    /// # Errors
    /// Returns an error when validation or the insert fails.
    pub fn insert_deduction(&mut self, deduction: &Deduction) -> Result<()> {
        deduction.validate().map_err(|err| anyhow!("deduction validation failed: {err}"))?;

        self.conn
            .execute(
                "INSERT INTO deductions(deduction_id, user_id, label, amount_minor, currency, eligible)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    deduction.deduction_id.to_string(),
                    deduction.user_id,
                    deduction.label,
                    deduction.amount_minor,
                    deduction.currency.as_str(),
                    i64::from(deduction.eligible),
                ],
            )
            .context("failed to insert deduction")?;
        Ok(())
    }

    /// Load all deductions for one user in a deterministic order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_deductions(&self, user_id: &str) -> Result<Vec<Deduction>> {
        let mut stmt = self.conn.prepare(
            "SELECT deduction_id, user_id, label, amount_minor, currency, eligible
             FROM deductions WHERE user_id = ?1
             ORDER BY deduction_id ASC",
        )?;
        let mut rows = stmt.query(params![user_id])?;
        let mut deductions = Vec::new();
        while let Some(row) = rows.next()? {
            deductions.push(Deduction {
                deduction_id: DeductionId(parse_ulid(&row.get::<_, String>(0)?)?),
                user_id: row.get(1)?,
                label: row.get(2)?,
                amount_minor: row.get(3)?,
                currency: parse_currency(&row.get::<_, String>(4)?)?,
                eligible: row.get::<_, i64>(5)? == 1,
            });
        }
        Ok(deductions)
    }

    /// Register or replace one exchange rate for a user.
    ///
    /// # Errors
    /// Returns an error for a non-positive rate or when the write fails.
    pub fn set_rate(&mut self, user_id: &str, currency: &Currency, rate_ppm: i64) -> Result<()> {
        if rate_ppm <= 0 {
            return Err(anyhow!("exchange rate MUST be positive, got {rate_ppm} ppm"));
        }
        self.conn
            .execute(
                "INSERT INTO exchange_rates(user_id, currency, rate_ppm, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, currency) DO UPDATE SET
                    rate_ppm = excluded.rate_ppm, updated_at = excluded.updated_at",
                params![user_id, currency.as_str(), rate_ppm, now_rfc3339()?],
            )
            .context("failed to upsert exchange rate")?;
        Ok(())
    }

    /// Build the conversion table for one user from the stored rates and the
    /// user's base currency.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn load_rates(&self, user_id: &str) -> Result<ExchangeRates> {
        let settings = self.get_user_settings(user_id)?;
        let mut rates = ExchangeRates::new(settings.base_currency);

        let mut stmt = self.conn.prepare(
            "SELECT currency, rate_ppm FROM exchange_rates WHERE user_id = ?1 ORDER BY currency ASC",
        )?;
        let mut rows = stmt.query(params![user_id])?;
        while let Some(row) = rows.next()? {
            let currency = parse_currency(&row.get::<_, String>(0)?)?;
            let rate_ppm: i64 = row.get(1)?;
            rates
                .set_rate(currency, rate_ppm)
                .map_err(|err| anyhow!("stored rate is invalid: {err}"))?;
        }
        Ok(rates)
    }

    /// Cache the most recent quote for a commodity, replacing any older one.
    ///
    /// # Errors
    /// Returns an error when validation or the write fails.
    pub fn record_quote(&mut self, quote: &PriceQuote) -> Result<()> {
        quote.validate().map_err(|err| anyhow!("quote validation failed: {err}"))?;

        self.conn
            .execute(
                "INSERT INTO price_quotes(commodity, price_minor_per_gram, currency, as_of)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(commodity) DO UPDATE SET
                    price_minor_per_gram = excluded.price_minor_per_gram,
                    currency = excluded.currency,
                    as_of = excluded.as_of",
                params![
                    quote.commodity.as_str(),
                    quote.price_minor_per_gram,
                    quote.currency.as_str(),
                    rfc3339(quote.as_of)?,
                ],
            )
            .context("failed to cache price quote")?;
        Ok(())
    }

    /// Load the cached quotes for both commodities. Either side may be absent.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn load_quotes(&self) -> Result<QuotePair> {
        let mut stmt = self.conn.prepare(
            "SELECT commodity, price_minor_per_gram, currency, as_of FROM price_quotes",
        )?;
        let mut rows = stmt.query([])?;
        let mut pair = QuotePair::default();
        while let Some(row) = rows.next()? {
            let commodity_raw: String = row.get(0)?;
            let commodity = Commodity::parse(&commodity_raw)
                .ok_or_else(|| anyhow!("unknown commodity: {commodity_raw}"))?;
            let quote = PriceQuote {
                commodity,
                price_minor_per_gram: row.get(1)?,
                currency: parse_currency(&row.get::<_, String>(2)?)?,
                as_of: parse_rfc3339(&row.get::<_, String>(3)?)?,
            };
            match commodity {
                Commodity::Gold => pair.gold = Some(quote),
                Commodity::Silver => pair.silver = Some(quote),
            }
        }
        Ok(pair)
    }

    /// A user's settings row, defaulting to Hanafi over USD when none exists.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_user_settings(&self, user_id: &str) -> Result<UserSettings> {
        let mut stmt = self.conn.prepare(
            "SELECT methodology, custom_name, base_currency FROM user_methodologies
             WHERE user_id = ?1",
        )?;
        let row = stmt
            .query_row(params![user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .optional()?;

        let Some((methodology_raw, custom_name, base_currency_raw)) = row else {
            return Ok(UserSettings {
                user_id: user_id.to_owned(),
                methodology: Methodology::Hanafi,
                base_currency: parse_currency("USD")?,
            });
        };

        let methodology = if methodology_raw == "custom" {
            let name = custom_name
                .ok_or_else(|| anyhow!("custom methodology selected without a name"))?;
            let config = self.get_custom_methodology(user_id, &name)?.ok_or_else(|| {
                anyhow!("custom methodology `{name}` is selected but not stored")
            })?;
            Methodology::Custom(config)
        } else {
            Methodology::parse_builtin(&methodology_raw)
                .ok_or_else(|| anyhow!("unknown methodology: {methodology_raw}"))?
        };

        Ok(UserSettings {
            user_id: user_id.to_owned(),
            methodology,
            base_currency: parse_currency(&base_currency_raw)?,
        })
    }

    /// Select a methodology (and base currency) for a user. A custom
    /// methodology is stored as its own row and referenced by name.
    ///
    /// # Errors
    /// Returns an error when validation, storage, or the upsert fails.
    pub fn set_user_methodology(
        &mut self,
        user_id: &str,
        methodology: &Methodology,
        base_currency: &Currency,
    ) -> Result<()> {
        methodology
            .config()
            .validate()
            .map_err(|err| anyhow!("methodology validation failed: {err}"))?;

        let custom_name = match methodology {
            Methodology::Custom(config) => {
                self.save_custom_methodology(user_id, config)?;
                Some(config.name.clone())
            }
            _ => None,
        };

        self.conn
            .execute(
                "INSERT INTO user_methodologies(user_id, methodology, custom_name, base_currency, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id) DO UPDATE SET
                    methodology = excluded.methodology,
                    custom_name = excluded.custom_name,
                    base_currency = excluded.base_currency,
                    updated_at = excluded.updated_at",
                params![
                    user_id,
                    methodology.as_str(),
                    custom_name,
                    base_currency.as_str(),
                    now_rfc3339()?,
                ],
            )
            .context("failed to upsert user methodology")?;
        Ok(())
    }

    /// Store or replace a user-owned methodology configuration.
    ///
    /// A configuration referenced by a finalized or unlocked record is
    /// immutable; those records carry their own frozen copy.
    ///
    /// # Errors
    /// Returns an error when validation fails or the configuration is locked.
    pub fn save_custom_methodology(
        &mut self,
        user_id: &str,
        config: &MethodologyConfig,
    ) -> Result<()> {
        config.validate().map_err(|err| anyhow!("methodology validation failed: {err}"))?;

        let locked = self
            .conn
            .query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM cycle_records
                    WHERE user_id = ?1 AND methodology_name = ?2 AND status != 'draft'
                )",
                params![user_id, config.name],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to check methodology references")?;
        if locked == 1 {
            return Err(anyhow!(
                "methodology `{}` is referenced by a locked record and cannot be changed",
                config.name
            ));
        }

        self.conn
            .execute(
                "INSERT INTO custom_methodologies(user_id, name, config_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, name) DO UPDATE SET
                    config_json = excluded.config_json, updated_at = excluded.updated_at",
                params![
                    user_id,
                    config.name,
                    serde_json::to_string(config).context("failed to serialize methodology")?,
                    now_rfc3339()?,
                ],
            )
            .context("failed to upsert custom methodology")?;
        Ok(())
    }

    /// Load one user-owned methodology configuration by name.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_custom_methodology(
        &self,
        user_id: &str,
        name: &str,
    ) -> Result<Option<MethodologyConfig>> {
        let json = self
            .conn
            .prepare(
                "SELECT config_json FROM custom_methodologies WHERE user_id = ?1 AND name = ?2",
            )?
            .query_row(params![user_id, name], |row| row.get::<_, String>(0))
            .optional()?;
        match json {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).context("failed to deserialize stored methodology")?,
            )),
            None => Ok(None),
        }
    }

    /// Insert a new cycle record together with its first ledger entry.
    ///
    /// A partial unique index allows at most one open draft per user, so two
    /// racing detection passes that both observed "no open draft" cannot
    /// each create one; the second insert fails.
    ///
    /// # Errors
    /// Returns an error when validation fails, a draft is already open for
    /// the user, or any write in the transaction fails.
    pub fn insert_record(&mut self, record: &CycleRecord, entry: &AuditEntry) -> Result<()> {
        record.validate().map_err(|err| anyhow!("record validation failed: {err}"))?;
        entry.validate().map_err(|err| anyhow!("audit entry validation failed: {err}"))?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO cycle_records(
                record_id, user_id, cycle_start, hijri_year, hijri_month, hijri_day,
                scheduled_completion, threshold_minor, threshold_currency,
                methodology_name, methodology_json, aggregate_minor, obligation_minor,
                status, finalized_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                record.record_id.to_string(),
                record.user_id,
                rfc3339(record.cycle_start)?,
                i64::from(record.cycle_start_hijri.year),
                i64::from(record.cycle_start_hijri.month),
                i64::from(record.cycle_start_hijri.day),
                rfc3339(record.scheduled_completion)?,
                record.threshold_minor,
                record.threshold_currency.as_str(),
                methodology_name(&record.methodology),
                serde_json::to_string(&record.methodology)
                    .context("failed to serialize methodology")?,
                record.aggregate_minor,
                record.obligation_minor,
                record.status.as_str(),
                record.finalized_at.map(rfc3339).transpose()?,
            ],
        )
        .context("failed to insert cycle record")?;

        append_audit_entry(&tx, entry)?;
        tx.commit().context("failed to commit record transaction")?;
        Ok(())
    }

    /// Load one cycle record by id.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_record(&self, record_id: RecordId) -> Result<Option<CycleRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{RECORD_SELECT_SQL} WHERE record_id = ?1"
        ))?;
        let mut rows = stmt.query(params![record_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(decode_record_row(row)?)),
            None => Ok(None),
        }
    }

    /// The user's open draft record, if one exists.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn open_draft(&self, user_id: &str) -> Result<Option<CycleRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{RECORD_SELECT_SQL} WHERE user_id = ?1 AND status = 'draft'
             ORDER BY cycle_start ASC, record_id ASC LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![user_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(decode_record_row(row)?)),
            None => Ok(None),
        }
    }

    /// Load all of a user's cycle records in a deterministic order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_records(&self, user_id: &str) -> Result<Vec<CycleRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{RECORD_SELECT_SQL} WHERE user_id = ?1
             ORDER BY cycle_start ASC, record_id ASC"
        ))?;
        let mut rows = stmt.query(params![user_id])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(decode_record_row(row)?);
        }
        Ok(records)
    }

    /// Refresh a draft's amounts. The status guard in the WHERE clause makes
    /// a refresh racing against finalization lose cleanly.
    ///
    /// # Errors
    /// Returns an error when the record is not a draft or the write fails.
    pub fn update_draft_amounts(
        &mut self,
        record_id: RecordId,
        aggregate_minor: i64,
        obligation_minor: i64,
    ) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "UPDATE cycle_records SET aggregate_minor = ?2, obligation_minor = ?3
                 WHERE record_id = ?1 AND status = 'draft'",
                params![record_id.to_string(), aggregate_minor, obligation_minor],
            )
            .context("failed to refresh draft amounts")?;
        if affected == 0 {
            return Err(anyhow!("record {record_id} is not an open draft"));
        }
        Ok(())
    }

    /// Persist a state transition produced by the core lifecycle functions,
    /// appending its ledger entry in the same transaction.
    ///
    /// The UPDATE is guarded by the expected prior status (compare and
    /// transition); a lost race affects zero rows and the call fails without
    /// writing anything.
    ///
    /// # Errors
    /// Returns an error when validation fails, the guard does not match, or
    /// any write in the transaction fails.
    pub fn apply_transition(
        &mut self,
        record: &CycleRecord,
        expected_from: RecordStatus,
        entry: &AuditEntry,
    ) -> Result<()> {
        record.validate().map_err(|err| anyhow!("record validation failed: {err}"))?;
        entry.validate().map_err(|err| anyhow!("audit entry validation failed: {err}"))?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        let affected = tx
            .execute(
                "UPDATE cycle_records SET
                    methodology_name = ?2, methodology_json = ?3,
                    aggregate_minor = ?4, obligation_minor = ?5,
                    status = ?6, finalized_at = ?7
                 WHERE record_id = ?1 AND status = ?8",
                params![
                    record.record_id.to_string(),
                    methodology_name(&record.methodology),
                    serde_json::to_string(&record.methodology)
                        .context("failed to serialize methodology")?,
                    record.aggregate_minor,
                    record.obligation_minor,
                    record.status.as_str(),
                    record.finalized_at.map(rfc3339).transpose()?,
                    expected_from.as_str(),
                ],
            )
            .context("failed to apply record transition")?;
        if affected == 0 {
            return Err(anyhow!(
                "record {} is no longer {}; transition refused",
                record.record_id,
                expected_from
            ));
        }

        append_audit_entry(&tx, entry)?;
        tx.commit().context("failed to commit transition transaction")?;
        Ok(())
    }

    /// Delete a record, permitted only while it is a draft. The draft's
    /// ledger rows are removed with it; once a record has been finalized its
    /// ledger is permanent.
    ///
    /// # Errors
    /// Returns an error when the record is missing, locked, or the delete fails.
    pub fn delete_draft(&mut self, record_id: RecordId) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;

        let status = tx
            .query_row(
                "SELECT status FROM cycle_records WHERE record_id = ?1",
                params![record_id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        let Some(status) = status else {
            return Err(anyhow!("no record found with id {record_id}"));
        };
        let status = RecordStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown record status: {status}"))?;
        if status != RecordStatus::Draft {
            return Err(KernelError::RecordLocked { status }.into());
        }

        tx.execute("DELETE FROM audit_entries WHERE record_id = ?1", params![
            record_id.to_string()
        ])
        .context("failed to delete draft ledger rows")?;
        tx.execute("DELETE FROM cycle_records WHERE record_id = ?1", params![
            record_id.to_string()
        ])
        .context("failed to delete draft record")?;
        tx.commit().context("failed to commit delete transaction")?;
        Ok(())
    }

    /// The ledger for one record, in append order. No mutation path for
    /// these rows exists anywhere in this crate.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn audit_trail(&self, record_id: RecordId) -> Result<Vec<AuditEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT audit_entry_id, record_id, kind, actor, recorded_at,
                    justification, before_json, after_json
             FROM audit_entries WHERE record_id = ?1
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![record_id.to_string()])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let kind_raw: String = row.get(2)?;
            let kind = AuditEventKind::parse(&kind_raw)
                .ok_or_else(|| anyhow!("unknown audit event kind: {kind_raw}"))?;
            entries.push(AuditEntry {
                audit_entry_id: AuditEntryId(parse_ulid(&row.get::<_, String>(0)?)?),
                record_id: RecordId(parse_ulid(&row.get::<_, String>(1)?)?),
                kind,
                actor: row.get(3)?,
                recorded_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
                justification: row.get(5)?,
                before: parse_optional_json(row.get::<_, Option<String>>(6)?)?,
                after: parse_optional_json(row.get::<_, Option<String>>(7)?)?,
            });
        }
        Ok(entries)
    }

    /// Export all tables as deterministic NDJSON plus a SHA-256 manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let mut files = Vec::new();

        let items = self.all_items()?;
        files.push(export_file(out_dir, "items.ndjson", &items)?);

        let deductions = self.all_deductions()?;
        files.push(export_file(out_dir, "deductions.ndjson", &deductions)?);

        let records = self.all_records()?;
        files.push(export_file(out_dir, "cycle_records.ndjson", &records)?);

        let entries = self.all_audit_entries()?;
        files.push(export_file(out_dir, "audit_entries.ndjson", &entries)?);

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files,
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Create a SQLite backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a SQLite backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
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

    fn all_items(&self) -> Result<Vec<Item>> {
        let mut stmt = self.conn.prepare(
            "SELECT item_id, user_id, category, value_minor, currency, acquired_at,
                    is_passive_holding, is_restricted_access, active
             FROM items ORDER BY item_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(decode_item_row(row)?);
        }
        Ok(items)
    }

    fn all_deductions(&self) -> Result<Vec<Deduction>> {
        let mut stmt = self.conn.prepare(
            "SELECT deduction_id, user_id, label, amount_minor, currency, eligible
             FROM deductions ORDER BY deduction_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut deductions = Vec::new();
        while let Some(row) = rows.next()? {
            deductions.push(Deduction {
                deduction_id: DeductionId(parse_ulid(&row.get::<_, String>(0)?)?),
                user_id: row.get(1)?,
                label: row.get(2)?,
                amount_minor: row.get(3)?,
                currency: parse_currency(&row.get::<_, String>(4)?)?,
                eligible: row.get::<_, i64>(5)? == 1,
            });
        }
        Ok(deductions)
    }

    fn all_records(&self) -> Result<Vec<CycleRecord>> {
        let mut stmt =
            self.conn.prepare(&format!("{RECORD_SELECT_SQL} ORDER BY record_id ASC"))?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(decode_record_row(row)?);
        }
        Ok(records)
    }

    fn all_audit_entries(&self) -> Result<Vec<AuditEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT audit_entry_id, record_id, kind, actor, recorded_at,
                    justification, before_json, after_json
             FROM audit_entries ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let kind_raw: String = row.get(2)?;
            let kind = AuditEventKind::parse(&kind_raw)
                .ok_or_else(|| anyhow!("unknown audit event kind: {kind_raw}"))?;
            entries.push(AuditEntry {
                audit_entry_id: AuditEntryId(parse_ulid(&row.get::<_, String>(0)?)?),
                record_id: RecordId(parse_ulid(&row.get::<_, String>(1)?)?),
                kind,
                actor: row.get(3)?,
                recorded_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
                justification: row.get(5)?,
                before: parse_optional_json(row.get::<_, Option<String>>(6)?)?,
                after: parse_optional_json(row.get::<_, Option<String>>(7)?)?,
            });
        }
        Ok(entries)
    }
}

const RECORD_SELECT_SQL: &str = "SELECT
    record_id, user_id, cycle_start, hijri_year, hijri_month, hijri_day,
    scheduled_completion, threshold_minor, threshold_currency,
    methodology_json, aggregate_minor, obligation_minor, status, finalized_at
 FROM cycle_records";

fn append_audit_entry(tx: &rusqlite::Transaction<'_>, entry: &AuditEntry) -> Result<()> {
    tx.execute(
        "INSERT INTO audit_entries(
            audit_entry_id, record_id, kind, actor, recorded_at,
            justification, before_json, after_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.audit_entry_id.to_string(),
            entry.record_id.to_string(),
            entry.kind.as_str(),
            entry.actor,
            rfc3339(entry.recorded_at)?,
            entry.justification,
            entry
                .before
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("failed to serialize before snapshot")?,
            entry
                .after
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("failed to serialize after snapshot")?,
        ],
    )
    .context("failed to append audit entry")?;
    Ok(())
}

fn decode_item_row(row: &rusqlite::Row<'_>) -> Result<Item> {
    let category_raw: String = row.get(2)?;
    let category = ItemCategory::parse(&category_raw)
        .ok_or_else(|| anyhow!("unknown item category: {category_raw}"))?;
    Ok(Item {
        item_id: ItemId(parse_ulid(&row.get::<_, String>(0)?)?),
        user_id: row.get(1)?,
        category,
        value_minor: row.get(3)?,
        currency: parse_currency(&row.get::<_, String>(4)?)?,
        acquired_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
        is_passive_holding: row.get::<_, i64>(6)? == 1,
        is_restricted_access: row.get::<_, i64>(7)? == 1,
        active: row.get::<_, i64>(8)? == 1,
    })
}

fn decode_record_row(row: &rusqlite::Row<'_>) -> Result<CycleRecord> {
    let status_raw: String = row.get(12)?;
    let status = RecordStatus::parse(&status_raw)
        .ok_or_else(|| anyhow!("unknown record status: {status_raw}"))?;
    let methodology_json: String = row.get(9)?;
    let hijri_year = i32::try_from(row.get::<_, i64>(3)?).context("hijri year out of range")?;
    let hijri_month = u8::try_from(row.get::<_, i64>(4)?).context("hijri month out of range")?;
    let hijri_day = u8::try_from(row.get::<_, i64>(5)?).context("hijri day out of range")?;

    Ok(CycleRecord {
        record_id: RecordId(parse_ulid(&row.get::<_, String>(0)?)?),
        user_id: row.get(1)?,
        cycle_start: parse_rfc3339(&row.get::<_, String>(2)?)?,
        cycle_start_hijri: HijriDate::new(hijri_year, hijri_month, hijri_day)
            .map_err(|err| anyhow!("stored hijri date is invalid: {err}"))?,
        scheduled_completion: parse_rfc3339(&row.get::<_, String>(6)?)?,
        threshold_minor: row.get(7)?,
        threshold_currency: parse_currency(&row.get::<_, String>(8)?)?,
        methodology: serde_json::from_str(&methodology_json)
            .context("failed to deserialize stored methodology")?,
        aggregate_minor: row.get(10)?,
        obligation_minor: row.get(11)?,
        status,
        finalized_at: row
            .get::<_, Option<String>>(13)?
            .as_deref()
            .map(parse_rfc3339)
            .transpose()?,
    })
}

fn methodology_name(methodology: &Methodology) -> String {
    match methodology {
        Methodology::Custom(config) => config.name.clone(),
        builtin => builtin.as_str().to_owned(),
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

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn export_file<T: Serialize>(out_dir: &Path, name: &str, values: &[T]) -> Result<ExportFileDigest> {
    let path = out_dir.join(name);
    let file = File::create(&path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok(ExportFileDigest {
        path: name.to_owned(),
        sha256: format!("{:x}", hasher.finalize()),
        records: values.len(),
    })
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

fn parse_currency(raw: &str) -> Result<Currency> {
    Currency::parse(raw).map_err(|err| anyhow!("stored currency is invalid: {err}"))
}

fn parse_optional_json(raw: Option<String>) -> Result<Option<serde_json::Value>> {
    raw.as_deref()
        .map(serde_json::from_str)
        .transpose()
        .context("failed to parse stored JSON snapshot")
}
