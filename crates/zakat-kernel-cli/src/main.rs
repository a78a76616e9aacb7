use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;
use zakat_kernel_api::{AddDeductionRequest, AddItemRequest, ZakatKernelApi};
use zakat_kernel_core::{
    Commodity, Currency, ItemCategory, ItemId, Methodology, MethodologyConfig, PriceQuote,
    RecordEdit, RecordId,
};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "zk")]
#[command(about = "Zakat Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./zakat_kernel.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Item {
        #[command(subcommand)]
        command: Box<ItemCommand>,
    },
    Deduction {
        #[command(subcommand)]
        command: Box<DeductionCommand>,
    },
    Rate {
        #[command(subcommand)]
        command: Box<RateCommand>,
    },
    Price {
        #[command(subcommand)]
        command: Box<PriceCommand>,
    },
    Methodology {
        #[command(subcommand)]
        command: Box<MethodologyCommand>,
    },
    Threshold {
        #[command(subcommand)]
        command: Box<ThresholdCommand>,
    },
    Wealth {
        #[command(subcommand)]
        command: Box<WealthCommand>,
    },
    Cycle {
        #[command(subcommand)]
        command: Box<CycleCommand>,
    },
    Record {
        #[command(subcommand)]
        command: Box<RecordCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
    Export(DbExportArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum ItemCommand {
    Add(ItemAddArgs),
    Update(ItemUpdateArgs),
    SetCategory(ItemSetCategoryArgs),
    Deactivate(ItemDeactivateArgs),
    List(UserArgs),
}

#[derive(Debug, Args)]
struct ItemAddArgs {
    #[arg(long)]
    user: String,
    #[arg(long, value_enum)]
    category: CategoryArg,
    #[arg(long)]
    value_minor: i64,
    #[arg(long)]
    currency: String,
    #[arg(long)]
    acquired_at: Option<String>,
    #[arg(long)]
    passive: Option<bool>,
    #[arg(long)]
    restricted: Option<bool>,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
struct ItemUpdateArgs {
    #[arg(long)]
    item_id: String,
    #[arg(long)]
    value_minor: Option<i64>,
    #[arg(long)]
    currency: Option<String>,
    #[arg(long)]
    passive: Option<bool>,
    #[arg(long)]
    restricted: Option<bool>,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
struct ItemSetCategoryArgs {
    #[arg(long)]
    item_id: String,
    #[arg(long, value_enum)]
    category: CategoryArg,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
struct ItemDeactivateArgs {
    #[arg(long)]
    item_id: String,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
struct UserArgs {
    #[arg(long)]
    user: String,
}

#[derive(Debug, Subcommand)]
enum DeductionCommand {
    Add(DeductionAddArgs),
    List(UserArgs),
}

#[derive(Debug, Args)]
struct DeductionAddArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    label: String,
    #[arg(long)]
    amount_minor: i64,
    #[arg(long)]
    currency: String,
    #[arg(long, default_value_t = true)]
    eligible: bool,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Subcommand)]
enum RateCommand {
    Set(RateSetArgs),
}

#[derive(Debug, Args)]
struct RateSetArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    currency: String,
    #[arg(long)]
    rate_ppm: i64,
}

#[derive(Debug, Subcommand)]
enum PriceCommand {
    Set(PriceSetArgs),
    Show,
}

#[derive(Debug, Args)]
struct PriceSetArgs {
    #[arg(long, value_enum)]
    commodity: CommodityArg,
    #[arg(long)]
    price_minor_per_gram: i64,
    #[arg(long)]
    currency: String,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Subcommand)]
enum MethodologyCommand {
    Set(MethodologySetArgs),
    Show(UserArgs),
}

#[derive(Debug, Args)]
struct MethodologySetArgs {
    #[arg(long)]
    user: String,
    /// Built-in methodology name; mutually exclusive with --config-file.
    #[arg(long, conflicts_with = "config_file")]
    name: Option<String>,
    /// JSON file holding a custom methodology configuration.
    #[arg(long)]
    config_file: Option<PathBuf>,
    #[arg(long, default_value = "USD")]
    base_currency: String,
}

#[derive(Debug, Subcommand)]
enum ThresholdCommand {
    Compute(AsOfUserArgs),
}

#[derive(Debug, Subcommand)]
enum WealthCommand {
    Aggregate(AsOfUserArgs),
}

#[derive(Debug, Subcommand)]
enum CycleCommand {
    Detect(AsOfUserArgs),
}

#[derive(Debug, Args)]
struct AsOfUserArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Subcommand)]
enum RecordCommand {
    Finalize(RecordFinalizeArgs),
    Unlock(RecordUnlockArgs),
    Edit(RecordEditArgs),
    Refinalize(RecordRefinalizeArgs),
    Delete(RecordIdArgs),
    Audit(RecordIdArgs),
}

#[derive(Debug, Args)]
struct RecordFinalizeArgs {
    #[arg(long)]
    record_id: String,
    #[arg(long)]
    actor: String,
    #[arg(long, default_value_t = false)]
    acknowledge_premature: bool,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
struct RecordUnlockArgs {
    #[arg(long)]
    record_id: String,
    #[arg(long)]
    actor: String,
    #[arg(long)]
    justification: String,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
struct RecordEditArgs {
    #[arg(long)]
    record_id: String,
    #[arg(long)]
    actor: String,
    #[arg(long)]
    aggregate_minor: Option<i64>,
    #[arg(long)]
    obligation_minor: Option<i64>,
    /// Built-in methodology name to re-rate the record under.
    #[arg(long)]
    methodology: Option<String>,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
struct RecordRefinalizeArgs {
    #[arg(long)]
    record_id: String,
    #[arg(long)]
    actor: String,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
struct RecordIdArgs {
    #[arg(long)]
    record_id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CategoryArg {
    Cash,
    PreciousMetal,
    Security,
    RetirementAccount,
    BusinessInventory,
    Property,
    Other,
}

impl CategoryArg {
    fn into_category(self) -> ItemCategory {
        match self {
            Self::Cash => ItemCategory::Cash,
            Self::PreciousMetal => ItemCategory::PreciousMetal,
            Self::Security => ItemCategory::Security,
            Self::RetirementAccount => ItemCategory::RetirementAccount,
            Self::BusinessInventory => ItemCategory::BusinessInventory,
            Self::Property => ItemCategory::Property,
            Self::Other => ItemCategory::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CommodityArg {
    Gold,
    Silver,
}

impl CommodityArg {
    fn into_commodity(self) -> Commodity {
        match self {
            Self::Gold => Commodity::Gold,
            Self::Silver => Commodity::Silver,
        }
    }
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

fn parse_as_of(raw: Option<&str>) -> Result<OffsetDateTime> {
    match raw {
        Some(raw) => OffsetDateTime::parse(raw, &Rfc3339)
            .with_context(|| format!("invalid RFC 3339 timestamp `{raw}`")),
        None => Ok(OffsetDateTime::now_utc()),
    }
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).map_err(|err| anyhow!("invalid ULID `{raw}`: {err}"))
}

fn parse_currency(code: &str) -> Result<Currency> {
    Ok(Currency::parse(code)?)
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let api = ZakatKernelApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Item { command } => run_item(*command, &api),
        Command::Deduction { command } => run_deduction(*command, &api),
        Command::Rate { command } => run_rate(*command, &api),
        Command::Price { command } => run_price(*command, &api),
        Command::Methodology { command } => run_methodology(*command, &api),
        Command::Threshold { command } => run_threshold(*command, &api),
        Command::Wealth { command } => run_wealth(*command, &api),
        Command::Cycle { command } => run_cycle(*command, &api),
        Command::Record { command } => run_record(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &ZakatKernelApi) -> Result<()> {
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
            emit_json(serde_json::to_value(&result)?)
        }
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            api.restore(&args.input)?;
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
        DbCommand::Export(args) => {
            let manifest = api.export_snapshot(&args.out)?;
            emit_json(serde_json::json!({
                "out_dir": args.out,
                "manifest": manifest
            }))
        }
    }
}

fn run_item(command: ItemCommand, api: &ZakatKernelApi) -> Result<()> {
    match command {
        ItemCommand::Add(args) => {
            let as_of = parse_as_of(args.as_of.as_deref())?;
            let acquired_at =
                args.acquired_at.as_deref().map(|raw| parse_as_of(Some(raw))).transpose()?;
            let item = api.add_item(
                AddItemRequest {
                    user_id: args.user,
                    category: args.category.into_category(),
                    value_minor: args.value_minor,
                    currency: parse_currency(&args.currency)?,
                    acquired_at,
                    is_passive_holding: args.passive,
                    is_restricted_access: args.restricted,
                },
                as_of,
            )?;
            emit_json(serde_json::to_value(&item)?)
        }
        ItemCommand::Update(args) => {
            let as_of = parse_as_of(args.as_of.as_deref())?;
            let currency = args.currency.as_deref().map(parse_currency).transpose()?;
            let item = api.update_item(
                ItemId(parse_ulid(&args.item_id)?),
                args.value_minor,
                currency,
                args.passive,
                args.restricted,
                as_of,
            )?;
            emit_json(serde_json::to_value(&item)?)
        }
        ItemCommand::SetCategory(args) => {
            let as_of = parse_as_of(args.as_of.as_deref())?;
            let item = api.set_item_category(
                ItemId(parse_ulid(&args.item_id)?),
                args.category.into_category(),
                as_of,
            )?;
            emit_json(serde_json::to_value(&item)?)
        }
        ItemCommand::Deactivate(args) => {
            let as_of = parse_as_of(args.as_of.as_deref())?;
            let item = api.deactivate_item(ItemId(parse_ulid(&args.item_id)?), as_of)?;
            emit_json(serde_json::to_value(&item)?)
        }
        ItemCommand::List(args) => {
            let items = api.list_items(&args.user)?;
            emit_json(serde_json::json!({
                "user_id": args.user,
                "items": items
            }))
        }
    }
}

fn run_deduction(command: DeductionCommand, api: &ZakatKernelApi) -> Result<()> {
    match command {
        DeductionCommand::Add(args) => {
            let as_of = parse_as_of(args.as_of.as_deref())?;
            let deduction = api.add_deduction(
                AddDeductionRequest {
                    user_id: args.user,
                    label: args.label,
                    amount_minor: args.amount_minor,
                    currency: parse_currency(&args.currency)?,
                    eligible: args.eligible,
                },
                as_of,
            )?;
            emit_json(serde_json::to_value(&deduction)?)
        }
        DeductionCommand::List(args) => {
            let deductions = api.list_deductions(&args.user)?;
            emit_json(serde_json::json!({
                "user_id": args.user,
                "deductions": deductions
            }))
        }
    }
}

fn run_rate(command: RateCommand, api: &ZakatKernelApi) -> Result<()> {
    match command {
        RateCommand::Set(args) => {
            let currency = parse_currency(&args.currency)?;
            api.set_rate(&args.user, &currency, args.rate_ppm)?;
            emit_json(serde_json::json!({
                "user_id": args.user,
                "currency": currency,
                "rate_ppm": args.rate_ppm,
                "status": "ok"
            }))
        }
    }
}

fn run_price(command: PriceCommand, api: &ZakatKernelApi) -> Result<()> {
    match command {
        PriceCommand::Set(args) => {
            let quote = PriceQuote {
                commodity: args.commodity.into_commodity(),
                price_minor_per_gram: args.price_minor_per_gram,
                currency: parse_currency(&args.currency)?,
                as_of: parse_as_of(args.as_of.as_deref())?,
            };
            api.record_quote(&quote)?;
            emit_json(serde_json::to_value(&quote)?)
        }
        PriceCommand::Show => {
            let quotes = api.get_quotes()?;
            emit_json(serde_json::to_value(&quotes)?)
        }
    }
}

fn run_methodology(command: MethodologyCommand, api: &ZakatKernelApi) -> Result<()> {
    match command {
        MethodologyCommand::Set(args) => {
            let methodology = match (args.name.as_deref(), args.config_file.as_ref()) {
                (Some(name), None) => Methodology::parse_builtin(name)
                    .ok_or_else(|| anyhow!("unknown built-in methodology `{name}`"))?,
                (None, Some(path)) => {
                    let body = fs::read_to_string(path).with_context(|| {
                        format!("failed to read methodology config {}", path.display())
                    })?;
                    let config: MethodologyConfig = serde_json::from_str(&body)
                        .context("failed to parse methodology config JSON")?;
                    Methodology::Custom(config)
                }
                _ => return Err(anyhow!("provide exactly one of --name or --config-file")),
            };
            let base_currency = parse_currency(&args.base_currency)?;
            let settings = api.set_methodology(&args.user, &methodology, &base_currency)?;
            emit_json(serde_json::to_value(&settings)?)
        }
        MethodologyCommand::Show(args) => {
            let settings = api.get_settings(&args.user)?;
            let config = settings.methodology.config();
            emit_json(serde_json::json!({
                "settings": settings,
                "config": config
            }))
        }
    }
}

fn run_threshold(command: ThresholdCommand, api: &ZakatKernelApi) -> Result<()> {
    match command {
        ThresholdCommand::Compute(args) => {
            let as_of = parse_as_of(args.as_of.as_deref())?;
            let threshold = api.compute_threshold(&args.user, as_of)?;
            emit_json(serde_json::to_value(&threshold)?)
        }
    }
}

fn run_wealth(command: WealthCommand, api: &ZakatKernelApi) -> Result<()> {
    match command {
        WealthCommand::Aggregate(args) => {
            let as_of = parse_as_of(args.as_of.as_deref())?;
            let summary = api.aggregate_wealth(&args.user, as_of)?;
            emit_json(serde_json::to_value(&summary)?)
        }
    }
}

fn run_cycle(command: CycleCommand, api: &ZakatKernelApi) -> Result<()> {
    match command {
        CycleCommand::Detect(args) => {
            let as_of = parse_as_of(args.as_of.as_deref())?;
            let outcome = api.detect_cycle(&args.user, as_of)?;
            emit_json(serde_json::to_value(&outcome)?)
        }
    }
}

fn run_record(command: RecordCommand, api: &ZakatKernelApi) -> Result<()> {
    match command {
        RecordCommand::Finalize(args) => {
            let as_of = parse_as_of(args.as_of.as_deref())?;
            let record = api.finalize(
                RecordId(parse_ulid(&args.record_id)?),
                &args.actor,
                as_of,
                args.acknowledge_premature,
            )?;
            emit_json(serde_json::to_value(&record)?)
        }
        RecordCommand::Unlock(args) => {
            let as_of = parse_as_of(args.as_of.as_deref())?;
            let record = api.unlock(
                RecordId(parse_ulid(&args.record_id)?),
                &args.actor,
                as_of,
                &args.justification,
            )?;
            emit_json(serde_json::to_value(&record)?)
        }
        RecordCommand::Edit(args) => {
            let as_of = parse_as_of(args.as_of.as_deref())?;
            let methodology = args
                .methodology
                .as_deref()
                .map(|name| {
                    Methodology::parse_builtin(name)
                        .ok_or_else(|| anyhow!("unknown built-in methodology `{name}`"))
                })
                .transpose()?;
            let edit = RecordEdit {
                aggregate_minor: args.aggregate_minor,
                obligation_minor: args.obligation_minor,
                methodology,
            };
            let record = api.edit_unlocked(
                RecordId(parse_ulid(&args.record_id)?),
                &args.actor,
                as_of,
                &edit,
            )?;
            emit_json(serde_json::to_value(&record)?)
        }
        RecordCommand::Refinalize(args) => {
            let as_of = parse_as_of(args.as_of.as_deref())?;
            let record =
                api.refinalize(RecordId(parse_ulid(&args.record_id)?), &args.actor, as_of)?;
            emit_json(serde_json::to_value(&record)?)
        }
        RecordCommand::Delete(args) => {
            let record_id = RecordId(parse_ulid(&args.record_id)?);
            api.delete_record(record_id)?;
            emit_json(serde_json::json!({
                "record_id": args.record_id,
                "status": "deleted"
            }))
        }
        RecordCommand::Audit(args) => {
            let entries = api.audit_trail(RecordId(parse_ulid(&args.record_id)?))?;
            emit_json(serde_json::json!({
                "record_id": args.record_id,
                "entries": entries
            }))
        }
    }
}
