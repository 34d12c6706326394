use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::PathBuf;
use tallyvault_core::core_audit::AuditFilter;
use tallyvault_core::core_conflict::{FieldChoice, ResolutionStrategy};
use tallyvault_core::core_keys::RotationControl;
use tallyvault_core::core_store::model::{
    CompanyId, ConflictId, EntityId, EntityKind, EntityRef, FieldType, FieldValue, JobId, OpId,
};
use tallyvault_core::core_store::store::PageRequest;
use tallyvault_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use tallyvault_core::vault::{EntitySnapshot, FieldSelections};
use tallyvault_core::{Config, Vault, VaultBuilder};
use tracing::info;

const PASSPHRASE_ENV: &str = "TALLYVAULT_PASSPHRASE";

#[derive(Parser, Debug)]
#[command(name = "tallyvault")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML); environment overrides still apply
    #[arg(short, long)]
    config: Option<String>,

    /// Directory holding the vault database
    #[arg(long)]
    data_dir: Option<String>,

    /// Name of this device
    #[arg(long, default_value = "cli")]
    device: String,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate the first data key for a company
    Provision { company: String },
    /// Write one field
    Set {
        company: String,
        kind: String,
        id: String,
        field: String,
        /// Value; money is written as "12.34 USD"
        value: String,
    },
    /// Show an entity's current values
    Get { company: String, kind: String, id: String },
    /// Delete an entity
    Delete { company: String, kind: String, id: String },
    /// List a company's entities
    List {
        company: String,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long)]
        after: Option<String>,
    },
    /// Inspect and resolve conflicts
    #[command(subcommand)]
    Conflicts(ConflictCommand),
    /// Rotate a company's data key, resuming an interrupted rotation first
    Rotate {
        company: String,
        /// Roll back this job instead
        #[arg(long)]
        rollback: Option<String>,
    },
    /// Destroy retired keys past their grace period
    PurgeKeys { company: String },
    /// Query and verify the audit trail
    #[command(subcommand)]
    Audit(AuditCommand),
}

#[derive(Subcommand, Debug)]
enum ConflictCommand {
    List {
        company: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show every contending value
    Show { company: String, id: String },
    Resolve {
        company: String,
        id: String,
        /// keep-local, keep-remote or field-merge
        #[arg(long)]
        strategy: String,
        /// Per-field pick for field-merge: field=local, field=remote or field=<device>#<seq>
        #[arg(long = "pick")]
        picks: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum AuditCommand {
    List {
        company: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long)]
        after: Option<String>,
    },
    Verify { company: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let mut log_config = LogConfig::from_config(&config.logging)?;
    if let Some(level) = &args.log_level {
        log_config = LogConfig::new(level.parse::<LogLevel>()?);
    }
    init_logging_with_config(log_config.json_format(args.json_logs || config.logging.json_format))?;
    tallyvault_core::metrics::init_metrics();

    let passphrase = read_passphrase()?;
    let vault = VaultBuilder::new(args.device.as_str())
        .config(config)
        .open(&passphrase)
        .context("failed to open vault")?;
    info!(device = %vault.device_id(), "TallyVault CLI started");

    let output = run(&vault, args.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    vault.lock()?;
    Ok(())
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(shellexpand::tilde(path).into_owned())?,
        None => Config::default(),
    };
    config.apply_env()?;
    if let Some(dir) = &args.data_dir {
        config.store.data_dir = PathBuf::from(shellexpand::tilde(dir).into_owned());
    }
    config.validate()?;
    Ok(config)
}

fn read_passphrase() -> Result<String> {
    if let Ok(passphrase) = std::env::var(PASSPHRASE_ENV) {
        return Ok(passphrase);
    }
    eprint!("Passphrase: ");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let passphrase = line.trim_end_matches(['\r', '\n']).to_string();
    if passphrase.is_empty() {
        bail!("no passphrase given (set {} or type it on stdin)", PASSPHRASE_ENV);
    }
    Ok(passphrase)
}

async fn run(vault: &Vault, command: Command) -> Result<Value> {
    match command {
        Command::Provision { company } => {
            let key = vault.provision_company(&CompanyId::new(company))?;
            Ok(json!({ "key_id": key.to_string() }))
        }
        Command::Set {
            company,
            kind,
            id,
            field,
            value,
        } => {
            let entity = entity_ref(&company, &kind, &id)?;
            let field_type = entity.kind.field(&field)?.field_type;
            let op = vault.mutate_field(&entity, &field, parse_value(field_type, &value)?)?;
            Ok(json!({ "op_id": op.to_string() }))
        }
        Command::Get { company, kind, id } => {
            let snapshot = vault.get_entity(&entity_ref(&company, &kind, &id)?)?;
            snapshot_json(&snapshot)
        }
        Command::Delete { company, kind, id } => {
            let op = vault.delete_entity(&entity_ref(&company, &kind, &id)?)?;
            Ok(json!({ "op_id": op.to_string() }))
        }
        Command::List {
            company,
            kind,
            limit,
            after,
        } => {
            let kind = kind.as_deref().map(EntityKind::parse).transpose()?;
            let page = vault.list_entities(&CompanyId::new(company), kind, &page_request(limit, after))?;
            let items: Vec<Value> = page
                .items
                .iter()
                .map(|e| {
                    json!({
                        "entity": e.entity_ref.to_string(),
                        "fields": e.field_count,
                        "deleted": e.deleted,
                        "open_conflict": e.open_conflict.as_ref().map(|c| c.to_string()),
                    })
                })
                .collect();
            Ok(json!({ "items": items, "next_cursor": page.next_cursor }))
        }
        Command::Conflicts(command) => run_conflicts(vault, command),
        Command::Rotate { company, rollback } => {
            let company = CompanyId::new(company);
            let report = match rollback {
                Some(job) => vault.rollback_rotation(&company, &JobId::new(job)).await?,
                None => match vault.in_flight_rotation(&company)? {
                    Some(_) => vault.resume_rotation(&company).await?,
                    None => {
                        let job = vault.rotate_key(&company)?;
                        vault
                            .run_rotation(&company, &job.job_id, &RotationControl::new())
                            .await?
                    }
                },
            };
            Ok(json!({
                "job_id": report.job.job_id.to_string(),
                "status": report.job.status.as_str(),
                "new_key_id": report.job.new_key_id.to_string(),
                "entities_reencrypted": report.job.entities_reencrypted,
                "fields_reencrypted": report.job.fields_reencrypted,
                "finished": report.finished,
            }))
        }
        Command::PurgeKeys { company } => {
            let purged = vault.purge_expired_keys(&CompanyId::new(company))?;
            Ok(json!({ "purged": purged.iter().map(|k| k.to_string()).collect::<Vec<_>>() }))
        }
        Command::Audit(AuditCommand::List { company, limit, after }) => {
            let filter = AuditFilter {
                page: page_request(limit, after),
                ..Default::default()
            };
            let page = vault.get_audit_trail(&CompanyId::new(company), &filter)?;
            let items: Vec<Value> = page
                .items
                .iter()
                .map(|r| {
                    let event = r.event.as_ref();
                    json!({
                        "seq": r.seq,
                        "recorded_at": r.recorded_at.0,
                        "hash": r.hash,
                        "action": event.map(|e| e.action.as_str()),
                        "actor": event.map(|e| e.actor.to_string()),
                        "entity": event.and_then(|e| e.entity.as_ref()).map(|e| e.to_string()),
                        "detail": event.and_then(|e| e.detail.clone()),
                    })
                })
                .collect();
            Ok(json!({ "items": items, "next_cursor": page.next_cursor }))
        }
        Command::Audit(AuditCommand::Verify { company }) => {
            let verification = vault.verify_audit_chain(&CompanyId::new(company))?;
            Ok(json!({
                "intact": verification.intact,
                "entries_checked": verification.entries_checked,
                "first_broken_seq": verification.first_broken_seq,
                "reason": verification.reason,
            }))
        }
    }
}

fn run_conflicts(vault: &Vault, command: ConflictCommand) -> Result<Value> {
    match command {
        ConflictCommand::List { company, limit } => {
            let page = vault.list_unresolved_conflicts(&CompanyId::new(company), &page_request(limit, None))?;
            let items: Vec<Value> = page
                .items
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id.to_string(),
                        "entity": c.entity.to_string(),
                        "status": c.status.as_str(),
                        "fields": c.fields,
                    })
                })
                .collect();
            Ok(json!({ "items": items, "next_cursor": page.next_cursor }))
        }
        ConflictCommand::Show { company, id } => {
            let view = vault.present_conflict(&CompanyId::new(company), &ConflictId::new(id))?;
            let mut fields = Vec::with_capacity(view.fields.len());
            for field in &view.fields {
                let mut contenders = Vec::with_capacity(field.contenders.len());
                for c in &field.contenders {
                    contenders.push(json!({
                        "op_id": c.op_id.to_string(),
                        "author": c.author.to_string(),
                        "local": c.is_local,
                        "value": serde_json::to_value(&c.value)?,
                    }));
                }
                fields.push(json!({ "field": field.field, "contenders": contenders }));
            }
            Ok(json!({
                "id": view.id.to_string(),
                "entity": view.entity.to_string(),
                "status": view.status.as_str(),
                "fields": fields,
            }))
        }
        ConflictCommand::Resolve {
            company,
            id,
            strategy,
            picks,
        } => {
            let strategy = ResolutionStrategy::parse(&strategy)?;
            let selections = parse_picks(&picks)?;
            let ops = vault.resolve_conflict(&CompanyId::new(company), &ConflictId::new(id), strategy, &selections)?;
            Ok(json!({ "resolution_ops": ops.iter().map(|o| o.to_string()).collect::<Vec<_>>() }))
        }
    }
}

fn entity_ref(company: &str, kind: &str, id: &str) -> Result<EntityRef> {
    Ok(EntityRef::new(
        CompanyId::new(company),
        EntityKind::parse(kind)?,
        EntityId::new(id),
    ))
}

fn page_request(limit: usize, after: Option<String>) -> PageRequest {
    match after {
        Some(cursor) => PageRequest::after(cursor, limit),
        None => PageRequest::first(limit),
    }
}

fn snapshot_json(snapshot: &EntitySnapshot) -> Result<Value> {
    let mut fields = serde_json::Map::new();
    for field in &snapshot.fields {
        fields.insert(
            field.name.clone(),
            json!({
                "value": serde_json::to_value(&field.value)?,
                "op_id": field.op_id.to_string(),
                "conflicted": field.conflicted,
                "alternatives": field.alternatives.len(),
            }),
        );
    }
    Ok(json!({
        "entity": snapshot.entity_ref.to_string(),
        "deleted": snapshot.deleted,
        "open_conflict": snapshot.open_conflict.as_ref().map(|c| c.to_string()),
        "fields": fields,
    }))
}

/// Parse a command-line value for a field of the given type
fn parse_value(field_type: FieldType, raw: &str) -> Result<FieldValue> {
    if raw == "null" {
        return Ok(FieldValue::Null);
    }
    Ok(match field_type {
        FieldType::Text => FieldValue::text(raw),
        FieldType::Money => parse_money(raw)?,
        FieldType::Integer => FieldValue::Integer(raw.parse().context("expected an integer")?),
        FieldType::Date => FieldValue::Date(
            NaiveDate::parse_from_str(raw, "%Y-%m-%d").context("expected a date as YYYY-MM-DD")?,
        ),
        FieldType::Boolean => FieldValue::Boolean(raw.parse().context("expected true or false")?),
        FieldType::Reference => FieldValue::Reference(EntityId::new(raw)),
    })
}

/// "12.34 USD" -> 1234 minor units
fn parse_money(raw: &str) -> Result<FieldValue> {
    let (amount, currency) = raw
        .trim()
        .split_once(' ')
        .ok_or_else(|| anyhow!("expected money as '<amount> <currency>'"))?;
    let currency = currency.trim();
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        bail!("'{}' is not an ISO 4217 currency code", currency);
    }

    let (negative, digits) = match amount.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, amount),
    };
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    if fraction.len() > 2 {
        bail!("money supports at most two decimal places");
    }
    let whole: i64 = whole.parse().context("invalid amount")?;
    let cents: i64 = format!("{:0<2}", fraction).parse().context("invalid amount")?;
    let minor = whole
        .checked_mul(100)
        .and_then(|w| w.checked_add(cents))
        .ok_or_else(|| anyhow!("amount out of range"))?;
    Ok(FieldValue::money(if negative { -minor } else { minor }, &currency.to_ascii_uppercase()))
}

/// Parse `field=local`, `field=remote` or `field=<device>#<seq>`
fn parse_picks(picks: &[String]) -> Result<FieldSelections> {
    let mut selections = BTreeMap::new();
    for pick in picks {
        let (field, choice) = pick
            .split_once('=')
            .ok_or_else(|| anyhow!("pick '{}' must look like field=choice", pick))?;
        let choice = match choice {
            "local" => FieldChoice::Local,
            "remote" => FieldChoice::Remote,
            other => {
                let (device, seq) = other
                    .rsplit_once('#')
                    .ok_or_else(|| anyhow!("unknown choice '{}'", other))?;
                FieldChoice::Op(OpId::new(device.into(), seq.parse().context("invalid op sequence")?))
            }
        };
        selections.insert(field.to_string(), choice);
    }
    Ok(selections)
}
