//! Two devices editing the same ledger through an in-memory relay
//!
//! Run with:
//! ```bash
//! cargo run --example two_device_sync
//! ```

use std::sync::Arc;

use tallyvault_core::core_store::model::FieldValue;
use tallyvault_core::core_sync::{MemoryRelay, SyncEngine};
use tallyvault_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use tallyvault_core::test_utils::{acme, paired_vaults, transaction};
use tallyvault_core::VaultResult;
use tracing::info;

#[tokio::main]
async fn main() -> VaultResult<()> {
    let config = LogConfig::new(LogLevel::Debug).with_timestamp(true).with_target(true);
    if let Err(e) = init_logging_with_config(config) {
        eprintln!("logging disabled: {}", e);
    }

    let vaults = paired_vaults(&["laptop", "phone"], &acme())?;
    let relay = Arc::new(MemoryRelay::new());
    let laptop = SyncEngine::new(vaults[0].clone(), relay.clone());
    let phone = SyncEngine::new(vaults[1].clone(), relay.clone());

    let tx = transaction("tx-1001");
    vaults[0].mutate_field(&tx, "amount", FieldValue::money(12_500, "USD"))?;
    laptop.sync_once(&acme()).await?;

    // The phone goes offline and edits the memo, the laptop edits it too
    relay.set_online(false);
    vaults[1].mutate_field(&tx, "memo", FieldValue::text("Office chairs"))?;
    vaults[0].mutate_field(&tx, "memo", FieldValue::text("Office furniture"))?;
    relay.set_online(true);

    phone.sync_once(&acme()).await?;
    let report = laptop.sync_once(&acme()).await?;
    info!(
        pulled = report.pulled,
        conflicts = report.applied.conflicts.len(),
        "Laptop caught up"
    );

    let snapshot = vaults[0].get_entity(&tx)?;
    info!(
        amount = ?snapshot.value("amount"),
        memo = ?snapshot.value("memo"),
        open_conflict = ?snapshot.open_conflict,
        "Laptop view"
    );
    Ok(())
}
