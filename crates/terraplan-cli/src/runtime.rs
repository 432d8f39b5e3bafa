//! Assemble a [`Composer`] from engine configuration.

use anyhow::Result;
use std::sync::Arc;
use terraplan_engine::persistence::init_database;
use terraplan_engine::{
    run_prune_loop, Composer, Config, DedupGate, HttpStorage, LeaseStore, LocalExecutor,
    LocalStorage, MemoryLeaseStore, SourceCatalog, SqliteLeaseStore, StorageResolver,
    StubKernels,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Lease store named by the configuration: a shared SQLite file, or
/// in-process leases when none is configured.
pub async fn lease_store(config: &Config) -> Result<Arc<dyn LeaseStore>> {
    match &config.lease_db_path {
        Some(path) => {
            let db = init_database(path, config.lease_db_max_connections).await?;
            info!(path = %path, "Using shared lease database");
            Ok(Arc::new(SqliteLeaseStore::new(db.pool().clone())))
        }
        None => Ok(Arc::new(MemoryLeaseStore::new())),
    }
}

pub fn storage(config: &Config) -> Arc<dyn StorageResolver> {
    match &config.storage_url {
        Some(url) => {
            info!(url = %url, "Resolving files from remote storage");
            Arc::new(HttpStorage::new(url.clone(), config.storage_root.clone()))
        }
        None => Arc::new(LocalStorage::new(config.storage_root.clone())),
    }
}

/// Build the composer and start pruning its lease store until `shutdown`
/// fires.
pub async fn composer(
    config: &Config,
    catalog: Arc<dyn SourceCatalog>,
    shutdown: CancellationToken,
) -> Result<Composer> {
    let planner = config.planner();
    planner.validate()?;

    let gate = DedupGate::new(lease_store(config).await?, config.gate());
    tokio::spawn(run_prune_loop(gate.store().clone(), config.prune(), shutdown));
    let storage = storage(config);
    let kernels = Arc::new(StubKernels::new(LocalStorage::new(config.storage_root.clone())));
    let executor = Arc::new(LocalExecutor::new(
        kernels,
        storage.clone(),
        gate.clone(),
        config.stage_timeout,
    ));
    info!(holder = gate.holder(), root = %config.storage_root.display(), "Planner ready");

    Ok(Composer::new(planner, catalog, storage, gate, executor))
}
