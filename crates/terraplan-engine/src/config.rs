//! Engine configuration from environment.

use crate::gate::GateConfig;
use crate::maintenance::PrunePolicy;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use terraplan_core::PlannerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding raw units and stage outputs
    pub storage_root: PathBuf,
    /// Remote storage base URL; when set, missing local files are fetched from it
    pub storage_url: Option<String>,
    /// SQLite file shared by workers; in-process leases when unset
    pub lease_db_path: Option<String>,
    pub lease_db_max_connections: u32,
    pub lease_ttl: Duration,
    pub wait_timeout: Duration,
    pub stage_timeout: Duration,
    pub poll_base: Duration,
    pub poll_max: Duration,
    pub max_raster_cells: u64,
    pub split_max_waypoints: usize,
    /// Published entries kept by the prune loop
    pub cache_max_entries: usize,
    pub cache_max_age: Duration,
    pub prune_interval: Duration,
}

fn secs_var(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        env::var(name)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default),
    )
}

fn millis_var(name: &str, default: u64) -> Duration {
    Duration::from_millis(
        env::var(name)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default),
    )
}

impl Config {
    pub fn from_env() -> Self {
        let planner = PlannerConfig::default();
        Self {
            storage_root: env::var("TERRAPLAN_STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data")),
            storage_url: env::var("TERRAPLAN_STORAGE_URL").ok().filter(|s| !s.is_empty()),
            lease_db_path: env::var("TERRAPLAN_LEASE_DB").ok().filter(|s| !s.is_empty()),
            lease_db_max_connections: env::var("TERRAPLAN_LEASE_DB_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(4),
            lease_ttl: secs_var("TERRAPLAN_LEASE_TTL_SECS", 60),
            wait_timeout: secs_var("TERRAPLAN_WAIT_TIMEOUT_SECS", 3600),
            stage_timeout: secs_var("TERRAPLAN_STAGE_TIMEOUT_SECS", 1800),
            poll_base: millis_var("TERRAPLAN_POLL_BASE_MS", 50),
            poll_max: millis_var("TERRAPLAN_POLL_MAX_MS", 2000),
            max_raster_cells: env::var("TERRAPLAN_MAX_RASTER_CELLS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(planner.max_raster_cells),
            split_max_waypoints: env::var("TERRAPLAN_SPLIT_MAX_WAYPOINTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(planner.split.max_waypoints),
            cache_max_entries: env::var("TERRAPLAN_CACHE_MAX_ENTRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(PrunePolicy::default().max_entries),
            cache_max_age: secs_var("TERRAPLAN_CACHE_MAX_AGE_SECS", 30 * 24 * 3600),
            prune_interval: secs_var("TERRAPLAN_PRUNE_INTERVAL_SECS", 600),
        }
    }

    pub fn planner(&self) -> PlannerConfig {
        let mut planner = PlannerConfig {
            max_raster_cells: self.max_raster_cells,
            ..Default::default()
        };
        planner.split.max_waypoints = self.split_max_waypoints;
        planner
    }

    pub fn gate(&self) -> GateConfig {
        GateConfig {
            lease_ttl: self.lease_ttl,
            wait_timeout: self.wait_timeout,
            poll_base: self.poll_base,
            poll_max: self.poll_max,
        }
    }

    pub fn prune(&self) -> PrunePolicy {
        PrunePolicy {
            max_entries: self.cache_max_entries,
            max_age: self.cache_max_age,
            every: self.prune_interval,
        }
    }
}
