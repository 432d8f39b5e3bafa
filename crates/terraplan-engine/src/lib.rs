//! Request planning and execution for geospatial sampling.

pub mod backoff;
pub mod cache;
pub mod composer;
pub mod config;
pub mod executor;
pub mod gate;
pub mod kernels;
pub mod maintenance;
pub mod persistence;
pub mod sources;
pub mod storage;

pub use cache::{LeaseStore, MemoryLeaseStore};
pub use composer::{
    plan_merge, BoxRequest, Composer, IntegrateRequest, PointQueryRequest, RoutePostprocess,
    RouteRequest, WeatherBoxRequest, WeatherRouteRequest,
};
pub use config::Config;
pub use executor::{ExecutionService, LocalExecutor, StageOutput};
pub use gate::{Acquired, DedupGate, ExecutionTicket, GateConfig, Outcome, Staleness};
pub use kernels::{Kernels, StubKernels};
pub use maintenance::{run_prune_loop, PrunePolicy};
pub use persistence::SqliteLeaseStore;
pub use sources::{SourceCatalog, SourceUnit, StaticCatalog};
pub use storage::{HttpStorage, LocalStorage, StorageResolver};
