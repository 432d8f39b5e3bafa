pub mod cluster;
pub mod config;
pub mod convert;
pub mod error;
pub mod fingerprint;
pub mod graph;
pub mod models;
pub mod spatial;
pub mod split;
pub mod table;
pub mod weather;

pub use cluster::{cluster_route, union_box, Cluster};
pub use config::PlannerConfig;
pub use convert::{conversion_stages, ConversionStage};
pub use error::{PlanError, PlanResult};
pub use fingerprint::{fingerprint, CacheEntry, CacheKey, CallArgs, Staleness};
pub use graph::{
    AvailabilityCheck, FetchSpec, FilterSpec, GraphBuilder, IrradianceParams, MergeKind,
    Postprocess, SampleSpec, Stage, StageId, StageNode, TaskGraph,
};
pub use models::{
    BoundingBox, Crs, ImageStyle, MarginBox, MeshCrs, Representation, SampleParams, Statistic,
    Waypoint, WaypointAttributes,
};
pub use split::{bucket_of, needs_split, split_route, PartitionKey, SplitPolicy};
pub use table::{
    parse_time, read_route_tsv, read_times_tsv, RouteRow, RouteTable, TimeSample, TIME_FORMAT,
};
pub use weather::{
    box_sources, route_sources, TimeRange, TimeStep, WeatherProduct, WeatherSampleSpec,
    WeatherSource,
};
