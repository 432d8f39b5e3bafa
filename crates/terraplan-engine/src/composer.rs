//! Task-graph composition per request family.
//!
//! Each family has a `plan_*` method building the [`TaskGraph`] for a request
//! and a `run_*` method executing it through the [`DedupGate`], so identical
//! requests from any caller are computed once.
//!
//! Graph shapes:
//!
//! ```text
//! box:       [fetch*] -> availability_check -> sample -> convert*
//! integrate: [fetch*] -> availability_check -> sample -> integrate_irradiance -> convert*
//! route:     per cluster [fetch*] -> availability_check -> sample -> convert* -> postprocess*
//!            branch tails -> group -> merge
//! weather:   [weather_source*] -> weather_sample
//! ```
//!
//! Sample, convert, postprocess and merge nodes carry run-once keys derived
//! from the keys of their inputs, so the same sub-computation reached from
//! different requests is shared.

use crate::executor::ExecutionService;
use crate::gate::{DedupGate, Staleness};
use crate::sources::SourceCatalog;
use crate::storage::StorageResolver;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use terraplan_core::{
    box_sources, cluster_route, conversion_stages, fingerprint, route_sources, split_route,
    union_box, AvailabilityCheck, BoundingBox, CacheEntry, CacheKey, CallArgs, Cluster,
    ConversionStage, Crs, FetchSpec, FilterSpec, GraphBuilder, IrradianceParams, MarginBox,
    MergeKind, MeshCrs, PlanError, PlannerConfig, Postprocess, Representation, SampleParams,
    SampleSpec, Stage, StageId, TaskGraph, TimeRange, TimeSample, TimeStep, Waypoint,
    WeatherProduct, WeatherSampleSpec, WeatherSource,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Irradiance results computed before this instant (2022-04-25 11:15:52 UTC)
/// came from a superseded model and are recomputed.
pub const IRRADIANCE_VALID_SINCE: i64 = 1_650_884_152;

/// Sample a geographic box and convert the raster to `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxRequest {
    /// WGS84 box `[lat_min, lon_min, lat_max, lon_max]`
    pub region: BoundingBox,
    pub params: SampleParams,
    pub target: Representation,
}

impl BoxRequest {
    fn call_args(&self) -> CallArgs {
        CallArgs::new()
            .arg("box", self.region.as_array())
            .arg("params", &self.params)
            .arg("output_type", self.target.name())
    }
}

/// Irradiance integrated over a time series on every cell of a box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrateRequest {
    pub region: BoundingBox,
    pub params: SampleParams,
    pub times: Vec<TimeSample>,
    pub albedo: f64,
    /// Sky discretization used for diffuse irradiance
    pub nsky: u32,
    pub target: Representation,
}

impl IntegrateRequest {
    /// Request with albedo 0.5 and 10 sky patches.
    pub fn new(region: BoundingBox, times: Vec<TimeSample>) -> Self {
        Self {
            region,
            params: SampleParams::default(),
            times,
            albedo: 0.5,
            nsky: 10,
            target: Representation::GeoRaster,
        }
    }

    fn as_box(&self) -> BoxRequest {
        BoxRequest {
            region: self.region,
            params: self.params.clone(),
            target: self.target,
        }
    }

    fn call_args(&self) -> CallArgs {
        self.as_box()
            .call_args()
            .arg("times", &self.times)
            .arg("albedo", self.albedo)
            .arg("nsky", self.nsky)
    }
}

/// Weather time series over a box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherBoxRequest {
    pub product: WeatherProduct,
    pub region: BoundingBox,
    pub range: TimeRange,
    pub step: TimeStep,
    /// Variables to read; the product's defaults when empty
    pub variables: Vec<String>,
}

impl WeatherBoxRequest {
    fn call_args(&self) -> CallArgs {
        CallArgs::new()
            .arg("product", self.product)
            .arg("box", self.region.as_array())
            .arg("time_range", self.range)
            .arg("time_step", self.step)
            .arg("what", variables_or_default(self.product, &self.variables))
    }
}

/// Weather values at every waypoint's own time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRouteRequest {
    pub product: WeatherProduct,
    pub waypoints: Vec<Waypoint>,
    /// Variables to read; the product's defaults when empty
    pub variables: Vec<String>,
}

impl WeatherRouteRequest {
    fn with_waypoints(&self, waypoints: Vec<Waypoint>) -> Self {
        Self {
            waypoints,
            ..self.clone()
        }
    }

    fn call_args(&self) -> CallArgs {
        CallArgs::new()
            .arg("product", self.product)
            .arg("route", &self.waypoints)
            .arg("what", variables_or_default(self.product, &self.variables))
    }
}

fn variables_or_default(product: WeatherProduct, variables: &[String]) -> Vec<String> {
    if variables.is_empty() {
        product.default_variables()
    } else {
        variables.to_vec()
    }
}

/// Per-cluster step applied to route rasters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoutePostprocess {
    /// Render each cluster raster as `target`
    None,
    /// Irradiance at every waypoint; `target` is ignored and the result is a
    /// route table
    Irradiance(IrradianceParams),
    /// Filter the raw raster before rendering it as `target`
    Filter(FilterSpec),
}

/// Sample rasters around every point of a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRequest {
    pub waypoints: Vec<Waypoint>,
    pub margin: MarginBox,
    pub multiplier: f64,
    pub params: SampleParams,
    pub target: Representation,
    pub postprocess: RoutePostprocess,
}

impl RouteRequest {
    /// Request with the configured default margin and multiplier.
    pub fn new(waypoints: Vec<Waypoint>, config: &PlannerConfig) -> Self {
        Self {
            waypoints,
            margin: config.route_margin,
            multiplier: config.route_multiplier,
            params: SampleParams::default(),
            target: Representation::GeoRaster,
            postprocess: RoutePostprocess::None,
        }
    }

    fn with_waypoints(&self, waypoints: Vec<Waypoint>) -> Self {
        Self {
            waypoints,
            ..self.clone()
        }
    }

    fn call_args(&self) -> CallArgs {
        CallArgs::new()
            .arg("route", &self.waypoints)
            .arg("box", self.margin)
            .arg("box_delta", self.multiplier)
            .arg("params", &self.params)
            .arg("output_type", self.target.name())
            .arg("postprocess", &self.postprocess)
    }

    /// Oldest result this request may reuse, for the whole request and for
    /// every run-once stage inside its graph.
    pub fn staleness(&self) -> Staleness {
        match self.postprocess {
            RoutePostprocess::Irradiance(_) => Staleness::CreatedBefore(
                DateTime::<Utc>::from_timestamp(IRRADIANCE_VALID_SINCE, 0).unwrap_or_default(),
            ),
            _ => Staleness::Any,
        }
    }

    fn default_time(&self) -> Option<DateTime<Utc>> {
        match &self.postprocess {
            RoutePostprocess::Irradiance(params) => Some(params.time_default),
            _ => None,
        }
    }

    fn merge_kind(&self) -> MergeKind {
        match self.postprocess {
            RoutePostprocess::Irradiance(_) => MergeKind::RouteTable,
            _ => MergeKind::CollectRasters,
        }
    }
}

/// Read raster values at route points.
///
/// Margin, multiplier, mesh and step are fixed by [`PlannerConfig`]; only the
/// dataset selection of `params` is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointQueryRequest {
    pub waypoints: Vec<Waypoint>,
    pub params: SampleParams,
}

impl PointQueryRequest {
    fn call_args(&self) -> CallArgs {
        CallArgs::new()
            .arg("route", &self.waypoints)
            .arg("data_re", &self.params.data_re)
            .arg("stat", self.params.stat)
            .arg("pdal_resolution", self.params.resolution)
    }
}

/// End of a chain under construction.
#[derive(Debug, Clone)]
struct Tail {
    id: StageId,
    key: CacheKey,
}

/// One graph being built; fetches are shared by every availability check.
struct Draft<'a> {
    catalog: &'a dyn SourceCatalog,
    storage: &'a dyn StorageResolver,
    builder: GraphBuilder,
    fetches: HashMap<String, StageId>,
}

impl<'a> Draft<'a> {
    fn new(composer: &'a Composer, staleness: Staleness) -> Self {
        Self {
            catalog: composer.catalog.as_ref(),
            storage: composer.storage.as_ref(),
            builder: GraphBuilder::new().with_staleness(staleness),
            fetches: HashMap::new(),
        }
    }

    /// Availability check for `region`, preceded by fetches of every missing
    /// remote unit.
    async fn availability(
        &mut self,
        region: &BoundingBox,
        params: &SampleParams,
    ) -> Result<StageId, PlanError> {
        let units = self
            .catalog
            .units_for(std::slice::from_ref(region), &params.data_re)
            .await?;
        if units.is_empty() {
            return Err(PlanError::MissingSource {
                unit: format!("'{}' data for {:?}", params.data_re, region.as_array()),
            });
        }

        let mut deps = Vec::new();
        let mut paths = Vec::with_capacity(units.len());
        for unit in units {
            let path = unit.derived_path(params.stat, params.resolution);
            paths.push(path.clone());
            if self.storage.exists(&path).await? {
                continue;
            }
            let Some(url) = unit.url.clone() else {
                return Err(PlanError::MissingSource { unit: unit.file });
            };
            if let Some(&fetch) = self.fetches.get(&path) {
                deps.push(fetch);
                continue;
            }

            let key = fingerprint("fetch", &CallArgs::new().arg("path", &path))?;
            let fetch = self.builder.add_once(
                Stage::Fetch(FetchSpec {
                    unit: unit.file.clone(),
                    url,
                    output_path: path.clone(),
                    params: params.clone(),
                    compute_from_points: unit.compute_from_points,
                }),
                &[],
                key,
            )?;
            debug!(unit = %unit.file, "Scheduling fetch of missing unit");
            self.fetches.insert(path, fetch);
            deps.push(fetch);
        }

        self.builder.add(
            Stage::AvailabilityCheck(AvailabilityCheck {
                region: *region,
                paths,
            }),
            &deps,
        )
    }

    /// Retrieval nodes for the weather sources not yet in storage. Returns
    /// them with the storage path of every source.
    async fn weather_sources(
        &mut self,
        sources: &[WeatherSource],
    ) -> Result<(Vec<StageId>, Vec<String>), PlanError> {
        let mut deps = Vec::new();
        let mut paths = Vec::with_capacity(sources.len());
        for source in sources {
            let path = source.output_path();
            paths.push(path.clone());
            if self.storage.exists(&path).await? {
                continue;
            }
            if let Some(&fetch) = self.fetches.get(&path) {
                deps.push(fetch);
                continue;
            }
            let key = fingerprint("weather_source", &CallArgs::new().arg("source", source))?;
            let fetch = self
                .builder
                .add_once(Stage::WeatherSource(source.clone()), &[], key)?;
            self.fetches.insert(path, fetch);
            deps.push(fetch);
        }
        if !deps.is_empty() {
            debug!(
                missing = deps.len(),
                total = sources.len(),
                "Scheduling weather source retrieval"
            );
        }
        Ok((deps, paths))
    }

    fn weather_sample(&mut self, spec: WeatherSampleSpec, deps: &[StageId]) -> Result<Tail, PlanError> {
        let key = fingerprint("weather_sample", &CallArgs::new().arg("spec", &spec))?;
        let id = self
            .builder
            .add_once(Stage::WeatherSample(spec), deps, key.clone())?;
        Ok(Tail { id, key })
    }

    fn sample(&mut self, spec: SampleSpec, check: StageId) -> Result<Tail, PlanError> {
        let key = fingerprint("sample", &CallArgs::new().arg("spec", &spec))?;
        let id = self
            .builder
            .add_once(Stage::Sample(spec), &[check], key.clone())?;
        Ok(Tail { id, key })
    }

    fn convert(&mut self, mut tail: Tail, stages: &[ConversionStage]) -> Result<Tail, PlanError> {
        for stage in stages {
            let key = fingerprint(stage.operation_id(), &CallArgs::new().arg("input", &tail.key))?;
            let id = self
                .builder
                .add_once(Stage::Convert(*stage), &[tail.id], key.clone())?;
            tail = Tail { id, key };
        }
        Ok(tail)
    }

    fn postprocess(&mut self, tail: Tail, step: Postprocess) -> Result<Tail, PlanError> {
        let key = fingerprint(
            step.operation_id(),
            &CallArgs::new().arg("input", &tail.key).arg("step", &step),
        )?;
        let id = self
            .builder
            .add_once(Stage::Postprocess(step), &[tail.id], key.clone())?;
        Ok(Tail { id, key })
    }

    fn fan_in(&mut self, branches: &[Tail], kind: MergeKind) -> Result<Tail, PlanError> {
        let ids: Vec<StageId> = branches.iter().map(|b| b.id).collect();
        let keys: Vec<&CacheKey> = branches.iter().map(|b| &b.key).collect();
        let group = self.builder.group(&ids)?;
        let key = fingerprint(
            "merge",
            &CallArgs::new().arg("kind", kind).arg("inputs", &keys),
        )?;
        let id = self
            .builder
            .add_once(Stage::Merge(kind), &[group], key.clone())?;
        Ok(Tail { id, key })
    }

    fn finish(self, output: Tail) -> Result<TaskGraph, PlanError> {
        self.builder.finish(output.id)
    }
}

/// Merge graph over results that are already materialized.
pub fn plan_merge(entries: &[CacheEntry], kind: MergeKind) -> Result<TaskGraph, PlanError> {
    let mut builder = GraphBuilder::new();
    let mut ids = Vec::with_capacity(entries.len());
    for entry in entries {
        ids.push(builder.add(Stage::Cached(entry.clone()), &[])?);
    }
    let group = builder.group(&ids)?;
    let merge = builder.add(Stage::Merge(kind), &[group])?;
    builder.finish(merge)
}

#[derive(Clone)]
pub struct Composer {
    config: PlannerConfig,
    catalog: Arc<dyn SourceCatalog>,
    storage: Arc<dyn StorageResolver>,
    gate: DedupGate,
    executor: Arc<dyn ExecutionService>,
}

impl Composer {
    pub fn new(
        config: PlannerConfig,
        catalog: Arc<dyn SourceCatalog>,
        storage: Arc<dyn StorageResolver>,
        gate: DedupGate,
        executor: Arc<dyn ExecutionService>,
    ) -> Self {
        Self {
            config,
            catalog,
            storage,
            gate,
            executor,
        }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    fn validate_box(&self, request: &BoxRequest) -> Result<(), PlanError> {
        request.params.validate()?;
        if request.region.crs != Crs::Wgs84 {
            return Err(PlanError::config("box must be given in WGS84 coordinates"));
        }
        let (height, width) = request.region.approx_size_m();
        self.config
            .check_raster_size(height, width, request.params.step)?;
        conversion_stages(Representation::RawSample, request.target)?;
        Ok(())
    }

    fn validate_integrate(&self, request: &IntegrateRequest) -> Result<Crs, PlanError> {
        self.validate_box(&request.as_box())?;
        let mesh = request.params.mesh.resolve(&request.region);
        if !mesh.is_metric() {
            return Err(PlanError::config(format!(
                "integration needs a metric mesh, got EPSG:{}",
                mesh.epsg()
            )));
        }
        if request.times.is_empty() {
            return Err(PlanError::config("time series has no rows"));
        }
        if !(0.0..=1.0).contains(&request.albedo) {
            return Err(PlanError::config(format!("invalid albedo = {}", request.albedo)));
        }
        if request.nsky == 0 {
            return Err(PlanError::config("nsky must be positive"));
        }
        Ok(mesh)
    }

    /// Cluster a route and check every cluster raster against the size
    /// ceiling. Returns the clusters and the mesh chosen for the whole route.
    fn clusters(
        &self,
        waypoints: &[Waypoint],
        margin: &MarginBox,
        multiplier: f64,
        params: &SampleParams,
    ) -> Result<(Vec<Cluster>, Crs), PlanError> {
        if waypoints.is_empty() {
            return Err(PlanError::config("route has no waypoints"));
        }
        params.validate()?;

        let clusters = cluster_route(waypoints, margin, multiplier)?;
        for cluster in &clusters {
            self.config.check_raster_size(
                cluster.box_metric.height(),
                cluster.box_metric.width(),
                params.step,
            )?;
        }
        let extent = union_box(&clusters)
            .ok_or_else(|| PlanError::config("route has no waypoints"))?;
        Ok((clusters, params.mesh.resolve(&extent)))
    }

    pub async fn plan_box_sample(&self, request: &BoxRequest) -> Result<TaskGraph, PlanError> {
        self.validate_box(request)?;
        let stages = conversion_stages(Representation::RawSample, request.target)?;
        let mesh = request.params.mesh.resolve(&request.region);

        let mut draft = Draft::new(self, Staleness::Any);
        let check = draft.availability(&request.region, &request.params).await?;
        let sample = draft.sample(
            SampleSpec::Box {
                region: request.region,
                mesh,
                params: request.params.clone(),
            },
            check,
        )?;
        let output = draft.convert(sample, &stages)?;
        draft.finish(output)
    }

    pub async fn plan_integrate(&self, request: &IntegrateRequest) -> Result<TaskGraph, PlanError> {
        let mesh = self.validate_integrate(request)?;
        let stages = conversion_stages(Representation::RawSample, request.target)?;

        let mut draft = Draft::new(self, Staleness::Any);
        let check = draft.availability(&request.region, &request.params).await?;
        let sample = draft.sample(
            SampleSpec::Box {
                region: request.region,
                mesh,
                params: request.params.clone(),
            },
            check,
        )?;
        let integrated = draft.postprocess(
            sample,
            Postprocess::IntegrateIrradiance {
                center: request.region.center(),
                mesh,
                times: request.times.clone(),
                albedo: request.albedo,
                nsky: request.nsky,
            },
        )?;
        let output = draft.convert(integrated, &stages)?;
        draft.finish(output)
    }

    /// Graph for the whole route as one unit.
    ///
    /// [`Self::run_route_sample`] splits long routes first; this never does.
    pub async fn plan_route_sample(&self, request: &RouteRequest) -> Result<TaskGraph, PlanError> {
        let (clusters, mesh) = self.clusters(
            &request.waypoints,
            &request.margin,
            request.multiplier,
            &request.params,
        )?;
        let stages = match request.postprocess {
            RoutePostprocess::Irradiance(_) => Vec::new(),
            _ => conversion_stages(Representation::RawSample, request.target)?,
        };
        info!(
            waypoints = request.waypoints.len(),
            clusters = clusters.len(),
            "Planning route sample"
        );

        let mut draft = Draft::new(self, request.staleness());
        let mut branches = Vec::with_capacity(clusters.len());
        for cluster in &clusters {
            let region = cluster.box_geographic;
            let check = draft.availability(&region, &request.params).await?;
            let sample = draft.sample(
                SampleSpec::Box {
                    region,
                    mesh,
                    params: request.params.clone(),
                },
                check,
            )?;

            let tail = match &request.postprocess {
                RoutePostprocess::Irradiance(params) => draft.postprocess(
                    sample,
                    Postprocess::RouteIrradiance {
                        waypoints: cluster.members.clone(),
                        center: region.center(),
                        mesh,
                        params: params.clone(),
                    },
                )?,
                RoutePostprocess::Filter(filter) => {
                    let filtered = draft.postprocess(sample, Postprocess::Filter(filter.clone()))?;
                    let rendered = draft.convert(filtered, &stages)?;
                    draft.postprocess(rendered, Postprocess::MapToBox { region })?
                }
                RoutePostprocess::None => {
                    let rendered = draft.convert(sample, &stages)?;
                    draft.postprocess(rendered, Postprocess::MapToBox { region })?
                }
            };
            branches.push(tail);
        }

        let output = draft.fan_in(&branches, request.merge_kind())?;
        draft.finish(output)
    }

    fn point_query_params(&self, params: &SampleParams) -> SampleParams {
        SampleParams {
            mesh: MeshCrs::Utm,
            step: self.config.point_query_step,
            ..params.clone()
        }
    }

    /// Graph for the whole route as one unit; see [`Self::plan_route_sample`].
    pub async fn plan_route_query_at_points(
        &self,
        request: &PointQueryRequest,
    ) -> Result<TaskGraph, PlanError> {
        let params = self.point_query_params(&request.params);
        let (clusters, _) = self.clusters(
            &request.waypoints,
            &self.config.point_query_margin,
            self.config.point_query_multiplier,
            &params,
        )?;
        info!(
            waypoints = request.waypoints.len(),
            clusters = clusters.len(),
            "Planning point query"
        );

        let mut draft = Draft::new(self, Staleness::Any);
        let mut branches = Vec::with_capacity(clusters.len());
        for cluster in &clusters {
            let region = cluster.box_geographic;
            let check = draft.availability(&region, &params).await?;
            branches.push(draft.sample(
                SampleSpec::Points {
                    region,
                    params: params.clone(),
                    waypoints: cluster.members.clone(),
                },
                check,
            )?);
        }

        let output = draft.fan_in(&branches, MergeKind::RouteTable)?;
        draft.finish(output)
    }

    pub async fn plan_weather_box(&self, request: &WeatherBoxRequest) -> Result<TaskGraph, PlanError> {
        if request.region.crs != Crs::Wgs84 {
            return Err(PlanError::config("box must be given in WGS84 coordinates"));
        }
        let hash_length = self.config.weather_hash_length(request.product);
        let sources = box_sources(request.product, &request.region, &request.range, hash_length);

        let mut draft = Draft::new(self, Staleness::Any);
        let (deps, paths) = draft.weather_sources(&sources).await?;
        let output = draft.weather_sample(
            WeatherSampleSpec::Box {
                product: request.product,
                region: request.region,
                range: request.range,
                step: request.step,
                variables: variables_or_default(request.product, &request.variables),
                sources: paths,
            },
            &deps,
        )?;
        draft.finish(output)
    }

    /// Graph for the whole route as one unit; see [`Self::plan_route_sample`].
    pub async fn plan_weather_route(
        &self,
        request: &WeatherRouteRequest,
    ) -> Result<TaskGraph, PlanError> {
        if request.waypoints.is_empty() {
            return Err(PlanError::config("route has no waypoints"));
        }
        let hash_length = self.config.weather_hash_length(request.product);
        let sources = route_sources(request.product, &request.waypoints, hash_length)?;
        info!(
            waypoints = request.waypoints.len(),
            sources = sources.len(),
            product = request.product.name(),
            "Planning weather route"
        );

        let mut draft = Draft::new(self, Staleness::Any);
        let (deps, paths) = draft.weather_sources(&sources).await?;
        let output = draft.weather_sample(
            WeatherSampleSpec::Route {
                product: request.product,
                waypoints: request.waypoints.clone(),
                variables: variables_or_default(request.product, &request.variables),
                sources: paths,
            },
            &deps,
        )?;
        draft.finish(output)
    }

    /// Sub-routes a route is computed in; a single part if no split is needed.
    pub fn route_parts(
        &self,
        waypoints: &[Waypoint],
        default_time: Option<DateTime<Utc>>,
    ) -> Vec<Vec<Waypoint>> {
        split_route(waypoints, &self.config.split, default_time)
    }

    /// Compute every part through the gate, then merge the part results, all
    /// under `key`.
    async fn run_in_parts<F, Fut>(
        &self,
        key: &CacheKey,
        staleness: Staleness,
        parts: Vec<Vec<Waypoint>>,
        kind: MergeKind,
        cancel: &CancellationToken,
        run_part: F,
    ) -> Result<CacheEntry, PlanError>
    where
        F: Fn(Vec<Waypoint>) -> Fut,
        Fut: Future<Output = Result<CacheEntry, PlanError>>,
    {
        self.gate
            .run_once(key, staleness, cancel, || async {
                info!(parts = parts.len(), key = %key.short(), "Splitting route request");
                let entries = try_join_all(parts.into_iter().map(run_part)).await?;
                let graph = plan_merge(&entries, kind)?;
                self.executor.submit(graph, cancel.clone()).await
            })
            .await
    }

    pub async fn run_box_sample(
        &self,
        request: &BoxRequest,
        cancel: CancellationToken,
    ) -> Result<CacheEntry, PlanError> {
        self.validate_box(request)?;
        let key = fingerprint("box_sample", &request.call_args())?;
        self.gate
            .run_once(&key, Staleness::Any, &cancel, || async {
                let graph = self.plan_box_sample(request).await?;
                self.executor.submit(graph, cancel.clone()).await
            })
            .await
    }

    pub async fn run_integrate(
        &self,
        request: &IntegrateRequest,
        cancel: CancellationToken,
    ) -> Result<CacheEntry, PlanError> {
        self.validate_integrate(request)?;
        let key = fingerprint("integrate", &request.call_args())?;
        self.gate
            .run_once(&key, Staleness::Any, &cancel, || async {
                let graph = self.plan_integrate(request).await?;
                self.executor.submit(graph, cancel.clone()).await
            })
            .await
    }

    async fn run_route_part(
        &self,
        request: &RouteRequest,
        cancel: CancellationToken,
    ) -> Result<CacheEntry, PlanError> {
        let key = fingerprint("route_sample", &request.call_args())?;
        self.gate
            .run_once(&key, request.staleness(), &cancel, || async {
                let graph = self.plan_route_sample(request).await?;
                self.executor.submit(graph, cancel.clone()).await
            })
            .await
    }

    pub async fn run_route_sample(
        &self,
        request: &RouteRequest,
        cancel: CancellationToken,
    ) -> Result<CacheEntry, PlanError> {
        if request.waypoints.is_empty() {
            return Err(PlanError::config("route has no waypoints"));
        }
        request.params.validate()?;

        let parts = self.route_parts(&request.waypoints, request.default_time());
        if parts.len() <= 1 {
            return self.run_route_part(request, cancel).await;
        }

        let key = fingerprint("route_sample", &request.call_args())?;
        self.run_in_parts(
            &key,
            request.staleness(),
            parts,
            request.merge_kind(),
            &cancel,
            |part| {
                let sub = request.with_waypoints(part);
                let cancel = cancel.clone();
                async move { self.run_route_part(&sub, cancel).await }
            },
        )
        .await
    }

    async fn run_point_part(
        &self,
        request: &PointQueryRequest,
        cancel: CancellationToken,
    ) -> Result<CacheEntry, PlanError> {
        let key = fingerprint("route_query_at_points", &request.call_args())?;
        self.gate
            .run_once(&key, Staleness::Any, &cancel, || async {
                let graph = self.plan_route_query_at_points(request).await?;
                self.executor.submit(graph, cancel.clone()).await
            })
            .await
    }

    pub async fn run_route_query_at_points(
        &self,
        request: &PointQueryRequest,
        cancel: CancellationToken,
    ) -> Result<CacheEntry, PlanError> {
        if request.waypoints.is_empty() {
            return Err(PlanError::config("route has no waypoints"));
        }
        request.params.validate()?;

        let parts = self.route_parts(&request.waypoints, None);
        if parts.len() <= 1 {
            return self.run_point_part(request, cancel).await;
        }

        let key = fingerprint("route_query_at_points", &request.call_args())?;
        self.run_in_parts(
            &key,
            Staleness::Any,
            parts,
            MergeKind::RouteTable,
            &cancel,
            |part| {
                let sub = PointQueryRequest {
                    waypoints: part,
                    params: request.params.clone(),
                };
                let cancel = cancel.clone();
                async move { self.run_point_part(&sub, cancel).await }
            },
        )
        .await
    }

    pub async fn run_weather_box(
        &self,
        request: &WeatherBoxRequest,
        cancel: CancellationToken,
    ) -> Result<CacheEntry, PlanError> {
        let key = fingerprint("weather_box", &request.call_args())?;
        self.gate
            .run_once(&key, Staleness::Any, &cancel, || async {
                let graph = self.plan_weather_box(request).await?;
                self.executor.submit(graph, cancel.clone()).await
            })
            .await
    }

    async fn run_weather_part(
        &self,
        request: &WeatherRouteRequest,
        cancel: CancellationToken,
    ) -> Result<CacheEntry, PlanError> {
        let key = fingerprint("weather_route", &request.call_args())?;
        self.gate
            .run_once(&key, Staleness::Any, &cancel, || async {
                let graph = self.plan_weather_route(request).await?;
                self.executor.submit(graph, cancel.clone()).await
            })
            .await
    }

    /// Weather values along a route, split into sub-routes whose region
    /// buckets are no finer than the product's source cells.
    pub async fn run_weather_route(
        &self,
        request: &WeatherRouteRequest,
        cancel: CancellationToken,
    ) -> Result<CacheEntry, PlanError> {
        if request.waypoints.is_empty() {
            return Err(PlanError::config("route has no waypoints"));
        }
        // Every waypoint needs a time before any part is planned.
        let hash_length = self.config.weather_hash_length(request.product);
        route_sources(request.product, &request.waypoints, hash_length)?;

        let policy = self.config.weather_split(request.product);
        let parts = split_route(&request.waypoints, &policy, None);
        if parts.len() <= 1 {
            return self.run_weather_part(request, cancel).await;
        }

        let key = fingerprint("weather_route", &request.call_args())?;
        self.run_in_parts(
            &key,
            Staleness::Any,
            parts,
            MergeKind::RouteTable,
            &cancel,
            |part| {
                let sub = request.with_waypoints(part);
                let cancel = cancel.clone();
                async move { self.run_weather_part(&sub, cancel).await }
            },
        )
        .await
    }
}
