//! Task graphs handed to the execution service.
//!
//! A graph is a list of typed stage nodes. Each node names the nodes it
//! depends on, and a dependency must already exist when a node is added, so
//! every graph built through [`GraphBuilder`] is acyclic. Chains are nodes
//! depending on their predecessor, parallel groups are nodes sharing no
//! dependencies, and fan-in is a [`Stage::Group`] node collecting the outputs
//! of its branches in dependency order.

use crate::convert::ConversionStage;
use crate::error::PlanError;
use crate::fingerprint::{CacheEntry, CacheKey, Staleness};
use crate::models::{BoundingBox, Crs, SampleParams, Waypoint};
use crate::table::TimeSample;
use crate::weather::{WeatherSampleSpec, WeatherSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId(pub usize);

/// Derive one missing raw unit from its remote source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchSpec {
    pub unit: String,
    pub url: String,
    /// Storage path the derived unit is written to
    pub output_path: String,
    pub params: SampleParams,
    /// Source needs a point-cloud rasterization before statistics
    pub compute_from_points: bool,
}

/// Verify every raw unit of a region is present before sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityCheck {
    pub region: BoundingBox,
    /// Derived storage paths that must exist once the fetch group finished
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SampleSpec {
    /// Rasterize a region on a mesh
    Box {
        region: BoundingBox,
        mesh: Crs,
        params: SampleParams,
    },
    /// Read raster values at route points inside a region
    Points {
        region: BoundingBox,
        params: SampleParams,
        waypoints: Vec<Waypoint>,
    },
}

impl SampleSpec {
    pub fn region(&self) -> &BoundingBox {
        match self {
            SampleSpec::Box { region, .. } | SampleSpec::Points { region, .. } => region,
        }
    }
}

/// Defaults applied to waypoints lacking their own irradiance attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrradianceParams {
    pub ghi_default: f64,
    pub dhi_default: f64,
    pub time_default: DateTime<Utc>,
    pub albedo: f64,
    /// Height of the sensor above the surface in meters
    pub offset: f64,
    pub azimuth: f64,
    pub zenith: f64,
    pub nsky: u32,
}

impl Default for IrradianceParams {
    fn default() -> Self {
        Self {
            ghi_default: 1000.0,
            dhi_default: 100.0,
            time_default: DateTime::<Utc>::from_timestamp(1_593_583_200, 0).unwrap_or_default(),
            albedo: 0.5,
            offset: 0.01,
            azimuth: 180.0,
            zenith: 0.0,
            nsky: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub filter_type: String,
    pub size: usize,
}

/// Per-cluster step applied after sampling and conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Postprocess {
    /// Irradiance along the cluster's waypoints using the sampled surface
    RouteIrradiance {
        waypoints: Vec<Waypoint>,
        center: (f64, f64),
        mesh: Crs,
        params: IrradianceParams,
    },
    Filter(FilterSpec),
    /// Attach the cluster's geographic box to a rendered output
    MapToBox { region: BoundingBox },
    /// Irradiance summed over a time series on every cell of a metric raster
    IntegrateIrradiance {
        /// `(lat, lon)` the sun position is computed for
        center: (f64, f64),
        mesh: Crs,
        times: Vec<TimeSample>,
        albedo: f64,
        nsky: u32,
    },
}

impl Postprocess {
    pub fn operation_id(&self) -> &'static str {
        match self {
            Postprocess::RouteIrradiance { .. } => "postprocess.route_irradiance",
            Postprocess::Filter(_) => "postprocess.filter",
            Postprocess::MapToBox { .. } => "postprocess.map_to_box",
            Postprocess::IntegrateIrradiance { .. } => "postprocess.integrate_irradiance",
        }
    }
}

/// How a fan-in combines its branch outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeKind {
    /// Per-waypoint rows, re-sorted by original waypoint index
    RouteTable,
    /// One rendered raster per branch, kept in branch order with its box
    CollectRasters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "spec", rename_all = "snake_case")]
pub enum Stage {
    Fetch(FetchSpec),
    AvailabilityCheck(AvailabilityCheck),
    Sample(SampleSpec),
    Convert(ConversionStage),
    Postprocess(Postprocess),
    /// Fan-in barrier collecting the outputs of independent branches
    Group { width: usize },
    Merge(MergeKind),
    /// Input already materialized by an earlier compute-once call
    Cached(CacheEntry),
    /// Retrieve one weather source file
    WeatherSource(WeatherSource),
    WeatherSample(WeatherSampleSpec),
}

impl Stage {
    /// Short name used in logs, errors and graph summaries.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Fetch(_) => "fetch",
            Stage::AvailabilityCheck(_) => "availability_check",
            Stage::Sample(_) => "sample",
            Stage::Convert(stage) => match stage {
                ConversionStage::Render { .. } => "render",
                ConversionStage::ExportGeoreferenced => "export_georeferenced",
                ConversionStage::HillshadeRender => "hillshade_render",
                ConversionStage::ImportRawSample => "import_raw_sample",
            },
            Stage::Postprocess(post) => match post {
                Postprocess::RouteIrradiance { .. } => "route_irradiance",
                Postprocess::Filter(_) => "filter",
                Postprocess::MapToBox { .. } => "map_to_box",
                Postprocess::IntegrateIrradiance { .. } => "integrate_irradiance",
            },
            Stage::Group { .. } => "group",
            Stage::Merge(_) => "merge",
            Stage::Cached(_) => "cached",
            Stage::WeatherSource(_) => "weather_source",
            Stage::WeatherSample(_) => "weather_sample",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageNode {
    pub id: StageId,
    pub stage: Stage,
    pub deps: Vec<StageId>,
    /// Execute through the compute-once gate under this key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_once: Option<CacheKey>,
    /// Failure is logged and the node yields no output instead of failing
    /// the graph
    #[serde(default)]
    pub advisory: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGraph {
    nodes: Vec<StageNode>,
    output: StageId,
    /// Freshness rule for every run-once node of the graph
    #[serde(default, skip_serializing_if = "Staleness::is_any")]
    staleness: Staleness,
}

impl TaskGraph {
    pub fn nodes(&self) -> &[StageNode] {
        &self.nodes
    }

    pub fn node(&self, id: StageId) -> Option<&StageNode> {
        self.nodes.get(id.0)
    }

    pub fn output(&self) -> StageId {
        self.output
    }

    pub fn staleness(&self) -> Staleness {
        self.staleness
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes that depend on `id`.
    pub fn dependents(&self, id: StageId) -> Vec<StageId> {
        self.nodes
            .iter()
            .filter(|node| node.deps.contains(&id))
            .map(|node| node.id)
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.nodes
            .iter()
            .filter(|node| node.stage.name() == name)
            .count()
    }

    /// Stage names from a root to the output, following each node's first
    /// dependency.
    pub fn spine(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        let mut current = self.node(self.output);
        while let Some(node) = current {
            names.push(node.stage.name());
            current = node.deps.first().and_then(|dep| self.node(*dep));
        }
        names.reverse();
        names
    }

    /// Check structural invariants of a graph received from elsewhere.
    ///
    /// Every dependency must point at an earlier node, which rules out cycles.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.nodes.is_empty() {
            return Err(PlanError::config("task graph has no stages"));
        }
        for (position, node) in self.nodes.iter().enumerate() {
            if node.id.0 != position {
                return Err(PlanError::config(format!(
                    "stage {} stored at position {}",
                    node.id.0, position
                )));
            }
            if let Some(dep) = node.deps.iter().find(|dep| dep.0 >= position) {
                return Err(PlanError::config(format!(
                    "stage {} depends on later stage {}",
                    position, dep.0
                )));
            }
        }
        if self.output.0 >= self.nodes.len() {
            return Err(PlanError::config("task graph output is not a stage"));
        }
        Ok(())
    }
}

/// Incremental builder for [`TaskGraph`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<StageNode>,
    staleness: Staleness,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing run-once results older than `staleness` allows are
    /// recomputed instead of reused.
    pub fn with_staleness(mut self, staleness: Staleness) -> Self {
        self.staleness = staleness;
        self
    }

    fn push(&mut self, stage: Stage, deps: &[StageId], run_once: Option<CacheKey>) -> StageId {
        let id = StageId(self.nodes.len());
        debug_assert!(deps.iter().all(|dep| dep.0 < id.0));
        self.nodes.push(StageNode {
            id,
            stage,
            deps: deps.to_vec(),
            run_once,
            advisory: false,
        });
        id
    }

    fn check_deps(&self, deps: &[StageId]) -> Result<(), PlanError> {
        match deps.iter().find(|dep| dep.0 >= self.nodes.len()) {
            Some(dep) => Err(PlanError::config(format!("unknown stage {}", dep.0))),
            None => Ok(()),
        }
    }

    /// Add a stage after `deps`.
    pub fn add(&mut self, stage: Stage, deps: &[StageId]) -> Result<StageId, PlanError> {
        self.check_deps(deps)?;
        Ok(self.push(stage, deps, None))
    }

    /// Add a stage executed at most once per `key`.
    pub fn add_once(
        &mut self,
        stage: Stage,
        deps: &[StageId],
        key: CacheKey,
    ) -> Result<StageId, PlanError> {
        self.check_deps(deps)?;
        Ok(self.push(stage, deps, Some(key)))
    }

    pub fn mark_advisory(&mut self, id: StageId) {
        if let Some(node) = self.nodes.get_mut(id.0) {
            node.advisory = true;
        }
    }

    /// Fan-in: collect the outputs of `branches`, in the given order.
    pub fn group(&mut self, branches: &[StageId]) -> Result<StageId, PlanError> {
        self.add(
            Stage::Group {
                width: branches.len(),
            },
            branches,
        )
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: StageId) -> Option<&StageNode> {
        self.nodes.get(id.0)
    }

    pub fn finish(self, output: StageId) -> Result<TaskGraph, PlanError> {
        let graph = TaskGraph {
            nodes: self.nodes,
            output,
            staleness: self.staleness,
        };
        graph.validate()?;
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SampleParams;

    fn sample_stage() -> Stage {
        Stage::Sample(SampleSpec::Box {
            region: BoundingBox::new(0.0, 0.0, 1.0, 1.0, Crs::Wgs84),
            mesh: Crs::Utm {
                zone: 31,
                north: true,
            },
            params: SampleParams::default(),
        })
    }

    #[test]
    fn builder_rejects_unknown_dependency() {
        let mut builder = GraphBuilder::new();
        assert!(builder.add(sample_stage(), &[StageId(3)]).is_err());
    }

    #[test]
    fn spine_follows_first_dependency() {
        let mut builder = GraphBuilder::new();
        let check = builder
            .add(
                Stage::AvailabilityCheck(AvailabilityCheck {
                    region: BoundingBox::new(0.0, 0.0, 1.0, 1.0, Crs::Wgs84),
                    paths: Vec::new(),
                }),
                &[],
            )
            .unwrap();
        let sample = builder.add(sample_stage(), &[check]).unwrap();
        let export = builder
            .add(Stage::Convert(ConversionStage::ExportGeoreferenced), &[sample])
            .unwrap();
        let graph = builder.finish(export).unwrap();

        assert_eq!(
            graph.spine(),
            vec!["availability_check", "sample", "export_georeferenced"]
        );
        assert_eq!(graph.dependents(sample), vec![export]);
    }

    #[test]
    fn group_collects_branches() {
        let mut builder = GraphBuilder::new();
        let a = builder.add(sample_stage(), &[]).unwrap();
        let b = builder.add(sample_stage(), &[]).unwrap();
        let group = builder.group(&[a, b]).unwrap();
        let merge = builder.add(Stage::Merge(MergeKind::RouteTable), &[group]).unwrap();
        let graph = builder.finish(merge).unwrap();

        assert_eq!(graph.node(group).unwrap().deps, vec![a, b]);
        assert_eq!(graph.count("sample"), 2);
    }

    #[test]
    fn validate_rejects_forward_edges() {
        let graph = TaskGraph {
            nodes: vec![StageNode {
                id: StageId(0),
                stage: sample_stage(),
                deps: vec![StageId(0)],
                run_once: None,
                advisory: false,
            }],
            output: StageId(0),
            staleness: Staleness::Any,
        };
        assert!(graph.validate().is_err());
    }

    #[test]
    fn graph_serializes_for_transport() {
        let mut builder = GraphBuilder::new();
        let sample = builder.add(sample_stage(), &[]).unwrap();
        let graph = builder.finish(sample).unwrap();

        let json = serde_json::to_string(&graph).unwrap();
        let back: TaskGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(back, graph);
    }

    #[test]
    fn staleness_travels_with_the_graph() {
        let cutoff = DateTime::<Utc>::from_timestamp(1_650_884_152, 0).unwrap();
        let mut builder = GraphBuilder::new().with_staleness(Staleness::CreatedBefore(cutoff));
        let sample = builder.add(sample_stage(), &[]).unwrap();
        let graph = builder.finish(sample).unwrap();
        assert_eq!(graph.staleness(), Staleness::CreatedBefore(cutoff));

        let back: TaskGraph = serde_json::from_str(&serde_json::to_string(&graph).unwrap()).unwrap();
        assert_eq!(back.staleness(), Staleness::CreatedBefore(cutoff));
    }
}
