//! Execution of task graphs.
//!
//! The composer only describes work; an [`ExecutionService`] runs it. The
//! in-process [`LocalExecutor`] schedules each stage as a tokio task once its
//! dependencies have finished, routes run-once stages through the
//! [`DedupGate`], and stops everything on the first non-advisory failure.

use crate::gate::DedupGate;
use crate::kernels::Kernels;
use crate::storage::StorageResolver;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use terraplan_core::{PlanError, SampleSpec, Stage, StageNode, Staleness, TaskGraph};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[async_trait]
pub trait ExecutionService: Send + Sync {
    /// Run `graph` to completion and return the storage path of its output.
    async fn submit(&self, graph: TaskGraph, cancel: CancellationToken)
        -> Result<String, PlanError>;
}

/// Value produced by one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    /// Stage has no data output (checks, failed advisory stages)
    Nothing,
    Location(String),
    /// Ordered branch outputs of a group
    Collection(Vec<StageOutput>),
}

impl StageOutput {
    fn location(&self) -> Option<&str> {
        match self {
            StageOutput::Location(path) => Some(path),
            _ => None,
        }
    }
}

struct Context {
    kernels: Arc<dyn Kernels>,
    storage: Arc<dyn StorageResolver>,
    gate: DedupGate,
    stage_timeout: Duration,
}

#[derive(Clone)]
pub struct LocalExecutor {
    ctx: Arc<Context>,
}

impl LocalExecutor {
    pub fn new(
        kernels: Arc<dyn Kernels>,
        storage: Arc<dyn StorageResolver>,
        gate: DedupGate,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            ctx: Arc::new(Context {
                kernels,
                storage,
                gate,
                stage_timeout,
            }),
        }
    }
}

fn first_location<'a>(
    node: &StageNode,
    inputs: &'a [StageOutput],
) -> Result<&'a str, PlanError> {
    inputs
        .iter()
        .find_map(StageOutput::location)
        .ok_or_else(|| PlanError::stage(node.stage.name(), "no input location"))
}

async fn execute_stage(
    ctx: &Context,
    node: &StageNode,
    inputs: Vec<StageOutput>,
) -> Result<StageOutput, PlanError> {
    let location = match &node.stage {
        Stage::Fetch(spec) => ctx.kernels.fetch_source(spec).await?,
        Stage::AvailabilityCheck(check) => {
            for path in &check.paths {
                if !ctx.storage.exists(path).await? {
                    return Err(PlanError::MissingSource { unit: path.clone() });
                }
            }
            return Ok(StageOutput::Nothing);
        }
        Stage::Sample(SampleSpec::Box {
            region,
            mesh,
            params,
        }) => ctx.kernels.sample_box(region, *mesh, params).await?,
        Stage::Sample(SampleSpec::Points {
            region,
            params,
            waypoints,
        }) => ctx.kernels.sample_points(region, params, waypoints).await?,
        Stage::Convert(stage) => {
            let input = first_location(node, &inputs)?;
            ctx.kernels.convert(*stage, input).await?
        }
        Stage::Postprocess(step) => {
            let input = first_location(node, &inputs)?;
            ctx.kernels.postprocess(step, input).await?
        }
        Stage::Group { .. } => return Ok(StageOutput::Collection(inputs)),
        Stage::Merge(kind) => {
            let mut parts = Vec::new();
            for input in &inputs {
                match input {
                    StageOutput::Collection(items) => {
                        parts.extend(items.iter().filter_map(StageOutput::location).map(String::from))
                    }
                    StageOutput::Location(path) => parts.push(path.clone()),
                    StageOutput::Nothing => {}
                }
            }
            if parts.is_empty() {
                return Err(PlanError::stage("merge", "nothing to merge"));
            }
            ctx.kernels.merge(*kind, &parts).await?
        }
        Stage::Cached(entry) => entry.location.clone(),
        Stage::WeatherSource(source) => ctx.kernels.fetch_weather(source).await?,
        Stage::WeatherSample(spec) => ctx.kernels.sample_weather(spec).await?,
    };
    Ok(StageOutput::Location(location))
}

async fn run_node(
    ctx: Arc<Context>,
    node: StageNode,
    inputs: Vec<StageOutput>,
    staleness: Staleness,
    cancel: CancellationToken,
) -> Result<StageOutput, PlanError> {
    let name = node.stage.name();
    let work = async {
        match &node.run_once {
            Some(key) => {
                let entry = ctx
                    .gate
                    .run_once(key, staleness, &cancel, || async {
                        match execute_stage(&ctx, &node, inputs).await? {
                            StageOutput::Location(path) => Ok(path),
                            _ => Err(PlanError::stage(name, "run-once stage produced no file")),
                        }
                    })
                    .await?;
                Ok(StageOutput::Location(entry.location))
            }
            None => execute_stage(&ctx, &node, inputs).await,
        }
    };

    match tokio::time::timeout(ctx.stage_timeout, work).await {
        Ok(result) => result,
        Err(_) => Err(PlanError::stage(
            name,
            format!("timed out after {:?}", ctx.stage_timeout),
        )),
    }
}

#[async_trait]
impl ExecutionService for LocalExecutor {
    async fn submit(
        &self,
        graph: TaskGraph,
        cancel: CancellationToken,
    ) -> Result<String, PlanError> {
        graph.validate()?;
        let count = graph.len();
        let staleness = graph.staleness();
        info!(stages = count, output = graph.output().0, ?staleness, "Submitting task graph");

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut pending: Vec<usize> = vec![0; count];
        for node in graph.nodes() {
            for dep in &node.deps {
                dependents[dep.0].push(node.id.0);
                pending[node.id.0] += 1;
            }
        }

        let mut outputs: Vec<Option<StageOutput>> = vec![None; count];
        let mut ready: Vec<usize> = (0..count).filter(|&i| pending[i] == 0).collect();
        let mut running: JoinSet<(usize, Result<StageOutput, PlanError>)> = JoinSet::new();

        loop {
            for id in ready.drain(..) {
                let node = graph.nodes()[id].clone();
                let inputs: Vec<StageOutput> = node
                    .deps
                    .iter()
                    .map(|dep| outputs[dep.0].clone().unwrap_or(StageOutput::Nothing))
                    .collect();
                debug!(stage = id, name = node.stage.name(), "Starting stage");
                let ctx = self.ctx.clone();
                let cancel = cancel.clone();
                running.spawn(async move {
                    (id, run_node(ctx, node, inputs, staleness, cancel).await)
                });
            }

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("Task graph cancelled");
                    running.abort_all();
                    return Err(PlanError::Cancelled);
                }
                joined = running.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };

            let (id, result) = match joined {
                Ok(done) => done,
                Err(err) => {
                    running.abort_all();
                    return Err(PlanError::stage("executor", err));
                }
            };
            let node = &graph.nodes()[id];
            let output = match result {
                Ok(output) => output,
                Err(err) if node.advisory => {
                    warn!(stage = id, name = node.stage.name(), "Advisory stage failed: {}", err);
                    StageOutput::Nothing
                }
                Err(err) => {
                    warn!(stage = id, name = node.stage.name(), "Stage failed: {}", err);
                    running.abort_all();
                    return Err(err);
                }
            };
            outputs[id] = Some(output);

            for &next in &dependents[id] {
                pending[next] -= 1;
                if pending[next] == 0 {
                    ready.push(next);
                }
            }
        }

        match outputs[graph.output().0].take() {
            Some(StageOutput::Location(path)) => {
                info!(output = %path, "Task graph finished");
                Ok(path)
            }
            _ => Err(PlanError::stage(
                graph.node(graph.output()).map(|n| n.stage.name()).unwrap_or("output"),
                "graph output produced no file",
            )),
        }
    }
}
