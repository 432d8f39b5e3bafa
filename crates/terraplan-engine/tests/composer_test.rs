//! End-to-end planning and execution tests.
//!
//! Requests run against a temporary storage directory with the stub kernels,
//! so outputs are deterministic and can be compared byte for byte.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use chrono::{TimeZone, Utc};
use terraplan_core::{
    read_times_tsv, BoundingBox, CacheEntry, ConversionStage, Crs, FetchSpec, GraphBuilder,
    ImageStyle, IrradianceParams, MergeKind, PlanError, PlannerConfig, Postprocess,
    Representation, RouteRow, RouteTable, SampleParams, SplitPolicy, Stage, Waypoint,
    WaypointAttributes, WeatherProduct, WeatherSampleSpec, WeatherSource,
};
use terraplan_engine::{
    BoxRequest, Composer, DedupGate, ExecutionService, GateConfig, IntegrateRequest, Kernels,
    LocalExecutor, LocalStorage, MemoryLeaseStore, PointQueryRequest, RoutePostprocess,
    RouteRequest, SourceUnit, StaticCatalog, StorageResolver, StubKernels, WeatherBoxRequest,
    WeatherRouteRequest,
};
use tokio_util::sync::CancellationToken;

const TILE: &str = "srtm/N50E007.tif";

struct Harness {
    _dir: TempDir,
    storage: LocalStorage,
    store: Arc<MemoryLeaseStore>,
    executor: Arc<LocalExecutor>,
    composer: Composer,
}

fn tile(url: Option<&str>) -> SourceUnit {
    SourceUnit {
        file: TILE.to_string(),
        region: BoundingBox::new(50.0, 7.0, 51.0, 8.0, Crs::Wgs84),
        url: url.map(String::from),
        compute_from_points: false,
    }
}

fn build(
    units: Vec<SourceUnit>,
    config: PlannerConfig,
    kernels: impl FnOnce(LocalStorage) -> Arc<dyn Kernels>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let storage = LocalStorage::new(dir.path());
    let store = Arc::new(MemoryLeaseStore::new());
    let gate = DedupGate::new(store.clone(), GateConfig::default());
    let executor = Arc::new(LocalExecutor::new(
        kernels(storage.clone()),
        Arc::new(storage.clone()),
        gate.clone(),
        Duration::from_secs(30),
    ));
    let composer = Composer::new(
        config,
        Arc::new(StaticCatalog::new(units)),
        Arc::new(storage.clone()),
        gate,
        executor.clone(),
    );
    Harness {
        _dir: dir,
        storage,
        store,
        executor,
        composer,
    }
}

async fn harness_with_tile(config: PlannerConfig) -> Harness {
    let h = build(vec![tile(None)], config, |s| Arc::new(StubKernels::new(s)));
    h.storage.write("srtm/N50E007.tif_max_0.3", b"dem").await.unwrap();
    h
}

async fn read(h: &Harness, path: &str) -> Vec<u8> {
    let local = h.storage.resolve_local(path).await.unwrap();
    tokio::fs::read(local).await.unwrap()
}

fn box_request(target: Representation) -> BoxRequest {
    BoxRequest {
        region: BoundingBox::from_lat_lon([50.865, 7.119, 50.867, 7.121]).unwrap(),
        params: SampleParams::default(),
        target,
    }
}

fn line_route(count: usize) -> Vec<Waypoint> {
    (0..count)
        .map(|i| Waypoint::new(i, 50.865 + i as f64 * 1.0e-5, 7.119).unwrap())
        .collect()
}

/// A geotiff request samples then exports; hillshade adds one render stage
/// and equals rendering the cached geotiff.
#[tokio::test]
async fn test_hillshade_reuses_geotiff_chain() {
    let h = harness_with_tile(PlannerConfig::default()).await;
    let geotiff = box_request(Representation::GeoRaster);
    let hillshade = box_request(Representation::Image(ImageStyle::Hillshade));

    let plan = h.composer.plan_box_sample(&geotiff).await.unwrap();
    assert_eq!(
        plan.spine(),
        vec!["availability_check", "sample", "export_georeferenced"]
    );
    let plan = h.composer.plan_box_sample(&hillshade).await.unwrap();
    assert_eq!(
        plan.spine(),
        vec![
            "availability_check",
            "sample",
            "export_georeferenced",
            "hillshade_render"
        ]
    );

    let geotiff_entry = h
        .composer
        .run_box_sample(&geotiff, CancellationToken::new())
        .await
        .unwrap();
    let direct = h
        .composer
        .run_box_sample(&hillshade, CancellationToken::new())
        .await
        .unwrap();

    let mut builder = GraphBuilder::new();
    let cached = builder.add(Stage::Cached(geotiff_entry), &[]).unwrap();
    let render = builder
        .add(Stage::Convert(ConversionStage::HillshadeRender), &[cached])
        .unwrap();
    let rerender = h
        .executor
        .submit(builder.finish(render).unwrap(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(read(&h, &direct.location).await, read(&h, &rerender).await);
}

/// Identical requests return the same published entry.
#[tokio::test]
async fn test_repeated_request_is_a_hit() {
    let h = harness_with_tile(PlannerConfig::default()).await;
    let request = box_request(Representation::GeoRaster);

    let first = h
        .composer
        .run_box_sample(&request, CancellationToken::new())
        .await
        .unwrap();
    let second = h
        .composer
        .run_box_sample(&request, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first, second);
}

/// A 5000-point query split at 3000 merges to the same table as an unsplit
/// run.
#[tokio::test]
async fn test_split_point_query_matches_unsplit() {
    let route = line_route(5000);
    let request = PointQueryRequest {
        waypoints: route.clone(),
        params: SampleParams::default(),
    };

    let split_config = PlannerConfig {
        split: SplitPolicy {
            max_waypoints: 3000,
            partition_by: Vec::new(),
            max_buckets: 1,
        },
        ..PlannerConfig::default()
    };
    let whole_config = PlannerConfig {
        split: SplitPolicy {
            max_waypoints: 10_000,
            partition_by: Vec::new(),
            max_buckets: 1,
        },
        ..PlannerConfig::default()
    };
    let split = harness_with_tile(split_config).await;
    let whole = harness_with_tile(whole_config).await;

    let parts = split.composer.route_parts(&route, None);
    assert_eq!(parts.iter().map(Vec::len).collect::<Vec<_>>(), vec![3000, 2000]);
    assert_eq!(whole.composer.route_parts(&route, None).len(), 1);

    let split_entry = split
        .composer
        .run_route_query_at_points(&request, CancellationToken::new())
        .await
        .unwrap();
    let whole_entry = whole
        .composer
        .run_route_query_at_points(&request, CancellationToken::new())
        .await
        .unwrap();

    let split_bytes = read(&split, &split_entry.location).await;
    let whole_bytes = read(&whole, &whole_entry.location).await;
    assert_eq!(split_bytes, whole_bytes);

    let table = RouteTable::read_tsv(split_bytes.as_slice()).unwrap();
    assert_eq!(table.indices(), (0..5000).collect::<Vec<_>>());
}

/// Irradiance along a route yields one row per waypoint in route order.
#[tokio::test]
async fn test_route_irradiance_table() {
    let h = harness_with_tile(PlannerConfig::default()).await;
    let mut waypoints = line_route(3);
    waypoints.push(Waypoint::new(3, 50.90, 7.20).unwrap());
    let mut request = RouteRequest::new(waypoints, h.composer.config());
    request.postprocess = RoutePostprocess::Irradiance(IrradianceParams::default());

    let entry = h
        .composer
        .run_route_sample(&request, CancellationToken::new())
        .await
        .unwrap();

    let table = RouteTable::read_tsv(read(&h, &entry.location).await.as_slice()).unwrap();
    assert_eq!(table.indices(), vec![0, 1, 2, 3]);
    assert!(table.rows.iter().all(|row| row.values.contains_key("irradiance")));
}

/// Rendered route rasters are collected one per cluster.
#[tokio::test]
async fn test_route_rasters_collected_per_cluster() {
    let h = harness_with_tile(PlannerConfig::default()).await;
    let request = RouteRequest::new(
        vec![
            Waypoint::new(0, 50.865, 7.119).unwrap(),
            Waypoint::new(1, 50.90, 7.20).unwrap(),
        ],
        h.composer.config(),
    );

    let entry = h
        .composer
        .run_route_sample(&request, CancellationToken::new())
        .await
        .unwrap();

    let items: Vec<serde_json::Value> =
        serde_json::from_slice(&read(&h, &entry.location).await).unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|item| item.get("box").is_some()));
}

/// A region with no stored and no derivable unit fails the request.
#[tokio::test]
async fn test_missing_source_fails_request() {
    let h = build(vec![tile(None)], PlannerConfig::default(), |s| {
        Arc::new(StubKernels::new(s))
    });

    let err = h
        .composer
        .run_box_sample(&box_request(Representation::GeoRaster), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        PlanError::MissingSource {
            unit: TILE.to_string()
        }
    );

    let empty = build(Vec::new(), PlannerConfig::default(), |s| {
        Arc::new(StubKernels::new(s))
    });
    assert!(matches!(
        empty
            .composer
            .run_box_sample(&box_request(Representation::GeoRaster), CancellationToken::new())
            .await,
        Err(PlanError::MissingSource { .. })
    ));
}

/// A remote unit is derived before sampling.
#[tokio::test]
async fn test_remote_unit_is_fetched() {
    let h = build(
        vec![tile(Some("https://tiles.example.org/N50E007.tif"))],
        PlannerConfig::default(),
        |s| Arc::new(StubKernels::new(s)),
    );

    let plan = h
        .composer
        .plan_box_sample(&box_request(Representation::GeoRaster))
        .await
        .unwrap();
    assert_eq!(
        plan.spine(),
        vec!["fetch", "availability_check", "sample", "export_georeferenced"]
    );

    h.composer
        .run_box_sample(&box_request(Representation::GeoRaster), CancellationToken::new())
        .await
        .unwrap();
    assert!(h.storage.exists("srtm/N50E007.tif_max_0.3").await.unwrap());
}

/// Kernels whose conversions always fail.
struct BrokenConvert {
    inner: StubKernels,
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl Kernels for BrokenConvert {
    async fn fetch_source(&self, spec: &FetchSpec) -> Result<String, PlanError> {
        self.inner.fetch_source(spec).await
    }

    async fn sample_box(
        &self,
        region: &BoundingBox,
        mesh: Crs,
        params: &SampleParams,
    ) -> Result<String, PlanError> {
        self.inner.sample_box(region, mesh, params).await
    }

    async fn sample_points(
        &self,
        region: &BoundingBox,
        params: &SampleParams,
        waypoints: &[Waypoint],
    ) -> Result<String, PlanError> {
        self.inner.sample_points(region, params, waypoints).await
    }

    async fn convert(&self, stage: ConversionStage, _input: &str) -> Result<String, PlanError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(PlanError::stage(stage.operation_id(), "gdal exited with status 1"))
    }

    async fn postprocess(&self, step: &Postprocess, input: &str) -> Result<String, PlanError> {
        self.inner.postprocess(step, input).await
    }

    async fn merge(&self, kind: MergeKind, inputs: &[String]) -> Result<String, PlanError> {
        self.inner.merge(kind, inputs).await
    }

    async fn fetch_weather(&self, source: &WeatherSource) -> Result<String, PlanError> {
        self.inner.fetch_weather(source).await
    }

    async fn sample_weather(&self, spec: &WeatherSampleSpec) -> Result<String, PlanError> {
        self.inner.sample_weather(spec).await
    }
}

/// A failing stage fails the request, and the failure is not cached.
#[tokio::test]
async fn test_stage_failure_propagates() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let h = build(vec![tile(None)], PlannerConfig::default(), move |s| {
        Arc::new(BrokenConvert {
            inner: StubKernels::new(s),
            attempts: counter,
        })
    });
    h.storage.write("srtm/N50E007.tif_max_0.3", b"dem").await.unwrap();
    let request = box_request(Representation::GeoRaster);

    for _ in 0..2 {
        let err = h
            .composer
            .run_box_sample(&request, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::StageExecution { ref stage, .. } if stage == "convert.export_georeferenced"));
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

/// Cancelling before execution stops the request.
#[tokio::test]
async fn test_cancelled_request() {
    let h = harness_with_tile(PlannerConfig::default()).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h
        .composer
        .run_box_sample(&box_request(Representation::GeoRaster), cancel)
        .await
        .unwrap_err();
    assert_eq!(err, PlanError::Cancelled);
}

fn count_only(max_waypoints: usize) -> PlannerConfig {
    PlannerConfig {
        split: SplitPolicy {
            max_waypoints,
            partition_by: Vec::new(),
            max_buckets: 1,
        },
        ..PlannerConfig::default()
    }
}

/// A 5000-point irradiance route split at 3000 merges to the same table as
/// an unsplit run.
#[tokio::test]
async fn test_split_route_irradiance_matches_unsplit() {
    let mut request = RouteRequest::new(line_route(5000), &PlannerConfig::default());
    request.postprocess = RoutePostprocess::Irradiance(IrradianceParams::default());

    let split = harness_with_tile(count_only(3000)).await;
    let whole = harness_with_tile(count_only(10_000)).await;
    assert_eq!(split.composer.route_parts(&request.waypoints, None).len(), 2);
    assert_eq!(whole.composer.route_parts(&request.waypoints, None).len(), 1);

    let split_entry = split
        .composer
        .run_route_sample(&request, CancellationToken::new())
        .await
        .unwrap();
    let whole_entry = whole
        .composer
        .run_route_sample(&request, CancellationToken::new())
        .await
        .unwrap();

    let split_bytes = read(&split, &split_entry.location).await;
    assert_eq!(split_bytes, read(&whole, &whole_entry.location).await);
    let table = RouteTable::read_tsv(split_bytes.as_slice()).unwrap();
    assert_eq!(table.indices(), (0..5000).collect::<Vec<_>>());
}

/// An irradiance stage result from before the model cutoff is recomputed even
/// when only an inner stage of the graph holds it.
#[tokio::test]
async fn test_stale_inner_irradiance_is_recomputed() {
    let h = harness_with_tile(PlannerConfig::default()).await;
    let mut request = RouteRequest::new(line_route(3), h.composer.config());
    request.postprocess = RoutePostprocess::Irradiance(IrradianceParams::default());

    let plan = h.composer.plan_route_sample(&request).await.unwrap();
    let inner = plan
        .nodes()
        .iter()
        .find(|node| node.stage.name() == "route_irradiance")
        .and_then(|node| node.run_once.clone())
        .unwrap();

    let stale = RouteTable::new(
        request
            .waypoints
            .iter()
            .map(|wp| RouteRow::for_waypoint(wp).with_value("irradiance", -999.0))
            .collect(),
    );
    let mut contents = Vec::new();
    stale.write_tsv(&mut contents).unwrap();
    h.storage.write("out/stale.tsv", &contents).await.unwrap();
    h.store.insert_entry(
        inner,
        CacheEntry {
            location: "out/stale.tsv".to_string(),
            created_at: Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap(),
        },
    );

    let entry = h
        .composer
        .run_route_sample(&request, CancellationToken::new())
        .await
        .unwrap();
    let table = RouteTable::read_tsv(read(&h, &entry.location).await.as_slice()).unwrap();
    assert_eq!(table.indices(), vec![0, 1, 2]);
    assert!(table
        .rows
        .iter()
        .all(|row| row.values.get("irradiance") != Some(&-999.0)));
}

/// Integration over a time series produces a georeferenced raster once.
#[tokio::test]
async fn test_integrate_box() {
    let h = harness_with_tile(PlannerConfig::default()).await;
    let times = read_times_tsv(
        "timestr\tghi\tdhi\n2019-07-01_10:00:00\t800\t100\n2019-07-01_12:00:00\t900\t120\n"
            .as_bytes(),
    )
    .unwrap();
    let request = IntegrateRequest::new(
        BoundingBox::from_lat_lon([50.865, 7.119, 50.867, 7.121]).unwrap(),
        times,
    );

    let first = h
        .composer
        .run_integrate(&request, CancellationToken::new())
        .await
        .unwrap();
    assert!(first.location.ends_with(".geotiff"));

    let mut other_albedo = request.clone();
    other_albedo.albedo = 0.2;
    let second = h
        .composer
        .run_integrate(&other_albedo, CancellationToken::new())
        .await
        .unwrap();
    assert_ne!(first.location, second.location);
    assert_eq!(
        h.composer
            .run_integrate(&request, CancellationToken::new())
            .await
            .unwrap(),
        first
    );
}

fn timed(index: usize, day: u32, hour: u32) -> Waypoint {
    Waypoint::with_attributes(
        index,
        50.865 + index as f64 * 1.0e-4,
        7.119,
        WaypointAttributes {
            time: Some(Utc.with_ymd_and_hms(2019, 7, day, hour, 0, 0).unwrap()),
            ..Default::default()
        },
    )
    .unwrap()
}

/// A route over two days is split per day; each day's source is retrieved
/// once and the rows come back in route order.
#[tokio::test]
async fn test_weather_route_split_by_day() {
    let h = build(Vec::new(), PlannerConfig::default(), |s| {
        Arc::new(StubKernels::new(s))
    });
    let request = WeatherRouteRequest {
        product: WeatherProduct::Reanalysis,
        waypoints: vec![timed(0, 1, 10), timed(1, 1, 14), timed(2, 2, 9), timed(3, 2, 18)],
        variables: Vec::new(),
    };

    let entry = h
        .composer
        .run_weather_route(&request, CancellationToken::new())
        .await
        .unwrap();
    let table = RouteTable::read_tsv(read(&h, &entry.location).await.as_slice()).unwrap();
    assert_eq!(table.indices(), vec![0, 1, 2, 3]);
    assert!(table
        .rows
        .iter()
        .all(|row| row.values.contains_key("2m_temperature")));

    for day in ["2019-07-01", "2019-07-02"] {
        let source = WeatherSource {
            product: WeatherProduct::Reanalysis,
            region: terraplan_core::spatial::geohash(50.865, 7.119, 3),
            period: day.to_string(),
        };
        assert!(h.storage.exists(&source.output_path()).await.unwrap());
    }
}

/// A weather box retrieves its sources, then reuses them for other variables.
#[tokio::test]
async fn test_weather_box_reuses_sources() {
    let h = build(Vec::new(), PlannerConfig::default(), |s| {
        Arc::new(StubKernels::new(s))
    });
    let mut request = WeatherBoxRequest {
        product: WeatherProduct::Irradiance,
        region: BoundingBox::from_lat_lon([50.865, 7.119, 50.867, 7.121]).unwrap(),
        range: "2019-07-01_10:00:00/2019-07-01_12:00:00".parse().unwrap(),
        step: "20minutes".parse().unwrap(),
        variables: Vec::new(),
    };

    h.composer
        .run_weather_box(&request, CancellationToken::new())
        .await
        .unwrap();

    request.variables = vec!["GHI".to_string()];
    let plan = h.composer.plan_weather_box(&request).await.unwrap();
    assert_eq!(plan.count("weather_source"), 0);
    assert_eq!(plan.spine(), vec!["weather_sample"]);

    let entry = h
        .composer
        .run_weather_box(&request, CancellationToken::new())
        .await
        .unwrap();
    let value: serde_json::Value = serde_json::from_slice(&read(&h, &entry.location).await).unwrap();
    assert_eq!(value["times"].as_array().unwrap().len(), 7);
    assert_eq!(value["variables"], serde_json::json!(["GHI"]));
}
