//! Numeric kernels invoked by graph stages.
//!
//! Kernels are pure functions over storage paths: each reads its inputs,
//! writes one output file and returns the output's storage path. The real
//! rasterization, irradiance and rendering code lives outside this crate;
//! [`StubKernels`] provides deterministic placeholder outputs so graphs can
//! run end to end against a local directory.

use crate::storage::{LocalStorage, StorageResolver};
use async_trait::async_trait;
use serde_json::json;
use terraplan_core::{
    fingerprint, BoundingBox, CallArgs, ConversionStage, Crs, FetchSpec, MergeKind, PlanError,
    Postprocess, RouteRow, RouteTable, SampleParams, Waypoint, WeatherSampleSpec, WeatherSource,
};
use tracing::debug;

#[async_trait]
pub trait Kernels: Send + Sync {
    /// Download a remote unit and derive its statistics raster.
    async fn fetch_source(&self, spec: &FetchSpec) -> Result<String, PlanError>;

    /// Rasterize `region` on a `mesh` grid; produces a raw sample.
    async fn sample_box(
        &self,
        region: &BoundingBox,
        mesh: Crs,
        params: &SampleParams,
    ) -> Result<String, PlanError>;

    /// Read raster values at route points; produces a route table.
    async fn sample_points(
        &self,
        region: &BoundingBox,
        params: &SampleParams,
        waypoints: &[Waypoint],
    ) -> Result<String, PlanError>;

    async fn convert(&self, stage: ConversionStage, input: &str) -> Result<String, PlanError>;

    async fn postprocess(&self, step: &Postprocess, input: &str) -> Result<String, PlanError>;

    async fn merge(&self, kind: MergeKind, inputs: &[String]) -> Result<String, PlanError>;

    /// Retrieve one weather source into its storage path.
    async fn fetch_weather(&self, source: &WeatherSource) -> Result<String, PlanError>;

    /// Read weather values out of already retrieved sources.
    async fn sample_weather(&self, spec: &WeatherSampleSpec) -> Result<String, PlanError>;
}

/// Deterministic placeholder kernels writing small text files.
///
/// Outputs are named after the fingerprint of what produced them and their
/// contents depend only on the contents of their inputs, so two routes to the
/// same result yield identical bytes.
#[derive(Debug, Clone)]
pub struct StubKernels {
    storage: LocalStorage,
}

impl StubKernels {
    pub fn new(storage: LocalStorage) -> Self {
        Self { storage }
    }

    async fn read(&self, path: &str, stage: &str) -> Result<Vec<u8>, PlanError> {
        let local = self.storage.resolve_local(path).await?;
        tokio::fs::read(local)
            .await
            .map_err(|e| PlanError::stage(stage, e))
    }

    async fn emit(
        &self,
        op: &str,
        args: CallArgs,
        extension: &str,
        contents: &[u8],
    ) -> Result<String, PlanError> {
        let path = format!("out/{}.{}", fingerprint(op, &args)?, extension);
        self.storage.write(&path, contents).await?;
        debug!(op, path = %path, "Kernel output written");
        Ok(path)
    }

    fn content_key(bytes: &[u8]) -> Result<String, PlanError> {
        let args = CallArgs::new().arg("bytes", String::from_utf8_lossy(bytes));
        Ok(fingerprint("content", &args)?.to_string())
    }
}

fn stub_value(lat: f64, lon: f64) -> f64 {
    ((lat * 1.0e4).round() + (lon * 1.0e4).round()) / 100.0
}

#[async_trait]
impl Kernels for StubKernels {
    async fn fetch_source(&self, spec: &FetchSpec) -> Result<String, PlanError> {
        let contents = json!({
            "unit": spec.unit,
            "url": spec.url,
            "stat": spec.params.stat.name(),
            "resolution": spec.params.resolution,
            "from_points": spec.compute_from_points,
        });
        self.storage
            .write(&spec.output_path, contents.to_string().as_bytes())
            .await?;
        Ok(spec.output_path.clone())
    }

    async fn sample_box(
        &self,
        region: &BoundingBox,
        mesh: Crs,
        params: &SampleParams,
    ) -> Result<String, PlanError> {
        let args = CallArgs::new()
            .arg("box", region.as_array())
            .arg("mesh", mesh.epsg())
            .arg("params", params);
        let contents = json!({
            "box": region.as_array(),
            "epsg": mesh.epsg(),
            "stat": params.stat.name(),
            "step": params.step,
        });
        self.emit("sample_box", args, "pickle", contents.to_string().as_bytes())
            .await
    }

    async fn sample_points(
        &self,
        region: &BoundingBox,
        params: &SampleParams,
        waypoints: &[Waypoint],
    ) -> Result<String, PlanError> {
        let table = RouteTable::new(
            waypoints
                .iter()
                .map(|wp| RouteRow::for_waypoint(wp).with_value("value", stub_value(wp.lat, wp.lon)))
                .collect(),
        );
        let mut contents = Vec::new();
        table.write_tsv(&mut contents)?;

        let args = CallArgs::new()
            .arg("box", region.as_array())
            .arg("params", params)
            .arg("route", waypoints);
        self.emit("sample_points", args, "tsv", &contents).await
    }

    async fn convert(&self, stage: ConversionStage, input: &str) -> Result<String, PlanError> {
        let input_key = Self::content_key(&self.read(input, stage.operation_id()).await?)?;
        let contents = format!("{}({})", stage.operation_id(), input_key);
        let args = CallArgs::new().arg("input", &input_key);
        self.emit(
            stage.operation_id(),
            args,
            stage.output().name(),
            contents.as_bytes(),
        )
        .await
    }

    async fn postprocess(&self, step: &Postprocess, input: &str) -> Result<String, PlanError> {
        let input_bytes = self.read(input, step.operation_id()).await?;
        let input_key = Self::content_key(&input_bytes)?;
        let args = CallArgs::new().arg("input", &input_key).arg("step", step);

        match step {
            Postprocess::RouteIrradiance {
                waypoints, params, ..
            } => {
                let table = RouteTable::new(
                    waypoints
                        .iter()
                        .map(|wp| {
                            let ghi = wp.attributes.ghi.unwrap_or(params.ghi_default);
                            let dhi = wp.attributes.dhi.unwrap_or(params.dhi_default);
                            RouteRow::for_waypoint(wp)
                                .with_value("ghi", ghi)
                                .with_value("dhi", dhi)
                                .with_value("irradiance", ghi - dhi * params.albedo)
                        })
                        .collect(),
                );
                let mut contents = Vec::new();
                table.write_tsv(&mut contents)?;
                self.emit(step.operation_id(), args, "tsv", &contents).await
            }
            Postprocess::Filter(filter) => {
                let contents = format!(
                    "filter:{}:{}({})",
                    filter.filter_type, filter.size, input_key
                );
                self.emit(step.operation_id(), args, "pickle", contents.as_bytes())
                    .await
            }
            Postprocess::MapToBox { region } => {
                let contents = json!({
                    "box": region.as_array(),
                    "raster": String::from_utf8_lossy(&input_bytes),
                });
                self.emit(step.operation_id(), args, "json", contents.to_string().as_bytes())
                    .await
            }
            Postprocess::IntegrateIrradiance {
                times,
                albedo,
                nsky,
                ..
            } => {
                let total: f64 = times.iter().map(|t| t.ghi - t.dhi * albedo).sum();
                let contents = json!({
                    "raster": input_key,
                    "steps": times.len(),
                    "nsky": nsky,
                    "total": total,
                });
                self.emit(step.operation_id(), args, "pickle", contents.to_string().as_bytes())
                    .await
            }
        }
    }

    async fn merge(&self, kind: MergeKind, inputs: &[String]) -> Result<String, PlanError> {
        let mut parts = Vec::with_capacity(inputs.len());
        for input in inputs {
            parts.push(self.read(input, "merge").await?);
        }
        let part_keys = parts
            .iter()
            .map(|p| Self::content_key(p))
            .collect::<Result<Vec<_>, _>>()?;
        let args = CallArgs::new().arg("kind", kind).arg("inputs", &part_keys);

        match kind {
            MergeKind::RouteTable => {
                let tables = parts
                    .iter()
                    .map(|bytes| RouteTable::read_tsv(bytes.as_slice()))
                    .collect::<Result<Vec<_>, _>>()?;
                let merged = RouteTable::merge(tables)?;
                let mut contents = Vec::new();
                merged.write_tsv(&mut contents)?;
                self.emit("merge.route_table", args, "tsv", &contents).await
            }
            MergeKind::CollectRasters => {
                // Already-merged parts are arrays and are spliced in place.
                let mut items: Vec<serde_json::Value> = Vec::new();
                for bytes in &parts {
                    match serde_json::from_slice(bytes) {
                        Ok(serde_json::Value::Array(nested)) => items.extend(nested),
                        Ok(value) => items.push(value),
                        Err(_) => items.push(serde_json::Value::String(
                            String::from_utf8_lossy(bytes).into_owned(),
                        )),
                    }
                }
                let contents = serde_json::Value::Array(items).to_string();
                self.emit("merge.collect_rasters", args, "json", contents.as_bytes())
                    .await
            }
        }
    }

    async fn fetch_weather(&self, source: &WeatherSource) -> Result<String, PlanError> {
        let path = source.output_path();
        let contents = json!({
            "product": source.product.name(),
            "region": source.region,
            "period": source.period,
        });
        self.storage.write(&path, contents.to_string().as_bytes()).await?;
        Ok(path)
    }

    async fn sample_weather(&self, spec: &WeatherSampleSpec) -> Result<String, PlanError> {
        let args = CallArgs::new().arg("spec", spec);
        match spec {
            WeatherSampleSpec::Box {
                product,
                region,
                range,
                step,
                variables,
                sources,
            } => {
                for source in sources {
                    self.read(source, "weather_sample").await?;
                }
                let mut times = Vec::new();
                let mut at = range.start;
                while at <= range.end {
                    times.push(at.format(terraplan_core::TIME_FORMAT).to_string());
                    at += step.as_duration();
                }
                let contents = json!({
                    "product": product.name(),
                    "box": region.as_array(),
                    "times": times,
                    "variables": variables,
                });
                self.emit("weather_sample.box", args, "json", contents.to_string().as_bytes())
                    .await
            }
            WeatherSampleSpec::Route {
                waypoints,
                variables,
                sources,
                ..
            } => {
                for source in sources {
                    self.read(source, "weather_sample").await?;
                }
                let table = RouteTable::new(
                    waypoints
                        .iter()
                        .map(|wp| {
                            variables.iter().fold(RouteRow::for_waypoint(wp), |row, name| {
                                row.with_value(name, stub_value(wp.lat, wp.lon))
                            })
                        })
                        .collect(),
                );
                let mut contents = Vec::new();
                table.write_tsv(&mut contents)?;
                self.emit("weather_sample.route", args, "tsv", &contents).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use terraplan_core::{TimeRange, TimeStep, WeatherProduct};

    #[tokio::test]
    async fn conversion_output_depends_only_on_input_content() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage.write("a.tif", b"raster").await.unwrap();
        storage.write("b.tif", b"raster").await.unwrap();
        let kernels = StubKernels::new(storage.clone());

        let from_a = kernels.convert(ConversionStage::HillshadeRender, "a.tif").await.unwrap();
        let from_b = kernels.convert(ConversionStage::HillshadeRender, "b.tif").await.unwrap();

        assert_eq!(from_a, from_b);
        assert!(from_a.ends_with(".pnghillshade"));
        assert!(storage.exists(&from_a).await.unwrap());
    }

    #[tokio::test]
    async fn route_table_merge_restores_order() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let kernels = StubKernels::new(storage.clone());
        let region = BoundingBox::new(50.0, 7.0, 51.0, 8.0, Crs::Wgs84);
        let wps: Vec<Waypoint> = (0..4)
            .map(|i| Waypoint::new(i, 50.1 + i as f64 * 0.01, 7.1).unwrap())
            .collect();
        let params = SampleParams::default();

        let second = kernels
            .sample_points(&region, &params, &wps[2..])
            .await
            .unwrap();
        let first = kernels
            .sample_points(&region, &params, &wps[..2])
            .await
            .unwrap();
        let merged = kernels
            .merge(MergeKind::RouteTable, &[second, first])
            .await
            .unwrap();

        let bytes = std::fs::read(storage.resolve_local(&merged).await.unwrap()).unwrap();
        let table = RouteTable::read_tsv(bytes.as_slice()).unwrap();
        assert_eq!(table.indices(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn weather_sample_reads_its_sources() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let kernels = StubKernels::new(storage.clone());
        let source = WeatherSource {
            product: WeatherProduct::Reanalysis,
            region: "u1h".to_string(),
            period: "2019-07-01".to_string(),
        };
        let range: TimeRange = "2019-07-01_10:00:00/2019-07-01_11:00:00".parse().unwrap();
        let spec = WeatherSampleSpec::Box {
            product: WeatherProduct::Reanalysis,
            region: BoundingBox::new(50.0, 7.0, 50.1, 7.1, Crs::Wgs84),
            range,
            step: "20minutes".parse::<TimeStep>().unwrap(),
            variables: WeatherProduct::Reanalysis.default_variables(),
            sources: vec![source.output_path()],
        };

        assert!(kernels.sample_weather(&spec).await.is_err());

        kernels.fetch_weather(&source).await.unwrap();
        let out = kernels.sample_weather(&spec).await.unwrap();
        let bytes = std::fs::read(storage.resolve_local(&out).await.unwrap()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["times"].as_array().unwrap().len(), 4);
    }
}
