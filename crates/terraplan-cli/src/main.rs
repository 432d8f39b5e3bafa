//! terraplan - plan and run geospatial sampling requests

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use terraplan_cli::input::{
    parse_box, parse_filter, parse_margin, parse_variables, read_catalog, read_route, read_times,
    ClusterSummary,
};
use terraplan_cli::runtime;
use terraplan_core::{
    cluster_route, BoundingBox, FilterSpec, IrradianceParams, MarginBox, MeshCrs,
    Representation, SampleParams, Statistic, TimeRange, TimeStep, WeatherProduct,
};
use terraplan_engine::{
    BoxRequest, Composer, Config, IntegrateRequest, PointQueryRequest, RoutePostprocess,
    RouteRequest, WeatherBoxRequest, WeatherRouteRequest,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Plan and run raster sampling over boxes and routes
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Source catalog (JSON array of units)
    #[arg(long, global = true, default_value = "catalog.json")]
    catalog: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct SampleArgs {
    /// Regular expression selecting datasets
    #[arg(long, default_value = ".*")]
    data_re: String,

    #[arg(long, default_value = "max")]
    stat: Statistic,

    /// Point-cloud resolution
    #[arg(long, default_value_t = 0.3)]
    resolution: f64,

    /// Mesh step in meters
    #[arg(long, default_value_t = 1.0)]
    step: f64,

    /// `utm` or an EPSG code
    #[arg(long, default_value = "utm")]
    mesh: MeshCrs,
}

impl From<SampleArgs> for SampleParams {
    fn from(args: SampleArgs) -> Self {
        SampleParams {
            data_re: args.data_re,
            stat: args.stat,
            resolution: args.resolution,
            step: args.step,
            mesh: args.mesh,
        }
    }
}

#[derive(Args, Debug)]
struct BoxArgs {
    /// lat_min,lon_min,lat_max,lon_max
    #[arg(long = "box", value_parser = parse_box, allow_hyphen_values = true)]
    region: BoundingBox,

    #[arg(long, default_value = "geotiff")]
    output_type: Representation,

    #[command(flatten)]
    sample: SampleArgs,
}

impl From<BoxArgs> for BoxRequest {
    fn from(args: BoxArgs) -> Self {
        BoxRequest {
            region: args.region,
            params: args.sample.into(),
            target: args.output_type,
        }
    }
}

#[derive(Args, Debug)]
struct RouteArgs {
    /// Tab-separated route with latitude and longitude columns
    #[arg(long)]
    route: PathBuf,

    /// south,west,north,east offsets around each point, meters
    #[arg(long, value_parser = parse_margin, allow_hyphen_values = true)]
    margin: Option<MarginBox>,

    /// Bound on cluster growth in margin widths
    #[arg(long)]
    multiplier: Option<f64>,

    #[arg(long, default_value = "geotiff")]
    output_type: Representation,

    /// Compute irradiance at every waypoint instead of rendering rasters
    #[arg(long, conflicts_with = "filter")]
    irradiance: bool,

    /// Filter raw rasters before rendering, as type:size
    #[arg(long, value_parser = parse_filter)]
    filter: Option<FilterSpec>,

    #[command(flatten)]
    sample: SampleArgs,
}

impl RouteArgs {
    fn into_request(self, composer: &Composer) -> Result<RouteRequest> {
        let mut request = RouteRequest::new(read_route(&self.route)?, composer.config());
        if let Some(margin) = self.margin {
            request.margin = margin;
        }
        if let Some(multiplier) = self.multiplier {
            request.multiplier = multiplier;
        }
        request.params = self.sample.into();
        request.target = self.output_type;
        request.postprocess = match (self.irradiance, self.filter) {
            (true, _) => RoutePostprocess::Irradiance(IrradianceParams::default()),
            (false, Some(filter)) => RoutePostprocess::Filter(filter),
            (false, None) => RoutePostprocess::None,
        };
        Ok(request)
    }
}

#[derive(Args, Debug)]
struct IntegrateArgs {
    #[command(flatten)]
    region: BoxArgs,

    /// Tab-separated time series with timestr, ghi and dhi columns
    #[arg(long)]
    times: PathBuf,

    #[arg(long, default_value_t = 0.5)]
    albedo: f64,

    /// Sky discretization for diffuse irradiance
    #[arg(long, default_value_t = 10)]
    nsky: u32,
}

impl IntegrateArgs {
    fn into_request(self) -> Result<IntegrateRequest> {
        let times = read_times(&self.times)?;
        let base: BoxRequest = self.region.into();
        Ok(IntegrateRequest {
            region: base.region,
            params: base.params,
            times,
            albedo: self.albedo,
            nsky: self.nsky,
            target: base.target,
        })
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Group route points into sampling clusters
    Cluster {
        #[arg(long)]
        route: PathBuf,
        #[arg(long, value_parser = parse_margin, allow_hyphen_values = true, default_value = "-50,-50,50,50")]
        margin: MarginBox,
        #[arg(long, default_value_t = 3.0)]
        multiplier: f64,
    },
    /// Print the task graph of a box request
    PlanBox(BoxArgs),
    /// Print the task graph of a route request
    PlanRoute(RouteArgs),
    /// Sample a box
    SampleBox(BoxArgs),
    /// Sample rasters along a route
    SampleRoute(RouteArgs),
    /// Read raster values at route points
    QueryPoints {
        #[arg(long)]
        route: PathBuf,
        #[command(flatten)]
        sample: SampleArgs,
    },
    /// Integrate irradiance over a time series on a box
    Integrate(IntegrateArgs),
    /// Weather time series over a box
    WeatherBox {
        /// irradiance or reanalysis
        #[arg(long)]
        product: WeatherProduct,
        /// lat_min,lon_min,lat_max,lon_max
        #[arg(long = "box", value_parser = parse_box, allow_hyphen_values = true)]
        region: BoundingBox,
        /// start/end as %Y-%m-%d_%H:%M:%S
        #[arg(long)]
        time_range: TimeRange,
        #[arg(long, default_value = "20minutes")]
        time_step: TimeStep,
        /// Comma-separated variables
        #[arg(long, default_value = "")]
        what: String,
    },
    /// Weather values at each route point's time
    WeatherRoute {
        #[arg(long)]
        product: WeatherProduct,
        #[arg(long)]
        route: PathBuf,
        #[arg(long, default_value = "")]
        what: String,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Cancel in-flight work on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("terraplan_engine=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    if let Command::Cluster {
        route,
        margin,
        multiplier,
    } = &cli.command
    {
        let clusters = cluster_route(&read_route(route)?, margin, *multiplier)?;
        let summary: Vec<ClusterSummary> = clusters.iter().map(ClusterSummary::from).collect();
        return print_json(&summary);
    }

    let config = Config::from_env();
    let catalog = Arc::new(read_catalog(&cli.catalog)?);
    let shutdown = CancellationToken::new();
    let composer = runtime::composer(&config, catalog, shutdown.clone()).await?;

    let result = run(cli.command, &composer).await;
    shutdown.cancel();
    result
}

async fn run(command: Command, composer: &Composer) -> Result<()> {
    match command {
        Command::Cluster { .. } => Ok(()),
        Command::PlanBox(args) => {
            let graph = composer.plan_box_sample(&args.into()).await?;
            print_json(&graph)
        }
        Command::PlanRoute(args) => {
            let request = args.into_request(composer)?;
            let graph = composer.plan_route_sample(&request).await?;
            print_json(&graph)
        }
        Command::SampleBox(args) => {
            let entry = composer
                .run_box_sample(&args.into(), cancel_on_interrupt())
                .await?;
            print_json(&entry)
        }
        Command::SampleRoute(args) => {
            let request = args.into_request(composer)?;
            let entry = composer
                .run_route_sample(&request, cancel_on_interrupt())
                .await?;
            print_json(&entry)
        }
        Command::QueryPoints { route, sample } => {
            let request = PointQueryRequest {
                waypoints: read_route(&route)?,
                params: sample.into(),
            };
            let entry = composer
                .run_route_query_at_points(&request, cancel_on_interrupt())
                .await?;
            print_json(&entry)
        }
        Command::Integrate(args) => {
            let entry = composer
                .run_integrate(&args.into_request()?, cancel_on_interrupt())
                .await?;
            print_json(&entry)
        }
        Command::WeatherBox {
            product,
            region,
            time_range,
            time_step,
            what,
        } => {
            let request = WeatherBoxRequest {
                product,
                region,
                range: time_range,
                step: time_step,
                variables: parse_variables(&what),
            };
            let entry = composer
                .run_weather_box(&request, cancel_on_interrupt())
                .await?;
            print_json(&entry)
        }
        Command::WeatherRoute {
            product,
            route,
            what,
        } => {
            let request = WeatherRouteRequest {
                product,
                waypoints: read_route(&route)?,
                variables: parse_variables(&what),
            };
            let entry = composer
                .run_weather_route(&request, cancel_on_interrupt())
                .await?;
            print_json(&entry)
        }
    }
}
