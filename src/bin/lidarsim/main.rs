//! lidarsim CLI - inspect the device and run a demo LiDAR scan.

use anyhow::{bail, Context};
use parking_lot::RwLock;
use std::env;
use std::sync::Arc;
use std::time::Instant;

use lidarsim::device::{Device, Stream};
use lidarsim::graph::{
    connect, share, Field, GaussianNoiseAngularHitpointNode, Graph, NodeRef, RaysFromMat3x4Node,
    RaytraceNode,
};
use lidarsim::rt::RayTracingBackend;
use lidarsim::scene::Scene;
use lidarsim::util::{Affine3A, Axis, EngineConfig, Mat3x4f, Quat, Vec3};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Sensor height above the ground plane.
const SENSOR_HEIGHT: f32 = 2.0;

fn main() {
    let args: Vec<String> = env::args().collect();

    // Parse global flags
    let mut level = "info";
    let mut config_path: Option<&str> = None;
    let mut filtered_args: Vec<&str> = Vec::new();
    let mut it = args[1..].iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-v" | "--verbose" => level = "debug",
            "-vv" | "--trace" => level = "trace",
            "-q" | "--quiet" => level = "error",
            "--config" => match it.next() {
                Some(path) => config_path = Some(path.as_str()),
                None => {
                    eprintln!("Error: --config needs a path");
                    std::process::exit(1);
                }
            },
            _ => filtered_args.push(arg),
        }
    }
    let _trace_guard = init_tracing(level);

    if filtered_args.is_empty() {
        print_help();
        return;
    }

    let result = match filtered_args[0] {
        "info" | "i" => cmd_info(config_path),
        "scan" | "s" => {
            ScanArgs::parse(&filtered_args[1..]).and_then(|a| cmd_scan(config_path, &a))
        }
        "config" | "c" => cmd_config(config_path),
        "help" | "h" | "-h" | "--help" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            eprintln!();
            print_help();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Console output filtered by `RUST_LOG` (or the verbosity flags), plus a
/// Chrome trace in `trace.json` when built with `chrome-trace` and
/// `LIDARSIM_TRACE=1`.
#[cfg(feature = "chrome-trace")]
fn init_tracing(level: &str) -> Option<tracing_chrome::FlushGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let fmt = tracing_subscriber::fmt::layer().with_target(false);
    if env::var("LIDARSIM_TRACE").ok().as_deref() == Some("1") {
        let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
            .file("trace.json")
            .build();
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt)
            .with(chrome_layer)
            .init();
        return Some(guard);
    }
    tracing_subscriber::registry().with(filter).with(fmt).init();
    None
}

#[cfg(not(feature = "chrome-trace"))]
fn init_tracing(level: &str) -> Option<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let fmt = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry().with(filter).with(fmt).init();
    None
}

fn print_help() {
    println!("lidarsim - LiDAR point cloud simulation");
    println!();
    println!("USAGE:");
    println!("    lidarsim [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("COMMANDS:");
    println!("    i, info                       Show device and backend info");
    println!("    s, scan   [scan options]      Scan a demo scene and print hit statistics");
    println!("    c, config                     Print the effective configuration as JSON");
    println!("    h, help                       Show this help");
    println!();
    println!("SCAN OPTIONS:");
    println!("    --rays <N>       Rays per revolution (default 1024)");
    println!("    --noise <DEG>    Angular noise standard deviation in degrees (default 0)");
    println!("    --seed <N>       Noise seed (default: random)");
    println!();
    println!("OPTIONS:");
    println!("    -v, --verbose    Show debug output");
    println!("    -vv, --trace     Show trace output (very verbose)");
    println!("    -q, --quiet      Only show errors");
    println!("    --config <PATH>  JSON config file (overrides LIDARSIM_CONFIG)");
    println!();
    println!("ENVIRONMENT:");
    println!("    LIDARSIM_CONFIG  Path of a JSON config file");
    println!("    LIDARSIM_TRACE   Set to 1 to write trace.json (chrome-trace feature)");
    println!("    RUST_LOG         Overrides the log filter");
}

/// `--config` wins over `LIDARSIM_CONFIG`.
fn load_config(path: Option<&str>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path).with_context(|| format!("failed to load {}", path)),
        None => EngineConfig::from_env().context("failed to load configuration"),
    }
}

fn init_runtime(
    config_path: Option<&str>,
) -> anyhow::Result<(EngineConfig, Device, Arc<RayTracingBackend>)> {
    let config = load_config(config_path)?;
    let device = Device::init(&config.device).context("failed to initialize device")?;
    let backend =
        RayTracingBackend::init(&config.backend).context("failed to initialize ray tracing backend")?;
    Ok((config, device, backend))
}

fn cmd_info(config_path: Option<&str>) -> anyhow::Result<()> {
    let (_, device, backend) = init_runtime(config_path)?;

    println!(
        "lidarsim {} (built {})",
        env!("CARGO_PKG_VERSION"),
        env!("LIDARSIM_BUILD_TIMESTAMP")
    );
    println!();
    println!("Device:");
    println!("  Name:    {}", device.name());
    println!("  Ordinal: {}", device.ordinal());
    println!("  Lanes:   {}", device.lanes());
    match device.memory_limit() {
        Some(limit) => println!("  Memory:  {} bytes limit", limit),
        None => println!("  Memory:  unlimited"),
    }
    println!();
    let cfg = backend.config();
    println!("Backend:");
    println!("  Module:          {}", backend.module().code().name);
    println!("  Registers:       {}", cfg.max_register_count);
    println!("  Optimization:    {:?}", cfg.opt_level);
    println!("  Debug level:     {:?}", cfg.debug_level);
    println!("  Payload values:  {}", cfg.num_payload_values);
    println!("  Trace depth:     {}", cfg.max_trace_depth);
    println!("  Graph depth:     {}", cfg.max_traversable_graph_depth);
    Ok(())
}

fn cmd_config(config_path: Option<&str>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    println!("{}", config.to_json_string()?);
    Ok(())
}

#[derive(Debug)]
struct ScanArgs {
    rays: usize,
    noise_deg: f32,
    seed: Option<u64>,
}

impl ScanArgs {
    fn parse(args: &[&str]) -> anyhow::Result<Self> {
        let mut parsed = Self {
            rays: 1024,
            noise_deg: 0.0,
            seed: None,
        };
        let mut it = args.iter();
        while let Some(&arg) = it.next() {
            let mut value = || {
                it.next()
                    .copied()
                    .with_context(|| format!("missing value for {}", arg))
            };
            match arg {
                "--rays" | "-n" => parsed.rays = value()?.parse().context("invalid --rays")?,
                "--noise" => parsed.noise_deg = value()?.parse().context("invalid --noise")?,
                "--seed" => parsed.seed = Some(value()?.parse().context("invalid --seed")?),
                other => bail!("unknown scan option: {}", other),
            }
        }
        if parsed.rays == 0 {
            bail!("--rays must be at least 1");
        }
        Ok(parsed)
    }
}

/// One revolution of rays, 10 degrees below the horizon, from the sensor.
fn revolution(count: usize) -> Vec<Mat3x4f> {
    let pitch = -10f32.to_radians();
    (0..count)
        .map(|i| {
            let yaw = i as f32 / count as f32 * std::f32::consts::TAU;
            let dir = Vec3::new(yaw.cos() * pitch.cos(), yaw.sin() * pitch.cos(), pitch.sin());
            let rotation = Quat::from_rotation_arc(Vec3::Z, dir);
            Mat3x4f::from_affine(&Affine3A::from_rotation_translation(
                rotation,
                Vec3::new(0.0, 0.0, SENSOR_HEIGHT),
            ))
        })
        .collect()
}

fn demo_scene(device: &Device) -> anyhow::Result<Scene> {
    let mut scene = Scene::new(device);
    let ground = scene.add_mesh(Scene::ground_plane(device, 50.0, 0.0)?);
    let cube = scene.add_mesh(Scene::cube(device, 1.0)?);
    scene.add_entity(ground, Mat3x4f::IDENTITY)?;
    for (x, y) in [(6.0, 0.0), (-4.0, 4.0), (0.0, -8.0)] {
        scene.add_entity(cube, Mat3x4f::from_translation(Vec3::new(x, y, 1.0)))?;
    }
    Ok(scene)
}

fn cmd_scan(config_path: Option<&str>, args: &ScanArgs) -> anyhow::Result<()> {
    let (_, device, backend) = init_runtime(config_path)?;
    let stream = Stream::new(&device).context("failed to create stream")?;
    let scene = Arc::new(RwLock::new(demo_scene(&device)?));
    tracing::debug!(?args, entities = scene.read().entity_count(), "scan setup");

    let rays = share(RaysFromMat3x4Node::with_device(&device));
    rays.write().set_rays(&revolution(args.rays))?;
    let raytrace = share(RaytraceNode::new(Arc::clone(&scene), Arc::clone(&backend)));
    let mut noise =
        GaussianNoiseAngularHitpointNode::with_device(&device, 0.0, args.noise_deg.to_radians(), Axis::Z);
    if let Some(seed) = args.seed {
        noise = noise.with_seed(seed);
    }
    let noise = share(noise);

    let rays: NodeRef = rays;
    let raytrace: NodeRef = raytrace;
    let noise: NodeRef = noise;
    connect(&rays, &raytrace)?;
    connect(&raytrace, &noise)?;

    let start = Instant::now();
    let mut graph = Graph::new(&noise)?;
    let xyz = graph.field_data(&noise, Field::Xyz, &stream)?;
    let elapsed = start.elapsed();

    let positions: Vec<Vec3> = xyz.to_vec()?;
    let distances: Vec<f32> = graph.field_data(&noise, Field::Distance, &stream)?.to_vec()?;
    let hits: Vec<i32> = graph.field_data(&noise, Field::IsHit, &stream)?.to_vec()?;

    let hit_distances: Vec<f32> = distances
        .iter()
        .zip(&hits)
        .filter(|(_, h)| **h != 0)
        .map(|(&d, _)| d)
        .collect();
    let count = hit_distances.len();

    println!("Scan:");
    println!("  Rays:      {}", positions.len());
    println!("  Hits:      {} ({:.1}%)", count, 100.0 * count as f64 / positions.len() as f64);
    if count > 0 {
        let min = hit_distances.iter().copied().fold(f32::INFINITY, f32::min);
        let max = hit_distances.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mean = hit_distances.iter().sum::<f32>() / count as f32;
        println!("  Distance:  min {:.3}  mean {:.3}  max {:.3}", min, mean, max);
        let centroid = positions
            .iter()
            .zip(&hits)
            .filter(|(_, h)| **h != 0)
            .fold(Vec3::ZERO, |acc, (p, _)| acc + *p)
            / count as f32;
        println!("  Centroid:  ({:.3}, {:.3}, {:.3})", centroid.x, centroid.y, centroid.z);
    }
    println!("  Time:      {:.2?}", elapsed);

    RayTracingBackend::shutdown();
    Ok(())
}
