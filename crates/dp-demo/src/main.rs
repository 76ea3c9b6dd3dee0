//! `dp-demo`: a runnable two-rank offload session exercising the host API
//! end to end (co-launched bootstrap, a committed scene, a blocking render,
//! a framebuffer map and a clean shutdown) analogous to what `oxidized`
//! wires up for the editor — CLI parsing via `clap`, a non-blocking file
//! appender for `tracing`, then straight into the real workload.

use anyhow::{Context, Result};
use clap::Parser;
use dp_codec::{CompositeMode, DataType, FbChannel, FbChannels, FrameEvent, ObjectKind, ParamValue};
use dp_dispatch::{DispatchConfig, Dispatcher, SyntheticTileRenderer};
use dp_fabric::ThreadFabric;
use dp_host::{Device, OffloadError};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

/// CLI arguments for the demo binary.
#[derive(Parser, Debug)]
#[command(name = "dp-demo", version, about = "Distributed offload core demo")]
struct Args {
    /// Number of worker ranks to co-launch alongside the host.
    #[arg(long, default_value_t = 2)]
    workers: u32,

    /// Framebuffer width and height in pixels.
    #[arg(long, default_value_t = 128)]
    size: u32,

    /// Tile edge length.
    #[arg(long, default_value_t = 64)]
    tile_size: u32,

    /// Optional offload.toml path (overrides discovery).
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Use the dynamic work-stealing balancer instead of static round-robin.
    #[arg(long)]
    dynamic: bool,
}

fn init_logging() -> Option<WorkerGuard> {
    let file_appender = tracing_appender::rolling::never(".", "dp-demo.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let filter = std::env::var("DP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let result = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(non_blocking)
        .try_init();
    if let Err(err) = result {
        eprintln!("tracing already initialized: {err}");
        return None;
    }
    Some(guard)
}

fn spawn_worker(fabric: Arc<ThreadFabric>, config: DispatchConfig) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
            .build()
            .expect("failed to build worker tile-pool runtime");
        let dispatcher = Dispatcher::new(fabric, Arc::new(SyntheticTileRenderer), config, runtime.handle().clone());
        if let Err(err) = dispatcher.run() {
            warn!(target: "demo", %err, "worker dispatcher exited");
        }
    })
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging();

    let mut config = dp_host::config::load_from(args.config.clone());
    config.apply_env();
    if args.dynamic {
        config.file.dynamic_load_balancer = true;
    }
    info!(target: "demo", workers = args.workers, size = args.size, "starting co-launched demo session");

    let group = ThreadFabric::group(args.workers + 1);
    let mut ranks = group.into_iter();
    let host_fabric = ranks.next().context("co-launched group must include the host rank")?;
    let worker_fabrics: Vec<Arc<ThreadFabric>> = ranks.map(Arc::new).collect();

    let dispatch_config = config.dispatch_config();
    let workers: Vec<_> = worker_fabrics
        .iter()
        .cloned()
        .map(|fabric| spawn_worker(fabric, dispatch_config.clone()))
        .collect();

    let device = Device::new(host_fabric).context("device initialization failed")?;
    device.set_status_callback(|message| info!(target: "demo.status", "{message}"));
    device.set_error_callback(|err: &OffloadError| tracing::error!(target: "demo.error", %err, "offload error"));

    let renderer = device.new_renderer()?;
    device.commit(renderer)?;
    let camera = device.new_camera()?;
    device.set_param(camera, "aspect", ParamValue::Float(1.0))?;
    device.commit(camera)?;
    let world = device.new_world()?;
    device.commit(world)?;

    let fb = device.new_framebuffer(
        args.size,
        args.size,
        args.tile_size,
        CompositeMode::WriteOnce,
        FbChannels::COLOR | FbChannels::VARIANCE,
    )?;
    device.commit(fb)?;

    let shared = device.new_shared_data(
        dp_codec::DataArraySpec {
            element_type: DataType::Float,
            extents: (4, 1, 1),
            byte_strides: (0, 0, 0),
        },
        vec![0u8; 16],
    )?;
    device.set_param(world, "aux_data", ParamValue::Object(ObjectKind::Data, shared))?;
    device.commit(world)?;

    let future = device.render_frame(fb, renderer, camera, world)?;
    device.wait(future, FrameEvent::FrameFinished)?;

    let progress = device.get_progress(future)?;
    let variance = device.get_variance(fb)?;
    let pixels = device.map(fb, FbChannel::Color)?;
    info!(
        target: "demo",
        progress,
        variance,
        pixel_count = pixels.len(),
        "render finished"
    );
    device.unmap(fb)?;

    device.release(shared)?;
    device.release(world)?;
    device.release(camera)?;
    device.release(renderer)?;
    device.release(fb)?;
    device.release(future)?;

    device.shutdown()?;
    for worker in workers {
        worker.join().expect("worker thread panicked");
    }

    println!("render finished: progress={progress:.2} variance={variance:.6} pixels={}", pixels.len());
    Ok(())
}
