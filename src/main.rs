use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use load_stress::config::{LoadConfig, Modulation};
use load_stress::controller::{LoadKind, LoadRequest, LoadTestController};
use load_stress::server::{self, AppState};
use load_stress::storage::{self, StorageTest};
use load_stress::telemetry::TelemetrySampler;
use load_stress::CancellationToken;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "load-stress", version, about = "CPU, GPU and VRAM load generator")]
struct Cli {
    /// -v info, -vv debug (RUST_LOG overrides)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply one or more loads until the duration elapses or Ctrl-C
    Run(RunArgs),
    /// Serve the HTTP control surface
    Serve {
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
    },
    /// Print CPU, device and telemetry information
    Info,
    /// Copy/verify test against mounted storage
    Storage(StorageArgs),
}

#[derive(Args)]
struct RunArgs {
    /// CPU load percentage
    #[arg(long)]
    cpu: Option<f64>,
    /// GPU compute load percentage
    #[arg(long)]
    gpu_compute: Option<f64>,
    /// GPU render load percentage
    #[arg(long)]
    gpu_render: Option<f64>,
    /// Compute and render on each device
    #[arg(long)]
    gpu_combined: Option<f64>,
    /// Share of device memory to hold
    #[arg(long)]
    vram: Option<f64>,
    /// Extra requests as KIND:PERCENT, e.g. `gpu_vram:30`
    #[arg(long = "load", value_parser = parse_load)]
    loads: Vec<(LoadKind, f64)>,
    /// Device ids for GPU loads; empty means every device
    #[arg(long, value_delimiter = ',')]
    devices: Vec<u32>,
    /// Seconds to run; 0 runs until Ctrl-C or the window is closed
    #[arg(long, default_value_t = 0)]
    duration: u64,
    /// Double the CPU idle and poll pauses
    #[arg(long)]
    modulate: bool,
    /// Native CPU helper taking the percentage as its only argument
    #[arg(long)]
    helper: Option<PathBuf>,
    #[arg(long)]
    cpu_units: Option<usize>,
    /// Number of host-emulated devices
    #[arg(long)]
    host_devices: Option<u32>,
}

#[derive(Args)]
struct StorageArgs {
    /// Mountpoints to test; discovered from lsblk when empty
    #[arg(long = "target")]
    targets: Vec<PathBuf>,
    /// Seconds per target
    #[arg(long, default_value_t = 300)]
    duration: u64,
    /// Only list storage and USB devices
    #[arg(long)]
    discover: bool,
}

fn parse_load(s: &str) -> Result<(LoadKind, f64), String> {
    let (kind, pct) = s
        .split_once(':')
        .ok_or_else(|| format!("expected KIND:PERCENT, got `{s}`"))?;
    let pct = pct
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("bad percentage `{pct}`: {e}"))?;
    Ok((kind.parse()?, pct))
}

impl RunArgs {
    fn requests(&self) -> Vec<LoadRequest> {
        let flags = [
            (LoadKind::Cpu, self.cpu),
            (LoadKind::GpuCompute, self.gpu_compute),
            (LoadKind::GpuRender, self.gpu_render),
            (LoadKind::GpuCombined, self.gpu_combined),
            (LoadKind::GpuVram, self.vram),
        ];
        flags
            .into_iter()
            .filter_map(|(kind, pct)| pct.map(|p| (kind, p)))
            .chain(self.loads.iter().copied())
            .map(|(kind, pct)| {
                let ids = if kind.uses_devices() { self.devices.clone() } else { Vec::new() };
                LoadRequest::new(kind, pct, ids)
            })
            .collect()
    }

    fn apply(&self, config: &mut LoadConfig) {
        if self.modulate {
            config.cpu.modulation = Modulation::Modulated;
        }
        if let Some(helper) = &self.helper {
            config.cpu.helper = Some(helper.clone());
        }
        if let Some(units) = self.cpu_units {
            config.cpu.units = Some(units);
        }
        if let Some(n) = self.host_devices {
            config.host_devices = n;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => LoadConfig::load(path)?,
        None => LoadConfig::default(),
    };

    match cli.command {
        Command::Run(args) => {
            args.apply(&mut config);
            run(config, &args).await
        }
        Command::Serve { bind } => {
            let controller = LoadTestController::with_host_devices(config);
            let state = tokio::task::spawn_blocking(move || AppState::new(controller)).await?;
            server::serve(state, &bind)
                .await
                .with_context(|| format!("serving on {bind}"))
        }
        Command::Info => info_cmd(config).await,
        Command::Storage(args) => storage_cmd(args).await,
    }
}

async fn run(config: LoadConfig, args: &RunArgs) -> Result<()> {
    let requests = args.requests();
    if requests.is_empty() {
        bail!("nothing to run: pass --cpu, --gpu-compute, --gpu-render, --gpu-combined, --vram or --load");
    }
    let telemetry_every = config.telemetry.interval;
    let gpu_command = config.telemetry.gpu_query_command.clone();
    let controller = LoadTestController::with_host_devices(config);

    for r in &requests {
        println!("Starting {} load at {}", r.kind, r.percentage);
    }
    let run = controller.start_plan(&requests)?;
    println!("Run {} started with {} unit(s). Press Ctrl-C to stop.", run.id(), run.units());

    let mut sampler = tokio::task::spawn_blocking(move || TelemetrySampler::new(gpu_command)).await?;
    let deadline = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));
    let mut poll = tokio::time::interval(Duration::from_millis(200));
    let mut report = tokio::time::interval(telemetry_every);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res.context("listening for Ctrl-C")?;
                println!("Interrupted; stopping load.");
                break;
            }
            _ = poll.tick() => {
                if run.token().is_set() {
                    info!("Run {} was cancelled from a render window", run.id());
                    break;
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    break;
                }
            }
            _ = report.tick() => {
                let snapshot = tokio::task::block_in_place(|| sampler.snapshot());
                for line in snapshot.lines() {
                    println!("{line}");
                }
            }
        }
    }

    let summary = tokio::task::block_in_place(|| controller.stop_run(run));
    println!(
        "Run {} stopped after {:.1}s ({} unit(s)).",
        summary.id,
        summary.elapsed_ms as f64 / 1000.0,
        summary.units
    );
    Ok(())
}

async fn info_cmd(config: LoadConfig) -> Result<()> {
    let gpu_command = config.telemetry.gpu_query_command.clone();
    let controller = LoadTestController::with_host_devices(config);
    let snapshot = tokio::task::spawn_blocking(move || TelemetrySampler::new(gpu_command).snapshot()).await?;

    println!("CPU: {} ({} logical cores)", snapshot.cpu_model, num_cpus::get());
    for id in controller.devices().ids() {
        let Some(dev) = controller.devices().get(id) else {
            continue;
        };
        match dev.mem_info() {
            Ok(mem) => println!(
                "Device {}: {} ({} MiB total, {} MiB free)",
                id,
                dev.name(),
                mem.total >> 20,
                mem.free >> 20
            ),
            Err(e) => println!("Device {}: {} ({})", id, dev.name(), e),
        }
    }
    for line in snapshot.lines() {
        println!("{line}");
    }
    Ok(())
}

async fn storage_cmd(args: StorageArgs) -> Result<()> {
    if args.discover {
        match storage::detect_storage() {
            Ok(mounts) if mounts.is_empty() => println!("No mounted storage devices found under /media/"),
            Ok(mounts) => mounts
                .iter()
                .enumerate()
                .for_each(|(i, m)| println!("Storage {}: {}", i + 1, m.display())),
            Err(e) => println!("{e}"),
        }
        match storage::detect_usb() {
            Ok(devs) => devs.iter().for_each(|d| println!("USB: {d}")),
            Err(e) => println!("{e}"),
        }
        return Ok(());
    }

    let targets = if args.targets.is_empty() {
        storage::detect_storage().map_err(anyhow::Error::msg)?
    } else {
        args.targets
    };
    if targets.is_empty() {
        bail!("no storage targets found; pass --target");
    }

    let token = CancellationToken::new();
    let watcher = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping storage test");
            watcher.set();
        }
    });

    let test = StorageTest::new(Duration::from_secs(args.duration), Duration::from_secs(1));
    let reports = tokio::task::spawn_blocking(move || {
        test.run(&targets, &token, |p| {
            println!(
                "Storage {}: {:.0}% ({} ok, {} failed)",
                p.index + 1,
                p.percent,
                p.successes,
                p.failures
            )
        })
    })
    .await??;

    for r in &reports {
        println!(
            "{}: {} successful transfers, {} failed",
            r.target.display(),
            r.successes,
            r.failures
        );
    }
    Ok(())
}
