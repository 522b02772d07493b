//! Composition root: turns load requests into running worker pools and stops them.

use crate::accel::{Accelerator, DeviceSet};
use crate::cancel::CancellationToken;
use crate::config::LoadConfig;
use crate::cpu::{self, CpuLoadGenerator, CpuStrategy};
use crate::duty_cycle::Percentage;
use crate::error::{LoadError, LoadResult};
use crate::gpu_compute::GpuComputeLoadGenerator;
use crate::pool::{default_cpu_units, WorkerPool};
use crate::render::{GpuRenderLoadGenerator, OffscreenSurfaceFactory, SurfaceFactory};
use crate::vram::VramAllocator;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadKind {
    Cpu,
    GpuRender,
    GpuCompute,
    GpuCombined,
    GpuVram,
}

impl LoadKind {
    pub fn uses_devices(self) -> bool {
        !matches!(self, LoadKind::Cpu)
    }
}

impl fmt::Display for LoadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoadKind::Cpu => "cpu",
            LoadKind::GpuRender => "gpu_render",
            LoadKind::GpuCompute => "gpu_compute",
            LoadKind::GpuCombined => "gpu_combined",
            LoadKind::GpuVram => "gpu_vram",
        };
        f.write_str(s)
    }
}

impl FromStr for LoadKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "cpu" => Ok(LoadKind::Cpu),
            "gpu_render" | "render" => Ok(LoadKind::GpuRender),
            "gpu_compute" | "compute" => Ok(LoadKind::GpuCompute),
            "gpu_combined" | "combined" => Ok(LoadKind::GpuCombined),
            "gpu_vram" | "vram" => Ok(LoadKind::GpuVram),
            other => Err(format!("unknown load kind `{other}`")),
        }
    }
}

/// One load to apply for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRequest {
    pub kind: LoadKind,
    pub percentage: Percentage,
    #[serde(default)]
    pub device_ids: Vec<u32>,
}

impl LoadRequest {
    /// Build a request; the percentage is clamped into `0..=100`.
    pub fn new(kind: LoadKind, percentage: f64, device_ids: Vec<u32>) -> Self {
        let clamped = Percentage::clamped(percentage);
        if clamped.value() != percentage {
            debug!("Clamped {} load {} to {}", kind, percentage, clamped);
        }
        Self {
            kind,
            percentage: clamped,
            device_ids,
        }
    }

    pub fn cpu(percentage: f64) -> Self {
        Self::new(LoadKind::Cpu, percentage, Vec::new())
    }
}

pub type RunId = Uuid;

/// Result of a stopped run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub id: RunId,
    pub elapsed_ms: u64,
    pub units: usize,
}

/// A started run: its token and every unit it spawned.
///
/// Dropping a handle that was never stopped stops it.
#[derive(Debug)]
pub struct RunHandle {
    id: RunId,
    started: Instant,
    requests: Vec<LoadRequest>,
    pool: WorkerPool,
    busy: Arc<AtomicBool>,
    summary: Option<RunSummary>,
}

impl RunHandle {
    /// Wrap an already-populated pool as a run outside any controller.
    #[cfg(test)]
    pub(crate) fn from_pool(pool: WorkerPool, requests: Vec<LoadRequest>) -> Self {
        Self {
            id: Uuid::new_v4(),
            started: Instant::now(),
            requests,
            pool,
            busy: Arc::new(AtomicBool::new(true)),
            summary: None,
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        self.pool.token()
    }

    pub fn requests(&self) -> &[LoadRequest] {
        &self.requests
    }

    pub fn units(&self) -> usize {
        self.pool.len()
    }

    pub fn alive(&self) -> usize {
        self.pool.alive()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.pool.handles().iter().map(|h| h.name().to_string()).collect()
    }

    /// Cancel and join every unit. Idempotent; later calls return the first summary.
    pub fn stop(&mut self) -> RunSummary {
        if let Some(summary) = &self.summary {
            return summary.clone();
        }
        info!("Stopping run {}", self.id);
        let units = self.pool.stop_all();
        self.busy.store(false, Ordering::SeqCst);
        let summary = RunSummary {
            id: self.id,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            units,
        };
        info!("Run {} stopped after {} ms ({} unit(s))", self.id, summary.elapsed_ms, units);
        self.summary = Some(summary.clone());
        summary
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        if self.summary.is_none() {
            self.stop();
        }
    }
}

/// Starts and stops load runs. At most one run is active at a time.
#[derive(Debug)]
pub struct LoadTestController {
    config: LoadConfig,
    devices: DeviceSet,
    surfaces: Arc<dyn SurfaceFactory>,
    busy: Arc<AtomicBool>,
}

impl LoadTestController {
    pub fn new(config: LoadConfig, devices: DeviceSet, surfaces: Arc<dyn SurfaceFactory>) -> Self {
        Self {
            config,
            devices,
            surfaces,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Controller over host-emulated devices and offscreen surfaces, sized from `config`.
    pub fn with_host_devices(config: LoadConfig) -> Self {
        let devices = DeviceSet::host(
            config.host_devices,
            config.host_memory_mb * 1024 * 1024,
            config.compute.host_matrix_dim_limit,
        );
        Self::new(config, devices, Arc::new(OffscreenSurfaceFactory::new()))
    }

    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    pub fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn start_run(&self, request: LoadRequest) -> LoadResult<RunHandle> {
        self.start_plan(std::slice::from_ref(&request))
    }

    /// Start several loads under one token.
    pub fn start_plan(&self, requests: &[LoadRequest]) -> LoadResult<RunHandle> {
        if requests.is_empty() {
            return Err(LoadError::EmptyPlan);
        }
        // Resolve every device before anything is spawned.
        let targets = requests
            .iter()
            .map(|r| self.targets(r).map(|devs| (r.clone(), devs)))
            .collect::<LoadResult<Vec<_>>>()?;

        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(LoadError::RunActive);
        }

        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        let mut pool = WorkerPool::new(token).with_warn_after(self.config.stop_warn_after);
        for (request, devices) in &targets {
            if let Err(e) = self.dispatch(&mut pool, request, devices) {
                pool.stop_all();
                self.busy.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }
        info!("Run {} started with {} unit(s)", id, pool.len());
        Ok(RunHandle {
            id,
            started: Instant::now(),
            requests: requests.to_vec(),
            pool,
            busy: Arc::clone(&self.busy),
            summary: None,
        })
    }

    pub fn stop_run(&self, mut handle: RunHandle) -> RunSummary {
        handle.stop()
    }

    fn targets(&self, request: &LoadRequest) -> LoadResult<Vec<Arc<dyn Accelerator>>> {
        if !request.kind.uses_devices() {
            return Ok(Vec::new());
        }
        let devices = self.devices.resolve(&request.device_ids)?;
        if devices.is_empty() {
            return Err(LoadError::NoDevices {
                kind: request.kind.to_string(),
            });
        }
        Ok(devices)
    }

    fn dispatch(
        &self,
        pool: &mut WorkerPool,
        request: &LoadRequest,
        devices: &[Arc<dyn Accelerator>],
    ) -> LoadResult<()> {
        let pct = request.percentage;
        match request.kind {
            LoadKind::Cpu => self.start_cpu(pool, pct),
            LoadKind::GpuCompute => devices.iter().try_for_each(|d| self.start_compute(pool, d, pct)),
            LoadKind::GpuRender => devices.iter().try_for_each(|d| self.start_render(pool, d, pct)),
            LoadKind::GpuCombined => devices.iter().try_for_each(|d| {
                self.start_compute(pool, d, pct)?;
                self.start_render(pool, d, pct)
            }),
            LoadKind::GpuVram => devices.iter().try_for_each(|d| self.start_vram(pool, d, pct)),
        }
    }

    fn start_cpu(&self, pool: &mut WorkerPool, pct: Percentage) -> LoadResult<()> {
        let cfg = &self.config.cpu;
        let units = cfg.units.unwrap_or_else(default_cpu_units);
        let strategy = CpuStrategy::select(cfg.helper.as_deref());
        cpu::describe(&strategy, units, pct, cfg.modulation);
        let generator = CpuLoadGenerator::new(pct, strategy, cfg.clone());
        pool.start("cpu", units, move |unit, token| generator.run(unit, &token))
    }

    fn start_compute(&self, pool: &mut WorkerPool, device: &Arc<dyn Accelerator>, pct: Percentage) -> LoadResult<()> {
        let generator = GpuComputeLoadGenerator::new(Arc::clone(device), pct, self.config.compute.matrix_dim)
            .with_oom_backoff(self.config.vram.oom_backoff);
        pool.spawn(format!("gpu-compute-{}", device.id()), move |token| {
            generator.run(&token);
        })
    }

    fn start_render(&self, pool: &mut WorkerPool, device: &Arc<dyn Accelerator>, pct: Percentage) -> LoadResult<()> {
        let generator = GpuRenderLoadGenerator::new(
            device.id(),
            pct,
            self.config.render.clone(),
            Arc::clone(&self.surfaces),
        );
        pool.spawn(format!("gpu-render-{}", device.id()), move |token| {
            generator.run(&token);
        })
    }

    fn start_vram(&self, pool: &mut WorkerPool, device: &Arc<dyn Accelerator>, pct: Percentage) -> LoadResult<()> {
        let allocator = VramAllocator::new(Arc::clone(device), pct, self.config.vram.clone());
        pool.spawn(format!("gpu-vram-{}", device.id()), move |token| {
            allocator.run(&token);
        })
    }
}
