//! Tunables for every generator. Defaults match the documented timing constants;
//! a JSON file may override any subset of them.

use crate::error::{LoadError, LoadResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Serialize durations as whole milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// How strongly the CPU generator softens its load.
///
/// `Modulated` doubles every pause (poll interval, relaunch pause and idle
/// slice), which smooths oscillation at the cost of a lower effective load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modulation {
    #[default]
    Normal,
    Modulated,
}

impl Modulation {
    pub fn factor(self) -> u32 {
        match self {
            Modulation::Normal => 1,
            Modulation::Modulated => 2,
        }
    }

    pub fn scale(self, d: Duration) -> Duration {
        d * self.factor()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    /// Duty-cycle slice for the computation strategy
    #[serde(with = "millis")]
    pub slice_interval: Duration,
    /// Subprocess poll interval for the helper strategy
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Pause between helper relaunches
    #[serde(with = "millis")]
    pub relaunch_pause: Duration,
    /// Grace period between SIGTERM and SIGKILL for the helper
    #[serde(with = "millis")]
    pub terminate_grace: Duration,
    /// Native helper taking the percentage as its only argument
    pub helper: Option<PathBuf>,
    pub modulation: Modulation,
    pub lower_priority: bool,
    pub nice: i32,
    /// Units to spawn; `None` means one per available core
    pub units: Option<usize>,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            slice_interval: Duration::from_millis(100),
            poll_interval: Duration::from_millis(200),
            relaunch_pause: Duration::from_millis(500),
            terminate_grace: Duration::from_secs(2),
            helper: None,
            modulation: Modulation::Normal,
            lower_priority: true,
            nice: 10,
            units: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Side length of the square matrices multiplied per iteration
    pub matrix_dim: usize,
    /// Largest dimension the host-emulated backend will actually multiply
    pub host_matrix_dim_limit: usize,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            matrix_dim: 8000,
            host_matrix_dim_limit: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
    #[serde(with = "millis")]
    pub frame_pause: Duration,
    pub texture: Option<PathBuf>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            frame_pause: Duration::from_millis(10),
            texture: Some(PathBuf::from("texture.jpg")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VramConfig {
    /// Each growth step allocates `shortfall / chunk_divisor` bytes
    pub chunk_divisor: u64,
    #[serde(with = "millis")]
    pub grow_pause: Duration,
    #[serde(with = "millis")]
    pub shrink_pause: Duration,
    #[serde(with = "millis")]
    pub settle_pause: Duration,
    #[serde(with = "millis")]
    pub oom_backoff: Duration,
}

impl Default for VramConfig {
    fn default() -> Self {
        Self {
            chunk_divisor: 10,
            grow_pause: Duration::from_millis(100),
            shrink_pause: Duration::from_millis(100),
            settle_pause: Duration::from_millis(200),
            oom_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    #[serde(with = "millis")]
    pub interval: Duration,
    /// Command used for per-device GPU queries
    pub gpu_query_command: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            gpu_query_command: "nvidia-smi".to_string(),
        }
    }
}

/// Top-level configuration for a controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub cpu: CpuConfig,
    pub compute: ComputeConfig,
    pub render: RenderConfig,
    pub vram: VramConfig,
    pub telemetry: TelemetryConfig,
    /// Number of host-emulated accelerators registered by the CLI
    pub host_devices: u32,
    pub host_memory_mb: u64,
    /// `stop_all` logs a warning for units slower than this to exit
    #[serde(with = "millis")]
    pub stop_warn_after: Duration,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            cpu: CpuConfig::default(),
            compute: ComputeConfig::default(),
            render: RenderConfig::default(),
            vram: VramConfig::default(),
            telemetry: TelemetryConfig::default(),
            host_devices: 1,
            host_memory_mb: 1024,
            stop_warn_after: Duration::from_secs(2),
        }
    }
}

impl LoadConfig {
    pub fn from_json(text: &str) -> LoadResult<Self> {
        let cfg: Self = serde_json::from_str(text).map_err(|e| LoadError::Config {
            message: e.to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject intervals that would turn a polling loop into a busy loop.
    pub fn validate(&self) -> LoadResult<()> {
        let nonzero = [
            ("cpu.slice_interval", self.cpu.slice_interval),
            ("cpu.poll_interval", self.cpu.poll_interval),
            ("telemetry.interval", self.telemetry.interval),
        ];
        match nonzero.iter().find(|(_, d)| d.is_zero()) {
            Some((field, _)) => Err(LoadError::Config {
                message: format!("{field} must be greater than zero"),
            }),
            None => Ok(()),
        }
    }

    pub fn load(path: &Path) -> LoadResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| LoadError::Config {
            message: format!("{}: {}", path.display(), e),
        })?;
        Self::from_json(&text)
    }

    /// Configuration with every pause shortened, for tests and quick demos.
    pub fn fast() -> Self {
        let mut cfg = Self::default();
        cfg.cpu.slice_interval = Duration::from_millis(10);
        cfg.cpu.poll_interval = Duration::from_millis(10);
        cfg.cpu.relaunch_pause = Duration::from_millis(10);
        cfg.cpu.terminate_grace = Duration::from_millis(500);
        cfg.cpu.lower_priority = false;
        cfg.compute.matrix_dim = 32;
        cfg.compute.host_matrix_dim_limit = 32;
        cfg.render.width = 64;
        cfg.render.height = 48;
        cfg.render.frame_pause = Duration::from_millis(1);
        cfg.render.texture = None;
        cfg.vram.grow_pause = Duration::from_millis(1);
        cfg.vram.shrink_pause = Duration::from_millis(1);
        cfg.vram.settle_pause = Duration::from_millis(2);
        cfg.vram.oom_backoff = Duration::from_millis(5);
        cfg.host_memory_mb = 16;
        cfg.stop_warn_after = Duration::from_millis(500);
        cfg
    }
}
