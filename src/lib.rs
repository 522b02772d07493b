//! Load generation for CPU, accelerator compute, rendering and device memory,
//! with cooperative cancellation and a single controller that owns each run.

pub mod accel;
pub mod cancel;
pub mod config;
pub mod controller;
pub mod cpu;
pub mod duty_cycle;
pub mod error;
pub mod gpu_compute;
pub mod pool;
pub mod render;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod vram;

pub use cancel::CancellationToken;
pub use config::{LoadConfig, Modulation};
pub use controller::{LoadKind, LoadRequest, LoadTestController, RunHandle, RunId, RunSummary};
pub use duty_cycle::{DutyCycle, Percentage};
pub use error::{AccelError, LoadError, LoadResult};
pub use pool::{WorkerHandle, WorkerPool};
