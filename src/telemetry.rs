//! Pull-based system telemetry: CPU and memory from `sysinfo`, per-GPU
//! figures from the driver's query tool. Query failures come back as strings.

use serde::Serialize;
use std::process::Command;
use std::thread;
use sysinfo::System;
use tracing::debug;

/// Memory use above which a device is flagged.
pub const VRAM_WARNING_PERCENT: f32 = 90.0;

const GPU_QUERY: &str =
    "--query-gpu=utilization.gpu,utilization.memory,memory.total,memory.free,memory.used";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuSample {
    pub index: usize,
    pub utilization_percent: f32,
    pub memory_utilization_percent: f32,
    pub memory_total_mib: u64,
    pub memory_free_mib: u64,
    pub memory_used_mib: u64,
}

impl GpuSample {
    pub fn memory_used_percent(&self) -> f32 {
        if self.memory_total_mib == 0 {
            return 0.0;
        }
        self.memory_used_mib as f32 / self.memory_total_mib as f32 * 100.0
    }

    pub fn vram_warning(&self) -> bool {
        self.memory_used_percent() > VRAM_WARNING_PERCENT
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub cpu_model: String,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub gpus: Result<Vec<GpuSample>, String>,
    pub power: Result<String, String>,
}

impl TelemetrySnapshot {
    /// Human-readable status lines.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("CPU Usage: {:.1}%", self.cpu_percent),
            format!("Memory Usage: {:.1}%", self.memory_percent),
        ];
        match &self.gpus {
            Ok(gpus) => {
                for g in gpus {
                    lines.push(format!(
                        "GPU {}: util {:.0}%, mem util {:.0}%, VRAM {}/{} MiB ({:.1}%)",
                        g.index,
                        g.utilization_percent,
                        g.memory_utilization_percent,
                        g.memory_used_mib,
                        g.memory_total_mib,
                        g.memory_used_percent()
                    ));
                    if g.vram_warning() {
                        lines.push(format!(
                            "Warning: GPU {} VRAM usage exceeds {}%. Reduce the load.",
                            g.index, VRAM_WARNING_PERCENT
                        ));
                    }
                }
            }
            Err(e) => lines.push(format!("GPU Info: {}", e)),
        }
        match &self.power {
            Ok(p) => lines.push(p.clone()),
            Err(e) => lines.push(format!("PSU Power: {}", e)),
        }
        lines
    }
}

/// Parse the CSV emitted by the GPU query (no header, no units).
pub fn parse_gpu_csv(text: &str) -> Result<Vec<GpuSample>, String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .enumerate()
        .map(|(index, line)| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() != 5 {
                return Err(format!("unexpected GPU query line: {line}"));
            }
            let float = |s: &str| s.parse::<f32>().map_err(|e| format!("bad value `{s}`: {e}"));
            let int = |s: &str| s.parse::<u64>().map_err(|e| format!("bad value `{s}`: {e}"));
            Ok(GpuSample {
                index,
                utilization_percent: float(fields[0])?,
                memory_utilization_percent: float(fields[1])?,
                memory_total_mib: int(fields[2])?,
                memory_free_mib: int(fields[3])?,
                memory_used_mib: int(fields[4])?,
            })
        })
        .collect()
}

pub fn format_power(text: &str) -> String {
    let draws: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    format!("GPU Power Draw: {} W", draws.join(", "))
}

fn run_query(program: &str, args: &[&str]) -> Result<String, String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| format!("{program}: {e}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("{program} exited with {}: {}", output.status, stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Reusable sampler; keeps `sysinfo` state between snapshots so CPU usage is a delta.
pub struct TelemetrySampler {
    sys: System,
    gpu_command: String,
}

impl TelemetrySampler {
    pub fn new(gpu_command: impl Into<String>) -> Self {
        let mut sys = System::new_all();
        // CPU usage needs two refreshes separated by a minimum interval.
        thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        sys.refresh_cpu_usage();
        Self {
            sys,
            gpu_command: gpu_command.into(),
        }
    }

    pub fn cpu_model(&self) -> String {
        self.sys
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn gpu_samples(&self) -> Result<Vec<GpuSample>, String> {
        run_query(&self.gpu_command, &["--format=csv,noheader,nounits", GPU_QUERY])
            .and_then(|out| parse_gpu_csv(&out))
    }

    pub fn power(&self) -> Result<String, String> {
        run_query(
            &self.gpu_command,
            &["--query-gpu=power.draw", "--format=csv,noheader,nounits"],
        )
        .map(|out| format_power(&out))
    }

    pub fn snapshot(&mut self) -> TelemetrySnapshot {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        let total = self.sys.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            self.sys.used_memory() as f32 / total as f32 * 100.0
        };
        let snapshot = TelemetrySnapshot {
            cpu_model: self.cpu_model(),
            cpu_percent: self.sys.global_cpu_usage(),
            memory_percent,
            gpus: self.gpu_samples(),
            power: self.power(),
        };
        debug!(
            "Telemetry: cpu {:.1}%, mem {:.1}%",
            snapshot.cpu_percent, snapshot.memory_percent
        );
        snapshot
    }
}
