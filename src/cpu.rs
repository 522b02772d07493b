//! CPU load: one unit per core, either spinning on a duty cycle or driving an
//! external native helper.

use crate::cancel::CancellationToken;
use crate::config::{CpuConfig, Modulation};
use crate::duty_cycle::{DutyCycle, Percentage};
use std::hint::black_box;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How a CPU unit burns its core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpuStrategy {
    /// Spin for the active part of each slice, sleep for the rest
    Compute,
    /// Repeatedly run a native helper that takes the percentage as argument
    External(PathBuf),
}

impl CpuStrategy {
    /// Prefer the helper when one is configured and usable; otherwise compute.
    pub fn select(helper: Option<&Path>) -> Self {
        match helper {
            Some(path) if is_executable(path) => CpuStrategy::External(path.to_path_buf()),
            Some(path) => {
                warn!(
                    "CPU helper {} not found or not executable; using computation strategy",
                    path.display()
                );
                CpuStrategy::Compute
            }
            None => CpuStrategy::Compute,
        }
    }
}

pub fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Lower the calling thread's scheduling priority. Failure is only a warning.
pub fn lower_priority(nice: i32) {
    #[cfg(unix)]
    {
        // On Linux PRIO_PROCESS with who=0 targets the calling thread.
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
        if rc != 0 {
            warn!(
                "Failed to lower priority to nice {}: {}",
                nice,
                std::io::Error::last_os_error()
            );
        } else {
            debug!("Lowered priority to nice {}", nice);
        }
    }
    #[cfg(not(unix))]
    {
        warn!("Priority adjustment (nice {}) is not supported on this platform", nice);
    }
}

/// Routine for one CPU unit.
#[derive(Debug, Clone)]
pub struct CpuLoadGenerator {
    percentage: Percentage,
    strategy: CpuStrategy,
    config: CpuConfig,
}

impl CpuLoadGenerator {
    pub fn new(percentage: Percentage, strategy: CpuStrategy, config: CpuConfig) -> Self {
        Self {
            percentage,
            strategy,
            config,
        }
    }

    pub fn strategy(&self) -> &CpuStrategy {
        &self.strategy
    }

    pub fn duty_cycle(&self) -> DutyCycle {
        DutyCycle::new(self.percentage, self.config.slice_interval)
    }

    /// Run until the token is set.
    pub fn run(&self, unit: usize, token: &CancellationToken) {
        if self.config.lower_priority {
            lower_priority(self.config.nice);
        }
        match &self.strategy {
            CpuStrategy::Compute => self.run_compute(unit, token),
            CpuStrategy::External(path) => self.run_external(unit, path, token),
        }
        debug!("CPU unit {} exiting", unit);
    }

    fn run_compute(&self, unit: usize, token: &CancellationToken) {
        let dc = self.duty_cycle();
        let idle = self.config.modulation.scale(dc.idle);
        debug!(
            "CPU unit {} computing at {} (active {:?}, idle {:?})",
            unit, self.percentage, dc.active, idle
        );
        let mut acc = 0u64;
        while !token.is_set() {
            if !dc.active.is_zero() {
                let start = Instant::now();
                while start.elapsed() < dc.active && !token.is_set() {
                    acc = spin(acc);
                }
            }
            token.sleep(idle);
        }
        black_box(acc);
    }

    fn run_external(&self, unit: usize, path: &Path, token: &CancellationToken) {
        if !is_executable(path) {
            error!("CPU helper {} not found or not executable", path.display());
            return;
        }
        let modulation = self.config.modulation;
        let poll = modulation.scale(self.config.poll_interval);
        let relaunch = modulation.scale(self.config.relaunch_pause);
        let arg = format!("{}", self.percentage.value().round() as u32);

        while !token.is_set() {
            let mut child = match Command::new(path)
                .arg(&arg)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
            {
                Ok(child) => child,
                Err(e) => {
                    error!("CPU unit {} failed to launch {}: {}", unit, path.display(), e);
                    return;
                }
            };
            debug!("CPU unit {} launched helper pid {}", unit, child.id());

            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!("CPU unit {} helper exited with {}", unit, status);
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("CPU unit {} lost track of helper: {}", unit, e);
                        break;
                    }
                }
                if token.sleep(poll) {
                    break;
                }
            }
            terminate_child(&mut child, self.config.terminate_grace);

            if token.sleep(relaunch) {
                break;
            }
        }
    }
}

fn spin(acc: u64) -> u64 {
    (0..1_000u64).fold(acc, |a, x| black_box(a.wrapping_mul(31).wrapping_add(x)))
}

/// SIGTERM the child, give it `grace` to exit, then kill it. Always reaps.
pub fn terminate_child(child: &mut Child, grace: Duration) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }
    #[cfg(unix)]
    {
        if let Ok(pid) = libc::pid_t::try_from(child.id()) {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
        let start = Instant::now();
        while start.elapsed() < grace {
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        warn!("Helper pid {} ignored SIGTERM; killing", child.id());
    }
    #[cfg(not(unix))]
    let _ = grace;
    if let Err(e) = child.kill() {
        debug!("Kill of helper pid {} failed: {}", child.id(), e);
    }
    if let Err(e) = child.wait() {
        warn!("Failed to reap helper pid {}: {}", child.id(), e);
    }
}

/// Log the chosen strategy once per run.
pub fn describe(strategy: &CpuStrategy, units: usize, percentage: Percentage, modulation: Modulation) {
    match strategy {
        CpuStrategy::Compute => info!(
            "Starting CPU load at {} on {} core(s) ({:?})",
            percentage, units, modulation
        ),
        CpuStrategy::External(path) => info!(
            "Starting CPU load at {} on {} core(s) via {} ({:?})",
            percentage,
            units,
            path.display(),
            modulation
        ),
    }
}
