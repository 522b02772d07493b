//! Matrix-multiply load on one accelerator.

use crate::accel::Accelerator;
use crate::cancel::CancellationToken;
use crate::duty_cycle::Percentage;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pause after each product: `1 / (percentage + 1)` seconds.
pub fn pacing(percentage: Percentage) -> Duration {
    Duration::from_secs_f64(1.0 / (percentage.value() + 1.0))
}

#[derive(Debug, Clone)]
pub struct GpuComputeLoadGenerator {
    device: Arc<dyn Accelerator>,
    percentage: Percentage,
    matrix_dim: usize,
    oom_backoff: Duration,
}

impl GpuComputeLoadGenerator {
    pub fn new(device: Arc<dyn Accelerator>, percentage: Percentage, matrix_dim: usize) -> Self {
        Self {
            device,
            percentage,
            matrix_dim,
            oom_backoff: Duration::from_secs(1),
        }
    }

    pub fn with_oom_backoff(mut self, backoff: Duration) -> Self {
        self.oom_backoff = backoff;
        self
    }

    /// Multiply, synchronize, pause; until the token is set. Returns completed iterations.
    pub fn run(&self, token: &CancellationToken) -> u64 {
        let id = self.device.id();
        let pause = pacing(self.percentage);
        info!(
            "Starting compute load at {} on device {} ({}x{} matrices, pause {:?})",
            self.percentage, id, self.matrix_dim, self.matrix_dim, pause
        );
        let mut iterations = 0u64;
        while !token.is_set() {
            match self.device.matmul(self.matrix_dim) {
                Ok(()) => iterations += 1,
                Err(e) if e.is_out_of_memory() => {
                    warn!("Compute load on device {}: {}; backing off", id, e);
                    if token.sleep(self.oom_backoff) {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!("Compute load on device {} failed: {}", id, e);
                    if token.sleep(self.oom_backoff) {
                        break;
                    }
                    continue;
                }
            }
            if token.sleep(pause) {
                break;
            }
        }
        debug!("Compute load on device {} stopped after {} iteration(s)", id, iterations);
        iterations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::HostAccelerator;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn pacing_decreases_with_load() {
        assert_eq!(pacing(Percentage::ZERO), Duration::from_secs(1));
        assert_eq!(pacing(Percentage::from(50u32)), Duration::from_secs_f64(1.0 / 51.0));
        assert!(pacing(Percentage::FULL) < pacing(Percentage::from(10u32)));
    }

    #[test]
    fn runs_until_cancelled_and_frees_memory() {
        let dev = Arc::new(HostAccelerator::new(0, 1 << 20).with_matrix_dim_limit(16));
        let gen = GpuComputeLoadGenerator::new(dev.clone(), Percentage::FULL, 8000);
        let token = CancellationToken::new();
        let t = token.clone();
        let h = thread::spawn(move || gen.run(&t));
        thread::sleep(Duration::from_millis(100));
        let stop = Instant::now();
        token.set();
        let iterations = h.join().unwrap();
        assert!(iterations > 0);
        assert!(stop.elapsed() < Duration::from_millis(500));
        assert_eq!(dev.used_bytes(), 0);
    }

    #[test]
    fn out_of_memory_backs_off_without_exiting() {
        let dev = Arc::new(HostAccelerator::new(0, 16).with_matrix_dim_limit(16));
        let gen = GpuComputeLoadGenerator::new(dev, Percentage::FULL, 16)
            .with_oom_backoff(Duration::from_millis(5));
        let token = CancellationToken::new();
        let t = token.clone();
        let h = thread::spawn(move || gen.run(&t));
        thread::sleep(Duration::from_millis(50));
        assert!(!h.is_finished());
        token.set();
        assert_eq!(h.join().unwrap(), 0);
    }
}
