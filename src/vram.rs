//! Device-memory load: grow or shrink a private pool of allocations until it
//! holds a target share of the device's total memory.
//!
//! Only memory this unit allocated is counted, so other processes' usage on
//! the same device does not make the loop fight them.

use crate::accel::{Accelerator, DeviceBuffer, ELEMENT_BYTES};
use crate::cancel::CancellationToken;
use crate::config::VramConfig;
use crate::duty_cycle::Percentage;
use crate::error::AccelError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Allocations owned by one VRAM unit, newest last.
#[derive(Debug, Default)]
pub struct AllocationPool {
    blocks: Vec<DeviceBuffer>,
    bytes: u64,
}

impl AllocationPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn push(&mut self, block: DeviceBuffer) {
        self.bytes += block.bytes();
        self.blocks.push(block);
    }

    /// Release the newest block. Returns the bytes freed.
    pub fn pop(&mut self) -> Option<u64> {
        let block = self.blocks.pop()?;
        let freed = block.bytes();
        self.bytes -= freed;
        drop(block);
        Some(freed)
    }

    /// Release blocks until at or below `target`. Returns the bytes freed.
    pub fn shrink_to(&mut self, target: u64) -> u64 {
        let mut freed = 0;
        while self.bytes > target {
            match self.pop() {
                Some(n) => freed += n,
                None => break,
            }
        }
        freed
    }

    /// Release every block.
    pub fn drain(&mut self) -> u64 {
        self.shrink_to(0)
    }
}

/// What one control-loop step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Grew(u64),
    Shrank(u64),
    Settled,
    OutOfMemory,
}

/// Size of the next growth chunk in elements: `shortfall / divisor` bytes, at least one element.
pub fn chunk_elements(shortfall: u64, divisor: u64) -> usize {
    let bytes = (shortfall / divisor.max(1)).max(1);
    (bytes / ELEMENT_BYTES).max(1) as usize
}

#[derive(Debug, Clone)]
pub struct VramAllocator {
    device: Arc<dyn Accelerator>,
    percentage: Percentage,
    config: VramConfig,
    /// Pool size, readable from other threads while the unit runs
    reported: Arc<AtomicU64>,
}

impl VramAllocator {
    pub fn new(device: Arc<dyn Accelerator>, percentage: Percentage, config: VramConfig) -> Self {
        Self {
            device,
            percentage,
            config,
            reported: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Live view of the bytes this unit currently holds.
    pub fn allocated(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.reported)
    }

    pub fn target_bytes(&self, total: u64) -> u64 {
        (total as f64 * self.percentage.ratio()) as u64
    }

    /// One iteration of the control loop against `pool`.
    pub fn step(&self, pool: &mut AllocationPool) -> Result<Step, AccelError> {
        let info = self.device.mem_info()?;
        let target = self.target_bytes(info.total);
        let current = pool.bytes();

        let step = if current < target && target - current >= ELEMENT_BYTES {
            let elements = chunk_elements(target - current, self.config.chunk_divisor);
            match self.device.alloc_zeroed(elements) {
                Ok(block) => {
                    let n = block.bytes();
                    pool.push(block);
                    Step::Grew(n)
                }
                Err(e) if e.is_out_of_memory() => {
                    warn!("OOM on device {}: {}", self.device.id(), e);
                    Step::OutOfMemory
                }
                Err(e) => return Err(e),
            }
        } else if current > target {
            let freed = pool.shrink_to(target);
            self.device.release_cached()?;
            Step::Shrank(freed)
        } else {
            Step::Settled
        };
        self.reported.store(pool.bytes(), Ordering::SeqCst);
        Ok(step)
    }

    /// Track the target until cancelled, then release everything.
    pub fn run(&self, token: &CancellationToken) -> AllocationPool {
        let id = self.device.id();
        info!("Starting VRAM load on device {}: target {} of total memory", id, self.percentage);
        let mut pool = AllocationPool::new();

        while !token.is_set() {
            let pause = match self.step(&mut pool) {
                Ok(Step::Grew(_)) => self.config.grow_pause,
                Ok(Step::Shrank(freed)) => {
                    debug!("Device {} released {} bytes", id, freed);
                    self.config.shrink_pause
                }
                Ok(Step::Settled) => self.config.settle_pause,
                Ok(Step::OutOfMemory) => self.config.oom_backoff,
                Err(e) => {
                    warn!("VRAM load on device {}: {}", id, e);
                    self.config.oom_backoff
                }
            };
            token.sleep(pause);
        }

        let freed = pool.drain();
        if let Err(e) = self.device.release_cached() {
            warn!("Cache release on device {} failed: {}", id, e);
        }
        self.reported.store(0, Ordering::SeqCst);
        info!("Stopped VRAM load on device {}; freed {} bytes", id, freed);
        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::HostAccelerator;
    use crate::config::LoadConfig;
    use std::thread;
    use std::time::{Duration, Instant};

    const MIB: u64 = 1 << 20;

    fn allocator(dev: &Arc<HostAccelerator>, pct: u32) -> VramAllocator {
        VramAllocator::new(dev.clone(), Percentage::from(pct), LoadConfig::fast().vram)
    }

    #[test]
    fn chunk_is_a_tenth_of_the_gap_with_a_floor() {
        assert_eq!(chunk_elements(4000, 10), 100);
        assert_eq!(chunk_elements(3, 10), 1);
        assert_eq!(chunk_elements(0, 10), 1);
        assert_eq!(chunk_elements(400, 0), 100);
    }

    #[test]
    fn pool_tracks_bytes() {
        let dev = HostAccelerator::new(0, MIB);
        let mut pool = AllocationPool::new();
        pool.push(dev.alloc_zeroed(10).unwrap());
        pool.push(dev.alloc_zeroed(20).unwrap());
        assert_eq!(pool.bytes(), 120);
        assert_eq!(pool.shrink_to(50), 80);
        assert_eq!(pool.bytes(), 40);
        assert_eq!(pool.drain(), 40);
        assert!(pool.is_empty());
        assert_eq!(dev.used_bytes(), 0);
    }

    #[test]
    fn converges_toward_target_without_overshoot() {
        let dev = Arc::new(HostAccelerator::new(0, 8 * MIB));
        let vram = allocator(&dev, 30);
        let target = vram.target_bytes(8 * MIB);
        let mut pool = AllocationPool::new();
        let mut settled = false;
        for _ in 0..1_000 {
            if vram.step(&mut pool).unwrap() == Step::Settled {
                settled = true;
                break;
            }
            assert!(pool.bytes() <= target);
        }
        assert!(settled);
        assert!(target - pool.bytes() < ELEMENT_BYTES);
        pool.drain();
    }

    #[test]
    fn shrinks_when_over_target() {
        let dev = Arc::new(HostAccelerator::new(0, MIB));
        let vram = allocator(&dev, 10);
        let mut pool = AllocationPool::new();
        for _ in 0..4 {
            pool.push(dev.alloc_zeroed(32 * 1024).unwrap());
        }
        let step = vram.step(&mut pool).unwrap();
        assert!(matches!(step, Step::Shrank(_)));
        assert!(pool.bytes() <= vram.target_bytes(MIB));
        assert_eq!(dev.cached_bytes(), 0);
    }

    #[test]
    fn oom_is_reported_as_backoff_step() {
        let dev = Arc::new(HostAccelerator::new(0, MIB));
        let _hog = dev.alloc_zeroed((MIB / 4) as usize).unwrap();
        let vram = allocator(&dev, 50);
        let mut pool = AllocationPool::new();
        assert_eq!(vram.step(&mut pool).unwrap(), Step::OutOfMemory);
        assert!(pool.is_empty());
    }

    #[test]
    fn cancellation_drains_the_pool() {
        for pct in [0u32, 30, 100] {
            let dev = Arc::new(HostAccelerator::new(0, 4 * MIB));
            let vram = allocator(&dev, pct);
            let live = vram.allocated();
            let token = CancellationToken::new();
            let t = token.clone();
            let h = thread::spawn(move || vram.run(&t));

            let start = Instant::now();
            while pct > 0
                && live.load(Ordering::SeqCst) == 0
                && start.elapsed() < Duration::from_secs(5)
            {
                thread::sleep(Duration::from_millis(5));
            }
            if pct > 0 {
                assert!(live.load(Ordering::SeqCst) > 0);
            }
            token.set();
            let pool = h.join().unwrap();
            assert!(pool.is_empty());
            assert_eq!(pool.bytes(), 0);
            assert_eq!(live.load(Ordering::SeqCst), 0);
            assert_eq!(dev.used_bytes(), 0);
            assert_eq!(dev.mem_info().unwrap().free, 4 * MIB);
        }
    }

    #[test]
    fn ignores_memory_held_by_others() {
        let dev = Arc::new(HostAccelerator::new(0, 8 * MIB));
        let _other = dev.alloc_zeroed((MIB / 4) as usize).unwrap();
        let vram = allocator(&dev, 25);
        let mut pool = AllocationPool::new();
        while vram.step(&mut pool).unwrap() != Step::Settled {}
        assert!(vram.target_bytes(8 * MIB) - pool.bytes() < ELEMENT_BYTES);
        pool.drain();
    }
}
