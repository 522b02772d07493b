use super::{Accelerator, DeviceBuffer, MemInfo, ELEMENT_BYTES};
use crate::error::AccelError;
use rand::Rng;
use std::hint::black_box;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Default)]
struct Ledger {
    used: u64,
    /// Freed bytes held by the caching allocator until `release_cached`
    cached: u64,
}

/// Accelerator emulated in host memory with a fixed capacity.
///
/// Freed buffers go to a cache that still counts against free memory until
/// [`Accelerator::release_cached`] is called, like a caching device allocator.
/// Matrix products run on the calling thread, capped at `matrix_dim_limit`.
#[derive(Debug)]
pub struct HostAccelerator {
    id: u32,
    total: u64,
    matrix_dim_limit: usize,
    ledger: Arc<Mutex<Ledger>>,
}

impl HostAccelerator {
    pub fn new(id: u32, total_bytes: u64) -> Self {
        Self {
            id,
            total: total_bytes,
            matrix_dim_limit: 256,
            ledger: Arc::new(Mutex::new(Ledger::default())),
        }
    }

    pub fn with_matrix_dim_limit(mut self, limit: usize) -> Self {
        self.matrix_dim_limit = limit.max(1);
        self
    }

    /// Bytes held by live buffers.
    pub fn used_bytes(&self) -> u64 {
        self.lock().used
    }

    pub fn cached_bytes(&self) -> u64 {
        self.lock().cached
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn alloc_matrix(&self, dim: usize) -> Result<(DeviceBuffer, Vec<f32>), AccelError> {
        let buf = self.alloc_zeroed(dim * dim)?;
        let mut rng = rand::rng();
        let values = (0..dim * dim).map(|_| rng.random::<f32>()).collect();
        Ok((buf, values))
    }
}

impl Accelerator for HostAccelerator {
    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> String {
        format!("host-emulated accelerator {}", self.id)
    }

    fn mem_info(&self) -> Result<MemInfo, AccelError> {
        let ledger = self.lock();
        Ok(MemInfo {
            free: self.total.saturating_sub(ledger.used + ledger.cached),
            total: self.total,
        })
    }

    fn alloc_zeroed(&self, elements: usize) -> Result<DeviceBuffer, AccelError> {
        let bytes = elements as u64 * ELEMENT_BYTES;
        {
            let mut ledger = self.lock();
            if ledger.used + bytes > self.total {
                return Err(AccelError::OutOfMemory { requested: bytes });
            }
            ledger.cached = ledger.cached.saturating_sub(bytes);
            ledger.used += bytes;
        }

        let mut data: Vec<f32> = Vec::new();
        if data.try_reserve_exact(elements).is_err() {
            self.lock().used -= bytes;
            return Err(AccelError::OutOfMemory { requested: bytes });
        }
        data.resize(elements, 0.0);

        let ledger = Arc::clone(&self.ledger);
        Ok(DeviceBuffer::new(self.id, elements, move || {
            drop(data);
            let mut ledger = ledger.lock().unwrap_or_else(|e| e.into_inner());
            ledger.used -= bytes;
            ledger.cached += bytes;
        }))
    }

    fn matmul(&self, dim: usize) -> Result<(), AccelError> {
        let n = dim.min(self.matrix_dim_limit).max(1);
        let (_a_buf, a) = self.alloc_matrix(n)?;
        let (_b_buf, b) = self.alloc_matrix(n)?;
        let _c_buf = self.alloc_zeroed(n * n)?;
        let mut c = vec![0.0f32; n * n];
        for i in 0..n {
            for k in 0..n {
                let aik = a[i * n + k];
                let row = &b[k * n..(k + 1) * n];
                for (cij, bkj) in c[i * n..(i + 1) * n].iter_mut().zip(row) {
                    *cij += aik * bkj;
                }
            }
        }
        black_box(&c);
        Ok(())
    }

    fn release_cached(&self) -> Result<(), AccelError> {
        let mut ledger = self.lock();
        if ledger.cached > 0 {
            debug!("Device {} released {} cached bytes", self.id, ledger.cached);
        }
        ledger.cached = 0;
        Ok(())
    }
}
