//! Accelerator boundary used by the compute, render and VRAM generators.
//!
//! Generators only see [`Accelerator`]; a vendor backend plugs in by
//! implementing it. [`HostAccelerator`] emulates a device in host memory.

mod host;

pub use host::HostAccelerator;

use crate::error::{AccelError, LoadError, LoadResult};
use std::fmt;
use std::sync::Arc;

/// Bytes per allocation element (single precision).
pub const ELEMENT_BYTES: u64 = std::mem::size_of::<f32>() as u64;

/// Free and total device memory in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub free: u64,
    pub total: u64,
}

impl MemInfo {
    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.free)
    }
}

/// A device-memory block. Memory is released when the buffer is dropped.
pub struct DeviceBuffer {
    device: u32,
    elements: usize,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl DeviceBuffer {
    /// Wrap a backend allocation; `release` runs exactly once, on drop.
    pub fn new(device: u32, elements: usize, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            device,
            elements,
            release: Some(Box::new(release)),
        }
    }

    pub fn device(&self) -> u32 {
        self.device
    }

    pub fn elements(&self) -> usize {
        self.elements
    }

    pub fn bytes(&self) -> u64 {
        self.elements as u64 * ELEMENT_BYTES
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.device)
            .field("elements", &self.elements)
            .finish()
    }
}

/// One compute device.
pub trait Accelerator: Send + Sync + fmt::Debug {
    fn id(&self) -> u32;

    fn name(&self) -> String;

    fn mem_info(&self) -> Result<MemInfo, AccelError>;

    /// Allocate `elements` zeroed f32 values on the device.
    fn alloc_zeroed(&self, elements: usize) -> Result<DeviceBuffer, AccelError>;

    /// Multiply two random `dim`×`dim` matrices and wait for the device to finish.
    fn matmul(&self, dim: usize) -> Result<(), AccelError>;

    /// Return cached-but-unused memory to the device.
    fn release_cached(&self) -> Result<(), AccelError>;
}

/// Registered devices, addressed by id.
#[derive(Debug, Clone, Default)]
pub struct DeviceSet {
    devices: Vec<Arc<dyn Accelerator>>,
}

impl DeviceSet {
    pub fn new(devices: Vec<Arc<dyn Accelerator>>) -> Self {
        Self { devices }
    }

    /// `count` host-emulated devices with `memory_bytes` each.
    pub fn host(count: u32, memory_bytes: u64, matrix_dim_limit: usize) -> Self {
        let devices = (0..count)
            .map(|id| {
                Arc::new(HostAccelerator::new(id, memory_bytes).with_matrix_dim_limit(matrix_dim_limit))
                    as Arc<dyn Accelerator>
            })
            .collect();
        Self { devices }
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.devices.iter().map(|d| d.id()).collect()
    }

    pub fn get(&self, id: u32) -> Option<Arc<dyn Accelerator>> {
        self.devices.iter().find(|d| d.id() == id).cloned()
    }

    /// Devices for `ids` in request order; an empty list selects every device.
    pub fn resolve(&self, ids: &[u32]) -> LoadResult<Vec<Arc<dyn Accelerator>>> {
        if ids.is_empty() {
            return Ok(self.devices.clone());
        }
        ids.iter()
            .map(|&id| self.get(id).ok_or(LoadError::UnknownDevice { id }))
            .collect()
    }
}
