//! hal/mod.rs — Couche matérielle : pilotes, devices, allocateur.
//!
//! Deux pilotes sont enregistrés (`interpreter`, `vmla`). Tous deux
//! exécutent sur le CPU hôte et allouent dans le tas ; ils ne diffèrent que
//! par leur nom et leur device par défaut.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, info};

use tessel_vm::{Status, VmResult};

mod buffer;
mod module;

pub use buffer::{BufferView, DeviceBuffer, MappedMemory};
pub use module::create_hal_module;

/* ─────────────────────────── Drapeaux ─────────────────────────── */

bitflags! {
    #[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
    pub struct MemoryType: u32 {
        const TRANSIENT = 1 << 0;
        const HOST_VISIBLE = 1 << 1;
        const HOST_COHERENT = 1 << 2;
        const HOST_CACHED = 1 << 3;
        const DEVICE_VISIBLE = 1 << 4;
        /// Mémoire du device, visible de lui.
        const DEVICE_LOCAL = (1 << 5) | Self::DEVICE_VISIBLE.bits();
        /// Mémoire de l’hôte, visible et cohérente.
        const HOST_LOCAL = (1 << 6) | Self::HOST_VISIBLE.bits() | Self::HOST_COHERENT.bits();
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        const CONSTANT = 1 << 0;
        const TRANSFER = 1 << 1;
        const MAPPING = 1 << 2;
        const DISPATCH = 1 << 3;
        const ALL = Self::TRANSFER.bits() | Self::MAPPING.bits() | Self::DISPATCH.bits();
    }
}

/* ─────────────────────────── Pilotes ─────────────────────────── */

struct DriverInfo {
    name: &'static str,
    device: &'static str,
}

const DRIVERS: &[DriverInfo] = &[
    DriverInfo { name: "interpreter", device: "interpreter-cpu" },
    DriverInfo { name: "vmla", device: "vmla-cpu" },
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HalDriver {
    name: &'static str,
    device: &'static str,
}

impl HalDriver {
    /// Noms des pilotes enregistrés, dans l’ordre d’enregistrement.
    pub fn query() -> Vec<String> {
        DRIVERS.iter().map(|d| d.name.to_string()).collect()
    }

    pub fn create(name: &str) -> VmResult<Self> {
        let info = DRIVERS.iter().find(|d| d.name == name).ok_or_else(|| {
            Status::not_found(format!("driver '{name}' is not registered (available: {})", Self::query().join(", ")))
        })?;
        debug!(target: "tessel-runtime", driver = info.name, "pilote créé");
        Ok(Self { name: info.name, device: info.device })
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub fn create_default_device(&self) -> VmResult<HalDevice> {
        let device = HalDevice::new(self.name, self.device);
        info!(target: "tessel-runtime", driver = self.name, device = %device.name(), "device par défaut créé");
        Ok(device)
    }
}

impl fmt::Display for HalDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<HalDriver {}>", self.name)
    }
}

/* ─────────────────────────── Device ─────────────────────────── */

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
struct DeviceInner {
    driver: &'static str,
    name: String,
    allocator: HalAllocator,
}

/// Poignée partagée vers un device.
#[derive(Clone, Debug)]
pub struct HalDevice(Arc<DeviceInner>);

impl HalDevice {
    fn new(driver: &'static str, kind: &'static str) -> Self {
        let name = format!("{kind}:{}", NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed));
        let allocator = HalAllocator { device: name.clone() };
        Self(Arc::new(DeviceInner { driver, name, allocator }))
    }

    pub fn driver_name(&self) -> &'static str {
        self.0.driver
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn allocator(&self) -> &HalAllocator {
        &self.0.allocator
    }
}

/* ─────────────────────────── Allocateur ─────────────────────────── */

/// Plus grande allocation acceptée (1 GiB).
pub const MAX_ALLOCATION_SIZE: usize = 1 << 30;

#[derive(Debug, Clone)]
pub struct HalAllocator {
    device: String,
}

impl HalAllocator {
    pub fn allocate_buffer(&self, memory_type: MemoryType, usage: BufferUsage, size: usize) -> VmResult<Arc<DeviceBuffer>> {
        if memory_type.is_empty() {
            return Err(Status::invalid_argument("memory type must not be empty"));
        }
        if size > MAX_ALLOCATION_SIZE {
            return Err(Status::resource_exhausted(format!(
                "allocation of {size} bytes exceeds the {MAX_ALLOCATION_SIZE} byte limit"
            )));
        }
        let buffer = DeviceBuffer::allocate_heap(memory_type, usage, size);
        debug!(
            target: "tessel-runtime",
            device = %self.device,
            buffer = buffer.id(),
            size,
            memory = ?memory_type,
            "buffer alloué"
        );
        Ok(buffer)
    }
}
