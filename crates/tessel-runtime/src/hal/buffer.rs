//! hal/buffer.rs — Buffers device, vues et mémoire mappée.
//!
//! Le contenu d’un buffer vit derrière un `Arc<RwLock<Vec<u8>>>`. Un mapping
//! en lecture garde un verrou de lecture possédé (`ArcRwLockReadGuard`) :
//! tant qu’il vit, les écritures sont refusées et le contenu reste stable.
//! À la libération d’un `MappedMemory`, le démappage (verrou rendu +
//! compteur) précède toujours la libération de la référence au buffer.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{RawRwLock, RwLock};
use tracing::debug;

use tessel_vm::{RefObject, RefTypeSlot, Status, VmResult};

use super::{BufferUsage, MemoryType};
use crate::host_types::Description;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

static HAL_BUFFER: RefTypeSlot = RefTypeSlot::new("hal.buffer", Some(describe_buffer));

fn describe_buffer(object: &(dyn Any + Send + Sync)) -> Option<String> {
    object.downcast_ref::<DeviceBuffer>().map(|b| format!("HalBuffer({})", b.byte_length()))
}

/// Enregistre `hal.buffer` (idempotent).
pub(crate) fn register_types() -> VmResult<()> {
    HAL_BUFFER.register().map(|_| ())
}

/* ─────────────────────────── DeviceBuffer ─────────────────────────── */

pub struct DeviceBuffer {
    id: u64,
    memory_type: MemoryType,
    usage: BufferUsage,
    len: usize,
    data: Arc<RwLock<Vec<u8>>>,
    maps: AtomicUsize,
    unmaps: AtomicUsize,
}

impl RefObject for DeviceBuffer {
    fn type_slot() -> &'static RefTypeSlot {
        &HAL_BUFFER
    }
}

impl DeviceBuffer {
    /// Buffer adossé au tas, initialisé à zéro.
    pub fn allocate_heap(memory_type: MemoryType, usage: BufferUsage, size: usize) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            memory_type,
            usage,
            len: size,
            data: Arc::new(RwLock::new(vec![0; size])),
            maps: AtomicUsize::new(0),
            unmaps: AtomicUsize::new(0),
        })
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub const fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub const fn byte_length(&self) -> usize {
        self.len
    }

    /// Nombre de mappings ouverts depuis la création.
    pub fn map_count(&self) -> usize {
        self.maps.load(Ordering::Acquire)
    }

    pub fn unmap_count(&self) -> usize {
        self.unmaps.load(Ordering::Acquire)
    }

    fn check_range(&self, offset: usize, len: usize) -> VmResult<std::ops::Range<usize>> {
        offset
            .checked_add(len)
            .filter(|end| *end <= self.len)
            .map(|end| offset..end)
            .ok_or_else(|| {
                Status::out_of_range(format!(
                    "range [{offset}, +{len}) is outside buffer {} of {} bytes",
                    self.id, self.len
                ))
            })
    }

    fn with_contents_mut<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> VmResult<R> {
        let mut data = self
            .data
            .try_write()
            .ok_or_else(|| Status::failed_precondition(format!("buffer {} is mapped for reading", self.id)))?;
        Ok(f(&mut *data))
    }

    pub fn fill_zero(&self, offset: usize, len: usize) -> VmResult<()> {
        let range = self.check_range(offset, len)?;
        self.with_contents_mut(|data| data[range].fill(0))
    }

    pub fn write_data(&self, offset: usize, bytes: &[u8]) -> VmResult<()> {
        let range = self.check_range(offset, bytes.len())?;
        self.with_contents_mut(|data| data[range].copy_from_slice(bytes))
    }

    pub fn read_data(&self, offset: usize, len: usize) -> VmResult<Vec<u8>> {
        let range = self.check_range(offset, len)?;
        Ok(self.data.read()[range].to_vec())
    }

    /// Vue typée (forme + taille d’élément) sur ce buffer.
    pub fn create_view(self: &Arc<Self>, shape: Vec<usize>, element_size: usize) -> VmResult<BufferView> {
        let needed = shape
            .iter()
            .try_fold(element_size, |acc, d| acc.checked_mul(*d))
            .ok_or_else(|| Status::out_of_range("buffer view size overflows"))?;
        if needed > self.len {
            return Err(Status::out_of_range(format!(
                "view of {needed} bytes does not fit in buffer {} of {} bytes",
                self.id, self.len
            )));
        }
        Ok(BufferView { buffer: Arc::clone(self), shape, element_size })
    }

    /// Mappe toute l’étendue du buffer en lecture.
    pub fn map_read(self: &Arc<Self>) -> VmResult<MappedMemory> {
        if !self.memory_type.contains(MemoryType::HOST_VISIBLE) {
            return Err(Status::failed_precondition(format!("buffer {} is not host visible", self.id)));
        }
        if !self.usage.contains(BufferUsage::MAPPING) {
            return Err(Status::failed_precondition(format!("buffer {} does not allow mapping", self.id)));
        }
        let guard = self.data.read_arc();
        self.maps.fetch_add(1, Ordering::AcqRel);
        debug!(target: "tessel-runtime", buffer = self.id, bytes = self.len, "buffer mappé");
        Ok(MappedMemory {
            guard: Some(guard),
            buffer: Arc::clone(self),
            description: Description::bytes(self.len),
        })
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("memory_type", &self.memory_type)
            .field("usage", &self.usage)
            .finish_non_exhaustive()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        debug!(target: "tessel-runtime", buffer = self.id, "buffer libéré");
    }
}

/* ─────────────────────────── MappedMemory ─────────────────────────── */

/// Mapping en lecture ; garde le buffer vivant.
pub struct MappedMemory {
    guard: Option<ArcRwLockReadGuard<RawRwLock, Vec<u8>>>,
    buffer: Arc<DeviceBuffer>,
    description: Description,
}

impl MappedMemory {
    pub fn contents(&self) -> &[u8] {
        self.guard.as_deref().map_or(&[][..], Vec::as_slice)
    }

    pub const fn buffer(&self) -> &Arc<DeviceBuffer> {
        &self.buffer
    }

    pub const fn description(&self) -> &Description {
        &self.description
    }

    /// Réinterprète le mapping selon `description` (doit tenir dans le buffer).
    pub fn with_description(mut self, description: Description) -> VmResult<Self> {
        let span = description.byte_span();
        if span > self.contents().len() {
            return Err(Status::out_of_range(format!(
                "layout needs {span} bytes but buffer {} has {}",
                self.buffer.id,
                self.contents().len()
            )));
        }
        self.description = description;
        Ok(self)
    }
}

impl Drop for MappedMemory {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            drop(guard);
            self.buffer.unmaps.fetch_add(1, Ordering::AcqRel);
            debug!(target: "tessel-runtime", buffer = self.buffer.id, "buffer démappé");
        }
    }
}

impl fmt::Debug for MappedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedMemory")
            .field("buffer", &self.buffer.id)
            .field("description", &self.description)
            .finish()
    }
}

/* ─────────────────────────── BufferView ─────────────────────────── */

#[derive(Clone, Debug)]
pub struct BufferView {
    buffer: Arc<DeviceBuffer>,
    shape: Vec<usize>,
    element_size: usize,
}

impl BufferView {
    pub const fn buffer(&self) -> &Arc<DeviceBuffer> {
        &self.buffer
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub const fn element_size(&self) -> usize {
        self.element_size
    }

    /// Mapping row-major ; le format hôte n’est pas porté par la vue.
    pub fn map(&self) -> VmResult<MappedMemory> {
        self.buffer.map_read()?.with_description(Description::row_major(self.element_size, None, self.shape.clone()))
    }
}
