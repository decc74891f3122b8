//! refs.rs — Registre des types de références (objets comptés).
//!
//! - Un registre global (process) : nom → `RefTypeId`, + fonction de rendu
//!   optionnelle utilisée par l’affichage des `VariantList`.
//! - `RefTypeSlot` : emplacement statique d’un type, enregistré une seule fois.
//! - `VmRef` : poignée clonable (`Arc`) étiquetée par son type.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::RwLock;

use crate::status::{Status, VmResult};

/// Identifiant runtime d’un type de référence (1-based, stable pour le process).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefTypeId(u32);

impl RefTypeId {
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RefTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rendu de débogage d’un objet ; `None` si l’objet n’est pas du type attendu.
pub type DescribeFn = fn(&(dyn Any + Send + Sync)) -> Option<String>;

#[derive(Debug, Clone, Copy)]
pub struct RefTypeDescriptor {
    pub name: &'static str,
    pub describe: Option<DescribeFn>,
}

static REGISTRY: Lazy<RwLock<Vec<RefTypeDescriptor>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// Enregistre un type ; `AlreadyExists` si le nom est déjà pris.
pub fn register_ref_type(descriptor: RefTypeDescriptor) -> VmResult<RefTypeId> {
    let mut registry = REGISTRY.write();
    if registry.iter().any(|d| d.name == descriptor.name) {
        return Err(Status::already_exists(format!(
            "ref type '{}' is already registered",
            descriptor.name
        )));
    }
    registry.push(descriptor);
    let id = RefTypeId(u32::try_from(registry.len()).map_err(|_| Status::resource_exhausted("ref type table is full"))?);
    tracing::debug!(target: "tessel-vm", name = descriptor.name, id = id.get(), "type de référence enregistré");
    Ok(id)
}

pub fn lookup_ref_type(name: &str) -> Option<RefTypeId> {
    REGISTRY
        .read()
        .iter()
        .position(|d| d.name == name)
        .and_then(|i| u32::try_from(i + 1).ok())
        .map(RefTypeId)
}

pub fn ref_type_descriptor(id: RefTypeId) -> Option<RefTypeDescriptor> {
    let index = usize::try_from(id.0).ok()?.checked_sub(1)?;
    REGISTRY.read().get(index).copied()
}

/// Emplacement statique d’un type de référence.
pub struct RefTypeSlot {
    descriptor: RefTypeDescriptor,
    id: OnceCell<RefTypeId>,
}

impl RefTypeSlot {
    pub const fn new(name: &'static str, describe: Option<DescribeFn>) -> Self {
        Self { descriptor: RefTypeDescriptor { name, describe }, id: OnceCell::new() }
    }

    /// Idempotent : le premier appel enregistre, les suivants relisent l’id.
    pub fn register(&self) -> VmResult<RefTypeId> {
        self.id.get_or_try_init(|| register_ref_type(self.descriptor)).copied()
    }

    pub fn id(&self) -> Option<RefTypeId> {
        self.id.get().copied()
    }

    pub const fn name(&self) -> &'static str {
        self.descriptor.name
    }
}

/// Objet pouvant être placé dans une variante `Ref`.
pub trait RefObject: Any + Send + Sync {
    fn type_slot() -> &'static RefTypeSlot
    where
        Self: Sized;
}

/* ───────────────────────────── VmRef ───────────────────────────── */

#[derive(Clone)]
pub struct VmRef {
    ref_type: RefTypeId,
    object: Arc<dyn Any + Send + Sync>,
}

impl VmRef {
    pub fn new<T: RefObject>(object: Arc<T>) -> VmResult<Self> {
        let ref_type = T::type_slot().register()?;
        Ok(Self { ref_type, object })
    }

    pub const fn ref_type(&self) -> RefTypeId {
        self.ref_type
    }

    pub fn isa<T: RefObject>(&self) -> bool {
        T::type_slot().id() == Some(self.ref_type)
    }

    pub fn downcast<T: RefObject>(&self) -> Option<Arc<T>> {
        if !self.isa::<T>() {
            return None;
        }
        Arc::clone(&self.object).downcast::<T>().ok()
    }

    pub fn downcast_ref<T: RefObject>(&self) -> Option<&T> {
        if !self.isa::<T>() {
            return None;
        }
        self.object.downcast_ref::<T>()
    }

    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.object)
    }

    /// Rendu de débogage : fonction du type si connue, sinon `Unknown(id)`.
    pub fn describe(&self) -> String {
        ref_type_descriptor(self.ref_type)
            .and_then(|d| d.describe)
            .and_then(|describe| describe(self.object.as_ref()))
            .unwrap_or_else(|| format!("Unknown({})", self.ref_type))
    }
}

impl fmt::Debug for VmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmRef").field("type", &self.ref_type).field("object", &self.describe()).finish()
    }
}

/* ───────────────────── Types intégrés à la VM ───────────────────── */

/// Segment rodata d’un module, partagé sans copie.
#[derive(Debug, Clone)]
pub struct RoByteBuffer {
    data: Bytes,
}

static RO_BYTE_BUFFER: RefTypeSlot = RefTypeSlot::new("vm.ro_byte_buffer", Some(describe_ro_byte_buffer));

fn describe_ro_byte_buffer(object: &(dyn Any + Send + Sync)) -> Option<String> {
    object.downcast_ref::<RoByteBuffer>().map(|b| format!("RoByteBuffer({})", b.len()))
}

impl RoByteBuffer {
    pub const fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl RefObject for RoByteBuffer {
    fn type_slot() -> &'static RefTypeSlot {
        &RO_BYTE_BUFFER
    }
}

/// Types intégrés, enregistrés par `VmInstance::create`.
pub(crate) fn register_builtin_types() -> VmResult<RefTypeId> {
    RO_BYTE_BUFFER.register()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Opaque;
    static OPAQUE: RefTypeSlot = RefTypeSlot::new("test.opaque", None);
    impl RefObject for Opaque {
        fn type_slot() -> &'static RefTypeSlot {
            &OPAQUE
        }
    }

    #[test]
    fn slot_registration_is_idempotent() {
        let a = RO_BYTE_BUFFER.register().unwrap();
        let b = RO_BYTE_BUFFER.register().unwrap();
        assert_eq!(a, b);
        assert_eq!(lookup_ref_type("vm.ro_byte_buffer"), Some(a));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        RO_BYTE_BUFFER.register().unwrap();
        let err = register_ref_type(RefTypeDescriptor { name: "vm.ro_byte_buffer", describe: None }).unwrap_err();
        assert_eq!(err.code(), crate::StatusCode::AlreadyExists);
    }

    #[test]
    fn describe_and_downcast() {
        let r = VmRef::new(Arc::new(RoByteBuffer::new(Bytes::from_static(&[1, 2, 3])))).unwrap();
        assert_eq!(r.describe(), "RoByteBuffer(3)");
        assert_eq!(r.downcast_ref::<RoByteBuffer>().map(RoByteBuffer::len), Some(3));
        assert!(r.downcast::<Opaque>().is_none());

        let o = VmRef::new(Arc::new(Opaque)).unwrap();
        assert_eq!(o.describe(), format!("Unknown({})", o.ref_type()));
    }
}
