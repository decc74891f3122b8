//! host_types.rs — Pont entre buffers device et valeurs hôte.
//!
//! - `Description` : taille d’élément, format hôte, dims, strides (row-major).
//! - `HostBuffer`  : données hôte (possédées) destinées à être téléversées.
//! - `HostArray`   : vue strided, sans copie, sur un `MappedMemory` partagé ;
//!   le mapping (et donc le buffer) vit exactement aussi longtemps que la vue.
//! - `HostTypeFactory` : politique de conversion des résultats. L’implémentation
//!   par défaut refuse (`Unimplemented`) ; `NdarrayHostTypeFactory` mappe.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use once_cell::sync::Lazy;

use tessel_bytecode::ScalarType;
use tessel_vm::{Status, VmResult};

use crate::hal::{DeviceBuffer, MappedMemory};

/* ─────────────────────────── Description ─────────────────────────── */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Description {
    pub element_size: usize,
    /// Format hôte (style buffer protocol) ; `None` si inconnu.
    pub format: Option<&'static str>,
    pub dims: Vec<usize>,
    pub strides: Vec<usize>,
}

impl Description {
    /// Résout taille et format depuis la table des types scalaires.
    pub fn for_ndarray(scalar_type: u32, dims: &[i32]) -> VmResult<Self> {
        let scalar_type = ScalarType::from_code(scalar_type).ok_or_else(|| Status::invalid_argument("Illegal ScalarType"))?;
        let format = scalar_type.host_format().ok_or_else(|| Status::unimplemented("Unimplemented ScalarType"))?;
        let dims = dims
            .iter()
            .map(|d| usize::try_from(*d).map_err(|_| Status::invalid_argument(format!("dimension {d} is not static"))))
            .collect::<VmResult<Vec<_>>>()?;
        Ok(Self::row_major(scalar_type.size(), Some(format), dims))
    }

    /// `strides[last] = element_size`, `strides[i] = strides[i+1] * dims[i+1]`.
    pub fn row_major(element_size: usize, format: Option<&'static str>, dims: Vec<usize>) -> Self {
        let mut strides = vec![0; dims.len()];
        if let Some(last) = strides.last_mut() {
            *last = element_size;
        }
        for i in (0..dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1].saturating_mul(dims[i + 1]);
        }
        Self { element_size, format, dims, strides }
    }

    /// Vue brute : octets non typés.
    pub fn bytes(len: usize) -> Self {
        Self::row_major(1, None, vec![len])
    }

    /// Produit des dims (1 pour un tableau de rang 0).
    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn byte_span(&self) -> usize {
        self.element_count().saturating_mul(self.element_size)
    }
}

/* ─────────────────────────── Éléments typés ─────────────────────────── */

/// Type Rust ayant une représentation little-endian dans un buffer.
pub trait Element: Copy + Sized {
    const SCALAR_TYPE: ScalarType;
    fn from_le(bytes: &[u8]) -> Self;
    fn extend_le(self, out: &mut Vec<u8>);
}

macro_rules! element {
    ($($t:ty => $st:ident),* $(,)?) => {$(
        impl Element for $t {
            const SCALAR_TYPE: ScalarType = ScalarType::$st;

            fn from_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(&bytes[..std::mem::size_of::<$t>()]);
                <$t>::from_le_bytes(raw)
            }

            fn extend_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }
    )*};
}

element! {
    f32 => IeeeFloat32,
    f64 => IeeeFloat64,
    i8 => Sint8,
    i16 => Sint16,
    i32 => Sint32,
    i64 => Sint64,
    u8 => Uint8,
    u16 => Uint16,
    u32 => Uint32,
    u64 => Uint64,
}

/* ─────────────────────────── HostBuffer ─────────────────────────── */

/// Tableau hôte C-contigu, avant téléversement.
#[derive(Clone, PartialEq, Eq)]
pub struct HostBuffer {
    item_size: usize,
    format: Option<String>,
    dims: Vec<usize>,
    data: Bytes,
}

impl HostBuffer {
    /// Tableau d’un type scalaire connu ; la taille des données doit correspondre.
    pub fn new(scalar_type: ScalarType, dims: Vec<usize>, data: impl Into<Bytes>) -> VmResult<Self> {
        Self::raw(scalar_type.size(), scalar_type.host_format(), dims, data)
    }

    /// Tableau décrit librement (taille d’élément + format).
    pub fn raw(item_size: usize, format: Option<&str>, dims: Vec<usize>, data: impl Into<Bytes>) -> VmResult<Self> {
        let data = data.into();
        let expected = dims.iter().try_fold(item_size, |acc, d| acc.checked_mul(*d));
        if expected != Some(data.len()) {
            return Err(Status::invalid_argument(format!(
                "host buffer of {} bytes does not match dims {dims:?} with item size {item_size}",
                data.len()
            )));
        }
        Ok(Self { item_size, format: format.map(str::to_string), dims, data })
    }

    pub fn from_slice<T: Element>(dims: Vec<usize>, values: &[T]) -> VmResult<Self> {
        let mut data = Vec::with_capacity(values.len() * T::SCALAR_TYPE.size());
        for v in values {
            v.extend_le(&mut data);
        }
        Self::new(T::SCALAR_TYPE, dims, data)
    }

    pub const fn item_size(&self) -> usize {
        self.item_size
    }

    pub fn format(&self) -> Option<&str> {
        self.format.as_deref()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostBuffer({}{:?}, {} bytes)", self.format.as_deref().unwrap_or("?"), self.dims, self.data.len())
    }
}

/* ─────────────────────────── HostArray ─────────────────────────── */

/// Vue strided sans copie sur la mémoire mappée d’un buffer device.
#[derive(Clone)]
pub struct HostArray {
    scalar_type: ScalarType,
    memory: Arc<MappedMemory>,
}

impl HostArray {
    pub fn new(scalar_type: ScalarType, memory: MappedMemory) -> Self {
        Self { scalar_type, memory: Arc::new(memory) }
    }

    pub const fn scalar_type(&self) -> ScalarType {
        self.scalar_type
    }

    pub fn description(&self) -> &Description {
        self.memory.description()
    }

    pub fn dims(&self) -> &[usize] {
        &self.description().dims
    }

    pub fn strides(&self) -> &[usize] {
        &self.description().strides
    }

    pub fn format(&self) -> Option<&'static str> {
        self.description().format
    }

    pub fn element_count(&self) -> usize {
        self.description().element_count()
    }

    pub const fn memory(&self) -> &Arc<MappedMemory> {
        &self.memory
    }

    pub fn buffer(&self) -> &Arc<DeviceBuffer> {
        self.memory.buffer()
    }

    /// Octets de l’élément d’indice row-major `flat`, via les strides.
    pub fn element_bytes(&self, flat: usize) -> Option<&[u8]> {
        let d = self.description();
        if flat >= d.element_count() {
            return None;
        }
        let mut rest = flat;
        let mut offset = 0usize;
        for (dim, stride) in d.dims.iter().zip(&d.strides).rev() {
            offset += (rest % dim) * stride;
            rest /= dim;
        }
        self.memory.contents().get(offset..offset + d.element_size)
    }

    /// Copie typée des éléments ; `T` doit correspondre au type du tableau.
    pub fn to_vec<T: Element>(&self) -> VmResult<Vec<T>> {
        if T::SCALAR_TYPE != self.scalar_type {
            return Err(Status::invalid_argument(format!(
                "array holds {} elements, not {}",
                self.scalar_type,
                T::SCALAR_TYPE
            )));
        }
        (0..self.element_count())
            .map(|i| {
                self.element_bytes(i)
                    .map(T::from_le)
                    .ok_or_else(|| Status::out_of_range(format!("element {i} is outside the mapping")))
            })
            .collect()
    }
}

impl fmt::Debug for HostArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostArray({}{:?})", self.scalar_type, self.dims())
    }
}

/* ─────────────────────────── HostValue ─────────────────────────── */

/// Valeur côté hôte, en entrée ou en sortie d’un appel.
#[derive(Debug, Clone)]
pub enum HostValue {
    None,
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Buffer(HostBuffer),
    Array(HostArray),
}

impl HostValue {
    pub const fn as_array(&self) -> Option<&HostArray> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }
}

impl From<HostBuffer> for HostValue {
    fn from(b: HostBuffer) -> Self {
        Self::Buffer(b)
    }
}

impl From<i32> for HostValue {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<f32> for HostValue {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

/* ─────────────────────────── Factories ─────────────────────────── */

pub trait HostTypeFactory: Send + Sync {
    /// Convertit un buffer résultat en valeur hôte.
    fn create_immediate_ndarray(
        &self,
        _scalar_type: ScalarType,
        _dims: &[i32],
        _buffer: Arc<DeviceBuffer>,
    ) -> VmResult<HostValue> {
        Err(Status::unimplemented("CreateImmediateNdarray not implemented"))
    }
}

/// Factory de base, sans conversion de tableaux.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHostTypeFactory;

impl HostTypeFactory for DefaultHostTypeFactory {}

/// Mappe immédiatement le buffer et l’expose comme `HostArray`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NdarrayHostTypeFactory;

static NDARRAY_FACTORY: Lazy<Arc<NdarrayHostTypeFactory>> = Lazy::new(|| Arc::new(NdarrayHostTypeFactory));

impl NdarrayHostTypeFactory {
    /// Instance partagée du process.
    pub fn shared() -> Arc<dyn HostTypeFactory> {
        NDARRAY_FACTORY.clone()
    }
}

impl HostTypeFactory for NdarrayHostTypeFactory {
    fn create_immediate_ndarray(&self, scalar_type: ScalarType, dims: &[i32], buffer: Arc<DeviceBuffer>) -> VmResult<HostValue> {
        let description = Description::for_ndarray(scalar_type.code(), dims)?;
        let memory = buffer.map_read()?.with_description(description)?;
        Ok(HostValue::Array(HostArray::new(scalar_type, memory)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{BufferUsage, MemoryType};
    use proptest::prelude::*;
    use tessel_bytecode::abi::MAX_SCALAR_TYPE;
    use tessel_vm::StatusCode;

    fn device_buffer(bytes: &[u8]) -> Arc<DeviceBuffer> {
        let b = DeviceBuffer::allocate_heap(MemoryType::DEVICE_LOCAL | MemoryType::HOST_VISIBLE, BufferUsage::ALL, bytes.len());
        b.write_data(0, bytes).unwrap();
        b
    }

    #[test]
    fn for_ndarray_classifies_type_codes() {
        let d = Description::for_ndarray(ScalarType::Sint16.code(), &[2, 3]).unwrap();
        assert_eq!((d.element_size, d.format), (2, Some("h")));
        assert_eq!(d.strides, [6, 2]);

        let scalar = Description::for_ndarray(0, &[]).unwrap();
        assert!(scalar.strides.is_empty());
        assert_eq!(scalar.byte_span(), 4);

        let err = Description::for_ndarray(MAX_SCALAR_TYPE + 1, &[1]).unwrap_err();
        assert_eq!((err.code(), err.message()), (StatusCode::InvalidArgument, "Illegal ScalarType"));
        for half in [ScalarType::IeeeFloat16, ScalarType::GoogleBfloat16] {
            let err = Description::for_ndarray(half.code(), &[1]).unwrap_err();
            assert_eq!((err.code(), err.message()), (StatusCode::Unimplemented, "Unimplemented ScalarType"));
        }
    }

    #[test]
    fn default_factory_refuses() {
        let err = DefaultHostTypeFactory
            .create_immediate_ndarray(ScalarType::IeeeFloat32, &[1], device_buffer(&[0; 4]))
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::Unimplemented);
        assert_eq!(err.message(), "CreateImmediateNdarray not implemented");
    }

    #[test]
    fn ndarray_view_keeps_the_mapping_alive() {
        let values = HostBuffer::from_slice(vec![2, 2], &[1i32, 2, 3, 4]).unwrap();
        let buffer = device_buffer(values.data());
        let value = NdarrayHostTypeFactory
            .create_immediate_ndarray(ScalarType::Sint32, &[2, 2], Arc::clone(&buffer))
            .unwrap();
        let array = value.as_array().unwrap().clone();
        drop(value);
        assert_eq!(array.to_vec::<i32>().unwrap(), [1, 2, 3, 4]);
        assert_eq!(array.format(), Some("i"));
        assert!(array.to_vec::<f32>().is_err());
        assert_eq!((buffer.map_count(), buffer.unmap_count()), (1, 0));

        let second = array.clone();
        drop(array);
        assert_eq!(buffer.unmap_count(), 0);
        drop(second);
        assert_eq!(buffer.unmap_count(), 1);
        assert_eq!(Arc::strong_count(&buffer), 1);
    }

    #[test]
    fn host_buffer_checks_its_size() {
        assert!(HostBuffer::new(ScalarType::IeeeFloat64, vec![3], vec![0u8; 16]).is_err());
        let b = HostBuffer::from_slice(vec![3], &[1.0f64, 2.0, 3.0]).unwrap();
        assert_eq!((b.item_size(), b.format(), b.data().len()), (8, Some("d"), 24));
    }

    proptest! {
        #[test]
        fn strides_are_row_major(code in 0u32..=MAX_SCALAR_TYPE, dims in proptest::collection::vec(0i32..16, 0..5)) {
            let Some(st) = ScalarType::from_code(code) else { unreachable!() };
            match Description::for_ndarray(code, &dims) {
                Ok(d) => {
                    prop_assert_eq!(d.element_size, st.size());
                    if let Some(last) = d.strides.last() {
                        prop_assert_eq!(*last, d.element_size);
                    }
                    for i in 0..d.strides.len().saturating_sub(1) {
                        prop_assert_eq!(d.strides[i], d.strides[i + 1] * d.dims[i + 1]);
                    }
                }
                Err(e) => {
                    prop_assert!(st.host_format().is_none());
                    prop_assert_eq!(e.code(), StatusCode::Unimplemented);
                }
            }
        }

        #[test]
        fn out_of_table_codes_are_illegal(code in (MAX_SCALAR_TYPE + 1)..u32::MAX) {
            let e = Description::for_ndarray(code, &[1]).unwrap_err();
            prop_assert_eq!(e.code(), StatusCode::InvalidArgument);
        }
    }
}
