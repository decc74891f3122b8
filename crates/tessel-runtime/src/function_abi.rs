//! function_abi.rs — Convention d’appel hôte ↔ VM.
//!
//! Dérivée des attributs de réflexion d’une fonction :
//!   `fv` = version de l’ABI brute (seule `1` est connue)
//!   `f`  = signature manglée (voir `tessel_bytecode::abi`)
//!
//! La dérivation est pure. Le marshaling (`raw_pack_inputs`,
//! `allocate_results`, `raw_unpack_results`) alloue via le device lié.

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use tracing::debug;

use tessel_bytecode::abi::{signature_to_string, Description as Arg, RawSignature, ScalarType};
use tessel_vm::{Status, Variant, VariantList, VmFunction, VmRef, VmResult};

use crate::hal::{BufferUsage, DeviceBuffer, HalDevice, MemoryType};
use crate::host_types::{HostTypeFactory, HostValue};

/// Version d’ABI brute acceptée.
pub const RAW_ABI_VERSION: &str = "1";

pub struct FunctionAbi {
    device: HalDevice,
    factory: Arc<dyn HostTypeFactory>,
    mangled: String,
    signature: RawSignature,
}

impl FunctionAbi {
    /// Construit depuis une table clé → valeur.
    pub fn create(
        device: &HalDevice,
        factory: Arc<dyn HostTypeFactory>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> VmResult<Self> {
        let version = lookup("fv");
        let mangled = lookup("f").ok_or_else(|| Status::invalid_argument("No raw abi reflection metadata for function"))?;
        if version.as_deref() != Some(RAW_ABI_VERSION) {
            return Err(Status::invalid_argument("Unsupported raw function ABI version"));
        }
        let signature = RawSignature::parse(&mangled)
            .map_err(|e| Status::invalid_argument(format!("Error parsing raw ABI signature: {e} ('{mangled}')")))?;
        Ok(Self { device: device.clone(), factory, mangled, signature })
    }

    /// Variante à partir de paires (clé, valeur) ; première occurrence retenue.
    pub fn from_attrs(device: &HalDevice, factory: Arc<dyn HostTypeFactory>, attrs: &[(String, String)]) -> VmResult<Self> {
        Self::create(device, factory, |key| attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone()))
    }

    /// Énumère la réflexion de `function` jusqu’à épuisement.
    pub fn for_function(device: &HalDevice, factory: Arc<dyn HostTypeFactory>, function: &VmFunction) -> VmResult<Self> {
        let mut attrs: AHashMap<String, String> = AHashMap::new();
        for pair in function.reflection_attrs() {
            let (key, value) = pair?;
            attrs.entry(key).or_insert(value);
        }
        Self::create(device, factory, |key| attrs.get(key).cloned())
    }

    pub fn raw_signature(&self) -> &str {
        &self.mangled
    }

    pub fn inputs(&self) -> &[Arg] {
        &self.signature.inputs
    }

    pub fn results(&self) -> &[Arg] {
        &self.signature.results
    }

    pub fn raw_input_arity(&self) -> usize {
        self.signature.inputs.len()
    }

    pub fn raw_result_arity(&self) -> usize {
        self.signature.results.len()
    }

    /* ─────────────────────────── Pack ─────────────────────────── */

    /// Téléverse les arguments hôte dans des buffers `HOST_LOCAL | DEVICE_VISIBLE`.
    pub fn raw_pack_inputs(&self, args: &[HostValue]) -> VmResult<VariantList> {
        if args.len() != self.raw_input_arity() {
            return Err(Status::invalid_argument(format!(
                "Mismatched pack arity (received: {}, expected: {})",
                args.len(),
                self.raw_input_arity()
            )));
        }
        let mut list = VariantList::new(args.len());
        for (desc, arg) in self.signature.inputs.iter().zip(args) {
            let packed = match desc {
                Arg::Buffer { scalar_type, dims } => self.pack_buffer(*scalar_type, dims, desc, arg)?,
                Arg::Scalar { scalar_type } => pack_scalar(*scalar_type, desc, arg)?,
                Arg::RefObject => return Err(Status::unimplemented("Ref objects not yet supported")),
            };
            list.push(packed)?;
        }
        debug!(target: "tessel-runtime", abi = %self, inputs = %list, "arguments empaquetés");
        Ok(list)
    }

    fn pack_buffer(&self, scalar_type: ScalarType, dims: &[i32], desc: &Arg, arg: &HostValue) -> VmResult<Variant> {
        let (item_size, format, arg_dims, bytes) = match arg {
            HostValue::Buffer(b) => (b.item_size(), b.format().map(str::to_string), b.dims().to_vec(), b.data().to_vec()),
            HostValue::Array(a) => {
                let bytes = (0..a.element_count()).filter_map(|i| a.element_bytes(i)).flatten().copied().collect();
                (a.description().element_size, a.format().map(str::to_string), a.dims().to_vec(), bytes)
            }
            other => {
                return Err(Status::invalid_argument(format!("expected a buffer for {desc}, got {other:?}")));
            }
        };
        let mismatch = |what: &str, received: &dyn fmt::Display, expected: &dyn fmt::Display| {
            Status::invalid_argument(format!(
                "Mismatched buffer {what} (received: {received}, expected: {expected}): For argument = {arg:?} (expected {desc})"
            ))
        };

        if arg_dims.len() != dims.len() {
            return Err(mismatch("rank", &arg_dims.len(), &dims.len()));
        }
        if item_size != scalar_type.size() {
            return Err(mismatch("item size", &item_size, &scalar_type.size()));
        }
        if let Some(expected) = scalar_type.host_format() {
            let received = format.as_deref().unwrap_or("?");
            if received != expected {
                return Err(mismatch("format", &received, &expected));
            }
        }
        let mut dynamic = 0;
        for (received, expected) in arg_dims.iter().zip(dims) {
            match usize::try_from(*expected) {
                Err(_) => dynamic += 1,
                Ok(e) if e != *received => return Err(mismatch("dim", received, expected)),
                Ok(_) => {}
            }
        }
        if dynamic > 0 {
            return Err(Status::unimplemented("Dynamic argument dimensions not implemented"));
        }

        let buffer = self.device.allocator().allocate_buffer(
            MemoryType::HOST_LOCAL | MemoryType::DEVICE_VISIBLE,
            BufferUsage::ALL,
            bytes.len(),
        )?;
        buffer.write_data(0, &bytes)?;
        Ok(Variant::Ref(VmRef::new(buffer)?))
    }

    /* ─────────────────────────── Résultats ─────────────────────────── */

    /// Liste de résultats de capacité = arité. En mode statique, préalloue
    /// les buffers de forme connue ; une forme dynamique laisse un emplacement vide.
    pub fn allocate_results(&self, inputs: &VariantList, static_alloc: bool) -> VmResult<VariantList> {
        if inputs.len() != self.raw_input_arity() {
            return Err(Status::invalid_argument(format!(
                "Mismatched AllocateResults() input arity (received: {}, expected: {})",
                inputs.len(),
                self.raw_input_arity()
            )));
        }
        let mut list = VariantList::new(self.raw_result_arity());
        if !static_alloc {
            return Ok(list);
        }
        for desc in &self.signature.results {
            match desc {
                Arg::Buffer { scalar_type, dims } => {
                    let Some(size) = static_byte_size(*scalar_type, dims) else {
                        list.push(Variant::Empty)?;
                        continue;
                    };
                    let buffer = self.device.allocator().allocate_buffer(
                        MemoryType::DEVICE_LOCAL | MemoryType::HOST_VISIBLE,
                        BufferUsage::ALL,
                        size,
                    )?;
                    list.push(Variant::Ref(VmRef::new(buffer)?))?;
                }
                Arg::Scalar { .. } => list.push(Variant::Empty)?,
                Arg::RefObject => return Err(Status::unimplemented("Ref objects not yet supported")),
            }
        }
        Ok(list)
    }

    /// Convertit les résultats via la factory d’hôte.
    pub fn raw_unpack_results(&self, results: &VariantList) -> VmResult<Vec<HostValue>> {
        if results.len() != self.raw_result_arity() {
            return Err(Status::invalid_argument(format!(
                "Mismatched RawUnpack() result arity (received: {}, expected: {})",
                results.len(),
                self.raw_result_arity()
            )));
        }
        let mut out = Vec::with_capacity(results.len());
        for (desc, value) in self.signature.results.iter().zip(results) {
            out.push(match desc {
                Arg::Buffer { scalar_type, dims } => {
                    let buffer = value
                        .as_vm_ref()
                        .and_then(VmRef::downcast::<DeviceBuffer>)
                        .ok_or_else(|| Status::invalid_argument("Could not deref result buffer (wrong type?)"))?;
                    let dims = resolve_dims(*scalar_type, dims, buffer.byte_length())?;
                    self.factory.create_immediate_ndarray(*scalar_type, &dims, buffer)?
                }
                Arg::Scalar { scalar_type } => unpack_scalar(*scalar_type, value)?,
                Arg::RefObject => return Err(Status::unimplemented("Ref objects not yet supported")),
            });
        }
        Ok(out)
    }
}

impl fmt::Display for FunctionAbi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match signature_to_string(&self.mangled) {
            Some(s) => write!(f, "<FunctionAbi {s}>"),
            None => f.write_str("<FunctionAbi NO_DEBUG_INFO>"),
        }
    }
}

impl fmt::Debug for FunctionAbi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/* ─────────────────────────── Scalaires ─────────────────────────── */

fn pack_scalar(scalar_type: ScalarType, desc: &Arg, arg: &HostValue) -> VmResult<Variant> {
    match (scalar_type, arg) {
        (ScalarType::Sint32, HostValue::I32(v)) => Ok(Variant::I32(*v)),
        (ScalarType::Sint64, HostValue::I64(v)) => Ok(Variant::I64(*v)),
        (ScalarType::IeeeFloat32, HostValue::F32(v)) => Ok(Variant::F32(*v)),
        (ScalarType::IeeeFloat64, HostValue::F64(v)) => Ok(Variant::F64(*v)),
        (ScalarType::Sint32 | ScalarType::Sint64 | ScalarType::IeeeFloat32 | ScalarType::IeeeFloat64, other) => {
            Err(Status::invalid_argument(format!("Mismatched scalar argument: expected {desc}, got {other:?}")))
        }
        _ => Err(Status::unimplemented(format!("Unsupported signature scalar type: {desc}"))),
    }
}

fn unpack_scalar(scalar_type: ScalarType, value: &Variant) -> VmResult<HostValue> {
    match (scalar_type, value) {
        (ScalarType::Sint32, Variant::I32(v)) => Ok(HostValue::I32(*v)),
        (ScalarType::Sint64, Variant::I64(v)) => Ok(HostValue::I64(*v)),
        (ScalarType::IeeeFloat32, Variant::F32(v)) => Ok(HostValue::F32(*v)),
        (ScalarType::IeeeFloat64, Variant::F64(v)) => Ok(HostValue::F64(*v)),
        (st, other) => Err(Status::invalid_argument(format!("result of type {st} cannot be read from {other}"))),
    }
}

/* ─────────────────────────── Formes ─────────────────────────── */

/// Taille en octets d’une forme entièrement statique.
fn static_byte_size(scalar_type: ScalarType, dims: &[i32]) -> Option<usize> {
    dims.iter().try_fold(scalar_type.size(), |acc, d| usize::try_from(*d).ok().and_then(|d| acc.checked_mul(d)))
}

/// Remplace l’unique dimension dynamique par celle déduite de `byte_length`.
fn resolve_dims(scalar_type: ScalarType, dims: &[i32], byte_length: usize) -> VmResult<Vec<i32>> {
    let dynamic: Vec<usize> = dims.iter().enumerate().filter(|(_, d)| **d < 0).map(|(i, _)| i).collect();
    match dynamic.as_slice() {
        [] => Ok(dims.to_vec()),
        [index] => {
            let known = dims
                .iter()
                .filter(|d| **d >= 0)
                .try_fold(scalar_type.size(), |acc, d| usize::try_from(*d).ok().and_then(|d| acc.checked_mul(d)))
                .filter(|k| *k > 0)
                .ok_or_else(|| Status::invalid_argument("cannot infer a dynamic dimension next to a zero-sized one"))?;
            if byte_length % known != 0 {
                return Err(Status::invalid_argument(format!(
                    "result of {byte_length} bytes is not a whole number of {known} byte rows"
                )));
            }
            let inferred = i32::try_from(byte_length / known)
                .map_err(|_| Status::out_of_range("inferred dimension does not fit in i32"))?;
            let mut resolved = dims.to_vec();
            resolved[*index] = inferred;
            Ok(resolved)
        }
        _ => Err(Status::unimplemented("results with several dynamic dimensions are not supported")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::HalDriver;
    use crate::host_types::{DefaultHostTypeFactory, HostBuffer, NdarrayHostTypeFactory};
    use pretty_assertions::assert_eq;
    use tessel_vm::StatusCode;

    const SIG: &str = "I15!B11!d10d128d64R15!B11!t6d32d8d64";

    fn device() -> HalDevice {
        HalDriver::create("interpreter").unwrap().create_default_device().unwrap()
    }

    fn attrs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    fn abi(sig: &str) -> FunctionAbi {
        FunctionAbi::from_attrs(&device(), NdarrayHostTypeFactory::shared(), &attrs(&[("fv", "1"), ("f", sig)])).unwrap()
    }

    #[test]
    fn construction_errors() {
        let d = device();
        let f = || NdarrayHostTypeFactory::shared();
        let err = FunctionAbi::from_attrs(&d, f(), &attrs(&[("fv", "1")])).unwrap_err();
        assert_eq!((err.code(), err.message()), (StatusCode::InvalidArgument, "No raw abi reflection metadata for function"));
        let err = FunctionAbi::from_attrs(&d, f(), &attrs(&[("fv", "2"), ("f", SIG)])).unwrap_err();
        assert_eq!(err.message(), "Unsupported raw function ABI version");
        let err = FunctionAbi::from_attrs(&d, f(), &attrs(&[("fv", "1"), ("f", "I3!Bx")])).unwrap_err();
        assert!(err.message().starts_with("Error parsing raw ABI signature: "), "{}", err.message());
    }

    #[test]
    fn debug_rendering() {
        let abi = abi(SIG);
        assert_eq!(abi.to_string(), "<FunctionAbi (Buffer<float32[10x128x64]>) -> (Buffer<sint32[32x8x64]>)>");
        assert_eq!((abi.raw_input_arity(), abi.raw_result_arity()), (1, 1));
    }

    #[test]
    fn pack_checks_in_order() {
        let abi = abi("I8!B5!d2d3R1!");
        let err = abi.raw_pack_inputs(&[]).unwrap_err();
        assert!(err.message().starts_with("Mismatched pack arity"));

        let rank = HostBuffer::from_slice(vec![6], &[0f32; 6]).unwrap();
        let err = abi.raw_pack_inputs(&[rank.into()]).unwrap_err();
        assert!(err.message().starts_with("Mismatched buffer rank (received: 1, expected: 2)"), "{}", err.message());

        let wide = HostBuffer::from_slice(vec![2, 3], &[0f64; 6]).unwrap();
        let err = abi.raw_pack_inputs(&[wide.into()]).unwrap_err();
        assert!(err.message().starts_with("Mismatched buffer item size (received: 8, expected: 4)"));

        let ints = HostBuffer::from_slice(vec![2, 3], &[0i32; 6]).unwrap();
        let err = abi.raw_pack_inputs(&[ints.into()]).unwrap_err();
        assert!(err.message().starts_with("Mismatched buffer format (received: i, expected: f)"));

        let dims = HostBuffer::from_slice(vec![3, 2], &[0f32; 6]).unwrap();
        let err = abi.raw_pack_inputs(&[dims.into()]).unwrap_err();
        assert!(err.message().starts_with("Mismatched buffer dim (received: 3, expected: 2)"));

        let ok = HostBuffer::from_slice(vec![2, 3], &[1f32; 6]).unwrap();
        let packed = abi.raw_pack_inputs(&[ok.into()]).unwrap();
        assert_eq!(packed.to_string(), "<VmVariantList(1): [HalBuffer(24)]>");
    }

    #[test]
    fn dynamic_inputs_are_unimplemented() {
        let abi = abi("I7!B4!d-1R1!");
        let b = HostBuffer::from_slice(vec![4], &[0f32; 4]).unwrap();
        let err = abi.raw_pack_inputs(&[b.into()]).unwrap_err();
        assert_eq!(err.code(), StatusCode::Unimplemented);
    }

    #[test]
    fn static_allocation_leaves_dynamic_slots_empty() {
        let abi = abi("I1!R16!B4!d-1B7!t6d2d2");
        let inputs = VariantList::new(0);
        let dynamic = abi.allocate_results(&inputs, false).unwrap();
        assert_eq!((dynamic.len(), dynamic.capacity()), (0, 2));

        let allocated = abi.allocate_results(&inputs, true).unwrap();
        assert_eq!(allocated.to_string(), "<VmVariantList(2): [None, HalBuffer(16)]>");
        assert!(abi.allocate_results(&VariantList::from_variants(vec![Variant::I32(1)]), true).is_err());
    }

    #[test]
    fn unpack_infers_one_dynamic_dim() {
        let abi = abi("I1!R9!B6!d-1d2");
        let buffer = DeviceBuffer::allocate_heap(MemoryType::DEVICE_LOCAL | MemoryType::HOST_VISIBLE, BufferUsage::ALL, 24);
        let results = VariantList::from_variants(vec![Variant::Ref(VmRef::new(buffer).unwrap())]);
        let values = abi.raw_unpack_results(&results).unwrap();
        assert_eq!(values[0].as_array().unwrap().dims(), [3, 2]);

        let wrong = VariantList::from_variants(vec![Variant::I32(3)]);
        let err = abi.raw_unpack_results(&wrong).unwrap_err();
        assert_eq!(err.message(), "Could not deref result buffer (wrong type?)");
    }

    #[test]
    fn default_factory_cannot_unpack_buffers() {
        let abi = FunctionAbi::from_attrs(&device(), Arc::new(DefaultHostTypeFactory), &attrs(&[("fv", "1"), ("f", "I1!R6!B3!d1")]))
            .unwrap();
        let buffer = DeviceBuffer::allocate_heap(MemoryType::HOST_LOCAL, BufferUsage::ALL, 4);
        let results = VariantList::from_variants(vec![Variant::Ref(VmRef::new(buffer).unwrap())]);
        assert_eq!(abi.raw_unpack_results(&results).unwrap_err().code(), StatusCode::Unimplemented);
    }

    #[test]
    fn scalars_round_trip() {
        let abi = abi("I6!S3!t6R6!S3!t6");
        let packed = abi.raw_pack_inputs(&[HostValue::I32(7)]).unwrap();
        assert_eq!(packed.as_slice()[0].as_i32(), Some(7));
        assert!(abi.raw_pack_inputs(&[HostValue::F32(7.0)]).is_err());
        let values = abi.raw_unpack_results(&VariantList::from_variants(vec![Variant::I32(9)])).unwrap();
        assert!(matches!(values[0], HostValue::I32(9)));
    }
}
