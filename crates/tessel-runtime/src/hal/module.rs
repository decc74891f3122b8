//! hal/module.rs — Module VM natif `hal`, adossé à un device.
//!
//! Sert les imports émis par le compilateur (`tessel_bytecode::hal_imports`) :
//! matérialisation des constantes rodata et noyaux élémentaires. Les
//! résultats sont de nouveaux buffers `DEVICE_LOCAL | HOST_VISIBLE`.

use std::sync::Arc;

use tessel_bytecode::hal_imports::{self, BYTE_LENGTH, ELEMENTWISE_BINARY, ELEMENTWISE_UNARY, FROM_RODATA, HAL_MODULE};
use tessel_bytecode::{BinaryOp, ScalarKind, ScalarType, UnaryOp};
use tessel_vm::{NativeModuleBuilder, RoByteBuffer, Status, Variant, VmModule, VmRef, VmResult};
use tracing::debug;

use super::buffer::register_types;
use super::{BufferUsage, DeviceBuffer, HalDevice, MemoryType};
use crate::host_types::Element;

/// Construit le module `hal` pour `device` (enregistre `hal.buffer`).
pub fn create_hal_module(device: &HalDevice) -> VmResult<VmModule> {
    register_types()?;
    let (d1, d2, d3) = (device.clone(), device.clone(), device.clone());
    let module = NativeModuleBuilder::new(HAL_MODULE)
        .export(FROM_RODATA, hal_imports::from_rodata_signature(), move |args| from_rodata(&d1, args))
        .export(ELEMENTWISE_BINARY, hal_imports::elementwise_binary_signature(), move |args| {
            elementwise_binary(&d2, args)
        })
        .export(ELEMENTWISE_UNARY, hal_imports::elementwise_unary_signature(), move |args| {
            elementwise_unary(&d3, args)
        })
        .export(BYTE_LENGTH, hal_imports::byte_length_signature(), |args| {
            let buffer = buffer_arg(args, 0)?;
            let len = i32::try_from(buffer.byte_length())
                .map_err(|_| Status::out_of_range(format!("buffer {} is too large for i32", buffer.id())))?;
            Ok(vec![Variant::I32(len)])
        })
        .build();
    debug!(target: "tessel-runtime", device = %device.name(), "module hal créé");
    Ok(module)
}

/* ─────────────────────────── Noyaux ─────────────────────────── */

fn from_rodata(device: &HalDevice, args: &[Variant]) -> VmResult<Vec<Variant>> {
    let kind = kind_arg(args, 0)?;
    let rodata = args
        .get(1)
        .and_then(Variant::as_vm_ref)
        .and_then(|r| r.downcast::<RoByteBuffer>())
        .ok_or_else(|| Status::invalid_argument("argument 1 is not a vm.ro_byte_buffer"))?;
    if rodata.len() % kind.byte_size() != 0 {
        return Err(Status::invalid_argument(format!(
            "rodata of {} bytes is not a whole number of {} elements",
            rodata.len(),
            kind.mnemonic()
        )));
    }
    result(device, rodata.as_slice())
}

fn elementwise_binary(device: &HalDevice, args: &[Variant]) -> VmResult<Vec<Variant>> {
    let op = i32_arg(args, 0).and_then(|c| {
        BinaryOp::from_code(c).ok_or_else(|| Status::invalid_argument(format!("unknown binary op code {c}")))
    })?;
    let kind = kind_arg(args, 1)?;
    let (lhs, rhs) = (buffer_arg(args, 2)?, buffer_arg(args, 3)?);
    if lhs.byte_length() != rhs.byte_length() {
        return Err(Status::invalid_argument(format!(
            "operand sizes differ: {} vs {} bytes",
            lhs.byte_length(),
            rhs.byte_length()
        )));
    }
    let a = lhs.read_data(0, lhs.byte_length())?;
    let b = rhs.read_data(0, rhs.byte_length())?;
    let out = match kind {
        ScalarKind::I32 => zip_map::<i32>(&a, &b, |x, y| op.apply_i32(x, y)),
        ScalarKind::I64 => zip_map::<i64>(&a, &b, |x, y| op.apply_i64(x, y)),
        ScalarKind::F32 => zip_map::<f32>(&a, &b, |x, y| Some(op.apply_f32(x, y))),
        ScalarKind::F64 => zip_map::<f64>(&a, &b, |x, y| Some(op.apply_f64(x, y))),
    }?;
    result(device, &out)
}

fn elementwise_unary(device: &HalDevice, args: &[Variant]) -> VmResult<Vec<Variant>> {
    let op = i32_arg(args, 0).and_then(|c| {
        UnaryOp::from_code(c).ok_or_else(|| Status::invalid_argument(format!("unknown unary op code {c}")))
    })?;
    let kind = kind_arg(args, 1)?;
    let src = buffer_arg(args, 2)?;
    let a = src.read_data(0, src.byte_length())?;
    let out = match kind {
        ScalarKind::I32 => map::<i32>(&a, |x| op.apply_i32(x)),
        ScalarKind::I64 => map::<i64>(&a, |x| op.apply_i64(x)),
        ScalarKind::F32 => map::<f32>(&a, |x| op.apply_f32(x)),
        ScalarKind::F64 => map::<f64>(&a, |x| op.apply_f64(x)),
    }?;
    result(device, &out)
}

fn check_elements<T: Element>(bytes: &[u8]) -> VmResult<usize> {
    let size = T::SCALAR_TYPE.size();
    if bytes.len() % size != 0 {
        return Err(Status::invalid_argument(format!(
            "buffer length {} is not a multiple of the {} element size {size}",
            bytes.len(),
            T::SCALAR_TYPE.name()
        )));
    }
    Ok(size)
}

fn zip_map<T: Element>(a: &[u8], b: &[u8], f: impl Fn(T, T) -> Option<T>) -> VmResult<Vec<u8>> {
    let size = check_elements::<T>(a)?;
    check_elements::<T>(b)?;
    let mut out = Vec::with_capacity(a.len());
    for (x, y) in a.chunks_exact(size).zip(b.chunks_exact(size)) {
        f(T::from_le(x), T::from_le(y))
            .ok_or_else(|| Status::invalid_argument("integer division by zero"))?
            .extend_le(&mut out);
    }
    Ok(out)
}

fn map<T: Element>(a: &[u8], f: impl Fn(T) -> T) -> VmResult<Vec<u8>> {
    let size = check_elements::<T>(a)?;
    let mut out = Vec::with_capacity(a.len());
    for x in a.chunks_exact(size) {
        f(T::from_le(x)).extend_le(&mut out);
    }
    Ok(out)
}

fn result(device: &HalDevice, bytes: &[u8]) -> VmResult<Vec<Variant>> {
    let buffer = device.allocator().allocate_buffer(
        MemoryType::DEVICE_LOCAL | MemoryType::HOST_VISIBLE,
        BufferUsage::ALL | BufferUsage::CONSTANT,
        bytes.len(),
    )?;
    buffer.write_data(0, bytes)?;
    Ok(vec![Variant::Ref(VmRef::new(buffer)?)])
}

/* ─────────────────────────── Arguments ─────────────────────────── */

fn i32_arg(args: &[Variant], i: usize) -> VmResult<i32> {
    args.get(i).and_then(Variant::as_i32).ok_or_else(|| Status::invalid_argument(format!("argument {i} is not an i32")))
}

fn kind_arg(args: &[Variant], i: usize) -> VmResult<ScalarKind> {
    let code = i32_arg(args, i)?;
    u32::try_from(code)
        .ok()
        .and_then(ScalarType::from_code)
        .and_then(ScalarKind::from_scalar_type)
        .ok_or_else(|| Status::invalid_argument(format!("element type code {code} is not supported by the hal module")))
}

fn buffer_arg(args: &[Variant], i: usize) -> VmResult<Arc<DeviceBuffer>> {
    args.get(i)
        .and_then(Variant::as_vm_ref)
        .and_then(|r| r.downcast::<DeviceBuffer>())
        .ok_or_else(|| Status::invalid_argument(format!("argument {i} is not a hal.buffer")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::HalDriver;
    use crate::host_types::HostBuffer;
    use bytes::Bytes;
    use tessel_vm::{Linkage, StatusCode, VariantList, VmContext, VmInstance};

    fn setup() -> (HalDevice, VmContext) {
        let device = HalDriver::create("interpreter").unwrap().create_default_device().unwrap();
        let hal = create_hal_module(&device).unwrap();
        let ctx = VmContext::create_with_modules(&VmInstance::create(), &[hal]).unwrap();
        (device, ctx)
    }

    fn f32_buffer(device: &HalDevice, values: &[f32]) -> Variant {
        let host = HostBuffer::from_slice(vec![values.len()], values).unwrap();
        let buffer = device.allocator().allocate_buffer(MemoryType::HOST_LOCAL, BufferUsage::ALL, host.data().len()).unwrap();
        buffer.write_data(0, host.data()).unwrap();
        Variant::Ref(VmRef::new(buffer).unwrap())
    }

    fn call(ctx: &VmContext, name: &str, args: Vec<Variant>) -> tessel_vm::VmResult<VariantList> {
        let f = ctx.resolve_function(&format!("hal.{name}")).unwrap();
        let mut out = VariantList::new(1);
        ctx.invoke(&f, &VariantList::from_variants(args), &mut out)?;
        Ok(out)
    }

    fn read_f32(v: &Variant) -> Vec<f32> {
        let b = v.as_vm_ref().and_then(|r| r.downcast::<DeviceBuffer>()).unwrap();
        b.read_data(0, b.byte_length()).unwrap().chunks_exact(4).map(f32::from_le).collect()
    }

    #[test]
    fn exports_match_compiler_imports() {
        let (_, ctx) = setup();
        let modules = ctx.modules();
        let hal = &modules[0];
        for name in [FROM_RODATA, ELEMENTWISE_BINARY, ELEMENTWISE_UNARY, BYTE_LENGTH] {
            assert!(hal.lookup_function(name, Linkage::Export).is_some(), "{name}");
        }
    }

    #[test]
    fn binary_and_unary_kernels() {
        let (device, ctx) = setup();
        let code = ScalarType::IeeeFloat32.code() as i32;
        let a = f32_buffer(&device, &[1.0, 2.0, 3.0]);
        let b = f32_buffer(&device, &[4.0, 5.0, 6.0]);
        let out = call(&ctx, ELEMENTWISE_BINARY, vec![BinaryOp::Mul.code().into(), code.into(), a.clone(), b]).unwrap();
        assert_eq!(read_f32(&out.as_slice()[0]), [4.0, 10.0, 18.0]);

        let out = call(&ctx, ELEMENTWISE_UNARY, vec![UnaryOp::Neg.code().into(), code.into(), a.clone()]).unwrap();
        assert_eq!(read_f32(&out.as_slice()[0]), [-1.0, -2.0, -3.0]);

        let out = call(&ctx, BYTE_LENGTH, vec![a]).unwrap();
        assert_eq!(out.as_slice()[0].as_i32(), Some(12));
    }

    #[test]
    fn rodata_is_copied_into_a_device_buffer() {
        let (_, ctx) = setup();
        let ro = VmRef::new(Arc::new(RoByteBuffer::new(Bytes::from(2.5f32.to_le_bytes().to_vec())))).unwrap();
        let out = call(&ctx, FROM_RODATA, vec![0.into(), Variant::Ref(ro)]).unwrap();
        assert_eq!(read_f32(&out.as_slice()[0]), [2.5]);
        assert_eq!(out.to_string(), "<VmVariantList(1): [HalBuffer(4)]>");
    }

    #[test]
    fn kernel_errors_keep_their_status() {
        let (device, ctx) = setup();
        let i32_code = ScalarType::Sint32.code() as i32;
        let a = f32_buffer(&device, &[1.0]);
        let b = f32_buffer(&device, &[0.0]);
        let err = call(&ctx, ELEMENTWISE_BINARY, vec![BinaryOp::Div.code().into(), i32_code.into(), a.clone(), b]).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        assert!(err.message().contains("integer division by zero"));

        let short = f32_buffer(&device, &[1.0, 2.0]);
        let err = call(&ctx, ELEMENTWISE_BINARY, vec![0.into(), 0.into(), a, short]).unwrap_err();
        assert!(err.message().contains("operand sizes differ"));
    }

    #[test]
    fn partial_elements_are_rejected() {
        let (device, ctx) = setup();
        let i64_code = ScalarType::Sint64.code() as i32;
        let odd = f32_buffer(&device, &[1.0, 2.0, 3.0]);
        let err = call(&ctx, ELEMENTWISE_UNARY, vec![UnaryOp::Neg.code().into(), i64_code.into(), odd.clone()]).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        assert!(err.message().starts_with("buffer length 12 is not a multiple of the"), "{}", err.message());

        let err = call(&ctx, ELEMENTWISE_BINARY, vec![BinaryOp::Add.code().into(), i64_code.into(), odd.clone(), odd]).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        assert!(err.message().ends_with("element size 8"), "{}", err.message());
    }
}
