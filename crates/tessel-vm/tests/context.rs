use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tessel_bytecode::{
    BinaryOp, BytecodeModule, Callee, ExportDef, FunctionDef, FunctionSignature, ModuleFlags, Op, ScalarKind,
    SourceLoc, ValueKind,
};
use tessel_vm::{
    Linkage, ModuleBuffer, NativeModuleBuilder, RoByteBuffer, StatusCode, Variant, VariantList, VmContext, VmInstance,
    VmModule, VmRef,
};

fn math_module() -> VmModule {
    NativeModuleBuilder::new("math")
        .export("twice", FunctionSignature::new([ValueKind::I32], [ValueKind::I32]), |args| {
            let v = args.first().and_then(Variant::as_i32).unwrap_or_default();
            Ok(vec![Variant::I32(v.wrapping_mul(2))])
        })
        .build()
}

/// `calc.scale(a, b) = math.twice(a) * b` ; `calc.ratio(a, b) = a / b`.
fn calc_bytes() -> Vec<u8> {
    let mut m = BytecodeModule::new("calc", ModuleFlags::default());
    let twice = m.intern_import("math.twice", FunctionSignature::new([ValueKind::I32], [ValueKind::I32]));
    let sig = FunctionSignature::new([ValueKind::I32, ValueKind::I32], [ValueKind::I32]);
    m.functions.push(FunctionDef {
        name: Some("scale".into()),
        signature: sig.clone(),
        register_count: 4,
        ops: vec![
            Op::Call { callee: Callee::Import(twice), args: vec![0], results: vec![2] },
            Op::Trace { tag: "scale".into(), args: vec![2, 1] },
            Op::Binary { op: BinaryOp::Mul, kind: ScalarKind::I32, dst: 3, lhs: 2, rhs: 1 },
            Op::Return { values: vec![3] },
        ],
        reflection: Vec::new(),
        source_map: Vec::new(),
    });
    m.functions.push(FunctionDef {
        name: Some("ratio".into()),
        signature: sig,
        register_count: 3,
        ops: vec![
            Op::Binary { op: BinaryOp::Div, kind: ScalarKind::I32, dst: 2, lhs: 0, rhs: 1 },
            Op::Return { values: vec![2] },
        ],
        reflection: vec![("fv".into(), "1".into())],
        source_map: vec![SourceLoc { pc: 0, location: "calc.tsl:7:10".into() }],
    });
    m.exports.push(ExportDef { name: "scale".into(), function: 0 });
    m.exports.push(ExportDef { name: "ratio".into(), function: 1 });
    m.to_bytes().unwrap()
}

fn calc_module() -> VmModule {
    VmModule::from_bytes(ModuleBuffer::new(calc_bytes())).unwrap()
}

fn inputs(values: &[i32]) -> VariantList {
    let mut list = VariantList::new(values.len());
    for v in values {
        list.push(*v).unwrap();
    }
    list
}

#[test]
fn closed_context_rejects_registration() {
    let instance = VmInstance::create();
    let ctx = VmContext::create_with_modules(&instance, &[math_module(), calc_module()]).unwrap();
    assert!(ctx.is_static());
    let err = ctx.register_modules(&[math_module()]).unwrap_err();
    assert_eq!(err.code(), StatusCode::FailedPrecondition);
    assert_eq!(ctx.modules().len(), 2);
}

#[test]
fn open_context_accepts_and_resolves() {
    let instance = VmInstance::create();
    let ctx = VmContext::create(&instance).unwrap();
    ctx.register_modules(&[math_module(), calc_module()]).unwrap();
    assert!(ctx.resolve_function("math.twice").is_some());
    assert!(ctx.resolve_function("calc.scale").is_some());
    assert!(ctx.resolve_function("calc.missing").is_none());

    let other = VmContext::create(&instance).unwrap();
    assert!(other.context_id() > ctx.context_id());
}

#[test]
fn invoke_through_an_import() {
    let instance = VmInstance::create();
    let ctx = VmContext::create(&instance).unwrap();
    let calc = calc_module();
    ctx.register_modules(&[math_module(), calc.clone()]).unwrap();

    let f = calc.lookup_function("scale", Linkage::Export).unwrap();
    let mut outputs = VariantList::new(1);
    ctx.invoke(&f, &inputs(&[3, 5]), &mut outputs).unwrap();
    assert_eq!(outputs.to_string(), "<VmVariantList(1): [30]>");

    let mut again = VariantList::new(1);
    ctx.invoke(&f, &inputs(&[3, 5]), &mut again).unwrap();
    assert_eq!(again.to_string(), outputs.to_string());
}

#[test]
fn arity_mismatch_leaves_outputs_untouched() {
    let instance = VmInstance::create();
    let ctx = VmContext::create(&instance).unwrap();
    let calc = calc_module();
    ctx.register_modules(&[math_module(), calc.clone()]).unwrap();

    let f = calc.lookup_function("scale", Linkage::Export).unwrap();
    let mut outputs = VariantList::new(2);
    outputs.push(42).unwrap();
    let err = ctx.invoke(&f, &inputs(&[1]), &mut outputs).unwrap_err();
    assert_eq!(err.code(), StatusCode::InvalidArgument);
    assert_eq!(outputs.to_string(), "<VmVariantList(1): [42]>");
}

#[test]
fn unresolved_import_fails_the_whole_batch() {
    let instance = VmInstance::create();
    let ctx = VmContext::create(&instance).unwrap();
    let err = ctx.register_modules(&[calc_module()]).unwrap_err();
    assert_eq!(err.code(), StatusCode::NotFound);
    assert!(err.message().contains("math.twice"), "{err}");
    assert!(ctx.modules().is_empty());
}

#[test]
fn runtime_failure_carries_the_source_location() {
    let instance = VmInstance::create();
    let ctx = VmContext::create(&instance).unwrap();
    let calc = calc_module();
    ctx.register_modules(&[math_module(), calc.clone()]).unwrap();

    let f = calc.lookup_function("ratio", Linkage::Export).unwrap();
    assert_eq!(f.reflection_attr("fv").as_deref(), Some("1"));
    let mut outputs = VariantList::new(1);
    let err = ctx.invoke(&f, &inputs(&[1, 0]), &mut outputs).unwrap_err();
    assert_eq!(err.code(), StatusCode::InvalidArgument);
    assert_eq!(err.message(), "integer division by zero (in @ratio at calc.tsl:7:10)");
    assert!(outputs.is_empty());
}

#[test]
fn module_buffer_released_once_after_last_holder() {
    let released = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&released);
    let buffer = ModuleBuffer::with_release(calc_bytes(), move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let module = VmModule::from_bytes(buffer).unwrap();
    let instance = VmInstance::create();
    let ctx = VmContext::create_with_modules(&instance, &[math_module(), module.clone()]).unwrap();

    drop(module);
    assert_eq!(released.load(Ordering::SeqCst), 0);
    drop(ctx);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn contexts_share_the_instance_type_registry() {
    let instance = VmInstance::create();
    assert_eq!(instance.ro_byte_buffer_type(), VmInstance::create().ro_byte_buffer_type());

    let ctx = VmContext::create(&instance).unwrap();
    let rodata = VmRef::new(Arc::new(RoByteBuffer::new(bytes::Bytes::from_static(&[1, 2])))).unwrap();
    assert_eq!(rodata.ref_type(), ctx.instance().ro_byte_buffer_type());
}
