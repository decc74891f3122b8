//! backend/vm.rs — Abaissement final IR → `BytecodeModule`.
//!
//! - Registres : paramètres d’abord, puis résultats des ops dans l’ordre ;
//!   les temporaires (codes d’opérateur, rodata) viennent après.
//! - Tenseurs : appels des imports `hal.buffer.*` (convention dans
//!   `tessel_bytecode::hal_imports`).
//! - Source map : une entrée par pc émis, même localisation pour toutes les
//!   instructions issues d’une op.

use ahash::AHashMap;
use tessel_bytecode::hal_imports::{self, ELEMENTWISE_BINARY, ELEMENTWISE_UNARY, FROM_RODATA};
use tessel_bytecode::{
    BytecodeModule, Callee, ExportDef, FunctionDef, FunctionSignature, ModuleFlags, Op, Reg, ScalarKind,
    SourceLoc, ValueKind,
};

use crate::diagnostics::Diagnostic;
use crate::ir::{Constant, Function, Module, Number, OpKind, Operation, Type};

pub const DEFAULT_MODULE_NAME: &str = "module";

/// Descripteur de l’étape vm.
pub const fn pipeline(optimize: bool) -> &'static str {
    if optimize {
        "symbol-dce,canonicalize,dce"
    } else {
        "symbol-dce"
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitOptions {
    pub strip_debug_ops: bool,
    pub strip_source_map: bool,
    pub strip_symbols: bool,
}

pub const fn value_kind(ty: &Type) -> ValueKind {
    match ty {
        Type::Scalar(k) => k.value_kind(),
        Type::Tensor { .. } => ValueKind::Ref,
    }
}

pub fn signature(function: &Function) -> FunctionSignature {
    FunctionSignature::new(
        function.param_types().map(value_kind).collect::<Vec<_>>(),
        function.results.iter().map(value_kind).collect::<Vec<_>>(),
    )
}

/// Abaisse tout le module ; toutes les fonctions sont tentées, les erreurs
/// sont cumulées.
pub fn lower_module(module: &Module, opts: EmitOptions) -> Result<BytecodeModule, Vec<Diagnostic>> {
    let flags = ModuleFlags { stripped_source_map: opts.strip_source_map, stripped_symbols: opts.strip_symbols };
    let name = module.name.clone().unwrap_or_else(|| DEFAULT_MODULE_NAME.to_string());
    let mut out = BytecodeModule::new(name, flags);

    let ordinals: AHashMap<&str, u32> =
        module.functions.iter().zip(0u32..).map(|(f, i)| (f.name.as_str(), i)).collect();

    let mut errors = Vec::new();
    for (f, ordinal) in module.functions.iter().zip(0u32..) {
        match FunctionEmitter::new(f, &ordinals, opts).and_then(|e| e.emit(&mut out)) {
            Ok(def) => {
                out.functions.push(def);
                if f.is_exported() {
                    out.exports.push(ExportDef { name: f.name.clone(), function: ordinal });
                }
            }
            Err(d) => errors.push(d),
        }
    }
    if errors.is_empty() {
        Ok(out)
    } else {
        Err(errors)
    }
}

struct FunctionEmitter<'a> {
    function: &'a Function,
    ordinals: &'a AHashMap<&'a str, u32>,
    opts: EmitOptions,
    regs: AHashMap<&'a str, Reg>,
    next: u32,
    ops: Vec<Op>,
    source_map: Vec<SourceLoc>,
}

impl<'a> FunctionEmitter<'a> {
    fn new(function: &'a Function, ordinals: &'a AHashMap<&'a str, u32>, opts: EmitOptions) -> Result<Self, Diagnostic> {
        let mut emitter = Self {
            function,
            ordinals,
            opts,
            regs: AHashMap::new(),
            next: 0,
            ops: Vec::new(),
            source_map: Vec::new(),
        };
        let names = function
            .params
            .iter()
            .map(|(n, _)| n.as_str())
            .chain(function.body.iter().flat_map(|op| op.results.iter().map(String::as_str)));
        for name in names {
            let reg = emitter.alloc()?;
            emitter.regs.insert(name, reg);
        }
        Ok(emitter)
    }

    fn alloc(&mut self) -> Result<Reg, Diagnostic> {
        if self.next >= u32::from(Reg::MAX) {
            return Err(Diagnostic::error(
                self.function.loc.clone(),
                format!("function @{} needs more than {} registers", self.function.name, Reg::MAX),
            ));
        }
        let reg = Reg::try_from(self.next).unwrap_or(Reg::MAX);
        self.next += 1;
        Ok(reg)
    }

    fn reg(&self, op: &Operation, name: &str) -> Result<Reg, Diagnostic> {
        self.regs
            .get(name)
            .copied()
            .ok_or_else(|| Diagnostic::error(op.loc.clone(), format!("use of undefined value '%{name}'")))
    }

    fn regs_of(&self, op: &Operation, names: &[String]) -> Result<Vec<Reg>, Diagnostic> {
        names.iter().map(|n| self.reg(op, n)).collect()
    }

    fn result(&self, op: &Operation) -> Result<Reg, Diagnostic> {
        match op.results.first() {
            Some(name) => self.reg(op, name),
            None => Err(Diagnostic::error(op.loc.clone(), format!("'{}' op has no result", op.mnemonic()))),
        }
    }

    fn const_i32(&mut self, value: i32) -> Result<Reg, Diagnostic> {
        let dst = self.alloc()?;
        self.ops.push(Op::ConstI32 { dst, value });
        Ok(dst)
    }

    fn emit(mut self, module: &mut BytecodeModule) -> Result<FunctionDef, Diagnostic> {
        let function = self.function;
        for op in &function.body {
            let start = self.ops.len();
            self.lower_op(op, module)?;
            if !self.opts.strip_source_map && !op.loc.is_unknown() {
                let location = op.loc.brief();
                for pc in start..self.ops.len() {
                    let pc = u32::try_from(pc).unwrap_or(u32::MAX);
                    self.source_map.push(SourceLoc { pc, location: location.clone() });
                }
            }
        }

        let f = function;
        let name = (!self.opts.strip_symbols || f.is_exported()).then(|| f.name.clone());
        let reflection = f
            .attrs
            .iter()
            .filter_map(|(k, v)| Some((k.strip_prefix("reflection.")?.to_string(), v.clone()?)))
            .collect();
        Ok(FunctionDef {
            name,
            signature: signature(f),
            register_count: Reg::try_from(self.next).unwrap_or(Reg::MAX),
            ops: self.ops,
            reflection,
            source_map: self.source_map,
        })
    }

    fn lower_op(&mut self, op: &Operation, module: &mut BytecodeModule) -> Result<(), Diagnostic> {
        let mismatch = |what: &str| Diagnostic::error(op.loc.clone(), format!("cannot lower '{}' op: {what}", op.mnemonic()));
        match (&op.kind, op.types.first()) {
            (OpKind::Constant(Constant::Scalar(n)), Some(Type::Scalar(k))) => {
                let dst = self.result(op)?;
                self.ops.push(scalar_constant(*k, dst, *n));
            }
            (OpKind::Constant(Constant::Dense(values)), Some(Type::Tensor { element, .. })) => {
                let dst = self.result(op)?;
                let index = module.add_rodata(encode_dense(*element, values));
                let scalar_type = self.const_i32(type_code(*element))?;
                let rodata = self.alloc()?;
                self.ops.push(Op::ConstRodata { dst: rodata, index });
                let import =
                    module.intern_import(&hal_imports::qualified(FROM_RODATA), hal_imports::from_rodata_signature());
                self.ops.push(Op::Call { callee: Callee::Import(import), args: vec![scalar_type, rodata], results: vec![dst] });
            }
            (OpKind::Constant(_), _) => return Err(mismatch("literal does not match its type")),
            (OpKind::Binary { op: b, lhs, rhs }, Some(Type::Scalar(k))) => {
                let (dst, lhs, rhs) = (self.result(op)?, self.reg(op, lhs)?, self.reg(op, rhs)?);
                self.ops.push(Op::Binary { op: *b, kind: *k, dst, lhs, rhs });
            }
            (OpKind::Binary { op: b, lhs, rhs }, Some(Type::Tensor { element, .. })) => {
                let (dst, lhs, rhs) = (self.result(op)?, self.reg(op, lhs)?, self.reg(op, rhs)?);
                let code = self.const_i32(b.code())?;
                let scalar_type = self.const_i32(type_code(*element))?;
                let import = module.intern_import(
                    &hal_imports::qualified(ELEMENTWISE_BINARY),
                    hal_imports::elementwise_binary_signature(),
                );
                self.ops.push(Op::Call {
                    callee: Callee::Import(import),
                    args: vec![code, scalar_type, lhs, rhs],
                    results: vec![dst],
                });
            }
            (OpKind::Unary { op: u, operand }, Some(Type::Scalar(k))) => {
                let (dst, src) = (self.result(op)?, self.reg(op, operand)?);
                self.ops.push(Op::Unary { op: *u, kind: *k, dst, src });
            }
            (OpKind::Unary { op: u, operand }, Some(Type::Tensor { element, .. })) => {
                let (dst, src) = (self.result(op)?, self.reg(op, operand)?);
                let code = self.const_i32(u.code())?;
                let scalar_type = self.const_i32(type_code(*element))?;
                let import = module.intern_import(
                    &hal_imports::qualified(ELEMENTWISE_UNARY),
                    hal_imports::elementwise_unary_signature(),
                );
                self.ops.push(Op::Call {
                    callee: Callee::Import(import),
                    args: vec![code, scalar_type, src],
                    results: vec![dst],
                });
            }
            (OpKind::Binary { .. } | OpKind::Unary { .. }, None) => return Err(mismatch("missing result type")),
            (OpKind::Call { callee, args }, _) => {
                let ordinal = self
                    .ordinals
                    .get(callee.as_str())
                    .copied()
                    .ok_or_else(|| Diagnostic::error(op.loc.clone(), format!("call to unknown function '@{callee}'")))?;
                let args = self.regs_of(op, args)?;
                let results = self.regs_of(op, &op.results)?;
                self.ops.push(Op::Call { callee: Callee::Internal(ordinal), args, results });
            }
            (OpKind::Trace { tag, args }, _) => {
                if !self.opts.strip_debug_ops {
                    let args = self.regs_of(op, args)?;
                    self.ops.push(Op::Trace { tag: tag.clone(), args });
                }
            }
            (OpKind::Return { values }, _) => {
                let values = self.regs_of(op, values)?;
                self.ops.push(Op::Return { values });
            }
        }
        Ok(())
    }
}

#[allow(clippy::cast_possible_wrap)]
const fn type_code(kind: ScalarKind) -> i32 {
    kind.scalar_type().code() as i32
}

#[allow(clippy::cast_possible_truncation)]
fn scalar_constant(kind: ScalarKind, dst: Reg, n: Number) -> Op {
    match (kind, n) {
        (ScalarKind::I32, Number::Int(i)) => Op::ConstI32 { dst, value: i as i32 },
        (ScalarKind::I64, Number::Int(i)) => Op::ConstI64 { dst, value: i },
        (ScalarKind::I32, Number::Float(x)) => Op::ConstI32 { dst, value: x as i32 },
        (ScalarKind::I64, Number::Float(x)) => Op::ConstI64 { dst, value: x as i64 },
        (ScalarKind::F32, n) => Op::ConstF32 { dst, value: n.as_f64() as f32 },
        (ScalarKind::F64, n) => Op::ConstF64 { dst, value: n.as_f64() },
    }
}

/// Données d’une constante `dense`, petit-boutiste.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_dense(kind: ScalarKind, values: &[Number]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * kind.byte_size());
    for n in values {
        match kind {
            ScalarKind::I32 => out.extend_from_slice(&(int_value(*n) as i32).to_le_bytes()),
            ScalarKind::I64 => out.extend_from_slice(&int_value(*n).to_le_bytes()),
            ScalarKind::F32 => out.extend_from_slice(&(n.as_f64() as f32).to_le_bytes()),
            ScalarKind::F64 => out.extend_from_slice(&n.as_f64().to_le_bytes()),
        }
    }
    out
}

#[allow(clippy::cast_possible_truncation)]
fn int_value(n: Number) -> i64 {
    match n {
        Number::Int(i) => i,
        Number::Float(x) => x as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse_module;
    use indoc::indoc;
    use tessel_bytecode::BinaryOp;

    const SRC: &str = indoc! {r#"
        module @m {
          func @scale(%x: i32, %t: tensor<2xf32>) -> (i32, tensor<2xf32>) attributes {export, reflection.fv = "1"} {
            %c = constant 3 : i32 loc("m.tsl":2:5)
            %y = mul %x, %c : i32 loc("m.tsl":3:5)
            %d = constant dense<[0.5, 2.0]> : tensor<2xf32> loc("m.tsl":4:5)
            %u = mul %t, %d : tensor<2xf32> loc("m.tsl":5:5)
            trace "y"(%y)
            %r = call @helper(%y) : i32
            return %r, %u : i32, tensor<2xf32>
          }
          func @helper(%a: i32) -> i32 {
            return %a : i32
          }
        }
    "#};

    fn lower(opts: EmitOptions) -> BytecodeModule {
        lower_module(&parse_module(SRC, "m.tsl").unwrap(), opts).unwrap()
    }

    #[test]
    fn lowers_scalars_tensors_and_calls() {
        let m = lower(EmitOptions::default());
        m.validate().unwrap();
        assert_eq!(m.name, "m");
        assert_eq!(m.exports.len(), 1);
        let f = &m.functions[0];
        assert_eq!(f.signature.to_string(), "(i32, ref) -> (i32, ref)");
        assert_eq!(f.reflection, vec![("fv".to_string(), "1".to_string())]);
        // x t c y d u r, puis 4 temporaires
        assert_eq!(f.register_count, 11);
        assert_eq!(f.ops[1], Op::Binary { op: BinaryOp::Mul, kind: ScalarKind::I32, dst: 3, lhs: 0, rhs: 2 });
        let imports: Vec<_> = m.imports.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(imports, ["hal.buffer.from_rodata", "hal.buffer.elementwise_binary"]);
        assert_eq!(m.rodata[0], [0.5f32.to_le_bytes(), 2.0f32.to_le_bytes()].concat());
        assert_eq!(f.location_for_pc(1), Some("m.tsl:3:5"));
        assert!(f.ops.iter().any(|op| matches!(op, Op::Trace { .. })));
        assert_eq!(f.ops.last(), Some(&Op::Return { values: vec![6, 5] }));
    }

    #[test]
    fn strip_options_drop_debug_material() {
        let m = lower(EmitOptions { strip_debug_ops: true, strip_source_map: true, strip_symbols: true });
        assert!(m.flags().stripped_symbols && m.flags().stripped_source_map);
        assert_eq!(m.functions[0].name.as_deref(), Some("scale"));
        assert_eq!(m.functions[1].name, None);
        assert!(m.functions.iter().all(|f| f.source_map.is_empty()));
        assert!(!m.functions[0].ops.iter().any(|op| matches!(op, Op::Trace { .. })));
    }
}
