//! interp.rs — Interpréteur à registres.
//!
//! Une frame = un banc de `Variant` (`register_count` entrées) ; les
//! paramètres occupent les premiers registres. Les appels d’import passent
//! par la table résolue à l’enregistrement du module dans le contexte.

use std::sync::Arc;

use tracing::info;

use tessel_bytecode::{BinaryOp, Callee, FunctionDef, Op, ScalarKind, UnaryOp};

use crate::context::{ContextState, RegisteredModule};
use crate::module::{Linkage, ModuleBody, VmFunction};
use crate::refs::{RoByteBuffer, VmRef};
use crate::status::{Status, VmResult};
use crate::variant::Variant;

/// Profondeur d’appel maximale (récursion comprise).
pub const MAX_CALL_DEPTH: usize = 256;

pub(crate) struct Interpreter<'a> {
    state: &'a ContextState,
}

impl<'a> Interpreter<'a> {
    pub(crate) const fn new(state: &'a ContextState) -> Self {
        Self { state }
    }

    pub(crate) fn call(&self, function: &VmFunction, args: Vec<Variant>, depth: usize) -> VmResult<Vec<Variant>> {
        if depth > MAX_CALL_DEPTH {
            return Err(Status::resource_exhausted(format!("call depth exceeded {MAX_CALL_DEPTH}")));
        }
        let module = function.module();
        match module.body() {
            ModuleBody::Native { functions } => {
                let native = functions
                    .get(function.ordinal() as usize)
                    .filter(|_| function.linkage() == Linkage::Export)
                    .ok_or_else(|| Status::not_found(format!("{function} is not callable")))?;
                let results = native.call(&args)?;
                check_results(&native.name, &native.signature.results, &results)?;
                Ok(results)
            }
            ModuleBody::Bytecode { .. } => {
                let registered = self.state.find(module).ok_or_else(|| {
                    Status::not_found(format!("module '{}' is not registered in this context", module.name()))
                })?;
                if function.linkage() == Linkage::Import {
                    let target = registered
                        .imports
                        .get(function.ordinal() as usize)
                        .ok_or_else(|| Status::not_found(format!("{function} is unresolved")))?;
                    return self.call(target, args, depth + 1);
                }
                let internal = module.bytecode_function(function.linkage(), function.ordinal())?;
                self.run(registered, internal, args, depth)
            }
        }
    }

    fn run(&self, registered: &RegisteredModule, ordinal: u32, args: Vec<Variant>, depth: usize) -> VmResult<Vec<Variant>> {
        if depth > MAX_CALL_DEPTH {
            return Err(Status::resource_exhausted(format!("call depth exceeded {MAX_CALL_DEPTH}")));
        }
        let ModuleBody::Bytecode { module, rodata, .. } = registered.module.body() else {
            return Err(Status::internal("bytecode frame on a native module"));
        };
        let func = module
            .functions
            .get(ordinal as usize)
            .ok_or_else(|| Status::out_of_range(format!("function #{ordinal} out of range")))?;

        let mut regs = vec![Variant::Empty; usize::from(func.register_count)];
        for (slot, arg) in regs.iter_mut().zip(args) {
            *slot = arg;
        }

        for (pc, op) in func.ops.iter().enumerate() {
            let reg = |r: u16| &regs[usize::from(r)];
            match op {
                Op::ConstI32 { dst, value } => regs[usize::from(*dst)] = Variant::I32(*value),
                Op::ConstI64 { dst, value } => regs[usize::from(*dst)] = Variant::I64(*value),
                Op::ConstF32 { dst, value } => regs[usize::from(*dst)] = Variant::F32(*value),
                Op::ConstF64 { dst, value } => regs[usize::from(*dst)] = Variant::F64(*value),
                Op::ConstRodata { dst, index } => {
                    let data = rodata
                        .get(*index as usize)
                        .cloned()
                        .ok_or_else(|| at(func, pc, Status::out_of_range(format!("rodata #{index} out of range"))))?;
                    regs[usize::from(*dst)] = Variant::Ref(VmRef::new(Arc::new(RoByteBuffer::new(data)))?);
                }
                Op::Move { dst, src } => {
                    let v = reg(*src).clone();
                    regs[usize::from(*dst)] = v;
                }
                Op::Binary { op, kind, dst, lhs, rhs } => {
                    let v = eval_binary(*op, *kind, reg(*lhs), reg(*rhs)).map_err(|s| at(func, pc, s))?;
                    regs[usize::from(*dst)] = v;
                }
                Op::Unary { op, kind, dst, src } => {
                    let v = eval_unary(*op, *kind, reg(*src)).map_err(|s| at(func, pc, s))?;
                    regs[usize::from(*dst)] = v;
                }
                Op::Call { callee, args, results } => {
                    let argv: Vec<Variant> = args.iter().map(|r| reg(*r).clone()).collect();
                    let out = match callee {
                        Callee::Internal(o) => self.run(registered, *o, argv, depth + 1)?,
                        Callee::Import(o) => {
                            let target = registered
                                .imports
                                .get(*o as usize)
                                .ok_or_else(|| at(func, pc, Status::not_found(format!("import #{o} is unresolved"))))?;
                            self.call(target, argv, depth + 1)?
                        }
                    };
                    if out.len() != results.len() {
                        return Err(at(
                            func,
                            pc,
                            Status::internal(format!("callee returned {} values, {} expected", out.len(), results.len())),
                        ));
                    }
                    for (r, v) in results.iter().zip(out) {
                        regs[usize::from(*r)] = v;
                    }
                }
                Op::Trace { tag, args } => {
                    let values = args.iter().map(|r| reg(*r).to_string()).collect::<Vec<_>>().join(", ");
                    info!(target: "tessel::trace", tag = %tag, values = %values, "trace");
                }
                Op::Return { values } => {
                    return Ok(values.iter().map(|r| reg(*r).clone()).collect());
                }
            }
        }
        Err(Status::internal(format!(
            "function {} ended without return",
            func.name.as_deref().unwrap_or("<stripped>")
        )))
    }
}

/// Ajoute la position source (si connue) au message.
fn at(func: &FunctionDef, pc: usize, status: Status) -> Status {
    let name = func.name.as_deref().unwrap_or("<stripped>");
    let location = u32::try_from(pc).ok().and_then(|pc| func.location_for_pc(pc));
    let message = match location {
        Some(loc) => format!("{} (in @{name} at {loc})", status.message()),
        None => format!("{} (in @{name}, pc {pc})", status.message()),
    };
    Status::new(status.code(), message)
}

fn check_results(name: &str, expected: &[tessel_bytecode::ValueKind], results: &[Variant]) -> VmResult<()> {
    if results.len() != expected.len() || results.iter().zip(expected).any(|(v, k)| !v.matches(*k)) {
        return Err(Status::internal(format!("native function '{name}' returned values that do not match its signature")));
    }
    Ok(())
}

fn eval_binary(op: BinaryOp, kind: ScalarKind, lhs: &Variant, rhs: &Variant) -> VmResult<Variant> {
    let div_by_zero = || Status::invalid_argument("integer division by zero");
    match (kind, lhs, rhs) {
        (ScalarKind::I32, Variant::I32(a), Variant::I32(b)) => op.apply_i32(*a, *b).map(Variant::I32).ok_or_else(div_by_zero),
        (ScalarKind::I64, Variant::I64(a), Variant::I64(b)) => op.apply_i64(*a, *b).map(Variant::I64).ok_or_else(div_by_zero),
        (ScalarKind::F32, Variant::F32(a), Variant::F32(b)) => Ok(Variant::F32(op.apply_f32(*a, *b))),
        (ScalarKind::F64, Variant::F64(a), Variant::F64(b)) => Ok(Variant::F64(op.apply_f64(*a, *b))),
        _ => Err(Status::invalid_argument(format!(
            "operands of {}.{} have mismatched types",
            op.mnemonic(),
            kind.mnemonic()
        ))),
    }
}

fn eval_unary(op: UnaryOp, kind: ScalarKind, src: &Variant) -> VmResult<Variant> {
    match (kind, src) {
        (ScalarKind::I32, Variant::I32(a)) => Ok(Variant::I32(op.apply_i32(*a))),
        (ScalarKind::I64, Variant::I64(a)) => Ok(Variant::I64(op.apply_i64(*a))),
        (ScalarKind::F32, Variant::F32(a)) => Ok(Variant::F32(op.apply_f32(*a))),
        (ScalarKind::F64, Variant::F64(a)) => Ok(Variant::F64(op.apply_f64(*a))),
        _ => Err(Status::invalid_argument(format!(
            "operand of {}.{} has a mismatched type",
            op.mnemonic(),
            kind.mnemonic()
        ))),
    }
}
