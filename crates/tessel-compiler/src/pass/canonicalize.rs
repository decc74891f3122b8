//! pass/canonicalize.rs — Repliement de constantes (scalaires et `dense`).
//!
//! Les opérations binaires / unaires dont tous les opérandes sont des
//! constantes deviennent des constantes. La division entière par zéro
//! n’est pas repliée : l’erreur reste à l’exécution.

use ahash::AHashMap;
use tessel_bytecode::{BinaryOp, ScalarKind, UnaryOp};

use super::{Pass, PassResult, PassScope};
use crate::context::CompilerContext;
use crate::ir::{Constant, Function, Number, OpKind};

#[derive(Debug, Clone, Copy, Default)]
pub struct Canonicalize;

impl Pass for Canonicalize {
    fn name(&self) -> &'static str {
        "canonicalize"
    }

    fn scope(&self) -> PassScope {
        PassScope::Function
    }

    fn run_on_function(&self, function: &mut Function, _ctx: &CompilerContext) -> PassResult {
        let mut constants: AHashMap<String, Constant> = AHashMap::new();
        for op in &mut function.body {
            let (Some(result), Some(ty)) = (op.results.first(), op.types.first()) else {
                continue;
            };
            let kind = ty.element();
            let folded = match &op.kind {
                OpKind::Constant(c) => {
                    constants.insert(result.clone(), c.clone());
                    continue;
                }
                OpKind::Binary { op: b, lhs, rhs } => match (constants.get(lhs), constants.get(rhs)) {
                    (Some(a), Some(c)) => fold_binary(*b, kind, a, c),
                    _ => None,
                },
                OpKind::Unary { op: u, operand } => constants.get(operand).and_then(|a| fold_unary(*u, kind, a)),
                _ => None,
            };
            if let Some(c) = folded {
                constants.insert(result.clone(), c.clone());
                op.kind = OpKind::Constant(c);
            }
        }
        Ok(())
    }
}

fn fold_binary(op: BinaryOp, kind: ScalarKind, a: &Constant, b: &Constant) -> Option<Constant> {
    match (a, b) {
        (Constant::Scalar(x), Constant::Scalar(y)) => fold_number(op, kind, *x, *y).map(Constant::Scalar),
        (Constant::Dense(xs), Constant::Dense(ys)) if xs.len() == ys.len() => xs
            .iter()
            .zip(ys)
            .map(|(x, y)| fold_number(op, kind, *x, *y))
            .collect::<Option<Vec<_>>>()
            .map(Constant::Dense),
        _ => None,
    }
}

fn fold_unary(op: UnaryOp, kind: ScalarKind, a: &Constant) -> Option<Constant> {
    match a {
        Constant::Scalar(x) => fold_number_unary(op, kind, *x).map(Constant::Scalar),
        Constant::Dense(xs) => xs
            .iter()
            .map(|x| fold_number_unary(op, kind, *x))
            .collect::<Option<Vec<_>>>()
            .map(Constant::Dense),
    }
}

const fn int(n: Number) -> Option<i64> {
    match n {
        Number::Int(i) => Some(i),
        Number::Float(_) => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn fold_number(op: BinaryOp, kind: ScalarKind, x: Number, y: Number) -> Option<Number> {
    Some(match kind {
        ScalarKind::I32 => {
            let (a, b) = (i32::try_from(int(x)?).ok()?, i32::try_from(int(y)?).ok()?);
            Number::Int(op.apply_i32(a, b)?.into())
        }
        ScalarKind::I64 => Number::Int(op.apply_i64(int(x)?, int(y)?)?),
        ScalarKind::F32 => Number::Float(op.apply_f32(x.as_f64() as f32, y.as_f64() as f32).into()),
        ScalarKind::F64 => Number::Float(op.apply_f64(x.as_f64(), y.as_f64())),
    })
}

#[allow(clippy::cast_possible_truncation)]
fn fold_number_unary(op: UnaryOp, kind: ScalarKind, x: Number) -> Option<Number> {
    Some(match kind {
        ScalarKind::I32 => Number::Int(op.apply_i32(i32::try_from(int(x)?).ok()?).into()),
        ScalarKind::I64 => Number::Int(op.apply_i64(int(x)?)),
        ScalarKind::F32 => Number::Float(op.apply_f32(x.as_f64() as f32).into()),
        ScalarKind::F64 => Number::Float(op.apply_f64(x.as_f64())),
    })
}
