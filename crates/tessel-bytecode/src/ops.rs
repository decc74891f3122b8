//! ops.rs — Jeu d’instructions (machine à registres) de la VM tessel.
//!
//! Chaque fonction dispose d’un banc de registres typés dynamiquement
//! (`Variant` côté VM). Les opérations arithmétiques sont partagées avec le
//! compilateur (repli de constantes) et les noyaux HAL : une seule sémantique.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::abi::ScalarType;

/// Index de registre dans la frame courante.
pub type Reg = u16;

/// Type d’une valeur transportée dans un registre / une variante.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    I32,
    I64,
    F32,
    F64,
    Ref,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Ref => "ref",
        })
    }
}

/// Type élémentaire d’une opération arithmétique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    I32,
    I64,
    F32,
    F64,
}

impl ScalarKind {
    pub const fn value_kind(self) -> ValueKind {
        match self {
            Self::I32 => ValueKind::I32,
            Self::I64 => ValueKind::I64,
            Self::F32 => ValueKind::F32,
            Self::F64 => ValueKind::F64,
        }
    }

    pub const fn scalar_type(self) -> ScalarType {
        match self {
            Self::I32 => ScalarType::Sint32,
            Self::I64 => ScalarType::Sint64,
            Self::F32 => ScalarType::IeeeFloat32,
            Self::F64 => ScalarType::IeeeFloat64,
        }
    }

    pub const fn from_scalar_type(t: ScalarType) -> Option<Self> {
        match t {
            ScalarType::Sint32 => Some(Self::I32),
            ScalarType::Sint64 => Some(Self::I64),
            ScalarType::IeeeFloat32 => Some(Self::F32),
            ScalarType::IeeeFloat64 => Some(Self::F64),
            _ => None,
        }
    }

    pub const fn byte_size(self) -> usize {
        match self {
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }
}

/* ─────────────────────────── Opérateurs ─────────────────────────── */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BinaryOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Max = 4,
    Min = 5,
}

const BINARY_OPS: [BinaryOp; 6] =
    [BinaryOp::Add, BinaryOp::Sub, BinaryOp::Mul, BinaryOp::Div, BinaryOp::Max, BinaryOp::Min];

impl BinaryOp {
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Max => "max",
            Self::Min => "min",
        }
    }

    pub fn from_mnemonic(s: &str) -> Option<Self> {
        BINARY_OPS.into_iter().find(|op| op.mnemonic() == s)
    }

    pub const fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        usize::try_from(code).ok().and_then(|i| BINARY_OPS.get(i).copied())
    }

    /// `None` : division entière par zéro.
    pub const fn apply_i32(self, a: i32, b: i32) -> Option<i32> {
        Some(match self {
            Self::Add => a.wrapping_add(b),
            Self::Sub => a.wrapping_sub(b),
            Self::Mul => a.wrapping_mul(b),
            Self::Div => {
                if b == 0 {
                    return None;
                }
                a.wrapping_div(b)
            }
            Self::Max => if a > b { a } else { b },
            Self::Min => if a < b { a } else { b },
        })
    }

    pub const fn apply_i64(self, a: i64, b: i64) -> Option<i64> {
        Some(match self {
            Self::Add => a.wrapping_add(b),
            Self::Sub => a.wrapping_sub(b),
            Self::Mul => a.wrapping_mul(b),
            Self::Div => {
                if b == 0 {
                    return None;
                }
                a.wrapping_div(b)
            }
            Self::Max => if a > b { a } else { b },
            Self::Min => if a < b { a } else { b },
        })
    }

    pub fn apply_f32(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::Max => a.max(b),
            Self::Min => a.min(b),
        }
    }

    pub fn apply_f64(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::Max => a.max(b),
            Self::Min => a.min(b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum UnaryOp {
    Neg = 0,
    Abs = 1,
}

impl UnaryOp {
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::Neg => "neg",
            Self::Abs => "abs",
        }
    }

    pub fn from_mnemonic(s: &str) -> Option<Self> {
        match s {
            "neg" => Some(Self::Neg),
            "abs" => Some(Self::Abs),
            _ => None,
        }
    }

    pub const fn code(self) -> i32 {
        self as i32
    }

    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Neg),
            1 => Some(Self::Abs),
            _ => None,
        }
    }

    pub const fn apply_i32(self, a: i32) -> i32 {
        match self {
            Self::Neg => a.wrapping_neg(),
            Self::Abs => a.wrapping_abs(),
        }
    }

    pub const fn apply_i64(self, a: i64) -> i64 {
        match self {
            Self::Neg => a.wrapping_neg(),
            Self::Abs => a.wrapping_abs(),
        }
    }

    pub fn apply_f32(self, a: f32) -> f32 {
        match self {
            Self::Neg => -a,
            Self::Abs => a.abs(),
        }
    }

    pub fn apply_f64(self, a: f64) -> f64 {
        match self {
            Self::Neg => -a,
            Self::Abs => a.abs(),
        }
    }
}

/* ─────────────────────────── Instructions ─────────────────────────── */

/// Cible d’un appel : fonction interne (ordinal) ou import (ordinal d’import).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Callee {
    Internal(u32),
    Import(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    ConstI32 { dst: Reg, value: i32 },
    ConstI64 { dst: Reg, value: i64 },
    ConstF32 { dst: Reg, value: f32 },
    ConstF64 { dst: Reg, value: f64 },
    /// Référence vers un segment rodata du module (lecture seule).
    ConstRodata { dst: Reg, index: u32 },
    Move { dst: Reg, src: Reg },
    Binary { op: BinaryOp, kind: ScalarKind, dst: Reg, lhs: Reg, rhs: Reg },
    Unary { op: UnaryOp, kind: ScalarKind, dst: Reg, src: Reg },
    Call { callee: Callee, args: Vec<Reg>, results: Vec<Reg> },
    /// Op de debug : journalise ses opérandes (retirée par `strip_debug_ops`).
    Trace { tag: String, args: Vec<Reg> },
    Return { values: Vec<Reg> },
}

impl Op {
    /// Registres écrits par l’instruction.
    pub fn defs(&self) -> Vec<Reg> {
        match self {
            Self::ConstI32 { dst, .. }
            | Self::ConstI64 { dst, .. }
            | Self::ConstF32 { dst, .. }
            | Self::ConstF64 { dst, .. }
            | Self::ConstRodata { dst, .. }
            | Self::Move { dst, .. }
            | Self::Binary { dst, .. }
            | Self::Unary { dst, .. } => vec![*dst],
            Self::Call { results, .. } => results.clone(),
            Self::Trace { .. } | Self::Return { .. } => Vec::new(),
        }
    }

    /// Registres lus par l’instruction.
    pub fn uses(&self) -> Vec<Reg> {
        match self {
            Self::ConstI32 { .. }
            | Self::ConstI64 { .. }
            | Self::ConstF32 { .. }
            | Self::ConstF64 { .. }
            | Self::ConstRodata { .. } => Vec::new(),
            Self::Move { src, .. } | Self::Unary { src, .. } => vec![*src],
            Self::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            Self::Call { args, .. } | Self::Trace { args, .. } => args.clone(),
            Self::Return { values } => values.clone(),
        }
    }

    pub const fn is_terminator(&self) -> bool {
        matches!(self, Self::Return { .. })
    }
}

struct RegList<'a>(&'a [Reg]);

impl fmt::Display for RegList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "r{r}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConstI32 { dst, value } => write!(f, "r{dst} = const.i32 {value}"),
            Self::ConstI64 { dst, value } => write!(f, "r{dst} = const.i64 {value}"),
            Self::ConstF32 { dst, value } => write!(f, "r{dst} = const.f32 {value:?}"),
            Self::ConstF64 { dst, value } => write!(f, "r{dst} = const.f64 {value:?}"),
            Self::ConstRodata { dst, index } => write!(f, "r{dst} = const.rodata #{index}"),
            Self::Move { dst, src } => write!(f, "r{dst} = move r{src}"),
            Self::Binary { op, kind, dst, lhs, rhs } => {
                write!(f, "r{dst} = {}.{} r{lhs}, r{rhs}", op.mnemonic(), kind.mnemonic())
            }
            Self::Unary { op, kind, dst, src } => write!(f, "r{dst} = {}.{} r{src}", op.mnemonic(), kind.mnemonic()),
            Self::Call { callee, args, results } => {
                if !results.is_empty() {
                    write!(f, "{} = ", RegList(results))?;
                }
                match callee {
                    Callee::Internal(o) => write!(f, "call @{o}({})", RegList(args)),
                    Callee::Import(o) => write!(f, "call.import #{o}({})", RegList(args)),
                }
            }
            Self::Trace { tag, args } => write!(f, "trace {tag:?}({})", RegList(args)),
            Self::Return { values } => write!(f, "return {}", RegList(values)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_division_by_zero_is_reported() {
        assert_eq!(BinaryOp::Div.apply_i32(7, 0), None);
        assert_eq!(BinaryOp::Div.apply_i64(-9, 3), Some(-3));
        assert_eq!(BinaryOp::Add.apply_i32(i32::MAX, 1), Some(i32::MIN));
    }

    #[test]
    fn op_codes_round_trip_through_hal_calls() {
        for op in BINARY_OPS {
            assert_eq!(BinaryOp::from_code(op.code()), Some(op));
            assert_eq!(BinaryOp::from_mnemonic(op.mnemonic()), Some(op));
        }
        assert_eq!(BinaryOp::from_code(-1), None);
        assert_eq!(UnaryOp::from_code(UnaryOp::Abs.code()), Some(UnaryOp::Abs));
    }

    #[test]
    fn disassembly_is_readable() {
        let op = Op::Binary { op: BinaryOp::Mul, kind: ScalarKind::F32, dst: 2, lhs: 0, rhs: 1 };
        assert_eq!(op.to_string(), "r2 = mul.f32 r0, r1");
        let call = Op::Call { callee: Callee::Import(1), args: vec![0, 1], results: vec![3] };
        assert_eq!(call.to_string(), "r3 = call.import #1(r0, r1)");
        assert_eq!(call.uses(), vec![0, 1]);
        assert_eq!(call.defs(), vec![3]);
    }
}
