//! hal_imports.rs — Imports `hal.*` émis par le compilateur et servis par le runtime.
//!
//! Convention d’appel des noyaux élémentaires :
//! `(i32 opcode, i32 scalar_type, ref buffers...) -> (ref)`.

use crate::module::FunctionSignature;
use crate::ops::ValueKind::{I32, Ref};

/// Nom du module natif côté runtime.
pub const HAL_MODULE: &str = "hal";

pub const FROM_RODATA: &str = "buffer.from_rodata";
pub const ELEMENTWISE_BINARY: &str = "buffer.elementwise_binary";
pub const ELEMENTWISE_UNARY: &str = "buffer.elementwise_unary";
pub const BYTE_LENGTH: &str = "buffer.byte_length";

/// Nom complet `hal.<fonction>` tel qu’il apparaît dans la table d’imports.
pub fn qualified(function: &str) -> String {
    format!("{HAL_MODULE}.{function}")
}

/// `(i32 scalar_type, ref rodata) -> (ref buffer)`
pub fn from_rodata_signature() -> FunctionSignature {
    FunctionSignature::new([I32, Ref], [Ref])
}

/// `(i32 op, i32 scalar_type, ref lhs, ref rhs) -> (ref)`
pub fn elementwise_binary_signature() -> FunctionSignature {
    FunctionSignature::new([I32, I32, Ref, Ref], [Ref])
}

/// `(i32 op, i32 scalar_type, ref src) -> (ref)`
pub fn elementwise_unary_signature() -> FunctionSignature {
    FunctionSignature::new([I32, I32, Ref], [Ref])
}

/// `(ref buffer) -> (i32)`
pub fn byte_length_signature() -> FunctionSignature {
    FunctionSignature::new([Ref], [I32])
}
