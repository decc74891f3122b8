//! tessel-bytecode — Format de module exécutable par la VM tessel.
//!
//! ## Modules
//! - `abi`    : table des types scalaires, descriptions d’arguments, mangling des signatures.
//! - `ops`    : jeu d’instructions à registres, opérateurs arithmétiques partagés.
//! - `hal_imports` : noms / signatures des imports `hal.*` partagés compilateur ↔ runtime.
//! - `module` : conteneur `BytecodeModule` (binaire bincode / texte JSON), validation.
//!
//! Aucun état global : ce crate est partagé par le compilateur (émission)
//! et la VM (chargement).

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod abi;
pub mod hal_imports;
pub mod module;
pub mod ops;

pub use abi::{Description, RawSignature, ScalarType, SignatureError};
pub use module::{
    BytecodeModule, ContainerError, ExportDef, FunctionDef, FunctionSignature, ImportDef, ModuleFlags, SourceLoc,
};
pub use ops::{BinaryOp, Callee, Op, Reg, ScalarKind, UnaryOp, ValueKind};

/// Version du crate (lisible, via Cargo).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
