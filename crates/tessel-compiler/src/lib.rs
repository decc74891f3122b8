//! tessel-compiler — Chaîne de compilation tessel (IR texte → bytecode).
//!
//! ## Modules
//! - `ir`          : modèle de l’IR, lexer / parser / printer / vérificateur.
//! - `diagnostics` : diagnostics et rendu des rapports.
//! - `context`     : contexte de compilation, portées de capture, reproducteur de crash.
//! - `pass`        : passes, registre, descripteurs de pipelines, `PassManager`.
//! - `backend`     : pipeline flow → hal → vm, abaissement et sérialisation.
//! - `bundle`      : `ModuleBundle` (analyse, pipelines, compilation) et `OpaqueBlob`.
//! - `config`      : configuration (defaults → ENV → CLI).
//!
//! Tout est synchrone ; un bundle ne doit pas être muté depuis deux threads
//! à la fois.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod backend;
pub mod bundle;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod ir;
pub mod pass;

pub use backend::{CompileOptions, OutputFormat};
pub use bundle::{ModuleBundle, OpaqueBlob};
pub use config::{CliOverrides, Config};
pub use context::{CompilerContext, DiagnosticCapture};
pub use diagnostics::{Diagnostic, Severity};
pub use error::{CompileError, Result};
pub use pass::{Pass, PassManager, PassScope};
