//! backend/mod.rs — Pipeline backend (flow → hal → vm) et sérialisation.
//!
//! - `flow` : vérification, simplification, métadonnées de réflexion.
//! - `hal`  : validation des backends cibles.
//! - `vm`   : nettoyage final puis abaissement vers `BytecodeModule`.

use std::fmt;
use std::str::FromStr;

use crate::diagnostics::Diagnostic;
use crate::ir::printer::{print_module, PrintOptions};
use crate::ir::{Location, Module};

pub mod flow;
pub mod hal;
pub mod vm;

/// Encodage de l’artefact produit par `compile`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    BytecodeBinary,
    BytecodeText,
    IrText,
}

impl OutputFormat {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BytecodeBinary => "binary",
            Self::BytecodeText => "text",
            Self::IrText => "ir",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binary" | "bytecode" | "flatbuffer-binary" => Ok(Self::BytecodeBinary),
            "text" | "json" | "flatbuffer-text" => Ok(Self::BytecodeText),
            "ir" | "ir-text" => Ok(Self::IrText),
            other => Err(format!("unknown output format '{other}' (expected binary, text or ir)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    pub output_format: OutputFormat,
    pub optimize: bool,
    pub strip_debug_ops: bool,
    pub strip_source_map: bool,
    pub strip_symbols: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            output_format: OutputFormat::BytecodeBinary,
            optimize: true,
            strip_debug_ops: false,
            strip_source_map: false,
            strip_symbols: false,
        }
    }
}

impl CompileOptions {
    pub const fn emit_options(&self) -> vm::EmitOptions {
        vm::EmitOptions {
            strip_debug_ops: self.strip_debug_ops,
            strip_source_map: self.strip_source_map,
            strip_symbols: self.strip_symbols,
        }
    }
}

/// Encode le module (déjà passé dans les pipelines) selon `options`.
pub fn serialize(module: &Module, options: &CompileOptions) -> Result<Vec<u8>, Vec<Diagnostic>> {
    if options.output_format == OutputFormat::IrText {
        let print = PrintOptions { debug_info: !options.strip_source_map, ..PrintOptions::default() };
        return Ok(print_module(module, print).into_bytes());
    }
    let mut bytecode = vm::lower_module(module, options.emit_options())?;
    let container_error =
        |e: tessel_bytecode::ContainerError| vec![Diagnostic::error(Location::Unknown, format!("bytecode container: {e}"))];
    bytecode.validate().map_err(container_error)?;
    match options.output_format {
        OutputFormat::BytecodeText => bytecode.to_json().map(String::into_bytes).map_err(container_error),
        _ => bytecode.to_bytes().map_err(container_error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_format_parses_aliases() {
        assert_eq!("binary".parse::<OutputFormat>(), Ok(OutputFormat::BytecodeBinary));
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::BytecodeText));
        assert_eq!("ir".parse::<OutputFormat>(), Ok(OutputFormat::IrText));
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn pipelines_follow_options() {
        assert_eq!(hal::pipeline(&["vmla".to_string(), "llvm-ir".to_string()]), "hal-materialize-targets{targets=vmla;llvm-ir}");
        assert_eq!(hal::pipeline(&[]), "hal-materialize-targets");
        assert_eq!(vm::pipeline(false), "symbol-dce");
        assert_eq!(vm::pipeline(true), "symbol-dce,canonicalize,dce");
    }
}
