//! bundle.rs — Module IR analysé, pipelines de passes, compilation.
//!
//! Un `ModuleBundle` garde son `CompilerContext` en vie. Les pipelines
//! modifient le module sur place, sans retour arrière. Après une compilation
//! réussie le bundle est *consommé* : une seconde compilation est refusée.

use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::hal::MaterializeTargets;
use crate::backend::{self, flow, vm, CompileOptions};
use crate::context::CompilerContext;
use crate::error::{CompileError, Result, COMPILE_PREFIX, PARSE_PREFIX, RUN_PASSES_PREFIX, SERIALIZE_PREFIX};
use crate::ir::parser::{parse_module, DEFAULT_SOURCE_NAME};
use crate::ir::printer::{print_module, PrintOptions};
use crate::ir::verify::verify_module;
use crate::ir::Module;
use crate::pass::{PassManager, Stage};

/* ─────────────────────────── OpaqueBlob ─────────────────────────── */

/// Artefact compilé, immuable et partagé.
#[derive(Clone, PartialEq, Eq)]
pub struct OpaqueBlob(Arc<[u8]>);

impl OpaqueBlob {
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// Vue texte (remplacement des séquences UTF-8 invalides).
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for OpaqueBlob {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

impl AsRef<[u8]> for OpaqueBlob {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for OpaqueBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpaqueBlob({} bytes)", self.0.len())
    }
}

/* ─────────────────────────── Analyse ─────────────────────────── */

impl CompilerContext {
    pub fn parse_asm(&self, text: &str) -> Result<ModuleBundle> {
        self.parse_asm_named(text, DEFAULT_SOURCE_NAME)
    }

    /// Analyse puis vérifie ; les diagnostics d’échec forment l’erreur.
    pub fn parse_asm_named(&self, text: &str, source_name: &str) -> Result<ModuleBundle> {
        let capture = self.capture_diagnostics();
        let module = match parse_module(text, source_name) {
            Ok(module) => module,
            Err(d) => {
                self.emit(d);
                return Err(CompileError::Parse(capture.consume_as_string(PARSE_PREFIX)));
            }
        };
        let problems = verify_module(&module);
        if !problems.is_empty() {
            for d in problems {
                self.emit(d);
            }
            return Err(CompileError::Parse(capture.consume_as_string(PARSE_PREFIX)));
        }
        capture.discard("parse_asm");
        info!(
            target: "tessel-compiler",
            source = source_name,
            module = module.name.as_deref().unwrap_or(vm::DEFAULT_MODULE_NAME),
            functions = module.functions.len(),
            "module IR analysé"
        );
        Ok(ModuleBundle { context: self.clone(), module, consumed: false })
    }

    pub fn parse_asm_file(&self, path: &Path) -> Result<ModuleBundle> {
        let text = std::fs::read_to_string(path)?;
        self.parse_asm_named(&text, &path.display().to_string())
    }
}

/* ─────────────────────────── ModuleBundle ─────────────────────────── */

/// Accès concurrent non synchronisé : un seul pipeline à la fois par bundle.
pub struct ModuleBundle {
    context: CompilerContext,
    module: Module,
    consumed: bool,
}

impl ModuleBundle {
    pub fn context(&self) -> &CompilerContext {
        &self.context
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    pub fn to_asm(&self, debug_info: bool, pretty: bool, large_element_limit: i64) -> String {
        print_module(&self.module, PrintOptions { debug_info, pretty, large_element_limit })
    }

    /// Tous les descripteurs sont analysés avant l’exécution du premier pass.
    pub fn run_pass_pipeline<S: AsRef<str>>(&mut self, pipelines: &[S]) -> Result<()> {
        let mut pm = PassManager::new();
        for text in pipelines {
            pm.add_pipeline(text.as_ref()).map_err(CompileError::PipelineParse)?;
        }
        let capture = self.context.capture_diagnostics();
        debug!(target: "tessel-compiler", pipeline = %pm.description(), "exécution des passes");
        if pm.run(&mut self.module, &self.context).is_err() {
            return Err(CompileError::RunPasses(capture.consume_as_string(RUN_PASSES_PREFIX)));
        }
        capture.discard("run_pass_pipeline");
        Ok(())
    }

    /// flow → hal(targets) → vm, puis sérialisation selon `options`.
    pub fn compile(&mut self, options: &CompileOptions, target_backends: &[String]) -> Result<OpaqueBlob> {
        if self.consumed {
            return Err(CompileError::AlreadyCompiled);
        }
        let mut pm = PassManager::new();
        pm.add_pipeline(flow::PIPELINE).map_err(CompileError::PipelineParse)?;
        pm.add_stage(Stage::Module(Box::new(MaterializeTargets::new(target_backends.to_vec()))));
        pm.add_pipeline(vm::pipeline(options.optimize)).map_err(CompileError::PipelineParse)?;

        let capture = self.context.capture_diagnostics();
        info!(
            target: "tessel-compiler",
            pipeline = %pm.description(),
            format = %options.output_format,
            "compilation du module"
        );
        if pm.run(&mut self.module, &self.context).is_err() {
            return Err(CompileError::Compile(capture.consume_as_string(COMPILE_PREFIX)));
        }
        let bytes = match backend::serialize(&self.module, options) {
            Ok(bytes) => bytes,
            Err(diagnostics) => {
                for d in diagnostics {
                    self.context.emit(d);
                }
                return Err(CompileError::Serialize(capture.consume_as_string(SERIALIZE_PREFIX)));
            }
        };
        capture.discard("compile");
        self.consumed = true;
        info!(target: "tessel-compiler", bytes = bytes.len(), "module compilé");
        Ok(OpaqueBlob::from(bytes))
    }
}

impl fmt::Debug for ModuleBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleBundle")
            .field("module", &self.module.name)
            .field("functions", &self.module.functions.len())
            .field("consumed", &self.consumed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_keeps_the_context_alive() {
        let bundle = CompilerContext::new().parse_asm("func @f() {\n  return\n}\n").unwrap();
        assert_eq!(bundle.context().get_diagnostics(), "");
        assert_eq!(bundle.to_asm(false, false, -1), "module {\n  func @f() {\n    return\n  }\n}\n");
    }

    #[test]
    fn opaque_blob_views() {
        let blob = OpaqueBlob::from(b"abc".to_vec());
        assert_eq!(blob.bytes(), b"abc");
        assert_eq!(blob.text(), "abc");
        assert_eq!(format!("{blob:?}"), "OpaqueBlob(3 bytes)");
    }
}
