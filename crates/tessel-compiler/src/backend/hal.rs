//! backend/hal.rs — Étape « hal » : backends cibles.
//!
//! Le pass `hal-materialize-targets{targets=a;b}` vérifie que chaque type
//! d’élément du module est pris en charge par chaque cible, puis inscrit
//! la liste dans l’attribut de module `hal.targets`.

use ahash::AHashSet;
use tessel_bytecode::ScalarKind;

use crate::context::CompilerContext;
use crate::diagnostics::Diagnostic;
use crate::ir::{Location, Module};
use crate::pass::{Pass, PassFailure, PassOptions, PassResult, PassScope};

pub const DEFAULT_TARGET: &str = "interpreter";

const ALL_KINDS: &[ScalarKind] = &[ScalarKind::I32, ScalarKind::I64, ScalarKind::F32, ScalarKind::F64];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetBackend {
    pub id: &'static str,
    pub elements: &'static [ScalarKind],
}

impl TargetBackend {
    pub fn supports(&self, kind: ScalarKind) -> bool {
        self.elements.contains(&kind)
    }
}

pub const TARGET_BACKENDS: &[TargetBackend] = &[
    TargetBackend { id: "interpreter", elements: ALL_KINDS },
    TargetBackend { id: "vmla", elements: ALL_KINDS },
    TargetBackend { id: "llvm-ir", elements: ALL_KINDS },
    TargetBackend { id: "vulkan-spirv", elements: &[ScalarKind::I32, ScalarKind::F32] },
];

pub fn target_backend(id: &str) -> Option<&'static TargetBackend> {
    TARGET_BACKENDS.iter().find(|t| t.id == id)
}

pub fn target_ids() -> impl Iterator<Item = &'static str> {
    TARGET_BACKENDS.iter().map(|t| t.id)
}

/// Descripteur du pipeline hal pour une liste de cibles.
pub fn pipeline(targets: &[String]) -> String {
    if targets.is_empty() {
        "hal-materialize-targets".to_string()
    } else {
        format!("hal-materialize-targets{{targets={}}}", targets.join(";"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MaterializeTargets {
    targets: Vec<String>,
}

impl MaterializeTargets {
    pub fn new(targets: Vec<String>) -> Self {
        Self { targets }
    }

    pub(crate) fn from_options(options: &PassOptions) -> Result<Box<dyn Pass>, String> {
        let targets = options
            .get("targets")
            .map(|v| v.split(';').filter(|t| !t.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();
        Ok(Box::new(Self { targets }))
    }
}

impl Pass for MaterializeTargets {
    fn name(&self) -> &'static str {
        "hal-materialize-targets"
    }

    fn scope(&self) -> PassScope {
        PassScope::Module
    }

    fn description(&self) -> String {
        pipeline(&self.targets)
    }

    fn run_on_module(&self, module: &mut Module, ctx: &CompilerContext) -> PassResult {
        let ids: Vec<&str> = if self.targets.is_empty() {
            vec![DEFAULT_TARGET]
        } else {
            self.targets.iter().map(String::as_str).collect()
        };

        let mut failed = false;
        let mut backends = Vec::with_capacity(ids.len());
        for id in &ids {
            match target_backend(id) {
                Some(b) => backends.push(b),
                None => {
                    let known: Vec<_> = target_ids().collect();
                    ctx.emit(Diagnostic::error(
                        Location::Unknown,
                        format!("unknown target backend '{id}' (registered: {})", known.join(", ")),
                    ));
                    failed = true;
                }
            }
        }

        let mut reported = AHashSet::new();
        for (f, ty) in module.types() {
            let kind = ty.element();
            for b in backends.iter().filter(|b| !b.supports(kind)) {
                if reported.insert((b.id, kind, f.name.clone())) {
                    ctx.emit(Diagnostic::error(
                        f.loc.clone(),
                        format!("target backend '{}' does not support element type {} (used in @{})", b.id, kind.mnemonic(), f.name),
                    ));
                    failed = true;
                }
            }
        }

        if failed {
            return Err(PassFailure);
        }
        module.set_attr("hal.targets", ids.join(","));
        Ok(())
    }
}
