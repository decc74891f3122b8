//! pass/mod.rs — Passes, registre, descripteurs textuels de pipelines.
//!
//! Grammaire d’un descripteur :
//! ```text
//! pipeline := item ("," item)*
//! item     := name ("{" key "=" value (" " key "=" value)* "}")?
//!           | "func(" pipeline ")" | "module(" pipeline ")"
//! ```
//! - Un pass de portée fonction cité au niveau module est appliqué à chaque
//!   fonction ; `func(...)` regroupe plusieurs passes fonction.
//! - Un pass module ne peut pas apparaître dans `func(...)`.
//! - Toute erreur d’analyse est détectée avant l’exécution du moindre pass.

use std::fmt;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::backend::{flow::MaterializeReflection, hal::MaterializeTargets};
use crate::context::CompilerContext;
use crate::diagnostics::Diagnostic;
use crate::ir::printer::{print_module, PrintOptions};
use crate::ir::verify::verify_module;
use crate::ir::{Function, Location, Module};

pub mod canonicalize;
pub mod dce;
pub mod strip_debug;

pub use canonicalize::Canonicalize;
pub use dce::{DeadCodeElimination, SymbolDce};
pub use strip_debug::StripDebugInfo;

/* ───────────────────────────── Trait ───────────────────────────── */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassScope {
    Module,
    Function,
}

/// Échec d’un pass ; le détail est déjà émis dans le contexte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassFailure;

pub type PassResult = Result<(), PassFailure>;

pub trait Pass: Send + Sync {
    fn name(&self) -> &'static str;

    fn scope(&self) -> PassScope;

    /// Forme textuelle ré-analysable (options comprises).
    fn description(&self) -> String {
        self.name().to_string()
    }

    fn run_on_module(&self, _module: &mut Module, _ctx: &CompilerContext) -> PassResult {
        Ok(())
    }

    fn run_on_function(&self, _function: &mut Function, _ctx: &CompilerContext) -> PassResult {
        Ok(())
    }
}

impl fmt::Debug for dyn Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/* ──────────────────────────── Registre ──────────────────────────── */

/// Options `clé=valeur` d’un item de pipeline, dans l’ordre d’écriture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassOptions(Vec<(String, String)>);

impl PassOptions {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

type BuildFn = fn(&PassOptions) -> Result<Box<dyn Pass>, String>;

fn build_default<P: Pass + Default + 'static>(_: &PassOptions) -> Result<Box<dyn Pass>, String> {
    Ok(Box::new(P::default()))
}

pub struct PassInfo {
    pub name: &'static str,
    pub scope: PassScope,
    pub summary: &'static str,
    pub options: &'static [&'static str],
    build: BuildFn,
}

impl fmt::Debug for PassInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassInfo").field("name", &self.name).field("scope", &self.scope).finish()
    }
}

static REGISTRY: &[PassInfo] = &[
    PassInfo {
        name: "verify",
        scope: PassScope::Module,
        summary: "vérifie la cohérence structurelle et les types",
        options: &[],
        build: build_default::<Verify>,
    },
    PassInfo {
        name: "canonicalize",
        scope: PassScope::Function,
        summary: "replie les opérations pures sur constantes",
        options: &[],
        build: build_default::<Canonicalize>,
    },
    PassInfo {
        name: "dce",
        scope: PassScope::Function,
        summary: "supprime les opérations pures dont les résultats sont inutilisés",
        options: &[],
        build: build_default::<DeadCodeElimination>,
    },
    PassInfo {
        name: "symbol-dce",
        scope: PassScope::Module,
        summary: "supprime les fonctions non atteignables depuis les exports",
        options: &[],
        build: build_default::<SymbolDce>,
    },
    PassInfo {
        name: "strip-debuginfo",
        scope: PassScope::Module,
        summary: "remplace toutes les localisations par `unknown`",
        options: &[],
        build: build_default::<StripDebugInfo>,
    },
    PassInfo {
        name: "flow-materialize-reflection",
        scope: PassScope::Module,
        summary: "attache les métadonnées de réflexion ABI aux fonctions exportées",
        options: &[],
        build: build_default::<MaterializeReflection>,
    },
    PassInfo {
        name: "hal-materialize-targets",
        scope: PassScope::Module,
        summary: "valide et enregistre les backends cibles (`targets=a;b`)",
        options: &["targets"],
        build: MaterializeTargets::from_options,
    },
];

pub fn registered_passes() -> &'static [PassInfo] {
    REGISTRY
}

pub fn lookup_pass(name: &str) -> Option<&'static PassInfo> {
    REGISTRY.iter().find(|p| p.name == name)
}

/* ─────────────────────────── Pipelines ─────────────────────────── */

pub enum Stage {
    Module(Box<dyn Pass>),
    /// Passes appliqués, dans l’ordre, à chaque fonction.
    Functions(Vec<Box<dyn Pass>>),
}

impl Stage {
    pub fn description(&self) -> String {
        match self {
            Self::Module(p) => p.description(),
            Self::Functions(ps) if ps.len() == 1 => ps[0].description(),
            Self::Functions(ps) => {
                let inner: Vec<_> = ps.iter().map(|p| p.description()).collect();
                format!("func({})", inner.join(","))
            }
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// Analyse un descripteur ; aucune instanciation partielle n’est exposée.
pub fn parse_pipeline(text: &str) -> Result<Vec<Stage>, String> {
    let mut parser = PipelineParser { text, chars: text.char_indices().collect(), pos: 0 };
    let stages = parser.items(PassScope::Module)?;
    parser.skip_ws();
    match parser.peek() {
        None => Ok(stages),
        Some(')') => Err(parser.error("unbalanced ')'")),
        Some(c) => Err(parser.error(&format!("unexpected '{c}'"))),
    }
}

struct PipelineParser<'a> {
    text: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl PipelineParser<'_> {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|(_, c)| *c)
    }

    fn offset(&self) -> usize {
        self.chars.get(self.pos).map_or(self.text.len(), |(o, _)| *o)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn error(&self, message: &str) -> String {
        format!("invalid pass pipeline '{}': {message} at offset {}", self.text, self.offset())
    }

    fn name(&mut self) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek().filter(|c| c.is_ascii_alphanumeric() || matches!(*c, '-' | '_' | '.')) {
            out.push(c);
            self.pos += 1;
        }
        out
    }

    fn items(&mut self, scope: PassScope) -> Result<Vec<Stage>, String> {
        let mut stages = Vec::new();
        self.skip_ws();
        if matches!(self.peek(), None | Some(')')) {
            return Ok(stages);
        }
        loop {
            self.skip_ws();
            let name = self.name();
            if name.is_empty() {
                return Err(self.error("expected a pass name"));
            }
            self.skip_ws();
            if self.peek() == Some('(') {
                self.pos += 1;
                let nested = match (name.as_str(), scope) {
                    ("func", PassScope::Function) => return Err(self.error("'func' pipelines cannot be nested")),
                    ("module", PassScope::Function) => {
                        return Err(self.error("'module' pipeline cannot appear inside 'func'"))
                    }
                    ("func", PassScope::Module) => self.items(PassScope::Function)?,
                    ("module", PassScope::Module) => self.items(PassScope::Module)?,
                    _ => return Err(self.error(&format!("'{name}' is not a pipeline anchor (expected 'func' or 'module')"))),
                };
                self.skip_ws();
                if self.peek() != Some(')') {
                    return Err(self.error("unbalanced '('"));
                }
                self.pos += 1;
                if name == "func" {
                    let passes = nested
                        .into_iter()
                        .flat_map(|s| match s {
                            Stage::Functions(ps) => ps,
                            Stage::Module(p) => vec![p],
                        })
                        .collect();
                    stages.push(Stage::Functions(passes));
                } else {
                    stages.extend(nested);
                }
            } else {
                let options = self.options(&name)?;
                stages.push(self.instantiate(&name, &options, scope)?);
            }
            self.skip_ws();
            if self.peek() == Some(',') {
                self.pos += 1;
            } else {
                return Ok(stages);
            }
        }
    }

    fn options(&mut self, pass: &str) -> Result<PassOptions, String> {
        let mut options = Vec::new();
        if self.peek() != Some('{') {
            return Ok(PassOptions(options));
        }
        self.pos += 1;
        loop {
            self.skip_ws();
            match self.peek() {
                Some('}') => {
                    self.pos += 1;
                    return Ok(PassOptions(options));
                }
                None => return Err(self.error(&format!("missing '}}' after options of '{pass}'"))),
                Some(_) => {}
            }
            let key = self.name();
            if key.is_empty() || self.peek() != Some('=') {
                return Err(self.error(&format!("expected 'key=value' in options of '{pass}'")));
            }
            self.pos += 1;
            let mut value = String::new();
            while let Some(c) = self.peek().filter(|c| !c.is_whitespace() && *c != '}') {
                value.push(c);
                self.pos += 1;
            }
            options.push((key, value));
        }
    }

    fn instantiate(&self, name: &str, options: &PassOptions, scope: PassScope) -> Result<Stage, String> {
        let info = lookup_pass(name).ok_or_else(|| self.error(&format!("'{name}' does not refer to a registered pass")))?;
        if let Some((key, _)) = options.iter().find(|(k, _)| !info.options.contains(k)) {
            return Err(self.error(&format!("unknown option '{key}' for pass '{name}'")));
        }
        if scope == PassScope::Function && info.scope == PassScope::Module {
            return Err(self.error(&format!("module pass '{name}' cannot run inside 'func'")));
        }
        let pass = (info.build)(options).map_err(|e| self.error(&e))?;
        Ok(match info.scope {
            PassScope::Module => Stage::Module(pass),
            PassScope::Function => Stage::Functions(vec![pass]),
        })
    }
}

/* ─────────────────────────── PassManager ─────────────────────────── */

/// Suite d’étapes exécutées dans l’ordre ; premier échec = arrêt.
#[derive(Debug, Default)]
pub struct PassManager {
    stages: Vec<Stage>,
}

impl PassManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ajoute un descripteur ; en cas d’erreur le gestionnaire est inchangé.
    pub fn add_pipeline(&mut self, text: &str) -> Result<(), String> {
        let stages = parse_pipeline(text)?;
        self.stages.extend(stages);
        Ok(())
    }

    pub fn add_stage(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn description(&self) -> String {
        self.stages.iter().map(Stage::description).collect::<Vec<_>>().join(",")
    }

    /// Exécute les étapes. Si un chemin de reproducteur est configuré sur le
    /// contexte, l’IR d’entrée y est écrit quand une étape échoue.
    pub fn run(&self, module: &mut Module, ctx: &CompilerContext) -> PassResult {
        let reproducer = ctx.crash_reproducer_path();
        let snapshot = reproducer
            .as_ref()
            .map(|_| print_module(module, PrintOptions { debug_info: true, ..PrintOptions::default() }));

        for stage in &self.stages {
            debug!(target: "tessel-compiler", stage = %stage.description(), "pass");
            let outcome = match stage {
                Stage::Module(pass) => pass.run_on_module(module, ctx),
                Stage::Functions(passes) => module
                    .functions
                    .iter_mut()
                    .try_for_each(|f| passes.iter().try_for_each(|p| p.run_on_function(f, ctx))),
            };
            if outcome.is_err() {
                warn!(target: "tessel-compiler", stage = %stage.description(), "échec du pass");
                if let (Some(path), Some(ir)) = (reproducer.as_deref(), snapshot.as_deref()) {
                    self.write_reproducer(path, &stage.description(), ir, ctx);
                }
                return Err(PassFailure);
            }
        }
        Ok(())
    }

    fn write_reproducer(&self, path: &Path, failed: &str, ir: &str, ctx: &CompilerContext) {
        let contents = format!(
            "// tessel crash reproducer\n// pipeline: {}\n// failed: {failed}\n{ir}",
            self.description()
        );
        match std::fs::write(path, contents) {
            Ok(()) => {
                info!(target: "tessel-compiler", path = %path.display(), "reproducteur écrit");
                ctx.emit(Diagnostic::note(
                    Location::Unknown,
                    format!("crash reproducer written to {}", path.display()),
                ));
            }
            Err(e) => ctx.emit(Diagnostic::warning(
                Location::Unknown,
                format!("could not write crash reproducer to {}: {e}", path.display()),
            )),
        }
    }
}

/* ─────────────────────────── Passes simples ─────────────────────────── */

/// Rejoue le vérificateur ; chaque violation devient un diagnostic.
#[derive(Debug, Clone, Copy, Default)]
pub struct Verify;

impl Pass for Verify {
    fn name(&self) -> &'static str {
        "verify"
    }

    fn scope(&self) -> PassScope {
        PassScope::Module
    }

    fn run_on_module(&self, module: &mut Module, ctx: &CompilerContext) -> PassResult {
        let problems = verify_module(module);
        if problems.is_empty() {
            return Ok(());
        }
        for d in problems {
            ctx.emit(d);
        }
        Err(PassFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn describe(text: &str) -> Result<String, String> {
        let mut pm = PassManager::new();
        pm.add_pipeline(text)?;
        Ok(pm.description())
    }

    #[test]
    fn parses_nested_pipelines() {
        assert_eq!(describe("verify, func(canonicalize,dce) ,symbol-dce").unwrap(), "verify,func(canonicalize,dce),symbol-dce");
        assert_eq!(describe("module(strip-debuginfo,dce)").unwrap(), "strip-debuginfo,dce");
        assert_eq!(
            describe("hal-materialize-targets{targets=vmla;interpreter}").unwrap(),
            "hal-materialize-targets{targets=vmla;interpreter}"
        );
        assert_eq!(describe("").unwrap(), "");
    }

    #[test]
    fn rejects_malformed_pipelines() {
        let err = describe("canonicalize,bogus").unwrap_err();
        assert!(err.contains("'bogus' does not refer to a registered pass"), "{err}");
        assert!(describe("func(canonicalize").unwrap_err().contains("unbalanced '('"));
        assert!(describe("canonicalize)").unwrap_err().contains("unbalanced ')'"));
        assert!(describe("func(symbol-dce)").unwrap_err().contains("cannot run inside 'func'"));
        assert!(describe("func(func(dce))").unwrap_err().contains("cannot be nested"));
        assert!(describe("dce{x=1}").unwrap_err().contains("unknown option 'x'"));
        assert!(describe("hal-materialize-targets{targets=vmla").unwrap_err().contains("missing '}'"));
    }

    #[test]
    fn failed_parse_leaves_manager_untouched() {
        let mut pm = PassManager::new();
        pm.add_pipeline("verify").unwrap();
        assert!(pm.add_pipeline("dce,nope").is_err());
        assert_eq!(pm.len(), 1);
    }

    #[test]
    fn registry_lists_every_pass_once() {
        let names: Vec<_> = registered_passes().iter().map(|p| p.name).collect();
        for (i, n) in names.iter().enumerate() {
            assert!(!names[..i].contains(n), "duplicate {n}");
        }
        assert_eq!(lookup_pass("dce").map(|p| p.scope), Some(PassScope::Function));
    }
}
