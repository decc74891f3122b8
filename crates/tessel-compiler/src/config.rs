//! config.rs — Configuration du compilateur tessel.
//!
//! - Defaults (`Config::default()`)
//! - Lecture **ENV** (préfixe `TESSEL_...`) via `Config::from_env()`
//! - **Overrides CLI** via `CliOverrides` (appliqués avec `apply_cli_overrides`)
//! - `validate()` puis `compile_options()` → `CompileOptions`
//!
//! ENV supportés (tous facultatifs) :
//!   TESSEL_TARGETS=interpreter,vmla,...
//!   TESSEL_OUTPUT=binary|text|ir
//!   TESSEL_OPTIMIZE=0|1
//!   TESSEL_STRIP_DEBUG_OPS=0|1
//!   TESSEL_STRIP_SOURCE_MAP=0|1
//!   TESSEL_STRIP_SYMBOLS=0|1
//!   TESSEL_CRASH_REPRODUCER=<chemin>

use std::path::PathBuf;

use crate::backend::hal::{target_backend, target_ids};
use crate::backend::{CompileOptions, OutputFormat};
use crate::error::{CompileError, Result};

/* ─────────────────────────── Types publics ─────────────────────────── */

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Backends cibles, dans l’ordre ; vide = `interpreter`.
    pub targets: Vec<String>,
    pub output_format: OutputFormat,
    pub optimize: bool,
    pub strip_debug_ops: bool,
    pub strip_source_map: bool,
    pub strip_symbols: bool,
    /// Reproducteur de crash (posé comme défaut process par la CLI).
    pub crash_reproducer: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            output_format: OutputFormat::BytecodeBinary,
            optimize: true,
            strip_debug_ops: false,
            strip_source_map: false,
            strip_symbols: false,
            crash_reproducer: None,
        }
    }
}

/* ─────────────────────── Overrides (CLI / couches) ─────────────────────── */

/// Toutes les valeurs sont optionnelles — applique-les avec `apply_cli_overrides`.
#[derive(Default, Clone, Debug)]
pub struct CliOverrides {
    pub targets: Option<Vec<String>>,
    pub output_format: Option<OutputFormat>,
    pub optimize: Option<bool>,
    pub strip_debug_ops: Option<bool>,
    pub strip_source_map: Option<bool>,
    pub strip_symbols: Option<bool>,
    pub crash_reproducer: Option<PathBuf>,
}

impl Config {
    /// Construit depuis les valeurs par défaut + ENV.
    pub fn from_env() -> Self {
        let mut c = Self::default();
        c.apply_env();
        c
    }

    /// Applique les variables d’environnement `TESSEL_*`.
    pub fn apply_env(&mut self) {
        self.apply_env_with(read_env);
    }

    /// Même chose avec une source de variables arbitraire.
    pub fn apply_env_with(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("TESSEL_TARGETS")          { self.targets = parse_list(&v); }
        if let Some(v) = env("TESSEL_OUTPUT")           { if let Ok(f) = v.parse() { self.output_format = f; } }
        if let Some(v) = env("TESSEL_OPTIMIZE")         { if let Some(b) = parse_bool(&v) { self.optimize = b; } }
        if let Some(v) = env("TESSEL_STRIP_DEBUG_OPS")  { if let Some(b) = parse_bool(&v) { self.strip_debug_ops = b; } }
        if let Some(v) = env("TESSEL_STRIP_SOURCE_MAP") { if let Some(b) = parse_bool(&v) { self.strip_source_map = b; } }
        if let Some(v) = env("TESSEL_STRIP_SYMBOLS")    { if let Some(b) = parse_bool(&v) { self.strip_symbols = b; } }
        if let Some(v) = env("TESSEL_CRASH_REPRODUCER") { if !v.trim().is_empty() { self.crash_reproducer = Some(PathBuf::from(v.trim())); } }
    }

    /// Applique des overrides “dernier mot” typiquement issus d’une CLI.
    pub fn apply_cli_overrides(&mut self, o: &CliOverrides) {
        if let Some(x) = &o.targets          { self.targets = x.clone(); }
        if let Some(x) = o.output_format     { self.output_format = x; }
        if let Some(x) = o.optimize          { self.optimize = x; }
        if let Some(x) = o.strip_debug_ops   { self.strip_debug_ops = x; }
        if let Some(x) = o.strip_source_map  { self.strip_source_map = x; }
        if let Some(x) = o.strip_symbols     { self.strip_symbols = x; }
        if let Some(x) = &o.crash_reproducer { self.crash_reproducer = Some(x.clone()); }
    }

    /// Rejette les identifiants de cibles inconnus.
    pub fn validate(&self) -> Result<()> {
        if let Some(bad) = self.targets.iter().find(|t| target_backend(t).is_none()) {
            let known: Vec<_> = target_ids().collect();
            return Err(CompileError::Config(format!(
                "unknown target backend '{bad}' (registered: {})",
                known.join(", ")
            )));
        }
        Ok(())
    }

    pub const fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            output_format: self.output_format,
            optimize: self.optimize,
            strip_debug_ops: self.strip_debug_ops,
            strip_source_map: self.strip_source_map,
            strip_symbols: self.strip_symbols,
        }
    }
}

/* ────────────────────────── Parsing d’ENV ────────────────────────── */

fn read_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn parse_list(s: &str) -> Vec<String> {
    s.split(',').map(str::trim).filter(|t| !t.is_empty()).map(str::to_string).collect()
}

/* ───────────────────────────── Tests ───────────────────────────── */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert!(c.targets.is_empty());
        assert!(c.optimize);
        assert_eq!(c.output_format, OutputFormat::BytecodeBinary);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn env_layer_then_cli_last_word() {
        let mut c = Config::default();
        c.apply_env_with(|k| match k {
            "TESSEL_TARGETS" => Some("vmla, llvm-ir".into()),
            "TESSEL_OUTPUT" => Some("ir".into()),
            "TESSEL_OPTIMIZE" => Some("off".into()),
            "TESSEL_STRIP_SYMBOLS" => Some("weird".into()),
            _ => None,
        });
        assert_eq!(c.targets, ["vmla", "llvm-ir"]);
        assert_eq!(c.output_format, OutputFormat::IrText);
        assert!(!c.optimize);
        assert!(!c.strip_symbols);

        let o = CliOverrides { optimize: Some(true), targets: Some(vec!["interpreter".into()]), ..CliOverrides::default() };
        c.apply_cli_overrides(&o);
        assert!(c.optimize);
        assert_eq!(c.targets, ["interpreter"]);
        assert!(c.compile_options().optimize);
    }

    #[test]
    fn validate_rejects_unknown_targets() {
        let c = Config { targets: vec!["cuda".into()], ..Config::default() };
        let err = c.validate().unwrap_err();
        assert!(err.to_string().contains("unknown target backend 'cuda'"));
        assert!(err.is_invalid_argument());
    }
}
