//! context.rs — Contexte de compilation et portées de capture de diagnostics.
//!
//! - Le contexte possède une pile de portées ; la base est la capture par
//!   défaut (sans parent). Les diagnostics émis vont à la portée du sommet.
//! - À la fermeture d’une portée, ce qui n’a pas été consommé est ajouté,
//!   dans l’ordre, à la portée parente. La capture par défaut disparaît avec
//!   le contexte et ses diagnostics non consommés avec elle.
//! - Chemin de reproducteur de crash : défaut process (un seul mutex) +
//!   surcharge par contexte.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::diagnostics::{format_report, Diagnostic};

static DEFAULT_CRASH_REPRODUCER: Mutex<Option<PathBuf>> = parking_lot::const_mutex(None);

const ROOT_SCOPE: u64 = 0;

struct Scope {
    id: u64,
    diagnostics: Vec<Diagnostic>,
}

pub(crate) struct ContextInner {
    scopes: Mutex<Vec<Scope>>,
    next_scope: AtomicU64,
    crash_reproducer_path: Mutex<Option<PathBuf>>,
}

/// Poignée partagée ; les bundles la gardent en vie.
#[derive(Clone)]
pub struct CompilerContext(Arc<ContextInner>);

impl CompilerContext {
    pub fn new() -> Self {
        Self(Arc::new(ContextInner {
            scopes: Mutex::new(vec![Scope { id: ROOT_SCOPE, diagnostics: Vec::new() }]),
            next_scope: AtomicU64::new(ROOT_SCOPE + 1),
            crash_reproducer_path: Mutex::new(None),
        }))
    }

    /// Ouvre une portée imbriquée sous la portée courante.
    pub fn capture_diagnostics(&self) -> DiagnosticCapture {
        let id = self.0.next_scope.fetch_add(1, Ordering::Relaxed);
        self.0.scopes.lock().push(Scope { id, diagnostics: Vec::new() });
        DiagnosticCapture { ctx: Arc::clone(&self.0), id }
    }

    /// Émet vers la portée la plus interne.
    pub fn emit(&self, diagnostic: Diagnostic) {
        let mut scopes = self.0.scopes.lock();
        if let Some(top) = scopes.last_mut() {
            top.diagnostics.push(diagnostic);
        }
    }

    /// Consomme la capture par défaut (diagnostics remontés des portées fermées).
    pub fn get_diagnostics(&self) -> String {
        let taken = std::mem::take(&mut self.0.scopes.lock()[0].diagnostics);
        format_report("", &taken)
    }

    pub fn clear_diagnostics(&self) {
        self.0.scopes.lock()[0].diagnostics.clear();
    }

    pub fn default_crash_reproducer_path() -> Option<PathBuf> {
        DEFAULT_CRASH_REPRODUCER.lock().clone()
    }

    pub fn set_default_crash_reproducer_path(path: Option<PathBuf>) {
        *DEFAULT_CRASH_REPRODUCER.lock() = path;
    }

    /// Surcharge du contexte, sinon défaut process.
    pub fn crash_reproducer_path(&self) -> Option<PathBuf> {
        self.0.crash_reproducer_path.lock().clone().or_else(Self::default_crash_reproducer_path)
    }

    pub fn set_crash_reproducer_path(&self, path: Option<PathBuf>) {
        *self.0.crash_reproducer_path.lock() = path;
    }
}

impl Default for CompilerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CompilerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerContext").field("scopes", &self.0.scopes.lock().len()).finish()
    }
}

/* ─────────────────────────── DiagnosticCapture ─────────────────────────── */

/// Portée de capture ; se referme (et transmet au parent) au `Drop`.
pub struct DiagnosticCapture {
    ctx: Arc<ContextInner>,
    id: u64,
}

impl DiagnosticCapture {
    fn with_scope<R>(&self, f: impl FnOnce(&mut Vec<Diagnostic>) -> R) -> Option<R> {
        let mut scopes = self.ctx.scopes.lock();
        scopes.iter_mut().find(|s| s.id == self.id).map(|s| f(&mut s.diagnostics))
    }

    /// Retire les diagnostics capturés.
    pub fn take(&self) -> Vec<Diagnostic> {
        self.with_scope(std::mem::take).unwrap_or_default()
    }

    /// Copie sans consommer.
    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.with_scope(|d| d.clone()).unwrap_or_default()
    }

    pub fn consume_as_string(&self, prefix: &str) -> String {
        format_report(prefix, &self.take())
    }

    pub fn clear(&self) {
        self.with_scope(Vec::clear);
    }

    /// Succès : les diagnostics sont journalisés puis abandonnés.
    pub(crate) fn discard(&self, operation: &str) {
        for d in self.take() {
            debug!(
                target: "tessel-compiler",
                operation,
                severity = d.severity.tag(),
                message = %d.message,
                "diagnostic ignoré"
            );
        }
    }

    pub fn len(&self) -> usize {
        self.with_scope(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_errors(&self) -> bool {
        self.with_scope(|d| d.iter().any(Diagnostic::is_error)).unwrap_or(false)
    }
}

impl Drop for DiagnosticCapture {
    fn drop(&mut self) {
        let mut scopes = self.ctx.scopes.lock();
        let Some(index) = scopes.iter().position(|s| s.id == self.id) else {
            return;
        };
        let closed = scopes.remove(index);
        if let Some(parent) = index.checked_sub(1).and_then(|p| scopes.get_mut(p)) {
            parent.diagnostics.extend(closed.diagnostics);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Location;

    fn error(msg: &str) -> Diagnostic {
        Diagnostic::error(Location::Unknown, msg)
    }

    #[test]
    fn child_diagnostics_reach_the_parent_in_order() {
        let ctx = CompilerContext::new();
        let parent = ctx.capture_diagnostics();
        ctx.emit(error("p1"));
        {
            let _child = ctx.capture_diagnostics();
            ctx.emit(error("c1"));
            ctx.emit(error("c2"));
        }
        ctx.emit(error("p2"));
        let messages: Vec<_> = parent.take().into_iter().map(|d| d.message).collect();
        assert_eq!(messages, ["p1", "c1", "c2", "p2"]);
    }

    #[test]
    fn consumed_diagnostics_are_not_forwarded() {
        let ctx = CompilerContext::new();
        {
            let capture = ctx.capture_diagnostics();
            ctx.emit(error("seen"));
            assert!(capture.has_errors());
            let report = capture.consume_as_string("prefix");
            assert!(report.starts_with("prefix\n\n[ERROR]: seen"));
        }
        assert_eq!(ctx.get_diagnostics(), "");
    }

    #[test]
    fn unconsumed_diagnostics_land_in_the_default_capture() {
        let ctx = CompilerContext::new();
        {
            let _capture = ctx.capture_diagnostics();
            ctx.emit(error("lost?"));
        }
        assert_eq!(ctx.get_diagnostics(), "[ERROR]: lost?\n  [unknown location]\n");
        assert_eq!(ctx.get_diagnostics(), "");

        {
            let _capture = ctx.capture_diagnostics();
            ctx.emit(error("dropped"));
        }
        ctx.clear_diagnostics();
        assert_eq!(ctx.get_diagnostics(), "");
    }

    #[test]
    fn crash_reproducer_override_falls_back_to_default() {
        let ctx = CompilerContext::new();
        ctx.set_crash_reproducer_path(Some(PathBuf::from("/tmp/ctx.mlir")));
        assert_eq!(ctx.crash_reproducer_path(), Some(PathBuf::from("/tmp/ctx.mlir")));
        ctx.set_crash_reproducer_path(None);
        assert_eq!(ctx.crash_reproducer_path(), CompilerContext::default_crash_reproducer_path());
    }
}
