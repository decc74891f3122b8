//! diagnostics.rs — Diagnostics du compilateur et rendu en rapport texte.
//!
//! Rapport :
//! ```text
//! <préfixe>\n\n[ERROR]: message\n  at: fichier.tsl:3:5\t\t( chemin/fichier.tsl:3:5 )\n
//! ```
//! Les entrées sont séparées par une ligne vide ; chaque entrée est suivie
//! de sa localisation rendue sur plusieurs lignes.

use std::fmt::{self, Write as _};

use crate::ir::Location;

const RUNFILES: &str = ".runfiles/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Note,
    Warning,
    Error,
    Remark,
    Unknown,
}

impl Severity {
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Note => "[NOTE]",
            Self::Warning => "[WARNING]",
            Self::Error => "[ERROR]",
            Self::Remark => "[REMARK]",
            Self::Unknown => "[UNKNOWN]",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub location: Location,
}

impl Diagnostic {
    pub fn new(severity: Severity, location: Location, message: impl Into<String>) -> Self {
        Self { severity, message: message.into(), location }
    }

    pub fn error(location: Location, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, location, message)
    }

    pub fn warning(location: Location, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, location, message)
    }

    pub fn note(location: Location, message: impl Into<String>) -> Self {
        Self::new(Severity::Note, location, message)
    }

    pub fn remark(location: Location, message: impl Into<String>) -> Self {
        Self::new(Severity::Remark, location, message)
    }

    pub const fn is_error(&self) -> bool {
        matches!(self.severity, Severity::Error)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}\n{}", self.severity.tag(), self.message, render_location(&self.location))
    }
}

/// Rapport complet ; `prefix` vide = pas de préfixe.
pub fn format_report(prefix: &str, diagnostics: &[Diagnostic]) -> String {
    let mut out = String::new();
    let mut first = true;
    if !prefix.is_empty() {
        out.push_str(prefix);
        first = false;
    }
    for d in diagnostics {
        if !first {
            out.push_str("\n\n");
        }
        first = false;
        let _ = write!(&mut out, "{d}");
    }
    out
}

/// Rendu multi-ligne d’une localisation.
pub fn render_location(loc: &Location) -> String {
    let mut out = String::new();
    write_location(loc, &mut out);
    out
}

fn write_location(loc: &Location, out: &mut String) {
    match loc {
        Location::Opaque { fallback } => write_location(fallback, out),
        Location::Unknown => out.push_str("  [unknown location]\n"),
        Location::FileLineCol { file, line, col } => {
            let suffix = format!(":{line}:{col}");
            match file.rfind(|c: char| c == '/' || c == '\\') {
                Some(slash) => {
                    let basename = &file[slash + 1..];
                    let extended = file.rfind(RUNFILES).map_or(file.as_str(), |i| &file[i + RUNFILES.len()..]);
                    let _ = writeln!(out, "  at: {basename}{suffix}\t\t( {extended}{suffix} )");
                }
                None => {
                    let _ = writeln!(out, "  at: {file}{suffix}");
                }
            }
        }
        Location::Name { name, child } => {
            let _ = writeln!(out, "  @'{name}':");
            if !child.is_unknown() {
                out.push_str("(...\n");
                write_location(child, out);
                out.push_str(")\n");
            }
        }
        Location::CallSite { callee, caller } => {
            write_location(caller, out);
            write_location(callee, out);
        }
    }
}
