//! error.rs — Erreurs du compilateur.
//!
//! Les variantes porteuses de diagnostics contiennent le rapport complet
//! (préfixe + entrées), déjà formaté par la capture qui les a collectés.

use thiserror::Error;

pub const PARSE_PREFIX: &str = "Error parsing ASM";
pub const COMPILE_PREFIX: &str = "Error compiling module:";
pub const SERIALIZE_PREFIX: &str = "Error serializing to bytecode:";
pub const RUN_PASSES_PREFIX: &str = "Error running pass pipelines:";

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{0}")]
    Parse(String),
    /// Descripteur de pipeline invalide : message brut, aucun pass exécuté.
    #[error("{0}")]
    PipelineParse(String),
    #[error("{0}")]
    Compile(String),
    #[error("{0}")]
    Serialize(String),
    #[error("{0}")]
    RunPasses(String),
    #[error("module has already been compiled; its IR is lowered and cannot go through the backend pipeline again")]
    AlreadyCompiled,
    #[error("invalid compiler configuration: {0}")]
    Config(String),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl CompileError {
    /// Entrée mal formée (par opposition à un échec du pipeline).
    pub const fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::Parse(_) | Self::PipelineParse(_) | Self::Config(_))
    }

    pub const fn is_failed_precondition(&self) -> bool {
        matches!(self, Self::AlreadyCompiled)
    }
}

pub type Result<T, E = CompileError> = std::result::Result<T, E>;
