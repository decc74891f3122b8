//! instance.rs — Ancre process de la VM.

use std::sync::Arc;

use tracing::info;

use crate::refs::{self, RefTypeId};

#[derive(Debug)]
struct InstanceInner {
    ro_byte_buffer: RefTypeId,
}

/// Poignée requise pour créer des contextes. Ne porte aucun état mutable.
#[derive(Debug, Clone)]
pub struct VmInstance(Arc<InstanceInner>);

impl VmInstance {
    /// Enregistre les types de référence intégrés (une fois par process).
    ///
    /// # Panics
    /// Si l’enregistrement des types intégrés échoue : la VM serait inutilisable.
    pub fn create() -> Self {
        let ro_byte_buffer = match refs::register_builtin_types() {
            Ok(id) => id,
            Err(status) => panic!("failed to register builtin VM types: {status}"),
        };
        info!(target: "tessel-vm", "instance VM créée");
        Self(Arc::new(InstanceInner { ro_byte_buffer }))
    }

    /// Type de référence des segments rodata (`vm.ro_byte_buffer`).
    pub fn ro_byte_buffer_type(&self) -> RefTypeId {
        self.0.ro_byte_buffer
    }
}

impl Default for VmInstance {
    fn default() -> Self {
        Self::create()
    }
}
