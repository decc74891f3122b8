//! context.rs — Contextes d’exécution (ouverts / fermés).
//!
//! - Ouvert : enregistrement incrémental des modules.
//! - Fermé : ensemble de modules figé à la création ; tout
//!   `register_modules` ultérieur échoue (FailedPrecondition).
//! - Les imports `module.fonction` sont résolus à l’enregistrement, contre
//!   les modules déjà présents (ordre d’enregistrement, premier trouvé).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::instance::VmInstance;
use crate::interp::Interpreter;
use crate::module::{Linkage, ModuleBody, VmFunction, VmModule};
use crate::status::{Status, VmResult};
use crate::variant::VariantList;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Module enregistré + ses imports résolus (indexés par ordinal d’import).
pub(crate) struct RegisteredModule {
    pub(crate) module: VmModule,
    pub(crate) imports: Vec<VmFunction>,
}

#[derive(Default)]
pub(crate) struct ContextState {
    pub(crate) modules: Vec<RegisteredModule>,
}

impl ContextState {
    pub(crate) fn find(&self, module: &VmModule) -> Option<&RegisteredModule> {
        self.modules.iter().find(|m| VmModule::ptr_eq(&m.module, module))
    }
}

struct ContextInner {
    id: u64,
    is_static: bool,
    instance: VmInstance,
    state: RwLock<ContextState>,
}

#[derive(Clone)]
pub struct VmContext(Arc<ContextInner>);

impl VmContext {
    /// Contexte ouvert, sans module.
    pub fn create(instance: &VmInstance) -> VmResult<Self> {
        let ctx = Self::with_flags(instance, false);
        info!(target: "tessel-vm", context = ctx.context_id(), "contexte ouvert créé");
        Ok(ctx)
    }

    /// Contexte fermé : exactement `modules`, dans l’ordre.
    pub fn create_with_modules(instance: &VmInstance, modules: &[VmModule]) -> VmResult<Self> {
        let ctx = Self::with_flags(instance, true);
        register_into(&mut ctx.0.state.write(), modules)?;
        info!(target: "tessel-vm", context = ctx.context_id(), modules = modules.len(), "contexte fermé créé");
        Ok(ctx)
    }

    fn with_flags(instance: &VmInstance, is_static: bool) -> Self {
        Self(Arc::new(ContextInner {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            is_static,
            instance: instance.clone(),
            state: RwLock::new(ContextState::default()),
        }))
    }

    pub fn instance(&self) -> &VmInstance {
        &self.0.instance
    }

    pub fn context_id(&self) -> u64 {
        self.0.id
    }

    pub fn is_static(&self) -> bool {
        self.0.is_static
    }

    pub fn register_modules(&self, modules: &[VmModule]) -> VmResult<()> {
        if self.0.is_static {
            return Err(Status::failed_precondition(format!(
                "context {} is closed: its module set was fixed at creation",
                self.0.id
            )));
        }
        register_into(&mut self.0.state.write(), modules)?;
        debug!(target: "tessel-vm", context = self.0.id, added = modules.len(), "modules enregistrés");
        Ok(())
    }

    pub fn modules(&self) -> Vec<VmModule> {
        self.0.state.read().modules.iter().map(|m| m.module.clone()).collect()
    }

    /// Résout `module.fonction` parmi les exports ; premier module trouvé.
    pub fn resolve_function(&self, full_name: &str) -> Option<VmFunction> {
        let (module_name, function_name) = full_name.split_once('.')?;
        let state = self.0.state.read();
        state
            .modules
            .iter()
            .filter(|m| m.module.name() == module_name)
            .find_map(|m| m.module.lookup_function(function_name, Linkage::Export))
    }

    /// Invoque `function` ; `outputs` n’est modifié qu’en cas de succès.
    pub fn invoke(&self, function: &VmFunction, inputs: &VariantList, outputs: &mut VariantList) -> VmResult<()> {
        let signature = function.signature()?;
        if inputs.len() != signature.inputs.len() {
            return Err(Status::invalid_argument(format!(
                "input arity mismatch: {function} expects {} arguments, got {}",
                signature.inputs.len(),
                inputs.len()
            )));
        }
        for (i, (value, kind)) in inputs.iter().zip(&signature.inputs).enumerate() {
            if !value.matches(*kind) {
                return Err(Status::invalid_argument(format!(
                    "argument {i} of {function} must be {kind}, got {}",
                    value.kind().map_or_else(|| "empty".to_string(), |k| k.to_string())
                )));
            }
        }
        if outputs.capacity() < signature.results.len() {
            return Err(Status::invalid_argument(format!(
                "output list capacity {} is smaller than the {} results of {function}",
                outputs.capacity(),
                signature.results.len()
            )));
        }

        debug!(target: "tessel-vm", context = self.0.id, function = %function, inputs = %inputs, "invoke");
        let state = self.0.state.read();
        let results = Interpreter::new(&state).call(function, inputs.as_slice().to_vec(), 0)?;
        outputs.replace(results);
        debug!(target: "tessel-vm", context = self.0.id, outputs = %outputs, "invoke terminé");
        Ok(())
    }
}

impl std::fmt::Debug for VmContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<VmContext {}{}>", self.0.id, if self.0.is_static { " static" } else { "" })
    }
}

/// Enregistre un lot ; en cas d’échec rien n’est ajouté.
fn register_into(state: &mut ContextState, modules: &[VmModule]) -> VmResult<()> {
    let mut staged: Vec<RegisteredModule> = Vec::with_capacity(modules.len());
    for module in modules {
        let imports = resolve_imports(&state.modules, &staged, module)?;
        staged.push(RegisteredModule { module: module.clone(), imports });
    }
    state.modules.extend(staged);
    Ok(())
}

fn resolve_imports(
    existing: &[RegisteredModule],
    staged: &[RegisteredModule],
    module: &VmModule,
) -> VmResult<Vec<VmFunction>> {
    let ModuleBody::Bytecode { module: bytecode, .. } = module.body() else {
        return Ok(Vec::new());
    };
    let mut resolved = Vec::with_capacity(bytecode.imports.len());
    for import in &bytecode.imports {
        let (target_module, target_fn) = import.name.split_once('.').ok_or_else(|| {
            Status::invalid_argument(format!("import '{}' is not of the form module.function", import.name))
        })?;
        let function = existing
            .iter()
            .chain(staged)
            .filter(|m| m.module.name() == target_module)
            .find_map(|m| m.module.lookup_function(target_fn, Linkage::Export))
            .ok_or_else(|| {
                Status::not_found(format!(
                    "unresolved import '{}' in module '{}'",
                    import.name,
                    module.name()
                ))
            })?;
        let found = function.signature()?;
        if *found != import.signature {
            return Err(Status::invalid_argument(format!(
                "import '{}' signature mismatch: expected {}, found {found}",
                import.name, import.signature
            )));
        }
        resolved.push(function);
    }
    Ok(resolved)
}
