//! system.rs — API système : configuration, contextes, modules et fonctions liés.
//!
//! - `Config` : pilote (essais dans l’ordre), device, instance VM, module `hal`,
//!   factory d’hôte. Une configuration globale est créée paresseusement.
//! - `SystemContext` : *dynamique* (contexte ouvert, modules ajoutés ensuite)
//!   ou *statique* (contexte fermé : modules par défaut + liste donnée).
//! - `BoundModule` / `BoundFunction` : résolution paresseuse et appel.
//!
//! ENV :
//!   TESSEL_DEFAULT_DRIVER=vmla,interpreter   (pilotes essayés dans l’ordre)

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use tessel_vm::{Linkage, Status, VmContext, VmFunction, VmInstance, VmModule, VmResult};

use crate::function_abi::FunctionAbi;
use crate::hal::{create_hal_module, HalDevice, HalDriver};
use crate::host_types::{HostTypeFactory, HostValue, NdarrayHostTypeFactory};

/// Variable listant les pilotes à essayer (séparés par des virgules).
pub const PREFERRED_DRIVER_ENV_KEY: &str = "TESSEL_DEFAULT_DRIVER";

pub const DEFAULT_DRIVERS: &str = "vmla,interpreter";

/* ─────────────────────────── Config ─────────────────────────── */

pub struct Config {
    pub driver: HalDriver,
    pub device: HalDevice,
    pub vm_instance: VmInstance,
    pub host_type_factory: Arc<dyn HostTypeFactory>,
    pub default_modules: Vec<VmModule>,
}

impl Config {
    /// `driver_names` : liste explicite ; sinon ENV, sinon `vmla,interpreter`.
    pub fn new(driver_names: Option<&str>) -> VmResult<Self> {
        Self::new_with_env(driver_names, read_env)
    }

    /// Même chose avec une source de variables arbitraire.
    pub fn new_with_env(driver_names: Option<&str>, env: impl Fn(&str) -> Option<String>) -> VmResult<Self> {
        let requested = driver_names.map(str::to_string).or_else(|| env(PREFERRED_DRIVER_ENV_KEY));
        let names = parse_list(requested.as_deref().unwrap_or(DEFAULT_DRIVERS));
        let vm_instance = VmInstance::create();
        let driver = create_driver(&names)?;
        let device = driver.create_default_device()?;
        let hal = create_hal_module(&device)?;
        Ok(Self {
            driver,
            device,
            vm_instance,
            host_type_factory: NdarrayHostTypeFactory::shared(),
            default_modules: vec![hal],
        })
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("driver", &self.driver.name())
            .field("device", &self.device.name())
            .field("default_modules", &self.default_modules)
            .finish_non_exhaustive()
    }
}

static GLOBAL_CONFIG: OnceCell<Arc<Config>> = OnceCell::new();

/// Configuration du process, créée au premier appel.
pub fn global_config() -> VmResult<Arc<Config>> {
    GLOBAL_CONFIG.get_or_try_init(|| Config::new(None).map(Arc::new)).cloned()
}

fn create_driver(names: &[String]) -> VmResult<HalDriver> {
    let available = HalDriver::query();
    let mut failures = Vec::new();
    for name in names {
        if !available.contains(name) {
            warn!(target: "tessel-runtime", driver = %name, "pilote non enregistré, ignoré");
            continue;
        }
        match HalDriver::create(name) {
            Ok(driver) => {
                info!(target: "tessel-runtime", driver = %name, "pilote sélectionné");
                return Ok(driver);
            }
            Err(e) => {
                warn!(target: "tessel-runtime", driver = %name, error = %e, "échec de création du pilote");
                failures.push(format!("{name}: {e}"));
            }
        }
    }
    Err(Status::unavailable(format!(
        "Could not create any requested driver {names:?} (available={available:?}) : {failures:?}"
    )))
}

fn read_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parse_list(s: &str) -> Vec<String> {
    s.split(',').map(str::trim).filter(|t| !t.is_empty()).map(str::to_string).collect()
}

/* ─────────────────────────── SystemContext ─────────────────────────── */

struct Shared {
    config: Arc<Config>,
    vm_context: VmContext,
}

impl Shared {
    fn create_function_abi(&self, function: &VmFunction) -> VmResult<FunctionAbi> {
        FunctionAbi::for_function(&self.config.device, Arc::clone(&self.config.host_type_factory), function)
    }
}

pub struct SystemContext {
    shared: Arc<Shared>,
    is_dynamic: bool,
    modules: Vec<Arc<BoundModule>>,
}

impl SystemContext {
    /// `None` : contexte dynamique ; `Some(list)` : contexte statique.
    pub fn new(modules: Option<&[VmModule]>, config: Option<Arc<Config>>) -> VmResult<Self> {
        let config = match config {
            Some(c) => c,
            None => global_config()?,
        };
        let is_dynamic = modules.is_none();
        let init: Vec<VmModule> = config.default_modules.iter().chain(modules.unwrap_or_default()).cloned().collect();
        check_unique(&[], &init)?;

        let vm_context = if is_dynamic {
            let ctx = VmContext::create(&config.vm_instance)?;
            ctx.register_modules(&init)?;
            ctx
        } else {
            VmContext::create_with_modules(&config.vm_instance, &init)?
        };
        info!(
            target: "tessel-runtime",
            driver = config.driver.name(),
            dynamic = is_dynamic,
            modules = init.len(),
            "SystemContext créé"
        );
        let shared = Arc::new(Shared { config, vm_context });
        let modules = init.into_iter().map(|m| Arc::new(BoundModule::new(&shared, m))).collect();
        Ok(Self { shared, is_dynamic, modules })
    }

    pub const fn is_dynamic(&self) -> bool {
        self.is_dynamic
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.shared.config
    }

    pub fn vm_context(&self) -> &VmContext {
        &self.shared.vm_context
    }

    /// Modules liés, dans l’ordre d’enregistrement.
    pub fn modules(&self) -> &[Arc<BoundModule>] {
        &self.modules
    }

    pub fn module(&self, name: &str) -> Option<Arc<BoundModule>> {
        self.modules.iter().find(|m| m.name() == name).cloned()
    }

    pub fn create_function_abi(&self, function: &VmFunction) -> VmResult<FunctionAbi> {
        self.shared.create_function_abi(function)
    }

    pub fn add_modules(&mut self, modules: &[VmModule]) -> VmResult<()> {
        if !self.is_dynamic {
            return Err(Status::failed_precondition("Cannot 'add_module' on a static context"));
        }
        let existing: Vec<&str> = self.modules.iter().map(|m| m.name()).collect();
        check_unique(&existing, modules)?;
        self.shared.vm_context.register_modules(modules)?;
        self.modules.extend(modules.iter().map(|m| Arc::new(BoundModule::new(&self.shared, m.clone()))));
        debug!(target: "tessel-runtime", added = modules.len(), "modules ajoutés au SystemContext");
        Ok(())
    }

    pub fn add_module(&mut self, module: &VmModule) -> VmResult<()> {
        self.add_modules(std::slice::from_ref(module))
    }
}

impl fmt::Debug for SystemContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.modules.iter().map(|m| m.name()).collect();
        write!(f, "<SystemContext {:?} dynamic={} modules={names:?}>", self.shared.vm_context, self.is_dynamic)
    }
}

fn check_unique(existing: &[&str], added: &[VmModule]) -> VmResult<()> {
    let mut seen: Vec<&str> = existing.to_vec();
    for m in added {
        if seen.contains(&m.name()) {
            return Err(Status::already_exists(format!("Attempt to register duplicate module: '{}'", m.name())));
        }
        seen.push(m.name());
    }
    Ok(())
}

/* ─────────────────────────── BoundModule ─────────────────────────── */

pub struct BoundModule {
    shared: Arc<Shared>,
    module: VmModule,
    functions: Mutex<AHashMap<String, Arc<BoundFunction>>>,
}

impl BoundModule {
    fn new(shared: &Arc<Shared>, module: VmModule) -> Self {
        Self { shared: Arc::clone(shared), module, functions: Mutex::new(AHashMap::new()) }
    }

    pub fn name(&self) -> &str {
        self.module.name()
    }

    pub const fn vm_module(&self) -> &VmModule {
        &self.module
    }

    /// Résout (puis met en cache) un export.
    pub fn function(&self, name: &str) -> VmResult<Arc<BoundFunction>> {
        if let Some(f) = self.functions.lock().get(name) {
            return Ok(Arc::clone(f));
        }
        let vm_function = self.module.lookup_function(name, Linkage::Export).ok_or_else(|| {
            Status::not_found(format!("Function '{name}' not found in module '{}'", self.name()))
        })?;
        let abi = self.shared.create_function_abi(&vm_function)?;
        let bound = Arc::new(BoundFunction { shared: Arc::clone(&self.shared), vm_function, abi });
        self.functions.lock().insert(name.to_string(), Arc::clone(&bound));
        Ok(bound)
    }
}

impl fmt::Debug for BoundModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<BoundModule {:?}>", self.module)
    }
}

/* ─────────────────────────── BoundFunction ─────────────────────────── */

/// Valeur de retour d’un appel, selon l’arité des résultats.
#[derive(Debug, Clone)]
pub enum Returned {
    None,
    Single(HostValue),
    Tuple(Vec<HostValue>),
}

impl Returned {
    pub fn into_vec(self) -> Vec<HostValue> {
        match self {
            Self::None => Vec::new(),
            Self::Single(v) => vec![v],
            Self::Tuple(vs) => vs,
        }
    }
}

impl From<Vec<HostValue>> for Returned {
    fn from(mut values: Vec<HostValue>) -> Self {
        match values.len() {
            0 => Self::None,
            1 => Self::Single(values.remove(0)),
            _ => Self::Tuple(values),
        }
    }
}

pub struct BoundFunction {
    shared: Arc<Shared>,
    vm_function: VmFunction,
    abi: FunctionAbi,
}

impl BoundFunction {
    pub const fn abi(&self) -> &FunctionAbi {
        &self.abi
    }

    pub const fn vm_function(&self) -> &VmFunction {
        &self.vm_function
    }

    /// Appel synchrone : pack → allocation (dynamique) → invoke → unpack.
    pub fn call(&self, args: &[HostValue]) -> VmResult<Returned> {
        let inputs = self.abi.raw_pack_inputs(args)?;
        let mut results = self.abi.allocate_results(&inputs, false)?;
        self.shared.vm_context.invoke(&self.vm_function, &inputs, &mut results)?;
        Ok(self.abi.raw_unpack_results(&results)?.into())
    }
}

impl fmt::Debug for BoundFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<BoundFunction {} ({})>", self.abi, self.vm_function)
    }
}

/* ─────────────────────────── Chargement ─────────────────────────── */

/// Lie `modules` dans un nouveau contexte statique.
pub fn load_modules(modules: &[VmModule], config: Option<Arc<Config>>) -> VmResult<Vec<Arc<BoundModule>>> {
    let context = SystemContext::new(Some(modules), config)?;
    modules
        .iter()
        .map(|m| context.module(m.name()).ok_or_else(|| Status::internal(format!("module '{}' was not bound", m.name()))))
        .collect()
}

pub fn load_module(module: &VmModule, config: Option<Arc<Config>>) -> VmResult<Arc<BoundModule>> {
    let mut bound = load_modules(std::slice::from_ref(module), config)?;
    bound.pop().ok_or_else(|| Status::internal("no module was bound"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_vm::StatusCode;

    #[test]
    fn driver_selection_follows_the_requested_order() {
        let c = Config::new_with_env(None, |_| None).unwrap();
        assert_eq!(c.driver.name(), "vmla");

        let c = Config::new_with_env(None, |k| (k == PREFERRED_DRIVER_ENV_KEY).then(|| "cuda, interpreter".into())).unwrap();
        assert_eq!(c.driver.name(), "interpreter");

        let c = Config::new_with_env(Some("interpreter"), |_| Some("vmla".into())).unwrap();
        assert_eq!(c.driver.name(), "interpreter");
        assert_eq!(c.default_modules[0].name(), "hal");
    }

    #[test]
    fn no_usable_driver_is_an_error() {
        let err = Config::new(Some("cuda,metal")).unwrap_err();
        assert!(err.message().starts_with("Could not create any requested driver"), "{}", err.message());
    }

    #[test]
    fn returned_follows_arity() {
        assert!(matches!(Returned::from(Vec::new()), Returned::None));
        assert!(matches!(Returned::from(vec![HostValue::I32(1)]), Returned::Single(HostValue::I32(1))));
        assert!(matches!(Returned::from(vec![HostValue::None, HostValue::None]), Returned::Tuple(v) if v.len() == 2));
    }

    #[test]
    fn static_contexts_refuse_new_modules() {
        let config = Arc::new(Config::new(Some("interpreter")).unwrap());
        let mut ctx = SystemContext::new(Some(&[][..]), Some(Arc::clone(&config))).unwrap();
        assert!(!ctx.is_dynamic());
        assert_eq!(ctx.modules().len(), 1);
        let err = ctx.add_module(&config.default_modules[0]).unwrap_err();
        assert_eq!(err.code(), StatusCode::FailedPrecondition);
    }

    #[test]
    fn dynamic_contexts_refuse_duplicates() {
        let config = Arc::new(Config::new(Some("interpreter")).unwrap());
        let mut ctx = SystemContext::new(None, Some(Arc::clone(&config))).unwrap();
        assert!(ctx.is_dynamic());
        let err = ctx.add_module(&config.default_modules[0]).unwrap_err();
        assert_eq!((err.code(), err.message()), (StatusCode::AlreadyExists, "Attempt to register duplicate module: 'hal'"));
    }

    #[test]
    fn missing_functions_are_not_found() {
        let config = Arc::new(Config::new(Some("interpreter")).unwrap());
        let ctx = SystemContext::new(None, Some(config)).unwrap();
        let hal = ctx.module("hal").unwrap();
        let err = hal.function("nope").unwrap_err();
        assert_eq!(err.message(), "Function 'nope' not found in module 'hal'");
    }
}
