//! module.rs — Modules VM : bytecode (chargé depuis un tampon) ou natifs.
//!
//! - `ModuleBuffer` : octets fournis par l’appelant + callback de libération,
//!   appelé exactement une fois (échec de construction OU destruction).
//! - `VmModule` : poignée `Arc`, partagée entre contextes.
//! - `VmFunction` : (module, linkage, ordinal) ; l’ordinal n’a de sens que
//!   relativement à son module.

use std::fmt;
use std::iter::FusedIterator;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use tessel_bytecode::{BytecodeModule, FunctionSignature};

use crate::status::{Status, StatusCode, VmResult};
use crate::variant::Variant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Linkage {
    Internal,
    Import,
    Export,
}

impl fmt::Display for Linkage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Internal => "INTERNAL",
            Self::Import => "IMPORT",
            Self::Export => "EXPORT",
        })
    }
}

/* ─────────────────────────── ModuleBuffer ─────────────────────────── */

type ReleaseFn = Box<dyn FnOnce() + Send + Sync>;

/// Tampon externe dont la VM prend possession.
pub struct ModuleBuffer {
    data: Bytes,
    release: Option<ReleaseFn>,
}

impl ModuleBuffer {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into(), release: None }
    }

    /// `release` est invoqué une seule fois, quand plus personne n’a besoin des octets.
    pub fn with_release(data: impl Into<Bytes>, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self { data: data.into(), release: Some(Box::new(release)) }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Drop for ModuleBuffer {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for ModuleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleBuffer")
            .field("len", &self.data.len())
            .field("release", &self.release.is_some())
            .finish()
    }
}

/* ─────────────────────────── Modules natifs ─────────────────────────── */

pub type NativeFn = Arc<dyn Fn(&[Variant]) -> VmResult<Vec<Variant>> + Send + Sync>;

#[derive(Clone)]
pub struct NativeFunction {
    pub name: String,
    pub signature: FunctionSignature,
    pub reflection: Vec<(String, String)>,
    pub(crate) call: NativeFn,
}

impl NativeFunction {
    pub fn call(&self, args: &[Variant]) -> VmResult<Vec<Variant>> {
        (self.call)(args)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// Construction d’un module dont les exports sont des closures Rust.
pub struct NativeModuleBuilder {
    name: String,
    functions: Vec<NativeFunction>,
}

impl NativeModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), functions: Vec::new() }
    }

    #[must_use]
    pub fn export<F>(mut self, name: impl Into<String>, signature: FunctionSignature, f: F) -> Self
    where
        F: Fn(&[Variant]) -> VmResult<Vec<Variant>> + Send + Sync + 'static,
    {
        self.functions.push(NativeFunction {
            name: name.into(),
            signature,
            reflection: Vec::new(),
            call: Arc::new(f),
        });
        self
    }

    /// Attribut de réflexion sur le dernier export déclaré.
    #[must_use]
    pub fn reflection(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Some(last) = self.functions.last_mut() {
            last.reflection.push((key.into(), value.into()));
        }
        self
    }

    pub fn build(self) -> VmModule {
        debug!(target: "tessel-vm", module = %self.name, exports = self.functions.len(), "module natif construit");
        VmModule(Arc::new(ModuleInner {
            name: self.name,
            body: ModuleBody::Native { functions: self.functions },
        }))
    }
}

/* ───────────────────────────── VmModule ───────────────────────────── */

pub(crate) enum ModuleBody {
    Bytecode {
        module: BytecodeModule,
        rodata: Vec<Bytes>,
        _buffer: ModuleBuffer,
    },
    Native {
        functions: Vec<NativeFunction>,
    },
}

pub(crate) struct ModuleInner {
    name: String,
    body: ModuleBody,
}

impl Drop for ModuleInner {
    fn drop(&mut self) {
        debug!(target: "tessel-vm", module = %self.name, "module libéré");
    }
}

#[derive(Clone)]
pub struct VmModule(Arc<ModuleInner>);

impl VmModule {
    /// Charge un module bytecode ; le tampon est libéré ici en cas d’échec.
    pub fn from_bytes(buffer: ModuleBuffer) -> VmResult<Self> {
        let module = BytecodeModule::from_bytes(buffer.as_slice())
            .map_err(|e| Status::invalid_argument(format!("Could not load bytecode module: {e}")))?;
        let rodata = module.rodata.iter().map(|seg| Bytes::copy_from_slice(seg)).collect();
        info!(
            target: "tessel-vm",
            module = %module.name,
            bytes = buffer.len(),
            functions = module.functions.len(),
            exports = module.exports.len(),
            "module bytecode chargé"
        );
        Ok(Self(Arc::new(ModuleInner {
            name: module.name.clone(),
            body: ModuleBody::Bytecode { module, rodata, _buffer: buffer },
        })))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn is_native(&self) -> bool {
        matches!(self.0.body, ModuleBody::Native { .. })
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub(crate) fn body(&self) -> &ModuleBody {
        &self.0.body
    }

    /// Contenu bytecode (inspection) ; `None` pour un module natif.
    pub fn bytecode(&self) -> Option<&BytecodeModule> {
        match &self.0.body {
            ModuleBody::Bytecode { module, .. } => Some(module),
            ModuleBody::Native { .. } => None,
        }
    }

    /// `None` si aucune fonction de ce nom n’existe pour ce linkage.
    pub fn lookup_function(&self, name: &str, linkage: Linkage) -> Option<VmFunction> {
        let ordinal = match (&self.0.body, linkage) {
            (ModuleBody::Bytecode { module, .. }, Linkage::Export) => module.export_ordinal(name),
            (ModuleBody::Bytecode { module, .. }, Linkage::Internal) => module.internal_ordinal(name),
            (ModuleBody::Bytecode { module, .. }, Linkage::Import) => {
                module.imports.iter().position(|i| i.name == name).and_then(|i| u32::try_from(i).ok())
            }
            (ModuleBody::Native { functions }, Linkage::Export) => {
                functions.iter().position(|f| f.name == name).and_then(|i| u32::try_from(i).ok())
            }
            (ModuleBody::Native { .. }, _) => None,
        }?;
        Some(VmFunction { module: self.clone(), linkage, ordinal })
    }

    pub fn export_names(&self) -> Vec<String> {
        match &self.0.body {
            ModuleBody::Bytecode { module, .. } => module.exports.iter().map(|e| e.name.clone()).collect(),
            ModuleBody::Native { functions } => functions.iter().map(|f| f.name.clone()).collect(),
        }
    }

    fn out_of_range(&self, linkage: Linkage, ordinal: u32) -> Status {
        Status::out_of_range(format!("{linkage} ordinal {ordinal} out of range in module '{}'", self.name()))
    }

    pub(crate) fn function_signature(&self, linkage: Linkage, ordinal: u32) -> VmResult<&FunctionSignature> {
        let index = ordinal as usize;
        let sig = match (&self.0.body, linkage) {
            (ModuleBody::Bytecode { module, .. }, Linkage::Import) => module.imports.get(index).map(|i| &i.signature),
            (ModuleBody::Bytecode { module, .. }, _) => {
                self.bytecode_function(linkage, ordinal).ok().and_then(|o| module.functions.get(o as usize)).map(|f| &f.signature)
            }
            (ModuleBody::Native { functions }, Linkage::Export) => functions.get(index).map(|f| &f.signature),
            (ModuleBody::Native { .. }, _) => None,
        };
        sig.ok_or_else(|| self.out_of_range(linkage, ordinal))
    }

    /// Ordinal interne d’une fonction bytecode (exports résolus via la table).
    pub(crate) fn bytecode_function(&self, linkage: Linkage, ordinal: u32) -> VmResult<u32> {
        let ModuleBody::Bytecode { module, .. } = &self.0.body else {
            return Err(self.out_of_range(linkage, ordinal));
        };
        match linkage {
            Linkage::Export => module
                .exports
                .get(ordinal as usize)
                .map(|e| e.function)
                .ok_or_else(|| self.out_of_range(linkage, ordinal)),
            Linkage::Internal if (ordinal as usize) < module.functions.len() => Ok(ordinal),
            _ => Err(self.out_of_range(linkage, ordinal)),
        }
    }

    pub(crate) fn function_name(&self, linkage: Linkage, ordinal: u32) -> Option<String> {
        match (&self.0.body, linkage) {
            (ModuleBody::Bytecode { module, .. }, Linkage::Export) => {
                module.exports.get(ordinal as usize).map(|e| e.name.clone())
            }
            (ModuleBody::Bytecode { module, .. }, Linkage::Import) => {
                module.imports.get(ordinal as usize).map(|i| i.name.clone())
            }
            (ModuleBody::Bytecode { module, .. }, Linkage::Internal) => {
                module.functions.get(ordinal as usize).and_then(|f| f.name.clone())
            }
            (ModuleBody::Native { functions }, Linkage::Export) => {
                functions.get(ordinal as usize).map(|f| f.name.clone())
            }
            (ModuleBody::Native { .. }, _) => None,
        }
    }

    /// Sonde indexée ; `NotFound` au premier index inutilisé.
    pub(crate) fn reflection_attr(&self, linkage: Linkage, ordinal: u32, index: usize) -> VmResult<(String, String)> {
        let attrs = match (&self.0.body, linkage) {
            (ModuleBody::Bytecode { module, .. }, Linkage::Export | Linkage::Internal) => {
                let internal = self.bytecode_function(linkage, ordinal)?;
                module.functions.get(internal as usize).map(|f| f.reflection.as_slice())
            }
            (ModuleBody::Native { functions }, Linkage::Export) => {
                functions.get(ordinal as usize).map(|f| f.reflection.as_slice())
            }
            _ => Some(&[][..]),
        };
        let attrs = attrs.ok_or_else(|| self.out_of_range(linkage, ordinal))?;
        attrs
            .get(index)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("no reflection attribute at index {index}")))
    }
}

impl fmt::Debug for VmModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<VmModule {}>", self.name())
    }
}

/* ───────────────────────────── VmFunction ───────────────────────────── */

#[derive(Clone)]
pub struct VmFunction {
    module: VmModule,
    linkage: Linkage,
    ordinal: u32,
}

impl VmFunction {
    pub const fn module(&self) -> &VmModule {
        &self.module
    }

    pub const fn linkage(&self) -> Linkage {
        self.linkage
    }

    pub const fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn name(&self) -> Option<String> {
        self.module.function_name(self.linkage, self.ordinal)
    }

    pub fn signature(&self) -> VmResult<&FunctionSignature> {
        self.module.function_signature(self.linkage, self.ordinal)
    }

    /// Itérateur paresseux, fini, non redémarrable.
    pub fn reflection_attrs(&self) -> ReflectionAttrs<'_> {
        ReflectionAttrs { function: self, index: 0, done: false }
    }

    pub fn reflection_attr(&self, key: &str) -> Option<String> {
        self.reflection_attrs().filter_map(Result::ok).find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

impl fmt::Debug for VmFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for VmFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name().unwrap_or_else(|| "<stripped>".to_string());
        write!(f, "<VmFunction {}.{name} ({} #{})>", self.module.name(), self.linkage, self.ordinal)
    }
}

pub struct ReflectionAttrs<'a> {
    function: &'a VmFunction,
    index: usize,
    done: bool,
}

impl Iterator for ReflectionAttrs<'_> {
    type Item = VmResult<(String, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let f = self.function;
        match f.module.reflection_attr(f.linkage, f.ordinal, self.index) {
            Ok(pair) => {
                self.index += 1;
                Some(Ok(pair))
            }
            Err(status) if status.is(StatusCode::NotFound) => {
                self.done = true;
                None
            }
            Err(status) => {
                self.done = true;
                Some(Err(status))
            }
        }
    }
}

impl FusedIterator for ReflectionAttrs<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tessel_bytecode::ValueKind;

    #[test]
    fn release_runs_once_on_load_failure() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let buffer = ModuleBuffer::with_release(vec![0u8; 3], move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let err = VmModule::from_bytes(buffer).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn native_lookup_and_reflection() {
        let module = NativeModuleBuilder::new("math")
            .export("twice", FunctionSignature::new([ValueKind::I32], [ValueKind::I32]), |args| {
                Ok(vec![Variant::I32(args[0].as_i32().unwrap_or_default() * 2)])
            })
            .reflection("fv", "1")
            .reflection("f", "I6!S3!t6R6!S3!t6")
            .build();

        assert!(module.lookup_function("nope", Linkage::Export).is_none());
        assert!(module.lookup_function("twice", Linkage::Internal).is_none());
        let f = module.lookup_function("twice", Linkage::Export).unwrap();
        assert_eq!(f.to_string(), "<VmFunction math.twice (EXPORT #0)>");

        let attrs: Vec<_> = f.reflection_attrs().collect::<VmResult<_>>().unwrap();
        assert_eq!(attrs, vec![("fv".into(), "1".into()), ("f".into(), "I6!S3!t6R6!S3!t6".into())]);
        assert_eq!(f.reflection_attr("fv").as_deref(), Some("1"));

        let mut iter = f.reflection_attrs();
        assert_eq!(iter.by_ref().count(), 2);
        assert!(iter.next().is_none());
    }
}
