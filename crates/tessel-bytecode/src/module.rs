//! module.rs — Conteneur d’un module bytecode tessel.
//!
//! - En-tête (magic, version, flags, horodatage, hash FNV-1a 64 du corps)
//! - Tables d’imports / exports / fonctions + segments rodata
//! - Infos debug facultatives (source map par fonction, noms de symboles)
//! - Encodage binaire via bincode (fixint, little-endian) ou texte via JSON
//! - Validation structurelle au chargement (registres, ordinaux, rodata)

use bincode::Options as _;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use thiserror::Error;

use crate::ops::{Callee, Op, Reg, ValueKind};

/// Numéro de version du format. Incrémente si la structure sérialisée change.
pub const MODULE_VERSION: u16 = 1;

/// Magic file header: b"TSBC"
pub const MODULE_MAGIC: [u8; 4] = *b"TSBC";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleFlags {
    /// Source map retirée à l’émission.
    pub stripped_source_map: bool,
    /// Noms des fonctions internes retirés à l’émission.
    pub stripped_symbols: bool,
}

/// Signature “machine” d’une fonction : types des registres d’entrée / sortie.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSignature {
    pub inputs: Vec<ValueKind>,
    pub results: Vec<ValueKind>,
}

impl FunctionSignature {
    pub fn new(inputs: impl Into<Vec<ValueKind>>, results: impl Into<Vec<ValueKind>>) -> Self {
        Self { inputs: inputs.into(), results: results.into() }
    }
}

impl fmt::Display for FunctionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |ks: &[ValueKind]| ks.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
        write!(f, "({}) -> ({})", join(&self.inputs), join(&self.results))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportDef {
    /// Nom complet `module.fonction` (résolu à l’enregistrement dans un contexte).
    pub name: String,
    pub signature: FunctionSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportDef {
    pub name: String,
    /// Ordinal dans la table des fonctions internes.
    pub function: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLoc {
    pub pc: u32,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: Option<String>,
    pub signature: FunctionSignature,
    pub register_count: u16,
    pub ops: Vec<Op>,
    /// Attributs de réflexion (clé, valeur), dans l’ordre d’émission.
    pub reflection: Vec<(String, String)>,
    pub source_map: Vec<SourceLoc>,
}

impl FunctionDef {
    pub fn location_for_pc(&self, pc: u32) -> Option<&str> {
        self.source_map.iter().find(|l| l.pc == pc).map(|l| l.location.as_str())
    }
}

/// En-tête, séparé pour le contrôle d’intégrité.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModuleHeader {
    magic: [u8; 4],
    version: u16,
    flags: ModuleFlags,
    created_unix_secs: u64,
    hash_fnv1a_64: u64,
}

/// Le module complet : en-tête + tables + rodata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BytecodeModule {
    header: ModuleHeader,
    pub name: String,
    pub imports: Vec<ImportDef>,
    pub exports: Vec<ExportDef>,
    pub functions: Vec<FunctionDef>,
    pub rodata: Vec<Vec<u8>>,
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bad magic: {0:?}")]
    BadMagic([u8; 4]),
    #[error("bad version: expected {expected}, found {found}")]
    BadVersion { expected: u16, found: u16 },
    #[error("bad hash: expected 0x{expected:016x}, found 0x{found:016x}")]
    BadHash { expected: u64, found: u64 },
    #[error("invalid module: {0}")]
    Invalid(String),
}

fn codec() -> impl bincode::Options {
    bincode::DefaultOptions::new().with_fixint_encoding().with_little_endian()
}

impl BytecodeModule {
    pub fn new(name: impl Into<String>, flags: ModuleFlags) -> Self {
        Self {
            header: ModuleHeader {
                magic: MODULE_MAGIC,
                version: MODULE_VERSION,
                flags,
                created_unix_secs: now_unix(),
                hash_fnv1a_64: 0,
            },
            name: name.into(),
            imports: Vec::new(),
            exports: Vec::new(),
            functions: Vec::new(),
            rodata: Vec::new(),
        }
    }

    pub const fn version(&self) -> u16 {
        self.header.version
    }

    pub const fn flags(&self) -> ModuleFlags {
        self.header.flags
    }

    pub const fn hash(&self) -> u64 {
        self.header.hash_fnv1a_64
    }

    pub fn add_rodata(&mut self, bytes: Vec<u8>) -> u32 {
        let idx = self.rodata.len() as u32;
        self.rodata.push(bytes);
        idx
    }

    /// Ordinal de l’import `name`, en l’ajoutant si besoin.
    pub fn intern_import(&mut self, name: &str, signature: FunctionSignature) -> u32 {
        if let Some(i) = self.imports.iter().position(|i| i.name == name) {
            return i as u32;
        }
        self.imports.push(ImportDef { name: name.to_string(), signature });
        (self.imports.len() - 1) as u32
    }

    pub fn export_ordinal(&self, name: &str) -> Option<u32> {
        self.exports.iter().position(|e| e.name == name).map(|i| i as u32)
    }

    pub fn internal_ordinal(&self, name: &str) -> Option<u32> {
        self.functions
            .iter()
            .position(|f| f.name.as_deref() == Some(name))
            .map(|i| i as u32)
    }

    pub fn compute_hash(&self) -> Result<u64, ContainerError> {
        let mut hasher = Fnv1a64::new();
        hasher.write(&bincode::serialize(&self.name)?);
        hasher.write(&bincode::serialize(&self.imports)?);
        hasher.write(&bincode::serialize(&self.exports)?);
        hasher.write(&bincode::serialize(&self.functions)?);
        hasher.write(&bincode::serialize(&self.rodata)?);
        Ok(hasher.finish())
    }

    fn finalize_header(&mut self) -> Result<(), ContainerError> {
        self.header.created_unix_secs = now_unix();
        self.header.hash_fnv1a_64 = self.compute_hash()?;
        Ok(())
    }

    /// Encodage binaire (conteneur chargeable par la VM).
    pub fn to_bytes(&mut self) -> Result<Vec<u8>, ContainerError> {
        self.finalize_header()?;
        Ok(codec().serialize(self)?)
    }

    /// Encodage texte (JSON indenté), pour inspection.
    pub fn to_json(&mut self) -> Result<String, ContainerError> {
        self.finalize_header()?;
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ContainerError> {
        let module: Self = codec().deserialize(bytes)?;
        module.check_header()?;
        tracing::debug!(
            target: "tessel-bytecode",
            name = %module.name,
            functions = module.functions.len(),
            imports = module.imports.len(),
            "module chargé"
        );
        Ok(module)
    }

    pub fn from_json(text: &str) -> Result<Self, ContainerError> {
        let module: Self = serde_json::from_str(text)?;
        module.check_header()?;
        Ok(module)
    }

    fn check_header(&self) -> Result<(), ContainerError> {
        if self.header.magic != MODULE_MAGIC {
            return Err(ContainerError::BadMagic(self.header.magic));
        }
        if self.header.version != MODULE_VERSION {
            return Err(ContainerError::BadVersion { expected: MODULE_VERSION, found: self.header.version });
        }
        let expected = self.header.hash_fnv1a_64;
        let found = self.compute_hash()?;
        if expected != found {
            return Err(ContainerError::BadHash { expected, found });
        }
        self.validate()
    }

    /// Validation structurelle : tout index référencé doit exister.
    pub fn validate(&self) -> Result<(), ContainerError> {
        let invalid = |msg: String| Err(ContainerError::Invalid(msg));
        for (ordinal, func) in self.functions.iter().enumerate() {
            let label = func.name.clone().unwrap_or_else(|| format!("#{ordinal}"));
            let check_reg = |r: Reg| -> Result<(), ContainerError> {
                if r >= func.register_count {
                    return invalid(format!(
                        "function {label}: register r{r} out of range ({} registers)",
                        func.register_count
                    ));
                }
                Ok(())
            };
            if func.signature.inputs.len() > usize::from(func.register_count) {
                return invalid(format!("function {label}: more inputs than registers"));
            }
            match func.ops.last() {
                Some(op) if op.is_terminator() => {}
                _ => return invalid(format!("function {label}: missing terminator")),
            }
            for op in &func.ops {
                for r in op.defs().into_iter().chain(op.uses()) {
                    check_reg(r)?;
                }
                match op {
                    Op::ConstRodata { index, .. } if *index as usize >= self.rodata.len() => {
                        return invalid(format!("function {label}: rodata #{index} out of range"));
                    }
                    Op::Call { callee, args, results } => {
                        let sig = match callee {
                            Callee::Internal(o) => self.functions.get(*o as usize).map(|f| &f.signature),
                            Callee::Import(o) => self.imports.get(*o as usize).map(|i| &i.signature),
                        };
                        let Some(sig) = sig else {
                            return invalid(format!("function {label}: callee {callee:?} out of range"));
                        };
                        if sig.inputs.len() != args.len() || sig.results.len() != results.len() {
                            return invalid(format!("function {label}: call arity mismatch for {callee:?}"));
                        }
                    }
                    Op::Return { values } if values.len() != func.signature.results.len() => {
                        return invalid(format!("function {label}: return arity mismatch"));
                    }
                    _ => {}
                }
            }
        }
        for (i, export) in self.exports.iter().enumerate() {
            if export.function as usize >= self.functions.len() {
                return invalid(format!("export '{}' points past the function table", export.name));
            }
            if self.exports[..i].iter().any(|e| e.name == export.name) {
                return invalid(format!("duplicate export '{}'", export.name));
            }
        }
        Ok(())
    }

    /// Listing lisible (outil `dump-module`).
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(&mut out, "== Module: {} (v{}) ==", self.name, self.version());
        let flags = self.flags();
        let _ = writeln!(
            &mut out,
            "flags: stripped_source_map={} stripped_symbols={}",
            flags.stripped_source_map, flags.stripped_symbols
        );
        for (i, import) in self.imports.iter().enumerate() {
            let _ = writeln!(&mut out, "import #{i} {} {}", import.name, import.signature);
        }
        for export in &self.exports {
            let _ = writeln!(&mut out, "export {} -> @{}", export.name, export.function);
        }
        for (i, data) in self.rodata.iter().enumerate() {
            let _ = writeln!(&mut out, "rodata #{i} ({} bytes)", data.len());
        }
        for (ordinal, func) in self.functions.iter().enumerate() {
            let name = func.name.as_deref().unwrap_or("<stripped>");
            let _ = writeln!(
                &mut out,
                "\nfunc @{ordinal} {name} {} regs={}",
                func.signature, func.register_count
            );
            for (k, v) in &func.reflection {
                let _ = writeln!(&mut out, "  .reflection {k} = {v:?}");
            }
            for (pc, op) in func.ops.iter().enumerate() {
                let pc = pc as u32;
                match func.location_for_pc(pc) {
                    Some(loc) => {
                        let _ = writeln!(&mut out, "  {pc:04}  {op:<40} ; {loc}");
                    }
                    None => {
                        let _ = writeln!(&mut out, "  {pc:04}  {op}");
                    }
                }
            }
        }
        out
    }
}

fn now_unix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[derive(Default)]
struct Fnv1a64(u64);
impl Fnv1a64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;
    const fn new() -> Self { Self(Self::OFFSET_BASIS) }
    fn write(&mut self, bytes: &[u8]) {
        let mut h = self.0;
        for &b in bytes {
            h ^= u64::from(b);
            h = h.wrapping_mul(Self::PRIME);
        }
        self.0 = h;
    }
    const fn finish(&self) -> u64 { self.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{BinaryOp, ScalarKind};

    fn sample() -> BytecodeModule {
        let mut m = BytecodeModule::new("sample", ModuleFlags::default());
        m.functions.push(FunctionDef {
            name: Some("add".into()),
            signature: FunctionSignature::new([ValueKind::I32, ValueKind::I32], [ValueKind::I32]),
            register_count: 3,
            ops: vec![
                Op::Binary { op: BinaryOp::Add, kind: ScalarKind::I32, dst: 2, lhs: 0, rhs: 1 },
                Op::Return { values: vec![2] },
            ],
            reflection: vec![("fv".into(), "1".into())],
            source_map: vec![SourceLoc { pc: 0, location: "sample.tsl:2:5".into() }],
        });
        m.exports.push(ExportDef { name: "add".into(), function: 0 });
        m
    }

    #[test]
    fn binary_roundtrip_and_integrity() {
        let mut m = sample();
        let mut bytes = m.to_bytes().unwrap();
        let loaded = BytecodeModule::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.name, "sample");
        assert_eq!(loaded.export_ordinal("add"), Some(0));
        assert_eq!(loaded.functions[0].location_for_pc(0), Some("sample.tsl:2:5"));

        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(BytecodeModule::from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_foreign_magic() {
        let mut m = sample();
        m.header.magic = *b"NOPE";
        let bytes = codec().serialize(&m).unwrap();
        assert!(matches!(BytecodeModule::from_bytes(&bytes), Err(ContainerError::BadMagic(_))));
    }

    #[test]
    fn validation_catches_bad_registers() {
        let mut m = sample();
        m.functions[0].register_count = 2;
        assert!(matches!(m.validate(), Err(ContainerError::Invalid(_))));
    }

    #[test]
    fn json_container_is_loadable() {
        let mut m = sample();
        let text = m.to_json().unwrap();
        assert!(text.contains("\"name\": \"sample\""));
        let back = BytecodeModule::from_json(&text).unwrap();
        assert_eq!(back.functions.len(), 1);
    }
}
