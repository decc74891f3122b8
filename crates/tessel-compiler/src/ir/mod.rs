//! ir/mod.rs — Modèle de l’IR tessel (module → fonctions → ops en SSA).
//!
//! Les valeurs sont nommées (`%a`, `%0`) ; une op référence ses opérandes
//! par nom. Les types sont soit scalaires (`i32`…), soit tenseurs
//! (`tensor<4x?xf32>`), ces derniers étant des buffers HAL à l’exécution.

use std::fmt;

use tessel_bytecode::{BinaryOp, ScalarKind, UnaryOp};

pub mod lexer;
pub mod parser;
pub mod printer;
pub mod verify;

/* ───────────────────────────── Types ───────────────────────────── */

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Scalar(ScalarKind),
    /// `None` = dimension dynamique (`?`).
    Tensor { dims: Vec<Option<u32>>, element: ScalarKind },
}

impl Type {
    pub const fn element(&self) -> ScalarKind {
        match self {
            Self::Scalar(k) | Self::Tensor { element: k, .. } => *k,
        }
    }

    pub const fn is_tensor(&self) -> bool {
        matches!(self, Self::Tensor { .. })
    }

    /// Nombre d’éléments si toutes les dimensions sont statiques.
    pub fn static_element_count(&self) -> Option<usize> {
        match self {
            Self::Scalar(_) => Some(1),
            Self::Tensor { dims, .. } => dims.iter().try_fold(1usize, |acc, d| {
                d.and_then(|d| acc.checked_mul(d as usize))
            }),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(k) => f.write_str(k.mnemonic()),
            Self::Tensor { dims, element } => {
                f.write_str("tensor<")?;
                for d in dims {
                    match d {
                        Some(n) => write!(f, "{n}x")?,
                        None => f.write_str("?x")?,
                    }
                }
                write!(f, "{}>", element.mnemonic())
            }
        }
    }
}

/* ─────────────────────────── Locations ─────────────────────────── */

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Location {
    #[default]
    Unknown,
    FileLineCol { file: String, line: u32, col: u32 },
    Name { name: String, child: Box<Location> },
    CallSite { callee: Box<Location>, caller: Box<Location> },
    Opaque { fallback: Box<Location> },
}

impl Location {
    pub fn file(file: impl Into<String>, line: u32, col: u32) -> Self {
        Self::FileLineCol { file: file.into(), line, col }
    }

    pub fn name(name: impl Into<String>, child: Self) -> Self {
        Self::Name { name: name.into(), child: Box::new(child) }
    }

    pub fn call_site(callee: Self, caller: Self) -> Self {
        Self::CallSite { callee: Box::new(callee), caller: Box::new(caller) }
    }

    pub fn opaque(fallback: Self) -> Self {
        Self::Opaque { fallback: Box::new(fallback) }
    }

    pub const fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    /// Forme courte (`fichier:L:C`), pour les commentaires et la source map.
    pub fn brief(&self) -> String {
        match self {
            Self::Unknown => "unknown".to_string(),
            Self::FileLineCol { file, line, col } => format!("{file}:{line}:{col}"),
            Self::Name { name, child } if child.is_unknown() => name.clone(),
            Self::Name { name, child } => format!("{name}({})", child.brief()),
            Self::CallSite { callee, caller } => format!("{} at {}", callee.brief(), caller.brief()),
            Self::Opaque { fallback } => fallback.brief(),
        }
    }
}

/// Forme ré-analysable (contenu de `loc(...)`).
impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("unknown"),
            Self::FileLineCol { file, line, col } => write!(f, "{}:{line}:{col}", quote(file)),
            Self::Name { name, child } if child.is_unknown() => f.write_str(&quote(name)),
            Self::Name { name, child } => write!(f, "{}({child})", quote(name)),
            Self::CallSite { callee, caller } => write!(f, "callsite({callee} at {caller})"),
            Self::Opaque { fallback } => write!(f, "opaque({fallback})"),
        }
    }
}

/// Chaîne entre guillemets, échappée comme le lexer l’attend.
pub(crate) fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/* ─────────────────────────── Constantes ─────────────────────────── */

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(x) => x,
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Scalar(Number),
    Dense(Vec<Number>),
}

/* ───────────────────────────── Ops ───────────────────────────── */

#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Constant(Constant),
    Binary { op: BinaryOp, lhs: String, rhs: String },
    Unary { op: UnaryOp, operand: String },
    Call { callee: String, args: Vec<String> },
    Trace { tag: String, args: Vec<String> },
    Return { values: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Noms des valeurs définies (sans `%`).
    pub results: Vec<String>,
    pub kind: OpKind,
    /// Types des résultats ; pour `return`, types des valeurs retournées.
    pub types: Vec<Type>,
    pub loc: Location,
}

impl Operation {
    pub fn operands(&self) -> Vec<&str> {
        match &self.kind {
            OpKind::Constant(_) => Vec::new(),
            OpKind::Binary { lhs, rhs, .. } => vec![lhs.as_str(), rhs.as_str()],
            OpKind::Unary { operand, .. } => vec![operand.as_str()],
            OpKind::Call { args, .. } | OpKind::Trace { args, .. } => args.iter().map(String::as_str).collect(),
            OpKind::Return { values } => values.iter().map(String::as_str).collect(),
        }
    }

    /// Sans effet observable : supprimable si ses résultats sont inutilisés.
    pub const fn is_pure(&self) -> bool {
        matches!(self.kind, OpKind::Constant(_) | OpKind::Binary { .. } | OpKind::Unary { .. })
    }

    pub const fn is_return(&self) -> bool {
        matches!(self.kind, OpKind::Return { .. })
    }

    pub fn mnemonic(&self) -> &'static str {
        match &self.kind {
            OpKind::Constant(_) => "constant",
            OpKind::Binary { op, .. } => op.mnemonic(),
            OpKind::Unary { op, .. } => op.mnemonic(),
            OpKind::Call { .. } => "call",
            OpKind::Trace { .. } => "trace",
            OpKind::Return { .. } => "return",
        }
    }
}

/* ───────────────────────── Fonctions / module ───────────────────────── */

/// Attribut `clé` ou `clé = "valeur"`.
pub type Attribute = (String, Option<String>);

fn attr_value<'a>(attrs: &'a [Attribute], key: &str) -> Option<&'a str> {
    attrs.iter().find(|(k, _)| k == key).and_then(|(_, v)| v.as_deref())
}

fn set_attr_value(attrs: &mut Vec<Attribute>, key: &str, value: Option<String>) {
    match attrs.iter_mut().find(|(k, _)| k == key) {
        Some(slot) => slot.1 = value,
        None => attrs.push((key.to_string(), value)),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<(String, Type)>,
    pub results: Vec<Type>,
    pub attrs: Vec<Attribute>,
    pub body: Vec<Operation>,
    pub loc: Location,
}

impl Function {
    pub fn is_exported(&self) -> bool {
        self.attrs.iter().any(|(k, _)| k == "export")
    }

    pub fn has_attr(&self, key: &str) -> bool {
        self.attrs.iter().any(|(k, _)| k == key)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        attr_value(&self.attrs, key)
    }

    pub fn set_attr(&mut self, key: &str, value: impl Into<String>) {
        set_attr_value(&mut self.attrs, key, Some(value.into()));
    }

    pub fn param_types(&self) -> impl Iterator<Item = &Type> {
        self.params.iter().map(|(_, t)| t)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Module {
    pub name: Option<String>,
    pub attrs: Vec<Attribute>,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        attr_value(&self.attrs, key)
    }

    pub fn set_attr(&mut self, key: &str, value: impl Into<String>) {
        set_attr_value(&mut self.attrs, key, Some(value.into()));
    }

    /// Tous les types mentionnés (paramètres, résultats, ops).
    pub fn types(&self) -> impl Iterator<Item = (&Function, &Type)> {
        self.functions.iter().flat_map(|f| {
            f.param_types()
                .chain(&f.results)
                .chain(f.body.iter().flat_map(|op| &op.types))
                .map(move |t| (f, t))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_display_and_counts() {
        let t = Type::Tensor { dims: vec![Some(4), None], element: ScalarKind::F32 };
        assert_eq!(t.to_string(), "tensor<4x?xf32>");
        assert_eq!(t.static_element_count(), None);
        let t = Type::Tensor { dims: vec![], element: ScalarKind::I64 };
        assert_eq!(t.to_string(), "tensor<i64>");
        assert_eq!(t.static_element_count(), Some(1));
    }

    #[test]
    fn location_forms() {
        let loc = Location::call_site(
            Location::name("callee", Location::file("a.tsl", 1, 2)),
            Location::opaque(Location::file("b.tsl", 3, 4)),
        );
        assert_eq!(
            loc.to_string(),
            r#"callsite("callee"("a.tsl":1:2) at opaque("b.tsl":3:4))"#
        );
        assert_eq!(loc.brief(), "callee(a.tsl:1:2) at b.tsl:3:4");
        assert_eq!(Location::name("n", Location::Unknown).to_string(), "\"n\"");
    }
}
