//! abi.rs — ABI “brute” des fonctions exportées.
//!
//! - Table des types scalaires (code, nom, taille, format hôte)
//! - Descriptions d’arguments / résultats (buffer, scalaire, objet ref)
//! - Mangling compact des signatures : `I15!B11!d10d128d64R15!B11!t6d32d8d64`
//!
//! Grammaire d’une signature :
//!   span    := tag (len+1) '!' contenu          (len = longueur du contenu)
//!   racine  := span('I', args)? span('R', args)?
//!   args    := (span('B', items) | span('S', items) | span('O', ""))*
//!   items   := ('t' entier | 'd' entier)*          (t omis ⇒ float32, d=-1 ⇒ dynamique)

use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use thiserror::Error;

/* ─────────────────────────── Types scalaires ─────────────────────────── */

/// Types scalaires connus de l’ABI. Le discriminant est le code sérialisé.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ScalarType {
    IeeeFloat32 = 0,
    IeeeFloat16 = 1,
    IeeeFloat64 = 2,
    GoogleBfloat16 = 3,
    Sint8 = 4,
    Sint16 = 5,
    Sint32 = 6,
    Sint64 = 7,
    Uint8 = 8,
    Uint16 = 9,
    Uint32 = 10,
    Uint64 = 11,
}

/// Plus grand code de type scalaire valide.
pub const MAX_SCALAR_TYPE: u32 = 11;

struct ScalarInfo {
    name: &'static str,
    size: usize,
    host_format: Option<&'static str>,
}

const SCALAR_TABLE: [ScalarInfo; 12] = [
    ScalarInfo { name: "float32", size: 4, host_format: Some("f") },
    ScalarInfo { name: "float16", size: 2, host_format: None },
    ScalarInfo { name: "float64", size: 8, host_format: Some("d") },
    ScalarInfo { name: "bfloat16", size: 2, host_format: None },
    ScalarInfo { name: "sint8", size: 1, host_format: Some("b") },
    ScalarInfo { name: "sint16", size: 2, host_format: Some("h") },
    ScalarInfo { name: "sint32", size: 4, host_format: Some("i") },
    ScalarInfo { name: "sint64", size: 8, host_format: Some("q") },
    ScalarInfo { name: "uint8", size: 1, host_format: Some("c") },
    ScalarInfo { name: "uint16", size: 2, host_format: Some("H") },
    ScalarInfo { name: "uint32", size: 4, host_format: Some("I") },
    ScalarInfo { name: "uint64", size: 8, host_format: Some("Q") },
];

const ALL_SCALAR_TYPES: [ScalarType; 12] = [
    ScalarType::IeeeFloat32,
    ScalarType::IeeeFloat16,
    ScalarType::IeeeFloat64,
    ScalarType::GoogleBfloat16,
    ScalarType::Sint8,
    ScalarType::Sint16,
    ScalarType::Sint32,
    ScalarType::Sint64,
    ScalarType::Uint8,
    ScalarType::Uint16,
    ScalarType::Uint32,
    ScalarType::Uint64,
];

impl ScalarType {
    /// Résout un code brut ; `None` si hors table.
    pub fn from_code(code: u32) -> Option<Self> {
        ALL_SCALAR_TYPES.get(code as usize).copied()
    }

    pub const fn code(self) -> u32 {
        self as u32
    }

    fn info(self) -> &'static ScalarInfo {
        &SCALAR_TABLE[self as usize]
    }

    /// Nom lisible (`float32`, `sint32`, …).
    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Taille d’un élément, en octets.
    pub fn size(self) -> usize {
        self.info().size
    }

    /// Format hôte (style buffer protocol). `None` pour f16/bf16.
    pub fn host_format(self) -> Option<&'static str> {
        self.info().host_format
    }

    pub fn all() -> impl Iterator<Item = Self> {
        ALL_SCALAR_TYPES.into_iter()
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/* ─────────────────────────── Descriptions ─────────────────────────── */

/// Description d’un argument ou d’un résultat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Description {
    /// Buffer dense ; `dims[i] < 0` ⇒ dimension dynamique.
    Buffer { scalar_type: ScalarType, dims: Vec<i32> },
    Scalar { scalar_type: ScalarType },
    RefObject,
}

impl Description {
    pub fn buffer(scalar_type: ScalarType, dims: impl Into<Vec<i32>>) -> Self {
        Self::Buffer { scalar_type, dims: dims.into() }
    }

    pub const fn scalar(scalar_type: ScalarType) -> Self {
        Self::Scalar { scalar_type }
    }

    pub fn dims(&self) -> &[i32] {
        match self {
            Self::Buffer { dims, .. } => dims,
            _ => &[],
        }
    }

    pub const fn scalar_type(&self) -> Option<ScalarType> {
        match self {
            Self::Buffer { scalar_type, .. } | Self::Scalar { scalar_type } => Some(*scalar_type),
            Self::RefObject => None,
        }
    }

    pub fn has_dynamic_dims(&self) -> bool {
        self.dims().iter().any(|d| *d < 0)
    }

    fn write_mangled(&self, out: &mut String) {
        let mut items = String::new();
        let tag = match self {
            Self::Buffer { scalar_type, dims } => {
                if *scalar_type != ScalarType::IeeeFloat32 {
                    let _ = write!(items, "t{}", scalar_type.code());
                }
                for d in dims {
                    let _ = write!(items, "d{d}");
                }
                'B'
            }
            Self::Scalar { scalar_type } => {
                if *scalar_type != ScalarType::IeeeFloat32 {
                    let _ = write!(items, "t{}", scalar_type.code());
                }
                'S'
            }
            Self::RefObject => 'O',
        };
        write_span(out, tag, &items);
    }
}

impl fmt::Display for Description {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer { scalar_type, dims } => {
                write!(f, "Buffer<{scalar_type}[")?;
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        f.write_char('x')?;
                    }
                    if *d < 0 {
                        f.write_char('?')?;
                    } else {
                        write!(f, "{d}")?;
                    }
                }
                f.write_str("]>")
            }
            Self::Scalar { scalar_type } => write!(f, "{scalar_type}"),
            Self::RefObject => f.write_str("RefObject<?>"),
        }
    }
}

/* ─────────────────────────── Signature brute ─────────────────────────── */

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("unexpected end of signature at offset {0}")]
    UnexpectedEnd(usize),
    #[error("unexpected character '{found}' at offset {offset}")]
    Unexpected { found: char, offset: usize },
    #[error("bad span length at offset {0}")]
    BadLength(usize),
    #[error("illegal scalar type code {0}")]
    IllegalScalarType(i64),
    #[error("duplicate '{0}' section")]
    Duplicate(char),
}

/// Signature décodée : entrées puis résultats, dans l’ordre positionnel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSignature {
    pub inputs: Vec<Description>,
    pub results: Vec<Description>,
}

impl RawSignature {
    pub fn new(inputs: Vec<Description>, results: Vec<Description>) -> Self {
        Self { inputs, results }
    }

    /// Produit la forme manglée (`I..R..`).
    pub fn mangle(&self) -> String {
        let mut out = String::new();
        let mut section = String::new();
        for d in &self.inputs {
            d.write_mangled(&mut section);
        }
        write_span(&mut out, 'I', &section);
        section.clear();
        for d in &self.results {
            d.write_mangled(&mut section);
        }
        write_span(&mut out, 'R', &section);
        out
    }

    pub fn parse(s: &str) -> Result<Self, SignatureError> {
        let mut reader = SpanReader::new(s, 0);
        let mut sig = Self::default();
        let (mut seen_inputs, mut seen_results) = (false, false);
        while !reader.at_end() {
            let (tag, content, base) = reader.span()?;
            let target = match tag {
                'I' if !seen_inputs => {
                    seen_inputs = true;
                    &mut sig.inputs
                }
                'R' if !seen_results => {
                    seen_results = true;
                    &mut sig.results
                }
                'I' | 'R' => return Err(SignatureError::Duplicate(tag)),
                other => return Err(SignatureError::Unexpected { found: other, offset: base }),
            };
            parse_descriptions(content, base, target)?;
        }
        Ok(sig)
    }
}

impl fmt::Display for RawSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, ds: &[Description]) -> fmt::Result {
            f.write_char('(')?;
            for (i, d) in ds.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{d}")?;
            }
            f.write_char(')')
        }
        list(f, &self.inputs)?;
        f.write_str(" -> ")?;
        list(f, &self.results)
    }
}

/// Forme lisible d’une signature manglée, `None` si elle est invalide.
pub fn signature_to_string(mangled: &str) -> Option<String> {
    RawSignature::parse(mangled).ok().map(|s| s.to_string())
}

fn write_span(out: &mut String, tag: char, content: &str) {
    let _ = write!(out, "{tag}{}!{content}", content.len() + 1);
}

fn parse_descriptions(content: &str, base: usize, out: &mut Vec<Description>) -> Result<(), SignatureError> {
    let mut reader = SpanReader::new(content, base);
    while !reader.at_end() {
        let (tag, items, items_base) = reader.span()?;
        let mut scalar_type = ScalarType::IeeeFloat32;
        let mut dims = Vec::new();
        let mut it = ItemReader { s: items, pos: 0, base: items_base };
        while let Some((key, value)) = it.next_item()? {
            match key {
                't' => {
                    scalar_type = u32::try_from(value)
                        .ok()
                        .and_then(ScalarType::from_code)
                        .ok_or(SignatureError::IllegalScalarType(value))?;
                }
                'd' => dims.push(i32::try_from(value).map_err(|_| SignatureError::BadLength(it.offset()))?),
                other => return Err(SignatureError::Unexpected { found: other, offset: it.offset() }),
            }
        }
        out.push(match tag {
            'B' => Description::Buffer { scalar_type, dims },
            'S' => Description::Scalar { scalar_type },
            'O' => Description::RefObject,
            other => return Err(SignatureError::Unexpected { found: other, offset: items_base }),
        });
    }
    Ok(())
}

struct SpanReader<'a> {
    s: &'a str,
    pos: usize,
    base: usize,
}

impl<'a> SpanReader<'a> {
    const fn new(s: &'a str, base: usize) -> Self {
        Self { s, pos: 0, base }
    }

    const fn at_end(&self) -> bool {
        self.pos >= self.s.len()
    }

    /// Lit `tag len '!' contenu` ; renvoie (tag, contenu, offset absolu du contenu).
    fn span(&mut self) -> Result<(char, &'a str, usize), SignatureError> {
        let bytes = self.s.as_bytes();
        let tag = *bytes.get(self.pos).ok_or(SignatureError::UnexpectedEnd(self.base + self.pos))? as char;
        self.pos += 1;
        let start = self.pos;
        while self.pos < bytes.len() && bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        let len: usize = self
            .s
            .get(start..self.pos)
            .unwrap_or_default()
            .parse()
            .map_err(|_| SignatureError::BadLength(self.base + start))?;
        match bytes.get(self.pos) {
            Some(b'!') => self.pos += 1,
            Some(&other) => {
                return Err(SignatureError::Unexpected { found: other as char, offset: self.base + self.pos })
            }
            None => return Err(SignatureError::UnexpectedEnd(self.base + self.pos)),
        }
        if len == 0 {
            return Err(SignatureError::BadLength(self.base + start));
        }
        let end = self.pos + len - 1;
        if end > bytes.len() {
            return Err(SignatureError::UnexpectedEnd(self.base + bytes.len()));
        }
        let content = self.s.get(self.pos..end).ok_or(SignatureError::BadLength(self.base + start))?;
        let content_base = self.base + self.pos;
        self.pos = end;
        Ok((tag, content, content_base))
    }
}

struct ItemReader<'a> {
    s: &'a str,
    pos: usize,
    base: usize,
}

impl ItemReader<'_> {
    const fn offset(&self) -> usize {
        self.base + self.pos
    }

    fn next_item(&mut self) -> Result<Option<(char, i64)>, SignatureError> {
        let bytes = self.s.as_bytes();
        let Some(&key) = bytes.get(self.pos) else { return Ok(None) };
        self.pos += 1;
        let start = self.pos;
        if bytes.get(self.pos) == Some(&b'-') {
            self.pos += 1;
        }
        while self.pos < bytes.len() && bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        let value = self
            .s
            .get(start..self.pos)
            .unwrap_or_default()
            .parse::<i64>()
            .map_err(|_| SignatureError::BadLength(self.base + start))?;
        Ok(Some((key as char, value)))
    }
}

/* ───────────────────────────── Tests ───────────────────────────── */

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const SAMPLE: &str = "I15!B11!d10d128d64R15!B11!t6d32d8d64";

    #[test]
    fn parses_reference_signature() {
        let sig = RawSignature::parse(SAMPLE).unwrap();
        assert_eq!(sig.inputs, vec![Description::buffer(ScalarType::IeeeFloat32, [10, 128, 64])]);
        assert_eq!(sig.results, vec![Description::buffer(ScalarType::Sint32, [32, 8, 64])]);
        assert_eq!(sig.mangle(), SAMPLE);
    }

    #[test]
    fn renders_debug_form() {
        assert_eq!(
            signature_to_string(SAMPLE).as_deref(),
            Some("(Buffer<float32[10x128x64]>) -> (Buffer<sint32[32x8x64]>)")
        );
        let dynamic = RawSignature::new(vec![Description::buffer(ScalarType::IeeeFloat64, [-1, 4])], vec![]);
        assert_eq!(dynamic.to_string(), "(Buffer<float64[?x4]>) -> ()");
        assert_eq!(RawSignature::parse(&dynamic.mangle()).unwrap(), dynamic);
    }

    #[test]
    fn scalars_and_refs() {
        let sig = RawSignature::new(
            vec![Description::scalar(ScalarType::Sint32), Description::RefObject],
            vec![Description::scalar(ScalarType::IeeeFloat32)],
        );
        let mangled = sig.mangle();
        assert_eq!(mangled, "I9!S3!t6O1!R4!S1!");
        assert_eq!(RawSignature::parse(&mangled).unwrap(), sig);
        assert_eq!(sig.to_string(), "(sint32, RefObject<?>) -> (float32)");
    }

    #[test]
    fn rejects_malformed() {
        assert!(RawSignature::parse("I99!B1!").is_err());
        assert!(RawSignature::parse("X1!").is_err());
        assert!(matches!(RawSignature::parse("I7!B4!t99"), Err(SignatureError::IllegalScalarType(99))));
        assert!(matches!(RawSignature::parse("I1!I1!"), Err(SignatureError::Duplicate('I'))));
        assert_eq!(signature_to_string("I3!Bx"), None);
    }

    #[test]
    fn scalar_table_is_consistent() {
        assert_eq!(ScalarType::from_code(MAX_SCALAR_TYPE), Some(ScalarType::Uint64));
        assert_eq!(ScalarType::from_code(MAX_SCALAR_TYPE + 1), None);
        assert_eq!(ScalarType::Sint32.host_format(), Some("i"));
        assert_eq!(ScalarType::IeeeFloat16.host_format(), None);
        assert_eq!(ScalarType::GoogleBfloat16.size(), 2);
        for t in ScalarType::all() {
            assert_eq!(ScalarType::from_code(t.code()), Some(t));
        }
    }

    fn arb_description() -> impl Strategy<Value = Description> {
        let ty = (0..=MAX_SCALAR_TYPE).prop_map(|c| ScalarType::from_code(c).unwrap());
        prop_oneof![
            (ty.clone(), prop::collection::vec(-1i32..512, 0..5))
                .prop_map(|(t, dims)| Description::Buffer { scalar_type: t, dims }),
            ty.prop_map(Description::scalar),
            Just(Description::RefObject),
        ]
    }

    proptest! {
        #[test]
        fn mangling_is_lossless(
            inputs in prop::collection::vec(arb_description(), 0..4),
            results in prop::collection::vec(arb_description(), 0..4),
        ) {
            let sig = RawSignature::new(inputs, results);
            prop_assert_eq!(RawSignature::parse(&sig.mangle()).unwrap(), sig);
        }
    }
}
