//! variant.rs — Valeurs étiquetées échangées avec la VM.
//!
//! `Variant` est un ensemble fermé (vide / scalaire / référence) ;
//! `VariantList` une séquence positionnelle à capacité fixe.

use std::fmt;

use tessel_bytecode::ValueKind;

use crate::refs::VmRef;
use crate::status::{Status, VmResult};

#[derive(Debug, Clone, Default)]
pub enum Variant {
    #[default]
    Empty,
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Ref(VmRef),
}

impl Variant {
    pub const fn kind(&self) -> Option<ValueKind> {
        match self {
            Self::Empty => None,
            Self::I32(_) => Some(ValueKind::I32),
            Self::I64(_) => Some(ValueKind::I64),
            Self::F32(_) => Some(ValueKind::F32),
            Self::F64(_) => Some(ValueKind::F64),
            Self::Ref(_) => Some(ValueKind::Ref),
        }
    }

    /// Une variante vide tient lieu de référence nulle.
    pub fn matches(&self, kind: ValueKind) -> bool {
        match self {
            Self::Empty => kind == ValueKind::Ref,
            other => other.kind() == Some(kind),
        }
    }

    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub const fn as_i32(&self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_f32(&self) -> Option<f32> {
        match self {
            Self::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_vm_ref(&self) -> Option<&VmRef> {
        match self {
            Self::Ref(r) => Some(r),
            _ => None,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("None"),
            Self::I32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
            Self::Ref(r) => f.write_str(&r.describe()),
        }
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<f32> for Variant {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<VmRef> for Variant {
    fn from(r: VmRef) -> Self {
        Self::Ref(r)
    }
}

/* ─────────────────────────── VariantList ─────────────────────────── */

#[derive(Debug, Clone, Default)]
pub struct VariantList {
    capacity: usize,
    items: Vec<Variant>,
}

impl VariantList {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, items: Vec::with_capacity(capacity) }
    }

    pub fn from_variants(items: Vec<Variant>) -> Self {
        Self { capacity: items.len(), items }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, value: impl Into<Variant>) -> VmResult<()> {
        if self.items.len() >= self.capacity {
            return Err(Status::out_of_range(format!(
                "variant list is full (capacity {})",
                self.capacity
            )));
        }
        self.items.push(value.into());
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&Variant> {
        self.items.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Variant> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[Variant] {
        &self.items
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Remplace le contenu (sortie d’invocation) ; la capacité suit si besoin.
    pub(crate) fn replace(&mut self, items: Vec<Variant>) {
        self.capacity = self.capacity.max(items.len());
        self.items = items;
    }
}

impl<'a> IntoIterator for &'a VariantList {
    type Item = &'a Variant;
    type IntoIter = std::slice::Iter<'a, Variant>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for VariantList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<VmVariantList({}): [", self.items.len())?;
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{item}")?;
        }
        f.write_str("]>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::RoByteBuffer;
    use bytes::Bytes;
    use std::sync::Arc;

    #[test]
    fn capacity_is_enforced() {
        let mut list = VariantList::new(1);
        list.push(3).unwrap();
        let err = list.push(4).unwrap_err();
        assert_eq!(err.code(), crate::StatusCode::OutOfRange);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn display_is_positional() {
        let buf = VmRef::new(Arc::new(RoByteBuffer::new(Bytes::from_static(b"abcd")))).unwrap();
        let mut list = VariantList::new(4);
        list.push(7).unwrap();
        list.push(Variant::Empty).unwrap();
        list.push(buf).unwrap();
        list.push(1.5f32).unwrap();
        assert_eq!(list.to_string(), "<VmVariantList(4): [7, None, RoByteBuffer(4), 1.5]>");
    }

    #[test]
    fn empty_stands_for_null_ref() {
        assert!(Variant::Empty.matches(ValueKind::Ref));
        assert!(!Variant::Empty.matches(ValueKind::I32));
        assert!(Variant::I64(1).matches(ValueKind::I64));
    }
}
