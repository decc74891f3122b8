//! shaped.rs — Buffers décrits en texte, pour les outils en ligne de commande.
//!
//! Syntaxe : `[DxDx...x]type=valeurs`
//!   `4xf32=1 2 3 4`   `[2x2]i32=[1 2][3 4]`   `i32=5` (scalaire)
//!
//! Crochets ignorés à la lecture, guillemets/espaces retirés aux bords.
//! Une seule valeur remplit toute la forme. L’affichage imbrique une paire
//! de crochets par ligne et s’arrête à `MAX_PRINTED_ELEMENTS` (suivi de `...`).

use std::fmt;
use std::str::FromStr;

use tessel_bytecode::abi::{Description as Arg, ScalarType};
use tessel_vm::{Status, VmResult};

use crate::host_types::{Element, HostBuffer, HostValue};

pub const MAX_PRINTED_ELEMENTS: usize = 1024;

const TYPE_NAMES: &[(&str, ScalarType)] = &[
    ("i8", ScalarType::Sint8),
    ("i16", ScalarType::Sint16),
    ("i32", ScalarType::Sint32),
    ("i64", ScalarType::Sint64),
    ("u8", ScalarType::Uint8),
    ("u16", ScalarType::Uint16),
    ("u32", ScalarType::Uint32),
    ("u64", ScalarType::Uint64),
    ("f32", ScalarType::IeeeFloat32),
    ("f64", ScalarType::IeeeFloat64),
];

fn short_name(scalar_type: ScalarType) -> Option<&'static str> {
    TYPE_NAMES.iter().find(|(_, st)| *st == scalar_type).map(|(n, _)| *n)
}

/// Tableau hôte C-contigu, little-endian.
#[derive(Clone, PartialEq, Eq)]
pub struct ShapedBuffer {
    element_type: ScalarType,
    dims: Vec<usize>,
    data: Vec<u8>,
}

impl ShapedBuffer {
    pub fn new(element_type: ScalarType, dims: Vec<usize>, data: Vec<u8>) -> VmResult<Self> {
        short_name(element_type)
            .ok_or_else(|| Status::unimplemented(format!("shaped buffers do not support {element_type}")))?;
        let expected = dims.iter().try_fold(element_type.size(), |acc, d| acc.checked_mul(*d));
        if expected != Some(data.len()) {
            return Err(Status::invalid_argument(format!(
                "{} bytes do not match {dims:?} elements of {element_type}",
                data.len()
            )));
        }
        Ok(Self { element_type, dims, data })
    }

    pub fn parse(text: &str) -> VmResult<Self> {
        let text = text.trim().trim_matches(|c| c == '"' || c == '\'').trim();
        let (head, values) = text
            .split_once('=')
            .ok_or_else(|| Status::invalid_argument(format!("shaped buffer '{text}' has no '=' separator")))?;
        let head: String = head.chars().filter(|c| !matches!(c, '[' | ']') && !c.is_whitespace()).collect();
        let (shape, element_type) = TYPE_NAMES
            .iter()
            .find_map(|(name, st)| head.strip_suffix(name).map(|rest| (rest, *st)))
            .ok_or_else(|| Status::invalid_argument(format!("unknown element type in '{head}'")))?;
        let dims = parse_shape(shape)?;
        let count: usize = dims.iter().product();

        let tokens: Vec<&str> = values
            .split(|c: char| c.is_whitespace() || matches!(c, '[' | ']' | ','))
            .filter(|t| !t.is_empty())
            .collect();
        let data = match element_type {
            ScalarType::Sint8 => parse_values::<i8>(&tokens, count)?,
            ScalarType::Sint16 => parse_values::<i16>(&tokens, count)?,
            ScalarType::Sint32 => parse_values::<i32>(&tokens, count)?,
            ScalarType::Sint64 => parse_values::<i64>(&tokens, count)?,
            ScalarType::Uint8 => parse_values::<u8>(&tokens, count)?,
            ScalarType::Uint16 => parse_values::<u16>(&tokens, count)?,
            ScalarType::Uint32 => parse_values::<u32>(&tokens, count)?,
            ScalarType::Uint64 => parse_values::<u64>(&tokens, count)?,
            ScalarType::IeeeFloat32 => parse_values::<f32>(&tokens, count)?,
            ScalarType::IeeeFloat64 => parse_values::<f64>(&tokens, count)?,
            other => return Err(Status::unimplemented(format!("shaped buffers do not support {other}"))),
        };
        Ok(Self { element_type, dims, data })
    }

    pub const fn element_type(&self) -> ScalarType {
        self.element_type
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Valeur d’entrée pour un argument décrit par `desc`.
    pub fn to_host_value(&self, desc: &Arg) -> VmResult<HostValue> {
        match desc {
            Arg::Scalar { scalar_type } => {
                if !self.dims.is_empty() || self.element_type != *scalar_type {
                    return Err(Status::invalid_argument(format!("expected a scalar {desc}, got {self}")));
                }
                match scalar_type {
                    ScalarType::Sint32 => Ok(HostValue::I32(<i32 as Element>::from_le(&self.data))),
                    ScalarType::Sint64 => Ok(HostValue::I64(<i64 as Element>::from_le(&self.data))),
                    ScalarType::IeeeFloat32 => Ok(HostValue::F32(<f32 as Element>::from_le(&self.data))),
                    ScalarType::IeeeFloat64 => Ok(HostValue::F64(<f64 as Element>::from_le(&self.data))),
                    _ => Err(Status::unimplemented(format!("Unsupported signature scalar type: {desc}"))),
                }
            }
            Arg::Buffer { .. } => {
                HostBuffer::new(self.element_type, self.dims.clone(), self.data.clone()).map(HostValue::Buffer)
            }
            Arg::RefObject => Err(Status::unimplemented("Ref objects not yet supported")),
        }
    }

    /// Copie contiguë d’une valeur hôte (scalaire, tableau ou buffer).
    pub fn from_host_value(value: &HostValue) -> VmResult<Self> {
        match value {
            HostValue::I32(v) => Self::scalar(*v),
            HostValue::I64(v) => Self::scalar(*v),
            HostValue::F32(v) => Self::scalar(*v),
            HostValue::F64(v) => Self::scalar(*v),
            HostValue::Array(array) => {
                let data = (0..array.element_count())
                    .map(|i| {
                        array
                            .element_bytes(i)
                            .ok_or_else(|| Status::out_of_range(format!("element {i} is outside the mapping")))
                    })
                    .collect::<VmResult<Vec<&[u8]>>>()?
                    .concat();
                Self::new(array.scalar_type(), array.dims().to_vec(), data)
            }
            HostValue::Buffer(buffer) => {
                let element_type = ScalarType::all()
                    .find(|st| st.size() == buffer.item_size() && st.host_format() == buffer.format())
                    .ok_or_else(|| Status::invalid_argument(format!("no element type matches {buffer:?}")))?;
                Self::new(element_type, buffer.dims().to_vec(), buffer.data().to_vec())
            }
            HostValue::None => Err(Status::invalid_argument("cannot print an empty value")),
        }
    }

    fn scalar<T: Element>(value: T) -> VmResult<Self> {
        let mut data = Vec::new();
        value.extend_le(&mut data);
        Self::new(T::SCALAR_TYPE, Vec::new(), data)
    }

    /// Affichage limité à `limit` éléments.
    pub fn format_truncated(&self, limit: usize) -> String {
        Truncated { buffer: self, limit }.to_string()
    }
}

/// Lit une entrée par argument de `descs`.
pub fn parse_inputs(descs: &[Arg], inputs: &[String]) -> VmResult<Vec<HostValue>> {
    if descs.len() != inputs.len() {
        return Err(Status::invalid_argument(format!(
            "Mismatched input count (received: {}, expected: {})",
            inputs.len(),
            descs.len()
        )));
    }
    descs.iter().zip(inputs).map(|(desc, text)| ShapedBuffer::parse(text)?.to_host_value(desc)).collect()
}

fn parse_shape(shape: &str) -> VmResult<Vec<usize>> {
    let shape = shape.trim_end_matches('x');
    if shape.is_empty() {
        return Ok(Vec::new());
    }
    shape
        .split('x')
        .map(|d| d.parse().map_err(|_| Status::invalid_argument(format!("invalid dimension '{d}' in shaped buffer"))))
        .collect()
}

fn parse_values<T: Element + FromStr>(tokens: &[&str], count: usize) -> VmResult<Vec<u8>> {
    let parse = |t: &str| {
        t.parse::<T>()
            .map_err(|_| Status::invalid_argument(format!("cannot parse '{t}' as {}", T::SCALAR_TYPE)))
    };
    let mut data = Vec::with_capacity(count * T::SCALAR_TYPE.size());
    match tokens {
        [single] if count != 1 => {
            let v = parse(single)?;
            for _ in 0..count {
                v.extend_le(&mut data);
            }
        }
        _ if tokens.len() == count => {
            for t in tokens {
                parse(t)?.extend_le(&mut data);
            }
        }
        _ => {
            return Err(Status::invalid_argument(format!(
                "shaped buffer expects {count} values, got {}",
                tokens.len()
            )))
        }
    }
    Ok(data)
}

/* ─────────────────────────── Affichage ─────────────────────────── */

struct Truncated<'a> {
    buffer: &'a ShapedBuffer,
    limit: usize,
}

impl fmt::Display for Truncated<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.buffer;
        for d in &b.dims {
            write!(f, "{d}x")?;
        }
        write!(f, "{}=", short_name(b.element_type).unwrap_or("?"))?;
        match b.element_type {
            ScalarType::Sint8 => write_values::<i8>(f, b, self.limit),
            ScalarType::Sint16 => write_values::<i16>(f, b, self.limit),
            ScalarType::Sint32 => write_values::<i32>(f, b, self.limit),
            ScalarType::Sint64 => write_values::<i64>(f, b, self.limit),
            ScalarType::Uint8 => write_values::<u8>(f, b, self.limit),
            ScalarType::Uint16 => write_values::<u16>(f, b, self.limit),
            ScalarType::Uint32 => write_values::<u32>(f, b, self.limit),
            ScalarType::Uint64 => write_values::<u64>(f, b, self.limit),
            ScalarType::IeeeFloat32 => write_values::<f32>(f, b, self.limit),
            ScalarType::IeeeFloat64 => write_values::<f64>(f, b, self.limit),
            _ => f.write_str("?"),
        }
    }
}

fn write_values<T: Element + fmt::Display>(f: &mut fmt::Formatter<'_>, b: &ShapedBuffer, limit: usize) -> fmt::Result {
    let values: Vec<T> = b.data.chunks_exact(T::SCALAR_TYPE.size()).take(limit).map(T::from_le).collect();
    let mut next = 0;
    if !write_level(f, &b.dims, &values, &mut next)? {
        f.write_str("...")?;
    }
    Ok(())
}

/// Écrit un niveau de la forme ; `false` si la limite a coupé l’affichage.
fn write_level<T: fmt::Display>(f: &mut fmt::Formatter<'_>, dims: &[usize], values: &[T], next: &mut usize) -> Result<bool, fmt::Error> {
    match dims {
        [] | [_] => {
            let n = dims.first().copied().unwrap_or(1);
            for i in 0..n {
                let Some(v) = values.get(*next) else { return Ok(false) };
                if i > 0 {
                    f.write_str(" ")?;
                }
                write!(f, "{v}")?;
                *next += 1;
            }
            Ok(true)
        }
        [n, rest @ ..] => {
            for _ in 0..*n {
                f.write_str("[")?;
                if !write_level(f, rest, values, next)? {
                    return Ok(false);
                }
                f.write_str("]")?;
            }
            Ok(true)
        }
    }
}

impl fmt::Display for ShapedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Truncated { buffer: self, limit: MAX_PRINTED_ELEMENTS }, f)
    }
}

impl fmt::Debug for ShapedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShapedBuffer({})", self.format_truncated(8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{BufferUsage, DeviceBuffer, MemoryType};
    use crate::host_types::{HostTypeFactory, NdarrayHostTypeFactory};
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_shapes_and_scalars() {
        let b = ShapedBuffer::parse(" \"[2x2]f32=[1 2][3 4]\" ").unwrap();
        assert_eq!((b.element_type(), b.dims()), (ScalarType::IeeeFloat32, &[2, 2][..]));
        assert_eq!(b.to_string(), "2x2xf32=[1 2][3 4]");

        let b = ShapedBuffer::parse("4xi8=1,2,3,-4").unwrap();
        assert_eq!(b.data(), [1, 2, 3, 0xfc]);
        assert_eq!(b.to_string(), "4xi8=1 2 3 -4");

        let b = ShapedBuffer::parse("i32=5").unwrap();
        assert!(b.dims().is_empty());
        assert_eq!(b.to_string(), "i32=5");

        let b = ShapedBuffer::parse("2x3xu16=7").unwrap();
        assert_eq!(b.to_string(), "2x3xu16=[7 7 7][7 7 7]");
    }

    #[test]
    fn parse_errors_are_invalid_arguments() {
        for bad in ["4xf32", "4xf16=1", "2xqx=1", "3xi32=1 2", "i8=300", "axf32=1"] {
            let err = ShapedBuffer::parse(bad).unwrap_err();
            assert_eq!(err.code(), tessel_vm::StatusCode::InvalidArgument, "{bad}: {err}");
        }
    }

    #[test]
    fn long_buffers_are_truncated() {
        let b = ShapedBuffer::parse("1100xu8=0").unwrap();
        let text = b.to_string();
        assert!(text.ends_with("0..."), "{text}");
        assert_eq!(text.split(' ').count(), MAX_PRINTED_ELEMENTS);

        let b = ShapedBuffer::parse("2x3xi32=1 2 3 4 5 6").unwrap();
        assert_eq!(b.format_truncated(4), "2x3xi32=[1 2 3][4...");
    }

    #[test]
    fn host_values_follow_the_argument_kind() {
        let b = ShapedBuffer::parse("i32=5").unwrap();
        assert!(matches!(b.to_host_value(&Arg::scalar(ScalarType::Sint32)).unwrap(), HostValue::I32(5)));
        assert!(matches!(b.to_host_value(&Arg::buffer(ScalarType::Sint32, Vec::new())).unwrap(), HostValue::Buffer(_)));
        assert!(b.to_host_value(&Arg::scalar(ScalarType::IeeeFloat32)).is_err());

        let v = ShapedBuffer::parse("i64=-70000000000").unwrap().to_host_value(&Arg::scalar(ScalarType::Sint64)).unwrap();
        assert!(matches!(v, HostValue::I64(-70_000_000_000)), "{v:?}");
        let v = ShapedBuffer::parse("f32=-2.5").unwrap().to_host_value(&Arg::scalar(ScalarType::IeeeFloat32)).unwrap();
        assert!(matches!(v, HostValue::F32(x) if x == -2.5), "{v:?}");
        let v = ShapedBuffer::parse("f64=0.125").unwrap().to_host_value(&Arg::scalar(ScalarType::IeeeFloat64)).unwrap();
        assert!(matches!(v, HostValue::F64(x) if x == 0.125), "{v:?}");

        let err = parse_inputs(&[Arg::scalar(ScalarType::Sint32)], &[]).unwrap_err();
        assert_eq!(err.message(), "Mismatched input count (received: 0, expected: 1)");
    }

    #[test]
    fn arrays_print_through_their_mapping() {
        let source = ShapedBuffer::parse("2x2xf32=1.5 2 3 4").unwrap();
        let buffer = DeviceBuffer::allocate_heap(MemoryType::HOST_LOCAL, BufferUsage::ALL, source.data().len());
        buffer.write_data(0, source.data()).unwrap();
        let array = NdarrayHostTypeFactory
            .create_immediate_ndarray(ScalarType::IeeeFloat32, &[2, 2], buffer)
            .unwrap();
        let printed = ShapedBuffer::from_host_value(&array).unwrap();
        assert_eq!(printed.to_string(), "2x2xf32=[1.5 2][3 4]");
        assert_eq!(ShapedBuffer::from_host_value(&HostValue::F64(0.25)).unwrap().to_string(), "f64=0.25");
    }
}
