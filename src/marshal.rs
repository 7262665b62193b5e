//! Type-directed marshalling into the D-Bus wire format.
//!
//! Encoding is dispatched on the parsed signature tree and validates that
//! the value tree conforms before any bytes for a value are written.
//! Output is always little-endian.  Alignment padding is zero-filled and is
//! computed from the running wire offset, so a marshaller can be started
//! mid-message.

use thiserror::Error;

use crate::signature::{self, SignatureError, Type};
use crate::types::{BasicValue, Value};

/// Array payloads may not exceed 2^26 bytes.
pub const MAX_ARRAY_LEN: usize = 1 << 26;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MarshalError {
    #[error("signature expects {expected}, value is {found}")]
    TypeMismatch { expected: String, found: String },
    #[error("unsigned value does not fit a signed field")]
    SignMismatch,
    #[error("value {0} out of range for its field")]
    OutOfRange(String),
    #[error("bad numeric string {0:?}")]
    BadNumber(String),
    #[error("doubles must be finite")]
    NonFinite,
    #[error("strings may not contain NUL")]
    InteriorNul,
    #[error("malformed object path {0:?}")]
    BadObjectPath(String),
    #[error("struct has {found} fields, signature expects {expected}")]
    ArityMismatch { expected: usize, found: usize },
    #[error("array payload exceeds {MAX_ARRAY_LEN} bytes")]
    ArrayTooBig,
    #[error(transparent)]
    BadSignature(#[from] SignatureError),
}

/// Append-only byte builder that tracks a running wire offset so alignment
/// holds even when encoding starts mid-message.
pub struct Encoder {
    buf: Vec<u8>,
    start: usize,
}

impl Encoder {
    pub fn new(start_offset: usize) -> Encoder {
        Encoder {
            buf: Vec::new(),
            start: start_offset,
        }
    }

    /// Current absolute wire offset.
    pub fn offset(&self) -> usize {
        self.start + self.buf.len()
    }

    /// Pads with zero bytes up to the next multiple of `alignment`.
    pub fn align(&mut self, alignment: usize) {
        let pad = (alignment - self.offset() % alignment) % alignment;
        for _ in 0..pad {
            self.buf.push(0);
        }
    }

    pub fn put_u8(&mut self, x: u8) {
        self.buf.push(x);
    }

    pub fn put_u16(&mut self, x: u16) {
        self.align(2);
        self.buf.extend_from_slice(&x.to_le_bytes());
    }

    pub fn put_u32(&mut self, x: u32) {
        self.align(4);
        self.buf.extend_from_slice(&x.to_le_bytes());
    }

    pub fn put_u64(&mut self, x: u64) {
        self.align(8);
        self.buf.extend_from_slice(&x.to_le_bytes());
    }

    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// u32 length, UTF-8 bytes, NUL terminator.
    pub fn put_string(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    /// u8 length, bytes, NUL terminator.
    pub fn put_signature(&mut self, s: &str) {
        self.buf.push(s.len() as u8);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    /// Reserves a u32 slot for an array length and returns its buffer index
    /// for back-patching.
    fn reserve_len(&mut self) -> usize {
        self.align(4);
        let idx = self.buf.len();
        self.buf.extend_from_slice(&[0; 4]);
        idx
    }

    fn patch_len(&mut self, idx: usize, len: u32) {
        self.buf[idx..idx + 4].copy_from_slice(&len.to_le_bytes());
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Encodes `values` against `types`, starting at the given wire offset.
pub fn marshal(
    types: &[Type],
    values: &[Value],
    start_offset: usize,
) -> Result<Vec<u8>, MarshalError> {
    if types.len() != values.len() {
        return Err(MarshalError::ArityMismatch {
            expected: types.len(),
            found: values.len(),
        });
    }
    let mut enc = Encoder::new(start_offset);
    for (ty, value) in types.iter().zip(values) {
        marshal_value(&mut enc, ty, value)?;
    }
    Ok(enc.into_vec())
}

fn mismatch(ty: &Type, value: &Value) -> MarshalError {
    MarshalError::TypeMismatch {
        expected: ty.to_string(),
        found: value.signature(),
    }
}

pub fn marshal_value(enc: &mut Encoder, ty: &Type, value: &Value) -> Result<(), MarshalError> {
    match ty {
        Type::Byte => match value {
            Value::Basic(BasicValue::Byte(x)) => {
                enc.put_u8(*x);
                Ok(())
            }
            _ => Err(mismatch(ty, value)),
        },
        Type::Boolean => match value {
            Value::Basic(BasicValue::Boolean(x)) => {
                enc.put_u32(*x as u32);
                Ok(())
            }
            _ => Err(mismatch(ty, value)),
        },
        Type::Int16 => match value {
            Value::Basic(BasicValue::Int16(x)) => {
                enc.put_u16(*x as u16);
                Ok(())
            }
            _ => Err(mismatch(ty, value)),
        },
        Type::Uint16 => match value {
            Value::Basic(BasicValue::Uint16(x)) => {
                enc.put_u16(*x);
                Ok(())
            }
            _ => Err(mismatch(ty, value)),
        },
        Type::Int32 => match value {
            Value::Basic(BasicValue::Int32(x)) => {
                enc.put_u32(*x as u32);
                Ok(())
            }
            _ => Err(mismatch(ty, value)),
        },
        Type::Uint32 => match value {
            Value::Basic(BasicValue::Uint32(x)) => {
                enc.put_u32(*x);
                Ok(())
            }
            _ => Err(mismatch(ty, value)),
        },
        Type::Int64 => {
            let x = int64_input(value).ok_or_else(|| mismatch(ty, value))??;
            enc.put_u64(x as u64);
            Ok(())
        }
        Type::Uint64 => {
            let x = uint64_input(value).ok_or_else(|| mismatch(ty, value))??;
            enc.put_u64(x);
            Ok(())
        }
        Type::Double => match value {
            Value::Double(d) => {
                if !d.is_finite() {
                    return Err(MarshalError::NonFinite);
                }
                enc.put_u64(d.to_bits());
                Ok(())
            }
            _ => Err(mismatch(ty, value)),
        },
        Type::String => match value {
            Value::Basic(BasicValue::String(s)) => {
                check_no_nul(s)?;
                enc.put_string(s);
                Ok(())
            }
            _ => Err(mismatch(ty, value)),
        },
        Type::ObjectPath => match value {
            Value::Basic(BasicValue::ObjectPath(p)) => {
                if !p.is_valid() {
                    return Err(MarshalError::BadObjectPath(p.0.clone()));
                }
                enc.put_string(&p.0);
                Ok(())
            }
            _ => Err(mismatch(ty, value)),
        },
        Type::Signature => match value {
            Value::Basic(BasicValue::Signature(s)) => {
                signature::parse(&s.0)?;
                enc.put_signature(&s.0);
                Ok(())
            }
            _ => Err(mismatch(ty, value)),
        },
        Type::UnixFd => match value {
            Value::Basic(BasicValue::UnixFd(x)) => {
                enc.put_u32(*x);
                Ok(())
            }
            _ => Err(mismatch(ty, value)),
        },
        Type::Variant => match value {
            Value::Variant(var) => {
                let inner_ty = signature::parse_single(&var.signature.0)?;
                enc.put_signature(&var.signature.0);
                marshal_value(enc, &inner_ty, &var.object)
            }
            _ => Err(mismatch(ty, value)),
        },
        Type::Array(elem) => marshal_array(enc, elem, value),
        Type::Struct(fields) => match value {
            Value::Struct(s) => {
                if s.objects.len() != fields.len() {
                    return Err(MarshalError::ArityMismatch {
                        expected: fields.len(),
                        found: s.objects.len(),
                    });
                }
                enc.align(8);
                for (fty, fval) in fields.iter().zip(&s.objects) {
                    marshal_value(enc, fty, fval)?;
                }
                Ok(())
            }
            _ => Err(mismatch(ty, value)),
        },
        // Dict entries only occur as array elements; marshal_array encodes
        // them pairwise.
        Type::DictEntry(..) => Err(mismatch(ty, value)),
    }
}

fn marshal_array(enc: &mut Encoder, elem: &Type, value: &Value) -> Result<(), MarshalError> {
    let len_idx = enc.reserve_len();
    enc.align(elem.alignment());
    let payload_start = enc.offset();

    match (elem, value) {
        (Type::Byte, Value::ByteArray(bytes)) => {
            enc.put_raw(bytes);
        }
        (Type::DictEntry(kty, vty), Value::Dictionary(dict)) => {
            for (k, v) in &dict.map {
                enc.align(8);
                marshal_value(enc, kty, &Value::Basic(k.clone()))?;
                marshal_value(enc, vty, v)?;
            }
        }
        (_, Value::Array(arr)) => {
            for v in &arr.objects {
                marshal_value(enc, elem, v)?;
            }
        }
        _ => {
            return Err(mismatch(&Type::Array(Box::new(elem.clone())), value));
        }
    }

    let payload_len = enc.offset() - payload_start;
    if payload_len > MAX_ARRAY_LEN {
        return Err(MarshalError::ArrayTooBig);
    }
    enc.patch_len(len_idx, payload_len as u32);
    Ok(())
}

fn check_no_nul(s: &str) -> Result<(), MarshalError> {
    if s.as_bytes().contains(&0) {
        Err(MarshalError::InteriorNul)
    } else {
        Ok(())
    }
}

// 64-bit fields accept native integers of the right signedness, narrower
// integers of the same signedness, and decimal or 0x hex strings.  Returns
// None when the value shape is not acceptable at all.

fn int64_input(value: &Value) -> Option<Result<i64, MarshalError>> {
    match value {
        Value::Basic(BasicValue::Int64(x)) => Some(Ok(*x)),
        Value::Basic(BasicValue::Int32(x)) => Some(Ok(*x as i64)),
        Value::Basic(BasicValue::Uint64(_)) => Some(Err(MarshalError::SignMismatch)),
        Value::Basic(BasicValue::String(s)) => Some(parse_int64_str(s)),
        _ => None,
    }
}

fn uint64_input(value: &Value) -> Option<Result<u64, MarshalError>> {
    match value {
        Value::Basic(BasicValue::Uint64(x)) => Some(Ok(*x)),
        Value::Basic(BasicValue::Uint32(x)) => Some(Ok(*x as u64)),
        Value::Basic(BasicValue::Int64(x)) => Some(if *x >= 0 {
            Ok(*x as u64)
        } else {
            Err(MarshalError::OutOfRange(x.to_string()))
        }),
        Value::Basic(BasicValue::String(s)) => Some(parse_uint64_str(s)),
        _ => None,
    }
}

fn parse_int64_str(s: &str) -> Result<i64, MarshalError> {
    let parsed = if let Some(hex) = s.strip_prefix("0x") {
        i64::from_str_radix(hex, 16)
    } else if let Some(hex) = s.strip_prefix("-0x") {
        i64::from_str_radix(&format!("-{}", hex), 16)
    } else {
        s.parse()
    };
    parsed.map_err(|_| MarshalError::BadNumber(s.to_owned()))
}

fn parse_uint64_str(s: &str) -> Result<u64, MarshalError> {
    if s.starts_with('-') {
        return Err(MarshalError::OutOfRange(s.to_owned()));
    }
    let parsed = if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|_| MarshalError::BadNumber(s.to_owned()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::signature::parse;
    use crate::types::{Array, Dictionary, Path, Signature, Struct, ToValue, Variant};
    use std::collections::HashMap;

    fn enc(sig: &str, values: Vec<Value>) -> Vec<u8> {
        marshal(&parse(sig).unwrap(), &values, 0).unwrap()
    }

    fn enc_err(sig: &str, values: Vec<Value>) -> MarshalError {
        marshal(&parse(sig).unwrap(), &values, 0).unwrap_err()
    }

    #[test]
    fn test_bytes() {
        let buf = enc(
            "yyyy",
            vec![0u8.into(), 127u8.into(), 128u8.into(), 255u8.into()],
        );
        assert_eq!(buf, vec![0x00, 0x7f, 0x80, 0xff]);
    }

    #[test]
    fn test_int16_pair() {
        let buf = enc("nn", vec![Value::from(10i16), Value::from(1000i16)]);
        assert_eq!(buf, vec![0x0a, 0x00, 0xe8, 0x03]);
    }

    #[test]
    fn test_u32_padding() {
        // One byte already on the wire forces three bytes of padding.
        let mut e = Encoder::new(0);
        e.put_u8(0);
        marshal_value(&mut e, &Type::Uint32, &Value::from(1u32)).unwrap();
        assert_eq!(e.into_vec(), vec![0, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn test_struct_alignment() {
        let inner = Struct::new(vec![1u8.into(), 2u8.into(), 3u8.into()]);
        let buf = enc(
            "y(yyy)y",
            vec![5u8.into(), Value::Struct(inner), 4u8.into()],
        );
        assert_eq!(buf, vec![5, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_string() {
        let buf = enc("s", vec!["abc123".into()]);
        assert_eq!(buf, b"\x06\x00\x00\x00abc123\x00");
    }

    #[test]
    fn test_array() {
        let empty: Vec<u32> = Vec::new();
        assert_eq!(enc("au", vec![empty.to_value()]), vec![0, 0, 0, 0]);

        let buf = enc("au", vec![vec![1u32, 2, 3].to_value()]);
        assert_eq!(buf, vec![12, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]);
    }

    #[test]
    fn test_empty_array_pads_to_element() {
        // The element alignment pad is written even with no elements and is
        // not counted in the length.
        let empty = Value::Array(Array::typed("t", Vec::new()));
        assert_eq!(enc("at", vec![empty]), vec![0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_byte_array() {
        let buf = enc("ay", vec![Value::ByteArray(vec![9, 8, 7])]);
        assert_eq!(buf, vec![3, 0, 0, 0, 9, 8, 7]);
    }

    #[test]
    fn test_variant() {
        let v = Variant::new(Value::from(42u32), "u");
        let buf = enc("v", vec![Value::Variant(v)]);
        assert_eq!(buf, vec![1, b'u', 0, 0, 42, 0, 0, 0]);
    }

    #[test]
    fn test_dict() {
        let mut map = HashMap::new();
        map.insert(BasicValue::from("k"), Value::from(7u32));
        let d = Dictionary::typed("s", "u", map);
        let buf = enc("a{su}", vec![Value::Dictionary(d)]);
        // len, pad to 8, key "k", pad, value 7; the entry pad after the
        // length field is not counted in the length
        assert_eq!(
            buf,
            vec![12, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, b'k', 0, 0, 0, 7, 0, 0, 0]
        );
    }

    #[test]
    fn test_start_offset() {
        // Encoding at offset 6 must pad a u32 to offset 8.
        let buf = marshal(&parse("u").unwrap(), &[Value::from(1u32)], 6).unwrap();
        assert_eq!(buf, vec![0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn test_flexible_int64() {
        assert_eq!(enc("x", vec!["10".into()]), 10i64.to_le_bytes());
        assert_eq!(enc("x", vec!["-0x10".into()]), (-16i64).to_le_bytes());
        assert_eq!(enc("t", vec!["0xff".into()]), 255u64.to_le_bytes());
        assert_eq!(
            enc("t", vec![Value::from(u64::MAX)]),
            u64::MAX.to_le_bytes()
        );
        assert_eq!(enc("x", vec![Value::from(-2i32)]), (-2i64).to_le_bytes());
    }

    #[test]
    fn test_rejects() {
        assert_eq!(
            enc_err("d", vec![Value::Double(f64::NAN)]),
            MarshalError::NonFinite
        );
        assert_eq!(enc_err("s", vec!["a\0b".into()]), MarshalError::InteriorNul);
        assert!(matches!(
            enc_err(
                "o",
                vec![Value::Basic(BasicValue::ObjectPath(Path::new("no/slash")))]
            ),
            MarshalError::BadObjectPath(_)
        ));
        let long = Signature::new("y".repeat(300));
        assert!(matches!(
            enc_err("g", vec![Value::Basic(BasicValue::Signature(long))]),
            MarshalError::BadSignature(SignatureError::TooLong)
        ));
        assert_eq!(
            enc_err("x", vec![Value::from(1u64)]),
            MarshalError::SignMismatch
        );
        assert!(matches!(
            enc_err("t", vec![Value::from(-1i64)]),
            MarshalError::OutOfRange(_)
        ));
        assert!(matches!(
            enc_err("t", vec!["18446744073709551616".into()]),
            MarshalError::BadNumber(_)
        ));
        assert!(matches!(
            enc_err("u", vec![Value::from("nope")]),
            MarshalError::TypeMismatch { .. }
        ));
        assert!(matches!(
            enc_err("ai", vec![vec![1u32].to_value()]),
            MarshalError::TypeMismatch { .. }
        ));
    }

    #[test]
    fn test_failure_returns_no_bytes() {
        let r = marshal(
            &parse("yd").unwrap(),
            &[1u8.into(), Value::Double(f64::INFINITY)],
            0,
        );
        assert!(r.is_err());
    }
}
