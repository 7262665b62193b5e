//! Decoding wire bytes back into value trees.
//!
//! The decoder mirrors the marshaller's alignment walk over a parsed
//! signature.  Frames are little-endian only.  Nothing in here keeps a
//! reference to the input buffer after returning.

use thiserror::Error;

use crate::marshal::MAX_ARRAY_LEN;
use crate::signature::{self, SignatureError, Type};
use crate::types::{Array, BasicValue, Dictionary, Path, Signature, Struct, Value, Variant};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DemarshalError {
    #[error("ran out of bytes mid-value")]
    ShortRead,
    #[error("corrupted wire data")]
    Corrupted,
    #[error("string is not valid UTF-8")]
    BadUtf8,
    #[error("array length exceeds {MAX_ARRAY_LEN} bytes")]
    ElementTooBig,
    #[error(transparent)]
    BadSignature(#[from] SignatureError),
}

/// Knobs affecting how decoded values are represented.
#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
    /// Decode `ay` as one contiguous `Value::ByteArray` instead of an array
    /// of byte values.
    pub byte_arrays_as_buffers: bool,
    /// Kept for configuration parity with bindings whose native integers
    /// cannot carry the full 64-bit range.  Decoding here is always exact,
    /// so both settings behave identically.
    pub preserve_large_integers: bool,
}

impl Default for DecodeOptions {
    fn default() -> DecodeOptions {
        DecodeOptions {
            byte_arrays_as_buffers: true,
            preserve_large_integers: false,
        }
    }
}

/// Cursor over a byte buffer with alignment-aware readers.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// `start_offset` is the wire offset of `buf[start_offset]`; the cursor
    /// begins there and alignment is computed from absolute positions.
    pub fn new(buf: &'a [u8], start_offset: usize) -> Decoder<'a> {
        Decoder {
            buf,
            pos: start_offset,
        }
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn align(&mut self, alignment: usize) -> Result<(), DemarshalError> {
        let pad = (alignment - self.pos % alignment) % alignment;
        if self.remaining() < pad {
            return Err(DemarshalError::ShortRead);
        }
        self.pos += pad;
        Ok(())
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DemarshalError> {
        if self.remaining() < n {
            return Err(DemarshalError::ShortRead);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, DemarshalError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, DemarshalError> {
        self.align(2)?;
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, DemarshalError> {
        self.align(4)?;
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, DemarshalError> {
        self.align(8)?;
        let b = self.take(8)?;
        let mut arr = [0; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    /// u32-counted string with NUL terminator.
    pub fn get_string(&mut self) -> Result<String, DemarshalError> {
        let len = self.get_u32()? as usize;
        self.read_str_body(len)
    }

    /// u8-counted signature string with NUL terminator.
    pub fn get_signature(&mut self) -> Result<String, DemarshalError> {
        let len = self.get_u8()? as usize;
        self.read_str_body(len)
    }

    fn read_str_body(&mut self, len: usize) -> Result<String, DemarshalError> {
        let bytes = self.take(len)?.to_vec();
        if self.get_u8()? != 0 {
            return Err(DemarshalError::Corrupted);
        }
        String::from_utf8(bytes).map_err(|_| DemarshalError::BadUtf8)
    }
}

/// Decodes one value per type, in order, starting at `start_offset`.
pub fn demarshal_all(
    buf: &[u8],
    types: &[Type],
    start_offset: usize,
    opts: &DecodeOptions,
) -> Result<Vec<Value>, DemarshalError> {
    let mut dec = Decoder::new(buf, start_offset);
    let mut out = Vec::with_capacity(types.len());
    for ty in types {
        out.push(demarshal(&mut dec, ty, opts)?);
    }
    Ok(out)
}

pub fn demarshal(
    dec: &mut Decoder,
    ty: &Type,
    opts: &DecodeOptions,
) -> Result<Value, DemarshalError> {
    match ty {
        Type::Byte => Ok(Value::from(dec.get_u8()?)),
        Type::Boolean => match dec.get_u32()? {
            0 => Ok(Value::from(false)),
            1 => Ok(Value::from(true)),
            _ => Err(DemarshalError::Corrupted),
        },
        Type::Int16 => Ok(Value::from(dec.get_u16()? as i16)),
        Type::Uint16 => Ok(Value::from(dec.get_u16()?)),
        Type::Int32 => Ok(Value::from(dec.get_u32()? as i32)),
        Type::Uint32 => Ok(Value::from(dec.get_u32()?)),
        Type::Int64 => Ok(Value::from(dec.get_u64()? as i64)),
        Type::Uint64 => Ok(Value::from(dec.get_u64()?)),
        Type::Double => Ok(Value::Double(f64::from_bits(dec.get_u64()?))),
        Type::String => Ok(Value::from(dec.get_string()?)),
        Type::ObjectPath => Ok(Value::Basic(BasicValue::ObjectPath(Path(dec.get_string()?)))),
        Type::Signature => Ok(Value::Basic(BasicValue::Signature(Signature(
            dec.get_signature()?,
        )))),
        Type::UnixFd => Ok(Value::Basic(BasicValue::UnixFd(dec.get_u32()?))),
        Type::Variant => {
            let sig = dec.get_signature()?;
            // A variant carries exactly one complete type.
            let inner_types = signature::parse(&sig)?;
            if inner_types.len() != 1 {
                return Err(DemarshalError::Corrupted);
            }
            let object = demarshal(dec, &inner_types[0], opts)?;
            Ok(Value::Variant(Variant {
                object: Box::new(object),
                signature: Signature(sig),
            }))
        }
        Type::Array(elem) => demarshal_array(dec, elem, opts),
        Type::Struct(fields) => {
            dec.align(8)?;
            let mut objects = Vec::with_capacity(fields.len());
            for f in fields {
                objects.push(demarshal(dec, f, opts)?);
            }
            Ok(Value::Struct(Struct {
                objects,
                signature: Signature(ty.to_string()),
            }))
        }
        // Dict entries are consumed by the array arm.
        Type::DictEntry(..) => Err(DemarshalError::Corrupted),
    }
}

fn demarshal_array(
    dec: &mut Decoder,
    elem: &Type,
    opts: &DecodeOptions,
) -> Result<Value, DemarshalError> {
    let len = dec.get_u32()? as usize;
    if len > MAX_ARRAY_LEN {
        return Err(DemarshalError::ElementTooBig);
    }
    dec.align(elem.alignment())?;
    if dec.remaining() < len {
        return Err(DemarshalError::ShortRead);
    }
    let end = dec.offset() + len;

    if *elem == Type::Byte && opts.byte_arrays_as_buffers {
        // Contiguous slice, no per-byte boxing and no UTF-8 validation.
        return Ok(Value::ByteArray(dec.take(len)?.to_vec()));
    }

    if let Type::DictEntry(kty, vty) = elem {
        let mut map = std::collections::HashMap::new();
        while dec.offset() < end {
            dec.align(8)?;
            let key = match demarshal(dec, kty, opts)? {
                Value::Basic(b) => b,
                _ => return Err(DemarshalError::Corrupted),
            };
            let value = demarshal(dec, vty, opts)?;
            map.insert(key, value);
        }
        if dec.offset() != end {
            return Err(DemarshalError::Corrupted);
        }
        return Ok(Value::Dictionary(Dictionary {
            map,
            signature: Signature(format!("a{}", elem)),
        }));
    }

    let mut objects = Vec::new();
    while dec.offset() < end {
        objects.push(demarshal(dec, elem, opts)?);
    }
    if dec.offset() != end {
        return Err(DemarshalError::Corrupted);
    }
    Ok(Value::Array(Array {
        objects,
        signature: Signature(format!("a{}", elem)),
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::marshal::marshal;
    use crate::signature::parse;
    use crate::types::ToValue;
    use std::collections::HashMap;

    fn roundtrip(sig: &str, values: Vec<Value>) -> Vec<Value> {
        let buf = marshal(&parse(sig).unwrap(), &values, 0).unwrap();
        demarshal_all(&buf, &parse(sig).unwrap(), 0, &DecodeOptions::default()).unwrap()
    }

    #[test]
    fn test_demarshal_u32() {
        let buf = 16u32.to_le_bytes();
        let mut dec = Decoder::new(&buf, 0);
        let v = demarshal(&mut dec, &Type::Uint32, &DecodeOptions::default()).unwrap();
        assert_eq!(v, Value::from(16u32));
        assert!(dec.at_end());
    }

    #[test]
    fn test_demarshal_u32_offset() {
        let mut buf = vec![0xaa, 0, 0, 0];
        buf.extend_from_slice(&16u32.to_le_bytes());
        let mut dec = Decoder::new(&buf, 1);
        let v = demarshal(&mut dec, &Type::Uint32, &DecodeOptions::default()).unwrap();
        assert_eq!(v, Value::from(16u32));
        assert!(dec.at_end());
    }

    #[test]
    fn test_string_roundtrip() {
        assert_eq!(roundtrip("s", vec!["swalter".into()]), vec![Value::from("swalter")]);
    }

    #[test]
    fn test_string_rejects() {
        // Missing NUL terminator.
        let buf = b"\x02\x00\x00\x00ab!";
        let mut dec = Decoder::new(buf, 0);
        assert_eq!(
            demarshal(&mut dec, &Type::String, &DecodeOptions::default()).unwrap_err(),
            DemarshalError::Corrupted
        );

        // Invalid UTF-8.
        let buf = b"\x02\x00\x00\x00\xff\xfe\x00";
        let mut dec = Decoder::new(buf, 0);
        assert_eq!(
            demarshal(&mut dec, &Type::String, &DecodeOptions::default()).unwrap_err(),
            DemarshalError::BadUtf8
        );
    }

    #[test]
    fn test_bool_rejects() {
        let buf = 2u32.to_le_bytes();
        let mut dec = Decoder::new(&buf, 0);
        assert_eq!(
            demarshal(&mut dec, &Type::Boolean, &DecodeOptions::default()).unwrap_err(),
            DemarshalError::Corrupted
        );
    }

    #[test]
    fn test_array_roundtrip() {
        let vals = roundtrip("au", vec![vec![1u32, 2, 3].to_value()]);
        match &vals[0] {
            Value::Array(a) => {
                assert_eq!(
                    a.objects,
                    vec![Value::from(1u32), Value::from(2u32), Value::from(3u32)]
                );
                assert_eq!(a.signature.0, "au");
            }
            other => panic!("wanted array, got {:?}", other),
        }
    }

    #[test]
    fn test_byte_array_modes() {
        let buf = marshal(
            &parse("ay").unwrap(),
            &[Value::ByteArray(vec![1, 2, 3])],
            0,
        )
        .unwrap();

        let as_buffer =
            demarshal_all(&buf, &parse("ay").unwrap(), 0, &DecodeOptions::default()).unwrap();
        assert_eq!(as_buffer, vec![Value::ByteArray(vec![1, 2, 3])]);

        let opts = DecodeOptions {
            byte_arrays_as_buffers: false,
            ..Default::default()
        };
        let as_items = demarshal_all(&buf, &parse("ay").unwrap(), 0, &opts).unwrap();
        match &as_items[0] {
            Value::Array(a) => assert_eq!(
                a.objects,
                vec![Value::from(1u8), Value::from(2u8), Value::from(3u8)]
            ),
            other => panic!("wanted array, got {:?}", other),
        }
    }

    #[test]
    fn test_array_len_rejects() {
        // Length claims more than the buffer holds.
        let mut buf = Vec::new();
        buf.extend_from_slice(&100u32.to_le_bytes());
        buf.extend_from_slice(&[0; 8]);
        let mut dec = Decoder::new(&buf, 0);
        assert_eq!(
            demarshal(
                &mut dec,
                &Type::Array(Box::new(Type::Byte)),
                &DecodeOptions::default()
            )
            .unwrap_err(),
            DemarshalError::ShortRead
        );

        // Length beyond the protocol cap.
        let mut buf = Vec::new();
        buf.extend_from_slice(&(1u32 << 27).to_le_bytes());
        let mut dec = Decoder::new(&buf, 0);
        assert_eq!(
            demarshal(
                &mut dec,
                &Type::Array(Box::new(Type::Byte)),
                &DecodeOptions::default()
            )
            .unwrap_err(),
            DemarshalError::ElementTooBig
        );
    }

    #[test]
    fn test_struct_roundtrip() {
        let s = crate::types::Struct::new(vec!["a".into(), "b".into()]);
        let vals = roundtrip("(ss)", vec![Value::Struct(s.clone())]);
        assert_eq!(vals, vec![Value::Struct(s)]);
    }

    #[test]
    fn test_variant_single_type_only() {
        // Variant signature "uu" has two top-level types.
        let buf = b"\x02uu\x00\x01\x00\x00\x00";
        let mut dec = Decoder::new(buf, 0);
        assert_eq!(
            demarshal(&mut dec, &Type::Variant, &DecodeOptions::default()).unwrap_err(),
            DemarshalError::Corrupted
        );
    }

    #[test]
    fn test_dict_with_variants_roundtrip() {
        let mut map = HashMap::new();
        map.insert(
            BasicValue::from("name"),
            Value::Variant(Variant::new("John".into(), "s")),
        );
        map.insert(
            BasicValue::from("age"),
            Value::Variant(Variant::new(Value::from(30i32), "i")),
        );
        let d = Dictionary::typed("s", "v", map);
        let vals = roundtrip("a{sv}", vec![Value::Dictionary(d.clone())]);
        assert_eq!(vals, vec![Value::Dictionary(d)]);
    }

    #[test]
    fn test_int64_decoding_is_exact() {
        for opts in [
            DecodeOptions::default(),
            DecodeOptions {
                preserve_large_integers: true,
                ..Default::default()
            },
        ] {
            let buf = marshal(
                &parse("xt").unwrap(),
                &[Value::from(i64::MIN), Value::from(u64::MAX)],
                0,
            )
            .unwrap();
            let vals = demarshal_all(&buf, &parse("xt").unwrap(), 0, &opts).unwrap();
            assert_eq!(vals, vec![Value::from(i64::MIN), Value::from(u64::MAX)]);
        }
    }
}
