//! D-Bus type signatures parsed into trees.
//!
//! A signature string is a sequence of complete types.  The marshaller and
//! unmarshaller walk the parsed tree rather than the raw string, so
//! malformed signatures are rejected once, up front.

use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

use thiserror::Error;

/// Maximum container nesting depth.
pub const MAX_NESTING: usize = 32;
/// Maximum signature length in bytes.
pub const MAX_LENGTH: usize = 255;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("unknown type code {0:?}")]
    UnknownType(char),
    #[error("signature ended inside an incomplete type")]
    UnexpectedEnd,
    #[error("container nesting deeper than {MAX_NESTING}")]
    MaxNesting,
    #[error("dict entry key not basic, or dict entry outside an array")]
    BadDictEntry,
    #[error("signature longer than {MAX_LENGTH} bytes")]
    TooLong,
}

/// One complete type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Byte,
    Boolean,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Double,
    String,
    ObjectPath,
    Signature,
    UnixFd,
    Variant,
    Array(Box<Type>),
    Struct(Vec<Type>),
    DictEntry(Box<Type>, Box<Type>),
}

impl Type {
    /// Natural wire alignment of this type.
    pub fn alignment(&self) -> usize {
        match self {
            Type::Byte | Type::Signature | Type::Variant => 1,
            Type::Int16 | Type::Uint16 => 2,
            Type::Boolean
            | Type::Int32
            | Type::Uint32
            | Type::String
            | Type::ObjectPath
            | Type::UnixFd
            | Type::Array(_) => 4,
            Type::Int64 | Type::Uint64 | Type::Double | Type::Struct(_) | Type::DictEntry(..) => 8,
        }
    }

    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            Type::Array(_) | Type::Struct(_) | Type::DictEntry(..) | Type::Variant
        )
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Type::Byte => f.write_str("y"),
            Type::Boolean => f.write_str("b"),
            Type::Int16 => f.write_str("n"),
            Type::Uint16 => f.write_str("q"),
            Type::Int32 => f.write_str("i"),
            Type::Uint32 => f.write_str("u"),
            Type::Int64 => f.write_str("x"),
            Type::Uint64 => f.write_str("t"),
            Type::Double => f.write_str("d"),
            Type::String => f.write_str("s"),
            Type::ObjectPath => f.write_str("o"),
            Type::Signature => f.write_str("g"),
            Type::UnixFd => f.write_str("h"),
            Type::Variant => f.write_str("v"),
            Type::Array(t) => write!(f, "a{}", t),
            Type::Struct(fields) => {
                f.write_str("(")?;
                for t in fields {
                    write!(f, "{}", t)?;
                }
                f.write_str(")")
            }
            Type::DictEntry(k, v) => write!(f, "{{{}{}}}", k, v),
        }
    }
}

/// Renders a sequence of types back into signature form.
pub fn render(types: &[Type]) -> String {
    let mut s = String::new();
    for t in types {
        s.push_str(&t.to_string());
    }
    s
}

/// Parses a signature string into its sequence of complete types.
pub fn parse(sig: &str) -> Result<Vec<Type>, SignatureError> {
    if sig.len() > MAX_LENGTH {
        return Err(SignatureError::TooLong);
    }
    let mut chars = sig.chars().peekable();
    let mut types = Vec::new();
    while chars.peek().is_some() {
        types.push(parse_one(&mut chars, 0, false)?);
    }
    Ok(types)
}

/// Parses a signature that must contain exactly one complete type, as
/// required inside a variant.
pub fn parse_single(sig: &str) -> Result<Type, SignatureError> {
    let mut types = parse(sig)?;
    if types.len() != 1 {
        return Err(SignatureError::UnexpectedEnd);
    }
    Ok(types.remove(0))
}

fn parse_one(
    chars: &mut Peekable<Chars>,
    depth: usize,
    in_array: bool,
) -> Result<Type, SignatureError> {
    let c = chars.next().ok_or(SignatureError::UnexpectedEnd)?;
    match c {
        'y' => Ok(Type::Byte),
        'b' => Ok(Type::Boolean),
        'n' => Ok(Type::Int16),
        'q' => Ok(Type::Uint16),
        'i' => Ok(Type::Int32),
        'u' => Ok(Type::Uint32),
        'x' => Ok(Type::Int64),
        't' => Ok(Type::Uint64),
        'd' => Ok(Type::Double),
        's' => Ok(Type::String),
        'o' => Ok(Type::ObjectPath),
        'g' => Ok(Type::Signature),
        'h' => Ok(Type::UnixFd),
        'v' => Ok(Type::Variant),
        'a' => {
            if depth + 1 > MAX_NESTING {
                return Err(SignatureError::MaxNesting);
            }
            let elem = parse_one(chars, depth + 1, true)?;
            Ok(Type::Array(Box::new(elem)))
        }
        '(' => {
            if depth + 1 > MAX_NESTING {
                return Err(SignatureError::MaxNesting);
            }
            let mut fields = Vec::new();
            loop {
                match chars.peek() {
                    None => return Err(SignatureError::UnexpectedEnd),
                    Some(')') => {
                        chars.next();
                        break;
                    }
                    Some(_) => fields.push(parse_one(chars, depth + 1, false)?),
                }
            }
            Ok(Type::Struct(fields))
        }
        '{' => {
            // A dict entry is only meaningful as an array element.
            if !in_array {
                return Err(SignatureError::BadDictEntry);
            }
            if depth + 1 > MAX_NESTING {
                return Err(SignatureError::MaxNesting);
            }
            let key = parse_one(chars, depth + 1, false)?;
            if !key.is_basic() {
                return Err(SignatureError::BadDictEntry);
            }
            let value = parse_one(chars, depth + 1, false)?;
            match chars.next() {
                Some('}') => Ok(Type::DictEntry(Box::new(key), Box::new(value))),
                Some(_) => Err(SignatureError::BadDictEntry),
                None => Err(SignatureError::UnexpectedEnd),
            }
        }
        other => Err(SignatureError::UnknownType(other)),
    }
}
