//! The D-Bus value model: a recursive tagged union mirroring the wire types.
//!
//! `BasicValue` covers the fixed-size and string-like types that may key a
//! dict entry.  `Value` adds the containers.  Marshalling is directed by a
//! parsed signature, not by the value tag, so these types carry just enough
//! signature information to rebuild one (arrays and dictionaries remember
//! their element signature so empty containers stay typed).

use std::collections::HashMap;
use std::fmt;

/// A D-Bus object path, e.g. `/org/freedesktop/DBus`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path(pub String);

impl Path {
    pub fn new<S: Into<String>>(s: S) -> Path {
        Path(s.into())
    }

    /// `/`, or slash-prefixed segments of `[A-Za-z0-9_]`, no trailing slash.
    pub fn is_valid(&self) -> bool {
        let s = self.0.as_str();
        if s == "/" {
            return true;
        }
        if !s.starts_with('/') || s.ends_with('/') {
            return false;
        }
        s[1..].split('/').all(|seg| {
            !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
        })
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Path {
        Path(s.to_owned())
    }
}

/// A D-Bus type signature in wire form, e.g. `a{sv}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Signature(pub String);

impl Signature {
    pub fn new<S: Into<String>>(s: S) -> Signature {
        Signature(s.into())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The types that can appear as a dict-entry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BasicValue {
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    String(String),
    ObjectPath(Path),
    Signature(Signature),
    UnixFd(u32),
}

impl BasicValue {
    pub fn signature(&self) -> &'static str {
        match self {
            BasicValue::Byte(_) => "y",
            BasicValue::Boolean(_) => "b",
            BasicValue::Int16(_) => "n",
            BasicValue::Uint16(_) => "q",
            BasicValue::Int32(_) => "i",
            BasicValue::Uint32(_) => "u",
            BasicValue::Int64(_) => "x",
            BasicValue::Uint64(_) => "t",
            BasicValue::String(_) => "s",
            BasicValue::ObjectPath(_) => "o",
            BasicValue::Signature(_) => "g",
            BasicValue::UnixFd(_) => "h",
        }
    }

    /// Builds an `x` value from 32-bit halves, for callers that carry 64-bit
    /// quantities split the way some bindings do.
    pub fn int64_from_halves(low: u32, high: u32) -> BasicValue {
        BasicValue::Int64((((high as u64) << 32) | low as u64) as i64)
    }

    pub fn uint64_from_halves(low: u32, high: u32) -> BasicValue {
        BasicValue::Uint64(((high as u64) << 32) | low as u64)
    }
}

/// An ordered sequence of values of one element type.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Array {
    pub objects: Vec<Value>,
    /// Full array signature, e.g. `au`.
    pub signature: Signature,
}

impl Array {
    pub fn new(objects: Vec<Value>, signature: Signature) -> Array {
        Array { objects, signature }
    }

    /// Convenience constructor taking the element signature.
    pub fn typed<S: Into<String>>(element_sig: S, objects: Vec<Value>) -> Array {
        Array {
            objects,
            signature: Signature(format!("a{}", element_sig.into())),
        }
    }
}

/// A tuple of heterogeneous values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Struct {
    pub objects: Vec<Value>,
    /// Full struct signature, e.g. `(su)`.
    pub signature: Signature,
}

impl Struct {
    pub fn new(objects: Vec<Value>) -> Struct {
        let mut sig = String::from("(");
        for v in &objects {
            sig.push_str(&v.signature());
        }
        sig.push(')');
        Struct {
            objects,
            signature: Signature(sig),
        }
    }
}

/// A map with basic-typed keys.  On the wire this is an array of dict
/// entries.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dictionary {
    pub map: HashMap<BasicValue, Value>,
    /// Full signature, e.g. `a{sv}`.
    pub signature: Signature,
}

impl Dictionary {
    pub fn new(map: HashMap<BasicValue, Value>, signature: Signature) -> Dictionary {
        Dictionary { map, signature }
    }

    /// Convenience constructor taking the key and value signatures.
    pub fn typed<K, V>(key_sig: K, value_sig: V, map: HashMap<BasicValue, Value>) -> Dictionary
    where
        K: Into<String>,
        V: Into<String>,
    {
        Dictionary {
            map,
            signature: Signature(format!("a{{{}{}}}", key_sig.into(), value_sig.into())),
        }
    }
}

/// A value carrying its own signature.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub object: Box<Value>,
    pub signature: Signature,
}

impl Variant {
    pub fn new<S: Into<String>>(object: Value, signature: S) -> Variant {
        Variant {
            object: Box::new(object),
            signature: Signature(signature.into()),
        }
    }
}

/// Any D-Bus value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Basic(BasicValue),
    Double(f64),
    Array(Array),
    /// A contiguous `ay`, kept as raw bytes rather than boxed elements.
    ByteArray(Vec<u8>),
    Struct(Struct),
    Variant(Variant),
    Dictionary(Dictionary),
}

impl Value {
    pub fn signature(&self) -> String {
        match self {
            Value::Basic(b) => b.signature().to_owned(),
            Value::Double(_) => "d".to_owned(),
            Value::Array(a) => a.signature.0.clone(),
            Value::ByteArray(_) => "ay".to_owned(),
            Value::Struct(s) => s.signature.0.clone(),
            Value::Variant(_) => "v".to_owned(),
            Value::Dictionary(d) => d.signature.0.clone(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Basic(BasicValue::String(s)) => Some(s),
            Value::Basic(BasicValue::ObjectPath(p)) => Some(&p.0),
            Value::Basic(BasicValue::Signature(s)) => Some(&s.0),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Basic(BasicValue::Uint32(x)) => Some(*x),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            Value::Basic(BasicValue::Byte(x)) => Some(*x),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Basic(BasicValue::Boolean(x)) => Some(*x),
            _ => None,
        }
    }

    /// Peels one layer of variant off, if present.
    pub fn unwrap_variant(self) -> Value {
        match self {
            Value::Variant(v) => *v.object,
            other => other,
        }
    }
}

impl From<BasicValue> for Value {
    fn from(b: BasicValue) -> Value {
        Value::Basic(b)
    }
}

macro_rules! basic_from {
    ($t:ty, $var:ident) => {
        impl From<$t> for BasicValue {
            fn from(x: $t) -> BasicValue {
                BasicValue::$var(x)
            }
        }
        impl From<$t> for Value {
            fn from(x: $t) -> Value {
                Value::Basic(BasicValue::$var(x))
            }
        }
    };
}

basic_from!(u8, Byte);
basic_from!(bool, Boolean);
basic_from!(i16, Int16);
basic_from!(u16, Uint16);
basic_from!(i32, Int32);
basic_from!(u32, Uint32);
basic_from!(i64, Int64);
basic_from!(u64, Uint64);
basic_from!(Path, ObjectPath);
basic_from!(Signature, Signature);

impl From<f64> for Value {
    fn from(x: f64) -> Value {
        Value::Double(x)
    }
}

impl From<&str> for BasicValue {
    fn from(s: &str) -> BasicValue {
        BasicValue::String(s.to_owned())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Basic(BasicValue::String(s.to_owned()))
    }
}

impl From<String> for BasicValue {
    fn from(s: String) -> BasicValue {
        BasicValue::String(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Basic(BasicValue::String(s))
    }
}

impl From<Variant> for Value {
    fn from(v: Variant) -> Value {
        Value::Variant(v)
    }
}

/// The static signature of a Rust type, used where a value is not at hand
/// (empty containers in particular).
pub trait TypeSig {
    fn type_sig() -> String;
}

/// Conversion into a `Value` for message building.
pub trait ToValue {
    fn to_value(&self) -> Value;
    fn value_sig(&self) -> String;
}

/// Marker for types usable as dict-entry keys.
pub trait ToBasic: ToValue {
    fn to_basic(&self) -> BasicValue;
}

macro_rules! to_value_basic {
    ($t:ty, $var:ident, $code:expr) => {
        impl TypeSig for $t {
            fn type_sig() -> String {
                $code.to_owned()
            }
        }
        impl ToValue for $t {
            fn to_value(&self) -> Value {
                Value::Basic(BasicValue::$var(self.clone()))
            }
            fn value_sig(&self) -> String {
                $code.to_owned()
            }
        }
        impl ToBasic for $t {
            fn to_basic(&self) -> BasicValue {
                BasicValue::$var(self.clone())
            }
        }
    };
}

to_value_basic!(u8, Byte, "y");
to_value_basic!(bool, Boolean, "b");
to_value_basic!(i16, Int16, "n");
to_value_basic!(u16, Uint16, "q");
to_value_basic!(i32, Int32, "i");
to_value_basic!(u32, Uint32, "u");
to_value_basic!(i64, Int64, "x");
to_value_basic!(u64, Uint64, "t");
to_value_basic!(String, String, "s");
to_value_basic!(Path, ObjectPath, "o");
to_value_basic!(Signature, Signature, "g");

impl TypeSig for f64 {
    fn type_sig() -> String {
        "d".to_owned()
    }
}

impl ToValue for f64 {
    fn to_value(&self) -> Value {
        Value::Double(*self)
    }
    fn value_sig(&self) -> String {
        "d".to_owned()
    }
}

impl TypeSig for &str {
    fn type_sig() -> String {
        "s".to_owned()
    }
}

impl ToValue for &str {
    fn to_value(&self) -> Value {
        Value::from(*self)
    }
    fn value_sig(&self) -> String {
        "s".to_owned()
    }
}

impl ToBasic for &str {
    fn to_basic(&self) -> BasicValue {
        BasicValue::String((*self).to_owned())
    }
}

impl<T: ToValue + TypeSig> TypeSig for Vec<T> {
    fn type_sig() -> String {
        format!("a{}", T::type_sig())
    }
}

impl<T: ToValue + TypeSig> ToValue for Vec<T> {
    fn to_value(&self) -> Value {
        Value::Array(Array::new(
            self.iter().map(ToValue::to_value).collect(),
            Signature(Self::type_sig()),
        ))
    }
    fn value_sig(&self) -> String {
        Self::type_sig()
    }
}

impl<K, V> TypeSig for HashMap<K, V>
where
    K: ToBasic + TypeSig + Eq + std::hash::Hash,
    V: ToValue + TypeSig,
{
    fn type_sig() -> String {
        format!("a{{{}{}}}", K::type_sig(), V::type_sig())
    }
}

impl<K, V> ToValue for HashMap<K, V>
where
    K: ToBasic + TypeSig + Eq + std::hash::Hash,
    V: ToValue + TypeSig,
{
    fn to_value(&self) -> Value {
        let map = self
            .iter()
            .map(|(k, v)| (k.to_basic(), v.to_value()))
            .collect();
        Value::Dictionary(Dictionary::new(map, Signature(Self::type_sig())))
    }
    fn value_sig(&self) -> String {
        Self::type_sig()
    }
}

impl ToValue for Variant {
    fn to_value(&self) -> Value {
        Value::Variant(self.clone())
    }
    fn value_sig(&self) -> String {
        "v".to_owned()
    }
}

impl ToValue for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }
    fn value_sig(&self) -> String {
        self.signature()
    }
}
