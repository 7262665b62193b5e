//! Creating, encoding and decoding complete D-Bus messages.
//!
//! A message is a 12-byte fixed header, an `a(yv)` header-field array, pad
//! to 8 bytes, then the body.  The codec here produces one contiguous byte
//! vector per message and parses exactly one message out of a frame.

use thiserror::Error;

use crate::demarshal::{self, DecodeOptions, Decoder, DemarshalError};
use crate::marshal::{self, MarshalError};
use crate::signature::{self, SignatureError};
use crate::types::{Array, Path, Signature, Struct, ToValue, Value, Variant};

pub const PROTOCOL_VERSION: u8 = 1;

pub const FLAG_NO_REPLY_EXPECTED: u8 = 0x1;
pub const FLAG_NO_AUTO_START: u8 = 0x2;

/// Fixed part of every message: endian flag, type, flags, version, body
/// length, serial.
pub const FIXED_HEADER_LEN: usize = 12;
/// Bytes needed before the full frame length is known.
pub const MIN_FRAME_PREFIX: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    fn from_u8(x: u8) -> Option<MessageType> {
        match x {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HeaderField {
    Path = 1,
    Interface = 2,
    Member = 3,
    ErrorName = 4,
    ReplySerial = 5,
    Destination = 6,
    Sender = 7,
    Signature = 8,
}

impl HeaderField {
    pub fn code(self) -> u8 {
        self as u8
    }

    fn from_u8(x: u8) -> Option<HeaderField> {
        match x {
            1 => Some(HeaderField::Path),
            2 => Some(HeaderField::Interface),
            3 => Some(HeaderField::Member),
            4 => Some(HeaderField::ErrorName),
            5 => Some(HeaderField::ReplySerial),
            6 => Some(HeaderField::Destination),
            7 => Some(HeaderField::Sender),
            8 => Some(HeaderField::Signature),
            _ => None,
        }
    }

    /// Declared signature of this field's variant payload.
    pub fn value_signature(self) -> &'static str {
        match self {
            HeaderField::Path => "o",
            HeaderField::ReplySerial => "u",
            HeaderField::Signature => "g",
            _ => "s",
        }
    }
}

/// A D-Bus error identified by its fully-qualified name, with the first
/// string of the error body when one was sent.
#[derive(Debug, Clone, PartialEq)]
pub struct DBusError {
    pub name: String,
    pub message: Option<String>,
}

impl std::error::Error for DBusError {}

impl DBusError {
    pub fn new<N: Into<String>, M: Into<String>>(name: N, message: M) -> DBusError {
        DBusError {
            name: name.into(),
            message: Some(message.into()),
        }
    }
}

impl std::fmt::Display for DBusError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.message {
            Some(m) => write!(f, "{}: {}", self.name, m),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MessageError {
    #[error("frame shorter than its declared length")]
    ShortRead,
    #[error("only little-endian frames are supported")]
    BigEndian,
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("message serial must be nonzero")]
    ZeroSerial,
    #[error("required header field {0:?} missing")]
    MissingHeader(HeaderField),
    #[error("header field {0:?} carries the wrong type")]
    BadHeaderValue(HeaderField),
    #[error("body does not match its declared signature")]
    BodyMismatch,
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Marshal(#[from] MarshalError),
    #[error(transparent)]
    Demarshal(#[from] DemarshalError),
}

/// A D-Bus message in decoded form.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    pub flags: u8,
    pub serial: u32,
    /// Header fields in declared (wire) order.
    pub headers: Vec<(HeaderField, Value)>,
    pub body: Vec<Value>,
}

impl Message {
    fn with_type(message_type: MessageType) -> Message {
        Message {
            message_type,
            flags: 0,
            serial: 0,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Appends one argument to the body, growing the signature header.
    /// Calls chain, see the builder functions below.
    pub fn add_arg<T: ToValue>(mut self, arg: &T) -> Message {
        let sig = arg.value_sig();
        match self
            .headers
            .iter()
            .position(|(f, _)| *f == HeaderField::Signature)
        {
            Some(idx) => {
                if let (_, Value::Basic(crate::types::BasicValue::Signature(s))) =
                    &mut self.headers[idx]
                {
                    s.0.push_str(&sig);
                }
            }
            None => self.headers.push((
                HeaderField::Signature,
                Value::from(Signature::new(sig)),
            )),
        }
        self.body.push(arg.to_value());
        self
    }

    pub fn add_header(mut self, field: HeaderField, value: Value) -> Message {
        self.headers.push((field, value));
        self
    }

    pub fn with_flags(mut self, flags: u8) -> Message {
        self.flags |= flags;
        self
    }

    pub fn header(&self, field: HeaderField) -> Option<&Value> {
        self.headers
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, v)| v)
    }

    pub fn header_str(&self, field: HeaderField) -> Option<&str> {
        self.header(field).and_then(Value::as_str)
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.header(HeaderField::ReplySerial).and_then(Value::as_u32)
    }

    pub fn body_signature(&self) -> Option<&str> {
        self.header_str(HeaderField::Signature)
    }

    pub fn no_reply_expected(&self) -> bool {
        self.flags & FLAG_NO_REPLY_EXPECTED != 0
    }

    /// Extracts the error identity from an error message.
    pub fn to_dbus_error(&self) -> DBusError {
        DBusError {
            name: self
                .header_str(HeaderField::ErrorName)
                .unwrap_or("org.freedesktop.DBus.Error.Failed")
                .to_owned(),
            message: self.body.first().and_then(Value::as_str).map(str::to_owned),
        }
    }

    /// Checks the per-type required header fields.
    pub fn validate(&self) -> Result<(), MessageError> {
        let require = |f: HeaderField| -> Result<(), MessageError> {
            if self.header(f).is_none() {
                Err(MessageError::MissingHeader(f))
            } else {
                Ok(())
            }
        };
        match self.message_type {
            MessageType::MethodCall => {
                require(HeaderField::Path)?;
                require(HeaderField::Member)
            }
            MessageType::MethodReturn => require(HeaderField::ReplySerial),
            MessageType::Error => {
                require(HeaderField::ErrorName)?;
                require(HeaderField::ReplySerial)
            }
            MessageType::Signal => {
                require(HeaderField::Path)?;
                require(HeaderField::Interface)?;
                require(HeaderField::Member)
            }
        }
    }
}

/// Creates a method call.  Arguments are added with [`Message::add_arg`].
pub fn create_method_call(dest: &str, path: &str, iface: &str, method: &str) -> Message {
    Message::with_type(MessageType::MethodCall)
        .add_header(HeaderField::Destination, Value::from(dest))
        .add_header(HeaderField::Path, Value::from(Path::new(path)))
        .add_header(HeaderField::Interface, Value::from(iface))
        .add_header(HeaderField::Member, Value::from(method))
}

/// Creates a method return.  Return values are added with [`Message::add_arg`].
pub fn create_method_return(reply_serial: u32) -> Message {
    Message::with_type(MessageType::MethodReturn)
        .add_header(HeaderField::ReplySerial, Value::from(reply_serial))
}

/// Creates an error reply.  A human-readable message can be added with
/// [`Message::add_arg`].
pub fn create_error(error_name: &str, reply_serial: u32) -> Message {
    Message::with_type(MessageType::Error)
        .add_header(HeaderField::ReplySerial, Value::from(reply_serial))
        .add_header(HeaderField::ErrorName, Value::from(error_name))
}

/// Creates a signal.  Arguments are added with [`Message::add_arg`].
pub fn create_signal(path: &str, interface: &str, member: &str) -> Message {
    Message::with_type(MessageType::Signal)
        .add_header(HeaderField::Path, Value::from(Path::new(path)))
        .add_header(HeaderField::Interface, Value::from(interface))
        .add_header(HeaderField::Member, Value::from(member))
}

/// Encodes a message into one contiguous frame.
pub fn marshal_message(msg: &Message) -> Result<Vec<u8>, MessageError> {
    msg.validate()?;
    if msg.serial == 0 {
        return Err(MessageError::ZeroSerial);
    }

    // The body begins at an 8-aligned offset, so encoding from zero keeps
    // the alignment walk identical.
    let body_types = match msg.body_signature() {
        Some(sig) => signature::parse(sig)?,
        None => Vec::new(),
    };
    if body_types.len() != msg.body.len() {
        return Err(MessageError::BodyMismatch);
    }
    let body = marshal::marshal(&body_types, &msg.body, 0)?;

    let mut enc = marshal::Encoder::new(0);
    enc.put_u8(b'l');
    enc.put_u8(msg.message_type as u8);
    enc.put_u8(msg.flags);
    enc.put_u8(PROTOCOL_VERSION);
    enc.put_u32(body.len() as u32);
    enc.put_u32(msg.serial);
    let mut frame = enc.into_vec();

    let entries: Vec<Value> = msg
        .headers
        .iter()
        .map(|(field, value)| {
            Value::Struct(Struct {
                objects: vec![
                    Value::from(field.code()),
                    Value::Variant(Variant::new(value.clone(), field.value_signature())),
                ],
                signature: Signature::new("(yv)"),
            })
        })
        .collect();
    let header_array = Value::Array(Array::new(entries, Signature::new("a(yv)")));
    let header_type = signature::parse("a(yv)")?;
    let header_bytes = marshal::marshal(&header_type, &[header_array], FIXED_HEADER_LEN)?;
    frame.extend_from_slice(&header_bytes);

    while frame.len() % 8 != 0 {
        frame.push(0);
    }
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Computes the full frame length from the first 16 bytes.
pub fn frame_length(prefix: &[u8]) -> Result<usize, MessageError> {
    if prefix.len() < MIN_FRAME_PREFIX {
        return Err(MessageError::ShortRead);
    }
    match prefix[0] {
        b'l' => {}
        b'B' => return Err(MessageError::BigEndian),
        _ => return Err(MessageError::Demarshal(DemarshalError::Corrupted)),
    }
    let body_len = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as usize;
    let header_len = u32::from_le_bytes([prefix[12], prefix[13], prefix[14], prefix[15]]) as usize;
    let body_start = (MIN_FRAME_PREFIX + header_len + 7) & !7;
    Ok(body_start + body_len)
}

/// Decodes one complete frame.
pub fn unmarshal_message(buf: &[u8], opts: &DecodeOptions) -> Result<Message, MessageError> {
    let total = frame_length(buf)?;
    if buf.len() < total {
        return Err(MessageError::ShortRead);
    }
    if buf[3] != PROTOCOL_VERSION {
        return Err(MessageError::BadVersion(buf[3]));
    }
    let message_type =
        MessageType::from_u8(buf[1]).ok_or(MessageError::UnknownMessageType(buf[1]))?;
    let flags = buf[2];
    let serial = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
    if serial == 0 {
        return Err(MessageError::ZeroSerial);
    }

    // Header field array.
    let header_len =
        u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]) as usize;
    let body_start = (MIN_FRAME_PREFIX + header_len + 7) & !7;
    let header_type = signature::parse("a(yv)")?;
    let raw_headers = demarshal::demarshal_all(
        &buf[..MIN_FRAME_PREFIX + header_len],
        &header_type,
        FIXED_HEADER_LEN,
        opts,
    )?;
    let mut headers = Vec::new();
    if let Some(Value::Array(arr)) = raw_headers.into_iter().next() {
        for entry in arr.objects {
            let s = match entry {
                Value::Struct(s) if s.objects.len() == 2 => s,
                _ => return Err(MessageError::Demarshal(DemarshalError::Corrupted)),
            };
            let code = s.objects[0]
                .as_u8()
                .ok_or(MessageError::Demarshal(DemarshalError::Corrupted))?;
            // Unknown field codes are skipped for forward compatibility.
            let field = match HeaderField::from_u8(code) {
                Some(f) => f,
                None => continue,
            };
            let variant = match &s.objects[1] {
                Value::Variant(v) => v,
                _ => return Err(MessageError::Demarshal(DemarshalError::Corrupted)),
            };
            if variant.signature.0 != field.value_signature() {
                return Err(MessageError::BadHeaderValue(field));
            }
            headers.push((field, (*variant.object).clone()));
        }
    }

    let mut msg = Message {
        message_type,
        flags,
        serial,
        headers,
        body: Vec::new(),
    };

    let body_len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    if body_len > 0 {
        let sig = msg
            .body_signature()
            .ok_or(MessageError::MissingHeader(HeaderField::Signature))?
            .to_owned();
        let body_types = signature::parse(&sig)?;
        let mut dec = Decoder::new(&buf[..body_start + body_len], body_start);
        let mut body = Vec::with_capacity(body_types.len());
        for ty in &body_types {
            body.push(demarshal::demarshal(&mut dec, ty, opts)?);
        }
        if dec.offset() != body_start + body_len {
            return Err(MessageError::BodyMismatch);
        }
        msg.body = body;
    }

    msg.validate()?;
    Ok(msg)
}
