//! Parsing introspection documents.
//!
//! Introspection XML is a small, regular dialect: a `<node>` with
//! `<interface>` children holding `<method>`, `<property>` and `<signal>`
//! elements.  The reader below covers exactly that dialect (prolog,
//! doctype, comments, attributes with entity references, self-closing
//! tags) without pulling in a general XML stack.  The parsed result uses
//! the same table types the service side exports, so a proxy sees what a
//! peer would declare.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::service::{Access, InterfaceDescription, MethodSpec, PropertySpec, SignalSpec};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum IntrospectError {
    #[error("document ended inside an element")]
    UnexpectedEof,
    #[error("malformed XML near byte {0}")]
    Malformed(usize),
    #[error("mismatched closing tag {0:?}")]
    MismatchedTag(String),
    #[error("unknown entity reference")]
    BadEntity,
    #[error("root element must be a node")]
    NotANode,
    #[error("node tree recurses too deeply")]
    TooDeep,
}

/// The introspected shape of one object: its interfaces and child nodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInfo {
    pub interfaces: BTreeMap<String, InterfaceDescription>,
    pub children: Vec<String>,
}

#[derive(Debug)]
enum Tag {
    Open {
        name: String,
        attrs: Vec<(String, String)>,
        empty: bool,
    },
    Close(String),
    Eof,
}

struct Reader<'a> {
    s: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(s: &'a str) -> Reader<'a> {
        Reader {
            s: s.as_bytes(),
            pos: 0,
        }
    }

    fn err(&self) -> IntrospectError {
        IntrospectError::Malformed(self.pos)
    }

    fn skip_past(&mut self, needle: &[u8]) -> Result<(), IntrospectError> {
        while self.pos + needle.len() <= self.s.len() {
            if &self.s[self.pos..self.pos + needle.len()] == needle {
                self.pos += needle.len();
                return Ok(());
            }
            self.pos += 1;
        }
        Err(IntrospectError::UnexpectedEof)
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.s.len() && self.s[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn read_name(&mut self) -> Result<String, IntrospectError> {
        let start = self.pos;
        while self.pos < self.s.len() {
            let b = self.s[self.pos];
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.' || b == b':' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.err());
        }
        Ok(String::from_utf8_lossy(&self.s[start..self.pos]).into_owned())
    }

    /// Advances to the next element tag, skipping text, comments, the
    /// prolog and the doctype.
    fn next_tag(&mut self) -> Result<Tag, IntrospectError> {
        loop {
            while self.pos < self.s.len() && self.s[self.pos] != b'<' {
                self.pos += 1;
            }
            if self.pos >= self.s.len() {
                return Ok(Tag::Eof);
            }
            if self.s[self.pos..].starts_with(b"<!--") {
                self.pos += 4;
                self.skip_past(b"-->")?;
            } else if self.s[self.pos..].starts_with(b"<?") {
                self.pos += 2;
                self.skip_past(b"?>")?;
            } else if self.s[self.pos..].starts_with(b"<!") {
                self.pos += 2;
                self.skip_past(b">")?;
            } else if self.s[self.pos..].starts_with(b"</") {
                self.pos += 2;
                let name = self.read_name()?;
                self.skip_whitespace();
                if self.s.get(self.pos) != Some(&b'>') {
                    return Err(self.err());
                }
                self.pos += 1;
                return Ok(Tag::Close(name));
            } else {
                self.pos += 1;
                return self.read_open_tag();
            }
        }
    }

    fn read_open_tag(&mut self) -> Result<Tag, IntrospectError> {
        let name = self.read_name()?;
        let mut attrs = Vec::new();
        loop {
            self.skip_whitespace();
            match self.s.get(self.pos) {
                None => return Err(IntrospectError::UnexpectedEof),
                Some(b'>') => {
                    self.pos += 1;
                    return Ok(Tag::Open {
                        name,
                        attrs,
                        empty: false,
                    });
                }
                Some(b'/') => {
                    self.pos += 1;
                    if self.s.get(self.pos) != Some(&b'>') {
                        return Err(self.err());
                    }
                    self.pos += 1;
                    return Ok(Tag::Open {
                        name,
                        attrs,
                        empty: true,
                    });
                }
                Some(_) => {
                    let attr_name = self.read_name()?;
                    self.skip_whitespace();
                    if self.s.get(self.pos) != Some(&b'=') {
                        return Err(self.err());
                    }
                    self.pos += 1;
                    self.skip_whitespace();
                    let quote = *self.s.get(self.pos).ok_or(IntrospectError::UnexpectedEof)?;
                    if quote != b'"' && quote != b'\'' {
                        return Err(self.err());
                    }
                    self.pos += 1;
                    let start = self.pos;
                    while self.pos < self.s.len() && self.s[self.pos] != quote {
                        self.pos += 1;
                    }
                    if self.pos >= self.s.len() {
                        return Err(IntrospectError::UnexpectedEof);
                    }
                    let raw = String::from_utf8_lossy(&self.s[start..self.pos]).into_owned();
                    self.pos += 1;
                    attrs.push((attr_name, decode_entities(&raw)?));
                }
            }
        }
    }
}

fn decode_entities(s: &str) -> Result<String, IntrospectError> {
    if !s.contains('&') {
        return Ok(s.to_owned());
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];
        let end = rest.find(';').ok_or(IntrospectError::BadEntity)?;
        let entity = &rest[1..end];
        match entity {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            _ => {
                let code = entity
                    .strip_prefix("#x")
                    .map(|h| u32::from_str_radix(h, 16))
                    .or_else(|| entity.strip_prefix('#').map(|d| d.parse::<u32>()))
                    .ok_or(IntrospectError::BadEntity)?
                    .map_err(|_| IntrospectError::BadEntity)?;
                out.push(char::from_u32(code).ok_or(IntrospectError::BadEntity)?);
            }
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

/// Consumes the rest of the current element, nested children included.
fn skip_element(r: &mut Reader) -> Result<(), IntrospectError> {
    let mut depth = 0usize;
    loop {
        match r.next_tag()? {
            Tag::Open { empty: false, .. } => depth += 1,
            Tag::Open { empty: true, .. } => {}
            Tag::Close(_) => {
                if depth == 0 {
                    return Ok(());
                }
                depth -= 1;
            }
            Tag::Eof => return Err(IntrospectError::UnexpectedEof),
        }
    }
}

/// Parses an introspection document into its node shape.
pub fn parse_introspection(xml: &str) -> Result<NodeInfo, IntrospectError> {
    let mut r = Reader::new(xml);
    loop {
        match r.next_tag()? {
            Tag::Open { name, empty, .. } if name == "node" => {
                return if empty {
                    Ok(NodeInfo::default())
                } else {
                    parse_node(&mut r)
                };
            }
            Tag::Open { .. } | Tag::Close(_) => return Err(IntrospectError::NotANode),
            Tag::Eof => return Err(IntrospectError::UnexpectedEof),
        }
    }
}

fn parse_node(r: &mut Reader) -> Result<NodeInfo, IntrospectError> {
    let mut info = NodeInfo::default();
    loop {
        match r.next_tag()? {
            Tag::Open { name, attrs, empty } => match name.as_str() {
                "interface" => {
                    let iface = parse_interface(r, &attrs, empty)?;
                    info.interfaces.insert(iface.name.clone(), iface);
                }
                "node" => {
                    if let Some(child) = attr(&attrs, "name") {
                        info.children.push(child.to_owned());
                    }
                    if !empty {
                        skip_element(r)?;
                    }
                }
                _ => {
                    if !empty {
                        skip_element(r)?;
                    }
                }
            },
            Tag::Close(name) if name == "node" => return Ok(info),
            Tag::Close(name) => return Err(IntrospectError::MismatchedTag(name)),
            Tag::Eof => return Err(IntrospectError::UnexpectedEof),
        }
    }
}

fn parse_interface(
    r: &mut Reader,
    attrs: &[(String, String)],
    empty: bool,
) -> Result<InterfaceDescription, IntrospectError> {
    let name = attr(attrs, "name").ok_or(IntrospectError::Malformed(0))?;
    let mut desc = InterfaceDescription::new(name);
    if empty {
        return Ok(desc);
    }
    loop {
        match r.next_tag()? {
            Tag::Open { name, attrs, empty } => match name.as_str() {
                "method" => {
                    let mname = attr(&attrs, "name")
                        .ok_or(IntrospectError::Malformed(0))?
                        .to_owned();
                    let mut spec = MethodSpec::default();
                    if !empty {
                        collect_args(r, |direction, ty, arg_name| {
                            if direction == "out" {
                                spec.out_sig.push_str(ty);
                                if let Some(n) = arg_name {
                                    spec.out_names.push(n.to_owned());
                                }
                            } else {
                                spec.in_sig.push_str(ty);
                                if let Some(n) = arg_name {
                                    spec.in_names.push(n.to_owned());
                                }
                            }
                        }, "in")?;
                    }
                    desc.methods.insert(mname, spec);
                }
                "signal" => {
                    let sname = attr(&attrs, "name")
                        .ok_or(IntrospectError::Malformed(0))?
                        .to_owned();
                    let mut spec = SignalSpec::default();
                    if !empty {
                        collect_args(r, |_direction, ty, arg_name| {
                            spec.signature.push_str(ty);
                            if let Some(n) = arg_name {
                                spec.arg_names.push(n.to_owned());
                            }
                        }, "out")?;
                    }
                    desc.signals.insert(sname, spec);
                }
                "property" => {
                    let pname = attr(&attrs, "name")
                        .ok_or(IntrospectError::Malformed(0))?
                        .to_owned();
                    let sig = attr(&attrs, "type").unwrap_or("").to_owned();
                    let access = match attr(&attrs, "access") {
                        Some("write") => Access::Write,
                        Some("readwrite") => Access::ReadWrite,
                        _ => Access::Read,
                    };
                    desc.properties.insert(
                        pname,
                        PropertySpec {
                            signature: sig,
                            access,
                        },
                    );
                    if !empty {
                        skip_element(r)?;
                    }
                }
                _ => {
                    if !empty {
                        skip_element(r)?;
                    }
                }
            },
            Tag::Close(name) if name == "interface" => return Ok(desc),
            Tag::Close(name) => return Err(IntrospectError::MismatchedTag(name)),
            Tag::Eof => return Err(IntrospectError::UnexpectedEof),
        }
    }
}

/// Walks the `<arg>` elements of a method or signal, handing each to `f`
/// with its effective direction.
fn collect_args<F>(r: &mut Reader, mut f: F, default_dir: &str) -> Result<(), IntrospectError>
where
    F: FnMut(&str, &str, Option<&str>),
{
    loop {
        match r.next_tag()? {
            Tag::Open { name, attrs, empty } => {
                if name == "arg" {
                    let ty = attr(&attrs, "type").unwrap_or("");
                    let direction = attr(&attrs, "direction").unwrap_or(default_dir);
                    f(direction, ty, attr(&attrs, "name"));
                }
                if !empty {
                    skip_element(r)?;
                }
            }
            Tag::Close(_) => return Ok(()),
            Tag::Eof => return Err(IntrospectError::UnexpectedEof),
        }
    }
}
