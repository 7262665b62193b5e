//! Describing and implementing exported interfaces.
//!
//! An exported object pairs an [`InterfaceDescription`] (the tables a peer
//! can introspect) with an [`InterfaceHandler`] (the code behind it).  The
//! session engine dispatches inbound calls against these and also serves
//! `org.freedesktop.DBus.Introspectable` and `org.freedesktop.DBus.Properties`
//! on every exported object automatically.

use std::collections::BTreeMap;

use crate::message::DBusError;
use crate::signature;
use crate::types::Value;

pub const INTROSPECTABLE_IFACE: &str = "org.freedesktop.DBus.Introspectable";
pub const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";

pub const ERR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const ERR_UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
pub const ERR_UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
pub const ERR_PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
pub const ERR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
pub const ERR_ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
pub const ERR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn readable(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }

    pub(crate) fn as_xml(self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::ReadWrite => "readwrite",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodSpec {
    pub in_sig: String,
    pub out_sig: String,
    pub in_names: Vec<String>,
    pub out_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertySpec {
    pub signature: String,
    pub access: Access,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalSpec {
    pub signature: String,
    pub arg_names: Vec<String>,
}

/// The introspectable shape of one interface: method, property and signal
/// tables keyed by member name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterfaceDescription {
    pub name: String,
    pub methods: BTreeMap<String, MethodSpec>,
    pub properties: BTreeMap<String, PropertySpec>,
    pub signals: BTreeMap<String, SignalSpec>,
}

impl InterfaceDescription {
    pub fn new<S: Into<String>>(name: S) -> InterfaceDescription {
        InterfaceDescription {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn method(
        mut self,
        name: &str,
        in_sig: &str,
        out_sig: &str,
        in_names: &[&str],
        out_names: &[&str],
    ) -> Self {
        self.methods.insert(
            name.to_owned(),
            MethodSpec {
                in_sig: in_sig.to_owned(),
                out_sig: out_sig.to_owned(),
                in_names: in_names.iter().map(|s| s.to_string()).collect(),
                out_names: out_names.iter().map(|s| s.to_string()).collect(),
            },
        );
        self
    }

    pub fn property(mut self, name: &str, sig: &str, access: Access) -> Self {
        self.properties.insert(
            name.to_owned(),
            PropertySpec {
                signature: sig.to_owned(),
                access,
            },
        );
        self
    }

    pub fn signal(mut self, name: &str, sig: &str, arg_names: &[&str]) -> Self {
        self.signals.insert(
            name.to_owned(),
            SignalSpec {
                signature: sig.to_owned(),
                arg_names: arg_names.iter().map(|s| s.to_string()).collect(),
            },
        );
        self
    }
}

/// The implementation behind an exported interface.  Handlers run on the
/// session's owning thread and must return promptly.
pub trait InterfaceHandler {
    /// Handles one method call.  The returned values are encoded against
    /// the method's declared out signature.
    fn call(&mut self, method: &str, args: Vec<Value>) -> Result<Vec<Value>, DBusError>;

    fn get_property(&mut self, name: &str) -> Result<Value, DBusError> {
        Err(unknown_property(name))
    }

    fn set_property(&mut self, name: &str, _value: Value) -> Result<(), DBusError> {
        Err(unknown_property(name))
    }
}

pub(crate) fn unknown_method(member: &str) -> DBusError {
    DBusError::new(ERR_UNKNOWN_METHOD, format!("no such method {:?}", member))
}

pub(crate) fn unknown_property(name: &str) -> DBusError {
    DBusError::new(ERR_UNKNOWN_PROPERTY, format!("no such property {:?}", name))
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Splits a multi-type signature into its complete types, for one `<arg>`
/// element each.  Unparseable signatures fall back to a single arg.
fn split_sig(sig: &str) -> Vec<String> {
    match signature::parse(sig) {
        Ok(types) => types.iter().map(|t| t.to_string()).collect(),
        Err(_) => vec![sig.to_owned()],
    }
}

fn write_args(out: &mut String, sig: &str, names: &[String], direction: Option<&str>) {
    for (i, ty) in split_sig(sig).iter().enumerate() {
        out.push_str("    <arg");
        if let Some(name) = names.get(i) {
            out.push_str(&format!(" name=\"{}\"", xml_escape(name)));
        }
        out.push_str(&format!(" type=\"{}\"", xml_escape(ty)));
        if let Some(d) = direction {
            out.push_str(&format!(" direction=\"{}\"", d));
        }
        out.push_str("/>\n");
    }
}

fn write_interface(out: &mut String, desc: &InterfaceDescription) {
    out.push_str(&format!("  <interface name=\"{}\">\n", xml_escape(&desc.name)));
    for (name, m) in &desc.methods {
        out.push_str(&format!("   <method name=\"{}\">\n", xml_escape(name)));
        write_args(out, &m.in_sig, &m.in_names, Some("in"));
        write_args(out, &m.out_sig, &m.out_names, Some("out"));
        out.push_str("   </method>\n");
    }
    for (name, s) in &desc.signals {
        out.push_str(&format!("   <signal name=\"{}\">\n", xml_escape(name)));
        write_args(out, &s.signature, &s.arg_names, None);
        out.push_str("   </signal>\n");
    }
    for (name, p) in &desc.properties {
        out.push_str(&format!(
            "   <property name=\"{}\" type=\"{}\" access=\"{}\"/>\n",
            xml_escape(name),
            xml_escape(&p.signature),
            p.access.as_xml()
        ));
    }
    out.push_str("  </interface>\n");
}

/// The standard interfaces every exported object answers for.
pub(crate) fn standard_interfaces() -> Vec<InterfaceDescription> {
    vec![
        InterfaceDescription::new(INTROSPECTABLE_IFACE).method(
            "Introspect",
            "",
            "s",
            &[],
            &["xml_data"],
        ),
        InterfaceDescription::new(PROPERTIES_IFACE)
            .method(
                "Get",
                "ss",
                "v",
                &["interface_name", "property_name"],
                &["value"],
            )
            .method(
                "Set",
                "ssv",
                "",
                &["interface_name", "property_name", "value"],
                &[],
            )
            .method("GetAll", "s", "a{sv}", &["interface_name"], &["props"]),
    ]
}

/// Serialises the interfaces exported at one path, plus child node stubs,
/// into introspection XML.
pub(crate) fn introspection_xml(
    interfaces: &[&InterfaceDescription],
    children: &[String],
) -> String {
    let mut out = String::from(
        "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n \
         \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n<node>\n",
    );
    for desc in interfaces {
        write_interface(&mut out, desc);
    }
    if !interfaces.is_empty() {
        for std_iface in standard_interfaces() {
            write_interface(&mut out, &std_iface);
        }
    }
    for child in children {
        out.push_str(&format!("  <node name=\"{}\"/>\n", xml_escape(child)));
    }
    out.push_str("</node>\n");
    out
}
