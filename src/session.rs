//! The session engine: one owning task per connection.
//!
//! The engine assigns serials, correlates method returns and errors with
//! pending calls, routes signals to subscribed listeners, refcounts broker
//! match rules, dispatches inbound method calls to exported interfaces and
//! performs the initial `Hello` exchange.  Everything runs on the calling
//! thread; `call` pumps the read loop until its own reply arrives and
//! dispatches whatever else comes in along the way.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use crate::address::{self, AddressError};
use crate::auth::{self, AuthMethod};
use crate::connection::{Connection, Error};
use crate::demarshal::DecodeOptions;
use crate::introspect::{self, IntrospectError};
use crate::message::{
    create_error, create_method_call, create_method_return, create_signal, DBusError,
    HeaderField, Message, MessageError, MessageType,
};
use crate::service::{
    self, introspection_xml, InterfaceDescription, InterfaceHandler, INTROSPECTABLE_IFACE,
    PROPERTIES_IFACE,
};
use crate::types::{BasicValue, Dictionary, Signature, Value, Variant};

pub const BUS_NAME: &str = "org.freedesktop.DBus";
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
pub const BUS_IFACE: &str = "org.freedesktop.DBus";

/// Flags for `RequestName`.
pub const NAME_FLAG_ALLOW_REPLACEMENT: u32 = 0x1;
pub const NAME_FLAG_REPLACE_EXISTING: u32 = 0x2;
pub const NAME_FLAG_DO_NOT_QUEUE: u32 = 0x4;

const MAX_INTROSPECT_DEPTH: usize = 16;

/// Broker answer to `RequestName`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner = 1,
    InQueue = 2,
    Exists = 3,
    AlreadyOwner = 4,
}

impl RequestNameReply {
    fn from_u32(x: u32) -> Option<Self> {
        match x {
            1 => Some(RequestNameReply::PrimaryOwner),
            2 => Some(RequestNameReply::InQueue),
            3 => Some(RequestNameReply::Exists),
            4 => Some(RequestNameReply::AlreadyOwner),
            _ => None,
        }
    }
}

/// Broker answer to `ReleaseName`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released = 1,
    NonExistent = 2,
    NotOwner = 3,
}

impl ReleaseNameReply {
    fn from_u32(x: u32) -> Option<Self> {
        match x {
            1 => Some(ReleaseNameReply::Released),
            2 => Some(ReleaseNameReply::NonExistent),
            3 => Some(ReleaseNameReply::NotOwner),
            _ => None,
        }
    }
}

/// Session construction knobs.
#[derive(Clone)]
pub struct SessionConfig {
    /// Overrides the bus address lookup.
    pub bus_address: Option<String>,
    /// SASL mechanisms, tried in order.
    pub auth_methods: Vec<AuthMethod>,
    /// Acknowledge fd passing during the handshake.
    pub negotiate_unix_fd: bool,
    /// Talk to a peer directly: skip the initial `Hello`.
    pub direct_peer: bool,
    pub decode: DecodeOptions,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            bus_address: None,
            auth_methods: auth::default_methods(),
            negotiate_unix_fd: false,
            direct_peer: false,
            decode: DecodeOptions::default(),
        }
    }
}

/// Completion for one pending call.
pub type ReplyHandler = Box<dyn FnOnce(Result<Vec<Value>, Error>)>;

type SignalHandlerFn = Rc<RefCell<dyn FnMut(&Message)>>;

/// Handle for removing a signal listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct SignalEntry {
    id: u64,
    handler: SignalHandlerFn,
}

struct Export {
    desc: InterfaceDescription,
    handler: Box<dyn InterfaceHandler>,
}

struct Engine {
    conn: Connection,
    next_serial: u32,
    pending: HashMap<u32, ReplyHandler>,
    /// Keyed by `path:interface:member`.
    signal_handlers: HashMap<String, Vec<SignalEntry>>,
    subscriptions: HashMap<u64, (String, String)>,
    match_refs: HashMap<String, u32>,
    exports: HashMap<String, BTreeMap<String, Rc<RefCell<Export>>>>,
    unique_name: Option<String>,
    ready: bool,
    backlog: Vec<Message>,
    next_sub_id: u64,
    closed: bool,
}

impl Engine {
    fn alloc_serial(&mut self) -> u32 {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.checked_add(1).unwrap_or(1);
        serial
    }
}

fn mangle(path: &str, interface: &str, member: &str) -> String {
    format!("{}:{}:{}", path, interface, member)
}

fn signal_rule(path: &str, interface: &str, member: &str) -> String {
    format!(
        "type='signal',path='{}',interface='{}',member='{}'",
        path, interface, member
    )
}

/// Removes one listener from a signal key, dropping the key when its list
/// empties.
fn drop_listener(e: &mut Engine, key: &str, id: u64) {
    let empty = match e.signal_handlers.get_mut(key) {
        Some(list) => {
            list.retain(|entry| entry.id != id);
            list.is_empty()
        }
        None => false,
    };
    if empty {
        e.signal_handlers.remove(key);
    }
}

/// Closes the engine and completes every pending call with
/// `ConnectionClosed`.
fn fail_all(inner: &Rc<RefCell<Engine>>) {
    let handlers: Vec<ReplyHandler> = {
        let mut e = inner.borrow_mut();
        e.closed = true;
        e.pending.drain().map(|(_, h)| h).collect()
    };
    for h in handlers {
        h(Err(Error::ConnectionClosed));
    }
}

/// A connection to a message bus (or a direct peer), sharing one engine
/// among clones, proxies and callbacks.
#[derive(Clone)]
pub struct Session {
    inner: Rc<RefCell<Engine>>,
}

impl Session {
    /// Connects to the session bus named by `DBUS_SESSION_BUS_ADDRESS`.
    pub fn session_bus(config: SessionConfig) -> Result<Session, Error> {
        let addr = config
            .bus_address
            .clone()
            .or_else(address::session_bus_address)
            .ok_or_else(|| {
                Error::Address(AddressError::NoAddresses(
                    "DBUS_SESSION_BUS_ADDRESS".to_owned(),
                ))
            })?;
        Session::connect(&addr, config)
    }

    /// Connects to the system bus.
    pub fn system_bus(config: SessionConfig) -> Result<Session, Error> {
        let addr = config
            .bus_address
            .clone()
            .unwrap_or_else(address::system_bus_address);
        Session::connect(&addr, config)
    }

    /// Connects and authenticates against an address list.
    pub fn connect(addresses: &str, config: SessionConfig) -> Result<Session, Error> {
        let conn = Connection::connect(
            addresses,
            &config.auth_methods,
            config.negotiate_unix_fd,
            config.decode,
        )?;
        Session::with_connection(conn, config)
    }

    /// Builds a session over an already-authenticated connection and runs
    /// the `Hello` exchange (unless configured as a direct peer).
    pub fn with_connection(conn: Connection, config: SessionConfig) -> Result<Session, Error> {
        let session = Session::start(conn, &config)?;
        while !session.inner.borrow().ready {
            session.process_message()?;
        }
        Ok(session)
    }

    /// Sends `Hello` (when talking to a broker) but does not pump the read
    /// loop; sends issued before the broker answers are queued in order.
    fn start(conn: Connection, config: &SessionConfig) -> Result<Session, Error> {
        let engine = Engine {
            conn,
            next_serial: 1,
            pending: HashMap::new(),
            signal_handlers: HashMap::new(),
            subscriptions: HashMap::new(),
            match_refs: HashMap::new(),
            exports: HashMap::new(),
            unique_name: None,
            ready: config.direct_peer,
            backlog: Vec::new(),
            next_sub_id: 1,
            closed: false,
        };
        let session = Session {
            inner: Rc::new(RefCell::new(engine)),
        };
        if !config.direct_peer {
            session.send_hello()?;
        }
        Ok(session)
    }

    fn send_hello(&self) -> Result<(), Error> {
        let weak = Rc::downgrade(&self.inner);
        let mut msg = create_method_call(BUS_NAME, BUS_PATH, BUS_IFACE, "Hello");
        let mut e = self.inner.borrow_mut();
        let serial = e.alloc_serial();
        msg.serial = serial;
        e.pending.insert(
            serial,
            Box::new(move |result| hello_complete(&weak, result)),
        );
        e.conn.send(&msg)
    }

    /// The sender-unique name assigned by the broker, once `Hello` has
    /// completed.
    pub fn unique_name(&self) -> Option<String> {
        self.inner.borrow().unique_name.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Tears the session down, completing every pending call with
    /// `ConnectionClosed`.
    pub fn close(&self) {
        fail_all(&self.inner);
    }

    /// Assigns the next serial and writes (or, before `Hello` completes,
    /// queues) the message.  Returns the serial.
    pub fn send(&self, mut msg: Message) -> Result<u32, Error> {
        let mut e = self.inner.borrow_mut();
        if e.closed {
            return Err(Error::ConnectionClosed);
        }
        let serial = e.alloc_serial();
        msg.serial = serial;
        if e.ready {
            if let Err(err) = e.conn.send(&msg) {
                let broken = e.conn.is_broken();
                drop(e);
                if broken {
                    fail_all(&self.inner);
                }
                return Err(err);
            }
        } else {
            e.backlog.push(msg);
        }
        Ok(serial)
    }

    /// Sends a method call and registers a completion, unless the message
    /// asks for no reply.
    pub fn invoke<F>(&self, msg: Message, cb: F) -> Result<u32, Error>
    where
        F: FnOnce(Result<Vec<Value>, Error>) + 'static,
    {
        let wants_reply = !msg.no_reply_expected();
        let serial = self.send(msg)?;
        if wants_reply {
            self.inner.borrow_mut().pending.insert(serial, Box::new(cb));
        }
        Ok(serial)
    }

    /// Sends a method call and pumps the read loop until its reply or
    /// error arrives.  Other inbound traffic is dispatched normally while
    /// waiting.
    pub fn call(&self, msg: Message) -> Result<Vec<Value>, Error> {
        if msg.no_reply_expected() {
            self.send(msg)?;
            return Ok(Vec::new());
        }
        let slot: Rc<RefCell<Option<Result<Vec<Value>, Error>>>> = Rc::new(RefCell::new(None));
        let writer = slot.clone();
        self.invoke(msg, move |result| {
            *writer.borrow_mut() = Some(result);
        })?;
        loop {
            if let Some(result) = slot.borrow_mut().take() {
                return result;
            }
            self.process_message()?;
        }
    }

    /// Reads one message and routes it.  Fatal transport or framing errors
    /// close the session and complete all pending calls.
    pub fn process_message(&self) -> Result<(), Error> {
        let msg = {
            let mut e = self.inner.borrow_mut();
            if e.closed {
                return Err(Error::ConnectionClosed);
            }
            e.conn.read_message()
        };
        match msg {
            Ok(m) => {
                self.dispatch(m);
                Ok(())
            }
            Err(e) => {
                fail_all(&self.inner);
                Err(e)
            }
        }
    }

    fn dispatch(&self, msg: Message) {
        match msg.message_type {
            MessageType::MethodReturn | MessageType::Error => {
                let serial = msg.reply_serial().unwrap_or(0);
                let handler = self.inner.borrow_mut().pending.remove(&serial);
                match handler {
                    Some(h) => {
                        let result = if msg.message_type == MessageType::Error {
                            Err(Error::DBus(msg.to_dbus_error()))
                        } else {
                            Ok(msg.body)
                        };
                        h(result);
                    }
                    // A reply nobody is waiting for is dropped.
                    None => debug!(serial, "reply without a pending call"),
                }
            }
            MessageType::Signal => self.dispatch_signal(&msg),
            MessageType::MethodCall => self.dispatch_method_call(msg),
        }
    }

    fn dispatch_signal(&self, msg: &Message) {
        let key = mangle(
            msg.header_str(HeaderField::Path).unwrap_or(""),
            msg.header_str(HeaderField::Interface).unwrap_or(""),
            msg.header_str(HeaderField::Member).unwrap_or(""),
        );
        let handlers: Vec<SignalHandlerFn> = self
            .inner
            .borrow()
            .signal_handlers
            .get(&key)
            .map(|entries| entries.iter().map(|e| e.handler.clone()).collect())
            .unwrap_or_default();
        for handler in handlers {
            match handler.try_borrow_mut() {
                Ok(mut f) => f(msg),
                Err(_) => warn!(key = %key, "signal handler re-entered, delivery dropped"),
            }
        }
    }

    // Inbound method calls: the standard interfaces first, then exports.
    fn dispatch_method_call(&self, msg: Message) {
        let path = msg.header_str(HeaderField::Path).unwrap_or("").to_owned();
        let iface = msg
            .header_str(HeaderField::Interface)
            .unwrap_or("")
            .to_owned();
        let member = msg.header_str(HeaderField::Member).unwrap_or("").to_owned();

        if iface == INTROSPECTABLE_IFACE && member == "Introspect" {
            return self.handle_introspect(&msg, &path);
        }

        let exports_at = self.inner.borrow().exports.get(&path).cloned();
        let exports_at = match exports_at {
            Some(map) => map,
            None => {
                return self.error_reply(
                    &msg,
                    service::ERR_UNKNOWN_METHOD,
                    &format!("no object at {:?}", path),
                )
            }
        };

        if iface == PROPERTIES_IFACE {
            return self.handle_properties(&msg, &member, &exports_at);
        }

        // An empty interface header means any interface at the path may
        // carry the member.
        let target = if iface.is_empty() {
            exports_at
                .values()
                .find(|x| x.borrow().desc.methods.contains_key(&member))
                .cloned()
        } else {
            exports_at.get(&iface).cloned()
        };
        let export = match target {
            Some(x) => x,
            None => {
                return self.error_reply(
                    &msg,
                    service::ERR_UNKNOWN_METHOD,
                    &format!("no interface {:?} at {:?}", iface, path),
                )
            }
        };

        let spec = export.borrow().desc.methods.get(&member).cloned();
        let spec = match spec {
            Some(s) => s,
            None => {
                return self.error_reply(
                    &msg,
                    service::ERR_UNKNOWN_METHOD,
                    &format!("no such method {:?}", member),
                )
            }
        };

        if !sigs_equal(&spec.in_sig, msg.body_signature().unwrap_or("")) {
            return self.error_reply(
                &msg,
                service::ERR_INVALID_ARGS,
                &format!("expected signature {:?}", spec.in_sig),
            );
        }

        // User code runs with the engine released so it may use the
        // session freely.
        let result = export.borrow_mut().handler.call(&member, msg.body.clone());
        match result {
            Ok(values) => self.reply_with(&msg, &spec.out_sig, values),
            Err(err) => {
                self.error_reply(&msg, &err.name, err.message.as_deref().unwrap_or(""))
            }
        }
    }

    fn handle_introspect(&self, msg: &Message, path: &str) {
        let (descs, children) = {
            let e = self.inner.borrow();
            let descs: Vec<InterfaceDescription> = e
                .exports
                .get(path)
                .map(|m| m.values().map(|x| x.borrow().desc.clone()).collect())
                .unwrap_or_default();
            (descs, child_nodes(&e, path))
        };
        let refs: Vec<&InterfaceDescription> = descs.iter().collect();
        let xml = introspection_xml(&refs, &children);
        self.reply_with(msg, "s", vec![Value::from(xml)]);
    }

    fn handle_properties(
        &self,
        msg: &Message,
        member: &str,
        exports_at: &BTreeMap<String, Rc<RefCell<Export>>>,
    ) {
        match member {
            "Get" => {
                let (iface, prop) = match (
                    msg.body.first().and_then(Value::as_str),
                    msg.body.get(1).and_then(Value::as_str),
                ) {
                    (Some(i), Some(p)) => (i.to_owned(), p.to_owned()),
                    _ => {
                        return self.error_reply(
                            msg,
                            service::ERR_INVALID_ARGS,
                            "Get takes an interface and a property name",
                        )
                    }
                };
                let export = match exports_at.get(&iface) {
                    Some(x) => x,
                    None => {
                        return self.error_reply(
                            msg,
                            service::ERR_UNKNOWN_INTERFACE,
                            &format!("no interface {:?}", iface),
                        )
                    }
                };
                let spec = export.borrow().desc.properties.get(&prop).cloned();
                let spec = match spec {
                    Some(s) => s,
                    None => {
                        return self.error_reply(
                            msg,
                            service::ERR_UNKNOWN_PROPERTY,
                            &format!("no such property {:?}", prop),
                        )
                    }
                };
                if !spec.access.readable() {
                    return self.error_reply(
                        msg,
                        service::ERR_ACCESS_DENIED,
                        &format!("property {:?} is write-only", prop),
                    );
                }
                let value = export.borrow_mut().handler.get_property(&prop);
                match value {
                    Ok(v) => self.reply_with(
                        msg,
                        "v",
                        vec![Value::Variant(Variant::new(v, spec.signature))],
                    ),
                    Err(err) => self.error_reply(
                        msg,
                        &err.name,
                        err.message.as_deref().unwrap_or(""),
                    ),
                }
            }
            "Set" => {
                let (iface, prop, value) = match (
                    msg.body.first().and_then(Value::as_str),
                    msg.body.get(1).and_then(Value::as_str),
                    msg.body.get(2),
                ) {
                    (Some(i), Some(p), Some(v)) => {
                        (i.to_owned(), p.to_owned(), v.clone().unwrap_variant())
                    }
                    _ => {
                        return self.error_reply(
                            msg,
                            service::ERR_INVALID_ARGS,
                            "Set takes an interface, a property name and a value",
                        )
                    }
                };
                let export = match exports_at.get(&iface) {
                    Some(x) => x,
                    None => {
                        return self.error_reply(
                            msg,
                            service::ERR_UNKNOWN_INTERFACE,
                            &format!("no interface {:?}", iface),
                        )
                    }
                };
                let spec = export.borrow().desc.properties.get(&prop).cloned();
                let spec = match spec {
                    Some(s) => s,
                    None => {
                        return self.error_reply(
                            msg,
                            service::ERR_UNKNOWN_PROPERTY,
                            &format!("no such property {:?}", prop),
                        )
                    }
                };
                if !spec.access.writable() {
                    return self.error_reply(
                        msg,
                        service::ERR_PROPERTY_READ_ONLY,
                        &format!("property {:?} is read-only", prop),
                    );
                }
                if !sigs_equal(&spec.signature, &value.signature()) {
                    return self.error_reply(
                        msg,
                        service::ERR_INVALID_ARGS,
                        &format!("property {:?} has signature {:?}", prop, spec.signature),
                    );
                }
                let result = export.borrow_mut().handler.set_property(&prop, value);
                match result {
                    Ok(()) => self.reply_with(msg, "", Vec::new()),
                    Err(err) => self.error_reply(
                        msg,
                        &err.name,
                        err.message.as_deref().unwrap_or(""),
                    ),
                }
            }
            "GetAll" => {
                let iface = match msg.body.first().and_then(Value::as_str) {
                    Some(i) => i.to_owned(),
                    None => {
                        return self.error_reply(
                            msg,
                            service::ERR_INVALID_ARGS,
                            "GetAll takes an interface name",
                        )
                    }
                };
                let export = match exports_at.get(&iface) {
                    Some(x) => x,
                    None => {
                        return self.error_reply(
                            msg,
                            service::ERR_UNKNOWN_INTERFACE,
                            &format!("no interface {:?}", iface),
                        )
                    }
                };
                let props: Vec<(String, String)> = export
                    .borrow()
                    .desc
                    .properties
                    .iter()
                    .filter(|(_, spec)| spec.access.readable())
                    .map(|(name, spec)| (name.clone(), spec.signature.clone()))
                    .collect();
                let mut map = HashMap::new();
                for (name, sig) in props {
                    match export.borrow_mut().handler.get_property(&name) {
                        Ok(v) => {
                            map.insert(
                                BasicValue::String(name),
                                Value::Variant(Variant::new(v, sig)),
                            );
                        }
                        Err(err) => debug!(property = %name, error = %err, "GetAll skipping"),
                    }
                }
                self.reply_with(
                    msg,
                    "a{sv}",
                    vec![Value::Dictionary(Dictionary::typed("s", "v", map))],
                );
            }
            other => self.error_reply(
                msg,
                service::ERR_UNKNOWN_METHOD,
                &format!("no such method {:?}", other),
            ),
        }
    }

    /// Sends a method return for an inbound call, honoring the no-reply
    /// flag and the declared out signature.
    pub fn send_reply(&self, call: &Message, values: Vec<Value>) -> Result<(), Error> {
        let sig: String = values.iter().map(|v| v.signature()).collect();
        self.send_reply_with_signature(call, &sig, values)
    }

    fn send_reply_with_signature(
        &self,
        call: &Message,
        out_sig: &str,
        values: Vec<Value>,
    ) -> Result<(), Error> {
        if call.no_reply_expected() {
            return Ok(());
        }
        let mut reply = create_method_return(call.serial);
        if let Some(sender) = call.header_str(HeaderField::Sender) {
            reply = reply.add_header(HeaderField::Destination, Value::from(sender));
        }
        if !out_sig.is_empty() {
            reply = reply.add_header(
                HeaderField::Signature,
                Value::from(Signature::new(out_sig)),
            );
        }
        reply.body = values;
        self.send(reply).map(|_| ())
    }

    fn reply_with(&self, call: &Message, out_sig: &str, values: Vec<Value>) {
        if let Err(e) = self.send_reply_with_signature(call, out_sig, values) {
            match e {
                Error::Marshal(_) | Error::Message(_) | Error::Signature(_) => {
                    // The handler produced something unencodable.
                    self.error_reply(call, service::ERR_FAILED, &e.to_string());
                }
                other => debug!(error = %other, "reply not sent"),
            }
        }
    }

    /// Sends an error reply for an inbound call.
    pub fn send_error(&self, call: &Message, name: &str, text: &str) -> Result<(), Error> {
        if call.no_reply_expected() {
            return Ok(());
        }
        let mut err = create_error(name, call.serial);
        if let Some(sender) = call.header_str(HeaderField::Sender) {
            err = err.add_header(HeaderField::Destination, Value::from(sender));
        }
        if !text.is_empty() {
            err = err.add_arg(&text);
        }
        self.send(err).map(|_| ())
    }

    fn error_reply(&self, call: &Message, name: &str, text: &str) {
        if let Err(e) = self.send_error(call, name, text) {
            debug!(error = %e, "error reply not sent");
        }
    }

    /// Emits a signal from an exported object, using the declared signal
    /// signature when one is registered.
    pub fn emit_signal(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        args: Vec<Value>,
    ) -> Result<u32, Error> {
        let declared = self
            .inner
            .borrow()
            .exports
            .get(path)
            .and_then(|m| m.get(interface))
            .and_then(|x| x.borrow().desc.signals.get(member).map(|s| s.signature.clone()));
        let sig = declared.unwrap_or_else(|| args.iter().map(|v| v.signature()).collect());
        let mut msg = create_signal(path, interface, member);
        if !sig.is_empty() {
            msg = msg.add_header(HeaderField::Signature, Value::from(Signature::new(sig)));
        }
        msg.body = args;
        self.send(msg)
    }

    /// Registers an interface implementation at an object path.
    pub fn export(
        &self,
        path: &str,
        desc: InterfaceDescription,
        handler: Box<dyn InterfaceHandler>,
    ) -> Result<(), Error> {
        let mut e = self.inner.borrow_mut();
        if e.closed {
            return Err(Error::ConnectionClosed);
        }
        e.exports
            .entry(path.to_owned())
            .or_default()
            .insert(desc.name.clone(), Rc::new(RefCell::new(Export { desc, handler })));
        Ok(())
    }

    /// Subscribes to a signal, registering the broker match rule on the
    /// first listener for it.
    pub fn add_signal_listener<F>(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        handler: F,
    ) -> Result<SubscriptionId, Error>
    where
        F: FnMut(&Message) + 'static,
    {
        let rule = signal_rule(path, interface, member);
        let key = mangle(path, interface, member);
        let id = {
            let mut e = self.inner.borrow_mut();
            if e.closed {
                return Err(Error::ConnectionClosed);
            }
            let id = e.next_sub_id;
            e.next_sub_id += 1;
            e.signal_handlers.entry(key.clone()).or_default().push(SignalEntry {
                id,
                handler: Rc::new(RefCell::new(handler)),
            });
            e.subscriptions.insert(id, (key.clone(), rule.clone()));
            id
        };
        if let Err(err) = self.add_match(&rule) {
            let mut e = self.inner.borrow_mut();
            e.subscriptions.remove(&id);
            drop_listener(&mut e, &key, id);
            return Err(err);
        }
        Ok(SubscriptionId(id))
    }

    /// Drops a signal listener; the broker rule goes away with the last
    /// one.
    pub fn remove_signal_listener(&self, id: SubscriptionId) -> Result<(), Error> {
        let rule = {
            let mut e = self.inner.borrow_mut();
            let (key, rule) = match e.subscriptions.remove(&id.0) {
                Some(x) => x,
                None => return Ok(()),
            };
            drop_listener(&mut e, &key, id.0);
            rule
        };
        self.remove_match(&rule)
    }

    /// Refcounted `AddMatch`: only the 0 to 1 transition reaches the
    /// broker.  The count is raised before the broker call so re-entrant
    /// adds for the same rule cannot race a second registration.
    pub fn add_match(&self, rule: &str) -> Result<(), Error> {
        let first = {
            let mut e = self.inner.borrow_mut();
            if e.closed {
                return Err(Error::ConnectionClosed);
            }
            let count = e.match_refs.entry(rule.to_owned()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first {
            let result = self.call(
                create_method_call(BUS_NAME, BUS_PATH, BUS_IFACE, "AddMatch").add_arg(&rule),
            );
            if let Err(err) = result {
                let mut e = self.inner.borrow_mut();
                let count = e.match_refs.get_mut(rule).map(|c| {
                    *c -= 1;
                    *c
                });
                if count == Some(0) {
                    e.match_refs.remove(rule);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Refcounted `RemoveMatch`, symmetric to [`Session::add_match`].
    pub fn remove_match(&self, rule: &str) -> Result<(), Error> {
        let last = {
            let mut e = self.inner.borrow_mut();
            let count = match e.match_refs.get_mut(rule) {
                None => {
                    debug!(rule, "remove_match without matching add_match");
                    return Ok(());
                }
                Some(c) => {
                    *c -= 1;
                    *c
                }
            };
            if count == 0 {
                e.match_refs.remove(rule);
                true
            } else {
                false
            }
        };
        if last {
            self.call(
                create_method_call(BUS_NAME, BUS_PATH, BUS_IFACE, "RemoveMatch").add_arg(&rule),
            )?;
        }
        Ok(())
    }

    /// Asks the broker for a well-known name.
    pub fn request_name(&self, name: &str, flags: u32) -> Result<RequestNameReply, Error> {
        let body = self.call(
            create_method_call(BUS_NAME, BUS_PATH, BUS_IFACE, "RequestName")
                .add_arg(&name)
                .add_arg(&flags),
        )?;
        body.first()
            .and_then(Value::as_u32)
            .and_then(RequestNameReply::from_u32)
            .ok_or(Error::Message(MessageError::BodyMismatch))
    }

    /// Gives a well-known name back.
    pub fn release_name(&self, name: &str) -> Result<ReleaseNameReply, Error> {
        let body = self.call(
            create_method_call(BUS_NAME, BUS_PATH, BUS_IFACE, "ReleaseName").add_arg(&name),
        )?;
        body.first()
            .and_then(Value::as_u32)
            .and_then(ReleaseNameReply::from_u32)
            .ok_or(Error::Message(MessageError::BodyMismatch))
    }

    /// Introspects a remote object and builds proxies for its interfaces.
    /// A pure branch node with a single child is followed down.
    pub fn proxy(&self, destination: &str, path: &str) -> Result<Proxy, Error> {
        let mut path = path.to_owned();
        for _ in 0..MAX_INTROSPECT_DEPTH {
            let body = self.call(create_method_call(
                destination,
                &path,
                INTROSPECTABLE_IFACE,
                "Introspect",
            ))?;
            let xml = body
                .first()
                .and_then(Value::as_str)
                .ok_or(Error::Message(MessageError::BodyMismatch))?;
            let node = introspect::parse_introspection(xml)?;
            if node.interfaces.is_empty() && node.children.len() == 1 {
                let child = &node.children[0];
                path = if path == "/" {
                    format!("/{}", child)
                } else {
                    format!("{}/{}", path, child)
                };
                continue;
            }
            return Ok(Proxy {
                session: Rc::downgrade(&self.inner),
                destination: destination.to_owned(),
                path,
                interfaces: node.interfaces,
            });
        }
        Err(Error::Introspect(IntrospectError::TooDeep))
    }
}

fn hello_complete(weak: &Weak<RefCell<Engine>>, result: Result<Vec<Value>, Error>) {
    let inner = match weak.upgrade() {
        Some(rc) => rc,
        None => return,
    };
    match result {
        Ok(body) => {
            let backlog = {
                let mut e = inner.borrow_mut();
                e.unique_name = body.first().and_then(Value::as_str).map(str::to_owned);
                e.ready = true;
                std::mem::take(&mut e.backlog)
            };
            for msg in backlog {
                let sent = inner.borrow_mut().conn.send(&msg);
                if let Err(err) = sent {
                    warn!(error = %err, "flushing queued message failed");
                    fail_all(&inner);
                    return;
                }
            }
        }
        Err(err) => {
            warn!(error = %err, "Hello failed");
            fail_all(&inner);
        }
    }
}

/// First path segments of exports strictly below `path`.
fn child_nodes(e: &Engine, path: &str) -> Vec<String> {
    let prefix = if path == "/" {
        "/".to_owned()
    } else {
        format!("{}/", path)
    };
    let mut out = BTreeSet::new();
    for p in e.exports.keys() {
        if p != path && p.starts_with(&prefix) {
            if let Some(seg) = p[prefix.len()..].split('/').next() {
                if !seg.is_empty() {
                    out.insert(seg.to_owned());
                }
            }
        }
    }
    out.into_iter().collect()
}

/// Signature strings compare by parsed shape, so spelling differences in
/// the empty case do not matter.
fn sigs_equal(a: &str, b: &str) -> bool {
    match (crate::signature::parse(a), crate::signature::parse(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}

/// An introspected remote object.
pub struct Proxy {
    session: Weak<RefCell<Engine>>,
    pub destination: String,
    pub path: String,
    pub interfaces: BTreeMap<String, InterfaceDescription>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("destination", &self.destination)
            .field("path", &self.path)
            .field("interfaces", &self.interfaces)
            .finish()
    }
}

impl Proxy {
    /// Borrows one interface of the remote object.
    pub fn interface(&self, name: &str) -> Option<ProxyInterface> {
        self.interfaces.get(name).map(|desc| ProxyInterface {
            session: self.session.clone(),
            destination: self.destination.clone(),
            path: self.path.clone(),
            desc: desc.clone(),
        })
    }

    pub fn interface_names(&self) -> Vec<&str> {
        self.interfaces.keys().map(String::as_str).collect()
    }
}

/// A callable view of one remote interface.  Holds only a weak reference
/// to the session; operations fail with `ConnectionClosed` once it is
/// gone.
pub struct ProxyInterface {
    session: Weak<RefCell<Engine>>,
    pub destination: String,
    pub path: String,
    desc: InterfaceDescription,
}

impl ProxyInterface {
    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn description(&self) -> &InterfaceDescription {
        &self.desc
    }

    fn session(&self) -> Result<Session, Error> {
        self.session
            .upgrade()
            .map(|inner| Session { inner })
            .ok_or(Error::ConnectionClosed)
    }

    fn method_message(&self, method: &str, args: Vec<Value>) -> Result<Message, Error> {
        let spec = self
            .desc
            .methods
            .get(method)
            .ok_or_else(|| Error::DBus(service::unknown_method(method)))?;
        let mut msg = create_method_call(&self.destination, &self.path, &self.desc.name, method);
        if !spec.in_sig.is_empty() {
            msg = msg.add_header(
                HeaderField::Signature,
                Value::from(Signature::new(spec.in_sig.clone())),
            );
        }
        msg.body = args;
        Ok(msg)
    }

    /// Calls a declared method and waits for the reply.  Unknown methods
    /// fail locally without bus traffic.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Vec<Value>, Error> {
        let msg = self.method_message(method, args)?;
        self.session()?.call(msg)
    }

    /// Callback-style variant of [`ProxyInterface::call`].
    pub fn invoke<F>(&self, method: &str, args: Vec<Value>, cb: F) -> Result<u32, Error>
    where
        F: FnOnce(Result<Vec<Value>, Error>) + 'static,
    {
        let msg = self.method_message(method, args)?;
        self.session()?.invoke(msg, cb)
    }

    /// Reads a property via `org.freedesktop.DBus.Properties.Get`; the
    /// variant envelope is unwrapped.
    pub fn get_property(&self, name: &str) -> Result<Value, Error> {
        if !self.desc.properties.contains_key(name) {
            return Err(Error::DBus(service::unknown_property(name)));
        }
        let msg = create_method_call(&self.destination, &self.path, PROPERTIES_IFACE, "Get")
            .add_arg(&self.desc.name)
            .add_arg(&name);
        let body = self.session()?.call(msg)?;
        let value = body
            .into_iter()
            .next()
            .ok_or(Error::Message(MessageError::BodyMismatch))?;
        Ok(unwrap_single_variant(value))
    }

    /// Writes a property via `org.freedesktop.DBus.Properties.Set`.
    pub fn set_property(&self, name: &str, value: Value) -> Result<(), Error> {
        let spec = self
            .desc
            .properties
            .get(name)
            .ok_or_else(|| Error::DBus(service::unknown_property(name)))?;
        if !spec.access.writable() {
            return Err(Error::DBus(DBusError::new(
                service::ERR_PROPERTY_READ_ONLY,
                format!("property {:?} is read-only", name),
            )));
        }
        let variant = Variant::new(value, spec.signature.clone());
        let msg = create_method_call(&self.destination, &self.path, PROPERTIES_IFACE, "Set")
            .add_arg(&self.desc.name)
            .add_arg(&name)
            .add_arg(&variant);
        self.session()?.call(msg)?;
        Ok(())
    }

    /// Subscribes to one of this interface's signals on this object.
    pub fn on<F>(&self, signal: &str, handler: F) -> Result<SubscriptionId, Error>
    where
        F: FnMut(&Message) + 'static,
    {
        self.session()?
            .add_signal_listener(&self.path, &self.desc.name, signal, handler)
    }

    /// Removes a subscription made with [`ProxyInterface::on`].
    pub fn off(&self, id: SubscriptionId) -> Result<(), Error> {
        self.session()?.remove_signal_listener(id)
    }
}

/// Peels the variant envelope when its signature holds exactly one
/// complete type.
fn unwrap_single_variant(value: Value) -> Value {
    match value {
        Value::Variant(v) => {
            match crate::signature::parse(&v.signature.0) {
                Ok(types) if types.len() == 1 => *v.object,
                _ => Value::Variant(v),
            }
        }
        other => other,
    }
}
