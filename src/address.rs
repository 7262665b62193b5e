//! Parsing of D-Bus server address strings.
//!
//! Addresses look like `unix:path=/run/user/1000/bus` or
//! `tcp:host=127.0.0.1,port=4000`; several candidates may be joined with
//! semicolons and are tried in order.  Option values use `%XX` escapes.

use std::env;
use std::path::{Path as StdPath, PathBuf};
use std::str::{FromStr, Split};

use thiserror::Error;

/// Fallback when `DBUS_SYSTEM_BUS_ADDRESS` is unset.
pub const DEFAULT_SYSTEM_BUS_ADDRESS: &str = "unix:path=/var/run/dbus/system_bus_socket";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AddressError {
    #[error("escape sequence is truncated")]
    ShortEscapeSequence,
    #[error("escape sequence is not valid hex")]
    BadEscapeSequence,
    #[error("unescaped value is not UTF-8")]
    EscapeNotUtf8,
    #[error("address {0:?} has no transport separator")]
    BadTransportSeparator(String),
    #[error("malformed key=value pair {0:?}")]
    MalformedKeyValue(String),
    #[error("unknown transport {0:?}")]
    UnknownTransport(String),
    #[error("unknown option {0:?}")]
    UnknownOption(String),
    #[error("missing option {0}")]
    MissingOption(&'static str),
    #[error("conflicting options: {0}")]
    ConflictingOptions(&'static str),
    #[error("bad port number {0:?}")]
    BadPort(String),
    #[error("no addresses in {0:?}")]
    NoAddresses(String),
}

fn unescape(buf: &[u8]) -> Result<Vec<u8>, AddressError> {
    let mut out = Vec::with_capacity(buf.len());
    let mut i = buf.iter();
    while let Some(c) = i.next() {
        if *c == b'%' {
            let c1 = *i.next().ok_or(AddressError::ShortEscapeSequence)?;
            let c2 = *i.next().ok_or(AddressError::ShortEscapeSequence)?;
            let decoded =
                hex::decode([c1, c2]).map_err(|_| AddressError::BadEscapeSequence)?;
            out.push(decoded[0]);
        } else {
            out.push(*c);
        }
    }
    Ok(out)
}

fn unescape_str(s: &str) -> Result<String, AddressError> {
    String::from_utf8(unescape(s.as_bytes())?).map_err(|_| AddressError::EscapeNotUtf8)
}

/// Iterator over key value pairs of the form `key=val,key=val`.
struct AddrKeyVals<'a> {
    str: Split<'a, char>,
}

impl<'a> AddrKeyVals<'a> {
    fn new(s: &'a str) -> Self {
        AddrKeyVals { str: s.split(',') }
    }

    fn get_next(&mut self) -> Option<&'a str> {
        loop {
            let kvs = self.str.next();
            if kvs.is_none() || kvs != Some("") {
                return kvs;
            }
        }
    }
}

impl<'a> Iterator for AddrKeyVals<'a> {
    type Item = Result<(String, String), AddressError>;

    fn next(&mut self) -> Option<Self::Item> {
        let kvs = self.get_next()?;
        let mut keyval = kvs.split('=');
        let (key, val) = match (keyval.next(), keyval.next(), keyval.next()) {
            (Some(k), Some(v), None) => (k, v),
            _ => return Some(Err(AddressError::MalformedKeyValue(kvs.to_owned()))),
        };
        match (unescape_str(key), unescape_str(val)) {
            (Ok(k), Ok(v)) => Some(Ok((k, v))),
            (Err(e), _) | (_, Err(e)) => Some(Err(e)),
        }
    }
}

/// A UNIX domain socket address.  Abstract sockets carry a leading NUL in
/// the stored path.
#[derive(Debug, Clone, PartialEq)]
pub struct UnixAddress {
    path: PathBuf,
}

impl UnixAddress {
    pub fn path(&self) -> &StdPath {
        self.path.as_path()
    }
}

impl FromStr for UnixAddress {
    type Err = AddressError;

    fn from_str(opts: &str) -> Result<Self, AddressError> {
        let mut path = None;
        let mut abs = false;
        for kv in AddrKeyVals::new(opts) {
            let (key, val) = kv?;
            match key.as_str() {
                "path" | "abstract" => {
                    if path.is_some() {
                        return Err(AddressError::ConflictingOptions(
                            "duplicate path/abstract",
                        ));
                    }
                    abs = key == "abstract";
                    path = Some(val);
                }
                "guid" => {}
                _ => return Err(AddressError::UnknownOption(key)),
            }
        }
        match path {
            None => Err(AddressError::MissingOption("path")),
            Some(mut p) => {
                if abs {
                    p.insert(0, '\0');
                }
                Ok(UnixAddress {
                    path: PathBuf::from(p),
                })
            }
        }
    }
}

/// A TCP address, host plus port.
#[derive(Debug, Clone, PartialEq)]
pub struct TcpAddress {
    pub host: String,
    pub port: u16,
}

impl FromStr for TcpAddress {
    type Err = AddressError;

    fn from_str(opts: &str) -> Result<Self, AddressError> {
        let mut host = None;
        let mut port = None;
        for kv in AddrKeyVals::new(opts) {
            let (key, val) = kv?;
            match key.as_str() {
                "host" => host = Some(val),
                "port" => {
                    port = Some(val.parse::<u16>().map_err(|_| AddressError::BadPort(val))?)
                }
                "family" | "guid" => {}
                _ => return Err(AddressError::UnknownOption(key)),
            }
        }
        Ok(TcpAddress {
            host: host.ok_or(AddressError::MissingOption("host"))?,
            port: port.ok_or(AddressError::MissingOption("port"))?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerAddress {
    Unix(UnixAddress),
    Tcp(TcpAddress),
}

impl FromStr for ServerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (transport, opts) = s
            .split_once(':')
            .ok_or_else(|| AddressError::BadTransportSeparator(s.to_owned()))?;
        match transport {
            "unix" => Ok(ServerAddress::Unix(opts.parse()?)),
            "tcp" => Ok(ServerAddress::Tcp(opts.parse()?)),
            _ => Err(AddressError::UnknownTransport(transport.to_owned())),
        }
    }
}

/// Parses a semicolon-separated address list, in connection order.
pub fn parse_address_list(s: &str) -> Result<Vec<ServerAddress>, AddressError> {
    let addrs: Result<Vec<ServerAddress>, AddressError> = s
        .split(';')
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect();
    let addrs = addrs?;
    if addrs.is_empty() {
        return Err(AddressError::NoAddresses(s.to_owned()));
    }
    Ok(addrs)
}

/// Address of the session bus, from the environment.
pub fn session_bus_address() -> Option<String> {
    env::var("DBUS_SESSION_BUS_ADDRESS").ok()
}

/// Address of the system bus, from the environment or the well-known
/// default.
pub fn system_bus_address() -> String {
    env::var("DBUS_SYSTEM_BUS_ADDRESS").unwrap_or_else(|_| DEFAULT_SYSTEM_BUS_ADDRESS.to_owned())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_unescape() {
        assert_eq!(unescape(b"hello").unwrap(), b"hello");
        assert_eq!(unescape(b"\\").unwrap(), b"\\");
        assert_eq!(unescape(b"%61").unwrap(), b"a");
        assert_eq!(unescape(b"%5c").unwrap(), b"\\");
        assert_eq!(
            unescape(b"%").unwrap_err(),
            AddressError::ShortEscapeSequence
        );
        assert_eq!(
            unescape(b"%1").unwrap_err(),
            AddressError::ShortEscapeSequence
        );
        assert_eq!(
            unescape(b"%zz").unwrap_err(),
            AddressError::BadEscapeSequence
        );
    }

    #[test]
    fn test_key_vals() {
        let mut a = AddrKeyVals::new("one=two").map(Result::unwrap);
        assert_eq!(a.next().unwrap(), ("one".to_owned(), "two".to_owned()));
        assert_eq!(a.next(), None);

        let mut a = AddrKeyVals::new("foo=bar,").map(Result::unwrap);
        assert_eq!(a.next().unwrap(), ("foo".to_owned(), "bar".to_owned()));
        assert_eq!(a.next(), None);

        let mut a = AddrKeyVals::new("foo=bar,a=b").map(Result::unwrap);
        assert_eq!(a.next().unwrap(), ("foo".to_owned(), "bar".to_owned()));
        assert_eq!(a.next().unwrap(), ("a".to_owned(), "b".to_owned()));
        assert_eq!(a.next(), None);

        let mut a = AddrKeyVals::new("foobar,a=b");
        assert!(matches!(
            a.next().unwrap().unwrap_err(),
            AddressError::MalformedKeyValue(_)
        ));
    }

    #[test]
    fn test_unix_address() {
        let a: ServerAddress = "unix:path=/var/run/dbus/system_bus_socket".parse().unwrap();
        match a {
            ServerAddress::Unix(u) => {
                assert_eq!(u.path(), StdPath::new("/var/run/dbus/system_bus_socket"))
            }
            other => panic!("wanted unix, got {:?}", other),
        }

        let a: ServerAddress = "unix:abstract=/tmp/dbus-test".parse().unwrap();
        match a {
            ServerAddress::Unix(u) => {
                assert_eq!(u.path(), StdPath::new("\0/tmp/dbus-test"))
            }
            other => panic!("wanted unix, got {:?}", other),
        }

        assert!(matches!(
            "unix".parse::<ServerAddress>().unwrap_err(),
            AddressError::BadTransportSeparator(_)
        ));
        assert!(matches!(
            "unix:path=/x,foo=bar".parse::<ServerAddress>().unwrap_err(),
            AddressError::UnknownOption(_)
        ));
        assert_eq!(
            "unix:".parse::<ServerAddress>().unwrap_err(),
            AddressError::MissingOption("path")
        );
        assert!(matches!(
            "unix:path=/a,abstract=/b".parse::<ServerAddress>().unwrap_err(),
            AddressError::ConflictingOptions(_)
        ));
    }

    #[test]
    fn test_tcp_address() {
        let a: ServerAddress = "tcp:host=127.0.0.1,port=4000".parse().unwrap();
        assert_eq!(
            a,
            ServerAddress::Tcp(TcpAddress {
                host: "127.0.0.1".to_owned(),
                port: 4000
            })
        );
        assert_eq!(
            "tcp:host=h".parse::<ServerAddress>().unwrap_err(),
            AddressError::MissingOption("port")
        );
        assert!(matches!(
            "tcp:host=h,port=banana".parse::<ServerAddress>().unwrap_err(),
            AddressError::BadPort(_)
        ));
    }

    #[test]
    fn test_address_list() {
        let addrs =
            parse_address_list("unix:path=/one;tcp:host=localhost,port=1234").unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(matches!(addrs[0], ServerAddress::Unix(_)));
        assert!(matches!(addrs[1], ServerAddress::Tcp(_)));

        assert!(matches!(
            parse_address_list("").unwrap_err(),
            AddressError::NoAddresses(_)
        ));
        assert!(matches!(
            parse_address_list("martian:x=y").unwrap_err(),
            AddressError::UnknownTransport(_)
        ));
    }

    #[test]
    fn test_escaped_path() {
        let a: UnixAddress = "path=/tmp/with%20space".parse().unwrap();
        assert_eq!(a.path(), StdPath::new("/tmp/with space"));
    }
}
