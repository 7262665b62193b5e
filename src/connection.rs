//! A framed connection over an authenticated duplex byte stream.
//!
//! The connection owns the transport.  Outbound messages are written as one
//! contiguous frame each; inbound bytes accumulate until a whole message
//! parses.  Any transport error or EOF marks the connection broken, after
//! which every operation fails with `ConnectionClosed`.
//!
//! In this blocking rendition the classic connection events map to the
//! call surface: ready is the constructor returning, message is an `Ok`
//! from [`Connection::read_message`], error is an `Err`, and end is
//! `ConnectionClosed`.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;

use thiserror::Error;
use tracing::debug;

use crate::address::{self, AddressError, ServerAddress};
use crate::auth::{self, AuthError, AuthMethod};
use crate::demarshal::{DecodeOptions, DemarshalError};
use crate::marshal::MarshalError;
use crate::message::{self, DBusError, Message, MessageError, MIN_FRAME_PREFIX};
use crate::signature::SignatureError;

/// A connected duplex byte stream.
pub trait Transport: Read + Write {}

impl<T: Read + Write> Transport for T {}

/// Umbrella error for everything a session can fail with.
#[derive(Debug, Error)]
pub enum Error {
    #[error("connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Marshal(#[from] MarshalError),
    #[error(transparent)]
    Demarshal(#[from] DemarshalError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Introspect(#[from] crate::introspect::IntrospectError),
    /// A peer answered a method call with a D-Bus error.
    #[error(transparent)]
    DBus(#[from] DBusError),
}

pub struct Connection {
    stream: Box<dyn Transport>,
    inbuf: Vec<u8>,
    broken: bool,
    server_guid: Option<String>,
    decode: DecodeOptions,
}

impl Connection {
    /// Opens a transport for each address in the list, in order, and runs
    /// the SASL handshake on the first one that connects.
    pub fn connect(
        addresses: &str,
        methods: &[AuthMethod],
        negotiate_unix_fd: bool,
        decode: DecodeOptions,
    ) -> Result<Connection, Error> {
        let mut last_err = None;
        for addr in address::parse_address_list(addresses)? {
            match open_transport(&addr) {
                Ok(stream) => {
                    return Connection::handshake(stream, methods, negotiate_unix_fd, decode)
                }
                Err(e) => {
                    debug!(?addr, error = %e, "address did not connect");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.map(Error::Io).unwrap_or(Error::ConnectionClosed))
    }

    /// Authenticates an already-connected stream.
    pub fn handshake(
        mut stream: Box<dyn Transport>,
        methods: &[AuthMethod],
        negotiate_unix_fd: bool,
        decode: DecodeOptions,
    ) -> Result<Connection, Error> {
        let guid = auth::authenticate(&mut stream, methods, negotiate_unix_fd)?;
        let mut conn = Connection::from_authenticated(stream, decode);
        conn.server_guid = Some(guid);
        Ok(conn)
    }

    /// Wraps a stream that is already past authentication, as in tests or
    /// pre-established peer-to-peer pipes.
    pub fn from_authenticated(stream: Box<dyn Transport>, decode: DecodeOptions) -> Connection {
        Connection {
            stream,
            inbuf: Vec::new(),
            broken: false,
            server_guid: None,
            decode,
        }
    }

    pub fn server_guid(&self) -> Option<&str> {
        self.server_guid.as_deref()
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn decode_options(&self) -> DecodeOptions {
        self.decode
    }

    /// Writes one message as a single contiguous frame.  The serial must
    /// already be assigned.
    pub fn send(&mut self, msg: &Message) -> Result<(), Error> {
        if self.broken {
            return Err(Error::ConnectionClosed);
        }
        let frame = message::marshal_message(msg)?;
        if let Err(e) = self
            .stream
            .write_all(&frame)
            .and_then(|_| self.stream.flush())
        {
            self.broken = true;
            return Err(Error::Io(e));
        }
        Ok(())
    }

    /// Blocks until one whole message has arrived and parses it.
    ///
    /// Only failures that lose the frame boundary (garbage in the fixed
    /// prefix) break the connection.  A complete frame that fails message
    /// validation, a malformed signal for instance, is logged and dropped
    /// and the next frame is read.
    pub fn read_message(&mut self) -> Result<Message, Error> {
        loop {
            if let Some(frame_len) = self.buffered_frame_len()? {
                if self.inbuf.len() >= frame_len {
                    let frame: Vec<u8> = self.inbuf.drain(..frame_len).collect();
                    match message::unmarshal_message(&frame, &self.decode) {
                        Ok(msg) => return Ok(msg),
                        Err(e) => {
                            debug!(error = %e, "dropping undecodable frame");
                            continue;
                        }
                    }
                }
            }
            self.fill()?;
        }
    }

    fn buffered_frame_len(&mut self) -> Result<Option<usize>, Error> {
        if self.inbuf.len() < MIN_FRAME_PREFIX {
            return Ok(None);
        }
        match message::frame_length(&self.inbuf) {
            Ok(len) => Ok(Some(len)),
            Err(e) => {
                self.broken = true;
                Err(e.into())
            }
        }
    }

    fn fill(&mut self) -> Result<(), Error> {
        if self.broken {
            return Err(Error::ConnectionClosed);
        }
        let mut chunk = [0u8; 4096];
        match self.stream.read(&mut chunk) {
            Ok(0) => {
                self.broken = true;
                Err(Error::ConnectionClosed)
            }
            Ok(n) => {
                self.inbuf.extend_from_slice(&chunk[..n]);
                Ok(())
            }
            Err(e) => {
                self.broken = true;
                Err(Error::Io(e))
            }
        }
    }
}

fn open_transport(addr: &ServerAddress) -> io::Result<Box<dyn Transport>> {
    match addr {
        ServerAddress::Unix(u) => {
            use std::os::unix::ffi::OsStrExt;
            let bytes = u.path().as_os_str().as_bytes();
            if bytes.first() == Some(&0) {
                Ok(Box::new(connect_abstract(bytes)?))
            } else {
                Ok(Box::new(UnixStream::connect(u.path())?))
            }
        }
        ServerAddress::Tcp(t) => Ok(Box::new(TcpStream::connect((t.host.as_str(), t.port))?)),
    }
}

/// Abstract sockets carry a leading NUL that `UnixStream::connect` refuses,
/// so the socket is built by hand.
fn connect_abstract(name: &[u8]) -> io::Result<UnixStream> {
    use std::os::unix::io::FromRawFd;

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    if name.len() > addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "abstract socket name too long",
        ));
    }
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in addr.sun_path.iter_mut().zip(name) {
        *dst = *src as libc::c_char;
    }
    let len = std::mem::size_of::<libc::sa_family_t>() + name.len();

    unsafe {
        let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::connect(
            fd,
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            len as libc::socklen_t,
        ) < 0
        {
            let e = io::Error::last_os_error();
            libc::close(fd);
            return Err(e);
        }
        Ok(UnixStream::from_raw_fd(fd))
    }
}
