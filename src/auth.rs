//! SASL authentication for D-Bus transports.
//!
//! The handshake is a line protocol, ASCII with CR-LF endings, run on the
//! raw stream before any message framing.  Methods are tried in the
//! configured order until the server accepts one, then `BEGIN` switches the
//! stream to message mode.

use std::env;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path as StdPath, PathBuf};

use rand::RngCore;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// One SASL mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    External,
    CookieSha1,
    Anonymous,
}

impl AuthMethod {
    fn name(self) -> &'static str {
        match self {
            AuthMethod::External => "EXTERNAL",
            AuthMethod::CookieSha1 => "DBUS_COOKIE_SHA1",
            AuthMethod::Anonymous => "ANONYMOUS",
        }
    }
}

/// The default mechanism order.
pub fn default_methods() -> Vec<AuthMethod> {
    vec![
        AuthMethod::External,
        AuthMethod::CookieSha1,
        AuthMethod::Anonymous,
    ]
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication failed: {0}")]
    Failed(String),
    #[error("unexpected server response {0:?}")]
    UnexpectedResponse(String),
    #[error("malformed server data line")]
    BadData,
    #[error("no cookie with id {id} in keyring {context:?}")]
    NoCookie { context: String, id: String },
    #[error("cookie context {0:?} is not a plain file name")]
    BadContext(String),
    #[error("HOME is not set, cannot locate the keyring")]
    NoHome,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// Auth lines stay tiny; anything longer means a confused peer.
const MAX_LINE: usize = 16 * 1024;

fn read_line<T: Read>(stream: &mut T) -> Result<String, AuthError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte)?;
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            line.truncate(line.len() - 2);
            return String::from_utf8(line).map_err(|_| AuthError::BadData);
        }
        if line.len() > MAX_LINE {
            return Err(AuthError::BadData);
        }
    }
}

fn write_line<T: Write>(stream: &mut T, line: &str) -> Result<(), AuthError> {
    stream.write_all(line.as_bytes())?;
    stream.write_all(b"\r\n")?;
    Ok(())
}

fn split_response(line: &str) -> (&str, &str) {
    match line.split_once(' ') {
        Some((cmd, rest)) => (cmd, rest),
        None => (line, ""),
    }
}

/// Runs the handshake and returns the server GUID from its `OK` line.
///
/// The single NUL credentials byte is written before the first line, as
/// every transport expects it.
pub fn authenticate<T: Read + Write>(
    stream: &mut T,
    methods: &[AuthMethod],
    negotiate_unix_fd: bool,
) -> Result<String, AuthError> {
    stream.write_all(b"\0")?;

    let mut rejections = Vec::new();
    for method in methods {
        match try_method(stream, *method)? {
            Some(guid) => {
                if negotiate_unix_fd {
                    write_line(stream, "NEGOTIATE_UNIX_FD")?;
                    // AGREE_UNIX_FD or ERROR; either way the session can
                    // proceed, fd passing is only acknowledged here.
                    let _ = read_line(stream)?;
                }
                write_line(stream, "BEGIN")?;
                return Ok(guid);
            }
            None => rejections.push(method.name()),
        }
    }
    Err(AuthError::Failed(format!(
        "server rejected {}",
        rejections.join(", ")
    )))
}

/// Attempts one mechanism.  `Ok(None)` means the server rejected it and the
/// next method should be tried.
fn try_method<T: Read + Write>(
    stream: &mut T,
    method: AuthMethod,
) -> Result<Option<String>, AuthError> {
    match method {
        AuthMethod::External => {
            let uid = unsafe { libc::getuid() };
            write_line(
                stream,
                &format!("AUTH EXTERNAL {}", hex::encode(uid.to_string())),
            )?;
        }
        AuthMethod::Anonymous => {
            write_line(stream, "AUTH ANONYMOUS")?;
        }
        AuthMethod::CookieSha1 => {
            let user = local_user();
            write_line(
                stream,
                &format!("AUTH DBUS_COOKIE_SHA1 {}", hex::encode(user)),
            )?;
        }
    }

    loop {
        let line = read_line(stream)?;
        let (cmd, rest) = split_response(&line);
        match cmd {
            "OK" => return Ok(Some(rest.to_owned())),
            "REJECTED" => return Ok(None),
            "DATA" if method == AuthMethod::CookieSha1 => {
                let reply = cookie_response(rest)?;
                write_line(stream, &format!("DATA {}", reply))?;
            }
            // Servers may poke EXTERNAL clients with an empty DATA round.
            "DATA" => write_line(stream, "DATA")?,
            "ERROR" => return Ok(None),
            _ => return Err(AuthError::UnexpectedResponse(line)),
        }
    }
}

fn local_user() -> String {
    env::var("USER")
        .or_else(|_| env::var("LOGNAME"))
        .unwrap_or_else(|_| unsafe { libc::getuid() }.to_string())
}

/// Answers a `DBUS_COOKIE_SHA1` challenge: the server sends hex of
/// `<context> <cookie-id> <server-challenge>`, the reply is hex of
/// `<client-challenge> <sha1(server:client:cookie)>`.
fn cookie_response(hex_challenge: &str) -> Result<String, AuthError> {
    let decoded = hex::decode(hex_challenge).map_err(|_| AuthError::BadData)?;
    let text = String::from_utf8(decoded).map_err(|_| AuthError::BadData)?;
    let mut fields = text.split_whitespace();
    let (context, id, server_challenge) = match (fields.next(), fields.next(), fields.next()) {
        (Some(c), Some(i), Some(s)) => (c, i, s),
        _ => return Err(AuthError::BadData),
    };
    let cookie = find_cookie(context, id)?;

    let mut challenge_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut challenge_bytes);
    let client_challenge = hex::encode(challenge_bytes);

    let digest = cookie_digest(server_challenge, &client_challenge, &cookie);
    let reply = format!("{} {}", client_challenge, digest);
    Ok(hex::encode(reply))
}

pub(crate) fn cookie_digest(server: &str, client: &str, cookie: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{}:{}:{}", server, client, cookie));
    hex::encode(hasher.finalize())
}

fn keyring_dir() -> Result<PathBuf, AuthError> {
    let home = env::var("HOME").map_err(|_| AuthError::NoHome)?;
    Ok(PathBuf::from(home).join(".dbus-keyrings"))
}

fn find_cookie(context: &str, id: &str) -> Result<String, AuthError> {
    find_cookie_in(&keyring_dir()?, context, id)
}

/// Looks up a cookie in a keyring file of `<id> <timestamp> <hex-cookie>`
/// lines.
fn find_cookie_in(dir: &StdPath, context: &str, id: &str) -> Result<String, AuthError> {
    if context.is_empty() || context.contains('/') || context.starts_with('.') {
        return Err(AuthError::BadContext(context.to_owned()));
    }
    let data = fs::read_to_string(dir.join(context))?;
    for line in data.lines() {
        let mut fields = line.split_whitespace();
        if let (Some(line_id), Some(_ts), Some(cookie)) =
            (fields.next(), fields.next(), fields.next())
        {
            if line_id == id {
                return Ok(cookie.to_owned());
            }
        }
    }
    Err(AuthError::NoCookie {
        context: context.to_owned(),
        id: id.to_owned(),
    })
}
