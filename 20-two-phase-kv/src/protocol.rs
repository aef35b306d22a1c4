//! Gateway line protocol.
//!
//! Requests are one line each: `PUT <key> <value>`, `GET <key>` or
//! `DELETE <key>`. The verb is case-insensitive. Everything after the key is
//! the value, so values may contain spaces; keys may not.
//!
//! Responses are one line each and are rendered by [`Response`]'s `Display`.

use std::fmt;

use crate::error::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Put { key: String, value: String },
    Get { key: String },
    Delete { key: String },
}

impl Request {
    /// Parses one request line.
    ///
    /// A line with fewer than two words, or the wrong number of arguments for
    /// its verb, is malformed. An unknown verb is an invalid command.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let original = line.trim();
        let malformed = || ProtocolError::Malformed(original.to_string());

        let (cmd, rest) = split_word(original);
        let (key, rest) = split_word(rest);
        if cmd.is_empty() || key.is_empty() {
            return Err(malformed());
        }

        match cmd.to_uppercase().as_str() {
            "PUT" if !rest.is_empty() => Ok(Request::Put {
                key: key.to_string(),
                value: rest.to_string(),
            }),
            "GET" if rest.is_empty() => Ok(Request::Get {
                key: key.to_string(),
            }),
            "DELETE" if rest.is_empty() => Ok(Request::Delete {
                key: key.to_string(),
            }),
            "PUT" | "GET" | "DELETE" => Err(malformed()),
            _ => Err(ProtocolError::InvalidCommand(cmd.to_string())),
        }
    }

    /// Parses one request line received as raw bytes.
    ///
    /// Bytes that are not valid UTF-8 make the line malformed; the error
    /// carries a lossy rendering of it.
    pub fn parse_bytes(line: &[u8]) -> Result<Self, ProtocolError> {
        match std::str::from_utf8(line) {
            Ok(line) => Self::parse(line),
            Err(_) => Err(ProtocolError::Malformed(
                String::from_utf8_lossy(line).trim().to_string(),
            )),
        }
    }
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(end) => (&s[..end], s[end..].trim_start()),
        None => (s, ""),
    }
}

/// One gateway response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    PutOk,
    PutError,
    GetOk(String),
    GetNotFound,
    DeleteOk,
    DeleteError,
    Invalid(ProtocolError),
    /// The replica serving a read could not be reached.
    RemoteError(String),
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::PutOk => f.write_str("PUT OK"),
            Response::PutError => f.write_str("PUT ERROR"),
            Response::GetOk(value) => write!(f, "GET OK: {value}"),
            Response::GetNotFound => f.write_str("GET ERROR: Key not found"),
            Response::DeleteOk => f.write_str("DELETE OK"),
            Response::DeleteError => f.write_str("DELETE ERROR"),
            Response::Invalid(err) => write!(f, "ERROR {err}"),
            Response::RemoteError(detail) => write!(f, "ERROR Remote exception: {detail}"),
        }
    }
}
