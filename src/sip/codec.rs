/// SIP message framing over UDP datagrams
/// Reference: RFC 3261 - SIP: Session Initiation Protocol
///
/// One datagram carries one message: a start-line, header lines,
/// CRLF CRLF, then an opaque body. Datagrams beginning with a NUL
/// byte are server keep-alive pings and never reach the parser.

use bytes::Bytes;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Ordered multimap of SIP headers.
///
/// Lookup is case-insensitive; insertion order is preserved and a
/// name may appear multiple times. `get` joins repeated values with
/// `\n`, serialization re-emits one line per stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// All values for `name` joined with `\n`, or None if absent.
    pub fn get(&self, name: &str) -> Option<String> {
        let mut values = self.values(name).peekable();
        values.peek()?;
        Some(values.collect::<Vec<_>>().join("\n"))
    }

    pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request {
        method: String,
        uri: String,
        headers: Headers,
        body: Bytes,
    },
    Response {
        status: u16,
        reason: String,
        headers: Headers,
        body: Bytes,
    },
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("header section is not valid UTF-8")]
    NotText,
    #[error("missing CRLF CRLF header terminator")]
    MissingTerminator,
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
    #[error("unrecognized start-line: {0:?}")]
    StartLine(String),
}

/// Server keep-alive ping: a datagram starting with a NUL byte.
pub fn is_keepalive(datagram: &[u8]) -> bool {
    datagram.first() == Some(&0)
}

/// First line of a datagram, for direction logging.
pub fn first_line(datagram: &[u8]) -> String {
    let text = String::from_utf8_lossy(datagram);
    text.split(['\r', '\n']).next().unwrap_or_default().to_string()
}

impl SipMessage {
    pub fn parse(datagram: &[u8]) -> Result<SipMessage, CodecError> {
        let split = find_terminator(datagram).ok_or(CodecError::MissingTerminator)?;
        let head = std::str::from_utf8(&datagram[..split]).map_err(|_| CodecError::NotText)?;
        let body = Bytes::copy_from_slice(&datagram[split + 4..]);

        let mut lines = head.split("\r\n");
        let start = lines.next().unwrap_or_default();

        let mut headers = Headers::new();
        for line in lines {
            let (name, value) = line
                .split_once(": ")
                .ok_or_else(|| CodecError::MalformedHeader(line.to_string()))?;
            headers.append(name, value);
        }

        if let Some(rest) = start.strip_prefix("SIP/2.0 ") {
            let (code, reason) = rest
                .split_once(' ')
                .ok_or_else(|| CodecError::StartLine(start.to_string()))?;
            let status: u16 = code
                .parse()
                .ok()
                .filter(|_| code.len() == 3)
                .filter(|s| (100..700).contains(s))
                .ok_or_else(|| CodecError::StartLine(start.to_string()))?;
            return Ok(SipMessage::Response {
                status,
                reason: reason.to_string(),
                headers,
                body,
            });
        }

        let mut parts = start.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(uri), Some("SIP/2.0"))
                if !method.is_empty() && method.chars().all(|c| c.is_ascii_alphabetic()) =>
            {
                Ok(SipMessage::Request {
                    method: method.to_string(),
                    uri: uri.to_string(),
                    headers,
                    body,
                })
            }
            _ => Err(CodecError::StartLine(start.to_string())),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let (start, headers, body) = match self {
            SipMessage::Request { method, uri, headers, body } => {
                (format!("{} {} SIP/2.0", method, uri), headers, body)
            }
            SipMessage::Response { status, reason, headers, body } => {
                (format!("SIP/2.0 {} {}", status, reason), headers, body)
            }
        };

        let mut out = start.into_bytes();
        for (name, value) in headers.iter() {
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
        }
        out.extend_from_slice(b"\r\n\r\n");
        out.extend_from_slice(body);
        out
    }

    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request { headers, .. } | SipMessage::Response { headers, .. } => headers,
        }
    }
}

/// Extract the caller's number from a From header value.
///
/// Matches the first `sip:<digits>@` URI, tolerating a leading `+`.
pub fn caller_number(from: &str) -> Option<String> {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    let re = NUMBER.get_or_init(|| Regex::new(r"sip:\+*(\d+)@").expect("valid number regex"));
    re.captures(from).map(|c| c[1].to_string())
}

fn find_terminator(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}



/// Kani formal verification proofs
#[cfg(kani)]
mod kani_proofs {
    use super::*;

    #[kani::proof]
    fn parse_never_panics() {
        let data: [u8; 24] = kani::any();
        let _ = SipMessage::parse(&data);
    }

    #[kani::proof]
    fn keepalive_never_panics() {
        let data: [u8; 4] = kani::any();
        let _ = is_keepalive(&data);
    }
}
