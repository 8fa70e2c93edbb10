/// SIP Digest Authentication (RFC 2617)
/// Answers the 401 challenge a registrar sends for REGISTER.
///
/// Uses the md5 crate for hash computation - no custom crypto implementation.

use digest::Digest;
use md5::Md5;
use std::collections::HashMap;

/// Parsed digest challenge from a WWW-Authenticate header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
}

impl DigestChallenge {
    /// Parse a challenge from an authenticate header value
    /// Example: Digest realm="asterisk", nonce="1234", algorithm=MD5
    pub fn parse(header_value: &str) -> Option<Self> {
        let params_str = header_value.strip_prefix("Digest ").unwrap_or(header_value);
        let params = parse_params(params_str);

        Some(DigestChallenge {
            realm: params.get("realm")?.clone(),
            nonce: params.get("nonce")?.clone(),
        })
    }

    /// Compute the digest response hash for this challenge.
    ///
    /// HA1 = MD5(username:realm:password)
    /// HA2 = MD5(method:uri)
    /// response = MD5(HA1:nonce:HA2)
    pub fn respond(&self, username: &str, password: &str, method: &str, uri: &str) -> String {
        let ha1 = md5_hex(&[username, &self.realm, password]);
        let ha2 = md5_hex(&[method, uri]);
        md5_hex(&[&ha1, &self.nonce, &ha2])
    }

    /// Format a full Authorization header value for the second REGISTER.
    pub fn authorization(&self, username: &str, password: &str, method: &str, uri: &str) -> String {
        format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
            username,
            self.realm,
            self.nonce,
            uri,
            self.respond(username, password, method, uri),
        )
    }
}

/// Compute MD5 over colon-joined parts, as lowercase hex
fn md5_hex(parts: &[&str]) -> String {
    let mut hasher = Md5::new();
    hasher.update(parts.join(":").as_bytes());
    hex::encode(hasher.finalize())
}

/// Parse key=value or key="value" parameters from a header value
fn parse_params(s: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut remaining = s.trim();

    while !remaining.is_empty() {
        remaining = remaining.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
        if remaining.is_empty() {
            break;
        }

        let eq_pos = match remaining.find('=') {
            Some(pos) => pos,
            None => break,
        };

        let key = remaining[..eq_pos].trim().to_lowercase();
        remaining = remaining[eq_pos + 1..].trim_start();

        let (value, rest) = if let Some(quoted) = remaining.strip_prefix('"') {
            match quoted.find('"') {
                Some(end_quote) => (quoted[..end_quote].to_string(), &quoted[end_quote + 1..]),
                // Unterminated quote - take rest
                None => (quoted.to_string(), ""),
            }
        } else {
            let end = remaining
                .find(|c: char| c == ',' || c.is_whitespace())
                .unwrap_or(remaining.len());
            (remaining[..end].to_string(), &remaining[end..])
        };

        params.insert(key, value);
        remaining = rest;
    }

    params
}

/// Hex encoding since we're using the digest crate
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}
