// Email model: ordered header list plus body, with a canonical text form
//
// Canonical form: "Name: value\r\n" per header, a blank line, then the body.
// Signatures are computed over the canonical form minus the signature header.

use super::{EmailError, Result};
use serde::{Deserialize, Serialize};

pub const SIGNATURE_HEADER: &str = "X-Dmail-Signature";

/// Value of the signature header on anonymous mail
pub const ANONYMOUS_SIGNATURE: &str = "Anonymous";

/// Headers that survive `strip_headers`
pub const HEADER_WHITELIST: &[&str] = &[
    "From",
    "Sender",
    "Reply-To",
    "In-Reply-To",
    "References",
    "To",
    "CC",
    "BCC",
    "Subject",
    "Date",
    "Message-ID",
    "MIME-Version",
    "Content-Type",
    "Content-Transfer-Encoding",
    SIGNATURE_HEADER,
];

pub const RECIPIENT_HEADERS: &[&str] = &["To", "CC", "BCC"];

/// Outcome of checking an email's signature, cached with the email
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureStatus {
    Unchecked,
    Anonymous,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Email {
    headers: Vec<(String, String)>,
    body: String,
    pub signature: SignatureStatus,
}

impl Email {
    pub fn new() -> Self {
        Self {
            headers: Vec::new(),
            body: String::new(),
            signature: SignatureStatus::Unchecked,
        }
    }

    /// Builder-style header
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.add_header(name, value);
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Replace all headers called `name` with a single one
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.remove_header(name);
        self.add_header(name, value);
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// First header called `name` (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn subject(&self) -> Option<&str> {
        self.header("Subject")
    }

    pub fn message_id(&self) -> Option<&str> {
        self.header("Message-ID")
    }

    /// Set a random Message-ID unless one exists; returns the id
    pub fn ensure_message_id(&mut self) -> String {
        if let Some(id) = self.message_id() {
            return id.to_string();
        }
        let id = format!("<{}@dmail>", uuid::Uuid::new_v4());
        self.add_header("Message-ID", &id);
        id
    }

    /// Every address listed in To, CC and BCC
    pub fn all_recipients(&self) -> Vec<String> {
        RECIPIENT_HEADERS
            .iter()
            .flat_map(|h| self.headers_named(h).collect::<Vec<_>>())
            .flat_map(split_addresses)
            .collect()
    }

    /// Drop every header not on the whitelist
    pub fn strip_headers(&mut self) {
        self.headers
            .retain(|(n, _)| HEADER_WHITELIST.iter().any(|w| w.eq_ignore_ascii_case(n)));
    }

    /// Rewrite each address of the recipient headers with `map`; addresses
    /// mapped to `None` are dropped, and headers left empty are removed.
    pub fn map_recipients<F>(&mut self, mut map: F) -> Result<()>
    where
        F: FnMut(&str, &str) -> Result<Option<String>>,
    {
        let mut rewritten = Vec::with_capacity(self.headers.len());
        for (name, value) in self.headers.drain(..) {
            if !RECIPIENT_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(&name)) {
                rewritten.push((name, value));
                continue;
            }
            let mut kept = Vec::new();
            for address in split_addresses(&value) {
                if let Some(mapped) = map(&name, &address)? {
                    kept.push(mapped);
                }
            }
            if !kept.is_empty() {
                rewritten.push((name, kept.join(", ")));
            }
        }
        self.headers = rewritten;
        Ok(())
    }

    /// Canonical bytes including every header
    pub fn to_bytes(&self) -> Vec<u8> {
        self.canonical(true)
    }

    /// Canonical bytes without the signature header
    pub fn signed_bytes(&self) -> Vec<u8> {
        self.canonical(false)
    }

    fn canonical(&self, include_signature: bool) -> Vec<u8> {
        let mut out = String::new();
        for (name, value) in &self.headers {
            if !include_signature && name.eq_ignore_ascii_case(SIGNATURE_HEADER) {
                continue;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out.into_bytes()
    }

    /// Parse the canonical form
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| EmailError::Malformed("email is not valid UTF-8".to_string()))?;
        let (head, body) = if let Some(rest) = text.strip_prefix("\r\n") {
            ("", rest)
        } else {
            text.split_once("\r\n\r\n")
                .ok_or_else(|| EmailError::Malformed("missing header terminator".to_string()))?
        };

        let mut email = Email::new().with_body(body);
        for line in head.split("\r\n").filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| EmailError::InvalidHeader(line.to_string()))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(EmailError::InvalidHeader(line.to_string()));
            }
            email.add_header(name, value.trim_start());
        }
        Ok(email)
    }
}

impl Default for Email {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a header value into trimmed, non-empty addresses
pub fn split_addresses(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Email {
        Email::new()
            .with_header("From", "sender")
            .with_header("To", "a, b")
            .with_header("CC", "c")
            .with_header("X-Mailer", "something")
            .with_header("Subject", "Hi")
            .with_body("line one\r\nline two")
    }

    #[test]
    fn test_canonical_roundtrip() {
        let email = sample();
        let parsed = Email::parse(&email.to_bytes()).unwrap();
        assert_eq!(parsed, email);
        assert_eq!(parsed.body(), "line one\r\nline two");
    }

    #[test]
    fn test_empty_headers_roundtrip() {
        let email = Email::new().with_body("just a body");
        assert_eq!(Email::parse(&email.to_bytes()).unwrap(), email);
    }

    #[test]
    fn test_strip_headers() {
        let mut email = sample();
        email.strip_headers();
        assert!(email.header("X-Mailer").is_none());
        assert_eq!(email.subject(), Some("Hi"));
    }

    #[test]
    fn test_header_lookup_case_insensitive() {
        let email = sample();
        assert_eq!(email.header("subject"), Some("Hi"));
        assert_eq!(email.header("cc"), Some("c"));
    }

    #[test]
    fn test_all_recipients() {
        assert_eq!(sample().all_recipients(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_map_recipients_drops_empty_headers() {
        let mut email = sample();
        email
            .map_recipients(|header, addr| {
                Ok(if header == "CC" { None } else { Some(addr.to_uppercase()) })
            })
            .unwrap();
        assert_eq!(email.header("To"), Some("A, B"));
        assert!(email.header("CC").is_none());
    }

    #[test]
    fn test_signed_bytes_skip_signature() {
        let mut email = sample();
        let unsigned = email.signed_bytes();
        email.add_header(SIGNATURE_HEADER, "sig");
        assert_eq!(email.signed_bytes(), unsigned);
        assert_ne!(email.to_bytes(), unsigned);
    }

    #[test]
    fn test_ensure_message_id_is_stable() {
        let mut email = sample();
        let id = email.ensure_message_id();
        assert!(id.ends_with("@dmail>"));
        assert_eq!(email.ensure_message_id(), id);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Email::parse(b"no terminator"), Err(EmailError::Malformed(_))));
        assert!(matches!(
            Email::parse(b"bad header line\r\n\r\nbody"),
            Err(EmailError::InvalidHeader(_))
        ));
        assert!(Email::parse(&[0xff, 0xfe]).is_err());
    }
}
