//! Command lines of the text protocol.
//!
//! A command is a whitespace-delimited line:
//!
//! ```text
//! VERB [trid] arg1 arg2 ... [payload-length]\r\n
//! [payload-length bytes of binary payload]
//! ```
//!
//! The transaction id is present on client-originated commands and their
//! replies; asynchronous server pushes use id 0 or omit it entirely. Errors
//! arrive as `<3-digit code> <trid>`.

use std::fmt;

use bytes::Bytes;

use crate::error::CoreError;

/// Verbs that never carry a transaction id on the wire. For these the
/// second token is data even when it is numeric (`LSG 0 ~ 0`, `FIL 1000`).
pub const VERBS_WITHOUT_TRID: &[&str] = &[
    "QNG", "RNG", "NLN", "FLN", "JOI", "BYE", "IPG", "NOT", "UBX", "LSG", "LST", "FIL",
];

/// A single protocol command, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Three-character verb (`USR`, `MSG`, `911`, ...).
    pub verb: String,
    /// Transaction id, if the command carries one.
    pub trid: Option<u32>,
    /// Remaining arguments. For payload-carrying commands the length
    /// argument is not included here; it is derived from `payload`.
    pub args: Vec<String>,
    /// Trailing binary block.
    pub payload: Option<Bytes>,
}

impl Command {
    /// Create a command with no id, arguments or payload.
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            trid: None,
            args: Vec::new(),
            payload: None,
        }
    }

    pub fn with_trid(mut self, trid: u32) -> Self {
        self.trid = Some(trid);
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Argument at `index`, if present.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    /// Numeric error code, if this command is an error reply.
    pub fn error_code(&self) -> Option<u16> {
        if is_error_verb(&self.verb) {
            self.verb.parse().ok()
        } else {
            None
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_code().is_some()
    }

    /// Render the header line without the trailing CRLF.
    pub fn header_line(&self) -> String {
        let mut line = self.verb.clone();
        if let Some(trid) = self.trid {
            line.push(' ');
            line.push_str(&trid.to_string());
        }
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        if let Some(payload) = &self.payload {
            line.push(' ');
            line.push_str(&payload.len().to_string());
        }
        line
    }

    /// Full wire encoding: header line, CRLF, then the payload bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = self.header_line();
        let payload_len = self.payload.as_ref().map_or(0, Bytes::len);
        let mut out = Vec::with_capacity(header.len() + 2 + payload_len);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(b"\r\n");
        if let Some(payload) = &self.payload {
            out.extend_from_slice(payload);
        }
        out
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.header_line())
    }
}

/// `true` for three-digit numeric verbs.
pub fn is_error_verb(verb: &str) -> bool {
    verb.len() == 3 && verb.bytes().all(|b| b.is_ascii_digit())
}

fn is_valid_verb(verb: &str) -> bool {
    verb.len() == 3
        && verb
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

/// Parse a header line (without CRLF).
///
/// The payload, if any, is attached later by the codec once the announced
/// number of bytes has been read.
pub fn parse_line(line: &str) -> Result<Command, CoreError> {
    let mut tokens = line.split_ascii_whitespace();

    let verb = tokens
        .next()
        .ok_or_else(|| CoreError::MalformedLine("empty line".into()))?;
    if !is_valid_verb(verb) {
        return Err(CoreError::MalformedLine(format!("invalid verb in {:?}", line)));
    }

    let mut rest: Vec<String> = tokens.map(str::to_owned).collect();
    let mut trid = None;

    if !VERBS_WITHOUT_TRID.contains(&verb) {
        if let Some(first) = rest.first() {
            if let Ok(id) = first.parse::<u32>() {
                trid = Some(id);
                rest.remove(0);
            }
        }
    }

    if is_error_verb(verb) && trid.is_none() && !rest.is_empty() {
        return Err(CoreError::MalformedLine(format!(
            "error reply without transaction id: {:?}",
            line
        )));
    }

    Ok(Command {
        verb: verb.to_owned(),
        trid,
        args: rest,
        payload: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_trid() {
        let cmd = parse_line("USR 3 TWN S lc=1033,id=507").unwrap();
        assert_eq!(cmd.verb, "USR");
        assert_eq!(cmd.trid, Some(3));
        assert_eq!(cmd.args, vec!["TWN", "S", "lc=1033,id=507"]);
    }

    #[test]
    fn test_parse_push_without_trid() {
        let cmd = parse_line("NLN AWY bob@example.com Bob").unwrap();
        assert_eq!(cmd.trid, None);
        assert_eq!(cmd.get(0), Some("AWY"));
    }

    #[test]
    fn test_qng_interval_is_not_a_trid() {
        let cmd = parse_line("QNG 50").unwrap();
        assert_eq!(cmd.trid, None);
        assert_eq!(cmd.get(0), Some("50"));
    }

    #[test]
    fn test_rng_session_id_is_data() {
        let cmd = parse_line("RNG 11752013 10.0.0.1:1863 CKI 849102291.520491 bob@example.com Bob").unwrap();
        assert_eq!(cmd.trid, None);
        assert_eq!(cmd.get(0), Some("11752013"));
    }

    #[test]
    fn test_parse_error_reply() {
        let cmd = parse_line("911 7").unwrap();
        assert_eq!(cmd.error_code(), Some(911));
        assert_eq!(cmd.trid, Some(7));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_line("").is_err());
        assert!(parse_line("hello world").is_err());
        assert!(parse_line("USRX 1").is_err());
    }

    #[test]
    fn test_header_line_includes_payload_length() {
        let cmd = Command::new("QRY")
            .with_trid(9)
            .arg("PROD0038W!61ZTF9")
            .with_payload(&b"0123456789abcdef0123456789abcdef"[..]);
        assert_eq!(cmd.header_line(), "QRY 9 PROD0038W!61ZTF9 32");
        let bytes = cmd.to_bytes();
        assert!(bytes.ends_with(b"\r\n0123456789abcdef0123456789abcdef"));
    }
}
