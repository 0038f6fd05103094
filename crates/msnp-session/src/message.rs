//! Chat payload format.
//!
//! Switchboard `MSG` bodies are MIME-like: header lines, a blank line, then
//! the body. The content type decides what the payload is.

use std::fmt::Write;

use bytes::Bytes;

use msnp_core::{Handle, ProtocolError};

use crate::invitation::InvitationFields;

pub const CONTENT_TEXT: &str = "text/plain";
pub const CONTENT_TYPING: &str = "text/x-msmsgscontrol";
pub const CONTENT_INVITE: &str = "text/x-msmsgsinvite";
pub const CONTENT_PROFILE: &str = "text/x-msmsgsprofile";

/// Header fields and body of one chat payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MimeMessage {
    headers: Vec<(String, String)>,
    body: String,
}

impl MimeMessage {
    /// A message of the given content type with `MIME-Version: 1.0`.
    pub fn new(content_type: &str) -> Self {
        Self {
            headers: vec![
                ("MIME-Version".into(), "1.0".into()),
                ("Content-Type".into(), content_type.into()),
            ],
            body: String::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Header value, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Media type without parameters, lowercased.
    pub fn content_type(&self) -> Option<String> {
        self.header("Content-Type")
            .map(|value| value.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = String::from_utf8_lossy(bytes);
        let (head, body) = match text.find("\r\n\r\n") {
            Some(pos) => (&text[..pos], &text[pos + 4..]),
            None => match text.find("\n\n") {
                Some(pos) => (&text[..pos], &text[pos + 2..]),
                None => (&text[..], ""),
            },
        };

        let headers = parse_fields(head);
        if headers.is_empty() {
            return Err(ProtocolError::MalformedFrame("chat payload without headers".into()));
        }
        Ok(Self {
            headers,
            body: body.to_string(),
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = String::new();
        for (name, value) in &self.headers {
            let _ = write!(out, "{name}: {value}\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        Bytes::from(out)
    }
}

/// Parse `Name: value` lines. Lines without a colon are skipped.
pub fn parse_fields(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .filter(|(name, _)| !name.is_empty())
        .collect()
}

/// Render fields as `Name: value\r\n` lines followed by a blank line.
pub fn render_fields(fields: &[(String, String)]) -> String {
    let mut out = String::new();
    for (name, value) in fields {
        let _ = write!(out, "{name}: {value}\r\n");
    }
    out.push_str("\r\n");
    out
}

/// A decoded chat payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatMessage {
    /// Plain text, with the sender's optional `X-MMS-IM-Format`.
    Text { text: String, format: Option<String> },
    /// Typing notification.
    Typing { user: Handle },
    /// Invitation sub-protocol fields.
    Invitation(InvitationFields),
    /// Anything else, kept for diagnostics.
    Other { content_type: String },
}

impl ChatMessage {
    pub fn text(text: impl Into<String>) -> Self {
        ChatMessage::Text {
            text: text.into(),
            format: None,
        }
    }

    pub fn from_mime(mime: &MimeMessage) -> Self {
        match mime.content_type().as_deref() {
            Some(CONTENT_TEXT) => ChatMessage::Text {
                text: mime.body().to_string(),
                format: mime.header("X-MMS-IM-Format").map(str::to_string),
            },
            Some(CONTENT_TYPING) => match mime.header("TypingUser") {
                Some(user) => ChatMessage::Typing { user: Handle::new(user) },
                None => ChatMessage::Other {
                    content_type: CONTENT_TYPING.into(),
                },
            },
            Some(CONTENT_INVITE) => ChatMessage::Invitation(InvitationFields::parse(mime.body())),
            other => ChatMessage::Other {
                content_type: other.unwrap_or_default().to_string(),
            },
        }
    }

    pub fn to_mime(&self) -> MimeMessage {
        match self {
            ChatMessage::Text { text, format } => {
                let mime = MimeMessage::new("text/plain; charset=UTF-8");
                let mime = match format {
                    Some(format) => mime.with_header("X-MMS-IM-Format", format.clone()),
                    None => mime,
                };
                mime.with_body(text.clone())
            }
            ChatMessage::Typing { user } => MimeMessage::new(CONTENT_TYPING)
                .with_header("TypingUser", user.as_str())
                .with_body("\r\n"),
            ChatMessage::Invitation(fields) => {
                MimeMessage::new("text/x-msmsgsinvite; charset=UTF-8").with_body(fields.render())
            }
            ChatMessage::Other { content_type } => MimeMessage::new(content_type),
        }
    }

    /// Delivery acknowledgment mode for `MSG`: `A` (always), `N` (on
    /// failure only) or `U` (never).
    pub fn ack_mode(&self) -> &'static str {
        match self {
            ChatMessage::Text { .. } => "A",
            ChatMessage::Typing { .. } => "U",
            ChatMessage::Invitation(_) | ChatMessage::Other { .. } => "N",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_message() {
        let raw = b"MIME-Version: 1.0\r\nContent-Type: text/plain; charset=UTF-8\r\nX-MMS-IM-Format: FN=Arial\r\n\r\nHello there";
        let mime = MimeMessage::parse(raw).unwrap();
        assert_eq!(mime.content_type().as_deref(), Some("text/plain"));
        match ChatMessage::from_mime(&mime) {
            ChatMessage::Text { text, format } => {
                assert_eq!(text, "Hello there");
                assert_eq!(format.as_deref(), Some("FN=Arial"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_typing_notification() {
        let typing = ChatMessage::Typing {
            user: Handle::new("alice@example.com"),
        };
        let mime = MimeMessage::parse(&typing.to_mime().to_bytes()).unwrap();
        assert_eq!(ChatMessage::from_mime(&mime), typing);
        assert_eq!(typing.ack_mode(), "U");
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mime = MimeMessage::new("text/plain").with_header("TypingUser", "x@y.com");
        assert_eq!(mime.header("typinguser"), Some("x@y.com"));
    }

    #[test]
    fn test_unknown_content_type() {
        let mime = MimeMessage::parse(b"MIME-Version: 1.0\r\nContent-Type: text/x-clientcaps\r\n\r\nClient-Name: X").unwrap();
        assert_eq!(
            ChatMessage::from_mime(&mime),
            ChatMessage::Other {
                content_type: "text/x-clientcaps".into()
            }
        );
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(MimeMessage::parse(b"").is_err());
    }
}
