use serde::{Deserialize, Serialize};

/// Plaintext carried inside an encrypted application message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApplicationPayload {
    Text(TextMessage),
    /// In-band control traffic consumed by the session manager itself.
    System(SystemMessage),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMessage {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SystemMessage {
    /// The sender's confirmation tag after merging `epoch`.
    ConfirmationTag {
        epoch: u64,
        #[serde(with = "crate::codec::base64_bytes")]
        tag: Vec<u8>,
    },
}

impl ApplicationPayload {
    pub fn text(text: impl Into<String>) -> Self {
        ApplicationPayload::Text(TextMessage { text: text.into() })
    }

    pub fn confirmation_tag(epoch: u64, tag: Vec<u8>) -> Self {
        ApplicationPayload::System(SystemMessage::ConfirmationTag { epoch, tag })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// What a decrypted application message turned out to contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedPayload {
    Structured(ApplicationPayload),
    /// Plaintext from a client that does not wrap its messages.
    Opaque(Vec<u8>),
}

impl ParsedPayload {
    /// Attempt to parse a structured payload, falling back to opaque bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match serde_json::from_slice::<ApplicationPayload>(bytes) {
            Ok(payload) => ParsedPayload::Structured(payload),
            Err(_) => ParsedPayload::Opaque(bytes.to_vec()),
        }
    }
}

/// Content delivered to subscribers for an application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    Opaque(Vec<u8>),
    /// Stand-in for a message that could not be decrypted.
    Undecryptable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_message_wire_format() {
        let payload = ApplicationPayload::confirmation_tag(4, vec![0xAA, 0xBB]);
        let json: serde_json::Value =
            serde_json::from_slice(&payload.to_bytes().unwrap()).unwrap();
        assert_eq!(json["type"], "system");
        assert_eq!(json["kind"], "confirmation_tag");
        assert_eq!(json["epoch"], 4);
        assert_eq!(json["tag"], "qrs=");
    }

    #[test]
    fn test_parse_structured_text() {
        let bytes = ApplicationPayload::text("hello").to_bytes().unwrap();
        match ParsedPayload::from_bytes(&bytes) {
            ParsedPayload::Structured(ApplicationPayload::Text(t)) => assert_eq!(t.text, "hello"),
            other => panic!("expected text payload, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_falls_back_to_opaque() {
        let parsed = ParsedPayload::from_bytes(b"plain old bytes");
        assert_eq!(parsed, ParsedPayload::Opaque(b"plain old bytes".to_vec()));
    }
}
