//! Wire codec: envelopes are flat JSON objects, one per datagram or TCP exchange.

use serde::Serialize;

use crate::protocol::{Command, Envelope};

/// Largest datagram the dispatcher will try to decode.
pub const MAX_DATAGRAM_LEN: usize = 64 * 1024;

/// Encode an envelope as compact JSON.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    encode_message(envelope)
}

/// Encode any wire message (envelope or bootstrap broadcast) as compact JSON.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>, WireError> {
    serde_json::to_vec(message).map_err(WireError::Malformed)
}

/// Decode an envelope without interpreting its command.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, WireError> {
    if bytes.len() > MAX_DATAGRAM_LEN {
        return Err(WireError::TooLarge);
    }
    serde_json::from_slice(bytes).map_err(WireError::Malformed)
}

/// An inbound command, validated once at decode time.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub command: Command,
    /// `Server ID` exactly as received; compared against the stored id without normalization.
    pub server_id: Option<String>,
    /// Sender's `Provider`, logged with the command.
    pub provider: Option<String>,
}

impl Request {
    /// Build a request locally (startup Refresh, tests).
    pub fn new(command: Command, server_id: Option<&str>) -> Self {
        Self {
            command,
            server_id: server_id.map(str::to_string),
            provider: None,
        }
    }
}

/// Decode a datagram into a typed request.
pub fn decode_request(bytes: &[u8]) -> Result<Request, WireError> {
    let envelope = decode_envelope(bytes)?;
    let verb = envelope.command.ok_or(WireError::MissingCommand)?;
    let command = verb
        .parse::<Command>()
        .map_err(|e| WireError::UnknownCommand(e.0))?;
    Ok(Request {
        command,
        server_id: envelope.server_id.filter(|s| !s.is_empty()),
        provider: envelope.provider,
    })
}

/// Error decoding or encoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("datagram too large")]
    TooLarge,
    #[error("envelope has no Command")]
    MissingCommand,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BootstrapRequest;

    #[test]
    fn decodes_guarded_command() {
        let raw = br#"{"Provider":"Controller","Command":"Remove","Server ID":"ABCDEFGHJKLMNPQ"}"#;
        let req = decode_request(raw).unwrap();
        assert_eq!(req.command, Command::Remove);
        assert_eq!(req.server_id.as_deref(), Some("ABCDEFGHJKLMNPQ"));
        assert_eq!(req.provider.as_deref(), Some("Controller"));
    }

    #[test]
    fn extra_fields_are_tolerated() {
        let raw = br#"{"Command":"Discover","Reply Port":40000,"Parameter":{"x":1}}"#;
        let req = decode_request(raw).unwrap();
        assert_eq!(req.command, Command::Discover);
        assert!(req.server_id.is_none());
        assert!(req.provider.is_none());
    }

    #[test]
    fn bootstrap_broadcast_is_not_a_command() {
        let bytes = encode_message(&BootstrapRequest::new(50123)).unwrap();
        assert!(decode_request(&bytes).is_err());
        let bare = br#"{"Orchestrator":"Discover"}"#;
        assert!(decode_request(bare).is_err());
    }

    #[test]
    fn empty_server_id_is_absent() {
        let req = decode_request(br#"{"Command":"Refresh","Server ID":""}"#).unwrap();
        assert!(req.server_id.is_none());
    }

    #[test]
    fn noise_is_malformed() {
        assert!(matches!(
            decode_request(b"\x00\x01garbage"),
            Err(WireError::Malformed(_))
        ));
        assert!(matches!(decode_request(b"[1,2]"), Err(WireError::Malformed(_))));
        assert!(matches!(decode_request(b""), Err(WireError::Malformed(_))));
    }

    #[test]
    fn missing_and_unknown_commands() {
        assert!(matches!(
            decode_request(br#"{"Server ID":"ABCDEFGHJKLMNPQ"}"#),
            Err(WireError::MissingCommand)
        ));
        match decode_request(br#"{"Command":"remove"}"#) {
            Err(WireError::UnknownCommand(v)) => assert_eq!(v, "remove"),
            other => panic!("expected UnknownCommand, got {:?}", other),
        }
    }

    #[test]
    fn oversized_datagram_rejected() {
        let big = vec![b' '; MAX_DATAGRAM_LEN + 1];
        assert!(matches!(decode_envelope(&big), Err(WireError::TooLarge)));
    }

    #[test]
    fn encode_then_decode_request() {
        let mut env = Envelope::from_device(Command::Pull);
        env.server_id = Some("ABCDEFGHJKLMNPQ".into());
        let bytes = encode_envelope(&env).unwrap();
        let req = decode_request(&bytes).unwrap();
        assert_eq!(req.command, Command::Pull);
        assert_eq!(req.provider.as_deref(), Some("Orchestrator"));
    }
}
