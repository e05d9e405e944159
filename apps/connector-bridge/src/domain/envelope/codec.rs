//! JSON text codec for envelopes.
//!
//! Decoding inspects the `type` field before deserializing the body, so an
//! unrecognized kind is reported as [`CodecError::UnknownType`] (answered
//! with an `ERROR` envelope) while a known kind with a bad body is
//! [`CodecError::InvalidPayload`] (a protocol violation).

use super::{Envelope, MessageKind};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Text is not a JSON object.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// Object has no string `type` field.
    #[error("envelope has no type")]
    MissingType,

    /// `type` is not a protocol kind.
    #[error("unknown envelope type: {0}")]
    UnknownType(String),

    /// Known kind whose body does not match its schema.
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        /// Kind named by the envelope.
        kind: MessageKind,
        /// Deserialization failure.
        source: serde_json::Error,
    },

    /// Encoding failed.
    #[error("envelope encode error: {0}")]
    Encode(#[source] serde_json::Error),
}

impl CodecError {
    /// Whether the channel may stay open after this error.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::UnknownType(_))
    }
}

/// JSON codec for [`Envelope`].
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    /// Create a codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] describing why the frame is not a valid
    /// envelope.
    pub fn decode(&self, text: &str) -> Result<Envelope, CodecError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))?;

        let serde_json::Value::Object(ref map) = value else {
            return Err(CodecError::Malformed("expected a JSON object".into()));
        };

        let kind = match map.get("type") {
            Some(serde_json::Value::String(name)) => {
                MessageKind::from_wire(name).ok_or_else(|| CodecError::UnknownType(name.clone()))?
            }
            _ => return Err(CodecError::MissingType),
        };

        serde_json::from_value(value).map_err(|source| CodecError::InvalidPayload { kind, source })
    }

    /// Encode one envelope to a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    pub fn encode(&self, envelope: &Envelope) -> Result<String, CodecError> {
        serde_json::to_string(envelope).map_err(CodecError::Encode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::envelope::{TradeCommandPayload, TradeResultPayload};
    use crate::domain::identity::{CorrelationId, IntentId, RemoteRef};
    use crate::domain::trade::Side;
    use rust_decimal_macros::dec;

    #[test]
    fn decodes_trade_result_with_numeric_ticket() {
        let text = r#"{"type":"TRADE_RESULT","correlation_id":"c-1","success":true,"ticket":555}"#;
        let envelope = EnvelopeCodec::new().decode(text).unwrap();

        assert_eq!(
            envelope,
            Envelope::TradeResult(TradeResultPayload {
                correlation_id: CorrelationId::new("c-1"),
                success: true,
                ticket: Some(RemoteRef::new("555")),
                error: None,
                account_id: None,
            })
        );
    }

    #[test]
    fn unknown_type_is_recoverable() {
        let err = EnvelopeCodec::new()
            .decode(r#"{"type":"TRADE_CANCEL","correlation_id":"x"}"#)
            .unwrap_err();
        assert!(matches!(err, CodecError::UnknownType(ref t) if t == "TRADE_CANCEL"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn bad_body_is_not_recoverable() {
        let err = EnvelopeCodec::new()
            .decode(r#"{"type":"TRADE_RESULT","success":"yes"}"#)
            .unwrap_err();
        assert!(matches!(
            err,
            CodecError::InvalidPayload {
                kind: MessageKind::TradeResult,
                ..
            }
        ));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn rejects_non_objects_and_missing_type() {
        let codec = EnvelopeCodec::new();
        assert!(matches!(codec.decode("not json"), Err(CodecError::Malformed(_))));
        assert!(matches!(codec.decode("[1,2]"), Err(CodecError::Malformed(_))));
        assert!(matches!(codec.decode(r#"{"kind":"PING"}"#), Err(CodecError::MissingType)));
        assert!(matches!(codec.decode(r#"{"type":7}"#), Err(CodecError::MissingType)));
    }

    #[test]
    fn encoded_command_decodes_to_same_envelope() {
        let codec = EnvelopeCodec::new();
        let envelope = Envelope::TradeOpen(TradeCommandPayload {
            correlation_id: CorrelationId::new("c-2"),
            intent_id: IntentId::new("i-2"),
            instrument: Some("EURUSD".into()),
            side: Some(Side::Buy),
            size: Some(dec!(0.1)),
            stop_loss: None,
            take_profit: None,
            ticket: None,
        });
        let text = codec.encode(&envelope).unwrap();

        assert!(text.contains(r#""type":"TRADE_OPEN""#));
        assert_eq!(codec.decode(&text).unwrap(), envelope);
    }

    #[test]
    fn bare_request_decodes_without_body() {
        let envelope = EnvelopeCodec::new().decode(r#"{"type":"GET_CONNECTIONS"}"#).unwrap();
        assert_eq!(envelope.kind(), MessageKind::GetConnections);
    }
}
