//! Relay envelope classification.
//!
//! Every frame on the relay socket is a JSON object with a top-level `type`
//! tag. Only the tag is interpreted here; payloads of data envelopes are
//! forwarded untouched.

use serde_json::{json, Value};

use crate::bridge::endpoint::{now_ms, Identity};

pub const INVALID_FORMAT: &str = "Invalid message format";
pub const UNKNOWN_COMMAND: &str = "Unknown command type";
pub const UNKNOWN_ROLE: &str = "Unknown client role";

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// `register{client}`: the sender declares its role.
    Register { client: Identity },
    /// `ae_data` / `resolve_data`: forwarded verbatim to the opposite role.
    Data { origin: Identity },
    /// `ping`: answered locally with `pong{timestamp}`.
    Ping,
    /// `get-layers{compName}`
    GetLayers { comp_name: Option<String> },
    /// `render-composition`; the whole request is handed to the command handler.
    RenderComposition { request: Value },
    /// `cancel-render`
    CancelRender,
}

/// Why a frame was rejected. Each maps to one error envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    InvalidFormat,
    UnknownCommand(String),
    UnknownRole(String),
}

impl Rejection {
    pub fn message(&self) -> &'static str {
        match self {
            Rejection::InvalidFormat => INVALID_FORMAT,
            Rejection::UnknownCommand(_) => UNKNOWN_COMMAND,
            Rejection::UnknownRole(_) => UNKNOWN_ROLE,
        }
    }

    /// The `{"error": ...}` frame sent back to the sender.
    pub fn reply(&self) -> String {
        error_reply(self.message())
    }
}

impl Envelope {
    /// The wire tag for data sent by `origin`.
    pub fn data_tag(origin: Identity) -> &'static str {
        match origin {
            Identity::Producer => "ae_data",
            Identity::Consumer => "resolve_data",
        }
    }
}

/// Classify one text frame.
///
/// Malformed JSON is [`Rejection::InvalidFormat`]; valid JSON whose `type` is
/// missing or not in the closed set, or a `register` without a string
/// `client`, is [`Rejection::UnknownCommand`]. A `client` naming neither
/// role is [`Rejection::UnknownRole`].
pub fn classify(text: &str) -> Result<Envelope, Rejection> {
    let value: Value = serde_json::from_str(text).map_err(|_| Rejection::InvalidFormat)?;
    let tag = value.get("type").and_then(Value::as_str).unwrap_or_default();

    let envelope = match tag {
        "register" => {
            // Without a string role there is nothing to register as.
            let Some(role) = value.get("client").and_then(Value::as_str) else {
                return Err(Rejection::UnknownCommand(tag.to_string()));
            };
            let client = match role {
                "ae" => Identity::Producer,
                "resolve" => Identity::Consumer,
                other => return Err(Rejection::UnknownRole(other.to_string())),
            };
            Envelope::Register { client }
        }
        "ae_data" => Envelope::Data { origin: Identity::Producer },
        "resolve_data" => Envelope::Data { origin: Identity::Consumer },
        "ping" => Envelope::Ping,
        "get-layers" => Envelope::GetLayers {
            comp_name: value.get("compName").and_then(Value::as_str).map(str::to_string),
        },
        "render-composition" => Envelope::RenderComposition { request: value },
        "cancel-render" => Envelope::CancelRender,
        other => return Err(Rejection::UnknownCommand(other.to_string())),
    };
    Ok(envelope)
}

pub fn error_reply(message: &str) -> String {
    json!({ "error": message }).to_string()
}

pub fn pong() -> String {
    json!({ "type": "pong", "timestamp": now_ms() }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(r#"{"type":"register","client":"ae"}"#, Envelope::Register { client: Identity::Producer })]
    #[case(r#"{"type":"register","client":"resolve"}"#, Envelope::Register { client: Identity::Consumer })]
    #[case(r#"{"type":"ae_data","data":{"x":1}}"#, Envelope::Data { origin: Identity::Producer })]
    #[case(r#"{"type":"resolve_data","data":[]}"#, Envelope::Data { origin: Identity::Consumer })]
    #[case(r#"{"type":"ping"}"#, Envelope::Ping)]
    #[case(r#"{"type":"cancel-render"}"#, Envelope::CancelRender)]
    fn test_classify_known_types(#[case] text: &str, #[case] expected: Envelope) {
        assert_eq!(classify(text).unwrap(), expected);
    }

    #[test]
    fn test_get_layers_carries_comp_name() {
        let env = classify(r#"{"type":"get-layers","compName":"current"}"#).unwrap();
        assert_eq!(env, Envelope::GetLayers { comp_name: Some("current".into()) });
    }

    #[test]
    fn test_render_keeps_full_request() {
        let env = classify(r#"{"type":"render-composition","compName":"Main"}"#).unwrap();
        match env {
            Envelope::RenderComposition { request } => assert_eq!(request["compName"], "Main"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[rstest]
    #[case("not json")]
    #[case("{\"type\":")]
    #[case("")]
    fn test_malformed_json_is_invalid_format(#[case] text: &str) {
        let err = classify(text).unwrap_err();
        assert_eq!(err, Rejection::InvalidFormat);
        assert_eq!(err.reply(), r#"{"error":"Invalid message format"}"#);
    }

    #[rstest]
    #[case(r#"{"type":"teleport"}"#)]
    #[case(r#"{"payload":1}"#)]
    #[case("42")]
    #[case(r#"{"type":"register"}"#)]
    #[case(r#"{"type":"register","client":null}"#)]
    #[case(r#"{"type":"register","client":1}"#)]
    fn test_unknown_type_is_unknown_command(#[case] text: &str) {
        let err = classify(text).unwrap_err();
        assert!(matches!(err, Rejection::UnknownCommand(_)));
        assert_eq!(err.reply(), r#"{"error":"Unknown command type"}"#);
    }

    #[test]
    fn test_register_with_unknown_role_is_rejected() {
        let err = classify(r#"{"type":"register","client":"premiere"}"#).unwrap_err();
        assert_eq!(err, Rejection::UnknownRole("premiere".into()));
        assert_eq!(err.reply(), r#"{"error":"Unknown client role"}"#);

        let err = classify(r#"{"type":"register","client":""}"#).unwrap_err();
        assert_eq!(err, Rejection::UnknownRole(String::new()));
    }

    #[test]
    fn test_pong_has_timestamp() {
        let v: Value = serde_json::from_str(&pong()).unwrap();
        assert_eq!(v["type"], "pong");
        assert!(v["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_data_tag_by_origin() {
        assert_eq!(Envelope::data_tag(Identity::Producer), "ae_data");
        assert_eq!(Envelope::data_tag(Identity::Consumer), "resolve_data");
    }
}
