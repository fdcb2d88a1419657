//! NIP-01 wire messages.
//!
//! - Client to relay: EVENT, REQ, CLOSE
//! - Relay to client: EVENT, OK, EOSE, CLOSED, NOTICE
//!
//! Both directions parse and serialize so the same types serve the embedded
//! relay and the client transports.

use crate::event::Event;
use crate::filter::Filter;
use serde_json::{Value, json};
use thiserror::Error;

/// Errors that can occur when parsing wire messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(String),
}

/// Messages sent from client to relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["EVENT", <event>]`
    Event(Event),

    /// `["REQ", <subscription_id>, <filter>...]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },

    /// `["CLOSE", <subscription_id>]`
    Close { subscription_id: String },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            ClientMessage::Event(event) => json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = vec![json!("REQ"), json!(subscription_id)];
                for filter in filters {
                    arr.push(serde_json::to_value(filter)?);
                }
                Value::Array(arr)
            }
            ClientMessage::Close { subscription_id } => json!(["CLOSE", subscription_id]),
        };
        Ok(value.to_string())
    }

    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let arr = parse_array(json)?;

        match message_type(&arr)? {
            "EVENT" => {
                let raw = arr
                    .get(1)
                    .ok_or_else(|| MessageError::MissingField("event".to_string()))?;
                let event: Event = serde_json::from_value(raw.clone())?;
                Ok(ClientMessage::Event(event))
            }
            "REQ" => {
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let filters = arr[2..]
                    .iter()
                    .map(|value| serde_json::from_value::<Filter>(value.clone()))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ClientMessage::Req {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => Ok(ClientMessage::Close {
                subscription_id: string_at(&arr, 1, "subscription_id")?,
            }),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }
}

/// Messages sent from relay to client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", <subscription_id>, <event>]`
    Event {
        subscription_id: String,
        event: Event,
    },

    /// `["OK", <event_id>, <accepted>, <message>]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },

    /// `["EOSE", <subscription_id>]`
    Eose { subscription_id: String },

    /// `["CLOSED", <subscription_id>, <message>]`
    Closed {
        subscription_id: String,
        message: String,
    },

    /// `["NOTICE", <message>]`
    Notice { message: String },
}

impl RelayMessage {
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event]),
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
            RelayMessage::Eose { subscription_id } => json!(["EOSE", subscription_id]),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => json!(["CLOSED", subscription_id, message]),
            RelayMessage::Notice { message } => json!(["NOTICE", message]),
        };
        Ok(value.to_string())
    }

    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let arr = parse_array(json)?;

        match message_type(&arr)? {
            "EVENT" => {
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let raw = arr
                    .get(2)
                    .ok_or_else(|| MessageError::MissingField("event".to_string()))?;
                let event: Event = serde_json::from_value(raw.clone())?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                })
            }
            "OK" => {
                let event_id = string_at(&arr, 1, "event_id")?;
                let accepted = arr.get(2).and_then(Value::as_bool).ok_or_else(|| {
                    MessageError::InvalidFormat("accepted flag not a boolean".to_string())
                })?;
                let message = arr.get(3).and_then(Value::as_str).unwrap_or("").to_string();
                Ok(RelayMessage::Ok {
                    event_id,
                    accepted,
                    message,
                })
            }
            "EOSE" => Ok(RelayMessage::Eose {
                subscription_id: string_at(&arr, 1, "subscription_id")?,
            }),
            "CLOSED" => {
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let message = arr.get(2).and_then(Value::as_str).unwrap_or("").to_string();
                Ok(RelayMessage::Closed {
                    subscription_id,
                    message,
                })
            }
            "NOTICE" => Ok(RelayMessage::Notice {
                message: string_at(&arr, 1, "message")?,
            }),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }

    /// Subscription this message belongs to, if any.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            RelayMessage::Event {
                subscription_id, ..
            }
            | RelayMessage::Eose { subscription_id }
            | RelayMessage::Closed {
                subscription_id, ..
            } => Some(subscription_id),
            RelayMessage::Ok { .. } | RelayMessage::Notice { .. } => None,
        }
    }
}

/// Machine-readable prefix of an OK/CLOSED message (`"duplicate"`,
/// `"invalid"`, `"rate-limited"`, ...).
pub fn reason_prefix(message: &str) -> Option<&str> {
    let (prefix, _) = message.split_once(':')?;
    if !prefix.is_empty() && prefix.bytes().all(|b| b.is_ascii_lowercase() || b == b'-') {
        Some(prefix)
    } else {
        None
    }
}

fn parse_array(json: &str) -> Result<Vec<Value>, MessageError> {
    let arr: Vec<Value> =
        serde_json::from_str(json).map_err(|e| MessageError::InvalidFormat(e.to_string()))?;
    if arr.is_empty() {
        return Err(MessageError::InvalidFormat("empty array".to_string()));
    }
    Ok(arr)
}

fn message_type(arr: &[Value]) -> Result<&str, MessageError> {
    arr[0]
        .as_str()
        .ok_or_else(|| MessageError::InvalidFormat("first element not a string".to_string()))
}

fn string_at(arr: &[Value], index: usize, field: &str) -> Result<String, MessageError> {
    arr.get(index)
        .ok_or_else(|| MessageError::MissingField(field.to_string()))?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MessageError::InvalidFormat(format!("{} not a string", field)))
}
