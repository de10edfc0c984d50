/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::{Event, EventError};

pub type Filter = Map<String, Value>;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid event: {0}")]
    InvalidEvent(#[from] EventError),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Commands sent from the crawler to a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close {
        subscription_id: String,
    },
}

impl ClientMessage {
    pub fn req(subscription_id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self::Req {
            subscription_id: subscription_id.into(),
            filters,
        }
    }

    pub fn close(subscription_id: impl Into<String>) -> Self {
        Self::Close {
            subscription_id: subscription_id.into(),
        }
    }

    pub fn to_json(&self) -> String {
        let value = match self {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = Vec::with_capacity(filters.len() + 2);
                arr.push(Value::String("REQ".to_string()));
                arr.push(Value::String(subscription_id.clone()));
                arr.extend(filters.iter().cloned().map(Value::Object));
                Value::Array(arr)
            }
            ClientMessage::Close { subscription_id } => {
                serde_json::json!(["CLOSE", subscription_id])
            }
        };
        value.to_string()
    }
}

/// Frames received from a relay.
///
/// `Notice`, `Ok`, `Count` and `Auth` carry no payload because the crawler only
/// observes them.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Event,
    },
    Eose {
        subscription_id: String,
    },
    Closed {
        subscription_id: String,
        message: String,
    },
    Notice {
        message: String,
    },
    Ok,
    Count,
    Auth,
    Unknown {
        command: String,
    },
}

impl RelayMessage {
    /// Parses a raw text frame.
    ///
    /// An `Err` means the frame must be discarded: bad JSON, a non-array payload, or
    /// an EVENT whose id or signature does not verify. Commands outside the handled
    /// set parse to [`RelayMessage::Unknown`].
    pub fn parse(frame: &str) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_str(frame)?;
        let Value::Array(mut arr) = value else {
            return Err(MessageError::Malformed("frame is not an array".to_string()));
        };
        let command = arr
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| MessageError::Malformed("command is not a string".to_string()))?
            .to_string();

        let msg = match command.as_str() {
            "EVENT" => {
                if arr.len() < 3 {
                    return Err(MessageError::MissingField("event"));
                }
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let event: Event = serde_json::from_value(arr.swap_remove(2))?;
                event.verify()?;
                RelayMessage::Event {
                    subscription_id,
                    event,
                }
            }
            "EOSE" => RelayMessage::Eose {
                subscription_id: string_at(&arr, 1, "subscription_id")?,
            },
            "CLOSED" => RelayMessage::Closed {
                subscription_id: string_at(&arr, 1, "subscription_id")?,
                message: arr.get(2).and_then(Value::as_str).unwrap_or_default().to_string(),
            },
            "NOTICE" => RelayMessage::Notice {
                message: arr.get(1).and_then(Value::as_str).unwrap_or_default().to_string(),
            },
            "OK" => RelayMessage::Ok,
            "COUNT" => RelayMessage::Count,
            "AUTH" => RelayMessage::Auth,
            _ => RelayMessage::Unknown { command },
        };
        Ok(msg)
    }
}

fn string_at(arr: &[Value], index: usize, field: &'static str) -> Result<String, MessageError> {
    arr.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(MessageError::MissingField(field))
}
