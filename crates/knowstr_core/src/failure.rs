/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Close code a relay sends to ask crawlers to go away for good.
pub const CLOSE_CODE_GO_AWAY: u16 = 4000;

/// Reasons a crawler session ended abnormally.
///
/// Soft failures stop the crawler without counting against the relay. Hard ones are
/// recorded in the fail counter and error log, and may lead to eviction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrawlFailure {
    #[error("connection closed by peer")]
    PeerClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("unexpected server response: {0}")]
    UnexpectedResponse(u16),

    #[error("subscription {subscription_id} closed by relay: {message}")]
    SubscriptionClosed {
        subscription_id: String,
        message: String,
    },

    #[error("unknown message type: {0}")]
    UnknownMessage(String),

    #[error("connection closed with code {code}: {reason}")]
    ForcedClose { code: u16, reason: String },
}

impl CrawlFailure {
    pub fn is_hard(&self) -> bool {
        !matches!(self, CrawlFailure::PeerClosed)
    }

    /// Whether the relay must also be taken out of rotation.
    pub fn deactivates(&self) -> bool {
        matches!(self, CrawlFailure::ForcedClose { code, .. } if *code == CLOSE_CODE_GO_AWAY)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CrawlFailure::PeerClosed => "PeerClosed",
            CrawlFailure::Transport(_) => "TransportError",
            CrawlFailure::HandshakeTimeout(_) => "HandshakeTimeout",
            CrawlFailure::UnexpectedResponse(_) => "UnexpectedResponse",
            CrawlFailure::SubscriptionClosed { .. } => "ClosedMessage",
            CrawlFailure::UnknownMessage(_) => "UnknownMessage",
            CrawlFailure::ForcedClose { .. } => "ForcedClose",
        }
    }

    /// Serialized entry for the relay's error log.
    pub fn record(&self) -> String {
        let record = ErrorRecord {
            name: self.name(),
            message: self.to_string(),
        };
        serde_json::to_string(&record).unwrap_or_default()
    }
}

#[derive(Serialize)]
struct ErrorRecord {
    name: &'static str,
    message: String,
}

impl From<tungstenite::Error> for CrawlFailure {
    fn from(err: tungstenite::Error) -> Self {
        use tungstenite::error::ProtocolError;
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                CrawlFailure::PeerClosed
            }
            tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                CrawlFailure::PeerClosed
            }
            tungstenite::Error::Io(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                CrawlFailure::PeerClosed
            }
            tungstenite::Error::Http(resp) => CrawlFailure::UnexpectedResponse(resp.status().as_u16()),
            other => CrawlFailure::Transport(other.to_string()),
        }
    }
}
