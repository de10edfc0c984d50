/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Nostr wire types used by the crawler: events, relay frames and the relay URL
//! extractor.

pub mod event;
pub mod message;
pub mod relay_extractor;

pub use event::{Event, EventError};
pub use message::{ClientMessage, Filter, MessageError, RelayMessage};
pub use relay_extractor::{extract_relays, normalize_relay_url};
