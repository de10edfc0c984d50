/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use secp256k1::{schnorr::Signature, Keypair, Message, SecretKey, XOnlyPublicKey, SECP256K1};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const KIND_CONTACT_LIST: u32 = 3;
pub const KIND_RELAY_LIST_METADATA: u32 = 10002;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("event id does not match its content")]
    IdMismatch,

    #[error("bad key or signature: {0}")]
    Crypto(#[from] secp256k1::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A signed Nostr event as delivered by a relay.
///
/// Tag values are kept as raw JSON so that a relay sending a malformed tag does not
/// make the whole frame undecodable; consumers skip values they cannot use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    #[serde(default)]
    pub tags: Vec<Vec<Value>>,
    #[serde(default)]
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Signs a new event with `secret_key`, filling in `pubkey`, `id` and `sig`.
    pub fn finalize(
        secret_key: &SecretKey,
        created_at: i64,
        kind: u32,
        tags: Vec<Vec<Value>>,
        content: impl Into<String>,
    ) -> Result<Self, EventError> {
        let keypair = Keypair::from_secret_key(SECP256K1, secret_key);
        let (pubkey, _) = keypair.x_only_public_key();
        let mut event = Event {
            id: String::new(),
            pubkey: hex::encode(pubkey.serialize()),
            created_at,
            kind,
            tags,
            content: content.into(),
            sig: String::new(),
        };
        let digest = event.digest()?;
        let sig = SECP256K1.sign_schnorr_no_aux_rand(&Message::from_digest(digest), &keypair);
        event.id = hex::encode(digest);
        event.sig = hex::encode(sig.serialize());
        Ok(event)
    }

    /// Checks that `id` is the hash of the event body and `sig` a valid Schnorr
    /// signature of it by `pubkey`.
    pub fn verify(&self) -> Result<(), EventError> {
        let digest = self.digest()?;
        if hex::encode(digest) != self.id {
            return Err(EventError::IdMismatch);
        }
        let pubkey = XOnlyPublicKey::from_slice(&hex::decode(&self.pubkey)?)?;
        let sig = Signature::from_slice(&hex::decode(&self.sig)?)?;
        SECP256K1.verify_schnorr(&sig, &Message::from_digest(digest), &pubkey)?;
        Ok(())
    }

    /// Values of tags named `name` at position `index`, skipping non-string values.
    pub fn tag_values<'a>(&'a self, name: &'a str, index: usize) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.first().and_then(Value::as_str) == Some(name))
            .filter_map(move |t| t.get(index).and_then(Value::as_str))
    }

    // [0, pubkey, created_at, kind, tags, content]
    fn digest(&self) -> Result<[u8; 32], EventError> {
        let body = serde_json::to_string(&(
            0,
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ))?;
        Ok(Sha256::digest(body.as_bytes()).into())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn signed(created_at: i64, kind: u32, tags: Vec<Vec<Value>>, content: &str) -> Event {
        let sk = SecretKey::from_slice(&[7u8; 32]).unwrap();
        Event::finalize(&sk, created_at, kind, tags, content).unwrap()
    }

    #[test]
    fn finalized_event_verifies() {
        let event = signed(1_700_000_000, 1, vec![vec![json!("t"), json!("nostr")]], "hello");
        assert_eq!(event.id.len(), 64);
        assert_eq!(event.sig.len(), 128);
        event.verify().unwrap();
    }

    #[test]
    fn tampered_content_is_rejected() {
        let mut event = signed(1_700_000_000, 1, vec![], "hello");
        event.content = "bye".to_string();
        assert!(matches!(event.verify(), Err(EventError::IdMismatch)));
    }

    #[test]
    fn forged_signature_is_rejected() {
        let mut event = signed(1_700_000_000, 1, vec![], "hello");
        let other = signed(1_700_000_001, 1, vec![], "hello");
        event.sig = other.sig;
        assert!(matches!(event.verify(), Err(EventError::Crypto(_))));
    }

    #[test]
    fn tag_values_skip_non_strings() {
        let event = signed(
            1,
            1,
            vec![
                vec![json!("e"), json!("abc"), json!("wss://a.example")],
                vec![json!("e"), json!("abc"), json!(42)],
                vec![json!("p"), json!("def")],
            ],
            "",
        );
        let found: Vec<_> = event.tag_values("e", 2).collect();
        assert_eq!(found, vec!["wss://a.example"]);
    }
}
