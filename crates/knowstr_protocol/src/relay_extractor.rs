/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::BTreeSet;

use serde_json::Value;
use url::Url;

use crate::event::{Event, KIND_CONTACT_LIST, KIND_RELAY_LIST_METADATA};

const REFERENCE_TAGS: [&str; 3] = ["a", "e", "p"];
const RELAY_SCHEMES: [&str; 4] = ["ws", "wss", "http", "https"];

/// Collects normalized relay URLs referenced by a batch of events.
///
/// Sources: the relay hint of `a`/`e`/`p` tags, `r` tags of relay list metadata
/// (kind 10002) and the keys of a contact list (kind 3) content object. Anything that
/// does not look like a relay URL is dropped without error.
pub fn extract_relays(events: &[Event]) -> Vec<String> {
    let mut candidates: Vec<&str> = Vec::new();

    for event in events {
        for name in REFERENCE_TAGS {
            candidates.extend(event.tag_values(name, 2));
        }
        if event.kind == KIND_RELAY_LIST_METADATA {
            candidates.extend(event.tag_values("r", 1));
        }
    }

    let mut contact_keys: Vec<String> = Vec::new();
    for event in events.iter().filter(|e| e.kind == KIND_CONTACT_LIST) {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&event.content) {
            contact_keys.extend(map.into_iter().map(|(k, _)| k));
        }
    }
    candidates.extend(contact_keys.iter().map(String::as_str));

    let normalized: BTreeSet<String> = candidates
        .into_iter()
        .flat_map(|raw| raw.split(|c: char| c == ',' || c.is_whitespace()))
        .filter_map(normalize)
        .collect();

    normalized.into_iter().filter(|url| is_relay_url(url)).collect()
}

/// Normalizes a single operator-supplied relay URL, or rejects it.
pub fn normalize_relay_url(raw: &str) -> Option<String> {
    normalize(raw).filter(|url| is_relay_url(url))
}

fn normalize(raw: &str) -> Option<String> {
    let url = raw.trim().to_lowercase();
    let url = url.trim_end_matches('/');
    if url.is_empty() {
        None
    } else {
        Some(url.to_string())
    }
}

fn is_relay_url(candidate: &str) -> bool {
    match Url::parse(candidate) {
        Ok(url) => {
            RELAY_SCHEMES.contains(&url.scheme()) && url.host_str().is_some_and(|h| !h.is_empty())
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::signed;
    use serde_json::json;

    #[test]
    fn relay_list_metadata_yields_recommended_relays() {
        let event = signed(
            1,
            KIND_RELAY_LIST_METADATA,
            vec![vec![json!("r"), json!("wss://a.example")]],
            "",
        );
        assert_eq!(extract_relays(&[event]), vec!["wss://a.example".to_string()]);
    }

    #[test]
    fn single_urls_normalize() {
        assert_eq!(
            normalize_relay_url(" WSS://Relay.Example/ ").as_deref(),
            Some("wss://relay.example")
        );
        assert_eq!(normalize_relay_url("ftp://relay.example"), None);
        assert_eq!(normalize_relay_url("relay.example"), None);
    }

    #[test]
    fn r_tags_only_count_for_relay_lists() {
        let event = signed(1, 1, vec![vec![json!("r"), json!("wss://a.example")]], "");
        assert!(extract_relays(&[event]).is_empty());
    }

    #[test]
    fn non_string_tag_values_are_skipped() {
        let event = signed(
            1,
            1,
            vec![
                vec![json!("e"), json!("id"), json!({"url": "wss://x.example"})],
                vec![json!("p"), json!("pk"), json!("wss://b.example")],
            ],
            "",
        );
        assert_eq!(extract_relays(&[event]), vec!["wss://b.example".to_string()]);
    }

    #[test]
    fn duplicates_collapse_after_normalization() {
        let a = signed(1, 1, vec![vec![json!("e"), json!("x"), json!("wss://A.example/")]], "");
        let b = signed(2, 1, vec![vec![json!("p"), json!("y"), json!(" wss://a.example ")]], "");
        assert_eq!(extract_relays(&[a, b]), vec!["wss://a.example".to_string()]);
    }

    #[test]
    fn contact_list_keys_are_candidates() {
        let content = json!({
            "wss://c.example/": {"read": true, "write": true},
            "not a url": {},
        })
        .to_string();
        let event = signed(1, KIND_CONTACT_LIST, vec![], &content);
        assert_eq!(extract_relays(&[event]), vec!["wss://c.example".to_string()]);
    }

    #[test]
    fn contact_list_with_plain_content_is_ignored() {
        let event = signed(1, KIND_CONTACT_LIST, vec![], "just text");
        assert!(extract_relays(&[event]).is_empty());
    }

    #[test]
    fn packed_values_are_split_and_schemes_checked() {
        let event = signed(
            1,
            1,
            vec![vec![
                json!("e"),
                json!("x"),
                json!("wss://d.example,wss://e.example\nftp://f.example ws://"),
            ]],
            "",
        );
        assert_eq!(
            extract_relays(&[event]),
            vec!["wss://d.example".to_string(), "wss://e.example".to_string()]
        );
    }
}
