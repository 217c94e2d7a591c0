// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Index of which peer claims to hold which blob

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use relay_types::PeerMessage;

/// Identity of a claim: one peer, one blob key, one topic.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ClaimId {
    peer_id: String,
    key: String,
    topic: String,
}

impl From<&PeerMessage> for ClaimId {
    fn from(claim: &PeerMessage) -> Self {
        Self {
            peer_id: claim.peer_id.clone(),
            key: claim.message.key.clone(),
            topic: claim.message.topic.clone(),
        }
    }
}

#[derive(Default)]
struct Claims {
    all: HashMap<ClaimId, PeerMessage>,
    by_key: HashMap<String, HashSet<ClaimId>>,
    by_peer: HashMap<String, HashSet<ClaimId>>,
    by_topic: HashMap<String, HashSet<ClaimId>>,
}

impl Claims {
    fn remove(&mut self, id: &ClaimId) -> Option<PeerMessage> {
        let claim = self.all.remove(id)?;
        unindex(&mut self.by_key, &id.key, id);
        unindex(&mut self.by_peer, &id.peer_id, id);
        unindex(&mut self.by_topic, &id.topic, id);
        Some(claim)
    }

    fn collect<'a>(&self, ids: impl IntoIterator<Item = &'a ClaimId>) -> Vec<PeerMessage> {
        ids.into_iter()
            .filter_map(|id| self.all.get(id).cloned())
            .collect()
    }
}

fn unindex(map: &mut HashMap<String, HashSet<ClaimId>>, key: &str, id: &ClaimId) {
    if let Some(ids) = map.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            map.remove(key);
        }
    }
}

/// Claims of the form "peer X holds blob K", indexed by key, peer and topic.
#[derive(Default)]
pub struct PeerMessageRegistry {
    claims: RwLock<Claims>,
}

impl PeerMessageRegistry {
    /// Records `claim`. Returns `false`, leaving everything untouched, if that peer already
    /// claims the same key in the same topic.
    pub fn add(&self, claim: PeerMessage) -> bool {
        let id = ClaimId::from(&claim);
        let mut claims = self.claims.write().unwrap();
        if claims.all.contains_key(&id) {
            return false;
        }
        claims.by_key.entry(id.key.clone()).or_default().insert(id.clone());
        claims
            .by_peer
            .entry(id.peer_id.clone())
            .or_default()
            .insert(id.clone());
        claims
            .by_topic
            .entry(id.topic.clone())
            .or_default()
            .insert(id.clone());
        claims.all.insert(id, claim);
        true
    }

    /// Whether `peer_id` claims anything at all.
    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.claims.read().unwrap().by_peer.contains_key(peer_id)
    }

    /// Drops every claim made by `peer_id`, returning how many there were.
    pub fn remove_by_peer_id(&self, peer_id: &str) -> usize {
        let mut claims = self.claims.write().unwrap();
        let ids = claims.by_peer.get(peer_id).cloned().unwrap_or_default();
        ids.iter().filter(|id| claims.remove(id).is_some()).count()
    }

    pub fn remove(&self, claim: &PeerMessage) -> bool {
        let id = ClaimId::from(claim);
        self.claims.write().unwrap().remove(&id).is_some()
    }

    pub fn find_by_key(&self, key: &str) -> Vec<PeerMessage> {
        let claims = self.claims.read().unwrap();
        claims
            .by_key
            .get(key)
            .map(|ids| claims.collect(ids))
            .unwrap_or_default()
    }

    pub fn find_by_peer_id(&self, peer_id: &str) -> Vec<PeerMessage> {
        let claims = self.claims.read().unwrap();
        claims
            .by_peer
            .get(peer_id)
            .map(|ids| claims.collect(ids))
            .unwrap_or_default()
    }

    /// Claims in `topic`, oldest message first. Ties are ordered by key, then peer.
    pub fn find_by_topic(&self, topic: &str) -> Vec<PeerMessage> {
        let mut found = {
            let claims = self.claims.read().unwrap();
            claims
                .by_topic
                .get(topic)
                .map(|ids| claims.collect(ids))
                .unwrap_or_default()
        };
        found.sort_by(|a, b| {
            (a.message.timestamp, &a.message.key, &a.peer_id).cmp(&(
                b.message.timestamp,
                &b.message.key,
                &b.peer_id,
            ))
        });
        found
    }

    /// Whether relaying blob `key` to `peer_id` would be redundant.
    pub fn has_message(&self, peer_id: &str, key: &str) -> bool {
        let claims = self.claims.read().unwrap();
        claims
            .by_key
            .get(key)
            .is_some_and(|ids| ids.iter().any(|id| id.peer_id == peer_id))
    }

    pub fn size(&self) -> usize {
        self.claims.read().unwrap().all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn clear(&self) {
        *self.claims.write().unwrap() = Claims::default();
    }

    pub fn get_all(&self) -> Vec<PeerMessage> {
        self.claims.read().unwrap().all.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use relay_types::Message;

    fn message(key: &str, topic: &str, timestamp: i64) -> Message {
        Message {
            key: key.into(),
            name: format!("{key}.jpg"),
            content_type: "image/jpeg".into(),
            length: 10,
            topic: topic.into(),
            alias: "alice".into(),
            timestamp,
        }
    }

    fn claim(peer_id: &str, key: &str, topic: &str, timestamp: i64) -> PeerMessage {
        PeerMessage::new(peer_id, message(key, topic, timestamp))
    }

    #[test]
    fn duplicate_claims_are_ignored() {
        let registry = PeerMessageRegistry::default();
        assert!(registry.add(claim("p1", "k1", "pics", 1)));
        assert!(!registry.add(claim("p1", "k1", "pics", 99)));
        assert_eq!(registry.size(), 1);
        // The first claim's metadata is kept
        assert_eq!(registry.find_by_key("k1")[0].message.timestamp, 1);

        assert!(registry.add(claim("p2", "k1", "pics", 1)));
        assert!(registry.add(claim("p1", "k1", "docs", 1)));
        assert_eq!(registry.size(), 3);
        assert_eq!(registry.find_by_key("k1").len(), 3);
    }

    #[test]
    fn topic_claims_come_oldest_first() {
        let registry = PeerMessageRegistry::default();
        registry.add(claim("p1", "k30", "pics", 30));
        registry.add(claim("p2", "k10", "pics", 10));
        registry.add(claim("p1", "k20", "pics", 20));
        registry.add(claim("p1", "other", "docs", 5));

        let timestamps: Vec<_> = registry
            .find_by_topic("pics")
            .iter()
            .map(|c| c.message.timestamp)
            .collect();
        assert_eq!(timestamps, vec![10, 20, 30]);
        assert!(registry.find_by_topic("music").is_empty());
    }

    #[test]
    fn knows_who_has_what() {
        let registry = PeerMessageRegistry::default();
        registry.add(claim("p1", "k1", "pics", 1));

        assert!(registry.has_message("p1", "k1"));
        assert!(!registry.has_message("p2", "k1"));
        assert!(!registry.has_message("p1", "k2"));
        assert!(registry.has_peer("p1"));
        assert!(!registry.has_peer("p2"));
    }

    #[test]
    fn removes_claims_from_every_index() {
        let registry = PeerMessageRegistry::default();
        registry.add(claim("p1", "k1", "pics", 1));
        registry.add(claim("p1", "k2", "docs", 2));
        registry.add(claim("p2", "k1", "pics", 1));

        assert!(registry.remove(&claim("p2", "k1", "pics", 1)));
        assert!(!registry.remove(&claim("p2", "k1", "pics", 1)));
        assert_eq!(registry.find_by_key("k1").len(), 1);

        assert_eq!(registry.remove_by_peer_id("p1"), 2);
        assert_eq!(registry.remove_by_peer_id("p1"), 0);
        assert!(registry.is_empty());
        assert!(!registry.has_peer("p1"));
        assert!(registry.find_by_topic("pics").is_empty());
        assert!(registry.find_by_key("k2").is_empty());
    }

    #[test]
    fn lists_and_clears_everything() {
        let registry = PeerMessageRegistry::default();
        registry.add(claim("p1", "k1", "pics", 1));
        registry.add(claim("p2", "k2", "pics", 2));
        assert_eq!(registry.get_all().len(), 2);
        assert_eq!(registry.find_by_peer_id("p2")[0].message.key, "k2");

        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.get_all().is_empty());
    }
}
