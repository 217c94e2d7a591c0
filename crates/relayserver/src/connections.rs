// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Index of live peer connections

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::RwLock;

use crate::socket::{ConnectionId, SocketHandle};

/// A connection subscribed as `peer_id` to `topic`.
#[derive(Clone)]
pub struct ConnectionInfo {
    pub peer_id: String,
    pub topic: String,
    pub socket: SocketHandle,
}

impl ConnectionInfo {
    pub fn new(peer_id: impl Into<String>, topic: impl Into<String>, socket: SocketHandle) -> Self {
        Self {
            peer_id: peer_id.into(),
            topic: topic.into(),
            socket,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.socket.id()
    }

    fn pair(&self) -> Pair {
        (self.peer_id.clone(), self.topic.clone())
    }
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("peer_id", &self.peer_id)
            .field("topic", &self.topic)
            .field("connection", &self.socket.id())
            .finish()
    }
}

type Pair = (String, String);

/// Live connections, keyed by `(peer_id, topic)` and reachable by peer, topic or socket.
///
/// All indexes sit behind one lock, so an entry is visible through every lookup or through
/// none. Lookups return snapshots.
#[derive(Default)]
pub struct ConnectionRegistry {
    indexes: RwLock<Indexes>,
}

#[derive(Default)]
struct Indexes {
    by_pair: HashMap<Pair, ConnectionInfo>,
    /// peer id -> topics
    by_peer: HashMap<String, HashSet<String>>,
    /// topic -> peer ids
    by_topic: HashMap<String, HashSet<String>>,
    by_socket: HashMap<ConnectionId, HashSet<Pair>>,
}

impl Indexes {
    fn remove_pair(&mut self, pair: &Pair) -> Option<ConnectionInfo> {
        let info = self.by_pair.remove(pair)?;
        let (peer_id, topic) = pair;
        remove_from_set(&mut self.by_peer, peer_id, topic);
        remove_from_set(&mut self.by_topic, topic, peer_id);
        remove_from_set(&mut self.by_socket, &info.connection_id(), pair);
        Some(info)
    }

    fn collect(&self, pairs: impl IntoIterator<Item = Pair>) -> Vec<ConnectionInfo> {
        pairs
            .into_iter()
            .filter_map(|pair| self.by_pair.get(&pair).cloned())
            .collect()
    }
}

fn remove_from_set<K, V>(map: &mut HashMap<K, HashSet<V>>, key: &K, value: &V)
where
    K: Eq + std::hash::Hash,
    V: Eq + std::hash::Hash,
{
    if let Some(set) = map.get_mut(key) {
        set.remove(value);
        if set.is_empty() {
            map.remove(key);
        }
    }
}

impl ConnectionRegistry {
    /// Registers `info`, returning the entry it replaced for the same `(peer_id, topic)`.
    ///
    /// The replaced connection is dropped from every index but not closed.
    pub fn add(&self, info: ConnectionInfo) -> Option<ConnectionInfo> {
        let pair = info.pair();
        let mut indexes = self.indexes.write().unwrap();
        let replaced = indexes.remove_pair(&pair);

        indexes
            .by_peer
            .entry(info.peer_id.clone())
            .or_default()
            .insert(info.topic.clone());
        indexes
            .by_topic
            .entry(info.topic.clone())
            .or_default()
            .insert(info.peer_id.clone());
        indexes
            .by_socket
            .entry(info.connection_id())
            .or_default()
            .insert(pair.clone());
        indexes.by_pair.insert(pair, info);
        replaced
    }

    /// Removes every registration made through `socket`.
    pub fn remove_by_socket(&self, socket: ConnectionId) -> Vec<ConnectionInfo> {
        let mut indexes = self.indexes.write().unwrap();
        let pairs = indexes.by_socket.remove(&socket).unwrap_or_default();
        pairs
            .iter()
            .filter_map(|pair| indexes.remove_pair(pair))
            .collect()
    }

    pub fn remove_by_peer_and_topic(&self, peer_id: &str, topic: &str) -> Option<ConnectionInfo> {
        let pair = (peer_id.to_owned(), topic.to_owned());
        self.indexes.write().unwrap().remove_pair(&pair)
    }

    pub fn remove_by_peer_id(&self, peer_id: &str) -> Vec<ConnectionInfo> {
        let mut indexes = self.indexes.write().unwrap();
        let topics = indexes.by_peer.get(peer_id).cloned().unwrap_or_default();
        topics
            .into_iter()
            .filter_map(|topic| indexes.remove_pair(&(peer_id.to_owned(), topic)))
            .collect()
    }

    pub fn find_by_peer_id(&self, peer_id: &str) -> Vec<ConnectionInfo> {
        let indexes = self.indexes.read().unwrap();
        let Some(topics) = indexes.by_peer.get(peer_id) else {
            return vec![];
        };
        indexes.collect(topics.iter().map(|topic| (peer_id.to_owned(), topic.clone())))
    }

    pub fn find_by_topic(&self, topic: &str) -> Vec<ConnectionInfo> {
        let indexes = self.indexes.read().unwrap();
        let Some(peers) = indexes.by_topic.get(topic) else {
            return vec![];
        };
        indexes.collect(peers.iter().map(|peer_id| (peer_id.clone(), topic.to_owned())))
    }

    pub fn find_by_peer_and_topic(&self, peer_id: &str, topic: &str) -> Option<ConnectionInfo> {
        let pair = (peer_id.to_owned(), topic.to_owned());
        self.indexes.read().unwrap().by_pair.get(&pair).cloned()
    }

    pub fn find_by_socket(&self, socket: ConnectionId) -> Vec<ConnectionInfo> {
        let indexes = self.indexes.read().unwrap();
        let Some(pairs) = indexes.by_socket.get(&socket) else {
            return vec![];
        };
        indexes.collect(pairs.iter().cloned())
    }

    /// Number of `(peer_id, topic)` registrations.
    pub fn size(&self) -> usize {
        self.indexes.read().unwrap().by_pair.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn clear(&self) {
        *self.indexes.write().unwrap() = Indexes::default();
    }
}
