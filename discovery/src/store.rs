use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use crate::peer::{Peer, Topic, PEER_WIRE_LEN};

struct Entry {

    peer: Peer,

    // Cached wire encoding, computed once at insert.
    wire: [u8; PEER_WIRE_LEN],

    added: Instant,

}

// Bounded, TTL-evicting collection of (topic -> set of peers).
//
// Peers keep their insertion order within a topic. Expired entries are
// purged lazily when their topic is read. When `limit` is reached the
// globally oldest entry is evicted, tracked through `order`; refreshing
// a peer leaves a stale queue entry behind, detected by its timestamp.
pub struct PeerStore {

    ttl: Option<Duration>,

    limit: usize,

    topics: HashMap<Topic, Vec<Entry>>,

    order: VecDeque<(Topic, Peer, Instant)>,

    len: usize,

}

impl PeerStore {

    pub fn new(ttl: Option<Duration>, limit: usize) -> Self {
        Self {
            ttl,
            limit,
            topics: HashMap::new(),
            order: VecDeque::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    // True iff the tuple was not already present. Re-adding an existing
    // peer refreshes its timestamp.
    pub fn add(&mut self, topic: &Topic, peer: Peer) -> bool {
        let now = Instant::now();

        if let Some(entries) = self.topics.get_mut(topic) {
            if let Some(entry) = entries.iter_mut().find(|e| e.peer == peer) {
                entry.added = now;
                self.note_order(topic, peer, now);
                return false;
            }
        }

        if self.limit > 0 && self.len >= self.limit {
            self.evict_oldest();
        }

        self.topics.entry(topic.clone()).or_default().push(Entry {
            peer,
            wire: peer.to_wire(),
            added: now,
        });
        self.note_order(topic, peer, now);
        self.len += 1;
        true
    }

    pub fn remove(&mut self, topic: &Topic, peer: Peer) {
        let Some(entries) = self.topics.get_mut(topic) else { return };
        if let Some(idx) = entries.iter().position(|e| e.peer == peer) {
            entries.remove(idx);
            self.len -= 1;
        }
        if entries.is_empty() {
            self.topics.remove(topic);
        }
    }

    // Up to `max` peers, sampled uniformly without replacement, in
    // random order.
    pub fn sample(&mut self, topic: &Topic, max: usize) -> Vec<Peer> {
        self.purge(topic);
        let Some(entries) = self.topics.get(topic) else { return Vec::new() };
        let mut rng = rand::thread_rng();
        let mut peers: Vec<Peer> = entries
            .choose_multiple(&mut rng, max)
            .map(|e| e.peer)
            .collect();
        peers.shuffle(&mut rng);
        peers
    }

    // Same sampling, packed into concatenated 6-byte records.
    pub fn sample_packed(&mut self, topic: &Topic, max: usize) -> Vec<u8> {
        self.purge(topic);
        let Some(entries) = self.topics.get(topic) else { return Vec::new() };
        let mut rng = rand::thread_rng();
        let mut picked: Vec<&Entry> = entries.choose_multiple(&mut rng, max).collect();
        picked.shuffle(&mut rng);
        picked.iter().flat_map(|e| e.wire).collect()
    }

    // Total ordered traversal: topics sorted, peers in insertion order.
    // Schema is { "<topic>": [{ "host": "x.x.x.x", "port": n }, ..] }.
    pub fn to_json(&self) -> Value {
        let mut topics: Vec<&Topic> = self.topics.keys().collect();
        topics.sort();

        let mut map = serde_json::Map::new();
        for topic in topics {
            let peers: Vec<Value> = self.topics[topic]
                .iter()
                .map(|e| json!({ "host": e.peer.host.to_string(), "port": e.peer.port }))
                .collect();
            map.insert(topic.to_string(), Value::Array(peers));
        }
        Value::Object(map)
    }

    fn purge(&mut self, topic: &Topic) {
        let Some(ttl) = self.ttl else { return };
        let Some(entries) = self.topics.get_mut(topic) else { return };
        let before = entries.len();
        entries.retain(|e| e.added.elapsed() < ttl);
        self.len -= before - entries.len();
        if entries.is_empty() {
            self.topics.remove(topic);
        }
    }

    // The queue only matters for limit eviction; without a limit it is
    // not kept at all. Stale records from refreshes are compacted away
    // once they outnumber the live entries.
    fn note_order(&mut self, topic: &Topic, peer: Peer, added: Instant) {
        if self.limit == 0 {
            return;
        }
        self.order.push_back((topic.clone(), peer, added));
        if self.order.len() > self.limit * 2 + 64 {
            self.compact_order();
        }
    }

    fn compact_order(&mut self) {
        let mut live: Vec<(Topic, Peer, Instant)> = self
            .topics
            .iter()
            .flat_map(|(topic, entries)| {
                entries.iter().map(move |e| (topic.clone(), e.peer, e.added))
            })
            .collect();
        live.sort_by_key(|&(_, _, added)| added);
        self.order = live.into();
    }

    fn evict_oldest(&mut self) {
        while let Some((topic, peer, added)) = self.order.pop_front() {
            let Some(entries) = self.topics.get_mut(&topic) else { continue };
            // A timestamp mismatch means the entry was refreshed or
            // replaced since this queue record was pushed.
            let Some(idx) = entries.iter().position(|e| e.peer == peer && e.added == added) else {
                continue;
            };
            entries.remove(idx);
            self.len -= 1;
            if entries.is_empty() {
                self.topics.remove(&topic);
            }
            return;
        }
    }
}
