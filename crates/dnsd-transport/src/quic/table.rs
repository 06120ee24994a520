//! Connection table for the QUIC backend.
//!
//! Maps connection identifiers to per-connection state. The table has a
//! fixed bucket count chosen at creation; connections live in a slab and
//! each bucket holds `(identifier, slab index)` keys, newest last. One
//! connection may be reachable under several identifiers (the server's own
//! id plus the client's original destination id during the handshake). The
//! table is owned by a single worker thread and does no locking.
//!
//! Capacity is bounded by [`TableConfig::max_connections`] and chain length
//! by [`TableConfig::max_chain`]. Connections are kept on an activity list;
//! [`ConnTable::sweep`] drops the idle ones from its old end, and a full
//! [`ConnTable::add`] evicts the least recently active connection in
//! constant time.

use crate::error::TableError;
use rand::RngCore;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

/// Longest connection identifier accepted (QUIC v1 limit)
pub const MAX_CID_LEN: usize = 20;

/// Length of connection identifiers chosen by this server
pub const SERVER_CID_LEN: usize = 18;

/// Default bucket count
pub const DEFAULT_BUCKETS: usize = 100;

/// A connection identifier, at most [`MAX_CID_LEN`] bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_LEN],
}

impl ConnectionId {
    /// Copy an identifier from `bytes`
    pub fn new(bytes: &[u8]) -> Result<Self, TableError> {
        if bytes.len() > MAX_CID_LEN {
            return Err(TableError::IdTooLong {
                len: bytes.len(),
                max: MAX_CID_LEN,
            });
        }
        let mut cid = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_LEN],
        };
        cid.bytes[..bytes.len()].copy_from_slice(bytes);
        Ok(cid)
    }

    /// A fresh unpredictable server identifier of [`SERVER_CID_LEN`] bytes
    pub fn random() -> Self {
        let mut cid = Self {
            len: SERVER_CID_LEN as u8,
            bytes: [0; MAX_CID_LEN],
        };
        rand::thread_rng().fill_bytes(&mut cid.bytes[..SERVER_CID_LEN]);
        cid
    }

    /// Identifier bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Identifier length
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// True for the zero-length identifier
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", hex::encode(self.as_bytes()))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.as_bytes()))
    }
}

/// Fold `cid` into a 64-bit value.
///
/// Whole 8-byte words are read little-endian and xored together. Each
/// remaining byte is xored in shifted into the next lower byte position,
/// starting from the most significant byte.
pub fn cid_hash(cid: &[u8]) -> u64 {
    let cid = &cid[..cid.len().min(MAX_CID_LEN)];
    let mut hash = 0u64;

    let mut words = cid.chunks_exact(8);
    for word in &mut words {
        let mut le = [0u8; 8];
        le.copy_from_slice(word);
        hash ^= u64::from_le_bytes(le);
    }

    let mut shift = 7u32;
    for &b in words.remainder() {
        hash ^= u64::from(b) << (shift * 8);
        shift = shift.saturating_sub(1);
    }
    hash
}

/// Table sizing and eviction policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableConfig {
    /// Fixed number of buckets
    pub buckets: usize,
    /// Maximum live connections
    pub max_connections: usize,
    /// Inactivity after which a connection is swept
    pub idle_timeout: Duration,
    /// Maximum identifiers chained in one bucket
    pub max_chain: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            buckets: DEFAULT_BUCKETS,
            max_connections: 10_000,
            idle_timeout: Duration::from_secs(30),
            max_chain: 512,
        }
    }
}

#[derive(Clone, Copy)]
struct Key {
    cid: ConnectionId,
    entry: usize,
}

struct Entry<T> {
    /// First key is the primary identifier, the rest are aliases
    keys: Vec<ConnectionId>,
    last_active: Instant,
    conn: T,
    /// Towards the least recently active entry
    older: Option<usize>,
    /// Towards the most recently active entry
    newer: Option<usize>,
}

/// Fixed-bucket connection table
pub struct ConnTable<T> {
    config: TableConfig,
    buckets: Vec<Vec<Key>>,
    slab: Vec<Option<Entry<T>>>,
    free: Vec<usize>,
    len: usize,
    oldest: Option<usize>,
    newest: Option<usize>,
}

impl<T> ConnTable<T> {
    /// Create an empty table
    pub fn new(config: TableConfig) -> Result<Self, TableError> {
        if config.buckets == 0 {
            return Err(TableError::ZeroBuckets);
        }
        Ok(Self {
            config,
            buckets: vec![Vec::new(); config.buckets],
            slab: Vec::new(),
            free: Vec::new(),
            len: 0,
            oldest: None,
            newest: None,
        })
    }

    /// Table configuration
    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no connection is stored
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bucket an identifier hashes to
    pub fn bucket_of(&self, cid: &[u8]) -> usize {
        (cid_hash(cid) % self.buckets.len() as u64) as usize
    }

    /// Identifiers chained in the bucket `cid` hashes to
    pub fn chain_len(&self, cid: &[u8]) -> usize {
        self.buckets[self.bucket_of(cid)].len()
    }

    fn entry_of(&self, cid: &[u8]) -> Option<usize> {
        self.buckets[self.bucket_of(cid)]
            .iter()
            .rev()
            .find(|k| k.cid.as_bytes() == cid)
            .map(|k| k.entry)
    }

    /// Look up a connection by any of its identifiers
    pub fn find(&self, cid: &[u8]) -> Option<&T> {
        let idx = self.entry_of(cid)?;
        self.slab[idx].as_ref().map(|e| &e.conn)
    }

    /// Look up a connection and mark it active at `now`
    pub fn find_mut(&mut self, cid: &[u8], now: Instant) -> Option<&mut T> {
        let idx = self.entry_of(cid)?;
        self.detach(idx);
        self.push_newest(idx);
        self.slab[idx].as_mut().map(|e| {
            e.last_active = now;
            &mut e.conn
        })
    }

    /// True when `cid` is stored
    pub fn contains(&self, cid: &[u8]) -> bool {
        self.entry_of(cid).is_some()
    }

    /// Insert a new connection under `cid`.
    ///
    /// Fails with [`TableError::Duplicate`] when the identifier is already
    /// present and with [`TableError::ChainFull`] when its bucket is at
    /// [`TableConfig::max_chain`]. A full table loses its least recently
    /// active connection.
    pub fn add(&mut self, cid: ConnectionId, conn: T, now: Instant) -> Result<&mut T, TableError> {
        if self.config.max_connections == 0 {
            return Err(TableError::Full);
        }
        self.check_key(&cid)?;
        if self.len >= self.config.max_connections {
            self.evict_oldest();
        }

        let entry = Entry {
            keys: vec![cid],
            last_active: now,
            conn,
            older: None,
            newer: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slab[idx] = Some(entry);
                idx
            }
            None => {
                self.slab.push(Some(entry));
                self.slab.len() - 1
            }
        };
        let bucket = self.bucket_of(cid.as_bytes());
        self.buckets[bucket].push(Key { cid, entry: idx });
        self.push_newest(idx);
        self.len += 1;

        match self.slab[idx].as_mut() {
            Some(e) => Ok(&mut e.conn),
            None => Err(TableError::Full),
        }
    }

    /// Make the connection stored under `existing` reachable through `alias` too
    pub fn add_alias(&mut self, existing: &[u8], alias: ConnectionId) -> Result<(), TableError> {
        let idx = self.entry_of(existing).ok_or(TableError::NotFound)?;
        self.check_key(&alias)?;
        let bucket = self.bucket_of(alias.as_bytes());
        self.buckets[bucket].push(Key {
            cid: alias,
            entry: idx,
        });
        if let Some(e) = self.slab[idx].as_mut() {
            e.keys.push(alias);
        }
        Ok(())
    }

    /// Drop one identifier of a connection that has others.
    ///
    /// Returns false when `cid` is unknown or is the connection's last
    /// identifier; use [`ConnTable::remove`] to drop the connection.
    pub fn retire(&mut self, cid: &[u8]) -> bool {
        let Some(idx) = self.entry_of(cid) else {
            return false;
        };
        let Some(e) = self.slab[idx].as_mut() else {
            return false;
        };
        if e.keys.len() < 2 {
            return false;
        }
        e.keys.retain(|k| k.as_bytes() != cid);
        let bucket = self.bucket_of(cid);
        self.buckets[bucket].retain(|k| k.cid.as_bytes() != cid);
        true
    }

    /// Remove a connection under any of its identifiers, returning its state
    pub fn remove(&mut self, cid: &[u8]) -> Option<T> {
        let idx = self.entry_of(cid)?;
        self.unlink(idx)
    }

    fn check_key(&self, cid: &ConnectionId) -> Result<(), TableError> {
        let chain = &self.buckets[self.bucket_of(cid.as_bytes())];
        if chain.iter().any(|k| k.cid == *cid) {
            return Err(TableError::Duplicate);
        }
        if chain.len() >= self.config.max_chain {
            return Err(TableError::ChainFull);
        }
        Ok(())
    }

    fn unlink(&mut self, idx: usize) -> Option<T> {
        self.detach(idx);
        let entry = self.slab[idx].take()?;
        for cid in &entry.keys {
            let bucket = self.bucket_of(cid.as_bytes());
            self.buckets[bucket].retain(|k| k.entry != idx);
        }
        self.free.push(idx);
        self.len -= 1;
        Some(entry.conn)
    }

    fn detach(&mut self, idx: usize) {
        let Some((older, newer)) = self.slab[idx].as_ref().map(|e| (e.older, e.newer)) else {
            return;
        };
        match older {
            Some(o) => {
                if let Some(e) = self.slab[o].as_mut() {
                    e.newer = newer;
                }
            }
            None => self.oldest = newer,
        }
        match newer {
            Some(n) => {
                if let Some(e) = self.slab[n].as_mut() {
                    e.older = older;
                }
            }
            None => self.newest = older,
        }
        if let Some(e) = self.slab[idx].as_mut() {
            e.older = None;
            e.newer = None;
        }
    }

    fn push_newest(&mut self, idx: usize) {
        let prev = self.newest;
        if let Some(e) = self.slab[idx].as_mut() {
            e.older = prev;
            e.newer = None;
        }
        match prev {
            Some(p) => {
                if let Some(e) = self.slab[p].as_mut() {
                    e.newer = Some(idx);
                }
            }
            None => self.oldest = Some(idx),
        }
        self.newest = Some(idx);
    }

    /// Drop every connection idle for at least the configured timeout.
    /// Returns the number of connections removed.
    ///
    /// Walks from the least recently active connection and stops at the
    /// first one still live.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let timeout = self.config.idle_timeout;
        let mut swept = 0;
        while let Some(idx) = self.oldest {
            let Some(e) = self.slab[idx].as_ref() else {
                break;
            };
            if now.saturating_duration_since(e.last_active) < timeout {
                break;
            }
            let cid = e.keys[0];
            self.unlink(idx);
            debug!(cid = %cid, "QUIC connection idle, swept");
            swept += 1;
        }
        swept
    }

    fn evict_oldest(&mut self) {
        let Some(idx) = self.oldest else {
            return;
        };
        let cid = self.slab[idx].as_ref().map(|e| e.keys[0]);
        self.unlink(idx);
        if let Some(cid) = cid {
            debug!(cid = %cid, "QUIC connection table full, evicted");
        }
    }

    /// Iterate over primary identifiers and connections
    pub fn iter(&self) -> impl Iterator<Item = (&ConnectionId, &T)> {
        self.slab
            .iter()
            .filter_map(|e| e.as_ref().map(|e| (&e.keys[0], &e.conn)))
    }
}

impl<T> fmt::Debug for ConnTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnTable")
            .field("config", &self.config)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn table(buckets: usize, max: usize) -> ConnTable<u32> {
        ConnTable::new(TableConfig {
            buckets,
            max_connections: max,
            idle_timeout: Duration::from_secs(10),
            ..TableConfig::default()
        })
        .unwrap()
    }

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::new(bytes).unwrap()
    }

    #[test]
    fn test_hash_whole_words() {
        let bytes = [1, 2, 3, 4, 5, 6, 7, 8];
        assert_eq!(cid_hash(&bytes), u64::from_le_bytes(bytes));

        let two = [1, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(cid_hash(&two), 0);
    }

    #[test]
    fn test_hash_trailing_bytes() {
        assert_eq!(cid_hash(&[0xAB]), 0xAB_u64 << 56);
        assert_eq!(cid_hash(&[0x01, 0x02]), (0x01_u64 << 56) | (0x02_u64 << 48));

        let mut bytes = [0u8; 10];
        bytes[8] = 0xFF;
        bytes[9] = 0x01;
        assert_eq!(cid_hash(&bytes), (0xFF_u64 << 56) | (0x01_u64 << 48));
    }

    #[test]
    fn test_hash_empty() {
        assert_eq!(cid_hash(&[]), 0);
    }

    #[test]
    fn test_connection_id_too_long() {
        let err = ConnectionId::new(&[0u8; 21]).unwrap_err();
        assert_eq!(err, TableError::IdTooLong { len: 21, max: 20 });
    }

    #[test]
    fn test_random_server_id() {
        let a = ConnectionId::random();
        let b = ConnectionId::random();
        assert_eq!(a.len(), SERVER_CID_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn test_zero_buckets_rejected() {
        let err = ConnTable::<u32>::new(TableConfig {
            buckets: 0,
            ..TableConfig::default()
        })
        .unwrap_err();
        assert_eq!(err, TableError::ZeroBuckets);
    }

    #[test]
    fn test_add_find_remove() {
        let mut t = table(100, 16);
        let now = Instant::now();
        t.add(cid(b"abcdefgh"), 1, now).unwrap();
        t.add(cid(b"ijklmnop"), 2, now).unwrap();

        assert_eq!(t.find(b"abcdefgh"), Some(&1));
        assert_eq!(t.find(b"ijklmnop"), Some(&2));
        assert_eq!(t.find(b"qrstuvwx"), None);
        assert_eq!(t.len(), 2);

        assert_eq!(t.remove(b"abcdefgh"), Some(1));
        assert_eq!(t.find(b"abcdefgh"), None);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut t = table(100, 16);
        let now = Instant::now();
        t.add(cid(b"same-id!"), 1, now).unwrap();
        assert_eq!(t.add(cid(b"same-id!"), 2, now), Err(TableError::Duplicate));
        assert_eq!(t.find(b"same-id!"), Some(&1));
    }

    #[test]
    fn test_colliding_ids_both_findable() {
        let mut t = table(1, 16);
        let now = Instant::now();
        // Swapping whole words keeps the xor fold identical.
        let a = [1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 2, 2, 2];
        let b = [2, 2, 2, 2, 2, 2, 2, 2, 1, 1, 1, 1, 1, 1, 1, 1];
        assert_eq!(cid_hash(&a), cid_hash(&b));

        t.add(cid(&a), 10, now).unwrap();
        assert_eq!(t.find(&b), None);
        t.add(cid(&b), 20, now).unwrap();

        assert_eq!(t.find(&a), Some(&10));
        assert_eq!(t.find(&b), Some(&20));
    }

    #[test]
    fn test_eighteen_byte_id_bit_flips() {
        let mut t = table(100, 16);
        let id: Vec<u8> = (1..=18).collect();
        t.add(cid(&id), 7, Instant::now()).unwrap();
        assert_eq!(t.find(&id), Some(&7));

        for byte in 0..id.len() {
            for bit in 0..8 {
                let mut flipped = id.clone();
                flipped[byte] ^= 1 << bit;
                assert_eq!(t.find(&flipped), None, "byte {byte} bit {bit}");
            }
        }
    }

    #[test]
    fn test_sweep_idle() {
        let mut t = table(10, 16);
        let start = Instant::now();
        t.add(cid(b"old-conn"), 1, start).unwrap();
        t.add(cid(b"new-conn"), 2, start + Duration::from_secs(8)).unwrap();

        assert_eq!(t.sweep(start + Duration::from_secs(5)), 0);
        assert_eq!(t.sweep(start + Duration::from_secs(12)), 1);
        assert_eq!(t.find(b"old-conn"), None);
        assert_eq!(t.find(b"new-conn"), Some(&2));
    }

    #[test]
    fn test_find_mut_refreshes_activity() {
        let mut t = table(10, 16);
        let start = Instant::now();
        t.add(cid(b"busy-con"), 1, start).unwrap();
        *t.find_mut(b"busy-con", start + Duration::from_secs(9)).unwrap() += 1;

        assert_eq!(t.sweep(start + Duration::from_secs(15)), 0);
        assert_eq!(t.find(b"busy-con"), Some(&2));
    }

    #[test]
    fn test_full_table_evicts_least_recent() {
        let mut t = table(10, 2);
        let start = Instant::now();
        t.add(cid(b"first---"), 1, start).unwrap();
        t.add(cid(b"second--"), 2, start + Duration::from_secs(1)).unwrap();
        t.find_mut(b"first---", start + Duration::from_secs(2));

        t.add(cid(b"third---"), 3, start + Duration::from_secs(3)).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.find(b"second--"), None);
        assert_eq!(t.find(b"first---"), Some(&1));
        assert_eq!(t.find(b"third---"), Some(&3));
    }

    #[test]
    fn test_zero_capacity() {
        let mut t = table(10, 0);
        assert_eq!(
            t.add(cid(b"anything"), 1, Instant::now()),
            Err(TableError::Full)
        );
    }

    #[test]
    fn test_slots_reused() {
        let mut t = table(10, 4);
        let now = Instant::now();
        for round in 0..10u32 {
            let id = round.to_be_bytes();
            t.add(cid(&id), round, now).unwrap();
            assert_eq!(t.remove(&id), Some(round));
        }
        assert!(t.is_empty());
        assert!(t.slab.len() <= 1);
    }

    #[test]
    fn test_alias_reaches_same_connection() {
        let mut t = table(10, 16);
        let now = Instant::now();
        t.add(cid(b"server-id-0000000"), 1, now).unwrap();
        t.add_alias(b"server-id-0000000", cid(b"client-1")).unwrap();

        assert_eq!(t.len(), 1);
        *t.find_mut(b"client-1", now).unwrap() += 1;
        assert_eq!(t.find(b"server-id-0000000"), Some(&2));

        assert_eq!(t.add_alias(b"unknown!", cid(b"client-2")), Err(TableError::NotFound));
        assert_eq!(
            t.add_alias(b"server-id-0000000", cid(b"client-1")),
            Err(TableError::Duplicate)
        );
    }

    #[test]
    fn test_retire_keeps_last_identifier() {
        let mut t = table(10, 16);
        let now = Instant::now();
        t.add(cid(b"primary!"), 1, now).unwrap();
        t.add_alias(b"primary!", cid(b"original")).unwrap();

        assert!(t.retire(b"original"));
        assert_eq!(t.find(b"original"), None);
        assert_eq!(t.find(b"primary!"), Some(&1));
        assert!(!t.retire(b"primary!"));
        assert!(!t.retire(b"original"));
    }

    #[test]
    fn test_remove_drops_every_identifier() {
        let mut t = table(1, 16);
        let now = Instant::now();
        t.add(cid(b"primary!"), 1, now).unwrap();
        t.add_alias(b"primary!", cid(b"original")).unwrap();
        assert_eq!(t.chain_len(b"primary!"), 2);

        assert_eq!(t.remove(b"original"), Some(1));
        assert_eq!(t.find(b"primary!"), None);
        assert_eq!(t.chain_len(b"primary!"), 0);
        assert!(t.is_empty());
    }

    #[test]
    fn test_chain_limit() {
        let mut t = ConnTable::new(TableConfig {
            buckets: 1,
            max_chain: 2,
            ..TableConfig::default()
        })
        .unwrap();
        let now = Instant::now();
        t.add(cid(b"one-----"), 1, now).unwrap();
        t.add(cid(b"two-----"), 2, now).unwrap();
        assert_eq!(t.add(cid(b"three---"), 3, now), Err(TableError::ChainFull));
        assert_eq!(t.add_alias(b"one-----", cid(b"alias---")), Err(TableError::ChainFull));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_eviction_follows_activity_order() {
        let mut t = table(10, 3);
        let start = Instant::now();
        for (i, id) in [b"conn-a--", b"conn-b--", b"conn-c--"].iter().enumerate() {
            t.add(cid(*id), i as u32, start + Duration::from_secs(i as u64)).unwrap();
        }
        t.find_mut(b"conn-a--", start + Duration::from_secs(5));
        t.find_mut(b"conn-b--", start + Duration::from_secs(6));

        t.add(cid(b"conn-d--"), 3, start + Duration::from_secs(7)).unwrap();
        assert_eq!(t.find(b"conn-c--"), None);
        t.add(cid(b"conn-e--"), 4, start + Duration::from_secs(8)).unwrap();
        assert_eq!(t.find(b"conn-a--"), None);
        assert!(t.contains(b"conn-b--"));
        assert!(t.contains(b"conn-d--"));
        assert!(t.contains(b"conn-e--"));
    }

    #[test]
    fn test_sweep_stops_at_first_live() {
        let mut t = table(10, 16);
        let start = Instant::now();
        for i in 0..5u64 {
            t.add(cid(&i.to_be_bytes()), i as u32, start + Duration::from_secs(i)).unwrap();
        }
        assert_eq!(t.sweep(start + Duration::from_secs(12)), 3);
        assert_eq!(t.len(), 2);
        assert!(t.contains(&3u64.to_be_bytes()));
        assert_eq!(t.oldest, t.entry_of(&3u64.to_be_bytes()));
        assert_eq!(t.sweep(start + Duration::from_secs(20)), 2);
        assert_eq!(t.oldest, None);
        assert_eq!(t.newest, None);
    }

    proptest! {
        #[test]
        fn prop_distinct_ids_all_findable(
            ids in proptest::collection::hash_set(
                proptest::collection::vec(any::<u8>(), 1..=MAX_CID_LEN), 1..64),
            buckets in 1usize..32,
        ) {
            let mut t = table(buckets, 128);
            let now = Instant::now();
            let ids: Vec<Vec<u8>> = ids.into_iter().collect();
            for (i, id) in ids.iter().enumerate() {
                t.add(cid(id), i as u32, now).unwrap();
            }
            for (i, id) in ids.iter().enumerate() {
                prop_assert_eq!(t.find(id), Some(&(i as u32)));
                prop_assert!(t.buckets[t.bucket_of(id)]
                    .iter()
                    .any(|k| k.cid.as_bytes() == id.as_slice()));
            }
            prop_assert_eq!(t.len(), ids.len());
        }
    }
}
