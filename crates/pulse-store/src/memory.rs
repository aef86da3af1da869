//! In-process [`SharedStore`] backend.
//!
//! Reference implementation used by tests and single-node runs. Semantics
//! follow the external store: TTLs are honored (expiry is evaluated lazily
//! on access), kind mismatches error, and list/set/sorted-set operations
//! behave like their Redis counterparts. Not a cache: when this backend is
//! selected it *is* the shared store for the process.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::kv::{SharedStore, StoreError, StoreResult};

#[derive(Debug)]
enum ValueKind {
    Str(String),
    Set(HashSet<String>),
    Sorted(Vec<(f64, String)>),
    List(VecDeque<String>),
}

#[derive(Debug)]
struct Entry {
    kind: ValueKind,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(kind: ValueKind) -> Self {
        Self {
            kind,
            expires_at: None,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory shared store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys (expired keys purged first).
    pub fn len(&self) -> usize {
        self.entries.retain(|_, e| !e.is_expired());
        self.entries.len()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge_if_expired(&self, key: &str) {
        let _ = self.entries.remove_if(key, |_, e| e.is_expired());
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.purge_if_expired(key);
        match self.entries.get(key) {
            None => Ok(None),
            Some(e) => match &e.kind {
                ValueKind::Str(s) => Ok(Some(s.clone())),
                _ => Err(StoreError::WrongType(key.into())),
            },
        }
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let entry = Entry {
            kind: ValueKind::Str(value.into()),
            expires_at: ttl.map(|d| Instant::now() + d),
        };
        let _ = self.entries.insert(key.into(), entry);
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.purge_if_expired(key);
        Ok(self.entries.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.purge_if_expired(key);
        Ok(self.entries.contains_key(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.purge_if_expired(key);
        match self.entries.get_mut(key) {
            Some(mut e) => {
                e.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.purge_if_expired(key);
        let mut e = self
            .entries
            .entry(key.into())
            .or_insert_with(|| Entry::new(ValueKind::Set(HashSet::new())));
        match &mut e.kind {
            ValueKind::Set(s) => Ok(s.insert(member.into())),
            _ => Err(StoreError::WrongType(key.into())),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.purge_if_expired(key);
        match self.entries.get_mut(key) {
            None => Ok(false),
            Some(mut e) => match &mut e.kind {
                ValueKind::Set(s) => Ok(s.remove(member)),
                _ => Err(StoreError::WrongType(key.into())),
            },
        }
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.purge_if_expired(key);
        match self.entries.get(key) {
            None => Ok(Vec::new()),
            Some(e) => match &e.kind {
                ValueKind::Set(s) => Ok(s.iter().cloned().collect()),
                _ => Err(StoreError::WrongType(key.into())),
            },
        }
    }

    async fn scard(&self, key: &str) -> StoreResult<usize> {
        self.purge_if_expired(key);
        match self.entries.get(key) {
            None => Ok(0),
            Some(e) => match &e.kind {
                ValueKind::Set(s) => Ok(s.len()),
                _ => Err(StoreError::WrongType(key.into())),
            },
        }
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<()> {
        self.purge_if_expired(key);
        let mut e = self
            .entries
            .entry(key.into())
            .or_insert_with(|| Entry::new(ValueKind::Sorted(Vec::new())));
        match &mut e.kind {
            ValueKind::Sorted(v) => {
                v.retain(|(_, m)| m != member);
                v.push((score, member.into()));
                v.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
                Ok(())
            }
            _ => Err(StoreError::WrongType(key.into())),
        }
    }

    async fn zremrangebyscore(&self, key: &str, max: f64) -> StoreResult<usize> {
        self.purge_if_expired(key);
        match self.entries.get_mut(key) {
            None => Ok(0),
            Some(mut e) => match &mut e.kind {
                ValueKind::Sorted(v) => {
                    let before = v.len();
                    v.retain(|(score, _)| *score > max);
                    Ok(before - v.len())
                }
                _ => Err(StoreError::WrongType(key.into())),
            },
        }
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        self.purge_if_expired(key);
        match self.entries.get(key) {
            None => Ok(0),
            Some(e) => match &e.kind {
                ValueKind::Sorted(v) => Ok(v.len()),
                _ => Err(StoreError::WrongType(key.into())),
            },
        }
    }

    async fn lpush_trim(&self, key: &str, value: &str, cap: usize) -> StoreResult<usize> {
        self.purge_if_expired(key);
        let mut e = self
            .entries
            .entry(key.into())
            .or_insert_with(|| Entry::new(ValueKind::List(VecDeque::new())));
        match &mut e.kind {
            ValueKind::List(l) => {
                l.push_front(value.into());
                l.truncate(cap);
                Ok(l.len())
            }
            _ => Err(StoreError::WrongType(key.into())),
        }
    }

    async fn rpop(&self, key: &str) -> StoreResult<Option<String>> {
        self.purge_if_expired(key);
        match self.entries.get_mut(key) {
            None => Ok(None),
            Some(mut e) => match &mut e.kind {
                ValueKind::List(l) => Ok(l.pop_back()),
                _ => Err(StoreError::WrongType(key.into())),
            },
        }
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<usize> {
        self.purge_if_expired(key);
        let mut e = self
            .entries
            .entry(key.into())
            .or_insert_with(|| Entry::new(ValueKind::List(VecDeque::new())));
        match &mut e.kind {
            ValueKind::List(l) => {
                l.push_back(value.into());
                Ok(l.len())
            }
            _ => Err(StoreError::WrongType(key.into())),
        }
    }

    async fn llen(&self, key: &str) -> StoreResult<usize> {
        self.purge_if_expired(key);
        match self.entries.get(key) {
            None => Ok(0),
            Some(e) => match &e.kind {
                ValueKind::List(l) => Ok(l.len()),
                _ => Err(StoreError::WrongType(key.into())),
            },
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_set_del_roundtrip() {
        let s = MemoryStore::new();
        assert_eq!(s.get("k").await.unwrap(), None);
        s.set("k", "v", None).await.unwrap();
        assert_eq!(s.get("k").await.unwrap(), Some("v".into()));
        assert!(s.del("k").await.unwrap());
        assert!(!s.del("k").await.unwrap());
    }

    #[tokio::test]
    async fn ttl_expires_values() {
        let s = MemoryStore::new();
        s.set("k", "v", Some(Duration::from_millis(20))).await.unwrap();
        assert!(s.exists("k").await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!s.exists("k").await.unwrap());
        assert_eq!(s.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expire_refreshes_ttl() {
        let s = MemoryStore::new();
        s.set("k", "v", Some(Duration::from_millis(20))).await.unwrap();
        assert!(s.expire("k", Duration::from_secs(60)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(s.exists("k").await.unwrap());
        assert!(!s.expire("missing", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn set_operations() {
        let s = MemoryStore::new();
        assert!(s.sadd("set", "a").await.unwrap());
        assert!(!s.sadd("set", "a").await.unwrap());
        assert!(s.sadd("set", "b").await.unwrap());
        assert_eq!(s.scard("set").await.unwrap(), 2);
        let mut members = s.smembers("set").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
        assert!(s.srem("set", "a").await.unwrap());
        assert!(!s.srem("set", "a").await.unwrap());
        assert_eq!(s.scard("set").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sorted_set_prunes_by_score() {
        let s = MemoryStore::new();
        s.zadd("z", 1.0, "a").await.unwrap();
        s.zadd("z", 2.0, "b").await.unwrap();
        s.zadd("z", 3.0, "c").await.unwrap();
        assert_eq!(s.zcard("z").await.unwrap(), 3);
        assert_eq!(s.zremrangebyscore("z", 2.0).await.unwrap(), 2);
        assert_eq!(s.zcard("z").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn zadd_replaces_member_score() {
        let s = MemoryStore::new();
        s.zadd("z", 1.0, "a").await.unwrap();
        s.zadd("z", 5.0, "a").await.unwrap();
        assert_eq!(s.zcard("z").await.unwrap(), 1);
        // After replacement the remaining member has the new score.
        assert_eq!(s.zremrangebyscore("z", 1.0).await.unwrap(), 0);
        assert_eq!(s.zremrangebyscore("z", 5.0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_is_fifo_with_cap() {
        let s = MemoryStore::new();
        for i in 0..5 {
            let _ = s.lpush_trim("q", &format!("m{i}"), 3).await.unwrap();
        }
        // Cap 3: oldest (m0, m1) were dropped; pop order is oldest-first.
        assert_eq!(s.llen("q").await.unwrap(), 3);
        assert_eq!(s.rpop("q").await.unwrap(), Some("m2".into()));
        assert_eq!(s.rpop("q").await.unwrap(), Some("m3".into()));
        assert_eq!(s.rpop("q").await.unwrap(), Some("m4".into()));
        assert_eq!(s.rpop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn rpush_returns_entry_to_pop_position() {
        let s = MemoryStore::new();
        let _ = s.lpush_trim("q", "first", 10).await.unwrap();
        let _ = s.lpush_trim("q", "second", 10).await.unwrap();
        let head = s.rpop("q").await.unwrap().unwrap();
        assert_eq!(head, "first");
        // Put it back: it must come out first again.
        let _ = s.rpush("q", &head).await.unwrap();
        assert_eq!(s.rpop("q").await.unwrap(), Some("first".into()));
        assert_eq!(s.rpop("q").await.unwrap(), Some("second".into()));
    }

    #[tokio::test]
    async fn kind_mismatch_errors() {
        let s = MemoryStore::new();
        s.set("k", "v", None).await.unwrap();
        assert!(matches!(
            s.sadd("k", "a").await,
            Err(StoreError::WrongType(_))
        ));
        assert!(matches!(s.rpop("k").await, Err(StoreError::WrongType(_))));
    }

    #[tokio::test]
    async fn mget_preserves_order_and_misses() {
        let s = MemoryStore::new();
        s.set("a", "1", None).await.unwrap();
        s.set("c", "3", None).await.unwrap();
        let got = s
            .mget(&["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(got, vec![Some("1".into()), None, Some("3".into())]);
    }
}
