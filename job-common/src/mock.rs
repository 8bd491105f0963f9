use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::redis::{Client, StoreError};

/// A command issued against a `MockRedisClient`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRedisCall {
    pub op: String,
    pub key: String,
}

#[derive(Default)]
struct MockState {
    values: HashMap<String, (String, Option<Instant>)>,
    lists: HashMap<String, VecDeque<String>>,
    sorted_sets: HashMap<String, Vec<(i64, String)>>,
    published: Vec<(String, String)>,
    failing: HashSet<String>,
    calls: Vec<MockRedisCall>,
}

/// In-memory stand-in for redis.
///
/// Clones share state, so a test can hand one clone to the code under test and inspect another.
/// Key expiry follows tokio's clock: tests that pause time can `advance` past a TTL.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    state: Arc<Mutex<MockState>>,
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make every subsequent `op` (e.g. "SET", "RPUSH") fail as if redis were unreachable.
    pub fn fail_command(&self, op: &str) -> Self {
        self.lock().failing.insert(op.to_owned());
        self.clone()
    }

    pub fn get_calls(&self) -> Vec<MockRedisCall> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|call| call.op == op).count()
    }

    pub fn list(&self, key: &str) -> Vec<String> {
        self.lock()
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn sorted_set(&self, key: &str) -> Vec<(i64, String)> {
        self.lock().sorted_sets.get(key).cloned().unwrap_or_default()
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.lock().published.clone()
    }

    /// Record the call under `op` and fail it if it was configured to fail.
    fn call(&self, op: &str, key: &str) -> Result<MutexGuard<'_, MockState>, StoreError> {
        let mut state = self.lock();
        state.calls.push(MockRedisCall {
            op: op.to_owned(),
            key: key.to_owned(),
        });

        if state.failing.contains(op) {
            return Err(StoreError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "Connection refused",
            ))));
        }

        Ok(state)
    }
}

fn parse_score(bound: &str) -> i64 {
    match bound {
        "-inf" => i64::MIN,
        "+inf" | "inf" => i64::MAX,
        value => value.parse().unwrap_or(i64::MAX),
    }
}

/// Resolve a redis style index, where negative values count from the end.
fn resolve_index(index: isize, len: usize) -> isize {
    if index < 0 {
        len as isize + index
    } else {
        index
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn set_nx_ex(&self, k: String, v: String, seconds: u64) -> Result<bool, StoreError> {
        let mut state = self.call("SET", &k)?;
        let now = Instant::now();

        if let Some((_, Some(expires_at))) = state.values.get(&k) {
            if *expires_at <= now {
                state.values.remove(&k);
            }
        }

        if state.values.contains_key(&k) {
            return Ok(false);
        }

        let expires_at = now + Duration::from_secs(seconds);
        state.values.insert(k, (v, Some(expires_at)));
        Ok(true)
    }

    async fn lpush(&self, k: String, v: String) -> Result<(), StoreError> {
        let mut state = self.call("LPUSH", &k)?;
        state.lists.entry(k).or_default().push_front(v);
        Ok(())
    }

    async fn rpush(&self, k: String, v: String) -> Result<(), StoreError> {
        let mut state = self.call("RPUSH", &k)?;
        state.lists.entry(k).or_default().push_back(v);
        Ok(())
    }

    async fn lrange(
        &self,
        k: String,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.call("LRANGE", &k)?;
        let Some(list) = state.lists.get(&k) else {
            return Ok(Vec::new());
        };

        let start = resolve_index(start, list.len()).max(0);
        let stop = resolve_index(stop, list.len()).min(list.len() as isize - 1);
        if start > stop {
            return Ok(Vec::new());
        }

        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn llen(&self, k: String) -> Result<u64, StoreError> {
        let state = self.call("LLEN", &k)?;
        Ok(state.lists.get(&k).map_or(0, |list| list.len() as u64))
    }

    async fn lrem(&self, k: String, count: isize, v: String) -> Result<u64, StoreError> {
        let mut state = self.call("LREM", &k)?;
        let Some(list) = state.lists.get_mut(&k) else {
            return Ok(0);
        };

        let limit = if count == 0 {
            usize::MAX
        } else {
            count.unsigned_abs()
        };
        let mut removed = 0;
        list.retain(|item| {
            if removed < limit && *item == v {
                removed += 1;
                false
            } else {
                true
            }
        });

        Ok(removed as u64)
    }

    async fn rpoplpush(&self, src: String, dst: String) -> Result<Option<String>, StoreError> {
        let mut state = self.call("RPOPLPUSH", &src)?;
        let Some(value) = state.lists.get_mut(&src).and_then(|list| list.pop_back()) else {
            return Ok(None);
        };

        state
            .lists
            .entry(dst)
            .or_default()
            .push_front(value.clone());
        Ok(Some(value))
    }

    async fn zadd(&self, k: String, member: String, score: i64) -> Result<(), StoreError> {
        let mut state = self.call("ZADD", &k)?;
        let set = state.sorted_sets.entry(k).or_default();
        set.retain(|(_, existing)| *existing != member);
        set.push((score, member));
        set.sort();
        Ok(())
    }

    async fn zrangebyscore(
        &self,
        k: String,
        min: String,
        max: String,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.call("ZRANGEBYSCORE", &k)?;
        let (min, max) = (parse_score(&min), parse_score(&max));

        Ok(state
            .sorted_sets
            .get(&k)
            .map(|set| {
                set.iter()
                    .filter(|(score, _)| *score >= min && *score <= max)
                    .map(|(_, member)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn zrem(&self, k: String, member: String) -> Result<bool, StoreError> {
        let mut state = self.call("ZREM", &k)?;
        let Some(set) = state.sorted_sets.get_mut(&k) else {
            return Ok(false);
        };

        let before = set.len();
        set.retain(|(_, existing)| *existing != member);
        Ok(set.len() < before)
    }

    async fn publish(&self, channel: String, message: String) -> Result<(), StoreError> {
        let mut state = self.call("PUBLISH", &channel)?;
        state.published.push((channel, message));
        Ok(())
    }
}
