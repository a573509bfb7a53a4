//! In-memory stand-ins for Redis, for tests that must not need a server.
//!
//! [`MemoryRedis`] understands the subset of commands this workspace issues.
//! Key expiry follows [`tokio::time::Instant`], so paused-clock tests can
//! move time with `tokio::time::advance`. Lua is not interpreted: a test
//! registers a Rust equivalent of each script it relies on via
//! [`MemoryRedis::register_script`], and `EVALSHA` dispatches on the
//! script's SHA1 exactly as Redis does.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use redis::aio::ConnectionLike;
use redis::{Cmd, ErrorKind, Pipeline, RedisError, RedisFuture, RedisResult, Value};
use tokio::time::Instant;

use crate::connector::Connector;

type ScriptHandler = Arc<dyn Fn(&MemoryRedis, &[Vec<u8>], &[Vec<u8>]) -> RedisResult<Value> + Send + Sync>;

#[derive(Debug, Clone)]
enum Data {
    String(Vec<u8>),
    Hash(HashMap<Vec<u8>, Vec<u8>>),
}

#[derive(Debug, Clone)]
struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// An in-memory keyspace implementing [`ConnectionLike`].
///
/// Clones share the same keyspace, like clones of a multiplexed connection.
#[derive(Clone, Default)]
pub struct MemoryRedis {
    keys: Arc<DashMap<Vec<u8>, Entry>>,
    scripts: Arc<DashMap<String, ScriptHandler>>,
}

impl MemoryRedis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `code` callable through `EVAL`/`EVALSHA`, emulated by `handler`.
    ///
    /// The handler receives the store (to issue commands with
    /// [`call`](Self::call)), then `KEYS` and `ARGV`.
    pub fn register_script<F>(&self, code: &str, handler: F)
    where
        F: Fn(&MemoryRedis, &[Vec<u8>], &[Vec<u8>]) -> RedisResult<Value> + Send + Sync + 'static,
    {
        let hash = redis::Script::new(code).get_hash().to_owned();
        self.scripts.insert(hash, Arc::new(handler));
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.keys.retain(|_, entry| !entry.is_expired());
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of `key`, `None` when missing or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let entry = self.live(key.as_bytes())?;
        entry
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Execute one command, e.g. `call(&["HGET", "key", "field"])`.
    pub fn call<A: AsRef<[u8]>>(&self, args: &[A]) -> RedisResult<Value> {
        let args: Vec<Vec<u8>> = args.iter().map(|a| a.as_ref().to_vec()).collect();
        self.execute(&args)
    }

    fn live(&self, key: &[u8]) -> Option<Entry> {
        self.keys.remove_if(key, |_, entry| entry.is_expired());
        self.keys.get(key).map(|entry| entry.clone())
    }

    fn execute(&self, args: &[Vec<u8>]) -> RedisResult<Value> {
        let Some((name, rest)) = args.split_first() else {
            return Err(error("ERR empty command"));
        };
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();

        match (name.as_str(), rest) {
            ("PING", _) => Ok(Value::SimpleString("PONG".to_owned())),
            ("GET", [key]) => match self.live(key).map(|e| e.data) {
                None => Ok(Value::Nil),
                Some(Data::String(v)) => Ok(Value::BulkString(v)),
                Some(Data::Hash(_)) => Err(wrong_type()),
            },
            ("SET", [key, value, options @ ..]) => self.set(key, value, options),
            ("SETEX", [key, secs, value]) => {
                self.set(key, value, &[b"EX".to_vec(), secs.clone()])
            }
            ("PSETEX", [key, millis, value]) => {
                self.set(key, value, &[b"PX".to_vec(), millis.clone()])
            }
            ("DEL", keys) if !keys.is_empty() => {
                let removed = keys.iter().filter(|k| self.live(k).is_some()).count();
                for key in keys {
                    self.keys.remove(key);
                }
                Ok(Value::Int(to_int(removed)))
            }
            ("EXISTS", keys) if !keys.is_empty() => Ok(Value::Int(to_int(
                keys.iter().filter(|k| self.live(k).is_some()).count(),
            ))),
            ("EXPIRE", [key, secs]) => self.expire(key, parse_int(secs)?.saturating_mul(1_000)),
            ("PEXPIRE", [key, millis]) => self.expire(key, parse_int(millis)?),
            ("PERSIST", [key]) => {
                let persisted = self
                    .live(key)
                    .is_some_and(|entry| entry.expires_at.is_some());
                if let Some(mut entry) = self.keys.get_mut(key.as_slice()) {
                    entry.expires_at = None;
                }
                Ok(Value::Int(i64::from(persisted)))
            }
            ("TTL", [key]) => Ok(Value::Int(self.remaining(key, 1_000))),
            ("PTTL", [key]) => Ok(Value::Int(self.remaining(key, 1))),
            ("INCR", [key]) => self.incr_by(key, 1),
            ("INCRBY", [key, delta]) => self.incr_by(key, parse_int(delta)?),
            ("HSET", [key, pairs @ ..]) if !pairs.is_empty() && pairs.len() % 2 == 0 => {
                self.hset(key, pairs)
            }
            ("HMSET", [key, pairs @ ..]) if !pairs.is_empty() && pairs.len() % 2 == 0 => {
                self.hset(key, pairs).map(|_| Value::Okay)
            }
            ("HDEL", [key, fields @ ..]) if !fields.is_empty() => self.hdel(key, fields),
            ("HGET", [key, field]) => {
                let hash = self.hash(key)?;
                Ok(hash
                    .and_then(|h| h.get(field).cloned())
                    .map_or(Value::Nil, Value::BulkString))
            }
            ("HMGET", [key, fields @ ..]) if !fields.is_empty() => {
                let hash = self.hash(key)?.unwrap_or_default();
                Ok(Value::Array(
                    fields
                        .iter()
                        .map(|f| hash.get(f).cloned().map_or(Value::Nil, Value::BulkString))
                        .collect(),
                ))
            }
            ("HGETALL", [key]) => {
                let hash = self.hash(key)?.unwrap_or_default();
                Ok(Value::Array(
                    hash.into_iter()
                        .flat_map(|(f, v)| [Value::BulkString(f), Value::BulkString(v)])
                        .collect(),
                ))
            }
            ("EVALSHA", [sha, numkeys, params @ ..]) => {
                self.eval(&String::from_utf8_lossy(sha), numkeys, params)
            }
            ("EVAL", [code, numkeys, params @ ..]) => {
                let sha = redis::Script::new(&String::from_utf8_lossy(code))
                    .get_hash()
                    .to_owned();
                self.eval(&sha, numkeys, params)
            }
            ("SCRIPT", [sub, code]) if sub.eq_ignore_ascii_case(b"LOAD") => {
                let sha = redis::Script::new(&String::from_utf8_lossy(code))
                    .get_hash()
                    .to_owned();
                Ok(Value::BulkString(sha.into_bytes()))
            }
            _ => Err(error(format!("ERR unsupported command '{name}'"))),
        }
    }

    fn set(&self, key: &[u8], value: &[u8], options: &[Vec<u8>]) -> RedisResult<Value> {
        let mut nx = false;
        let mut xx = false;
        let mut ttl_ms = None;
        let mut iter = options.iter();
        while let Some(opt) = iter.next() {
            let opt = String::from_utf8_lossy(opt).to_ascii_uppercase();
            match opt.as_str() {
                "NX" => nx = true,
                "XX" => xx = true,
                "EX" | "PX" => {
                    let amount = parse_int(iter.next().ok_or_else(syntax)?)?;
                    if amount <= 0 {
                        return Err(error("ERR invalid expire time in 'set' command"));
                    }
                    ttl_ms = Some(if opt == "EX" {
                        amount.saturating_mul(1_000)
                    } else {
                        amount
                    });
                }
                _ => return Err(syntax()),
            }
        }

        let exists = self.live(key).is_some();
        if (nx && exists) || (xx && !exists) {
            return Ok(Value::Nil);
        }
        self.keys.insert(
            key.to_vec(),
            Entry {
                data: Data::String(value.to_vec()),
                expires_at: ttl_ms.map(deadline),
            },
        );
        Ok(Value::Okay)
    }

    fn expire(&self, key: &[u8], millis: i64) -> RedisResult<Value> {
        if self.live(key).is_none() {
            return Ok(Value::Int(0));
        }
        if millis <= 0 {
            self.keys.remove(key);
        } else if let Some(mut entry) = self.keys.get_mut(key) {
            entry.expires_at = Some(deadline(millis));
        }
        Ok(Value::Int(1))
    }

    fn remaining(&self, key: &[u8], unit_ms: u128) -> i64 {
        match self.live(key) {
            None => -2,
            Some(Entry {
                expires_at: None, ..
            }) => -1,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => {
                let ms = at.saturating_duration_since(Instant::now()).as_millis();
                i64::try_from(ms.div_ceil(unit_ms)).unwrap_or(i64::MAX)
            }
        }
    }

    fn incr_by(&self, key: &[u8], delta: i64) -> RedisResult<Value> {
        let current = match self.live(key).map(|e| e.data) {
            None => 0,
            Some(Data::String(v)) => parse_int(&v)?,
            Some(Data::Hash(_)) => return Err(wrong_type()),
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| error("ERR increment or decrement would overflow"))?;
        let mut entry = self.keys.entry(key.to_vec()).or_insert(Entry {
            data: Data::String(Vec::new()),
            expires_at: None,
        });
        entry.data = Data::String(next.to_string().into_bytes());
        Ok(Value::Int(next))
    }

    fn hash(&self, key: &[u8]) -> RedisResult<Option<HashMap<Vec<u8>, Vec<u8>>>> {
        match self.live(key).map(|e| e.data) {
            None => Ok(None),
            Some(Data::Hash(h)) => Ok(Some(h)),
            Some(Data::String(_)) => Err(wrong_type()),
        }
    }

    fn hset(&self, key: &[u8], pairs: &[Vec<u8>]) -> RedisResult<Value> {
        let mut hash = self.hash(key)?.unwrap_or_default();
        let mut added = 0;
        for pair in pairs.chunks_exact(2) {
            if hash.insert(pair[0].clone(), pair[1].clone()).is_none() {
                added += 1;
            }
        }
        let expires_at = self.live(key).and_then(|e| e.expires_at);
        self.keys.insert(
            key.to_vec(),
            Entry {
                data: Data::Hash(hash),
                expires_at,
            },
        );
        Ok(Value::Int(added))
    }

    fn hdel(&self, key: &[u8], fields: &[Vec<u8>]) -> RedisResult<Value> {
        let Some(mut hash) = self.hash(key)? else {
            return Ok(Value::Int(0));
        };
        let removed = fields.iter().filter(|f| hash.remove(*f).is_some()).count();
        if hash.is_empty() {
            self.keys.remove(key);
        } else if let Some(mut entry) = self.keys.get_mut(key) {
            entry.data = Data::Hash(hash);
        }
        Ok(Value::Int(to_int(removed)))
    }

    fn eval(&self, sha: &str, numkeys: &[u8], params: &[Vec<u8>]) -> RedisResult<Value> {
        let numkeys = usize::try_from(parse_int(numkeys)?)
            .ok()
            .filter(|n| *n <= params.len())
            .ok_or_else(|| error("ERR Number of keys can't be greater than number of args"))?;
        let handler = self
            .scripts
            .get(sha)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| {
                RedisError::from((
                    ErrorKind::NoScriptError,
                    "NOSCRIPT No matching script. Please use EVAL.",
                ))
            })?;
        let (keys, argv) = params.split_at(numkeys);
        handler(self, keys, argv)
    }
}

impl std::fmt::Debug for MemoryRedis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRedis")
            .field("keys", &self.keys.len())
            .field("scripts", &self.scripts.len())
            .finish()
    }
}

impl ConnectionLike for MemoryRedis {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        let result = parse_commands(&cmd.get_packed_command()).and_then(|commands| {
            let args = commands.first().ok_or_else(syntax)?;
            self.execute(args)
        });
        Box::pin(std::future::ready(result))
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        let result = parse_commands(&cmd.get_packed_pipeline()).and_then(|commands| {
            let mut replies = Vec::with_capacity(commands.len());
            let mut queued: Option<Vec<Value>> = None;
            for args in &commands {
                let is = |name: &[u8]| args.first().is_some_and(|a| a.eq_ignore_ascii_case(name));
                if queued.is_none() && is(b"MULTI") {
                    queued = Some(Vec::new());
                    replies.push(Value::Okay);
                } else if is(b"EXEC") {
                    let tx = queued.take().ok_or_else(|| error("ERR EXEC without MULTI"))?;
                    replies.push(Value::Array(tx));
                } else if let Some(tx) = queued.as_mut() {
                    tx.push(self.execute(args)?);
                    replies.push(Value::SimpleString("QUEUED".to_owned()));
                } else {
                    replies.push(self.execute(args)?);
                }
            }
            Ok(replies.into_iter().skip(offset).take(count).collect())
        });
        Box::pin(std::future::ready(result))
    }

    fn get_db(&self) -> i64 {
        0
    }
}

/// A [`Connector`] handing out a shared [`MemoryRedis`].
///
/// Counts physical connect attempts and can delay or fail them.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    store: MemoryRedis,
    delay: Duration,
    attempts: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn new(store: MemoryRedis) -> Self {
        Self {
            store,
            delay: Duration::ZERO,
            attempts: Arc::new(AtomicUsize::new(0)),
            failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make every connect attempt take `delay` to complete.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next `count` connect attempts.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Connect attempts started so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &MemoryRedis {
        &self.store
    }
}

impl Connector for MemoryConnector {
    type Handle = MemoryRedis;

    fn connect(&self) -> BoxFuture<'static, Result<MemoryRedis, RedisError>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let store = self.store.clone();
        let delay = self.delay;

        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if fail {
                Err(RedisError::from((ErrorKind::IoError, "connection refused")))
            } else {
                Ok(store)
            }
        }
        .boxed()
    }
}

/// Split a RESP-encoded command stream into argument vectors.
fn parse_commands(mut packed: &[u8]) -> RedisResult<Vec<Vec<Vec<u8>>>> {
    let mut commands = Vec::new();
    while !packed.is_empty() {
        let count = read_header(&mut packed, b'*')?;
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            let len = read_header(&mut packed, b'$')?;
            if packed.len() < len + 2 {
                return Err(syntax());
            }
            args.push(packed[..len].to_vec());
            packed = &packed[len + 2..];
        }
        commands.push(args);
    }
    Ok(commands)
}

fn read_header(packed: &mut &[u8], marker: u8) -> RedisResult<usize> {
    if packed.first() != Some(&marker) {
        return Err(syntax());
    }
    let end = packed
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or_else(syntax)?;
    let value = std::str::from_utf8(&packed[1..end])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(syntax)?;
    *packed = &packed[end + 2..];
    Ok(value)
}

fn deadline(millis: i64) -> Instant {
    Instant::now() + Duration::from_millis(u64::try_from(millis).unwrap_or(0))
}

fn parse_int(raw: &[u8]) -> RedisResult<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| error("ERR value is not an integer or out of range"))
}

fn to_int(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn error(message: impl Into<String>) -> RedisError {
    RedisError::from((ErrorKind::ResponseError, "response error", message.into()))
}

fn syntax() -> RedisError {
    error("ERR syntax error")
}

fn wrong_type() -> RedisError {
    RedisError::from((
        ErrorKind::TypeError,
        "WRONGTYPE Operation against a key holding the wrong kind of value",
    ))
}

#[cfg(test)]
mod tests {
    use redis::AsyncCommands;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn keys_expire_with_tokio_time() {
        let mut store = MemoryRedis::new();
        let () = store
            .set_ex("session", "abc", 5)
            .await
            .expect("set with ttl");
        assert_eq!(store.ttl("session"), Some(Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(4)).await;
        let value: Option<String> = store.get("session").await.expect("get");
        assert_eq!(value.as_deref(), Some("abc"));

        tokio::time::advance(Duration::from_secs(1)).await;
        let value: Option<String> = store.get("session").await.expect("get");
        assert!(value.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn set_nx_only_creates() {
        let store = MemoryRedis::new();
        let first = store
            .call(&["SET", "lock", "a", "NX", "PX", "1000"])
            .expect("set");
        let second = store
            .call(&["SET", "lock", "b", "NX", "PX", "1000"])
            .expect("set");
        assert_eq!(first, Value::Okay);
        assert_eq!(second, Value::Nil);
        assert_eq!(
            store.call(&["GET", "lock"]).expect("get"),
            Value::BulkString(b"a".to_vec())
        );
    }

    #[tokio::test]
    async fn hash_commands_round_trip() {
        let mut store = MemoryRedis::new();
        let () = store
            .hset_multiple("h", &[("a", "1"), ("b", "2")])
            .await
            .expect("hmset");

        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg("h")
            .arg("a")
            .arg("missing")
            .arg("b")
            .query_async(&mut store)
            .await
            .expect("hmget");
        assert_eq!(
            values,
            vec![Some("1".to_owned()), None, Some("2".to_owned())]
        );
    }

    #[tokio::test]
    async fn wrong_type_is_an_error() {
        let store = MemoryRedis::new();
        store.call(&["HSET", "h", "f", "v"]).expect("hset");
        let err = store.call(&["GET", "h"]).expect_err("hash is not a string");
        assert_eq!(err.kind(), ErrorKind::TypeError);
    }

    #[tokio::test]
    async fn scripts_dispatch_by_hash() {
        const ECHO: &str = "return ARGV[1]";
        let mut store = MemoryRedis::new();
        store.register_script(ECHO, |_, _, argv| Ok(Value::BulkString(argv[0].clone())));

        let reply: String = redis::Script::new(ECHO)
            .arg("hello")
            .invoke_async(&mut store)
            .await
            .expect("script runs");
        assert_eq!(reply, "hello");

        let missing: RedisResult<i64> = redis::Script::new("return 1")
            .invoke_async(&mut store)
            .await;
        let err = missing.expect_err("script was never registered");
        assert_eq!(err.kind(), ErrorKind::NoScriptError);
    }

    #[tokio::test]
    async fn connector_counts_and_fails_attempts() {
        let connector = MemoryConnector::new(MemoryRedis::new());
        connector.fail_next(1);

        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
        assert_eq!(connector.attempts(), 2);
    }
}
