//! Test support: Rust emulations of the lock scripts for
//! [`MemoryRedis`](keyward_connection::testing::MemoryRedis).

use keyward_connection::testing::MemoryRedis;
use redis::{ErrorKind, RedisError, RedisResult, Value};

use crate::scripts;

/// A fresh in-memory store that understands the lock scripts.
pub fn memory_store() -> MemoryRedis {
    let store = MemoryRedis::new();
    register_scripts(&store);
    store
}

pub fn register_scripts(store: &MemoryRedis) {
    store.register_script(scripts::LOCK_RELEASE, |store, keys, argv| {
        let ([key], [token]) = (keys, argv) else {
            return Err(arity());
        };
        if !holds(store, key, token)? {
            return Ok(Value::Int(0));
        }
        store.call(&[b"DEL".as_slice(), key.as_slice()])
    });
    store.register_script(scripts::LOCK_EXTEND, |store, keys, argv| {
        let ([key], [token, ttl_ms]) = (keys, argv) else {
            return Err(arity());
        };
        if !holds(store, key, token)? {
            return Ok(Value::Int(0));
        }
        store.call(&[b"PEXPIRE".as_slice(), key.as_slice(), ttl_ms.as_slice()])
    });
}

fn holds(store: &MemoryRedis, key: &[u8], token: &[u8]) -> RedisResult<bool> {
    let current = store.call(&[b"GET".as_slice(), key])?;
    Ok(current == Value::BulkString(token.to_vec()))
}

fn arity() -> RedisError {
    RedisError::from((
        ErrorKind::ResponseError,
        "ERR wrong number of arguments for script",
    ))
}
