//! Test support: Rust emulations of the cache scripts for
//! [`MemoryRedis`](keyward_connection::testing::MemoryRedis).

use keyward_connection::testing::MemoryRedis;
use redis::{ErrorKind, RedisError, RedisResult, Value};

use crate::expiration::{NOT_PRESENT, absolute_reached, refresh_ttl, ttl_seconds};
use crate::scripts;

/// A fresh in-memory store that understands the cache scripts.
pub fn memory_store() -> MemoryRedis {
    let store = MemoryRedis::new();
    register_scripts(&store);
    store
}

/// Teach `store` to run [`scripts::SET_ENTRY`] and
/// [`scripts::GET_AND_REFRESH`].
pub fn register_scripts(store: &MemoryRedis) {
    store.register_script(scripts::SET_ENTRY, set_entry);
    store.register_script(scripts::GET_AND_REFRESH, get_and_refresh);
}

fn set_entry(store: &MemoryRedis, keys: &[Vec<u8>], argv: &[Vec<u8>]) -> RedisResult<Value> {
    let ([key], [absolute, sliding, ttl, data]) = (keys, argv) else {
        return Err(arity());
    };
    store.call(&[
        b"HSET".as_slice(),
        key.as_slice(),
        b"absexp".as_slice(),
        absolute.as_slice(),
        b"sldexp".as_slice(),
        sliding.as_slice(),
        b"data".as_slice(),
        data.as_slice(),
    ])?;
    if ttl.as_slice() == b"-1" {
        store.call(&[b"PERSIST".as_slice(), key.as_slice()])?;
    } else {
        store.call(&[b"EXPIRE".as_slice(), key.as_slice(), ttl.as_slice()])?;
    }
    Ok(Value::Int(1))
}

fn get_and_refresh(store: &MemoryRedis, keys: &[Vec<u8>], argv: &[Vec<u8>]) -> RedisResult<Value> {
    let ([key], [now, include_data]) = (keys, argv) else {
        return Err(arity());
    };
    let Value::Array(fields) = store.call(&[
        b"HMGET".as_slice(),
        key.as_slice(),
        b"absexp".as_slice(),
        b"sldexp".as_slice(),
        b"data".as_slice(),
    ])?
    else {
        return Err(arity());
    };
    if fields.iter().all(|field| *field == Value::Nil) {
        return Ok(Value::Nil);
    }

    let int = |field: &Value| {
        redis::from_redis_value::<Option<i64>>(field)
            .ok()
            .flatten()
            .unwrap_or(NOT_PRESENT)
    };
    let now: i64 = redis::from_redis_value(&Value::BulkString(now.clone()))?;
    let absolute = int(&fields[0]);
    if absolute_reached(absolute, now) {
        store.call(&[b"DEL".as_slice(), key.as_slice()])?;
        return Ok(Value::Nil);
    }
    if let Some(ttl) = refresh_ttl(absolute, int(&fields[1]), now) {
        let seconds = ttl_seconds(ttl).to_string();
        store.call(&[b"EXPIRE".as_slice(), key.as_slice(), seconds.as_bytes()])?;
    }

    if include_data.as_slice() == b"1" {
        Ok(Value::Array(fields))
    } else {
        Ok(Value::Int(1))
    }
}

fn arity() -> RedisError {
    RedisError::from((
        ErrorKind::ResponseError,
        "ERR wrong number of arguments for script",
    ))
}
