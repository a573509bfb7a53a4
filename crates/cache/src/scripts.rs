//! Lua scripts executed server-side so that each cache write and each
//! read-with-refresh is a single atomic step.

/// Lua script writing a cache entry.
///
/// KEYS\[1\] = entry key
/// ARGV\[1\] = absolute expiration in ticks (-1 when absent)
/// ARGV\[2\] = sliding expiration in ticks (-1 when absent)
/// ARGV\[3\] = TTL in seconds (-1 for no expiry)
/// ARGV\[4\] = payload
///
/// An entry overwritten without expiration loses any TTL left over from the
/// previous value. Returns 1.
pub const SET_ENTRY: &str = r"
redis.call('HSET', KEYS[1], 'absexp', ARGV[1], 'sldexp', ARGV[2], 'data', ARGV[4])
if ARGV[3] ~= '-1' then
    redis.call('EXPIRE', KEYS[1], ARGV[3])
else
    redis.call('PERSIST', KEYS[1])
end
return 1
";

/// Lua script reading a cache entry and sliding its expiration.
///
/// KEYS\[1\] = entry key
/// ARGV\[1\] = current time in ticks
/// ARGV\[2\] = '1' to return the payload, '0' to only refresh
///
/// Returns false when the entry does not exist, or when its absolute
/// expiration has been reached (the key is deleted then). Otherwise the TTL is
/// re-applied when the entry has a sliding component (the larger of the
/// sliding window and the time left until the absolute limit, at least one
/// second) and the reply is `{absexp, sldexp, data}` or 1.
pub const GET_AND_REFRESH: &str = r"
local fields = redis.call('HMGET', KEYS[1], 'absexp', 'sldexp', 'data')
if not fields[1] and not fields[2] and not fields[3] then
    return false
end
local now = tonumber(ARGV[1])
local absolute = tonumber(fields[1])
if absolute and absolute > -1 and absolute <= now then
    redis.call('DEL', KEYS[1])
    return false
end
local sliding = tonumber(fields[2])
if sliding and sliding > -1 then
    local ttl = sliding
    if absolute and absolute > -1 then
        local remaining = absolute - now
        if remaining > ttl then
            ttl = remaining
        end
    end
    local seconds = math.floor(ttl / 10000000)
    if seconds < 1 then
        seconds = 1
    end
    redis.call('EXPIRE', KEYS[1], seconds)
end
if ARGV[2] == '1' then
    return fields
end
return 1
";
