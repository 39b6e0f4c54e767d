use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;

use crate::{as_number, merge_values, numeric_value, StateStore, StoreError};

#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    /// Prepended to every key, on top of session namespacing.
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
            key_prefix: "sandbox:".to_string(),
        }
    }
}

/// `increment` as a server-side atomic read-add-write that keeps any
/// remaining TTL.
const INCR_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
local new = (tonumber(cur) or 0) + tonumber(ARGV[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl > 0 then
  redis.call('SET', KEYS[1], tostring(new), 'PX', ttl)
else
  redis.call('SET', KEYS[1], tostring(new))
end
return tostring(new)
"#;

/// `patch` as a server-side compare-and-merge: object keys override, arrays
/// concatenate, anything else replaces; remaining TTL is re-applied.
///
/// Shapes are read off the JSON text (first non-space byte) rather than the
/// decoded Lua tables, because cjson decodes `{}` and `[]` to the same empty
/// table. The empty-array cases bypass re-encoding for the same reason.
const PATCH_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
local merged = ARGV[1]
if cur then
  local ek = string.match(cur, '%S')
  local ik = string.match(ARGV[1], '%S')
  if ek == '{' and ik == '{' then
    local okA, existing = pcall(cjson.decode, cur)
    local okB, incoming = pcall(cjson.decode, ARGV[1])
    if okA and okB then
      for k, v in pairs(incoming) do existing[k] = v end
      local okC, encoded = pcall(cjson.encode, existing)
      if okC then
        merged = encoded
      end
    end
  elseif ek == '[' and ik == '[' then
    local okA, existing = pcall(cjson.decode, cur)
    local okB, incoming = pcall(cjson.decode, ARGV[1])
    if okA and okB then
      if next(incoming) == nil then
        merged = cur
      elseif next(existing) == nil then
        merged = ARGV[1]
      else
        for _, v in ipairs(incoming) do table.insert(existing, v) end
        local okC, encoded = pcall(cjson.encode, existing)
        if okC then
          merged = encoded
        end
      end
    end
  end
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl > 0 then
  redis.call('SET', KEYS[1], merged, 'PX', ttl)
else
  redis.call('SET', KEYS[1], merged)
end
return merged
"#;

/// Networked key-value backend. Values travel as JSON text; `set` with a TTL
/// uses atomic set-with-expiry; `increment` and `patch` run as Lua scripts
/// and fall back to non-atomic read-merge-write on engines without
/// scripting (the only operation whose semantics change by backend).
pub struct RedisStore {
    conn: ConnectionManager,
    key_prefix: String,
    incr_script: redis::Script,
    patch_script: redis::Script,
    scripting: AtomicBool,
}

impl RedisStore {
    pub async fn connect(config: RedisStoreConfig) -> Result<Self, StoreError> {
        let auth = config
            .password
            .as_deref()
            .map(|p| format!(":{p}@"))
            .unwrap_or_default();
        let url = format!("redis://{}{}:{}/{}", auth, config.host, config.port, config.db);

        let client = redis::Client::open(url).map_err(backend)?;
        let conn = ConnectionManager::new(client).await.map_err(backend)?;
        tracing::info!(host = %config.host, port = config.port, "redis store connected");

        Ok(Self {
            conn,
            key_prefix: config.key_prefix,
            incr_script: redis::Script::new(INCR_SCRIPT),
            patch_script: redis::Script::new(PATCH_SCRIPT),
            scripting: AtomicBool::new(true),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn decode(raw: String) -> Value {
        // values we wrote are JSON; anything else is kept as an opaque string
        serde_json::from_str(&raw).unwrap_or(Value::String(raw))
    }

    async fn remaining_ttl_secs(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn.clone();
        let pttl: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok((pttl > 0).then(|| (pttl as u64).div_ceil(1000)))
    }
}

fn backend(e: redis::RedisError) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.full_key(key)).await.map_err(backend)?;
        Ok(raw.map(Self::decode))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<u64>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = self.full_key(key);
        let payload = serde_json::to_string(&value)?;
        match ttl {
            Some(secs) => {
                let _: () = conn.set_ex(key, payload, secs).await.map_err(backend)?;
            }
            None => {
                let _: () = conn.set(key, payload).await.map_err(backend)?;
            }
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.full_key(key)).await.map_err(backend)?;
        Ok(())
    }

    async fn increment(&self, key: &str, by: f64) -> Result<Value, StoreError> {
        let key = self.full_key(key);

        if self.scripting.load(Ordering::Relaxed) {
            let mut conn = self.conn.clone();
            let attempt: Result<String, _> = self
                .incr_script
                .key(&key)
                .arg(by)
                .invoke_async(&mut conn)
                .await;
            match attempt {
                Ok(raw) => {
                    let n = raw.parse::<f64>().unwrap_or(0.0);
                    return Ok(numeric_value(n));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "redis scripting unavailable, degrading to non-atomic increment");
                    self.scripting.store(false, Ordering::Relaxed);
                }
            }
        }

        // non-atomic fallback: read, add, write back with remaining TTL
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(&key).await.map_err(backend)?;
        let current = raw.map(Self::decode);
        let new_value = numeric_value(as_number(current.as_ref()) + by);
        let ttl = self.remaining_ttl_secs(&key).await?;
        let payload = serde_json::to_string(&new_value)?;
        match ttl {
            Some(secs) => {
                let _: () = conn.set_ex(&key, payload, secs).await.map_err(backend)?;
            }
            None => {
                let _: () = conn.set(&key, payload).await.map_err(backend)?;
            }
        }
        Ok(new_value)
    }

    async fn patch(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let key = self.full_key(key);
        let payload = serde_json::to_string(&value)?;

        if self.scripting.load(Ordering::Relaxed) {
            let mut conn = self.conn.clone();
            let attempt: Result<String, _> = self
                .patch_script
                .key(&key)
                .arg(&payload)
                .invoke_async(&mut conn)
                .await;
            match attempt {
                Ok(_) => return Ok(()),
                Err(e) => {
                    tracing::warn!(error = %e, "redis scripting unavailable, degrading to non-atomic patch");
                    self.scripting.store(false, Ordering::Relaxed);
                }
            }
        }

        // last-write-wins fallback
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(&key).await.map_err(backend)?;
        let merged = match raw.map(Self::decode) {
            Some(existing) => merge_values(&existing, value),
            None => value,
        };
        let ttl = self.remaining_ttl_secs(&key).await?;
        let payload = serde_json::to_string(&merged)?;
        match ttl {
            Some(secs) => {
                let _: () = conn.set_ex(&key, payload, secs).await.map_err(backend)?;
            }
            None => {
                let _: () = conn.set(&key, payload).await.map_err(backend)?;
            }
        }
        Ok(())
    }

    /// The multiplexed connection is released on drop.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
