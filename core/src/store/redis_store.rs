use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};

use super::RegistryStore;
use crate::instance::{Instance, Version, Versioned};
use crate::{Conflict, Error};

const KEY_PREFIX: &str = "ringkeeper";

// KEYS: records, versions, sequence
// ARGV: id, expected version ('' = absent), claims prefix, datacenter, token, record json
const PUT_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[2], ARGV[1])
if ARGV[2] == '' then
  if current then return {'version'} end
elseif current ~= ARGV[2] then
  return {'version'}
end
local claims = ARGV[3] .. ARGV[4]
local holder = redis.call('HGET', claims, ARGV[5])
if holder and holder ~= ARGV[1] then
  return {'token', holder}
end
local prior = redis.call('HGET', KEYS[1], ARGV[1])
if prior then
  local old = cjson.decode(prior)
  local old_claims = ARGV[3] .. old.datacenter
  if redis.call('HGET', old_claims, old.token) == ARGV[1] then
    redis.call('HDEL', old_claims, old.token)
  end
end
local version = redis.call('INCR', KEYS[3])
redis.call('HSET', KEYS[1], ARGV[1], ARGV[6])
redis.call('HSET', KEYS[2], ARGV[1], version)
redis.call('HSET', claims, ARGV[5], ARGV[1])
return {'ok', tostring(version)}
"#;

// KEYS: records, versions
// ARGV: id, claims prefix, expected version ('' = any)
const REMOVE_SCRIPT: &str = r#"
if ARGV[3] ~= '' and redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[3] then
  return 0
end
local prior = redis.call('HGET', KEYS[1], ARGV[1])
if prior then
  local old = cjson.decode(prior)
  local claims = ARGV[2] .. old.datacenter
  if redis.call('HGET', claims, old.token) == ARGV[1] then
    redis.call('HDEL', claims, old.token)
  end
end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
return 1
"#;

/// Redis-backed store.
///
/// Per application it keeps a hash of records, a hash of versions, one hash
/// of token claims per datacenter and a version counter. `put` and `remove`
/// run as Lua scripts so each is applied atomically. All keys of an
/// application share a hash tag; token claim keys are derived inside the
/// scripts, which requires a standalone (non-cluster) Redis.
pub struct RedisRegistryStore {
    conn: MultiplexedConnection,
    put_script: Script,
    remove_script: Script,
}

struct Keys {
    records: String,
    versions: String,
    sequence: String,
    claims_prefix: String,
}

impl Keys {
    fn for_application(application: &str) -> Self {
        let base = format!("{KEY_PREFIX}:{{{application}}}");
        Self {
            records: format!("{base}:instances"),
            versions: format!("{base}:versions"),
            sequence: format!("{base}:sequence"),
            claims_prefix: format!("{base}:tokens:"),
        }
    }
}

impl RedisRegistryStore {
    pub async fn connect(redis_url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::info!("Connected registry store to Redis");
        Ok(Self::new(conn))
    }

    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            put_script: Script::new(PUT_SCRIPT),
            remove_script: Script::new(REMOVE_SCRIPT),
        }
    }
}

fn decode(raw: &str) -> Result<Instance, Error> {
    serde_json::from_str(raw).map_err(|e| Error::unavailable(format!("corrupt record: {e}")))
}

#[async_trait]
impl RegistryStore for RedisRegistryStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn list(&self, application: &str) -> Result<Vec<Instance>, Error> {
        let keys = Keys::for_application(application);
        let mut conn = self.conn.clone();

        // HVALS ringkeeper:{app}:instances
        let values: Vec<String> = conn.hvals(&keys.records).await?;
        values.iter().map(|raw| decode(raw)).collect()
    }

    async fn fetch(
        &self,
        application: &str,
        id: u32,
    ) -> Result<Option<Versioned<Instance>>, Error> {
        let keys = Keys::for_application(application);
        let mut conn = self.conn.clone();

        let (record, version): (Option<String>, Option<u64>) = redis::pipe()
            .atomic()
            .hget(&keys.records, id)
            .hget(&keys.versions, id)
            .query_async(&mut conn)
            .await?;

        match (record, version) {
            (Some(raw), Some(version)) => Ok(Some(Versioned::new(decode(&raw)?, Version(version)))),
            _ => Ok(None),
        }
    }

    async fn put(&self, instance: &Instance, expected: Option<Version>) -> Result<Version, Error> {
        let keys = Keys::for_application(&instance.application);
        let mut conn = self.conn.clone();
        let record = serde_json::to_string(instance)
            .map_err(|e| Error::invalid(format!("unencodable instance: {e}")))?;
        let expected = expected.map(|v| v.0.to_string()).unwrap_or_default();

        let reply: Vec<String> = self
            .put_script
            .key(&keys.records)
            .key(&keys.versions)
            .key(&keys.sequence)
            .arg(instance.id)
            .arg(expected)
            .arg(&keys.claims_prefix)
            .arg(&instance.datacenter)
            .arg(instance.token.to_string())
            .arg(record)
            .invoke_async(&mut conn)
            .await?;

        match reply.first().map(String::as_str) {
            Some("ok") => reply
                .get(1)
                .and_then(|v| v.parse().ok())
                .map(Version)
                .ok_or_else(|| Error::unavailable("malformed put reply")),
            Some("token") => Err(Conflict::Token {
                token: instance.token,
                holder: reply.get(1).and_then(|h| h.parse().ok()),
            }
            .into()),
            Some("version") => Err(Conflict::Version { id: instance.id }.into()),
            _ => Err(Error::unavailable(format!("unexpected put reply {reply:?}"))),
        }
    }

    async fn remove(
        &self,
        application: &str,
        id: u32,
        expected: Option<Version>,
    ) -> Result<(), Error> {
        let keys = Keys::for_application(application);
        let mut conn = self.conn.clone();
        let expected = expected.map(|v| v.0.to_string()).unwrap_or_default();

        let removed: i64 = self
            .remove_script
            .key(&keys.records)
            .key(&keys.versions)
            .arg(id)
            .arg(&keys.claims_prefix)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;

        if removed == 0 {
            return Err(Conflict::Version { id }.into());
        }
        Ok(())
    }
}
