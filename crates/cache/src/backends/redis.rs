//! Redis cache backend.
//!
//! Each project owns three keys, read and written together by Lua scripts
//! so no reader ever sees half an update:
//! - `snapshot:{project}`: snapshot JSON
//! - `start-version:{project}`: start version, whose presence marks a hit
//! - `changes:{project}`: list of change JSON
//!
//! The braces are Redis Cluster hash tags keeping all three in one slot.

use crate::error::CacheResult;
use crate::traits::{CacheBackend, CacheMetadata, RawCacheEntry};
use async_trait::async_trait;
use folio_core::ProjectId;
use redis::Script;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::instrument;

const GET_CHUNK_LUA: &str = r#"
local startVersion = redis.call('GET', KEYS[2])
if not startVersion then
  return nil
end
local snapshot = redis.call('GET', KEYS[1])
if not snapshot then
  return nil
end
local changes = redis.call('LRANGE', KEYS[3], 0, -1)
return {snapshot, startVersion, changes}
"#;

const GET_METADATA_LUA: &str = r#"
local startVersion = redis.call('GET', KEYS[1])
if not startVersion then
  return nil
end
return {startVersion, redis.call('LLEN', KEYS[2])}
"#;

// Changes are pushed in slices to stay under Lua's unpack limit.
const SET_CHUNK_LUA: &str = r#"
local ttl = tonumber(ARGV[3])
redis.call('SET', KEYS[1], ARGV[1], 'EX', ttl)
redis.call('SET', KEYS[2], ARGV[2], 'EX', ttl)
redis.call('DEL', KEYS[3])
for i = 4, #ARGV, 1000 do
  redis.call('RPUSH', KEYS[3], unpack(ARGV, i, math.min(i + 999, #ARGV)))
end
if #ARGV > 3 then
  redis.call('EXPIRE', KEYS[3], ttl)
end
return 'ok'
"#;

const CLEAR_LUA: &str = r#"
return redis.call('DEL', KEYS[1], KEYS[2], KEYS[3])
"#;

fn snapshot_key(project_id: &ProjectId) -> String {
    format!("snapshot:{{{project_id}}}")
}

fn start_version_key(project_id: &ProjectId) -> String {
    format!("start-version:{{{project_id}}}")
}

fn changes_key(project_id: &ProjectId) -> String {
    format!("changes:{{{project_id}}}")
}

/// Redis-backed cache shared between processes.
pub struct RedisCacheBackend {
    conn: ConnectionManager,
    get_chunk: Script,
    get_metadata: Script,
    set_chunk: Script,
    clear: Script,
}

impl RedisCacheBackend {
    /// Connect to Redis. The connection manager reconnects on its own.
    pub async fn connect(url: &str) -> CacheResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            get_chunk: Script::new(GET_CHUNK_LUA),
            get_metadata: Script::new(GET_METADATA_LUA),
            set_chunk: Script::new(SET_CHUNK_LUA),
            clear: Script::new(CLEAR_LUA),
        })
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    #[instrument(skip(self), fields(project_id = %project_id))]
    async fn get_chunk(&self, project_id: &ProjectId) -> CacheResult<Option<RawCacheEntry>> {
        let mut conn = self.conn.clone();
        let result: Option<(String, i64, Vec<String>)> = self
            .get_chunk
            .key(snapshot_key(project_id))
            .key(start_version_key(project_id))
            .key(changes_key(project_id))
            .invoke_async(&mut conn)
            .await?;
        Ok(result.map(|(snapshot, start_version, changes)| RawCacheEntry {
            snapshot,
            start_version,
            changes,
        }))
    }

    #[instrument(skip(self), fields(project_id = %project_id))]
    async fn get_chunk_metadata(
        &self,
        project_id: &ProjectId,
    ) -> CacheResult<Option<CacheMetadata>> {
        let mut conn = self.conn.clone();
        let result: Option<(i64, i64)> = self
            .get_metadata
            .key(start_version_key(project_id))
            .key(changes_key(project_id))
            .invoke_async(&mut conn)
            .await?;
        Ok(result.map(|(start_version, changes_count)| CacheMetadata {
            start_version,
            changes_count,
        }))
    }

    #[instrument(skip(self, entry), fields(project_id = %project_id))]
    async fn set_chunk(
        &self,
        project_id: &ProjectId,
        entry: RawCacheEntry,
        ttl: Duration,
    ) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let mut invocation = self.set_chunk.prepare_invoke();
        invocation
            .key(snapshot_key(project_id))
            .key(start_version_key(project_id))
            .key(changes_key(project_id))
            .arg(entry.snapshot)
            .arg(entry.start_version)
            .arg(ttl.as_secs().max(1));
        for change in entry.changes {
            invocation.arg(change);
        }
        let _: String = invocation.invoke_async(&mut conn).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(project_id = %project_id))]
    async fn clear(&self, project_id: &ProjectId) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .clear
            .key(snapshot_key(project_id))
            .key(start_version_key(project_id))
            .key(changes_key(project_id))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_share_hash_tag() {
        let project = ProjectId::parse("42").unwrap();
        assert_eq!(snapshot_key(&project), "snapshot:{42}");
        assert_eq!(start_version_key(&project), "start-version:{42}");
        assert_eq!(changes_key(&project), "changes:{42}");
    }
}
