use crate::error::SnapError;
use crate::services::SnapshotCache;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::time::Duration;

/// Raw snapshots kept in Redis for point lookups, one key per host.
#[derive(Clone)]
pub struct RedisSnapshotCache {
    conn: MultiplexedConnection,
}

impl RedisSnapshotCache {
    pub async fn connect(client: &redis::Client) -> Result<Self, redis::RedisError> {
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

fn set_command(key: &str, payload: &str, ttl: Duration) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(payload).arg("EX").arg(ttl.as_secs().max(1));
    cmd
}

#[async_trait]
impl SnapshotCache for RedisSnapshotCache {
    async fn set_snapshot(&self, key: &str, payload: &str, ttl: Duration) -> Result<(), SnapError> {
        let mut conn = self.conn.clone();
        let _: () = set_command(key, payload, ttl).query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_carries_expiry_in_seconds() {
        let packed = set_command("cc:v3:snapshot:7", "{}", Duration::from_secs(600))
            .get_packed_command();
        let text = String::from_utf8(packed).expect("resp is ascii here");
        assert!(text.contains("SET"));
        assert!(text.contains("cc:v3:snapshot:7"));
        assert!(text.contains("EX"));
        assert!(text.contains("600"));
    }

    #[test]
    fn sub_second_ttl_rounds_up_to_one() {
        let packed = set_command("k", "v", Duration::from_millis(10)).get_packed_command();
        let text = String::from_utf8(packed).expect("resp is ascii here");
        assert!(text.ends_with("$1\r\n1\r\n"));
    }
}
