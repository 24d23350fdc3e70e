//! Redis implementation of the store seam.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{BucketArgs, CounterStore, ScriptReply, ScriptStore};
use crate::error::{Result, StoreError, TurnstileError};

/// A Redis client sharing one multiplexed connection.
///
/// The connection is opened on first use, so constructing the store never
/// touches the network.
pub struct RedisStore {
    client: redis::Client,
    connection: OnceCell<MultiplexedConnection>,
}

impl RedisStore {
    /// Parse `url` and prepare a client.
    pub fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| TurnstileError::Config(format!("invalid backend url: {}", e)))?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
        })
    }

    async fn connection(&self) -> std::result::Result<MultiplexedConnection, StoreError> {
        let conn = self
            .connection
            .get_or_try_init(|| async {
                let conn = self.client.get_multiplexed_async_connection().await?;
                info!("Connected to Redis backend");
                Ok::<_, StoreError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }

    fn script_cmd(cmd: &str, script: &str, key: &str, args: BucketArgs) -> redis::Cmd {
        let mut command = redis::cmd(cmd);
        command
            .arg(script)
            .arg(1)
            .arg(key)
            .arg(args.capacity)
            .arg(args.refill_rate)
            .arg(args.now)
            .arg(args.needed);
        command
    }

    async fn run_script(
        &self,
        command: redis::Cmd,
    ) -> std::result::Result<ScriptReply, StoreError> {
        let mut conn = self.connection().await?;
        let (allowed, remaining): (i64, String) = command.query_async(&mut conn).await?;
        Ok(ScriptReply { allowed, remaining })
    }
}

#[async_trait]
impl ScriptStore for RedisStore {
    async fn load_script(&self, body: &str) -> std::result::Result<String, StoreError> {
        let mut conn = self.connection().await?;
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(body)
            .query_async(&mut conn)
            .await?;
        debug!(sha = %sha, "Loaded script into Redis");
        Ok(sha)
    }

    async fn eval_sha(
        &self,
        sha: &str,
        key: &str,
        args: BucketArgs,
    ) -> std::result::Result<ScriptReply, StoreError> {
        self.run_script(Self::script_cmd("EVALSHA", sha, key, args))
            .await
    }

    async fn eval(
        &self,
        body: &str,
        key: &str,
        args: BucketArgs,
    ) -> std::result::Result<ScriptReply, StoreError> {
        self.run_script(Self::script_cmd("EVAL", body, key, args))
            .await
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn incr_by_float(
        &self,
        key: &str,
        amount: f64,
    ) -> std::result::Result<f64, StoreError> {
        let mut conn = self.connection().await?;
        let total: f64 = redis::cmd("INCRBYFLOAT")
            .arg(key)
            .arg(amount)
            .query_async(&mut conn)
            .await?;
        Ok(total)
    }

    async fn get_float(&self, key: &str) -> std::result::Result<Option<f64>, StoreError> {
        let mut conn = self.connection().await?;
        let value: Option<f64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> std::result::Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}
