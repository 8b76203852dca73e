use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use tracing::{debug, info, warn};

use super::{IngestRecord, IngestSource};
use crate::config::SourceConfig;

/// Pops raw log records off a Redis list with BRPOP.
pub struct RedisListSource {
    client: redis::Client,
    connection: Option<MultiplexedConnection>,
    list_key: String,
    poll_timeout_secs: u64,
    records_pulled: u64,
}

impl RedisListSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .with_context(|| format!("Invalid Redis URL: {}", config.redis_url))?;

        info!("Redis source configured for list '{}'", config.list_key);

        Ok(Self {
            client,
            connection: None,
            list_key: config.list_key.clone(),
            poll_timeout_secs: config.poll_timeout_secs,
            records_pulled: 0,
        })
    }

    async fn connection(&mut self) -> Result<&mut MultiplexedConnection> {
        if self.connection.is_none() {
            let connection = self
                .client
                .get_multiplexed_async_connection()
                .await
                .context("Failed to connect to Redis")?;
            info!("Connected to Redis, polling list '{}'", self.list_key);
            self.connection = Some(connection);
        }
        self.connection
            .as_mut()
            .context("Redis connection unavailable")
    }
}

#[async_trait::async_trait]
impl IngestSource for RedisListSource {
    async fn next_record(&mut self) -> Result<Option<IngestRecord>> {
        loop {
            let list_key = self.list_key.clone();
            let timeout = self.poll_timeout_secs;
            let connection = self.connection().await?;

            // BRPOP answers nil on timeout, or [list, value]. The value stays as
            // bytes so a non-UTF-8 record is skipped at decode time, not lost here.
            let reply: redis::RedisResult<Option<(Vec<u8>, Vec<u8>)>> = redis::cmd("BRPOP")
                .arg(&list_key)
                .arg(timeout)
                .query_async(connection)
                .await;

            match reply {
                Ok(Some((_list, raw))) => {
                    self.records_pulled += 1;
                    return Ok(Some(IngestRecord::new(raw)));
                }
                Ok(None) => {
                    debug!("No records on '{}' within {}s", list_key, timeout);
                }
                Err(e) => {
                    warn!("BRPOP on '{}' failed: {}", list_key, e);
                    // Reconnect on the next call.
                    self.connection = None;
                    return Err(e).context("Failed to pop from Redis list");
                }
            }
        }
    }

    fn records_pulled(&self) -> u64 {
        self.records_pulled
    }

    fn name(&self) -> &'static str {
        "redis_list"
    }
}
