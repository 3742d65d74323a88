// Redis backend for the collection store contract.
//
// Field commands share one multiplexed connection per store; every
// listener gets its own pub/sub connection so that its subscription is
// counted independently by PUBSUB NUMSUB.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{AsyncCommands, Client, RedisResult};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::{CollectionStore, ListenerSession};
use crate::config::MapConfig;
use crate::error::{MapError, Result};

/// Collection store backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
    command_timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.client.get_connection_info().addr)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Open the shared command connection described by `config`.
    pub async fn connect(config: &MapConfig) -> Result<Self> {
        let client = Client::open(config.redis_url())?;
        let command_timeout = config.command_timeout();
        let conn =
            bounded("CONNECT", command_timeout, client.get_multiplexed_tokio_connection()).await?;
        debug!(addr = %client.get_connection_info().addr, "connected to redis");
        if config.db != 0 {
            debug!(db = config.db, "liveness channels are shared by every database on the server");
        }
        Ok(Self { client, conn, command_timeout })
    }

    async fn run<T, F>(&self, command: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        bounded(command, self.command_timeout, fut).await
    }
}

async fn bounded<T, F>(command: &'static str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = RedisResult<T>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result.map_err(MapError::from),
        Err(_) => Err(MapError::Timeout { command, timeout: limit }),
    }
}

impl CollectionStore for RedisStore {
    type Listener = RedisListener;

    async fn field_count(&self, name: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        self.run("HLEN", conn.hlen::<_, usize>(name)).await
    }

    async fn field_exists(&self, name: &str, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        self.run("HEXISTS", conn.hexists::<_, _, bool>(name, key)).await
    }

    async fn field_get(&self, name: &str, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.run("HGET", conn.hget::<_, _, Option<String>>(name, key)).await
    }

    async fn field_replace(&self, name: &str, key: &str, value: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let (previous,): (Option<String>,) = self
            .run(
                "HSET",
                redis::pipe()
                    .atomic()
                    .hget(name, key)
                    .hset(name, key, value)
                    .ignore()
                    .query_async(&mut conn),
            )
            .await?;
        Ok(previous)
    }

    async fn field_set_many(&self, name: &str, entries: &[(String, String)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        self.run("HSET", conn.hset_multiple::<_, _, _, ()>(name, entries)).await
    }

    async fn field_take(&self, name: &str, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let (previous,): (Option<String>,) = self
            .run(
                "HDEL",
                redis::pipe().atomic().hget(name, key).hdel(name, key).ignore().query_async(&mut conn),
            )
            .await?;
        Ok(previous)
    }

    async fn all_fields(&self, name: &str) -> Result<HashSet<String>> {
        let mut conn = self.conn.clone();
        self.run("HKEYS", conn.hkeys::<_, HashSet<String>>(name)).await
    }

    async fn all_values(&self, name: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        self.run("HVALS", conn.hvals::<_, Vec<String>>(name)).await
    }

    async fn all_entries(&self, name: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        self.run("HGETALL", conn.hgetall::<_, HashMap<String, String>>(name)).await
    }

    async fn delete_collection(&self, name: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: usize = self.run("DEL", conn.del::<_, usize>(name)).await?;
        Ok(removed > 0)
    }

    async fn subscriber_count(&self, channel: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let (_, count): (String, usize) = self
            .run(
                "PUBSUB NUMSUB",
                redis::cmd("PUBSUB").arg("NUMSUB").arg(channel).query_async(&mut conn),
            )
            .await?;
        Ok(count)
    }

    async fn listen(&self, channel: &str) -> Result<RedisListener> {
        let conn = self.run("CONNECT", self.client.get_async_connection()).await?;
        let mut pubsub = conn.into_pubsub();
        self.run("SUBSCRIBE", pubsub.subscribe(channel)).await?;
        Ok(RedisListener {
            pubsub,
            channel: channel.to_string(),
            command_timeout: self.command_timeout,
        })
    }
}

/// Dedicated pub/sub connection holding one liveness subscription.
pub struct RedisListener {
    pubsub: PubSub,
    channel: String,
    command_timeout: Duration,
}

impl ListenerSession for RedisListener {
    async fn serve(mut self, mut stop: oneshot::Receiver<()>) -> Result<u64> {
        let mut seen = 0u64;
        {
            let mut messages = self.pubsub.on_message();
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    message = messages.next() => match message {
                        Some(message) => {
                            seen += 1;
                            trace!(channel = message.get_channel_name(), "ignoring liveness channel payload");
                        }
                        None => {
                            return Err(MapError::subscription(
                                &self.channel,
                                "pub/sub connection closed by the store",
                            ));
                        }
                    },
                }
            }
        }
        bounded("UNSUBSCRIBE", self.command_timeout, self.pubsub.unsubscribe(&self.channel))
            .await?;
        Ok(seen)
    }
}
