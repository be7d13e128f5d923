//! Redis [`CacheStore`] over a reconnecting `ConnectionManager`.

use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::Client;
use async_trait::async_trait;
use tracing::info;

use anyhow::{Context, Result};

use super::CacheStore;

// ---

#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

impl RedisCache {
    // ---
    pub async fn connect(url: &str) -> Result<Self> {
        // ---
        let client = Client::open(url).with_context(|| format!("invalid CACHE_URL '{url}'"))?;
        let mut conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;

        let pong: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        info!("Connected to redis cache ({pong})");

        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    // ---
    async fn get(&self, key: &str) -> Result<Option<String>> {
        // ---
        let mut conn = self.conn.clone();
        let value: Option<String> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        // ---
        let mut conn = self.conn.clone();
        let _: () = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        // ---
        let mut conn = self.conn.clone();
        // Nil reply: the key already held a value
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn zadd_bounded(
        &self,
        key: &str,
        score: i64,
        member: &str,
        max_len: usize,
        ttl: Duration,
    ) -> Result<usize> {
        // ---
        let mut conn = self.conn.clone();
        // Ranks are ascending by score, so dropping ranks 0..=-(max_len+1)
        // keeps the newest `max_len` members
        let keep_from = -(max_len.max(1) as i64) - 1;
        let (size,): (usize,) = ::redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .ignore()
            .cmd("ZREMRANGEBYRANK")
            .arg(key)
            .arg(0)
            .arg(keep_from)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(size)
    }

    async fn zrange_by_score(&self, key: &str, min: i64, max: i64) -> Result<Vec<String>> {
        // ---
        let mut conn = self.conn.clone();
        let members: Vec<String> = ::redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn zmin_score(&self, key: &str) -> Result<Option<i64>> {
        // ---
        let mut conn = self.conn.clone();
        let first: Vec<(String, f64)> = ::redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(first.first().map(|(_, score)| *score as i64))
    }
}
