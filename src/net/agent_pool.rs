//! Agent reverse-RPC connection pool (spec §4.8, C8): a persistent TCP
//! channel per connected agent, pooled per `obj_hash`, leased out for
//! server-initiated commands (thread dump, heap dump, config push) and
//! kept warm by a keepalive daemon.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, Notify};

use crate::error::{Result, ServerError};
use crate::wire::magic::{FLAG_HAS_NEXT, FLAG_NO_NEXT};
use crate::wire::r#async::{read_pack_v1_async, read_pack_v2_async, write_pack_v1_async, write_pack_v2_async, write_text_async};
use crate::wire::Pack;

/// Any duplex byte stream an agent channel can run over — a real
/// `TcpStream` in production, an in-memory `tokio::io::DuplexStream` half in
/// tests.
pub trait AgentStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AgentStream for T {}

pub struct AgentChannel {
    pub obj_hash: i32,
    stream: Box<dyn AgentStream>,
    v2: bool,
    last_write_ms: i64,
}

impl AgentChannel {
    pub fn new(obj_hash: i32, stream: Box<dyn AgentStream>, v2: bool) -> Self {
        Self {
            obj_hash,
            stream,
            v2,
            last_write_ms: now_millis(),
        }
    }

    async fn write_pack(&mut self, pack: &Pack) -> Result<()> {
        if self.v2 {
            write_pack_v2_async(&mut self.stream, pack).await
        } else {
            write_pack_v1_async(&mut self.stream, pack).await
        }
    }

    async fn read_pack(&mut self) -> Result<Option<Pack>> {
        if self.v2 {
            read_pack_v2_async(&mut self.stream).await
        } else {
            read_pack_v1_async(&mut self.stream).await.map(Some)
        }
    }

    async fn read_flag(&mut self) -> Result<u8> {
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 1];
        self.stream.read_exact(&mut buf).await?;
        Ok(buf[0])
    }

    /// Write `cmd` followed by `param`, then read frames until
    /// `FLAG_NO_NEXT`, calling `visit` for every intermediate pack.
    /// Returns the last pack seen, if any.
    async fn send_command(
        &mut self,
        cmd: &str,
        param: &Pack,
        mut visit: impl FnMut(&Pack),
    ) -> Result<Option<Pack>> {
        write_text_async(&mut self.stream, cmd).await?;
        self.write_pack(param).await?;
        self.last_write_ms = now_millis();

        let mut last = None;
        loop {
            let flag = self.read_flag().await?;
            if flag == FLAG_NO_NEXT {
                return Ok(last);
            }
            if flag != FLAG_HAS_NEXT {
                return Err(ServerError::WireFormat(format!("unexpected frame flag {flag:#x}")));
            }
            match self.read_pack().await? {
                Some(pack) => {
                    visit(&pack);
                    last = Some(pack);
                }
                None => continue,
            }
        }
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

struct AgentQueue {
    idle: Mutex<VecDeque<AgentChannel>>,
    notify: Notify,
}

impl Default for AgentQueue {
    fn default() -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

pub struct AgentPoolConfig {
    pub max_idle_per_agent: usize,
    pub max_distinct_agents: usize,
    pub get_conn_wait: Duration,
}

impl Default for AgentPoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_agent: 50,
            max_distinct_agents: 5000,
            get_conn_wait: Duration::from_secs(5),
        }
    }
}

/// Per-`obj_hash` idle channel queues (spec §4.8). `get`/`put` implement the
/// lease protocol; `call`/`call_stream` are the reverse-RPC entry points
/// used by TCP client command handlers.
pub struct AgentPool {
    queues: DashMap<i32, Arc<AgentQueue>>,
    config: AgentPoolConfig,
}

impl AgentPool {
    pub fn new(config: AgentPoolConfig) -> Self {
        Self {
            queues: DashMap::new(),
            config,
        }
    }

    /// Register a freshly accepted agent channel. Rejects (drops) the
    /// channel if the pool already tracks `max_distinct_agents` hashes and
    /// this is a new one.
    pub fn register(&self, channel: AgentChannel) {
        let obj_hash = channel.obj_hash;
        if !self.queues.contains_key(&obj_hash) && self.queues.len() >= self.config.max_distinct_agents {
            log::warn!("agent pool at capacity, rejecting obj_hash={obj_hash}");
            return;
        }
        self.put(channel);
    }

    /// Return a channel to its idle queue, or close it if the per-agent
    /// queue is already at capacity.
    pub fn put(&self, channel: AgentChannel) {
        let obj_hash = channel.obj_hash;
        let queue = self.queues.entry(obj_hash).or_insert_with(|| Arc::new(AgentQueue::default())).clone();
        let max = self.config.max_idle_per_agent;
        tokio::spawn(async move {
            let mut idle = queue.idle.lock().await;
            if idle.len() >= max {
                log::debug!("agent idle queue full for obj_hash={obj_hash}, closing channel");
                return;
            }
            idle.push_back(channel);
            drop(idle);
            queue.notify.notify_one();
        });
    }

    /// Lease an idle channel for `obj_hash`, waiting up to
    /// `get_conn_wait` if none is immediately available.
    pub async fn get(&self, obj_hash: i32) -> Option<AgentChannel> {
        let queue = self.queues.get(&obj_hash)?.clone();
        if let Some(channel) = queue.idle.lock().await.pop_front() {
            return Some(channel);
        }
        let wait = tokio::time::timeout(self.config.get_conn_wait, queue.notify.notified());
        if wait.await.is_err() {
            return None;
        }
        let front = queue.idle.lock().await.pop_front();
        front
    }

    /// `call(obj_hash, cmd, param)`: lease, write, read frames, return the
    /// last pack. The channel is returned to the pool on success and
    /// dropped (closed) on any I/O error, per spec §4.8.
    pub async fn call(&self, obj_hash: i32, cmd: &str, param: &Pack) -> Result<Option<Pack>> {
        let mut channel = self
            .get(obj_hash)
            .await
            .ok_or(ServerError::AgentUnavailable { obj_hash })?;
        match channel.send_command(cmd, param, |_| {}).await {
            Ok(result) => {
                self.put(channel);
                Ok(result)
            }
            Err(e) => {
                log::warn!("agent call to obj_hash={obj_hash} failed, closing channel: {e}");
                Err(e)
            }
        }
    }

    pub async fn call_stream(
        &self,
        obj_hash: i32,
        cmd: &str,
        param: &Pack,
        visit: impl FnMut(&Pack),
    ) -> Result<()> {
        let mut channel = self
            .get(obj_hash)
            .await
            .ok_or(ServerError::AgentUnavailable { obj_hash })?;
        match channel.send_command(cmd, param, visit).await {
            Ok(_) => {
                self.put(channel);
                Ok(())
            }
            Err(e) => {
                log::warn!("agent call_stream to obj_hash={obj_hash} failed, closing channel: {e}");
                Err(e)
            }
        }
    }

    /// Every `keepalive_interval`'s worth of staleness: snapshot idle
    /// channels, ping any that have been quiet too long, re-pool survivors,
    /// drop failures. Empty queues are dropped entirely.
    pub async fn run_keepalive(self: Arc<Self>, tick: Duration, keepalive_interval: Duration, read_deadline: Duration) {
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            self.keepalive_pass(keepalive_interval, read_deadline).await;
        }
    }

    async fn keepalive_pass(&self, keepalive_interval: Duration, read_deadline: Duration) {
        let hashes: Vec<i32> = self.queues.iter().map(|e| *e.key()).collect();
        for obj_hash in hashes {
            let Some(queue) = self.queues.get(&obj_hash).map(|q| q.clone()) else { continue };
            let mut idle = queue.idle.lock().await;
            let snapshot: Vec<AgentChannel> = idle.drain(..).collect();
            drop(idle);

            let mut survivors = VecDeque::new();
            for mut channel in snapshot {
                let now = now_millis();
                let age_ms = now - channel.last_write_ms;
                if (age_ms as u64) < keepalive_interval.as_millis() as u64 {
                    survivors.push_back(channel);
                    continue;
                }
                let ping = tokio::time::timeout(
                    read_deadline,
                    channel.send_command("KEEP_ALIVE", &Pack::Map(crate::wire::pack::MapPack { fields: vec![] }), |_| {}),
                )
                .await;
                match ping {
                    Ok(Ok(_)) => survivors.push_back(channel),
                    _ => log::debug!("keepalive failed for obj_hash={obj_hash}, closing channel"),
                }
            }

            if survivors.is_empty() {
                self.queues.remove(&obj_hash);
            } else {
                *queue.idle.lock().await = survivors;
            }
        }
    }

    /// Snapshot of how many idle channels each tracked `obj_hash` currently
    /// holds. Queues locked by a concurrent `put`/`get`/keepalive pass at
    /// the moment of the snapshot report 0 rather than blocking.
    pub fn idle_counts(&self) -> HashMap<i32, usize> {
        self.queues
            .iter()
            .map(|e| {
                let len = e.value().idle.try_lock().map(|idle| idle.len()).unwrap_or(0);
                (*e.key(), len)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::pack::MapPack;
    use crate::wire::Value;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn register_then_get_leases_the_same_channel() {
        let pool = AgentPool::new(AgentPoolConfig::default());
        let (a, _b) = duplex(1024);
        let channel = AgentChannel::new(50, Box::new(a), true);
        pool.register(channel);
        // registration hands off to a spawned task; yield so it lands.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let leased = pool.get(50).await;
        assert!(leased.is_some());
        assert_eq!(leased.unwrap().obj_hash, 50);
    }

    #[tokio::test]
    async fn get_on_unknown_agent_returns_none_without_blocking() {
        let pool = AgentPool::new(AgentPoolConfig::default());
        assert!(pool.get(999).await.is_none());
    }

    #[tokio::test]
    async fn idle_counts_reports_the_real_queue_length() {
        let pool = AgentPool::new(AgentPoolConfig::default());
        let (a, _b) = duplex(1024);
        pool.register(AgentChannel::new(50, Box::new(a), true));
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.idle_counts().get(&50).copied(), Some(1));

        let leased = pool.get(50).await.unwrap();
        assert_eq!(pool.idle_counts().get(&50).copied(), Some(0));

        pool.put(leased);
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.idle_counts().get(&50).copied(), Some(1));
    }

    #[tokio::test]
    async fn call_round_trips_with_a_fake_agent() {
        let pool = AgentPool::new(AgentPoolConfig::default());
        let (server_side, mut agent_side) = duplex(4096);
        pool.register(AgentChannel::new(50, Box::new(server_side), true));
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let fake_agent = tokio::spawn(async move {
            let _cmd = crate::wire::r#async::read_text_async(&mut agent_side).await.unwrap();
            let _param = crate::wire::r#async::read_pack_v2_async(&mut agent_side).await.unwrap();
            agent_side.write_all(&[FLAG_HAS_NEXT]).await.unwrap();
            let response = Pack::Map(MapPack {
                fields: vec![("cmd_received".into(), Value::Text("THREAD_DUMP".into()))],
            });
            crate::wire::r#async::write_pack_v2_async(&mut agent_side, &response).await.unwrap();
            agent_side.write_all(&[FLAG_NO_NEXT]).await.unwrap();
        });

        let param = Pack::Map(MapPack { fields: vec![] });
        let result = pool.call(50, "THREAD_DUMP", &param).await.unwrap();
        fake_agent.await.unwrap();

        match result {
            Some(Pack::Map(m)) => assert_eq!(m.get("cmd_received"), Some(&Value::Text("THREAD_DUMP".into()))),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
