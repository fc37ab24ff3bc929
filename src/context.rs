//! `ServerContext` (spec §5 "shared resources"): the process-wide state
//! every background loop and command handler reaches through — the day
//! container registry, the C5 ring caches, the C8 agent pool, the kv store,
//! and a config snapshot. Constructed once in `main.rs` and handed out as
//! an `Arc`.

use std::sync::{Arc, Mutex};

use crate::cache::{AlertCache, CounterCache, ObjectCache, TextCache, XLogCache};
use crate::config::Config;
use crate::kv::KvStores;
use crate::metrics::Metrics;
use crate::net::agent_pool::{AgentPool, AgentPoolConfig};
use crate::net::session::{PermissiveSessionAuthority, SessionAuthority};
use crate::storage::ContainerRegistry;

pub struct ServerContext {
    pub config: Arc<Config>,
    pub registry: Arc<ContainerRegistry>,
    pub xlog_cache: Mutex<XLogCache>,
    pub counter_cache: Mutex<CounterCache>,
    pub object_cache: Mutex<ObjectCache>,
    pub text_cache: Mutex<TextCache>,
    pub alert_cache: Mutex<AlertCache>,
    pub agent_pool: Arc<AgentPool>,
    pub sessions: Arc<dyn SessionAuthority>,
    pub kv: KvStores,
    pub metrics: Arc<Metrics>,
}

impl ServerContext {
    pub fn new(config: Config) -> crate::error::Result<Self> {
        let config = Arc::new(config);
        let registry = Arc::new(ContainerRegistry::new(
            config.storage.data_dir.clone(),
            config.storage.text_hash_size_mb,
        ));
        let kv = KvStores::open(&config.storage.data_dir)?;
        let agent_pool = Arc::new(AgentPool::new(AgentPoolConfig {
            max_idle_per_agent: 50,
            max_distinct_agents: 5000,
            get_conn_wait: std::time::Duration::from_millis(config.net.net_tcp_get_agent_connection_wait_ms),
        }));
        Ok(Self {
            registry,
            xlog_cache: Mutex::new(XLogCache::new(config.cache.xlog_cache_size)),
            counter_cache: Mutex::new(CounterCache::new()),
            object_cache: Mutex::new(ObjectCache::new()),
            text_cache: Mutex::new(TextCache::new(config.cache.text_cache_max_chars)),
            alert_cache: Mutex::new(AlertCache::new(config.cache.alert_cache_size)),
            agent_pool,
            sessions: Arc::new(PermissiveSessionAuthority),
            kv,
            metrics: Arc::new(Metrics::new()),
            config,
        })
    }

    pub fn flush_all(&self) {
        self.registry.flush_all();
        self.kv.flush_all();
    }
}
