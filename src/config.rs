//! Server configuration (spec §6): ports, buffer sizes, timeouts, queue
//! sizes, and retention settings. Config hot reload and the real on-disk
//! `conf/account.xml` schema are external collaborators out of scope; this
//! only covers the keys this crate's own subsystems read.

use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/scouter/scouter.toml";
const ENV_CONFIG_PATH: &str = "SCOUTER_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub net: NetConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl Config {
    /// Load from a TOML file at `SCOUTER_CONFIG` (falling back to
    /// `/etc/scouter/scouter.toml`). Missing or malformed files fall back
    /// to defaults rather than failing startup — the real account/config
    /// manager's hot-reload path is out of scope here.
    pub fn load() -> Self {
        let path = std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetConfig {
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_udp_buffer_size")]
    pub net_udp_packet_buffer_size: usize,
    #[serde(default = "default_udp_workers")]
    pub net_udp_worker_count: usize,
    #[serde(default = "default_tcp_client_timeout_ms")]
    pub net_tcp_client_so_timeout_ms: u64,
    #[serde(default = "default_tcp_agent_timeout_ms")]
    pub net_tcp_agent_so_timeout_ms: u64,
    #[serde(default = "default_tcp_agent_keepalive_ms")]
    pub net_tcp_agent_keepalive_interval_ms: u64,
    #[serde(default = "default_agent_conn_wait_ms")]
    pub net_tcp_get_agent_connection_wait_ms: u64,
    #[serde(default = "default_tcp_service_pool_size")]
    pub net_tcp_service_pool_size: usize,
    #[serde(default = "default_mtu_ttl_ms")]
    pub net_udp_mtu_reassembly_ttl_ms: i64,
    #[serde(default = "default_mtu_table_max_entries")]
    pub net_udp_mtu_table_max_entries: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            udp_port: default_udp_port(),
            tcp_port: default_tcp_port(),
            net_udp_packet_buffer_size: default_udp_buffer_size(),
            net_udp_worker_count: default_udp_workers(),
            net_tcp_client_so_timeout_ms: default_tcp_client_timeout_ms(),
            net_tcp_agent_so_timeout_ms: default_tcp_agent_timeout_ms(),
            net_tcp_agent_keepalive_interval_ms: default_tcp_agent_keepalive_ms(),
            net_tcp_get_agent_connection_wait_ms: default_agent_conn_wait_ms(),
            net_tcp_service_pool_size: default_tcp_service_pool_size(),
            net_udp_mtu_reassembly_ttl_ms: default_mtu_ttl_ms(),
            net_udp_mtu_table_max_entries: default_mtu_table_max_entries(),
        }
    }
}

fn default_udp_port() -> u16 {
    10500
}
fn default_tcp_port() -> u16 {
    10501
}
fn default_udp_buffer_size() -> usize {
    65_536
}
fn default_udp_workers() -> usize {
    4
}
fn default_tcp_client_timeout_ms() -> u64 {
    60_000
}
fn default_tcp_agent_timeout_ms() -> u64 {
    60_000
}
fn default_tcp_agent_keepalive_ms() -> u64 {
    60_000
}
fn default_agent_conn_wait_ms() -> u64 {
    5_000
}
fn default_tcp_service_pool_size() -> usize {
    256
}
fn default_mtu_ttl_ms() -> i64 {
    30_000
}
fn default_mtu_table_max_entries() -> usize {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_text_hash_size_mb")]
    pub text_hash_size_mb: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            text_hash_size_mb: default_text_hash_size_mb(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/scouter")
}
fn default_text_hash_size_mb() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_xlog_cache_size")]
    pub xlog_cache_size: usize,
    #[serde(default = "default_alert_cache_size")]
    pub alert_cache_size: usize,
    #[serde(default = "default_text_cache_max_chars")]
    pub text_cache_max_chars: usize,
    #[serde(default = "default_object_dead_time_ms")]
    pub object_dead_time_ms: i64,
    #[serde(default = "default_xlog_queue_size")]
    pub xlog_queue_size: usize,
    #[serde(default = "default_profile_queue_size")]
    pub profile_queue_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            xlog_cache_size: default_xlog_cache_size(),
            alert_cache_size: default_alert_cache_size(),
            text_cache_max_chars: default_text_cache_max_chars(),
            object_dead_time_ms: default_object_dead_time_ms(),
            xlog_queue_size: default_xlog_queue_size(),
            profile_queue_size: default_profile_queue_size(),
        }
    }
}

fn default_xlog_cache_size() -> usize {
    20_000
}
fn default_alert_cache_size() -> usize {
    1_000
}
fn default_text_cache_max_chars() -> usize {
    10_000_000
}
fn default_object_dead_time_ms() -> i64 {
    30_000
}
fn default_xlog_queue_size() -> usize {
    10_000
}
fn default_profile_queue_size() -> usize {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    #[serde(default = "default_keep_hours")]
    pub day_container_keep_hours: u64,
    #[serde(default = "default_profile_keep_days")]
    pub mgr_purge_profile_keep_days: u64,
    #[serde(default = "default_xlog_keep_days")]
    pub mgr_purge_xlog_keep_days: u64,
    #[serde(default = "default_sum_data_days")]
    pub mgr_purge_sum_data_days: u64,
    #[serde(default = "default_counter_keep_days")]
    pub mgr_purge_counter_keep_days: u64,
    #[serde(default = "default_realtime_counter_keep_days")]
    pub mgr_purge_realtime_counter_keep_days: u64,
    #[serde(default = "default_daily_text_days")]
    pub mgr_purge_daily_text_days: u64,
    #[serde(default = "default_disk_usage_pct")]
    pub mgr_purge_disk_usage_pct: u8,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            day_container_keep_hours: default_keep_hours(),
            mgr_purge_profile_keep_days: default_profile_keep_days(),
            mgr_purge_xlog_keep_days: default_xlog_keep_days(),
            mgr_purge_sum_data_days: default_sum_data_days(),
            mgr_purge_counter_keep_days: default_counter_keep_days(),
            mgr_purge_realtime_counter_keep_days: default_realtime_counter_keep_days(),
            mgr_purge_daily_text_days: default_daily_text_days(),
            mgr_purge_disk_usage_pct: default_disk_usage_pct(),
        }
    }
}

fn default_keep_hours() -> u64 {
    48
}
fn default_profile_keep_days() -> u64 {
    3
}
fn default_xlog_keep_days() -> u64 {
    7
}
fn default_sum_data_days() -> u64 {
    30
}
fn default_counter_keep_days() -> u64 {
    90
}
fn default_realtime_counter_keep_days() -> u64 {
    3
}
fn default_daily_text_days() -> u64 {
    30
}
fn default_disk_usage_pct() -> u8 {
    85
}
