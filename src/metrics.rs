use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

/// Process-wide counters for the ingestion and storage core.
///
/// Updated from hot paths (UDP workers, TCP handlers, writers) so every
/// field is atomic; there is no lock on the struct itself.
pub struct Metrics {
    pub start_time: SystemTime,

    udp_datagrams_received: AtomicU64,
    udp_datagrams_dropped: AtomicU64,
    udp_packs_decoded: AtomicU64,
    udp_decode_errors: AtomicU64,
    mtu_fragments_received: AtomicU64,
    mtu_reassembled: AtomicU64,
    mtu_expired: AtomicU64,

    tcp_clients_active: AtomicUsize,
    tcp_agents_active: AtomicUsize,
    tcp_sessions_rejected: AtomicU64,

    writer_queue_drops: AtomicU64,
    storage_io_errors: AtomicU64,

    xlog_cache_size: AtomicUsize,
    object_cache_size: AtomicUsize,
    object_cache_dead_marked: AtomicU64,

    agent_calls_total: AtomicU64,
    agent_calls_failed: AtomicU64,
    agent_keepalive_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            udp_datagrams_received: AtomicU64::new(0),
            udp_datagrams_dropped: AtomicU64::new(0),
            udp_packs_decoded: AtomicU64::new(0),
            udp_decode_errors: AtomicU64::new(0),
            mtu_fragments_received: AtomicU64::new(0),
            mtu_reassembled: AtomicU64::new(0),
            mtu_expired: AtomicU64::new(0),
            tcp_clients_active: AtomicUsize::new(0),
            tcp_agents_active: AtomicUsize::new(0),
            tcp_sessions_rejected: AtomicU64::new(0),
            writer_queue_drops: AtomicU64::new(0),
            storage_io_errors: AtomicU64::new(0),
            xlog_cache_size: AtomicUsize::new(0),
            object_cache_size: AtomicUsize::new(0),
            object_cache_dead_marked: AtomicU64::new(0),
            agent_calls_total: AtomicU64::new(0),
            agent_calls_failed: AtomicU64::new(0),
            agent_keepalive_failures: AtomicU64::new(0),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    pub fn inc_udp_received(&self) {
        self.udp_datagrams_received.fetch_add(1, Ordering::Relaxed);
    }
    pub fn udp_received(&self) -> u64 {
        self.udp_datagrams_received.load(Ordering::Relaxed)
    }

    pub fn inc_udp_dropped(&self) {
        self.udp_datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }
    pub fn udp_dropped(&self) -> u64 {
        self.udp_datagrams_dropped.load(Ordering::Relaxed)
    }

    pub fn inc_udp_decoded(&self) {
        self.udp_packs_decoded.fetch_add(1, Ordering::Relaxed);
    }
    pub fn udp_decoded(&self) -> u64 {
        self.udp_packs_decoded.load(Ordering::Relaxed)
    }

    pub fn inc_udp_decode_error(&self) {
        self.udp_decode_errors.fetch_add(1, Ordering::Relaxed);
    }
    pub fn udp_decode_errors(&self) -> u64 {
        self.udp_decode_errors.load(Ordering::Relaxed)
    }

    pub fn inc_mtu_fragment(&self) {
        self.mtu_fragments_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_mtu_reassembled(&self) {
        self.mtu_reassembled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_mtu_expired(&self, count: u64) {
        self.mtu_expired.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_tcp_client(&self) {
        self.tcp_clients_active.fetch_add(1, Ordering::Relaxed);
    }
    pub fn dec_tcp_client(&self) {
        self.tcp_clients_active.fetch_sub(1, Ordering::Relaxed);
    }
    pub fn tcp_clients_active(&self) -> usize {
        self.tcp_clients_active.load(Ordering::Relaxed)
    }

    pub fn inc_tcp_agent(&self) {
        self.tcp_agents_active.fetch_add(1, Ordering::Relaxed);
    }
    pub fn tcp_agents_active(&self) -> usize {
        self.tcp_agents_active.load(Ordering::Relaxed)
    }

    pub fn inc_session_rejected(&self) {
        self.tcp_sessions_rejected.fetch_add(1, Ordering::Relaxed);
    }
    pub fn sessions_rejected(&self) -> u64 {
        self.tcp_sessions_rejected.load(Ordering::Relaxed)
    }

    pub fn inc_writer_queue_drop(&self) {
        self.writer_queue_drops.fetch_add(1, Ordering::Relaxed);
    }
    pub fn writer_queue_drops(&self) -> u64 {
        self.writer_queue_drops.load(Ordering::Relaxed)
    }

    pub fn inc_storage_io_error(&self) {
        self.storage_io_errors.fetch_add(1, Ordering::Relaxed);
    }
    pub fn storage_io_errors(&self) -> u64 {
        self.storage_io_errors.load(Ordering::Relaxed)
    }

    pub fn set_xlog_cache_size(&self, size: usize) {
        self.xlog_cache_size.store(size, Ordering::Relaxed);
    }
    pub fn xlog_cache_size(&self) -> usize {
        self.xlog_cache_size.load(Ordering::Relaxed)
    }

    pub fn set_object_cache_size(&self, size: usize) {
        self.object_cache_size.store(size, Ordering::Relaxed);
    }
    pub fn object_cache_size(&self) -> usize {
        self.object_cache_size.load(Ordering::Relaxed)
    }

    pub fn add_object_cache_dead_marked(&self, count: u64) {
        self.object_cache_dead_marked.fetch_add(count, Ordering::Relaxed);
    }
    pub fn object_cache_dead_marked(&self) -> u64 {
        self.object_cache_dead_marked.load(Ordering::Relaxed)
    }

    pub fn inc_agent_call(&self) {
        self.agent_calls_total.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_agent_call_failed(&self) {
        self.agent_calls_failed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn agent_calls_total(&self) -> u64 {
        self.agent_calls_total.load(Ordering::Relaxed)
    }
    pub fn agent_calls_failed(&self) -> u64 {
        self.agent_calls_failed.load(Ordering::Relaxed)
    }

    pub fn inc_keepalive_failure(&self) {
        self.agent_keepalive_failures.fetch_add(1, Ordering::Relaxed);
    }
    pub fn keepalive_failures(&self) -> u64 {
        self.agent_keepalive_failures.load(Ordering::Relaxed)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
