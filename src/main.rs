//! Process entrypoint: CLI parsing, config load, `ServerContext`
//! construction, and wiring every background loop described in spec §5 —
//! the UDP ingestion pipeline, the TCP session gate, the day-container purge
//! schedulers, and the agent pool keepalive daemon — before blocking on a
//! shutdown signal.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use scouter_server::config::Config;
use scouter_server::context::ServerContext;
use scouter_server::dispatch::{Dispatcher, NoopXLogSink};
use scouter_server::net::agent_pool::AgentPool;
use scouter_server::net::tcp;
use scouter_server::net::udp::{self, UdpPipelineConfig};
use scouter_server::storage::hash_text;
use scouter_server::storage::purge::{self, RetentionKind, RetentionRule};

#[derive(Parser, Debug)]
#[command(name = "scouter-server")]
#[command(about = "APM ingestion and storage server: UDP/TCP telemetry intake")]
struct Args {
    /// Path to a TOML config file. Overrides SCOUTER_CONFIG.
    #[arg(long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the ingestion/storage server (the default when no subcommand is given).
    Server,
    /// Print the server version and exit.
    Version,
    /// Offline rebuild of every text/profile hash store at a new bucket size.
    Rehash {
        /// New hash table size in MiB. Defaults to the configured text_hash_size_mb.
        #[arg(long)]
        size_mb: Option<u64>,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if let Some(path) = &args.config {
        // SAFETY: single-threaded at this point, before any config read happens.
        unsafe {
            std::env::set_var("SCOUTER_CONFIG", path);
        }
    }

    match args.command.unwrap_or(Command::Server) {
        Command::Version => {
            println!("scouter-server {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Rehash { size_mb } => run_rehash(size_mb),
        Command::Server => run_server(),
    }
}

/// Walks every `<data_dir>/<date>/{text/*,xlog/xlog_prof}` hash store and
/// rebuilds its `.hfile`/`.kfile` pair at `size_mb` (or the configured
/// default), logging per-div stats as it goes.
fn run_rehash(size_mb: Option<u64>) -> anyhow::Result<()> {
    let config = Config::load();
    let new_size_mb = size_mb.unwrap_or(config.storage.text_hash_size_mb);
    let data_dir = &config.storage.data_dir;

    let mut found = 0usize;
    for date_entry in std::fs::read_dir(data_dir)? {
        let date_entry = date_entry?;
        if !date_entry.file_type()?.is_dir() {
            continue;
        }
        let date_dir = date_entry.path();

        for sub in ["text", "xlog"] {
            let sub_dir = date_dir.join(sub);
            let Ok(read) = std::fs::read_dir(&sub_dir) else {
                continue;
            };
            for entry in read {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let Some(div) = name.strip_suffix(".hfile") else {
                    continue;
                };
                if sub == "xlog" && div != "xlog_prof" {
                    continue;
                }
                found += 1;
                match hash_text::rehash_div(&sub_dir, div, new_size_mb) {
                    Ok(stats) => log::info!(
                        "rehashed {}/{}: {} records, avg chain {:.2} -> {:.2} ({} ms)",
                        date_dir.display(),
                        div,
                        stats.records,
                        stats.old_chain_avg,
                        stats.new_chain_avg,
                        stats.elapsed_ms
                    ),
                    Err(e) => log::error!("rehash failed for {}/{div}: {e}", date_dir.display()),
                }
            }
        }
    }
    log::info!("rehash complete: {found} div(s) processed");
    Ok(())
}

fn run_server() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve())
}

async fn serve() -> anyhow::Result<()> {
    let config = Config::load();
    let ctx = Arc::new(ServerContext::new(config).context("failed to construct server context")?);

    let dispatcher = Dispatcher::spawn(ctx.clone(), Arc::new(NoopXLogSink));

    let udp_bind: SocketAddr = format!("0.0.0.0:{}", ctx.config.net.udp_port).parse()?;
    udp::spawn(
        UdpPipelineConfig {
            bind_addr: udp_bind,
            buf_size: ctx.config.net.net_udp_packet_buffer_size,
            workers: ctx.config.net.net_udp_worker_count,
            mtu_table_max_entries: ctx.config.net.net_udp_mtu_table_max_entries,
            mtu_ttl_ms: ctx.config.net.net_udp_mtu_reassembly_ttl_ms,
        },
        dispatcher.clone(),
    )
    .await?;
    log::info!("udp pipeline listening on {udp_bind}");

    let tcp_bind: SocketAddr = format!("0.0.0.0:{}", ctx.config.net.tcp_port).parse()?;
    let tcp_ctx = ctx.clone();
    let pool_size = ctx.config.net.net_tcp_service_pool_size;
    tokio::spawn(async move {
        if let Err(e) = tcp::run(tcp_ctx, tcp_bind, pool_size).await {
            log::error!("tcp server exited: {e}");
        }
    });
    log::info!("tcp server listening on {tcp_bind}");

    spawn_purge_loops(ctx.clone());
    spawn_agent_keepalive(ctx.agent_pool.clone(), &ctx);
    spawn_object_sweeper(ctx.clone());

    wait_for_shutdown().await;
    log::info!("shutdown signal received, flushing");
    ctx.flush_all();
    Ok(())
}

fn spawn_purge_loops(ctx: Arc<ServerContext>) {
    let keep_hours = ctx.config.retention.day_container_keep_hours;
    tokio::spawn(purge::run_hours_based(ctx.registry.clone(), keep_hours));

    let rules = vec![
        RetentionRule {
            kind: RetentionKind::Profile,
            keep_days: ctx.config.retention.mgr_purge_profile_keep_days,
        },
        RetentionRule {
            kind: RetentionKind::XLog,
            keep_days: ctx.config.retention.mgr_purge_xlog_keep_days,
        },
        RetentionRule {
            kind: RetentionKind::Summary,
            keep_days: ctx.config.retention.mgr_purge_sum_data_days,
        },
        RetentionRule {
            kind: RetentionKind::RealtimeCounter,
            keep_days: ctx.config.retention.mgr_purge_realtime_counter_keep_days,
        },
        RetentionRule {
            kind: RetentionKind::DailyText,
            keep_days: ctx.config.retention.mgr_purge_daily_text_days,
        },
        RetentionRule {
            kind: RetentionKind::Counter,
            keep_days: ctx.config.retention.mgr_purge_counter_keep_days,
        },
    ];
    let data_dir = ctx.config.storage.data_dir.clone();
    tokio::spawn(purge::run_days_based(data_dir, rules));

    let disk_data_dir = ctx.config.storage.data_dir.clone();
    let threshold = ctx.config.retention.mgr_purge_disk_usage_pct;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            ticker.tick().await;
            if let Err(e) = purge::sweep_disk_usage(&disk_data_dir, threshold, disk_usage_pct) {
                log::warn!("disk usage sweep failed: {e}");
            }
        }
    });
}

/// Reads the data directory's filesystem usage percentage. `fs2`/`nix` are
/// not in the dependency stack, so this shells out to `df` the way an ops
/// script would rather than binding statvfs directly.
fn disk_usage_pct(path: &std::path::Path) -> std::io::Result<u8> {
    let output = std::process::Command::new("df").arg("-P").arg(path).output()?;
    let text = String::from_utf8_lossy(&output.stdout);
    let pct = text
        .lines()
        .nth(1)
        .and_then(|line| line.split_whitespace().nth(4))
        .and_then(|field| field.trim_end_matches('%').parse::<u8>().ok())
        .unwrap_or(0);
    Ok(pct)
}

fn spawn_agent_keepalive(pool: Arc<AgentPool>, ctx: &ServerContext) {
    let tick = std::time::Duration::from_millis(ctx.config.net.net_tcp_agent_keepalive_interval_ms);
    let read_deadline = std::time::Duration::from_millis(ctx.config.net.net_tcp_agent_so_timeout_ms);
    tokio::spawn(pool.run_keepalive(tick, tick, read_deadline));
}

fn spawn_object_sweeper(ctx: Arc<ServerContext>) {
    let dead_timeout = std::time::Duration::from_millis(ctx.config.cache.object_dead_time_ms.max(0) as u64);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(10));
        loop {
            ticker.tick().await;
            let now_ms = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            let dead = {
                let mut cache = ctx.object_cache.lock().unwrap();
                cache.sweep_dead(now_ms, dead_timeout)
            };
            if dead > 0 {
                ctx.metrics.add_object_cache_dead_marked(dead as u64);
                log::debug!("object sweeper marked {dead} object(s) dead");
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
