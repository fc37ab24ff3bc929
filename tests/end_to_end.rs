//! End-to-end scenarios (spec §8) driving the real UDP pipeline, TCP
//! request loop, dispatcher, and agent pool together rather than testing
//! each module in isolation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use scouter_server::config::Config;
use scouter_server::context::ServerContext;
use scouter_server::dispatch::{Dispatcher, NoopXLogSink};
use scouter_server::net::agent_pool::AgentChannel;
use scouter_server::net::tcp::{client_loop, HandlerRegistry};
use scouter_server::net::udp::{self, UdpPipelineConfig};
use scouter_server::storage::purge::{self, RetentionKind, RetentionRule};
use scouter_server::wire::magic::{FLAG_HAS_NEXT, FLAG_NO_NEXT, UDP_CAFE};
use scouter_server::wire::r#async::{read_pack_v1_async, read_text_async, write_pack_v1_async, write_text_async};
use scouter_server::wire::{ObjectPack, Pack, TextPack, Value, XLogPack};

fn test_ctx() -> (Arc<ServerContext>, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.storage.data_dir = dir.path().to_path_buf();
    (Arc::new(ServerContext::new(config).unwrap()), dir)
}

async fn spawn_tcp_session(ctx: Arc<ServerContext>) -> (TcpStream, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let registry = Arc::new(HandlerRegistry::default());
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        client_loop(ctx, registry, stream).await;
    });
    let client = TcpStream::connect(addr).await.unwrap();
    (client, addr)
}

async fn send_request(client: &mut TcpStream, cmd: &str, session: i64, request: &Pack) {
    write_text_async(client, cmd).await.unwrap();
    client.write_all(&session.to_be_bytes()).await.unwrap();
    write_pack_v1_async(client, request).await.unwrap();
}

/// Reads frames (`FLAG_HAS_NEXT`-prefixed packs) until the client loop's
/// closing `FLAG_NO_NEXT`.
async fn read_frames(client: &mut TcpStream) -> Vec<Pack> {
    let mut packs = Vec::new();
    loop {
        let mut flag = [0u8; 1];
        client.read_exact(&mut flag).await.unwrap();
        match flag[0] {
            FLAG_HAS_NEXT => packs.push(read_pack_v1_async(client).await.unwrap()),
            FLAG_NO_NEXT => return packs,
            other => panic!("unexpected frame flag {other:#x}"),
        }
    }
}

/// Scenario 1: batch text lookup resolves only the hashes that exist.
#[tokio::test]
async fn scenario_batch_text_lookup_returns_only_resolved_hashes() {
    let (ctx, _dir) = test_ctx();
    let dispatcher = Dispatcher::spawn(ctx.clone(), Arc::new(NoopXLogSink));

    let udp_addr = udp::spawn(
        UdpPipelineConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..UdpPipelineConfig::default()
        },
        dispatcher,
    )
    .await
    .unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for hash in 1..=10 {
        let mut frame = Vec::new();
        Pack::Text(TextPack {
            xtype: "service".into(),
            hash,
            text: format!("svc-{hash}"),
        })
        .encode(&mut frame)
        .unwrap();
        let mut datagram = Vec::new();
        datagram.extend_from_slice(&UDP_CAFE.to_be_bytes());
        datagram.extend_from_slice(&frame);
        socket.send_to(&datagram, udp_addr).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (mut client, _addr) = spawn_tcp_session(ctx.clone()).await;
    let request = Pack::Map(scouter_server::wire::pack::MapPack {
        fields: vec![
            ("xtype".into(), Value::Text("service".into())),
            (
                "hashes".into(),
                Value::List(vec![Value::Decimal(1), Value::Decimal(5), Value::Decimal(999)]),
            ),
        ],
    });
    send_request(&mut client, "GET_TEXT_100", 1, &request).await;
    let frames = read_frames(&mut client).await;
    assert_eq!(frames.len(), 1);
    match &frames[0] {
        Pack::Map(m) => {
            assert_eq!(m.fields.len(), 2);
            assert_eq!(m.get("1"), Some(&Value::Text("svc-1".into())));
            assert_eq!(m.get("5"), Some(&Value::Text("svc-5".into())));
        }
        other => panic!("unexpected: {other:?}"),
    }
}

/// Scenario 2: an xlog sent over UDP is visible through
/// `TRANX_REAL_TIME_GROUP`, and re-querying with the returned cursor yields
/// nothing new.
#[tokio::test]
async fn scenario_xlog_udp_then_tranx_realtime_cursor_advances() {
    let (ctx, _dir) = test_ctx();
    let dispatcher = Dispatcher::spawn(ctx.clone(), Arc::new(NoopXLogSink));

    let udp_addr = udp::spawn(
        UdpPipelineConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..UdpPipelineConfig::default()
        },
        dispatcher,
    )
    .await
    .unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut datagram = Vec::new();
    datagram.extend_from_slice(&UDP_CAFE.to_be_bytes());
    Pack::XLog(XLogPack {
        end_time: 1_700_000_000_000,
        obj_hash: 1,
        service: 1,
        txid: 111,
        elapsed: 100,
        cpu: 1,
        sql_count: 0,
        sql_time: 0,
        kbytes: 0,
        status: 0,
        error: 0,
        ip: vec![127, 0, 0, 1],
        user_agent: 0,
    })
    .encode(&mut datagram)
    .unwrap();
    socket.send_to(&datagram, udp_addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (mut client, _addr) = spawn_tcp_session(ctx.clone()).await;
    let request = Pack::Map(scouter_server::wire::pack::MapPack {
        fields: vec![("loop".into(), Value::Decimal(0)), ("index".into(), Value::Decimal(0))],
    });
    send_request(&mut client, "TRANX_REAL_TIME_GROUP", 1, &request).await;
    let frames = read_frames(&mut client).await;
    assert_eq!(frames.len(), 2, "one xlog entry plus the trailing cursor frame");
    match &frames[0] {
        Pack::XLog(p) => assert_eq!(p.obj_hash, 1),
        other => panic!("unexpected: {other:?}"),
    }
    let cursor_fields = match &frames[1] {
        Pack::Map(m) => m.clone(),
        other => panic!("unexpected: {other:?}"),
    };

    let (mut client2, _addr2) = spawn_tcp_session(ctx.clone()).await;
    let resume = Pack::Map(cursor_fields);
    send_request(&mut client2, "TRANX_REAL_TIME_GROUP", 1, &resume).await;
    let frames2 = read_frames(&mut client2).await;
    assert_eq!(frames2.len(), 1, "only the trailing cursor frame, no new entries");
}

/// Scenario 3: an object not refreshed within `dead_timeout` is observed
/// `alive=false` after the sweeper runs, driven through the real dispatcher.
#[tokio::test]
async fn scenario_object_dead_after_timeout() {
    let (ctx, _dir) = test_ctx();
    let dispatcher = Dispatcher::spawn(ctx.clone(), Arc::new(NoopXLogSink));

    let pack = ObjectPack {
        obj_hash: 42,
        obj_name: "/app1".into(),
        obj_type: "java".into(),
        address: "127.0.0.1".into(),
        alive: true,
        wakeup_ms: 0,
        tags: vec![],
    };
    use scouter_server::net::udp::PackSink;
    dispatcher.dispatch(Pack::Object(pack.clone()), "127.0.0.1:0".parse().unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;
    dispatcher.dispatch(Pack::Object(pack), "127.0.0.1:0".parse().unwrap());

    assert!(ctx.object_cache.lock().unwrap().get(42).unwrap().alive);

    // simulate 10s having elapsed since the last refresh, dead_timeout=3s
    let now_plus_10s = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
        + 10_000;
    ctx.object_cache.lock().unwrap().sweep_dead(now_plus_10s, Duration::from_secs(3));
    assert!(!ctx.object_cache.lock().unwrap().get(42).unwrap().alive);
}

/// Scenario 5: a reverse RPC issued by a client is relayed to a connected
/// v2 agent and the agent's reply is relayed back to the client.
#[tokio::test]
async fn scenario_reverse_rpc_relays_agent_reply() {
    let (ctx, _dir) = test_ctx();

    let (agent_side, server_side) = tokio::io::duplex(8192);
    let channel = AgentChannel::new(50, Box::new(server_side), false);
    ctx.agent_pool.register(channel);

    tokio::spawn(async move {
        let mut agent_side = agent_side;
        let cmd = read_text_async(&mut agent_side).await.unwrap();
        assert_eq!(cmd, "THREAD_DUMP");
        let _param = read_pack_v1_async(&mut agent_side).await.unwrap();
        let reply = Pack::Map(scouter_server::wire::pack::MapPack {
            fields: vec![("cmd_received".into(), Value::Text(cmd))],
        });
        agent_side.write_all(&[FLAG_HAS_NEXT]).await.unwrap();
        write_pack_v1_async(&mut agent_side, &reply).await.unwrap();
        agent_side.write_all(&[FLAG_NO_NEXT]).await.unwrap();
    });

    let (mut client, _addr) = spawn_tcp_session(ctx.clone()).await;
    let request = Pack::Map(scouter_server::wire::pack::MapPack {
        fields: vec![("obj_hash".into(), Value::Decimal(50))],
    });
    send_request(&mut client, "THREAD_DUMP", 1, &request).await;
    let frames = read_frames(&mut client).await;
    assert_eq!(frames.len(), 1);
    match &frames[0] {
        Pack::Map(m) => assert_eq!(m.get("cmd_received"), Some(&Value::Text("THREAD_DUMP".into()))),
        other => panic!("unexpected: {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ctx.agent_pool.idle_counts().get(&50).copied(), Some(1));
}

/// Scenario 6: hours-based purge closes the older day's in-memory
/// container; the days-based sweeper then removes its files from disk.
#[tokio::test]
async fn scenario_purge_closes_then_removes_old_xlog_container() {
    let (ctx, dir) = test_ctx();

    let yesterday = (chrono::Utc::now().date_naive() - chrono::Duration::days(1)).format("%Y%m%d").to_string();
    let today = chrono::Utc::now().date_naive().format("%Y%m%d").to_string();

    for date in [&yesterday, &today] {
        let container = ctx.registry.get_series(date, "xlog", false).unwrap();
        let mut bytes = Vec::new();
        Pack::XLog(XLogPack {
            end_time: 0,
            obj_hash: 1,
            service: 1,
            txid: 1,
            elapsed: 1,
            cpu: 0,
            sql_count: 0,
            sql_time: 0,
            kbytes: 0,
            status: 0,
            error: 0,
            ip: vec![],
            user_agent: 0,
        })
        .encode(&mut bytes)
        .unwrap();
        let mut guard = container.lock().unwrap();
        if let scouter_server::storage::Container::Series(series) = &mut *guard {
            series.write(0, &bytes).unwrap();
            series.flush().unwrap();
        }
    }

    // hours-based purge keeps only "today" open in memory.
    let keep = purge::keep_set(0);
    ctx.registry.purge_not_in(&keep);

    let yesterday_xlog_dir = dir.path().join(&yesterday).join("xlog");
    assert!(yesterday_xlog_dir.exists(), "files remain on disk until the days-based sweep runs");

    let rules = vec![RetentionRule {
        kind: RetentionKind::XLog,
        keep_days: 0,
    }];
    purge::sweep_days_based(dir.path(), &rules).unwrap();

    assert!(!yesterday_xlog_dir.exists(), "days-based sweep removes the older date's xlog directory");
    assert!(dir.path().join(&today).join("xlog").exists(), "today's container is never swept");
}
