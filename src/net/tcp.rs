//! TCP server and session gate (spec §4.7, C7): a listener bounded by a
//! semaphore, magic-discriminated connection handling, and the client
//! request loop that gates non-free commands on `SessionAuthority`.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::context::ServerContext;
use crate::error::{Result, ServerError};
use crate::net::agent_pool::AgentChannel;
use crate::net::session::is_free_cmd;
use crate::wire::magic::{FLAG_HAS_NEXT, FLAG_INVALID_SESSION, FLAG_NO_NEXT, TCP_AGENT, TCP_AGENT_V2, TCP_CLIENT};
use crate::wire::r#async::{read_i64_async, read_pack_v1_async, read_text_async, read_u32_async, write_pack_v1_async};
use crate::wire::Pack;

/// Duplex half a client handler reads requests from and writes responses
/// to. A real `TcpStream` split in production, an in-memory duplex half in
/// tests.
pub trait ClientDuplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ClientDuplex for T {}

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// A registered TCP client command. Implementations write their own
/// `FLAG_HAS_NEXT`-prefixed response frames; the trailing `FLAG_NO_NEXT` is
/// always written by the request loop, never by the handler itself.
pub trait ClientCommandHandler: Send + Sync {
    fn handle<'a>(
        &'a self,
        ctx: &'a ServerContext,
        stream: &'a mut (dyn ClientDuplex),
        logged_in: bool,
    ) -> HandlerFuture<'a>;
}

pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ClientCommandHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, cmd: &str, handler: Arc<dyn ClientCommandHandler>) {
        self.handlers.insert(cmd.to_string(), handler);
    }

    pub fn get(&self, cmd: &str) -> Option<Arc<dyn ClientCommandHandler>> {
        self.handlers.get(cmd).cloned()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register("SERVER_VERSION", Arc::new(handlers::ServerVersionHandler));
        registry.register("SERVER_TIME", Arc::new(handlers::ServerTimeHandler));
        registry.register("GET_TEXT_100", Arc::new(handlers::GetText100Handler));
        registry.register("TRANX_REAL_TIME_GROUP", Arc::new(handlers::TranxRealTimeGroupHandler));
        for cmd in ["THREAD_DUMP", "HEAP_DUMP", "KEEP_ALIVE"] {
            registry.register(cmd, Arc::new(handlers::ReverseRpcHandler { cmd: cmd.to_string() }));
        }
        registry
    }
}

pub mod handlers {
    use super::*;
    use crate::wire::pack::MapPack;
    use crate::wire::Value;

    pub struct ServerVersionHandler;

    impl ClientCommandHandler for ServerVersionHandler {
        fn handle<'a>(&'a self, _ctx: &'a ServerContext, stream: &'a mut (dyn ClientDuplex), _logged_in: bool) -> HandlerFuture<'a> {
            Box::pin(async move {
                let pack = Pack::Map(MapPack {
                    fields: vec![("version".into(), Value::Text(env!("CARGO_PKG_VERSION").into()))],
                });
                write_frame(stream, &pack).await
            })
        }
    }

    pub struct ServerTimeHandler;

    impl ClientCommandHandler for ServerTimeHandler {
        fn handle<'a>(&'a self, _ctx: &'a ServerContext, stream: &'a mut (dyn ClientDuplex), _logged_in: bool) -> HandlerFuture<'a> {
            Box::pin(async move {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                let pack = Pack::Map(MapPack {
                    fields: vec![("server_time".into(), Value::Long(now))],
                });
                write_frame(stream, &pack).await
            })
        }
    }

    /// Reads a request `MapPack{"xtype": Text, "hashes": List<Decimal>}`,
    /// looks each hash up in the in-memory text cache, and replies with a
    /// `MapPack` containing only the hashes that resolved.
    pub struct GetText100Handler;

    impl ClientCommandHandler for GetText100Handler {
        fn handle<'a>(&'a self, ctx: &'a ServerContext, stream: &'a mut (dyn ClientDuplex), _logged_in: bool) -> HandlerFuture<'a> {
            Box::pin(async move {
                let request = read_pack_v1_async(stream).await?;
                let Pack::Map(req) = request else {
                    return Err(ServerError::WireFormat("GET_TEXT_100 expects a map request".into()));
                };
                let xtype = req.get("xtype").and_then(Value::as_text).unwrap_or_default().to_string();
                let hashes: Vec<i32> = req
                    .get("hashes")
                    .and_then(Value::as_list)
                    .map(|list| list.iter().filter_map(Value::as_decimal).map(|v| v as i32).collect())
                    .unwrap_or_default();

                let fields = {
                    let cache = ctx.text_cache.lock().unwrap();
                    let mut fields = Vec::new();
                    for hash in hashes {
                        if let Some(text) = cache.get(&xtype, hash) {
                            fields.push((hash.to_string(), Value::Text(text.to_string())));
                        }
                    }
                    fields
                };
                write_frame(stream, &Pack::Map(MapPack { fields })).await
            })
        }
    }

    /// Reads `MapPack{"loop": Decimal, "index": Decimal, "limit": Decimal?}`,
    /// streams matching `XLogCache` entries, then a trailing
    /// `MapPack{"loop": Decimal, "index": Decimal}` carrying the cursor to
    /// resume from.
    pub struct TranxRealTimeGroupHandler;

    impl ClientCommandHandler for TranxRealTimeGroupHandler {
        fn handle<'a>(&'a self, ctx: &'a ServerContext, stream: &'a mut (dyn ClientDuplex), _logged_in: bool) -> HandlerFuture<'a> {
            Box::pin(async move {
                let request = read_pack_v1_async(stream).await?;
                let Pack::Map(req) = request else {
                    return Err(ServerError::WireFormat("TRANX_REAL_TIME_GROUP expects a map request".into()));
                };
                let loop_count = req.get("loop").and_then(Value::as_decimal).unwrap_or(0) as u64;
                let index = req.get("index").and_then(Value::as_decimal).unwrap_or(0) as u64;
                let limit = req.get("limit").and_then(Value::as_decimal).unwrap_or(100) as usize;
                let cursor = crate::cache::Cursor { loop_count, index };

                let (entries, new_cursor) = ctx.xlog_cache.lock().unwrap().since(cursor, limit);
                for entry in entries {
                    match Pack::decode(&mut &entry.bytes[..]) {
                        Ok(pack) => write_frame(stream, &pack).await?,
                        Err(e) => log::warn!("skipping malformed cached xlog entry: {e}"),
                    }
                }
                let cursor_pack = Pack::Map(MapPack {
                    fields: vec![
                        ("loop".into(), Value::Decimal(new_cursor.loop_count as i64)),
                        ("index".into(), Value::Decimal(new_cursor.index as i64)),
                    ],
                });
                write_frame(stream, &cursor_pack).await
            })
        }
    }

    /// Reads a request `MapPack` carrying `"obj_hash"`, forwards the whole
    /// map to the named agent command via the reverse-RPC pool, and relays
    /// the single response pack (if any) back to the client (spec §8
    /// scenario 5, §7 error category 6: a timeout surfaces as no frame).
    pub struct ReverseRpcHandler {
        pub cmd: String,
    }

    impl ClientCommandHandler for ReverseRpcHandler {
        fn handle<'a>(&'a self, ctx: &'a ServerContext, stream: &'a mut (dyn ClientDuplex), _logged_in: bool) -> HandlerFuture<'a> {
            Box::pin(async move {
                let request = read_pack_v1_async(stream).await?;
                let obj_hash = match &request {
                    Pack::Map(m) => m.get("obj_hash").and_then(Value::as_decimal).unwrap_or(0) as i32,
                    _ => 0,
                };
                match ctx.agent_pool.call(obj_hash, &self.cmd, &request).await {
                    Ok(Some(response)) => write_frame(stream, &response).await,
                    Ok(None) => Ok(()),
                    Err(e) => {
                        log::warn!("reverse RPC {} to obj_hash={obj_hash} failed: {e}", self.cmd);
                        Ok(())
                    }
                }
            })
        }
    }

    async fn write_frame(stream: &mut (dyn ClientDuplex), pack: &Pack) -> Result<()> {
        stream.write_all(&[FLAG_HAS_NEXT]).await?;
        write_pack_v1_async(stream, pack).await
    }
}

/// Runs the TCP client request loop until `CLOSE`, EOF, or a protocol error.
/// Every iteration reads a command name and session id, gates non-free
/// commands on `sessions.ok_session`, dispatches to the registry, and
/// always terminates the iteration with `FLAG_NO_NEXT`.
pub async fn client_loop(ctx: Arc<ServerContext>, registry: Arc<HandlerRegistry>, mut stream: TcpStream) {
    ctx.metrics.inc_tcp_client();
    let timeout = Duration::from_millis(ctx.config.net.net_tcp_client_so_timeout_ms);
    loop {
        let cmd = match tokio::time::timeout(timeout, read_text_async(&mut stream)).await {
            Ok(Ok(cmd)) => cmd,
            Ok(Err(_)) | Err(_) => break,
        };
        if cmd == "CLOSE" {
            break;
        }
        let session = match read_i64_async(&mut stream).await {
            Ok(s) => s,
            Err(_) => break,
        };

        if !is_free_cmd(&cmd) && !ctx.sessions.ok_session(session) {
            ctx.metrics.inc_session_rejected();
            let _ = stream.write_all(&[FLAG_INVALID_SESSION]).await;
            break;
        }

        match registry.get(&cmd) {
            Some(handler) => {
                if let Err(e) = handler.handle(&ctx, &mut stream, true).await {
                    log::warn!("handler for {cmd} failed: {e}");
                }
            }
            None => {
                log::warn!("no handler registered for command {cmd}, draining one pack");
                if let Err(e) = read_pack_v1_async(&mut stream).await {
                    log::debug!("failed to drain unknown-command pack: {e}");
                    break;
                }
            }
        }

        if stream.write_all(&[FLAG_NO_NEXT]).await.is_err() || stream.flush().await.is_err() {
            break;
        }
    }
    ctx.metrics.dec_tcp_client();
}

async fn handle_agent_connection(ctx: Arc<ServerContext>, stream: TcpStream, v2: bool) {
    let mut stream = stream;
    let obj_hash = match read_obj_hash(&mut stream, v2).await {
        Ok(h) => h,
        Err(e) => {
            log::warn!("failed to read agent obj_hash: {e}");
            return;
        }
    };
    ctx.metrics.inc_tcp_agent();
    let channel = AgentChannel::new(obj_hash, Box::new(stream), v2);
    ctx.agent_pool.register(channel);
}

async fn read_obj_hash(stream: &mut TcpStream, _v2: bool) -> Result<i32> {
    let raw = read_u32_async(stream).await?;
    Ok(raw as i32)
}

/// Accepts connections until cancelled, bounding concurrent `TCP_CLIENT`
/// handlers by `pool_size` (spec §4.7). Agent connections are handed off
/// to the agent pool and don't count against the client semaphore.
pub async fn run(ctx: Arc<ServerContext>, bind_addr: SocketAddr, pool_size: usize) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    log::info!("tcp server listening on {bind_addr}");
    let registry = Arc::new(HandlerRegistry::default());
    let semaphore = Arc::new(Semaphore::new(pool_size));

    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("tcp accept failed: {e}");
                continue;
            }
        };
        log::debug!("accepted tcp connection from {peer}");
        let ctx = ctx.clone();
        let registry = registry.clone();
        let semaphore = semaphore.clone();

        tokio::spawn(async move {
            let magic = match read_u32_async(&mut stream).await {
                Ok(m) => m,
                Err(_) => return,
            };
            match magic {
                TCP_CLIENT => {
                    let permit = semaphore.acquire_owned().await.ok();
                    client_loop(ctx, registry, stream).await;
                    drop(permit);
                }
                TCP_AGENT => handle_agent_connection(ctx, stream, false).await,
                TCP_AGENT_V2 => handle_agent_connection(ctx, stream, true).await,
                other => {
                    log::warn!("unrecognized tcp magic {other:#x} from {peer}, closing");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::wire::pack::MapPack;
    use crate::wire::Value;
    use tempfile::tempdir;
    use tokio::io::duplex;

    fn test_ctx() -> (Arc<ServerContext>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = dir.path().to_path_buf();
        (Arc::new(ServerContext::new(config).unwrap()), dir)
    }

    #[tokio::test]
    async fn server_version_handler_replies_with_crate_version() {
        let (ctx, _dir) = test_ctx();
        let (mut client, mut server) = duplex(4096);
        let handler = handlers::ServerVersionHandler;
        tokio::spawn(async move {
            handler.handle(&ctx, &mut server, true).await.unwrap();
        });
        let mut flag = [0u8; 1];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut flag).await.unwrap();
        assert_eq!(flag[0], FLAG_HAS_NEXT);
        let pack = read_pack_v1_async(&mut client).await.unwrap();
        match pack {
            Pack::Map(m) => assert_eq!(m.get("version"), Some(&Value::Text(env!("CARGO_PKG_VERSION").into()))),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_text_100_returns_only_resolved_hashes() {
        let (ctx, _dir) = test_ctx();
        ctx.text_cache.lock().unwrap().put("service", 1, "checkout");
        ctx.text_cache.lock().unwrap().put("service", 5, "billing");

        let (mut client, mut server) = duplex(8192);
        let request = Pack::Map(MapPack {
            fields: vec![
                ("xtype".into(), Value::Text("service".into())),
                (
                    "hashes".into(),
                    Value::List(vec![Value::Decimal(1), Value::Decimal(5), Value::Decimal(999)]),
                ),
            ],
        });
        write_pack_v1_async(&mut client, &request).await.unwrap();

        let handler = handlers::GetText100Handler;
        handler.handle(&ctx, &mut server, true).await.unwrap();

        let mut flag = [0u8; 1];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut flag).await.unwrap();
        assert_eq!(flag[0], FLAG_HAS_NEXT);
        match read_pack_v1_async(&mut client).await.unwrap() {
            Pack::Map(m) => {
                assert_eq!(m.fields.len(), 2);
                assert_eq!(m.get("1"), Some(&Value::Text("checkout".into())));
                assert_eq!(m.get("5"), Some(&Value::Text("billing".into())));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
