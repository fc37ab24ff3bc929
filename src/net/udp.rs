//! UDP ingestion pipeline (spec §4.6, C6): datagram receive loop, bounded
//! worker queue, magic-based dispatch, and MTU fragment reassembly.
//!
//! The receive loop never blocks on anything but the socket read — handoff
//! to the worker queue is non-blocking and drops on overflow, because a slow
//! consumer must never stall the network read loop (spec §5).

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::net::mtu::ReassemblyTable;
use crate::wire::magic::{is_mtu_magic, is_multi_pack_magic, is_single_pack_magic};
use crate::wire::value::{read_i32, read_i64, read_u16, read_u32};
use crate::wire::Pack;

pub const QUEUE_SIZE: usize = 2048;

/// Anything that wants decoded packs off the UDP pipeline implements this.
/// Kept narrow so `net::udp` doesn't need to know about the dispatcher.
pub trait PackSink: Send + Sync {
    fn dispatch(&self, pack: Pack, sender: SocketAddr);
}

struct Datagram {
    buf: Vec<u8>,
    sender: SocketAddr,
}

pub struct UdpPipelineConfig {
    pub bind_addr: SocketAddr,
    pub buf_size: usize,
    pub workers: usize,
    pub mtu_table_max_entries: usize,
    pub mtu_ttl_ms: i64,
}

impl Default for UdpPipelineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".parse().unwrap(),
            buf_size: 65_536,
            workers: 4,
            mtu_table_max_entries: 10_000,
            mtu_ttl_ms: 30_000,
        }
    }
}

/// Binds the UDP socket, spawns the receive loop and `workers` worker
/// tasks, and returns once the socket is bound (the loops run forever in
/// the background). Each worker shares one `ReassemblyTable`, matching the
/// "process-wide table keyed by pkid" in spec §4.6.
pub async fn spawn(
    config: UdpPipelineConfig,
    sink: Arc<dyn PackSink>,
) -> std::io::Result<SocketAddr> {
    let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
    let local_addr = socket.local_addr()?;
    let (tx, rx) = mpsc::channel::<Datagram>(QUEUE_SIZE);
    let reassembly = Arc::new(Mutex::new(ReassemblyTable::new(
        config.mtu_table_max_entries,
        config.mtu_ttl_ms,
    )));

    tokio::spawn(recv_loop(socket, tx, config.buf_size));

    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    for worker_id in 0..config.workers.max(1) {
        tokio::spawn(worker_loop(worker_id, rx.clone(), sink.clone(), reassembly.clone()));
    }

    tokio::spawn(expire_loop(reassembly));

    Ok(local_addr)
}

async fn recv_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<Datagram>, buf_size: usize) {
    let mut buf = vec![0u8; buf_size];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, sender)) => {
                let datagram = Datagram {
                    buf: buf[..n].to_vec(),
                    sender,
                };
                if tx.try_send(datagram).is_err() {
                    log::warn!("udp worker queue full, dropping datagram from {sender}");
                }
            }
            Err(e) => {
                log::error!("udp recv_from failed: {e}");
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Datagram>>>,
    sink: Arc<dyn PackSink>,
    reassembly: Arc<Mutex<ReassemblyTable>>,
) {
    loop {
        let datagram = {
            let mut rx = rx.lock().await;
            match rx.recv().await {
                Some(d) => d,
                None => {
                    log::info!("udp worker {worker_id} shutting down, channel closed");
                    return;
                }
            }
        };
        if let Err(e) = handle_datagram(&datagram, &sink, &reassembly) {
            log::warn!("udp worker {worker_id} dropped malformed datagram from {}: {e}", datagram.sender);
        }
    }
}

fn handle_datagram(
    datagram: &Datagram,
    sink: &Arc<dyn PackSink>,
    reassembly: &Arc<Mutex<ReassemblyTable>>,
) -> crate::error::Result<()> {
    let mut cursor = &datagram.buf[..];
    let magic = read_u32(&mut cursor)?;

    if is_single_pack_magic(magic) {
        let pack = Pack::decode(&mut cursor)?;
        sink.dispatch(pack, datagram.sender);
        return Ok(());
    }

    if is_multi_pack_magic(magic) {
        let count = read_u16(&mut cursor)?;
        for _ in 0..count {
            let pack = Pack::decode(&mut cursor)?;
            sink.dispatch(pack, datagram.sender);
        }
        return Ok(());
    }

    if is_mtu_magic(magic) {
        let _obj_hash = read_i32(&mut cursor)?;
        let pkid = read_i64(&mut cursor)?;
        let total = read_u16(&mut cursor)?;
        let num = read_u16(&mut cursor)?;
        let blob = crate::wire::value::read_str(&mut cursor)?;
        let now_ms = now_millis();
        let mut table = reassembly.lock().unwrap();
        if let Some(reassembled) = table.add(pkid, total, num, blob, now_ms) {
            drop(table);
            let pack = Pack::decode(&mut &reassembled[..])?;
            sink.dispatch(pack, datagram.sender);
        }
        return Ok(());
    }

    Err(crate::error::ServerError::WireFormat(format!(
        "unrecognized udp magic {magic:#010x}"
    )))
}

async fn expire_loop(reassembly: Arc<Mutex<ReassemblyTable>>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
    loop {
        interval.tick().await;
        let now_ms = now_millis();
        let dropped = reassembly.lock().unwrap().sweep_expired(now_ms);
        if dropped > 0 {
            log::debug!("mtu reassembly table expired {dropped} incomplete entr(y/ies)");
        }
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::pack::{MapPack, TextPack};
    use crate::wire::magic::{UDP_CAFE, UDP_CAFE_MTU, UDP_CAFE_N};
    use crate::wire::Value;
    use std::sync::Mutex as StdMutex;

    struct CollectingSink {
        packs: StdMutex<Vec<Pack>>,
    }

    impl PackSink for CollectingSink {
        fn dispatch(&self, pack: Pack, _sender: SocketAddr) {
            self.packs.lock().unwrap().push(pack);
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    #[test]
    fn single_pack_datagram_dispatches_one_pack() {
        let pack = Pack::Text(TextPack {
            xtype: "service".into(),
            hash: 1,
            text: "svc".into(),
        });
        let mut buf = Vec::new();
        buf.extend_from_slice(&UDP_CAFE.to_be_bytes());
        pack.encode(&mut buf).unwrap();

        let sink = Arc::new(CollectingSink { packs: StdMutex::new(Vec::new()) });
        let reassembly = Arc::new(Mutex::new(ReassemblyTable::new(16, 30_000)));
        let datagram = Datagram { buf, sender: addr() };
        handle_datagram(&datagram, &(sink.clone() as Arc<dyn PackSink>), &reassembly).unwrap();
        assert_eq!(sink.packs.lock().unwrap().len(), 1);
    }

    #[test]
    fn multi_pack_datagram_dispatches_all_packs() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&UDP_CAFE_N.to_be_bytes());
        buf.extend_from_slice(&2u16.to_be_bytes());
        for i in 0..2 {
            Pack::Text(TextPack {
                xtype: "service".into(),
                hash: i,
                text: format!("svc-{i}"),
            })
            .encode(&mut buf)
            .unwrap();
        }
        let sink = Arc::new(CollectingSink { packs: StdMutex::new(Vec::new()) });
        let reassembly = Arc::new(Mutex::new(ReassemblyTable::new(16, 30_000)));
        let datagram = Datagram { buf, sender: addr() };
        handle_datagram(&datagram, &(sink.clone() as Arc<dyn PackSink>), &reassembly).unwrap();
        assert_eq!(sink.packs.lock().unwrap().len(), 2);
    }

    #[test]
    fn mtu_fragments_reassemble_into_one_pack() {
        let pack = Pack::Map(MapPack {
            fields: vec![("key".into(), Value::Text("value".into()))],
        });
        let mut body = Vec::new();
        pack.encode(&mut body).unwrap();
        let mid = body.len() / 2;
        let (first_half, second_half) = body.split_at(mid);

        let frame = |pkid: i64, total: u16, num: u16, blob: &[u8]| {
            let mut buf = Vec::new();
            buf.extend_from_slice(&UDP_CAFE_MTU.to_be_bytes());
            buf.extend_from_slice(&1i32.to_be_bytes()); // obj_hash
            buf.extend_from_slice(&pkid.to_be_bytes());
            buf.extend_from_slice(&total.to_be_bytes());
            buf.extend_from_slice(&num.to_be_bytes());
            crate::wire::value::write_str(&mut buf, blob).unwrap();
            buf
        };

        let sink = Arc::new(CollectingSink { packs: StdMutex::new(Vec::new()) });
        let reassembly = Arc::new(Mutex::new(ReassemblyTable::new(16, 30_000)));

        // out of order: second fragment first
        let d2 = Datagram { buf: frame(7, 2, 1, second_half), sender: addr() };
        handle_datagram(&d2, &(sink.clone() as Arc<dyn PackSink>), &reassembly).unwrap();
        assert!(sink.packs.lock().unwrap().is_empty());

        let d1 = Datagram { buf: frame(7, 2, 0, first_half), sender: addr() };
        handle_datagram(&d1, &(sink.clone() as Arc<dyn PackSink>), &reassembly).unwrap();

        let packs = sink.packs.lock().unwrap();
        assert_eq!(packs.len(), 1);
        assert_eq!(packs[0], pack);
    }

    #[test]
    fn unrecognized_magic_is_an_error() {
        let sink = Arc::new(CollectingSink { packs: StdMutex::new(Vec::new()) });
        let reassembly = Arc::new(Mutex::new(ReassemblyTable::new(16, 30_000)));
        let datagram = Datagram {
            buf: vec![0, 0, 0, 0],
            sender: addr(),
        };
        assert!(handle_datagram(&datagram, &(sink as Arc<dyn PackSink>), &reassembly).is_err());
    }
}
