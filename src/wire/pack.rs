//! Pack-level framing: a one-byte type tag followed by a type-specific body.
//! `Pack::decode` reads the tag and dispatches; an unknown tag is a
//! `WireFormat` error and the caller MUST close the connection (spec §4.1).

use std::io::{Read, Write};

use crate::error::{Result, ServerError};
use crate::wire::value::{read_i32, read_i64, read_str, read_u8, write_str, Value};

const TYPE_TEXT: u8 = 1;
const TYPE_XLOG: u8 = 2;
const TYPE_PERF_COUNTER: u8 = 3;
const TYPE_OBJECT: u8 = 4;
const TYPE_ALERT: u8 = 5;
const TYPE_SUMMARY: u8 = 6;
const TYPE_PROFILE: u8 = 7;
const TYPE_PROFILE2: u8 = 8;
const TYPE_MAP: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeType {
    Realtime,
    FiveMin,
    OneHour,
}

impl TimeType {
    fn to_byte(self) -> u8 {
        match self {
            TimeType::Realtime => 0,
            TimeType::FiveMin => 1,
            TimeType::OneHour => 2,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(TimeType::Realtime),
            1 => Ok(TimeType::FiveMin),
            2 => Ok(TimeType::OneHour),
            other => Err(ServerError::WireFormat(format!(
                "unknown time_type byte {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextPack {
    pub xtype: String,
    pub hash: i32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct XLogPack {
    pub end_time: i64,
    pub obj_hash: i32,
    pub service: i32,
    pub txid: i64,
    pub elapsed: i32,
    pub cpu: i32,
    pub sql_count: i32,
    pub sql_time: i32,
    pub kbytes: i32,
    pub status: i32,
    pub error: i32,
    pub ip: Vec<u8>,
    pub user_agent: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerfCounterPack {
    pub time_ms: i64,
    pub obj_hash: i32,
    pub time_type: TimeType,
    pub data: Vec<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectPack {
    pub obj_hash: i32,
    pub obj_name: String,
    pub obj_type: String,
    pub address: String,
    pub alive: bool,
    pub wakeup_ms: i64,
    pub tags: Vec<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertPack {
    pub stype: u8,
    pub obj_hash: i32,
    pub time: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryPack {
    pub stype: u8,
    pub time: i64,
    pub fields: Vec<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfilePack {
    pub txid: i64,
    pub step: i32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapPack {
    pub fields: Vec<(String, Value)>,
}

impl MapPack {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.fields.push((key.into(), value));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pack {
    Text(TextPack),
    XLog(XLogPack),
    PerfCounter(PerfCounterPack),
    Object(ObjectPack),
    Alert(AlertPack),
    Summary(SummaryPack),
    Profile(ProfilePack),
    Profile2(ProfilePack),
    Map(MapPack),
}

impl Pack {
    pub fn type_tag(&self) -> u8 {
        match self {
            Pack::Text(_) => TYPE_TEXT,
            Pack::XLog(_) => TYPE_XLOG,
            Pack::PerfCounter(_) => TYPE_PERF_COUNTER,
            Pack::Object(_) => TYPE_OBJECT,
            Pack::Alert(_) => TYPE_ALERT,
            Pack::Summary(_) => TYPE_SUMMARY,
            Pack::Profile(_) => TYPE_PROFILE,
            Pack::Profile2(_) => TYPE_PROFILE2,
            Pack::Map(_) => TYPE_MAP,
        }
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&[self.type_tag()])?;
        match self {
            Pack::Text(p) => {
                write_str(w, p.xtype.as_bytes())?;
                w.write_all(&p.hash.to_be_bytes())?;
                write_str(w, p.text.as_bytes())?;
            }
            Pack::XLog(p) => {
                w.write_all(&p.end_time.to_be_bytes())?;
                w.write_all(&p.obj_hash.to_be_bytes())?;
                w.write_all(&p.service.to_be_bytes())?;
                w.write_all(&p.txid.to_be_bytes())?;
                w.write_all(&p.elapsed.to_be_bytes())?;
                w.write_all(&p.cpu.to_be_bytes())?;
                w.write_all(&p.sql_count.to_be_bytes())?;
                w.write_all(&p.sql_time.to_be_bytes())?;
                w.write_all(&p.kbytes.to_be_bytes())?;
                w.write_all(&p.status.to_be_bytes())?;
                w.write_all(&p.error.to_be_bytes())?;
                write_str(w, &p.ip)?;
                w.write_all(&p.user_agent.to_be_bytes())?;
            }
            Pack::PerfCounter(p) => {
                w.write_all(&p.time_ms.to_be_bytes())?;
                w.write_all(&p.obj_hash.to_be_bytes())?;
                w.write_all(&[p.time_type.to_byte()])?;
                encode_kv_list(w, &p.data)?;
            }
            Pack::Object(p) => {
                w.write_all(&p.obj_hash.to_be_bytes())?;
                write_str(w, p.obj_name.as_bytes())?;
                write_str(w, p.obj_type.as_bytes())?;
                write_str(w, p.address.as_bytes())?;
                w.write_all(&[if p.alive { 1 } else { 0 }])?;
                w.write_all(&p.wakeup_ms.to_be_bytes())?;
                encode_kv_list(w, &p.tags)?;
            }
            Pack::Alert(p) => {
                w.write_all(&[p.stype])?;
                w.write_all(&p.obj_hash.to_be_bytes())?;
                w.write_all(&p.time.to_be_bytes())?;
                write_str(w, p.message.as_bytes())?;
            }
            Pack::Summary(p) => {
                w.write_all(&[p.stype])?;
                w.write_all(&p.time.to_be_bytes())?;
                encode_kv_list(w, &p.fields)?;
            }
            Pack::Profile(p) | Pack::Profile2(p) => {
                w.write_all(&p.txid.to_be_bytes())?;
                w.write_all(&p.step.to_be_bytes())?;
                write_str(w, &p.data)?;
            }
            Pack::Map(p) => {
                encode_kv_list(w, &p.fields)?;
            }
        }
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Pack> {
        let tag = read_u8(r)?;
        Self::decode_body(r, tag)
    }

    fn decode_body<R: Read>(r: &mut R, tag: u8) -> Result<Pack> {
        match tag {
            TYPE_TEXT => {
                let xtype = read_utf8(r)?;
                let hash = read_i32(r)?;
                let text = read_utf8(r)?;
                Ok(Pack::Text(TextPack { xtype, hash, text }))
            }
            TYPE_XLOG => Ok(Pack::XLog(XLogPack {
                end_time: read_i64(r)?,
                obj_hash: read_i32(r)?,
                service: read_i32(r)?,
                txid: read_i64(r)?,
                elapsed: read_i32(r)?,
                cpu: read_i32(r)?,
                sql_count: read_i32(r)?,
                sql_time: read_i32(r)?,
                kbytes: read_i32(r)?,
                status: read_i32(r)?,
                error: read_i32(r)?,
                ip: read_str(r)?,
                user_agent: read_i32(r)?,
            })),
            TYPE_PERF_COUNTER => {
                let time_ms = read_i64(r)?;
                let obj_hash = read_i32(r)?;
                let time_type = TimeType::from_byte(read_u8(r)?)?;
                let data = decode_kv_list(r)?;
                Ok(Pack::PerfCounter(PerfCounterPack {
                    time_ms,
                    obj_hash,
                    time_type,
                    data,
                }))
            }
            TYPE_OBJECT => {
                let obj_hash = read_i32(r)?;
                let obj_name = read_utf8(r)?;
                let obj_type = read_utf8(r)?;
                let address = read_utf8(r)?;
                let alive = read_u8(r)? != 0;
                let wakeup_ms = read_i64(r)?;
                let tags = decode_kv_list(r)?;
                Ok(Pack::Object(ObjectPack {
                    obj_hash,
                    obj_name,
                    obj_type,
                    address,
                    alive,
                    wakeup_ms,
                    tags,
                }))
            }
            TYPE_ALERT => Ok(Pack::Alert(AlertPack {
                stype: read_u8(r)?,
                obj_hash: read_i32(r)?,
                time: read_i64(r)?,
                message: read_utf8(r)?,
            })),
            TYPE_SUMMARY => {
                let stype = read_u8(r)?;
                let time = read_i64(r)?;
                let fields = decode_kv_list(r)?;
                Ok(Pack::Summary(SummaryPack {
                    stype,
                    time,
                    fields,
                }))
            }
            TYPE_PROFILE | TYPE_PROFILE2 => {
                let txid = read_i64(r)?;
                let step = read_i32(r)?;
                let data = read_str(r)?;
                let p = ProfilePack { txid, step, data };
                if tag == TYPE_PROFILE {
                    Ok(Pack::Profile(p))
                } else {
                    Ok(Pack::Profile2(p))
                }
            }
            TYPE_MAP => Ok(Pack::Map(MapPack {
                fields: decode_kv_list(r)?,
            })),
            other => Err(ServerError::WireFormat(format!(
                "unknown pack type tag {other}"
            ))),
        }
    }
}

fn read_utf8<R: Read>(r: &mut R) -> Result<String> {
    String::from_utf8(read_str(r)?)
        .map_err(|e| ServerError::WireFormat(format!("invalid utf8: {e}")))
}

fn encode_kv_list<W: Write>(w: &mut W, entries: &[(String, Value)]) -> Result<()> {
    w.write_all(&(entries.len() as u32).to_be_bytes())?;
    for (key, value) in entries {
        write_str(w, key.as_bytes())?;
        value.encode(w)?;
    }
    Ok(())
}

fn decode_kv_list<R: Read>(r: &mut R) -> Result<Vec<(String, Value)>> {
    let count = {
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf).map_err(|_| ServerError::ShortRead {
            expected: 4,
            got: 0,
        })?;
        u32::from_be_bytes(buf)
    };
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key = read_utf8(r)?;
        let value = Value::decode(r)?;
        entries.push((key, value));
    }
    Ok(entries)
}
