//! Four-byte magics that discriminate connection and datagram shape.
//!
//! Values are a contract with deployed agents and dashboard clients and
//! MUST NOT change.

pub const UDP_CAFE: u32 = 0xCAFE_00AE;
pub const UDP_CAFE_N: u32 = 0xCAFE_00BE;
pub const UDP_CAFE_MTU: u32 = 0xCAFE_00CE;

pub const UDP_JAVA: u32 = 0xCAFE_01AE;
pub const UDP_JAVA_N: u32 = 0xCAFE_01BE;
pub const UDP_JAVA_MTU: u32 = 0xCAFE_01CE;

pub const TCP_CLIENT: u32 = 0xCAFE_2001;
pub const TCP_AGENT: u32 = 0xCAFE_2002;
pub const TCP_AGENT_V2: u32 = 0xCAFE_2003;

/// Flag bytes written between response frames on the TCP client channel.
/// Exact values are a contract with deployed clients and MUST be preserved.
pub const FLAG_HAS_NEXT: u8 = 0x01;
pub const FLAG_NO_NEXT: u8 = 0x02;
pub const FLAG_INVALID_SESSION: u8 = 0x03;

pub fn is_single_pack_magic(magic: u32) -> bool {
    magic == UDP_CAFE || magic == UDP_JAVA
}

pub fn is_multi_pack_magic(magic: u32) -> bool {
    magic == UDP_CAFE_N || magic == UDP_JAVA_N
}

pub fn is_mtu_magic(magic: u32) -> bool {
    magic == UDP_CAFE_MTU || magic == UDP_JAVA_MTU
}
