use std::net::Ipv4Addr;

use crate::err::ParseError;
use crate::wire::checksum::Checksum;
use crate::wire::ipv4::PROTO_TCP;

pub const HEADER_LEN: usize = 20;

pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub data_offset: usize,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
}

impl TcpHeader {
    pub fn parse(segment: &[u8]) -> Result<(TcpHeader, &[u8]), ParseError> {
        if segment.len() < HEADER_LEN {
            return Err(ParseError::Truncated("tcp header"));
        }

        let data_offset = ((segment[12] >> 4) as usize) * 4;
        if data_offset < HEADER_LEN || segment.len() < data_offset {
            return Err(ParseError::BadField("tcp data offset"));
        }

        let header = TcpHeader {
            src_port: u16::from_be_bytes([segment[0], segment[1]]),
            dst_port: u16::from_be_bytes([segment[2], segment[3]]),
            seq: u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
            ack: u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]]),
            data_offset,
            flags: segment[13] & 0x3f,
            window: u16::from_be_bytes([segment[14], segment[15]]),
            checksum: u16::from_be_bytes([segment[16], segment[17]]),
        };

        Ok((header, &segment[data_offset..]))
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

fn pseudo_header(src: Ipv4Addr, dst: Ipv4Addr, tcp_len: usize) -> Checksum {
    let mut csum = Checksum::new();
    csum.push(&src.octets());
    csum.push(&dst.octets());
    csum.push(&[0, PROTO_TCP]);
    csum.push_u16(tcp_len as u16);
    csum
}

/// Builds a complete TCP segment (no options: DataOffset=5, Window=65535,
/// Urgent=0) with the checksum computed over the pseudo-header.
pub fn build_segment(
    src: (Ipv4Addr, u16),
    dst: (Ipv4Addr, u16),
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut segment = Vec::with_capacity(HEADER_LEN + payload.len());

    segment.extend_from_slice(&src.1.to_be_bytes());
    segment.extend_from_slice(&dst.1.to_be_bytes());
    segment.extend_from_slice(&seq.to_be_bytes());
    segment.extend_from_slice(&ack.to_be_bytes());
    segment.push(5 << 4);
    segment.push(flags);
    segment.extend_from_slice(&65535u16.to_be_bytes());
    segment.extend_from_slice(&[0, 0]); // checksum placeholder
    segment.extend_from_slice(&[0, 0]); // urgent pointer
    segment.extend_from_slice(payload);

    let mut csum = pseudo_header(src.0, dst.0, segment.len());
    csum.push(&segment);
    let csum = csum.finish();
    segment[16..18].copy_from_slice(&csum.to_be_bytes());

    segment
}

/// True when the segment sums to zero under its pseudo-header.
pub fn verify_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> bool {
    let mut csum = pseudo_header(src, dst, segment.len());
    csum.push(segment);
    csum.finish() == 0
}
