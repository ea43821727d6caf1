use std::net::Ipv4Addr;

use log::warn;

use crate::err::ParseError;
use crate::wire::checksum::Checksum;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;

pub const HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub id: u16,
    pub ttl: u8,
    pub header_len: usize,
    pub total_len: u16,
}

impl Ipv4Header {
    /// Parses a datagram into its header and payload. The TotalLength
    /// field, not the buffer length, defines the payload cut; a datagram
    /// shorter than its TotalLength is truncated to what was received.
    pub fn parse(buf: &[u8]) -> Result<(Ipv4Header, &[u8]), ParseError> {
        if buf.len() < HEADER_LEN {
            return Err(ParseError::Truncated("ipv4 header"));
        }

        if buf[0] >> 4 != 4 {
            return Err(ParseError::BadField("ip version"));
        }

        let header_len = ((buf[0] & 0x0f) as usize) * 4;
        if header_len < HEADER_LEN || buf.len() < header_len {
            return Err(ParseError::BadField("ihl"));
        }

        let total_len = u16::from_be_bytes([buf[2], buf[3]]);
        if (total_len as usize) < header_len {
            return Err(ParseError::BadField("total length"));
        }

        // more-fragments or a nonzero offset: reassembly is out of scope
        if u16::from_be_bytes([buf[6], buf[7]]) & 0x3fff != 0 {
            return Err(ParseError::BadField("fragmented datagram"));
        }

        if Checksum::of(&buf[..header_len]) != 0 {
            warn!("ip: header checksum mismatch");
        }

        let header = Ipv4Header {
            src: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
            dst: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
            proto: buf[9],
            id: u16::from_be_bytes([buf[4], buf[5]]),
            ttl: buf[8],
            header_len,
            total_len,
        };

        let mut end = total_len as usize;
        if end > buf.len() {
            warn!(
                "ip: total length {} exceeds received {} bytes, truncating",
                total_len,
                buf.len()
            );
            end = buf.len();
        }

        Ok((header, &buf[header_len..end]))
    }

    /// Builds a 20-byte header (IHL=5, TOS=0, TTL=64, random id) for a
    /// payload of the given length, with the checksum filled in last.
    pub fn emit(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, payload_len: usize) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];

        buf[0] = 0x45;
        buf[2..4].copy_from_slice(&((HEADER_LEN + payload_len) as u16).to_be_bytes());
        buf[4..6].copy_from_slice(&rand::random::<u16>().to_be_bytes());
        buf[8] = 64;
        buf[9] = proto;
        buf[12..16].copy_from_slice(&src.octets());
        buf[16..20].copy_from_slice(&dst.octets());

        let csum = Checksum::of(&buf);
        buf[10..12].copy_from_slice(&csum.to_be_bytes());

        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_then_parse() {
        let src = Ipv4Addr::new(10, 0, 0, 2);
        let dst = Ipv4Addr::new(10, 0, 0, 1);
        let payload = b"abcdef";

        let mut datagram = Ipv4Header::emit(src, dst, PROTO_TCP, payload.len()).to_vec();
        datagram.extend_from_slice(payload);

        let (header, parsed_payload) = Ipv4Header::parse(&datagram).unwrap();
        assert_eq!(header.src, src);
        assert_eq!(header.dst, dst);
        assert_eq!(header.proto, PROTO_TCP);
        assert_eq!(header.ttl, 64);
        assert_eq!(header.header_len, HEADER_LEN);
        assert_eq!(header.total_len as usize, HEADER_LEN + payload.len());
        assert_eq!(parsed_payload, payload);
    }

    #[test]
    fn emitted_header_sums_to_zero() {
        let header = Ipv4Header::emit(
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(192, 168, 1, 2),
            PROTO_TCP,
            100,
        );
        assert_eq!(Checksum::of(&header), 0);
    }

    #[test]
    fn cross_check_against_etherparse() {
        let src = Ipv4Addr::new(10, 10, 10, 10);
        let dst = Ipv4Addr::new(10, 10, 10, 1);
        let header = Ipv4Header::emit(src, dst, PROTO_TCP, 32);

        let slice = etherparse::Ipv4HeaderSlice::from_slice(&header).unwrap();
        assert_eq!(slice.source_addr(), src);
        assert_eq!(slice.destination_addr(), dst);
        assert_eq!(slice.protocol(), PROTO_TCP);
        assert_eq!(slice.ttl(), 64);
        assert_eq!(slice.total_len(), 52);
        assert_eq!(
            slice.header_checksum(),
            slice.to_header().calc_header_checksum().unwrap()
        );
    }

    #[test]
    fn total_length_cuts_payload() {
        let mut datagram = Ipv4Header::emit(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
            PROTO_TCP,
            4,
        )
        .to_vec();
        datagram.extend_from_slice(b"abcdXXXX"); // four bytes of trailing padding

        let (_, payload) = Ipv4Header::parse(&datagram).unwrap();
        assert_eq!(payload, b"abcd");
    }

    #[test]
    fn truncated_datagram_is_cut_to_received_bytes() {
        let mut datagram = Ipv4Header::emit(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
            PROTO_TCP,
            100,
        )
        .to_vec();
        datagram.extend_from_slice(b"short");

        let (header, payload) = Ipv4Header::parse(&datagram).unwrap();
        assert_eq!(header.total_len as usize, HEADER_LEN + 100);
        assert_eq!(payload, b"short");
    }

    #[test]
    fn fragments_are_discarded() {
        let mut datagram = Ipv4Header::emit(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
            PROTO_TCP,
            0,
        );
        datagram[6] = 0x20; // more fragments
        assert!(Ipv4Header::parse(&datagram).is_err());

        datagram[6] = 0x00;
        datagram[7] = 0x08; // fragment offset 8
        assert!(Ipv4Header::parse(&datagram).is_err());
    }

    #[test]
    fn rejects_short_and_bad_version() {
        assert!(Ipv4Header::parse(&[0x45; 10]).is_err());

        let mut datagram = [0u8; 20];
        datagram[0] = 0x65; // version 6
        assert!(Ipv4Header::parse(&datagram).is_err());
    }
}
