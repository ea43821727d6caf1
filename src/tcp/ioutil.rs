use std::io::{self, Write};
use std::net::Ipv4Addr;

use log::debug;

use crate::wire::ipv4::{Ipv4Header, HEADER_LEN, PROTO_TCP};
use crate::wire::tcp::{self, flags, TcpHeader};

use super::Quad;

/// Wraps a TCP segment into an IPv4 datagram and writes it in one call.
fn write_datagram<W: Write>(
    link: &mut W,
    src: (Ipv4Addr, u16),
    dst: (Ipv4Addr, u16),
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> io::Result<()> {
    let segment = tcp::build_segment(src, dst, seq, ack, flags, payload);

    let mut datagram = Vec::with_capacity(HEADER_LEN + segment.len());
    datagram.extend_from_slice(&Ipv4Header::emit(src.0, dst.0, PROTO_TCP, segment.len()));
    datagram.extend_from_slice(&segment);

    debug!(
        "tcp: out {}:{} -> {}:{} seq={} ack={} flags={:#04x} len={}",
        src.0,
        src.1,
        dst.0,
        dst.1,
        seq,
        ack,
        flags,
        payload.len()
    );
    link.write_all(&datagram)
}

/// Replies travel the quad backwards: from its destination to its source.
fn write_segment<W: Write>(
    link: &mut W,
    quad: Quad,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> io::Result<()> {
    write_datagram(
        link,
        (quad.dst.ipv4, quad.dst.port),
        (quad.src.ipv4, quad.src.port),
        seq,
        ack,
        flags,
        payload,
    )
}

pub fn write_synack<W: Write>(link: &mut W, quad: Quad, iss: u32, ack: u32) -> io::Result<()> {
    write_segment(link, quad, iss, ack, flags::SYN | flags::ACK, &[])
}

pub fn write_ack<W: Write>(link: &mut W, quad: Quad, seq: u32, ack: u32) -> io::Result<()> {
    write_segment(link, quad, seq, ack, flags::ACK, &[])
}

pub fn write_finack<W: Write>(link: &mut W, quad: Quad, seq: u32, ack: u32) -> io::Result<()> {
    write_segment(link, quad, seq, ack, flags::FIN | flags::ACK, &[])
}

pub fn write_data<W: Write>(
    link: &mut W,
    quad: Quad,
    seq: u32,
    ack: u32,
    payload: &[u8],
) -> io::Result<()> {
    write_segment(link, quad, seq, ack, flags::ACK | flags::PSH, payload)
}

pub fn write_rst<W: Write>(link: &mut W, quad: Quad, seq: u32, ack: u32) -> io::Result<()> {
    write_segment(link, quad, seq, ack, flags::RST | flags::ACK, &[])
}

/// Reset for a segment that matches no connection, formed from the
/// offending segment itself: take the sequence number from its ACK field
/// if it has one, otherwise acknowledge everything it sent.
pub fn write_reset<W: Write>(
    link: &mut W,
    iph: &Ipv4Header,
    tcph: &TcpHeader,
    payload_len: usize,
) -> io::Result<()> {
    let (seq, ack, flags) = if tcph.has(flags::ACK) {
        (tcph.ack, 0, flags::RST)
    } else {
        let mut ack = tcph.seq.wrapping_add(payload_len as u32);
        if tcph.has(flags::SYN) {
            ack = ack.wrapping_add(1);
        }
        (0, ack, flags::RST | flags::ACK)
    };

    write_datagram(
        link,
        (iph.dst, tcph.dst_port),
        (iph.src, tcph.src_port),
        seq,
        ack,
        flags,
        &[],
    )
}
