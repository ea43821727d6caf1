use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;

use crate::pause::Layer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// Raw IPv4 datagrams from a TUN device.
    Tun,
    /// Reliable bytestreams from plain TCP sockets; the TCP layer is bypassed.
    Tcp,
}

#[derive(Debug, Parser)]
#[command(name = "clearstack", about = "A see-through userspace HTTPS stack")]
pub struct Config {
    /// Ingress source.
    #[arg(long, value_enum, default_value_t = Mode::Tun)]
    pub mode: Mode,

    /// TUN device name.
    #[arg(long, default_value = "tun0")]
    pub device: String,

    /// Local address of the point-to-point link.
    #[arg(long, default_value = "10.0.0.1")]
    pub addr: Ipv4Addr,

    /// Peer address of the point-to-point link.
    #[arg(long, default_value = "10.0.0.2")]
    pub peer: Ipv4Addr,

    #[arg(long, default_value = "255.255.255.0")]
    pub netmask: Ipv4Addr,

    #[arg(long, default_value_t = 1500)]
    pub mtu: i32,

    /// Listen port for tcp mode (tun mode always serves 80 and 443).
    #[arg(long, default_value_t = 443)]
    pub port: u16,

    /// Server certificate (PEM).
    #[arg(long, default_value = "cert.pem")]
    pub cert: PathBuf,

    /// Server RSA private key (PEM, PKCS#1 or PKCS#8).
    #[arg(long, default_value = "key.pem")]
    pub key: PathBuf,

    /// Layers at which to single-step, comma separated: ip,tcp,tls,http2.
    #[arg(long, value_enum, value_delimiter = ',')]
    pub pause: Vec<Layer>,

    /// Verbose protocol logging.
    #[arg(long)]
    pub debug: bool,
}
