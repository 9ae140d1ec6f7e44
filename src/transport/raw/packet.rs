//! Ethernet/IPv4 frame building, parsing and datalink I/O
//!
//! The datalink channel is blocking, so it gets two dedicated OS threads:
//! one reads frames and feeds parsed packets into a tokio channel, one
//! drains an injection channel onto the wire. Data segments are paced
//! ~1 ms apart on the injection side.

use pnet::datalink::{self, Channel, NetworkInterface};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::tcp::{self, MutableTcpPacket, TcpPacket};
use pnet::packet::udp::{self, MutableUdpPacket, UdpPacket};
use pnet::packet::Packet;
use bytes::Bytes;
use pnet::util::MacAddr;
use rand::rngs::OsRng;
use rand::Rng;
use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const ETH_HEADER: usize = 14;
const IPV4_HEADER: usize = 20;
const TCP_HEADER: usize = 20;
const UDP_HEADER: usize = 8;

/// Pause after injecting a data-bearing segment
const INJECT_PACE: Duration = Duration::from_millis(1);

/// A parsed inbound packet addressed to the local IP
pub(crate) enum RawPacket {
    Tcp(TcpSegment),
    Udp(UdpDatagram),
}

pub(crate) struct TcpSegment {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub flags: u8,
    pub payload: Bytes,
}

pub(crate) struct UdpDatagram {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Bytes,
}

/// One frame queued for injection
struct InjectFrame {
    bytes: Vec<u8>,
    pace: bool,
}

/// Handle for injecting frames onto the opened interface
#[derive(Clone)]
pub(crate) struct LinkHandle {
    pub local_mac: MacAddr,
    pub router_mac: MacAddr,
    pub local_ip: Ipv4Addr,
    inject_tx: mpsc::UnboundedSender<InjectFrame>,
}

impl LinkHandle {
    /// Queue a frame; `pace` inserts the ~1 ms gap after it
    pub(crate) fn send_frame(&self, bytes: Vec<u8>, pace: bool) {
        let _ = self.inject_tx.send(InjectFrame { bytes, pace });
    }

    pub(crate) fn tcp_segment(
        &self,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        build_tcp_segment(
            self.local_mac,
            self.router_mac,
            self.local_ip,
            dst_ip,
            src_port,
            dst_port,
            seq,
            ack,
            flags,
            payload,
        )
    }

    pub(crate) fn udp_datagram(
        &self,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        build_udp_datagram(
            self.local_mac,
            self.router_mac,
            self.local_ip,
            dst_ip,
            src_port,
            dst_port,
            payload,
        )
    }
}

/// Open the interface and start the reader/injector threads.
///
/// Returns the injection handle and the stream of inbound packets whose
/// destination IP matches `local_ip`.
pub(crate) fn open_link(
    iface_name: &str,
    local_ip: Ipv4Addr,
    router_mac: MacAddr,
    local_mac: Option<MacAddr>,
) -> io::Result<(LinkHandle, mpsc::UnboundedReceiver<RawPacket>)> {
    let interface: NetworkInterface = datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == iface_name)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("interface {iface_name} not found"),
            )
        })?;

    let local_mac = match local_mac {
        Some(mac) => mac,
        None => interface.mac.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("interface {iface_name} has no MAC address"),
            )
        })?,
    };

    let mut config = datalink::Config::default();
    config.read_timeout = Some(Duration::from_millis(100));

    let (mut link_tx, mut link_rx) = match datalink::channel(&interface, config) {
        Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
        Ok(_) => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unsupported datalink channel type",
            ))
        }
        Err(e) => return Err(e),
    };

    debug!(
        "raw link on {} ({} -> router {})",
        iface_name, local_mac, router_mac
    );

    let (packet_tx, packet_rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("raw-link-rx".to_string())
        .spawn(move || loop {
            if packet_tx.is_closed() {
                break;
            }
            match link_rx.next() {
                Ok(frame) => {
                    if let Some(packet) = parse_frame(frame, local_ip) {
                        if packet_tx.send(packet).is_err() {
                            break;
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    warn!("raw link receive failed: {}", e);
                    break;
                }
            }
        })?;

    let (inject_tx, mut inject_rx) = mpsc::unbounded_channel::<InjectFrame>();
    std::thread::Builder::new()
        .name("raw-link-tx".to_string())
        .spawn(move || {
            while let Some(frame) = inject_rx.blocking_recv() {
                if let Some(Err(e)) = link_tx.send_to(&frame.bytes, None) {
                    warn!("raw link send failed: {}", e);
                    break;
                }
                if frame.pace {
                    std::thread::sleep(INJECT_PACE);
                }
            }
        })?;

    Ok((
        LinkHandle {
            local_mac,
            router_mac,
            local_ip,
            inject_tx,
        },
        packet_rx,
    ))
}

/// Parse an Ethernet frame, keeping only IPv4 traffic for `local_ip`
pub(crate) fn parse_frame(frame: &[u8], local_ip: Ipv4Addr) -> Option<RawPacket> {
    let eth = EthernetPacket::new(frame)?;
    if eth.get_ethertype() != EtherTypes::Ipv4 {
        return None;
    }
    let ip = Ipv4Packet::new(eth.payload())?;
    if ip.get_destination() != local_ip {
        return None;
    }

    // Short frames carry Ethernet padding past the IP datagram; trim by
    // the declared lengths rather than trusting the capture length.
    let ip_payload_len = (ip.get_total_length() as usize)
        .saturating_sub(usize::from(ip.get_header_length()) * 4)
        .min(ip.payload().len());

    match ip.get_next_level_protocol() {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(ip.payload())?;
            let data_off = usize::from(tcp.get_data_offset()) * 4;
            let payload = Bytes::copy_from_slice(
                ip.payload().get(data_off..ip_payload_len).unwrap_or(&[]),
            );
            Some(RawPacket::Tcp(TcpSegment {
                src_ip: ip.get_source(),
                src_port: tcp.get_source(),
                dst_port: tcp.get_destination(),
                seq: tcp.get_sequence(),
                flags: tcp.get_flags(),
                payload,
            }))
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(ip.payload())?;
            let udp_len = (udp.get_length() as usize).min(ip_payload_len);
            let payload = Bytes::copy_from_slice(
                ip.payload().get(UDP_HEADER..udp_len).unwrap_or(&[]),
            );
            Some(RawPacket::Udp(UdpDatagram {
                src_ip: ip.get_source(),
                src_port: udp.get_source(),
                dst_port: udp.get_destination(),
                payload,
            }))
        }
        _ => None,
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn build_tcp_segment(
    local_mac: MacAddr,
    router_mac: MacAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let total = ETH_HEADER + IPV4_HEADER + TCP_HEADER + payload.len();
    let mut buf = vec![0u8; total];

    build_ethernet(&mut buf, local_mac, router_mac);
    build_ipv4(
        &mut buf[ETH_HEADER..],
        src_ip,
        dst_ip,
        IpNextHeaderProtocols::Tcp,
        IPV4_HEADER + TCP_HEADER + payload.len(),
    );

    let tcp_start = ETH_HEADER + IPV4_HEADER;
    let mut tcp_pkt =
        MutableTcpPacket::new(&mut buf[tcp_start..]).expect("buffer sized for TCP header");
    tcp_pkt.set_source(src_port);
    tcp_pkt.set_destination(dst_port);
    tcp_pkt.set_sequence(seq);
    tcp_pkt.set_acknowledgement(ack);
    tcp_pkt.set_data_offset(5);
    tcp_pkt.set_flags(flags);
    tcp_pkt.set_window(65535);
    tcp_pkt.set_payload(payload);
    let checksum = tcp::ipv4_checksum(&tcp_pkt.to_immutable(), &src_ip, &dst_ip);
    tcp_pkt.set_checksum(checksum);

    buf
}

pub(crate) fn build_udp_datagram(
    local_mac: MacAddr,
    router_mac: MacAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let total = ETH_HEADER + IPV4_HEADER + UDP_HEADER + payload.len();
    let mut buf = vec![0u8; total];

    build_ethernet(&mut buf, local_mac, router_mac);
    build_ipv4(
        &mut buf[ETH_HEADER..],
        src_ip,
        dst_ip,
        IpNextHeaderProtocols::Udp,
        IPV4_HEADER + UDP_HEADER + payload.len(),
    );

    let udp_start = ETH_HEADER + IPV4_HEADER;
    let mut udp_pkt =
        MutableUdpPacket::new(&mut buf[udp_start..]).expect("buffer sized for UDP header");
    udp_pkt.set_source(src_port);
    udp_pkt.set_destination(dst_port);
    udp_pkt.set_length((UDP_HEADER + payload.len()) as u16);
    udp_pkt.set_payload(payload);
    let checksum = udp::ipv4_checksum(&udp_pkt.to_immutable(), &src_ip, &dst_ip);
    udp_pkt.set_checksum(checksum);

    buf
}

fn build_ethernet(buf: &mut [u8], local_mac: MacAddr, router_mac: MacAddr) {
    let mut eth = MutableEthernetPacket::new(buf).expect("buffer sized for Ethernet header");
    eth.set_source(local_mac);
    eth.set_destination(router_mac);
    eth.set_ethertype(EtherTypes::Ipv4);
}

fn build_ipv4(
    buf: &mut [u8],
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    protocol: pnet::packet::ip::IpNextHeaderProtocol,
    total_len: usize,
) {
    let mut ip = MutableIpv4Packet::new(buf).expect("buffer sized for IPv4 header");
    ip.set_version(4);
    ip.set_header_length(5);
    ip.set_total_length(total_len as u16);
    ip.set_ttl(64);
    ip.set_next_level_protocol(protocol);
    ip.set_source(src_ip);
    ip.set_destination(dst_ip);
    ip.set_identification(OsRng.gen());
    let checksum = ipv4::checksum(&ip.to_immutable());
    ip.set_checksum(checksum);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::tcp::TcpFlags;

    const LOCAL_MAC: MacAddr = MacAddr(0x02, 0, 0, 0, 0, 0x01);
    const ROUTER_MAC: MacAddr = MacAddr(0x02, 0, 0, 0, 0, 0x02);

    #[test]
    fn test_tcp_segment_roundtrip() {
        let local = Ipv4Addr::new(192, 168, 1, 10);
        let remote = Ipv4Addr::new(203, 0, 113, 5);
        let frame = build_tcp_segment(
            LOCAL_MAC,
            ROUTER_MAC,
            remote,
            local,
            443,
            50000,
            1000,
            2000,
            TcpFlags::PSH | TcpFlags::ACK,
            b"payload bytes",
        );

        let parsed = parse_frame(&frame, local).expect("frame parses");
        let RawPacket::Tcp(seg) = parsed else {
            panic!("expected TCP");
        };
        assert_eq!(seg.src_ip, remote);
        assert_eq!(seg.src_port, 443);
        assert_eq!(seg.dst_port, 50000);
        assert_eq!(seg.seq, 1000);
        assert_eq!(seg.flags & TcpFlags::PSH, TcpFlags::PSH);
        assert_eq!(seg.payload, &b"payload bytes"[..]);
    }

    #[test]
    fn test_udp_datagram_roundtrip() {
        let local = Ipv4Addr::new(10, 0, 0, 2);
        let remote = Ipv4Addr::new(10, 0, 0, 9);
        let frame = build_udp_datagram(
            LOCAL_MAC,
            ROUTER_MAC,
            remote,
            local,
            4500,
            4000,
            b"datagram",
        );

        let parsed = parse_frame(&frame, local).expect("frame parses");
        let RawPacket::Udp(dgram) = parsed else {
            panic!("expected UDP");
        };
        assert_eq!(dgram.src_ip, remote);
        assert_eq!(dgram.src_port, 4500);
        assert_eq!(dgram.dst_port, 4000);
        assert_eq!(dgram.payload, &b"datagram"[..]);
    }

    #[test]
    fn test_frames_for_other_hosts_ignored() {
        let local = Ipv4Addr::new(10, 0, 0, 2);
        let other = Ipv4Addr::new(10, 0, 0, 3);
        let frame = build_udp_datagram(LOCAL_MAC, ROUTER_MAC, local, other, 1, 2, b"x");
        assert!(parse_frame(&frame, local).is_none());
    }
}
