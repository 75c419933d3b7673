//! DHCPDISCOVER out of a raw socket, replies read off the link layer
use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddrV4},
    time::{Duration, Instant},
};

use ipam_core::{
    dhcproto::{Decodable, Decoder, Encodable, v4},
    pnet::{
        datalink::{self, Channel, DataLinkReceiver, MacAddr, NetworkInterface},
        packet::{
            Packet,
            ethernet::{EtherTypes, EthernetPacket},
            ip::IpNextHeaderProtocols,
            ipv4::{self, Ipv4Packet, MutableIpv4Packet},
            udp::{self, MutableUdpPacket, UdpPacket},
        },
    },
    tokio::task,
    tokio_util::sync::CancellationToken,
};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, trace, warn};

use crate::{
    DhcpServer,
    error::{ProbeError, Result},
    interfaces::Selected,
};

const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const IPPROTO_RAW: i32 = 255;
/// how long a single datalink read blocks before the deadline is checked again
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Broadcast one DISCOVER from `src` and collect every server that offers
/// before `timeout`. The datalink loop blocks, so it runs off the runtime;
/// it stops within one read timeout of `cancel` and the socket and channel
/// are closed before this returns.
pub(crate) async fn probe(
    src: Selected<Ipv4Addr>,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<Vec<DhcpServer>> {
    task::spawn_blocking(move || probe_blocking(&src, timeout, &cancel))
        .await
        .map_err(io::Error::other)?
}

fn probe_blocking(
    src: &Selected<Ipv4Addr>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<DhcpServer>> {
    // listen before sending so no offer is missed
    let mut rx = open_channel(&src.iface)?;
    let socket = raw_socket(&src.iface.name)?;

    let xid = rand::random::<u32>();
    let mac = src.iface.mac.unwrap_or_else(MacAddr::zero);
    let payload = build_discover(xid, mac).to_vec()?;
    let datagram = build_datagram(src.addr, &payload).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "discover does not fit a datagram")
    })?;
    let target = SockAddr::from(SocketAddrV4::new(Ipv4Addr::BROADCAST, v4::SERVER_PORT));
    socket.send_to(&datagram, &target)?;
    debug!(iface = %src.iface.name, src = %src.addr, xid, "sent DHCPDISCOVER");

    Ok(collect(rx.as_mut(), xid, Instant::now() + timeout, cancel))
}

fn open_channel(iface: &NetworkInterface) -> Result<Box<dyn DataLinkReceiver>> {
    let cfg = datalink::Config {
        read_timeout: Some(READ_TIMEOUT),
        ..Default::default()
    };
    match datalink::channel(iface, cfg) {
        Ok(Channel::Ethernet(_tx, rx)) => Ok(rx),
        Ok(_) => Err(ProbeError::Datalink {
            iface: iface.name.clone(),
            reason: "not an ethernet channel".into(),
        }),
        Err(err) => Err(ProbeError::Datalink {
            iface: iface.name.clone(),
            reason: err.to_string(),
        }),
    }
}

/// raw IPv4 socket bound to `device`, we write the IP header ourselves
fn raw_socket(device: &str) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(IPPROTO_RAW)))?;
    socket.bind_device(Some(device.as_bytes()))?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

pub(crate) fn build_discover(xid: u32, mac: MacAddr) -> v4::Message {
    let chaddr = [mac.0, mac.1, mac.2, mac.3, mac.4, mac.5];
    let mut msg = v4::Message::new_with_id(
        xid,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        &chaddr,
    );
    msg.set_flags(v4::Flags::default().set_broadcast());
    msg.opts_mut()
        .insert(v4::DhcpOption::MessageType(v4::MessageType::Discover));
    msg.opts_mut()
        .insert(v4::DhcpOption::ClientIdentifier(chaddr.to_vec()));
    msg.opts_mut()
        .insert(v4::DhcpOption::ParameterRequestList(vec![
            v4::OptionCode::SubnetMask,
            v4::OptionCode::Router,
            v4::OptionCode::ServerIdentifier,
        ]));
    msg
}

/// IPv4 + UDP headers around `payload`, client port to server port.
/// `None` if it can't fit in one datagram
pub(crate) fn build_datagram(src: Ipv4Addr, payload: &[u8]) -> Option<Vec<u8>> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total = u16::try_from(IPV4_HEADER_LEN + udp_len).ok()?;
    let mut buf = vec![0u8; total as usize];
    {
        let mut udp = MutableUdpPacket::new(&mut buf[IPV4_HEADER_LEN..])?;
        udp.set_source(v4::CLIENT_PORT);
        udp.set_destination(v4::SERVER_PORT);
        udp.set_length(udp_len as u16);
        udp.set_payload(payload);
        let sum = udp::ipv4_checksum(&udp.to_immutable(), &src, &Ipv4Addr::BROADCAST);
        udp.set_checksum(sum);
    }
    {
        let mut ip = MutableIpv4Packet::new(&mut buf[..])?;
        ip.set_version(4);
        ip.set_header_length((IPV4_HEADER_LEN / 4) as u8);
        ip.set_total_length(total);
        ip.set_ttl(64);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        ip.set_source(src);
        ip.set_destination(Ipv4Addr::BROADCAST);
        let sum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(sum);
    }
    Some(buf)
}

/// read frames until `deadline` or `cancel`, keeping every offer for `xid`
pub(crate) fn collect(
    rx: &mut dyn DataLinkReceiver,
    xid: u32,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Vec<DhcpServer> {
    let mut found = Vec::new();
    while Instant::now() < deadline {
        if cancel.is_cancelled() {
            debug!(found = found.len(), "v4 scan cancelled");
            break;
        }
        match rx.next() {
            Ok(frame) => {
                if let Some(server) = parse_frame(frame, xid) {
                    debug!(address = %server.address, mac = ?server.mac, "dhcp server answered");
                    found.push(server);
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(err) => {
                warn!(?err, "datalink read failed, ending v4 scan early");
                break;
            }
        }
    }
    found
}

/// a BOOTREPLY for `xid` carrying a server identifier, else `None`
pub(crate) fn parse_frame(frame: &[u8], xid: u32) -> Option<DhcpServer> {
    let eth = EthernetPacket::new(frame)?;
    if eth.get_ethertype() != EtherTypes::Ipv4 {
        return None;
    }
    let ip = Ipv4Packet::new(eth.payload())?;
    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
        return None;
    }
    let udp = UdpPacket::new(ip.payload())?;
    if udp.get_source() != v4::SERVER_PORT {
        return None;
    }
    let msg = v4::Message::decode(&mut Decoder::new(udp.payload())).ok()?;
    trace!(?msg, "decoded v4 reply");
    if msg.opcode() != v4::Opcode::BootReply || msg.xid() != xid {
        return None;
    }
    match msg.opts().get(v4::OptionCode::ServerIdentifier) {
        Some(v4::DhcpOption::ServerIdentifier(id)) => Some(DhcpServer {
            address: IpAddr::V4(*id),
            mac: Some(eth.get_source()),
        }),
        _ => None,
    }
}
