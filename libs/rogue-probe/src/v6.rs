//! Solicit to all relay agents and servers, Advertise replies collected
use std::{
    io,
    net::{IpAddr, Ipv6Addr, SocketAddrV6},
    time::Duration,
};

use ipam_core::{
    dhcproto::{Decodable, Decoder, Encodable, v6},
    pnet::datalink::MacAddr,
    tokio::{self, net::UdpSocket, time},
    tokio_util::sync::CancellationToken,
};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

use crate::{DhcpServer, error::Result, interfaces::Selected};

/// ff02::1:2
pub(crate) const ALL_DHCP_RELAY_AGENTS_AND_SERVERS: Ipv6Addr =
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);
const RELAY_REPL: u8 = 13;
const DUID_LLT: u16 = 1;
const DUID_LL: u16 = 3;
const HW_ETHERNET: u16 = 1;

/// Send one Solicit from `src` and collect every server that advertises
/// before `timeout` or `cancel`.
pub(crate) async fn probe(
    src: Selected<Ipv6Addr>,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<Vec<DhcpServer>> {
    let scope = if src.addr.is_unicast_link_local() {
        src.iface.index
    } else {
        0
    };
    let socket = bind(&src, scope)?;

    let xid = rand::random::<[u8; 3]>();
    let msg = build_solicit(xid, src.iface.mac.unwrap_or_else(MacAddr::zero));
    let target = SocketAddrV6::new(
        ALL_DHCP_RELAY_AGENTS_AND_SERVERS,
        v6::SERVER_PORT,
        0,
        src.iface.index,
    );
    socket.send_to(&msg.to_vec()?, target).await?;
    debug!(iface = %src.iface.name, src = %src.addr, ?xid, "sent Solicit");

    let deadline = time::Instant::now() + timeout;
    let mut buf = vec![0u8; 4096];
    let mut found = Vec::new();
    loop {
        let res = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(found = found.len(), "v6 scan cancelled");
                break;
            }
            res = time::timeout_at(deadline, socket.recv_from(&mut buf)) => res,
        };
        match res {
            Err(_elapsed) => break,
            Ok(Ok((len, from))) => {
                if let Some(server) = parse_reply(&buf[..len], from.ip(), xid) {
                    debug!(address = %server.address, mac = ?server.mac, "dhcp server answered");
                    found.push(server);
                }
            }
            Ok(Err(err)) => {
                warn!(?err, "recv failed, ending v6 scan early");
                break;
            }
        }
    }
    Ok(found)
}

fn bind(src: &Selected<Ipv6Addr>, scope: u32) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind_device(Some(src.iface.name.as_bytes()))?;
    socket.set_multicast_if_v6(src.iface.index)?;
    socket.bind(&SocketAddrV6::new(src.addr, v6::CLIENT_PORT, 0, scope).into())?;
    UdpSocket::from_std(socket.into())
}

/// DUID-LL built from the interface hardware address
pub(crate) fn duid_ll(mac: MacAddr) -> Vec<u8> {
    let mut duid = Vec::with_capacity(10);
    duid.extend_from_slice(&DUID_LL.to_be_bytes());
    duid.extend_from_slice(&HW_ETHERNET.to_be_bytes());
    duid.extend_from_slice(&[mac.0, mac.1, mac.2, mac.3, mac.4, mac.5]);
    duid
}

pub(crate) fn build_solicit(xid: [u8; 3], mac: MacAddr) -> v6::Message {
    let mut msg = v6::Message::new_with_id(v6::MessageType::Solicit, xid);
    msg.opts_mut().insert(v6::DhcpOption::ClientId(duid_ll(mac)));
    msg.opts_mut().insert(v6::DhcpOption::ElapsedTime(0));
    msg.opts_mut().insert(v6::DhcpOption::IANA(v6::IANA {
        id: u32::from_be_bytes([0, xid[0], xid[1], xid[2]]),
        t1: 0,
        t2: 0,
        opts: v6::DhcpOptions::new(),
    }));
    msg
}

/// an Advertise for `xid`, possibly relayed, with a server id
pub(crate) fn parse_reply(buf: &[u8], from: IpAddr, xid: [u8; 3]) -> Option<DhcpServer> {
    let msg = unwrap_relay(buf)?;
    trace!(?msg, %from, "decoded v6 reply");
    if msg.xid() != xid || msg.msg_type() != v6::MessageType::Advertise {
        return None;
    }
    match msg.opts().get(v6::OptionCode::ServerId) {
        Some(v6::DhcpOption::ServerId(duid)) => Some(DhcpServer {
            address: from,
            mac: mac_from_duid(duid),
        }),
        _ => None,
    }
}

fn unwrap_relay(buf: &[u8]) -> Option<v6::Message> {
    if buf.first() != Some(&RELAY_REPL) {
        return v6::Message::decode(&mut Decoder::new(buf)).ok();
    }
    let mut relay = v6::RelayMessage::decode(&mut Decoder::new(buf)).ok()?;
    loop {
        match relay.opts().get(v6::OptionCode::RelayMsg)? {
            v6::DhcpOption::RelayMsg(v6::RelayMessageData::Message(msg)) => {
                return Some(msg.clone());
            }
            v6::DhcpOption::RelayMsg(v6::RelayMessageData::Relay(inner)) => {
                relay = inner.clone();
            }
            _ => return None,
        }
    }
}

/// link-layer address of a DUID-LLT or DUID-LL on ethernet
pub(crate) fn mac_from_duid(duid: &[u8]) -> Option<MacAddr> {
    let kind = u16::from_be_bytes([*duid.first()?, *duid.get(1)?]);
    let hw = u16::from_be_bytes([*duid.get(2)?, *duid.get(3)?]);
    if hw != HW_ETHERNET {
        return None;
    }
    let start = match kind {
        DUID_LLT => 8,
        DUID_LL => 4,
        _ => return None,
    };
    match duid.get(start..start + 6)? {
        &[a, b, c, d, e, f] => Some(MacAddr(a, b, c, d, e, f)),
        _ => None,
    }
}
