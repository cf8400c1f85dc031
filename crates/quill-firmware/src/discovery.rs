//! mDNS hostname discovery.
//!
//! The desktop sync tool finds the device as `quill.local` without knowing
//! its DHCP address. This is a deliberately small responder: it answers A
//! queries for exactly our hostname and ignores everything else on the
//! multicast group. Only active while the engine is serving.

use core::net::Ipv4Addr;
use core::sync::atomic::Ordering;

use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{IpEndpoint, Stack};
use log::{debug, info, warn};

use quill_core::config::HOSTNAME;

use crate::radio::DISCOVERY_ENABLED;

const MDNS_PORT: u16 = 5353;
const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const MDNS_TTL: u32 = 120;

const QTYPE_A: u16 = 1;
const QTYPE_ANY: u16 = 255;

#[embassy_executor::task]
pub async fn discovery_task(stack: Stack<'static>) {
    let mut rx_meta = [PacketMetadata::EMPTY; 4];
    let mut tx_meta = [PacketMetadata::EMPTY; 4];
    let mut rx_buffer = [0u8; 1024];
    let mut tx_buffer = [0u8; 512];
    let mut packet = [0u8; 1024];

    if let Err(e) = stack.join_multicast_group(MDNS_GROUP) {
        warn!("could not join mDNS group: {e:?}");
        return;
    }

    let mut socket = UdpSocket::new(
        stack,
        &mut rx_meta,
        &mut rx_buffer,
        &mut tx_meta,
        &mut tx_buffer,
    );
    if let Err(e) = socket.bind(MDNS_PORT) {
        warn!("could not bind mDNS port: {e:?}");
        return;
    }
    info!("answering for {HOSTNAME}.local");

    loop {
        let (len, _meta) = match socket.recv_from(&mut packet).await {
            Ok(received) => received,
            Err(e) => {
                debug!("mDNS receive error: {e:?}");
                continue;
            }
        };
        if !DISCOVERY_ENABLED.load(Ordering::Relaxed) {
            continue;
        }
        let Some(ip) = stack.config_v4().map(|c| c.address.address()) else {
            continue;
        };
        if !wants_our_name(&packet[..len]) {
            continue;
        }

        let mut response = [0u8; 128];
        let len = build_answer(&mut response, ip);
        let endpoint = IpEndpoint::new(MDNS_GROUP.into(), MDNS_PORT);
        if let Err(e) = socket.send_to(&response[..len], endpoint).await {
            debug!("mDNS send error: {e:?}");
        }
    }
}

/// True if the packet is a query whose first question is an A (or ANY)
/// lookup of our hostname.
fn wants_our_name(packet: &[u8]) -> bool {
    matches_query(packet).unwrap_or(false)
}

fn matches_query(packet: &[u8]) -> Option<bool> {
    if packet.len() < 12 {
        return Some(false);
    }
    // QR bit set means this is someone else's response.
    if packet[2] & 0x80 != 0 {
        return Some(false);
    }
    let questions = u16::from_be_bytes([packet[4], packet[5]]);
    if questions == 0 {
        return Some(false);
    }

    let mut pos = 12;
    for expected in [HOSTNAME, "local"] {
        let len = *packet.get(pos)? as usize;
        let label = packet.get(pos + 1..pos + 1 + len)?;
        if !label.eq_ignore_ascii_case(expected.as_bytes()) {
            return Some(false);
        }
        pos += 1 + len;
    }
    if *packet.get(pos)? != 0 {
        return Some(false);
    }
    pos += 1;

    let qtype = u16::from_be_bytes([*packet.get(pos)?, *packet.get(pos + 1)?]);
    let qclass = u16::from_be_bytes([*packet.get(pos + 2)?, *packet.get(pos + 3)?]);
    Some((qtype == QTYPE_A || qtype == QTYPE_ANY) && qclass & 0x7fff == 1)
}

/// One authoritative answer record: `<hostname>.local A <ip>`, cache-flush
/// bit set, zero questions echoed.
fn build_answer(buf: &mut [u8], ip: Ipv4Addr) -> usize {
    let mut pos = 0;
    let mut put = |bytes: &[u8]| {
        buf[pos..pos + bytes.len()].copy_from_slice(bytes);
        pos += bytes.len();
    };

    put(&[0, 0]); // ID zero for multicast responses
    put(&[0x84, 0x00]); // authoritative response
    put(&[0, 0]); // no questions
    put(&[0, 1]); // one answer
    put(&[0, 0, 0, 0]); // no authority, no additional

    put(&[HOSTNAME.len() as u8]);
    put(HOSTNAME.as_bytes());
    put(&[5]);
    put(b"local");
    put(&[0]);

    put(&QTYPE_A.to_be_bytes());
    put(&[0x80, 0x01]); // IN, cache-flush
    put(&MDNS_TTL.to_be_bytes());
    put(&[0, 4]);
    put(&ip.octets());

    pos
}
