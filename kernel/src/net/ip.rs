//! IPv4: header construction and parsing, routing, protocol dispatch.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, Ordering};

use super::{
    checksum,
    ethernet::{EthernetHeader, ETHERTYPE_IPV4},
    Ipv4Address, NetDevice,
};
use crate::error::{KernelError, KernelResult, NetError};

/// Protocol numbers carried in the IPv4 header.
pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Datagram identification counter.
static NEXT_ID: AtomicU16 = AtomicU16::new(0);

/// An IPv4 header (no options).
#[derive(Debug, Clone)]
pub struct Ipv4Header {
    pub version: u8,
    pub ihl: u8,
    pub tos: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags: u8,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source: Ipv4Address,
    pub destination: Ipv4Address,
}

impl Ipv4Header {
    pub const MIN_SIZE: usize = 20;

    pub fn new(src: Ipv4Address, dst: Ipv4Address, protocol: u8) -> Self {
        Self {
            version: 4,
            ihl: 5,
            tos: 0,
            total_length: 0,
            identification: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            flags: 0,
            fragment_offset: 0,
            ttl: 64,
            protocol,
            checksum: 0,
            source: src,
            destination: dst,
        }
    }

    pub fn to_bytes(&self) -> [u8; 20] {
        let mut b = [0u8; 20];
        b[0] = (self.version << 4) | self.ihl;
        b[1] = self.tos;
        b[2..4].copy_from_slice(&self.total_length.to_be_bytes());
        b[4..6].copy_from_slice(&self.identification.to_be_bytes());
        b[6] = (self.flags << 5) | ((self.fragment_offset >> 8) as u8);
        b[7] = (self.fragment_offset & 0xFF) as u8;
        b[8] = self.ttl;
        b[9] = self.protocol;
        b[10..12].copy_from_slice(&self.checksum.to_be_bytes());
        b[12..16].copy_from_slice(&self.source.0);
        b[16..20].copy_from_slice(&self.destination.0);
        b
    }

    pub fn from_bytes(b: &[u8]) -> KernelResult<Self> {
        if b.len() < Self::MIN_SIZE {
            return Err(KernelError::NetError(NetError::Malformed));
        }
        let version = b[0] >> 4;
        if version != 4 {
            return Err(KernelError::NetError(NetError::Malformed));
        }
        Ok(Self {
            version,
            ihl: b[0] & 0x0F,
            tos: b[1],
            total_length: u16::from_be_bytes([b[2], b[3]]),
            identification: u16::from_be_bytes([b[4], b[5]]),
            flags: b[6] >> 5,
            fragment_offset: u16::from_be_bytes([b[6] & 0x1F, b[7]]),
            ttl: b[8],
            protocol: b[9],
            checksum: u16::from_be_bytes([b[10], b[11]]),
            source: Ipv4Address([b[12], b[13], b[14], b[15]]),
            destination: Ipv4Address([b[16], b[17], b[18], b[19]]),
        })
    }

    /// Fill in the header checksum.
    pub fn finalize_checksum(&mut self) {
        self.checksum = 0;
        self.checksum = checksum(&self.to_bytes());
    }
}

/// Where a datagram to `dst` is physically sent: directly when the
/// destination shares our subnet, via the gateway otherwise.
pub fn next_hop(dst: Ipv4Address, dev: &NetDevice) -> Ipv4Address {
    let mask = dev.subnet_mask.to_u32();
    if (dst.to_u32() & mask) == (dev.ip.to_u32() & mask) {
        dst
    } else {
        dev.gateway
    }
}

/// Send one datagram. The next hop is ARP-resolved; on a cache miss a
/// request goes out and the datagram is dropped (the transport's
/// retransmission covers the gap).
pub fn send(dst: Ipv4Address, protocol: u8, payload: &[u8]) {
    let Some(dev) = super::device() else { return };

    let mut header = Ipv4Header::new(dev.ip, dst, protocol);
    header.total_length = (Ipv4Header::MIN_SIZE + payload.len()) as u16;
    header.finalize_checksum();

    let hop = next_hop(dst, &dev);
    let dst_mac = if dst == Ipv4Address::BROADCAST {
        Some(super::MacAddress::BROADCAST)
    } else {
        super::arp::lookup(hop)
    };
    let Some(dst_mac) = dst_mac else {
        super::arp::request(hop);
        return;
    };

    let eth = EthernetHeader {
        dst: dst_mac,
        src: dev.mac,
        ethertype: ETHERTYPE_IPV4,
    };
    let mut frame =
        Vec::with_capacity(EthernetHeader::SIZE + Ipv4Header::MIN_SIZE + payload.len());
    frame.extend_from_slice(&eth.to_bytes());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(payload);
    (dev.transmit)(&frame);
}

/// Handle one inbound datagram: validate, then dispatch by protocol
/// with the source address riding along. Anything malformed, misdirected
/// or corrupt is silently dropped.
pub fn rx(packet: &[u8]) {
    let Ok(header) = Ipv4Header::from_bytes(packet) else {
        return;
    };

    let ihl_bytes = header.ihl as usize * 4;
    let total = header.total_length as usize;
    if ihl_bytes < Ipv4Header::MIN_SIZE
        || total < ihl_bytes
        || ihl_bytes > packet.len()
        || packet.len() < total
    {
        return;
    }

    // Verify the header checksum: re-summing a valid header gives zero.
    if checksum(&packet[..ihl_bytes]) != 0 {
        return;
    }

    if let Some(dev) = super::device() {
        if header.destination != dev.ip && header.destination != Ipv4Address::BROADCAST {
            return;
        }
    }

    let payload = &packet[ihl_bytes..total];
    match header.protocol {
        PROTO_ICMP => super::icmp::rx(header.source, payload),
        PROTO_TCP => super::tcp::rx(header.source, header.destination, payload),
        PROTO_UDP => super::udp::rx(header.source, header.destination, payload),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let src = Ipv4Address::new(10, 0, 0, 1);
        let dst = Ipv4Address::new(10, 0, 0, 2);
        let mut header = Ipv4Header::new(src, dst, PROTO_TCP);
        header.total_length = 40;
        header.finalize_checksum();

        let parsed = Ipv4Header::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed.source, src);
        assert_eq!(parsed.destination, dst);
        assert_eq!(parsed.protocol, PROTO_TCP);
        assert_eq!(parsed.ttl, 64);
        // A valid header re-sums to zero.
        assert_eq!(checksum(&header.to_bytes()), 0);
    }

    #[test]
    fn test_non_ipv4_rejected() {
        let mut bytes = Ipv4Header::new(Ipv4Address::ANY, Ipv4Address::ANY, PROTO_UDP).to_bytes();
        bytes[0] = 0x65; // version 6
        assert!(Ipv4Header::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_next_hop_routing() {
        let dev = NetDevice {
            mac: super::super::MacAddress::ZERO,
            ip: Ipv4Address::new(192, 168, 0, 10),
            gateway: Ipv4Address::new(192, 168, 0, 1),
            subnet_mask: Ipv4Address::new(255, 255, 255, 0),
            transmit: |_| true,
        };
        // On-link destination goes direct.
        assert_eq!(
            next_hop(Ipv4Address::new(192, 168, 0, 77), &dev),
            Ipv4Address::new(192, 168, 0, 77)
        );
        // Off-link goes through the gateway.
        assert_eq!(
            next_hop(Ipv4Address::new(8, 8, 8, 8), &dev),
            Ipv4Address::new(192, 168, 0, 1)
        );
    }
}
