//! ARP: IPv4-over-ethernet address resolution.
//!
//! A fixed-size cache maps IPv4 addresses to MACs. Misses trigger a
//! broadcast request; the packet that provoked the lookup is dropped
//! rather than queued (the next retransmission finds the cache warm).

use alloc::vec::Vec;

use super::{
    ethernet::{EthernetHeader, ETHERTYPE_ARP, ETHERTYPE_IPV4},
    Ipv4Address, MacAddress,
};
use crate::sync::SpinLock;

/// Cache capacity; replacement is round-robin through the slots.
const ARP_CACHE_SIZE: usize = 32;

/// ARP operation: request.
pub const ARP_OP_REQUEST: u16 = 1;
/// ARP operation: reply.
pub const ARP_OP_REPLY: u16 = 2;

/// An ARP packet for IPv4 over ethernet (28 bytes on the wire).
#[derive(Debug, Clone, Copy)]
pub struct ArpPacket {
    pub operation: u16,
    pub sender_mac: MacAddress,
    pub sender_ip: Ipv4Address,
    pub target_mac: MacAddress,
    pub target_ip: Ipv4Address,
}

impl ArpPacket {
    pub const SIZE: usize = 28;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..2].copy_from_slice(&1u16.to_be_bytes()); // ethernet
        b[2..4].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        b[4] = 6; // hardware address length
        b[5] = 4; // protocol address length
        b[6..8].copy_from_slice(&self.operation.to_be_bytes());
        b[8..14].copy_from_slice(&self.sender_mac.0);
        b[14..18].copy_from_slice(&self.sender_ip.0);
        b[18..24].copy_from_slice(&self.target_mac.0);
        b[24..28].copy_from_slice(&self.target_ip.0);
        b
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < Self::SIZE {
            return None;
        }
        // Only ethernet/IPv4 resolution is understood.
        if u16::from_be_bytes([b[0], b[1]]) != 1
            || u16::from_be_bytes([b[2], b[3]]) != ETHERTYPE_IPV4
            || b[4] != 6
            || b[5] != 4
        {
            return None;
        }
        Some(Self {
            operation: u16::from_be_bytes([b[6], b[7]]),
            sender_mac: MacAddress([b[8], b[9], b[10], b[11], b[12], b[13]]),
            sender_ip: Ipv4Address([b[14], b[15], b[16], b[17]]),
            target_mac: MacAddress([b[18], b[19], b[20], b[21], b[22], b[23]]),
            target_ip: Ipv4Address([b[24], b[25], b[26], b[27]]),
        })
    }
}

struct ArpCache {
    entries: [Option<(Ipv4Address, MacAddress)>; ARP_CACHE_SIZE],
    next_victim: usize,
}

impl ArpCache {
    const fn new() -> Self {
        Self {
            entries: [None; ARP_CACHE_SIZE],
            next_victim: 0,
        }
    }

    fn lookup(&self, ip: Ipv4Address) -> Option<MacAddress> {
        self.entries
            .iter()
            .flatten()
            .find(|(cached, _)| *cached == ip)
            .map(|(_, mac)| *mac)
    }

    fn insert(&mut self, ip: Ipv4Address, mac: MacAddress) {
        // Refresh an existing mapping in place.
        for entry in self.entries.iter_mut().flatten() {
            if entry.0 == ip {
                entry.1 = mac;
                return;
            }
        }
        // Else take a free slot, or evict round-robin.
        let slot = self
            .entries
            .iter()
            .position(|e| e.is_none())
            .unwrap_or_else(|| {
                let victim = self.next_victim;
                self.next_victim = (self.next_victim + 1) % ARP_CACHE_SIZE;
                victim
            });
        self.entries[slot] = Some((ip, mac));
    }
}

static CACHE: SpinLock<ArpCache> = SpinLock::new(ArpCache::new());

/// Resolve an IPv4 address from the cache.
pub fn lookup(ip: Ipv4Address) -> Option<MacAddress> {
    CACHE.lock().lookup(ip)
}

/// Learn (or refresh) a mapping.
pub fn insert(ip: Ipv4Address, mac: MacAddress) {
    CACHE.lock().insert(ip, mac);
}

/// Broadcast a who-has request for `ip`.
pub fn request(ip: Ipv4Address) {
    let Some(dev) = super::device() else { return };
    let packet = ArpPacket {
        operation: ARP_OP_REQUEST,
        sender_mac: dev.mac,
        sender_ip: dev.ip,
        target_mac: MacAddress::ZERO,
        target_ip: ip,
    };
    transmit(&dev, MacAddress::BROADCAST, &packet);
}

/// Handle one inbound ARP packet: learn the sender, answer requests for
/// our address.
pub fn rx(payload: &[u8]) {
    let Some(packet) = ArpPacket::from_bytes(payload) else {
        return;
    };
    insert(packet.sender_ip, packet.sender_mac);

    let Some(dev) = super::device() else { return };
    if packet.operation == ARP_OP_REQUEST && packet.target_ip == dev.ip {
        let reply = ArpPacket {
            operation: ARP_OP_REPLY,
            sender_mac: dev.mac,
            sender_ip: dev.ip,
            target_mac: packet.sender_mac,
            target_ip: packet.sender_ip,
        };
        transmit(&dev, packet.sender_mac, &reply);
    }
}

fn transmit(dev: &super::NetDevice, dst: MacAddress, packet: &ArpPacket) {
    let eth = EthernetHeader {
        dst,
        src: dev.mac,
        ethertype: ETHERTYPE_ARP,
    };
    let mut frame = Vec::with_capacity(EthernetHeader::SIZE + ArpPacket::SIZE);
    frame.extend_from_slice(&eth.to_bytes());
    frame.extend_from_slice(&packet.to_bytes());
    (dev.transmit)(&frame);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_round_trip() {
        let packet = ArpPacket {
            operation: ARP_OP_REPLY,
            sender_mac: MacAddress::new([1, 2, 3, 4, 5, 6]),
            sender_ip: Ipv4Address::new(10, 0, 0, 1),
            target_mac: MacAddress::new([7, 8, 9, 10, 11, 12]),
            target_ip: Ipv4Address::new(10, 0, 0, 2),
        };
        let parsed = ArpPacket::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(parsed.operation, ARP_OP_REPLY);
        assert_eq!(parsed.sender_ip, Ipv4Address::new(10, 0, 0, 1));
        assert_eq!(parsed.target_mac.0[0], 7);
    }

    #[test]
    fn test_non_ethernet_ipv4_rejected() {
        let packet = ArpPacket {
            operation: ARP_OP_REQUEST,
            sender_mac: MacAddress::ZERO,
            sender_ip: Ipv4Address::ANY,
            target_mac: MacAddress::ZERO,
            target_ip: Ipv4Address::ANY,
        };
        let mut bytes = packet.to_bytes();
        bytes[1] = 9; // unknown hardware type
        assert!(ArpPacket::from_bytes(&bytes).is_none());
    }

    #[test]
    fn test_cache_insert_lookup_refresh() {
        let mut cache = ArpCache::new();
        let ip = Ipv4Address::new(192, 168, 1, 7);
        assert!(cache.lookup(ip).is_none());

        cache.insert(ip, MacAddress::new([1, 1, 1, 1, 1, 1]));
        assert_eq!(cache.lookup(ip).unwrap().0[0], 1);

        // Refresh replaces in place rather than duplicating.
        cache.insert(ip, MacAddress::new([2, 2, 2, 2, 2, 2]));
        assert_eq!(cache.lookup(ip).unwrap().0[0], 2);
        let live = cache.entries.iter().flatten().count();
        assert_eq!(live, 1);
    }

    #[test]
    fn test_cache_evicts_round_robin_when_full() {
        let mut cache = ArpCache::new();
        for i in 0..ARP_CACHE_SIZE as u8 {
            cache.insert(Ipv4Address::new(10, 0, 0, i), MacAddress::new([i; 6]));
        }
        cache.insert(Ipv4Address::new(10, 0, 1, 1), MacAddress::new([0xEE; 6]));
        // Slot 0's original occupant made way.
        assert!(cache.lookup(Ipv4Address::new(10, 0, 0, 0)).is_none());
        assert!(cache.lookup(Ipv4Address::new(10, 0, 1, 1)).is_some());
    }
}
