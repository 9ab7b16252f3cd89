//! UDP: datagram framing and a bound-port delivery table.

use alloc::vec::Vec;

use super::Ipv4Address;
use crate::{
    error::{KernelError, KernelResult, NetError},
    sync::SpinLock,
};

/// Ports that can be bound concurrently.
const MAX_BOUND_PORTS: usize = 16;

/// Datagram delivery callback: source address, source port, payload.
pub type UdpHandler = fn(src: Ipv4Address, src_port: u16, payload: &[u8]);

/// A UDP header.
#[derive(Debug, Clone, Copy)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub const SIZE: usize = 8;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        b[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        b[4..6].copy_from_slice(&self.length.to_be_bytes());
        b[6..8].copy_from_slice(&self.checksum.to_be_bytes());
        b
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            src_port: u16::from_be_bytes([b[0], b[1]]),
            dst_port: u16::from_be_bytes([b[2], b[3]]),
            length: u16::from_be_bytes([b[4], b[5]]),
            checksum: u16::from_be_bytes([b[6], b[7]]),
        })
    }
}

static BOUND: SpinLock<[Option<(u16, UdpHandler)>; MAX_BOUND_PORTS]> =
    SpinLock::new([None; MAX_BOUND_PORTS]);

/// Bind a delivery handler to a local port.
pub fn bind(port: u16, handler: UdpHandler) -> KernelResult<()> {
    let mut table = BOUND.lock();
    if table.iter().flatten().any(|(p, _)| *p == port) {
        return Err(KernelError::NetError(NetError::PortInUse { port }));
    }
    let Some(slot) = table.iter().position(|e| e.is_none()) else {
        return Err(KernelError::ResourceExhausted {
            resource: "UDP port table",
        });
    };
    table[slot] = Some((port, handler));
    Ok(())
}

/// Release a bound port.
pub fn unbind(port: u16) {
    let mut table = BOUND.lock();
    for entry in table.iter_mut() {
        if entry.map(|(p, _)| p == port).unwrap_or(false) {
            *entry = None;
        }
    }
}

/// Send one datagram. The checksum is left zero (legal for IPv4).
pub fn tx(dst: Ipv4Address, dst_port: u16, src_port: u16, payload: &[u8]) {
    let header = UdpHeader {
        src_port,
        dst_port,
        length: (UdpHeader::SIZE + payload.len()) as u16,
        checksum: 0,
    };
    let mut datagram = Vec::with_capacity(UdpHeader::SIZE + payload.len());
    datagram.extend_from_slice(&header.to_bytes());
    datagram.extend_from_slice(payload);
    super::ip::send(dst, super::ip::PROTO_UDP, &datagram);
}

/// Deliver one inbound datagram to its bound port, if any.
pub fn rx(src: Ipv4Address, _dst: Ipv4Address, datagram: &[u8]) {
    let Some(header) = UdpHeader::from_bytes(datagram) else {
        return;
    };
    if (header.length as usize) < UdpHeader::SIZE || datagram.len() < header.length as usize {
        return;
    }
    let payload = &datagram[UdpHeader::SIZE..header.length as usize];

    let handler = BOUND
        .lock()
        .iter()
        .flatten()
        .find(|(p, _)| *p == header.dst_port)
        .map(|(_, h)| *h);
    if let Some(handler) = handler {
        handler(src, header.src_port, payload);
    }
}
