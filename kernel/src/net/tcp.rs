//! TCP: socket table, RFC-793-flavoured state machine, byte-stream
//! receive ring.
//!
//! Sockets live in an id-keyed table behind the socket-table lock -- the
//! outermost lock in the kernel's ordering. State-machine processing
//! never transmits directly: outbound segments accumulate in a queue the
//! caller drains into the IP layer after the table lock is released, so
//! ARP and device work happen lock-free.
//!
//! Out-of-order segments are dropped (reassembly is an open extension);
//! retransmission and congestion control carry their fields
//! (`rto`/`srtt`/`rttvar`/`cwnd`/`ssthresh`/`dup_acks`) but no policy
//! yet.

use alloc::{collections::BTreeMap, vec, vec::Vec};

use bitflags::bitflags;

use crate::{
    error::{KernelError, KernelResult, NetError},
    sync::SpinLock,
};

use super::{checksum_words, Ipv4Address};

/// Receive ring capacity per socket.
pub const TCP_RX_BUF_SIZE: usize = 65536;
/// Transmit staging buffer capacity per socket.
pub const TCP_TX_BUF_SIZE: usize = 65536;
/// Maximum segment size carried in one transmit.
pub const TCP_MSS: usize = 1460;
/// TIME_WAIT lingering, in timer ticks.
pub const TIME_WAIT_TICKS: u8 = 200;
/// First ephemeral port handed to unbound active opens.
const EPHEMERAL_PORT_BASE: u16 = 49152;
/// Initial send sequence seed; each connection takes the counter and
/// advances it.
const ISS_SEED: u32 = 0x1234_5678;
/// Spacing between initial sequence numbers of successive connections.
const ISS_STRIDE: u32 = 64000;

/// TCP connection state (RFC 793 subset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// Display name, matching the classic netstat spelling.
    pub fn name(&self) -> &'static str {
        match self {
            TcpState::Closed => "CLOSED",
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynReceived => "SYN_RECV",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT1",
            TcpState::FinWait2 => "FIN_WAIT2",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::Closing => "CLOSING",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
        }
    }
}

bitflags! {
    /// TCP header flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

/// A TCP header (options are neither sent nor parsed).
#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in 32-bit words (high nibble of byte 12).
    pub data_offset: u8,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
}

impl TcpHeader {
    pub const SIZE: usize = 20;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        b[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        b[4..8].copy_from_slice(&self.seq.to_be_bytes());
        b[8..12].copy_from_slice(&self.ack.to_be_bytes());
        b[12] = self.data_offset << 4;
        b[13] = self.flags.bits();
        b[14..16].copy_from_slice(&self.window.to_be_bytes());
        b[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        b[18..20].copy_from_slice(&self.urgent.to_be_bytes());
        b
    }

    pub fn from_bytes(b: &[u8]) -> KernelResult<Self> {
        if b.len() < Self::SIZE {
            return Err(KernelError::NetError(NetError::Malformed));
        }
        Ok(Self {
            src_port: u16::from_be_bytes([b[0], b[1]]),
            dst_port: u16::from_be_bytes([b[2], b[3]]),
            seq: u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
            ack: u32::from_be_bytes([b[8], b[9], b[10], b[11]]),
            data_offset: b[12] >> 4,
            flags: TcpFlags::from_bits_truncate(b[13]),
            window: u16::from_be_bytes([b[14], b[15]]),
            checksum: u16::from_be_bytes([b[16], b[17]]),
            urgent: u16::from_be_bytes([b[18], b[19]]),
        })
    }
}

/// The pseudo-header checksum over source, destination, protocol and
/// TCP length, followed by the segment itself.
pub fn tcp_checksum(src: Ipv4Address, dst: Ipv4Address, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.0);
    pseudo[4..8].copy_from_slice(&dst.0);
    pseudo[9] = super::ip::PROTO_TCP;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());

    let mut sum = checksum_words(&pseudo, 0);
    sum = checksum_words(segment, sum);
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Handle naming a socket in the table.
pub type SocketId = u64;

/// One TCP endpoint.
pub struct Socket {
    pub id: SocketId,
    pub state: TcpState,
    pub local_addr: Ipv4Address,
    pub local_port: u16,
    pub remote_addr: Ipv4Address,
    pub remote_port: u16,

    /// Oldest unacknowledged sequence number.
    pub snd_una: u32,
    /// Next sequence number to send.
    pub snd_nxt: u32,
    /// Next sequence number expected from the peer.
    pub rcv_nxt: u32,
    /// Receive window advertised to the peer.
    pub window: u16,

    // Congestion/retransmission machinery: fields live, policy is an
    // open extension.
    pub cwnd: u32,
    pub ssthresh: u32,
    pub srtt: u32,
    pub rttvar: u32,
    pub rto: u32,
    pub dup_acks: u8,

    /// Ticks left in TIME_WAIT.
    pub time_wait_timer: u8,

    rx_buf: Vec<u8>,
    /// Transmit staging buffer; retransmission (which would consume it)
    /// is an open extension.
    pub tx_buf: Vec<u8>,
    /// Unbounded linear ring counters; `rx_tail - rx_head` never
    /// exceeds the ring capacity.
    pub rx_head: u64,
    pub rx_tail: u64,
    pub tx_head: u64,
    pub tx_tail: u64,

    /// LISTEN only: sockets spawned by inbound SYNs, awaiting accept.
    backlog: Vec<SocketId>,
}

impl Socket {
    fn new(id: SocketId) -> Self {
        Self {
            id,
            state: TcpState::Closed,
            local_addr: Ipv4Address::ANY,
            local_port: 0,
            remote_addr: Ipv4Address::ANY,
            remote_port: 0,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            window: u16::MAX,
            cwnd: (TCP_MSS * 2) as u32,
            ssthresh: 65535,
            srtt: 0,
            rttvar: 0,
            rto: 100,
            dup_acks: 0,
            time_wait_timer: 0,
            rx_buf: vec![0; TCP_RX_BUF_SIZE],
            tx_buf: vec![0; TCP_TX_BUF_SIZE],
            rx_head: 0,
            rx_tail: 0,
            tx_head: 0,
            tx_tail: 0,
            backlog: Vec::new(),
        }
    }

    /// Bytes buffered and readable.
    pub fn rx_available(&self) -> usize {
        (self.rx_tail - self.rx_head) as usize
    }

    /// Free space left in the receive ring.
    fn rx_space(&self) -> usize {
        TCP_RX_BUF_SIZE - self.rx_available()
    }

    /// Append to the receive ring, wrapping as needed. Caller has
    /// already trimmed `data` to the free space.
    fn rx_push(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= self.rx_space());
        let tail = (self.rx_tail % TCP_RX_BUF_SIZE as u64) as usize;
        let first = data.len().min(TCP_RX_BUF_SIZE - tail);
        self.rx_buf[tail..tail + first].copy_from_slice(&data[..first]);
        self.rx_buf[..data.len() - first].copy_from_slice(&data[first..]);
        self.rx_tail += data.len() as u64;
    }

    /// Drain up to `buf.len()` bytes from the receive ring.
    fn rx_pop(&mut self, buf: &mut [u8]) -> usize {
        let len = buf.len().min(self.rx_available());
        let head = (self.rx_head % TCP_RX_BUF_SIZE as u64) as usize;
        let first = len.min(TCP_RX_BUF_SIZE - head);
        buf[..first].copy_from_slice(&self.rx_buf[head..head + first]);
        buf[first..len].copy_from_slice(&self.rx_buf[..len - first]);
        self.rx_head += len as u64;
        len
    }
}

/// An assembled segment waiting to leave through the IP layer.
pub struct TcpSegment {
    pub src: Ipv4Address,
    pub dst: Ipv4Address,
    /// Header plus payload, checksummed.
    pub bytes: Vec<u8>,
}

/// The socket table and connection-wide counters.
pub struct SocketTable {
    sockets: BTreeMap<SocketId, Socket>,
    next_id: SocketId,
    next_port: u16,
    next_iss: u32,
}

impl SocketTable {
    pub const fn new() -> Self {
        Self {
            sockets: BTreeMap::new(),
            next_id: 1,
            next_port: EPHEMERAL_PORT_BASE,
            next_iss: ISS_SEED,
        }
    }

    /// Create a stream socket in CLOSED.
    pub fn create(&mut self) -> SocketId {
        let id = self.next_id;
        self.next_id += 1;
        self.sockets.insert(id, Socket::new(id));
        id
    }

    /// Borrow a socket for inspection.
    pub fn get(&self, id: SocketId) -> Option<&Socket> {
        self.sockets.get(&id)
    }

    /// Live sockets in the table.
    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    fn take_iss(&mut self) -> u32 {
        let iss = self.next_iss;
        self.next_iss = self.next_iss.wrapping_add(ISS_STRIDE);
        iss
    }

    fn port_is_free(&self, port: u16) -> bool {
        !self
            .sockets
            .values()
            .any(|s| s.local_port == port && s.state != TcpState::Closed)
    }

    fn take_ephemeral_port(&mut self) -> u16 {
        loop {
            let port = self.next_port;
            self.next_port = if self.next_port == u16::MAX {
                EPHEMERAL_PORT_BASE
            } else {
                self.next_port + 1
            };
            if self.port_is_free(port) {
                return port;
            }
        }
    }

    /// Bind a CLOSED socket to a local address and port. A port owned
    /// by another live socket is rejected.
    pub fn bind(&mut self, id: SocketId, addr: Ipv4Address, port: u16) -> KernelResult<()> {
        if port != 0 && !self.port_is_free(port) {
            return Err(KernelError::NetError(NetError::PortInUse { port }));
        }
        let sock = self.sockets.get_mut(&id).ok_or(KernelError::NetError(NetError::BadSocket))?;
        if sock.state != TcpState::Closed {
            return Err(KernelError::NetError(NetError::InvalidSocketState));
        }
        sock.local_addr = addr;
        sock.local_port = port;
        Ok(())
    }

    /// Passive open: CLOSED -> LISTEN. Requires a bound port.
    pub fn listen(&mut self, id: SocketId) -> KernelResult<()> {
        let sock = self.sockets.get_mut(&id).ok_or(KernelError::NetError(NetError::BadSocket))?;
        if sock.state != TcpState::Closed || sock.local_port == 0 {
            return Err(KernelError::NetError(NetError::InvalidSocketState));
        }
        sock.state = TcpState::Listen;
        Ok(())
    }

    /// Active open: CLOSED -> SYN_SENT, emitting the SYN.
    pub fn connect(
        &mut self,
        id: SocketId,
        local_addr: Ipv4Address,
        remote_addr: Ipv4Address,
        remote_port: u16,
        out: &mut Vec<TcpSegment>,
    ) -> KernelResult<()> {
        let (state, bound_port) = {
            let sock = self.sockets.get(&id).ok_or(KernelError::NetError(NetError::BadSocket))?;
            (sock.state, sock.local_port)
        };
        if state != TcpState::Closed {
            return Err(KernelError::NetError(NetError::InvalidSocketState));
        }
        let iss = self.take_iss();
        let port = if bound_port == 0 {
            Some(self.take_ephemeral_port())
        } else {
            None
        };

        let sock = self.sockets.get_mut(&id).expect("checked above");
        if let Some(port) = port {
            sock.local_port = port;
        }
        if sock.local_addr == Ipv4Address::ANY {
            sock.local_addr = local_addr;
        }
        sock.remote_addr = remote_addr;
        sock.remote_port = remote_port;
        sock.state = TcpState::SynSent;
        sock.snd_una = iss;
        sock.snd_nxt = iss;
        emit(sock, TcpFlags::SYN, &[], out);
        Ok(())
    }

    /// Pop an ESTABLISHED connection spawned by this listener.
    pub fn accept(&mut self, id: SocketId) -> Option<SocketId> {
        let ready = {
            let listener = self.sockets.get(&id)?;
            listener
                .backlog
                .iter()
                .copied()
                .find(|child| {
                    self.sockets
                        .get(child)
                        .map(|c| c.state == TcpState::Established)
                        .unwrap_or(false)
                })?
        };
        let listener = self.sockets.get_mut(&id).expect("listener exists");
        listener.backlog.retain(|&c| c != ready);
        Some(ready)
    }

    /// Queue application data on an ESTABLISHED connection. The stream
    /// is cut into MSS-sized segments, each flagged PSH|ACK.
    pub fn send(
        &mut self,
        id: SocketId,
        data: &[u8],
        out: &mut Vec<TcpSegment>,
    ) -> KernelResult<usize> {
        let sock = self.sockets.get_mut(&id).ok_or(KernelError::NetError(NetError::BadSocket))?;
        if sock.state != TcpState::Established {
            return Err(KernelError::NetError(NetError::InvalidSocketState));
        }
        for chunk in data.chunks(TCP_MSS) {
            emit(sock, TcpFlags::PSH | TcpFlags::ACK, chunk, out);
        }
        Ok(data.len())
    }

    /// Copy buffered stream bytes out of the receive ring.
    pub fn recv(&mut self, id: SocketId, buf: &mut [u8]) -> KernelResult<usize> {
        let sock = self.sockets.get_mut(&id).ok_or(KernelError::NetError(NetError::BadSocket))?;
        if sock.state != TcpState::Established && sock.state != TcpState::CloseWait {
            return Err(KernelError::NetError(NetError::InvalidSocketState));
        }
        Ok(sock.rx_pop(buf))
    }

    /// Close one direction: FIN out, state per the side we're on.
    pub fn close(&mut self, id: SocketId, out: &mut Vec<TcpSegment>) -> KernelResult<()> {
        let sock = self.sockets.get_mut(&id).ok_or(KernelError::NetError(NetError::BadSocket))?;
        match sock.state {
            TcpState::Established => {
                sock.state = TcpState::FinWait1;
                emit(sock, TcpFlags::FIN | TcpFlags::ACK, &[], out);
            }
            TcpState::CloseWait => {
                sock.state = TcpState::LastAck;
                emit(sock, TcpFlags::FIN | TcpFlags::ACK, &[], out);
            }
            TcpState::SynSent | TcpState::SynReceived | TcpState::Listen | TcpState::Closed => {
                sock.state = TcpState::Closed;
            }
            _ => {}
        }
        Ok(())
    }

    /// An inbound segment, already stripped of its IP header. The
    /// source address rides along so accepted connections know their
    /// peer.
    pub fn segment_arrives(
        &mut self,
        src_ip: Ipv4Address,
        dst_ip: Ipv4Address,
        segment: &[u8],
        out: &mut Vec<TcpSegment>,
    ) {
        let Ok(header) = TcpHeader::from_bytes(segment) else {
            return;
        };
        let data_start = (header.data_offset as usize * 4).max(TcpHeader::SIZE);
        if data_start > segment.len() {
            return;
        }
        let payload = &segment[data_start..];

        // Exact four-tuple match first, then a listener on the port.
        let matched = self
            .sockets
            .values()
            .find(|s| {
                s.state != TcpState::Listen
                    && s.state != TcpState::Closed
                    && s.local_port == header.dst_port
                    && s.remote_port == header.src_port
            })
            .map(|s| s.id)
            .or_else(|| {
                self.sockets
                    .values()
                    .find(|s| s.state == TcpState::Listen && s.local_port == header.dst_port)
                    .map(|s| s.id)
            });

        // Unknown flow with no listener: silent drop.
        let Some(id) = matched else { return };

        let state = self.sockets.get(&id).expect("matched id").state;
        match state {
            TcpState::Listen => self.passive_open(id, src_ip, dst_ip, &header, out),
            _ => self.advance_connection(id, &header, payload, out),
        }
    }

    /// LISTEN + SYN: spawn a SYN_RECV child and answer SYN|ACK.
    fn passive_open(
        &mut self,
        listener_id: SocketId,
        src_ip: Ipv4Address,
        dst_ip: Ipv4Address,
        header: &TcpHeader,
        out: &mut Vec<TcpSegment>,
    ) {
        if !header.flags.contains(TcpFlags::SYN) || header.flags.contains(TcpFlags::ACK) {
            return;
        }

        let child_id = self.create();
        let iss = self.take_iss();
        let (local_addr, local_port) = {
            let listener = self.sockets.get(&listener_id).expect("listener exists");
            let addr = if listener.local_addr == Ipv4Address::ANY {
                dst_ip
            } else {
                listener.local_addr
            };
            (addr, listener.local_port)
        };

        {
            let child = self.sockets.get_mut(&child_id).expect("just created");
            child.state = TcpState::SynReceived;
            child.local_addr = local_addr;
            child.local_port = local_port;
            child.remote_addr = src_ip;
            child.remote_port = header.src_port;
            child.rcv_nxt = header.seq.wrapping_add(1);
            child.snd_una = iss;
            child.snd_nxt = iss;
            emit(child, TcpFlags::SYN | TcpFlags::ACK, &[], out);
        }

        let listener = self.sockets.get_mut(&listener_id).expect("listener exists");
        listener.backlog.push(child_id);
    }

    /// Everything past LISTEN: the per-state transition table.
    fn advance_connection(
        &mut self,
        id: SocketId,
        header: &TcpHeader,
        payload: &[u8],
        out: &mut Vec<TcpSegment>,
    ) {
        let sock = self.sockets.get_mut(&id).expect("caller matched id");
        let flags = header.flags;

        match sock.state {
            TcpState::SynSent => {
                if flags.contains(TcpFlags::SYN | TcpFlags::ACK)
                    && header.ack == sock.snd_una.wrapping_add(1)
                {
                    sock.state = TcpState::Established;
                    sock.rcv_nxt = header.seq.wrapping_add(1);
                    sock.snd_una = header.ack;
                    emit(sock, TcpFlags::ACK, &[], out);
                }
            }

            TcpState::SynReceived => {
                if flags.contains(TcpFlags::ACK) {
                    sock.state = TcpState::Established;
                    // The SYN we sent consumed one sequence number.
                    sock.snd_una = header.ack;
                    sock.snd_nxt = header.ack;
                }
            }

            TcpState::Established => {
                if flags.contains(TcpFlags::ACK) {
                    sock.snd_una = header.ack;
                }
                if !payload.is_empty() {
                    if header.seq == sock.rcv_nxt {
                        let accepted = payload.len().min(sock.rx_space());
                        sock.rx_push(&payload[..accepted]);
                        sock.rcv_nxt = sock.rcv_nxt.wrapping_add(accepted as u32);
                        emit(sock, TcpFlags::ACK, &[], out);
                    }
                    // Out-of-order data: drop, no ACK; the ofo queue is
                    // an open extension.
                }
                if flags.contains(TcpFlags::FIN) {
                    sock.state = TcpState::CloseWait;
                    sock.rcv_nxt = sock.rcv_nxt.wrapping_add(1);
                    emit(sock, TcpFlags::ACK, &[], out);
                }
            }

            TcpState::FinWait1 => {
                let our_fin_acked =
                    flags.contains(TcpFlags::ACK) && header.ack == sock.snd_nxt;
                if our_fin_acked {
                    sock.snd_una = header.ack;
                }
                if flags.contains(TcpFlags::FIN) {
                    sock.rcv_nxt = sock.rcv_nxt.wrapping_add(1);
                    emit(sock, TcpFlags::ACK, &[], out);
                    if our_fin_acked {
                        sock.state = TcpState::TimeWait;
                        sock.time_wait_timer = TIME_WAIT_TICKS;
                    } else {
                        sock.state = TcpState::Closing;
                    }
                } else if our_fin_acked {
                    sock.state = TcpState::FinWait2;
                }
            }

            TcpState::FinWait2 => {
                if flags.contains(TcpFlags::FIN) {
                    sock.rcv_nxt = sock.rcv_nxt.wrapping_add(1);
                    emit(sock, TcpFlags::ACK, &[], out);
                    sock.state = TcpState::TimeWait;
                    sock.time_wait_timer = TIME_WAIT_TICKS;
                }
            }

            TcpState::Closing => {
                if flags.contains(TcpFlags::ACK) && header.ack == sock.snd_nxt {
                    sock.state = TcpState::TimeWait;
                    sock.time_wait_timer = TIME_WAIT_TICKS;
                }
            }

            TcpState::LastAck => {
                if flags.contains(TcpFlags::ACK) {
                    sock.state = TcpState::Closed;
                }
            }

            TcpState::CloseWait | TcpState::TimeWait => {
                // Nothing to do for bare ACKs; duplicates of the peer's
                // FIN would be re-ACKed by a full implementation.
            }

            TcpState::Listen | TcpState::Closed => {}
        }
    }

    /// Periodic timer: the TIME_WAIT countdown.
    pub fn timer_tick(&mut self) {
        for sock in self.sockets.values_mut() {
            if sock.state == TcpState::TimeWait {
                if sock.time_wait_timer > 0 {
                    sock.time_wait_timer -= 1;
                } else {
                    sock.state = TcpState::Closed;
                }
            }
        }
    }

    /// Reap CLOSED sockets; their buffers go with them.
    pub fn cleanup(&mut self) {
        self.sockets.retain(|_, s| s.state != TcpState::Closed);
    }
}

impl Default for SocketTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Assemble and queue one outbound segment, advancing `snd_nxt` by the
/// sequence space it consumes: one for SYN-without-ACK or FIN, the
/// payload length for data.
fn emit(sock: &mut Socket, flags: TcpFlags, payload: &[u8], out: &mut Vec<TcpSegment>) {
    let mut header = TcpHeader {
        src_port: sock.local_port,
        dst_port: sock.remote_port,
        seq: sock.snd_nxt,
        ack: sock.rcv_nxt,
        data_offset: (TcpHeader::SIZE / 4) as u8,
        flags,
        window: sock.rx_space().min(u16::MAX as usize) as u16,
        checksum: 0,
        urgent: 0,
    };

    let mut bytes = Vec::with_capacity(TcpHeader::SIZE + payload.len());
    bytes.extend_from_slice(&header.to_bytes());
    bytes.extend_from_slice(payload);
    header.checksum = tcp_checksum(sock.local_addr, sock.remote_addr, &bytes);
    bytes[16..18].copy_from_slice(&header.checksum.to_be_bytes());

    if flags.contains(TcpFlags::SYN) && !flags.contains(TcpFlags::ACK) {
        sock.snd_nxt = sock.snd_nxt.wrapping_add(1);
    }
    if flags.contains(TcpFlags::FIN) {
        sock.snd_nxt = sock.snd_nxt.wrapping_add(1);
    }
    sock.snd_nxt = sock.snd_nxt.wrapping_add(payload.len() as u32);

    out.push(TcpSegment {
        src: sock.local_addr,
        dst: sock.remote_addr,
        bytes,
    });
}

// ---------------------------------------------------------------------------
// Global socket table
// ---------------------------------------------------------------------------

/// The machine-wide socket table. Outermost lock in the kernel's
/// ordering: never held across IP/ARP/device work -- callers drain the
/// emission queue after releasing it.
static SOCKETS: SpinLock<SocketTable> = SpinLock::new(SocketTable::new());

fn flush(out: Vec<TcpSegment>) {
    for seg in out {
        super::ip::send(seg.dst, super::ip::PROTO_TCP, &seg.bytes);
    }
}

/// Create a stream socket.
pub fn socket() -> SocketId {
    SOCKETS.lock().create()
}

/// Bind a socket to a local address/port.
pub fn bind(id: SocketId, addr: Ipv4Address, port: u16) -> KernelResult<()> {
    SOCKETS.lock().bind(id, addr, port)
}

/// Move a bound socket to LISTEN.
pub fn listen(id: SocketId) -> KernelResult<()> {
    SOCKETS.lock().listen(id)
}

/// Accept an established connection from a listener's backlog.
pub fn accept(id: SocketId) -> Option<SocketId> {
    SOCKETS.lock().accept(id)
}

/// Actively open a connection.
pub fn connect(id: SocketId, remote: Ipv4Address, port: u16) -> KernelResult<()> {
    let local = super::device_ip().unwrap_or(Ipv4Address::ANY);
    let mut out = Vec::new();
    let result = SOCKETS.lock().connect(id, local, remote, port, &mut out);
    flush(out);
    result
}

/// Send stream data.
pub fn send(id: SocketId, data: &[u8]) -> KernelResult<usize> {
    let mut out = Vec::new();
    let result = SOCKETS.lock().send(id, data, &mut out);
    flush(out);
    result
}

/// Receive buffered stream data.
pub fn recv(id: SocketId, buf: &mut [u8]) -> KernelResult<usize> {
    SOCKETS.lock().recv(id, buf)
}

/// Close a connection.
pub fn close(id: SocketId) -> KernelResult<()> {
    let mut out = Vec::new();
    let result = SOCKETS.lock().close(id, &mut out);
    flush(out);
    result
}

/// Inbound segment entry point, called by the IP layer with the source
/// and destination addresses from the IP header.
pub fn rx(src_ip: Ipv4Address, dst_ip: Ipv4Address, segment: &[u8]) {
    let mut out = Vec::new();
    SOCKETS.lock().segment_arrives(src_ip, dst_ip, segment, &mut out);
    flush(out);
}

/// TIME_WAIT countdown, driven by the scheduler tick.
pub fn timer_tick() {
    SOCKETS.lock().timer_tick();
}

/// Reap CLOSED sockets.
pub fn cleanup() {
    SOCKETS.lock().cleanup();
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);
    const SERVER: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);

    /// Build an inbound segment as the remote peer would.
    fn peer_segment(
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        payload: &[u8],
    ) -> Vec<u8> {
        let header = TcpHeader {
            src_port,
            dst_port,
            seq,
            ack,
            data_offset: 5,
            flags,
            window: 65535,
            checksum: 0,
            urgent: 0,
        };
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    fn parse_out(seg: &TcpSegment) -> (TcpHeader, Vec<u8>) {
        let header = TcpHeader::from_bytes(&seg.bytes).unwrap();
        (header, seg.bytes[TcpHeader::SIZE..].to_vec())
    }

    /// Listener on port 80 plus an ESTABLISHED child, returning
    /// (table, child id, server iss).
    fn established_pair() -> (SocketTable, SocketId, u32) {
        let mut table = SocketTable::new();
        let mut out = Vec::new();

        let listener = table.create();
        table.bind(listener, SERVER, 80).unwrap();
        table.listen(listener).unwrap();

        table.segment_arrives(
            CLIENT,
            SERVER,
            &peer_segment(5555, 80, 1000, 0, TcpFlags::SYN, &[]),
            &mut out,
        );
        let (syn_ack, _) = parse_out(&out[0]);
        let iss = syn_ack.seq;
        out.clear();

        table.segment_arrives(
            CLIENT,
            SERVER,
            &peer_segment(5555, 80, 1001, iss.wrapping_add(1), TcpFlags::ACK, &[]),
            &mut out,
        );
        let child = table.accept(listener).unwrap();
        (table, child, iss)
    }

    #[test]
    fn test_header_round_trip() {
        let header = TcpHeader {
            src_port: 80,
            dst_port: 5555,
            seq: 0xDEAD_0001,
            ack: 0xBEEF_0002,
            data_offset: 5,
            flags: TcpFlags::PSH | TcpFlags::ACK,
            window: 8192,
            checksum: 0x1234,
            urgent: 0,
        };
        let parsed = TcpHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed.src_port, 80);
        assert_eq!(parsed.seq, 0xDEAD_0001);
        assert_eq!(parsed.flags, TcpFlags::PSH | TcpFlags::ACK);
        assert_eq!(parsed.window, 8192);
    }

    #[test]
    fn test_checksum_verifies_round_trip() {
        let mut sock = Socket::new(1);
        sock.local_addr = SERVER;
        sock.local_port = 80;
        sock.remote_addr = CLIENT;
        sock.remote_port = 5555;
        sock.state = TcpState::Established;

        let mut out = Vec::new();
        emit(&mut sock, TcpFlags::PSH | TcpFlags::ACK, b"payload", &mut out);
        // Re-summing a checksummed segment yields zero.
        assert_eq!(tcp_checksum(SERVER, CLIENT, &out[0].bytes), 0);
    }

    #[test]
    fn test_passive_accept_handshake() {
        let mut table = SocketTable::new();
        let mut out = Vec::new();

        let listener = table.create();
        table.bind(listener, SERVER, 80).unwrap();
        table.listen(listener).unwrap();

        // SYN with seq 1000 arrives.
        table.segment_arrives(
            CLIENT,
            SERVER,
            &peer_segment(5555, 80, 1000, 0, TcpFlags::SYN, &[]),
            &mut out,
        );
        assert_eq!(out.len(), 1);
        let (syn_ack, _) = parse_out(&out[0]);
        assert!(syn_ack.flags.contains(TcpFlags::SYN | TcpFlags::ACK));
        assert_eq!(syn_ack.ack, 1001);
        let iss = syn_ack.seq;

        // Nothing established yet.
        assert!(table.accept(listener).is_none());

        // The handshake-completing ACK.
        out.clear();
        table.segment_arrives(
            CLIENT,
            SERVER,
            &peer_segment(5555, 80, 1001, iss.wrapping_add(1), TcpFlags::ACK, &[]),
            &mut out,
        );
        assert!(out.is_empty());

        let child = table.accept(listener).unwrap();
        let sock = table.get(child).unwrap();
        assert_eq!(sock.state, TcpState::Established);
        assert_eq!(sock.rcv_nxt, 1001);
        assert_eq!(sock.snd_una, iss.wrapping_add(1));
        assert_eq!(sock.remote_addr, CLIENT);
        assert_eq!(sock.remote_port, 5555);
    }

    #[test]
    fn test_syn_without_listener_is_dropped() {
        let mut table = SocketTable::new();
        let mut out = Vec::new();
        table.segment_arrives(
            CLIENT,
            SERVER,
            &peer_segment(5555, 81, 1000, 0, TcpFlags::SYN, &[]),
            &mut out,
        );
        assert!(out.is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_byte_stream_delivery() {
        let (mut table, child, _) = established_pair();
        let mut out = Vec::new();

        table.segment_arrives(
            CLIENT,
            SERVER,
            &peer_segment(
                5555,
                80,
                1001,
                0,
                TcpFlags::PSH | TcpFlags::ACK,
                b"hello",
            ),
            &mut out,
        );

        // An ACK for the new rcv_nxt went out.
        assert_eq!(out.len(), 1);
        let (ack, _) = parse_out(&out[0]);
        assert!(ack.flags.contains(TcpFlags::ACK));
        assert_eq!(ack.ack, 1006);

        let sock = table.get(child).unwrap();
        assert_eq!(sock.rcv_nxt, 1006);

        let mut buf = [0u8; 16];
        let n = table.recv(child, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn test_out_of_order_segment_is_dropped() {
        let (mut table, child, _) = established_pair();
        let mut out = Vec::new();

        // seq beyond rcv_nxt: dropped, no ACK, rcv_nxt unchanged.
        table.segment_arrives(
            CLIENT,
            SERVER,
            &peer_segment(5555, 80, 2000, 0, TcpFlags::PSH | TcpFlags::ACK, b"late"),
            &mut out,
        );
        assert!(out.is_empty());
        let sock = table.get(child).unwrap();
        assert_eq!(sock.rcv_nxt, 1001);
        assert_eq!(sock.rx_available(), 0);
    }

    #[test]
    fn test_receive_ring_trims_to_capacity() {
        let (mut table, child, _) = established_pair();
        let mut out = Vec::new();

        // Fill all but 3 bytes of the ring.
        let bulk = vec![0xAA; TCP_RX_BUF_SIZE - 3];
        table.segment_arrives(
            CLIENT,
            SERVER,
            &peer_segment(5555, 80, 1001, 0, TcpFlags::ACK, &bulk),
            &mut out,
        );
        let after_bulk = table.get(child).unwrap().rcv_nxt;
        assert_eq!(after_bulk, 1001 + bulk.len() as u32);

        // Five more bytes only fit partially; the accepted length is
        // trimmed so rx_tail - rx_head stays within capacity.
        out.clear();
        table.segment_arrives(
            CLIENT,
            SERVER,
            &peer_segment(5555, 80, after_bulk, 0, TcpFlags::ACK, b"XYZZY"),
            &mut out,
        );
        let sock = table.get(child).unwrap();
        assert_eq!(sock.rx_available(), TCP_RX_BUF_SIZE);
        assert_eq!(sock.rcv_nxt, after_bulk + 3);
    }

    #[test]
    fn test_ring_wraparound_preserves_stream() {
        let (mut table, child, _) = established_pair();
        let mut out = Vec::new();
        let mut seq = 1001u32;
        let mut drained = Vec::new();

        // Push and drain more than one ring's worth in 40 KiB slabs so
        // the copy path wraps.
        for round in 0..4u8 {
            let chunk = vec![round; 40 * 1024];
            table.segment_arrives(
                CLIENT,
                SERVER,
                &peer_segment(5555, 80, seq, 0, TcpFlags::ACK, &chunk),
                &mut out,
            );
            seq = seq.wrapping_add(chunk.len() as u32);

            let mut buf = vec![0u8; 40 * 1024];
            let n = table.recv(child, &mut buf).unwrap();
            assert_eq!(n, chunk.len());
            drained.extend_from_slice(&buf[..n]);
        }
        for (round, window) in drained.chunks(40 * 1024).enumerate() {
            assert!(window.iter().all(|&b| b == round as u8));
        }
    }

    #[test]
    fn test_active_open_handshake() {
        let mut table = SocketTable::new();
        let mut out = Vec::new();

        let id = table.create();
        table.connect(id, CLIENT, SERVER, 80, &mut out).unwrap();

        let (syn, _) = parse_out(&out[0]);
        assert!(syn.flags.contains(TcpFlags::SYN));
        assert!(!syn.flags.contains(TcpFlags::ACK));
        let iss = syn.seq;
        {
            let sock = table.get(id).unwrap();
            assert_eq!(sock.state, TcpState::SynSent);
            assert!(sock.local_port >= 49152);
            assert_eq!(sock.snd_nxt, iss.wrapping_add(1));
        }

        // The peer's SYN|ACK completes the open and a bare ACK leaves.
        out.clear();
        table.segment_arrives(
            SERVER,
            CLIENT,
            &peer_segment(
                80,
                table.get(id).unwrap().local_port,
                7000,
                iss.wrapping_add(1),
                TcpFlags::SYN | TcpFlags::ACK,
                &[],
            ),
            &mut out,
        );
        let sock = table.get(id).unwrap();
        assert_eq!(sock.state, TcpState::Established);
        assert_eq!(sock.rcv_nxt, 7001);
        let (ack, _) = parse_out(&out[0]);
        assert!(ack.flags.contains(TcpFlags::ACK));
        assert_eq!(ack.ack, 7001);
    }

    #[test]
    fn test_wrong_ack_keeps_syn_sent() {
        let mut table = SocketTable::new();
        let mut out = Vec::new();
        let id = table.create();
        table.connect(id, CLIENT, SERVER, 80, &mut out).unwrap();
        let local_port = table.get(id).unwrap().local_port;

        out.clear();
        table.segment_arrives(
            SERVER,
            CLIENT,
            &peer_segment(80, local_port, 7000, 12345, TcpFlags::SYN | TcpFlags::ACK, &[]),
            &mut out,
        );
        assert_eq!(table.get(id).unwrap().state, TcpState::SynSent);
        assert!(out.is_empty());
    }

    #[test]
    fn test_full_close_empties_table_after_cleanup() {
        let (mut table, child, _) = established_pair();
        let mut out = Vec::new();

        // Peer closes: FIN -> CLOSE_WAIT, ACK emitted.
        let sock_rcv = table.get(child).unwrap().rcv_nxt;
        table.segment_arrives(
            CLIENT,
            SERVER,
            &peer_segment(5555, 80, sock_rcv, 0, TcpFlags::FIN | TcpFlags::ACK, &[]),
            &mut out,
        );
        assert_eq!(table.get(child).unwrap().state, TcpState::CloseWait);
        let (ack, _) = parse_out(&out[0]);
        assert_eq!(ack.ack, sock_rcv.wrapping_add(1));

        // Our side closes: CLOSE_WAIT -> LAST_ACK with FIN|ACK.
        out.clear();
        table.close(child, &mut out).unwrap();
        assert_eq!(table.get(child).unwrap().state, TcpState::LastAck);
        let (fin, _) = parse_out(&out[0]);
        assert!(fin.flags.contains(TcpFlags::FIN));

        // The peer's final ACK closes the connection.
        out.clear();
        table.segment_arrives(
            CLIENT,
            SERVER,
            &peer_segment(5555, 80, sock_rcv + 1, fin.seq.wrapping_add(1), TcpFlags::ACK, &[]),
            &mut out,
        );
        assert_eq!(table.get(child).unwrap().state, TcpState::Closed);

        // Cleanup reaps the closed connection; the listener stays.
        let before = table.len();
        table.cleanup();
        assert_eq!(table.len(), before - 1);
        assert!(table.get(child).is_none());
    }

    #[test]
    fn test_active_close_through_time_wait() {
        let (mut table, child, _) = established_pair();
        let mut out = Vec::new();

        // We close first: FIN_WAIT1.
        table.close(child, &mut out).unwrap();
        let (fin, _) = parse_out(&out[0]);
        assert_eq!(table.get(child).unwrap().state, TcpState::FinWait1);

        // Peer ACKs our FIN: FIN_WAIT2.
        out.clear();
        table.segment_arrives(
            CLIENT,
            SERVER,
            &peer_segment(5555, 80, 1001, fin.seq.wrapping_add(1), TcpFlags::ACK, &[]),
            &mut out,
        );
        assert_eq!(table.get(child).unwrap().state, TcpState::FinWait2);

        // Peer's FIN: TIME_WAIT with the timer armed, final ACK out.
        out.clear();
        table.segment_arrives(
            CLIENT,
            SERVER,
            &peer_segment(5555, 80, 1001, 0, TcpFlags::FIN | TcpFlags::ACK, &[]),
            &mut out,
        );
        {
            let sock = table.get(child).unwrap();
            assert_eq!(sock.state, TcpState::TimeWait);
            assert_eq!(sock.time_wait_timer, TIME_WAIT_TICKS);
        }
        let (ack, _) = parse_out(&out[0]);
        assert_eq!(ack.ack, 1002);

        // The countdown expires into CLOSED, and cleanup reaps it.
        for _ in 0..=TIME_WAIT_TICKS as u32 + 1 {
            table.timer_tick();
        }
        assert_eq!(table.get(child).unwrap().state, TcpState::Closed);
        table.cleanup();
        assert!(table.get(child).is_none());
    }

    #[test]
    fn test_bind_to_taken_port_fails() {
        let mut table = SocketTable::new();
        let a = table.create();
        table.bind(a, SERVER, 80).unwrap();
        table.listen(a).unwrap();

        let b = table.create();
        let err = table.bind(b, SERVER, 80).unwrap_err();
        assert_eq!(
            err,
            KernelError::NetError(NetError::PortInUse { port: 80 })
        );
    }

    #[test]
    fn test_send_chunks_by_mss() {
        let (mut table, child, _) = established_pair();
        let mut out = Vec::new();

        let data = vec![0x42u8; TCP_MSS * 2 + 100];
        let sent = table.send(child, &data, &mut out).unwrap();
        assert_eq!(sent, data.len());
        assert_eq!(out.len(), 3);
        let (first, body) = parse_out(&out[0]);
        assert!(first.flags.contains(TcpFlags::PSH | TcpFlags::ACK));
        assert_eq!(body.len(), TCP_MSS);
        let (_, last_body) = parse_out(&out[2]);
        assert_eq!(last_body.len(), 100);

        // Sequence numbers advance by the payload bytes.
        let (second, _) = parse_out(&out[1]);
        assert_eq!(second.seq, first.seq.wrapping_add(TCP_MSS as u32));
    }

    #[test]
    fn test_send_on_unconnected_socket_fails() {
        let mut table = SocketTable::new();
        let id = table.create();
        let mut out = Vec::new();
        assert!(table.send(id, b"x", &mut out).is_err());
        assert!(table.recv(id, &mut [0u8; 4]).is_err());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(TcpState::Established.name(), "ESTABLISHED");
        assert_eq!(TcpState::TimeWait.name(), "TIME_WAIT");
    }
}
