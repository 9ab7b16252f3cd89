//! ICMP: echo request/reply.

use alloc::vec::Vec;

use super::{checksum, Ipv4Address};

/// Echo reply type.
pub const ICMP_ECHO_REPLY: u8 = 0;
/// Echo request type.
pub const ICMP_ECHO_REQUEST: u8 = 8;

/// Build the echo reply for an inbound echo request, or `None` when the
/// message is not a well-formed request.
pub fn build_echo_reply(message: &[u8]) -> Option<Vec<u8>> {
    if message.len() < 8 || message[0] != ICMP_ECHO_REQUEST {
        return None;
    }
    let mut reply = message.to_vec();
    reply[0] = ICMP_ECHO_REPLY;
    reply[1] = 0;
    reply[2] = 0;
    reply[3] = 0;
    let sum = checksum(&reply);
    reply[2..4].copy_from_slice(&sum.to_be_bytes());
    Some(reply)
}

/// Handle one inbound ICMP message: echo requests are answered,
/// everything else is dropped.
pub fn rx(src: Ipv4Address, message: &[u8]) {
    if let Some(reply) = build_echo_reply(message) {
        super::ip::send(src, super::ip::PROTO_ICMP, &reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_reply_mirrors_id_seq_and_payload() {
        // type 8, code 0, zero checksum, id 0x1234, seq 0x0001, payload.
        let mut request = alloc::vec![ICMP_ECHO_REQUEST, 0, 0, 0, 0x12, 0x34, 0x00, 0x01];
        request.extend_from_slice(b"ping-payload");
        let sum = checksum(&request);
        request[2..4].copy_from_slice(&sum.to_be_bytes());

        let reply = build_echo_reply(&request).unwrap();
        assert_eq!(reply[0], ICMP_ECHO_REPLY);
        assert_eq!(&reply[4..8], &request[4..8]);
        assert_eq!(&reply[8..], b"ping-payload");
        // The reply carries a valid checksum.
        assert_eq!(checksum(&reply), 0);
    }

    #[test]
    fn test_non_request_ignored() {
        let reply_in = [ICMP_ECHO_REPLY, 0, 0, 0, 0, 0, 0, 0];
        assert!(build_echo_reply(&reply_in).is_none());
        assert!(build_echo_reply(&[8, 0, 0]).is_none());
    }
}
