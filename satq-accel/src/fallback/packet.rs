//! Packet engine fallback: framing, ACK generation, retransmission.
//!
//! The wire layouts match the accelerator's output registers bit for bit.
//! Framing and retransmission prepend a fixed header in front of the
//! payload; ACK processing emits a standalone frame and ignores its input.

/// Header in front of framed payloads:
/// `C0 | connection_id (LE64) | packet_number (LE32) | 08 | 00 | length (LE16)`.
pub const FRAME_HEADER_LEN: usize = 17;

/// Build a framed packet around `payload`.
pub fn frame_packet(payload: &[u8], connection_id: u64, packet_number: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.push(0xC0);
    out.extend_from_slice(&connection_id.to_le_bytes());
    out.extend_from_slice(&packet_number.to_le_bytes());
    out.push(0x08); // STREAM frame type
    out.push(0x00); // stream id 0
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Build an ACK frame for `largest_acked`:
/// `02 | largest_acked (LE32) | ack_delay (LE16) = 10 | range_count = 0 | first_range = 0`.
pub fn ack_frame(largest_acked: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.push(0x02);
    out.extend_from_slice(&largest_acked.to_le_bytes());
    out.extend_from_slice(&10u16.to_le_bytes());
    out.push(0x00);
    out.push(0x00);
    out
}

/// Reframe a packet for retransmission. The device assigns the next packet
/// number, so the header carries `packet_number + 1`.
pub fn retransmit_packet(payload: &[u8], connection_id: u64, packet_number: u32) -> Vec<u8> {
    frame_packet(payload, connection_id, packet_number.wrapping_add(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_vector() {
        let framed = frame_packet(&[0xDE, 0xAD, 0xBE, 0xEF], 0x0102_0304_0506_0708, 7);
        assert_eq!(
            framed,
            [
                0xC0, // marker
                0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, // connection id LE
                0x07, 0x00, 0x00, 0x00, // packet number LE
                0x08, 0x00, // STREAM frame, stream 0
                0x04, 0x00, // payload length LE
                0xDE, 0xAD, 0xBE, 0xEF,
            ]
        );
    }

    #[test]
    fn test_framing_empty_payload() {
        let framed = frame_packet(&[], 1, 0);
        assert_eq!(framed.len(), FRAME_HEADER_LEN);
        assert_eq!(&framed[13..15], &[0x08, 0x00]);
        assert_eq!(&framed[15..17], &[0x00, 0x00]);
    }

    #[test]
    fn test_ack_vector() {
        assert_eq!(
            ack_frame(0x1122_3344),
            [0x02, 0x44, 0x33, 0x22, 0x11, 0x0A, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_retransmission_bumps_packet_number() {
        let original = frame_packet(b"data", 5, 9);
        let resent = retransmit_packet(b"data", 5, 9);
        assert_eq!(&resent[9..13], &10u32.to_le_bytes());
        // Everything but the packet number is unchanged.
        assert_eq!(&resent[..9], &original[..9]);
        assert_eq!(&resent[13..], &original[13..]);
    }
}
