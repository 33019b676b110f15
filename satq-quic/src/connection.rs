//! Per-client QUIC connection handler.
//!
//! One handler exists per client 4-tuple. It parses inbound datagrams,
//! drives the Initial → Handshake → 1-RTT exchange, tracks sent packets for
//! retransmission, and prefers the accelerator's packet engine for framing,
//! ACK generation, and retransmission whenever acceleration is enabled and
//! the device is up. Handlers never touch the socket: every call returns the
//! datagrams to put on the wire, and the dispatcher owns the send.

use crate::frames::{FrameKind, FRAME_TYPE_HANDSHAKE_DONE};
use crate::packet::{self, PacketType};
use bytes::Bytes;
use satq_accel::{Accelerator, PacketOp};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A connection with no inbound activity for this long is reapable.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Unacknowledged packets older than this are resent.
pub const RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Stand-in CRYPTO frame sent in Initial responses. Fixed test vector, not
/// TLS; interop with real clients needs a TLS stack behind this.
const INITIAL_CRYPTO_SAMPLE: [u8; 19] = [
    0x06, 0x00, 0x10, // CRYPTO, offset 0, length 16
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, //
    0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10,
];

/// Stand-in CRYPTO frame for Handshake responses.
const HANDSHAKE_CRYPTO_SAMPLE: [u8; 19] = [
    0x06, 0x00, 0x10, //
    0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, //
    0x19, 0x1A, 0x1B, 0x1C, 0x1D, 0x1E, 0x1F, 0x20,
];

/// Record of one outbound packet, kept for retransmission. Acknowledged
/// entries are not pruned, so a long-lived connection grows this list.
#[derive(Debug, Clone)]
struct SentPacket {
    packet_number: u32,
    sent_time: Instant,
    acknowledged: bool,
    data: Vec<u8>,
}

struct HandlerState {
    /// Destination connection id, learned from the client's first packet.
    dcid: Bytes,
    next_packet_number: u32,
    last_activity: Instant,
    sent_packets: Vec<SentPacket>,
    received_packets: Vec<u32>,
}

/// QUIC state machine for a single client.
pub struct ConnectionHandler {
    client_addr: SocketAddr,
    client_key: String,
    accel: Arc<Accelerator>,
    acceleration_enabled: AtomicBool,
    connected: AtomicBool,
    /// 64-bit id derived from our source connection id bytes.
    connection_id: u64,
    scid: [u8; 8],
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    state: Mutex<HandlerState>,
}

impl ConnectionHandler {
    pub fn new(
        client_addr: SocketAddr,
        accel: Arc<Accelerator>,
        acceleration_enabled: bool,
        now: Instant,
    ) -> Self {
        let scid: [u8; 8] = rand::random();
        let connection_id = u64::from_be_bytes(scid);

        Self {
            client_key: format!("{}:{}", client_addr.ip(), client_addr.port()),
            client_addr,
            accel,
            acceleration_enabled: AtomicBool::new(acceleration_enabled),
            connected: AtomicBool::new(true),
            connection_id,
            scid,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            state: Mutex::new(HandlerState {
                dcid: Bytes::new(),
                next_packet_number: 0,
                last_activity: now,
                sent_packets: Vec::new(),
                received_packets: Vec::new(),
            }),
        }
    }

    /// `"ip:port"` key the dispatcher demultiplexes on.
    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn set_acceleration_enabled(&self, enabled: bool) {
        self.acceleration_enabled.store(enabled, Ordering::Release);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    /// False once the idle timeout has elapsed without inbound traffic; the
    /// dispatcher reaps inactive handlers on its next sweep.
    pub fn is_active(&self, now: Instant) -> bool {
        let last_activity = self.state.lock().unwrap().last_activity;
        self.connected.load(Ordering::Acquire)
            && now.saturating_duration_since(last_activity) < IDLE_TIMEOUT
    }

    /// Process one inbound datagram and return the datagrams to send back.
    pub fn process_datagram(&self, data: &[u8], now: Instant) -> Vec<Bytes> {
        let mut out = Vec::new();
        if data.is_empty() {
            return out;
        }

        self.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock().unwrap();
        state.last_activity = now;

        let (header, payload) = match packet::parse_packet(data) {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::warn!(client = %self.client_key, %error, "failed to parse QUIC packet");
                return out;
            }
        };

        if state.dcid.is_empty() {
            state.dcid = header.dcid.clone();
        }

        match header.packet_type {
            PacketType::Initial => {
                state.received_packets.push(header.packet_number);
                self.send_packet(
                    &mut state,
                    PacketType::Initial,
                    &INITIAL_CRYPTO_SAMPLE,
                    now,
                    &mut out,
                );
            }
            PacketType::Handshake => {
                state.received_packets.push(header.packet_number);
                self.send_packet(
                    &mut state,
                    PacketType::Handshake,
                    &HANDSHAKE_CRYPTO_SAMPLE,
                    now,
                    &mut out,
                );
                self.send_packet(
                    &mut state,
                    PacketType::OneRtt,
                    &[FRAME_TYPE_HANDSHAKE_DONE],
                    now,
                    &mut out,
                );
            }
            PacketType::OneRtt => {
                state.received_packets.push(header.packet_number);
                self.process_frames(&mut state, payload, now, &mut out);
                self.send_ack(&mut state, now, &mut out);
            }
            other => {
                tracing::debug!(client = %self.client_key, ?other, "packet type not supported");
            }
        }

        self.check_retransmissions(&mut state, now, &mut out);
        out
    }

    /// Best-effort frame walk. ACK decodes the 4-byte largest-acked and
    /// stops; CRYPTO stops; STREAM echoes the whole payload back and stops.
    fn process_frames(
        &self,
        state: &mut HandlerState,
        payload: &[u8],
        now: Instant,
        out: &mut Vec<Bytes>,
    ) {
        let mut offset = 0;
        while offset < payload.len() {
            let frame_type = payload[offset];
            offset += 1;

            match FrameKind::classify(frame_type) {
                FrameKind::Padding | FrameKind::Ping => continue,
                FrameKind::Ack => {
                    if offset + 4 <= payload.len() {
                        let largest = u32::from_be_bytes([
                            payload[offset],
                            payload[offset + 1],
                            payload[offset + 2],
                            payload[offset + 3],
                        ]);
                        if let Some(sent) = state
                            .sent_packets
                            .iter_mut()
                            .find(|sent| sent.packet_number == largest)
                        {
                            sent.acknowledged = true;
                        }
                    }
                    // Range decoding is truncated at the largest-acked.
                    break;
                }
                FrameKind::Crypto => break,
                FrameKind::Stream => {
                    let echo = payload.to_vec();
                    self.send_packet(state, PacketType::OneRtt, &echo, now, out);
                    break;
                }
                FrameKind::Other(_) => break,
            }
        }
    }

    /// Frame and queue one packet, preferring the accelerator. Every sent
    /// packet is recorded for the retransmission sweep.
    fn send_packet(
        &self,
        state: &mut HandlerState,
        packet_type: PacketType,
        payload: &[u8],
        now: Instant,
        out: &mut Vec<Bytes>,
    ) {
        if self.acceleration_active() {
            let result = self.accel.packet_op(
                PacketOp::Framing,
                payload,
                self.connection_id,
                state.next_packet_number,
                None,
            );
            if result.success {
                self.record_sent(state, result.data, now, out);
                return;
            }
            tracing::debug!(
                client = %self.client_key,
                error = %result.error_message,
                "accelerated framing failed, using software path"
            );
        }

        match packet::build_packet(
            packet_type,
            &state.dcid,
            &self.scid,
            state.next_packet_number,
            payload,
        ) {
            Ok(bytes) => self.record_sent(state, bytes.to_vec(), now, out),
            Err(error) => {
                tracing::warn!(client = %self.client_key, %error, "failed to build packet");
            }
        }
    }

    fn record_sent(
        &self,
        state: &mut HandlerState,
        data: Vec<u8>,
        now: Instant,
        out: &mut Vec<Bytes>,
    ) {
        state.sent_packets.push(SentPacket {
            packet_number: state.next_packet_number,
            sent_time: now,
            acknowledged: false,
            data: data.clone(),
        });
        state.next_packet_number += 1;
        self.emit(data, out);
    }

    fn emit(&self, data: Vec<u8>, out: &mut Vec<Bytes>) {
        self.bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        out.push(Bytes::from(data));
    }

    /// Acknowledge everything received so far. The accelerator path emits
    /// the device's ACK frame as-is; the software path wraps the frame in a
    /// 1-RTT packet.
    fn send_ack(&self, state: &mut HandlerState, now: Instant, out: &mut Vec<Bytes>) {
        let Some(largest) = state.received_packets.iter().copied().max() else {
            return;
        };

        let mut ack_frame = Vec::with_capacity(9);
        ack_frame.push(0x02);
        ack_frame.extend_from_slice(&largest.to_be_bytes());
        ack_frame.extend_from_slice(&[0x00, 0x00]); // ack delay
        ack_frame.push(0x00); // range count
        ack_frame.push(0x00); // first range

        if self.acceleration_active() {
            let result = self.accel.packet_op(
                PacketOp::AckProcessing,
                &ack_frame,
                self.connection_id,
                largest,
                None,
            );
            if result.success {
                self.emit(result.data, out);
                return;
            }
        }

        self.send_packet(state, PacketType::OneRtt, &ack_frame, now, out);
    }

    /// Resend anything unacknowledged past the retransmission timeout. The
    /// accelerator regenerates the packet from its own state when it can;
    /// otherwise the stored bytes go out verbatim. Either way the send time
    /// is refreshed.
    fn check_retransmissions(&self, state: &mut HandlerState, now: Instant, out: &mut Vec<Bytes>) {
        for index in 0..state.sent_packets.len() {
            let (packet_number, due) = {
                let sent = &state.sent_packets[index];
                (
                    sent.packet_number,
                    !sent.acknowledged
                        && now.saturating_duration_since(sent.sent_time) > RETRANSMIT_TIMEOUT,
                )
            };
            if !due {
                continue;
            }

            let mut regenerated = None;
            if self.acceleration_active() {
                let result = self.accel.packet_op(
                    PacketOp::Retransmission,
                    &[],
                    self.connection_id,
                    packet_number,
                    None,
                );
                if result.success && !result.data.is_empty() {
                    regenerated = Some(result.data);
                }
            }

            let data = regenerated.unwrap_or_else(|| state.sent_packets[index].data.clone());
            tracing::debug!(
                client = %self.client_key,
                packet_number,
                "retransmitting unacknowledged packet"
            );
            self.emit(data, out);
            state.sent_packets[index].sent_time = now;
        }
    }

    fn acceleration_active(&self) -> bool {
        self.acceleration_enabled.load(Ordering::Acquire) && self.accel.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::SHORT_HEADER_DCID_LEN;

    fn sim_accel() -> Arc<Accelerator> {
        let accel = Accelerator::new("/dev/null", true);
        accel.initialize().unwrap();
        Arc::new(accel)
    }

    fn handler(acceleration: bool) -> ConnectionHandler {
        ConnectionHandler::new(
            "127.0.0.1:40000".parse().unwrap(),
            sim_accel(),
            acceleration,
            Instant::now(),
        )
    }

    /// Client-style long header with 1-byte varint length fields, the form
    /// the parser accepts.
    fn client_long(first: u8, pn: u32, payload: &[u8]) -> Vec<u8> {
        assert!(payload.len() <= 0x3F);
        let mut data = vec![first, 0x00, 0x00, 0x00, 0x01];
        data.push(4);
        data.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]); // client dcid
        data.push(4);
        data.extend_from_slice(&[0x11, 0x22, 0x33, 0x44]); // client scid
        if first == 0xC3 {
            data.push(0); // token length
        }
        data.push(payload.len() as u8);
        data.extend_from_slice(&pn.to_be_bytes());
        data.extend_from_slice(payload);
        data
    }

    fn client_initial(pn: u32) -> Vec<u8> {
        client_long(0xC3, pn, &[0x06, 0x00, 0x00])
    }

    fn client_one_rtt(pn: u32, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0x40];
        data.extend_from_slice(&[0xEE; SHORT_HEADER_DCID_LEN]);
        data.extend_from_slice(&pn.to_be_bytes());
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn test_initial_gets_software_response() {
        let handler = handler(false);
        let now = Instant::now();

        let out = handler.process_datagram(&client_initial(0), now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0][0], 0xC3, "software path responds with an Initial");

        // The response carries the client's DCID echoed back.
        let (header, payload) = packet::parse_packet(&out[0]).unwrap();
        assert_eq!(header.dcid.as_ref(), &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(header.scid.len(), 8);
        let _ = payload;
    }

    #[test]
    fn test_initial_gets_accelerated_framing() {
        let handler = handler(true);
        let out = handler.process_datagram(&client_initial(0), Instant::now());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0][0], 0xC0, "accelerated framing header marker");
        // Connection id rides in the frame header, little-endian.
        let cid = u64::from_le_bytes(out[0][1..9].try_into().unwrap());
        assert_eq!(cid, handler.connection_id());
        // Payload is the Initial CRYPTO sample.
        assert_eq!(&out[0][17..], &INITIAL_CRYPTO_SAMPLE);
    }

    #[test]
    fn test_packet_numbers_monotonic_from_zero() {
        let handler = handler(false);
        let now = Instant::now();

        handler.process_datagram(&client_initial(0), now);
        handler.process_datagram(&client_long(0xE3, 1, &[0x06, 0x00, 0x00]), now);

        let state = handler.state.lock().unwrap();
        let numbers: Vec<u32> = state.sent_packets.iter().map(|p| p.packet_number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    #[test]
    fn test_handshake_response_pair() {
        let handler = handler(false);
        let out =
            handler.process_datagram(&client_long(0xE3, 0, &[0x06, 0x00, 0x00]), Instant::now());

        assert_eq!(out.len(), 2);
        assert_eq!(out[0][0], 0xE3, "Handshake response first");
        assert_eq!(out[1][0], 0x40, "then a 1-RTT HANDSHAKE_DONE");
        assert_eq!(out[1][out[1].len() - 1], FRAME_TYPE_HANDSHAKE_DONE);
    }

    #[test]
    fn test_stream_frame_echoed_then_acked() {
        let handler = handler(false);
        let now = Instant::now();
        let payload = [0x08, 0x00, 0x03, 0xCA, 0xFE, 0xBE];

        let out = handler.process_datagram(&client_one_rtt(7, &payload), now);
        assert_eq!(out.len(), 2);

        // Echo: a 1-RTT packet whose payload is the inbound payload verbatim.
        let (echo_header, echo_payload) = packet::parse_packet(&out[0]).unwrap();
        assert_eq!(echo_header.packet_type, PacketType::OneRtt);
        assert_eq!(echo_payload, payload);

        // ACK: 1-RTT packet carrying the software ACK frame for pn 7.
        let (_, ack_payload) = packet::parse_packet(&out[1]).unwrap();
        assert_eq!(ack_payload[0], 0x02);
        assert_eq!(&ack_payload[1..5], &7u32.to_be_bytes());
    }

    #[test]
    fn test_accelerated_ack_is_raw_frame() {
        let handler = handler(true);
        let out = handler.process_datagram(&client_one_rtt(3, &[0x01]), Instant::now());

        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].as_ref(),
            &[0x02, 0x03, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x00]
        );
        // The device-generated ACK is not tracked for retransmission.
        assert!(handler.state.lock().unwrap().sent_packets.is_empty());
    }

    #[test]
    fn test_inbound_ack_marks_sent_packet() {
        let handler = handler(false);
        let now = Instant::now();

        handler.process_datagram(&client_initial(0), now);
        assert!(!handler.state.lock().unwrap().sent_packets[0].acknowledged);

        // ACK frame acknowledging our packet number 0.
        let mut ack_payload = vec![0x02];
        ack_payload.extend_from_slice(&0u32.to_be_bytes());
        ack_payload.extend_from_slice(&[0, 0, 0, 0]);
        handler.process_datagram(&client_one_rtt(1, &ack_payload), now);

        assert!(handler.state.lock().unwrap().sent_packets[0].acknowledged);
    }

    #[test]
    fn test_retransmission_after_timeout() {
        let handler = handler(false);
        let start = Instant::now();

        let first = handler.process_datagram(&client_initial(0), start);
        assert_eq!(first.len(), 1);
        let original = first[0].clone();

        // Ping after the timeout: the sweep resends the stored bytes.
        let later = start + Duration::from_millis(600);
        let out = handler.process_datagram(&client_one_rtt(1, &[0x01]), later);

        // ACK for the ping, then the verbatim retransmission.
        assert_eq!(out.len(), 2);
        assert_eq!(out[1], original);

        // The send time was refreshed: an immediate second sweep is quiet.
        let out = handler.process_datagram(&client_one_rtt(2, &[0x01]), later);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_acknowledged_packets_not_retransmitted() {
        let handler = handler(false);
        let start = Instant::now();

        handler.process_datagram(&client_initial(0), start);

        let mut ack_payload = vec![0x02];
        ack_payload.extend_from_slice(&0u32.to_be_bytes());
        ack_payload.extend_from_slice(&[0, 0, 0, 0]);
        handler.process_datagram(&client_one_rtt(1, &ack_payload), start);

        // Well past the timeout, the acked Initial must stay quiet. Only the
        // unacked ACK packets from earlier responses may resend.
        let later = start + Duration::from_millis(700);
        let out = handler.process_datagram(&client_one_rtt(2, &[0x01]), later);
        for datagram in &out {
            assert_ne!(datagram[0], 0xC3, "acked Initial response was resent");
        }
    }

    #[test]
    fn test_idle_timeout() {
        let handler = handler(false);
        let now = Instant::now();
        handler.process_datagram(&client_initial(0), now);

        assert!(handler.is_active(now));
        assert!(handler.is_active(now + Duration::from_secs(29)));
        assert!(!handler.is_active(now + Duration::from_secs(31)));
    }

    #[test]
    fn test_malformed_datagram_keeps_connection() {
        let handler = handler(false);
        let now = Instant::now();

        let out = handler.process_datagram(&[0xC3, 0x00], now);
        assert!(out.is_empty());
        assert!(handler.is_active(now));
        assert_eq!(handler.packets_received(), 1);
    }

    #[test]
    fn test_counters_track_traffic() {
        let handler = handler(false);
        let now = Instant::now();
        let datagram = client_initial(0);

        let out = handler.process_datagram(&datagram, now);
        assert_eq!(handler.packets_received(), 1);
        assert_eq!(handler.bytes_received(), datagram.len() as u64);
        assert_eq!(handler.packets_sent(), 1);
        assert_eq!(handler.bytes_sent(), out[0].len() as u64);
    }
}
