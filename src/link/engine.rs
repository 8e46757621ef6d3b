//! MNP-style link state machine.
//!
//! The engine performs no I/O. Raw transport bytes go in through
//! [`LinkEngine::receive`], escaped frames come out of
//! [`LinkEngine::take_outbound`], and application bytes accepted in sequence
//! come out of [`LinkEngine::take_delivered`]. Time is passed in explicitly so
//! the owner decides how to sleep until [`LinkEngine::next_deadline`].
//!
//! ```text
//!            open() / LR                 LN / LNA, or LA/LT from a
//!   Idle ───────────────► Requesting ──► Negotiating ─────────────► Active
//!    ▲ ▲  LR (responder) ───────────────────▲                         │
//!    │ └───────────── Disconnecting ◄── close(), LD, T401 give-up ◄──┘
//!    └────────── outbound drained ───────┘
//! ```
//!
//! Sending is stop-and-wait: one LT is outstanding at a time and T401
//! retransmits it unchanged until the matching LA arrives.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;

use super::frame::{LinkFrame, DISCONNECT_USER_REQUEST, LR_DEFAULT_MAX_INFO};
use super::scanner::{FrameScanner, CRC_BAD};
use crate::buffer::{ChunkBuffer, CircleBuffer};
use crate::config::{InactivityPolicy, LinkConfig};
use crate::error::{DockError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    /// LR sent, waiting for the peer's LR.
    Requesting,
    /// LR exchanged, parameters being agreed.
    Negotiating,
    Active,
    /// LD queued, waiting for it to reach the transport.
    Disconnecting,
}

/// Which side opened the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer sent LD.
    PeerRequest,
    /// `close()` was called.
    LocalRequest,
    /// T401 expired too many times in a row.
    RetransmitLimit { retries: u32 },
    /// T403 expired under [`InactivityPolicy::Disconnect`].
    Inactivity,
    /// The transport reached end of stream or failed.
    TransportClosed,
    /// The endpoint stopped after an internal error, which is delivered to
    /// the receiver ahead of the disconnect.
    Failed,
}

impl DisconnectReason {
    /// Error surfaced to callers blocked on the link.
    pub fn to_error(self) -> DockError {
        match self {
            DisconnectReason::RetransmitLimit { retries } => DockError::LinkTimeout { retries },
            _ => DockError::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected(DisconnectReason),
}

/// Counters since the engine was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub retransmits: u64,
    pub crc_errors: u64,
    pub duplicates: u64,
    pub sequence_errors: u64,
    pub malformed: u64,
    pub bytes_sent: u64,
    pub bytes_delivered: u64,
}

pub struct LinkEngine {
    config: LinkConfig,
    state: LinkState,
    role: Role,

    scanner: FrameScanner,
    /// Transport bytes not yet moved into `raw`.
    inbound: ChunkBuffer,
    raw: CircleBuffer,
    /// Unescaped frame bodies, one marker per frame.
    frames: CircleBuffer,
    /// Escaped frames waiting for the transport.
    outbound: ChunkBuffer,
    /// Application bytes waiting to be packetized.
    pending_tx: ChunkBuffer,
    pending_tx_len: usize,
    delivered: ChunkBuffer,
    delivered_len: usize,
    events: VecDeque<LinkEvent>,

    tx_sequence: u8,
    rx_sequence: u8,
    prev_rx_sequence: u8,
    /// Last reliable frame (LR, LN or LT) awaiting acknowledgement.
    outstanding: Option<Bytes>,
    retries: u32,
    packet_size: usize,
    peer_window: u8,

    /// T401
    ack_deadline: Option<Instant>,
    /// T403
    inactivity_deadline: Option<Instant>,
    disconnect_reason: Option<DisconnectReason>,
    stats: LinkStats,
}

impl LinkEngine {
    pub fn new(config: LinkConfig) -> Result<Self> {
        config.validate()?;
        let raw = CircleBuffer::allocate(config.rx_buffer_size, 0)?;
        let frames = CircleBuffer::allocate(config.rx_buffer_size, config.marker_count)?;
        Ok(Self {
            state: LinkState::Idle,
            role: Role::Responder,
            scanner: FrameScanner::new(),
            inbound: ChunkBuffer::new(),
            raw,
            frames,
            outbound: ChunkBuffer::new(),
            pending_tx: ChunkBuffer::new(),
            pending_tx_len: 0,
            delivered: ChunkBuffer::new(),
            delivered_len: 0,
            events: VecDeque::new(),
            tx_sequence: 0,
            rx_sequence: 0,
            prev_rx_sequence: 0,
            outstanding: None,
            retries: 0,
            packet_size: config.max_packet_size,
            peer_window: 1,
            ack_deadline: None,
            inactivity_deadline: None,
            disconnect_reason: None,
            stats: LinkStats::default(),
            config,
        })
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_live(&self) -> bool {
        self.state == LinkState::Active
    }

    pub fn is_ack_pending(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Negotiated LT data size.
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Window advertised by the peer in its LR.
    pub fn peer_window(&self) -> u8 {
        self.peer_window
    }

    pub fn tx_sequence(&self) -> u8 {
        self.tx_sequence
    }

    pub fn rx_sequence(&self) -> u8 {
        self.rx_sequence
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// Application bytes not yet packetized.
    pub fn queued_len(&self) -> usize {
        self.pending_tx_len
    }

    /// Whether queued application bytes are still waiting for an LA.
    pub fn has_unacknowledged(&self) -> bool {
        self.pending_tx_len > 0 || self.outstanding.is_some()
    }

    fn reset_session(&mut self) {
        self.tx_sequence = 0;
        self.rx_sequence = 0;
        self.prev_rx_sequence = 0;
        self.outstanding = None;
        self.retries = 0;
        self.ack_deadline = None;
        self.inactivity_deadline = None;
        self.packet_size = self.config.max_packet_size;
        self.disconnect_reason = None;
    }

    /// Start the link as the initiating side.
    pub fn open(&mut self, now: Instant) -> Result<()> {
        if !matches!(self.state, LinkState::Idle | LinkState::Disconnecting) {
            return Ok(());
        }
        self.reset_session();
        self.role = Role::Initiator;
        self.state = LinkState::Requesting;
        tracing::debug!("link: sending LR");
        let request = self.request_frame();
        self.transmit_reliable(request, now)
    }

    /// Send LD and drop the link.
    pub fn close(&mut self) -> Result<()> {
        if self.disconnect_reason.is_some() || self.state == LinkState::Idle {
            return Ok(());
        }
        self.disconnect(DisconnectReason::LocalRequest)
    }

    fn request_frame(&self) -> LinkFrame {
        LinkFrame::Request {
            window: self.config.window,
            max_info: LR_DEFAULT_MAX_INFO,
        }
    }

    fn transmit(&mut self, frame: &LinkFrame) -> Result<Bytes> {
        let wire = frame.to_wire();
        self.outbound.write(&wire)?;
        self.stats.frames_sent += 1;
        tracing::trace!(
            "link: sent {} seq {} ({} bytes)",
            frame.kind().name(),
            frame.sequence(),
            wire.len()
        );
        Ok(wire)
    }

    fn transmit_reliable(&mut self, frame: LinkFrame, now: Instant) -> Result<()> {
        let wire = self.transmit(&frame)?;
        self.outstanding = Some(wire);
        self.retries = 0;
        self.ack_deadline = Some(now + self.config.ack_timeout);
        Ok(())
    }

    fn send_ack(&mut self) -> Result<()> {
        let ack = LinkFrame::Ack {
            sequence: self.rx_sequence,
            credit: self.config.window,
        };
        self.transmit(&ack).map(|_| ())
    }

    fn arm_inactivity(&mut self, now: Instant) {
        self.inactivity_deadline = Some(now + self.config.inactivity_timeout);
    }

    /// Queue application bytes for reliable delivery.
    ///
    /// Bytes queued before the link is active are sent once it comes up.
    pub fn send(&mut self, data: &[u8], now: Instant) -> Result<()> {
        if let Some(reason) = self.disconnect_reason {
            return Err(reason.to_error());
        }
        self.pending_tx_len += self.pending_tx.write(data)?;
        self.pump(now)
    }

    /// Send the next packet if nothing is outstanding.
    fn pump(&mut self, now: Instant) -> Result<()> {
        if self.state != LinkState::Active || self.outstanding.is_some() {
            return Ok(());
        }
        if self.pending_tx_len == 0 {
            return Ok(());
        }
        let n = self.pending_tx_len.min(self.packet_size);
        let mut packet = vec![0u8; n];
        let n = self.pending_tx.read(&mut packet);
        packet.truncate(n);
        self.pending_tx_len -= n;

        self.tx_sequence = self.tx_sequence.wrapping_add(1);
        self.stats.bytes_sent += n as u64;
        let frame = LinkFrame::Transfer {
            sequence: self.tx_sequence,
            data: Bytes::from(packet),
        };
        self.transmit_reliable(frame, now)
    }

    /// Feed raw transport bytes.
    pub fn receive(&mut self, data: &[u8], now: Instant) -> Result<()> {
        self.inbound.write(data)?;
        loop {
            let mut remaining = self.inbound.size();
            if remaining > 0 {
                self.raw
                    .copy_in_from_chunks(&mut self.inbound, &mut remaining)?;
            }
            while self.scanner.scan(&mut self.raw, &mut self.frames)? {
                self.process_frames(now)?;
            }
            if self.inbound.is_empty() {
                return Ok(());
            }
        }
    }

    fn process_frames(&mut self, now: Instant) -> Result<()> {
        while let Some(marker) = self.frames.peek_next_marker() {
            if marker.aux == CRC_BAD {
                self.frames.flush_to_next_marker()?;
                self.stats.crc_errors += 1;
                tracing::debug!("link: dropped frame with bad CRC");
                continue;
            }
            let (len, _) = self.frames.buffer_count_to_next_marker();
            let mut body = vec![0u8; len];
            self.frames.copy_out(&mut body)?;
            self.stats.frames_received += 1;

            match LinkFrame::parse(Bytes::from(body)) {
                Ok(frame) => self.handle_frame(frame, now)?,
                Err(e) => {
                    self.stats.malformed += 1;
                    tracing::warn!("link: dropped malformed frame: {}", e);
                }
            }
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: LinkFrame, now: Instant) -> Result<()> {
        tracing::trace!(
            "link: received {} seq {} in {:?}",
            frame.kind().name(),
            frame.sequence(),
            self.state
        );
        if matches!(self.state, LinkState::Negotiating | LinkState::Active) {
            self.arm_inactivity(now);
        }

        match frame {
            LinkFrame::Request { window, max_info } => self.on_request(window, max_info, now),
            LinkFrame::Negotiate {
                sequence,
                packet_size,
            } => self.on_negotiate(sequence, packet_size, now),
            LinkFrame::NegotiateAck { packet_size, .. } => {
                self.on_negotiate_ack(packet_size, now)
            }
            LinkFrame::Transfer { sequence, data } => self.on_transfer(sequence, data, now),
            LinkFrame::Ack { sequence, .. } => self.on_ack(sequence, now),
            LinkFrame::Disconnect { reason } => {
                if matches!(self.state, LinkState::Idle | LinkState::Disconnecting) {
                    return Ok(());
                }
                tracing::debug!("link: peer disconnected (reason {:#04x})", reason);
                self.teardown(DisconnectReason::PeerRequest);
                Ok(())
            }
        }
    }

    fn on_request(&mut self, window: u8, max_info: u16, now: Instant) -> Result<()> {
        match (self.state, self.role) {
            (LinkState::Requesting, _) => {
                self.peer_window = window;
                self.state = LinkState::Negotiating;
                self.arm_inactivity(now);
                tracing::debug!("link: LR answered, negotiating");
                let offer = LinkFrame::Negotiate {
                    sequence: 0,
                    packet_size: self.config.max_packet_size as u16,
                };
                self.transmit_reliable(offer, now)
            }
            (LinkState::Negotiating, Role::Initiator) | (LinkState::Disconnecting, _) => Ok(()),
            (LinkState::Negotiating, Role::Responder) => {
                // Our LR reply was lost.
                let reply = self.request_frame();
                self.transmit(&reply).map(|_| ())
            }
            (LinkState::Idle, _) | (LinkState::Active, _) => {
                if self.state == LinkState::Active {
                    tracing::debug!("link: peer restarted the link");
                }
                self.reset_session();
                self.role = Role::Responder;
                self.peer_window = window;
                self.state = LinkState::Negotiating;
                self.arm_inactivity(now);
                tracing::debug!(
                    "link: LR received (window {}, N401 {}), replying",
                    window,
                    max_info
                );
                let reply = self.request_frame();
                self.transmit(&reply).map(|_| ())
            }
        }
    }

    fn on_negotiate(&mut self, sequence: u8, offered: u16, now: Instant) -> Result<()> {
        if !matches!(self.state, LinkState::Negotiating | LinkState::Active) {
            return Ok(());
        }
        self.packet_size = self.config.max_packet_size.min(usize::from(offered.max(1)));
        let accept = LinkFrame::NegotiateAck {
            sequence,
            packet_size: self.packet_size as u16,
        };
        self.transmit(&accept)?;
        if self.state == LinkState::Negotiating {
            self.activate(now)?;
        }
        Ok(())
    }

    fn on_negotiate_ack(&mut self, accepted: u16, now: Instant) -> Result<()> {
        if self.state != LinkState::Negotiating || self.role != Role::Initiator {
            return Ok(());
        }
        self.packet_size = self.config.max_packet_size.min(usize::from(accepted.max(1)));
        self.outstanding = None;
        self.ack_deadline = None;
        self.retries = 0;
        self.activate(now)
    }

    fn activate(&mut self, now: Instant) -> Result<()> {
        self.state = LinkState::Active;
        self.arm_inactivity(now);
        self.events.push_back(LinkEvent::Connected);
        tracing::debug!(
            "link: active ({:?}, packet size {})",
            self.role,
            self.packet_size
        );
        self.pump(now)
    }

    fn on_transfer(&mut self, sequence: u8, data: Bytes, now: Instant) -> Result<()> {
        if self.state == LinkState::Negotiating && self.role == Role::Responder {
            self.activate(now)?;
        }
        if self.state != LinkState::Active {
            tracing::warn!("link: LT seq {} while {:?}, dropped", sequence, self.state);
            return Ok(());
        }

        let expected = self.rx_sequence.wrapping_add(1);
        if sequence == expected {
            self.prev_rx_sequence = self.rx_sequence;
            self.rx_sequence = sequence;
            self.delivered_len += self.delivered.write(&data)?;
            self.stats.bytes_delivered += data.len() as u64;
            self.send_ack()
        } else if sequence == self.rx_sequence {
            // The LA for this frame was lost; acknowledge it again.
            self.stats.duplicates += 1;
            tracing::debug!("link: duplicate LT seq {}, re-acknowledging", sequence);
            self.send_ack()
        } else {
            self.stats.sequence_errors += 1;
            tracing::warn!(
                "link: {} (previous {}), dropped",
                DockError::SequenceError {
                    expected,
                    got: sequence
                },
                self.prev_rx_sequence
            );
            Ok(())
        }
    }

    fn on_ack(&mut self, sequence: u8, now: Instant) -> Result<()> {
        if self.state == LinkState::Negotiating && self.role == Role::Responder {
            self.activate(now)?;
        }
        if self.state != LinkState::Active {
            return Ok(());
        }
        if self.outstanding.is_some() && sequence == self.tx_sequence {
            self.outstanding = None;
            self.ack_deadline = None;
            self.retries = 0;
            return self.pump(now);
        }
        tracing::trace!("link: LA seq {} does not release anything", sequence);
        Ok(())
    }

    fn teardown(&mut self, reason: DisconnectReason) {
        self.state = LinkState::Idle;
        self.outstanding = None;
        self.ack_deadline = None;
        self.inactivity_deadline = None;
        self.pending_tx.flush();
        self.pending_tx_len = 0;
        self.disconnect_reason = Some(reason);
        self.events.push_back(LinkEvent::Disconnected(reason));
    }

    fn disconnect(&mut self, reason: DisconnectReason) -> Result<()> {
        self.transmit(&LinkFrame::Disconnect {
            reason: DISCONNECT_USER_REQUEST,
        })?;
        self.teardown(reason);
        self.state = LinkState::Disconnecting;
        Ok(())
    }

    /// Earliest armed timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.ack_deadline, self.inactivity_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire every timer due at `now`.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if self.ack_deadline.is_some_and(|d| now >= d) {
            self.on_ack_timeout(now)?;
        }
        if self.inactivity_deadline.is_some_and(|d| now >= d) {
            self.on_inactivity_timeout(now)?;
        }
        Ok(())
    }

    fn on_ack_timeout(&mut self, now: Instant) -> Result<()> {
        let Some(wire) = self.outstanding.clone() else {
            self.ack_deadline = None;
            return Ok(());
        };
        if self.retries >= self.config.max_retransmits {
            tracing::error!(
                "link: no acknowledgement after {} retransmissions, giving up",
                self.retries
            );
            return self.disconnect(DisconnectReason::RetransmitLimit {
                retries: self.retries,
            });
        }
        self.retries += 1;
        self.stats.retransmits += 1;
        self.stats.frames_sent += 1;
        self.outbound.write(&wire)?;
        self.ack_deadline = Some(now + self.config.ack_timeout);
        tracing::debug!(
            "link: T401 expired, retransmitting ({}/{})",
            self.retries,
            self.config.max_retransmits
        );
        Ok(())
    }

    fn on_inactivity_timeout(&mut self, now: Instant) -> Result<()> {
        match (self.state, self.config.inactivity_policy) {
            (LinkState::Active, InactivityPolicy::KeepAlive) => {
                tracing::trace!("link: T403 expired, sending keep-alive");
                self.arm_inactivity(now);
                self.send_ack()
            }
            (LinkState::Active, InactivityPolicy::Disconnect) | (LinkState::Negotiating, _) => {
                tracing::debug!("link: T403 expired in {:?}, disconnecting", self.state);
                self.disconnect(DisconnectReason::Inactivity)
            }
            _ => {
                self.inactivity_deadline = None;
                Ok(())
            }
        }
    }

    /// Escaped frames ready for the transport.
    pub fn take_outbound(&mut self) -> Option<Bytes> {
        let n = self.outbound.size();
        if n == 0 {
            if self.state == LinkState::Disconnecting {
                self.state = LinkState::Idle;
            }
            return None;
        }
        let mut out = vec![0u8; n];
        self.outbound.read(&mut out);
        if self.state == LinkState::Disconnecting {
            self.state = LinkState::Idle;
        }
        Some(Bytes::from(out))
    }

    /// Application bytes accepted in sequence since the last call.
    pub fn take_delivered(&mut self) -> Option<Bytes> {
        if self.delivered_len == 0 {
            return None;
        }
        let mut out = vec![0u8; self.delivered_len];
        let n = self.delivered.read(&mut out);
        out.truncate(n);
        self.delivered_len = 0;
        Some(Bytes::from(out))
    }

    pub fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }
}

impl std::fmt::Debug for LinkEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkEngine")
            .field("state", &self.state)
            .field("role", &self.role)
            .field("tx_sequence", &self.tx_sequence)
            .field("rx_sequence", &self.rx_sequence)
            .field("ack_pending", &self.outstanding.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn engine() -> LinkEngine {
        LinkEngine::new(LinkConfig::default()).unwrap()
    }

    /// Move outbound bytes between the engines until both are quiet.
    fn shuttle(a: &mut LinkEngine, b: &mut LinkEngine, now: Instant) {
        loop {
            let mut moved = false;
            if let Some(bytes) = a.take_outbound() {
                b.receive(&bytes, now).unwrap();
                moved = true;
            }
            if let Some(bytes) = b.take_outbound() {
                a.receive(&bytes, now).unwrap();
                moved = true;
            }
            if !moved {
                break;
            }
        }
    }

    fn connected_pair(now: Instant) -> (LinkEngine, LinkEngine) {
        let mut a = engine();
        let mut b = engine();
        a.open(now).unwrap();
        shuttle(&mut a, &mut b, now);
        assert_eq!(a.poll_event(), Some(LinkEvent::Connected));
        assert_eq!(b.poll_event(), Some(LinkEvent::Connected));
        (a, b)
    }

    fn drain_delivered(engine: &mut LinkEngine) -> Vec<u8> {
        engine
            .take_delivered()
            .map(|b| b.to_vec())
            .unwrap_or_default()
    }

    #[test]
    fn test_handshake_activates_both_sides() {
        let now = Instant::now();
        let (a, b) = connected_pair(now);

        assert_eq!(a.state(), LinkState::Active);
        assert_eq!(b.state(), LinkState::Active);
        assert_eq!(a.role(), Role::Initiator);
        assert_eq!(b.role(), Role::Responder);
        assert_eq!(b.peer_window(), 8);
        assert!(!a.is_ack_pending());
        assert_eq!(a.next_deadline(), Some(now + Duration::from_secs(30)));
    }

    #[test]
    fn test_data_is_packetized_and_reassembled() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(now);
        let data: Vec<u8> = (0..700u32).map(|i| (i % 251) as u8).collect();

        a.send(&data, now).unwrap();
        shuttle(&mut a, &mut b, now);

        assert_eq!(drain_delivered(&mut b), data);
        assert_eq!(a.tx_sequence(), 3);
        assert_eq!(b.rx_sequence(), 3);
        assert!(!a.has_unacknowledged());
    }

    #[test]
    fn test_bytes_fed_one_at_a_time() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(now);

        a.send(&[0x10, 0x10, 0x03, 0x16], now).unwrap();
        let wire = a.take_outbound().unwrap();
        for byte in wire.iter() {
            b.receive(&[*byte], now).unwrap();
        }

        assert_eq!(drain_delivered(&mut b), vec![0x10, 0x10, 0x03, 0x16]);
    }

    #[test]
    fn test_corrupt_crc_is_dropped_then_retransmission_accepted() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(now);

        a.send(b"hello", now).unwrap();
        let mut wire = a.take_outbound().unwrap().to_vec();
        let last = wire.len() - 1;
        wire[last] ^= 0x5A;

        b.receive(&wire, now).unwrap();
        assert!(b.take_delivered().is_none());
        assert!(b.take_outbound().is_none());
        assert_eq!(b.stats().crc_errors, 1);
        assert!(a.is_ack_pending());

        let later = now + Duration::from_secs(1);
        a.handle_timeout(later).unwrap();
        assert_eq!(a.stats().retransmits, 1);
        shuttle(&mut a, &mut b, later);

        assert_eq!(drain_delivered(&mut b), b"hello");
        assert!(!a.is_ack_pending());
    }

    #[test]
    fn test_duplicate_lt_delivered_once_acked_twice() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(now);

        a.send(b"x", now).unwrap();
        let lt = a.take_outbound().unwrap();

        b.receive(&lt, now).unwrap();
        let first_ack = b.take_outbound().unwrap();
        assert_eq!(drain_delivered(&mut b), b"x");

        // First LA lost; the same LT arrives again.
        b.receive(&lt, now).unwrap();
        let second_ack = b.take_outbound().unwrap();
        assert!(b.take_delivered().is_none());
        assert_eq!(first_ack, second_ack);
        assert_eq!(b.stats().duplicates, 1);

        a.receive(&second_ack, now).unwrap();
        assert!(!a.is_ack_pending());
    }

    #[test]
    fn test_sequence_gap_is_dropped_without_ack() {
        let now = Instant::now();
        let (_, mut b) = connected_pair(now);

        let lt = LinkFrame::Transfer {
            sequence: 3,
            data: Bytes::from_static(b"late"),
        };
        b.receive(&lt.to_wire(), now).unwrap();

        assert!(b.take_delivered().is_none());
        assert!(b.take_outbound().is_none());
        assert_eq!(b.stats().sequence_errors, 1);
    }

    #[test]
    fn test_retransmit_limit_fails_link() {
        let config = LinkConfig {
            max_retransmits: 2,
            ..LinkConfig::default()
        };
        let mut a = LinkEngine::new(config).unwrap();
        let start = Instant::now();
        a.open(start).unwrap();

        for i in 1..=3u64 {
            let deadline = a.next_deadline().unwrap();
            assert_eq!(deadline, start + Duration::from_secs(i));
            a.handle_timeout(deadline).unwrap();
        }

        assert_eq!(
            a.poll_event(),
            Some(LinkEvent::Disconnected(DisconnectReason::RetransmitLimit {
                retries: 2
            }))
        );
        assert_eq!(a.state(), LinkState::Disconnecting);
        assert!(a.take_outbound().is_some());
        assert_eq!(a.state(), LinkState::Idle);
        assert!(matches!(
            a.send(b"x", start),
            Err(DockError::LinkTimeout { retries: 2 })
        ));
    }

    #[test]
    fn test_inactivity_keep_alive() {
        let now = Instant::now();
        let (mut a, _b) = connected_pair(now);

        let later = now + Duration::from_secs(30);
        a.handle_timeout(later).unwrap();

        assert_eq!(a.state(), LinkState::Active);
        let tickle = a.take_outbound().unwrap();
        assert_eq!(
            tickle,
            LinkFrame::Ack {
                sequence: 0,
                credit: 8
            }
            .to_wire()
        );
        assert_eq!(a.next_deadline(), Some(later + Duration::from_secs(30)));
    }

    #[test]
    fn test_inactivity_disconnect_policy() {
        let now = Instant::now();
        let config = LinkConfig {
            inactivity_policy: InactivityPolicy::Disconnect,
            ..LinkConfig::default()
        };
        let mut a = LinkEngine::new(config).unwrap();
        let mut b = engine();
        a.open(now).unwrap();
        shuttle(&mut a, &mut b, now);
        a.poll_event();
        b.poll_event();

        a.handle_timeout(now + Duration::from_secs(30)).unwrap();
        assert_eq!(
            a.poll_event(),
            Some(LinkEvent::Disconnected(DisconnectReason::Inactivity))
        );
        shuttle(&mut a, &mut b, now);
        assert_eq!(
            b.poll_event(),
            Some(LinkEvent::Disconnected(DisconnectReason::PeerRequest))
        );
    }

    #[test]
    fn test_close_notifies_peer() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(now);

        a.close().unwrap();
        shuttle(&mut a, &mut b, now);

        assert_eq!(a.state(), LinkState::Idle);
        assert_eq!(b.state(), LinkState::Idle);
        assert_eq!(
            b.poll_event(),
            Some(LinkEvent::Disconnected(DisconnectReason::PeerRequest))
        );
        assert!(matches!(a.send(b"x", now), Err(DockError::Disconnected)));
    }

    #[test]
    fn test_legacy_peer_skips_negotiation() {
        let now = Instant::now();
        let mut b = engine();

        let lr = LinkFrame::Request {
            window: 1,
            max_info: 64,
        };
        b.receive(&lr.to_wire(), now).unwrap();
        assert_eq!(b.state(), LinkState::Negotiating);
        assert!(b.take_outbound().is_some());

        let lt = LinkFrame::Transfer {
            sequence: 1,
            data: Bytes::from_static(b"newt"),
        };
        b.receive(&lt.to_wire(), now).unwrap();

        assert_eq!(b.state(), LinkState::Active);
        assert_eq!(b.poll_event(), Some(LinkEvent::Connected));
        assert_eq!(drain_delivered(&mut b), b"newt");
    }

    #[test]
    fn test_data_queued_before_activation_is_sent() {
        let now = Instant::now();
        let mut a = engine();
        let mut b = engine();
        a.open(now).unwrap();
        a.send(b"early", now).unwrap();
        shuttle(&mut a, &mut b, now);

        assert_eq!(drain_delivered(&mut b), b"early");
    }

    #[test]
    fn test_negotiation_picks_smaller_packet_size() {
        let now = Instant::now();
        let config = LinkConfig {
            max_packet_size: 64,
            ..LinkConfig::default()
        };
        let mut a = LinkEngine::new(config).unwrap();
        let mut b = engine();
        a.open(now).unwrap();
        shuttle(&mut a, &mut b, now);

        assert_eq!(a.packet_size(), 64);
        assert_eq!(b.packet_size(), 64);

        b.send(&[7u8; 130], now).unwrap();
        shuttle(&mut a, &mut b, now);
        assert_eq!(b.tx_sequence(), 3);
        assert_eq!(drain_delivered(&mut a), vec![7u8; 130]);
    }

    #[test]
    fn test_sequence_wraps_from_255_to_0() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(now);
        let mut received = Vec::new();

        for i in 0..300u32 {
            a.send(&i.to_be_bytes(), now).unwrap();
            shuttle(&mut a, &mut b, now);
            received.extend(drain_delivered(&mut b));
            if i == 254 {
                assert_eq!(a.tx_sequence(), 255);
                assert_eq!(b.rx_sequence(), 255);
            }
            if i == 255 {
                assert_eq!(a.tx_sequence(), 0);
                assert_eq!(b.rx_sequence(), 0);
            }
        }

        let expected: Vec<u8> = (0..300u32).flat_map(u32::to_be_bytes).collect();
        assert_eq!(received, expected);
        assert_eq!(a.tx_sequence(), (300 % 256) as u8);
        assert_eq!(b.rx_sequence(), (300 % 256) as u8);
        assert_eq!(b.stats().sequence_errors, 0);
        assert_eq!(b.stats().duplicates, 0);
        assert!(!a.has_unacknowledged());
    }
}
