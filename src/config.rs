//! Endpoint configuration.
//!
//! Every section has legacy defaults and can be partially overridden from
//! JSON. Durations use humantime strings (`"1s"`, `"250ms"`).
//!
//! ```
//! use newtdock::config::EndpointConfig;
//!
//! let config = EndpointConfig::from_json(r#"{ "link": { "max_retransmits": 3 } }"#).unwrap();
//! assert_eq!(config.link.max_retransmits, 3);
//! assert_eq!(config.link.max_packet_size, 256);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DockError, Result};
use crate::link::MAX_PACKET_SIZE;

/// How bytes are framed on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Events go straight onto a reliable, ordered stream (TCP).
    #[default]
    Raw,
    /// Events ride on the MNP link layer (serial lines, emulators).
    Mnp,
}

/// What to do when T403 fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InactivityPolicy {
    /// Send an LA tickle and keep the link up.
    #[default]
    KeepAlive,
    /// Send LD and tear the link down.
    Disconnect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub framing: Framing,
    /// Default wait for `receive_event` when no explicit timeout is given.
    #[serde(with = "humantime_serde")]
    pub receive_timeout: Duration,
    pub link: LinkConfig,
    pub event: EventConfig,
    pub writer: WriterConfig,
}

/// Link layer timers and sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// T401: wait for an acknowledgement before retransmitting.
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
    /// Consecutive T401 retransmissions before the link is declared dead.
    pub max_retransmits: u32,
    /// T403: idle time before the inactivity policy applies.
    #[serde(with = "humantime_serde")]
    pub inactivity_timeout: Duration,
    pub inactivity_policy: InactivityPolicy,
    /// Largest LT data field offered during negotiation.
    pub max_packet_size: usize,
    /// Receive window advertised in LR.
    pub window: u8,
    /// Size of the raw inbound ring and of the frame ring.
    pub rx_buffer_size: usize,
    /// Frames that may be queued in the frame ring.
    pub marker_count: usize,
}

/// Dock event codec limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Largest payload accepted from the peer.
    pub max_payload_size: u32,
    /// Segment size used when streaming an indeterminate payload.
    pub stream_segment_size: usize,
}

/// Outbound writer task settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Pages queued for the transport before senders wait.
    pub max_pending_pages: usize,
    pub channel_capacity: usize,
    /// How long a sender waits for the queue to drain.
    #[serde(with = "humantime_serde")]
    pub backpressure_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            framing: Framing::Raw,
            receive_timeout: Duration::from_secs(30),
            link: LinkConfig::default(),
            event: EventConfig::default(),
            writer: WriterConfig::default(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(1),
            max_retransmits: 8,
            inactivity_timeout: Duration::from_secs(30),
            inactivity_policy: InactivityPolicy::KeepAlive,
            max_packet_size: MAX_PACKET_SIZE,
            window: 8,
            rx_buffer_size: 4096,
            marker_count: 16,
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 16 * 1024 * 1024,
            stream_segment_size: 240,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_pages: 1024,
            channel_capacity: 1024,
            backpressure_timeout: Duration::from_secs(5),
        }
    }
}

impl EndpointConfig {
    /// Parse a (possibly partial) JSON document and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.link.validate()?;
        if self.event.stream_segment_size == 0 {
            return Err(DockError::Config(
                "event.stream_segment_size must be non-zero".into(),
            ));
        }
        if self.writer.max_pending_pages == 0 || self.writer.channel_capacity == 0 {
            return Err(DockError::Config(
                "writer queue limits must be non-zero".into(),
            ));
        }
        // Reserved pages must always fit in the channel.
        if self.writer.channel_capacity < self.writer.max_pending_pages {
            return Err(DockError::Config(format!(
                "writer.channel_capacity {} is below writer.max_pending_pages {}",
                self.writer.channel_capacity, self.writer.max_pending_pages
            )));
        }
        Ok(())
    }
}

impl LinkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_packet_size == 0 || self.max_packet_size > MAX_PACKET_SIZE {
            return Err(DockError::Config(format!(
                "link.max_packet_size must be within 1..={}, got {}",
                MAX_PACKET_SIZE, self.max_packet_size
            )));
        }
        if self.max_retransmits == 0 {
            return Err(DockError::Config(
                "link.max_retransmits must be non-zero".into(),
            ));
        }
        // The frame ring must hold at least one worst-case frame.
        if self.rx_buffer_size <= self.max_packet_size * 2 + 16 {
            return Err(DockError::Config(format!(
                "link.rx_buffer_size {} too small for packet size {}",
                self.rx_buffer_size, self.max_packet_size
            )));
        }
        if self.marker_count == 0 {
            return Err(DockError::Config(
                "link.marker_count must be non-zero".into(),
            ));
        }
        if self.ack_timeout.is_zero() {
            return Err(DockError::Config(
                "link.ack_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(EndpointConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EndpointConfig::from_json(
            r#"{
                "framing": "mnp",
                "link": { "ack_timeout": "250ms", "inactivity_policy": "disconnect" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.framing, Framing::Mnp);
        assert_eq!(config.link.ack_timeout, Duration::from_millis(250));
        assert_eq!(config.link.inactivity_policy, InactivityPolicy::Disconnect);
        assert_eq!(config.link.max_retransmits, 8);
        assert_eq!(config.event.stream_segment_size, 240);
    }

    #[test]
    fn test_rejects_oversize_packet() {
        let result = EndpointConfig::from_json(r#"{ "link": { "max_packet_size": 512 } }"#);
        assert!(matches!(result, Err(DockError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_retransmits() {
        let mut config = EndpointConfig::default();
        config.link.max_retransmits = 0;
        assert!(matches!(config.validate(), Err(DockError::Config(_))));
    }

    #[test]
    fn test_rejects_channel_smaller_than_pending_limit() {
        let result = EndpointConfig::from_json(
            r#"{ "writer": { "max_pending_pages": 64, "channel_capacity": 8 } }"#,
        );
        assert!(matches!(result, Err(DockError::Config(_))));
    }

    #[test]
    fn test_rejects_malformed_json() {
        let result = EndpointConfig::from_json("{ link: ");
        assert!(matches!(result, Err(DockError::Json(_))));
    }
}
