//! Reliable, congestion-controlled UDP transport shared by the zelty
//! server and client.
//!
//! One socket serves all peers. Every non-ACK packet is acknowledged;
//! reliable sends are tracked in a per-peer unacked map and retransmitted
//! on an RFC 6298 timeout by a 100 ms management task. Small frames
//! addressed to the same peer are coalesced into single datagrams.

pub mod aggregation;
pub mod connection;
mod endpoint;

pub use connection::{ClientConnection, ConnectionState, RttEstimator};
pub use endpoint::{PeerSnapshot, TransportEvent, TransportStatsSnapshot, UdpEndpoint};

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("invalid packet: {0}")]
    InvalidPacket(#[source] zelty_types::ZeltyTypesError),
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("packet too large for one datagram")]
    PacketTooLarge,
    #[error("socket error: {0}")]
    SocketError(#[from] std::io::Error),
    #[error("timed out")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Endpoint tuning knobs. The defaults are the documented protocol
/// defaults.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Peers silent for longer than this are removed, ms.
    pub timeout_ms: u64,
    /// Retransmissions per reliable packet before it is dropped.
    pub max_retries: u32,
    /// Upper bound on reliable packets in flight per peer.
    pub max_packets_in_flight: usize,
    pub use_packet_aggregation: bool,
    pub aggregation_time_ms: u64,
    pub max_aggregation_size: usize,
    pub congestion_control: bool,
    /// Period of the retransmission/timeout/flush task, ms.
    pub management_tick_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_ms: zelty_types::CONNECTION_TIMEOUT_MS,
            max_retries: 5,
            max_packets_in_flight: 32,
            use_packet_aggregation: true,
            aggregation_time_ms: 10,
            max_aggregation_size: 8192,
            congestion_control: true,
            management_tick_ms: 100,
        }
    }
}
