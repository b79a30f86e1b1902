pub mod retry;
pub mod udp;
pub mod wire;

pub use retry::RetryPolicy;
pub use udp::{
    run_publisher, PublisherStats, PublisherStatsSnapshot, SendError, Transport, UdpPublisher,
    UdpTransport,
};
pub use wire::{EncodeError, Encoded, WireEncoder};
