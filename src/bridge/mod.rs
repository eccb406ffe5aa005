//! Transport bridge - channel selection and command/result correlation.

mod pending;
mod transport_bridge;

pub use pending::PendingResult;
pub use transport_bridge::{
    BridgeConfig, BridgeStats, Channel, ChannelStatus, TransportBridge,
};
