use std::time::Duration;

use crate::{
    config,
    network::{
        self, conn,
        packet::{self, v4::ConnectReturnCode, PacketType},
    },
    protocol::state::ConnectionState,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Connect failed: {0}")]
    Connect(#[from] ConnectError),
    #[error("Operation {operation} is not allowed in state {state:?}")]
    ProtocolState {
        state: ConnectionState,
        operation: &'static str,
    },
    #[error("Malformed packet: {0}")]
    MalformedPacket(#[from] packet::Error),
    #[error("Unexpected packet from broker: {0:?}")]
    UnexpectedPacket(PacketType),
    #[error("Delivery of packet {0} timed out")]
    DeliveryTimeout(u16),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),
    #[error("No packet id available")]
    PacketIdsExhausted,
    #[error("Network error: {0}")]
    Network(#[from] network::Error),
    #[error("Config error: {0}")]
    Config(#[from] config::Error),
}

/// 握手阶段的错误
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Refused by broker: {0:?}")]
    Refused(ConnectReturnCode),
    #[error("No connack within {0:?}")]
    Timeout(Duration),
    #[error("Network: {0}")]
    Network(network::Error),
}

impl From<conn::Error> for Error {
    fn from(e: conn::Error) -> Self {
        match e {
            conn::Error::Packet(e) => Error::MalformedPacket(e),
            e => Error::Network(network::Error::Connection(e)),
        }
    }
}
