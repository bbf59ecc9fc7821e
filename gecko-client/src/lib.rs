//! 一个异步 mqtt 3.1.1 客户端库
//!
//! * 连接管理：connect/disconnect，断线后按退避策略自动重连
//! * 会话管理：订阅恢复，QoS1/QoS2 飞行中消息的重发与重放
//! * 通过 [`Callback`] 接收消息与连接事件

use async_trait::async_trait;
use bytes::Bytes;

pub use client::{Client, Delivery, Health, HealthStatus};
pub use config::ClientConfig;
pub use error::{ConnectError, Error};
pub use network::packet::{
    v4::{ConnectReturnCode, Publish, SubscribeFilter, SubscribeReasonCode},
    QoS,
};
pub use protocol::{delivery::AckHandle, state::ConnectionState};

mod client;
pub mod config;
pub mod error;
mod eventloop;
pub mod network;
mod protocol;

/// 收到的应用消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl From<&Publish> for Message {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
        }
    }
}

/// 连接断开的原因
#[derive(Debug)]
pub enum DisconnectReason {
    /// 用户调用 disconnect
    Requested,
    /// 网络断开或协议错误
    ConnectionLost(Error),
    /// 重连时服务端拒绝连接，不再重试
    Refused(ConnectReturnCode),
}

/// mqtt 事件发生时的回调，由用户实现
/// 所有回调都在事件循环中执行，耗时操作请自行 spawn
#[async_trait]
pub trait Callback: Send + Sync + 'static {
    /// 收到消息，在回复 puback/pubrec 之前调用
    async fn on_message(&self, message: Message);
    /// 开启手动确认时收到 QoS1/QoS2 消息
    /// 调用 ack 之后才回复 puback/pubrec，默认处理完消息后立即确认
    async fn on_message_with_ack(&self, message: Message, ack: AckHandle) {
        self.on_message(message).await;
        ack.ack();
    }
    /// 连接（或重连）成功
    async fn on_connected(&self, _session_present: bool) {}
    /// 连接断开
    async fn on_disconnected(&self, _reason: &DisconnectReason) {}
}

pub struct CallbackNoop;

#[async_trait]
impl Callback for CallbackNoop {
    async fn on_message(&self, _message: Message) {}
}
