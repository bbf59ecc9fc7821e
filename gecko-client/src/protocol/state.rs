use std::sync::Arc;

use tokio::sync::watch;

use crate::error::Error;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// 状态迁移事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    /// 发起连接（包括重连）
    Connect,
    /// 收到成功的 connack
    ConnAck,
    /// connack 拒绝、超时或网络错误
    ConnectFailed,
    /// 用户主动断开
    Disconnect,
    /// disconnect 报文已发出，连接关闭
    Closed,
    /// 连接意外断开
    Lost,
}

impl Transition {
    fn operation(&self) -> &'static str {
        match self {
            Transition::Connect => "connect",
            Transition::ConnAck => "connack",
            Transition::ConnectFailed => "connect failed",
            Transition::Disconnect => "disconnect",
            Transition::Closed => "close",
            Transition::Lost => "connection lost",
        }
    }

    fn next(&self, state: ConnectionState) -> Option<ConnectionState> {
        use ConnectionState::*;

        match (self, state) {
            (Transition::Connect, Disconnected) => Some(Connecting),
            (Transition::ConnAck, Connecting) => Some(Connected),
            (Transition::ConnectFailed, Connecting) => Some(Disconnected),
            (Transition::Disconnect, Connected) => Some(Disconnecting),
            (Transition::Closed, Disconnecting) => Some(Disconnected),
            (Transition::Lost, Connected | Disconnecting) => Some(Disconnected),
            _ => None,
        }
    }
}

/// 客户端句柄与事件循环共享的连接状态
#[derive(Debug, Clone)]
pub(crate) struct SharedState(Arc<watch::Sender<ConnectionState>>);

impl SharedState {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self(Arc::new(tx))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.0.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.0.subscribe()
    }

    /// 原子地执行一次状态迁移，非法迁移返回 ProtocolState 错误，状态不变
    pub(crate) fn apply(&self, transition: Transition) -> Result<ConnectionState, Error> {
        let mut result = Err(Error::ConnectionClosed);
        self.0.send_if_modified(|state| match transition.next(*state) {
            Some(next) => {
                *state = next;
                result = Ok(next);
                true
            }
            None => {
                result = Err(Error::ProtocolState {
                    state: *state,
                    operation: transition.operation(),
                });
                false
            }
        });
        result
    }

    /// 事件循环退出时，无论当前处于什么状态，都回到 Disconnected
    pub(crate) fn reset(&self) {
        self.0.send_if_modified(|state| {
            let changed = *state != ConnectionState::Disconnected;
            *state = ConnectionState::Disconnected;
            changed
        });
    }
}
