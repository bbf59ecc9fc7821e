//! 协议层
//! 处理协议相关的逻辑，依赖于底层的网络层进行网络读写

use tokio::sync::oneshot;

use crate::{
    error::Error,
    network::v4::{Publish, SubscribeFilter, SubscribeReasonCode},
};

use self::delivery::Completion;

pub(crate) mod backoff;
pub(crate) mod delivery;
pub(crate) mod session;
pub(crate) mod state;

pub(crate) type SubscribeReply = oneshot::Sender<Result<Vec<SubscribeReasonCode>, Error>>;
pub(crate) type Reply = oneshot::Sender<Result<(), Error>>;

/// 客户端句柄发送给事件循环的请求
#[derive(Debug)]
pub(crate) enum Request {
    Publish {
        publish: Publish,
        completion: Completion,
    },
    Subscribe {
        filters: Vec<SubscribeFilter>,
        reply: SubscribeReply,
    },
    Unsubscribe {
        filters: Vec<String>,
        reply: Reply,
    },
    Disconnect {
        reply: Reply,
    },
}

impl Request {
    /// 连接不可用时直接结束请求
    pub(crate) fn close(self) {
        match self {
            Request::Publish { completion, .. } => completion.resolve(Err(Error::ConnectionClosed)),
            Request::Subscribe { reply, .. } => {
                let _ = reply.send(Err(Error::ConnectionClosed));
            }
            Request::Unsubscribe { reply, .. } => {
                let _ = reply.send(Err(Error::ConnectionClosed));
            }
            // 已经处于断开状态
            Request::Disconnect { reply } => {
                let _ = reply.send(Ok(()));
            }
        }
    }
}
