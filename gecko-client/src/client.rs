use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use log::{error, info};
use tokio::sync::{mpsc, oneshot, watch, RwLock, Semaphore};

use crate::{
    config::ClientConfig,
    error::Error,
    eventloop::{self, EventLoop},
    network::{
        packet::{self, PacketType, QoS},
        topic,
        v4::{Publish, SubscribeFilter, SubscribeReasonCode},
        Endpoint,
    },
    protocol::{
        delivery::Completion,
        state::{ConnectionState, SharedState, Transition},
        Request,
    },
    Callback,
};

const REQUEST_CHANNEL_SIZE: usize = 1000;

struct Inner {
    config: Arc<ClientConfig>,
    endpoint: Endpoint,
    state: SharedState,
    /// 发送给事件循环的请求，事件循环启动后才有值
    requests: RwLock<Option<mpsc::Sender<Request>>>,
    /// 飞行窗口，QoS1/QoS2 消息发送前需要获取许可
    inflight: Arc<Semaphore>,
    callback: Arc<dyn Callback>,
}

/// mqtt 客户端句柄，可以廉价地克隆并在多个任务中使用
/// 所有句柄释放后，事件循环会断开连接并退出
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new(config: ClientConfig, callback: impl Callback) -> Result<Self, Error> {
        config.validate()?;
        let endpoint = Endpoint::from_config(&config)?;
        let inflight = Arc::new(Semaphore::new(config.max_inflight as usize));

        Ok(Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                endpoint,
                state: SharedState::new(),
                requests: RwLock::new(None),
                inflight,
                callback: Arc::new(callback),
            }),
        })
    }

    /// 连接服务端，成功后开启事件循环，返回 session present
    /// 只能在 Disconnected 状态下调用，首次连接失败不会自动重试
    pub async fn connect(&self) -> Result<bool, Error> {
        let inner = &self.inner;
        let mut requests = inner.requests.write().await;
        // 事件循环仍在运行（可能正在重连）
        if matches!(&*requests, Some(tx) if !tx.is_closed()) {
            return Err(Error::ProtocolState {
                state: self.state(),
                operation: "connect",
            });
        }

        inner.state.apply(Transition::Connect)?;
        info!("connecting to {}", inner.endpoint);
        let (conn, session_present) =
            match eventloop::handshake(&inner.endpoint, &inner.config).await {
                Ok(connected) => connected,
                Err(e) => {
                    error!("connect to {} failed: {}", inner.endpoint, e);
                    inner.state.apply(Transition::ConnectFailed)?;
                    return Err(e);
                }
            };
        inner.state.apply(Transition::ConnAck)?;

        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        let eventloop = EventLoop::new(
            inner.config.clone(),
            inner.endpoint.clone(),
            inner.state.clone(),
            rx,
            inner.callback.clone(),
        );
        tokio::spawn(eventloop.run(conn, session_present));
        *requests = Some(tx);

        Ok(session_present)
    }

    /// 发布消息，等待投递完成
    /// * qos0：写入连接后完成
    /// * qos1：收到 puback 后完成
    /// * qos2：收到 pubcomp 后完成
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), Error> {
        self.send(Publish::new(topic, payload, qos, retain))
            .await?
            .await
    }

    /// 提交消息，返回投递结果的 future
    /// 飞行窗口已满时等待
    pub async fn send(&self, publish: Publish) -> Result<Delivery, Error> {
        if !topic::valid_publish_topic(&publish.topic) {
            return Err(Error::InvalidTopic(publish.topic));
        }
        if publish.oversized() {
            return Err(Error::MalformedPacket(packet::Error::PayloadTooLarge));
        }
        self.ensure_connected()?;

        let permit = match publish.qos {
            QoS::AtMostOnce => None,
            _ => Some(
                self.inner
                    .inflight
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::ConnectionClosed)?,
            ),
        };
        let (tx, rx) = oneshot::channel();
        self.request(Request::Publish {
            publish,
            completion: Completion::new(tx, permit),
        })
        .await?;

        Ok(Delivery { rx })
    }

    pub async fn subscribe(
        &self,
        filter: impl Into<String>,
        qos: QoS,
    ) -> Result<SubscribeReasonCode, Error> {
        self.subscribe_many(vec![SubscribeFilter::new(filter, qos)])
            .await?
            .into_iter()
            .next()
            .ok_or(Error::UnexpectedPacket(PacketType::SubAck))
    }

    /// 一次订阅多个主题，返回码与过滤器一一对应
    pub async fn subscribe_many(
        &self,
        filters: Vec<SubscribeFilter>,
    ) -> Result<Vec<SubscribeReasonCode>, Error> {
        if filters.is_empty() {
            return Err(Error::InvalidTopic(String::new()));
        }
        if let Some(filter) = filters
            .iter()
            .find(|filter| !topic::valid_subscribe_filter(&filter.path))
        {
            return Err(Error::InvalidTopic(filter.path.clone()));
        }
        self.ensure_connected()?;

        let (reply, rx) = oneshot::channel();
        self.request(Request::Subscribe { filters, reply }).await?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    pub async fn unsubscribe(&self, filter: impl Into<String>) -> Result<(), Error> {
        self.unsubscribe_many(vec![filter.into()]).await
    }

    pub async fn unsubscribe_many(&self, filters: Vec<String>) -> Result<(), Error> {
        if filters.is_empty() {
            return Err(Error::InvalidTopic(String::new()));
        }
        if let Some(filter) = filters
            .iter()
            .find(|filter| !topic::valid_subscribe_filter(filter))
        {
            return Err(Error::InvalidTopic(filter.clone()));
        }
        self.ensure_connected()?;

        let (reply, rx) = oneshot::channel();
        self.request(Request::Unsubscribe { filters, reply }).await?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// 断开连接
    /// 所有未完成的投递以 ConnectionClosed 结束；正在重连时取消重连
    pub async fn disconnect(&self) -> Result<(), Error> {
        let requests = self.inner.requests.read().await.clone();
        let tx = match requests {
            Some(tx) if !tx.is_closed() => tx,
            _ => {
                return Err(Error::ProtocolState {
                    state: self.state(),
                    operation: "disconnect",
                })
            }
        };

        let (reply, rx) = oneshot::channel();
        tx.send(Request::Disconnect { reply })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    /// 监听连接状态的变化
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn health(&self) -> Health {
        let state = self.state();
        Health {
            status: match state {
                ConnectionState::Connected => HealthStatus::Up,
                _ => HealthStatus::Down,
            },
            client_id: self.inner.config.client_id.clone(),
            state,
        }
    }

    fn ensure_connected(&self) -> Result<(), Error> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            _ => Err(Error::ConnectionClosed),
        }
    }

    async fn request(&self, request: Request) -> Result<(), Error> {
        let tx = self
            .inner
            .requests
            .read()
            .await
            .clone()
            .ok_or(Error::ConnectionClosed)?;
        tx.send(request).await.map_err(|_| Error::ConnectionClosed)
    }
}

/// 一次 publish 的投递结果，只会完成一次
#[must_use = "delivery result is lost if the future is not awaited"]
#[derive(Debug)]
pub struct Delivery {
    rx: oneshot::Receiver<Result<(), Error>>,
}

impl Future for Delivery {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| match result {
            Ok(result) => result,
            // 事件循环已经退出
            Err(_) => Err(Error::ConnectionClosed),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
}

/// 健康检查结果
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Health {
    pub status: HealthStatus,
    pub client_id: String,
    pub state: ConnectionState,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::{net::TcpListener, time};

    use super::*;
    use crate::{
        error::ConnectError,
        network::{
            v4::{
                ConnAck, Connect, ConnectReturnCode, Packet, PubAck, PubComp, PubRec, PubRel, SubAck,
                Subscribe, UnsubAck,
            },
            Connection,
        },
        AckHandle, CallbackNoop, DisconnectReason, Message,
    };

    /// 进程内的假服务端
    struct Broker {
        listener: TcpListener,
    }

    impl Broker {
        async fn bind() -> (Self, String) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let uri = format!("tcp://{}", listener.local_addr().unwrap());
            (Self { listener }, uri)
        }

        async fn accept(&self) -> Connection {
            let (stream, _) = self.listener.accept().await.unwrap();
            Connection::new(Box::new(stream))
        }

        async fn accept_connect(&self) -> (Connection, Connect) {
            let mut conn = self.accept().await;
            match conn.read_packet().await.unwrap() {
                Packet::Connect(connect) => (conn, connect),
                packet => panic!("expect connect, got {:?}", packet),
            }
        }

        /// 接受连接并完成握手
        async fn accept_session(&self, session_present: bool) -> Connection {
            let (mut conn, _) = self.accept_connect().await;
            conn.write_packet(&Packet::ConnAck(ConnAck::new(
                ConnectReturnCode::Success,
                session_present,
            )))
            .await
            .unwrap();
            conn
        }
    }

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Message(Message),
        Connected(bool),
        Lost,
        Requested,
        Refused(ConnectReturnCode),
    }

    struct Recorder(mpsc::UnboundedSender<Event>);

    #[async_trait]
    impl Callback for Recorder {
        async fn on_message(&self, message: Message) {
            let _ = self.0.send(Event::Message(message));
        }

        async fn on_connected(&self, session_present: bool) {
            let _ = self.0.send(Event::Connected(session_present));
        }

        async fn on_disconnected(&self, reason: &DisconnectReason) {
            let event = match reason {
                DisconnectReason::Requested => Event::Requested,
                DisconnectReason::ConnectionLost(_) => Event::Lost,
                DisconnectReason::Refused(code) => Event::Refused(*code),
            };
            let _ = self.0.send(event);
        }
    }

    fn config(uri: &str) -> ClientConfig {
        let mut config = ClientConfig::new(uri, "gecko-test");
        config.reconnect.initial_delay_ms = 10;
        config.reconnect.max_delay_ms = 50;
        config.reconnect.jitter = 0.0;
        config
    }

    async fn read_publish(conn: &mut Connection) -> Publish {
        match conn.read_packet().await.unwrap() {
            Packet::Publish(publish) => publish,
            packet => panic!("expect publish, got {:?}", packet),
        }
    }

    /// 读取一个 subscribe 报文，全部以请求的 qos 确认
    async fn ack_subscribe(conn: &mut Connection) -> Subscribe {
        let subscribe = match conn.read_packet().await.unwrap() {
            Packet::Subscribe(subscribe) => subscribe,
            packet => panic!("expect subscribe, got {:?}", packet),
        };
        conn.write_packet(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes: subscribe
                .filters
                .iter()
                .map(|filter| SubscribeReasonCode::Success(filter.qos))
                .collect(),
        }))
        .await
        .unwrap();
        subscribe
    }

    #[tokio::test]
    async fn publish_while_disconnected_fails() {
        let client = Client::new(
            ClientConfig::new("tcp://127.0.0.1:1", "gecko-test"),
            CallbackNoop,
        )
        .unwrap();

        let result = client
            .publish("sensors/temp", "21.5", QoS::AtLeastOnce, false)
            .await;
        assert!(matches!(result, Err(Error::ConnectionClosed)));

        let health = client.health();
        assert_eq!(health.status, HealthStatus::Down);
        assert_eq!(health.client_id, "gecko-test");
        assert!(matches!(
            client.disconnect().await,
            Err(Error::ProtocolState {
                state: ConnectionState::Disconnected,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn connack_refusal_fails_connect() {
        let (broker, uri) = Broker::bind().await;
        let client = Client::new(config(&uri), CallbackNoop).unwrap();

        let refuse = async {
            let (mut conn, connect) = broker.accept_connect().await;
            assert_eq!(connect.client_id, "gecko-test");
            conn.write_packet(&Packet::ConnAck(ConnAck::new(
                ConnectReturnCode::NotAuthorized,
                false,
            )))
            .await
            .unwrap();
            conn
        };
        let (result, _conn) = tokio::join!(client.connect(), refuse);

        assert!(matches!(
            result,
            Err(Error::Connect(ConnectError::Refused(
                ConnectReturnCode::NotAuthorized
            )))
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn qos1_publish_completes_once_with_duplicate_pubacks() {
        let (broker, uri) = Broker::bind().await;
        let client = Client::new(config(&uri), CallbackNoop).unwrap();
        let (result, mut conn) = tokio::join!(client.connect(), broker.accept_session(false));
        assert!(!result.unwrap());
        assert_eq!(client.health().status, HealthStatus::Up);

        let delivery = client
            .send(Publish::new("sensors/temp", "21.5", QoS::AtLeastOnce, false))
            .await
            .unwrap();
        let first = read_publish(&mut conn).await;
        assert!(!first.dup);
        assert_eq!(first.payload, Bytes::from("21.5"));
        let puback = Packet::PubAck(PubAck {
            packet_id: first.packet_id,
        });
        conn.write_packet(&puback).await.unwrap();
        conn.write_packet(&puback).await.unwrap();
        delivery.await.unwrap();

        // 连接仍然可用，新消息使用新的 id
        let delivery = client
            .send(Publish::new("sensors/temp", "22.0", QoS::AtLeastOnce, false))
            .await
            .unwrap();
        let second = read_publish(&mut conn).await;
        assert_ne!(second.packet_id, first.packet_id);
        conn.write_packet(&Packet::PubAck(PubAck {
            packet_id: second.packet_id,
        }))
        .await
        .unwrap();
        delivery.await.unwrap();

        client.disconnect().await.unwrap();
        assert_eq!(conn.read_packet().await.unwrap(), Packet::Disconnect);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn qos2_publish_flow() {
        let (broker, uri) = Broker::bind().await;
        let client = Client::new(config(&uri), CallbackNoop).unwrap();
        let (result, mut conn) = tokio::join!(client.connect(), broker.accept_session(false));
        result.unwrap();

        let delivery = client
            .send(Publish::new("alerts/fire", "on", QoS::ExactlyOnce, true))
            .await
            .unwrap();
        let publish = read_publish(&mut conn).await;
        assert!(publish.retain);
        let packet_id = publish.packet_id;

        // pubrec 之前的 pubcomp 被忽略
        conn.write_packet(&Packet::PubComp(PubComp { packet_id }))
            .await
            .unwrap();
        conn.write_packet(&Packet::PubRec(PubRec { packet_id }))
            .await
            .unwrap();
        assert_eq!(
            conn.read_packet().await.unwrap(),
            Packet::PubRel(PubRel { packet_id })
        );
        // 重复的 pubrec 再次得到 pubrel
        conn.write_packet(&Packet::PubRec(PubRec { packet_id }))
            .await
            .unwrap();
        assert_eq!(
            conn.read_packet().await.unwrap(),
            Packet::PubRel(PubRel { packet_id })
        );
        conn.write_packet(&Packet::PubComp(PubComp { packet_id }))
            .await
            .unwrap();
        delivery.await.unwrap();
    }

    #[tokio::test]
    async fn inbound_qos2_duplicate_reaches_callback_once() {
        let (broker, uri) = Broker::bind().await;
        let (tx, mut events) = mpsc::unbounded_channel();
        let client = Client::new(config(&uri), Recorder(tx)).unwrap();
        let (result, mut conn) = tokio::join!(client.connect(), broker.accept_session(false));
        result.unwrap();
        assert_eq!(events.recv().await.unwrap(), Event::Connected(false));

        let publish = Publish {
            dup: false,
            qos: QoS::ExactlyOnce,
            retain: false,
            topic: "alerts/fire".into(),
            packet_id: 5,
            payload: Bytes::from_static(b"on"),
        };
        let pubrec = Packet::PubRec(PubRec { packet_id: 5 });

        conn.write_packet(&Packet::Publish(publish.clone()))
            .await
            .unwrap();
        assert_eq!(conn.read_packet().await.unwrap(), pubrec);

        let mut redelivery = publish.clone();
        redelivery.dup = true;
        conn.write_packet(&Packet::Publish(redelivery))
            .await
            .unwrap();
        assert_eq!(conn.read_packet().await.unwrap(), pubrec);

        conn.write_packet(&Packet::PubRel(PubRel { packet_id: 5 }))
            .await
            .unwrap();
        assert_eq!(
            conn.read_packet().await.unwrap(),
            Packet::PubComp(PubComp { packet_id: 5 })
        );

        assert_eq!(
            events.recv().await.unwrap(),
            Event::Message(Message::from(&publish))
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn reconnect_restores_subscriptions() {
        let (broker, uri) = Broker::bind().await;
        let client = Client::new(config(&uri), CallbackNoop).unwrap();
        let (result, mut conn) = tokio::join!(client.connect(), broker.accept_session(false));
        result.unwrap();

        let (code, _) = tokio::join!(
            client.subscribe("sensors/+/temp", QoS::AtLeastOnce),
            ack_subscribe(&mut conn)
        );
        assert_eq!(code.unwrap(), SubscribeReasonCode::Success(QoS::AtLeastOnce));
        let (code, _) = tokio::join!(
            client.subscribe("alerts/#", QoS::AtMostOnce),
            ack_subscribe(&mut conn)
        );
        code.unwrap();

        // 服务端断开连接
        drop(conn);

        let mut conn = broker.accept_session(false).await;
        let restore = ack_subscribe(&mut conn).await;
        assert_eq!(
            restore.filters,
            vec![
                SubscribeFilter::new("alerts/#", QoS::AtMostOnce),
                SubscribeFilter::new("sensors/+/temp", QoS::AtLeastOnce),
            ]
        );
        assert_eq!(client.state(), ConnectionState::Connected);

        // 重连后仍可正常退订
        let (result, unsubscribe) = tokio::join!(client.unsubscribe("alerts/#"), async {
            let unsubscribe = conn.read_packet().await.unwrap();
            if let Packet::Unsubscribe(unsubscribe) = &unsubscribe {
                conn.write_packet(&Packet::UnsubAck(UnsubAck {
                    packet_id: unsubscribe.packet_id,
                }))
                .await
                .unwrap();
            }
            unsubscribe
        });
        result.unwrap();
        assert!(matches!(unsubscribe, Packet::Unsubscribe(u) if u.filters == vec!["alerts/#".to_string()]));

        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn reconnect_replays_inflight_messages() {
        let (broker, uri) = Broker::bind().await;
        let client = Client::new(config(&uri), CallbackNoop).unwrap();
        let (result, mut conn) = tokio::join!(client.connect(), broker.accept_session(false));
        result.unwrap();

        let delivery = client
            .send(Publish::new("sensors/temp", "21.5", QoS::AtLeastOnce, false))
            .await
            .unwrap();
        let first = read_publish(&mut conn).await;
        drop(conn);

        // 重连期间不接受新消息
        let mut state = client.watch_state();
        while *state.borrow_and_update() == ConnectionState::Connected {
            state.changed().await.unwrap();
        }
        assert!(matches!(
            client.publish("sensors/temp", "x", QoS::AtMostOnce, false).await,
            Err(Error::ConnectionClosed)
        ));

        let mut conn = broker.accept_session(true).await;
        let replay = read_publish(&mut conn).await;
        assert!(replay.dup);
        assert_eq!(replay.packet_id, first.packet_id);
        conn.write_packet(&Packet::PubAck(PubAck {
            packet_id: replay.packet_id,
        }))
        .await
        .unwrap();
        delivery.await.unwrap();
    }

    #[tokio::test]
    async fn qos1_publish_times_out_after_retries() {
        let (broker, uri) = Broker::bind().await;
        let mut config = config(&uri);
        config.delivery.ack_timeout_ms = 100;
        config.delivery.max_retries = 1;
        let client = Client::new(config, CallbackNoop).unwrap();
        let (result, mut conn) = tokio::join!(client.connect(), broker.accept_session(false));
        result.unwrap();

        let delivery = client
            .send(Publish::new("sensors/temp", "21.5", QoS::AtLeastOnce, false))
            .await
            .unwrap();
        let first = read_publish(&mut conn).await;
        assert!(!first.dup);
        let retry = read_publish(&mut conn).await;
        assert!(retry.dup);
        assert_eq!(retry.packet_id, first.packet_id);

        assert!(matches!(
            delivery.await,
            Err(Error::DeliveryTimeout(packet_id)) if packet_id == first.packet_id
        ));
    }

    #[tokio::test]
    async fn inflight_window_blocks_publish() {
        let (broker, uri) = Broker::bind().await;
        let mut config = config(&uri);
        config.max_inflight = 1;
        let client = Client::new(config, CallbackNoop).unwrap();
        let (result, mut conn) = tokio::join!(client.connect(), broker.accept_session(false));
        result.unwrap();

        let first = client
            .send(Publish::new("a", "1", QoS::AtLeastOnce, false))
            .await
            .unwrap();
        let blocked = time::timeout(
            Duration::from_millis(100),
            client.send(Publish::new("a", "2", QoS::AtLeastOnce, false)),
        )
        .await;
        assert!(blocked.is_err());

        let publish = read_publish(&mut conn).await;
        conn.write_packet(&Packet::PubAck(PubAck {
            packet_id: publish.packet_id,
        }))
        .await
        .unwrap();
        first.await.unwrap();

        let second = client
            .send(Publish::new("a", "2", QoS::AtLeastOnce, false))
            .await
            .unwrap();
        let publish = read_publish(&mut conn).await;
        assert_eq!(publish.payload, Bytes::from("2"));
        conn.write_packet(&Packet::PubAck(PubAck {
            packet_id: publish.packet_id,
        }))
        .await
        .unwrap();
        second.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_deliveries() {
        let (broker, uri) = Broker::bind().await;
        let (tx, mut events) = mpsc::unbounded_channel();
        let client = Client::new(config(&uri), Recorder(tx)).unwrap();
        let (result, mut conn) = tokio::join!(client.connect(), broker.accept_session(false));
        result.unwrap();

        let delivery = client
            .send(Publish::new("sensors/temp", "21.5", QoS::AtLeastOnce, false))
            .await
            .unwrap();
        read_publish(&mut conn).await;

        client.disconnect().await.unwrap();
        assert!(matches!(delivery.await, Err(Error::ConnectionClosed)));
        assert_eq!(conn.read_packet().await.unwrap(), Packet::Disconnect);
        assert_eq!(events.recv().await.unwrap(), Event::Connected(false));
        assert_eq!(events.recv().await.unwrap(), Event::Requested);

        // 断开后可以再次连接
        let (result, _conn) = tokio::join!(client.connect(), broker.accept_session(true));
        assert!(result.unwrap());
    }

    #[tokio::test]
    async fn reconnect_refusal_gives_up() {
        let (broker, uri) = Broker::bind().await;
        let (tx, mut events) = mpsc::unbounded_channel();
        let client = Client::new(config(&uri), Recorder(tx)).unwrap();
        let (result, mut conn) = tokio::join!(client.connect(), broker.accept_session(false));
        result.unwrap();

        let delivery = client
            .send(Publish::new("sensors/temp", "21.5", QoS::AtLeastOnce, false))
            .await
            .unwrap();
        read_publish(&mut conn).await;
        drop(conn);

        let (mut conn, _) = broker.accept_connect().await;
        conn.write_packet(&Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::BadUserNamePassword,
            false,
        )))
        .await
        .unwrap();

        assert!(matches!(delivery.await, Err(Error::ConnectionClosed)));
        assert_eq!(events.recv().await.unwrap(), Event::Connected(false));
        assert_eq!(events.recv().await.unwrap(), Event::Lost);
        assert_eq!(
            events.recv().await.unwrap(),
            Event::Refused(ConnectReturnCode::BadUserNamePassword)
        );
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn transport_loss_without_automatic_reconnect_ends_session() {
        let (broker, uri) = Broker::bind().await;
        let mut config = config(&uri);
        config.reconnect.automatic = false;
        let (tx, mut events) = mpsc::unbounded_channel();
        let client = Client::new(config, Recorder(tx)).unwrap();
        let (result, conn) = tokio::join!(client.connect(), broker.accept_session(false));
        result.unwrap();
        drop(conn);

        assert_eq!(events.recv().await.unwrap(), Event::Connected(false));
        assert_eq!(events.recv().await.unwrap(), Event::Lost);

        let mut state = client.watch_state();
        while *state.borrow_and_update() != ConnectionState::Disconnected {
            state.changed().await.unwrap();
        }
        // 事件循环退出后可以重新连接
        let reconnect = async {
            loop {
                match client.connect().await {
                    Err(Error::ProtocolState { .. }) => time::sleep(Duration::from_millis(10)).await,
                    result => return result,
                }
            }
        };
        let (result, _conn) = tokio::join!(reconnect, broker.accept_session(false));
        result.unwrap();
    }

    #[tokio::test]
    async fn oversized_publish_is_rejected_before_io() {
        let (broker, uri) = Broker::bind().await;
        let (tx, mut events) = mpsc::unbounded_channel();
        let client = Client::new(config(&uri), Recorder(tx)).unwrap();
        let (result, mut conn) = tokio::join!(client.connect(), broker.accept_session(false));
        result.unwrap();
        assert_eq!(events.recv().await.unwrap(), Event::Connected(false));

        let result = client
            .send(Publish::new("a".repeat(70_000), "x", QoS::AtLeastOnce, false))
            .await;
        assert!(matches!(result, Err(Error::InvalidTopic(_))));
        assert!(matches!(
            client.subscribe("a".repeat(70_000), QoS::AtMostOnce).await,
            Err(Error::InvalidTopic(_))
        ));

        // 连接不受影响
        let delivery = client
            .send(Publish::new("sensors/temp", "21.5", QoS::AtLeastOnce, false))
            .await
            .unwrap();
        let publish = read_publish(&mut conn).await;
        assert_eq!(publish.topic, "sensors/temp");
        conn.write_packet(&Packet::PubAck(PubAck {
            packet_id: publish.packet_id,
        }))
        .await
        .unwrap();
        delivery.await.unwrap();

        assert_eq!(client.state(), ConnectionState::Connected);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn packet_before_connack_fails_connect() {
        let (broker, uri) = Broker::bind().await;
        let client = Client::new(config(&uri), CallbackNoop).unwrap();

        let answer = async {
            let (mut conn, _) = broker.accept_connect().await;
            conn.write_packet(&Packet::PingResp).await.unwrap();
            conn
        };
        let (result, _conn) = tokio::join!(client.connect(), answer);

        assert!(matches!(
            result,
            Err(Error::ProtocolState {
                state: ConnectionState::Connecting,
                ..
            })
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connack_timeout_fails_connect() {
        let (broker, uri) = Broker::bind().await;
        let mut config = config(&uri);
        config.connection_timeout_ms = 100;
        let client = Client::new(config, CallbackNoop).unwrap();

        // 服务端收到 connect 后不回复
        let (result, _silent) = tokio::join!(client.connect(), broker.accept_connect());

        assert!(matches!(
            result,
            Err(Error::Connect(ConnectError::Timeout(timeout))) if timeout == Duration::from_millis(100)
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    /// 把确认句柄交给测试，由测试决定何时确认
    struct ManualAcker(mpsc::UnboundedSender<(Message, AckHandle)>);

    #[async_trait]
    impl Callback for ManualAcker {
        async fn on_message(&self, _message: Message) {}

        async fn on_message_with_ack(&self, message: Message, ack: AckHandle) {
            let _ = self.0.send((message, ack));
        }
    }

    #[tokio::test]
    async fn manual_acks_wait_for_handle() {
        let (broker, uri) = Broker::bind().await;
        let mut config = config(&uri);
        config.manual_acks = true;
        let (tx, mut handles) = mpsc::unbounded_channel();
        let client = Client::new(config, ManualAcker(tx)).unwrap();
        let (result, mut conn) = tokio::join!(client.connect(), broker.accept_session(false));
        result.unwrap();

        let publish = Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: "sensors/temp".into(),
            packet_id: 3,
            payload: Bytes::from_static(b"21.5"),
        };
        conn.write_packet(&Packet::Publish(publish.clone()))
            .await
            .unwrap();
        let (message, ack) = handles.recv().await.unwrap();
        assert_eq!(message, Message::from(&publish));
        assert_eq!(ack.packet_id(), 3);

        // 确认之前不回复 puback，重发的消息也不再交给应用
        let mut redelivery = publish.clone();
        redelivery.dup = true;
        conn.write_packet(&Packet::Publish(redelivery)).await.unwrap();
        assert!(time::timeout(Duration::from_millis(100), conn.read_packet())
            .await
            .is_err());
        assert!(handles.try_recv().is_err());

        ack.ack();
        assert_eq!(
            conn.read_packet().await.unwrap(),
            Packet::PubAck(PubAck { packet_id: 3 })
        );

        let mut exactly_once = publish;
        exactly_once.qos = QoS::ExactlyOnce;
        exactly_once.packet_id = 4;
        conn.write_packet(&Packet::Publish(exactly_once))
            .await
            .unwrap();
        let (_, ack) = handles.recv().await.unwrap();
        assert!(time::timeout(Duration::from_millis(100), conn.read_packet())
            .await
            .is_err());
        ack.ack();
        assert_eq!(
            conn.read_packet().await.unwrap(),
            Packet::PubRec(PubRec { packet_id: 4 })
        );
        conn.write_packet(&Packet::PubRel(PubRel { packet_id: 4 }))
            .await
            .unwrap();
        assert_eq!(
            conn.read_packet().await.unwrap(),
            Packet::PubComp(PubComp { packet_id: 4 })
        );

        client.disconnect().await.unwrap();
    }
}
