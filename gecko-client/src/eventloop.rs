//! 客户端事件循环
//! 独占会话状态，处理网络报文、用户请求、心跳与重发，断线后负责重连

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::{
    io::WriteHalf,
    select,
    sync::mpsc::{self, Receiver, UnboundedReceiver, UnboundedSender},
    time::{self, Instant, MissedTickBehavior},
};

use crate::{
    config::ClientConfig,
    error::{ConnectError, Error},
    network::{
        conn,
        packet::{PacketType, QoS},
        v4::{ConnectReturnCode, Packet},
        Connection, Endpoint, PacketWriter, Transport,
    },
    protocol::{
        backoff::Backoff,
        delivery::{Ack, AckHandle, PendingAck, Receive},
        session::Session,
        state::{ConnectionState, SharedState, Transition},
        Reply, Request,
    },
    Callback, DisconnectReason, Message,
};

type Writer = PacketWriter<WriteHalf<Transport>>;

/// 关闭心跳时 ping 定时器的占位周期，对应的分支不会被轮询
const PING_DISABLED: Duration = Duration::from_secs(24 * 60 * 60);

/// 建立连接并完成 connect/connack 握手，返回连接与 session present
pub(crate) async fn handshake(
    endpoint: &Endpoint,
    config: &ClientConfig,
) -> Result<(Connection, bool), Error> {
    let timeout = config.connection_timeout();
    match time::timeout(timeout, connect(endpoint, config)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::Timeout(timeout).into()),
    }
}

async fn connect(endpoint: &Endpoint, config: &ClientConfig) -> Result<(Connection, bool), Error> {
    let transport = endpoint.connect().await.map_err(ConnectError::Network)?;
    let mut conn = Connection::new(transport);

    let network = |e: conn::Error| -> Error {
        match e {
            conn::Error::Packet(e) => Error::MalformedPacket(e),
            e => ConnectError::Network(e.into()).into(),
        }
    };
    conn.write_packet(&Packet::Connect(config.connect_packet()))
        .await
        .map_err(network)?;

    // 握手阶段只接受 connack
    let connack = match conn.read_packet().await.map_err(network)? {
        Packet::ConnAck(connack) => connack,
        packet => {
            warn!(
                "receive {:?} from {} before connack",
                packet.packet_type(),
                endpoint
            );
            return Err(Error::ProtocolState {
                state: ConnectionState::Connecting,
                operation: "receive packet before connack",
            });
        }
    };

    match connack.code {
        ConnectReturnCode::Success => Ok((conn, connack.session_present)),
        code => Err(ConnectError::Refused(code).into()),
    }
}

/// 事件循环退出的原因
enum Exit {
    /// 连接异常断开
    Lost(Error),
    /// 用户在连接状态下调用 disconnect
    Requested(Reply),
    /// 用户在重连等待期间调用 disconnect
    Cancelled(Reply),
    /// 所有客户端句柄都已释放
    Dropped,
    /// 重连被服务端拒绝
    Refused(ConnectReturnCode),
    /// 没有开启自动重连
    Abandoned,
}

pub(crate) struct EventLoop {
    config: Arc<ClientConfig>,
    endpoint: Endpoint,
    state: SharedState,
    session: Session,
    /// 客户端句柄发来的请求
    requests: Receiver<Request>,
    /// 手动确认模式下，应用通过 AckHandle 发来的确认
    acks_tx: UnboundedSender<PendingAck>,
    acks: UnboundedReceiver<PendingAck>,
    callback: Arc<dyn Callback>,
    backoff: Backoff,
    /// 已发送 pingreq，还没有收到 pingresp
    awaiting_pingresp: bool,
}

impl EventLoop {
    pub(crate) fn new(
        config: Arc<ClientConfig>,
        endpoint: Endpoint,
        state: SharedState,
        requests: Receiver<Request>,
        callback: Arc<dyn Callback>,
    ) -> Self {
        let (acks_tx, acks) = mpsc::unbounded_channel();
        Self {
            session: Session::new(&config),
            acks_tx,
            acks,
            backoff: Backoff::new(&config.reconnect),
            config,
            endpoint,
            state,
            requests,
            callback,
            awaiting_pingresp: false,
        }
    }

    /// 开启事件循环，conn 为已完成握手的连接
    /// 直到用户断开、放弃重连或者所有句柄释放才退出
    pub(crate) async fn run(mut self, conn: Connection, session_present: bool) {
        let mut connected = Ok((conn, session_present));
        let exit = loop {
            let (conn, session_present) = match connected {
                Ok(connected) => connected,
                Err(exit) => break exit,
            };
            self.backoff.reset();
            info!(
                "client {} connected to {}, session present: {}",
                self.session.client_id, self.endpoint, session_present
            );
            self.callback.on_connected(session_present).await;

            let error = match self.serve(conn, session_present).await {
                Exit::Lost(error) => error,
                exit => break exit,
            };
            warn!("connection to {} lost: {}", self.endpoint, error);
            self.session.connection_lost();
            self.transition(Transition::Lost);
            self.callback
                .on_disconnected(&DisconnectReason::ConnectionLost(error))
                .await;

            if !self.config.reconnect.automatic {
                break Exit::Abandoned;
            }
            connected = self.reconnect().await;
        };

        self.finish();
        match exit {
            Exit::Requested(reply) => {
                self.callback
                    .on_disconnected(&DisconnectReason::Requested)
                    .await;
                let _ = reply.send(Ok(()));
            }
            Exit::Cancelled(reply) => {
                let _ = reply.send(Ok(()));
            }
            Exit::Refused(code) => {
                self.callback
                    .on_disconnected(&DisconnectReason::Refused(code))
                    .await;
            }
            // Lost 在循环内已经处理，不会走到这里
            Exit::Dropped | Exit::Abandoned | Exit::Lost(_) => {}
        }
        info!("client {} event loop exit", self.session.client_id);
    }

    /// 在一个连接上处理报文与请求，直到连接断开
    /// * 先恢复订阅并重发飞行中的消息
    /// * 从网络层读取报文，交给会话处理
    /// * 接收用户请求，写入网络层
    async fn serve(&mut self, conn: Connection, session_present: bool) -> Exit {
        let (mut packets, mut writer) = conn.into_split();
        self.awaiting_pingresp = false;

        let resume = self.session.resume(session_present, Instant::now());
        if !resume.is_empty() {
            debug!("resume session with {} packets", resume.len());
            if let Err(e) = writer.write_packets(&resume).await {
                return Exit::Lost(e.into());
            }
        }

        let keep_alive = self.config.keep_alive();
        let ping_period = match keep_alive.is_zero() {
            true => PING_DISABLED,
            false => keep_alive,
        };
        let mut ping = time::interval_at(Instant::now() + ping_period, ping_period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retry = time::interval(retry_period(self.config.ack_timeout()));
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let result = select! {
                // 从网络层读报文
                packet = packets.next() => match packet {
                    Some(Ok(packet)) => self.handle_incoming(packet, &mut writer).await,
                    Some(Err(e)) => Err(e.into()),
                    None => Err(conn::Error::ConnectionAborted.into()),
                },
                // 用户请求
                request = self.requests.recv() => match request {
                    Some(request) => match self.handle_request(request, &mut writer).await {
                        Ok(Some(reply)) => {
                            self.close(writer).await;
                            return Exit::Requested(reply);
                        }
                        Ok(None) => Ok(()),
                        Err(e) => Err(e),
                    },
                    None => {
                        info!("all handles of client {} dropped", self.session.client_id);
                        self.close(writer).await;
                        return Exit::Dropped;
                    }
                },
                // 应用手动确认的消息
                Some((packet_id, qos)) = self.acks.recv() => {
                    self.manual_ack(packet_id, qos, &mut writer).await
                }
                _ = ping.tick(), if !keep_alive.is_zero() => self.ping(&mut writer).await,
                // 超时重发
                _ = retry.tick() => {
                    let packets = self.session.outbox.expired(Instant::now());
                    writer.write_packets(&packets).await.map_err(Error::from)
                }
            };

            if let Err(e) = result {
                return Exit::Lost(e);
            }
        }
    }

    async fn handle_incoming(&mut self, packet: Packet, writer: &mut Writer) -> Result<(), Error> {
        match packet {
            Packet::Publish(publish) => {
                match self.session.inbox.receive(&publish) {
                    Receive::Deliver
                        if self.config.manual_acks && publish.qos != QoS::AtMostOnce =>
                    {
                        // 确认报文由 AckHandle 触发
                        self.session.inbox.defer(&publish);
                        let ack =
                            AckHandle::new(publish.packet_id, publish.qos, self.acks_tx.clone());
                        self.callback
                            .on_message_with_ack(Message::from(&publish), ack)
                            .await;
                        return Ok(());
                    }
                    Receive::Deliver => self.callback.on_message(Message::from(&publish)).await,
                    Receive::Duplicate => {
                        debug!(
                            "drop duplicate publish {} on {}",
                            publish.packet_id, publish.topic
                        );
                        if self.session.inbox.is_deferred(publish.packet_id) {
                            return Ok(());
                        }
                    }
                }
                // 回调结束后才回复确认
                if let Some(ack) = self.session.inbox.ack(&publish) {
                    writer.write_packet(&ack).await?;
                }
            }
            Packet::PubAck(puback) => {
                let packet_id = puback.packet_id;
                let ack = self.session.outbox.puback(puback);
                log_ack(PacketType::PubAck, packet_id, ack);
            }
            Packet::PubRec(pubrec) => {
                let packet_id = pubrec.packet_id;
                match self.session.outbox.pubrec(pubrec, Instant::now()) {
                    Ack::Release(pubrel) => writer.write_packet(&Packet::PubRel(pubrel)).await?,
                    ack => log_ack(PacketType::PubRec, packet_id, ack),
                }
            }
            Packet::PubRel(pubrel) => {
                let pubcomp = self.session.inbox.release(pubrel);
                writer.write_packet(&Packet::PubComp(pubcomp)).await?;
            }
            Packet::PubComp(pubcomp) => {
                let packet_id = pubcomp.packet_id;
                let ack = self.session.outbox.pubcomp(pubcomp);
                log_ack(PacketType::PubComp, packet_id, ack);
            }
            Packet::SubAck(suback) => self.session.suback(suback),
            Packet::UnsubAck(unsuback) => self.session.unsuback(unsuback),
            Packet::PingResp => self.awaiting_pingresp = false,
            packet => return Err(Error::UnexpectedPacket(packet.packet_type())),
        }

        Ok(())
    }

    /// 处理用户请求，disconnect 请求返回对应的回复通道
    async fn handle_request(
        &mut self,
        request: Request,
        writer: &mut Writer,
    ) -> Result<Option<Reply>, Error> {
        let packet = match request {
            Request::Publish {
                publish,
                completion,
            } => self
                .session
                .publish(publish, completion, Instant::now()),
            Request::Subscribe { filters, reply } => self.session.subscribe(filters, reply),
            Request::Unsubscribe { filters, reply } => self.session.unsubscribe(filters, reply),
            Request::Disconnect { reply } => return Ok(Some(reply)),
        };

        if let Some(packet) = packet {
            writer.write_packet(&packet).await?;
        }
        Ok(None)
    }

    async fn manual_ack(
        &mut self,
        packet_id: u16,
        qos: QoS,
        writer: &mut Writer,
    ) -> Result<(), Error> {
        match self.session.inbox.ack_deferred(packet_id, qos) {
            Some(ack) => writer.write_packet(&ack).await?,
            None => debug!("ignore stale ack for packet {}", packet_id),
        }
        Ok(())
    }

    async fn ping(&mut self, writer: &mut Writer) -> Result<(), Error> {
        if self.awaiting_pingresp {
            return Err(conn::Error::KeepAlive.into());
        }
        self.awaiting_pingresp = true;
        writer.write_packet(&Packet::PingReq).await?;
        Ok(())
    }

    /// 主动断开：发送 disconnect 报文并关闭写方向
    async fn close(&mut self, mut writer: Writer) {
        self.transition(Transition::Disconnect);
        if let Err(e) = writer.write_packet(&Packet::Disconnect).await {
            debug!("write disconnect to {}: {}", self.endpoint, e);
        }
        if let Err(e) = writer.shutdown().await {
            debug!("shutdown connection to {}: {}", self.endpoint, e);
        }
        self.transition(Transition::Closed);
    }

    /// 按退避策略重连，等待期间可以被 disconnect 请求取消
    async fn reconnect(&mut self) -> Result<(Connection, bool), Exit> {
        loop {
            let delay = self.backoff.next_delay();
            info!("reconnect to {} in {:?}", self.endpoint, delay);
            let sleep = time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                select! {
                    _ = &mut sleep => break,
                    request = self.requests.recv() => match request {
                        Some(Request::Disconnect { reply }) => return Err(Exit::Cancelled(reply)),
                        // 未连接时不接受其它请求
                        Some(request) => request.close(),
                        None => return Err(Exit::Dropped),
                    }
                }
            }

            self.transition(Transition::Connect);
            match handshake(&self.endpoint, &self.config).await {
                Ok(connected) => {
                    self.transition(Transition::ConnAck);
                    return Ok(connected);
                }
                Err(Error::Connect(ConnectError::Refused(code))) => {
                    error!("reconnect to {} refused: {:?}", self.endpoint, code);
                    self.transition(Transition::ConnectFailed);
                    return Err(Exit::Refused(code));
                }
                Err(e) => {
                    warn!("reconnect to {} failed: {}", self.endpoint, e);
                    self.transition(Transition::ConnectFailed);
                }
            }
        }
    }

    /// 会话结束：拒绝后续请求，结束所有未完成的操作
    fn finish(&mut self) {
        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            request.close();
        }
        self.session.close();
        self.state.reset();
    }

    fn transition(&self, transition: Transition) {
        if let Err(e) = self.state.apply(transition) {
            warn!("client {}: {}", self.session.client_id, e);
        }
    }
}

/// 重发检查的周期
fn retry_period(ack_timeout: Duration) -> Duration {
    (ack_timeout / 4).max(Duration::from_millis(10))
}

fn log_ack(packet_type: PacketType, packet_id: u16, ack: Ack) {
    match ack {
        Ack::Completed => debug!("{:?} {} completed", packet_type, packet_id),
        Ack::Unknown => debug!("ignore {:?} for packet {} not in flight", packet_type, packet_id),
        Ack::OutOfOrder => warn!(
            "protocol violation: {:?} for packet {} out of order, keep it in flight",
            packet_type, packet_id
        ),
        Ack::Release(_) => {}
    }
}
