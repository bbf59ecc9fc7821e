use std::collections::{BTreeMap, HashMap};

use log::{debug, warn};
use tokio::time::Instant;

use crate::{
    config::ClientConfig,
    error::Error,
    network::{
        packet::QoS,
        v4::{
            Packet, Publish, SubAck, Subscribe, SubscribeFilter, SubscribeReasonCode, UnsubAck,
            Unsubscribe,
        },
    },
};

use super::{
    delivery::{Completion, Inbox, Outbox},
    Reply, SubscribeReply,
};

/// 等待 suback 的订阅请求
/// 重连时恢复订阅发出的请求没有 reply
struct PendingSubscribe {
    filters: Vec<SubscribeFilter>,
    reply: Option<SubscribeReply>,
}

struct PendingUnsubscribe {
    filters: Vec<String>,
    reply: Reply,
}

/// 代表客户端的一次会话
/// 会话跨越多次重连，直到用户断开或放弃重连
/// 处理协议层逻辑，如订阅记录，QoS1, QoS2 的消息保存等
pub(crate) struct Session {
    /// 客户端 id
    pub(crate) client_id: String,
    /// 服务端确认过的订阅
    /// key = topic-filter, value = 请求的 qos
    subscriptions: BTreeMap<String, QoS>,
    pending_subscribes: HashMap<u16, PendingSubscribe>,
    pending_unsubscribes: HashMap<u16, PendingUnsubscribe>,
    /// 发出的 QoS1/QoS2 消息
    pub(crate) outbox: Outbox,
    /// 收到的 QoS1/QoS2 消息
    pub(crate) inbox: Inbox,
    /// 上一次分配的 packet id
    last_packet_id: u16,
}

impl Session {
    pub(crate) fn new(config: &ClientConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            subscriptions: BTreeMap::new(),
            pending_subscribes: HashMap::new(),
            pending_unsubscribes: HashMap::new(),
            outbox: Outbox::new(config.ack_timeout(), config.delivery.max_retries),
            inbox: Inbox::new(config.delivery.dedupe_window),
            last_packet_id: 0,
        }
    }

    /// 分配一个没有被占用的 packet id（1..=65535）
    /// 飞行中的消息和等待确认的订阅请求都会占用 id
    fn next_packet_id(&mut self) -> Result<u16, Error> {
        let mut packet_id = self.last_packet_id;
        for _ in 0..u16::MAX {
            packet_id = packet_id.wrapping_add(1);
            if packet_id == 0 {
                packet_id = 1;
            }
            if !self.outbox.contains(packet_id)
                && !self.pending_subscribes.contains_key(&packet_id)
                && !self.pending_unsubscribes.contains_key(&packet_id)
            {
                self.last_packet_id = packet_id;
                return Ok(packet_id);
            }
        }
        Err(Error::PacketIdsExhausted)
    }

    /// 生成需要发出的 publish 报文
    /// * qos0: 不保存，立即结束
    /// * qos1/qos2: 分配 id，保存到 outbox，等待确认
    pub(crate) fn publish(
        &mut self,
        mut publish: Publish,
        completion: Completion,
        now: Instant,
    ) -> Option<Packet> {
        if publish.qos == QoS::AtMostOnce {
            publish.packet_id = 0;
            completion.resolve(Ok(()));
            return Some(Packet::Publish(publish));
        }

        match self.next_packet_id() {
            Ok(packet_id) => {
                publish.packet_id = packet_id;
                publish.dup = false;
                let packet = Packet::Publish(publish.clone());
                self.outbox.insert(publish, completion, now);
                Some(packet)
            }
            Err(e) => {
                completion.resolve(Err(e));
                None
            }
        }
    }

    pub(crate) fn subscribe(
        &mut self,
        filters: Vec<SubscribeFilter>,
        reply: SubscribeReply,
    ) -> Option<Packet> {
        let packet_id = match self.next_packet_id() {
            Ok(packet_id) => packet_id,
            Err(e) => {
                let _ = reply.send(Err(e));
                return None;
            }
        };
        self.pending_subscribes.insert(
            packet_id,
            PendingSubscribe {
                filters: filters.clone(),
                reply: Some(reply),
            },
        );
        Some(Packet::Subscribe(Subscribe { packet_id, filters }))
    }

    pub(crate) fn unsubscribe(&mut self, filters: Vec<String>, reply: Reply) -> Option<Packet> {
        let packet_id = match self.next_packet_id() {
            Ok(packet_id) => packet_id,
            Err(e) => {
                let _ = reply.send(Err(e));
                return None;
            }
        };
        self.pending_unsubscribes.insert(
            packet_id,
            PendingUnsubscribe {
                filters: filters.clone(),
                reply,
            },
        );
        Some(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
    }

    /// 订阅确认，按顺序与请求中的过滤器一一对应
    /// * 成功：记录为有效订阅
    /// * 失败：移除之前的同名订阅
    pub(crate) fn suback(&mut self, suback: SubAck) {
        let pending = match self.pending_subscribes.remove(&suback.packet_id) {
            Some(pending) => pending,
            None => {
                warn!("suback for unknown packet {}", suback.packet_id);
                return;
            }
        };
        if pending.filters.len() != suback.return_codes.len() {
            warn!(
                "suback {} carries {} return codes for {} filters",
                suback.packet_id,
                suback.return_codes.len(),
                pending.filters.len()
            );
        }

        for (filter, code) in pending.filters.iter().zip(suback.return_codes.iter()) {
            match code {
                SubscribeReasonCode::Success(granted) => {
                    debug!("subscribed {} with qos {:?}", filter.path, granted);
                    self.subscriptions.insert(filter.path.clone(), filter.qos);
                }
                SubscribeReasonCode::Failure => {
                    warn!("broker rejected subscription {}", filter.path);
                    self.subscriptions.remove(&filter.path);
                }
            }
        }

        if let Some(reply) = pending.reply {
            let _ = reply.send(Ok(suback.return_codes));
        }
    }

    pub(crate) fn unsuback(&mut self, unsuback: UnsubAck) {
        let pending = match self.pending_unsubscribes.remove(&unsuback.packet_id) {
            Some(pending) => pending,
            None => {
                warn!("unsuback for unknown packet {}", unsuback.packet_id);
                return;
            }
        };
        for filter in &pending.filters {
            self.subscriptions.remove(filter);
        }
        let _ = pending.reply.send(Ok(()));
    }

    /// 连接（重连）成功后需要发出的报文
    /// * 一个 subscribe 报文，包含所有有效订阅
    /// * 按原始发送顺序重发飞行中的消息
    pub(crate) fn resume(&mut self, session_present: bool, now: Instant) -> Vec<Packet> {
        // 服务端已丢弃会话，QoS2 接收状态也随之失效
        if !session_present {
            self.inbox.clear();
        }

        let mut packets = Vec::new();
        if !self.subscriptions.is_empty() {
            match self.next_packet_id() {
                Ok(packet_id) => {
                    let filters: Vec<SubscribeFilter> = self
                        .subscriptions
                        .iter()
                        .map(|(path, qos)| SubscribeFilter::new(path.clone(), *qos))
                        .collect();
                    self.pending_subscribes.insert(
                        packet_id,
                        PendingSubscribe {
                            filters: filters.clone(),
                            reply: None,
                        },
                    );
                    packets.push(Packet::Subscribe(Subscribe { packet_id, filters }));
                }
                Err(e) => warn!("can not restore subscriptions: {}", e),
            }
        }

        packets.extend(self.outbox.replay(now));
        packets
    }

    /// 连接断开，等待中的订阅请求不会重发
    pub(crate) fn connection_lost(&mut self) {
        for (_, pending) in self.pending_subscribes.drain() {
            if let Some(reply) = pending.reply {
                let _ = reply.send(Err(Error::ConnectionClosed));
            }
        }
        for (_, pending) in self.pending_unsubscribes.drain() {
            let _ = pending.reply.send(Err(Error::ConnectionClosed));
        }
    }

    /// 会话结束，所有未完成的操作以 ConnectionClosed 结束
    pub(crate) fn close(&mut self) {
        self.connection_lost();
        self.outbox.cancel_all();
        self.inbox.clear();
        self.subscriptions.clear();
    }
}
