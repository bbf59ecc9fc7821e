//! 消息投递管理
//! * Outbox：发出的 QoS1/QoS2 消息，等待确认，超时重发
//! * Inbox：收到的 QoS1/QoS2 消息，用于去重

use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::Duration,
};

use log::{debug, warn};
use tokio::{
    sync::{mpsc, oneshot, OwnedSemaphorePermit},
    time::Instant,
};

use crate::{
    error::Error,
    network::{
        packet::QoS,
        v4::{Packet, PubAck, PubComp, PubRec, PubRel, Publish},
    },
};

/// 一次 publish 的结果通知
/// 持有飞行窗口的许可，结果确定后释放
#[derive(Debug)]
pub(crate) struct Completion {
    tx: oneshot::Sender<Result<(), Error>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Completion {
    pub(crate) fn new(
        tx: oneshot::Sender<Result<(), Error>>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self { tx, permit }
    }

    pub(crate) fn resolve(self, result: Result<(), Error>) {
        let Completion { tx, permit } = self;
        // 调用方可能已经不再等待结果
        let _ = tx.send(result);
        drop(permit);
    }
}

/// 收到确认报文后的处理结果
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Ack {
    /// 流程结束
    Completed,
    /// 需要回复 pubrel
    Release(PubRel),
    /// 不在飞行中的报文 id，重复的确认
    Unknown,
    /// 确认报文与当前阶段不符
    OutOfOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// 已发送 publish，等待 puback/pubrec
    Published,
    /// 已发送 pubrel，等待 pubcomp
    Released,
}

#[derive(Debug)]
struct Inflight {
    /// 发送顺序
    seq: u64,
    publish: Publish,
    stage: Stage,
    retries: u32,
    sent_at: Instant,
    completion: Completion,
}

impl Inflight {
    fn packet(&self) -> Packet {
        match self.stage {
            Stage::Published => {
                let mut publish = self.publish.clone();
                publish.dup = true;
                Packet::Publish(publish)
            }
            Stage::Released => Packet::PubRel(PubRel {
                packet_id: self.publish.packet_id,
            }),
        }
    }
}

/// 发出的、还没有完成确认的消息
#[derive(Debug)]
pub(crate) struct Outbox {
    messages: HashMap<u16, Inflight>,
    next_seq: u64,
    ack_timeout: Duration,
    max_retries: u32,
}

impl Outbox {
    pub(crate) fn new(ack_timeout: Duration, max_retries: u32) -> Self {
        Self {
            messages: HashMap::new(),
            next_seq: 0,
            ack_timeout,
            max_retries,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }

    pub(crate) fn contains(&self, packet_id: u16) -> bool {
        self.messages.contains_key(&packet_id)
    }

    /// 保存一条已分配 packet id 的 QoS1/QoS2 消息
    pub(crate) fn insert(&mut self, publish: Publish, completion: Completion, now: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.messages.insert(
            publish.packet_id,
            Inflight {
                seq,
                publish,
                stage: Stage::Published,
                retries: 0,
                sent_at: now,
                completion,
            },
        );
    }

    pub(crate) fn puback(&mut self, puback: PubAck) -> Ack {
        let packet_id = puback.packet_id;
        match self.messages.get(&packet_id) {
            None => Ack::Unknown,
            Some(message) if message.publish.qos != QoS::AtLeastOnce => Ack::OutOfOrder,
            Some(_) => {
                if let Some(message) = self.messages.remove(&packet_id) {
                    message.completion.resolve(Ok(()));
                }
                Ack::Completed
            }
        }
    }

    /// 重复的 pubrec 只会再次回复 pubrel，不改变状态
    pub(crate) fn pubrec(&mut self, pubrec: PubRec, now: Instant) -> Ack {
        let packet_id = pubrec.packet_id;
        let release = PubRel { packet_id };
        match self.messages.get_mut(&packet_id) {
            // 服务端仍在等待 pubrel，回复以便对方结束流程
            None => Ack::Release(release),
            Some(message) if message.publish.qos != QoS::ExactlyOnce => Ack::OutOfOrder,
            Some(message) => {
                if message.stage == Stage::Published {
                    message.stage = Stage::Released;
                    message.retries = 0;
                    message.sent_at = now;
                }
                Ack::Release(release)
            }
        }
    }

    pub(crate) fn pubcomp(&mut self, pubcomp: PubComp) -> Ack {
        let packet_id = pubcomp.packet_id;
        match self.messages.get(&packet_id) {
            None => Ack::Unknown,
            Some(message) if message.stage != Stage::Released => Ack::OutOfOrder,
            Some(_) => {
                if let Some(message) = self.messages.remove(&packet_id) {
                    message.completion.resolve(Ok(()));
                }
                Ack::Completed
            }
        }
    }

    /// 处理超时的消息
    /// * 还有重试次数的，返回需要重发的报文（publish 带 dup 标志，或 pubrel）
    /// * 重试次数用完的，以 DeliveryTimeout 结束
    pub(crate) fn expired(&mut self, now: Instant) -> Vec<Packet> {
        let mut expired: Vec<(u64, u16)> = self
            .messages
            .iter()
            .filter(|(_, message)| now.duration_since(message.sent_at) >= self.ack_timeout)
            .map(|(packet_id, message)| (message.seq, *packet_id))
            .collect();
        expired.sort_unstable();

        let mut packets = Vec::new();
        for (_, packet_id) in expired {
            let exhausted = match self.messages.get_mut(&packet_id) {
                Some(message) if message.retries < self.max_retries => {
                    message.retries += 1;
                    message.sent_at = now;
                    debug!(
                        "retransmit packet {} ({}/{})",
                        packet_id, message.retries, self.max_retries
                    );
                    packets.push(message.packet());
                    false
                }
                Some(_) => true,
                None => false,
            };
            if exhausted {
                if let Some(message) = self.messages.remove(&packet_id) {
                    warn!("delivery of packet {} timed out", packet_id);
                    message
                        .completion
                        .resolve(Err(Error::DeliveryTimeout(packet_id)));
                }
            }
        }
        packets
    }

    /// 重连成功后，按原始发送顺序重发所有飞行中的消息
    pub(crate) fn replay(&mut self, now: Instant) -> Vec<Packet> {
        let mut messages: Vec<&mut Inflight> = self.messages.values_mut().collect();
        messages.sort_unstable_by_key(|message| message.seq);
        messages
            .into_iter()
            .map(|message| {
                message.retries = 0;
                message.sent_at = now;
                message.packet()
            })
            .collect()
    }

    /// 以 ConnectionClosed 结束所有飞行中的消息
    pub(crate) fn cancel_all(&mut self) {
        for (_, message) in self.messages.drain() {
            message.completion.resolve(Err(Error::ConnectionClosed));
        }
    }
}

/// 收到 QoS1/QoS2 publish 后的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Receive {
    Deliver,
    Duplicate,
}

/// 应用确认过的消息，等待事件循环回复
pub(crate) type PendingAck = (u16, QoS);

/// 手动确认模式下交给回调的确认句柄
/// 调用 [`AckHandle::ack`] 之后才回复 puback/pubrec，丢弃句柄则不回复
#[must_use = "the message is not acknowledged until ack is called"]
#[derive(Debug)]
pub struct AckHandle {
    packet_id: u16,
    qos: QoS,
    tx: mpsc::UnboundedSender<PendingAck>,
}

impl AckHandle {
    pub(crate) fn new(packet_id: u16, qos: QoS, tx: mpsc::UnboundedSender<PendingAck>) -> Self {
        Self { packet_id, qos, tx }
    }

    pub fn packet_id(&self) -> u16 {
        self.packet_id
    }

    /// 确认消息，断线期间的确认在重连后回复
    pub fn ack(self) {
        // 事件循环已经退出，没有需要回复的连接
        let _ = self.tx.send((self.packet_id, self.qos));
    }
}

/// 收到的消息的去重状态
#[derive(Debug)]
pub(crate) struct Inbox {
    /// 已回复 pubrec，等待 pubrel 的 QoS2 报文 id
    awaiting_release: HashSet<u16>,
    /// 已交给应用，等待手动确认的报文 id
    deferred: HashSet<u16>,
    /// 最近回复过 puback 的 QoS1 报文 id，容量有限
    acked: VecDeque<u16>,
    window: usize,
}

impl Inbox {
    pub(crate) fn new(window: usize) -> Self {
        Self {
            awaiting_release: HashSet::new(),
            deferred: HashSet::new(),
            acked: VecDeque::with_capacity(window),
            window,
        }
    }

    /// 判断是否需要交给应用
    /// * QoS1：带 dup 标志且 id 最近确认过，视为重复
    /// * QoS2：id 正在等待 pubrel，视为重复
    /// * 等待手动确认的 id 总是重复
    pub(crate) fn receive(&self, publish: &Publish) -> Receive {
        let duplicate = match publish.qos {
            QoS::AtMostOnce => false,
            _ if self.deferred.contains(&publish.packet_id) => true,
            QoS::AtLeastOnce => publish.dup && self.acked.contains(&publish.packet_id),
            QoS::ExactlyOnce => self.awaiting_release.contains(&publish.packet_id),
        };
        match duplicate {
            true => Receive::Duplicate,
            false => Receive::Deliver,
        }
    }

    /// 消息交给应用后等待手动确认，期间不回复确认报文
    pub(crate) fn defer(&mut self, publish: &Publish) {
        if publish.qos != QoS::AtMostOnce {
            self.deferred.insert(publish.packet_id);
        }
    }

    pub(crate) fn is_deferred(&self, packet_id: u16) -> bool {
        self.deferred.contains(&packet_id)
    }

    /// 应用手动确认了消息
    /// 会话重置后遗留的确认不再回复
    pub(crate) fn ack_deferred(&mut self, packet_id: u16, qos: QoS) -> Option<Packet> {
        match self.deferred.remove(&packet_id) {
            true => self.acknowledge(packet_id, qos),
            false => None,
        }
    }

    /// 记录已处理的消息，返回需要回复的确认报文
    pub(crate) fn ack(&mut self, publish: &Publish) -> Option<Packet> {
        self.acknowledge(publish.packet_id, publish.qos)
    }

    fn acknowledge(&mut self, packet_id: u16, qos: QoS) -> Option<Packet> {
        match qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce => {
                if self.window > 0 {
                    self.acked.retain(|id| *id != packet_id);
                    if self.acked.len() == self.window {
                        self.acked.pop_front();
                    }
                    self.acked.push_back(packet_id);
                }
                Some(Packet::PubAck(PubAck { packet_id }))
            }
            QoS::ExactlyOnce => {
                self.awaiting_release.insert(packet_id);
                Some(Packet::PubRec(PubRec { packet_id }))
            }
        }
    }

    /// pubrel 总是回复 pubcomp
    pub(crate) fn release(&mut self, pubrel: PubRel) -> PubComp {
        if !self.awaiting_release.remove(&pubrel.packet_id) {
            debug!("pubrel for unknown packet {}", pubrel.packet_id);
        }
        PubComp {
            packet_id: pubrel.packet_id,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.awaiting_release.clear();
        self.deferred.clear();
        self.acked.clear();
    }
}
