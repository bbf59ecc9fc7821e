use bytes::{BufMut, Bytes, BytesMut};

use crate::network::{
    packet::{self, Error, FixedHeader, QoS},
    topic,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// 客户端是否之前发送过此消息（是否重新投递）
    pub dup: bool,
    /// 服务质量
    pub qos: QoS,
    /// 消息保留
    pub retain: bool,
    /// 主题
    pub topic: String,
    /// 包 id，QoS0 时为 0
    pub packet_id: u16,
    /// 消息负载
    pub payload: Bytes,
}

impl Publish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            dup: false,
            qos,
            retain,
            topic: topic.into(),
            packet_id: 0,
            payload: payload.into(),
        }
    }

    fn len(&self) -> usize {
        let mut len = 2 + self.topic.len() + self.payload.len();
        if self.qos != QoS::AtMostOnce {
            len += 2;
        }
        len
    }

    /// 剩余长度超出协议上限，无法编码
    pub(crate) fn oversized(&self) -> bool {
        self.len() > packet::PAYLOAD_MAX_LENGTH
    }

    pub(crate) fn read(fixed_header: FixedHeader, mut stream: Bytes) -> Result<Self, Error> {
        let flags = fixed_header.flags();
        let dup = flags & 0b1000 != 0;
        let qos = QoS::try_from((flags & 0b0110) >> 1)?;
        let retain = flags & 0b0001 != 0;

        // QoS0 的消息不能设置 dup
        if dup && qos == QoS::AtMostOnce {
            return Err(Error::IncorrectPacketFormat);
        }

        let topic = packet::read_string(&mut stream)?;
        if !topic::valid_publish_topic(&topic) {
            return Err(Error::InvalidPublishTopic);
        }

        let packet_id = match qos {
            QoS::AtMostOnce => 0,
            _ => match packet::read_u16(&mut stream)? {
                0 => return Err(Error::MissPacketId),
                id => id,
            },
        };

        // 剩余的字节全部是负载
        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            payload: stream,
        })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        let mut byte1 = 0x30 | (self.qos as u8) << 1;
        if self.dup {
            byte1 |= 0b1000;
        }
        if self.retain {
            byte1 |= 0b0001;
        }
        stream.put_u8(byte1);
        packet::write_remaining_length(stream, self.len())?;

        packet::write_string(stream, &self.topic)?;
        if self.qos != QoS::AtMostOnce {
            if self.packet_id == 0 {
                return Err(Error::MissPacketId);
            }
            stream.put_u16(self.packet_id);
        }
        stream.extend_from_slice(&self.payload);

        Ok(())
    }
}
