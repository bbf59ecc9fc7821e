use std::slice::Iter;

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub mod v4;

pub(crate) const PAYLOAD_MAX_LENGTH: usize = 268_435_455;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),
    #[error("Invalid fixed header flags {flags:#06b} for {packet_type:?}")]
    InvalidFlags { packet_type: PacketType, flags: u8 },
    #[error("Malformed packet")]
    MalformedPacket,
    #[error("At least {0} more bytes required")]
    InsufficientBytes(usize),
    #[error("Malformed UTF-8 string")]
    MalformedString,
    #[error("Invalid protocol")]
    InvalidProtocol,
    #[error("Invalid protocol level: {0}")]
    InvalidProtocolLevel(u8),
    #[error("Incorrect packet format")]
    IncorrectPacketFormat,
    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),
    #[error("Invalid connect return code: {0}")]
    InvalidConnectReturnCode(u8),
    #[error("Invalid subscribe return code: {0}")]
    InvalidSubscribeReturnCode(u8),
    #[error("Payload required")]
    PayloadRequired,
    #[error("Payload too large")]
    PayloadTooLarge,
    #[error("String too long: {0} bytes")]
    StringTooLong(usize),
    #[error("Miss packet id")]
    MissPacketId,
    #[error("Invalid publish topic")]
    InvalidPublishTopic,
    #[error("Invalid subscribe filter")]
    InvalidSubscribeFilter,
}

/// 服务质量
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Deserialize)]
#[serde(try_from = "u8")]
#[allow(clippy::enum_variant_names)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            qos => Err(Error::InvalidQoS(qos)),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Connect = 1,
    ConnAck,
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FixedHeader {
    /// 固定头的第一个字节，包含报文类型和flags
    pub(crate) byte1: u8,
    /// 固定头的大小
    pub(crate) fixed_header_len: usize,
    /// 剩余长度大小
    pub(crate) remaining_len: usize,
}

impl FixedHeader {
    pub(crate) fn packet_type(&self) -> Result<PacketType, Error> {
        let num = self.byte1 >> 4;
        match num {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::ConnAck),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::PubAck),
            5 => Ok(PacketType::PubRec),
            6 => Ok(PacketType::PubRel),
            7 => Ok(PacketType::PubComp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::SubAck),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::UnsubAck),
            12 => Ok(PacketType::PingReq),
            13 => Ok(PacketType::PingResp),
            14 => Ok(PacketType::Disconnect),
            n => Err(Error::InvalidPacketType(n)),
        }
    }

    /// 固定头第一个字节的低四位
    #[inline]
    pub(crate) fn flags(&self) -> u8 {
        self.byte1 & 0x0F
    }

    /// 除 publish 外，其余报文的 flags 都是固定值
    pub(crate) fn check_flags(&self, packet_type: PacketType) -> Result<(), Error> {
        let expected = match packet_type {
            PacketType::Publish => return Ok(()),
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => 0b0010,
            _ => 0,
        };
        if self.flags() != expected {
            return Err(Error::InvalidFlags {
                packet_type,
                flags: self.flags(),
            });
        }
        Ok(())
    }

    /// 整个完整报文的字节长度
    #[inline]
    pub(crate) fn packet_len(&self) -> usize {
        self.fixed_header_len + self.remaining_len
    }

    pub(crate) fn read_from(mut stream: Iter<u8>) -> Result<Self, Error> {
        let stream_len = stream.len();
        if stream_len < 2 {
            return Err(Error::InsufficientBytes(2 - stream_len));
        }
        // 第一个字节
        let byte1 = match stream.next() {
            Some(byte) => *byte,
            None => return Err(Error::InsufficientBytes(2)),
        };

        // 剩余字节长度
        let mut remaining_len: usize = 0;
        // 固定头长度
        let mut header_len = 1;
        let mut done = false;
        let mut shift = 0;

        for byte in stream {
            header_len += 1;
            let byte = *byte as usize;
            // 字节的后七位 * 128 + 上一个字节
            remaining_len += (byte & 0x7F) << shift;

            // 是否还有后续 remaining_len 字节
            done = (byte & 0x80) == 0;
            if done {
                break;
            }

            shift += 7;

            // 剩余长度字节最多四个字节（0，7，14，21）
            if shift > 21 {
                return Err(Error::MalformedPacket);
            }
        }

        if !done {
            return Err(Error::InsufficientBytes(1));
        }

        Ok(Self {
            byte1,
            fixed_header_len: header_len,
            remaining_len,
        })
    }
}

/// 读取多个字节
fn read_bytes(stream: &mut Bytes) -> Result<Bytes, Error> {
    // 后续可取出的字节的长度
    let len = read_u16(stream)? as usize;

    if len > stream.len() {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.split_to(len))
}

fn read_string(stream: &mut Bytes) -> Result<String, Error> {
    let s = read_bytes(stream)?;
    match String::from_utf8(s.to_vec()) {
        Ok(v) => Ok(v),
        Err(_) => Err(Error::MalformedString),
    }
}

fn read_u16(stream: &mut Bytes) -> Result<u16, Error> {
    if stream.len() < 2 {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.get_u16())
}

fn read_u8(stream: &mut Bytes) -> Result<u8, Error> {
    if stream.is_empty() {
        return Err(Error::MalformedPacket);
    }
    Ok(stream.get_u8())
}

fn write_remaining_length(stream: &mut BytesMut, len: usize) -> Result<usize, Error> {
    if len > PAYLOAD_MAX_LENGTH {
        return Err(Error::PayloadTooLarge);
    }

    let mut done = false;
    let mut x = len;
    let mut count = 0;

    while !done {
        let mut byte = (x % 128) as u8;
        x /= 128;
        if x > 0 {
            byte |= 128;
        }

        stream.put_u8(byte);
        count += 1;
        done = x == 0;
    }

    Ok(count)
}

fn write_bytes(stream: &mut BytesMut, bytes: &[u8]) -> Result<(), Error> {
    if bytes.len() > u16::MAX as usize {
        return Err(Error::StringTooLong(bytes.len()));
    }
    stream.put_u16(bytes.len() as u16);
    stream.extend_from_slice(bytes);
    Ok(())
}

fn write_string(stream: &mut BytesMut, string: &str) -> Result<(), Error> {
    write_bytes(stream, string.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_length_boundaries() {
        for (len, expected) in [
            (0, 1),
            (127, 1),
            (128, 2),
            (16_383, 2),
            (16_384, 3),
            (2_097_151, 3),
            (2_097_152, 4),
            (PAYLOAD_MAX_LENGTH, 4),
        ] {
            let mut stream = BytesMut::new();
            stream.put_u8(0x30);
            assert_eq!(write_remaining_length(&mut stream, len).unwrap(), expected);

            let header = FixedHeader::read_from(stream.iter()).unwrap();
            assert_eq!(header.remaining_len, len);
            assert_eq!(header.fixed_header_len, 1 + expected);
        }

        let mut stream = BytesMut::new();
        assert!(matches!(
            write_remaining_length(&mut stream, PAYLOAD_MAX_LENGTH + 1),
            Err(Error::PayloadTooLarge)
        ));
    }

    #[test]
    fn fixed_header_needs_more_bytes() {
        assert!(matches!(
            FixedHeader::read_from([0x30].iter()),
            Err(Error::InsufficientBytes(1))
        ));
        // 剩余长度还没有结束
        assert!(matches!(
            FixedHeader::read_from([0x30, 0x80, 0x80].iter()),
            Err(Error::InsufficientBytes(1))
        ));
    }

    #[test]
    fn fixed_header_rejects_five_length_bytes() {
        let stream = [0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        assert!(matches!(
            FixedHeader::read_from(stream.iter()),
            Err(Error::MalformedPacket)
        ));
    }

    #[test]
    fn fixed_header_flags() {
        let header = FixedHeader::read_from([0x62, 0x02].iter()).unwrap();
        assert!(header.check_flags(PacketType::PubRel).is_ok());

        let header = FixedHeader::read_from([0x60, 0x02].iter()).unwrap();
        assert!(header.check_flags(PacketType::PubRel).is_err());

        let header = FixedHeader::read_from([0x41, 0x02].iter()).unwrap();
        assert!(header.check_flags(PacketType::PubAck).is_err());
    }
}
