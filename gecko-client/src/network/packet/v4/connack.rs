use bytes::{BufMut, Bytes, BytesMut};

use crate::network::packet::{self, Error, FixedHeader};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAck {
    /// 服务端是否保留了之前的会话
    pub session_present: bool,
    /// 连接结果
    pub code: ConnectReturnCode,
}

impl ConnAck {
    pub fn new(code: ConnectReturnCode, session_present: bool) -> Self {
        Self {
            session_present,
            code,
        }
    }

    #[inline]
    fn len(&self) -> usize {
        2
    }

    pub(crate) fn read(fixed_header: FixedHeader, mut stream: Bytes) -> Result<Self, Error> {
        if fixed_header.remaining_len != 2 {
            return Err(Error::MalformedPacket);
        }

        let flags = packet::read_u8(&mut stream)?;
        // 除 session present 外的位都是保留位
        if flags & 0b1111_1110 != 0 {
            return Err(Error::IncorrectPacketFormat);
        }
        let code = packet::read_u8(&mut stream)?.try_into()?;

        Ok(Self {
            session_present: flags & 0b1 != 0,
            code,
        })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        stream.put_u8(0x20);
        packet::write_remaining_length(stream, self.len())?;
        stream.put_u8(self.session_present as u8);
        stream.put_u8(self.code as u8);
        Ok(())
    }
}

/// 3.1.1 连接返回码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Success = 0,
    RefusedProtocolVersion,
    BadClientId,
    ServiceUnavailable,
    BadUserNamePassword,
    NotAuthorized,
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let code = match value {
            0 => ConnectReturnCode::Success,
            1 => ConnectReturnCode::RefusedProtocolVersion,
            2 => ConnectReturnCode::BadClientId,
            3 => ConnectReturnCode::ServiceUnavailable,
            4 => ConnectReturnCode::BadUserNamePassword,
            5 => ConnectReturnCode::NotAuthorized,
            num => return Err(Error::InvalidConnectReturnCode(num)),
        };

        Ok(code)
    }
}
