use std::pin::Pin;

use bytes::BytesMut;
use futures::Stream;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use super::packet::{self, v4::Packet};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Packet error: {0}")]
    Packet(#[from] packet::Error),
    #[error("I/O: {0}")]
    IO(#[from] io::Error),
    #[error("Keep alive timeout")]
    KeepAlive,
    #[error("Connection closed by peer")]
    ConnectionAborted,
    #[error("Connection reset by peer")]
    ConnectionReset,
}

/// 可以承载 mqtt 报文的字节流（tcp 或 tls）
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub(crate) type Transport = Box<dyn Io>;

/// 连接上读出的报文流，对端关闭连接后结束，不可重启
pub(crate) type PacketStream = Pin<Box<dyn Stream<Item = Result<Packet, Error>> + Send>>;

/// 客户端与服务端之间的连接
/// 单纯的字节流读写管理
/// 以 packet 为单位读写
pub(crate) struct Connection {
    reader: PacketReader<ReadHalf<Transport>>,
    writer: PacketWriter<WriteHalf<Transport>>,
}

impl Connection {
    pub(crate) fn new(stream: Transport) -> Self {
        let (read, write) = io::split(stream);
        Self {
            reader: PacketReader::new(read),
            writer: PacketWriter::new(write),
        }
    }

    pub(crate) async fn read_packet(&mut self) -> Result<Packet, Error> {
        self.reader.read_packet().await
    }

    pub(crate) async fn write_packet(&mut self, packet: &Packet) -> Result<(), Error> {
        self.writer.write_packet(packet).await
    }

    /// 拆分为读、写两部分，读的部分转为报文流
    pub(crate) fn into_split(self) -> (PacketStream, PacketWriter<WriteHalf<Transport>>) {
        (Box::pin(self.reader.into_stream()), self.writer)
    }
}

pub(crate) struct PacketReader<R> {
    stream: R,
    /// 读缓冲区
    /// 使用缓冲区而非按照字节 从 socket 读取数据
    read: BytesMut,
}

impl<R> PacketReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub(crate) fn new(stream: R) -> Self {
        Self {
            stream,
            read: BytesMut::with_capacity(4096),
        }
    }

    /// 读取一个 packet
    /// 只在 read_buf 处挂起，可以安全地用在 select! 中
    pub(crate) async fn read_packet(&mut self) -> Result<Packet, Error> {
        loop {
            let required = match Packet::read(&mut self.read) {
                Ok(packet) => return Ok(packet),
                Err(packet::Error::InsufficientBytes(n)) => n,
                Err(e) => return Err(Error::Packet(e)),
            };

            // 数据不足，读取更多数据
            self.read_bytes(required).await?;
        }
    }

    /// 等待从 socket 读出至少所需长度的数据，放入缓冲区
    /// 如果读不到指定长度的数据，返回错误
    async fn read_bytes(&mut self, required: usize) -> Result<(), Error> {
        let mut total_read = 0;
        loop {
            let read = self.stream.read_buf(&mut self.read).await?;
            if 0 == read {
                return if self.read.is_empty() {
                    Err(Error::ConnectionAborted)
                } else {
                    Err(Error::ConnectionReset)
                };
            }

            total_read += read;
            if total_read >= required {
                return Ok(());
            }
        }
    }

    /// 逐个产出完整报文的惰性序列
    /// 对端正常关闭时结束；出错时产出错误后结束
    pub(crate) fn into_stream(self) -> impl Stream<Item = Result<Packet, Error>> + Send {
        futures::stream::unfold(Some(self), |reader| async move {
            let mut reader = reader?;
            match reader.read_packet().await {
                Ok(packet) => Some((Ok(packet), Some(reader))),
                Err(Error::ConnectionAborted) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

pub(crate) struct PacketWriter<W> {
    stream: W,
    /// 写缓冲区
    /// 先写入缓冲区再刷入 socket 而非按字节向 socket 写入数据
    write: BytesMut,
}

impl<W> PacketWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(stream: W) -> Self {
        Self {
            stream,
            write: BytesMut::with_capacity(4096),
        }
    }

    pub(crate) async fn write_packet(&mut self, packet: &Packet) -> Result<(), Error> {
        self.encode(std::slice::from_ref(packet))?;
        self.flush().await
    }

    /// 批量写入多个报文，只刷新一次
    pub(crate) async fn write_packets(&mut self, packets: &[Packet]) -> Result<(), Error> {
        self.encode(packets)?;
        self.flush().await
    }

    /// 编码失败时丢弃本次写入的全部内容，缓冲区回到编码前的状态
    fn encode(&mut self, packets: &[Packet]) -> Result<(), Error> {
        let start = self.write.len();
        for packet in packets {
            if let Err(e) = packet.write(&mut self.write) {
                self.write.truncate(start);
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Error> {
        if self.write.is_empty() {
            return Ok(());
        }

        let result = self.stream.write_all(&self.write).await;
        self.write.clear();
        result?;
        self.stream.flush().await?;
        Ok(())
    }

    /// 关闭写方向，对端会读到 EOF
    pub(crate) async fn shutdown(&mut self) -> Result<(), Error> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
