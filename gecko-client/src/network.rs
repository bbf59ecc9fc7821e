//! 网络层
//! 本层只关心字节流的建立与报文读写，不包含任何会话相关逻辑

use std::{fmt, sync::Arc};

use log::debug;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

pub(crate) use conn::{Connection, PacketWriter, Transport};
pub use conn::Io;
pub(crate) use packet::v4;

use crate::config::ClientConfig;

pub(crate) mod conn;
pub mod packet;
pub(crate) mod tls;
pub mod topic;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(#[from] conn::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] tls::Error),
    #[error("Unsupported broker uri scheme: {0}")]
    UnsupportedScheme(String),
    #[error("Broker uri has no host: {0}")]
    MissingHost(String),
    #[error("Invalid broker uri: {0}")]
    InvalidUri(#[from] url::ParseError),
}

/// 服务端地址，由 broker uri 解析得到
#[derive(Clone)]
pub(crate) struct Endpoint {
    host: String,
    port: u16,
    /// 开启 tls 时的连接器
    tls: Option<TlsConnector>,
}

impl Endpoint {
    /// * tcp://host:port, mqtt://host:port 明文连接，默认端口 1883
    /// * ssl://host:port, mqtts://host:port, tls://host:port 加密连接，默认端口 8883
    pub(crate) fn from_config(config: &ClientConfig) -> Result<Self, Error> {
        let uri = url::Url::parse(&config.server_uri)?;
        let secure = match uri.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "mqtts" | "tls" => true,
            scheme => return Err(Error::UnsupportedScheme(scheme.to_string())),
        };
        let host = match uri.host_str() {
            Some(host) if !host.is_empty() => host.trim_start_matches('[').trim_end_matches(']'),
            _ => return Err(Error::MissingHost(config.server_uri.clone())),
        };
        let port = uri.port().unwrap_or(if secure { 8883 } else { 1883 });

        let tls = match secure || config.tls.enabled {
            true => Some(TlsConnector::from(Arc::new(tls::client_config(&config.tls)?))),
            false => None,
        };

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }

    pub(crate) fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// 建立到服务端的字节流
    pub(crate) async fn connect(&self) -> Result<Transport, Error> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(conn::Error::from)?;
        stream.set_nodelay(true).map_err(conn::Error::from)?;
        debug!("tcp stream connected to {}", self);

        match &self.tls {
            Some(connector) => {
                let stream = tls::connect(connector, &self.host, stream).await?;
                debug!("tls handshake with {} done", self);
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(stream)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.is_tls() { "ssl" } else { "tcp" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(uri: &str) -> Result<Endpoint, Error> {
        let config = ClientConfig::new(uri, "test");
        Endpoint::from_config(&config)
    }

    #[test]
    fn parses_plain_uris() {
        let plain = endpoint("tcp://localhost").unwrap();
        assert_eq!(plain.to_string(), "tcp://localhost:1883");

        let custom_port = endpoint("mqtt://127.0.0.1:2883").unwrap();
        assert_eq!(custom_port.to_string(), "tcp://127.0.0.1:2883");
        assert!(!custom_port.is_tls());
    }

    #[test]
    fn rejects_unknown_schemes() {
        assert!(matches!(
            endpoint("ws://localhost:8080"),
            Err(Error::UnsupportedScheme(scheme)) if scheme == "ws"
        ));
        assert!(matches!(endpoint("localhost"), Err(Error::InvalidUri(_))));
    }

    #[test]
    fn tls_uri_requires_trust_anchors() {
        assert!(matches!(
            endpoint("ssl://localhost"),
            Err(Error::Tls(tls::Error::NoTrustAnchors))
        ));
    }
}
