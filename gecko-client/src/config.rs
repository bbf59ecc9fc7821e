use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use bytes::Bytes;
use tokio::{fs, io::AsyncReadExt};

use crate::network::{
    packet::QoS,
    topic,
    v4::{Connect, LastWill, Login},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(&'static str),
}

/// 客户端配置
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// 服务端地址，如 tcp://localhost:1883
    pub server_uri: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// 秒，0 表示关闭心跳
    pub keep_alive: u16,
    pub clean_session: bool,
    /// 同时处于飞行中（未确认）的 QoS1/QoS2 消息上限
    pub max_inflight: u16,
    /// 等待 connack 的超时时间（毫秒）
    pub connection_timeout_ms: u64,
    /// 开启后由应用通过 AckHandle 确认收到的 QoS1/QoS2 消息
    pub manual_acks: bool,
    pub delivery: DeliveryConfig,
    pub reconnect: ReconnectConfig,
    pub will: Option<WillConfig>,
    pub tls: TlsConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_uri: "tcp://localhost:1883".into(),
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive: 60,
            clean_session: true,
            max_inflight: 10,
            connection_timeout_ms: 30_000,
            manual_acks: false,
            delivery: DeliveryConfig::default(),
            reconnect: ReconnectConfig::default(),
            will: None,
            tls: TlsConfig::default(),
        }
    }
}

/// 消息投递相关配置
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// 等待 puback/pubrec/pubcomp 的时间（毫秒），超时后重发
    pub ack_timeout_ms: u64,
    /// 最大重发次数，用完后报告投递超时
    pub max_retries: u32,
    /// 记录最近确认过的 QoS1 报文 id 的个数，用于接收端去重
    pub dedupe_window: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 10_000,
            max_retries: 3,
            dedupe_window: 128,
        }
    }
}

/// 断线重连配置
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// 连接断开后是否自动重连
    pub automatic: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// 随机抖动比例，取值 [0, 1]
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            automatic: true,
            initial_delay_ms: 1_000,
            max_delay_ms: 120_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

/// 遗嘱消息
#[derive(Debug, Clone, serde::Deserialize)]
pub struct WillConfig {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default = "WillConfig::default_qos")]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
}

impl WillConfig {
    fn default_qos() -> QoS {
        QoS::AtMostOnce
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// 使用 tcp:// 地址时也强制开启 tls
    pub enabled: bool,
    /// CA 证书（PEM）
    pub certificate_authority: Option<PathBuf>,
    /// 客户端证书（PEM）
    pub certificate: Option<PathBuf>,
    /// 客户端私钥（PEM）
    pub private_key: Option<PathBuf>,
    pub hostname_verification: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            certificate_authority: None,
            certificate: None,
            private_key: None,
            hostname_verification: true,
        }
    }
}

impl ClientConfig {
    pub fn new(server_uri: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            server_uri: server_uri.into(),
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let read_err = |source| Error::Read {
            path: path.to_path_buf(),
            source,
        };
        let mut file = fs::File::open(path).await.map_err(read_err)?;
        let mut s = String::new();
        file.read_to_string(&mut s).await.map_err(read_err)?;

        let config = toml::from_str::<ClientConfig>(&s)?;
        config.validate()?;
        Ok(config)
    }

    /// 检查各项取值是否合法
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_inflight == 0 {
            return Err(Error::Invalid("max_inflight must be at least 1"));
        }
        // 3.1.1：客户端 id 为空时必须开启 clean session
        if self.client_id.is_empty() && !self.clean_session {
            return Err(Error::Invalid("empty client_id requires clean_session"));
        }
        if self.connection_timeout_ms == 0 {
            return Err(Error::Invalid("connection_timeout_ms must be positive"));
        }
        if self.delivery.ack_timeout_ms == 0 {
            return Err(Error::Invalid("ack_timeout_ms must be positive"));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(Error::Invalid("password requires username"));
        }
        if let Some(will) = &self.will {
            if !topic::valid_publish_topic(&will.topic) {
                return Err(Error::Invalid("will topic must be a valid publish topic"));
            }
        }
        let reconnect = &self.reconnect;
        if reconnect.multiplier < 1.0 {
            return Err(Error::Invalid("reconnect multiplier must be at least 1"));
        }
        if !(0.0..=1.0).contains(&reconnect.jitter) {
            return Err(Error::Invalid("reconnect jitter must be within [0, 1]"));
        }
        if reconnect.initial_delay_ms > reconnect.max_delay_ms {
            return Err(Error::Invalid(
                "reconnect initial_delay_ms exceeds max_delay_ms",
            ));
        }
        Ok(())
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive as u64)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery.ack_timeout_ms)
    }

    /// 根据配置生成 connect 报文
    pub(crate) fn connect_packet(&self) -> Connect {
        Connect {
            keep_alive: self.keep_alive,
            client_id: self.client_id.clone(),
            clean_session: self.clean_session,
            last_will: self.will.as_ref().map(|will| LastWill {
                topic: will.topic.clone(),
                message: Bytes::from(will.payload.clone()),
                qos: will.qos,
                retain: will.retain,
            }),
            login: self.username.as_ref().map(|username| Login {
                username: username.clone(),
                password: self.password.clone().map(Bytes::from),
            }),
        }
    }
}
