use std::path::Path;

use async_trait::async_trait;
use clap::Parser;
use flexi_logger::{FlexiLoggerError, Logger, LoggerHandle};
use gecko_client::{Callback, ClientConfig, DisconnectReason, Message, QoS};
use log::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Config: {0}")]
    Config(#[from] gecko_client::config::Error),
    #[error("Environment: {0}")]
    Env(#[from] envy::Error),
    #[error("Logger: {0}")]
    Logger(#[from] FlexiLoggerError),
    #[error("Client: {0}")]
    Client(#[from] gecko_client::Error),
}

/// 命令行参数，优先级高于环境变量和配置文件
#[derive(Debug, Parser)]
#[clap(name = "client", about = "gecko mqtt client demo")]
pub struct Args {
    /// 配置文件，不存在时使用默认配置
    #[clap(short, long, default_value = "./client.toml")]
    pub config: String,
    /// 服务端地址，如 tcp://localhost:1883
    #[clap(long)]
    pub server_uri: Option<String>,
    #[clap(long)]
    pub client_id: Option<String>,
    /// 订阅的主题，可以指定多次
    #[clap(short, long = "subscribe")]
    pub subscribe: Vec<String>,
    /// 发布消息的主题
    #[clap(short, long)]
    pub publish: Option<String>,
    /// 发布的消息内容
    #[clap(short, long, default_value = "hello gecko")]
    pub message: String,
    /// 订阅和发布使用的服务质量
    #[clap(short, long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2))]
    pub qos: u8,
}

impl Args {
    pub fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }
}

/// 环境变量覆盖项，前缀 GECKO_，如 GECKO_SERVER_URI
#[derive(Debug, Default, serde::Deserialize)]
pub struct EnvOverrides {
    pub server_uri: Option<String>,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Result<Self, Error> {
        Ok(envy::prefixed("GECKO_").from_env::<EnvOverrides>()?)
    }

    fn apply(self, config: &mut ClientConfig) {
        if let Some(server_uri) = self.server_uri {
            config.server_uri = server_uri;
        }
        if let Some(client_id) = self.client_id {
            config.client_id = client_id;
        }
        if self.username.is_some() {
            config.username = self.username;
        }
        if self.password.is_some() {
            config.password = self.password;
        }
    }
}

/// 日志级别由 RUST_LOG 指定，默认 info
pub fn init_logger() -> Result<LoggerHandle, Error> {
    Ok(Logger::try_with_env_or_str("info")?
        .format(flexi_logger::detailed_format)
        .start()?)
}

/// 配置来源：配置文件 < 环境变量 < 命令行
pub async fn load_config(args: &Args, env: EnvOverrides) -> Result<ClientConfig, Error> {
    let mut config = match Path::new(&args.config).exists() {
        true => ClientConfig::from_path(&args.config).await?,
        false => {
            warn!("config file {} not found, use defaults", args.config);
            ClientConfig::default()
        }
    };

    env.apply(&mut config);
    if let Some(server_uri) = &args.server_uri {
        config.server_uri = server_uri.clone();
    }
    if let Some(client_id) = &args.client_id {
        config.client_id = client_id.clone();
    }
    config.validate()?;

    Ok(config)
}

/// 把收到的消息和连接事件打印到日志
pub struct PrintCallback;

#[async_trait]
impl Callback for PrintCallback {
    async fn on_message(&self, message: Message) {
        info!(
            "[{}] qos={:?} retain={} {}",
            message.topic,
            message.qos,
            message.retain,
            String::from_utf8_lossy(&message.payload)
        );
    }

    async fn on_connected(&self, session_present: bool) {
        info!("connected, session present: {}", session_present);
    }

    async fn on_disconnected(&self, reason: &DisconnectReason) {
        warn!("disconnected: {:?}", reason);
    }
}
