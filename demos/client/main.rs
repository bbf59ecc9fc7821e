use clap::Parser;
use demos::{Args, EnvOverrides, Error, PrintCallback};
use gecko_client::Client;
use log::{error, info};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("client exit error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Error> {
    let args = Args::parse();
    let _logger = demos::init_logger()?;

    // 获取配置
    let config = demos::load_config(&args, EnvOverrides::from_env()?).await?;
    info!("connect to {} as {:?}", config.server_uri, config.client_id);

    let client = Client::new(config, PrintCallback)?;
    client.connect().await?;

    let qos = args.qos();
    for filter in &args.subscribe {
        let code = client.subscribe(filter.as_str(), qos).await?;
        info!("subscribe {}: {:?}", filter, code);
    }
    if let Some(topic) = &args.publish {
        client
            .publish(topic.as_str(), args.message.clone(), qos, false)
            .await?;
        info!("published to {}", topic);
    }

    // 有订阅时一直运行，直到 ctrl-c
    if !args.subscribe.is_empty() {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("wait for ctrl-c: {}", e);
        }
    }

    info!("health: {:?}", client.health());
    client.disconnect().await?;
    Ok(())
}
