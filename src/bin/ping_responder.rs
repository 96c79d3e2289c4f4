use std::{process, sync::Arc};

use log::{error, info, warn};
use matrix_irc_ping_exporter::{
    configuration::{Parser, ResponderConfiguration},
    irc::IrcClient,
    responder::run_responder,
    transport::Transport,
};

#[tokio::main]
async fn main() {
    let args = ResponderConfiguration::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .parse_default_env()
        .init();

    let irc = args.irc_config();
    if let Err(e) = irc.validate() {
        error!("{}", e);
        process::exit(1);
    }
    if irc.channels.is_empty() {
        warn!("No channels configured, only private messages will be answered");
    }

    info!("Configuration valid. Starting up...");

    let server = irc.server.clone();
    let client = IrcClient::new(server.clone(), irc);
    if let Err(e) = client.connect().await {
        error!("Failed to connect to {}: {}", server, e);
        process::exit(1);
    }
    let client: Arc<dyn Transport> = Arc::new(client);

    tokio::select! {
        result = run_responder(client) => {
            if let Err(e) = result {
                error!("{}", e);
                process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }
}
