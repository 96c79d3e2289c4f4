use std::{process, sync::Arc};

use log::{error, info, warn};
use matrix_irc_ping_exporter::{
    configuration::{Configuration, FileConfig, Parser},
    exporter::Exporter,
    irc::IrcClient,
    matrix::MatrixClient,
    metrics,
    responder::run_responder,
    transport::{ProbeInbox, Transport},
};

#[tokio::main]
async fn main() {
    let args = Configuration::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .parse_default_env()
        .init();

    if let Err(e) = args.validate() {
        error!("{}", e);
        process::exit(1);
    }
    let config = match FileConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    info!("Configuration valid. Starting up...");

    let (client, rooms) = match MatrixClient::connect(&config.matrix).await {
        Ok(connected) => connected,
        Err(e) => {
            error!("Failed to connect to {}: {}", config.matrix.homeserver, e);
            process::exit(1);
        }
    };

    let (inbox, streams) = ProbeInbox::new(&rooms);
    let transport: Arc<dyn Transport> = Arc::new(client);
    {
        let transport = transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.listen(Arc::new(inbox)).await {
                error!("Matrix listener stopped: {}", e);
            }
        });
    }

    for (network, irc) in &config.irc {
        let client = IrcClient::new(network.clone(), irc.clone());
        if let Err(e) = client.connect().await {
            error!("Failed to connect to IRC network {} ({}): {}", network, irc.server, e);
            process::exit(1);
        }

        let client: Arc<dyn Transport> = Arc::new(client);
        tokio::spawn(async move {
            let name = client.name().to_string();
            if let Err(e) = run_responder(client).await {
                error!("Responder on {} stopped: {}", name, e);
            }
        });
    }

    let exporter = Arc::new(Exporter::new(transport, rooms, args.timeout(), streams));

    let recorder = match metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Process counters disabled: {}", e);
            None
        }
    };

    let server = match metrics::serve(args.addr, exporter, recorder).await {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutting down");
    server.shutdown();
    server.wait().await;
}
