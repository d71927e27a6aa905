use clap::Parser;
use log::{error, info};
use server::dashboard::DEFAULT_DASHBOARD_PORT;
use server::{Dashboard, Server, ServerConfig};
use shared::{BoxError, DEFAULT_SERVER_PORT};
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Relay server for co-op game sessions")]
struct Args {
    /// Address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// UDP port to listen on
    #[clap(short, long, default_value_t = DEFAULT_SERVER_PORT)]
    port: u16,

    /// Maximum number of simultaneously connected players
    #[clap(short, long, default_value_t = 255)]
    max_players: usize,

    /// TCP port of the web dashboard
    #[clap(short, long, default_value_t = DEFAULT_DASHBOARD_PORT)]
    web_port: u16,

    /// Do not serve the web dashboard
    #[clap(long)]
    no_dashboard: bool,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    let args = Args::parse();
    let address = format!("{}:{}", args.host, args.port);

    info!("Starting sync server on {}", address);
    info!("Max players: {}", args.max_players);

    let config = ServerConfig {
        max_players: args.max_players.clamp(1, 255),
        ..ServerConfig::default()
    };
    let mut server = Server::new(&address, config).await?;
    let game_port = server.local_addr()?.port();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                // Keep the sender alive so the server runs until killed
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    });

    if !args.no_dashboard {
        let web_address = format!("{}:{}", args.host, args.web_port);
        let dashboard = Dashboard::bind(&web_address, server.sessions(), game_port).await?;
        let dashboard_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = dashboard.run(dashboard_shutdown).await {
                error!("Web dashboard error: {}", e);
            }
        });
    }

    if let Err(e) = server.run(shutdown_rx).await {
        error!("Server error: {}", e);
        return Err(e);
    }

    Ok(())
}
