use clap::Parser;
use client::{Client, ClientConfig, ClientEvent, ConnectionState, NetworkSimulation};
use log::{error, info, warn};
use shared::{BoxError, PlayerColor};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::time::interval;

/// Headless client: joins a server, keeps the player alive, sends stdin
/// lines as chat and prints everything it receives.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:55555")]
    server: String,

    /// Display name to request
    #[arg(short = 'n', long, default_value = "")]
    name: String,

    /// Color to request, as a name or hex string; the server picks one if omitted
    #[arg(short = 'c', long)]
    color: Option<String>,

    /// Simulate a bad connection: latency up to this many milliseconds, and 10% packet loss
    #[arg(long, default_value_t = 0)]
    simulate_latency: u64,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let color = match args.color.as_deref() {
        Some(text) => PlayerColor::parse(text).ok_or_else(|| format!("Unknown color '{}'", text))?,
        None => PlayerColor::UNDEFINED,
    };

    let config = ClientConfig {
        simulation: NetworkSimulation::from_max_latency(Duration::from_millis(args.simulate_latency)),
        ..ClientConfig::default()
    };
    let mut client = Client::new(config).await?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = cancel_tx.send(true);
            }
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    });

    info!("Connecting to: {}", args.server);
    if !client
        .connect_to_server(&args.server, &args.name, color, &cancel_rx)
        .await
    {
        return Err(format!("Could not join {}", args.server).into());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut frame_interval = interval(Duration::from_millis(16));
    let mut cancel = cancel_rx.clone();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => client.send_chat_message(&line),
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            },

            _ = frame_interval.tick() => {
                client.poll_events();
                client.send_keep_alive();

                while let Some(event) = client.next_event() {
                    match event {
                        ClientEvent::Initialized { player_id } => info!("Joined as player {}", player_id),
                        ClientEvent::ChatReceived(message) => {
                            println!("[{}] {}", message.sender, message.text);
                        }
                        ClientEvent::StartSpeedrun => println!("*** Speedrun started ***"),
                        ClientEvent::Disconnected { reason } => warn!("Disconnected: {}", reason),
                    }
                }

                if client.state() == ConnectionState::Disconnected {
                    break;
                }
            },

            _ = cancel.changed() => break,
        }
    }

    client.disconnect();
    Ok(())
}
