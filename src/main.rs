use anyhow::Result;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use clap::Parser;
use rand_core::{OsRng, RngCore};

use burrow::config::SAMPLE_CONFIG;

#[cfg(target_os = "linux")]
const DEFAULT_INTERFACE_NAME: &str = "burrow0";

#[derive(Parser, Debug)]
#[command(author, version, about = "Userspace point-to-point encrypted tunnel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the tunnel with the given config file.
    Up { config_file: String },
    /// Generate a sample config.toml.
    GenConfig,
    /// Generate a fresh session key and receiver index.
    GenKey,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if !matches!(cli.command, Commands::Up { .. }) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }
    match cli.command {
        Commands::Up { config_file } => run_tunnel(&config_file).await,
        Commands::GenConfig => {
            std::fs::write("config.toml", SAMPLE_CONFIG)?;
            println!("sample config written to config.toml");
            Ok(())
        }
        Commands::GenKey => {
            let mut key = [0u8; 32];
            OsRng.fill_bytes(&mut key);
            println!("SendKey = \"{}\"", B64.encode(key));
            println!("ReceiverIndex = {}", OsRng.next_u32());
            Ok(())
        }
    }
}

#[cfg(target_os = "linux")]
async fn run_tunnel(config_path: &str) -> Result<()> {
    use std::time::Duration;

    use anyhow::Context;
    use log::{error, info, LevelFilter};

    use burrow::config::{self, Config};
    use burrow::logger::DaemonLogger;
    use burrow::tun::LinuxTun;
    use burrow::tunnel::{Device, DeviceOptions, SessionKey};

    let config = Config::load(config_path)
        .await
        .context("failed to load config")?;

    let level = config
        .log
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Info);
    let path = if config.log.path.is_empty() {
        None
    } else {
        Some(config.log.path.as_str())
    };
    DaemonLogger::init(level, path, config.log.to_stdout)?;

    info!("starting burrow");

    let tun = LinuxTun::create(DEFAULT_INTERFACE_NAME, &config)?;
    let (device, mut status) = Device::new(tun, DeviceOptions::default());

    let sock = tokio::net::UdpSocket::bind(("0.0.0.0", config.interface.listen_port))
        .await
        .with_context(|| format!("failed to bind udp port {}", config.interface.listen_port))?;
    device.set_socket(sock).await;

    for peer_config in &config.peers {
        let endpoint = if peer_config.endpoint.is_empty() {
            None
        } else {
            let resolved = tokio::net::lookup_host(&peer_config.endpoint).await?.next();
            if resolved.is_none() {
                anyhow::bail!("could not resolve endpoint {}", peer_config.endpoint);
            }
            resolved
        };
        let allowed = config::parse_allowed_ips(&peer_config.allowed_ips)?;
        let keepalive = match peer_config.persistent_keepalive {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let peer = device
            .add_peer(&peer_config.name, endpoint, &allowed, keepalive)
            .await?;

        let key = config::decode_session_key(&peer_config.send_key)?;
        peer.install_session(SessionKey::new(&key, peer_config.receiver_index))
            .await;
    }

    device.start();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
        code = status.recv() => {
            if let Some(code) = code {
                error!("pipeline reported fatal status {code}");
            }
        }
    }

    device.shutdown().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run_tunnel(_config_path: &str) -> Result<()> {
    anyhow::bail!("the tunnel daemon requires a linux tun backend")
}
