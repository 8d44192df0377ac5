use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::clipboard::{ClipboardProvider, MemoryClipboard, SystemClipboard};
use crate::config::Config;
use crate::progress::{ProgressEvent, TransferDirection};
use crate::sync::SyncService;
use crate::transport::server::ServerProtocol;
use crate::transport::TransportEvent;

#[derive(Parser)]
#[command(name = "clipshare")]
#[command(about = "Share the clipboard between machines")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Run with the roles enabled in the configuration")]
    Run {
        /// Relay without touching the system clipboard
        #[arg(long)]
        headless: bool,
    },

    #[command(about = "Accept peers and share the clipboard with them")]
    Serve {
        #[arg(short, long)]
        listen: Option<String>,

        #[arg(short, long)]
        protocol: Option<ServerProtocol>,

        #[arg(long)]
        headless: bool,
    },

    #[command(about = "Connect to a server, e.g. ws://host:8000 or tcp://host:8000")]
    Connect {
        url: String,

        #[arg(long)]
        headless: bool,
    },

    #[command(about = "Configuration management")]
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    #[command(about = "Show current configuration")]
    Show,

    #[command(about = "Generate example configuration")]
    Init {
        #[arg(long)]
        force: bool,
    },

    #[command(about = "Validate configuration")]
    Validate,
}

pub struct CliHandler {
    config: Config,
    config_path: Option<PathBuf>,
}

impl CliHandler {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self> {
        let config = Config::load_config(config_path.as_deref())
            .context("Failed to load configuration")?;

        Ok(Self {
            config,
            config_path,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn handle_command(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Run { headless } => self.run(self.config.clone(), headless).await,
            Commands::Serve {
                listen,
                protocol,
                headless,
            } => {
                let mut config = self.config.clone();
                config.server.enabled = true;
                config.client.enabled = false;
                if let Some(listen) = listen {
                    config.server.listen_addr = listen;
                }
                if let Some(protocol) = protocol {
                    config.server.protocol = protocol;
                }
                self.run(config, headless).await
            }
            Commands::Connect { url, headless } => {
                let mut config = self.config.clone();
                config.server.enabled = false;
                config.client.enabled = true;
                config.client.url = url;
                self.run(config, headless).await
            }
            Commands::Config { action } => self.handle_config(action),
        }
    }

    async fn run(&self, config: Config, headless: bool) -> Result<()> {
        config.validate()?;

        let clipboard: Arc<dyn ClipboardProvider> = if headless {
            info!("Running headless, the system clipboard is left alone");
            Arc::new(MemoryClipboard::new())
        } else {
            Arc::new(SystemClipboard::new(config.clipboard.poll_interval())?)
        };

        let mut service = SyncService::new(config, clipboard);
        let mut events = service.subscribe_events();
        let mut progress = service.subscribe_progress();
        service.start().await?;

        if let Some(addr) = service.server_addr() {
            println!("Listening on {}", addr);
        }
        println!("Press Ctrl-C to stop");

        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.context("Failed to listen for Ctrl-C")?;
                    break;
                }
                event = events.recv() => match event {
                    Ok(event) => print_event(&event),
                    Err(RecvError::Lagged(n)) => warn!("Missed {} connection events", n),
                    Err(RecvError::Closed) => break,
                },
                event = progress.recv() => match event {
                    Ok(event) => print_progress(&event),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
        }

        service.shutdown().await;
        println!("Stopped");
        Ok(())
    }

    fn handle_config(&self, action: ConfigAction) -> Result<()> {
        match action {
            ConfigAction::Show => {
                println!("Current Configuration:");
                print!("{}", toml::to_string_pretty(&self.config)?);
            }
            ConfigAction::Init { force } => {
                let path = match &self.config_path {
                    Some(path) => path.clone(),
                    None => Config::default_path().context("Could not find config directory")?,
                };
                Config::write_example(&path, force)?;
                println!("Example configuration written to {}", path.display());
            }
            ConfigAction::Validate => {
                // Loading already validated it
                println!("Configuration is valid");
            }
        }
        Ok(())
    }
}

fn print_event(event: &TransportEvent) {
    match event {
        TransportEvent::Connecting { endpoint } => println!("Connecting to {}...", endpoint),
        TransportEvent::Connected { endpoint } => println!("Connected to {}", endpoint),
        TransportEvent::ConnectionLost { endpoint } => {
            println!("Lost connection to {}, will retry", endpoint)
        }
        TransportEvent::Disconnected { endpoint } => println!("Disconnected from {}", endpoint),
        TransportEvent::Listening { addr } => info!("Listening on {}", addr),
        TransportEvent::ServerStopped => println!("Server stopped"),
        TransportEvent::PeerAttached { peer } => println!("Peer {} connected", peer),
        TransportEvent::PeerDetached { peer } => println!("Peer {} disconnected", peer),
    }
}

fn print_progress(event: &ProgressEvent) {
    let arrow = match event.direction {
        TransferDirection::Outgoing => "->",
        TransferDirection::Incoming => "<-",
    };
    if event.progress.is_complete() {
        println!(
            "{} {} {}",
            arrow,
            event.fingerprint.short(),
            event.progress.bar(30)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_serve() {
        let cli = Cli::parse_from([
            "clipshare",
            "--verbose",
            "serve",
            "--listen",
            "127.0.0.1:9000",
            "--protocol",
            "tcp",
            "--headless",
        ]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Serve {
                listen,
                protocol,
                headless,
            } => {
                assert_eq!(listen.as_deref(), Some("127.0.0.1:9000"));
                assert_eq!(protocol, Some(ServerProtocol::Tcp));
                assert!(headless);
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_parse_connect_with_config() {
        let cli = Cli::parse_from(["clipshare", "-c", "/tmp/c.toml", "connect", "ws://host:8000"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
        assert!(matches!(
            cli.command,
            Commands::Connect { ref url, headless: false } if url == "ws://host:8000"
        ));
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        assert!(Cli::try_parse_from(["clipshare", "serve", "--protocol", "udp"]).is_err());
    }

    #[test]
    fn test_config_init_writes_loadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, Config::generate_example()).unwrap();

        let handler = CliHandler::new(Some(path.clone())).unwrap();
        handler
            .handle_config(ConfigAction::Init { force: true })
            .unwrap();
        assert_eq!(Config::load_from_path(&path).unwrap(), Config::default());
        assert!(handler.handle_config(ConfigAction::Init { force: false }).is_err());
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CliHandler::new(Some(dir.path().join("absent.toml"))).is_err());
    }
}
