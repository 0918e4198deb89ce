use anyhow::Result;
use clap::{Parser, Subcommand};
use nostr::Keys;
use peerdoc::doc::{DocumentModel, UpdateLog, UpdateOrigin};
use peerdoc::rendezvous::generate_session_id;
use peerdoc::ui::LogStatus;
use peerdoc::{Config, SessionManager};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "peerdoc")]
#[command(about = "Serverless peer-to-peer document collaboration sessions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a shared document session; stdin lines become document updates
    Join {
        /// Identifier of the shared document
        document_id: String,
        /// Relay to use instead of the configured ones (repeatable)
        #[arg(long = "relay")]
        relays: Vec<String>,
        /// STUN server to use instead of the configured ones (repeatable)
        #[arg(long = "stun")]
        stun_servers: Vec<String>,
    },
    /// Generate a fresh document identifier
    NewId,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Join {
            document_id,
            relays,
            stun_servers,
        } => {
            let config = Config::load()?;
            let mut session_config = config.session_config();
            if !relays.is_empty() {
                session_config.relays = relays;
            }
            if !stun_servers.is_empty() {
                session_config.stun_servers = stun_servers;
            }

            // Ephemeral identity, one per running session
            let keys = Keys::generate();
            let (doc, doc_rx) = UpdateLog::channel(64);

            let mut session = SessionManager::new(
                keys,
                document_id.clone(),
                session_config,
                doc.clone(),
                Arc::new(LogStatus),
                doc_rx,
            );
            let shutdown = session.shutdown_handle();

            println!("Joined document {} as {}", document_id, session.my_pubkey());
            println!("Type lines to edit the shared document; Ctrl-C leaves.");

            let session_handle = tokio::spawn(async move { session.run().await });

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    line = lines.next_line() => match line? {
                        Some(line) => {
                            let mut update = line.into_bytes();
                            update.push(b'\n');
                            doc.apply_update(&update, UpdateOrigin::Local)?;
                        }
                        None => break,
                    },
                }
            }

            let _ = shutdown.send(true);
            session_handle.await??;
        }
        Commands::NewId => {
            println!("{}", generate_session_id());
        }
    }

    Ok(())
}
