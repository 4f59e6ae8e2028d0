//! tether - attach to resumable conversation streams

mod config;
mod render;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tether_protocol::{AbortRequest, Backend, HttpBackend};
use tether_session::{ConversationController, FileStore, Outcome, ResumeStorage};
use tracing_subscriber::EnvFilter;

/// tether - follow a running generation job from the terminal
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Backend base URL (overrides the config file)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Directory for resume state
    #[arg(long, global = true)]
    store_dir: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile with the running job and stream it until it finishes
    Attach {
        conversation: String,
    },
    /// Ask whether a job is running for the conversation
    Status {
        conversation: String,
    },
    /// Stop the running job
    Abort {
        conversation: String,
        /// The client already holds the full turn; skip the backend's sync
        #[arg(long)]
        skip_sync: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing
    let default_filter = if args.verbose {
        "tether=debug"
    } else {
        "tether=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let Some(command) = args.command else {
        eprintln!("Nothing to do. Try `tether attach <conversation>` or `tether --help`.");
        std::process::exit(2);
    };

    let cfg = config::Config::load();

    // CLI takes precedence over the config file
    let base_url = args
        .base_url
        .or(cfg.base_url.clone())
        .context("No backend configured: pass --base-url or set base_url (tether --init-config)")?;
    let mut backend = HttpBackend::new(base_url)?;
    if let Some(token) = cfg.api_token() {
        backend = backend.with_api_token(token);
    }
    let backend: Arc<dyn Backend> = Arc::new(backend);

    match command {
        Command::Status { conversation } => {
            let status = backend.status(&conversation).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Abort {
            conversation,
            skip_sync,
        } => {
            let ack = backend
                .abort(&conversation, AbortRequest { skip_sync })
                .await?;
            match ack.message {
                Some(message) => println!("ok={} ({})", ack.ok, message),
                None => println!("ok={}", ack.ok),
            }
        }
        Command::Attach { conversation } => {
            let store_dir = args
                .store_dir
                .or(cfg.store_dir.clone())
                .map(PathBuf::from)
                .unwrap_or_else(FileStore::default_dir);
            let store = Arc::new(FileStore::new(&store_dir).with_context(|| {
                format!("Cannot open resume store at {}", store_dir.display())
            })?);
            let controller =
                ConversationController::new(conversation, backend, store, cfg.controller_config());
            run_attach(controller).await?;
        }
    }

    Ok(())
}

async fn run_attach(mut controller: ConversationController) -> anyhow::Result<()> {
    let mut receiver = controller.subscribe();

    // Spawn event printer
    let printer = tokio::spawn(async move {
        use tokio::sync::broadcast::error::RecvError;

        let mut renderer = render::Renderer::new();
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if let Some(out) = renderer.render(&event) {
                        print!("{}", out);
                        let _ = std::io::stdout().flush();
                    }
                    if event.is_terminal() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Renderer fell behind by {} events", n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // First Ctrl-C aborts the turn, a second one exits
    let handle = controller.handle();
    let storage = controller.storage().clone();
    let conversation = controller.conversation_id().to_string();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n[abort requested; waiting for running tools]");
            handle.abort();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            release_lease(&storage, &conversation);
            std::process::exit(130);
        }
    });

    let result = controller.resume().await;
    let summary = render::summary(controller.transcript(), &controller.totals());
    drop(controller);
    let _ = printer.await;

    match result? {
        Outcome::Idle => println!("No job running; transcript is final."),
        Outcome::Superseded => println!("\nDetached."),
        Outcome::Completed | Outcome::Aborted(_) => {}
    }
    println!("\n{}", summary);
    Ok(())
}

/// Give up the stream lease but keep the resume point, so the next attach
/// can take over at once
fn release_lease(storage: &ResumeStorage, conversation: &str) {
    if let Err(e) = storage.release(conversation) {
        tracing::warn!("Failed to release stream lease: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_session::{KeyValueStore, MemoryStore};

    #[test]
    fn test_release_lease_keeps_resume_point() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let interrupted = ResumeStorage::new(store.clone(), Duration::from_secs(60));
        interrupted.claim("c1").unwrap();
        interrupted.save_index("c1", 4).unwrap();

        release_lease(&interrupted, "c1");

        let next = ResumeStorage::new(store, Duration::from_secs(60));
        next.claim("c1").unwrap();
        assert_eq!(next.load_index("c1").unwrap(), Some(4));
    }
}
