use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chatlimit::clock::{Clock, SystemClock};
use chatlimit::config::AppConfig;
use chatlimit::ratelimit::{format_remaining, LimitController, LimitStateStore, LimitView};
use chatlimit::storage::{FileStore, KeyValueStore};
use chatlimit::submit::{SubmitController, SubmitMode, TracingNotifier};
use chatlimit::tokens::TokenBalanceService;

/// Inspect and drive chat message quotas.
#[derive(Debug, Parser)]
#[command(name = "chatlimit", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Chat identifier (ignored for global quotas)
    #[arg(long, default_value = "default")]
    chat: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the quota state
    Status,
    /// Send a message through the quota
    Send {
        /// Treat the message as an edit, which never consumes quota
        #[arg(long)]
        edit: bool,
        text: String,
    },
    /// Spend tokens to restore the quota
    Unlock,
    /// Restore the full quota
    Reset,
    /// Delete the persisted quota record
    Clear,
    /// Inspect or change the token balance
    Tokens {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Follow a running cooldown until it ends
    Watch,
}

#[derive(Debug, Subcommand)]
enum TokenAction {
    Show,
    Add { amount: u64 },
    Set { amount: u64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = AppConfig::load(cli.config.as_deref())?;
    info!(
        path = %config.storage.path.display(),
        scope = ?config.limit.scope,
        limit = config.limit.message_limit,
        "Configuration loaded"
    );

    let storage: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(&config.storage.path));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(LimitStateStore::new(storage.clone(), clock));
    let tokens = Arc::new(TokenBalanceService::new(storage, &config.tokens));

    let controller = Arc::new(LimitController::new(
        &cli.chat,
        config.limit.clone(),
        store,
        tokens.clone(),
    ));
    controller.initialize().await;

    let submit = SubmitController::new(controller.clone(), Arc::new(TracingNotifier))
        .with_messages(config.notices.clone());

    match cli.command {
        Command::Status => {
            print_status(&controller);
        }
        Command::Send { edit, text } => {
            let mode = if edit {
                SubmitMode::Edit
            } else {
                SubmitMode::Compose
            };
            let sent = submit
                .handle_submit(text, mode, |text| async move {
                    info!(length = text.len(), "Message delivered");
                    true
                })
                .await;
            println!("{}", if sent { "sent" } else { "blocked" });
            print_status(&controller);
        }
        Command::Unlock => {
            let outcome = submit.handle_unlock().await;
            println!("{:?}", outcome);
            print_status(&controller);
        }
        Command::Reset => {
            controller.reset_limits().await?;
            print_status(&controller);
        }
        Command::Clear => {
            controller.clear_limits().await?;
            println!("cleared {}", controller.storage_key());
        }
        Command::Tokens { action } => {
            let balance = match action {
                TokenAction::Show => tokens.get().await?,
                TokenAction::Add { amount } => controller.reward_tokens(amount).await?,
                TokenAction::Set { amount } => tokens.set(amount).await?,
            };
            println!("{}", balance);
        }
        Command::Watch => {
            watch_cooldown(&controller).await;
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_status(controller: &LimitController) {
    let view = controller.view();
    println!("key:       {}", controller.storage_key());
    println!(
        "remaining: {}/{}",
        view.remaining_messages,
        controller.config().message_limit
    );
    println!("cooldown:  {}", describe_cooldown(&view));
    match view.token_balance {
        Some(balance) => println!("tokens:    {}", balance),
        None => println!("tokens:    unavailable"),
    }
    println!("locked:    {}", if view.is_locked { "yes" } else { "no" });
}

fn describe_cooldown(view: &LimitView) -> String {
    if view.is_cooldown_active {
        format_remaining(view.cooldown_ms_left)
    } else {
        "none".to_string()
    }
}

/// Print the countdown on every tick until the quota is restored or the
/// process is asked to stop.
async fn watch_cooldown(controller: &LimitController) {
    let mut rx = controller.subscribe();
    if !rx.borrow().is_locked {
        println!("not locked");
        return;
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = *rx.borrow_and_update();
                if !view.is_locked {
                    println!("unlocked");
                    break;
                }
                println!("{}", describe_cooldown(&view));
            }
            _ = &mut shutdown => {
                break;
            }
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
