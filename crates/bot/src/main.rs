mod bus;
mod config;
mod logging;
mod matrix;

use core::time::Duration;
use std::{io::IsTerminal as _, path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context as _, Result, anyhow};
use bridge_core::{
    CommandRouter, Connection, EventSink, MessageDispatcher, SessionAuthenticator, TokenStore,
};
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tracing::{error, info, warn};

use crate::{
    bus::{JsonLinesSink, WebhookSink},
    config::BridgeConfig,
    logging::init_tracing,
    matrix::MatrixConnector,
};

const DEFAULT_DEVICE_NAME: &str = "matrix-command-bridge";

#[derive(Parser, Debug)]
#[command(
    name = "matrix-command-bridge",
    version,
    about = "Bridges Matrix room commands to a host event bus"
)]
struct Args {
    /// Path to the YAML config (homeserver, credentials, rooms, commands)
    #[arg(long, env = "MATRIX_CONFIG", default_value = "./config.yaml")]
    config: PathBuf,

    /// JSON file mapping user IDs to access tokens
    #[arg(long, env = "MATRIX_SESSION_FILE", default_value = "./.matrix.conf")]
    session_file: PathBuf,

    /// Password (overrides the config; if neither has one, will prompt if needed)
    #[arg(long, env = "MATRIX_PASSWORD")]
    password: Option<String>,

    /// Device display name used for password logins
    #[arg(long, env = "MATRIX_DEVICE_NAME")]
    device_name: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Listen for commands until Ctrl+C; send requests are read from stdin
    Run,
    /// Send one message to one or more rooms and exit
    Send {
        #[arg(long)]
        message: String,
        /// Room ID or alias; repeat for several rooms
        #[arg(long = "target", required = true)]
        targets: Vec<String>,
    },
    /// Check the configured username and password without storing a token
    Verify,
}

fn main() -> Result<ExitCode> {
    // Load .env if present so clap can pick up env vars.
    let _ = dotenvy::dotenv();
    init_tracing();
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    let result = runtime.block_on(run(args));
    // A pending stdin read would otherwise keep the process alive.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = BridgeConfig::load(&args.config)?;
    let device_name = args
        .device_name
        .clone()
        .or_else(|| config.device_name.clone())
        .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_owned());
    let connector = MatrixConnector::new(config.homeserver.clone(), config.verify_ssl, device_name)?;

    match args.command.clone().unwrap_or(Command::Run) {
        Command::Verify => {
            let password = resolve_password(args.password.clone(), config.password.clone(), false, &args)?;
            let auth = SessionAuthenticator::new(&config.username, password);
            match auth.verify(&connector).await {
                Ok(()) => {
                    info!(user = %config.username, "Credentials are valid");
                    println!("ok");
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    error!(code = e.code, error = %e.message, "Credentials rejected");
                    println!("invalid_auth");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Send { message, targets } => {
            let dispatcher = connect(&args, config, &connector).await?;
            let report = dispatcher.send(&message, &targets).await;
            info!(
                delivered = report.delivered.len(),
                failed = report.failed.len(),
                "Send finished"
            );
            Ok(if report.is_complete() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Run => {
            let dispatcher = connect(&args, config, &connector).await?;
            serve(dispatcher).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Logs in and wires the dispatcher; the listener is not started yet.
async fn connect(
    args: &Args,
    config: BridgeConfig,
    connector: &MatrixConnector,
) -> Result<Arc<MessageDispatcher>> {
    let mut store = TokenStore::open(&args.session_file);
    let has_token = store.token(&config.username).is_some();
    let password = resolve_password(args.password.clone(), config.password, has_token, args)?;

    let auth = SessionAuthenticator::new(&config.username, password);
    let connection: Arc<dyn Connection> = auth
        .authenticate(connector, &mut store)
        .await
        .context("login failed")?;
    info!(user = %connection.user_id(), "Logged in");

    let router = CommandRouter::new(connection.user_id(), config.commands, &config.rooms);
    for room in router.rooms() {
        if !config.rooms.iter().any(|r| r == room) {
            warn!(room = %room, "Commands scoped to a room that is not in `rooms` will never fire");
        }
    }

    let sink: Arc<dyn EventSink> = match config.webhook_url {
        Some(url) => {
            info!(url = %url, "Emitting command events to webhook");
            Arc::new(WebhookSink::new(reqwest::Client::new(), url))
        }
        None => Arc::new(JsonLinesSink::new(tokio::io::stdout())),
    };

    Ok(Arc::new(MessageDispatcher::new(
        connection,
        Arc::new(router),
        config.rooms,
        sink,
    )))
}

async fn serve(dispatcher: Arc<MessageDispatcher>) -> Result<()> {
    // Joining can take a while per room; keep it off the control loop.
    let mut starter = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.start().await })
    };

    let requests = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            if let Err(e) = bus::serve_send_requests(&dispatcher, stdin).await {
                warn!(error = ?e, "Send requests stopped");
            }
        })
    };

    info!("Bridge running. Press Ctrl+C to stop.");
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let outcome = tokio::select! {
        signal = &mut ctrl_c => signal.context("waiting for Ctrl+C"),
        started = &mut starter => match started.context("start task failed") {
            Ok(Ok(report)) => {
                for e in &report.failed {
                    warn!(room = %e.room, code = e.code, "Room left out of listening set");
                }
                (&mut ctrl_c).await.context("waiting for Ctrl+C")
            }
            // Without a listener no command can ever arrive.
            Ok(Err(e)) => Err(e.context("starting the listener")),
            Err(e) => Err(e),
        },
    };
    if outcome.is_ok() {
        info!("Stop requested");
    }

    starter.abort();
    requests.abort();
    dispatcher.stop().await;
    outcome
}

/// `--password`/`MATRIX_PASSWORD` wins over the config. With neither, a
/// terminal user is prompted unless a stored token may make it unnecessary.
fn resolve_password(
    arg: Option<String>,
    configured: Option<String>,
    has_token: bool,
    args: &Args,
) -> Result<Option<String>> {
    // Treat empty env/arg as missing.
    if let Some(p) = arg.map(|p| p.trim().to_owned()).filter(|p| !p.is_empty()) {
        return Ok(Some(p));
    }
    if configured.is_some() {
        return Ok(configured);
    }
    if has_token {
        return Ok(None);
    }
    if !std::io::stdin().is_terminal() {
        return Err(anyhow!(
            "No password provided and no stored token. In non-interactive mode, set MATRIX_PASSWORD, add `password` to {} or provide a token file at {}",
            args.config.display(),
            args.session_file.display()
        ));
    }
    warn!("No password provided via --password, MATRIX_PASSWORD or config. Prompting...");
    #[cfg(feature = "rpassword")]
    {
        rpassword::prompt_password("Matrix password:")
            .map(Some)
            .map_err(|e| anyhow!("Failed to read password: {e}"))
    }
    #[cfg(not(feature = "rpassword"))]
    {
        Err(anyhow!(
            "rpassword feature is not enabled. Cannot prompt for password."
        ))
    }
}
