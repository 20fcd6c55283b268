use std::{net::Ipv4Addr, path::PathBuf, sync::Arc};

use anyhow::{Context, anyhow};
use axum::{
    Router,
    http::{
        Method,
        header::{ACCEPT, CONTENT_TYPE, ORIGIN},
    },
};
use clap::Parser;
use directories::ProjectDirs;
use double_apk_bridge::{
    BRIDGE_BASE_PATH, BridgeConfig, BridgeState, IntentRequest, Platform, PromptReceiver,
    RecordingPlatform, create_router,
    platform::{ACTION_MANAGE_UNKNOWN_APP_SOURCES, ACTION_VIEW},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const APP_NAME: &str = "Double";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Sets the IP address to bind the bridge server to
    #[arg(long, default_value = "127.0.0.1", env = "DOUBLE_HOST")]
    host: Ipv4Addr,

    /// Sets the Port to bind the bridge server to
    #[arg(long, default_value_t = 4570, env = "DOUBLE_PORT")]
    port: u16,

    /// Overrides where downloads and bridge state are kept
    #[arg(long, env = "DOUBLE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Answers every install-permission prompt with yes instead of asking on stdin
    #[arg(long, env = "DOUBLE_ASSUME_YES")]
    assume_yes: bool,

    /// Logs installer launches instead of opening downloaded packages
    #[arg(long, env = "DOUBLE_NO_LAUNCH")]
    no_launch: bool,
}

/// Desktop stand-in for the Android activity launcher. Packages are handed to
/// the system opener; there is no unknown-sources settings screen to show.
struct DesktopPlatform;

impl Platform for DesktopPlatform {
    fn start_activity(&self, intent: &IntentRequest) -> anyhow::Result<()> {
        match intent.action.as_str() {
            ACTION_VIEW => {
                let path = intent
                    .file_path()
                    .ok_or_else(|| anyhow!("install intent without a file path"))?;
                info!("📦 Opening {path}");
                open::that(path).with_context(|| format!("opening {path}"))
            }
            ACTION_MANAGE_UNKNOWN_APP_SOURCES => {
                info!("ℹ️ No unknown-sources setting on this platform, continuing");
                Ok(())
            }
            other => Err(anyhow!("unsupported activity {other}")),
        }
    }
}

fn resolve_data_dir(cli: &Cli) -> anyhow::Result<PathBuf> {
    if let Some(dir) = &cli.data_dir {
        return Ok(dir.clone());
    }
    let dirs = ProjectDirs::from("", "", APP_NAME)
        .ok_or_else(|| anyhow!("Could not determine home directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let env_filter = match rust_log.is_empty() {
        true => EnvFilter::builder().parse_lossy("info"),
        false => EnvFilter::builder().parse_lossy(rust_log),
    };
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let data_dir = resolve_data_dir(&args)?;
    info!("🚀 Initializing Double bridge...");
    info!("📂 Data Directory: {}", data_dir.display());

    let platform: Arc<dyn Platform> = if args.no_launch {
        Arc::new(RecordingPlatform::new())
    } else {
        Arc::new(DesktopPlatform)
    };

    let config = BridgeConfig::new(data_dir).with_env_overrides();
    let (state, prompts) = BridgeState::new(config, platform)?;
    tokio::spawn(answer_prompts(prompts, args.assume_yes));

    let startup = state.clone();
    tokio::spawn(async move { startup.on_start().await });

    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("🛑 Received Ctrl+C, shutting down server...");
                let _ = shutdown_tx.send(()).await;
            }
            Err(err) => {
                error!("Unable to listen for shutdown signal: {err}");
            }
        }
    });

    run_server(shutdown_rx, state, args.host, args.port).await
}

async fn answer_prompts(mut prompts: PromptReceiver, assume_yes: bool) {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    while let Some(prompt) = prompts.recv().await {
        if assume_yes {
            info!("✅ Auto-confirming: {}", prompt.purpose);
            prompt.confirm();
            continue;
        }

        println!("\n{}\nProceed with {}? [y/N]", prompt.rationale, prompt.purpose);
        match stdin.next_line().await {
            Ok(Some(line)) if matches!(line.trim().to_lowercase().as_str(), "y" | "yes") => {
                prompt.confirm();
            }
            Ok(Some(_)) => prompt.cancel(),
            Ok(None) => {
                warn!("stdin closed, declining pending and future prompts");
                prompt.cancel();
                while let Some(prompt) = prompts.recv().await {
                    prompt.cancel();
                }
                return;
            }
            Err(err) => {
                warn!("Failed to read answer: {err}");
                prompt.cancel();
            }
        }
    }
}

async fn run_server(
    mut shutdown_signal: tokio::sync::mpsc::Receiver<()>,
    state: BridgeState,
    host: Ipv4Addr,
    port: u16,
) -> anyhow::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, ACCEPT, ORIGIN])
        .allow_credentials(true);

    let app = Router::new()
        .nest(BRIDGE_BASE_PATH, create_router(state))
        .layer(cors);

    let listener_addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&listener_addr)
        .await
        .with_context(|| format!("Failed to bind bridge server on {listener_addr}"))?;

    info!("🌍 Bridge listening at http://{listener_addr}{BRIDGE_BASE_PATH}");
    info!("   Injection script: http://{listener_addr}{BRIDGE_BASE_PATH}/bridge.js");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_signal.recv().await;
            info!("🛑 Shutdown signal received.");
        })
        .await
        .context("bridge server failed")?;

    info!("✅ Bridge server shutdown complete.");
    Ok(())
}
