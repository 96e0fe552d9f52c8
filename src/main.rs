use axum::Router;
use clap::{Parser, Subcommand};
use exchange_engine::state::AppState;
use exchange_engine::{api, simulate};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "exchange-engine")]
#[command(version = "0.1", about = "A continuous double-auction exchange engine")]
struct Cli {
    /// Directory for the persisted trade store
    #[arg(long, default_value = "exchange_store")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Server { port: u16 },
    /// Serve the HTTP API and drive random order flow against it
    Simulate { port: u16, secs: u64 },
}

fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let tc = token.clone();
    // spawn once to listen for ctrl-c
    tokio::spawn(async move {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl+C handler");
        tc.cancel();
    });
    token
}

async fn get_app_listener(port: u16, state: AppState) -> anyhow::Result<(TcpListener, Router)> {
    let app = api::router(state);
    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    Ok((listener, app))
}

async fn wait_for_server(api_base: &str) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    loop {
        // any response at all (even a 404) means the listener is up
        match client.get(format!("{api_base}/book/PING")).send().await {
            Ok(_) => break,
            Err(_) => tokio::time::sleep(Duration::from_millis(25)).await,
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    let state = AppState::new(&cli.data_dir).await?;
    let token = shutdown_token();
    let server_token = token.clone();

    match cli.command {
        Commands::Server { port } => {
            let (listener, app) = get_app_listener(port, state).await?;
            tracing::info!("HTTP server listening on 0.0.0.0:{port}");
            axum::serve(listener, app)
                .with_graceful_shutdown(server_token.cancelled_owned())
                .await?;
        }
        Commands::Simulate { port, secs } => {
            let mut handlers = tokio::task::JoinSet::new();
            let (listener, app) = get_app_listener(port, state).await?;
            handlers.spawn(async move {
                tracing::info!("HTTP server listening on 0.0.0.0:{port}");
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(server_token.cancelled_owned())
                    .await
                {
                    tracing::error!("server exited: {e}");
                }
            });

            let api_base = format!("http://127.0.0.1:{port}");
            wait_for_server(&api_base).await?;

            let sim_token = token.clone();
            let stop = token.clone();
            handlers.spawn(async move {
                let cfg = simulate::SimConfig {
                    api_base,
                    ticker: "ACME".to_string(),
                    run_secs: if secs == 0 { None } else { Some(secs) },
                    attack_rate_hz: 5.0,
                    noise_sigma: 0.4,
                    mean_qty: 4.0,
                };
                if let Err(e) = simulate::run_simulation(cfg, sim_token).await {
                    tracing::error!("simulation error: {e:?}");
                }
                // bring the server down once the run ends
                stop.cancel();
            });
            handlers.join_all().await;
        }
    }
    Ok(())
}
