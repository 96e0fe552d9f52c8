//! Simulation harness for noisy order flow against a running engine.

use rand::Rng;
use rand_distr::{Distribution, Exp, Exp1, Normal};
use reqwest::{Client, ClientBuilder};
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
pub struct SimConfig {
    pub api_base: String,
    pub ticker: String,
    pub run_secs: Option<u64>,
    pub attack_rate_hz: f64, // Poisson rate lambda
    pub noise_sigma: f64,    // N(0, sigma) drift applied to mid each tick
    pub mean_qty: f64,       // average order size (unit-exp * mean_qty)
}

#[derive(Deserialize)]
struct Ack {
    #[serde(rename = "orderStatus")]
    status: String,
    #[serde(rename = "tradesExecuted")]
    trades: Vec<AckTrade>,
}

#[derive(Deserialize)]
struct AckTrade {
    price: f64,
    quantity: u64,
}

#[derive(Deserialize)]
struct Registered {
    id: u64,
}

#[derive(Deserialize)]
struct CreatedSymbol {
    id: u64,
}

pub struct SimWorld {
    pub manager: u64,
    pub traders: Vec<u64>,
    pub symbol_id: u64,
}

/// Register a manager and a handful of traders, create and mint the
/// simulated symbol, and seed a two-sided book so market orders have
/// something to hit.
pub async fn bootstrap(
    client: &Client,
    api_base: &str,
    ticker: &str,
    traders: usize,
) -> anyhow::Result<SimWorld> {
    let manager: Registered = client
        .post(format!("{api_base}/users"))
        .json(&json!({ "username": "overseer", "role": "manager" }))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let symbol: CreatedSymbol = client
        .post(format!("{api_base}/symbols"))
        .header("x-user-id", manager.id.to_string())
        .json(&json!({ "ticker": ticker }))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    client
        .post(format!("{api_base}/symbols/{}/mint", symbol.id))
        .header("x-user-id", manager.id.to_string())
        .json(&json!({ "quantity": 100_000u64 }))
        .send()
        .await?
        .error_for_status()?;

    let mut ids = Vec::with_capacity(traders);
    for i in 0..traders {
        let t: Registered = client
            .post(format!("{api_base}/users"))
            .json(&json!({ "username": format!("trader{i}") }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        ids.push(t.id);
    }

    // resting bid @48 and ask @52 from the manager's own inventory
    for (side, price) in [("buy", 48.0), ("sell", 52.0)] {
        client
            .post(format!("{api_base}/orders"))
            .header("x-user-id", manager.id.to_string())
            .json(&json!({
                "symbol_id": symbol.id,
                "side": side,
                "type": "limit",
                "price": price,
                "quantity": 50,
            }))
            .send()
            .await?
            .error_for_status()?;
        info!(side, price, "seeded resting order");
    }

    Ok(SimWorld {
        manager: manager.id,
        traders: ids,
        symbol_id: symbol.id,
    })
}

/// Noisy order-flow loop: passive limit quotes around a drifting mid, with
/// the occasional market order to take liquidity.
pub async fn run_simulation(cfg: SimConfig, cancel_token: CancellationToken) -> anyhow::Result<()> {
    // A small client timeout is helpful under load; tweak as desired.
    let client: Client = ClientBuilder::new()
        .timeout(Duration::from_secs(5))
        .build()?;

    let world = bootstrap(&client, &cfg.api_base, &cfg.ticker, 4).await?;

    let inter_arrival = Exp::new(cfg.attack_rate_hz).expect("attack_rate_hz must be > 0");
    let drift = Normal::new(0.0, cfg.noise_sigma).expect("noise_sigma >= 0");
    let size = Exp1;

    let mut mid: f64 = 50.0;
    let mut printed: u64 = 0;
    let mut volume: f64 = 0.0;
    let start = Instant::now();
    let spread = 1.0_f64;

    loop {
        // hard stop
        if let Some(max_secs) = cfg.run_secs {
            if start.elapsed().as_secs() >= max_secs {
                break;
            }
        }

        // exponential inter-arrival
        let wait_secs: f64 = inter_arrival.sample(&mut rand::rng());
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("received shutdown; exiting simulation loop");
                break;
            }
            _ = sleep(Duration::from_secs_f64(wait_secs)) => {}
        }

        mid = (mid + drift.sample(&mut rand::rng())).clamp(5.0, 500.0);
        let unit: f64 = size.sample(&mut rand::rng());
        let qty = (unit * cfg.mean_qty).max(1.0).round() as u64;
        let trader = world.traders[rand::rng().random_range(0..world.traders.len())];

        let body = if rand::rng().random_bool(0.7) {
            // passive quote around the mid
            let (side, raw) = if rand::rng().random_bool(0.5) {
                ("buy", mid - spread)
            } else {
                ("sell", mid + spread)
            };
            let price = (raw.max(1.0) * 100.0).round() / 100.0;
            json!({
                "symbol_id": world.symbol_id,
                "side": side,
                "type": "limit",
                "price": price,
                "quantity": qty,
            })
        } else {
            let side = if rand::rng().random_bool(0.5) { "buy" } else { "sell" };
            json!({
                "symbol_id": world.symbol_id,
                "side": side,
                "type": "market",
                "quantity": qty,
            })
        };

        match client
            .post(format!("{}/orders", cfg.api_base))
            .header("x-user-id", trader.to_string())
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => {
                if !resp.status().is_success() {
                    // crossing limits and dry-book market orders are expected
                    warn!(status = %resp.status(), "order post returned non-success");
                    continue;
                }
                match resp.json::<Ack>().await {
                    Ok(ack) => {
                        printed += ack.trades.len() as u64;
                        volume += ack
                            .trades
                            .iter()
                            .map(|t| t.price * t.quantity as f64)
                            .sum::<f64>();
                        info!(
                            elapsed = format_args!("{:.1}s", start.elapsed().as_secs_f64()),
                            status = ack.status.as_str(),
                            fills = ack.trades.len(),
                            mid = format_args!("{:.2}", mid),
                            printed,
                            volume = format_args!("{:.2}", volume),
                            "sim tick"
                        );
                    }
                    Err(e) => warn!(error = %e, "failed to parse order ack"),
                }
            }
            Err(e) => {
                warn!(error = %e, "HTTP request failed");
                continue;
            }
        }
    }

    info!(
        printed,
        volume = format_args!("{:.2}", volume),
        "simulation done"
    );
    Ok(())
}
