use chrono::Utc;
use paperbot::api::BinanceClient;
use paperbot::config::AppConfig;
use paperbot::models::{PriceTick, Signal};
use paperbot::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    tracing::info!("🚀 paperbot starting - paper trading engine");

    let config = AppConfig::load()?;
    let engine = Arc::new(config.build_engine().await?);

    let account = engine.account().await?;
    tracing::info!(
        "💼 Account: balance ${:.2} (starting ${:.2}, realized ${:+.2}), {} open positions",
        account.balance,
        account.starting_balance,
        account.realized_pnl(),
        engine.ledger().open_count().await
    );

    let (signal_tx, signal_rx) = mpsc::channel::<Signal>(config.engine.channel_capacity);
    let (tick_tx, tick_rx) = mpsc::channel::<PriceTick>(config.engine.channel_capacity);

    // Loop 1: price polling
    let feed_task = {
        let client = BinanceClient::with_base_url(&config.feed.base_url, &config.feed.quote_asset)?;
        let symbols = config.feed.symbols.clone();
        let poll = Duration::from_secs(config.feed.poll_secs);
        tokio::spawn(async move {
            price_poll_loop(client, symbols, poll, tick_tx).await;
        })
    };

    // Loop 2: signal ingestion (JSON lines on stdin)
    let signal_task = tokio::spawn(async move {
        signal_reader_loop(signal_tx).await;
    });

    // Loop 3: engine
    let engine_task = {
        let engine = Arc::clone(&engine);
        let intervals = config.intervals();
        tokio::spawn(async move {
            engine.run(signal_rx, tick_rx, intervals).await;
        })
    };

    tracing::info!("✅ All loops spawned successfully");
    tracing::info!(
        "  🔄 Price feed: {} every {}s",
        config.feed.symbols.join(", "),
        config.feed.poll_secs
    );
    tracing::info!("  📥 Signals: JSON lines on stdin");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
        }
        result = engine_task => {
            tracing::error!("Engine loop exited: {:?}", result);
        }
    }

    feed_task.abort();
    signal_task.abort();

    if let Err(e) = engine.flush_marks().await {
        tracing::error!("Failed to flush marks on shutdown: {}", e);
    }
    if let Err(e) = engine.snapshot(Utc::now()).await {
        tracing::error!("Failed to write final snapshot: {}", e);
    }

    tracing::info!("👋 paperbot stopped");
    Ok(())
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("paperbot=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn price_poll_loop(
    client: BinanceClient,
    symbols: Vec<String>,
    poll: Duration,
    ticks: mpsc::Sender<PriceTick>,
) {
    let mut timer = interval(poll);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        timer.tick().await;

        for symbol in &symbols {
            match client.get_price(symbol).await {
                Ok(tick) => {
                    tracing::debug!("{} @ ${:.4}", tick.symbol, tick.price);
                    if ticks.send(tick).await.is_err() {
                        tracing::warn!("Engine stopped accepting ticks, price feed exiting");
                        return;
                    }
                }
                Err(e) => tracing::warn!("Failed to fetch price for {}: {:#}", symbol, e),
            }
        }
    }
}

async fn signal_reader_loop(signals: mpsc::Sender<Signal>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match serde_json::from_str::<Signal>(line) {
                    Ok(signal) => {
                        tracing::info!(
                            "📥 Signal {} {} @ ${:.4} (confidence {:.2})",
                            signal.direction,
                            signal.symbol,
                            signal.entry_price,
                            signal.confidence
                        );
                        if signals.send(signal).await.is_err() {
                            tracing::warn!("Engine stopped accepting signals");
                            return;
                        }
                    }
                    Err(e) => tracing::warn!("Ignoring malformed signal: {}", e),
                }
            }
            Ok(None) => {
                tracing::info!("Signal input closed");
                return;
            }
            Err(e) => {
                tracing::error!("Failed to read signal input: {}", e);
                return;
            }
        }
    }
}
