//! Operator commands against the paperbot database
//!
//! Safe to run while the daemon is up: closes go through the same guarded
//! write path, so whichever process closes a position first wins.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use paperbot::config::AppConfig;
use paperbot::db::SqlitePersistence;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "paperbot-admin", about = "paperbot operator commands")]
struct Cli {
    /// Config file (without extension)
    #[arg(long, default_value = "config/default")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show balance and open positions
    Status,
    /// Realized PnL of positions closed on a UTC date
    DailyPnl {
        /// Date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Close a position manually
    ForceClose {
        id: Uuid,

        /// Exit price. Defaults to the last mark.
        #[arg(long)]
        price: Option<f64>,
    },
    /// Set the balance to an exact value with an audit adjustment
    ResetBalance {
        balance: f64,

        #[arg(long, default_value = "operator reset")]
        reason: String,
    },
    /// Delete closed positions before a date, keeping the balance unchanged
    Purge {
        /// Cutoff date (YYYY-MM-DD), exclusive
        before: NaiveDate,

        #[arg(long, default_value = "history purge")]
        reason: String,
    },
    /// Recent account snapshots and balance adjustments
    History {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("paperbot=warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    if let Commands::History { limit } = cli.command {
        return print_history(&config, limit).await;
    }

    let engine = config.build_engine().await?;

    match cli.command {
        Commands::Status => {
            let account = engine.account().await?;
            println!("Balance:          ${:.2}", account.balance);
            println!("Starting balance: ${:.2}", account.starting_balance);
            println!("Realized P&L:     ${:+.2}", account.realized_pnl());

            let today = engine.daily_realized_pnl(Utc::now().date_naive()).await?;
            println!("Today's P&L:      ${:+.2}", today);

            let open: Vec<_> = engine.ledger().get_open().await.collect();
            println!("\nOpen positions: {}", open.len());
            for p in open {
                println!(
                    "  {} {:<6} {:<5} entry ${:.4} mark ${:.4} unrealized ${:+.2} (opened {})",
                    p.id,
                    p.symbol,
                    p.direction,
                    p.entry_price,
                    p.last_price(),
                    p.unrealized_pnl.unwrap_or(0.0),
                    p.opened_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Commands::DailyPnl { date } => {
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            let pnl = engine.daily_realized_pnl(date).await?;
            println!("{}: ${:+.2}", date, pnl);
        }
        Commands::ForceClose { id, price } => {
            let position = engine
                .force_close(id, price, Utc::now())
                .await
                .with_context(|| format!("Failed to close position {}", id))?;
            println!(
                "{} {} closed @ ${:.4} ({}) P&L ${:+.2}",
                position.symbol,
                position.direction,
                position.exit_price.unwrap_or(position.entry_price),
                position
                    .close_reason
                    .map(|r| r.to_string())
                    .unwrap_or_default(),
                position.realized_pnl.unwrap_or(0.0)
            );
        }
        Commands::ResetBalance { balance, reason } => {
            let account = engine.reset_balance(balance, &reason, Utc::now()).await?;
            println!(
                "Balance is now ${:.2} (starting ${:.2})",
                account.balance, account.starting_balance
            );
        }
        Commands::Purge { before, reason } => {
            let purged = engine.purge_closed_before(before, &reason).await?;
            let account = engine.account().await?;
            println!(
                "Purged {} closed positions before {}; balance ${:.2}",
                purged, before, account.balance
            );
        }
        Commands::History { .. } => {}
    }

    Ok(())
}

async fn print_history(config: &AppConfig, limit: i64) -> Result<()> {
    let store = SqlitePersistence::new(&config.persistence.database_url).await?;

    println!("Snapshots (newest first):");
    for s in store.load_account_snapshots(limit).await? {
        println!(
            "  {}  balance ${:.2}  realized ${:+.2}  open {}",
            s.taken_at.format("%Y-%m-%d %H:%M:%S"),
            s.balance,
            s.realized_pnl,
            s.open_positions
        );
    }

    println!("\nBalance adjustments:");
    for a in store.load_adjustments().await? {
        println!(
            "  {}  {:+.2}  {}",
            a.created_at.format("%Y-%m-%d %H:%M:%S"),
            a.amount,
            a.reason
        );
    }

    Ok(())
}
