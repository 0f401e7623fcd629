use anyhow::Context;
use hyperstream::exchanges::hyperliquid::{parse_l2_book, parse_trades};
use hyperstream::{ConnectionState, Stream, StreamConfig};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    // Reads ENDPOINT (or QUICKNODE_ENDPOINT) and the optional stream settings
    #[cfg(feature = "env-file")]
    let config = StreamConfig::from_env_file();
    #[cfg(not(feature = "env-file"))]
    let config = StreamConfig::from_env();
    let config = config.context("set ENDPOINT to a Hyperliquid WebSocket or HTTP endpoint")?;

    let stream = Stream::new(config)
        .on_open(|| info!("stream open"))
        .on_close(|| info!("stream closed"))
        .on_error(|e| warn!("stream error: {}", e))
        .on_state_change(|state: ConnectionState| info!(%state, "state changed"))
        .on_reconnect(|attempt| info!(attempt, "reconnected"));

    stream.trades(&["BTC", "ETH"], |payload| match parse_trades(payload) {
        Ok(trades) => {
            for trade in trades {
                println!(
                    "{} {:?} {} @ {} (notional {})",
                    trade.coin,
                    trade.side,
                    trade.sz,
                    trade.px,
                    trade.notional()
                );
            }
        }
        Err(e) => warn!("could not parse trades: {}", e),
    });

    stream.book_updates(&["BTC"], |payload| match parse_l2_book(payload) {
        Ok(book) => {
            if let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) {
                println!(
                    "{} bid {} / ask {} (spread {})",
                    book.coin,
                    bid.px,
                    ask.px,
                    ask.px - bid.px
                );
            }
        }
        Err(e) => warn!("could not parse book: {}", e),
    });

    stream.start()?;
    info!("streaming, press Ctrl+C to stop");

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for Ctrl+C")?,
        () = stream.wait() => warn!("stream closed on its own"),
    }

    stream.stop().await;
    Ok(())
}
