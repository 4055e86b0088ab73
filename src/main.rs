use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, bail, Context};
use ferris_market_feeds::{
    models::{
        Callback, Change, InfoEvent, InfoHandler, Snapshot, StreamEvent, StreamHandle, Update,
        UserChannel,
    },
    ClientConfig, ExchangeName, ExchangeRegistry, ExchangeStreamClient,
};
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_EXCHANGE: &str = "bitfinex";
const DEFAULT_SYMBOL: &str = "BTCUSD";
const DEFAULT_CHANNELS: &str = "ticker,book,trades";
const DEFAULT_TIMEFRAME: &str = "1m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorChannel {
    Ticker,
    Book,
    Trades,
    Candles,
    User(UserChannel),
}

impl MonitorChannel {
    fn parse(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ticker" => Ok(Self::Ticker),
            "book" => Ok(Self::Book),
            "trades" => Ok(Self::Trades),
            "candles" => Ok(Self::Candles),
            "orders" => Ok(Self::User(UserChannel::Orders)),
            "usertrades" => Ok(Self::User(UserChannel::Trades)),
            "balances" => Ok(Self::User(UserChannel::Balances)),
            other => Err(anyhow!("unsupported channel: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
struct MonitorConfig {
    exchange: ExchangeName,
    symbol: String,
    channels: Vec<MonitorChannel>,
    timeframe: String,
    key_file: Option<PathBuf>,
}

impl MonitorConfig {
    fn from_env() -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| {
            std::env::var(key)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let exchange = var("FEED_EXCHANGE", DEFAULT_EXCHANGE)
            .parse::<ExchangeName>()
            .context("invalid FEED_EXCHANGE value")?;

        let channels = var("FEED_CHANNELS", DEFAULT_CHANNELS)
            .split(',')
            .filter(|value| !value.trim().is_empty())
            .map(MonitorChannel::parse)
            .collect::<anyhow::Result<Vec<_>>>()?;
        if channels.is_empty() {
            bail!("FEED_CHANNELS must name at least one channel");
        }

        let key_file = std::env::var("FEED_KEY_FILE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);
        if key_file.is_none() && channels.iter().any(|c| matches!(c, MonitorChannel::User(_))) {
            bail!("FEED_KEY_FILE is required for account channels");
        }

        Ok(Self {
            exchange,
            symbol: var("FEED_SYMBOL", DEFAULT_SYMBOL),
            channels,
            timeframe: var("FEED_TIMEFRAME", DEFAULT_TIMEFRAME),
            key_file,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let client_config = ClientConfig::from_env().context("failed to load client configuration")?;
    let monitor = MonitorConfig::from_env().context("failed to load monitor configuration")?;

    let client = ExchangeRegistry::with_defaults()
        .build(monitor.exchange, &client_config)
        .context("failed to build exchange client")?;

    client
        .connect(info_handler())
        .await
        .context("failed to connect")?;
    info!(exchange = client.name(), symbol = %monitor.symbol, "connected");

    if let Some(path) = &monitor.key_file {
        client
            .authenticate_with_key_file(path)
            .await
            .context("failed to authenticate")?;
        info!(exchange = client.name(), "authenticated");
    }

    let handles = subscribe_all(&client, &monitor).await?;

    shutdown_signal().await;

    for handle in &handles {
        client.unsubscribe(handle).await;
    }
    client.disconnect().await;
    info!(exchange = client.name(), "disconnected");

    Ok(())
}

async fn subscribe_all(
    client: &ExchangeStreamClient,
    monitor: &MonitorConfig,
) -> anyhow::Result<Vec<StreamHandle>> {
    let callback: Callback = Arc::new(log_event);
    let mut handles = Vec::with_capacity(monitor.channels.len());

    for channel in &monitor.channels {
        let symbol = monitor.symbol.as_str();
        let subscribed = match channel {
            MonitorChannel::Ticker => client.subscribe_ticker(symbol, callback.clone()).await,
            MonitorChannel::Book => {
                client
                    .subscribe_order_book(symbol, None, callback.clone())
                    .await
            }
            MonitorChannel::Trades => client.subscribe_trades(symbol, callback.clone()).await,
            MonitorChannel::Candles => {
                client
                    .subscribe_candles(symbol, &monitor.timeframe, callback.clone())
                    .await
            }
            MonitorChannel::User(user) => client.subscribe_user(*user, callback.clone()).await,
        };

        let (handle, snapshot) =
            subscribed.with_context(|| format!("failed to subscribe to {channel:?}"))?;
        info!(key = %handle.key, snapshot = %summarize_snapshot(&snapshot), "subscribed");
        handles.push(handle);
    }

    Ok(handles)
}

fn info_handler() -> InfoHandler {
    Arc::new(|event: InfoEvent| match event {
        InfoEvent::Info { sender, message } => info!(exchange = sender, %message, "info"),
        InfoEvent::Error {
            sender,
            code,
            message,
        } => warn!(exchange = sender, ?code, %message, "exchange error"),
        InfoEvent::Disconnected { sender, reason } => {
            warn!(exchange = sender, %reason, "connection lost")
        }
    })
}

fn log_event(event: &StreamEvent) {
    match &event.change {
        Change::Snapshot(snapshot) => {
            info!(key = %event.key, snapshot = %summarize_snapshot(snapshot), "snapshot")
        }
        Change::Update(update) => {
            info!(key = %event.key, update = %summarize_update(update), "update")
        }
        Change::Add(candle) => info!(
            key = %event.key,
            open_time = candle.open_time,
            close = candle.close,
            "candle opened"
        ),
        Change::ResyncRequired => warn!(key = %event.key, "order book out of sync"),
    }
}

fn summarize_snapshot(snapshot: &Snapshot) -> String {
    match snapshot {
        Snapshot::Book(book) => summarize_update(&Update::Book(book.clone())),
        Snapshot::Trades(trades) => format!("{} trades", trades.len()),
        Snapshot::Candles(candles) => match candles.last() {
            Some(candle) => format!("{} candles, last close {}", candles.len(), candle.close),
            None => "no candles".to_string(),
        },
        Snapshot::Ticker(ticker) => format!(
            "last {} bid {} ask {}",
            ticker.last_price, ticker.bid, ticker.ask
        ),
        Snapshot::Account(rows) => format!("{} account rows", rows.len()),
    }
}

fn summarize_update(update: &Update) -> String {
    match update {
        Update::Book(book) => match (book.best_bid(), book.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => format!("bid {bid} ask {ask}"),
            _ => "one-sided book".to_string(),
        },
        Update::Trade(trade) => format!("{} @ {}", trade.amount, trade.price),
        Update::Candle(candle) => format!("close {} volume {}", candle.close, candle.volume),
        Update::Ticker(ticker) => format!("last {}", ticker.last_price),
        Update::Account { event, row } => format!("{event} {row}"),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_max_level(Level::INFO)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c signal");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal_stream) => {
                signal_stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for terminate signal");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
