use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    config::ClientConfig,
    errors::StreamError,
    exchanges::traits::SnapshotSource,
    models::{CandleRecord, Channel, MarketUpdate, Side, SubscriptionKey, TradeRecord},
    ws_shared::{as_row, field_f64, field_u64, parse_f64_lossy, parse_u64_lossy},
};

use super::parse_levels;

const MAX_REST_LIMIT: usize = 1_000;

/// Initial book, trades and candles from the public REST API.
pub struct BinanceRestSnapshots {
    client: reqwest::Client,
    base_url: String,
    trade_limit: usize,
    candle_limit: usize,
}

impl BinanceRestSnapshots {
    pub fn new(config: &ClientConfig) -> Result<Self, StreamError> {
        Self::with_timeout(
            config.binance_rest_url.clone(),
            config.request_timeout,
            config.trade_capacity,
            config.candle_capacity,
        )
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        timeout: Duration,
        trade_limit: usize,
        candle_limit: usize,
    ) -> Result<Self, StreamError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            trade_limit: trade_limit.clamp(1, MAX_REST_LIMIT),
            candle_limit: candle_limit.clamp(1, MAX_REST_LIMIT),
        })
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value, StreamError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl SnapshotSource for BinanceRestSnapshots {
    async fn fetch_snapshot(&self, key: &SubscriptionKey) -> Result<MarketUpdate, StreamError> {
        let symbol = key.symbol.clone();
        tracing::debug!(key = %key, "fetching Binance REST snapshot");

        match &key.channel {
            Channel::Book { depth } => {
                let body = self
                    .get_json(
                        "/api/v3/depth",
                        &[("symbol", symbol), ("limit", depth.to_string())],
                    )
                    .await?;
                parse_depth_snapshot(&body)
            }
            Channel::Trades => {
                let body = self
                    .get_json(
                        "/api/v3/trades",
                        &[("symbol", symbol), ("limit", self.trade_limit.to_string())],
                    )
                    .await?;
                parse_rest_trades(&body)
            }
            Channel::Candles { timeframe } => {
                let body = self
                    .get_json(
                        "/api/v3/klines",
                        &[
                            ("symbol", symbol),
                            ("interval", timeframe.clone()),
                            ("limit", self.candle_limit.to_string()),
                        ],
                    )
                    .await?;
                parse_rest_klines(&body)
            }
            other => Err(StreamError::Snapshot(format!(
                "no REST snapshot for {} channel",
                other.name()
            ))),
        }
    }
}

/// `{"lastUpdateId", "bids": [[p, q]], "asks": [[p, q]]}`.
pub fn parse_depth_snapshot(body: &Value) -> Result<MarketUpdate, StreamError> {
    let last_update_id = body
        .get("lastUpdateId")
        .and_then(parse_u64_lossy)
        .ok_or_else(|| StreamError::Snapshot("depth snapshot without lastUpdateId".to_string()))?;

    let mut levels = parse_levels(body.get("bids"), Side::Bid, "depth snapshot")?;
    levels.extend(parse_levels(body.get("asks"), Side::Ask, "depth snapshot")?);

    Ok(MarketUpdate::BookSnapshot {
        levels,
        last_update_id: Some(last_update_id),
    })
}

/// REST returns oldest first; the trades model keeps newest first.
pub fn parse_rest_trades(body: &Value) -> Result<MarketUpdate, StreamError> {
    let rows = as_row(body, "trades snapshot")?;
    let mut trades = rows
        .iter()
        .map(|row| {
            let quantity = row
                .get("qty")
                .and_then(parse_f64_lossy)
                .ok_or_else(|| StreamError::parse(format!("trade without qty: {row}")))?;
            let price = row
                .get("price")
                .and_then(parse_f64_lossy)
                .ok_or_else(|| StreamError::parse(format!("trade without price: {row}")))?;
            let timestamp = row
                .get("time")
                .and_then(parse_u64_lossy)
                .ok_or_else(|| StreamError::parse(format!("trade without time: {row}")))?;
            let buyer_is_maker = row
                .get("isBuyerMaker")
                .and_then(Value::as_bool)
                .unwrap_or(false);

            Ok(TradeRecord {
                id: row.get("id").and_then(parse_u64_lossy),
                timestamp,
                amount: if buyer_is_maker { -quantity } else { quantity },
                price,
            })
        })
        .collect::<Result<Vec<_>, StreamError>>()?;

    trades.reverse();
    Ok(MarketUpdate::TradesSnapshot(trades))
}

/// `[[openTime, "o", "h", "l", "c", "v", closeTime, ...]]`, oldest first.
pub fn parse_rest_klines(body: &Value) -> Result<MarketUpdate, StreamError> {
    let rows = as_row(body, "klines snapshot")?;
    let mut candles = rows
        .iter()
        .map(|row| {
            let row = as_row(row, "kline")?;
            Ok(CandleRecord {
                open_time: field_u64(row, 0, "kline")?,
                open: field_f64(row, 1, "kline")?,
                high: field_f64(row, 2, "kline")?,
                low: field_f64(row, 3, "kline")?,
                close: field_f64(row, 4, "kline")?,
                volume: field_f64(row, 5, "kline")?,
            })
        })
        .collect::<Result<Vec<_>, StreamError>>()?;

    candles.sort_by_key(|candle| candle.open_time);
    Ok(MarketUpdate::CandlesSnapshot(candles))
}
