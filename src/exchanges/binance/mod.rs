//! Binance combined-stream protocol.
//!
//! Market streams are multiplexed over `/stream` and addressed by name
//! (`btcusdt@depth@100ms`). Book, trades and candles are seeded from the REST
//! API, see [`rest::BinanceRestSnapshots`].

pub mod rest;

use serde_json::{json, Value};

use crate::{
    credentials::Credentials,
    errors::StreamError,
    exchanges::traits::{ExchangeProtocol, Inbound, SnapshotMode},
    models::{
        BookLevel, CandleRecord, Channel, MarketUpdate, Side, StreamId, SubscriptionKey, Ticker,
        TradeRecord,
    },
    ws_shared::{parse_f64_lossy, parse_u64_lossy, resolve_binance_symbol},
};

pub const EXCHANGE_NAME: &str = "binance";

/// `{symbol}@depth@100ms` carries the whole book whatever depth a caller
/// asks for, so every book key shares this REST snapshot limit.
pub const BOOK_SNAPSHOT_DEPTH: u32 = 1000;
const KLINE_INTERVALS: [&str; 16] = [
    "1s", "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w",
    "1M",
];

pub struct BinanceProtocol {
    ws_url: String,
}

impl BinanceProtocol {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }
}

/// Stream name for a canonical key, e.g. `btcusdt@kline_1m`.
pub fn stream_name(key: &SubscriptionKey) -> String {
    let symbol = key.symbol.to_ascii_lowercase();
    match &key.channel {
        Channel::Ticker => format!("{symbol}@ticker"),
        Channel::Book { .. } => format!("{symbol}@depth@100ms"),
        Channel::Trades => format!("{symbol}@trade"),
        Channel::Candles { timeframe } => format!("{symbol}@kline_{timeframe}"),
        Channel::User { channel } => format!("{symbol}@{}", channel.as_str()),
    }
}

impl ExchangeProtocol for BinanceProtocol {
    fn name(&self) -> &'static str {
        EXCHANGE_NAME
    }

    fn ws_url(&self) -> &str {
        &self.ws_url
    }

    fn requires_handshake(&self) -> bool {
        false
    }

    fn canonical_key(&self, key: SubscriptionKey) -> Result<SubscriptionKey, StreamError> {
        if let Channel::User { channel } = key.channel {
            return Err(StreamError::UnsupportedChannel {
                exchange: EXCHANGE_NAME,
                channel: channel.as_str().to_string(),
            });
        }

        let symbol = resolve_binance_symbol(&key.symbol)?;
        let channel = match key.channel {
            Channel::Book { .. } => Channel::Book {
                depth: BOOK_SNAPSHOT_DEPTH,
            },
            Channel::Candles { timeframe } => {
                let timeframe = timeframe.trim().to_string();
                if !KLINE_INTERVALS.contains(&timeframe.as_str()) {
                    return Err(StreamError::UnsupportedChannel {
                        exchange: EXCHANGE_NAME,
                        channel: format!("candles:{timeframe}"),
                    });
                }
                Channel::Candles { timeframe }
            }
            other => other,
        };

        Ok(SubscriptionKey { symbol, channel })
    }

    fn snapshot_mode(&self, channel: &Channel) -> SnapshotMode {
        match channel {
            Channel::Ticker => SnapshotMode::Inline,
            Channel::User { .. } => SnapshotMode::Empty,
            _ => SnapshotMode::Fetch,
        }
    }

    fn stream_id_for(&self, key: &SubscriptionKey) -> Option<StreamId> {
        Some(StreamId::Named(stream_name(key)))
    }

    fn subscribe_message(&self, key: &SubscriptionKey, request_id: u64) -> String {
        json!({
            "method": "SUBSCRIBE",
            "params": [stream_name(key)],
            "id": request_id,
        })
        .to_string()
    }

    fn unsubscribe_message(&self, stream_id: &StreamId, request_id: u64) -> String {
        json!({
            "method": "UNSUBSCRIBE",
            "params": [stream_id.to_string()],
            "id": request_id,
        })
        .to_string()
    }

    fn auth_message(&self, _credentials: &Credentials, _nonce: u64) -> Result<String, StreamError> {
        Err(StreamError::Authentication(
            "binance market streams do not carry account data".to_string(),
        ))
    }

    fn parse_frame(&self, text: &str) -> Result<Vec<Inbound>, StreamError> {
        let value = serde_json::from_str::<Value>(text)
            .map_err(|err| StreamError::parse(format!("invalid JSON frame: {err}")))?;
        let Value::Object(object) = &value else {
            return Err(StreamError::parse(format!("unexpected frame {value}")));
        };

        if let (Some(stream), Some(data)) = (
            object.get("stream").and_then(Value::as_str),
            object.get("data"),
        ) {
            return Ok(vec![Inbound::Data {
                stream_id: StreamId::Named(stream.to_string()),
                body: data.clone(),
            }]);
        }

        let request_id = object.get("id").and_then(parse_u64_lossy);

        // `{"error": {"code", "msg"}, "id"}` or the flat `{"code", "msg", "id"}`.
        let error = object
            .get("error")
            .filter(|error| error.is_object())
            .or_else(|| object.contains_key("code").then_some(&value));
        if let Some(error) = error {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
            let message = error
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Ok(vec![match request_id {
                Some(request_id) => Inbound::SubscribeFailed {
                    request_id: Some(request_id),
                    code,
                    message,
                },
                None => Inbound::Error {
                    code: Some(code),
                    message,
                },
            }]);
        }

        match request_id {
            Some(request_id) if object.contains_key("result") => Ok(vec![Inbound::Subscribed {
                request_id,
                stream_id: None,
            }]),
            _ => Ok(vec![Inbound::Info {
                handshake: false,
                message: value,
            }]),
        }
    }

    fn decode(&self, channel: &Channel, body: &Value) -> Result<Vec<MarketUpdate>, StreamError> {
        let event = body.get("e").and_then(Value::as_str).unwrap_or_default();

        match (channel, event) {
            (Channel::Book { .. }, "depthUpdate") => Ok(vec![decode_depth_update(body)?]),
            (Channel::Trades, "trade") => Ok(vec![MarketUpdate::Trade(decode_trade(body)?)]),
            (Channel::Candles { .. }, "kline") => {
                let kline = body
                    .get("k")
                    .ok_or_else(|| StreamError::parse("kline event without `k`"))?;
                Ok(vec![MarketUpdate::Candle(decode_kline(kline)?)])
            }
            (Channel::Ticker, "24hrTicker") => Ok(vec![MarketUpdate::Ticker(decode_ticker(body)?)]),
            (_, event) => Err(StreamError::parse(format!(
                "unexpected `{event}` event on {} stream",
                channel.name()
            ))),
        }
    }
}

fn object_f64(value: &Value, field: &str, what: &str) -> Result<f64, StreamError> {
    value
        .get(field)
        .and_then(parse_f64_lossy)
        .ok_or_else(|| StreamError::parse(format!("{what}: `{field}` is not a number")))
}

fn object_u64(value: &Value, field: &str, what: &str) -> Result<u64, StreamError> {
    value
        .get(field)
        .and_then(parse_u64_lossy)
        .ok_or_else(|| StreamError::parse(format!("{what}: `{field}` is not an integer")))
}

/// `[["price", "qty"], ...]` for one side; quantity `"0"` removes the level.
pub(crate) fn parse_levels(
    levels: Option<&Value>,
    side: Side,
    what: &str,
) -> Result<Vec<BookLevel>, StreamError> {
    let Some(levels) = levels else {
        return Ok(Vec::new());
    };
    let rows = levels
        .as_array()
        .ok_or_else(|| StreamError::parse(format!("{what}: levels must be an array")))?;

    rows.iter()
        .map(|row| {
            let price = row.get(0).and_then(parse_f64_lossy);
            let amount = row.get(1).and_then(parse_f64_lossy);
            match (price, amount) {
                (Some(price), Some(amount)) => Ok(BookLevel {
                    side,
                    price,
                    amount: amount.abs(),
                }),
                _ => Err(StreamError::parse(format!("{what}: malformed level {row}"))),
            }
        })
        .collect()
}

fn decode_depth_update(body: &Value) -> Result<MarketUpdate, StreamError> {
    let first_update_id = object_u64(body, "U", "depth update")?;
    let last_update_id = object_u64(body, "u", "depth update")?;
    let mut levels = parse_levels(body.get("b"), Side::Bid, "depth update")?;
    levels.extend(parse_levels(body.get("a"), Side::Ask, "depth update")?);

    Ok(MarketUpdate::BookDelta {
        levels,
        first_update_id: Some(first_update_id),
        last_update_id: Some(last_update_id),
    })
}

/// `m == true` means the buyer was the maker, i.e. the aggressor sold.
fn decode_trade(body: &Value) -> Result<TradeRecord, StreamError> {
    let quantity = object_f64(body, "q", "trade")?;
    let buyer_is_maker = body.get("m").and_then(Value::as_bool).unwrap_or(false);

    Ok(TradeRecord {
        id: body.get("t").and_then(parse_u64_lossy),
        timestamp: object_u64(body, "T", "trade")?,
        amount: if buyer_is_maker { -quantity } else { quantity },
        price: object_f64(body, "p", "trade")?,
    })
}

fn decode_kline(kline: &Value) -> Result<CandleRecord, StreamError> {
    Ok(CandleRecord {
        open_time: object_u64(kline, "t", "kline")?,
        open: object_f64(kline, "o", "kline")?,
        high: object_f64(kline, "h", "kline")?,
        low: object_f64(kline, "l", "kline")?,
        close: object_f64(kline, "c", "kline")?,
        volume: object_f64(kline, "v", "kline")?,
    })
}

fn decode_ticker(body: &Value) -> Result<Ticker, StreamError> {
    Ok(Ticker {
        bid: object_f64(body, "b", "ticker")?,
        bid_size: object_f64(body, "B", "ticker")?,
        ask: object_f64(body, "a", "ticker")?,
        ask_size: object_f64(body, "A", "ticker")?,
        daily_change: object_f64(body, "p", "ticker")?,
        daily_change_relative: object_f64(body, "P", "ticker")? / 100.0,
        last_price: object_f64(body, "c", "ticker")?,
        volume: object_f64(body, "v", "ticker")?,
        high: object_f64(body, "h", "ticker")?,
        low: object_f64(body, "l", "ticker")?,
    })
}
