//! Bitfinex v2 public and authenticated WebSocket protocol.
//!
//! Frames are either event objects (`{"event": ...}`) or channel arrays
//! `[chanId, payload]`. Channel 0 carries account data once authenticated.

use serde_json::{json, Value};

use crate::{
    credentials::Credentials,
    errors::StreamError,
    exchanges::traits::{ExchangeProtocol, Inbound, SnapshotMode},
    models::{
        BookLevel, CandleRecord, Channel, MarketUpdate, Side, StreamId, SubscriptionKey, Ticker,
        TradeRecord, UserChannel,
    },
    ws_shared::{as_row, field_f64, field_u64, parse_u64_lossy, resolve_bitfinex_symbol},
};

pub const EXCHANGE_NAME: &str = "bitfinex";

const ACCOUNT_CHANNEL_ID: u64 = 0;
const BOOK_LENGTHS: [u32; 4] = [1, 25, 100, 250];
const CANDLE_TIMEFRAMES: [&str; 13] = [
    "1m", "5m", "15m", "30m", "1h", "3h", "6h", "12h", "1D", "1W", "14D", "1M", "7D",
];

pub struct BitfinexProtocol {
    ws_url: String,
}

impl BitfinexProtocol {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }
}

impl ExchangeProtocol for BitfinexProtocol {
    fn name(&self) -> &'static str {
        EXCHANGE_NAME
    }

    fn ws_url(&self) -> &str {
        &self.ws_url
    }

    fn requires_handshake(&self) -> bool {
        true
    }

    /// `tXXXYYY` symbol, book length snapped to an allowed value.
    fn canonical_key(&self, key: SubscriptionKey) -> Result<SubscriptionKey, StreamError> {
        if key.is_user() {
            return Ok(key);
        }

        let symbol = resolve_bitfinex_symbol(&key.symbol)?;
        let channel = match key.channel {
            Channel::Book { depth } => Channel::Book {
                depth: snap_book_length(depth),
            },
            Channel::Candles { timeframe } => {
                let timeframe = timeframe.trim().to_string();
                if !CANDLE_TIMEFRAMES.contains(&timeframe.as_str()) {
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
            Channel::User { .. } => SnapshotMode::Empty,
            _ => SnapshotMode::Inline,
        }
    }

    fn stream_id_for(&self, key: &SubscriptionKey) -> Option<StreamId> {
        key.is_user().then_some(StreamId::Channel(ACCOUNT_CHANNEL_ID))
    }

    fn subscribe_message(&self, key: &SubscriptionKey, request_id: u64) -> String {
        let sub_id = request_id.to_string();
        let message = match &key.channel {
            Channel::Ticker => json!({
                "event": "subscribe",
                "channel": "ticker",
                "symbol": key.symbol,
                "subId": sub_id,
            }),
            Channel::Book { depth } => json!({
                "event": "subscribe",
                "channel": "book",
                "symbol": key.symbol,
                "prec": "P0",
                "freq": "F0",
                "len": depth.to_string(),
                "subId": sub_id,
            }),
            Channel::Trades => json!({
                "event": "subscribe",
                "channel": "trades",
                "symbol": key.symbol,
                "subId": sub_id,
            }),
            Channel::Candles { timeframe } => json!({
                "event": "subscribe",
                "channel": "candles",
                "key": format!("trade:{timeframe}:{}", key.symbol),
                "subId": sub_id,
            }),
            Channel::User { .. } => Value::Null,
        };
        message.to_string()
    }

    fn unsubscribe_message(&self, stream_id: &StreamId, _request_id: u64) -> String {
        let chan_id = match stream_id {
            StreamId::Channel(id) => json!(id),
            StreamId::Named(name) => json!(name),
        };
        json!({ "event": "unsubscribe", "chanId": chan_id }).to_string()
    }

    fn auth_message(&self, credentials: &Credentials, nonce: u64) -> Result<String, StreamError> {
        let payload = format!("AUTH{nonce}");
        let signature = credentials.sign_sha384(&payload)?;
        Ok(json!({
            "event": "auth",
            "apiKey": credentials.key(),
            "authSig": signature,
            "authNonce": nonce,
            "authPayload": payload,
        })
        .to_string())
    }

    fn parse_frame(&self, text: &str) -> Result<Vec<Inbound>, StreamError> {
        let value = serde_json::from_str::<Value>(text)
            .map_err(|err| StreamError::parse(format!("invalid JSON frame: {err}")))?;

        match value {
            Value::Object(_) => parse_event(value).map(|inbound| vec![inbound]),
            Value::Array(items) => parse_channel_frame(items),
            other => Err(StreamError::parse(format!("unexpected frame {other}"))),
        }
    }

    fn decode(&self, channel: &Channel, body: &Value) -> Result<Vec<MarketUpdate>, StreamError> {
        let items = as_row(body, "channel payload")?;
        let Some(first) = items.first() else {
            return Err(StreamError::parse("empty channel payload"));
        };

        match channel {
            Channel::Trades => decode_trades(items),
            Channel::Book { .. } => decode_book(first),
            Channel::Candles { .. } => decode_candles(first),
            Channel::Ticker => {
                let row = as_row(first, "ticker")?;
                Ok(vec![MarketUpdate::Ticker(parse_ticker(row)?)])
            }
            Channel::User { .. } => Err(StreamError::parse(
                "account data is not carried on public channels",
            )),
        }
    }
}

fn snap_book_length(depth: u32) -> u32 {
    BOOK_LENGTHS
        .iter()
        .copied()
        .find(|length| *length >= depth)
        .unwrap_or(BOOK_LENGTHS[BOOK_LENGTHS.len() - 1])
}

fn parse_event(value: Value) -> Result<Inbound, StreamError> {
    let event = value
        .get("event")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let code = value.get("code").and_then(Value::as_i64);
    let chan_id = value
        .get("chanId")
        .and_then(parse_u64_lossy)
        .map(StreamId::Channel);
    let sub_id = value.get("subId").and_then(parse_u64_lossy);
    let message = value
        .get("msg")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let inbound = match event.as_str() {
        "info" => Inbound::Info {
            handshake: value.get("version").is_some(),
            message: value,
        },
        "subscribed" => Inbound::Subscribed {
            request_id: sub_id
                .ok_or_else(|| StreamError::parse("subscribed event without subId"))?,
            stream_id: Some(
                chan_id.ok_or_else(|| StreamError::parse("subscribed event without chanId"))?,
            ),
        },
        "unsubscribed" => Inbound::Unsubscribed { stream_id: chan_id },
        "error" if sub_id.is_some() || value.get("channel").is_some() => Inbound::SubscribeFailed {
            request_id: sub_id,
            code: code.unwrap_or_default(),
            message,
        },
        "error" => Inbound::Error { code, message },
        "auth" => {
            if value.get("status").and_then(Value::as_str) == Some("OK") {
                Inbound::AuthOk
            } else {
                Inbound::AuthFailed {
                    message: if message.is_empty() {
                        "signature rejected".to_string()
                    } else {
                        message
                    },
                }
            }
        }
        _ => Inbound::Info {
            handshake: false,
            message: value,
        },
    };

    Ok(inbound)
}

fn parse_channel_frame(items: Vec<Value>) -> Result<Vec<Inbound>, StreamError> {
    let Some(chan_id) = items.first().and_then(parse_u64_lossy) else {
        return Err(StreamError::parse("channel frame without numeric chanId"));
    };

    match items.get(1) {
        Some(Value::String(tag)) if tag == "hb" || tag == "cs" => Ok(vec![Inbound::Heartbeat]),
        Some(Value::String(tag)) if chan_id == ACCOUNT_CHANNEL_ID => {
            parse_account_frame(tag, items.get(2))
        }
        Some(_) => Ok(vec![Inbound::Data {
            stream_id: StreamId::Channel(chan_id),
            body: Value::Array(items.into_iter().skip(1).collect()),
        }]),
        None => Err(StreamError::parse("channel frame without payload")),
    }
}

fn parse_account_frame(tag: &str, payload: Option<&Value>) -> Result<Vec<Inbound>, StreamError> {
    let channel = match tag {
        "os" | "on" | "ou" | "oc" => UserChannel::Orders,
        "te" | "tu" => UserChannel::Trades,
        "ws" | "wu" => UserChannel::Balances,
        _ => return Ok(Vec::new()),
    };
    let payload = payload.cloned().unwrap_or(Value::Null);

    let update = match tag {
        "os" | "ws" => MarketUpdate::AccountSnapshot {
            channel,
            rows: payload.as_array().cloned().unwrap_or_default(),
        },
        _ => MarketUpdate::Account {
            channel,
            event: tag.to_string(),
            row: payload,
        },
    };

    Ok(vec![Inbound::Account(update)])
}

fn is_nested(value: &Value) -> bool {
    value
        .as_array()
        .is_some_and(|rows| rows.is_empty() || rows.iter().all(Value::is_array))
}

fn decode_trades(items: &[Value]) -> Result<Vec<MarketUpdate>, StreamError> {
    match &items[0] {
        Value::String(tag) if tag == "te" => {
            let row = items
                .get(1)
                .ok_or_else(|| StreamError::parse("te message without trade"))?;
            Ok(vec![MarketUpdate::Trade(parse_trade(as_row(row, "trade")?)?)])
        }
        // `tu` repeats an already-seen `te` with its final id.
        Value::String(_) => Ok(Vec::new()),
        rows if is_nested(rows) => {
            let mut trades = as_row(rows, "trades snapshot")?
                .iter()
                .map(|row| parse_trade(as_row(row, "trade")?))
                .collect::<Result<Vec<_>, _>>()?;
            trades.sort_by(|left, right| right.timestamp.cmp(&left.timestamp));
            Ok(vec![MarketUpdate::TradesSnapshot(trades)])
        }
        row => Ok(vec![MarketUpdate::Trade(parse_trade(as_row(row, "trade")?)?)]),
    }
}

fn decode_book(payload: &Value) -> Result<Vec<MarketUpdate>, StreamError> {
    if is_nested(payload) {
        let levels = as_row(payload, "book snapshot")?
            .iter()
            .map(|row| parse_book_level(as_row(row, "book level")?))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(vec![MarketUpdate::BookSnapshot {
            levels,
            last_update_id: None,
        }]);
    }

    Ok(vec![MarketUpdate::BookDelta {
        levels: vec![parse_book_level(as_row(payload, "book level")?)?],
        first_update_id: None,
        last_update_id: None,
    }])
}

fn decode_candles(payload: &Value) -> Result<Vec<MarketUpdate>, StreamError> {
    if is_nested(payload) {
        let mut candles = as_row(payload, "candles snapshot")?
            .iter()
            .map(|row| parse_candle(as_row(row, "candle")?))
            .collect::<Result<Vec<_>, _>>()?;
        candles.sort_by_key(|candle| candle.open_time);
        return Ok(vec![MarketUpdate::CandlesSnapshot(candles)]);
    }

    Ok(vec![MarketUpdate::Candle(parse_candle(as_row(
        payload, "candle",
    )?)?)])
}

/// `[price, count, amount]`; positive amount is a bid, count 0 removes.
fn parse_book_level(row: &[Value]) -> Result<BookLevel, StreamError> {
    let price = field_f64(row, 0, "book level")?;
    let count = field_f64(row, 1, "book level")?;
    let amount = field_f64(row, 2, "book level")?;

    Ok(BookLevel {
        side: if amount > 0.0 { Side::Bid } else { Side::Ask },
        price,
        amount: if count == 0.0 { 0.0 } else { amount.abs() },
    })
}

/// `[id, mts, amount, price]`.
fn parse_trade(row: &[Value]) -> Result<TradeRecord, StreamError> {
    Ok(TradeRecord {
        id: row.first().and_then(parse_u64_lossy),
        timestamp: field_u64(row, 1, "trade")?,
        amount: field_f64(row, 2, "trade")?,
        price: field_f64(row, 3, "trade")?,
    })
}

/// `[mts, open, close, high, low, volume]`: close precedes high and low.
fn parse_candle(row: &[Value]) -> Result<CandleRecord, StreamError> {
    Ok(CandleRecord {
        open_time: field_u64(row, 0, "candle")?,
        open: field_f64(row, 1, "candle")?,
        close: field_f64(row, 2, "candle")?,
        high: field_f64(row, 3, "candle")?,
        low: field_f64(row, 4, "candle")?,
        volume: field_f64(row, 5, "candle")?,
    })
}

fn parse_ticker(row: &[Value]) -> Result<Ticker, StreamError> {
    Ok(Ticker {
        bid: field_f64(row, 0, "ticker")?,
        bid_size: field_f64(row, 1, "ticker")?,
        ask: field_f64(row, 2, "ticker")?,
        ask_size: field_f64(row, 3, "ticker")?,
        daily_change: field_f64(row, 4, "ticker")?,
        daily_change_relative: field_f64(row, 5, "ticker")?,
        last_price: field_f64(row, 6, "ticker")?,
        volume: field_f64(row, 7, "ticker")?,
        high: field_f64(row, 8, "ticker")?,
        low: field_f64(row, 9, "ticker")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol() -> BitfinexProtocol {
        BitfinexProtocol::new("wss://example.invalid/ws/2")
    }

    fn body(text: &str) -> (StreamId, Value) {
        let mut inbound = protocol().parse_frame(text).expect("frame should parse");
        match inbound.pop() {
            Some(Inbound::Data { stream_id, body }) => (stream_id, body),
            other => panic!("expected data frame, got {other:?}"),
        }
    }

    #[test]
    fn parses_info_subscribed_and_error_events() {
        let protocol = protocol();

        let info = protocol
            .parse_frame(r#"{"event":"info","version":2,"serverId":"abc","platform":{"status":1}}"#)
            .expect("info should parse");
        assert!(matches!(info[0], Inbound::Info { handshake: true, .. }));

        let subscribed = protocol
            .parse_frame(
                r#"{"event":"subscribed","channel":"book","chanId":17082,"symbol":"tBTCUSD","prec":"P0","freq":"F0","len":"25","subId":"7","pair":"BTCUSD"}"#,
            )
            .expect("subscribed should parse");
        assert_eq!(
            subscribed,
            vec![Inbound::Subscribed {
                request_id: 7,
                stream_id: Some(StreamId::Channel(17082)),
            }]
        );

        let failed = protocol
            .parse_frame(r#"{"event":"error","msg":"symbol: invalid","code":10300,"subId":"8","channel":"book"}"#)
            .expect("error should parse");
        assert_eq!(
            failed,
            vec![Inbound::SubscribeFailed {
                request_id: Some(8),
                code: 10300,
                message: "symbol: invalid".to_string(),
            }]
        );
    }

    #[test]
    fn decodes_book_snapshot_and_removal() {
        let protocol = protocol();
        let channel = Channel::Book { depth: 25 };

        let (stream_id, snapshot) =
            body("[17082,[[9085.7,1,0.5],[9084.7,1,0.15],[9100.6,1,-1.25]]]");
        assert_eq!(stream_id, StreamId::Channel(17082));

        let decoded = protocol
            .decode(&channel, &snapshot)
            .expect("snapshot should decode");
        let MarketUpdate::BookSnapshot { levels, .. } = &decoded[0] else {
            panic!("expected book snapshot, got {decoded:?}");
        };
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[2].side, Side::Ask);
        assert_eq!(levels[2].amount, 1.25);

        let (_, removal) = body("[17082,[9085.7,0,0.5]]");
        let decoded = protocol
            .decode(&channel, &removal)
            .expect("delta should decode");
        assert_eq!(
            decoded,
            vec![MarketUpdate::BookDelta {
                levels: vec![BookLevel {
                    side: Side::Bid,
                    price: 9085.7,
                    amount: 0.0,
                }],
                first_update_id: None,
                last_update_id: None,
            }]
        );
    }

    #[test]
    fn decodes_trades_and_ignores_tu_repeats() {
        let protocol = protocol();

        let (_, snapshot) = body("[42,[[401597393,1574694475039,0.005,7244.9],[401597395,1574694478808,-0.01,7245.1]]]");
        let decoded = protocol
            .decode(&Channel::Trades, &snapshot)
            .expect("trades snapshot should decode");
        let MarketUpdate::TradesSnapshot(trades) = &decoded[0] else {
            panic!("expected trades snapshot");
        };
        assert_eq!(trades[0].timestamp, 1574694478808);
        assert!(trades[0].is_sell());

        let (_, executed) = body(r#"[42,"te",[401597396,1574694479000,0.2,7246.0]]"#);
        let decoded = protocol
            .decode(&Channel::Trades, &executed)
            .expect("te should decode");
        assert!(matches!(&decoded[0], MarketUpdate::Trade(trade) if trade.id == Some(401597396)));

        let (_, repeat) = body(r#"[42,"tu",[401597396,1574694479000,0.2,7246.0]]"#);
        assert!(protocol
            .decode(&Channel::Trades, &repeat)
            .expect("tu should decode")
            .is_empty());
    }

    #[test]
    fn reorders_candle_fields_into_ohlc() {
        let protocol = protocol();
        let channel = Channel::Candles {
            timeframe: "1m".to_string(),
        };

        let (_, update) = body("[343351,[1561240140000,9300,9315,9320,9290,12.5]]");
        let decoded = protocol.decode(&channel, &update).expect("candle should decode");

        assert_eq!(
            decoded,
            vec![MarketUpdate::Candle(CandleRecord {
                open_time: 1561240140000,
                open: 9300.0,
                high: 9320.0,
                low: 9290.0,
                close: 9315.0,
                volume: 12.5,
            })]
        );

        let (_, snapshot) = body(
            "[343351,[[1561240200000,1,2,3,0.5,4],[1561240140000,1,2,3,0.5,4]]]",
        );
        let decoded = protocol.decode(&channel, &snapshot).expect("snapshot should decode");
        let MarketUpdate::CandlesSnapshot(candles) = &decoded[0] else {
            panic!("expected candles snapshot");
        };
        assert_eq!(candles[0].open_time, 1561240140000);
    }

    #[test]
    fn heartbeats_and_account_frames() {
        let protocol = protocol();

        assert_eq!(
            protocol.parse_frame(r#"[17082,"hb"]"#).expect("hb should parse"),
            vec![Inbound::Heartbeat]
        );

        let wallet = protocol
            .parse_frame(r#"[0,"wu",["exchange","BTC",1.5,0,null]]"#)
            .expect("wallet update should parse");
        assert!(matches!(
            &wallet[0],
            Inbound::Account(MarketUpdate::Account { channel: UserChannel::Balances, event, .. }) if event == "wu"
        ));

        let auth = protocol
            .parse_frame(r#"{"event":"auth","status":"FAILED","chanId":0,"code":10100,"msg":"apikey: invalid"}"#)
            .expect("auth should parse");
        assert_eq!(
            auth,
            vec![Inbound::AuthFailed {
                message: "apikey: invalid".to_string(),
            }]
        );

        let accepted = protocol
            .parse_frame(r#"{"event":"auth","status":"OK","chanId":0,"userId":1,"caps":{}}"#)
            .expect("auth should parse");
        assert_eq!(accepted, vec![Inbound::AuthOk]);
    }

    #[test]
    fn malformed_frames_are_parse_errors() {
        let protocol = protocol();
        assert!(matches!(
            protocol.parse_frame("not json"),
            Err(StreamError::ProtocolParse(_))
        ));
        let (_, bad) = body(r#"[5,["x",1,2]]"#);
        assert!(protocol.decode(&Channel::Book { depth: 25 }, &bad).is_err());
    }

    #[test]
    fn canonical_keys_snap_book_length_and_validate_timeframes() {
        let protocol = protocol();
        let key = protocol
            .canonical_key(SubscriptionKey::new("BTC/USD", Channel::Book { depth: 30 }))
            .expect("key should resolve");
        assert_eq!(key.symbol, "tBTCUSD");
        assert_eq!(key.channel, Channel::Book { depth: 100 });

        let candles = protocol.canonical_key(SubscriptionKey::new(
            "tBTCUSD",
            Channel::Candles {
                timeframe: "2m".to_string(),
            },
        ));
        assert!(matches!(candles, Err(StreamError::UnsupportedChannel { .. })));
    }

    #[test]
    fn auth_message_signs_the_nonce_payload() {
        let credentials = Credentials::new("key", "secret").expect("credentials should build");
        let message = protocol()
            .auth_message(&credentials, 1700000000000)
            .expect("auth message should build");
        let value: Value = serde_json::from_str(&message).expect("auth message should be JSON");

        assert_eq!(value["authPayload"], "AUTH1700000000000");
        assert_eq!(value["apiKey"], "key");
        assert_eq!(
            value["authSig"],
            credentials
                .sign_sha384("AUTH1700000000000")
                .expect("signature should compute")
        );
    }
}
