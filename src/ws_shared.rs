use serde_json::Value;

use crate::errors::StreamError;

pub const BINANCE_QUOTES: &[&str] = &["USDT", "USDC", "BUSD", "FDUSD", "TUSD", "BTC", "ETH"];

pub fn parse_u64_lossy(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| {
            value
                .as_i64()
                .and_then(|numeric| (numeric >= 0).then_some(numeric as u64))
        })
        .or_else(|| value.as_f64().and_then(|numeric| (numeric >= 0.0).then_some(numeric as u64)))
        .or_else(|| value.as_str().and_then(|text| text.parse::<u64>().ok()))
}

pub fn parse_f64_lossy(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_i64().map(|numeric| numeric as f64))
        .or_else(|| value.as_u64().map(|numeric| numeric as f64))
        .or_else(|| value.as_str().and_then(|text| text.parse::<f64>().ok()))
}

pub fn field_f64(row: &[Value], index: usize, what: &str) -> Result<f64, StreamError> {
    row.get(index)
        .and_then(parse_f64_lossy)
        .ok_or_else(|| StreamError::parse(format!("{what}: field {index} is not a number")))
}

pub fn field_u64(row: &[Value], index: usize, what: &str) -> Result<u64, StreamError> {
    row.get(index)
        .and_then(parse_u64_lossy)
        .ok_or_else(|| StreamError::parse(format!("{what}: field {index} is not an integer")))
}

pub fn as_row<'a>(value: &'a Value, what: &str) -> Result<&'a [Value], StreamError> {
    value
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| StreamError::parse(format!("{what}: expected an array, got {value}")))
}

/// `BTC/USD`, `btc-usd`, `BTCUSD` and `tBTCUSD` all become `tBTCUSD`.
pub fn resolve_bitfinex_symbol(symbol: &str) -> Result<String, StreamError> {
    let trimmed = symbol.trim();
    if let Some(pair) = trimmed.strip_prefix('t') {
        if pair.len() >= 6 && pair.chars().all(|ch| ch.is_ascii_uppercase() || ch == ':') {
            return Ok(trimmed.to_string());
        }
    }

    let core = trimmed.split(':').next().unwrap_or_default();
    let mut parts = core.split(&['/', '-'][..]);
    let base = sanitize_asset(parts.next().unwrap_or_default(), "Bitfinex")?;
    let Some(quote) = parts.next() else {
        if base.len() < 6 {
            return Err(invalid_symbol(symbol, "Bitfinex"));
        }
        return Ok(format!("t{base}"));
    };
    let quote = sanitize_asset(quote, "Bitfinex")?;
    if parts.next().is_some() {
        return Err(invalid_symbol(symbol, "Bitfinex"));
    }

    // Assets longer than three letters use the colon-separated pair form.
    if base.len() > 3 || quote.len() > 3 {
        Ok(format!("t{base}:{quote}"))
    } else {
        Ok(format!("t{base}{quote}"))
    }
}

/// `BTC/USDT`, `btcusdt` and `BTC-USDT` all become `BTCUSDT`.
pub fn resolve_binance_symbol(symbol: &str) -> Result<String, StreamError> {
    let trimmed = symbol.trim();
    if trimmed.is_empty() {
        return Err(StreamError::InvalidSymbol("`symbol` cannot be empty".to_string()));
    }

    let core = trimmed.split(':').next().unwrap_or_default().trim();
    if core.contains(&['/', '-'][..]) {
        let mut parts = core.split(&['/', '-'][..]);
        let base = sanitize_asset(parts.next().unwrap_or_default(), "Binance")?;
        let quote = sanitize_asset(parts.next().unwrap_or_default(), "Binance")?;
        if parts.next().is_some() {
            return Err(invalid_symbol(symbol, "Binance"));
        }
        return Ok(format!("{base}{quote}"));
    }

    let collapsed = sanitize_asset(core, "Binance")?;
    let has_quote = BINANCE_QUOTES
        .iter()
        .any(|quote| collapsed.len() > quote.len() && collapsed.ends_with(quote));
    if !has_quote {
        return Err(invalid_symbol(symbol, "Binance"));
    }

    Ok(collapsed)
}

fn sanitize_asset(value: &str, exchange_name: &str) -> Result<String, StreamError> {
    let normalized = value
        .trim()
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_uppercase();

    if normalized.is_empty() {
        return Err(StreamError::InvalidSymbol(format!(
            "invalid {exchange_name} symbol: base/quote assets must be non-empty"
        )));
    }

    Ok(normalized)
}

fn invalid_symbol(symbol: &str, exchange_name: &str) -> StreamError {
    StreamError::InvalidSymbol(format!("invalid {exchange_name} symbol `{symbol}`"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn lossy_number_parsing_accepts_strings_and_numbers() {
        assert_eq!(parse_f64_lossy(&json!("0.0015")), Some(0.0015));
        assert_eq!(parse_f64_lossy(&json!(-3)), Some(-3.0));
        assert_eq!(parse_u64_lossy(&json!("1561240140000")), Some(1561240140000));
        assert_eq!(parse_u64_lossy(&json!(-1)), None);
        assert_eq!(parse_f64_lossy(&json!(null)), None);
    }

    #[test]
    fn resolves_bitfinex_pairs() {
        assert_eq!(resolve_bitfinex_symbol("BTC/USD").ok().as_deref(), Some("tBTCUSD"));
        assert_eq!(resolve_bitfinex_symbol("tETHUSD").ok().as_deref(), Some("tETHUSD"));
        assert_eq!(resolve_bitfinex_symbol("btcusd").ok().as_deref(), Some("tBTCUSD"));
        assert_eq!(
            resolve_bitfinex_symbol("DOGE/USD").ok().as_deref(),
            Some("tDOGE:USD")
        );
        assert!(resolve_bitfinex_symbol("BTC").is_err());
    }

    #[test]
    fn resolves_binance_pairs() {
        assert_eq!(resolve_binance_symbol("btc/usdt").ok().as_deref(), Some("BTCUSDT"));
        assert_eq!(resolve_binance_symbol("ethbtc").ok().as_deref(), Some("ETHBTC"));
        assert_eq!(
            resolve_binance_symbol("BTC/USDT:USDT").ok().as_deref(),
            Some("BTCUSDT")
        );
        assert!(resolve_binance_symbol("BTC").is_err());
        assert!(resolve_binance_symbol("  ").is_err());
    }
}
