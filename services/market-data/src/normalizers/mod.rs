// Symbol normalization between the canonical "BASE-QUOTE" form and venue formats

/// Quote currencies recognized when splitting concatenated symbols, longest first
const KNOWN_QUOTES: &[&str] = &["FDUSD", "USDT", "USDC", "BUSD", "USD", "BTC", "ETH", "BNB"];

/// Normalize any common symbol spelling to canonical "BASE-QUOTE"
///
/// Accepts "BTC-USDT", "btc/usdt", "BTC/USDT:USDT", "BTC_USDT", "BTCUSDT"
/// and "cmt_btcusdt". Returns None when no base/quote split can be found.
pub fn normalize_symbol(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    // Drop a settlement suffix ("BTC/USDT:USDT")
    let without_settle = trimmed.split(':').next().unwrap_or(trimmed);
    let upper = without_settle.to_uppercase();
    let upper = upper.strip_prefix("CMT_").unwrap_or(&upper).to_string();

    for sep in ['-', '/', '_'] {
        if let Some((base, quote)) = upper.split_once(sep) {
            if base.is_empty() || quote.is_empty() {
                return None;
            }
            return Some(format!("{}-{}", base, quote));
        }
    }

    split_concatenated(&upper).map(|(base, quote)| format!("{}-{}", base, quote))
}

/// Split "BTCUSDT" into ("BTC", "USDT") using the known quote list
fn split_concatenated(symbol: &str) -> Option<(String, String)> {
    KNOWN_QUOTES.iter().find_map(|quote| {
        symbol
            .strip_suffix(quote)
            .filter(|base| !base.is_empty())
            .map(|base| (base.to_string(), quote.to_string()))
    })
}

/// Base and quote of a canonical symbol
pub fn split_symbol(symbol: &str) -> Option<(String, String)> {
    let canonical = normalize_symbol(symbol)?;
    canonical
        .split_once('-')
        .map(|(b, q)| (b.to_string(), q.to_string()))
}

/// Quote currency of a symbol, e.g. "USDT" for "BTC-USDT"
pub fn quote_currency(symbol: &str) -> Option<String> {
    split_symbol(symbol).map(|(_, q)| q)
}

/// Venue symbol for Binance-style REST APIs ("BTC-USDT" -> "BTCUSDT")
pub fn to_exchange_symbol(symbol: &str) -> String {
    match split_symbol(symbol) {
        Some((base, quote)) => format!("{}{}", base, quote),
        None => symbol.replace(['-', '/', '_'], "").to_uppercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_variants() {
        assert_eq!(normalize_symbol("BTC-USDT").as_deref(), Some("BTC-USDT"));
        assert_eq!(normalize_symbol("btc/usdt").as_deref(), Some("BTC-USDT"));
        assert_eq!(normalize_symbol("BTC/USDT:USDT").as_deref(), Some("BTC-USDT"));
        assert_eq!(normalize_symbol("ETH_USDC").as_deref(), Some("ETH-USDC"));
        assert_eq!(normalize_symbol("SOLUSDT").as_deref(), Some("SOL-USDT"));
        assert_eq!(normalize_symbol("cmt_btcusdt").as_deref(), Some("BTC-USDT"));
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert_eq!(normalize_symbol(""), None);
        assert_eq!(normalize_symbol("-USDT"), None);
        assert_eq!(normalize_symbol("USDT"), None);
    }

    #[test]
    fn test_exchange_symbol_and_quote() {
        assert_eq!(to_exchange_symbol("BTC-USDT"), "BTCUSDT");
        assert_eq!(to_exchange_symbol("eth/usdc"), "ETHUSDC");
        assert_eq!(quote_currency("BTC-USDT").as_deref(), Some("USDT"));
        assert_eq!(quote_currency("BTCFDUSD").as_deref(), Some("FDUSD"));
    }
}
