// Per-symbol fan-out that keeps whatever succeeded
use crate::types::*;
use futures::future::join_all;
use std::future::Future;
use tracing::warn;

/// Fetch every symbol concurrently and keep the successes in input order.
///
/// Failures are logged and dropped. An all-failed fan-out yields an empty
/// Vec rather than an error.
pub async fn fetch_partial<T, F, Fut>(source: &str, symbols: &[String], fetch: F) -> Vec<(String, T)>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let futures = symbols.iter().map(|symbol| {
        let symbol = symbol.clone();
        let fut = fetch(symbol.clone());
        async move { (symbol, fut.await) }
    });

    let mut ok = Vec::with_capacity(symbols.len());
    for (symbol, result) in join_all(futures).await {
        match result {
            Ok(value) => ok.push((symbol, value)),
            Err(e) => warn!("{}: fetch failed for {}: {}", source, symbol, e),
        }
    }

    if ok.is_empty() && !symbols.is_empty() {
        warn!("{}: no symbols could be fetched ({} requested)", source, symbols.len());
    }
    ok
}
