//! Market data retrieval for the strategy agent
//!
//! Candles and ticker snapshots from exchange REST APIs, normalized to
//! canonical "BASE-QUOTE" symbols. Sources fetch symbols independently so a
//! failure on one symbol never hides the others.

pub mod types;
pub mod sources {
    pub mod binance;
}
pub mod aggregators;
pub mod normalizers;
pub mod retry;

pub use aggregators::fetch_partial;
pub use normalizers::{normalize_symbol, quote_currency, split_symbol, to_exchange_symbol};
pub use retry::{RetryPolicy, Transient};
pub use sources::binance::BinanceRestSource;
pub use types::*;
