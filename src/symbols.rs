use serde::Serialize;

use crate::errors::{ExchangeError, ExchangeResult};
use crate::orders::{Price, SymbolId};

/// Hard cap on shares minted in a single call.
pub const MAX_MINT_PER_CALL: u64 = 1_000_000;

pub const MAX_TICKER_LEN: usize = 8;

/// A tradable instrument and its float.
///
/// `last_price`/`previous_price` are stamped by the order coordinator only,
/// after a submission that produced fills.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub id: SymbolId,
    pub ticker: String,
    pub outstanding: u64,
    pub last_price: Option<Price>,
    pub previous_price: Option<Price>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceDirection {
    Up,
    Down,
    Same,
}

impl Symbol {
    pub fn new(id: SymbolId, ticker: &str) -> Self {
        Symbol {
            id,
            ticker: ticker.to_string(),
            outstanding: 0,
            last_price: None,
            previous_price: None,
        }
    }

    /// Roll the old last price into `previous_price` and stamp a new last.
    /// When no price had printed yet, `previous_price` falls back to the
    /// executed price so the direction reads "same".
    pub fn record_execution(&mut self, price: Price) {
        self.previous_price = self.last_price.or(Some(price));
        self.last_price = Some(price);
    }

    pub fn price_direction(&self) -> PriceDirection {
        match (self.last_price, self.previous_price) {
            (Some(last), Some(prev)) if last > prev => PriceDirection::Up,
            (Some(last), Some(prev)) if last < prev => PriceDirection::Down,
            _ => PriceDirection::Same,
        }
    }
}

/// Tickers are 1 to 8 uppercase ASCII alphanumerics, e.g. `ACME` or `X9`.
pub fn validate_ticker(ticker: &str) -> ExchangeResult<()> {
    let well_formed = !ticker.is_empty()
        && ticker.len() <= MAX_TICKER_LEN
        && ticker
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());
    if !well_formed {
        return Err(ExchangeError::invalid(format!(
            "ticker must be 1-{MAX_TICKER_LEN} uppercase alphanumerics, got `{ticker}`"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_validation() {
        assert!(validate_ticker("ACME").is_ok());
        assert!(validate_ticker("X9").is_ok());
        assert!(validate_ticker("AAAAAAAA").is_ok());

        assert!(validate_ticker("").is_err());
        assert!(validate_ticker("toolongticker").is_err());
        assert!(validate_ticker("acme").is_err());
        assert!(validate_ticker("AC-ME").is_err());
    }

    #[test]
    fn price_direction_tracks_last_two_prints() {
        let mut s = Symbol::new(1, "ACME");
        assert_eq!(s.price_direction(), PriceDirection::Same);

        s.record_execution(10_000);
        // first print: previous falls back to the executed price
        assert_eq!(s.previous_price, Some(10_000));
        assert_eq!(s.price_direction(), PriceDirection::Same);

        s.record_execution(10_100);
        assert_eq!(s.previous_price, Some(10_000));
        assert_eq!(s.price_direction(), PriceDirection::Up);

        s.record_execution(9_900);
        assert_eq!(s.price_direction(), PriceDirection::Down);
    }
}
