use bincode::{Decode, Encode};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::orders::{OrderId, Price, Qty, Side, SymbolId, UserId};

/// Immutable record of one execution.
///
/// - The price comes from the maker's resting order.
/// - An order id is absent on a side that was taken by a market order.
/// - User ids are cleared when the account is later deleted.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Trade {
    /// Global execution sequence number; strictly increasing.
    pub seq: u64,
    pub symbol: SymbolId,
    pub price: Price,
    pub quantity: Qty,
    pub buy_order: Option<OrderId>,
    pub sell_order: Option<OrderId>,
    pub buyer: Option<UserId>,
    pub seller: Option<UserId>,
    pub taker_side: Side,
    /// Milliseconds since the unix epoch.
    pub timestamp: u64,
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
