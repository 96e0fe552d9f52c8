use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

pub type OrderId = u64;
pub type UserId = u64;
pub type SymbolId = u64;
/// Prices are integer cents.
pub type Price = u64;
pub type Qty = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
}

/// A persisted order. Only limit orders are ever stored: market orders live
/// for a single submission and are not assigned ids.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: OrderId,
    pub user: UserId,
    pub symbol: SymbolId,
    pub side: Side,
    pub kind: OrderType,
    pub price: Option<Price>,
    /// Unfilled quantity. Zero once the order is FILLED or CANCELLED.
    pub remaining: Qty,
    pub status: OrderStatus,
    pub created: SystemTime,
    /// For sell limits: the quantity that was collateralised at submission
    /// because it exceeded the seller's position. Fixed for the order's
    /// lifetime; cancellation refunds `price * min(remaining, short_reserved)`.
    pub short_reserved: Qty,
}
