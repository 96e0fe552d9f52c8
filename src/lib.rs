//! A continuous double-auction exchange for named instruments.
//!
//! Users hold cash and per-symbol share positions, submit limit and market
//! orders, and the engine matches them under price-time priority, settling
//! cash and positions atomically. Managers mint and burn the outstanding
//! float. The [`exchange::Exchange`] facade serializes writes per symbol;
//! [`api`] exposes the JSON surface over axum.

pub mod accounts;
pub mod api;
pub mod errors;
pub mod exchange;
pub mod matcher;
pub mod money;
pub mod orderbook;
pub mod orders;
pub mod simulate;
pub mod state;
pub mod store;
pub mod symbols;
pub mod trade;
