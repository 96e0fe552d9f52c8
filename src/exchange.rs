//! The order coordinator: serializes submissions and cancellations per
//! symbol and applies validation, reservation, matching, settlement and
//! reconciliation as one atomic step.
//!
//! Locking discipline (always in this order, never the reverse):
//! registry -> market mutex -> accounts mutex. The ledger is locked inside
//! the per-symbol critical section so cash, positions and the book evolve
//! together; cross-symbol submissions only contend on the ledger lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::accounts::{Accounts, Role};
use crate::errors::{ExchangeError, ExchangeResult};
use crate::matcher;
use crate::money::Cents;
use crate::orderbook::{BookEntry, OrderBook};
use crate::orders::{Order, OrderId, OrderStatus, OrderType, Price, Qty, Side, SymbolId, UserId};
use crate::symbols::{self, MAX_MINT_PER_CALL, PriceDirection, Symbol};
use crate::trade::{self, Trade};

/// How many of the in-memory recent trades a query returns.
pub const RECENT_TRADES_RETURNED: usize = 20;

/// Upper bound on a single order's quantity; keeps every position delta well
/// inside `i64` range.
pub const MAX_ORDER_QTY: Qty = 1_000_000_000;

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Cash granted to every account at registration, in cents.
    pub starting_cash: Cents,
    /// Depth of the per-symbol in-memory recent-trade log.
    pub recent_depth: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            starting_cash: 1_000_000, // $10,000.00
            recent_depth: 100,
        }
    }
}

/// A submission as the engine sees it; prices already in cents.
#[derive(Debug, Clone, Copy)]
pub struct OrderRequest {
    pub symbol: SymbolId,
    pub side: Side,
    pub kind: OrderType,
    pub price: Option<Price>,
    pub quantity: Qty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubmitStatus {
    Filled,
    Partial,
    Open,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    /// Id of the resting order, for limit submissions. Market orders never
    /// rest and are not assigned ids.
    pub order_id: Option<OrderId>,
    pub status: SubmitStatus,
    pub trades: Vec<Trade>,
}

#[derive(Debug, Clone)]
pub struct Position {
    pub symbol_id: SymbolId,
    pub symbol: String,
    pub quantity: i64,
}

#[derive(Debug, Clone)]
pub struct Profile {
    pub id: UserId,
    pub username: String,
    pub role: Role,
    pub cash: Cents,
    pub positions: Vec<Position>,
}

/// Aggregated book snapshot for one symbol.
#[derive(Debug, Clone)]
pub struct BookView {
    pub symbol: String,
    pub last_price: Option<Price>,
    pub direction: PriceDirection,
    /// Bid levels, best (highest) first.
    pub bids: Vec<(Price, Qty)>,
    /// Ask levels, best (lowest) first.
    pub asks: Vec<(Price, Qty)>,
}

/// Everything mutable for one symbol, guarded by a single mutex so writes to
/// a symbol are serialized while distinct symbols proceed in parallel.
struct Market {
    symbol: Symbol,
    book: OrderBook,
    orders: HashMap<OrderId, Order>,
    /// Newest-first execution log, capped at `recent_depth`.
    recent: VecDeque<Trade>,
}

impl Market {
    fn new(symbol: Symbol) -> Self {
        Market {
            symbol,
            book: OrderBook::new(),
            orders: HashMap::new(),
            recent: VecDeque::new(),
        }
    }
}

#[derive(Default)]
struct Registry {
    by_id: HashMap<SymbolId, Arc<Mutex<Market>>>,
    by_ticker: HashMap<String, SymbolId>,
}

impl Registry {
    fn ticker_of(&self, symbol: SymbolId) -> Option<&str> {
        self.by_ticker
            .iter()
            .find(|(_, id)| **id == symbol)
            .map(|(ticker, _)| ticker.as_str())
    }
}

/// Limit/market distinction with the validated limit price attached.
#[derive(Debug, Clone, Copy)]
enum Pricing {
    Limit(Price),
    Market,
}

pub struct Exchange {
    cfg: ExchangeConfig,
    accounts: Mutex<Accounts>,
    registry: RwLock<Registry>,
    /// Order id -> owning symbol, so cancellations can find the right market.
    order_router: RwLock<HashMap<OrderId, SymbolId>>,
    next_user: AtomicU64,
    next_symbol: AtomicU64,
    next_order: AtomicU64,
    next_trade_seq: AtomicU64,
}

fn notional(price: Price, qty: Qty) -> ExchangeResult<Cents> {
    price
        .checked_mul(qty)
        .ok_or_else(|| ExchangeError::invalid("order notional overflows"))
}

impl Exchange {
    pub fn new(cfg: ExchangeConfig) -> Self {
        Exchange {
            cfg,
            accounts: Mutex::new(Accounts::new()),
            registry: RwLock::new(Registry::default()),
            order_router: RwLock::new(HashMap::new()),
            next_user: AtomicU64::new(1),
            next_symbol: AtomicU64::new(1),
            next_order: AtomicU64::new(1),
            next_trade_seq: AtomicU64::new(1),
        }
    }

    async fn market(&self, symbol: SymbolId) -> ExchangeResult<Arc<Mutex<Market>>> {
        self.registry
            .read()
            .await
            .by_id
            .get(&symbol)
            .cloned()
            .ok_or(ExchangeError::UnknownSymbol)
    }

    async fn market_by_ticker(&self, ticker: &str) -> ExchangeResult<Arc<Mutex<Market>>> {
        let registry = self.registry.read().await;
        let id = registry
            .by_ticker
            .get(ticker)
            .copied()
            .ok_or(ExchangeError::UnknownSymbol)?;
        registry
            .by_id
            .get(&id)
            .cloned()
            .ok_or(ExchangeError::UnknownSymbol)
    }

    fn require_manager(accounts: &Accounts, user: UserId) -> ExchangeResult<()> {
        match accounts.user(user)?.role {
            Role::Manager => Ok(()),
            Role::User => Err(ExchangeError::PermissionDenied),
        }
    }

    // ---- accounts ----

    pub async fn register_user(&self, username: &str, role: Role) -> ExchangeResult<Profile> {
        let username = username.trim();
        if username.is_empty() || username.len() > 32 {
            return Err(ExchangeError::invalid(
                "username must be 1-32 characters",
            ));
        }
        let mut accounts = self.accounts.lock().await;
        if accounts.username_taken(username) {
            return Err(ExchangeError::invalid(format!(
                "username `{username}` is already taken"
            )));
        }
        let id = self.next_user.fetch_add(1, Ordering::Relaxed);
        accounts.create_user(id, username.to_string(), role, self.cfg.starting_cash);
        info!(id, username, ?role, "user registered");
        Ok(Profile {
            id,
            username: username.to_string(),
            role,
            cash: self.cfg.starting_cash,
            positions: Vec::new(),
        })
    }

    /// Delete an account: allowed for the account holder or any manager,
    /// refused for the last remaining manager. The user's resting orders are
    /// cancelled without refund — their reservations are discarded along
    /// with the rest of the account's cash — positions cascade, and the
    /// user's ids are cleared from the recent trade logs.
    pub async fn delete_user(&self, acting: UserId, target: UserId) -> ExchangeResult<()> {
        {
            let mut accounts = self.accounts.lock().await;
            let actor_role = accounts.user(acting)?.role;
            if acting != target && actor_role != Role::Manager {
                return Err(ExchangeError::PermissionDenied);
            }
            let victim = accounts.user(target)?;
            if victim.role == Role::Manager && accounts.manager_count() == 1 {
                return Err(ExchangeError::LastManager);
            }
            // removing the ledger row first means no new submission can
            // slip in for this user while the books are swept below
            accounts.remove_user(target);
        }

        let markets: Vec<Arc<Mutex<Market>>> =
            self.registry.read().await.by_id.values().cloned().collect();
        for market in markets {
            let mut guard = market.lock().await;
            let m = &mut *guard;
            let open_ids: Vec<OrderId> = m
                .orders
                .values()
                .filter(|o| o.user == target && o.status == OrderStatus::Open)
                .map(|o| o.id)
                .collect();
            for id in open_ids {
                if let Some(order) = m.orders.get_mut(&id) {
                    order.status = OrderStatus::Cancelled;
                    order.remaining = 0;
                }
                // no refund here: the reservation was destroyed with the
                // account's cash above
                m.book.remove(id);
            }
            for t in m.recent.iter_mut() {
                if t.buyer == Some(target) {
                    t.buyer = None;
                }
                if t.seller == Some(target) {
                    t.seller = None;
                }
            }
        }
        info!(target, "user deleted");
        Ok(())
    }

    pub async fn profile(&self, user: UserId) -> ExchangeResult<Profile> {
        let registry = self.registry.read().await;
        let accounts = self.accounts.lock().await;
        let u = accounts.user(user)?;
        let positions = accounts
            .positions_of(user)
            .into_iter()
            .map(|(symbol_id, quantity)| Position {
                symbol_id,
                symbol: registry.ticker_of(symbol_id).unwrap_or_default().to_string(),
                quantity,
            })
            .collect();
        Ok(Profile {
            id: u.id,
            username: u.username.clone(),
            role: u.role,
            cash: u.cash,
            positions,
        })
    }

    pub async fn cash_balance(&self, user: UserId) -> ExchangeResult<Cents> {
        Ok(self.accounts.lock().await.user(user)?.cash)
    }

    pub async fn position(&self, user: UserId, symbol: SymbolId) -> i64 {
        self.accounts.lock().await.get_position(user, symbol)
    }

    // ---- symbol registry ----

    pub async fn create_symbol(&self, acting: UserId, ticker: &str) -> ExchangeResult<SymbolId> {
        symbols::validate_ticker(ticker)?;
        let mut registry = self.registry.write().await;
        {
            let accounts = self.accounts.lock().await;
            Self::require_manager(&accounts, acting)?;
        }
        if registry.by_ticker.contains_key(ticker) {
            return Err(ExchangeError::invalid(format!(
                "ticker `{ticker}` already exists"
            )));
        }
        let id = self.next_symbol.fetch_add(1, Ordering::Relaxed);
        registry.by_ticker.insert(ticker.to_string(), id);
        registry
            .by_id
            .insert(id, Arc::new(Mutex::new(Market::new(Symbol::new(id, ticker)))));
        info!(id, ticker, "symbol created");
        Ok(id)
    }

    /// Delete a symbol; refused while any resting order or non-zero position
    /// references it.
    pub async fn delete_symbol(&self, acting: UserId, symbol: SymbolId) -> ExchangeResult<()> {
        let mut registry = self.registry.write().await;
        let market = registry
            .by_id
            .get(&symbol)
            .cloned()
            .ok_or(ExchangeError::UnknownSymbol)?;
        let guard = market.lock().await;
        {
            let accounts = self.accounts.lock().await;
            Self::require_manager(&accounts, acting)?;
            if guard.book.has_orders() || accounts.symbol_in_use(symbol) {
                return Err(ExchangeError::SymbolInUse);
            }
        }
        let ticker = guard.symbol.ticker.clone();
        let order_ids: Vec<OrderId> = guard.orders.keys().copied().collect();
        drop(guard);

        {
            let mut router = self.order_router.write().await;
            for id in order_ids {
                router.remove(&id);
            }
        }
        registry.by_ticker.remove(&ticker);
        registry.by_id.remove(&symbol);
        info!(symbol, ticker = %ticker, "symbol deleted");
        Ok(())
    }

    /// Mint shares into the float, credited to the invoking manager.
    pub async fn mint(&self, acting: UserId, symbol: SymbolId, qty: Qty) -> ExchangeResult<u64> {
        if qty == 0 || qty > MAX_MINT_PER_CALL {
            return Err(ExchangeError::invalid(format!(
                "mint quantity must be 1-{MAX_MINT_PER_CALL}"
            )));
        }
        let market = self.market(symbol).await?;
        let mut guard = market.lock().await;
        let m = &mut *guard;
        let mut accounts = self.accounts.lock().await;
        Self::require_manager(&accounts, acting)?;

        m.symbol.outstanding = m
            .symbol
            .outstanding
            .checked_add(qty)
            .ok_or_else(|| ExchangeError::invalid("outstanding share count overflows"))?;
        accounts.adjust_position(acting, symbol, qty as i64)?;
        info!(symbol, qty, outstanding = m.symbol.outstanding, "minted");
        Ok(m.symbol.outstanding)
    }

    /// Burn shares out of the float; the manager must hold the shares being
    /// burned.
    pub async fn burn(&self, acting: UserId, symbol: SymbolId, qty: Qty) -> ExchangeResult<u64> {
        if qty == 0 {
            return Err(ExchangeError::invalid("burn quantity must be positive"));
        }
        let market = self.market(symbol).await?;
        let mut guard = market.lock().await;
        let m = &mut *guard;
        let mut accounts = self.accounts.lock().await;
        Self::require_manager(&accounts, acting)?;

        if accounts.get_position(acting, symbol) < qty as i64 {
            return Err(ExchangeError::InsufficientShares);
        }
        if m.symbol.outstanding < qty {
            return Err(ExchangeError::InsufficientShares);
        }
        m.symbol.outstanding -= qty;
        accounts.adjust_position(acting, symbol, -(qty as i64))?;
        info!(symbol, qty, outstanding = m.symbol.outstanding, "burned");
        Ok(m.symbol.outstanding)
    }

    pub async fn outstanding(&self, symbol: SymbolId) -> ExchangeResult<u64> {
        Ok(self.market(symbol).await?.lock().await.symbol.outstanding)
    }

    pub async fn symbol_id(&self, ticker: &str) -> ExchangeResult<SymbolId> {
        self.registry
            .read()
            .await
            .by_ticker
            .get(ticker)
            .copied()
            .ok_or(ExchangeError::UnknownSymbol)
    }

    // ---- order flow ----

    fn validate_shape(req: &OrderRequest) -> ExchangeResult<Pricing> {
        if req.quantity == 0 {
            return Err(ExchangeError::invalid("quantity must be >= 1"));
        }
        if req.quantity > MAX_ORDER_QTY {
            return Err(ExchangeError::invalid(format!(
                "quantity must be <= {MAX_ORDER_QTY}"
            )));
        }
        match (req.kind, req.price) {
            (OrderType::Limit, Some(price)) if price > 0 => Ok(Pricing::Limit(price)),
            (OrderType::Limit, _) => Err(ExchangeError::invalid(
                "limit orders require a positive price",
            )),
            (OrderType::Market, None) => Ok(Pricing::Market),
            (OrderType::Market, Some(_)) => Err(ExchangeError::invalid(
                "market orders must not carry a price",
            )),
        }
    }

    /// Submit an order. Either the whole submission is rejected with no state
    /// change, or it commits: reservation, any fills with their settlement,
    /// the resting residual, reconciliation refunds and the price stamp all
    /// land together under the symbol's lock.
    pub async fn submit(
        &self,
        user_id: UserId,
        req: OrderRequest,
    ) -> ExchangeResult<SubmitOutcome> {
        let pricing = Self::validate_shape(&req)?;
        let market = self.market(req.symbol).await?;
        let mut guard = market.lock().await;
        let m = &mut *guard;
        let mut accounts = self.accounts.lock().await;

        let cash = accounts.user(user_id)?.cash;
        let position = accounts.get_position(user_id, req.symbol);

        // a marketable limit is refused outright: resting orders never cross
        if let Pricing::Limit(price) = pricing {
            let crosses = match req.side {
                Side::Buy => m.book.best_ask().is_some_and(|ask| price >= ask),
                Side::Sell => m.book.best_bid().is_some_and(|bid| price <= bid),
            };
            if crosses {
                return Err(ExchangeError::CrossesBook);
            }
        }

        // resource preconditions
        let overhang = match req.side {
            Side::Sell => req.quantity.saturating_sub(position.max(0) as u64),
            Side::Buy => 0,
        };
        match (req.side, pricing) {
            (Side::Buy, Pricing::Limit(price)) => {
                if cash < notional(price, req.quantity)? {
                    return Err(ExchangeError::InsufficientFunds);
                }
            }
            (Side::Sell, _) if overhang > 0 => {
                if overhang > m.symbol.outstanding {
                    return Err(ExchangeError::InsufficientShares);
                }
                let reference = match pricing {
                    Pricing::Limit(price) => price,
                    Pricing::Market => m
                        .symbol
                        .last_price
                        .or_else(|| m.book.best_bid())
                        .ok_or(ExchangeError::NoLiquidity)?,
                };
                if cash < notional(reference, overhang)? {
                    return Err(ExchangeError::InsufficientFunds);
                }
            }
            _ => {}
        }

        // reservation: buy limits at full notional, sell limits at the short
        // overhang; market orders are checked per-fill instead
        match (req.side, pricing) {
            (Side::Buy, Pricing::Limit(price)) => {
                accounts.reserve_cash(user_id, notional(price, req.quantity)?)?;
            }
            (Side::Sell, Pricing::Limit(price)) if overhang > 0 => {
                accounts.reserve_cash(user_id, notional(price, overhang)?)?;
            }
            _ => {}
        }

        // limit orders rest immediately at full quantity and become a match
        // target for later submissions (including the owner's own)
        let taker_order_id = match pricing {
            Pricing::Limit(price) => {
                let id = self.next_order.fetch_add(1, Ordering::Relaxed);
                let order = Order {
                    id,
                    user: user_id,
                    symbol: req.symbol,
                    side: req.side,
                    kind: OrderType::Limit,
                    price: Some(price),
                    remaining: req.quantity,
                    status: OrderStatus::Open,
                    created: SystemTime::now(),
                    short_reserved: if req.side == Side::Sell { overhang } else { 0 },
                };
                m.book.insert(
                    req.side,
                    price,
                    BookEntry {
                        id,
                        user: user_id,
                        qty: req.quantity,
                    },
                );
                m.orders.insert(id, order);
                self.order_router.write().await.insert(id, req.symbol);
                Some(id)
            }
            Pricing::Market => None,
        };

        // matching
        let bound = match pricing {
            Pricing::Limit(price) => Some(price),
            Pricing::Market => None,
        };
        let cash_limit = match (req.side, pricing) {
            (Side::Buy, Pricing::Market) => Some(cash),
            _ => None,
        };
        let result = matcher::match_order(
            req.quantity,
            m.book.iter_matching(req.side, bound),
            cash_limit,
        );

        if matches!(pricing, Pricing::Market) && result.fills.is_empty() {
            return Err(ExchangeError::NoLiquidity);
        }

        // settlement: walk the proposed fills in order
        let maker_side = req.side.opposite();
        let now = trade::now_millis();
        let mut trades = Vec::with_capacity(result.fills.len());
        for fill in &result.fills {
            let maker_user = {
                let maker = m.orders.get_mut(&fill.maker_id).ok_or_else(|| {
                    ExchangeError::internal(format!("maker order {} missing", fill.maker_id))
                })?;
                maker.remaining = maker.remaining.saturating_sub(fill.qty);
                if maker.remaining == 0 {
                    maker.status = OrderStatus::Filled;
                }
                maker.user
            };
            m.book
                .decrement(maker_side, fill.price, fill.maker_id, fill.qty)
                .ok_or_else(|| {
                    ExchangeError::internal(format!("maker order {} not on book", fill.maker_id))
                })?;

            let (buyer, seller, buy_order, sell_order) = match req.side {
                Side::Buy => (user_id, maker_user, taker_order_id, Some(fill.maker_id)),
                Side::Sell => (maker_user, user_id, Some(fill.maker_id), taker_order_id),
            };

            let gross = notional(fill.price, fill.qty)?;
            accounts.adjust_position(buyer, req.symbol, fill.qty as i64)?;
            accounts.adjust_position(seller, req.symbol, -(fill.qty as i64))?;
            accounts.credit_cash(seller, gross)?;

            // buy legs that reserved cash up front (all limit buys) already
            // paid at their own limit; the maker-price difference comes back
            // as the reconciliation refund. Market-buy takers pay per fill.
            let buy_reserved_at = match req.side {
                Side::Buy => match pricing {
                    Pricing::Limit(price) => Some(price),
                    Pricing::Market => None,
                },
                Side::Sell => Some(fill.price),
            };
            match buy_reserved_at {
                Some(reserved_price) => {
                    let refund = notional(reserved_price.saturating_sub(fill.price), fill.qty)?;
                    if refund > 0 {
                        accounts.credit_cash(buyer, refund)?;
                    }
                }
                None => accounts.debit_cash(buyer, gross)?,
            }

            trades.push(Trade {
                seq: self.next_trade_seq.fetch_add(1, Ordering::Relaxed),
                symbol: req.symbol,
                price: fill.price,
                quantity: fill.qty,
                buy_order,
                sell_order,
                buyer: Some(buyer),
                seller: Some(seller),
                taker_side: req.side,
                timestamp: now,
            });
        }

        // residual bookkeeping for the resting order
        if let Some(id) = taker_order_id {
            if let Some(order) = m.orders.get_mut(&id) {
                order.remaining = result.residual;
                if order.remaining == 0 {
                    order.status = OrderStatus::Filled;
                }
            }
        }

        // price stamping from the last executed fill
        if let Some(last) = trades.last() {
            m.symbol.record_execution(last.price);
        }
        for t in &trades {
            m.recent.push_front(t.clone());
        }
        m.recent.truncate(self.cfg.recent_depth);

        let status = if result.residual == 0 {
            SubmitStatus::Filled
        } else if result.fills.is_empty() {
            SubmitStatus::Open
        } else {
            SubmitStatus::Partial
        };
        info!(
            symbol = m.symbol.ticker.as_str(),
            side = ?req.side,
            kind = ?req.kind,
            fills = trades.len(),
            residual = result.residual,
            "submission settled"
        );
        Ok(SubmitOutcome {
            order_id: taker_order_id,
            status,
            trades,
        })
    }

    /// Cancel a resting order, releasing exactly what its submission
    /// reserved: `price * remaining` for buys, the remaining short collateral
    /// for sells. A repeat cancel reports the order as not found or closed.
    pub async fn cancel(&self, user_id: UserId, order_id: OrderId) -> ExchangeResult<()> {
        let symbol = self
            .order_router
            .read()
            .await
            .get(&order_id)
            .copied()
            .ok_or(ExchangeError::UnknownOrder)?;
        let market = self.market(symbol).await?;
        let mut guard = market.lock().await;
        let m = &mut *guard;
        let mut accounts = self.accounts.lock().await;

        let order = m
            .orders
            .get_mut(&order_id)
            .ok_or(ExchangeError::UnknownOrder)?;
        if order.status != OrderStatus::Open {
            return Err(ExchangeError::UnknownOrder);
        }
        if order.user != user_id {
            return Err(ExchangeError::PermissionDenied);
        }
        let price = order
            .price
            .ok_or_else(|| ExchangeError::internal("resting order without a price"))?;
        let refund = match order.side {
            Side::Buy => notional(price, order.remaining)?,
            Side::Sell => notional(price, order.remaining.min(order.short_reserved))?,
        };
        order.status = OrderStatus::Cancelled;
        order.remaining = 0;
        if refund > 0 {
            accounts.credit_cash(user_id, refund)?;
        }
        m.book.remove(order_id);
        info!(order_id, refund, "order cancelled");
        Ok(())
    }

    // ---- market data ----

    pub async fn book_view(&self, ticker: &str) -> ExchangeResult<BookView> {
        let market = self.market_by_ticker(ticker).await?;
        let guard = market.lock().await;
        Ok(BookView {
            symbol: guard.symbol.ticker.clone(),
            last_price: guard.symbol.last_price,
            direction: guard.symbol.price_direction(),
            bids: guard.book.bid_levels(),
            asks: guard.book.ask_levels(),
        })
    }

    /// Most recent executions for a symbol, newest first, capped at
    /// [`RECENT_TRADES_RETURNED`].
    pub async fn recent_trades(&self, ticker: &str) -> ExchangeResult<Vec<Trade>> {
        let market = self.market_by_ticker(ticker).await?;
        let guard = market.lock().await;
        Ok(guard
            .recent
            .iter()
            .take(RECENT_TRADES_RETURNED)
            .cloned()
            .collect())
    }
}
