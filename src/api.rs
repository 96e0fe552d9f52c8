use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::warn;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{FromRequest, FromRequestParts, Path, Query, Request, State},
    http::{StatusCode, request::Parts},
    routing::{delete, get, post},
};

use crate::{
    accounts::Role,
    errors::ExchangeError,
    exchange::{BookView, OrderRequest, Profile, SubmitStatus},
    money,
    orders::{OrderType, Price, Side},
    state::AppState,
    trade::Trade,
};

type ApiErr = (StatusCode, Json<serde_json::Value>);

fn err(status: StatusCode, msg: &str) -> ApiErr {
    (status, Json(json!({ "message": msg })))
}

/// Map an engine rejection onto the wire envelope.
fn reject(e: ExchangeError) -> ApiErr {
    use ExchangeError::*;
    let status = match &e {
        InvalidInput(_) | CrossesBook | InsufficientFunds | InsufficientShares | NoLiquidity => {
            StatusCode::BAD_REQUEST
        }
        UnknownSymbol | UnknownOrder | UnknownUser => StatusCode::NOT_FOUND,
        PermissionDenied => StatusCode::FORBIDDEN,
        SymbolInUse | LastManager => StatusCode::CONFLICT,
        Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    err(status, &e.to_string())
}

/// The acting user, resolved by the external auth collaborator and conveyed
/// as an `x-user-id` header.
pub struct ActingUser(pub u64);

impl<S> FromRequestParts<S> for ActingUser
where
    S: Send + Sync,
{
    type Rejection = ApiErr;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(ActingUser)
            .ok_or_else(|| err(StatusCode::BAD_REQUEST, "missing or invalid x-user-id header"))
    }
}

/// JSON body extractor that logs rejected payloads before failing the
/// request.
pub struct LoggedJson<T>(pub T);

impl<S, T> FromRequest<S> for LoggedJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiErr;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        // capture request details for logging
        let method = req.method().clone();
        let uri = req.uri().clone();
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| err(StatusCode::BAD_REQUEST, &e.to_string()))?;

        match serde_json::from_slice::<T>(&bytes) {
            Ok(val) => Ok(LoggedJson(val)),
            Err(e) => {
                // cap body preview to avoid giant logs
                let preview = String::from_utf8_lossy(&bytes);
                let preview = &preview[..preview.len().min(4096)];
                warn!(
                    error = %e,
                    %method,
                    uri = %uri,
                    body_preview = %preview,
                    "request rejected: JSON deserialization failed"
                );
                Err(err(StatusCode::UNPROCESSABLE_ENTITY, &e.to_string()))
            }
        }
    }
}

// ---- request/response bodies ----

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    #[serde(default)]
    pub role: Option<Role>,
}

#[derive(Serialize)]
pub struct PositionBody {
    pub symbol_id: u64,
    pub symbol: String,
    pub quantity: i64,
}

#[derive(Serialize)]
pub struct ProfileBody {
    pub id: u64,
    pub username: String,
    pub role: Role,
    pub cash_balance: f64,
    pub positions: Vec<PositionBody>,
}

impl From<Profile> for ProfileBody {
    fn from(p: Profile) -> Self {
        ProfileBody {
            id: p.id,
            username: p.username,
            role: p.role,
            cash_balance: money::to_decimal(p.cash),
            positions: p
                .positions
                .into_iter()
                .map(|pos| PositionBody {
                    symbol_id: pos.symbol_id,
                    symbol: pos.symbol,
                    quantity: pos.quantity,
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
pub struct CreateSymbolRequest {
    pub ticker: String,
}

#[derive(Serialize)]
pub struct SymbolBody {
    pub id: u64,
    pub ticker: String,
}

#[derive(Deserialize)]
pub struct FloatRequest {
    pub quantity: u64,
}

#[derive(Serialize)]
pub struct FloatBody {
    pub outstanding: u64,
}

/// Request payload for `POST /orders`.
///
/// - `side`: buy or sell
/// - `type`: limit or market
/// - `price`: decimal limit price (required for limit, absent for market)
/// - `quantity`: how many shares to trade
#[derive(Deserialize)]
pub struct NewOrder {
    pub symbol_id: u64,
    pub side: Side,
    #[serde(rename = "type")]
    pub kind: OrderType,
    #[serde(default)]
    pub price: Option<f64>,
    pub quantity: u64,
}

#[derive(Serialize, Deserialize)]
pub struct ExecutedTrade {
    pub price: f64,
    pub quantity: u64,
}

/// Response for `POST /orders`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_status: SubmitStatus,
    /// Id of the resting limit order; absent for market orders.
    pub order_id: Option<u64>,
    pub trades_executed: Vec<ExecutedTrade>,
}

#[derive(Serialize)]
pub struct PriceLevelBody {
    pub price: f64,
    pub quantity: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookBody {
    pub symbol: String,
    pub last_price: Option<f64>,
    pub price_direction: crate::symbols::PriceDirection,
    /// Descending price.
    pub buy_orders: Vec<PriceLevelBody>,
    /// Ascending price.
    pub sell_orders: Vec<PriceLevelBody>,
}

impl From<BookView> for BookBody {
    fn from(view: BookView) -> Self {
        let level = |(price, quantity): (Price, u64)| PriceLevelBody {
            price: money::to_decimal(price),
            quantity,
        };
        BookBody {
            symbol: view.symbol,
            last_price: view.last_price.map(money::to_decimal),
            price_direction: view.direction,
            buy_orders: view.bids.into_iter().map(level).collect(),
            sell_orders: view.asks.into_iter().map(level).collect(),
        }
    }
}

#[derive(Serialize)]
pub struct TradeBody {
    pub price: f64,
    pub quantity: u64,
    pub taker_side: Side,
    /// Milliseconds since the unix epoch.
    pub timestamp: u64,
}

impl From<&Trade> for TradeBody {
    fn from(t: &Trade) -> Self {
        TradeBody {
            price: money::to_decimal(t.price),
            quantity: t.quantity,
            taker_side: t.taker_side,
            timestamp: t.timestamp,
        }
    }
}

fn default_limit() -> usize {
    100
}

#[derive(Deserialize)]
pub struct TradesQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    after: Option<String>,
}

#[derive(Serialize)]
pub struct TradesPage {
    pub items: Vec<TradeBody>,
    pub next: Option<String>,
}

fn parse_price(value: Option<f64>) -> Result<Option<Price>, ApiErr> {
    match value {
        None => Ok(None),
        Some(v) => money::from_decimal(v)
            .filter(|cents| *cents > 0)
            .map(Some)
            .ok_or_else(|| {
                err(
                    StatusCode::BAD_REQUEST,
                    "price must be a positive amount with at most two decimals",
                )
            }),
    }
}

fn log_rejected(payload: &NewOrder, reason: &str) {
    warn!(
        reason,
        side = ?payload.side,
        order_type = ?payload.kind,
        price = ?payload.price,
        quantity = payload.quantity,
        symbol_id = payload.symbol_id,
        "order rejected"
    );
}

// ---- handlers ----

/// `POST /users`
/// Registers an account with the configured starting balance.
pub async fn register_user(
    State(state): State<AppState>,
    LoggedJson(payload): LoggedJson<RegisterRequest>,
) -> Result<Json<ProfileBody>, ApiErr> {
    let role = payload.role.unwrap_or(Role::User);
    let profile = state
        .exchange
        .register_user(&payload.username, role)
        .await
        .map_err(reject)?;
    Ok(Json(profile.into()))
}

/// `GET /users/{id}`
/// Returns the account's balance and positions.
pub async fn get_profile(
    Path(id): Path<u64>,
    State(state): State<AppState>,
) -> Result<Json<ProfileBody>, ApiErr> {
    let profile = state.exchange.profile(id).await.map_err(reject)?;
    Ok(Json(profile.into()))
}

/// `DELETE /users/{id}`
/// Deletes an account (the holder themselves, or any manager). Refused for
/// the last remaining manager.
pub async fn delete_user(
    Path(id): Path<u64>,
    State(state): State<AppState>,
    ActingUser(acting): ActingUser,
) -> Result<Json<serde_json::Value>, ApiErr> {
    state.exchange.delete_user(acting, id).await.map_err(reject)?;
    Ok(Json(json!({ "message": "account deleted" })))
}

/// `POST /symbols` (manager only)
pub async fn create_symbol(
    State(state): State<AppState>,
    ActingUser(acting): ActingUser,
    LoggedJson(payload): LoggedJson<CreateSymbolRequest>,
) -> Result<Json<SymbolBody>, ApiErr> {
    let id = state
        .exchange
        .create_symbol(acting, &payload.ticker)
        .await
        .map_err(reject)?;
    Ok(Json(SymbolBody {
        id,
        ticker: payload.ticker,
    }))
}

/// `DELETE /symbols/{id}` (manager only)
/// Refused while resting orders or non-zero positions reference the symbol;
/// on success the persisted trade history for the symbol is dropped too.
pub async fn delete_symbol(
    Path(id): Path<u64>,
    State(state): State<AppState>,
    ActingUser(acting): ActingUser,
) -> Result<Json<serde_json::Value>, ApiErr> {
    state
        .exchange
        .delete_symbol(acting, id)
        .await
        .map_err(reject)?;
    state
        .store
        .write()
        .await
        .delete_trades(id)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))?;
    Ok(Json(json!({ "message": "symbol deleted" })))
}

/// `POST /symbols/{id}/mint` (manager only)
/// Adds shares to the float, credited to the invoking manager's position.
pub async fn mint(
    Path(id): Path<u64>,
    State(state): State<AppState>,
    ActingUser(acting): ActingUser,
    LoggedJson(payload): LoggedJson<FloatRequest>,
) -> Result<Json<FloatBody>, ApiErr> {
    let outstanding = state
        .exchange
        .mint(acting, id, payload.quantity)
        .await
        .map_err(reject)?;
    Ok(Json(FloatBody { outstanding }))
}

/// `POST /symbols/{id}/burn` (manager only)
/// Removes shares the manager holds from the float.
pub async fn burn(
    Path(id): Path<u64>,
    State(state): State<AppState>,
    ActingUser(acting): ActingUser,
    LoggedJson(payload): LoggedJson<FloatRequest>,
) -> Result<Json<FloatBody>, ApiErr> {
    let outstanding = state
        .exchange
        .burn(acting, id, payload.quantity)
        .await
        .map_err(reject)?;
    Ok(Json(FloatBody { outstanding }))
}

/// `POST /orders`
/// Submits an order and returns its status plus any executed fills.
///
/// *Success:* 200, JSON [`OrderAck`]
/// *Rejection:* 4xx, JSON `{ "message": ... }` per the engine's taxonomy
pub async fn create_order(
    State(state): State<AppState>,
    ActingUser(acting): ActingUser,
    LoggedJson(payload): LoggedJson<NewOrder>,
) -> Result<Json<OrderAck>, ApiErr> {
    let price = parse_price(payload.price).inspect_err(|_| {
        log_rejected(&payload, "unparseable price");
    })?;
    let req = OrderRequest {
        symbol: payload.symbol_id,
        side: payload.side,
        kind: payload.kind,
        price,
        quantity: payload.quantity,
    };
    let outcome = state.exchange.submit(acting, req).await.map_err(|e| {
        log_rejected(&payload, &e.to_string());
        reject(e)
    })?;

    // persist fills after the engine commits them
    {
        let mut store = state.store.write().await;
        for trade in &outcome.trades {
            store
                .insert_trade(trade)
                .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))?;
        }
    }

    Ok(Json(OrderAck {
        order_status: outcome.status,
        order_id: outcome.order_id,
        trades_executed: outcome
            .trades
            .iter()
            .map(|t| ExecutedTrade {
                price: money::to_decimal(t.price),
                quantity: t.quantity,
            })
            .collect(),
    }))
}

/// `DELETE /orders/{id}`
/// Cancels a resting order owned by the acting user, releasing its
/// reservation. A repeat cancel yields 404.
pub async fn cancel_order(
    Path(id): Path<u64>,
    State(state): State<AppState>,
    ActingUser(acting): ActingUser,
) -> Result<Json<serde_json::Value>, ApiErr> {
    state.exchange.cancel(acting, id).await.map_err(reject)?;
    Ok(Json(json!({ "message": "order cancelled" })))
}

/// `GET /book/{ticker}`
/// Returns the aggregated book snapshot with last price and direction.
pub async fn get_book(
    Path(ticker): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<BookBody>, ApiErr> {
    let view = state.exchange.book_view(&ticker).await.map_err(reject)?;
    Ok(Json(view.into()))
}

/// `GET /trades/{ticker}`
/// Most recent executions for the symbol, newest first (up to 20).
pub async fn get_recent_trades(
    Path(ticker): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<TradeBody>>, ApiErr> {
    let trades = state.exchange.recent_trades(&ticker).await.map_err(reject)?;
    Ok(Json(trades.iter().map(TradeBody::from).collect()))
}

/// `GET /trades/{ticker}/history?limit&after`
/// Pages the persisted trade log in ascending time with an opaque cursor.
pub async fn get_trade_history(
    Path(ticker): Path<String>,
    State(state): State<AppState>,
    Query(q): Query<TradesQuery>,
) -> Result<Json<TradesPage>, ApiErr> {
    let symbol = state.exchange.symbol_id(&ticker).await.map_err(reject)?;
    let limit = q.limit.min(1000);
    let (items, next) = {
        let store = state.store.read().await;
        store
            .page_trades_asc(symbol, q.after.as_deref(), limit)
            .map_err(|e| match e {
                crate::store::StoreError::BadCursor => err(StatusCode::BAD_REQUEST, "invalid cursor"),
                other => err(StatusCode::INTERNAL_SERVER_ERROR, &other.to_string()),
            })?
    };
    Ok(Json(TradesPage {
        items: items.iter().map(TradeBody::from).collect(),
        next,
    }))
}

/// Constructs the application's `Router` with all routes and shared state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/users", post(register_user))
        .route("/users/{id}", get(get_profile).delete(delete_user))
        .route("/symbols", post(create_symbol))
        .route("/symbols/{id}", delete(delete_symbol))
        .route("/symbols/{id}/mint", post(mint))
        .route("/symbols/{id}/burn", post(burn))
        .route("/orders", post(create_order))
        .route("/orders/{id}", delete(cancel_order))
        .route("/book/{ticker}", get(get_book))
        .route("/trades/{ticker}", get(get_recent_trades))
        .route("/trades/{ticker}/history", get(get_trade_history))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(
                    DefaultMakeSpan::new()
                        .include_headers(false)
                        .level(tracing::Level::TRACE),
                )
                .on_response(DefaultOnResponse::new().level(tracing::Level::TRACE)),
        )
        .with_state(state)
}
