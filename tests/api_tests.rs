use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
    response::Response,
};
use http_body_util::BodyExt;

use exchange_engine::{api::router, state::AppState};
use serde_json::{Value, json};
use tempfile::tempdir;
use tower::ServiceExt;
use urlencoding::encode;

async fn test_app() -> (Router, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let state = AppState::new(dir.path()).await.unwrap();
    (router(state), dir)
}

async fn body_json(res: Response) -> Value {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post(uri: &str, user: Option<u64>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(id) = user {
        builder = builder.header("x-user-id", id.to_string());
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn delete(uri: &str, user: u64) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .header("x-user-id", user.to_string())
        .body(Body::empty())
        .unwrap()
}

/// Register a user and return their id.
async fn register(app: &Router, username: &str, role: &str) -> u64 {
    let res = app
        .clone()
        .oneshot(post(
            "/users",
            None,
            json!({ "username": username, "role": role }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    body_json(res).await["id"].as_u64().unwrap()
}

/// Manager + symbol with a minted float of 100.
async fn seeded(app: &Router) -> (u64, u64) {
    let manager = register(app, "boss", "manager").await;
    let res = app
        .clone()
        .oneshot(post("/symbols", Some(manager), json!({ "ticker": "ACME" })))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let symbol = body_json(res).await["id"].as_u64().unwrap();

    let res = app
        .clone()
        .oneshot(post(
            &format!("/symbols/{symbol}/mint"),
            Some(manager),
            json!({ "quantity": 100 }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    (manager, symbol)
}

#[tokio::test]
async fn registration_returns_the_funded_profile() {
    let (app, _tmp) = test_app().await;
    let res = app
        .clone()
        .oneshot(post(
            "/users",
            None,
            json!({ "username": "boss", "role": "manager" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let v = body_json(res).await;
    assert_eq!(v["username"], "boss");
    assert_eq!(v["role"], "manager");
    assert_eq!(v["cash_balance"], 10_000.0);
    assert_eq!(v["positions"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn admin_routes_refuse_non_managers() {
    let (app, _tmp) = test_app().await;
    let trader = register(&app, "trader", "user").await;

    let res = app
        .clone()
        .oneshot(post("/symbols", Some(trader), json!({ "ticker": "ACME" })))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    let v = body_json(res).await;
    assert_eq!(v["message"], "permission denied");
}

#[tokio::test]
async fn missing_user_header_is_a_bad_request() {
    let (app, _tmp) = test_app().await;
    let res = app
        .clone()
        .oneshot(post("/symbols", None, json!({ "ticker": "ACME" })))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let v = body_json(res).await;
    assert!(v["message"].as_str().unwrap().contains("x-user-id"));
}

#[tokio::test]
async fn market_buy_flows_through_book_profile_and_trades() {
    let (app, _tmp) = test_app().await;
    let (manager, symbol) = seeded(&app).await;
    let trader = register(&app, "trader", "user").await;

    let res = app
        .clone()
        .oneshot(post(
            "/orders",
            Some(manager),
            json!({ "symbol_id": symbol, "side": "sell", "type": "limit", "price": 100.0, "quantity": 10 }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let ack = body_json(res).await;
    assert_eq!(ack["orderStatus"], "OPEN");
    assert!(ack["orderId"].is_u64());

    let res = app
        .clone()
        .oneshot(post(
            "/orders",
            Some(trader),
            json!({ "symbol_id": symbol, "side": "buy", "type": "market", "quantity": 4 }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let ack = body_json(res).await;
    assert_eq!(ack["orderStatus"], "FILLED");
    assert!(ack["orderId"].is_null());
    assert_eq!(ack["tradesExecuted"], json!([{ "price": 100.0, "quantity": 4 }]));

    let res = app.clone().oneshot(get("/book/ACME")).await.unwrap();
    let book = body_json(res).await;
    assert_eq!(book["symbol"], "ACME");
    assert_eq!(book["lastPrice"], 100.0);
    assert_eq!(book["priceDirection"], "same");
    assert_eq!(book["sellOrders"], json!([{ "price": 100.0, "quantity": 6 }]));
    assert_eq!(book["buyOrders"].as_array().unwrap().len(), 0);

    let res = app
        .clone()
        .oneshot(get(&format!("/users/{trader}")))
        .await
        .unwrap();
    let profile = body_json(res).await;
    assert_eq!(profile["cash_balance"], 9_600.0);
    assert_eq!(
        profile["positions"],
        json!([{ "symbol_id": symbol, "symbol": "ACME", "quantity": 4 }])
    );

    let res = app.clone().oneshot(get("/trades/ACME")).await.unwrap();
    let trades = body_json(res).await;
    let items = trades.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["price"], 100.0);
    assert_eq!(items[0]["quantity"], 4);
    assert_eq!(items[0]["taker_side"], "buy");
    assert!(items[0]["timestamp"].is_u64());
}

#[tokio::test]
async fn crossing_limit_is_told_to_use_a_market_order() {
    let (app, _tmp) = test_app().await;
    let (manager, symbol) = seeded(&app).await;
    let trader = register(&app, "trader", "user").await;

    app.clone()
        .oneshot(post(
            "/orders",
            Some(manager),
            json!({ "symbol_id": symbol, "side": "sell", "type": "limit", "price": 100.0, "quantity": 10 }),
        ))
        .await
        .unwrap();

    let res = app
        .clone()
        .oneshot(post(
            "/orders",
            Some(trader),
            json!({ "symbol_id": symbol, "side": "buy", "type": "limit", "price": 100.0, "quantity": 5 }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let v = body_json(res).await;
    assert!(v["message"].as_str().unwrap().contains("market order"));
}

#[tokio::test]
async fn order_validation_maps_to_bad_request() {
    let (app, _tmp) = test_app().await;
    let (_manager, symbol) = seeded(&app).await;
    let trader = register(&app, "trader", "user").await;

    // zero quantity
    let res = app
        .clone()
        .oneshot(post(
            "/orders",
            Some(trader),
            json!({ "symbol_id": symbol, "side": "buy", "type": "limit", "price": 10.0, "quantity": 0 }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    // market order with a price
    let res = app
        .clone()
        .oneshot(post(
            "/orders",
            Some(trader),
            json!({ "symbol_id": symbol, "side": "sell", "type": "market", "price": 10.0, "quantity": 1 }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    // sub-cent price precision
    let res = app
        .clone()
        .oneshot(post(
            "/orders",
            Some(trader),
            json!({ "symbol_id": symbol, "side": "buy", "type": "limit", "price": 10.001, "quantity": 1 }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let v = body_json(res).await;
    assert!(v["message"].as_str().unwrap().contains("two decimals"));
}

#[tokio::test]
async fn limit_order_rests_then_cancel_removes_it() {
    let (app, _tmp) = test_app().await;
    let (_manager, symbol) = seeded(&app).await;
    let trader = register(&app, "trader", "user").await;

    let res = app
        .clone()
        .oneshot(post(
            "/orders",
            Some(trader),
            json!({ "symbol_id": symbol, "side": "buy", "type": "limit", "price": 48.0, "quantity": 10 }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let order_id = body_json(res).await["orderId"].as_u64().unwrap();

    let res = app.clone().oneshot(get("/book/ACME")).await.unwrap();
    let book = body_json(res).await;
    assert_eq!(book["buyOrders"][0]["price"], 48.0);

    let res = app
        .clone()
        .oneshot(delete(&format!("/orders/{order_id}"), trader))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app.clone().oneshot(get("/book/ACME")).await.unwrap();
    let book = body_json(res).await;
    assert_eq!(book["buyOrders"].as_array().unwrap().len(), 0);

    // cancelling again: not found or closed
    let res = app
        .clone()
        .oneshot(delete(&format!("/orders/{order_id}"), trader))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn trade_history_paginates_forward() {
    let (app, _tmp) = test_app().await;
    let (manager, symbol) = seeded(&app).await;
    let trader = register(&app, "trader", "user").await;

    app.clone()
        .oneshot(post(
            "/orders",
            Some(manager),
            json!({ "symbol_id": symbol, "side": "sell", "type": "limit", "price": 52.0, "quantity": 3 }),
        ))
        .await
        .unwrap();
    for _ in 0..2 {
        let res = app
            .clone()
            .oneshot(post(
                "/orders",
                Some(trader),
                json!({ "symbol_id": symbol, "side": "buy", "type": "market", "quantity": 1 }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    let res = app
        .clone()
        .oneshot(get("/trades/ACME/history?limit=1"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let page1 = body_json(res).await;
    assert_eq!(page1["items"].as_array().unwrap().len(), 1);
    let next = page1["next"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(get(&format!("/trades/ACME/history?limit=1&after={}", encode(&next))))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let page2 = body_json(res).await;
    assert_eq!(page2["items"].as_array().unwrap().len(), 1);
    assert!(page2["next"].is_null());
}

#[tokio::test]
async fn unknown_ticker_is_not_found() {
    let (app, _tmp) = test_app().await;
    let res = app.clone().oneshot(get("/book/NOPE")).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let v = body_json(res).await;
    assert_eq!(v["message"], "unknown symbol");
}

#[tokio::test]
async fn mint_and_burn_report_the_float() {
    let (app, _tmp) = test_app().await;
    let (manager, symbol) = seeded(&app).await;

    let res = app
        .clone()
        .oneshot(post(
            &format!("/symbols/{symbol}/burn"),
            Some(manager),
            json!({ "quantity": 40 }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["outstanding"], 60);

    // over the per-call cap
    let res = app
        .clone()
        .oneshot(post(
            &format!("/symbols/{symbol}/mint"),
            Some(manager),
            json!({ "quantity": 1_000_001 }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn symbol_deletion_conflicts_while_in_use() {
    let (app, _tmp) = test_app().await;
    let (manager, symbol) = seeded(&app).await;

    let res = app
        .clone()
        .oneshot(delete(&format!("/symbols/{symbol}"), manager))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    // burn the whole float, then deletion goes through
    app.clone()
        .oneshot(post(
            &format!("/symbols/{symbol}/burn"),
            Some(manager),
            json!({ "quantity": 100 }),
        ))
        .await
        .unwrap();
    let res = app
        .clone()
        .oneshot(delete(&format!("/symbols/{symbol}"), manager))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app.clone().oneshot(get("/book/ACME")).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deleting_the_last_manager_conflicts() {
    let (app, _tmp) = test_app().await;
    let manager = register(&app, "boss", "manager").await;

    let res = app
        .clone()
        .oneshot(delete(&format!("/users/{manager}"), manager))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let v = body_json(res).await;
    assert!(v["message"].as_str().unwrap().contains("manager"));
}
