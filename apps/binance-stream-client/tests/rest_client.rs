//! REST client against a local HTTP server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Query, RawQuery};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use binance_stream_client::infrastructure::binance::rest::{INTERNAL_ERROR, MAX_KLINE_LIMIT};
use binance_stream_client::infrastructure::binance::signer::Signer;
use binance_stream_client::{ApiError, CallError, Credentials, Interval, RestClient, RestError};
use serde_json::json;
use tokio::net::TcpListener;

const API_KEY: &str = "test-api-key";
const API_SECRET: &str = "test-api-secret";

fn credentials() -> Credentials {
    Credentials::new(API_KEY.to_string(), API_SECRET.to_string())
}

async fn klines(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    assert_eq!(params["symbol"], "BTCUSDT");
    assert_eq!(params["interval"], "1h");
    assert_eq!(params["limit"], MAX_KLINE_LIMIT.to_string());
    Json(json!([[
        1_499_040_000_000_i64, "0.01634790", "0.80000000", "0.01575800", "0.01577100",
        "148976.11427815", 1_499_644_799_999_i64, "2434.19055334", 308, "1756.87402397",
        "28.46694368", "0"
    ]]))
}

async fn account(headers: HeaderMap, RawQuery(query): RawQuery) -> impl IntoResponse {
    let query = query.unwrap_or_default();
    let (payload, signature) = query.rsplit_once("&signature=").unwrap();
    let expected = Signer::new(&credentials()).sign(payload);

    if headers.get("X-MBX-APIKEY").and_then(|v| v.to_str().ok()) != Some(API_KEY)
        || signature != expected
        || !payload.starts_with("recvWindow=5000&timestamp=")
    {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"code": -1022, "msg": "Signature for this request is not valid."})),
        );
    }

    (
        StatusCode::OK,
        Json(json!({
            "makerCommission": 15,
            "takerCommission": 15,
            "canTrade": true,
            "canWithdraw": true,
            "canDeposit": true,
            "updateTime": 123_456_789,
            "accountType": "SPOT",
            "balances": [{"asset": "BTC", "free": "4723846.89208129", "locked": "0.00000000"}]
        })),
    )
}

async fn serve() -> SocketAddr {
    let app = Router::new()
        .route("/api/v3/ping", get(|| async { Json(json!({})) }))
        .route(
            "/api/v3/time",
            get(|| async { Json(json!({"serverTime": 1_499_827_319_559_i64})) }),
        )
        .route("/api/v3/klines", get(klines))
        .route(
            "/api/v3/ticker/24hr",
            get(|| async {
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"code": -1121, "msg": "Invalid symbol."})),
                )
            }),
        )
        .route("/api/v3/account", get(account))
        .route(
            "/api/v3/userDataStream",
            post(|| async { Json(json!({"listenKey": "listen-key-1"})) })
                .put(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    addr
}

async fn rest(credentials: Option<Credentials>) -> RestClient {
    let addr = serve().await;
    RestClient::with_base_url(
        &format!("http://{addr}/api/v3"),
        credentials.as_ref(),
        Duration::from_millis(5000),
    )
    .unwrap()
}

#[tokio::test]
async fn public_endpoints_decode() {
    let rest = rest(None).await;

    rest.ping().await.unwrap();
    let time = rest.server_time().await.unwrap();
    assert_eq!(time.server_time.timestamp_millis(), 1_499_827_319_559);

    let klines = rest
        .klines("btcusdt", Interval::OneHour, Some(5000), None, None)
        .await
        .unwrap();
    assert_eq!(klines.len(), 1);
    assert_eq!(klines[0].trade_count, 308);
}

#[tokio::test]
async fn api_error_body_is_decoded() {
    let result = rest(None).await.ticker_24h("nope").await;
    match result {
        Err(CallError::Failed(RestError::Api(ApiError { code, msg }))) => {
            assert_eq!(code, -1121);
            assert_eq!(msg, "Invalid symbol.");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn signed_request_carries_key_and_signature() {
    let account = rest(Some(credentials())).await.account().await.unwrap();
    assert!(account.can_trade);
    assert_eq!(account.balances[0].asset, "BTC");
}

#[tokio::test]
async fn listen_key_lifecycle() {
    let rest = rest(Some(credentials())).await;

    let key = rest.create_listen_key().await.unwrap();
    assert_eq!(key.listen_key, "listen-key-1");

    let result = rest.keep_alive_listen_key(&key.listen_key).await;
    assert!(matches!(
        result,
        Err(CallError::Failed(RestError::Api(ApiError { code: INTERNAL_ERROR, .. })))
    ));
}
