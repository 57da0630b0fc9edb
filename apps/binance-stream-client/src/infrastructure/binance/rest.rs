//! REST Client
//!
//! A small slice of the spot REST API, enough to fetch history, check the
//! clock and manage the user-data stream's listen key. Every method returns
//! a lazy [`CallFuture`]: nothing is sent until it is polled, and dropping it
//! aborts the request.
//!
//! # Authentication
//!
//! - Keyed endpoints carry the `X-MBX-APIKEY` header.
//! - Signed endpoints also append `recvWindow`, `timestamp` and an HMAC
//!   `signature` to the query string.
//!
//! Calling a keyed endpoint without credentials fails with API error -1002
//! before touching the network.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::serde::ts_milliseconds;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::{DeserializeOwned, IgnoredAny};
use tokio::task::JoinHandle;

use super::signer::Signer;
use crate::domain::topic::Interval;
use crate::infrastructure::adapter::{Call, CallAdapter, CallCallback, CallFuture};
use crate::infrastructure::config::{ClientConfig, Credentials};
use crate::infrastructure::metrics::{self, CallOutcome};

/// Code reported for server-side (5xx) failures.
pub const INTERNAL_ERROR: i64 = -1;

/// Code reported when a keyed endpoint is called without credentials.
pub const UNAUTHORIZED: i64 = -1002;

/// Largest `limit` the klines endpoint accepts.
pub const MAX_KLINE_LIMIT: u16 = 1000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Errors
// =============================================================================

/// Error body returned by the venue.
///
/// # Wire Format (JSON)
/// ```json
/// {"code": -1121, "msg": "Invalid symbol."}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, thiserror::Error)]
#[error("API error {code}: {msg}")]
pub struct ApiError {
    /// Venue error code.
    pub code: i64,
    /// Description, possibly empty.
    #[serde(default)]
    pub msg: String,
}

impl ApiError {
    /// Server-side failure with no usable body.
    #[must_use]
    pub const fn internal() -> Self {
        Self {
            code: INTERNAL_ERROR,
            msg: String::new(),
        }
    }

    /// Whether this is a server-side failure.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        self.code == INTERNAL_ERROR
    }
}

/// Errors from REST calls.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RestError {
    /// The venue answered with an error.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The request never got an answer.
    #[error("network error: {0}")]
    Network(String),

    /// The answer could not be decoded.
    #[error("JSON parsing error: {0}")]
    JsonParse(String),

    /// The request was refused locally.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The call was started twice.
    #[error("call already executed")]
    AlreadyExecuted,
}

impl From<reqwest::Error> for RestError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

impl From<serde_json::Error> for RestError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonParse(err.to_string())
    }
}

/// Decode a non-success response.
///
/// 5xx responses are internal errors regardless of body. Otherwise the body
/// is read as `{code,msg}`, falling back to the HTTP status as the code.
#[must_use]
pub fn decode_error(status: u16, body: &str) -> ApiError {
    if status >= 500 {
        return ApiError::internal();
    }
    serde_json::from_str(body).unwrap_or_else(|_| ApiError {
        code: i64::from(status),
        msg: String::new(),
    })
}

// =============================================================================
// Responses
// =============================================================================

/// Empty object returned by ping and listen-key maintenance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Empty {}

/// Server clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ServerTime {
    /// Current server time.
    #[serde(rename = "serverTime", with = "ts_milliseconds")]
    pub server_time: DateTime<Utc>,
}

/// User-data stream key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListenKey {
    /// Key to subscribe to on the stream endpoint.
    #[serde(rename = "listenKey")]
    pub listen_key: String,
}

/// Historical candle.
///
/// Decoded from the positional array the venue returns:
/// `[openTime, open, high, low, close, volume, closeTime, quoteVolume,
/// trades, takerBuyBase, takerBuyQuote, ignore]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawKline")]
pub struct Kline {
    /// Open time.
    pub open_time: DateTime<Utc>,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close price.
    pub close: Decimal,
    /// Base asset volume.
    pub volume: Decimal,
    /// Close time.
    pub close_time: DateTime<Utc>,
    /// Quote asset volume.
    pub quote_volume: Decimal,
    /// Number of trades.
    pub trade_count: u64,
    /// Taker buy base asset volume.
    pub taker_buy_base_volume: Decimal,
    /// Taker buy quote asset volume.
    pub taker_buy_quote_volume: Decimal,
}

#[derive(Deserialize)]
struct RawKline(
    i64,
    Decimal,
    Decimal,
    Decimal,
    Decimal,
    Decimal,
    i64,
    Decimal,
    u64,
    Decimal,
    Decimal,
    IgnoredAny,
);

impl TryFrom<RawKline> for Kline {
    type Error = String;

    fn try_from(raw: RawKline) -> Result<Self, Self::Error> {
        let millis = |ms: i64| {
            DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| format!("timestamp out of range: {ms}"))
        };
        Ok(Self {
            open_time: millis(raw.0)?,
            open: raw.1,
            high: raw.2,
            low: raw.3,
            close: raw.4,
            volume: raw.5,
            close_time: millis(raw.6)?,
            quote_volume: raw.7,
            trade_count: raw.8,
            taker_buy_base_volume: raw.9,
            taker_buy_quote_volume: raw.10,
        })
    }
}

/// Rolling 24h statistics for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker24h {
    /// Symbol.
    pub symbol: String,
    /// Absolute price change.
    pub price_change: Decimal,
    /// Relative price change, percent.
    pub price_change_percent: Decimal,
    /// Volume-weighted average price.
    pub weighted_avg_price: Decimal,
    /// Last price.
    pub last_price: Decimal,
    /// Open price.
    pub open_price: Decimal,
    /// High price.
    pub high_price: Decimal,
    /// Low price.
    pub low_price: Decimal,
    /// Base asset volume.
    pub volume: Decimal,
    /// Quote asset volume.
    pub quote_volume: Decimal,
    /// Window start.
    #[serde(with = "ts_milliseconds")]
    pub open_time: DateTime<Utc>,
    /// Window end.
    #[serde(with = "ts_milliseconds")]
    pub close_time: DateTime<Utc>,
    /// Trades in the window.
    pub count: u64,
}

/// Account summary.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    /// Maker commission, basis points.
    pub maker_commission: i64,
    /// Taker commission, basis points.
    pub taker_commission: i64,
    /// Trading allowed.
    pub can_trade: bool,
    /// Withdrawals allowed.
    pub can_withdraw: bool,
    /// Deposits allowed.
    pub can_deposit: bool,
    /// Last update.
    #[serde(with = "ts_milliseconds")]
    pub update_time: DateTime<Utc>,
    /// Account type, e.g. `SPOT`.
    #[serde(default)]
    pub account_type: String,
    /// Balances per asset.
    pub balances: Vec<Balance>,
}

/// Balance of one asset.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Balance {
    /// Asset code.
    pub asset: String,
    /// Available amount.
    pub free: Decimal,
    /// Amount locked in orders.
    pub locked: Decimal,
}

// =============================================================================
// HTTP Call
// =============================================================================

enum Request<T> {
    Pending(BoxFuture<'static, Result<T, RestError>>),
    Failed(RestError),
    Started,
}

/// One REST request as a [`Call`]. Runs on its own task once enqueued;
/// cancelling aborts the task.
pub struct HttpCall<T> {
    endpoint: &'static str,
    request: Request<T>,
    task: Option<JoinHandle<()>>,
    cancelled: AtomicBool,
}

impl<T> std::fmt::Debug for HttpCall<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCall")
            .field("endpoint", &self.endpoint)
            .field("started", &self.task.is_some())
            .field("cancelled", &self.is_cancelled_flag())
            .finish()
    }
}

impl<T> HttpCall<T> {
    /// Wrap a request future.
    pub fn new<F>(endpoint: &'static str, request: F) -> Self
    where
        F: Future<Output = Result<T, RestError>> + Send + 'static,
    {
        Self {
            endpoint,
            request: Request::Pending(Box::pin(request)),
            task: None,
            cancelled: AtomicBool::new(false),
        }
    }

    /// A call that fails with `error` when enqueued.
    #[must_use]
    pub const fn failed(endpoint: &'static str, error: RestError) -> Self {
        Self {
            endpoint,
            request: Request::Failed(error),
            task: None,
            cancelled: AtomicBool::new(false),
        }
    }

    fn is_cancelled_flag(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl<T: Send + 'static> Call for HttpCall<T> {
    type Output = T;
    type Error = RestError;

    fn enqueue(&mut self, callback: CallCallback<T, RestError>) {
        let endpoint = self.endpoint;
        match std::mem::replace(&mut self.request, Request::Started) {
            Request::Pending(request) => {
                self.task = Some(tokio::spawn(async move {
                    match request.await {
                        Ok(value) => {
                            metrics::record_rest_call(endpoint, CallOutcome::Success);
                            callback.on_success(value);
                        }
                        Err(error) => {
                            metrics::record_rest_call(endpoint, CallOutcome::Failure);
                            callback.on_failure(error);
                        }
                    }
                }));
            }
            Request::Failed(error) => {
                metrics::record_rest_call(endpoint, CallOutcome::Failure);
                callback.on_failure(error);
            }
            Request::Started => {
                callback.on_failure(RestError::AlreadyExecuted);
            }
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = &self.task {
            task.abort();
        }
        metrics::record_rest_call(self.endpoint, CallOutcome::Cancelled);
        tracing::debug!(endpoint = self.endpoint, "REST call cancelled");
    }

    fn is_cancelled(&self) -> bool {
        self.is_cancelled_flag()
    }
}

/// Future returned by every [`RestClient`] method.
pub type RestCall<T> = CallFuture<HttpCall<T>>;

// =============================================================================
// Client
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Auth {
    None,
    Keyed,
    Signed,
}

/// Spot REST client.
#[derive(Debug, Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    signer: Option<Arc<Signer>>,
    recv_window: Duration,
    adapter: CallAdapter<RestError>,
}

impl RestClient {
    /// Create a client from the full configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self, RestError> {
        Self::with_base_url(
            &config.endpoints.rest_url,
            config.credentials.as_ref(),
            config.recv_window,
        )
    }

    /// Create a client against an explicit base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_base_url(
        base_url: &str,
        credentials: Option<&Credentials>,
        recv_window: Duration,
    ) -> Result<Self, RestError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(Self {
            client,
            base_url,
            signer: credentials.map(|c| Arc::new(Signer::new(c))),
            recv_window,
            adapter: CallAdapter::new().with_error_hook(|error: &RestError| {
                tracing::warn!(error = %error, "REST call failed");
            }),
        })
    }

    /// Whether keyed endpoints can be called.
    #[must_use]
    pub const fn has_credentials(&self) -> bool {
        self.signer.is_some()
    }

    /// Test connectivity.
    #[must_use]
    pub fn ping(&self) -> RestCall<Empty> {
        self.call("ping", Method::GET, "ping", String::new(), Auth::None)
    }

    /// Server clock.
    #[must_use]
    pub fn server_time(&self) -> RestCall<ServerTime> {
        self.call("time", Method::GET, "time", String::new(), Auth::None)
    }

    /// Historical candles.
    ///
    /// `limit` is clamped to `1..=1000`; a start after the end is refused
    /// without a request.
    #[must_use]
    pub fn klines(
        &self,
        symbol: &str,
        interval: Interval,
        limit: Option<u16>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> RestCall<Vec<Kline>> {
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return self.adapter.adapt(HttpCall::failed(
                    "klines",
                    RestError::InvalidRequest(format!("start {start} is after end {end}")),
                ));
            }
        }

        let mut query = format!("symbol={}&interval={}", symbol.to_uppercase(), interval.code());
        if let Some(limit) = limit {
            query.push_str(&format!("&limit={}", limit.clamp(1, MAX_KLINE_LIMIT)));
        }
        if let Some(start) = start {
            query.push_str(&format!("&startTime={}", start.timestamp_millis()));
        }
        if let Some(end) = end {
            query.push_str(&format!("&endTime={}", end.timestamp_millis()));
        }

        self.call("klines", Method::GET, "klines", query, Auth::None)
    }

    /// Rolling 24h statistics for one symbol.
    #[must_use]
    pub fn ticker_24h(&self, symbol: &str) -> RestCall<Ticker24h> {
        let query = format!("symbol={}", symbol.to_uppercase());
        self.call("ticker_24h", Method::GET, "ticker/24hr", query, Auth::None)
    }

    /// Account summary. Signed.
    #[must_use]
    pub fn account(&self) -> RestCall<AccountInfo> {
        self.call("account", Method::GET, "account", String::new(), Auth::Signed)
    }

    /// Open a user-data stream.
    #[must_use]
    pub fn create_listen_key(&self) -> RestCall<ListenKey> {
        self.call(
            "create_listen_key",
            Method::POST,
            "userDataStream",
            String::new(),
            Auth::Keyed,
        )
    }

    /// Extend a listen key's validity by 60 minutes.
    #[must_use]
    pub fn keep_alive_listen_key(&self, listen_key: &str) -> RestCall<Empty> {
        self.call(
            "keep_alive_listen_key",
            Method::PUT,
            "userDataStream",
            format!("listenKey={listen_key}"),
            Auth::Keyed,
        )
    }

    /// Close a user-data stream.
    #[must_use]
    pub fn close_listen_key(&self, listen_key: &str) -> RestCall<Empty> {
        self.call(
            "close_listen_key",
            Method::DELETE,
            "userDataStream",
            format!("listenKey={listen_key}"),
            Auth::Keyed,
        )
    }

    fn call<T>(
        &self,
        endpoint: &'static str,
        method: Method,
        path: &str,
        query: String,
        auth: Auth,
    ) -> RestCall<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let query = match (auth, &self.signer) {
            (Auth::None, _) => query,
            (Auth::Keyed | Auth::Signed, None) => {
                let error = ApiError {
                    code: UNAUTHORIZED,
                    msg: format!("{endpoint} requires API credentials"),
                };
                return self.adapter.adapt(HttpCall::failed(endpoint, error.into()));
            }
            (Auth::Keyed, Some(_)) => query,
            (Auth::Signed, Some(signer)) => signer.signed_query(
                &query,
                Utc::now().timestamp_millis(),
                u64::try_from(self.recv_window.as_millis()).unwrap_or(u64::MAX),
            ),
        };

        let mut request = self
            .client
            .request(method, build_url(&self.base_url, path, &query));
        if auth != Auth::None {
            if let Some(signer) = &self.signer {
                request = request.header("X-MBX-APIKEY", signer.api_key());
            }
        }

        self.adapter.adapt(HttpCall::new(endpoint, async move {
            let response = request.send().await?;
            let status = response.status();
            let body = response.text().await?;

            if !status.is_success() {
                return Err(decode_error(status.as_u16(), &body).into());
            }
            let body = if body.trim().is_empty() { "{}" } else { body.as_str() };
            Ok(serde_json::from_str(body)?)
        }))
    }
}

fn build_url(base_url: &str, path: &str, query: &str) -> String {
    if query.is_empty() {
        format!("{base_url}{path}")
    } else {
        format!("{base_url}{path}?{query}")
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use chrono::TimeZone;
    use test_case::test_case;

    use super::*;
    use crate::infrastructure::adapter::CallError;

    fn client(credentials: Option<Credentials>) -> RestClient {
        RestClient::with_base_url(
            "http://127.0.0.1:9/api/v3",
            credentials.as_ref(),
            Duration::from_millis(5000),
        )
        .unwrap()
    }

    #[test_case(503, r#"{"code":-1121,"msg":"Invalid symbol."}"#, INTERNAL_ERROR; "server error ignores body")]
    #[test_case(400, r#"{"code":-1121,"msg":"Invalid symbol."}"#, -1121; "decoded body")]
    #[test_case(404, "<html>not found</html>", 404; "status fallback")]
    fn error_decoding(status: u16, body: &str, code: i64) {
        assert_eq!(decode_error(status, body).code, code);
    }

    #[test]
    fn internal_error_has_no_message() {
        let error = decode_error(500, "");
        assert!(error.is_internal());
        assert!(error.msg.is_empty());
    }

    #[test]
    fn builds_urls() {
        assert_eq!(build_url("https://h/api/v3/", "ping", ""), "https://h/api/v3/ping");
        assert_eq!(
            build_url("https://h/api/v3/", "klines", "symbol=BTCUSDT"),
            "https://h/api/v3/klines?symbol=BTCUSDT"
        );
    }

    #[test]
    fn decodes_positional_klines() {
        let body = r#"[[1499040000000,"0.01634790","0.80000000","0.01575800","0.01577100",
            "148976.11427815",1499644799999,"2434.19055334",308,"1756.87402397",
            "28.46694368","0"]]"#;
        let klines: Vec<Kline> = serde_json::from_str(body).unwrap();

        assert_eq!(klines.len(), 1);
        let kline = &klines[0];
        assert_eq!(kline.open_time, Utc.timestamp_millis_opt(1_499_040_000_000).unwrap());
        assert_eq!(kline.high, Decimal::from_str("0.80000000").unwrap());
        assert_eq!(kline.trade_count, 308);
        assert_eq!(
            kline.taker_buy_quote_volume,
            Decimal::from_str("28.46694368").unwrap()
        );
    }

    #[test]
    fn decodes_listen_key_and_server_time() {
        let key: ListenKey = serde_json::from_str(
            r#"{"listenKey":"pqia91ma19a5s61cv6a81va65sdf19v8a65a1a5s61cv6a81va65sdf19v8a65a1"}"#,
        )
        .unwrap();
        assert!(key.listen_key.starts_with("pqia91"));

        let time: ServerTime = serde_json::from_str(r#"{"serverTime":1499827319559}"#).unwrap();
        assert_eq!(time.server_time.timestamp_millis(), 1_499_827_319_559);

        let _: Empty = serde_json::from_str("{}").unwrap();
    }

    #[tokio::test]
    async fn signed_call_without_credentials_fails_locally() {
        let result = client(None).account().await;
        match result {
            Err(CallError::Failed(RestError::Api(error))) => assert_eq!(error.code, UNAUTHORIZED),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn keyed_call_without_credentials_fails_locally() {
        let result = client(None).create_listen_key().await;
        assert!(matches!(
            result,
            Err(CallError::Failed(RestError::Api(ApiError { code: UNAUTHORIZED, .. })))
        ));
    }

    #[tokio::test]
    async fn klines_rejects_inverted_range() {
        let start = Utc.timestamp_millis_opt(2_000).unwrap();
        let end = Utc.timestamp_millis_opt(1_000).unwrap();
        let result = client(None)
            .klines("btcusdt", Interval::OneMinute, None, Some(start), Some(end))
            .await;
        assert!(matches!(
            result,
            Err(CallError::Failed(RestError::InvalidRequest(_)))
        ));
    }

    #[tokio::test]
    async fn dropping_a_started_call_aborts_it() {
        let rest = client(Some(Credentials::new("k".to_string(), "s".to_string())));
        assert!(rest.has_credentials());

        let mut call = tokio_test::task::spawn(rest.ping());
        let _ = call.poll();
        call.cancel();
        assert!(call.is_cancelled());
        assert!(matches!(call.poll(), std::task::Poll::Ready(Err(CallError::Cancelled))));
    }
}
