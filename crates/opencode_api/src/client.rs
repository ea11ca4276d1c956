use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{atomic::AtomicBool, atomic::Ordering, Arc};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::config::ApiConfig;
use crate::error::{parse_error_message, ApiError};
use crate::retry::is_transient_status;
use crate::sse::SseStreamParser;
use crate::types::{EventEnvelope, MessageWithParts, Session};
use crate::url::normalize_base_url;

/// Optional cancellation signal shared across request and stream loops.
pub type CancellationSignal = Arc<AtomicBool>;

/// Decoded event envelopes in server order; ends when the server closes.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventEnvelope, ApiError>> + Send>>;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct OpencodeClient {
    http: Client,
    config: ApiConfig,
    base_url: String,
}

impl OpencodeClient {
    pub fn new(config: ApiConfig) -> Result<Self, ApiError> {
        let base_url = normalize_base_url(&config.base_url)?;
        let http = Client::builder()
            .default_headers(build_headers(&config)?)
            .build()
            .map_err(ApiError::from)?;
        Ok(Self {
            http,
            config,
            base_url,
        })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// `GET /session`, in server order.
    pub async fn list_sessions(&self) -> Result<Vec<Session>, ApiError> {
        self.get_json("session", None).await
    }

    /// `GET /session/{id}/message`.
    pub async fn session_messages(
        &self,
        session_id: &str,
    ) -> Result<Vec<MessageWithParts>, ApiError> {
        self.get_json(&format!("session/{session_id}/message"), None)
            .await
    }

    /// Opens `GET /event` once; no retry is attempted for the stream.
    pub async fn subscribe_events(
        &self,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<EventStream, ApiError> {
        let request = self
            .http
            .get(self.endpoint("event"))
            .header(ACCEPT, "text/event-stream")
            .send();
        let response = await_or_cancel(request, cancellation).await??;
        let response = ensure_success(response, cancellation).await?;

        let bytes = Box::pin(response.bytes_stream());
        let stream = futures_util::stream::unfold(
            (bytes, SseStreamParser::default(), VecDeque::new()),
            |(mut bytes, mut parser, mut ready)| async move {
                loop {
                    if let Some(envelope) = ready.pop_front() {
                        return Some((Ok(envelope), (bytes, parser, ready)));
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => ready.extend(parser.feed(&chunk)),
                        Some(Err(error)) => {
                            return Some((Err(ApiError::from(error)), (bytes, parser, ready)));
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }

    pub async fn get_json<T>(
        &self,
        path: &str,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let response = self.send_with_retry(path, cancellation).await?;
        let body = await_or_cancel(response.bytes(), cancellation).await??;
        serde_json::from_slice(&body).map_err(ApiError::from)
    }

    pub async fn send_with_retry(
        &self,
        path: &str,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<Response, ApiError> {
        let url = self.endpoint(path);
        let mut last_status: Option<StatusCode> = None;
        let mut last_error = None;
        let policy = self.config.retry;

        for attempt in 0..=policy.max_retries {
            if is_cancelled(cancellation) {
                return Err(ApiError::Cancelled);
            }

            let mut request = self.http.get(&url).header(ACCEPT, "application/json");
            if let Some(timeout) = self.config.timeout {
                request = request.timeout(timeout);
            }
            let response = await_or_cancel(request.send(), cancellation)
                .await?
                .map_err(ApiError::from);

            match response {
                Ok(response) => {
                    if response.status().is_success() {
                        return Ok(response);
                    }

                    let status = response.status();
                    last_status = Some(status);
                    let body = await_or_cancel(response.text(), cancellation)
                        .await?
                        .unwrap_or_default();
                    let message = parse_error_message(status, &body);
                    last_error = Some(message.clone());

                    if policy.should_retry(attempt) && is_transient_status(status.as_u16(), &body) {
                        tracing::debug!(%url, %status, attempt, "retrying request");
                        await_or_cancel(tokio::time::sleep(policy.delay(attempt)), cancellation)
                            .await?;
                        continue;
                    }

                    return Err(ApiError::Status(status, message));
                }
                Err(error) => {
                    let message = error.to_string();
                    last_error = Some(message.clone());
                    if policy.should_retry(attempt) {
                        tracing::debug!(%url, error = %message, attempt, "retrying request");
                        await_or_cancel(tokio::time::sleep(policy.delay(attempt)), cancellation)
                            .await?;
                        continue;
                    }
                    return Err(ApiError::RetryExhausted {
                        status: last_status,
                        last_error,
                    });
                }
            }
        }

        Err(ApiError::RetryExhausted {
            status: last_status,
            last_error,
        })
    }
}

fn build_headers(config: &ApiConfig) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    let user_agent = config
        .user_agent
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("opencode_view/{}", env!("CARGO_PKG_VERSION")));
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&user_agent)
            .map_err(|_| ApiError::InvalidHeader(format!("invalid user agent: {user_agent}")))?,
    );

    for (key, value) in &config.extra_headers {
        let key = key.trim().to_ascii_lowercase();
        headers.insert(
            HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| ApiError::InvalidHeader(format!("invalid header key: {key}")))?,
            HeaderValue::from_str(value.trim())
                .map_err(|_| ApiError::InvalidHeader(format!("invalid header value for {key}")))?,
        );
    }

    Ok(headers)
}

async fn ensure_success(
    response: Response,
    cancellation: Option<&CancellationSignal>,
) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = await_or_cancel(response.text(), cancellation)
        .await?
        .unwrap_or_default();
    Err(ApiError::Status(status, parse_error_message(status, &body)))
}

pub fn is_cancelled(cancel: Option<&CancellationSignal>) -> bool {
    cancel.is_some_and(|token| token.load(Ordering::Acquire))
}

/// Await `future`, giving up with [`ApiError::Cancelled`] once the signal is raised.
pub async fn await_or_cancel<F>(
    future: F,
    cancellation: Option<&CancellationSignal>,
) -> Result<F::Output, ApiError>
where
    F: Future,
{
    if cancellation.is_none() {
        return Ok(future.await);
    }

    let mut future = Box::pin(future);

    loop {
        if is_cancelled(cancellation) {
            return Err(ApiError::Cancelled);
        }

        if let Ok(output) = tokio::time::timeout(CANCEL_POLL_INTERVAL, &mut future).await {
            if is_cancelled(cancellation) {
                return Err(ApiError::Cancelled);
            }
            return Ok(output);
        }
    }
}
