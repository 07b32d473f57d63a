//! Transport layer re-sending failed JSON-RPC requests with exponential
//! backoff.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use alloy::{
    providers::{ProviderBuilder, RootProvider},
    rpc::{
        client::ClientBuilder,
        json_rpc::{RequestPacket, ResponsePacket},
    },
    transports::{http::ReqwestTransport, TransportError},
};
use futures::future::poll_fn;
use tower::{Layer, Service};
use tracing::warn;

#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub initial: Duration,
    pub max_retries: u32,
}

impl Backoff {
    fn delay(&self, attempt: u32) -> Duration {
        self.initial.saturating_mul(1 << attempt.min(16))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RetryLayer {
    backoff: Backoff,
}

impl RetryLayer {
    pub const fn new(backoff: Backoff) -> Self {
        Self { backoff }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            backoff: self.backoff,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetryService<S> {
    inner: S,
    backoff: Backoff,
}

impl<S> Service<RequestPacket> for RetryService<S>
where
    S: Service<RequestPacket, Response = ResponsePacket, Error = TransportError>
        + Send
        + 'static
        + Clone,
    S::Future: Send + 'static,
{
    type Response = ResponsePacket;
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: RequestPacket) -> Self::Future {
        // Every attempt polls the service ready before calling it.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let backoff = self.backoff;

        Box::pin(async move {
            let mut attempt = 0;
            loop {
                let result = match poll_fn(|cx| inner.poll_ready(cx)).await {
                    Ok(()) => inner.call(request.clone()).await,
                    Err(err) => Err(err),
                };
                match result {
                    Err(err) if attempt < backoff.max_retries => {
                        let delay = backoff.delay(attempt);
                        attempt += 1;
                        warn!(attempt, ?delay, "rpc request failed, retrying: {err}");
                        tokio::time::sleep(delay).await;
                    }
                    result => return result,
                }
            }
        })
    }
}

pub type RetryingHttpProvider = RootProvider<RetryService<ReqwestTransport>>;

/// HTTP provider whose requests are retried according to `backoff`.
pub fn build_http_retry_provider(rpc_url: url::Url, backoff: Backoff) -> RetryingHttpProvider {
    let client = ClientBuilder::default()
        .layer(RetryLayer::new(backoff))
        .http(rpc_url);
    ProviderBuilder::new().on_client(client)
}
