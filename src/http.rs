//! The HTTP client contract (§4.9, §6 "To HTTP client (outbound)").
//!
//! The C-style `submit(request, callback)` / `set_onerror(cb)` pair from the
//! spec becomes, in idiomatic async Rust, a single `async fn submit` that
//! either returns a reply or a [`CoreError::Transport`] — the event loop
//! (§4.11) is the "callback", and a transport error is simply the `Err`
//! arm the orchestration code matches on, rather than a registered handler.

use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Client;
use tokio::task::AbortHandle;

use crate::error::CoreError;
use crate::protocol::{HttpReply, HttpRequest, Method};

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn submit(&self, request: HttpRequest) -> Result<HttpReply, CoreError>;

    /// Abort every request currently outstanding on this client, across all
    /// devices (§4.7 shutdown). Per-device cancellation goes through a
    /// device's own in-flight handle instead; this is the coarser,
    /// whole-client version used when tearing the registry down. A no-op by
    /// default since not every client implementation tracks outstanding
    /// tasks.
    fn cancel_all(&self) {}
}

/// Concrete binding over a single shared `reqwest::Client` (§4.9).
pub struct ReqwestHttpClient {
    client: Client,
    inflight: Mutex<Vec<AbortHandle>>,
}

impl ReqwestHttpClient {
    pub fn new() -> anyhow::Result<ReqwestHttpClient> {
        let client = Client::builder()
            .build()
            .map_err(anyhow::Error::from)?;
        Ok(ReqwestHttpClient { client, inflight: Mutex::new(Vec::new()) })
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        ReqwestHttpClient::new().expect("failed to build default reqwest client")
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn submit(&self, request: HttpRequest) -> Result<HttpReply, CoreError> {
        let client = self.client.clone();
        let task = tokio::spawn(async move { send(&client, request).await });
        {
            let mut inflight = self.inflight.lock().unwrap();
            inflight.retain(|h| !h.is_finished());
            inflight.push(task.abort_handle());
        }

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(CoreError::Transport(anyhow::anyhow!("request cancelled"))),
            Err(e) => Err(CoreError::Transport(anyhow::Error::from(e))),
        }
    }

    fn cancel_all(&self) {
        for handle in self.inflight.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

async fn send(client: &Client, request: HttpRequest) -> Result<HttpReply, CoreError> {
    let method = match request.method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Delete => reqwest::Method::DELETE,
    };

    let mut builder = client.request(method, &request.url);
    if let Some(body) = request.body {
        builder = builder.body(body);
    }
    if let Some(content_type) = request.content_type {
        builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
    }

    let response = builder.send().await.map_err(|e| {
        CoreError::Transport(anyhow::Error::from(e).context(request.url.clone()))
    })?;

    let status_code = response.status().as_u16();
    let headers = response.headers().iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect();
    let body = response.bytes().await
        .map_err(|e| CoreError::Transport(anyhow::Error::from(e)))?
        .to_vec();

    Ok(HttpReply { status_code, headers, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::MockHttpClient;

    #[tokio::test]
    async fn mock_client_returns_queued_replies_in_order() {
        let client = MockHttpClient::new(vec![
            Ok(HttpReply { status_code: 200, headers: Default::default(), body: b"first".to_vec() }),
            Ok(HttpReply { status_code: 404, headers: Default::default(), body: b"second".to_vec() }),
        ]);

        let req = HttpRequest { method: Method::Get, url: "http://x/".to_string(), body: None, content_type: None };
        let first = client.submit(req.clone()).await.unwrap();
        assert_eq!(first.body, b"first");
        let second = client.submit(req).await.unwrap();
        assert_eq!(second.body, b"second");
    }
}
