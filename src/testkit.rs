//! Test-only doubles shared by unit and integration tests: a scripted
//! [`HttpClient`] that returns queued replies instead of touching the
//! network. Mirrors how the teacher crate keeps test helpers (`testing.rs`)
//! separate from the modules they exercise.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::http::HttpClient;
use crate::protocol::{HttpReply, HttpRequest};

/// Returns replies from a FIFO queue, one per `submit` call, in the order
/// the test expects requests to be made (§4.3's operation chain is
/// deterministic, so this is sufficient to drive every scenario in §8).
pub struct MockHttpClient {
    replies: Mutex<VecDeque<Result<HttpReply, CoreError>>>,
    requests: Mutex<Vec<HttpRequest>>,
    delay: Duration,
}

impl MockHttpClient {
    pub fn new(replies: Vec<Result<HttpReply, CoreError>>) -> MockHttpClient {
        MockHttpClient {
            replies: Mutex::new(VecDeque::from(replies)),
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Like [`MockHttpClient::new`], but `submit` sleeps `delay` before
    /// popping a reply, so a test can supersede it with a cancel while it's
    /// still in flight.
    pub fn with_delay(replies: Vec<Result<HttpReply, CoreError>>, delay: Duration) -> MockHttpClient {
        MockHttpClient {
            replies: Mutex::new(VecDeque::from(replies)),
            requests: Mutex::new(Vec::new()),
            delay,
        }
    }

    /// Requests submitted so far, for assertions about which URLs/methods
    /// the state machine chose to call.
    pub fn requests_seen(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn submit(&self, request: HttpRequest) -> Result<HttpReply, CoreError> {
        self.requests.lock().unwrap().push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.replies.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(HttpReply { status_code: 500, headers: Default::default(), body: vec![] })
        })
    }
}

pub fn ok_reply(status_code: u16, body: &[u8]) -> Result<HttpReply, CoreError> {
    Ok(HttpReply { status_code, headers: Default::default(), body: body.to_vec() })
}

pub fn reply_with_header(status_code: u16, header: (&str, &str), body: &[u8]) -> Result<HttpReply, CoreError> {
    let mut headers = std::collections::HashMap::new();
    headers.insert(header.0.to_string(), header.1.to_string());
    Ok(HttpReply { status_code, headers, body: body.to_vec() })
}
