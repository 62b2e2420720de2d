//! The protocol adapter contract (§4.8, §6, §9 "Protocol handler
//! polymorphism"). A concrete eSCL binding lives in [`escl`].

pub mod escl;

use std::collections::HashMap;
use std::time::Duration;

use crate::device::options::OptionState;
use crate::error::Status;

/// One step in the operation chain (§4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Caps,
    Scan,
    Load,
    Status,
    Cancel,
    Cleanup,
}

/// What the state machine should do after the current operation's reply
/// has been decoded (§4.3 "Operation chain").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextOp {
    /// Re-submit (possibly after `delay`) the named operation.
    Again(Operation),
    Cancel,
    Cleanup,
    Finish,
}

/// Payload carried by a decoded reply (§6: "`payload` may carry a job URI
/// ... or an encoded image").
#[derive(Clone, Debug)]
pub enum Payload {
    JobUri(String),
    Image { bytes: Vec<u8>, content_type: String },
}

/// The result of decoding one operation's HTTP reply (§4.3, §6).
#[derive(Clone, Debug)]
pub struct DecodeResult {
    pub next: NextOp,
    pub delay: Duration,
    pub status: Status,
    pub payload: Option<Payload>,
}

impl DecodeResult {
    pub fn finish(status: Status) -> DecodeResult {
        DecodeResult { next: NextOp::Finish, delay: Duration::ZERO, status, payload: None }
    }

    pub fn again(op: Operation, status: Status) -> DecodeResult {
        DecodeResult { next: NextOp::Again(op), delay: Duration::ZERO, status, payload: None }
    }

    pub fn retry_after(op: Operation, delay: Duration) -> DecodeResult {
        DecodeResult { next: NextOp::Again(op), delay, status: Status::Good, payload: None }
    }
}

/// An outbound HTTP request, as built by [`ProtocolHandler::build_query`]
/// (§6 "To HTTP client").
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Vec<u8>>,
    pub content_type: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

/// An inbound HTTP reply, as handed to [`ProtocolHandler::decode_reply`].
#[derive(Clone, Debug)]
pub struct HttpReply {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Everything a protocol handler needs to build a request or make sense of
/// a reply: the endpoint base, the job URI if one has been obtained, the
/// caller's option selections, and how many times the current operation
/// has already been retried.
pub struct ProtocolContext<'a> {
    pub base_uri: &'a str,
    pub job_uri: Option<&'a str>,
    pub options: &'a OptionState,
    pub retry_attempt: u32,
    pub retry_max_attempts: u32,
    pub retry_interval: Duration,
}

/// Per-operation request/reply pair, selected at endpoint bind time
/// (§4.2, §9).
pub trait ProtocolHandler: Send + Sync {
    /// Normalize a discovered endpoint URI for this protocol (§4.2, §6:
    /// "for eSCL they must be trailing-slash-normalized").
    fn normalize_uri(&self, uri: &str) -> String;

    fn build_query(&self, op: Operation, ctx: &ProtocolContext) -> HttpRequest;

    fn decode_reply(&self, op: Operation, reply: &HttpReply, ctx: &ProtocolContext) -> DecodeResult;

    /// Parse a `ScannerCapabilities` reply. Only ever called for
    /// `Operation::Caps`; split out from [`decode_reply`] because its
    /// return shape (capabilities, not a `DecodeResult`) is different.
    fn decode_caps(&self, reply: &HttpReply) -> anyhow::Result<crate::device::options::Capabilities>;
}

/// Shared decoder for `CANCEL` and `CLEANUP`: both always resolve to
/// `FINISH` regardless of the reply body (§6, §9).
pub fn decode_cancel_or_cleanup(reply: &HttpReply) -> DecodeResult {
    // For an actual CANCEL, this status is advisory only: the device layer
    // forces CANCELLED once it's in the Cancelling state regardless of what
    // we compute here. It matters for CLEANUP, which has no such override.
    let status = if reply.status_code < 300 { Status::Cancelled } else { Status::IoError };
    DecodeResult::finish(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_cleanup_decoder_always_finishes() {
        let ok = HttpReply { status_code: 200, headers: HashMap::new(), body: vec![] };
        let result = decode_cancel_or_cleanup(&ok);
        assert_eq!(result.next, NextOp::Finish);

        let err = HttpReply { status_code: 500, headers: HashMap::new(), body: vec![] };
        let result = decode_cancel_or_cleanup(&err);
        assert_eq!(result.next, NextOp::Finish);
        assert_eq!(result.status, Status::IoError);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert("Location".to_string(), "http://x/ScanJobs/7".to_string());
        let reply = HttpReply { status_code: 201, headers, body: vec![] };
        assert_eq!(reply.header("location"), Some("http://x/ScanJobs/7"));
    }
}
