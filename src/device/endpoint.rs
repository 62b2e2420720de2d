//! Endpoint prober (§4.2): drive a capability fetch across a device's
//! candidate endpoint list, binding whichever protocol handler matches the
//! winning candidate.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::device::options::{Capabilities, OptionState};
use crate::http::HttpClient;
use crate::protocol::escl::EsclHandler;
use crate::protocol::{HttpRequest, Operation, ProtocolContext, ProtocolHandler};

/// The protocol families this core knows how to speak. eSCL is the only
/// concrete binding (§4.8); new families plug in here without touching the
/// prober's loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum ProtocolKind {
    #[display(fmt = "eSCL")]
    Escl,
}

impl ProtocolKind {
    fn handler(self) -> Arc<dyn ProtocolHandler> {
        match self {
            ProtocolKind::Escl => Arc::new(EsclHandler),
        }
    }
}

/// A `(protocol, base URI)` pair advertised for a device (GLOSSARY).
#[derive(Clone, Debug)]
pub struct Endpoint {
    pub protocol: ProtocolKind,
    pub uri: String,
}

/// Outcome of a successful probe: the handler to keep using, the
/// normalized base URI it won on, and the capabilities it reported.
pub struct ProbeResult {
    pub handler: Arc<dyn ProtocolHandler>,
    pub base_uri: String,
    pub capabilities: Capabilities,
}

/// Try each endpoint in list order until one answers `ScannerCapabilities`
/// successfully (§4.2). Returns `None` once the list is exhausted, which
/// the caller treats as "delete the device".
pub async fn probe_endpoints(
    endpoints: &[Endpoint],
    http: &dyn HttpClient,
    device_name: &str,
) -> Option<ProbeResult> {
    let placeholder_options = OptionState::default();

    for endpoint in endpoints {
        let handler = endpoint.protocol.handler();
        let base_uri = handler.normalize_uri(&endpoint.uri);

        let ctx = ProtocolContext {
            base_uri: &base_uri,
            job_uri: None,
            options: &placeholder_options,
            retry_attempt: 0,
            retry_max_attempts: 0,
            retry_interval: Duration::ZERO,
        };
        let request: HttpRequest = handler.build_query(Operation::Caps, &ctx);

        match submit_and_decode_caps(http, &*handler, request).await {
            Ok(capabilities) => {
                info!(target: "escl_scan_core::endpoint", "{device_name}: bound to {base_uri}");
                return Some(ProbeResult { handler, base_uri, capabilities });
            }
            Err(e) => {
                warn!(target: "escl_scan_core::endpoint", "{device_name}: probe of {base_uri} failed: {e:#}");
            }
        }
    }
    None
}

async fn submit_and_decode_caps(
    http: &dyn HttpClient,
    handler: &dyn ProtocolHandler,
    request: HttpRequest,
) -> anyhow::Result<Capabilities> {
    let reply = http.submit(request).await.map_err(anyhow::Error::from)?;
    handler.decode_caps(&reply)
}
