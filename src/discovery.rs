//! Discovery glue (§4.7, §6 "From discovery (inbound)"). Actually finding
//! devices on the network (mDNS/WS-Discovery) is out of scope; this module
//! is the handful of calls a discovery backend is expected to make into
//! the [`Registry`] as it sees devices appear and disappear.

use crate::device::endpoint::Endpoint;
use crate::registry::Registry;

/// One device a discovery backend has just seen, with its candidate
/// endpoint list in probe order (§4.2, GLOSSARY).
#[derive(Clone, Debug)]
pub struct DiscoveredEndpoint {
    pub name: String,
    pub endpoints: Vec<Endpoint>,
}

/// A device was seen on the network: register it and start probing
/// (§4.1, §4.2, §4.7).
pub fn found(registry: &Registry, discovered: DiscoveredEndpoint) {
    registry.add(discovered.name, discovered.endpoints);
}

/// A previously discovered device disappeared (§4.7).
pub fn removed(registry: &Registry, name: &str) {
    registry.remove(name);
}

/// The discovery backend's initial scan burst has completed (§4.1): stop
/// making `open` wait on any straggling background probe.
pub fn init_scan_finished(registry: &Registry) {
    registry.mark_init_scan_finished();
}
