//! The device registry (§4.1, §4.7): the shared table of known devices,
//! keyed by name, and the readiness barrier `open` blocks on while the
//! initial discovery burst is still being probed.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};

use indexmap::IndexMap;
use log::{info, warn};
use once_cell::sync::Lazy;

use crate::config::Config;
use crate::device::endpoint::{Endpoint, ProtocolKind};
use crate::device::flags::DeviceFlags;
use crate::device::{open_handle, probe_and_bind, Device, DeviceHandle};
use crate::error::CoreError;
use crate::eventloop::EventLoop;
use crate::http::HttpClient;

/// Protocol name aliases accepted in static device config (case variants
/// seen in the wild: `escl`, `eSCL`).
static SUPPORTED_PROTOCOLS: Lazy<BTreeMap<&str, ProtocolKind>> = Lazy::new(|| {
    BTreeMap::from([
        ("escl", ProtocolKind::Escl),
        ("eSCL", ProtocolKind::Escl),
    ])
});

struct Inner {
    devices: Mutex<IndexMap<String, Arc<Device>>>,
    http: Arc<dyn HttpClient>,
    eloop: Arc<EventLoop>,
    config: Config,
    pending: Mutex<u32>,
    cond: Condvar,
}

/// Shared, cloneable handle onto the device table (§4.1). Cheap to clone:
/// internally just an `Arc`.
#[derive(Clone)]
pub struct Registry(Arc<Inner>);

impl Registry {
    /// Build a registry and kick off probing for every statically
    /// configured device (§4.7, §4.12).
    pub fn new(config: Config, http: Arc<dyn HttpClient>, eloop: Arc<EventLoop>) -> Registry {
        let inner = Arc::new(Inner {
            devices: Mutex::new(IndexMap::new()),
            http,
            eloop,
            config: config.clone(),
            pending: Mutex::new(0),
            cond: Condvar::new(),
        });
        let registry = Registry(inner);
        for static_device in &config.static_devices {
            registry.add_static(static_device);
        }
        registry
    }

    fn add_static(&self, static_device: &crate::config::StaticDevice) {
        let protocol = match SUPPORTED_PROTOCOLS.get(static_device.protocol.as_str()) {
            Some(protocol) => *protocol,
            None => {
                warn!(
                    target: "escl_scan_core::registry",
                    "{}: unrecognized protocol {:?}, skipping",
                    static_device.name, static_device.protocol,
                );
                return;
            }
        };
        let endpoints = vec![Endpoint { protocol, uri: static_device.uri.clone() }];
        self.add(static_device.name.clone(), endpoints);
    }

    /// Add a newly discovered (or statically configured) device and start
    /// probing it in the background (§4.1, §4.2).
    pub fn add(&self, name: String, endpoints: Vec<Endpoint>) {
        let device = match Device::new(
            name.clone(),
            endpoints,
            self.0.http.clone(),
            self.0.eloop.clone(),
            self.0.config.retry,
        ) {
            Ok(device) => device,
            Err(e) => {
                warn!(target: "escl_scan_core::registry", "{name}: failed to create device: {e}");
                return;
            }
        };
        device.mark_listed();
        self.0.devices.lock().unwrap().insert(name, device.clone());
        *self.0.pending.lock().unwrap() += 1;

        let inner = self.0.clone();
        self.0.eloop.call(async move {
            let bound = probe_and_bind(device.clone()).await;
            if !bound {
                inner.devices.lock().unwrap().shift_remove(&device.name);
            }
            let mut pending = inner.pending.lock().unwrap();
            *pending = pending.saturating_sub(1);
            inner.cond.notify_all();
        });
    }

    /// A previously discovered device disappeared (§4.7).
    pub fn remove(&self, name: &str) {
        if let Some(device) = self.0.devices.lock().unwrap().shift_remove(name) {
            device.mark_halted();
            info!(target: "escl_scan_core::registry", "{name}: removed");
        }
    }

    pub fn find(&self, name: &str) -> Option<Arc<Device>> {
        self.0.devices.lock().unwrap().get(name).cloned()
    }

    /// Snapshot every device whose flags contain `mask` (§4.1), so a caller
    /// can iterate without holding the table lock. `DeviceFlags::empty()`
    /// matches every device, since every flag set trivially contains the
    /// empty mask.
    pub fn collect(&self, mask: DeviceFlags) -> Vec<Arc<Device>> {
        self.0.devices.lock().unwrap().values()
            .filter(|d| d.flags().contains(mask))
            .cloned()
            .collect()
    }

    pub fn size(&self) -> usize {
        self.0.devices.lock().unwrap().len()
    }

    /// Drop devices that have been halted but are still sitting in the
    /// table (e.g. an open handle was keeping the last strong reference
    /// alive). Returns the number removed.
    pub fn purge(&self) -> usize {
        let mut devices = self.0.devices.lock().unwrap();
        let before = devices.len();
        devices.retain(|_, device| !device.is_halted());
        before - devices.len()
    }

    /// Engine stop (§4.7): every device goes through the delete path
    /// (marked `HALTED`, so no new I/O starts) and is dropped from the
    /// table. A device kept alive by an outstanding open handle is not
    /// freed here — only detached — per §3's lifecycle rule.
    pub fn shutdown(&self) {
        let mut devices = self.0.devices.lock().unwrap();
        for device in devices.values() {
            device.mark_halted();
        }
        let n = devices.len();
        devices.clear();
        drop(devices);
        self.0.http.cancel_all();
        if n > 0 {
            info!(target: "escl_scan_core::registry", "shutdown: detached {n} device(s)");
        }
    }

    /// The discovery backend's initial scan burst has finished (§4.1):
    /// stop making `open` wait on it even if a background probe is still
    /// outstanding.
    pub fn mark_init_scan_finished(&self) {
        let mut pending = self.0.pending.lock().unwrap();
        *pending = 0;
        self.0.cond.notify_all();
    }

    /// Wake anyone blocked in `open` to recheck readiness, without
    /// otherwise touching the pending count (e.g. after a device finishes
    /// probing on its own).
    pub fn notify_readiness_change(&self) {
        self.0.cond.notify_all();
    }

    fn wait_ready(&self) {
        let pending = self.0.pending.lock().unwrap();
        let _ = self.0.cond.wait_timeout_while(pending, self.0.config.readiness_timeout, |p| *p > 0);
    }

    /// `open` (§4.1, §4.6): wait out the readiness barrier, then hand back
    /// a frontend handle for the named device. An empty name selects the
    /// first `READY` device in table order.
    pub fn open(&self, name: &str) -> Result<DeviceHandle, CoreError> {
        self.wait_ready();
        let device = if name.is_empty() {
            self.0
                .devices
                .lock()
                .unwrap()
                .values()
                .find(|d| d.is_ready())
                .cloned()
                .ok_or_else(|| CoreError::Invalid("no ready device available".to_string()))?
        } else {
            self.find(name)
                .ok_or_else(|| CoreError::Invalid(format!("no such device: {name}")))?
        };
        if !device.is_ready() {
            return Err(CoreError::Busy);
        }
        open_handle(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{ok_reply, MockHttpClient};
    use std::time::Duration;

    const SAMPLE_CAPS: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>
<scan:ScannerCapabilities xmlns:scan="http://schemas.hp.com/imaging/escl/2011/05/03" xmlns:pwg="http://www.pwg.org/schemas/2010/12/sm">
  <scan:Platen>
    <scan:PlatenInputCaps>
      <scan:MinWidth>16</scan:MinWidth>
      <scan:MaxWidth>2550</scan:MaxWidth>
      <scan:MinHeight>16</scan:MinHeight>
      <scan:MaxHeight>3300</scan:MaxHeight>
    </scan:PlatenInputCaps>
  </scan:Platen>
</scan:ScannerCapabilities>"#;

    #[tokio::test]
    async fn adding_a_device_probes_it_and_open_waits_for_that() {
        let http = Arc::new(MockHttpClient::new(vec![ok_reply(200, SAMPLE_CAPS)]));
        let eloop = Arc::new(EventLoop::start());
        let registry = Registry::new(Config::default(), http, eloop);
        registry.add("front-desk".to_string(), vec![Endpoint {
            protocol: ProtocolKind::Escl,
            uri: "http://printer.local/eSCL".into(),
        }]);

        let handle = registry.open("front-desk");
        assert!(handle.is_ok());
    }

    #[tokio::test]
    async fn open_rejects_an_unknown_name() {
        let http = Arc::new(MockHttpClient::new(vec![]));
        let eloop = Arc::new(EventLoop::start());
        let registry = Registry::new(Config::default(), http, eloop);
        assert!(matches!(registry.open("nope"), Err(CoreError::Invalid(_))));
    }

    #[tokio::test]
    async fn a_device_that_exhausts_every_endpoint_is_dropped() {
        let http = Arc::new(MockHttpClient::new(vec![
            Ok(crate::protocol::HttpReply { status_code: 500, headers: Default::default(), body: vec![] }),
        ]));
        let eloop = Arc::new(EventLoop::start());
        let registry = Registry::new(Config::default(), http, eloop);
        registry.add("dead".to_string(), vec![Endpoint {
            protocol: ProtocolKind::Escl,
            uri: "http://printer.local/eSCL".into(),
        }]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.find("dead").is_none());
    }

    #[tokio::test]
    async fn shutdown_halts_and_detaches_every_device() {
        let http = Arc::new(MockHttpClient::new(vec![ok_reply(200, SAMPLE_CAPS)]));
        let eloop = Arc::new(EventLoop::start());
        let registry = Registry::new(Config::default(), http, eloop);
        registry.add("front-desk".to_string(), vec![Endpoint {
            protocol: ProtocolKind::Escl,
            uri: "http://printer.local/eSCL".into(),
        }]);
        let device = registry.find("front-desk").unwrap();

        registry.shutdown();

        assert_eq!(registry.size(), 0);
        assert!(device.is_halted());
    }

    #[tokio::test]
    async fn collect_filters_by_flag_mask() {
        let http = Arc::new(MockHttpClient::new(vec![ok_reply(200, SAMPLE_CAPS)]));
        let eloop = Arc::new(EventLoop::start());
        let registry = Registry::new(Config::default(), http, eloop);
        registry.add("front-desk".to_string(), vec![Endpoint {
            protocol: ProtocolKind::Escl,
            uri: "http://printer.local/eSCL".into(),
        }]);
        let _ = registry.open("front-desk"); // wait_ready blocks until probing settles

        assert_eq!(registry.collect(crate::device::flags::DeviceFlags::empty()).len(), 1);
        assert_eq!(registry.collect(crate::device::flags::DeviceFlags::READY).len(), 1);
        assert_eq!(registry.collect(crate::device::flags::DeviceFlags::HALTED).len(), 0);
    }
}
