//! Per-device orchestration (§3, §4.1-§4.6): capability probing, the scan
//! state machine, cancellation, retry and the read pipeline, all exposed
//! behind a SANE-like frontend (open/set_option/start/read/cancel/close).
//!
//! The orchestration functions below take `Arc<Device>` or `&Arc<Device>`
//! by value/reference rather than living as methods with exotic receivers:
//! stable Rust accepts `self: Arc<Self>` but not `self: &Arc<Self>`, and
//! nearly every one of these needs to clone the `Arc` to move it into a
//! spawned future anyway, so free functions read no worse than methods
//! would and avoid the receiver restriction entirely.

pub mod endpoint;
pub mod flags;
pub mod job;
pub mod options;
pub mod queue;
pub mod signal;
pub mod stm;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use log::{debug, error, info, warn};
use tokio::task::AbortHandle;

use crate::config::RetryPolicy;
use crate::decoder::{ImageCrateDecoder, ImageDecoder, Window};
use crate::device::endpoint::{probe_endpoints, Endpoint, ProbeResult};
use crate::device::flags::{AtomicFlags, DeviceFlags};
use crate::device::job::JobTracker;
use crate::device::options::OptionState;
use crate::device::queue::{EncodedImage, ImageQueue};
use crate::device::signal::PollableSignal;
use crate::device::stm::{ScanState, StateCell};
use crate::error::{CoreError, Status};
use crate::eventloop::{EventLoop, TimerHandle};
use crate::http::HttpClient;
use crate::protocol::{DecodeResult, HttpReply, NextOp, Operation, Payload, ProtocolContext, ProtocolHandler};
use crate::rcu::SingleWriterRcu;

/// The protocol handler and base URI a device bound to during probing
/// (§4.2). Absent until the first successful probe.
struct Binding {
    handler: Arc<dyn ProtocolHandler>,
    base_uri: String,
}

/// State for the page currently being streamed out through `read` (§4.5).
/// The decoder tracks the cursor into the decoded raster; this tracks the
/// cursor into the frontend-promised raster, which can run longer than the
/// decoder's — the remainder is synthesized as `0xFF` padding.
struct ActiveImage {
    bytes_per_line: u32,
    /// Total lines promised to the caller for this page, frozen at
    /// `start_decoding` time.
    total_lines: u32,
    /// Lines already handed to `read`, real or padded.
    lines_delivered: u32,
    /// The current line's bytes not yet copied into a caller buffer, so a
    /// `read` call with `buf` smaller than one line can resume mid-line.
    pending_line: Vec<u8>,
    pending_offset: usize,
}

/// One scanner, bound to zero or more candidate endpoints (§4.1, GLOSSARY).
pub struct Device {
    pub name: String,
    endpoints: Vec<Endpoint>,
    http: Arc<dyn HttpClient>,
    eloop: Arc<EventLoop>,
    retry: RetryPolicy,

    flags: AtomicFlags,
    opened: AtomicBool,
    non_blocking: AtomicBool,
    state: StateCell,

    binding: Mutex<Option<Binding>>,
    options: ArcSwap<OptionState>,
    job: Mutex<JobTracker>,
    queue: ImageQueue,
    decoder: Mutex<Box<dyn ImageDecoder>>,
    active_image: Mutex<Option<ActiveImage>>,
    retry_timer: Mutex<Option<TimerHandle>>,
    ready_since: Mutex<Option<chrono::DateTime<chrono::Local>>>,
    /// Handle to the task running the current operation's HTTP request, if
    /// any (§3 "in-flight request handle"). At most one is ever live per
    /// device; cancellation aborts it so a superseded reply can never reach
    /// `apply_decode_result`.
    inflight: Mutex<Option<AbortHandle>>,
}

impl Device {
    pub fn new(
        name: String,
        endpoints: Vec<Endpoint>,
        http: Arc<dyn HttpClient>,
        eloop: Arc<EventLoop>,
        retry: RetryPolicy,
    ) -> std::io::Result<Arc<Device>> {
        Ok(Arc::new(Device {
            name,
            endpoints,
            http,
            eloop,
            retry,
            flags: AtomicFlags::new(DeviceFlags::empty()),
            opened: AtomicBool::new(false),
            non_blocking: AtomicBool::new(false),
            state: StateCell::new(ScanState::Closed),
            binding: Mutex::new(None),
            options: ArcSwap::new(Arc::new(OptionState::default())),
            job: Mutex::new(JobTracker::default()),
            queue: ImageQueue::new()?,
            decoder: Mutex::new(Box::new(ImageCrateDecoder::default())),
            active_image: Mutex::new(None),
            retry_timer: Mutex::new(None),
            ready_since: Mutex::new(None),
            inflight: Mutex::new(None),
        }))
    }

    pub fn flags(&self) -> DeviceFlags {
        self.flags.load()
    }

    pub fn state(&self) -> ScanState {
        self.state.get()
    }

    pub fn options(&self) -> Arc<OptionState> {
        self.options.load_full()
    }

    pub fn queue_signal(&self) -> &PollableSignal {
        self.queue.signal()
    }

    pub fn is_ready(&self) -> bool {
        self.flags.load().contains(DeviceFlags::READY)
    }

    fn is_non_blocking(&self) -> bool {
        self.non_blocking.load(Ordering::SeqCst)
    }

    /// Set the state machine state and wake anything polling
    /// `get_select_fd` (§4.6: "becomes readable whenever the state or the
    /// queue changes"), in addition to the `stm_cond` broadcast `StateCell`
    /// already does.
    fn set_state(&self, state: ScanState) {
        self.state.set(state);
        self.queue.signal().signal();
    }

    /// As [`Device::set_state`], for the one legitimate concurrent
    /// transition (§4.3's compare-and-set out of `Scanning`).
    fn cas_state(&self, from: ScanState, to: ScanState) -> bool {
        let ok = self.state.compare_and_set(from, to);
        if ok {
            self.queue.signal().signal();
        }
        ok
    }

    pub fn is_halted(&self) -> bool {
        self.flags.load().contains(DeviceFlags::HALTED)
    }

    pub(crate) fn mark_listed(&self) {
        self.flags.set(DeviceFlags::LISTED);
    }

    pub(crate) fn mark_halted(&self) {
        self.flags.set(DeviceFlags::HALTED);
    }

    fn try_acquire_open(&self) -> bool {
        !self.opened.swap(true, Ordering::SeqCst)
    }

    fn release_open(&self) {
        self.opened.store(false, Ordering::SeqCst);
    }
}

/// Probe every candidate endpoint and bind the first one that answers
/// `ScannerCapabilities` (§4.2). Returns `false` once every endpoint has
/// been exhausted, the registry's cue to delete the device.
pub async fn probe_and_bind(device: Arc<Device>) -> bool {
    device.flags.set(DeviceFlags::INIT_WAIT);
    let result = probe_endpoints(&device.endpoints, &*device.http, &device.name).await;
    device.flags.clear(DeviceFlags::INIT_WAIT);

    match result {
        Some(ProbeResult { handler, base_uri, capabilities }) => {
            *device.binding.lock().unwrap() = Some(Binding { handler, base_uri });
            device.options.store(Arc::new(OptionState::from_capabilities(capabilities)));
            device.set_state(ScanState::Idle);
            device.flags.set(DeviceFlags::READY);
            let now = chrono::Local::now();
            *device.ready_since.lock().unwrap() = Some(now);
            info!(
                target: "escl_scan_core::device",
                "{}: ready since {}", device.name, now.format("%c"),
            );
            true
        }
        None => {
            warn!(target: "escl_scan_core::device", "{}: every endpoint failed, giving up", device.name);
            device.flags.set(DeviceFlags::HALTED);
            false
        }
    }
}

/// Open a handle on an already-probed device (§4.6). Fails if another
/// handle is already open.
pub(crate) fn open_handle(device: Arc<Device>) -> Result<DeviceHandle, CoreError> {
    if device.is_halted() {
        return Err(CoreError::Closed);
    }
    if !device.try_acquire_open() {
        return Err(CoreError::Busy);
    }
    Ok(DeviceHandle { device })
}

/// A handle returned by [`crate::registry::Registry::open`]. The frontend
/// surface (§4.6): `set_option`/`start`/`read`/`cancel`, plus an implicit
/// `close` on drop.
pub struct DeviceHandle {
    device: Arc<Device>,
}

impl DeviceHandle {
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Apply an option mutation (§4.6 `set_option`). Rejected while a scan
    /// is in progress; recomputes frontend parameters and clipping
    /// afterwards. Uses the single-writer RCU pattern: one handle is the
    /// only writer of a device's option state at a time (enforced by
    /// `open`'s one-handle-at-a-time rule), so a copy-mutate-swap is race
    /// free without a lock held across `f`.
    pub fn set_option<F: FnOnce(&mut OptionState)>(&self, f: F) -> Status {
        if self.device.flags.load().contains(DeviceFlags::SCANNING) {
            return Status::DeviceBusy;
        }
        self.device.options.update(|opts| {
            f(opts);
            opts.recompute();
        });
        Status::Good
    }

    /// `get parameters` (§4.6): the frontend raster geometry derived from
    /// the current option selections.
    pub fn get_parameters(&self) -> crate::device::options::FrontendParams {
        self.device.options().params
    }

    pub fn options(&self) -> Arc<OptionState> {
        self.device.options()
    }

    /// `set io mode` (§4.6): only meaningful while a job is under way.
    pub fn set_io_mode(&self, non_blocking: bool) -> Status {
        if !self.device.flags.load().contains(DeviceFlags::SCANNING) {
            return Status::Inval;
        }
        self.device.non_blocking.store(non_blocking, Ordering::SeqCst);
        Status::Good
    }

    /// `get select fd` (§4.6): a descriptor that becomes readable whenever
    /// the state machine or the image queue changes. Only valid while
    /// scanning.
    pub fn get_select_fd(&self) -> Result<i32, Status> {
        if !self.device.flags.load().contains(DeviceFlags::SCANNING) {
            return Err(Status::Inval);
        }
        Ok(self.device.queue_signal().as_raw_fd())
    }

    pub fn start(&self) -> Status {
        start(&self.device)
    }

    pub fn read(&self, buf: &mut [u8]) -> (Status, usize) {
        read(&self.device, buf)
    }

    pub fn cancel(&self) {
        cancel(&self.device)
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        close(&self.device);
        self.device.release_open();
    }
}

/// `start` (§4.5, §4.6): either begin a fresh job, or, if one is already
/// under way, allow the caller to pull the job's next page.
pub fn start(device: &Arc<Device>) -> Status {
    let flags = device.flags.load();
    if flags.contains(DeviceFlags::HALTED) {
        return Status::IoError;
    }
    if !flags.contains(DeviceFlags::READY) {
        return Status::DeviceBusy;
    }
    if flags.contains(DeviceFlags::READING) {
        // The caller hasn't drained the previous page yet.
        return Status::DeviceBusy;
    }
    if flags.contains(DeviceFlags::SCANNING) {
        // A job is already under way (possibly with pages already queued);
        // this `start` just begins the next page (§4.5, §8 scenario 6).
        device.flags.set(DeviceFlags::READING);
        return Status::Good;
    }

    let options = device.options.load_full();
    if !options.implies_nonempty_image() {
        return Status::Inval;
    }
    if !device.cas_state(ScanState::Idle, ScanState::Scanning) {
        return Status::DeviceBusy;
    }

    {
        let mut job = device.job.lock().unwrap();
        job.reset(options.skip_x, options.skip_y);
    }
    device.flags.set(DeviceFlags::SCANNING | DeviceFlags::READING);

    let d = device.clone();
    device.eloop.call(async move {
        submit_op(d, Operation::Scan, 0).await;
    });

    Status::Good
}

/// Build and submit the HTTP request for one operation, then decode the
/// reply (§4.3's operation chain, §6).
async fn submit_op(device: Arc<Device>, op: Operation, retry_attempt: u32) {
    if device.is_halted() {
        return;
    }

    let (handler, base_uri) = {
        let guard = device.binding.lock().unwrap();
        match guard.as_ref() {
            Some(b) => (b.handler.clone(), b.base_uri.clone()),
            None => return,
        }
    };
    let options = device.options.load_full();
    let job_uri = device.job.lock().unwrap().job_uri().map(str::to_string);

    let ctx = ProtocolContext {
        base_uri: &base_uri,
        job_uri: job_uri.as_deref(),
        options: &options,
        retry_attempt,
        retry_max_attempts: device.retry.max_attempts,
        retry_interval: device.retry.interval,
    };
    let request = handler.build_query(op, &ctx);

    // Run the HTTP call as its own task so a cancel can abort it (§3, §4.9,
    // §5): at most one of these is ever outstanding per device, and a
    // superseded reply must never reach `apply_decode_result`.
    let http = device.http.clone();
    let task = tokio::spawn(async move { http.submit(request).await });
    *device.inflight.lock().unwrap() = Some(task.abort_handle());
    let outcome = task.await;
    *device.inflight.lock().unwrap() = None;

    match outcome {
        Ok(Ok(reply)) => on_reply(device, &*handler, op, reply, retry_attempt).await,
        Ok(Err(e)) => {
            warn!(target: "escl_scan_core::device", "{}: transport error on {op:?}: {e}", device.name);
            apply_decode_result(device, DecodeResult::finish(Status::IoError)).await;
        }
        Err(e) if e.is_cancelled() => {
            // Superseded by an explicit cancel; the cancel path already
            // drove the job to its final status.
            debug!(target: "escl_scan_core::device", "{}: {op:?} aborted by cancel", device.name);
        }
        Err(e) => {
            error!(target: "escl_scan_core::device", "{}: {op:?} task panicked: {e}", device.name);
            apply_decode_result(device, DecodeResult::finish(Status::IoError)).await;
        }
    }
}

async fn on_reply(device: Arc<Device>, handler: &dyn ProtocolHandler, op: Operation, reply: HttpReply, retry_attempt: u32) {
    let base_uri = match device.binding.lock().unwrap().as_ref().map(|b| b.base_uri.clone()) {
        Some(uri) => uri,
        None => return,
    };
    let options = device.options.load_full();
    let job_uri = device.job.lock().unwrap().job_uri().map(str::to_string);
    let ctx = ProtocolContext {
        base_uri: &base_uri,
        job_uri: job_uri.as_deref(),
        options: &options,
        retry_attempt,
        retry_max_attempts: device.retry.max_attempts,
        retry_interval: device.retry.interval,
    };
    let result = handler.decode_reply(op, &reply, &ctx);
    apply_decode_result(device, result).await;
}

/// Dispatch a decoded reply (§4.3): record any payload, apply the sticky
/// status rule, and either chain the next operation, arm a retry timer, or
/// finish the job.
async fn apply_decode_result(device: Arc<Device>, result: DecodeResult) {
    let DecodeResult { next, delay, status, payload } = result;

    if let Some(Payload::JobUri(uri)) = &payload {
        device.job.lock().unwrap().set_job_uri(uri.clone());
        // A cancel was requested while no job URI existed yet (§5): now
        // that one has arrived, supersede the chain with an explicit
        // CANCEL instead of letting LOAD/STATUS polling continue.
        if device.cas_state(ScanState::CancelWait, ScanState::Cancelling) {
            let d = device.clone();
            device.eloop.call(async move { submit_op(d, Operation::Cancel, 0).await });
            return;
        }
    }

    if let Some(Payload::Image { bytes, content_type }) = payload {
        device.job.lock().unwrap().note_image_received();
        device.queue.push(EncodedImage { bytes, content_type });
        // Broadcast even though the state itself hasn't changed: a reader
        // blocked in `read` waiting on the queue needs to wake up.
        device.state.notify();
    }

    // A cancel requested before any job URI was ever obtained (§5): the
    // in-flight SCAN ran to completion naturally; there is nothing on the
    // device side to cancel, so just mark the job cancelled and finish.
    if device.state.get() == ScanState::CancelWait && next == NextOp::Finish {
        let purge = device.job.lock().unwrap().set_status(Status::Cancelled);
        if purge {
            device.queue.purge();
        }
        finish_job(&device);
        return;
    }

    // The explicit CANCEL request issued once a job URI existed has now
    // completed one way or another. §4.3/§7: cancellation always sets the
    // job status to CANCELLED, regardless of the CANCEL request's own HTTP
    // or transport outcome.
    if device.state.get() == ScanState::Cancelling && next == NextOp::Finish {
        let purge = device.job.lock().unwrap().set_status(Status::Cancelled);
        if purge {
            device.queue.purge();
        }
        finish_job(&device);
        return;
    }

    let purge = device.job.lock().unwrap().set_status(status);
    if purge {
        let n = device.queue.purge();
        if n > 0 {
            debug!(target: "escl_scan_core::device", "{}: purged {n} buffered page(s) on cancel", device.name);
        }
    }

    match next {
        NextOp::Again(next_op) => {
            if delay.is_zero() {
                let d = device.clone();
                device.eloop.call(async move { submit_op(d, next_op, 0).await });
            } else {
                let attempt = device.job.lock().unwrap().note_retry();
                if attempt > device.retry.max_attempts {
                    let purge = device.job.lock().unwrap().set_status(Status::IoError);
                    if purge {
                        device.queue.purge();
                    }
                    finish_job(&device);
                    return;
                }
                let d = device.clone();
                let timer = device.eloop.schedule_timer(delay, async move {
                    submit_op(d, next_op, attempt).await;
                });
                *device.retry_timer.lock().unwrap() = Some(timer);
            }
        }
        NextOp::Cancel => {
            let d = device.clone();
            device.eloop.call(async move { submit_op(d, Operation::Cancel, 0).await });
        }
        NextOp::Cleanup => {
            let d = device.clone();
            device.eloop.call(async move { submit_op(d, Operation::Cleanup, 0).await });
        }
        NextOp::Finish => {
            // §4.3 rule 3: a job that delivered nothing and never set a
            // sticky error doesn't get to report GOOD — that would look
            // like an empty-but-successful scan.
            let needs_default = {
                let job = device.job.lock().unwrap();
                job.images_received() == 0 && job.status() == Status::Good
            };
            if needs_default {
                device.job.lock().unwrap().set_status(Status::IoError);
            }
            finish_job(&device);
        }
    }
}

/// The protocol chain for this job has ended (§4.3, §4.4): drop the job
/// URI and any pending retry timer, and move the state machine to `Done`.
/// Flags stay untouched here — `SCANNING`/`READING` only clear once the
/// frontend has drained every buffered page (`begin_next_image`), since a
/// finished job may still have pages sitting in the queue.
fn finish_job(device: &Arc<Device>) {
    if let Some(timer) = device.retry_timer.lock().unwrap().take() {
        timer.cancel();
    }
    device.job.lock().unwrap().clear_job_uri();
    device.set_state(ScanState::Done);
}

/// `cancel` (§4.6, §5): only ever flips `Scanning` to `CancelReq` and
/// arms an event; the rest of the transition happens on the event-loop
/// thread so it can safely touch the job URI and any in-flight request.
pub fn cancel(device: &Arc<Device>) {
    if device.cas_state(ScanState::Scanning, ScanState::CancelReq) {
        let d = device.clone();
        device.eloop.call(async move { handle_cancel_event(d).await });
    }
    // Any other state means a cancel is already in flight, or there is
    // nothing currently running to cancel.
}

/// Resolve a cancel request (§5). If a job URI has already been obtained,
/// an in-flight retry timer is torn down and an explicit CANCEL request
/// supersedes the chain. Otherwise the in-flight SCAN is left to complete
/// naturally; `apply_decode_result` notices the `CancelWait` state once
/// that reply lands and finishes the job without contacting the device.
async fn handle_cancel_event(device: Arc<Device>) {
    if !device.cas_state(ScanState::CancelReq, ScanState::CancelWait) {
        return;
    }
    let has_job_uri = device.job.lock().unwrap().job_uri().is_some();
    if has_job_uri {
        if let Some(timer) = device.retry_timer.lock().unwrap().take() {
            timer.cancel();
        }
        // Whatever LOAD/STATUS request is currently outstanding is about to
        // be superseded by an explicit CANCEL; abort it so its eventual
        // reply (if any) can never reach `apply_decode_result` (§3, §4.9).
        if let Some(handle) = device.inflight.lock().unwrap().take() {
            handle.abort();
        }
        device.set_state(ScanState::Cancelling);
        submit_op(device, Operation::Cancel, 0).await;
    }
}

/// `close` (§4.6): wait for any in-progress job to settle, then reset
/// per-handle state so the device is ready for the next `open`.
fn close(device: &Arc<Device>) {
    device.state.wait_while(None, |s| s.is_working());
    device.flags.clear(DeviceFlags::SCANNING | DeviceFlags::READING);
    *device.active_image.lock().unwrap() = None;
    device.decoder.lock().unwrap().reset();
    device.queue.purge();
    if device.state.get() == ScanState::Done {
        device.set_state(ScanState::Idle);
    }
}

/// `read` (§4.5, §4.6): decode lines into `buf` until it is full, the page
/// ends, or the whole job ends (§4.5's "decode lines ... until `max_len` is
/// filled"). Blocks the calling thread (not the event loop) while waiting
/// for the next line to become available.
pub fn read(device: &Arc<Device>, buf: &mut [u8]) -> (Status, usize) {
    if !device.flags.load().contains(DeviceFlags::READING) {
        return (Status::Inval, 0);
    }

    let mut written = 0usize;
    loop {
        if written >= buf.len() {
            return (Status::Good, written);
        }

        if device.active_image.lock().unwrap().is_none() {
            if written > 0 {
                // Don't cross a page boundary within one call (§8 scenario
                // 6: each `start`/`read`-to-EOF cycle is exactly one page).
                return (Status::Good, written);
            }
            match begin_next_image(device) {
                BeginOutcome::Active => {}
                BeginOutcome::Pending => {
                    wait_for_image(device);
                    continue;
                }
                BeginOutcome::WouldBlock => {
                    // §4.5/§8: non-blocking mode never waits on the queue.
                    return (Status::Good, 0);
                }
                BeginOutcome::Finished(status) => {
                    device.flags.clear(DeviceFlags::READING);
                    let reported = if status == Status::Good { Status::Eof } else { status };
                    return (reported, 0);
                }
            }
        }

        let has_pending_bytes = {
            let active = device.active_image.lock().unwrap();
            let a = active.as_ref().expect("just ensured an active image");
            a.pending_offset < a.pending_line.len()
        };
        if !has_pending_bytes {
            match next_active_line(device) {
                Ok(true) => {}
                Ok(false) => {
                    // Every promised line has been delivered (real or
                    // padded): this page is done. More pages may follow.
                    *device.active_image.lock().unwrap() = None;
                    if written > 0 {
                        return (Status::Good, written);
                    }
                    device.flags.clear(DeviceFlags::READING);
                    return (Status::Eof, 0);
                }
                Err(e) => {
                    error!(target: "escl_scan_core::device", "{}: {e}", device.name);
                    *device.active_image.lock().unwrap() = None;
                    device.flags.clear(DeviceFlags::READING);
                    return (e.as_status(), 0);
                }
            }
        }

        let mut active = device.active_image.lock().unwrap();
        let a = active.as_mut().expect("just ensured an active image");
        let available = a.pending_line.len() - a.pending_offset;
        let take = available.min(buf.len() - written);
        buf[written..written + take].copy_from_slice(&a.pending_line[a.pending_offset..a.pending_offset + take]);
        a.pending_offset += take;
        written += take;
    }
}

enum BeginOutcome {
    Active,
    Pending,
    WouldBlock,
    Finished(Status),
}

/// Pull the next encoded page off the queue and hand it to the decoder, or
/// report whether the caller should wait or the job has truly ended (§4.5,
/// §8 scenario 6: each `start`/`read`-to-EOF cycle is exactly one page).
fn begin_next_image(device: &Arc<Device>) -> BeginOutcome {
    if let Some(encoded) = device.queue.pop() {
        match start_decoding(device, encoded) {
            Ok(active) => {
                *device.active_image.lock().unwrap() = Some(active);
                BeginOutcome::Active
            }
            Err(e) => BeginOutcome::Finished(e.as_status()),
        }
    } else if device.state.get().is_working() {
        if device.is_non_blocking() {
            BeginOutcome::WouldBlock
        } else {
            BeginOutcome::Pending
        }
    } else {
        let status = device.job.lock().unwrap().status();
        device.flags.clear(DeviceFlags::SCANNING | DeviceFlags::READING);
        device.set_state(ScanState::Idle);
        BeginOutcome::Finished(status)
    }
}

fn wait_for_image(device: &Arc<Device>) {
    device.state.wait_while(None, |s| s.is_working() && device.queue.is_empty());
}

/// Begin decoding one encoded page, clipped to the skip window computed at
/// `start` time (§4.5).
fn start_decoding(device: &Arc<Device>, encoded: EncodedImage) -> Result<ActiveImage, CoreError> {
    let options = device.options.load_full();
    let mut decoder = device.decoder.lock().unwrap();
    decoder.begin(&encoded.bytes).map_err(CoreError::Format)?;
    let decoded = decoder.get_params().map_err(CoreError::Format)?;

    if decoded.bytes_per_pixel != options.params.bytes_per_pixel {
        return Err(CoreError::Format(anyhow::anyhow!(
            "decoded page is {:?} ({} bytes/pixel), frontend promised {} bytes/pixel",
            decoded.format, decoded.bytes_per_pixel, options.params.bytes_per_pixel,
        )));
    }

    let (skip_x, skip_y) = {
        let job = device.job.lock().unwrap();
        (job.skip_x.skip, job.skip_y.skip)
    };
    let window = Window {
        x_off: skip_x.min(decoded.pixels_per_line),
        y_off: skip_y.min(decoded.lines),
        width: decoded.pixels_per_line.saturating_sub(skip_x),
        height: decoded.lines.saturating_sub(skip_y),
    };
    let applied = decoder.set_window(window).map_err(CoreError::Format)?;

    // The frontend's promised row stride wins unless the decoder's actual
    // window is wider than what it promised (e.g. skip/window math left a
    // shorter promise than the real image provides).
    let bytes_per_line = options.params.bytes_per_line
        .max(applied.width * decoded.bytes_per_pixel);

    Ok(ActiveImage {
        bytes_per_line,
        total_lines: options.params.lines,
        lines_delivered: 0,
        pending_line: Vec::new(),
        pending_offset: 0,
    })
}

/// Produce the active page's next promised line into its pending-line
/// buffer. Columns the decoder didn't cover, and whole rows once the
/// decoder's real rows run out, are left `0xFF` (§4.5, §8: an undersized
/// image is padded out to the promised geometry, never treated as an
/// error). Returns `Ok(false)` once every promised line has been delivered.
fn next_active_line(device: &Arc<Device>) -> Result<bool, CoreError> {
    let bytes_per_line = {
        let active = device.active_image.lock().unwrap();
        let a = active.as_ref().expect("active image present");
        if a.lines_delivered >= a.total_lines {
            return Ok(false);
        }
        a.bytes_per_line as usize
    };

    let mut line = vec![0xFFu8; bytes_per_line];
    // `Ok(None)` just means the decoder is out of real rows; `line` is
    // already all-padding and still counts toward `total_lines`.
    device.decoder.lock().unwrap().read_line(&mut line).map_err(CoreError::Format)?;

    let mut active = device.active_image.lock().unwrap();
    let a = active.as_mut().expect("active image present");
    a.pending_line = line;
    a.pending_offset = 0;
    a.lines_delivered += 1;
    Ok(true)
}
