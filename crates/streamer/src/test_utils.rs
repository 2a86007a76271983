//! Test doubles for the transport and control seams
//!
//! [`MockTransport`] keeps the same bookkeeping libusb does (which
//! descriptors are in flight, which completions are queued) so engine tests
//! can drive completions, cancellations and failures deterministically and
//! from as many threads as they like.

use crate::transport::{
    Binding, BulkInEndpoint, BulkSource, BulkTransport, Completion, CompletionHandler,
    TransferOutcome,
};
use crate::usb::{ControlChannel, UsbError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

/// Frame backed by ordinary heap memory
pub struct MockFrame {
    data: Arc<Mutex<Vec<u8>>>,
    live: Arc<AtomicUsize>,
}

impl Drop for MockFrame {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Descriptor handle; identity only
pub struct MockTransfer {
    id: usize,
}

struct Bound {
    slot: usize,
    data: Arc<Mutex<Vec<u8>>>,
    handler: Weak<dyn CompletionHandler>,
}

/// A completion taken out of the transport, deliverable from any thread
pub struct PendingCompletion {
    handler: Weak<dyn CompletionHandler>,
    completion: Completion,
}

impl PendingCompletion {
    pub fn completion(&self) -> Completion {
        self.completion
    }

    /// Run the engine's dispatcher for this completion
    pub fn deliver(self) {
        if let Some(handler) = self.handler.upgrade() {
            handler.on_completion(self.completion);
        }
    }
}

#[derive(Default)]
struct MockState {
    next_id: usize,
    bound: HashMap<usize, Bound>,
    slots: HashMap<usize, usize>,
    in_flight: HashSet<usize>,
    queue: VecDeque<PendingCompletion>,
    frame_allocs: usize,
    submits: usize,
    cancels: usize,
    fail_frame_alloc_at: Option<usize>,
    fail_submit_at: Option<(usize, UsbError)>,
    cancel_error: Option<UsbError>,
    defer_events: bool,
    bulk_data: Vec<u8>,
    after_submit: Option<(usize, SubmitHook)>,
}

type SubmitHook = Arc<dyn Fn() + Send + Sync>;

/// In-memory [`BulkTransport`]
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    live_frames: Arc<AtomicUsize>,
    event_passes: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `n`-th frame allocation (0-based) fail with `NoMem`
    pub fn fail_frame_alloc_at(self, n: usize) -> Self {
        self.lock().fail_frame_alloc_at = Some(n);
        self
    }

    /// Make the `n`-th submission (0-based, resubmissions included) fail
    pub fn fail_submit_at(self, n: usize, error: UsbError) -> Self {
        self.lock().fail_submit_at = Some((n, error));
        self
    }

    /// Make every cancellation of an in-flight transfer fail with `error`
    pub fn fail_cancel_with(self, error: UsbError) -> Self {
        self.lock().cancel_error = Some(error);
        self
    }

    /// Run `hook` right after the `n`-th submission (0-based) succeeds
    ///
    /// The hook runs without the transport lock held, so it may call back
    /// into the engine.
    pub fn after_submit(self, n: usize, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.lock().after_submit = Some((n, Arc::new(hook)));
        self
    }

    /// Keep cancellations queued during `handle_events`; see [`take_pending`](Self::take_pending)
    pub fn defer_events(self) -> Self {
        self.lock().defer_events = true;
        self
    }

    /// Data returned by `read_bulk`
    pub fn set_bulk_data(&self, data: Vec<u8>) {
        self.lock().bulk_data = data;
    }

    /// Finish the in-flight transfer of `slot` with `payload`
    ///
    /// Returns false if the slot is not in flight.
    pub fn complete(&self, slot: usize, payload: &[u8]) -> bool {
        let pending = {
            let mut state = self.lock();
            let Some(id) = state.slots.get(&slot).copied() else {
                return false;
            };
            if !state.in_flight.remove(&id) {
                return false;
            }
            let bound = &state.bound[&id];
            let mut data = lock(&bound.data);
            let len = payload.len().min(data.len());
            data[..len].copy_from_slice(&payload[..len]);
            PendingCompletion {
                handler: bound.handler.clone(),
                completion: Completion {
                    slot,
                    outcome: TransferOutcome::Completed,
                    actual_length: len,
                },
            }
        };
        pending.deliver();
        true
    }

    /// Finish the in-flight transfer of `slot` with a terminal `outcome`
    pub fn finish(&self, slot: usize, outcome: TransferOutcome) -> bool {
        let pending = {
            let mut state = self.lock();
            let Some(id) = state.slots.get(&slot).copied() else {
                return false;
            };
            if !state.in_flight.remove(&id) {
                return false;
            }
            PendingCompletion {
                handler: state.bound[&id].handler.clone(),
                completion: Completion {
                    slot,
                    outcome,
                    actual_length: 0,
                },
            }
        };
        pending.deliver();
        true
    }

    /// Finish `slot` with `payload` but leave the completion queued
    ///
    /// Models a transfer that is done on the bus while its callback has not
    /// run yet: cancelling it now reports "not found".
    pub fn complete_later(&self, slot: usize, payload: &[u8]) -> bool {
        let mut state = self.lock();
        let Some(id) = state.slots.get(&slot).copied() else {
            return false;
        };
        if !state.in_flight.remove(&id) {
            return false;
        }
        let pending = {
            let bound = &state.bound[&id];
            let mut data = lock(&bound.data);
            let len = payload.len().min(data.len());
            data[..len].copy_from_slice(&payload[..len]);
            PendingCompletion {
                handler: bound.handler.clone(),
                completion: Completion {
                    slot,
                    outcome: TransferOutcome::Completed,
                    actual_length: len,
                },
            }
        };
        state.queue.push_back(pending);
        true
    }

    /// Remove every queued completion without delivering it
    pub fn take_pending(&self) -> Vec<PendingCompletion> {
        self.lock().queue.drain(..).collect()
    }

    pub fn pending_events(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_in_flight(&self, slot: usize) -> bool {
        let state = self.lock();
        state
            .slots
            .get(&slot)
            .is_some_and(|id| state.in_flight.contains(id))
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Submission attempts so far, failed ones included
    pub fn submit_count(&self) -> usize {
        self.lock().submits
    }

    /// Successful cancellations so far
    pub fn cancel_count(&self) -> usize {
        self.lock().cancels
    }

    /// Frames allocated and not yet dropped
    pub fn live_frames(&self) -> usize {
        self.live_frames.load(Ordering::SeqCst)
    }

    /// Slots that have a bound descriptor, sorted
    pub fn bound_slots(&self) -> Vec<usize> {
        let mut slots: Vec<usize> = self.lock().slots.keys().copied().collect();
        slots.sort_unstable();
        slots
    }

    /// Calls to `handle_events` so far
    pub fn event_passes(&self) -> usize {
        self.event_passes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BulkTransport for MockTransport {
    type Frame = MockFrame;
    type Transfer = MockTransfer;

    fn alloc_frame(&self, len: usize) -> Result<MockFrame, UsbError> {
        let mut state = self.lock();
        let n = state.frame_allocs;
        state.frame_allocs += 1;
        if state.fail_frame_alloc_at == Some(n) {
            return Err(UsbError::NoMem);
        }
        self.live_frames.fetch_add(1, Ordering::SeqCst);
        Ok(MockFrame {
            data: Arc::new(Mutex::new(vec![0; len])),
            live: self.live_frames.clone(),
        })
    }

    fn alloc_transfer(&self) -> Result<MockTransfer, UsbError> {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        Ok(MockTransfer { id })
    }

    fn bind(&self, transfer: &mut MockTransfer, binding: Binding<'_, MockFrame>) {
        let mut state = self.lock();
        state.slots.insert(binding.slot, transfer.id);
        state.bound.insert(
            transfer.id,
            Bound {
                slot: binding.slot,
                data: binding.frame.data.clone(),
                handler: binding.handler,
            },
        );
    }

    fn submit(&self, transfer: &MockTransfer) -> Result<(), UsbError> {
        let mut state = self.lock();
        let n = state.submits;
        state.submits += 1;
        if let Some((at, error)) = &state.fail_submit_at
            && *at == n
        {
            return Err(error.clone());
        }
        if !state.in_flight.insert(transfer.id) {
            return Err(UsbError::Busy);
        }
        let hook = match &state.after_submit {
            Some((at, hook)) if *at == n => Some(hook.clone()),
            _ => None,
        };
        drop(state);

        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    fn cancel(&self, transfer: &MockTransfer) -> Result<(), UsbError> {
        let mut state = self.lock();
        if !state.in_flight.contains(&transfer.id) {
            return Err(UsbError::NotFound);
        }
        if let Some(error) = &state.cancel_error {
            return Err(error.clone());
        }
        state.in_flight.remove(&transfer.id);
        state.cancels += 1;
        let bound = &state.bound[&transfer.id];
        let pending = PendingCompletion {
            handler: bound.handler.clone(),
            completion: Completion {
                slot: bound.slot,
                outcome: TransferOutcome::Cancelled,
                actual_length: 0,
            },
        };
        state.queue.push_back(pending);
        Ok(())
    }

    fn with_frame(&self, frame: &MockFrame, len: usize, f: &mut dyn FnMut(&[u8])) {
        let data = lock(&frame.data);
        f(&data[..len.min(data.len())]);
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), UsbError> {
        self.event_passes.fetch_add(1, Ordering::SeqCst);
        let mut delivered = false;
        loop {
            // Delivered outside the lock: the dispatcher calls back into us
            let next = {
                let mut state = self.lock();
                if state.defer_events {
                    None
                } else {
                    state.queue.pop_front()
                }
            };
            match next {
                Some(pending) => {
                    pending.deliver();
                    delivered = true;
                }
                None => break,
            }
        }
        if !delivered && !timeout.is_zero() {
            std::thread::sleep(timeout.min(Duration::from_millis(1)));
        }
        Ok(())
    }

    fn read_bulk(
        &self,
        _endpoint: u8,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, UsbError> {
        let state = self.lock();
        if state.bulk_data.is_empty() {
            return Err(UsbError::Timeout);
        }
        let len = buf.len().min(state.bulk_data.len());
        buf[..len].copy_from_slice(&state.bulk_data[..len]);
        Ok(len)
    }
}

/// [`BulkSource`] over a shared [`MockTransport`]
pub struct MockSource {
    endpoint: Option<BulkInEndpoint>,
    transport: Arc<MockTransport>,
}

impl MockSource {
    /// Source with bulk IN endpoint 0x81
    pub fn new(max_packet_size: u16, max_burst: u8) -> Self {
        Self::with_transport(max_packet_size, max_burst, MockTransport::new())
    }

    pub fn with_transport(max_packet_size: u16, max_burst: u8, transport: MockTransport) -> Self {
        Self {
            endpoint: Some(BulkInEndpoint {
                address: 0x81,
                max_packet_size,
                max_burst,
            }),
            transport: Arc::new(transport),
        }
    }

    /// Device that exposes no bulk IN endpoint
    pub fn without_endpoint() -> Self {
        Self {
            endpoint: None,
            transport: Arc::new(MockTransport::new()),
        }
    }

    pub fn transport(&self) -> &MockTransport {
        &self.transport
    }
}

impl BulkSource for MockSource {
    type Transport = MockTransport;

    fn bulk_in_endpoint(&self) -> Option<BulkInEndpoint> {
        self.endpoint
    }

    fn bulk_transport(&self) -> Arc<MockTransport> {
        self.transport.clone()
    }
}

/// One recorded vendor request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlWrite {
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: Vec<u8>,
}

/// [`ControlChannel`] that records every request
#[derive(Default)]
pub struct RecordingControl {
    writes: Mutex<Vec<ControlWrite>>,
    short_write_at: Option<usize>,
    errors: HashMap<usize, UsbError>,
}

impl RecordingControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `n`-th request (0-based) accepts one byte less than it was given
    pub fn with_short_write(mut self, n: usize) -> Self {
        self.short_write_at = Some(n);
        self
    }

    /// The `n`-th request (0-based) fails with `error`
    pub fn with_error(mut self, n: usize, error: UsbError) -> Self {
        self.errors.insert(n, error);
        self
    }

    pub fn writes(&self) -> Vec<ControlWrite> {
        lock(&self.writes).clone()
    }
}

impl ControlChannel for RecordingControl {
    fn write_vendor(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, UsbError> {
        let mut writes = lock(&self.writes);
        let n = writes.len();
        writes.push(ControlWrite {
            request,
            value,
            index,
            data: data.to_vec(),
        });
        if let Some(error) = self.errors.get(&n) {
            return Err(error.clone());
        }
        if self.short_write_at == Some(n) {
            return Ok(data.len().saturating_sub(1));
        }
        Ok(data.len())
    }
}
