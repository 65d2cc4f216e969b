//! Correlates outgoing requests (and deferred cluster/network notices) with
//! the responses that fulfill them (spec §4.7).
//!
//! A [`TrackingService`] holds an ordered map of 16-byte tracker keys to
//! trackers. `process` records inbound responses; `execute` is the
//! scheduler-driven sweep that promotes trackers through
//! `Pending -> Fulfilled -> Completed` and fires the registered callbacks.

use crate::error::{Error, Result};
use crate::identifier::Identifier;
use codec::message::{ApplicationParcel, Status};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

pub const DEFAULT_EXPIRATION: Duration = Duration::from_millis(1500);
pub const STATUS_OK: u16 = 200;
pub const STATUS_REQUEST_TIMEOUT: u16 = 408;

/// 16-byte tracker key: requesting peer's identifier prefix, a monotonic
/// per-service counter, and random entropy — orderable per-peer for
/// debugging rather than a flat random UUID (an `original_source/`
/// supplement, see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackerKey([u8; 16]);

impl TrackerKey {
    pub fn as_bytes(&self) -> [u8; 16] {
        self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

/// The outcome of one response being fed into [`TrackingService::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Partial,
    Fulfilled,
    Unexpected,
}

/// A fulfilled response, handed to a request tracker's `on_response` or
/// `on_error` callback.
#[derive(Debug, Clone)]
pub struct Response {
    pub key: TrackerKey,
    pub source: Identifier,
    pub parcel: Option<ApplicationParcel>,
    pub status: Status,
    pub remaining: usize,
}

type ResponseCallback = Box<dyn Fn(Response) + Send + Sync>;

/// Something a deferred tracker can dispatch its aggregate response
/// through once every expected identifier (or the deadline) has been
/// satisfied. Implemented by `crate::proxy::Proxy`.
pub trait ResponseSink: Send + Sync {
    fn send_application(&self, parcel: ApplicationParcel);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackerState {
    Pending,
    Fulfilled,
    Completed,
}

struct RequestTracker {
    expected: usize,
    deadline: Instant,
    created: Instant,
    ledger: HashMap<Identifier, bool>,
    responses: Vec<(Identifier, Option<ApplicationParcel>)>,
    on_response: ResponseCallback,
    on_error: ResponseCallback,
    state: TrackerState,
}

impl RequestTracker {
    fn received(&self) -> usize {
        self.ledger.values().filter(|responded| **responded).count()
    }
}

struct DeferredTracker {
    deadline: Instant,
    created: Instant,
    #[allow(dead_code)]
    original_request: ApplicationParcel,
    requestor: Weak<dyn ResponseSink>,
    expected: Vec<Identifier>,
    responses: HashMap<Identifier, Vec<u8>>,
    state: TrackerState,
}

enum Tracker {
    Request(RequestTracker),
    Deferred(DeferredTracker),
}

impl Tracker {
    fn check_status(&mut self, now: Instant) {
        match self {
            Tracker::Request(tracker) => {
                if tracker.state == TrackerState::Pending
                    && (tracker.received() >= tracker.expected || now >= tracker.deadline)
                {
                    tracker.state = TrackerState::Fulfilled;
                }
            }
            Tracker::Deferred(tracker) => {
                if tracker.state == TrackerState::Pending
                    && (tracker.responses.len() >= tracker.expected.len() || now >= tracker.deadline)
                {
                    tracker.state = TrackerState::Fulfilled;
                }
            }
        }
    }

    fn state(&self) -> TrackerState {
        match self {
            Tracker::Request(t) => t.state,
            Tracker::Deferred(t) => t.state,
        }
    }
}

/// State for every in-flight or recently-completed tracker, plus the
/// monotonic counter used to derive fresh keys.
pub struct TrackingService {
    trackers: parking_lot::Mutex<HashMap<TrackerKey, Tracker>>,
    counter: AtomicU32,
    expiration: Duration,
}

impl TrackingService {
    pub fn new(expiration: Duration) -> Self {
        Self {
            trackers: parking_lot::Mutex::new(HashMap::new()),
            counter: AtomicU32::new(0),
            expiration,
        }
    }

    fn next_key(&self, requestor: Identifier) -> TrackerKey {
        let mut bytes = [0u8; 16];
        bytes[..4].copy_from_slice(&requestor.internal()[..4]);
        bytes[4..8].copy_from_slice(&self.counter.fetch_add(1, Ordering::Relaxed).to_le_bytes());
        rand::thread_rng().fill_bytes(&mut bytes[8..]);
        TrackerKey(bytes)
    }

    /// Stages a request tracker expecting `expected` responses (1 for a
    /// single-peer request, N for a broadcast), returning the key to bind
    /// as the outbound message's `Awaitable{Request, key}` extension.
    pub fn stage_request(
        &self,
        requestor: Identifier,
        expected: impl IntoIterator<Item = Identifier>,
        on_response: impl Fn(Response) + Send + Sync + 'static,
        on_error: impl Fn(Response) + Send + Sync + 'static,
    ) -> TrackerKey {
        let key = self.next_key(requestor);
        let now = Instant::now();
        let ledger: HashMap<Identifier, bool> =
            expected.into_iter().map(|identifier| (identifier, false)).collect();
        let expected_count = ledger.len().max(1);

        let tracker = RequestTracker {
            expected: expected_count,
            deadline: now + self.expiration,
            created: now,
            ledger,
            responses: Vec::new(),
            on_response: Box::new(on_response),
            on_error: Box::new(on_error),
            state: TrackerState::Pending,
        };

        self.trackers.lock().insert(key, Tracker::Request(tracker));
        key
    }

    /// Stages a deferred tracker for a cluster/network notice, expecting
    /// one response per identifier in `peers` (the local node's own
    /// identifier, if present, is processed immediately rather than
    /// waited on).
    pub fn stage_deferred(
        &self,
        local_identifier: Identifier,
        peers: impl IntoIterator<Item = Identifier>,
        original_request: ApplicationParcel,
        requestor: Weak<dyn ResponseSink>,
        local_response: Option<Vec<u8>>,
    ) -> TrackerKey {
        let key = self.next_key(local_identifier);
        let now = Instant::now();
        let expected: Vec<Identifier> = peers.into_iter().filter(|p| *p != local_identifier).collect();

        let mut responses = HashMap::new();
        if let Some(payload) = local_response {
            responses.insert(local_identifier, payload);
        }

        let tracker = DeferredTracker {
            deadline: now + self.expiration,
            created: now,
            original_request,
            requestor,
            expected,
            responses,
            state: TrackerState::Pending,
        };

        self.trackers.lock().insert(key, Tracker::Deferred(tracker));
        key
    }

    /// Records an inbound response parcel carrying an
    /// `Awaitable{Response, key}` extension.
    pub fn process(&self, key: TrackerKey, source: Identifier, parcel: ApplicationParcel) -> ProcessOutcome {
        let mut trackers = self.trackers.lock();
        match trackers.get_mut(&key) {
            Some(Tracker::Request(tracker)) => {
                match tracker.ledger.get(&source) {
                    None => ProcessOutcome::Unexpected,
                    Some(true) => ProcessOutcome::Unexpected,
                    Some(false) => {
                        tracker.ledger.insert(source, true);
                        tracker.responses.push((source, Some(parcel)));
                        if tracker.received() >= tracker.expected {
                            ProcessOutcome::Fulfilled
                        } else {
                            ProcessOutcome::Partial
                        }
                    }
                }
            }
            Some(Tracker::Deferred(tracker)) => {
                if !tracker.expected.contains(&source) || tracker.responses.contains_key(&source) {
                    return ProcessOutcome::Unexpected;
                }
                tracker.responses.insert(source, parcel.frame.payload.clone());
                if tracker.responses.len() >= tracker.expected.len() {
                    ProcessOutcome::Fulfilled
                } else {
                    ProcessOutcome::Partial
                }
            }
            None => ProcessOutcome::Unexpected,
        }
    }

    /// Records a locally-produced response directly (no wire parcel), used
    /// when a request targets this node itself.
    pub fn process_direct(&self, key: TrackerKey, source: Identifier, payload: Vec<u8>) -> ProcessOutcome {
        let mut trackers = self.trackers.lock();
        match trackers.get_mut(&key) {
            Some(Tracker::Deferred(tracker)) => {
                if tracker.responses.contains_key(&source) {
                    return ProcessOutcome::Unexpected;
                }
                tracker.responses.insert(source, payload);
                if tracker.responses.len() >= tracker.expected.len() {
                    ProcessOutcome::Fulfilled
                } else {
                    ProcessOutcome::Partial
                }
            }
            Some(Tracker::Request(_)) | None => ProcessOutcome::Unexpected,
        }
    }

    pub fn peek_state(&self, key: TrackerKey) -> Option<&'static str> {
        let mut trackers = self.trackers.lock();
        let tracker = trackers.get_mut(&key)?;
        tracker.check_status(Instant::now());
        Some(match tracker.state() {
            TrackerState::Pending => "pending",
            TrackerState::Fulfilled => "fulfilled",
            TrackerState::Completed => "completed",
        })
    }

    /// Sweeps every tracker: promotes Pending to Fulfilled where due,
    /// fires `Fulfill()` side effects for newly-Fulfilled trackers, then
    /// drops everything that reached Completed. Returns the count fulfilled
    /// this sweep.
    pub fn execute(&self) -> usize {
        let now = Instant::now();
        let mut fulfilled_count = 0;
        let mut completed_keys = Vec::new();

        let mut trackers = self.trackers.lock();
        for (key, tracker) in trackers.iter_mut() {
            tracker.check_status(now);
            if tracker.state() == TrackerState::Fulfilled {
                fulfill(tracker);
                fulfilled_count += 1;
            }
            if tracker.state() == TrackerState::Completed {
                completed_keys.push(*key);
            }
        }
        for key in completed_keys {
            trackers.remove(&key);
        }
        fulfilled_count
    }

    pub fn len(&self) -> usize {
        self.trackers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fires a tracker's side effects and transitions it to Completed. Request
/// trackers dispatch `on_response`/`on_error` in arrival order, then
/// synthesize timeouts for every peer that never responded. Deferred
/// trackers assemble an aggregate payload and send it through the
/// requestor proxy, if it is still alive.
fn fulfill(tracker: &mut Tracker) {
    match tracker {
        Tracker::Request(request) => {
            let dispatched = std::mem::take(&mut request.responses);
            let mut remaining = dispatched.len().saturating_sub(1);
            for (source, parcel) in dispatched {
                let status = parcel
                    .as_ref()
                    .and_then(|p| p.status().ok().flatten())
                    .unwrap_or(Status { code: STATUS_OK });
                let response = Response {
                    key: TrackerKey([0u8; 16]),
                    source,
                    parcel,
                    status,
                    remaining,
                };
                if response.status.code >= 400 {
                    (request.on_error)(response);
                } else {
                    (request.on_response)(response);
                }
                remaining = remaining.saturating_sub(1);
            }

            let unresponded: Vec<Identifier> = request
                .ledger
                .iter()
                .filter(|(_, responded)| !**responded)
                .map(|(identifier, _)| *identifier)
                .collect();
            for source in unresponded {
                (request.on_error)(Response {
                    key: TrackerKey([0u8; 16]),
                    source,
                    parcel: None,
                    status: Status { code: STATUS_REQUEST_TIMEOUT },
                    remaining: 0,
                });
            }

            request.state = TrackerState::Completed;
        }
        Tracker::Deferred(deferred) => {
            if let Some(sink) = deferred.requestor.upgrade() {
                let aggregate: HashMap<String, Vec<u8>> = deferred
                    .responses
                    .iter()
                    .map(|(identifier, payload)| (identifier.external(), payload.clone()))
                    .collect();
                if let Ok(payload) = serde_json::to_vec(&aggregate.into_iter().collect::<Vec<_>>()) {
                    let header =
                        codec::frame::Header::new(0, 0, deferred.original_request.frame.header.source_identifier.clone());
                    let parcel = ApplicationParcel::new(header, payload, Vec::new());
                    sink.send_application(parcel);
                }
            }
            deferred.state = TrackerState::Completed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::frame::Header;
    use std::sync::Mutex as StdMutex;

    fn identifier(byte: u8) -> Identifier {
        Identifier::from_bytes([byte; 32])
    }

    fn response_parcel(status: u16) -> ApplicationParcel {
        let header = Header::new(0, 0, identifier(1).internal().to_vec());
        ApplicationParcel::new(header, b"pong".to_vec(), Vec::new()).with_status(Status { code: status })
    }

    #[test]
    fn single_request_single_response_fires_on_response() {
        let service = TrackingService::new(DEFAULT_EXPIRATION);
        let seen: Arc<StdMutex<Vec<Response>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_ok = seen.clone();
        let seen_err = seen.clone();

        let key = service.stage_request(
            identifier(1),
            [identifier(2)],
            move |r| seen_ok.lock().unwrap().push(r),
            move |r| seen_err.lock().unwrap().push(r),
        );

        assert_eq!(
            service.process(key, identifier(2), response_parcel(STATUS_OK)),
            ProcessOutcome::Fulfilled
        );

        service.execute();
        let collected = seen.lock().unwrap();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].remaining, 0);
        assert!(service.is_empty());
    }

    #[test]
    fn duplicate_response_is_rejected() {
        let service = TrackingService::new(DEFAULT_EXPIRATION);
        let key = service.stage_request(identifier(1), [identifier(2), identifier(3)], |_| {}, |_| {});

        assert_eq!(
            service.process(key, identifier(2), response_parcel(STATUS_OK)),
            ProcessOutcome::Partial
        );
        assert_eq!(
            service.process(key, identifier(2), response_parcel(STATUS_OK)),
            ProcessOutcome::Unexpected
        );
        assert_eq!(service.peek_state(key), Some("pending"));
    }

    #[test]
    fn partial_expiration_fires_timeouts_for_the_rest() {
        let service = TrackingService::new(Duration::from_millis(5));
        let ok_seen: Arc<StdMutex<Vec<Response>>> = Arc::new(StdMutex::new(Vec::new()));
        let err_seen: Arc<StdMutex<Vec<Response>>> = Arc::new(StdMutex::new(Vec::new()));
        let ok_clone = ok_seen.clone();
        let err_clone = err_seen.clone();

        let key = service.stage_request(
            identifier(1),
            [identifier(2), identifier(3), identifier(4)],
            move |r| ok_clone.lock().unwrap().push(r),
            move |r| err_clone.lock().unwrap().push(r),
        );

        service.process(key, identifier(2), response_parcel(STATUS_OK));
        std::thread::sleep(Duration::from_millis(10));
        service.execute();

        assert_eq!(ok_seen.lock().unwrap().len(), 1);
        assert_eq!(err_seen.lock().unwrap().len(), 2);
        for response in err_seen.lock().unwrap().iter() {
            assert_eq!(response.status.code, STATUS_REQUEST_TIMEOUT);
        }
        assert!(service.is_empty());
    }

    #[test]
    fn multi_response_request_fires_on_response_in_arrival_order() {
        let service = TrackingService::new(DEFAULT_EXPIRATION);
        let seen: Arc<StdMutex<Vec<Response>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_ok = seen.clone();

        let peers = [identifier(2), identifier(3), identifier(4), identifier(5), identifier(6)];
        let key = service.stage_request(identifier(1), peers, move |r| seen_ok.lock().unwrap().push(r), |_| {});

        for (index, peer) in peers.iter().enumerate() {
            let expected_outcome = if index == peers.len() - 1 {
                ProcessOutcome::Fulfilled
            } else {
                ProcessOutcome::Partial
            };
            assert_eq!(service.process(key, *peer, response_parcel(STATUS_OK)), expected_outcome);
        }
        service.execute();

        let collected = seen.lock().unwrap();
        assert_eq!(collected.len(), 5);
        for (index, response) in collected.iter().enumerate() {
            assert_eq!(response.source, peers[index]);
            assert_eq!(response.remaining, peers.len() - 1 - index);
        }
        assert!(service.is_empty());
    }

    #[test]
    fn invariants_hold_for_every_tracker() {
        let service = TrackingService::new(DEFAULT_EXPIRATION);
        let key = service.stage_request(identifier(1), [identifier(2)], |_| {}, |_| {});
        let trackers = service.trackers.lock();
        if let Some(Tracker::Request(tracker)) = trackers.get(&key) {
            assert!(tracker.received() <= tracker.expected);
            assert!(tracker.deadline > tracker.created);
        } else {
            panic!("expected request tracker");
        }
    }
}
