// SPDX-License-Identifier: AGPL-3.0-only

//! Scoring requests
//!
//! A [`Request`] is one enqueued scoring. It moves `Pending -> Running ->
//! Completed` on a worker thread; the caller waits on it through the
//! [`RequestHandler`] that owns all requests of a device.
//!
//! Waiting removes the request from the handler while blocking, so two
//! callers never wait on the same request. When the wait times out the
//! request is put back and the caller gets [`RequestStatus::Busy`], which is
//! not an error. A completed result is handed out once; the request is gone
//! afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::compiled_model::ScoreReport;
use crate::error::{GnaError, Result};

/// Lifecycle state of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Queued for a worker
    Pending,
    /// Being scored
    Running,
    /// Result available
    Completed,
}

/// Outcome of a wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    /// Scoring finished
    Completed(ScoreReport),
    /// Still pending or running; wait again later
    Busy,
}

#[derive(Debug)]
struct Slot {
    state: RequestState,
    result: Option<Result<ScoreReport>>,
}

/// One enqueued scoring
#[derive(Debug)]
pub struct Request {
    id: u32,
    config_id: u32,
    slot: Mutex<Slot>,
    completed: Condvar,
}

impl Request {
    fn new(id: u32, config_id: u32) -> Self {
        Self {
            id,
            config_id,
            slot: Mutex::new(Slot {
                state: RequestState::Pending,
                result: None,
            }),
            completed: Condvar::new(),
        }
    }

    /// Request id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Configuration the request scores with
    pub fn config_id(&self) -> u32 {
        self.config_id
    }

    /// Current state
    pub fn state(&self) -> RequestState {
        self.slot.lock().state
    }

    /// Mark the request as picked up by a worker
    pub fn start(&self) {
        self.slot.lock().state = RequestState::Running;
    }

    /// Store the result and wake waiters
    pub fn complete(&self, result: Result<ScoreReport>) {
        let mut slot = self.slot.lock();
        slot.state = RequestState::Completed;
        slot.result = Some(result);
        drop(slot);
        self.completed.notify_all();
    }

    /// Block until completion or `timeout`; `None` when still busy
    fn wait(&self, timeout: Duration) -> Option<Result<ScoreReport>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while slot.state != RequestState::Completed {
            if self.completed.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.result.take()
    }
}

/// Requests of one device
#[derive(Debug)]
pub struct RequestHandler {
    requests: Mutex<HashMap<u32, Arc<Request>>>,
    next_id: Mutex<u32>,
    max_queued: usize,
}

impl RequestHandler {
    /// Handler accepting at most `max_queued` outstanding requests
    pub fn new(max_queued: usize) -> Self {
        Self {
            requests: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
            max_queued,
        }
    }

    /// Register a new pending request
    ///
    /// # Errors
    ///
    /// [`GnaError::RequestQueueFull`] when `max_queued` requests are
    /// outstanding.
    pub fn enqueue(&self, config_id: u32) -> Result<Arc<Request>> {
        let mut requests = self.requests.lock();
        if requests.len() >= self.max_queued {
            return Err(GnaError::RequestQueueFull {
                limit: self.max_queued,
            });
        }
        let id = {
            let mut next = self.next_id.lock();
            let id = *next;
            *next = next.wrapping_add(1);
            id
        };
        let request = Arc::new(Request::new(id, config_id));
        requests.insert(id, Arc::clone(&request));
        tracing::debug!("Enqueued request {id} for config {config_id}");
        Ok(request)
    }

    /// Wait up to `timeout` for request `id`
    ///
    /// # Errors
    ///
    /// [`GnaError::IdentifierInvalid`] for an unknown or already retrieved
    /// request, or the scoring error of the request.
    pub fn wait(&self, id: u32, timeout: Duration) -> Result<RequestStatus> {
        let request = self
            .requests
            .lock()
            .remove(&id)
            .ok_or_else(|| GnaError::identifier("request", id))?;
        match request.wait(timeout) {
            Some(result) => {
                tracing::debug!("Request {id} retrieved");
                result.map(RequestStatus::Completed)
            }
            None => {
                self.requests.lock().insert(id, request);
                tracing::debug!("Request {id} still busy after {timeout:?}");
                Ok(RequestStatus::Busy)
            }
        }
    }

    /// Outstanding requests, completed or not
    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    /// True when nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Requests not yet completed
    pub fn pending(&self) -> usize {
        self.requests
            .lock()
            .values()
            .filter(|r| r.state() != RequestState::Completed)
            .count()
    }

    /// True when a request of `config_id` is outstanding
    pub fn uses_config(&self, config_id: u32) -> bool {
        self.requests
            .lock()
            .values()
            .any(|r| r.config_id() == config_id && r.state() != RequestState::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_times_out_then_completes() {
        let handler = RequestHandler::new(4);
        let request = handler.enqueue(7).unwrap();
        assert_eq!(request.state(), RequestState::Pending);
        assert_eq!(
            handler.wait(request.id(), Duration::from_millis(10)).unwrap(),
            RequestStatus::Busy
        );
        // Still queryable after a busy wait.
        assert_eq!(handler.len(), 1);
        assert_eq!(handler.pending(), 1);

        request.start();
        request.complete(Ok(ScoreReport {
            saturation_count: 3,
            ..ScoreReport::default()
        }));
        match handler.wait(request.id(), Duration::from_millis(10)).unwrap() {
            RequestStatus::Completed(report) => assert_eq!(report.saturation_count, 3),
            RequestStatus::Busy => panic!("request completed"),
        }
        assert!(handler.is_empty());
        assert!(matches!(
            handler.wait(request.id(), Duration::ZERO),
            Err(GnaError::IdentifierInvalid { what: "request", .. })
        ));
    }

    #[test]
    fn test_completion_wakes_waiter() {
        let handler = Arc::new(RequestHandler::new(4));
        let request = handler.enqueue(0).unwrap();
        let id = request.id();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            request.complete(Ok(ScoreReport::default()));
        });
        let status = handler.wait(id, Duration::from_secs(10)).unwrap();
        assert!(matches!(status, RequestStatus::Completed(_)));
        worker.join().unwrap();
    }

    #[test]
    fn test_scoring_error_returned_once() {
        let handler = RequestHandler::new(4);
        let request = handler.enqueue(0).unwrap();
        request.complete(Err(GnaError::QueueContention));
        assert!(matches!(
            handler.wait(request.id(), Duration::ZERO),
            Err(GnaError::QueueContention)
        ));
        assert!(handler.is_empty());
    }

    #[test]
    fn test_queue_limit() {
        let handler = RequestHandler::new(2);
        let first = handler.enqueue(0).unwrap();
        handler.enqueue(1).unwrap();
        assert!(matches!(
            handler.enqueue(2),
            Err(GnaError::RequestQueueFull { limit: 2 })
        ));
        assert!(handler.uses_config(1));
        first.complete(Ok(ScoreReport::default()));
        handler.wait(first.id(), Duration::ZERO).unwrap();
        handler.enqueue(2).unwrap();
    }
}
