// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! Pairs outbound gateway requests with their asynchronous responses.
//!
//! Each waiting caller registers a one-shot channel under its request id. A
//! single dispatcher thread drains the response channel and hands every
//! response to the waiter registered for it, so concurrent waiters never
//! consume each other's responses. Responses nobody waits for are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::messages::{GatewayResponse, OutboundRequest};
use crate::shutdown::Shutdown;

/// Granularity of the response wait loop.
pub const POLL_SLICE: Duration = Duration::from_millis(10);

const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Answered(GatewayResponse),
    NoResponse { waited: Duration },
    /// The request was enqueued without waiting.
    NotAwaited,
}

pub struct Correlator {
    outbound: Sender<OutboundRequest>,
    pending: Mutex<HashMap<u64, Sender<GatewayResponse>>>,
    next_id: AtomicU64,
    shutdown: Shutdown,
    send_timeout: Duration,
}

impl Correlator {
    pub fn new(outbound: Sender<OutboundRequest>, shutdown: Shutdown) -> Self {
        // Seeded from the clock so ids do not repeat across restarts.
        let seed = (unix_ms() & 0xFFFF_FFFF) << 16;
        Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(seed.max(1)),
            shutdown,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// How long `submit` may block on a full outbound queue.
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Enqueue a request for the publisher without waiting for an answer.
    pub fn submit(&self, request: OutboundRequest) -> Result<()> {
        let request_id = request.request_id;
        self.outbound
            .send_timeout(request, self.send_timeout)
            .map_err(|err| {
                let reason = match err {
                    SendTimeoutError::Timeout(_) => "outbound queue full",
                    SendTimeoutError::Disconnected(_) => "outbound queue closed",
                };
                warn!(request_id, reason, "failed to enqueue gateway request");
                BridgeError::Downstream(reason.to_string())
            })
    }

    /// Enqueue `request` and, when `blocking`, wait up to `timeout` for the
    /// response carrying the same request id. A wait cut short by shutdown
    /// fails with [`BridgeError::ShuttingDown`].
    pub fn send_and_wait(
        &self,
        request: OutboundRequest,
        timeout: Duration,
        blocking: bool,
    ) -> Result<WaitOutcome> {
        if !blocking {
            self.submit(request)?;
            return Ok(WaitOutcome::NotAwaited);
        }

        let request_id = request.request_id;
        let (tx, rx) = bounded(1);
        {
            let mut pending = self.lock_pending();
            if pending.contains_key(&request_id) {
                return Err(BridgeError::DuplicateRequest(request_id));
            }
            pending.insert(request_id, tx);
        }
        let _pending = PendingGuard {
            correlator: self,
            request_id,
        };

        self.submit(request)?;

        let start = Instant::now();
        loop {
            let waited = start.elapsed();
            if waited >= timeout {
                warn!(
                    request_id,
                    waited_ms = waited.as_millis() as u64,
                    "no response from gateway in time"
                );
                return Ok(WaitOutcome::NoResponse { waited });
            }
            if self.shutdown.is_triggered() {
                debug!(request_id, "wait abandoned on shutdown");
                return Err(BridgeError::ShuttingDown);
            }
            match rx.recv_timeout(POLL_SLICE.min(timeout - waited)) {
                Ok(response) => return Ok(WaitOutcome::Answered(response)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Ok(WaitOutcome::NoResponse {
                        waited: start.elapsed(),
                    })
                }
            }
        }
    }

    /// Deliver a response to its waiter. Returns false if nobody was waiting.
    pub fn resolve(&self, response: GatewayResponse) -> bool {
        let request_id = response.request_id;
        let waiter = self.lock_pending().remove(&request_id);
        match waiter {
            Some(tx) => tx.try_send(response).is_ok(),
            None => {
                debug!(request_id, "dropping response without pending request");
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Run the response dispatcher until shutdown or until `responses` closes.
    pub fn spawn_dispatcher(
        self: &Arc<Self>,
        responses: Receiver<GatewayResponse>,
    ) -> std::io::Result<thread::JoinHandle<()>> {
        let correlator = Arc::clone(self);
        thread::Builder::new()
            .name("response-dispatcher".into())
            .spawn(move || {
                while !correlator.shutdown.is_triggered() {
                    match responses.recv_timeout(Duration::from_millis(100)) {
                        Ok(response) => {
                            correlator.resolve(response);
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("response dispatcher stopped");
            })
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Sender<GatewayResponse>>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct PendingGuard<'a> {
    correlator: &'a Correlator,
    request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.lock_pending().remove(&self.request_id);
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
