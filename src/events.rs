// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! Inbound message routing.
//!
//! The MQTT collaborator delivers everything it receives on one channel. The
//! router splits that stream by message kind so the status observer only sees
//! status snapshots and the response dispatcher only sees request responses.

use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use tracing::{info, warn};

use crate::messages::{GatewayResponse, InboundMessage, StatusMessage};
use crate::shutdown::Shutdown;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct InboundRouter {
    inbound: Receiver<InboundMessage>,
    statuses: Sender<StatusMessage>,
    responses: Sender<GatewayResponse>,
    shutdown: Shutdown,
}

impl InboundRouter {
    pub fn new(
        inbound: Receiver<InboundMessage>,
        statuses: Sender<StatusMessage>,
        responses: Sender<GatewayResponse>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            inbound,
            statuses,
            responses,
            shutdown,
        }
    }

    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("inbound-router".into())
            .spawn(move || self.run())
    }

    /// Forward messages until shutdown or until the inbound channel closes.
    /// Dropping the router closes both downstream channels.
    pub fn run(self) {
        while !self.shutdown.is_triggered() {
            let message = match self.inbound.recv_timeout(POLL_INTERVAL) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let delivered = match message {
                InboundMessage::Status(status) => self.offer_status(status),
                InboundMessage::Response(response) => self.forward(&self.responses, response),
            };
            if !delivered {
                break;
            }
        }
        info!("inbound router stopped");
    }

    /// Statuses never hold up responses: when the observer is behind, the
    /// snapshot is dropped and the gateway's next one takes its place.
    fn offer_status(&self, status: StatusMessage) -> bool {
        match self.statuses.try_send(status) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                warn!(gateway_id = %dropped.gateway_id, "status observer behind, status dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("inbound consumer disconnected");
                false
            }
        }
    }

    /// Blocks while the consumer is behind. Returns false once the consumer is
    /// gone or shutdown was requested while waiting.
    fn forward<T>(&self, tx: &Sender<T>, mut item: T) -> bool {
        loop {
            match tx.send_timeout(item, POLL_INTERVAL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => {
                    if self.shutdown.is_triggered() {
                        return false;
                    }
                    item = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    warn!("inbound consumer disconnected");
                    return false;
                }
            }
        }
    }
}
