// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info};

use crate::messages::StatusMessage;
use crate::registry::Registry;
use crate::shutdown::Shutdown;

/// Sole writer of the [`Registry`]: drains gateway status snapshots in arrival
/// order until shutdown or until the status channel closes.
pub struct StatusObserver {
    registry: Arc<Registry>,
    statuses: Receiver<StatusMessage>,
    shutdown: Shutdown,
    recv_timeout: Duration,
    dump_status: bool,
}

impl StatusObserver {
    pub fn new(
        registry: Arc<Registry>,
        statuses: Receiver<StatusMessage>,
        shutdown: Shutdown,
        recv_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            statuses,
            shutdown,
            recv_timeout,
            dump_status: false,
        }
    }

    pub fn with_dump_status(mut self, dump_status: bool) -> Self {
        self.dump_status = dump_status;
        self
    }

    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("status-observer".into())
            .spawn(move || self.run())
    }

    pub fn run(self) {
        info!("status observer started");
        while !self.shutdown.is_triggered() {
            let status = match self.statuses.recv_timeout(self.recv_timeout) {
                Ok(status) => status,
                // Timeout only exists to re-check the shutdown flag.
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    info!("status channel closed");
                    break;
                }
            };

            if self.dump_status {
                debug!(gateway_id = %status.gateway_id, ?status, "status message");
            }
            let changes = self.registry.apply_status(&status);
            if self.dump_status {
                debug!(
                    ?changes,
                    registry = ?self.registry.snapshot(),
                    "registry after status update"
                );
            }
        }
        info!("status observer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::SinkConfigRecord;
    use crossbeam_channel::bounded;
    use std::time::Instant;

    #[test]
    fn applies_statuses_and_stops_on_shutdown() {
        let registry = Arc::new(Registry::new());
        let (tx, rx) = bounded(4);
        let shutdown = Shutdown::new();
        let handle = StatusObserver::new(
            Arc::clone(&registry),
            rx,
            shutdown.clone(),
            Duration::from_millis(20),
        )
        .spawn()
        .expect("spawn observer");

        tx.send(StatusMessage {
            gateway_id: "gw1".into(),
            configs: vec![SinkConfigRecord {
                sink_id: Some("s1".into()),
                started: Some(true),
                app_config_seq: Some(0),
                app_config_diag: Some(0),
                app_config_data: Some(Vec::new()),
                node_address: Some(5),
            }],
        })
        .expect("send status");

        let deadline = Instant::now() + Duration::from_secs(2);
        while registry.snapshot().sink_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(registry.snapshot().sink_count(), 1);

        shutdown.trigger();
        handle.join().expect("observer exits");
    }

    #[test]
    fn exits_when_channel_closes() {
        let (tx, rx) = bounded::<StatusMessage>(1);
        drop(tx);
        StatusObserver::new(
            Arc::new(Registry::new()),
            rx,
            Shutdown::new(),
            Duration::from_secs(60),
        )
        .run();
    }
}
