// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! Line-delimited JSON transport.
//!
//! Stands in for the MQTT client: outbound gateway requests are written one
//! JSON object per line, and inbound status/response messages are read the
//! same way. Any process able to relay lines to and from a broker can sit on
//! the other end of stdin/stdout.

use std::io::{BufRead, Write};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::messages::{InboundMessage, OutboundRequest};
use crate::shutdown::Shutdown;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct JsonLinesPublisher<W> {
    writer: W,
    outbound: Receiver<OutboundRequest>,
    shutdown: Shutdown,
}

impl<W: Write + Send + 'static> JsonLinesPublisher<W> {
    pub fn new(writer: W, outbound: Receiver<OutboundRequest>, shutdown: Shutdown) -> Self {
        Self {
            writer,
            outbound,
            shutdown,
        }
    }

    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<W>> {
        thread::Builder::new()
            .name("publisher".into())
            .spawn(move || self.run())
    }

    /// Publish until shutdown, a closed queue or a write error. Returns the writer.
    pub fn run(mut self) -> W {
        loop {
            let request = match self.outbound.recv_timeout(POLL_INTERVAL) {
                Ok(request) => request,
                Err(RecvTimeoutError::Timeout) => {
                    if self.shutdown.is_triggered() {
                        break;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if let Err(err) = self.publish(&request) {
                error!(request_id = request.request_id, error = %err, "publish failed");
                break;
            }
        }
        info!("publisher stopped");
        self.writer
    }

    fn publish(&mut self, request: &OutboundRequest) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.writer, request)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        debug!(
            request_id = request.request_id,
            gateway_id = %request.gateway_id,
            kind = request.kind().as_str(),
            "published gateway request"
        );
        Ok(())
    }
}

pub struct JsonLinesSubscriber<R> {
    reader: R,
    inbound: Sender<InboundMessage>,
    shutdown: Shutdown,
}

impl<R: BufRead + Send + 'static> JsonLinesSubscriber<R> {
    pub fn new(reader: R, inbound: Sender<InboundMessage>, shutdown: Shutdown) -> Self {
        Self {
            reader,
            inbound,
            shutdown,
        }
    }

    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<usize>> {
        thread::Builder::new()
            .name("subscriber".into())
            .spawn(move || self.run())
    }

    /// Read messages until EOF, a read error, shutdown or a closed channel.
    /// Returns how many messages were forwarded.
    pub fn run(self) -> usize {
        let mut forwarded = 0;
        for (index, line) in self.reader.lines().enumerate() {
            if self.shutdown.is_triggered() {
                break;
            }
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    error!(error = %err, "inbound read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let message: InboundMessage = match serde_json::from_str(&line) {
                Ok(message) => message,
                Err(err) => {
                    warn!(line = index + 1, error = %err, "invalid inbound message");
                    continue;
                }
            };
            if self.inbound.send(message).is_err() {
                break;
            }
            forwarded += 1;
        }
        info!(forwarded, "subscriber stopped");
        forwarded
    }
}
