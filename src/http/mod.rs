// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

pub mod command;

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, TrySendError};
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::shutdown::Shutdown;

pub use command::{CommandHandler, CommandOutcome, DispatchOptions};

const ACCEPT_POLL: Duration = Duration::from_millis(100);

const NO_CACHE_HEADERS: [(&str, &str); 3] = [
    ("Cache-Control", "no-cache, no-store, must-revalidate"),
    ("Pragma", "no-cache"),
    ("Expires", "0"),
];

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub bind_addr: String,
    /// Accepted requests allowed to wait for a worker.
    pub backlog: usize,
    pub workers: usize,
    /// Longest a request may sit in the backlog before it is refused.
    pub request_timeout: Duration,
    pub bind_retry: Duration,
}

impl HttpSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.http_bind_addr.clone(),
            backlog: config.http_backlog,
            workers: config.http_workers,
            request_timeout: config.http_request_timeout,
            bind_retry: config.bind_retry,
        }
    }
}

pub struct HttpHandle {
    addr: SocketAddr,
    threads: Vec<thread::JoinHandle<()>>,
}

impl HttpHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the accept thread and every worker to finish.
    pub fn join(self) {
        for handle in self.threads {
            if handle.join().is_err() {
                error!("HTTP thread panicked");
            }
        }
    }
}

struct Queued {
    request: Request,
    accepted: Instant,
}

/// Bind `addr`, retrying every `retry` until it succeeds or shutdown is requested.
pub fn bind_with_retry(addr: &str, retry: Duration, shutdown: &Shutdown) -> Result<Server> {
    loop {
        match Server::http(addr) {
            Ok(server) => return Ok(server),
            Err(err) => {
                error!(
                    addr,
                    error = %err,
                    retry_secs = retry.as_secs_f64(),
                    "HTTP server bind failed"
                );
                if !shutdown.sleep(retry) {
                    return Err(BridgeError::Bind(format!("{addr}: {err}")));
                }
            }
        }
    }
}

/// Bind the HTTP server and start the accept thread plus `settings.workers`
/// workers. Everything stops once `shutdown` fires and the backlog is drained.
pub fn start_http(
    settings: HttpSettings,
    handler: Arc<CommandHandler>,
    shutdown: Shutdown,
) -> Result<HttpHandle> {
    let server = bind_with_retry(&settings.bind_addr, settings.bind_retry, &shutdown)?;
    let addr = server
        .server_addr()
        .to_ip()
        .ok_or_else(|| BridgeError::Bind(format!("{} is not an IP listener", settings.bind_addr)))?;
    info!(
        %addr,
        workers = settings.workers,
        backlog = settings.backlog,
        "HTTP server listening"
    );

    let (tx, rx) = bounded::<Queued>(settings.backlog.max(1));
    let mut threads = Vec::with_capacity(settings.workers + 1);

    for index in 0..settings.workers.max(1) {
        let rx = rx.clone();
        let handler = Arc::clone(&handler);
        let request_timeout = settings.request_timeout;
        threads.push(
            thread::Builder::new()
                .name(format!("http-worker-{index}"))
                .spawn(move || run_worker(rx, &handler, request_timeout))?,
        );
    }
    drop(rx);

    threads.push(
        thread::Builder::new()
            .name("http-accept".into())
            .spawn(move || {
                while !shutdown.is_triggered() {
                    let request = match server.recv_timeout(ACCEPT_POLL) {
                        Ok(Some(request)) => request,
                        Ok(None) => continue,
                        Err(err) => {
                            error!(error = %err, "HTTP accept failed");
                            break;
                        }
                    };
                    let queued = Queued {
                        request,
                        accepted: Instant::now(),
                    };
                    match tx.try_send(queued) {
                        Ok(()) => {}
                        Err(TrySendError::Full(queued)) => {
                            warn!(url = %queued.request.url(), "HTTP backlog full");
                            respond(queued.request, CommandOutcome::text(503, "Server busy"));
                        }
                        Err(TrySendError::Disconnected(queued)) => {
                            respond(queued.request, CommandOutcome::text(503, "Shutting down"));
                            break;
                        }
                    }
                }
                info!("HTTP accept loop stopped");
            })?,
    );

    Ok(HttpHandle { addr, threads })
}

fn run_worker(rx: Receiver<Queued>, handler: &CommandHandler, request_timeout: Duration) {
    for Queued { request, accepted } in rx.iter() {
        let queued_for = accepted.elapsed();
        if queued_for >= request_timeout {
            warn!(
                url = %request.url(),
                queued_ms = queued_for.as_millis() as u64,
                "HTTP request expired in backlog"
            );
            respond(request, CommandOutcome::text(503, "Request timed out"));
            continue;
        }
        if !matches!(request.method(), Method::Get | Method::Post) {
            let outcome = CommandOutcome::text(405, format!("Method {} not allowed", request.method()));
            respond(request, outcome);
            continue;
        }

        let url = request.url().to_string();
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&url))) {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(url = %url, "HTTP handler panicked");
                CommandOutcome::text(500, "Internal server error")
            }
        };
        debug!(url = %url, status = outcome.status, "HTTP response");
        respond(request, outcome);
    }
}

fn respond(request: Request, outcome: CommandOutcome) {
    let mut response = Response::from_string(outcome.body)
        .with_status_code(StatusCode(outcome.status));
    let headers = std::iter::once(("Content-Type", outcome.content_type)).chain(NO_CACHE_HEADERS);
    for (name, value) in headers {
        if let Ok(header) = Header::from_bytes(name.as_bytes(), value.as_bytes()) {
            response.add_header(header);
        }
    }
    if let Err(err) = request.respond(response) {
        warn!(error = %err, "failed to write HTTP response");
    }
}

pub(crate) fn map_error(err: &BridgeError) -> (u16, String) {
    match err {
        BridgeError::MissingField(_)
        | BridgeError::InvalidParam { .. }
        | BridgeError::NoCommand
        | BridgeError::UnknownCommand(_) => (500, err.to_string()),
        BridgeError::Downstream(_) => (502, err.to_string()),
        BridgeError::ShuttingDown => (503, err.to_string()),
        BridgeError::DuplicateRequest(_) | BridgeError::Bind(_) | BridgeError::Io(_) => {
            (500, err.to_string())
        }
    }
}
