// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::io::BufReader;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use meshgate::config::{log_filter, Config};
use meshgate::correlator::Correlator;
use meshgate::error::{BridgeError, Result};
use meshgate::events::InboundRouter;
use meshgate::http::{start_http, CommandHandler, DispatchOptions, HttpSettings};
use meshgate::metrics::PerformanceCounters;
use meshgate::observer::StatusObserver;
use meshgate::registry::Registry;
use meshgate::shutdown::Shutdown;
use meshgate::transport::{JsonLinesPublisher, JsonLinesSubscriber};

fn main() -> Result<()> {
    // stdout carries outbound requests, so logs go to stderr.
    let filter = EnvFilter::try_new(log_filter()).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = Config::from_env();
    info!(version = env!("CARGO_PKG_VERSION"), ?config, "meshgate starting");

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("shutdown signal received");
            shutdown.trigger();
        })
        .map_err(|e| BridgeError::Io(std::io::Error::other(e)))?;
    }

    let (outbound_tx, outbound_rx) = bounded(config.queue_capacity);
    let (inbound_tx, inbound_rx) = bounded(config.queue_capacity);
    let (status_tx, status_rx) = bounded(config.queue_capacity);
    let (response_tx, response_rx) = bounded(config.queue_capacity);

    let registry = Arc::new(Registry::new());
    let counters = Arc::new(PerformanceCounters::new());
    let correlator = Arc::new(Correlator::new(outbound_tx, shutdown.clone()));

    let threads = vec![
        InboundRouter::new(inbound_rx, status_tx, response_tx, shutdown.clone()).spawn()?,
        StatusObserver::new(
            Arc::clone(&registry),
            status_rx,
            shutdown.clone(),
            config.status_recv_timeout,
        )
        .with_dump_status(config.dump_status)
        .spawn()?,
        correlator.spawn_dispatcher(response_rx)?,
    ];
    let publisher =
        JsonLinesPublisher::new(std::io::stdout(), outbound_rx, shutdown.clone()).spawn()?;
    // Blocked in a stdin read most of the time, so it is never joined.
    JsonLinesSubscriber::new(BufReader::new(std::io::stdin()), inbound_tx, shutdown.clone())
        .spawn()?;

    let handler = Arc::new(CommandHandler::new(
        registry,
        Arc::clone(&correlator),
        counters,
        DispatchOptions {
            wait_for_response: config.wait_for_response,
            response_timeout: config.response_timeout,
            dry_run: config.dry_run,
        },
    ));
    let http = start_http(HttpSettings::from_config(&config), handler, shutdown.clone())
        .map_err(|err| {
            shutdown.trigger();
            err
        })?;
    info!(addr = %http.local_addr(), "meshgate ready");

    while !shutdown.is_triggered() {
        thread::sleep(Duration::from_millis(100));
    }

    info!("shutting down");
    http.join();
    if publisher.join().is_err() {
        error!("publisher thread panicked");
    }
    for handle in threads {
        if handle.join().is_err() {
            error!("worker thread panicked");
        }
    }
    info!("meshgate stopped");
    Ok(())
}
