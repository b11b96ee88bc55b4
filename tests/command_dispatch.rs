// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver};
use meshgate::correlator::Correlator;
use meshgate::http::{CommandHandler, DispatchOptions};
use meshgate::messages::{
    GatewayResponse, OutboundRequest, RequestKind, RequestPayload, SinkConfigRecord,
    StatusMessage, BROADCAST_ADDRESS, MSAP_PING_REQUEST,
};
use meshgate::metrics::PerformanceCounters;
use meshgate::registry::Registry;
use meshgate::shutdown::Shutdown;

struct Fixture {
    handler: CommandHandler,
    outbound: Receiver<OutboundRequest>,
    counters: Arc<PerformanceCounters>,
    correlator: Arc<Correlator>,
}

fn record(sink_id: &str, node_address: u32, seq: u8) -> SinkConfigRecord {
    SinkConfigRecord {
        sink_id: Some(sink_id.into()),
        started: Some(true),
        app_config_seq: Some(seq),
        app_config_diag: Some(60),
        app_config_data: Some(vec![0x01, 0x02]),
        node_address: Some(node_address),
    }
}

fn network(configs: Vec<SinkConfigRecord>) -> Arc<Registry> {
    let registry = Arc::new(Registry::new());
    registry.apply_status(&StatusMessage {
        gateway_id: "gw1".into(),
        configs,
    });
    registry
}

fn two_sinks() -> Arc<Registry> {
    network(vec![record("s1", 100, 254), record("s2", 200, 5)])
}

fn fixture(registry: Arc<Registry>, options: DispatchOptions) -> Fixture {
    fixture_with_shutdown(registry, options, Shutdown::new())
}

fn fixture_with_shutdown(
    registry: Arc<Registry>,
    options: DispatchOptions,
    shutdown: Shutdown,
) -> Fixture {
    let (tx, rx) = bounded(64);
    let correlator = Arc::new(Correlator::new(tx, shutdown));
    let counters = Arc::new(PerformanceCounters::new());
    let handler = CommandHandler::new(
        registry,
        Arc::clone(&correlator),
        Arc::clone(&counters),
        options,
    );
    Fixture {
        handler,
        outbound: rx,
        counters,
        correlator,
    }
}

fn sent(fixture: &Fixture) -> Vec<OutboundRequest> {
    fixture.outbound.try_iter().collect()
}

#[test]
fn datatx_to_sink_address_is_unicast() {
    let f = fixture(two_sinks(), DispatchOptions::default());
    let outcome = f
        .handler
        .handle("/datatx?destination=100&source_ep=1&dest_ep=2&payload=AABB");
    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.body, "datatx ok!");

    let messages = sent(&f);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sink_id.as_deref(), Some("s1"));
    match &messages[0].payload {
        RequestPayload::SendData(data) => {
            assert_eq!(data.dest_address, 100);
            assert_eq!(data.src_ep, 1);
            assert_eq!(data.dst_ep, 2);
            assert_eq!(data.qos, 2);
            assert_eq!(data.payload, vec![0xaa, 0xbb]);
            assert!(!data.is_unack_csma_ca);
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[test]
fn datatx_to_unknown_address_reaches_every_sink() {
    let f = fixture(two_sinks(), DispatchOptions::default());
    let outcome = f
        .handler
        .handle("/datatx?destination=999&source_ep=1&dest_ep=1&payload=00&fast=yes&hoplimit=3");
    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.requests_sent, 2);

    let messages = sent(&f);
    let sinks: Vec<_> = messages.iter().filter_map(|m| m.sink_id.as_deref()).collect();
    assert_eq!(sinks, vec!["s1", "s2"]);
    for message in &messages {
        match &message.payload {
            RequestPayload::SendData(data) => {
                assert!(data.is_unack_csma_ca);
                assert_eq!(data.hop_limit, 3);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}

#[test]
fn datatx_count_repeats_per_target() {
    let f = fixture(two_sinks(), DispatchOptions::default());
    f.handler
        .handle("/datatx?destination=200&source_ep=1&dest_ep=1&payload=01&count=3");
    let messages = sent(&f);
    assert_eq!(messages.len(), 3);
    assert!(messages.iter().all(|m| m.sink_id.as_deref() == Some("s2")));
}

#[test]
fn datatx_missing_field_is_reported_even_without_sinks() {
    let f = fixture(Arc::new(Registry::new()), DispatchOptions::default());
    let outcome = f.handler.handle("/datatx?destination=1&source_ep=1&dest_ep=1");
    assert_eq!(outcome.status, 500);
    assert_eq!(outcome.body, "Missing field: payload");
    assert!(sent(&f).is_empty());
}

#[test]
fn datatx_rejects_non_integer_destination() {
    let f = fixture(two_sinks(), DispatchOptions::default());
    let outcome = f
        .handler
        .handle("/datatx?destination=abc&source_ep=1&dest_ep=1&payload=00");
    assert_eq!(outcome.status, 500);
    assert!(outcome.body.contains("destination"), "{}", outcome.body);
    assert!(sent(&f).is_empty());
}

#[test]
fn datatx_rejects_count_above_cap() {
    let f = fixture(two_sinks(), DispatchOptions::default());
    let outcome = f
        .handler
        .handle("/datatx?destination=999&source_ep=1&dest_ep=1&payload=00&count=4294967295");
    assert_eq!(outcome.status, 500);
    assert!(outcome.body.contains("count"), "{}", outcome.body);
    assert!(sent(&f).is_empty());
}

#[test]
fn empty_and_unknown_commands() {
    let f = fixture(two_sinks(), DispatchOptions::default());

    let empty = f.handler.handle("/");
    assert_eq!(empty.status, 500);
    assert_eq!(empty.body, "No command set. Try /serverinfo");

    let unknown = f.handler.handle("/reboot");
    assert_eq!(unknown.status, 500);
    assert!(unknown.body.contains("Unknown command 'reboot'"));

    assert!(sent(&f).is_empty());
}

#[test]
fn favicon_is_not_found_and_not_counted() {
    let f = fixture(two_sinks(), DispatchOptions::default());
    assert_eq!(f.handler.handle("/favicon.ico").status, 404);
    assert!(f.counters.snapshot().is_empty());
}

#[test]
fn setconfig_bumps_and_wraps_sequence() {
    let f = fixture(two_sinks(), DispatchOptions::default());
    let outcome = f.handler.handle("/setconfig");
    assert_eq!(outcome.status, 200);

    let messages = sent(&f);
    assert_eq!(messages.len(), 3);
    let updates: Vec<_> = messages
        .iter()
        .filter_map(|m| match &m.payload {
            RequestPayload::SetConfig(update) => Some((m.sink_id.clone(), update.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].0.as_deref(), Some("s1"));
    assert_eq!(updates[0].1.app_config_seq, Some(1));
    assert_eq!(updates[1].1.app_config_seq, Some(6));
    assert_eq!(updates[0].1.app_config_diag, Some(60));
    assert_eq!(updates[0].1.app_config_data, Some(vec![0x01, 0x02]));
    assert_eq!(updates[0].1.started, None);

    assert_eq!(messages[2].kind(), RequestKind::GetConfigs);
    assert_eq!(messages[2].gateway_id, "gw1");
}

#[test]
fn setconfig_explicit_values_override() {
    let f = fixture(two_sinks(), DispatchOptions::default());
    f.handler.handle("/setconfig?seq=10&diag=30&data=ff");
    for message in sent(&f) {
        if let RequestPayload::SetConfig(update) = message.payload {
            assert_eq!(update.app_config_seq, Some(10));
            assert_eq!(update.app_config_diag, Some(30));
            assert_eq!(update.app_config_data, Some(vec![0xff]));
        }
    }
}

#[test]
fn start_and_stop_toggle_every_sink_then_refresh() {
    let f = fixture(two_sinks(), DispatchOptions::default());
    assert_eq!(f.handler.handle("/stop").body, "stop ok!");
    let messages = sent(&f);
    assert_eq!(messages.len(), 3);
    for message in &messages[..2] {
        match &message.payload {
            RequestPayload::SetConfig(update) => assert_eq!(update.started, Some(false)),
            other => panic!("unexpected payload {other:?}"),
        }
    }
    assert_eq!(messages[2].kind(), RequestKind::GetConfigs);

    f.handler.handle("/start");
    let messages = sent(&f);
    assert!(matches!(
        &messages[0].payload,
        RequestPayload::SetConfig(update) if update.started == Some(true)
    ));
}

#[test]
fn ping_broadcasts_one_frame_per_sink() {
    let f = fixture(two_sinks(), DispatchOptions::default());
    assert_eq!(f.handler.handle("/ping").status, 200);
    let messages = sent(&f);
    assert_eq!(messages.len(), 2);
    for message in messages {
        match message.payload {
            RequestPayload::SendData(data) => {
                assert_eq!(data.dest_address, BROADCAST_ADDRESS);
                assert_eq!((data.src_ep, data.dst_ep), (255, 255));
                assert_eq!(data.payload, MSAP_PING_REQUEST.to_vec());
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}

#[test]
fn info_lists_sinks_and_refreshes() {
    let f = fixture(two_sinks(), DispatchOptions::default());
    let outcome = f.handler.handle("/info");
    assert_eq!(outcome.status, 200);
    assert!(outcome.body.starts_with("info ok!"));
    assert!(outcome.body.contains("sink=s1"));
    assert!(outcome.body.contains("node_address=200"));
    assert!(outcome.body.contains("app_config_data=0102"));

    let messages = sent(&f);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].kind(), RequestKind::GetConfigs);
}

#[test]
fn serverinfo_reports_and_opens_a_new_interval() {
    let f = fixture(two_sinks(), DispatchOptions::default());
    f.handler.handle("/ping");

    let report = f.handler.handle("/serverinfo");
    assert_eq!(report.status, 200);
    assert!(report.content_type.starts_with("text/html"));
    assert!(report.body.contains("Backend client HTTP API info"));
    assert!(report.body.contains("'ping' cmds"));

    let ping = f.counters.get("'ping' cmds").expect("ping counter");
    assert_eq!(ping.total_count, 1);
    assert_eq!(ping.interval_count, 0);
    let ok = f.counters.get("'ping' GW API request ok").expect("ok counter");
    assert_eq!(ok.total_count, 1);

    let serverinfo = f.counters.get("'serverinfo' cmds").expect("serverinfo counter");
    assert_eq!(serverinfo.interval_count, 1);
}

#[test]
fn closed_outbound_queue_is_a_bad_gateway() {
    let f = fixture(two_sinks(), DispatchOptions::default());
    let Fixture {
        handler,
        outbound,
        counters,
        ..
    } = f;
    drop(outbound);

    let outcome = handler.handle("/ping");
    assert_eq!(outcome.status, 502);
    assert!(outcome.body.starts_with("Bad gateway"));
    assert_eq!(outcome.requests_sent, 1);
    assert!(counters.get("'ping' GW API request fail").is_some());
    assert!(counters.get("'ping' GW API request ok").is_none());
}

#[test]
fn dry_run_sends_nothing() {
    let f = fixture(
        two_sinks(),
        DispatchOptions {
            dry_run: true,
            ..Default::default()
        },
    );
    let outcome = f.handler.handle("/start");
    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.requests_sent, 0);
    assert!(sent(&f).is_empty());
}

fn spawn_responder(f: &Fixture, result_code: u32) {
    let (resp_tx, resp_rx) = bounded(64);
    f.correlator
        .spawn_dispatcher(resp_rx)
        .expect("spawn dispatcher");
    let requests = f.outbound.clone();
    thread::spawn(move || {
        for request in requests.iter() {
            let response = GatewayResponse {
                request_id: request.request_id,
                gateway_id: request.gateway_id,
                sink_id: request.sink_id,
                result_code,
                payload: None,
            };
            if resp_tx.send(response).is_err() {
                break;
            }
        }
    });
}

fn waiting(timeout: Duration) -> DispatchOptions {
    DispatchOptions {
        wait_for_response: true,
        response_timeout: timeout,
        dry_run: false,
    }
}

#[test]
fn waits_for_successful_responses() {
    let f = fixture(two_sinks(), waiting(Duration::from_secs(5)));
    spawn_responder(&f, 0);
    let outcome = f.handler.handle("/stop");
    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.requests_sent, 3);
    assert_eq!(f.correlator.pending_count(), 0);
}

#[test]
fn gateway_error_code_fails_the_command() {
    let f = fixture(two_sinks(), waiting(Duration::from_secs(5)));
    spawn_responder(&f, 3);
    let outcome = f.handler.handle("/ping");
    assert_eq!(outcome.status, 502);
    assert!(outcome.body.contains("result code 3"), "{}", outcome.body);
    // The first failure stops the remaining data messages.
    assert_eq!(outcome.requests_sent, 1);
}

#[test]
fn missing_response_times_out_as_bad_gateway() {
    let f = fixture(
        network(vec![record("s1", 100, 0)]),
        waiting(Duration::from_millis(100)),
    );
    let outcome = f.handler.handle("/ping");
    assert_eq!(outcome.status, 502);
    assert!(outcome.body.contains("no gateway response"));
}

#[test]
fn shutdown_during_wait_is_service_unavailable() {
    let shutdown = Shutdown::new();
    let f = fixture_with_shutdown(
        two_sinks(),
        waiting(Duration::from_secs(30)),
        shutdown.clone(),
    );
    shutdown.trigger();

    let outcome = f.handler.handle("/stop");
    assert_eq!(outcome.status, 503);
    assert_eq!(outcome.body, "shutdown in progress");
    // Nothing else is attempted once shutdown is seen.
    assert_eq!(outcome.requests_sent, 1);
    assert_eq!(sent(&f).len(), 1);
}
