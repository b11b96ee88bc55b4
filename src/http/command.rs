// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! HTTP command dispatch.
//!
//! A request target such as `/datatx?destination=100&source_ep=1&...` is
//! turned into zero or more gateway requests built against a snapshot of the
//! registry, handed to the correlator, and summarized in one
//! [`CommandOutcome`]. Command execution is serialized by a process-wide lock
//! so registry reads, message construction and sending never interleave
//! between requests.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};
use url::Url;

use crate::correlator::{Correlator, WaitOutcome};
use crate::error::{BridgeError, Result};
use crate::messages::{
    OutboundRequest, SendData, SinkConfigUpdate, BROADCAST_ADDRESS, DIAGNOSTIC_CONTROL_EP,
    DIAGNOSTIC_SOURCE_EP, MSAP_PING_REQUEST, QOS_EXACTLY_ONCE,
};
use crate::metrics::PerformanceCounters;
use crate::registry::{NetworkSnapshot, Registry, SinkRef};

use super::map_error;

pub const STATUS_OK: u16 = 200;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_UNKNOWN_COMMAND: u16 = 500;
pub const STATUS_BAD_GATEWAY: u16 = 502;

const MAX_APP_CONFIG_SEQ: u8 = 254;
/// Upper bound on `datatx` repetitions per target sink.
pub const MAX_DATATX_COUNT: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    DataTx,
    Start,
    Stop,
    SetConfig,
    Info,
    Ping,
    ServerInfo,
}

impl Command {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "datatx" => Some(Command::DataTx),
            "start" => Some(Command::Start),
            "stop" => Some(Command::Stop),
            "setconfig" => Some(Command::SetConfig),
            "info" => Some(Command::Info),
            "ping" => Some(Command::Ping),
            "serverinfo" => Some(Command::ServerInfo),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::DataTx => "datatx",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::SetConfig => "setconfig",
            Command::Info => "info",
            Command::Ping => "ping",
            Command::ServerInfo => "serverinfo",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Block on the gateway's answer for every sent request.
    pub wait_for_response: bool,
    pub response_timeout: Duration,
    /// Build requests but never hand them to the publisher.
    pub dry_run: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            wait_for_response: false,
            response_timeout: Duration::from_secs(30),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub status: u16,
    pub body: String,
    pub content_type: &'static str,
    pub requests_sent: usize,
}

impl CommandOutcome {
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            content_type: "text/plain; charset=utf-8",
            requests_sent: 0,
        }
    }

    pub fn html(status: u16, body: impl Into<String>) -> Self {
        Self {
            content_type: "text/html; charset=utf-8",
            ..Self::text(status, body)
        }
    }
}

/// `datatx` parameters, validated before any sink is visited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTxParams {
    pub destination: u32,
    pub source_ep: u8,
    pub dest_ep: u8,
    pub payload: Vec<u8>,
    pub fast: bool,
    pub hop_limit: u8,
    pub count: u32,
}

impl DataTxParams {
    pub fn parse(params: &HashMap<String, String>) -> Result<Self> {
        let parsed = Self {
            destination: required(params, "destination")?,
            source_ep: required(params, "source_ep")?,
            dest_ep: required(params, "dest_ep")?,
            payload: hex_param(params, "payload")?
                .ok_or_else(|| BridgeError::MissingField("payload".into()))?,
            fast: params
                .get("fast")
                .map(|v| matches!(v.as_str(), "true" | "1" | "yes" | "y"))
                .unwrap_or(false),
            hop_limit: optional(params, "hoplimit")?.unwrap_or(0),
            count: optional(params, "count")?.unwrap_or(1),
        };
        if parsed.count > MAX_DATATX_COUNT {
            return Err(BridgeError::invalid("count", &parsed.count.to_string()));
        }
        Ok(parsed)
    }
}

/// `setconfig` overrides; unset fields keep the sink's current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetConfigParams {
    pub seq: Option<u8>,
    pub diag: Option<u16>,
    pub data: Option<Vec<u8>>,
}

impl SetConfigParams {
    pub fn parse(params: &HashMap<String, String>) -> Result<Self> {
        let seq: Option<u8> = optional(params, "seq")?;
        if let Some(seq) = seq {
            if seq > MAX_APP_CONFIG_SEQ {
                return Err(BridgeError::invalid("seq", &seq.to_string()));
            }
        }
        Ok(Self {
            seq,
            diag: optional(params, "diag")?,
            data: hex_param(params, "data")?,
        })
    }
}

/// Sequence number following `current`; wraps from 254 back to 1.
pub fn next_app_config_seq(current: u8) -> u8 {
    if current >= MAX_APP_CONFIG_SEQ {
        1
    } else {
        current + 1
    }
}

#[derive(Default)]
struct Plan {
    messages: Vec<OutboundRequest>,
    refresh: BTreeSet<String>,
    report: Vec<String>,
}

pub struct CommandHandler {
    registry: Arc<Registry>,
    correlator: Arc<Correlator>,
    counters: Arc<PerformanceCounters>,
    options: DispatchOptions,
    request_lock: Mutex<()>,
}

impl CommandHandler {
    pub fn new(
        registry: Arc<Registry>,
        correlator: Arc<Correlator>,
        counters: Arc<PerformanceCounters>,
        options: DispatchOptions,
    ) -> Self {
        Self {
            registry,
            correlator,
            counters,
            options,
            request_lock: Mutex::new(()),
        }
    }

    pub fn counters(&self) -> &Arc<PerformanceCounters> {
        &self.counters
    }

    /// Execute the command named by the first path segment of `url`.
    pub fn handle(&self, url: &str) -> CommandOutcome {
        let _serialized = self
            .request_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let start = Instant::now();

        let (name, params) = split_target(url);
        if name == "favicon.ico" {
            return CommandOutcome::text(STATUS_NOT_FOUND, "Not found");
        }
        debug!(url, command = %name, ?params, "HTTP command received");

        let command = Command::parse(&name);
        let outcome = match self.dispatch(&name, command, &params) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(url, command = %name, error = %err, "HTTP command failed");
                let (status, body) = map_error(&err);
                CommandOutcome::text(status, body)
            }
        };

        // Recorded last so that serverinfo lands in the interval it just opened.
        if let Some(command) = command {
            self.counters.increment(&format!("'{}' cmds", command.name()));
            self.counters.record_duration(
                &format!("'{}' api call duration", command.name()),
                start.elapsed(),
            );
        }
        debug!(
            command = %name,
            status = outcome.status,
            requests_sent = outcome.requests_sent,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "HTTP command done"
        );
        outcome
    }

    fn dispatch(
        &self,
        name: &str,
        command: Option<Command>,
        params: &HashMap<String, String>,
    ) -> Result<CommandOutcome> {
        if name.is_empty() {
            return Err(BridgeError::NoCommand);
        }
        let command = command.ok_or_else(|| BridgeError::UnknownCommand(name.to_string()))?;
        if command == Command::ServerInfo {
            return Ok(self.server_info());
        }

        let snapshot = self.registry.snapshot();
        let mut plan = Plan::default();
        match command {
            Command::DataTx => {
                let params = DataTxParams::parse(params)?;
                self.plan_datatx(&snapshot, &params, &mut plan);
            }
            Command::Start => self.plan_set_started(&snapshot, true, &mut plan),
            Command::Stop => self.plan_set_started(&snapshot, false, &mut plan),
            Command::SetConfig => {
                let params = SetConfigParams::parse(params)?;
                self.plan_setconfig(&snapshot, &params, &mut plan);
            }
            Command::Info => self.plan_info(&snapshot, &mut plan),
            Command::Ping => self.plan_ping(&snapshot, &mut plan),
            Command::ServerInfo => {}
        }

        let config_messages: Vec<OutboundRequest> = plan
            .refresh
            .iter()
            .map(|gateway_id| {
                OutboundRequest::get_configs(self.correlator.next_request_id(), gateway_id)
            })
            .collect();

        let mut body = format!("{} ok!", command.name());
        for line in &plan.report {
            body.push('\n');
            body.push_str(line);
        }
        let mut outcome = CommandOutcome::text(STATUS_OK, body);

        let (sent, failure) = self.send_messages(plan.messages, config_messages);
        outcome.requests_sent = sent;
        if sent > 0 {
            match failure {
                None => {
                    self.counters
                        .increment(&format!("'{}' GW API request ok", command.name()));
                }
                Some(err) => {
                    self.counters
                        .increment(&format!("'{}' GW API request fail", command.name()));
                    let (status, body) = map_error(&err);
                    outcome.status = status;
                    outcome.body = if status == STATUS_BAD_GATEWAY {
                        format!("Bad gateway: {body}")
                    } else {
                        body
                    };
                }
            }
        }
        Ok(outcome)
    }

    fn server_info(&self) -> CommandOutcome {
        let body = self.counters.report();
        self.counters.reset_intervals();
        CommandOutcome::html(STATUS_OK, body)
    }

    fn plan_datatx(&self, snapshot: &NetworkSnapshot, params: &DataTxParams, plan: &mut Plan) {
        // A destination owned by a known sink goes to that sink alone; anything
        // else is flooded to every sink and left to mesh routing.
        let targets: Vec<SinkRef<'_>> = match snapshot.find_by_node_address(params.destination) {
            Some(sink) => {
                debug!(node_address = params.destination, "destination is a sink address");
                vec![sink]
            }
            None => snapshot.sinks().collect(),
        };

        for sink in targets {
            for _ in 0..params.count {
                plan.messages.push(OutboundRequest::send_data(
                    self.correlator.next_request_id(),
                    sink.gateway_id,
                    sink.sink_id,
                    SendData {
                        dest_address: params.destination,
                        src_ep: params.source_ep,
                        dst_ep: params.dest_ep,
                        qos: QOS_EXACTLY_ONCE,
                        payload: params.payload.clone(),
                        is_unack_csma_ca: params.fast,
                        hop_limit: params.hop_limit,
                    },
                ));
            }
        }
    }

    fn plan_set_started(&self, snapshot: &NetworkSnapshot, started: bool, plan: &mut Plan) {
        for sink in snapshot.sinks() {
            plan.messages.push(OutboundRequest::set_config(
                self.correlator.next_request_id(),
                sink.gateway_id,
                sink.sink_id,
                SinkConfigUpdate {
                    started: Some(started),
                    ..Default::default()
                },
            ));
            plan.refresh.insert(sink.gateway_id.to_string());
        }
    }

    fn plan_setconfig(&self, snapshot: &NetworkSnapshot, params: &SetConfigParams, plan: &mut Plan) {
        for sink in snapshot.sinks() {
            let update = SinkConfigUpdate {
                started: None,
                app_config_seq: Some(
                    params
                        .seq
                        .unwrap_or_else(|| next_app_config_seq(sink.state.app_config_seq)),
                ),
                app_config_diag: Some(params.diag.unwrap_or(sink.state.app_config_diag)),
                app_config_data: Some(
                    params
                        .data
                        .clone()
                        .unwrap_or_else(|| sink.state.app_config_data.clone()),
                ),
            };
            plan.messages.push(OutboundRequest::set_config(
                self.correlator.next_request_id(),
                sink.gateway_id,
                sink.sink_id,
                update,
            ));
            plan.refresh.insert(sink.gateway_id.to_string());
        }
    }

    fn plan_info(&self, snapshot: &NetworkSnapshot, plan: &mut Plan) {
        for sink in snapshot.sinks() {
            plan.report.push(format!(
                "gateway={} sink={} started={} app_config_seq={} app_config_diag={} \
                 app_config_data={} node_address={}",
                sink.gateway_id,
                sink.sink_id,
                sink.state.started,
                sink.state.app_config_seq,
                sink.state.app_config_diag,
                hex::encode(&sink.state.app_config_data),
                sink.state.node_address,
            ));
            plan.refresh.insert(sink.gateway_id.to_string());
        }
    }

    fn plan_ping(&self, snapshot: &NetworkSnapshot, plan: &mut Plan) {
        for sink in snapshot.sinks() {
            plan.messages.push(OutboundRequest::send_data(
                self.correlator.next_request_id(),
                sink.gateway_id,
                sink.sink_id,
                SendData {
                    dest_address: BROADCAST_ADDRESS,
                    src_ep: DIAGNOSTIC_SOURCE_EP,
                    dst_ep: DIAGNOSTIC_CONTROL_EP,
                    qos: QOS_EXACTLY_ONCE,
                    payload: MSAP_PING_REQUEST.to_vec(),
                    is_unack_csma_ca: false,
                    hop_limit: 0,
                },
            ));
        }
    }

    /// Send data messages then refresh requests. Returns how many sends were
    /// attempted and the first failure, if any. A failed data message stops
    /// the remaining data messages but refresh requests are still attempted.
    fn send_messages(
        &self,
        messages: Vec<OutboundRequest>,
        config_messages: Vec<OutboundRequest>,
    ) -> (usize, Option<BridgeError>) {
        if self.options.dry_run {
            warn!(
                messages = messages.len() + config_messages.len(),
                "dry run: not sending gateway requests"
            );
            return (0, None);
        }

        let mut attempted = 0;
        let mut failure = None;
        for batch in [messages, config_messages] {
            for message in batch {
                attempted += 1;
                if let Err(err) = self.deliver(message) {
                    error!(error = %err, "gateway request failed");
                    if matches!(err, BridgeError::ShuttingDown) {
                        return (attempted, Some(err));
                    }
                    if failure.is_none() {
                        failure = Some(err);
                    }
                    break;
                }
            }
        }
        (attempted, failure)
    }

    fn deliver(&self, message: OutboundRequest) -> Result<()> {
        debug!(
            request_id = message.request_id,
            gateway_id = %message.gateway_id,
            sink_id = ?message.sink_id,
            kind = message.kind().as_str(),
            "sending gateway request"
        );
        if !self.options.wait_for_response {
            return self.correlator.submit(message);
        }
        match self
            .correlator
            .send_and_wait(message, self.options.response_timeout, true)?
        {
            WaitOutcome::Answered(response) if response.is_ok() => Ok(()),
            WaitOutcome::Answered(response) => Err(BridgeError::Downstream(format!(
                "gateway {} answered request {} with result code {}",
                response.gateway_id, response.request_id, response.result_code
            ))),
            WaitOutcome::NoResponse { waited } => Err(BridgeError::Downstream(format!(
                "no gateway response after {:.0}s",
                waited.as_secs_f64()
            ))),
            WaitOutcome::NotAwaited => Ok(()),
        }
    }
}

/// Split `/command/...?k=v&...` into the command name and its query parameters.
pub fn split_target(target: &str) -> (String, HashMap<String, String>) {
    let Ok(url) = Url::parse(&format!("http://localhost{target}")) else {
        return (String::new(), HashMap::new());
    };
    let name = url
        .path_segments()
        .and_then(|mut segments| segments.next())
        .unwrap_or("")
        .to_string();
    let params = url::form_urlencoded::parse(url.query().unwrap_or("").as_bytes())
        .into_owned()
        .collect();
    (name, params)
}

fn required<T: FromStr>(params: &HashMap<String, String>, key: &str) -> Result<T> {
    optional(params, key)?.ok_or_else(|| BridgeError::MissingField(key.to_string()))
}

fn optional<T: FromStr>(params: &HashMap<String, String>, key: &str) -> Result<Option<T>> {
    params
        .get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| BridgeError::invalid(key, raw))
        })
        .transpose()
}

fn hex_param(params: &HashMap<String, String>, key: &str) -> Result<Option<Vec<u8>>> {
    params
        .get(key)
        .map(|raw| hex::decode(raw.trim()).map_err(|_| BridgeError::invalid(key, raw)))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn split_target_extracts_command_and_query() {
        let (name, query) = split_target("/datatx?destination=100&payload=AA");
        assert_eq!(name, "datatx");
        assert_eq!(query.get("destination").map(String::as_str), Some("100"));
        assert_eq!(split_target("/").0, "");
        assert_eq!(split_target("/info/extra").0, "info");
    }

    #[test]
    fn seq_wraps_at_254() {
        assert_eq!(next_app_config_seq(0), 1);
        assert_eq!(next_app_config_seq(253), 254);
        assert_eq!(next_app_config_seq(254), 1);
    }

    #[test]
    fn datatx_defaults() {
        let p = DataTxParams::parse(&params(&[
            ("destination", "100"),
            ("source_ep", "1"),
            ("dest_ep", "2"),
            ("payload", "AA"),
        ]))
        .expect("parse");
        assert_eq!(p.payload, vec![0xaa]);
        assert!(!p.fast);
        assert_eq!(p.hop_limit, 0);
        assert_eq!(p.count, 1);
    }

    #[test]
    fn datatx_reports_first_missing_field() {
        let err = DataTxParams::parse(&params(&[("source_ep", "1")])).expect_err("missing");
        assert_eq!(err.to_string(), "Missing field: destination");
    }

    #[test]
    fn datatx_rejects_non_integer_destination() {
        let err = DataTxParams::parse(&params(&[
            ("destination", "abc"),
            ("source_ep", "1"),
            ("dest_ep", "2"),
            ("payload", "AA"),
        ]))
        .expect_err("invalid");
        assert!(matches!(err, BridgeError::InvalidParam { ref field, .. } if field == "destination"));
    }

    #[test]
    fn datatx_count_is_capped() {
        let base = [
            ("destination", "1"),
            ("source_ep", "1"),
            ("dest_ep", "1"),
            ("payload", "00"),
        ];
        let mut at_cap = params(&base);
        at_cap.insert("count".into(), MAX_DATATX_COUNT.to_string());
        assert_eq!(DataTxParams::parse(&at_cap).expect("parse").count, MAX_DATATX_COUNT);

        let mut huge = params(&base);
        huge.insert("count".into(), "4294967295".into());
        let err = DataTxParams::parse(&huge).expect_err("count above cap");
        assert!(matches!(err, BridgeError::InvalidParam { ref field, .. } if field == "count"));
    }

    #[test]
    fn fast_accepts_truthy_words() {
        for word in ["true", "1", "yes", "y"] {
            let p = DataTxParams::parse(&params(&[
                ("destination", "1"),
                ("source_ep", "1"),
                ("dest_ep", "1"),
                ("payload", ""),
                ("fast", word),
            ]))
            .expect("parse");
            assert!(p.fast, "{word} should enable fast mode");
        }
    }

    #[test]
    fn setconfig_rejects_seq_255() {
        assert!(SetConfigParams::parse(&params(&[("seq", "255")])).is_err());
        assert!(SetConfigParams::parse(&params(&[("data", "xyz")])).is_err());
        let p = SetConfigParams::parse(&params(&[("diag", "30"), ("data", "0102")]))
            .expect("parse");
        assert_eq!(p.seq, None);
        assert_eq!(p.diag, Some(30));
        assert_eq!(p.data, Some(vec![1, 2]));
    }
}
