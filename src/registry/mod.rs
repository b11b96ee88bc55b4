// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::Serialize;
use tracing::{info, warn};

use crate::messages::{SinkConfigRecord, StatusMessage};

/// Last fully reported configuration of one sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkState {
    pub started: bool,
    pub app_config_seq: u8,
    pub app_config_diag: u16,
    #[serde(serialize_with = "serialize_hex")]
    pub app_config_data: Vec<u8>,
    pub node_address: u32,
}

impl SinkState {
    fn from_record(record: &SinkConfigRecord) -> Option<Self> {
        Some(Self {
            started: record.started?,
            app_config_seq: record.app_config_seq?,
            app_config_diag: record.app_config_diag?,
            app_config_data: record.app_config_data.clone()?,
            node_address: record.node_address?,
        })
    }
}

#[derive(Debug, Default)]
struct SinkEntry {
    state: Option<SinkState>,
    present: bool,
}

#[derive(Debug, Default)]
struct GatewayState {
    sinks: BTreeMap<String, SinkEntry>,
}

/// What a single `apply_status` call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusChanges {
    pub new_gateway: bool,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub malformed: usize,
}

/// Table of gateways and their sinks, fed by gateway status snapshots.
///
/// Only the status observer writes; readers take a [`NetworkSnapshot`].
#[derive(Debug, Default)]
pub struct Registry {
    gateways: RwLock<BTreeMap<String, GatewayState>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one gateway status snapshot into the table.
    ///
    /// Sinks missing from the snapshot are dropped. A record lacking mandatory
    /// fields keeps a previously known sink alive with its stale values; a sink
    /// never seen complete is dropped.
    pub fn apply_status(&self, status: &StatusMessage) -> StatusChanges {
        let mut changes = StatusChanges::default();
        let mut gateways = self
            .gateways
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let gateway = gateways
            .entry(status.gateway_id.clone())
            .or_insert_with(|| {
                changes.new_gateway = true;
                GatewayState::default()
            });
        if changes.new_gateway {
            info!(gateway_id = %status.gateway_id, "new gateway discovered");
        }

        for sink in gateway.sinks.values_mut() {
            sink.present = false;
        }

        for record in &status.configs {
            let Some(sink_id) = record.sink_id.as_ref() else {
                changes.malformed += 1;
                warn!(gateway_id = %status.gateway_id, "status record without sink_id ignored");
                continue;
            };

            let entry = gateway.sinks.entry(sink_id.clone()).or_default();
            match SinkState::from_record(record) {
                Some(state) => {
                    if entry.state.is_none() {
                        changes.added.push(sink_id.clone());
                        info!(
                            gateway_id = %status.gateway_id,
                            sink_id = %sink_id,
                            node_address = state.node_address,
                            "new sink discovered"
                        );
                    }
                    entry.state = Some(state);
                    entry.present = true;
                }
                None => {
                    changes.malformed += 1;
                    warn!(
                        gateway_id = %status.gateway_id,
                        sink_id = %sink_id,
                        missing = ?record.missing_fields(),
                        "mandatory fields missing from sink config"
                    );
                    entry.present = entry.state.is_some();
                }
            }
        }

        gateway.sinks.retain(|sink_id, entry| {
            if entry.present {
                return true;
            }
            // Entries created this cycle from an incomplete record were never
            // reported as discovered, so their removal is silent.
            if entry.state.is_some() {
                changes.removed.push(sink_id.clone());
                warn!(gateway_id = %status.gateway_id, sink_id = %sink_id, "sink removed");
            }
            false
        });

        changes
    }

    /// Consistent copy of every fully known sink, grouped by gateway.
    pub fn snapshot(&self) -> NetworkSnapshot {
        let gateways = self
            .gateways
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let gateways = gateways
            .iter()
            .map(|(gateway_id, gateway)| {
                let sinks = gateway
                    .sinks
                    .iter()
                    .filter_map(|(sink_id, entry)| {
                        entry.state.clone().map(|state| (sink_id.clone(), state))
                    })
                    .collect();
                (gateway_id.clone(), sinks)
            })
            .collect();
        NetworkSnapshot { gateways }
    }
}

/// Immutable view of the registry taken at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkSnapshot {
    pub gateways: BTreeMap<String, BTreeMap<String, SinkState>>,
}

/// One sink as seen through a snapshot.
#[derive(Debug, Clone, Copy)]
pub struct SinkRef<'a> {
    pub gateway_id: &'a str,
    pub sink_id: &'a str,
    pub state: &'a SinkState,
}

impl NetworkSnapshot {
    /// Every sink of every gateway, ordered by gateway then sink id.
    pub fn sinks(&self) -> impl Iterator<Item = SinkRef<'_>> {
        self.gateways.iter().flat_map(|(gateway_id, sinks)| {
            sinks.iter().map(move |(sink_id, state)| SinkRef {
                gateway_id,
                sink_id,
                state,
            })
        })
    }

    /// The sink exposing `node_address` on the mesh, if any.
    pub fn find_by_node_address(&self, node_address: u32) -> Option<SinkRef<'_>> {
        self.sinks().find(|s| s.state.node_address == node_address)
    }

    pub fn sink(&self, gateway_id: &str, sink_id: &str) -> Option<&SinkState> {
        self.gateways.get(gateway_id)?.get(sink_id)
    }

    pub fn gateway_count(&self) -> usize {
        self.gateways.len()
    }

    pub fn sink_count(&self) -> usize {
        self.gateways.values().map(|s| s.len()).sum()
    }
}

fn serialize_hex<S: serde::Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}
