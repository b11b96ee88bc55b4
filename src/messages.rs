// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! Typed messages exchanged with the gateway MQTT collaborator.
//!
//! Outbound requests are built by the HTTP command dispatcher and consumed by
//! the publisher; inbound status snapshots and request responses arrive on a
//! single channel and are split by [`crate::events::InboundRouter`]. Byte
//! fields travel as lowercase hex strings in the JSON form.

use serde::{Deserialize, Serialize};

/// Mesh address that reaches every node in the network.
pub const BROADCAST_ADDRESS: u32 = 0xFFFF_FFFF;
/// Endpoint used as source for diagnostic requests issued by this bridge.
pub const DIAGNOSTIC_SOURCE_EP: u8 = 255;
/// Endpoint reserved for diagnostic control on every node.
pub const DIAGNOSTIC_CONTROL_EP: u8 = 255;
/// MQTT "exactly once" quality of service.
pub const QOS_EXACTLY_ONCE: u8 = 2;
/// MSAP ping request frame: message type followed by an empty body.
pub const MSAP_PING_REQUEST: [u8; 2] = [0x0C, 0x00];
/// Gateway result code signalling success.
pub const RESULT_OK: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    SendData,
    SetConfig,
    GetConfigs,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::SendData => "send_data",
            RequestKind::SetConfig => "set_config",
            RequestKind::GetConfigs => "get_configs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendData {
    pub dest_address: u32,
    pub src_ep: u8,
    pub dst_ep: u8,
    pub qos: u8,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub is_unack_csma_ca: bool,
    #[serde(default)]
    pub hop_limit: u8,
}

/// Partial sink configuration; only the fields that are set are changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_config_seq: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_config_diag: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex_bytes_opt")]
    pub app_config_data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestPayload {
    SendData(SendData),
    SetConfig(SinkConfigUpdate),
    GetConfigs,
}

/// Request envelope handed to the MQTT publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub request_id: u64,
    pub gateway_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink_id: Option<String>,
    pub payload: RequestPayload,
}

impl OutboundRequest {
    pub fn send_data(request_id: u64, gateway_id: &str, sink_id: &str, data: SendData) -> Self {
        Self {
            request_id,
            gateway_id: gateway_id.to_string(),
            sink_id: Some(sink_id.to_string()),
            payload: RequestPayload::SendData(data),
        }
    }

    pub fn set_config(
        request_id: u64,
        gateway_id: &str,
        sink_id: &str,
        update: SinkConfigUpdate,
    ) -> Self {
        Self {
            request_id,
            gateway_id: gateway_id.to_string(),
            sink_id: Some(sink_id.to_string()),
            payload: RequestPayload::SetConfig(update),
        }
    }

    pub fn get_configs(request_id: u64, gateway_id: &str) -> Self {
        Self {
            request_id,
            gateway_id: gateway_id.to_string(),
            sink_id: None,
            payload: RequestPayload::GetConfigs,
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self.payload {
            RequestPayload::SendData(_) => RequestKind::SendData,
            RequestPayload::SetConfig(_) => RequestKind::SetConfig,
            RequestPayload::GetConfigs => RequestKind::GetConfigs,
        }
    }
}

/// One sink entry of a gateway status snapshot. Every field may be absent.
///
/// Fields decode leniently: a value of the wrong type or bad hex becomes
/// `None`, so one broken record never rejects the rest of the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkConfigRecord {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient::value")]
    pub sink_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient::value")]
    pub started: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient::value")]
    pub app_config_seq: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient::value")]
    pub app_config_diag: Option<u16>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "hex_bytes_opt::serialize",
        deserialize_with = "lenient::hex"
    )]
    pub app_config_data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient::value")]
    pub node_address: Option<u32>,
}

impl SinkConfigRecord {
    /// Names of the mandatory configuration fields this record lacks.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.started.is_none() {
            missing.push("started");
        }
        if self.app_config_seq.is_none() {
            missing.push("app_config_seq");
        }
        if self.app_config_diag.is_none() {
            missing.push("app_config_diag");
        }
        if self.app_config_data.is_none() {
            missing.push("app_config_data");
        }
        if self.node_address.is_none() {
            missing.push("node_address");
        }
        missing
    }
}

/// Periodic snapshot of every sink a gateway currently exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub gateway_id: String,
    #[serde(default, deserialize_with = "lenient::records")]
    pub configs: Vec<SinkConfigRecord>,
}

/// Gateway acknowledgement of a previously sent request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub request_id: u64,
    #[serde(default)]
    pub gateway_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink_id: Option<String>,
    pub result_code: u32,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex_bytes_opt")]
    pub payload: Option<Vec<u8>>,
}

impl GatewayResponse {
    pub fn is_ok(&self) -> bool {
        self.result_code == RESULT_OK
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Status(StatusMessage),
    Response(GatewayResponse),
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw).map_err(serde::de::Error::custom)
    }
}

mod hex_bytes_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&hex::encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) => hex::decode(raw).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

mod lenient {
    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    use super::SinkConfigRecord;

    pub fn value<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        let raw = Value::deserialize(deserializer)?;
        Ok(serde_json::from_value(raw).ok())
    }

    pub fn hex<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(raw) => hex::decode(raw).ok(),
            _ => None,
        })
    }

    /// A non-object entry becomes an empty record, reported later as malformed.
    pub fn records<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<SinkConfigRecord>, D::Error> {
        let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
        Ok(raw
            .into_iter()
            .map(|entry| serde_json::from_value(entry).unwrap_or_default())
            .collect())
    }
}
