use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{BrokerId, ClusterName};

/// The single message shape exchanged between peers over the router.
/// A request carries `m`;
/// `seq` is present on ask-style requests and on all responses; `wid` names
/// the target worker and is absent on broker-to-broker RPC; `pl` is the
/// method-specific payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub m: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub wid: Option<String>,
    pub pl: Value,
}

impl Envelope {
    pub fn request(method: impl Into<String>, seq: Option<u64>, wid: Option<String>, pl: Value) -> Self {
        Self {
            m: Some(method.into()),
            seq,
            wid,
            pl,
        }
    }

    pub fn response(seq: u64, pl: ResponsePayload) -> Self {
        Self {
            m: None,
            seq: Some(seq),
            wid: None,
            pl: serde_json::to_value(pl).expect("ResponsePayload always serializes"),
        }
    }

    pub fn is_tell(&self) -> bool {
        self.seq.is_none()
    }
}

/// The body of a response envelope: `{res}` on success, `{err:{name,
/// message}}` on failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    Ok { res: Value },
    Err { err: RemoteError },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteError {
    pub name: String,
    pub message: String,
}

/// Body of the `onCreateWorker` broker-to-broker RPC.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateWorkerRequest {
    pub name: String,
    pub id: Option<String>,
    pub attributes: crate::records::WorkerAttributes,
    #[serde(rename = "static")]
    pub is_static: bool,
    pub cause: crate::records::CreateCause,
}

/// Control-plane signal carried on the broadcast pubsub channel.
/// Tagged by `sig`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "sig", rename_all = "lowercase")]
pub enum Signal {
    Recover,
    Salvage {
        clustername: ClusterName,
        #[serde(rename = "brokerId")]
        broker_id: BrokerId,
    },
    Restart,
}

impl Signal {
    /// An empty payload is a liveness probe, not a signal, and must be
    /// filtered out before reaching `Signal::decode`.
    pub fn decode(payload: &[u8]) -> Option<Signal> {
        if payload.is_empty() {
            return None;
        }
        serde_json::from_slice(payload).ok()
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Signal always serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_is_not_a_signal() {
        assert_eq!(Signal::decode(b""), None);
    }

    #[test]
    fn salvage_round_trips() {
        let sig = Signal::Salvage {
            clustername: ClusterName::new("pvp"),
            broker_id: BrokerId::new("br02"),
        };
        let bytes = sig.encode();
        assert_eq!(Signal::decode(&bytes), Some(sig));
    }

    #[test]
    fn unknown_signal_fails_to_decode() {
        assert_eq!(Signal::decode(br#"{"sig":"frobnicate"}"#), None);
    }
}
