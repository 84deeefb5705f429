//! Version 1 of the distribution message set.
//!
//! These are the messages exchanged between an orchestrator and its workers:
//! attachment, pip dispatch, result streaming, execution-log streaming,
//! heartbeats, and orderly exit. Messages are encoded with MessagePack
//! (see [`encode`]/[`decode`]); MessagePack field tags are stable under
//! field addition, which is what keeps the format backward compatible.
//!
//! ## Sequence numbers
//!
//! Every streamed message carries a per-worker monotonically increasing
//! sequence number. Receivers drop duplicates, which makes resubmission after
//! a partial ingestion failure idempotent: the sender retries with the same
//! sequence numbers and the receiver keeps exactly one copy.

use std::collections::BTreeMap;

use bon::Builder;
use color_eyre::{Result, eyre::Context};
use derive_more::Display;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::ContentHash;

/// Encode a message for the wire.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(message).context("encode message")
}

/// Decode a message from the wire.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).context("decode message")
}

/// Identifies an attached worker within one build session.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
#[display("worker{_0}")]
pub struct WorkerId(pub u32);

/// A URI identifying a peer content-store endpoint.
///
/// The invalid location is representable on purpose: location records learned
/// from remote directories can reference machines that no longer resolve, and
/// we want to carry them (and count them) rather than fail parsing.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
#[display("{_0}")]
pub struct MachineLocation(String);

impl MachineLocation {
    /// The distinguished invalid location.
    pub const INVALID: &'static str = "invalid://";

    /// Create a location from a URI string.
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    /// Create the invalid location.
    pub fn invalid() -> Self {
        Self(Self::INVALID.to_string())
    }

    /// Whether this location is the invalid location.
    pub fn is_invalid(&self) -> bool {
        self.0 == Self::INVALID
    }

    /// View the location as a URI string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Worker → orchestrator: advertise availability.
#[derive(Clone, Debug, Serialize, Deserialize, Builder)]
pub struct Hello {
    /// Where the worker's own services (content store, pip execution) live.
    pub worker_location: MachineLocation,
    /// The id the worker held in a previous attachment, if it is rejoining.
    pub requested_id: Option<WorkerId>,
}

/// Orchestrator → worker: response to [`Hello`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum HelloResponse {
    /// The worker is admitted under this id; an [`Attach`] payload follows.
    Accepted(WorkerId),
    /// The orchestrator has no capacity for more workers.
    NoSlots,
    /// The worker was previously attached and has been released; it should
    /// not retry this build.
    Released,
}

/// Orchestrator → worker: build-session context delivered on attach.
#[derive(Clone, Debug, Serialize, Deserialize, Builder)]
pub struct Attach {
    /// Build session identifier; all descriptors published by this worker
    /// carry it.
    pub session_id: Uuid,
    /// Content hash of the serialized pip graph the orchestrator is driving.
    pub cache_graph: ContentHash,
    /// Salt mixed into every weak fingerprint this session.
    pub fingerprint_salt: String,
    /// Environment variables the worker must present to sandboxed processes.
    #[builder(default)]
    pub env_vars: BTreeMap<String, String>,
    /// Per-pip property overrides, keyed by semi-stable pip hash.
    #[builder(default)]
    pub pip_property_overrides: BTreeMap<u64, BTreeMap<String, String>>,
}

/// Worker → orchestrator: attachment finished; capacity facts.
#[derive(Clone, Debug, Serialize, Deserialize, Builder)]
pub struct AttachCompleted {
    pub worker_id: WorkerId,
    /// Maximum concurrent pips per dispatcher kind, keyed by kind name.
    pub capacity: BTreeMap<String, u32>,
    /// Total machine RAM in megabytes.
    pub total_ram_mb: u64,
    /// RAM available to pip execution in megabytes.
    pub available_ram_mb: u64,
}

/// How a declared file artifact should be interpreted on the worker.
///
/// `directory_members` is present only for sealed-directory artifacts whose
/// membership the worker needs for enumeration fingerprints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct ArtifactManifestEntry {
    /// Canonical absolute path on the orchestrator, pre-translation.
    pub path: String,
    /// Zero for sources; positive for outputs of upstream pips.
    pub rewrite_count: u32,
    pub hash: ContentHash,
    /// Length in bytes of the artifact content.
    pub length: u64,
    /// Whether the artifact is a reparse point (symlink/junction) and what it
    /// points at.
    pub reparse_target: Option<String>,
    /// Member file names for sealed directories.
    pub directory_members: Option<Vec<String>>,
}

/// One pip the orchestrator wants the worker to run.
#[derive(Clone, Debug, Serialize, Deserialize, Builder)]
pub struct SinglePipBuildRequest {
    /// Dense pip id in the orchestrator's graph.
    pub pip_id: u32,
    /// Stable-across-runs pip identity, for logs and overrides.
    pub semi_stable_hash: u64,
    /// Scheduling priority on the worker's dispatcher.
    pub priority: u32,
    /// Expected-peak resource weight for admission control.
    pub weight: u32,
    /// The serialized pip payload; the worker deserializes this against the
    /// graph it received at attach.
    pub payload: Vec<u8>,
}

/// Orchestrator → worker: a batch of pips plus the artifact facts they need.
#[derive(Clone, Debug, Serialize, Deserialize, Builder)]
pub struct ExecutePips {
    /// Monotonically increasing per-worker batch sequence.
    pub sequence: u64,
    pub requests: Vec<SinglePipBuildRequest>,
    #[builder(default)]
    pub artifacts: Vec<ArtifactManifestEntry>,
}

/// Wall-clock timings observed for one pip on the worker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipTimings {
    pub queued_ms: u64,
    pub running_ms: u64,
    pub total_ms: u64,
}

/// A log event forwarded from the worker alongside a pip result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedEvent {
    pub level: String,
    pub message: String,
}

/// The result of one pip execution on a worker.
#[derive(Clone, Debug, Serialize, Deserialize, Builder)]
pub struct PipResult {
    pub pip_id: u32,
    /// Serialized execution outcome; the orchestrator deserializes this into
    /// its own result type.
    pub result_blob: Vec<u8>,
    pub timings: PipTimings,
    #[builder(default)]
    pub forwarded_events: Vec<ForwardedEvent>,
}

/// Worker → orchestrator: completed pips.
#[derive(Clone, Debug, Serialize, Deserialize, Builder)]
pub struct ReportPipResults {
    pub worker_id: WorkerId,
    /// Monotonically increasing per-worker result sequence.
    pub sequence: u64,
    pub results: Vec<PipResult>,
}

/// Worker → orchestrator: an opaque execution-log blob.
///
/// Blobs are keyed by sequence number so the orchestrator can reassemble the
/// worker's log in order even when batches arrive out of order.
#[derive(Clone, Debug, Serialize, Deserialize, Builder)]
pub struct ReportExecutionLog {
    pub worker_id: WorkerId,
    pub sequence: u64,
    pub blob: Vec<u8>,
}

/// A point-in-time performance snapshot for heartbeats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PerfSnapshot {
    /// Whole-machine CPU utilization, 0–100.
    pub machine_cpu_percent: f32,
    /// Whole-machine RAM in use, megabytes.
    pub machine_ram_mb: u64,
    /// Engine-process CPU utilization, 0–100.
    pub engine_cpu_percent: f32,
    /// Engine-process RAM in use, megabytes.
    pub engine_ram_mb: u64,
}

/// Worker → orchestrator: liveness plus perf facts.
#[derive(Clone, Debug, Serialize, Deserialize, Builder)]
pub struct Heartbeat {
    pub worker_id: WorkerId,
    pub perf: PerfSnapshot,
}

/// Orchestrator → worker: orderly shutdown.
#[derive(Clone, Debug, Serialize, Deserialize, Builder)]
pub struct Exit {
    /// Present when the orchestrator is terminating the worker because the
    /// build failed; the worker includes it in its final log.
    pub failure: Option<String>,
}

/// Worker → orchestrator: final tallies returned from [`Exit`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounts {
    pub executed: u64,
    pub cache_hits: u64,
    pub errors: u64,
    pub warnings: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn execute_pips_round_trip() {
        let message = ExecutePips::builder()
            .sequence(7)
            .requests(vec![
                SinglePipBuildRequest::builder()
                    .pip_id(3)
                    .semi_stable_hash(0xfeed)
                    .priority(10)
                    .weight(1)
                    .payload(vec![1, 2, 3])
                    .build(),
            ])
            .artifacts(vec![
                ArtifactManifestEntry::builder()
                    .path("/src/a".to_string())
                    .rewrite_count(0)
                    .hash(ContentHash::from_buffer(b"A"))
                    .length(1)
                    .build(),
            ])
            .build();

        let bytes = encode(&message).unwrap();
        let decoded: ExecutePips = decode(&bytes).unwrap();
        pretty_assert_eq!(decoded.sequence, 7);
        pretty_assert_eq!(decoded.requests.len(), 1);
        pretty_assert_eq!(decoded.requests[0].pip_id, 3);
        pretty_assert_eq!(decoded.artifacts, message.artifacts);
    }

    #[test]
    fn decode_tolerates_added_fields() {
        // A v1 receiver must parse messages from senders that have grown
        // extra fields, since map-named encoding keys by field name.
        #[derive(Serialize)]
        struct HeartbeatV2 {
            worker_id: WorkerId,
            perf: PerfSnapshot,
            extra: String,
        }

        let newer = HeartbeatV2 {
            worker_id: WorkerId(4),
            perf: PerfSnapshot::default(),
            extra: "ignored".into(),
        };
        let bytes = encode(&newer).unwrap();
        let decoded: Heartbeat = decode(&bytes).unwrap();
        pretty_assert_eq!(decoded.worker_id, WorkerId(4));
    }

    #[test]
    fn invalid_location_is_representable() {
        let loc = MachineLocation::invalid();
        assert!(loc.is_invalid());
        let parsed: MachineLocation = decode(&encode(&loc).unwrap()).unwrap();
        pretty_assert_eq!(parsed, loc);
    }
}
