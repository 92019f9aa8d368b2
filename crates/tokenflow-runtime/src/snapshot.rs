use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokenflow_engine::{KernelState, SimulationKernel};
use uuid::Uuid;

/// A point-in-time capture of the full kernel state, hashed for
/// determinism checks. Restoring the state and continuing produces the
/// same bytes as the original run did from the same tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Snapshot {
    pub id: Uuid,
    pub sim_time: u64,
    /// Wall-clock capture time; informational only.
    pub taken_at_ms: i64,
    /// How many core events of the recording had been applied when this
    /// snapshot was taken. Replay resumes from exactly this point.
    pub events_applied: usize,
    pub log_length: usize,
    /// Hex sha256 of the canonical JSON encoding of `state`.
    pub state_hash: String,
    pub state: KernelState,
}

impl Snapshot {
    pub fn capture(
        kernel: &SimulationKernel,
        events_applied: usize,
        taken_at_ms: i64,
    ) -> Self {
        let state = kernel.state();
        let state_hash = hash_state(&state);
        Self {
            id: Uuid::new_v4(),
            sim_time: kernel.sim_time(),
            taken_at_ms,
            events_applied,
            log_length: kernel.log().len(),
            state_hash,
            state,
        }
    }

    /// True when `state` still matches its recorded hash.
    pub fn verify(&self) -> bool {
        hash_state(&self.state) == self.state_hash
    }
}

/// Canonical state fingerprint. The kernel state serializes through
/// ordered maps only, so equal states always hash equally.
pub fn hash_state(state: &KernelState) -> String {
    let bytes = serde_json::to_vec(state).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}
