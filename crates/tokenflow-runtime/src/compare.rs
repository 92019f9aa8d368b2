use crate::recording::ScenarioRecording;
use crate::replay::{replay_scenario, ReplayOptions};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokenflow_types::Scenario;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Significance {
    Minor,
    Major,
}

/// One divergence between the A and B runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Difference {
    pub timestamp: u64,
    pub field: String,
    pub value_a: Value,
    pub value_b: Value,
    pub significance: Significance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Comparison {
    pub differences: Vec<Difference>,
}

impl Comparison {
    pub fn is_identical(&self) -> bool {
        self.differences.is_empty()
    }

    pub fn major_differences(&self) -> impl Iterator<Item = &Difference> {
        self.differences
            .iter()
            .filter(|d| d.significance == Significance::Major)
    }
}

/// Replay recording A's core events against its own model and against
/// `model_b`, then diff the derived logs.
///
/// Per-entry value and node-state divergences are minor; final simulation
/// time and derived-event count are major.
pub fn compare_scenarios(
    recording: &ScenarioRecording,
    model_b: &Scenario,
) -> Result<Comparison> {
    let outcome_a = replay_scenario(recording, &ReplayOptions::default())?;

    let recording_b = ScenarioRecording {
        initial: model_b.clone(),
        epoch_base: recording.epoch_base,
        kernel_config: recording.kernel_config,
        events: recording.events.clone(),
        snapshots: Vec::new(),
    };
    let outcome_b = replay_scenario(&recording_b, &ReplayOptions::default())?;

    let log_a = outcome_a.log();
    let log_b = outcome_b.log();
    let mut differences = Vec::new();

    for (a, b) in log_a.iter().zip(log_b.iter()) {
        if a.node_id != b.node_id || a.action != b.action {
            differences.push(Difference {
                timestamp: a.sim_time,
                field: format!("entry[{}].action", a.sequence),
                value_a: Value::String(format!("{}:{}", a.node_id, a.action.label())),
                value_b: Value::String(format!("{}:{}", b.node_id, b.action.label())),
                significance: Significance::Minor,
            });
            continue;
        }
        if a.value != b.value {
            differences.push(Difference {
                timestamp: a.sim_time,
                field: format!("{}.value", a.node_id),
                value_a: a.value.clone(),
                value_b: b.value.clone(),
                significance: Significance::Minor,
            });
        }
        if a.node_state != b.node_state {
            differences.push(Difference {
                timestamp: a.sim_time,
                field: format!("{}.node_state", a.node_id),
                value_a: Value::String(a.node_state.clone()),
                value_b: Value::String(b.node_state.clone()),
                significance: Significance::Minor,
            });
        }
    }

    let final_a = outcome_a.state.sim_time;
    let final_b = outcome_b.state.sim_time;
    if final_a != final_b {
        differences.push(Difference {
            timestamp: final_a.max(final_b),
            field: "final_sim_time".to_string(),
            value_a: Value::from(final_a),
            value_b: Value::from(final_b),
            significance: Significance::Major,
        });
    }
    if log_a.len() != log_b.len() {
        differences.push(Difference {
            timestamp: final_a.max(final_b),
            field: "event_count".to_string(),
            value_a: Value::from(log_a.len() as u64),
            value_b: Value::from(log_b.len() as u64),
            significance: Significance::Major,
        });
    }

    Ok(Comparison { differences })
}
