use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

/// Tunables for the feedback loop manager. Defaults live on
/// [`crate::KernelConfig`]; this struct is what the kernel hands down.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeedbackLimits {
    pub max_depth: u32,
    /// Sliding window, in ticks, the breaker counts over.
    pub breaker_window: u64,
    /// Feedback count within the window that opens the breaker.
    pub breaker_threshold: usize,
    /// Ticks the breaker stays open once tripped.
    pub breaker_cooldown: u64,
}

/// Why a feedback event or message was refused admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackRejection {
    DepthExceeded { depth: u32, max_depth: u32 },
    Blacklisted { target: String },
    CircuitOpen { target: String, until: u64 },
}

impl fmt::Display for FeedbackRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedbackRejection::DepthExceeded { depth, max_depth } => {
                write!(f, "feedback depth {} exceeds maximum {}", depth, max_depth)
            }
            FeedbackRejection::Blacklisted { target } => {
                write!(f, "target `{}` is blacklisted for feedback", target)
            }
            FeedbackRejection::CircuitOpen { target, until } => {
                write!(f, "circuit breaker for `{}` is open until tick {}", target, until)
            }
        }
    }
}

/// Per-target breaker bookkeeping, serialized into snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerState {
    /// Ticks at which feedback was admitted, oldest first.
    recent: VecDeque<u64>,
    open_until: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackState {
    breakers: BTreeMap<String, BreakerState>,
    blacklist: BTreeSet<String>,
}

/// Tracks feedback creation per target node and decides admission.
///
/// Admission is checked at creation time, before anything is buffered, so a
/// rejected event never exists anywhere except as a `FEEDBACK_BLOCKED` log
/// entry written by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackManager {
    limits: FeedbackLimits,
    state: FeedbackState,
}

impl FeedbackManager {
    pub fn new(limits: FeedbackLimits) -> Self {
        Self {
            limits,
            state: FeedbackState::default(),
        }
    }

    pub fn from_state(limits: FeedbackLimits, state: FeedbackState) -> Self {
        Self { limits, state }
    }

    pub fn state(&self) -> &FeedbackState {
        &self.state
    }

    pub fn blacklist(&mut self, target: impl Into<String>) {
        self.state.blacklist.insert(target.into());
    }

    pub fn admit(
        &mut self,
        target: &str,
        depth: u32,
        now: u64,
    ) -> Result<(), FeedbackRejection> {
        if depth > self.limits.max_depth {
            return Err(FeedbackRejection::DepthExceeded {
                depth,
                max_depth: self.limits.max_depth,
            });
        }
        if self.state.blacklist.contains(target) {
            return Err(FeedbackRejection::Blacklisted {
                target: target.to_string(),
            });
        }

        let breaker = self.state.breakers.entry(target.to_string()).or_default();

        if let Some(until) = breaker.open_until {
            if now < until {
                return Err(FeedbackRejection::CircuitOpen {
                    target: target.to_string(),
                    until,
                });
            }
            // Cooled down.
            breaker.open_until = None;
            breaker.recent.clear();
        }

        let window_start = now.saturating_sub(self.limits.breaker_window);
        while breaker.recent.front().is_some_and(|&t| t < window_start) {
            breaker.recent.pop_front();
        }

        breaker.recent.push_back(now);
        if breaker.recent.len() > self.limits.breaker_threshold {
            let until = now + self.limits.breaker_cooldown;
            breaker.open_until = Some(until);
            return Err(FeedbackRejection::CircuitOpen {
                target: target.to_string(),
                until,
            });
        }

        Ok(())
    }
}
