//! Profile timing policies
//!
//! A [`ProfileTiming`] decides how many times the action stage of a profile
//! runs. It is fixed for the lifetime of a run.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// When a duration-bounded run is allowed to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DeterminismScope {
    /// Running actions are cancelled as soon as the deadline passes
    #[default]
    Immediate,
    /// The deadline is honoured once the current action completes
    IndividualAction,
    /// The deadline is honoured once the current iteration completes
    AllActions,
}

/// How long the action stage of a profile keeps running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileTiming {
    /// Run the action stage a fixed number of times
    Iterations(u64),
    /// Run until cancelled
    Forever,
    /// Run until a wall-clock duration elapses
    Duration { duration: Duration, scope: DeterminismScope },
}

impl ProfileTiming {
    /// Every element runs exactly once
    pub fn once() -> Self {
        ProfileTiming::Iterations(1)
    }

    pub fn iterations(count: u64) -> Result<Self, ConfigError> {
        if count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "iterations".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(ProfileTiming::Iterations(count))
    }

    pub fn duration(duration: Duration, scope: DeterminismScope) -> Self {
        ProfileTiming::Duration { duration, scope }
    }

    /// Starts tracking this timing for one run
    pub fn start(&self) -> TimingTracker {
        TimingTracker {
            timing: *self,
            deadline: match self {
                ProfileTiming::Duration { duration, .. } => Some(Instant::now() + *duration),
                _ => None,
            },
        }
    }
}

impl Default for ProfileTiming {
    fn default() -> Self {
        ProfileTiming::once()
    }
}

/// Run-scoped view of a [`ProfileTiming`]
#[derive(Debug, Clone)]
pub struct TimingTracker {
    timing: ProfileTiming,
    deadline: Option<Instant>,
}

impl TimingTracker {
    /// Deadline at which running actions must be cancelled, if any
    pub fn hard_deadline(&self) -> Option<Instant> {
        match self.timing {
            ProfileTiming::Duration { scope: DeterminismScope::Immediate, .. } => self.deadline,
            _ => None,
        }
    }

    /// End of a duration-bounded run, whatever its scope
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.map(|deadline| Instant::now() >= deadline).unwrap_or(false)
    }

    /// Whether another iteration should start after `completed` iterations
    pub fn should_start_iteration(&self, completed: u64) -> bool {
        match self.timing {
            ProfileTiming::Iterations(count) => completed < count,
            ProfileTiming::Forever => true,
            ProfileTiming::Duration { .. } => !self.deadline_passed(),
        }
    }

    /// Whether the next action within the current iteration may start
    pub fn should_start_action(&self) -> bool {
        match self.timing {
            ProfileTiming::Duration { scope: DeterminismScope::AllActions, .. } => true,
            ProfileTiming::Duration { .. } => !self.deadline_passed(),
            _ => true,
        }
    }
}
