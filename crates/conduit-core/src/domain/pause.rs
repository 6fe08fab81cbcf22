use crate::domain::condition::Condition;
use crate::types::DataBag;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Pause declaration of a step
///
/// After a successful pass of the step body the `when` predicate is evaluated
/// against the data bag. If it holds the instance pauses and the body runs
/// again once any of the `resume` conditions is satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseSpec {
    /// Human readable reason, exposed through queries
    pub reason: String,
    /// Pause predicate
    pub when: Condition,
    /// Resume conditions; any one satisfied resumes the instance
    pub resume: Vec<ResumeCondition>,
}

/// One way a paused instance may be resumed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResumeCondition {
    /// Resume when every signal in the set has been received
    Signals(SignalSet),
    /// Resume or fail once a duration has elapsed since the pause
    Elapsed(ElapsedCondition),
    /// Resume on request of an actor holding one of the roles
    Manual(ManualCondition),
}

impl ResumeCondition {
    /// Resume once all `signals` have arrived
    pub fn signals(signals: Vec<SignalSpec>) -> Self {
        ResumeCondition::Signals(SignalSet {
            signals,
            correlation: None,
        })
    }

    /// Resume after `after`, recording `flag` in the data bag
    pub fn after(after: Duration, flag: impl Into<String>) -> Self {
        ResumeCondition::Elapsed(ElapsedCondition {
            after,
            flag: flag.into(),
            outcome: TimeoutOutcome::Resume,
        })
    }

    /// Fail the instance with a timeout after `after`
    pub fn fail_after(after: Duration) -> Self {
        ResumeCondition::Elapsed(ElapsedCondition {
            after,
            flag: "timed_out".to_string(),
            outcome: TimeoutOutcome::Fail,
        })
    }

    /// Manual resume by an actor holding one of `roles`
    pub fn manual(roles: Vec<String>, flag: impl Into<String>) -> Self {
        ResumeCondition::Manual(ManualCondition {
            roles,
            flag: flag.into(),
        })
    }

    /// Data bag keys this condition writes when it fires
    pub fn written_keys(&self) -> Vec<&str> {
        match self {
            ResumeCondition::Signals(set) => set
                .signals
                .iter()
                .flat_map(|s| std::iter::once(s.flag.as_str()).chain(s.store_as.as_deref()))
                .collect(),
            ResumeCondition::Elapsed(elapsed) => vec![elapsed.flag.as_str()],
            ResumeCondition::Manual(manual) => vec![manual.flag.as_str()],
        }
    }
}

/// Signals that must all be received (logical AND)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSet {
    /// Expected signals
    pub signals: Vec<SignalSpec>,
    /// Routes an event to this instance only when the payload matches the data bag
    pub correlation: Option<Correlation>,
}

/// A named external event the instance waits for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSpec {
    /// Event name
    pub event: String,
    /// Data bag key set to `true` when the signal arrives
    pub flag: String,
    /// Optional condition on the event payload
    pub matches: Option<Condition>,
    /// Data bag key receiving the event payload
    pub store_as: Option<String>,
}

impl SignalSpec {
    /// Signal setting `flag` when `event` arrives
    pub fn new(event: impl Into<String>, flag: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            flag: flag.into(),
            matches: None,
            store_as: None,
        }
    }
}

/// Correlates an event payload field with a data bag key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    /// Key or dotted path in the event payload
    pub payload_field: String,
    /// Key or dotted path in the data bag
    pub data_key: String,
}

impl Correlation {
    /// Whether the event payload belongs to the instance holding `data`
    pub fn matches(&self, payload: &Value, data: &DataBag) -> bool {
        let payload = DataBag::from_value(payload.clone());
        match (payload.lookup(&self.payload_field), data.lookup(&self.data_key)) {
            (Some(left), Some(right)) => left == right,
            _ => false,
        }
    }
}

/// Duration-based resume condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElapsedCondition {
    /// Maximum wait
    pub after: Duration,
    /// Data bag key set to `true` when the condition fires
    pub flag: String,
    /// What happens when the wait elapses
    pub outcome: TimeoutOutcome,
}

/// Outcome of an elapsed wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutOutcome {
    /// Resume the instance
    Resume,
    /// Fail the instance with a timeout
    Fail,
}

/// Privileged manual resume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualCondition {
    /// Roles allowed to resume
    pub roles: Vec<String>,
    /// Data bag key set to `true` on resume
    pub flag: String,
}

impl ManualCondition {
    /// Whether any of `roles` is allowed
    pub fn permits(&self, roles: &[String]) -> bool {
        roles.iter().any(|role| self.roles.contains(role))
    }
}

/// Result of offering an event to a paused instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvaluation {
    /// The event is not awaited by this instance
    Ignored,
    /// The event was recorded but more signals are outstanding
    Recorded,
    /// Every signal of a set has been received
    Satisfied,
}

/// Persisted state of a paused instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseState {
    /// Step that requested the pause
    pub step: String,
    /// Pause reason
    pub reason: String,
    /// Payload of the pausing pass, if the body returned one
    pub payload: Option<Value>,
    /// When the instance paused
    pub paused_at: DateTime<Utc>,
    /// Resume conditions
    pub resume: Vec<ResumeCondition>,
    /// Names of the events received so far
    #[serde(default)]
    pub received: Vec<String>,
}

impl PauseState {
    /// Whether any signal set waits for `event`
    pub fn awaits_event(&self, event: &str) -> bool {
        self.signal_sets()
            .any(|set| set.signals.iter().any(|signal| signal.event == event))
    }

    /// Offer an event: matching signals record their flag (and payload) in
    /// `data`; the result tells whether a whole signal set is now satisfied
    pub fn apply_event(&mut self, event: &str, payload: &Value, data: &mut DataBag) -> SignalEvaluation {
        let payload_bag = DataBag::from_value(payload.clone());
        let mut evaluation = SignalEvaluation::Ignored;

        for set in self.signal_sets() {
            if let Some(correlation) = &set.correlation {
                if !correlation.matches(payload, data) {
                    continue;
                }
            }

            let mut matched = false;
            for signal in set.signals.iter().filter(|s| s.event == event) {
                if let Some(condition) = &signal.matches {
                    if !condition.evaluate(&payload_bag) {
                        continue;
                    }
                }
                data.insert_value(signal.flag.clone(), Value::Bool(true));
                if let Some(key) = &signal.store_as {
                    data.insert_value(key.clone(), payload.clone());
                }
                matched = true;
            }

            if !matched {
                continue;
            }
            if set.signals.iter().all(|signal| data.is_truthy(&signal.flag)) {
                evaluation = SignalEvaluation::Satisfied;
            } else if evaluation == SignalEvaluation::Ignored {
                evaluation = SignalEvaluation::Recorded;
            }
        }

        if evaluation != SignalEvaluation::Ignored && !self.received.iter().any(|e| e == event) {
            self.received.push(event.to_string());
        }
        evaluation
    }

    /// The earliest elapsed condition that is due at `now`
    pub fn due_elapsed(&self, now: DateTime<Utc>) -> Option<&ElapsedCondition> {
        let waited = now.signed_duration_since(self.paused_at).to_std().ok()?;
        self.resume
            .iter()
            .filter_map(|condition| match condition {
                ResumeCondition::Elapsed(elapsed) => Some(elapsed),
                _ => None,
            })
            .filter(|elapsed| waited >= elapsed.after)
            .min_by_key(|elapsed| elapsed.after)
    }

    /// The manual resume condition, if declared
    pub fn manual(&self) -> Option<&ManualCondition> {
        self.resume.iter().find_map(|condition| match condition {
            ResumeCondition::Manual(manual) => Some(manual),
            _ => None,
        })
    }

    fn signal_sets(&self) -> impl Iterator<Item = &SignalSet> {
        self.resume.iter().filter_map(|condition| match condition {
            ResumeCondition::Signals(set) => Some(set),
            _ => None,
        })
    }
}
