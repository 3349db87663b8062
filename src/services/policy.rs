use serde::Deserialize;
use std::collections::BTreeMap;

use crate::models::{metric, Metrics};

/// Reason reported when a first observation already qualifies.
pub const NEW_ENTITY: &str = "new_entity";

/// Pure predicate over `(current, previous)` metric snapshots.
///
/// Variants that compare against history are false when there is no previous snapshot.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// `min <= current <= max`; either bound may be omitted.
    Absolute {
        metric: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    /// `current - previous >= min_delta`.
    Delta { metric: String, min_delta: f64 },
    /// `previous > 0 && (current - previous) / previous >= min_pct` (fraction, 0.1 = 10%).
    Growth { metric: String, min_pct: f64 },
    All { of: Vec<Predicate> },
    Any { of: Vec<Predicate> },
    /// Weighted sum of current metrics reaching `min_score`.
    Score { weights: BTreeMap<String, f64>, min_score: f64 },
}

impl Predicate {
    pub fn at_least(metric: &str, min: f64) -> Self {
        Predicate::Absolute { metric: metric.to_string(), min: Some(min), max: None }
    }

    pub fn at_most(metric: &str, max: f64) -> Self {
        Predicate::Absolute { metric: metric.to_string(), min: None, max: Some(max) }
    }

    pub fn delta(metric: &str, min_delta: f64) -> Self {
        Predicate::Delta { metric: metric.to_string(), min_delta }
    }

    pub fn growth(metric: &str, min_pct: f64) -> Self {
        Predicate::Growth { metric: metric.to_string(), min_pct }
    }

    pub fn all(of: Vec<Predicate>) -> Self {
        Predicate::All { of }
    }

    pub fn matches(&self, current: &Metrics, previous: Option<&Metrics>) -> bool {
        match self {
            Predicate::Absolute { metric: m, min, max } => {
                let v = metric(current, m);
                min.map_or(true, |lo| v >= lo) && max.map_or(true, |hi| v <= hi)
            }
            Predicate::Delta { metric: m, min_delta } => previous
                .map(|prev| metric(current, m) - metric(prev, m) >= *min_delta)
                .unwrap_or(false),
            Predicate::Growth { metric: m, min_pct } => previous
                .map(|prev| {
                    let before = metric(prev, m);
                    before > 0.0 && (metric(current, m) - before) / before >= *min_pct
                })
                .unwrap_or(false),
            Predicate::All { of } => !of.is_empty() && of.iter().all(|p| p.matches(current, previous)),
            Predicate::Any { of } => of.iter().any(|p| p.matches(current, previous)),
            Predicate::Score { weights, min_score } => {
                let score: f64 = weights.iter().map(|(m, w)| w * metric(current, m)).sum();
                score >= *min_score
            }
        }
    }

    /// Metric names this predicate reads, first-use order, no duplicates.
    pub fn metrics(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_metrics(&mut out);
        out
    }

    fn collect_metrics(&self, out: &mut Vec<String>) {
        match self {
            Predicate::Absolute { metric, .. }
            | Predicate::Delta { metric, .. }
            | Predicate::Growth { metric, .. } => push_unique(out, metric),
            Predicate::Score { weights, .. } => {
                for m in weights.keys() {
                    push_unique(out, m);
                }
            }
            Predicate::All { of } | Predicate::Any { of } => {
                for p in of {
                    p.collect_metrics(out);
                }
            }
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Predicate::Absolute { metric, min: None, max: None } => {
                Err(format!("absolute predicate on '{}' needs min or max", metric))
            }
            Predicate::All { of } | Predicate::Any { of } if of.is_empty() => {
                Err("compound predicate with no members".to_string())
            }
            Predicate::All { of } | Predicate::Any { of } => of.iter().try_for_each(Predicate::validate),
            Predicate::Score { weights, .. } if weights.is_empty() => {
                Err("score predicate with no weights".to_string())
            }
            _ => Ok(()),
        }
    }
}

fn push_unique(out: &mut Vec<String>, m: &str) {
    if !out.iter().any(|x| x == m) {
        out.push(m.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NamedPredicate {
    pub name: String,
    #[serde(flatten)]
    pub predicate: Predicate,
}

/// Ordered, named predicates deciding when a transition is worth a notification.
#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdPolicy {
    /// Checked only on first observation; any match yields [`NEW_ENTITY`].
    #[serde(default)]
    pub first_sight: Vec<NamedPredicate>,
    /// Checked in order for returning entities; first match wins.
    #[serde(default)]
    pub transitions: Vec<NamedPredicate>,
    /// Allow another notification after the entity was already notified.
    #[serde(default)]
    pub repeatable: bool,
    /// Keep `notified` set even if the send failed.
    #[serde(default = "default_mark_on_failure")]
    pub mark_notified_on_send_failure: bool,
}

fn default_mark_on_failure() -> bool { true }

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            first_sight: Vec::new(),
            transitions: Vec::new(),
            repeatable: false,
            mark_notified_on_send_failure: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// First observation that does not qualify: track only.
    FirstSight,
    Qualifies(String),
    NoChange,
}

impl ThresholdPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_first_sight(mut self, name: &str, predicate: Predicate) -> Self {
        self.first_sight.push(NamedPredicate { name: name.to_string(), predicate });
        self
    }

    pub fn on_transition(mut self, name: &str, predicate: Predicate) -> Self {
        self.transitions.push(NamedPredicate { name: name.to_string(), predicate });
        self
    }

    pub fn repeatable(mut self, repeatable: bool) -> Self {
        self.repeatable = repeatable;
        self
    }

    pub fn mark_notified_on_send_failure(mut self, mark: bool) -> Self {
        self.mark_notified_on_send_failure = mark;
        self
    }

    pub fn evaluate(&self, current: &Metrics, previous: Option<&Metrics>) -> Decision {
        evaluate(current, previous, self)
    }

    /// Metrics worth showing for a given decision reason.
    pub fn relevant_metrics(&self, reason: &str) -> Vec<String> {
        let source: Vec<&NamedPredicate> = if reason == NEW_ENTITY {
            self.first_sight.iter().collect()
        } else {
            self.transitions.iter().filter(|p| p.name == reason).collect()
        };

        let mut out: Vec<String> = Vec::new();
        for named in source {
            named.predicate.collect_metrics(&mut out);
        }
        out
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.first_sight.is_empty() && self.transitions.is_empty() {
            return Err("policy has no predicates".to_string());
        }
        for named in self.first_sight.iter().chain(&self.transitions) {
            if named.name.trim().is_empty() {
                return Err("predicate with empty name".to_string());
            }
            named.predicate.validate().map_err(|e| format!("{}: {}", named.name, e))?;
        }
        Ok(())
    }
}

pub fn evaluate(current: &Metrics, previous: Option<&Metrics>, policy: &ThresholdPolicy) -> Decision {
    match previous {
        None => {
            if policy.first_sight.iter().any(|p| p.predicate.matches(current, None)) {
                Decision::Qualifies(NEW_ENTITY.to_string())
            } else {
                Decision::FirstSight
            }
        }
        Some(prev) => policy
            .transitions
            .iter()
            .find(|p| p.predicate.matches(current, Some(prev)))
            .map(|p| Decision::Qualifies(p.name.clone()))
            .unwrap_or(Decision::NoChange),
    }
}
