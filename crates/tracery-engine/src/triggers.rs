//! Engine-owned batch trigger evaluation.
//!
//! One [`TriggerEvaluator`] exists per aggregation node. It counts accepted
//! rows and remembers when the first one arrived; the processor asks it after
//! every accept (and on every timeout sweep) whether the batch should flush.

use std::time::Duration;

use serde_json::json;
use tracery_expr::Expression;
use tracery_types::{Result, RowData, TriggerType};

use crate::config::TriggerConfig;

#[derive(Debug, Clone)]
pub struct TriggerEvaluator {
    node: String,
    count: Option<usize>,
    timeout: Option<Duration>,
    condition: Option<Expression>,
    batch_count: usize,
    first_accept: Option<Duration>,
    fired: Option<TriggerType>,
}

impl TriggerEvaluator {
    /// `node` names the aggregation in condition errors.
    pub fn new(node: impl Into<String>, config: &TriggerConfig) -> Result<Self> {
        Ok(Self {
            node: node.into(),
            count: config.count,
            timeout: config.timeout,
            condition: config.parse_condition()?,
            batch_count: 0,
            first_accept: None,
            fired: None,
        })
    }

    pub fn record_accept(&mut self, now: Duration) {
        if self.batch_count == 0 {
            self.first_accept = Some(now);
        }
        self.batch_count += 1;
    }

    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    pub fn batch_age(&self, now: Duration) -> Duration {
        self.first_accept
            .map(|first| now.saturating_sub(first))
            .unwrap_or_default()
    }

    /// Whether any sub-trigger is satisfied. Remembers the first satisfied
    /// one, checked in the order count, timeout, condition. An empty batch
    /// never triggers.
    pub fn should_trigger(&mut self, now: Duration) -> Result<bool> {
        self.fired = None;
        if self.batch_count == 0 {
            return Ok(false);
        }
        if self.count.is_some_and(|n| self.batch_count >= n) {
            self.fired = Some(TriggerType::Count);
        } else if self.timeout.is_some_and(|t| self.batch_age(now) >= t) {
            self.fired = Some(TriggerType::Timeout);
        } else if self.condition_holds(now)? {
            self.fired = Some(TriggerType::Condition);
        }
        Ok(self.fired.is_some())
    }

    fn condition_holds(&self, now: Duration) -> Result<bool> {
        let Some(condition) = &self.condition else {
            return Ok(false);
        };
        let mut context = RowData::new();
        context.insert("batch_count".into(), json!(self.batch_count));
        context.insert("batch_age".into(), json!(self.batch_age(now).as_secs_f64()));
        condition.evaluate_bool(&self.node, &context)
    }

    /// The trigger that made the last [`should_trigger`](Self::should_trigger)
    /// call return `true`.
    pub fn which_triggered(&self) -> Option<TriggerType> {
        self.fired
    }

    /// Human-readable reason for the batch record.
    pub fn describe(&self, trigger: TriggerType, now: Duration) -> String {
        match trigger {
            TriggerType::Count => format!(
                "batch_count {} reached {}",
                self.batch_count,
                self.count.unwrap_or_default()
            ),
            TriggerType::Timeout => format!(
                "batch_age {}ms reached {}ms",
                self.batch_age(now).as_millis(),
                self.timeout.unwrap_or_default().as_millis()
            ),
            TriggerType::Condition => format!(
                "condition `{}` held",
                self.condition
                    .as_ref()
                    .map(Expression::source)
                    .unwrap_or_default()
            ),
            TriggerType::EndOfSource => format!("source exhausted with {} rows", self.batch_count),
        }
    }

    /// Forget the current batch. Called after every flush.
    pub fn reset(&mut self) {
        self.batch_count = 0;
        self.first_accept = None;
        self.fired = None;
    }
}
