//! Bounded background execution of non-critical validation.

use super::engine::{ValidationEngine, ValidationReport};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

/// Receives the output of background validation.
pub trait WarningSink: Send + Sync {
    /// Deliver the report for one record.
    fn deliver(&self, record_id: u64, report: ValidationReport);
}

/// Sink that logs every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogWarningSink;

impl WarningSink for LogWarningSink {
    fn deliver(&self, record_id: u64, report: ValidationReport) {
        for (slug, messages) in &report.warnings {
            tracing::info!(record_id, slug = %slug, warnings = ?messages, "validation warning");
        }
        if !report.hidden.is_empty() {
            tracing::debug!(record_id, hidden = ?report.hidden, "hidden fields");
        }
    }
}

/// Sink that keeps reports in memory.
#[derive(Debug, Default)]
pub struct MemoryWarningSink {
    reports: Mutex<Vec<(u64, ValidationReport)>>,
}

impl MemoryWarningSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports delivered so far.
    pub fn reports(&self) -> Vec<(u64, ValidationReport)> {
        self.reports.lock().clone()
    }

    /// Number of reports delivered.
    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    /// Check if nothing was delivered.
    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }
}

impl WarningSink for MemoryWarningSink {
    fn deliver(&self, record_id: u64, report: ValidationReport) {
        self.reports.lock().push((record_id, report));
    }
}

/// Runs non-critical validation on the ambient tokio runtime.
///
/// At most `limit` tasks run at once. Without a runtime or a free permit
/// the validation is skipped.
#[derive(Clone)]
pub struct BackgroundValidator {
    permits: Arc<Semaphore>,
    sink: Arc<dyn WarningSink>,
}

impl fmt::Debug for BackgroundValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundValidator")
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl BackgroundValidator {
    /// Create a validator allowing `limit` concurrent tasks.
    pub fn new(limit: usize, sink: Arc<dyn WarningSink>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            sink,
        }
    }

    /// Schedule non-critical validation of a committed record.
    ///
    /// Returns `true` if a task was spawned.
    pub fn spawn(
        &self,
        engine: Arc<ValidationEngine>,
        record_id: u64,
        data: Map<String, Value>,
        changed: Option<String>,
    ) -> bool {
        let Ok(handle) = Handle::try_current() else {
            tracing::debug!(record_id, "no async runtime, skipping background validation");
            return false;
        };
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            tracing::debug!(record_id, "background validation saturated, skipping");
            return false;
        };

        let sink = self.sink.clone();
        handle.spawn(async move {
            let _permit = permit;
            let report = engine.validate_non_critical(&data, changed.as_deref());
            if !report.is_empty() {
                sink.deliver(record_id, report);
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        BusinessRules, Condition, ConditionGroup, ConditionalRule, FieldDefinition, FieldSpec,
        FieldType, Pipeline, PipelineSchema, RuleAction,
    };
    use crate::validation::ValidationConfig;
    use serde_json::json;
    use std::time::Duration;

    fn engine() -> Arc<ValidationEngine> {
        let amount = FieldDefinition::new(1, 1, FieldSpec::new("Amount", FieldType::Number)).unwrap();
        let note = FieldDefinition::new(
            2,
            1,
            FieldSpec::new("Note", FieldType::Text).with_rules(BusinessRules::default().with_rule(
                ConditionalRule::new(
                    RuleAction::Warn,
                    ConditionGroup::all(vec![Condition::is_not_empty("amount")]),
                )
                .with_message("explain the amount"),
            )),
        )
        .unwrap();
        let schema = PipelineSchema::new(Pipeline::new(1, "Orders"), vec![amount, note]);
        Arc::new(ValidationEngine::new(schema, &ValidationConfig::default()))
    }

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_skipped_without_runtime() {
        let sink = Arc::new(MemoryWarningSink::new());
        let validator = BackgroundValidator::new(2, sink.clone());
        assert!(!validator.spawn(engine(), 1, data(json!({"amount": 3})), None));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_delivers_warnings() {
        let sink = Arc::new(MemoryWarningSink::new());
        let validator = BackgroundValidator::new(2, sink.clone());
        assert!(validator.spawn(engine(), 7, data(json!({"amount": 3})), Some("amount".into())));

        for _ in 0..100 {
            if !sink.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, 7);
        assert_eq!(reports[0].1.warnings["note"], vec!["explain the amount".to_string()]);
    }

    #[tokio::test]
    async fn test_bounded_by_permits() {
        let sink = Arc::new(MemoryWarningSink::new());
        let validator = BackgroundValidator::new(0, sink.clone());
        assert!(!validator.spawn(engine(), 1, data(json!({"amount": 3})), None));
    }
}
