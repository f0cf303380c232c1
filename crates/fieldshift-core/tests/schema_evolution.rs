//! End-to-end tests of schema evolution over live records.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use fieldshift_core::catalog::{
    BusinessRules, Condition, ConditionGroup, ConditionalRule, FieldChanges, FieldConfig,
    FieldDefinition, FieldSpec, FieldType, RuleAction, StorageConstraints,
};
use fieldshift_core::coordinator::{
    Actor, AuditOp, MemoryAuditLog, SchemaChangeError, UpdateOptions, ValidationError,
};
use fieldshift_core::graph::DependencyGraph;
use fieldshift_core::migration::{
    JobStatus, JobStore, MigrationDecision, MigrationJob, MigrationProgress,
};
use fieldshift_core::storage::StorageConfig;
use fieldshift_core::validation::{MemoryWarningSink, ValidationContext};
use fieldshift_core::{Database, EngineConfig};
use serde_json::{json, Map, Value};

struct TestContext {
    db: Database,
    audit: Arc<MemoryAuditLog>,
    pipeline_id: u64,
}

impl TestContext {
    fn new() -> Self {
        let audit = Arc::new(MemoryAuditLog::new());
        let db = Database::open(EngineConfig::temporary())
            .unwrap()
            .with_audit(audit.clone());
        let pipeline_id = db.create_pipeline("Contacts", None, &actor()).unwrap().id;
        Self {
            db,
            audit,
            pipeline_id,
        }
    }

    fn field(&self, name: &str, field_type: FieldType) -> FieldDefinition {
        self.db
            .create_field(self.pipeline_id, FieldSpec::new(name, field_type), &actor())
            .unwrap()
    }

    fn insert(&self, value: Value) -> u64 {
        self.db
            .save(self.pipeline_id, None, data(value), &actor())
            .unwrap()
            .record
            .id
    }

    fn record_data(&self, record_id: u64) -> Map<String, Value> {
        self.db
            .get_record(self.pipeline_id, record_id)
            .unwrap()
            .unwrap()
            .data
    }
}

fn actor() -> Actor {
    Actor::new("ops@example.com")
}

fn data(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn rule_on(slug: &str) -> BusinessRules {
    BusinessRules::default().with_rule(ConditionalRule::new(
        RuleAction::Require,
        ConditionGroup::all(vec![Condition::is_not_empty(slug)]),
    ))
}

#[test]
fn test_text_to_number_keeps_convertible_values_only() {
    let ctx = TestContext::new();
    let score = ctx.field("Score", FieldType::Text);
    let good = ctx.insert(json!({"score": "42"}));
    let bad = ctx.insert(json!({"score": "abc"}));

    let update = ctx
        .db
        .update_field(
            score.id,
            &FieldChanges::default().change_type(FieldType::Number),
            &actor(),
            UpdateOptions::confirmed(),
        )
        .unwrap();

    let result = update.migration.unwrap();
    assert!(result.success);
    assert_eq!(result.records_migrated, 1);
    assert_eq!(result.records_failed, 0);
    assert_eq!(result.values_dropped, 1);
    assert!(!result.warnings.is_empty());

    assert_eq!(ctx.record_data(good)["score"], json!(42));
    assert!(!ctx.record_data(bad).contains_key("score"));
    assert_eq!(
        ctx.db.get_field(score.id).unwrap().unwrap().field_type,
        FieldType::Number
    );
}

#[test]
fn test_rename_moves_values_to_new_slug() {
    let ctx = TestContext::new();
    let email = ctx.field("Email", FieldType::Email);
    let first = ctx.insert(json!({"email": "ana@example.com"}));
    let second = ctx.insert(json!({"email": "bo@example.com"}));
    let empty = ctx.insert(json!({}));

    let update = ctx
        .db
        .update_field(
            email.id,
            &FieldChanges::default().rename("Email Address"),
            &actor(),
            UpdateOptions::default(),
        )
        .unwrap();
    assert_eq!(update.field.slug, "email_address");
    assert_eq!(update.migration.unwrap().records_migrated, 2);

    for id in [first, second] {
        let record = ctx.record_data(id);
        assert!(record.contains_key("email_address"));
        assert!(!record.contains_key("email"));
    }
    assert!(ctx.record_data(empty).is_empty());

    let storage = ctx.db.storage();
    assert_eq!(storage.count_records_with_key(ctx.pipeline_id, "email").unwrap(), 0);
    assert_eq!(storage.count_records_with_key(ctx.pipeline_id, "email_address").unwrap(), 2);

    let pipeline = ctx.db.get_pipeline(ctx.pipeline_id).unwrap().unwrap();
    assert!(pipeline.schema.contains_key("email_address"));
    assert!(!pipeline.schema.contains_key("email"));
}

#[test]
fn test_relation_to_text_is_denied_without_mutation() {
    let ctx = TestContext::new();
    let accounts = ctx.db.create_pipeline("Accounts", None, &actor()).unwrap();
    let account = ctx
        .db
        .create_field(
            ctx.pipeline_id,
            FieldSpec::new("Account", FieldType::Relation).with_config(FieldConfig::Relation {
                target_pipeline_id: accounts.id,
                allow_multiple: false,
            }),
            &actor(),
        )
        .unwrap();
    let record = ctx.insert(json!({"account": 12}));
    let audited = ctx.audit.len();

    let err = ctx
        .db
        .update_field(
            account.id,
            &FieldChanges::default().change_type(FieldType::Text),
            &actor(),
            UpdateOptions::confirmed(),
        )
        .unwrap_err();
    match err {
        SchemaChangeError::Denied { alternatives, .. } => assert!(!alternatives.is_empty()),
        other => panic!("expected a denial, got {other}"),
    }

    let stored = ctx.db.get_field(account.id).unwrap().unwrap();
    assert_eq!(stored.field_type, FieldType::Relation);
    assert_eq!(stored.version, account.version);
    assert_eq!(ctx.record_data(record)["account"], json!(12));
    assert_eq!(ctx.audit.len(), audited);
    assert_eq!(ctx.db.schema().pending_snapshots(), 0);
}

#[test]
fn test_failed_migration_rolls_back_every_pass() {
    let ctx = TestContext::new();
    let code = ctx.field("Code", FieldType::Text);
    let long = ctx.insert(json!({"code": "abcdef"}));
    let short = ctx.insert(json!({"code": "ab"}));

    let err = ctx
        .db
        .update_field(
            code.id,
            &FieldChanges::default()
                .rename("Short Code")
                .with_constraints(StorageConstraints::default().with_max_length(3)),
            &actor(),
            UpdateOptions::confirmed(),
        )
        .unwrap_err();
    let SchemaChangeError::MigrationFailed(result) = err else {
        panic!("expected a failed migration");
    };
    assert!(!result.success);
    assert_eq!(result.records_failed, 1);

    let stored = ctx.db.get_field(code.id).unwrap().unwrap();
    assert_eq!(stored.slug, "code");
    assert_eq!(stored.constraints.max_length, None);
    assert_eq!(ctx.record_data(long)["code"], json!("abcdef"));
    assert_eq!(ctx.record_data(short)["code"], json!("ab"));
    assert!(!ctx.record_data(short).contains_key("short_code"));

    let jobs = ctx.db.migration_jobs().unwrap();
    assert!(!jobs.is_empty());
    assert!(jobs.iter().all(|job| job.status != JobStatus::Completed));
    assert!(jobs.iter().all(|job| job.status != JobStatus::Running));
}

#[test]
fn test_partial_update_merges_into_stored_data() {
    let ctx = TestContext::new();
    ctx.field("A", FieldType::Number);
    ctx.field("B", FieldType::Number);
    let id = ctx.insert(json!({"a": 1, "b": 2}));

    let saved = ctx
        .db
        .save(ctx.pipeline_id, Some(id), data(json!({"b": 3})), &actor())
        .unwrap();
    assert!(matches!(saved.context, ValidationContext::Storage { .. }));
    assert_eq!(saved.record.version, 2);
    assert_eq!(ctx.record_data(id), data(json!({"a": 1, "b": 3})));

    let audit = ctx.audit.entries();
    let last = audit.last().unwrap();
    assert_eq!(last.op, AuditOp::RecordUpdated);
    assert_eq!(last.before, Some(json!({"a": 1, "b": 2})));
}

#[test]
fn test_cascade_levels_follow_dependency_chain() {
    let a = FieldDefinition::new(1, 1, FieldSpec::new("A", FieldType::Text)).unwrap();
    let b = FieldDefinition::new(2, 1, FieldSpec::new("B", FieldType::Text).with_rules(rule_on("a")))
        .unwrap();
    let c = FieldDefinition::new(3, 1, FieldSpec::new("C", FieldType::Text).with_rules(rule_on("b")))
        .unwrap();
    let graph = DependencyGraph::from_fields(&[a, b, c], None);

    let cascade = graph.cascade("a");
    let affected: Vec<&str> = cascade.affected.iter().map(|s| s.as_str()).collect();
    assert_eq!(affected, vec!["a", "b", "c"]);
    assert_eq!(cascade.level_of["a"], 0);
    assert_eq!(cascade.level_of["b"], 1);
    assert_eq!(cascade.level_of["c"], 2);
    assert!(graph.cycles().is_empty());
}

#[test]
fn test_cycles_are_reported_and_cascade_terminates() {
    let a = FieldDefinition::new(1, 1, FieldSpec::new("A", FieldType::Text).with_rules(rule_on("b")))
        .unwrap();
    let b = FieldDefinition::new(2, 1, FieldSpec::new("B", FieldType::Text).with_rules(rule_on("a")))
        .unwrap();
    let graph = DependencyGraph::from_fields(&[a, b], None);

    assert_eq!(graph.detect_cycles(), vec![vec!["a".to_string(), "b".to_string()]]);
    assert_eq!(graph.cascade("a").affected.len(), 2);
}

#[test]
fn test_classification_is_fail_closed() {
    let ctx = TestContext::new();
    let none = StorageConstraints::default();

    let decision = ctx.db.classify(FieldType::Text, FieldType::Number, &none, &none);
    assert!(matches!(decision, MigrationDecision::Risky { .. }));
    assert!(ctx.db.classify(FieldType::Text, FieldType::Textarea, &none, &none).is_safe());
    assert!(ctx
        .db
        .classify(FieldType::Relation, FieldType::Text, &none, &none)
        .is_denied());
    assert!(ctx
        .db
        .classify(FieldType::Boolean, FieldType::Email, &none, &none)
        .is_denied());
}

#[test]
fn test_preview_matches_live_migration() {
    let ctx = TestContext::new();
    let amount = ctx.field("Amount", FieldType::Text);
    ctx.insert(json!({"amount": "10"}));
    ctx.insert(json!({"amount": "ten"}));

    let changes = FieldChanges::default().change_type(FieldType::Number);
    let preview = ctx.db.preview_migration(amount.id, &changes, 10).unwrap();
    assert_eq!(preview.samples.len(), 2);
    assert_eq!(preview.risk_assessment.sample_failures, 1);
    assert_eq!(preview.risk_assessment.affected_record_estimate, 2);

    let dry = ctx
        .db
        .update_field(amount.id, &changes, &actor(), UpdateOptions::dry_run())
        .unwrap();
    assert!(!dry.committed);
    assert_eq!(dry.migration.unwrap().values_dropped, 1);
    assert_eq!(
        ctx.db.get_field(amount.id).unwrap().unwrap().field_type,
        FieldType::Text
    );
}

#[test]
fn test_restore_refused_when_slug_is_taken() {
    let ctx = TestContext::new();
    let phone = ctx.field("Phone", FieldType::Phone);
    ctx.db.delete_field(phone.id, &actor(), false).unwrap();
    ctx.field("Phone", FieldType::Text);

    let err = ctx.db.restore_field(phone.id, &actor()).unwrap_err();
    assert!(matches!(err, SchemaChangeError::NameCollision { .. }));
}

#[test]
fn test_interrupted_jobs_are_closed_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::new(StorageConfig::new(dir.path().join("data")));

    {
        let db = Database::open(config.clone()).unwrap();
        let jobs = JobStore::open(db.storage().db()).unwrap();
        jobs.save(&MigrationJob::new(1, 2, 3, 4, "type_change", "score", "score", 10))
            .unwrap();
        db.flush().unwrap();
    }

    let db = Database::open(config).unwrap();
    assert_eq!(db.recovered_jobs().len(), 1);
    assert_eq!(db.migration_jobs().unwrap()[0].status, JobStatus::RolledBack);
}

#[tokio::test]
async fn test_background_warnings_reach_sink() {
    let sink = Arc::new(MemoryWarningSink::new());
    let db = Database::open(EngineConfig::temporary())
        .unwrap()
        .with_warning_sink(sink.clone());
    let pipeline = db.create_pipeline("Deals", None, &actor()).unwrap();
    db.create_field(pipeline.id, FieldSpec::new("Amount", FieldType::Number), &actor())
        .unwrap();
    db.create_field(
        pipeline.id,
        FieldSpec::new("Note", FieldType::Text).with_rules(BusinessRules::default().with_rule(
            ConditionalRule::new(
                RuleAction::Warn,
                ConditionGroup::all(vec![Condition::is_not_empty("amount")]),
            )
            .with_message("explain large amounts"),
        )),
        &actor(),
    )
    .unwrap();

    let saved = db
        .save(pipeline.id, None, data(json!({"amount": 5000})), &actor())
        .unwrap();
    assert!(saved.background_scheduled);

    for _ in 0..50 {
        if !sink.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let reports = sink.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, saved.record.id);
    assert!(reports[0].1.warnings.contains_key("note"));
}

/// A database whose migration progress callback tries one record write
/// while the migration is still running.
struct MidMigrationWriter {
    db: Arc<Database>,
    pipeline_id: u64,
    armed: Arc<AtomicBool>,
    outcomes: Arc<parking_lot::Mutex<Vec<Result<u64, ValidationError>>>>,
}

impl MidMigrationWriter {
    fn new(late_write: Value) -> Self {
        let handle: Arc<OnceLock<Weak<Database>>> = Arc::new(OnceLock::new());
        let armed = Arc::new(AtomicBool::new(false));
        let outcomes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let pipeline_slot = Arc::new(OnceLock::new());

        let callback = {
            let handle = handle.clone();
            let armed = armed.clone();
            let outcomes = outcomes.clone();
            let pipeline_slot = pipeline_slot.clone();
            Arc::new(move |_: &MigrationProgress| {
                if !armed.swap(false, Ordering::SeqCst) {
                    return;
                }
                let (Some(db), Some(pipeline_id)) =
                    (handle.get().and_then(Weak::upgrade), pipeline_slot.get().copied())
                else {
                    return;
                };
                let outcome = db
                    .save(pipeline_id, None, data(late_write.clone()), &actor())
                    .map(|saved| saved.record.id);
                outcomes.lock().push(outcome);
            })
        };

        let config = EngineConfig::temporary().with_lock_timeout(Duration::from_millis(50));
        let db = Arc::new(Database::open(config).unwrap().with_progress(callback));
        handle.set(Arc::downgrade(&db)).unwrap();
        let pipeline_id = db.create_pipeline("Contacts", None, &actor()).unwrap().id;
        pipeline_slot.set(pipeline_id).unwrap();

        Self {
            db,
            pipeline_id,
            armed,
            outcomes,
        }
    }

    fn update(&self, field_id: u64, changes: &FieldChanges) {
        self.armed.store(true, Ordering::SeqCst);
        self.db
            .update_field(field_id, changes, &actor(), UpdateOptions::confirmed())
            .unwrap();
    }
}

#[test]
fn test_record_write_waits_for_rename_migration() {
    let ctx = MidMigrationWriter::new(json!({"email": "late@x.io"}));
    let field = ctx
        .db
        .create_field(ctx.pipeline_id, FieldSpec::new("Email", FieldType::Email), &actor())
        .unwrap();
    ctx.db
        .save(ctx.pipeline_id, None, data(json!({"email": "ana@x.io"})), &actor())
        .unwrap();

    ctx.update(field.id, &FieldChanges::default().rename("Email Address"));

    let outcomes = ctx.outcomes.lock();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], Err(ValidationError::ConcurrentModification(_))));
    drop(outcomes);

    let storage = ctx.db.storage();
    assert_eq!(storage.count_records_with_key(ctx.pipeline_id, "email").unwrap(), 0);
    assert_eq!(storage.count_records_with_key(ctx.pipeline_id, "email_address").unwrap(), 1);

    // Once the migration commits, writes see the renamed field.
    assert!(ctx
        .db
        .save(ctx.pipeline_id, None, data(json!({"email": "late@x.io"})), &actor())
        .is_err());
    ctx.db
        .save(ctx.pipeline_id, None, data(json!({"email_address": "late@x.io"})), &actor())
        .unwrap();
    assert_eq!(storage.count_records_with_key(ctx.pipeline_id, "email_address").unwrap(), 2);
}

#[test]
fn test_record_write_waits_for_type_change_migration() {
    let ctx = MidMigrationWriter::new(json!({"score": "abc"}));
    let field = ctx
        .db
        .create_field(ctx.pipeline_id, FieldSpec::new("Score", FieldType::Text), &actor())
        .unwrap();
    let first = ctx
        .db
        .save(ctx.pipeline_id, None, data(json!({"score": "42"})), &actor())
        .unwrap()
        .record
        .id;

    ctx.update(field.id, &FieldChanges::default().change_type(FieldType::Number));

    let outcomes = ctx.outcomes.lock();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], Err(ValidationError::ConcurrentModification(_))));
    drop(outcomes);

    let records: Vec<_> = ctx
        .db
        .storage()
        .scan_records(ctx.pipeline_id)
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, first);
    assert_eq!(records[0].data["score"], json!(42));

    let err = ctx
        .db
        .save(ctx.pipeline_id, None, data(json!({"score": "abc"})), &actor())
        .unwrap_err();
    assert!(err.errors_for("score").is_some());
}
