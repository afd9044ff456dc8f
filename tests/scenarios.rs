//! End-to-end scenarios S1-S6, exercising the public `Core` API only.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use lifecycle_core::clock::SystemClock;
use lifecycle_core::config::InheritancePolicy;
use lifecycle_core::core::Collaborators;
use lifecycle_core::migrations::{Direction, MigrationExecutor};
use lifecycle_core::registry::model::{
    ConfigFieldSchema, DependencyKind, FieldConstraints, FieldType, ModuleDefinition, ModuleDependency,
    MigrationDefinition, OperationKind, PerformanceEnvelope, RegistrationSource,
};
use lifecycle_core::registry::ConflictResolution;
use lifecycle_core::security::{AuthContext, SecurityPolicy};
use lifecycle_core::settings::CoreConfig;
use lifecycle_core::testing::{InMemoryPersistence, StaticSystemProbe};
use lifecycle_core::{Core, CoreError};

struct NoopExecutor;

#[async_trait]
impl MigrationExecutor for NoopExecutor {
    async fn execute_op(
        &self,
        _module_id: &str,
        _migration_id: &str,
        _kind: OperationKind,
        _direction: Direction,
    ) -> Result<Value, CoreError> {
        Ok(Value::Null)
    }
}

struct FailingSecondOp;

#[async_trait]
impl MigrationExecutor for FailingSecondOp {
    async fn execute_op(
        &self,
        _module_id: &str,
        migration_id: &str,
        _kind: OperationKind,
        direction: Direction,
    ) -> Result<Value, CoreError> {
        if migration_id == "mig2" && direction == Direction::Forward {
            return Err(CoreError::MigrationError {
                migration_id: migration_id.to_owned(),
                message: "post-validation failed".to_owned(),
            });
        }
        Ok(Value::Null)
    }
}

fn build_core() -> Core {
    let persistence = Arc::new(InMemoryPersistence::new());
    let clock = Arc::new(SystemClock);
    let probe = Arc::new(StaticSystemProbe);
    let events = Arc::new(lifecycle_core::testing::RecordingEventSink::new());
    Core::new(
        Collaborators { persistence, clock, probe, events },
        &CoreConfig::default(),
        vec![],
    )
}

fn module_m1() -> ModuleDefinition {
    let mut config_schema = HashMap::new();
    config_schema.insert(
        "maxTokens".to_owned(),
        ConfigFieldSchema {
            field_type: FieldType::Number,
            constraints: FieldConstraints::default(),
            sensitive: false,
            inheritable: true,
            default: Some(json!(100)),
        },
    );
    ModuleDefinition {
        id: "M1".to_owned(),
        version: "1.0.0".to_owned(),
        name: "Module One".to_owned(),
        description: String::new(),
        author: String::new(),
        license: "MIT".to_owned(),
        capabilities: vec![],
        dependencies: vec![],
        integration_points: vec![],
        config_schema,
        default_config: HashMap::from([("maxTokens".to_owned(), json!(100))]),
        migrations: vec![MigrationDefinition {
            id: "create_table_users".to_owned(),
            version: "1".to_owned(),
            dependencies: vec![],
            forward_ops: vec![OperationKind::CreateTable],
            reverse_ops: vec![],
            performance: PerformanceEnvelope::default(),
            automatic_rollback: false,
        }],
        rollback_operations: vec![],
    }
}

fn auth(tenant: &str) -> AuthContext {
    AuthContext {
        tenant_id: tenant.to_owned(),
        actor_id: "actor1".to_owned(),
        session_id: "sess1".to_owned(),
        source: "test".to_owned(),
    }
}

#[tokio::test]
async fn s1_happy_activation() {
    let core = build_core();
    core.registry
        .register(module_m1(), RegistrationSource::Manual, ConflictResolution::Manual)
        .await
        .unwrap();

    let mut overlay = Map::new();
    overlay.insert("maxTokens".to_owned(), json!(1000));
    let result = core
        .orchestrator
        .activate("M1", "tA", overlay, &auth("tA"), &[], Arc::new(NoopExecutor))
        .await;

    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.state, lifecycle_core::orchestrator::ActivationState::Active);

    let version = core.config.get_all("tA", "M1").await.unwrap();
    assert_eq!(version["maxTokens"], json!(1000));
}

#[tokio::test]
async fn s2_dependency_gate() {
    let core = build_core();
    core.registry
        .register(module_m1(), RegistrationSource::Manual, ConflictResolution::Manual)
        .await
        .unwrap();

    let mut m2 = module_m1();
    m2.id = "M2".to_owned();
    m2.migrations = vec![];
    m2.dependencies = vec![ModuleDependency {
        module_id: "M1".to_owned(),
        version_req: "^1".to_owned(),
        kind: DependencyKind::Required,
    }];
    core.registry
        .register(m2, RegistrationSource::Manual, ConflictResolution::Manual)
        .await
        .unwrap();

    let result = core
        .orchestrator
        .activate("M2", "tA", Map::new(), &auth("tA"), &[], Arc::new(NoopExecutor))
        .await;

    assert!(!result.success);
    assert!(result.errors[0].message.contains("M1"));
}

#[tokio::test]
async fn s3_idempotent_reactivation() {
    let core = build_core();
    core.registry
        .register(module_m1(), RegistrationSource::Manual, ConflictResolution::Manual)
        .await
        .unwrap();

    let mut overlay = Map::new();
    overlay.insert("maxTokens".to_owned(), json!(1000));
    core.orchestrator
        .activate("M1", "tA", overlay.clone(), &auth("tA"), &[], Arc::new(NoopExecutor))
        .await;

    let before = core.config.history("tA", "M1").await.unwrap().len();
    let second = core
        .orchestrator
        .activate("M1", "tA", overlay, &auth("tA"), &[], Arc::new(NoopExecutor))
        .await;
    let after = core.config.history("tA", "M1").await.unwrap().len();

    assert!(second.success);
    assert_eq!(before, after, "re-activation with identical config should not grow history");
}

#[tokio::test]
async fn s4_activation_failure_triggers_rollback() {
    let core = build_core();
    let mut m3 = module_m1();
    m3.id = "M3".to_owned();
    m3.migrations = vec![
        MigrationDefinition {
            id: "mig1".to_owned(),
            version: "1".to_owned(),
            dependencies: vec![],
            forward_ops: vec![OperationKind::CreateTable],
            reverse_ops: vec![OperationKind::Custom],
            performance: PerformanceEnvelope::default(),
            automatic_rollback: true,
        },
        MigrationDefinition {
            id: "mig2".to_owned(),
            version: "1".to_owned(),
            dependencies: vec![],
            forward_ops: vec![OperationKind::AddColumn],
            reverse_ops: vec![OperationKind::Custom],
            performance: PerformanceEnvelope::default(),
            automatic_rollback: true,
        },
    ];
    core.registry
        .register(m3, RegistrationSource::Manual, ConflictResolution::Manual)
        .await
        .unwrap();

    let result = core
        .orchestrator
        .activate("M3", "tA", Map::new(), &auth("tA"), &[], Arc::new(FailingSecondOp))
        .await;

    assert!(!result.success);
    assert_eq!(
        core.orchestrator.status("M3", "tA"),
        lifecycle_core::orchestrator::ActivationState::Inactive
    );
}

#[tokio::test]
async fn s5_config_schema_violation() {
    let core = build_core();
    core.registry
        .register(module_m1(), RegistrationSource::Manual, ConflictResolution::Manual)
        .await
        .unwrap();

    let mut overlay = Map::new();
    overlay.insert("maxTokens".to_owned(), json!("oops"));
    let result = core
        .orchestrator
        .activate("M1", "tA", overlay, &auth("tA"), &[], Arc::new(NoopExecutor))
        .await;

    assert!(!result.success);
    assert!(result.errors[0].message.contains("maxTokens"));
}

#[tokio::test]
async fn s6_cross_tenant_isolation() {
    let core = build_core();
    core.security.set_policy("tA", SecurityPolicy::default());
    let data = json!({ "tenantId": "tA", "secret": 1 });
    let sanitized = core.security.sanitize("tA", &data, &auth("tB"));
    assert!(sanitized.is_null());

    let err = core
        .security
        .authorize(&auth("tB"), "tA", lifecycle_core::security::Operation::DataExport)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), lifecycle_core::ErrorKind::PermissionDenied);

    core.registry
        .register(module_m1(), RegistrationSource::Manual, ConflictResolution::Manual)
        .await
        .unwrap();
    core.config.set_policy("tIso", InheritancePolicy::isolated());

    core.orchestrator
        .activate("M1", "tIso", Map::new(), &auth("tIso"), &[], Arc::new(NoopExecutor))
        .await;
    core.orchestrator
        .activate("M1", "tDefault", Map::new(), &auth("tDefault"), &[], Arc::new(NoopExecutor))
        .await;

    let isolated = core.config.get_all("tIso", "M1").await.unwrap();
    let inherited = core.config.get_all("tDefault", "M1").await.unwrap();
    assert!(!isolated.contains_key("maxTokens"), "isolated tenant must not inherit module defaults");
    assert_eq!(inherited["maxTokens"], json!(100));
}
