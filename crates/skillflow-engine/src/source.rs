use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use futures::future::BoxFuture;
use tracing::{debug, info};

use skillflow_core::error::{Result, SkillflowError};
use skillflow_core::traits::SchemaSource;
use skillflow_core::types::SchemaDefinition;

use crate::plan::{compile, ExecutionPlan};

/// Reads `<root>/<schema_id>/schema.json`.
///
/// Skills with a `prompt_file` and no inline prompt get the file's
/// contents, resolved relative to the schema's directory.
pub struct DirectorySchemaSource {
    root: PathBuf,
}

impl DirectorySchemaSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read(&self, schema_id: &str) -> Result<SchemaDefinition> {
        if schema_id.is_empty()
            || schema_id.contains(['/', '\\'])
            || schema_id.starts_with('.')
        {
            return Err(SkillflowError::SchemaNotFound(schema_id.to_string()));
        }

        let dir = self.root.join(schema_id);
        let path = dir.join("schema.json");
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SkillflowError::SchemaNotFound(schema_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut schema: SchemaDefinition = serde_json::from_str(&text)?;
        if schema.schema_id != schema_id {
            return Err(SkillflowError::SchemaInvalid {
                schema_id: schema_id.to_string(),
                violations: vec![format!(
                    "schema_id '{}' does not match directory '{}'",
                    schema.schema_id, schema_id
                )],
            });
        }

        for skill in &mut schema.skills {
            let Some(file) = skill.prompt_file.as_ref() else {
                continue;
            };
            if !skill.prompt.is_empty() {
                continue;
            }
            let prompt_path = dir.join(file);
            skill.prompt = tokio::fs::read_to_string(&prompt_path).await.map_err(|e| {
                SkillflowError::SchemaInvalid {
                    schema_id: schema_id.to_string(),
                    violations: vec![format!(
                        "skill '{}': cannot read prompt file {}: {}",
                        skill.id,
                        prompt_path.display(),
                        e
                    )],
                }
            })?;
        }

        debug!(schema_id, version = %schema.version, skills = schema.skills.len(), "Loaded schema");
        Ok(schema)
    }
}

impl SchemaSource for DirectorySchemaSource {
    fn load(&self, schema_id: &str) -> BoxFuture<'_, Result<SchemaDefinition>> {
        let schema_id = schema_id.to_string();
        Box::pin(async move { self.read(&schema_id).await })
    }
}

/// Schemas held in memory. Inserting a schema replaces the previous
/// definition with the same id.
#[derive(Default)]
pub struct StaticSchemaSource {
    schemas: RwLock<HashMap<String, SchemaDefinition>>,
}

impl StaticSchemaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(self, schema: SchemaDefinition) -> Self {
        self.insert(schema);
        self
    }

    pub fn insert(&self, schema: SchemaDefinition) {
        if let Ok(mut schemas) = self.schemas.write() {
            schemas.insert(schema.schema_id.clone(), schema);
        }
    }
}

impl SchemaSource for StaticSchemaSource {
    fn load(&self, schema_id: &str) -> BoxFuture<'_, Result<SchemaDefinition>> {
        let found = self
            .schemas
            .read()
            .ok()
            .and_then(|schemas| schemas.get(schema_id).cloned());
        let schema_id = schema_id.to_string();
        Box::pin(async move { found.ok_or(SkillflowError::SchemaNotFound(schema_id)) })
    }
}

/// Compiled plans keyed by `(schema_id, version)`.
pub struct PlanCache {
    source: Arc<dyn SchemaSource>,
    plans: Mutex<HashMap<(String, String), Arc<ExecutionPlan>>>,
}

impl PlanCache {
    pub fn new(source: Arc<dyn SchemaSource>) -> Self {
        Self {
            source,
            plans: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, schema_id: &str, version: &str) -> Option<Arc<ExecutionPlan>> {
        self.plans
            .lock()
            .ok()?
            .get(&(schema_id.to_string(), version.to_string()))
            .cloned()
    }

    fn store(&self, plan: ExecutionPlan) -> Arc<ExecutionPlan> {
        let plan = Arc::new(plan);
        if let Ok(mut plans) = self.plans.lock() {
            plans.insert(
                (plan.schema_id.clone(), plan.version.clone()),
                Arc::clone(&plan),
            );
        }
        plan
    }

    /// Plan for the version the source serves now.
    pub async fn current(&self, schema_id: &str) -> Result<Arc<ExecutionPlan>> {
        let schema = self.source.load(schema_id).await?;
        if let Some(plan) = self.cached(schema_id, &schema.version) {
            return Ok(plan);
        }
        let plan = compile(&schema)?;
        info!(
            schema_id,
            version = %plan.version,
            groups = plan.len(),
            skills = plan.skill_count(),
            "Compiled execution plan"
        );
        Ok(self.store(plan))
    }

    /// Plan for a specific version, as recorded on a checkpoint.
    pub async fn for_version(&self, schema_id: &str, version: &str) -> Result<Arc<ExecutionPlan>> {
        if let Some(plan) = self.cached(schema_id, version) {
            return Ok(plan);
        }
        let schema = self.source.load(schema_id).await?;
        if schema.version != version {
            return Err(SkillflowError::PlanVersionMismatch {
                schema_id: schema_id.to_string(),
                expected: version.to_string(),
                actual: schema.version,
            });
        }
        Ok(self.store(compile(&schema)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skillflow_core::types::SkillDescriptor;

    fn schema(version: &str) -> SchemaDefinition {
        SchemaDefinition::new("invoice", version).with_skill(SkillDescriptor::new("title"))
    }

    fn write_schema(root: &Path, id: &str, body: &str) {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("schema.json"), body).unwrap();
    }

    #[tokio::test]
    async fn test_directory_source_resolves_prompt_file() {
        let root = tempfile::tempdir().unwrap();
        write_schema(
            root.path(),
            "invoice",
            r#"{
                "schema_id": "invoice",
                "version": "4",
                "skills": [
                    {"id": "title", "prompt_file": "prompts/title.md"},
                    {"id": "total", "prompt": "inline", "group": 2}
                ]
            }"#,
        );
        std::fs::create_dir_all(root.path().join("invoice/prompts")).unwrap();
        std::fs::write(root.path().join("invoice/prompts/title.md"), "Find the title").unwrap();

        let source = DirectorySchemaSource::new(root.path());
        let loaded = source.load("invoice").await.unwrap();
        assert_eq!(loaded.version, "4");
        assert_eq!(loaded.skills[0].prompt, "Find the title");
        assert_eq!(loaded.skills[1].prompt, "inline");
    }

    #[tokio::test]
    async fn test_directory_source_missing_schema() {
        let root = tempfile::tempdir().unwrap();
        let source = DirectorySchemaSource::new(root.path());
        assert!(matches!(
            source.load("nope").await,
            Err(SkillflowError::SchemaNotFound(_))
        ));
        assert!(matches!(
            source.load("../etc").await,
            Err(SkillflowError::SchemaNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_directory_source_id_mismatch() {
        let root = tempfile::tempdir().unwrap();
        write_schema(root.path(), "a", r#"{"schema_id": "b", "skills": []}"#);
        let source = DirectorySchemaSource::new(root.path());
        assert!(matches!(
            source.load("a").await,
            Err(SkillflowError::SchemaInvalid { .. })
        ));
    }

    #[tokio::test]
    async fn test_plan_cache_reuses_compiled_plan() {
        let source = Arc::new(StaticSchemaSource::new().with_schema(schema("1")));
        let cache = PlanCache::new(source);
        let first = cache.current("invoice").await.unwrap();
        let second = cache.current("invoice").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_plan_cache_version_mismatch() {
        let source = Arc::new(StaticSchemaSource::new().with_schema(schema("1")));
        let cache = PlanCache::new(Arc::clone(&source) as Arc<dyn SchemaSource>);

        // Version 1 compiled and cached, then the source moves on.
        cache.current("invoice").await.unwrap();
        source.insert(schema("2"));
        assert_eq!(cache.for_version("invoice", "1").await.unwrap().version, "1");

        let fresh = PlanCache::new(source);
        match fresh.for_version("invoice", "1").await {
            Err(SkillflowError::PlanVersionMismatch { expected, actual, .. }) => {
                assert_eq!(expected, "1");
                assert_eq!(actual, "2");
            }
            other => panic!("expected PlanVersionMismatch, got {:?}", other.map(|p| p.version.clone())),
        }
    }

    #[tokio::test]
    async fn test_invalid_schema_surfaces_every_violation() {
        let bad = SchemaDefinition::new("invoice", "1")
            .with_skill(SkillDescriptor::new("a").with_group(0))
            .with_skill(SkillDescriptor::new("a").with_timeout_ms(0));
        let cache = PlanCache::new(Arc::new(StaticSchemaSource::new().with_schema(bad)));
        match cache.current("invoice").await {
            Err(SkillflowError::SchemaInvalid { violations, .. }) => assert_eq!(violations.len(), 3),
            other => panic!("expected SchemaInvalid, got {:?}", other.map(|_| ())),
        }
    }
}
