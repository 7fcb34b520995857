use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use tracing::debug;

pub const QUEUE_CONFIG_PATHS: [&str; 2] = ["app/workers/all_queues.yml", "ee/app/workers/all_queues.yml"];

/// Static description of one worker class and the queue it consumes.
///
/// The catalog is generated by the application as Ruby-flavoured YAML, so
/// keys and enum-like values may carry a leading `:` (`:urgency: :high`).
/// Both spellings are accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct WorkerMetadata {
    #[serde(alias = ":name", deserialize_with = "symbol")]
    pub name: String,
    #[serde(default, alias = ":worker_name", deserialize_with = "optional_symbol")]
    pub worker_name: Option<String>,
    #[serde(default, alias = ":feature_category", deserialize_with = "optional_symbol")]
    pub feature_category: Option<String>,
    #[serde(default, alias = ":has_external_dependencies", deserialize_with = "flag")]
    pub has_external_dependencies: bool,
    #[serde(default, alias = ":urgency", deserialize_with = "optional_symbol")]
    pub urgency: Option<String>,
    #[serde(default, alias = ":resource_boundary", deserialize_with = "optional_symbol")]
    pub resource_boundary: Option<String>,
    #[serde(default, alias = ":weight")]
    pub weight: Option<u32>,
    #[serde(default, alias = ":idempotent", deserialize_with = "flag")]
    pub idempotent: bool,
    #[serde(default, alias = ":tags", deserialize_with = "symbols")]
    pub tags: Vec<String>,
}

impl WorkerMetadata {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueCatalog {
    workers: Vec<WorkerMetadata>,
}

impl QueueCatalog {
    pub fn new(workers: Vec<WorkerMetadata>) -> Self {
        Self { workers }
    }

    pub fn load(directory: &Path) -> Result<Self> {
        let mut workers = Vec::new();
        for relative in QUEUE_CONFIG_PATHS {
            let path = directory.join(relative);
            if !path.exists() {
                debug!("queue catalog {} not found, skipping", path.display());
                continue;
            }

            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read queue catalog {}", path.display()))?;
            workers.extend(parse_catalog(&content).with_context(|| {
                format!("failed to parse queue catalog {}", path.display())
            })?);
        }

        Ok(Self { workers })
    }

    pub fn workers(&self) -> &[WorkerMetadata] {
        &self.workers
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.workers.iter().map(|worker| worker.name.clone()).collect()
    }
}

pub fn parse_catalog(content: &str) -> Result<Vec<WorkerMetadata>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    let workers: Option<Vec<WorkerMetadata>> = serde_yaml::from_str(content)?;
    Ok(workers.unwrap_or_default())
}

fn strip_symbol(value: &str) -> String {
    value.strip_prefix(':').unwrap_or(value).to_string()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Bool(bool),
    Int(i64),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Text(text) => strip_symbol(&text),
            Scalar::Bool(value) => value.to_string(),
            Scalar::Int(value) => value.to_string(),
        }
    }
}

fn symbol<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Scalar::deserialize(deserializer)?.into_string())
}

fn optional_symbol<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Ok(Option::<Scalar>::deserialize(deserializer)?.map(Scalar::into_string))
}

fn symbols<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let values = Option::<Vec<Scalar>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(values.into_iter().map(Scalar::into_string).collect())
}

// `nil` and absent both mean false.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{parse_catalog, QueueCatalog};

    const RUBY_CATALOG: &str = r#"---
- :name: authorized_projects
  :worker_name: AuthorizedProjectsWorker
  :feature_category: :authentication_and_authorization
  :has_external_dependencies:
  :urgency: :high
  :resource_boundary: :unknown
  :weight: 2
  :idempotent: true
  :tags: []
- :name: chat_notification
  :worker_name: ChatNotificationWorker
  :feature_category: :chatops
  :has_external_dependencies: true
  :urgency: :low
  :resource_boundary: :unknown
  :weight: 2
  :idempotent:
  :tags:
  - :exclude_from_kubernetes
"#;

    #[test]
    fn parses_ruby_symbol_catalog() {
        let workers = parse_catalog(RUBY_CATALOG).expect("expected catalog to parse");
        assert_eq!(workers.len(), 2);

        let first = &workers[0];
        assert_eq!(first.name, "authorized_projects");
        assert_eq!(first.worker_name.as_deref(), Some("AuthorizedProjectsWorker"));
        assert_eq!(
            first.feature_category.as_deref(),
            Some("authentication_and_authorization")
        );
        assert!(!first.has_external_dependencies);
        assert_eq!(first.urgency.as_deref(), Some("high"));
        assert_eq!(first.weight, Some(2));
        assert!(first.idempotent);
        assert!(first.tags.is_empty());

        let second = &workers[1];
        assert!(second.has_external_dependencies);
        assert!(!second.idempotent);
        assert_eq!(second.tags, vec!["exclude_from_kubernetes".to_string()]);
    }

    #[test]
    fn parses_plain_keys() {
        let workers = parse_catalog("- name: mailers\n  urgency: low\n")
            .expect("expected plain catalog to parse");
        assert_eq!(workers[0].name, "mailers");
        assert_eq!(workers[0].urgency.as_deref(), Some("low"));
        assert_eq!(workers[0].feature_category, None);
    }

    #[test]
    fn empty_document_is_an_empty_catalog() {
        assert!(parse_catalog("").expect("empty parses").is_empty());
        assert!(parse_catalog("---\n").expect("null parses").is_empty());
    }

    #[test]
    fn load_concatenates_ce_and_ee_catalogs() {
        let root = tempfile::tempdir().expect("failed to create temp dir");
        fs::create_dir_all(root.path().join("app/workers")).expect("mkdir app");
        fs::create_dir_all(root.path().join("ee/app/workers")).expect("mkdir ee");
        fs::write(
            root.path().join("app/workers/all_queues.yml"),
            "- :name: merge\n- :name: mailers\n",
        )
        .expect("write ce catalog");
        fs::write(
            root.path().join("ee/app/workers/all_queues.yml"),
            "- :name: epics:epics_update_epics_dates\n",
        )
        .expect("write ee catalog");

        let catalog = QueueCatalog::load(root.path()).expect("expected catalog to load");
        assert_eq!(
            catalog.queue_names(),
            vec!["merge", "mailers", "epics:epics_update_epics_dates"]
        );
    }

    #[test]
    fn load_without_catalog_files_is_empty() {
        let root = tempfile::tempdir().expect("failed to create temp dir");
        let catalog = QueueCatalog::load(root.path()).expect("expected empty catalog");
        assert!(catalog.workers().is_empty());
    }
}
