//! 📋 Jobs and ingest documents: what to ingest, and how to shape it.
//!
//! A job is a list of [`IngestDocument`]s. Each one names a builder type, a template,
//! and the parameters that builder needs. Jobs come from a spec file (TOML or JSON) or
//! from the store itself (`JOB:<id>`, whose ingest documents are fetched by id).
//!
//! Before any worker starts, [`JobSpec::validate`] parses every template and checks every
//! handler name against the builder type's capability set. A typo in a handler name
//! stops the run right there, not forty minutes in.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Format, Json, Toml},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::app_config::JobConfig;
use crate::assemblers::{CompiledDocument, nested_rows, row_per_document};
use crate::backends::{Store, StoreBackend};
use crate::template::{HandlerRegistry, TemplateError};

/// 💀 Setup mistakes. All of them are fatal and all of them happen before workers start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "💀 ingest document '{document}' calls '&{handler}', which builder type '{builder_type}' does not provide"
    )]
    UnknownHandler {
        document: String,
        handler: String,
        builder_type: String,
    },

    #[error("💀 ingest document '{document}' has a malformed template: {source}")]
    MalformedTemplate {
        document: String,
        #[source]
        source: TemplateError,
    },

    #[error("💀 {0} is required but missing")]
    MissingField(String),

    #[error("💀 no ingest document with id '{0}' in this job")]
    UnknownIngestDocument(String),

    #[error("💀 ingest document id '{0}' appears more than once")]
    DuplicateIngestDocument(String),

    #[error("💀 job '{0}' has no ingest documents, so there is nothing to do")]
    NoWork(String),
}

/// 🏗️ Which assembler an ingest document needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuilderType {
    /// One row → one document (per-level model output, profiles).
    RowPerDocument,
    /// Many rows → one document's nested `data` map (station- or time-indexed bodies).
    NestedRows,
}

impl BuilderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuilderType::RowPerDocument => "row_per_document",
            BuilderType::NestedRows => "nested_rows",
        }
    }

    /// 🧰 The handler capability set this builder type declares.
    pub fn handler_registry(&self) -> HandlerRegistry {
        let mut registry = HandlerRegistry::common();
        match self {
            BuilderType::RowPerDocument => row_per_document::register_handlers(&mut registry),
            BuilderType::NestedRows => nested_rows::register_handlers(&mut registry),
        }
        registry
    }
}

impl std::fmt::Display for BuilderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 📄 One unit-of-work type: builder, template, parameters. Immutable for the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestDocument {
    pub id: String,
    pub builder_type: BuilderType,
    #[serde(default)]
    pub subset: String,
    /// Nested mapping of literals, `*variables` and `&function|..` strings. Must have `id`.
    pub template: Value,
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Dotted template paths whose composites tolerate missing pieces.
    #[serde(default)]
    pub optional_fields: Vec<String>,
    /// Identifier-based work: these ids are the work list, no filesystem involved.
    #[serde(default)]
    pub record_ids: Vec<String>,
    #[serde(default)]
    pub input_dir: Option<PathBuf>,
    #[serde(default)]
    pub file_pattern: Option<String>,
    #[serde(default)]
    pub file_mask: Option<String>,
}

/// 📋 Everything one run needs to know about what to ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: String,
    #[serde(default)]
    pub subset: String,
    pub ingest_documents: Vec<IngestDocument>,
}

impl JobSpec {
    pub fn ingest_document(&self, id: &str) -> Option<&IngestDocument> {
        self.ingest_documents.iter().find(|doc| doc.id == id)
    }

    /// Ingest documents without a subset inherit the job's.
    fn normalize(mut self) -> Self {
        for document in &mut self.ingest_documents {
            if document.subset.is_empty() {
                document.subset = self.subset.clone();
            }
        }
        self
    }

    /// ✅ Parse every template and check every handler name. Fail fast, fail here.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ingest_documents.is_empty() {
            return Err(ConfigError::NoWork(self.id.clone()));
        }
        let mut seen = HashSet::new();
        for document in &self.ingest_documents {
            if !seen.insert(document.id.as_str()) {
                return Err(ConfigError::DuplicateIngestDocument(document.id.clone()));
            }
            let compiled = CompiledDocument::compile(document)?;
            let registry = document.builder_type.handler_registry();
            if let Some(handler) = compiled
                .handler_names()
                .into_iter()
                .find(|name| !registry.contains(name))
            {
                return Err(ConfigError::UnknownHandler {
                    document: document.id.clone(),
                    handler: handler.to_string(),
                    builder_type: document.builder_type.to_string(),
                });
            }
            debug!(
                "✅ ingest document '{}' validated against the {} capability set",
                document.id, document.builder_type
            );
        }
        Ok(())
    }
}

/// 📥 Load the job named by the config: spec file first, store lookup otherwise.
pub(crate) async fn load_job(job_config: &JobConfig, store: &mut StoreBackend) -> Result<JobSpec> {
    let job = match (&job_config.spec_file, &job_config.id) {
        (Some(spec_file), _) => load_job_file(spec_file)?,
        (None, Some(job_id)) => load_job_from_store(job_id, store).await?,
        (None, None) => {
            return Err(ConfigError::MissingField("job.id or job.spec_file".into()).into());
        }
    };
    info!(
        "📋 job '{}' loaded with {} ingest document(s)",
        job.id,
        job.ingest_documents.len()
    );
    Ok(job.normalize())
}

/// Reads a TOML or JSON job spec.
pub fn load_job_file(path: &Path) -> Result<JobSpec> {
    if !path.exists() {
        bail!(
            "💀 Job spec '{}' does not exist. We checked. Twice. Relative paths are relative to \
             wherever you launched from, which is rarely where you think.",
            path.display()
        );
    }
    let is_json = path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let figment = if is_json {
        Figment::new().merge(Json::file(path))
    } else {
        Figment::new().merge(Toml::file(path))
    };
    let job: JobSpec = figment
        .extract()
        .context(format!("💀 Job spec '{}' did not parse", path.display()))?;
    Ok(job.normalize())
}

/// A job as it sits in the store: a subset and a list of ingest document ids.
#[derive(Debug, Deserialize)]
struct StoredJob {
    #[serde(default)]
    subset: String,
    ingest_document_ids: Vec<String>,
}

async fn load_job_from_store(job_id: &str, store: &mut StoreBackend) -> Result<JobSpec> {
    let key = if job_id.starts_with("JOB:") {
        job_id.to_string()
    } else {
        format!("JOB:{job_id}")
    };
    let raw = store
        .get(&key)
        .await
        .context(format!("💀 Could not fetch job '{key}' from the store"))?;
    let stored: StoredJob =
        serde_json::from_value(raw).context(format!("💀 Job '{key}' is not shaped like a job"))?;

    let mut ingest_documents = Vec::with_capacity(stored.ingest_document_ids.len());
    for document_id in &stored.ingest_document_ids {
        let raw = store
            .get(document_id)
            .await
            .context(format!("💀 Job '{key}' references ingest document '{document_id}'"))?;
        let document: IngestDocument = serde_json::from_value(raw)
            .context(format!("💀 Ingest document '{document_id}' did not parse"))?;
        ingest_documents.push(document);
    }
    Ok(JobSpec {
        id: job_id.to_string(),
        subset: stored.subset,
        ingest_documents,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryStore;
    use serde_json::json;

    const SPEC: &str = r#"
        id = "METAR-hourly"
        subset = "METAR"

        [[ingest_documents]]
        id = "MD:V01:METAR:obs"
        builder_type = "nested_rows"
        input_dir = "/data/metar"
        file_pattern = "*.json"

        [ingest_documents.params]
        interval = 3600
        data_key = "*name"

        [ingest_documents.template]
        id = "DD:V01:METAR:obs:&valid_epoch|time,3600"
        type = "DD"

        [ingest_documents.template.data]
        name = "*name"
        temperature = "&round|2:*temp"
    "#;

    #[test]
    fn the_one_where_a_toml_spec_parses_and_validates() {
        let job: JobSpec = toml::from_str::<JobSpec>(SPEC).unwrap().normalize();
        assert_eq!(job.ingest_documents.len(), 1);
        assert_eq!(job.ingest_documents[0].subset, "METAR");
        assert_eq!(job.ingest_documents[0].builder_type, BuilderType::NestedRows);
        job.validate().expect("💀 a well-formed job should validate");
    }

    #[test]
    fn the_one_where_a_handler_from_the_wrong_builder_is_refused() {
        let mut job: JobSpec = toml::from_str(SPEC).unwrap();
        job.ingest_documents[0].template["levels"] = json!("&column|pressure");
        let err = job.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownHandler { ref handler, .. } if handler == "column"
        ));
    }

    #[test]
    fn the_one_where_malformed_templates_are_configuration_errors() {
        let mut job: JobSpec = toml::from_str(SPEC).unwrap();
        job.ingest_documents[0].template["type"] = json!("DD:*");
        assert!(matches!(job.validate(), Err(ConfigError::MalformedTemplate { .. })));
    }

    #[test]
    fn the_one_where_duplicates_and_empty_jobs_are_rejected() {
        let mut job: JobSpec = toml::from_str(SPEC).unwrap();
        let twin = job.ingest_documents[0].clone();
        job.ingest_documents.push(twin);
        assert!(matches!(job.validate(), Err(ConfigError::DuplicateIngestDocument(_))));

        job.ingest_documents.clear();
        assert!(matches!(job.validate(), Err(ConfigError::NoWork(_))));
    }

    #[test]
    fn the_one_where_a_json_spec_file_loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        let job: JobSpec = toml::from_str(SPEC).unwrap();
        std::fs::write(&path, serde_json::to_vec(&job).unwrap()).unwrap();

        let loaded = load_job_file(&path).unwrap();
        assert_eq!(loaded.id, "METAR-hourly");
        assert!(load_job_file(&dir.path().join("nope.toml")).is_err());
    }

    #[tokio::test]
    async fn the_one_where_the_job_lives_in_the_store() {
        let store = InMemoryStore::default();
        let job: JobSpec = toml::from_str(SPEC).unwrap();
        store
            .insert("JOB:METAR-hourly", json!({"subset": "METAR", "ingest_document_ids": ["MD:V01:METAR:obs"]}))
            .await;
        store
            .insert("MD:V01:METAR:obs", serde_json::to_value(&job.ingest_documents[0]).unwrap())
            .await;

        let mut backend = StoreBackend::InMemory(store);
        let config = JobConfig {
            id: Some("METAR-hourly".into()),
            ..JobConfig::default()
        };
        let loaded = load_job(&config, &mut backend).await.unwrap();
        assert_eq!(loaded.subset, "METAR");
        assert_eq!(loaded.ingest_documents[0].id, "MD:V01:METAR:obs");
    }

    #[tokio::test]
    async fn the_one_where_no_job_source_is_a_config_error() {
        let mut backend = StoreBackend::InMemory(InMemoryStore::default());
        let err = load_job(&JobConfig::default(), &mut backend).await.unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }
}
