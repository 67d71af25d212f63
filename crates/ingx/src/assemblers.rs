//! 🏗️ Assemblers: templates in, documents out.
//!
//! 🎬 *[a dataset with 412 rows enters. a template with one `id` field watches.]*
//! *["How many documents are you?" asks the template. "Depends," says the dataset.]*
//!
//! Each builder type answers that question differently:
//!
//! | builder            | rows → documents                                      |
//! |--------------------|-------------------------------------------------------|
//! | `row_per_document` | one document per row, more if `id` expands to a list  |
//! | `nested_rows`      | rows fold into `doc.data[<data_key>]` by resolved id  |
//!
//! Both share the same failure rules: a row that fails to resolve is skipped and the
//! rest carry on; a document whose id can't be derived is dropped on its own.
//! Everything in here is synchronous. No `.await` ever happens mid-build.

pub(crate) mod builder_pool;
pub(crate) mod nested_rows;
pub(crate) mod row_per_document;

pub(crate) use builder_pool::BuilderPool;

use std::collections::{HashMap, HashSet};

use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::common::{DocumentMap, WorkItem};
use crate::datasets::Dataset;
use crate::job::{BuilderType, ConfigError, IngestDocument};
use crate::template::{Resolver, TemplateError, TemplateNode, Token, parse};

/// Template field holding the document id.
pub(crate) const ID_FIELD: &str = "id";
/// Template field the nested-rows builder resolves once per row.
pub(crate) const DATA_FIELD: &str = "data";
/// Ingest param naming the per-row key inside `data`.
pub(crate) const DATA_KEY_PARAM: &str = "data_key";
const DEFAULT_DATA_KEY: &str = "*name";

/// 🚦 Where a work item's build got to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildState {
    #[default]
    Init,
    IteratingRows,
    Finalizing,
    Done,
    /// Unrecoverable: the template isn't compiled, or the dataset couldn't be opened.
    Failed,
}

/// 📊 What one build did. Rows that lost their document id count toward
/// `documents_failed`, not `rows_skipped`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildStats {
    pub rows_ok: usize,
    pub rows_skipped: usize,
    pub documents_failed: usize,
    pub state: BuildState,
}

#[derive(Debug, Default)]
pub struct BuildOutcome {
    pub documents: DocumentMap,
    pub stats: BuildStats,
}

/// 🌳 An ingest document's template, parsed once and kept for the worker's lifetime.
#[derive(Debug, Clone)]
pub(crate) struct CompiledDocument {
    pub(crate) id: Token,
    /// Every template field except `id` (and, for nested rows, `data`).
    pub(crate) body: TemplateNode,
    pub(crate) data: Option<TemplateNode>,
    pub(crate) data_key: Option<Token>,
    pub(crate) optional: HashSet<String>,
}

impl CompiledDocument {
    pub(crate) fn compile(document: &IngestDocument) -> Result<Self, ConfigError> {
        let malformed = |source: TemplateError| ConfigError::MalformedTemplate {
            document: document.id.clone(),
            source,
        };
        let Value::Object(template) = &document.template else {
            return Err(ConfigError::MissingField(format!(
                "{}.template (must be a mapping)",
                document.id
            )));
        };
        let mut fields = template.clone();
        let id = match fields.remove(ID_FIELD) {
            Some(Value::String(text)) => parse(&text).map_err(malformed)?,
            _ => {
                return Err(ConfigError::MissingField(format!(
                    "{}.template.{ID_FIELD} (a template string)",
                    document.id
                )));
            }
        };

        let (data, data_key) = match document.builder_type {
            BuilderType::NestedRows => {
                let data = fields
                    .remove(DATA_FIELD)
                    .map(|node| TemplateNode::compile(&node))
                    .transpose()
                    .map_err(malformed)?;
                let key_template = document
                    .params
                    .get(DATA_KEY_PARAM)
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_DATA_KEY);
                (data, Some(parse(key_template).map_err(malformed)?))
            }
            BuilderType::RowPerDocument => (None, None),
        };

        Ok(Self {
            id,
            body: TemplateNode::compile(&Value::Object(fields)).map_err(malformed)?,
            data,
            data_key,
            optional: document.optional_fields.iter().cloned().collect(),
        })
    }

    pub(crate) fn handler_names(&self) -> Vec<&str> {
        let mut names = self.id.handler_names();
        names.extend(self.body.handler_names());
        if let Some(data) = &self.data {
            names.extend(data.handler_names());
        }
        if let Some(key) = &self.data_key {
            names.extend(key.handler_names());
        }
        names
    }
}

/// 🧰 The resolver plus the compiled templates an assembler has seen so far.
#[derive(Debug)]
pub(crate) struct AssemblerCore {
    pub(crate) resolver: Resolver,
    compiled: HashMap<String, CompiledDocument>,
}

impl AssemblerCore {
    pub(crate) fn new(builder_type: BuilderType) -> Self {
        Self {
            resolver: Resolver::new(builder_type.handler_registry()),
            compiled: HashMap::new(),
        }
    }

    pub(crate) fn prepare(&mut self, document: &IngestDocument) -> Result<()> {
        if !self.compiled.contains_key(&document.id) {
            let compiled = CompiledDocument::compile(document)?;
            self.compiled.insert(document.id.clone(), compiled);
        }
        Ok(())
    }

    pub(crate) fn compiled(&self, document: &IngestDocument) -> Result<&CompiledDocument> {
        self.compiled.get(&document.id).ok_or_else(|| {
            anyhow!("💀 ingest document '{}' was never prepared", document.id)
        })
    }
}

/// 🏗️ Builds every output document for one work item.
pub(crate) trait Assembler: std::fmt::Debug + Send {
    fn builder_type(&self) -> BuilderType;

    /// Compile and cache the ingest document's template. Cheap on repeat calls.
    fn prepare(&mut self, document: &IngestDocument) -> Result<()>;

    /// `Err` only when nothing could be built at all; row and document failures are
    /// counted in the outcome's stats instead.
    fn build(
        &mut self,
        document: &IngestDocument,
        item: &WorkItem,
        dataset: &dyn Dataset,
    ) -> Result<BuildOutcome>;
}

#[derive(Debug)]
pub(crate) enum AssemblerBackend {
    RowPerDocument(row_per_document::RowPerDocumentAssembler),
    NestedRows(nested_rows::NestedRowsAssembler),
}

impl AssemblerBackend {
    pub(crate) fn for_type(builder_type: BuilderType) -> Self {
        match builder_type {
            BuilderType::RowPerDocument => {
                AssemblerBackend::RowPerDocument(row_per_document::RowPerDocumentAssembler::new())
            }
            BuilderType::NestedRows => {
                AssemblerBackend::NestedRows(nested_rows::NestedRowsAssembler::new())
            }
        }
    }
}

impl Assembler for AssemblerBackend {
    fn builder_type(&self) -> BuilderType {
        match self {
            AssemblerBackend::RowPerDocument(a) => a.builder_type(),
            AssemblerBackend::NestedRows(a) => a.builder_type(),
        }
    }

    fn prepare(&mut self, document: &IngestDocument) -> Result<()> {
        match self {
            AssemblerBackend::RowPerDocument(a) => a.prepare(document),
            AssemblerBackend::NestedRows(a) => a.prepare(document),
        }
    }

    fn build(
        &mut self,
        document: &IngestDocument,
        item: &WorkItem,
        dataset: &dyn Dataset,
    ) -> Result<BuildOutcome> {
        match self {
            AssemblerBackend::RowPerDocument(a) => a.build(document, item, dataset),
            AssemblerBackend::NestedRows(a) => a.build(document, item, dataset),
        }
    }
}

/// Sets the resolved id on a document body. Bodies are always objects.
pub(crate) fn stamp_id(mut body: Value, id: &str) -> Value {
    if let Value::Object(fields) = &mut body {
        fields.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    }
    body
}
