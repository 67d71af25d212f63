//! 📄 Row per document: every row (or every level of a row) becomes its own document.
//!
//! When the `id` template resolves to a list (`&column|level` style), the row expands
//! into one document per element. Body fields holding a list of the same length are
//! split element-wise; everything else is copied onto each document.

use anyhow::{Result, anyhow};
use serde_json::{Map, Value};
use tracing::{debug, trace, warn};

use super::{Assembler, AssemblerCore, BuildOutcome, BuildState, stamp_id};
use crate::common::WorkItem;
use crate::datasets::Dataset;
use crate::job::{BuilderType, IngestDocument};
use crate::template::{HandlerParams, HandlerRegistry, ResolveContext, Resolved};

/// Adds `column` and `levels` to a registry.
pub(crate) fn register_handlers(registry: &mut HandlerRegistry) {
    registry.register("column", column).register("levels", levels);
}

/// `&column|name`: the whole field as a list.
pub fn column(params: &HandlerParams, ctx: &ResolveContext<'_>) -> Result<Resolved> {
    let name = params.arg_text(0, "column")?;
    Ok(ctx
        .dataset
        .column(&name)
        .map(Resolved::List)
        .unwrap_or_default())
}

/// `&levels|count`: `[0, 1, .., count - 1]`.
pub fn levels(params: &HandlerParams, _ctx: &ResolveContext<'_>) -> Result<Resolved> {
    let count = params.arg_number(0, "levels")?;
    if !(count >= 0.0 && count.fract() == 0.0) {
        return Err(anyhow!("levels needs a whole, non-negative count, got {count}"));
    }
    Ok(Resolved::List((0..count as u64).map(Value::from).collect()))
}

#[derive(Debug)]
pub(crate) struct RowPerDocumentAssembler {
    core: AssemblerCore,
}

impl RowPerDocumentAssembler {
    pub(crate) fn new() -> Self {
        Self {
            core: AssemblerCore::new(BuilderType::RowPerDocument),
        }
    }
}

impl Assembler for RowPerDocumentAssembler {
    fn builder_type(&self) -> BuilderType {
        BuilderType::RowPerDocument
    }

    fn prepare(&mut self, document: &IngestDocument) -> Result<()> {
        self.core.prepare(document)
    }

    fn build(
        &mut self,
        document: &IngestDocument,
        item: &WorkItem,
        dataset: &dyn Dataset,
    ) -> Result<BuildOutcome> {
        let mut outcome = BuildOutcome::default();
        let compiled = self.core.compiled(document)?;
        let resolver = &self.core.resolver;
        let params = item.parameter_bag(document);

        outcome.stats.state = BuildState::IteratingRows;
        for row in 0..dataset.row_count() {
            let ctx = ResolveContext::new(dataset, row, &params);

            let id = match resolver.resolve(&compiled.id, &ctx) {
                Ok(Resolved::Missing) => {
                    debug!("🕳️ row {row} of '{}' has no id, dropping its document", item.label());
                    outcome.stats.documents_failed += 1;
                    continue;
                }
                Ok(id) => id,
                Err(err) => {
                    warn!("⚠️ row {row} of '{}': id did not resolve: {err}", item.label());
                    outcome.stats.documents_failed += 1;
                    continue;
                }
            };

            let body = match resolver.resolve_node(&compiled.body, &ctx, &compiled.optional) {
                Ok(body) => body.unwrap_or_else(|| Value::Object(Map::new())),
                Err(err) => {
                    warn!("⚠️ row {row} of '{}' skipped: {err}", item.label());
                    outcome.stats.rows_skipped += 1;
                    continue;
                }
            };

            match id {
                Resolved::List(ids) => {
                    let width = ids.len();
                    for (index, id) in ids.into_iter().enumerate() {
                        match Resolved::from_json(id).as_key_string() {
                            Some(id) => {
                                let expanded = stamp_id(split_lists(&body, index, width), &id);
                                outcome.documents.insert(id, expanded);
                            }
                            None => outcome.stats.documents_failed += 1,
                        }
                    }
                }
                scalar => match scalar.as_key_string() {
                    Some(id) => {
                        if outcome.documents.insert(id.clone(), stamp_id(body, &id)).is_some() {
                            trace!("🔁 row {row} replaced an earlier document with id '{id}'");
                        }
                    }
                    None => {
                        outcome.stats.documents_failed += 1;
                        continue;
                    }
                },
            }
            outcome.stats.rows_ok += 1;
        }

        outcome.stats.state = BuildState::Finalizing;
        debug!(
            "🏁 '{}': {} documents from {} rows ({} skipped, {} without an id)",
            item.label(),
            outcome.documents.len(),
            outcome.stats.rows_ok,
            outcome.stats.rows_skipped,
            outcome.stats.documents_failed
        );
        outcome.stats.state = BuildState::Done;
        Ok(outcome)
    }
}

/// Picks element `index` out of every array of length `width`, recursing into objects.
fn split_lists(value: &Value, index: usize, width: usize) -> Value {
    match value {
        Value::Array(items) if items.len() == width => items[index].clone(),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, child)| (key.clone(), split_lists(child, index, width)))
                .collect(),
        ),
        other => other.clone(),
    }
}
