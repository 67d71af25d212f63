//! 🪆 Nested rows: many rows fold into one document's `data` map.
//!
//! Every row resolves its own `id`. The first row to reach an id resolves the header
//! (every template field besides `id` and `data`); every row then adds its resolved
//! `data` object under `doc.data[<data_key>]`. Station-indexed obs and time-indexed
//! series both look like this.

use anyhow::{Result, anyhow};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{Assembler, AssemblerCore, BuildOutcome, BuildState, DATA_FIELD, stamp_id};
use crate::common::WorkItem;
use crate::datasets::Dataset;
use crate::job::{BuilderType, IngestDocument};
use crate::template::handlers::floor_to_interval;
use crate::template::{HandlerParams, HandlerRegistry, ResolveContext, Resolved};

/// Adds `valid_epoch` to a registry.
pub(crate) fn register_handlers(registry: &mut HandlerRegistry) {
    registry.register("valid_epoch", valid_epoch);
}

/// `&valid_epoch|field,interval`: the row's `field`, floored to the interval.
pub fn valid_epoch(params: &HandlerParams, ctx: &ResolveContext<'_>) -> Result<Resolved> {
    let field = params.arg_text(0, "valid_epoch")?;
    let interval = params.arg_number(1, "valid_epoch")?;
    let value = Resolved::from_option(ctx.dataset.field(&field, ctx.row));
    if value.is_missing() {
        return Ok(Resolved::Missing);
    }
    let seconds = value
        .as_f64()
        .ok_or_else(|| anyhow!("valid_epoch needs epoch seconds in '{field}', got {value:?}"))?;
    Ok(Resolved::Scalar(Value::from(floor_to_interval(seconds, interval)?)))
}

#[derive(Debug)]
pub(crate) struct NestedRowsAssembler {
    core: AssemblerCore,
}

impl NestedRowsAssembler {
    pub(crate) fn new() -> Self {
        Self {
            core: AssemblerCore::new(BuilderType::NestedRows),
        }
    }
}

impl Assembler for NestedRowsAssembler {
    fn builder_type(&self) -> BuilderType {
        BuilderType::NestedRows
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
        let data_path = DATA_FIELD.to_string();

        outcome.stats.state = BuildState::IteratingRows;
        for row in 0..dataset.row_count() {
            let ctx = ResolveContext::new(dataset, row, &params);

            let id = match resolver.resolve(&compiled.id, &ctx) {
                Ok(id) => id.as_key_string(),
                Err(err) => {
                    warn!("⚠️ row {row} of '{}': id did not resolve: {err}", item.label());
                    None
                }
            };
            let Some(id) = id else {
                debug!("🕳️ row {row} of '{}' has no usable id", item.label());
                outcome.stats.documents_failed += 1;
                continue;
            };

            // -- resolve everything this row contributes before touching the document
            let entry = match (&compiled.data, &compiled.data_key) {
                (Some(data), Some(key)) => {
                    let key = match resolver.resolve(key, &ctx) {
                        Ok(key) => key.as_key_string(),
                        Err(err) => {
                            warn!("⚠️ row {row} of '{}': data key failed: {err}", item.label());
                            None
                        }
                    };
                    let Some(key) = key else {
                        outcome.stats.rows_skipped += 1;
                        continue;
                    };
                    let value = match resolver.resolve_node(data, &ctx, &compiled.optional) {
                        Ok(value) => value.unwrap_or(Value::Null),
                        Err(err) => {
                            warn!("⚠️ row {row} of '{}' skipped: {err}", item.label());
                            outcome.stats.rows_skipped += 1;
                            continue;
                        }
                    };
                    Some((key, value))
                }
                _ => None,
            };

            if !outcome.documents.contains_key(&id) {
                let header = match resolver.resolve_node(&compiled.body, &ctx, &compiled.optional)
                {
                    Ok(header) => header.unwrap_or_else(|| Value::Object(Map::new())),
                    Err(err) => {
                        warn!(
                            "⚠️ row {row} of '{}' could not start document '{id}': {err}",
                            item.label()
                        );
                        outcome.stats.rows_skipped += 1;
                        continue;
                    }
                };
                outcome.documents.insert(id.clone(), stamp_id(header, &id));
            }

            if let Some((key, value)) = entry {
                let Some(Value::Object(fields)) = outcome.documents.get_mut(&id) else {
                    continue;
                };
                let data = fields
                    .entry(data_path.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(data) = data {
                    data.insert(key, value);
                }
            }
            outcome.stats.rows_ok += 1;
        }

        outcome.stats.state = BuildState::Finalizing;
        debug!(
            "🏁 '{}': {} rows folded into {} documents ({} skipped, {} without an id)",
            item.label(),
            outcome.stats.rows_ok,
            outcome.documents.len(),
            outcome.stats.rows_skipped,
            outcome.stats.documents_failed
        );
        outcome.stats.state = BuildState::Done;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemblers::tests::ingest_document;
    use crate::datasets::RowsDataset;
    use serde_json::json;

    fn rows(values: Value) -> RowsDataset {
        let rows = values
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row.as_object().unwrap().clone())
            .collect();
        RowsDataset::new(Map::new(), rows)
    }

    fn build(document: &IngestDocument, dataset: &RowsDataset) -> BuildOutcome {
        let item = WorkItem::from_path("/data/metar/20231019_1200.json", 7, &document.id);
        let mut assembler = NestedRowsAssembler::new();
        assembler.prepare(document).unwrap();
        assembler.build(document, &item, dataset).unwrap()
    }

    fn metar_document() -> IngestDocument {
        ingest_document(
            BuilderType::NestedRows,
            json!({
                "id": "DD:V01:METAR:obs:&valid_epoch|time,3600",
                "type": "DD",
                "fcstValidEpoch": "&valid_epoch|time,3600",
                "data": {"name": "*name", "temperature": "&round|1:*temp"}
            }),
        )
    }

    #[test]
    fn the_one_where_stations_fold_into_hourly_documents() {
        let dataset = rows(json!([
            {"name": "KDEN", "time": 1697716900, "temp": 281.26},
            {"name": "KBOU", "time": 1697717000, "temp": 279.04},
            {"name": "KDEN", "time": 1697720500, "temp": 282.0}
        ]));
        let outcome = build(&metar_document(), &dataset);

        assert_eq!(outcome.stats.rows_ok, 3);
        assert_eq!(outcome.documents.len(), 2);
        assert_eq!(
            outcome.documents["DD:V01:METAR:obs:1697716800"],
            json!({
                "id": "DD:V01:METAR:obs:1697716800",
                "type": "DD",
                "fcstValidEpoch": 1697716800,
                "data": {
                    "KDEN": {"name": "KDEN", "temperature": 281.3},
                    "KBOU": {"name": "KBOU", "temperature": 279.0}
                }
            })
        );
        assert_eq!(
            outcome.documents["DD:V01:METAR:obs:1697720400"]["data"]["KDEN"]["temperature"],
            json!(282.0)
        );
    }

    #[test]
    fn the_one_where_a_bad_row_leaves_its_neighbours_alone() {
        let dataset = rows(json!([
            {"name": "A", "time": 3600, "temp": 1.0},
            {"name": "B", "time": 3600, "temp": 2.0},
            {"name": "C", "time": 3600, "temp": "hot"},
            {"name": "D", "time": 3600, "temp": 4.0},
            {"name": "E", "time": 3600, "temp": 5.0}
        ]));
        let outcome = build(&metar_document(), &dataset);
        let data = &outcome.documents["DD:V01:METAR:obs:3600"]["data"];
        let keys: Vec<_> = data.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys.len(), 4);
        assert!(data.get("C").is_none());
        assert_eq!(outcome.stats.rows_skipped, 1);
    }

    #[test]
    fn the_one_where_a_row_without_a_time_has_no_home() {
        let dataset = rows(json!([
            {"name": "A", "time": 3600, "temp": 1.0},
            {"name": "B", "temp": 2.0}
        ]));
        let outcome = build(&metar_document(), &dataset);
        assert_eq!(outcome.documents.len(), 1);
        assert_eq!(outcome.stats.documents_failed, 1);
    }

    #[test]
    fn the_one_where_the_data_key_is_configurable() {
        let mut document = metar_document();
        document.params.insert("data_key".into(), json!("*icao"));
        let dataset = rows(json!([{"name": "Denver", "icao": "KDEN", "time": 0, "temp": 1.0}]));
        let outcome = build(&document, &dataset);
        let doc = &outcome.documents["DD:V01:METAR:obs:0"];
        assert!(doc["data"].get("KDEN").is_some());
    }
}
