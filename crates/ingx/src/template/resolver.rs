//! 🔍 The resolver: where tokens meet a dataset row and become values.
//!
//! Resolution is pure with respect to `(dataset, row)`: nothing in here mutates shared
//! state, so the same context always resolves to the same answer.
//!
//! | token     | result                                                       |
//! |-----------|--------------------------------------------------------------|
//! | Literal   | the text, unchanged                                          |
//! | Variable  | dataset field at the current row, or `Missing`              |
//! | Function  | sub-tokens first (depth-first), then the handler's output    |
//! | Composite | pieces left to right, stringified, joined with `:`           |

use std::collections::HashSet;

use serde_json::{Map, Value};
use tracing::trace;

use super::grammar::{COMPOSITE_SEPARATOR, FunctionCall, Token, parse};
use super::handlers::{HandlerParams, HandlerRegistry};
use super::value::Resolved;
use super::TemplateError;
use crate::datasets::Dataset;

/// 🧭 Everything a token may look at while resolving.
#[derive(Clone, Copy)]
pub struct ResolveContext<'a> {
    pub dataset: &'a dyn Dataset,
    pub row: usize,
    /// Work-item and ingest-document parameters, visible to handlers.
    pub params: &'a Map<String, Value>,
}

impl std::fmt::Debug for ResolveContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolveContext")
            .field("row", &self.row)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl<'a> ResolveContext<'a> {
    pub fn new(dataset: &'a dyn Dataset, row: usize, params: &'a Map<String, Value>) -> Self {
        Self {
            dataset,
            row,
            params,
        }
    }

    /// Same dataset and params, different row.
    pub fn at_row(&self, row: usize) -> Self {
        Self { row, ..*self }
    }
}

/// 🌳 A template document with every string pre-parsed into a token.
///
/// Strings become tokens, other JSON scalars pass through untouched, objects and arrays
/// are walked recursively.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateNode {
    Token(Token),
    Value(Value),
    Object(Vec<(String, TemplateNode)>),
    Array(Vec<TemplateNode>),
}

impl TemplateNode {
    pub fn compile(template: &Value) -> Result<Self, TemplateError> {
        Ok(match template {
            Value::String(text) => TemplateNode::Token(parse(text)?),
            Value::Object(fields) => TemplateNode::Object(
                fields
                    .iter()
                    .map(|(key, value)| Ok((key.clone(), TemplateNode::compile(value)?)))
                    .collect::<Result<Vec<_>, TemplateError>>()?,
            ),
            Value::Array(items) => TemplateNode::Array(
                items
                    .iter()
                    .map(TemplateNode::compile)
                    .collect::<Result<Vec<_>, TemplateError>>()?,
            ),
            other => TemplateNode::Value(other.clone()),
        })
    }

    pub fn handler_names(&self) -> Vec<&str> {
        match self {
            TemplateNode::Token(token) => token.handler_names(),
            TemplateNode::Value(_) => Vec::new(),
            TemplateNode::Object(fields) => fields
                .iter()
                .flat_map(|(_, node)| node.handler_names())
                .collect(),
            TemplateNode::Array(items) => items.iter().flat_map(|n| n.handler_names()).collect(),
        }
    }
}

/// 🔍 Resolves tokens and template trees against a handler registry.
#[derive(Debug, Clone)]
pub struct Resolver {
    registry: HandlerRegistry,
}

impl Resolver {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Resolve a required token: a missing composite piece makes the whole composite missing.
    pub fn resolve(&self, token: &Token, ctx: &ResolveContext<'_>) -> Result<Resolved, TemplateError> {
        self.resolve_token(token, ctx, false)
    }

    /// Resolve an optional token: missing composite pieces render as empty text instead.
    pub fn resolve_optional(
        &self,
        token: &Token,
        ctx: &ResolveContext<'_>,
    ) -> Result<Resolved, TemplateError> {
        self.resolve_token(token, ctx, true)
    }

    /// 🌳 Resolve a whole template tree into a JSON value.
    ///
    /// Fields that resolve to `Missing` are dropped from their object. Any error aborts the
    /// tree; callers decide whether that costs a row or a document. `optional_fields`
    /// holds dotted paths (`data.dewpoint`) whose composites tolerate missing pieces.
    pub fn resolve_node(
        &self,
        node: &TemplateNode,
        ctx: &ResolveContext<'_>,
        optional_fields: &HashSet<String>,
    ) -> Result<Option<Value>, TemplateError> {
        self.resolve_node_at(node, ctx, optional_fields, "")
    }

    fn resolve_node_at(
        &self,
        node: &TemplateNode,
        ctx: &ResolveContext<'_>,
        optional_fields: &HashSet<String>,
        path: &str,
    ) -> Result<Option<Value>, TemplateError> {
        match node {
            TemplateNode::Value(value) => Ok(Some(value.clone())),
            TemplateNode::Token(token) => {
                let optional = optional_fields.contains(path);
                Ok(self.resolve_token(token, ctx, optional)?.into_json())
            }
            TemplateNode::Object(fields) => {
                let mut object = Map::with_capacity(fields.len());
                for (key, child) in fields {
                    let child_path = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{path}.{key}")
                    };
                    match self.resolve_node_at(child, ctx, optional_fields, &child_path)? {
                        Some(value) => {
                            object.insert(key.clone(), value);
                        }
                        None => trace!("🕳️ field '{child_path}' resolved to missing, dropping it"),
                    }
                }
                Ok(Some(Value::Object(object)))
            }
            TemplateNode::Array(items) => {
                let mut array = Vec::with_capacity(items.len());
                for child in items {
                    // -- positions matter in arrays, so missing stays as an explicit null
                    let value = self.resolve_node_at(child, ctx, optional_fields, path)?;
                    array.push(value.unwrap_or(Value::Null));
                }
                Ok(Some(Value::Array(array)))
            }
        }
    }

    fn resolve_token(
        &self,
        token: &Token,
        ctx: &ResolveContext<'_>,
        optional: bool,
    ) -> Result<Resolved, TemplateError> {
        match token {
            Token::Literal(text) => Ok(Resolved::string(text.clone())),
            Token::Variable(name) => Ok(Resolved::from_option(ctx.dataset.field(name, ctx.row))),
            Token::Function(call) => self.invoke(call, ctx),
            Token::Composite(pieces) => self.join(pieces, ctx, optional),
        }
    }

    fn invoke(&self, call: &FunctionCall, ctx: &ResolveContext<'_>) -> Result<Resolved, TemplateError> {
        let handler = self
            .registry
            .get(&call.name)
            .ok_or_else(|| TemplateError::UnknownHandler(call.name.clone()))?;

        let args = call
            .args
            .iter()
            .map(|arg| self.resolve_token(arg, ctx, false))
            .collect::<Result<Vec<_>, _>>()?;
        let subtokens = call
            .subtokens
            .iter()
            .map(|sub| self.resolve_token(sub, ctx, false))
            .collect::<Result<Vec<_>, _>>()?;

        handler(&HandlerParams { args, subtokens }, ctx).map_err(|err| TemplateError::Handler {
            name: call.name.clone(),
            message: format!("{err:#}"),
        })
    }

    fn join(
        &self,
        pieces: &[Token],
        ctx: &ResolveContext<'_>,
        optional: bool,
    ) -> Result<Resolved, TemplateError> {
        let mut parts = Vec::with_capacity(pieces.len());
        for piece in pieces {
            let resolved = self.resolve_token(piece, ctx, optional)?;
            match resolved {
                Resolved::Missing if optional => parts.push(String::new()),
                Resolved::Missing => return Ok(Resolved::Missing),
                Resolved::List(_) => {
                    return Err(TemplateError::BadType {
                        context: format!("{piece:?}"),
                        reason: "a list cannot be joined into a composite key".into(),
                    });
                }
                scalar => match scalar.as_key_string() {
                    Some(part) => parts.push(part),
                    None => {
                        return Err(TemplateError::BadType {
                            context: format!("{piece:?}"),
                            reason: "only strings, numbers and booleans join into a key".into(),
                        });
                    }
                },
            }
        }
        let separator = COMPOSITE_SEPARATOR.to_string();
        Ok(Resolved::string(parts.join(&separator)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::TableDataset;
    use serde_json::json;

    fn dataset(columns: Value) -> TableDataset {
        TableDataset::from_json(json!({ "metadata": {"model": "RAP"}, "columns": columns }))
            .expect("💀 test dataset should parse")
    }

    fn resolver() -> Resolver {
        Resolver::new(HandlerRegistry::common())
    }

    fn resolve_str(template: &str, data: &TableDataset, row: usize) -> Resolved {
        let params = Map::new();
        let ctx = ResolveContext::new(data, row, &params);
        resolver()
            .resolve(&parse(template).unwrap(), &ctx)
            .expect("💀 resolution should succeed")
    }

    #[test]
    fn the_one_where_derive_key_builds_the_famous_example() {
        let data = dataset(json!({"station_name": "KDEN", "fcst_hour": 6}));
        assert_eq!(
            resolve_str("&derive_key|PREFIX:*station_name:*fcst_hour", &data, 0),
            Resolved::string("PREFIX:KDEN:6")
        );
    }

    #[test]
    fn the_one_where_function_free_templates_only_substitute_variables() {
        let data = dataset(json!({"station": ["KDEN", "KBOU", "KCOS"], "hour": [0, 6, 12]}));
        for row in 0..3 {
            let expected = format!(
                "DD:V01:{}:obs:{}",
                ["KDEN", "KBOU", "KCOS"][row],
                [0, 6, 12][row]
            );
            assert_eq!(
                resolve_str("DD:V01:*station:obs:*hour", &data, row),
                Resolved::string(expected)
            );
        }
        assert_eq!(resolve_str("just words", &data, 1), Resolved::string("just words"));
    }

    #[test]
    fn the_one_where_a_lone_variable_keeps_its_type() {
        let data = dataset(json!({"temp": [280.5]}));
        assert_eq!(resolve_str("*temp", &data, 0), Resolved::Scalar(json!(280.5)));
    }

    #[test]
    fn the_one_where_missing_poisons_a_required_composite() {
        let data = dataset(json!({"station": "KDEN"}));
        assert!(resolve_str("DD:*station:*nope", &data, 0).is_missing());
        assert!(resolve_str("*nope", &data, 0).is_missing());
    }

    #[test]
    fn the_one_where_optional_composites_shrug_off_missing_pieces() {
        let data = dataset(json!({"station": "KDEN"}));
        let params = Map::new();
        let ctx = ResolveContext::new(&data, 0, &params);
        let resolved = resolver()
            .resolve_optional(&parse("DD:*station:*nope").unwrap(), &ctx)
            .unwrap();
        assert_eq!(resolved, Resolved::string("DD:KDEN:"));
    }

    #[test]
    fn the_one_where_handlers_see_missing_inputs_and_decide() {
        let data = dataset(json!({"icao": "KDEN"}));
        assert_eq!(
            resolve_str("&coalesce:*name:*icao", &data, 0),
            Resolved::string("KDEN")
        );
        assert!(resolve_str("&derive_key|X:*name", &data, 0).is_missing());
    }

    #[test]
    fn the_one_where_unknown_handlers_fail_loudly() {
        let data = dataset(json!({}));
        let params = Map::new();
        let ctx = ResolveContext::new(&data, 0, &params);
        let err = resolver()
            .resolve(&parse("&summon_rain:*x").unwrap(), &ctx)
            .unwrap_err();
        assert_eq!(err, TemplateError::UnknownHandler("summon_rain".into()));
    }

    #[test]
    fn the_one_where_lists_cannot_squeeze_into_a_composite() {
        let data = dataset(json!({"levels": [[1, 2]]}));
        let params = Map::new();
        let ctx = ResolveContext::new(&data, 0, &params);
        let err = resolver()
            .resolve(&parse("L:*levels").unwrap(), &ctx)
            .unwrap_err();
        assert!(matches!(err, TemplateError::BadType { .. }));
    }

    #[test]
    fn the_one_where_a_template_tree_drops_missing_fields() {
        let data = dataset(json!({"station": "KDEN", "temp": [281.25]}));
        let template = json!({
            "id": "DD:*station",
            "type": "DD",
            "version": 1,
            "obs": {"temp": "&round|1:*temp", "dewpoint": "*dewpoint"},
            "tags": ["*station", "*nope"]
        });
        let node = TemplateNode::compile(&template).unwrap();
        let params = Map::new();
        let ctx = ResolveContext::new(&data, 0, &params);
        let body = resolver()
            .resolve_node(&node, &ctx, &HashSet::new())
            .unwrap()
            .unwrap();
        assert_eq!(
            body,
            json!({
                "id": "DD:KDEN",
                "type": "DD",
                "version": 1,
                "obs": {"temp": 281.3},
                "tags": ["KDEN", null]
            })
        );
    }

    #[test]
    fn the_one_where_optional_paths_are_dotted() {
        let data = dataset(json!({"station": "KDEN"}));
        let node = TemplateNode::compile(&json!({"meta": {"key": "K:*station:*elev"}})).unwrap();
        let params = Map::new();
        let ctx = ResolveContext::new(&data, 0, &params);
        let optional: HashSet<String> = ["meta.key".to_string()].into();
        let body = resolver().resolve_node(&node, &ctx, &optional).unwrap().unwrap();
        assert_eq!(body, json!({"meta": {"key": "K:KDEN:"}}));
    }
}
