//! 🧰 Handlers: the named functions a template can call with `&name|args:subtokens`.
//!
//! Names map to plain `fn` pointers in a [`HandlerRegistry`]. No reflection, no string
//! eval. Each builder type declares the registry it supports; a template that calls a
//! name outside it is rejected before any worker starts.

use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat};
use serde_json::Value;

use super::resolver::ResolveContext;
use super::value::Resolved;

/// 🎒 The resolved inputs a handler receives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerParams {
    /// Comma-separated values between `|` and the first `:`.
    pub args: Vec<Resolved>,
    /// Colon-separated values after the argument list.
    pub subtokens: Vec<Resolved>,
}

impl HandlerParams {
    pub(crate) fn arg(&self, index: usize, handler: &str) -> Result<&Resolved> {
        self.args
            .get(index)
            .ok_or_else(|| anyhow!("{handler} expects argument #{}", index + 1))
    }

    pub(crate) fn arg_text(&self, index: usize, handler: &str) -> Result<String> {
        self.arg(index, handler)?
            .as_key_string()
            .ok_or_else(|| anyhow!("{handler} argument #{} must be text", index + 1))
    }

    pub(crate) fn arg_number(&self, index: usize, handler: &str) -> Result<f64> {
        self.arg(index, handler)?
            .as_f64()
            .ok_or_else(|| anyhow!("{handler} argument #{} must be a number", index + 1))
    }

    pub(crate) fn first_subtoken(&self) -> &Resolved {
        static MISSING: Resolved = Resolved::Missing;
        self.subtokens.first().unwrap_or(&MISSING)
    }
}

/// A handler: resolved params plus the row context in, a resolved value out.
pub type HandlerFn = fn(&HandlerParams, &ResolveContext<'_>) -> Result<Resolved>;

/// 📇 Name → handler lookup table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<&'static str, HandlerFn>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &'static str, handler: HandlerFn) -> &mut Self {
        self.handlers.insert(name, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<HandlerFn> {
        self.handlers.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    /// 🧰 The capability set every builder type gets.
    pub fn common() -> Self {
        let mut registry = Self::new();
        registry
            .register("derive_key", derive_key)
            .register("round", round)
            .register("scale", scale)
            .register("upper", upper)
            .register("lower", lower)
            .register("coalesce", coalesce)
            .register("iso_time", iso_time)
            .register("epoch", epoch)
            .register("interval_start", interval_start)
            .register("param", param)
            .register("metadata", metadata)
            .register("row_index", row_index);
        registry
    }
}

/// Joins every arg and sub-token with `:`. Any missing input makes the key missing.
pub fn derive_key(params: &HandlerParams, _ctx: &ResolveContext<'_>) -> Result<Resolved> {
    let mut parts = Vec::with_capacity(params.args.len() + params.subtokens.len());
    for input in params.args.iter().chain(params.subtokens.iter()) {
        if input.is_missing() {
            return Ok(Resolved::Missing);
        }
        let part = input
            .as_key_string()
            .ok_or_else(|| anyhow!("derive_key can only join scalars"))?;
        parts.push(part);
    }
    Ok(Resolved::string(parts.join(":")))
}

/// `&round|places:*value`
pub fn round(params: &HandlerParams, _ctx: &ResolveContext<'_>) -> Result<Resolved> {
    let places = params.arg_number(0, "round")?;
    let value = params.first_subtoken();
    if value.is_missing() {
        return Ok(Resolved::Missing);
    }
    let number = value
        .as_f64()
        .ok_or_else(|| anyhow!("round needs a number, got {value:?}"))?;
    let factor = 10f64.powi(places as i32);
    Ok(Resolved::from_f64((number * factor).round() / factor))
}

/// `&scale|factor:*value`
pub fn scale(params: &HandlerParams, _ctx: &ResolveContext<'_>) -> Result<Resolved> {
    let factor = params.arg_number(0, "scale")?;
    let value = params.first_subtoken();
    if value.is_missing() {
        return Ok(Resolved::Missing);
    }
    let number = value
        .as_f64()
        .ok_or_else(|| anyhow!("scale needs a number, got {value:?}"))?;
    Ok(Resolved::from_f64(number * factor))
}

pub fn upper(params: &HandlerParams, _ctx: &ResolveContext<'_>) -> Result<Resolved> {
    map_text(params.first_subtoken(), str::to_uppercase)
}

pub fn lower(params: &HandlerParams, _ctx: &ResolveContext<'_>) -> Result<Resolved> {
    map_text(params.first_subtoken(), str::to_lowercase)
}

fn map_text(value: &Resolved, f: fn(&str) -> String) -> Result<Resolved> {
    match value {
        Resolved::Missing => Ok(Resolved::Missing),
        Resolved::Scalar(Value::String(s)) => Ok(Resolved::string(f(s))),
        other => bail!("expected text, got {other:?}"),
    }
}

/// First non-missing input, args before sub-tokens.
pub fn coalesce(params: &HandlerParams, _ctx: &ResolveContext<'_>) -> Result<Resolved> {
    Ok(params
        .args
        .iter()
        .chain(params.subtokens.iter())
        .find(|value| !value.is_missing())
        .cloned()
        .unwrap_or_default())
}

/// `&iso_time:*epoch`: epoch seconds to an RFC 3339 UTC timestamp.
pub fn iso_time(params: &HandlerParams, _ctx: &ResolveContext<'_>) -> Result<Resolved> {
    let value = params.first_subtoken();
    if value.is_missing() {
        return Ok(Resolved::Missing);
    }
    let seconds = value
        .as_f64()
        .ok_or_else(|| anyhow!("iso_time needs epoch seconds, got {value:?}"))?;
    let timestamp = DateTime::from_timestamp(seconds.floor() as i64, 0)
        .ok_or_else(|| anyhow!("epoch {seconds} is out of range"))?;
    Ok(Resolved::string(timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)))
}

/// `&epoch|%Y%m%d%H%M:*text`: parse text with a chrono mask into epoch seconds (UTC).
pub fn epoch(params: &HandlerParams, _ctx: &ResolveContext<'_>) -> Result<Resolved> {
    let mask = params.arg_text(0, "epoch")?;
    let value = params.first_subtoken();
    let Some(text) = value.as_key_string() else {
        return Ok(Resolved::Missing);
    };
    let seconds = parse_epoch(&text, &mask)
        .with_context(|| format!("'{text}' does not match mask '{mask}'"))?;
    Ok(Resolved::Scalar(Value::from(seconds)))
}

/// `&interval_start|3600:*epoch`: floor an epoch to the start of its interval.
pub fn interval_start(params: &HandlerParams, _ctx: &ResolveContext<'_>) -> Result<Resolved> {
    let interval = params.arg_number(0, "interval_start")?;
    let value = params.first_subtoken();
    if value.is_missing() {
        return Ok(Resolved::Missing);
    }
    let seconds = value
        .as_f64()
        .ok_or_else(|| anyhow!("interval_start needs epoch seconds, got {value:?}"))?;
    Ok(Resolved::Scalar(Value::from(floor_to_interval(seconds, interval)?)))
}

/// `&param|name`: a value from the work item / ingest document parameter bag.
pub fn param(params: &HandlerParams, ctx: &ResolveContext<'_>) -> Result<Resolved> {
    let name = params.arg_text(0, "param")?;
    Ok(Resolved::from_option(ctx.params.get(&name).cloned()))
}

/// `&metadata|name`: scalar dataset metadata.
pub fn metadata(params: &HandlerParams, ctx: &ResolveContext<'_>) -> Result<Resolved> {
    let name = params.arg_text(0, "metadata")?;
    Ok(Resolved::from_option(ctx.dataset.metadata(&name)))
}

pub fn row_index(_params: &HandlerParams, ctx: &ResolveContext<'_>) -> Result<Resolved> {
    Ok(Resolved::Scalar(Value::from(ctx.row)))
}

/// Floors `seconds` to a multiple of `interval`. Shared with the nested-rows builder.
pub(crate) fn floor_to_interval(seconds: f64, interval: f64) -> Result<i64> {
    if !(interval.is_finite() && interval > 0.0) {
        bail!("interval must be a positive number of seconds, got {interval}");
    }
    Ok(((seconds / interval).floor() * interval) as i64)
}

/// Parses `text` with a chrono strftime mask; date-only masks land on midnight UTC.
pub(crate) fn parse_epoch(text: &str, mask: &str) -> Result<i64> {
    if let Ok(stamp) = NaiveDateTime::parse_from_str(text, mask) {
        return Ok(stamp.and_utc().timestamp());
    }
    let date = NaiveDate::parse_from_str(text, mask)?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow!("midnight does not exist on {date}"))?;
    Ok(midnight.and_utc().timestamp())
}
