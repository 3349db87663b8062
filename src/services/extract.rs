use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::ExtractError;
use crate::models::{Metrics, Observation};

/// Where to look for an entity's identity inside a raw record.
#[derive(Debug, Clone, Deserialize)]
pub struct KeySpec {
    #[serde(default = "default_primary")]
    pub primary: Vec<String>,
    #[serde(default = "default_chain")]
    pub chain: Vec<String>,
    #[serde(default = "default_base_symbol")]
    pub base_symbol: Vec<String>,
    #[serde(default = "default_quote_symbol")]
    pub quote_symbol: Vec<String>,
    #[serde(default = "default_name")]
    pub name: Vec<String>,
    #[serde(default = "default_symbol")]
    pub symbol: Vec<String>,
}

fn paths(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn default_primary() -> Vec<String> {
    paths(&["mint", "mintAddress", "mint_id", "address", "tokenAddress", "pairAddress", "pool_address", "id"])
}
fn default_chain() -> Vec<String> { paths(&["chainId", "chain"]) }
fn default_base_symbol() -> Vec<String> { paths(&["baseToken.symbol", "base_symbol"]) }
fn default_quote_symbol() -> Vec<String> { paths(&["quoteToken.symbol", "quote_symbol"]) }
fn default_name() -> Vec<String> { paths(&["name", "baseToken.name", "attributes.name"]) }
fn default_symbol() -> Vec<String> { paths(&["symbol", "baseToken.symbol", "token_symbol"]) }

impl Default for KeySpec {
    fn default() -> Self {
        Self {
            primary: default_primary(),
            chain: default_chain(),
            base_symbol: default_base_symbol(),
            quote_symbol: default_quote_symbol(),
            name: default_name(),
            symbol: default_symbol(),
        }
    }
}

/// Logical metric name -> ordered list of raw-field paths to try.
///
/// A path is dotted (`liquidity.usd`, `pairs.0.priceUsd`); `a+b` sums its
/// components (`txns.h24.buys+txns.h24.sells`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct FieldSpec {
    pub metrics: BTreeMap<String, Vec<String>>,
}

impl FieldSpec {
    pub fn new<I, K, P>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Vec<P>)>,
        K: Into<String>,
        P: Into<String>,
    {
        Self {
            metrics: entries
                .into_iter()
                .map(|(k, ps)| (k.into(), ps.into_iter().map(Into::into).collect()))
                .collect(),
        }
    }
}

/// Pure record -> observation mapping for one watcher.
#[derive(Debug, Clone, Default)]
pub struct RecordExtractor {
    keys: KeySpec,
    fields: FieldSpec,
}

impl RecordExtractor {
    pub fn new(keys: KeySpec, fields: FieldSpec) -> Self {
        Self { keys, fields }
    }

    pub fn extract(&self, record: &Value) -> Result<Observation, ExtractError> {
        extract(record, &self.keys, &self.fields)
    }
}

pub fn extract(record: &Value, keys: &KeySpec, fields: &FieldSpec) -> Result<Observation, ExtractError> {
    if !record.is_object() {
        return Err(ExtractError::NotAnObject);
    }

    let name = resolve_text(record, &keys.name);
    let symbol = resolve_text(record, &keys.symbol);
    let key = derive_key(record, keys, name.as_deref(), symbol.as_deref())
        .ok_or(ExtractError::NoIdentity)?;

    let metrics: Metrics = fields
        .metrics
        .iter()
        .map(|(metric, chain)| {
            let value = chain
                .iter()
                .find_map(|path| resolve_number(record, path))
                .unwrap_or(0.0);
            (metric.clone(), value)
        })
        .collect();

    Ok(Observation { key, name, symbol, metrics })
}

fn derive_key(record: &Value, keys: &KeySpec, name: Option<&str>, symbol: Option<&str>) -> Option<String> {
    if let Some(primary) = resolve_text(record, &keys.primary) {
        return Some(primary);
    }

    let base = resolve_text(record, &keys.base_symbol);
    let quote = resolve_text(record, &keys.quote_symbol);
    if let (Some(base), Some(quote)) = (base, quote) {
        let chain = resolve_text(record, &keys.chain).unwrap_or_else(|| "unknown".to_string());
        return Some(format!("{}:{}/{}", chain, base.to_uppercase(), quote.to_uppercase()));
    }

    if name.is_none() && symbol.is_none() {
        return None;
    }
    Some(format!("{}:{}", name.unwrap_or_default(), symbol.unwrap_or_default()))
}

/// Walk a dotted path; `null` counts as absent.
pub fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = record;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

/// First non-empty string (or number rendered as text) across `paths`.
pub fn resolve_text(record: &Value, paths: &[String]) -> Option<String> {
    paths.iter().find_map(|path| match lookup(record, path)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Numeric value at `path`, or `None` when nothing is present there.
pub fn resolve_number(record: &Value, path: &str) -> Option<f64> {
    if path.contains('+') {
        return path
            .split('+')
            .filter_map(|part| lookup(record, part.trim()).map(coerce))
            .fold(None, |acc, v| Some(acc.unwrap_or(0.0) + v));
    }
    lookup(record, path).map(coerce)
}

fn coerce(value: &Value) -> f64 {
    let n = match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::Bool(b) => if *b { 1.0 } else { 0.0 },
        Value::String(s) => parse_number(s),
        _ => 0.0,
    };
    if n.is_finite() { n } else { 0.0 }
}

/// Lenient numeric parse: `"$1,234.5"`, `"12.5K"`, `"3 M"`. Never fails; garbage is `0.0`.
pub fn parse_number(raw: &str) -> f64 {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '$' | '€' | '£' | ',' | '_' | '%') && !c.is_whitespace())
        .collect();

    let (digits, scale) = match cleaned.chars().last() {
        Some('K') | Some('k') => (&cleaned[..cleaned.len() - 1], 1e3),
        Some('M') | Some('m') => (&cleaned[..cleaned.len() - 1], 1e6),
        Some('B') | Some('b') => (&cleaned[..cleaned.len() - 1], 1e9),
        _ => (cleaned.as_str(), 1.0),
    };

    match digits.parse::<f64>() {
        Ok(v) if v.is_finite() => v * scale,
        _ => 0.0,
    }
}
