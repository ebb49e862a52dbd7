//! AQ-008: Chart block extraction from the narrative answer.
//!
//! A chart block is a fenced code block with info string `chart`, or a
//! `json` block whose object has both `type` and `data`. Every chart block
//! is stripped from the text; the first one that parses becomes the
//! `ChartSpec`.

use super::types::{ChartKind, ChartPoint, ChartSpec};
use indexmap::IndexMap;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_-]*)[^\n]*\n(.*?)```").expect("fenced block pattern")
});

static EXTRA_BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("blank line pattern"));

const LABEL_KEYS: &[&str] = &["label", "name", "category", "x"];
const VALUE_KEYS: &[&str] = &["value", "count", "total", "y"];

/// Split a narrative into clean text and an optional chart.
pub fn extract_chart(text: &str, max_categories: usize) -> (String, Option<ChartSpec>) {
    let mut chart = None;
    let mut cleaned = String::with_capacity(text.len());
    let mut last = 0;

    for caps in FENCED_BLOCK.captures_iter(text) {
        let (Some(whole), Some(info), Some(body)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        if !is_chart_block(info.as_str(), body.as_str()) {
            continue;
        }
        cleaned.push_str(&text[last..whole.start()]);
        last = whole.end();

        if chart.is_none() {
            chart = parse_chart(body.as_str(), max_categories);
            if chart.is_none() {
                tracing::debug!("discarding malformed chart block");
            }
        }
    }
    cleaned.push_str(&text[last..]);

    let cleaned = EXTRA_BLANK_LINES.replace_all(&cleaned, "\n\n");
    (cleaned.trim().to_string(), chart)
}

fn is_chart_block(info: &str, body: &str) -> bool {
    match info.to_ascii_lowercase().as_str() {
        "chart" => true,
        "json" => serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v.as_object().map(|o| o.contains_key("type") && o.contains_key("data")))
            .unwrap_or(false),
        _ => false,
    }
}

/// Parse a chart object. `None` unless the kind is recognized and, for
/// kinds other than `none`, `data` is an array.
pub fn parse_chart(body: &str, max_categories: usize) -> Option<ChartSpec> {
    let value: Value = serde_json::from_str(body.trim()).ok()?;
    let obj = value.as_object()?;

    let kind_name = obj.get("type").or_else(|| obj.get("kind"))?.as_str()?;
    let kind = ChartKind::parse(kind_name)?;

    let x_key = string_field(obj, &["xKey", "x_key"]);
    let y_key = string_field(obj, &["yKey", "y_key"]);
    let description = string_field(obj, &["description", "title"]);

    let data = match (kind, obj.get("data")) {
        (ChartKind::None, None) => Vec::new(),
        (_, Some(Value::Array(items))) => items
            .iter()
            .filter_map(|item| point(item, x_key.as_deref(), y_key.as_deref()))
            .take(max_categories)
            .collect(),
        _ => return None,
    };

    Some(ChartSpec {
        kind,
        data,
        x_key,
        y_key,
        description,
    })
}

fn string_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

fn point(item: &Value, x_key: Option<&str>, y_key: Option<&str>) -> Option<ChartPoint> {
    let obj = item.as_object()?;

    let label_key = x_key
        .filter(|k| obj.contains_key(*k))
        .or_else(|| LABEL_KEYS.iter().copied().find(|k| obj.contains_key(*k)))?;
    let value_key = y_key
        .filter(|k| obj.contains_key(*k))
        .or_else(|| VALUE_KEYS.iter().copied().find(|k| obj.contains_key(*k)))?;

    let label = match obj.get(label_key)? {
        Value::String(s) => s.clone(),
        Value::Null => return None,
        other => other.to_string(),
    };
    let value = match obj.get(value_key)? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };

    let extra: IndexMap<String, Value> = obj
        .iter()
        .filter(|(k, _)| k.as_str() != label_key && k.as_str() != value_key)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Some(ChartPoint {
        label,
        value,
        extra,
    })
}
