//! Response body normalization.
//!
//! Mobile connections regularly deliver partial bodies, gateway HTML error
//! pages, and encoding artifacts. Everything in this module turns such bodies
//! into a structured value without ever returning a parse error: a body that
//! cannot be read degrades to "no data".
//!
//! The truncation and repair passes are heuristics. They can flag valid but
//! unusual JSON as truncated (a `{` inside a string value unbalances the brace
//! count) and can miss truncation that happens to leave the text balanced.

use crate::{classify::ErrorClass, Error};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

const EMPTY_MESSAGE: &str = "Empty response";
const TRUNCATED_MESSAGE: &str = "Response was truncated, returning empty data";
const UNPARSEABLE_MESSAGE: &str = "Response could not be parsed, returning empty data";
const NON_JSON_ERROR: &str = "Server returned non-JSON response";
const RAW_PREVIEW_CHARS: usize = 500;

static TRAILING_COMMA: OnceLock<Regex> = OnceLock::new();
static BARE_KEY: OnceLock<Regex> = OnceLock::new();

/// The canonical result shape handed to callers when a body had to be
/// wrapped or could not be read.
///
/// `data` is never `null`: unreadable bodies produce an empty array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedResponse {
    pub success: bool,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl NormalizedResponse {
    fn empty(success: bool) -> Self {
        Self {
            success,
            data: Value::Array(Vec::new()),
            message: None,
            error: None,
            status: None,
            raw_response: None,
            count: None,
            error_code: None,
        }
    }

    fn degraded(message: &str) -> Self {
        Self {
            message: Some(message.to_string()),
            ..Self::empty(true)
        }
    }

    /// Converts into a JSON value, omitting absent fields.
    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Array(Vec::new()))
    }
}

/// Outcome of [`parse`].
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedBody {
    /// The body (or a JSON fragment embedded in it) parsed, possibly after repair.
    Json(Value),
    /// The body was empty, truncated, unparseable, or not JSON at all.
    Fallback(NormalizedResponse),
}

impl ParsedBody {
    /// Returns the parsed value, or the fallback rendered as a value.
    pub fn into_value(self) -> Value {
        match self {
            ParsedBody::Json(value) => value,
            ParsedBody::Fallback(response) => response.into_value(),
        }
    }

    /// Returns `true` if the body produced real JSON.
    pub fn is_json(&self) -> bool {
        matches!(self, ParsedBody::Json(_))
    }
}

/// Parses a raw response body.
///
/// Never fails; see the module documentation for the degradation rules.
///
/// # Examples
///
/// ```
/// use tartrack_net::normalize::{parse, ParsedBody};
///
/// let parsed = parse("{'fare': 150,}", "application/json");
/// assert_eq!(parsed, ParsedBody::Json(serde_json::json!({"fare": 150})));
///
/// let parsed = parse("{\"rides\": [1, 2", "application/json");
/// assert!(!parsed.is_json());
/// ```
pub fn parse(raw_text: &str, content_type: &str) -> ParsedBody {
    if raw_text.trim().is_empty() {
        return ParsedBody::Fallback(NormalizedResponse::degraded(EMPTY_MESSAGE));
    }

    if !content_type.to_ascii_lowercase().contains("application/json") {
        return match embedded_object(raw_text) {
            Some(fragment) => {
                tracing::debug!(
                    content_type = content_type,
                    "Extracting JSON fragment from non-JSON response"
                );
                parse_json_text(fragment)
            }
            None => {
                tracing::warn!(content_type = content_type, "Server returned non-JSON response");
                ParsedBody::Fallback(NormalizedResponse {
                    error: Some(NON_JSON_ERROR.to_string()),
                    raw_response: Some(raw_text.chars().take(RAW_PREVIEW_CHARS).collect()),
                    ..NormalizedResponse::empty(false)
                })
            }
        };
    }

    parse_json_text(raw_text)
}

fn parse_json_text(raw_text: &str) -> ParsedBody {
    let cleaned = clean(raw_text);

    if cleaned.is_empty() {
        return ParsedBody::Fallback(NormalizedResponse::degraded(EMPTY_MESSAGE));
    }

    if looks_truncated(&cleaned) {
        tracing::warn!(length = cleaned.len(), "Response appears truncated");
        return ParsedBody::Fallback(NormalizedResponse::degraded(TRUNCATED_MESSAGE));
    }

    match serde_json::from_str::<Value>(&cleaned) {
        Ok(value) => ParsedBody::Json(value),
        Err(strict_error) => {
            let repaired = repair(&cleaned);
            match serde_json::from_str::<Value>(&repaired) {
                Ok(value) => {
                    tracing::debug!(error = %strict_error, "Parsed response after repair pass");
                    ParsedBody::Json(value)
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        preview = %cleaned.chars().take(100).collect::<String>(),
                        "Failed to parse response, returning empty data"
                    );
                    ParsedBody::Fallback(NormalizedResponse::degraded(UNPARSEABLE_MESSAGE))
                }
            }
        }
    }
}

/// Finds the outermost `{...}` span, covering HTML pages that wrap a JSON error.
fn embedded_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Strips a byte-order mark, decodes HTML entities, and trims.
fn clean(text: &str) -> String {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    decode_entities(text).trim().to_string()
}

/// Decodes `&amp; &lt; &gt; &quot; &#39;` in a single left-to-right pass, so
/// `&amp;lt;` becomes `&lt;` and not `<`.
fn decode_entities(text: &str) -> String {
    const ENTITIES: &[(&str, char)] = &[
        ("&amp;", '&'),
        ("&lt;", '<'),
        ("&gt;", '>'),
        ("&quot;", '"'),
        ("&#39;", '\''),
    ];

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        match ENTITIES.iter().find(|(entity, _)| rest.starts_with(entity)) {
            Some((entity, decoded)) => {
                out.push(*decoded);
                rest = &rest[entity.len()..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn looks_truncated(text: &str) -> bool {
    if text.ends_with('{') || text.ends_with('[') || text.ends_with(',') || text.ends_with("{\"")
    {
        return true;
    }

    let count = |c: char| text.chars().filter(|&x| x == c).count();
    count('{') != count('}') || count('[') != count(']')
}

fn repair(text: &str) -> String {
    let trailing_comma = TRAILING_COMMA
        .get_or_init(|| Regex::new(r",\s*([}\]])").expect("trailing comma pattern is valid"));
    let bare_key = BARE_KEY.get_or_init(|| {
        Regex::new(r"([{,]\s*)([A-Za-z_$][A-Za-z0-9_$]*)(\s*:)").expect("bare key pattern is valid")
    });

    let repaired = trailing_comma.replace_all(text, "$1");
    let repaired = bare_key.replace_all(&repaired, "$1\"$2\"$3");
    repaired
        .replace('\'', "\"")
        .chars()
        .filter(|c| !matches!(*c as u32, 0x00..=0x1f | 0x7f))
        .collect()
}

/// Wraps any value into a [`NormalizedResponse`] whose `data` is an array.
///
/// Arrays pass through, `null` becomes `[]`, and any other value becomes a
/// single-element array.
///
/// # Examples
///
/// ```
/// use tartrack_net::normalize::create_safe_response;
/// use serde_json::json;
///
/// let wrapped = create_safe_response(json!({"id": 7}), true, None);
/// assert_eq!(wrapped.data, json!([{"id": 7}]));
/// assert_eq!(wrapped.count, Some(1));
/// ```
pub fn create_safe_response(
    data: Value,
    success: bool,
    message: Option<String>,
) -> NormalizedResponse {
    let items = match data {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    };

    NormalizedResponse {
        success,
        count: Some(items.len()),
        data: Value::Array(items),
        message,
        ..NormalizedResponse::empty(success)
    }
}

/// Turns an error into a failed [`NormalizedResponse`] carrying `fallback_data`.
///
/// Screens use this to keep rendering with cached or empty data after a
/// request failed.
pub fn handle_error(error: &Error, fallback_data: Value) -> NormalizedResponse {
    let (message, code) = match error.class() {
        ErrorClass::Timeout => (
            "Request timed out. Please check your connection and try again.".to_string(),
            "TIMEOUT",
        ),
        ErrorClass::Connection | ErrorClass::Socket | ErrorClass::RecoverableTransport => (
            "Network error. Please check your internet connection.".to_string(),
            "NETWORK_ERROR",
        ),
        ErrorClass::Server5xx | ErrorClass::Unknown => (error.to_string(), "UNKNOWN_ERROR"),
    };

    NormalizedResponse {
        error: Some(message),
        data: fallback_data,
        status: error.status().map(|s| s.as_u16()),
        error_code: Some(code.to_string()),
        ..NormalizedResponse::empty(false)
    }
}
