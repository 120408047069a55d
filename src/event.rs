//! Serverless-style request events
//!
//! The HTTP front end turns every request into an [`HttpEvent`], which is
//! serialized to JSON and handed to the backend as its last argument.

use hyper::http::request::Parts;
use serde::Serialize;
use std::collections::BTreeMap;

/// Request metadata that is not part of the HTTP message itself
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub request_id: String,
}

/// A request as the backend sees it
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpEvent {
    pub http_method: String,
    pub path: String,
    pub raw_url: String,
    pub raw_query: String,
    /// Lowercase header name to its values joined with `, `
    pub headers: BTreeMap<String, String>,
    pub multi_value_headers: BTreeMap<String, Vec<String>>,
    /// Last value wins
    pub query_string_parameters: BTreeMap<String, String>,
    pub multi_value_query_string_parameters: BTreeMap<String, Vec<String>>,
    pub body: String,
    pub is_base64_encoded: bool,
    pub request_context: RequestContext,
}

impl HttpEvent {
    /// Build an event from a request head and its fully collected body.
    pub fn from_parts(parts: &Parts, body: &[u8], request_id: &str, is_tls: bool) -> Self {
        let mut multi_value_headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in &parts.headers {
            // Non-UTF-8 header values cannot be represented in the JSON event
            if let Ok(value) = value.to_str() {
                multi_value_headers
                    .entry(name.as_str().to_string())
                    .or_default()
                    .push(value.to_string());
            }
        }
        let headers = multi_value_headers
            .iter()
            .map(|(name, values)| (name.clone(), values.join(", ")))
            .collect();

        let raw_query = parts.uri.query().unwrap_or("").to_string();
        let multi_value_query_string_parameters = parse_query(&raw_query);
        let query_string_parameters = multi_value_query_string_parameters
            .iter()
            .filter_map(|(name, values)| values.last().map(|v| (name.clone(), v.clone())))
            .collect();

        let path = parts.uri.path().to_string();
        let scheme = if is_tls { "https" } else { "http" };
        let host = parts
            .headers
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(String::from)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_else(|| "localhost".to_string());
        let raw_url = if raw_query.is_empty() {
            format!("{}://{}{}", scheme, host, path)
        } else {
            format!("{}://{}{}?{}", scheme, host, path, raw_query)
        };

        let (body, is_base64_encoded) = match std::str::from_utf8(body) {
            Ok(text) => (text.to_string(), false),
            Err(_) => (
                base64::Engine::encode(&base64::engine::general_purpose::STANDARD, body),
                true,
            ),
        };

        Self {
            http_method: parts.method.as_str().to_string(),
            path,
            raw_url,
            raw_query,
            headers,
            multi_value_headers,
            query_string_parameters,
            multi_value_query_string_parameters,
            body,
            is_base64_encoded,
            request_context: RequestContext {
                request_id: request_id.to_string(),
            },
        }
    }

    /// Convert to the opaque JSON mapping the handler works on
    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// Parse a form-encoded query string into name -> values.
fn parse_query(query: &str) -> BTreeMap<String, Vec<String>> {
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        params
            .entry(decode_component(name))
            .or_default()
            .push(decode_component(value));
    }
    params
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}
