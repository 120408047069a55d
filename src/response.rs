//! Platform-neutral adapter responses

use crate::backend::BackendOutput;
use crate::config::CorsConfig;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Response, StatusCode};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use tracing::warn;

/// Label carried in the `error` field when the backend exits non-zero
pub const SERVER_ERROR_LABEL: &str = "Server error";

pub const CONTENT_TYPE: &str = "Content-Type";
pub const ALLOW_ORIGIN: &str = "Access-Control-Allow-Origin";
pub const ALLOW_HEADERS: &str = "Access-Control-Allow-Headers";
pub const ALLOW_METHODS: &str = "Access-Control-Allow-Methods";
pub const X_PROXY_ERROR: &str = "X-Proxy-Error";

/// Why the front end answered without running the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Request body or the event built from it is too large to hand over
    PayloadTooLarge,
    /// Request body could not be read
    BadRequest,
    /// The event could not be serialized
    InternalError,
}

impl Rejection {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Rejection::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Rejection::BadRequest => StatusCode::BAD_REQUEST,
            Rejection::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value of the `code` field and the X-Proxy-Error header
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Rejection::BadRequest => "BAD_REQUEST",
            Rejection::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Status, headers and body produced for one invocation.
///
/// Serializes to the serverless response shape
/// `{"statusCode": .., "headers": {..}, "body": ".."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterResponse {
    pub status_code: u16,
    #[serde(serialize_with = "headers_as_map", skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    pub body: String,
}

fn headers_as_map<S>(headers: &[(String, String)], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut map = serializer.serialize_map(Some(headers.len()))?;
    for (name, value) in headers {
        map.serialize_entry(name, value)?;
    }
    map.end()
}

/// Parse a complete JSON document with no nesting limit.
///
/// The stack grows on demand while descending into nested values.
pub fn parse_document(text: &str) -> serde_json::Result<serde_json::Value> {
    let mut de = serde_json::Deserializer::from_str(text);
    de.disable_recursion_limit();
    let value = serde_json::Value::deserialize(serde_stacker::Deserializer::new(&mut de))?;
    de.end()?;
    Ok(value)
}

impl AdapterResponse {
    /// Answer to a cross-origin preflight check
    pub fn preflight(cors: &CorsConfig) -> Self {
        Self {
            status_code: StatusCode::OK.as_u16(),
            headers: vec![
                (ALLOW_ORIGIN.to_string(), cors.allow_origin.clone()),
                (ALLOW_HEADERS.to_string(), cors.allow_headers.clone()),
                (ALLOW_METHODS.to_string(), cors.allow_methods.clone()),
            ],
            body: String::new(),
        }
    }

    /// Map a finished backend run to a response.
    pub fn from_output(output: &BackendOutput, cors: &CorsConfig) -> Self {
        if !output.success() {
            return Self::backend_failure(&output.stderr, cors);
        }

        match parse_document(&output.stdout) {
            Ok(value) => Self::json(&value, cors),
            Err(_) => Self::html(&output.stdout, cors),
        }
    }

    /// 500 for a backend that exited non-zero.
    ///
    /// Carries no CORS header unless `cors.on_error` is set.
    pub fn backend_failure(stderr: &str, cors: &CorsConfig) -> Self {
        let body = serde_json::json!({
            "error": SERVER_ERROR_LABEL,
            "details": stderr,
        });
        let mut headers = Vec::new();
        if cors.on_error {
            headers.push((ALLOW_ORIGIN.to_string(), cors.allow_origin.clone()));
        }
        Self {
            status_code: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            headers,
            body: body.to_string(),
        }
    }

    /// 200 with the re-serialized backend document
    pub fn json(value: &serde_json::Value, cors: &CorsConfig) -> Self {
        Self {
            status_code: StatusCode::OK.as_u16(),
            headers: vec![
                (CONTENT_TYPE.to_string(), "application/json".to_string()),
                (ALLOW_ORIGIN.to_string(), cors.allow_origin.clone()),
            ],
            body: value.to_string(),
        }
    }

    /// 200 with the backend output passed through untouched
    pub fn html(text: &str, cors: &CorsConfig) -> Self {
        Self {
            status_code: StatusCode::OK.as_u16(),
            headers: vec![
                (CONTENT_TYPE.to_string(), "text/html".to_string()),
                (ALLOW_ORIGIN.to_string(), cors.allow_origin.clone()),
            ],
            body: text.to_string(),
        }
    }

    /// 500 for a fault that kept the backend from producing an exit status
    pub fn fault(message: impl std::fmt::Display) -> Self {
        let body = serde_json::json!({ "error": message.to_string() });
        Self {
            status_code: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    /// Front-end rejection: `{"code", "message", "status"}` plus X-Proxy-Error
    pub fn rejected(reason: Rejection, message: impl Into<String>) -> Self {
        let status = reason.status_code().as_u16();
        let body = serde_json::json!({
            "code": reason.code(),
            "message": message.into(),
            "status": status,
        });
        Self {
            status_code: status,
            headers: vec![
                (CONTENT_TYPE.to_string(), "application/json".to_string()),
                (X_PROXY_ERROR.to_string(), reason.code().to_string()),
            ],
            body: body.to_string(),
        }
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"statusCode":{},"body":""}}"#, self.status_code)
        })
    }

    /// Convert into a hyper response for the HTTP front end.
    pub fn into_hyper(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let status = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response: Response<BoxBody<Bytes, hyper::Error>> = Response::new(
            Full::new(Bytes::from(self.body))
                .map_err(|never| match never {})
                .boxed(),
        );
        *response.status_mut() = status;

        let headers = response.headers_mut();
        for (name, value) in self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => warn!(header = %name, "Dropping invalid response header"),
            }
        }

        response
    }
}
