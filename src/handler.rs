//! The request adapter
//!
//! [`Handler::handle`] is the whole contract: preflight requests are answered
//! locally, everything else is serialized and handed to the backend, and the
//! backend's exit status and output decide the response.

use crate::backend::BackendRunner;
use crate::config::{Config, CorsConfig};
use crate::response::AdapterResponse;
use tracing::{debug, error, warn};

/// Method that marks a cross-origin preflight check
pub const PREFLIGHT_METHOD: &str = "OPTIONS";

/// Shared by all invocations; holds configuration only.
#[derive(Debug, Clone)]
pub struct Handler {
    runner: BackendRunner,
    cors: CorsConfig,
}

impl Handler {
    pub fn new(runner: BackendRunner, cors: CorsConfig) -> Self {
        Self { runner, cors }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self::new(
            BackendRunner::from_config(&config.backend)?,
            config.cors.clone(),
        ))
    }

    pub fn cors(&self) -> &CorsConfig {
        &self.cors
    }

    /// Handle one event. Every path produces a response.
    pub async fn handle(&self, event: &serde_json::Value) -> AdapterResponse {
        if http_method(event) == Some(PREFLIGHT_METHOD) {
            debug!("Answering preflight request");
            return AdapterResponse::preflight(&self.cors);
        }

        let payload = event.to_string();

        match self.runner.run(&payload).await {
            Ok(output) => {
                if !output.success() {
                    warn!(
                        program = %self.runner.program(),
                        status = ?output.status,
                        stderr = %output.stderr.trim_end(),
                        "Backend exited with failure"
                    );
                }
                AdapterResponse::from_output(&output, &self.cors)
            }
            Err(e) => {
                error!(program = %self.runner.program(), error = %e, "Backend invocation failed");
                AdapterResponse::fault(e)
            }
        }
    }
}

/// The `httpMethod` field of an event, if it is a string
pub fn http_method(event: &serde_json::Value) -> Option<&str> {
    event.get("httpMethod").and_then(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::response::{ALLOW_ORIGIN, CONTENT_TYPE, SERVER_ERROR_LABEL};
    use serde_json::json;

    fn handler(script: &str) -> Handler {
        let config = BackendConfig::new("sh").with_args(vec![
            "-c".to_string(),
            script.to_string(),
            "backend".to_string(),
        ]);
        Handler::new(BackendRunner::from_config(&config).unwrap(), CorsConfig::default())
    }

    #[tokio::test]
    async fn test_preflight_skips_backend() {
        // The backend would fail loudly if it ran
        let handler = handler("echo ran >&2; exit 1");
        let event = json!({"httpMethod": "OPTIONS", "path": "/anything", "body": "ignored"});

        let response = handler.handle(&event).await;

        assert_eq!(response, AdapterResponse::preflight(&CorsConfig::default()));
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, "");
    }

    #[tokio::test]
    async fn test_lowercase_options_is_not_preflight() {
        let handler = handler("echo proxied");
        let response = handler.handle(&json!({"httpMethod": "options"})).await;

        assert_eq!(response.header(CONTENT_TYPE), Some("text/html"));
        assert_eq!(response.body, "proxied\n");
    }

    #[tokio::test]
    async fn test_event_is_passed_verbatim() {
        let handler = handler(r#"printf '%s' "$1""#);
        let event = json!({"httpMethod": "POST", "path": "/r", "zeta": 1, "alpha": {"b": 2, "a": 1}});

        let response = handler.handle(&event).await;

        assert_eq!(response.status_code, 200);
        assert_eq!(response.header(CONTENT_TYPE), Some("application/json"));
        assert_eq!(response.body, event.to_string());
    }

    #[tokio::test]
    async fn test_json_backend() {
        let handler = handler(r#"echo '{"status": "ok", "count": 3}'"#);
        let response = handler.handle(&json!({"httpMethod": "GET"})).await;

        assert_eq!(response.status_code, 200);
        assert_eq!(response.header(ALLOW_ORIGIN), Some("*"));
        let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body, json!({"status": "ok", "count": 3}));
    }

    #[tokio::test]
    async fn test_html_backend() {
        let handler = handler("printf '<p>hello</p>'");
        let response = handler.handle(&json!({"httpMethod": "GET"})).await;

        assert_eq!(response.status_code, 200);
        assert_eq!(response.header(CONTENT_TYPE), Some("text/html"));
        assert_eq!(response.body, "<p>hello</p>");
    }

    #[tokio::test]
    async fn test_failing_backend() {
        let handler = handler("printf boom >&2; exit 7");
        let response = handler.handle(&json!({"httpMethod": "DELETE"})).await;

        assert_eq!(response.status_code, 500);
        assert_eq!(response.header(ALLOW_ORIGIN), None);
        let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["error"], SERVER_ERROR_LABEL);
        assert!(body["details"].as_str().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_a_response() {
        let runner =
            BackendRunner::from_config(&BackendConfig::new("/nonexistent/execgate-backend")).unwrap();
        let handler = Handler::new(runner, CorsConfig::default());

        let response = handler.handle(&json!({"httpMethod": "GET"})).await;

        assert_eq!(response.status_code, 500);
        let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("Failed to spawn backend '/nonexistent/execgate-backend'"));
        assert!(body.get("details").is_none());
    }

    #[tokio::test]
    async fn test_timeout_is_a_fault_response() {
        let config = BackendConfig::new("sleep")
            .with_args(vec!["30".to_string()])
            .with_timeout_secs(1);
        let handler = Handler::new(BackendRunner::from_config(&config).unwrap(), CorsConfig::default());

        let response = handler.handle(&json!({"httpMethod": "GET"})).await;

        assert_eq!(response.status_code, 500);
        let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["error"], "Backend timed out after 1 seconds");
    }

    #[tokio::test]
    async fn test_oversized_event_is_a_fault_response() {
        let handler = handler("echo ran");
        let body = "x".repeat(crate::backend::MAX_ARGUMENT_BYTES);

        let response = handler.handle(&json!({"httpMethod": "POST", "body": body})).await;

        assert_eq!(response.status_code, 500);
        let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
        assert!(body["error"].as_str().unwrap().contains("argument limit"));
    }

    #[tokio::test]
    async fn test_deeply_nested_backend_output_stays_json() {
        let document = format!("{}{}", "{\"a\":".repeat(300), "1") + &"}".repeat(300);
        let handler = handler(&format!("printf '%s' '{}'", document));

        let response = handler.handle(&json!({"httpMethod": "GET"})).await;

        assert_eq!(response.status_code, 200);
        assert_eq!(response.header(CONTENT_TYPE), Some("application/json"));
        assert_eq!(response.body, document);
    }

    #[tokio::test]
    async fn test_missing_method_is_proxied() {
        let handler = handler("echo '[1,2]'");
        let response = handler.handle(&json!({"path": "/"})).await;

        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, "[1,2]");
    }

    #[tokio::test]
    async fn test_repeated_invocations_are_identical() {
        let handler = handler(r#"printf '{"echo": %s}' "$1""#);
        let event = json!({"httpMethod": "GET", "path": "/same"});

        let first = handler.handle(&event).await;
        let second = handler.handle(&event).await;

        assert_eq!(first, second);
        assert_eq!(first.to_json(), second.to_json());
    }

    #[tokio::test]
    async fn test_concurrent_invocations_do_not_mix() {
        let handler = handler(r#"printf '%s' "$1""#);

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let event = json!({"httpMethod": "POST", "id": i});
                    (event.clone(), handler.handle(&event).await)
                })
            })
            .collect();

        for task in tasks {
            let (event, response) = task.await.unwrap();
            let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
            assert_eq!(body, event);
        }
    }

    #[test]
    fn test_http_method() {
        assert_eq!(http_method(&json!({"httpMethod": "GET"})), Some("GET"));
        assert_eq!(http_method(&json!({"httpMethod": 5})), None);
        assert_eq!(http_method(&json!({})), None);
        assert_eq!(http_method(&json!("OPTIONS")), None);
    }
}
