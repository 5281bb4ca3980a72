use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use flowline_core::config::WebhookHandlerConfig;
use flowline_core::context::display_value;
use flowline_core::error::{FlowError, Result};
use flowline_core::traits::ActionHandler;
use flowline_core::types::{ActionResult, RunContext};

use crate::registry::WEBHOOK_KIND;

/// Maximum response body kept on the step output.
const MAX_BODY_CHARS: usize = 10_000;

/// Calls an HTTP endpoint. Non-2xx responses fail the step.
pub struct WebhookHandler {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct WebhookInput {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: Map<String, Value>,
    #[serde(default)]
    body: Option<Value>,
}

fn default_method() -> String {
    "POST".into()
}

impl WebhookHandler {
    pub fn new(config: &WebhookHandlerConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl ActionHandler for WebhookHandler {
    fn execute(
        &self,
        ctx: RunContext,
        config: Map<String, Value>,
    ) -> BoxFuture<'_, Result<ActionResult>> {
        Box::pin(async move {
            let p: WebhookInput = serde_json::from_value(Value::Object(config))
                .map_err(|e| FlowError::action(WEBHOOK_KIND, format!("invalid config: {}", e)))?;

            let method = p
                .method
                .to_uppercase()
                .parse::<reqwest::Method>()
                .map_err(|e| FlowError::action(WEBHOOK_KIND, format!("invalid method: {}", e)))?;

            let mut req = self
                .client
                .request(method, &p.url)
                .header("x-flowline-run", ctx.run_id.as_str())
                .header("x-flowline-workflow", ctx.workflow_id.as_str());
            for (k, v) in &p.headers {
                req = req.header(k.as_str(), display_value(v));
            }
            if let Some(body) = &p.body {
                req = req.json(body);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| FlowError::action(WEBHOOK_KIND, e))?;
            let status = resp.status();
            let text = match resp.text().await {
                Ok(text) => text,
                Err(e) if status.is_success() => {
                    return Err(FlowError::action(
                        WEBHOOK_KIND,
                        format!("reading response from {}: {}", p.url, e),
                    ));
                }
                Err(_) => String::new(),
            };

            debug!(url = %p.url, status = status.as_u16(), "Webhook responded");

            if !status.is_success() {
                return Err(FlowError::action(
                    WEBHOOK_KIND,
                    format!("HTTP {} from {}", status.as_u16(), p.url),
                ));
            }

            let body = serde_json::from_str::<Value>(&text)
                .unwrap_or_else(|_| Value::String(text.chars().take(MAX_BODY_CHARS).collect()));

            Ok(ActionResult::with_output(serde_json::json!({
                "status": status.as_u16(),
                "body": body,
            })))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_core::run::RunId;
    use serde_json::json;

    fn ctx() -> RunContext {
        RunContext {
            run_id: RunId::new(),
            workflow_id: "wf".into(),
            node_id: "hook".into(),
            attempt: 0,
            context: Map::new(),
        }
    }

    fn config(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_missing_url_is_action_error() {
        let handler = WebhookHandler::new(&WebhookHandlerConfig::default());
        let err = handler.execute(ctx(), config(json!({ "method": "GET" }))).await.unwrap_err();
        assert!(matches!(err, FlowError::Action { ref kind, .. } if kind == "webhook"));
        assert!(err.to_string().contains("invalid config"));
    }

    #[tokio::test]
    async fn test_invalid_method_rejected() {
        let handler = WebhookHandler::new(&WebhookHandlerConfig::default());
        let err = handler
            .execute(ctx(), config(json!({ "url": "http://localhost", "method": "NOT A METHOD" })))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid method"));
    }

    /// Serve one canned HTTP response on a loopback port.
    async fn serve_once(response: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{}/hook", addr)
    }

    #[tokio::test]
    async fn test_json_response_becomes_output() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 11\r\nconnection: close\r\n\r\n{\"ok\":true}",
        )
        .await;
        let handler = WebhookHandler::new(&WebhookHandlerConfig::default());
        let result = handler.execute(ctx(), config(json!({ "url": url }))).await.unwrap();
        let output = result.output.unwrap();
        assert_eq!(output["status"], 200);
        assert_eq!(output["body"]["ok"], true);
    }

    #[tokio::test]
    async fn test_truncated_success_body_is_action_error() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 100\r\nconnection: close\r\n\r\n{\"ok\"",
        )
        .await;
        let handler = WebhookHandler::new(&WebhookHandlerConfig::default());
        let err = handler.execute(ctx(), config(json!({ "url": url }))).await.unwrap_err();
        assert!(matches!(err, FlowError::Action { ref kind, .. } if kind == "webhook"));
        assert!(err.to_string().contains("reading response"));
    }

    #[tokio::test]
    async fn test_unparseable_url_fails_without_network() {
        let handler = WebhookHandler::new(&WebhookHandlerConfig::default());
        let err = handler
            .execute(ctx(), config(json!({ "url": "not a url" })))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Action { .. }));
    }
}
