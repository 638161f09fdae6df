//! The nine built-in node-type handlers (spec.md §4.2).

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};

use super::expr;
use super::{Handler, HandlerResult};
use crate::domain::{NodeType, WorkerJob};

/// Cap on `delay` node sleeps, shared with `EngineConfig::max_delay`.
pub const MAX_DELAY_MS: u64 = 300_000;

fn config_str<'a>(config: &'a Value, field: &str, default: &'a str) -> &'a str {
    config.get(field).and_then(Value::as_str).unwrap_or(default)
}

pub struct StartHandler;

#[async_trait]
impl Handler for StartHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Start
    }

    async fn execute(&self, job: &WorkerJob) -> HandlerResult {
        let started = Instant::now();
        let result = json!({ "message": "workflow started", "input": job.input });
        HandlerResult::completed(job, result, started)
    }
}

pub struct EndHandler;

#[async_trait]
impl Handler for EndHandler {
    fn node_type(&self) -> NodeType {
        NodeType::End
    }

    async fn execute(&self, job: &WorkerJob) -> HandlerResult {
        let started = Instant::now();
        let result = json!({ "message": "lineage terminated" });
        HandlerResult::completed(job, result, started)
    }
}

/// `action` — dispatches on `config.actionType` (`"default"` | `"http"` |
/// `"email"`). `http` performs a real request; the others are deterministic
/// simulations, since an actual email transport is outside this core's
/// scope.
pub struct ActionHandler {
    http: reqwest::Client,
}

impl ActionHandler {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for ActionHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for ActionHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Action
    }

    async fn execute(&self, job: &WorkerJob) -> HandlerResult {
        let started = Instant::now();
        let action_type = config_str(&job.node.config, "actionType", "default").to_string();

        match action_type.as_str() {
            "http" => self.execute_http(job, started).await,
            "email" => {
                let to = config_str(&job.node.config, "to", "").to_string();
                let subject = config_str(&job.node.config, "subject", "").to_string();
                HandlerResult::completed(
                    job,
                    json!({ "simulated": true, "channel": "email", "to": to, "subject": subject }),
                    started,
                )
            }
            _ => HandlerResult::completed(
                job,
                json!({ "simulated": true, "channel": "default" }),
                started,
            ),
        }
    }
}

impl ActionHandler {
    async fn execute_http(&self, job: &WorkerJob, started: Instant) -> HandlerResult {
        let Some(url) = job.node.config.get("url").and_then(Value::as_str) else {
            return HandlerResult::failed(job, "http action missing config.url", false, started);
        };
        let method = config_str(&job.node.config, "method", "GET").to_uppercase();
        let method = match method.parse::<reqwest::Method>() {
            Ok(m) => m,
            Err(_) => {
                return HandlerResult::failed(
                    job,
                    format!("invalid http method: {method}"),
                    false,
                    started,
                )
            }
        };

        let mut request = self.http.request(method, url);

        if let Some(headers) = job.node.config.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key, value);
                }
            }
        }

        if let Some(body) = job.node.config.get("body") {
            request = request.json(body);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let content_type = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();

                let body_text = match response.text().await {
                    Ok(text) => text,
                    Err(err) => {
                        return HandlerResult::failed(job, err.to_string(), true, started)
                    }
                };

                let body_value = if content_type.contains("application/json") {
                    serde_json::from_str(&body_text).unwrap_or(Value::String(body_text))
                } else {
                    Value::String(body_text)
                };

                HandlerResult::completed(job, json!({ "status": status, "body": body_value }), started)
            }
            Err(err) => HandlerResult::failed(job, err.to_string(), true, started),
        }
    }
}

/// `condition` — evaluates `config.expression`; `result.result: bool` drives
/// downstream edge selection in the Result Handler.
pub struct ConditionHandler;

#[async_trait]
impl Handler for ConditionHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Condition
    }

    async fn execute(&self, job: &WorkerJob) -> HandlerResult {
        let started = Instant::now();
        let expression = config_str(&job.node.config, "expression", "false");
        let value = expr::evaluate_condition(expression, &job.input, &job.previous_results);
        HandlerResult::completed(job, json!({ "result": value }), started)
    }
}

/// `delay` — sleeps `min(config.delayMs, MAX_DELAY_MS)`, or until
/// `config.scheduledTime` (an RFC 3339 absolute timestamp) if given.
pub struct DelayHandler;

#[async_trait]
impl Handler for DelayHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Delay
    }

    async fn execute(&self, job: &WorkerJob) -> HandlerResult {
        let started = Instant::now();

        let wait = if let Some(scheduled) = job
            .node
            .config
            .get("scheduledTime")
            .and_then(Value::as_str)
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        {
            let now = Utc::now();
            let target = scheduled.with_timezone(&Utc);
            (target - now).to_std().unwrap_or_default()
        } else {
            let requested = job
                .node
                .config
                .get("delayMs")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            std::time::Duration::from_millis(requested.min(MAX_DELAY_MS))
        };

        tokio::time::sleep(wait).await;
        HandlerResult::completed(job, json!({ "waitedMs": wait.as_millis() as u64 }), started)
    }
}

/// `fork` — completes immediately, passing input through; fan-out is
/// carried by the node's outgoing edges, not by this handler.
pub struct ForkHandler;

#[async_trait]
impl Handler for ForkHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Fork
    }

    async fn execute(&self, job: &WorkerJob) -> HandlerResult {
        let started = Instant::now();
        HandlerResult::completed(job, job.input.clone(), started)
    }
}

/// `join` — the Result Handler only schedules a `join` job once every
/// in-edge source has settled, so by the time this executes it simply
/// reports the merged upstream results; it never waits itself.
pub struct JoinHandler;

#[async_trait]
impl Handler for JoinHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Join
    }

    async fn execute(&self, job: &WorkerJob) -> HandlerResult {
        let started = Instant::now();
        HandlerResult::completed(
            job,
            json!({ "mergedResults": job.previous_results.clone() }),
            started,
        )
    }
}

/// `transform` — applies, in order: `mappings` (token → expression),
/// `pick`, `rename`, `template` (`{{$ref}}` interpolation).
pub struct TransformHandler;

#[async_trait]
impl Handler for TransformHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Transform
    }

    async fn execute(&self, job: &WorkerJob) -> HandlerResult {
        let started = Instant::now();
        let config = &job.node.config;
        let mut output: Map<String, Value> = job
            .input
            .as_object()
            .cloned()
            .unwrap_or_default();

        if let Some(mappings) = config.get("mappings").and_then(Value::as_object) {
            for (field, expression) in mappings {
                let resolved = match expression {
                    Value::String(token) => expr::resolve(token, &job.input, &job.previous_results),
                    other => other.clone(),
                };
                output.insert(field.clone(), resolved);
            }
        }

        if let Some(pick) = config.get("pick").and_then(Value::as_array) {
            let keep: Vec<String> = pick
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect();
            output.retain(|k, _| keep.contains(k));
        }

        if let Some(rename) = config.get("rename").and_then(Value::as_object) {
            for (old_name, new_name) in rename {
                if let Some(new_name) = new_name.as_str() {
                    if let Some(value) = output.remove(old_name) {
                        output.insert(new_name.to_string(), value);
                    }
                }
            }
        }

        if let Some(template) = config.get("template").and_then(Value::as_object) {
            for (field, template_str) in template {
                if let Some(template_str) = template_str.as_str() {
                    let rendered =
                        expr::interpolate(template_str, &job.input, &job.previous_results);
                    output.insert(field.clone(), Value::String(rendered));
                }
            }
        }

        HandlerResult::completed(job, Value::Object(output), started)
    }
}

/// `webhook_response` — builds a response body from `config.responseFields`
/// or, absent those, all recorded previous results.
pub struct WebhookResponseHandler;

#[async_trait]
impl Handler for WebhookResponseHandler {
    fn node_type(&self) -> NodeType {
        NodeType::WebhookResponse
    }

    async fn execute(&self, job: &WorkerJob) -> HandlerResult {
        let started = Instant::now();
        let config = &job.node.config;

        let mut body: Map<String, Value> = if let Some(fields) =
            config.get("responseFields").and_then(Value::as_array)
        {
            let mut body = Map::new();
            for field in fields.iter().filter_map(Value::as_str) {
                if let Some(value) = job.previous_results.get(field) {
                    body.insert(field.to_string(), value.clone());
                }
            }
            body
        } else {
            job.previous_results.as_object().cloned().unwrap_or_default()
        };

        if config
            .get("includeMetadata")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            body.insert(
                "_metadata".to_string(),
                json!({
                    "executionId": job.execution_id,
                    "nodeId": job.node.id,
                    "timestamp": Utc::now().to_rfc3339(),
                }),
            );
        }

        HandlerResult::completed(job, Value::Object(body), started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Node;
    use crate::reliability::RetryPolicy;
    use uuid::Uuid;

    fn job_with(node_type: NodeType, config: Value, input: Value, previous_results: Value) -> WorkerJob {
        WorkerJob {
            id: Uuid::now_v7(),
            execution_id: Uuid::now_v7(),
            node: Node {
                id: "n".into(),
                node_type,
                label: "N".into(),
                config,
                position: None,
            },
            input,
            previous_results,
            attempt: 1,
            max_retries: 0,
            retry_policy: RetryPolicy::default(),
        }
    }

    #[tokio::test]
    async fn start_handler_echoes_input() {
        let job = job_with(NodeType::Start, json!({}), json!({"x": 1}), json!({}));
        let result = StartHandler.execute(&job).await;
        assert_eq!(result.result.unwrap()["input"], json!({"x": 1}));
    }

    #[tokio::test]
    async fn condition_handler_reports_boolean_result() {
        let job = job_with(
            NodeType::Condition,
            json!({"expression": "1"}),
            json!({}),
            json!({}),
        );
        let result = ConditionHandler.execute(&job).await;
        assert_eq!(result.result.unwrap(), json!({"result": true}));
    }

    #[tokio::test]
    async fn delay_handler_caps_at_max_delay() {
        let job = job_with(
            NodeType::Delay,
            json!({"delayMs": 1}),
            json!({}),
            json!({}),
        );
        let result = DelayHandler.execute(&job).await;
        assert_eq!(result.status, super::super::HandlerStatus::Completed);
    }

    #[tokio::test]
    async fn join_handler_reports_merged_results() {
        let job = job_with(
            NodeType::Join,
            json!({}),
            json!({}),
            json!({"A": {"x": 1}, "B": {"y": 2}}),
        );
        let result = JoinHandler.execute(&job).await;
        let merged = &result.result.unwrap()["mergedResults"];
        assert_eq!(merged["A"], json!({"x": 1}));
        assert_eq!(merged["B"], json!({"y": 2}));
    }

    #[tokio::test]
    async fn transform_applies_mappings_pick_rename_template_in_order() {
        let job = job_with(
            NodeType::Transform,
            json!({
                "mappings": {"doubled": "$input.value"},
                "pick": ["doubled", "greeting"],
                "rename": {"doubled": "result"},
                "template": {"greeting": "hi {{$input.name}}"}
            }),
            json!({"value": 21, "name": "Ada", "unused": true}),
            json!({}),
        );
        let result = TransformHandler.execute(&job).await;
        let output = result.result.unwrap();
        assert_eq!(output["result"], json!(21));
        assert_eq!(output["greeting"], json!("hi Ada"));
        assert!(output.get("unused").is_none());
    }

    #[tokio::test]
    async fn webhook_response_picks_requested_fields() {
        let job = job_with(
            NodeType::WebhookResponse,
            json!({"responseFields": ["A"], "includeMetadata": true}),
            json!({}),
            json!({"A": {"ok": true}, "B": {"ignored": true}}),
        );
        let result = WebhookResponseHandler.execute(&job).await;
        let body = result.result.unwrap();
        assert_eq!(body["A"], json!({"ok": true}));
        assert!(body.get("B").is_none());
        assert!(body.get("_metadata").is_some());
    }

    #[tokio::test]
    async fn action_handler_defaults_to_simulated_default_channel() {
        let job = job_with(NodeType::Action, json!({}), json!({}), json!({}));
        let result = ActionHandler::new().execute(&job).await;
        assert_eq!(result.result.unwrap()["channel"], json!("default"));
    }

    #[tokio::test]
    async fn action_handler_http_without_url_is_non_retryable_failure() {
        let job = job_with(
            NodeType::Action,
            json!({"actionType": "http"}),
            json!({}),
            json!({}),
        );
        let result = ActionHandler::new().execute(&job).await;
        assert_eq!(result.status, super::super::HandlerStatus::Failed);
        assert_eq!(result.retryable, Some(false));
    }
}
