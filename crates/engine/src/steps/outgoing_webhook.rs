//! Outgoing webhook step.
//!
//! HTTP goes through the [`WebhookClient`] collaborator so runs can be tested without a
//! network. Non-2xx responses are reported as `success: false` with the response
//! attached, not as execution errors.

use std::time::Instant;

use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::{Client, Method};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stepwise_types::StepId;
use tracing::{debug, warn};

use super::{StepCapability, StepContext, StepDescriptor, StepFamily, StepSchema, parse_inputs, to_outputs};
use crate::error::StepExecutionError;

#[derive(JsonSchema, Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: IndexMap<String, String>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookResponse {
    pub status: u16,
    /// Parsed JSON body, or the raw text when the body is not JSON.
    pub body: Value,
}

/// HTTP collaborator used by the webhook step.
#[async_trait]
pub trait WebhookClient: Send + Sync {
    async fn send(&self, request: WebhookRequest) -> Result<WebhookResponse, StepExecutionError>;
}

#[derive(Debug, Clone, Default)]
pub struct ReqwestWebhookClient {
    client: Client,
}

impl ReqwestWebhookClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WebhookClient for ReqwestWebhookClient {
    async fn send(&self, request: WebhookRequest) -> Result<WebhookResponse, StepExecutionError> {
        let start = Instant::now();
        let method = Method::from(request.method);
        let mut request_builder = self.client.request(method.clone(), &request.url);
        for (name, value) in &request.headers {
            request_builder = request_builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            request_builder = request_builder.json(body);
        }

        let response = request_builder.send().await.map_err(|error| {
            warn!(method = %method, url = %request.url, error = %error, "webhook request failed");
            StepExecutionError::Webhook {
                message: error.to_string(),
            }
        })?;
        let status = response.status();
        let body_text = response.text().await.map_err(|error| StepExecutionError::Webhook {
            message: error.to_string(),
        })?;
        debug!(
            method = %method,
            url = %request.url,
            status = %status,
            duration_ms = start.elapsed().as_millis(),
            "webhook request completed"
        );

        let body = if body_text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body_text).unwrap_or(Value::String(body_text))
        };
        Ok(WebhookResponse {
            status: status.as_u16(),
            body,
        })
    }
}

#[derive(JsonSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutgoingWebhookInputs {
    #[schemars(description = "Destination URL.")]
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    /// Request body. Strings holding JSON are sent as JSON.
    #[serde(default)]
    pub body: Option<Value>,
}

#[derive(JsonSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutgoingWebhookOutputs {
    pub success: bool,
    pub http_status: u16,
    pub response: Value,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OutgoingWebhookStep;

fn normalize_body(body: Option<Value>) -> Option<Value> {
    match body {
        Some(Value::String(text)) => Some(serde_json::from_str(&text).unwrap_or(Value::String(text))),
        Some(Value::Null) | None => None,
        other => other,
    }
}

#[async_trait]
impl StepCapability for OutgoingWebhookStep {
    fn descriptor(&self) -> StepDescriptor {
        StepDescriptor {
            step_id: StepId::OutgoingWebhook,
            name: "Outgoing webhook",
            description: "Sends an HTTP request to an external endpoint",
            family: StepFamily::Action,
            internal: false,
            can_loop: true,
            halts_on_failure: false,
        }
    }

    fn schema(&self) -> StepSchema {
        StepSchema::of::<OutgoingWebhookInputs, OutgoingWebhookOutputs>()
    }

    async fn run(&self, inputs: Map<String, Value>, step_context: &StepContext<'_>) -> Result<Value, StepExecutionError> {
        let inputs: OutgoingWebhookInputs = parse_inputs(StepId::OutgoingWebhook, inputs)?;
        let request = WebhookRequest {
            method: inputs.method,
            url: inputs.url,
            headers: inputs.headers,
            body: normalize_body(inputs.body),
        };
        let response = step_context.services.webhooks.send(request).await?;

        to_outputs(&OutgoingWebhookOutputs {
            success: (200..300).contains(&response.status),
            http_status: response.status,
            response: response.body,
        })
    }
}
