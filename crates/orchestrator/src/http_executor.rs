//! `StageExecutor` backed by an external contract and billing service.
//!
//! Routes, relative to `executor.base_url`:
//! - `POST /contracts` -> `{ "id" }`
//! - `POST /contracts/{id}/send`
//! - `GET /contracts/{id}/signature` -> `{ "signed" }`
//! - `POST /invoices` -> `{ "id" }`
//! - `GET /invoices/{id}/payment` -> `{ "paid" }`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use closeflow_core::config::ExecutorConfig;
use closeflow_core::domain::flow::Flow;
use closeflow_core::errors::ApplicationError;
use closeflow_core::executor::{ExecutorError, StageExecutor};

pub struct HttpStageExecutor {
    client: Client,
    base_url: String,
    api_token: SecretString,
}

#[derive(Deserialize)]
struct CreatedDocument {
    id: String,
}

#[derive(Deserialize)]
struct SignatureStatus {
    signed: bool,
}

#[derive(Deserialize)]
struct PaymentStatus {
    paid: bool,
}

impl HttpStageExecutor {
    pub fn new(
        base_url: impl Into<String>,
        api_token: SecretString,
        timeout: Duration,
    ) -> Result<Self, ApplicationError> {
        let client = Client::builder().timeout(timeout).build().map_err(|error| {
            ApplicationError::Configuration(format!("could not build executor http client: {error}"))
        })?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url, api_token })
    }

    pub fn from_config(config: &ExecutorConfig) -> Result<Self, ApplicationError> {
        let base_url = config.base_url.clone().ok_or_else(|| {
            ApplicationError::Configuration("executor.base_url is required in http mode".to_string())
        })?;
        let api_token = config.api_token.clone().ok_or_else(|| {
            ApplicationError::Configuration("executor.api_token is required in http mode".to_string())
        })?;
        Self::new(base_url, api_token, Duration::from_secs(config.timeout_secs))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, ExecutorError> {
        let response = request
            .bearer_auth(self.api_token.expose_secret())
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("{status}: {}", body.trim());
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(ExecutorError::unavailable(message))
        } else {
            Err(ExecutorError::rejected(message))
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ExecutorError> {
        self.send(request)
            .await?
            .json::<T>()
            .await
            .map_err(|error| ExecutorError::invalid_response(error.to_string()))
    }
}

fn transport_error(error: reqwest::Error) -> ExecutorError {
    if error.is_timeout() {
        ExecutorError::timeout(error.to_string())
    } else {
        ExecutorError::unavailable(error.to_string())
    }
}

fn document_request(flow: &Flow, template_id: Option<&str>, params: &Value) -> Value {
    json!({
        "flowId": flow.id.0,
        "tenantId": flow.tenant_id.0,
        "flowNumber": flow.flow_number,
        "proposalId": flow.proposal_id,
        "contractId": flow.contract_id,
        "templateId": template_id,
        "metadata": flow.metadata,
        "parameters": params,
    })
}

fn require<'a>(value: Option<&'a String>, what: &str) -> Result<&'a str, ExecutorError> {
    value
        .map(String::as_str)
        .ok_or_else(|| ExecutorError::rejected(format!("flow has no {what} yet")))
}

#[async_trait]
impl StageExecutor for HttpStageExecutor {
    async fn generate_contract(&self, flow: &Flow, params: &Value) -> Result<String, ExecutorError> {
        let body = document_request(flow, flow.config.contract_template_id.as_deref(), params);
        let created: CreatedDocument =
            self.send_json(self.client.post(self.url("/contracts")).json(&body)).await?;
        Ok(created.id)
    }

    async fn send_contract(&self, flow: &Flow, params: &Value) -> Result<(), ExecutorError> {
        let contract_id = require(flow.contract_id.as_ref(), "contract")?;
        let body = document_request(flow, flow.config.email_template_id.as_deref(), params);
        self.send(self.client.post(self.url(&format!("/contracts/{contract_id}/send"))).json(&body))
            .await
            .map(|_| ())
    }

    async fn check_signature(&self, flow: &Flow, _params: &Value) -> Result<bool, ExecutorError> {
        let contract_id = require(flow.contract_id.as_ref(), "contract")?;
        let status: SignatureStatus = self
            .send_json(self.client.get(self.url(&format!("/contracts/{contract_id}/signature"))))
            .await?;
        Ok(status.signed)
    }

    async fn generate_invoice(&self, flow: &Flow, params: &Value) -> Result<String, ExecutorError> {
        let body = document_request(flow, flow.config.invoice_template_id.as_deref(), params);
        let created: CreatedDocument =
            self.send_json(self.client.post(self.url("/invoices")).json(&body)).await?;
        Ok(created.id)
    }

    async fn check_payment(&self, flow: &Flow, _params: &Value) -> Result<bool, ExecutorError> {
        let invoice_id = require(flow.invoice_id.as_ref(), "invoice")?;
        let status: PaymentStatus = self
            .send_json(self.client.get(self.url(&format!("/invoices/{invoice_id}/payment"))))
            .await?;
        Ok(status.paid)
    }
}
