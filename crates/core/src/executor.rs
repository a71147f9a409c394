//! Side-effecting stage actions.
//!
//! The engine never talks to document, mail or billing systems directly. Each stage
//! calls exactly one method on a [`StageExecutor`], and the result is folded back into
//! the flow as a [`StageEffect`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::flow::{Flow, FlowId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageAction {
    GenerateContract,
    SendContract,
    CheckSignature,
    GenerateInvoice,
    CheckPayment,
}

impl StageAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GenerateContract => "generate_contract",
            Self::SendContract => "send_contract",
            Self::CheckSignature => "check_signature",
            Self::GenerateInvoice => "generate_invoice",
            Self::CheckPayment => "check_payment",
        }
    }
}

impl std::fmt::Display for StageAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutorErrorKind {
    Unavailable,
    Rejected,
    Timeout,
    InvalidResponse,
}

impl ExecutorErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
            Self::InvalidResponse => "invalid_response",
        }
    }
}

impl std::fmt::Display for ExecutorErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ExecutorError {
    pub kind: ExecutorErrorKind,
    pub message: String,
}

impl ExecutorError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self { kind: ExecutorErrorKind::Unavailable, message: message.into() }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self { kind: ExecutorErrorKind::Rejected, message: message.into() }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self { kind: ExecutorErrorKind::Timeout, message: message.into() }
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self { kind: ExecutorErrorKind::InvalidResponse, message: message.into() }
    }
}

/// What a stage action produced, ready to be applied to the flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageEffect {
    ContractGenerated { contract_id: String },
    ContractSent,
    SignatureChecked { signed: bool },
    InvoiceGenerated { invoice_id: String },
    PaymentChecked { paid: bool },
}

impl StageEffect {
    pub fn action(&self) -> StageAction {
        match self {
            Self::ContractGenerated { .. } => StageAction::GenerateContract,
            Self::ContractSent => StageAction::SendContract,
            Self::SignatureChecked { .. } => StageAction::CheckSignature,
            Self::InvoiceGenerated { .. } => StageAction::GenerateInvoice,
            Self::PaymentChecked { .. } => StageAction::CheckPayment,
        }
    }
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn generate_contract(&self, flow: &Flow, params: &Value) -> Result<String, ExecutorError>;
    async fn send_contract(&self, flow: &Flow, params: &Value) -> Result<(), ExecutorError>;
    async fn check_signature(&self, flow: &Flow, params: &Value) -> Result<bool, ExecutorError>;
    async fn generate_invoice(&self, flow: &Flow, params: &Value) -> Result<String, ExecutorError>;
    async fn check_payment(&self, flow: &Flow, params: &Value) -> Result<bool, ExecutorError>;
}

pub async fn dispatch<E>(
    executor: &E,
    action: StageAction,
    flow: &Flow,
    params: &Value,
) -> Result<StageEffect, ExecutorError>
where
    E: StageExecutor + ?Sized,
{
    match action {
        StageAction::GenerateContract => executor
            .generate_contract(flow, params)
            .await
            .map(|contract_id| StageEffect::ContractGenerated { contract_id }),
        StageAction::SendContract => {
            executor.send_contract(flow, params).await.map(|()| StageEffect::ContractSent)
        }
        StageAction::CheckSignature => executor
            .check_signature(flow, params)
            .await
            .map(|signed| StageEffect::SignatureChecked { signed }),
        StageAction::GenerateInvoice => executor
            .generate_invoice(flow, params)
            .await
            .map(|invoice_id| StageEffect::InvoiceGenerated { invoice_id }),
        StageAction::CheckPayment => {
            executor.check_payment(flow, params).await.map(|paid| StageEffect::PaymentChecked { paid })
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Stand-in for real integrations: always produces documents and answers the
/// signature and payment polls with configurable probabilities.
pub struct SimulatedStageExecutor {
    signature_probability: f64,
    payment_probability: f64,
    rng: Mutex<StdRng>,
}

impl SimulatedStageExecutor {
    pub fn new(signature_probability: f64, payment_probability: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            signature_probability: signature_probability.clamp(0.0, 1.0),
            payment_probability: payment_probability.clamp(0.0, 1.0),
            rng: Mutex::new(rng),
        }
    }

    fn roll(&self, probability: f64) -> bool {
        lock_or_recover(&self.rng).gen_bool(probability)
    }
}

impl Default for SimulatedStageExecutor {
    fn default() -> Self {
        Self::new(0.5, 0.3, None)
    }
}

fn document_id(prefix: &str) -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &raw[..12])
}

#[async_trait]
impl StageExecutor for SimulatedStageExecutor {
    async fn generate_contract(&self, _flow: &Flow, _params: &Value) -> Result<String, ExecutorError> {
        Ok(document_id("CTR"))
    }

    async fn send_contract(&self, _flow: &Flow, _params: &Value) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn check_signature(&self, _flow: &Flow, _params: &Value) -> Result<bool, ExecutorError> {
        Ok(self.roll(self.signature_probability))
    }

    async fn generate_invoice(&self, _flow: &Flow, _params: &Value) -> Result<String, ExecutorError> {
        Ok(document_id("INV"))
    }

    async fn check_payment(&self, _flow: &Flow, _params: &Value) -> Result<bool, ExecutorError> {
        Ok(self.roll(self.payment_probability))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutorCall {
    pub flow_id: FlowId,
    pub action: StageAction,
    pub params: Value,
}

#[derive(Debug, Default)]
struct ScriptState {
    signed: bool,
    paid: bool,
    action_failures: HashMap<StageAction, ExecutorError>,
    flow_failures: HashMap<FlowId, ExecutorError>,
    calls: Vec<ExecutorCall>,
    contracts_issued: u32,
    invoices_issued: u32,
}

/// Deterministic executor driven by explicit answers and injected failures.
#[derive(Clone, Debug, Default)]
pub struct ScriptedStageExecutor {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedStageExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every poll reports signed and paid.
    pub fn approving() -> Self {
        let executor = Self::default();
        executor.set_signed(true);
        executor.set_paid(true);
        executor
    }

    pub fn set_signed(&self, signed: bool) {
        lock_or_recover(&self.state).signed = signed;
    }

    pub fn set_paid(&self, paid: bool) {
        lock_or_recover(&self.state).paid = paid;
    }

    pub fn fail_action(&self, action: StageAction, error: ExecutorError) {
        lock_or_recover(&self.state).action_failures.insert(action, error);
    }

    pub fn fail_flow(&self, flow_id: &FlowId, error: ExecutorError) {
        lock_or_recover(&self.state).flow_failures.insert(flow_id.clone(), error);
    }

    pub fn clear_failures(&self) {
        let mut state = lock_or_recover(&self.state);
        state.action_failures.clear();
        state.flow_failures.clear();
    }

    pub fn calls(&self) -> Vec<ExecutorCall> {
        lock_or_recover(&self.state).calls.clone()
    }

    pub fn calls_for(&self, flow_id: &FlowId) -> Vec<StageAction> {
        lock_or_recover(&self.state)
            .calls
            .iter()
            .filter(|call| &call.flow_id == flow_id)
            .map(|call| call.action)
            .collect()
    }

    fn enter(
        &self,
        flow: &Flow,
        action: StageAction,
        params: &Value,
    ) -> Result<MutexGuard<'_, ScriptState>, ExecutorError> {
        let mut state = lock_or_recover(&self.state);
        state.calls.push(ExecutorCall {
            flow_id: flow.id.clone(),
            action,
            params: params.clone(),
        });
        if let Some(error) = state.flow_failures.get(&flow.id) {
            return Err(error.clone());
        }
        if let Some(error) = state.action_failures.get(&action) {
            return Err(error.clone());
        }
        Ok(state)
    }
}

#[async_trait]
impl StageExecutor for ScriptedStageExecutor {
    async fn generate_contract(&self, flow: &Flow, params: &Value) -> Result<String, ExecutorError> {
        let mut state = self.enter(flow, StageAction::GenerateContract, params)?;
        state.contracts_issued += 1;
        Ok(format!("CTR-{:04}", state.contracts_issued))
    }

    async fn send_contract(&self, flow: &Flow, params: &Value) -> Result<(), ExecutorError> {
        self.enter(flow, StageAction::SendContract, params).map(|_| ())
    }

    async fn check_signature(&self, flow: &Flow, params: &Value) -> Result<bool, ExecutorError> {
        self.enter(flow, StageAction::CheckSignature, params).map(|state| state.signed)
    }

    async fn generate_invoice(&self, flow: &Flow, params: &Value) -> Result<String, ExecutorError> {
        let mut state = self.enter(flow, StageAction::GenerateInvoice, params)?;
        state.invoices_issued += 1;
        Ok(format!("INV-{:04}", state.invoices_issued))
    }

    async fn check_payment(&self, flow: &Flow, params: &Value) -> Result<bool, ExecutorError> {
        self.enter(flow, StageAction::CheckPayment, params).map(|state| state.paid)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::{
        dispatch, ExecutorError, ExecutorErrorKind, ScriptedStageExecutor, SimulatedStageExecutor,
        StageAction, StageEffect, StageExecutor,
    };
    use crate::domain::flow::{
        format_flow_number, Flow, FlowConfig, FlowDraft, FlowMetadata, TenantId,
    };

    fn flow() -> Flow {
        Flow::start(
            FlowDraft {
                tenant_id: TenantId("tenant-a".to_string()),
                proposal_id: "P-1".to_string(),
                flow_number: format_flow_number(2026, 1),
                config: FlowConfig::default(),
                metadata: FlowMetadata::default(),
                max_attempts: 3,
            },
            Utc::now(),
        )
        .expect("valid draft")
    }

    #[tokio::test]
    async fn dispatch_maps_actions_to_effects() {
        let executor = ScriptedStageExecutor::approving();
        let flow = flow();
        let params = json!({});

        let effect = dispatch(&executor, StageAction::GenerateContract, &flow, &params)
            .await
            .expect("contract");
        assert_eq!(effect, StageEffect::ContractGenerated { contract_id: "CTR-0001".to_string() });
        assert_eq!(effect.action(), StageAction::GenerateContract);

        let effect = dispatch(&executor, StageAction::CheckPayment, &flow, &params)
            .await
            .expect("payment");
        assert_eq!(effect, StageEffect::PaymentChecked { paid: true });
    }

    #[tokio::test]
    async fn scripted_failures_are_injected_per_flow_and_recorded() {
        let executor = ScriptedStageExecutor::new();
        let failing = flow();
        let healthy = flow();
        executor.fail_flow(&failing.id, ExecutorError::unavailable("template store offline"));

        let error = executor
            .generate_contract(&failing, &json!({"force": true}))
            .await
            .expect_err("injected failure");
        assert_eq!(error.kind, ExecutorErrorKind::Unavailable);

        executor.generate_contract(&healthy, &json!({})).await.expect("healthy flow succeeds");

        assert_eq!(executor.calls_for(&failing.id), vec![StageAction::GenerateContract]);
        assert_eq!(executor.calls()[0].params, json!({"force": true}));
    }

    #[tokio::test]
    async fn simulated_executor_respects_certain_probabilities() {
        let always = SimulatedStageExecutor::new(1.0, 1.0, Some(7));
        let never = SimulatedStageExecutor::new(0.0, 0.0, Some(7));
        let flow = flow();

        assert!(always.check_signature(&flow, &json!({})).await.expect("poll"));
        assert!(always.check_payment(&flow, &json!({})).await.expect("poll"));
        assert!(!never.check_signature(&flow, &json!({})).await.expect("poll"));
        assert!(!never.check_payment(&flow, &json!({})).await.expect("poll"));

        let contract = always.generate_contract(&flow, &json!({})).await.expect("contract");
        assert!(contract.starts_with("CTR-"));
    }
}
