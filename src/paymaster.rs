use crate::error::{Error, Result};
use crate::types::UserOperation;
use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
use serde_json::{json, Value};

use crate::encoding::fmt_address;

/// Folds sponsorship data into a draft operation.
///
/// Implementations must request fresh sponsorship on every call: the
/// sponsorship signature is tied to the exact field values it was computed
/// over, so a caller revising gas fields re-invokes `sponsor` and must never
/// see stale data.
#[async_trait]
pub trait PaymasterMiddleware: Send + Sync + std::fmt::Debug {
    async fn sponsor(&self, op: UserOperation, entry_point: Address) -> Result<UserOperation>;
}

/// Verifying-paymaster web service client.
///
/// Speaks `pm_sponsorUserOperation` with params
/// `[userOp, entryPoint, context]` under a fixed sponsorship context
/// (pay-as-you-go by default). Any failure — transport, HTTP status, RPC
/// error object, malformed result — surfaces as [`Error::Unsponsored`]; the
/// operation must then not be submitted.
#[derive(Debug, Clone)]
pub struct VerifyingPaymaster {
    url: String,
    context: Value,
    http: reqwest::Client,
}

impl VerifyingPaymaster {
    pub fn new(url: impl Into<String>, context: Value) -> Self {
        Self {
            url: url.into(),
            context,
            http: reqwest::Client::new(),
        }
    }

    /// Flat pay-as-you-go sponsorship, no additional parameters.
    pub fn pay_as_you_go(url: impl Into<String>) -> Self {
        Self::new(url, json!({ "type": "payg" }))
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        let req = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Unsponsored(format!("POST {} failed: {e}", self.url)))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| Error::Unsponsored(format!("failed to decode JSON: {e}")))?;

        if !status.is_success() {
            return Err(Error::Unsponsored(format!("HTTP {status}: {body}")));
        }

        if let Some(err) = body.get("error") {
            return Err(Error::Unsponsored(format!("paymaster error: {err}")));
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| Error::Unsponsored("missing result field".to_string()))
    }
}

#[async_trait]
impl PaymasterMiddleware for VerifyingPaymaster {
    async fn sponsor(&self, op: UserOperation, entry_point: Address) -> Result<UserOperation> {
        let op_json = serde_json::to_value(&op)
            .map_err(|e| Error::Unsponsored(format!("failed to encode operation: {e}")))?;
        let params = json!([op_json, fmt_address(entry_point), self.context]);

        let result = self.rpc("pm_sponsorUserOperation", params).await?;
        let sponsorship = parse_sponsorship(&result)?;

        tracing::debug!(
            paymaster_and_data_len = sponsorship.paymaster_and_data.len(),
            "sponsorship obtained"
        );

        Ok(sponsorship.apply(op))
    }
}

/// Sponsorship payload, plus the gas-field overrides some services return
/// alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Sponsorship {
    paymaster_and_data: Bytes,
    call_gas_limit: Option<U256>,
    verification_gas_limit: Option<U256>,
    pre_verification_gas: Option<U256>,
}

impl Sponsorship {
    fn apply(self, mut op: UserOperation) -> UserOperation {
        op.paymaster_and_data = self.paymaster_and_data;
        if let Some(v) = self.call_gas_limit {
            op.call_gas_limit = v;
        }
        if let Some(v) = self.verification_gas_limit {
            op.verification_gas_limit = v;
        }
        if let Some(v) = self.pre_verification_gas {
            op.pre_verification_gas = v;
        }
        op
    }
}

fn parse_sponsorship(result: &Value) -> Result<Sponsorship> {
    // Most services return paymasterAndData at the top level; some wrap the
    // whole payload in a `result` object. Accept both.
    let payload = if result.get("paymasterAndData").is_some() {
        result
    } else if let Some(inner) = result.get("result").filter(|v| v.get("paymasterAndData").is_some())
    {
        inner
    } else {
        return Err(Error::Unsponsored(format!(
            "missing paymasterAndData in response: {result}"
        )));
    };

    let s = payload
        .get("paymasterAndData")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Unsponsored("paymasterAndData is not a string".to_string()))?;
    let hex_str = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(hex_str)
        .map_err(|e| Error::Unsponsored(format!("invalid hex in paymasterAndData: {e}")))?;

    Ok(Sponsorship {
        paymaster_and_data: Bytes::from(bytes),
        call_gas_limit: parse_opt_quantity(payload, "callGasLimit")?,
        verification_gas_limit: parse_opt_quantity(payload, "verificationGasLimit")?,
        pre_verification_gas: parse_opt_quantity(payload, "preVerificationGas")?,
    })
}

fn parse_opt_quantity(payload: &Value, key: &str) -> Result<Option<U256>> {
    match payload.get(key).and_then(|v| v.as_str()) {
        Some(s) => {
            let hex_str = s.strip_prefix("0x").unwrap_or(s);
            if hex_str.is_empty() {
                return Ok(Some(U256::zero()));
            }
            U256::from_str_radix(hex_str, 16)
                .map(Some)
                .map_err(|e| Error::Unsponsored(format!("invalid {key} quantity: {e}")))
        }
        None => Ok(None),
    }
}
