use crate::account::SimpleAccount;
use crate::encoding::{fmt_address, fmt_h256, parse_h256};
use crate::error::{Error, Result};
use crate::types::UserOperation;
use ethers::{
    providers::{Http, Middleware, Provider},
    types::{Address, Bytes, H256, U256},
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Hook and tuning knobs for a submission.
pub struct SendOptions {
    /// Fires synchronously once per submission, after local signing and
    /// strictly before network submission. Observation only; the operation
    /// is already signed and must not change.
    pub on_build: Option<Box<dyn Fn(&UserOperation) + Send + Sync>>,
    /// Basis-point multiplier applied to the gas price when filling
    /// `maxFeePerGas`/`maxPriorityFeePerGas` (10000 = 1x).
    pub gas_multiplier_bps: u64,
    /// Polling window for `wait()`. Zero disables the timeout.
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            on_build: None,
            gas_multiplier_bps: 10_000,
            wait_timeout: Duration::from_secs(180),
            poll_interval: Duration::from_millis(1500),
        }
    }
}

impl SendOptions {
    pub fn with_on_build(mut self, f: impl Fn(&UserOperation) + Send + Sync + 'static) -> Self {
        self.on_build = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for SendOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendOptions")
            .field("on_build", &self.on_build.is_some())
            .field("gas_multiplier_bps", &self.gas_multiplier_bps)
            .field("wait_timeout", &self.wait_timeout)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct GasEstimates {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
}

/// Entry-point submission client.
///
/// One endpoint serves both the chain queries and the ERC-4337 methods, so
/// the RPC URL must point at a bundler-capable node. The entry-point address
/// given here must match the one operations were signed against, or their
/// signatures will not validate.
#[derive(Debug, Clone)]
pub struct Client {
    rpc_url: String,
    http: reqwest::Client,
    provider: Arc<Provider<Http>>,
    entry_point: Address,
    chain_id: u64,
}

impl Client {
    /// Connects and resolves the chain id.
    pub async fn connect(rpc_url: &str, entry_point: Address) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| Error::Network(e.to_string()))?
            .interval(Duration::from_millis(350));
        let provider = Arc::new(provider);
        let chain_id = provider.get_chainid().await?.as_u64();

        Ok(Self {
            rpc_url: rpc_url.to_string(),
            http: reqwest::Client::new(),
            provider,
            entry_point,
            chain_id,
        })
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Runs the full middleware pipeline over a draft and submits it:
    /// nonce, fee fields, gas estimation, sponsorship (strictly after
    /// estimation, so the paymaster signs the final gas fields), signing,
    /// the `on_build` hook, then `eth_sendUserOperation`.
    pub async fn submit(
        &self,
        account: &SimpleAccount,
        draft: UserOperation,
        opts: SendOptions,
    ) -> Result<PendingOperation> {
        let op = self.prepare(account, draft, &opts).await?;

        let user_op_hash = self.send_user_operation(&op).await?;
        tracing::info!(user_op_hash = %fmt_h256(user_op_hash), "user operation submitted");

        Ok(PendingOperation {
            user_op_hash,
            client: self.clone(),
            wait_timeout: opts.wait_timeout,
            poll_interval: opts.poll_interval,
        })
    }

    /// The pipeline minus the final send: returns the fully-signed operation
    /// after firing `on_build`. `submit` builds on this; it is public so a
    /// dry run can inspect the exact payload that would have gone out.
    pub async fn prepare(
        &self,
        account: &SimpleAccount,
        draft: UserOperation,
        opts: &SendOptions,
    ) -> Result<UserOperation> {
        if account.entry_point() != self.entry_point {
            tracing::warn!(
                account_entry_point = %fmt_address(account.entry_point()),
                client_entry_point = %fmt_address(self.entry_point),
                "entry point mismatch between account and client; signatures will not validate"
            );
        }

        let mut op = draft;

        op.nonce = account.fetch_nonce().await?;

        let gas_price = self.provider.get_gas_price().await?;
        let bps = opts.gas_multiplier_bps.max(1);
        let fee = gas_price * U256::from(bps) / U256::from(10_000u64);
        op.max_fee_per_gas = fee;
        op.max_priority_fee_per_gas = fee;

        // Placeholder signature so estimation sees a realistically-sized op.
        op.signature = Bytes::from(vec![0u8; 65]);

        let est = self.estimate_user_operation_gas(&op).await?;
        op.call_gas_limit = est.call_gas_limit;
        op.verification_gas_limit = est.verification_gas_limit;
        op.pre_verification_gas = est.pre_verification_gas;

        if let Some(paymaster) = account.paymaster() {
            op = paymaster.sponsor(op, self.entry_point).await?;
        }

        op.signature = if account.is_externally_authorized() {
            account.signature()
        } else {
            account.sign_user_op(&op, self.entry_point, self.chain_id).await?
        };

        if let Some(hook) = &opts.on_build {
            hook(&op);
        }

        Ok(op)
    }

    pub async fn estimate_user_operation_gas(&self, op: &UserOperation) -> Result<GasEstimates> {
        let params = json!([op, fmt_address(self.entry_point)]);
        let res = self
            .rpc("eth_estimateUserOperationGas", params)
            .await
            .map_err(as_simulation_rejection)?;

        Ok(GasEstimates {
            call_gas_limit: quantity_field(&res, "callGasLimit")?,
            verification_gas_limit: quantity_field(&res, "verificationGasLimit")?,
            pre_verification_gas: quantity_field(&res, "preVerificationGas")?,
        })
    }

    pub async fn send_user_operation(&self, op: &UserOperation) -> Result<H256> {
        let params = json!([op, fmt_address(self.entry_point)]);
        let res = self
            .rpc("eth_sendUserOperation", params)
            .await
            .map_err(as_simulation_rejection)?;
        parse_user_op_hash(&res)
    }

    pub async fn get_user_operation_receipt(&self, user_op_hash: H256) -> Result<Value> {
        let params = json!([fmt_h256(user_op_hash)]);
        self.rpc("eth_getUserOperationReceipt", params).await
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
            .post(&self.rpc_url)
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Network(format!("POST {} failed: {e}", self.rpc_url)))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| Error::Network(format!("failed to decode JSON: {e}")))?;

        if !status.is_success() {
            return Err(Error::Network(format!("HTTP {status}: {body}")));
        }

        if let Some(err) = body.get("error") {
            return Err(Error::Rpc(rpc_error_message(err)));
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| Error::Rpc("missing result field".to_string()))
    }
}

/// Handle for an operation in flight. The hash is available immediately;
/// `wait` resolves to the settlement transaction.
#[derive(Debug)]
pub struct PendingOperation {
    user_op_hash: H256,
    client: Client,
    wait_timeout: Duration,
    poll_interval: Duration,
}

impl PendingOperation {
    pub fn user_op_hash(&self) -> H256 {
        self.user_op_hash
    }

    /// Polls for the operation receipt. Resolves to the transaction hash
    /// once mined, or `None` when the polling window elapses — a timeout is
    /// not an error, the caller may poll again. Transport failures propagate.
    ///
    /// Independent operations may be awaited concurrently; abandoning this
    /// future simply stops polling, it does not cancel the on-chain effect.
    pub async fn wait(&self) -> Result<Option<H256>> {
        let start = std::time::Instant::now();
        loop {
            if !self.wait_timeout.is_zero() && start.elapsed() > self.wait_timeout {
                tracing::warn!(
                    user_op_hash = %fmt_h256(self.user_op_hash),
                    "no receipt within {:?}",
                    self.wait_timeout
                );
                return Ok(None);
            }

            let res = self
                .client
                .get_user_operation_receipt(self.user_op_hash)
                .await?;
            if !res.is_null() {
                return Ok(Some(receipt_transaction_hash(&res)?));
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Estimation and submission failures reported by the entry point arrive as
/// JSON-RPC error objects carrying the revert reason.
fn as_simulation_rejection(e: Error) -> Error {
    match e {
        Error::Rpc(msg) => Error::RejectedBySimulation(msg),
        other => other,
    }
}

fn rpc_error_message(err: &Value) -> String {
    let msg = err
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown error");
    match err.get("data").filter(|d| !d.is_null()) {
        Some(data) => format!("{msg} ({data})"),
        None => msg.to_string(),
    }
}

fn quantity_field(v: &Value, key: &str) -> Result<U256> {
    let s = v
        .get(key)
        .and_then(|x| x.as_str())
        .ok_or_else(|| Error::Rpc(format!("missing or invalid field {key}")))?;
    let hex_str = s.strip_prefix("0x").unwrap_or(s);
    if hex_str.is_empty() {
        return Ok(U256::zero());
    }
    U256::from_str_radix(hex_str, 16).map_err(|e| Error::Rpc(format!("invalid {key}: {e}")))
}

fn parse_user_op_hash(res: &Value) -> Result<H256> {
    // Bundlers return the hash as a bare JSON string; a few wrap it.
    let hash_str = if let Some(s) = res.as_str() {
        s
    } else if let Some(s) = res.get("result").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOpHash").and_then(|v| v.as_str()) {
        s
    } else {
        return Err(Error::Rpc(format!(
            "unexpected eth_sendUserOperation result shape: {res}"
        )));
    };
    parse_h256(hash_str, "userOpHash").map_err(|e| Error::Rpc(e.to_string()))
}

fn receipt_transaction_hash(receipt: &Value) -> Result<H256> {
    let s = receipt
        .get("receipt")
        .and_then(|r| r.get("transactionHash"))
        .or_else(|| receipt.get("transactionHash"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Rpc(format!("receipt without transactionHash: {receipt}")))?;
    parse_h256(s, "transactionHash").map_err(|e| Error::Rpc(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HASH: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    #[test]
    fn parse_user_op_hash_from_string() {
        let res = json!(HASH);
        assert_eq!(
            parse_user_op_hash(&res).unwrap(),
            parse_h256(HASH, "h").unwrap()
        );
    }

    #[test]
    fn parse_user_op_hash_from_result_object() {
        let res = json!({ "result": HASH });
        assert_eq!(
            parse_user_op_hash(&res).unwrap(),
            parse_h256(HASH, "h").unwrap()
        );
    }

    #[test]
    fn parse_user_op_hash_from_user_op_hash_object() {
        let res = json!({ "userOpHash": HASH });
        assert_eq!(
            parse_user_op_hash(&res).unwrap(),
            parse_h256(HASH, "h").unwrap()
        );
    }

    #[test]
    fn parse_user_op_hash_rejects_unknown_shape() {
        let res = json!({ "foo": "bar" });
        assert!(parse_user_op_hash(&res).is_err());
    }

    #[test]
    fn receipt_transaction_hash_nested_and_flat() {
        let nested = json!({ "receipt": { "transactionHash": HASH } });
        assert_eq!(
            receipt_transaction_hash(&nested).unwrap(),
            parse_h256(HASH, "h").unwrap()
        );

        let flat = json!({ "transactionHash": HASH });
        assert_eq!(
            receipt_transaction_hash(&flat).unwrap(),
            parse_h256(HASH, "h").unwrap()
        );

        let bogus = json!({ "logs": [] });
        assert!(receipt_transaction_hash(&bogus).is_err());
    }

    #[test]
    fn simulation_rejection_keeps_revert_reason() {
        let err = json!({ "code": -32500, "message": "AA31 paymaster deposit too low" });
        let mapped = as_simulation_rejection(Error::Rpc(rpc_error_message(&err)));
        match mapped {
            Error::RejectedBySimulation(msg) => {
                assert!(msg.contains("AA31 paymaster deposit too low"))
            }
            other => panic!("expected RejectedBySimulation, got {other:?}"),
        }
    }

    #[test]
    fn network_errors_pass_through_unmapped() {
        let mapped = as_simulation_rejection(Error::Network("connection refused".into()));
        assert!(matches!(mapped, Error::Network(_)));
    }

    #[test]
    fn rpc_error_message_includes_data() {
        let err = json!({ "code": -32500, "message": "AA23 reverted", "data": "0x08c379a0" });
        let msg = rpc_error_message(&err);
        assert!(msg.contains("AA23 reverted"));
        assert!(msg.contains("0x08c379a0"));
    }
}
