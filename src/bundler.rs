use crate::encoding::{self, parse_h256, parse_u256_value};
use crate::error::DeployError;
use crate::types::UserOperation;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// ERC-4337 bundler RPC surface used by the sponsorship flow.
#[async_trait]
pub trait Bundler: Send + Sync {
    async fn gas_price(&self) -> Result<GasPriceTiers>;

    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<GasEstimate>;

    async fn send_user_operation(&self, op: &UserOperation, entry_point: Address) -> Result<H256>;

    async fn wait_user_operation_receipt(
        &self,
        user_op_hash: H256,
        timeout: Duration,
    ) -> Result<UserOpReceipt>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GasPrice {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

impl GasPrice {
    pub fn apply(&self, op: &mut UserOperation) {
        op.max_fee_per_gas = self.max_fee_per_gas;
        op.max_priority_fee_per_gas = self.max_priority_fee_per_gas;
    }
}

/// `pimlico_getUserOperationGasPrice` result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GasPriceTiers {
    pub slow: GasPrice,
    pub standard: GasPrice,
    pub fast: GasPrice,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GasEstimate {
    pub pre_verification_gas: U256,
    pub verification_gas_limit: U256,
    pub call_gas_limit: U256,
    pub paymaster_verification_gas_limit: Option<U256>,
    pub paymaster_post_op_gas_limit: Option<U256>,
}

impl GasEstimate {
    /// v0.6 has no separate paymaster gas fields, so only the core three are copied.
    pub fn apply(&self, op: &mut UserOperation) {
        op.pre_verification_gas = self.pre_verification_gas;
        op.verification_gas_limit = self.verification_gas_limit;
        op.call_gas_limit = self.call_gas_limit;
    }
}

/// Wire shape of `eth_estimateUserOperationGas`; bundlers omit fields freely.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGasEstimate {
    #[serde(default)]
    pre_verification_gas: Option<Value>,
    #[serde(default)]
    verification_gas_limit: Option<Value>,
    #[serde(default)]
    call_gas_limit: Option<Value>,
    #[serde(default)]
    paymaster_verification_gas_limit: Option<Value>,
    #[serde(default)]
    paymaster_post_op_gas_limit: Option<Value>,
}

impl RawGasEstimate {
    fn into_estimate(self) -> Result<GasEstimate> {
        Ok(GasEstimate {
            pre_verification_gas: quantity_or_zero(self.pre_verification_gas)?,
            verification_gas_limit: quantity_or_zero(self.verification_gas_limit)?,
            call_gas_limit: quantity_or_zero(self.call_gas_limit)?,
            paymaster_verification_gas_limit: quantity_opt(self.paymaster_verification_gas_limit)?,
            paymaster_post_op_gas_limit: quantity_opt(self.paymaster_post_op_gas_limit)?,
        })
    }
}

fn quantity_opt(v: Option<Value>) -> Result<Option<U256>> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(v) => parse_u256_value(&v).map(Some),
    }
}

fn quantity_or_zero(v: Option<Value>) -> Result<U256> {
    Ok(quantity_opt(v)?.unwrap_or_default())
}

#[derive(Clone, Debug)]
pub struct UserOpReceipt {
    pub user_op_hash: H256,
    pub success: Option<bool>,
    pub transaction_hash: Option<H256>,
    pub raw: Value,
}

impl UserOpReceipt {
    fn from_value(user_op_hash: H256, raw: Value) -> Self {
        let transaction_hash = raw
            .get("receipt")
            .and_then(|r| r.get("transactionHash"))
            .and_then(|h| h.as_str())
            .and_then(|s| parse_h256(s).ok());
        let success = raw.get("success").and_then(|s| s.as_bool());
        Self {
            user_op_hash,
            success,
            transaction_hash,
            raw,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BundlerClient {
    url: String,
    http: reqwest::Client,
    poll_interval: Duration,
}

impl BundlerClient {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
            poll_interval: Duration::from_millis(1500),
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        let req = serde_json::json!({
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
            .with_context(|| format!("POST {method} failed"))?;

        let status = resp.status();
        let body: Value = resp.json().await.context("failed to decode JSON")?;

        if !status.is_success() {
            return Err(anyhow!("HTTP {}: {}", status, body));
        }

        if let Some(err) = body.get("error") {
            return Err(anyhow!("RPC error: {}", err));
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| anyhow!("missing result field"))
    }
}

#[async_trait]
impl Bundler for BundlerClient {
    async fn gas_price(&self) -> Result<GasPriceTiers> {
        let res = self
            .rpc("pimlico_getUserOperationGasPrice", serde_json::json!([]))
            .await
            .context("pimlico_getUserOperationGasPrice failed")?;
        parse_gas_price_tiers(&res)
    }

    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<GasEstimate> {
        let params = serde_json::json!([
            encoding::user_op_to_json(op),
            encoding::fmt_address(entry_point)
        ]);
        let res = self
            .rpc("eth_estimateUserOperationGas", params)
            .await
            .context("eth_estimateUserOperationGas failed")?;
        parse_gas_estimate(res)
    }

    async fn send_user_operation(&self, op: &UserOperation, entry_point: Address) -> Result<H256> {
        let params = serde_json::json!([
            encoding::user_op_to_json(op),
            encoding::fmt_address(entry_point)
        ]);
        let res = self
            .rpc("eth_sendUserOperation", params)
            .await
            .context("eth_sendUserOperation failed")?;
        parse_userop_hash(&res)
    }

    async fn wait_user_operation_receipt(
        &self,
        user_op_hash: H256,
        timeout: Duration,
    ) -> Result<UserOpReceipt> {
        let params = serde_json::json!([encoding::fmt_h256(user_op_hash)]);
        poll_receipt(user_op_hash, timeout, self.poll_interval, || {
            let params = params.clone();
            async move {
                self.rpc("eth_getUserOperationReceipt", params)
                    .await
                    .context("eth_getUserOperationReceipt failed")
            }
        })
        .await
    }
}

/// Polls `fetch` until it returns a non-null receipt. Errors end the wait
/// immediately; a zero `timeout` waits forever.
async fn poll_receipt<F, Fut>(
    user_op_hash: H256,
    timeout: Duration,
    interval: Duration,
    mut fetch: F,
) -> Result<UserOpReceipt>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Value>>,
{
    let start = tokio::time::Instant::now();
    loop {
        let res = fetch().await?;
        if !res.is_null() {
            return Ok(UserOpReceipt::from_value(user_op_hash, res));
        }

        if !timeout.is_zero() && start.elapsed() > timeout {
            return Err(DeployError::ReceiptTimeout {
                user_op_hash,
                seconds: timeout.as_secs(),
            }
            .into());
        }

        tokio::time::sleep(interval).await;
    }
}

fn parse_gas_estimate(res: Value) -> Result<GasEstimate> {
    let raw: RawGasEstimate = if res.is_null() {
        RawGasEstimate::default()
    } else {
        serde_json::from_value(res).context("unexpected eth_estimateUserOperationGas shape")?
    };
    raw.into_estimate()
}

fn parse_gas_price_tiers(res: &Value) -> Result<GasPriceTiers> {
    let tier = |name: &str| -> Result<GasPrice> {
        let t = res
            .get(name)
            .ok_or_else(|| anyhow!("gas price response missing {name} tier"))?;
        let field = |key: &str| -> Result<U256> {
            let v = t
                .get(key)
                .ok_or_else(|| anyhow!("{name} tier missing {key}"))?;
            parse_u256_value(v)
        };
        Ok(GasPrice {
            max_fee_per_gas: field("maxFeePerGas")?,
            max_priority_fee_per_gas: field("maxPriorityFeePerGas")?,
        })
    };
    Ok(GasPriceTiers {
        slow: tier("slow")?,
        standard: tier("standard")?,
        fast: tier("fast")?,
    })
}

fn parse_userop_hash(res: &Value) -> Result<H256> {
    // Most bundlers return the userOpHash directly as a JSON string; some wrap it.
    let hash_str = if let Some(s) = res.as_str() {
        s
    } else if let Some(s) = res.get("result").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOpHash").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOperationHash").and_then(|v| v.as_str()) {
        s
    } else {
        return Err(anyhow!(
            "unexpected eth_sendUserOperation result shape (expected string or {{result: ...}}): {}",
            res
        ));
    };

    parse_h256(hash_str)
}
