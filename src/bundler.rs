use crate::encoding::{fmt_address, fmt_h256, parse_h256, parse_u256_quantity, user_op_to_json};
use crate::types::{UserOpReceipt, UserOperation};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct GasEstimates {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
}

/// The relay the pipeline submits through. Transport errors stay `anyhow`;
/// pipeline stages wrap them with the stage that failed.
#[async_trait]
pub trait BundlerApi: Send + Sync {
    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<GasEstimates>;

    /// Hand the signed operation to the relay pool. Success here is
    /// independent of eventual on-chain outcome.
    async fn send_user_operation(&self, op: &UserOperation, entry_point: Address) -> Result<H256>;

    /// One receipt probe; `None` until the operation is included.
    async fn get_user_operation_receipt(&self, user_op_hash: H256)
        -> Result<Option<UserOpReceipt>>;
}

/// JSON-RPC bundler over HTTP (`eth_estimateUserOperationGas`,
/// `eth_sendUserOperation`, `eth_getUserOperationReceipt`).
#[derive(Debug, Clone)]
pub struct HttpBundler {
    url: String,
    http: reqwest::Client,
}

impl HttpBundler {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
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
            .with_context(|| format!("POST {} failed", self.url))?;

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
impl BundlerApi for HttpBundler {
    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<GasEstimates> {
        let params = serde_json::json!([user_op_to_json(op), fmt_address(entry_point)]);
        let res = self
            .rpc("eth_estimateUserOperationGas", params)
            .await
            .context("eth_estimateUserOperationGas failed")?;

        Ok(GasEstimates {
            call_gas_limit: parse_u256_field(&res, "callGasLimit")?,
            verification_gas_limit: parse_u256_field(&res, "verificationGasLimit")?,
            pre_verification_gas: parse_u256_field(&res, "preVerificationGas")?,
        })
    }

    async fn send_user_operation(&self, op: &UserOperation, entry_point: Address) -> Result<H256> {
        let params = serde_json::json!([user_op_to_json(op), fmt_address(entry_point)]);
        let res = self
            .rpc("eth_sendUserOperation", params)
            .await
            .context("eth_sendUserOperation failed")?;
        parse_userop_hash(&res)
    }

    async fn get_user_operation_receipt(
        &self,
        user_op_hash: H256,
    ) -> Result<Option<UserOpReceipt>> {
        let params = serde_json::json!([fmt_h256(user_op_hash)]);
        let res = self.rpc("eth_getUserOperationReceipt", params).await?;
        if res.is_null() {
            return Ok(None);
        }
        Ok(Some(parse_receipt(user_op_hash, res)))
    }
}

fn parse_u256_field(v: &Value, key: &str) -> Result<U256> {
    let s = v
        .get(key)
        .and_then(|x| x.as_str())
        .ok_or_else(|| anyhow!("missing or invalid field {key}"))?;
    parse_u256_quantity(s)
}

fn parse_userop_hash(res: &Value) -> Result<H256> {
    // Most bundlers return the userOpHash directly as a JSON string; some
    // wrap it in an object. Accept all known shapes.
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

/// Liberal receipt parse: the typed fields default when absent, and the raw
/// JSON is kept for display.
fn parse_receipt(user_op_hash: H256, raw: Value) -> UserOpReceipt {
    let success = raw
        .get("success")
        .map(|v| v.as_bool().unwrap_or(v.as_str() == Some("true")))
        .unwrap_or(false);
    let actual_gas_cost = raw
        .get("actualGasCost")
        .and_then(|v| crate::encoding::parse_u256_value(v).ok())
        .unwrap_or_default();
    let actual_gas_used = raw
        .get("actualGasUsed")
        .and_then(|v| crate::encoding::parse_u256_value(v).ok())
        .unwrap_or_default();
    let enclosing = raw.get("receipt");
    let transaction_hash = enclosing
        .and_then(|r| r.get("transactionHash"))
        .and_then(|v| v.as_str())
        .and_then(|s| parse_h256(s).ok());
    let block_number = enclosing
        .and_then(|r| r.get("blockNumber"))
        .and_then(|v| crate::encoding::parse_u256_value(v).ok())
        .map(|v| v.as_u64());

    UserOpReceipt {
        user_op_hash,
        success,
        actual_gas_cost,
        actual_gas_used,
        transaction_hash,
        block_number,
        raw,
    }
}
