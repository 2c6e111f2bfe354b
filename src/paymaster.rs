use crate::encoding::{fmt_address, parse_bytes, parse_u256_value, user_op_to_json};
use crate::types::{FeeQuote, SponsorshipData, UserOperation};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::types::Address;
use serde_json::Value;
use std::str::FromStr;

/// Fee quotes plus the address the fee token must be approved for.
#[derive(Debug, Clone, Default)]
pub struct QuoteResponse {
    pub quotes: Vec<FeeQuote>,
    pub spender: Option<Address>,
}

/// The fee-sponsor service. `fee_quotes` simulates the operation (ignoring
/// its own gas fields) and offers token-payment options; `sponsor` returns
/// the countersigned paymaster data, optionally with recalculated gas
/// limits.
#[async_trait]
pub trait PaymasterApi: Send + Sync {
    async fn fee_quotes(
        &self,
        op: &UserOperation,
        token_list: &[Address],
        preferred_token: Option<Address>,
    ) -> Result<QuoteResponse>;

    async fn sponsor(
        &self,
        op: &UserOperation,
        fee_token: Option<Address>,
        calculate_gas_limits: bool,
    ) -> Result<SponsorshipData>;
}

/// JSON-RPC paymaster over HTTP (`pm_getFeeQuoteOrData`,
/// `pm_sponsorUserOperation`). Response parsing is liberal in the shapes it
/// accepts so the CLI stays vendor-portable.
#[derive(Debug, Clone)]
pub struct HttpPaymaster {
    url: String,
    http: reqwest::Client,
}

impl HttpPaymaster {
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
impl PaymasterApi for HttpPaymaster {
    async fn fee_quotes(
        &self,
        op: &UserOperation,
        token_list: &[Address],
        preferred_token: Option<Address>,
    ) -> Result<QuoteResponse> {
        let mut ctx = serde_json::json!({
            "mode": "ERC20",
            "tokenList": token_list.iter().map(|a| fmt_address(*a)).collect::<Vec<_>>(),
        });
        if let Some(preferred) = preferred_token {
            if let Some(obj) = ctx.as_object_mut() {
                obj.insert(
                    "preferredToken".to_string(),
                    Value::String(fmt_address(preferred)),
                );
            }
        }

        let params = serde_json::json!([user_op_to_json(op), ctx]);
        let res = self
            .rpc("pm_getFeeQuoteOrData", params)
            .await
            .context("pm_getFeeQuoteOrData RPC failed")?;
        parse_quote_response(&res)
    }

    async fn sponsor(
        &self,
        op: &UserOperation,
        fee_token: Option<Address>,
        calculate_gas_limits: bool,
    ) -> Result<SponsorshipData> {
        let mode = if fee_token.is_some() {
            "ERC20"
        } else {
            "SPONSORED"
        };
        let mut ctx = serde_json::json!({
            "mode": mode,
            "calculateGasLimits": calculate_gas_limits,
        });
        if let Some(token) = fee_token {
            if let Some(obj) = ctx.as_object_mut() {
                obj.insert(
                    "feeTokenAddress".to_string(),
                    Value::String(fmt_address(token)),
                );
            }
        }

        let params = serde_json::json!([user_op_to_json(op), ctx]);
        let res = self
            .rpc("pm_sponsorUserOperation", params)
            .await
            .context("pm_sponsorUserOperation RPC failed")?;
        parse_sponsorship(&res)
    }
}

fn parse_quote_response(result: &Value) -> Result<QuoteResponse> {
    let quotes = match result.get("feeQuotes") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(parse_fee_quote)
            .collect::<Result<Vec<_>>>()?,
        Some(other) => return Err(anyhow!("unexpected feeQuotes shape: {other}")),
    };

    // Vendors disagree on the spender key.
    let spender = ["tokenPaymasterAddress", "paymasterAddress", "spender"]
        .iter()
        .find_map(|k| result.get(*k).and_then(|v| v.as_str()))
        .map(|s| Address::from_str(s).context("invalid spender address"))
        .transpose()?;

    Ok(QuoteResponse { quotes, spender })
}

fn parse_fee_quote(v: &Value) -> Result<FeeQuote> {
    let token_address = v
        .get("tokenAddress")
        .and_then(|x| x.as_str())
        .ok_or_else(|| anyhow!("fee quote missing tokenAddress"))?;
    let token_address = Address::from_str(token_address).context("invalid quote tokenAddress")?;

    let symbol = v
        .get("symbol")
        .and_then(|x| x.as_str())
        .unwrap_or_default()
        .to_string();

    // Both `decimal` and `decimals` occur in the wild.
    let decimals = v
        .get("decimal")
        .or_else(|| v.get("decimals"))
        .and_then(|x| x.as_u64())
        .ok_or_else(|| anyhow!("fee quote missing decimal(s)"))? as u8;

    let max_gas_fee = v
        .get("maxGasFee")
        .map(parse_u256_value)
        .transpose()
        .context("invalid maxGasFee")?
        .ok_or_else(|| anyhow!("fee quote missing maxGasFee"))?;

    let exchange_rate = v
        .get("exchangeRate")
        .map(parse_u256_value)
        .transpose()
        .context("invalid exchangeRate")?
        .unwrap_or_default();

    Ok(FeeQuote {
        token_address,
        symbol,
        decimals,
        max_gas_fee,
        exchange_rate,
        premium_percentage: v.get("premiumPercentage").and_then(|x| x.as_f64()),
        valid_until: v.get("validUntil").and_then(|x| x.as_u64()),
    })
}

fn parse_sponsorship(result: &Value) -> Result<SponsorshipData> {
    // Spec-style responses carry paymasterAndData at the top level; some
    // vendors nest the v0.6 payload.
    let v06 = if result.get("paymasterAndData").is_some() {
        result
    } else {
        result
            .get("entrypointV06Response")
            .or_else(|| result.get("entryPointV06Response"))
            .ok_or_else(|| {
                anyhow!(
                    "missing paymasterAndData (expected top-level or entrypointV06Response.paymasterAndData)"
                )
            })?
    };

    let s = v06
        .get("paymasterAndData")
        .and_then(|x| x.as_str())
        .ok_or_else(|| anyhow!("missing paymasterAndData field"))?;
    let paymaster_and_data = parse_bytes(s).context("invalid hex in paymasterAndData")?;

    let gas_field = |key: &str| -> Result<Option<ethers::types::U256>> {
        match v06.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => Ok(Some(
                parse_u256_value(v).with_context(|| format!("invalid {key}"))?,
            )),
        }
    };

    Ok(SponsorshipData {
        paymaster_and_data,
        call_gas_limit: gas_field("callGasLimit")?,
        verification_gas_limit: gas_field("verificationGasLimit")?,
        pre_verification_gas: gas_field("preVerificationGas")?,
    })
}
