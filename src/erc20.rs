use crate::contracts::{Erc20, TransferCall};
use crate::encoding::fmt_address;
use crate::error::PipelineError;
use crate::types::CallDescriptor;
use ethers::abi::AbiEncode;
use ethers::providers::Middleware;
use ethers::types::{Address, Bytes, U256};
use std::sync::Arc;

/// Turns a semantic transfer intent into a low-level call on the token
/// contract. The only chain access is the read-only `decimals()` lookup.
pub struct CallEncoder<M> {
    client: Arc<M>,
}

impl<M: Middleware + 'static> CallEncoder<M> {
    pub fn new(client: Arc<M>) -> Self {
        Self { client }
    }

    /// Resolve the token's precision, scale `amount` (a human decimal
    /// string) into smallest units, and encode `transfer(to, scaled)`.
    pub async fn encode_transfer(
        &self,
        token: Address,
        to: Address,
        amount: &str,
    ) -> Result<CallDescriptor, PipelineError> {
        let decimals = self.token_decimals(token).await?;
        let scaled = scale_amount(amount, decimals)?;
        tracing::debug!(
            token = %fmt_address(token),
            decimals,
            amount = %scaled,
            "encoded transfer"
        );
        let data = TransferCall { to, amount: scaled }.encode();
        Ok(CallDescriptor {
            target: token,
            data: Bytes::from(data),
            value: U256::zero(),
        })
    }

    pub async fn token_decimals(&self, token: Address) -> Result<u8, PipelineError> {
        let erc20 = Erc20::new(token, self.client.clone());
        erc20.decimals().call().await.map_err(|e| {
            PipelineError::InvalidToken(format!(
                "decimals() failed for {}: {e}",
                fmt_address(token)
            ))
        })
    }
}

/// Scale a decimal string by `10^decimals` with integer arithmetic only.
///
/// More fractional digits than the token's precision is rejected rather than
/// truncated: truncation here is silent precision loss on a fund amount.
pub fn scale_amount(amount: &str, decimals: u8) -> Result<U256, PipelineError> {
    let amount = amount.trim();
    let (int_part, frac_part) = match amount.split_once('.') {
        Some((i, f)) => (i, f),
        None => (amount, ""),
    };

    if int_part.is_empty() && frac_part.is_empty() {
        return Err(PipelineError::Client(format!("invalid amount: {amount:?}")));
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return Err(PipelineError::Client(format!(
            "invalid amount (expected non-negative decimal): {amount:?}"
        )));
    }
    if frac_part.len() > decimals as usize {
        return Err(PipelineError::Client(format!(
            "amount {amount:?} has {} fractional digits but the token has {decimals} decimals",
            frac_part.len()
        )));
    }

    let overflow = || PipelineError::Client(format!("amount out of range: {amount:?}"));

    let scale = U256::from(10u64)
        .checked_pow(U256::from(decimals))
        .ok_or_else(overflow)?;
    let int_val = if int_part.is_empty() {
        U256::zero()
    } else {
        U256::from_dec_str(int_part).map_err(|_| overflow())?
    };
    let frac_val = if frac_part.is_empty() {
        U256::zero()
    } else {
        let pad = U256::from(10u64)
            .checked_pow(U256::from(decimals as usize - frac_part.len()))
            .ok_or_else(overflow)?;
        U256::from_dec_str(frac_part)
            .map_err(|_| overflow())?
            .checked_mul(pad)
            .ok_or_else(overflow)?
    };

    int_val
        .checked_mul(scale)
        .and_then(|v| v.checked_add(frac_val))
        .ok_or_else(overflow)
}
