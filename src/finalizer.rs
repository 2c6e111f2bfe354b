use crate::builder::aggregate_calls;
use crate::contracts::{ApproveCall, Erc20};
use crate::encoding::fmt_address;
use crate::error::PipelineError;
use crate::paymaster::PaymasterApi;
use crate::types::{ApprovalPolicy, CallDescriptor, FeeQuote, SponsorshipData, UserOperation};
use ethers::abi::AbiEncode;
use ethers::providers::Middleware;
use ethers::types::{Address, Bytes, U256};
use std::sync::Arc;

/// Rebuilds a partial operation to reflect the fee decision and attaches the
/// paymaster's countersignature.
///
/// On any failure the operation stays unsponsored and the run dies with
/// `Sponsorship`; falling back to native payment is a caller-level policy,
/// never something this stage does implicitly.
pub struct OperationFinalizer<M> {
    client: Arc<M>,
    paymaster: Arc<dyn PaymasterApi>,
    approval_policy: ApprovalPolicy,
}

impl<M: Middleware + 'static> OperationFinalizer<M> {
    pub fn new(
        client: Arc<M>,
        paymaster: Arc<dyn PaymasterApi>,
        approval_policy: ApprovalPolicy,
    ) -> Self {
        Self {
            client,
            paymaster,
            approval_policy,
        }
    }

    /// Token-fee path: inject the fee-token approval ahead of the user's
    /// calls, then request countersigned sponsorship for the chosen token
    /// with gas-limit recalculation.
    pub async fn finalize_token_fee(
        &self,
        mut op: UserOperation,
        user_calls: &[CallDescriptor],
        quote: &FeeQuote,
        spender: Address,
    ) -> Result<UserOperation, PipelineError> {
        if let Some(amount) = self.approval_amount(&op, quote, spender).await? {
            tracing::info!(
                token = %fmt_address(quote.token_address),
                spender = %fmt_address(spender),
                amount = %amount,
                "injecting fee-token approval"
            );
            let approval = CallDescriptor {
                target: quote.token_address,
                data: Bytes::from(ApproveCall { spender, amount }.encode()),
                value: U256::zero(),
            };
            let mut calls = Vec::with_capacity(user_calls.len() + 1);
            calls.push(approval);
            calls.extend_from_slice(user_calls);
            op.call_data = aggregate_calls(&calls)?;
        }

        let data = self
            .paymaster
            .sponsor(&op, Some(quote.token_address), true)
            .await
            .map_err(PipelineError::Sponsorship)?;

        Ok(apply_sponsorship(op, data))
    }

    async fn approval_amount(
        &self,
        op: &UserOperation,
        quote: &FeeQuote,
        spender: Address,
    ) -> Result<Option<U256>, PipelineError> {
        match self.approval_policy {
            ApprovalPolicy::Exact => Ok(Some(quote.max_gas_fee)),
            ApprovalPolicy::Unbounded => Ok(Some(U256::MAX)),
            ApprovalPolicy::Reuse => {
                let erc20 = Erc20::new(quote.token_address, self.client.clone());
                let allowance = erc20
                    .allowance(op.sender, spender)
                    .call()
                    .await
                    .map_err(|e| {
                        PipelineError::InvalidToken(format!(
                            "allowance() failed for {}: {e}",
                            fmt_address(quote.token_address)
                        ))
                    })?;
                if allowance >= quote.max_gas_fee {
                    tracing::info!(
                        allowance = %allowance,
                        needed = %quote.max_gas_fee,
                        "existing allowance covers the fee, skipping approval"
                    );
                    Ok(None)
                } else {
                    Ok(Some(quote.max_gas_fee))
                }
            }
        }
    }
}

/// Write the countersignature into the operation. Gas limits the paymaster
/// returned are the ones it signed over, so each present field replaces the
/// operation's own estimate; a mismatch would fail validation on-chain.
pub fn apply_sponsorship(mut op: UserOperation, data: SponsorshipData) -> UserOperation {
    op.paymaster_and_data = data.paymaster_and_data;
    if let Some(v) = data.call_gas_limit {
        op.call_gas_limit = v;
    }
    if let Some(v) = data.verification_gas_limit {
        op.verification_gas_limit = v;
    }
    if let Some(v) = data.pre_verification_gas {
        op.pre_verification_gas = v;
    }
    op
}
