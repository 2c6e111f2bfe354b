use crate::bundler::BundlerApi;
use crate::contracts::{EntryPoint, ExecuteBatchCall, ExecuteCall};
use crate::error::PipelineError;
use crate::types::{CallDescriptor, FeeMode, UserOperation};
use anyhow::anyhow;
use ethers::abi::AbiEncode;
use ethers::providers::Middleware;
use ethers::types::{Address, Bytes, U256};
use std::sync::Arc;

/// Builds a *partial* UserOperation from call descriptors: fresh nonce,
/// aggregated call data, fee fields from the chain gas price, and bundler
/// gas estimates unless the fee mode makes the paymaster authoritative.
pub struct OperationBuilder<M> {
    client: Arc<M>,
    bundler: Arc<dyn BundlerApi>,
    entry_point: Address,
    account: Address,
    gas_multiplier_bps: u64,
}

impl<M: Middleware + 'static> OperationBuilder<M> {
    pub fn new(
        client: Arc<M>,
        bundler: Arc<dyn BundlerApi>,
        entry_point: Address,
        account: Address,
        gas_multiplier_bps: u64,
    ) -> Self {
        Self {
            client,
            bundler,
            entry_point,
            account,
            gas_multiplier_bps,
        }
    }

    /// The nonce is read fresh on every build; a stale nonce downstream
    /// means a full re-run from here, not a resume.
    pub async fn build(
        &self,
        calls: &[CallDescriptor],
        init_code: Bytes,
        mode: FeeMode,
        force_estimate: bool,
    ) -> Result<UserOperation, PipelineError> {
        let call_data = aggregate_calls(calls)?;

        let entry_point = EntryPoint::new(self.entry_point, self.client.clone());
        let nonce = entry_point
            .get_nonce(self.account, U256::zero())
            .call()
            .await
            .map_err(|e| PipelineError::Estimation(anyhow!("entryPoint.getNonce failed: {e}")))?;

        let gas_price = self
            .client
            .get_gas_price()
            .await
            .map_err(|e| PipelineError::Estimation(anyhow!("failed to fetch gas price: {e}")))?;
        let bps = self.gas_multiplier_bps.max(1);
        let max_fee_per_gas = gas_price * U256::from(bps) / U256::from(10_000u64);
        if bps != 10_000 {
            tracing::info!(bps, max_fee_per_gas = %max_fee_per_gas, "gas multiplier applied");
        }

        let mut op = UserOperation {
            sender: self.account,
            nonce,
            init_code,
            call_data,
            // Zero until estimated; sponsored and token-fee runs leave them
            // for the paymaster's recalculation at finalization.
            call_gas_limit: U256::zero(),
            verification_gas_limit: U256::zero(),
            pre_verification_gas: U256::zero(),
            max_fee_per_gas,
            max_priority_fee_per_gas: max_fee_per_gas,
            paymaster_and_data: Bytes::default(),
            // Dummy signature so bundler simulation has a well-formed op.
            signature: Bytes::from(vec![0u8; 65]),
        };

        if matches!(mode, FeeMode::Native) || force_estimate {
            let est = self
                .bundler
                .estimate_user_operation_gas(&op, self.entry_point)
                .await
                .map_err(PipelineError::Estimation)?;
            op.call_gas_limit = est.call_gas_limit;
            op.verification_gas_limit = est.verification_gas_limit;
            op.pre_verification_gas = est.pre_verification_gas;
            tracing::debug!(
                call_gas_limit = %op.call_gas_limit,
                verification_gas_limit = %op.verification_gas_limit,
                pre_verification_gas = %op.pre_verification_gas,
                "bundler gas estimates applied"
            );
        }

        Ok(op)
    }
}

/// Aggregate call descriptors into account call data: one call becomes
/// `execute(dest, value, func)`, several become `executeBatch(dest[],
/// func[])`. The batch ABI carries no per-call value, so a batch holding a
/// nonzero-value call is rejected rather than silently dropping the value.
pub(crate) fn aggregate_calls(calls: &[CallDescriptor]) -> Result<Bytes, PipelineError> {
    match calls {
        [] => Err(PipelineError::Client(
            "no calls to execute".to_string(),
        )),
        [call] => Ok(Bytes::from(
            ExecuteCall {
                dest: call.target,
                value: call.value,
                func: call.data.clone(),
            }
            .encode(),
        )),
        many => {
            if let Some(bad) = many.iter().find(|c| !c.value.is_zero()) {
                return Err(PipelineError::Client(format!(
                    "batch call to {} carries value {}, but executeBatch has no per-call value",
                    crate::encoding::fmt_address(bad.target),
                    bad.value
                )));
            }
            Ok(Bytes::from(
                ExecuteBatchCall {
                    dest: many.iter().map(|c| c.target).collect(),
                    func: many.iter().map(|c| c.data.clone()).collect(),
                }
                .encode(),
            ))
        }
    }
}
