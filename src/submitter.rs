use crate::bundler::BundlerApi;
use crate::encoding::fmt_h256;
use crate::error::PipelineError;
use crate::types::{UserOpReceipt, UserOperation};
use anyhow::anyhow;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Bytes, H256};
use ethers::utils::hash_message;
use std::sync::Arc;
use std::time::Duration;

/// Signs the finalized operation with the owning key and hands it to the
/// relay. A relay rejection is terminal for this nonce; retrying means
/// rebuilding from the operation builder with a fresh one.
pub struct OperationSubmitter {
    bundler: Arc<dyn BundlerApi>,
    wallet: LocalWallet,
    entry_point: ethers::types::Address,
    chain_id: u64,
}

impl OperationSubmitter {
    pub fn new(
        bundler: Arc<dyn BundlerApi>,
        wallet: LocalWallet,
        entry_point: ethers::types::Address,
        chain_id: u64,
    ) -> Self {
        Self {
            bundler,
            wallet,
            entry_point,
            chain_id,
        }
    }

    pub fn owner(&self) -> ethers::types::Address {
        self.wallet.address()
    }

    /// Sign the operation's canonical v0.6 hash (EIP-191) and write the
    /// signature into it. Returns the userOpHash that was signed.
    pub fn sign(&self, op: &mut UserOperation) -> Result<H256, PipelineError> {
        let op_hash = op.operation_hash(self.entry_point, self.chain_id);
        let sig = self
            .wallet
            .sign_hash(hash_message(op_hash))
            .map_err(|e| PipelineError::Submission(anyhow!("failed to sign userOpHash: {e}")))?;
        op.signature = Bytes::from(sig.to_vec());
        Ok(op_hash)
    }

    /// Transmit a signed operation. Succeeds once the relay accepts it into
    /// its pool, independent of the eventual on-chain outcome.
    pub async fn submit(&self, op: &UserOperation) -> Result<OperationHandle, PipelineError> {
        let user_op_hash = self
            .bundler
            .send_user_operation(op, self.entry_point)
            .await
            .map_err(PipelineError::Submission)?;
        tracing::info!(user_op_hash = %fmt_h256(user_op_hash), "user operation accepted by bundler");
        Ok(OperationHandle {
            user_op_hash,
            bundler: self.bundler.clone(),
        })
    }
}

/// Handle to a submitted operation. Owned by the caller; the receipt wait is
/// cancellable and separate from submission's success.
pub struct OperationHandle {
    pub user_op_hash: H256,
    bundler: Arc<dyn BundlerApi>,
}

impl std::fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("user_op_hash", &self.user_op_hash)
            .finish_non_exhaustive()
    }
}

impl OperationHandle {
    /// Poll for inclusion until a receipt appears or `timeout` elapses
    /// (zero disables the bound). A timeout or poll breakdown here reports
    /// as `Submission`, with wording that makes clear the operation itself
    /// was already accepted.
    pub async fn await_receipt(&self, timeout: Duration) -> Result<UserOpReceipt, PipelineError> {
        let start = tokio::time::Instant::now();
        loop {
            if timeout.as_secs() > 0 && start.elapsed() > timeout {
                return Err(PipelineError::Submission(anyhow!(
                    "operation {} was accepted, but no receipt appeared within {:?}",
                    fmt_h256(self.user_op_hash),
                    timeout
                )));
            }

            match self.bundler.get_user_operation_receipt(self.user_op_hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(e) => {
                    // Transient errors are common on free-tier bundlers.
                    tracing::warn!(error = %e, "bundler receipt poll error");
                }
            }

            tokio::time::sleep(Duration::from_millis(1500)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::GasEstimates;
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use ethers::types::{Address, Signature, U256};
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const OWNER_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn final_op() -> UserOperation {
        UserOperation {
            sender: Address::random(),
            nonce: U256::from(3),
            init_code: Bytes::default(),
            call_data: Bytes::from(vec![0xab; 8]),
            call_gas_limit: U256::from(100_000),
            verification_gas_limit: U256::from(150_000),
            pre_verification_gas: U256::from(60_000),
            max_fee_per_gas: U256::from(1_000_000_000u64),
            max_priority_fee_per_gas: U256::from(1_000_000_000u64),
            paymaster_and_data: Bytes::from(vec![0xcd; 32]),
            signature: Bytes::from(vec![0u8; 65]),
        }
    }

    /// Answers None a fixed number of times before producing a receipt.
    struct FlakyBundler {
        misses: AtomicUsize,
    }

    #[async_trait]
    impl BundlerApi for FlakyBundler {
        async fn estimate_user_operation_gas(
            &self,
            _op: &UserOperation,
            _entry_point: Address,
        ) -> AnyResult<GasEstimates> {
            anyhow::bail!("not used")
        }

        async fn send_user_operation(
            &self,
            _op: &UserOperation,
            _entry_point: Address,
        ) -> AnyResult<H256> {
            anyhow::bail!("insufficient funds for prefund (AA21)")
        }

        async fn get_user_operation_receipt(
            &self,
            user_op_hash: H256,
        ) -> AnyResult<Option<UserOpReceipt>> {
            if self.misses.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            }).is_ok()
            {
                return Ok(None);
            }
            Ok(Some(UserOpReceipt {
                user_op_hash,
                success: true,
                actual_gas_cost: U256::from(42),
                actual_gas_used: U256::from(21_000),
                transaction_hash: None,
                block_number: None,
                raw: serde_json::Value::Null,
            }))
        }
    }

    fn submitter(bundler: Arc<dyn BundlerApi>) -> OperationSubmitter {
        OperationSubmitter::new(
            bundler,
            LocalWallet::from_str(OWNER_KEY).unwrap(),
            Address::from_str("0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789").unwrap(),
            84532,
        )
    }

    #[test]
    fn signature_recovers_to_the_owner() {
        let sub = submitter(Arc::new(FlakyBundler {
            misses: AtomicUsize::new(0),
        }));
        let mut op = final_op();
        let op_hash = sub.sign(&mut op).unwrap();

        assert_eq!(op.signature.len(), 65);
        let sig = Signature::try_from(op.signature.as_ref()).unwrap();
        let recovered = sig
            .recover(ethers::types::RecoveryMessage::Hash(hash_message(op_hash)))
            .unwrap();
        assert_eq!(recovered, sub.owner());
    }

    #[test]
    fn signing_covers_paymaster_data() {
        let sub = submitter(Arc::new(FlakyBundler {
            misses: AtomicUsize::new(0),
        }));
        let mut op = final_op();
        let hash_sponsored = sub.sign(&mut op).unwrap();
        op.paymaster_and_data = Bytes::default();
        let hash_bare = sub.sign(&mut op).unwrap();
        assert_ne!(hash_sponsored, hash_bare);
    }

    #[tokio::test]
    async fn relay_rejection_is_a_submission_error() {
        let sub = submitter(Arc::new(FlakyBundler {
            misses: AtomicUsize::new(0),
        }));
        let mut op = final_op();
        sub.sign(&mut op).unwrap();
        let err = sub.submit(&op).await.unwrap_err();
        assert!(matches!(err, PipelineError::Submission(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn await_receipt_polls_until_inclusion() {
        let handle = OperationHandle {
            user_op_hash: H256::random(),
            bundler: Arc::new(FlakyBundler {
                misses: AtomicUsize::new(3),
            }),
        };
        let receipt = handle.await_receipt(Duration::from_secs(60)).await.unwrap();
        assert!(receipt.success);
    }

    #[tokio::test(start_paused = true)]
    async fn await_receipt_times_out_as_submission_error() {
        let handle = OperationHandle {
            user_op_hash: H256::random(),
            bundler: Arc::new(FlakyBundler {
                misses: AtomicUsize::new(usize::MAX),
            }),
        };
        let err = handle.await_receipt(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Submission(_)));
    }
}
