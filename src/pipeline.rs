use crate::builder::OperationBuilder;
use crate::bundler::BundlerApi;
use crate::error::PipelineError;
use crate::finalizer::{apply_sponsorship, OperationFinalizer};
use crate::negotiation::{FeeNegotiator, QuoteChooser};
use crate::paymaster::{PaymasterApi, QuoteResponse};
use crate::submitter::OperationSubmitter;
use crate::types::{ApprovalPolicy, CallDescriptor, FeeMode, UserOperation};
use anyhow::anyhow;
use ethers::providers::Middleware;
use ethers::signers::LocalWallet;
use ethers::types::{Address, Bytes, H256};
use std::sync::Arc;

/// Everything a pipeline run needs, passed explicitly to each stage. There
/// is no process-wide mutable state; two Stacks are two independent
/// pipelines (which must not share an account without external nonce
/// serialization).
pub struct Stack<M> {
    pub client: Arc<M>,
    pub bundler: Arc<dyn BundlerApi>,
    pub paymaster: Arc<dyn PaymasterApi>,
    pub wallet: LocalWallet,
    pub entry_point: Address,
    pub account: Address,
    pub chain_id: u64,
    pub gas_multiplier_bps: u64,
    pub approval_policy: ApprovalPolicy,
    pub token_list: Vec<Address>,
    pub preferred_token: Option<Address>,
}

#[derive(Clone, Debug)]
pub struct PrepareOptions {
    pub mode: FeeMode,
    /// Opaque first-operation init code; this crate never computes it.
    pub init_code: Bytes,
    /// Run bundler estimation even in modes where the paymaster would
    /// recalculate limits anyway.
    pub force_estimate: bool,
    /// Sponsored mode only: when the paymaster declines, continue with a
    /// native-paid operation instead of failing.
    pub allow_unsponsored: bool,
}

impl<M: Middleware + 'static> Stack<M> {
    pub fn builder(&self) -> OperationBuilder<M> {
        OperationBuilder::new(
            self.client.clone(),
            self.bundler.clone(),
            self.entry_point,
            self.account,
            self.gas_multiplier_bps,
        )
    }

    pub fn negotiator(&self) -> FeeNegotiator {
        FeeNegotiator::new(self.paymaster.clone())
    }

    pub fn finalizer(&self) -> OperationFinalizer<M> {
        OperationFinalizer::new(
            self.client.clone(),
            self.paymaster.clone(),
            self.approval_policy,
        )
    }

    pub fn submitter(&self) -> OperationSubmitter {
        OperationSubmitter::new(
            self.bundler.clone(),
            self.wallet.clone(),
            self.entry_point,
            self.chain_id,
        )
    }
}

/// Build, negotiate, finalize, and sign one operation. Submission is left to
/// the caller so dry runs can stop here. Returns the signed operation and
/// the userOpHash it was signed over.
pub async fn prepare<M: Middleware + 'static>(
    stack: &Stack<M>,
    calls: &[CallDescriptor],
    chooser: &dyn QuoteChooser,
    opts: &PrepareOptions,
) -> Result<(UserOperation, H256), PipelineError> {
    let mut op = stack
        .builder()
        .build(calls, opts.init_code.clone(), opts.mode, opts.force_estimate)
        .await?;

    match opts.mode {
        FeeMode::Sponsored => {
            match stack.negotiator().sponsor_unconditional(&op).await {
                Ok(data) => op = apply_sponsorship(op, data),
                Err(e @ PipelineError::Sponsorship(_)) if opts.allow_unsponsored => {
                    tracing::warn!(error = %e, "sponsorship declined, continuing native-paid");
                    let est = stack
                        .bundler
                        .estimate_user_operation_gas(&op, stack.entry_point)
                        .await
                        .map_err(PipelineError::Estimation)?;
                    op.call_gas_limit = est.call_gas_limit;
                    op.verification_gas_limit = est.verification_gas_limit;
                    op.pre_verification_gas = est.pre_verification_gas;
                }
                Err(e) => return Err(e),
            }
        }
        FeeMode::Erc20 => {
            let QuoteResponse { quotes, spender } = stack
                .negotiator()
                .fee_quotes(&op, &stack.token_list, stack.preferred_token)
                .await?;
            // An empty set is valid negotiation data, but finalizing against
            // it is impossible; fail here rather than silently switching to
            // sponsored mode.
            if quotes.is_empty() {
                return Err(PipelineError::Negotiation(anyhow!(
                    "paymaster offered no fee quotes (preferred token may not be supported); \
                     use native or sponsored mode instead"
                )));
            }
            let spender = spender.ok_or_else(|| {
                PipelineError::Negotiation(anyhow!("paymaster did not name a token spender"))
            })?;
            let quote = stack.negotiator().select(&quotes, chooser).await?.clone();
            op = stack
                .finalizer()
                .finalize_token_fee(op, calls, &quote, spender)
                .await?;
        }
        FeeMode::Native => {}
    }

    let submitter = stack.submitter();
    let op_hash = submitter.sign(&mut op)?;
    Ok((op, op_hash))
}

/// Build a partial operation and fetch fee quotes without finalizing or
/// submitting anything. Backs the `quotes` subcommand.
pub async fn quote_only<M: Middleware + 'static>(
    stack: &Stack<M>,
    calls: &[CallDescriptor],
    init_code: Bytes,
) -> Result<QuoteResponse, PipelineError> {
    let op = stack
        .builder()
        .build(calls, init_code, FeeMode::Erc20, false)
        .await?;
    stack
        .negotiator()
        .fee_quotes(&op, &stack.token_list, stack.preferred_token)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::GasEstimates;
    use crate::contracts::{ApproveCall, ExecuteBatchCall, ExecuteCall, TransferCall};
    use crate::erc20::CallEncoder;
    use crate::negotiation::CheapestQuote;
    use crate::types::{FeeQuote, SponsorshipData, UserOpReceipt};
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use ethers::abi::AbiDecode;
    use ethers::providers::{MockProvider, Provider};
    use ethers::signers::Signer;
    use ethers::types::{Signature, U256};
    use ethers::utils::hash_message;
    use std::str::FromStr;
    use std::sync::Mutex;

    const OWNER_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
    const USDC: &str = "0x1c7d4b196cb0c7b01d743fbc6116a902379c7238";
    const DAI: &str = "0x6b175474e89094c44da98b954eedeac495271d0f";
    const WORD_ZERO: &str =
        "0x0000000000000000000000000000000000000000000000000000000000000000";
    const WORD_SIX: &str =
        "0x0000000000000000000000000000000000000000000000000000000000000006";

    struct FakeBundler {
        fail_send: bool,
        sends: Mutex<Vec<UserOperation>>,
    }

    impl FakeBundler {
        fn new() -> Self {
            Self {
                fail_send: false,
                sends: Mutex::new(Vec::new()),
            }
        }

        fn rejecting() -> Self {
            Self {
                fail_send: true,
                sends: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BundlerApi for FakeBundler {
        async fn estimate_user_operation_gas(
            &self,
            _op: &UserOperation,
            _entry_point: Address,
        ) -> AnyResult<GasEstimates> {
            Ok(GasEstimates {
                call_gas_limit: U256::from(90_000),
                verification_gas_limit: U256::from(120_000),
                pre_verification_gas: U256::from(48_000),
            })
        }

        async fn send_user_operation(
            &self,
            op: &UserOperation,
            entry_point: Address,
        ) -> AnyResult<H256> {
            if self.fail_send {
                anyhow::bail!("simulation failed: AA21 didn't pay prefund");
            }
            self.sends.lock().unwrap().push(op.clone());
            Ok(op.operation_hash(entry_point, 84532))
        }

        async fn get_user_operation_receipt(
            &self,
            user_op_hash: H256,
        ) -> AnyResult<Option<UserOpReceipt>> {
            Ok(Some(UserOpReceipt {
                user_op_hash,
                success: true,
                actual_gas_cost: U256::from(1),
                actual_gas_used: U256::from(1),
                transaction_hash: None,
                block_number: None,
                raw: serde_json::Value::Null,
            }))
        }
    }

    struct FakePaymaster {
        quotes: Vec<FeeQuote>,
        spender: Option<Address>,
        sponsorship: Option<SponsorshipData>,
        sponsor_requests: Mutex<Vec<Option<Address>>>,
    }

    impl FakePaymaster {
        fn sponsoring(data: SponsorshipData) -> Self {
            Self {
                quotes: Vec::new(),
                spender: None,
                sponsorship: Some(data),
                sponsor_requests: Mutex::new(Vec::new()),
            }
        }

        fn with_quotes(quotes: Vec<FeeQuote>, spender: Address, data: SponsorshipData) -> Self {
            Self {
                quotes,
                spender: Some(spender),
                sponsorship: Some(data),
                sponsor_requests: Mutex::new(Vec::new()),
            }
        }

        fn declining() -> Self {
            Self {
                quotes: Vec::new(),
                spender: None,
                sponsorship: None,
                sponsor_requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PaymasterApi for FakePaymaster {
        async fn fee_quotes(
            &self,
            _op: &UserOperation,
            _token_list: &[Address],
            _preferred_token: Option<Address>,
        ) -> AnyResult<QuoteResponse> {
            Ok(QuoteResponse {
                quotes: self.quotes.clone(),
                spender: self.spender,
            })
        }

        async fn sponsor(
            &self,
            _op: &UserOperation,
            fee_token: Option<Address>,
            _calculate_gas_limits: bool,
        ) -> AnyResult<SponsorshipData> {
            self.sponsor_requests.lock().unwrap().push(fee_token);
            self.sponsorship
                .clone()
                .ok_or_else(|| anyhow::anyhow!("policy declined sponsorship"))
        }
    }

    fn stack(
        provider: Provider<MockProvider>,
        bundler: Arc<FakeBundler>,
        paymaster: Arc<FakePaymaster>,
    ) -> Stack<Provider<MockProvider>> {
        Stack {
            client: Arc::new(provider),
            bundler,
            paymaster,
            wallet: LocalWallet::from_str(OWNER_KEY).unwrap(),
            entry_point: Address::from_str("0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789").unwrap(),
            account: Address::from_str("0x9999999999999999999999999999999999999999").unwrap(),
            chain_id: 84532,
            gas_multiplier_bps: 10_000,
            approval_policy: ApprovalPolicy::Exact,
            token_list: Vec::new(),
            preferred_token: None,
        }
    }

    /// MockProvider is a LIFO stack; push responses in reverse request
    /// order. A transfer run reads decimals(), then getNonce, then gasPrice.
    fn push_chain_reads(mock: &MockProvider) {
        mock.push(U256::from(2_000_000_000u64)).unwrap(); // eth_gasPrice
        mock.push::<String, _>(WORD_ZERO.to_string()).unwrap(); // getNonce -> 0
        mock.push::<String, _>(WORD_SIX.to_string()).unwrap(); // decimals -> 6
    }

    fn sponsorship_with_limits() -> SponsorshipData {
        SponsorshipData {
            paymaster_and_data: Bytes::from(vec![0xaa; 52]),
            call_gas_limit: Some(U256::from(111_111)),
            verification_gas_limit: Some(U256::from(222_222)),
            pre_verification_gas: Some(U256::from(55_555)),
        }
    }

    fn dai_quote() -> FeeQuote {
        FeeQuote {
            token_address: Address::from_str(DAI).unwrap(),
            symbol: "DAI".to_string(),
            decimals: 18,
            max_gas_fee: U256::from(500_000_000_000_000_000u64),
            exchange_rate: U256::from(1_000_000_000_000_000_000u64),
            premium_percentage: None,
            valid_until: None,
        }
    }

    fn opts(mode: FeeMode) -> PrepareOptions {
        PrepareOptions {
            mode,
            init_code: Bytes::default(),
            force_estimate: false,
            allow_unsponsored: false,
        }
    }

    async fn encode_usdc_transfer(
        stack: &Stack<Provider<MockProvider>>,
        to: Address,
    ) -> CallDescriptor {
        CallEncoder::new(stack.client.clone())
            .encode_transfer(Address::from_str(USDC).unwrap(), to, "10")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn sponsored_transfer_end_to_end() {
        let (provider, mock) = Provider::mocked();
        push_chain_reads(&mock);

        let bundler = Arc::new(FakeBundler::new());
        let paymaster = Arc::new(FakePaymaster::sponsoring(sponsorship_with_limits()));
        let stack = stack(provider, bundler.clone(), paymaster.clone());

        let recipient =
            Address::from_str("0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap();
        let transfer = encode_usdc_transfer(&stack, recipient).await;
        let (op, op_hash) = prepare(&stack, &[transfer], &CheapestQuote, &opts(FeeMode::Sponsored))
            .await
            .unwrap();

        // 10 USDC at 6 decimals, as a plain execute (no approval call).
        let exec = ExecuteCall::decode(op.call_data.as_ref()).unwrap();
        let inner = TransferCall::decode(exec.func.as_ref()).unwrap();
        assert_eq!(inner.to, recipient);
        assert_eq!(inner.amount, U256::from(10_000_000));

        // Countersignature present, with the paymaster's limits in force.
        assert!(!op.paymaster_and_data.is_empty());
        assert_eq!(op.call_gas_limit, U256::from(111_111));
        assert_eq!(op.verification_gas_limit, U256::from(222_222));
        assert_eq!(op.pre_verification_gas, U256::from(55_555));

        // Unconditional sponsorship names no fee token.
        assert_eq!(*paymaster.sponsor_requests.lock().unwrap(), vec![None]);

        // The signature recovers to the owner key.
        let sig = Signature::try_from(op.signature.as_ref()).unwrap();
        let recovered = sig
            .recover(ethers::types::RecoveryMessage::Hash(hash_message(op_hash)))
            .unwrap();
        assert_eq!(recovered, stack.wallet.address());

        // Submission goes through and the relay saw exactly this op.
        let handle = stack.submitter().submit(&op).await.unwrap();
        assert_eq!(bundler.sends.lock().unwrap().as_slice(), &[op]);
        assert_eq!(
            handle.user_op_hash,
            bundler.sends.lock().unwrap()[0].operation_hash(stack.entry_point, stack.chain_id)
        );
    }

    #[tokio::test]
    async fn token_fee_transfer_injects_exact_approval() {
        let (provider, mock) = Provider::mocked();
        push_chain_reads(&mock);

        let bundler = Arc::new(FakeBundler::new());
        let spender = Address::from_str("0x00000f79b7faf42eebadba19acc07cd08af44789").unwrap();
        let paymaster = Arc::new(FakePaymaster::with_quotes(
            vec![dai_quote()],
            spender,
            sponsorship_with_limits(),
        ));
        let stack = stack(provider, bundler, paymaster.clone());

        let recipient = Address::random();
        let transfer = encode_usdc_transfer(&stack, recipient).await;
        let transfer_data = transfer.data.clone();
        let (op, _) = prepare(&stack, &[transfer], &CheapestQuote, &opts(FeeMode::Erc20))
            .await
            .unwrap();

        // Approval for exactly the quoted DAI fee rides ahead of the
        // transfer.
        let batch = ExecuteBatchCall::decode(op.call_data.as_ref()).unwrap();
        assert_eq!(
            batch.dest,
            vec![Address::from_str(DAI).unwrap(), Address::from_str(USDC).unwrap()]
        );
        let approve = ApproveCall::decode(batch.func[0].as_ref()).unwrap();
        assert_eq!(approve.spender, spender);
        assert_eq!(approve.amount, U256::from(500_000_000_000_000_000u64));
        assert_eq!(batch.func[1], transfer_data);

        // The final sponsorship request named the chosen fee token.
        assert_eq!(
            *paymaster.sponsor_requests.lock().unwrap(),
            vec![Some(Address::from_str(DAI).unwrap())]
        );
        assert!(!op.paymaster_and_data.is_empty());
    }

    #[tokio::test]
    async fn empty_quote_set_fails_before_finalization() {
        let (provider, mock) = Provider::mocked();
        push_chain_reads(&mock);

        let bundler = Arc::new(FakeBundler::new());
        let paymaster = Arc::new(FakePaymaster::with_quotes(
            Vec::new(),
            Address::random(),
            sponsorship_with_limits(),
        ));
        let stack = stack(provider, bundler.clone(), paymaster.clone());

        let transfer = encode_usdc_transfer(&stack, Address::random()).await;
        let err = prepare(&stack, &[transfer], &CheapestQuote, &opts(FeeMode::Erc20))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Negotiation(_)));
        // Never silently sponsored, never submitted.
        assert!(paymaster.sponsor_requests.lock().unwrap().is_empty());
        assert!(bundler.sends.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sponsored_decline_is_terminal_by_default() {
        let (provider, mock) = Provider::mocked();
        push_chain_reads(&mock);

        let stack = stack(
            provider,
            Arc::new(FakeBundler::new()),
            Arc::new(FakePaymaster::declining()),
        );
        let transfer = encode_usdc_transfer(&stack, Address::random()).await;
        let err = prepare(&stack, &[transfer], &CheapestQuote, &opts(FeeMode::Sponsored))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Sponsorship(_)));
    }

    #[tokio::test]
    async fn sponsored_decline_falls_back_to_native_when_allowed() {
        let (provider, mock) = Provider::mocked();
        push_chain_reads(&mock);

        let stack = stack(
            provider,
            Arc::new(FakeBundler::new()),
            Arc::new(FakePaymaster::declining()),
        );
        let transfer = encode_usdc_transfer(&stack, Address::random()).await;
        let mut options = opts(FeeMode::Sponsored);
        options.allow_unsponsored = true;

        let (op, _) = prepare(&stack, &[transfer], &CheapestQuote, &options)
            .await
            .unwrap();

        // Unsponsored, but with the bundler's estimates filled in.
        assert!(op.paymaster_and_data.is_empty());
        assert_eq!(op.call_gas_limit, U256::from(90_000));
        assert_eq!(op.verification_gas_limit, U256::from(120_000));
        assert_eq!(op.pre_verification_gas, U256::from(48_000));
    }

    #[tokio::test]
    async fn rejected_submission_leaves_the_nonce_reusable() {
        let (provider, mock) = Provider::mocked();
        push_chain_reads(&mock);

        let bundler = Arc::new(FakeBundler::rejecting());
        let paymaster = Arc::new(FakePaymaster::sponsoring(sponsorship_with_limits()));
        let stack = stack(provider, bundler, paymaster);

        let transfer = encode_usdc_transfer(&stack, Address::random()).await;
        let (op, _) = prepare(
            &stack,
            std::slice::from_ref(&transfer),
            &CheapestQuote,
            &opts(FeeMode::Sponsored),
        )
        .await
        .unwrap();
        let first_nonce = op.nonce;

        let err = stack.submitter().submit(&op).await.unwrap_err();
        assert!(matches!(err, PipelineError::Submission(_)));

        // A fresh build for the same account reads the same on-chain nonce:
        // the rejected operation consumed nothing.
        mock.push(U256::from(2_000_000_000u64)).unwrap(); // eth_gasPrice
        mock.push::<String, _>(WORD_ZERO.to_string()).unwrap(); // getNonce -> still 0

        let rebuilt = stack
            .builder()
            .build(
                std::slice::from_ref(&transfer),
                Bytes::default(),
                FeeMode::Sponsored,
                false,
            )
            .await
            .unwrap();
        assert_eq!(rebuilt.nonce, first_nonce);
    }
}
