use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;

/// ERC-4337 UserOperation (EntryPoint v0.6 layout).
///
/// Note: EntryPoint v0.7 uses a *different* packed struct layout.
///
/// Lifecycle: built partial (empty `paymaster_and_data`, dummy signature),
/// finalized once sponsorship data is attached, submitted once signed and
/// sent. Never mutated after submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    /// ABI-encode the operation with byte fields hashed and the signature
    /// excluded, matching EntryPoint v0.6 `UserOperationLib.pack`.
    pub fn pack_without_signature(&self) -> Bytes {
        let encoded = encode(&[
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::FixedBytes(keccak256(&self.init_code.0).into()),
            Token::FixedBytes(keccak256(&self.call_data.0).into()),
            Token::Uint(self.call_gas_limit),
            Token::Uint(self.verification_gas_limit),
            Token::Uint(self.pre_verification_gas),
            Token::Uint(self.max_fee_per_gas),
            Token::Uint(self.max_priority_fee_per_gas),
            Token::FixedBytes(keccak256(&self.paymaster_and_data.0).into()),
        ]);
        Bytes::from(encoded)
    }

    /// Canonical v0.6 userOpHash: the packed-op hash bound to the EntryPoint
    /// address and chain id. This is what the owner key signs (EIP-191).
    pub fn operation_hash(&self, entry_point: Address, chain_id: u64) -> H256 {
        let op_hash: H256 = keccak256(&self.pack_without_signature().0).into();
        H256::from_slice(
            keccak256(encode(&[
                Token::FixedBytes(op_hash.as_bytes().to_vec()),
                Token::Address(entry_point),
                Token::Uint(U256::from(chain_id)),
            ]))
            .as_slice(),
        )
    }
}

/// One contract invocation to be executed by the smart account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallDescriptor {
    pub target: Address,
    pub data: Bytes,
    pub value: U256,
}

/// How the operation's gas gets paid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeeMode {
    /// Paymaster pays unconditionally.
    Sponsored,
    /// Paymaster pays, reimbursed in an ERC-20 chosen from its fee quotes.
    Erc20,
    /// The smart account pays from its own native balance.
    Native,
}

/// Approval-amount policy for the token-fee path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ApprovalPolicy {
    /// Approve exactly the selected quote's max fee.
    #[default]
    Exact,
    /// Approve U256::MAX. Explicit opt-in; leaves a standing allowance.
    Unbounded,
    /// Skip the approval call when the current on-chain allowance already
    /// covers the quote's max fee.
    Reuse,
}

/// One token the paymaster is willing to accept fees in.
#[derive(Clone, Debug)]
pub struct FeeQuote {
    pub token_address: Address,
    pub symbol: String,
    pub decimals: u8,
    /// Max gas fee in the token's smallest unit.
    pub max_gas_fee: U256,
    pub exchange_rate: U256,
    pub premium_percentage: Option<f64>,
    pub valid_until: Option<u64>,
}

/// Paymaster countersignature plus the gas limits it signed over.
///
/// When the gas fields are present they are authoritative: the signature in
/// `paymaster_and_data` is only valid for those exact limits, so the
/// finalizer overwrites the operation's own estimates with them.
#[derive(Clone, Debug, Default)]
pub struct SponsorshipData {
    pub paymaster_and_data: Bytes,
    pub call_gas_limit: Option<U256>,
    pub verification_gas_limit: Option<U256>,
    pub pre_verification_gas: Option<U256>,
}

/// Parsed `eth_getUserOperationReceipt` result. The bundler's raw JSON is
/// kept alongside the typed fields for display.
#[derive(Clone, Debug)]
pub struct UserOpReceipt {
    pub user_op_hash: H256,
    pub success: bool,
    pub actual_gas_cost: U256,
    pub actual_gas_used: U256,
    pub transaction_hash: Option<H256>,
    pub block_number: Option<u64>,
    pub raw: serde_json::Value,
}
