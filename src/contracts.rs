use ethers::contract::abigen;

// Minimal ERC20 ABI: metadata reads for the call encoder, allowance for the
// reuse-approval policy, transfer/approve for call-data construction.
abigen!(
    Erc20,
    r#"[
        function decimals() view returns (uint8)
        function symbol() view returns (string)
        function balanceOf(address owner) view returns (uint256)
        function allowance(address owner, address spender) view returns (uint256)
        function transfer(address to, uint256 amount) returns (bool)
        function approve(address spender, uint256 amount) returns (bool)
    ]"#
);

// SimpleAccount-style execution surface. executeBatch carries no per-call
// value, which is why the builder rejects batches with a nonzero value.
abigen!(
    SmartAccount,
    r#"[
        function execute(address dest, uint256 value, bytes func)
        function executeBatch(address[] dest, bytes[] func)
    ]"#
);

// EntryPoint v0.6: only the nonce read; the userOpHash is computed locally.
abigen!(
    EntryPoint,
    r#"[
        function getNonce(address sender, uint192 key) view returns (uint256)
    ]"#
);
