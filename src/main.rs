mod builder;
mod bundler;
mod config;
mod contracts;
mod encoding;
mod erc20;
mod error;
mod finalizer;
mod negotiation;
mod paymaster;
mod pipeline;
mod submitter;
mod types;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bundler::HttpBundler;
use clap::{Args, Parser, Subcommand};
use config::{load_config, Config, ConfigOverrides};
use erc20::CallEncoder;
use error::PipelineError;
use ethers::prelude::*;
use ethers::providers::Middleware;
use negotiation::{CheapestQuote, FixedChoice, QuoteChooser};
use paymaster::HttpPaymaster;
use pipeline::{PrepareOptions, Stack};
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use types::{ApprovalPolicy, CallDescriptor, FeeMode, FeeQuote};

#[derive(Parser, Debug)]
#[command(name = "userop-courier", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send an ERC-20 transfer through the smart account.
    Transfer(TransferArgs),

    /// Send an arbitrary contract call through the smart account.
    Call(CallArgs),

    /// Fetch and print the paymaster's ERC-20 fee quotes for a transfer,
    /// without finalizing or submitting anything.
    Quotes(QuotesArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Config file (chain, account, bundler/paymaster URLs).
    #[arg(long, default_value = "courier.json")]
    config: PathBuf,

    /// Override the chain RPC URL (otherwise from config or its rpcEnvVar).
    #[arg(long, env = "COURIER_RPC_URL")]
    rpc: Option<String>,

    /// Bundler RPC URL (must support ERC-4337 JSON-RPC methods).
    #[arg(long, env = "COURIER_BUNDLER_URL")]
    bundler: Option<String>,

    /// Paymaster RPC URL.
    #[arg(long, env = "COURIER_PAYMASTER_URL")]
    paymaster: Option<String>,

    /// EntryPoint address (defaults to the canonical v0.6 deployment).
    #[arg(long, env = "COURIER_ENTRY_POINT")]
    entry_point: Option<String>,

    /// Smart account address.
    #[arg(long, env = "COURIER_ACCOUNT")]
    account: Option<String>,

    /// Opaque initCode for a not-yet-deployed account. This tool never
    /// computes it.
    #[arg(long)]
    init_code: Option<String>,

    /// Gas price multiplier in basis points (e.g. 15000 = 1.5x).
    #[arg(long, default_value_t = 10_000, env = "COURIER_GAS_MULTIPLIER_BPS")]
    gas_multiplier_bps: u64,
}

#[derive(Args, Debug)]
struct SendArgs {
    /// How gas gets paid: sponsored, erc20, or native.
    #[arg(long, value_parser = parse_mode, default_value = "sponsored")]
    mode: FeeMode,

    /// Fee-quote choice in erc20 mode: cheapest, prompt, or a 0-based index.
    #[arg(long, value_parser = parse_choose, default_value = "cheapest")]
    choose: ChooseArg,

    /// Only quote this fee token.
    #[arg(long, env = "COURIER_PREFERRED_TOKEN")]
    preferred_token: Option<String>,

    /// Fee-token approval policy: exact, unbounded, or reuse.
    #[arg(long, value_parser = parse_approval, default_value = "exact")]
    approval: ApprovalPolicy,

    /// Sponsored mode only: if the paymaster declines, continue native-paid
    /// instead of failing. The account must hold native balance for gas.
    #[arg(long)]
    allow_unsponsored: bool,

    /// Run bundler gas estimation even when the paymaster would
    /// recalculate the limits anyway.
    #[arg(long)]
    estimate: bool,

    /// Build, negotiate, finalize, and sign, then print the operation
    /// without sending it.
    #[arg(long)]
    dry_run: bool,

    /// Do not wait for the userOp receipt.
    #[arg(long)]
    no_wait: bool,

    /// Max seconds to wait for the receipt. Use 0 to disable the timeout.
    #[arg(long, default_value_t = 180)]
    max_wait_seconds: u64,
}

#[derive(Args, Debug)]
struct TransferArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    send: SendArgs,

    /// ERC-20 token contract address.
    #[arg(long)]
    token: String,

    /// Recipient address.
    #[arg(long)]
    to: String,

    /// Human-readable amount (e.g. "10" or "0.1"); scaled by the token's
    /// own decimals.
    #[arg(long)]
    amount: String,
}

#[derive(Args, Debug)]
struct CallArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    send: SendArgs,

    /// Target contract address.
    #[arg(long)]
    target: String,

    /// Hex call data.
    #[arg(long)]
    data: String,

    /// Native value in wei (decimal).
    #[arg(long, default_value = "0")]
    value: String,
}

#[derive(Args, Debug)]
struct QuotesArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// ERC-20 token contract address of the intended transfer.
    #[arg(long)]
    token: String,

    /// Recipient address of the intended transfer.
    #[arg(long)]
    to: String,

    /// Human-readable transfer amount.
    #[arg(long)]
    amount: String,

    /// Only quote this fee token.
    #[arg(long, env = "COURIER_PREFERRED_TOKEN")]
    preferred_token: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum ChooseArg {
    Cheapest,
    Prompt,
    Index(usize),
}

fn parse_mode(s: &str) -> Result<FeeMode, String> {
    match s {
        "sponsored" => Ok(FeeMode::Sponsored),
        "erc20" => Ok(FeeMode::Erc20),
        "native" => Ok(FeeMode::Native),
        other => Err(format!(
            "expected 'sponsored', 'erc20', or 'native', got {other:?}"
        )),
    }
}

fn parse_choose(s: &str) -> Result<ChooseArg, String> {
    match s {
        "cheapest" => Ok(ChooseArg::Cheapest),
        "prompt" => Ok(ChooseArg::Prompt),
        other => other.parse::<usize>().map(ChooseArg::Index).map_err(|_| {
            format!("expected 'cheapest', 'prompt', or a 0-based quote index, got {other:?}")
        }),
    }
}

fn parse_approval(s: &str) -> Result<ApprovalPolicy, String> {
    match s {
        "exact" => Ok(ApprovalPolicy::Exact),
        "unbounded" => Ok(ApprovalPolicy::Unbounded),
        "reuse" => Ok(ApprovalPolicy::Reuse),
        other => Err(format!(
            "expected 'exact', 'unbounded', or 'reuse', got {other:?}"
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // Logs go to stderr so stdout stays script-friendly.
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Transfer(args) => cmd_transfer(args).await,
        Command::Call(args) => cmd_call(args).await,
        Command::Quotes(args) => cmd_quotes(args).await,
    }
}

async fn cmd_transfer(args: TransferArgs) -> Result<()> {
    let stack = build_stack(
        &args.common,
        args.send.preferred_token.clone(),
        args.send.approval,
        paymaster_needed(args.send.mode),
    )
    .await?;

    let token = Address::from_str(&args.token).context("invalid --token address")?;
    let to = Address::from_str(&args.to).context("invalid --to address")?;
    let call = CallEncoder::new(stack.client.clone())
        .encode_transfer(token, to, &args.amount)
        .await?;

    send_through_pipeline(&stack, vec![call], &args.common, &args.send).await
}

async fn cmd_call(args: CallArgs) -> Result<()> {
    let stack = build_stack(
        &args.common,
        args.send.preferred_token.clone(),
        args.send.approval,
        paymaster_needed(args.send.mode),
    )
    .await?;

    let call = CallDescriptor {
        target: Address::from_str(&args.target).context("invalid --target address")?,
        data: encoding::parse_bytes(&args.data).context("invalid --data hex")?,
        value: U256::from_dec_str(&args.value).context("invalid --value (expected wei)")?,
    };

    send_through_pipeline(&stack, vec![call], &args.common, &args.send).await
}

async fn cmd_quotes(args: QuotesArgs) -> Result<()> {
    let stack = build_stack(
        &args.common,
        args.preferred_token.clone(),
        ApprovalPolicy::Exact,
        true,
    )
    .await?;

    let token = Address::from_str(&args.token).context("invalid --token address")?;
    let to = Address::from_str(&args.to).context("invalid --to address")?;
    let call = CallEncoder::new(stack.client.clone())
        .encode_transfer(token, to, &args.amount)
        .await?;

    let init_code = parse_init_code(&args.common)?;
    let res = pipeline::quote_only(&stack, &[call], init_code).await?;

    if res.quotes.is_empty() {
        println!("no fee quotes offered");
        return Ok(());
    }
    if let Some(spender) = res.spender {
        println!("spender: {}", encoding::fmt_address(spender));
    }
    for (i, q) in res.quotes.iter().enumerate() {
        print_quote_line(i, q);
    }
    Ok(())
}

fn print_quote_line(index: usize, q: &FeeQuote) {
    let mut line = format!(
        "[{index}] {}  maxGasFee={} ({} decimals)  token={}",
        q.symbol,
        q.max_gas_fee,
        q.decimals,
        encoding::fmt_address(q.token_address),
    );
    if let Some(p) = q.premium_percentage {
        line.push_str(&format!("  premium={p}%"));
    }
    println!("{line}");
}

fn paymaster_needed(mode: FeeMode) -> bool {
    !matches!(mode, FeeMode::Native)
}

async fn build_stack(
    common: &CommonArgs,
    preferred_token: Option<String>,
    approval_policy: ApprovalPolicy,
    paymaster_required: bool,
) -> Result<Stack<Provider<Http>>> {
    let overrides = ConfigOverrides {
        rpc: common.rpc.clone(),
        bundler: common.bundler.clone(),
        paymaster: common.paymaster.clone(),
        entry_point: common.entry_point.clone(),
        account: common.account.clone(),
        preferred_token,
    };
    let cfg: Config = load_config(&common.config, &overrides)?;

    if paymaster_required && cfg.paymaster_url.is_none() {
        return Err(anyhow!(
            "this mode needs a paymaster; set `paymasterUrl` in {} or pass --paymaster",
            common.config.display()
        ));
    }

    let provider =
        Provider::<Http>::try_from(cfg.rpc_url.as_str())?.interval(Duration::from_millis(350));

    // Hard safety check: refuse to build operations against the wrong chain.
    let chain_id = provider.get_chainid().await?.as_u64();
    if chain_id != cfg.chain_id {
        return Err(anyhow!(
            "chainId mismatch: config has {}, RPC returned {}",
            cfg.chain_id,
            chain_id
        ));
    }

    let owner_key = std::env::var(&cfg.owner_key_env_var)
        .map_err(|_| anyhow!("missing owner key env var {}", cfg.owner_key_env_var))?;
    let wallet = LocalWallet::from_str(&owner_key)
        .context("invalid owner private key")?
        .with_chain_id(chain_id);

    let bundler = Arc::new(HttpBundler::new(cfg.bundler_url.clone()));
    let paymaster = Arc::new(HttpPaymaster::new(
        cfg.paymaster_url.clone().unwrap_or_default(),
    ));

    Ok(Stack {
        client: Arc::new(provider),
        bundler,
        paymaster,
        wallet,
        entry_point: cfg.entry_point,
        account: cfg.account,
        chain_id,
        gas_multiplier_bps: common.gas_multiplier_bps,
        approval_policy,
        token_list: cfg.token_list,
        preferred_token: cfg.preferred_token,
    })
}

fn parse_init_code(common: &CommonArgs) -> Result<Bytes> {
    match common.init_code.as_deref() {
        Some(s) => encoding::parse_bytes(s).context("invalid --init-code hex"),
        None => Ok(Bytes::default()),
    }
}

async fn send_through_pipeline(
    stack: &Stack<Provider<Http>>,
    calls: Vec<CallDescriptor>,
    common: &CommonArgs,
    send: &SendArgs,
) -> Result<()> {
    let chooser: Box<dyn QuoteChooser> = match send.choose {
        ChooseArg::Cheapest => Box::new(CheapestQuote),
        ChooseArg::Prompt => Box::new(PromptChooser),
        ChooseArg::Index(i) => Box::new(FixedChoice(i)),
    };

    let opts = PrepareOptions {
        mode: send.mode,
        init_code: parse_init_code(common)?,
        force_estimate: send.estimate,
        allow_unsponsored: send.allow_unsponsored,
    };

    let (op, op_hash) = pipeline::prepare(stack, &calls, chooser.as_ref(), &opts).await?;
    tracing::info!(
        user_op_hash = %encoding::fmt_h256(op_hash),
        sender = %encoding::fmt_address(op.sender),
        nonce = %op.nonce,
        "user operation signed"
    );

    if send.dry_run {
        println!(
            "{}",
            serde_json::to_string_pretty(&encoding::user_op_to_json(&op))?
        );
        tracing::info!("--dry-run set: not sending user operation");
        return Ok(());
    }

    let handle = stack.submitter().submit(&op).await?;
    println!("userOpHash: {}", encoding::fmt_h256(handle.user_op_hash));

    if send.no_wait {
        tracing::info!("--no-wait set: not waiting for receipt");
        return Ok(());
    }

    let receipt = handle
        .await_receipt(Duration::from_secs(send.max_wait_seconds))
        .await?;
    tracing::info!(
        success = receipt.success,
        actual_gas_cost = %receipt.actual_gas_cost,
        actual_gas_used = %receipt.actual_gas_used,
        "user operation included"
    );
    if let Some(tx) = receipt.transaction_hash {
        println!("transactionHash: {}", encoding::fmt_h256(tx));
    }
    if !receipt.raw.is_null() {
        println!("{}", serde_json::to_string_pretty(&receipt.raw)?);
    }
    Ok(())
}

/// Human fee choice on the terminal. The prompt writes to stderr so stdout
/// stays clean for the final receipt output.
struct PromptChooser;

#[async_trait]
impl QuoteChooser for PromptChooser {
    async fn choose(&self, quotes: &[FeeQuote]) -> Result<usize, PipelineError> {
        for (i, q) in quotes.iter().enumerate() {
            eprintln!(
                "  [{}] {}  maxGasFee={} ({} decimals)",
                i + 1,
                q.symbol,
                q.max_gas_fee,
                q.decimals
            );
        }
        eprint!("select a fee quote [1-{}]: ", quotes.len());
        std::io::stderr().flush().ok();

        let mut line = String::new();
        std::io::stdin()
            .read_line(&mut line)
            .map_err(|e| PipelineError::Client(format!("failed to read fee choice: {e}")))?;
        let picked: usize = line
            .trim()
            .parse()
            .map_err(|_| PipelineError::Client(format!("not a quote number: {:?}", line.trim())))?;
        if picked == 0 {
            return Err(PipelineError::Client(
                "quote numbers start at 1".to_string(),
            ));
        }
        Ok(picked - 1)
    }
}
