use anyhow::{anyhow, Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::{env, fs, path::Path};

/// v0.6 EntryPoint, the default unless the config or a flag overrides it.
pub const DEFAULT_ENTRY_POINT: &str = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789";

const DEFAULT_OWNER_KEY_ENV: &str = "COURIER_OWNER_KEY";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigRaw {
    chain_id: u64,
    #[serde(default)]
    rpc: Option<String>,
    /// Name of an env var holding the RPC URL, so API keys stay out of
    /// committed config files.
    #[serde(default)]
    rpc_env_var: Option<String>,
    #[serde(default)]
    bundler_url: Option<String>,
    #[serde(default)]
    paymaster_url: Option<String>,
    #[serde(default)]
    entry_point: Option<String>,
    #[serde(default)]
    account: Option<String>,
    /// Env var the owner private key is read from. The key itself never
    /// appears in config or argv.
    #[serde(default)]
    owner_key_env_var: Option<String>,
    #[serde(default)]
    preferred_token: Option<String>,
    #[serde(default)]
    token_list: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub chain_id: u64,
    pub rpc_url: String,
    pub bundler_url: String,
    pub paymaster_url: Option<String>,
    pub entry_point: Address,
    pub account: Address,
    pub owner_key_env_var: String,
    pub preferred_token: Option<Address>,
    pub token_list: Vec<Address>,
}

/// CLI flag values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub rpc: Option<String>,
    pub bundler: Option<String>,
    pub paymaster: Option<String>,
    pub entry_point: Option<String>,
    pub account: Option<String>,
    pub preferred_token: Option<String>,
}

pub fn load_config(path: &Path, overrides: &ConfigOverrides) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    let raw: ConfigRaw = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config at {}", path.display()))?;
    resolve(raw, overrides)
}

fn resolve(raw: ConfigRaw, overrides: &ConfigOverrides) -> Result<Config> {
    let rpc_url = if let Some(rpc) = overrides.rpc.clone() {
        rpc
    } else if let Some(var) = raw.rpc_env_var.as_deref() {
        match env::var(var) {
            Ok(url) => url,
            Err(_) => raw
                .rpc
                .clone()
                .ok_or_else(|| anyhow!("rpcEnvVar {var} is unset and no rpc fallback given"))?,
        }
    } else {
        raw.rpc
            .clone()
            .ok_or_else(|| anyhow!("missing rpc url (config `rpc` or --rpc)"))?
    };

    let bundler_url = overrides
        .bundler
        .clone()
        .or(raw.bundler_url)
        .ok_or_else(|| anyhow!("missing bundler url (config `bundlerUrl` or --bundler)"))?;

    let paymaster_url = overrides.paymaster.clone().or(raw.paymaster_url);

    let entry_point = overrides
        .entry_point
        .clone()
        .or(raw.entry_point)
        .unwrap_or_else(|| DEFAULT_ENTRY_POINT.to_string());
    let entry_point = parse_addr(&entry_point).context("invalid entry point address")?;

    let account = overrides
        .account
        .clone()
        .or(raw.account)
        .ok_or_else(|| anyhow!("missing smart account address (config `account` or --account)"))?;
    let account = parse_addr(&account).context("invalid account address")?;

    let preferred_token = overrides
        .preferred_token
        .clone()
        .or(raw.preferred_token)
        .map(|s| parse_addr(&s).context("invalid preferred token address"))
        .transpose()?;

    let token_list = raw
        .token_list
        .iter()
        .map(|s| parse_addr(s).context("invalid tokenList entry"))
        .collect::<Result<Vec<_>>>()?;

    Ok(Config {
        chain_id: raw.chain_id,
        rpc_url,
        bundler_url,
        paymaster_url,
        entry_point,
        account,
        owner_key_env_var: raw
            .owner_key_env_var
            .unwrap_or_else(|| DEFAULT_OWNER_KEY_ENV.to_string()),
        preferred_token,
        token_list,
    })
}

fn parse_addr(s: &str) -> Result<Address> {
    s.parse::<Address>().map_err(|e| anyhow!("{e}"))
}
