use crate::encoding::{fmt_address, fmt_h256, pad_salt, parse_u256_dec_or_hex};
use crate::error::DeployError;
use anyhow::{anyhow, Context, Result};
use ethers::types::{Address, H256, U256};
use serde::Deserialize;
use std::{env, fs, path::Path};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfigRaw {
    pub id: u64,
    pub name: String,
    pub rpc: String,
    #[serde(default)]
    pub rpc_env_var: Option<String>,
    #[serde(default)]
    pub explorer: Option<String>,
    #[serde(default)]
    pub explorer_api_key: Option<String>,
    #[serde(default)]
    pub bundler: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub id: u64,
    pub name: String,
    pub rpc_url: String,
    pub explorer: Option<String>,
    /// Carried for source verification, which this tool leaves to external scripts.
    #[allow(dead_code)]
    pub explorer_api_key: Option<String>,
    pub bundler: Option<String>,
}

impl ChainConfig {
    fn from_raw(raw: ChainConfigRaw) -> Self {
        // rpcEnvVar lets a private endpoint override the public one without editing the table.
        let rpc_url = match raw.rpc_env_var.as_deref() {
            Some(var) => env::var(var).unwrap_or(raw.rpc),
            None => raw.rpc,
        };
        Self {
            id: raw.id,
            name: raw.name,
            rpc_url,
            explorer: raw.explorer.map(|e| e.trim_end_matches('/').to_string()),
            explorer_api_key: raw.explorer_api_key,
            bundler: raw.bundler,
        }
    }

    /// Explicit bundler URL, else Pimlico's public endpoint for this chain.
    pub fn bundler_url(&self, pimlico_api_key: Option<&str>) -> Result<String> {
        if let Some(url) = &self.bundler {
            return Ok(url.clone());
        }
        let key = pimlico_api_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| DeployError::MissingEnv("PIMLICO_API".into()))?;
        Ok(format!(
            "https://api.pimlico.io/v2/{}/rpc?apikey={key}",
            self.id
        ))
    }

    pub fn explorer_tx_url(&self, tx: H256) -> Option<String> {
        self.explorer
            .as_ref()
            .map(|base| format!("{base}/tx/{}", fmt_h256(tx)))
    }

    pub fn explorer_address_url(&self, address: Address) -> Option<String> {
        self.explorer
            .as_ref()
            .map(|base| format!("{base}/address/{}", fmt_address(address)))
    }
}

pub fn load_chains(path: &Path) -> Result<Vec<ChainConfig>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read chain table at {}", path.display()))?;
    parse_chains(&raw).with_context(|| format!("failed to parse chain table at {}", path.display()))
}

fn parse_chains(raw: &str) -> Result<Vec<ChainConfig>> {
    let raw: Vec<ChainConfigRaw> = serde_json::from_str(raw)?;
    Ok(raw.into_iter().map(ChainConfig::from_raw).collect())
}

/// Looks a `--chain` flag up by name (case-insensitive) or numeric id.
pub fn find_chain<'a>(chains: &'a [ChainConfig], flag: &str) -> Result<&'a ChainConfig> {
    let flag = flag.trim();
    let by_id = flag.parse::<u64>().ok();
    chains
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(flag) || Some(c.id) == by_id)
        .ok_or_else(|| DeployError::UnknownChain(flag.to_string()).into())
}

/// Resolves every flag before anything touches the network.
pub fn select_chains<'a>(chains: &'a [ChainConfig], flags: &[String]) -> Result<Vec<&'a ChainConfig>> {
    flags.iter().map(|f| find_chain(chains, f)).collect()
}

pub fn env_required(key: &str) -> Result<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(DeployError::MissingEnv(key.to_string()).into()),
    }
}

pub fn env_u256(key: &str) -> Result<U256> {
    let v = env_required(key)?;
    parse_u256_dec_or_hex(&v).with_context(|| format!("{key} is not an integer"))
}

pub fn env_salt(key: &str) -> Result<H256> {
    let v = env_required(key)?;
    pad_salt(&v).with_context(|| format!("{key} is not a 32-byte hex salt"))
}

pub fn parse_addr(s: &str) -> Result<Address> {
    s.trim().parse::<Address>().map_err(|e| anyhow!("invalid address {s:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"[
        {
            "id": 11155111,
            "name": "sepolia",
            "rpc": "https://rpc.sepolia.org",
            "explorer": "https://sepolia.etherscan.io/"
        },
        {
            "id": 84532,
            "name": "base-sepolia",
            "rpc": "https://sepolia.base.org",
            "rpcEnvVar": "FREEGAS_TEST_UNSET_RPC_VAR",
            "bundler": "http://localhost:4337"
        }
    ]"#;

    #[test]
    fn chains_found_by_name_or_id() {
        let chains = parse_chains(TABLE).unwrap();
        assert_eq!(find_chain(&chains, "Sepolia").unwrap().id, 11155111);
        assert_eq!(find_chain(&chains, "84532").unwrap().name, "base-sepolia");

        let err = find_chain(&chains, "mainnet").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeployError>(),
            Some(DeployError::UnknownChain(c)) if c == "mainnet"
        ));
        assert!(select_chains(&chains, &["sepolia".into(), "nope".into()]).is_err());
    }

    #[test]
    fn rpc_falls_back_when_env_var_unset() {
        let chains = parse_chains(TABLE).unwrap();
        assert_eq!(chains[1].rpc_url, "https://sepolia.base.org");
    }

    #[test]
    fn bundler_url_prefers_table_then_pimlico() {
        let chains = parse_chains(TABLE).unwrap();
        assert_eq!(chains[1].bundler_url(None).unwrap(), "http://localhost:4337");
        assert_eq!(
            chains[0].bundler_url(Some("k")).unwrap(),
            "https://api.pimlico.io/v2/11155111/rpc?apikey=k"
        );
        assert!(chains[0].bundler_url(None).is_err());
        assert!(chains[0].bundler_url(Some("")).is_err());
    }

    #[test]
    fn explorer_links() {
        let chains = parse_chains(TABLE).unwrap();
        let url = chains[0].explorer_tx_url(H256::zero()).unwrap();
        assert!(url.starts_with("https://sepolia.etherscan.io/tx/0x"));
        assert!(chains[1].explorer_tx_url(H256::zero()).is_none());
    }

    #[test]
    fn missing_env_is_typed() {
        let err = env_u256("FREEGAS_TEST_SURELY_UNSET").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeployError>(),
            Some(DeployError::MissingEnv(k)) if k == "FREEGAS_TEST_SURELY_UNSET"
        ));
        assert!(env_salt("FREEGAS_TEST_SURELY_UNSET").is_err());
    }
}
