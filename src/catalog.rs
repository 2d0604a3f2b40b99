use crate::chain::Chain;
use crate::config::env_required;
use crate::create2;
use crate::encoding::{fmt_address, has_code, pad_salt, parse_bytes, parse_u256_dec_or_hex};
use anyhow::{anyhow, Context, Result};
use ethers::abi::param_type::Reader;
use ethers::abi::token::{LenientTokenizer, Tokenizer};
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, H256};
use serde::Deserialize;
use std::{fs, path::Path};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractSpecRaw {
    pub name: String,
    /// Creation bytecode, `0x`-hex or `$env:NAME`.
    pub bytecode: String,
    /// Hex salt (left-padded to 32 bytes) or `$env:NAME`.
    pub salt: String,
    /// `type:value` pairs, e.g. `address:$owner` or `uint256:$env:RECOVERY_PERIOD`.
    #[serde(default)]
    pub constructor_args: Vec<String>,
}

/// Values the `$owner` / `$entryPoint` placeholders expand to.
#[derive(Clone, Copy, Debug)]
pub struct ArgContext {
    pub owner: Address,
    pub entry_point: Address,
}

/// A contract deployed through the CREATE2 proxy.
#[derive(Debug, Clone)]
pub struct ContractSpec {
    pub name: String,
    pub bytecode: Bytes,
    pub salt: H256,
    pub constructor_args: Vec<String>,
    /// Set by [`Catalog::resolve`].
    pub init_code: Option<Bytes>,
    pub address: Option<Address>,
    /// Set by [`Catalog::probe`].
    pub exists: Option<bool>,
}

impl ContractSpec {
    fn from_raw(raw: ContractSpecRaw) -> Result<Self> {
        let bytecode = match raw.bytecode.strip_prefix("$env:") {
            Some(key) => parse_bytes(&env_required(key)?),
            None => parse_bytes(&raw.bytecode),
        }
        .with_context(|| format!("{}: invalid bytecode", raw.name))?;
        if bytecode.is_empty() {
            return Err(anyhow!("{}: empty bytecode", raw.name));
        }
        let salt = match raw.salt.strip_prefix("$env:") {
            Some(key) => pad_salt(&env_required(key)?),
            None => pad_salt(&raw.salt),
        }
        .with_context(|| format!("{}: invalid salt", raw.name))?;

        Ok(Self {
            name: raw.name,
            bytecode,
            salt,
            constructor_args: raw.constructor_args,
            init_code: None,
            address: None,
            exists: None,
        })
    }

    pub fn encoded_args(&self, ctx: &ArgContext) -> Result<Vec<u8>> {
        let tokens = self
            .constructor_args
            .iter()
            .map(|arg| {
                tokenize_arg(arg, ctx).with_context(|| format!("{}: bad constructor arg {arg:?}", self.name))
            })
            .collect::<Result<Vec<Token>>>()?;
        Ok(abi::encode(&tokens))
    }

    /// Creation bytecode followed by the ABI-encoded constructor arguments.
    pub fn init_code(&self, ctx: &ArgContext) -> Result<Bytes> {
        let mut v = self.bytecode.to_vec();
        v.extend(self.encoded_args(ctx)?);
        Ok(Bytes::from(v))
    }

    pub fn is_missing(&self) -> bool {
        self.exists == Some(false)
    }
}

fn tokenize_arg(arg: &str, ctx: &ArgContext) -> Result<Token> {
    let (ty, value) = arg
        .split_once(':')
        .ok_or_else(|| anyhow!("expected type:value"))?;
    let kind = Reader::read(ty.trim()).map_err(|e| anyhow!("unknown type {ty:?}: {e}"))?;

    let elem = match &kind {
        ParamType::Array(inner) | ParamType::FixedArray(inner, _) => inner.as_ref(),
        k => k,
    };

    let value = value.trim();
    let value = match value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
        Some(inner) if !inner.trim().is_empty() => {
            let items = inner
                .split(',')
                .map(|item| expand(item.trim(), ctx).and_then(|v| normalize(elem, &v)))
                .collect::<Result<Vec<_>>>()?;
            format!("[{}]", items.join(","))
        }
        Some(_) => "[]".to_string(),
        None => normalize(elem, &expand(value, ctx)?)?,
    };

    LenientTokenizer::tokenize(&kind, &value).map_err(|e| anyhow!("cannot encode {value:?} as {kind}: {e}"))
}

/// Tokenizers take bare hex and decimal integers.
fn normalize(kind: &ParamType, value: &str) -> Result<String> {
    Ok(match kind {
        ParamType::Address | ParamType::Bytes | ParamType::FixedBytes(_) => {
            value.strip_prefix("0x").unwrap_or(value).to_string()
        }
        ParamType::Uint(_) => parse_u256_dec_or_hex(value)?.to_string(),
        _ => value.to_string(),
    })
}

fn expand(value: &str, ctx: &ArgContext) -> Result<String> {
    Ok(match value {
        "$owner" => fmt_address(ctx.owner),
        "$entryPoint" => fmt_address(ctx.entry_point),
        v => match v.strip_prefix("$env:") {
            Some(key) => env_required(key)?,
            None => v.to_string(),
        },
    })
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub contracts: Vec<ContractSpec>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read contract catalog at {}", path.display()))?;
        Self::parse(&raw)
            .with_context(|| format!("failed to parse contract catalog at {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let raw: Vec<ContractSpecRaw> = serde_json::from_str(raw)?;
        let contracts = raw
            .into_iter()
            .map(ContractSpec::from_raw)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { contracts })
    }

    /// Builds init code and the CREATE2 address for every entry. Chain-independent.
    pub fn resolve(&mut self, proxy: Address, ctx: &ArgContext) -> Result<()> {
        for c in &mut self.contracts {
            let init_code = c.init_code(ctx)?;
            c.address = Some(create2::resolve(proxy, &init_code, c.salt));
            c.init_code = Some(init_code);
        }
        Ok(())
    }

    /// Records whether each resolved address already carries code on `chain`.
    pub async fn probe<C: Chain + ?Sized>(&mut self, chain: &C) -> Result<()> {
        for c in &mut self.contracts {
            let address = c
                .address
                .ok_or_else(|| anyhow!("{}: address not resolved", c.name))?;
            let exists = has_code(&chain.code_at(address).await?);
            tracing::debug!(name = %c.name, address = %fmt_address(address), exists, "probed");
            c.exists = Some(exists);
        }
        Ok(())
    }

    pub fn missing(&self) -> impl Iterator<Item = &ContractSpec> {
        self.contracts.iter().filter(|c| c.is_missing())
    }
}
