use crate::addresses::{FACTORY_V6, FACTORY_V6_SEPOLIA, SIMPLE_ACCOUNT_FACTORY};
use crate::chain::Chain;
use anyhow::{anyhow, Context, Result};
use ethers::abi::{AbiParser, Function, Token};
use ethers::types::{Address, Bytes, H256, U256};
use std::str::FromStr;

/// ABI flavour of an account factory. Chosen once per factory address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FactoryKind {
    /// `createAccountWithNonce(address,bytes32,bool)` / `getAddressWithNonce(address,bytes32)`.
    LegacyWithNonce,
    /// eth-infinitism `createAccount(address,uint256)` / `getAddress(address,uint256)`.
    SimpleAccount,
}

impl FromStr for FactoryKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "legacy" | "legacy-with-nonce" | "with-nonce" => Ok(Self::LegacyWithNonce),
            "simple" | "simple-account" => Ok(Self::SimpleAccount),
            other => Err(anyhow!(
                "unknown factory kind {other:?} (expected legacy or simple)"
            )),
        }
    }
}

impl FactoryKind {
    /// Recognizes the well-known factory deployments.
    pub fn for_address(factory: Address) -> Option<Self> {
        let is = |s: &str| Address::from_str(s).map(|a| a == factory).unwrap_or(false);
        if is(FACTORY_V6) || is(FACTORY_V6_SEPOLIA) {
            Some(Self::LegacyWithNonce)
        } else if is(SIMPLE_ACCOUNT_FACTORY) {
            Some(Self::SimpleAccount)
        } else {
            None
        }
    }

    fn create_fn(&self) -> Result<Function> {
        let sig = match self {
            Self::LegacyWithNonce => {
                "function createAccountWithNonce(address admin, bytes32 salt, bool initializeGuardian) returns (address)"
            }
            Self::SimpleAccount => {
                "function createAccount(address owner, uint256 salt) returns (address)"
            }
        };
        Ok(AbiParser::default().parse_function(sig)?)
    }

    fn address_fn(&self) -> Result<Function> {
        let sig = match self {
            Self::LegacyWithNonce => {
                "function getAddressWithNonce(address admin, bytes32 salt) view returns (address)"
            }
            Self::SimpleAccount => {
                "function getAddress(address owner, uint256 salt) view returns (address)"
            }
        };
        Ok(AbiParser::default().parse_function(sig)?)
    }

    fn salt_token(&self, salt: H256) -> Token {
        match self {
            Self::LegacyWithNonce => Token::FixedBytes(salt.as_bytes().to_vec()),
            Self::SimpleAccount => Token::Uint(U256::from_big_endian(salt.as_bytes())),
        }
    }
}

/// An account factory together with its ABI flavour.
#[derive(Clone, Copy, Debug)]
pub struct Factory {
    pub address: Address,
    pub kind: FactoryKind,
    /// Only meaningful for [`FactoryKind::LegacyWithNonce`].
    pub initialize_guardian: bool,
}

impl Factory {
    pub fn new(address: Address, kind: Option<FactoryKind>) -> Result<Self> {
        let kind = kind
            .or_else(|| FactoryKind::for_address(address))
            .ok_or_else(|| {
                anyhow!("unsupported factory {address:?}; pass --factory-kind legacy|simple")
            })?;
        Ok(Self {
            address,
            kind,
            initialize_guardian: false,
        })
    }

    pub fn create_calldata(&self, owner: Address, salt: H256) -> Result<Bytes> {
        let mut args = vec![Token::Address(owner), self.kind.salt_token(salt)];
        if self.kind == FactoryKind::LegacyWithNonce {
            args.push(Token::Bool(self.initialize_guardian));
        }
        let data = self
            .kind
            .create_fn()?
            .encode_input(&args)
            .context("failed to build factory calldata")?;
        Ok(Bytes::from(data))
    }

    /// `factory ++ calldata`, the v0.6 `initCode` for a first-time account.
    pub fn init_code(&self, owner: Address, salt: H256) -> Result<Bytes> {
        let calldata = self.create_calldata(owner, salt)?;
        let mut v = Vec::with_capacity(20 + calldata.len());
        v.extend_from_slice(self.address.as_bytes());
        v.extend_from_slice(calldata.as_ref());
        Ok(Bytes::from(v))
    }

    pub fn address_calldata(&self, owner: Address, salt: H256) -> Result<Bytes> {
        let data = self
            .kind
            .address_fn()?
            .encode_input(&[Token::Address(owner), self.kind.salt_token(salt)])?;
        Ok(Bytes::from(data))
    }

    /// Counterfactual account address as reported by the factory.
    pub async fn account_address<C: Chain + ?Sized>(
        &self,
        chain: &C,
        owner: Address,
        salt: H256,
    ) -> Result<Address> {
        let out = chain
            .call_view(self.address, self.address_calldata(owner, salt)?)
            .await
            .context("factory address lookup failed")?;
        let tokens = self.kind.address_fn()?.decode_output(out.as_ref())?;
        match tokens.as_slice() {
            [Token::Address(a)] => Ok(*a),
            other => Err(anyhow!("unexpected factory output {other:?}")),
        }
    }
}
