use crate::error::DeployError;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use std::path::PathBuf;
use std::str::FromStr;
use tokio::sync::OnceCell;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyRole {
    /// Owns the smart account and signs the userOp hash.
    Owner,
    /// Signs paymaster commitments.
    Paymaster,
}

impl KeyRole {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Paymaster => "paymaster",
        }
    }

    fn env_prefix(&self) -> &'static str {
        match self {
            Self::Owner => "FREEGAS_OWNER",
            Self::Paymaster => "FREEGAS_PAYMASTER",
        }
    }
}

/// Source of signing keys. Called at most once per role per [`Session`].
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn unlock(&self, role: KeyRole) -> Result<LocalWallet>;
}

/// Raw hex keys from `FREEGAS_OWNER_PRIVATE_KEY` / `FREEGAS_PAYMASTER_PRIVATE_KEY`.
#[derive(Debug, Default)]
pub struct EnvSecretProvider;

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn unlock(&self, role: KeyRole) -> Result<LocalWallet> {
        let key = format!("{}_PRIVATE_KEY", role.env_prefix());
        let pk = std::env::var(&key).map_err(|_| DeployError::MissingEnv(key.clone()))?;
        LocalWallet::from_str(pk.trim())
            .with_context(|| format!("invalid {} private key in {key}", role.label()))
    }
}

/// Encrypted JSON keystores. The password comes from `FREEGAS_<ROLE>_PASSWORD`
/// or, failing that, a terminal prompt with echo disabled.
#[derive(Debug)]
pub struct KeystoreSecretProvider {
    pub owner: PathBuf,
    pub paymaster: PathBuf,
}

impl KeystoreSecretProvider {
    fn path(&self, role: KeyRole) -> &PathBuf {
        match role {
            KeyRole::Owner => &self.owner,
            KeyRole::Paymaster => &self.paymaster,
        }
    }

    async fn password(&self, role: KeyRole) -> Result<String> {
        if let Some(pw) = env_password(role) {
            return Ok(pw);
        }

        let prompt = format!("Password for {} keystore: ", role.label());
        tokio::task::spawn_blocking(move || rpassword::prompt_password(prompt))
            .await
            .context("password prompt task failed")?
            .context("failed to read password from terminal")
    }
}

fn env_password(role: KeyRole) -> Option<String> {
    std::env::var(format!("{}_PASSWORD", role.env_prefix())).ok()
}

#[async_trait]
impl SecretProvider for KeystoreSecretProvider {
    async fn unlock(&self, role: KeyRole) -> Result<LocalWallet> {
        let path = self.path(role);
        if !path.is_file() {
            return Err(anyhow!(
                "{} keystore not found at {}",
                role.label(),
                path.display()
            ));
        }
        let password = self.password(role).await?;
        LocalWallet::decrypt_keystore(path, password)
            .with_context(|| format!("failed to decrypt {}", path.display()))
    }
}

/// Signing keys for one invocation. Each key is unlocked on first use and
/// reused for every chain after that.
pub struct Session {
    provider: Box<dyn SecretProvider>,
    owner: OnceCell<LocalWallet>,
    paymaster: OnceCell<LocalWallet>,
}

impl Session {
    pub fn new(provider: Box<dyn SecretProvider>) -> Self {
        Self {
            provider,
            owner: OnceCell::new(),
            paymaster: OnceCell::new(),
        }
    }

    pub async fn owner(&self, chain_id: u64) -> Result<LocalWallet> {
        self.wallet(KeyRole::Owner, chain_id).await
    }

    pub async fn paymaster(&self, chain_id: u64) -> Result<LocalWallet> {
        self.wallet(KeyRole::Paymaster, chain_id).await
    }

    /// Owner and paymaster keys, both unlocked before any chain is contacted.
    pub async fn unlock_both(&self, chain_id: u64) -> Result<(LocalWallet, LocalWallet)> {
        let owner = self.owner(chain_id).await?;
        let paymaster = self.paymaster(chain_id).await?;
        Ok((owner, paymaster))
    }

    async fn wallet(&self, role: KeyRole, chain_id: u64) -> Result<LocalWallet> {
        let cell = match role {
            KeyRole::Owner => &self.owner,
            KeyRole::Paymaster => &self.paymaster,
        };
        let wallet = cell
            .get_or_try_init(|| async {
                let w = self.provider.unlock(role).await?;
                tracing::info!(role = role.label(), address = ?w.address(), "key unlocked");
                Ok::<_, anyhow::Error>(w)
            })
            .await?;
        Ok(wallet.clone().with_chain_id(chain_id))
    }
}
