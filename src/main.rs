mod addresses;
mod bundler;
mod catalog;
mod chain;
mod config;
mod create2;
mod deploy;
mod encoding;
mod error;
mod factory;
mod finalize;
mod paymaster;
mod session;
mod types;
mod userop;

use anyhow::{anyhow, Context, Result};
use bundler::{BundlerClient, UserOpReceipt};
use catalog::{ArgContext, Catalog};
use clap::{Args, Parser, Subcommand};
use chain::require_code;
use config::ChainConfig;
use deploy::PollPolicy;
use encoding::{fmt_address, fmt_h256};
use ethers::prelude::*;
use factory::{Factory, FactoryKind};
use finalize::{OpContext, Signers};
use paymaster::{PaymasterData, Sponsorship};
use session::{EnvSecretProvider, KeystoreSecretProvider, SecretProvider, Session};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use types::PaymasterStrategy;

#[derive(Parser, Debug)]
#[command(name = "freegas", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print predicted CREATE2 addresses, the smart account and what is already deployed.
    Address(AddressArgs),

    /// Deploy missing catalog contracts through the CREATE2 proxy, paid by the owner EOA.
    Deploy(DeployArgs),

    /// Deploy missing catalog contracts in one paymaster-sponsored UserOperation.
    Sponsor(SponsorArgs),

    /// Send a signed UserOperation saved from `sponsor --dry-run`.
    Submit(SubmitArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Target chain by name or id. Repeat to run several chains in order.
    #[arg(
        long = "chain",
        env = "FREEGAS_CHAINS",
        value_delimiter = ',',
        default_value = "sepolia"
    )]
    chains: Vec<String>,

    /// Chain table (id, name, rpc, rpcEnvVar, explorer, bundler).
    #[arg(long, env = "FREEGAS_CHAIN_TABLE", default_value = "config/chains.json")]
    chain_table: PathBuf,

    /// Contract catalog to deploy.
    #[arg(long, env = "FREEGAS_CATALOG", default_value = "config/contracts.json")]
    catalog: PathBuf,

    /// Deterministic deployment proxy.
    #[arg(long, env = "FREEGAS_PROXY", default_value = addresses::CREATE2_PROXY)]
    proxy: String,

    /// EntryPoint (v0.6) address.
    #[arg(long, env = "FREEGAS_ENTRYPOINT", default_value = addresses::ENTRYPOINT_V06)]
    entrypoint: String,

    /// Account factory. Defaults to the known v6 factory for the chain.
    #[arg(long, env = "FREEGAS_FACTORY")]
    factory: Option<String>,

    /// Factory ABI: `legacy` (createAccountWithNonce) or `simple` (createAccount).
    #[arg(long, env = "FREEGAS_FACTORY_KIND")]
    factory_kind: Option<String>,

    /// Legacy factories only: initialize the guardian module on account creation.
    #[arg(long, default_value_t = false)]
    initialize_guardian: bool,

    /// Smart account salt (hex, left-padded to 32 bytes).
    #[arg(long, env = "FREEGAS_ACCOUNT_SALT")]
    account_salt: Option<String>,

    /// Encrypted owner keystore. Without keystores, keys come from FREEGAS_*_PRIVATE_KEY.
    #[arg(long, env = "FREEGAS_OWNER_KEYSTORE", requires = "paymaster_keystore")]
    owner_keystore: Option<PathBuf>,

    /// Encrypted paymaster signer keystore.
    #[arg(long, env = "FREEGAS_PAYMASTER_KEYSTORE", requires = "owner_keystore")]
    paymaster_keystore: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct AddressArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Print a single JSON document to stdout instead of the table.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct DeployArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Bytecode reads after the proxy call before giving up.
    #[arg(long, default_value_t = 12)]
    poll_attempts: u32,

    /// Seconds between bytecode reads.
    #[arg(long, default_value_t = 5)]
    poll_interval_secs: u64,

    /// Max seconds to wait for each proxy transaction receipt.
    #[arg(long, default_value_t = 120)]
    receipt_timeout_secs: u64,
}

#[derive(Args, Debug)]
struct SponsorArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Verifying paymaster contract.
    #[arg(long, env = "FREEGAS_PAYMASTER", default_value = addresses::PAYMASTER)]
    paymaster: String,

    /// Pimlico API key, used for chains without an explicit bundler URL.
    #[arg(long, env = "PIMLICO_API", hide_env_values = true)]
    pimlico_api_key: Option<String>,

    /// Build, price and sign the UserOperation but do not send it.
    #[arg(long)]
    dry_run: bool,

    /// Max seconds to wait for the userOp receipt. Use 0 to disable timeout.
    #[arg(long, default_value_t = 180)]
    max_wait_seconds: u64,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// UserOperation JSON, as printed by `sponsor --dry-run`.
    #[arg(long)]
    op: PathBuf,

    /// Target chain by name or id.
    #[arg(long, default_value = "sepolia")]
    chain: String,

    #[arg(long, env = "FREEGAS_CHAIN_TABLE", default_value = "config/chains.json")]
    chain_table: PathBuf,

    #[arg(long, env = "FREEGAS_ENTRYPOINT", default_value = addresses::ENTRYPOINT_V06)]
    entrypoint: String,

    #[arg(long, env = "PIMLICO_API", hide_env_values = true)]
    pimlico_api_key: Option<String>,

    /// Max seconds to wait for the userOp receipt. Use 0 to disable timeout.
    #[arg(long, default_value_t = 180)]
    max_wait_seconds: u64,
}

/// Everything resolved from flags and files before the first network call.
struct Setup {
    chains: Vec<ChainConfig>,
    catalog: Catalog,
    proxy: Address,
    entry_point: Address,
    account_salt: H256,
    session: Session,
}

impl Setup {
    fn load(common: &CommonArgs) -> Result<Self> {
        let table = config::load_chains(&common.chain_table)?;
        let chains = config::select_chains(&table, &common.chains)?
            .into_iter()
            .cloned()
            .collect();
        let catalog = Catalog::load(&common.catalog)?;

        let proxy = config::parse_addr(&common.proxy).context("invalid --proxy address")?;
        let entry_point =
            config::parse_addr(&common.entrypoint).context("invalid --entrypoint address")?;

        let account_salt = match &common.account_salt {
            Some(s) => encoding::pad_salt(s).context("invalid --account-salt")?,
            None => config::env_salt("FREEGAS_ACCOUNT_SALT")?,
        };

        let provider: Box<dyn SecretProvider> =
            match (&common.owner_keystore, &common.paymaster_keystore) {
                (Some(owner), Some(paymaster)) => Box::new(KeystoreSecretProvider {
                    owner: owner.clone(),
                    paymaster: paymaster.clone(),
                }),
                _ => Box::new(EnvSecretProvider),
            };

        Ok(Self {
            chains,
            catalog,
            proxy,
            entry_point,
            account_salt,
            session: Session::new(provider),
        })
    }

    fn factory(&self, common: &CommonArgs, chain: &ChainConfig) -> Result<Factory> {
        let address = match &common.factory {
            Some(f) => config::parse_addr(f).context("invalid --factory address")?,
            None => config::parse_addr(addresses::default_factory(chain.id))?,
        };
        let kind = common
            .factory_kind
            .as_deref()
            .map(str::parse::<FactoryKind>)
            .transpose()?;
        let mut factory = Factory::new(address, kind)?;
        factory.initialize_guardian = common.initialize_guardian;
        Ok(factory)
    }

    /// Catalog with init code and addresses resolved for `owner`. Same on every chain.
    fn resolved_catalog(&self, owner: Address) -> Result<Catalog> {
        let mut catalog = self.catalog.clone();
        catalog.resolve(
            self.proxy,
            &ArgContext {
                owner,
                entry_point: self.entry_point,
            },
        )?;
        Ok(catalog)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // Always write logs to stderr so stdout can be used for script-friendly outputs.
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let res = match cli.cmd {
        Command::Address(args) => cmd_address(args).await,
        Command::Deploy(args) => cmd_deploy(args).await,
        Command::Sponsor(args) => cmd_sponsor(args).await,
        Command::Submit(args) => cmd_submit(args).await,
    };
    if let Err(e) = &res {
        tracing::error!("{e:#}");
    }
    res
}

async fn cmd_address(args: AddressArgs) -> Result<()> {
    let common = &args.common;
    let setup = Setup::load(common)?;
    let first = first_chain(&setup.chains)?;
    let owner = setup.session.owner(first.id).await?.address();
    let resolved = setup.resolved_catalog(owner)?;

    let mut report = Vec::new();
    for chain in &setup.chains {
        let provider = connect(chain).await?;
        let factory = setup.factory(common, chain)?;

        let mut catalog = resolved.clone();
        catalog.probe(&provider).await?;
        let plan = userop::plan_account(
            &provider,
            &factory,
            owner,
            setup.account_salt,
            setup.entry_point,
        )
        .await?;

        if args.json {
            report.push(serde_json::json!({
                "chainId": chain.id,
                "chain": chain.name,
                "owner": fmt_address(owner),
                "smartAccount": fmt_address(plan.sender),
                "smartAccountDeployed": plan.deployed,
                "contracts": catalog.contracts.iter().map(|c| serde_json::json!({
                    "name": c.name,
                    "address": c.address.map(fmt_address),
                    "exists": c.exists,
                })).collect::<Vec<_>>(),
            }));
            continue;
        }

        println!("\n{} ({})", chain.name, chain.id);
        println!("owner          {}", fmt_address(owner));
        println!(
            "smartAccount   {} (deployed: {})",
            fmt_address(plan.sender),
            plan.deployed
        );
        for c in &catalog.contracts {
            let mark = if c.exists == Some(true) { "deployed" } else { "missing" };
            let address = c.address.map(fmt_address).unwrap_or_default();
            println!("{:<14} {} ({})", c.name, address, mark);
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

async fn cmd_deploy(args: DeployArgs) -> Result<()> {
    let setup = Setup::load(&args.common)?;
    let policy = PollPolicy {
        attempts: args.poll_attempts.max(1),
        interval: Duration::from_secs(args.poll_interval_secs),
        receipt_timeout: Duration::from_secs(args.receipt_timeout_secs),
    };

    let first = first_chain(&setup.chains)?;
    let owner = setup.session.owner(first.id).await?.address();
    let resolved = setup.resolved_catalog(owner)?;

    for chain in &setup.chains {
        let provider = connect(chain).await?;
        let wallet = setup.session.owner(chain.id).await?;
        log_balance(&provider, chain, "owner", wallet.address()).await?;
        require_code(&provider, setup.proxy, "CREATE2 proxy").await?;

        let client = SignerMiddleware::new(provider, wallet);

        for c in &resolved.contracts {
            let init_code = c
                .init_code
                .as_ref()
                .ok_or_else(|| anyhow!("{}: init code not resolved", c.name))?;
            let out = deploy::ensure_deployed(&client, setup.proxy, c.salt, init_code, &policy)
                .await
                .with_context(|| format!("{} on {}", c.name, chain.name))?;

            match out.tx_hash.filter(|_| out.deployed_now) {
                Some(tx) => tracing::info!(
                    contract = %c.name,
                    address = %fmt_address(out.address),
                    tx = %explorer_or_hash(chain, tx),
                    "deployed"
                ),
                None => tracing::info!(
                    contract = %c.name,
                    address = %fmt_address(out.address),
                    "already deployed"
                ),
            }
        }
    }
    Ok(())
}

async fn cmd_sponsor(args: SponsorArgs) -> Result<()> {
    let common = &args.common;
    let setup = Setup::load(common)?;
    let paymaster_addr =
        config::parse_addr(&args.paymaster).context("invalid --paymaster address")?;

    // Bundler URLs are configuration: fail on a missing API key before touching any chain.
    let bundler_urls = setup
        .chains
        .iter()
        .map(|c| c.bundler_url(args.pimlico_api_key.as_deref()))
        .collect::<Result<Vec<_>>>()?;

    let first = first_chain(&setup.chains)?;
    let owner = setup.session.unlock_both(first.id).await?.0.address();
    let resolved = setup.resolved_catalog(owner)?;

    for (chain, bundler_url) in setup.chains.iter().zip(bundler_urls) {
        let provider = connect(chain).await?;
        let owner_wallet = setup.session.owner(chain.id).await?;
        let paymaster_wallet = setup.session.paymaster(chain.id).await?;
        log_balance(&provider, chain, "owner", owner_wallet.address()).await?;
        log_balance(&provider, chain, "paymaster signer", paymaster_wallet.address()).await?;

        let factory = setup.factory(common, chain)?;
        require_code(&provider, factory.address, "account factory").await?;
        require_code(&provider, paymaster_addr, "paymaster").await?;
        require_code(&provider, setup.proxy, "CREATE2 proxy").await?;

        let mut catalog = resolved.clone();
        catalog.probe(&provider).await?;

        let mut calls = Vec::new();
        for c in &catalog.contracts {
            let address = c.address.map(fmt_address).unwrap_or_default();
            if c.is_missing() {
                tracing::info!(contract = %c.name, %address, "scheduled");
                let init_code = c
                    .init_code
                    .as_ref()
                    .ok_or_else(|| anyhow!("{}: init code not resolved", c.name))?;
                calls.push((setup.proxy, deploy::proxy_calldata(c.salt, init_code)));
            } else {
                tracing::info!(contract = %c.name, %address, "already deployed");
            }
        }
        if calls.is_empty() {
            tracing::info!(chain = %chain.name, "nothing to deploy");
            continue;
        }

        let plan = userop::plan_account(
            &provider,
            &factory,
            owner,
            setup.account_salt,
            setup.entry_point,
        )
        .await?;
        let op = plan.build(userop::account_call_data(&calls)?);
        tracing::info!(
            sender = %fmt_address(plan.sender),
            deployed = plan.deployed,
            creates_account = op.creates_account(),
            calls = calls.len(),
            "smart account"
        );

        let bundler = BundlerClient::new(bundler_url);
        let sponsorship = Sponsorship::new(
            paymaster_addr,
            PaymasterStrategy::sponsor_for_user(paymaster_wallet.address()),
        );
        let ctx = OpContext {
            entry_point: setup.entry_point,
            chain_id: chain.id,
        };

        let prepared = finalize::prepare_sponsored(
            &provider,
            &bundler,
            &sponsorship,
            Signers {
                owner: &owner_wallet,
                paymaster: &paymaster_wallet,
            },
            &ctx,
            op,
            unix_now()?,
        )
        .await?;

        if args.dry_run {
            let pm = PaymasterData::parse(&prepared.op.paymaster_and_data)?;
            tracing::info!(
                user_op_hash = %fmt_h256(prepared.user_op_hash),
                paymaster_hash = %fmt_h256(prepared.paymaster_hash),
                valid_until = pm.valid_until,
                valid_after = pm.valid_after,
                depositor = %fmt_address(pm.strategy.depositor),
                "--dry-run set: not sending user operation"
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&encoding::user_op_to_json(&prepared.op))?
            );
            continue;
        }

        let receipt = finalize::submit(
            &bundler,
            &prepared.op,
            &ctx,
            Duration::from_secs(args.max_wait_seconds),
        )
        .await?;
        report_receipt(chain, &receipt)?;

        catalog.probe(&provider).await?;
        for c in catalog.missing() {
            tracing::warn!(contract = %c.name, "still missing after userOp");
        }
    }
    Ok(())
}

async fn cmd_submit(args: SubmitArgs) -> Result<()> {
    let table = config::load_chains(&args.chain_table)?;
    let chain = config::find_chain(&table, &args.chain)?;
    let entry_point =
        config::parse_addr(&args.entrypoint).context("invalid --entrypoint address")?;
    let bundler = BundlerClient::new(chain.bundler_url(args.pimlico_api_key.as_deref())?);

    let raw = std::fs::read_to_string(&args.op)
        .with_context(|| format!("failed to read {}", args.op.display()))?;
    let json: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", args.op.display()))?;
    let op = encoding::user_op_from_json(&json)?;

    let ctx = OpContext {
        entry_point,
        chain_id: chain.id,
    };
    let receipt = finalize::submit(
        &bundler,
        &op,
        &ctx,
        Duration::from_secs(args.max_wait_seconds),
    )
    .await?;
    report_receipt(chain, &receipt)
}

fn report_receipt(chain: &ChainConfig, receipt: &UserOpReceipt) -> Result<()> {
    tracing::debug!(receipt = %receipt.raw, "userOp receipt");
    if receipt.success == Some(false) {
        return Err(anyhow!(
            "userOp {} executed but reverted on {}",
            fmt_h256(receipt.user_op_hash),
            chain.name
        ));
    }
    if let Some(tx) = receipt.transaction_hash {
        tracing::info!(tx = %explorer_or_hash(chain, tx), "userOp mined");
    }
    Ok(())
}

fn explorer_or_hash(chain: &ChainConfig, tx: H256) -> String {
    chain.explorer_tx_url(tx).unwrap_or_else(|| fmt_h256(tx))
}

fn first_chain(chains: &[ChainConfig]) -> Result<&ChainConfig> {
    chains.first().ok_or_else(|| anyhow!("no --chain selected"))
}

async fn connect(chain: &ChainConfig) -> Result<Provider<Http>> {
    let provider =
        Provider::<Http>::try_from(chain.rpc_url.as_str())?.interval(Duration::from_millis(350));

    let chain_id = provider
        .get_chainid()
        .await
        .with_context(|| format!("{}: eth_chainId failed", chain.name))?
        .as_u64();
    if chain_id != chain.id {
        return Err(anyhow!(
            "chainId mismatch: {} is configured as {}, RPC returned {}",
            chain.name,
            chain.id,
            chain_id
        ));
    }

    tracing::info!(chain = %chain.name, id = chain.id, "connected");
    Ok(provider)
}

async fn log_balance(
    provider: &Provider<Http>,
    chain: &ChainConfig,
    role: &str,
    address: Address,
) -> Result<()> {
    let balance = provider
        .get_balance(address, None)
        .await
        .context("failed to fetch balance")?;
    tracing::info!(
        chain = %chain.name,
        role,
        address = %chain.explorer_address_url(address).unwrap_or_else(|| fmt_address(address)),
        balance = %ethers::utils::format_ether(balance),
        "signer"
    );
    Ok(())
}

fn unix_now() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before unix epoch")?
        .as_secs())
}
