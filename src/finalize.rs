use crate::bundler::{Bundler, UserOpReceipt};
use crate::chain::Chain;
use crate::encoding::{fmt_address, fmt_h256};
use crate::paymaster::{self, Sponsorship};
use crate::types::UserOperation;
use anyhow::{anyhow, Context, Result};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256};
use std::time::Duration;

/// Entry point and chain an operation is hashed against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpContext {
    pub entry_point: Address,
    pub chain_id: u64,
}

impl OpContext {
    pub fn hash(&self, op: &UserOperation) -> H256 {
        op.hash(self.entry_point, self.chain_id)
    }
}

pub struct Signers<'a> {
    pub owner: &'a LocalWallet,
    pub paymaster: &'a LocalWallet,
}

#[derive(Clone, Debug)]
pub struct PreparedOp {
    pub op: UserOperation,
    pub user_op_hash: H256,
    pub paymaster_hash: H256,
}

/// Replaces the dummy signature with the owner's signature over the userOp hash.
pub async fn sign_owner(op: &mut UserOperation, owner: &LocalWallet, ctx: &OpContext) -> Result<H256> {
    let hash = ctx.hash(op);
    let sig = owner
        .sign_message(hash.as_bytes())
        .await
        .context("failed to sign userOp hash")?;
    op.signature = Bytes::from(sig.to_vec());
    Ok(hash)
}

/// Draft, price, estimate, sponsor and owner-sign `op`, in that order.
pub async fn prepare_sponsored<C, B>(
    chain: &C,
    bundler: &B,
    sponsorship: &Sponsorship,
    signers: Signers<'_>,
    ctx: &OpContext,
    mut op: UserOperation,
    now: u64,
) -> Result<PreparedOp>
where
    C: Chain + ?Sized,
    B: Bundler + ?Sized,
{
    sponsorship.draft(&mut op);

    let tiers = bundler.gas_price().await?;
    tracing::debug!(
        slow = %tiers.slow.max_fee_per_gas,
        standard = %tiers.standard.max_fee_per_gas,
        fast = %tiers.fast.max_fee_per_gas,
        "bundler gas price tiers"
    );
    tiers.standard.apply(&mut op);

    let estimate = bundler
        .estimate_user_operation_gas(&op, ctx.entry_point)
        .await?;
    estimate.apply(&mut op);
    tracing::info!(
        call_gas = %op.call_gas_limit,
        verification_gas = %op.verification_gas_limit,
        pre_verification_gas = %op.pre_verification_gas,
        max_fee = %op.max_fee_per_gas,
        paymaster_verification_gas = ?estimate.paymaster_verification_gas_limit,
        paymaster_post_op_gas = ?estimate.paymaster_post_op_gas_limit,
        "gas estimated"
    );

    let paymaster_hash = sponsorship
        .sponsor(chain, signers.paymaster, &mut op, now)
        .await?;
    if !paymaster::signature_matches(&op, paymaster_hash, signers.paymaster.address()) {
        return Err(anyhow!(
            "paymaster signature does not recover to {}",
            fmt_address(signers.paymaster.address())
        ));
    }
    let user_op_hash = sign_owner(&mut op, signers.owner, ctx).await?;
    tracing::info!(
        sender = %fmt_address(op.sender),
        user_op_hash = %fmt_h256(user_op_hash),
        "userOp signed"
    );

    Ok(PreparedOp {
        op,
        user_op_hash,
        paymaster_hash,
    })
}

/// Sends the finalized operation and waits for the bundler to report it mined.
pub async fn submit<B: Bundler + ?Sized>(
    bundler: &B,
    op: &UserOperation,
    ctx: &OpContext,
    timeout: Duration,
) -> Result<UserOpReceipt> {
    let user_op_hash = bundler.send_user_operation(op, ctx.entry_point).await?;
    tracing::info!(user_op_hash = %fmt_h256(user_op_hash), "userOp submitted");

    let expected = ctx.hash(op);
    if user_op_hash != expected {
        tracing::warn!(
            bundler = %fmt_h256(user_op_hash),
            local = %fmt_h256(expected),
            "bundler returned a different userOp hash"
        );
    }

    bundler
        .wait_user_operation_receipt(user_op_hash, timeout)
        .await
}
