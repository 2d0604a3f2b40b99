use crate::chain::Chain;
use crate::create2;
use crate::encoding::{fmt_address, fmt_h256, has_code};
use crate::error::DeployError;
use anyhow::Result;
use ethers::types::{Address, Bytes, H256, U64};
use std::time::Duration;

/// How long to wait for code to show up after the proxy call.
#[derive(Clone, Debug)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
    pub receipt_timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 12,
            interval: Duration::from_secs(5),
            receipt_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployOutcome {
    pub address: Address,
    /// False when the code was already there and nothing was sent.
    pub deployed_now: bool,
    pub tx_hash: Option<H256>,
}

/// Calldata for the deterministic deployment proxy.
pub fn proxy_calldata(salt: H256, init_code: &[u8]) -> Bytes {
    let mut v = Vec::with_capacity(32 + init_code.len());
    v.extend_from_slice(salt.as_bytes());
    v.extend_from_slice(init_code);
    Bytes::from(v)
}

/// Deploys `init_code` through `proxy` unless the CREATE2 target already has code.
///
/// The receipt wait is advisory: bytecode polling decides the outcome.
pub async fn ensure_deployed<C: Chain + ?Sized>(
    chain: &C,
    proxy: Address,
    salt: H256,
    init_code: &[u8],
    policy: &PollPolicy,
) -> Result<DeployOutcome> {
    let target = create2::resolve(proxy, init_code, salt);

    if has_code(&chain.code_at(target).await?) {
        tracing::debug!(address = %fmt_address(target), "already deployed");
        return Ok(DeployOutcome {
            address: target,
            deployed_now: false,
            tx_hash: None,
        });
    }

    let tx_hash = chain
        .send_call(proxy, proxy_calldata(salt, init_code))
        .await?;
    tracing::info!(
        tx = %fmt_h256(tx_hash),
        predicted = %fmt_address(target),
        "proxy deployment sent"
    );

    let mut reverted = false;
    match chain.wait_for_receipt(tx_hash, policy.receipt_timeout).await {
        Ok(Some(receipt)) => {
            reverted = receipt.status == Some(U64::zero());
            tracing::info!(
                tx = %fmt_h256(tx_hash),
                block = ?receipt.block_number,
                reverted,
                "proxy deployment mined"
            );
        }
        Ok(None) => tracing::warn!(tx = %fmt_h256(tx_hash), "proxy deployment dropped"),
        Err(e) => tracing::warn!(error = %e, "receipt wait failed; falling back to code polling"),
    }

    // A reverted call cannot produce code later, so one confirming read is enough.
    let attempts = if reverted { 1 } else { policy.attempts };

    for attempt in 0..attempts {
        if has_code(&chain.code_at(target).await?) {
            return Ok(DeployOutcome {
                address: target,
                deployed_now: true,
                tx_hash: Some(tx_hash),
            });
        }
        if attempt + 1 < attempts {
            tracing::debug!(attempt = attempt + 1, "code not visible yet");
            tokio::time::sleep(policy.interval).await;
        }
    }

    Err(DeployError::DeploymentVerificationFailed {
        address: target,
        tx_hash,
        reverted,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::{FakeChain, ReceiptMode};
    use crate::encoding::pad_salt;

    const INIT: [u8; 22] = [
        0x60, 0x0a, 0x60, 0x0c, 0x60, 0x00, 0x39, 0x60, 0x0a, 0x60, 0x00, 0xf3, 0x60, 0x2a, 0x60,
        0x00, 0x52, 0x60, 0x20, 0x60, 0x00, 0xf3,
    ];
    const RUNTIME: [u8; 10] = [0x60, 0x2a, 0x60, 0x00, 0x52, 0x60, 0x20, 0x60, 0x00, 0xf3];

    fn proxy() -> Address {
        Address::repeat_byte(0x4e)
    }

    fn salt() -> H256 {
        pad_salt("0x01").unwrap()
    }

    fn target() -> Address {
        create2::resolve(proxy(), &INIT, salt())
    }

    #[test]
    fn calldata_is_salt_then_init_code() {
        let data = proxy_calldata(salt(), &INIT);
        assert_eq!(data.len(), 32 + INIT.len());
        assert_eq!(&data[..32], salt().as_bytes());
        assert_eq!(&data[32..], &INIT[..]);
    }

    #[tokio::test(start_paused = true)]
    async fn already_deployed_sends_nothing() {
        let chain = FakeChain::new().with_code(target(), &RUNTIME);
        let out = ensure_deployed(&chain, proxy(), salt(), &INIT, &PollPolicy::default())
            .await
            .unwrap();

        assert_eq!(out.address, target());
        assert!(!out.deployed_now);
        assert_eq!(chain.sent_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn code_appearing_on_third_poll_takes_ten_seconds() {
        let chain = FakeChain::new().deploys_on_send(target(), &RUNTIME, 2);
        let start = tokio::time::Instant::now();

        let out = ensure_deployed(&chain, proxy(), salt(), &INIT, &PollPolicy::default())
            .await
            .unwrap();

        let elapsed = start.elapsed();
        assert!(out.deployed_now);
        assert_eq!(out.tx_hash, Some(H256::from_low_u64_be(1)));
        assert_eq!(elapsed, Duration::from_secs(10));
        assert!(elapsed <= Duration::from_secs(60));

        let sent = chain.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, proxy());
        assert_eq!(sent[0].1, proxy_calldata(salt(), &INIT));
    }

    #[tokio::test(start_paused = true)]
    async fn second_call_is_idempotent() {
        let chain = FakeChain::new().deploys_on_send(target(), &RUNTIME, 0);
        let policy = PollPolicy::default();

        let first = ensure_deployed(&chain, proxy(), salt(), &INIT, &policy)
            .await
            .unwrap();
        assert!(first.deployed_now);

        let second = ensure_deployed(&chain, proxy(), salt(), &INIT, &policy)
            .await
            .unwrap();
        assert!(!second.deployed_now);
        assert_eq!(second.address, first.address);
        assert_eq!(chain.sent_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn never_appearing_code_fails_with_context() {
        let chain = FakeChain::new();
        let start = tokio::time::Instant::now();

        let err = ensure_deployed(&chain, proxy(), salt(), &INIT, &PollPolicy::default())
            .await
            .unwrap_err();

        // 12 reads, 11 sleeps in between.
        assert_eq!(start.elapsed(), Duration::from_secs(55));
        assert_eq!(*chain.code_reads.lock().unwrap(), 1 + 12);
        match err.downcast_ref::<DeployError>() {
            Some(DeployError::DeploymentVerificationFailed {
                address,
                tx_hash,
                reverted,
            }) => {
                assert_eq!(*address, target());
                assert_eq!(*tx_hash, H256::from_low_u64_be(1));
                assert!(!reverted);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn receipt_wait_failure_is_not_fatal() {
        let chain = FakeChain::new()
            .with_receipt(ReceiptMode::Timeout)
            .deploys_on_send(target(), &RUNTIME, 1);

        let out = ensure_deployed(&chain, proxy(), salt(), &INIT, &PollPolicy::default())
            .await
            .unwrap();
        assert!(out.deployed_now);
    }

    #[tokio::test(start_paused = true)]
    async fn reverted_receipt_short_circuits_polling() {
        let chain = FakeChain::new().with_receipt(ReceiptMode::Reverted);
        let start = tokio::time::Instant::now();

        let err = ensure_deployed(&chain, proxy(), salt(), &INIT, &PollPolicy::default())
            .await
            .unwrap_err();

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(matches!(
            err.downcast_ref::<DeployError>(),
            Some(DeployError::DeploymentVerificationFailed { reverted: true, .. })
        ));
    }
}
