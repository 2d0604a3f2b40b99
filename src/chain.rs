use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::providers::{Middleware, PendingTransaction};
use ethers::types::{Address, Bytes, TransactionReceipt, TransactionRequest, H256};
use std::time::Duration;

/// The handful of node operations the deployment and UserOperation flows need.
///
/// Implemented for every ethers [`Middleware`]; tests substitute an in-memory chain.
#[async_trait]
pub trait Chain: Send + Sync {
    async fn code_at(&self, address: Address) -> Result<Bytes>;

    /// `eth_call` against the latest block.
    async fn call_view(&self, to: Address, data: Bytes) -> Result<Bytes>;

    /// Sends a zero-value transaction from the signer and returns its hash without waiting.
    async fn send_call(&self, to: Address, data: Bytes) -> Result<H256>;

    /// `Ok(None)` when the node dropped the transaction.
    async fn wait_for_receipt(
        &self,
        tx_hash: H256,
        timeout: Duration,
    ) -> Result<Option<TransactionReceipt>>;
}

#[async_trait]
impl<M: Middleware + 'static> Chain for M {
    async fn code_at(&self, address: Address) -> Result<Bytes> {
        self.get_code(address, None)
            .await
            .context("eth_getCode failed")
    }

    async fn call_view(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let tx = TransactionRequest::new().to(to).data(data).into();
        self.call(&tx, None).await.context("eth_call failed")
    }

    async fn send_call(&self, to: Address, data: Bytes) -> Result<H256> {
        let tx = TransactionRequest::new().to(to).data(data);
        let pending = self
            .send_transaction(tx, None)
            .await
            .with_context(|| format!("failed to send transaction to {to:?}"))?;
        Ok(pending.tx_hash())
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: H256,
        timeout: Duration,
    ) -> Result<Option<TransactionReceipt>> {
        let pending = PendingTransaction::new(tx_hash, self.provider());
        match tokio::time::timeout(timeout, pending).await {
            Ok(res) => res.context("failed waiting for transaction receipt"),
            Err(_) => Err(anyhow!(
                "timed out waiting for receipt of {tx_hash:?} after {:?}",
                timeout
            )),
        }
    }
}

/// Fails with [`DeployError::MissingContract`](crate::error::DeployError) when `address` has no code.
pub async fn require_code<C: Chain + ?Sized>(
    chain: &C,
    address: Address,
    what: &'static str,
) -> Result<()> {
    let code = chain.code_at(address).await?;
    if !crate::encoding::has_code(&code) {
        return Err(crate::error::DeployError::MissingContract { what, address }.into());
    }
    Ok(())
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub type ViewFn = Box<dyn Fn(Address, &[u8]) -> Result<Bytes> + Send + Sync>;

    #[derive(Clone, Copy, Debug)]
    pub enum ReceiptMode {
        Success,
        Reverted,
        Timeout,
    }

    /// Code materializes at `address` after `hidden_reads` empty `eth_getCode` answers.
    struct Landing {
        address: Address,
        code: Bytes,
        hidden_reads: usize,
    }

    pub struct FakeChain {
        code: Mutex<HashMap<Address, Bytes>>,
        landing: Mutex<Option<Landing>>,
        on_send: Mutex<Option<Landing>>,
        pub sent: Mutex<Vec<(Address, Bytes)>>,
        pub code_reads: Mutex<usize>,
        receipt: ReceiptMode,
        views: ViewFn,
    }

    impl FakeChain {
        pub fn new() -> Self {
            Self {
                code: Mutex::new(HashMap::new()),
                landing: Mutex::new(None),
                on_send: Mutex::new(None),
                sent: Mutex::new(Vec::new()),
                code_reads: Mutex::new(0),
                receipt: ReceiptMode::Success,
                views: Box::new(|to, _| Err(anyhow!("unexpected eth_call to {to:?}"))),
            }
        }

        pub fn with_code(self, address: Address, code: &[u8]) -> Self {
            self.code
                .lock()
                .unwrap()
                .insert(address, Bytes::from(code.to_vec()));
            self
        }

        /// The next `send_call` makes `code` appear at `address` after `hidden_reads` polls.
        pub fn deploys_on_send(self, address: Address, code: &[u8], hidden_reads: usize) -> Self {
            *self.on_send.lock().unwrap() = Some(Landing {
                address,
                code: Bytes::from(code.to_vec()),
                hidden_reads,
            });
            self
        }

        pub fn with_receipt(mut self, mode: ReceiptMode) -> Self {
            self.receipt = mode;
            self
        }

        pub fn with_views(
            mut self,
            f: impl Fn(Address, &[u8]) -> Result<Bytes> + Send + Sync + 'static,
        ) -> Self {
            self.views = Box::new(f);
            self
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Chain for FakeChain {
        async fn code_at(&self, address: Address) -> Result<Bytes> {
            *self.code_reads.lock().unwrap() += 1;

            let mut landing = self.landing.lock().unwrap();
            if let Some(l) = landing.as_mut() {
                if l.address == address {
                    if l.hidden_reads == 0 {
                        let l = landing.take().unwrap();
                        self.code.lock().unwrap().insert(l.address, l.code);
                    } else {
                        l.hidden_reads -= 1;
                    }
                }
            }

            Ok(self
                .code
                .lock()
                .unwrap()
                .get(&address)
                .cloned()
                .unwrap_or_default())
        }

        async fn call_view(&self, to: Address, data: Bytes) -> Result<Bytes> {
            (self.views)(to, data.as_ref())
        }

        async fn send_call(&self, to: Address, data: Bytes) -> Result<H256> {
            let mut sent = self.sent.lock().unwrap();
            sent.push((to, data));
            if let Some(l) = self.on_send.lock().unwrap().take() {
                *self.landing.lock().unwrap() = Some(l);
            }
            Ok(H256::from_low_u64_be(sent.len() as u64))
        }

        async fn wait_for_receipt(
            &self,
            tx_hash: H256,
            _timeout: Duration,
        ) -> Result<Option<TransactionReceipt>> {
            match self.receipt {
                ReceiptMode::Success => Ok(Some(TransactionReceipt {
                    transaction_hash: tx_hash,
                    status: Some(1u64.into()),
                    ..Default::default()
                })),
                ReceiptMode::Reverted => Ok(Some(TransactionReceipt {
                    transaction_hash: tx_hash,
                    status: Some(0u64.into()),
                    ..Default::default()
                })),
                ReceiptMode::Timeout => Err(anyhow!("timed out waiting for receipt")),
            }
        }
    }
}
