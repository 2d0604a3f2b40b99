use ethers::types::{Address, H256};
use thiserror::Error;

/// Failures that callers may want to match on; everything else travels as `anyhow::Error`.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("deployment produced empty byte-code at {address:?} (tx {tx_hash:?}, reverted={reverted})")]
    DeploymentVerificationFailed {
        address: Address,
        tx_hash: H256,
        reverted: bool,
    },

    #[error("{what} not deployed at {address:?}")]
    MissingContract { what: &'static str, address: Address },

    #[error("missing {0} in environment")]
    MissingEnv(String),

    #[error("unknown chain {0:?}")]
    UnknownChain(String),

    #[error("timed out waiting for userOp receipt {user_op_hash:?} after {seconds}s")]
    ReceiptTimeout { user_op_hash: H256, seconds: u64 },
}
