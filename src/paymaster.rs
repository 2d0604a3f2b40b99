use crate::chain::Chain;
use crate::encoding::{fmt_address, fmt_h256};
use crate::types::{PaymasterStrategy, UserOperation, DUMMY_SIGNATURE};
use anyhow::{anyhow, Context, Result};
use ethers::abi::{self, ParamType, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, Signature, H256, U256};
use ethers::utils::id;

/// Sponsored operations stay valid for thirty days.
pub const VALIDITY_SECS: u64 = 30 * 24 * 60 * 60;

/// `abi.encode(uint48, uint48, (uint8,address,address,uint256))` is fully static.
pub const BLOB_LEN: usize = 6 * 32;

pub const PAYMASTER_AND_DATA_LEN: usize = 20 + BLOB_LEN + 65;

const GET_HASH_SIG: &str = "getHash((address,uint256,bytes,bytes,uint256,uint256,uint256,uint256,uint256,bytes,bytes),uint48,uint48,(uint8,address,address,uint256))";

pub fn encode_blob(valid_until: u64, valid_after: u64, strategy: &PaymasterStrategy) -> Bytes {
    Bytes::from(abi::encode(&[
        Token::Uint(U256::from(valid_until)),
        Token::Uint(U256::from(valid_after)),
        strategy.to_token(),
    ]))
}

pub fn paymaster_and_data(paymaster: Address, blob: &[u8], signature: &[u8]) -> Bytes {
    let mut v = Vec::with_capacity(20 + blob.len() + signature.len());
    v.extend_from_slice(paymaster.as_bytes());
    v.extend_from_slice(blob);
    v.extend_from_slice(signature);
    Bytes::from(v)
}

/// Decoded view of a `paymasterAndData` value produced by [`paymaster_and_data`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymasterData {
    pub paymaster: Address,
    pub valid_until: u64,
    pub valid_after: u64,
    pub strategy: PaymasterStrategy,
    pub signature: Bytes,
}

impl PaymasterData {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != PAYMASTER_AND_DATA_LEN {
            return Err(anyhow!(
                "paymasterAndData must be {PAYMASTER_AND_DATA_LEN} bytes, got {}",
                data.len()
            ));
        }
        let paymaster = Address::from_slice(&data[..20]);
        let tokens = abi::decode(
            &[
                ParamType::Uint(48),
                ParamType::Uint(48),
                ParamType::Tuple(vec![
                    ParamType::Uint(8),
                    ParamType::Address,
                    ParamType::Address,
                    ParamType::Uint(256),
                ]),
            ],
            &data[20..20 + BLOB_LEN],
        )
        .context("malformed paymaster blob")?;

        match tokens.as_slice() {
            [Token::Uint(until), Token::Uint(after), Token::Tuple(s)] => match s.as_slice() {
                [Token::Uint(mode), Token::Address(depositor), Token::Address(erc20_token), Token::Uint(exchange_rate)] => {
                    let mode = u8::try_from(*mode)
                        .map_err(|_| anyhow!("paymaster mode {mode} does not fit uint8"))?;
                    Ok(Self {
                        paymaster,
                        valid_until: until.low_u64(),
                        valid_after: after.low_u64(),
                        strategy: PaymasterStrategy {
                            mode,
                            depositor: *depositor,
                            erc20_token: *erc20_token,
                            exchange_rate: *exchange_rate,
                        },
                        signature: Bytes::from(data[20 + BLOB_LEN..].to_vec()),
                    })
                }
                other => Err(anyhow!("unexpected strategy tuple {other:?}")),
            },
            other => Err(anyhow!("unexpected paymaster blob {other:?}")),
        }
    }
}

/// `paymaster.getHash(userOp, validUntil, validAfter, strategy)`.
pub async fn get_hash<C: Chain + ?Sized>(
    chain: &C,
    paymaster: Address,
    op: &UserOperation,
    valid_until: u64,
    valid_after: u64,
    strategy: &PaymasterStrategy,
) -> Result<H256> {
    let mut data = id(GET_HASH_SIG).to_vec();
    data.extend(abi::encode(&[
        op.to_token(),
        Token::Uint(U256::from(valid_until)),
        Token::Uint(U256::from(valid_after)),
        strategy.to_token(),
    ]));

    let out = chain
        .call_view(paymaster, Bytes::from(data))
        .await
        .context("paymaster.getHash failed")?;
    match abi::decode(&[ParamType::FixedBytes(32)], out.as_ref())?.as_slice() {
        [Token::FixedBytes(b)] if b.len() == 32 => Ok(H256::from_slice(b)),
        other => Err(anyhow!("unexpected getHash output {other:?}")),
    }
}

/// A verifying paymaster and the terms it sponsors under.
#[derive(Clone, Copy, Debug)]
pub struct Sponsorship {
    pub paymaster: Address,
    pub strategy: PaymasterStrategy,
}

impl Sponsorship {
    pub fn new(paymaster: Address, strategy: PaymasterStrategy) -> Self {
        Self {
            paymaster,
            strategy,
        }
    }

    /// Zero validity window and a dummy signature, enough for gas estimation.
    pub fn draft(&self, op: &mut UserOperation) {
        let blob = encode_blob(0, 0, &self.strategy);
        op.paymaster_and_data = paymaster_and_data(self.paymaster, &blob, &DUMMY_SIGNATURE);
    }

    /// Signs the paymaster commitment for the already-priced `op` and commits it.
    ///
    /// Gas fields and `call_data` must not change afterwards.
    pub async fn sponsor<C: Chain + ?Sized>(
        &self,
        chain: &C,
        signer: &LocalWallet,
        op: &mut UserOperation,
        now: u64,
    ) -> Result<H256> {
        let valid_until = now + VALIDITY_SECS;
        let valid_after = 0;

        let hash = get_hash(
            chain,
            self.paymaster,
            op,
            valid_until,
            valid_after,
            &self.strategy,
        )
        .await?;

        let signature = signer
            .sign_message(hash.as_bytes())
            .await
            .context("failed to sign paymaster hash")?;

        let blob = encode_blob(valid_until, valid_after, &self.strategy);
        op.paymaster_and_data = paymaster_and_data(self.paymaster, &blob, &signature.to_vec());

        tracing::info!(
            paymaster = %fmt_address(self.paymaster),
            hash = %fmt_h256(hash),
            valid_until,
            "paymaster signature attached"
        );
        Ok(hash)
    }
}

/// True when the signature embedded in `op.paymaster_and_data` recovers to `signer` over `hash`.
pub fn signature_matches(op: &UserOperation, hash: H256, signer: Address) -> bool {
    let Ok(data) = PaymasterData::parse(&op.paymaster_and_data) else {
        return false;
    };
    match Signature::try_from(data.signature.as_ref()) {
        Ok(sig) => sig.verify(hash.as_bytes().to_vec(), signer).is_ok(),
        Err(_) => false,
    }
}
