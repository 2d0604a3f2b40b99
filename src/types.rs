use ethers::abi::{self, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;

/// 65-byte placeholder signature.
///
/// Bundlers simulate validation during gas estimation, so the signature must be
/// well-formed (valid `v`, non-zero `r`/`s`) even though it never verifies.
pub const DUMMY_SIGNATURE: [u8; 65] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xf0,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x7a, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa,
    0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa,
    0x1c,
];

pub fn dummy_signature() -> Bytes {
    Bytes::from(DUMMY_SIGNATURE.to_vec())
}

/// ERC-4337 UserOperation (EntryPoint v0.6 layout).
///
/// Note: EntryPoint v0.7 uses a *different* packed struct layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    /// First-time account creation: nonce zero and a factory payload attached.
    pub fn creates_account(&self) -> bool {
        self.nonce.is_zero() && !self.init_code.is_empty()
    }

    /// The struct as a single ABI tuple, matching the Solidity layout used by
    /// `EntryPoint` and paymaster views.
    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::Bytes(self.init_code.to_vec()),
            Token::Bytes(self.call_data.to_vec()),
            Token::Uint(self.call_gas_limit),
            Token::Uint(self.verification_gas_limit),
            Token::Uint(self.pre_verification_gas),
            Token::Uint(self.max_fee_per_gas),
            Token::Uint(self.max_priority_fee_per_gas),
            Token::Bytes(self.paymaster_and_data.to_vec()),
            Token::Bytes(self.signature.to_vec()),
        ])
    }

    /// `UserOperationLib.pack`: dynamic fields are replaced by their hashes and the
    /// signature is left out.
    pub fn pack(&self) -> Vec<u8> {
        abi::encode(&[
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::FixedBytes(keccak256(&self.init_code).to_vec()),
            Token::FixedBytes(keccak256(&self.call_data).to_vec()),
            Token::Uint(self.call_gas_limit),
            Token::Uint(self.verification_gas_limit),
            Token::Uint(self.pre_verification_gas),
            Token::Uint(self.max_fee_per_gas),
            Token::Uint(self.max_priority_fee_per_gas),
            Token::FixedBytes(keccak256(&self.paymaster_and_data).to_vec()),
        ])
    }

    /// Same value as `EntryPoint.getUserOpHash` on a v0.6 entry point.
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> H256 {
        let inner = keccak256(self.pack());
        H256(keccak256(abi::encode(&[
            Token::FixedBytes(inner.to_vec()),
            Token::Address(entry_point),
            Token::Uint(U256::from(chain_id)),
        ])))
    }
}

/// Sponsorship terms understood by the verifying paymaster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PaymasterStrategy {
    /// 0 = sponsor-for-user; other values are reserved by the contract.
    pub mode: u8,
    pub depositor: Address,
    /// Zero address means native-asset accounting.
    pub erc20_token: Address,
    pub exchange_rate: U256,
}

impl PaymasterStrategy {
    pub fn sponsor_for_user(depositor: Address) -> Self {
        Self {
            mode: 0,
            depositor,
            erc20_token: Address::zero(),
            exchange_rate: U256::zero(),
        }
    }

    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Uint(U256::from(self.mode)),
            Token::Address(self.depositor),
            Token::Address(self.erc20_token),
            Token::Uint(self.exchange_rate),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_op() -> UserOperation {
        UserOperation {
            sender: Address::repeat_byte(0x11),
            nonce: U256::zero(),
            init_code: Bytes::from(vec![0xab; 40]),
            call_data: Bytes::from(vec![0xcd; 8]),
            call_gas_limit: U256::from(100_000u64),
            verification_gas_limit: U256::from(200_000u64),
            pre_verification_gas: U256::from(50_000u64),
            max_fee_per_gas: U256::from(3_000_000_000u64),
            max_priority_fee_per_gas: U256::from(1_000_000_000u64),
            paymaster_and_data: Bytes::default(),
            signature: dummy_signature(),
        }
    }

    #[test]
    fn dummy_signature_is_65_bytes() {
        assert_eq!(dummy_signature().len(), 65);
        assert_eq!(DUMMY_SIGNATURE[64], 0x1c);
    }

    #[test]
    fn pack_is_ten_words() {
        assert_eq!(sample_op().pack().len(), 10 * 32);
    }

    #[test]
    fn hash_ignores_signature() {
        let op = sample_op();
        let mut signed = op.clone();
        signed.signature = Bytes::from(vec![0x01; 65]);
        let ep = Address::repeat_byte(0x5f);
        assert_eq!(op.hash(ep, 1), signed.hash(ep, 1));
    }

    #[test]
    fn hash_binds_chain_entry_point_and_fields() {
        let op = sample_op();
        let ep = Address::repeat_byte(0x5f);
        let base = op.hash(ep, 11155111);

        assert_ne!(base, op.hash(ep, 1));
        assert_ne!(base, op.hash(Address::repeat_byte(0x60), 11155111));

        let mut changed = op.clone();
        changed.paymaster_and_data = Bytes::from(vec![0x01]);
        assert_ne!(base, changed.hash(ep, 11155111));

        let mut changed = op;
        changed.call_gas_limit += U256::one();
        assert_ne!(base, changed.hash(ep, 11155111));
    }

    #[test]
    fn creates_account_requires_zero_nonce_and_init_code() {
        let mut op = sample_op();
        assert!(op.creates_account());
        op.nonce = U256::one();
        assert!(!op.creates_account());
        op.nonce = U256::zero();
        op.init_code = Bytes::default();
        assert!(!op.creates_account());
    }
}
