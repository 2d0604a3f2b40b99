use ethers::types::{Address, H256};
use ethers::utils::keccak256;

/// CREATE2 address for `init_code` deployed by `factory` with `salt` (EIP-1014).
pub fn resolve(factory: Address, init_code: &[u8], salt: H256) -> Address {
    let code_hash = keccak256(init_code);

    let mut preimage = [0u8; 1 + 20 + 32 + 32];
    preimage[0] = 0xff;
    preimage[1..21].copy_from_slice(factory.as_bytes());
    preimage[21..53].copy_from_slice(salt.as_bytes());
    preimage[53..].copy_from_slice(&code_hash);

    Address::from_slice(&keccak256(preimage)[12..])
}
