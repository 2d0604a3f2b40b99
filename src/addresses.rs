//! Well-known deployments shared by every supported chain.

/// Deterministic deployment proxy (Arachnid). Calldata is `salt ++ initCode`.
pub const CREATE2_PROXY: &str = "0x4e59b44847b379578588920cA78FbF26c0B4956C";

pub const ENTRYPOINT_V06: &str = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789";

/// Account factories exposing `createAccountWithNonce(address,bytes32,bool)`.
pub const FACTORY_V6: &str = "0x5a2ed3e47798123ae30477424731de2ae47cc158";
pub const FACTORY_V6_SEPOLIA: &str = "0xcb71e008b9062bb7abd558816f8135ef2cab576f";

/// eth-infinitism SimpleAccountFactory for EntryPoint v0.6.
pub const SIMPLE_ACCOUNT_FACTORY: &str = "0x9406Cc6185a346906296840746125a0E44976454";

pub const PAYMASTER: &str = "0x51032c841E823BB487C33c9f1773B18C8d0E5209";

const SEPOLIA: u64 = 11155111;

/// Account factory used when `--factory` is not given.
pub fn default_factory(chain_id: u64) -> &'static str {
    if chain_id == SEPOLIA {
        FACTORY_V6_SEPOLIA
    } else {
        FACTORY_V6
    }
}
