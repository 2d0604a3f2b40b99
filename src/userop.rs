use crate::chain::Chain;
use crate::encoding::{fmt_address, has_code};
use crate::factory::Factory;
use crate::types::{dummy_signature, UserOperation};
use anyhow::{anyhow, Context, Result};
use ethers::abi::{AbiParser, Token};
use ethers::types::{Address, Bytes, H256, U256};

/// Unsigned, unpriced v0.6 UserOperation.
///
/// Gas and fee fields are zero and the signature is the dummy one, which is what
/// bundlers expect to simulate during `eth_estimateUserOperationGas`.
pub fn build(sender: Address, nonce: U256, init_code: Bytes, call_data: Bytes) -> UserOperation {
    UserOperation {
        sender,
        nonce,
        init_code,
        call_data,
        call_gas_limit: U256::zero(),
        verification_gas_limit: U256::zero(),
        pre_verification_gas: U256::zero(),
        max_fee_per_gas: U256::zero(),
        max_priority_fee_per_gas: U256::zero(),
        paymaster_and_data: Bytes::default(),
        signature: dummy_signature(),
    }
}

/// Where an account stands right before an operation is built for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountPlan {
    pub sender: Address,
    pub deployed: bool,
    pub nonce: U256,
    /// Empty exactly when `deployed`.
    pub init_code: Bytes,
}

impl AccountPlan {
    pub fn build(&self, call_data: Bytes) -> UserOperation {
        build(self.sender, self.nonce, self.init_code.clone(), call_data)
    }
}

pub async fn plan_account<C: Chain + ?Sized>(
    chain: &C,
    factory: &Factory,
    owner: Address,
    salt: H256,
    entry_point: Address,
) -> Result<AccountPlan> {
    let sender = factory.account_address(chain, owner, salt).await?;
    let deployed = has_code(&chain.code_at(sender).await?);

    let (nonce, init_code) = if deployed {
        (entry_point_nonce(chain, entry_point, sender).await?, Bytes::default())
    } else {
        // EntryPoint only tracks nonces for accounts that exist.
        (U256::zero(), factory.init_code(owner, salt)?)
    };

    tracing::debug!(sender = %fmt_address(sender), deployed, %nonce, "account plan");

    Ok(AccountPlan {
        sender,
        deployed,
        nonce,
        init_code,
    })
}

/// `EntryPoint.getNonce(sender, 0)`.
pub async fn entry_point_nonce<C: Chain + ?Sized>(
    chain: &C,
    entry_point: Address,
    sender: Address,
) -> Result<U256> {
    let f = AbiParser::default()
        .parse_function("function getNonce(address sender, uint192 key) view returns (uint256)")?;
    let data = f.encode_input(&[Token::Address(sender), Token::Uint(U256::zero())])?;
    let out = chain
        .call_view(entry_point, Bytes::from(data))
        .await
        .context("entryPoint.getNonce failed")?;
    match f.decode_output(out.as_ref())?.as_slice() {
        [Token::Uint(n)] => Ok(*n),
        other => Err(anyhow!("unexpected getNonce output {other:?}")),
    }
}

/// Account call data: `execute` for a single call, `executeBatch` otherwise.
pub fn account_call_data(calls: &[(Address, Bytes)]) -> Result<Bytes> {
    let data = match calls {
        [] => return Err(anyhow!("no calls to encode")),
        [(dest, func)] => AbiParser::default()
            .parse_function("function execute(address dest, uint256 value, bytes func)")?
            .encode_input(&[
                Token::Address(*dest),
                Token::Uint(U256::zero()),
                Token::Bytes(func.to_vec()),
            ])?,
        many => AbiParser::default()
            .parse_function("function executeBatch(address[] dest, bytes[] func)")?
            .encode_input(&[
                Token::Array(many.iter().map(|(d, _)| Token::Address(*d)).collect()),
                Token::Array(many.iter().map(|(_, f)| Token::Bytes(f.to_vec())).collect()),
            ])?,
    };
    Ok(Bytes::from(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::FakeChain;
    use crate::factory::FactoryKind;
    use ethers::abi::encode;
    use ethers::utils::id;

    const FACTORY: [u8; 20] = [0xfa; 20];
    const ENTRY_POINT: [u8; 20] = [0x5f; 20];
    const ACCOUNT: [u8; 20] = [0xac; 20];

    fn chain_with_views() -> FakeChain {
        FakeChain::new().with_views(|to, data| {
            let selector = &data[..4];
            if to == Address::from(FACTORY) && selector == &id("getAddress(address,uint256)")[..] {
                return Ok(Bytes::from(encode(&[Token::Address(Address::from(ACCOUNT))])));
            }
            if to == Address::from(ENTRY_POINT) && selector == &id("getNonce(address,uint192)")[..] {
                return Ok(Bytes::from(encode(&[Token::Uint(U256::from(9u64))])));
            }
            Err(anyhow!("unexpected view"))
        })
    }

    fn factory() -> Factory {
        Factory::new(Address::from(FACTORY), Some(FactoryKind::SimpleAccount)).unwrap()
    }

    #[test]
    fn build_uses_placeholders() {
        let op = build(Address::from(ACCOUNT), U256::zero(), Bytes::default(), Bytes::from(vec![1]));
        assert!(op.call_gas_limit.is_zero());
        assert!(op.verification_gas_limit.is_zero());
        assert!(op.pre_verification_gas.is_zero());
        assert!(op.max_fee_per_gas.is_zero());
        assert!(op.max_priority_fee_per_gas.is_zero());
        assert!(op.paymaster_and_data.is_empty());
        assert_eq!(op.signature.len(), 65);
    }

    #[tokio::test]
    async fn undeployed_account_gets_init_code_and_zero_nonce() {
        let chain = chain_with_views();
        let owner = Address::repeat_byte(0x0e);
        let plan = plan_account(&chain, &factory(), owner, H256::zero(), Address::from(ENTRY_POINT))
            .await
            .unwrap();

        assert!(!plan.deployed);
        assert!(plan.nonce.is_zero());
        assert_eq!(plan.init_code, factory().init_code(owner, H256::zero()).unwrap());
        assert!(plan.build(Bytes::default()).creates_account());
    }

    #[tokio::test]
    async fn deployed_account_has_empty_init_code_and_entry_point_nonce() {
        let chain = chain_with_views().with_code(Address::from(ACCOUNT), &[0x60, 0x80]);
        let plan = plan_account(
            &chain,
            &factory(),
            Address::repeat_byte(0x0e),
            H256::zero(),
            Address::from(ENTRY_POINT),
        )
        .await
        .unwrap();

        assert!(plan.deployed);
        assert!(plan.init_code.is_empty());
        assert_eq!(plan.nonce, U256::from(9u64));
    }

    #[test]
    fn single_call_uses_execute() {
        let data = account_call_data(&[(Address::repeat_byte(1), Bytes::from(vec![0xde, 0xad]))]).unwrap();
        assert_eq!(&data[..4], &id("execute(address,uint256,bytes)")[..]);
    }

    #[test]
    fn many_calls_use_execute_batch() {
        let calls = vec![
            (Address::repeat_byte(1), Bytes::from(vec![1])),
            (Address::repeat_byte(2), Bytes::from(vec![2])),
        ];
        let data = account_call_data(&calls).unwrap();
        assert_eq!(&data[..4], &id("executeBatch(address[],bytes[])")[..]);
        assert!(account_call_data(&[]).is_err());
    }
}
