use crate::error::{Error, Result};
use crate::paymaster::PaymasterMiddleware;
use crate::types::UserOperation;
use ethers::{
    abi::{AbiParser, Token},
    contract::Contract,
    providers::{Http, Middleware, Provider},
    signers::{LocalWallet, Signer},
    types::{Address, Bytes, Signature, U256},
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Placeholder signature used for gas estimation before the real one exists.
const DUMMY_SIGNATURE_LEN: usize = 65;

/// Session-scoped handle for an ERC-4337 SimpleAccount.
///
/// Owns the owner signing key for the lifetime of the session; `logout`
/// consumes the handle and discards the key (the underlying scalar is erased
/// from memory on drop). Nothing here is ever written to persistent storage.
///
/// `set_sender`/`set_signature` switch the handle into the
/// externally-authorized mode: the submission pipeline then attaches the
/// stored signature verbatim instead of signing with the owner key, and
/// performs no validation of it. The entry point is the sole judge of whether
/// such a signature is acceptable.
#[derive(Debug)]
pub struct SimpleAccount {
    owner: LocalWallet,
    provider: Arc<Provider<Http>>,
    entry_point: Address,
    factory: Address,
    salt: U256,
    chain_id: u64,
    sender: Address,
    deployed: bool,
    init_code: Bytes,
    signature: Bytes,
    externally_authorized: bool,
    paymaster: Option<Arc<dyn PaymasterMiddleware>>,
}

impl SimpleAccount {
    /// Resolves the counterfactual account for `owner_key` with salt 0.
    pub async fn init(
        owner_key: &str,
        rpc_url: &str,
        entry_point: Address,
        factory: Address,
        paymaster: Option<Arc<dyn PaymasterMiddleware>>,
    ) -> Result<Self> {
        Self::init_with_salt(owner_key, rpc_url, entry_point, factory, paymaster, U256::zero())
            .await
    }

    /// Resolves the account address via `factory.getAddress(owner, salt)`,
    /// probes `eth_getCode` for deployment, and precomputes the `initCode`
    /// that deploys the account atomically with its first operation.
    pub async fn init_with_salt(
        owner_key: &str,
        rpc_url: &str,
        entry_point: Address,
        factory: Address,
        paymaster: Option<Arc<dyn PaymasterMiddleware>>,
        salt: U256,
    ) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| Error::Network(e.to_string()))?
            .interval(Duration::from_millis(350));
        let provider = Arc::new(provider);

        let chain_id = provider.get_chainid().await?.as_u64();

        let wallet = LocalWallet::from_str(owner_key)
            .map_err(|e| Error::InvalidKey(e.to_string()))?
            .with_chain_id(chain_id);
        let owner = wallet.address();

        let factory_abi = AbiParser::default()
            .parse(&["function getAddress(address owner, uint256 salt) view returns (address)"])
            .map_err(|e| Error::Abi(e.to_string()))?;
        let factory_c = Contract::new(factory, factory_abi, provider.clone());
        let sender: Address = factory_c
            .method("getAddress", (owner, salt))
            .map_err(|e| Error::Abi(e.to_string()))?
            .call()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let code = provider.get_code(sender, None).await?;
        let deployed = !code.as_ref().is_empty();

        let init_code = if deployed {
            Bytes::default()
        } else {
            build_init_code(factory, owner, salt)?
        };

        tracing::debug!(
            sender = %sender,
            deployed,
            chain_id,
            "smart account resolved"
        );

        Ok(Self {
            owner: wallet,
            provider,
            entry_point,
            factory,
            salt,
            chain_id,
            sender,
            deployed,
            init_code,
            signature: Bytes::from(vec![0u8; DUMMY_SIGNATURE_LEN]),
            externally_authorized: false,
            paymaster,
        })
    }

    /// Encodes a single call through `SimpleAccount.execute(dest, value, func)`
    /// and returns a draft operation with empty signature and paymaster data.
    ///
    /// Pure: repeated calls with identical inputs build identical drafts. The
    /// nonce is resolved by the submission pipeline at send time.
    pub fn execute(&self, to: Address, value: U256, data: Bytes) -> Result<UserOperation> {
        let abi = AbiParser::default()
            .parse(&["function execute(address dest, uint256 value, bytes func)"])
            .map_err(|e| Error::Abi(e.to_string()))?;
        let call_data = abi
            .function("execute")
            .map_err(|e| Error::Abi(e.to_string()))?
            .encode_input(&[
                Token::Address(to),
                Token::Uint(value),
                Token::Bytes(data.to_vec()),
            ])
            .map_err(|e| Error::Abi(e.to_string()))?;

        Ok(UserOperation {
            sender: self.sender,
            nonce: U256::zero(),
            init_code: self.init_code.clone(),
            call_data: Bytes::from(call_data),
            ..UserOperation::default()
        })
    }

    /// Next expected nonce from `entryPoint.getNonce(sender, 0)`.
    ///
    /// Callers building concurrent operations against one account must
    /// serialize nonce acquisition themselves; colliding nonces get one of
    /// the operations rejected by the entry point.
    pub async fn fetch_nonce(&self) -> Result<U256> {
        let abi = AbiParser::default()
            .parse(&["function getNonce(address sender, uint192 key) view returns (uint256)"])
            .map_err(|e| Error::Abi(e.to_string()))?;
        let entry_point = Contract::new(self.entry_point, abi, self.provider.clone());
        entry_point
            .method::<_, U256>("getNonce", (self.sender, U256::zero()))
            .map_err(|e| Error::Abi(e.to_string()))?
            .call()
            .await
            .map_err(|e| Error::Network(e.to_string()))
    }

    /// Signs the operation's v0.6 hash as an Ethereum personal message, the
    /// owner check SimpleAccount performs on-chain.
    pub async fn sign_user_op(
        &self,
        op: &UserOperation,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<Bytes> {
        let hash = op.hash(entry_point, U256::from(chain_id));
        let sig = self
            .owner
            .sign_message(hash.as_bytes())
            .await
            .map_err(|e| Error::InvalidKey(e.to_string()))?;
        Ok(Bytes::from(sig.to_vec()))
    }

    /// Personal-message signature with the owner key (used by the
    /// externally-authorized flow to establish ownership off-chain).
    pub async fn sign_message(&self, message: &str) -> Result<Signature> {
        self.owner
            .sign_message(message.as_bytes())
            .await
            .map_err(|e| Error::InvalidKey(e.to_string()))
    }

    pub fn sender(&self) -> Address {
        self.sender
    }

    /// Overrides the computed sender. The caller takes responsibility for the
    /// address being authorized for the attached signature.
    pub fn set_sender(&mut self, sender: Address) {
        self.sender = sender;
    }

    pub fn signature(&self) -> Bytes {
        self.signature.clone()
    }

    /// Attaches an externally-produced signature and disables the builder's
    /// own signing step for subsequent submissions. No validation is
    /// performed; a signature the account does not accept surfaces later as a
    /// simulation rejection.
    pub fn set_signature(&mut self, signature: impl Into<Bytes>) {
        self.signature = signature.into();
        self.externally_authorized = true;
    }

    pub fn is_externally_authorized(&self) -> bool {
        self.externally_authorized
    }

    pub fn is_deployed(&self) -> bool {
        self.deployed
    }

    pub fn owner_address(&self) -> Address {
        self.owner.address()
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    pub fn factory(&self) -> Address {
        self.factory
    }

    pub fn salt(&self) -> U256 {
        self.salt
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn paymaster(&self) -> Option<Arc<dyn PaymasterMiddleware>> {
        self.paymaster.clone()
    }

    /// Ends the session. The owner key is dropped here and must not be
    /// retained anywhere else; the signing scalar zeroes itself on drop.
    pub fn logout(self) {
        tracing::debug!(sender = %self.sender, "session closed, owner key discarded");
        drop(self.owner);
    }
}

/// `factory ++ createAccount(owner, salt)` calldata; the entry point runs
/// this before the first operation of an undeployed account.
fn build_init_code(factory: Address, owner: Address, salt: U256) -> Result<Bytes> {
    let abi = AbiParser::default()
        .parse(&["function createAccount(address owner, uint256 salt) returns (address)"])
        .map_err(|e| Error::Abi(e.to_string()))?;
    let create_calldata = abi
        .function("createAccount")
        .map_err(|e| Error::Abi(e.to_string()))?
        .encode_input(&[Token::Address(owner), Token::Uint(salt)])
        .map_err(|e| Error::Abi(e.to_string()))?;

    let mut v = Vec::with_capacity(20 + create_calldata.len());
    v.extend_from_slice(factory.as_bytes());
    v.extend_from_slice(&create_calldata);
    Ok(Bytes::from(v))
}

/// Encodes an ERC-20 `approve(spender, amount)` call for use as the inner
/// call of `execute`.
pub fn encode_erc20_approve(spender: Address, amount: U256) -> Result<Bytes> {
    let abi = AbiParser::default()
        .parse(&["function approve(address spender, uint256 amount) returns (bool)"])
        .map_err(|e| Error::Abi(e.to_string()))?;
    let calldata = abi
        .function("approve")
        .map_err(|e| Error::Abi(e.to_string()))?
        .encode_input(&[Token::Address(spender), Token::Uint(amount)])
        .map_err(|e| Error::Abi(e.to_string()))?;
    Ok(Bytes::from(calldata))
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
    const FACTORY: &str = "0x9406Cc6185a346906296840746125a0E44976454";

    #[test]
    fn init_code_is_factory_then_create_calldata() {
        let factory = Address::from_str(FACTORY).unwrap();
        let owner = Address::from_str(OWNER).unwrap();
        let init_code = build_init_code(factory, owner, U256::zero()).unwrap();

        assert_eq!(&init_code[..20], factory.as_bytes());
        // createAccount(address,uint256) selector.
        assert_eq!(&init_code[20..24], &[0x5f, 0xbf, 0xb9, 0xcf]);
        // Two 32-byte arguments follow the selector.
        assert_eq!(init_code.len(), 20 + 4 + 64);
        assert_eq!(&init_code[24 + 12..24 + 32], owner.as_bytes());
    }

    #[test]
    fn approve_calldata_layout() {
        let spender = Address::from_str("0xf310532A8Ce07C78931c7340044C110A3d91CAaE").unwrap();
        let data = encode_erc20_approve(spender, U256::from(10u64) * U256::exp10(18)).unwrap();
        // approve(address,uint256) selector.
        assert_eq!(&data[..4], &[0x09, 0x5e, 0xa7, 0xb3]);
        assert_eq!(data.len(), 4 + 64);
        assert_eq!(&data[4 + 12..4 + 32], spender.as_bytes());
    }
}
