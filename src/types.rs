use ethers::{
    abi::{encode, Token},
    types::{Address, Bytes, H256, U256},
    utils::keccak256,
};
use serde::{Deserialize, Serialize};

/// ERC-4337 UserOperation (EntryPoint v0.6 layout).
///
/// Note: EntryPoint v0.7 uses a *different* packed struct layout.
///
/// Immutable once signed: `signature` stays empty through the build phase and
/// is populated exactly once by the submission pipeline. `paymaster_and_data`
/// stays empty for unsponsored operations.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
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
    /// ABI-encodes the operation for hashing, with the dynamic byte fields
    /// replaced by their keccak256 hashes (the v0.6 `pack` convention).
    fn pack_without_signature(&self) -> Vec<u8> {
        encode(&[
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

    /// The userOpHash the v0.6 EntryPoint signs over:
    /// `keccak256(abi.encode(keccak256(pack), entryPoint, chainId))`.
    pub fn hash(&self, entry_point: Address, chain_id: U256) -> H256 {
        let encoded = encode(&[
            Token::FixedBytes(keccak256(self.pack_without_signature()).to_vec()),
            Token::Address(entry_point),
            Token::Uint(chain_id),
        ]);
        H256::from(keccak256(encoded))
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }
}
