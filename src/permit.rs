use crate::encoding::minimal_be_bytes;
use crate::error::{Error, Result};
use ethers::{
    abi::{encode, Token},
    signers::LocalWallet,
    types::{Address, Signature, H256, U256},
    utils::keccak256,
};
use std::str::FromStr;

const DOMAIN_TYPE_CURRENT: &str =
    "EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";
const DOMAIN_TYPE_LEGACY: &str =
    "EIP712Domain(string name,string version,address verifyingContract,bytes32 salt)";
const PERMIT_TYPE: &str =
    "Permit(address owner,address spender,uint256 value,uint256 nonce,uint256 deadline)";

/// EIP-712 domain for permit signing.
///
/// The two shapes are never mixed within one signature: `Current` relies on
/// the default field ordering `(name, version, chainId, verifyingContract)`,
/// `Legacy` carries the chain id as a domain salt instead, with the explicit
/// field ordering `(name, version, verifyingContract, salt)` used by older
/// salted-domain tokens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DomainVariant {
    Current {
        name: String,
        version: String,
        chain_id: U256,
        verifying_contract: Address,
    },
    Legacy {
        name: String,
        version: String,
        verifying_contract: Address,
        salt: H256,
    },
}

impl DomainVariant {
    pub fn current(
        name: impl Into<String>,
        version: impl Into<String>,
        chain_id: U256,
        verifying_contract: Address,
    ) -> Self {
        DomainVariant::Current {
            name: name.into(),
            version: version.into(),
            chain_id,
            verifying_contract,
        }
    }

    /// Legacy salted domain: `salt = keccak256(minimal-big-endian(chain_id))`.
    pub fn legacy(
        name: impl Into<String>,
        version: impl Into<String>,
        chain_id: U256,
        verifying_contract: Address,
    ) -> Self {
        DomainVariant::Legacy {
            name: name.into(),
            version: version.into(),
            verifying_contract,
            salt: H256::from(keccak256(minimal_be_bytes(chain_id))),
        }
    }

    pub fn separator(&self) -> H256 {
        let encoded = match self {
            DomainVariant::Current {
                name,
                version,
                chain_id,
                verifying_contract,
            } => encode(&[
                Token::FixedBytes(keccak256(DOMAIN_TYPE_CURRENT).to_vec()),
                Token::FixedBytes(keccak256(name.as_bytes()).to_vec()),
                Token::FixedBytes(keccak256(version.as_bytes()).to_vec()),
                Token::Uint(*chain_id),
                Token::Address(*verifying_contract),
            ]),
            DomainVariant::Legacy {
                name,
                version,
                verifying_contract,
                salt,
            } => encode(&[
                Token::FixedBytes(keccak256(DOMAIN_TYPE_LEGACY).to_vec()),
                Token::FixedBytes(keccak256(name.as_bytes()).to_vec()),
                Token::FixedBytes(keccak256(version.as_bytes()).to_vec()),
                Token::Address(*verifying_contract),
                Token::FixedBytes(salt.as_bytes().to_vec()),
            ]),
        };
        H256::from(keccak256(encoded))
    }
}

/// The message authorizing a token spending allowance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermitParams {
    pub owner: Address,
    pub spender: Address,
    pub value: U256,
    pub nonce: U256,
    pub deadline: U256,
}

impl PermitParams {
    /// keccak256 of the ABI-encoded `Permit` struct, field order
    /// `owner, spender, value, nonce, deadline`. The numeric fields encode as
    /// 32-byte big-endian words.
    pub fn struct_hash(&self) -> H256 {
        let encoded = encode(&[
            Token::FixedBytes(keccak256(PERMIT_TYPE).to_vec()),
            Token::Address(self.owner),
            Token::Address(self.spender),
            Token::Uint(self.value),
            Token::Uint(self.nonce),
            Token::Uint(self.deadline),
        ]);
        H256::from(keccak256(encoded))
    }
}

/// `keccak256("\x19\x01" || domainSeparator || structHash)`.
pub fn permit_digest(domain: &DomainVariant, permit: &PermitParams) -> H256 {
    let mut buf = Vec::with_capacity(2 + 32 + 32);
    buf.extend_from_slice(b"\x19\x01");
    buf.extend_from_slice(domain.separator().as_bytes());
    buf.extend_from_slice(permit.struct_hash().as_bytes());
    H256::from(keccak256(buf))
}

/// Signs a permit for the given domain with a raw hex owner key.
///
/// Deterministic: identical inputs always produce the identical `(v, r, s)`.
pub fn sign_permit_with_domain(
    domain: &DomainVariant,
    permit: &PermitParams,
    owner_key: &str,
) -> Result<Signature> {
    let wallet = LocalWallet::from_str(owner_key).map_err(|e| Error::InvalidKey(e.to_string()))?;
    let digest = permit_digest(domain, permit);
    wallet
        .sign_hash(digest)
        .map_err(|e| Error::InvalidKey(e.to_string()))
}

/// Builds the domain from the `legacy` flag and signs the permit.
#[allow(clippy::too_many_arguments)]
pub fn sign_permit(
    contract_name: &str,
    contract_version: &str,
    legacy: bool,
    permit: &PermitParams,
    verifying_contract: Address,
    chain_id: U256,
    owner_key: &str,
) -> Result<Signature> {
    let domain = if legacy {
        DomainVariant::legacy(contract_name, contract_version, chain_id, verifying_contract)
    } else {
        DomainVariant::current(contract_name, contract_version, chain_id, verifying_contract)
    };
    sign_permit_with_domain(&domain, permit, owner_key)
}
