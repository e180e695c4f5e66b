use crate::encoding::parse_address;
use crate::error::{Error, Result};
use ethers::types::Address;
use std::env;

/// Canonical EntryPoint v0.6 deployment.
pub const ENTRY_POINT_ADDRESS: &str = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789";

/// Canonical SimpleAccountFactory for EntryPoint v0.6.
pub const SIMPLE_ACCOUNT_FACTORY_ADDRESS: &str = "0x9406Cc6185a346906296840746125a0E44976454";

pub const RPC_URL_VAR: &str = "AA_WALLET_RPC_URL";
pub const PAYMASTER_URL_VAR: &str = "AA_WALLET_PAYMASTER_URL";
pub const ENTRY_POINT_VAR: &str = "AA_WALLET_ENTRYPOINT";
pub const FACTORY_VAR: &str = "AA_WALLET_FACTORY";
pub const OWNER_KEY_VAR: &str = "AA_WALLET_OWNER_KEY";

/// Endpoint and address configuration, resolved once at startup.
///
/// The owner key is deliberately not part of this struct; it is supplied by
/// the identity collaborator at session start and lives only inside the
/// account handle.
#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_url: String,
    /// Absent means operations go out unsponsored.
    pub paymaster_url: Option<String>,
    pub entry_point: Address,
    pub factory: Address,
}

impl Config {
    /// Reads the environment; a missing RPC endpoint or an unparseable
    /// address is fatal immediately, before any operation is attempted.
    pub fn from_env() -> Result<Self> {
        let rpc_url = env::var(RPC_URL_VAR).map_err(|_| Error::ConfigMissing(RPC_URL_VAR))?;
        let paymaster_url = env::var(PAYMASTER_URL_VAR).ok().filter(|s| !s.is_empty());

        let entry_point = parse_address(
            &env::var(ENTRY_POINT_VAR).unwrap_or_else(|_| ENTRY_POINT_ADDRESS.to_string()),
            "entry_point",
        )?;
        let factory = parse_address(
            &env::var(FACTORY_VAR).unwrap_or_else(|_| SIMPLE_ACCOUNT_FACTORY_ADDRESS.to_string()),
            "factory",
        )?;

        Ok(Self {
            rpc_url,
            paymaster_url,
            entry_point,
            factory,
        })
    }

    /// The paymaster endpoint, required because sponsorship was requested.
    pub fn require_paymaster_url(&self) -> Result<&str> {
        self.paymaster_url
            .as_deref()
            .ok_or(Error::ConfigMissing(PAYMASTER_URL_VAR))
    }
}
