//! ERC-4337 smart-account client.
//!
//! Builds, sponsors, signs and submits UserOperations (EntryPoint v0.6) for a
//! SimpleAccount, and signs EIP-712 token permits (current and legacy salted
//! domain variants). The identity layer that produces the owner key is an
//! external collaborator; this crate treats the key as an opaque session
//! secret that is never persisted.

pub mod account;
pub mod client;
pub mod config;
pub mod encoding;
pub mod error;
pub mod paymaster;
pub mod permit;
pub mod types;

pub use account::SimpleAccount;
pub use client::{Client, GasEstimates, PendingOperation, SendOptions};
pub use config::Config;
pub use error::{Error, Result};
pub use paymaster::{PaymasterMiddleware, VerifyingPaymaster};
pub use permit::{sign_permit, sign_permit_with_domain, DomainVariant, PermitParams};
pub use types::UserOperation;
