use aa_wallet::account::encode_erc20_approve;
use aa_wallet::config::{ENTRY_POINT_ADDRESS, SIMPLE_ACCOUNT_FACTORY_ADDRESS};
use aa_wallet::encoding::{fmt_address, fmt_h256, parse_address, parse_bytes, parse_u256};
use aa_wallet::paymaster::PaymasterMiddleware;
use aa_wallet::permit::PermitParams;
use aa_wallet::{sign_permit, Client, SendOptions, SimpleAccount, UserOperation, VerifyingPaymaster};
use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::U256;
use rand::rngs::OsRng;
use rand::RngCore;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "aa-wallet", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the smart account address and deployment status.
    Account(AccountArgs),

    /// Send a single call through the smart account as a UserOperation.
    Send(SendArgs),

    /// Approve an ERC-20 spender through the smart account.
    Approve(ApproveArgs),

    /// Sign an EIP-712 token permit and print the signature components.
    Permit(PermitArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Chain RPC URL. Must support the ERC-4337 JSON-RPC methods for
    /// `send`/`approve`.
    #[arg(long, env = "AA_WALLET_RPC_URL")]
    rpc: String,

    /// EntryPoint address.
    #[arg(long, env = "AA_WALLET_ENTRYPOINT", default_value = ENTRY_POINT_ADDRESS)]
    entrypoint: String,

    /// SimpleAccountFactory address.
    #[arg(long, env = "AA_WALLET_FACTORY", default_value = SIMPLE_ACCOUNT_FACTORY_ADDRESS)]
    factory: String,

    /// Smart account owner private key, as handed over by the identity
    /// provider. Recommended: set via env var AA_WALLET_OWNER_KEY.
    #[arg(long, env = "AA_WALLET_OWNER_KEY")]
    owner_key: Option<String>,

    /// Generate a throwaway owner key for this invocation.
    ///
    /// The key lives only for the lifetime of the process and is never
    /// written anywhere.
    #[arg(long, default_value_t = false)]
    new_owner: bool,

    /// CREATE2 salt for the smart account.
    #[arg(long, default_value_t = 0)]
    salt: u64,
}

#[derive(Args, Debug)]
struct TxArgs {
    /// Sponsor gas via the verifying paymaster service.
    #[arg(long, default_value_t = false)]
    sponsor_gas: bool,

    /// Paymaster RPC URL (pm_sponsorUserOperation).
    #[arg(long, env = "AA_WALLET_PAYMASTER_URL")]
    paymaster_url: Option<String>,

    /// Gas price multiplier in basis points (e.g. 15000 = 1.5x).
    #[arg(long, default_value_t = 10_000, env = "AA_WALLET_GAS_MULTIPLIER_BPS")]
    gas_multiplier_bps: u64,

    /// Build, estimate and sign only; do not send.
    #[arg(long)]
    dry_run: bool,

    /// Do not wait for the operation receipt.
    #[arg(long)]
    no_wait: bool,

    /// Max seconds to wait for the receipt. Use 0 to disable the timeout.
    #[arg(long, default_value_t = 180)]
    max_wait_seconds: u64,
}

#[derive(Args, Debug)]
struct AccountArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    tx: TxArgs,

    /// Call target address.
    #[arg(long)]
    to: String,

    /// Call value in wei.
    #[arg(long, default_value = "0")]
    value: String,

    /// Call data, hex encoded.
    #[arg(long, default_value = "0x")]
    data: String,
}

#[derive(Args, Debug)]
struct ApproveArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    tx: TxArgs,

    /// ERC-20 token address.
    #[arg(long)]
    token: String,

    /// Spender to approve.
    #[arg(long)]
    spender: String,

    /// Allowance amount in raw base units.
    #[arg(long)]
    amount: String,

    /// Externally-authorized mode: sign this message with the owner EOA and
    /// attach that signature (and the EOA as sender) to the operation instead
    /// of the normal owner-key signing. The entry point decides whether it
    /// accepts the result.
    #[arg(long)]
    authorize_with_message: Option<String>,
}

#[derive(Args, Debug)]
struct PermitArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// EIP-712 domain name of the token contract.
    #[arg(long)]
    name: String,

    /// EIP-712 domain version.
    #[arg(long, default_value = "1")]
    contract_version: String,

    /// Use the legacy salted domain (chain id folded into the salt).
    #[arg(long, default_value_t = false)]
    legacy: bool,

    /// Permit owner. Defaults to the owner key's address.
    #[arg(long)]
    owner: Option<String>,

    /// Permit spender.
    #[arg(long)]
    spender: String,

    /// Verifying token contract.
    #[arg(long)]
    verifying_contract: String,

    /// Allowance value in raw base units.
    #[arg(long)]
    value: String,

    /// Permit nonce of the owner on the token contract.
    #[arg(long, default_value = "0")]
    nonce: String,

    /// Permit deadline, unix seconds.
    #[arg(long)]
    deadline: String,

    /// Chain id. Queried from the RPC endpoint when absent.
    #[arg(long)]
    chain_id: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // Logs go to stderr so stdout stays script-friendly.
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Account(args) => cmd_account(args).await,
        Command::Send(args) => cmd_send(args).await,
        Command::Approve(args) => cmd_approve(args).await,
        Command::Permit(args) => cmd_permit(args).await,
    }
}

fn resolve_owner_key(common: &CommonArgs) -> Result<String> {
    if common.new_owner {
        let mut rng = OsRng;
        for _ in 0..64 {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            if bytes.iter().all(|b| *b == 0) {
                continue;
            }
            let pk_hex = format!("0x{}", hex::encode(bytes));
            if LocalWallet::from_str(&pk_hex).is_ok() {
                eprintln!("generated throwaway owner key (kept in memory only)");
                return Ok(pk_hex);
            }
        }
        return Err(anyhow!(
            "failed to generate a valid random private key after multiple attempts"
        ));
    }

    common
        .owner_key
        .clone()
        .ok_or_else(|| anyhow!("missing AA_WALLET_OWNER_KEY (or --owner-key), or pass --new-owner"))
}

async fn build_account(
    common: &CommonArgs,
    paymaster: Option<Arc<dyn PaymasterMiddleware>>,
) -> Result<SimpleAccount> {
    let entry_point = parse_address(&common.entrypoint, "entrypoint")?;
    let factory = parse_address(&common.factory, "factory")?;
    let owner_key = resolve_owner_key(common)?;

    let account = SimpleAccount::init_with_salt(
        &owner_key,
        &common.rpc,
        entry_point,
        factory,
        paymaster,
        U256::from(common.salt),
    )
    .await?;
    Ok(account)
}

fn build_paymaster(tx: &TxArgs) -> Result<Option<Arc<dyn PaymasterMiddleware>>> {
    if !tx.sponsor_gas {
        return Ok(None);
    }
    let url = tx.paymaster_url.clone().ok_or_else(|| {
        anyhow!("--sponsor-gas requires --paymaster-url (or AA_WALLET_PAYMASTER_URL)")
    })?;
    Ok(Some(Arc::new(VerifyingPaymaster::pay_as_you_go(url))))
}

async fn cmd_account(args: AccountArgs) -> Result<()> {
    let account = build_account(&args.common, None).await?;

    println!("chainId:       {}", account.chain_id());
    println!("entryPoint:    {}", fmt_address(account.entry_point()));
    println!("factory:       {}", fmt_address(account.factory()));
    println!("owner:         {}", fmt_address(account.owner_address()));
    println!("smartAccount:  {}", fmt_address(account.sender()));
    println!("isDeployed:    {}", account.is_deployed());

    account.logout();
    Ok(())
}

async fn cmd_send(args: SendArgs) -> Result<()> {
    let paymaster = build_paymaster(&args.tx)?;
    let account = build_account(&args.common, paymaster).await?;
    let client = Client::connect(&args.common.rpc, account.entry_point()).await?;

    let to = parse_address(&args.to, "to")?;
    let value = parse_u256(&args.value, "value")?;
    let data = parse_bytes(&args.data, "data")?;

    let draft = account.execute(to, value, data)?;
    send_and_report(&client, &account, draft, &args.tx).await?;

    account.logout();
    Ok(())
}

async fn cmd_approve(args: ApproveArgs) -> Result<()> {
    let paymaster = build_paymaster(&args.tx)?;
    let mut account = build_account(&args.common, paymaster).await?;
    let client = Client::connect(&args.common.rpc, account.entry_point()).await?;

    let token = parse_address(&args.token, "token")?;
    let spender = parse_address(&args.spender, "spender")?;
    let amount = parse_u256(&args.amount, "amount")?;

    if let Some(message) = args.authorize_with_message.as_deref() {
        let sig = account.sign_message(message).await?;
        println!("authorization signature:");
        println!("  v: {}", sig.v);
        println!("  r: 0x{:064x}", sig.r);
        println!("  s: 0x{:064x}", sig.s);
        account.set_signature(sig.to_vec());
        let owner = account.owner_address();
        account.set_sender(owner);
    }

    let approve_data = encode_erc20_approve(spender, amount)?;
    let draft = account.execute(token, U256::zero(), approve_data)?;
    send_and_report(&client, &account, draft, &args.tx).await?;

    account.logout();
    Ok(())
}

async fn cmd_permit(args: PermitArgs) -> Result<()> {
    let owner_key = resolve_owner_key(&args.common)?;
    let wallet =
        LocalWallet::from_str(&owner_key).map_err(|e| anyhow!("invalid owner key: {e}"))?;

    let chain_id = match args.chain_id {
        Some(id) => id,
        None => {
            let entry_point = parse_address(&args.common.entrypoint, "entrypoint")?;
            Client::connect(&args.common.rpc, entry_point).await?.chain_id()
        }
    };

    let owner = match args.owner.as_deref() {
        Some(s) => parse_address(s, "owner")?,
        None => wallet.address(),
    };

    let permit = PermitParams {
        owner,
        spender: parse_address(&args.spender, "spender")?,
        value: parse_u256(&args.value, "value")?,
        nonce: parse_u256(&args.nonce, "nonce")?,
        deadline: parse_u256(&args.deadline, "deadline")?,
    };
    let verifying_contract = parse_address(&args.verifying_contract, "verifying_contract")?;

    let sig = sign_permit(
        &args.name,
        &args.contract_version,
        args.legacy,
        &permit,
        verifying_contract,
        U256::from(chain_id),
        &owner_key,
    )?;

    println!("v: {}", sig.v);
    println!("r: 0x{:064x}", sig.r);
    println!("s: 0x{:064x}", sig.s);
    println!("signature: 0x{}", hex::encode(sig.to_vec()));

    Ok(())
}

async fn send_and_report(
    client: &Client,
    account: &SimpleAccount,
    draft: UserOperation,
    tx: &TxArgs,
) -> Result<()> {
    let opts = SendOptions {
        gas_multiplier_bps: tx.gas_multiplier_bps,
        wait_timeout: Duration::from_secs(tx.max_wait_seconds),
        ..Default::default()
    }
    .with_on_build(|op| {
        println!(
            "UserOperation (final):\n{}",
            serde_json::to_string_pretty(op).unwrap_or_default()
        );
    });

    if tx.dry_run {
        let _op = client.prepare(account, draft, &opts).await?;
        println!("\n--dry-run set: not sending user operation.");
        return Ok(());
    }

    let pending = client.submit(account, draft, opts).await?;
    println!("\nuserOpHash: {}", fmt_h256(pending.user_op_hash()));

    if tx.no_wait {
        println!("--no-wait set: not waiting for receipt.");
        return Ok(());
    }

    println!("waiting for transaction...");
    match pending.wait().await? {
        Some(tx_hash) => println!("transaction hash: {}", fmt_h256(tx_hash)),
        None => println!("transaction hash: null (no receipt within the polling window)"),
    }

    Ok(())
}
