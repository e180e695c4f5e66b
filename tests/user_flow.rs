//! End-to-end submission pipeline tests against an in-process stub JSON-RPC
//! server. One stub serves the chain node, the bundler methods and the
//! paymaster endpoint; tests assert on the order and content of the calls it
//! receives.

use aa_wallet::paymaster::PaymasterMiddleware;
use aa_wallet::{Client, Error, SendOptions, SimpleAccount, UserOperation, VerifyingPaymaster};
use ethers::types::{Address, Bytes, U256};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const OWNER_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
const ENTRY_POINT: &str = "0x5ff137d4b0fdcd49dca30c7cf57e578a026d2789";
const FACTORY: &str = "0x9406cc6185a346906296840746125a0e44976454";
const SENDER: &str = "0x9fd042a18e90ce326073fa70f111dc9d798d9a52";
const TOKEN: &str = "0x658e5ea3c7690f0626aff87ced6fc30021a93657";
const USER_OP_HASH: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";
const TX_HASH: &str = "0x2222222222222222222222222222222222222222222222222222222222222222";
const PM_DATA: &str = "0xdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef";

enum Reply {
    Result(Value),
    Error(Value),
}

type Dispatcher = Arc<dyn Fn(&str, &Value) -> Reply + Send + Sync>;

struct Stub {
    url: String,
    /// Method names in arrival order ("on_build" entries are pushed by test
    /// hooks to assert ordering against network traffic).
    calls: Arc<Mutex<Vec<String>>>,
}

impl Stub {
    fn call_index(&self, method: &str) -> Option<usize> {
        self.calls.lock().unwrap().iter().position(|m| m == method)
    }

    fn call_count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.as_str() == method)
            .count()
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn serve_connection(mut sock: tokio::net::TcpStream, dispatch: Dispatcher, calls: Arc<Mutex<Vec<String>>>) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];

    let header_end = loop {
        match sock.read(&mut tmp).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
        }
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length: usize = headers
        .lines()
        .find_map(|l| {
            let (k, v) = l.split_once(':')?;
            if k.eq_ignore_ascii_case("content-length") {
                v.trim().parse().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        match sock.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
        }
    }

    let body: Value =
        serde_json::from_slice(&buf[header_end..header_end + content_length]).unwrap_or(Value::Null);
    let method = body["method"].as_str().unwrap_or("").to_string();
    let id = body["id"].clone();

    calls.lock().unwrap().push(method.clone());

    let resp_body = match dispatch(&method, &body["params"]) {
        Reply::Result(r) => json!({ "jsonrpc": "2.0", "id": id, "result": r }),
        Reply::Error(e) => json!({ "jsonrpc": "2.0", "id": id, "error": e }),
    };
    let payload = resp_body.to_string();
    let resp = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
        payload.len()
    );
    let _ = sock.write_all(resp.as_bytes()).await;
    let _ = sock.shutdown().await;
}

async fn spawn_stub(dispatch: Dispatcher) -> Stub {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let calls: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let calls_srv = calls.clone();
    tokio::spawn(async move {
        loop {
            let Ok((sock, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(serve_connection(sock, dispatch.clone(), calls_srv.clone()));
        }
    });

    Stub {
        url: format!("http://{addr}"),
        calls,
    }
}

fn word_address(addr: &str) -> String {
    format!("0x{}{}", "0".repeat(24), &addr.to_lowercase()[2..])
}

fn word_u64(v: u64) -> String {
    format!("0x{v:064x}")
}

/// Chain + bundler + paymaster behavior of a healthy deployment: account is
/// undeployed, next nonce is 7, estimation succeeds, sponsorship succeeds,
/// submission returns a hash, the receipt is available immediately.
fn healthy_dispatcher() -> Dispatcher {
    Arc::new(|method, params| match method {
        "eth_chainId" => Reply::Result(json!("0x7a69")),
        "eth_call" => {
            let to = params[0]["to"].as_str().unwrap_or("").to_lowercase();
            if to == FACTORY {
                Reply::Result(json!(word_address(SENDER)))
            } else if to == ENTRY_POINT {
                Reply::Result(json!(word_u64(7)))
            } else {
                Reply::Error(json!({ "code": -32000, "message": "unexpected eth_call target" }))
            }
        }
        "eth_getCode" => Reply::Result(json!("0x")),
        "eth_gasPrice" => Reply::Result(json!("0x3b9aca00")),
        "eth_estimateUserOperationGas" => Reply::Result(json!({
            "callGasLimit": "0x5208",
            "verificationGasLimit": "0x186a0",
            "preVerificationGas": "0xac44",
        })),
        "pm_sponsorUserOperation" => Reply::Result(json!({ "paymasterAndData": PM_DATA })),
        "eth_sendUserOperation" => Reply::Result(json!(USER_OP_HASH)),
        "eth_getUserOperationReceipt" => {
            Reply::Result(json!({ "receipt": { "transactionHash": TX_HASH } }))
        }
        _ => Reply::Error(json!({ "code": -32601, "message": "method not found" })),
    })
}

fn entry_point() -> Address {
    Address::from_str(ENTRY_POINT).unwrap()
}

fn factory() -> Address {
    Address::from_str(FACTORY).unwrap()
}

async fn init_account(stub: &Stub, paymaster: Option<Arc<dyn PaymasterMiddleware>>) -> SimpleAccount {
    SimpleAccount::init(OWNER_KEY, &stub.url, entry_point(), factory(), paymaster)
        .await
        .unwrap()
}

fn transfer_draft(account: &SimpleAccount) -> UserOperation {
    account
        .execute(
            Address::from_str(TOKEN).unwrap(),
            U256::zero(),
            Bytes::from_str("0xb61d27f6").unwrap(),
        )
        .unwrap()
}

#[tokio::test]
async fn submit_sponsors_after_estimation_and_fires_on_build_before_send() {
    let stub = spawn_stub(healthy_dispatcher()).await;

    let pm: Arc<dyn PaymasterMiddleware> = Arc::new(VerifyingPaymaster::pay_as_you_go(&stub.url));
    let account = init_account(&stub, Some(pm)).await;
    assert_eq!(account.sender(), Address::from_str(SENDER).unwrap());
    assert!(!account.is_deployed());

    let client = Client::connect(&stub.url, entry_point()).await.unwrap();

    let built: Arc<Mutex<Option<UserOperation>>> = Arc::new(Mutex::new(None));
    let built_hook = built.clone();
    let calls_hook = stub.calls.clone();
    let opts = SendOptions::default().with_on_build(move |op| {
        calls_hook.lock().unwrap().push("on_build".to_string());
        *built_hook.lock().unwrap() = Some(op.clone());
    });

    let draft = transfer_draft(&account);
    let pending = client.submit(&account, draft, opts).await.unwrap();

    assert_eq!(
        format!("{:#x}", pending.user_op_hash()),
        USER_OP_HASH.to_string()
    );

    // The hook observed the final payload: signed, sponsored, nonce resolved,
    // counterfactual init code attached.
    let op = built.lock().unwrap().clone().expect("on_build did not fire");
    assert!(op.is_signed());
    assert_eq!(op.signature.len(), 65);
    assert_eq!(op.nonce, U256::from(7u64));
    assert_eq!(op.call_gas_limit, U256::from(21_000u64));
    assert_eq!(op.verification_gas_limit, U256::from(100_000u64));
    assert_eq!(op.pre_verification_gas, U256::from(44_100u64));
    assert!(!op.paymaster_and_data.is_empty());
    assert_eq!(&op.init_code[..20], Address::from_str(FACTORY).unwrap().as_bytes());

    // Pipeline ordering: estimate, then sponsor, then the hook, then send.
    let estimate = stub.call_index("eth_estimateUserOperationGas").unwrap();
    let sponsor = stub.call_index("pm_sponsorUserOperation").unwrap();
    let on_build = stub.call_index("on_build").unwrap();
    let send = stub.call_index("eth_sendUserOperation").unwrap();
    assert!(estimate < sponsor, "sponsorship must cover final gas fields");
    assert!(sponsor < on_build);
    assert!(on_build < send, "on_build must fire before submission");

    let tx_hash = pending.wait().await.unwrap();
    assert_eq!(format!("{:#x}", tx_hash.unwrap()), TX_HASH.to_string());
}

#[tokio::test]
async fn sponsorship_is_requested_fresh_when_gas_fields_change() {
    // Each estimation revises preVerificationGas, so the two prepared
    // operations differ only in that field.
    let estimates = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let dispatch: Dispatcher = {
        let healthy = healthy_dispatcher();
        let estimates = estimates.clone();
        Arc::new(move |method, params| {
            if method == "eth_estimateUserOperationGas" {
                let n = estimates.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Reply::Result(json!({
                    "callGasLimit": "0x5208",
                    "verificationGasLimit": "0x186a0",
                    "preVerificationGas": format!("0x{:x}", 0xac44 + n),
                }))
            } else {
                healthy(method, params)
            }
        })
    };
    let stub = spawn_stub(dispatch).await;

    let pm: Arc<dyn PaymasterMiddleware> = Arc::new(VerifyingPaymaster::pay_as_you_go(&stub.url));
    let account = init_account(&stub, Some(pm)).await;
    let client = Client::connect(&stub.url, entry_point()).await.unwrap();

    let first = client
        .prepare(&account, transfer_draft(&account), &SendOptions::default())
        .await
        .unwrap();
    let second = client
        .prepare(&account, transfer_draft(&account), &SendOptions::default())
        .await
        .unwrap();

    assert_ne!(first.pre_verification_gas, second.pre_verification_gas);
    // Sponsorship data is bound to the exact field values it was computed
    // over, so every pipeline run asks the service again; nothing is cached.
    assert_eq!(stub.call_count("pm_sponsorUserOperation"), 2);
}

#[tokio::test]
async fn declined_sponsorship_aborts_before_submission() {
    let dispatch: Dispatcher = {
        let healthy = healthy_dispatcher();
        Arc::new(move |method, params| {
            if method == "pm_sponsorUserOperation" {
                Reply::Error(json!({ "code": -32500, "message": "policy rejected" }))
            } else {
                healthy(method, params)
            }
        })
    };
    let stub = spawn_stub(dispatch).await;

    let pm: Arc<dyn PaymasterMiddleware> = Arc::new(VerifyingPaymaster::pay_as_you_go(&stub.url));
    let account = init_account(&stub, Some(pm)).await;
    let client = Client::connect(&stub.url, entry_point()).await.unwrap();

    let err = client
        .submit(&account, transfer_draft(&account), SendOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Unsponsored(_)));
    assert_eq!(
        stub.call_count("eth_sendUserOperation"),
        0,
        "an unsponsored operation must never reach the entry point"
    );
}

#[tokio::test]
async fn entry_point_rejection_surfaces_revert_reason() {
    // Unsponsored account against a policy that requires sponsorship: the
    // entry point refuses at simulation, it never silently succeeds.
    let dispatch: Dispatcher = {
        let healthy = healthy_dispatcher();
        Arc::new(move |method, params| {
            if method == "eth_sendUserOperation" {
                Reply::Error(json!({ "code": -32500, "message": "AA21 didn't pay prefund" }))
            } else {
                healthy(method, params)
            }
        })
    };
    let stub = spawn_stub(dispatch).await;

    let account = init_account(&stub, None).await;
    let client = Client::connect(&stub.url, entry_point()).await.unwrap();

    let err = client
        .submit(&account, transfer_draft(&account), SendOptions::default())
        .await
        .unwrap_err();

    match err {
        Error::RejectedBySimulation(msg) => assert!(msg.contains("AA21")),
        other => panic!("expected RejectedBySimulation, got {other:?}"),
    }
}

#[tokio::test]
async fn wait_returns_none_when_no_receipt_within_window() {
    let dispatch: Dispatcher = {
        let healthy = healthy_dispatcher();
        Arc::new(move |method, params| {
            if method == "eth_getUserOperationReceipt" {
                Reply::Result(Value::Null)
            } else {
                healthy(method, params)
            }
        })
    };
    let stub = spawn_stub(dispatch).await;

    let account = init_account(&stub, None).await;
    let client = Client::connect(&stub.url, entry_point()).await.unwrap();

    let opts = SendOptions {
        wait_timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let pending = client
        .submit(&account, transfer_draft(&account), opts)
        .await
        .unwrap();

    let outcome = pending.wait().await.unwrap();
    assert_eq!(outcome, None, "timeout is not an error");
}

#[tokio::test]
async fn execute_leaves_sender_state_alone_and_overrides_apply() {
    let stub = spawn_stub(healthy_dispatcher()).await;
    let mut account = init_account(&stub, None).await;

    let established = account.sender();
    let _ = transfer_draft(&account);
    assert_eq!(account.sender(), established);

    let override_addr = Address::from_str("0x858e244b392a566af387a27798d2b4a73d367ca3").unwrap();
    account.set_sender(override_addr);
    assert_eq!(account.sender(), override_addr);
    assert_eq!(transfer_draft(&account).sender, override_addr);
}

#[tokio::test]
async fn external_signature_bypasses_owner_signing() {
    let stub = spawn_stub(healthy_dispatcher()).await;

    let mut account = init_account(&stub, None).await;
    let external_sig = account
        .sign_message("I confirm that I am the owner of this address.")
        .await
        .unwrap();
    account.set_signature(external_sig.to_vec());
    account.set_sender(account.owner_address());
    assert!(account.is_externally_authorized());

    let client = Client::connect(&stub.url, entry_point()).await.unwrap();

    let built: Arc<Mutex<Option<UserOperation>>> = Arc::new(Mutex::new(None));
    let built_hook = built.clone();
    let opts =
        SendOptions::default().with_on_build(move |op| *built_hook.lock().unwrap() = Some(op.clone()));

    client
        .submit(&account, transfer_draft(&account), opts)
        .await
        .unwrap();

    let op = built.lock().unwrap().clone().unwrap();
    assert_eq!(op.signature, Bytes::from(external_sig.to_vec()));
    assert_eq!(op.sender, account.owner_address());
}

#[tokio::test]
async fn deployed_account_skips_init_code() {
    let dispatch: Dispatcher = {
        let healthy = healthy_dispatcher();
        Arc::new(move |method, params| {
            if method == "eth_getCode" {
                Reply::Result(json!("0x6080604052"))
            } else {
                healthy(method, params)
            }
        })
    };
    let stub = spawn_stub(dispatch).await;

    let account = init_account(&stub, None).await;
    assert!(account.is_deployed());
    assert!(transfer_draft(&account).init_code.is_empty());
}

#[tokio::test]
async fn malformed_owner_key_fails_init() {
    let stub = spawn_stub(healthy_dispatcher()).await;
    let err = SimpleAccount::init("not-a-key", &stub.url, entry_point(), factory(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidKey(_)));
}

#[tokio::test]
async fn unreachable_endpoint_is_a_network_error() {
    // Port 9 is discard; nothing listens there in the test environment.
    let err = Client::connect("http://127.0.0.1:9", entry_point())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Network(_)));
}
