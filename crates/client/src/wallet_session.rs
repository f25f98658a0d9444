//! Wallet Session Module
//!
//! Tracks the locally connected account and chain, and is the only
//! path through which the client asks the wallet to do anything.
//!
//! ## Role
//!
//! `WalletSession` wraps an injected [`WalletProvider`] capability. It:
//!
//! - Normalizes raw provider notifications into [`SessionChange`]s
//! - Runs the interactive requests (connect, switch account, switch chain)
//! - Provides the signer context used to send vote transactions
//!
//! A session built without a provider is a valid watch-only session:
//! every interactive call fails with [`WalletError::NoProvider`].
//!
//! ## No Retry
//!
//! Interactive requests need a confirmation in the wallet UI. A
//! rejected or failed request is terminal for that call and is never
//! retried here.
//!
//! ## Provider Error Codes
//!
//! | Code | Meaning                      | Mapped to                    |
//! |------|------------------------------|------------------------------|
//! | 4001 | User rejected the request    | `UserRejected`               |
//! | 4902 | Chain not added to wallet    | triggers `add_chain`         |
//! | *    | Anything else                | `Rpc` / `ChainSwitchFailed`  |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, info, warn};

use teapoll_common::abi;
use teapoll_common::{Account, Address, ChainId, ChainParams, Sentiment};

// ════════════════════════════════════════════════════════════════════════════
// PROVIDER SURFACE
// ════════════════════════════════════════════════════════════════════════════

/// Error object returned by the wallet provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("provider error {code}: {message}")]
pub struct ProviderError {
    pub code: i64,
    pub message: String,
}

impl ProviderError {
    pub const USER_REJECTED: i64 = 4001;
    pub const UNRECOGNIZED_CHAIN: i64 = 4902;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn user_rejected() -> Self {
        Self::new(Self::USER_REJECTED, "User rejected the request.")
    }

    pub fn is_user_rejection(&self) -> bool {
        self.code == Self::USER_REJECTED
    }
}

/// Raw notification pushed by the wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderNotification {
    /// `accountsChanged`: authorized accounts, active one first.
    AccountsChanged(Vec<String>),
    /// `chainChanged`: hex chain id.
    ChainChanged(String),
    /// Provider went away.
    Disconnected,
}

/// Transaction hash as reported by the wallet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxHash(pub String);

impl std::fmt::Display for TxHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transaction to be signed and sent by the wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    pub from: Address,
    pub to: Address,
    pub data: Vec<u8>,
}

/// Mined transaction outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub success: bool,
    /// Revert reason decoded by the wallet, when available.
    pub revert_reason: Option<String>,
}

/// Injected wallet capability (browser wallet bridge, hardware signer, mock).
///
/// ## Contract
///
/// - Methods marked interactive may prompt the user.
/// - Implementations MUST NOT retry internally.
/// - `notifications()` hands out the notification receiver once;
///   later calls return `None`.
#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// `eth_accounts`: already-authorized accounts, no prompt.
    async fn accounts(&self) -> Result<Vec<String>, ProviderError>;

    /// `eth_requestAccounts` (interactive).
    async fn request_accounts(&self) -> Result<Vec<String>, ProviderError>;

    /// `wallet_requestPermissions` for `eth_accounts` (interactive).
    async fn request_permissions(&self) -> Result<(), ProviderError>;

    /// `eth_chainId` as hex.
    async fn chain_id(&self) -> Result<String, ProviderError>;

    /// `wallet_switchEthereumChain` (interactive).
    async fn switch_chain(&self, chain_id_hex: &str) -> Result<(), ProviderError>;

    /// `wallet_addEthereumChain` (interactive).
    async fn add_chain(&self, params: &ChainParams) -> Result<(), ProviderError>;

    /// Sign and broadcast a transaction (interactive).
    async fn send_transaction(&self, tx: &TransactionRequest) -> Result<TxHash, ProviderError>;

    /// Wait until the transaction is mined.
    async fn wait_for_receipt(&self, hash: &TxHash) -> Result<TxReceipt, ProviderError>;

    /// Take the notification stream.
    fn notifications(&self) -> Option<mpsc::UnboundedReceiver<ProviderNotification>>;
}

// ════════════════════════════════════════════════════════════════════════════
// SESSION ERROR
// ════════════════════════════════════════════════════════════════════════════

/// Errors surfaced to the user from wallet-interactive actions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WalletError {
    #[error("no wallet provider found; install a browser wallet to continue")]
    NoProvider,

    #[error("request rejected in wallet")]
    UserRejected,

    #[error("could not switch wallet network: {0}")]
    ChainSwitchFailed(String),

    #[error("no account connected")]
    NoAccount,

    #[error("transaction reverted: {0}")]
    TransactionReverted(String),

    #[error("wallet error: {0}")]
    Rpc(String),
}

const GENERIC_REVERT: &str = "transaction failed";

impl From<ProviderError> for WalletError {
    fn from(e: ProviderError) -> Self {
        if e.is_user_rejection() {
            WalletError::UserRejected
        } else if e.message.contains("execution reverted") {
            WalletError::TransactionReverted(e.message)
        } else {
            WalletError::Rpc(e.message)
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// SESSION STATE
// ════════════════════════════════════════════════════════════════════════════

/// Account and chain after a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionChange {
    pub account: Option<Account>,
    pub chain_id: Option<ChainId>,
}

#[derive(Debug, Default)]
struct SessionState {
    address: Option<Address>,
    chain_id: Option<ChainId>,
}

impl SessionState {
    fn account(&self) -> Option<Account> {
        self.address
            .as_ref()
            .map(|a| Account::new(a.clone(), self.chain_id))
    }
}

/// Connected wallet account and chain.
///
/// ## Lifecycle
///
/// 1. Create with `new(provider, contract, chain)`
/// 2. `restore()` picks up an already-authorized account without prompting
/// 3. `start()` follows provider notifications in a background task
/// 4. `subscribe()` to receive [`SessionChange`]s
/// 5. `stop()` ends the background task
pub struct WalletSession {
    provider: Option<Arc<dyn WalletProvider>>,
    contract: Address,
    chain: ChainParams,
    state: RwLock<SessionState>,
    changes: broadcast::Sender<SessionChange>,
    running: AtomicBool,
    shutdown: Arc<Notify>,
}

impl WalletSession {
    /// Create a session. Does not talk to the provider.
    pub fn new(provider: Option<Arc<dyn WalletProvider>>, contract: Address, chain: ChainParams) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            provider,
            contract,
            chain,
            state: RwLock::new(SessionState::default()),
            changes,
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Session with no wallet at all.
    pub fn watch_only(contract: Address, chain: ChainParams) -> Self {
        Self::new(None, contract, chain)
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    pub fn current_account(&self) -> Option<Account> {
        self.state.read().account()
    }

    pub fn chain_id(&self) -> Option<ChainId> {
        self.state.read().chain_id
    }

    /// Whether the wallet is on the configured chain.
    pub fn on_target_chain(&self) -> bool {
        self.chain_id() == Some(self.chain.chain_id)
    }

    /// Receive every account/chain change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionChange> {
        self.changes.subscribe()
    }

    fn provider(&self) -> Result<&Arc<dyn WalletProvider>, WalletError> {
        self.provider.as_ref().ok_or(WalletError::NoProvider)
    }

    /// Update state and broadcast if anything changed.
    ///
    /// Returns whether a change was emitted.
    fn apply(&self, address: Option<Address>, chain_id: Option<ChainId>) -> bool {
        let change = {
            let mut state = self.state.write();
            if state.address == address && state.chain_id == chain_id {
                return false;
            }
            state.address = address;
            state.chain_id = chain_id;
            SessionChange {
                account: state.account(),
                chain_id: state.chain_id,
            }
        };
        debug!("session change: {:?}", change);
        // No receivers is fine.
        let _ = self.changes.send(change);
        true
    }

    fn set_address(&self, address: Option<Address>) -> bool {
        let chain = self.chain_id();
        self.apply(address, chain)
    }

    fn set_chain(&self, chain_id: Option<ChainId>) -> bool {
        let address = self.state.read().address.clone();
        self.apply(address, chain_id)
    }

    /// Load the already-authorized account and chain without prompting.
    pub async fn restore(&self) -> Result<Option<Account>, WalletError> {
        let provider = match &self.provider {
            Some(p) => Arc::clone(p),
            None => return Ok(None),
        };
        let accounts = provider.accounts().await?;
        let chain = match provider.chain_id().await {
            Ok(hex) => parse_chain_id(&hex),
            Err(e) => {
                warn!("could not read wallet chain id: {}", e);
                None
            }
        };
        self.apply(accounts.into_iter().next().map(Address::from), chain);
        Ok(self.current_account())
    }

    /// Ask the wallet for an account (interactive).
    pub async fn connect(&self) -> Result<Account, WalletError> {
        let provider = Arc::clone(self.provider()?);
        let accounts = provider.request_accounts().await?;
        let address = accounts
            .into_iter()
            .next()
            .map(Address::from)
            .ok_or(WalletError::UserRejected)?;
        let chain = match provider.chain_id().await {
            Ok(hex) => parse_chain_id(&hex).or(self.chain_id()),
            Err(_) => self.chain_id(),
        };
        self.apply(Some(address), chain);
        info!("wallet connected");
        self.current_account().ok_or(WalletError::NoAccount)
    }

    /// Ask the user to pick a different account (interactive).
    pub async fn request_account_switch(&self) -> Result<Account, WalletError> {
        let provider = Arc::clone(self.provider()?);
        provider.request_permissions().await?;
        let accounts = provider.request_accounts().await?;
        let address = accounts
            .into_iter()
            .next()
            .map(Address::from)
            .ok_or(WalletError::UserRejected)?;
        self.set_address(Some(address));
        self.current_account().ok_or(WalletError::NoAccount)
    }

    /// Make sure the wallet is on the configured chain, adding it if the
    /// wallet does not know it.
    pub async fn ensure_chain(&self) -> Result<(), WalletError> {
        let provider = Arc::clone(self.provider()?);
        if self.on_target_chain() {
            return Ok(());
        }
        let target = self.chain.chain_id_hex();
        match provider.switch_chain(&target).await {
            Ok(()) => {}
            Err(e) if e.is_user_rejection() => return Err(WalletError::UserRejected),
            Err(e) if e.code == ProviderError::UNRECOGNIZED_CHAIN => {
                debug!("chain {} unknown to wallet, adding it", target);
                match provider.add_chain(&self.chain).await {
                    Ok(()) => {}
                    Err(e) if e.is_user_rejection() => return Err(WalletError::UserRejected),
                    Err(e) => {
                        return Err(WalletError::ChainSwitchFailed(format!(
                            "failed to add {}: {}",
                            self.chain.chain_name, e.message
                        )))
                    }
                }
            }
            Err(e) => return Err(WalletError::ChainSwitchFailed(e.message)),
        }
        self.set_chain(Some(self.chain.chain_id));
        Ok(())
    }

    /// Forget the connected account locally.
    ///
    /// The wallet's authorization for the site is not revoked; a later
    /// `restore()` may pick the same account up again.
    pub fn disconnect(&self) {
        if self.set_address(None) {
            info!("wallet disconnected locally");
        }
    }

    /// Send the vote transaction for `sentiment` from the connected account.
    pub async fn send_vote(&self, sentiment: Sentiment) -> Result<TxHash, WalletError> {
        let provider = Arc::clone(self.provider()?);
        let from = self
            .current_account()
            .ok_or(WalletError::NoAccount)?
            .address;
        let tx = TransactionRequest {
            from,
            to: self.contract.clone(),
            data: abi::vote_calldata(sentiment),
        };
        let hash = provider.send_transaction(&tx).await?;
        info!("vote {} sent: {}", sentiment, hash);
        Ok(hash)
    }

    /// Wait for a sent transaction to be mined.
    ///
    /// A mined transaction that reverted yields
    /// [`WalletError::TransactionReverted`] with the wallet's reason.
    pub async fn wait_for_confirmation(&self, hash: &TxHash) -> Result<TxReceipt, WalletError> {
        let provider = Arc::clone(self.provider()?);
        let receipt = provider.wait_for_receipt(hash).await?;
        if !receipt.success {
            let reason = receipt
                .revert_reason
                .clone()
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| GENERIC_REVERT.to_string());
            return Err(WalletError::TransactionReverted(reason));
        }
        Ok(receipt)
    }

    /// Follow provider notifications in a background task.
    ///
    /// Returns `false` if already running or if the provider has no
    /// notification stream (watch-only or already taken).
    pub fn start(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let rx = match self.provider.as_ref().and_then(|p| p.notifications()) {
            Some(rx) => rx,
            None => {
                self.running.store(false, Ordering::SeqCst);
                return false;
            }
        };
        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.follow_notifications(rx).await;
        });
        true
    }

    async fn follow_notifications(&self, mut rx: mpsc::UnboundedReceiver<ProviderNotification>) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                msg = rx.recv() => match msg {
                    Some(n) => self.handle_notification(n),
                    None => {
                        debug!("provider notification stream ended");
                        self.apply(None, None);
                        break;
                    }
                },
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Apply one provider notification.
    pub fn handle_notification(&self, notification: ProviderNotification) {
        match notification {
            ProviderNotification::AccountsChanged(accounts) => {
                self.set_address(accounts.into_iter().next().map(Address::from));
            }
            ProviderNotification::ChainChanged(hex) => match parse_chain_id(&hex) {
                Some(id) => {
                    self.set_chain(Some(id));
                }
                None => warn!("ignoring malformed chain id '{}'", hex),
            },
            ProviderNotification::Disconnected => {
                self.apply(None, None);
            }
        }
    }

    /// Stop following notifications. Idempotent.
    pub fn stop(&self) {
        if self.running.load(Ordering::SeqCst) {
            self.shutdown.notify_one();
        }
    }
}

fn parse_chain_id(hex: &str) -> Option<ChainId> {
    abi::parse_quantity(hex).ok()
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_wallet::{MockWalletProvider, WalletMethod};

    const A: &str = "0xAAAAaaaaAAAAaaaaAAAAaaaaAAAAaaaaAAAAaaaa";
    const B: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn contract() -> Address {
        Address::from_bytes([0xcc; 20])
    }

    fn session(provider: &Arc<MockWalletProvider>) -> Arc<WalletSession> {
        let p: Arc<dyn WalletProvider> = provider.clone();
        Arc::new(WalletSession::new(Some(p), contract(), ChainParams::default()))
    }

    #[tokio::test]
    async fn watch_only_session_has_no_provider() {
        let s = WalletSession::watch_only(contract(), ChainParams::default());
        assert_eq!(s.connect().await, Err(WalletError::NoProvider));
        assert_eq!(s.request_account_switch().await, Err(WalletError::NoProvider));
        assert_eq!(s.ensure_chain().await, Err(WalletError::NoProvider));
        assert_eq!(s.restore().await, Ok(None));
        assert!(s.current_account().is_none());
    }

    #[tokio::test]
    async fn connect_sets_account_and_emits() {
        let provider = Arc::new(MockWalletProvider::new(vec![A.to_string()], 10218));
        let s = session(&provider);
        let mut rx = s.subscribe();

        let account = s.connect().await.unwrap();
        assert_eq!(account.address, Address::new(A));
        assert_eq!(account.chain_id, Some(10218));
        assert!(s.on_target_chain());

        let change = rx.recv().await.unwrap();
        assert_eq!(change.account, Some(account));
    }

    #[tokio::test]
    async fn connect_rejected_is_terminal() {
        let provider = Arc::new(MockWalletProvider::new(vec![A.to_string()], 10218));
        provider.reject(WalletMethod::RequestAccounts);
        let s = session(&provider);

        assert_eq!(s.connect().await, Err(WalletError::UserRejected));
        assert!(s.current_account().is_none());
        assert_eq!(provider.count(WalletMethod::RequestAccounts), 1);
    }

    #[tokio::test]
    async fn account_switch_prompts_permissions_first() {
        let provider = Arc::new(MockWalletProvider::new(vec![A.to_string()], 10218));
        let s = session(&provider);
        s.connect().await.unwrap();

        provider.set_accounts(vec![B.to_string()]);
        let account = s.request_account_switch().await.unwrap();
        assert_eq!(account.address, Address::new(B));

        let methods = provider.methods();
        let perm = methods.iter().position(|m| *m == WalletMethod::RequestPermissions).unwrap();
        let last_req = methods.iter().rposition(|m| *m == WalletMethod::RequestAccounts).unwrap();
        assert!(perm < last_req);
    }

    #[tokio::test]
    async fn ensure_chain_adds_unknown_chain() {
        let provider = Arc::new(MockWalletProvider::new(vec![A.to_string()], 1));
        provider.forget_chain(10218);
        let s = session(&provider);
        s.connect().await.unwrap();
        assert!(!s.on_target_chain());

        s.ensure_chain().await.unwrap();
        assert!(s.on_target_chain());
        assert_eq!(provider.count(WalletMethod::AddChain), 1);
    }

    #[tokio::test]
    async fn ensure_chain_failure_is_reported() {
        let provider = Arc::new(MockWalletProvider::new(vec![A.to_string()], 1));
        provider.forget_chain(10218);
        provider.fail(WalletMethod::AddChain, ProviderError::new(-32603, "bad rpc url"));
        let s = session(&provider);
        s.connect().await.unwrap();

        match s.ensure_chain().await {
            Err(WalletError::ChainSwitchFailed(reason)) => assert!(reason.contains("bad rpc url")),
            other => panic!("expected ChainSwitchFailed, got {:?}", other),
        }
        assert_eq!(s.chain_id(), Some(1));
    }

    #[tokio::test]
    async fn ensure_chain_noop_when_already_there() {
        let provider = Arc::new(MockWalletProvider::new(vec![A.to_string()], 10218));
        let s = session(&provider);
        s.connect().await.unwrap();
        s.ensure_chain().await.unwrap();
        assert_eq!(provider.count(WalletMethod::SwitchChain), 0);
    }

    #[tokio::test]
    async fn notifications_are_normalized() {
        let provider = Arc::new(MockWalletProvider::new(vec![A.to_string()], 10218));
        let s = session(&provider);
        s.restore().await.unwrap();
        let mut rx = s.subscribe();

        // Same account in different case is not a change.
        s.handle_notification(ProviderNotification::AccountsChanged(vec![A.to_lowercase()]));
        s.handle_notification(ProviderNotification::ChainChanged("0x1".to_string()));
        let change = rx.recv().await.unwrap();
        assert_eq!(change.chain_id, Some(1));
        assert_eq!(change.account.map(|a| a.address), Some(Address::new(A)));

        s.handle_notification(ProviderNotification::AccountsChanged(vec![]));
        let change = rx.recv().await.unwrap();
        assert!(change.account.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn background_follower_applies_notifications() {
        let provider = Arc::new(MockWalletProvider::new(vec![A.to_string()], 10218));
        let s = session(&provider);
        let mut rx = s.subscribe();
        assert!(s.start());
        assert!(!s.start());

        provider.notify(ProviderNotification::AccountsChanged(vec![B.to_string()]));
        let change = rx.recv().await.unwrap();
        assert_eq!(change.account.map(|a| a.address), Some(Address::new(B)));

        provider.notify(ProviderNotification::Disconnected);
        let change = rx.recv().await.unwrap();
        assert!(change.account.is_none());
        s.stop();
    }

    #[tokio::test]
    async fn disconnect_is_local_only() {
        let provider = Arc::new(MockWalletProvider::new(vec![A.to_string()], 10218));
        let s = session(&provider);
        s.connect().await.unwrap();
        let calls_before = provider.methods().len();

        s.disconnect();
        assert!(s.current_account().is_none());
        assert_eq!(provider.methods().len(), calls_before);

        // Authorization survives, so restore finds the account again.
        assert!(s.restore().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn send_vote_requires_account() {
        let provider = Arc::new(MockWalletProvider::new(vec![A.to_string()], 10218));
        let s = session(&provider);
        assert_eq!(s.send_vote(Sentiment::Bull).await, Err(WalletError::NoAccount));
        assert_eq!(provider.count(WalletMethod::SendTransaction), 0);
    }

    #[tokio::test]
    async fn send_vote_targets_contract() {
        let provider = Arc::new(MockWalletProvider::new(vec![A.to_string()], 10218));
        let s = session(&provider);
        s.connect().await.unwrap();

        let hash = s.send_vote(Sentiment::Bear).await.unwrap();
        let sent = provider.sent_transactions();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, contract());
        assert_eq!(sent[0].data, abi::vote_calldata(Sentiment::Bear));

        let receipt = s.wait_for_confirmation(&hash).await.unwrap();
        assert!(receipt.success);
    }

    #[tokio::test]
    async fn reverted_receipt_reason() {
        let provider = Arc::new(MockWalletProvider::new(vec![A.to_string()], 10218));
        provider.revert_next(Some("Cooldown active".to_string()));
        let s = session(&provider);
        s.connect().await.unwrap();
        let hash = s.send_vote(Sentiment::Bull).await.unwrap();
        assert_eq!(
            s.wait_for_confirmation(&hash).await,
            Err(WalletError::TransactionReverted("Cooldown active".to_string()))
        );

        provider.revert_next(None);
        let hash = s.send_vote(Sentiment::Bull).await.unwrap();
        assert_eq!(
            s.wait_for_confirmation(&hash).await,
            Err(WalletError::TransactionReverted(GENERIC_REVERT.to_string()))
        );
    }

    #[test]
    fn provider_error_mapping() {
        assert_eq!(WalletError::from(ProviderError::user_rejected()), WalletError::UserRejected);
        assert_eq!(
            WalletError::from(ProviderError::new(-32603, "execution reverted: Cooldown active")),
            WalletError::TransactionReverted("execution reverted: Cooldown active".to_string())
        );
        assert_eq!(
            WalletError::from(ProviderError::new(-32000, "nonce too low")),
            WalletError::Rpc("nonce too low".to_string())
        );
    }
}
