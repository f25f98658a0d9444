//! Mock WalletProvider for Testing
//!
//! In-memory wallet that answers every request immediately unless told
//! to reject or fail it.
//!
//! # Features
//!
//! - Authorized account list and current chain
//! - Known chain set (switching to an unknown chain yields code 4902)
//! - Per-method rejection (code 4001) and arbitrary failure injection
//! - Method log and captured transactions
//! - `revert_next()` makes the next sent transaction revert when mined
//! - `on_mined()` hook runs when a successful transaction is confirmed,
//!   so tests can apply the vote to a `MockChainReader`

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use teapoll_common::{abi, ChainId, ChainParams};

use crate::wallet_session::{
    ProviderError, ProviderNotification, TransactionRequest, TxHash, TxReceipt, WalletProvider,
};

/// Provider method, for logging and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalletMethod {
    Accounts,
    RequestAccounts,
    RequestPermissions,
    ChainId,
    SwitchChain,
    AddChain,
    SendTransaction,
    WaitForReceipt,
}

type MinedHook = Box<dyn Fn(&TransactionRequest) + Send + Sync>;

/// In-memory wallet provider.
pub struct MockWalletProvider {
    accounts: Mutex<Vec<String>>,
    chain: Mutex<ChainId>,
    known_chains: Mutex<HashSet<ChainId>>,
    failures: Mutex<HashMap<WalletMethod, ProviderError>>,
    methods: Mutex<Vec<WalletMethod>>,
    sent: Mutex<Vec<TransactionRequest>>,
    /// hash -> (request, revert reason if it reverts)
    outcomes: Mutex<HashMap<TxHash, (TransactionRequest, Option<Option<String>>)>>,
    revert_next: Mutex<Option<Option<String>>>,
    confirmation_latency: Mutex<Duration>,
    on_mined: Mutex<Option<MinedHook>>,
    next_tx: AtomicU64,
    notify_tx: mpsc::UnboundedSender<ProviderNotification>,
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<ProviderNotification>>>,
}

impl MockWalletProvider {
    /// Wallet with `accounts` authorized, sitting on `chain`.
    ///
    /// The wallet knows `chain` and the default poll chain.
    pub fn new(accounts: Vec<String>, chain: ChainId) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let known: HashSet<ChainId> = [chain, ChainParams::default().chain_id].into_iter().collect();
        Self {
            accounts: Mutex::new(accounts),
            chain: Mutex::new(chain),
            known_chains: Mutex::new(known),
            failures: Mutex::new(HashMap::new()),
            methods: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            outcomes: Mutex::new(HashMap::new()),
            revert_next: Mutex::new(None),
            confirmation_latency: Mutex::new(Duration::ZERO),
            on_mined: Mutex::new(None),
            next_tx: AtomicU64::new(1),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
        }
    }

    /// Accounts returned by the next account request.
    pub fn set_accounts(&self, accounts: Vec<String>) {
        *self.accounts.lock() = accounts;
    }

    pub fn forget_chain(&self, chain: ChainId) {
        self.known_chains.lock().remove(&chain);
    }

    /// Make `method` fail with code 4001 until cleared.
    pub fn reject(&self, method: WalletMethod) {
        self.fail(method, ProviderError::user_rejected());
    }

    /// Make `method` fail with `error` until cleared.
    pub fn fail(&self, method: WalletMethod, error: ProviderError) {
        self.failures.lock().insert(method, error);
    }

    pub fn clear_failure(&self, method: WalletMethod) {
        self.failures.lock().remove(&method);
    }

    /// Next sent transaction reverts when mined, with an optional reason.
    pub fn revert_next(&self, reason: Option<String>) {
        *self.revert_next.lock() = Some(reason);
    }

    /// Delay between `wait_for_receipt` and the receipt.
    pub fn set_confirmation_latency(&self, latency: Duration) {
        *self.confirmation_latency.lock() = latency;
    }

    /// Hook run when a successful transaction is confirmed.
    pub fn on_mined(&self, hook: impl Fn(&TransactionRequest) + Send + Sync + 'static) {
        *self.on_mined.lock() = Some(Box::new(hook));
    }

    /// Push a notification as if the wallet emitted it.
    pub fn notify(&self, notification: ProviderNotification) {
        let _ = self.notify_tx.send(notification);
    }

    pub fn methods(&self) -> Vec<WalletMethod> {
        self.methods.lock().clone()
    }

    pub fn count(&self, method: WalletMethod) -> usize {
        self.methods.lock().iter().filter(|m| **m == method).count()
    }

    pub fn sent_transactions(&self) -> Vec<TransactionRequest> {
        self.sent.lock().clone()
    }

    fn enter(&self, method: WalletMethod) -> Result<(), ProviderError> {
        self.methods.lock().push(method);
        match self.failures.lock().get(&method) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl WalletProvider for MockWalletProvider {
    async fn accounts(&self) -> Result<Vec<String>, ProviderError> {
        self.enter(WalletMethod::Accounts)?;
        Ok(self.accounts.lock().clone())
    }

    async fn request_accounts(&self) -> Result<Vec<String>, ProviderError> {
        self.enter(WalletMethod::RequestAccounts)?;
        Ok(self.accounts.lock().clone())
    }

    async fn request_permissions(&self) -> Result<(), ProviderError> {
        self.enter(WalletMethod::RequestPermissions)
    }

    async fn chain_id(&self) -> Result<String, ProviderError> {
        self.enter(WalletMethod::ChainId)?;
        Ok(abi::to_quantity(*self.chain.lock()))
    }

    async fn switch_chain(&self, chain_id_hex: &str) -> Result<(), ProviderError> {
        self.enter(WalletMethod::SwitchChain)?;
        let id = abi::parse_quantity(chain_id_hex)
            .map_err(|e| ProviderError::new(-32602, e.to_string()))?;
        if !self.known_chains.lock().contains(&id) {
            return Err(ProviderError::new(
                ProviderError::UNRECOGNIZED_CHAIN,
                format!("Unrecognized chain ID \"{}\"", chain_id_hex),
            ));
        }
        *self.chain.lock() = id;
        self.notify(ProviderNotification::ChainChanged(chain_id_hex.to_string()));
        Ok(())
    }

    async fn add_chain(&self, params: &ChainParams) -> Result<(), ProviderError> {
        self.enter(WalletMethod::AddChain)?;
        self.known_chains.lock().insert(params.chain_id);
        *self.chain.lock() = params.chain_id;
        self.notify(ProviderNotification::ChainChanged(params.chain_id_hex()));
        Ok(())
    }

    async fn send_transaction(&self, tx: &TransactionRequest) -> Result<TxHash, ProviderError> {
        self.enter(WalletMethod::SendTransaction)?;
        let n = self.next_tx.fetch_add(1, Ordering::SeqCst);
        let hash = TxHash(format!("0x{:064x}", n));
        self.sent.lock().push(tx.clone());
        let revert = self.revert_next.lock().take();
        self.outcomes.lock().insert(hash.clone(), (tx.clone(), revert));
        Ok(hash)
    }

    async fn wait_for_receipt(&self, hash: &TxHash) -> Result<TxReceipt, ProviderError> {
        self.enter(WalletMethod::WaitForReceipt)?;
        let latency = *self.confirmation_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let (tx, revert) = self
            .outcomes
            .lock()
            .get(hash)
            .cloned()
            .ok_or_else(|| ProviderError::new(-32000, format!("unknown transaction {}", hash)))?;

        let block_number = 1_000 + self.next_tx.load(Ordering::SeqCst);
        match revert {
            Some(reason) => Ok(TxReceipt {
                tx_hash: hash.clone(),
                block_number,
                success: false,
                revert_reason: reason,
            }),
            None => {
                if let Some(hook) = self.on_mined.lock().as_ref() {
                    hook(&tx);
                }
                Ok(TxReceipt {
                    tx_hash: hash.clone(),
                    block_number,
                    success: true,
                    revert_reason: None,
                })
            }
        }
    }

    fn notifications(&self) -> Option<mpsc::UnboundedReceiver<ProviderNotification>> {
        self.notify_rx.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn unknown_chain_yields_4902() {
        let w = MockWalletProvider::new(vec![], 1);
        w.forget_chain(10218);
        let err = w.switch_chain("0x27ea").await.unwrap_err();
        assert_eq!(err.code, ProviderError::UNRECOGNIZED_CHAIN);

        w.add_chain(&ChainParams::default()).await.unwrap();
        w.switch_chain("0x27ea").await.unwrap();
        assert_eq!(w.chain_id().await.unwrap(), "0x27ea");
    }

    #[tokio::test]
    async fn notifications_taken_once() {
        let w = MockWalletProvider::new(vec![], 1);
        let mut rx = w.notifications().unwrap();
        assert!(w.notifications().is_none());
        w.notify(ProviderNotification::Disconnected);
        assert_eq!(rx.recv().await, Some(ProviderNotification::Disconnected));
    }

    #[tokio::test]
    async fn mined_hook_runs_on_success_only() {
        let w = MockWalletProvider::new(vec![], 10218);
        let mined = Arc::new(AtomicU64::new(0));
        let m = Arc::clone(&mined);
        w.on_mined(move |_| {
            m.fetch_add(1, Ordering::SeqCst);
        });
        let tx = TransactionRequest {
            from: "0x01".into(),
            to: "0x02".into(),
            data: vec![1, 2, 3, 4],
        };

        let ok = w.send_transaction(&tx).await.unwrap();
        assert!(w.wait_for_receipt(&ok).await.unwrap().success);

        w.revert_next(None);
        let bad = w.send_transaction(&tx).await.unwrap();
        assert!(!w.wait_for_receipt(&bad).await.unwrap().success);
        assert_eq!(mined.load(Ordering::SeqCst), 1);
    }
}
