//! Control-API surface of the embedded node.
//!
//! The transport behind [`WalletRpc`] is supplied by the node integration;
//! everything in this crate talks to the node only through this trait.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::RpcError;

/// Server stream: items arrive in node order, the stream ends when the
/// sender is dropped.
pub type RpcStream<T> = mpsc::Receiver<Result<T, RpcError>>;

/// Wallet lifecycle reported by the node's state service.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalletState {
    NonExisting,
    Locked,
    Unlocked,
    RpcActive,
    ServerActive,
    WaitingToStart,
}

/// Per-call metadata for authenticated services.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CallMeta {
    pub macaroon_hex: Option<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Transaction {
    pub tx_hash: String,
    pub amount: i64,
    pub num_confirmations: i32,
    pub block_hash: String,
    pub block_height: i32,
    pub time_stamp: i64,
    pub total_fees: i64,
    pub dest_addresses: Vec<String>,
    pub raw_tx_hex: String,
    pub label: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TransactionQuery {
    pub index_offset: u32,
    pub max_transactions: u32,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TransactionPage {
    pub transactions: Vec<Transaction>,
    pub last_index: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockEpoch {
    pub hash: Vec<u8>,
    pub height: u32,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NodeInfo {
    pub identity_pubkey: String,
    pub block_height: u32,
    pub block_hash: String,
    pub best_header_timestamp: i64,
    pub synced_to_chain: bool,
    pub version: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GeneratedSeed {
    pub mnemonic: Vec<String>,
    pub enciphered_seed: Vec<u8>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InitWalletRequest {
    pub password: Vec<u8>,
    pub mnemonic: Vec<String>,
    pub recovery_window: i32,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct WalletBalance {
    pub total: i64,
    pub confirmed: i64,
    pub unconfirmed: i64,
    pub locked: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct RecoveryInfo {
    pub recovery_mode: bool,
    pub recovery_finished: bool,
    /// Fraction in `0.0..=1.0`.
    pub progress: f64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize)]
pub struct OutPoint {
    pub txid: String,
    pub output_index: u32,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Utxo {
    pub address_type: AddressType,
    pub address: String,
    pub amount: i64,
    pub pk_script: String,
    pub outpoint: OutPoint,
    pub confirmations: i64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum AddressType {
    #[default]
    WitnessPubkeyHash,
    NestedPubkeyHash,
    UnusedWitnessPubkeyHash,
    UnusedNestedPubkeyHash,
    TaprootPubkey,
    UnusedTaprootPubkey,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AddressProperty {
    pub address: String,
    pub is_internal: bool,
    pub balance: i64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AccountAddresses {
    pub name: String,
    pub address_type: AddressType,
    pub derivation_path: String,
    pub addresses: Vec<AddressProperty>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VerifiedMessage {
    pub valid: bool,
    pub pubkey: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SendCoinsRequest {
    pub addr: String,
    pub amount: i64,
    pub sat_per_vbyte: u64,
    pub spend_unconfirmed: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EstimateFeeRequest {
    pub addr_to_amount: HashMap<String, i64>,
    pub target_conf: i32,
    pub spend_unconfirmed: bool,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FeeEstimate {
    pub fee_sat: i64,
    pub sat_per_vbyte: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FundPsbtRequest {
    pub outputs: HashMap<String, u64>,
    pub sat_per_vbyte: u64,
    pub lock_expiration_seconds: u64,
}

/// Coin-selection hold taken while funding a transaction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OutputLock {
    pub id: Vec<u8>,
    pub outpoint: Option<OutPoint>,
}

impl OutputLock {
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() && self.outpoint.is_some()
    }
}

/// Funded but unsigned transaction plus the outputs it holds.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FundedTransaction {
    pub psbt: Vec<u8>,
    pub change_output_index: i32,
    pub locks: Vec<OutputLock>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FinalizedTransaction {
    pub signed_psbt: Vec<u8>,
    pub raw_final_tx: Vec<u8>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PublishResult {
    pub publish_error: String,
}

#[async_trait]
pub trait WalletRpc: Send + Sync {
    async fn subscribe_state(&self) -> Result<RpcStream<WalletState>, RpcError>;
    async fn subscribe_transactions(
        &self,
        meta: &CallMeta,
    ) -> Result<RpcStream<Transaction>, RpcError>;
    async fn subscribe_block_epochs(
        &self,
        meta: &CallMeta,
    ) -> Result<RpcStream<BlockEpoch>, RpcError>;

    async fn get_info(&self, meta: &CallMeta) -> Result<NodeInfo, RpcError>;
    async fn gen_seed(&self) -> Result<GeneratedSeed, RpcError>;
    async fn init_wallet(&self, request: InitWalletRequest) -> Result<(), RpcError>;
    async fn unlock_wallet(&self, password: &[u8], recovery_window: i32) -> Result<(), RpcError>;
    async fn change_password(
        &self,
        meta: &CallMeta,
        current: &[u8],
        new: &[u8],
    ) -> Result<(), RpcError>;

    async fn wallet_balance(&self, meta: &CallMeta) -> Result<WalletBalance, RpcError>;
    async fn get_recovery_info(&self, meta: &CallMeta) -> Result<RecoveryInfo, RpcError>;
    async fn list_unspent(
        &self,
        meta: &CallMeta,
        min_confs: i32,
        max_confs: i32,
    ) -> Result<Vec<Utxo>, RpcError>;
    async fn get_transactions(
        &self,
        meta: &CallMeta,
        query: TransactionQuery,
    ) -> Result<TransactionPage, RpcError>;

    async fn new_address(&self, meta: &CallMeta, kind: AddressType) -> Result<String, RpcError>;
    async fn list_addresses(&self, meta: &CallMeta) -> Result<Vec<AccountAddresses>, RpcError>;
    async fn sign_message(
        &self,
        meta: &CallMeta,
        address: &str,
        message: &[u8],
    ) -> Result<String, RpcError>;
    async fn verify_message(
        &self,
        meta: &CallMeta,
        address: &str,
        message: &[u8],
        signature: &str,
    ) -> Result<VerifiedMessage, RpcError>;

    async fn send_coins(&self, meta: &CallMeta, request: SendCoinsRequest)
        -> Result<String, RpcError>;
    async fn estimate_fee(
        &self,
        meta: &CallMeta,
        request: EstimateFeeRequest,
    ) -> Result<FeeEstimate, RpcError>;
    async fn fund_psbt(
        &self,
        meta: &CallMeta,
        request: FundPsbtRequest,
    ) -> Result<FundedTransaction, RpcError>;
    async fn finalize_psbt(
        &self,
        meta: &CallMeta,
        funded_psbt: &[u8],
    ) -> Result<FinalizedTransaction, RpcError>;
    async fn publish_transaction(
        &self,
        meta: &CallMeta,
        raw_tx: &[u8],
    ) -> Result<PublishResult, RpcError>;
    async fn release_output(&self, meta: &CallMeta, lock: &OutputLock) -> Result<(), RpcError>;

    /// Tears down the underlying channel; open streams end.
    fn close(&self);
}
