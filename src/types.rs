//! Core data model: block identifiers, chain-agnostic raw blocks, and the
//! chain-specific transaction payloads predicates are evaluated against.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which of the two supported chains a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Bitcoin,
    Stacks,
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::Bitcoin => write!(f, "bitcoin"),
            Chain::Stacks => write!(f, "stacks"),
        }
    }
}

/// `(index, hash)`. Equality compares the pair; ordering by `index` only
/// makes sense within a single chain of parents and is not implemented
/// as a blanket `Ord` to avoid comparing blocks across forks by mistake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockIdentifier {
    pub index: u64,
    pub hash: String,
}

impl BlockIdentifier {
    pub fn new(index: u64, hash: impl Into<String>) -> Self {
        Self { index, hash: hash.into() }
    }
}

impl fmt::Display for BlockIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.hash)
    }
}

/// An address decoded from a Bitcoin output script, when the script type
/// is one the evaluator knows how to classify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "address")]
pub enum DecodedAddress {
    P2pkh(String),
    P2sh(String),
    P2wpkh(String),
    P2wsh(String),
    P2tr(String),
}

impl DecodedAddress {
    pub fn address(&self) -> &str {
        match self {
            DecodedAddress::P2pkh(a)
            | DecodedAddress::P2sh(a)
            | DecodedAddress::P2wpkh(a)
            | DecodedAddress::P2wsh(a)
            | DecodedAddress::P2tr(a) => a,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitcoinTxOutput {
    pub value: u64,
    pub script_pubkey_hex: String,
    pub address: Option<DecodedAddress>,
    /// Present when the script is `OP_RETURN <data>`.
    pub op_return_data_hex: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitcoinTxInput {
    pub previous_txid: String,
    pub previous_vout: u32,
    pub script_sig_hex: String,
    pub witness_hex: Vec<String>,
}

/// An ordinal/inscription operation observed on an output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum OrdinalOp {
    InscriptionRevealed { inscription_id: String, content_type: Option<String> },
    InscriptionTransferred { inscription_id: String },
}

/// A Stacks protocol operation embedded in a Bitcoin transaction
/// (`stacks_protocol` matching, §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum StacksOp {
    BlockCommitted { stacks_block_hash: String },
    LeaderRegistered { stx_address: String },
    StxTransferred { sender: String, recipient: String, amount: u64 },
    StxLocked { address: String, amount: u64, unlock_height: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitcoinTx {
    pub txid: String,
    pub position: u32,
    pub inputs: Vec<BitcoinTxInput>,
    pub outputs: Vec<BitcoinTxOutput>,
    pub ordinal_ops: Vec<OrdinalOp>,
    pub stacks_protocol_ops: Vec<StacksOp>,
}

/// Stacks transaction kind, a closed sum type mirroring the node's own
/// transaction payload tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum StacksTxKind {
    ContractCall { contract_identifier: String, method: String },
    ContractDeployment { contract_identifier: String, deployer: String, implemented_traits: Vec<String> },
    TokenTransfer { sender: String, recipient: String, amount: u64 },
    Coinbase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Mint,
    Transfer,
    Burn,
    Lock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StacksEvent {
    FtEvent { asset_identifier: String, action: EventAction },
    NftEvent { asset_identifier: String, action: EventAction },
    StxEvent { action: EventAction },
    PrintEvent { contract_identifier: String, value: String },
    ContractEvent { contract_identifier: String, topic: String, value: String },
    DataVarSet { contract_identifier: String, var: String },
    DataMapInsert { contract_identifier: String, map: String },
    DataMapUpdate { contract_identifier: String, map: String },
    DataMapDelete { contract_identifier: String, map: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxReceipt {
    pub success: bool,
    pub result: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StacksTx {
    pub txid: String,
    pub position: u32,
    pub kind: StacksTxKind,
    pub events: Vec<StacksEvent>,
    pub receipt: TxReceipt,
}

/// Chain-specific transaction payload. A closed sum type per §3/§9 ("sum
/// types rather than open interfaces").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "chain")]
pub enum Tx {
    Bitcoin(BitcoinTx),
    Stacks(StacksTx),
}

impl Tx {
    pub fn txid(&self) -> &str {
        match self {
            Tx::Bitcoin(t) => &t.txid,
            Tx::Stacks(t) => &t.txid,
        }
    }

    pub fn position(&self) -> u32 {
        match self {
            Tx::Bitcoin(t) => t.position,
            Tx::Stacks(t) => t.position,
        }
    }
}

/// Chain metadata carried alongside a raw block — fields that only make
/// sense for one chain are optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainMetadata {
    /// Bitcoin: compact difficulty target for the block header.
    pub n_bits: Option<u32>,
    /// Stacks: anchor block on Bitcoin.
    pub bitcoin_anchor_block_identifier: Option<BlockIdentifier>,
    pub confirm_microblock_identifier: Option<String>,
    pub pox_cycle_index: Option<u64>,
    pub pox_cycle_length: Option<u64>,
    pub pox_cycle_position: Option<u64>,
    pub stacks_block_hash: Option<String>,
    /// Nakamoto-era fields, present only post-activation.
    pub tenure_height: Option<u64>,
    pub block_time: Option<u64>,
    pub signer_bitvec: Option<String>,
    pub signer_signature: Vec<String>,
    pub cycle_number: Option<u64>,
    /// Nakamoto signer messages (`/stackerdb_chunks`) observed close enough
    /// in time to this block to be attributed to it.
    pub signer_messages: Vec<SignerMessageEvent>,
}

/// A decoded Nakamoto signer protocol message. `kind` mirrors
/// `predicates::types::SignerMessageKind`'s variant names as strings so the
/// evaluator can match without a hard dependency from `types` on
/// `predicates`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerMessageEvent {
    pub kind: String,
    pub signer_address: Option<String>,
}

/// Immutable once constructed. `parent_id` must link to a known ancestor
/// or the pool treats the block as an orphan pending parent fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBlock {
    pub chain: Chain,
    pub id: BlockIdentifier,
    pub parent_id: BlockIdentifier,
    pub timestamp: u64,
    pub transactions: Vec<Tx>,
    pub chain_metadata: ChainMetadata,
}

impl RawBlock {
    pub fn is_genesis(&self) -> bool {
        self.id.index == 0
    }
}

/// A block as held by the pool, carrying pool-internal bookkeeping on top
/// of the adapter-supplied `RawBlock`.
pub type Block = RawBlock;

/// `(predicate_uuid, block_id, tx_index, tx_summary)` — carries enough to
/// render a payload without re-scanning the block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedTx {
    pub predicate_uuid: String,
    pub block_id: BlockIdentifier,
    pub tx_index: u32,
    pub tx_summary: Tx,
}

/// Produced by the block pool on every `process()` call that changes the
/// canonical chain. `rollback` is tip-to-base order; `apply` is
/// base-to-tip order. Both empty is never emitted — callers should treat
/// receiving one as a logic error upstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainUpdate {
    pub apply: Vec<Block>,
    pub rollback: Vec<Block>,
}

impl ChainUpdate {
    pub fn is_empty(&self) -> bool {
        self.apply.is_empty() && self.rollback.is_empty()
    }
}

/// A block reduced to only the transactions a predicate matched (unless
/// the predicate is block-scoped, in which case the whole block rides
/// along via `whole_block`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedBlock {
    pub block_identifier: BlockIdentifier,
    pub parent_block_identifier: BlockIdentifier,
    pub timestamp: u64,
    pub chain_metadata: ChainMetadata,
    pub transactions: Vec<Tx>,
}

/// The delivered dispatch body: `{ apply, rollback, chainhook }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainhookInfo {
    pub uuid: String,
    pub predicate: serde_json::Value,
    pub is_streaming_blocks: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyRollbackPayload {
    pub apply: Vec<EnrichedBlock>,
    pub rollback: Vec<EnrichedBlock>,
    pub chainhook: ChainhookInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_identifier_display() {
        let id = BlockIdentifier::new(10, "abc");
        assert_eq!(id.to_string(), "10:abc");
    }

    #[test]
    fn chain_update_empty() {
        let u = ChainUpdate::default();
        assert!(u.is_empty());
    }

    #[test]
    fn decoded_address_round_trips_address_str() {
        let a = DecodedAddress::P2wpkh("bcrt1qnxknq3wqtphv7sfwy07m7e4sr6ut9yt6ed99jg".to_string());
        assert_eq!(a.address(), "bcrt1qnxknq3wqtphv7sfwy07m7e4sr6ut9yt6ed99jg");
    }
}
