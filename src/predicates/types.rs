//! Predicate definitions: the declarative `if_this`/`then_that` document
//! users register, and the per-predicate status the lifecycle controller
//! drives.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::Chain;

/// `outputs.op_return{equals|starts_with|ends_with}` against hex bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HexMatchingRule {
    Equals(String),
    StartsWith(String),
    EndsWith(String),
}

impl HexMatchingRule {
    pub fn matches(&self, data_hex: &str) -> bool {
        match self {
            HexMatchingRule::Equals(v) => data_hex.eq_ignore_ascii_case(v),
            HexMatchingRule::StartsWith(v) => data_hex.to_lowercase().starts_with(&v.to_lowercase()),
            HexMatchingRule::EndsWith(v) => data_hex.to_lowercase().ends_with(&v.to_lowercase()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExactMatchingRule {
    pub equals: String,
}

/// `stacks_protocol{block_committed|leader_registered|stx_transferred|stx_locked}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "operation")]
pub enum StacksProtocolOp {
    BlockCommitted,
    LeaderRegistered,
    StxTransferred,
    StxLocked,
}

/// `ordinals_protocol{inscription_feed}` - covers reveal, transfer, and
/// burn-via-fee variants under a single operation tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "operation")]
pub enum OrdinalsProtocolOp {
    InscriptionFeed,
}

/// The Bitcoin half of `if_this`, tagged the way real chainhook predicate
/// files tag it (`scope`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope")]
pub enum BitcoinMatchSpec {
    Txid(ExactMatchingRule),
    OutputsOpReturn { op_return: HexMatchingRule },
    OutputsP2pkh(ExactMatchingRule),
    OutputsP2sh(ExactMatchingRule),
    OutputsP2wpkh(ExactMatchingRule),
    OutputsP2wsh(ExactMatchingRule),
    OutputsP2tr(ExactMatchingRule),
    StacksProtocol(StacksProtocolOp),
    OrdinalsProtocol(OrdinalsProtocolOp),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum BlockHeightRule {
    Equals(u64),
    HigherThan(u64),
    LowerThan(u64),
    Between(u64, u64),
}

impl BlockHeightRule {
    pub fn matches(&self, height: u64) -> bool {
        match self {
            BlockHeightRule::Equals(h) => height == *h,
            BlockHeightRule::HigherThan(h) => height > *h,
            BlockHeightRule::LowerThan(h) => height < *h,
            BlockHeightRule::Between(lo, hi) => height >= *lo && height <= *hi,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventActionFilter {
    Mint,
    Transfer,
    Burn,
    Lock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetEventSpec {
    pub asset_identifier: String,
    pub actions: Vec<EventActionFilter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StxEventSpec {
    pub actions: Vec<EventActionFilter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrintEventRule {
    Contains(String),
    MatchesRegex(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintEventSpec {
    pub contract_identifier: String,
    #[serde(flatten)]
    pub rule: PrintEventRule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractCallSpec {
    pub contract_identifier: String,
    pub method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractDeploymentSpec {
    Deployer(String),
    Any,
    ImplementTrait(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum SignerMessageKind {
    BlockProposal,
    BlockResponseAccepted,
    BlockResponseRejected,
    BlockPushed,
    MockProposal,
    MockSignature,
    MockBlock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerMessageSpec {
    pub message_kind: SignerMessageKind,
    pub signer_address: Option<String>,
}

/// The Stacks half of `if_this`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope")]
pub enum StacksMatchSpec {
    Txid(ExactMatchingRule),
    BlockHeight(BlockHeightRule),
    FtEvent(AssetEventSpec),
    NftEvent(AssetEventSpec),
    StxEvent(StxEventSpec),
    PrintEvent(PrintEventSpec),
    /// Matches direct invocation only - cross-contract calls into
    /// `contract_identifier` from another contract are not matched.
    ContractCall(ContractCallSpec),
    ContractDeployment(ContractDeploymentSpec),
    SignerMessage(SignerMessageSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "chain")]
pub enum MatchSpec {
    Bitcoin(BitcoinMatchSpec),
    Stacks(StacksMatchSpec),
}

/// `then_that`. `Noop` is a supplemented variant (dry runs, tests): matches
/// still count toward `times_triggered` but produce no I/O.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSpec {
    HttpPost { url: String, authorization_header: Option<String> },
    FileAppend { path: String },
    Noop,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayloadShaping {
    #[serde(default)]
    pub include_proof: bool,
    #[serde(default)]
    pub include_inputs: bool,
    #[serde(default)]
    pub include_outputs: bool,
    #[serde(default)]
    pub include_witness: bool,
    #[serde(default)]
    pub decode_clarity_values: bool,
}

/// A single registered predicate, resolved to one network. Predicate
/// files may describe several networks under one `uuid`/`name` (see
/// `PredicateFile`); `Predicate` is always the single-network form the
/// store and evaluator operate on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Predicate {
    pub uuid: String,
    pub name: String,
    pub version: u32,
    pub chain: Chain,
    pub network: String,
    /// Secondary identifier grouping predicates by owning client; the core
    /// round-trips it without interpreting it.
    #[serde(default)]
    pub owner_uuid: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub start_block: Option<u64>,
    pub end_block: Option<u64>,
    pub expire_after_occurrence: Option<u64>,
    #[serde(default)]
    pub payload_shaping: PayloadShaping,
    pub if_this: MatchSpec,
    pub then_that: ActionSpec,
}

fn default_enabled() -> bool {
    true
}

impl Predicate {
    pub fn chain(&self) -> Chain {
        self.chain
    }
}

/// On-disk / registration document: one `uuid`/`name` may target several
/// networks, each with its own `if_this`/`then_that`/window. Resolved into
/// one `Predicate` per network at registration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateFile {
    pub uuid: String,
    pub name: String,
    pub version: u32,
    pub chain: Chain,
    #[serde(default)]
    pub owner_uuid: Option<String>,
    pub networks: HashMap<String, PredicateFileNetwork>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateFileNetwork {
    #[serde(default)]
    pub enabled: Option<bool>,
    pub start_block: Option<u64>,
    pub end_block: Option<u64>,
    pub expire_after_occurrence: Option<u64>,
    #[serde(default)]
    pub payload_shaping: PayloadShaping,
    pub if_this: MatchSpec,
    pub then_that: ActionSpec,
}

impl PredicateFile {
    pub fn resolve(&self, network: &str) -> Option<Predicate> {
        let n = self.networks.get(network)?;
        Some(Predicate {
            uuid: self.uuid.clone(),
            name: self.name.clone(),
            version: self.version,
            chain: self.chain,
            network: network.to_string(),
            owner_uuid: self.owner_uuid.clone(),
            enabled: n.enabled.unwrap_or(true),
            start_block: n.start_block,
            end_block: n.end_block,
            expire_after_occurrence: n.expire_after_occurrence,
            payload_shaping: n.payload_shaping.clone(),
            if_this: n.if_this.clone(),
            then_that: n.then_that.clone(),
        })
    }
}

/// Per-predicate lifecycle state, §4.3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum PredicateStatus {
    New,
    Scanning {
        blocks_to_scan: u64,
        blocks_evaluated: u64,
        times_triggered: u64,
        last_occurrence: Option<u64>,
        last_evaluated_block: u64,
    },
    Streaming {
        last_evaluation: u64,
        blocks_evaluated: u64,
        times_triggered: u64,
        last_occurrence: Option<u64>,
        last_evaluated_block: u64,
    },
    UnconfirmedExpiration {
        expired_at: u64,
        last_evaluated_block: u64,
        times_triggered: u64,
    },
    ConfirmedExpiration {
        expired_at: u64,
        last_evaluated_block: u64,
        times_triggered: u64,
    },
    Interrupted {
        reason: String,
    },
}

impl PredicateStatus {
    pub fn last_evaluated_block(&self) -> Option<u64> {
        match self {
            PredicateStatus::New => None,
            PredicateStatus::Scanning { last_evaluated_block, .. }
            | PredicateStatus::Streaming { last_evaluated_block, .. }
            | PredicateStatus::UnconfirmedExpiration { last_evaluated_block, .. }
            | PredicateStatus::ConfirmedExpiration { last_evaluated_block, .. } => {
                Some(*last_evaluated_block)
            }
            PredicateStatus::Interrupted { .. } => None,
        }
    }

    pub fn times_triggered(&self) -> u64 {
        match self {
            PredicateStatus::New => 0,
            PredicateStatus::Scanning { times_triggered, .. }
            | PredicateStatus::Streaming { times_triggered, .. }
            | PredicateStatus::UnconfirmedExpiration { times_triggered, .. }
            | PredicateStatus::ConfirmedExpiration { times_triggered, .. } => *times_triggered,
            PredicateStatus::Interrupted { .. } => 0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PredicateStatus::New => "new",
            PredicateStatus::Scanning { .. } => "scanning",
            PredicateStatus::Streaming { .. } => "streaming",
            PredicateStatus::UnconfirmedExpiration { .. } => "unconfirmed_expiration",
            PredicateStatus::ConfirmedExpiration { .. } => "confirmed_expiration",
            PredicateStatus::Interrupted { .. } => "interrupted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_matching_rule_starts_with_is_case_insensitive() {
        let rule = HexMatchingRule::StartsWith("ABCD".to_string());
        assert!(rule.matches("abcdef"));
        assert!(!rule.matches("beef"));
    }

    #[test]
    fn block_height_between_is_inclusive() {
        let rule = BlockHeightRule::Between(10, 20);
        assert!(rule.matches(10));
        assert!(rule.matches(20));
        assert!(!rule.matches(21));
    }

    #[test]
    fn predicate_file_resolves_per_network() {
        let mut networks = HashMap::new();
        networks.insert(
            "mainnet".to_string(),
            PredicateFileNetwork {
                enabled: Some(true),
                start_block: Some(100),
                end_block: None,
                expire_after_occurrence: None,
                payload_shaping: PayloadShaping::default(),
                if_this: MatchSpec::Bitcoin(BitcoinMatchSpec::Txid(ExactMatchingRule {
                    equals: "abc".to_string(),
                })),
                then_that: ActionSpec::Noop,
            },
        );
        let file = PredicateFile {
            uuid: "u1".to_string(),
            name: "test".to_string(),
            version: 1,
            chain: Chain::Bitcoin,
            owner_uuid: None,
            networks,
        };
        let resolved = file.resolve("mainnet").unwrap();
        assert_eq!(resolved.start_block, Some(100));
        assert!(file.resolve("testnet").is_none());
    }

    #[test]
    fn status_label_matches_variant() {
        assert_eq!(PredicateStatus::New.label(), "new");
        assert_eq!(
            PredicateStatus::Interrupted { reason: "x".to_string() }.label(),
            "interrupted"
        );
    }
}
