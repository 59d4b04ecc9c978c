//! Pure predicate evaluation: `(Predicate, Block) -> Vec<MatchedTx>`. No
//! I/O, deterministic, and independent of block arrival order - the same
//! block always evaluates to the same matches regardless of what else has
//! been evaluated.

use regex::Regex;

use super::types::{
    BitcoinMatchSpec, ContractDeploymentSpec, EventActionFilter, MatchSpec, Predicate,
    PrintEventRule, StacksMatchSpec,
};
use crate::types::{
    BitcoinTx, Block, EventAction, MatchedTx, OrdinalOp, StacksEvent, StacksTx, StacksTxKind,
    StacksOp, Tx,
};

pub fn evaluate(predicate: &Predicate, block: &Block) -> Vec<MatchedTx> {
    match &predicate.if_this {
        MatchSpec::Bitcoin(spec) => evaluate_bitcoin(predicate, spec, block),
        MatchSpec::Stacks(spec) => evaluate_stacks(predicate, spec, block),
    }
}

fn matched(predicate: &Predicate, block: &Block, tx: &Tx) -> MatchedTx {
    MatchedTx {
        predicate_uuid: predicate.uuid.clone(),
        block_id: block.id.clone(),
        tx_index: tx.position(),
        tx_summary: tx.clone(),
    }
}

fn evaluate_bitcoin(predicate: &Predicate, spec: &BitcoinMatchSpec, block: &Block) -> Vec<MatchedTx> {
    block
        .transactions
        .iter()
        .filter_map(|tx| match tx {
            Tx::Bitcoin(btx) if bitcoin_tx_matches(spec, btx) => Some(matched(predicate, block, tx)),
            _ => None,
        })
        .collect()
}

fn bitcoin_tx_matches(spec: &BitcoinMatchSpec, tx: &BitcoinTx) -> bool {
    match spec {
        BitcoinMatchSpec::Txid(rule) => tx.txid.eq_ignore_ascii_case(&rule.equals),
        BitcoinMatchSpec::OutputsOpReturn { op_return } => tx
            .outputs
            .iter()
            .filter_map(|o| o.op_return_data_hex.as_deref())
            .any(|data| op_return.matches(data)),
        BitcoinMatchSpec::OutputsP2pkh(rule) => address_matches(tx, &rule.equals, is_p2pkh),
        BitcoinMatchSpec::OutputsP2sh(rule) => address_matches(tx, &rule.equals, is_p2sh),
        BitcoinMatchSpec::OutputsP2wpkh(rule) => address_matches(tx, &rule.equals, is_p2wpkh),
        BitcoinMatchSpec::OutputsP2wsh(rule) => address_matches(tx, &rule.equals, is_p2wsh),
        BitcoinMatchSpec::OutputsP2tr(rule) => address_matches(tx, &rule.equals, is_p2tr),
        BitcoinMatchSpec::StacksProtocol(op) => {
            tx.stacks_protocol_ops.iter().any(|o| stacks_op_matches(op, o))
        }
        BitcoinMatchSpec::OrdinalsProtocol(_) => !tx.ordinal_ops.is_empty(),
    }
}

fn address_matches(
    tx: &BitcoinTx,
    expected: &str,
    kind: fn(&crate::types::DecodedAddress) -> bool,
) -> bool {
    tx.outputs.iter().filter_map(|o| o.address.as_ref()).any(|a| kind(a) && a.address() == expected)
}

fn is_p2pkh(a: &crate::types::DecodedAddress) -> bool {
    matches!(a, crate::types::DecodedAddress::P2pkh(_))
}
fn is_p2sh(a: &crate::types::DecodedAddress) -> bool {
    matches!(a, crate::types::DecodedAddress::P2sh(_))
}
fn is_p2wpkh(a: &crate::types::DecodedAddress) -> bool {
    matches!(a, crate::types::DecodedAddress::P2wpkh(_))
}
fn is_p2wsh(a: &crate::types::DecodedAddress) -> bool {
    matches!(a, crate::types::DecodedAddress::P2wsh(_))
}
fn is_p2tr(a: &crate::types::DecodedAddress) -> bool {
    matches!(a, crate::types::DecodedAddress::P2tr(_))
}

fn stacks_op_matches(want: &super::types::StacksProtocolOp, have: &StacksOp) -> bool {
    use super::types::StacksProtocolOp as W;
    matches!(
        (want, have),
        (W::BlockCommitted, StacksOp::BlockCommitted { .. })
            | (W::LeaderRegistered, StacksOp::LeaderRegistered { .. })
            | (W::StxTransferred, StacksOp::StxTransferred { .. })
            | (W::StxLocked, StacksOp::StxLocked { .. })
    )
}

fn evaluate_stacks(predicate: &Predicate, spec: &StacksMatchSpec, block: &Block) -> Vec<MatchedTx> {
    if let StacksMatchSpec::BlockHeight(rule) = spec {
        return if rule.matches(block.id.index) {
            block.transactions.iter().map(|tx| matched(predicate, block, tx)).collect()
        } else {
            vec![]
        };
    }

    if let StacksMatchSpec::SignerMessage(want) = spec {
        let want_kind = format!("{:?}", want.message_kind);
        let signer_matches = block.chain_metadata.signer_messages.iter().any(|m| {
            m.kind == want_kind
                && match want.signer_address.as_deref() {
                    Some(addr) => m.signer_address.as_deref() == Some(addr),
                    None => true,
                }
        });
        return if signer_matches {
            block.transactions.iter().map(|tx| matched(predicate, block, tx)).collect()
        } else {
            vec![]
        };
    }

    block
        .transactions
        .iter()
        .filter_map(|tx| match tx {
            Tx::Stacks(stx) if stacks_tx_matches(spec, stx) => Some(matched(predicate, block, tx)),
            _ => None,
        })
        .collect()
}

fn stacks_tx_matches(spec: &StacksMatchSpec, tx: &StacksTx) -> bool {
    match spec {
        StacksMatchSpec::Txid(rule) => tx.txid.eq_ignore_ascii_case(&rule.equals),
        StacksMatchSpec::FtEvent(want) => tx.events.iter().any(|e| match e {
            StacksEvent::FtEvent { asset_identifier, action } => {
                asset_identifier == &want.asset_identifier && actions_contain(&want.actions, *action)
            }
            _ => false,
        }),
        StacksMatchSpec::NftEvent(want) => tx.events.iter().any(|e| match e {
            StacksEvent::NftEvent { asset_identifier, action } => {
                asset_identifier == &want.asset_identifier && actions_contain(&want.actions, *action)
            }
            _ => false,
        }),
        StacksMatchSpec::StxEvent(want) => tx.events.iter().any(|e| match e {
            StacksEvent::StxEvent { action } => actions_contain(&want.actions, *action),
            _ => false,
        }),
        StacksMatchSpec::PrintEvent(want) => tx.events.iter().any(|e| match e {
            StacksEvent::PrintEvent { contract_identifier, value } => {
                contract_identifier == &want.contract_identifier && print_rule_matches(&want.rule, value)
            }
            _ => false,
        }),
        // Direct invocation only: a `ContractCall` transaction whose own
        // kind names the target contract/method. Calls made from within
        // another contract's body never surface as a top-level `StacksTx`
        // kind, so they are structurally excluded, not filtered out.
        StacksMatchSpec::ContractCall(want) => matches!(
            &tx.kind,
            StacksTxKind::ContractCall { contract_identifier, method }
                if contract_identifier == &want.contract_identifier && method == &want.method
        ),
        StacksMatchSpec::ContractDeployment(want) => match &tx.kind {
            StacksTxKind::ContractDeployment { deployer, implemented_traits, .. } => match want {
                ContractDeploymentSpec::Any => true,
                ContractDeploymentSpec::Deployer(addr) => deployer == addr,
                ContractDeploymentSpec::ImplementTrait(trait_id) => {
                    implemented_traits.iter().any(|t| t == trait_id)
                }
            },
            _ => false,
        },
        StacksMatchSpec::BlockHeight(_) | StacksMatchSpec::SignerMessage(_) => unreachable!(
            "handled in evaluate_stacks before reaching the per-tx matcher"
        ),
    }
}

fn actions_contain(wanted: &[EventActionFilter], have: EventAction) -> bool {
    wanted.iter().any(|w| {
        matches!(
            (w, have),
            (EventActionFilter::Mint, EventAction::Mint)
                | (EventActionFilter::Transfer, EventAction::Transfer)
                | (EventActionFilter::Burn, EventAction::Burn)
                | (EventActionFilter::Lock, EventAction::Lock)
        )
    })
}

fn print_rule_matches(rule: &PrintEventRule, value: &str) -> bool {
    match rule {
        PrintEventRule::Contains(needle) => value.contains(needle),
        PrintEventRule::MatchesRegex(pattern) => {
            Regex::new(pattern).map(|re| re.is_match(value)).unwrap_or(false)
        }
    }
}

/// Ordinal operations are block-normalized already; this helper exists so
/// callers building payload summaries can label an inscription op without
/// re-deriving it from witness data.
pub fn ordinal_label(op: &OrdinalOp) -> &'static str {
    match op {
        OrdinalOp::InscriptionRevealed { .. } => "inscription_revealed",
        OrdinalOp::InscriptionTransferred { .. } => "inscription_transferred",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicates::types::{
        ActionSpec, ExactMatchingRule, HexMatchingRule, PayloadShaping,
    };
    use crate::types::{
        BitcoinTxOutput, Chain, ChainMetadata, BlockIdentifier, DecodedAddress,
    };

    fn sample_predicate(if_this: MatchSpec, chain: Chain) -> Predicate {
        Predicate {
            uuid: "pred-1".to_string(),
            name: "test".to_string(),
            version: 1,
            chain,
            network: "mainnet".to_string(),
            owner_uuid: None,
            enabled: true,
            start_block: None,
            end_block: None,
            expire_after_occurrence: None,
            payload_shaping: PayloadShaping::default(),
            if_this,
            then_that: ActionSpec::Noop,
        }
    }

    fn sample_block_with_txs(chain: Chain, transactions: Vec<Tx>) -> Block {
        Block {
            chain,
            id: BlockIdentifier::new(10, "h10"),
            parent_id: BlockIdentifier::new(9, "h9"),
            timestamp: 0,
            transactions,
            chain_metadata: ChainMetadata::default(),
        }
    }

    #[test]
    fn txid_match_finds_transaction() {
        let tx = Tx::Bitcoin(BitcoinTx {
            txid: "deadbeef".to_string(),
            position: 0,
            inputs: vec![],
            outputs: vec![],
            ordinal_ops: vec![],
            stacks_protocol_ops: vec![],
        });
        let block = sample_block_with_txs(Chain::Bitcoin, vec![tx]);
        let predicate = sample_predicate(
            MatchSpec::Bitcoin(BitcoinMatchSpec::Txid(ExactMatchingRule { equals: "deadbeef".to_string() })),
            Chain::Bitcoin,
        );
        let matches = evaluate(&predicate, &block);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].tx_index, 0);
    }

    #[test]
    fn p2wpkh_address_match() {
        let addr = DecodedAddress::P2wpkh("bc1qxyz".to_string());
        let tx = Tx::Bitcoin(BitcoinTx {
            txid: "t1".to_string(),
            position: 0,
            inputs: vec![],
            outputs: vec![BitcoinTxOutput {
                value: 1000,
                script_pubkey_hex: "".to_string(),
                address: Some(addr),
                op_return_data_hex: None,
            }],
            ordinal_ops: vec![],
            stacks_protocol_ops: vec![],
        });
        let block = sample_block_with_txs(Chain::Bitcoin, vec![tx]);
        let predicate = sample_predicate(
            MatchSpec::Bitcoin(BitcoinMatchSpec::OutputsP2wpkh(ExactMatchingRule {
                equals: "bc1qxyz".to_string(),
            })),
            Chain::Bitcoin,
        );
        assert_eq!(evaluate(&predicate, &block).len(), 1);
    }

    #[test]
    fn op_return_starts_with_matches() {
        let tx = Tx::Bitcoin(BitcoinTx {
            txid: "t2".to_string(),
            position: 0,
            inputs: vec![],
            outputs: vec![BitcoinTxOutput {
                value: 0,
                script_pubkey_hex: "".to_string(),
                address: None,
                op_return_data_hex: Some("deadbeefcafe".to_string()),
            }],
            ordinal_ops: vec![],
            stacks_protocol_ops: vec![],
        });
        let block = sample_block_with_txs(Chain::Bitcoin, vec![tx]);
        let predicate = sample_predicate(
            MatchSpec::Bitcoin(BitcoinMatchSpec::OutputsOpReturn {
                op_return: HexMatchingRule::StartsWith("deadbeef".to_string()),
            }),
            Chain::Bitcoin,
        );
        assert_eq!(evaluate(&predicate, &block).len(), 1);
    }

    #[test]
    fn print_event_regex_word_boundary() {
        let tx = Tx::Stacks(StacksTx {
            txid: "s1".to_string(),
            position: 0,
            kind: StacksTxKind::Coinbase,
            events: vec![StacksEvent::PrintEvent {
                contract_identifier: "SP000.foo".to_string(),
                value: "hello world".to_string(),
            }],
            receipt: crate::types::TxReceipt { success: true, result: String::new() },
        });
        let block = sample_block_with_txs(Chain::Stacks, vec![tx]);
        let predicate = sample_predicate(
            MatchSpec::Stacks(StacksMatchSpec::PrintEvent(crate::predicates::types::PrintEventSpec {
                contract_identifier: "SP000.foo".to_string(),
                rule: PrintEventRule::MatchesRegex(r"\bworld\b".to_string()),
            })),
            Chain::Stacks,
        );
        assert_eq!(evaluate(&predicate, &block).len(), 1);

        let predicate_miss = sample_predicate(
            MatchSpec::Stacks(StacksMatchSpec::PrintEvent(crate::predicates::types::PrintEventSpec {
                contract_identifier: "SP000.foo".to_string(),
                rule: PrintEventRule::MatchesRegex(r"\bworldly\b".to_string()),
            })),
            Chain::Stacks,
        );
        assert_eq!(evaluate(&predicate_miss, &block).len(), 0);
    }

    #[test]
    fn contract_call_is_direct_invocation_only() {
        let direct = Tx::Stacks(StacksTx {
            txid: "s2".to_string(),
            position: 0,
            kind: StacksTxKind::ContractCall {
                contract_identifier: "SP000.foo".to_string(),
                method: "bar".to_string(),
            },
            events: vec![],
            receipt: crate::types::TxReceipt { success: true, result: String::new() },
        });
        // A transaction whose top-level kind calls a *different* contract,
        // even if that contract internally invokes SP000.foo.bar, must not
        // match - there's no representation of an inner call here at all,
        // which is exactly the point.
        let indirect = Tx::Stacks(StacksTx {
            txid: "s3".to_string(),
            position: 1,
            kind: StacksTxKind::ContractCall {
                contract_identifier: "SP000.proxy".to_string(),
                method: "relay".to_string(),
            },
            events: vec![],
            receipt: crate::types::TxReceipt { success: true, result: String::new() },
        });
        let block = sample_block_with_txs(Chain::Stacks, vec![direct, indirect]);
        let predicate = sample_predicate(
            MatchSpec::Stacks(StacksMatchSpec::ContractCall(crate::predicates::types::ContractCallSpec {
                contract_identifier: "SP000.foo".to_string(),
                method: "bar".to_string(),
            })),
            Chain::Stacks,
        );
        let matches = evaluate(&predicate, &block);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].tx_index, 0);
    }

    #[test]
    fn block_height_predicate_selects_whole_block() {
        let tx1 = Tx::Stacks(StacksTx {
            txid: "a".to_string(),
            position: 0,
            kind: StacksTxKind::Coinbase,
            events: vec![],
            receipt: crate::types::TxReceipt { success: true, result: String::new() },
        });
        let tx2 = Tx::Stacks(StacksTx {
            txid: "b".to_string(),
            position: 1,
            kind: StacksTxKind::Coinbase,
            events: vec![],
            receipt: crate::types::TxReceipt { success: true, result: String::new() },
        });
        let block = sample_block_with_txs(Chain::Stacks, vec![tx1, tx2]);
        let predicate = sample_predicate(
            MatchSpec::Stacks(StacksMatchSpec::BlockHeight(
                crate::predicates::types::BlockHeightRule::Equals(10),
            )),
            Chain::Stacks,
        );
        assert_eq!(evaluate(&predicate, &block).len(), 2);
    }
}
