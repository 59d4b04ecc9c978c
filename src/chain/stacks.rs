//! Stacks block source adapter: an HTTP event-observer surface the Stacks
//! node pushes block/burn/attachment notifications to. Unlike the Bitcoin
//! adapter this chain is push-only; `fetch_block`/`tip` are served from a
//! bounded in-memory ring of recently received blocks rather than an
//! outbound query, since the node exposes no pull API here.

use std::collections::VecDeque;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::StacksConfig;
use crate::error::EngineError;
use crate::types::{
    BlockIdentifier, Chain, ChainMetadata, EventAction, RawBlock, SignerMessageEvent, StacksEvent,
    StacksTx, StacksTxKind, Tx, TxReceipt,
};

const RING_CAPACITY: usize = 256;

struct SharedState {
    ring: RwLock<VecDeque<RawBlock>>,
    out: Sender<RawBlock>,
    /// Signer messages observed since the last `/new_block`, attached to
    /// the next block's `chain_metadata.signer_messages` on ingest.
    pending_signer_messages: RwLock<Vec<SignerMessageEvent>>,
}

pub struct StacksAdapter {
    config: StacksConfig,
    shared: Arc<SharedState>,
    receiver: std::sync::Mutex<Option<Receiver<RawBlock>>>,
}

impl StacksAdapter {
    pub fn new(config: StacksConfig) -> Self {
        let (tx, rx) = mpsc::channel(256);
        Self {
            config,
            shared: Arc::new(SharedState {
                ring: RwLock::new(VecDeque::new()),
                out: tx,
                pending_signer_messages: RwLock::new(Vec::new()),
            }),
            receiver: std::sync::Mutex::new(Some(rx)),
        }
    }

    async fn find_in_ring(&self, hash: &str) -> Option<RawBlock> {
        self.shared.ring.read().await.iter().find(|b| b.id.hash == hash).cloned()
    }
}

impl super::BlockSourceAdapter for StacksAdapter {
    /// Binds and starts serving the event-observer endpoints on
    /// `config.event_observer_bind`, then returns the channel of ingested
    /// blocks. Callers must not invoke this more than once per adapter.
    fn subscribe(&self) -> Receiver<RawBlock> {
        let rx = self
            .receiver
            .lock()
            .unwrap()
            .take()
            .expect("StacksAdapter::subscribe called more than once");

        let app = Router::new()
            .route("/new_block", post(handle_new_block))
            .route("/new_microblocks", post(handle_ignored))
            .route("/new_burn_block", post(handle_ignored))
            .route("/attachments/new", post(handle_ignored))
            .route("/stackerdb_chunks", post(handle_stackerdb_chunks))
            .route("/new_mempool_tx", post(handle_ignored))
            .with_state(Arc::clone(&self.shared));

        let addr = self.config.event_observer_bind.clone();
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&addr).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(error = %e, addr, "failed to bind stacks event observer");
                    return;
                }
            };
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "stacks event observer server exited");
            }
        });

        rx
    }

    async fn fetch_block(&self, id: &BlockIdentifier) -> Result<RawBlock, EngineError> {
        self.find_in_ring(&id.hash)
            .await
            .ok_or_else(|| EngineError::transient(format!("stacks block {} not in local ring", id.hash)))
    }

    async fn tip(&self) -> Result<BlockIdentifier, EngineError> {
        self.shared
            .ring
            .read()
            .await
            .back()
            .map(|b| b.id.clone())
            .ok_or_else(|| EngineError::transient("no stacks blocks observed yet"))
    }
}

async fn handle_ignored() -> StatusCode {
    StatusCode::OK
}

async fn handle_stackerdb_chunks(State(shared): State<Arc<SharedState>>, Json(body): Json<Value>) -> StatusCode {
    let messages = body
        .get("modified_slots")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(decode_signer_message).collect::<Vec<_>>())
        .unwrap_or_default();
    if !messages.is_empty() {
        shared.pending_signer_messages.write().await.extend(messages);
    }
    StatusCode::OK
}

fn decode_signer_message(slot: &Value) -> Option<SignerMessageEvent> {
    let kind = slot.get("message_kind").and_then(|v| v.as_str())?.to_string();
    let signer_address = slot.get("signer_address").and_then(|v| v.as_str()).map(str::to_string);
    Some(SignerMessageEvent { kind, signer_address })
}

async fn handle_new_block(State(shared): State<Arc<SharedState>>, Json(body): Json<Value>) -> StatusCode {
    match parse_new_block_payload(&body) {
        Ok(mut block) => {
            debug!(height = block.id.index, "stacks block ingested");
            {
                let mut pending = shared.pending_signer_messages.write().await;
                block.chain_metadata.signer_messages = std::mem::take(&mut pending);
            }
            {
                let mut ring = shared.ring.write().await;
                if ring.len() == RING_CAPACITY {
                    ring.pop_front();
                }
                ring.push_back(block.clone());
            }
            if shared.out.send(block).await.is_err() {
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
            StatusCode::OK
        }
        Err(e) => {
            warn!(error = %e, "failed to parse /new_block payload");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn parse_new_block_payload(body: &Value) -> Result<RawBlock, EngineError> {
    let height = body
        .get("block_height")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| EngineError::adapter_protocol("new_block missing block_height"))?;
    let hash = body
        .get("index_block_hash")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::adapter_protocol("new_block missing index_block_hash"))?
        .to_string();
    let parent_hash = body
        .get("parent_index_block_hash")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| hash.clone());
    let burn_block_time = body.get("burn_block_time").and_then(|v| v.as_u64()).unwrap_or(0);

    let chain_metadata = ChainMetadata {
        bitcoin_anchor_block_identifier: body
            .get("burn_block_height")
            .and_then(|v| v.as_u64())
            .zip(body.get("burn_block_hash").and_then(|v| v.as_str()))
            .map(|(h, bh)| BlockIdentifier::new(h, bh)),
        confirm_microblock_identifier: body
            .get("parent_microblock")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        pox_cycle_index: body.get("pox_cycle_index").and_then(|v| v.as_u64()),
        pox_cycle_length: body.get("pox_cycle_length").and_then(|v| v.as_u64()),
        pox_cycle_position: body.get("pox_cycle_position").and_then(|v| v.as_u64()),
        stacks_block_hash: body.get("block_hash").and_then(|v| v.as_str()).map(str::to_string),
        tenure_height: body.get("tenure_height").and_then(|v| v.as_u64()),
        block_time: body.get("block_time").and_then(|v| v.as_u64()),
        signer_bitvec: body.get("signer_bitvec").and_then(|v| v.as_str()).map(str::to_string),
        signer_signature: body
            .get("signer_signature")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
            .unwrap_or_default(),
        cycle_number: body.get("cycle_number").and_then(|v| v.as_u64()),
        n_bits: None,
    };

    let transactions = body
        .get("transactions")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().enumerate().filter_map(|(i, tx)| decode_tx(tx, i as u32)).collect())
        .unwrap_or_default();

    Ok(RawBlock {
        chain: Chain::Stacks,
        id: BlockIdentifier::new(height, hash),
        parent_id: BlockIdentifier::new(height.saturating_sub(1), parent_hash),
        timestamp: burn_block_time,
        transactions,
        chain_metadata,
    })
}

fn decode_tx(tx: &Value, position: u32) -> Option<Tx> {
    let txid = tx.get("txid").and_then(|v| v.as_str())?.to_string();
    let success = tx.get("status").and_then(|v| v.as_str()).map(|s| s == "success").unwrap_or(false);
    let result = tx.get("raw_result").and_then(|v| v.as_str()).unwrap_or("").to_string();

    let kind = tx
        .get("payload")
        .map(decode_kind)
        .unwrap_or(StacksTxKind::Coinbase);

    let events = tx
        .get("events")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(decode_event).collect())
        .unwrap_or_default();

    Some(Tx::Stacks(StacksTx { txid, position, kind, events, receipt: TxReceipt { success, result } }))
}

fn decode_kind(payload: &Value) -> StacksTxKind {
    match payload.get("type").and_then(|v| v.as_str()) {
        Some("ContractCall") => StacksTxKind::ContractCall {
            contract_identifier: field_str(payload, "contract_identifier"),
            method: field_str(payload, "method"),
        },
        Some("SmartContract") => StacksTxKind::ContractDeployment {
            contract_identifier: field_str(payload, "contract_identifier"),
            deployer: field_str(payload, "deployer"),
            implemented_traits: payload
                .get("implemented_traits")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
        },
        Some("TokenTransfer") => StacksTxKind::TokenTransfer {
            sender: field_str(payload, "sender"),
            recipient: field_str(payload, "recipient"),
            amount: payload.get("amount").and_then(|v| v.as_u64()).unwrap_or(0),
        },
        _ => StacksTxKind::Coinbase,
    }
}

fn field_str(v: &Value, key: &str) -> String {
    v.get(key).and_then(|x| x.as_str()).unwrap_or("").to_string()
}

fn decode_event(event: &Value) -> Option<StacksEvent> {
    let event_type = event.get("type").and_then(|v| v.as_str())?;
    match event_type {
        "stx_transfer_event" | "stx_mint_event" | "stx_burn_event" | "stx_lock_event" => {
            Some(StacksEvent::StxEvent { action: action_for(event_type) })
        }
        "ft_transfer_event" | "ft_mint_event" | "ft_burn_event" => {
            let data = event.get(event_type)?;
            Some(StacksEvent::FtEvent {
                asset_identifier: field_str(data, "asset_identifier"),
                action: action_for(event_type),
            })
        }
        "nft_transfer_event" | "nft_mint_event" | "nft_burn_event" => {
            let data = event.get(event_type)?;
            Some(StacksEvent::NftEvent {
                asset_identifier: field_str(data, "asset_identifier"),
                action: action_for(event_type),
            })
        }
        "contract_event" => {
            let data = event.get("contract_event")?;
            let contract_identifier = field_str(data, "contract_identifier");
            let topic = field_str(data, "topic");
            let value = field_str(data, "raw_value");
            if topic == "print" {
                Some(StacksEvent::PrintEvent { contract_identifier, value })
            } else {
                Some(StacksEvent::ContractEvent { contract_identifier, topic, value })
            }
        }
        _ => None,
    }
}

fn action_for(event_type: &str) -> EventAction {
    if event_type.contains("transfer") {
        EventAction::Transfer
    } else if event_type.contains("mint") {
        EventAction::Mint
    } else if event_type.contains("burn") {
        EventAction::Burn
    } else {
        EventAction::Lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_new_block() {
        let body = serde_json::json!({
            "block_height": 42,
            "index_block_hash": "0xabc",
            "parent_index_block_hash": "0xdef",
            "burn_block_time": 1000,
            "transactions": [
                {"txid": "0x1", "status": "success", "raw_result": "0x00", "payload": {"type": "Coinbase"}}
            ]
        });
        let block = parse_new_block_payload(&body).unwrap();
        assert_eq!(block.id.index, 42);
        assert_eq!(block.transactions.len(), 1);
    }

    #[test]
    fn decodes_contract_call_and_print_event() {
        let tx = serde_json::json!({
            "txid": "0x2",
            "status": "success",
            "raw_result": "0x00",
            "payload": {"type": "ContractCall", "contract_identifier": "SP000.foo", "method": "bar"},
            "events": [
                {"type": "contract_event", "contract_event": {"contract_identifier": "SP000.foo", "topic": "print", "raw_value": "hello"}}
            ]
        });
        let decoded = decode_tx(&tx, 0).unwrap();
        match decoded {
            Tx::Stacks(t) => {
                assert!(matches!(t.kind, StacksTxKind::ContractCall { .. }));
                assert_eq!(t.events.len(), 1);
                assert!(matches!(t.events[0], StacksEvent::PrintEvent { .. }));
            }
            _ => panic!("expected stacks tx"),
        }
    }

    #[test]
    fn missing_txid_skips_transaction() {
        let tx = serde_json::json!({"status": "success"});
        assert!(decode_tx(&tx, 0).is_none());
    }
}
