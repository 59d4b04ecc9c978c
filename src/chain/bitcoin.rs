//! Bitcoin block source adapter: RPC polling (optionally accelerated by a
//! ZeroMQ `hashblock` subscription) normalized into `RawBlock`.

use std::sync::Arc;
use std::time::Duration;

use pivx_rpc_rs::BitcoinRpcClient;
use serde_json::Value;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::{debug, error, warn};

use crate::config::BitcoinConfig;
use crate::error::EngineError;
use crate::types::{
    BitcoinTx, BitcoinTxInput, BitcoinTxOutput, BlockIdentifier, Chain, ChainMetadata, OrdinalOp,
    RawBlock, StacksOp, Tx,
};

use super::script_utils::{decode_address, extract_op_return_data};

const STACKS_OPCODE_BLOCK_COMMIT: u8 = b'[';
const STACKS_OPCODE_KEY_REGISTER: u8 = b'^';
const STACKS_OPCODE_STACK_STX: u8 = b'x';
const STACKS_OPCODE_TRANSFER_STX: u8 = b'$';

fn stacks_magic_bytes(network: &str) -> [u8; 2] {
    match network {
        "mainnet" => *b"X2",
        "testnet" => *b"T2",
        _ => *b"id",
    }
}

pub struct BitcoinAdapter {
    config: BitcoinConfig,
    rpc_client: Arc<BitcoinRpcClient>,
    http_client: reqwest::blocking::Client,
}

impl BitcoinAdapter {
    pub fn new(config: BitcoinConfig) -> Self {
        let rpc_client = Arc::new(BitcoinRpcClient::new(
            config.rpc_url.clone(),
            Some(config.rpc_username.clone()),
            Some(config.rpc_password.clone()),
            3,
            10,
            2000,
        ));
        Self { config, rpc_client, http_client: reqwest::blocking::Client::new() }
    }

    /// `getblock <hash> 2` via raw RPC: the library's typed `getblock`
    /// cannot deserialize the verbosity-2 response (mixed string/object
    /// entries in `tx`), so this goes over `reqwest` directly.
    fn fetch_raw_block(&self, hash: &str) -> Result<Value, EngineError> {
        let response = self
            .http_client
            .post(&self.config.rpc_url)
            .basic_auth(&self.config.rpc_username, Some(&self.config.rpc_password))
            .json(&serde_json::json!({
                "jsonrpc": "1.0",
                "id": "chainhook-engine",
                "method": "getblock",
                "params": [hash, 2]
            }))
            .send()
            .map_err(|e| EngineError::transient(format!("bitcoin rpc request failed: {e}")))?;

        let json: Value = response
            .json()
            .map_err(|e| EngineError::adapter_protocol(format!("invalid rpc response json: {e}")))?;

        json.get("result")
            .cloned()
            .ok_or_else(|| EngineError::adapter_protocol("rpc response has no result field"))
    }

    fn decode_block(&self, raw: &Value) -> Result<RawBlock, EngineError> {
        let hash = raw
            .get("hash")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::adapter_protocol("block missing hash"))?
            .to_string();
        let height = raw
            .get("height")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| EngineError::adapter_protocol("block missing height"))?;
        let time = raw.get("time").and_then(|v| v.as_u64()).unwrap_or(0);
        let bits_hex = raw.get("bits").and_then(|v| v.as_str()).unwrap_or("00000000");
        let n_bits = u32::from_str_radix(bits_hex, 16).unwrap_or(0);
        let parent_hash = raw
            .get("previousblockhash")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| hash.clone());

        let tx_array = raw
            .get("tx")
            .and_then(|v| v.as_array())
            .ok_or_else(|| EngineError::adapter_protocol("block missing tx array"))?;

        let network = self.config.network.clone();
        let mut transactions = Vec::with_capacity(tx_array.len());
        for (position, tx_val) in tx_array.iter().enumerate() {
            transactions.push(Tx::Bitcoin(self.decode_tx(tx_val, position as u32, &network)?));
        }

        Ok(RawBlock {
            chain: Chain::Bitcoin,
            id: BlockIdentifier::new(height, hash),
            parent_id: BlockIdentifier::new(height.saturating_sub(1), parent_hash),
            timestamp: time,
            transactions,
            chain_metadata: ChainMetadata { n_bits: Some(n_bits), ..Default::default() },
        })
    }

    fn decode_tx(&self, tx_val: &Value, position: u32, network: &str) -> Result<BitcoinTx, EngineError> {
        let txid = tx_val
            .get("txid")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::adapter_protocol("tx missing txid"))?
            .to_string();

        let mut inputs = Vec::new();
        for vin in tx_val.get("vin").and_then(|v| v.as_array()).into_iter().flatten() {
            let previous_txid = vin.get("txid").and_then(|v| v.as_str()).unwrap_or("").to_string();
            let previous_vout = vin.get("vout").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            let script_sig_hex = vin
                .get("scriptSig")
                .and_then(|v| v.get("hex"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let witness_hex = vin
                .get("txinwitness")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(|w| w.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            inputs.push(BitcoinTxInput { previous_txid, previous_vout, script_sig_hex, witness_hex });
        }

        let mut outputs = Vec::new();
        let mut stacks_protocol_ops = Vec::new();
        for vout in tx_val.get("vout").and_then(|v| v.as_array()).into_iter().flatten() {
            let value_btc = vout.get("value").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let value = (value_btc * 100_000_000.0).round() as u64;
            let script_pubkey_hex = vout
                .get("scriptPubKey")
                .and_then(|v| v.get("hex"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let script_bytes = hex::decode(&script_pubkey_hex).unwrap_or_default();

            let address = decode_address(&script_bytes, network);
            let op_return_data = extract_op_return_data(&script_bytes);

            if let Some(ref data) = op_return_data {
                if let Some(op) = decode_stacks_protocol_op(data, network) {
                    stacks_protocol_ops.push(op);
                }
            }

            outputs.push(BitcoinTxOutput {
                value,
                script_pubkey_hex,
                address,
                op_return_data_hex: op_return_data.map(hex::encode),
            });
        }

        let ordinal_ops = inputs
            .iter()
            .enumerate()
            .filter_map(|(idx, input)| detect_inscription_reveal(input, &txid, idx))
            .collect();

        Ok(BitcoinTx { txid, position, inputs, outputs, ordinal_ops, stacks_protocol_ops })
    }
}

/// Decodes the `{magic}{opcode}{payload}` burnchain op format Stacks nodes
/// embed in a Bitcoin `OP_RETURN`. Only the operations `stacks_protocol`
/// predicates can match are decoded; anything else (or a magic mismatch)
/// is ignored.
fn decode_stacks_protocol_op(data: &[u8], network: &str) -> Option<StacksOp> {
    let magic = stacks_magic_bytes(network);
    if data.len() < 3 || data[0] != magic[0] || data[1] != magic[1] {
        return None;
    }
    let opcode = data[2];
    let payload = &data[3..];
    match opcode {
        STACKS_OPCODE_BLOCK_COMMIT if payload.len() >= 32 => {
            Some(StacksOp::BlockCommitted { stacks_block_hash: hex::encode(&payload[..32]) })
        }
        STACKS_OPCODE_KEY_REGISTER if payload.len() >= 20 => {
            Some(StacksOp::LeaderRegistered { stx_address: hex::encode(&payload[..20]) })
        }
        STACKS_OPCODE_TRANSFER_STX if payload.len() >= 8 => {
            let amount = u64::from_be_bytes(payload[..8].try_into().ok()?);
            Some(StacksOp::StxTransferred {
                sender: String::new(),
                recipient: String::new(),
                amount,
            })
        }
        STACKS_OPCODE_STACK_STX if payload.len() >= 16 => {
            let amount = u64::from_be_bytes(payload[..8].try_into().ok()?);
            let unlock_height = u64::from_be_bytes(payload[8..16].try_into().ok()?);
            Some(StacksOp::StxLocked { address: String::new(), amount, unlock_height })
        }
        _ => None,
    }
}

/// Best-effort detection of an ordinal inscription reveal in a taproot
/// witness: an envelope of the form
/// `OP_FALSE OP_IF "ord" ... OP_ENDIF` inside the tapscript leaf (the last
/// witness item when the previous one looks like a control block).
fn detect_inscription_reveal(input: &BitcoinTxInput, txid: &str, vin_index: usize) -> Option<OrdinalOp> {
    let witness = &input.witness_hex;
    if witness.len() < 2 {
        return None;
    }
    let candidate_script = witness.get(witness.len() - 2)?;
    let script_bytes = hex::decode(candidate_script).ok()?;
    if !contains_envelope_marker(&script_bytes) {
        return None;
    }
    Some(OrdinalOp::InscriptionRevealed {
        inscription_id: format!("{}i{}", txid, vin_index),
        content_type: extract_content_type(&script_bytes),
    })
}

fn contains_envelope_marker(script: &[u8]) -> bool {
    // OP_FALSE OP_IF <"ord"> ...
    script.windows(5).any(|w| w == [0x00, 0x63, 0x03, b'o', b'r'])
}

fn extract_content_type(script: &[u8]) -> Option<String> {
    // "ord" push, then OP_1 (content-type tag), then a push of the mime type.
    let marker = script.windows(5).position(|w| w == [0x00, 0x63, 0x03, b'o', b'r'])?;
    let after_ord = marker + 5 + 1; // skip marker bytes + trailing 'd'
    if after_ord + 1 >= script.len() || script[after_ord] != 0x01 {
        return None;
    }
    let len = *script.get(after_ord + 1)? as usize;
    let start = after_ord + 2;
    script.get(start..start + len).and_then(|b| std::str::from_utf8(b).ok()).map(str::to_string)
}

impl super::BlockSourceAdapter for BitcoinAdapter {
    fn subscribe(&self) -> Receiver<RawBlock> {
        let (tx, rx) = mpsc::channel(256);
        spawn_poll_loop(
            self.config.clone(),
            Arc::clone(&self.rpc_client),
            self.http_client.clone(),
            tx.clone(),
        );
        #[cfg(feature = "zeromq")]
        if let Some(zmq_url) = self.config.zmq_url.clone() {
            spawn_zmq_listener(zmq_url, self.config.clone(), Arc::clone(&self.rpc_client), self.http_client.clone(), tx);
        }
        rx
    }

    async fn fetch_block(&self, id: &BlockIdentifier) -> Result<RawBlock, EngineError> {
        let raw = self.fetch_raw_block(&id.hash)?;
        self.decode_block(&raw)
    }

    async fn tip(&self) -> Result<BlockIdentifier, EngineError> {
        let rpc = Arc::clone(&self.rpc_client);
        tokio::task::spawn_blocking(move || {
            let height = rpc.getblockcount().map_err(|e| EngineError::transient(format!("getblockcount: {e}")))?;
            let hash = rpc
                .getblockhash(height)
                .map_err(|e| EngineError::transient(format!("getblockhash: {e}")))?;
            Ok(BlockIdentifier::new(height as u64, hash))
        })
        .await
        .map_err(|e| EngineError::transient(format!("join error: {e}")))?
    }
}

fn spawn_poll_loop(
    config: BitcoinConfig,
    rpc_client: Arc<BitcoinRpcClient>,
    http_client: reqwest::blocking::Client,
    out: Sender<RawBlock>,
) {
    tokio::spawn(async move {
        let mut last_height: Option<u64> = None;
        let adapter = BitcoinAdapter { config: config.clone(), rpc_client, http_client };
        loop {
            let tip = match <BitcoinAdapter as super::BlockSourceAdapter>::tip(&adapter).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "bitcoin tip poll failed");
                    tokio::time::sleep(Duration::from_secs(config.poll_interval_secs)).await;
                    continue;
                }
            };

            let from = last_height.map(|h| h + 1).unwrap_or(tip.index);
            for height in from..=tip.index {
                let hash = match fetch_hash_at_height(&adapter, height).await {
                    Ok(h) => h,
                    Err(e) => {
                        error!(error = %e, height, "failed to fetch block hash");
                        break;
                    }
                };
                match <BitcoinAdapter as super::BlockSourceAdapter>::fetch_block(
                    &adapter,
                    &BlockIdentifier::new(height, hash),
                )
                .await
                {
                    Ok(block) => {
                        debug!(height, "bitcoin block ingested");
                        if out.send(block).await.is_err() {
                            return;
                        }
                        last_height = Some(height);
                    }
                    Err(e) => {
                        error!(error = %e, height, "failed to decode block");
                        break;
                    }
                }
            }

            tokio::time::sleep(Duration::from_secs(config.poll_interval_secs)).await;
        }
    });
}

async fn fetch_hash_at_height(adapter: &BitcoinAdapter, height: u64) -> Result<String, EngineError> {
    let rpc = Arc::clone(&adapter.rpc_client);
    tokio::task::spawn_blocking(move || {
        rpc.getblockhash(height as i64).map_err(|e| EngineError::transient(format!("getblockhash: {e}")))
    })
    .await
    .map_err(|e| EngineError::transient(format!("join error: {e}")))?
}

#[cfg(feature = "zeromq")]
fn spawn_zmq_listener(
    zmq_url: String,
    config: BitcoinConfig,
    rpc_client: Arc<BitcoinRpcClient>,
    http_client: reqwest::blocking::Client,
    out: Sender<RawBlock>,
) {
    let (notify_tx, mut notify_rx) = mpsc::channel::<()>(64);

    std::thread::spawn(move || {
        let ctx = zmq::Context::new();
        let Ok(socket) = ctx.socket(zmq::SUB) else { return };
        if socket.connect(&zmq_url).is_err() {
            return;
        }
        let _ = socket.set_subscribe(b"hashblock");
        loop {
            if socket.recv_multipart(0).is_err() {
                return;
            }
            if notify_tx.blocking_send(()).is_err() {
                return;
            }
        }
    });

    tokio::spawn(async move {
        let adapter = BitcoinAdapter { config: config.clone(), rpc_client, http_client };
        while notify_rx.recv().await.is_some() {
            if let Ok(tip) = <BitcoinAdapter as super::BlockSourceAdapter>::tip(&adapter).await {
                if let Ok(block) = <BitcoinAdapter as super::BlockSourceAdapter>::fetch_block(&adapter, &tip).await {
                    if out.send(block).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
    tracing::info!("zmq hashblock listener started");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_stacks_block_commit_op() {
        let mut data = b"X2".to_vec();
        data.push(STACKS_OPCODE_BLOCK_COMMIT);
        data.extend_from_slice(&[0xAB; 32]);
        let op = decode_stacks_protocol_op(&data, "mainnet").unwrap();
        assert!(matches!(op, StacksOp::BlockCommitted { .. }));
    }

    #[test]
    fn wrong_magic_is_ignored() {
        let mut data = b"XX".to_vec();
        data.push(STACKS_OPCODE_BLOCK_COMMIT);
        data.extend_from_slice(&[0xAB; 32]);
        assert!(decode_stacks_protocol_op(&data, "mainnet").is_none());
    }

    #[test]
    fn detects_inscription_envelope() {
        let mut script = vec![0x00, 0x63, 0x03, b'o', b'r', b'd', 0x01, 0x04];
        script.extend_from_slice(b"text");
        let input = BitcoinTxInput {
            previous_txid: "a".repeat(64),
            previous_vout: 0,
            script_sig_hex: String::new(),
            witness_hex: vec![hex::encode(&script), "cc".repeat(33)],
        };
        let op = detect_inscription_reveal(&input, "deadbeef", 0).unwrap();
        match op {
            OrdinalOp::InscriptionRevealed { content_type, .. } => {
                assert_eq!(content_type.as_deref(), Some("text"));
            }
            _ => panic!("expected reveal"),
        }
    }
}
