//! scriptPubKey classification and address rendering.
//!
//! `bitcoin::Address::from_script` knows the P2PKH/P2SH/P2WPKH/P2WSH
//! templates; the pinned `bitcoin` version predates `Payload::from_script`
//! recognizing witness-v1 programs, so taproot (P2TR) outputs are
//! classified here from the witness-program pattern and the bech32m
//! address is hand-encoded per BIP350 instead of going through it.

use bech32::{ToBase32, Variant};
use bitcoin::network::constants::Network;
use bitcoin::util::address::Address;
use bitcoin::Script;

use crate::types::DecodedAddress;

fn network_from_name(name: &str) -> Network {
    match name {
        "testnet" => Network::Testnet,
        "regtest" => Network::Regtest,
        _ => Network::Bitcoin,
    }
}

fn bech32_hrp(network: Network) -> &'static str {
    match network {
        Network::Bitcoin => "bc",
        Network::Testnet => "tb",
        Network::Regtest => "bcrt",
        _ => "bc",
    }
}

/// BIP350 bech32m encoding of a segwit v1 (taproot) witness program.
fn encode_taproot_address(program: &[u8], network: Network) -> Option<String> {
    let version = bech32::u5::try_from_u8(1).ok()?;
    let mut data = vec![version];
    data.extend(program.to_base32());
    bech32::encode(bech32_hrp(network), data, Variant::Bech32m).ok()
}

/// Classify a scriptPubKey and render its address, if the script matches a
/// known standard template.
pub fn decode_address(script_pubkey: &[u8], network_name: &str) -> Option<DecodedAddress> {
    let network = network_from_name(network_name);
    let script = Script::from(script_pubkey.to_vec());

    if is_taproot(&script) {
        let program = &script.as_bytes()[2..34];
        return Some(DecodedAddress::P2tr(encode_taproot_address(program, network)?));
    }

    let addr = Address::from_script(&script, network)?;
    let rendered = addr.to_string();
    if is_p2pkh(&script) {
        Some(DecodedAddress::P2pkh(rendered))
    } else if is_p2sh(&script) {
        Some(DecodedAddress::P2sh(rendered))
    } else if is_p2wpkh(&script) {
        Some(DecodedAddress::P2wpkh(rendered))
    } else if is_p2wsh(&script) {
        Some(DecodedAddress::P2wsh(rendered))
    } else {
        None
    }
}

fn is_p2pkh(script: &Script) -> bool {
    let b = script.as_bytes();
    b.len() == 25
        && b[0] == 0x76 // OP_DUP
        && b[1] == 0xa9 // OP_HASH160
        && b[2] == 0x14
        && b[23] == 0x88 // OP_EQUALVERIFY
        && b[24] == 0xac // OP_CHECKSIG
}

fn is_p2sh(script: &Script) -> bool {
    let b = script.as_bytes();
    b.len() == 23 && b[0] == 0xa9 && b[1] == 0x14 && b[22] == 0x87
}

fn is_p2wpkh(script: &Script) -> bool {
    let b = script.as_bytes();
    b.len() == 22 && b[0] == 0x00 && b[1] == 0x14
}

fn is_p2wsh(script: &Script) -> bool {
    let b = script.as_bytes();
    b.len() == 34 && b[0] == 0x00 && b[1] == 0x20
}

fn is_taproot(script: &Script) -> bool {
    let b = script.as_bytes();
    b.len() == 34 && b[0] == 0x51 && b[1] == 0x20 // OP_1 <32-byte-x-only-pubkey>
}

/// Returns `Some(data)` when the scriptPubKey is an `OP_RETURN` output,
/// with `data` being whatever bytes follow the single push.
pub fn extract_op_return_data(script_pubkey: &[u8]) -> Option<Vec<u8>> {
    let b = script_pubkey;
    if b.is_empty() || b[0] != 0x6a {
        return None;
    }
    if b.len() == 1 {
        return Some(vec![]);
    }
    let script = Script::from(b.to_vec());
    let mut instructions = script.instructions().skip(1);
    match instructions.next() {
        Some(Ok(bitcoin::blockdata::script::Instruction::PushBytes(data))) => Some(data.to_vec()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_p2pkh() {
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&[0xAA; 20]);
        script.extend_from_slice(&[0x88, 0xac]);
        assert!(is_p2pkh(&Script::from(script)));
    }

    #[test]
    fn classifies_p2wpkh() {
        let mut script = vec![0x00, 0x14];
        script.extend_from_slice(&[0xBB; 20]);
        assert!(is_p2wpkh(&Script::from(script)));
    }

    #[test]
    fn classifies_taproot() {
        let mut script = vec![0x51, 0x20];
        script.extend_from_slice(&[0xCC; 32]);
        assert!(is_taproot(&Script::from(script)));
    }

    #[test]
    fn decode_address_renders_taproot_bech32m() {
        let mut script = vec![0x51, 0x20];
        script.extend_from_slice(&[0xCC; 32]);
        let decoded = decode_address(&script, "bitcoin").unwrap();
        match decoded {
            DecodedAddress::P2tr(addr) => {
                assert!(addr.starts_with("bc1p"));
            }
            other => panic!("expected P2tr, got {other:?}"),
        }
    }

    #[test]
    fn extracts_op_return_payload() {
        let mut script = vec![0x6a, 0x04];
        script.extend_from_slice(b"abcd");
        assert_eq!(extract_op_return_data(&script), Some(b"abcd".to_vec()));
    }

    #[test]
    fn non_op_return_yields_none() {
        let script = vec![0x76, 0xa9];
        assert_eq!(extract_op_return_data(&script), None);
    }
}
