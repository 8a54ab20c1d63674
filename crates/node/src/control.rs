//! Line-oriented control socket.
//!
//! One command per line, whitespace-separated arguments, one JSON object
//! per response. This is the operator surface; the peer-to-peer layer
//! lives elsewhere.

use std::sync::Arc;

use plbd_chainstate::state::ChainState;
use plbd_chainstate::validation::ChainError;
use plbd_consensus::{hash256_from_hex, hash256_to_hex};
use plbd_primitives::block::{Block, BlockHeader};
use plbd_primitives::Transaction;
use plbd_storage::KeyValueStore;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::info;

pub async fn serve<S: KeyValueStore + 'static>(
    addr: String,
    chain: Arc<ChainState<S>>,
) -> Result<(), String> {
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|err| format!("control bind {addr}: {err}"))?;
    info!(%addr, "control socket listening");
    loop {
        let (socket, peer) = listener.accept().await.map_err(|err| err.to_string())?;
        let chain = Arc::clone(&chain);
        tokio::spawn(async move {
            let (reader, mut writer) = socket.into_split();
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let (response, stop) = dispatch(&chain, &line);
                let mut payload = response.to_string();
                payload.push('\n');
                if writer.write_all(payload.as_bytes()).await.is_err() {
                    break;
                }
                if stop {
                    info!(%peer, "stop requested");
                    return;
                }
            }
        });
    }
}

fn dispatch<S: KeyValueStore + 'static>(
    chain: &ChainState<S>,
    line: &str,
) -> (serde_json::Value, bool) {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();
    let result = match command {
        "submitblock" => submit_block(chain, &args),
        "submitheader" => submit_header(chain, &args),
        "sendrawtransaction" => send_raw_transaction(chain, &args),
        "getbestblock" => get_best_block(chain),
        "getblock" => get_block(chain, &args),
        "invalidateblock" => block_command(chain, &args, ChainState::invalidate_block),
        "reconsiderblock" => block_command(chain, &args, ChainState::reconsider_block),
        "preciousblock" => block_command(chain, &args, ChainState::precious_block),
        "prunetoheight" => prune_to_height(chain, &args),
        "verifychain" => verify_chain(chain, &args),
        "getmempoolinfo" => Ok(json!({
            "size": chain.mempool_len(),
            "txids": chain
                .mempool_txids()
                .iter()
                .map(hash256_to_hex)
                .collect::<Vec<_>>(),
        })),
        "dumpmempool" => Ok(json!({ "hex": to_hex(&chain.dump_mempool()) })),
        "loadmempool" => load_mempool(chain, &args),
        "stop" => return (json!({ "result": "stopping" }), true),
        other => Err(format!("unknown command {other}")),
    };
    let value = match result {
        Ok(value) => json!({ "result": value }),
        Err(message) => json!({ "error": message }),
    };
    (value, false)
}

fn submit_block<S: KeyValueStore + 'static>(
    chain: &ChainState<S>,
    args: &[&str],
) -> Result<serde_json::Value, String> {
    let bytes = from_hex(args.first().ok_or("missing block hex")?)?;
    let block = Block::consensus_decode(&bytes).map_err(|err| err.to_string())?;
    let hash = block.header.hash();
    match chain.accept_block(&block, true) {
        Ok(true) => Ok(json!({ "hash": hash256_to_hex(&hash), "status": "accepted" })),
        Ok(false) => Ok(json!({ "hash": hash256_to_hex(&hash), "status": "ignored" })),
        Err(ChainError::Duplicate) => {
            Ok(json!({ "hash": hash256_to_hex(&hash), "status": "duplicate" }))
        }
        Err(err) => Err(err.to_string()),
    }
}

fn submit_header<S: KeyValueStore + 'static>(
    chain: &ChainState<S>,
    args: &[&str],
) -> Result<serde_json::Value, String> {
    let bytes = from_hex(args.first().ok_or("missing header hex")?)?;
    let header = BlockHeader::consensus_decode(&bytes).map_err(|err| err.to_string())?;
    let hash = chain.accept_header(&header).map_err(|err| err.to_string())?;
    Ok(json!({ "hash": hash256_to_hex(&hash) }))
}

fn send_raw_transaction<S: KeyValueStore + 'static>(
    chain: &ChainState<S>,
    args: &[&str],
) -> Result<serde_json::Value, String> {
    let bytes = from_hex(args.first().ok_or("missing tx hex")?)?;
    let tx = Transaction::consensus_decode(&bytes).map_err(|err| err.to_string())?;
    let outcome = chain
        .submit_transaction(tx, false)
        .map_err(|err| err.reason)?;
    Ok(json!({
        "txid": hash256_to_hex(&outcome.txid),
        "fee": outcome.fee,
        "vsize": outcome.vsize,
    }))
}

fn get_best_block<S: KeyValueStore + 'static>(
    chain: &ChainState<S>,
) -> Result<serde_json::Value, String> {
    let tip = chain.best_block().ok_or("no chain tip")?;
    Ok(json!({
        "hash": hash256_to_hex(&tip.hash),
        "height": tip.height,
        "work": format!("{:#x}", tip.work),
    }))
}

fn get_block<S: KeyValueStore + 'static>(
    chain: &ChainState<S>,
    args: &[&str],
) -> Result<serde_json::Value, String> {
    let hash = parse_hash(args.first().ok_or("missing block hash")?)?;
    let block = chain
        .read_block(&hash)
        .map_err(|err| err.to_string())?
        .ok_or("block not found")?;
    Ok(json!({ "hex": to_hex(&block.consensus_encode()) }))
}

fn block_command<S: KeyValueStore + 'static>(
    chain: &ChainState<S>,
    args: &[&str],
    op: fn(&ChainState<S>, &plbd_consensus::Hash256) -> Result<(), ChainError>,
) -> Result<serde_json::Value, String> {
    let hash = parse_hash(args.first().ok_or("missing block hash")?)?;
    op(chain, &hash).map_err(|err| err.to_string())?;
    let tip = chain.best_block();
    Ok(json!({
        "tip": tip.map(|tip| hash256_to_hex(&tip.hash)),
        "height": tip.map(|tip| tip.height),
    }))
}

fn prune_to_height<S: KeyValueStore + 'static>(
    chain: &ChainState<S>,
    args: &[&str],
) -> Result<serde_json::Value, String> {
    let height: i32 = args
        .first()
        .ok_or("missing height")?
        .parse()
        .map_err(|_| "invalid height".to_string())?;
    let pruned = chain.prune_to_height(height).map_err(|err| err.to_string())?;
    Ok(json!({ "pruned_files": pruned }))
}

fn verify_chain<S: KeyValueStore + 'static>(
    chain: &ChainState<S>,
    args: &[&str],
) -> Result<serde_json::Value, String> {
    let level: u32 = args
        .first()
        .map(|value| value.parse())
        .transpose()
        .map_err(|_| "invalid level".to_string())?
        .unwrap_or(3);
    let depth: u32 = args
        .get(1)
        .map(|value| value.parse())
        .transpose()
        .map_err(|_| "invalid depth".to_string())?
        .unwrap_or(6);
    chain.verify_chain(level, depth)?;
    Ok(json!({ "verified": true, "level": level, "depth": depth }))
}

fn load_mempool<S: KeyValueStore + 'static>(
    chain: &ChainState<S>,
    args: &[&str],
) -> Result<serde_json::Value, String> {
    let bytes = from_hex(args.first().ok_or("missing mempool hex")?)?;
    let loaded = chain.load_mempool(&bytes).map_err(|err| err.to_string())?;
    Ok(json!({ "loaded": loaded }))
}

fn parse_hash(value: &str) -> Result<plbd_consensus::Hash256, String> {
    hash256_from_hex(value).ok_or_else(|| "invalid hash".to_string())
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0'));
        out.push(char::from_digit((byte & 0x0f) as u32, 16).unwrap_or('0'));
    }
    out
}

fn from_hex(hex: &str) -> Result<Vec<u8>, String> {
    if hex.len() % 2 != 0 {
        return Err("odd-length hex".to_string());
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    let mut iter = hex.bytes();
    while let (Some(high), Some(low)) = (iter.next(), iter.next()) {
        let high = (high as char).to_digit(16).ok_or("invalid hex")? as u8;
        let low = (low as char).to_digit(16).ok_or("invalid hex")? as u8;
        bytes.push(high << 4 | low);
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::{from_hex, to_hex};

    #[test]
    fn hex_roundtrip() {
        let bytes = vec![0x00, 0xde, 0xad, 0xbe, 0xef, 0x7f];
        assert_eq!(from_hex(&to_hex(&bytes)).expect("parse"), bytes);
        assert!(from_hex("abc").is_err());
        assert!(from_hex("zz").is_err());
    }
}
