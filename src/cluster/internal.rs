//! Internal query namespace.
//!
//! Query names under `_starling_` never reach the user event sink. They carry
//! the conflict-resolution vote and cluster-wide keyring operations.

use super::query::{QueryEvent, QueryParams};
use super::ClusterCore;
use crate::error::{Error, Result};
use crate::keyring::decode_key;
use crate::wire::{self, ConflictResponseMsg, KeyRequestMsg, KeyResponseMsg, MessageType};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub(crate) const INTERNAL_QUERY_PREFIX: &str = "_starling_";

pub(crate) const CONFLICT_QUERY: &str = "_starling_conflict";
pub(crate) const INSTALL_KEY_QUERY: &str = "_starling_install-key";
pub(crate) const USE_KEY_QUERY: &str = "_starling_use-key";
pub(crate) const REMOVE_KEY_QUERY: &str = "_starling_remove-key";
pub(crate) const LIST_KEYS_QUERY: &str = "_starling_list-keys";

pub(crate) fn is_internal(name: &str) -> bool {
    name.starts_with(INTERNAL_QUERY_PREFIX)
}

/// Dispatch one internal query on the receiving node.
pub(crate) async fn handle_query(core: &Arc<ClusterCore>, event: QueryEvent) {
    match event.name.as_str() {
        CONFLICT_QUERY => handle_conflict(core, event).await,
        INSTALL_KEY_QUERY | USE_KEY_QUERY | REMOVE_KEY_QUERY | LIST_KEYS_QUERY => {
            handle_key_op(core, event).await
        }
        other => debug!("unhandled internal query {:?}", other),
    }
}

/// Answer a conflict vote with our record for the contested name.
async fn handle_conflict(core: &Arc<ClusterCore>, event: QueryEvent) {
    let contested = String::from_utf8_lossy(&event.payload).into_owned();

    // The node being voted on abstains.
    if contested == core.config.node_name {
        return;
    }

    let record = {
        let st = core.state.lock().unwrap();
        st.members.get(&contested).map(|m| ConflictResponseMsg {
            node: m.member.name.clone(),
            addr: m.member.addr,
            port: m.member.port,
        })
    };
    let Some(record) = record else {
        return;
    };

    let payload = match wire::encode(MessageType::ConflictResponse, &record) {
        Ok(p) => p,
        Err(e) => {
            warn!("failed to encode conflict response: {}", e);
            return;
        }
    };
    if let Err(e) = event.respond(payload).await {
        debug!("failed to respond to conflict query: {}", e);
    }
}

/// Apply a key operation locally and report the outcome.
async fn handle_key_op(core: &Arc<ClusterCore>, event: QueryEvent) {
    let mut resp = KeyResponseMsg::default();

    match key_op_outcome(core, &event) {
        Ok(keys) => {
            resp.result = true;
            if let Some((keys, primary)) = keys {
                resp.keys = keys;
                resp.primary = primary;
            }
        }
        Err(e) => {
            resp.result = false;
            resp.message = e.to_string();
        }
    }

    let payload = match wire::encode(MessageType::KeyResponse, &resp) {
        Ok(p) => p,
        Err(e) => {
            warn!("failed to encode key response: {}", e);
            return;
        }
    };
    if let Err(e) = event.respond(payload).await {
        debug!("failed to respond to key query: {}", e);
    }
}

type ListOutcome = Option<(Vec<String>, String)>;

fn key_op_outcome(core: &Arc<ClusterCore>, event: &QueryEvent) -> Result<ListOutcome> {
    let Some(keyring) = &core.keyring else {
        return Err(Error::NoKeyring);
    };

    if event.name == LIST_KEYS_QUERY {
        let (keys, primary) = keyring.list();
        return Ok(Some((keys, primary)));
    }

    let req: KeyRequestMsg = match event.payload.first() {
        Some(&t) if t == MessageType::KeyRequest as u8 => wire::decode(&event.payload[1..])?,
        _ => return Err(Error::Keyring("malformed key request".to_string())),
    };
    let key = decode_key(&req.key)?;

    match event.name.as_str() {
        INSTALL_KEY_QUERY => {
            info!("installing a new cluster key");
            keyring.install(key)?;
        }
        USE_KEY_QUERY => {
            info!("changing the primary cluster key");
            keyring.use_key(&key)?;
        }
        REMOVE_KEY_QUERY => {
            info!("removing a cluster key");
            keyring.remove(&key)?;
        }
        _ => unreachable!("checked by handle_query"),
    }
    Ok(None)
}

// =============================================================================
// KEY MANAGER
// =============================================================================

/// Aggregated outcome of a cluster-wide key operation.
#[derive(Debug, Default)]
pub struct KeyResponse {
    /// Per-node error messages for nodes that failed the operation.
    pub messages: HashMap<String, String>,
    /// Cluster size when the operation ran.
    pub num_nodes: usize,
    /// Nodes that responded before the deadline.
    pub num_resp: usize,
    /// Nodes that reported an error.
    pub num_err: usize,
    /// For list operations: installed key -> how many nodes hold it.
    pub keys: HashMap<String, usize>,
    /// For list operations: primary key -> how many nodes use it.
    pub primary_keys: HashMap<String, usize>,
}

/// Cluster-wide keyring administration, implemented as internal queries.
pub struct KeyManager {
    pub(crate) core: Arc<ClusterCore>,
}

impl KeyManager {
    pub async fn install_key(&self, key: &str) -> Result<KeyResponse> {
        self.key_query(INSTALL_KEY_QUERY, Some(key)).await
    }

    pub async fn use_key(&self, key: &str) -> Result<KeyResponse> {
        self.key_query(USE_KEY_QUERY, Some(key)).await
    }

    pub async fn remove_key(&self, key: &str) -> Result<KeyResponse> {
        self.key_query(REMOVE_KEY_QUERY, Some(key)).await
    }

    pub async fn list_keys(&self) -> Result<KeyResponse> {
        self.key_query(LIST_KEYS_QUERY, None).await
    }

    async fn key_query(&self, name: &str, key: Option<&str>) -> Result<KeyResponse> {
        if let Some(key) = key {
            // Validate locally before touching the cluster.
            decode_key(key)?;
        }

        let payload = match key {
            Some(key) => wire::encode(
                MessageType::KeyRequest,
                &KeyRequestMsg {
                    key: key.to_string(),
                },
            )?,
            None => Vec::new(),
        };

        let num_nodes = self
            .core
            .membership()
            .map(|m| m.num_alive())
            .unwrap_or(0);

        let mut query = self
            .core
            .start_query(name, &payload, QueryParams::default())?;

        let mut out = KeyResponse {
            num_nodes,
            ..KeyResponse::default()
        };

        while let Some(resp) = query.recv().await {
            out.num_resp += 1;

            let decoded: Option<KeyResponseMsg> = match resp.payload.first() {
                Some(&t) if t == MessageType::KeyResponse as u8 => {
                    wire::decode(&resp.payload[1..]).ok()
                }
                _ => None,
            };
            let Some(msg) = decoded else {
                out.num_err += 1;
                out.messages
                    .insert(resp.from, "malformed key response".to_string());
                continue;
            };

            if !msg.result {
                out.num_err += 1;
                error!("key operation failed on {}: {}", resp.from, msg.message);
                out.messages.insert(resp.from.clone(), msg.message);
            }
            for k in msg.keys {
                *out.keys.entry(k).or_insert(0) += 1;
            }
            if !msg.primary.is_empty() {
                *out.primary_keys.entry(msg.primary).or_insert(0) += 1;
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_prefix() {
        assert!(is_internal("_starling_conflict"));
        assert!(is_internal("_starling_list-keys"));
        assert!(!is_internal("deploy"));
        assert!(!is_internal("starling"));
    }
}
