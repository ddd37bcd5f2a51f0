// src/core/state/keys.rs

//! The replicated log's key namespace. Keys are byte strings with a short
//! prefix per entity kind; composite keys join components with the ASCII
//! unit separator, which cannot appear in ids.

use crate::core::{ModelId, NodeId};

pub const NODE_PREFIX: &str = "node/";
pub const MODEL_PREFIX: &str = "model/";
pub const REPLICA_PREFIX: &str = "replica/";
pub const POLICY_PREFIX: &str = "policy/";
pub const CFG_PREFIX: &str = "cfg/";

const SEP: char = '\u{1f}';

pub fn node_key(id: &NodeId) -> Vec<u8> {
    format!("{NODE_PREFIX}{id}").into_bytes()
}

pub fn model_key(id: &ModelId) -> Vec<u8> {
    format!("{MODEL_PREFIX}{id}").into_bytes()
}

pub fn replica_key(model: &ModelId, node: &NodeId) -> Vec<u8> {
    format!("{REPLICA_PREFIX}{model}{SEP}{node}").into_bytes()
}

pub fn policy_key(model: &ModelId) -> Vec<u8> {
    format!("{POLICY_PREFIX}{model}").into_bytes()
}

pub fn cfg_key(name: &str) -> Vec<u8> {
    format!("{CFG_PREFIX}{name}").into_bytes()
}

/// A parsed view into a raw log key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRef<'a> {
    Node(&'a str),
    Model(&'a str),
    Replica { model: &'a str, node: &'a str },
    Policy(&'a str),
    Cfg(&'a str),
}

pub fn parse_key(key: &[u8]) -> Option<KeyRef<'_>> {
    let key = std::str::from_utf8(key).ok()?;
    if let Some(rest) = key.strip_prefix(NODE_PREFIX) {
        return Some(KeyRef::Node(rest));
    }
    if let Some(rest) = key.strip_prefix(MODEL_PREFIX) {
        return Some(KeyRef::Model(rest));
    }
    if let Some(rest) = key.strip_prefix(REPLICA_PREFIX) {
        let (model, node) = rest.split_once(SEP)?;
        return Some(KeyRef::Replica { model, node });
    }
    if let Some(rest) = key.strip_prefix(POLICY_PREFIX) {
        return Some(KeyRef::Policy(rest));
    }
    if let Some(rest) = key.strip_prefix(CFG_PREFIX) {
        return Some(KeyRef::Cfg(rest));
    }
    None
}

/// Ids containing the separator would produce ambiguous composite keys and
/// are rejected at validation.
pub fn id_is_clean(id: &str) -> bool {
    !id.contains(SEP)
}
