// src/core/transport/framing.rs

//! Length-prefixed record framing shared by every peer stream protocol.
//! Records are a 4-byte big-endian length header followed by a bincode
//! payload.

use crate::core::MeshError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Wraps a raw byte stream in the cluster's record framing.
pub fn framed<S>(stream: S, max_frame_bytes: usize) -> Framed<S, LengthDelimitedCodec>
where
    S: AsyncRead + AsyncWrite,
{
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_frame_bytes)
        .new_framed(stream)
}

/// Encodes a value with the cluster's standard bincode configuration.
pub fn to_wire<T: bincode::enc::Encode>(value: &T) -> Result<Vec<u8>, MeshError> {
    Ok(bincode::encode_to_vec(value, bincode::config::standard())?)
}

/// Decodes a value with the cluster's standard bincode configuration,
/// rejecting trailing garbage.
pub fn from_wire<T: bincode::de::Decode<()>>(bytes: &[u8]) -> Result<T, MeshError> {
    let (value, read) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
    if read != bytes.len() {
        return Err(MeshError::Codec(format!(
            "{} trailing bytes after record",
            bytes.len() - read
        )));
    }
    Ok(value)
}

/// Frames multiplexed over a single peer session. Stream ids are chosen with
/// initiator parity so both sides can open streams without coordination.
#[derive(bincode::Encode, bincode::Decode, Debug, Clone)]
pub enum MuxFrame {
    Open { stream_id: u64, protocol: u8 },
    Data { stream_id: u64, payload: Vec<u8> },
    Close { stream_id: u64 },
    Reset { stream_id: u64, code: u16 },
}

/// Identifies which subsystem an in-session stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolId {
    Raft = 1,
    StateGossip = 2,
    ChunkTransfer = 3,
    SchedulerProxy = 4,
    Health = 5,
}

impl ProtocolId {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(ProtocolId::Raft),
            2 => Some(ProtocolId::StateGossip),
            3 => Some(ProtocolId::ChunkTransfer),
            4 => Some(ProtocolId::SchedulerProxy),
            5 => Some(ProtocolId::Health),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProtocolId::Raft => "raft",
            ProtocolId::StateGossip => "state-gossip",
            ProtocolId::ChunkTransfer => "chunk-transfer",
            ProtocolId::SchedulerProxy => "scheduler-proxy",
            ProtocolId::Health => "health",
        };
        f.write_str(name)
    }
}
