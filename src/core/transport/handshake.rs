// src/core/transport/handshake.rs

//! Mutual authentication for peer connections. Each side proves possession
//! of its Ed25519 node key by signing the other side's nonce, and proves
//! cluster membership with an HMAC over the same nonce keyed by the shared
//! rendezvous string. Identities are verified against the advertised public
//! key on every connection.

use crate::core::identity::{NodeIdentity, verify_node_signature};
use crate::core::transport::framing::{from_wire, to_wire};
use crate::core::transport::stream::AnyStream;
use crate::core::{MeshError, NodeId};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

type HmacSha256 = Hmac<Sha256>;

#[derive(bincode::Encode, bincode::Decode, Debug, Clone)]
pub enum HandshakeFrame {
    Hello {
        version: String,
        node_id: String,
        addrs: Vec<String>,
        gossip_addr: String,
        nonce: [u8; 32],
    },
    Verify {
        signature: Vec<u8>,
        mac: [u8; 32],
    },
    Accept,
    Reject {
        code: u16,
        detail: String,
    },
}

/// What the remote side told us about itself, after verification.
#[derive(Debug, Clone)]
pub struct PeerHello {
    pub node_id: NodeId,
    pub version: String,
    pub addrs: Vec<String>,
    pub gossip_addr: String,
}

fn rendezvous_mac(rendezvous: &str, nonce: &[u8; 32], node_id: &str) -> Result<[u8; 32], MeshError> {
    let mut mac = HmacSha256::new_from_slice(rendezvous.as_bytes())
        .map_err(|_| MeshError::Internal("HMAC key setup failed".to_string()))?;
    mac.update(nonce);
    mac.update(node_id.as_bytes());
    let out = mac.finalize().into_bytes();
    Ok(out
        .as_slice()
        .try_into()
        .map_err(|_| MeshError::Internal("HMAC output length".to_string()))?)
}

async fn send_frame(
    framed: &mut Framed<AnyStream, LengthDelimitedCodec>,
    frame: &HandshakeFrame,
) -> Result<(), MeshError> {
    framed.send(Bytes::from(to_wire(frame)?)).await?;
    Ok(())
}

async fn recv_frame(
    framed: &mut Framed<AnyStream, LengthDelimitedCodec>,
) -> Result<HandshakeFrame, MeshError> {
    match framed.next().await {
        Some(Ok(bytes)) => from_wire(&bytes),
        Some(Err(e)) => Err(e.into()),
        None => Err(MeshError::StreamClosed),
    }
}

/// Runs the handshake over a freshly framed connection. The initiator sends
/// its Hello first; both sides then exchange Verify and Accept frames.
/// Returns the authenticated remote Hello.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    framed: &mut Framed<AnyStream, LengthDelimitedCodec>,
    identity: &NodeIdentity,
    rendezvous: &str,
    my_addrs: &[String],
    my_gossip_addr: &str,
    expected_peer: Option<&NodeId>,
    is_denied: impl Fn(&NodeId) -> bool,
    initiator: bool,
) -> Result<PeerHello, MeshError> {
    let mut nonce = [0u8; 32];
    getrandom::fill(&mut nonce).map_err(|e| MeshError::Internal(e.to_string()))?;

    let my_hello = HandshakeFrame::Hello {
        version: env!("CARGO_PKG_VERSION").to_string(),
        node_id: identity.id().clone(),
        addrs: my_addrs.to_vec(),
        gossip_addr: my_gossip_addr.to_string(),
        nonce,
    };

    let their_hello = if initiator {
        send_frame(framed, &my_hello).await?;
        recv_frame(framed).await?
    } else {
        let hello = recv_frame(framed).await?;
        send_frame(framed, &my_hello).await?;
        hello
    };

    let HandshakeFrame::Hello {
        version,
        node_id,
        addrs,
        gossip_addr,
        nonce: their_nonce,
    } = their_hello
    else {
        return Err(MeshError::AuthFailed("expected Hello frame".to_string()));
    };

    if node_id == *identity.id() {
        return Err(MeshError::AuthFailed("connected to self".to_string()));
    }
    if let Some(expected) = expected_peer {
        if node_id != *expected {
            let _ = send_frame(
                framed,
                &HandshakeFrame::Reject {
                    code: MeshError::AuthFailed(String::new()).code(),
                    detail: "identity mismatch".to_string(),
                },
            )
            .await;
            return Err(MeshError::AuthFailed(format!(
                "dialed {expected} but peer identified as {node_id}"
            )));
        }
    }
    if is_denied(&node_id) {
        let _ = send_frame(
            framed,
            &HandshakeFrame::Reject {
                code: MeshError::AuthFailed(String::new()).code(),
                detail: "denied".to_string(),
            },
        )
        .await;
        return Err(MeshError::AuthFailed(format!("peer {node_id} is denied")));
    }

    // Prove who we are and that we share the rendezvous.
    let signature = identity.sign(&their_nonce);
    let mac = rendezvous_mac(rendezvous, &their_nonce, identity.id())?;
    send_frame(
        framed,
        &HandshakeFrame::Verify {
            signature: signature.to_vec(),
            mac,
        },
    )
    .await?;

    let HandshakeFrame::Verify {
        signature: their_sig,
        mac: their_mac,
    } = recv_frame(framed).await?
    else {
        return Err(MeshError::AuthFailed("expected Verify frame".to_string()));
    };

    let sig: [u8; 64] = their_sig
        .as_slice()
        .try_into()
        .map_err(|_| MeshError::AuthFailed("malformed signature".to_string()))?;
    verify_node_signature(&node_id, &nonce, &sig)?;

    let expected_mac = rendezvous_mac(rendezvous, &nonce, &node_id)?;
    if expected_mac != their_mac {
        let _ = send_frame(
            framed,
            &HandshakeFrame::Reject {
                code: MeshError::AuthFailed(String::new()).code(),
                detail: "rendezvous mismatch".to_string(),
            },
        )
        .await;
        return Err(MeshError::AuthFailed(format!(
            "peer {node_id} does not share our rendezvous"
        )));
    }

    send_frame(framed, &HandshakeFrame::Accept).await?;
    match recv_frame(framed).await? {
        HandshakeFrame::Accept => Ok(PeerHello {
            node_id,
            version,
            addrs,
            gossip_addr,
        }),
        HandshakeFrame::Reject { code, detail } => Err(MeshError::from_code(code, &detail)),
        _ => Err(MeshError::AuthFailed("expected Accept frame".to_string())),
    }
}
