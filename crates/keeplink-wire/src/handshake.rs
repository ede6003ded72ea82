//! Trust handshake — token exchange plus connection ID assignment.
//!
//! ```text
//! active                               passive
//!   |  ---- trust token ------------------>  |  verify
//!   |  <--- trust token -------------------  |
//!   |  <--- connection id (u64 BE) --------  |  allocate
//! ```
//!
//! Both tokens are raw bytes of the configured length with no framing. The
//! whole exchange races a wall-clock timeout; exactly one of success,
//! failure or timeout is reported.

use crate::codec::FrameCodec;
use crate::error::WireError;
use crate::id::IdGenerator;
use keeplink_types::{ProtocolConfig, Role};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Size of the connection ID sent by the passive side.
pub const CONNECTION_ID_LEN: usize = 8;

/// Which side of the exchange to run.
#[derive(Debug, Clone, Copy)]
pub enum HandshakeSide<'a> {
    /// Send first, then receive the assigned ID.
    Active,
    /// Verify first, then allocate an ID from `ids`.
    Passive { ids: &'a IdGenerator },
}

impl HandshakeSide<'_> {
    /// The endpoint role that runs this side.
    pub fn role(&self) -> Role {
        match self {
            Self::Active => Role::Active,
            Self::Passive { .. } => Role::Passive,
        }
    }
}

/// Run the handshake under the configured wait-trust timeout.
///
/// Returns the connection ID both sides agreed on.
pub async fn perform<R, W>(
    side: HandshakeSide<'_>,
    reader: &mut R,
    writer: &mut W,
    config: &ProtocolConfig,
) -> Result<u64, WireError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let timeout = config.wait_trust_timeout();
    let token = config.trust_token_bytes();
    let codec = FrameCodec::from_config(config);
    let role = side.role();

    let exchange = async {
        match side {
            HandshakeSide::Active => run_active(reader, writer, token, &codec).await,
            HandshakeSide::Passive { ids } => run_passive(reader, writer, token, &codec, ids).await,
        }
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => {
            debug!(%role, ?timeout, "handshake: peer did not answer in time");
            Err(WireError::HandshakeTimeout(timeout))
        }
    }
}

async fn send_token<W>(writer: &mut W, token: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(token).await?;
    writer.flush().await?;
    Ok(())
}

async fn expect_token<R>(reader: &mut R, token: &[u8], codec: &FrameCodec) -> Result<(), WireError>
where
    R: AsyncRead + Unpin,
{
    let received = codec.read_exact(reader, token.len()).await?;
    if bool::from(received.as_ref().ct_eq(token)) {
        Ok(())
    } else {
        Err(WireError::TrustMismatch)
    }
}

/// Active side: send the token, verify the echo, read the assigned ID.
pub async fn run_active<R, W>(
    reader: &mut R,
    writer: &mut W,
    token: &[u8],
    codec: &FrameCodec,
) -> Result<u64, WireError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    send_token(writer, token).await?;
    expect_token(reader, token, codec).await?;

    let raw = codec.read_exact(reader, CONNECTION_ID_LEN).await?;
    let mut id = [0u8; CONNECTION_ID_LEN];
    id.copy_from_slice(&raw);
    let id = u64::from_be_bytes(id);
    debug!(id, "handshake: assigned connection id received");
    Ok(id)
}

/// Passive side: verify the peer token, echo ours, allocate and send an ID.
pub async fn run_passive<R, W>(
    reader: &mut R,
    writer: &mut W,
    token: &[u8],
    codec: &FrameCodec,
    ids: &IdGenerator,
) -> Result<u64, WireError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    expect_token(reader, token, codec).await?;
    send_token(writer, token).await?;

    let id = ids.next_id();
    writer.write_all(&id.to_be_bytes()).await?;
    writer.flush().await?;
    debug!(id, "handshake: connection id assigned");
    Ok(id)
}
