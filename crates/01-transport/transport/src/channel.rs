use std::fmt;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::{RpcError, RpcResult};

/// One end of a bidirectional point-to-point pipe between two execution contexts.
///
/// Messages posted on one end arrive at the other end in send order. Moving a
/// value into [`ChannelEndpoint::post`] transfers its ownership to the peer, which
/// is how buffers and nested endpoints are handed across contexts.
pub struct ChannelEndpoint<M> {
    tx: Sender<M>,
    rx: Receiver<M>,
}

impl<M> ChannelEndpoint<M> {
    /// Posts a message to the peer. Fails once the peer endpoint has been dropped.
    pub fn post(&self, msg: M) -> RpcResult<()> {
        self.tx.send(msg).map_err(|_| RpcError::Disconnected)
    }

    /// Blocks until a message arrives; `None` once the peer is gone and the pipe is drained.
    pub fn recv(&self) -> Option<M> {
        self.rx.recv().ok()
    }

    /// Returns the next queued message without blocking.
    pub fn try_recv(&self) -> Option<M> {
        self.rx.try_recv().ok()
    }

    pub fn split(self) -> (Sender<M>, Receiver<M>) {
        (self.tx, self.rx)
    }
}

impl<M> fmt::Debug for ChannelEndpoint<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelEndpoint")
            .field("queued", &self.rx.len())
            .finish()
    }
}

/// Creates a connected pair of endpoints.
pub fn channel_pair<M>() -> (ChannelEndpoint<M>, ChannelEndpoint<M>) {
    let (a_tx, b_rx) = unbounded();
    let (b_tx, a_rx) = unbounded();
    (
        ChannelEndpoint { tx: a_tx, rx: a_rx },
        ChannelEndpoint { tx: b_tx, rx: b_rx },
    )
}
