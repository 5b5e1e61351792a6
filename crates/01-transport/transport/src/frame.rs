use std::fmt::Debug;
use std::hash::Hash;

use crate::channel::{channel_pair, ChannelEndpoint};
use crate::error::Fault;

/// Correlation id attached to every call; echoed by the peer's response.
pub type CallId = u64;

/// Describes the events and payloads exchanged over one kind of endpoint.
pub trait Protocol: Send + Sync + 'static {
    /// Tag naming the event a request carries; one handler is registered per tag.
    type Event: Copy + Eq + Hash + Debug + Send + Sync + 'static;
    /// Payload type for requests and responses.
    type Message: Send + 'static;

    /// Short name used in log output.
    const NAME: &'static str;
}

/// Unit travelling over a [`Port`].
pub enum Frame<P: Protocol> {
    /// A call (`id` present) or a notification (`id` absent).
    Request {
        id: Option<CallId>,
        event: P::Event,
        message: P::Message,
    },
    /// Response to the call carrying the same `id`.
    Response {
        id: CallId,
        result: Result<P::Message, Fault>,
    },
}

/// Endpoint carrying frames of protocol `P`.
pub type Port<P> = ChannelEndpoint<Frame<P>>;

/// Creates a connected pair of ports for protocol `P`.
pub fn port_pair<P: Protocol>() -> (Port<P>, Port<P>) {
    channel_pair()
}
