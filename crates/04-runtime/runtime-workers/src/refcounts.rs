use buffers::{AckFn, BufferError, BufferHandle, ProtocolViolation, RefcountSink};
use module_abi::{MainWorkerProtocol, WorkerEvent, WorkerMessage};
use transport::{FaultKind, Rpc, RpcError};

/// Forwards the host's reference-count changes to the main worker.
///
/// Releases are fire-and-track: a rejection comes back as a protocol fault,
/// which the endpoint turns into an unavailable module on its own.
pub(crate) struct RemoteRefcounts {
    rpc: Rpc<MainWorkerProtocol>,
}

impl RemoteRefcounts {
    pub(crate) fn new(rpc: Rpc<MainWorkerProtocol>) -> Self {
        Self { rpc }
    }

    fn release(&self, event: WorkerEvent, handle: BufferHandle) {
        self.rpc
            .send_with(event, WorkerMessage::Handle(handle), move |result| {
                if let Err(err) = result {
                    tracing::error!("{event:?} for {handle} failed: {err}");
                }
            });
    }
}

impl RefcountSink for RemoteRefcounts {
    fn acquire_shared(&self, handle: BufferHandle, on_ack: AckFn) {
        self.rpc.send_with(
            WorkerEvent::IncrementRef,
            WorkerMessage::Handle(handle),
            move |result| on_ack(result.map(drop).map_err(ack_error)),
        );
    }

    fn release_shared(&self, handle: BufferHandle) {
        self.release(WorkerEvent::DecrementRef, handle);
    }

    fn release_exclusive(&self, handle: BufferHandle) {
        self.release(WorkerEvent::DeallocMutable, handle);
    }
}

fn ack_error(err: RpcError) -> BufferError {
    match err {
        RpcError::Remote(fault) if fault.kind == FaultKind::Protocol => {
            ProtocolViolation::Rejected(fault.message).into()
        }
        RpcError::Remote(fault) => BufferError::Unavailable(fault.message),
        other => BufferError::Unavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crossbeam_channel::bounded;
    use transport::{port_pair, Dispatch, Fault};

    #[test]
    fn rejected_increments_surface_as_violations() {
        let (a, b) = port_pair::<MainWorkerProtocol>();
        let host = Rpc::new("host", a, Dispatch::Inline);
        let worker = Rpc::new("worker", b, Dispatch::Inline);
        worker.receive(WorkerEvent::IncrementRef, |_message, reply| {
            reply.fail(Fault::protocol("unknown handle"));
        });

        let sink: Arc<dyn RefcountSink> = Arc::new(RemoteRefcounts::new(host));
        let (tx, rx) = bounded(1);
        sink.acquire_shared(
            BufferHandle(0x10000),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let result = rx.recv().expect("ack");
        assert!(matches!(result, Err(err) if err.is_violation()));
    }

    #[test]
    fn releases_reach_the_main_worker() {
        let (a, b) = port_pair::<MainWorkerProtocol>();
        let host = Rpc::new("host", a, Dispatch::Inline);
        let worker = Rpc::new("worker", b, Dispatch::Inline);
        let (tx, rx) = bounded(2);
        for event in [WorkerEvent::DecrementRef, WorkerEvent::DeallocMutable] {
            let tx = tx.clone();
            worker.receive(event, move |message, reply| {
                if let WorkerMessage::Handle(handle) = message {
                    let _ = tx.send((reply.event(), handle));
                }
                reply.ok(WorkerMessage::Ack);
            });
        }

        let sink = RemoteRefcounts::new(host);
        sink.release_shared(BufferHandle(8));
        sink.release_exclusive(BufferHandle(16));
        assert_eq!(
            rx.recv().expect("release"),
            (WorkerEvent::DecrementRef, BufferHandle(8))
        );
        assert_eq!(
            rx.recv().expect("release"),
            (WorkerEvent::DeallocMutable, BufferHandle(16))
        );
    }
}
