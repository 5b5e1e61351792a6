use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use futures::executor::block_on;
use modbridge::{callback, EmbeddingKind, Host, HostConfig, Lifecycle, Param};

pub const EMBEDDINGS: [EmbeddingKind; 2] = [EmbeddingKind::InProcess, EmbeddingKind::Workers];

pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// A host callback invocation with its string params.
pub type Invocation = (String, Vec<String>);

/// Demo module host with `ping` and `thread_done` recorded into the receiver.
pub fn start(kind: EmbeddingKind) -> anyhow::Result<(Host, Receiver<Invocation>)> {
    let config = HostConfig::new(demo_module::image()).with_embedding(kind);
    let host = block_on(Lifecycle::new().initialize(config))?;

    let (tx, rx) = unbounded();
    let batch = [demo_module::PING_CALLBACK, demo_module::THREAD_DONE_CALLBACK].map(|name| {
        let tx = tx.clone();
        (
            name,
            callback(move |params| {
                let _ = tx.send((name.to_owned(), texts(&params)));
            }),
        )
    });
    host.register_callbacks(batch)?;
    Ok((host, rx))
}

pub fn texts(params: &[Param]) -> Vec<String> {
    params
        .iter()
        .filter_map(|p| p.as_str().map(str::to_owned))
        .collect()
}

/// Polls `done` until it holds or the callback timeout passes.
pub fn eventually(mut done: impl FnMut() -> bool) -> bool {
    let step = Duration::from_millis(10);
    let mut waited = Duration::ZERO;
    while waited < CALLBACK_TIMEOUT {
        if done() {
            return true;
        }
        std::thread::sleep(step);
        waited += step;
    }
    done()
}
