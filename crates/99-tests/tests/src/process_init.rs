use futures::executor::block_on;
use modbridge::{
    initialize, BridgeError, EmbeddingKind, HostConfig, Lifecycle, UiFlags, UsageError,
};

// The only test in this crate allowed to touch the process-wide guard.
#[test]
fn initialize_runs_once_per_process() -> anyhow::Result<()> {
    let ui = UiFlags {
        default_styles: true,
        canvas: Some("main-canvas".into()),
    };
    let config = HostConfig::new(demo_module::image())
        .with_embedding(EmbeddingKind::Workers)
        .with_ui(ui.clone());
    let host = block_on(initialize(config))?;
    assert!(Lifecycle::process().is_initialized());
    assert_eq!(host.ui(), &ui);

    let again = HostConfig::new(demo_module::image()).with_embedding(EmbeddingKind::InProcess);
    let err = block_on(initialize(again)).err().expect("second initialize");
    assert_eq!(err, BridgeError::Usage(UsageError::AlreadyInitialized));

    // The first host is untouched by the rejected call.
    assert_eq!(host.embedding_kind(), EmbeddingKind::Workers);
    let results = block_on(host.call_rust("echo", vec!["still here".into()]))?;
    assert_eq!(results[0].as_str(), Some("still here"));
    host.shutdown();
    Ok(())
}
