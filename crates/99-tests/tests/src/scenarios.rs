use crossbeam_channel::unbounded;
use futures::executor::block_on;
use futures::future::join_all;
use modbridge::{
    AvailabilityState, BridgeError, Buffer, EmbeddingKind, HostArray, Param, TransferDescriptor,
};

use crate::harness::{eventually, start, texts, CALLBACK_TIMEOUT, EMBEDDINGS};

#[test]
fn echo_returns_the_same_read_only_view() -> anyhow::Result<()> {
    for kind in EMBEDDINGS {
        let (host, _rx) = start(kind)?;
        let buffer = block_on(host.create_read_only_buffer(HostArray::u8(vec![1, 2, 3])))?;
        let results = block_on(host.call_rust("echo", vec![buffer.clone().into()]))?;

        let echoed = results[0]
            .as_buffer()
            .and_then(Buffer::as_read_only)
            .expect("read-only result");
        assert_eq!(echoed.as_bytes(), &[1, 2, 3], "{kind}");
        assert!(echoed.same_buffer(&buffer), "{kind}: identity changed");
        host.shutdown();
    }
    Ok(())
}

#[test]
fn ping_reaches_the_callback_until_unregistered() -> anyhow::Result<()> {
    for kind in EMBEDDINGS {
        let (host, rx) = start(kind)?;
        block_on(host.call_rust("ping_host", Vec::new()))?;
        assert_eq!(
            rx.recv_timeout(CALLBACK_TIMEOUT)?,
            ("ping".to_owned(), vec!["pong".to_owned()]),
            "{kind}"
        );

        host.unregister_callbacks(["ping"])?;
        block_on(host.call_rust("ping_host", Vec::new()))?;
        // Callbacks are delivered in order, so the next one must be the thread's.
        block_on(host.call_rust("spawn_echo", vec!["marker".into()]))?;
        let (name, _) = rx.recv_timeout(CALLBACK_TIMEOUT)?;
        assert_eq!(name, "thread_done", "{kind}: unregistered callback ran");
        assert!(host.availability().is_online());
        host.shutdown();
    }
    Ok(())
}

#[test]
fn a_panic_fails_every_later_call() -> anyhow::Result<()> {
    for kind in EMBEDDINGS {
        let (host, _rx) = start(kind)?;
        let err = block_on(host.call_rust("panic", Vec::new())).expect_err("panic");
        assert_eq!(
            err,
            BridgeError::Fault("demo module asked to panic".into()),
            "{kind}"
        );
        assert!(matches!(
            host.availability().state(),
            AvailabilityState::Faulted(_)
        ));

        let err = block_on(host.call_rust("echo", vec!["after".into()])).expect_err("offline");
        assert!(err.is_unavailable(), "{kind}: {err}");
        let err = block_on(host.create_read_only_buffer(HostArray::u8(vec![1])))
            .expect_err("offline");
        assert!(err.is_unavailable(), "{kind}: {err}");
        host.shutdown();
    }
    Ok(())
}

#[test]
fn module_errors_are_not_faults() -> anyhow::Result<()> {
    for kind in EMBEDDINGS {
        let (host, _rx) = start(kind)?;
        let err = block_on(host.call_rust("fail", Vec::new())).expect_err("fail");
        assert!(matches!(err, BridgeError::Module(_)), "{kind}: {err}");
        let err = block_on(host.call_rust("no_such_function", Vec::new())).expect_err("unknown");
        assert!(matches!(err, BridgeError::Module(_)), "{kind}: {err}");

        let results = block_on(host.call_rust("reverse", vec!["abc".into()]))?;
        assert_eq!(texts(&results), vec!["cba".to_owned()]);
        host.shutdown();
    }
    Ok(())
}

#[test]
fn concurrent_calls_resolve_with_their_own_results() -> anyhow::Result<()> {
    for kind in EMBEDDINGS {
        let (host, _rx) = start(kind)?;
        let calls = (0..16).map(|i| {
            let host = host.clone();
            async move {
                let results = host.call_rust("echo", vec![format!("call-{i}").into()]).await;
                (i, results)
            }
        });
        for (i, results) in block_on(join_all(calls)) {
            assert_eq!(texts(&results?), vec![format!("call-{i}")], "{kind}");
        }
        host.shutdown();
    }
    Ok(())
}

#[test]
fn spawned_threads_call_back_through_the_module() -> anyhow::Result<()> {
    for kind in EMBEDDINGS {
        let (host, rx) = start(kind)?;
        block_on(host.call_rust("spawn_echo", vec!["from-thread".into()]))?;
        let (name, params) = rx.recv_timeout(CALLBACK_TIMEOUT)?;
        assert_eq!(name, "thread_done", "{kind}");
        assert_eq!(params, vec!["from-thread".to_owned()]);
        assert!(
            eventually(|| host.embedding().live_threads() == 0),
            "{kind}: thread never finished"
        );
        host.shutdown();
    }
    Ok(())
}

#[test]
fn mutable_buffers_come_back_reversed() -> anyhow::Result<()> {
    for kind in EMBEDDINGS {
        let (host, _rx) = start(kind)?;
        let buffer = block_on(host.create_mutable_buffer(HostArray::u8(vec![1, 2, 3])))?;
        let results = block_on(host.call_rust("reverse", vec![buffer.into()]))?;
        let reversed = results
            .into_iter()
            .next()
            .and_then(Param::into_buffer)
            .and_then(Buffer::into_mutable)
            .expect("mutable result");
        assert_eq!(reversed.to_vec()?, vec![3, 2, 1], "{kind}");
        host.shutdown();
    }
    Ok(())
}

#[test]
fn one_mutable_buffer_can_be_read_while_reading_another() -> anyhow::Result<()> {
    for kind in EMBEDDINGS {
        let (host, _rx) = start(kind)?;
        let a = block_on(host.create_mutable_buffer(HostArray::u8(vec![1, 2])))?;
        let mut b = block_on(host.create_mutable_buffer(HostArray::u8(vec![3, 4])))?;

        let (tx, rx) = unbounded();
        std::thread::spawn(move || {
            let nested = a.with_bytes(|x| (x.to_vec(), b.to_vec()));
            let copied = a.with_bytes(|x| b.with_bytes_mut(|y| y.copy_from_slice(x)));
            let _ = tx.send((nested, copied, b.to_vec()));
        });
        let (nested, copied, after) = rx.recv_timeout(CALLBACK_TIMEOUT)?;
        let (outer, inner) = nested?;
        assert_eq!(outer, vec![1, 2], "{kind}");
        assert_eq!(inner?, vec![3, 4], "{kind}");
        copied??;
        assert_eq!(after?, vec![1, 2], "{kind}");
        host.shutdown();
    }
    Ok(())
}

#[test]
fn host_arrays_are_copied_in() -> anyhow::Result<()> {
    for kind in EMBEDDINGS {
        let (host, _rx) = start(kind)?;
        let results = block_on(host.call_rust(
            "sum_f32",
            vec![HostArray::f32(&[1.0, 2.0, 3.5]).read_only().into()],
        ))?;
        let total = results[0]
            .as_buffer()
            .and_then(Buffer::as_read_only)
            .expect("read-only result")
            .to_f32_vec();
        assert_eq!(total, vec![6.5], "{kind}");
        assert_eq!(host.registry_stats().copies, 1);
        host.shutdown();
    }
    Ok(())
}

#[test]
fn shared_results_adopt_one_view() -> anyhow::Result<()> {
    for kind in EMBEDDINGS {
        let (host, _rx) = start(kind)?;
        let results = block_on(host.call_rust("make_shared", vec!["xy".into()]))?;
        let views: Vec<_> = results
            .iter()
            .filter_map(|p| p.as_buffer().and_then(Buffer::as_read_only))
            .collect();
        assert_eq!(views.len(), 2);
        assert!(views[0].same_buffer(views[1]), "{kind}");
        assert_eq!(views[0].as_bytes(), b"xy");
        host.shutdown();
    }
    Ok(())
}

#[test]
fn only_workers_transfer_and_open_endpoints() -> anyhow::Result<()> {
    for kind in EMBEDDINGS {
        let (host, _rx) = start(kind)?;
        let buffer = block_on(host.create_read_only_buffer(HostArray::u8(vec![4, 5])))?;
        let transfer = host.serialize_for_transfer(Buffer::ReadOnly(buffer.clone()));
        let endpoint = block_on(host.new_channel_endpoint());

        match kind {
            EmbeddingKind::InProcess => {
                assert!(matches!(transfer, Err(BridgeError::Unsupported { .. })));
                assert!(matches!(endpoint, Err(BridgeError::Unsupported { .. })));
                assert!(host.call_rust_sync("echo", Vec::new()).is_ok());
            }
            EmbeddingKind::Workers => {
                // Host code may carry descriptors over its own channels.
                let json = serde_json::to_string(&transfer?)?;
                let descriptor: TransferDescriptor = serde_json::from_str(&json)?;
                let restored = host.deserialize_from_transfer(descriptor)?;
                let view = restored.as_read_only().expect("read-only");
                assert!(view.same_buffer(&buffer));
                assert!(endpoint.is_ok());
                assert!(matches!(
                    host.call_rust_sync("echo", Vec::new()),
                    Err(BridgeError::Unsupported { .. })
                ));
            }
        }
        host.shutdown();
    }
    Ok(())
}
