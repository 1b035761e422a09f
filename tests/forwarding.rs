//! End-to-end pipeline scenarios over real sockets.
use ffwd::config::{CoreConfig, PluginConfig};
use ffwd::dispatcher::CoreProcessor;
use ffwd::emitter::CoreEmitter;
use ffwd::event::Metric;
use ffwd::plugin::{PluginInstance, PluginKind, PluginRegistry};
use ffwd::plugin_channel::PluginChannel;
use ffwd::processor::ProcessorRegistry;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

/// Ask the OS for a free TCP port.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[tokio::test]
async fn carbon_input_flows_to_the_output_channel() {
    let input = Arc::new(PluginChannel::new("input"));
    let output = Arc::new(PluginChannel::new("output"));
    input.start();
    output.start();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _sub = output.subscribe_metrics(move |m| {
        sink.lock().unwrap().push(m.clone());
        Ok(())
    });

    let emitter = CoreEmitter::new(
        CoreConfig {
            host: Some("agent".to_string()),
            ..Default::default()
        },
        output.clone(),
    );
    let dispatcher = CoreProcessor::new(
        emitter,
        ProcessorRegistry::builtin().create_all(&Default::default()),
    );
    dispatcher.start(&input);

    let registry = PluginRegistry::builtin();
    let port = free_port().await;
    let configs = vec![PluginConfig::new("carbon").with_addr("127.0.0.1", port)];
    let setups = registry.load_plugins(PluginKind::Input, &configs);
    assert_eq!(setups.len(), 1);
    let PluginInstance::Input(instance) = setups[0].invoke().unwrap() else {
        panic!("carbon input setup produced the wrong instance kind");
    };

    let (notify, _) = broadcast::channel(1);
    let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
    instance
        .start(input.clone(), output.clone(), &notify, &done_tx)
        .await
        .unwrap();

    let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    peer.write_all(b"srv.load 1.5 1700000000\nbad line\nsrv.load 1.6 1700000010\n")
        .await
        .unwrap();
    peer.shutdown().await.unwrap();
    drop(peer);

    for _ in 0..200 {
        if seen.lock().unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].key, "srv.load");
    assert_eq!(seen[0].value, 1.5);
    assert_eq!(seen[0].time, Some(1_700_000_000));
    // The emitter stamped the core default host on the way through.
    assert_eq!(seen[0].host.as_deref(), Some("agent"));
    drop(seen);

    dispatcher.stop();
    input.stop();
    output.stop();
    drop(notify);
    drop(done_tx);
    let _ = done_rx.recv().await;
}

#[tokio::test]
async fn json_output_streams_published_metrics() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received = tokio::spawn(async move {
        let (mut peer, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.contains(&b'\n') {
            let n = peer.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        buf
    });

    let registry = PluginRegistry::builtin();
    let mut config = PluginConfig::new("json").with_addr(addr.ip().to_string(), addr.port());
    config.flush_period = 0;
    let setups = registry.load_plugins(PluginKind::Output, &[config]);
    let PluginInstance::Output(instance) = setups[0].invoke().unwrap() else {
        panic!("json output setup produced the wrong instance kind");
    };

    let output = Arc::new(PluginChannel::new("output"));
    output.start();
    let (notify, _) = broadcast::channel(1);
    instance.start(&output, &notify);

    for _ in 0..200 {
        if instance.is_open() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(instance.is_open(), "json output never connected");

    let mut metric = Metric::new("srv.load", 1.5);
    metric.time = Some(1_700_000_000);
    output.metric(&metric);

    let buf = received.await.unwrap();
    let line = std::str::from_utf8(&buf).unwrap();
    let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
    assert_eq!(value["type"], "metric");
    assert_eq!(value["key"], "srv.load");
    assert_eq!(value["value"], 1.5);

    instance.close();
    output.stop();
}
