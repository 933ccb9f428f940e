//! Config file to running protocol task and back

use std::io::Write;
use std::time::Duration;
use zwave_core::protocol::NodeId;
use zwave_core::routing::{NodeInfo, RouteCache, RouteSelector};
use zwave_core::transport::{
    event_channel, BeamFragment, PhyStatus, RadioEvent, RadioEventSender, RadioPal, TxFrame,
    TxRequest, TxStatus,
};
use zwave_core::{load_config, Engine, ProtocolTask};

/// Completes frames and ACKs those addressed to `acks`
struct Responder {
    events: RadioEventSender,
    acks: Option<NodeId>,
}

impl RadioPal for Responder {
    fn transmit(&mut self, frame: &TxFrame) -> zwave_core::transport::Result<()> {
        self.events.send(RadioEvent::TxComplete {
            status: PhyStatus::Ok,
        });
        if let Some(from) = frame.destination.filter(|d| Some(*d) == self.acks) {
            self.events.send(RadioEvent::AckReceived {
                from,
                routed: false,
            });
        }
        Ok(())
    }

    fn transmit_beam(&mut self, _beam: &BeamFragment) -> zwave_core::transport::Result<()> {
        self.events.send(RadioEvent::BeamComplete);
        Ok(())
    }
}

fn node(id: u16) -> NodeId {
    NodeId::new(id).unwrap()
}

fn link(engine: &mut Engine, a: u16, b: u16) {
    let adj = engine.adjacency_mut();
    for (x, y) in [(a, b), (b, a)] {
        let mut row = adj.get_neighbors(node(x)).unwrap();
        row.set(node(y)).unwrap();
        adj.set_neighbors(node(x), row).unwrap();
    }
}

fn write_config(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("node.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(
        file,
        r#"
storage_dir = "{}"

[engine]
node_id = 4
queue_capacity = 8
"#,
        dir.join("nvm").display()
    )
    .unwrap();
    path
}

#[tokio::test(start_paused = true)]
async fn test_routes_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(Some(&write_config(dir.path()))).unwrap();
    assert_eq!(config.engine.node_id, 4);
    assert_eq!(config.engine.queue_capacity, 8);

    let (events, rx) = event_channel();
    let radio = Responder {
        events,
        acks: Some(node(9)),
    };
    let mut engine = Engine::new(
        config.engine.clone(),
        Box::new(radio),
        config.open_nvm().unwrap(),
    )
    .unwrap();
    engine
        .adjacency_mut()
        .add_node(node(9), NodeInfo::repeater())
        .unwrap();
    link(&mut engine, 4, 9);

    let (task, handle) = ProtocolTask::new(engine, rx);
    let join = tokio::spawn(task.run());

    let report = handle
        .submit(TxRequest::new(node(9), vec![0x25, 0x01, 0xFF]))
        .await
        .unwrap();
    assert_eq!(report.status, TxStatus::Ok);
    assert!(report.route.is_empty());

    handle.shutdown().await.unwrap();
    let engine = join.await.unwrap();
    assert!(engine.is_idle());
    drop(engine);

    let nvm = config.open_nvm().unwrap();
    let mut cache = RouteCache::new();
    assert!(cache.restore(nvm.as_ref()) >= 1);
    let line = cache.get(node(9), RouteSelector::Lwr).unwrap();
    assert!(line.is_direct());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_through_handle() {
    let (events, rx) = event_channel();
    let radio = Responder { events, acks: None };
    let config = load_config(None).unwrap();
    let mut engine = Engine::new(
        config.engine.clone(),
        Box::new(radio),
        config.open_nvm().unwrap(),
    )
    .unwrap();
    engine
        .adjacency_mut()
        .add_node(node(2), NodeInfo::repeater())
        .unwrap();
    link(&mut engine, 1, 2);

    let (task, handle) = ProtocolTask::new(engine, rx);
    let join = tokio::spawn(task.run());

    let (tx, done) = handle
        .enqueue(TxRequest::new(node(2), vec![0x20, 0x01]).with_delay(Duration::from_secs(5)))
        .await
        .unwrap();
    handle.cancel(tx).await.unwrap();
    assert_eq!(done.await.unwrap().status, TxStatus::Cancelled);

    // the handle is stale once the frame is gone
    assert!(handle.cancel(tx).await.is_err());

    handle.shutdown().await.unwrap();
    join.await.unwrap();
}
