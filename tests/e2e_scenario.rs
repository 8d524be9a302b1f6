//! The full store → index → synapse walk-through, plus graph sync across
//! linked synapses.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cortex::{Direction, Error, EventInfo, EventKind, Graph, LinkState, Synapse, SynapseConfig, Value};
use pretty_assertions::assert_eq;

fn fast_config() -> SynapseConfig {
    SynapseConfig {
        window_size: 1000,
        pull_timeout: Duration::from_millis(50),
        abandon_after: Duration::from_secs(2),
    }
}

async fn eventually(cond: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// ============================================================================
// 1. Form, index, distribute
// ============================================================================

#[tokio::test]
async fn test_store_index_and_impulse() {
    let g = Graph::new();
    let a = g.form_node("woot", 10).unwrap();
    let b = g.form_node("woot", 20).unwrap();
    g.form_edge(a.id, b.id, "foo", "bar").unwrap();
    g.set_node_prop(a.id, "getme", 8).unwrap();
    g.set_node_prop(b.id, "getme", 8).unwrap();

    let mut found: Vec<_> = g.get_nodes_by_prop("getme", Some(&Value::Int(8))).into_iter().map(|n| n.id).collect();
    let mut want = vec![a.id, b.id];
    found.sort();
    want.sort();
    assert_eq!(found, want);
    assert_eq!(g.get_edges(a.id, Direction::Outgoing)[0].dst, b.id);

    let syn = Synapse::with_defaults().unwrap();
    let chan = syn.init_syn_chan(&["p"]).unwrap();
    let payload = Value::Map(BTreeMap::from([
        ("form".to_string(), Value::from("woot")),
        ("formval".to_string(), Value::Int(10)),
        ("prop".to_string(), Value::from("getme")),
        ("newval".to_string(), Value::Int(9)),
    ]));
    let id = syn.new_syn_impulse("p", "setnodeprop", payload.clone()).unwrap();

    let imp = chan.recv_timeout(Duration::from_secs(1)).await.unwrap();
    assert_eq!(imp.id, id);
    assert_eq!(imp.evt, "setnodeprop");
    assert_eq!(imp.info, payload);
    assert!(chan.next_batch(Duration::from_millis(100)).await.unwrap().is_empty());

    // the impulse is a graph event any synced graph could apply
    g.apply_impulse(&imp).unwrap();
    assert_eq!(g.get_node(a.id).unwrap().get("getme"), Some(&Value::Int(9)));

    syn.fini_synapse().await.unwrap();
}

// ============================================================================
// 2. Local graph sync
// ============================================================================

#[tokio::test]
async fn test_sync_fires_local_events() {
    let g = Arc::new(Graph::new());
    let syn = Synapse::new(fast_config()).unwrap();
    let sync = g.sync_with_synapse(&syn, "cortex").unwrap();
    let watcher = syn.init_syn_chan(&["cortex"]).unwrap();

    let a = g.form_node("woot", 10).unwrap();
    g.set_node_prop(a.id, "getme", 8).unwrap();
    // a no-op is not distributed
    g.set_node_prop(a.id, "getme", 8).unwrap();

    let first = watcher.recv_timeout(Duration::from_secs(1)).await.unwrap();
    let second = watcher.recv_timeout(Duration::from_secs(1)).await.unwrap();
    assert_eq!(first.evt, EventKind::FormNode.tag());
    assert_eq!(second.evt, EventKind::SetNodeProp.tag());
    let info = EventInfo::from_value(&second.info).unwrap();
    assert_eq!(info.prop.as_deref(), Some("getme"));
    assert_eq!(info.newval, Some(Value::Int(8)));
    assert!(watcher.next_batch(Duration::from_millis(100)).await.unwrap().is_empty());

    sync.stop().await;
    g.form_node("woot", 20).unwrap();
    assert!(watcher.next_batch(Duration::from_millis(100)).await.unwrap().is_empty());
    syn.fini_synapse().await.unwrap();
}

#[tokio::test]
async fn test_sync_applies_foreign_impulses() {
    let g = Arc::new(Graph::new());
    let syn = Synapse::new(fast_config()).unwrap();
    let _sync = g.sync_with_synapse(&syn, "cortex").unwrap();

    let info = EventInfo::node("woot", Value::Int(10));
    syn.new_syn_impulse("cortex", "formnode", info.to_value()).unwrap();
    // garbage is skipped, not fatal
    syn.new_syn_impulse("cortex", "explode", Value::Null).unwrap();
    syn.new_syn_impulse("cortex", "formnode", EventInfo::node("woot", Value::Int(20)).to_value()).unwrap();

    assert!(eventually(|| g.node_count() == 2).await);
    syn.fini_synapse().await.unwrap();
}

#[tokio::test]
async fn test_dropped_sync_handle_detaches() {
    let g = Arc::new(Graph::new());
    let syn = Synapse::new(fast_config()).unwrap();
    let sync = g.sync_with_synapse(&syn, "cortex").unwrap();
    let watcher = syn.init_syn_chan(&["cortex"]).unwrap();

    g.form_node("woot", 10).unwrap();
    assert_eq!(watcher.next_batch(Duration::from_secs(1)).await.unwrap().len(), 1);

    drop(sync);
    g.form_node("woot", 20).unwrap();
    assert!(watcher.next_batch(Duration::from_millis(100)).await.unwrap().is_empty());

    // the inbound side is gone as well
    syn.new_syn_impulse("cortex", "formnode", EventInfo::node("woot", Value::Int(30)).to_value()).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(g.get_node_by_form("woot", 30).is_none());
    syn.fini_synapse().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_started_off_runtime() {
    let g = Arc::new(Graph::new());
    let syn = Synapse::new(fast_config()).unwrap();
    let sync = {
        let (g, syn) = (Arc::clone(&g), syn.clone());
        std::thread::spawn(move || g.sync_with_synapse(&syn, "cortex")).join().unwrap().unwrap()
    };

    syn.new_syn_impulse("cortex", "formnode", EventInfo::node("woot", Value::Int(10)).to_value()).unwrap();
    assert!(eventually(|| g.node_count() == 1).await);

    sync.stop().await;
    syn.fini_synapse().await.unwrap();
}

/// A sink whose every write fails.
struct DiskFull;

impl Write for DiskFull {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::other("disk full"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_sink_failure_still_distributes_and_constructs() {
    let g = Arc::new(Graph::new());
    let syn = Synapse::new(fast_config()).unwrap();
    let sync = g.sync_with_synapse(&syn, "cortex").unwrap();
    let watcher = syn.init_syn_chan(&["cortex"]).unwrap();
    g.set_save_file(DiskFull);

    let calls = AtomicUsize::new(0);
    let form = || {
        g.form_node_with("element", "hg", |n| {
            calls.fetch_add(1, Ordering::SeqCst);
            n.set_prop("liquid", true)?;
            Ok(())
        })
    };

    assert!(matches!(form(), Err(Error::Encode(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let node = g.get_node_by_form("element", "hg").unwrap();
    assert_eq!(node.get("liquid"), Some(&Value::Bool(true)));

    // a retry finds the node and leaves the ctor alone
    assert_eq!(form().unwrap().id, node.id);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let first = watcher.recv_timeout(Duration::from_secs(1)).await.unwrap();
    let second = watcher.recv_timeout(Duration::from_secs(1)).await.unwrap();
    assert_eq!(first.evt, EventKind::FormNode.tag());
    assert_eq!(second.evt, EventKind::SetNodeProp.tag());
    assert!(watcher.next_batch(Duration::from_millis(100)).await.unwrap().is_empty());

    sync.stop().await;
    syn.fini_synapse().await.unwrap();
}

// ============================================================================
// 3. Two graphs over linked synapses
// ============================================================================

#[tokio::test]
async fn test_two_graphs_converge() {
    let g1 = Arc::new(Graph::new());
    let g2 = Arc::new(Graph::new());
    let s1 = Synapse::new(fast_config()).unwrap();
    let s2 = Synapse::new(fast_config()).unwrap();
    let sync1 = g1.sync_with_synapse(&s1, "cortex").unwrap();
    let sync2 = g2.sync_with_synapse(&s2, "cortex").unwrap();

    s1.fire_syn_peer(Arc::new(s2.clone())).unwrap();
    assert!(eventually(|| s1.peer_states() == vec![LinkState::Active]).await);

    let a = g1.form_node("woot", 10).unwrap();
    let b = g1.form_node("woot", 20).unwrap();
    let e = g1.form_edge(a.id, b.id, "foo", "bar").unwrap();
    g1.set_edge_prop(e.id, "lala", "blahblah").unwrap();
    assert!(eventually(|| g2.edge_count() == 1 && g2.get_edges_by_prop("lala", None).len() == 1).await);

    // and back the other way
    let c = g2.form_node("woot", 30).unwrap();
    g2.set_node_prop(c.id, "getme", 8).unwrap();
    assert!(eventually(|| g1.get_nodes_by_prop("getme", Some(&Value::Int(8))).len() == 1).await);

    let a2 = g2.get_node_by_form("woot", 10).unwrap();
    g2.del_node(a2.id).unwrap();
    assert!(eventually(|| g1.get_node_by_form("woot", 10).is_none()).await);
    assert!(eventually(|| g1.edge_count() == 0).await);

    // nothing echoes back: both stores settle at the same shape
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(g1.node_count(), 2);
    assert_eq!(g2.node_count(), 2);
    assert_eq!(g1.edge_count(), g2.edge_count());

    sync1.stop().await;
    sync2.stop().await;
    s1.fini_synapse().await.unwrap();
    s2.fini_synapse().await.unwrap();
}

#[tokio::test]
async fn test_synced_remote_events_are_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replica.log");

    let g1 = Arc::new(Graph::new());
    let g2 = Arc::new(Graph::new());
    g2.set_save_file(std::fs::File::create(&path).unwrap());
    let syn = Synapse::new(fast_config()).unwrap();
    let sync1 = g1.sync_with_synapse(&syn, "cortex").unwrap();
    let sync2 = g2.sync_with_synapse(&syn, "cortex").unwrap();

    let a = g1.form_node("woot", 10).unwrap();
    g1.set_node_prop(a.id, "getme", 8).unwrap();
    assert!(eventually(|| g2.get_nodes_by_prop("getme", None).len() == 1).await);

    sync1.stop().await;
    sync2.stop().await;
    g2.take_save_file().unwrap();

    let g3 = Graph::new();
    assert_eq!(g3.load_from_file(std::fs::File::open(&path).unwrap()).unwrap(), 2);
    assert_eq!(g3.get_node_by_form("woot", 10).unwrap().get("getme"), Some(&Value::Int(8)));
    syn.fini_synapse().await.unwrap();
}
