#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, Endpoints, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::watcher::Event;
use tokio::sync::mpsc;
use vista_core::{OpKind, Operation, Resource};
use vista_kubehub::{EndpointLookup, NamespacePolicy, WatchDriver};

/// Endpoints keyed by "ns/name"; names listed in `broken` fail the lookup.
#[derive(Default)]
struct StubLookup {
    endpoints: HashMap<String, Endpoints>,
    broken: Vec<String>,
    calls: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl EndpointLookup for StubLookup {
    async fn endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        let key = format!("{}/{}", namespace, name);
        self.calls.lock().unwrap().push(key.clone());
        if self.broken.iter().any(|b| b == name) {
            return Err(anyhow!("endpoints for {} unavailable", key));
        }
        Ok(self.endpoints.get(&key).cloned())
    }
}

fn meta(uid: &str, name: &str, ns: &str, generation: i64) -> ObjectMeta {
    ObjectMeta {
        uid: Some(uid.into()),
        name: Some(name.into()),
        namespace: Some(ns.into()),
        generation: Some(generation),
        ..Default::default()
    }
}

fn svc(uid: &str, name: &str, ns: &str, generation: i64) -> Service {
    Service {
        metadata: meta(uid, name, ns, generation),
        spec: Some(ServiceSpec {
            cluster_ip: Some("10.96.0.10".into()),
            ports: Some(vec![ServicePort { port: 8080, ..Default::default() }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn eps(name: &str, ns: &str, ips: &[&str]) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta { name: Some(name.into()), namespace: Some(ns.into()), ..Default::default() },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(ips.iter().map(|ip| EndpointAddress { ip: ip.to_string(), ..Default::default() }).collect()),
            ..Default::default()
        }]),
    }
}

fn driver<K: vista_kubehub::Tracked>(lookup: Arc<StubLookup>) -> (WatchDriver<K>, mpsc::UnboundedReceiver<Operation>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (WatchDriver::new(Arc::new(NamespacePolicy::default()), lookup, tx), rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Operation>) -> Vec<Operation> {
    let mut out = Vec::new();
    while let Ok(op) = rx.try_recv() {
        out.push(op);
    }
    out
}

fn instances(op: &Operation) -> Vec<String> {
    match op.resource() {
        Resource::Service(s) => s.instances.clone(),
        other => panic!("expected service, got {:?}", other.kind()),
    }
}

#[tokio::test]
async fn first_sighting_is_add_then_update() {
    let lookup = Arc::new(StubLookup {
        endpoints: HashMap::from([("shop/web".to_string(), eps("web", "shop", &["10.1.0.4", "10.1.0.5"]))]),
        ..Default::default()
    });
    let (mut d, mut rx) = driver::<Service>(lookup);

    assert_eq!(d.handle(Event::Applied(svc("u1", "web", "shop", 1))).await.unwrap(), 1);
    assert_eq!(d.handle(Event::Applied(svc("u1", "web", "shop", 2))).await.unwrap(), 1);

    let ops = drain(&mut rx);
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].kind(), OpKind::Add);
    assert_eq!(ops[1].kind(), OpKind::Update);
    assert_eq!(ops[1].resource().generation(), 2);
    assert_eq!(instances(&ops[0]), vec!["10.1.0.4", "10.1.0.5"]);
    match ops[0].resource() {
        Resource::Service(s) => {
            assert_eq!(s.address, "10.96.0.10");
            assert_eq!(s.port, 8080);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn excluded_namespace_is_skipped() {
    let lookup = Arc::new(StubLookup::default());
    let (mut d, mut rx) = driver::<Service>(lookup.clone());

    assert_eq!(d.handle(Event::Applied(svc("k1", "kube-dns", "kube-system", 1))).await.unwrap(), 0);
    assert_eq!(d.handle(Event::Deleted(svc("k1", "kube-dns", "kube-system", 1))).await.unwrap(), 0);
    assert!(drain(&mut rx).is_empty());
    assert!(lookup.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn lookup_failure_still_emits_with_no_instances() {
    let lookup = Arc::new(StubLookup { broken: vec!["api".into()], ..Default::default() });
    let (mut d, mut rx) = driver::<Service>(lookup);

    d.handle(Event::Applied(svc("u2", "api", "shop", 1))).await.unwrap();
    d.handle(Event::Deleted(svc("u2", "api", "shop", 1))).await.unwrap();

    let ops = drain(&mut rx);
    assert_eq!(ops.iter().map(|o| o.kind()).collect::<Vec<_>>(), vec![OpKind::Add, OpKind::Delete]);
    assert!(ops.iter().all(|o| instances(o).is_empty()));
}

#[tokio::test]
async fn deleted_then_reapplied_is_add_again() {
    let (mut d, mut rx) = driver::<Service>(Arc::new(StubLookup::default()));

    d.handle(Event::Applied(svc("u3", "cart", "shop", 1))).await.unwrap();
    d.handle(Event::Deleted(svc("u3", "cart", "shop", 1))).await.unwrap();
    d.handle(Event::Applied(svc("u3", "cart", "shop", 1))).await.unwrap();

    let kinds: Vec<OpKind> = drain(&mut rx).iter().map(|o| o.kind()).collect();
    assert_eq!(kinds, vec![OpKind::Add, OpKind::Delete, OpKind::Add]);
}

#[tokio::test]
async fn restart_frames_known_and_new_objects() {
    let lookup = Arc::new(StubLookup::default());
    let (mut d, mut rx) = driver::<Deployment>(lookup.clone());

    let dep = |uid: &str, ns: &str, g: i64| Deployment { metadata: meta(uid, uid, ns, g), ..Default::default() };
    d.handle(Event::Applied(dep("d1", "shop", 1))).await.unwrap();
    let sent = d
        .handle(Event::Restarted(vec![dep("d1", "shop", 2), dep("d2", "shop", 1), dep("d3", "kube-system", 1)]))
        .await
        .unwrap();
    assert_eq!(sent, 2);

    let ops = drain(&mut rx);
    let framed: Vec<(OpKind, &str)> = ops.iter().map(|o| (o.kind(), o.resource().id())).collect();
    assert_eq!(framed, vec![(OpKind::Add, "d1"), (OpKind::Update, "d1"), (OpKind::Add, "d2")]);
    // Workloads never consult endpoints.
    assert!(lookup.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn run_skips_stream_errors_and_stops_on_closed_channel() {
    let (d, mut rx) = driver::<Service>(Arc::new(StubLookup::default()));
    let events = vec![
        Ok(Event::Applied(svc("u1", "a", "shop", 1))),
        Err(kube::runtime::watcher::Error::NoResourceVersion),
        Ok(Event::Applied(svc("u2", "b", "shop", 1))),
    ];
    d.run(futures::stream::iter(events)).await.unwrap();
    assert_eq!(drain(&mut rx).len(), 2);

    let (d, rx) = driver::<Service>(Arc::new(StubLookup::default()));
    drop(rx);
    let res = d.run(futures::stream::iter(vec![Ok(Event::Applied(svc("u1", "a", "shop", 1)))])).await;
    assert!(res.is_err());
}
