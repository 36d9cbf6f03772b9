#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::Router;
use vista_core::{NetworkService, Operation, PipelineStats, Resource, ResourceMeta};
use vista_persist::MemoryBackend;
use vista_publish::{Fanout, RegistrySink, RetryPolicy};
use vista_store::{Dispatcher, Outcome, Repository};

type Paths = Arc<Mutex<Vec<String>>>;

async fn record(State(paths): State<Paths>, uri: Uri) -> StatusCode {
    paths.lock().unwrap().push(uri.path().to_string());
    StatusCode::OK
}

async fn agent() -> (SocketAddr, Paths) {
    let paths = Paths::default();
    let app = Router::new().fallback(record).with_state(paths.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, paths)
}

fn service(generation: i64, instances: &[&str]) -> Resource {
    Resource::Service(NetworkService {
        meta: ResourceMeta { id: "S1".into(), name: "web".into(), namespace: "prod".into(), generation, ..Default::default() },
        address: "10.96.0.10".into(),
        port: 80,
        instances: instances.iter().map(|s| s.to_string()).collect(),
    })
}

async fn dispatcher() -> (Dispatcher, Paths) {
    let (addr, paths) = agent().await;
    let sink = RegistrySink::new(&format!("http://{}", addr), Duration::from_secs(2)).unwrap();
    let stats = Arc::new(PipelineStats::new());
    let repo = Repository::new(Arc::new(MemoryBackend::new()), stats.clone());
    let (d, _handle) = Dispatcher::new(repo, Fanout::new(RetryPolicy::once()).with_sink(Arc::new(sink)), stats);
    (d, paths)
}

fn deregistered(paths: &Paths) -> Vec<String> {
    paths.lock().unwrap().iter().filter(|p| p.contains("/deregister/")).cloned().collect()
}

#[tokio::test]
async fn delete_without_endpoints_deregisters_stored_instances() {
    let (mut d, paths) = dispatcher().await;

    assert!(matches!(d.dispatch(Operation::add(service(1, &["10.0.0.1", "10.0.0.2"]))).await, Outcome::Published(_)));
    // Endpoints are usually gone by the time the delete is observed.
    assert!(matches!(d.dispatch(Operation::delete(service(1, &[]))).await, Outcome::Published(_)));

    assert_eq!(
        deregistered(&paths),
        vec!["/v1/agent/service/deregister/S1-0", "/v1/agent/service/deregister/S1-1"]
    );
    assert_eq!(d.repository().get_resource("S1").unwrap(), None);
}

#[tokio::test]
async fn shrinking_update_deregisters_tail_indices() {
    let (mut d, paths) = dispatcher().await;

    d.dispatch(Operation::add(service(1, &["10.0.0.1", "10.0.0.2", "10.0.0.3"]))).await;
    assert!(matches!(d.dispatch(Operation::update(service(2, &["10.0.0.1"]))).await, Outcome::Published(_)));

    assert_eq!(
        deregistered(&paths),
        vec!["/v1/agent/service/deregister/S1-1", "/v1/agent/service/deregister/S1-2"]
    );
    // The stored entry reflects the new instance set.
    assert_eq!(d.repository().get_resource("S1").unwrap(), Some(service(2, &["10.0.0.1"])));
}
