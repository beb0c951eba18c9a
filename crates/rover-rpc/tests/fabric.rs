//! End-to-end flows through the router, sockets, and endpoints.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rover_rpc::{
    Address, Client, MethodMap, Node, Router, RpcError, Service, SocketNode,
};
use serde_json::{json, Value as Json};

fn any_tcp() -> Address {
    "tcp://127.0.0.1:0".parse().unwrap()
}

async fn start_router() -> (Router, Address, Address) {
    let router = Router::bind(&[any_tcp()], &[any_tcp()]).await.unwrap();
    let frontend = router.frontend().local_addresses()[0].clone();
    let backend = router.backend().local_addresses()[0].clone();
    (router, frontend, backend)
}

fn echo_methods() -> MethodMap {
    MethodMap::new().route("echo_id", |args: Vec<Json>| async move {
        let n = args
            .first()
            .and_then(Json::as_i64)
            .ok_or_else(|| rover_rpc::RemoteError::new("expected an integer"))?;
        Ok(Json::from(n + 1))
    })
}

async fn settle() {
    // Let greetings land in the router's peer registry.
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pipelined_requests_through_router() {
    let (_router, frontend, backend) = start_router().await;

    let service_node = Arc::new(SocketNode::dealer(backend, b"test-service").await.unwrap());
    let _service = Service::start(service_node, echo_methods(), 3);

    let client_node = Arc::new(SocketNode::dealer(frontend, b"test-client").await.unwrap());
    let client = Client::new(client_node);
    settle().await;

    let (a, b, c, d) = tokio::join!(
        client.call("echo_id", vec![json!(1)], Some(b"test-service")),
        client.call("echo_id", vec![json!(2)], Some(b"test-service")),
        client.call("echo_id", vec![json!(3)], Some(b"test-service")),
        client.call("echo_id", vec![json!(4)], Some(b"test-service")),
    );
    assert_eq!(a.unwrap(), json!(2));
    assert_eq!(b.unwrap(), json!(3));
    assert_eq!(c.unwrap(), json!(4));
    assert_eq!(d.unwrap(), json!(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ipc_transport_works() {
    let dir = tempfile::tempdir().unwrap();
    let frontend_addr: Address = format!("ipc://{}/rpc.sock", dir.path().display())
        .parse()
        .unwrap();
    let backend_addr: Address = format!("ipc://{}/srv.sock", dir.path().display())
        .parse()
        .unwrap();
    let _router = Router::bind(
        std::slice::from_ref(&frontend_addr),
        std::slice::from_ref(&backend_addr),
    )
    .await
    .unwrap();

    let service_node = Arc::new(SocketNode::dealer(backend_addr, b"svc").await.unwrap());
    let _service = Service::start(service_node, echo_methods(), 1);
    let client_node = Arc::new(SocketNode::dealer(frontend_addr, b"cli").await.unwrap());
    let client = Client::new(client_node);
    settle().await;

    let result = client
        .call("echo_id", vec![json!(41)], Some(b"svc"))
        .await
        .unwrap();
    assert_eq!(result, json!(42));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_method_returns_structured_error() {
    let (_router, frontend, backend) = start_router().await;
    let service_node = Arc::new(SocketNode::dealer(backend, b"svc").await.unwrap());
    let _service = Service::start(service_node, echo_methods(), 1);
    let client_node = Arc::new(SocketNode::dealer(frontend, b"cli").await.unwrap());
    let client = Client::new(client_node);
    settle().await;

    match client.call("frobnicate", vec![], Some(b"svc")).await {
        Err(RpcError::Remote(error)) => {
            assert_eq!(error.message, "no such method exists");
            assert_eq!(error.context["method"], json!("frobnicate"));
        }
        other => panic!("expected a remote error, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_service_times_out() {
    let (_router, frontend, _backend) = start_router().await;
    let client_node = Arc::new(SocketNode::dealer(frontend, b"cli").await.unwrap());
    let client = Client::new(client_node);
    settle().await;

    let outcome = client
        .call_with_timeout(
            "echo_id",
            vec![json!(1)],
            Some(b"nobody-home"),
            Duration::from_millis(300),
        )
        .await;
    assert!(matches!(outcome, Err(RpcError::Timeout)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn notifications_reach_the_handler_without_replies() {
    let (_router, frontend, backend) = start_router().await;
    let hits = Arc::new(AtomicU32::new(0));
    let methods = {
        let hits = Arc::clone(&hits);
        MethodMap::new().route("poke", move |_args| {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(Json::Null)
            }
        })
    };
    let service_node = Arc::new(SocketNode::dealer(backend, b"svc").await.unwrap());
    let _service = Service::start(service_node, methods, 1);
    let client_node = Arc::new(SocketNode::dealer(frontend, b"cli").await.unwrap());
    let client = Client::new(client_node);
    settle().await;

    for _ in 0..3 {
        client.notify("poke", vec![], Some(b"svc")).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn loopback_is_dropped() {
    let (_router, frontend, _backend) = start_router().await;
    let node = Arc::new(SocketNode::dealer(frontend, b"self").await.unwrap());
    settle().await;
    // Addressing yourself is refused by the router, so nothing arrives.
    node.send(vec![b"payload".to_vec()], Some(b"self"))
        .await
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_millis(300), node.recv()).await;
    assert!(outcome.is_err(), "loopback message should have been dropped");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publisher_filters_by_topic_prefix() {
    let publisher = Arc::new(
        SocketNode::publisher(&[any_tcp()], b"pub")
            .await
            .unwrap(),
    );
    let address = publisher.local_addresses()[0].clone();
    let telemetry = SocketNode::subscriber(address.clone(), b"sub-telemetry", &[b"telemetry"])
        .await
        .unwrap();
    let firehose = SocketNode::subscriber(address, b"sub-all", &[]).await.unwrap();
    settle().await;

    publisher
        .send(vec![b"t-payload".to_vec()], Some(b"telemetry/updates"))
        .await
        .unwrap();
    publisher
        .send(vec![b"l-payload".to_vec()], Some(b"logs"))
        .await
        .unwrap();

    let (frames, sender) = tokio::time::timeout(Duration::from_secs(1), telemetry.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frames, vec![b"t-payload".to_vec()]);
    assert!(sender.is_empty());
    // The topic-filtered subscriber must not see the logs message.
    assert!(
        tokio::time::timeout(Duration::from_millis(300), telemetry.recv())
            .await
            .is_err()
    );

    // The catch-all subscriber sees both, in order.
    let (frames, _) = tokio::time::timeout(Duration::from_secs(1), firehose.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frames, vec![b"t-payload".to_vec()]);
    let (frames, _) = tokio::time::timeout(Duration::from_secs(1), firehose.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frames, vec![b"l-payload".to_vec()]);
}
