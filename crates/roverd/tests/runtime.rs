//! End-to-end: the full four-process runtime driven over its RPC surface.

use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value as Json};

use rover_rpc::{Address, Client, SocketNode};

struct Runtime {
    child: Child,
    frontend: Address,
    _dir: tempfile::TempDir,
}

impl Runtime {
    fn launch() -> Self {
        static LAUNCHES: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
        let launch = LAUNCHES.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let dir = tempfile::tempdir().unwrap();
        let catalog = dir.path().join("catalog.json");
        std::fs::copy(
            concat!(env!("CARGO_MANIFEST_DIR"), "/config/catalog.json"),
            &catalog,
        )
        .unwrap();

        let frontend = format!("ipc://{}/rpc.sock", dir.path().display());
        let backend = format!("ipc://{}/srv.sock", dir.path().display());
        let port_base = 40000 + (std::process::id() as usize * 16 + launch * 4) % 20000;
        let child = Command::new(env!("CARGO_BIN_EXE_roverd"))
            .args([
                "--router-frontend",
                &frontend,
                "--router-backend",
                &backend,
                "--control-addr",
                &format!("udp://127.0.0.1:{port_base}"),
                "--update-addr",
                &format!("udp://127.0.0.1:{}", port_base + 1),
                "--dev-catalog",
                catalog.to_str().unwrap(),
                "--dev-pattern",
                &format!("{}/ttyNONE*", dir.path().display()),
                "--dev-vsd-addr",
                "tcp://127.0.0.1:0",
                "--shm-namespace",
                &format!("rover-e2e-{}-{launch}-", std::process::id()),
                "--exec-module",
                "drive",
                "--exec-timeout",
                ".*_setup:1,.*_main:0.1",
                "--log-level",
                "warn",
                "run",
            ])
            .stdin(Stdio::null())
            .spawn()
            .expect("failed to launch roverd");
        Self {
            child,
            frontend: frontend.parse().unwrap(),
            _dir: dir,
        }
    }

    async fn client(&self, identity: &str) -> Arc<Client> {
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            match SocketNode::dealer(self.frontend.clone(), identity.as_bytes()).await {
                Ok(node) => return Arc::new(Client::new(Arc::new(node))),
                Err(_) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(err) => panic!("router never came up: {err}"),
            }
        }
    }

    fn wait_for_exit(&mut self, limit: Duration) -> Option<i32> {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = self.child.try_wait() {
                return status.code();
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        None
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Retry a call until the named service has connected to the router.
async fn call_until_up(client: &Client, method: &str, args: Vec<Json>, address: &[u8]) -> Json {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        match client
            .call_with_timeout(method, args.clone(), Some(address), Duration::from_secs(1))
            .await
        {
            Ok(result) => return result,
            Err(err) => {
                if Instant::now() > deadline {
                    panic!("{method} never succeeded: {err}");
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn estop_propagates_through_the_whole_runtime() {
    let mut runtime = Runtime::launch();
    let client = runtime.client("e2e-client").await;

    // Broker answers configuration queries.
    let module = call_until_up(&client, "get_option", vec![json!("exec_module")], b"broker-service").await;
    assert_eq!(module, json!("drive"));

    // The device service is up with no devices attached.
    let uids = call_until_up(&client, "list_uids", vec![], b"device-service").await;
    assert_eq!(uids, json!([]));

    // Enter teleop, then pull the plug.
    call_until_up(&client, "teleop", vec![], b"executor-service").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    client
        .notify("estop", vec![], Some(b"executor-service"))
        .await
        .unwrap();

    // The executor exits with the distinguished code and the parent
    // propagates it.
    let code = runtime.wait_for_exit(Duration::from_secs(10));
    assert_eq!(code, Some(rover_executor::ESTOP_EXIT_CODE));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn challenge_service_evaluates_one_shots() {
    let mut runtime = Runtime::launch();
    let client = runtime.client("challenge-e2e").await;

    let results = call_until_up(
        &client,
        "execute",
        vec![
            json!([{"func": "challenge", "args": [41]}]),
            json!(true),
            json!(false),
        ],
        b"challenge-service",
    )
    .await;
    assert_eq!(results, json!([42]));

    drop(client);
    let _ = runtime.child.kill();
}
