//! Endpoint construction and subprocess supervision.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use rover_rpc::{Address, Client, DatagramNode, MethodMap, Router, Service, SocketNode};

use crate::config::Options;

/// Builds clients, services, and routers in the runtime's standard
/// configurations.
pub struct Endpoints {
    options: Arc<Options>,
}

impl Endpoints {
    pub fn new(options: Arc<Options>) -> Self {
        Self { options }
    }

    /// Pick an address to connect to from a set of bound ones, preferring
    /// `ipc` (Unix sockets avoid the IP stack entirely).
    fn connection(bindings: &[String]) -> Result<Address> {
        let mut addresses: Vec<Address> = bindings
            .iter()
            .map(|binding| binding.parse())
            .collect::<Result<_, _>>()
            .context("bad router address")?;
        addresses.sort_by_key(|address| !matches!(address, Address::Ipc(_)));
        addresses
            .into_iter()
            .next()
            .context("must provide at least one address")
    }

    pub async fn make_router(&self) -> Result<Router> {
        let frontend: Vec<Address> = self
            .options
            .router_frontend
            .iter()
            .map(|a| a.parse())
            .collect::<Result<_, _>>()?;
        let backend: Vec<Address> = self
            .options
            .router_backend
            .iter()
            .map(|a| a.parse())
            .collect::<Result<_, _>>()?;
        Ok(Router::bind(&frontend, &backend).await?)
    }

    /// A client on the router frontend, identified as `<name>-client`.
    pub async fn make_client(&self, name: &str) -> Result<Arc<Client>> {
        let address = Self::connection(&self.options.router_frontend)?;
        let identity = format!("{name}-client");
        let node = Arc::new(SocketNode::dealer(address, identity.as_bytes()).await?);
        Ok(Arc::new(Client::new(node)))
    }

    /// A service on the router backend, identified as `<name>-service`.
    pub async fn make_service(&self, name: &str, methods: MethodMap) -> Result<Service> {
        let address = Self::connection(&self.options.router_backend)?;
        let identity = format!("{name}-service");
        let node = Arc::new(SocketNode::dealer(address, identity.as_bytes()).await?);
        Ok(Service::start(node, methods, self.options.service_workers))
    }

    /// A client publishing update snapshots over UDP multicast.
    pub async fn make_update_client(&self) -> Result<Arc<Client>> {
        let node = Arc::new(DatagramNode::from_address(&self.options.update_addr, false).await?);
        Ok(Arc::new(Client::new(node)))
    }

    /// A service receiving gamepad/field control input.
    pub async fn make_control_service(&self, methods: MethodMap) -> Result<Service> {
        let node = Arc::new(DatagramNode::from_address(&self.options.control_addr, true).await?);
        Ok(Service::start(node, methods, self.options.service_workers))
    }

    /// Log a heartbeat line forever.
    pub async fn report_health(&self) {
        let interval = Duration::from_secs_f64(self.options.health_interval.max(1.0));
        loop {
            tokio::time::sleep(interval).await;
            info!(pid = std::process::id(), "health check");
        }
    }
}

/// Periodically run an async callback (the callback may overrun the
/// interval; ticks do not pile up).
pub async fn spin<F, Fut>(interval: Duration, mut callback: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        let tick = tokio::time::sleep(interval);
        tokio::join!(tick, callback());
    }
}

/// A supervised child runtime process.
pub struct ChildProcess {
    pub role: &'static str,
    child: Child,
}

impl ChildProcess {
    /// Re-execute this binary with a role subcommand, forwarding the parsed
    /// options through the environment.
    pub fn spawn(role: &'static str, options: &Options) -> Result<Self> {
        let exe = std::env::current_exe().context("cannot locate own binary")?;
        let mut command = Command::new(exe);
        command
            .arg(role)
            .env(crate::config::OPTIONS_ENV, options.to_env_json())
            .stdin(Stdio::null());
        unsafe {
            // A child must not outlive a supervisor that dies without
            // running its shutdown path.
            command.pre_exec(|| {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
                Ok(())
            });
        }
        let child = command
            .spawn()
            .with_context(|| format!("failed to spawn {role} process"))?;
        info!(role, pid = child.id(), "process started");
        Ok(Self { role, child })
    }

    /// `None` while running; `Some(code)` once exited (`Some(None)` for a
    /// signal death).
    pub fn try_wait(&mut self) -> Option<Option<i32>> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code()),
            Ok(None) => None,
            Err(err) => {
                error!(role = self.role, %err, "failed to poll child");
                Some(None)
            }
        }
    }

    /// Terminate cooperatively; force-kill after the grace period.
    pub async fn terminate(&mut self, grace: Duration) {
        let Some(pid) = self.child.id() else {
            return;
        };
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => info!(role = self.role, ?status, "terminated process"),
            Ok(Err(err)) => warn!(role = self.role, %err, "child wait failed"),
            Err(_) => {
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
                error!(role = self.role, "killed process");
            }
        }
    }
}
