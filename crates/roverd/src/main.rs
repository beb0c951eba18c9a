//! `roverd` — the on-robot runtime daemon.
//!
//! `roverd run` starts the broker in-process and spawns the device,
//! executor, and challenge processes from the same binary. The role
//! subcommands exist so the children (and developers debugging a single
//! subsystem) can run one process alone.

mod broker;
mod config;
mod process;
mod student;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rover_buffer::{BufferStore, Catalog};
use rover_device::{DeviceManager, DeviceOptions, PollingObserver};
use rover_executor::{Dispatcher, TimeoutTable, ESTOP_EXIT_CODE};
use rover_rpc::Handler;

use crate::broker::Broker;
use crate::config::{LogFormat, Options, OPTIONS_ENV};
use crate::process::{spin, ChildProcess, Endpoints};

/// Grace period between SIGTERM and SIGKILL for supervised children.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "roverd", version, about = "Runtime daemon for controlling rover robots")]
struct Cli {
    #[command(flatten)]
    options: Options,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Start the full runtime: broker plus device/executor/challenge children.
    Run,
    /// Run the broker process alone.
    Broker,
    /// Run the Smart Device manager process alone.
    Device,
    /// Run the student-code executor process alone.
    Executor,
    /// Run the challenge executor process alone.
    Challenge,
}

fn init_logging(options: &Options) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.log_level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match options.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    // Children inherit the parent's resolved options through the
    // environment; a fresh parse would lose non-default flags.
    let options = match std::env::var(OPTIONS_ENV) {
        Ok(json) => match Options::from_env_json(&json) {
            Ok(options) => options,
            Err(err) => {
                eprintln!("bad {OPTIONS_ENV}: {err}");
                return ExitCode::FAILURE;
            }
        },
        Err(_) => cli.options,
    };
    init_logging(&options);
    let options = Arc::new(options);

    let outcome = match cli.role {
        Role::Run => block_on(run_main(options)),
        Role::Broker => block_on(async { broker_main(options).await.map(|()| 0) }),
        Role::Device => block_on(async { device_main(options).await.map(|()| 0) }),
        Role::Executor => executor_main("executor", options),
        Role::Challenge => executor_main("challenge", options),
    };
    match outcome {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            error!(%err, "runtime failed");
            ExitCode::FAILURE
        }
    }
}

fn block_on<F: std::future::Future<Output = Result<i32>>>(future: F) -> Result<i32> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("tokio runtime")?
        .block_on(future)
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt()).expect("signal handler");
    let mut terminate = signal(SignalKind::terminate()).expect("signal handler");
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    info!("shutdown signal received");
}

fn load_buffers(options: &Options) -> Result<Arc<BufferStore>> {
    let catalog = Arc::new(Catalog::load(&options.dev_catalog)?);
    Ok(Arc::new(BufferStore::with_namespace(
        catalog,
        &options.shm_namespace,
    )))
}

/// Stand up the broker's endpoints and background loops on the current
/// runtime. Returns the handles that must stay alive.
async fn start_broker(
    options: &Arc<Options>,
    buffers: Arc<BufferStore>,
) -> Result<(Arc<Broker>, Vec<tokio::task::JoinHandle<()>>, rover_rpc::Router)> {
    let endpoints = Endpoints::new(Arc::clone(options));
    let router = endpoints.make_router().await?;
    let broker = Arc::new(Broker::new(
        buffers,
        serde_json::to_value(&**options)?,
        options.lint_command.clone(),
        options.exec_module.clone(),
    ));
    broker.set_update_client(endpoints.make_update_client().await?);
    broker.set_client(endpoints.make_client("broker").await?);

    let methods = broker.method_map();
    let service = endpoints.make_service("broker", methods.clone()).await?;
    let control = endpoints.make_control_service(methods).await?;

    let update_interval = Duration::from_secs_f64(options.update_interval.max(0.01));
    let mut tasks = vec![
        tokio::spawn({
            let broker = Arc::clone(&broker);
            async move {
                spin(update_interval, || {
                    let broker = Arc::clone(&broker);
                    async move { broker.send_update().await }
                })
                .await
            }
        }),
        tokio::spawn({
            let broker = Arc::clone(&broker);
            async move {
                spin(Duration::from_secs(1), || {
                    let broker = Arc::clone(&broker);
                    async move { broker.update_uids().await }
                })
                .await
            }
        }),
        tokio::spawn(async move { endpoints.report_health().await }),
    ];
    // The services live as long as their tasks; park them together.
    tasks.push(tokio::spawn(async move {
        let _service = service;
        let _control = control;
        std::future::pending::<()>().await;
    }));
    info!("broker started");
    Ok((broker, tasks, router))
}

/// The parent process: broker plus three supervised children.
async fn run_main(options: Arc<Options>) -> Result<i32> {
    let buffers = load_buffers(&options)?;
    let (_broker, tasks, router) = start_broker(&options, Arc::clone(&buffers)).await?;

    let mut children = vec![
        ChildProcess::spawn("device", &options)?,
        ChildProcess::spawn("executor", &options)?,
        ChildProcess::spawn("challenge", &options)?,
    ];

    // Supervise until a signal arrives or a child dies.
    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);
    let mut exited: Option<(&'static str, Option<i32>)> = None;
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                if let Some(done) = children.iter_mut().find_map(|child| {
                    child.try_wait().map(|code| (child.role, code))
                }) {
                    exited = Some(done);
                    break;
                }
            }
        }
    }

    for child in &mut children {
        child.terminate(TERMINATE_GRACE).await;
    }
    for task in tasks {
        task.abort();
    }
    router.close().await;
    buffers.unlink_all();

    match exited {
        Some((role, Some(code))) if code == ESTOP_EXIT_CODE => {
            error!(role, "emergency stop received");
            Ok(ESTOP_EXIT_CODE)
        }
        Some((role, code)) => {
            let code = code.unwrap_or(1);
            if code == 0 {
                warn!(role, "process exited early");
            } else {
                error!(role, code, "process failed");
            }
            Ok(if code == 0 { 0 } else { 1 })
        }
        None => Ok(0),
    }
}

/// The broker alone (no children).
async fn broker_main(options: Arc<Options>) -> Result<()> {
    let buffers = load_buffers(&options)?;
    let (_broker, tasks, router) = start_broker(&options, Arc::clone(&buffers)).await?;
    wait_for_shutdown_signal().await;
    for task in tasks {
        task.abort();
    }
    router.close().await;
    buffers.unlink_all();
    Ok(())
}

/// The Smart Device manager process.
async fn device_main(options: Arc<Options>) -> Result<()> {
    let buffers = load_buffers(&options)?;
    let endpoints = Endpoints::new(Arc::clone(&options));
    let manager = Arc::new(DeviceManager::new(
        Arc::clone(&buffers),
        DeviceOptions {
            baud_rate: options.dev_baud_rate,
            poll_interval: Duration::from_secs_f64(options.dev_poll_interval.max(0.001)),
            ..DeviceOptions::default()
        },
    ));
    let service = endpoints
        .make_service("device", manager.method_map())
        .await?;
    let observer = Box::new(PollingObserver::new(
        &options.dev_patterns,
        Duration::from_secs(1),
    ));

    tokio::select! {
        _ = wait_for_shutdown_signal() => {}
        _ = Arc::clone(&manager).watch_serial_ports(observer) => {}
        outcome = Arc::clone(&manager).serve_virtual_devices(&options.dev_vsd_addr) => {
            outcome.context("virtual device listener failed")?;
        }
        _ = endpoints.report_health() => {}
    }
    service.close().await;
    // This process created the device regions; remove them on the way out.
    buffers.unlink_all();
    Ok(())
}

/// The executor (or challenge) process.
///
/// The calling thread becomes the sync executor; a service thread runs the
/// remote-call endpoint and signal handling, and a third thread runs the
/// async executor's cooperative loop.
fn executor_main(name: &'static str, options: Arc<Options>) -> Result<i32> {
    let buffers = load_buffers(&options)?;
    let factory = student::module_factory(&options.exec_module)
        .map_err(anyhow::Error::msg)
        .context("selecting student module")?;
    let timeouts = TimeoutTable::parse(&options.exec_timeouts).map_err(anyhow::Error::msg)?;
    let names = options.device_names().map_err(anyhow::Error::msg)?;
    let dispatcher = Arc::new(Dispatcher::new(buffers, names, factory, timeouts));

    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();
    let service_thread = std::thread::Builder::new()
        .name(format!("{name}-service"))
        .spawn({
            let dispatcher = Arc::clone(&dispatcher);
            let options = Arc::clone(&options);
            move || {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                    .expect("service runtime");
                runtime.block_on(async move {
                    let endpoints = Endpoints::new(options);
                    match endpoints.make_client(name).await {
                        Ok(client) => dispatcher.set_device_client(client),
                        Err(err) => warn!(%err, "executor client unavailable"),
                    }
                    let service = match endpoints
                        .make_service(name, dispatcher.method_map())
                        .await
                    {
                        Ok(service) => Some(service),
                        Err(err) => {
                            error!(%err, "executor service unavailable");
                            None
                        }
                    };
                    let _ = ready_tx.send(());
                    wait_for_shutdown_signal().await;
                    dispatcher.sync_exec().stop();
                    dispatcher.async_exec().stop();
                    if let Some(service) = service {
                        service.close().await;
                    }
                });
            }
        })
        .context("spawning service thread")?;
    let _ = ready_rx.recv_timeout(Duration::from_secs(10));

    let _async_thread = std::thread::Builder::new()
        .name(format!("{name}-actions"))
        .spawn({
            let dispatcher = Arc::clone(&dispatcher);
            move || dispatcher.async_exec().execute_forever()
        })
        .context("spawning async executor thread")?;

    info!(role = name, "execution dispatcher started");
    let outcome = dispatcher.sync_exec().execute_forever();
    drop(service_thread);
    Ok(match outcome {
        Err(rover_executor::ExecutionError::EmergencyStop) => ESTOP_EXIT_CODE,
        _ => 0,
    })
}
