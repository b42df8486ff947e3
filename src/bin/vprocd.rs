//! vprocd - process orchestrator daemon
//!
//! Listens on a per-user Unix socket for commands from vprocctl.
//!
//! On startup:
//! - Loads the state file (seeding built-in resource types on first run)
//! - Re-attaches watchers to instances whose process survived the last daemon
//! - Optionally re-binds stopped instances to live processes (reconcile)
//!
//! Managed processes run in their own process groups and are left alone on
//! shutdown; the next daemon picks them up again.

use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};

use peercred_ipc::{CallerInfo, Connection, Server};
use vproc::manager::{Manager, ManagerError};
use vproc::protocol::{Request, Response};
use vproc::Config;

#[derive(Parser)]
#[command(name = "vprocd")]
#[command(about = "Local process orchestrator daemon")]
#[command(
    long_about = "vprocd starts processes from templates, allocates the ports and \
    other resources they need, and tracks them across restarts. It listens on a \
    Unix socket for commands from vprocctl."
)]
struct Args {
    /// State file (default: <data dir>/vproc/state.json)
    #[arg(long)]
    state: Option<PathBuf>,

    /// Socket path (default: <runtime dir>/vproc.sock)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Timeout for a single resource check command, in milliseconds
    #[arg(long, default_value_t = 5000)]
    check_timeout_ms: u64,

    /// Don't re-bind stopped instances to running processes at startup
    #[arg(long)]
    no_reconcile: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = Config::default().with_check_timeout(Duration::from_millis(args.check_timeout_ms));
    if let Some(path) = args.state {
        config = config.with_state_path(path);
    }
    if let Some(path) = args.socket {
        config = config.with_socket_path(path);
    }

    let manager = Manager::open(&config)?;
    info!("State loaded from {}", config.state_path.display());

    match manager.resume().await {
        Ok(0) => {}
        Ok(count) => info!("Re-attached {} running instances", count),
        Err(e) => log::warn!("Failed to resume instances: {}", e),
    }

    if !args.no_reconcile {
        match manager.reconcile().await {
            Ok(rebound) if !rebound.is_empty() => {
                info!("Reconciled {} instances", rebound.len());
            }
            Ok(_) => log::debug!("Nothing to reconcile"),
            Err(e) => log::warn!("Reconcile failed: {}", e),
        }
    }

    let sock_path = config.socket();
    let server = Server::bind(&sock_path)?;
    info!("vprocd listening on {}", sock_path);

    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            accepted = server.accept() => match accepted {
                Ok((conn, caller)) => {
                    let manager = manager.clone();
                    tokio::spawn(handle_connection(conn, caller, manager));
                }
                Err(e) => {
                    log::error!("accept error: {}", e);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    if let Err(e) = std::fs::remove_file(&sock_path) {
        log::debug!("Failed to remove {}: {}", sock_path, e);
    }
    Ok(())
}

async fn handle_connection(mut conn: Connection, caller: CallerInfo, manager: Manager) {
    info!(
        "connection from uid={} pid={} exe={:?}",
        caller.uid, caller.pid, caller.exe
    );

    let request: Request = match conn.read().await {
        Ok(r) => r,
        Err(e) => {
            log::error!("read error: {}", e);
            let _ = conn
                .write(&Response::error("InvalidRequest", "invalid request"))
                .await;
            return;
        }
    };

    let response = handle_request(request, &manager).await;

    if let Err(e) = conn.write(&response).await {
        log::error!("write error: {}", e);
    }
}

fn error_response(e: ManagerError) -> Response {
    Response::error(e.kind(), e.to_string())
}

fn respond<T>(result: Result<T, ManagerError>, wrap: impl FnOnce(T) -> Response) -> Response {
    match result {
        Ok(value) => wrap(value),
        Err(e) => error_response(e),
    }
}

async fn handle_request(request: Request, manager: &Manager) -> Response {
    match request {
        Request::Ping => Response::Pong,
        Request::List => Response::Instances(manager.list_instances().await),
        Request::Inspect { name } => respond(manager.instance(&name).await, Response::Instance),
        Request::Start {
            template,
            name,
            vars,
            cwd,
        } => respond(
            manager
                .start_instance(&template, &name, vars, cwd.map(PathBuf::from))
                .await,
            Response::Instance,
        ),
        Request::Stop { name } => respond(manager.stop_instance(&name).await, Response::Instance),
        Request::Restart { name } => {
            respond(manager.restart_instance(&name).await, Response::Instance)
        }
        Request::Remove { name } => respond(manager.remove_instance(&name).await, |_| Response::Ok),
        Request::Monitor { pid, name } => {
            respond(manager.monitor(pid, &name).await, Response::Instance)
        }
        Request::Discover { pid, name } => {
            respond(manager.discover_by_pid(pid, &name).await, Response::Instance)
        }
        Request::DiscoverPort { port, name } => respond(
            manager.discover_by_port(port, &name).await,
            Response::Instance,
        ),
        Request::Scan { ports_only } => {
            respond(manager.scan(ports_only).await, Response::Processes)
        }
        Request::Reconcile => respond(manager.reconcile().await, Response::Instances),
        Request::Allocate { kind, value, owner } => respond(
            manager
                .allocate(&kind, value.as_deref(), owner.as_deref())
                .await,
            Response::Value,
        ),
        Request::ListResources => Response::Resources(manager.resources().await),
        Request::ListTemplates => Response::Templates(manager.templates().await),
        Request::AddTemplate(template) => {
            respond(manager.add_template(template).await, Response::Template)
        }
        Request::ShowTemplate { id } => respond(manager.template(&id).await, Response::Template),
        Request::ListResourceTypes => Response::ResourceTypes(manager.resource_types().await),
        Request::AddResourceType(rt) => {
            respond(manager.add_resource_type(rt).await, Response::ResourceType)
        }
        Request::RemoveResourceType { name } => respond(
            manager.remove_resource_type(&name).await,
            Response::ResourceType,
        ),
    }
}
