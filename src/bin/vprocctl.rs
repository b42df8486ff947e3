//! vprocctl - CLI for vprocd
//!
//! Communicates with the vproc daemon over its Unix socket.

use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use peercred_ipc::Client;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use vproc::manager::{Instance, Template};
use vproc::procfs::{self, ProcessInfo, Procfs};
use vproc::protocol::{Request, Response};
use vproc::resources::ResourceType;
use vproc::Config;

#[derive(Parser)]
#[command(name = "vprocctl")]
#[command(about = "Control the vproc process orchestrator")]
struct Args {
    /// Daemon socket (default: <runtime dir>/vproc.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List instances
    Ps,

    /// Start an instance from a template
    Start {
        /// Template id
        template: String,
        /// Instance name
        name: String,
        /// Template variable or resource value (key=value), repeatable
        #[arg(short = 'v', long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },

    /// Stop an instance
    Stop {
        /// Instance name
        name: String,
    },

    /// Restart a stopped instance with its recorded command and resources
    Restart {
        /// Instance name
        name: String,
    },

    /// Stop an instance if needed and forget it
    Rm {
        /// Instance name
        name: String,
    },

    /// Show everything recorded about an instance
    Inspect {
        /// Instance name
        name: String,
    },

    /// Adopt a running process
    Monitor {
        pid: u32,
        /// Instance name
        name: String,
    },

    /// Adopt a process along with its parent chain and launch script
    Discover {
        pid: u32,
        /// Instance name
        name: String,
    },

    /// Adopt the process listening on a TCP port
    DiscoverPort {
        port: u16,
        /// Instance name
        name: String,
    },

    /// List host processes not bound to a running instance
    Scan {
        /// Only processes with listening TCP ports
        #[arg(long)]
        ports: bool,
    },

    /// Re-bind stopped instances to matching running processes
    Reconcile,

    /// Allocate a resource value
    Allocate {
        /// Resource type (e.g., "tcpport")
        kind: String,
        /// Specific value to request (required for non-counter types)
        value: Option<String>,
        /// Claim the value for this owner
        #[arg(long)]
        owner: Option<String>,
    },

    /// Show the allocation table
    Resources,

    /// Manage templates
    #[command(subcommand)]
    Template(TemplateCommand),

    /// Manage resource types
    #[command(subcommand)]
    ResourceType(ResourceTypeCommand),

    /// Inspect a process locally (doesn't require daemon)
    Probe { pid: u32 },

    /// Ping the daemon
    Ping,
}

#[derive(Subcommand)]
enum TemplateCommand {
    /// List templates
    List,
    /// Add or replace a template from a JSON file
    Add {
        /// Path to {"id", "label", "command", "resources", "vars"}
        path: PathBuf,
    },
    /// Show one template
    Show { id: String },
}

#[derive(Subcommand)]
enum ResourceTypeCommand {
    /// List resource types
    List,
    /// Add or replace a resource type
    Add {
        name: String,
        /// Shell check with ${value}; exit 0 means available
        #[arg(long, default_value = "")]
        check: String,
        /// Auto-allocate from START-END (e.g., 3000-3999)
        #[arg(long, value_parser = parse_range)]
        range: Option<(u32, u32)>,
    },
    /// Remove an unused resource type
    Rm { name: String },
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {:?}", s))?;
    if key.is_empty() {
        return Err(format!("empty key in {:?}", s));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_range(s: &str) -> Result<(u32, u32), String> {
    let (start, end) = s
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got {:?}", s))?;
    let start = start.trim().parse().map_err(|e| format!("{}: {}", start, e))?;
    let end = end.trim().parse().map_err(|e| format!("{}: {}", end, e))?;
    if start > end {
        return Err(format!("range start {} is after end {}", start, end));
    }
    Ok((start, end))
}

fn main() {
    let args = Args::parse();

    let mut config = Config::default();
    if let Some(path) = args.socket {
        config = config.with_socket_path(path);
    }

    // Probe is local-only
    if let Command::Probe { pid } = args.command {
        probe_local(pid);
        return;
    }

    let request = match args.command {
        Command::Ps => Request::List,
        Command::Start {
            template,
            name,
            vars,
        } => Request::Start {
            template,
            name,
            vars: vars.into_iter().collect::<BTreeMap<_, _>>(),
            cwd: std::env::current_dir()
                .ok()
                .map(|d| d.to_string_lossy().into_owned()),
        },
        Command::Stop { name } => Request::Stop { name },
        Command::Restart { name } => Request::Restart { name },
        Command::Rm { name } => Request::Remove { name },
        Command::Inspect { name } => Request::Inspect { name },
        Command::Monitor { pid, name } => Request::Monitor { pid, name },
        Command::Discover { pid, name } => Request::Discover { pid, name },
        Command::DiscoverPort { port, name } => Request::DiscoverPort { port, name },
        Command::Scan { ports } => Request::Scan { ports_only: ports },
        Command::Reconcile => Request::Reconcile,
        Command::Allocate { kind, value, owner } => Request::Allocate { kind, value, owner },
        Command::Resources => Request::ListResources,
        Command::Template(TemplateCommand::List) => Request::ListTemplates,
        Command::Template(TemplateCommand::Add { path }) => match load_template(&path) {
            Ok(template) => Request::AddTemplate(template),
            Err(e) => {
                eprintln!("vprocctl: {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        Command::Template(TemplateCommand::Show { id }) => Request::ShowTemplate { id },
        Command::ResourceType(ResourceTypeCommand::List) => Request::ListResourceTypes,
        Command::ResourceType(ResourceTypeCommand::Add { name, check, range }) => {
            Request::AddResourceType(match range {
                Some((start, end)) => ResourceType::counter(&name, &check, start, end),
                None => ResourceType::value(&name, &check),
            })
        }
        Command::ResourceType(ResourceTypeCommand::Rm { name }) => {
            Request::RemoveResourceType { name }
        }
        Command::Ping => Request::Ping,
        Command::Probe { .. } => unreachable!(),
    };

    let sock_path = config.socket();

    match Client::call(&sock_path, &request) {
        Ok(response) => print_response(response),
        Err(e) => {
            if e.to_string().contains("connect") || e.to_string().contains("No such file") {
                eprintln!("vprocctl: daemon not running at {}", sock_path);
                eprintln!("  start with: vprocd");
            } else {
                eprintln!("vprocctl: {}", e);
            }
            std::process::exit(1);
        }
    }
}

fn load_template(path: &Path) -> Result<Template, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&content).map_err(|e| e.to_string())
}

fn format_time(ts: i64) -> String {
    if ts == 0 {
        return "-".to_string();
    }
    Local
        .timestamp_opt(ts, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn format_resources(resources: &BTreeMap<String, String>) -> String {
    if resources.is_empty() {
        return "-".to_string();
    }
    resources
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn print_response(response: Response) {
    match response {
        Response::Ok => {} // Silent success
        Response::Pong => println!("pong"),
        Response::Error { kind, message } => {
            eprintln!("error ({}): {}", kind, message);
            std::process::exit(1);
        }
        Response::Instances(instances) => {
            if instances.is_empty() {
                println!("No instances");
                return;
            }
            println!(
                "{:<20} {:>8} {:>9} {:<20} {:<30}",
                "NAME", "PID", "STATUS", "TEMPLATE", "RESOURCES"
            );
            for inst in instances {
                println!(
                    "{:<20} {:>8} {:>9} {:<20} {:<30}",
                    inst.name,
                    if inst.pid == 0 { "-".to_string() } else { inst.pid.to_string() },
                    inst.status.as_str(),
                    inst.template,
                    format_resources(&inst.resources)
                );
            }
        }
        Response::Instance(inst) => print_instance(&inst),
        Response::Processes(procs) => {
            if procs.is_empty() {
                println!("No processes");
                return;
            }
            println!("{:>8} {:>8} {:<16} {:<12} {}", "PID", "PPID", "NAME", "PORTS", "COMMAND");
            for p in procs {
                println!(
                    "{:>8} {:>8} {:<16} {:<12} {}",
                    p.pid,
                    p.ppid,
                    p.name,
                    format_ports(&p.ports),
                    p.cmdline
                );
            }
        }
        Response::Value(value) => println!("{}", value),
        Response::Resources(resources) => {
            if resources.is_empty() {
                println!("No resources allocated");
                return;
            }
            println!("{:<16} {:<24} {:<20}", "TYPE", "VALUE", "OWNER");
            for r in resources {
                println!("{:<16} {:<24} {:<20}", r.kind, r.value, r.owner);
            }
        }
        Response::Templates(templates) => {
            if templates.is_empty() {
                println!("No templates");
                return;
            }
            println!("{:<20} {:<30} {}", "ID", "LABEL", "COMMAND");
            for t in templates {
                println!("{:<20} {:<30} {}", t.id, t.label, t.command);
            }
        }
        Response::Template(t) => {
            println!("● {}", t.id);
            if !t.label.is_empty() {
                println!("    Label: {}", t.label);
            }
            println!("  Command: {}", t.command);
            if !t.resources.is_empty() {
                println!("Resources: {}", t.resources.join(", "));
            }
            for (k, v) in &t.vars {
                println!("      Var: {}={}", k, v);
            }
        }
        Response::ResourceTypes(types) => {
            println!("{:<16} {:<12} {}", "TYPE", "RANGE", "CHECK");
            for rt in types {
                print_resource_type(&rt);
            }
        }
        Response::ResourceType(rt) => print_resource_type(&rt),
    }
}

fn format_ports(ports: &[u16]) -> String {
    if ports.is_empty() {
        return "-".to_string();
    }
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn print_resource_type(rt: &ResourceType) {
    let range = if rt.counter {
        format!("{}-{}", rt.start, rt.end)
    } else {
        "-".to_string()
    };
    println!("{:<16} {:<12} {}", rt.name, range, rt.check);
}

fn print_instance(inst: &Instance) {
    println!("● {} ({})", inst.name, inst.status);
    println!("  Template: {}", inst.template);
    println!("   Command: {}", inst.command);
    if inst.pid != 0 {
        println!("       PID: {}", inst.pid);
    }
    println!("   Started: {}", format_time(inst.started_at));
    if let Some(cwd) = &inst.cwd {
        println!("       Cwd: {}", cwd);
    }
    println!(" Resources: {}", format_resources(&inst.resources));
    println!("   Managed: {}", if inst.managed { "yes" } else { "no (monitor only)" });
    if inst.discovered {
        println!("Discovered: yes");
    }
    if let Some(err) = &inst.last_error {
        println!("     Error: {}", err);
    }
    if let Some(script) = &inst.launch_script {
        println!("    Launch: {} (PID {})", script.cmdline, script.pid);
    }
    if !inst.parent_chain.is_empty() {
        println!("     Chain:");
        print_chain(&inst.parent_chain);
    }
}

fn print_chain(chain: &[ProcessInfo]) {
    for (depth, p) in chain.iter().enumerate() {
        println!("  {}{} {} {}", "  ".repeat(depth), p.pid, p.name, p.cmdline);
    }
}

fn probe_local(pid: u32) {
    let procfs = Procfs::new();
    let chain = match procfs::parent_chain(&procfs, pid) {
        Ok(chain) => chain,
        Err(e) => {
            eprintln!("vprocctl: {}", e);
            std::process::exit(1);
        }
    };

    let Some(info) = chain.first() else {
        eprintln!("vprocctl: no such process: {}", pid);
        std::process::exit(1);
    };

    println!("● {} (PID {})", info.name, info.pid);
    println!("     PPID: {}", info.ppid);
    println!("  Command: {}", info.cmdline);
    println!("      Exe: {}", info.exe);
    println!("      Cwd: {}", info.cwd);
    println!("    Ports: {}", format_ports(&info.ports));
    if let Some(script) = procfs::find_launch_script(&chain) {
        println!("   Launch: {} (PID {})", script.cmdline, script.pid);
    }
    println!("    Chain:");
    print_chain(&chain);
}
