//! IPC protocol for vprocd
//!
//! Defines request/response types for vprocctl ↔ daemon communication.
//! Messages are MessagePack-encoded by peercred-ipc.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::manager::{Instance, Template};
use crate::procfs::ProcessInfo;
use crate::resources::{Resource, ResourceType};

/// Request from CLI to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Health check
    Ping,
    /// All instances
    List,
    /// One instance record
    Inspect { name: String },
    /// Start an instance from a template
    Start {
        template: String,
        name: String,
        vars: BTreeMap<String, String>,
        /// Working directory for the process
        cwd: Option<String>,
    },
    Stop { name: String },
    /// Start a stopped instance again with its recorded command and resources
    Restart { name: String },
    /// Stop if needed, release resources and forget the instance
    Remove { name: String },
    /// Adopt a running process by PID
    Monitor { pid: u32, name: String },
    /// Adopt a process by PID, recording its parent chain
    Discover { pid: u32, name: String },
    /// Adopt the process listening on a TCP port
    DiscoverPort { port: u16, name: String },
    /// Host processes not bound to a running instance
    Scan { ports_only: bool },
    /// Re-bind stopped instances to live processes
    Reconcile,
    /// Allocate a resource value, claiming it when an owner is given
    Allocate {
        kind: String,
        value: Option<String>,
        owner: Option<String>,
    },
    ListResources,
    ListTemplates,
    AddTemplate(Template),
    ShowTemplate { id: String },
    ListResourceTypes,
    AddResourceType(ResourceType),
    RemoveResourceType { name: String },
}

/// Response from daemon to CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Success with no data
    Ok,
    Pong,
    Instances(Vec<Instance>),
    Instance(Instance),
    Processes(Vec<ProcessInfo>),
    /// An allocated resource value
    Value(String),
    Resources(Vec<Resource>),
    Templates(Vec<Template>),
    Template(Template),
    ResourceTypes(Vec<ResourceType>),
    ResourceType(ResourceType),
    /// Failure: stable kind name plus a human-readable message
    Error { kind: String, message: String },
}

impl Response {
    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        Self::Error {
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::InstanceStatus;

    #[test]
    fn test_request_roundtrip() {
        let requests = vec![
            Request::Ping,
            Request::Start {
                template: "node".into(),
                name: "web".into(),
                vars: BTreeMap::from([("tcpport".to_string(), "3000".to_string())]),
                cwd: Some("/srv/app".into()),
            },
            Request::Allocate {
                kind: "tcpport".into(),
                value: None,
                owner: Some("web".into()),
            },
            Request::Scan { ports_only: true },
            Request::AddResourceType(ResourceType::counter("gpu", "", 0, 3)),
            Request::DiscoverPort {
                port: 8080,
                name: "api".into(),
            },
        ];

        for req in requests {
            let encoded = rmp_serde::to_vec(&req).unwrap();
            let decoded: Request = rmp_serde::from_slice(&encoded).unwrap();
            assert_eq!(format!("{:?}", req), format!("{:?}", decoded));
        }
    }

    #[test]
    fn test_response_roundtrip() {
        let mut inst = Instance::new("web", "node");
        inst.command = "node app.js".into();
        inst.resources.insert("tcpport".into(), "3000".into());
        inst.set_running(4242);
        inst.parent_chain = vec![ProcessInfo {
            pid: 4242,
            ppid: 1,
            name: "node".into(),
            ports: vec![3000],
            ..Default::default()
        }];

        let responses = vec![
            Response::Ok,
            Response::error("UnknownInstance", "Unknown instance: api"),
            Response::Instance(inst),
            Response::Value("3001".into()),
            Response::Resources(vec![Resource {
                kind: "tcpport".into(),
                value: "3000".into(),
                owner: "web".into(),
            }]),
        ];

        for resp in responses {
            let encoded = rmp_serde::to_vec(&resp).unwrap();
            let decoded: Response = rmp_serde::from_slice(&encoded).unwrap();
            assert_eq!(format!("{:?}", resp), format!("{:?}", decoded));
        }
    }

    #[test]
    fn test_instance_status_survives_encoding() {
        let mut inst = Instance::new("db", "postgres");
        inst.set_failed("exit status: 1".into());

        let encoded = rmp_serde::to_vec(&Response::Instance(inst)).unwrap();
        match rmp_serde::from_slice(&encoded).unwrap() {
            Response::Instance(decoded) => {
                assert_eq!(decoded.status, InstanceStatus::Error);
                assert_eq!(decoded.last_error.as_deref(), Some("exit status: 1"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }
}
