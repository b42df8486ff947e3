//! Generic resource allocator
//!
//! A resource is a `type:value` pair. Every type carries a shell predicate
//! that answers "is this value free?"; counter types also carry a range and
//! a persisted cursor so auto-allocation keeps moving forward across runs.
//!
//! ```text
//! allocate(tcpport, None)
//!   cursor 3004 ─► 3004 claimed? ─► check `nc -z localhost 3004` ─► exit 0 ─► "3004", cursor 3005
//!                      │ yes              │ nonzero / timeout
//!                      └──────────────────┴─► try 3005 ... up to end ─► RangeExhausted
//! ```

pub mod check;

pub use check::ShellCheck;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const PORT_CHECK: &str = "nc -z localhost ${value} && exit 1 || exit 0";

/// A category of allocatable resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceType {
    pub name: String,
    /// Shell predicate with a `${value}` placeholder; empty means always free
    #[serde(default)]
    pub check: String,
    #[serde(default)]
    pub counter: bool,
    #[serde(default)]
    pub start: u32,
    #[serde(default)]
    pub end: u32,
}

impl ResourceType {
    pub fn counter(name: &str, check: &str, start: u32, end: u32) -> Self {
        Self {
            name: name.to_string(),
            check: check.to_string(),
            counter: true,
            start,
            end,
        }
    }

    pub fn value(name: &str, check: &str) -> Self {
        Self {
            name: name.to_string(),
            check: check.to_string(),
            counter: false,
            start: 0,
            end: 0,
        }
    }

    pub fn validate(&self) -> Result<(), AllocError> {
        if self.name.is_empty() || self.name.contains(':') || self.name.contains(char::is_whitespace) {
            return Err(AllocError::InvalidType(format!(
                "bad resource type name {:?}",
                self.name
            )));
        }
        if self.counter && self.start > self.end {
            return Err(AllocError::InvalidType(format!(
                "{}: range start {} is past end {}",
                self.name, self.start, self.end
            )));
        }
        Ok(())
    }
}

/// One live allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    pub owner: String,
}

impl Resource {
    pub fn key(&self) -> String {
        resource_key(&self.kind, &self.value)
    }
}

fn resource_key(kind: &str, value: &str) -> String {
    format!("{}:{}", kind, value)
}

/// Types seeded into a fresh state
pub fn default_types() -> BTreeMap<String, ResourceType> {
    [
        ResourceType::counter("tcpport", PORT_CHECK, 3000, 9999),
        ResourceType::counter("vncport", PORT_CHECK, 5900, 5999),
        ResourceType::counter("serialport", PORT_CHECK, 9600, 9699),
        ResourceType::value("dbfile", "test -f ${value} && exit 1 || exit 0"),
        ResourceType::value("socket", "test -S ${value} && exit 1 || exit 0"),
        ResourceType::value("datadir", ""),
        ResourceType::value("workdir", ""),
    ]
    .into_iter()
    .map(|t| (t.name.clone(), t))
    .collect()
}

/// Resource types, live allocations and counter cursors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceTable {
    #[serde(default)]
    pub types: BTreeMap<String, ResourceType>,
    /// Live allocations keyed `type:value`
    #[serde(default)]
    pub resources: BTreeMap<String, Resource>,
    /// Next value to probe per counter type
    #[serde(default)]
    pub counters: BTreeMap<String, u32>,
}

impl ResourceTable {
    pub fn with_defaults() -> Self {
        Self {
            types: default_types(),
            ..Default::default()
        }
    }

    pub fn resource_type(&self, kind: &str) -> Result<&ResourceType, AllocError> {
        self.types
            .get(kind)
            .ok_or_else(|| AllocError::UnknownType(kind.to_string()))
    }

    /// Add or replace a type. Names are stored lowercased.
    pub fn add_type(&mut self, mut rt: ResourceType) -> Result<&ResourceType, AllocError> {
        rt.name = rt.name.trim().to_lowercase();
        rt.validate()?;

        if let Some(old) = self.types.get(&rt.name) {
            if old.counter && (!rt.counter || old.start != rt.start || old.end != rt.end) {
                // Range changed: the old cursor means nothing any more
                self.counters.remove(&rt.name);
            }
        }

        log::info!("Resource type {} (counter={})", rt.name, rt.counter);
        let name = rt.name.clone();
        self.types.insert(name.clone(), rt);
        self.resource_type(&name)
    }

    /// Delete a type. Refused while anything of that type is allocated.
    pub fn remove_type(&mut self, kind: &str) -> Result<ResourceType, AllocError> {
        let in_use = self.resources.values().filter(|r| r.kind == kind).count();
        if in_use > 0 {
            return Err(AllocError::TypeInUse(kind.to_string(), in_use));
        }

        let rt = self
            .types
            .remove(kind)
            .ok_or_else(|| AllocError::UnknownType(kind.to_string()))?;
        self.counters.remove(kind);
        Ok(rt)
    }

    pub fn is_claimed(&self, kind: &str, value: &str) -> bool {
        self.resources.contains_key(&resource_key(kind, value))
    }

    pub fn owner_of(&self, kind: &str, value: &str) -> Option<&str> {
        self.resources
            .get(&resource_key(kind, value))
            .map(|r| r.owner.as_str())
    }

    /// Is `value` free? Claimed pairs are never free; otherwise the type's
    /// predicate decides.
    pub async fn check(
        &self,
        checker: &ShellCheck,
        kind: &str,
        value: &str,
    ) -> Result<bool, AllocError> {
        self.check_for(checker, kind, value, None).await
    }

    /// Like [`check`](Self::check), but a pair already claimed by `owner`
    /// still goes to the predicate.
    pub async fn check_for(
        &self,
        checker: &ShellCheck,
        kind: &str,
        value: &str,
        owner: Option<&str>,
    ) -> Result<bool, AllocError> {
        let rt = self.resource_type(kind)?;
        match self.owner_of(kind, value) {
            Some(holder) if Some(holder) != owner => {
                log::debug!("{}:{} already allocated to {}", kind, value, holder);
                return Ok(false);
            }
            _ => {}
        }
        if rt.check.is_empty() {
            return Ok(true);
        }
        Ok(checker.check(&rt.check, value).await)
    }

    /// Pick a value of `kind`, validating an explicit request or probing the
    /// counter range. Does not claim.
    pub async fn allocate(
        &mut self,
        checker: &ShellCheck,
        kind: &str,
        requested: Option<&str>,
    ) -> Result<String, AllocError> {
        let rt = self.resource_type(kind)?.clone();
        let requested = requested.filter(|v| !v.is_empty());

        if let Some(value) = requested {
            return if self.check(checker, kind, value).await? {
                Ok(value.to_string())
            } else {
                Err(AllocError::Unavailable(kind.to_string(), value.to_string()))
            };
        }

        if !rt.counter {
            return Err(AllocError::ValueRequired(kind.to_string()));
        }

        let cursor = self
            .counters
            .get(kind)
            .copied()
            .filter(|c| *c >= rt.start)
            .unwrap_or(rt.start);

        for v in cursor..=rt.end {
            let value = v.to_string();
            if self.check(checker, kind, &value).await? {
                self.counters.insert(kind.to_string(), v.saturating_add(1));
                log::debug!("Allocated {}:{}", kind, value);
                return Ok(value);
            }
        }

        Err(AllocError::RangeExhausted {
            kind: kind.to_string(),
            start: rt.start,
            end: rt.end,
        })
    }

    /// Record an allocation. Re-claiming one's own pair is a no-op.
    pub fn claim(&mut self, kind: &str, value: &str, owner: &str) -> Result<(), AllocError> {
        if !self.types.contains_key(kind) {
            return Err(AllocError::UnknownType(kind.to_string()));
        }

        let key = resource_key(kind, value);
        if let Some(existing) = self.resources.get(&key) {
            if existing.owner == owner {
                return Ok(());
            }
            return Err(AllocError::Conflict {
                key,
                owner: existing.owner.clone(),
            });
        }

        self.resources.insert(
            key,
            Resource {
                kind: kind.to_string(),
                value: value.to_string(),
                owner: owner.to_string(),
            },
        );
        Ok(())
    }

    /// Drop every allocation held by `owner`, returning what was freed
    pub fn release(&mut self, owner: &str) -> Vec<Resource> {
        let keys: Vec<String> = self
            .resources
            .iter()
            .filter(|(_, r)| r.owner == owner)
            .map(|(k, _)| k.clone())
            .collect();

        let freed: Vec<Resource> = keys
            .iter()
            .filter_map(|k| self.resources.remove(k))
            .collect();

        if !freed.is_empty() {
            log::debug!("Released {} resource(s) of {}", freed.len(), owner);
        }
        freed
    }

    pub fn owned_by<'a>(&'a self, owner: &'a str) -> impl Iterator<Item = &'a Resource> + 'a {
        self.resources.values().filter(move |r| r.owner == owner)
    }

    pub fn allocations(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("Unknown resource type: {0}")]
    UnknownType(String),

    #[error("{0} {1} not available")]
    Unavailable(String, String),

    #[error("No available {kind} in range {start}-{end}")]
    RangeExhausted { kind: String, start: u32, end: u32 },

    #[error("Resource type {0} requires an explicit value")]
    ValueRequired(String),

    #[error("{key} is already allocated to {owner}")]
    Conflict { key: String, owner: String },

    #[error("Invalid resource type: {0}")]
    InvalidType(String),

    #[error("Resource type {0} has {1} live allocation(s)")]
    TypeInUse(String, usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn checker() -> ShellCheck {
        ShellCheck::new(Duration::from_secs(5))
    }

    fn table_with(rt: ResourceType) -> ResourceTable {
        let mut table = ResourceTable::default();
        table.add_type(rt).unwrap();
        table
    }

    #[test]
    fn test_default_types() {
        let types = default_types();
        assert_eq!(types.len(), 7);
        let tcp = &types["tcpport"];
        assert!(tcp.counter);
        assert_eq!((tcp.start, tcp.end), (3000, 9999));
        assert!(!types["dbfile"].counter);
        assert!(types["workdir"].check.is_empty());
    }

    #[test]
    fn test_add_type_lowercases() {
        let mut table = ResourceTable::default();
        let rt = table.add_type(ResourceType::value("GPU", "true")).unwrap();
        assert_eq!(rt.name, "gpu");
        assert!(table.resource_type("gpu").is_ok());
        assert!(matches!(
            table.resource_type("GPU"),
            Err(AllocError::UnknownType(_))
        ));
    }

    #[test]
    fn test_add_type_rejects_inverted_range() {
        let mut table = ResourceTable::default();
        let err = table
            .add_type(ResourceType::counter("port", "", 10, 5))
            .unwrap_err();
        assert!(matches!(err, AllocError::InvalidType(_)));
        assert!(table
            .add_type(ResourceType::value("a:b", ""))
            .is_err());
    }

    #[tokio::test]
    async fn test_counter_progress_then_exhausted() {
        let mut table = table_with(ResourceType::counter("port", "exit 0", 3000, 3002));
        let c = checker();

        assert_eq!(table.allocate(&c, "port", None).await.unwrap(), "3000");
        assert_eq!(table.allocate(&c, "port", None).await.unwrap(), "3001");
        assert_eq!(table.allocate(&c, "port", None).await.unwrap(), "3002");
        assert!(matches!(
            table.allocate(&c, "port", None).await,
            Err(AllocError::RangeExhausted { start: 3000, end: 3002, .. })
        ));
        assert_eq!(table.counters["port"], 3003);
    }

    #[tokio::test]
    async fn test_counter_skips_failing_values() {
        let mut table = table_with(ResourceType::counter(
            "slot",
            "test ${value} -ne 11",
            10,
            20,
        ));
        let c = checker();

        assert_eq!(table.allocate(&c, "slot", None).await.unwrap(), "10");
        assert_eq!(table.allocate(&c, "slot", None).await.unwrap(), "12");
    }

    #[tokio::test]
    async fn test_counter_skips_claimed_values() {
        let mut table = table_with(ResourceType::counter("port", "", 4000, 4010));
        table.claim("port", "4000", "web").unwrap();
        table.claim("port", "4001", "api").unwrap();

        let value = table.allocate(&checker(), "port", None).await.unwrap();
        assert_eq!(value, "4002");
    }

    #[tokio::test]
    async fn test_counter_cursor_below_start_resets() {
        let mut table = table_with(ResourceType::counter("port", "", 4000, 4010));
        table.counters.insert("port".to_string(), 12);
        assert_eq!(table.allocate(&checker(), "port", None).await.unwrap(), "4000");
    }

    #[tokio::test]
    async fn test_explicit_value() {
        let mut table = table_with(ResourceType::counter("port", "test ${value} != 9", 1, 100));
        let c = checker();

        assert_eq!(table.allocate(&c, "port", Some("42")).await.unwrap(), "42");
        // Explicit allocation leaves the cursor alone
        assert!(!table.counters.contains_key("port"));

        let err = table.allocate(&c, "port", Some("9")).await.unwrap_err();
        assert!(matches!(err, AllocError::Unavailable(ref k, ref v) if k == "port" && v == "9"));
    }

    #[tokio::test]
    async fn test_explicit_value_already_claimed() {
        let mut table = table_with(ResourceType::value("dir", ""));
        table.claim("dir", "/srv/a", "one").unwrap();

        let err = table
            .allocate(&checker(), "dir", Some("/srv/a"))
            .await
            .unwrap_err();
        assert!(matches!(err, AllocError::Unavailable(..)));
    }

    #[tokio::test]
    async fn test_value_required() {
        let mut table = table_with(ResourceType::value("dbfile", "exit 0"));
        assert!(matches!(
            table.allocate(&checker(), "dbfile", None).await,
            Err(AllocError::ValueRequired(_))
        ));
        assert!(matches!(
            table.allocate(&checker(), "dbfile", Some("")).await,
            Err(AllocError::ValueRequired(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let mut table = ResourceTable::default();
        assert!(matches!(
            table.allocate(&checker(), "nope", Some("1")).await,
            Err(AllocError::UnknownType(_))
        ));
    }

    #[tokio::test]
    async fn test_check_timeout_counts_as_taken() {
        let mut table = table_with(ResourceType::value("slow", "sleep 5"));
        let c = ShellCheck::new(Duration::from_millis(100));
        assert!(matches!(
            table.allocate(&c, "slow", Some("x")).await,
            Err(AllocError::Unavailable(..))
        ));
    }

    #[tokio::test]
    async fn test_empty_check_always_free() {
        let table = table_with(ResourceType::value("workdir", ""));
        assert!(table.check(&checker(), "workdir", "/anything").await.unwrap());
    }

    #[tokio::test]
    async fn test_check_for_own_claim() {
        let mut table = table_with(ResourceType::value("dir", ""));
        table.claim("dir", "/srv", "a").unwrap();
        let c = checker();

        assert!(table.check_for(&c, "dir", "/srv", Some("a")).await.unwrap());
        assert!(!table.check_for(&c, "dir", "/srv", Some("b")).await.unwrap());
        assert!(!table.check(&c, "dir", "/srv").await.unwrap());
    }

    #[test]
    fn test_claim_conflict() {
        let mut table = table_with(ResourceType::value("dir", ""));
        table.claim("dir", "/srv", "a").unwrap();
        table.claim("dir", "/srv", "a").unwrap();

        let err = table.claim("dir", "/srv", "b").unwrap_err();
        assert!(matches!(err, AllocError::Conflict { ref owner, .. } if owner == "a"));
        assert_eq!(table.allocations().count(), 1);
        assert_eq!(table.owner_of("dir", "/srv"), Some("a"));
    }

    #[test]
    fn test_release_idempotent() {
        let mut table = table_with(ResourceType::value("dir", ""));
        table.claim("dir", "/a", "one").unwrap();
        table.claim("dir", "/b", "one").unwrap();
        table.claim("dir", "/c", "two").unwrap();

        assert_eq!(table.release("one").len(), 2);
        assert!(table.release("one").is_empty());
        assert!(table.release("nobody").is_empty());
        assert_eq!(table.owned_by("two").count(), 1);
        assert!(!table.is_claimed("dir", "/a"));
    }

    #[test]
    fn test_remove_type_in_use() {
        let mut table = table_with(ResourceType::counter("port", "", 1, 10));
        table.counters.insert("port".to_string(), 5);
        table.claim("port", "3", "web").unwrap();

        assert!(matches!(
            table.remove_type("port"),
            Err(AllocError::TypeInUse(_, 1))
        ));

        table.release("web");
        table.remove_type("port").unwrap();
        assert!(table.types.is_empty());
        assert!(table.counters.is_empty());
        assert!(matches!(
            table.remove_type("port"),
            Err(AllocError::UnknownType(_))
        ));
    }

    #[test]
    fn test_resource_serializes_type_field() {
        let r = Resource {
            kind: "tcpport".to_string(),
            value: "3000".to_string(),
            owner: "web".to_string(),
        };
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["type"], "tcpport");
        assert_eq!(r.key(), "tcpport:3000");
    }
}
