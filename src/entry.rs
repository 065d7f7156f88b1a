//! Backend entries and their change detection

use crate::descriptor;
use crate::error::DescriptorError;
use crate::resolver::Resolver;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::info;

/// Address rendered for an entry that has not resolved yet
const FALLBACK_IP: &str = "127.0.0.1";

/// Descriptor parameters, keyed by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Raw value; empty values count as absent
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn get_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.get(name).unwrap_or(default)
    }

    /// Integer value, or `default` when absent or unparsable
    pub fn get_int(&self, name: &str, default: i64) -> i64 {
        self.get(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Boolean value (`on/1/yes/true`, `off/0/no/false`), or `default` otherwise
    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.get(name) {
            Some("on" | "1" | "yes" | "true") => true,
            Some("off" | "0" | "no" | "false") => false,
            _ => default,
        }
    }

    /// `on`/`off` passthrough for directives that take those literally
    pub fn get_onoff<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        match self.get(name) {
            Some(v @ ("on" | "off")) => v,
            _ => default,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Params {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// In-memory state of one backend descriptor
#[derive(Debug)]
pub struct BackendEntry {
    name: String,
    template: String,
    hostname: String,
    params: Params,
    /// Last resolved (or statically configured) address
    address: Option<IpAddr>,
    /// `backend.ip` was given; DNS is never consulted
    static_address: bool,
    active: bool,
    dirty: bool,
    /// Watched paths and their last observed mtime (`None` when absent)
    watched: BTreeMap<PathBuf, Option<SystemTime>>,
}

impl BackendEntry {
    /// Build an entry from already parsed parameters.
    ///
    /// `template` and `backend.host` are required. A `backend.ip` pins the
    /// address and disables DNS monitoring for the lifetime of the entry.
    pub fn new(name: impl Into<String>, params: Params) -> Result<Self, DescriptorError> {
        let name = name.into();
        let path = PathBuf::from(&name);
        Self::build(name, params, &path)
    }

    /// Load an entry from a descriptor file
    pub fn from_file(path: &Path) -> Result<Self, DescriptorError> {
        let params = descriptor::read(path)?;
        Self::build(descriptor::entry_name(path), params, path)
    }

    fn build(name: String, params: Params, origin: &Path) -> Result<Self, DescriptorError> {
        let template = params
            .get("template")
            .ok_or_else(|| DescriptorError::MissingField {
                path: origin.to_path_buf(),
                field: "template",
            })?
            .to_string();
        let hostname = params
            .get("backend.host")
            .ok_or_else(|| DescriptorError::MissingField {
                path: origin.to_path_buf(),
                field: "backend.host",
            })?
            .to_string();

        let address = match params.get("backend.ip") {
            Some(ip) => Some(ip.parse::<IpAddr>().map_err(|_| {
                DescriptorError::InvalidAddress {
                    path: origin.to_path_buf(),
                    value: ip.to_string(),
                }
            })?),
            None => None,
        };
        let static_address = address.is_some();

        Ok(Self {
            name,
            template,
            hostname,
            params,
            address,
            static_address,
            active: static_address,
            dirty: true,
            watched: BTreeMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn address(&self) -> Option<IpAddr> {
        self.address
    }

    pub fn is_static(&self) -> bool {
        self.static_address
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clear the dirty flag, returning whether it was set
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    /// Returns true if the value changed
    pub fn set_active(&mut self, active: bool) -> bool {
        if self.active == active {
            return false;
        }
        info!(name = %self.name, active, "Changed by: active");
        self.active = active;
        self.dirty = true;
        true
    }

    /// Returns true if the value changed
    pub fn set_address(&mut self, address: Option<IpAddr>) -> bool {
        if self.address == address {
            return false;
        }
        info!(name = %self.name, address = ?address, "Changed by: address");
        self.address = address;
        self.dirty = true;
        true
    }

    /// Returns true if the parameters differ from the current set
    pub fn set_params(&mut self, params: Params) -> bool {
        if self.params == params {
            return false;
        }
        info!(name = %self.name, "Changed by: parameters");
        self.params = params;
        self.dirty = true;
        true
    }

    /// Start tracking `path`, recording its current mtime
    pub fn watch_file(&mut self, path: impl Into<PathBuf>) -> PathBuf {
        let path = path.into();
        let mtime = file_mtime(&path);
        self.watched.insert(path.clone(), mtime);
        path
    }

    pub fn watched_files(&self) -> impl Iterator<Item = &Path> {
        self.watched.keys().map(PathBuf::as_path)
    }

    /// Compare watched files against their recorded mtimes.
    ///
    /// Returns true and marks the entry dirty if any file changed.
    pub fn check_watched_files(&mut self) -> bool {
        let mut changed = false;
        for (path, recorded) in self.watched.iter_mut() {
            let current = file_mtime(path);
            if current != *recorded {
                info!(name = %self.name, path = %path.display(), "Changed by watch file");
                *recorded = current;
                changed = true;
            }
        }
        if changed {
            self.dirty = true;
        }
        changed
    }

    /// Run one detection pass: watched files first, then DNS.
    ///
    /// Returns true if this pass marked the entry dirty.
    pub async fn detect_change<R: Resolver>(&mut self, resolver: &R) -> bool {
        let files_changed = self.check_watched_files();

        if self.static_address {
            return files_changed;
        }

        let address = resolver.resolve(&self.hostname).await;
        let active_changed = self.set_active(address.is_some());
        let address_changed = self.set_address(address);

        files_changed || active_changed || address_changed
    }

    /// Snapshot handed to templates as `config`
    pub fn view(&self) -> EntryView<'_> {
        let params = &self.params;
        EntryView {
            name: &self.name,
            hostname: &self.hostname,
            template: &self.template,
            active: self.active,
            address: self.address.map(|a| a.to_string()),
            first_ip: self
                .address
                .map(|a| a.to_string())
                .unwrap_or_else(|| FALLBACK_IP.to_string()),
            backend_port: params.get_or("backend.port", "8000"),
            backend_schema: params.get_or("backend.schema", "http"),
            backend_static_ip: params.get("backend.ip"),
            http_host: params.get_or("http.host", "unknown.host.tld"),
            http_port: params.get_int("http.port", 80),
        }
    }
}

/// Template-facing view of an entry
#[derive(Debug, Serialize)]
pub struct EntryView<'a> {
    pub name: &'a str,
    pub hostname: &'a str,
    pub template: &'a str,
    pub active: bool,
    pub address: Option<String>,
    pub first_ip: String,
    pub backend_port: &'a str,
    pub backend_schema: &'a str,
    pub backend_static_ip: Option<&'a str>,
    pub http_host: &'a str,
    pub http_port: i64,
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path)
        .ok()
        .filter(|m| m.is_file())
        .and_then(|m| m.modified().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::future::Future;

    #[derive(Default)]
    struct ScriptedResolver {
        answers: Mutex<HashMap<String, Option<IpAddr>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedResolver {
        fn answer(&self, host: &str, ip: Option<&str>) {
            self.answers
                .lock()
                .insert(host.to_string(), ip.map(|s| s.parse().unwrap()));
        }

        fn calls(&self) -> usize {
            *self.calls.lock()
        }
    }

    impl Resolver for ScriptedResolver {
        fn resolve(&self, hostname: &str) -> impl Future<Output = Option<IpAddr>> + Send {
            *self.calls.lock() += 1;
            let answer = self.answers.lock().get(hostname).copied().flatten();
            async move { answer }
        }
    }

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn dns_entry() -> BackendEntry {
        BackendEntry::new(
            "svc-a",
            params(&[("template", "basic"), ("backend.host", "svc-a.internal")]),
        )
        .unwrap()
    }

    #[test]
    fn test_new_entry_is_dirty_and_inactive() {
        let entry = dns_entry();
        assert!(entry.is_dirty());
        assert!(!entry.is_active());
        assert!(!entry.is_static());
        assert_eq!(entry.address(), None);
        assert_eq!(entry.template(), "basic");
        assert_eq!(entry.hostname(), "svc-a.internal");
    }

    #[test]
    fn test_missing_required_fields() {
        let err = BackendEntry::new("x", params(&[("backend.host", "x.internal")])).unwrap_err();
        assert!(matches!(err, DescriptorError::MissingField { field: "template", .. }));

        let err = BackendEntry::new(
            "x",
            params(&[("template", "basic"), ("backend.ip", "10.0.0.5")]),
        )
        .unwrap_err();
        assert!(matches!(err, DescriptorError::MissingField { field: "backend.host", .. }));

        let err =
            BackendEntry::new("x", params(&[("template", ""), ("backend.host", "x")])).unwrap_err();
        assert!(matches!(err, DescriptorError::MissingField { field: "template", .. }));
    }

    #[test]
    fn test_invalid_static_address() {
        let err = BackendEntry::new(
            "x",
            params(&[("template", "basic"), ("backend.host", "x"), ("backend.ip", "not-an-ip")]),
        )
        .unwrap_err();
        assert!(matches!(err, DescriptorError::InvalidAddress { .. }));
    }

    #[tokio::test]
    async fn test_static_entry_never_resolves() {
        let mut entry = BackendEntry::new(
            "static",
            params(&[
                ("template", "basic"),
                ("backend.host", "static.internal"),
                ("backend.ip", "10.0.0.5"),
            ]),
        )
        .unwrap();
        let resolver = ScriptedResolver::default();

        assert!(entry.is_static());
        assert!(entry.is_active());
        assert_eq!(entry.address(), Some("10.0.0.5".parse().unwrap()));

        assert!(entry.take_dirty());
        for _ in 0..3 {
            assert!(!entry.detect_change(&resolver).await);
        }
        assert_eq!(resolver.calls(), 0);
        assert!(entry.is_active());
        assert!(!entry.is_dirty());
    }

    #[tokio::test]
    async fn test_dns_flip_sequence() {
        let mut entry = dns_entry();
        let resolver = ScriptedResolver::default();
        resolver.answer("svc-a.internal", Some("10.0.0.1"));

        assert!(entry.detect_change(&resolver).await);
        assert!(entry.is_active());
        assert_eq!(entry.address(), Some("10.0.0.1".parse().unwrap()));
        assert!(entry.take_dirty());

        // Same answer: nothing to do
        assert!(!entry.detect_change(&resolver).await);
        assert!(!entry.is_dirty());

        resolver.answer("svc-a.internal", None);
        assert!(entry.detect_change(&resolver).await);
        assert!(!entry.is_active());
        assert_eq!(entry.address(), None);
        assert!(entry.take_dirty());

        // Still failing: absence is stable, not a change
        assert!(!entry.detect_change(&resolver).await);
        assert!(!entry.is_dirty());

        resolver.answer("svc-a.internal", Some("10.0.0.2"));
        assert!(entry.detect_change(&resolver).await);
        assert_eq!(entry.address(), Some("10.0.0.2".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_address_change_while_active() {
        let mut entry = dns_entry();
        let resolver = ScriptedResolver::default();
        resolver.answer("svc-a.internal", Some("10.0.0.1"));
        entry.detect_change(&resolver).await;
        entry.take_dirty();

        resolver.answer("svc-a.internal", Some("10.0.0.9"));
        assert!(entry.detect_change(&resolver).await);
        assert!(entry.is_active());
        assert!(entry.is_dirty());
    }

    #[test]
    fn test_setters_report_changes() {
        let mut entry = dns_entry();
        entry.take_dirty();

        assert!(!entry.set_active(false));
        assert!(!entry.is_dirty());
        assert!(entry.set_active(true));
        assert!(entry.is_dirty());

        entry.take_dirty();
        let same = entry.params().clone();
        assert!(!entry.set_params(same));
        assert!(!entry.is_dirty());

        let mut changed = entry.params().clone();
        changed.insert("http.host", "a.example.com");
        assert!(entry.set_params(changed));
        assert!(entry.is_dirty());
        assert_eq!(entry.params().get("http.host"), Some("a.example.com"));
    }

    #[test]
    fn test_watched_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("site.pem");
        let mut entry = dns_entry();
        entry.take_dirty();

        // Absent file is tracked as absent
        entry.watch_file(&cert);
        assert!(!entry.check_watched_files());

        std::fs::write(&cert, "cert").unwrap();
        assert!(entry.check_watched_files());
        assert!(entry.take_dirty());

        // Recorded mtime was refreshed
        assert!(!entry.check_watched_files());

        std::fs::remove_file(&cert).unwrap();
        assert!(entry.check_watched_files());
        assert_eq!(entry.watched_files().count(), 1);
    }

    #[test]
    fn test_param_accessors() {
        let p = params(&[
            ("http.port", "8080"),
            ("bad.port", "eighty"),
            ("ssl", "yes"),
            ("gzip", "off"),
            ("weird", "maybe"),
            ("empty", ""),
        ]);

        assert_eq!(p.get_int("http.port", 80), 8080);
        assert_eq!(p.get_int("bad.port", 80), 80);
        assert_eq!(p.get_int("absent", 7), 7);
        assert!(p.get_bool("ssl", false));
        assert!(!p.get_bool("gzip", true));
        assert!(p.get_bool("weird", true));
        assert_eq!(p.get_onoff("gzip", "on"), "off");
        assert_eq!(p.get_onoff("ssl", "on"), "on");
        assert_eq!(p.get_or("empty", "fallback"), "fallback");
        assert_eq!(p.get("empty"), None);
    }

    #[test]
    fn test_view_defaults() {
        let entry = dns_entry();
        let view = entry.view();
        assert_eq!(view.first_ip, "127.0.0.1");
        assert_eq!(view.address, None);
        assert_eq!(view.backend_port, "8000");
        assert_eq!(view.backend_schema, "http");
        assert_eq!(view.http_host, "unknown.host.tld");
        assert_eq!(view.http_port, 80);
        assert_eq!(view.backend_static_ip, None);
    }
}
