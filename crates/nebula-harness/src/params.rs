//! Node flag derivation.
//!
//! Every role starts from the same base flags, then gets its role-specific
//! overrides, then the caller's overrides. That order is fixed.

use std::collections::BTreeMap;
use std::fmt;

use crate::Role;

/// Resource directory inside the working layout, relative to its root.
pub const RESOURCES_DIR: &str = "share/resources";

/// An ordered map of flag name to flag value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl fmt::Display) -> &mut Self {
        self.0.insert(key.into(), value.to_string());
        self
    }

    /// Builder form of [`Params::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Applies every entry of `other` on top of `self`.
    pub fn overlay(&mut self, other: &Params) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: fmt::Display> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Params::new();
        for (key, value) in iter {
            params.set(key, value);
        }
        params
    }
}

/// Switches that shape the base flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamOptions {
    /// Use the CA-signed certificate pair instead of the self-signed one.
    pub ca_signed: bool,

    /// Pass `--v=4` to every node.
    pub verbose: bool,
}

impl Default for ParamOptions {
    fn default() -> Self {
        Self {
            ca_signed: false,
            verbose: true,
        }
    }
}

fn resource(name: &str) -> String {
    format!("{RESOURCES_DIR}/{name}")
}

/// Flags shared by every role.
pub fn base_params(options: ParamOptions) -> Params {
    let mut params = Params::new();
    params
        .set("heartbeat_interval_secs", 1)
        .set("expired_time_factor", 60)
        .set("ca_path", resource("test.ca.pem"));

    if options.ca_signed {
        params
            .set("cert_path", resource("test.derive.crt"))
            .set("key_path", resource("test.derive.key"));
    } else {
        params
            .set("cert_path", resource("test.ca.key"))
            .set("key_path", resource("test.ca.password"));
    }

    if options.verbose {
        params.set("v", 4);
    }

    params
}

/// Flags specific to `role`, applied over the base set.
pub fn role_overrides(role: Role) -> Params {
    match role {
        Role::Graphd => Params::new()
            .with("local_config", false)
            .with("enable_authorize", true)
            .with("system_memory_high_watermark_ratio", "0.95")
            .with("num_rows_to_check_memory", 4)
            .with("session_reclaim_interval_secs", 2),
        Role::Storaged => Params::new()
            .with("local_config", false)
            .with("raft_heartbeat_interval_secs", 30)
            .with("skip_wait_in_rate_limiter", true),
        Role::Metad => Params::new(),
    }
}

/// Full flag set for `role`: base, then role overrides, then `caller`.
pub fn role_params(role: Role, options: ParamOptions, caller: &Params) -> Params {
    let mut params = base_params(options);
    params.overlay(&role_overrides(role));
    params.overlay(caller);
    params
}
