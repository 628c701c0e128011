// src/core/plugin.rs

//! Plugin Registry: named, dynamically-dispatched side-effect handlers.
//!
//! Every externally observable side effect (probing a server, controlling a
//! service, promoting a replica, rewriting proxy connections, authenticating
//! an operator, archiving, alerting) goes through a `Plugin` looked up by
//! name. A missing or broken plugin resolves to `FailingPlugin`, so callers
//! never need to distinguish "plugin not found" from "plugin ran and failed".

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// The duck-typed `{ok, details, extra}` envelope every plugin call returns.
#[derive(Debug, Clone, Default)]
pub struct PluginResult {
    pub ok: bool,
    pub details: String,
    pub extra: HashMap<String, Value>,
}

impl PluginResult {
    pub fn ok(details: impl Into<String>) -> Self {
        Self {
            ok: true,
            details: details.into(),
            extra: HashMap::new(),
        }
    }

    pub fn fail(details: impl Into<String>) -> Self {
        Self {
            ok: false,
            details: details.into(),
            extra: HashMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Contract every plugin satisfies. All methods have a default "unsupported"
/// implementation so a concrete plugin need only implement the capability it
/// actually provides, instead of stubbing out every hook.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, args: &[String]) -> PluginResult {
        let _ = args;
        PluginResult::fail(format!("plugin '{}' does not implement run()", self.name()))
    }

    async fn init(&self) -> PluginResult {
        PluginResult::ok("no-op init")
    }

    async fn poll(&self, target: Option<&str>) -> PluginResult {
        let _ = target;
        PluginResult::fail(format!("plugin '{}' does not implement poll()", self.name()))
    }

    async fn start(&self, target: &str) -> PluginResult {
        let _ = target;
        PluginResult::fail(format!("plugin '{}' does not implement start()", self.name()))
    }

    async fn stop(&self, target: &str) -> PluginResult {
        let _ = target;
        PluginResult::fail(format!("plugin '{}' does not implement stop()", self.name()))
    }

    async fn recovery_line(&self, primary_host: &str, primary_port: u16) -> PluginResult {
        let _ = (primary_host, primary_port);
        PluginResult::fail(format!(
            "plugin '{}' does not implement recovery_line()",
            self.name()
        ))
    }

    async fn test(&self) -> PluginResult {
        PluginResult::ok("no-op test")
    }
}

/// The default variant for an unresolvable plugin name. Every method fails;
/// the caller treats this identically to a plugin that loaded but erred at
/// runtime.
pub struct FailingPlugin {
    requested_name: String,
}

impl FailingPlugin {
    pub fn new(requested_name: impl Into<String>) -> Self {
        Self {
            requested_name: requested_name.into(),
        }
    }
}

#[async_trait]
impl Plugin for FailingPlugin {
    fn name(&self) -> &str {
        &self.requested_name
    }

    async fn run(&self, _args: &[String]) -> PluginResult {
        PluginResult::fail(format!("no such plugin: '{}'", self.requested_name))
    }

    async fn poll(&self, _target: Option<&str>) -> PluginResult {
        PluginResult::fail(format!("no such plugin: '{}'", self.requested_name))
    }

    async fn start(&self, _target: &str) -> PluginResult {
        PluginResult::fail(format!("no such plugin: '{}'", self.requested_name))
    }

    async fn stop(&self, _target: &str) -> PluginResult {
        PluginResult::fail(format!("no such plugin: '{}'", self.requested_name))
    }

    async fn test(&self) -> PluginResult {
        PluginResult::fail(format!("no such plugin: '{}'", self.requested_name))
    }
}

/// Holds every registered plugin, keyed by its configured string name.
/// Plugins are constructed once at startup and shared by `Arc`.
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(name.into(), plugin);
    }

    /// Looks up a plugin by name. Never fails: an unknown name yields a
    /// fresh `FailingPlugin` stub rather than an `Option`/`Result`, so a
    /// misconfigured method name surfaces as a failed call, not a panic.
    pub fn get(&self, name: &str) -> Arc<dyn Plugin> {
        match self.plugins.get(name) {
            Some(p) => p.clone(),
            None => Arc::new(FailingPlugin::new(name)),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_plugin_fails_every_call() {
        let registry = PluginRegistry::new();
        let plugin = registry.get("does-not-exist");
        assert!(!plugin.run(&[]).await.ok);
        assert!(!plugin.poll(None).await.ok);
        assert!(!plugin.test().await.ok);
    }

    struct EchoPlugin;

    #[async_trait]
    impl Plugin for EchoPlugin {
        fn name(&self) -> &str {
            "echo"
        }

        async fn poll(&self, _target: Option<&str>) -> PluginResult {
            PluginResult::ok("pong")
        }
    }

    #[tokio::test]
    async fn registered_plugin_is_returned() {
        let mut registry = PluginRegistry::new();
        registry.register("echo", Arc::new(EchoPlugin));
        let plugin = registry.get("echo");
        assert!(plugin.poll(None).await.ok);
    }
}
