pub mod auth;

use crate::proxy::context::{BoxBody, RequestContext};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Result of a plugin's request phase.
pub enum PluginResult {
    /// Continue to the next plugin / phase.
    Continue,
    /// Short-circuit: return this response immediately.
    Respond(hyper::Response<BoxBody>),
}

/// Enum-based plugin instance — static dispatch, exhaustive match.
///
/// A plugin instance is a factory composed with its params: a callable
/// with the same contract as any request middleware. Adding a plugin:
/// 1. Add a module under `plugin/`
/// 2. Add a variant here and the match arm in `on_request`
/// 3. Register its factory in `PluginRegistry::builtin`
pub enum PluginInstance {
    Auth(auth::AuthPlugin),
}

impl PluginInstance {
    pub async fn on_request(
        &self,
        ctx: &RequestContext,
        method: &http::Method,
        uri: &http::Uri,
        headers: &mut http::HeaderMap,
    ) -> PluginResult {
        match self {
            PluginInstance::Auth(p) => p.on_request(ctx, method, uri, headers).await,
        }
    }
}

#[derive(Debug)]
pub enum PluginError {
    InvalidName(String),
    UnknownPlugin(String),
    InvalidConfig { plugin: String, reason: String },
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginError::InvalidName(name) => write!(f, "invalid plugin name {:?}", name),
            PluginError::UnknownPlugin(name) => write!(f, "unknown plugin {:?}", name),
            PluginError::InvalidConfig { plugin, reason } => {
                write!(f, "invalid config for plugin {:?}: {}", plugin, reason)
            }
        }
    }
}

impl std::error::Error for PluginError {}

/// Reject empty names and anything that could escape the plugin
/// namespace. Runs before any registry lookup.
pub fn validate_plugin_name(name: &str) -> Result<(), PluginError> {
    if name.is_empty() {
        return Err(PluginError::InvalidName(name.to_string()));
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(PluginError::InvalidName(name.to_string()));
    }
    Ok(())
}

type PluginFactory = fn(&serde_json::Value) -> Result<PluginInstance, PluginError>;

/// Typed plugin registry with a fixed factory table for shipped
/// plugins and an instance cache keyed by name + canonical params.
///
/// The Router Supervisor calls `reset()` before every rebuild so stale
/// instances never outlive the table that created them.
pub struct PluginRegistry {
    factories: HashMap<&'static str, PluginFactory>,
    cache: RwLock<HashMap<String, Arc<PluginInstance>>>,
}

impl PluginRegistry {
    /// Registry with every plugin shipped in the core.
    pub fn builtin() -> Self {
        let mut factories: HashMap<&'static str, PluginFactory> = HashMap::new();
        factories.insert("central-auth", auth::factory);
        Self {
            factories,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a plugin instance, reusing a cached one when the same
    /// name + params pair was already materialized.
    pub fn load(
        &self,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<Arc<PluginInstance>, PluginError> {
        validate_plugin_name(name)?;

        // serde_json renders object keys sorted, so this is canonical.
        let cache_key = format!("{}:{}", name, params);

        if let Some(instance) = self.cache.read().unwrap().get(&cache_key) {
            return Ok(instance.clone());
        }

        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| PluginError::UnknownPlugin(name.to_string()))?;

        let instance = Arc::new(factory(params)?);
        self.cache
            .write()
            .unwrap()
            .insert(cache_key, instance.clone());
        debug!("plugin: loaded, name={}", name);
        Ok(instance)
    }

    /// Invalidate every cached instance.
    pub fn reset(&self) {
        self.cache.write().unwrap().clear();
    }

    #[cfg(test)]
    pub fn cached_len(&self) -> usize {
        self.cache.read().unwrap().len()
    }
}
