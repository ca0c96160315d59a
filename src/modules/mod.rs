//! Hook modules.
//!
//! A module is a named bundle of hook handlers identified by
//! `group~artifact~version`. Loading a module lets it register handlers
//! through a [`ModuleRegistrar`]; unloading removes all of them together.

mod access_log;

pub use access_log::AccessLogModule;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{error, info};

use crate::hooks::{HookChain, HookHandler, HookPoint};

/// Module errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModuleError {
    #[error("invalid module identifier '{0}', expected group~artifact~version")]
    InvalidId(String),

    #[error("module not found: {0}")]
    NotFound(String),

    #[error("module already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("module not loaded: {0}")]
    NotLoaded(String),

    #[error("module {id} failed to install: {reason}")]
    InstallFailed { id: String, reason: String },
}

/// Module identifier: `group~artifact~version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId {
    pub group: String,
    pub artifact: String,
    pub version: String,
}

impl ModuleId {
    pub fn new(group: &str, artifact: &str, version: &str) -> Self {
        Self {
            group: group.to_string(),
            artifact: artifact.to_string(),
            version: version.to_string(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, ModuleError> {
        let parts: Vec<&str> = s.split('~').collect();
        match parts.as_slice() {
            [group, artifact, version] if parts.iter().all(|p| !p.trim().is_empty()) => {
                Ok(Self::new(group, artifact, version))
            }
            _ => Err(ModuleError::InvalidId(s.to_string())),
        }
    }
}

impl FromStr for ModuleId {
    type Err = ModuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}~{}", self.group, self.artifact, self.version)
    }
}

/// A loadable bundle of hook handlers.
pub trait GatewayModule: Send + Sync + 'static {
    fn id(&self) -> ModuleId;

    /// Register the module's handlers.
    fn install(&self, registrar: &ModuleRegistrar<'_>) -> Result<(), ModuleError>;
}

/// Registers hook handlers on behalf of one module.
pub struct ModuleRegistrar<'a> {
    hooks: &'a HookChain,
    owner: String,
}

impl ModuleRegistrar<'_> {
    /// Identifier handlers are registered under.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn register(&self, hook: HookPoint, handler: impl HookHandler) {
        self.hooks.register(hook, &self.owner, handler);
    }
}

/// Available and loaded modules.
pub struct ModuleRegistry {
    hooks: Arc<HookChain>,
    available: RwLock<HashMap<ModuleId, Arc<dyn GatewayModule>>>,
    loaded: RwLock<BTreeSet<ModuleId>>,
}

impl ModuleRegistry {
    /// Create a registry with the built-in modules available.
    pub fn new(hooks: Arc<HookChain>) -> Self {
        let registry = Self {
            hooks,
            available: RwLock::new(HashMap::new()),
            loaded: RwLock::new(BTreeSet::new()),
        };
        registry.add(AccessLogModule);
        registry
    }

    /// Make a module available for loading.
    pub fn add(&self, module: impl GatewayModule) {
        let id = module.id();
        self.available.write().insert(id, Arc::new(module));
    }

    /// Load a module by identifier.
    pub fn load(&self, id: &str) -> Result<(), ModuleError> {
        let id = ModuleId::parse(id)?;
        let module = self
            .available
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| ModuleError::NotFound(id.to_string()))?;

        if !self.loaded.write().insert(id.clone()) {
            return Err(ModuleError::AlreadyLoaded(id.to_string()));
        }

        let registrar = ModuleRegistrar {
            hooks: &self.hooks,
            owner: id.to_string(),
        };
        if let Err(e) = module.install(&registrar) {
            error!(module = %id, error = %e, "module install failed");
            self.hooks.unregister_owner(&registrar.owner);
            self.loaded.write().remove(&id);
            return Err(ModuleError::InstallFailed {
                id: id.to_string(),
                reason: e.to_string(),
            });
        }

        info!(module = %id, "module loaded");
        Ok(())
    }

    /// Unload a module and remove all of its handlers.
    pub fn unload(&self, id: &str) -> Result<(), ModuleError> {
        let id = ModuleId::parse(id)?;
        if !self.loaded.write().remove(&id) {
            return Err(ModuleError::NotLoaded(id.to_string()));
        }

        let removed = self.hooks.unregister_owner(&id.to_string());
        info!(module = %id, handlers = removed, "module unloaded");
        Ok(())
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        ModuleId::parse(id).is_ok_and(|id| self.loaded.read().contains(&id))
    }

    /// Loaded module identifiers, sorted.
    pub fn loaded(&self) -> Vec<String> {
        self.loaded.read().iter().map(ToString::to_string).collect()
    }

    /// Available module identifiers, sorted.
    pub fn available(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.available.read().keys().map(ToString::to_string).collect();
        ids.sort();
        ids
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("loaded", &self.loaded())
            .finish()
    }
}
