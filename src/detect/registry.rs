use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::camera::CameraSpec;
use crate::detect::backends::{CommandBackend, SimulatedWalkerBackend};
use crate::detect::DetectorSettings;

use super::backend::DetectorBackend;

/// Builds a fresh backend instance for one camera pipeline run.
pub type BackendFactory =
    Arc<dyn Fn(&DetectorSettings, &CameraSpec) -> Result<Box<dyn DetectorBackend>> + Send + Sync>;

/// Thread-safe registry of named detector factories.
///
/// Backends hold per-camera state (child processes, walker phase), so the
/// registry hands out factories rather than shared instances.
#[derive(Clone)]
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            default_name: None,
        }
    }

    /// Registry with the `stub` and `command` backends, defaulting to `stub`.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            SimulatedWalkerBackend::NAME,
            Arc::new(|_settings: &DetectorSettings, _spec: &CameraSpec| {
                Ok(Box::new(SimulatedWalkerBackend::new()) as Box<dyn DetectorBackend>)
            }),
        );
        registry.register(
            CommandBackend::NAME,
            Arc::new(|settings: &DetectorSettings, spec: &CameraSpec| {
                let backend = CommandBackend::from_settings(settings, &spec.camera_id)?;
                Ok(Box::new(backend) as Box<dyn DetectorBackend>)
            }),
        );
        registry
    }

    /// Register a factory. The first registered factory becomes the default.
    pub fn register(&mut self, name: &str, factory: BackendFactory) {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        self.factories.insert(name.to_string(), factory);
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.factories.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    /// List registered backends, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build the backend named in `settings`, or the default when it names none.
    pub fn create(
        &self,
        settings: &DetectorSettings,
        spec: &CameraSpec,
    ) -> Result<Box<dyn DetectorBackend>> {
        let name = if settings.backend.is_empty() {
            self.default_name
                .as_deref()
                .ok_or_else(|| anyhow!("no detector backend registered"))?
        } else {
            settings.backend.as_str()
        };
        let factory = self.factories.get(name).ok_or_else(|| {
            anyhow!(
                "detector backend '{}' not registered (available: {})",
                name,
                self.list().join(", ")
            )
        })?;
        let mut backend = factory(settings, spec)?;
        backend.warm_up()?;
        Ok(backend)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
