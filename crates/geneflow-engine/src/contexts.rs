//! Execution and data contexts, and the registry of per-backend
//! resources shared by every step in a run.
//!
//! A backend context lives for the whole run: DRM sessions open at
//! registry initialization and close when the registry drops, on every
//! exit path including fatal errors.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use geneflow_core::config::RemoteConfig;
use geneflow_core::ParsedUri;

use crate::data_manager::{AgaveDataHandler, DataManager};
use crate::drm::{DrmSession, GridengineSession, SlurmSession};
use crate::error::{EngineError, Result};
use crate::remote::{AgaveClient, RemoteAuth};

/// Static tables of known contexts.
pub struct Contexts;

impl Contexts {
    pub const EXEC_CONTEXTS: &'static [&'static str] =
        &["local", "slurm", "gridengine", "agave"];

    pub const DATA_CONTEXTS: &'static [&'static str] = &["local", "agave"];

    pub fn is_exec_context(name: &str) -> bool {
        Self::EXEC_CONTEXTS.contains(&name)
    }

    pub fn is_data_context(name: &str) -> bool {
        Self::DATA_CONTEXTS.contains(&name)
    }

    /// The data scheme a step of this execution context reads and
    /// writes at.
    pub fn data_scheme_of(exec_context: &str) -> Option<&'static str> {
        match exec_context {
            "local" | "slurm" | "gridengine" => Some("local"),
            "agave" => Some("agave"),
            _ => None,
        }
    }
}

/// Remote backend resources: the REST client plus the archive location
/// remote jobs write under (set during context-data initialization).
#[derive(Clone)]
pub struct AgaveContext {
    pub client: Arc<AgaveClient>,
    pub archive_uri: Option<ParsedUri>,
}

/// Per-backend long-lived state.
pub enum BackendContext {
    Local,
    Slurm(Arc<dyn DrmSession>),
    Gridengine(Arc<dyn DrmSession>),
    Agave(AgaveContext),
}

/// Registry of initialized backend contexts, keyed by context name.
pub struct ContextRegistry {
    contexts: BTreeMap<String, BackendContext>,
}

impl ContextRegistry {
    /// Initialize a backend context for every name in `contexts`
    /// (the union of a job's execution and data contexts).
    /// Initialization failure aborts the run before any step starts.
    pub fn initialize(
        contexts: &BTreeSet<String>,
        remote_auth: Option<&RemoteAuth>,
        remote_config: &RemoteConfig,
        session_overrides: &BTreeMap<String, Arc<dyn DrmSession>>,
    ) -> Result<ContextRegistry> {
        let mut registry = BTreeMap::new();
        for name in contexts {
            debug!(context = %name, "initializing backend context");
            let context = match name.as_str() {
                "local" => BackendContext::Local,
                "slurm" => {
                    let session = match session_overrides.get(name) {
                        Some(session) => Arc::clone(session),
                        None => Arc::new(SlurmSession::initialize()?),
                    };
                    BackendContext::Slurm(session)
                }
                "gridengine" => {
                    let session = match session_overrides.get(name) {
                        Some(session) => Arc::clone(session),
                        None => Arc::new(GridengineSession::initialize()?),
                    };
                    BackendContext::Gridengine(session)
                }
                "agave" => {
                    let auth = remote_auth.ok_or_else(|| {
                        EngineError::Backend(
                            "agave context requires remote credentials".to_string(),
                        )
                    })?;
                    let client = Arc::new(AgaveClient::new(auth, remote_config)?);
                    BackendContext::Agave(AgaveContext {
                        client,
                        archive_uri: None,
                    })
                }
                other => {
                    return Err(EngineError::Backend(format!(
                        "invalid context: {}",
                        other
                    )))
                }
            };
            registry.insert(name.clone(), context);
        }
        Ok(ContextRegistry { contexts: registry })
    }

    pub fn get(&self, name: &str) -> Option<&BackendContext> {
        self.contexts.get(name)
    }

    pub fn agave(&self) -> Option<&AgaveContext> {
        self.contexts.values().find_map(|context| match context {
            BackendContext::Agave(agave) => Some(agave),
            _ => None,
        })
    }

    /// Register scheme handlers for every data context this registry
    /// carries.
    pub fn register_data_handlers(&self, dm: &mut DataManager) {
        if let Some(agave) = self.agave() {
            dm.register("agave", Arc::new(AgaveDataHandler::new(Arc::clone(&agave.client))));
        }
    }

    /// Initialize context-specific data: the agave archive folder under
    /// the agave work URI.
    pub fn init_context_data(
        &mut self,
        dm: &DataManager,
        work_uris: &BTreeMap<String, ParsedUri>,
    ) -> Result<()> {
        let archive = match self.contexts.get("agave") {
            Some(BackendContext::Agave(_)) => match work_uris.get("agave") {
                Some(work_uri) => Some(work_uri.join("_agave_jobs")?),
                None => {
                    return Err(EngineError::Backend(
                        "agave context has no work uri".to_string(),
                    ))
                }
            },
            _ => None,
        };
        if let Some(archive_uri) = archive {
            dm.mkdir(&archive_uri, true)?;
            if let Some(BackendContext::Agave(agave)) = self.contexts.get_mut("agave") {
                agave.archive_uri = Some(archive_uri);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_tables() {
        assert!(Contexts::is_exec_context("slurm"));
        assert!(Contexts::is_exec_context("agave"));
        assert!(!Contexts::is_exec_context("kubernetes"));
        assert!(Contexts::is_data_context("local"));
        assert!(!Contexts::is_data_context("slurm"));
    }

    #[test]
    fn test_data_scheme_mapping() {
        assert_eq!(Contexts::data_scheme_of("local"), Some("local"));
        assert_eq!(Contexts::data_scheme_of("slurm"), Some("local"));
        assert_eq!(Contexts::data_scheme_of("gridengine"), Some("local"));
        assert_eq!(Contexts::data_scheme_of("agave"), Some("agave"));
        assert_eq!(Contexts::data_scheme_of("other"), None);
    }

    #[test]
    fn test_local_registry_initializes_without_sessions() {
        let contexts: BTreeSet<String> = ["local".to_string()].into_iter().collect();
        let registry = ContextRegistry::initialize(
            &contexts,
            None,
            &RemoteConfig::default(),
            &BTreeMap::new(),
        )
        .unwrap();
        assert!(matches!(registry.get("local"), Some(BackendContext::Local)));
        assert!(registry.agave().is_none());
    }

    #[test]
    fn test_agave_requires_credentials() {
        let contexts: BTreeSet<String> = ["agave".to_string()].into_iter().collect();
        let result = ContextRegistry::initialize(
            &contexts,
            None,
            &RemoteConfig::default(),
            &BTreeMap::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_context_rejected() {
        let contexts: BTreeSet<String> = ["cloud".to_string()].into_iter().collect();
        assert!(ContextRegistry::initialize(
            &contexts,
            None,
            &RemoteConfig::default(),
            &BTreeMap::new(),
        )
        .is_err());
    }
}
