//! In-memory definition registry.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::info;

use forgeflow_workflow::{DefinitionError, DefinitionId, DefinitionSource, WorkflowDefinition};

/// Registry of immutable `(id, version)` definitions.
///
/// Re-registering identical content is a no-op; different content under an
/// existing key is rejected, so a running execution never sees its
/// definition change.
#[derive(Debug, Default)]
pub struct InMemoryDefinitionSource {
    definitions: RwLock<BTreeMap<(DefinitionId, u32), WorkflowDefinition>>,
}

impl InMemoryDefinitionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn register(&self, definition: WorkflowDefinition) -> Result<(), DefinitionError> {
        definition.check_references()?;

        let mut definitions = self
            .definitions
            .write()
            .map_err(|_| DefinitionError::Unavailable("lock poisoned".to_string()))?;

        let key = (definition.id.clone(), definition.version);
        match definitions.get(&key) {
            Some(existing) if existing == &definition => Ok(()),
            Some(_) => Err(DefinitionError::AlreadyRegistered {
                id: key.0,
                version: key.1,
            }),
            None => {
                info!(definition_id = %definition.id, version = definition.version, "registered workflow definition");
                definitions.insert(key, definition);
                Ok(())
            }
        }
    }

    /// Highest registered version of `id`.
    pub fn get_latest(&self, id: &DefinitionId) -> Result<WorkflowDefinition, DefinitionError> {
        let definitions = self
            .definitions
            .read()
            .map_err(|_| DefinitionError::Unavailable("lock poisoned".to_string()))?;
        definitions
            .range((id.clone(), 0)..=(id.clone(), u32::MAX))
            .next_back()
            .map(|(_, d)| d.clone())
            .ok_or_else(|| DefinitionError::NotFound {
                id: id.clone(),
                version: 0,
            })
    }

    pub fn len(&self) -> usize {
        self.definitions.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parse a JSON array of definitions and register each one.
    pub fn from_json_str(json: &str) -> Result<Self, DefinitionError> {
        let parsed: Vec<WorkflowDefinition> = serde_json::from_str(json)
            .map_err(|e| DefinitionError::Unavailable(format!("invalid definitions json: {e}")))?;
        let source = Self::new();
        for definition in parsed {
            source.register(definition)?;
        }
        Ok(source)
    }

    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, DefinitionError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| DefinitionError::Unavailable(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }
}

impl DefinitionSource for InMemoryDefinitionSource {
    fn get_definition(
        &self,
        id: &DefinitionId,
        version: u32,
    ) -> Result<WorkflowDefinition, DefinitionError> {
        let definitions = self
            .definitions
            .read()
            .map_err(|_| DefinitionError::Unavailable("lock poisoned".to_string()))?;
        definitions
            .get(&(id.clone(), version))
            .cloned()
            .ok_or_else(|| DefinitionError::NotFound {
                id: id.clone(),
                version,
            })
    }
}
