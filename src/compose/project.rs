//! Project definition store
//!
//! Definitions live in `{data_path}/projects/{name}.project.yml`. Each file is
//! parsed and validated when loaded; an invalid definition is still stored so
//! callers can report why it was rejected.

use super::config::ProjectDef;
use crate::config::BerthConfig;
use crate::error::{BerthError, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// File name suffix of project definitions
pub const PROJECT_SUFFIX: &str = ".project.yml";

/// A loaded project definition
#[derive(Debug, Clone, Serialize)]
pub struct ProjectDefinition {
    /// Project name, taken from the file name
    pub name: String,
    pub valid: bool,
    /// Validation failures when `valid` is false
    pub reasons: Vec<String>,
    /// Raw (uninterpolated) definition tree
    pub def: Value,
    pub content: String,
    #[serde(rename = "mtimeMs")]
    pub mtime_ms: i64,
    pub size: u64,
}

impl ProjectDefinition {
    /// Parse and validate definition text
    pub fn parse(name: &str, content: &str) -> Self {
        let (def, reasons) = match serde_yaml::from_str::<Value>(content) {
            Ok(def) => {
                let reasons = validate(&def);
                (def, reasons)
            }
            Err(e) => (Value::Null, vec![format!("invalid YAML: {}", e)]),
        };
        Self {
            name: name.to_string(),
            valid: reasons.is_empty(),
            reasons,
            def,
            content: content.to_string(),
            mtime_ms: 0,
            size: content.len() as u64,
        }
    }

    /// Fail with [`BerthError::InvalidDefinition`] unless the definition is valid
    pub fn ensure_valid(&self) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(BerthError::InvalidDefinition {
                project: self.name.clone(),
                reasons: self.reasons.clone(),
            })
        }
    }
}

/// Check a raw definition, returning every problem found
pub fn validate(def: &Value) -> Vec<String> {
    if !def.is_object() {
        return vec!["definition must be a mapping".to_string()];
    }
    let project = match ProjectDef::from_value(def) {
        Ok(project) => project,
        Err(e) => return vec![e.to_string()],
    };
    let mut reasons = Vec::new();
    if project.services.is_empty() {
        reasons.push("no services defined".to_string());
    }
    for (name, service) in &project.services {
        if service.image.as_deref().map_or(true, str::is_empty) {
            reasons.push(format!("service {} has no image", name));
        }
    }
    reasons
}

/// Source of project definitions for the orchestrator
pub trait DefinitionStore: Send + Sync + 'static {
    fn get(&self, name: &str) -> Option<ProjectDefinition>;
}

impl DefinitionStore for HashMap<String, ProjectDefinition> {
    fn get(&self, name: &str) -> Option<ProjectDefinition> {
        HashMap::get(self, name).cloned()
    }
}

/// Directory-backed definition store
pub struct ProjectStore {
    dir: PathBuf,
    projects: Arc<RwLock<HashMap<String, ProjectDefinition>>>,
}

impl ProjectStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            projects: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &BerthConfig) -> Self {
        Self::new(config.projects_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a project's definition file
    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}{}", name, PROJECT_SUFFIX))
    }

    /// Read one project from disk, replacing any cached copy
    pub fn load(&self, name: &str) -> Result<ProjectDefinition> {
        let path = self.path_of(name);
        if !path.is_file() {
            return Err(BerthError::NotFound(format!("project {}", name)));
        }
        let project = read_definition(name, &path)?;
        if !project.valid {
            warn!("Project {} is invalid: {}", name, project.reasons.join("; "));
        }
        self.insert(project.clone())?;
        Ok(project)
    }

    /// Scan the projects directory, replacing the cache wholesale
    pub fn load_all(&self) -> Result<Vec<String>> {
        let mut loaded = HashMap::new();
        if self.dir.is_dir() {
            for entry in std::fs::read_dir(&self.dir)? {
                let path = entry?.path();
                let Some(name) = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.strip_suffix(PROJECT_SUFFIX))
                    .map(String::from)
                else {
                    continue;
                };
                match read_definition(&name, &path) {
                    Ok(project) => {
                        loaded.insert(name, project);
                    }
                    Err(e) => warn!("Failed to read {}: {}", path.display(), e),
                }
            }
        } else {
            debug!("Projects directory {} does not exist", self.dir.display());
        }

        let mut names: Vec<String> = loaded.keys().cloned().collect();
        names.sort();
        info!("Loaded {} project(s) from {}", names.len(), self.dir.display());

        let mut projects = self
            .projects
            .write()
            .map_err(|_| BerthError::Lock("Failed to acquire write lock".to_string()))?;
        *projects = loaded;
        Ok(names)
    }

    /// Add or replace a definition
    pub fn insert(&self, project: ProjectDefinition) -> Result<()> {
        let mut projects = self
            .projects
            .write()
            .map_err(|_| BerthError::Lock("Failed to acquire write lock".to_string()))?;
        projects.insert(project.name.clone(), project);
        Ok(())
    }

    /// Cached definitions, sorted by name
    pub fn list(&self) -> Result<Vec<ProjectDefinition>> {
        let projects = self
            .projects
            .read()
            .map_err(|_| BerthError::Lock("Failed to acquire read lock".to_string()))?;
        let mut list: Vec<ProjectDefinition> = projects.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }
}

impl DefinitionStore for ProjectStore {
    /// Cached definition, read from disk on first use
    fn get(&self, name: &str) -> Option<ProjectDefinition> {
        let cached = self
            .projects
            .read()
            .ok()
            .and_then(|projects| projects.get(name).cloned());
        match cached {
            Some(project) => Some(project),
            None => match self.load(name) {
                Ok(project) => Some(project),
                Err(BerthError::NotFound(_)) => None,
                Err(e) => {
                    warn!("Failed to load project {}: {}", name, e);
                    None
                }
            },
        }
    }
}

fn read_definition(name: &str, path: &Path) -> Result<ProjectDefinition> {
    let content = std::fs::read_to_string(path)?;
    let metadata = std::fs::metadata(path)?;
    let mut project = ProjectDefinition::parse(name, &content);
    project.size = metadata.len();
    project.mtime_ms = metadata
        .modified()
        .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp_millis())
        .unwrap_or_default();
    Ok(project)
}
