//! Project definitions.
//!
//! A project is loaded once per run from a YAML file and never mutated
//! afterwards:
//!
//! ```yaml
//! name: rpn2tex
//! source:
//!   language: python
//!   directory: projects/rpn2tex/python
//!   files: [tokens.py, lexer.py, parser.py]
//! modules:
//!   - name: tokens
//!     source: tokens.py
//!     phase: core
//!   - name: lexer
//!     source: lexer.py
//!     phase: core
//!     depends_on: [tokens]
//! features:
//!   - name: numbers
//!     touches: [tokens, lexer]
//!     test_cases:
//!       - { input: "5", output: "$5$" }
//! test_inputs: ["5 3 +"]
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Where the code being migrated lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSection {
    #[serde(default = "default_source_language")]
    pub language: String,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub files: Vec<String>,
}

fn default_source_language() -> String {
    "python".to_string()
}

/// One source module, migrated as a unit under module-by-module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDef {
    /// Module id. Falls back to `source` when omitted.
    #[serde(default)]
    pub name: Option<String>,
    pub source: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ModuleDef {
    pub fn new(name: &str, source: &str, depends_on: &[&str]) -> Self {
        Self {
            name: Some(name.to_string()),
            source: source.to_string(),
            phase: String::new(),
            description: String::new(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        }
    }

    pub fn id(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.source)
    }
}

/// An input/expected-output pair attached to a feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub output: String,
}

/// A cross-cutting feature, migrated as a unit under feature-by-feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureDef {
    #[serde(alias = "id")]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Modules this feature spans, by module id or source file.
    #[serde(default)]
    pub touches: Vec<String>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl FeatureDef {
    pub fn new(name: &str, touches: &[&str], depends_on: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            touches: touches.iter().map(|t| t.to_string()).collect(),
            test_cases: Vec::new(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        }
    }

    pub fn id(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub modules: Vec<ModuleDef>,
    #[serde(default)]
    pub features: Vec<FeatureDef>,
    #[serde(default)]
    pub test_inputs: Vec<String>,
}

impl Project {
    /// Build a project from modules only (no features).
    pub fn with_modules(name: &str, modules: Vec<ModuleDef>) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            source: SourceSection {
                language: default_source_language(),
                ..Default::default()
            },
            modules,
            features: Vec::new(),
            test_inputs: Vec::new(),
        }
    }

    /// Load and validate a project definition from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse and validate a project definition from YAML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let project: Project =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        project.validate()?;
        Ok(project)
    }

    /// Check structural validity: unique ids, known dependencies, known
    /// module references. Cycles are the strategy engine's concern.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.modules.is_empty() {
            return Err(ConfigError::NoModules {
                project: self.name.clone(),
            });
        }

        let mut module_ids = HashSet::new();
        for module in &self.modules {
            if !module_ids.insert(module.id()) {
                return Err(ConfigError::DuplicateUnit {
                    id: module.id().to_string(),
                });
            }
        }
        for module in &self.modules {
            for dep in &module.depends_on {
                if !module_ids.contains(dep.as_str()) {
                    return Err(ConfigError::UnknownDependency {
                        unit: module.id().to_string(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut feature_ids = HashSet::new();
        for feature in &self.features {
            if feature.name.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "Feature name must not be empty".to_string(),
                ));
            }
            if !feature_ids.insert(feature.id()) {
                return Err(ConfigError::DuplicateUnit {
                    id: feature.id().to_string(),
                });
            }
        }
        for feature in &self.features {
            for dep in &feature.depends_on {
                if !feature_ids.contains(dep.as_str()) {
                    return Err(ConfigError::UnknownDependency {
                        unit: feature.id().to_string(),
                        dependency: dep.clone(),
                    });
                }
            }
            for touched in &feature.touches {
                if self.find_module(touched).is_none() {
                    return Err(ConfigError::UnknownModule {
                        feature: feature.id().to_string(),
                        module: touched.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Look up a module by id or by source file.
    pub fn find_module(&self, reference: &str) -> Option<&ModuleDef> {
        self.modules
            .iter()
            .find(|m| m.id() == reference)
            .or_else(|| self.modules.iter().find(|m| m.source == reference))
    }

    pub fn has_features(&self) -> bool {
        !self.features.is_empty()
    }
}
