//! Language dispatch table: language -> (compile command?, run command)
//!
//! Loaded from `config/languages.json`; built-in defaults cover the
//! languages the generators are asked to write in.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const DEFAULT_LANGUAGES_PATH: &str = "config/languages.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageSpec {
    pub name: String,
    /// File the source is written to inside the working directory
    pub source_file: String,
    /// Compile phase; None for interpreted languages
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
    /// Container image used by the docker backend
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u32,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f32,
    #[serde(default)]
    pub aliases: Vec<String>,
}

fn default_memory_limit_mb() -> u32 {
    256
}

fn default_cpu_limit() -> f32 {
    1.0
}

fn words(cmd: &[&str]) -> Vec<String> {
    cmd.iter().map(|s| s.to_string()).collect()
}

impl LanguageSpec {
    pub fn interpreted(name: &str, source_file: &str, run: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            source_file: source_file.to_string(),
            compile: None,
            run: words(run),
            image: None,
            memory_limit_mb: default_memory_limit_mb(),
            cpu_limit: default_cpu_limit(),
            aliases: Vec::new(),
        }
    }

    pub fn compiled(name: &str, source_file: &str, compile: &[&str], run: &[&str]) -> Self {
        Self {
            compile: Some(words(compile)),
            ..Self::interpreted(name, source_file, run)
        }
    }

    pub fn with_image(mut self, image: &str) -> Self {
        self.image = Some(image.to_string());
        self
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = words(aliases);
        self
    }

    pub fn needs_compile(&self) -> bool {
        self.compile.as_ref().map(|c| !c.is_empty()).unwrap_or(false)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LanguagesJson {
    pub languages: Vec<LanguageSpec>,
}

#[derive(Debug, thiserror::Error)]
pub enum LanguageConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("language '{0}' has an empty run command")]
    EmptyRunCommand(String),
}

/// Lookup by name or alias, case-insensitive
#[derive(Debug, Clone, Default)]
pub struct LanguageTable {
    specs: Vec<LanguageSpec>,
    index: HashMap<String, usize>,
}

impl LanguageTable {
    pub fn new(specs: Vec<LanguageSpec>) -> Result<Self, LanguageConfigError> {
        let mut table = Self::default();
        for spec in specs {
            table.insert(spec)?;
        }
        Ok(table)
    }

    pub fn insert(&mut self, spec: LanguageSpec) -> Result<(), LanguageConfigError> {
        if spec.run.is_empty() {
            return Err(LanguageConfigError::EmptyRunCommand(spec.name));
        }
        let slot = match self.index.get(&spec.name.to_lowercase()) {
            Some(&existing) => {
                self.specs[existing] = spec.clone();
                existing
            }
            None => {
                self.specs.push(spec.clone());
                self.specs.len() - 1
            }
        };
        self.index.insert(spec.name.to_lowercase(), slot);
        for alias in &spec.aliases {
            self.index.insert(alias.to_lowercase(), slot);
        }
        Ok(())
    }

    pub fn builtin() -> Self {
        let specs = vec![
            LanguageSpec::interpreted("python", "main.py", &["python3", "main.py"])
                .with_image("python:3.12-slim")
                .with_aliases(&["py", "python3"]),
            LanguageSpec::compiled(
                "cpp",
                "main.cpp",
                &["g++", "-O2", "-std=c++17", "-o", "main", "main.cpp"],
                &["./main"],
            )
            .with_image("gcc:13")
            .with_aliases(&["c++", "cpp17", "g++"]),
            LanguageSpec::compiled("java", "Main.java", &["javac", "Main.java"], &["java", "-Xss64m", "Main"])
                .with_image("eclipse-temurin:21")
                .with_aliases(&["java17", "java21"]),
            LanguageSpec::compiled("rust", "main.rs", &["rustc", "-O", "-o", "main", "main.rs"], &["./main"])
                .with_image("rust:1-slim")
                .with_aliases(&["rs"]),
        ];
        // Built-in specs all have run commands
        Self::new(specs).unwrap_or_default()
    }

    /// Built-ins overlaid with the entries of a languages.json file
    pub fn load(path: &Path) -> Result<Self, LanguageConfigError> {
        let display = path.display().to_string();
        let content = fs::read_to_string(path).map_err(|source| LanguageConfigError::Read {
            path: display.clone(),
            source,
        })?;
        let parsed: LanguagesJson =
            serde_json::from_str(&content).map_err(|source| LanguageConfigError::Parse {
                path: display,
                source,
            })?;

        let mut table = Self::builtin();
        for spec in parsed.languages {
            table.insert(spec)?;
        }
        Ok(table)
    }

    /// Load `path` if it exists, otherwise fall back to the built-ins
    pub fn load_or_builtin(path: &Path) -> Result<Self, LanguageConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::builtin())
        }
    }

    pub fn get(&self, language: &str) -> Option<&LanguageSpec> {
        self.index
            .get(&language.trim().to_lowercase())
            .map(|&i| &self.specs[i])
    }

    pub fn supports(&self, language: &str) -> bool {
        self.get(language).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.specs.iter().map(|s| s.name.clone()).collect()
    }

    pub fn specs(&self) -> &[LanguageSpec] {
        &self.specs
    }
}
