//
// kernel_spec.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Placeholder in a kernel spec's argv that is replaced with the path to the
/// kernel's connection file.
pub const CONNECTION_FILE_PLACEHOLDER: &str = "{connection_file}";

/// A kernel spec, as read from a `kernel.json` file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KernelSpec {
    /// The command line used to start the kernel
    pub argv: Vec<String>,

    pub display_name: String,

    #[serde(default)]
    pub language: String,

    /// Extra environment variables for the kernel process
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// How the kernel wants to be interrupted ("signal" or "message")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_mode: Option<String>,
}

impl KernelSpec {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let file = File::open(path)?;
        let spec: KernelSpec = serde_json::from_reader(BufReader::new(file))?;
        if spec.argv.is_empty() {
            anyhow::bail!("Kernel spec has an empty argv");
        }
        Ok(spec)
    }

    /// The command line for a kernel using the given connection file.
    pub fn resolve_argv(&self, connection_file: &Path) -> Vec<String> {
        let path = connection_file.to_string_lossy();
        self.argv
            .iter()
            .map(|arg| arg.replace(CONNECTION_FILE_PLACEHOLDER, &path))
            .collect()
    }
}

/// The kernel specs available to start.
#[derive(Debug, Clone, Default)]
pub struct KernelSpecStore {
    specs: HashMap<String, KernelSpec>,
    default_name: Option<String>,
}

impl KernelSpecStore {
    /// Load every `<name>/kernel.json` under `dir`. Specs that fail to load
    /// are logged and skipped.
    pub fn from_dir(dir: &Path) -> Result<Self, anyhow::Error> {
        let mut specs = HashMap::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path: PathBuf = entry.path().join("kernel.json");
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_lowercase();
            match KernelSpec::from_file(&path) {
                Ok(spec) => {
                    log::debug!("Loaded kernel spec '{}' from {}", name, path.display());
                    specs.insert(name, spec);
                }
                Err(err) => log::warn!("Skipping kernel spec {}: {}", path.display(), err),
            }
        }
        log::info!("Found {} kernel spec(s) in {}", specs.len(), dir.display());
        Ok(Self {
            specs,
            default_name: None,
        })
    }

    pub fn insert(&mut self, name: &str, spec: KernelSpec) {
        self.specs.insert(name.to_string(), spec);
    }

    /// Set the spec used when a start request names none.
    pub fn set_default(&mut self, name: Option<String>) {
        self.default_name = name;
    }

    /// The name of the default spec: the configured one, or the only one if
    /// there is exactly one.
    pub fn default_name(&self) -> Option<String> {
        if let Some(name) = &self.default_name {
            return Some(name.clone());
        }
        if self.specs.len() == 1 {
            return self.specs.keys().next().cloned();
        }
        None
    }

    pub fn get(&self, name: &str) -> Option<&KernelSpec> {
        self.specs.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.specs.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
