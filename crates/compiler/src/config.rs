//! Project configuration (`orus.toml`).
//!
//! An optional manifest next to the program provides module search paths
//! and VM defaults. CLI flags override anything set here.
//!
//! ```toml
//! [project]
//! name = "calculator"
//! module-paths = ["lib", "vendor"]
//!
//! [vm]
//! stack-size = 4096
//! frame-depth = 128
//! trace = false
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct ProjectConfig {
    pub name: Option<String>,
    #[serde(default)]
    pub module_paths: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct VmConfig {
    pub stack_size: Option<usize>,
    pub frame_depth: Option<usize>,
    #[serde(default)]
    pub trace: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct OrusConfig {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub vm: VmConfig,
}

impl OrusConfig {
    pub fn from_toml(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| format!("invalid orus.toml: {}", e))
    }

    /// Load `orus.toml` from `dir` when present; defaults otherwise.
    pub fn load_from_dir(dir: &Path) -> Result<Self, String> {
        let path = dir.join("orus.toml");
        if !path.is_file() {
            return Ok(OrusConfig::default());
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::from_toml(&text)
    }

    /// Module search paths resolved relative to the manifest directory.
    pub fn module_search_paths(&self, base: &Path) -> Vec<PathBuf> {
        self.project
            .module_paths
            .iter()
            .map(|p| {
                let path = PathBuf::from(p);
                if path.is_absolute() {
                    path
                } else {
                    base.join(path)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_manifest() {
        let config = OrusConfig::from_toml(
            "[project]\nname = \"calc\"\nmodule-paths = [\"lib\"]\n\n[vm]\nstack-size = 1024\ntrace = true\n",
        )
        .unwrap();
        assert_eq!(config.project.name.as_deref(), Some("calc"));
        assert_eq!(config.project.module_paths, vec!["lib"]);
        assert_eq!(config.vm.stack_size, Some(1024));
        assert!(config.vm.trace);
    }

    #[test]
    fn test_defaults_for_missing_sections() {
        let config = OrusConfig::from_toml("").unwrap();
        assert!(config.project.name.is_none());
        assert!(config.project.module_paths.is_empty());
        assert!(!config.vm.trace);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrusConfig::load_from_dir(dir.path()).unwrap();
        assert!(config.project.name.is_none());
    }

    #[test]
    fn test_module_paths_resolve_relative_to_base() {
        let config = OrusConfig::from_toml("[project]\nmodule-paths = [\"lib\"]\n").unwrap();
        let paths = config.module_search_paths(Path::new("/proj"));
        assert_eq!(paths, vec![PathBuf::from("/proj/lib")]);
    }

    #[test]
    fn test_invalid_toml_reports_error() {
        assert!(OrusConfig::from_toml("[project\n").is_err());
    }
}
