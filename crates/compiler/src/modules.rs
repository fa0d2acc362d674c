//! Module loading and caching.
//!
//! `use "path" as alias` resolves against the importing file's directory
//! first, then the configured module search paths. Modules are cached by
//! canonical path: each file is parsed once, checked once and emitted once
//! no matter how many importers name it. Import cycles are detected by a
//! loading-in-progress set.

use crate::ast::Stmt;
use crate::diagnostics::Diagnostic;
use crate::parser;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One name a module makes visible (or keeps private) at module level.
#[derive(Debug, Clone)]
pub struct ModuleExport {
    pub name: String,
    pub slot: u8,
    pub public: bool,
}

/// A loaded module unit and its per-phase state.
#[derive(Debug)]
pub struct ModuleUnit {
    /// Index in the context's module registry.
    pub index: u8,
    pub name: String,
    pub path: PathBuf,
    /// Label used in diagnostic spans.
    pub file_label: String,
    pub source: String,
    pub ast: Vec<Stmt>,
    pub exports: Vec<ModuleExport>,
    pub init_slot: Option<u8>,
    pub checked: bool,
    pub emitted: bool,
}

impl ModuleUnit {
    pub fn export(&self, name: &str) -> Option<&ModuleExport> {
        self.exports.iter().find(|e| e.name == name)
    }
}

#[derive(Debug, Default)]
pub struct ModuleLoader {
    units: Vec<ModuleUnit>,
    by_path: HashMap<PathBuf, usize>,
    in_progress: HashSet<PathBuf>,
    search_paths: Vec<PathBuf>,
}

/// Why a module failed to load. The checker turns this into a compile
/// diagnostic at the `use` site.
#[derive(Debug)]
pub enum LoadError {
    NotFound(String),
    Io(String),
    Cycle(String),
    /// The module parsed with errors; they are reported as-is.
    Parse(Vec<Diagnostic>),
}

impl ModuleLoader {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        ModuleLoader {
            search_paths,
            ..ModuleLoader::default()
        }
    }

    pub fn unit(&self, index: usize) -> Option<&ModuleUnit> {
        self.units.get(index)
    }

    pub fn unit_mut(&mut self, index: usize) -> Option<&mut ModuleUnit> {
        self.units.get_mut(index)
    }

    /// Find the unit registered under a context module index.
    pub fn unit_by_module_index(&mut self, module_index: u8) -> Option<&mut ModuleUnit> {
        self.units.iter_mut().find(|u| u.index == module_index)
    }

    /// Resolve a `use` path spec to a file on disk. A missing `.orus`
    /// extension is appended.
    fn resolve_path(&self, spec: &str, importer_dir: &Path) -> Result<PathBuf, LoadError> {
        let mut candidates = Vec::new();
        let with_ext = if spec.ends_with(".orus") {
            PathBuf::from(spec)
        } else {
            PathBuf::from(format!("{}.orus", spec))
        };
        if with_ext.is_absolute() {
            candidates.push(with_ext.clone());
        } else {
            candidates.push(importer_dir.join(&with_ext));
            for dir in &self.search_paths {
                candidates.push(dir.join(&with_ext));
            }
        }
        for candidate in &candidates {
            if candidate.is_file() {
                return candidate
                    .canonicalize()
                    .map_err(|e| LoadError::Io(format!("{}: {}", candidate.display(), e)));
            }
        }
        Err(LoadError::NotFound(format!(
            "module '{}' not found (searched {})",
            spec,
            candidates
                .iter()
                .map(|c| c.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    /// Load (or find in cache) the module named by `spec`. The returned
    /// index is stable; `register_index` stores the context module index
    /// once the caller has created it.
    pub fn load(&mut self, spec: &str, importer_dir: &Path) -> Result<usize, LoadError> {
        let path = self.resolve_path(spec, importer_dir)?;
        if let Some(&index) = self.by_path.get(&path) {
            if self.in_progress.contains(&path) {
                return Err(LoadError::Cycle(format!(
                    "import cycle detected through '{}'",
                    path.display()
                )));
            }
            return Ok(index);
        }
        let source = std::fs::read_to_string(&path)
            .map_err(|e| LoadError::Io(format!("{}: {}", path.display(), e)))?;
        let file_label = path.display().to_string();
        let (ast, diagnostics) = parser::parse(&source, &file_label);
        if !diagnostics.is_empty() {
            return Err(LoadError::Parse(diagnostics));
        }
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| spec.to_string());
        debug!(module = %name, path = %path.display(), "loaded module");
        let unit = ModuleUnit {
            index: 0,
            name,
            path: path.clone(),
            file_label,
            source,
            ast,
            exports: Vec::new(),
            init_slot: None,
            checked: false,
            emitted: false,
        };
        self.units.push(unit);
        let index = self.units.len() - 1;
        self.by_path.insert(path, index);
        Ok(index)
    }

    /// Mark a unit as being checked (cycle detection).
    pub fn begin_check(&mut self, index: usize) {
        if let Some(unit) = self.units.get(index) {
            self.in_progress.insert(unit.path.clone());
        }
    }

    pub fn end_check(&mut self, index: usize) {
        if let Some(unit) = self.units.get(index) {
            self.in_progress.remove(&unit.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_load_parses_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("util.orus");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "pub fn twice(x: i32) -> i32 {{ return x * 2 }}").unwrap();
        drop(f);

        let mut loader = ModuleLoader::new(Vec::new());
        let a = loader.load("util", dir.path()).unwrap();
        let b = loader.load("util.orus", dir.path()).unwrap();
        assert_eq!(a, b);
        assert_eq!(loader.unit(a).unwrap().ast.len(), 1);
        assert_eq!(loader.unit(a).unwrap().name, "util");
    }

    #[test]
    fn test_missing_module_reports_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = ModuleLoader::new(Vec::new());
        match loader.load("nope", dir.path()) {
            Err(LoadError::NotFound(message)) => assert!(message.contains("nope")),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.orus");
        std::fs::write(&path, "let x = 1\n").unwrap();
        let mut loader = ModuleLoader::new(Vec::new());
        let index = loader.load("a", dir.path()).unwrap();
        loader.begin_check(index);
        assert!(matches!(
            loader.load("a", dir.path()),
            Err(LoadError::Cycle(_))
        ));
        loader.end_check(index);
        assert!(loader.load("a", dir.path()).is_ok());
    }

    #[test]
    fn test_search_paths_used_after_importer_dir() {
        let importer = tempfile::tempdir().unwrap();
        let lib = tempfile::tempdir().unwrap();
        std::fs::write(lib.path().join("shared.orus"), "let x = 1\n").unwrap();
        let mut loader = ModuleLoader::new(vec![lib.path().to_path_buf()]);
        assert!(loader.load("shared", importer.path()).is_ok());
    }

    #[test]
    fn test_parse_errors_surface() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.orus"), "let = 5\n").unwrap();
        let mut loader = ModuleLoader::new(Vec::new());
        assert!(matches!(
            loader.load("bad", dir.path()),
            Err(LoadError::Parse(_))
        ));
    }
}
