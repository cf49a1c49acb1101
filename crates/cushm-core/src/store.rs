//! Project records on disk

use crate::meta::MetadataTree;
use crate::{Error, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Environment variable overriding the record directory
pub const ROOT_ENV: &str = "CUSHM_ROOT";
/// Environment variable overriding the name prefix
pub const PREFIX_ENV: &str = "CUSHM_PREFIX";
/// Default prefix for record files and segment names
pub const DEFAULT_PREFIX: &str = "cushm";

const RECORD_EXT: &str = "toml";
const SUFFIX_LEN: usize = 10;

/// Where records live and how records and segments are named
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory holding one record file per project
    pub root: PathBuf,
    /// Reserved prefix of record files and segment names
    pub prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join(DEFAULT_PREFIX),
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Defaults, overridden by `CUSHM_ROOT` and `CUSHM_PREFIX` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(root) = std::env::var_os(ROOT_ENV).filter(|v| !v.is_empty()) {
            config.root = PathBuf::from(root);
        }
        if let Ok(prefix) = std::env::var(PREFIX_ENV) {
            if !prefix.is_empty() {
                config.prefix = prefix;
            }
        }
        config
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("record root cannot be empty".to_string()));
        }
        if !is_valid_name(&self.prefix) {
            return Err(Error::InvalidConfig(format!("invalid prefix '{}'", self.prefix)));
        }
        Ok(())
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Maps project names to record files under one root directory.
///
/// The record of project `p` is `<root>/<prefix>.p.toml`. Project names are
/// restricted to `[A-Za-z0-9_.-]` (not starting with `.`), which keeps the
/// mapping one-to-one.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    config: StoreConfig,
}

impl ProjectStore {
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    fn check_project(project: &str) -> Result<()> {
        if is_valid_name(project) {
            Ok(())
        } else {
            Err(Error::InvalidProjectName(project.to_string()))
        }
    }

    /// Record location for `project`.
    pub fn path_for(&self, project: &str) -> Result<PathBuf> {
        Self::check_project(project)?;
        Ok(self
            .config
            .root
            .join(format!("{}.{}.{}", self.config.prefix, project, RECORD_EXT)))
    }

    /// Whether `project` currently has a record.
    pub fn exists(&self, project: &str) -> Result<bool> {
        Ok(self.path_for(project)?.is_file())
    }

    /// Every project with a record, by name.
    pub fn list(&self) -> Result<BTreeMap<String, PathBuf>> {
        let entries = match fs::read_dir(&self.config.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let head = format!("{}.", self.config.prefix);
        let tail = format!(".{}", RECORD_EXT);

        let mut projects = BTreeMap::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let project = file_name
                .strip_prefix(&head)
                .and_then(|rest| rest.strip_suffix(&tail));
            if let Some(project) = project.filter(|p| is_valid_name(p)) {
                projects.insert(project.to_string(), entry.path());
            }
        }
        Ok(projects)
    }

    /// Read and decode the record of `project`.
    pub fn load(&self, project: &str) -> Result<MetadataTree> {
        let path = self.path_for(project)?;
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("project '{}' ({})", project, path.display())))
            }
            Err(e) => return Err(e.into()),
        };
        MetadataTree::from_toml_str(&text).map_err(|e| match e {
            Error::Malformed { reason, .. } => Error::Malformed { path, reason },
            other => other,
        })
    }

    /// Durably write the record of `project`.
    ///
    /// The text goes to a temporary file first so readers never see a partial
    /// record. Without `overwrite`, an existing record makes this fail with
    /// `AlreadyExists` even when another process created it concurrently.
    pub fn save(&self, project: &str, tree: &MetadataTree, overwrite: bool) -> Result<PathBuf> {
        let path = self.path_for(project)?;
        let text = tree.to_toml_string()?;
        fs::create_dir_all(&self.config.root)?;

        let tmp = self.config.root.join(format!(
            ".{}.{}.{}.tmp",
            self.config.prefix,
            project,
            random_suffix()
        ));
        let written = write_synced(&tmp, &text).and_then(|_| {
            if overwrite {
                fs::rename(&tmp, &path)
            } else {
                fs::hard_link(&tmp, &path)
            }
        });
        let _ = fs::remove_file(&tmp);
        match written {
            Ok(()) => Ok(path),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(Error::AlreadyExists(format!("project '{}' ({})", project, path.display())))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the record of `project`; false if there was none.
    pub fn remove(&self, project: &str) -> Result<bool> {
        match fs::remove_file(self.path_for(project)?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Fresh segment name `<prefix>.<project>.<random>`.
    pub fn segment_name(&self, project: &str) -> String {
        format!("{}.{}.{}", self.config.prefix, project, random_suffix())
    }
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(char::from)
        .collect()
}

fn write_synced(path: &Path, text: &str) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(text.as_bytes())?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Tree;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> ProjectStore {
        ProjectStore::new(StoreConfig::new(dir.path()).with_prefix("cushmtest")).unwrap()
    }

    #[test]
    fn test_path_for_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let path = store.path_for("alpha").unwrap();
        assert_eq!(path, dir.path().join("cushmtest.alpha.toml"));
        assert_eq!(store.path_for("alpha").unwrap(), path);
        assert_ne!(store.path_for("alpha.1").unwrap(), path);
    }

    #[test]
    fn test_invalid_project_names() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        for name in ["", "../x", "a/b", ".hidden", "sp ace"] {
            assert!(
                matches!(store.path_for(name), Err(Error::InvalidProjectName(_))),
                "{name:?}"
            );
        }
    }

    #[test]
    fn test_save_list_remove() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.list().unwrap().is_empty());

        let tree = MetadataTree::node().with("g", Tree::node());
        store.save("one", &tree, false).unwrap();
        store.save("two", &tree, false).unwrap();
        fs::write(dir.path().join("unrelated.toml"), "").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.keys().cloned().collect::<Vec<_>>(), vec!["one", "two"]);
        assert_eq!(store.load("one").unwrap(), tree);

        assert!(matches!(store.save("one", &tree, false), Err(Error::AlreadyExists(_))));
        store.save("one", &tree, true).unwrap();

        assert!(store.remove("one").unwrap());
        assert!(!store.remove("one").unwrap());
        assert!(!store.exists("one").unwrap());
        assert!(matches!(store.load("one"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_list_missing_root() {
        let dir = TempDir::new().unwrap();
        let store = ProjectStore::new(StoreConfig::new(dir.path().join("nope"))).unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_record_carries_path() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let path = store.path_for("bad").unwrap();
        fs::write(&path, "[[[").unwrap();
        match store.load("bad") {
            Err(Error::Malformed { path: p, .. }) => assert_eq!(p, path),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_segment_names() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let a = store.segment_name("proj");
        let b = store.segment_name("proj");
        assert!(a.starts_with("cushmtest.proj."));
        assert_eq!(a.len(), "cushmtest.proj.".len() + SUFFIX_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn test_config_validation() {
        assert!(StoreConfig::default().validate().is_ok());
        assert!(StoreConfig::default().with_prefix("a/b").validate().is_err());
        assert!(StoreConfig::new("").validate().is_err());
    }
}
