//! Polymorphic file operations dispatched by URI scheme.
//!
//! The [`DataManager`] holds a registry of scheme -> handler values,
//! populated at runtime init. Cross-scheme copies route through the
//! handlers' upload/download hooks, staging through a local temp
//! directory when neither side of a transfer is local.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use glob::{MatchOptions, Pattern};
use tracing::{debug, warn};
use walkdir::WalkDir;

use geneflow_core::ParsedUri;

use crate::error::{EngineError, Result};
use crate::remote::AgaveClient;

fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

fn compile_glob(glob_str: &str) -> Result<Pattern> {
    Pattern::new(glob_str)
        .map_err(|err| EngineError::Data(format!("invalid glob '{}': {}", glob_str, err)))
}

/// Per-scheme file operations.
pub trait DataHandler: Send + Sync {
    /// Names relative to `uri` that match `glob_str`. Recursive results
    /// keep intermediate `/` separators in the name. Sorted.
    fn list(&self, uri: &ParsedUri, glob_str: &str, recursive: bool) -> Result<Vec<String>>;

    fn mkdir(&self, uri: &ParsedUri, recursive: bool) -> Result<()>;

    /// Delete a file or directory tree. Returns `false` when the URI
    /// does not exist; callers treat that as a warning.
    fn delete(&self, uri: &ParsedUri) -> Result<bool>;

    fn exists(&self, uri: &ParsedUri) -> Result<bool>;

    /// Copy a local file or directory to `dest` in this scheme.
    fn upload(&self, local: &Path, dest: &ParsedUri) -> Result<()>;

    /// Copy `src` in this scheme to a local file or directory.
    fn download(&self, src: &ParsedUri, local: &Path) -> Result<()>;

    /// Same-scheme copy.
    fn copy_within(&self, src: &ParsedUri, dest: &ParsedUri) -> Result<()>;
}

/// Registry of scheme handlers.
pub struct DataManager {
    handlers: BTreeMap<String, Arc<dyn DataHandler>>,
}

impl DataManager {
    pub fn new() -> DataManager {
        let mut handlers: BTreeMap<String, Arc<dyn DataHandler>> = BTreeMap::new();
        handlers.insert("local".to_string(), Arc::new(LocalDataHandler));
        DataManager { handlers }
    }

    pub fn register(&mut self, scheme: &str, handler: Arc<dyn DataHandler>) {
        self.handlers.insert(scheme.to_string(), handler);
    }

    fn handler(&self, scheme: &str) -> Result<&Arc<dyn DataHandler>> {
        self.handlers.get(scheme).ok_or_else(|| {
            EngineError::Data(format!("no data handler for scheme '{}'", scheme))
        })
    }

    pub fn list(&self, uri: &ParsedUri, glob_str: &str, recursive: bool) -> Result<Vec<String>> {
        self.handler(&uri.scheme)?.list(uri, glob_str, recursive)
    }

    pub fn mkdir(&self, uri: &ParsedUri, recursive: bool) -> Result<()> {
        self.handler(&uri.scheme)?.mkdir(uri, recursive)
    }

    pub fn delete(&self, uri: &ParsedUri) -> Result<bool> {
        self.handler(&uri.scheme)?.delete(uri)
    }

    pub fn exists(&self, uri: &ParsedUri) -> Result<bool> {
        self.handler(&uri.scheme)?.exists(uri)
    }

    /// Copy `src` to `dest`, cross-scheme permitted.
    pub fn copy(&self, src: &ParsedUri, dest: &ParsedUri) -> Result<()> {
        debug!(src = %src, dest = %dest, "copy");
        if src.scheme == dest.scheme {
            return self.handler(&src.scheme)?.copy_within(src, dest);
        }
        if src.scheme == "local" {
            return self
                .handler(&dest.scheme)?
                .upload(Path::new(&src.chopped_path), dest);
        }
        if dest.scheme == "local" {
            return self
                .handler(&src.scheme)?
                .download(src, Path::new(&dest.chopped_path));
        }
        // neither side local: stage through a temp directory
        let staging = tempfile::tempdir()?;
        let hop = staging.path().join(&src.name);
        self.handler(&src.scheme)?.download(src, &hop)?;
        self.handler(&dest.scheme)?.upload(&hop, dest)
    }
}

impl Default for DataManager {
    fn default() -> Self {
        DataManager::new()
    }
}

// --- local ---

pub struct LocalDataHandler;

impl DataHandler for LocalDataHandler {
    fn list(&self, uri: &ParsedUri, glob_str: &str, recursive: bool) -> Result<Vec<String>> {
        let pattern = compile_glob(glob_str)?;
        let root = Path::new(&uri.chopped_path);
        if !root.is_dir() {
            return Err(EngineError::Data(format!(
                "cannot list, not a directory: {}",
                uri
            )));
        }

        let mut names = Vec::new();
        if recursive {
            for entry in WalkDir::new(root).min_depth(1) {
                let entry = entry
                    .map_err(|err| EngineError::Data(format!("cannot walk {}: {}", uri, err)))?;
                let relative = entry
                    .path()
                    .strip_prefix(root)
                    .map_err(|err| EngineError::Data(err.to_string()))?;
                let name = relative.to_string_lossy().to_string();
                if pattern.matches_with(&name, match_options()) {
                    names.push(name);
                }
            }
        } else {
            for entry in fs::read_dir(root)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if pattern.matches_with(&name, match_options()) {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn mkdir(&self, uri: &ParsedUri, recursive: bool) -> Result<()> {
        let path = Path::new(&uri.chopped_path);
        if recursive {
            fs::create_dir_all(path)?;
        } else {
            fs::create_dir(path)?;
        }
        Ok(())
    }

    fn delete(&self, uri: &ParsedUri) -> Result<bool> {
        let path = Path::new(&uri.chopped_path);
        if !path.exists() {
            return Ok(false);
        }
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
        Ok(true)
    }

    fn exists(&self, uri: &ParsedUri) -> Result<bool> {
        Ok(Path::new(&uri.chopped_path).exists())
    }

    fn upload(&self, local: &Path, dest: &ParsedUri) -> Result<()> {
        copy_local_tree(local, Path::new(&dest.chopped_path))
    }

    fn download(&self, src: &ParsedUri, local: &Path) -> Result<()> {
        copy_local_tree(Path::new(&src.chopped_path), local)
    }

    fn copy_within(&self, src: &ParsedUri, dest: &ParsedUri) -> Result<()> {
        copy_local_tree(Path::new(&src.chopped_path), Path::new(&dest.chopped_path))
    }
}

/// Copy a file, or a directory tree into `dest`.
fn copy_local_tree(src: &Path, dest: &Path) -> Result<()> {
    if !src.exists() {
        return Err(EngineError::Data(format!(
            "copy source does not exist: {}",
            src.display()
        )));
    }
    if src.is_file() {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        // copying a file onto an existing directory targets a child
        let target = if dest.is_dir() {
            dest.join(src.file_name().unwrap_or_default())
        } else {
            dest.to_path_buf()
        };
        fs::copy(src, &target)?;
        return Ok(());
    }

    fs::create_dir_all(dest)?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|err| EngineError::Data(err.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|err| EngineError::Data(err.to_string()))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

// --- agave ---

pub struct AgaveDataHandler {
    client: Arc<AgaveClient>,
}

impl AgaveDataHandler {
    pub fn new(client: Arc<AgaveClient>) -> AgaveDataHandler {
        AgaveDataHandler { client }
    }

    fn list_recursive(
        &self,
        uri: &ParsedUri,
        prefix: &str,
        pattern: &Pattern,
        names: &mut Vec<String>,
    ) -> Result<()> {
        let path = if prefix.is_empty() {
            uri.chopped_path.clone()
        } else {
            format!("{}/{}", uri.chopped_path, prefix)
        };
        for entry in self.client.files_list(&uri.authority, &path)? {
            if entry.name == "." {
                continue;
            }
            let name = if prefix.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", prefix, entry.name)
            };
            if pattern.matches_with(&name, match_options()) {
                names.push(name.clone());
            }
            if entry.is_dir() {
                self.list_recursive(uri, &name, pattern, names)?;
            }
        }
        Ok(())
    }

    fn download_tree(&self, system: &str, remote_path: &str, local: &Path) -> Result<()> {
        let entries = self.client.files_list(system, remote_path)?;
        let is_dir = entries.iter().any(|e| e.name == ".");
        if !is_dir {
            if let Some(parent) = local.parent() {
                fs::create_dir_all(parent)?;
            }
            return self.client.files_download(system, remote_path, local);
        }
        fs::create_dir_all(local)?;
        for entry in entries.iter().filter(|e| e.name != ".") {
            let child_remote = format!("{}/{}", remote_path, entry.name);
            let child_local = local.join(&entry.name);
            if entry.is_dir() {
                self.download_tree(system, &child_remote, &child_local)?;
            } else {
                self.client
                    .files_download(system, &child_remote, &child_local)?;
            }
        }
        Ok(())
    }
}

impl DataHandler for AgaveDataHandler {
    fn list(&self, uri: &ParsedUri, glob_str: &str, recursive: bool) -> Result<Vec<String>> {
        let pattern = compile_glob(glob_str)?;
        let mut names = Vec::new();
        if recursive {
            self.list_recursive(uri, "", &pattern, &mut names)?;
        } else {
            for entry in self.client.files_list(&uri.authority, &uri.chopped_path)? {
                if entry.name != "." && pattern.matches_with(&entry.name, match_options()) {
                    names.push(entry.name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn mkdir(&self, uri: &ParsedUri, recursive: bool) -> Result<()> {
        // the remote mkdir action creates intermediate folders
        let _ = recursive;
        self.client
            .files_mkdir(&uri.authority, &uri.folder, &uri.name)
    }

    fn delete(&self, uri: &ParsedUri) -> Result<bool> {
        if !self.exists(uri)? {
            return Ok(false);
        }
        self.client.files_delete(&uri.authority, &uri.chopped_path)?;
        Ok(true)
    }

    fn exists(&self, uri: &ParsedUri) -> Result<bool> {
        self.client.files_exists(&uri.authority, &uri.chopped_path)
    }

    fn upload(&self, local: &Path, dest: &ParsedUri) -> Result<()> {
        if local.is_file() {
            return self.client.files_upload(&dest.authority, &dest.folder, local);
        }
        self.client
            .files_mkdir(&dest.authority, &dest.folder, &dest.name)?;
        for entry in WalkDir::new(local).min_depth(1) {
            let entry = entry.map_err(|err| EngineError::Data(err.to_string()))?;
            let relative = entry
                .path()
                .strip_prefix(local)
                .map_err(|err| EngineError::Data(err.to_string()))?;
            let relative = relative.to_string_lossy();
            if entry.file_type().is_dir() {
                let (folder, name) = split_relative(&dest.chopped_path, &relative);
                self.client.files_mkdir(&dest.authority, &folder, &name)?;
            } else {
                let (folder, _) = split_relative(&dest.chopped_path, &relative);
                self.client
                    .files_upload(&dest.authority, &folder, entry.path())?;
            }
        }
        Ok(())
    }

    fn download(&self, src: &ParsedUri, local: &Path) -> Result<()> {
        self.download_tree(&src.authority, &src.chopped_path, local)
    }

    fn copy_within(&self, src: &ParsedUri, dest: &ParsedUri) -> Result<()> {
        if !self.exists(&parent_of(dest)?)? {
            warn!(dest = %dest, "copy destination folder missing");
        }
        self.client.files_import_from_remote(
            &dest.authority,
            &dest.folder,
            &dest.name,
            &src.chopped_uri,
        )
    }
}

fn parent_of(uri: &ParsedUri) -> Result<ParsedUri> {
    Ok(ParsedUri::parse(&uri.folder_uri())?)
}

fn split_relative(base: &str, relative: &str) -> (String, String) {
    match relative.rsplit_once('/') {
        Some((folder, name)) => (format!("{}/{}", base, folder), name.to_string()),
        None => (base.to_string(), relative.to_string()),
    }
}
