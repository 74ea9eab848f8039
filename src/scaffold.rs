//! `sitekiln init`: create a new site source directory.
//!
//! A bare site gets only a `_config.toml`. Naming a plugin copies the
//! plugin's source tree (minus its bundled `_controllers/` and `_filters/`,
//! which are loaded from the plugin itself) and enables the plugin in the
//! generated config.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;
use walkdir::WalkDir;

use crate::config::CONFIG_FILENAME;
use crate::extension::Category;
use crate::plugin::{self, PLUGIN_GROUP};
use crate::registry::{LoadError, Loader, Source};

#[derive(Error, Debug)]
pub enum ScaffoldError {
    #[error("{} already exists and is not empty", .0.display())]
    NotEmpty(PathBuf),
    #[error("unknown plugin '{0}'")]
    UnknownPlugin(String),
    #[error("plugin '{0}' ships no site source tree")]
    NoSourceTree(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot walk plugin source tree: {0}")]
    Walk(#[from] walkdir::Error),
    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Create a site in `dir`, optionally seeded from `plugin`.
///
/// Returns the files written, relative to `dir`.
pub fn init_site(dir: &Path, plugin: Option<&str>, loader: &mut Loader) -> Result<Vec<PathBuf>, ScaffoldError> {
    if dir.exists() && fs::read_dir(dir)?.next().is_some() {
        return Err(ScaffoldError::NotEmpty(dir.to_path_buf()));
    }
    fs::create_dir_all(dir)?;

    let mut written = Vec::new();
    if let Some(name) = plugin {
        if plugin::get_by_name(loader, name).is_none() {
            return Err(ScaffoldError::UnknownPlugin(name.to_string()));
        }
        let implementation = loader.import(name, &Source::registered(PLUGIN_GROUP), Category::Plugin)?;
        let src_dir = implementation
            .src_dir
            .clone()
            .ok_or_else(|| ScaffoldError::NoSourceTree(name.to_string()))?;
        written.extend(copy_tree(&src_dir, dir)?);
    }

    fs::write(dir.join(CONFIG_FILENAME), starter_config(plugin))?;
    written.push(PathBuf::from(CONFIG_FILENAME));
    info!("Initialized site in {}", dir.display());
    Ok(written)
}

fn starter_config(plugin: Option<&str>) -> String {
    let mut config = String::from(
        "# sitekiln site configuration\n\
         # Run `sitekiln gen-config` to see every setting with its default.\n\n\
         site.url = \"http://www.example.com\"\n",
    );
    if let Some(name) = plugin {
        config.push_str(&format!("\n[plugins.{name}]\nenabled = true\n"));
    }
    config
}

fn copy_tree(from: &Path, to: &Path) -> Result<Vec<PathBuf>, ScaffoldError> {
    let bundled = [Category::Controller.directory(), Category::Filter.directory()];
    let walker = WalkDir::new(from)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() != 1 || !bundled.iter().any(|d| e.file_name() == *d));

    let mut copied = Vec::new();
    for entry in walker {
        let entry = entry?;
        let rel = entry.path().strip_prefix(from).unwrap_or(entry.path());
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied.push(rel.to_path_buf());
        }
    }
    Ok(copied)
}
