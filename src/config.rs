//! Site configuration.
//!
//! Configuration is a sequence of dotted assignments applied to the `config`
//! store, in layers:
//!
//! 1. stock defaults ([`stock_config_toml`])
//! 2. defaults contributed by loaded plugins, filters and controllers
//! 3. the user's `_config.toml`
//! 4. command-line overrides (`--set site.url=https://example.com`)
//!
//! Later layers win. Within a file, assignments apply in the order written,
//! and every path is relative to the config root:
//!
//! ```toml
//! site.url = "https://example.com/blog"
//!
//! [controllers.render]
//! enabled = true
//! priority = 40
//! pages = [{ template = "index.html.tera", output = "index.html" }]
//!
//! [filters.markdown]
//! tables = false
//! ```
//!
//! Tables are flattened to their leaves, so a sparse `[filters.markdown]`
//! table only touches the keys it names.
//!
//! After all layers are applied, [`recompile`] compiles
//! `site.file_ignore_patterns` into case-insensitive regular expressions.

use regex::RegexBuilder;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use thiserror::Error;
use tracing::debug;

use crate::site::Context;
use crate::store::{Store, StoreError, Value};
use crate::template::TeraEngine;

/// User configuration filename, looked up in the source directory.
pub const CONFIG_FILENAME: &str = "_config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid ignore pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid override '{0}': expected key=value")]
    InvalidOverride(String),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Flatten a TOML document into ordered `(dotted.path, value)` leaves.
///
/// Arrays (including arrays of tables) are leaves; empty tables vanish.
pub fn assignments(value: toml::Value) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    flatten_into(&mut out, None, value);
    out
}

fn flatten_into(out: &mut Vec<(String, Value)>, prefix: Option<&str>, value: toml::Value) {
    match value {
        toml::Value::Table(table) => {
            for (key, value) in table {
                let path = match prefix {
                    Some(prefix) => format!("{prefix}.{key}"),
                    None => key,
                };
                flatten_into(out, Some(&path), value);
            }
        }
        leaf => {
            if let Some(path) = prefix {
                out.push((path.to_string(), Value::from_toml(leaf)));
            }
        }
    }
}

/// Parse a TOML document into assignments.
pub fn parse_assignments(source: &str) -> Result<Vec<(String, Value)>, ConfigError> {
    let table: toml::Table = toml::from_str(source)?;
    Ok(assignments(toml::Value::Table(table)))
}

/// Apply assignments to `config`, in order.
pub fn apply(config: &Store, assignments: &[(String, Value)]) -> Result<(), ConfigError> {
    for (path, value) in assignments {
        config.set(path.as_str(), value.clone())?;
    }
    Ok(())
}

/// Layer 1: stock settings plus the built-in template engines.
pub fn apply_defaults(ctx: &Context) -> Result<(), ConfigError> {
    apply(&ctx.config(), &parse_assignments(stock_config_toml())?)?;
    let engine = Rc::new(TeraEngine::new());
    ctx.templates()
        .child("engines")?
        .insert("tera", Value::Engine(engine));
    Ok(())
}

/// Layer 3: the user's configuration file.
pub fn load_user_config(config: &Store, path: &Path) -> Result<(), ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    debug!(path = %path.display(), "loading user config");
    let content = fs::read_to_string(path)?;
    apply(config, &parse_assignments(&content)?)
}

/// Parse a `key=value` override. The value is read as a TOML value when it
/// parses as one (`true`, `40`, `["a"]`) and as a plain string otherwise.
pub fn parse_override(raw: &str) -> Result<(String, Value), ConfigError> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| ConfigError::InvalidOverride(raw.to_string()))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ConfigError::InvalidOverride(raw.to_string()));
    }
    let value = value.trim();
    let parsed = toml::from_str::<toml::Table>(&format!("value = {value}"))
        .ok()
        .and_then(|mut table| table.remove("value"))
        .map(Value::from_toml)
        .unwrap_or_else(|| Value::from(value));
    Ok((key.to_string(), parsed))
}

/// Compile `site.file_ignore_patterns` into
/// `site.compiled_file_ignore_patterns`.
///
/// Strings compile case-insensitively; already-compiled patterns pass
/// through unchanged.
pub fn recompile(site: &Store) -> Result<(), ConfigError> {
    let raw = site.list_at("file_ignore_patterns").unwrap_or_default();
    let mut compiled = Vec::with_capacity(raw.len());
    for pattern in raw {
        match pattern {
            Value::Pattern(re) => compiled.push(Value::Pattern(re)),
            Value::Str(source) => {
                let re = RegexBuilder::new(&source)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| ConfigError::Pattern {
                        pattern: source.clone(),
                        source: e,
                    })?;
                compiled.push(Value::Pattern(re));
            }
            other => {
                return Err(ConfigError::Validation(format!(
                    "site.file_ignore_patterns entries must be strings, found {}",
                    other.type_name()
                )));
            }
        }
    }
    site.insert("compiled_file_ignore_patterns", Value::List(compiled));
    Ok(())
}

/// Check the settings the build itself depends on.
pub fn validate(site: &Store) -> Result<(), ConfigError> {
    let url = site
        .str_at("url")
        .ok_or_else(|| ConfigError::Validation("site.url must be a string".into()))?;
    url::Url::parse(&url)
        .map_err(|e| ConfigError::Validation(format!("site.url '{url}' is not a URL: {e}")))?;
    if let Some(value) = site.get("output_dir")
        && value.as_str().is_none_or(str::is_empty)
    {
        return Err(ConfigError::Validation(
            "site.output_dir must be a non-empty string".into(),
        ));
    }
    Ok(())
}

/// Returns the fully-commented stock `_config.toml`.
///
/// Used by `gen-config` and applied as the first configuration layer, so
/// what it prints is exactly what a build starts from.
pub fn stock_config_toml() -> &'static str {
    r##"# sitekiln configuration
# =====================
# Every path is relative to the configuration root. Values below are the
# defaults; override only what you need in your site's _config.toml.

[site]
# Root URL of the deployed site. Its path component decides where under
# the output directory files are written.
url = "http://www.example.com"

# Directory (relative to the source directory) the site is built into.
# Its contents are removed at the start of every build.
output_dir = "_site"

# Regular expressions matched (case-insensitively) against each path,
# written as "./relative/path", from the start of the path. Matching
# files and directories are not copied to the output.
file_ignore_patterns = [
    '.*/_.*',          # underscore-prefixed files and directories
    '.*/#.*',          # emacs autosave files
    '.*~$',            # emacs and vim backups
    '.*/\..*\.swp$',   # vim swap files
    '.*/\.#.*',        # emacs lock files
    '.*/\.git$',
    '.*/\.gitignore$',
    '.*/\.hg$',
    '.*/\.hgignore$',
    '.*/\.bzr$',
    '.*/\.svn$',
    '.*/CVS$',
]

# Warn when two outputs are written to the same location.
overwrite_warning = true

# Hard-link static files into the output instead of copying them.
use_hard_links = false

# Extra variables available in every template.
[site.template_vars]

# Shell commands run around the build, in the source directory.
# [site.hooks]
# pre_build = "npm run css"
# post_build = "echo done"
# build_exception = "echo failed"
# build_finally = "echo finished"

# Controllers and filters are configured under their own names:
#
# [controllers.render]
# enabled = true
# pages = [{ template = "index.html.tera", output = "index.html" }]
#
# [filters.markdown]
# tables = true
"##
}
