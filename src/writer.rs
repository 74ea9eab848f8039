//! Output directory preparation and the source-tree walk.
//!
//! After controllers have run, every file of the source tree that no ignore
//! pattern matches lands in the output directory: template files (names
//! ending in a registered engine suffix, such as `about.html.tera`) are
//! rendered with the suffix stripped, everything else is copied or
//! hard-linked.

use regex::Regex;
use std::cell::Cell;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::site::Context;
use crate::store::{Record, Store, Value};
use crate::template::{self, TemplateError};
use crate::util::{pattern_path, should_ignore_path};

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot walk source tree: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),
    #[error("invalid template engine suffix: {0}")]
    Suffix(#[from] regex::Error),
}

/// What a source-tree walk produced.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    pub rendered: usize,
    pub copied: usize,
    pub ignored: usize,
}

/// Empty `output_dir`, keeping the directory itself, or create it.
pub fn prepare_output_dir(output_dir: &Path) -> Result<(), WriteError> {
    if !output_dir.exists() {
        fs::create_dir_all(output_dir)?;
        return Ok(());
    }
    for entry in fs::read_dir(output_dir)? {
        let path = entry?.path();
        if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Regex matching the registered template engine suffixes at the end of a
/// filename, or `None` when no engine is registered.
pub fn template_file_regex(templates: &Store) -> Result<Option<Regex>, WriteError> {
    let suffixes: Vec<String> = match templates.get("engines") {
        Some(Value::Store(engines)) => engines
            .keys()
            .iter()
            .map(|suffix| regex::escape(&format!(".{suffix}")))
            .collect(),
        _ => Vec::new(),
    };
    if suffixes.is_empty() {
        return Ok(None);
    }
    Ok(Some(Regex::new(&format!("({})$", suffixes.join("|")))?))
}

/// Render or copy every non-ignored file under the source directory.
pub fn write_files(ctx: &Context) -> Result<WriteSummary, WriteError> {
    let src_dir = ctx.src_dir();
    let output_dir = ctx.output_dir();
    let template_regex = template_file_regex(&ctx.templates())?;
    let patterns = ctx
        .site()
        .list_at("compiled_file_ignore_patterns")
        .unwrap_or_default();
    let hard_links = ctx.site().bool_at("use_hard_links").unwrap_or(false);
    let ignored = Cell::new(0);

    let walker = WalkDir::new(src_dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            // the output dir and every directory leading to it
            if output_dir.starts_with(entry.path()) {
                return false;
            }
            let path = pattern_path(src_dir, entry.path());
            if should_ignore_path(&patterns, &path) {
                debug!("Ignoring {path}");
                ignored.set(ignored.get() + 1);
                return false;
            }
            true
        });

    let mut summary = WriteSummary::default();
    for entry in walker {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src_dir).unwrap_or(entry.path());
        let target = output_dir.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }

        let file_name = entry.file_name().to_string_lossy();
        if let Some(re) = &template_regex
            && re.is_match(&file_name)
        {
            let template_name = slash_path(rel);
            let output_name = re.replace(&file_name, "").into_owned();
            let location = slash_path(&rel.with_file_name(output_name));
            debug!(template = %template_name, output = %location, "rendering template file");
            template::materialize_template(ctx, &template_name, &location, Record::new())?;
            summary.rendered += 1;
        } else {
            copy_file(ctx, entry.path(), &target, hard_links)?;
            summary.copied += 1;
        }
    }
    summary.ignored = ignored.get();
    Ok(summary)
}

fn copy_file(ctx: &Context, from: &Path, to: &Path, hard_link: bool) -> Result<(), WriteError> {
    if to.exists() {
        if ctx.site().bool_at("overwrite_warning").unwrap_or(true) {
            warn!("Location is used more than once: {}", to.display());
        }
        fs::remove_file(to)?;
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if hard_link {
        fs::hard_link(from, to)?;
    } else {
        fs::copy(from, to)?;
    }
    Ok(())
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
