//! Template engines and output materialization.
//!
//! Engines are registered in `templates.engines`, keyed by the template
//! filename suffix they handle (`tera` handles `index.html.tera`). Given a
//! template name, [`materialize_template`] picks the engine whose key the
//! name ends with, renders it with the caller's bindings plus
//! `site.template_vars`, and writes the bytes under the output directory.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;
use tera::Tera;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::site::Context;
use crate::store::{Record, Store, StoreError, Value};

/// Directory, relative to the source tree, holding shared base templates.
pub const BASE_TEMPLATE_DIR: &str = "_templates";

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("no template engine registered for '{0}'")]
    UnknownEngine(String),
    #[error("template not found: {0}")]
    NotFound(String),
    #[error("cannot render '{name}': {source}")]
    Render {
        name: String,
        #[source]
        source: tera::Error,
    },
    #[error("output location leaves the output directory: {0}")]
    OutsideOutput(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// A template language.
pub trait TemplateEngine {
    /// Filename suffix this engine is registered under.
    fn name(&self) -> &str;

    /// Render `template` (a path relative to the source tree) to bytes.
    fn render(&self, ctx: &Context, template: &str, bindings: &Record) -> Result<Vec<u8>, TemplateError>;
}

/// Jinja-style templates via Tera.
///
/// Every file under `_templates/` is registered first, so page templates can
/// `{% extends "base.html.tera" %}` or `{% include %}` them by relative name.
#[derive(Debug, Default)]
pub struct TeraEngine;

impl TeraEngine {
    pub fn new() -> Self {
        Self
    }

    fn base_templates(src_dir: &Path) -> Vec<(PathBuf, Option<String>)> {
        let base = src_dir.join(BASE_TEMPLATE_DIR);
        if !base.is_dir() {
            return Vec::new();
        }
        WalkDir::new(&base)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let rel = e.path().strip_prefix(&base).ok()?;
                let name = rel.to_string_lossy().replace('\\', "/");
                Some((e.path().to_path_buf(), Some(name)))
            })
            .collect()
    }
}

impl TemplateEngine for TeraEngine {
    fn name(&self) -> &str {
        "tera"
    }

    fn render(&self, ctx: &Context, template: &str, bindings: &Record) -> Result<Vec<u8>, TemplateError> {
        let render_error = |source| TemplateError::Render {
            name: template.to_string(),
            source,
        };
        let mut tera = Tera::default();
        tera.add_template_files(Self::base_templates(ctx.src_dir()))
            .map_err(render_error)?;

        let path = ctx.src_dir().join(template);
        if path.is_file() {
            let source = fs::read_to_string(&path)?;
            tera.add_raw_template(template, &source)
                .map_err(render_error)?;
        } else if !tera.get_template_names().any(|name| name == template) {
            return Err(TemplateError::NotFound(template.to_string()));
        }

        let context = tera::Context::from_value(bindings.to_json()).map_err(render_error)?;
        let rendered = tera.render(template, &context).map_err(render_error)?;
        Ok(rendered.into_bytes())
    }
}

/// Find the engine registered for `template_name` in `templates.engines`.
pub fn find_engine(templates: &Store, template_name: &str) -> Result<Rc<dyn TemplateEngine>, TemplateError> {
    let engines = match templates.get("engines") {
        Some(Value::Store(engines)) => engines.entries(),
        _ => Vec::new(),
    };
    engines
        .into_iter()
        .find_map(|(suffix, value)| match value {
            Value::Engine(engine) if template_name.ends_with(suffix.as_str()) => Some(engine),
            _ => None,
        })
        .ok_or_else(|| TemplateError::UnknownEngine(template_name.to_string()))
}

/// Render `template_name` and write it to `location` under the output
/// directory. Returns the written path.
///
/// `site.template_vars` fill in any binding the caller did not supply, and
/// `bf` exposes the whole build context. While rendering, the bindings are
/// also visible to extensions under `bf.template_context`.
pub fn materialize_template(
    ctx: &Context,
    template_name: &str,
    location: &str,
    attrs: Record,
) -> Result<PathBuf, TemplateError> {
    let engine = find_engine(&ctx.templates(), template_name)?;
    let bindings = render_prep(ctx, template_name, attrs)?;
    let rendered = engine.render(ctx, template_name, &bindings);
    ctx.bf().remove("template_context");
    let path = write_output(ctx, location, &rendered?)?;
    debug!(template = template_name, output = %path.display(), "materialized template");
    Ok(path)
}

fn render_prep(ctx: &Context, template_name: &str, mut bindings: Record) -> Result<Record, TemplateError> {
    if let Some(Value::Store(vars)) = ctx.site().get("template_vars") {
        for (name, value) in vars.entries() {
            if !bindings.contains(&name) {
                bindings.set(name, value);
            }
        }
    }
    let template_context = Store::new();
    for (name, value) in bindings.iter() {
        template_context.insert(name.as_str(), value.clone());
    }
    template_context.insert("template_name", template_name);
    ctx.bf().insert("template_context", template_context);
    bindings.set("bf", ctx.bf().clone());
    Ok(bindings)
}

/// Write `bytes` to `location` under the output directory, creating parents.
///
/// A leading `/` is relative to the output directory; `..` segments are
/// rejected.
pub fn write_output(ctx: &Context, location: &str, bytes: &[u8]) -> Result<PathBuf, TemplateError> {
    let relative = Path::new(location.trim_start_matches('/'));
    if !relative
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
    {
        return Err(TemplateError::OutsideOutput(location.to_string()));
    }
    let path = ctx.output_dir().join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if path.exists() && ctx.site().bool_at("overwrite_warning").unwrap_or(true) {
        warn!("Location is used more than once: {}", location);
    }
    fs::write(&path, bytes)?;
    Ok(path)
}
