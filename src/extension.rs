//! Extension implementations and their per-extension loggers.
//!
//! Controllers, filters and plugins share one shape: an [`Implementation`]
//! carrying descriptive metadata, declared default settings, optional
//! aliases, and up to three hooks:
//!
//! - `init`: called at most once per build, before any `run`
//! - `run`: controllers only, in priority order
//! - `transform`: filters only, text in and text out
//!
//! Every hook receives the build [`Context`] and the extension's own record
//! (the store under `controllers.<name>`, `filters.<name>` or
//! `plugins.<name>`), which is where its settings and logger live.

use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;
use thiserror::Error;
use tracing::Span;

use crate::filter::FilterError;
use crate::site::Context;
use crate::store::{Store, StoreError, Value};
use crate::template::TemplateError;

pub type Hook = Box<dyn Fn(&Context, &Store) -> Result<(), ExtensionError>>;
pub type Transform = Box<dyn Fn(&Context, &Store, &str) -> Result<String, ExtensionError>>;

#[derive(Error, Debug)]
pub enum ExtensionError {
    #[error("{0}")]
    Failed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),
    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),
}

/// The three extension kinds. Each owns a namespace under `config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Controller,
    Filter,
    Plugin,
}

impl Category {
    /// Namespace under `config` holding records of this category.
    pub fn namespace(self) -> &'static str {
        match self {
            Category::Controller => "controllers",
            Category::Filter => "filters",
            Category::Plugin => "plugins",
        }
    }

    /// Directory (relative to a source tree) scanned for manifests.
    pub fn directory(self) -> &'static str {
        match self {
            Category::Controller => "_controllers",
            Category::Filter => "_filters",
            Category::Plugin => "_plugins",
        }
    }

    /// Registration group for compiled-in kinds of this category.
    pub fn group(self) -> &'static str {
        match self {
            Category::Controller => "sitekiln.controllers",
            Category::Filter => "sitekiln.filters",
            Category::Plugin => "sitekiln.plugins",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Controller => "controller",
            Category::Filter => "filter",
            Category::Plugin => "plugin",
        };
        f.write_str(name)
    }
}

/// Descriptive metadata. Manifest `[meta]` tables overlay these fields.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Meta {
    pub name: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub url: Option<String>,
    pub version: Option<String>,
}

impl Meta {
    pub fn new(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn described(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn authored(mut self, author: &str) -> Self {
        self.author = Some(author.to_string());
        self
    }

    pub fn versioned(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    /// Replace every field `other` sets.
    pub fn overlay(&mut self, other: Meta) {
        let Meta {
            name,
            description,
            author,
            url,
            version,
        } = other;
        self.name = name.or(self.name.take());
        self.description = description.or(self.description.take());
        self.author = author.or(self.author.take());
        self.url = url.or(self.url.take());
        self.version = version.or(self.version.take());
    }

    /// Store view, one string entry per field that is set.
    pub fn to_store(&self) -> Store {
        let store = Store::new();
        let fields = [
            ("name", &self.name),
            ("description", &self.description),
            ("author", &self.author),
            ("url", &self.url),
            ("version", &self.version),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                store.insert(key, value.as_str());
            }
        }
        store
    }
}

/// A loaded extension.
///
/// Built once per source identifier and shared (via `Rc`) by every record
/// and alias that refers to it.
pub struct Implementation {
    pub meta: Meta,
    /// Declared default settings, applied in order as dotted assignments.
    pub defaults: Vec<(String, Value)>,
    pub aliases: Vec<String>,
    /// Source tree shipped with a plugin (templates, bundled extensions).
    pub src_dir: Option<PathBuf>,
    init: Option<Hook>,
    run: Option<Hook>,
    transform: Option<Transform>,
}

impl Implementation {
    pub fn new(meta: Meta) -> Self {
        Self {
            meta,
            defaults: Vec::new(),
            aliases: Vec::new(),
            src_dir: None,
            init: None,
            run: None,
            transform: None,
        }
    }

    pub fn with_default(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.defaults.push((key.to_string(), value.into()));
        self
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_string());
        self
    }

    pub fn with_src_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.src_dir = Some(dir.into());
        self
    }

    pub fn on_init(
        mut self,
        hook: impl Fn(&Context, &Store) -> Result<(), ExtensionError> + 'static,
    ) -> Self {
        self.init = Some(Box::new(hook));
        self
    }

    pub fn on_run(
        mut self,
        hook: impl Fn(&Context, &Store) -> Result<(), ExtensionError> + 'static,
    ) -> Self {
        self.run = Some(Box::new(hook));
        self
    }

    pub fn with_transform(
        mut self,
        transform: impl Fn(&Context, &Store, &str) -> Result<String, ExtensionError> + 'static,
    ) -> Self {
        self.transform = Some(Box::new(transform));
        self
    }

    pub fn name(&self) -> &str {
        self.meta.name.as_deref().unwrap_or("unnamed")
    }

    pub fn has_run(&self) -> bool {
        self.run.is_some()
    }

    /// Whether this implementation was initialized during the current build.
    pub fn is_initialized(&self, ctx: &Context) -> bool {
        ctx.is_initialized(self)
    }

    /// Run the init hook unless it already ran during this build.
    ///
    /// Returns `Ok(true)` when this call performed the initialization. An
    /// implementation without an init hook is simply marked initialized. A
    /// failing hook leaves the implementation uninitialized.
    pub fn initialize(self: &Rc<Self>, ctx: &Context, record: &Store) -> Result<bool, ExtensionError> {
        if ctx.is_initialized(self) {
            return Ok(false);
        }
        if let Some(init) = &self.init {
            init(ctx, record)?;
        }
        ctx.mark_initialized(self);
        Ok(true)
    }

    /// Run the run hook. Returns `Ok(false)` when there is none.
    pub fn run(&self, ctx: &Context, record: &Store) -> Result<bool, ExtensionError> {
        match &self.run {
            Some(run) => run(ctx, record).map(|()| true),
            None => Ok(false),
        }
    }

    /// Apply the transform. `None` when this implementation is not a filter.
    pub fn transform(
        &self,
        ctx: &Context,
        record: &Store,
        text: &str,
    ) -> Option<Result<String, ExtensionError>> {
        self.transform
            .as_ref()
            .map(|transform| transform(ctx, record, text))
    }
}

impl fmt::Debug for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Implementation")
            .field("name", &self.name())
            .field("aliases", &self.aliases)
            .field("init", &self.init.is_some())
            .field("run", &self.run.is_some())
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

/// A named logger handed to each extension through its `logger` entry.
///
/// Events are emitted inside a span carrying the logger name, so a
/// subscriber can tell `sitekiln.controllers.blog` apart from
/// `sitekiln.filters.markdown` even though both share this crate's target.
#[derive(Clone, Debug)]
pub struct ExtensionLogger {
    name: String,
    span: Span,
}

impl ExtensionLogger {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let span = tracing::info_span!("extension", logger = %name);
        Self { name, span }
    }

    /// Logger stored on an extension record, if one was attached.
    pub fn of(record: &Store) -> Option<Self> {
        match record.get("logger") {
            Some(Value::Logger(logger)) => Some(logger),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn debug(&self, message: &str) {
        let _entered = self.span.enter();
        tracing::debug!(logger = %self.name, "{message}");
    }

    pub fn info(&self, message: &str) {
        let _entered = self.span.enter();
        tracing::info!(logger = %self.name, "{message}");
    }

    pub fn warn(&self, message: &str) {
        let _entered = self.span.enter();
        tracing::warn!(logger = %self.name, "{message}");
    }

    pub fn error(&self, message: &str) {
        let _entered = self.span.enter();
        tracing::error!(logger = %self.name, "{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::test_context;
    use std::cell::Cell;

    #[test]
    fn initialize_runs_hook_at_most_once() {
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        let implementation = Rc::new(Implementation::new(Meta::new("once")).on_init(move |_, _| {
            counter.set(counter.get() + 1);
            Ok(())
        }));
        let (_tmp, ctx) = test_context();
        let record = Store::new();

        assert!(implementation.initialize(&ctx, &record).unwrap());
        assert!(!implementation.initialize(&ctx, &record).unwrap());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn reset_allows_initializing_again() {
        let implementation = Rc::new(Implementation::new(Meta::new("rebuild")));
        let (_tmp, ctx) = test_context();
        implementation.initialize(&ctx, &Store::new()).unwrap();
        assert!(implementation.is_initialized(&ctx));

        ctx.reset();
        assert!(!implementation.is_initialized(&ctx));
        assert!(implementation.initialize(&ctx, &Store::new()).unwrap());
    }

    #[test]
    fn failing_init_leaves_extension_uninitialized() {
        let implementation = Rc::new(
            Implementation::new(Meta::new("broken"))
                .on_init(|_, _| Err(ExtensionError::Failed("nope".into()))),
        );
        let (_tmp, ctx) = test_context();

        assert!(implementation.initialize(&ctx, &Store::new()).is_err());
        assert!(!implementation.is_initialized(&ctx));
    }

    #[test]
    fn missing_hooks_are_reported() {
        let implementation = Rc::new(Implementation::new(Meta::new("bare")));
        let (_tmp, ctx) = test_context();
        let record = Store::new();

        assert!(implementation.initialize(&ctx, &record).unwrap());
        assert!(!implementation.run(&ctx, &record).unwrap());
        assert!(implementation.transform(&ctx, &record, "x").is_none());
    }

    #[test]
    fn meta_overlay_replaces_only_set_fields() {
        let mut meta = Meta::new("markdown").authored("someone");
        meta.overlay(Meta {
            description: Some("md".into()),
            ..Meta::default()
        });
        assert_eq!(meta.name.as_deref(), Some("markdown"));
        assert_eq!(meta.author.as_deref(), Some("someone"));
        assert_eq!(meta.description.as_deref(), Some("md"));
    }

    #[test]
    fn meta_to_store_skips_unset_fields() {
        let store = Meta::new("x").versioned("1.0").to_store();
        assert_eq!(store.keys(), vec!["name", "version"]);
    }

    #[test]
    fn logger_is_found_on_record() {
        let record = Store::new();
        record.insert("logger", Value::Logger(ExtensionLogger::new("sitekiln.filters.x")));
        let logger = ExtensionLogger::of(&record).unwrap();
        assert_eq!(logger.name(), "sitekiln.filters.x");
        logger.info("hello");
    }
}
