//! Build context and orchestration.
//!
//! A [`Context`] owns the root store (`bf`) every hook and template sees:
//!
//! ```text
//! bf
//! ├── config
//! │   ├── site          ─┐
//! │   ├── controllers    │ the same stores are also
//! │   ├── filters        │ attached directly under bf
//! │   ├── plugins        │ (bf.site is bf.config.site)
//! │   └── templates     ─┘
//! └── version
//! ```
//!
//! [`Site`] drives a build through two phases.
//!
//! **load**: reset the context, apply stock defaults, load the built-in
//! filter and controller kinds, load plugins (and their bundled
//! extensions), load the site's own `_filters/` and `_controllers/`, apply
//! the user's `_config.toml` and any overrides, then compile ignore
//! patterns.
//!
//! **build**: `pre_build` hook, then (clear output, init plugins, init
//! filters, init and run controllers, write files, `post_build`); if any of
//! that fails the `build_exception` hook sees the error before it
//! propagates; `build_finally` always runs last.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::{self, ConfigError, CONFIG_FILENAME};
use crate::controller;
use crate::extension::{Category, Implementation};
use crate::filter::{self, FilterError};
use crate::plugin::{self, PluginError};
use crate::registry::{LoadError, LoadPolicy, LoadRequest, Loader, Source};
use crate::runner::{RunError, Runner};
use crate::store::{Record, Store, Value};
use crate::template::{self, TemplateError};
use crate::util::fs_site_path_helper;
use crate::writer::{self, WriteError, WriteSummary};

/// Namespaces attached both under `config` and directly under the root.
pub const NAMESPACES: &[&str] = &["site", "controllers", "filters", "plugins", "templates"];

const DEFAULT_OUTPUT_DIR: &str = "_site";

#[derive(Error, Debug)]
pub enum SiteError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Hook(#[from] HookError),
}

#[derive(Error, Debug)]
pub enum HookError {
    #[error("{hook} hook failed: {reason}")]
    Failed { hook: &'static str, reason: String },
    #[error("cannot start {hook} hook: {source}")]
    Spawn {
        hook: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Shared build state handed to every hook, filter and template.
#[derive(Debug)]
pub struct Context {
    bf: Store,
    config: Store,
    namespaces: Vec<Store>,
    initialized: RefCell<Vec<Rc<Implementation>>>,
    src_dir: PathBuf,
}

impl Context {
    /// Fresh context with empty namespaces rooted at `src_dir`.
    pub fn new(src_dir: impl Into<PathBuf>) -> Self {
        let ctx = Self {
            bf: Store::new(),
            config: Store::new(),
            namespaces: NAMESPACES.iter().map(|_| Store::new()).collect(),
            initialized: RefCell::new(Vec::new()),
            src_dir: src_dir.into(),
        };
        ctx.reset();
        ctx
    }

    /// Discard all state and re-attach empty namespaces.
    pub fn reset(&self) {
        self.initialized.borrow_mut().clear();
        self.bf.clear();
        self.config.clear();
        for (name, namespace) in NAMESPACES.iter().zip(&self.namespaces) {
            namespace.clear();
            self.config.insert(*name, namespace.clone());
            self.bf.insert(*name, namespace.clone());
        }
        self.bf.insert("config", self.config.clone());
        self.bf.insert("version", env!("CARGO_PKG_VERSION"));
    }

    /// Whether `implementation` was initialized since the last reset.
    pub fn is_initialized(&self, implementation: &Implementation) -> bool {
        self.initialized
            .borrow()
            .iter()
            .any(|done| std::ptr::eq(done.as_ref(), implementation))
    }

    pub(crate) fn mark_initialized(&self, implementation: &Rc<Implementation>) {
        self.initialized.borrow_mut().push(Rc::clone(implementation));
    }

    /// The root store.
    pub fn bf(&self) -> &Store {
        &self.bf
    }

    pub fn config(&self) -> Store {
        self.config.clone()
    }

    pub fn site(&self) -> Store {
        self.namespace(0)
    }

    pub fn controllers(&self) -> Store {
        self.namespace(1)
    }

    pub fn filters(&self) -> Store {
        self.namespace(2)
    }

    pub fn plugins(&self) -> Store {
        self.namespace(3)
    }

    pub fn templates(&self) -> Store {
        self.namespace(4)
    }

    fn namespace(&self, index: usize) -> Store {
        self.namespaces[index].clone()
    }

    pub fn src_dir(&self) -> &Path {
        &self.src_dir
    }

    /// `site.output_dir` under the source directory, plus the site URL's
    /// path so `http://host/~me/blog` builds into `_site/~me/blog`.
    pub fn output_dir(&self) -> PathBuf {
        let site = self.site();
        let base = site
            .str_at("output_dir")
            .unwrap_or_else(|| DEFAULT_OUTPUT_DIR.to_string());
        let url = site.str_at("url").unwrap_or_default();
        self.src_dir.join(base).join(fs_site_path_helper(&url, &[]))
    }

    /// Apply a filter chain to `content`.
    pub fn run_chain(&self, chain: &str, content: &str) -> Result<String, FilterError> {
        filter::run_chain(self, chain, content)
    }

    /// Render `template_name` into `location` under the output directory.
    pub fn materialize_template(
        &self,
        template_name: &str,
        location: &str,
        attrs: Record,
    ) -> Result<PathBuf, TemplateError> {
        template::materialize_template(self, template_name, location, attrs)
    }
}

/// Callbacks around a build.
pub trait BuildHooks {
    fn pre_build(&self, _ctx: &Context) -> Result<(), HookError> {
        Ok(())
    }

    fn post_build(&self, _ctx: &Context) -> Result<(), HookError> {
        Ok(())
    }

    /// Sees any error raised after `pre_build`; the error still propagates.
    fn build_exception(&self, _ctx: &Context, _error: &SiteError) {}

    /// Always runs, after everything else.
    fn build_finally(&self, _ctx: &Context) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default)]
pub struct NoHooks;

impl BuildHooks for NoHooks {}

/// Hooks configured as shell commands under `site.hooks`.
///
/// Each command runs with `sh -c` in the source directory. A failing
/// `pre_build` or `post_build` fails the build; failures of the other two
/// are logged.
#[derive(Debug, Default)]
pub struct CommandHooks;

impl CommandHooks {
    fn run(ctx: &Context, hook: &'static str) -> Result<(), HookError> {
        let Some(command) = ctx.site().str_at(&format!("hooks.{hook}")) else {
            return Ok(());
        };
        info!("Running {hook} hook: {command}");
        let status = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(ctx.src_dir())
            .status()
            .map_err(|source| HookError::Spawn { hook, source })?;
        if status.success() {
            Ok(())
        } else {
            Err(HookError::Failed {
                hook,
                reason: format!("`{command}` exited with {status}"),
            })
        }
    }
}

impl BuildHooks for CommandHooks {
    fn pre_build(&self, ctx: &Context) -> Result<(), HookError> {
        Self::run(ctx, "pre_build")
    }

    fn post_build(&self, ctx: &Context) -> Result<(), HookError> {
        Self::run(ctx, "post_build")
    }

    fn build_exception(&self, ctx: &Context, _error: &SiteError) {
        if let Err(e) = Self::run(ctx, "build_exception") {
            error!("{e}");
        }
    }

    fn build_finally(&self, ctx: &Context) {
        if let Err(e) = Self::run(ctx, "build_finally") {
            error!("{e}");
        }
    }
}

/// Result of a successful build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildSummary {
    pub output_dir: PathBuf,
    pub plugins: Vec<String>,
    pub filters_initialized: usize,
    pub controllers: Vec<String>,
    pub written: WriteSummary,
}

/// A site rooted at a source directory.
pub struct Site {
    ctx: Context,
    loader: Loader,
    overrides: Vec<(String, Value)>,
    hooks: Box<dyn BuildHooks>,
    policy: LoadPolicy,
}

impl Site {
    pub fn new(src_dir: impl Into<PathBuf>) -> Self {
        Self::with_loader(src_dir, Loader::new())
    }

    pub fn with_loader(src_dir: impl Into<PathBuf>, loader: Loader) -> Self {
        Self {
            ctx: Context::new(src_dir),
            loader,
            overrides: Vec::new(),
            hooks: Box::new(CommandHooks),
            policy: LoadPolicy::FailFast,
        }
    }

    /// Assignments applied after the user's configuration file.
    pub fn with_overrides(mut self, overrides: Vec<(String, Value)>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_hooks(mut self, hooks: impl BuildHooks + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    pub fn with_policy(mut self, policy: LoadPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    pub fn loader_mut(&mut self) -> &mut Loader {
        &mut self.loader
    }

    /// Path of the user configuration file in the source directory.
    pub fn config_path(&self) -> PathBuf {
        self.ctx.src_dir().join(CONFIG_FILENAME)
    }

    /// Load using the source directory's `_config.toml`, which must exist.
    pub fn load_default(&mut self) -> Result<(), SiteError> {
        let path = self.config_path();
        self.load(Some(&path))
    }

    /// Reset all state and load configuration and extensions.
    pub fn load(&mut self, config_path: Option<&Path>) -> Result<(), SiteError> {
        self.ctx.reset();
        config::apply_defaults(&self.ctx)?;

        for category in [Category::Filter, Category::Controller] {
            let namespace = self
                .ctx
                .config()
                .child(category.namespace())
                .map_err(ConfigError::from)?;
            let source = Source::registered(category.group());
            let request = LoadRequest::new(category, &namespace, &source);
            self.loader.load_all(&request, self.policy)?;
        }

        let plugins = plugin::load_plugins(&self.ctx, &mut self.loader)?;
        debug!(?plugins, "loaded plugins");

        for category in [Category::Filter, Category::Controller] {
            let namespace = self
                .ctx
                .config()
                .child(category.namespace())
                .map_err(ConfigError::from)?;
            let source = Source::Directory(self.ctx.src_dir().join(category.directory()));
            let request = LoadRequest::new(category, &namespace, &source);
            let loaded = self.loader.load_all(&request, self.policy)?;
            debug!(?loaded, "loaded site {}s", category);
        }

        if let Some(path) = config_path {
            config::load_user_config(&self.ctx.config(), path)?;
        }
        config::apply(&self.ctx.config(), &self.overrides)?;
        config::recompile(&self.ctx.site())?;
        config::validate(&self.ctx.site())?;
        info!("Loaded configuration for {}", self.ctx.src_dir().display());
        Ok(())
    }

    /// Build the loaded site.
    pub fn build(&mut self) -> Result<BuildSummary, SiteError> {
        self.hooks.pre_build(&self.ctx)?;
        let result = self.write_site().and_then(|summary| {
            self.hooks.post_build(&self.ctx)?;
            Ok(summary)
        });
        if let Err(e) = &result {
            error!("build failed: {e}");
            self.hooks.build_exception(&self.ctx, e);
        }
        self.hooks.build_finally(&self.ctx);
        result
    }

    fn write_site(&self) -> Result<BuildSummary, SiteError> {
        let output_dir = self.ctx.output_dir();
        writer::prepare_output_dir(&output_dir)?;

        let plugins = plugin::init_plugins(&self.ctx)?;
        let filters_initialized = filter::init_filters(&self.ctx)?;

        let mut runner = Runner::new(&controller::namespaces(&self.ctx), Category::Controller)?;
        runner.init_all(&self.ctx)?;
        runner.run_all(&self.ctx)?;
        let controllers = runner.names().into_iter().map(str::to_string).collect();

        let written = writer::write_files(&self.ctx)?;
        info!(
            "Wrote {} rendered and {} copied files to {}",
            written.rendered,
            written.copied,
            output_dir.display()
        );
        Ok(BuildSummary {
            output_dir,
            plugins,
            filters_initialized,
            controllers,
            written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::write_file;
    use tempfile::TempDir;

    #[test]
    fn namespaces_are_shared_between_root_and_config() {
        let ctx = Context::new("/tmp/site");
        let via_config = ctx.bf().get_path("config.site").unwrap();
        let via_root = ctx.bf().get("site").unwrap();
        assert_eq!(via_config, via_root);
        assert!(ctx.site().ptr_eq(via_root.as_store().unwrap()));
    }

    #[test]
    fn reset_clears_state() {
        let ctx = Context::new("/tmp/site");
        ctx.site().set("url", "http://x").unwrap();
        ctx.bf().insert("extra", 1);
        ctx.reset();
        assert!(ctx.site().is_empty());
        assert!(!ctx.bf().contains("extra"));
        assert!(ctx.bf().contains("config"));
    }

    #[test]
    fn output_dir_follows_url_path() {
        let ctx = Context::new("/src");
        ctx.site().set("url", "http://example.com/~me/blog").unwrap();
        assert_eq!(ctx.output_dir(), PathBuf::from("/src/_site/~me/blog"));
        ctx.site().set("output_dir", "public").unwrap();
        assert_eq!(ctx.output_dir(), PathBuf::from("/src/public/~me/blog"));
    }

    #[test]
    fn load_without_config_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let mut site = Site::new(tmp.path()).with_hooks(NoHooks);
        site.load(None).unwrap();
        assert!(site.context().site().list_at("compiled_file_ignore_patterns").is_some());
    }

    #[test]
    fn builtin_kinds_are_loaded_but_controllers_stay_disabled() {
        let tmp = TempDir::new().unwrap();
        let mut site = Site::new(tmp.path()).with_hooks(NoHooks);
        site.load(None).unwrap();
        let ctx = site.context();
        assert_eq!(ctx.run_chain("md", "*hi*").unwrap(), "<p><em>hi</em></p>\n");
        assert_eq!(ctx.controllers().bool_at("render.enabled"), Some(false));

        let summary = site.build().unwrap();
        assert!(summary.controllers.is_empty());
    }

    #[test]
    fn load_default_requires_config_file() {
        let tmp = TempDir::new().unwrap();
        let mut site = Site::new(tmp.path());
        let err = site.load_default().unwrap_err();
        assert!(matches!(err, SiteError::Config(ConfigError::NotFound(_))));
    }

    #[test]
    fn overrides_beat_user_config() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), CONFIG_FILENAME, "site.url = \"http://user.example\"\n");
        let mut site = Site::new(tmp.path())
            .with_overrides(vec![("site.url".into(), Value::from("http://override.example"))]);
        site.load_default().unwrap();
        assert_eq!(
            site.context().site().str_at("url").as_deref(),
            Some("http://override.example")
        );
    }

    struct Recorder(Rc<RefCell<Vec<String>>>);

    impl BuildHooks for Recorder {
        fn pre_build(&self, _ctx: &Context) -> Result<(), HookError> {
            self.0.borrow_mut().push("pre".into());
            Ok(())
        }
        fn post_build(&self, _ctx: &Context) -> Result<(), HookError> {
            self.0.borrow_mut().push("post".into());
            Ok(())
        }
        fn build_exception(&self, _ctx: &Context, error: &SiteError) {
            self.0.borrow_mut().push(format!("exception: {error}"));
        }
        fn build_finally(&self, _ctx: &Context) {
            self.0.borrow_mut().push("finally".into());
        }
    }

    #[test]
    fn successful_build_runs_hooks_in_order() {
        let tmp = TempDir::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut site = Site::new(tmp.path()).with_hooks(Recorder(Rc::clone(&log)));
        site.load(None).unwrap();
        site.build().unwrap();
        assert_eq!(*log.borrow(), vec!["pre", "post", "finally"]);
    }

    #[test]
    fn failing_build_reports_exception_then_finally() {
        let tmp = TempDir::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut site = Site::new(tmp.path()).with_hooks(Recorder(Rc::clone(&log)));
        site.load(None).unwrap();
        site.context().controllers().set("ghost.enabled", true).unwrap();

        let err = site.build().unwrap_err();
        assert!(matches!(err, SiteError::Run(RunError::MissingImplementation { .. })));
        let log = log.borrow();
        assert_eq!(log.len(), 3);
        assert!(log[1].starts_with("exception: "));
        assert_eq!(log[2], "finally");
    }

    #[test]
    fn command_hooks_run_in_source_dir() {
        let tmp = TempDir::new().unwrap();
        write_file(
            tmp.path(),
            CONFIG_FILENAME,
            "[site.hooks]\npre_build = \"touch pre_build_ran\"\nbuild_finally = \"exit 3\"\n",
        );
        let mut site = Site::new(tmp.path());
        site.load_default().unwrap();
        site.build().unwrap();
        assert!(tmp.path().join("pre_build_ran").exists());
    }

    #[test]
    fn failing_pre_build_command_aborts() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), CONFIG_FILENAME, "site.hooks.pre_build = \"exit 1\"\n");
        let mut site = Site::new(tmp.path());
        site.load_default().unwrap();
        let err = site.build().unwrap_err();
        assert!(matches!(err, SiteError::Hook(HookError::Failed { hook: "pre_build", .. })));
        assert!(!site.context().output_dir().exists());
    }
}
