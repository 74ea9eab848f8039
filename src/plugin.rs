//! Plugins: installable bundles of controllers, filters and templates.
//!
//! A plugin is registered in the `sitekiln.plugins` group:
//!
//! ```ignore
//! fn blog() -> Implementation {
//!     Implementation::new(Meta::new("blog").versioned("0.3.0"))
//!         .with_src_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/site_src"))
//!         .on_init(|_ctx, record| { /* ... */ Ok(()) })
//! }
//!
//! inventory::submit! { Registration::new("sitekiln.plugins", "blog", blog) }
//! ```
//!
//! Loading a plugin gives it a record under `plugins.<name>` with its own
//! `controllers` and `filters` namespaces. Those are filled from the
//! `sitekiln.plugins.<name>.controllers` / `.filters` groups and from the
//! `_controllers/` and `_filters/` directories of its source tree. Bundled
//! extensions default to enabled, since installing the plugin is the user's
//! opt-in, but their own declared defaults still apply on top: a bundled
//! extension can turn itself off, never on. The plugin itself starts
//! disabled.
//!
//! When an enabled plugin is initialized, its filters are also exposed in
//! the global `filters` namespace under their own names, unless the site
//! already has a loaded filter there.
//!
//! Plugins have no `run` step. Their controllers do the work.

use thiserror::Error;
use tracing::{debug, info};

use crate::extension::{Category, ExtensionError};
use crate::registry::{LoadError, LoadPolicy, LoadRequest, Loader, Registration, Source};
use crate::runner::{self, RunError};
use crate::site::Context;
use crate::store::{Store, StoreError, Value};

/// Registration group for plugins.
pub const PLUGIN_GROUP: &str = "sitekiln.plugins";

#[derive(Error, Debug)]
pub enum PluginError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Plan(#[from] RunError),
    #[error("cannot find requested plugin '{0}'")]
    Missing(String),
    #[error("plugin '{0}' defines a run hook; plugins run through their controllers")]
    RunHook(String),
    #[error("plugin '{name}' failed to initialize: {source}")]
    Init {
        name: String,
        #[source]
        source: ExtensionError,
    },
}

/// Group holding the extensions `plugin` bundles for `category`.
pub fn bundle_group(plugin: &str, category: Category) -> String {
    format!("{PLUGIN_GROUP}.{plugin}.{}", category.namespace())
}

/// All registered plugins, in registration order.
pub fn iter_plugins(loader: &Loader) -> Vec<Registration> {
    loader.registrations(PLUGIN_GROUP)
}

/// The registered plugin called `name`, if any.
pub fn get_by_name(loader: &Loader, name: &str) -> Option<Registration> {
    iter_plugins(loader).into_iter().find(|r| r.name == name)
}

/// Load every registered plugin and its bundled extensions.
///
/// Returns the plugin names in load order.
pub fn load_plugins(ctx: &Context, loader: &mut Loader) -> Result<Vec<String>, PluginError> {
    let plugins = ctx.plugins();
    let source = Source::registered(PLUGIN_GROUP);
    let names = loader.load_all(
        &LoadRequest::new(Category::Plugin, &plugins, &source),
        LoadPolicy::FailFast,
    )?;

    let enabled = vec![("enabled".to_string(), Value::Bool(true))];
    for name in &names {
        let record = plugins.child(name)?;
        let src_dir = match record.get("mod") {
            Some(Value::Extension(implementation)) => implementation.src_dir.clone(),
            _ => None,
        };
        for category in [Category::Filter, Category::Controller] {
            let namespace = record.child(category.namespace())?;
            let mut sources = vec![Source::Registered(bundle_group(name, category))];
            if let Some(dir) = &src_dir {
                sources.push(Source::Directory(dir.join(category.directory())));
            }
            for source in &sources {
                let request = LoadRequest::new(category, &namespace, source)
                    .with_defaults(&enabled)
                    .scoped(name);
                let loaded = loader.load_all(&request, LoadPolicy::FailFast)?;
                if !loaded.is_empty() {
                    debug!(plugin = %name, ?loaded, "loaded bundled {}s", category);
                }
            }
        }
    }
    Ok(names)
}

/// Make a plugin's filters reachable by bare name.
///
/// A name that is free is taken. A settings-only entry (no `mod`) is folded
/// into the plugin's record and replaced. A loaded filter is left alone.
pub fn expose_filters(global: &Store, plugin_filters: &Store) {
    for (name, value) in plugin_filters.entries() {
        let Value::Store(record) = value else {
            continue;
        };
        match global.get(&name) {
            None => global.insert(name, record),
            Some(Value::Store(existing)) if !existing.contains("mod") => {
                record.merge_from(&existing);
                global.insert(name, record);
            }
            Some(_) => debug!(filter = %name, "keeping site filter over plugin filter"),
        }
    }
}

/// Initialize every enabled plugin, once, in priority order, then expose
/// its filters globally.
pub fn init_plugins(ctx: &Context) -> Result<Vec<String>, PluginError> {
    let mut initialized = Vec::new();
    for entry in runner::plan(&[ctx.config()], Category::Plugin, true)? {
        let implementation = entry
            .implementation
            .ok_or_else(|| PluginError::Missing(entry.name.clone()))?;
        if implementation.has_run() {
            return Err(PluginError::RunHook(entry.name));
        }
        if implementation
            .initialize(ctx, &entry.record)
            .map_err(|source| PluginError::Init {
                name: entry.name.clone(),
                source,
            })?
        {
            info!("Initialized plugin {}", entry.name);
        }
        expose_filters(&ctx.filters(), &entry.record.child(Category::Filter.namespace())?);
        initialized.push(entry.name);
    }
    Ok(initialized)
}
