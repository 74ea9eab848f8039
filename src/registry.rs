//! Extension discovery, loading and settings merge.
//!
//! Extensions come from two kinds of [`Source`]:
//!
//! - a **directory** of TOML manifests (`_controllers/`, `_filters/`, or the
//!   same directories inside a plugin's source tree). Each `<name>.toml`
//!   file, or `<name>/extension.toml` package, binds the name to a
//!   compiled-in *kind* and may override its metadata and defaults:
//!
//!   ```toml
//!   kind = "markdown"          # defaults to the manifest's own name
//!   aliases = ["md"]
//!
//!   [meta]
//!   description = "Markdown to HTML"
//!
//!   [config]
//!   tables = false
//!   ```
//!
//! - a **registration group** populated through [`inventory`]. Crates linked
//!   into the binary contribute plugins and bundled extensions with
//!   `inventory::submit!`, which is how third-party code gets discovered
//!   without the site naming it.
//!
//! Loading an extension attaches a fresh record to the target namespace and
//! fills it in layers (see [`merge_settings`]). Each source identifier is
//! imported at most once per [`Loader`]; later loads reuse the same
//! [`Implementation`].

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config;
use crate::extension::{Category, ExtensionLogger, Implementation, Meta};
use crate::store::{Store, StoreError, Value};
use crate::{controller, filter};

/// Manifest filename inside a package directory.
pub const PACKAGE_MANIFEST: &str = "extension.toml";

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("cannot read {category} '{name}': {source}")]
    Io {
        category: Category,
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid manifest for {category} '{name}': {source}")]
    Manifest {
        category: Category,
        name: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("{category} '{name}' names unknown kind '{kind}'")]
    UnknownKind {
        category: Category,
        name: String,
        kind: String,
    },
    #[error("no extension '{name}' registered in group '{group}'")]
    NotRegistered { group: String, name: String },
    #[error("cannot configure {category} '{name}': {source}")]
    Store {
        category: Category,
        name: String,
        #[source]
        source: StoreError,
    },
}

/// A compiled-in extension, discoverable by group.
#[derive(Debug, Clone, Copy)]
pub struct Registration {
    pub group: &'static str,
    pub name: &'static str,
    pub build: fn() -> Implementation,
}

impl Registration {
    pub const fn new(group: &'static str, name: &'static str, build: fn() -> Implementation) -> Self {
        Self { group, name, build }
    }
}

inventory::collect!(Registration);

/// Where to look for extensions.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Directory(PathBuf),
    Registered(String),
}

impl Source {
    pub fn registered(group: impl Into<String>) -> Self {
        Source::Registered(group.into())
    }

    /// Identifier of `name` within this source, used for import memoization.
    pub fn identifier(&self, name: &str) -> String {
        match self {
            Source::Directory(dir) => format!("{}/{name}", dir.display()),
            Source::Registered(group) => format!("{group}:{name}"),
        }
    }
}

/// What to do when one extension in a batch fails to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadPolicy {
    #[default]
    FailFast,
    SkipBroken,
}

/// Parameters shared by every load into one namespace.
#[derive(Debug, Clone)]
pub struct LoadRequest<'a> {
    pub category: Category,
    pub namespace: &'a Store,
    pub source: &'a Source,
    /// Caller-supplied defaults, applied after the registry defaults.
    pub defaults: &'a [(String, Value)],
    /// Skip the implementation's declared defaults, leaving the record to
    /// the registry and caller layers.
    pub is_plugin_extension: bool,
    /// Owning plugin, folded into the logger name.
    pub scope: Option<&'a str>,
}

impl<'a> LoadRequest<'a> {
    pub fn new(category: Category, namespace: &'a Store, source: &'a Source) -> Self {
        Self {
            category,
            namespace,
            source,
            defaults: &[],
            is_plugin_extension: false,
            scope: None,
        }
    }

    pub fn with_defaults(mut self, defaults: &'a [(String, Value)]) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn plugin_extension(mut self) -> Self {
        self.is_plugin_extension = true;
        self
    }

    pub fn scoped(mut self, plugin: &'a str) -> Self {
        self.scope = Some(plugin);
        self
    }

    fn logger_name(&self, name: &str) -> String {
        match self.scope {
            Some(plugin) => format!(
                "sitekiln.plugins.{plugin}.{}.{name}",
                self.category.namespace()
            ),
            None => format!("sitekiln.{}.{name}", self.category.namespace()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Manifest {
    kind: Option<String>,
    aliases: Vec<String>,
    meta: Meta,
    config: toml::Table,
}

impl Manifest {
    /// Locate `<name>.toml` or `<name>/extension.toml` under `dir`.
    fn locate(dir: &Path, name: &str) -> Option<(PathBuf, Option<PathBuf>)> {
        let file = dir.join(format!("{name}.toml"));
        if file.is_file() {
            return Some((file, None));
        }
        let package = dir.join(name);
        let manifest = package.join(PACKAGE_MANIFEST);
        manifest.is_file().then_some((manifest, Some(package)))
    }

    fn apply(self, mut implementation: Implementation) -> Implementation {
        implementation.meta.overlay(self.meta);
        implementation
            .defaults
            .extend(config::assignments(toml::Value::Table(self.config)));
        implementation.aliases.extend(self.aliases);
        implementation
    }
}

/// Extensions shipped with the crate.
fn builtin_registrations() -> Vec<Registration> {
    vec![
        Registration::new(Category::Filter.group(), "markdown", filter::markdown),
        Registration::new(Category::Filter.group(), "html_escape", filter::html_escape),
        Registration::new(Category::Controller.group(), "render", controller::render),
    ]
}

/// Imports extensions and attaches them to namespaces.
pub struct Loader {
    catalog: Vec<Registration>,
    imported: HashMap<String, Rc<Implementation>>,
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader {
    /// Loader knowing the built-in kinds plus everything submitted to
    /// the [`Registration`] inventory.
    pub fn new() -> Self {
        let mut catalog = builtin_registrations();
        catalog.extend(inventory::iter::<Registration>.into_iter().copied());
        Self {
            catalog,
            imported: HashMap::new(),
        }
    }

    /// Add a registration. It shadows earlier ones with the same group and name.
    pub fn register(&mut self, registration: Registration) {
        self.catalog.push(registration);
    }

    /// Registrations in `group`, first-registered order, shadowed ones removed.
    pub fn registrations(&self, group: &str) -> Vec<Registration> {
        let mut names: Vec<&str> = Vec::new();
        for registration in self.catalog.iter().filter(|r| r.group == group) {
            if !names.contains(&registration.name) {
                names.push(registration.name);
            }
        }
        names
            .into_iter()
            .filter_map(|name| self.find(group, name))
            .collect()
    }

    fn find(&self, group: &str, name: &str) -> Option<Registration> {
        self.catalog
            .iter()
            .rev()
            .find(|r| r.group == group && r.name == name)
            .copied()
    }

    /// Whether `identifier` has already been imported.
    pub fn is_imported(&self, identifier: &str) -> bool {
        self.imported.contains_key(identifier)
    }

    /// Names available in `source`, in discovery order.
    ///
    /// Directory order is whatever the filesystem reports. A missing
    /// directory yields nothing.
    pub fn discover(&self, source: &Source, category: Category) -> Result<Vec<String>, LoadError> {
        match source {
            Source::Registered(group) => Ok(self
                .registrations(group)
                .into_iter()
                .map(|r| r.name.to_string())
                .collect()),
            Source::Directory(dir) => {
                if !dir.is_dir() {
                    return Ok(Vec::new());
                }
                let io_error = |source| LoadError::Io {
                    category,
                    name: dir.display().to_string(),
                    source,
                };
                let mut names = Vec::new();
                for entry in fs::read_dir(dir).map_err(io_error)? {
                    let path = entry.map_err(io_error)?.path();
                    let Some(name) = discovered_name(&path) else {
                        continue;
                    };
                    names.push(name);
                }
                Ok(names)
            }
        }
    }

    /// Import `name` from `source` without attaching it anywhere.
    ///
    /// The first import of an identifier builds the implementation; every
    /// later call returns the same shared instance.
    pub fn import(
        &mut self,
        name: &str,
        source: &Source,
        category: Category,
    ) -> Result<Rc<Implementation>, LoadError> {
        let identifier = source.identifier(name);
        if let Some(existing) = self.imported.get(&identifier) {
            debug!(extension = %identifier, "already imported");
            return Ok(Rc::clone(existing));
        }
        let implementation = Rc::new(self.build(name, source, category)?);
        self.imported.insert(identifier, Rc::clone(&implementation));
        Ok(implementation)
    }

    fn build(&self, name: &str, source: &Source, category: Category) -> Result<Implementation, LoadError> {
        match source {
            Source::Registered(group) => {
                let registration = self.find(group, name).ok_or_else(|| LoadError::NotRegistered {
                    group: group.clone(),
                    name: name.to_string(),
                })?;
                Ok((registration.build)())
            }
            Source::Directory(dir) => {
                let Some((path, package)) = Manifest::locate(dir, name) else {
                    return Err(LoadError::Io {
                        category,
                        name: name.to_string(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            format!("no manifest in {}", dir.display()),
                        ),
                    });
                };
                let text = fs::read_to_string(&path).map_err(|source| LoadError::Io {
                    category,
                    name: name.to_string(),
                    source,
                })?;
                let manifest: Manifest =
                    toml::from_str(&text).map_err(|source| LoadError::Manifest {
                        category,
                        name: name.to_string(),
                        source,
                    })?;
                let kind = manifest.kind.clone().unwrap_or_else(|| name.to_string());
                let registration =
                    self.find(category.group(), &kind)
                        .ok_or_else(|| LoadError::UnknownKind {
                            category,
                            name: name.to_string(),
                            kind: kind.clone(),
                        })?;
                let mut implementation = manifest.apply((registration.build)());
                if let Some(package) = package {
                    implementation.src_dir = Some(package);
                }
                Ok(implementation)
            }
        }
    }

    /// Load one extension into `request.namespace` under `name`.
    ///
    /// An existing record that already holds an implementation is replaced.
    /// A settings-only record (no `mod`) is merged back on top of the fresh
    /// one, so configuration written before the load is not lost.
    pub fn load(&mut self, name: &str, request: &LoadRequest<'_>) -> Result<Rc<Implementation>, LoadError> {
        debug!(category = %request.category, extension = name, "loading extension");
        let implementation = self
            .import(name, request.source, request.category)
            .inspect_err(|e| error!("cannot load {} '{name}': {e}", request.category))?;
        attach(name, request, &implementation).map_err(|source| LoadError::Store {
            category: request.category,
            name: name.to_string(),
            source,
        })?;
        Ok(implementation)
    }

    /// Load everything `request.source` offers, in discovery order.
    ///
    /// Returns the names that loaded. Under [`LoadPolicy::SkipBroken`] a
    /// failing extension is logged and skipped.
    pub fn load_all(&mut self, request: &LoadRequest<'_>, policy: LoadPolicy) -> Result<Vec<String>, LoadError> {
        let mut loaded = Vec::new();
        for name in self.discover(request.source, request.category)? {
            match self.load(&name, request) {
                Ok(_) => loaded.push(name),
                Err(e) if policy == LoadPolicy::SkipBroken => {
                    warn!("skipping {} '{name}': {e}", request.category);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(loaded)
    }
}

fn discovered_name(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    if file_name.starts_with('.') {
        return None;
    }
    if path.is_dir() {
        return path
            .join(PACKAGE_MANIFEST)
            .is_file()
            .then(|| file_name.to_string());
    }
    if path.extension().and_then(|e| e.to_str()) == Some("toml") {
        return path.file_stem()?.to_str().map(str::to_string);
    }
    None
}

fn attach(name: &str, request: &LoadRequest<'_>, implementation: &Rc<Implementation>) -> Result<Store, StoreError> {
    let namespace = request.namespace;
    let carried = match namespace.get(name) {
        Some(Value::Store(existing)) if !existing.contains("mod") => Some(existing),
        _ => None,
    };
    namespace.remove(name);

    let record = Store::new();
    namespace.insert(name, record.clone());
    record.insert("mod", Value::Extension(Rc::clone(implementation)));
    let declared: &[(String, Value)] = if request.is_plugin_extension {
        &[]
    } else {
        &implementation.defaults
    };
    merge_settings(&record, request.defaults, declared)?;
    record.insert("meta", implementation.meta.to_store());
    if let Some(carried) = carried {
        record.merge_from(&carried);
    }
    record.insert(
        "logger",
        Value::Logger(ExtensionLogger::new(request.logger_name(name))),
    );
    for alias in &implementation.aliases {
        namespace.insert(alias.as_str(), record.clone());
    }
    Ok(record)
}

/// Defaults every extension record starts from.
pub fn registry_defaults() -> Vec<(String, Value)> {
    vec![
        ("enabled".to_string(), Value::Bool(false)),
        ("priority".to_string(), Value::Float(crate::runner::DEFAULT_PRIORITY)),
    ]
}

/// Fill `record` from three layers, later layers winning.
///
/// 1. registry defaults (`enabled = false`, `priority = 50`)
/// 2. `caller` defaults
/// 3. `declared` defaults, minus `mod` and minus any `enabled = true`
///
/// An extension may declare itself disabled but can never enable itself;
/// only the caller or the user's configuration can.
pub fn merge_settings(
    record: &Store,
    caller: &[(String, Value)],
    declared: &[(String, Value)],
) -> Result<(), StoreError> {
    for (key, value) in registry_defaults().iter().chain(caller) {
        record.set(key.as_str(), value.clone())?;
    }
    for (key, value) in declared {
        match (key.as_str(), value) {
            ("mod", _) | ("logger", _) => continue,
            ("enabled", Value::Bool(true)) => {
                debug!("ignoring self-enable in declared defaults");
                continue;
            }
            _ => record.set(key.as_str(), value.clone())?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{counting_build, import_count, write_file};
    use tempfile::TempDir;

    fn enabled_default() -> Vec<(String, Value)> {
        vec![("enabled".to_string(), Value::Bool(true))]
    }

    // =========================================================================
    // Settings merge
    // =========================================================================

    #[test]
    fn declared_self_enable_is_ignored() {
        let record = Store::new();
        let declared = vec![
            ("enabled".to_string(), Value::Bool(true)),
            ("priority".to_string(), Value::Int(70)),
        ];
        merge_settings(&record, &[], &declared).unwrap();
        assert_eq!(record.bool_at("enabled"), Some(false));
        assert_eq!(record.f64_at("priority"), Some(70.0));
    }

    #[test]
    fn declared_disable_is_honored_over_caller_enable() {
        let record = Store::new();
        let declared = vec![("enabled".to_string(), Value::Bool(false))];
        merge_settings(&record, &enabled_default(), &declared).unwrap();
        assert_eq!(record.bool_at("enabled"), Some(false));
    }

    #[test]
    fn caller_defaults_can_enable() {
        let record = Store::new();
        merge_settings(&record, &enabled_default(), &[]).unwrap();
        assert_eq!(record.bool_at("enabled"), Some(true));
        assert_eq!(record.f64_at("priority"), Some(50.0));
    }

    #[test]
    fn declared_mod_is_skipped_and_dotted_keys_nest() {
        let record = Store::new();
        let declared = vec![
            ("mod".to_string(), Value::from("sneaky")),
            ("auto_permalink.path".to_string(), Value::from("/:title")),
        ];
        merge_settings(&record, &[], &declared).unwrap();
        assert!(!record.contains("mod"));
        assert_eq!(record.str_at("auto_permalink.path").as_deref(), Some("/:title"));
    }

    // =========================================================================
    // Directory discovery and manifests
    // =========================================================================

    #[test]
    fn discovers_manifests_and_packages() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "single.toml", "");
        write_file(tmp.path(), "package/extension.toml", "");
        write_file(tmp.path(), "notes.txt", "ignored");
        write_file(tmp.path(), "empty_dir/readme.md", "no manifest");
        write_file(tmp.path(), ".hidden.toml", "");

        let loader = Loader::new();
        let mut names = loader
            .discover(&Source::Directory(tmp.path().to_path_buf()), Category::Filter)
            .unwrap();
        names.sort();
        assert_eq!(names, vec!["package", "single"]);
    }

    #[test]
    fn missing_directory_discovers_nothing() {
        let loader = Loader::new();
        let names = loader
            .discover(&Source::Directory("/nonexistent/_filters".into()), Category::Filter)
            .unwrap();
        assert!(names.is_empty());
    }

    #[test]
    fn manifest_binds_kind_and_overrides_defaults() {
        let tmp = TempDir::new().unwrap();
        write_file(
            tmp.path(),
            "md2.toml",
            "kind = \"markdown\"\naliases = [\"mark\"]\n[meta]\nauthor = \"me\"\n[config]\ntables = false\n",
        );
        let source = Source::Directory(tmp.path().to_path_buf());
        let filters = Store::new();
        let mut loader = Loader::new();

        loader
            .load("md2", &LoadRequest::new(Category::Filter, &filters, &source))
            .unwrap();
        let record = filters.child("md2").unwrap();
        assert_eq!(record.bool_at("tables"), Some(false));
        assert_eq!(record.str_at("meta.author").as_deref(), Some("me"));
        assert!(filters.child("mark").unwrap().ptr_eq(&record));
    }

    #[test]
    fn unknown_kind_is_a_named_error() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "weird.toml", "kind = \"does_not_exist\"\n");
        let source = Source::Directory(tmp.path().to_path_buf());
        let filters = Store::new();
        let mut loader = Loader::new();

        let err = loader
            .load("weird", &LoadRequest::new(Category::Filter, &filters, &source))
            .unwrap_err();
        assert!(err.to_string().contains("weird"));
        assert!(matches!(err, LoadError::UnknownKind { .. }));
    }

    #[test]
    fn invalid_manifest_is_reported() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "broken.toml", "kind = [unclosed");
        let source = Source::Directory(tmp.path().to_path_buf());
        let mut loader = Loader::new();

        let err = loader
            .load("broken", &LoadRequest::new(Category::Filter, &Store::new(), &source))
            .unwrap_err();
        assert!(matches!(err, LoadError::Manifest { .. }));
    }

    #[test]
    fn skip_broken_policy_keeps_going() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "broken.toml", "kind = \"nope\"\n");
        write_file(tmp.path(), "markdown.toml", "");
        let source = Source::Directory(tmp.path().to_path_buf());
        let filters = Store::new();
        let mut loader = Loader::new();
        let request = LoadRequest::new(Category::Filter, &filters, &source);

        let loaded = loader.load_all(&request, LoadPolicy::SkipBroken).unwrap();
        assert_eq!(loaded, vec!["markdown"]);
        assert!(loader.load_all(&request, LoadPolicy::FailFast).is_err());
    }

    // =========================================================================
    // Attaching records
    // =========================================================================

    #[test]
    fn loaded_record_has_mod_logger_and_defaults() {
        let filters = Store::new();
        let source = Source::registered(Category::Filter.group());
        let mut loader = Loader::new();
        loader
            .load("markdown", &LoadRequest::new(Category::Filter, &filters, &source))
            .unwrap();

        let record = filters.child("markdown").unwrap();
        assert!(matches!(record.get("mod"), Some(Value::Extension(_))));
        assert_eq!(
            ExtensionLogger::of(&record).unwrap().name(),
            "sitekiln.filters.markdown"
        );
        assert_eq!(record.bool_at("enabled"), Some(false));
        assert_eq!(record.f64_at("priority"), Some(50.0));
    }

    #[test]
    fn plugin_scoped_logger_name_is_distinct() {
        let filters = Store::new();
        let source = Source::registered(Category::Filter.group());
        let mut loader = Loader::new();
        let request = LoadRequest::new(Category::Filter, &filters, &source).scoped("blog");
        loader.load("markdown", &request).unwrap();

        let record = filters.child("markdown").unwrap();
        assert_eq!(
            ExtensionLogger::of(&record).unwrap().name(),
            "sitekiln.plugins.blog.filters.markdown"
        );
    }

    #[test]
    fn settings_only_entry_is_carried_over() {
        let filters = Store::new();
        filters.set("markdown.tables", false).unwrap();
        let source = Source::registered(Category::Filter.group());
        let mut loader = Loader::new();
        loader
            .load("markdown", &LoadRequest::new(Category::Filter, &filters, &source))
            .unwrap();

        let record = filters.child("markdown").unwrap();
        assert_eq!(record.bool_at("tables"), Some(false));
        assert_eq!(record.bool_at("footnotes"), Some(true));
    }

    #[test]
    fn implementation_bearing_entry_is_replaced() {
        let filters = Store::new();
        let source = Source::registered(Category::Filter.group());
        let mut loader = Loader::new();
        let request = LoadRequest::new(Category::Filter, &filters, &source);
        loader.load("markdown", &request).unwrap();
        let first = filters.child("markdown").unwrap();
        first.set("tables", false).unwrap();

        loader.load("markdown", &request).unwrap();
        let second = filters.child("markdown").unwrap();
        assert!(!first.ptr_eq(&second));
        assert_eq!(second.bool_at("tables"), Some(true));
    }

    #[test]
    fn plugin_extension_skips_declared_defaults() {
        let filters = Store::new();
        let source = Source::registered(Category::Filter.group());
        let mut loader = Loader::new();
        let defaults = enabled_default();
        let request = LoadRequest::new(Category::Filter, &filters, &source)
            .with_defaults(&defaults)
            .plugin_extension();
        loader.load("markdown", &request).unwrap();

        let record = filters.child("markdown").unwrap();
        assert_eq!(record.bool_at("enabled"), Some(true));
        assert!(!record.contains("tables"));
    }

    // =========================================================================
    // Import memoization
    // =========================================================================

    #[test]
    fn same_identifier_is_imported_once() {
        let mut loader = Loader::new();
        loader.register(Registration::new("sitekiln.test.memo", "counted", counting_build));
        let source = Source::registered("sitekiln.test.memo");
        let first_ns = Store::new();
        let second_ns = Store::new();
        let before = import_count();

        let a = loader
            .load("counted", &LoadRequest::new(Category::Plugin, &first_ns, &source))
            .unwrap();
        let b = loader
            .load("counted", &LoadRequest::new(Category::Plugin, &second_ns, &source))
            .unwrap();
        assert_eq!(import_count() - before, 1);
        assert!(Rc::ptr_eq(&a, &b));
        assert!(loader.is_imported("sitekiln.test.memo:counted"));
    }

    #[test]
    fn later_registration_shadows_earlier() {
        fn first() -> Implementation {
            Implementation::new(Meta::new("first"))
        }
        fn second() -> Implementation {
            Implementation::new(Meta::new("second"))
        }
        let mut loader = Loader::new();
        loader.register(Registration::new("sitekiln.test.shadow", "x", first));
        loader.register(Registration::new("sitekiln.test.shadow", "x", second));

        let registrations = loader.registrations("sitekiln.test.shadow");
        assert_eq!(registrations.len(), 1);
        assert_eq!((registrations[0].build)().name(), "second");
    }

    fn submitted() -> Implementation {
        Implementation::new(Meta::new("submitted"))
    }

    inventory::submit! {
        Registration::new("sitekiln.test.inventory", "submitted", submitted)
    }

    #[test]
    fn inventory_submissions_are_discovered() {
        let loader = Loader::new();
        let names = loader
            .discover(&Source::registered("sitekiln.test.inventory"), Category::Plugin)
            .unwrap();
        assert_eq!(names, vec!["submitted"]);
    }
}
