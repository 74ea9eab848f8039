//! # sitekiln
//!
//! An extensible static site compiler. A site is a source directory with a
//! `_config.toml`; building it copies static files, renders templates, and
//! runs the site's extensions into an output directory.
//!
//! # Architecture: Load, Then Build
//!
//! ```text
//! load    defaults → built-ins → plugins → site _filters/ _controllers/ → _config.toml → overrides
//! build   pre_build → clear output → init plugins → init filters
//!                   → init controllers → run controllers → write files → post_build
//! ```
//!
//! Everything shares one [`store::Store`] tree, rooted at the build
//! [`site::Context`]. Stores auto-vivify: assigning
//! `controllers.blog.auto_permalink.path` creates every level on the way, so
//! configuration, extension settings and template data need no declared
//! schema.
//!
//! # Extensions
//!
//! Three kinds, one shape ([`extension::Implementation`]):
//!
//! - **controllers** generate content, running in descending `priority`
//! - **filters** transform text, composed into chains like `"markdown, html_escape"`
//! - **plugins** bundle controllers, filters and a site template tree
//!
//! Extensions are compiled in and discovered through [`inventory`]
//! registrations ([`registry::Registration`]). A site binds them by name with
//! small TOML manifests in `_controllers/` and `_filters/`. An extension can
//! declare defaults but can never enable itself: only the user's
//! configuration (or, for a plugin's bundled extensions, installing the
//! plugin) does that.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`store`] | Auto-vivifying hierarchical store and strict records |
//! | [`extension`] | Implementations, hooks, metadata and per-extension loggers |
//! | [`registry`] | Discovery, import memoization and layered settings merge |
//! | [`runner`] | Priority planning and the init-then-run lifecycle |
//! | [`filter`] | Filter chains and the built-in filters |
//! | [`controller`] | Controller namespaces and the built-in `render` controller |
//! | [`plugin`] | Plugin loading, bundled extensions, filter exposure |
//! | [`template`] | Template engines and output materialization |
//! | [`config`] | Layered configuration and ignore-pattern compilation |
//! | [`writer`] | Output directory preparation and the source-tree walk |
//! | [`site`] | Build context and the load/build orchestration |
//! | [`scaffold`] | `sitekiln init` |
//! | [`util`] | URL and filesystem path helpers |
//! | [`output`] | CLI output formatting |
//!
//! # Threading
//!
//! A build is sequential and stores are `Rc`-shared. Extension hooks run one
//! at a time, in plan order, on the calling thread.

pub mod config;
pub mod controller;
pub mod extension;
pub mod filter;
pub mod output;
pub mod plugin;
pub mod registry;
pub mod runner;
pub mod scaffold;
pub mod site;
pub mod store;
pub mod template;
pub mod util;
pub mod writer;

#[cfg(test)]
pub(crate) mod test_helpers;
