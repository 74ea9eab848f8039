//! Shared test utilities.
//!
//! Builds throwaway site contexts and instrumented extensions:
//!
//! ```rust,ignore
//! use crate::test_helpers::*;
//!
//! let (tmp, ctx) = test_context();
//! write_file(tmp.path(), "index.html.tera", "{{ 1 + 1 }}");
//!
//! let log = Rc::new(RefCell::new(Vec::new()));
//! let record = record_with(true, 90.0, recording(&log, "A"));
//! ```

use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

use crate::config;
use crate::extension::{Implementation, Meta};
use crate::site::Context;
use crate::store::{Store, Value};

// =========================================================================
// Fixture setup
// =========================================================================

/// A context rooted at a fresh temp directory, with stock defaults applied.
///
/// Keep the returned `TempDir` alive for as long as the context is used.
pub fn test_context() -> (TempDir, Context) {
    let tmp = TempDir::new().unwrap();
    let ctx = Context::new(tmp.path());
    config::apply_defaults(&ctx).unwrap();
    (tmp, ctx)
}

/// Write `contents` to `root/rel`, creating parent directories.
pub fn write_file(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

// =========================================================================
// Instrumented extensions
// =========================================================================

static IMPORTS: AtomicUsize = AtomicUsize::new(0);

/// Registration builder that counts how often it is invoked.
pub fn counting_build() -> Implementation {
    IMPORTS.fetch_add(1, Ordering::SeqCst);
    Implementation::new(Meta::new("counted"))
}

pub fn import_count() -> usize {
    IMPORTS.load(Ordering::SeqCst)
}

/// Extension that appends `"init <label>"` / `"run <label>"` to `log`.
pub fn recording(log: &Rc<RefCell<Vec<String>>>, label: &str) -> Rc<Implementation> {
    let init_log = Rc::clone(log);
    let run_log = Rc::clone(log);
    let init_label = format!("init {label}");
    let run_label = format!("run {label}");
    Rc::new(
        Implementation::new(Meta::new(label))
            .on_init(move |_, _| {
                init_log.borrow_mut().push(init_label.clone());
                Ok(())
            })
            .on_run(move |_, _| {
                run_log.borrow_mut().push(run_label.clone());
                Ok(())
            }),
    )
}

/// An extension record as the registry would attach it.
pub fn record_with(enabled: bool, priority: f64, implementation: Rc<Implementation>) -> Store {
    let record = Store::new();
    record.insert("enabled", enabled);
    record.insert("priority", priority);
    record.insert("mod", Value::Extension(implementation));
    record
}
