//! CLI output formatting.
//!
//! Each listing has a `format_*` function returning lines (tested directly)
//! and a `print_*` wrapper. Entities print as a header line followed by
//! indented context lines:
//!
//! ```text
//! Plugins
//! blog (1.2.0)
//!     Description: Blog engine
//!     Author: Jane
//! ```

use std::path::Path;
use std::rc::Rc;

use crate::extension::Implementation;
use crate::site::BuildSummary;
use crate::store::{Store, Value};

fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn context_lines(implementation: &Implementation, depth: usize) -> Vec<String> {
    let meta = &implementation.meta;
    let fields = [
        ("Description", &meta.description),
        ("Author", &meta.author),
        ("URL", &meta.url),
    ];
    fields
        .into_iter()
        .filter_map(|(label, value)| {
            value
                .as_ref()
                .map(|v| format!("{}{label}: {v}", indent(depth)))
        })
        .collect()
}

pub fn format_plugin_list(plugins: &[(String, Rc<Implementation>)]) -> Vec<String> {
    if plugins.is_empty() {
        return vec!["No plugins installed".to_string()];
    }
    let mut lines = vec!["Plugins".to_string()];
    for (name, implementation) in plugins {
        match &implementation.meta.version {
            Some(version) => lines.push(format!("{name} ({version})")),
            None => lines.push(name.clone()),
        }
        lines.extend(context_lines(implementation, 1));
    }
    lines
}

pub fn print_plugin_list(plugins: &[(String, Rc<Implementation>)]) {
    for line in format_plugin_list(plugins) {
        println!("{}", line);
    }
}

/// One entry per loaded filter; aliases are listed on their filter's line.
pub fn format_filter_list(filters: &Store) -> Vec<String> {
    let mut seen: Vec<(Store, String, Rc<Implementation>, Vec<String>)> = Vec::new();
    for (name, value) in filters.entries() {
        let Value::Store(record) = value else {
            continue;
        };
        let Some(Value::Extension(implementation)) = record.get("mod") else {
            continue;
        };
        match seen.iter_mut().find(|(s, ..)| s.ptr_eq(&record)) {
            Some((.., aliases)) => aliases.push(name),
            None => seen.push((record, name, implementation, Vec::new())),
        }
    }
    if seen.is_empty() {
        return vec!["No filters loaded".to_string()];
    }

    let mut lines = vec!["Filters".to_string()];
    for (_, name, implementation, aliases) in &seen {
        if aliases.is_empty() {
            lines.push(name.clone());
        } else {
            lines.push(format!("{name} (aliases: {})", aliases.join(", ")));
        }
        lines.extend(context_lines(implementation, 1));
    }
    lines
}

pub fn print_filter_list(filters: &Store) {
    for line in format_filter_list(filters) {
        println!("{}", line);
    }
}

pub fn format_info(src_dir: &Path, config_path: &Path, output_dir: Option<&Path>) -> Vec<String> {
    let mut lines = vec![
        format!("sitekiln {}", env!("CARGO_PKG_VERSION")),
        format!("Source: {}", src_dir.display()),
    ];
    if config_path.is_file() {
        lines.push(format!("{}Config: {}", indent(1), config_path.display()));
    } else {
        lines.push(format!("{}No site found (missing {})", indent(1), config_path.display()));
    }
    if let Some(output_dir) = output_dir {
        lines.push(format!("{}Output: {}", indent(1), output_dir.display()));
    }
    lines
}

pub fn print_info(src_dir: &Path, config_path: &Path, output_dir: Option<&Path>) {
    for line in format_info(src_dir, config_path, output_dir) {
        println!("{}", line);
    }
}

pub fn format_build_summary(summary: &BuildSummary) -> Vec<String> {
    let mut lines = Vec::new();
    if !summary.plugins.is_empty() {
        lines.push(format!("Plugins: {}", summary.plugins.join(", ")));
    }
    if summary.controllers.is_empty() {
        lines.push("Controllers: none enabled".to_string());
    } else {
        lines.push(format!("Controllers: {}", summary.controllers.join(" → ")));
    }
    lines.push(format!(
        "Files: {} rendered, {} copied, {} ignored",
        summary.written.rendered, summary.written.copied, summary.written.ignored
    ));
    lines.push(format!("==> Build complete: {}", summary.output_dir.display()));
    lines
}

pub fn print_build_summary(summary: &BuildSummary) {
    for line in format_build_summary(summary) {
        println!("{}", line);
    }
}
