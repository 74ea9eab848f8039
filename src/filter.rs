//! Text filters and filter chains.
//!
//! A chain is a comma-separated list of filter references applied left to
//! right: `"markdown, html_escape"`. A reference is either a bare name,
//! looked up in the site's `filters` namespace, or an absolute dotted path
//! such as `plugins.blog.filters.markdown` reaching into a plugin's own
//! namespace. The token `none` (any case) is dropped, so `"none"` is an
//! empty chain.

use pulldown_cmark::{html, Options, Parser};
use std::rc::Rc;
use thiserror::Error;
use tracing::debug;

use crate::extension::{Category, ExtensionError, ExtensionLogger, Implementation, Meta};
use crate::runner::{self, RunError};
use crate::site::Context;
use crate::store::{Store, Value};

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("filter '{0}' is not loaded")]
    NotLoaded(String),
    #[error("'{0}' is not a filter")]
    NotAFilter(String),
    #[error("filter '{name}' failed: {source}")]
    Failed {
        name: String,
        #[source]
        source: Box<ExtensionError>,
    },
    #[error(transparent)]
    Plan(#[from] Box<RunError>),
}

/// Split a chain into filter references, dropping `none` and blanks.
pub fn parse_chain(chain: &str) -> Vec<String> {
    chain
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty() && !name.eq_ignore_ascii_case("none"))
        .map(str::to_string)
        .collect()
}

/// Resolve a filter reference against `config`.
///
/// Bare names are looked up under `config.filters`; dotted references are
/// absolute paths from `config`. Lookups never create anything.
pub fn get_filter(config: &Store, reference: &str) -> Result<(Store, Rc<Implementation>), FilterError> {
    let not_loaded = || FilterError::NotLoaded(reference.to_string());
    let value = match reference.rsplit_once('.') {
        Some(_) => config.get_path(reference),
        None => config.get_path(&format!("{}.{reference}", Category::Filter.namespace())),
    };
    let record = match value {
        Some(Value::Store(record)) => record,
        Some(_) => return Err(FilterError::NotAFilter(reference.to_string())),
        None => return Err(not_loaded()),
    };
    match record.get("mod") {
        Some(Value::Extension(implementation)) => Ok((record, implementation)),
        _ => Err(not_loaded()),
    }
}

/// Apply each filter of `chain` to `content`, in order.
pub fn run_chain(ctx: &Context, chain: &str, content: &str) -> Result<String, FilterError> {
    let config = ctx.config();
    let mut text = content.to_string();
    for reference in parse_chain(chain) {
        let (record, implementation) = get_filter(&config, &reference)?;
        debug!(filter = %reference, "applying filter");
        text = implementation
            .transform(ctx, &record, &text)
            .ok_or_else(|| FilterError::NotAFilter(reference.clone()))?
            .map_err(|source| FilterError::Failed {
                name: reference.clone(),
                source: Box::new(source),
            })?;
    }
    Ok(text)
}

/// Initialize every loaded filter, in priority order, regardless of
/// `enabled`. Returns how many inits were performed.
pub fn init_filters(ctx: &Context) -> Result<usize, FilterError> {
    let planned = runner::plan(&[ctx.config()], Category::Filter, false).map_err(Box::new)?;
    let mut performed = 0;
    for entry in planned {
        let Some(implementation) = entry.implementation else {
            continue;
        };
        let fresh = implementation
            .initialize(ctx, &entry.record)
            .map_err(|source| FilterError::Failed {
                name: entry.name.clone(),
                source: Box::new(source),
            })?;
        if fresh {
            performed += 1;
        }
    }
    Ok(performed)
}

/// CommonMark to HTML.
pub fn markdown() -> Implementation {
    Implementation::new(
        Meta::new("markdown").described("Convert Markdown (CommonMark) to HTML"),
    )
    .with_alias("md")
    .with_default("tables", true)
    .with_default("footnotes", true)
    .with_default("strikethrough", true)
    .with_transform(|_ctx, record, text| {
        let mut options = Options::empty();
        if record.bool_at("tables").unwrap_or(false) {
            options.insert(Options::ENABLE_TABLES);
        }
        if record.bool_at("footnotes").unwrap_or(false) {
            options.insert(Options::ENABLE_FOOTNOTES);
        }
        if record.bool_at("strikethrough").unwrap_or(false) {
            options.insert(Options::ENABLE_STRIKETHROUGH);
        }
        let parser = Parser::new_ext(text, options);
        let mut out = String::with_capacity(text.len() * 2);
        html::push_html(&mut out, parser);
        Ok(out)
    })
}

/// Escape `&`, `<`, `>`, `"` and `'` for safe inclusion in HTML.
pub fn html_escape() -> Implementation {
    Implementation::new(Meta::new("html_escape").described("Escape HTML special characters"))
        .with_transform(|_ctx, record, text| {
            if let Some(logger) = ExtensionLogger::of(record) {
                logger.debug(&format!("escaping {} bytes", text.len()));
            }
            Ok(escape_html(text))
        })
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
