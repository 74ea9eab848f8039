//! Controllers: the extensions that generate site content.
//!
//! Controllers live under `controllers` in the site config and under
//! `plugins.<name>.controllers` for each plugin. The built-in `render`
//! controller writes a list of configured pages:
//!
//! ```toml
//! [controllers.render]
//! enabled = true
//! pages = [
//!     { template = "index.html.tera", output = "index.html" },
//!     { template = "feed.xml.tera", output = "feed/index.xml", title = "Feed" },
//! ]
//! ```
//!
//! Every key of a page besides `template` and `output` becomes a template
//! binding.

use tracing::debug;

use crate::extension::{ExtensionError, ExtensionLogger, Implementation, Meta};
use crate::site::Context;
use crate::store::{Record, Store, Value};

/// Namespaces whose `controllers` take part in a build: the site config
/// followed by every enabled plugin, in discovery order.
pub fn namespaces(ctx: &Context) -> Vec<Store> {
    let mut namespaces = vec![ctx.config()];
    for (_, value) in ctx.plugins().entries() {
        let Value::Store(record) = value else {
            continue;
        };
        if record.bool_at("enabled") != Some(true) || namespaces.iter().any(|s| s.ptr_eq(&record)) {
            continue;
        }
        namespaces.push(record);
    }
    namespaces
}

/// Renders each entry of its `pages` list.
pub fn render() -> Implementation {
    Implementation::new(Meta::new("render").described("Render configured templates to output pages"))
        .with_default("priority", 40.0)
        .on_run(|ctx, record| {
            let pages = record.list_at("pages").unwrap_or_default();
            let logger = ExtensionLogger::of(record);
            for page in pages {
                let Value::Store(page) = page else {
                    return Err(ExtensionError::Failed(format!(
                        "pages entries must be tables, found {}",
                        page.type_name()
                    )));
                };
                let template = required(&page, "template")?;
                let output = required(&page, "output")?;
                let attrs: Record = page
                    .entries()
                    .into_iter()
                    .filter(|(key, _)| key != "template" && key != "output")
                    .collect();
                let path = ctx.materialize_template(&template, &output, attrs)?;
                if let Some(logger) = &logger {
                    logger.info(&format!("wrote {}", path.display()));
                }
            }
            debug!("render controller finished");
            Ok(())
        })
}

fn required(page: &Store, key: &str) -> Result<String, ExtensionError> {
    page.str_at(key)
        .ok_or_else(|| ExtensionError::Failed(format!("page entry is missing '{key}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{LoadRequest, Loader, Source};
    use crate::extension::Category;
    use crate::runner::Runner;
    use crate::test_helpers::{test_context, write_file};
    use std::fs;

    fn load_render(ctx: &Context) {
        let controllers = ctx.controllers();
        let source = Source::registered(Category::Controller.group());
        Loader::new()
            .load("render", &LoadRequest::new(Category::Controller, &controllers, &source))
            .unwrap();
    }

    #[test]
    fn render_writes_each_page_with_extra_bindings() {
        let (tmp, ctx) = test_context();
        write_file(tmp.path(), "_templates/page.tera", "<h1>{{ title }}</h1>");
        load_render(&ctx);
        let config = crate::config::parse_assignments(
            "[controllers.render]\nenabled = true\npages = [{ template = \"page.tera\", output = \"about/index.html\", title = \"About\" }]\n",
        )
        .unwrap();
        crate::config::apply(&ctx.config(), &config).unwrap();

        let mut runner = Runner::new(&namespaces(&ctx), Category::Controller).unwrap();
        runner.execute(&ctx).unwrap();
        let written = ctx.output_dir().join("about/index.html");
        assert_eq!(fs::read_to_string(written).unwrap(), "<h1>About</h1>");
    }

    #[test]
    fn render_is_disabled_until_configured() {
        let (_tmp, ctx) = test_context();
        load_render(&ctx);
        let runner = Runner::new(&namespaces(&ctx), Category::Controller).unwrap();
        assert!(runner.plan().is_empty());
        assert_eq!(ctx.controllers().f64_at("render.priority"), Some(40.0));
    }

    #[test]
    fn page_without_output_fails() {
        let (_tmp, ctx) = test_context();
        load_render(&ctx);
        let page = Store::new();
        page.set("template", "x.tera").unwrap();
        ctx.controllers().set("render.pages", vec![Value::Store(page)]).unwrap();
        ctx.controllers().set("render.enabled", true).unwrap();

        let mut runner = Runner::new(&namespaces(&ctx), Category::Controller).unwrap();
        let err = runner.execute(&ctx).unwrap_err();
        assert!(err.to_string().contains("missing 'output'"));
    }

    #[test]
    fn only_enabled_plugins_contribute_namespaces() {
        let (_tmp, ctx) = test_context();
        ctx.plugins().set("on.enabled", true).unwrap();
        ctx.plugins().set("off.enabled", false).unwrap();
        let ns = namespaces(&ctx);
        assert_eq!(ns.len(), 2);
        assert!(ns[1].ptr_eq(&ctx.plugins().child("on").unwrap()));
    }
}
