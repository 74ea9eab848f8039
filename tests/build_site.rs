//! End-to-end builds through the public API.

use sitekiln::extension::{ExtensionError, ExtensionLogger, Implementation, Meta};
use sitekiln::registry::{Loader, Registration};
use sitekiln::site::{NoHooks, Site, SiteError};
use sitekiln::store::{Record, Value};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn read(root: &Path, rel: &str) -> String {
    fs::read_to_string(root.join(rel)).unwrap()
}

// =========================================================================
// A small blog plugin
// =========================================================================

fn blog() -> Implementation {
    Implementation::new(Meta::new("blog").versioned("0.1.0").described("Posts from config"))
        .with_default("priority", 90.0)
        .with_default("posts_dir", "posts")
        .on_init(|_ctx, record| {
            record.set("initialized", true)?;
            Ok(())
        })
}

/// Writes one page per entry of `plugins.blog.posts`, running each body
/// through the configured filter chain.
fn posts_controller() -> Implementation {
    Implementation::new(Meta::new("posts"))
        .with_default("priority", 70.0)
        .on_run(|ctx, record| {
            let blog = ctx.plugins().child("blog")?;
            if blog.bool_at("initialized") != Some(true) {
                return Err(ExtensionError::Failed("blog plugin was not initialized".into()));
            }
            let dir = blog.str_at("posts_dir").unwrap_or_default();
            let chain = blog.str_at("post_filters").unwrap_or_else(|| "markdown".into());
            for post in blog.list_at("posts").unwrap_or_default() {
                let Value::Store(post) = post else { continue };
                let slug = post.str_at("slug").unwrap_or_default();
                let body = ctx.run_chain(&chain, &post.str_at("body").unwrap_or_default())?;
                let mut attrs = Record::new();
                attrs.set("title", post.str_at("title").unwrap_or_default());
                attrs.set("body", body);
                ctx.materialize_template("post.html.tera", &format!("{dir}/{slug}/index.html"), attrs)?;
            }
            if let Some(logger) = ExtensionLogger::of(record) {
                logger.info("posts written");
            }
            Ok(())
        })
}

fn loader_with_blog() -> Loader {
    let mut loader = Loader::new();
    loader.register(Registration::new("sitekiln.plugins", "blog", blog));
    loader.register(Registration::new(
        "sitekiln.plugins.blog.controllers",
        "posts",
        posts_controller,
    ));
    loader
}

fn blog_site() -> TempDir {
    let tmp = TempDir::new().unwrap();
    write(
        tmp.path(),
        "_config.toml",
        r#"
site.url = "http://example.com/"

[plugins.blog]
enabled = true
posts = [
    { slug = "hello", title = "Hello", body = "*first*" },
    { slug = "again", title = "Again", body = "second" },
]

[controllers.render]
enabled = true
pages = [{ template = "_templates/home.html.tera", output = "index.html" }]
"#,
    );
    write(
        tmp.path(),
        "_templates/post.html.tera",
        "<h1>{{ title }}</h1>{{ body | safe }}",
    );
    write(
        tmp.path(),
        "_templates/home.html.tera",
        "{{ site_name }}: {{ bf.plugins.blog.posts | length }} posts",
    );
    write(tmp.path(), "_controllers/home.toml", "kind = \"render\"\n");
    write(tmp.path(), "about.html.tera", "about {{ site_name }}");
    write(tmp.path(), "css/site.css", "body {}");
    write(tmp.path(), "drafts/.git", "ignored");
    tmp
}

#[test]
fn full_build_with_plugin_controller_and_templates() {
    let tmp = blog_site();
    let mut site = Site::with_loader(tmp.path(), loader_with_blog())
        .with_overrides(vec![("site.template_vars.site_name".into(), Value::from("Kiln"))])
        .with_hooks(NoHooks);
    site.load_default().unwrap();
    let summary = site.build().unwrap();

    let out = tmp.path().join("_site");
    assert_eq!(summary.output_dir, out);
    assert_eq!(summary.plugins, vec!["blog"]);
    // posts keeps its declared priority of 70, ahead of render at 40
    assert_eq!(summary.controllers, vec!["posts", "render"]);

    assert_eq!(read(&out, "posts/hello/index.html"), "<h1>Hello</h1><p><em>first</em></p>\n");
    assert_eq!(read(&out, "posts/again/index.html"), "<h1>Again</h1><p>second</p>\n");
    assert_eq!(read(&out, "index.html"), "Kiln: 2 posts");
    assert_eq!(read(&out, "about.html"), "about Kiln");
    assert_eq!(read(&out, "css/site.css"), "body {}");
    assert!(!out.join("_templates").exists());
    assert!(!out.join("_config.toml").exists());
    assert!(!out.join("drafts/.git").exists());
}

#[test]
fn rebuild_clears_stale_output() {
    let tmp = blog_site();
    let mut site = Site::with_loader(tmp.path(), loader_with_blog()).with_hooks(NoHooks);
    site.load_default().unwrap();
    site.build().unwrap();
    write(&tmp.path().join("_site"), "stale.html", "old");

    site.load_default().unwrap();
    site.build().unwrap();
    assert!(!tmp.path().join("_site/stale.html").exists());
    assert!(tmp.path().join("_site").is_dir());
}

#[test]
fn disabled_plugin_contributes_nothing() {
    let tmp = blog_site();
    let mut site = Site::with_loader(tmp.path(), loader_with_blog())
        .with_overrides(vec![("plugins.blog.enabled".into(), Value::Bool(false))])
        .with_hooks(NoHooks);
    site.load_default().unwrap();
    let summary = site.build().unwrap();

    assert!(summary.plugins.is_empty());
    assert_eq!(summary.controllers, vec!["render"]);
    assert!(!tmp.path().join("_site/posts").exists());
}

#[test]
fn user_filter_chain_setting_is_honored() {
    let tmp = blog_site();
    let mut site = Site::with_loader(tmp.path(), loader_with_blog())
        .with_overrides(vec![(
            "plugins.blog.post_filters".into(),
            Value::from("markdown, html_escape"),
        )])
        .with_hooks(NoHooks);
    site.load_default().unwrap();
    site.build().unwrap();

    assert_eq!(
        read(&tmp.path().join("_site"), "posts/again/index.html"),
        "<h1>Again</h1>&lt;p&gt;second&lt;/p&gt;\n"
    );
}

#[test]
fn enabled_but_unloaded_controller_fails_the_build() {
    let tmp = blog_site();
    let mut site = Site::with_loader(tmp.path(), loader_with_blog())
        .with_overrides(vec![("controllers.missing.enabled".into(), Value::Bool(true))])
        .with_hooks(NoHooks);
    site.load_default().unwrap();
    let err = site.build().unwrap_err();
    assert!(matches!(err, SiteError::Run(_)));
    assert!(err.to_string().contains("missing"));
}

#[test]
fn site_url_path_nests_output() {
    let tmp = blog_site();
    let mut site = Site::with_loader(tmp.path(), loader_with_blog())
        .with_overrides(vec![("site.url".into(), Value::from("http://example.com/~me/blog"))])
        .with_hooks(NoHooks);
    site.load_default().unwrap();
    let summary = site.build().unwrap();

    assert_eq!(summary.output_dir, tmp.path().join("_site/~me/blog"));
    assert!(tmp.path().join("_site/~me/blog/css/site.css").is_file());
}
