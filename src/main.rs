use clap::{Parser, Subcommand};
use sitekiln::extension::Category;
use sitekiln::registry::{LoadPolicy, Loader, Source};
use sitekiln::site::Site;
use sitekiln::{config, output, plugin, scaffold};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sitekiln")]
#[command(about = "Extensible static site compiler")]
#[command(long_about = "\
Extensible static site compiler

A site is a source directory with a _config.toml. Files are copied to the
output directory; files ending in a template engine suffix (.tera) are
rendered. Controllers generate extra pages, filters transform text, and
plugins bundle both together with templates.

Site layout:

  mysite/
  ├── _config.toml          # Site configuration (see gen-config)
  ├── _templates/           # Base templates, available to every render
  ├── _controllers/         # <name>.toml manifests binding controller kinds
  ├── _filters/             # <name>.toml manifests binding filter kinds
  ├── index.html.tera       # Rendered to index.html
  └── css/site.css          # Copied as-is

Files and directories starting with an underscore are never copied.

Run 'sitekiln gen-config' to print a documented _config.toml.")]
#[command(version)]
struct Cli {
    /// Site source directory
    #[arg(short = 's', long, default_value = ".", global = true)]
    src_dir: PathBuf,

    /// Increase log verbosity (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the site into its output directory
    Build {
        /// Override a setting after the config file (e.g. site.url=https://example.com)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,

        /// Skip extensions that fail to load instead of aborting
        #[arg(long)]
        skip_broken: bool,
    },
    /// Create a new site, optionally from a plugin's site template
    Init {
        /// Directory to create
        dir: PathBuf,
        /// Plugin whose site template to copy
        plugin: Option<String>,
    },
    /// Show information about the site in the source directory
    Info,
    /// Installed plugins
    #[command(subcommand)]
    Plugins(PluginsCommand),
    /// Available filters
    #[command(subcommand)]
    Filters(FiltersCommand),
    /// Print a stock _config.toml with all options documented
    GenConfig,
}

#[derive(Subcommand)]
enum PluginsCommand {
    /// List installed plugins
    List,
}

#[derive(Subcommand)]
enum FiltersCommand {
    /// List built-in, plugin and site filters
    List,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "sitekiln=warn",
        1 => "sitekiln=info",
        _ => "sitekiln=debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Build {
            overrides,
            skip_broken,
        } => {
            let overrides = overrides
                .iter()
                .map(|raw| config::parse_override(raw))
                .collect::<Result<Vec<_>, _>>()?;
            let policy = if skip_broken {
                LoadPolicy::SkipBroken
            } else {
                LoadPolicy::FailFast
            };
            let mut site = Site::new(&cli.src_dir)
                .with_overrides(overrides)
                .with_policy(policy);
            println!("==> Loading {}", site.config_path().display());
            site.load_default()?;
            println!("==> Building {}", cli.src_dir.display());
            let summary = site.build()?;
            output::print_build_summary(&summary);
        }
        Command::Init { dir, plugin } => {
            let mut loader = Loader::new();
            let written = scaffold::init_site(&dir, plugin.as_deref(), &mut loader)?;
            for path in written {
                println!("    {}", path.display());
            }
            println!("==> Site created in {}", dir.display());
        }
        Command::Info => {
            let mut site = Site::new(&cli.src_dir);
            let config_path = site.config_path();
            let output_dir = if config_path.is_file() {
                site.load_default()?;
                Some(site.context().output_dir())
            } else {
                None
            };
            output::print_info(&cli.src_dir, &config_path, output_dir.as_deref());
        }
        Command::Plugins(PluginsCommand::List) => {
            let mut loader = Loader::new();
            let source = Source::registered(plugin::PLUGIN_GROUP);
            let mut plugins = Vec::new();
            for registration in plugin::iter_plugins(&loader) {
                let implementation = loader.import(registration.name, &source, Category::Plugin)?;
                plugins.push((registration.name.to_string(), implementation));
            }
            output::print_plugin_list(&plugins);
        }
        Command::Filters(FiltersCommand::List) => {
            let mut site = Site::new(&cli.src_dir);
            site.load(None)?;
            output::print_filter_list(&site.context().filters());
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}
