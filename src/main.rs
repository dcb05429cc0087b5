// src/main.rs

use anyhow::{Context, Result};
use clap::Parser;
use condawheel::config::{ConfigFile, OneOrMany, PythonVersion, ResolutionConfig};
use condawheel::convert::Converter;
use condawheel::fatten::fatten;
use condawheel::index::{CachedFetcher, ChannelClient, RepodataIndex};
use condawheel::layout::ToolRelinker;
use condawheel::resolver::{ResolvedTree, Resolver, Source};
use condawheel::translate::PypiPresence;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "condawheel")]
#[command(author, version, about = "Convert conda packages and their dependency trees into wheels", long_about = None)]
struct Cli {
    /// Local archives (directory, .tar.bz2, .tar.gz, .tar, .zip, .conda) or
    /// package specs (`[channel::][subdir/]name[=version[=build]]`)
    #[arg(required = true, value_name = "ARCHIVE|SPEC")]
    sources: Vec<String>,

    /// YAML or TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Platform subdir to search (repeatable; noarch is always searched)
    #[arg(long = "subdir")]
    subdirs: Vec<String>,

    /// Channel to search (repeatable; system defaults are appended)
    #[arg(long = "channel")]
    channels: Vec<String>,

    /// Output directory for produced wheels (default: current directory)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Dependency names to drop (repeatable)
    #[arg(long = "exclude-deps")]
    exclude_deps: Vec<String>,

    /// Dependency names to add to the root (repeatable)
    #[arg(long = "add-deps")]
    add_deps: Vec<String>,

    /// Drop the python runtime dependency
    #[arg(long)]
    skip_python: bool,

    /// Keep debug symbols in native objects
    #[arg(long)]
    no_strip_symbols: bool,

    /// Merge the whole dependency tree into one wheel
    #[arg(long)]
    fatten: bool,

    /// Merge all given roots into one wheel
    #[arg(long)]
    merge: bool,

    /// Only keep dependencies that exist on PyPI
    #[arg(long)]
    only_pypi: bool,

    /// Do not declare requirements or ship conda test files
    #[arg(long)]
    exclude_requirements: bool,

    /// Target Python version (e.g. 3.11)
    #[arg(long)]
    python: Option<PythonVersion>,

    /// Parallel conversion workers
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Package name or reference kept out of the merged wheel (repeatable)
    #[arg(long = "skip-dep")]
    skip_deps: Vec<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Flags that were actually given, as the top configuration layer
    fn overrides(&self) -> ConfigFile {
        fn list(values: &[String]) -> Option<OneOrMany> {
            (!values.is_empty()).then(|| OneOrMany::from(values.to_vec()))
        }
        fn flag(set: bool, value: bool) -> Option<bool> {
            set.then_some(value)
        }

        ConfigFile {
            subdir: list(&self.subdirs),
            channels: list(&self.channels),
            output: self.output.clone(),
            exclude_deps: list(&self.exclude_deps),
            add_deps: list(&self.add_deps),
            skip_python: flag(self.skip_python, true),
            strip_symbols: flag(self.no_strip_symbols, false),
            fatten: flag(self.fatten, true),
            merge: flag(self.merge, true),
            only_pypi: flag(self.only_pypi, true),
            include_requirements: flag(self.exclude_requirements, false),
            python_version: self.python,
            jobs: self.jobs,
            ..ConfigFile::default()
        }
    }
}

fn print_failures(tree: &ResolvedTree) {
    if tree.failures().is_empty() {
        return;
    }
    eprintln!("{} dependencies were dropped:", tree.failures().len());
    for failure in tree.failures() {
        eprintln!("  {}: {}", failure.subject, failure.reason);
    }
}

fn run(cli: Cli) -> Result<()> {
    let file = cli
        .config
        .as_deref()
        .map(ConfigFile::load)
        .transpose()
        .context("Failed to load configuration")?;
    let mut config = ResolutionConfig::merge(file, cli.overrides());
    if config.output.is_none() {
        config = config.with_output(std::env::current_dir()?);
    }
    let merging = config.fatten || config.merge;

    let sources = cli
        .sources
        .iter()
        .map(|s| Source::parse(s))
        .collect::<condawheel::Result<Vec<_>>>()
        .context("Invalid package source")?;

    let client = ChannelClient::with_timeout(config.fetch_timeout())?;
    let index = RepodataIndex::from_config(&config, client.clone());
    let fetcher = CachedFetcher::new(client.clone(), &config.cache_dir).with_progress(true);
    let presence = PypiPresence::new(client);
    let relinker = ToolRelinker::new();

    // Merged runs write only the final wheel to the output directory
    let converter = Converter::new(&config, &relinker, &presence);
    let converter = if merging {
        converter.with_output_dir(None)
    } else {
        converter
    };
    let resolver = Resolver::new(converter, &index, &fetcher)?;

    let batches: Vec<Vec<Source>> = if config.merge {
        vec![sources]
    } else {
        sources.into_iter().map(|s| vec![s]).collect()
    };

    for batch in batches {
        let label = batch
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        info!("Resolving {}", label);
        let tree = resolver
            .resolve(&batch)
            .with_context(|| format!("Failed to convert {}", label))?;

        if merging {
            let skip: BTreeSet<String> = cli.skip_deps.iter().cloned().collect();
            let merged = fatten(&tree, &skip, &config)
                .with_context(|| format!("Failed to merge {}", label))?;
            if let Err(e) = tree.release() {
                warn!("Failed to clean up intermediate wheels: {}", e);
            }
            println!("{}", merged.path().display());
        } else {
            for key in tree.post_order(tree.roots()) {
                if let Some(artifact) = tree.artifact(&key) {
                    println!("{}", artifact.path().display());
                }
            }
        }

        print_failures(&tree);
    }

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_only_given_flags() {
        let cli = Cli::parse_from(["condawheel", "pkg.tar.bz2", "--skip-python", "--add-deps", "six"]);
        let overrides = cli.overrides();

        assert_eq!(overrides.skip_python, Some(true));
        assert_eq!(overrides.add_deps, Some(OneOrMany::Many(vec!["six".to_string()])));
        assert_eq!(overrides.fatten, None);
        assert_eq!(overrides.strip_symbols, None);
        assert_eq!(overrides.subdir, None);
    }

    #[test]
    fn test_negative_flags() {
        let cli = Cli::parse_from([
            "condawheel",
            "re2",
            "--no-strip-symbols",
            "--exclude-requirements",
            "--python",
            "3.11",
        ]);
        let config = ResolutionConfig::merge(None, cli.overrides());

        assert!(!config.strip_symbols);
        assert!(!config.include_requirements);
        assert_eq!(config.python_version, PythonVersion::new(3, 11));
    }
}
