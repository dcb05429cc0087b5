// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Repeatable string option
fn list_arg(id: &'static str, long: &'static str, value: &'static str, help: &'static str) -> Arg {
    Arg::new(id)
        .long(long)
        .value_name(value)
        .action(ArgAction::Append)
        .help(help)
}

fn flag(id: &'static str, long: &'static str, help: &'static str) -> Arg {
    Arg::new(id).long(long).action(ArgAction::SetTrue).help(help)
}

fn build_cli() -> Command {
    Command::new("condawheel")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Condawheel Contributors")
        .about("Convert conda packages and their dependency trees into wheels")
        .arg(
            Arg::new("sources")
                .required(true)
                .num_args(1..)
                .value_name("ARCHIVE|SPEC")
                .help("Local archives or package specs ([channel::][subdir/]name[=version[=build]])"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .help("YAML or TOML configuration file"),
        )
        .arg(list_arg("subdir", "subdir", "SUBDIR", "Platform subdir to search; noarch is always searched"))
        .arg(list_arg("channel", "channel", "CHANNEL", "Channel to search before the system defaults"))
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("DIR")
                .help("Output directory for produced wheels"),
        )
        .arg(list_arg("exclude_deps", "exclude-deps", "NAME", "Dependency name to drop"))
        .arg(list_arg("add_deps", "add-deps", "NAME", "Dependency name to add to the root"))
        .arg(flag("skip_python", "skip-python", "Drop the python runtime dependency"))
        .arg(flag("no_strip_symbols", "no-strip-symbols", "Keep debug symbols in native objects"))
        .arg(flag("fatten", "fatten", "Merge the whole dependency tree into one wheel"))
        .arg(flag("merge", "merge", "Merge all given roots into one wheel"))
        .arg(flag("only_pypi", "only-pypi", "Only keep dependencies that exist on PyPI"))
        .arg(flag(
            "exclude_requirements",
            "exclude-requirements",
            "Do not declare requirements or ship conda test files",
        ))
        .arg(Arg::new("python").long("python").value_name("X.Y").help("Target Python version"))
        .arg(
            Arg::new("jobs")
                .short('j')
                .long("jobs")
                .value_name("N")
                .help("Parallel conversion workers"),
        )
        .arg(list_arg("skip_dep", "skip-dep", "NAME", "Package kept out of the merged wheel"))
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Verbose output"),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("condawheel.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
