// src/layout/script.rs

//! Interpreter line rewriting for executable scripts
//!
//! Conda builds scripts against a placeholder prefix that is patched at
//! install time. Wheels have no such step, so interpreter lines are made
//! portable: Python interpreters become `#!python`, which wheel installers
//! replace with the target interpreter, and other prefix tools go through
//! `/usr/bin/env`.

use std::collections::BTreeMap;

/// Markers of a conda build or placeholder prefix
const PREFIX_MARKERS: &[&str] = &[
    "anaconda1anaconda2anaconda3",
    "_placehold",
    "/conda-bld/",
    "/opt/conda/",
    "/envs/",
];

/// Interpreter line wheel installers rewrite to the target interpreter
pub const PORTABLE_PYTHON: &str = "#!python";

fn is_conda_prefix(path: &str) -> bool {
    PREFIX_MARKERS.iter().any(|m| path.contains(m))
}

fn is_python(program: &str) -> bool {
    let name = program.rsplit('/').next().unwrap_or(program);
    name == "python"
        || name
            .strip_prefix("python")
            .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit() || c == '.'))
}

/// Rewrite the interpreter line of a script
///
/// Returns `None` when the content has no interpreter line or the line is
/// already portable.
///
/// ```
/// use condawheel::layout::script::rewrite_shebang;
///
/// let script = b"#!/opt/anaconda1anaconda2anaconda3/bin/python3.11\nimport sys\n";
/// assert_eq!(rewrite_shebang(script).unwrap(), b"#!python\nimport sys\n");
/// assert!(rewrite_shebang(b"#!/bin/sh\necho hi\n").is_none());
/// ```
pub fn rewrite_shebang(content: &[u8]) -> Option<Vec<u8>> {
    if !content.starts_with(b"#!") {
        return None;
    }

    let line_end = content
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(content.len());
    let line = std::str::from_utf8(&content[2..line_end]).ok()?;
    let line = line.trim_end_matches('\r');
    let crlf = content[..line_end].ends_with(b"\r");

    let mut tokens = line.split_whitespace();
    let program = tokens.next()?;
    let args: Vec<&str> = tokens.collect();

    let rewritten = if program.ends_with("/env") && args.first().is_some_and(|a| is_python(a)) {
        join_line(PORTABLE_PYTHON, &args[1..])
    } else if is_python(program) {
        if program == "python" {
            return None;
        }
        join_line(PORTABLE_PYTHON, &args)
    } else if is_conda_prefix(program) {
        let tool = program.rsplit('/').next().unwrap_or(program);
        let mut env_args = vec![tool];
        env_args.extend(args.iter().copied());
        join_line("#!/usr/bin/env", &env_args)
    } else {
        return None;
    };

    let mut out = rewritten.into_bytes();
    if crlf {
        out.push(b'\r');
    }
    out.extend_from_slice(&content[line_end..]);
    Some(out)
}

fn join_line(head: &str, args: &[&str]) -> String {
    let mut line = head.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Whether a script file is a conda-generated launcher for an entry point
///
/// Installers synthesize these from `entry_points.txt`, so shipping the
/// conda copy as well would clash. Windows launchers come as
/// `<name>-script.py` plus `<name>.exe`.
pub fn is_entry_point_stub(file_name: &str, entry_points: &BTreeMap<String, String>) -> bool {
    let base = file_name
        .strip_suffix("-script.py")
        .or_else(|| file_name.strip_suffix(".exe"))
        .unwrap_or(file_name);
    entry_points.contains_key(base)
}
