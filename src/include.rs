//! Transitive include resolution and the schema front-end drivers.
//!
//! A schema may pull in further files with `include "x.skill"` (or
//! `with "x.skill"`); paths are resolved relative to the entry file's
//! directory. Resolution keeps a worklist and a done-set, so diamond
//! and cyclic includes are read once and terminate.

use crate::ast::Definition;
use crate::check::{self, HintMode};
use crate::ir::TypeContext;
use crate::parser;
use std::collections::{HashSet, VecDeque};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from the schema front-end (parse, include, type check).
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("{0}")]
    Parse(String),
    #[error("{0}")]
    Semantic(String),
    #[error("missing include file \"{file}\" (working directory: {})", dir.display())]
    MissingInclude { file: String, dir: PathBuf },
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse and check a schema entry file with strict hint handling.
pub fn from_file(entry: &Path) -> Result<TypeContext, SchemaError> {
    from_file_with_mode(entry, HintMode::Strict)
}

/// Parse and check a schema entry file, resolving includes transitively.
pub fn from_file_with_mode(entry: &Path, mode: HintMode) -> Result<TypeContext, SchemaError> {
    let dir = entry
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let entry_name = entry
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| entry.to_string_lossy().into_owned());

    let mut worklist: VecDeque<String> = VecDeque::from([entry_name]);
    let mut done: HashSet<String> = HashSet::new();
    let mut defs: Vec<Definition> = Vec::new();
    let mut saw_content = false;

    while let Some(name) = worklist.pop_front() {
        if !done.insert(name.clone()) {
            continue;
        }
        let path = dir.join(&name);
        let source = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SchemaError::MissingInclude {
                    file: name,
                    dir: dir.clone(),
                })
            }
            Err(e) => return Err(SchemaError::Io(e)),
        };
        if !source.trim().is_empty() {
            saw_content = true;
        }
        let parsed = parser::parse(&source).map_err(SchemaError::Parse)?;
        defs.extend(parsed.declarations);
        for inc in parsed.includes {
            worklist.push_back(inc);
        }
    }

    finish(defs, saw_content, mode)
}

/// Parse and check a single schema source with strict hint handling.
/// Include statements are not available without a file context.
pub fn from_source(source: &str) -> Result<TypeContext, SchemaError> {
    from_source_with_mode(source, HintMode::Strict)
}

pub fn from_source_with_mode(source: &str, mode: HintMode) -> Result<TypeContext, SchemaError> {
    let parsed = parser::parse(source).map_err(SchemaError::Parse)?;
    if let Some(first) = parsed.includes.first() {
        return Err(SchemaError::MissingInclude {
            file: first.clone(),
            dir: PathBuf::from("."),
        });
    }
    finish(parsed.declarations, !source.trim().is_empty(), mode)
}

fn finish(
    defs: Vec<Definition>,
    saw_content: bool,
    mode: HintMode,
) -> Result<TypeContext, SchemaError> {
    if defs.is_empty() && saw_content {
        return Err(SchemaError::Semantic(
            "the schema contains no type definitions".to_string(),
        ));
    }
    check::check(defs, mode)
}
