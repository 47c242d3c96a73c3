//! Parser for build description files.
//!
//! The format is a small make-like subset, line-oriented:
//!
//! ```text
//! # comment
//! target: prereq1 prereq2
//!     command arg1 arg2
//!     another command
//! ```
//!
//! A line starting with whitespace is a command belonging to the most
//! recently declared target.  There is no variable or macro expansion;
//! command lines are handed to the shell verbatim.

use anyhow::bail;

/// One target declaration, as written.  Graph construction happens in
/// `load`, which also resolves prerequisite names.
#[derive(Debug, PartialEq)]
pub struct TargetDecl {
    pub name: String,
    pub prereqs: Vec<String>,
    pub commands: Vec<String>,
    /// Line of the declaration header, for error messages.
    pub line: usize,
}

pub fn parse(filename: &str, text: &str) -> anyhow::Result<Vec<TargetDecl>> {
    let mut decls: Vec<TargetDecl> = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim_end_matches('\r');
        if trimmed.trim().is_empty() || trimmed.trim_start().starts_with('#') {
            continue;
        }
        if trimmed.starts_with(' ') || trimmed.starts_with('\t') {
            let command = trimmed.trim().to_owned();
            match decls.last_mut() {
                Some(decl) => decl.commands.push(command),
                None => bail!("{}:{}: command before any target", filename, line),
            }
            continue;
        }
        let (name, rest) = match trimmed.split_once(':') {
            Some(parts) => parts,
            None => bail!("{}:{}: expected \"target: prereqs...\"", filename, line),
        };
        let name = name.trim();
        if name.is_empty() {
            bail!("{}:{}: empty target name", filename, line);
        }
        let prereqs = rest.split_whitespace().map(str::to_owned).collect();
        decls.push(TargetDecl {
            name: name.to_owned(),
            prereqs,
            commands: Vec::new(),
            line,
        });
    }
    Ok(decls)
}
