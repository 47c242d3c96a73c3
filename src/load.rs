//! Graph loading: parses a build description file and constructs the
//! dependency graph from it.

use crate::graph::{Command, Graph};
use crate::parse;
use anyhow::{anyhow, bail};

#[derive(Debug)]
pub struct BuildFile {
    pub graph: Graph,
    /// The first target declared in the file, built when the command line
    /// names none.
    pub default_target: String,
}

pub fn read(filename: &str) -> anyhow::Result<BuildFile> {
    let text = std::fs::read_to_string(filename)
        .map_err(|err| anyhow!("read {}: {}", filename, err))?;
    let decls = parse::parse(filename, &text)?;
    if decls.is_empty() {
        bail!("{}: no targets defined", filename);
    }
    let default_target = decls[0].name.clone();

    let mut graph = Graph::new();
    for decl in decls {
        let prereqs: Vec<&str> = decl.prereqs.iter().map(String::as_str).collect();
        let line = decl.line;
        let commands = decl.commands.into_iter().map(Command::new).collect();
        graph
            .add_target(&decl.name, &prereqs, commands)
            .map_err(|err| anyhow!("{}:{}: {}", filename, line, err))?;
    }
    graph.validate()?;

    Ok(BuildFile {
        graph,
        default_target,
    })
}
