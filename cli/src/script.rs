//! Line-oriented script runner.
//!
//! Each line is either a session command or a statement handed to the
//! registry. Statements without `@` run in the current solution.

use anyhow::{anyhow, bail, Context, Result};
use std::io::Write;
use tracing::{info, warn};
use vsolve_core::variables::{Outcome, Registry, VariableError};

/// A parsed script line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command<'a> {
    /// `solution NAME [from P1 P2 ...]`
    Solution { name: &'a str, parents: Vec<&'a str> },
    /// `use NAME`
    Use(&'a str),
    /// `alias A = V`
    Alias { alias: &'a str, variable: &'a str },
    /// `show [NAME]`
    Show(Option<&'a str>),
    /// `deps READ_ID`
    Deps(&'a str),
    /// `info`
    Info,
    /// `reset`
    Reset,
    Statement(&'a str),
}

/// Parse one non-empty, non-comment line.
pub fn parse_command(line: &str) -> Result<Command<'_>> {
    let line = line.trim();
    let (word, rest) = line
        .split_once(char::is_whitespace)
        .map(|(w, r)| (w, r.trim()))
        .unwrap_or((line, ""));

    // Anything with `=` is a statement, even if it starts with a keyword.
    if line.contains('=') && word != "alias" {
        return Ok(Command::Statement(line));
    }

    match word {
        "solution" => {
            let mut parts = rest.split_whitespace();
            let name = parts.next().ok_or_else(|| anyhow!("solution needs a name"))?;
            let parents: Vec<&str> = match parts.next() {
                None => Vec::new(),
                Some("from") => parts.collect(),
                Some(other) => bail!("expected 'from', found '{}'", other),
            };
            Ok(Command::Solution { name, parents })
        }
        "use" if !rest.is_empty() => Ok(Command::Use(rest)),
        "alias" => {
            let (alias, variable) = rest
                .split_once('=')
                .ok_or_else(|| anyhow!("expected 'alias A = V'"))?;
            Ok(Command::Alias {
                alias: alias.trim(),
                variable: variable.trim(),
            })
        }
        "show" => Ok(Command::Show((!rest.is_empty()).then_some(rest))),
        "deps" if !rest.is_empty() => Ok(Command::Deps(rest)),
        "info" if rest.is_empty() => Ok(Command::Info),
        "reset" if rest.is_empty() => Ok(Command::Reset),
        _ => Ok(Command::Statement(line)),
    }
}

pub struct Session {
    registry: Registry,
    current: Option<String>,
}

impl Session {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            current: None,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    fn current_or_err(&self) -> Result<&str> {
        self.current()
            .ok_or_else(|| anyhow!("no current solution; use 'solution NAME' or 'use NAME' first"))
    }

    /// Run a whole script, writing results and errors to `out`.
    /// Returns the number of lines that failed.
    pub fn run(&mut self, script: &str, out: &mut impl Write) -> Result<usize> {
        let mut failures = 0;
        for (index, line) in script.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            match self.run_line(line) {
                Ok(Some(text)) => writeln!(out, "{}", text)?,
                Ok(None) => {}
                Err(e) => {
                    failures += 1;
                    warn!("line {} failed: {:#}", index + 1, e);
                    writeln!(out, "error: line {}: {:#}", index + 1, e)?;
                }
            }
        }
        Ok(failures)
    }

    /// Run one line. Returns the text to print, if any.
    pub fn run_line(&mut self, line: &str) -> Result<Option<String>> {
        match parse_command(line)? {
            Command::Solution { name, parents } => {
                if parents.is_empty() {
                    self.registry.create_solution(name)?;
                } else {
                    self.registry.create_derived_solution(name, &parents)?;
                }
                self.current = Some(name.to_string());
                Ok(None)
            }
            Command::Use(name) => {
                if self.registry.solution(name).is_none() {
                    return Err(VariableError::UnknownSolution(name.to_string()).into());
                }
                self.current = Some(name.to_string());
                Ok(None)
            }
            Command::Alias { alias, variable } => {
                let current = self.current_or_err()?.to_string();
                self.registry.set_alias(&current, alias, variable)?;
                Ok(None)
            }
            Command::Show(name) => {
                let name = match name {
                    Some(name) => name,
                    None => self.current_or_err()?,
                };
                let solution = self
                    .registry
                    .solution(name)
                    .ok_or_else(|| VariableError::UnknownSolution(name.to_string()))?;
                Ok(Some(solution.to_string().trim_end().to_string()))
            }
            Command::Deps(read_id) => {
                let uses: Vec<&str> = self.registry.dependencies(read_id).iter().map(String::as_str).collect();
                let used_by: Vec<&str> = self.registry.dependents(read_id).iter().map(String::as_str).collect();
                Ok(Some(format!(
                    "{}\n  uses: {}\n  used by: {}",
                    read_id,
                    uses.join(", "),
                    used_by.join(", ")
                )))
            }
            Command::Info => {
                let json = serde_json::to_string_pretty(&self.registry.variables_info())?;
                Ok(Some(json))
            }
            Command::Reset => {
                self.registry.reset();
                self.current = None;
                info!("Session reset");
                Ok(None)
            }
            Command::Statement(text) => {
                let outcome = match &self.current {
                    Some(current) if !text.contains('@') => self.registry.execute_in(current, text),
                    _ => self.registry.execute(text),
                }
                .with_context(|| format!("'{}'", text))?;
                Ok(Some(describe(&outcome)))
            }
        }
    }
}

fn describe(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Read { target, value } => format!("{} = {} (copied)", target, value),
        other => format!("{} = {}", other.read_id(), other.value()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(script: &str) -> (Session, String, usize) {
        let mut session = Session::new(Registry::new());
        let mut out = Vec::new();
        let failures = session.run(script, &mut out).unwrap();
        (session, String::from_utf8(out).unwrap(), failures)
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            parse_command("solution result from panel edge").unwrap(),
            Command::Solution {
                name: "result",
                parents: vec!["panel", "edge"],
            }
        );
        assert_eq!(parse_command("use panel").unwrap(), Command::Use("panel"));
        assert_eq!(
            parse_command("alias L = length").unwrap(),
            Command::Alias {
                alias: "L",
                variable: "length",
            }
        );
        assert_eq!(parse_command("show").unwrap(), Command::Show(None));
        assert_eq!(parse_command("deps width.result").unwrap(), Command::Deps("width.result"));
        assert_eq!(parse_command("reset").unwrap(), Command::Reset);
        assert_eq!(
            parse_command("length@panel = 600").unwrap(),
            Command::Statement("length@panel = 600")
        );
        assert!(parse_command("solution a to b").is_err());
    }

    #[test]
    fn test_keyword_named_variable_is_statement() {
        assert_eq!(parse_command("show=5").unwrap(), Command::Statement("show=5"));
    }

    #[test]
    fn test_furniture_script() {
        let (session, out, failures) = run(
            "solution panel\n\
             width@panel=400\n\
             solution edge\n\
             thickness@edge=2\n\
             // derived from both\n\
             solution result from panel edge\n\
             width@result=width.panel - 2*thickness.edge\n",
        );
        assert_eq!(failures, 0, "{}", out);
        assert!(out.contains("width.result = 396"));
        assert_eq!(session.current(), Some("result"));
        assert_eq!(
            session.registry().solution("result").unwrap().parents(),
            ["panel", "edge"]
        );
    }

    #[test]
    fn test_current_solution_statements() {
        let (_, out, failures) = run(
            "solution panel\n\
             L=600\n\
             alias Len = _alias_L\n\
             half@panel=Len.panel/2\n\
             copy=half.panel\n\
             show\n",
        );
        assert_eq!(failures, 0, "{}", out);
        assert!(out.contains("half.panel = 300"));
        assert!(out.contains("copy.panel = 300 (copied)"));
        assert!(out.contains("Solution 'panel'"));
    }

    #[test]
    fn test_errors_do_not_stop_script() {
        let (session, out, failures) = run(
            "solution a\n\
             x@a=1\n\
             y@a=x.nosuch\n\
             use nowhere\n\
             z@a=x.a+1\n",
        );
        assert_eq!(failures, 2);
        assert!(out.contains("error: line 3"));
        assert!(out.contains("Solution 'nowhere' not found"));
        assert!(session.registry().find_variable("z@a").is_some());
    }

    #[test]
    fn test_alias_without_current_fails() {
        let (_, out, failures) = run("alias L = length\nL=5\n");
        assert_eq!(failures, 2);
        assert!(out.contains("no current solution"));
    }

    #[test]
    fn test_deps_and_reset() {
        let mut session = Session::new(Registry::new());
        session.run_line("solution a").unwrap();
        session.run_line("x@a=1").unwrap();
        session.run_line("y@a=x.a*2").unwrap();

        let deps = session.run_line("deps x.a").unwrap().unwrap();
        assert!(deps.contains("used by: y.a"));

        session.run_line("reset").unwrap();
        assert!(session.registry().is_empty());
        assert_eq!(session.current(), None);
    }

    #[test]
    fn test_info_is_json() {
        let mut session = Session::new(Registry::new());
        session.run_line("solution a").unwrap();
        session.run_line("x@a=1").unwrap();
        let json = session.run_line("info").unwrap().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["write_id"], "x@a");
    }
}
