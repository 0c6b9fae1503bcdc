//! External command lines
//!
//! [`CommandSpec`] is a structured argument list: a program, ordered flag /
//! value groups, a working directory and extra environment. It renders to an
//! argv for spawning and to a single string for logs, failure reports and
//! step fingerprints.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// One flag with its values, or a bare positional value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandArg {
    pub flag: Option<String>,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<CommandArg>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Inherit the terminal and wait for the user to close the program
    pub interactive: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            interactive: false,
        }
    }

    /// `flag value`
    pub fn arg(mut self, flag: &str, value: impl fmt::Display) -> Self {
        self.args.push(CommandArg {
            flag: Some(flag.to_string()),
            values: vec![value.to_string()],
        });
        self
    }

    /// `flag value` with the value printed to six decimals
    pub fn arg_f64(self, flag: &str, value: f64) -> Self {
        self.arg(flag, format!("{:.6}", value))
    }

    pub fn arg_path(self, flag: &str, path: &Path) -> Self {
        self.arg(flag, path.display())
    }

    /// `flag v1 v2 ...`
    pub fn args<I, S>(mut self, flag: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: fmt::Display,
    {
        self.args.push(CommandArg {
            flag: Some(flag.to_string()),
            values: values.into_iter().map(|v| v.to_string()).collect(),
        });
        self
    }

    /// A flag without a value
    pub fn switch(mut self, flag: &str) -> Self {
        self.args.push(CommandArg {
            flag: Some(flag.to_string()),
            values: Vec::new(),
        });
        self
    }

    pub fn positional(mut self, value: impl fmt::Display) -> Self {
        self.args.push(CommandArg {
            flag: None,
            values: vec![value.to_string()],
        });
        self
    }

    /// Free-form user arguments, split on whitespace
    pub fn extra(mut self, text: &str) -> Self {
        for token in text.split_whitespace() {
            self.args.push(CommandArg {
                flag: None,
                values: vec![token.to_string()],
            });
        }
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// Arguments in spawn order
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::new();
        for arg in &self.args {
            if let Some(flag) = &arg.flag {
                argv.push(flag.clone());
            }
            argv.extend(arg.values.iter().cloned());
        }
        argv
    }

    /// Arguments joined by single spaces
    pub fn argument_string(&self) -> String {
        self.argv().join(" ")
    }

    /// Value following `flag`, if present
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|a| a.flag.as_deref() == Some(flag))
            .and_then(|a| a.values.first())
            .map(String::as_str)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        let args = self.argument_string();
        if !args.is_empty() {
            write!(f, " {}", args)?;
        }
        Ok(())
    }
}
