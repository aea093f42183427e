//! Line-oriented suite configuration files.
//!
//! ```text
//! # comment
//! let base = /work/bench
//! outputdir %[base]/runs/%[date]
//! queue normal limit:4
//! nodes 1,2,4
//! ppn 24
//! env I_MPI_PIN 1
//! sbatch --exclusive
//! regression grep:Time:_ field:2 margin:10p
//! suite name:npb type:mpi dir:%[base]/bin cg.* ep.C.x
//! ```
//!
//! Every `suite` line takes a snapshot of the options and macros defined so
//! far, so later lines only affect later suites.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::error::SpawnError;
use crate::macros::MacroTable;
use crate::regression::RegressionDirective;

/// Plain key/value options plus the repeatable `env` and `sbatch` lines.
#[derive(Debug, Clone, Default)]
pub struct Options {
    values: BTreeMap<String, String>,
    pub env: Vec<(String, String)>,
    pub sbatch: Vec<String>,
}

impl Options {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDecl {
    pub name: String,
    pub limit: usize,
}

/// One `suite` line together with the configuration in force when it was read.
#[derive(Debug, Clone)]
pub struct SuiteSpec {
    pub name: String,
    /// Prefix for the program invocation; `type:mpi` selects `ibrun `.
    pub runner: String,
    pub dir: PathBuf,
    /// Application names, possibly with `*` wildcards.
    pub apps: Vec<String>,
    pub nodes: Vec<u32>,
    pub ppn: Vec<u32>,
    pub threads: Vec<i32>,
    pub regression: Option<RegressionDirective>,
    pub options: Options,
    pub macros: MacroTable,
}

#[derive(Debug, Clone, Default)]
pub struct Configuration {
    pub queues: Vec<QueueDecl>,
    pub suites: Vec<SuiteSpec>,
}

/// Reads `path`, taking `system` from `TACC_SYSTEM` and `date` from today.
pub fn parse_file(path: &Path) -> Result<Configuration, SpawnError> {
    let text = std::fs::read_to_string(path)?;
    let system = std::env::var("TACC_SYSTEM").ok();
    let today = chrono::Local::now().date_naive();
    parse_str(&text, MacroTable::new(), system, today)
}

pub fn parse_str(
    text: &str,
    macros: MacroTable,
    system: Option<String>,
    today: NaiveDate,
) -> Result<Configuration, SpawnError> {
    let mut parser = ConfigParser::new(macros, system, today)?;
    for (index, line) in text.lines().enumerate() {
        parser.line(line).map_err(|err| match err {
            SpawnError::Config(msg) => SpawnError::Config(format!("line {}: {msg}", index + 1)),
            other => other,
        })?;
    }
    Ok(parser.finish())
}

struct ConfigParser {
    macros: MacroTable,
    system: Option<String>,
    options: Options,
    config: Configuration,
}

impl ConfigParser {
    fn new(mut macros: MacroTable, system: Option<String>, today: NaiveDate) -> Result<Self, SpawnError> {
        macros.define("date", &today.format("%Y-%m-%d").to_string())?;
        if let Some(system) = &system {
            macros.define("system", system)?;
        }
        Ok(Self {
            macros,
            system,
            options: Options::default(),
            config: Configuration::default(),
        })
    }

    fn line(&mut self, line: &str) -> Result<(), SpawnError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }

        if let Some(definition) = line.strip_prefix("let ") {
            let (name, raw) = definition
                .split_once('=')
                .ok_or_else(|| SpawnError::Config(format!("let needs NAME = VALUE: <<{line}>>")))?;
            self.macros.define(name.trim(), raw.trim())?;
            return Ok(());
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        let (key, rest) = match line.split_once(char::is_whitespace) {
            Some((key, rest)) => (key, rest.trim()),
            None => {
                return Err(SpawnError::Config(format!("option without value: <<{line}>>")));
            }
        };

        match key {
            "suite" => self.suite(&fields[1..]),
            "env" => self.env(&fields),
            "sbatch" => {
                let directive = self.macros.resolve(rest)?;
                self.options.sbatch.push(directive);
                Ok(())
            }
            "queue" if fields.len() > 2 => self.queue(&fields[1..]),
            "cores" => Err(SpawnError::Config(
                "cores keyword not supported, use nodes and ppn".into(),
            )),
            _ if fields.len() == 2 => self.key_value(key, fields[1]),
            _ => {
                let value = self.macros.define(key, rest)?;
                tracing::debug!(key, value = %value, "setting option");
                self.options.set(key, value);
                Ok(())
            }
        }
    }

    fn key_value(&mut self, key: &str, raw: &str) -> Result<(), SpawnError> {
        if key == "system"
            && let Some(system) = &self.system
            && raw != system.as_str()
        {
            return Err(SpawnError::Config(format!(
                "this configuration can only be run on <<{raw}>>, not <<{system}>>"
            )));
        }
        let value = self.macros.define(key, raw)?;
        if matches!(key, "nodes" | "ppn" | "threads") {
            parse_counts(key, &value)?;
        }
        tracing::debug!(key, value = %value, "setting option");
        self.options.set(key, value);
        Ok(())
    }

    fn queue(&mut self, fields: &[&str]) -> Result<(), SpawnError> {
        let name = self.macros.resolve(fields[0])?;
        let mut limit = 1;
        for field in &fields[1..] {
            match field.split_once(':') {
                Some(("limit", value)) => {
                    limit = value.parse().map_err(|_| {
                        SpawnError::Config(format!("invalid queue limit <<{value}>>"))
                    })?;
                }
                _ => return Err(SpawnError::Config(format!("unknown queue option <<{field}>>"))),
            }
        }
        match self.config.queues.iter_mut().find(|q| q.name == name) {
            Some(decl) => decl.limit = limit,
            None => self.config.queues.push(QueueDecl {
                name: name.clone(),
                limit,
            }),
        }
        self.macros.define("queue", &name)?;
        self.options.set("queue", name);
        Ok(())
    }

    fn env(&mut self, fields: &[&str]) -> Result<(), SpawnError> {
        if fields.len() < 3 {
            return Err(SpawnError::Config("env needs NAME VALUE".into()));
        }
        let name = fields[1].to_string();
        let value = self.macros.resolve(&fields[2..].join(" "))?;
        tracing::debug!(name = %name, value = %value, "suite environment variable");
        self.macros.set_env(&name, value.clone());
        match self.options.env.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.options.env.push((name, value)),
        }
        Ok(())
    }

    fn suite(&mut self, fields: &[&str]) -> Result<(), SpawnError> {
        let mut name = "unknown".to_string();
        let mut runner = String::new();
        let mut dir = PathBuf::from(".");
        let mut apps = Vec::new();

        for field in fields {
            let field = self.macros.resolve(field)?;
            match field.split_once(':') {
                Some(("name", v)) => name = v.to_string(),
                Some(("type", "mpi")) => runner = "ibrun ".to_string(),
                Some(("type", _)) => runner.clear(),
                Some(("dir", v)) => dir = PathBuf::from(v),
                Some((k, _)) => tracing::warn!(option = k, "ignoring unknown suite option"),
                None => apps.push(field),
            }
        }
        if apps.is_empty() {
            return Err(SpawnError::Config(format!("suite {name} lists no applications")));
        }

        let counts = |key: &str, default: &str| {
            parse_counts(key, self.options.get(key).unwrap_or(default))
        };
        let nodes = positive(counts("nodes", "1")?, "nodes")?;
        let ppn = positive(counts("ppn", "1")?, "ppn")?;
        let threads = counts("threads", "0")?;
        let regression = RegressionDirective::parse(self.options.get("regression").unwrap_or(""))?;

        tracing::info!(suite = %name, apps = apps.len(), "defining suite");
        self.config.suites.push(SuiteSpec {
            name,
            runner,
            dir,
            apps,
            nodes,
            ppn,
            threads,
            regression,
            options: self.options.clone(),
            macros: self.macros.clone(),
        });
        Ok(())
    }

    fn finish(self) -> Configuration {
        self.config
    }
}

/// `1,2,4` style list. Range notation with `:` is rejected.
pub fn parse_counts(key: &str, value: &str) -> Result<Vec<i32>, SpawnError> {
    if value.contains(':') {
        return Err(SpawnError::Config(format!(
            "colon notation not supported for {key}: <<{value}>>"
        )));
    }
    value
        .split(',')
        .map(|part| {
            part.trim().parse::<i32>().map_err(|_| {
                SpawnError::Config(format!("could not parse {key} specification <<{value}>>"))
            })
        })
        .collect()
}

fn positive(values: Vec<i32>, key: &str) -> Result<Vec<u32>, SpawnError> {
    values
        .into_iter()
        .map(|v| {
            u32::try_from(v)
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| SpawnError::Config(format!("{key} must be positive, got {v}")))
        })
        .collect()
}
