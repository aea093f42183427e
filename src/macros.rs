//! `%[name]` macro substitution.
//!
//! A [`MacroTable`] maps names to already-expanded values. Definitions are
//! eager: [`MacroTable::define`] resolves the raw text against the table as it
//! stands at that moment, so redefining a macro later never changes text that
//! was substituted before.
//!
//! Unknown names fall back to the environment lookup and then to the literal
//! name itself, so a stray placeholder degrades to plain text instead of
//! failing the run.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::{Captures, Regex};

use crate::error::SpawnError;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"%\[([^\[\]]+)\]").expect("placeholder pattern is valid")
});

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Named substitution values plus an environment fallback.
#[derive(Clone)]
pub struct MacroTable {
    values: HashMap<String, String>,
    // Overlay consulted before the environment lookup (`env` lines of a suite).
    overlay: HashMap<String, String>,
    env: EnvLookup,
}

impl fmt::Debug for MacroTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MacroTable")
            .field("values", &self.sorted())
            .field("overlay", &self.overlay)
            .finish_non_exhaustive()
    }
}

impl Default for MacroTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MacroTable {
    /// Table backed by the process environment.
    pub fn new() -> Self {
        Self::with_env(|name| std::env::var(name).ok())
    }

    /// Table with a custom environment lookup.
    pub fn with_env(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            values: HashMap::new(),
            overlay: HashMap::new(),
            env: Arc::new(lookup),
        }
    }

    /// Table that never consults the environment.
    #[cfg(test)]
    pub fn isolated() -> Self {
        Self::with_env(|_| None)
    }

    /// Resolves `raw` against the current table and stores the result.
    /// Returns the stored value.
    pub fn define(&mut self, name: &str, raw: &str) -> Result<String, SpawnError> {
        let value = self.resolve(raw)?;
        tracing::debug!(macro_name = name, raw, value = %value, "defining macro");
        self.values.insert(name.to_string(), value.clone());
        Ok(value)
    }

    /// Stores `value` as-is; placeholders inside it are expanded on lookup.
    pub fn insert_raw(&mut self, name: &str, value: impl Into<String>) {
        self.values.insert(name.to_string(), value.into());
    }

    /// Sets an environment value visible only to this table.
    pub fn set_env(&mut self, name: &str, value: impl Into<String>) {
        self.overlay.insert(name.to_string(), value.into());
    }

    /// Stored value of `name`, without any fallback.
    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Table value, else environment value, else the name itself.
    pub fn value_of(&self, name: &str) -> String {
        if let Some(v) = self.values.get(name) {
            return v.clone();
        }
        if let Some(v) = self.overlay.get(name) {
            return v.clone();
        }
        (self.env)(name).unwrap_or_else(|| name.to_string())
    }

    /// Replaces every `%[name]` in `text` until none remain.
    ///
    /// At most `len() + 1` passes are made; if placeholders survive that, or a
    /// pass leaves the text unchanged, the first surviving name is reported as
    /// [`SpawnError::MacroCycle`].
    pub fn resolve(&self, text: &str) -> Result<String, SpawnError> {
        let mut current = text.to_string();
        for _ in 0..=self.values.len() {
            if !PLACEHOLDER.is_match(&current) {
                return Ok(current);
            }
            let next = PLACEHOLDER
                .replace_all(&current, |caps: &Captures| self.value_of(&caps[1]))
                .into_owned();
            if next == current {
                break;
            }
            current = next;
        }
        match PLACEHOLDER.captures(&current) {
            Some(caps) => Err(SpawnError::MacroCycle(caps[1].to_string())),
            None => Ok(current),
        }
    }

    /// Name/value pairs in name order.
    pub fn sorted(&self) -> BTreeMap<&str, &str> {
        self.values
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_name_degrades_to_literal() {
        let mut table = MacroTable::isolated();
        table.define("host", "cluster1").unwrap();
        let out = table
            .resolve("running on %[host] as %[unknownuser]")
            .unwrap();
        assert_eq!(out, "running on cluster1 as unknownuser");
    }

    #[test]
    fn environment_is_consulted_before_literal() {
        let table = MacroTable::with_env(|name| (name == "USER").then(|| "eijkhout".to_string()));
        assert_eq!(table.resolve("%[USER]/%[HOME]").unwrap(), "eijkhout/HOME");
    }

    #[test]
    fn overlay_shadows_environment() {
        let mut table = MacroTable::with_env(|_| Some("from-env".into()));
        table.set_env("OMP_PLACES", "cores");
        assert_eq!(table.value_of("OMP_PLACES"), "cores");
        assert_eq!(table.value_of("OTHER"), "from-env");
    }

    #[test]
    fn define_is_eager() {
        let mut table = MacroTable::isolated();
        table.define("compiler", "intel").unwrap();
        table.define("tag", "%[compiler]-run").unwrap();
        table.define("compiler", "gcc").unwrap();
        assert_eq!(table.get("tag"), Some("intel-run"));
        assert_eq!(table.resolve("%[compiler]").unwrap(), "gcc");
    }

    #[test]
    fn self_reference_in_define_uses_literal_name() {
        let mut table = MacroTable::isolated();
        let stored = table.define("path", "%[path]/bin").unwrap();
        assert_eq!(stored, "path/bin");
    }

    #[test]
    fn raw_chain_resolves_within_table_size() {
        let mut table = MacroTable::isolated();
        table.insert_raw("a", "%[b]");
        table.insert_raw("b", "%[c]");
        table.insert_raw("c", "done");
        assert_eq!(table.resolve("x %[a] y").unwrap(), "x done y");
    }

    #[test]
    fn raw_cycle_is_reported() {
        let mut table = MacroTable::isolated();
        table.insert_raw("a", "%[b]");
        table.insert_raw("b", "%[a]");
        let err = table.resolve("%[a]").unwrap_err();
        assert!(matches!(err, SpawnError::MacroCycle(_)));
    }

    #[test]
    fn raw_self_reference_is_reported() {
        let mut table = MacroTable::isolated();
        table.insert_raw("loop", "%[loop]");
        let err = table.resolve("%[loop]").unwrap_err();
        assert_eq!(err.to_string(), "unresolved macro: loop");
    }

    #[test]
    fn resolution_is_idempotent() {
        let mut table = MacroTable::isolated();
        table.define("nodes", "4").unwrap();
        table.define("name", "bench-%[nodes]").unwrap();
        let once = table.resolve("%[name] on %[nodes] nodes, %[missing]").unwrap();
        let twice = table.resolve(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn text_without_placeholders_is_untouched() {
        let table = MacroTable::isolated();
        assert_eq!(table.resolve("100% [done]").unwrap(), "100% [done]");
    }
}
