//! Runtime trimming.
//!
//! Rules are matched against tree-relative paths:
//! - `prefix:<dir>` matches `<dir>` and everything beneath it
//! - `suffix:<s>` matches paths ending in `<s>`
//! - `component:<name>` matches paths with a segment equal to `<name>`
//!
//! A bare string is a prefix rule.

use log::{debug, info};

use crate::error::{BundleError, Result};
use crate::tree::{path, Entry, StagingTree};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    Prefix(String),
    Suffix(String),
    Component(String),
}

impl Rule {
    pub fn parse(raw: &str) -> Result<Self> {
        let bad = |why: &str| BundleError::Config(format!("trim rule '{raw}': {why}"));
        let rule = if let Some(p) = raw.strip_prefix("prefix:") {
            Rule::Prefix(path::normalize(p).map_err(|e| bad(&e))?)
        } else if let Some(s) = raw.strip_prefix("suffix:") {
            Rule::Suffix(s.to_string())
        } else if let Some(c) = raw.strip_prefix("component:") {
            if c.contains('/') {
                return Err(bad("a component cannot contain '/'"));
            }
            Rule::Component(c.to_string())
        } else {
            Rule::Prefix(path::normalize(raw).map_err(|e| bad(&e))?)
        };
        match &rule {
            Rule::Prefix(s) | Rule::Suffix(s) | Rule::Component(s) if s.is_empty() => {
                Err(bad("empty pattern"))
            }
            _ => Ok(rule),
        }
    }

    pub fn matches(&self, p: &str) -> bool {
        match self {
            Rule::Prefix(dir) => path::is_within(p, dir),
            Rule::Suffix(s) => p.ends_with(s.as_str()),
            Rule::Component(c) => p.split('/').any(|seg| seg == c),
        }
    }
}

/// Parse a list of rule strings.
pub fn parse_rules<S: AsRef<str>>(raw: &[S]) -> Result<Vec<Rule>> {
    raw.iter().map(|r| Rule::parse(r.as_ref())).collect()
}

/// Exclusions for an embedded CPython standard library: test suites, the
/// Tk GUI stack, legacy tooling and bytecode caches.
pub fn default_python_exclusions() -> Vec<Rule> {
    let mut rules: Vec<Rule> = [
        "test",
        "tests",
        "idle_test",
        "tkinter",
        "idlelib",
        "lib2to3",
        "turtledemo",
        "ensurepip",
        "__pycache__",
    ]
    .iter()
    .map(|c| Rule::Component(c.to_string()))
    .collect();
    rules.push(Rule::Suffix(".pyc".to_string()));
    rules
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrimRules {
    /// When non-empty, only entries matching one of these survive.
    pub include: Vec<Rule>,
    pub exclude: Vec<Rule>,
}

impl TrimRules {
    fn keeps(&self, p: &str) -> bool {
        (self.include.is_empty() || self.include.iter().any(|r| r.matches(p)))
            && !self.exclude.iter().any(|r| r.matches(p))
    }
}

/// Remove every entry the rules reject, returning the trimmed tree and the
/// number of file bytes removed.
///
/// A link that resolved before trimming and whose target was removed is a
/// [`BundleError::DanglingLink`]: the rules are too broad for this tree.
/// Removing the link itself along with its target is fine.
pub fn trim(mut tree: StagingTree, rules: &TrimRules) -> Result<(StagingTree, u64)> {
    let live: Vec<_> = tree
        .links()
        .into_iter()
        .filter_map(|l| tree.resolve(&l.path).map(|r| (l, r.path)))
        .collect();

    let mut bytes_removed = 0u64;
    let mut entries_removed = 0usize;
    tree.retain(|p, e| {
        let keep = rules.keeps(p);
        if !keep {
            debug!("trim: {p}");
            entries_removed += 1;
            if let Entry::File(f) = e {
                bytes_removed += f.size;
            }
        }
        keep
    });

    for (link, was) in live {
        if tree.get(&link.path).is_some() && tree.resolve(&link.path).is_none() {
            return Err(BundleError::DanglingLink {
                reason: format!("trimming removed its target '{was}'"),
                link: link.path,
                target: link.target,
            });
        }
    }

    info!("trimmed {entries_removed} entries ({bytes_removed} bytes)");
    Ok((tree, bytes_removed))
}
