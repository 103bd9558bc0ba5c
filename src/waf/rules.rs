use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Compiled size limit per pattern; keeps hostile rule files from blowing up
/// memory.
const MAX_COMPILED_RULE_BYTES: usize = 1 << 20;

/// Inspection category, declared in scan priority order: injection classes
/// first, generic anomalies last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    SqlInjection,
    CommandInjection,
    Xss,
    PathTraversal,
    MalformedHeader,
    OversizedBody,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::SqlInjection => "sql_injection",
            Category::CommandInjection => "command_injection",
            Category::Xss => "xss",
            Category::PathTraversal => "path_traversal",
            Category::MalformedHeader => "malformed_header",
            Category::OversizedBody => "oversized_body",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Block,
    LogOnly,
}

/// Part of the request a rule is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Path,
    Query,
    Body,
    Headers,
}

impl Target {
    pub fn as_str(self) -> &'static str {
        match self {
            Target::Path => "path",
            Target::Query => "query",
            Target::Body => "body",
            Target::Headers => "headers",
        }
    }
}

fn default_targets() -> Vec<Target> {
    vec![Target::Path, Target::Query, Target::Body]
}

/// Rule as written in a rule file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    pub id: String,
    pub pattern: String,
    pub category: Category,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default = "default_targets")]
    pub targets: Vec<Target>,
}

#[derive(Debug, Error)]
pub enum RuleLoadError {
    #[error("reading rule file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing rule file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("rule {id}: invalid pattern: {source}")]
    InvalidPattern {
        id: String,
        #[source]
        source: regex::Error,
    },
    #[error("duplicate rule id {0}")]
    DuplicateId(String),
    #[error("rule {0} has no targets")]
    NoTargets(String),
    #[error("no rule file configured")]
    NoSource,
}

#[derive(Debug, Clone)]
pub struct WafRule {
    pub id: String,
    pub category: Category,
    pub severity: Severity,
    pub targets: Vec<Target>,
    regex: Regex,
}

impl WafRule {
    pub fn compile(spec: RuleSpec) -> Result<Self, RuleLoadError> {
        if spec.targets.is_empty() {
            return Err(RuleLoadError::NoTargets(spec.id));
        }
        let regex = RegexBuilder::new(&spec.pattern)
            .size_limit(MAX_COMPILED_RULE_BYTES)
            .build()
            .map_err(|source| RuleLoadError::InvalidPattern {
                id: spec.id.clone(),
                source,
            })?;
        Ok(Self {
            id: spec.id,
            category: spec.category,
            severity: spec.severity,
            targets: spec.targets,
            regex,
        })
    }

    pub fn applies_to(&self, target: Target) -> bool {
        self.targets.contains(&target)
    }

    pub fn is_match(&self, input: &str) -> bool {
        self.regex.is_match(input)
    }
}

/// Immutable, priority-ordered rule list.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<WafRule>,
}

impl RuleSet {
    pub fn from_specs(specs: Vec<RuleSpec>) -> Result<Self, RuleLoadError> {
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(specs.len());
        for spec in specs {
            if !seen.insert(spec.id.clone()) {
                return Err(RuleLoadError::DuplicateId(spec.id));
            }
            rules.push(WafRule::compile(spec)?);
        }
        // Stable: declaration order is kept within a category.
        rules.sort_by_key(|r| r.category);
        Ok(Self { rules })
    }

    pub fn builtin() -> Self {
        // The built-in patterns are fixed and covered by tests.
        Self::from_specs(builtin_specs()).unwrap_or_default()
    }

    /// Built-in rules followed by the rules in `path`.
    pub fn builtin_with_file(path: &Path) -> Result<Self, RuleLoadError> {
        let raw = std::fs::read_to_string(path).map_err(|source| RuleLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let extra: Vec<RuleSpec> = serde_json::from_str(&raw)?;
        let mut specs = builtin_specs();
        specs.extend(extra);
        Self::from_specs(specs)
    }

    pub fn rules(&self) -> &[WafRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn rule(id: &str, category: Category, pattern: &str, targets: &[Target]) -> RuleSpec {
    RuleSpec {
        id: id.to_string(),
        pattern: pattern.to_string(),
        category,
        severity: Severity::Block,
        targets: targets.to_vec(),
    }
}

pub fn builtin_specs() -> Vec<RuleSpec> {
    use Category::*;
    use Target::*;
    const PQB: &[Target] = &[Path, Query, Body];
    const PQBH: &[Target] = &[Path, Query, Body, Headers];
    const PQ: &[Target] = &[Path, Query];

    let mut specs = vec![
        rule("sqli-tautology", SqlInjection, r#"(?i)['"]\s*(or|and)\s*['"]?\w*['"]?\s*(=|like)\s*['"]?\w*"#, PQBH),
        rule("sqli-numeric-tautology", SqlInjection, r"(?i)\b(or|and)\s+(\d+)\s*=\s*\d+\b", PQ),
        rule("sqli-union-select", SqlInjection, r"(?i)\bunion\b(\s+all)?\s+select\b", PQBH),
        rule("sqli-stacked-ddl", SqlInjection, r"(?i);\s*(drop|truncate|alter)\s+(table|database)\b", PQB),
        rule("sqli-quote-comment", SqlInjection, r#"(?i)['"]\s*(--|#|/\*)"#, PQ),
        rule("sqli-time-based", SqlInjection, r"(?i)\b(pg_sleep|benchmark)\s*\(|\bwaitfor\s+delay\b", PQB),
        rule(
            "cmd-chained-shell",
            CommandInjection,
            r"(?i)(;|\|\|?|&&|\$\(|`)\s*(cat|ls|id|whoami|uname|wget|curl|nc|bash|sh|rm|chmod|python|perl)\b",
            PQBH,
        ),
        rule("cmd-ifs-evasion", CommandInjection, r"\$\{IFS\}|\$IFS\b", PQB),
        rule("xss-script-tag", Xss, r"(?i)<\s*script\b", PQBH),
        rule("xss-event-handler", Xss, r"(?i)<[a-z][^>]*\bon[a-z]+\s*=", PQB),
        rule("xss-javascript-uri", Xss, r"(?i)javascript\s*:", PQB),
        rule("xss-embedded-object", Xss, r"(?i)<\s*(iframe|object|embed)\b", PQB),
        rule("traversal-dot-dot", PathTraversal, r"(^|[/\\])\.\.([/\\]|$)", PQ),
        rule("traversal-sensitive-file", PathTraversal, r"(?i)/etc/(passwd|shadow)\b|\\windows\\win\.ini", PQB),
        rule("header-jndi-lookup", MalformedHeader, r"(?i)\$\{jndi:", &[Headers, Query, Body]),
    ];

    // Observation only: keyword pairs common in probes but also in prose.
    let mut keywords = rule(
        "sqli-keyword-pair",
        SqlInjection,
        r"(?i)\b(select|delete)\b.{1,64}\bfrom\b",
        &[Query, Body],
    );
    keywords.severity = Severity::LogOnly;
    specs.push(keywords);
    specs
}
