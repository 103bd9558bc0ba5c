pub mod rules;

use arc_swap::ArcSwap;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::WafConfig;
use crate::gateway::context::RequestContext;
pub use rules::{Category, RuleLoadError, RuleSet, RuleSpec, Severity, Target, WafRule};

/// Size bounds enforced before any pattern is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WafLimits {
    pub max_body_bytes: usize,
    pub max_header_value_bytes: usize,
    pub max_headers: usize,
    pub max_uri_bytes: usize,
}

impl From<&WafConfig> for WafLimits {
    fn from(cfg: &WafConfig) -> Self {
        Self {
            max_body_bytes: cfg.max_body_bytes,
            max_header_value_bytes: cfg.max_header_value_bytes,
            max_headers: cfg.max_headers,
            max_uri_bytes: cfg.max_uri_bytes,
        }
    }
}

/// Which rule fired, and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleMatch {
    pub rule_id: String,
    pub category: Category,
    pub severity: Severity,
    pub target: Target,
}

impl RuleMatch {
    fn builtin_check(rule_id: &str, category: Category, target: Target) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            category,
            severity: Severity::Block,
            target,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Block(RuleMatch),
}

/// Result of inspecting one request: the decision plus any `log_only`
/// matches seen on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspection {
    pub decision: Decision,
    pub observed: Vec<RuleMatch>,
}

impl Inspection {
    fn block(m: RuleMatch, observed: Vec<RuleMatch>) -> Self {
        Self {
            decision: Decision::Block(m),
            observed,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self.decision, Decision::Block(_))
    }
}

/// Pattern-based request inspector.
///
/// The active rule set is swapped atomically on reload; an inspection in
/// flight keeps using the snapshot it started with.
#[derive(Debug)]
pub struct WafFilter {
    rules: ArcSwap<RuleSet>,
    limits: WafLimits,
    rules_file: Option<PathBuf>,
}

impl WafFilter {
    pub fn new(rules: RuleSet, limits: WafLimits) -> Self {
        Self {
            rules: ArcSwap::from_pointee(rules),
            limits,
            rules_file: None,
        }
    }

    pub fn from_config(cfg: &WafConfig) -> Result<Self, RuleLoadError> {
        let rules = match &cfg.rules_file {
            Some(path) => RuleSet::builtin_with_file(path)?,
            None => RuleSet::builtin(),
        };
        info!(rules = rules.len(), file = ?cfg.rules_file, "WAF rules loaded");
        Ok(Self {
            rules: ArcSwap::from_pointee(rules),
            limits: WafLimits::from(cfg),
            rules_file: cfg.rules_file.clone(),
        })
    }

    pub fn limits(&self) -> WafLimits {
        self.limits
    }

    pub fn rule_count(&self) -> usize {
        self.rules.load().len()
    }

    /// Re-read the configured rule file. On any error the current rules stay
    /// in force.
    pub fn reload(&self) -> Result<usize, RuleLoadError> {
        let path = self.rules_file.as_ref().ok_or(RuleLoadError::NoSource)?;
        let fresh = RuleSet::builtin_with_file(path)?;
        Ok(self.replace(fresh))
    }

    /// Install a prebuilt rule set, returning its size.
    pub fn replace(&self, rules: RuleSet) -> usize {
        let count = rules.len();
        self.rules.store(Arc::new(rules));
        count
    }

    /// Decide on a request. Pure over (rule set, request).
    pub fn inspect(&self, ctx: &RequestContext) -> Inspection {
        if let Some(m) = self.check_sizes(ctx) {
            return Inspection::block(m, Vec::new());
        }
        if let Some(m) = check_header_syntax(ctx) {
            return Inspection::block(m, Vec::new());
        }

        let rules = self.rules.load();
        let path = scan_forms(&ctx.path, false);
        let query = ctx.query.as_deref().map(|q| scan_forms(q, true)).unwrap_or_default();
        let body_text = String::from_utf8_lossy(&ctx.body);
        let body = scan_forms(&body_text, false);
        let headers: Vec<String> = ctx
            .headers
            .iter()
            .filter_map(|(_, v)| v.to_str().ok())
            .flat_map(|v| scan_forms(v, false))
            .collect();

        let mut observed = Vec::new();
        for rule in rules.rules() {
            let hit = [
                (Target::Path, path.as_slice()),
                (Target::Query, query.as_slice()),
                (Target::Body, body.as_slice()),
                (Target::Headers, headers.as_slice()),
            ]
            .into_iter()
            .filter(|(target, _)| rule.applies_to(*target))
            .find(|(_, inputs)| inputs.iter().any(|s| rule.is_match(s)))
            .map(|(target, _)| target);

            let Some(target) = hit else {
                continue;
            };
            let m = RuleMatch {
                rule_id: rule.id.clone(),
                category: rule.category,
                severity: rule.severity,
                target,
            };
            match rule.severity {
                Severity::Block => {
                    debug!(rule = %m.rule_id, category = %m.category, target = m.target.as_str(), "WAF block");
                    return Inspection::block(m, observed);
                }
                Severity::LogOnly => observed.push(m),
            }
        }

        Inspection {
            decision: Decision::Allow,
            observed,
        }
    }

    fn check_sizes(&self, ctx: &RequestContext) -> Option<RuleMatch> {
        let limits = &self.limits;
        if ctx.body_truncated || ctx.body.len() > limits.max_body_bytes {
            return Some(RuleMatch::builtin_check("body-size", Category::OversizedBody, Target::Body));
        }
        let declared = ctx
            .headers
            .get(axum::http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if declared.is_some_and(|n| n > limits.max_body_bytes as u64) {
            return Some(RuleMatch::builtin_check("body-size", Category::OversizedBody, Target::Body));
        }
        if ctx.uri_len() > limits.max_uri_bytes {
            return Some(RuleMatch::builtin_check("uri-size", Category::MalformedHeader, Target::Path));
        }
        if ctx.headers.len() > limits.max_headers {
            return Some(RuleMatch::builtin_check("header-count", Category::MalformedHeader, Target::Headers));
        }
        if ctx
            .headers
            .values()
            .any(|v| v.as_bytes().len() > limits.max_header_value_bytes)
        {
            return Some(RuleMatch::builtin_check("header-size", Category::MalformedHeader, Target::Headers));
        }
        None
    }
}

fn check_header_syntax(ctx: &RequestContext) -> Option<RuleMatch> {
    let control = ctx.headers.values().any(|v| {
        v.as_bytes()
            .iter()
            .any(|&b| (b < 0x20 && b != b'\t') || b == 0x7f)
    });
    if control {
        return Some(RuleMatch::builtin_check("header-control-char", Category::MalformedHeader, Target::Headers));
    }

    // Conflicting or non-numeric Content-Length values are a smuggling vector.
    let lengths: Vec<_> = ctx
        .headers
        .get_all(axum::http::header::CONTENT_LENGTH)
        .iter()
        .map(|v| v.to_str().ok().and_then(|s| s.trim().parse::<u64>().ok()))
        .collect();
    if lengths.iter().any(Option::is_none) || lengths.windows(2).any(|w| w[0] != w[1]) {
        return Some(RuleMatch::builtin_check("content-length", Category::MalformedHeader, Target::Headers));
    }
    None
}

/// The raw input plus its percent-decoded forms (decoded twice to catch
/// double encoding). Query strings also decode `+` as a space.
fn scan_forms(raw: &str, form_encoded: bool) -> Vec<String> {
    let mut forms = vec![raw.to_string()];
    let mut current = raw.to_string();
    for _ in 0..2 {
        let spaced: Cow<'_, str> = if form_encoded {
            Cow::Owned(current.replace('+', " "))
        } else {
            Cow::Borrowed(current.as_str())
        };
        let decoded = percent_decode_str(&spaced).decode_utf8_lossy().into_owned();
        if forms.contains(&decoded) {
            break;
        }
        forms.push(decoded.clone());
        current = decoded;
    }
    forms
}
