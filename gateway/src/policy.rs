use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::rate_limit::{RateKey, RateLimiterRegistry, RateOutcome, RateQuota};

/// Outcome of policy evaluation, carried by value through the request
/// pipeline. Rate limiting and approval are normal flow, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
    Ask,
    RateLimited { retry_after_secs: u64 },
}

/// Declarative per-endpoint rule. First matching rule wins; an endpoint with
/// no matching rule denies.
#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    /// HTTP verb to match, or `*` for any.
    #[serde(default = "any_method")]
    pub method: String,
    /// Path glob: `*` matches one non-empty segment, `**` any (possibly
    /// empty) run of segments, everything else is literal.
    #[serde(default = "any_path")]
    pub path: String,
    pub action: RuleAction,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub rate_limit: Option<RuleQuota>,
    #[serde(default)]
    pub body_predicate: Option<Vec<BodyMatch>>,
}

fn any_method() -> String {
    "*".into()
}

fn any_path() -> String {
    "**".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
    Ask,
}

/// Rate quota as written in config, e.g. `{ max = 2, window = "1m" }`.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleQuota {
    pub max: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl RuleQuota {
    fn as_quota(&self) -> RateQuota {
        RateQuota {
            max: self.max,
            window: self.window,
        }
    }
}

/// One condition over the request body; all conditions of a predicate must
/// hold. A predicate never holds against a missing or non-JSON body.
#[derive(Debug, Clone, Deserialize)]
pub struct BodyMatch {
    /// JSON pointer into the request body, e.g. `/segments/0/command`.
    pub pointer: String,
    #[serde(default)]
    pub equals: Option<Value>,
    #[serde(default)]
    pub contains: Option<String>,
}

impl BodyMatch {
    fn holds(&self, body: &Value) -> bool {
        let Some(target) = body.pointer(&self.pointer) else {
            return false;
        };
        if let Some(expected) = &self.equals {
            if target != expected {
                return false;
            }
        }
        if let Some(needle) = &self.contains {
            match target.as_str() {
                Some(text) if text.contains(needle.as_str()) => {}
                _ => return false,
            }
        }
        true
    }
}

/// The request facts the policy engine sees.
#[derive(Debug, Clone, Copy)]
pub struct PolicyRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub agent_id: &'a str,
    pub body: Option<&'a Value>,
}

/// First-match rule evaluator. Pure except for rate-limit admission, which
/// mutates the shared registry.
pub struct PolicyEngine {
    rates: Arc<RateLimiterRegistry>,
}

impl PolicyEngine {
    pub fn new(rates: Arc<RateLimiterRegistry>) -> Self {
        Self { rates }
    }

    pub fn evaluate(&self, endpoint: &str, rules: &[Rule], request: &PolicyRequest<'_>) -> Decision {
        for (rule_index, rule) in rules.iter().enumerate() {
            if !method_matches(&rule.method, request.method) {
                continue;
            }
            if !glob_matches(&rule.path, request.path) {
                continue;
            }
            if let Some(predicate) = &rule.body_predicate {
                let Some(body) = request.body else { continue };
                if !predicate.iter().all(|condition| condition.holds(body)) {
                    continue;
                }
            }

            return match rule.action {
                RuleAction::Deny => Decision::Deny(rule.message.clone().unwrap_or_default()),
                RuleAction::Ask => Decision::Ask,
                RuleAction::Allow => match &rule.rate_limit {
                    None => Decision::Allow,
                    Some(quota) => {
                        let key = RateKey {
                            endpoint: endpoint.to_string(),
                            rule_index,
                            agent_id: request.agent_id.to_string(),
                        };
                        match self.rates.check(&key, &quota.as_quota()) {
                            RateOutcome::Admitted => Decision::Allow,
                            exceeded => Decision::RateLimited {
                                retry_after_secs: exceeded
                                    .retry_after_secs()
                                    .unwrap_or(quota.window.as_secs().max(1)),
                            },
                        }
                    }
                },
            };
        }

        Decision::Deny("no matching rule".into())
    }

    /// Whether any rule needs the parsed request body. Callers only buffer
    /// and parse JSON when this returns true.
    pub fn needs_body(rules: &[Rule]) -> bool {
        rules.iter().any(|rule| rule.body_predicate.is_some())
    }
}

fn method_matches(pattern: &str, method: &str) -> bool {
    pattern == "*" || pattern.eq_ignore_ascii_case(method)
}

/// Segment-wise glob match. The query string must already be stripped;
/// leading/trailing slashes are insignificant.
pub fn glob_matches(pattern: &str, path: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path: Vec<&str> = path
        .split('?')
        .next()
        .unwrap_or_default()
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    segments_match(&pattern, &path)
}

fn segments_match(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => (0..=path.len()).any(|skip| segments_match(rest, &path[skip..])),
        Some((&"*", rest)) => match path.split_first() {
            Some((_, tail)) => segments_match(rest, tail),
            None => false,
        },
        Some((literal, rest)) => match path.split_first() {
            Some((segment, tail)) => segment == literal && segments_match(rest, tail),
            None => false,
        },
    }
}
