//! Per-destination request header policy.
//!
//! An ordered list of hostname patterns, each with a set of header actions.
//! The first pattern matching the target hostname is applied; later ones are
//! ignored even when they would also match.

use axum::http::header::{HeaderName, HeaderValue, HOST};
use axum::http::HeaderMap;
use regex::Regex;

use crate::config::HeaderRuleConfig;
use crate::target::Target;

/// Reserved action value that removes the header.
pub const DELETE: &str = "DELETE";
/// Reserved action value that leaves the header as received.
pub const KEEP: &str = "KEEP";

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("invalid hostname pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid header name `{0}`")]
    HeaderName(String),

    #[error("invalid value for header `{0}`")]
    HeaderValue(String),

    /// Two keys of one rule name the same header once case is ignored.
    #[error("header `{0}` appears more than once in rule `{1}`")]
    DuplicateHeader(String, String),
}

/// What to do with one header when a rule matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderAction {
    Delete,
    Keep,
    Set(HeaderValue),
}

impl HeaderAction {
    fn parse(header: &str, value: &str) -> Result<Self, RuleError> {
        Ok(match value {
            DELETE => HeaderAction::Delete,
            KEEP => HeaderAction::Keep,
            literal => HeaderAction::Set(
                HeaderValue::from_str(literal)
                    .map_err(|_| RuleError::HeaderValue(header.to_string()))?,
            ),
        })
    }
}

#[derive(Debug, Clone)]
struct HeaderRule {
    pattern: Regex,
    actions: Vec<(HeaderName, HeaderAction)>,
}

/// Compiled, immutable header policy shared by all requests.
#[derive(Debug, Clone)]
pub struct HeaderRuleSet {
    rules: Vec<HeaderRule>,
}

impl HeaderRuleSet {
    /// Compile configured rules, preserving their order.
    pub fn compile(configs: &[HeaderRuleConfig]) -> Result<Self, RuleError> {
        let rules = configs
            .iter()
            .map(|cfg| {
                let pattern = Regex::new(&cfg.pattern).map_err(|source| RuleError::Pattern {
                    pattern: cfg.pattern.clone(),
                    source,
                })?;
                let actions = cfg
                    .rules
                    .iter()
                    .map(|(name, value)| {
                        let header = HeaderName::from_bytes(name.as_bytes())
                            .map_err(|_| RuleError::HeaderName(name.clone()))?;
                        Ok((header, HeaderAction::parse(name, value)?))
                    })
                    .collect::<Result<Vec<(HeaderName, HeaderAction)>, RuleError>>()?;

                // Table keys have no reliable order, so a header may only
                // be named once per rule.
                for (i, (name, _)) in actions.iter().enumerate() {
                    if actions[..i].iter().any(|(seen, _)| seen == name) {
                        return Err(RuleError::DuplicateHeader(
                            name.to_string(),
                            cfg.pattern.clone(),
                        ));
                    }
                }
                Ok(HeaderRule { pattern, actions })
            })
            .collect::<Result<Vec<_>, RuleError>>()?;

        Ok(Self { rules })
    }

    /// Produce the outbound headers for `target` from the inbound ones.
    ///
    /// The inbound map is left untouched. A `Host` header is synthesized from
    /// the target when none survives rule application.
    pub fn apply(&self, inbound: &HeaderMap, target: &Target) -> HeaderMap {
        let mut headers = inbound.clone();
        let hostname = target.hostname();

        if let Some(rule) = self.rules.iter().find(|r| r.pattern.is_match(hostname)) {
            for (name, action) in &rule.actions {
                match action {
                    HeaderAction::Delete => {
                        headers.remove(name);
                    }
                    HeaderAction::Keep => {}
                    HeaderAction::Set(value) => {
                        headers.insert(name.clone(), value.clone());
                    }
                }
            }
        }

        if !headers.contains_key(HOST) {
            if let Ok(host) = HeaderValue::from_str(&target.host_header()) {
                headers.insert(HOST, host);
            }
        }

        headers
    }
}
