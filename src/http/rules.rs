//! HTTP rule tree: match-and-act rules for headers, paths, query arguments
//! and cookies.
//!
//! Rules are keyed by `(element, match key)`; several rules sharing a key
//! form an ordered action chain evaluated in declaration order. Header lines
//! stream through [`RuleEval::apply`] one at a time; [`RuleEval::finish`]
//! runs at end-of-headers so deferred `change` emissions happen only after
//! every `expect` had its chance to veto.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;

use crate::config::RuleConfig;
use crate::error::RelayError;
use crate::proxy::selector::hash32_str;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleDirection {
    #[default]
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleElement {
    #[default]
    Header,
    Path,
    Query,
    Cookie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Append,
    Change,
    Remove,
    Filter,
    Expect,
    Hash,
    Log,
    Mark,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub action: RuleAction,
    pub key: String,
    pub value: String,
    pub label: Option<String>,
    /// Nonzero gates the rule on the session mark (or sets it, for `mark`).
    pub mark: u32,
    id: usize,
}

/// What to do with the original line after rule evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Forward,
    Drop,
}

#[derive(Debug, Default)]
struct Chain {
    rules: Vec<Rule>,
}

/// One direction's rule tree: an ordered map from `(element, key)` to the
/// declaration-ordered action chain.
#[derive(Debug, Default)]
pub struct RuleTree {
    chains: BTreeMap<(RuleElement, String), Chain>,
    nrules: usize,
}

impl RuleTree {
    /// Build request/response trees from the protocol's rule list.
    pub fn build(rules: &[RuleConfig]) -> (RuleTree, RuleTree) {
        let mut request = RuleTree::default();
        let mut response = RuleTree::default();
        for rc in rules {
            let tree = match rc.direction {
                RuleDirection::Request => &mut request,
                RuleDirection::Response => &mut response,
            };
            tree.insert(rc);
        }
        (request, response)
    }

    fn insert(&mut self, rc: &RuleConfig) {
        // Header names match case-insensitively; fold the key once here.
        let key = match rc.element {
            RuleElement::Header => rc.key.to_ascii_lowercase(),
            _ => rc.key.clone(),
        };
        let id = self.nrules;
        self.nrules += 1;
        self.chains
            .entry((rc.element, key))
            .or_default()
            .rules
            .push(Rule {
                action: rc.action,
                key: rc.key.clone(),
                value: rc.value.clone().unwrap_or_default(),
                label: rc.label.clone(),
                mark: rc.mark.unwrap_or(0),
                id,
            });
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn has_element(&self, element: RuleElement) -> bool {
        self.chains.keys().any(|(el, _)| *el == element)
    }

    /// Header and cookie/query chains match their key exactly (headers
    /// case-folded); path chains treat the key as a glob over the path.
    fn lookup(&self, element: RuleElement, key: &str) -> Option<(usize, &Chain)> {
        let folded;
        let key = match element {
            RuleElement::Header => {
                folded = key.to_ascii_lowercase();
                folded.as_str()
            }
            _ => key,
        };
        self.chains
            .iter()
            .position(|((el, k), _)| {
                *el == element
                    && match element {
                        RuleElement::Path => glob_match(k, key),
                        _ => k == key,
                    }
            })
            .map(|pos| (pos, self.chains.values().nth(pos).unwrap()))
    }
}

/// Macro tokens usable inside `append`/`change` values.
#[derive(Debug, Clone)]
pub struct MacroEnv {
    pub remote: SocketAddr,
    pub server: SocketAddr,
    pub server_name: String,
    pub timeout_secs: u64,
}

impl MacroEnv {
    pub fn expand(&self, value: &str) -> String {
        if !value.contains('$') {
            return value.to_string();
        }
        value
            .replace("$REMOTE_ADDR", &self.remote.ip().to_string())
            .replace("$REMOTE_PORT", &self.remote.port().to_string())
            .replace("$SERVER_ADDR", &self.server.ip().to_string())
            .replace("$SERVER_PORT", &self.server.port().to_string())
            .replace("$SERVER_NAME", &self.server_name)
            .replace("$TIMEOUT", &self.timeout_secs.to_string())
    }
}

/// Case-folded glob match supporting `*` and `?`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(&pc), Some(&tc)) if pc.eq_ignore_ascii_case(&tc) => {
                inner(&p[1..], &t[1..])
            }
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

/// Session-side state the rule engine reads and writes.
pub struct EvalCtx<'a> {
    pub mark: &'a mut u32,
    pub hash_key: &'a mut u32,
    pub log: &'a mut String,
    pub macros: &'a MacroEnv,
}

/// Per-message evaluation state over one [`RuleTree`].
pub struct RuleEval {
    tree: Arc<RuleTree>,
    /// Occurrence counter per chain; a glob match resets it to 1 before the
    /// end-of-occurrence increment, so any occurrence after a match trips
    /// the repeated-header rejection.
    chain_count: Vec<u8>,
    /// Rules already applied during the header pass (append/change).
    applied: Vec<bool>,
}

impl RuleEval {
    pub fn new(tree: Arc<RuleTree>) -> Self {
        let chain_count = vec![0; tree.chains.len()];
        let applied = vec![false; tree.nrules];
        Self { tree, chain_count, applied }
    }

    /// Evaluate one element occurrence. `extra` receives additional header
    /// lines to emit in place of (or alongside) the original.
    pub fn apply(
        &mut self,
        element: RuleElement,
        key: &str,
        value: &str,
        ctx: &mut EvalCtx<'_>,
        extra: &mut Vec<String>,
    ) -> Result<Disposition, RelayError> {
        let tree = Arc::clone(&self.tree);
        let Some((chain_idx, chain)) = tree.lookup(element, key) else {
            return Ok(Disposition::Forward);
        };
        let is_header = element == RuleElement::Header;
        let mut pass = false;
        let mut matched_expect = false;

        for rule in &chain.rules {
            // Mark gating: a mismatched mark skips mutating actions but
            // still lets match-counting actions run their bookkeeping.
            let mark_ok = rule.mark == 0 || rule.mark == *ctx.mark;
            match rule.action {
                RuleAction::Expect | RuleAction::Filter | RuleAction::Mark => {}
                _ if !mark_ok => {
                    pass = true;
                    continue;
                }
                _ => {}
            }

            match rule.action {
                RuleAction::Append => {
                    if !is_header {
                        pass = true;
                        continue;
                    }
                    let expanded = ctx.macros.expand(&rule.value);
                    extra.push(format!("{}: {}, {}", rule.key, value, expanded));
                    self.applied[rule.id] = true;
                }
                RuleAction::Change | RuleAction::Remove => {
                    if !is_header {
                        pass = true;
                        continue;
                    }
                    // Original suppressed; change emits its value at
                    // end-of-headers so expect rules can veto first.
                }
                RuleAction::Expect => {
                    if self.chain_count[chain_idx] > 1 {
                        return Err(RelayError::http(400, "repeated header line"));
                    }
                    pass = true;
                    if mark_ok && value_match(rule, value) {
                        self.chain_count[chain_idx] = 1;
                        matched_expect = true;
                    }
                }
                RuleAction::Filter => {
                    pass = true;
                    if mark_ok && value_match(rule, value) {
                        self.chain_count[chain_idx] = 1;
                        log_note(ctx.log, rule, key, value);
                        return Err(match &rule.label {
                            Some(label) => {
                                RelayError::http_labeled(403, "rejecting request", label.clone())
                            }
                            None => RelayError::http(403, "rejecting request"),
                        });
                    }
                }
                RuleAction::Hash => {
                    *ctx.hash_key = hash32_str(value, *ctx.hash_key);
                    pass = true;
                }
                RuleAction::Log => {
                    log_note(ctx.log, rule, key, value);
                    pass = true;
                }
                RuleAction::Mark => {
                    // The rule's mark is the tag to set, not a gate.
                    if value_match(rule, value) {
                        *ctx.mark = rule.mark;
                    }
                    pass = true;
                }
            }
        }

        if matched_expect {
            self.chain_count[chain_idx] = self.chain_count[chain_idx].saturating_add(1);
        }

        Ok(if pass { Disposition::Forward } else { Disposition::Drop })
    }

    /// End-of-headers resolution: verify every `expect`, emit `change` and
    /// `append` values for headers that never occurred, reset counters.
    pub fn finish(
        &mut self,
        ctx: &mut EvalCtx<'_>,
        extra: &mut Vec<String>,
    ) -> Result<(), RelayError> {
        let tree = Arc::clone(&self.tree);
        for (chain_idx, chain) in tree.chains.values().enumerate() {
            for rule in &chain.rules {
                // A mismatched mark disables the rule entirely, including
                // its end-of-headers obligations.
                if rule.mark != 0 && rule.mark != *ctx.mark {
                    continue;
                }
                match rule.action {
                    RuleAction::Expect => {
                        let count = std::mem::take(&mut self.chain_count[chain_idx]);
                        if count <= 1 {
                            return Err(match &rule.label {
                                Some(label) => RelayError::http_labeled(
                                    403,
                                    "incomplete request",
                                    label.clone(),
                                ),
                                None => RelayError::http(403, "incomplete request"),
                            });
                        }
                    }
                    RuleAction::Filter => {
                        self.chain_count[chain_idx] = 0;
                    }
                    RuleAction::Append | RuleAction::Change => {
                        if std::mem::take(&mut self.applied[rule.id]) {
                            continue;
                        }
                        let expanded = ctx.macros.expand(&rule.value);
                        extra.push(format!("{}: {}", rule.key, expanded));
                        log_note(ctx.log, rule, &rule.key, &expanded);
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

/// A rule without a value matches on key presence alone.
fn value_match(rule: &Rule, value: &str) -> bool {
    rule.value.is_empty() || glob_match(&rule.value, value)
}

fn log_note(log: &mut String, rule: &Rule, key: &str, value: &str) {
    use std::fmt::Write;
    match &rule.label {
        Some(label) => {
            let _ = write!(log, " [{label}, {key}: {value}]");
        }
        None => {
            let _ = write!(log, " [{key}: {value}]");
        }
    }
}
