//! Quotas and policy rules enforced at allocation time
//!
//! A zero in any ceiling means the dimension is not limited, so a quota of
//! `{cpu: 400}` caps CPU without capping memory.

use crate::models::{Dimension, ResourceVector, Shortage};
use serde::{Deserialize, Serialize};

/// Ceiling on what one scope may hold across all pools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quota {
    pub scope: String,
    pub limits: ResourceVector,
}

impl Quota {
    /// Deficit of `used + request` against the limits
    pub fn shortage(&self, used: &ResourceVector, request: &ResourceVector) -> Shortage {
        exceeding(&used.saturating_add(request), &self.limits)
    }
}

/// Dimensions of `amount` above a non-zero `ceiling`
fn exceeding(amount: &ResourceVector, ceiling: &ResourceVector) -> Shortage {
    let mut shortage = Shortage::default();
    for d in Dimension::ALL {
        let limit = ceiling.get(d);
        let value = amount.get(d);
        if limit > 0 && value > limit {
            shortage.insert(d, value - limit);
        }
    }
    shortage
}

/// Named rule applied to every request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyRule {
    /// No single request may exceed `limits`
    MaxPerRequest { name: String, limits: ResourceVector },
    /// Keep `headroom` free in a pool (or every pool)
    MinFreeHeadroom {
        name: String,
        #[serde(default)]
        pool: Option<String>,
        headroom: ResourceVector,
    },
    /// Refuse every request from `scope`
    DenyScope { name: String, scope: String },
}

impl PolicyRule {
    pub fn name(&self) -> &str {
        match self {
            PolicyRule::MaxPerRequest { name, .. }
            | PolicyRule::MinFreeHeadroom { name, .. }
            | PolicyRule::DenyScope { name, .. } => name,
        }
    }

    /// Excess of a request over a per-request ceiling
    pub(super) fn per_request_excess(&self, request: &ResourceVector) -> Option<Shortage> {
        match self {
            PolicyRule::MaxPerRequest { limits, .. } => {
                let excess = exceeding(request, limits);
                (!excess.is_empty()).then_some(excess)
            }
            _ => None,
        }
    }

    pub(super) fn denies(&self, scope: Option<&str>) -> bool {
        matches!(self, PolicyRule::DenyScope { scope: denied, .. } if Some(denied.as_str()) == scope)
    }

    /// Headroom this rule keeps back in `pool`
    pub(super) fn headroom_for(&self, pool: &str) -> ResourceVector {
        match self {
            PolicyRule::MinFreeHeadroom {
                pool: target,
                headroom,
                ..
            } if target.as_deref().map_or(true, |t| t == pool) => *headroom,
            _ => ResourceVector::ZERO,
        }
    }
}

/// Largest headroom any rule keeps back in `pool`, per dimension
pub(super) fn headroom(rules: &[PolicyRule], pool: &str) -> ResourceVector {
    let mut out = ResourceVector::ZERO;
    for rule in rules {
        let h = rule.headroom_for(pool);
        for d in Dimension::ALL {
            out.set(d, out.get(d).max(h.get(d)));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_zero_means_unlimited() {
        let quota = Quota {
            scope: "team-a".to_string(),
            limits: ResourceVector::new(400, 0),
        };
        let used = ResourceVector::new(300, 10_000);
        let shortage = quota.shortage(&used, &ResourceVector::new(150, 50_000));
        assert_eq!(shortage.get(Dimension::Cpu), Some(50));
        assert_eq!(shortage.get(Dimension::Memory), None);
    }

    #[test]
    fn test_policy_rules() {
        let max = PolicyRule::MaxPerRequest {
            name: "small".to_string(),
            limits: ResourceVector::new(200, 4_096),
        };
        assert!(max.per_request_excess(&ResourceVector::new(100, 1_024)).is_none());
        let excess = max
            .per_request_excess(&ResourceVector::new(300, 1_024))
            .unwrap();
        assert_eq!(excess.get(Dimension::Cpu), Some(100));

        let deny = PolicyRule::DenyScope {
            name: "no-batch".to_string(),
            scope: "batch".to_string(),
        };
        assert!(deny.denies(Some("batch")));
        assert!(!deny.denies(Some("web")));
        assert!(!deny.denies(None));
    }

    #[test]
    fn test_headroom_takes_largest_matching_rule() {
        let rules = vec![
            PolicyRule::MinFreeHeadroom {
                name: "global".to_string(),
                pool: None,
                headroom: ResourceVector::new(50, 1_024),
            },
            PolicyRule::MinFreeHeadroom {
                name: "gpu".to_string(),
                pool: Some("gpu".to_string()),
                headroom: ResourceVector::new(100, 0),
            },
        ];
        assert_eq!(headroom(&rules, "local"), ResourceVector::new(50, 1_024));
        assert_eq!(headroom(&rules, "gpu"), ResourceVector::new(100, 1_024));
    }

    #[test]
    fn test_policy_rule_serde_shape() {
        let rule: PolicyRule = serde_json::from_value(serde_json::json!({
            "type": "deny_scope",
            "name": "no-batch",
            "scope": "batch"
        }))
        .unwrap();
        assert_eq!(rule.name(), "no-batch");
    }
}
