//! Label-based membership between Fleets and Agents.
//!
//! Fleets select agents Service-style: no ownership, just a label
//! selector. Agents pull defaults from the first fleet whose selector
//! matches them.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};

use crate::controllers::types::Result;
use crate::crds::{Agent, Fleet};

/// Evaluate a label selector against a label set. An absent selector
/// matches nothing (a fleet with no selector has no members); an empty
/// selector matches everything, per the usual API conventions.
#[must_use]
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let actual = labels.get(&expr.key);
            let values = expr.values.clone().unwrap_or_default();
            let matched = match expr.operator.as_str() {
                "In" => actual.is_some_and(|v| values.contains(v)),
                "NotIn" => !actual.is_some_and(|v| values.contains(v)),
                "Exists" => actual.is_some(),
                "DoesNotExist" => actual.is_none(),
                _ => false,
            };
            if !matched {
                return false;
            }
        }
    }

    true
}

/// List the agents in the fleet's namespace matching its selector.
pub async fn member_agents(client: &Client, fleet: &Fleet) -> Result<Vec<Agent>> {
    let namespace = fleet.namespace().unwrap_or_default();
    let agents: Api<Agent> = Api::namespaced(client.clone(), &namespace);
    let all = agents.list(&ListParams::default()).await?;

    let Some(selector) = &fleet.spec.agent_selector else {
        return Ok(Vec::new());
    };

    Ok(all
        .items
        .into_iter()
        .filter(|agent| {
            let labels = agent.metadata.labels.clone().unwrap_or_default();
            selector_matches(selector, &labels)
        })
        .collect())
}

/// Find the fleet whose selector matches this agent, if any. Used by the
/// agent reconciler to pull defaults; the fleet never pushes.
pub async fn owning_fleet(client: &Client, agent: &Agent) -> Result<Option<Fleet>> {
    let namespace = agent.namespace().unwrap_or_default();
    let fleets: Api<Fleet> = Api::namespaced(client.clone(), &namespace);
    let labels = agent.metadata.labels.clone().unwrap_or_default();

    for fleet in fleets.list(&ListParams::default()).await? {
        if let Some(selector) = &fleet.spec.agent_selector {
            if selector_matches(selector, &labels) {
                return Ok(Some(fleet));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn match_labels_require_exact_values() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("fleet", "alpha")])),
            match_expressions: None,
        };
        assert!(selector_matches(&selector, &labels(&[("fleet", "alpha"), ("x", "y")])));
        assert!(!selector_matches(&selector, &labels(&[("fleet", "beta")])));
        assert!(!selector_matches(&selector, &labels(&[])));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector = LabelSelector::default();
        assert!(selector_matches(&selector, &labels(&[("any", "thing")])));
        assert!(selector_matches(&selector, &labels(&[])));
    }

    #[test]
    fn match_expressions_in_and_exists() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "tier".to_string(),
                    operator: "In".to_string(),
                    values: Some(vec!["gold".to_string(), "silver".to_string()]),
                },
                LabelSelectorRequirement {
                    key: "domain".to_string(),
                    operator: "Exists".to_string(),
                    values: None,
                },
            ]),
        };
        assert!(selector_matches(
            &selector,
            &labels(&[("tier", "gold"), ("domain", "security")])
        ));
        assert!(!selector_matches(&selector, &labels(&[("tier", "gold")])));
        assert!(!selector_matches(
            &selector,
            &labels(&[("tier", "bronze"), ("domain", "security")])
        ));
    }

    #[test]
    fn match_expressions_not_in_and_does_not_exist() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "tier".to_string(),
                    operator: "NotIn".to_string(),
                    values: Some(vec!["bronze".to_string()]),
                },
                LabelSelectorRequirement {
                    key: "quarantined".to_string(),
                    operator: "DoesNotExist".to_string(),
                    values: None,
                },
            ]),
        };
        assert!(selector_matches(&selector, &labels(&[("tier", "gold")])));
        assert!(!selector_matches(&selector, &labels(&[("tier", "bronze")])));
        assert!(!selector_matches(
            &selector,
            &labels(&[("tier", "gold"), ("quarantined", "true")])
        ));
    }
}
