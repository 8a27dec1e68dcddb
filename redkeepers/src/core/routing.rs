//! Agent routing and model-profile resolution.

use crate::core::policy::{AgentModel, ModelPolicy, RoutingPolicy};
use crate::core::types::{AgentCatalog, AgentEntry, Priority, WorkItem};

/// Agent id the item would be routed to, without consulting the catalog.
///
/// Used by the scheduler for load tie-breaks.
pub fn routed_agent_id(item: &WorkItem, routing: &RoutingPolicy) -> Option<String> {
    item.preferred_agent
        .clone()
        .or_else(|| routing.owner_role_map.get(&item.owner_role).cloned())
        .or_else(|| routing.fallback_agent.clone())
}

/// Pick the agent for `item`: preferred agent, then role map, then fallback.
///
/// Each candidate must exist in the catalog.
pub fn route_agent<'a>(
    item: &WorkItem,
    routing: &RoutingPolicy,
    catalog: &'a AgentCatalog,
) -> Option<(&'a str, &'a AgentEntry)> {
    let candidates = [
        item.preferred_agent.as_deref(),
        routing.owner_role_map.get(&item.owner_role).map(String::as_str),
        routing.fallback_agent.as_deref(),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|id| catalog.get_key_value(id))
        .map(|(id, entry)| (id.as_str(), entry))
}

/// Agent that owns the `lead` role (escalations, triage, human inbox).
pub fn lead_agent_id(routing: &RoutingPolicy, catalog: &AgentCatalog) -> String {
    routing
        .owner_role_map
        .get("lead")
        .cloned()
        .or_else(|| {
            catalog
                .iter()
                .find(|(_, entry)| entry.role == "lead")
                .map(|(id, _)| id.clone())
        })
        .or_else(|| routing.fallback_agent.clone())
        .unwrap_or_else(|| "lead".to_string())
}

/// Which rule produced a model profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileSource {
    Agent,
    EscalationUpgrade,
    Lightweight,
}

/// Model selection for one worker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelProfile {
    pub model: String,
    pub reasoning: String,
    pub fallback_model: Option<String>,
    pub source: ProfileSource,
}

/// Resolve the model profile for `agent_id` working on `item`.
///
/// Critical items, escalation items and items that already failed once use
/// `escalation_upgrade.critical_or_repeated_failure`; otherwise a matching
/// `lightweight_task_override` applies; otherwise the agent's own entry.
pub fn resolve_profile(
    agent_id: &str,
    agent: &AgentEntry,
    policy: &ModelPolicy,
    item: &WorkItem,
) -> ModelProfile {
    let base = agent_profile(agent_id, agent, policy);

    let escalated = item.priority == Priority::Critical || item.is_escalation() || item.retry_count >= 1;
    if escalated && let Some(upgrade) = &policy.escalation_upgrade.critical_or_repeated_failure {
        return overlay(&base, upgrade, policy, ProfileSource::EscalationUpgrade);
    }

    let light = &policy.lightweight_task_override;
    if light.enabled
        && !escalated
        && (light.match_types.iter().any(|t| t == &item.item_type)
            || light.match_efforts.iter().any(|e| e == &item.estimated_effort))
    {
        let overlay_model = AgentModel {
            model: light.model.clone(),
            reasoning: light.reasoning.clone(),
            fallback_model: light.fallback_model.clone(),
        };
        return overlay(&base, &overlay_model, policy, ProfileSource::Lightweight);
    }
    base
}

fn agent_profile(agent_id: &str, agent: &AgentEntry, policy: &ModelPolicy) -> ModelProfile {
    let configured = policy.agent_models.get(agent_id);
    let model = configured
        .and_then(|m| m.model.clone())
        .filter(|m| !m.is_empty())
        .or_else(|| Some(agent.model.clone()).filter(|m| !m.is_empty()))
        .or_else(|| policy.fallback_model.clone())
        .unwrap_or_default();
    let reasoning = configured
        .and_then(|m| m.reasoning.clone())
        .unwrap_or_else(|| agent.reasoning.clone());
    let fallback_model = configured
        .and_then(|m| m.fallback_model.clone())
        .or_else(|| policy.fallback_model.clone())
        .filter(|fallback| fallback != &model);
    ModelProfile {
        model,
        reasoning,
        fallback_model,
        source: ProfileSource::Agent,
    }
}

fn overlay(
    base: &ModelProfile,
    overlay: &AgentModel,
    policy: &ModelPolicy,
    source: ProfileSource,
) -> ModelProfile {
    let model = overlay.model.clone().unwrap_or_else(|| base.model.clone());
    let fallback_model = overlay
        .fallback_model
        .clone()
        .or_else(|| base.fallback_model.clone())
        .or_else(|| policy.fallback_model.clone())
        .filter(|fallback| fallback != &model);
    ModelProfile {
        reasoning: overlay.reasoning.clone().unwrap_or_else(|| base.reasoning.clone()),
        model,
        fallback_model,
        source,
    }
}

/// A model/fallback pair the current routing can hand to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveProfile {
    /// Agent id, `escalation_upgrade` or `lightweight_task_override`.
    pub label: String,
    pub model: String,
    pub fallback_model: Option<String>,
}

/// Profiles of routed agents (role map values and the fallback agent) plus
/// the escalation and lightweight overlays. Agents only reachable through a
/// stale `preferred_agent` are left to the drift audit.
pub fn active_profiles(
    catalog: &AgentCatalog,
    routing: &RoutingPolicy,
    policy: &ModelPolicy,
) -> Vec<ActiveProfile> {
    let mut agent_ids: Vec<&str> = routing
        .owner_role_map
        .values()
        .map(String::as_str)
        .chain(routing.fallback_agent.as_deref())
        .collect();
    agent_ids.sort_unstable();
    agent_ids.dedup();

    let mut profiles = Vec::new();
    for agent_id in agent_ids {
        let Some(entry) = catalog.get(agent_id) else {
            continue;
        };
        let profile = agent_profile(agent_id, entry, policy);
        profiles.push(ActiveProfile {
            label: agent_id.to_string(),
            model: profile.model,
            fallback_model: profile.fallback_model,
        });
    }

    if let Some(AgentModel {
        model: Some(model),
        fallback_model,
        ..
    }) = &policy.escalation_upgrade.critical_or_repeated_failure
    {
        profiles.push(ActiveProfile {
            label: "escalation_upgrade".to_string(),
            model: model.clone(),
            fallback_model: fallback_model
                .clone()
                .or_else(|| policy.fallback_model.clone())
                .filter(|fallback| fallback != model),
        });
    }
    let light = &policy.lightweight_task_override;
    if light.enabled
        && let Some(model) = &light.model
    {
        profiles.push(ActiveProfile {
            label: "lightweight_task_override".to_string(),
            model: model.clone(),
            fallback_model: light
                .fallback_model
                .clone()
                .or_else(|| policy.fallback_model.clone())
                .filter(|fallback| fallback != model),
        });
    }
    profiles.retain(|profile| !profile.model.is_empty());
    profiles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{agent, catalog, queued};

    fn routing() -> RoutingPolicy {
        let mut routing = RoutingPolicy::default();
        routing
            .owner_role_map
            .insert("backend".to_string(), "backend-1".to_string());
        routing.fallback_agent = Some("lead-1".to_string());
        routing
    }

    #[test]
    fn routes_preferred_then_role_then_fallback() {
        let catalog = catalog(&[("backend-1", "backend"), ("lead-1", "lead"), ("qa-1", "qa")]);
        let mut item = queued("A");
        item.owner_role = "backend".to_string();
        assert_eq!(route_agent(&item, &routing(), &catalog).map(|r| r.0), Some("backend-1"));

        item.preferred_agent = Some("qa-1".to_string());
        assert_eq!(route_agent(&item, &routing(), &catalog).map(|r| r.0), Some("qa-1"));

        item.preferred_agent = Some("ghost".to_string());
        item.owner_role = "design".to_string();
        assert_eq!(route_agent(&item, &routing(), &catalog).map(|r| r.0), Some("lead-1"));
    }

    #[test]
    fn unroutable_item_yields_none() {
        let catalog = catalog(&[("qa-1", "qa")]);
        let item = queued("A");
        assert!(route_agent(&item, &RoutingPolicy::default(), &catalog).is_none());
    }

    #[test]
    fn escalation_upgrade_applies_to_retried_items() {
        let mut policy = ModelPolicy::default();
        policy.escalation_upgrade.critical_or_repeated_failure = Some(AgentModel {
            model: Some("big-model".to_string()),
            reasoning: Some("high".to_string()),
            fallback_model: None,
        });
        policy.fallback_model = Some("safe-model".to_string());
        let entry = agent("backend", "small-model");

        let mut item = queued("A");
        let profile = resolve_profile("backend-1", &entry, &policy, &item);
        assert_eq!(profile.model, "small-model");
        assert_eq!(profile.fallback_model.as_deref(), Some("safe-model"));

        item.retry_count = 1;
        let profile = resolve_profile("backend-1", &entry, &policy, &item);
        assert_eq!(profile.model, "big-model");
        assert_eq!(profile.reasoning, "high");
        assert_eq!(profile.source, ProfileSource::EscalationUpgrade);
    }

    #[test]
    fn lightweight_override_matches_type() {
        let mut policy = ModelPolicy::default();
        policy.lightweight_task_override = crate::core::policy::LightweightTaskOverride {
            enabled: true,
            model: Some("mini".to_string()),
            match_types: vec!["docs".to_string()],
            ..Default::default()
        };
        let mut item = queued("A");
        item.item_type = "docs".to_string();
        let profile = resolve_profile("content-1", &agent("content", "std"), &policy, &item);
        assert_eq!(profile.model, "mini");
        assert_eq!(profile.source, ProfileSource::Lightweight);
    }

    #[test]
    fn active_profiles_cover_routed_agents_and_overlays() {
        let catalog = catalog(&[("backend-1", "backend"), ("lead-1", "lead"), ("retired", "design")]);
        let mut policy = ModelPolicy::default();
        policy.fallback_model = Some("fallback".to_string());
        policy.escalation_upgrade.critical_or_repeated_failure = Some(AgentModel {
            model: Some("big".to_string()),
            ..AgentModel::default()
        });

        let profiles = active_profiles(&catalog, &routing(), &policy);
        let labels: Vec<&str> = profiles.iter().map(|p| p.label.as_str()).collect();
        assert_eq!(labels, vec!["backend-1", "lead-1", "escalation_upgrade"]);
        assert_eq!(profiles[0].model, "model-backend");
        assert_eq!(profiles[0].fallback_model.as_deref(), Some("fallback"));
        assert_eq!(profiles[2].fallback_model.as_deref(), Some("fallback"));
    }
}
