//! Policy documents (`coordination/policies/*.yaml`).
//!
//! Every struct is `#[serde(default)]`: a missing key means "use the
//! default", so partially written policy files stay loadable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPolicy {
    pub owner_role_map: BTreeMap<String, String>,
    pub fallback_agent: Option<String>,
    pub dependency_unlock_priority: DependencyUnlockPriority,
    pub fast_cycle_role_priority: FastCycleRolePriority,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyUnlockPriority {
    pub enabled: bool,
    pub critical_priority_protected: bool,
    /// Clamped to `0..=3` when applied.
    pub priority_boost_levels: u32,
    pub prefer_immediate_unblocks: bool,
}

impl Default for DependencyUnlockPriority {
    fn default() -> Self {
        Self {
            enabled: false,
            critical_priority_protected: true,
            priority_boost_levels: 1,
            prefer_immediate_unblocks: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastCycleRolePriority {
    pub enabled: bool,
    pub deprioritize_roles: Vec<String>,
    pub deprioritize_levels: u32,
    pub except_critical_priority: bool,
}

impl Default for FastCycleRolePriority {
    fn default() -> Self {
        Self {
            enabled: false,
            deprioritize_roles: Vec::new(),
            deprioritize_levels: 1,
            except_critical_priority: true,
        }
    }
}

/// Worker error fragments that mean "this model is not available to us".
pub const DEFAULT_MODEL_ACCESS_MARKERS: [&str; 8] = [
    "not supported",
    "unsupported model",
    "does not have access",
    "not authorized",
    "not enabled",
    "permission denied",
    "invalid model",
    "unknown model",
];

/// Blocker reasons that carry no actionable information.
pub const DEFAULT_NON_ACTIONABLE_PATTERNS: [&str; 4] = [
    r"^\s*[-*]?\s*none\.?\s*$",
    r"^\s*[-*]?\s*n/?a\.?\s*$",
    r"^\s*[-*]?\s*null\s*$",
    r"^\s*$",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries_per_item_per_agent: u32,
    pub worker_timeout_seconds: u64,
    pub model_access_markers: Vec<String>,
    pub blocked_revisit: BlockedRevisitPolicy,
    pub blocked_archive: BlockedArchivePolicy,
    pub non_actionable_blocker_guard: NonActionableBlockerGuard,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries_per_item_per_agent: 2,
            worker_timeout_seconds: 30 * 60,
            model_access_markers: DEFAULT_MODEL_ACCESS_MARKERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            blocked_revisit: BlockedRevisitPolicy::default(),
            blocked_archive: BlockedArchivePolicy::default(),
            non_actionable_blocker_guard: NonActionableBlockerGuard::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockedRevisitPolicy {
    pub enabled: bool,
    pub max_items_per_cycle: usize,
    pub max_attempts_per_item: u32,
    pub cooldown_seconds: u64,
    pub include_reason_patterns: Vec<String>,
    pub exclude_reason_patterns: Vec<String>,
}

impl Default for BlockedRevisitPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_items_per_cycle: 2,
            max_attempts_per_item: 3,
            cooldown_seconds: 30 * 60,
            include_reason_patterns: Vec::new(),
            exclude_reason_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockedArchivePolicy {
    pub enabled: bool,
    pub include_reason_patterns: Vec<String>,
    pub exclude_reason_patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NonActionableBlockerGuard {
    pub enabled: bool,
    pub reason_patterns: Vec<String>,
    pub auto_requeue_dependency_ready: bool,
    pub max_auto_requeue_per_cycle: usize,
    pub route_lead_triage: bool,
}

impl Default for NonActionableBlockerGuard {
    fn default() -> Self {
        Self {
            enabled: true,
            reason_patterns: DEFAULT_NON_ACTIONABLE_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            auto_requeue_dependency_ready: true,
            max_auto_requeue_per_cycle: 3,
            route_lead_triage: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentModel {
    pub model: Option<String>,
    pub reasoning: Option<String>,
    pub fallback_model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationUpgrade {
    pub critical_or_repeated_failure: Option<AgentModel>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightweightTaskOverride {
    pub enabled: bool,
    pub model: Option<String>,
    pub reasoning: Option<String>,
    pub fallback_model: Option<String>,
    pub match_types: Vec<String>,
    pub match_efforts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPolicy {
    pub agent_models: BTreeMap<String, AgentModel>,
    pub escalation_upgrade: EscalationUpgrade,
    pub lightweight_task_override: LightweightTaskOverride,
    pub fallback_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationScopeGuard {
    pub enabled: bool,
}

impl Default for ValidationScopeGuard {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendVisualQa {
    pub enabled: bool,
    pub strict: bool,
    pub max_overflow_px: u32,
    pub max_diff_percent: f64,
    pub owner_roles: Vec<String>,
    /// Smoke command; the launcher prefix is normalised like any other command.
    pub command: String,
    /// JSON side-file the smoke writes (`{"status": "blocked", "reason": ...}`).
    pub report_path: String,
}

impl Default for FrontendVisualQa {
    fn default() -> Self {
        Self {
            enabled: false,
            strict: false,
            max_overflow_px: 0,
            max_diff_percent: 1.0,
            owner_roles: vec!["frontend".to_string()],
            command: "python scripts/frontend_visual_smoke.py".to_string(),
            report_path: "coordination/runtime/frontend-visual-qa.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformWebPackagingValidation {
    pub enabled: bool,
    pub owner_roles: Vec<String>,
    pub match_inputs_any: Vec<String>,
    pub commands: Vec<String>,
}

impl Default for PlatformWebPackagingValidation {
    fn default() -> Self {
        Self {
            enabled: false,
            owner_roles: vec!["platform".to_string()],
            match_inputs_any: Vec::new(),
            commands: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitPolicy {
    pub commit_enabled: bool,
    /// Commits only happen while this branch is checked out.
    pub commit_branch: String,
    pub default_validation_commands: Vec<String>,
    pub validation_scope_guard: ValidationScopeGuard,
    pub frontend_visual_qa: FrontendVisualQa,
    pub platform_web_packaging_validation: PlatformWebPackagingValidation,
}

impl Default for CommitPolicy {
    fn default() -> Self {
        Self {
            commit_enabled: false,
            commit_branch: "main".to_string(),
            default_validation_commands: Vec::new(),
            validation_scope_guard: ValidationScopeGuard::default(),
            frontend_visual_qa: FrontendVisualQa::default(),
            platform_web_packaging_validation: PlatformWebPackagingValidation::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostileTokenContract {
    pub content_key_manifest: String,
    pub runtime_contract: String,
    pub event_feed: String,
}

impl Default for HostileTokenContract {
    fn default() -> Self {
        Self {
            content_key_manifest: "content/hostile-content-keys.json".to_string(),
            runtime_contract: "content/hostile-runtime-contract.json".to_string(),
            event_feed: "content/hostile-event-feed.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformBootstrap {
    pub enabled: bool,
    pub title: String,
    pub description: String,
    pub milestone: String,
}

impl Default for PlatformBootstrap {
    fn default() -> Self {
        Self {
            enabled: true,
            title: "Bootstrap platform packaging lane".to_string(),
            description: "Set up the platform build and packaging pipeline so the project can \
                          be shipped as a web bundle. Document the build commands and wire a \
                          smoke check into the validation policy."
                .to_string(),
            milestone: "platform".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimePolicy {
    pub python_command: Option<String>,
    pub human_inbox_dir: String,
    pub hostile_token_contract: Option<HostileTokenContract>,
    pub platform_bootstrap: PlatformBootstrap,
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self {
            python_command: None,
            human_inbox_dir: "Human".to_string(),
            hostile_token_contract: None,
            platform_bootstrap: PlatformBootstrap::default(),
        }
    }
}

/// All policies in force for one cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Policies {
    pub routing: RoutingPolicy,
    pub retry: RetryPolicy,
    pub model: ModelPolicy,
    pub commit: CommitPolicy,
    pub runtime: RuntimePolicy,
    /// Fingerprint of the raw model policy document.
    pub model_fingerprint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_take_defaults() {
        let retry: RetryPolicy =
            serde_json::from_str(r#"{"blocked_revisit": {"cooldown_seconds": 0}}"#).expect("parse");
        assert_eq!(retry.max_retries_per_item_per_agent, 2);
        assert_eq!(retry.blocked_revisit.cooldown_seconds, 0);
        assert!(retry.blocked_revisit.enabled);
        assert_eq!(retry.model_access_markers.len(), DEFAULT_MODEL_ACCESS_MARKERS.len());
    }

    #[test]
    fn commit_policy_defaults_keep_scope_guard_on() {
        let commit: CommitPolicy = serde_json::from_str("{}").expect("parse");
        assert!(commit.validation_scope_guard.enabled);
        assert!(!commit.frontend_visual_qa.enabled);
    }
}
