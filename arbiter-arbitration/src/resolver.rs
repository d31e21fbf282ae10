//! Policy resolution
//!
//! Preference-scope policies override agent-scope ones, which override the
//! default. Among agents, the lexicographically first name with a policy wins.

use arbiter_core::{
    ArbiterError, ArbiterResult, ArbitrationPolicy, ConfigError, Proposal, TargetRef, TargetType,
};
use arbiter_storage::PolicyRepository;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct PolicyResolver {
    repo: Arc<dyn PolicyRepository>,
}

impl PolicyResolver {
    pub fn new(repo: Arc<dyn PolicyRepository>) -> Self {
        Self { repo }
    }

    /// Policy governing a target group.
    pub async fn resolve(
        &self,
        target: &TargetRef,
        proposals: &[Proposal],
    ) -> ArbiterResult<ArbitrationPolicy> {
        if let (TargetType::Preference, Some(key)) = (target.target_type, target.key.as_deref()) {
            if let Some(policy) = self.repo.policy_find_for_preference(&target.id, key).await? {
                debug!(target = %target, policy_id = %policy.policy_id, "Preference policy applies");
                return Ok(policy);
            }
        }

        let agents: BTreeSet<&str> = proposals.iter().map(|p| p.agent_name.as_str()).collect();
        for agent in agents {
            if let Some(policy) = self.repo.policy_find_for_agent(agent).await? {
                debug!(target = %target, agent, policy_id = %policy.policy_id, "Agent policy applies");
                return Ok(policy);
            }
        }

        self.repo
            .policy_find_default()
            .await?
            .ok_or_else(|| {
                ArbiterError::Config(ConfigError::MissingRequired {
                    field: "default arbitration policy".to_string(),
                })
            })
    }
}

impl std::fmt::Debug for PolicyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyResolver").finish_non_exhaustive()
    }
}
