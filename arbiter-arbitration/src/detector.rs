//! Conflict detection
//!
//! Pending proposals are grouped by target. A group of one is a singleton
//! that still flows through veto and escalation; two or more proposals on the
//! same target form a conflict whose type is classified against the policy.

use arbiter_core::{
    ArbiterError, ArbiterResult, ArbitrationPolicy, Conflict, ConflictType, PreferenceValue,
    Proposal, TargetRef, Timestamp,
};
use std::collections::BTreeMap;

/// A conflict together with the proposals it names, sorted by id.
#[derive(Debug, Clone)]
pub struct DetectedConflict {
    pub conflict: Conflict,
    pub proposals: Vec<Proposal>,
}

pub struct ConflictDetector;

impl ConflictDetector {
    /// Group eligible proposals by target. Map order is the detection order.
    pub fn group_by_target(proposals: Vec<Proposal>) -> BTreeMap<TargetRef, Vec<Proposal>> {
        let mut groups: BTreeMap<TargetRef, Vec<Proposal>> = BTreeMap::new();
        for proposal in proposals.into_iter().filter(Proposal::is_eligible) {
            groups
                .entry(proposal.target.clone())
                .or_default()
                .push(proposal);
        }
        for group in groups.values_mut() {
            group.sort_by_key(|p| p.proposal_id);
        }
        groups
    }

    /// Classify a group. `None` for fewer than two proposals.
    ///
    /// Precedence: invariant violation, mutual exclusion, resource
    /// competition, then plain same-target.
    pub fn classify(proposals: &[Proposal], policy: &ArbitrationPolicy) -> Option<ConflictType> {
        let first = match proposals {
            [] | [_] => return None,
            [first, ..] => first,
        };
        let target = &first.target;

        let combined_cost: f64 = proposals.iter().map(|p| p.cost_estimate).sum();
        let breaks_invariant = policy.invariants.iter().any(|inv| {
            inv.target_type.map_or(true, |t| t == target.target_type)
                && combined_cost > inv.max_combined_cost
        });
        if breaks_invariant {
            return Some(ConflictType::InvariantViolation);
        }

        if Self::has_exclusive_values(proposals, target, policy) {
            return Some(ConflictType::MutuallyExclusive);
        }

        let over_capacity = policy.capacity_limits.iter().any(|limit| {
            limit.target_type == target.target_type
                && limit.target_id.as_ref().map_or(true, |id| *id == target.id)
                && proposals.len() > limit.capacity
        });
        if over_capacity {
            return Some(ConflictType::ResourceCompetition);
        }

        Some(ConflictType::SameTarget)
    }

    fn has_exclusive_values(
        proposals: &[Proposal],
        target: &TargetRef,
        policy: &ArbitrationPolicy,
    ) -> bool {
        let values: Vec<&PreferenceValue> = proposals
            .iter()
            .filter_map(|p| p.action.proposed_value())
            .collect();

        let opposite_flags = values.contains(&&PreferenceValue::Flag(true))
            && values.contains(&&PreferenceValue::Flag(false));
        if opposite_flags {
            return true;
        }

        policy
            .exclusive_values
            .iter()
            .filter(|rule| {
                rule.target_type == target.target_type
                    && rule.key.as_ref().map_or(true, |k| target.key.as_ref() == Some(k))
            })
            .any(|rule| {
                let present = rule
                    .values
                    .iter()
                    .filter(|excl| values.iter().any(|v| *v == *excl))
                    .count();
                present >= 2
            })
    }

    /// Build the conflict record for one target group.
    pub fn detect(
        proposals: Vec<Proposal>,
        policy: &ArbitrationPolicy,
        now: Timestamp,
    ) -> ArbiterResult<DetectedConflict> {
        let conflict_type = Self::classify(&proposals, policy);
        let target = match proposals.first() {
            Some(p) => p.target.clone(),
            None => return Err(ArbiterError::missing_field("conflict.proposals")),
        };
        let conflict = Conflict::new(
            target,
            proposals.iter().map(|p| p.proposal_id),
            conflict_type,
            now,
        )?;
        Ok(DetectedConflict {
            conflict,
            proposals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::{
        CapacityLimit, DomainInvariant, ExclusiveValues, NewProposal, PolicySubject,
        ProposedAction, ResolutionStrategy, TargetType,
    };
    use chrono::Utc;

    fn pref(agent: &str, value: PreferenceValue, cost: f64) -> Proposal {
        let action = ProposedAction::apply_preference("coaching", "tone", value, None).unwrap();
        Proposal::new(
            NewProposal::new(agent, action).with_confidence(0.8).with_cost(cost),
            Utc::now(),
        )
        .unwrap()
    }

    fn policy() -> ArbitrationPolicy {
        ArbitrationPolicy::new(
            "default",
            PolicySubject::Default,
            ResolutionStrategy::Priority,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_grouping_skips_ineligible_and_sorts() {
        let a = pref("coach", "warm".into(), 0.0);
        let b = pref("logger", "direct".into(), 0.0);
        let mut unscored = pref("scheduler", "calm".into(), 0.0);
        unscored.confidence = None;
        let nudge = Proposal::new(
            NewProposal::new("coach", ProposedAction::send_nudge("push", "hi").unwrap())
                .with_confidence(0.5),
            Utc::now(),
        )
        .unwrap();

        let groups = ConflictDetector::group_by_target(vec![b.clone(), nudge, unscored, a.clone()]);
        assert_eq!(groups.len(), 2);
        let tone = &groups[&a.target];
        assert_eq!(tone.len(), 2);
        assert!(tone[0].proposal_id < tone[1].proposal_id);
    }

    #[test]
    fn test_singleton_has_no_type() {
        let single = vec![pref("coach", "warm".into(), 0.0)];
        assert_eq!(ConflictDetector::classify(&single, &policy()), None);
        let detected = ConflictDetector::detect(single, &policy(), Utc::now()).unwrap();
        assert!(detected.conflict.is_singleton());
    }

    #[test]
    fn test_classification_precedence() {
        let group = vec![
            pref("coach", "warm".into(), 4.0),
            pref("logger", "direct".into(), 4.0),
        ];
        assert_eq!(
            ConflictDetector::classify(&group, &policy()),
            Some(ConflictType::SameTarget)
        );

        let limited = policy().with_capacity_limit(CapacityLimit {
            target_type: TargetType::Preference,
            target_id: None,
            capacity: 1,
        });
        assert_eq!(
            ConflictDetector::classify(&group, &limited),
            Some(ConflictType::ResourceCompetition)
        );

        let exclusive = limited.with_exclusive_values(ExclusiveValues {
            target_type: TargetType::Preference,
            key: Some("tone".to_string()),
            values: vec!["warm".into(), "direct".into()],
        });
        assert_eq!(
            ConflictDetector::classify(&group, &exclusive),
            Some(ConflictType::MutuallyExclusive)
        );

        let budgeted = exclusive.with_invariant(DomainInvariant {
            name: "budget".to_string(),
            target_type: None,
            max_combined_cost: 5.0,
        });
        assert_eq!(
            ConflictDetector::classify(&group, &budgeted),
            Some(ConflictType::InvariantViolation)
        );
    }

    #[test]
    fn test_opposite_flags_are_exclusive() {
        let group = vec![
            pref("coach", true.into(), 0.0),
            pref("logger", false.into(), 0.0),
        ];
        assert_eq!(
            ConflictDetector::classify(&group, &policy()),
            Some(ConflictType::MutuallyExclusive)
        );
    }

    #[test]
    fn test_exclusive_rule_needs_two_distinct_listed_values() {
        let rule = ExclusiveValues {
            target_type: TargetType::Preference,
            key: Some("tone".to_string()),
            values: vec!["warm".into(), "direct".into()],
        };
        let agreeing = vec![
            pref("coach", "warm".into(), 0.0),
            pref("logger", "warm".into(), 0.0),
        ];
        let policy = policy().with_exclusive_values(rule);
        assert_eq!(
            ConflictDetector::classify(&agreeing, &policy),
            Some(ConflictType::SameTarget)
        );

        let split = vec![
            pref("coach", "warm".into(), 0.0),
            pref("logger", "direct".into(), 0.0),
            pref("planner", "gentle".into(), 0.0),
        ];
        assert_eq!(
            ConflictDetector::classify(&split, &policy),
            Some(ConflictType::MutuallyExclusive)
        );
    }

    #[test]
    fn test_exclusive_rule_for_other_key_is_ignored() {
        let group = vec![
            pref("coach", "warm".into(), 0.0),
            pref("logger", "direct".into(), 0.0),
        ];
        let other_key = policy().with_exclusive_values(ExclusiveValues {
            target_type: TargetType::Preference,
            key: Some("cadence".to_string()),
            values: vec!["warm".into(), "direct".into()],
        });
        assert_eq!(
            ConflictDetector::classify(&group, &other_key),
            Some(ConflictType::SameTarget)
        );
    }
}
