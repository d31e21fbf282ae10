//! Escalation thresholds
//!
//! Checked over the contenders left after veto filtering, before any
//! strategy runs. The first threshold that fires names the reason.

use arbiter_core::{Escalation, EscalationReason, EscalationThresholds, Proposal};
use std::collections::BTreeSet;

/// First threshold hit, in order: always-escalate agents, risk, cost,
/// confidence, agent count, then vetoes when the policy escalates on them.
///
/// `suggested_resolution` is left empty for the engine to fill in.
pub fn check_thresholds(
    contenders: &[&Proposal],
    thresholds: &EscalationThresholds,
    any_vetoed: bool,
) -> Option<Escalation> {
    let escalate = |reason: EscalationReason, detail: String| {
        Some(Escalation {
            reason,
            detail,
            suggested_resolution: None,
        })
    };

    if let Some(p) = contenders
        .iter()
        .find(|p| thresholds.always_escalate_agents.contains(&p.agent_name))
    {
        return escalate(
            EscalationReason::AgentAlwaysEscalate,
            format!("agent {} always escalates ({})", p.agent_name, p.proposal_id),
        );
    }

    if let Some(level) = thresholds.escalate_at_risk {
        if let Some(p) = contenders.iter().find(|p| p.risk_level >= level) {
            return escalate(
                EscalationReason::RiskThreshold,
                format!(
                    "{} from {} carries {} risk (threshold {})",
                    p.proposal_id, p.agent_name, p.risk_level, level
                ),
            );
        }
    }

    if let Some(max) = thresholds.max_cost {
        if let Some(p) = contenders.iter().find(|p| p.cost_estimate > max) {
            return escalate(
                EscalationReason::CostThreshold,
                format!(
                    "{} from {} costs {} (limit {})",
                    p.proposal_id, p.agent_name, p.cost_estimate, max
                ),
            );
        }
    }

    if let Some(min) = thresholds.min_confidence {
        if let Some(p) = contenders.iter().find(|p| p.confidence_or_zero() < min) {
            return escalate(
                EscalationReason::ConfidenceTooLow,
                format!(
                    "{} from {} has confidence {:.2} (minimum {:.2})",
                    p.proposal_id,
                    p.agent_name,
                    p.confidence_or_zero(),
                    min
                ),
            );
        }
    }

    if let Some(max_agents) = thresholds.max_agents {
        let agents: BTreeSet<&str> = contenders.iter().map(|p| p.agent_name.as_str()).collect();
        if agents.len() > max_agents {
            return escalate(
                EscalationReason::MultiAgentConflict,
                format!("{} agents compete (limit {})", agents.len(), max_agents),
            );
        }
    }

    if any_vetoed && thresholds.escalate_on_veto {
        return escalate(
            EscalationReason::VetoEscalation,
            "policy escalates when any proposal is vetoed".to_string(),
        );
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::{NewProposal, ProposedAction, RiskLevel};
    use chrono::Utc;

    fn proposal(agent: &str, confidence: f64, cost: f64, risk: RiskLevel) -> Proposal {
        let action = ProposedAction::create_task("inbox", "stretch", None).unwrap();
        Proposal::new(
            NewProposal::new(agent, action)
                .with_confidence(confidence)
                .with_cost(cost)
                .with_risk(risk),
            Utc::now(),
        )
        .unwrap()
    }

    fn reason(
        contenders: &[Proposal],
        t: &EscalationThresholds,
        vetoed: bool,
    ) -> Option<EscalationReason> {
        let refs: Vec<&Proposal> = contenders.iter().collect();
        check_thresholds(&refs, t, vetoed).map(|e| e.reason)
    }

    #[test]
    fn test_no_thresholds_never_escalate() {
        let ps = vec![proposal("coach", 0.1, 100.0, RiskLevel::High)];
        assert_eq!(reason(&ps, &EscalationThresholds::default(), true), None);
    }

    #[test]
    fn test_each_threshold_fires() {
        let ps = vec![
            proposal("coach", 0.4, 12.0, RiskLevel::High),
            proposal("scheduler", 0.9, 1.0, RiskLevel::Low),
        ];
        let risk = EscalationThresholds {
            escalate_at_risk: Some(RiskLevel::High),
            ..Default::default()
        };
        assert_eq!(reason(&ps, &risk, false), Some(EscalationReason::RiskThreshold));

        let cost = EscalationThresholds {
            max_cost: Some(10.0),
            ..Default::default()
        };
        assert_eq!(reason(&ps, &cost, false), Some(EscalationReason::CostThreshold));

        let confidence = EscalationThresholds {
            min_confidence: Some(0.5),
            ..Default::default()
        };
        assert_eq!(
            reason(&ps, &confidence, false),
            Some(EscalationReason::ConfidenceTooLow)
        );

        let agents = EscalationThresholds {
            max_agents: Some(1),
            ..Default::default()
        };
        assert_eq!(
            reason(&ps, &agents, false),
            Some(EscalationReason::MultiAgentConflict)
        );

        let veto = EscalationThresholds {
            escalate_on_veto: true,
            ..Default::default()
        };
        assert_eq!(reason(&ps, &veto, false), None);
        assert_eq!(reason(&ps, &veto, true), Some(EscalationReason::VetoEscalation));
    }

    #[test]
    fn test_order_of_checks() {
        let ps = vec![proposal("nervous", 0.1, 50.0, RiskLevel::High)];
        let all = EscalationThresholds {
            escalate_at_risk: Some(RiskLevel::Medium),
            max_cost: Some(1.0),
            min_confidence: Some(0.9),
            always_escalate_agents: vec!["nervous".to_string()],
            max_agents: Some(0),
            escalate_on_veto: true,
        };
        assert_eq!(reason(&ps, &all, true), Some(EscalationReason::AgentAlwaysEscalate));

        let no_agent = EscalationThresholds {
            always_escalate_agents: vec![],
            ..all.clone()
        };
        assert_eq!(reason(&ps, &no_agent, true), Some(EscalationReason::RiskThreshold));

        let no_risk = EscalationThresholds {
            escalate_at_risk: None,
            ..no_agent
        };
        assert_eq!(reason(&ps, &no_risk, true), Some(EscalationReason::CostThreshold));
    }
}
