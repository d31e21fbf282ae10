//! Resolution strategies
//!
//! Strategies run over the contenders that survived veto filtering, sorted by
//! proposal id. They are pure: same contenders and policy, same outcome.

use arbiter_core::{
    ArbitrationPolicy, ConsensusRule, DecisionFactor, Escalation, EscalationReason, Proposal,
    ProposalId, ResolutionStrategy, Suppression, SuppressionReason, VetoRule, WeightedScoring,
};
use std::collections::BTreeSet;

/// Result of running one strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyOutcome {
    pub winner: Option<ProposalId>,
    pub suppressions: Vec<Suppression>,
    pub factors: Vec<DecisionFactor>,
    pub summary: String,
    /// Set when the strategy could not name a clear winner.
    pub escalation: Option<Escalation>,
}

impl StrategyOutcome {
    fn no_clear_winner(
        detail: String,
        suggested: Option<ProposalId>,
        factors: Vec<DecisionFactor>,
    ) -> Self {
        Self {
            winner: None,
            suppressions: Vec::new(),
            factors,
            summary: detail.clone(),
            escalation: Some(Escalation {
                reason: EscalationReason::NoClearWinner,
                detail,
                suggested_resolution: suggested,
            }),
        }
    }
}

/// Proposals split by the policy's veto rules.
#[derive(Debug)]
pub struct VetoFilter<'a> {
    pub contenders: Vec<&'a Proposal>,
    pub vetoed: Vec<Suppression>,
}

/// Remove every proposal matching a veto rule. The first matching rule is
/// named in the explanation.
pub fn apply_vetoes<'a>(proposals: &[&'a Proposal], rules: &[VetoRule]) -> VetoFilter<'a> {
    let mut filter = VetoFilter {
        contenders: Vec::new(),
        vetoed: Vec::new(),
    };
    for proposal in proposals {
        match rules.iter().find(|rule| rule.matches(proposal)) {
            Some(rule) => filter.vetoed.push(Suppression {
                proposal_id: proposal.proposal_id,
                reason: SuppressionReason::Vetoed,
                explanation: format!(
                    "{} proposal from {} vetoed by rule '{}'",
                    proposal.action_type(),
                    proposal.agent_name,
                    rule.name
                ),
            }),
            None => filter.contenders.push(*proposal),
        }
    }
    filter
}

/// Run the policy's strategy. The veto strategy scores survivors like the
/// weighted one; veto filtering itself happens before any strategy.
pub fn resolve(
    strategy: ResolutionStrategy,
    contenders: &[&Proposal],
    policy: &ArbitrationPolicy,
) -> StrategyOutcome {
    match strategy {
        ResolutionStrategy::Priority => by_priority(contenders),
        ResolutionStrategy::Weighted | ResolutionStrategy::Veto => {
            by_weighted(contenders, &policy.scoring)
        }
        ResolutionStrategy::Consensus => by_consensus(contenders, &policy.consensus),
    }
}

// ============================================================================
// PRIORITY
// ============================================================================

/// Highest declared priority wins, ties broken on the smallest proposal id.
pub fn by_priority(contenders: &[&Proposal]) -> StrategyOutcome {
    let mut ranked = contenders.to_vec();
    ranked.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.proposal_id.cmp(&b.proposal_id))
    });
    let Some(winner) = ranked.first().copied() else {
        return StrategyOutcome::no_clear_winner("no contenders".to_string(), None, Vec::new());
    };

    let factors = ranked
        .iter()
        .map(|p| DecisionFactor {
            proposal_id: p.proposal_id,
            agent_name: p.agent_name.clone(),
            factor: "priority".to_string(),
            value: f64::from(p.priority),
            impact: f64::from(p.priority) - f64::from(winner.priority),
        })
        .collect();

    let suppressions = ranked[1..]
        .iter()
        .map(|p| {
            let explanation = if p.priority == winner.priority {
                format!(
                    "tied at priority {} with {}, which has the smaller id",
                    p.priority, winner.proposal_id
                )
            } else {
                format!(
                    "priority {} below {} of {} ({})",
                    p.priority, winner.priority, winner.proposal_id, winner.agent_name
                )
            };
            Suppression {
                proposal_id: p.proposal_id,
                reason: SuppressionReason::LostPriority,
                explanation,
            }
        })
        .collect();

    StrategyOutcome {
        winner: Some(winner.proposal_id),
        suppressions,
        factors,
        summary: format!(
            "priority: {} from {} wins with priority {} over {} other proposal(s)",
            winner.proposal_id,
            winner.agent_name,
            winner.priority,
            ranked.len() - 1
        ),
        escalation: None,
    }
}

// ============================================================================
// WEIGHTED
// ============================================================================

/// Highest weighted score wins. Top scores within `tie_epsilon` escalate.
pub fn by_weighted(contenders: &[&Proposal], scoring: &WeightedScoring) -> StrategyOutcome {
    let mut scored: Vec<(&Proposal, f64)> =
        contenders.iter().map(|p| (*p, scoring.score(p))).collect();
    scored.sort_by(|a, b| {
        b.1.total_cmp(&a.1)
            .then(a.0.proposal_id.cmp(&b.0.proposal_id))
    });
    let Some(&(winner, top)) = scored.first() else {
        return StrategyOutcome::no_clear_winner("no contenders".to_string(), None, Vec::new());
    };

    let mut factors = Vec::with_capacity(scored.len() * 4);
    for (p, score) in &scored {
        let confidence = p.confidence_or_zero();
        let penalty = scoring.risk_penalty(p.risk_level);
        let factor = |name: &str, value: f64, impact: f64| DecisionFactor {
            proposal_id: p.proposal_id,
            agent_name: p.agent_name.clone(),
            factor: name.to_string(),
            value,
            impact,
        };
        factors.push(factor("confidence", confidence, scoring.confidence_weight * confidence));
        factors.push(factor(
            "cost",
            p.cost_estimate,
            -scoring.cost_weight * p.cost_estimate / scoring.cost_scale,
        ));
        factors.push(factor("risk_penalty", penalty, -penalty));
        factors.push(factor("score", *score, score - top));
    }

    let comparison = scored
        .iter()
        .map(|(p, s)| format!("{}={:.3}", p.proposal_id, s))
        .collect::<Vec<_>>()
        .join(", ");

    if let Some(&(runner_up, second)) = scored.get(1) {
        if (top - second).abs() <= scoring.tie_epsilon {
            return StrategyOutcome::no_clear_winner(
                format!(
                    "weighted: {} and {} tie at {:.3} ({})",
                    winner.proposal_id, runner_up.proposal_id, top, comparison
                ),
                Some(winner.proposal_id),
                factors,
            );
        }
    }

    let suppressions = scored[1..]
        .iter()
        .map(|(p, s)| Suppression {
            proposal_id: p.proposal_id,
            reason: SuppressionReason::LowerScore,
            explanation: format!(
                "score {:.3} below {:.3} of {} ({})",
                s, top, winner.proposal_id, winner.agent_name
            ),
        })
        .collect();

    StrategyOutcome {
        winner: Some(winner.proposal_id),
        suppressions,
        factors,
        summary: format!(
            "weighted: {} from {} wins with score {:.3} ({})",
            winner.proposal_id, winner.agent_name, top, comparison
        ),
        escalation: None,
    }
}

// ============================================================================
// CONSENSUS
// ============================================================================

fn support(bucket: &[&Proposal]) -> usize {
    bucket
        .iter()
        .map(|p| p.agent_name.as_str())
        .collect::<BTreeSet<_>>()
        .len()
}

/// Highest confidence, then smallest id.
fn representative(bucket: &[&Proposal]) -> Option<ProposalId> {
    bucket
        .iter()
        .max_by(|a, b| {
            a.confidence_or_zero()
                .total_cmp(&b.confidence_or_zero())
                .then(b.proposal_id.cmp(&a.proposal_id))
        })
        .map(|p| p.proposal_id)
}

/// Bucket equivalent actions; a bucket backed by at least `quorum` distinct
/// agents wins. No quorum, or two buckets with equal backing, escalates.
pub fn by_consensus(contenders: &[&Proposal], rule: &ConsensusRule) -> StrategyOutcome {
    let mut buckets: Vec<Vec<&Proposal>> = Vec::new();
    for proposal in contenders {
        match buckets
            .iter_mut()
            .find(|bucket| bucket[0].action.equivalent(&proposal.action, rule.tolerance))
        {
            Some(bucket) => bucket.push(*proposal),
            None => buckets.push(vec![*proposal]),
        }
    }

    let mut ranked: Vec<(usize, usize)> = buckets
        .iter()
        .enumerate()
        .map(|(i, bucket)| (i, support(bucket)))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let factors: Vec<DecisionFactor> = buckets
        .iter()
        .flat_map(|bucket| {
            let backing = support(bucket);
            bucket.iter().map(move |p| (p, backing))
        })
        .map(|(p, backing)| DecisionFactor {
            proposal_id: p.proposal_id,
            agent_name: p.agent_name.clone(),
            factor: "agreeing_agents".to_string(),
            value: backing as f64,
            impact: backing as f64 - ranked.first().map_or(0, |r| r.1) as f64,
        })
        .collect();

    let Some(&(best, best_support)) = ranked.first() else {
        return StrategyOutcome::no_clear_winner("no contenders".to_string(), None, factors);
    };
    if best_support < rule.quorum {
        return StrategyOutcome::no_clear_winner(
            format!(
                "consensus: no action reached quorum {} (best backing {} agent(s))",
                rule.quorum, best_support
            ),
            representative(&buckets[best]),
            factors,
        );
    }
    if ranked.get(1).is_some_and(|r| r.1 == best_support) {
        return StrategyOutcome::no_clear_winner(
            format!(
                "consensus: several actions backed by {} agent(s)",
                best_support
            ),
            representative(&buckets[best]),
            factors,
        );
    }

    let Some(winner) = representative(&buckets[best]) else {
        return StrategyOutcome::no_clear_winner("no contenders".to_string(), None, factors);
    };
    let winner_agent = buckets[best]
        .iter()
        .find(|p| p.proposal_id == winner)
        .map(|p| p.agent_name.clone())
        .unwrap_or_default();

    let mut suppressions = Vec::new();
    for (i, bucket) in buckets.iter().enumerate() {
        for p in bucket.iter().filter(|p| p.proposal_id != winner) {
            let explanation = if i == best {
                format!("equivalent to consensus winner {}, merged", winner)
            } else {
                format!(
                    "backed by {} agent(s), consensus of {} formed around {}",
                    support(bucket),
                    best_support,
                    winner
                )
            };
            suppressions.push(Suppression {
                proposal_id: p.proposal_id,
                reason: SuppressionReason::LostConsensus,
                explanation,
            });
        }
    }
    suppressions.sort_by_key(|s| s.proposal_id);

    StrategyOutcome {
        winner: Some(winner),
        suppressions,
        factors,
        summary: format!(
            "consensus: {} agent(s) agree, {} from {} represents them",
            best_support, winner, winner_agent
        ),
        escalation: None,
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use arbiter_core::{NewProposal, ProposedAction, RiskLevel};
    use chrono::Utc;
    use proptest::prelude::*;

    fn arb_inputs() -> impl Strategy<Value = Vec<(i32, f64, f64, u8)>> {
        prop::collection::vec((-5i32..5, 0.0f64..=1.0, 0.0f64..20.0, 0u8..3), 1..8)
    }

    fn build(inputs: &[(i32, f64, f64, u8)]) -> Vec<Proposal> {
        let now = Utc::now();
        let mut ps: Vec<Proposal> = inputs
            .iter()
            .enumerate()
            .map(|(i, (priority, confidence, cost, risk))| {
                let action = ProposedAction::apply_preference(
                    "coaching",
                    "tone",
                    format!("v{}", i).as_str().into(),
                    None,
                )
                .unwrap();
                let risk = [RiskLevel::Low, RiskLevel::Medium, RiskLevel::High][*risk as usize];
                Proposal::new(
                    NewProposal::new(format!("agent{}", i), action)
                        .with_priority(*priority)
                        .with_confidence(*confidence)
                        .with_cost(*cost)
                        .with_risk(risk),
                    now,
                )
                .unwrap()
            })
            .collect();
        ps.sort_by_key(|p| p.proposal_id);
        ps
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_priority_partitions_contenders(inputs in arb_inputs()) {
            let ps = build(&inputs);
            let contenders: Vec<&Proposal> = ps.iter().collect();
            let out = by_priority(&contenders);
            let winner = out.winner.unwrap();
            let max = ps.iter().map(|p| p.priority).max().unwrap();
            let winner_priority = ps.iter().find(|p| p.proposal_id == winner).unwrap().priority;
            prop_assert_eq!(winner_priority, max);
            prop_assert_eq!(out.suppressions.len(), ps.len() - 1);
            prop_assert!(out.suppressions.iter().all(|s| s.proposal_id != winner));
        }

        #[test]
        fn prop_weighted_winner_has_top_score(inputs in arb_inputs()) {
            let ps = build(&inputs);
            let contenders: Vec<&Proposal> = ps.iter().collect();
            let scoring = WeightedScoring::default();
            let out = by_weighted(&contenders, &scoring);
            match out.winner {
                Some(winner) => {
                    let top = ps.iter().map(|p| scoring.score(p)).fold(f64::MIN, f64::max);
                    let w = ps.iter().find(|p| p.proposal_id == winner).unwrap();
                    prop_assert!((scoring.score(w) - top).abs() < 1e-12);
                    prop_assert_eq!(out.suppressions.len(), ps.len() - 1);
                }
                None => {
                    prop_assert_eq!(
                        out.escalation.map(|e| e.reason),
                        Some(EscalationReason::NoClearWinner)
                    );
                }
            }
        }
    }
}
