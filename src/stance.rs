//! Stance-shift engine: bounded, clamped acceptance/firmness moves in
//! response to literal issue and option mentions in free text.
//!
//! Pure function over a snapshot; callers decide which role's stances to
//! feed in and where the change reasons get logged.

use crate::state::{IssueStance, RoleStances, StanceChange};
use std::collections::BTreeMap;

pub const MAX_ACCEPTANCE_DELTA: f64 = 0.10;
pub const MAX_FIRMNESS_DELTA: f64 = 0.05;
pub const ACCEPTANCE_DELTA_ON_MENTION: f64 = 0.05;
pub const FIRMNESS_DELTA_ON_ISSUE_MENTION: f64 = 0.02;
pub const TRIGGER_SNIPPET_LEN: usize = 80;

/// Issue id -> option ids, the catalog the matcher runs against.
pub type IssueOptionSpec = BTreeMap<String, Vec<String>>;

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

fn trigger_snippet(trigger: &str) -> String {
    trigger.chars().take(TRIGGER_SNIPPET_LEN).collect()
}

fn issue_matches(issue_id: &str, options: &[String], trigger: &str) -> bool {
    trigger.contains(issue_id) || options.iter().any(|opt| trigger.contains(opt.as_str()))
}

fn matched_issue_ids<'a>(
    issue_id: Option<&str>,
    trigger: &str,
    spec: &'a IssueOptionSpec,
) -> Vec<&'a str> {
    match issue_id {
        Some(scoped) => spec
            .get_key_value(scoped)
            .filter(|(id, options)| issue_matches(id, options, trigger))
            .map(|(id, _)| vec![id.as_str()])
            .unwrap_or_default(),
        None => spec
            .iter()
            .filter(|(id, options)| issue_matches(id, options, trigger))
            .map(|(id, _)| id.as_str())
            .collect(),
    }
}

/// Apply mention-driven shifts to one role's stance snapshot.
///
/// Returns the updated snapshot plus one reason per value that actually
/// changed. Null acceptances stay null; per-invocation deltas are bounded
/// by `MAX_ACCEPTANCE_DELTA` / `MAX_FIRMNESS_DELTA` and clamped to [0, 1].
pub fn apply_stance_shift(
    role_id: &str,
    round_id: u8,
    issue_id: Option<&str>,
    trigger_text: &str,
    snapshot: &RoleStances,
    spec: &IssueOptionSpec,
) -> (RoleStances, Vec<StanceChange>) {
    let mut updated = snapshot.clone();
    let mut reasons = Vec::new();
    let snippet = trigger_snippet(trigger_text);

    for matched in matched_issue_ids(issue_id, trigger_text, spec) {
        let Some(options) = spec.get(matched) else { continue };
        let Some(stance) = updated.get_mut(matched) else { continue };

        for option_id in options {
            if !trigger_text.contains(option_id.as_str()) {
                continue;
            }
            let Some(Some(current)) = stance.acceptance.get(option_id).copied() else {
                // absent or null acceptance: nothing to move
                continue;
            };
            let delta = ACCEPTANCE_DELTA_ON_MENTION.min(MAX_ACCEPTANCE_DELTA);
            let new_val = clamp01(current + delta);
            if new_val != current {
                stance.acceptance.insert(option_id.clone(), Some(new_val));
                reasons.push(StanceChange {
                    role_id: role_id.to_string(),
                    round_id,
                    issue_id: matched.to_string(),
                    option_id: Some(option_id.clone()),
                    delta_acceptance: Some(new_val - current),
                    delta_firmness: None,
                    rule: "option_mention_acceptance_increase".to_string(),
                    trigger: snippet.clone(),
                });
            }
        }

        if trigger_text.contains(matched) {
            let delta = FIRMNESS_DELTA_ON_ISSUE_MENTION.min(MAX_FIRMNESS_DELTA);
            let current = stance.firmness;
            let new_val = clamp01(current + delta);
            if new_val != current {
                stance.firmness = new_val;
                reasons.push(StanceChange {
                    role_id: role_id.to_string(),
                    round_id,
                    issue_id: matched.to_string(),
                    option_id: None,
                    delta_acceptance: None,
                    delta_firmness: Some(new_val - current),
                    rule: "issue_mention_firmness_increase".to_string(),
                    trigger: snippet.clone(),
                });
            }
        }
    }

    (updated, reasons)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_two_issues() -> IssueOptionSpec {
        let mut spec = BTreeMap::new();
        spec.insert("1".to_string(), vec!["1.1".to_string(), "1.2".to_string()]);
        spec.insert("2".to_string(), vec!["2.1".to_string(), "2.2".to_string()]);
        spec
    }

    fn snapshot_with(issue: &str, option: &str, value: Option<f64>, firmness: f64) -> RoleStances {
        let mut stance = IssueStance::with_firmness(firmness);
        stance.acceptance.insert(option.to_string(), value);
        let mut snapshot = RoleStances::new();
        snapshot.insert(issue.to_string(), stance);
        snapshot
    }

    #[test]
    fn unit_option_mention_bumps_acceptance_and_firmness() {
        let snapshot = snapshot_with("1", "1.1", Some(0.4), 0.5);
        let (updated, reasons) =
            apply_stance_shift("USA", 2, None, "we lean toward 1.1 here", &snapshot, &spec_two_issues());

        assert_eq!(updated["1"].acceptance["1.1"], Some(0.45));
        // "1" itself appears inside "1.1", so firmness moves too
        assert_eq!(updated["1"].firmness, 0.52);
        assert_eq!(reasons.len(), 2);
        assert!(reasons.iter().any(|r| r.rule == "option_mention_acceptance_increase"));
        assert!(reasons.iter().any(|r| r.rule == "issue_mention_firmness_increase"));
    }

    #[test]
    fn unit_null_acceptance_is_immutable() {
        let snapshot = snapshot_with("1", "1.1", None, 0.5);
        let (updated, reasons) =
            apply_stance_shift("USA", 2, None, "talking about 1.1", &snapshot, &spec_two_issues());

        assert_eq!(updated["1"].acceptance["1.1"], None);
        assert!(reasons.iter().all(|r| r.option_id.as_deref() != Some("1.1")));
    }

    #[test]
    fn unit_acceptance_clamps_at_one_without_phantom_reasons() {
        let snapshot = snapshot_with("1", "1.1", Some(1.0), 1.0);
        let (updated, reasons) =
            apply_stance_shift("USA", 2, None, "1.1 again", &snapshot, &spec_two_issues());

        assert_eq!(updated["1"].acceptance["1.1"], Some(1.0));
        assert_eq!(updated["1"].firmness, 1.0);
        // nothing moved, so no reasons at all
        assert!(reasons.is_empty());
    }

    #[test]
    fn unit_scoped_issue_ignores_other_mentions() {
        let mut snapshot = snapshot_with("1", "1.1", Some(0.4), 0.5);
        let mut other = IssueStance::with_firmness(0.5);
        other.acceptance.insert("2.1".to_string(), Some(0.4));
        snapshot.insert("2".to_string(), other);

        let (updated, _) = apply_stance_shift(
            "USA",
            3,
            Some("1"),
            "both 1.1 and 2.1 come up",
            &snapshot,
            &spec_two_issues(),
        );

        assert_eq!(updated["1"].acceptance["1.1"], Some(0.45));
        assert_eq!(updated["2"].acceptance["2.1"], Some(0.4));
    }

    #[test]
    fn unit_no_mention_means_no_change() {
        let snapshot = snapshot_with("1", "1.1", Some(0.4), 0.5);
        let (updated, reasons) =
            apply_stance_shift("USA", 2, None, "nothing relevant here", &snapshot, &spec_two_issues());
        assert_eq!(updated["1"], snapshot["1"]);
        assert!(reasons.is_empty());
    }

    #[test]
    fn unit_trigger_evidence_is_capped_at_80_chars() {
        let long_trigger = format!("1.1 {}", "x".repeat(200));
        let snapshot = snapshot_with("1", "1.1", Some(0.4), 0.5);
        let (_, reasons) =
            apply_stance_shift("USA", 2, None, &long_trigger, &snapshot, &spec_two_issues());
        assert!(!reasons.is_empty());
        for reason in &reasons {
            assert_eq!(reason.trigger.chars().count(), TRIGGER_SNIPPET_LEN);
        }
    }

    #[test]
    fn unit_deltas_stay_within_per_invocation_bounds() {
        let snapshot = snapshot_with("1", "1.1", Some(0.2), 0.3);
        let (_, reasons) =
            apply_stance_shift("USA", 2, None, "1 and 1.1", &snapshot, &spec_two_issues());
        for reason in &reasons {
            if let Some(delta) = reason.delta_acceptance {
                assert!(delta.abs() <= MAX_ACCEPTANCE_DELTA + 1e-12);
            }
            if let Some(delta) = reason.delta_firmness {
                assert!(delta.abs() <= MAX_FIRMNESS_DELTA + 1e-12);
            }
        }
    }
}
