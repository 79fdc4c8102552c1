use std::collections::HashMap;

use expedition_types::{OutputAggregation, OutputRecord};

/// Combines a sub-stage's member outputs per its declared `output_aggregation` (§4.5).
/// `members_in_order` must list members in `agent_instances` order — ties in `best_of`
/// and `consensus` break toward the earlier member.
pub fn aggregate(
    aggregation: OutputAggregation,
    members_in_order: &[(String, OutputRecord)],
) -> OutputRecord {
    match aggregation {
        OutputAggregation::MergeAll => merge_all(members_in_order),
        OutputAggregation::BestOf => best_of(members_in_order),
        OutputAggregation::Consensus => consensus(members_in_order),
    }
}

fn merge_all(members: &[(String, OutputRecord)]) -> OutputRecord {
    let mut merged = OutputRecord::default();
    for (_, record) in members {
        merged.objectives_completed.extend(record.objectives_completed.iter().cloned());
        merged.findings.extend(record.findings.iter().cloned());
        merged.entities_discovered.extend(record.entities_discovered.iter().cloned());
        merged.file_refs.extend(record.file_refs.iter().cloned());
    }
    merged
}

/// `best_of` scoring is an out-of-scope collaborator (§9 open question); this picks the
/// member with the most findings as a deterministic stand-in, earlier member breaking ties.
fn best_of(members: &[(String, OutputRecord)]) -> OutputRecord {
    members
        .iter()
        .max_by_key(|(_, record)| record.findings.len())
        .map(|(_, record)| record.clone())
        .unwrap_or_default()
}

/// Findings agreed by a strict majority of members survive, in first-occurrence order
/// (§4.5); clustering of near-duplicate findings is an out-of-scope collaborator, so
/// agreement here is exact string equality.
fn consensus(members: &[(String, OutputRecord)]) -> OutputRecord {
    let quorum = members.len() / 2 + 1;
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut first_seen_order: Vec<&str> = Vec::new();
    for (_, record) in members {
        let mut seen_this_member: Vec<&str> = Vec::new();
        for finding in &record.findings {
            if !seen_this_member.contains(&finding.as_str()) {
                seen_this_member.push(finding.as_str());
                if !counts.contains_key(finding.as_str()) {
                    first_seen_order.push(finding.as_str());
                }
                *counts.entry(finding.as_str()).or_insert(0) += 1;
            }
        }
    }
    let findings = first_seen_order
        .into_iter()
        .filter(|finding| counts[finding] >= quorum)
        .map(String::from)
        .collect();

    // Entities/file refs carry through as a plain union, same rule as merge_all — only
    // findings are subject to majority agreement.
    let merged = merge_all(members);
    OutputRecord {
        objectives_completed: merged.objectives_completed,
        findings,
        entities_discovered: merged.entities_discovered,
        file_refs: merged.file_refs,
        metadata: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(findings: &[&str]) -> OutputRecord {
        OutputRecord {
            findings: findings.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn merge_all_concatenates_in_member_order() {
        let members = vec![
            ("a1".to_string(), record(&["x"])),
            ("a2".to_string(), record(&["y"])),
        ];
        let merged = aggregate(OutputAggregation::MergeAll, &members);
        assert_eq!(merged.findings, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn best_of_picks_the_record_with_more_findings() {
        let members = vec![
            ("a1".to_string(), record(&["x"])),
            ("a2".to_string(), record(&["y", "z"])),
        ];
        let picked = aggregate(OutputAggregation::BestOf, &members);
        assert_eq!(picked.findings, vec!["y".to_string(), "z".to_string()]);
    }

    #[test]
    fn best_of_breaks_ties_toward_the_earlier_member() {
        let members = vec![
            ("a1".to_string(), record(&["x"])),
            ("a2".to_string(), record(&["y"])),
        ];
        let picked = aggregate(OutputAggregation::BestOf, &members);
        assert_eq!(picked.findings, vec!["x".to_string()]);
    }

    #[test]
    fn consensus_keeps_only_majority_findings_in_first_seen_order() {
        let members = vec![
            ("a1".to_string(), record(&["shared", "only_a1"])),
            ("a2".to_string(), record(&["shared", "only_a2"])),
            ("a3".to_string(), record(&["shared"])),
        ];
        let merged = aggregate(OutputAggregation::Consensus, &members);
        assert_eq!(merged.findings, vec!["shared".to_string()]);
    }
}
