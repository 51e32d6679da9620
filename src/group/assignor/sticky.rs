//! Sticky assignment.
//!
//! 1. Each member keeps the partitions it held in the previous assignment,
//!    as long as the member is still subscribed and the partition still
//!    exists.
//! 2. Unowned partitions go to the eligible member holding the fewest.
//! 3. Partitions move from the most to the least loaded eligible member
//!    until no eligible move would narrow the gap.

use std::collections::{BTreeMap, BTreeSet};

use super::{AssignmentInput, AssignmentOutput, PartitionAssignor};
use crate::types::TopicPartition;

#[derive(Debug, Clone, Copy, Default)]
pub struct StickyAssignor;

impl PartitionAssignor for StickyAssignor {
    fn name(&self) -> &'static str {
        "sticky"
    }

    fn assign(&self, input: &AssignmentInput) -> AssignmentOutput {
        // member -> owned partitions; BTree keeps the result deterministic
        let mut owned: BTreeMap<&str, BTreeSet<TopicPartition>> = input
            .subscriptions
            .keys()
            .map(|id| (id.as_str(), BTreeSet::new()))
            .collect();
        if owned.is_empty() {
            return input.empty_output();
        }

        let mut unassigned: BTreeSet<TopicPartition> = BTreeSet::new();
        for topic in input.subscribed_topics() {
            if let Some(count) = input.assignable_partitions(&topic) {
                unassigned.extend((0..count).map(|p| TopicPartition::new(topic.clone(), p)));
            }
        }

        let mut previous: Vec<(&String, _)> = input.previous.iter().collect();
        previous.sort_by(|a, b| a.0.cmp(b.0));
        for (member, assignment) in previous {
            let Some(partitions) = owned.get_mut(member.as_str()) else {
                continue;
            };
            for tp in assignment.topic_partitions() {
                if input.is_subscribed(member, &tp.topic) && unassigned.remove(&tp) {
                    partitions.insert(tp);
                }
            }
        }

        for tp in unassigned {
            let target = owned
                .iter()
                .filter(|(member, _)| input.is_subscribed(member, &tp.topic))
                .min_by_key(|(member, partitions)| (partitions.len(), **member))
                .map(|(member, _)| *member);
            if let Some(member) = target {
                owned.entry(member).or_default().insert(tp);
            }
        }

        rebalance(input, &mut owned);

        let mut output = input.empty_output();
        for (member, partitions) in owned {
            if let Some(assignment) = output.get_mut(member) {
                for tp in partitions {
                    assignment.add(&tp.topic, tp.partition);
                }
            }
        }
        output
    }
}

/// Move single partitions from heavier to lighter members while that
/// narrows the spread by at least two.
fn rebalance(input: &AssignmentInput, owned: &mut BTreeMap<&str, BTreeSet<TopicPartition>>) {
    let total: usize = owned.values().map(BTreeSet::len).sum();
    for _ in 0..total {
        let mut by_load: Vec<(&str, usize)> = owned.iter().map(|(m, p)| (*m, p.len())).collect();
        by_load.sort_by_key(|(member, len)| (*len, *member));

        let candidate = by_load.iter().rev().find_map(|(heavy, heavy_len)| {
            by_load
                .iter()
                .take_while(|(_, light_len)| light_len + 1 < *heavy_len)
                .find_map(|(light, _)| {
                    owned[heavy]
                        .iter()
                        .find(|tp| input.is_subscribed(light, &tp.topic))
                        .map(|tp| (*heavy, *light, tp.clone()))
                })
        });

        let Some((heavy, light, tp)) = candidate else {
            return;
        };
        if let Some(from) = owned.get_mut(heavy) {
            from.remove(&tp);
        }
        owned.entry(light).or_default().insert(tp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::assignor::tests::{assert_complete_and_disjoint, input};
    use crate::protocol::MemberAssignment;
    use std::collections::HashMap;

    fn counts(output: &AssignmentOutput) -> Vec<usize> {
        let mut counts: Vec<usize> = output.values().map(|a| a.partition_count()).collect();
        counts.sort_unstable();
        counts
    }

    #[test]
    fn test_fresh_assignment_is_balanced() {
        let input = input(&[("a", &["t"]), ("b", &["t"]), ("c", &["t"])], &[("t", 7)]);
        let output = StickyAssignor.assign(&input);
        assert_eq!(counts(&output), vec![2, 2, 3]);
        assert_complete_and_disjoint(&input, &output);
    }

    #[test]
    fn test_keeps_previous_partitions() {
        let mut previous = HashMap::new();
        previous.insert("a".to_string(), {
            let mut m = MemberAssignment::new();
            for p in [0, 2, 4] {
                m.add("t", p);
            }
            m
        });
        previous.insert("b".to_string(), {
            let mut m = MemberAssignment::new();
            for p in [1, 3, 5] {
                m.add("t", p);
            }
            m
        });

        // "c" joins: each old member gives up exactly one partition.
        let input = input(&[("a", &["t"]), ("b", &["t"]), ("c", &["t"])], &[("t", 6)])
            .with_previous(previous);
        let output = StickyAssignor.assign(&input);

        assert_eq!(counts(&output), vec![2, 2, 2]);
        for p in &output["a"].partitions["t"] {
            assert!([0, 2, 4].contains(p));
        }
        for p in &output["b"].partitions["t"] {
            assert!([1, 3, 5].contains(p));
        }
        assert_complete_and_disjoint(&input, &output);
    }

    #[test]
    fn test_departed_member_partitions_redistributed() {
        let mut previous = HashMap::new();
        previous.insert("a".to_string(), [0, 1, 2].into_iter().map(|p| TopicPartition::new("t", p)).collect::<MemberAssignment>());
        previous.insert("gone".to_string(), [3, 4, 5].into_iter().map(|p| TopicPartition::new("t", p)).collect::<MemberAssignment>());

        let input = input(&[("a", &["t"]), ("b", &["t"])], &[("t", 6)]).with_previous(previous);
        let output = StickyAssignor.assign(&input);

        assert_eq!(output["a"].partitions["t"], vec![0, 1, 2]);
        assert_eq!(output["b"].partitions["t"], vec![3, 4, 5]);
    }

    #[test]
    fn test_dropped_subscription_releases_partitions() {
        let mut previous = HashMap::new();
        previous.insert("a".to_string(), [0, 1].into_iter().map(|p| TopicPartition::new("old", p)).collect::<MemberAssignment>());

        let input = input(&[("a", &["new"]), ("b", &["old"])], &[("old", 2), ("new", 2)])
            .with_previous(previous);
        let output = StickyAssignor.assign(&input);

        assert_eq!(output["a"].partitions.get("old"), None);
        assert_eq!(output["b"].partitions["old"], vec![0, 1]);
        assert_complete_and_disjoint(&input, &output);
    }
}
