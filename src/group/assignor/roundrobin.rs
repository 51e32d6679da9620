//! Round-robin assignment.
//!
//! All subscribed partitions, sorted by topic then partition, are dealt one at
//! a time across the members sorted by id, skipping members that do not
//! subscribe to the partition's topic.

use super::{AssignmentInput, AssignmentOutput, PartitionAssignor};

#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinAssignor;

impl PartitionAssignor for RoundRobinAssignor {
    fn name(&self) -> &'static str {
        "roundrobin"
    }

    fn assign(&self, input: &AssignmentInput) -> AssignmentOutput {
        let mut output = input.empty_output();

        let mut members: Vec<&str> = input.subscriptions.keys().map(String::as_str).collect();
        members.sort_unstable();
        if members.is_empty() {
            return output;
        }

        let mut cursor = 0usize;
        for topic in input.subscribed_topics() {
            let Some(count) = input.assignable_partitions(&topic) else {
                continue;
            };
            for partition in 0..count {
                // Someone subscribes to every topic we iterate, so this ends.
                while !input.is_subscribed(members[cursor % members.len()], &topic) {
                    cursor += 1;
                }
                let member = members[cursor % members.len()];
                cursor += 1;
                if let Some(assignment) = output.get_mut(member) {
                    assignment.add(&topic, partition);
                }
            }
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::assignor::tests::{assert_complete_and_disjoint, input};

    #[test]
    fn test_deals_across_topics() {
        let input = input(&[("c1", &["a", "b"]), ("c2", &["a", "b"])], &[("a", 3), ("b", 2)]);
        let output = RoundRobinAssignor.assign(&input);

        assert_eq!(output["c1"].partitions["a"], vec![0, 2]);
        assert_eq!(output["c1"].partitions["b"], vec![1]);
        assert_eq!(output["c2"].partitions["a"], vec![1]);
        assert_eq!(output["c2"].partitions["b"], vec![0]);
        assert_complete_and_disjoint(&input, &output);
    }

    #[test]
    fn test_balanced_within_one() {
        let input = input(
            &[("a", &["t"]), ("b", &["t"]), ("c", &["t"]), ("d", &["t"])],
            &[("t", 10)],
        );
        let output = RoundRobinAssignor.assign(&input);
        let counts: Vec<usize> = output.values().map(|a| a.partition_count()).collect();
        assert_eq!(counts.iter().sum::<usize>(), 10);
        assert!(counts.iter().max().unwrap() - counts.iter().min().unwrap() <= 1);
    }

    #[test]
    fn test_skips_unsubscribed_members() {
        let input = input(&[("a", &["x"]), ("b", &["y"])], &[("x", 2), ("y", 2)]);
        let output = RoundRobinAssignor.assign(&input);

        assert_eq!(output["a"].partitions["x"], vec![0, 1]);
        assert_eq!(output["b"].partitions["y"], vec![0, 1]);
        assert_complete_and_disjoint(&input, &output);
    }
}
