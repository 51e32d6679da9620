//! Range assignment.
//!
//! Per topic, subscribers sorted by member id each take a contiguous range.
//! With 7 partitions and 3 members the ranges are `[0, 1, 2]`, `[3, 4]`,
//! `[5, 6]`: the first `partitions % members` members get one extra.

use super::{AssignmentInput, AssignmentOutput, PartitionAssignor};

#[derive(Debug, Clone, Copy, Default)]
pub struct RangeAssignor;

impl PartitionAssignor for RangeAssignor {
    fn name(&self) -> &'static str {
        "range"
    }

    fn assign(&self, input: &AssignmentInput) -> AssignmentOutput {
        let mut output = input.empty_output();

        for topic in input.subscribed_topics() {
            let Some(count) = input.assignable_partitions(&topic) else {
                continue;
            };
            let members = input.members_for_topic(&topic);
            let per_member = count / members.len() as i32;
            let extra = count % members.len() as i32;

            let mut next = 0;
            for (i, member) in members.iter().enumerate() {
                let len = per_member + i32::from((i as i32) < extra);
                if let Some(assignment) = output.get_mut(*member) {
                    for partition in next..next + len {
                        assignment.add(&topic, partition);
                    }
                }
                next += len;
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
    fn test_uneven_ranges() {
        let input = input(&[("m1", &["t"]), ("m2", &["t"]), ("m3", &["t"])], &[("t", 7)]);
        let output = RangeAssignor.assign(&input);

        assert_eq!(output["m1"].partitions["t"], vec![0, 1, 2]);
        assert_eq!(output["m2"].partitions["t"], vec![3, 4]);
        assert_eq!(output["m3"].partitions["t"], vec![5, 6]);
        assert_complete_and_disjoint(&input, &output);
    }

    #[test]
    fn test_more_members_than_partitions() {
        let input = input(&[("a", &["t"]), ("b", &["t"]), ("c", &["t"])], &[("t", 2)]);
        let output = RangeAssignor.assign(&input);

        assert_eq!(output["a"].partitions["t"], vec![0]);
        assert_eq!(output["b"].partitions["t"], vec![1]);
        assert!(output["c"].is_empty());
    }

    #[test]
    fn test_ranges_are_per_topic() {
        let input = input(&[("a", &["x", "y"]), ("b", &["x", "y"])], &[("x", 3), ("y", 3)]);
        let output = RangeAssignor.assign(&input);

        // The first member wins the extra partition of both topics.
        assert_eq!(output["a"].partition_count(), 4);
        assert_eq!(output["b"].partition_count(), 2);
        assert_complete_and_disjoint(&input, &output);
    }

    #[test]
    fn test_unknown_topic_skipped() {
        let input = input(&[("a", &["missing"])], &[]);
        let output = RangeAssignor.assign(&input);
        assert!(output["a"].is_empty());
    }
}
