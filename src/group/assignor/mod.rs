//! Partition assignors run by the group leader.
//!
//! | Name | Strategy |
//! |------|----------|
//! | `range` | contiguous partition ranges per topic |
//! | `roundrobin` | all partitions dealt across members in turn |
//! | `sticky` | keeps each member's previous partitions, balances the rest |
//!
//! Every assignor hands each partition of a subscribed topic to exactly one
//! member subscribed to that topic.

mod range;
mod roundrobin;
mod sticky;

use std::collections::{BTreeSet, HashMap};

use crate::protocol::{MemberAssignment, Subscription};

pub use range::RangeAssignor;
pub use roundrobin::RoundRobinAssignor;
pub use sticky::StickyAssignor;

/// Everything an assignor sees.
#[derive(Debug, Clone, Default)]
pub struct AssignmentInput {
    /// member id -> decoded subscription
    pub subscriptions: HashMap<String, Subscription>,
    /// topic -> partition count, for subscribed topics the leader could resolve
    pub topic_partitions: HashMap<String, i32>,
    /// member id -> assignment from the last sync this leader observed
    pub previous: HashMap<String, MemberAssignment>,
}

impl AssignmentInput {
    pub fn new(
        subscriptions: HashMap<String, Subscription>,
        topic_partitions: HashMap<String, i32>,
    ) -> Self {
        Self {
            subscriptions,
            topic_partitions,
            previous: HashMap::new(),
        }
    }

    pub fn with_previous(mut self, previous: HashMap<String, MemberAssignment>) -> Self {
        self.previous = previous;
        self
    }

    /// Topics at least one member subscribes to, sorted.
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscriptions
            .values()
            .flat_map(|s| s.topics.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Members subscribed to `topic`, sorted by member id.
    pub fn members_for_topic(&self, topic: &str) -> Vec<&str> {
        let mut members: Vec<&str> = self
            .subscriptions
            .iter()
            .filter(|(_, s)| s.topics.iter().any(|t| t == topic))
            .map(|(id, _)| id.as_str())
            .collect();
        members.sort_unstable();
        members
    }

    pub(crate) fn is_subscribed(&self, member: &str, topic: &str) -> bool {
        self.subscriptions
            .get(member)
            .is_some_and(|s| s.topics.iter().any(|t| t == topic))
    }

    /// Every member starts with an empty assignment.
    pub(crate) fn empty_output(&self) -> AssignmentOutput {
        self.subscriptions
            .keys()
            .map(|id| (id.clone(), MemberAssignment::new()))
            .collect()
    }

    /// Partition count of `topic` if it has a subscriber and at least one
    /// partition.
    pub(crate) fn assignable_partitions(&self, topic: &str) -> Option<i32> {
        self.topic_partitions
            .get(topic)
            .copied()
            .filter(|&count| count > 0)
    }
}

/// member id -> partitions
pub type AssignmentOutput = HashMap<String, MemberAssignment>;

/// A pluggable partition assignment strategy.
pub trait PartitionAssignor: Send + Sync {
    /// Protocol name advertised in JoinGroup.
    fn name(&self) -> &'static str;

    fn assign(&self, input: &AssignmentInput) -> AssignmentOutput;
}

/// Look up an assignor by protocol name (case-insensitive).
pub fn create_assignor(name: &str) -> Option<Box<dyn PartitionAssignor>> {
    match name.trim().to_ascii_lowercase().as_str() {
        "range" => Some(Box::new(RangeAssignor)),
        "roundrobin" | "round-robin" => Some(Box::new(RoundRobinAssignor)),
        "sticky" => Some(Box::new(StickyAssignor)),
        _ => None,
    }
}

/// The protocol a coordinator would pick: the first entry of the first
/// member's preference list that every member supports.
pub fn select_common_protocol<S: AsRef<str>>(members: &[Vec<S>]) -> Option<String> {
    let (first, rest) = members.split_first()?;
    first
        .iter()
        .map(AsRef::as_ref)
        .find(|candidate| {
            rest.iter()
                .all(|protocols| protocols.iter().any(|p| p.as_ref() == *candidate))
        })
        .map(str::to_string)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;

    pub(crate) fn input(members: &[(&str, &[&str])], topics: &[(&str, i32)]) -> AssignmentInput {
        let subscriptions = members
            .iter()
            .map(|(id, topics)| {
                (
                    id.to_string(),
                    Subscription::new(topics.iter().map(|t| t.to_string()).collect()),
                )
            })
            .collect();
        let topic_partitions = topics.iter().map(|(t, n)| (t.to_string(), *n)).collect();
        AssignmentInput::new(subscriptions, topic_partitions)
    }

    /// Every partition of every subscribed topic goes to exactly one
    /// subscriber of that topic.
    pub(crate) fn assert_complete_and_disjoint(input: &AssignmentInput, output: &AssignmentOutput) {
        let mut seen = HashSet::new();
        for (member, assignment) in output {
            for tp in assignment.topic_partitions() {
                assert!(
                    input.is_subscribed(member, &tp.topic),
                    "{} got {} without subscribing",
                    member,
                    tp
                );
                assert!(seen.insert(tp.clone()), "{} assigned twice", tp);
            }
        }
        for topic in input.subscribed_topics() {
            for p in 0..input.topic_partitions.get(&topic).copied().unwrap_or(0) {
                assert!(
                    seen.contains(&crate::types::TopicPartition::new(topic.clone(), p)),
                    "{}-{} unassigned",
                    topic,
                    p
                );
            }
        }
    }

    #[test]
    fn test_create_assignor() {
        assert_eq!(create_assignor("range").unwrap().name(), "range");
        assert_eq!(create_assignor("RoundRobin").unwrap().name(), "roundrobin");
        assert_eq!(create_assignor("sticky").unwrap().name(), "sticky");
        assert!(create_assignor("cooperative-magic").is_none());
    }

    #[test]
    fn test_select_common_protocol() {
        let members = vec![
            vec!["sticky", "range"],
            vec!["range", "sticky"],
            vec!["range"],
        ];
        assert_eq!(select_common_protocol(&members).as_deref(), Some("range"));

        let members = vec![vec!["sticky", "range"], vec!["range", "sticky"]];
        assert_eq!(select_common_protocol(&members).as_deref(), Some("sticky"));

        let members = vec![vec!["sticky"], vec!["roundrobin"]];
        assert_eq!(select_common_protocol(&members), None);
        assert_eq!(select_common_protocol::<&str>(&[]), None);
    }

    #[test]
    fn test_subscribed_topics_and_members() {
        let input = input(&[("b", &["t1", "t2"]), ("a", &["t1"])], &[("t1", 2), ("t2", 1)]);
        assert_eq!(input.subscribed_topics(), vec!["t1", "t2"]);
        assert_eq!(input.members_for_topic("t1"), vec!["a", "b"]);
        assert_eq!(input.members_for_topic("t2"), vec!["b"]);
    }

    #[test]
    fn test_all_assignors_cover_mixed_subscriptions() {
        let input = input(
            &[("m1", &["a", "b"]), ("m2", &["a"]), ("m3", &["b", "c"])],
            &[("a", 5), ("b", 3), ("c", 4)],
        );
        for name in ["range", "roundrobin", "sticky"] {
            let assignor = create_assignor(name).unwrap();
            let output = assignor.assign(&input);
            assert_eq!(output.len(), 3, "{}", name);
            assert_complete_and_disjoint(&input, &output);
        }
    }
}
