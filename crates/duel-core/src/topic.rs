use std::fmt;

use serde::{Deserialize, Serialize};

/// Index into the fixed practice-topic catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(pub u16);

impl TopicId {
    pub fn name(&self) -> Option<&'static str> {
        TOPIC_NAMES.get(self.0 as usize).copied()
    }

    pub fn is_known(&self) -> bool {
        self.name().is_some()
    }

    pub fn all() -> impl Iterator<Item = TopicId> {
        (0..TOPIC_NAMES.len() as u16).map(TopicId)
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "topic #{}", self.0),
        }
    }
}

/// Topic names in catalog order. Player settings store positions in this list.
pub const TOPIC_NAMES: &[&str] = &[
    "Array",
    "String",
    "Hash Table",
    "Math",
    "Dynamic Programming",
    "Sorting",
    "Greedy",
    "Depth-First Search",
    "Binary Search",
    "Database",
    "Matrix",
    "Bit Manipulation",
    "Tree",
    "Breadth-First Search",
    "Two Pointers",
    "Prefix Sum",
    "Heap (Priority Queue)",
    "Simulation",
    "Binary Tree",
    "Graph",
    "Counting",
    "Stack",
    "Sliding Window",
    "Design",
    "Enumeration",
    "Backtracking",
    "Union Find",
    "Number Theory",
    "Linked List",
    "Ordered Set",
    "Monotonic Stack",
    "Segment Tree",
    "Trie",
    "Combinatorics",
    "Bitmask",
    "Divide and Conquer",
    "Queue",
    "Recursion",
    "Geometry",
    "Binary Indexed Tree",
    "Memoization",
    "Hash Function",
    "Binary Search Tree",
    "Shortest Path",
    "String Matching",
    "Topological Sort",
    "Rolling Hash",
    "Game Theory",
    "Interactive",
    "Data Stream",
    "Monotonic Queue",
    "Brainteaser",
    "Doubly-Linked List",
    "Randomized",
    "Merge Sort",
    "Counting Sort",
    "Iterator",
    "Concurrency",
    "Line Sweep",
    "Probability and Statistics",
    "Quickselect",
    "Suffix Array",
    "Minimum Spanning Tree",
    "Bucket Sort",
    "Shell",
    "Reservoir Sampling",
    "Strongly Connected Component",
    "Eulerian Circuit",
    "Radix Sort",
    "Rejection Sampling",
    "Biconnected Component",
];

/// Looks a topic up by display name, ignoring case, spaces and hyphens.
pub fn topic_by_name(name: &str) -> Option<TopicId> {
    let wanted = normalize(name);
    TOPIC_NAMES
        .iter()
        .position(|n| normalize(n) == wanted)
        .map(|i| TopicId(i as u16))
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}
