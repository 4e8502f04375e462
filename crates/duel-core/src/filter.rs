//! Checks a player's topic and difficulty selection against the problem
//! catalog before the player may enter the queue.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::difficulty::Difficulty;
use crate::topic::TopicId;

/// Per topic, the difficulties that have zero problems.
pub type DisallowedCatalog = BTreeMap<TopicId, BTreeSet<Difficulty>>;

/// A selection that must not enter the queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HardBlock {
    #[error("Select at least one topic and one difficulty.")]
    NothingSelected,
    #[error("Select at least one topic.")]
    NoTopic,
    #[error("Select at least one difficulty.")]
    NoDifficulty,
    #[error("Your difficulty selection is invalid.")]
    InvalidDifficulty { level: u8 },
    #[error("Your topic selection is invalid.")]
    UnknownTopic { topic: TopicId },
    #[error("Topic availability data is missing. Refresh topic map and try again.")]
    CatalogUnavailable,
    #[error(
        "All selected topics are incompatible with your difficulty choices: {}",
        join_names(.topics)
    )]
    AllTopicsDisallowed { topics: Vec<TopicId> },
}

impl HardBlock {
    /// Topics responsible for the block, if the block is about topics.
    pub fn topics(&self) -> &[TopicId] {
        match self {
            HardBlock::AllTopicsDisallowed { topics } => topics,
            HardBlock::UnknownTopic { topic } => std::slice::from_ref(topic),
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    /// Playable, but some selected topics can never be drawn.
    Soft {
        disallowed_topics: Vec<TopicId>,
        valid_topic_count: usize,
    },
    Hard(HardBlock),
}

impl Verdict {
    pub fn can_join(&self) -> bool {
        !matches!(self, Verdict::Hard(_))
    }

    /// Message shown to the player, if any.
    pub fn message(&self) -> Option<String> {
        match self {
            Verdict::Ok => None,
            Verdict::Soft {
                disallowed_topics,
                valid_topic_count,
            } => Some(format!(
                "No problems at your difficulties for: {}. Matching on the remaining {} topic{}.",
                join_names(disallowed_topics),
                valid_topic_count,
                if *valid_topic_count == 1 { "" } else { "s" },
            )),
            Verdict::Hard(block) => Some(block.to_string()),
        }
    }
}

/// Validate a selection. `difficulty_levels` are raw settings values
/// (1 = Easy, 2 = Medium, 3 = Hard); `catalog` is `None` when the catalog
/// could not be loaded, which blocks like an empty one.
pub fn validate(
    topics: &[TopicId],
    difficulty_levels: &[u8],
    catalog: Option<&DisallowedCatalog>,
) -> Verdict {
    match (topics.is_empty(), difficulty_levels.is_empty()) {
        (true, true) => return Verdict::Hard(HardBlock::NothingSelected),
        (false, true) => return Verdict::Hard(HardBlock::NoDifficulty),
        (true, false) => return Verdict::Hard(HardBlock::NoTopic),
        (false, false) => {}
    }

    let mut difficulties = BTreeSet::new();
    for &level in difficulty_levels {
        match Difficulty::from_level(level) {
            Some(d) => {
                difficulties.insert(d);
            }
            None => return Verdict::Hard(HardBlock::InvalidDifficulty { level }),
        }
    }

    let topics: BTreeSet<TopicId> = topics.iter().copied().collect();
    if let Some(topic) = topics.iter().find(|t| !t.is_known()) {
        return Verdict::Hard(HardBlock::UnknownTopic { topic: *topic });
    }

    let catalog = match catalog {
        Some(c) if !c.is_empty() => c,
        _ => return Verdict::Hard(HardBlock::CatalogUnavailable),
    };

    let (disallowed, valid): (Vec<TopicId>, Vec<TopicId>) = topics
        .iter()
        .copied()
        .partition(|t| is_fully_disallowed(catalog, *t, &difficulties));

    if valid.is_empty() {
        Verdict::Hard(HardBlock::AllTopicsDisallowed { topics: disallowed })
    } else if disallowed.is_empty() {
        Verdict::Ok
    } else {
        Verdict::Soft {
            disallowed_topics: disallowed,
            valid_topic_count: valid.len(),
        }
    }
}

/// True when every selected difficulty has zero problems for `topic`.
pub fn is_fully_disallowed(
    catalog: &DisallowedCatalog,
    topic: TopicId,
    selected: &BTreeSet<Difficulty>,
) -> bool {
    catalog
        .get(&topic)
        .is_some_and(|gaps| gaps.is_superset(selected))
}

/// The (topic, difficulty) pairs of a selection that have problems.
pub fn playable_pairs(
    catalog: &DisallowedCatalog,
    topics: &[TopicId],
    difficulties: &[Difficulty],
) -> Vec<(TopicId, Difficulty)> {
    let mut pairs = Vec::new();
    for &topic in topics {
        for &d in difficulties {
            let gap = catalog.get(&topic).is_some_and(|gaps| gaps.contains(&d));
            if !gap {
                pairs.push((topic, d));
            }
        }
    }
    pairs
}

/// Build the catalog from the (topic, difficulty) pairs that do have
/// problems. Every known topic missing a difficulty gets a gap.
pub fn catalog_from_coverage(
    covered: impl IntoIterator<Item = (TopicId, Difficulty)>,
) -> DisallowedCatalog {
    let mut present: BTreeMap<TopicId, BTreeSet<Difficulty>> = BTreeMap::new();
    for (topic, difficulty) in covered {
        present.entry(topic).or_default().insert(difficulty);
    }

    let mut catalog = DisallowedCatalog::new();
    for topic in TopicId::all() {
        let gaps: BTreeSet<Difficulty> = Difficulty::all()
            .iter()
            .copied()
            .filter(|d| !present.get(&topic).is_some_and(|p| p.contains(d)))
            .collect();
        if !gaps.is_empty() {
            catalog.insert(topic, gaps);
        }
    }
    catalog
}

fn join_names(topics: &[TopicId]) -> String {
    topics
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
