pub mod difficulty;
pub mod filter;
pub mod protocol;
pub mod rating;
pub mod topic;

pub use difficulty::Difficulty;
pub use filter::{DisallowedCatalog, HardBlock, Verdict};
pub use protocol::{ClientMessage, MatchId, MatchResult, PlayerId, Problem, ServerMessage};
pub use topic::TopicId;
