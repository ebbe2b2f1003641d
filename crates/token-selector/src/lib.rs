//! Ranks instruments for new entries: hard filters, a weighted score and
//! overlap penalties against the current book.

pub mod selector;

pub use selector::{Candidate, CandidateScore, CandidateScorer, FilterRejection, ScoreComponents, Selection};
