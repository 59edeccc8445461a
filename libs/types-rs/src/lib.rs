//! Types shared between the Decide server and its clients, along with the
//! pure rules that govern them: the voting status machine, census CSV
//! parsing, tally post-processing and the booth/visualizer view models.

pub mod auth;
pub mod booth;
pub mod census;
pub mod postproc;
pub mod store;
pub mod visualizer;
pub mod voting;

/// Identifier of a voting.
pub type VotingId = i32;

/// Identifier of a question.
pub type QuestionId = i32;

/// Identifier of a voter, i.e. a user id.
pub type VoterId = i32;
