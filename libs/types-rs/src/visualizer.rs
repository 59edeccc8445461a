use serde::{Deserialize, Serialize};

use crate::{
    postproc::PostprocOption,
    voting::{Voting, VotingStatus},
};

/// What the results page shows for a voting. Results are only published once
/// the voting has been tallied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualizerView {
    pub voting: Voting,
    pub status: VotingStatus,
    pub results: Option<Vec<PostprocOption>>,
}

impl From<Voting> for VisualizerView {
    fn from(voting: Voting) -> Self {
        let status = voting.status();
        let results = match status {
            VotingStatus::Tallied => voting.postproc.clone(),
            _ => None,
        };
        Self {
            voting,
            status,
            results,
        }
    }
}
