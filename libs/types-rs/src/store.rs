use mixcrypt::{BigInt, Ciphertext};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{QuestionId, VoterId, VotingId};

/// Body of `POST /store/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreVote {
    pub voting: VotingId,
    pub voter: VoterId,
    #[serde(default)]
    pub question: Option<QuestionId>,
    pub vote: Ciphertext,
}

/// A stored encrypted vote. There is at most one per voter and question of a
/// voting; voting again replaces the previous vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub id: i32,
    pub voting_id: VotingId,
    pub voter_id: VoterId,
    pub question_id: Option<QuestionId>,
    pub a: BigInt,
    pub b: BigInt,
    #[serde(with = "time::serde::rfc3339")]
    pub voted: OffsetDateTime,
}

impl Vote {
    #[must_use]
    pub fn ciphertext(&self) -> Ciphertext {
        Ciphertext {
            a: self.a.clone(),
            b: self.b.clone(),
        }
    }
}

/// Query string of `GET /store/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreFilter {
    pub voting_id: Option<VotingId>,
    pub voter_id: Option<VoterId>,
}
