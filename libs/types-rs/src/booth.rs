//! View model for the voting booth, where a voter answers one question of a
//! voting at a time.

use serde::{Deserialize, Serialize};

use crate::{
    voting::{Question, Voting},
    QuestionId, VotingId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoothContext {
    pub voting_id: VotingId,
    pub question_id: QuestionId,
    pub voting: Voting,
    pub question: Question,
    pub current_q_pos: usize,
    pub last_question: bool,
    pub next_question_id: Option<QuestionId>,
    pub keybits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("This voting does not exist")]
pub struct BoothNotFound;

/// Position of `question_id` within `questions`, or `questions.len()` when
/// it is not there.
#[must_use]
pub fn question_pos_by_id(questions: &[Question], question_id: QuestionId) -> usize {
    questions
        .iter()
        .position(|question| question.id == question_id)
        .unwrap_or(questions.len())
}

impl BoothContext {
    pub fn build(
        voting: Voting,
        question_id: QuestionId,
        keybits: u32,
    ) -> Result<Self, BoothNotFound> {
        // nothing to encrypt with until the voting starts
        if voting.pub_key.is_none() {
            return Err(BoothNotFound);
        }

        let current_q_pos = question_pos_by_id(&voting.questions, question_id);
        let question = voting
            .questions
            .get(current_q_pos)
            .cloned()
            .ok_or(BoothNotFound)?;
        let last_question = current_q_pos + 1 == voting.questions.len();
        let next_question_id = voting.questions.get(current_q_pos + 1).map(|q| q.id);

        Ok(Self {
            voting_id: voting.id,
            question_id,
            voting,
            question,
            current_q_pos,
            last_question,
            next_question_id,
            keybits,
        })
    }
}
