//! Post-processing of decrypted tallies into per-option results.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{voting::Question, QuestionId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostprocType {
    /// Reports the raw vote counts.
    #[default]
    Identity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostprocOption {
    pub question_id: QuestionId,
    pub number: u32,
    pub option: String,
    pub votes: u64,
    pub postproc: u64,
}

/// Counts the decrypted option numbers of one question. Numbers that match no
/// option of the question are dropped.
#[must_use]
pub fn postproc(
    question: &Question,
    decrypted: &[u64],
    kind: PostprocType,
) -> Vec<PostprocOption> {
    let mut counts: HashMap<u64, u64> = HashMap::new();
    for &number in decrypted {
        *counts.entry(number).or_default() += 1;
    }

    let mut options: Vec<PostprocOption> = question
        .options
        .iter()
        .map(|option| {
            let votes = counts.get(&u64::from(option.number)).copied().unwrap_or(0);
            PostprocOption {
                question_id: question.id,
                number: option.number,
                option: option.option.clone(),
                votes,
                postproc: match kind {
                    PostprocType::Identity => votes,
                },
            }
        })
        .collect();

    options.sort_by(|a, b| b.postproc.cmp(&a.postproc).then(a.number.cmp(&b.number)));
    options
}

/// Builds the human readable summary shown to administrators after a tally.
#[must_use]
pub fn tally_summary(options: &[PostprocOption]) -> String {
    let mut message = "The options that have received votes are the following: ".to_owned();
    for option in options.iter().filter(|option| option.votes > 0) {
        message.push_str(&format!(
            "for option: {} there has been {} votes ",
            option.option, option.votes
        ));
    }
    message
}
