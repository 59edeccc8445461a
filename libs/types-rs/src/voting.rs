use std::{collections::HashSet, fmt, str::FromStr};

use mixcrypt::PublicKey;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{postproc::PostprocOption, QuestionId, VotingId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub number: u32,
    pub option: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: QuestionId,
    pub desc: String,
    pub options: Vec<QuestionOption>,
}

/// A mixing authority. The authority flagged `me` is the one run by this
/// server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    pub id: i32,
    pub name: String,
    pub url: String,
    pub me: bool,
}

/// The decrypted votes of one question, in mixnet output order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionTally {
    pub question_id: QuestionId,
    pub votes: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voting {
    pub id: VotingId,
    pub name: String,
    pub desc: String,
    #[serde(rename = "question")]
    pub questions: Vec<Question>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
    pub pub_key: Option<PublicKey>,
    pub auths: Vec<Auth>,
    pub tally: Option<Vec<QuestionTally>>,
    pub postproc: Option<Vec<PostprocOption>>,
    pub total_votes: Option<i64>,
    pub census_total: i64,
}

impl Voting {
    #[must_use]
    pub fn status(&self) -> VotingStatus {
        match (&self.start_date, &self.end_date, &self.tally) {
            (_, _, Some(_)) => VotingStatus::Tallied,
            (_, Some(_), None) => VotingStatus::Stopped,
            (Some(_), None, None) => VotingStatus::Started,
            (None, None, None) => VotingStatus::NotStarted,
        }
    }

    /// Whether votes may be stored at `now`.
    #[must_use]
    pub fn is_open(&self, now: OffsetDateTime) -> bool {
        match (self.start_date, self.end_date) {
            (Some(start), None) => start <= now,
            (Some(start), Some(end)) => start <= now && now < end,
            (None, _) => false,
        }
    }

    #[must_use]
    pub fn question(&self, question_id: QuestionId) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == question_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingStatus {
    NotStarted,
    Started,
    Stopped,
    Tallied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingAction {
    Start,
    Stop,
    Tally,
}

impl VotingAction {
    #[must_use]
    pub const fn success_message(self) -> &'static str {
        match self {
            Self::Start => "Voting started",
            Self::Stop => "Voting stopped",
            Self::Tally => "Voting tallied",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Action not found, try with start, stop or tally")]
pub struct UnknownAction;

impl FromStr for VotingAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "tally" => Ok(Self::Tally),
            _ => Err(UnknownAction),
        }
    }
}

impl fmt::Display for VotingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Tally => "tally",
        })
    }
}

/// Why an action is not allowed in the current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StatusError {
    #[error("Voting already started")]
    AlreadyStarted,

    #[error("Voting is not started")]
    NotStarted,

    #[error("Voting is not stopped")]
    NotStopped,

    #[error("Voting already stopped")]
    AlreadyStopped,

    #[error("Voting already tallied")]
    AlreadyTallied,
}

impl VotingStatus {
    /// Checks whether `action` may be applied in this status.
    pub fn check(self, action: VotingAction) -> Result<(), StatusError> {
        use VotingAction as A;
        use VotingStatus as S;

        match (action, self) {
            (A::Start, S::NotStarted) => Ok(()),
            (A::Start, _) => Err(StatusError::AlreadyStarted),

            (A::Stop, S::NotStarted) => Err(StatusError::NotStarted),
            (A::Stop, S::Started) => Ok(()),
            (A::Stop, S::Stopped | S::Tallied) => Err(StatusError::AlreadyStopped),

            (A::Tally, S::NotStarted) => Err(StatusError::NotStarted),
            (A::Tally, S::Started) => Err(StatusError::NotStopped),
            (A::Tally, S::Stopped) => Ok(()),
            (A::Tally, S::Tallied) => Err(StatusError::AlreadyTallied),
        }
    }
}

/// Body of `PUT /voting/{id}/`. The action stays a string so that unknown
/// actions can be reported with a proper message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotingActionRequest {
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewQuestionOption {
    #[serde(default)]
    pub number: Option<u32>,
    pub option: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewQuestion {
    pub desc: String,
    pub options: Vec<NewQuestionOption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAuth {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewVoting {
    pub name: String,
    pub desc: String,
    pub question: Vec<NewQuestion>,
    #[serde(default)]
    pub auths: Vec<NewAuth>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("name is required")]
    MissingName,

    #[error("desc is required")]
    MissingDesc,

    #[error("at least one question is required")]
    MissingQuestions,

    #[error("question {0} has no description")]
    MissingQuestionDesc(usize),

    #[error("question {0} needs at least two options")]
    TooFewOptions(usize),

    #[error("question {0} uses option number 0, which cannot be encrypted")]
    ZeroOptionNumber(usize),

    #[error("question {question} repeats option number {number}")]
    DuplicateOptionNumber { question: usize, number: u32 },
}

impl NewQuestion {
    /// Assigns numbers to options that lack one. An option without a number
    /// gets its position plus two.
    #[must_use]
    pub fn numbered_options(&self) -> Vec<QuestionOption> {
        self.options
            .iter()
            .enumerate()
            .map(|(position, option)| QuestionOption {
                number: option.number.unwrap_or(position as u32 + 2),
                option: option.option.clone(),
            })
            .collect()
    }
}

impl NewVoting {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingName);
        }
        if self.desc.trim().is_empty() {
            return Err(ValidationError::MissingDesc);
        }
        if self.question.is_empty() {
            return Err(ValidationError::MissingQuestions);
        }

        for (index, question) in self.question.iter().enumerate() {
            if question.desc.trim().is_empty() {
                return Err(ValidationError::MissingQuestionDesc(index));
            }
            if question.options.len() < 2 {
                return Err(ValidationError::TooFewOptions(index));
            }
            let mut seen = HashSet::new();
            for option in question.numbered_options() {
                if option.number == 0 {
                    return Err(ValidationError::ZeroOptionNumber(index));
                }
                if !seen.insert(option.number) {
                    return Err(ValidationError::DuplicateOptionNumber {
                        question: index,
                        number: option.number,
                    });
                }
            }
        }

        Ok(())
    }
}
