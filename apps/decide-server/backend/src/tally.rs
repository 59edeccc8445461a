//! Key generation when a voting starts and the mixnet tally once it stops.

use std::collections::{hash_map::Entry, HashMap};

use mixcrypt::{BigInt, Ciphertext, Group, KeyPair, Mixnet, PublicKey};
use types_rs::{
    postproc::{self, PostprocOption, PostprocType},
    store::Vote,
    voting::{QuestionTally, Voting},
    QuestionId, VoterId,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Voting has no questions")]
    NoQuestions,

    #[error("Voting has no authorities")]
    NoAuthorities,

    #[error("Crypto error: {0}")]
    Crypto(#[from] mixcrypt::Error),
}

/// Key shares for each authority of a voting, paired with the authority's ID,
/// and the combined key voters encrypt against.
#[derive(Debug, Clone)]
pub struct VotingKeys {
    pub key_pairs: Vec<(i32, KeyPair)>,
    pub pub_key: PublicKey,
}

/// Generates a group of `keybits` bits and one key share per authority.
pub fn create_keys(keybits: u32, auth_ids: &[i32]) -> Result<VotingKeys, Error> {
    if auth_ids.is_empty() {
        return Err(Error::NoAuthorities);
    }

    let group = Group::generate(keybits)?;
    let mixnet = Mixnet::generate(&group, auth_ids.len())?;
    let pub_key = mixnet.public_key()?;

    Ok(VotingKeys {
        key_pairs: auth_ids
            .iter()
            .copied()
            .zip(mixnet.authorities().iter().cloned())
            .collect(),
        pub_key,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TallyOutcome {
    pub tally: Vec<QuestionTally>,
    pub postproc: Vec<PostprocOption>,
    pub total_votes: i64,
}

/// Mixes and decrypts the votes of a voting question by question, then counts
/// them. A vote without a question counts for the first question, and only
/// the latest vote of a voter for a question is counted. Votes for questions
/// outside the voting and ciphertexts outside the voting's group are left out.
pub fn tally_votes(
    voting: &Voting,
    key_pairs: Vec<KeyPair>,
    votes: &[Vote],
) -> Result<TallyOutcome, Error> {
    let first_question = voting.questions.first().ok_or(Error::NoQuestions)?;
    let mixnet = Mixnet::new(key_pairs)?;
    let pub_key = mixnet.public_key()?;

    let mut latest: HashMap<(VoterId, QuestionId), &Vote> = HashMap::new();

    for vote in votes {
        let question_id = vote.question_id.unwrap_or(first_question.id);
        if voting.question(question_id).is_none() {
            tracing::warn!(
                "Vote {} of voting {} is for unknown question {question_id}",
                vote.id,
                voting.id
            );
            continue;
        }
        if let Err(e) = pub_key.check_ciphertext(&vote.ciphertext()) {
            tracing::warn!("Skipping vote {} of voting {}: {e}", vote.id, voting.id);
            continue;
        }

        match latest.entry((vote.voter_id, question_id)) {
            Entry::Occupied(mut entry) => {
                if entry.get().id < vote.id {
                    entry.insert(vote);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(vote);
            }
        }
    }

    let total_votes = latest.len() as i64;
    let mut by_question: HashMap<QuestionId, Vec<Ciphertext>> = HashMap::new();
    for ((_, question_id), vote) in latest {
        by_question
            .entry(question_id)
            .or_default()
            .push(vote.ciphertext());
    }

    let mut tally = Vec::with_capacity(voting.questions.len());
    let mut results = Vec::new();

    for question in &voting.questions {
        let ciphertexts = by_question.remove(&question.id).unwrap_or_default();
        let decrypted: Vec<u64> = mixnet
            .shuffle_decrypt(&ciphertexts)?
            .iter()
            .filter_map(BigInt::to_u64)
            .collect();

        results.extend(postproc::postproc(
            question,
            &decrypted,
            PostprocType::Identity,
        ));
        tally.push(QuestionTally {
            question_id: question.id,
            votes: decrypted,
        });
    }

    Ok(TallyOutcome {
        tally,
        postproc: results,
        total_votes,
    })
}
