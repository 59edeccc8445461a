use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{VoterId, VotingId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Census {
    pub voting_id: VotingId,
    pub voter_id: VoterId,
}

/// Body of `POST /census/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CensusCreate {
    pub voting_id: VotingId,
    pub voters: Vec<VoterId>,
}

/// Body of `DELETE /census/{voting_id}/` and response of `GET /census/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CensusVoters {
    pub voters: Vec<VoterId>,
}

/// A census CSV file as received by the upload endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvUpload {
    pub id: i32,
    pub file_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub uploaded: OffsetDateTime,
    pub activated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvImportSummary {
    pub imported: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CsvError {
    #[error("The submitted file is empty.")]
    Empty,

    #[error("Invalid census row at line {line}: expected voting_id,voter_id")]
    InvalidRow { line: usize },
}

/// Parses a census CSV file of `voting_id,voter_id` rows. The first line is
/// a header and is skipped. Rows repeated within the file are kept once.
pub fn parse_census_csv(text: &str) -> Result<Vec<Census>, CsvError> {
    let text = text.trim_start_matches('\u{feff}');
    if text.trim().is_empty() {
        return Err(CsvError::Empty);
    }

    let mut seen = HashSet::new();
    let mut rows = Vec::new();

    for (index, line) in text.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }

        let mut columns = line.split(',').map(str::trim);
        let row = match (columns.next(), columns.next()) {
            (Some(voting_id), Some(voter_id)) => parse_id(voting_id)
                .zip(parse_id(voter_id))
                .map(|(voting_id, voter_id)| Census { voting_id, voter_id }),
            _ => None,
        };

        let Some(row) = row else {
            return Err(CsvError::InvalidRow { line: index + 1 });
        };

        if seen.insert(row) {
            rows.push(row);
        }
    }

    Ok(rows)
}

fn parse_id(value: &str) -> Option<i32> {
    value.parse::<i32>().ok().filter(|id| *id >= 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_parse_skips_header() {
        let rows = parse_census_csv("voting_id,voter_id\n1,2\n1,3\r\n\n2,2\n").unwrap();
        assert_eq!(
            rows,
            vec![
                Census {
                    voting_id: 1,
                    voter_id: 2
                },
                Census {
                    voting_id: 1,
                    voter_id: 3
                },
                Census {
                    voting_id: 2,
                    voter_id: 2
                },
            ]
        );
    }

    #[test]
    fn test_parse_deduplicates() {
        let rows = parse_census_csv("voting,voter\n1,2\n1,2\n").unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_parse_empty() {
        assert_eq!(parse_census_csv(""), Err(CsvError::Empty));
        assert_eq!(parse_census_csv(" \n\n"), Err(CsvError::Empty));
        assert_eq!(
            CsvError::Empty.to_string(),
            "The submitted file is empty."
        );
    }

    #[test]
    fn test_parse_header_only() {
        assert_eq!(parse_census_csv("voting_id,voter_id\n"), Ok(vec![]));
    }

    #[test]
    fn test_parse_rejects_nonsense() {
        assert_eq!(
            parse_census_csv("voting_id,voter_id\n1,2\nhello world\n"),
            Err(CsvError::InvalidRow { line: 3 })
        );
        assert_eq!(
            parse_census_csv("voting_id,voter_id\n1,-2\n"),
            Err(CsvError::InvalidRow { line: 2 })
        );
        assert_eq!(
            parse_census_csv("voting_id,voter_id\nfoo,bar\n"),
            Err(CsvError::InvalidRow { line: 2 })
        );
    }

    proptest! {
        #[test]
        fn test_parse_written_rows(pairs in prop::collection::hash_set((0i32..1000, 0i32..1000), 0..40)) {
            let mut text = "voting_id,voter_id\n".to_owned();
            for (voting_id, voter_id) in &pairs {
                text.push_str(&format!("{voting_id},{voter_id}\n"));
            }
            let rows: HashSet<(i32, i32)> = parse_census_csv(&text)
                .unwrap()
                .into_iter()
                .map(|row| (row.voting_id, row.voter_id))
                .collect();
            prop_assert_eq!(rows, pairs);
        }
    }
}
