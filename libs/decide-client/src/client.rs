use std::fmt::Display;

use serde::{de::DeserializeOwned, Serialize};
use types_rs::{
    auth::{LoginRequest, LoginResponse, NewUser, User},
    booth::BoothContext,
    census::{CensusCreate, CensusVoters, CsvImportSummary, CsvUpload},
    store::{StoreFilter, StoreVote, Vote},
    visualizer::VisualizerView,
    voting::{NewVoting, Question, Voting, VotingActionRequest},
    QuestionId, VoterId, VotingId,
};

use crate::result::{Error, Result};

/// A client for the Decide server.
#[derive(Debug, Clone)]
pub struct Client {
    base_url: reqwest::Url,

    /// The bearer token for the current session.
    bearer_token: Option<String>,
}

impl Client {
    /// Create a new client with the given base URL.
    ///
    /// # Example
    ///
    /// ```
    /// # use decide_client::Client;
    /// let base_url = "http://localhost:8000".parse().unwrap();
    /// let client = Client::new(base_url);
    /// ```
    pub const fn new(base_url: reqwest::Url) -> Self {
        Self {
            base_url,
            bearer_token: None,
        }
    }

    /// Create a new client to connect to the server running on localhost.
    pub fn localhost() -> Self {
        Self::new(
            "http://localhost:8000"
                .parse()
                .expect("hardcoded URL is valid"),
        )
    }

    /// Use an existing session token, e.g. one saved from a previous login.
    #[must_use]
    pub fn with_bearer_token(mut self, bearer_token: impl Into<String>) -> Self {
        self.bearer_token = Some(bearer_token.into());
        self
    }

    /// The bearer token of the current session, if logged in.
    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer_token.as_deref()
    }

    /// Check that the server is responding.
    pub async fn check_status(&self) -> Result<()> {
        let response = self.get("/api/status").await?;
        response.error_for_status()?;
        Ok(())
    }

    /// Log in with a username (or email address) and password. The session
    /// token is kept for future requests.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let request = LoginRequest {
            username: username.to_owned(),
            password: password.to_owned(),
        };
        let response = self.post_json("/authentication/login/", &request).await?;

        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            return Err(Error::Authentication(response.text().await?));
        }

        let LoginResponse { token } = read_json(response, "failed to log in").await?;
        self.bearer_token = Some(token);
        Ok(())
    }

    /// End the current session.
    pub async fn logout(&mut self) -> Result<()> {
        let response = self
            .post_json("/authentication/logout/", &serde_json::json!({}))
            .await?;
        expect_success(response, "failed to log out").await?;
        self.bearer_token = None;
        Ok(())
    }

    /// Get the user of the current session.
    pub async fn get_user(&self) -> Result<User> {
        let response = self
            .post_json("/authentication/getuser/", &serde_json::json!({}))
            .await?;
        read_json(response, "failed to get user").await
    }

    /// Create a user account. Requires a staff session.
    pub async fn register(&self, user: &NewUser) -> Result<User> {
        let response = self.post_json("/authentication/register/", user).await?;
        read_json(response, &format!("failed to register {:?}", user.username)).await
    }

    /// Add voters to the census of a voting.
    pub async fn create_census(&self, voting_id: VotingId, voters: &[VoterId]) -> Result<String> {
        let request = CensusCreate {
            voting_id,
            voters: voters.to_vec(),
        };
        let response = self.post_json("/census/", &request).await?;
        read_json(
            response,
            &format!("failed to create census for voting {voting_id}"),
        )
        .await
    }

    /// List the voters in the census of a voting.
    pub async fn list_census(&self, voting_id: VotingId) -> Result<Vec<VoterId>> {
        let mut url = self.normalize_url("/census/")?;
        url.query_pairs_mut()
            .append_pair("voting_id", &voting_id.to_string());
        let response = self.get(url.as_str()).await?;
        let CensusVoters { voters } = read_json(
            response,
            &format!("failed to list census of voting {voting_id}"),
        )
        .await?;
        Ok(voters)
    }

    /// Remove voters from the census of a voting.
    pub async fn delete_census(&self, voting_id: VotingId, voters: &[VoterId]) -> Result<()> {
        let request = CensusVoters {
            voters: voters.to_vec(),
        };
        let response = self
            .make_request(reqwest::Method::DELETE, &format!("/census/{voting_id}/"))?
            .json(&request)
            .send()
            .await?;
        expect_success(
            response,
            &format!("failed to delete census of voting {voting_id}"),
        )
        .await
    }

    /// Whether a voter is in the census of a voting.
    pub async fn check_census(&self, voting_id: VotingId, voter_id: VoterId) -> Result<bool> {
        let mut url = self.normalize_url(&format!("/census/{voting_id}/"))?;
        url.query_pairs_mut()
            .append_pair("voter_id", &voter_id.to_string());
        let response = self.get(url.as_str()).await?;

        match response.status() {
            reqwest::StatusCode::UNAUTHORIZED => Ok(false),
            status_code if status_code.is_success() => Ok(true),
            status_code => Err(Error::Http {
                status_code,
                text: response.text().await?,
                context: format!("failed to check voter {voter_id} in voting {voting_id}"),
            }),
        }
    }

    /// Upload a census CSV file of `voting_id,voter_id` rows.
    pub async fn upload_census_csv(
        &self,
        file_name: &str,
        contents: impl Into<String>,
    ) -> Result<CsvImportSummary> {
        let mut url = self.normalize_url("/census/upload")?;
        url.query_pairs_mut().append_pair("file_name", file_name);
        let response = self
            .make_request(reqwest::Method::POST, url.as_str())?
            .header(reqwest::header::CONTENT_TYPE, "text/csv")
            .body(contents.into())
            .send()
            .await?;
        read_json(response, &format!("failed to upload census {file_name:?}")).await
    }

    /// List the census files uploaded so far.
    pub async fn list_census_uploads(&self) -> Result<Vec<CsvUpload>> {
        let response = self.get("/census/uploads").await?;
        read_json(response, "failed to list census uploads").await
    }

    pub async fn delete_census_upload(&self, upload_id: i32) -> Result<()> {
        let response = self
            .make_request(
                reqwest::Method::DELETE,
                &format!("/census/uploads/{upload_id}"),
            )?
            .send()
            .await?;
        expect_success(
            response,
            &format!("failed to delete census upload {upload_id}"),
        )
        .await
    }

    /// List votings, or only the voting with the given ID.
    pub async fn list_votings(&self, voting_id: Option<VotingId>) -> Result<Vec<Voting>> {
        let mut url = self.normalize_url("/voting/")?;
        if let Some(voting_id) = voting_id {
            url.query_pairs_mut()
                .append_pair("id", &voting_id.to_string());
        }
        let response = self.get(url.as_str()).await?;
        read_json(response, "failed to list votings").await
    }

    /// Create a voting. Requires a staff session.
    pub async fn create_voting(&self, voting: &NewVoting) -> Result<Voting> {
        let response = self.post_json("/voting/", voting).await?;
        read_json(
            response,
            &format!("failed to create voting {:?}", voting.name),
        )
        .await
    }

    /// Start, stop or tally a voting. Returns the server's message.
    pub async fn voting_action(&self, voting_id: VotingId, action: impl Display) -> Result<String> {
        let request = VotingActionRequest {
            action: action.to_string(),
        };
        let response = self
            .make_request(reqwest::Method::PUT, &format!("/voting/{voting_id}/"))?
            .json(&request)
            .send()
            .await?;
        read_json(
            response,
            &format!("failed to {} voting {voting_id}", request.action),
        )
        .await
    }

    pub async fn delete_voting(&self, voting_id: VotingId) -> Result<()> {
        let response = self
            .make_request(reqwest::Method::DELETE, &format!("/voting/{voting_id}/"))?
            .send()
            .await?;
        expect_success(response, &format!("failed to delete voting {voting_id}")).await
    }

    pub async fn list_questions(&self) -> Result<Vec<Question>> {
        let response = self.get("/voting/questions/").await?;
        read_json(response, "failed to list questions").await
    }

    pub async fn delete_question(&self, question_id: QuestionId) -> Result<()> {
        let response = self
            .make_request(
                reqwest::Method::DELETE,
                &format!("/voting/questions/{question_id}/"),
            )?
            .send()
            .await?;
        expect_success(
            response,
            &format!("failed to delete question {question_id}"),
        )
        .await
    }

    /// Store an encrypted vote for the user of the current session.
    pub async fn store_vote(&self, vote: &StoreVote) -> Result<Vote> {
        let response = self.post_json("/store/", vote).await?;
        read_json(
            response,
            &format!("failed to store vote in voting {}", vote.voting),
        )
        .await
    }

    /// List stored votes. Requires a staff session.
    pub async fn list_votes(&self, filter: &StoreFilter) -> Result<Vec<Vote>> {
        let mut url = self.normalize_url("/store/")?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(voting_id) = filter.voting_id {
                pairs.append_pair("voting_id", &voting_id.to_string());
            }
            if let Some(voter_id) = filter.voter_id {
                pairs.append_pair("voter_id", &voter_id.to_string());
            }
        }
        let response = self.get(url.as_str()).await?;
        read_json(response, "failed to list votes").await
    }

    /// Get the booth view of one question of a voting.
    pub async fn get_booth(
        &self,
        voting_id: VotingId,
        question_id: QuestionId,
    ) -> Result<Option<BoothContext>> {
        let response = self
            .get(&format!("/booth/{voting_id}/{question_id}/"))
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        read_json(
            response,
            &format!("failed to get booth for voting {voting_id} question {question_id}"),
        )
        .await
        .map(Some)
    }

    /// Get the results view of a voting.
    pub async fn get_visualizer(&self, voting_id: VotingId) -> Result<Option<VisualizerView>> {
        let response = self.get(&format!("/visualizer/{voting_id}/")).await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        read_json(
            response,
            &format!("failed to get visualizer for voting {voting_id}"),
        )
        .await
        .map(Some)
    }

    fn normalize_url(&self, path: &str) -> Result<reqwest::Url> {
        if path.starts_with(self.base_url.as_str()) {
            Ok(reqwest::Url::parse(path)?)
        } else {
            Ok(self.base_url.join(path)?)
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let request = self.make_request(reqwest::Method::GET, path)?;
        Ok(request.send().await?)
    }

    async fn post_json(&self, path: &str, body: &impl Serialize) -> Result<reqwest::Response> {
        let request = self.make_request(reqwest::Method::POST, path)?;
        Ok(request.json(body).send().await?)
    }

    fn make_request(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder> {
        let mut request = reqwest::Client::new().request(method, self.normalize_url(path)?);

        if let Some(ref bearer_token) = self.bearer_token {
            request = request.bearer_auth(bearer_token);
        }

        Ok(request)
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response, context: &str) -> Result<T> {
    let status_code = response.status();
    if !status_code.is_success() {
        return Err(Error::Http {
            status_code,
            text: response.text().await?,
            context: context.to_owned(),
        });
    }
    Ok(response.json().await?)
}

async fn expect_success(response: reqwest::Response, context: &str) -> Result<()> {
    let status_code = response.status();
    if !status_code.is_success() {
        return Err(Error::Http {
            status_code,
            text: response.text().await?,
            context: context.to_owned(),
        });
    }
    Ok(())
}
