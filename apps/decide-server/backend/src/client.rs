//! End-to-end tests driving the application through `decide-client`.

#[cfg(test)]
mod tests {
    use decide_client::{Client, Error};
    use mixcrypt::BigInt;
    use pretty_assertions::assert_eq;
    use reqwest::StatusCode;
    use sqlx::PgPool;
    use types_rs::{
        auth::{NewUser, User},
        postproc::tally_summary,
        store::{StoreFilter, StoreVote},
        voting::{NewQuestion, NewQuestionOption, NewVoting, Voting, VotingStatus},
    };

    use crate::{app, config::Settings, db, password};

    const PASSWORD: &str = "decide-password";

    async fn setup(pool: PgPool) -> color_eyre::Result<Client> {
        let listener = tokio::net::TcpListener::bind("0.0.0.0:0").await?;
        let addr = listener.local_addr()?;

        tokio::spawn(async move {
            let settings = Settings {
                keybits: 64,
                ..Settings::default()
            };
            let app = app::setup(pool, settings).await;
            axum::serve(listener, app).await.unwrap();
        });

        Ok(Client::new(format!("http://{addr}").parse()?))
    }

    async fn create_user(
        pool: &PgPool,
        username: &str,
        is_staff: bool,
        is_superuser: bool,
    ) -> color_eyre::Result<User> {
        let mut conn = pool.acquire().await?;
        let new_user = NewUser {
            username: username.to_owned(),
            password: PASSWORD.to_owned(),
            email: format!("{username}@example.com"),
            first_name: String::new(),
            last_name: String::new(),
            is_staff,
            is_superuser,
        };
        let hash = password::hash_password(PASSWORD)?;
        Ok(db::create_user(&mut conn, &new_user, &hash).await?)
    }

    async fn logged_in(client: &Client, username: &str) -> color_eyre::Result<Client> {
        let mut client = client.clone();
        client.login(username, PASSWORD).await?;
        Ok(client)
    }

    /// The status code and JSON string message of a failed request.
    fn http_error(error: &Error) -> (StatusCode, String) {
        match error {
            Error::Http {
                status_code, text, ..
            } => (
                *status_code,
                serde_json::from_str(text).unwrap_or_else(|_| text.clone()),
            ),
            other => panic!("expected an HTTP error, got {other:?}"),
        }
    }

    fn new_voting(name: &str) -> NewVoting {
        NewVoting {
            name: name.to_owned(),
            desc: "Elige tu opción favorita.".to_owned(),
            question: vec![NewQuestion {
                desc: format!("{name}: elige tu voto"),
                options: ["A", "B", "C"]
                    .into_iter()
                    .map(|option| NewQuestionOption {
                        number: None,
                        option: option.to_owned(),
                    })
                    .collect(),
            }],
            auths: vec![],
        }
    }

    fn ballot(voting: &Voting, voter: i32, number: u64) -> StoreVote {
        let pub_key = voting.pub_key.as_ref().unwrap();
        StoreVote {
            voting: voting.id,
            voter,
            question: Some(voting.questions[0].id),
            vote: pub_key.encrypt_u64(number).unwrap(),
        }
    }

    async fn fetch_voting(client: &Client, voting_id: i32) -> color_eyre::Result<Voting> {
        Ok(client.list_votings(Some(voting_id)).await?.pop().unwrap())
    }

    #[sqlx::test(migrations = "db/migrations")]
    async fn test_login_and_logout(pool: sqlx::PgPool) -> color_eyre::Result<()> {
        let user = create_user(&pool, "voter1", false, false).await?;
        let client = setup(pool).await?;
        client.check_status().await?;

        let mut anonymous = client.clone();
        assert!(matches!(
            anonymous.login("voter1", "wrong").await,
            Err(Error::Authentication(_))
        ));
        assert_eq!(
            http_error(&client.get_user().await.unwrap_err()).0,
            StatusCode::UNAUTHORIZED
        );

        let mut voter = logged_in(&client, "voter1").await?;
        assert_eq!(voter.get_user().await?, user);

        // the email address works as a username too
        let by_email = logged_in(&client, "voter1@example.com").await?;
        assert_eq!(by_email.get_user().await?.id, user.id);

        let token = voter.bearer_token().unwrap().to_owned();
        voter.logout().await?;
        let stale = client.clone().with_bearer_token(token);
        assert_eq!(
            http_error(&stale.get_user().await.unwrap_err()).0,
            StatusCode::UNAUTHORIZED
        );

        Ok(())
    }

    #[sqlx::test(migrations = "db/migrations")]
    async fn test_register(pool: sqlx::PgPool) -> color_eyre::Result<()> {
        create_user(&pool, "admin", true, false).await?;
        create_user(&pool, "voter1", false, false).await?;
        let client = setup(pool).await?;
        let admin = logged_in(&client, "admin").await?;
        let voter = logged_in(&client, "voter1").await?;

        let new_user = NewUser {
            username: "voter2".to_owned(),
            password: "secret".to_owned(),
            email: String::new(),
            first_name: "Ana".to_owned(),
            last_name: String::new(),
            is_staff: false,
            is_superuser: false,
        };

        assert_eq!(
            http_error(&client.register(&new_user).await.unwrap_err()).0,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            http_error(&voter.register(&new_user).await.unwrap_err()).0,
            StatusCode::FORBIDDEN
        );

        let user = admin.register(&new_user).await?;
        assert_eq!(user.username, "voter2");
        assert_eq!(user.first_name, "Ana");
        assert!(!user.is_staff);

        assert_eq!(
            http_error(&admin.register(&new_user).await.unwrap_err()).0,
            StatusCode::CONFLICT
        );

        let mut voter2 = client.clone();
        voter2.login("voter2", "secret").await?;
        assert_eq!(voter2.get_user().await?.id, user.id);

        Ok(())
    }

    #[sqlx::test(migrations = "db/migrations")]
    async fn test_census(pool: sqlx::PgPool) -> color_eyre::Result<()> {
        create_user(&pool, "admin", true, false).await?;
        create_user(&pool, "voter1", false, false).await?;
        let client = setup(pool).await?;
        let admin = logged_in(&client, "admin").await?;
        let voter = logged_in(&client, "voter1").await?;

        assert_eq!(
            http_error(&voter.create_census(1, &[1]).await.unwrap_err()).0,
            StatusCode::FORBIDDEN
        );

        assert_eq!(admin.create_census(1, &[3, 1, 2]).await?, "Census created");
        assert_eq!(
            http_error(&admin.create_census(1, &[4, 2]).await.unwrap_err()),
            (StatusCode::CONFLICT, "Error try to create census".to_owned())
        );
        assert_eq!(admin.list_census(1).await?, vec![1, 2, 3]);

        assert!(client.check_census(1, 2).await?);
        assert!(!client.check_census(1, 4).await?);
        assert!(!client.check_census(2, 2).await?);

        client.delete_census(1, &[2, 3]).await?;
        assert_eq!(admin.list_census(1).await?, vec![1]);

        Ok(())
    }

    #[sqlx::test(migrations = "db/migrations")]
    async fn test_census_upload(pool: sqlx::PgPool) -> color_eyre::Result<()> {
        create_user(&pool, "admin", true, false).await?;
        let client = setup(pool).await?;
        let admin = logged_in(&client, "admin").await?;

        admin.create_census(5, &[1]).await?;
        let summary = admin
            .upload_census_csv("census.csv", "voting_id,voter_id\n5,1\n5,2\n6,2\n")
            .await?;
        assert_eq!((summary.imported, summary.skipped), (2, 1));
        assert_eq!(admin.list_census(5).await?, vec![1, 2]);
        assert_eq!(admin.list_census(6).await?, vec![2]);

        assert_eq!(
            http_error(&admin.upload_census_csv("empty.csv", "").await.unwrap_err()),
            (
                StatusCode::BAD_REQUEST,
                "The submitted file is empty.".to_owned()
            )
        );
        assert_eq!(
            http_error(
                &admin
                    .upload_census_csv("bad.csv", "voting_id,voter_id\n7,1\nnope\n")
                    .await
                    .unwrap_err()
            )
            .0,
            StatusCode::BAD_REQUEST
        );
        assert!(admin.list_census(7).await?.is_empty());

        let uploads = admin.list_census_uploads().await?;
        assert_eq!(
            uploads
                .iter()
                .map(|upload| (upload.file_name.as_str(), upload.activated))
                .collect::<Vec<_>>(),
            vec![("census.csv", true), ("empty.csv", false), ("bad.csv", false)]
        );

        admin.delete_census_upload(uploads[1].id).await?;
        assert_eq!(admin.list_census_uploads().await?.len(), 2);
        assert_eq!(
            http_error(
                &admin
                    .delete_census_upload(uploads[1].id)
                    .await
                    .unwrap_err()
            )
            .0,
            StatusCode::NOT_FOUND
        );

        Ok(())
    }

    #[sqlx::test(migrations = "db/migrations")]
    async fn test_create_voting(pool: sqlx::PgPool) -> color_eyre::Result<()> {
        create_user(&pool, "admin", true, false).await?;
        create_user(&pool, "voter1", false, false).await?;
        let client = setup(pool).await?;
        let admin = logged_in(&client, "admin").await?;
        let voter = logged_in(&client, "voter1").await?;

        assert_eq!(
            http_error(&voter.create_voting(&new_voting("v1")).await.unwrap_err()).0,
            StatusCode::FORBIDDEN
        );

        let voting = admin.create_voting(&new_voting("v1")).await?;
        assert_eq!(voting.name, "v1");
        assert_eq!(voting.status(), VotingStatus::NotStarted);
        assert_eq!(
            voting.questions[0]
                .options
                .iter()
                .map(|option| option.number)
                .collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        assert_eq!(voting.auths.len(), 1);
        assert!(voting.auths[0].me);
        assert_eq!(voting.auths[0].url, "http://localhost:8000");

        let mut invalid = new_voting("v2");
        invalid.question[0].options.truncate(1);
        assert_eq!(
            http_error(&admin.create_voting(&invalid).await.unwrap_err()).0,
            StatusCode::BAD_REQUEST
        );

        let mut duplicate = new_voting("v1");
        duplicate.question[0].desc = "another question".to_owned();
        assert_eq!(
            http_error(&admin.create_voting(&duplicate).await.unwrap_err()).0,
            StatusCode::CONFLICT
        );

        assert_eq!(client.list_votings(None).await?.len(), 1);
        assert_eq!(client.list_votings(Some(voting.id)).await?, vec![voting.clone()]);
        assert!(client.list_votings(Some(voting.id + 1)).await?.is_empty());

        assert_eq!(admin.list_questions().await?, voting.questions);

        Ok(())
    }

    #[sqlx::test(migrations = "db/migrations")]
    async fn test_voting_actions(pool: sqlx::PgPool) -> color_eyre::Result<()> {
        create_user(&pool, "admin", true, false).await?;
        create_user(&pool, "voter1", false, false).await?;
        let client = setup(pool).await?;
        let admin = logged_in(&client, "admin").await?;
        let voter = logged_in(&client, "voter1").await?;
        let voting = admin.create_voting(&new_voting("actions")).await?;

        assert_eq!(
            http_error(&client.voting_action(voting.id, "start").await.unwrap_err()).0,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            http_error(&voter.voting_action(voting.id, "start").await.unwrap_err()).0,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            http_error(&admin.voting_action(voting.id + 1, "start").await.unwrap_err()).0,
            StatusCode::NOT_FOUND
        );

        let steps = [
            ("bogus", Err("Action not found, try with start, stop or tally")),
            ("stop", Err("Voting is not started")),
            ("tally", Err("Voting is not started")),
            ("start", Ok("Voting started")),
            ("start", Err("Voting already started")),
            ("tally", Err("Voting is not stopped")),
            ("stop", Ok("Voting stopped")),
            ("stop", Err("Voting already stopped")),
            ("start", Err("Voting already started")),
        ];

        for (action, expected) in steps {
            let result = admin.voting_action(voting.id, action).await;
            match expected {
                Ok(message) => assert_eq!(result?, message, "{action}"),
                Err(message) => assert_eq!(
                    http_error(&result.unwrap_err()),
                    (StatusCode::BAD_REQUEST, message.to_owned()),
                    "{action}"
                ),
            }
        }

        let stopped = fetch_voting(&client, voting.id).await?;
        assert_eq!(stopped.status(), VotingStatus::Stopped);
        assert!(stopped.pub_key.is_some());

        Ok(())
    }

    #[sqlx::test(migrations = "db/migrations")]
    async fn test_vote_and_tally(pool: sqlx::PgPool) -> color_eyre::Result<()> {
        let root = create_user(&pool, "root", true, true).await?;
        let voter1 = create_user(&pool, "voter1", false, false).await?;
        let voter2 = create_user(&pool, "voter2", false, false).await?;
        let voter3 = create_user(&pool, "voter3", false, false).await?;
        let client = setup(pool).await?;
        let admin = logged_in(&client, "root").await?;

        let voting = admin.create_voting(&new_voting("tally")).await?;
        admin
            .create_census(voting.id, &[voter1.id, voter2.id, voter3.id])
            .await?;
        admin.voting_action(voting.id, "start").await?;

        let voting = fetch_voting(&client, voting.id).await?;
        assert_eq!(voting.status(), VotingStatus::Started);
        // superusers join the census when the voting starts
        assert!(client.check_census(voting.id, root.id).await?);
        assert_eq!(voting.census_total, 4);

        let booth = client
            .get_booth(voting.id, voting.questions[0].id)
            .await?
            .unwrap();
        assert_eq!(booth.keybits, 64);
        assert!(booth.last_question);
        assert_eq!(booth.voting.pub_key, voting.pub_key);

        for (username, user, number) in [
            ("voter1", &voter1, 2),
            ("voter2", &voter2, 3),
            ("voter3", &voter3, 3),
        ] {
            let voter = logged_in(&client, username).await?;
            voter.store_vote(&ballot(&voting, user.id, number)).await?;
        }
        // voting again replaces the earlier vote
        let voter1_client = logged_in(&client, "voter1").await?;
        voter1_client
            .store_vote(&ballot(&voting, voter1.id, 3))
            .await?;
        // a vote without a question replaces the vote for the first question
        let voter2_client = logged_in(&client, "voter2").await?;
        let mut without_question = ballot(&voting, voter2.id, 3);
        without_question.question = None;
        let stored = voter2_client.store_vote(&without_question).await?;
        assert_eq!(stored.question_id, Some(voting.questions[0].id));
        admin.store_vote(&ballot(&voting, root.id, 4)).await?;

        let votes = admin
            .list_votes(&StoreFilter {
                voting_id: Some(voting.id),
                voter_id: None,
            })
            .await?;
        assert_eq!(votes.len(), 4);

        let results = client.get_visualizer(voting.id).await?.unwrap();
        assert_eq!(results.status, VotingStatus::Started);
        assert_eq!(results.results, None);

        admin.voting_action(voting.id, "stop").await?;
        assert_eq!(
            admin.voting_action(voting.id, "tally").await?,
            "Voting tallied"
        );
        assert_eq!(
            http_error(&admin.voting_action(voting.id, "tally").await.unwrap_err()),
            (
                StatusCode::BAD_REQUEST,
                "Voting already tallied".to_owned()
            )
        );

        let tallied = fetch_voting(&client, voting.id).await?;
        assert_eq!(tallied.status(), VotingStatus::Tallied);
        assert_eq!(tallied.total_votes, Some(4));
        let mut decrypted = tallied.tally.as_ref().unwrap()[0].votes.clone();
        decrypted.sort_unstable();
        assert_eq!(decrypted, vec![3, 3, 3, 4]);
        assert_eq!(
            tally_summary(tallied.postproc.as_ref().unwrap()),
            "The options that have received votes are the following: \
             for option: B there has been 3 votes \
             for option: C there has been 1 votes "
        );

        let results = client.get_visualizer(voting.id).await?.unwrap();
        let counts: Vec<(String, u64)> = results
            .results
            .unwrap()
            .into_iter()
            .map(|option| (option.option, option.votes))
            .collect();
        assert_eq!(
            counts,
            vec![
                ("B".to_owned(), 3),
                ("C".to_owned(), 1),
                ("A".to_owned(), 0)
            ]
        );

        Ok(())
    }

    #[sqlx::test(migrations = "db/migrations")]
    async fn test_store_rules(pool: sqlx::PgPool) -> color_eyre::Result<()> {
        create_user(&pool, "admin", true, false).await?;
        let voter1 = create_user(&pool, "voter1", false, false).await?;
        let voter2 = create_user(&pool, "voter2", false, false).await?;
        let client = setup(pool).await?;
        let admin = logged_in(&client, "admin").await?;
        let voter = logged_in(&client, "voter1").await?;

        let voting = admin.create_voting(&new_voting("store")).await?;
        let other = admin.create_voting(&new_voting("other")).await?;
        admin.create_census(voting.id, &[voter1.id]).await?;
        admin.voting_action(voting.id, "start").await?;
        let voting = fetch_voting(&client, voting.id).await?;

        let unauthorized = |result: decide_client::Result<_>| {
            assert_eq!(
                http_error(&result.map(|_| ()).unwrap_err()).0,
                StatusCode::UNAUTHORIZED
            );
        };

        // no session
        unauthorized(client.store_vote(&ballot(&voting, voter1.id, 2)).await);

        // voting that was never started
        let mut not_open = ballot(&voting, voter1.id, 2);
        not_open.voting = other.id;
        not_open.question = None;
        unauthorized(voter.store_vote(&not_open).await);

        // voting as someone else
        unauthorized(voter.store_vote(&ballot(&voting, voter2.id, 2)).await);

        // not in the census
        let voter2_client = logged_in(&client, "voter2").await?;
        unauthorized(
            voter2_client
                .store_vote(&ballot(&voting, voter2.id, 2))
                .await,
        );

        // ciphertext outside the voting's group
        let mut forged = ballot(&voting, voter1.id, 2);
        forged.vote.a = BigInt::from_u64(0)?;
        assert_eq!(
            http_error(&voter.store_vote(&forged).await.unwrap_err()),
            (StatusCode::BAD_REQUEST, "Invalid vote".to_owned())
        );

        // a question from another voting is stored as given and left out of
        // the tally
        let mut other_question = ballot(&voting, voter1.id, 2);
        other_question.question = Some(other.questions[0].id);
        let stored = voter.store_vote(&other_question).await?;
        assert_eq!(stored.question_id, Some(other.questions[0].id));

        let stored = voter.store_vote(&ballot(&voting, voter1.id, 2)).await?;
        assert_eq!(stored.voter_id, voter1.id);
        assert_eq!(stored.question_id, Some(voting.questions[0].id));

        assert_eq!(
            http_error(
                &voter
                    .list_votes(&StoreFilter::default())
                    .await
                    .unwrap_err()
            )
            .0,
            StatusCode::FORBIDDEN
        );

        admin.voting_action(voting.id, "stop").await?;
        unauthorized(voter.store_vote(&ballot(&voting, voter1.id, 3)).await);

        Ok(())
    }

    #[sqlx::test(migrations = "db/migrations")]
    async fn test_delete_voting_and_questions(pool: sqlx::PgPool) -> color_eyre::Result<()> {
        create_user(&pool, "admin", true, false).await?;
        let client = setup(pool).await?;
        let admin = logged_in(&client, "admin").await?;

        let started = admin.create_voting(&new_voting("started")).await?;
        let idle = admin.create_voting(&new_voting("idle")).await?;
        admin.voting_action(started.id, "start").await?;

        assert_eq!(
            http_error(
                &admin
                    .delete_question(started.questions[0].id)
                    .await
                    .unwrap_err()
            ),
            (
                StatusCode::CONFLICT,
                "This question cannot be deleted because it is part of a started voting"
                    .to_owned()
            )
        );
        // no key to encrypt with before the voting starts
        assert_eq!(
            client.get_booth(idle.id, idle.questions[0].id).await?,
            None
        );
        admin.delete_question(idle.questions[0].id).await?;
        assert_eq!(admin.list_questions().await?, started.questions);

        assert_eq!(
            client.get_booth(idle.id, idle.questions[0].id).await?,
            None
        );
        assert_eq!(client.get_booth(started.id, 12345).await?, None);

        admin.delete_voting(idle.id).await?;
        assert_eq!(client.get_visualizer(idle.id).await?, None);
        assert_eq!(
            http_error(&admin.delete_voting(idle.id).await.unwrap_err()).0,
            StatusCode::NOT_FOUND
        );

        Ok(())
    }
}
