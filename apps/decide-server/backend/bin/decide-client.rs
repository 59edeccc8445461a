use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::{bail, eyre};
use decide_client::Client;
use reqwest::Url;
use types_rs::{
    postproc::tally_summary,
    store::StoreVote,
    voting::{NewQuestion, NewQuestionOption, NewVoting, VotingAction},
    QuestionId, VoterId, VotingId,
};

#[derive(Parser)]
struct App {
    #[clap(flatten)]
    opts: GlobalOpts,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Parser)]
struct GlobalOpts {
    #[clap(long, env = "DECIDE_SERVER_URL", default_value = "http://localhost:8000")]
    decide_server_url: Url,

    /// Session token from `login`.
    #[clap(long, env = "DECIDE_TOKEN")]
    token: Option<String>,
}

impl GlobalOpts {
    fn client(&self) -> Client {
        let client = Client::new(self.decide_server_url.clone());
        match self.token {
            Some(ref token) => client.with_bearer_token(token),
            None => client,
        }
    }
}

#[derive(Parser)]
enum Command {
    /// Check that the server is up.
    Status,
    Login(LoginOpts),
    Logout,
    Whoami,
    CreateVoting(CreateVotingOpts),
    /// Start one or more votings.
    Start(VotingIdsOpts),
    /// Stop one or more votings.
    Stop(VotingIdsOpts),
    /// Tally one or more votings and print their results.
    Tally(VotingIdsOpts),
    CensusAdd(CensusAddOpts),
    CensusList(CensusListOpts),
    CensusUpload(CensusUploadOpts),
    Vote(VoteOpts),
    Results(ResultsOpts),
}

#[derive(Parser)]
struct LoginOpts {
    username: String,

    #[clap(long, env = "DECIDE_PASSWORD")]
    password: String,
}

#[derive(Parser)]
struct CreateVotingOpts {
    #[clap(long)]
    name: String,

    #[clap(long)]
    desc: String,

    #[clap(long)]
    question: String,

    /// An answer to the question. Repeat for each option.
    #[clap(long = "option", required = true)]
    options: Vec<String>,
}

#[derive(Parser)]
struct VotingIdsOpts {
    #[clap(required = true)]
    voting_ids: Vec<VotingId>,
}

#[derive(Parser)]
struct CensusAddOpts {
    voting_id: VotingId,

    #[clap(required = true)]
    voters: Vec<VoterId>,
}

#[derive(Parser)]
struct CensusListOpts {
    voting_id: VotingId,
}

#[derive(Parser)]
struct CensusUploadOpts {
    /// CSV file of `voting_id,voter_id` rows with a header line.
    path: PathBuf,
}

#[derive(Parser)]
struct VoteOpts {
    voting_id: VotingId,

    /// Number of the chosen option.
    option: u32,

    /// Question to answer. Defaults to the first question of the voting.
    #[clap(long)]
    question: Option<QuestionId>,
}

#[derive(Parser)]
struct ResultsOpts {
    voting_id: VotingId,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let _ = dotenvy::dotenv();

    let app = App::parse();

    match app.command {
        Command::Status => status(app.opts).await?,
        Command::Login(login_opts) => login(app.opts, login_opts).await?,
        Command::Logout => app.opts.client().logout().await?,
        Command::Whoami => {
            let user = app.opts.client().get_user().await?;
            println!("user: {user:#?}");
        }
        Command::CreateVoting(create_voting_opts) => {
            create_voting(app.opts, create_voting_opts).await?
        }
        Command::Start(ids) => bulk_action(app.opts, VotingAction::Start, ids).await?,
        Command::Stop(ids) => bulk_action(app.opts, VotingAction::Stop, ids).await?,
        Command::Tally(ids) => bulk_action(app.opts, VotingAction::Tally, ids).await?,
        Command::CensusAdd(CensusAddOpts { voting_id, voters }) => {
            let message = app.opts.client().create_census(voting_id, &voters).await?;
            println!("{message}");
        }
        Command::CensusList(CensusListOpts { voting_id }) => {
            let voters = app.opts.client().list_census(voting_id).await?;
            println!("voters: {voters:?}");
        }
        Command::CensusUpload(census_upload_opts) => {
            census_upload(app.opts, census_upload_opts).await?
        }
        Command::Vote(vote_opts) => vote(app.opts, vote_opts).await?,
        Command::Results(ResultsOpts { voting_id }) => {
            match app.opts.client().get_visualizer(voting_id).await? {
                Some(view) => println!("results: {view:#?}"),
                None => println!("no voting found with ID {voting_id}"),
            }
        }
    }

    Ok(())
}

async fn status(global_opts: GlobalOpts) -> color_eyre::Result<()> {
    global_opts.client().check_status().await?;
    println!("✅ {} is up", global_opts.decide_server_url);
    Ok(())
}

async fn login(global_opts: GlobalOpts, login_opts: LoginOpts) -> color_eyre::Result<()> {
    let mut client = global_opts.client();
    client
        .login(&login_opts.username, &login_opts.password)
        .await?;
    let token = client
        .bearer_token()
        .ok_or_else(|| eyre!("server did not return a token"))?;
    println!("DECIDE_TOKEN={token}");
    Ok(())
}

async fn create_voting(
    global_opts: GlobalOpts,
    create_voting_opts: CreateVotingOpts,
) -> color_eyre::Result<()> {
    let new_voting = NewVoting {
        name: create_voting_opts.name,
        desc: create_voting_opts.desc,
        question: vec![NewQuestion {
            desc: create_voting_opts.question,
            options: create_voting_opts
                .options
                .into_iter()
                .map(|option| NewQuestionOption {
                    number: None,
                    option,
                })
                .collect(),
        }],
        auths: vec![],
    };

    let voting = global_opts.client().create_voting(&new_voting).await?;
    println!("✅ Voting created! ID={id}", id = voting.id);
    Ok(())
}

/// Applies `action` to every voting, reporting each result. Failures do not
/// stop the remaining votings.
async fn bulk_action(
    global_opts: GlobalOpts,
    action: VotingAction,
    VotingIdsOpts { voting_ids }: VotingIdsOpts,
) -> color_eyre::Result<()> {
    let client = global_opts.client();
    let mut failed = 0;

    for voting_id in voting_ids {
        match client.voting_action(voting_id, action).await {
            Ok(message) => {
                println!("voting {voting_id}: {message}");
                if matches!(action, VotingAction::Tally) {
                    print_summary(&client, voting_id).await?;
                }
            }
            Err(e) => {
                failed += 1;
                eprintln!("voting {voting_id}: {e}");
            }
        }
    }

    if failed > 0 {
        bail!("{action} failed for {failed} voting(s)");
    }
    Ok(())
}

async fn print_summary(client: &Client, voting_id: VotingId) -> color_eyre::Result<()> {
    let postproc = client
        .list_votings(Some(voting_id))
        .await?
        .pop()
        .and_then(|voting| voting.postproc)
        .unwrap_or_default();
    println!("voting {voting_id}: {}", tally_summary(&postproc));
    Ok(())
}

async fn census_upload(
    global_opts: GlobalOpts,
    census_upload_opts: CensusUploadOpts,
) -> color_eyre::Result<()> {
    let contents = std::fs::read_to_string(&census_upload_opts.path)?;
    let file_name = census_upload_opts
        .path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("census.csv");

    let summary = global_opts
        .client()
        .upload_census_csv(file_name, contents)
        .await?;
    println!(
        "imported {} voters, skipped {} already in the census",
        summary.imported, summary.skipped
    );
    Ok(())
}

/// Encrypts the chosen option with the voting's public key and stores it as
/// the logged in user's vote.
async fn vote(global_opts: GlobalOpts, vote_opts: VoteOpts) -> color_eyre::Result<()> {
    let client = global_opts.client();
    let user = client.get_user().await?;

    let voting = client
        .list_votings(Some(vote_opts.voting_id))
        .await?
        .pop()
        .ok_or_else(|| eyre!("no voting found with ID {}", vote_opts.voting_id))?;
    let pub_key = voting
        .pub_key
        .as_ref()
        .ok_or_else(|| eyre!("voting {} has not been started", voting.id))?;

    let question = match vote_opts.question {
        Some(question_id) => voting.question(question_id),
        None => voting.questions.first(),
    }
    .ok_or_else(|| eyre!("voting {} has no such question", voting.id))?;

    if !question
        .options
        .iter()
        .any(|option| option.number == vote_opts.option)
    {
        bail!(
            "question {} has no option {}",
            question.id,
            vote_opts.option
        );
    }

    let store_vote = StoreVote {
        voting: voting.id,
        voter: user.id,
        question: Some(question.id),
        vote: pub_key.encrypt_u64(u64::from(vote_opts.option))?,
    };
    let stored = client.store_vote(&store_vote).await?;
    println!("✅ Vote stored! ID={id}", id = stored.id);
    Ok(())
}
