use std::fmt;

use chrono::{DateTime, Duration, Utc};
use assess_core::model::{QuestionId, SessionId, SessionMode};
use storage::sqlite::SqliteStore;
use storage::store::GradingKey;

#[derive(Debug, Clone)]
struct Args {
    db_url: String,
    session_id: SessionId,
    mode: SessionMode,
    questions: u32,
    deadline_minutes: Option<i64>,
    now: Option<DateTime<Utc>>,
}

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    UnknownArg(String),
    InvalidSessionId { raw: String },
    InvalidMode { raw: String },
    InvalidQuestions { raw: String },
    InvalidDeadline { raw: String },
    InvalidNow { raw: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidSessionId { raw } => write!(f, "invalid --session-id value: {raw}"),
            ArgsError::InvalidMode { raw } => {
                write!(f, "invalid --mode value (daily|practice|contest): {raw}")
            }
            ArgsError::InvalidQuestions { raw } => write!(f, "invalid --questions value: {raw}"),
            ArgsError::InvalidDeadline { raw } => {
                write!(f, "invalid --deadline-minutes value: {raw}")
            }
            ArgsError::InvalidNow { raw } => {
                write!(f, "invalid --now value (expected RFC3339): {raw}")
            }
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn parse_mode(raw: &str) -> Result<SessionMode, ArgsError> {
    match raw {
        "daily" => Ok(SessionMode::Daily),
        "practice" => Ok(SessionMode::Practice),
        "contest" => Ok(SessionMode::Contest),
        _ => Err(ArgsError::InvalidMode { raw: raw.into() }),
    }
}

impl Args {
    fn parse() -> Result<Self, ArgsError> {
        let mut db_url =
            std::env::var("ASSESS_DB_URL").unwrap_or_else(|_| "sqlite:dev.sqlite3".into());
        let mut session_id = std::env::var("ASSESS_SESSION_ID")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .map_or_else(|| SessionId::new(1), SessionId::new);
        let mut mode = SessionMode::Contest;
        let mut questions = 5_u32;
        let mut deadline_minutes = Some(30_i64);
        let mut now: Option<DateTime<Utc>> = None;

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    db_url = require_value(&mut args, "--db")?;
                }
                "--session-id" => {
                    let value = require_value(&mut args, "--session-id")?;
                    let parsed: u64 = value
                        .parse()
                        .map_err(|_| ArgsError::InvalidSessionId { raw: value.clone() })?;
                    session_id = SessionId::new(parsed);
                }
                "--mode" => {
                    let value = require_value(&mut args, "--mode")?;
                    mode = parse_mode(&value)?;
                    if !mode.is_timed() {
                        deadline_minutes = None;
                    }
                }
                "--questions" => {
                    let value = require_value(&mut args, "--questions")?;
                    questions = value
                        .parse::<u32>()
                        .map_err(|_| ArgsError::InvalidQuestions { raw: value.clone() })?;
                }
                "--deadline-minutes" => {
                    let value = require_value(&mut args, "--deadline-minutes")?;
                    let parsed = value
                        .parse::<i64>()
                        .map_err(|_| ArgsError::InvalidDeadline { raw: value.clone() })?;
                    deadline_minutes = Some(parsed);
                }
                "--now" => {
                    let value = require_value(&mut args, "--now")?;
                    let parsed = DateTime::parse_from_rfc3339(&value)
                        .map_err(|_| ArgsError::InvalidNow { raw: value.clone() })?
                        .with_timezone(&Utc);
                    now = Some(parsed);
                }
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        Ok(Self {
            db_url,
            session_id,
            mode,
            questions,
            deadline_minutes,
            now,
        })
    }
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p storage --bin seed -- [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --db <sqlite_url>         SQLite URL (default: sqlite:dev.sqlite3)");
    eprintln!("  --session-id <id>         Session id to create (default: 1)");
    eprintln!("  --mode <m>                daily | practice | contest (default: contest)");
    eprintln!("  --questions <n>           Number of sample questions (default: 5)");
    eprintln!("  --deadline-minutes <n>    Deadline offset from now (default: 30)");
    eprintln!("  --now <rfc3339>           Fixed current time for deterministic seeding");
    eprintln!("  -h, --help                Show this help");
    eprintln!();
    eprintln!("Environment (same as flags):");
    eprintln!("  ASSESS_DB_URL, ASSESS_SESSION_ID");
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse().map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    let store = SqliteStore::connect(&args.db_url).await?;
    store.migrate().await?;

    let now = args.now.unwrap_or_else(Utc::now);
    let deadline_at = args
        .deadline_minutes
        .map(|minutes| now + Duration::minutes(minutes));

    let keys: Vec<GradingKey> = (1..=u64::from(args.questions))
        .map(|id| GradingKey {
            question_id: QuestionId::new(id),
            correct_answer: format!("answer {id}"),
            points: 5,
            explanation: Some(format!("The expected answer is \"answer {id}\".")),
            auto_gradable: true,
        })
        .collect();

    store
        .create_session(args.session_id, args.mode, deadline_at, &keys)
        .await?;

    println!(
        "seeded session {} ({} questions, deadline {:?}) into {}",
        args.session_id.value(),
        args.questions,
        deadline_at,
        args.db_url
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("seed failed: {e}");
        std::process::exit(1);
    }
}
