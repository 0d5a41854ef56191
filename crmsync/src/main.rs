//! `crmsync` — command-line client for CRM notifications, task chat and
//! task boards.
//!
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/crmsync/config.toml`). Logs go to a file so they never mix
//! with command output.
//!
//! ```bash
//! # Follow notifications
//! CRMSYNC_TOKEN=... CRMSYNC_USERNAME=alice cargo run --bin crmsync -- watch
//!
//! # Print a client's board, overdue tasks only
//! cargo run --bin crmsync -- board --client 3 --deadline overdue
//!
//! # Chat on a task; every stdin line is sent
//! cargo run --bin crmsync -- chat --task 42
//! ```

use std::io;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Local;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use crmsync::api::ApiError;
use crmsync::api::rest::RestClient;
use crmsync::board::{BoardError, BoardFilter, BoardReconciler, BoardView};
use crmsync::chat::{ChatError, ChatStream};
use crmsync::config::{CliArgs, ClientConfig, Command};
use crmsync::credentials::Credentials;
use crmsync::notifications::NotificationReconciler;
use crmsync::session::{ConnectionState, Session, SessionError};
use crmsync::transport::ws::WsConnector;
use crmsync_proto::comment::ChatMessage;
use crmsync_proto::task::{Task, TaskDraft, TaskStatus};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("not logged in: pass --token and --username or set them in the config file")]
    NoLogin,
    #[error("unknown column {0:?}, expected TODO, IN_PROGRESS or DONE")]
    UnknownColumn(String),
    #[error("task {0} is not on the board")]
    UnknownTask(i64),
    #[error("notification {0} is not in the feed or already dismissed")]
    UnknownNotification(i64),
    #[error("connection to the broker lost")]
    ConnectionLost,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Board(#[from] BoardError),
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error("background request failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let command = cli
        .command
        .clone()
        .unwrap_or(Command::Watch { mark_viewed: false });
    tracing::info!(?command, api = %config.api_url, ws = %config.ws_url, "crmsync starting");

    let result = run(command, &config).await;

    tracing::info!("crmsync exiting");
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("crmsync.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(command: Command, config: &ClientConfig) -> Result<(), CliError> {
    let credentials = match (&config.token, &config.username) {
        (Some(token), Some(username)) => Credentials::with_login(token, username),
        _ => return Err(CliError::NoLogin),
    };
    let rest = Arc::new(RestClient::new(
        &config.api_url,
        credentials.clone(),
        config.request_timeout,
    )?);

    match command {
        Command::Watch { mark_viewed } => watch(config, credentials, rest, mark_viewed).await,
        Command::Dismiss { id } => dismiss(config, &credentials, rest, id).await,
        Command::Board {
            client,
            search,
            contact,
            deadline,
        } => {
            let board = BoardReconciler::new(rest, client, config.reconcile_policy.build());
            board.refresh().await?;
            let filter = BoardFilter {
                search,
                contact_id: contact,
                deadline: deadline.map(Into::into),
            };
            print_board(&board.view(&filter, Local::now().date_naive()));
            Ok(())
        }
        Command::Move { client, task, to } => {
            let to = parse_column(&to)?;
            let board = BoardReconciler::new(rest, client, config.reconcile_policy.build());
            board.refresh().await?;
            let from = board
                .snapshot()
                .status_of(task)
                .ok_or(CliError::UnknownTask(task))?;
            board.move_task(task, from, to)?.await?;
            let now = board.snapshot().status_of(task).unwrap_or(to);
            println!("task {task}: {} -> {}", from.title(), now.title());
            Ok(())
        }
        Command::Create {
            client,
            column,
            description,
        } => {
            let status = parse_column(&column)?;
            let board = BoardReconciler::new(rest, client, config.reconcile_policy.build());
            let created = board
                .create_in_column(status, TaskDraft::new(client, description))
                .await?;
            println!("created task {} in {}", created.id, created.status.title());
            Ok(())
        }
        Command::Chat { task } => chat(config, credentials, rest.as_ref(), task).await,
    }
}

fn parse_column(column: &str) -> Result<TaskStatus, CliError> {
    TaskStatus::from_column_id(column).ok_or_else(|| CliError::UnknownColumn(column.to_string()))
}

fn connector(config: &ClientConfig) -> WsConnector {
    WsConnector::new(config.ws_url.clone())
        .with_timeouts(config.connect_timeout, config.handshake_timeout)
}

/// Print the feed on every push until Ctrl-C or the connection drops.
async fn watch(
    config: &ClientConfig,
    credentials: Credentials,
    rest: Arc<RestClient>,
    mark_viewed: bool,
) -> Result<(), CliError> {
    let username = credentials.username().ok_or(CliError::NoLogin)?;
    let feed = NotificationReconciler::new(rest, config.reconcile_policy.build());
    feed.load_initial(&username).await?;
    print_feed(&feed, mark_viewed).await;

    let session = Session::new(connector(config), credentials);
    let (pushed, mut pushes) = mpsc::unbounded_channel();
    let handler = feed.handler();
    session
        .connect(move |notification| {
            handler(notification);
            let _ = pushed.send(());
        })
        .await?;
    let mut state = session.watch_state();

    let outcome = loop {
        tokio::select! {
            Some(()) = pushes.recv() => print_feed(&feed, mark_viewed).await,
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == ConnectionState::Disconnected {
                    break Err(CliError::ConnectionLost);
                }
            }
            _ = tokio::signal::ctrl_c() => break Ok(()),
        }
    };
    session.disconnect().await;
    outcome
}

async fn print_feed(feed: &NotificationReconciler<RestClient>, mark_viewed: bool) {
    println!("--- {} unseen ---", feed.badge_count());
    for item in feed.visible() {
        let when = item.sent_at.as_deref().unwrap_or("-");
        println!("[{}] #{} {} ({when})", item.state, item.id, item.text);
    }
    if mark_viewed {
        for confirmation in feed.mark_all_unseen_as_viewed() {
            if let Err(e) = confirmation.await {
                tracing::warn!(error = %e, "viewed confirmation task failed");
            }
        }
    }
}

async fn dismiss(
    config: &ClientConfig,
    credentials: &Credentials,
    rest: Arc<RestClient>,
    id: i64,
) -> Result<(), CliError> {
    let username = credentials.username().ok_or(CliError::NoLogin)?;
    let feed = NotificationReconciler::new(rest, config.reconcile_policy.build());
    feed.load_initial(&username).await?;
    feed.dismiss(id)
        .ok_or(CliError::UnknownNotification(id))?
        .await?;
    println!("dismissed notification {id}");
    Ok(())
}

fn print_board(view: &BoardView) {
    let today = Local::now().date_naive();
    for status in TaskStatus::ALL {
        let column = view.column(status);
        println!("== {} ({}) ==", status.title(), column.len());
        for task in column {
            println!("  {}", describe_task(task, today));
        }
    }
}

fn describe_task(task: &Task, today: chrono::NaiveDate) -> String {
    let mut line = format!("#{} {}", task.id, task.description);
    if let Some(due) = task.due_date {
        let overdue = if task.is_overdue(today) { ", overdue" } else { "" };
        line.push_str(&format!("  (due {due}{overdue})"));
    }
    if let Some(contact) = &task.contact {
        line.push_str(&format!("  @ {}", contact.full_name()));
    }
    line
}

/// Follow a task's chat and send every stdin line until EOF or Ctrl-C.
async fn chat(
    config: &ClientConfig,
    credentials: Credentials,
    rest: &RestClient,
    task_id: i64,
) -> Result<(), CliError> {
    let session = Session::new(connector(config), credentials);
    session.connect(|_| {}).await?;

    let stream = ChatStream::open(&session, rest, task_id, config.chat_dedup).await?;
    let mut printed = print_messages(&stream.messages(), 0);
    let mut changes = stream.changes();
    let mut state = session.watch_state();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let outcome = loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                printed = print_messages(&stream.messages(), printed);
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match stream.send(&line).await {
                    Ok(_) | Err(ChatError::EmptyContent) => {}
                    Err(e) => eprintln!("not sent: {e}"),
                },
                Ok(None) => break Ok(()),
                Err(e) => break Err(CliError::Io(e)),
            },
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == ConnectionState::Disconnected {
                    break Err(CliError::ConnectionLost);
                }
            }
            _ = tokio::signal::ctrl_c() => break Ok(()),
        }
    };
    stream.close();
    session.disconnect().await;
    outcome
}

/// Print messages from index `from` on; returns the new printed count.
fn print_messages(messages: &[ChatMessage], from: usize) -> usize {
    for message in messages.iter().skip(from) {
        println!(
            "[{}] {}: {}",
            message.sent_at.format("%Y-%m-%d %H:%M"),
            message.username,
            message.content
        );
    }
    messages.len().max(from)
}
