use std::sync::Arc;

use council::command::{HELP, OpenTarget, ShellCommand};
use council::render::{
    ProgressTracker, render_assistant, render_conversation_list, render_transcript,
};
use council::settings::SettingsStore;
use council_chat::{ChatController, ChatError, TurnOutcome};
use council_client::{ClientError, HttpCouncilBackend};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, Snafu)]
enum AppError {
    #[snafu(display("failed to set up the council client on `{stage}`: {source}"))]
    BuildBackend {
        stage: &'static str,
        source: ClientError,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

type AppResult<T> = Result<T, AppError>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        eprintln!("council: {error}");
        std::process::exit(1);
    }
}

async fn run() -> AppResult<()> {
    let settings_store = SettingsStore::load();
    let settings = settings_store.settings();
    tracing::info!(
        path = %settings_store.config_path().display(),
        base_url = %settings.base_url,
        "settings loaded"
    );

    let backend = HttpCouncilBackend::new(settings.to_client_config()).context(BuildBackendSnafu {
        stage: "build-http-backend",
    })?;
    let controller = Arc::new(ChatController::new(Arc::new(backend)));
    spawn_progress_printer(&controller);

    if controller.refresh_conversations().await.is_ok() {
        print_conversations(&controller);
    }
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context(ReadInputSnafu {
        stage: "read-stdin-line",
    })? {
        let command = match ShellCommand::parse(&line) {
            Ok(command) => command,
            Err(error) => {
                println!("{error}");
                continue;
            }
        };

        match command {
            ShellCommand::Empty => {}
            ShellCommand::Help => println!("{HELP}"),
            ShellCommand::Quit => break,
            ShellCommand::List => {
                if controller.refresh_conversations().await.is_ok() {
                    print_conversations(&controller);
                } else {
                    println!("could not reach the council; showing the last known list");
                    print_conversations(&controller);
                }
            }
            ShellCommand::New => match controller.create_conversation().await {
                Ok(conversation_id) => println!("opened new conversation {conversation_id}"),
                Err(error) => println!("{error}"),
            },
            ShellCommand::Open(target) => open_conversation(&controller, &target).await,
            ShellCommand::Server(None) => {
                println!("council server: {}", settings_store.settings().base_url)
            }
            ShellCommand::Server(Some(raw)) => match settings_store.set_base_url(&raw) {
                Ok(saved) => println!(
                    "saved {} to {}; it takes effect on the next start",
                    saved.base_url,
                    settings_store.config_path().display()
                ),
                Err(error) => println!("{error}"),
            },
            ShellCommand::Send(content) => submit(&controller, content).await,
        }
    }

    tracing::info!("shell closed");
    Ok(())
}

fn print_conversations(controller: &ChatController) {
    let view = controller.state();
    println!(
        "{}",
        render_conversation_list(&view.conversations, view.active_conversation_id.as_ref())
    );
}

async fn open_conversation(controller: &ChatController, target: &OpenTarget) {
    let Some(conversation_id) = target.resolve(&controller.state().conversations) else {
        println!("no such conversation; /list shows what is available");
        return;
    };
    if let Err(error) = controller.select_conversation(conversation_id).await {
        println!("{error}");
        return;
    }
    if let Some(conversation) = controller.state().transcript {
        println!("{}", render_transcript(&conversation));
    }
}

async fn submit(controller: &Arc<ChatController>, content: String) {
    if controller.state().busy {
        println!("the council is still answering; wait for it to finish");
        return;
    }
    if controller.state().active_conversation_id.is_none()
        && let Err(error) = controller.create_conversation().await
    {
        println!("{error}");
        return;
    }

    let controller = Arc::clone(controller);
    tokio::spawn(async move {
        match controller.send_message(&content).await {
            Ok(TurnOutcome::Completed) => {
                let answer = controller
                    .state()
                    .transcript
                    .and_then(|conversation| conversation.messages.last().cloned());
                if let Some(assistant) = answer.as_ref().and_then(|message| message.as_assistant()) {
                    println!("{}", render_assistant(assistant));
                }
            }
            Ok(TurnOutcome::Superseded) => {
                println!("(switched conversations; the earlier answer keeps going on the server)")
            }
            Ok(TurnOutcome::Skipped) => println!("nothing sent"),
            // The progress printer already shows the notice.
            Err(ChatError::StreamError { .. } | ChatError::StreamOpenFailed { .. }) => {}
            Err(error) => println!("{error}"),
        }
    });
}

fn spawn_progress_printer(controller: &ChatController) {
    let mut view_rx = controller.subscribe();
    tokio::spawn(async move {
        let mut tracker = ProgressTracker::new();
        while view_rx.changed().await.is_ok() {
            let lines = tracker.observe(&view_rx.borrow_and_update());
            for line in lines {
                println!("{line}");
            }
        }
    });
}
