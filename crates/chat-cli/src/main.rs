use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chat_core::{ChatId, Config};
use chat_llm::OllamaTransport;
use chat_session::{spawn_session, SessionEvent, SessionHandle, SessionOptions};
use chat_store::{ChatStore, SqliteChatStore};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "ollama-chat")]
#[command(about = "Chat with models served by a local Ollama instance")]
#[command(version)]
struct Cli {
    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(long)]
    port: Option<u16>,

    /// Model that answers prompts
    #[arg(long, short)]
    model: Option<String>,

    /// Partner model that answers every reply automatically
    #[arg(long)]
    auto_answer: Option<String>,

    /// Chat database file
    #[arg(long)]
    db: Option<PathBuf>,

    /// Enable debug mode
    #[arg(long, short, default_value = "false")]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start interactive chat
    Chat {
        /// Continue an existing chat
        #[arg(long)]
        chat: Option<i64>,
    },
    /// Send a single prompt and print the reply
    Send {
        /// Prompt text
        prompt: String,

        /// Continue an existing chat
        #[arg(long)]
        chat: Option<i64>,

        /// Replies to wait for when auto-answer is on
        #[arg(long, default_value = "1")]
        turns: usize,
    },
    /// List models available on the server
    Models,
    /// List saved chats
    Chats,
    /// Print the messages of a chat
    History {
        /// Chat id; defaults to the newest chat
        chat: Option<i64>,
    },
    /// Delete a chat
    Remove {
        chat: i64,
    },
    /// Delete every saved chat
    Clear,
    /// Delete a model from the server
    RemoveModel {
        name: String,
    },
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
}

fn resolve_config(cli: &Cli) -> Config {
    let mut config = Config::new();
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(model) = &cli.model {
        config.model = Some(model.clone());
    }
    if let Some(model) = &cli.auto_answer {
        config.auto_answer_model = Some(model.clone());
    }
    if let Some(db) = &cli.db {
        config.database_path = Some(db.clone());
    }
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = resolve_config(&cli);
    log::debug!("Server: {}", config.base_url());
    log::debug!("Database: {}", config.database_path().display());

    let transport = Arc::new(OllamaTransport::from_config(&config));
    let store = Arc::new(SqliteChatStore::open_with_commit_window(
        config.database_path(),
        config.commit_window(),
    )?);
    store.init().await?;

    let (session, task) = spawn_session(store, transport, SessionOptions::from(&config));

    let result = match cli.command {
        Commands::Chat { chat } => run_interactive_chat(&session, &config, chat).await,
        Commands::Send {
            prompt,
            chat,
            turns,
        } => send_prompt(&session, &config, &prompt, chat, turns).await,
        Commands::Models => list_models(&session).await,
        Commands::Chats => list_chats(&session).await,
        Commands::History { chat } => print_history(&session, chat).await,
        Commands::Remove { chat } => {
            session.remove_chat(ChatId(chat)).await?;
            println!("{}", format!("Removed chat {}", chat).green());
            Ok(())
        }
        Commands::Clear => {
            session.clear_chats().await?;
            println!("{}", "Removed all chats".green());
            Ok(())
        }
        Commands::RemoveModel { name } => {
            session.delete_model(&name).await?;
            println!("{}", format!("Removed model {}", name).green());
            Ok(())
        }
    };

    session.shutdown().await?;
    task.await?;
    result
}

fn require_model(config: &Config) -> anyhow::Result<String> {
    config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no model selected; pass --model or set OLLAMA_MODEL"))
}

async fn open_chat(session: &SessionHandle, chat: Option<i64>) -> anyhow::Result<()> {
    if let Some(chat) = chat {
        session.set_current_chat(Some(ChatId(chat))).await?;
    }
    Ok(())
}

async fn send_prompt(
    session: &SessionHandle,
    config: &Config,
    prompt: &str,
    chat: Option<i64>,
    turns: usize,
) -> anyhow::Result<()> {
    let model = require_model(config)?;
    open_chat(session, chat).await?;
    // set after the chat switch, which clears it
    session
        .set_auto_answer_model(config.auto_answer_model.clone())
        .await?;

    let mut events = session.subscribe();
    session.send_prompt(model, prompt).await?;
    let result = print_replies(session, &mut events, turns.max(1)).await;
    session.set_auto_answer_model(None).await?;
    result
}

async fn run_interactive_chat(
    session: &SessionHandle,
    config: &Config,
    chat: Option<i64>,
) -> anyhow::Result<()> {
    let model = require_model(config)?;
    open_chat(session, chat).await?;
    if config.auto_answer_model.is_some() {
        log::warn!("Auto-answer is only used by the send command");
    }

    println!("{}", "Ollama Chat".cyan().bold());
    println!("{}", format!("Model: {}", model).dimmed());
    println!("{}", "Type 'exit' or 'quit' to leave".dimmed());
    println!();

    let mut events = session.subscribe();
    loop {
        print!("{} ", "You:".cyan().bold());
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            println!("{}", "Goodbye!".cyan());
            break;
        }
        if input.is_empty() {
            continue;
        }

        // drop anything left over from the previous turn
        while events.try_recv().is_ok() {}

        if let Err(e) = session.send_prompt(model.clone(), input).await {
            println!("{}", format!("Error: {}", e).red());
            continue;
        }
        if let Err(e) = print_replies(session, &mut events, 1).await {
            println!("{}", format!("Error: {}", e).red());
        }
        println!();
    }

    Ok(())
}

/// Stream replies to stdout until `turns` exchanges have finished
async fn print_replies(
    session: &SessionHandle,
    events: &mut broadcast::Receiver<SessionEvent>,
    turns: usize,
) -> anyhow::Result<()> {
    let mut finished = 0;
    let mut current: Option<usize> = None;
    let mut printed = 0;

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::debug!("Skipped {} session events", skipped);
                SessionEvent::ConversationChanged
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            SessionEvent::ConversationChanged => {
                let snapshot = session.snapshot().await?;
                let Some((index, message)) = snapshot
                    .messages
                    .iter()
                    .enumerate()
                    .rev()
                    .find(|(_, m)| !m.is_user())
                else {
                    continue;
                };

                if current != Some(index) {
                    if current.is_some() {
                        println!();
                    }
                    println!("{}", format!("{}:", message.model).green().bold());
                    current = Some(index);
                    printed = 0;
                }
                if let Some(delta) = message.content.get(printed..) {
                    print!("{}", delta);
                    io::stdout().flush()?;
                    printed = message.content.len();
                }
            }
            SessionEvent::ExchangeFinished(_) => {
                finished += 1;
                if finished >= turns {
                    println!();
                    break;
                }
            }
            SessionEvent::ExchangeFailed { error, .. } => {
                println!();
                println!("{}", format!("Error: {}", error).red());
                break;
            }
            SessionEvent::ServerError { error, .. } => {
                println!("{}", format!("Server error: {}", error).red());
            }
            SessionEvent::CurrentChatChanged(Some(chat)) => {
                log::debug!("Chat {}", chat);
            }
            _ => {}
        }
    }

    Ok(())
}

async fn list_models(session: &SessionHandle) -> anyhow::Result<()> {
    let models = session.list_models().await?;
    if models.is_empty() {
        println!("{}", "No models installed".yellow());
    }
    for model in models {
        println!("{}", model);
    }
    Ok(())
}

async fn list_chats(session: &SessionHandle) -> anyhow::Result<()> {
    let chats = session.list_chats().await?;
    if chats.is_empty() {
        println!("{}", "No saved chats".yellow());
    }
    for chat in chats {
        println!(
            "{} {} {}",
            format!("{:>5}", chat.id.0).cyan(),
            chat.created_at
                .format("%Y-%m-%d %H:%M")
                .to_string()
                .dimmed(),
            chat.name
        );
    }
    Ok(())
}

async fn print_history(session: &SessionHandle, chat: Option<i64>) -> anyhow::Result<()> {
    let chat_id = match chat {
        Some(id) => ChatId(id),
        None => match session.list_chats().await?.first() {
            Some(chat) => chat.id,
            None => {
                println!("{}", "No saved chats".yellow());
                return Ok(());
            }
        },
    };

    session.set_current_chat(Some(chat_id)).await?;
    let snapshot = session.snapshot().await?;
    for message in &snapshot.messages {
        let speaker = if message.is_user() {
            "You:".cyan().bold()
        } else {
            format!("{}:", message.model).green().bold()
        };
        println!("{}", speaker);
        println!("{}", message.content);
        println!();
    }
    Ok(())
}
