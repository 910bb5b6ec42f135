use colored::Colorize;
use log::{debug, warn};

use super::args::{Args, Command, DeleteTarget};
use super::ids::parse_id_list;
use super::prompt::{confirm, prompt};
use crate::{
    core::{
        store::{Conversation, StoredMessage},
        ChatError, Config, ConversationManager, ConversationStore, SqliteStore,
    },
    providers::claude::ClaudeClient,
};
use std::io::{self, Write};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const PREVIEW_WIDTH: usize = 60;

/// Sets up `env_logger`: `--debug` wins, then `RUST_LOG`, then the config.
fn init_logging(debug: bool, config_level: &str) {
    let mut builder = if debug {
        let mut builder = env_logger::Builder::new();
        builder.parse_filters("debug");
        builder
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config_level))
    };
    // A logger may already be installed when embedded in tests.
    let _ = builder.format_timestamp(None).try_init();
}

/// Reads `ANTHROPIC_API_KEY` from `.env`, then from the environment.
fn api_key() -> Result<String, ChatError> {
    dotenv::var("ANTHROPIC_API_KEY")
        .or_else(|_| std::env::var("ANTHROPIC_API_KEY"))
        .map_err(|_| {
            ChatError::ConfigError("ANTHROPIC_API_KEY not set in .env or environment".to_string())
        })
}

fn create_client(config: &Config, api_key: String) -> ClaudeClient {
    ClaudeClient::new(api_key, config.claude.clone())
        .with_system_prompt(config.system_prompt.clone())
}

pub async fn run(args: Args) -> Result<(), ChatError> {
    let _ = dotenv::dotenv();

    let config = Config::load(&args.config)?;
    init_logging(args.debug, &config.log_level);
    debug!(
        "[SETTINGS] model: {}, max_tokens: {}, stream: {}, data_file: {}",
        config.claude.model,
        config.claude.max_tokens,
        config.stream,
        config.data_file.display()
    );

    match args.command {
        Command::Chat {
            message,
            id,
            no_stream,
            history,
        } => {
            // Resolved before the store is touched so a missing key leaves no trace.
            let client = create_client(&config, api_key()?);
            let stream = !no_stream && config.stream;
            chat(&config, client, message.join(" "), id, stream, history).await
        }
        Command::Create { title } => {
            let mut store = SqliteStore::open(&config.data_file).await?;
            let conversation = store
                .create_conversation(title.as_deref().unwrap_or(""))
                .await?;
            println!(
                "Created conversation {} {}",
                conversation.id,
                display_title(&conversation).bold()
            );
            Ok(())
        }
        Command::List { id: None } => {
            let store = SqliteStore::open(&config.data_file).await?;
            print_conversations(&store.list_conversations().await?);
            Ok(())
        }
        Command::List { id: Some(id) } => {
            let store = SqliteStore::open(&config.data_file).await?;
            let conversation = find_conversation(&store, id).await?;
            println!("\nConversation: {}", display_title(&conversation).bold());
            print_messages(&store.messages(id).await?);
            Ok(())
        }
        Command::Delete { target } => delete(&config, target).await,
        Command::Configure { defaults: true } => {
            Config::write_defaults(&args.config)?;
            println!("Configuration at {} reset to defaults", args.config.display());
            Ok(())
        }
        Command::Configure { defaults: false } => {
            println!("Config file: {}", args.config.display());
            println!("  model:      {}", config.claude.model);
            println!("  max_tokens: {}", config.claude.max_tokens);
            println!("  stream:     {}", config.stream);
            println!("  data_file:  {}", config.data_file.display());
            println!("Run `configure --defaults` to reset it.");
            Ok(())
        }
    }
}

async fn chat(
    config: &Config,
    client: ClaudeClient,
    message: String,
    id: Option<i64>,
    stream: bool,
    history: bool,
) -> Result<(), ChatError> {
    let mut store = SqliteStore::open(&config.data_file).await?;
    let conversation = match id {
        Some(id) => find_conversation(&store, id).await?,
        None => match store.list_conversations().await?.into_iter().next() {
            Some(latest) => latest,
            None => {
                println!("No conversations found, starting a new one.");
                store.create_conversation("").await?
            }
        },
    };
    debug!("[Chat] using conversation {}", conversation.id);

    let mut stdout = io::stdout();
    let interactive = message.trim().is_empty();
    if history && interactive {
        let past = store.messages(conversation.id).await?;
        let question = "Would you like to see our conversation?";
        if !past.is_empty() && confirm(&mut io::stdin().lock(), &mut stdout, question)? {
            println!("\nConversation: {}", display_title(&conversation).bold());
            for stored in past {
                println!("{} {}\n", format!("{}:", stored.role).cyan().bold(), stored.content);
            }
        }
    }

    let message = if interactive {
        prompt(&mut io::stdin().lock(), &mut stdout, &"You:".green().bold().to_string())?
    } else {
        message
    };

    let mut manager = ConversationManager::new(Box::new(client), store);
    write!(stdout, "{} ", "Claude:".cyan().bold())?;
    stdout.flush()?;

    match manager.send(conversation.id, &message, stream, &mut stdout).await {
        Ok(outcome) => {
            writeln!(stdout)?;
            let reason = outcome
                .stop_reason
                .map_or_else(|| "done".to_string(), |r| r.to_string());
            println!(
                "{}",
                format!("[{reason}, {} output tokens]", outcome.usage.output_tokens).dimmed()
            );
            Ok(())
        }
        Err(ChatError::Stream(e)) => {
            writeln!(stdout)?;
            eprintln!("{}", "[response interrupted, not saved]".red().bold());
            Err(ChatError::Stream(e))
        }
        Err(e) => {
            writeln!(stdout)?;
            Err(e)
        }
    }
}

async fn delete(config: &Config, target: DeleteTarget) -> Result<(), ChatError> {
    let mut store = SqliteStore::open(&config.data_file).await?;
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    match target {
        DeleteTarget::Conversation { id, yes } => {
            let conversation = find_conversation(&store, id).await?;
            let question = format!(
                "Are you sure you want to delete conversation {id} - {}?",
                display_title(&conversation)
            );
            if !yes && !confirm(&mut stdin.lock(), &mut stdout, &question)? {
                println!("Cancelled.");
                return Ok(());
            }
            store.delete_conversation(id).await?;
            println!("Deleted conversation {id} - {}", display_title(&conversation));
        }
        DeleteTarget::Messages { ids, yes } => {
            let ids = parse_id_list(&ids)?;
            if !yes {
                let preview = ids
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                let question = format!("Are you sure you want to delete messages [{preview}]?");
                if !confirm(&mut stdin.lock(), &mut stdout, &question)? {
                    println!("Cancelled.");
                    return Ok(());
                }
            }
            let mut deleted = 0;
            for id in ids {
                if store.delete_message(id).await? {
                    deleted += 1;
                } else {
                    warn!("no message with id {id}");
                }
            }
            println!("Deleted {deleted} message(s)");
        }
    }
    Ok(())
}

async fn find_conversation(
    store: &impl ConversationStore,
    id: i64,
) -> Result<Conversation, ChatError> {
    store
        .conversation(id)
        .await?
        .ok_or_else(|| ChatError::InvalidInput(format!("No conversation with id {id}")))
}

fn display_title(conversation: &Conversation) -> String {
    if conversation.title.is_empty() {
        "(untitled)".to_string()
    } else {
        conversation.title.clone()
    }
}

fn print_conversations(conversations: &[Conversation]) {
    if conversations.is_empty() {
        println!("No conversations yet. Create one with `create --title <title>`.");
        return;
    }
    println!(
        "\n{:>5} | {:<40} | {:<19} | {:<19}",
        "ID", "Title", "Created", "Updated"
    );
    println!("{}", "-".repeat(92));
    for conversation in conversations {
        println!(
            "{:>5} | {:<40} | {} | {}",
            conversation.id,
            truncate(&display_title(conversation), 40),
            conversation.created_at.format(TIME_FORMAT),
            conversation.updated_at.format(TIME_FORMAT)
        );
    }
}

fn print_messages(messages: &[StoredMessage]) {
    println!(
        "{:>5} | {:<9} | {:<PREVIEW_WIDTH$} | {:<19}",
        "ID", "Role", "Content", "Created"
    );
    println!("{}", "-".repeat(PREVIEW_WIDTH + 40));
    for message in messages {
        println!(
            "{:>5} | {:<9} | {:<PREVIEW_WIDTH$} | {}",
            message.id,
            message.role.to_string(),
            truncate(&message.content.replace('\n', " "), PREVIEW_WIDTH),
            message.created_at.format(TIME_FORMAT)
        );
    }
}

/// Cuts `text` to at most `width` characters, marking the cut with `...`.
fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let kept: String = text.chars().take(width.saturating_sub(3)).collect();
    format!("{kept}...")
}
