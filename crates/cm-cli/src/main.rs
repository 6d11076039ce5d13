//! cm: Conversation Memory inspection tool
//!
//! Usage:
//!   cm show [key]                         - Print the windowed history
//!   cm put <role> <text> [key]            - Append a message
//!   cm reset [key]                        - Delete a history
//!   cm keys                               - List stored keys
//!   cm export [key]                       - Print the memory record as JSON
//!   cm recent <conversation> [before] [max] - Query long-term memory
//!   cm --help                             - Show help

use cm_core::memory::{ChatMemory, LongTermMemory, DEFAULT_MAX_ENTRIES};
use cm_core::message::{now_timestamp, Message, MessageRole};
use cm_core::store::MessageStore;
use cm_core::{Config, ShortTermMemory};
use tracing_subscriber::EnvFilter;

/// Run mode
#[derive(Debug, PartialEq)]
enum RunMode {
    /// Print the history for a key
    Show { key: Option<String> },
    /// Append one message
    Put {
        role: MessageRole,
        text: String,
        key: Option<String>,
    },
    /// Delete the history for a key
    Reset { key: Option<String> },
    /// List keys with stored messages
    Keys,
    /// Print the serialized memory record
    Export { key: Option<String> },
    /// Long-term recency query
    Recent {
        conversation: String,
        before: f64,
        max: usize,
    },
    /// Show help
    Help,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = match parse_args(&args) {
        Ok(mode) => mode,
        Err(message) => {
            eprintln!("error: {}", message);
            eprintln!();
            print_help();
            std::process::exit(2);
        }
    };

    match mode {
        RunMode::Help => {
            print_help();
            return Ok(());
        }
        RunMode::Version => {
            println!("cm {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    // Initialize logging (stderr keeps command output clean)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    // Load .env file
    dotenvy::dotenv().ok();

    // Load configuration (cm.toml, then environment)
    let config = Config::load().map_err(|e| anyhow::anyhow!("Config error: {}", e))?;

    tracing::debug!(
        "Short-term backend: {:?}, long-term backend: {:?}",
        config.short_term.backend,
        config.long_term.backend
    );

    run(mode, &config).await
}

/// Execute one command against the configured memories
async fn run(mode: RunMode, config: &Config) -> anyhow::Result<()> {
    match mode {
        RunMode::Show { key } => {
            let memory = open_short_term(config, key)?;
            for message in memory.get(None)? {
                println!("{}: {}", message.role, message.text_content());
            }
        }
        RunMode::Put { role, text, key } => {
            let memory = open_short_term(config, key)?;
            memory.async_put(Message::new(role, text)).await?;
            println!("Stored 1 message under '{}'", memory.key());
        }
        RunMode::Reset { key } => {
            let memory = open_short_term(config, key)?;
            memory.reset()?;
            println!("Reset '{}'", memory.key());
        }
        RunMode::Keys => {
            let store = config.build_store()?;
            for key in store.async_get_keys().await? {
                println!("{}", key);
            }
        }
        RunMode::Export { key } => {
            let memory = open_short_term(config, key)?;
            let record = memory.to_record()?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        RunMode::Recent {
            conversation,
            before,
            max,
        } => {
            let long_term = config.build_long_term()?;
            let memories = long_term.get_recent_memories(&conversation, before, max)?;
            if memories.is_empty() {
                println!("No memories for '{}'", conversation);
            }
            for message in memories {
                println!("{}: {}", message.role, message.text_content());
            }
        }
        RunMode::Help | RunMode::Version => {}
    }

    Ok(())
}

/// Build the short-term memory, optionally bound to another key
fn open_short_term(config: &Config, key: Option<String>) -> anyhow::Result<ShortTermMemory> {
    let memory = config.build_short_term()?;
    Ok(match key {
        Some(key) => {
            let rebound = ShortTermMemory::new(memory.store().clone(), key)
                .with_llm(memory.llm().cloned());
            match memory.token_limit() {
                Some(limit) => rebound.with_token_limit(limit),
                None => rebound,
            }
        }
        None => memory,
    })
}

/// Parse command line arguments
fn parse_args(args: &[String]) -> Result<RunMode, String> {
    let Some(command) = args.first() else {
        return Ok(RunMode::Help);
    };
    let rest = &args[1..];
    let optional_key = |index: usize| rest.get(index).cloned();

    match command.as_str() {
        "--help" | "-h" | "help" => Ok(RunMode::Help),
        "--version" | "-v" => Ok(RunMode::Version),
        "show" => Ok(RunMode::Show {
            key: optional_key(0),
        }),
        "put" => {
            let (Some(role), Some(text)) = (rest.first(), rest.get(1)) else {
                return Err("put requires <role> <text>".to_string());
            };
            let role = role.parse::<MessageRole>().map_err(|e| e.to_string())?;
            Ok(RunMode::Put {
                role,
                text: text.clone(),
                key: optional_key(2),
            })
        }
        "reset" => Ok(RunMode::Reset {
            key: optional_key(0),
        }),
        "keys" => Ok(RunMode::Keys),
        "export" => Ok(RunMode::Export {
            key: optional_key(0),
        }),
        "recent" => {
            let Some(conversation) = rest.first() else {
                return Err("recent requires <conversation>".to_string());
            };
            let before = match rest.get(1) {
                Some(value) => value
                    .parse::<f64>()
                    .map_err(|_| format!("invalid timestamp: {}", value))?,
                None => now_timestamp(),
            };
            let max = match rest.get(2) {
                Some(value) => value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid count: {}", value))?,
                None => DEFAULT_MAX_ENTRIES,
            };
            Ok(RunMode::Recent {
                conversation: conversation.clone(),
                before,
                max,
            })
        }
        other => Err(format!("unknown command: {}", other)),
    }
}

/// Print help message
fn print_help() {
    println!("cm - Conversation Memory inspection tool");
    println!();
    println!("Usage:");
    println!("  cm show [key]                           Print the windowed history");
    println!("  cm put <role> <text> [key]              Append a message");
    println!("  cm reset [key]                          Delete a history");
    println!("  cm keys                                 List stored keys");
    println!("  cm export [key]                         Print the memory record as JSON");
    println!("  cm recent <conversation> [before] [max] Query long-term memory");
    println!("  cm --help                               Show this help message");
    println!("  cm --version                            Show version");
    println!();
    println!("Roles: system, developer, user, assistant, tool, function");
    println!();
    println!("Environment Variables:");
    println!("  CM_STORE_BACKEND      Short-term backend: sqlite or in_memory (default: sqlite)");
    println!("  CM_DB_PATH            Short-term SQLite path (default: data/cm.db)");
    println!("  CM_CHAT_STORE_KEY     Default key (default: chat_history)");
    println!("  CM_TOKEN_LIMIT        Token budget for show");
    println!("  CM_LONG_TERM_BACKEND  Long-term backend: sqlite or in_memory (default: sqlite)");
    println!("  CM_LONG_TERM_DB_PATH  Long-term SQLite path (default: data/cm.db)");
    println!("  LLM_API_KEY           API key passed to memories (optional)");
    println!("  LLM_MODEL             Model name (default: claude-sonnet-4-20250514)");
}
