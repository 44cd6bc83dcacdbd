//! Terminal chat against a running relay.
//!
//! Type a message and press enter. `/clear` forgets the conversation, `/quit`
//! exits. Ctrl-C cancels the reply in flight, or exits when idle.

use std::io::Write;
use std::sync::{Arc, Mutex};

use chat_relay::client::RelayClient;
use chat_relay::config::load_dotenv;
use chat_relay::controller::{Bubble, ConversationController, TurnOutcome};
use chat_relay::history::{FileStore, HistoryStore};
use chat_relay::types::Role;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const URL_VAR: &str = "RELAY_URL";
const MODEL_VAR: &str = "RELAY_MODEL";
const SYSTEM_PROMPT_VAR: &str = "RELAY_SYSTEM_PROMPT";

const DEFAULT_URL: &str = "http://localhost:3000";
const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a fast, helpful chat assistant. Answer briefly but clearly. Use Markdown when useful.";
const GREETING: &str = "Hey! I'm **Gemini Flash**. Ask me anything ✨";

type ActiveTurn = Arc<Mutex<Option<CancellationToken>>>;

fn env_or(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn print_bubble(bubble: &Bubble) {
    let label = match bubble.role {
        Role::User => "you",
        Role::Assistant => "assistant",
    };
    println!("{label}> {}", bubble.display_text());
}

/// Ctrl-C cancels the active turn if there is one, otherwise exits.
fn spawn_interrupt_handler(active: ActiveTurn) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            let token = active.lock().ok().and_then(|guard| guard.clone());
            match token {
                Some(token) => token.cancel(),
                None => {
                    println!();
                    std::process::exit(130);
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let url = env_or(URL_VAR).unwrap_or_else(|| DEFAULT_URL.to_string());
    let system_prompt =
        env_or(SYSTEM_PROMPT_VAR).unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

    let store = FileStore::default_location();
    tracing::debug!(dir = %store.dir().display(), "history location");

    let mut chat = ConversationController::new(RelayClient::new(&url), HistoryStore::new(store))
        .with_system_prompt(system_prompt)
        .with_greeting(GREETING);
    if let Some(model) = env_or(MODEL_VAR) {
        chat = chat.with_model(model);
    }

    if let Some(greeting) = chat.greeting() {
        println!("assistant> {greeting}");
    }
    for bubble in chat.transcript() {
        print_bubble(bubble);
    }

    let active: ActiveTurn = Arc::new(Mutex::new(None));
    spawn_interrupt_handler(Arc::clone(&active));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/clear" => {
                chat.clear()?;
                println!("(conversation cleared)");
                if let Some(greeting) = chat.greeting() {
                    println!("assistant> {greeting}");
                }
                continue;
            }
            _ => {}
        }

        let cancel = CancellationToken::new();
        if let Ok(mut guard) = active.lock() {
            *guard = Some(cancel.clone());
        }

        print!("assistant> ");
        std::io::stdout().flush()?;
        let outcome = chat
            .submit(&line, &cancel, |delta| {
                print!("{delta}");
                let _ = std::io::stdout().flush();
            })
            .await;

        if let Ok(mut guard) = active.lock() {
            *guard = None;
        }

        match outcome? {
            TurnOutcome::Completed(_) => println!(),
            TurnOutcome::Failed(failure) => println!("\n⚠️ {failure}"),
        }
    }

    Ok(())
}
