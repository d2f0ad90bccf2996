/// CLI for inspecting a timeline sync data directory
use colored::*;
use std::path::Path;
use timeline_sync_core::chunk_store::ChunkStore;
use timeline_sync_core::model::TimelineEvent;
use timeline_sync_core::token_store::{SledTokenStore, TokenStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        print_usage();
        return Ok(());
    }

    let data_dir = Path::new(&args[1]);
    let command = &args[2];

    match command.as_str() {
        "rooms" => {
            list_rooms(data_dir).await?;
        }
        "chunks" => {
            let Some(conversation_id) = args.get(3) else {
                eprintln!("Usage: cli <data-dir> chunks <conversation>");
                return Ok(());
            };
            show_chunks(data_dir, conversation_id).await?;
        }
        "events" => {
            let Some(conversation_id) = args.get(3) else {
                eprintln!("Usage: cli <data-dir> events <conversation>");
                return Ok(());
            };
            show_events(data_dir, conversation_id).await?;
        }
        "cursor" => {
            show_cursor(data_dir)?;
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!("Timeline sync CLI");
    println!();
    println!("Usage: cli <data-dir> <command> [args]");
    println!();
    println!("Commands:");
    println!("  rooms                   List conversations with stored chunks");
    println!("  chunks <conversation>   Show the chunk chain of a conversation");
    println!("  events <conversation>   Dump every chunk's events in display order");
    println!("  cursor                  Show the saved sync cursor");
}

fn open_store(data_dir: &Path) -> anyhow::Result<ChunkStore> {
    ChunkStore::new(data_dir).map_err(|e| anyhow::anyhow!("Failed to open {:?}: {}", data_dir, e))
}

async fn list_rooms(data_dir: &Path) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let conversations = store.conversations()?;
    if conversations.is_empty() {
        println!("{} No conversations stored", "⚠".yellow().bold());
        return Ok(());
    }

    for conversation_id in conversations {
        let chunks = store.chunks(&conversation_id).await?;
        let events: usize = chunks.iter().map(|chunk| chunk.len()).sum();
        println!(
            "{}  {} chunk(s), {} event(s)",
            conversation_id.cyan().bold(),
            chunks.len(),
            events
        );
    }
    Ok(())
}

async fn show_chunks(data_dir: &Path, conversation_id: &str) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let chunks = store.chunks(conversation_id).await?;
    if chunks.is_empty() {
        println!("{} No chunks for {}", "⚠".yellow().bold(), conversation_id);
        return Ok(());
    }

    for chunk in chunks {
        let marker = if chunk.is_last_forward {
            "live".green().bold()
        } else {
            "history".normal()
        };
        println!(
            "{} [{}] {} event(s)  prev={}  next={}",
            chunk.id.to_string().bold(),
            marker,
            chunk.len(),
            token_label(chunk.prev_token.as_ref().map(|t| t.as_str())),
            token_label(chunk.next_token.as_ref().map(|t| t.as_str())),
        );
    }
    Ok(())
}

async fn show_events(data_dir: &Path, conversation_id: &str) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    for chunk in store.chunks(conversation_id).await? {
        println!("{} {}", "▸".cyan().bold(), chunk.id);
        for event in store.events_in_chunk(conversation_id, chunk.id).await? {
            print_event(&event);
        }
    }
    Ok(())
}

fn print_event(event: &TimelineEvent) {
    let index = event
        .display_index
        .map(|i| i.to_string())
        .unwrap_or_else(|| "-".to_string());
    let kind = if event.event.is_state() {
        "state".magenta()
    } else {
        "event".normal()
    };
    println!(
        "  {:>6}  {}  {}  state_index={}",
        index,
        kind,
        event.event_id,
        event.state_index
    );
}

fn show_cursor(data_dir: &Path) -> anyhow::Result<()> {
    let tokens = SledTokenStore::new(data_dir)?;
    match tokens.get()? {
        Some(token) => println!("{} {}", "✓".green().bold(), token),
        None => println!("{} No sync cursor saved yet", "⚠".yellow().bold()),
    }
    Ok(())
}

fn token_label(token: Option<&str>) -> ColoredString {
    match token {
        Some(token) => token.normal(),
        None => "∅".dimmed(),
    }
}
