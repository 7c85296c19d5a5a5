//! `switchboard chat`: interactive or single-message chat mode.

use std::io::Write;
use std::sync::Arc;
use switchboard_agent::{AgentCore, Session, SessionEvent};
use switchboard_config::AppConfig;
use switchboard_core::event::DomainEvent;
use switchboard_memory::InMemoryBackend;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};

pub async fn run(message: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    let provider = match switchboard_providers::build_from_config(&config) {
        Ok(provider) => provider,
        Err(e) => {
            eprintln!();
            eprintln!("  ERROR: {e}");
            eprintln!();
            eprintln!("  Set one of these environment variables:");
            eprintln!("    SWITCHBOARD_API_KEY=sk-...");
            eprintln!("    OPENAI_API_KEY=sk-...");
            eprintln!();
            eprintln!("  Or add it to your config file:");
            eprintln!("    {}", AppConfig::config_path().display());
            eprintln!();
            return Err(e.into());
        }
    };

    let agent_config = config.agent_config();
    let streaming = agent_config.stream;
    let core = AgentCore::builder(agent_config)
        .with_provider(provider)
        .with_memory(Arc::new(InMemoryBackend::new()))
        .with_classifications(config.classifications())
        .build()?;

    if streaming {
        core.stream_callbacks().register(|delta, completion, _session_id| {
            print!("{delta}");
            if completion.is_some() && !delta.ends_with('\n') {
                println!();
            }
            let _ = std::io::stdout().flush();
        });
    }

    let session = core.create_session("cli");
    attach_printers(&session, streaming);

    let mut events = core.events().subscribe();
    core.start()?;

    let result = match message {
        Some(text) => ask(&session, &mut events, text).await,
        None => interactive(&config, &session, &mut events).await,
    };

    core.stop().await;
    result
}

async fn interactive(
    config: &AppConfig,
    session: &Session,
    events: &mut broadcast::Receiver<Arc<DomainEvent>>,
) -> Result<(), Box<dyn std::error::Error>> {
    println!();
    println!("  Switchboard interactive chat");
    println!();
    println!("  Provider:  {}", config.provider.name);
    println!("  Model:     {}", config.provider.model);
    println!("  Streaming: {}", config.agent.stream);
    println!();
    println!("  Type your message and press Enter.");
    println!("  Type 'exit' or Ctrl+D to quit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        let line = line.trim();
        if is_exit(line) {
            break;
        }
        if line.is_empty() {
            continue;
        }

        if let Err(e) = ask(session, events, line.to_string()).await {
            eprintln!("  [Error] {e}");
        }
        println!();
    }
    Ok(())
}

/// Send one message and wait for its turn to finish.
async fn ask(
    session: &Session,
    events: &mut broadcast::Receiver<Arc<DomainEvent>>,
    text: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let message_id = session.chat(text);
    loop {
        match events.recv().await {
            Ok(event) => match &*event {
                DomainEvent::TurnCompleted { message_id: id, .. } if *id == message_id => return Ok(()),
                DomainEvent::TurnFailed {
                    message_id: id,
                    error_message,
                    ..
                } if *id == message_id => return Err(error_message.clone().into()),
                _ => {}
            },
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return Err("agent stopped".into()),
        }
    }
}

/// Print routed turns. Streamed text is printed by the stream callback,
/// so conversation handlers stay quiet when streaming.
fn attach_printers(session: &Session, streaming: bool) {
    if !streaming {
        session.on_conversation(|parsed| {
            let text = parsed
                .answer
                .clone()
                .unwrap_or_else(|| parsed.content.to_string());
            for line in text.lines() {
                println!("  Assistant > {line}");
            }
        });
    }

    session.on_event(|event| match event {
        SessionEvent::ToolResult(envelope) => println!("  [{}] {}", envelope.tool_name, envelope.to_prompt_text()),
        SessionEvent::Classified(parsed) => println!(
            "  [{}] {}",
            parsed.instruction.as_deref().unwrap_or("event"),
            parsed.content
        ),
    });

    session.on_tool_result(|envelope| {
        let status = if envelope.is_success() { "ok" } else { "failed" };
        eprintln!("  [tool {} {status}] {}", envelope.tool_name, envelope.to_prompt_text());
    });

    session.on_exception(move |event| {
        eprintln!("  [unclassified] {}", event.error);
        if !streaming {
            println!("  Assistant > {}", event.raw_response);
        }
    });
}

fn is_exit(line: &str) -> bool {
    matches!(line, "exit" | "quit" | "/exit" | "/quit")
}
