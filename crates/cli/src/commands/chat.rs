//! `ferrule chat`: interactive or single-message chat.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use ferrule_agent::{
    CancellationRegistry, JsonFileStore, LoopConfig, RequestLoop, RunOptions, RunOutcome, Session,
    SessionManager, build_system_prompt,
};
use ferrule_config::AppConfig;
use ferrule_core::event::EventBus;
use ferrule_core::provider::{ChunkCallback, ModelClient};
use ferrule_providers::build_from_config;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use uuid::Uuid;

use crate::event_log;

pub struct ChatArgs {
    pub message: Option<String>,
    pub stream: bool,
    pub session: Option<String>,
    pub provider: Option<String>,
}

pub async fn run(config: AppConfig, args: ChatArgs) -> Result<(), Box<dyn std::error::Error>> {
    let provider_name = args
        .provider
        .clone()
        .unwrap_or_else(|| config.default_provider.clone());
    if !config.has_api_key() && provider_name != "ollama" {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    OPENROUTER_API_KEY=sk-or-v1-...   (recommended)");
        eprintln!("    OPENAI_API_KEY=sk-...             (for OpenAI direct)");
        eprintln!("    FERRULE_API_KEY=sk-...            (generic)");
        eprintln!();
        eprintln!("  Or add it to your config file:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let client = build_from_config(&config);
    if let Some(provider) = &args.provider {
        client.set_active(provider)?;
    }
    let active = client.active_provider();

    let tools = Arc::new(ferrule_tools::default_registry(&config.tools)?);
    let system_prompt =
        build_system_prompt(&tools, config.agent.system_prompt_override.as_deref());

    let events = Arc::new(EventBus::default());
    let log_task = config
        .logging
        .event_log
        .as_ref()
        .map(|path| event_log::spawn(&events, PathBuf::from(path)));

    let agent = RequestLoop::new(
        Arc::new(client),
        tools.clone(),
        Arc::new(CancellationRegistry::new()),
        events.clone(),
    )
    .with_config(LoopConfig::from(&config.agent));

    let mut manager = SessionManager::new(system_prompt, config.optimizer.clone());
    if args.session.is_some() {
        manager = manager.with_store(Arc::new(JsonFileStore::new(AppConfig::sessions_dir())));
    }
    let session_id = args
        .session
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut session = manager.acquire(&session_id).await?;

    let stream = args.stream || config.agent.stream;

    if let Some(message) = args.message {
        let outcome = send(&agent, &mut session, &message, stream).await;
        print_outcome(&outcome, stream);
        if let Err(e) = manager.persist(&session).await {
            warn!(error = %e, "Failed to save session");
        }
    } else {
        println!();
        println!("  Ferrule interactive chat");
        println!();
        println!("  Provider:  {active}");
        println!("  Model:     {}", config.default_model);
        println!("  Tools:     {}", tools.names().join(", "));
        println!("  Session:   {session_id}");
        println!();
        println!("  Commands:  /clear  /optimize  /stats  /exit");
        println!("  Ctrl+C cancels a running request.");
        println!();

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        prompt()?;
        while let Some(line) = lines.next_line().await? {
            let input = line.trim();
            match input {
                "" => {}
                "/exit" | "/quit" | "exit" => break,
                "/clear" => {
                    session.clear_history();
                    println!("  History cleared.");
                }
                "/optimize" => {
                    let report = session.optimize();
                    println!(
                        "  Optimized: {} (pruned {}, summarized {}, new summary lines {})",
                        report.optimized,
                        report.pruned,
                        report.summarized,
                        report.new_summary_lines
                    );
                }
                "/stats" => print_stats(&session),
                _ => {
                    let outcome = send(&agent, &mut session, input, stream).await;
                    print_outcome(&outcome, stream);
                    if let Err(e) = manager.persist(&session).await {
                        warn!(error = %e, "Failed to save session");
                    }
                }
            }
            prompt()?;
        }

        println!();
        println!("  Goodbye!");
        println!();
    }

    drop(agent);
    drop(events);
    if let Some(task) = log_task {
        let _ = task.await;
    }
    Ok(())
}

fn prompt() -> std::io::Result<()> {
    print!("  You > ");
    std::io::stdout().flush()
}

/// Run one request; Ctrl+C cancels it and leaves the session usable.
async fn send(agent: &RequestLoop, session: &mut Session, input: &str, stream: bool) -> RunOutcome {
    let job_id = Uuid::new_v4().to_string();
    let on_chunk: Option<ChunkCallback> = stream.then(|| {
        print!("\n  Assistant > ");
        Arc::new(|chunk: &str| {
            print!("{chunk}");
            let _ = std::io::stdout().flush();
        }) as ChunkCallback
    });
    let options = RunOptions {
        job_id: Some(job_id.clone()),
        stream: Some(stream),
        on_chunk,
        preferred_provider: None,
    };

    let run = agent.run(session, input, options);
    tokio::pin!(run);
    tokio::select! {
        outcome = &mut run => outcome,
        _ = tokio::signal::ctrl_c() => {
            agent.registry().cancel(&job_id);
            run.await
        }
    }
}

fn print_outcome(outcome: &RunOutcome, streamed: bool) {
    match outcome {
        RunOutcome::Done(report) => {
            if streamed {
                println!();
            } else {
                println!();
                for line in report.response.lines() {
                    println!("  Assistant > {line}");
                }
            }
            if !report.tools_used.is_empty() {
                let used: Vec<String> = report
                    .tools_used
                    .iter()
                    .map(|t| format!("{}{}", t.name, if t.success { "" } else { " (failed)" }))
                    .collect();
                println!("  [tools: {}]", used.join(", "));
            }
            if report.fallback_used {
                println!("  [answered by fallback provider {}]", report.provider);
            }
            println!();
        }
        RunOutcome::Failed { error, .. } => {
            eprintln!();
            eprintln!("  [Error] {error}");
            println!();
        }
        RunOutcome::Cancelled { .. } => {
            println!();
            println!("  [Cancelled]");
            println!();
        }
    }
}

fn print_stats(session: &Session) {
    let stats = session.optimizer().stats();
    println!("  Messages:               {}", session.conversation.messages.len());
    println!("  Estimated tokens:       {}", session.conversation.estimated_tokens());
    println!("  Optimizations:          {}", stats.optimizations_performed);
    println!("  Messages removed:       {}", stats.messages_removed);
    println!("  Estimated tokens saved: {}", stats.estimated_tokens_saved);
    println!("  Summary regenerations:  {}", stats.summary_regenerations);
    println!("  Summary lines:          {}", stats.summary_lines);
}
