use std::io::{self, Write};

use clap::{CommandFactory, Parser};
use colored::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use resviz_sync::backend::{Backend, HttpBackend};
use resviz_sync::cli::{build_other_params, Args, Command};
use resviz_sync::config::Config;
use resviz_sync::render::{render_header, render_log, LivePrinter};
use resviz_sync::retry::{hydrate_with_retry, Backoff, DEFAULT_BASE};
use resviz_sync::session::{ConversationSession, EndReason, StreamOutcome};
use resviz_sync::wire::SendRequest;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Command::Completions { shell } = args.command {
        clap_complete::generate(shell, &mut Args::command(), "resviz-sync", &mut io::stdout());
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("resviz_sync=info")),
        )
        .with_writer(io::stderr)
        .init();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(url) = &args.base_url {
        config = config.with_base_url(url.clone())?;
    }
    let backend = HttpBackend::new(&config)?;
    info!(base_url = %backend.base_url(), "backend configured");
    let mut session = ConversationSession::new(backend);

    match args.command {
        Command::History => {
            hydrate(&mut session, args.retries).await?;
        }
        Command::Send {
            content,
            title,
            agent,
            params,
        } => {
            hydrate(&mut session, args.retries).await?;
            let request = SendRequest {
                content,
                title: title.unwrap_or_else(|| config.default_title.clone()),
                agent_name: agent.unwrap_or_else(|| config.agent_name.clone()),
                other_params: build_other_params(&params),
            };
            session.start_send(request).await?;
            let outcome = pump(&mut session).await?;
            report(&outcome);
        }
        Command::Continue { message_id } => {
            hydrate(&mut session, args.retries).await?;
            session.start_continuation(&message_id).await?;
            let outcome = pump(&mut session).await?;
            report(&outcome);
        }
        Command::Stop => {
            let response = session.stop().await?;
            println!("{}: {}", response.status.bright_yellow(), response.message);
            return Ok(());
        }
        Command::Rollback { message_id } => {
            hydrate(&mut session, args.retries).await?;
            let response = session.rollback_to(&message_id).await?;
            println!(
                "{} {} ({} removed on the backend)",
                "Rolled back to".bright_green(),
                message_id,
                response.deleted_count
            );
        }
        Command::Completions { .. } => return Ok(()),
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(session.log().messages())?);
    } else {
        println!("{}", render_log(session.log().messages()));
    }
    Ok(())
}

/// Hydrate, retrying transport and 5xx failures of the history fetch.
async fn hydrate<B: Backend>(
    session: &mut ConversationSession<B>,
    retries: u32,
) -> resviz_sync::Result<()> {
    let mut backoff = Backoff::new(DEFAULT_BASE, retries);
    let outcome = hydrate_with_retry(session, &mut backoff).await?;
    if let Some(continued) = outcome.and_then(|o| o.continuation) {
        report(&continued);
    }
    Ok(())
}

/// Drive the open stream, printing content as it arrives. Ctrl-C asks the
/// backend to stop; the stream then ends on its own.
async fn pump<B: Backend>(session: &mut ConversationSession<B>) -> resviz_sync::Result<StreamOutcome> {
    let stop = session.stop_handle();
    let mut printer = LivePrinter::new();
    for message in session.log().messages() {
        printer.unprinted(message);
    }
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stop_sent = false;

    loop {
        let step = tokio::select! {
            step = session.step() => Some(step),
            _ = &mut ctrl_c, if !stop_sent => None,
        };
        let Some(step) = step else {
            stop_sent = true;
            warn!("interrupted; asking backend to stop");
            if let Err(e) = stop.stop().await {
                warn!(error = %e, "stop request failed");
            }
            continue;
        };
        let finished = step?;
        print_progress(session, &mut printer);
        if let Some(outcome) = finished {
            println!();
            return Ok(outcome);
        }
    }
}

fn print_progress<B: Backend>(session: &ConversationSession<B>, printer: &mut LivePrinter) {
    let mut stdout = io::stdout();
    for message in session.log().messages() {
        if printer.is_new(&message.id) {
            let _ = writeln!(stdout, "\n{}", render_header(message));
        }
        let text = printer.unprinted(message);
        if !text.is_empty() {
            let _ = write!(stdout, "{text}");
        }
    }
    let _ = stdout.flush();
}

fn report(outcome: &StreamOutcome) {
    match &outcome.reason {
        EndReason::ServerError(payload) => {
            eprintln!("{} {}", "[server error]".bright_red(), payload);
        }
        EndReason::Eof => {
            eprintln!("{}", "[stream closed without a terminal event]".bright_yellow());
        }
        _ => {}
    }
    if outcome.dropped > 0 {
        eprintln!(
            "{} {} patch(es) dropped",
            "[warning]".bright_yellow(),
            outcome.dropped
        );
    }
}
