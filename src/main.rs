use std::io::{self, Write};

use clap::{CommandFactory, Parser};
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use storycast::channel::{Connector, WsConnector};
use storycast::cli::{Args, Command};
use storycast::config::SyncConfig;
use storycast::envelope::Event;
use storycast::relay::{self, Relay};
use storycast::session::{Step, StreamerSession, ViewerSession};
use storycast::story::{DirectoryStoryProvider, HttpStoryProvider};

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

/// One terminal line per room event, or `None` for events not worth showing.
fn render(event: &Event) -> Option<String> {
    let line = match event {
        Event::DramaStart(s) | Event::DramaNewChapter(s) => {
            format!("{} chapter {} ({})", "▶".bright_cyan(), s.chapter_id, s.background.id).bold().to_string()
        }
        Event::DramaProgress(p) => {
            let who = p.role.as_ref().map(|c| c.name.as_str()).unwrap_or("?");
            let text = p.dialogue.as_ref().map(|d| d.text.as_str()).unwrap_or("");
            format!("{}: {}", who.bright_yellow(), text)
        }
        Event::DramaChapterInserted(c) => {
            format!("{} chapter {} inserted after {}", "+".bright_green(), c.chapter_id, c.insert_after_id)
        }
        Event::DramaEnd(e) => format!("{} {}", "■".bright_red(), e.message).bold().to_string(),
        Event::VoteTrigger(t) => {
            let options: Vec<String> = t.options.iter().map(|o| format!("[{}] {}", o.id.bright_white(), o.label)).collect();
            format!("{} vote {} ({}s): {}", "?".bright_magenta(), t.vote_id, t.duration, options.join("  "))
        }
        Event::VoteProgress(p) => {
            let tally: Vec<String> = p.votes.iter().map(|(k, v)| format!("{k}={v}")).collect();
            format!("  votes {} ({} in, {}s left)", tally.join(" "), p.total, p.time_left).dimmed().to_string()
        }
        Event::VoteResult(r) => {
            let verdict = if r.passed { "passed".green() } else { "no majority".yellow() };
            format!("{} winner {} ({})", "✔".bright_green(), r.winner.bold(), verdict)
        }
        Event::VoteRejected(r) => format!("{} ballot rejected: {}", "✘".red(), r.reason),
        Event::PlotUpdate(p) => format!("{} {}", "~".cyan(), p.text),
        Event::ViewerCount(v) => format!("  {} watching", v.count).dimmed().to_string(),
        Event::Chat(m) => format!("<{}> {}", m.sender.bright_blue(), m.content),
        Event::VoteCast(_) | Event::VoteClose(_) | Event::Ping | Event::Pong => return None,
    };
    Some(line)
}

fn print_events<C: Connector>(client: &storycast::channel::ChannelClient<C>) -> storycast::dispatcher::Subscription {
    client.dispatcher().on_any(|envelope| {
        if let Some(line) = Event::decode(envelope).ok().as_ref().and_then(render) {
            println!("{line}");
        }
        Ok(())
    })
}

fn prompt() {
    print!("{} ", ">".bright_black());
    let _ = io::stdout().flush();
}

async fn run_relay(config: &SyncConfig) -> storycast::Result<()> {
    let listener = TcpListener::bind(&config.relay.bind).await?;
    println!("{} relay on ws://{}/ws", "●".bright_green(), listener.local_addr()?);
    let relay = Relay::new(config.relay.channel_capacity);
    tokio::select! {
        res = relay::serve(listener, relay) => res?,
        _ = tokio::signal::ctrl_c() => println!("{}", "shutting down".dimmed()),
    }
    Ok(())
}

async fn run_streamer(config: &SyncConfig, room: &str, story: &str) -> storycast::Result<()> {
    let session = StreamerSession::join(WsConnector, config, room).await;
    let _printer = print_events(session.client());
    // The relay does not echo our own broadcasts, so results come from the session.
    let mut results = session.watch_results();
    let result_printer = tokio::spawn(async move {
        while results.changed().await.is_ok() {
            let latest = results.borrow_and_update().clone();
            if let Some(line) = latest.map(Event::VoteResult).as_ref().and_then(render) {
                println!("{line}");
            }
        }
    });

    match &config.story.http_base {
        Some(base) => session.load_story(&HttpStoryProvider::new(base.clone()), story).await?,
        None => session.load_story(&DirectoryStoryProvider::new(&config.story.dir), story).await?,
    }
    println!("{} story '{}' loaded for room {}", "●".bright_green(), story, room);
    println!("{}", "commands: start | next | close | stats | quit".dimmed());

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    prompt();
    while let Some(line) = lines.next().await {
        let line = line?;
        match line.trim() {
            "" => {}
            "start" => match session.start() {
                Ok(scene) => println!("started at chapter {}", scene.chapter_id),
                Err(e) => println!("{} {e}", "!".yellow()),
            },
            "next" | "n" => match session.next() {
                Ok(Step::Line(node)) => println!("{}: {}", node.speaker.name.bright_yellow(), node.dialogue.text),
                Ok(Step::VoteOpened(t)) => println!("vote {} open for {}s", t.vote_id, t.duration),
                Ok(Step::Finished(node)) => println!("{}: {} {}", node.speaker.name, node.dialogue.text, "(end)".dimmed()),
                Ok(Step::Idle) => println!("{}", "story already ended".dimmed()),
                Err(e) => println!("{} {e}", "!".yellow()),
            },
            "close" => {
                if session.close_vote().is_none() {
                    println!("{}", "no open vote".dimmed());
                }
            }
            "stats" => print_stats(&session.stats(), session.status().state.to_string()),
            "quit" | "exit" => break,
            other => println!("{} unknown command '{other}'", "?".yellow()),
        }
        prompt();
    }
    result_printer.abort();
    session.leave().await;
    Ok(())
}

async fn run_viewer(config: &SyncConfig, room: &str, name: &str) -> storycast::Result<()> {
    let session = ViewerSession::join(WsConnector, config, room, name).await;
    let _printer = print_events(session.client());
    println!("{} joined room {} as {}", "●".bright_green(), room, name.bright_blue());
    println!("{}", "commands: vote <option> | chat <text> | stats | quit".dimmed());

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    prompt();
    while let Some(line) = lines.next().await {
        let line = line?;
        let (cmd, rest) = line.trim().split_once(' ').unwrap_or((line.trim(), ""));
        match cmd {
            "" => {}
            "vote" => match session.cast_vote(rest.trim()) {
                Ok(true) => println!("voted {}", rest.trim().bold()),
                Ok(false) => println!("{} not connected, ballot not sent", "!".yellow()),
                Err(e) => println!("{} {e}", "!".yellow()),
            },
            "chat" => {
                if !session.send_chat(rest) {
                    println!("{} not connected, message not sent", "!".yellow());
                }
            }
            "stats" => print_stats(&session.stats(), session.status().state.to_string()),
            "quit" | "exit" => break,
            other => println!("{} unknown command '{other}'", "?".yellow()),
        }
        prompt();
    }
    session.leave().await;
    Ok(())
}

fn print_stats(stats: &storycast::presence::RoomStats, state: String) {
    println!(
        "{} {}  viewers {} (peak {})  events {}  chat {}",
        "connection".dimmed(),
        if stats.gave_up { "gave up".red().to_string() } else { state },
        stats.viewer_count,
        stats.peak_viewers,
        stats.events_seen,
        stats.chat_messages,
    );
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(&args);

    if let Command::Completions { shell } = &args.command {
        clap_complete::generate(*shell, &mut Args::command(), "storycast", &mut io::stdout());
        return;
    }

    let mut config = match SyncConfig::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            std::process::exit(2);
        }
    };
    config.apply_env_overrides();
    args.apply_to(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("{} {e}", "error:".red().bold());
        std::process::exit(2);
    }

    let result = match &args.command {
        Command::Relay { .. } => run_relay(&config).await,
        Command::Streamer { room, story } => run_streamer(&config, room, story).await,
        Command::Viewer { room, name } => run_viewer(&config, room, name).await,
        Command::Completions { .. } => Ok(()),
    };
    if let Err(e) = result {
        eprintln!("{} {e}", "error:".red().bold());
        std::process::exit(1);
    }
}
