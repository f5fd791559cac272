//! Operator console for the coordinator.
//!
//! Each line is looked up in a fixed command table and turned into a direct
//! call on the [`Coordinator`]. Operational errors are printed, never fatal.

use evc_core::{ChargingPoint, ChargingSession, CoreError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::coordinator::Coordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    List,
    Stop,
    Resume,
    Reset,
    History,
    Help,
    Quit,
}

pub struct CommandSpec {
    pub name: &'static str,
    pub usage: &'static str,
    pub summary: &'static str,
    command: Command,
}

pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "list",
        usage: "list",
        summary: "show every charging point and its state",
        command: Command::List,
    },
    CommandSpec {
        name: "stop",
        usage: "stop <stationId>",
        summary: "take a charging point out of service",
        command: Command::Stop,
    },
    CommandSpec {
        name: "resume",
        usage: "resume <stationId>",
        summary: "return a stopped charging point to service",
        command: Command::Resume,
    },
    CommandSpec {
        name: "reset",
        usage: "reset <stationId>",
        summary: "clear a charging point's error state",
        command: Command::Reset,
    },
    CommandSpec {
        name: "history",
        usage: "history",
        summary: "show finished sessions, most recent first",
        command: Command::History,
    },
    CommandSpec {
        name: "help",
        usage: "help",
        summary: "show this list",
        command: Command::Help,
    },
    CommandSpec {
        name: "quit",
        usage: "quit",
        summary: "shut the coordinator down",
        command: Command::Quit,
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Continue(String),
    Quit(String),
}

/// Runs one console line against the coordinator.
pub async fn dispatch(coordinator: &Coordinator, line: &str) -> Outcome {
    let mut words = line.split_whitespace();
    let Some(name) = words.next() else {
        return Outcome::Continue(String::new());
    };
    let Some(spec) = COMMANDS.iter().find(|spec| spec.name.eq_ignore_ascii_case(name)) else {
        return Outcome::Continue(format!("unknown command '{name}', try 'help'"));
    };
    let argument = words.next();

    let output = match spec.command {
        Command::List => render_stations(&coordinator.list().await),
        Command::History => render_history(&coordinator.history().await),
        Command::Help => render_help(),
        Command::Quit => {
            coordinator.shutdown().await;
            return Outcome::Quit("coordinator stopped".into());
        }
        Command::Stop | Command::Resume | Command::Reset => {
            let Some(station_id) = argument else {
                return Outcome::Continue(format!("usage: {}", spec.usage));
            };
            let result = match spec.command {
                Command::Stop => coordinator.admin_stop(station_id).await,
                Command::Resume => coordinator.admin_resume(station_id).await,
                _ => coordinator.admin_reset(station_id).await,
            };
            match result {
                Ok(status) => format!("{station_id} is now {status}"),
                Err(error) => describe(&error),
            }
        }
    };
    Outcome::Continue(output)
}

fn describe(error: &CoreError) -> String {
    match error {
        CoreError::NotFound { kind, id } => format!("no {kind} named {id}"),
        other => format!("refused: {other}"),
    }
}

fn render_help() -> String {
    COMMANDS
        .iter()
        .map(|spec| format!("  {:<20} {}", spec.usage, spec.summary))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_stations(points: &[ChargingPoint]) -> String {
    if points.is_empty() {
        return "no charging points".into();
    }
    let mut lines = vec![format!(
        "{:<12} {:<13} {:>20} {:>8}  {}",
        "STATION", "STATE", "LOCATION", "€/KWH", "LAST HEARTBEAT"
    )];
    for point in points {
        let heartbeat = point
            .last_heartbeat
            .map(|at| at.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "-".into());
        lines.push(format!(
            "{:<12} {:<13} {:>20} {:>8.2}  {}",
            point.id,
            point.status.as_str(),
            point.location.to_string(),
            point.price_per_kwh,
            heartbeat
        ));
    }
    lines.join("\n")
}

fn render_history(sessions: &[ChargingSession]) -> String {
    if sessions.is_empty() {
        return "no finished sessions".into();
    }
    sessions
        .iter()
        .map(|session| {
            let ended = session
                .ended_at
                .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            format!(
                "{ended}  {}  {:<10} driver {:<8} {:>7.2} kWh  {:>8.2} €  {}",
                session.session_id,
                session.station_id,
                session.driver_id,
                session.kwh_delivered,
                session.cost.unwrap_or_default(),
                session.status
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Reads commands from `input` until `quit` or end of input.
pub async fn run_console<R, W>(coordinator: &Coordinator, input: R, mut output: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    output.write_all(b"> ").await?;
    output.flush().await?;
    while let Some(line) = lines.next_line().await? {
        let (text, quit) = match dispatch(coordinator, &line).await {
            Outcome::Continue(text) => (text, false),
            Outcome::Quit(text) => (text, true),
        };
        if !text.is_empty() {
            output.write_all(text.as_bytes()).await?;
            output.write_all(b"\n").await?;
        }
        if quit {
            output.flush().await?;
            return Ok(());
        }
        output.write_all(b"> ").await?;
        output.flush().await?;
    }
    Ok(())
}
