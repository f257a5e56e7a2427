//! Child-side worker harness for process-isolated jobs.
//!
//! Wraps an arbitrary command and speaks the envelope protocol on stdout so
//! a `ProcessJobRunner` can supervise it:
//!
//! ```text
//! atelier-worker -- python train.py --epochs 50
//! ```
//!
//! Every line the wrapped command prints becomes a `log` envelope, except
//! lines of the form `PROGRESS <0..1> [message]`, which become `progress`
//! envelopes. On exit code 0 a `result` envelope is posted; otherwise an
//! `error` envelope is posted and the harness itself exits non-zero, so a
//! parent still sees a crash even if the envelope is lost.

use std::process::Stdio;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use atelier_jobs::process::EnvelopeWriter;

/// Parse a `PROGRESS <value> [message]` marker line.
fn parse_progress_marker(line: &str) -> Option<(f64, Option<&str>)> {
    let rest = line.strip_prefix("PROGRESS ")?;
    let mut parts = rest.trim().splitn(2, ' ');
    let value: f64 = parts.next()?.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some((value, parts.next().map(str::trim).filter(|m| !m.is_empty())))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "atelier_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command_args = match args.iter().position(|a| a == "--") {
        Some(index) => &args[index + 1..],
        None => &args[..],
    };
    if command_args.is_empty() {
        bail!("usage: atelier-worker -- <command> [args...]");
    }

    let mut writer = EnvelopeWriter::stdout();
    let (program, rest) = command_args.split_first().expect("checked non-empty");

    tracing::info!(program = %program, "Worker wrapping command");

    let mut child = Command::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    let stdout = child.stdout.take().context("child stdout not piped")?;
    let stderr = child.stderr.take().context("child stderr not piped")?;
    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            line = out_lines.next_line(), if out_open => match line? {
                Some(line) => match parse_progress_marker(&line) {
                    Some((value, message)) => writer.progress(value, message)?,
                    None => writer.log(&line)?,
                },
                None => out_open = false,
            },
            line = err_lines.next_line(), if err_open => match line? {
                Some(line) => writer.log(&line)?,
                None => err_open = false,
            },
        }
    }

    let status = child.wait().await.context("failed waiting for command")?;
    if status.success() {
        writer.result(serde_json::json!({ "exit_code": 0 }))?;
        Ok(())
    } else {
        let code = status.code();
        let message = match code {
            Some(code) => format!("Command exited with code {code}"),
            None => "Command was terminated by a signal".to_string(),
        };
        tracing::error!(exit_code = ?code, "Wrapped command failed");
        writer.error(&message)?;
        std::process::exit(1);
    }
}
