//! Line-oriented operator console on stdin
//!
//! Accepts the simulator command grammar (`cap open`, `pot color`,
//! `color 255 0 0`, `transfer`, ...) and prints replies to stdout.

use std::fmt::Write as _;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::memory::StoredFile;
use crate::sensors::{Rgb, MAX_SELECTOR};
use crate::state::{DeviceError, DeviceStatus};

use super::{Command, DeviceHandle, Reply};

/// Selector value used by `pot mic`
const POT_MIC: u16 = 0;
/// Selector value used by `pot color`
const POT_COLOR: u16 = 3000;

const HELP: &str = "\
Sensor commands:
  cap open | cap close     open or close the cap
  tilt | upright           tilt the bottle or stand it up
  pot <0-4095>             set the selector
  pot mic | pot color      select the microphone or the color sensor
  color <r> <g> <b>        set the color sensor reading
Control commands:
  status                   show state and sensors
  files                    list files in storage
  transfer                 force a transfer (Ready only)
  reset                    clear memory and return to Idle
  help                     show this help
  quit | exit              stop the daemon";

/// One parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Command(Command),
    Help,
    Quit,
}

/// Parse one console line; blank lines yield `None`
pub fn parse_line(line: &str) -> Result<Option<ConsoleInput>, DeviceError> {
    let line = line.trim().to_ascii_lowercase();
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some((&cmd, args)) = parts.split_first() else {
        return Ok(None);
    };

    let usage = |text: &str| DeviceError::invalid_command(cmd, format!("usage: {text}"));

    let input = match (cmd, args) {
        ("cap", ["open"]) => ConsoleInput::Command(Command::OpenCap),
        ("cap", ["close"]) => ConsoleInput::Command(Command::CloseCap),
        ("cap", _) => return Err(usage("cap open | cap close")),
        ("tilt", []) => ConsoleInput::Command(Command::SetTilt(true)),
        ("upright", []) => ConsoleInput::Command(Command::SetTilt(false)),
        ("pot", ["mic"]) => ConsoleInput::Command(Command::SetSelector(POT_MIC)),
        ("pot", ["color"]) => ConsoleInput::Command(Command::SetSelector(POT_COLOR)),
        ("pot", [value]) => {
            let value: u16 = value
                .parse()
                .ok()
                .filter(|v| *v <= MAX_SELECTOR)
                .ok_or_else(|| {
                    DeviceError::invalid_command(cmd, format!("selector must be 0-{MAX_SELECTOR}"))
                })?;
            ConsoleInput::Command(Command::SetSelector(value))
        }
        ("pot", _) => return Err(usage("pot <value> | pot mic | pot color")),
        ("color", [r, g, b]) => {
            let channel = |raw: &str| {
                raw.parse::<u8>()
                    .map_err(|_| DeviceError::invalid_command("color", "RGB values must be 0-255"))
            };
            ConsoleInput::Command(Command::SetColor(Rgb::new(
                channel(*r)?,
                channel(*g)?,
                channel(*b)?,
            )))
        }
        ("color", _) => return Err(usage("color <r> <g> <b>")),
        ("status", []) => ConsoleInput::Command(Command::GetStatus),
        ("files", []) => ConsoleInput::Command(Command::ListFiles),
        ("transfer", []) => ConsoleInput::Command(Command::ForceTransfer),
        ("reset", []) => ConsoleInput::Command(Command::Reset),
        ("help", _) => ConsoleInput::Help,
        ("quit" | "exit", _) => ConsoleInput::Quit,
        _ => {
            return Err(DeviceError::invalid_command(
                cmd,
                "unknown command, type 'help' for the list",
            ))
        }
    };

    Ok(Some(input))
}

pub fn render_status(status: &DeviceStatus) -> String {
    let yes_no = |flag: bool| if flag { "YES" } else { "NO" };
    let mut out = String::new();
    let _ = writeln!(out, "State:           {}", status.state);
    let _ = writeln!(out, "Selected sensor: {}", status.selected_sensor);
    let _ = writeln!(
        out,
        "Cap:             {}",
        if status.sensors.cap_open { "OPEN" } else { "CLOSED" }
    );
    let _ = writeln!(
        out,
        "Tilt:            {}",
        if status.sensors.tilted { "TILTED" } else { "UPRIGHT" }
    );
    let _ = writeln!(out, "Selector:        {} / {}", status.sensors.selector, MAX_SELECTOR);
    let _ = writeln!(out, "Color RGB:       {}", status.sensors.color);
    let _ = writeln!(out, "Has audio:       {}", yes_no(status.has_audio));
    let _ = writeln!(out, "Has color:       {}", yes_no(status.has_color));
    let _ = writeln!(out, "Can pour:        {}", yes_no(status.can_pour));
    let _ = write!(out, "Transfer fails:  {}", status.transfer_failures);
    out
}

pub fn render_files(files: &[StoredFile]) -> String {
    if files.is_empty() {
        return "(no files)".to_string();
    }
    files
        .iter()
        .map(|f| format!("{:20} {:>10} bytes", f.name, f.size))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Read commands from stdin until EOF or `quit`
pub async fn run(handle: DeviceHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Memory bottle console. Type 'help' for commands.");

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let input = match parse_line(&line) {
            Ok(Some(input)) => input,
            Ok(None) => continue,
            Err(e) => {
                println!("> {e}");
                continue;
            }
        };

        let command = match input {
            ConsoleInput::Help => {
                println!("{HELP}");
                continue;
            }
            ConsoleInput::Quit => {
                info!("quit requested from console");
                return Ok(());
            }
            ConsoleInput::Command(command) => command,
        };

        match handle.execute(command).await {
            Ok(Reply::Status(status)) => println!("{}", render_status(&status)),
            Ok(Reply::Files(files)) => println!("{}", render_files(&files)),
            Err(DeviceError::Unavailable) => return Ok(()),
            Err(e) => println!("> {e}"),
        }
    }

    Ok(())
}
