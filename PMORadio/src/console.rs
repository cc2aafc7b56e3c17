//! Commandes ligne par ligne lues sur l'entrée standard.

use anyhow::{Result, anyhow, bail};
use pmoplayer::OutputDevice;

#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Play(String),
    Pause,
    Resume,
    Stop,
    Volume(i64),
    Device(OutputDevice),
    Status,
    Quit,
}

/// Parses one console line. Blank lines and `#` comments yield `None`.
pub fn parse(line: &str) -> Result<Option<ConsoleCommand>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or_default().to_lowercase();
    let rest: Vec<&str> = words.collect();

    let command = match (verb.as_str(), rest.as_slice()) {
        ("play", [url]) => ConsoleCommand::Play(url.to_string()),
        ("play", _) => bail!("usage: play <url>"),
        ("pause", []) => ConsoleCommand::Pause,
        ("resume", []) => ConsoleCommand::Resume,
        ("stop", []) => ConsoleCommand::Stop,
        ("volume", [value]) => ConsoleCommand::Volume(
            value
                .parse()
                .map_err(|_| anyhow!("invalid volume '{}'", value))?,
        ),
        ("volume", _) => bail!("usage: volume <0-100>"),
        ("device", args) => ConsoleCommand::Device(parse_device(args)?),
        ("status", []) => ConsoleCommand::Status,
        ("quit" | "exit", []) => ConsoleCommand::Quit,
        (other, _) => bail!("unknown command '{}'", other),
    };
    Ok(Some(command))
}

fn parse_device(args: &[&str]) -> Result<OutputDevice> {
    match args {
        ["local"] => Ok(OutputDevice::local()),
        ["bluetooth", name @ ..] if !name.is_empty() => Ok(OutputDevice::bluetooth(name.join(" "))),
        ["airplay", name, target] => {
            let (address, port) = match target.rsplit_once(':') {
                Some((address, port)) => (
                    address,
                    Some(
                        port.parse::<u16>()
                            .map_err(|_| anyhow!("invalid port '{}'", port))?,
                    ),
                ),
                None => (*target, None),
            };
            Ok(OutputDevice::airplay(*name, address, port))
        }
        _ => bail!("usage: device local | bluetooth <name> | airplay <name> <address>[:<port>]"),
    }
}
