//! Interactive REPL for ringkv.
//!
//! Uses rustyline for line editing, history and tab-completion. Each
//! line is parsed locally so malformed requests never leave the client,
//! then routed through the ring-aware [`Client`].

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use colored::Colorize;
use ringkv_cluster::Endpoint;
use ringkv_protocol::{Command, ProtocolError, Reply};
use rustyline::completion::{Completer, Pair};
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{CompletionType, Config, Context, Editor, Helper};

use crate::client::Client;
use crate::format::format_reply;

/// Server commands with their argument synopsis.
const COMMANDS: &[(&str, &str, &str)] = &[
    ("put", "<user> <key> <value>", "store or update a value"),
    ("get", "<key>", "read a value"),
    ("delete", "<user> <key>", "remove a key you own"),
    ("keyrange", "", "show which node owns which range"),
    ("keyrange_read", "", "show ranges including replicas"),
];

/// Commands the REPL handles without contacting a node.
const LOCAL_COMMANDS: &[(&str, &str, &str)] = &[
    ("connect", "<host> <port>", "switch to another bootstrap node"),
    ("help", "", "show this list"),
    ("clear", "", "clear the screen"),
    ("quit", "", "leave the REPL"),
];

/// Runs the interactive REPL loop.
///
/// Blocks the calling thread. Uses `tokio::runtime::Runtime` internally
/// because rustyline needs the main thread for terminal I/O.
pub fn run_repl(host: &str, port: u16, retries: u32, timeout: Duration) {
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}", format!("failed to create runtime: {e}").red());
            return;
        }
    };

    let mut client = Client::new(Endpoint::new(host, port), retries, timeout);

    let config = Config::builder()
        .completion_type(CompletionType::List)
        .build();

    let mut rl = match Editor::with_config(config) {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("{}", format!("failed to create editor: {e}").red());
            return;
        }
    };
    rl.set_helper(Some(RingkvHelper));

    let history_path = history_file();
    if let Some(ref path) = history_path {
        let _ = rl.load_history(path);
    }

    loop {
        let prompt = format!("{}> ", client.seed());
        match rl.readline(&prompt) {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(trimmed);

                let mut words = trimmed.split_whitespace();
                let first = words.next().unwrap_or("").to_lowercase();
                match first.as_str() {
                    "quit" | "exit" => break,
                    "clear" => {
                        print!("\x1B[2J\x1B[1;1H");
                        let _ = std::io::stdout().flush();
                        continue;
                    }
                    "help" => {
                        print_help();
                        continue;
                    }
                    "connect" => {
                        match parse_endpoint(words.next(), words.next()) {
                            Some(seed) => {
                                rt.block_on(client.reseed(seed));
                                println!("{}", format!("using {}", client.seed()).green());
                            }
                            None => eprintln!("{}", "usage: connect <host> <port>".red()),
                        }
                        continue;
                    }
                    _ => {}
                }

                let cmd = match Command::parse(trimmed) {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        print_parse_error(&e);
                        continue;
                    }
                };

                match rt.block_on(client.execute(&cmd)) {
                    Ok(reply) => println!("{}", format_reply(&reply)),
                    Err(e) => eprintln!("{}", format!("error: {e}").red()),
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}", format!("readline error: {e}").red());
                break;
            }
        }
    }

    if let Some(ref path) = history_path {
        let _ = rl.save_history(path);
    }

    rt.block_on(client.close());
}

fn parse_endpoint(host: Option<&str>, port: Option<&str>) -> Option<Endpoint> {
    let port = port?.parse().ok()?;
    Some(Endpoint::new(host?, port))
}

fn print_parse_error(e: &ProtocolError) {
    match e {
        ProtocolError::Empty => {}
        ProtocolError::TooLong(_) => println!("{}", format_reply(&Reply::from(e))),
        other => eprintln!("{} {other}. try 'help'.", "(error)".red()),
    }
}

fn print_help() {
    println!("{}", "ringkv commands:".bold());
    for (name, args, summary) in COMMANDS.iter().chain(LOCAL_COMMANDS) {
        println!("  {:<14} {:<22} {}", name, args, summary.dimmed());
    }
}

/// Returns the path to the history file.
fn history_file() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ringkv_history"))
}

struct RingkvHelper;

impl Helper for RingkvHelper {}

impl Completer for RingkvHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        let prefix = &line[..pos];
        // only the command name is completed
        if prefix.contains(' ') {
            return Ok((pos, vec![]));
        }
        let lower = prefix.to_lowercase();
        let matches = COMMANDS
            .iter()
            .chain(LOCAL_COMMANDS)
            .filter(|(name, _, _)| name.starts_with(&lower))
            .map(|(name, _, _)| Pair {
                display: name.to_string(),
                replacement: format!("{name} "),
            })
            .collect();
        Ok((0, matches))
    }
}

impl Hinter for RingkvHelper {
    type Hint = String;

    /// Shows the argument synopsis once a full command name is typed.
    fn hint(&self, line: &str, pos: usize, _ctx: &Context<'_>) -> Option<String> {
        if pos != line.len() || !line.ends_with(' ') || line.trim().contains(' ') {
            return None;
        }
        let name = line.trim();
        COMMANDS
            .iter()
            .chain(LOCAL_COMMANDS)
            .find(|(n, _, _)| *n == name)
            .filter(|(_, args, _)| !args.is_empty())
            .map(|(_, args, _)| args.to_string())
    }
}

impl Highlighter for RingkvHelper {}

impl Validator for RingkvHelper {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_arguments() {
        assert_eq!(
            parse_endpoint(Some("10.0.0.1"), Some("5002")),
            Some(Endpoint::new("10.0.0.1", 5002))
        );
        assert_eq!(parse_endpoint(Some("10.0.0.1"), Some("port")), None);
        assert_eq!(parse_endpoint(Some("10.0.0.1"), None), None);
    }

    #[test]
    fn every_command_in_help_parses() {
        for (name, args, _) in COMMANDS {
            let line = format!("{name} {}", args.replace(['<', '>'], ""));
            assert!(Command::parse(&line).is_ok(), "'{line}' should parse");
        }
    }
}
