//! Pretty-printing for server replies.

use colored::Colorize;
use ringkv_cluster::parse_client_snapshot;
use ringkv_protocol::Reply;

/// Formats a reply for terminal display.
///
/// - successes: green
/// - per-key errors: red with `(error)` prefix
/// - server state replies: yellow
/// - key ranges: one line per entry
pub fn format_reply(reply: &Reply) -> String {
    match reply {
        Reply::PutSuccess(key) => format!("{} {}", "stored".green(), sanitize(key)),
        Reply::PutUpdate(key) => format!("{} {}", "updated".green(), sanitize(key)),
        Reply::DeleteSuccess(key) => format!("{} {}", "deleted".green(), sanitize(key)),
        Reply::GetSuccess { value, .. } => format!("\"{}\"", sanitize(value)).green().to_string(),
        Reply::PutError { key, msg } | Reply::GetError { key, msg } | Reply::DeleteError { key, msg } => {
            format!("{} {}: {}", "(error)".red(), sanitize(key), sanitize(msg).red())
        }
        Reply::KeyrangeSuccess(text) | Reply::KeyrangeReadSuccess(text) => format_ranges(text),
        Reply::NotResponsible => "(server not responsible)".yellow().to_string(),
        Reply::WriteLock => "(server write-locked, try again later)".yellow().to_string(),
        Reply::Stopped => "(server stopped)".yellow().to_string(),
        Reply::Error(msg) => format!("{} {}", "(error)".red(), sanitize(msg).red()),
    }
}

fn format_ranges(text: &str) -> String {
    match parse_client_snapshot(text) {
        Ok(ranges) if ranges.is_empty() => "(empty ring)".dimmed().to_string(),
        Ok(ranges) => ranges
            .iter()
            .enumerate()
            .map(|(i, r)| {
                format!(
                    "{}) {} {} .. {}",
                    i + 1,
                    sanitize(&r.endpoint.to_string()).bold(),
                    r.start,
                    r.end
                )
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Err(_) => sanitize(text),
    }
}

/// Strips ANSI escape sequences and other control characters from
/// server-supplied strings.
fn sanitize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' {
            if let Some('[') = chars.next() {
                for c in chars.by_ref() {
                    if c.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
        } else if ch == '\t' || !ch.is_control() {
            out.push(ch);
        }
    }
    out
}
