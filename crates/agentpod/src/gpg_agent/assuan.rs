//! Assuan line handling for the GPG agent proxy.
//!
//! Only the parts the filter needs: line framing, command classification,
//! the two error lines the proxy synthesizes, and recognition of
//! `S KEYINFO` status lines in agent responses.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::allowlist::AllowList;

/// Longest line accepted from either side, newline included.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Sent for key commands naming a keygrip outside the allow-list.
pub const ERR_NO_SECRET_KEY: &[u8] = b"ERR 67108881 No secret key <GPG Agent>\n";

/// Sent for commands that are never allowed while filtering.
pub const ERR_FORBIDDEN: &[u8] = b"ERR 67109115 Forbidden <GPG Agent>\n";

/// Commands whose positional arguments are all keygrips.
const KEY_COMMANDS: &[&str] = &["HAVEKEY", "KEYINFO", "READKEY", "SIGKEY", "SETKEY"];

/// Commands naming a keygrip first, followed by other arguments.
const LEADING_KEY_COMMANDS: &[&str] = &["KEYATTR"];

/// Commands that export, create or alter keys, or reach the smartcard
/// daemon behind the allow-list's back.
const FORBIDDEN_COMMANDS: &[&str] = &[
    "EXPORT_KEY",
    "DELETE_KEY",
    "IMPORT_KEY",
    "GENKEY",
    "PASSWD",
    "PRESET_PASSPHRASE",
    "KEYWRAP_KEY",
    "KEYTOCARD",
    "SCD",
    "LEARN",
];

/// Read one `\n`-terminated line, keeping the terminator.
///
/// A final line without a terminator is returned as-is. `Ok(None)` means
/// clean EOF. Lines longer than `max` fail with `InvalidData`.
pub async fn read_line<R>(reader: &mut R, max: usize) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if line.is_empty() { None } else { Some(line) });
        }

        let (chunk, complete) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (&available[..=i], true),
            None => (available, false),
        };
        if line.len() + chunk.len() > max {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("assuan line exceeds {max} bytes"),
            ));
        }
        line.extend_from_slice(chunk);
        let consumed = chunk.len();
        reader.consume(consumed);

        if complete {
            return Ok(Some(line));
        }
    }
}

/// What to do with a client line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Forward,
    /// Answer locally with this line; nothing reaches the agent.
    Reject(&'static [u8]),
}

/// A command line split into its upper-cased name and arguments.
#[derive(Debug, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

impl Command {
    pub fn parse(line: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(line);
        let mut parts = text.split_ascii_whitespace();
        let name = parts.next()?.to_ascii_uppercase();
        Some(Self {
            name,
            args: parts.map(str::to_string).collect(),
        })
    }

    fn options(&self) -> impl Iterator<Item = &str> {
        self.args
            .iter()
            .map(String::as_str)
            .filter(|a| a.starts_with("--"))
    }

    /// Non-option arguments with any `&` prefix removed.
    pub fn keygrips(&self) -> Vec<&str> {
        self.args
            .iter()
            .map(String::as_str)
            .filter(|a| !a.starts_with("--"))
            .map(|a| a.strip_prefix('&').unwrap_or(a))
            .collect()
    }

    fn lists_keys(&self) -> bool {
        self.options().any(|o| o.starts_with("--list") || o == "--ssh-list")
    }

    fn has_option(&self, name: &str) -> bool {
        self.options().any(|o| o == name)
    }
}

/// Decide whether a client line may be forwarded under `allow`.
///
/// Inquire data (`D`, `END`, `CAN`), comments and commands that do not name
/// a key are always forwarded.
pub fn check_command(line: &[u8], allow: &AllowList) -> Verdict {
    if allow.is_passthrough() {
        return Verdict::Forward;
    }
    let Some(cmd) = Command::parse(line) else {
        return Verdict::Forward;
    };

    let name = cmd.name.as_str();
    if FORBIDDEN_COMMANDS.contains(&name) {
        return Verdict::Reject(ERR_FORBIDDEN);
    }
    if LEADING_KEY_COMMANDS.contains(&name) {
        return match cmd.keygrips().first() {
            Some(grip) if allow.matches(grip) => Verdict::Forward,
            _ => Verdict::Reject(ERR_NO_SECRET_KEY),
        };
    }
    if !KEY_COMMANDS.contains(&name) {
        return Verdict::Forward;
    }

    if cmd.lists_keys() {
        // Only `S KEYINFO` status lines are filtered on the way back, so a
        // listing returned as data lines cannot be allowed. HAVEKEY --list
        // would reveal every grip the agent holds.
        return if name == "KEYINFO" && !cmd.has_option("--data") {
            Verdict::Forward
        } else {
            Verdict::Reject(ERR_FORBIDDEN)
        };
    }

    let grips = cmd.keygrips();
    if !grips.is_empty() && grips.iter().all(|g| allow.matches(g)) {
        Verdict::Forward
    } else {
        Verdict::Reject(ERR_NO_SECRET_KEY)
    }
}

/// Keygrip named by an `S KEYINFO <grip> ...` status line.
pub fn keyinfo_status_grip(line: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(line);
    let mut parts = text.split_ascii_whitespace();
    if parts.next()? != "S" || parts.next()? != "KEYINFO" {
        return None;
    }
    parts.next().map(str::to_string)
}

/// Whether an agent response line may reach the client under `allow`.
pub fn response_allowed(line: &[u8], allow: &AllowList) -> bool {
    match keyinfo_status_grip(line) {
        Some(grip) => allow.matches(&grip),
        None => true,
    }
}
