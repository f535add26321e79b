//! GNU screen helpers
//!
//! Pure functions: remote command builders, capture normalization, the
//! line diff between two screen images, line sanitizing and command
//! validation. Nothing here touches the network.

/// Longest command accepted for injection, in bytes
pub const MAX_COMMAND_LEN: usize = 512;

/// Characters that would let a command escape `screen -X stuff`.
/// `^` and `\` are screen's own notations for control bytes (`^C`, `\033`).
const FORBIDDEN_CHARS: &[char] = &[
    '\n', '\r', ';', '|', '&', '`', '$', '(', ')', '<', '>', '^', '\\',
];

/// Marker screen prints when the target session does not exist
pub const NO_SESSION_MARKER: &str = "No screen session found";

/// `hytale-<server_id>` with anything outside `[A-Za-z0-9_-]` replaced by `-`
pub fn safe_session_name(server_id: &str) -> String {
    format!("hytale-{}", sanitize_identifier(server_id))
}

/// Replace anything outside `[A-Za-z0-9_-]` with `-`
pub(crate) fn sanitize_identifier(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Attach for a tenth of a second, print the screen, detach
pub fn capture_command(target: &str) -> String {
    format!("timeout 0.1 screen -r {} || true", target)
}

/// Reattach with empty input so screen redraws at the caller's PTY width
pub fn resize_script(target: &str) -> String {
    format!("export TERM=xterm\nscreen -r {} <<EOF\n\nEOF\n", target)
}

pub const LIST_COMMAND: &str = "screen -list";

/// `screen -S <name> -X stuff "<text>\n"` with double quotes escaped
pub fn stuff_command(session: &str, text: &str) -> String {
    format!(
        "screen -S {} -X stuff \"{}\\n\"",
        session,
        text.replace('"', "\\\"")
    )
}

/// Single-quote for bash. Embedded `'` becomes `'"'"'`.
pub fn bash_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    format!("'{}'", value.replace('\'', "'\"'\"'"))
}

/// Double-quote for bash, escaping `\` and `"`
pub fn bash_double_quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// Run `cmd` as `user` through a non-interactive login shell
pub fn wrap_run_as(user: &str, cmd: &str) -> String {
    format!(
        "sudo -n -i -u {} bash -lc {}",
        bash_quote(user),
        bash_double_quote(cmd)
    )
}

/// Pick the live session id (`<pid>.<name>`) for `name` out of `screen -list` output
pub fn parse_screen_list(output: &str, name: &str) -> Option<String> {
    let suffix = format!(".{}", name);
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .find(|id| id.ends_with(&suffix))
        .map(str::to_string)
}

/// Turn raw capture output into screen lines
///
/// Trailing CR/LF is dropped, remaining CRs removed, then split on LF.
/// An empty capture yields no lines.
pub fn normalize_screen(output: &str) -> Vec<String> {
    let trimmed = output.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed.replace('\r', "").split('\n').map(str::to_string).collect()
}

/// How a new screen image relates to the previous one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScreenDiff {
    /// Identical image
    Unchanged,
    /// Previous image is a prefix of the new one; carries the suffix
    Appended(Vec<String>),
    /// Content scrolled; carries everything after the previous last line
    Scrolled(Vec<String>),
    /// No anchor found (screen cleared or redrawn); nothing is emitted
    Redrawn,
}

impl ScreenDiff {
    /// Lines to emit for this tick
    pub fn new_lines(&self) -> &[String] {
        match self {
            ScreenDiff::Appended(lines) | ScreenDiff::Scrolled(lines) => lines,
            ScreenDiff::Unchanged | ScreenDiff::Redrawn => &[],
        }
    }

    pub fn into_new_lines(self) -> Vec<String> {
        match self {
            ScreenDiff::Appended(lines) | ScreenDiff::Scrolled(lines) => lines,
            ScreenDiff::Unchanged | ScreenDiff::Redrawn => Vec::new(),
        }
    }
}

/// Diff two screen images
///
/// An empty previous image counts as a prefix of anything, so the first
/// capture emits the whole screen.
pub fn diff_screen(prev: &[String], next: &[String]) -> ScreenDiff {
    if prev == next {
        return ScreenDiff::Unchanged;
    }

    if next.len() >= prev.len() && next[..prev.len()] == *prev {
        return ScreenDiff::Appended(next[prev.len()..].to_vec());
    }

    let Some(anchor) = prev.last() else {
        return ScreenDiff::Appended(next.to_vec());
    };

    match next.iter().rposition(|line| line == anchor) {
        Some(idx) => ScreenDiff::Scrolled(next[idx + 1..].to_vec()),
        None => ScreenDiff::Redrawn,
    }
}

/// Strip ANSI/VT100 sequences and control characters except tab
pub fn sanitize_line(line: &str) -> String {
    if line.is_empty() {
        return String::new();
    }
    // The stripper drops tabs along with other C0 controls, so strip per segment
    let stripped = line
        .split('\t')
        .map(strip_ansi_escapes::strip_str)
        .collect::<Vec<_>>()
        .join("\t");
    stripped
        .chars()
        .filter(|&c| c == '\t' || !c.is_control())
        .collect()
}

/// Why a command was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandRejection {
    #[error("command is empty")]
    Empty,

    #[error("command is too long ({len} > {MAX_COMMAND_LEN} bytes)")]
    TooLong { len: usize },

    #[error("command contains forbidden character {0:?}")]
    ForbiddenChar(char),

    #[error("command contains escape sequences or control characters")]
    ControlSequence,
}

/// Validate a trimmed command for injection through `screen -X stuff`
pub fn validate_command(command: &str) -> Result<&str, CommandRejection> {
    if command.is_empty() {
        return Err(CommandRejection::Empty);
    }
    if command.len() > MAX_COMMAND_LEN {
        return Err(CommandRejection::TooLong { len: command.len() });
    }
    if let Some(c) = command.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(CommandRejection::ForbiddenChar(c));
    }
    if command.chars().any(|c| c.is_control() && c != '\t') {
        return Err(CommandRejection::ControlSequence);
    }
    Ok(command)
}
