//! Deterministic classification of shell commands.

use crate::core::types::CommandKind;

/// Programs that only inspect state.
const READ_ONLY_PROGRAMS: &[&str] = &[
    "cat", "cd", "command", "df", "diff", "dig", "du", "echo", "env", "file", "find", "free",
    "grep", "egrep", "head", "hostname", "hostnamectl", "id", "ip", "journalctl", "less", "ls",
    "lsb_release", "lsof", "netstat", "nslookup", "ping", "printenv", "ps", "pwd", "readlink",
    "realpath", "ss", "stat", "tail", "test", "top", "tree", "type", "uname", "uptime", "wc",
    "whereis", "which", "whoami", "[",
];

/// `program subcommand` pairs that only inspect state.
const READ_ONLY_SUBCOMMANDS: &[(&str, &str)] = &[
    ("apt", "list"),
    ("apt-cache", "policy"),
    ("apt-cache", "show"),
    ("brew", "list"),
    ("cargo", "metadata"),
    ("docker", "images"),
    ("docker", "info"),
    ("docker", "inspect"),
    ("docker", "logs"),
    ("docker", "ps"),
    ("docker", "version"),
    ("docker-compose", "config"),
    ("docker-compose", "logs"),
    ("docker-compose", "ps"),
    ("git", "branch"),
    ("git", "diff"),
    ("git", "log"),
    ("git", "remote"),
    ("git", "rev-parse"),
    ("git", "show"),
    ("git", "status"),
    ("kubectl", "describe"),
    ("kubectl", "get"),
    ("kubectl", "logs"),
    ("nginx", "-t"),
    ("npm", "list"),
    ("npm", "ls"),
    ("npm", "view"),
    ("pip", "freeze"),
    ("pip", "list"),
    ("pip", "show"),
    ("pip3", "list"),
    ("pip3", "show"),
    ("pm2", "list"),
    ("pm2", "logs"),
    ("pm2", "status"),
    ("service", "--status-all"),
    ("systemctl", "is-active"),
    ("systemctl", "is-enabled"),
    ("systemctl", "list-units"),
    ("systemctl", "status"),
];

/// Classify a command as diagnostic (read-only) or mutating.
///
/// Every segment of a pipeline or command list must be read-only, and no
/// output may be redirected into a file. Unknown programs are mutating.
pub fn classify_command(command: &str) -> CommandKind {
    if command.trim().is_empty() || writes_file(command) {
        return CommandKind::Mutating;
    }
    if split_segments(command).iter().all(|segment| is_read_only(segment)) {
        CommandKind::Diagnostic
    } else {
        CommandKind::Mutating
    }
}

/// Split on `&&`, `||`, `;` and `|`, ignoring separators inside quotes.
fn split_segments(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = command.chars().peekable();
    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), _) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), _) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                current.push(c);
            }
            (None, ';' | '|' | '&') => {
                if c == '&' && chars.peek() != Some(&'&') {
                    current.push(c);
                    continue;
                }
                if matches!(chars.peek(), Some('|' | '&')) {
                    chars.next();
                }
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    segments.push(current);
    segments
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn is_read_only(segment: &str) -> bool {
    let words = match shell_words::split(segment) {
        Ok(words) => words,
        Err(_) => segment.split_whitespace().map(str::to_string).collect(),
    };
    let mut words = words
        .iter()
        .map(String::as_str)
        .skip_while(|w| *w == "sudo" || is_assignment(w))
        .filter(|w| !w.starts_with("2>") && *w != "/dev/null");
    let Some(program) = words.next() else {
        return true;
    };
    let program = program.rsplit('/').next().unwrap_or(program);
    let rest: Vec<&str> = words.collect();

    if rest.iter().any(|w| matches!(*w, "--version" | "-v" | "-V" | "version"))
        && rest.len() == 1
    {
        return true;
    }
    if READ_ONLY_PROGRAMS.contains(&program) {
        return true;
    }
    let subcommand = rest.iter().find(|w| !w.starts_with('-') || w.starts_with("--status"));
    match subcommand {
        Some(sub) => READ_ONLY_SUBCOMMANDS
            .iter()
            .any(|(p, s)| *p == program && s == sub)
            || (program == "nginx" && rest.contains(&"-t")),
        None => false,
    }
}

fn is_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

/// True for `>`/`>>` redirections other than into `/dev/null` or another fd.
fn writes_file(command: &str) -> bool {
    let bytes = command.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'>' => {
                let mut j = i + 1;
                while j < bytes.len() && (bytes[j] == b'>' || bytes[j] == b' ') {
                    j += 1;
                }
                let target = &command[j..];
                let to_fd = target.starts_with('&');
                let to_null = target.starts_with("/dev/null");
                if !to_fd && !to_null {
                    return true;
                }
                i = j;
                continue;
            }
            None => {}
        }
        i += 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_probes_are_diagnostic() {
        for command in [
            "ls -la /srv/app",
            "cat package.json | grep version",
            "docker ps -a",
            "git status && git log -1",
            "sudo systemctl status nginx",
            "node --version",
            "which pm2 2>/dev/null || echo missing",
            "LANG=C df -h",
        ] {
            assert_eq!(
                classify_command(command),
                CommandKind::Diagnostic,
                "{command}"
            );
        }
    }

    #[test]
    fn state_changes_are_mutating() {
        for command in [
            "npm install",
            "sudo apt-get install -y nginx",
            "docker compose up -d",
            "git clone https://example.com/app.git",
            "echo 'PORT=3000' > .env",
            "cat a >> b",
            "ls && rm -rf build",
            "",
        ] {
            assert_eq!(classify_command(command), CommandKind::Mutating, "{command}");
        }
    }

    #[test]
    fn separators_inside_quotes_do_not_split() {
        assert_eq!(
            split_segments("echo 'a && b' ; ls"),
            vec!["echo 'a && b'".to_string(), "ls".to_string()]
        );
    }

    #[test]
    fn stderr_redirect_to_stdout_is_not_a_write() {
        assert_eq!(classify_command("docker logs app 2>&1 | tail -n 50"), CommandKind::Diagnostic);
    }
}
