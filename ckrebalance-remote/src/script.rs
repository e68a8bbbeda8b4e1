//! Remote command wrapping
//!
//! A command sent over SSH is prefixed with an `echo` of a unique marker so
//! that login banners, locale noise and sudo prompts printed before the real
//! output can be cut away. When escalation is needed every `;`-separated
//! sub-command is prefixed with `sudo`, so sub-commands must not contain a
//! literal `;` of their own.

use ckrebalance_core::SUPERUSER;
use uuid::Uuid;

/// Start of the prompt sudo prints on a terminal
pub const SUDO_PROMPT_PREFIX: &str = "[sudo] password for ";

/// Keeps the sudo prompt in English so it can be recognised
const FORCE_ENGLISH_LOCALE: &str = "export LANG=en_US.UTF-8";

const REDACTED: &str = "******";

/// Whether `line` is (the start of) a sudo password prompt
pub fn is_sudo_prompt(line: &str) -> bool {
    let line = line.trim_start_matches('\r');
    line.starts_with(SUDO_PROMPT_PREFIX) && line.ends_with(": ")
}

/// Whether commands for `user` must be run through sudo
pub fn needs_sudo(user: &str, need_sudo: bool) -> bool {
    need_sudo && user != SUPERUSER
}

/// Prefix every `;`-separated sub-command with `sudo`
pub fn escalate(cmd: &str) -> String {
    cmd.split(';')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(|c| format!("sudo {}", c))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A command ready to be sent to a remote shell
#[derive(Debug, Clone)]
pub struct Script {
    marker: String,
    text: String,
}

impl Script {
    /// Wrap `cmd` with a fresh marker
    pub fn wrap(user: &str, cmd: &str, need_sudo: bool) -> Self {
        let marker = format!("ckrebalance-{}", Uuid::new_v4().simple());
        Self::with_marker(marker, user, cmd, need_sudo)
    }

    /// Wrap `cmd` with a caller-chosen marker
    pub fn with_marker(marker: impl Into<String>, user: &str, cmd: &str, need_sudo: bool) -> Self {
        let marker = marker.into();
        let shell = if needs_sudo(user, need_sudo) {
            format!("{}; {}", FORCE_ENGLISH_LOCALE, escalate(cmd))
        } else {
            cmd.to_string()
        };
        let text = format!("echo '{}'; {}", marker, shell);
        Self { marker, text }
    }

    /// The full text to execute
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The marker echoed ahead of the command's own output
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Extract the command's own output from everything the session printed.
    ///
    /// Keeps only text after the marker, drops sudo prompt lines (including
    /// a trailing unanswered one) and redacts `password` wherever it shows up.
    pub fn isolate_output(&self, raw: &str, password: &str) -> String {
        let after_marker = match raw.find(&self.marker) {
            Some(idx) => &raw[idx + self.marker.len()..],
            None => raw,
        };

        let mut lines: Vec<&str> = Vec::new();
        for line in after_marker.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.trim_start().starts_with(SUDO_PROMPT_PREFIX) {
                continue;
            }
            lines.push(line);
        }

        let mut output = lines.join("\n").trim().to_string();
        if !password.is_empty() && output.contains(password) {
            output = output.replace(password, REDACTED);
        }
        output
    }
}
