//! Intent classification for commands and their failures.
//!
//! The sandbox gives no structured signal about what a command is or why it
//! failed, so both are recognized by substring. All recognized markers live in
//! the tables below; nothing else in the crate matches on command text.

/// What a shell action is, decided from its text alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Starts a dev server that keeps running; tracked by readiness polling.
    Background,
    /// Installs dependencies; runs with the long timeout and speed flags.
    Install,
    Plain,
}

/// Why a foreground command raised, decided from the error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Package-manager noise surfaced as a non-zero exit.
    Benign,
    Timeout,
    Genuine,
}

/// First match wins, so background markers take precedence over install.
const COMMAND_TABLE: &[(&str, CommandKind)] = &[
    ("npm run dev", CommandKind::Background),
    ("npm start", CommandKind::Background),
    ("npm install", CommandKind::Install),
];

/// Matched against the lowercased error text, first match wins.
const FAILURE_TABLE: &[(&str, FailureKind)] = &[
    ("exit code -1", FailureKind::Benign),
    ("npm warn", FailureKind::Benign),
    ("deprecated", FailureKind::Benign),
    ("exited with code -1", FailureKind::Benign),
    ("timeout", FailureKind::Timeout),
    ("deadline exceeded", FailureKind::Timeout),
];

/// Tokens in a launch error that mean the server could not bind its address.
const BINDING_ERROR_MARKERS: &[&str] = &["getaddrinfo", "eaddrnotavail"];

/// Shown when a dev server fails to launch because of address binding.
pub const HOST_BINDING_DIAGNOSTIC: &str =
    "Network binding error - ensure Next.js is configured with --hostname 0.0.0.0";

const INSTALL_INVOCATION: &str = "npm install";

/// Flags appended to installs, keyed by the prefix that marks them as present.
const INSTALL_FLAGS: &[(&str, &str)] = &[
    ("--legacy-peer-deps", "--legacy-peer-deps"),
    ("--no-audit", "--no-audit"),
    ("--no-fund", "--no-fund"),
    ("--prefer-offline", "--prefer-offline"),
    ("--loglevel", "--loglevel=error"),
];

pub fn classify_command(command: &str) -> CommandKind {
    COMMAND_TABLE
        .iter()
        .find(|(marker, _)| command.contains(marker))
        .map_or(CommandKind::Plain, |(_, kind)| *kind)
}

pub fn is_background(command: &str) -> bool {
    classify_command(command) == CommandKind::Background
}

pub fn classify_failure(error_text: &str) -> FailureKind {
    let lowered = error_text.to_lowercase();
    FAILURE_TABLE
        .iter()
        .find(|(marker, _)| lowered.contains(marker))
        .map_or(FailureKind::Genuine, |(_, kind)| *kind)
}

pub fn is_binding_error(error_text: &str) -> bool {
    let lowered = error_text.to_lowercase();
    BINDING_ERROR_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Rewrites a dependency install to skip audit/fund, quiet the log, prefer the
/// cache and relax peer-dependency resolution. Flags already present are kept
/// as written and not repeated.
pub fn optimize_install_command(command: &str) -> String {
    if !command.contains(INSTALL_INVOCATION) {
        return command.to_string();
    }

    let missing: Vec<&str> = INSTALL_FLAGS
        .iter()
        .filter(|(present, _)| !command.contains(present))
        .map(|(_, flag)| *flag)
        .collect();
    if missing.is_empty() {
        return command.to_string();
    }

    command.replace(
        INSTALL_INVOCATION,
        &format!("{INSTALL_INVOCATION} {}", missing.join(" ")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_server_commands_are_background() {
        assert_eq!(classify_command("npm run dev"), CommandKind::Background);
        assert_eq!(classify_command("cd app && npm start -- --port 3000"), CommandKind::Background);
        assert_eq!(classify_command("npm install"), CommandKind::Install);
        assert_eq!(classify_command("npx tsc --noEmit"), CommandKind::Plain);
        assert!(!is_background("npm install"));
    }

    #[test]
    fn test_install_then_dev_is_background() {
        assert_eq!(classify_command("npm install && npm run dev"), CommandKind::Background);
    }

    #[test]
    fn test_failure_classes() {
        assert_eq!(classify_failure("npm WARN deprecated inflight@1.0.6"), FailureKind::Benign);
        assert_eq!(classify_failure("Command exited with code -1 and error:\n"), FailureKind::Benign);
        assert_eq!(
            classify_failure("command timeout after 600s: deadline exceeded"),
            FailureKind::Timeout
        );
        assert_eq!(classify_failure("Context Deadline Exceeded"), FailureKind::Timeout);
        assert_eq!(
            classify_failure("Command exited with code 1 and error:\nsh: tsc: not found"),
            FailureKind::Genuine
        );
    }

    #[test]
    fn test_benign_markers_win_over_timeout() {
        assert_eq!(classify_failure("npm warn: request timeout, retrying"), FailureKind::Benign);
    }

    #[test]
    fn test_binding_errors() {
        assert!(is_binding_error("Error: getaddrinfo ENOTFOUND sandbox"));
        assert!(is_binding_error("listen EADDRNOTAVAIL: address not available"));
        assert!(!is_binding_error("EACCES: permission denied"));
    }

    #[test]
    fn test_install_gets_speed_flags() {
        assert_eq!(
            optimize_install_command("npm install"),
            "npm install --legacy-peer-deps --no-audit --no-fund --prefer-offline --loglevel=error"
        );
    }

    #[test]
    fn test_install_keeps_existing_flags() {
        let rewritten = optimize_install_command("npm install --loglevel=warn --no-audit");
        assert_eq!(
            rewritten,
            "npm install --legacy-peer-deps --no-fund --prefer-offline --loglevel=warn --no-audit"
        );
        assert_eq!(optimize_install_command(&rewritten), rewritten);
    }

    #[test]
    fn test_non_install_untouched() {
        assert_eq!(optimize_install_command("npm run build"), "npm run build");
    }
}
