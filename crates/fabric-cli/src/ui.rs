//! Terminal output for `fabric` subcommands.
//!
//! Command results go to stdout; failures go to stderr so `fabric encode`
//! output stays pipeable.

use colored::Colorize;

/// Peer event that grew the mesh: a handshake or an opened socket.
pub fn event_ok(msg: &str) {
    println!("  {} {}", "+".bright_green().bold(), msg);
}

/// Peer event that shrank it: a closed socket or skipped events.
pub fn event_warn(msg: &str) {
    println!("  {} {}", "-".bright_yellow().bold(), msg.yellow());
}

/// A dial or connection that failed with an error.
pub fn event_fail(msg: &str) {
    println!("  {} {}", "!".bright_red().bold(), msg.bright_red());
}

/// Command-level outcome: node started, message sent.
pub fn success(msg: &str) {
    println!("  {} {}", "\u{2714}".bright_green(), msg);
}

/// Fatal command error, on stderr.
pub fn error(msg: &str) {
    eprintln!("  {} {}", "\u{2718}".bright_red(), msg.bright_red());
}

/// Brand banner: ">> Fabric"
pub fn banner() {
    println!("  {} {}", ">>".bright_cyan().bold(), "Fabric".bold());
    println!("     {}", "Peer-to-peer overlay node".dimmed());
}

/// Heading above a block of `kv` lines.
pub fn section(title: &str) {
    println!("  {} {}", ">>".bright_cyan().bold(), title.bold());
}

/// Aligned field line, e.g. a decoded header field or a received message.
pub fn kv(label: &str, value: &str) {
    println!("  {:<13}{}", format!("{label}:"), value);
}

/// Field that checked out (hash matches).
pub fn kv_ok(label: &str, value: &str) {
    println!("  {:<13}{}", format!("{label}:"), value.bright_green());
}

/// Field worth a second look (hash mismatch, trailing bytes).
pub fn kv_warn(label: &str, value: &str) {
    println!("  {:<13}{}", format!("{label}:"), value.bright_yellow());
}

/// Dimmed operator hint.
pub fn hint(msg: &str) {
    println!("  {} {}", "hint:".dimmed(), msg.dimmed());
}

/// Fatal error with the likely remedy.
pub fn error_with_fix(msg: &str, fix: &str) {
    eprintln!("  {} {}", "\u{2718}".bright_red(), msg.bright_red());
    eprintln!("    {} {}", "fix:".bright_yellow(), fix);
}

/// Non-fatal warning with a suggestion.
pub fn warn_with_fix(msg: &str, fix: &str) {
    eprintln!("  {} {}", "-".bright_yellow(), msg.yellow());
    eprintln!("    {} {}", "try:".bright_yellow(), fix);
}

pub fn blank() {
    println!();
}
