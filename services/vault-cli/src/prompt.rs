//! Secret input for `auth set-password` and `auth set-secret`
//!
//! On a terminal the value is read without echo. Piped stdin is read as a
//! single line so scripts can feed values in.

use std::io::{BufRead, IsTerminal};

use anyhow::{Context, Result};

pub fn read_secret(prompt: &str) -> Result<String> {
    if std::io::stdin().is_terminal() {
        return rpassword::prompt_password(prompt).context("failed to read from terminal");
    }
    read_line(&mut std::io::stdin().lock())
}

/// One line with the trailing newline removed.
fn read_line(reader: &mut impl BufRead) -> Result<String> {
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .context("failed to read from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_owned())
}
