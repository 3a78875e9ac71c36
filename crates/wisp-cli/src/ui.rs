//! Terminal output helpers.

use std::io::{self, Write};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

const BOX_WIDTH: usize = 41;

/// A formatted box for displaying a share code.
pub struct CodeBox<'a> {
    code: &'a str,
    url: Option<&'a str>,
    password: Option<&'a str>,
}

impl<'a> CodeBox<'a> {
    /// Create a new code box.
    #[must_use]
    pub const fn new(code: &'a str) -> Self {
        Self {
            code,
            url: None,
            password: None,
        }
    }

    /// Show the share URL under the code.
    #[must_use]
    pub const fn with_url(mut self, url: &'a str) -> Self {
        self.url = Some(url);
        self
    }

    /// Show the session password.
    #[must_use]
    pub const fn with_password(mut self, password: Option<&'a str>) -> Self {
        self.password = password;
        self
    }

    /// Display the code box to stdout.
    pub fn display(&self) {
        let code_line = format!("Code:  {}", format_code_spaced(self.code));

        println!("  ┌{}┐", "─".repeat(BOX_WIDTH));
        println!("  │{}│", " ".repeat(BOX_WIDTH));
        println!("  │{}│", center_in_box(&code_line, BOX_WIDTH));

        if let Some(password) = self.password {
            let line = format!("Password:  {password}");
            println!("  │{}│", center_in_box(&line, BOX_WIDTH));
        }

        println!("  │{}│", " ".repeat(BOX_WIDTH));

        if let Some(url) = self.url {
            println!("  │{}│", center_in_box(url, BOX_WIDTH));
            println!("  │{}│", " ".repeat(BOX_WIDTH));
        }

        println!("  └{}┘", "─".repeat(BOX_WIDTH));
    }
}

fn format_code_spaced(code: &str) -> String {
    code.chars()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn center_in_box(content: &str, width: usize) -> String {
    let content_len = content.chars().count();
    let padding = width.saturating_sub(content_len);
    let left = padding / 2;
    let right = padding - left;
    format!("{}{}{}", " ".repeat(left), content, " ".repeat(right))
}

/// Format a duration as "M:SS".
pub fn format_remaining(remaining: Duration) -> String {
    let total_secs = remaining.as_secs();
    format!("{}:{:02}", total_secs / 60, total_secs % 60)
}

/// Print the version banner.
pub fn banner() {
    println!();
    println!("Wisp v{}", wisp_core::VERSION);
    println!("{}", "-".repeat(37));
    println!();
}

/// Ask a question on stdout and read one trimmed line from stdin.
///
/// # Errors
///
/// Fails if stdin is closed.
pub async fn prompt(question: &str) -> Result<String> {
    print!("  {question} ");
    io::stdout().flush()?;

    let mut input = String::new();
    let mut reader = BufReader::new(tokio::io::stdin());
    if reader.read_line(&mut input).await? == 0 {
        bail!("stdin closed");
    }
    Ok(input.trim().to_string())
}

/// Parse a 1-based menu choice.
pub fn parse_choice(input: &str, count: usize) -> Option<usize> {
    let n: usize = input.trim().parse().ok()?;
    (1..=count).contains(&n).then(|| n - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_code_spaced() {
        assert_eq!(format_code_spaced("123456"), "1 2 3 4 5 6");
    }

    #[test]
    fn test_center_in_box() {
        assert_eq!(center_in_box("hello", 11), "   hello   ");
        assert_eq!(center_in_box("hi", 6), "  hi  ");
        assert_eq!(center_in_box("toolong", 3), "toolong");
    }

    #[test]
    fn test_format_remaining() {
        assert_eq!(format_remaining(Duration::from_secs(300)), "5:00");
        assert_eq!(format_remaining(Duration::from_secs(65)), "1:05");
        assert_eq!(format_remaining(Duration::from_secs(0)), "0:00");
    }

    #[test]
    fn test_parse_choice() {
        assert_eq!(parse_choice("1", 3), Some(0));
        assert_eq!(parse_choice(" 3 ", 3), Some(2));
        assert_eq!(parse_choice("0", 3), None);
        assert_eq!(parse_choice("4", 3), None);
        assert_eq!(parse_choice("x", 3), None);
    }
}
