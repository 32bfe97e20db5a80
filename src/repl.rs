//! Interactive REPL.

use crate::output;
use colored::Colorize;
use resplink_client::Client;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};

const HELP_TEXT: &str = r#"
Type any command with its arguments, e.g.:
  SET greeting "hello world"
  GET greeting
  HGETALL user:1

Arguments may be quoted with "..." or '...'.

  help                          Show this help
  quit, exit                    Exit the REPL

Use `resplink subscribe` / `resplink psubscribe` for pub/sub.
"#;

pub async fn run(
    client: &Client,
    addr: &str,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "resplink".bold().cyan());
    println!("{} {}", "Connected to".green(), addr);

    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".resplink_history"))
        .unwrap_or_else(|_| ".resplink_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for help.\n");

    loop {
        let prompt = format!("{} ", format!("{}>", addr).cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_command(client, line, json).await {
                    Ok(Some(output)) => println!("{}", output),
                    Ok(None) => break,
                    Err(e) => println!("{}: {}", "Error".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);

    let _ = client.close().await;
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

async fn execute_repl_command(
    client: &Client,
    line: &str,
    json: bool,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let args = split_args(line)?;
    let Some(first) = args.first() else {
        return Ok(Some(String::new()));
    };

    match first.to_lowercase().as_str() {
        "help" | "?" => Ok(Some(HELP_TEXT.to_string())),

        "quit" | "exit" | "q" => Ok(None),

        "subscribe" | "psubscribe" | "ssubscribe" | "monitor" => Ok(Some(
            format!("{} is not available in the REPL", first.to_uppercase())
                .yellow()
                .to_string(),
        )),

        _ => {
            let reply = client.send(&args).await?;
            if json {
                Ok(Some(serde_json::to_string_pretty(&output::to_json(&reply))?))
            } else {
                Ok(Some(output::render(&reply)))
            }
        }
    }
}

/// Splits a command line into arguments, honouring single and double quotes.
pub fn split_args(line: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else {
            return Ok(args);
        };

        let mut arg = String::new();
        if first == '"' || first == '\'' {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    c if c == first => {
                        closed = true;
                        break;
                    }
                    '\\' if first == '"' => match chars.next() {
                        Some('n') => arg.push('\n'),
                        Some('r') => arg.push('\r'),
                        Some('t') => arg.push('\t'),
                        Some(other) => arg.push(other),
                        None => break,
                    },
                    c => arg.push(c),
                }
            }
            if !closed {
                return Err("unbalanced quotes".to_string());
            }
            if chars.peek().is_some_and(|c| !c.is_whitespace()) {
                return Err("closing quote must be followed by a space".to_string());
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                arg.push(c);
                chars.next();
            }
        }
        args.push(arg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_plain() {
        assert_eq!(split_args("  SET  k v ").unwrap(), vec!["SET", "k", "v"]);
        assert!(split_args("   ").unwrap().is_empty());
    }

    #[test]
    fn test_split_quoted() {
        assert_eq!(
            split_args(r#"SET k "hello world" 'it''s'"#).err(),
            Some("closing quote must be followed by a space".to_string())
        );
        assert_eq!(
            split_args(r#"SET k "a \"b\"\n" 'c d'"#).unwrap(),
            vec!["SET", "k", "a \"b\"\n", "c d"]
        );
        assert_eq!(split_args(r#"SET k """#).unwrap(), vec!["SET", "k", ""]);
    }

    #[test]
    fn test_split_unbalanced() {
        assert!(split_args("GET \"oops").is_err());
    }
}
