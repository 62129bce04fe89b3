//! Line-oriented front-end over [`Client`].
//!
//! Data commands are refused until the user has registered or logged in.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use crate::cli::ClientArgs;
use crate::client::Client;

const USAGE: &str = "commands:
  register/r <user> <password>
  login/l <user> <password>
  put/p <key> <value>
  get/g <key>
  mput <key> <value> [<key> <value> ...]
  mget <key> [<key> ...]
  getwhen/w <key> <cond-key> <cond-value>
  help/h
  quit/q";

#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Register { username: String, password: String },
    Login { username: String, password: String },
    Put { key: String, value: String },
    Get { key: String },
    MultiPut { pairs: Vec<(String, String)> },
    MultiGet { keys: Vec<String> },
    GetWhen {
        key: String,
        cond_key: String,
        cond_value: String,
    },
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parses one input line. Command words are case-insensitive.
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Err(anyhow!("empty command"));
        };

        let cmd = first.to_lowercase();
        let cmd = match cmd.as_str() {
            "r" => "register",
            "l" => "login",
            "p" => "put",
            "g" => "get",
            "w" => "getwhen",
            "h" | "?" => "help",
            "q" | "exit" => "quit",
            other => other,
        };
        let args = &parts[1..];

        match (cmd, args) {
            ("help", []) => Ok(Self::Help),
            ("quit", []) => Ok(Self::Quit),
            ("register", [username, password]) => Ok(Self::Register {
                username: username.to_string(),
                password: password.to_string(),
            }),
            ("login", [username, password]) => Ok(Self::Login {
                username: username.to_string(),
                password: password.to_string(),
            }),
            ("put", [key, value]) => Ok(Self::Put {
                key: key.to_string(),
                value: value.to_string(),
            }),
            ("get", [key]) => Ok(Self::Get {
                key: key.to_string(),
            }),
            ("mput", pairs) if !pairs.is_empty() && pairs.len() % 2 == 0 => Ok(Self::MultiPut {
                pairs: pairs
                    .chunks_exact(2)
                    .map(|pair| (pair[0].to_string(), pair[1].to_string()))
                    .collect(),
            }),
            ("mget", keys) if !keys.is_empty() => Ok(Self::MultiGet {
                keys: keys.iter().map(|key| key.to_string()).collect(),
            }),
            ("getwhen", [key, cond_key, cond_value]) => Ok(Self::GetWhen {
                key: key.to_string(),
                cond_key: cond_key.to_string(),
                cond_value: cond_value.to_string(),
            }),
            ("register" | "login", _) => Err(anyhow!("usage: {cmd} <user> <password>")),
            ("put", _) => Err(anyhow!("usage: put <key> <value>")),
            ("get", _) => Err(anyhow!("usage: get <key>")),
            ("mput", _) => Err(anyhow!("usage: mput <key> <value> [<key> <value> ...]")),
            ("mget", _) => Err(anyhow!("usage: mget <key> [<key> ...]")),
            ("getwhen", _) => Err(anyhow!("usage: getwhen <key> <cond-key> <cond-value>")),
            ("help" | "quit", _) => Err(anyhow!("{cmd} takes no arguments")),
            _ => Err(anyhow!("unknown command '{first}', type help for a list")),
        }
    }

    fn needs_login(&self) -> bool {
        !matches!(
            self,
            Self::Register { .. } | Self::Login { .. } | Self::Help | Self::Quit
        )
    }
}

/// Connects to the server and serves stdin until `quit` or end of input.
pub fn run(args: ClientArgs) -> Result<()> {
    let client = Client::connect(args.server)
        .with_context(|| format!("failed to connect to {}", args.server))?;

    let stdin = io::stdin();
    let stdout = io::stdout();
    writeln!(stdout.lock(), "*** connected to {}", args.server)?;

    let outcome = Console::new(&client).serve(stdin.lock(), stdout.lock());
    client.close().context("failed to disconnect")?;
    outcome
}

pub struct Console<'a> {
    client: &'a Client,
    user: Option<String>,
}

impl<'a> Console<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client, user: None }
    }

    pub fn serve<R, W>(&mut self, input: R, mut output: W) -> Result<()>
    where
        R: BufRead,
        W: Write,
    {
        for line in input.lines() {
            let line = line.context("failed to read input")?;
            if line.trim().is_empty() {
                continue;
            }

            let command = match ConsoleCommand::parse(&line) {
                Ok(command) => command,
                Err(err) => {
                    report(&format!("!!! {err}"));
                    continue;
                }
            };
            if !self.execute(command, &mut output)? {
                break;
            }
        }
        Ok(())
    }

    /// Runs one command. Returns `false` when the console should stop.
    fn execute<W: Write>(&mut self, command: ConsoleCommand, out: &mut W) -> Result<bool> {
        if command.needs_login() && self.user.is_none() {
            report("!!! login required");
            return Ok(true);
        }
        debug!(?command, "executing");

        match command {
            ConsoleCommand::Register { username, password } => {
                if self.client.register(&username, &password)? {
                    writeln!(out, "*** registered as {username}")?;
                    self.user = Some(username);
                } else {
                    report(&format!("!!! username {username} is taken"));
                }
            }
            ConsoleCommand::Login { username, password } => {
                if self.client.authenticate(&username, &password)? {
                    writeln!(out, "*** logged in as {username}")?;
                    self.user = Some(username);
                } else {
                    report("!!! wrong username or password");
                }
            }
            ConsoleCommand::Put { key, value } => {
                self.client.put(&key, value.as_bytes())?;
                writeln!(out, "ok")?;
            }
            ConsoleCommand::Get { key } => {
                let value = self.client.get(&key)?;
                writeln!(out, "{}", render(value.as_deref()))?;
            }
            ConsoleCommand::MultiPut { pairs } => {
                self.client
                    .multi_put(pairs.into_iter().map(|(key, value)| (key, value.into_bytes())))?;
                writeln!(out, "ok")?;
            }
            ConsoleCommand::MultiGet { keys } => {
                let found: BTreeMap<_, _> = self.client.multi_get(keys)?.into_iter().collect();
                if found.is_empty() {
                    writeln!(out, "(empty)")?;
                }
                for (key, value) in found {
                    writeln!(out, "{key} = {}", render(Some(&value)))?;
                }
            }
            ConsoleCommand::GetWhen {
                key,
                cond_key,
                cond_value,
            } => {
                let value = self
                    .client
                    .get_when(&key, &cond_key, cond_value.as_bytes())?;
                writeln!(out, "{}", render(value.as_deref()))?;
            }
            ConsoleCommand::Help => writeln!(out, "{USAGE}")?,
            ConsoleCommand::Quit => {
                writeln!(out, "bye")?;
                out.flush()?;
                return Ok(false);
            }
        }

        out.flush()?;
        Ok(true)
    }
}

fn render(value: Option<&[u8]>) -> String {
    match value {
        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        None => "(nil)".to_string(),
    }
}

fn report(line: &str) {
    let mut stderr = io::stderr().lock();
    let _ = writeln!(stderr, "{line}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_case_insensitive_with_aliases() {
        assert_eq!(ConsoleCommand::parse("QUIT").expect("quit"), ConsoleCommand::Quit);
        assert_eq!(ConsoleCommand::parse("q").expect("quit"), ConsoleCommand::Quit);
        assert_eq!(ConsoleCommand::parse(" Help ").expect("help"), ConsoleCommand::Help);
        assert_eq!(
            ConsoleCommand::parse("G colour").expect("get"),
            ConsoleCommand::Get {
                key: "colour".into()
            }
        );
        assert_eq!(
            ConsoleCommand::parse("l alice secret").expect("login"),
            ConsoleCommand::Login {
                username: "alice".into(),
                password: "secret".into()
            }
        );
    }

    #[test]
    fn multi_key_commands_take_lists() {
        assert_eq!(
            ConsoleCommand::parse("mput a 1 b 2").expect("mput"),
            ConsoleCommand::MultiPut {
                pairs: vec![("a".into(), "1".into()), ("b".into(), "2".into())]
            }
        );
        assert_eq!(
            ConsoleCommand::parse("mget a b c").expect("mget"),
            ConsoleCommand::MultiGet {
                keys: vec!["a".into(), "b".into(), "c".into()]
            }
        );
        assert!(ConsoleCommand::parse("mput a 1 b").is_err(), "odd argument count");
        assert!(ConsoleCommand::parse("mget").is_err());
    }

    #[test]
    fn wrong_arity_and_unknown_commands_are_rejected() {
        assert!(ConsoleCommand::parse("").is_err());
        assert!(ConsoleCommand::parse("put onlykey").is_err());
        assert!(ConsoleCommand::parse("getwhen a b").is_err());
        assert!(ConsoleCommand::parse("quit now").is_err());

        let err = ConsoleCommand::parse("delete x").expect_err("unknown");
        assert!(err.to_string().contains("delete"));
    }

    #[test]
    fn only_account_commands_skip_the_login_check() {
        assert!(!ConsoleCommand::Help.needs_login());
        assert!(!ConsoleCommand::parse("register bob pw").expect("register").needs_login());
        assert!(ConsoleCommand::parse("put k v").expect("put").needs_login());
        assert!(ConsoleCommand::parse("w k c v").expect("getwhen").needs_login());
    }
}
