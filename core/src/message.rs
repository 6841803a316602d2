//! IRC message parsing and handling
//!
//! Each command has two on-wire spellings: the long textual form used on
//! client connections and a one- or two-letter token used between servers.
//! Both parse back to the same [`Command`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Hard cap on any wire line, terminator included
pub const MAX_LINE: usize = 512;
/// Maximum number of space-separated parameters after the verb
pub const MAX_PARAMS: usize = 15;

/// IRC message prefix (server, user, or raw numeric identifier)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Prefix {
    /// Server name
    Server(String),
    /// User prefix (nick!user@host)
    User {
        nick: String,
        user: String,
        host: String,
    },
    /// Compact numeric prefix from a server link
    Numeric(String),
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::Server(name) => write!(f, "{}", name),
            Prefix::User { nick, user, host } => write!(f, "{}!{}@{}", nick, user, host),
            Prefix::Numeric(n) => write!(f, "{}", n),
        }
    }
}

macro_rules! commands {
    ($( $variant:ident => ($cmd:literal, $tok:literal) ),* $(,)?) => {
        /// Protocol commands with both textual and tokenized spellings
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum Command {
            $( $variant, )*
            /// Three-digit numeric reply
            Numeric(u16),
            /// Anything not in the table
            Custom(String),
        }

        impl Command {
            /// Long textual spelling, used toward clients
            pub fn text(&self) -> &str {
                match self {
                    $( Command::$variant => $cmd, )*
                    Command::Numeric(_) => "",
                    Command::Custom(s) => s,
                }
            }

            /// Compact token spelling, used toward servers
            pub fn token(&self) -> &str {
                match self {
                    $( Command::$variant => $tok, )*
                    Command::Numeric(_) => "",
                    Command::Custom(s) => s,
                }
            }

            fn lookup(verb: &str) -> Option<Command> {
                match verb {
                    $( $cmd => Some(Command::$variant), )*
                    _ => match verb {
                        $( $tok => Some(Command::$variant), )*
                        _ => None,
                    },
                }
            }
        }
    };
}

commands! {
    Pass => ("PASS", "PA"),
    Nick => ("NICK", "N"),
    User => ("USER", "USER"),
    Server => ("SERVER", "S"),
    Oper => ("OPER", "OPER"),
    Quit => ("QUIT", "Q"),
    SQuit => ("SQUIT", "SQ"),
    Join => ("JOIN", "J"),
    Create => ("CREATE", "C"),
    Part => ("PART", "L"),
    Mode => ("MODE", "M"),
    Topic => ("TOPIC", "T"),
    Invite => ("INVITE", "I"),
    Kick => ("KICK", "K"),
    PrivMsg => ("PRIVMSG", "P"),
    Notice => ("NOTICE", "O"),
    Wallops => ("WALLOPS", "WA"),
    Kill => ("KILL", "D"),
    Ping => ("PING", "G"),
    Pong => ("PONG", "Z"),
    Error => ("ERROR", "Y"),
    Away => ("AWAY", "A"),
    Burst => ("BURST", "B"),
    EndOfBurst => ("END_OF_BURST", "EB"),
    EndOfBurstAck => ("EOB_ACK", "EA"),
    Whowas => ("WHOWAS", "X"),
    Links => ("LINKS", "LI"),
    Stats => ("STATS", "R"),
    Connect => ("CONNECT", "CO"),
    Rehash => ("REHASH", "REHASH"),
    Motd => ("MOTD", "MO"),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Numeric(n) => write!(f, "{:03}", n),
            _ => write!(f, "{}", self.text()),
        }
    }
}

impl From<&str> for Command {
    fn from(s: &str) -> Self {
        let upper = s.to_uppercase();
        if upper.len() == 3 && upper.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = upper.parse() {
                return Command::Numeric(n);
            }
        }
        Command::lookup(&upper).unwrap_or(Command::Custom(upper))
    }
}

/// A parsed wire message: optional origin prefix, verb, and parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub prefix: Option<Prefix>,
    pub command: Command,
    pub params: Vec<String>,
    /// Render the final parameter in `:`-form even without spaces
    #[serde(default)]
    pub trailing: bool,
}

impl Message {
    pub fn new(command: Command, params: Vec<String>) -> Self {
        Self { prefix: None, command, params, trailing: false }
    }

    pub fn with_prefix(prefix: Prefix, command: Command, params: Vec<String>) -> Self {
        Self { prefix: Some(prefix), command, params, trailing: false }
    }

    /// Parse one line, without its CRLF terminator.
    pub fn parse(input: &str) -> crate::Result<Self> {
        let input = input.trim_end_matches(['\r', '\n']);
        if input.len() > MAX_LINE - 2 {
            return Err(crate::Error::MessageParse("line too long".to_string()));
        }
        let mut rest = input.trim_start();
        if rest.is_empty() {
            return Err(crate::Error::MessageParse("empty message".to_string()));
        }

        let prefix = if let Some(stripped) = rest.strip_prefix(':') {
            let (word, tail) = split_word(stripped);
            rest = tail;
            Some(parse_prefix(word))
        } else {
            None
        };

        let (verb, mut tail) = split_word(rest);
        if verb.is_empty() {
            return Err(crate::Error::MessageParse("no command found".to_string()));
        }
        let command = Command::from(verb);

        let mut params = Vec::new();
        let mut saw_trailing = false;
        while !tail.is_empty() {
            if let Some(trailing) = tail.strip_prefix(':') {
                params.push(trailing.to_string());
                saw_trailing = true;
                break;
            }
            if params.len() == MAX_PARAMS - 1 {
                // everything left becomes the final parameter
                params.push(tail.to_string());
                break;
            }
            let (word, next) = split_word(tail);
            params.push(word.to_string());
            tail = next;
        }

        Ok(Message { prefix, command, params, trailing: saw_trailing })
    }

    /// Render toward a client connection: textual verb, CRLF-terminated,
    /// truncated to [`MAX_LINE`].
    pub fn to_client_line(&self) -> String {
        self.render(self.command.to_string())
    }

    /// Render toward a server link: token verb.
    pub fn to_server_line(&self) -> String {
        let verb = match &self.command {
            Command::Numeric(n) => format!("{:03}", n),
            c => c.token().to_string(),
        };
        self.render(verb)
    }

    fn render(&self, verb: String) -> String {
        let mut line = String::with_capacity(128);
        if let Some(ref prefix) = self.prefix {
            line.push(':');
            line.push_str(&prefix.to_string());
            line.push(' ');
        }
        line.push_str(&verb);
        for (i, param) in self.params.iter().enumerate() {
            line.push(' ');
            let last = i == self.params.len() - 1;
            if last && (self.trailing || param.contains(' ') || param.is_empty() || param.starts_with(':')) {
                line.push(':');
            }
            line.push_str(param);
        }
        truncate_line(&mut line);
        line.push_str("\r\n");
        line
    }
}

fn split_word(s: &str) -> (&str, &str) {
    match s.find(' ') {
        Some(i) => (&s[..i], s[i..].trim_start_matches(' ')),
        None => (s, ""),
    }
}

fn parse_prefix(word: &str) -> Prefix {
    if let Some(bang) = word.find('!') {
        if let Some(at) = word[bang..].find('@') {
            return Prefix::User {
                nick: word[..bang].to_string(),
                user: word[bang + 1..bang + at].to_string(),
                host: word[bang + at + 1..].to_string(),
            };
        }
    }
    if word.contains('.') {
        Prefix::Server(word.to_string())
    } else {
        Prefix::Numeric(word.to_string())
    }
}

/// Cut `line` so that with CRLF appended it fits in [`MAX_LINE`] bytes.
/// Truncation is silent; the cut never splits a UTF-8 sequence.
fn truncate_line(line: &mut String) {
    let limit = MAX_LINE - 2;
    if line.len() <= limit {
        return;
    }
    let mut cut = limit;
    while cut > 0 && !line.is_char_boundary(cut) {
        cut -= 1;
    }
    line.truncate(cut);
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_client_line().trim_end())
    }
}
