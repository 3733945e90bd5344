//! Slash-command grammar for operator directives.

use sb_dispatch::QueueMode;
use sb_policy::ControlCommands;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueArg {
    Show,
    Set(QueueMode),
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    New,
    Reset,
    Status,
    Stop,
    Queue(QueueArg),
    Help,
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Reset => "reset",
            Self::Status => "status",
            Self::Stop => "stop",
            Self::Queue(_) => "queue",
            Self::Help => "help",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SlashCommandGrammar;

impl SlashCommandGrammar {
    /// `None` for anything that is not a known directive; unknown slash words are
    /// ordinary messages.
    pub fn parse(&self, body: &str) -> Option<ControlCommand> {
        let trimmed = body.trim();
        let rest = trimmed.strip_prefix('/')?;
        let mut parts = rest.split_whitespace();
        let head = parts.next()?;
        // Telegram appends the bot handle: `/status@switchboard_bot`.
        let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
        let args: Vec<&str> = parts.collect();

        let command = match name.as_str() {
            "new" => ControlCommand::New,
            "reset" => ControlCommand::Reset,
            "status" => ControlCommand::Status,
            "stop" | "abort" => ControlCommand::Stop,
            "help" | "commands" => ControlCommand::Help,
            "queue" => match args.as_slice() {
                [] => ControlCommand::Queue(QueueArg::Show),
                [mode] => match mode.parse::<QueueMode>() {
                    Ok(mode) => ControlCommand::Queue(QueueArg::Set(mode)),
                    Err(_) => ControlCommand::Queue(QueueArg::Invalid(mode.to_string())),
                },
                _ => ControlCommand::Queue(QueueArg::Invalid(args.join(" "))),
            },
            _ => return None,
        };
        Some(command)
    }
}

impl ControlCommands for SlashCommandGrammar {
    fn is_control_command(&self, body: &str) -> bool {
        self.parse(body).is_some()
    }
}

pub fn help_text() -> String {
    let modes: Vec<&str> = QueueMode::ALL.iter().map(|mode| mode.as_str()).collect();
    format!(
        "Commands:\n\
         /new, /reset  start a fresh session\n\
         /stop         abort the running turn\n\
         /status       show session state\n\
         /queue [mode] show or set the queue mode ({})\n\
         /help         this message",
        modes.join(", ")
    )
}
