use mira_worker::{DONE_SENTINEL, Feature};

/// Slash commands understood by the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Menu,
    Pair(Option<String>),
    Logout,
    Reset,
    Use(Option<String>),
    Status,
    Groups(Option<String>),
    Refresh,
    Stop,
    Cancel,
    /// Closes a collect phase.
    Done,
    Feature(Feature),
    Help,
    Unknown(String),
}

impl Command {
    /// `None` when `text` is not a command at all.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if !text.starts_with('/') {
            return None;
        }
        if text.eq_ignore_ascii_case(DONE_SENTINEL) {
            return Some(Self::Done);
        }

        let (head, rest) = match text.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, Some(rest.trim().to_string()).filter(|r| !r.is_empty())),
            None => (text, None),
        };
        // "/pair@MiraBot" in group chats.
        let name = head[1..]
            .split('@')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();

        Some(match name.as_str() {
            "start" | "menu" => Self::Menu,
            "help" | "bantuan" => Self::Help,
            "pair" => Self::Pair(rest),
            "logout" => Self::Logout,
            "reset" => Self::Reset,
            "use" | "pakai" => Self::Use(rest),
            "status" => Self::Status,
            "groups" | "grup" => Self::Groups(rest),
            "refresh" => Self::Refresh,
            "stop" => Self::Stop,
            "cancel" | "batal" => Self::Cancel,
            other => match Feature::from_key(other) {
                Some(feature) => Self::Feature(feature),
                None => Self::Unknown(name),
            },
        })
    }
}

/// Callback payloads carried by inline buttons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    Feature(Feature),
    Choice(String),
    Command(Command),
}

impl Callback {
    pub fn parse(data: &str) -> Option<Self> {
        let (kind, value) = data.split_once(':')?;
        match kind {
            "f" => Feature::from_key(value).map(Self::Feature),
            "c" => Some(Self::Choice(value.to_string())),
            "cmd" => Command::parse(&format!("/{value}")).map(Self::Command),
            _ => None,
        }
    }
}

pub fn feature_data(feature: Feature) -> String {
    format!("f:{}", feature.key())
}

pub fn choice_data(value: &str) -> String {
    format!("c:{value}")
}

pub fn command_data(name: &str) -> String {
    format!("cmd:{name}")
}
