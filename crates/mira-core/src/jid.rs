//! WhatsApp JIDs: parsing, classification and display helpers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WaError;

pub const GROUP_SERVER: &str = "g.us";
pub const USER_SERVER: &str = "s.whatsapp.net";
pub const LID_SERVER: &str = "lid";

/// A chat or user identifier split into `user@server`.
///
/// Device suffixes (`628123:12@s.whatsapp.net`) are kept in `user`; use
/// [`Jid::bare_user`] when only the phone part matters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid {
    pub user: String,
    pub server: String,
}

impl Jid {
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
        }
    }

    /// JID of a phone-number user account.
    pub fn user(phone: &str) -> Self {
        Self::new(phone, USER_SERVER)
    }

    pub fn group(id: &str) -> Self {
        Self::new(id, GROUP_SERVER)
    }

    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }

    /// User part without the `:device` suffix.
    pub fn bare_user(&self) -> &str {
        self.user.split(':').next().unwrap_or(&self.user)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.server)
    }
}

impl FromStr for Jid {
    type Err = WaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (user, server) = s
            .split_once('@')
            .ok_or_else(|| WaError::InvalidJid(s.to_string()))?;
        if user.is_empty() || server.is_empty() {
            return Err(WaError::InvalidJid(s.to_string()));
        }
        Ok(Self::new(user, server))
    }
}

impl TryFrom<String> for Jid {
    type Error = WaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.to_string()
    }
}

/// Returns true when `raw` ends with the group server suffix.
pub fn is_group_jid(raw: &str) -> bool {
    raw.ends_with(&format!("@{GROUP_SERVER}"))
}

/// User part of a raw JID string, or the whole string when it has no `@`.
pub fn user_part(raw: &str) -> &str {
    raw.split('@').next().unwrap_or(raw)
}

/// Format a JID for operator-facing output.
/// - phone-number users are rendered as `+<digits>` with light grouping
/// - LID users are rendered as `(LID)`
/// - everything else is returned as-is
pub fn format_jid_for_display(jid: &str) -> String {
    if let Some(phone) = jid.strip_suffix(&format!("@{USER_SERVER}")) {
        let phone = phone.split(':').next().unwrap_or(phone);
        if !phone.is_empty() && phone.chars().all(|c| c.is_ascii_digit()) {
            return format_phone_number(phone);
        }
    }

    if jid.ends_with(&format!("@{LID_SERVER}")) {
        return "(LID)".to_string();
    }

    jid.to_string()
}

/// Example: "6281122223333" -> "+62 811-2222-3333"
pub fn format_phone_number(phone: &str) -> String {
    if phone.starts_with("62") && (11..=14).contains(&phone.len()) {
        let operator = &phone[2..5];
        let rest = &phone[5..];
        let split = rest.len() / 2;
        return format!("+62 {}-{}-{}", operator, &rest[..split], &rest[split..]);
    }

    if phone.len() > 10 {
        return format!("+{}", phone);
    }

    phone.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_group_jid() {
        let jid: Jid = "120363025246125244@g.us".parse().unwrap();
        assert!(jid.is_group());
        assert_eq!(jid.user, "120363025246125244");
    }

    #[test]
    fn test_parse_rejects_missing_server() {
        assert!("6281234".parse::<Jid>().is_err());
        assert!("@g.us".parse::<Jid>().is_err());
    }

    #[test]
    fn test_bare_user_strips_device() {
        let jid: Jid = "6281234567:12@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.bare_user(), "6281234567");
    }

    #[test]
    fn test_serde_as_string() {
        let jid = Jid::group("123");
        let json = serde_json::to_string(&jid).unwrap();
        assert_eq!(json, "\"123@g.us\"");
        let back: Jid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, jid);
    }

    #[test]
    fn test_format_indonesian_mobile() {
        assert_eq!(format_phone_number("6281122223333"), "+62 811-2222-3333");
    }

    #[test]
    fn test_format_jid_phone() {
        assert_eq!(
            format_jid_for_display("6281122223333@s.whatsapp.net"),
            "+62 811-2222-3333"
        );
    }

    #[test]
    fn test_format_jid_lid() {
        assert_eq!(format_jid_for_display("abc123@lid"), "(LID)");
    }

    #[test]
    fn test_user_part() {
        assert_eq!(user_part("123@g.us"), "123");
        assert_eq!(user_part("plain"), "plain");
        assert!(is_group_jid("123@g.us"));
        assert!(!is_group_jid("123@s.whatsapp.net"));
    }
}
