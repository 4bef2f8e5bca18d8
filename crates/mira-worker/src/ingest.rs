//! Parsers for operator-supplied batches: names, phone numbers, vCards,
//! invite links and numeric answers.

pub const INVITE_PREFIX: &str = "https://chat.whatsapp.com/";

const INVITE_HOST: &str = "chat.whatsapp.com/";
const MIN_PHONE_DIGITS: usize = 10;
const MAX_PHONE_DIGITS: usize = 15;

/// Non-empty trimmed lines, in order.
pub fn parse_names(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Strips everything but digits and rewrites the local mobile forms `08…` and
/// `8…` to the country code. Other digits are kept as typed. Returns `None`
/// outside 10..=15 digits.
pub fn normalize_phone(raw: &str, country_code: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }

    let normalized = if digits.starts_with("08") {
        format!("{country_code}{}", &digits[1..])
    } else if digits.starts_with('8') && !digits.starts_with(country_code) {
        format!("{country_code}{digits}")
    } else {
        digits
    };

    (MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS)
        .contains(&normalized.len())
        .then_some(normalized)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PhoneBatch {
    pub valid: Vec<String>,
    pub invalid: Vec<String>,
}

impl PhoneBatch {
    pub fn is_empty(&self) -> bool {
        self.valid.is_empty()
    }

    fn push(&mut self, raw: &str, country_code: &str) {
        match normalize_phone(raw, country_code) {
            Some(number) => {
                if !self.valid.contains(&number) {
                    self.valid.push(number);
                }
            }
            None => self.invalid.push(raw.trim().to_string()),
        }
    }
}

/// Numbers from free text (one per line) or from a vCard export.
pub fn parse_phones(text: &str, country_code: &str) -> PhoneBatch {
    let mut batch = PhoneBatch::default();
    if looks_like_vcard(text) {
        for raw in parse_vcard(text) {
            batch.push(&raw, country_code);
        }
    } else {
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            batch.push(line, country_code);
        }
    }
    batch
}

pub fn looks_like_vcard(text: &str) -> bool {
    text.lines()
        .any(|line| line.trim().eq_ignore_ascii_case("BEGIN:VCARD"))
}

/// First usable TEL value of every card, cleaned of spaces, dashes,
/// parentheses and a leading `+`.
pub fn parse_vcard(text: &str) -> Vec<String> {
    let mut numbers = Vec::new();
    let mut in_card = false;
    let mut current: Option<String> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.eq_ignore_ascii_case("BEGIN:VCARD") {
            in_card = true;
            current = None;
            continue;
        }
        if line.eq_ignore_ascii_case("END:VCARD") {
            if in_card {
                numbers.extend(current.take());
            }
            in_card = false;
            continue;
        }
        if !in_card || current.is_some() {
            continue;
        }
        current = tel_value(line);
    }

    numbers
}

fn tel_value(line: &str) -> Option<String> {
    let (head, value) = line.split_once(':')?;
    // Grouped properties look like `item1.TEL;TYPE=CELL`.
    let name = head.split(';').next()?.rsplit('.').next()?;
    if !name.eq_ignore_ascii_case("TEL") {
        return None;
    }
    let value = value.trim();
    let value = value.strip_prefix("tel:").unwrap_or(value);
    let cleaned: String = value
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '+' | '.'))
        .collect();
    (!cleaned.is_empty() && cleaned.chars().all(|c| c.is_ascii_digit())).then_some(cleaned)
}

/// Invite URLs found anywhere in `text`, canonicalised and deduplicated.
pub fn extract_invite_links(text: &str) -> Vec<String> {
    let mut links = Vec::new();
    for line in text.lines() {
        let mut rest = line;
        while let Some(pos) = rest.find(INVITE_HOST) {
            let after = &rest[pos + INVITE_HOST.len()..];
            let code: String = after
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric())
                .collect();
            if !code.is_empty() {
                let link = format!("{INVITE_PREFIX}{code}");
                if !links.contains(&link) {
                    links.push(link);
                }
            }
            rest = &after[code.len()..];
        }
    }
    links
}

/// Code part of a canonical invite URL.
pub fn invite_code(link: &str) -> Option<&str> {
    link.strip_prefix(INVITE_PREFIX).filter(|c| !c.is_empty())
}

/// Integer answer within `min..=max`.
pub fn parse_bounded(text: &str, min: u64, max: u64) -> Option<u64> {
    text.trim()
        .parse::<u64>()
        .ok()
        .filter(|value| (min..=max).contains(value))
}
