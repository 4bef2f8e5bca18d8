//! Natural ordering for group names.
//!
//! Maximal digit runs compare numerically, everything else compares
//! case-insensitively. Names that are equal under that rule fall back to a
//! plain byte comparison and then to the JID, so the order is total.

use std::cmp::Ordering;

use crate::models::GroupRecord;

enum Chunk<'a> {
    Digits(&'a str),
    Text(&'a str),
}

fn chunks(s: &str) -> Vec<Chunk<'_>> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_digits: Option<bool> = None;

    for (idx, ch) in s.char_indices() {
        let is_digit = ch.is_ascii_digit();
        match in_digits {
            Some(prev) if prev != is_digit => {
                out.push(make_chunk(&s[start..idx], prev));
                start = idx;
            }
            _ => {}
        }
        in_digits = Some(is_digit);
    }
    if let Some(prev) = in_digits {
        out.push(make_chunk(&s[start..], prev));
    }
    out
}

fn make_chunk(part: &str, digits: bool) -> Chunk<'_> {
    if digits { Chunk::Digits(part) } else { Chunk::Text(part) }
}

fn cmp_digits(a: &str, b: &str) -> Ordering {
    let a_trim = a.trim_start_matches('0');
    let b_trim = b.trim_start_matches('0');
    a_trim
        .len()
        .cmp(&b_trim.len())
        .then_with(|| a_trim.cmp(b_trim))
}

fn cmp_text(a: &str, b: &str) -> Ordering {
    let a = a.chars().flat_map(char::to_lowercase);
    let b = b.chars().flat_map(char::to_lowercase);
    a.cmp(b)
}

/// Natural comparison of two names. Not total on its own: `"a01"` and
/// `"a1"` compare equal here.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let left = chunks(a);
    let right = chunks(b);

    for (l, r) in left.iter().zip(right.iter()) {
        let ord = match (l, r) {
            (Chunk::Digits(x), Chunk::Digits(y)) => cmp_digits(x, y),
            (Chunk::Text(x), Chunk::Text(y)) => cmp_text(x, y),
            (Chunk::Digits(_), Chunk::Text(_)) => Ordering::Less,
            (Chunk::Text(_), Chunk::Digits(_)) => Ordering::Greater,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len())
}

/// Total order used for every listing: empty names last, natural order,
/// byte order, then JID.
pub fn group_order(a: &GroupRecord, b: &GroupRecord) -> Ordering {
    match (a.name.is_empty(), b.name.is_empty()) {
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        _ => {}
    }
    natural_cmp(&a.name, &b.name)
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.jid.cmp(&b.jid))
}

pub fn sort_groups(groups: &mut [GroupRecord]) {
    groups.sort_by(group_order);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(groups: &[GroupRecord]) -> Vec<&str> {
        groups.iter().map(|g| g.name.as_str()).collect()
    }

    #[test]
    fn test_digit_runs_compare_numerically() {
        assert_eq!(natural_cmp("Group 2", "Group 10"), Ordering::Less);
        assert_eq!(natural_cmp("Group 10", "Group 9"), Ordering::Greater);
        assert_eq!(natural_cmp("a100b", "a20b"), Ordering::Greater);
    }

    #[test]
    fn test_text_is_case_insensitive() {
        assert_eq!(natural_cmp("alpha", "ALPHA"), Ordering::Equal);
        assert_eq!(natural_cmp("Beta", "alpha"), Ordering::Greater);
    }

    #[test]
    fn test_large_digit_runs_do_not_overflow() {
        let big = "9".repeat(40);
        let bigger = format!("1{}", "0".repeat(40));
        assert_eq!(natural_cmp(&big, &bigger), Ordering::Less);
    }

    #[test]
    fn test_sort_puts_empty_last_and_breaks_ties_by_jid() {
        let mut groups = vec![
            GroupRecord::new("3@g.us", ""),
            GroupRecord::new("2@g.us", "Kelas 10"),
            GroupRecord::new("9@g.us", "kelas 2"),
            GroupRecord::new("1@g.us", "Kelas 10"),
        ];
        sort_groups(&mut groups);
        assert_eq!(names(&groups), vec!["kelas 2", "Kelas 10", "Kelas 10", ""]);
        assert_eq!(groups[1].jid, "1@g.us");
        assert_eq!(groups[2].jid, "2@g.us");
    }

    #[test]
    fn test_group_order_is_total_and_antisymmetric() {
        let samples = vec![
            GroupRecord::new("1@g.us", "a01"),
            GroupRecord::new("2@g.us", "a1"),
            GroupRecord::new("3@g.us", "A1"),
            GroupRecord::new("4@g.us", "a1"),
            GroupRecord::new("5@g.us", ""),
            GroupRecord::new("6@g.us", "b"),
        ];
        for a in &samples {
            for b in &samples {
                let ab = group_order(a, b);
                let ba = group_order(b, a);
                assert_eq!(ab, ba.reverse());
                if ab == Ordering::Equal {
                    assert_eq!(a, b);
                }
            }
        }
    }
}
