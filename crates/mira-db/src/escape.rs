/// Escape character used with `LIKE ... ESCAPE '\'`.
pub const LIKE_ESCAPE: char = '\\';

const LIKE_META: &[char] = &['%', '_', LIKE_ESCAPE];

/// Escapes LIKE metacharacters so `keyword` matches literally.
///
/// Every metacharacter is escaped, including an escape character the
/// operator typed. Apply it once, when the pattern is built.
pub fn escape_like(keyword: &str) -> String {
    let mut out = String::with_capacity(keyword.len() + 4);
    for ch in keyword.chars() {
        if LIKE_META.contains(&ch) {
            out.push(LIKE_ESCAPE);
        }
        out.push(ch);
    }
    out
}

/// `%keyword%` pattern with the keyword escaped.
pub fn contains_pattern(keyword: &str) -> String {
    format!("%{}%", escape_like(keyword))
}
