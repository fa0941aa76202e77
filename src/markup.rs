//! Escaping for Telegram's MarkdownV2 renderer.
//!
//! Backend output is rendered literally: every character MarkdownV2 treats
//! as syntax gets a backslash. The escape is idempotent because the
//! renderer re-escapes the full accumulated buffer on every streamed
//! increment, not just the delta.

/// Characters Telegram requires to be escaped in MarkdownV2 text.
const SPECIAL: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

fn is_special(c: char) -> bool {
    SPECIAL.contains(&c)
}

/// Escape `text` for MarkdownV2. Idempotent: a backslash already followed
/// by a special character (or another backslash) is treated as an existing
/// escape sequence and copied through unchanged, so
/// `escape(escape(x)) == escape(x)`.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 4);
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some(&next) if next == '\\' || is_special(next) => {
                    // Already-escaped sequence, keep as-is.
                    out.push('\\');
                    out.push(next);
                    chars.next();
                }
                _ => out.push_str("\\\\"),
            }
        } else if is_special(c) {
            out.push('\\');
            out.push(c);
        } else {
            out.push(c);
        }
    }
    out
}
