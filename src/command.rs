/// A command extracted from the start of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation<'a> {
    /// Lowercase command token without the leading slash.
    pub name: &'a str,
    /// Everything after the separating space.
    pub payload: &'a str,
}

/// Detect a leading command of the form `/word ` (a slash, one or more
/// lowercase letters, then a space).
///
/// Returns `None` when no command is present. A bare `/word` with no
/// trailing space is deliberately not a match: the space is part of the
/// pattern, so `/ask` alone carries no payload and falls through to
/// ordinary text handling.
pub fn parse(text: &str) -> Option<CommandInvocation<'_>> {
    let rest = text.strip_prefix('/')?;
    let name_len = rest
        .bytes()
        .take_while(|b| b.is_ascii_lowercase())
        .count();
    if name_len == 0 {
        return None;
    }
    let after = &rest[name_len..];
    let payload = after.strip_prefix(' ')?;
    Some(CommandInvocation {
        name: &rest[..name_len],
        payload,
    })
}

/// Strip a leading command prefix if one is present, otherwise return the
/// text unchanged. Used when quoting older messages back into history so a
/// `/ask what is X` ancestor contributes only `what is X`.
pub fn strip_prefix(text: &str) -> &str {
    match parse(text) {
        Some(cmd) => cmd.payload,
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_command() {
        let cmd = parse("/ask what is rust").unwrap();
        assert_eq!(cmd.name, "ask");
        assert_eq!(cmd.payload, "what is rust");
    }

    #[test]
    fn test_parse_preserves_payload_exactly() {
        let cmd = parse("/polish  two leading spaces").unwrap();
        assert_eq!(cmd.name, "polish");
        assert_eq!(cmd.payload, " two leading spaces");
    }

    #[test]
    fn test_bare_command_without_space_is_not_matched() {
        assert_eq!(parse("/ask"), None);
        assert_eq!(parse("/polish"), None);
    }

    #[test]
    fn test_plain_text_is_not_a_command() {
        assert_eq!(parse("what is 2+2?"), None);
        assert_eq!(parse("ask /me anything"), None);
        assert_eq!(parse(""), None);
    }

    #[test]
    fn test_uppercase_and_digits_are_not_commands() {
        assert_eq!(parse("/Ask something"), None);
        assert_eq!(parse("/a2b something"), None);
        assert_eq!(parse("/ leading space"), None);
    }

    #[test]
    fn test_reparsing_payload_does_not_rematch() {
        let cmd = parse("/ask rest of the text").unwrap();
        assert_eq!(parse(cmd.payload), None);
    }

    #[test]
    fn test_strip_prefix() {
        assert_eq!(strip_prefix("/ask what is X"), "what is X");
        assert_eq!(strip_prefix("no command here"), "no command here");
        assert_eq!(strip_prefix("/ask"), "/ask");
    }
}
