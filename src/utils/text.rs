//! Plain-text helpers for the tail endpoint.

/// djb2 hash over a string, used as a cheap poll-diff fingerprint for tails.
#[must_use]
pub fn djb2(text: &str) -> u32 {
    let mut hash: u32 = 5381;
    for byte in text.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(u32::from(byte));
    }
    hash
}

/// Strip ANSI escape sequences and resolve carriage-return overwrites.
///
/// Lines are processed independently: within a line, text after a `\r`
/// overwrites the prefix of what came before it (terminal semantics), and
/// trailing whitespace is trimmed. CSI (`ESC [ ...`), OSC (`ESC ] ... BEL/ST`)
/// and single-character escape sequences are removed.
#[must_use]
pub fn strip_ansi(text: &str) -> String {
    let without_escapes = remove_escape_sequences(text);
    without_escapes
        .split('\n')
        .map(resolve_carriage_returns)
        .collect::<Vec<_>>()
        .join("\n")
}

fn remove_escape_sequences(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            // CSI: ESC [ params... final-byte (0x40..=0x7e)
            Some('[') => {
                chars.next();
                for c in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&c) {
                        break;
                    }
                }
            }
            // OSC: ESC ] ... terminated by BEL or ST (ESC \)
            Some(']') => {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\u{7}' {
                        break;
                    }
                    if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            // Two-character sequences (ESC + single char)
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }

    out
}

fn resolve_carriage_returns(line: &str) -> String {
    let mut screen: Vec<char> = Vec::new();
    let mut cursor = 0usize;

    for c in line.chars() {
        if c == '\r' {
            cursor = 0;
        } else {
            if cursor < screen.len() {
                screen[cursor] = c;
            } else {
                screen.push(c);
            }
            cursor += 1;
        }
    }

    screen.into_iter().collect::<String>().trim_end().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_djb2_empty() {
        assert_eq!(djb2(""), 5381);
    }

    #[test]
    fn test_djb2_stable() {
        assert_eq!(djb2("hello"), djb2("hello"));
        assert_ne!(djb2("hello"), djb2("hellp"));
    }

    #[test]
    fn test_strip_ansi_plain_text_unchanged() {
        assert_eq!(strip_ansi("plain text"), "plain text");
    }

    #[test]
    fn test_strip_ansi_removes_color_codes() {
        assert_eq!(strip_ansi("\u{1b}[32mgreen\u{1b}[0m"), "green");
    }

    #[test]
    fn test_strip_ansi_removes_osc_title() {
        assert_eq!(strip_ansi("\u{1b}]0;title\u{7}text"), "text");
    }

    #[test]
    fn test_carriage_return_overwrite() {
        // Spinner-style output: the second write fully covers the first
        assert_eq!(strip_ansi("loading...\rdone      "), "done");
    }

    #[test]
    fn test_carriage_return_partial_overwrite() {
        // Shorter rewrite leaves the tail of the previous content
        assert_eq!(strip_ansi("1234567890\rab"), "ab34567890");
    }

    #[test]
    fn test_multiline_preserved() {
        assert_eq!(strip_ansi("one\ntwo"), "one\ntwo");
    }
}
