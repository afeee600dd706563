//! Line tokenizer and literal parsing.

use crate::AsmErrorKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Word(String),
    /// A quoted string with escapes already resolved.
    Str(String),
}

impl Token {
    pub fn word(&self) -> Result<&str, AsmErrorKind> {
        match self {
            Self::Word(word) => Ok(word),
            Self::Str(_) => Err(AsmErrorKind::UnexpectedString),
        }
    }
}

/// Split one source line on whitespace and commas. A `;` outside a string
/// starts a comment.
pub fn tokenize(line: &str) -> Result<Vec<Token>, AsmErrorKind> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut chars = line.chars();
    while let Some(ch) = chars.next() {
        match ch {
            ';' => break,
            '"' => {
                flush(&mut word, &mut tokens);
                tokens.push(Token::Str(string_literal(&mut chars)?));
            }
            c if c.is_whitespace() || c == ',' => flush(&mut word, &mut tokens),
            c => word.push(c),
        }
    }
    flush(&mut word, &mut tokens);
    Ok(tokens)
}

fn flush(word: &mut String, tokens: &mut Vec<Token>) {
    if !word.is_empty() {
        tokens.push(Token::Word(std::mem::take(word)));
    }
}

fn string_literal(chars: &mut impl Iterator<Item = char>) -> Result<String, AsmErrorKind> {
    let mut out = String::new();
    loop {
        let ch = match chars.next() {
            None => return Err(AsmErrorKind::BadString),
            Some('"') => return Ok(out),
            Some('\\') => match chars.next() {
                Some('n') => '\n',
                Some('t') => '\t',
                Some('r') => '\r',
                Some('\\') => '\\',
                Some('"') => '"',
                _ => return Err(AsmErrorKind::BadString),
            },
            Some(c) if c.is_ascii() => c,
            Some(_) => return Err(AsmErrorKind::BadString),
        };
        out.push(ch);
    }
}

/// Parse `#12`, `12`, `-3`, `x3000`, `0x3000`, `#-x10` or `b1010`.
pub fn parse_number(text: &str) -> Option<i32> {
    let body = text.strip_prefix('#').unwrap_or(text);
    let (negative, body) = match body.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, body),
    };
    let hex = body
        .strip_prefix("0x")
        .or_else(|| body.strip_prefix("0X"))
        .or_else(|| body.strip_prefix('x'))
        .or_else(|| body.strip_prefix('X'));
    let (digits, radix) = if let Some(hex) = hex {
        (hex, 16)
    } else if let Some(bin) = body.strip_prefix('b').or_else(|| body.strip_prefix('B')) {
        (bin, 2)
    } else {
        (body, 10)
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    let magnitude = i32::from_str_radix(digits, radix).ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

pub fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(line: &str) -> Vec<Token> {
        tokenize(line).unwrap()
    }

    #[test]
    fn splits_on_commas_and_whitespace() {
        assert_eq!(
            words("  ADD R1,R2 , #-1 ; trailing comment"),
            vec![
                Token::Word("ADD".into()),
                Token::Word("R1".into()),
                Token::Word("R2".into()),
                Token::Word("#-1".into()),
            ]
        );
        assert!(words("; only a comment").is_empty());
    }

    #[test]
    fn strings_keep_separators_and_resolve_escapes() {
        assert_eq!(
            words(r#"MSG .STRINGZ "a, b; c\n\"q\"" ; note"#),
            vec![
                Token::Word("MSG".into()),
                Token::Word(".STRINGZ".into()),
                Token::Str("a, b; c\n\"q\"".into()),
            ]
        );
    }

    #[test]
    fn rejects_unterminated_or_bad_escape() {
        assert_eq!(tokenize(r#".STRINGZ "open"#), Err(AsmErrorKind::BadString));
        assert_eq!(tokenize(r#".STRINGZ "\q""#), Err(AsmErrorKind::BadString));
    }

    #[test]
    fn numbers_in_every_radix() {
        assert_eq!(parse_number("#10"), Some(10));
        assert_eq!(parse_number("10"), Some(10));
        assert_eq!(parse_number("#-16"), Some(-16));
        assert_eq!(parse_number("x3000"), Some(0x3000));
        assert_eq!(parse_number("0xFFFF"), Some(0xFFFF));
        assert_eq!(parse_number("x-10"), None);
        assert_eq!(parse_number("-x10"), Some(-16));
        assert_eq!(parse_number("b101"), Some(5));
    }

    #[test]
    fn label_like_words_are_not_numbers() {
        assert_eq!(parse_number("xray"), None);
        assert_eq!(parse_number("back"), None);
        assert_eq!(parse_number("LOOP"), None);
        assert_eq!(parse_number("#"), None);
        assert!(is_identifier("LOOP_2"));
        assert!(!is_identifier("2LOOP"));
        assert!(!is_identifier("a-b"));
    }
}
