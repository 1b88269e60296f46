use super::ScheduleSyntaxError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Token {
    Word(String),
    Number(u32),
    Ordinal(u32),
    Clock(u32, u32),
    Minute(u32),
    Meridiem { pm: bool },
}

#[derive(Debug, Clone)]
pub(super) struct Lexeme {
    pub token: Token,
    pub text: String,
}

fn number(text: &str, raw: &str) -> Result<u32, ScheduleSyntaxError> {
    text.parse()
        .map_err(|_| ScheduleSyntaxError::new(raw, "a number"))
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn word_ordinal(w: &str) -> Option<u32> {
    Some(match w {
        "first" => 1,
        "second" => 2,
        "third" => 3,
        "fourth" => 4,
        "fifth" => 5,
        _ => return None,
    })
}

/// Splits schedule text into tokens. Case-insensitive; commas count as spaces.
pub(super) fn lex(input: &str) -> Result<Vec<Lexeme>, ScheduleSyntaxError> {
    let lowered = input.to_ascii_lowercase().replace(',', " ");
    let mut out = Vec::new();
    for chunk in lowered.split_whitespace() {
        lex_chunk(chunk, &mut out)?;
    }
    Ok(out)
}

fn lex_chunk(chunk: &str, out: &mut Vec<Lexeme>) -> Result<(), ScheduleSyntaxError> {
    let push = |out: &mut Vec<Lexeme>, token: Token| {
        out.push(Lexeme {
            token,
            text: chunk.to_string(),
        })
    };

    match chunk {
        "am" | "a.m." => return Ok(push(out, Token::Meridiem { pm: false })),
        "pm" | "p.m." => return Ok(push(out, Token::Meridiem { pm: true })),
        _ => {}
    }

    // "4pm", "11:01pm"
    for (suffix, pm) in [("am", false), ("pm", true)] {
        if let Some(time) = chunk.strip_suffix(suffix) {
            if time.starts_with(|c: char| c.is_ascii_digit()) {
                let start = out.len();
                lex_chunk(time, out)?;
                for lexeme in &mut out[start..] {
                    lexeme.text = chunk.to_string();
                }
                push(out, Token::Meridiem { pm });
                return Ok(());
            }
        }
    }

    if let Some(minute) = chunk.strip_prefix(':') {
        if all_digits(minute) {
            return Ok(push(out, Token::Minute(number(minute, chunk)?)));
        }
    }

    if let Some((h, m)) = chunk.split_once(':') {
        if all_digits(h) && all_digits(m) {
            return Ok(push(out, Token::Clock(number(h, chunk)?, number(m, chunk)?)));
        }
        return Err(ScheduleSyntaxError::new(chunk, "a time like 4:30"));
    }

    if all_digits(chunk) {
        return Ok(push(out, Token::Number(number(chunk, chunk)?)));
    }

    let digits_end = chunk.find(|c: char| !c.is_ascii_digit()).unwrap_or(chunk.len());
    if digits_end > 0 {
        let (digits, suffix) = chunk.split_at(digits_end);
        if matches!(suffix, "st" | "nd" | "rd" | "th") {
            return Ok(push(out, Token::Ordinal(number(digits, chunk)?)));
        }
        return Err(ScheduleSyntaxError::new(chunk, "a number, ordinal or time"));
    }

    if let Some(n) = word_ordinal(chunk) {
        return Ok(push(out, Token::Ordinal(n)));
    }

    if chunk.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Ok(push(out, Token::Word(chunk.to_string())));
    }

    Err(ScheduleSyntaxError::new(chunk, "a word, number or time"))
}
