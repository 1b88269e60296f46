use super::lexer::{lex, Lexeme, Token};
use super::{ScheduleSyntaxError, Spec, TimeOfDay};
use chrono::Weekday;

const END: &str = "end of input";

/// Parses schedule text such as `daily at 4:00`, `weekly on monday at 23:00`
/// or `monthly on 1 at 00:00`.
pub fn parse(input: &str) -> Result<Spec, ScheduleSyntaxError> {
    let mut p = Parser {
        tokens: lex(input)?,
        pos: 0,
    };
    let spec = p.sentence()?;
    if let Some(extra) = p.peek_lexeme() {
        return Err(ScheduleSyntaxError::new(extra.text.clone(), "end of schedule"));
    }
    Ok(spec)
}

fn weekday(word: &str) -> Option<Weekday> {
    let w = word.strip_suffix('s').filter(|w| w.len() >= 3).unwrap_or(word);
    Some(match w {
        "sun" | "sunday" => Weekday::Sun,
        "mon" | "monday" => Weekday::Mon,
        "tue" | "tues" | "tuesday" => Weekday::Tue,
        "wed" | "wednesday" => Weekday::Wed,
        "thu" | "thur" | "thurs" | "thursday" => Weekday::Thu,
        "fri" | "friday" => Weekday::Fri,
        "sat" | "saturday" => Weekday::Sat,
        _ => return None,
    })
}

struct Parser {
    tokens: Vec<Lexeme>,
    pos: usize,
}

impl Parser {
    fn peek_lexeme(&self) -> Option<&Lexeme> {
        self.tokens.get(self.pos)
    }

    fn peek(&self) -> Option<&Token> {
        self.peek_lexeme().map(|l| &l.token)
    }

    fn peek_word(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w == word)
    }

    fn advance(&mut self) -> Option<Lexeme> {
        let lexeme = self.tokens.get(self.pos).cloned();
        if lexeme.is_some() {
            self.pos += 1;
        }
        lexeme
    }

    fn error(&self, expected: &str) -> ScheduleSyntaxError {
        let token = self.peek_lexeme().map(|l| l.text.as_str()).unwrap_or(END);
        ScheduleSyntaxError::new(token, expected)
    }

    fn sentence(&mut self) -> Result<Spec, ScheduleSyntaxError> {
        let Some(first) = self.advance() else {
            return Err(ScheduleSyntaxError::new(END, "a schedule such as 'daily at 4:00'"));
        };
        match &first.token {
            Token::Word(w) => match w.as_str() {
                "daily" | "everyday" | "nightly" => self.daily(),
                "hourly" => self.hourly(),
                "weekly" => self.weekly(None),
                "monthly" => self.monthly(),
                "every" => {
                    if self.peek_word("day") {
                        self.pos += 1;
                        self.daily()
                    } else if self.peek_word("hour") {
                        self.pos += 1;
                        self.hourly()
                    } else if let Some(day) = self.peek_weekday() {
                        self.pos += 1;
                        self.weekly(Some(day))
                    } else {
                        Err(self.error("'day', 'hour' or a weekday"))
                    }
                }
                other => match weekday(other) {
                    Some(day) => self.weekly(Some(day)),
                    None => Err(ScheduleSyntaxError::new(
                        first.text.clone(),
                        "daily, weekly, monthly, hourly or a weekday",
                    )),
                },
            },
            Token::Ordinal(nth) => {
                let nth = *nth;
                let day = self.nth_weekday(nth, &first.text)?;
                let at = self.optional_time()?.unwrap_or(TimeOfDay::MIDNIGHT);
                Ok(Spec::MonthlyNth { nth, weekday: day, at })
            }
            _ => Err(ScheduleSyntaxError::new(
                first.text.clone(),
                "daily, weekly, monthly, hourly or a weekday",
            )),
        }
    }

    fn peek_weekday(&self) -> Option<Weekday> {
        match self.peek() {
            Some(Token::Word(w)) => weekday(w),
            _ => None,
        }
    }

    fn daily(&mut self) -> Result<Spec, ScheduleSyntaxError> {
        let at = self.optional_time()?.unwrap_or(TimeOfDay::MIDNIGHT);
        Ok(Spec::Daily { at })
    }

    fn hourly(&mut self) -> Result<Spec, ScheduleSyntaxError> {
        let had_at = self.peek_word("at");
        if had_at {
            self.pos += 1;
        }
        let minute = match self.peek().cloned() {
            None if !had_at => 0,
            Some(Token::Minute(m)) => {
                self.pos += 1;
                m
            }
            Some(Token::Number(n)) => {
                self.pos += 1;
                match self.relation()? {
                    Some(false) if (1..60).contains(&n) => 60 - n,
                    Some(false) => return Err(self.previous_error("a minute between 1 and 59")),
                    _ => n,
                }
            }
            Some(Token::Word(w)) if w == "quarter" || w == "half" => {
                self.pos += 1;
                let amount = if w == "quarter" { 15 } else { 30 };
                match self.relation()? {
                    Some(true) => amount,
                    Some(false) => 60 - amount,
                    None => return Err(self.error("'past', 'after' or 'til'")),
                }
            }
            _ => return Err(self.error("a minute such as '30', ':30' or 'quarter past'")),
        };
        if minute >= 60 {
            return Err(self.previous_error("a minute between 0 and 59"));
        }
        Ok(Spec::Hourly { minute })
    }

    /// `past`/`after` yields `Some(true)`, `til`/`till`/`to`/`before` yields `Some(false)`.
    fn relation(&mut self) -> Result<Option<bool>, ScheduleSyntaxError> {
        let rel = match self.peek() {
            Some(Token::Word(w)) => match w.as_str() {
                "past" | "after" => Some(true),
                "til" | "till" | "to" | "before" => Some(false),
                _ => None,
            },
            _ => None,
        };
        if rel.is_some() {
            self.pos += 1;
        }
        Ok(rel)
    }

    fn previous_error(&self, expected: &str) -> ScheduleSyntaxError {
        let token = self
            .pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map(|l| l.text.as_str())
            .unwrap_or(END);
        ScheduleSyntaxError::new(token, expected)
    }

    /// `weekly` clauses: a weekday and a time in either order, `on`/`at` optional.
    fn weekly(&mut self, mut day: Option<Weekday>) -> Result<Spec, ScheduleSyntaxError> {
        let mut at = None;
        loop {
            if day.is_none() && self.peek_word("on") {
                self.pos += 1;
                match self.peek_weekday() {
                    Some(d) => {
                        self.pos += 1;
                        day = Some(d);
                    }
                    None => return Err(self.error("a weekday")),
                }
            } else if let (None, Some(d)) = (day, self.peek_weekday()) {
                self.pos += 1;
                day = Some(d);
            } else if at.is_none() && self.at_time_ahead() {
                at = self.optional_time()?;
            } else {
                break;
            }
        }
        let weekday = day.ok_or_else(|| self.error("a weekday"))?;
        Ok(Spec::Weekly {
            weekday,
            at: at.unwrap_or(TimeOfDay::MIDNIGHT),
        })
    }

    /// `monthly` clauses: a day and a time in either order, `on`/`at` optional.
    /// The day is either a day of the month or an nth weekday.
    fn monthly(&mut self) -> Result<Spec, ScheduleSyntaxError> {
        let mut at = None;
        let mut day: Option<(u32, Option<Weekday>)> = None;
        loop {
            if day.is_none() && self.peek_word("on") {
                self.pos += 1;
                day = Some(self.month_day()?);
            } else if day.is_none() && matches!(self.peek(), Some(Token::Ordinal(_))) {
                day = Some(self.month_day()?);
            } else if at.is_none() && self.at_time_ahead() {
                at = self.optional_time()?;
            } else {
                break;
            }
        }
        let at = at.unwrap_or(TimeOfDay::MIDNIGHT);
        match day {
            Some((day, None)) => Ok(Spec::Monthly { day, at }),
            Some((nth, Some(weekday))) => Ok(Spec::MonthlyNth { nth, weekday, at }),
            None => Err(self.error("a day of the month such as 'on 1st'")),
        }
    }

    fn month_day(&mut self) -> Result<(u32, Option<Weekday>), ScheduleSyntaxError> {
        let Some(lexeme) = self.advance() else {
            return Err(ScheduleSyntaxError::new(END, "a day of the month"));
        };
        let n = match lexeme.token {
            Token::Ordinal(n) | Token::Number(n) => n,
            _ => return Err(ScheduleSyntaxError::new(lexeme.text, "a day of the month")),
        };
        if self.peek_weekday().is_some() {
            let day = self.nth_weekday(n, &lexeme.text)?;
            return Ok((n, Some(day)));
        }
        if !(1..=31).contains(&n) {
            return Err(ScheduleSyntaxError::new(lexeme.text, "a day of the month between 1 and 31"));
        }
        Ok((n, None))
    }

    fn nth_weekday(&mut self, nth: u32, nth_text: &str) -> Result<Weekday, ScheduleSyntaxError> {
        if !(1..=5).contains(&nth) {
            return Err(ScheduleSyntaxError::new(nth_text, "an occurrence between 1st and 5th"));
        }
        let day = self.peek_weekday().ok_or_else(|| self.error("a weekday"))?;
        self.pos += 1;
        Ok(day)
    }

    fn at_time_ahead(&self) -> bool {
        match self.peek() {
            Some(Token::Word(w)) => matches!(w.as_str(), "at" | "noon" | "midnight"),
            Some(Token::Clock(..)) | Some(Token::Number(_)) => true,
            _ => false,
        }
    }

    /// `[at] <time>`; `at` without a time is an error.
    fn optional_time(&mut self) -> Result<Option<TimeOfDay>, ScheduleSyntaxError> {
        if self.peek_word("at") {
            self.pos += 1;
            return self.time().map(Some);
        }
        if self.at_time_ahead() {
            return self.time().map(Some);
        }
        Ok(None)
    }

    fn time(&mut self) -> Result<TimeOfDay, ScheduleSyntaxError> {
        let Some(lexeme) = self.advance() else {
            return Err(ScheduleSyntaxError::new(END, "a time such as 4:00"));
        };
        let (hour, minute) = match lexeme.token {
            Token::Clock(h, m) => (h, m),
            Token::Number(h) => (h, 0),
            Token::Word(ref w) if w == "noon" => return Ok(TimeOfDay { hour: 12, minute: 0 }),
            Token::Word(ref w) if w == "midnight" => return Ok(TimeOfDay::MIDNIGHT),
            _ => return Err(ScheduleSyntaxError::new(lexeme.text, "a time such as 4:00")),
        };
        let hour = match self.peek() {
            Some(Token::Meridiem { pm }) => {
                let pm = *pm;
                self.pos += 1;
                if !(1..=12).contains(&hour) {
                    return Err(ScheduleSyntaxError::new(lexeme.text, "an hour between 1 and 12"));
                }
                match (hour, pm) {
                    (12, false) => 0,
                    (12, true) => 12,
                    (h, true) => h + 12,
                    (h, false) => h,
                }
            }
            _ => hour,
        };
        TimeOfDay::new(hour, minute)
            .ok_or_else(|| ScheduleSyntaxError::new(lexeme.text, "a valid time of day"))
    }
}
