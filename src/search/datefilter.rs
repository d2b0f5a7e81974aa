//! Natural-language date extraction for search queries.
//!
//! A straight-line cascade of pattern attempts over the raw query string:
//! explicit ranges first, then bounded prefixes, then a trailing date
//! phrase. The recognized phrase is stripped so only the semantic part of
//! the query reaches the text encoder.
//!
//! Ambiguous `DD/MM` vs `MM/DD` slash dates prefer day-first and flip only
//! when a field exceeds 12.

use std::sync::OnceLock;

use chrono::{Datelike, Duration, Months, NaiveDate, Weekday};
use regex::Regex;

/// Result of date extraction: the query with the date phrase removed and
/// the optional inclusive day range it named.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedQuery {
    pub clean_query: String,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

/// Parses against today's date.
pub fn parse(input: &str) -> ParsedQuery {
    parse_at(input, chrono::Local::now().date_naive())
}

/// Parses against an explicit reference date (tests pin this).
pub fn parse_at(input: &str, today: NaiveDate) -> ParsedQuery {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return ParsedQuery::default();
    }
    let lower = trimmed.to_lowercase();

    if let Some(parsed) = try_between(&lower, today) {
        return parsed;
    }
    if let Some(parsed) = try_from_to(&lower, today) {
        return parsed;
    }
    if let Some(parsed) = try_bounded_prefix(&lower, today) {
        return parsed;
    }
    if let Some(parsed) = try_trailing_span(&lower, today) {
        return parsed;
    }

    ParsedQuery {
        clean_query: trimmed.to_string(),
        ..Default::default()
    }
}

/// `... between A and B ...`
fn try_between(lower: &str, today: NaiveDate) -> Option<ParsedQuery> {
    let caps = regexes().between.captures(lower)?;
    let prefix = caps.get(1).map(|m| m.as_str()).unwrap_or("");
    let tail = caps.get(2)?.as_str();

    let (left, right) = tail.split_once(" and ")?;
    let (from, _) = parse_date_span(left, today)?;

    let right_words: Vec<&str> = right.split_whitespace().collect();
    let ((_, to), used) = longest_span_prefix(&right_words, today)?;
    let remainder = right_words[used..].join(" ");

    Some(finish(join_clean(prefix, &remainder), Some(from), Some(to)))
}

/// `... from A to B ...` (also `till` as the closing keyword)
fn try_from_to(lower: &str, today: NaiveDate) -> Option<ParsedQuery> {
    let caps = regexes().from_to.captures(lower)?;
    let prefix = caps.get(1).map(|m| m.as_str()).unwrap_or("");
    let tail = caps.get(2)?.as_str();

    let (left, right) = tail
        .split_once(" to ")
        .or_else(|| tail.split_once(" till "))?;
    let (from, _) = parse_date_span(left, today)?;

    let right_words: Vec<&str> = right.split_whitespace().collect();
    let ((_, to), used) = longest_span_prefix(&right_words, today)?;
    let remainder = right_words[used..].join(" ");

    Some(finish(join_clean(prefix, &remainder), Some(from), Some(to)))
}

/// Bounded prefixes: after/since open the range, before/until/till/up to
/// close it, in/on/during/from take the whole span.
fn try_bounded_prefix(lower: &str, today: NaiveDate) -> Option<ParsedQuery> {
    for keyword_match in regexes().keyword.find_iter(lower) {
        let keyword = keyword_match.as_str();
        let tail = lower[keyword_match.end()..].trim_start();
        if tail.is_empty() {
            continue;
        }

        let tail_words: Vec<&str> = tail.split_whitespace().collect();
        let Some(((from, to), used)) = longest_span_prefix(&tail_words, today) else {
            continue;
        };
        let remainder = tail_words[used..].join(" ");
        let prefix = &lower[..keyword_match.start()];

        let (date_from, date_to) = match keyword {
            "after" | "since" => (Some(from), None),
            "before" | "until" | "till" | "up to" => (None, Some(to)),
            _ => (Some(from), Some(to)), // in | on | during | from
        };
        return Some(finish(join_clean(prefix, &remainder), date_from, date_to));
    }
    None
}

/// Bare date phrase at the end of the query: `photos 2024`, `beach last week`.
fn try_trailing_span(lower: &str, today: NaiveDate) -> Option<ParsedQuery> {
    for word in regexes().word.find_iter(lower) {
        let suffix = &lower[word.start()..];
        if let Some((from, to)) = parse_date_span(suffix, today) {
            let clean = lower[..word.start()].trim().to_string();
            return Some(finish(clean, Some(from), Some(to)));
        }
    }
    None
}

/// Longest word-prefix of `words` that parses as a date span, with the
/// number of words it consumed.
fn longest_span_prefix(
    words: &[&str],
    today: NaiveDate,
) -> Option<((NaiveDate, NaiveDate), usize)> {
    for end in (1..=words.len()).rev() {
        if let Some(span) = parse_date_span(&words[..end].join(" "), today) {
            return Some((span, end));
        }
    }
    None
}

fn join_clean(prefix: &str, remainder: &str) -> String {
    let mut clean = prefix.trim().to_string();
    if !remainder.is_empty() {
        if !clean.is_empty() {
            clean.push(' ');
        }
        clean.push_str(remainder);
    }
    clean
}

fn finish(clean: String, date_from: Option<NaiveDate>, date_to: Option<NaiveDate>) -> ParsedQuery {
    let clean = clean.trim().to_string();
    // A leftover lone keyword carries no meaning.
    let clean = if regexes().dangling.is_match(&clean) {
        String::new()
    } else {
        clean
    };
    ParsedQuery {
        clean_query: clean,
        date_from,
        date_to,
    }
}

/// Parses a raw phrase into an inclusive `(start, end)` day range.
pub fn parse_date_span(input: &str, today: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    let re = regexes();
    let s = re
        .sanitize
        .replace_all(&input.to_lowercase(), "")
        .trim()
        .to_string();
    if s.is_empty() {
        return None;
    }

    // last/past/previous/next N days/weeks/months/years
    if let Some(caps) = re.counted.captures(&s) {
        let is_next = &caps[1] == "next";
        let amount: u32 = caps[2].parse().ok()?;
        let (mut start, mut end) = (today, today);
        let target = match &caps[3] {
            "day" => shift_days(today, amount, is_next),
            "week" => shift_days(today, amount * 7, is_next),
            "month" => shift_months(today, amount, is_next),
            _ => shift_months(today, amount * 12, is_next),
        };
        if is_next {
            end = target;
        } else {
            start = target;
        }
        return Some((start, end));
    }

    // Relative singles
    match s.as_str() {
        "today" | "now" => return Some((today, today)),
        "yesterday" => return single(today - Duration::days(1)),
        "tomorrow" => return single(today + Duration::days(1)),
        "day before yesterday" => return single(today - Duration::days(2)),
        "day after tomorrow" => return single(today + Duration::days(2)),
        _ => {}
    }

    // last/this/next {week|month|year|quarter|financial year|weekday}
    if let Some(caps) = re.relative.captures(&s) {
        let modifier = match &caps[1] {
            "previous" => "last",
            "current" => "this",
            m => m,
        };
        return relative_span(modifier, &caps[2], today);
    }

    // Q1 2025 | first quarter of 2025
    if let Some(caps) = re.quarter.captures(&s) {
        let label = &caps[1];
        let year: i32 = caps[2].parse().ok()?;
        let quarter = if label == "q2" || label.starts_with("second") {
            2
        } else if label == "q3" || label.starts_with("third") {
            3
        } else if label == "q4" || label.starts_with("fourth") {
            4
        } else {
            1
        };
        return quarter_span(year, quarter);
    }

    // FY 2023-24 | financial year 2023
    if let Some(caps) = re.financial.captures(&s) {
        let year: i32 = caps[1].parse().ok()?;
        return financial_year_span(year);
    }

    // early/mid/late/beginning of/start of/end of <span>: slice into thirds
    if let Some(caps) = re.modifier.captures(&s) {
        let (start, end) = parse_date_span(&caps[2], today)?;
        let days = (end - start).num_days() + 1;
        let third = Duration::days(days / 3);
        return Some(match &caps[1] {
            "early" | "beginning of" | "start of" => (start, start + third),
            "late" | "end of" => (end - third, end),
            _ => (start + third, end - third), // mid
        });
    }

    let clean_date = re
        .of_word
        .replace_all(&s, "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    // YYYY-MM-DD / YYYY/MM/DD
    if let Some(caps) = re.ymd.captures(&clean_date) {
        let date = NaiveDate::from_ymd_opt(
            caps[1].parse().ok()?,
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
        )?;
        return Some((date, date));
    }

    // DD/MM/YYYY or MM/DD/YYYY, day-first unless the second field overflows
    if let Some(caps) = re.dmy.captures(&clean_date) {
        let p1: u32 = caps[1].parse().ok()?;
        let p2: u32 = caps[2].parse().ok()?;
        let year: i32 = caps[3].parse().ok()?;
        let (day, month) = if p2 > 12 { (p2, p1) } else { (p1, p2) };
        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        return Some((date, date));
    }

    // Year only
    if re.year_only.is_match(&clean_date) {
        let year: i32 = clean_date.parse().ok()?;
        return Some((
            NaiveDate::from_ymd_opt(year, 1, 1)?,
            NaiveDate::from_ymd_opt(year, 12, 31)?,
        ));
    }

    parse_textual_date(&clean_date)
}

/// Textual dates: `march 2023`, `15 march 2023`, `jul 4th 1999`. Every
/// token must be a recognized year, day, or month — unknown words make the
/// phrase unparseable instead of being silently swallowed.
fn parse_textual_date(clean_date: &str) -> Option<(NaiveDate, NaiveDate)> {
    let re = regexes();
    let mut year: Option<i32> = None;
    let mut month: Option<u32> = None;
    let mut day: Option<u32> = None;

    for part in clean_date.split_whitespace() {
        if re.year_only.is_match(part) {
            year = part.parse().ok();
        } else if re.day_token.is_match(part) {
            day = part
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse()
                .ok();
        } else if let Some(m) = month_number(part) {
            month = Some(m);
        } else {
            return None;
        }
    }

    let (year, month) = (year?, month?);
    match day {
        Some(day) => {
            let date = NaiveDate::from_ymd_opt(year, month, day)?;
            Some((date, date))
        }
        None => month_span(year, month),
    }
}

fn relative_span(modifier: &str, keyword: &str, today: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    match keyword {
        "year" => {
            let year = today.year()
                + match modifier {
                    "last" => -1,
                    "next" => 1,
                    _ => 0,
                };
            Some((
                NaiveDate::from_ymd_opt(year, 1, 1)?,
                NaiveDate::from_ymd_opt(year, 12, 31)?,
            ))
        }
        "month" => {
            let anchor = match modifier {
                "last" => today.checked_sub_months(Months::new(1))?,
                "next" => today.checked_add_months(Months::new(1))?,
                _ => today,
            };
            month_span(anchor.year(), anchor.month())
        }
        "week" => {
            let anchor = match modifier {
                "last" => today - Duration::days(7),
                "next" => today + Duration::days(7),
                _ => today,
            };
            let start = anchor - Duration::days(anchor.weekday().num_days_from_monday() as i64);
            Some((start, start + Duration::days(6)))
        }
        "quarter" => {
            let mut quarter = (today.month0() / 3 + 1) as i32;
            let mut year = today.year();
            match modifier {
                "last" => {
                    quarter -= 1;
                    if quarter == 0 {
                        quarter = 4;
                        year -= 1;
                    }
                }
                "next" => {
                    quarter += 1;
                    if quarter == 5 {
                        quarter = 1;
                        year += 1;
                    }
                }
                _ => {}
            }
            quarter_span(year, quarter as u32)
        }
        "financial year" => {
            let mut year = today.year();
            if today.month() < 4 {
                year -= 1;
            }
            match modifier {
                "last" => year -= 1,
                "next" => year += 1,
                _ => {}
            }
            financial_year_span(year)
        }
        weekday => {
            let target = weekday.parse::<Weekday>().ok()?;
            let date = match modifier {
                "last" => previous_weekday(today, target),
                "next" => next_weekday(today, target),
                _ => next_or_same_weekday(today, target),
            };
            single(date)
        }
    }
}

fn single(date: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    Some((date, date))
}

fn month_span(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
    let start = NaiveDate::from_ymd_opt(year, month, 1)?;
    let end = start.checked_add_months(Months::new(1))? - Duration::days(1);
    Some((start, end))
}

fn quarter_span(year: i32, quarter: u32) -> Option<(NaiveDate, NaiveDate)> {
    let first_month = (quarter - 1) * 3 + 1;
    let start = NaiveDate::from_ymd_opt(year, first_month, 1)?;
    let end = start.checked_add_months(Months::new(3))? - Duration::days(1);
    Some((start, end))
}

/// Financial year runs April through March.
fn financial_year_span(year: i32) -> Option<(NaiveDate, NaiveDate)> {
    Some((
        NaiveDate::from_ymd_opt(year, 4, 1)?,
        NaiveDate::from_ymd_opt(year + 1, 3, 31)?,
    ))
}

fn shift_days(today: NaiveDate, amount: u32, forward: bool) -> NaiveDate {
    let delta = Duration::days(amount as i64);
    if forward {
        today + delta
    } else {
        today - delta
    }
}

fn shift_months(today: NaiveDate, amount: u32, forward: bool) -> NaiveDate {
    let months = Months::new(amount);
    let shifted = if forward {
        today.checked_add_months(months)
    } else {
        today.checked_sub_months(months)
    };
    shifted.unwrap_or(today)
}

fn previous_weekday(from: NaiveDate, target: Weekday) -> NaiveDate {
    let mut date = from - Duration::days(1);
    while date.weekday() != target {
        date -= Duration::days(1);
    }
    date
}

fn next_weekday(from: NaiveDate, target: Weekday) -> NaiveDate {
    let mut date = from + Duration::days(1);
    while date.weekday() != target {
        date += Duration::days(1);
    }
    date
}

fn next_or_same_weekday(from: NaiveDate, target: Weekday) -> NaiveDate {
    if from.weekday() == target {
        from
    } else {
        next_weekday(from, target)
    }
}

fn month_number(token: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    const FULL: [&str; 12] = [
        "january",
        "february",
        "march",
        "april",
        "may",
        "june",
        "july",
        "august",
        "september",
        "october",
        "november",
        "december",
    ];
    MONTHS
        .iter()
        .position(|&m| token == m)
        .or_else(|| FULL.iter().position(|&m| token == m))
        .map(|i| i as u32 + 1)
}

struct Regexes {
    between: Regex,
    from_to: Regex,
    keyword: Regex,
    word: Regex,
    dangling: Regex,
    sanitize: Regex,
    counted: Regex,
    relative: Regex,
    quarter: Regex,
    financial: Regex,
    modifier: Regex,
    of_word: Regex,
    ymd: Regex,
    dmy: Regex,
    year_only: Regex,
    day_token: Regex,
}

fn regexes() -> &'static Regexes {
    static REGEXES: OnceLock<Regexes> = OnceLock::new();
    REGEXES.get_or_init(|| Regexes {
        between: Regex::new(r"^(.*?)\s*\bbetween\s+(.+)$").unwrap(),
        from_to: Regex::new(r"^(.*?)\s*\bfrom\s+(.+)$").unwrap(),
        keyword: Regex::new(r"\b(up to|after|since|before|until|till|in|on|during|from)\b")
            .unwrap(),
        word: Regex::new(r"\S+").unwrap(),
        dangling: Regex::new(r"^(after|before|since|until|till|from|between|in|on|during)$")
            .unwrap(),
        sanitize: Regex::new(r"[^a-z0-9\s/\-]").unwrap(),
        counted: Regex::new(r"^(last|past|previous|next)\s+(\d+)\s+(day|week|month|year)s?$")
            .unwrap(),
        relative: Regex::new(
            r"^(last|this|next|previous|current)\s+(week|month|year|quarter|financial year|monday|tuesday|wednesday|thursday|friday|saturday|sunday)$",
        )
        .unwrap(),
        quarter: Regex::new(
            r"^(q[1-4]|first quarter of|second quarter of|third quarter of|fourth quarter of)\s+(\d{4})$",
        )
        .unwrap(),
        financial: Regex::new(r"^(?:fy|financial year)\s+(\d{4})(?:-\d{2,4})?$").unwrap(),
        modifier: Regex::new(r"^(early|mid|late|beginning of|start of|end of)\s+(.+)$").unwrap(),
        of_word: Regex::new(r"\bof\b").unwrap(),
        ymd: Regex::new(r"^(\d{4})[/-](\d{2})[/-](\d{2})$").unwrap(),
        dmy: Regex::new(r"^(\d{2})[/-](\d{2})[/-](\d{4})$").unwrap(),
        year_only: Regex::new(r"^\d{4}$").unwrap(),
        day_token: Regex::new(r"^\d{1,2}(st|nd|rd|th)?$").unwrap(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    // Reference "today": Wednesday 2025-06-18.
    fn today() -> NaiveDate {
        date(2025, 6, 18)
    }

    #[test]
    fn test_year_phrase_with_from() {
        let p = parse_at("photos from 2024", today());
        assert_eq!(p.clean_query, "photos");
        assert_eq!(p.date_from, Some(date(2024, 1, 1)));
        assert_eq!(p.date_to, Some(date(2024, 12, 31)));
    }

    #[test]
    fn test_last_n_days() {
        let p = parse_at("last 7 days", today());
        assert_eq!(p.clean_query, "");
        assert_eq!(p.date_from, Some(today() - Duration::days(7)));
        assert_eq!(p.date_to, Some(today()));
    }

    #[test]
    fn test_between_range_with_trailing_terms() {
        let p = parse_at("between 2023-01-01 and 2023-06-30 beach", today());
        assert_eq!(p.clean_query, "beach");
        assert_eq!(p.date_from, Some(date(2023, 1, 1)));
        assert_eq!(p.date_to, Some(date(2023, 6, 30)));
    }

    #[test]
    fn test_from_to_range() {
        let p = parse_at("hikes from march 2023 to may 2023", today());
        assert_eq!(p.clean_query, "hikes");
        assert_eq!(p.date_from, Some(date(2023, 3, 1)));
        assert_eq!(p.date_to, Some(date(2023, 5, 31)));
    }

    #[test]
    fn test_bounded_prefixes() {
        let p = parse_at("sunsets after 2022", today());
        assert_eq!(p.clean_query, "sunsets");
        assert_eq!(p.date_from, Some(date(2022, 1, 1)));
        assert_eq!(p.date_to, None);

        let p = parse_at("snow before january 2020", today());
        assert_eq!(p.clean_query, "snow");
        assert_eq!(p.date_from, None);
        assert_eq!(p.date_to, Some(date(2020, 1, 31)));

        let p = parse_at("dogs during 2019", today());
        assert_eq!(p.date_from, Some(date(2019, 1, 1)));
        assert_eq!(p.date_to, Some(date(2019, 12, 31)));
    }

    #[test]
    fn test_prefix_skips_non_date_keyword_hits() {
        // The first "in" is followed by a place, not a date.
        let p = parse_at("coffee in paris in 2024", today());
        assert_eq!(p.clean_query, "coffee in paris");
        assert_eq!(p.date_from, Some(date(2024, 1, 1)));
    }

    #[test]
    fn test_trailing_span_without_keyword() {
        let p = parse_at("ski trip 2021", today());
        assert_eq!(p.clean_query, "ski trip");
        assert_eq!(p.date_from, Some(date(2021, 1, 1)));

        let p = parse_at("birthday last week", today());
        assert_eq!(p.clean_query, "birthday");
        // Week of Monday 2025-06-09.
        assert_eq!(p.date_from, Some(date(2025, 6, 9)));
        assert_eq!(p.date_to, Some(date(2025, 6, 15)));
    }

    #[test]
    fn test_no_date_leaves_query_untouched() {
        let p = parse_at("sunset over mountains", today());
        assert_eq!(p.clean_query, "sunset over mountains");
        assert_eq!(p.date_from, None);
        assert_eq!(p.date_to, None);
    }

    #[test]
    fn test_relative_singles() {
        assert_eq!(
            parse_date_span("today", today()),
            Some((today(), today()))
        );
        assert_eq!(
            parse_date_span("yesterday", today()),
            Some((date(2025, 6, 17), date(2025, 6, 17)))
        );
        assert_eq!(
            parse_date_span("tomorrow", today()),
            Some((date(2025, 6, 19), date(2025, 6, 19)))
        );
    }

    #[test]
    fn test_relative_month_year_quarter() {
        assert_eq!(
            parse_date_span("last month", today()),
            Some((date(2025, 5, 1), date(2025, 5, 31)))
        );
        assert_eq!(
            parse_date_span("this year", today()),
            Some((date(2025, 1, 1), date(2025, 12, 31)))
        );
        // Q2 2025 for a June reference date.
        assert_eq!(
            parse_date_span("this quarter", today()),
            Some((date(2025, 4, 1), date(2025, 6, 30)))
        );
        assert_eq!(
            parse_date_span("last quarter", today()),
            Some((date(2025, 1, 1), date(2025, 3, 31)))
        );
        // June is past April: FY 2025 runs Apr 2025 - Mar 2026.
        assert_eq!(
            parse_date_span("this financial year", today()),
            Some((date(2025, 4, 1), date(2026, 3, 31)))
        );
    }

    #[test]
    fn test_weekdays() {
        // Reference is Wednesday 2025-06-18.
        assert_eq!(
            parse_date_span("last monday", today()),
            Some((date(2025, 6, 16), date(2025, 6, 16)))
        );
        assert_eq!(
            parse_date_span("next friday", today()),
            Some((date(2025, 6, 20), date(2025, 6, 20)))
        );
        assert_eq!(
            parse_date_span("this wednesday", today()),
            Some((today(), today()))
        );
    }

    #[test]
    fn test_slash_date_disambiguation() {
        // Day-first preferred.
        assert_eq!(
            parse_date_span("05/03/2024", today()),
            Some((date(2024, 3, 5), date(2024, 3, 5)))
        );
        // First field over 12 forces day-first too.
        assert_eq!(
            parse_date_span("25/03/2024", today()),
            Some((date(2024, 3, 25), date(2024, 3, 25)))
        );
        // Second field over 12 flips to month-first.
        assert_eq!(
            parse_date_span("03/25/2024", today()),
            Some((date(2024, 3, 25), date(2024, 3, 25)))
        );
        // Both out of range: invalid.
        assert_eq!(parse_date_span("13/13/2024", today()), None);
    }

    #[test]
    fn test_textual_dates() {
        assert_eq!(
            parse_date_span("march 2023", today()),
            Some((date(2023, 3, 1), date(2023, 3, 31)))
        );
        assert_eq!(
            parse_date_span("15 march 2023", today()),
            Some((date(2023, 3, 15), date(2023, 3, 15)))
        );
        assert_eq!(
            parse_date_span("jul 4th 1999", today()),
            Some((date(1999, 7, 4), date(1999, 7, 4)))
        );
        // Unknown tokens poison the phrase.
        assert_eq!(parse_date_span("march 2023 beach", today()), None);
    }

    #[test]
    fn test_quarters_and_financial_years() {
        assert_eq!(
            parse_date_span("q1 2025", today()),
            Some((date(2025, 1, 1), date(2025, 3, 31)))
        );
        assert_eq!(
            parse_date_span("third quarter of 2024", today()),
            Some((date(2024, 7, 1), date(2024, 9, 30)))
        );
        assert_eq!(
            parse_date_span("fy 2023-24", today()),
            Some((date(2023, 4, 1), date(2024, 3, 31)))
        );
    }

    #[test]
    fn test_third_slicing_modifiers() {
        // June has 30 days; a third is 10.
        assert_eq!(
            parse_date_span("early june 2025", today()),
            Some((date(2025, 6, 1), date(2025, 6, 11)))
        );
        assert_eq!(
            parse_date_span("late june 2025", today()),
            Some((date(2025, 6, 20), date(2025, 6, 30)))
        );
        assert_eq!(
            parse_date_span("mid june 2025", today()),
            Some((date(2025, 6, 11), date(2025, 6, 20)))
        );
        // 2024 is a leap year: 366 days, a third is 122.
        assert_eq!(
            parse_date_span("end of 2024", today()),
            Some((date(2024, 12, 31) - Duration::days(122), date(2024, 12, 31)))
        );
    }

    #[test]
    fn test_counted_spans() {
        assert_eq!(
            parse_date_span("past 2 weeks", today()),
            Some((today() - Duration::days(14), today()))
        );
        assert_eq!(
            parse_date_span("next 3 days", today()),
            Some((today(), today() + Duration::days(3)))
        );
        assert_eq!(
            parse_date_span("previous 1 year", today()),
            Some((date(2024, 6, 18), today()))
        );
    }

    #[test]
    fn test_empty_and_garbage() {
        assert_eq!(parse_at("", today()), ParsedQuery::default());
        assert_eq!(parse_date_span("???", today()), None);
        assert_eq!(parse_date_span("not a date", today()), None);
    }
}
