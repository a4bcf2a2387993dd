//! Test duration strings: `<N>d <N>h <N>m`, each component optional, in
//! that order (`"1d 2h 30m"`, `"45m"`, `"2h"`, `"1h30m"`).

use time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid duration '{input}': {reason}")]
pub struct DurationParseError {
    pub input: String,
    pub reason: &'static str,
}

pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let fail = |reason| DurationParseError {
        input: input.to_string(),
        reason,
    };

    let mut chars = input.trim().chars().peekable();
    if chars.peek().is_none() {
        return Err(fail("empty duration"));
    }

    let mut total: i64 = 0;
    // index of the last unit seen in "dhm", components must come in order
    let mut last_unit: Option<usize> = None;

    while chars.peek().is_some() {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut value: i64 = 0;
        let mut digits = 0;
        while let Some(d) = chars.next_if(char::is_ascii_digit).and_then(|c| c.to_digit(10)) {
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add(i64::from(d)))
                .ok_or_else(|| fail("number too large"))?;
            digits += 1;
        }
        if digits == 0 {
            return Err(fail("expected a number"));
        }

        let (unit_index, seconds) = match chars.next().map(|c| c.to_ascii_lowercase()) {
            Some('d') => (0, 86_400),
            Some('h') => (1, 3_600),
            Some('m') => (2, 60),
            _ => return Err(fail("expected unit d, h or m")),
        };
        if last_unit.is_some_and(|last| unit_index <= last) {
            return Err(fail("components must appear once, in d h m order"));
        }
        last_unit = Some(unit_index);

        total = value
            .checked_mul(seconds)
            .and_then(|s| total.checked_add(s))
            .ok_or_else(|| fail("number too large"))?;
    }

    Ok(Duration::seconds(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_forms() {
        assert_eq!(parse_duration("1d 2h 30m").unwrap(), Duration::minutes(24 * 60 + 150));
        assert_eq!(parse_duration("45m").unwrap(), Duration::minutes(45));
        assert_eq!(parse_duration("2h").unwrap(), Duration::hours(2));
        assert_eq!(parse_duration("1h 30m").unwrap(), Duration::minutes(90));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::minutes(90));
        assert_eq!(parse_duration("  3d ").unwrap(), Duration::days(3));
        assert_eq!(parse_duration("0m").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("1D 1H").unwrap(), Duration::hours(25));
    }

    #[test]
    fn rejected_forms() {
        for bad in ["", "   ", "30", "h", "1x", "30m 1h", "1h 1h", "1.5h", "-2h", "1h foo"] {
            assert!(parse_duration(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn overflow_is_an_error() {
        let err = parse_duration("99999999999999999999d").unwrap_err();
        assert_eq!(err.reason, "number too large");
    }
}
