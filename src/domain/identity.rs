//! Heuristics over the identity reference (phone numbers).

/// Shortest E.164 number accepted, in digits.
const MIN_E164_DIGITS: usize = 8;
/// Longest E.164 number accepted, in digits.
const MAX_E164_DIGITS: usize = 15;
/// Run of identical digits that marks a number as disposable.
const REPEAT_RUN: usize = 6;
/// Run of consecutive digits that marks a number as disposable.
const SEQUENCE_RUN: usize = 7;

/// Prefixes of ranges commonly sold as virtual or receive-only numbers.
pub const DEFAULT_VIRTUAL_PREFIXES: &[&str] = &[
    "+1555",  // NANP fictional range
    "+4470",  // UK personal numbering
    "+3376",  // FR M2M / virtual
    "+3378",  // FR M2M / virtual
    "+31970", // NL M2M
    "+88234", // global satellite/virtual
    "+883",   // international networks
];

/// Normalise a phone number: strip spaces, dashes, dots and parentheses.
pub fn normalize(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect()
}

/// Whether `raw` is a well-formed E.164 number after normalisation.
pub fn is_e164(raw: &str) -> bool {
    let normalized = normalize(raw);
    let Some(digits) = normalized.strip_prefix('+') else {
        return false;
    };
    (MIN_E164_DIGITS..=MAX_E164_DIGITS).contains(&digits.len())
        && digits.bytes().all(|b| b.is_ascii_digit())
        && !digits.starts_with('0')
}

/// Whether the number starts with one of `prefixes`.
pub fn has_virtual_prefix(raw: &str, prefixes: &[String]) -> bool {
    let normalized = normalize(raw);
    prefixes
        .iter()
        .any(|prefix| !prefix.is_empty() && normalized.starts_with(prefix.as_str()))
}

/// Longest country calling code, in digits.
const MAX_COUNTRY_CODE_DIGITS: usize = 3;

/// Whether the subscriber digits contain a disposable-number pattern: a long
/// run of one digit (`+15550000000`) or a long ascending/descending sequence
/// (`+33123456789`).
///
/// Calling codes are one to three digits long and are not part of the
/// subscriber number. Every plausible split is tried and the number is only
/// flagged when the pattern survives all of them, so `+33 3 33 33 12 34`
/// is not flagged because of its `33` prefix.
pub fn is_disposable_pattern(raw: &str) -> bool {
    let digits: Vec<u8> = normalize(raw)
        .bytes()
        .filter(u8::is_ascii_digit)
        .map(|b| b - b'0')
        .collect();

    let mut splits = (1..=MAX_COUNTRY_CODE_DIGITS)
        .filter(|&code| code < digits.len())
        .map(|code| &digits[code..])
        .peekable();

    splits.peek().is_some() && splits.all(has_disposable_run)
}

fn has_disposable_run(subscriber: &[u8]) -> bool {
    longest_run(subscriber, |a, b| a == b) >= REPEAT_RUN
        || longest_run(subscriber, |a, b| b == a + 1) >= SEQUENCE_RUN
        || longest_run(subscriber, |a, b| a == b + 1) >= SEQUENCE_RUN
}

fn longest_run(digits: &[u8], continues: impl Fn(u8, u8) -> bool) -> usize {
    if digits.is_empty() {
        return 0;
    }
    let mut best = 1;
    let mut current = 1;
    for pair in digits.windows(2) {
        if continues(pair[0], pair[1]) {
            current += 1;
            best = best.max(current);
        } else {
            current = 1;
        }
    }
    best
}
