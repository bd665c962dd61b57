//! Fractional order keys for chapter ordering
//!
//! Chapters carry an opaque string `order` column; inserting or moving a
//! chapter picks a key strictly between its neighbors without renumbering
//! anything else. Keys are base-36 digit strings interpreted as fractions
//! in (0, 1); they never end in the zero digit, so a strictly-between key
//! always exists.

const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const BASE: usize = DIGITS.len();

fn digit_index(c: u8) -> usize {
    DIGITS.iter().position(|&d| d == c).unwrap_or(0)
}

/// Key strictly between `lo` and `hi` in lexicographic order.
///
/// `None` means the open end: `key_between(None, None)` seeds the first
/// key, `key_between(Some(k), None)` appends after `k`, and
/// `key_between(None, Some(k))` prepends before `k`.
pub fn key_between(lo: Option<&str>, hi: Option<&str>) -> String {
    midpoint(lo.unwrap_or(""), hi)
}

/// Midpoint between `a` and `b` over the digit alphabet, where the empty
/// string stands for zero and `None` stands for one.
fn midpoint(a: &str, b: Option<&str>) -> String {
    if let Some(b) = b {
        // Strip the longest common prefix and recurse on the tails.
        let common = a
            .bytes()
            .chain(std::iter::repeat(b'0'))
            .zip(b.bytes())
            .take_while(|(x, y)| x == y)
            .count();
        if common > 0 {
            return format!("{}{}", &b[..common], midpoint(a.get(common..).unwrap_or(""), Some(&b[common..])));
        }
    }

    let digit_a = a.bytes().next().map(digit_index).unwrap_or(0);
    let digit_b = b
        .and_then(|b| b.bytes().next())
        .map(digit_index)
        .unwrap_or(BASE);

    if digit_b - digit_a > 1 {
        let mid = (digit_a + digit_b).div_ceil(2);
        return (DIGITS[mid] as char).to_string();
    }

    // First digits are consecutive.
    match b {
        Some(b) if b.len() > 1 => (DIGITS[digit_b] as char).to_string(),
        _ => format!(
            "{}{}",
            DIGITS[digit_a] as char,
            midpoint(a.get(1..).unwrap_or(""), None)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_key() {
        let k = key_between(None, None);
        assert!(!k.is_empty());
        assert!(!k.ends_with('0'));
    }

    #[test]
    fn test_append_is_greater() {
        let mut prev = key_between(None, None);
        for _ in 0..100 {
            let next = key_between(Some(&prev), None);
            assert!(next > prev, "{next} <= {prev}");
            prev = next;
        }
    }

    #[test]
    fn test_prepend_is_smaller() {
        let mut next = key_between(None, None);
        for _ in 0..100 {
            let prev = key_between(None, Some(&next));
            assert!(prev < next, "{prev} >= {next}");
            next = prev;
        }
    }

    #[test]
    fn test_between_is_strictly_between() {
        let lo = key_between(None, None);
        let hi = key_between(Some(&lo), None);
        let mut pairs = vec![(lo, hi)];
        // Repeated bisection stays strictly ordered.
        for _ in 0..50 {
            let (lo, hi) = pairs.last().unwrap().clone();
            let mid = key_between(Some(&lo), Some(&hi));
            assert!(lo < mid && mid < hi, "{lo} < {mid} < {hi} violated");
            pairs.push((lo, mid));
        }
    }

    #[test]
    fn test_consecutive_digits() {
        // "i" and "j" are adjacent single digits; the midpoint must extend.
        let mid = key_between(Some("i"), Some("j"));
        assert!("i" < mid.as_str() && mid.as_str() < "j");
    }

    #[test]
    fn test_keys_never_end_in_zero() {
        let mut keys = vec![key_between(None, None)];
        for _ in 0..50 {
            let last = keys.last().unwrap().clone();
            let k = key_between(None, Some(&last));
            assert!(!k.ends_with('0'), "key {k} ends in 0");
            keys.push(k);
        }
    }
}
