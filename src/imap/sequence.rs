use std::collections::BTreeSet;

use anyhow::{bail, Result};

/// Checks that `sequence_set` is syntactically a sequence-set: comma
/// separated parts, each `n`, `*` or `lo:hi` where either endpoint may be
/// `*`. Blank parts and blank range endpoints are rejected.
pub fn is_valid(sequence_set: &str) -> bool {
    if sequence_set.is_empty() {
        return false;
    }
    sequence_set.split(',').all(|part| match part.split_once(':') {
        Some((lo, hi)) => is_valid_endpoint(lo) && is_valid_endpoint(hi),
        None => is_valid_endpoint(part),
    })
}

fn is_valid_endpoint(s: &str) -> bool {
    s == "*" || (!s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
}

/// Materializes a sequence-set against a highest value `max`: `*` resolves
/// to `max`, reversed ranges are normalized, parts entirely above `max` are
/// discarded, and a range with one endpoint at `max` and the other above it
/// collapses to `max` alone. The result is sorted and de-duplicated.
pub fn to_list(sequence_set: &str, max: usize) -> Result<Vec<usize>> {
    let mut all = BTreeSet::new();

    for part in sequence_set.split(',') {
        if let Some((lo_str, hi_str)) = part.split_once(':') {
            if lo_str.is_empty() || hi_str.is_empty() {
                bail!("blank endpoint in sequence-set part {:?}", part);
            }
            let lo = parse_endpoint(lo_str, max)?;
            let hi = parse_endpoint(hi_str, max)?;

            if lo > max && hi == max || hi > max && lo == max {
                all.insert(max);
                continue;
            }
            if lo > max && hi > max {
                continue;
            }

            let (from, to) = if lo > hi { (hi, lo) } else { (lo, hi) };
            all.extend(from..=to);
        } else if part == "*" {
            all.insert(max);
        } else {
            all.insert(parse_number(part)?);
        }
    }

    Ok(all.into_iter().collect())
}

fn parse_endpoint(s: &str, max: usize) -> Result<usize> {
    if s == "*" {
        Ok(max)
    } else {
        parse_number(s)
    }
}

fn parse_number(s: &str) -> Result<usize> {
    match s.parse::<usize>() {
        Ok(n) => Ok(n),
        Err(_) => bail!("invalid number in sequence-set: {:?}", s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_sequence_sets_are_rejected() {
        for input in ["", ":", "1:", ":1", "a", "1,,2", "1:2:3"] {
            assert!(!is_valid(input), "{:?} should be invalid", input);
            if !input.is_empty() {
                assert!(to_list(input, usize::MAX).is_err(), "{:?} should not materialize", input);
            }
        }
    }

    #[test]
    fn valid_sequence_sets_materialize() {
        let vectors: &[(&str, usize, &[usize])] = &[
            ("1", usize::MAX, &[1]),
            ("4,7", usize::MAX, &[4, 7]),
            ("2:6", usize::MAX, &[2, 3, 4, 5, 6]),
            ("4:1", usize::MAX, &[1, 2, 3, 4]),
            ("1,*", 10, &[1, 10]),
            ("1:3,5:7", usize::MAX, &[1, 2, 3, 5, 6, 7]),
            ("2:*,6:4", 7, &[2, 3, 4, 5, 6, 7]),
            ("*:4,5:7", 10, &[4, 5, 6, 7, 8, 9, 10]),
        ];

        for (input, max, expected) in vectors {
            assert!(is_valid(input), "{:?} should be valid", input);
            let actual = to_list(input, *max).unwrap();
            assert_eq!(&actual, expected, "input {:?}", input);
        }
    }

    #[test]
    fn duplicates_are_folded() {
        assert_eq!(to_list("3,1:4,3", 10).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn parts_above_max_are_discarded() {
        assert_eq!(to_list("8:9,1", 5).unwrap(), vec![1]);
        assert_eq!(to_list("5:9", 5).unwrap(), vec![5]);
    }
}
