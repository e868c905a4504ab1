//! Constraint checks shared by the value decoder and the validator.
//!
//! Every check returns the human readable reason on failure; callers attach the field name.

use crate::tag::TagSet;

const EPSILON: f64 = 1e-9;

pub(crate) fn check_str(value: &str, tags: &TagSet) -> Result<(), String> {
    let length = value.chars().count();
    if let Some(min) = tags.string_min_length()
        && length < min
    {
        return Err(format!("length must be at least {min}"));
    }
    if let Some(max) = tags.string_max_length()
        && length > max
    {
        return Err(format!("length must be at most {max}"));
    }

    let enum_matched = check_enum(value, tags)?;

    if let Some(pattern) = tags.pattern()
        && !pattern.is_match(value)
    {
        return Err(format!("must match pattern `{}`", pattern.as_str()));
    }

    if !enum_matched
        && let Some(format) = tags.format()
        && !format.check(value)
    {
        return Err(format!("must be a valid {format}"));
    }
    Ok(())
}

pub(crate) fn check_int(value: i128, tags: &TagSet) -> Result<(), String> {
    check_range(value as f64, tags)?;
    if let Some(step) = tags.multiple_of() {
        let divisible = if step.fract() == 0.0 && step <= i128::MAX as f64 {
            value % (step as i128) == 0
        } else {
            is_multiple(value as f64, step)
        };
        if !divisible {
            return Err(format!("must be a multiple of {step}"));
        }
    }
    check_enum(&value.to_string(), tags).map(|_| ())
}

pub(crate) fn check_float(value: f64, tags: &TagSet) -> Result<(), String> {
    if !value.is_finite() {
        return Err("must be a finite number".to_owned());
    }
    check_range(value, tags)?;
    if let Some(step) = tags.multiple_of()
        && !is_multiple(value, step)
    {
        return Err(format!("must be a multiple of {step}"));
    }
    if !tags.enum_values().is_empty() {
        let listed = tags.enum_values().iter().filter_map(|v| v.parse::<f64>().ok()).any(|v| v == value);
        if !listed {
            return Err(format!("must be one of [{}]", tags.enum_values().join(", ")));
        }
    }
    Ok(())
}

/// Item count bounds and uniqueness for list values.
pub(crate) fn check_items(count: usize, unique: bool, tags: &TagSet) -> Result<(), String> {
    if let Some(min) = tags.min_items()
        && count < min
    {
        return Err(format!("must contain at least {min} items"));
    }
    if let Some(max) = tags.max_items()
        && count > max
    {
        return Err(format!("must contain at most {max} items"));
    }
    if tags.unique_items() && !unique {
        return Err("items must be unique".to_owned());
    }
    Ok(())
}

fn check_range(value: f64, tags: &TagSet) -> Result<(), String> {
    if let Some(min) = tags.min()
        && value < min
    {
        return Err(format!("must be at least {min}"));
    }
    if let Some(max) = tags.max()
        && value > max
    {
        return Err(format!("must be at most {max}"));
    }
    Ok(())
}

/// Returns whether an enum was declared and matched.
fn check_enum(value: &str, tags: &TagSet) -> Result<bool, String> {
    let allowed = tags.enum_values();
    if allowed.is_empty() {
        return Ok(false);
    }
    if allowed.iter().any(|v| v == value) {
        Ok(true)
    } else {
        Err(format!("must be one of [{}]", allowed.join(", ")))
    }
}

fn is_multiple(value: f64, step: f64) -> bool {
    let quotient = value / step;
    (quotient - quotient.round()).abs() <= EPSILON * quotient.abs().max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        TagSet::parse("T", "f", pairs).unwrap()
    }

    #[test]
    fn test_string_length_counts_chars() {
        let t = tags(&[("minLength", "4"), ("maxLength", "5")]);
        assert!(check_str("abc", &t).is_err());
        assert!(check_str("abcd", &t).is_ok());
        assert!(check_str("ääää", &t).is_ok());
        assert_eq!(check_str("abcdef", &t), Err("length must be at most 5".to_owned()));
    }

    #[test]
    fn test_min_max_bound_string_length_without_length_keys() {
        let t = tags(&[("min", "2"), ("max", "3")]);
        assert!(check_str("a", &t).is_err());
        assert!(check_str("abc", &t).is_ok());
    }

    #[test]
    fn test_enum_matched_skips_format() {
        let t = tags(&[("enum", "none,admin@example.com"), ("format", "email")]);
        assert!(check_str("none", &t).is_ok());
        assert!(check_str("other", &t).unwrap_err().starts_with("must be one of"));

        let t = tags(&[("format", "email")]);
        assert_eq!(check_str("none", &t), Err("must be a valid email".to_owned()));
    }

    #[test]
    fn test_enum_checked_before_pattern() {
        let t = tags(&[("enum", "red,blue"), ("pattern", "^r")]);
        assert!(check_str("green", &t).unwrap_err().starts_with("must be one of"));
        assert!(check_str("blue", &t).unwrap_err().starts_with("must match pattern"));
    }

    #[test]
    fn test_integer_range_and_step() {
        let t = tags(&[("min", "5"), ("max", "100"), ("multipleOf", "5")]);
        assert!(check_int(3, &t).is_err());
        assert!(check_int(10, &t).is_ok());
        assert!(check_int(12, &t).is_err());
        assert!(check_int(105, &t).is_err());
    }

    #[test]
    fn test_float_step_is_epsilon_tolerant() {
        let t = tags(&[("multipleOf", "0.1")]);
        assert!(check_float(0.3, &t).is_ok());
        assert!(check_float(1.15, &t).is_err());
        assert!(check_float(f64::NAN, &t).is_err());
    }

    #[test]
    fn test_items() {
        let t = tags(&[("minItems", "1"), ("maxItems", "2"), ("uniqueItems", "")]);
        assert!(check_items(0, true, &t).is_err());
        assert!(check_items(2, true, &t).is_ok());
        assert!(check_items(3, true, &t).is_err());
        assert_eq!(check_items(2, false, &t), Err("items must be unique".to_owned()));
    }
}
