//! Pass/fail rule for captured output.

/// Returns whether `raw_output` satisfies a lesson expecting `expected`.
///
/// Output passes when it is non-empty and contains `expected` as a
/// contiguous, case-sensitive substring. Incidental text around the fragment
/// is tolerated.
///
/// # Example
///
/// ```
/// use shelltutor_runtime::evaluate;
///
/// assert!(evaluate("total 8\ndrwxr-xr-x 2 root root", "total"));
/// assert!(!evaluate("", "total"));
/// ```
#[must_use]
pub fn evaluate(raw_output: &str, expected: &str) -> bool {
    !raw_output.is_empty() && raw_output.contains(expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_passes() {
        assert!(evaluate("Hello, World!", "Hello, World!"));
    }

    #[test]
    fn empty_output_fails() {
        assert!(!evaluate("", "Hello, World!"));
    }

    #[test]
    fn surrounding_text_is_tolerated() {
        assert!(evaluate("xx total yy", "total"));
    }

    #[test]
    fn match_is_case_sensitive() {
        assert!(!evaluate("totaI", "total"));
        assert!(!evaluate("hello, world!", "Hello, World!"));
    }

    #[test]
    fn multi_line_fragment_must_be_contiguous() {
        assert!(evaluate("1\n2\n3\n4\n5", "1\n2\n3\n4\n5"));
        assert!(!evaluate("1\n2\n4\n5", "1\n2\n3\n4\n5"));
    }

    #[test]
    fn whitespace_is_not_normalized() {
        assert!(!evaluate("First Line\r\nSecond Line", "First Line\nSecond Line"));
    }
}
