//! Internal testing utilities for the gcap crates.

use std::fmt::Debug;
use std::fmt::Write;
use std::panic::{RefUnwindSafe, UnwindSafe};

/// Utility for creating table-driven tests.
///
/// Create a struct, conventionally named `Case`, holding the data for one
/// test case, build a collection of them and pass the test body to
/// `test_each`. Every case is run even if earlier ones panic. Afterwards the
/// call panics with the debug representations of all failing cases, if any.
///
/// ```
/// use gcap_testing::TestCases;
///
/// #[derive(Debug)]
/// struct Case {
///     bytes: usize,
///     elems: usize,
/// }
///
/// let cases = [Case { bytes: 16, elems: 4 }];
/// cases.test_each(|case| {
///     assert_eq!(case.bytes / 4, case.elems);
/// });
/// ```
///
/// Cases and the closure must be unwind safe. Fields that are not (eg. types
/// with interior mutability) are best replaced with a description of how to
/// build the value inside the test body.
pub trait TestCases {
    /// The data for a single test case.
    type Case;

    /// Call `test` with a reference to each case, catching any panics.
    fn test_each(self, test: impl Fn(&Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe;

    /// Variant of [`test_each`](TestCases::test_each) which passes cases by
    /// value.
    ///
    /// Each case is formatted before the test runs, so that failures can
    /// still be reported after the case has been moved.
    fn test_each_value(self, test: impl Fn(Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + UnwindSafe;
}

fn report_failures(failures: &[String]) {
    assert_eq!(
        failures.len(),
        0,
        "{} test cases failed: {:?}",
        failures.len(),
        failures
    );
}

impl<I: IntoIterator> TestCases for I {
    type Case = I::Item;

    fn test_each(self, test: impl Fn(&I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe,
    {
        let mut failures = Vec::new();
        for case in self {
            if std::panic::catch_unwind(|| test(&case)).is_err() {
                failures.push(format!("{:?}", case));
            }
        }
        report_failures(&failures);
    }

    fn test_each_value(self, test: impl Fn(I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + UnwindSafe,
    {
        let mut failures = Vec::new();
        for case in self {
            let test = &test;
            let case_str = format!("{:?}", case);
            if std::panic::catch_unwind(move || test(case)).is_err() {
                failures.push(case_str);
            }
        }
        report_failures(&failures);
    }
}

/// Format `bytes` as rows of 16 hex-encoded bytes prefixed by their offset.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}:", row * 16);
        for byte in chunk {
            let _ = write!(out, " {:02x}", byte);
        }
        out.push('\n');
    }
    out
}

/// Assert that two encoded buffers are identical.
///
/// On failure the panic message reports the offset of the first differing
/// byte and a hex dump of the surrounding region of each buffer, which is
/// far easier to read than the `Debug` output of two large `Vec<u8>`s.
#[track_caller]
pub fn assert_bytes_eq(actual: &[u8], expected: &[u8]) {
    let first_diff = actual
        .iter()
        .zip(expected)
        .position(|(a, b)| a != b)
        .or_else(|| (actual.len() != expected.len()).then(|| actual.len().min(expected.len())));

    let Some(offset) = first_diff else {
        return;
    };

    let start = offset.saturating_sub(offset % 16).saturating_sub(16);
    let window = |buf: &[u8]| {
        let end = (start + 64).min(buf.len());
        hex_dump(buf.get(start..end).unwrap_or_default())
    };

    panic!(
        "buffers differ at offset {} (actual len {}, expected len {})\nactual (from {:#x}):\n{}expected (from {:#x}):\n{}",
        offset,
        actual.len(),
        expected.len(),
        start,
        window(actual),
        start,
        window(expected),
    );
}

#[cfg(test)]
mod tests {
    use super::{assert_bytes_eq, hex_dump, TestCases};

    #[test]
    fn test_test_cases_success() {
        #[derive(Clone, Debug)]
        struct Case {
            x: i32,
        }

        let cases = [Case { x: 1 }, Case { x: 2 }];
        cases.clone().test_each(|case| _ = case.x);
        cases.clone().test_each_value(|case| _ = case.x);
    }

    #[test]
    #[should_panic(expected = "2 test cases failed")]
    fn test_test_each_failure() {
        #[derive(Debug)]
        struct Case {
            x: i32,
        }

        let cases = [Case { x: 1 }, Case { x: 2 }];
        cases.test_each(|case| {
            _ = case.x;
            panic!("oh no");
        })
    }

    #[test]
    #[should_panic(expected = "1 test cases failed")]
    fn test_test_each_value_failure() {
        #[derive(Debug)]
        struct Case {
            x: i32,
        }

        let cases = [Case { x: 1 }, Case { x: 2 }];
        cases.test_each_value(|case| assert_eq!(case.x, 1))
    }

    #[test]
    fn test_hex_dump() {
        let bytes: Vec<u8> = (0..20).collect();
        let dump = hex_dump(&bytes);
        let lines: Vec<_> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000000: 00 01 02"));
        assert_eq!(lines[1], "00000010: 10 11 12 13");
    }

    #[test]
    fn test_assert_bytes_eq_equal() {
        assert_bytes_eq(b"GCAP", b"GCAP");
    }

    #[test]
    #[should_panic(expected = "buffers differ at offset 2")]
    fn test_assert_bytes_eq_mismatch() {
        assert_bytes_eq(b"GCAP", b"GCXP");
    }

    #[test]
    #[should_panic(expected = "buffers differ at offset 3")]
    fn test_assert_bytes_eq_length() {
        assert_bytes_eq(b"GCA", b"GCAP");
    }
}
