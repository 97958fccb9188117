//! Shared assertion macros for the integration tests.

/// Assert that two floats differ by at most `epsilon` (default `1e-9`).
#[macro_export]
macro_rules! assert_close {
    ($actual:expr, $expected:expr) => {
        assert_close!($actual, $expected, 1e-9)
    };
    ($actual:expr, $expected:expr, $epsilon:expr) => {{
        let (actual, expected): (f64, f64) = ($actual, $expected);
        assert!(
            (actual - expected).abs() <= $epsilon,
            "{actual} is not within {} of {expected}",
            $epsilon
        );
    }};
}
