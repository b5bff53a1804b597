//! Precondition checks for constructor arguments

use tracing::error;

use crate::error::ConfigError;

/// A single requirement a value must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    NonEmpty,
    NonNegative,
    Positive,
}

/// Numeric and string values that can be checked against a `Requirement`.
pub trait Checkable {
    fn satisfies(&self, req: Requirement) -> bool;
}

impl Checkable for str {
    fn satisfies(&self, req: Requirement) -> bool {
        match req {
            Requirement::NonEmpty => !self.trim().is_empty(),
            _ => false,
        }
    }
}

impl Checkable for String {
    fn satisfies(&self, req: Requirement) -> bool {
        self.as_str().satisfies(req)
    }
}

impl Checkable for f64 {
    fn satisfies(&self, req: Requirement) -> bool {
        match req {
            Requirement::NonNegative => self.is_finite() && *self >= 0.0,
            Requirement::Positive => self.is_finite() && *self > 0.0,
            Requirement::NonEmpty => false,
        }
    }
}

macro_rules! impl_checkable_int {
    ($($t:ty),*) => {
        $(
            impl Checkable for $t {
                #[allow(unused_comparisons)]
                fn satisfies(&self, req: Requirement) -> bool {
                    match req {
                        Requirement::NonNegative => *self >= 0,
                        Requirement::Positive => *self > 0,
                        Requirement::NonEmpty => false,
                    }
                }
            }
        )*
    };
}

impl_checkable_int!(u16, u32, usize, i64);

/// Returns `ConfigError(msg)` (and logs it) when `value` does not meet `req`.
pub fn check_that<T: Checkable + ?Sized>(
    value: &T,
    req: Requirement,
    msg: impl Into<String>,
) -> Result<(), ConfigError> {
    if value.satisfies(req) {
        return Ok(());
    }
    let msg = msg.into();
    error!("{}", msg);
    Err(ConfigError(msg))
}

/// Like `check_that`, but an absent value always passes.
pub fn check_optional<T: Checkable>(
    value: Option<&T>,
    req: Requirement,
    msg: impl Into<String>,
) -> Result<(), ConfigError> {
    match value {
        Some(v) => check_that(v, req, msg),
        None => Ok(()),
    }
}
