//! Composable field validators.
//!
//! Rules are small values implementing [`Rule`]; they combine with [`Rule::and`] and are applied
//! to named fields through a [`Validator`], which collects every violation instead of stopping
//! at the first one.
//!
//! ```rust
//! use std::time::Duration;
//! use resilience_runtime::policy::validation::{at_least, between, Rule, Validator};
//!
//! let result = Validator::new()
//!     .field("max_attempts", &0u32, at_least(1u32))
//!     .field("timeout", &Duration::from_secs(1), between(Duration::from_secs(1), Duration::from_secs(300)))
//!     .finish();
//! let err = result.unwrap_err();
//! assert_eq!(err.field(), "max_attempts");
//! assert_eq!(err.expected(), ">= 1");
//! ```

use std::time::Duration;

use crate::error::{FieldViolation, InvalidPolicyError};

/// How a value is rendered inside a violation message.
pub trait Describe {
    fn describe(&self) -> String;
}

macro_rules! describe_display {
    ($($t:ty),*) => {
        $(impl Describe for $t {
            fn describe(&self) -> String {
                self.to_string()
            }
        })*
    };
}

describe_display!(u16, u32, u64, usize, i64, f64);

impl Describe for Duration {
    fn describe(&self) -> String {
        format!("{:?}", self)
    }
}

impl Describe for str {
    fn describe(&self) -> String {
        format!("{:?}", self)
    }
}

impl Describe for String {
    fn describe(&self) -> String {
        self.as_str().describe()
    }
}

/// A check over a single value. `Err` carries the expected constraint.
pub trait Rule<T: ?Sized> {
    fn check(&self, value: &T) -> Result<(), String>;

    fn and<R: Rule<T>>(self, other: R) -> And<Self, R>
    where
        Self: Sized,
    {
        And(self, other)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct And<A, B>(A, B);

impl<T: ?Sized, A: Rule<T>, B: Rule<T>> Rule<T> for And<A, B> {
    fn check(&self, value: &T) -> Result<(), String> {
        self.0.check(value)?;
        self.1.check(value)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AtLeast<T>(T);

pub fn at_least<T>(min: T) -> AtLeast<T> {
    AtLeast(min)
}

impl<T: PartialOrd + Describe> Rule<T> for AtLeast<T> {
    fn check(&self, value: &T) -> Result<(), String> {
        if *value >= self.0 {
            Ok(())
        } else {
            Err(format!(">= {}", self.0.describe()))
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AtMost<T>(T);

pub fn at_most<T>(max: T) -> AtMost<T> {
    AtMost(max)
}

impl<T: PartialOrd + Describe> Rule<T> for AtMost<T> {
    fn check(&self, value: &T) -> Result<(), String> {
        if *value <= self.0 {
            Ok(())
        } else {
            Err(format!("<= {}", self.0.describe()))
        }
    }
}

/// Inclusive range.
#[derive(Debug, Clone, Copy)]
pub struct Between<T> {
    min: T,
    max: T,
}

pub fn between<T>(min: T, max: T) -> Between<T> {
    Between { min, max }
}

impl<T: PartialOrd + Describe> Rule<T> for Between<T> {
    fn check(&self, value: &T) -> Result<(), String> {
        if *value >= self.min && *value <= self.max {
            Ok(())
        } else {
            Err(format!("between {} and {}", self.min.describe(), self.max.describe()))
        }
    }
}

/// Strictly greater than the type's zero value.
#[derive(Debug, Clone, Copy, Default)]
pub struct Positive;

pub fn positive() -> Positive {
    Positive
}

impl<T: PartialOrd + Default> Rule<T> for Positive {
    fn check(&self, value: &T) -> Result<(), String> {
        if *value > T::default() {
            Ok(())
        } else {
            Err("> 0".to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NonEmpty;

pub fn non_empty() -> NonEmpty {
    NonEmpty
}

impl Rule<str> for NonEmpty {
    fn check(&self, value: &str) -> Result<(), String> {
        if value.trim().is_empty() {
            Err("a non-empty value".to_string())
        } else {
            Ok(())
        }
    }
}

impl Rule<String> for NonEmpty {
    fn check(&self, value: &String) -> Result<(), String> {
        Rule::<str>::check(self, value.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OneOf(&'static [&'static str]);

pub fn one_of(allowed: &'static [&'static str]) -> OneOf {
    OneOf(allowed)
}

impl Rule<str> for OneOf {
    fn check(&self, value: &str) -> Result<(), String> {
        if self.0.contains(&value) {
            Ok(())
        } else {
            Err(format!("one of {}", self.0.join("|")))
        }
    }
}

impl Rule<String> for OneOf {
    fn check(&self, value: &String) -> Result<(), String> {
        Rule::<str>::check(self, value.as_str())
    }
}

/// Rejects NaN and infinities.
#[derive(Debug, Clone, Copy, Default)]
pub struct Finite;

pub fn finite() -> Finite {
    Finite
}

impl Rule<f64> for Finite {
    fn check(&self, value: &f64) -> Result<(), String> {
        if value.is_finite() {
            Ok(())
        } else {
            Err("a finite number".to_string())
        }
    }
}

/// Accumulates violations across fields.
#[derive(Debug, Default)]
pub struct Validator {
    violations: Vec<FieldViolation>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field<T, R>(mut self, name: &str, value: &T, rule: R) -> Self
    where
        T: Describe + ?Sized,
        R: Rule<T>,
    {
        if let Err(expected) = rule.check(value) {
            self.violations.push(FieldViolation::new(name, value.describe(), expected));
        }
        self
    }

    /// Cross-field check. Skipped when `field` already has a violation.
    pub fn ensure(
        mut self,
        holds: bool,
        field: &str,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        if !holds && !self.violations.iter().any(|v| v.field == field) {
            self.violations.push(FieldViolation::new(field, value, expected));
        }
        self
    }

    /// Fold in the outcome of a nested validation, scoping its fields under `prefix`.
    pub fn nested(mut self, prefix: &str, result: Result<(), InvalidPolicyError>) -> Self {
        if let Err(err) = result {
            self.violations.extend(err.prefixed(prefix).violations().iter().cloned());
        }
        self
    }

    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn finish(self) -> Result<(), InvalidPolicyError> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(InvalidPolicyError::new(self.violations))
        }
    }
}
