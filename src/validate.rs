//! Validators run before a value is committed to a slice.

use std::fmt::Debug;
use std::sync::Arc;

use serde::Serialize;

/// Accepts or rejects a candidate slice value.
pub trait Validator<T>: Send + Sync {
    /// Returns true if `value` may be committed.
    fn validate(&self, value: &T) -> bool;

    /// Human-readable description of what is accepted, used in the
    /// validation error.
    fn describe(&self) -> String {
        "value rejected by validator".to_string()
    }

    /// Validate `value`, returning the rejection reason on failure.
    ///
    /// The reason belongs to this call alone, so a validator shared between
    /// slices reports the right reason for each.
    fn check(&self, value: &T) -> std::result::Result<(), String> {
        if self.validate(value) {
            Ok(())
        } else {
            Err(self.describe())
        }
    }
}

/// Accepts only values from a fixed set.
#[derive(Debug, Clone)]
pub struct OneOf<T> {
    allowed: Vec<T>,
}

impl<T> OneOf<T> {
    /// Create a validator accepting exactly `allowed`.
    pub fn new(allowed: impl IntoIterator<Item = T>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl<T: PartialEq + Debug + Send + Sync> Validator<T> for OneOf<T> {
    fn validate(&self, value: &T) -> bool {
        self.allowed.contains(value)
    }

    fn describe(&self) -> String {
        format!("expected one of {:?}", self.allowed)
    }
}

/// Accepts numbers within an inclusive range.
#[derive(Debug, Clone, Copy)]
pub struct NumberRange<T> {
    min: T,
    max: T,
}

impl<T> NumberRange<T> {
    /// Create a validator accepting `min..=max`.
    pub fn new(min: T, max: T) -> Self {
        Self { min, max }
    }
}

impl<T: PartialOrd + Debug + Send + Sync> Validator<T> for NumberRange<T> {
    fn validate(&self, value: &T) -> bool {
        *value >= self.min && *value <= self.max
    }

    fn describe(&self) -> String {
        format!("expected a value between {:?} and {:?}", self.min, self.max)
    }
}

/// Closure-backed validator, see [`predicate`].
pub struct Predicate<F> {
    check: F,
    description: String,
}

/// Build a validator from a closure and a description of what it accepts.
pub fn predicate<T, F>(description: impl Into<String>, check: F) -> Predicate<F>
where
    F: Fn(&T) -> bool + Send + Sync,
{
    Predicate {
        check,
        description: description.into(),
    }
}

impl<T, F> Validator<T> for Predicate<F>
where
    F: Fn(&T) -> bool + Send + Sync,
{
    fn validate(&self, value: &T) -> bool {
        (self.check)(value)
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

/// Accepts a value only if every inner validator does.
///
/// [`Validator::check`] reports the first rejecting rule's reason.
pub struct AllOf<T> {
    validators: Vec<Arc<dyn Validator<T>>>,
}

impl<T> AllOf<T> {
    /// Combine validators; they run in order and stop at the first rejection.
    pub fn new(validators: Vec<Arc<dyn Validator<T>>>) -> Self {
        Self { validators }
    }
}

impl<T> Validator<T> for AllOf<T> {
    fn validate(&self, value: &T) -> bool {
        self.check(value).is_ok()
    }

    fn describe(&self) -> String {
        let rules: Vec<String> = self.validators.iter().map(|v| v.describe()).collect();
        rules.join("; ")
    }

    fn check(&self, value: &T) -> std::result::Result<(), String> {
        self.validators.iter().try_for_each(|v| v.check(value))
    }
}

/// Rejects values whose JSON encoding exceeds `max_bytes`.
///
/// Useful for opaque analysis payloads that must stay within the flat
/// backend's quota.
#[derive(Debug, Clone, Copy)]
pub struct MaxEncodedSize {
    max_bytes: usize,
}

impl MaxEncodedSize {
    /// Create a size limit in bytes.
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl<T: Serialize> Validator<T> for MaxEncodedSize {
    fn validate(&self, value: &T) -> bool {
        serde_json::to_vec(value).is_ok_and(|bytes| bytes.len() <= self.max_bytes)
    }

    fn describe(&self) -> String {
        format!("encoded value must be at most {} bytes", self.max_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_of() {
        let theme = OneOf::new(["light", "dark", "system"].map(String::from));
        assert!(theme.validate(&"dark".to_string()));
        assert!(!theme.validate(&"purple".to_string()));
        assert!(theme.describe().contains("light"));
    }

    #[test]
    fn test_number_range() {
        let zoom = NumberRange::new(0.25, 8.0);
        assert!(zoom.validate(&1.0));
        assert!(zoom.validate(&8.0));
        assert!(!zoom.validate(&9.5));
        assert!(!zoom.validate(&f64::NAN));
    }

    #[test]
    fn test_predicate() {
        let even = predicate("expected an even window size", |n: &u32| n % 2 == 0);
        assert!(even.validate(&2048));
        assert!(!even.validate(&2047));
        assert_eq!(Validator::<u32>::describe(&even), "expected an even window size");
    }

    #[test]
    fn test_all_of_reports_failing_rule() {
        let rules: AllOf<u32> = AllOf::new(vec![
            Arc::new(NumberRange::new(64u32, 8192)),
            Arc::new(predicate("expected a power of two", |n: &u32| n.is_power_of_two())),
        ]);
        assert!(rules.validate(&1024));
        assert_eq!(rules.check(&1000), Err("expected a power of two".to_string()));
        assert!(rules.check(&16).unwrap_err().contains("between"));
        assert!(rules.describe().contains("between"));
        assert!(rules.describe().contains("power of two"));
    }

    #[test]
    fn test_all_of_shared_across_threads() {
        let rules: Arc<AllOf<u32>> = Arc::new(AllOf::new(vec![
            Arc::new(NumberRange::new(64u32, 8192)),
            Arc::new(predicate("expected a power of two", |n: &u32| n.is_power_of_two())),
        ]));
        std::thread::scope(|scope| {
            for (value, needle) in [(1000u32, "power of two"), (16, "between")] {
                let rules = Arc::clone(&rules);
                scope.spawn(move || {
                    for _ in 0..500 {
                        assert!(rules.check(&value).unwrap_err().contains(needle));
                    }
                });
            }
        });
    }

    #[test]
    fn test_max_encoded_size() {
        let limit = MaxEncodedSize::new(8);
        assert!(limit.validate(&"short"));
        assert!(!limit.validate(&"much too long"));
    }
}
