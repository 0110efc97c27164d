//! Typed parameter accessors, mirroring the reference implementation's
//! `Core::Parameter*` family: a name, a doc string, and a default, used to
//! read the `&str` values a parameter expression (§4.4) resolves to.
//!
//! Unlike `Core::Parameter*`, these are not tied to a configuration-file
//! layer (out of scope here): a node's `set_parameter`/constructor calls
//! `parse` directly against the already-resolved string value.

/// A boolean parameter: `"true"`/`"1"` are true, anything else is false.
#[derive(Debug, Clone, Copy)]
pub struct ParamBool {
    /// The parameter's name, as it appears as a node attribute.
    pub name: &'static str,
    /// A short description, for documentation purposes only.
    pub doc: &'static str,
    /// The value used when the attribute is absent.
    pub default: bool,
}

impl ParamBool {
    /// Declares a boolean parameter.
    pub const fn new(name: &'static str, doc: &'static str, default: bool) -> Self {
        ParamBool { name, doc, default }
    }

    /// True if `name` names this parameter.
    pub fn matches(&self, name: &str) -> bool {
        self.name == name
    }

    /// Parses `value`.
    pub fn parse(&self, value: &str) -> bool {
        value == "true" || value == "1"
    }
}

/// A floating-point parameter.
#[derive(Debug, Clone, Copy)]
pub struct ParamFloat {
    /// The parameter's name.
    pub name: &'static str,
    /// A short description.
    pub doc: &'static str,
    /// The value used when the attribute is absent.
    pub default: f64,
}

impl ParamFloat {
    /// Declares a floating-point parameter.
    pub const fn new(name: &'static str, doc: &'static str, default: f64) -> Self {
        ParamFloat { name, doc, default }
    }

    /// True if `name` names this parameter.
    pub fn matches(&self, name: &str) -> bool {
        self.name == name
    }

    /// Parses `value`, falling back to [`Self::default`] on a malformed
    /// string (a soft warning the caller may choose to log).
    pub fn parse(&self, value: &str) -> f64 {
        value.parse().unwrap_or(self.default)
    }
}

/// An integer parameter.
#[derive(Debug, Clone, Copy)]
pub struct ParamInt {
    /// The parameter's name.
    pub name: &'static str,
    /// A short description.
    pub doc: &'static str,
    /// The value used when the attribute is absent.
    pub default: i64,
}

impl ParamInt {
    /// Declares an integer parameter.
    pub const fn new(name: &'static str, doc: &'static str, default: i64) -> Self {
        ParamInt { name, doc, default }
    }

    /// True if `name` names this parameter.
    pub fn matches(&self, name: &str) -> bool {
        self.name == name
    }

    /// Parses `value`, falling back to [`Self::default`] on a malformed
    /// string.
    pub fn parse(&self, value: &str) -> i64 {
        value.parse().unwrap_or(self.default)
    }
}

/// A string parameter, returned borrowed or owned from its default.
#[derive(Debug, Clone, Copy)]
pub struct ParamString {
    /// The parameter's name.
    pub name: &'static str,
    /// A short description.
    pub doc: &'static str,
    /// The value used when the attribute is absent.
    pub default: &'static str,
}

impl ParamString {
    /// Declares a string parameter.
    pub const fn new(name: &'static str, doc: &'static str, default: &'static str) -> Self {
        ParamString { name, doc, default }
    }

    /// True if `name` names this parameter.
    pub fn matches(&self, name: &str) -> bool {
        self.name == name
    }

    /// Parses `value` (the identity function; strings need no conversion).
    pub fn parse<'a>(&self, value: &'a str) -> &'a str {
        value
    }
}

/// A parameter restricted to a fixed, named set of values.
///
/// `T` is the enum each choice maps to; choices are listed as
/// `(name, value)` pairs rather than derived via a trait, matching
/// `Core::Choice`'s plain string-keyed table.
pub struct ParamChoice<T: Copy + 'static> {
    /// The parameter's name.
    pub name: &'static str,
    /// A short description.
    pub doc: &'static str,
    /// The `(name, value)` table consulted by [`Self::parse`].
    pub choices: &'static [(&'static str, T)],
    /// The value used when the attribute is absent or unrecognized.
    pub default: T,
}

impl<T: Copy + 'static> ParamChoice<T> {
    /// Declares a choice parameter.
    pub const fn new(name: &'static str, doc: &'static str, choices: &'static [(&'static str, T)], default: T) -> Self {
        ParamChoice { name, doc, choices, default }
    }

    /// True if `name` names this parameter.
    pub fn matches(&self, name: &str) -> bool {
        self.name == name
    }

    /// Looks `value` up in [`Self::choices`], falling back to
    /// [`Self::default`] if it is not one of the recognized names.
    pub fn parse(&self, value: &str) -> T {
        self.choices.iter().find(|(name, _)| *name == value).map(|(_, v)| *v).unwrap_or(self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static UNBUFFERED: ParamBool = ParamBool::new("unbuffered", "flush every write immediately", false);
    static ALPHA: ParamFloat = ParamFloat::new("alpha", "preemphasis coefficient", 1.0);
    static DELAY: ParamInt = ParamInt::new("delay", "frames to accumulate before deciding", 0);

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Kind {
        Rectangular,
        Hamming,
    }

    static WINDOW_KIND: ParamChoice<Kind> = ParamChoice::new(
        "window",
        "tapering function",
        &[("rectangular", Kind::Rectangular), ("hamming", Kind::Hamming)],
        Kind::Rectangular,
    );

    #[test]
    fn bool_parses_truthy_strings() {
        assert!(UNBUFFERED.parse("true"));
        assert!(UNBUFFERED.parse("1"));
        assert!(!UNBUFFERED.parse("false"));
        assert!(!UNBUFFERED.parse("nonsense"));
    }

    #[test]
    fn float_falls_back_to_default_on_parse_failure() {
        assert_eq!(ALPHA.parse("0.95"), 0.95);
        assert_eq!(ALPHA.parse("not-a-number"), 1.0);
    }

    #[test]
    fn int_falls_back_to_default_on_parse_failure() {
        assert_eq!(DELAY.parse("3"), 3);
        assert_eq!(DELAY.parse("?"), 0);
    }

    #[test]
    fn choice_resolves_named_values_and_falls_back_on_miss() {
        assert_eq!(WINDOW_KIND.parse("hamming"), Kind::Hamming);
        assert_eq!(WINDOW_KIND.parse("unknown"), Kind::Rectangular);
    }

    #[test]
    fn matches_checks_the_declared_name() {
        assert!(ALPHA.matches("alpha"));
        assert!(!ALPHA.matches("beta"));
    }
}
