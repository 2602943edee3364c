//! Firefox preference serialization for `user.js`.
//!
//! Preferences are written as JavaScript function calls:
//!
//! ```javascript
//! user_pref("preference.name", value);
//! ```

// ============================================================================
// PreferenceValue
// ============================================================================

/// A preference value in `user.js`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PreferenceValue {
    /// Boolean value.
    Bool(bool),

    /// Integer value.
    Int(i32),

    /// String value.
    String(String),
}

impl PreferenceValue {
    /// Formats the value for `user.js`.
    #[must_use]
    pub fn to_js_string(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::String(s) => format!("\"{}\"", escape_js_string(s)),
        }
    }
}

impl From<bool> for PreferenceValue {
    #[inline]
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for PreferenceValue {
    #[inline]
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<String> for PreferenceValue {
    #[inline]
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for PreferenceValue {
    #[inline]
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

// ============================================================================
// FirefoxPreference
// ============================================================================

/// A Firefox preference with a name and value.
#[derive(Debug, Clone)]
pub struct FirefoxPreference {
    /// Preference name (e.g., "devtools.debugger.remote-enabled").
    pub key: String,

    /// Preference value.
    pub value: PreferenceValue,
}

impl FirefoxPreference {
    /// Creates a new preference.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<PreferenceValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Renders the `user_pref(...)` line for `user.js`.
    #[must_use]
    pub fn to_user_pref_line(&self) -> String {
        format!(
            "user_pref(\"{}\", {});",
            escape_js_string(&self.key),
            self.value.to_js_string()
        )
    }
}

/// Escapes backslashes and double quotes for a JS string literal.
fn escape_js_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bool_value() {
        let pref = FirefoxPreference::new("devtools.debugger.remote-enabled", true);
        assert_eq!(
            pref.to_user_pref_line(),
            "user_pref(\"devtools.debugger.remote-enabled\", true);"
        );
    }

    #[test]
    fn test_int_value() {
        let pref = FirefoxPreference::new("browser.startup.page", 0);
        assert_eq!(
            pref.to_user_pref_line(),
            "user_pref(\"browser.startup.page\", 0);"
        );
    }

    #[test]
    fn test_string_value_is_quoted() {
        let pref = FirefoxPreference::new("startup.homepage_welcome_url", "about:blank");
        assert_eq!(
            pref.to_user_pref_line(),
            "user_pref(\"startup.homepage_welcome_url\", \"about:blank\");"
        );
    }

    #[test]
    fn test_string_value_is_escaped() {
        let pref = FirefoxPreference::new("test.pref", r#"a"b\c"#);
        assert_eq!(
            pref.to_user_pref_line(),
            r#"user_pref("test.pref", "a\"b\\c");"#
        );
    }
}
