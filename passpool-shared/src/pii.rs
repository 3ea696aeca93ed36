use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Wraps a sensitive value (ticket numbers, phone numbers) so that `{:?}` and `{}` in
/// log macros never print it. Serialization still emits the real value.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Masked<T>(pub T);

impl<T> Masked<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Masked<String> {
    /// Last four characters, prefixed with asterisks, for display to group members
    pub fn hint(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        let visible = chars.len().min(4);
        let tail: String = chars[chars.len() - visible..].iter().collect();
        format!("****{}", tail)
    }
}

impl<T> fmt::Debug for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("********")
    }
}

impl<T> fmt::Display for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("********")
    }
}

impl<T: Serialize> Serialize for Masked<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}
