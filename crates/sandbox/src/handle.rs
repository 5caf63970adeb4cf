use std::fmt;

/// Opaque identifier of one isolation unit, assigned by the provider at
/// creation and stable for the unit's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitHandle(String);

impl UnitHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for UnitHandle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
