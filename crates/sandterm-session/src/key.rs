/// A logical key, independent of keyboard layout.
///
/// Anything that is not one of the named keys arrives as `Text` and is
/// treated as printable input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyInput {
    Enter,
    Backspace,
    Tab,
    /// Ctrl-C.
    Interrupt,
    Text(String),
}

impl KeyInput {
    pub fn char(ch: char) -> Self {
        Self::Text(ch.to_string())
    }

    /// One `Text` key per character of `text`.
    pub fn typed(text: &str) -> Vec<Self> {
        text.chars().map(Self::char).collect()
    }
}
