use serde::Serialize;
use std::fmt;

/// One strategy for locating a page element.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Accessibility role plus accessible name.
    Role { role: String, name: String },
    Css(String),
    /// Any element whose text content contains the string.
    Text(String),
}

impl Selector {
    pub fn role(role: &str, name: &str) -> Self {
        Selector::Role {
            role: role.to_string(),
            name: name.to_string(),
        }
    }

    pub fn css(css: &str) -> Self {
        Selector::Css(css.to_string())
    }

    pub fn text(text: &str) -> Self {
        Selector::Text(text.to_string())
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Role { role, name } => write!(f, "{role}[name={name:?}]"),
            Selector::Css(css) => write!(f, "css({css})"),
            Selector::Text(text) => write!(f, "text({text:?})"),
        }
    }
}

/// A page element the flow needs, with lookup strategies in priority
/// order. Portals shuffle their markup; the fallbacks are what keep a
/// markup change from being an instant outage.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: &'static str,
    pub strategies: Vec<Selector>,
}

impl Target {
    pub fn new(name: &'static str, strategies: Vec<Selector>) -> Self {
        assert!(!strategies.is_empty(), "target needs at least one strategy");
        Self { name, strategies }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
