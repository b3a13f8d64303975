use std::fmt;

/// The two kinds of bearer credential the service hands out. Each class is
/// signed with its own RSA key pair and carries its own TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenClass {
    Access,
    Refresh,
}

impl TokenClass {
    pub const ALL: [TokenClass; 2] = [TokenClass::Access, TokenClass::Refresh];

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenClass::Access => "access",
            TokenClass::Refresh => "refresh",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            TokenClass::Access => 0,
            TokenClass::Refresh => 1,
        }
    }
}

impl fmt::Display for TokenClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// At-rest identifiers for each token class. They name the key files on disk
/// and end up in the `kid` header of issued tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassIdentifiers {
    pub access: String,
    pub refresh: String,
}

impl ClassIdentifiers {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
        }
    }

    pub fn get(&self, class: TokenClass) -> &str {
        match class {
            TokenClass::Access => &self.access,
            TokenClass::Refresh => &self.refresh,
        }
    }
}

impl Default for ClassIdentifiers {
    fn default() -> Self {
        Self::new(TokenClass::Access.as_str(), TokenClass::Refresh.as_str())
    }
}
