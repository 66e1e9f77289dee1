#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Visibility {
    #[default]
    Public,
    Protected,
    Private,
    /// Private instance method plus a public copy on the module itself.
    ModuleFunction,
}

impl Visibility {
    pub fn is_private(self) -> bool {
        matches!(self, Self::Private | Self::ModuleFunction)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Protected => "protected",
            Self::Private | Self::ModuleFunction => "private",
        }
    }
}

/// Shape of the call expression that reached a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallType {
    /// `recv.foo`
    #[default]
    Normal,
    /// `foo(...)`, implicit receiver
    Functional,
    Super,
    /// bare `foo`, could have been a local variable
    Variable,
}

impl CallType {
    pub fn has_implicit_receiver(self) -> bool {
        !matches!(self, Self::Normal)
    }
}
