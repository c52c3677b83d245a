//! Summary field selectors for the index and the display cache.

/// A field of an index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexField {
    From,
    To,
    Subject,
    MessageId,
    References,
    Label,
}

impl IndexField {
    /// Number of fields in an index record.
    pub const COUNT: usize = 6;

    /// All fields in serialization order.
    pub const ALL: [IndexField; Self::COUNT] = [
        Self::From,
        Self::To,
        Self::Subject,
        Self::MessageId,
        Self::References,
        Self::Label,
    ];

    /// Position of the field inside a serialized record.
    pub fn position(self) -> usize {
        self as usize
    }

    /// The display-cache counterpart, if the field is cached.
    pub fn cache_field(self) -> Option<CacheField> {
        match self {
            Self::From => Some(CacheField::From),
            Self::To => Some(CacheField::To),
            Self::Subject => Some(CacheField::Subject),
            Self::MessageId => Some(CacheField::MessageId),
            Self::References => Some(CacheField::Reference),
            Self::Label => None,
        }
    }
}

/// A field of a decoded display-cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheField {
    From,
    To,
    Subject,
    MessageId,
    Reference,
}

impl CacheField {
    /// Number of fields in a cache entry.
    pub const COUNT: usize = 5;

    /// All fields in serialization order.
    pub const ALL: [CacheField; Self::COUNT] = [
        Self::From,
        Self::To,
        Self::Subject,
        Self::MessageId,
        Self::Reference,
    ];

    /// Position of the field inside a serialized cache section.
    pub fn position(self) -> usize {
        self as usize
    }
}

impl std::str::FromStr for IndexField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "from" => Ok(Self::From),
            "to" => Ok(Self::To),
            "subject" => Ok(Self::Subject),
            "message-id" | "messageid" => Ok(Self::MessageId),
            "references" => Ok(Self::References),
            "label" => Ok(Self::Label),
            other => Err(format!("unknown index field '{other}'")),
        }
    }
}
