//! Services for embedding and introspection layers
//!
//! - [`routine_info`]: routine attributes by string key
//! - [`arguments`]: parameter and return value metadata by string key
//! - [`runtime`]: typed get/set of argument values in a call frame

pub mod arguments;
pub mod routine_info;
pub mod runtime;

use std::fmt;

pub use arguments::{argument_metadata, return_metadata};
pub use routine_info::routine_metadata;
pub use runtime::RuntimeService;

/// Value of a metadata key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaValue {
    Str(String),
    UInt(u64),
    Bool(bool),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            MetaValue::UInt(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetaValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Str(s) => write!(f, "{}", s),
            MetaValue::UInt(n) => write!(f, "{}", n),
            MetaValue::Bool(b) => write!(f, "{}", b),
        }
    }
}
