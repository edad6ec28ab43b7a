//! Routine introspection by key

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::error::{Error, ErrorCode, Result};
use crate::routine::Routine;
use crate::service::MetaValue;
use crate::types::RoutineKind;

type Getter = fn(&Routine) -> MetaValue;

lazy_static! {
    static ref ROUTINE_KEYS: HashMap<&'static str, Getter> = {
        let mut keys: HashMap<&'static str, Getter> = HashMap::new();
        keys.insert("sp_name", |r| MetaValue::Str(r.name().name.clone()));
        keys.insert("database_name", |r| MetaValue::Str(r.name().db.clone()));
        keys.insert("qualified_name", |r| MetaValue::Str(r.name().to_string()));
        keys.insert("sp_language", |r| MetaValue::Str(r.definition().language.clone()));
        keys.insert("sp_body", |r| MetaValue::Str(r.definition().body.clone()));
        keys.insert("sp_type", |r| {
            MetaValue::UInt(match r.kind() {
                RoutineKind::Function => 1,
                RoutineKind::Procedure => 2,
            })
        });
        keys.insert("argument_count", |r| MetaValue::UInt(r.params().len() as u64));
        keys
    };
}

/// Look up a routine attribute
///
/// Keys: `sp_name`, `database_name`, `qualified_name`, `sp_language`,
/// `sp_body`, `sp_type` (1 function, 2 procedure), `argument_count`.
pub fn routine_metadata(routine: &Routine, key: &str) -> Result<MetaValue> {
    ROUTINE_KEYS
        .get(key)
        .map(|get| get(routine))
        .ok_or_else(|| Error::with_message(ErrorCode::InvalidArgument, format!("Unknown routine attribute: {}", key)))
}
