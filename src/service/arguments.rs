//! Parameter and return value metadata by key

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::ast::ParamMode;
use crate::error::{Error, ErrorCode, Result};
use crate::routine::Routine;
use crate::service::MetaValue;
use crate::types::FieldDef;

type FieldGetter = fn(&FieldDef) -> MetaValue;

lazy_static! {
    /// Keys answered from the declared field alone
    static ref FIELD_KEYS: HashMap<&'static str, FieldGetter> = {
        let mut keys: HashMap<&'static str, FieldGetter> = HashMap::new();
        keys.insert("sql_type", |f| MetaValue::UInt(f.sql_type.code() as u64));
        keys.insert("type_name", |f| MetaValue::Str(f.to_string()));
        keys.insert("is_signed", |f| MetaValue::Bool(!f.unsigned));
        keys.insert("is_nullable", |f| MetaValue::Bool(f.nullable));
        keys.insert("byte_length", |f| MetaValue::UInt(f.byte_length() as u64));
        keys.insert("char_length", |f| MetaValue::UInt(f.char_length() as u64));
        keys.insert("charset", |f| MetaValue::Str(f.charset_name().to_string()));
        keys.insert("decimals", |f| MetaValue::UInt(f.decimals.unwrap_or(0) as u64));
        keys
    };
}

/// Look up an attribute of parameter `index` (0-based)
///
/// Besides the field keys (`sql_type`, `type_name`, `is_signed`,
/// `is_nullable`, `byte_length`, `char_length`, `charset`, `decimals`) this
/// answers `argument_name`, `in_variable` and `out_variable`.
pub fn argument_metadata(routine: &Routine, index: usize, key: &str) -> Result<MetaValue> {
    let param = routine.params().get(index).ok_or_else(|| {
        Error::with_message(
            ErrorCode::InvalidArgument,
            format!("{} has no argument {}", routine, index),
        )
    })?;
    match key {
        "argument_name" => Ok(MetaValue::Str(param.name.clone())),
        "in_variable" => Ok(MetaValue::Bool(param.mode.is_in())),
        "out_variable" => Ok(MetaValue::Bool(param.mode.is_out())),
        "in_out_variable" => Ok(MetaValue::Bool(param.mode == ParamMode::InOut)),
        _ => field_metadata(&param.field, key),
    }
}

/// Look up an attribute of a function's return value
pub fn return_metadata(routine: &Routine, key: &str) -> Result<MetaValue> {
    let field = routine.returns().ok_or_else(|| {
        Error::with_message(ErrorCode::InvalidArgument, format!("{} has no return value", routine))
    })?;
    field_metadata(field, key)
}

fn field_metadata(field: &FieldDef, key: &str) -> Result<MetaValue> {
    FIELD_KEYS
        .get(key)
        .map(|get| get(field))
        .ok_or_else(|| Error::with_message(ErrorCode::InvalidArgument, format!("Unknown argument attribute: {}", key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, Param, RoutineSource, Stmt};
    use crate::compile::compile;
    use crate::routine::RoutineDefinition;
    use crate::types::{QualifiedName, RoutineKind, SqlType};

    fn function() -> Routine {
        let name = QualifiedName::new("db", "label");
        let def = RoutineDefinition::new(name.clone(), RoutineKind::Function, "RETURN ...");
        let source = RoutineSource {
            name,
            kind: RoutineKind::Function,
            params: vec![
                Param::new("id", ParamMode::In, FieldDef::new(SqlType::Int).unsigned().not_null()),
                Param::new("price", ParamMode::In, FieldDef::new(SqlType::Decimal).with_length(10).with_decimals(2)),
            ],
            returns: Some(FieldDef::new(SqlType::VarChar).with_length(20)),
            body: Stmt::Return(Expr::lit("x")),
        };
        compile(&def, &source, 1, 0).unwrap()
    }

    #[test]
    fn test_argument_keys() {
        let f = function();
        assert_eq!(argument_metadata(&f, 0, "argument_name").unwrap().as_str(), Some("id"));
        assert_eq!(argument_metadata(&f, 0, "sql_type").unwrap().as_u64(), Some(3));
        assert_eq!(argument_metadata(&f, 0, "is_signed").unwrap().as_bool(), Some(false));
        assert_eq!(argument_metadata(&f, 0, "is_nullable").unwrap().as_bool(), Some(false));
        assert_eq!(argument_metadata(&f, 0, "in_variable").unwrap().as_bool(), Some(true));
        assert_eq!(argument_metadata(&f, 0, "out_variable").unwrap().as_bool(), Some(false));
        assert_eq!(argument_metadata(&f, 0, "charset").unwrap().as_str(), Some("binary"));
        assert_eq!(argument_metadata(&f, 1, "decimals").unwrap().as_u64(), Some(2));
        assert_eq!(argument_metadata(&f, 1, "type_name").unwrap().as_str(), Some("DECIMAL(10,2)"));
        assert_eq!(argument_metadata(&f, 2, "sql_type").unwrap_err().code, ErrorCode::InvalidArgument);
        assert_eq!(argument_metadata(&f, 0, "color").unwrap_err().code, ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_return_keys() {
        let f = function();
        assert_eq!(return_metadata(&f, "char_length").unwrap().as_u64(), Some(20));
        assert_eq!(return_metadata(&f, "byte_length").unwrap().as_u64(), Some(80));
        assert_eq!(return_metadata(&f, "charset").unwrap().as_str(), Some("utf8mb4"));
    }
}
