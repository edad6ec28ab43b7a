//! Typed access to the argument values of a call frame
//!
//! Every accessor takes an optional frame (the innermost call when `None`)
//! and a 0-based parameter index. Getters return `None` when the frame or
//! parameter does not exist, the value is NULL or it does not convert;
//! setters return `false` when the value cannot be stored. Nothing here
//! returns an error.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use tracing::debug;

use crate::host::Host;
use crate::session::{FrameId, Session};
use crate::types::{FieldDef, SqlType, Value};

/// Typed argument accessors over a session's call stack
pub struct RuntimeService<'a, H: Host> {
    session: &'a mut Session<H>,
}

impl<'a, H: Host> RuntimeService<'a, H> {
    pub fn new(session: &'a mut Session<H>) -> Self {
        RuntimeService { session }
    }

    fn value(&self, frame: Option<FrameId>, index: usize) -> Option<&Value> {
        let frame = frame.or_else(|| self.session.active_frame())?;
        let ctx = self.session.frame(frame)?;
        if index >= ctx.routine().params().len() {
            return None;
        }
        ctx.get(index).ok().filter(|v| !v.is_null())
    }

    fn store(&mut self, frame: Option<FrameId>, index: usize, value: Value) -> bool {
        let Some(frame) = frame.or_else(|| self.session.active_frame()) else {
            return false;
        };
        let Some(ctx) = self.session.frame_mut(frame) else {
            return false;
        };
        if index >= ctx.routine().params().len() {
            return false;
        }
        match ctx.set(index, value) {
            Ok(()) => true,
            Err(err) => {
                debug!(index, error = %err, "argument not stored");
                false
            }
        }
    }

    /// Convert the argument through a temporal field of type `sql_type`
    fn temporal(&self, frame: Option<FrameId>, index: usize, sql_type: SqlType) -> Option<Value> {
        let value = self.value(frame, index)?.clone();
        FieldDef::new(sql_type).coerce(value, true).ok()
    }

    pub fn get_int(&self, frame: Option<FrameId>, index: usize) -> Option<i64> {
        i64::try_from(self.value(frame, index)?.as_i128()?).ok()
    }

    pub fn set_int(&mut self, frame: Option<FrameId>, index: usize, value: i64) -> bool {
        self.store(frame, index, Value::Int(value))
    }

    pub fn get_unsigned(&self, frame: Option<FrameId>, index: usize) -> Option<u64> {
        u64::try_from(self.value(frame, index)?.as_i128()?).ok()
    }

    pub fn set_unsigned(&mut self, frame: Option<FrameId>, index: usize, value: u64) -> bool {
        self.store(frame, index, Value::UInt(value))
    }

    pub fn get_float(&self, frame: Option<FrameId>, index: usize) -> Option<f64> {
        self.value(frame, index)?.as_f64()
    }

    pub fn set_float(&mut self, frame: Option<FrameId>, index: usize, value: f64) -> bool {
        self.store(frame, index, Value::Double(value))
    }

    pub fn get_date(&self, frame: Option<FrameId>, index: usize) -> Option<NaiveDate> {
        match self.temporal(frame, index, SqlType::Date)? {
            Value::Date(d) => Some(d),
            _ => None,
        }
    }

    pub fn set_date(&mut self, frame: Option<FrameId>, index: usize, value: NaiveDate) -> bool {
        self.store(frame, index, Value::Date(value))
    }

    pub fn get_time(&self, frame: Option<FrameId>, index: usize) -> Option<NaiveTime> {
        match self.temporal(frame, index, SqlType::Time)? {
            Value::Time(t) => Some(t),
            _ => None,
        }
    }

    pub fn set_time(&mut self, frame: Option<FrameId>, index: usize, value: NaiveTime) -> bool {
        self.store(frame, index, Value::Time(value))
    }

    pub fn get_datetime(&self, frame: Option<FrameId>, index: usize) -> Option<NaiveDateTime> {
        match self.temporal(frame, index, SqlType::DateTime)? {
            Value::DateTime(dt) => Some(dt),
            _ => None,
        }
    }

    pub fn set_datetime(&mut self, frame: Option<FrameId>, index: usize, value: NaiveDateTime) -> bool {
        self.store(frame, index, Value::DateTime(value))
    }

    /// Timestamp argument rendered in `tz`
    pub fn get_timestamp<Tz: TimeZone>(&self, frame: Option<FrameId>, index: usize, tz: &Tz) -> Option<DateTime<Tz>> {
        match self.temporal(frame, index, SqlType::Timestamp)? {
            Value::Timestamp(ts) => Some(ts.with_timezone(tz)),
            _ => None,
        }
    }

    /// Store a timestamp given in any time zone; it is kept in UTC
    pub fn set_timestamp<Tz: TimeZone>(&mut self, frame: Option<FrameId>, index: usize, value: &DateTime<Tz>) -> bool {
        self.store(frame, index, Value::Timestamp(value.with_timezone(&Utc)))
    }

    pub fn get_string(&self, frame: Option<FrameId>, index: usize) -> Option<String> {
        Some(self.value(frame, index)?.to_text())
    }

    pub fn set_string(&mut self, frame: Option<FrameId>, index: usize, value: &str) -> bool {
        self.store(frame, index, Value::Text(value.to_string()))
    }

    /// Whether the argument is NULL; `None` if it does not exist
    pub fn is_null(&self, frame: Option<FrameId>, index: usize) -> Option<bool> {
        let frame = frame.or_else(|| self.session.active_frame())?;
        let ctx = self.session.frame(frame)?;
        if index >= ctx.routine().params().len() {
            return None;
        }
        ctx.get(index).ok().map(Value::is_null)
    }

    pub fn set_null(&mut self, frame: Option<FrameId>, index: usize) -> bool {
        self.store(frame, index, Value::Null)
    }

    /// Function result assigned so far
    pub fn get_return_value(&self, frame: Option<FrameId>) -> Option<Value> {
        let frame = frame.or_else(|| self.session.active_frame())?;
        self.session.frame(frame)?.return_value().cloned()
    }

    pub fn set_return_value(&mut self, frame: Option<FrameId>, value: Value) -> bool {
        let Some(frame) = frame.or_else(|| self.session.active_frame()) else {
            return false;
        };
        match self.session.frame_mut(frame) {
            Some(ctx) => ctx.set_return_value(value).is_ok(),
            None => false,
        }
    }
}
