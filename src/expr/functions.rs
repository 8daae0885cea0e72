//! Builtin functions exposed to match expressions.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

use crate::expr::eval::EvalError;
use crate::expr::value::Value;

pub fn call(name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    match name {
        "length" => length(args),
        "isDefined" => is_defined(args, false),
        "isUndefined" => is_defined(args, true),
        "isEmpty" => is_empty(args, true),
        "isNotEmpty" => is_empty(args, false),
        "date" => date(args),
        other => Err(EvalError::UnknownFunction(other.to_string())),
    }
}

fn single(name: &'static str, expected: &'static str, mut args: Vec<Value>) -> Result<Value, EvalError> {
    if args.len() != 1 {
        return Err(EvalError::FunctionUsage {
            name: name.to_string(),
            expected: expected.to_string(),
        });
    }
    Ok(args.remove(0))
}

fn length(args: Vec<Value>) -> Result<Value, EvalError> {
    let arg = single("length", "exactly one array, string or object argument", args)?;
    Ok(Value::Number(value_length(&arg)? as f64))
}

fn value_length(value: &Value) -> Result<usize, EvalError> {
    match value {
        Value::Null | Value::Undefined => Ok(0),
        Value::Array(items) => Ok(items.len()),
        Value::String(s) => Ok(s.len()),
        Value::Object(map) => Ok(map.len()),
        other => Err(EvalError::FunctionUsage {
            name: "length".into(),
            expected: format!("an array, string or object argument, got {}", other.type_name()),
        }),
    }
}

fn is_defined(args: Vec<Value>, negate: bool) -> Result<Value, EvalError> {
    let name = if negate { "isUndefined" } else { "isDefined" };
    let arg = single(name, "exactly one argument", args)?;
    let undefined = arg.is_undefined();
    Ok(Value::Bool(if negate { undefined } else { !undefined }))
}

fn is_empty(args: Vec<Value>, want_empty: bool) -> Result<Value, EvalError> {
    let name = if want_empty { "isEmpty" } else { "isNotEmpty" };
    let arg = single(name, "exactly one argument", args)?;
    let len = value_length(&arg).map_err(|_| EvalError::FunctionUsage {
        name: name.into(),
        expected: "an array, string, object, null or undefined argument".into(),
    })?;
    Ok(Value::Bool((len == 0) == want_empty))
}

/// Parse a timestamp from a closed set of formats and return it as Unix
/// seconds (fractional), so the ordinary comparison operators order dates.
fn date(args: Vec<Value>) -> Result<Value, EvalError> {
    let arg = single("date", "exactly one string argument", args)?;
    let text = match arg {
        Value::String(s) => s,
        _ => {
            return Err(EvalError::FunctionUsage {
                name: "date".into(),
                expected: "exactly one string argument".into(),
            })
        }
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(&text) {
        return Ok(timestamp(dt.with_timezone(&Utc)));
    }

    // Offset-carrying formats.
    const OFFSET_FORMATS: [&str; 7] = [
        "%Y-%m-%dT%H:%M:%S%.f%z", // ISO 8601 with nanoseconds
        "%Y-%m-%dT%H:%M:%S%z",    // ISO 8601 with seconds
        "%Y-%m-%dT%H:%M%z",       // ISO 8601 with minutes
        "%Y-%m-%dT%H%z",          // ISO 8601 with hours
        "%Y-%m-%d %H:%M:%S%:z",   // date + time + zone
        "%a %b %d %H:%M:%S %z %Y", // Ruby date
        "%a %b %e %H:%M:%S %z %Y",
    ];
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(&text, format) {
            return Ok(timestamp(dt.with_timezone(&Utc)));
        }
    }

    // Zone-less formats, taken as UTC. The Unix date shape carries a zone
    // abbreviation; chrono matches it and discards the value, so it lands
    // here rather than with the offset formats.
    const NAIVE_FORMATS: [&str; 6] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%a %b %e %H:%M:%S %Y",    // ANSI C asctime
        "%a %b %d %H:%M:%S %Y",
        "%a %b %e %H:%M:%S %Z %Y", // Unix date
        "%a %b %d %H:%M:%S %Z %Y",
    ];
    for format in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&text, format) {
            return Ok(timestamp(Utc.from_utc_datetime(&dt)));
        }
    }

    if let Ok(d) = NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
        let dt = d.and_hms_opt(0, 0, 0).unwrap_or_default();
        return Ok(timestamp(Utc.from_utc_datetime(&dt)));
    }

    // Kitchen clock, e.g. "3:04PM"; anchored at the Unix epoch date.
    if let Ok(t) = NaiveTime::parse_from_str(&text, "%I:%M%p") {
        let d = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
        return Ok(timestamp(Utc.from_utc_datetime(&d.and_time(t))));
    }

    Err(EvalError::DateParse(text))
}

fn timestamp(dt: DateTime<Utc>) -> Value {
    Value::Number(dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_nanos()) / 1e9)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_over_the_value_kinds() {
        assert_eq!(call("length", vec![Value::Null]).unwrap(), Value::Number(0.0));
        assert_eq!(call("length", vec![Value::Undefined]).unwrap(), Value::Number(0.0));
        assert_eq!(
            call("length", vec![Value::String("abc".into())]).unwrap(),
            Value::Number(3.0)
        );
        assert_eq!(
            call("length", vec![Value::Array(vec![Value::Null, Value::Null])]).unwrap(),
            Value::Number(2.0)
        );
        assert!(call("length", vec![Value::Number(1.0)]).is_err());
        assert!(call("length", vec![]).is_err());
    }

    #[test]
    fn definedness_predicates() {
        assert_eq!(call("isDefined", vec![Value::Null]).unwrap(), Value::Bool(true));
        assert_eq!(call("isDefined", vec![Value::Undefined]).unwrap(), Value::Bool(false));
        assert_eq!(call("isUndefined", vec![Value::Undefined]).unwrap(), Value::Bool(true));
        assert_eq!(
            call("isEmpty", vec![Value::Array(vec![])]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            call("isNotEmpty", vec![Value::String("x".into())]).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn date_parses_common_formats() {
        let rfc = call("date", vec![Value::String("2024-05-01T10:00:00Z".into())]).unwrap();
        let plain = call("date", vec![Value::String("2024-05-01 10:00:00".into())]).unwrap();
        assert_eq!(rfc, plain);

        let day = call("date", vec![Value::String("2024-05-01".into())]).unwrap();
        let Value::Number(day) = day else { panic!("expected number") };
        let Value::Number(rfc) = rfc else { panic!("expected number") };
        assert!(day < rfc);

        assert!(call("date", vec![Value::String("not a date".into())]).is_err());
    }

    #[test]
    fn date_parses_unix_date_shape() {
        let unix = call(
            "date",
            vec![Value::String("Wed Mar  5 10:00:00 UTC 2025".into())],
        )
        .unwrap();
        let plain = call("date", vec![Value::String("2025-03-05 10:00:00".into())]).unwrap();
        assert_eq!(unix, plain);
    }

    #[test]
    fn unknown_function_is_an_error() {
        assert!(matches!(
            call("env", vec![]),
            Err(EvalError::UnknownFunction(_))
        ));
    }
}
