use carbond_points::MetricBatch;
use serde_pickle::value::Value;
use serde_pickle::DeOptions;
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum PickleParseError {
    #[error(transparent)]
    Pickle(#[from] serde_pickle::Error),

    #[error("expected a list of (metric, (timestamp, value)) rows")]
    BadShape,
}

/// Decode one pickle receiver frame: a list of `(metric, (timestamp,
/// value))` rows, one batch per row. Python 2 senders pickle metric names
/// as bytes and numbers as either ints or floats; all of that is accepted.
pub(crate) fn parse_pickle_points(data: &[u8]) -> Result<Vec<MetricBatch>, PickleParseError> {
    let value: Value = serde_pickle::from_slice(data, DeOptions::new())?;

    let rows = match value {
        Value::List(rows) | Value::Tuple(rows) => rows,
        _ => return Err(PickleParseError::BadShape),
    };

    let mut batches = Vec::with_capacity(rows.len());
    for row in rows {
        let fields = match row {
            Value::List(fields) | Value::Tuple(fields) => fields,
            _ => return Err(PickleParseError::BadShape),
        };
        let [metric, point] = <[Value; 2]>::try_from(fields)
            .map_err(|_| PickleParseError::BadShape)?;

        let metric = match metric {
            Value::String(s) => s,
            Value::Bytes(b) => String::from_utf8_lossy(&b).into_owned(),
            _ => return Err(PickleParseError::BadShape),
        };

        let pair = match point {
            Value::List(pair) | Value::Tuple(pair) => pair,
            _ => return Err(PickleParseError::BadShape),
        };
        let [timestamp, val] =
            <[Value; 2]>::try_from(pair).map_err(|_| PickleParseError::BadShape)?;

        let timestamp = number(&timestamp).ok_or(PickleParseError::BadShape)?.round() as i64;
        let val = number(&val).ok_or(PickleParseError::BadShape)?;

        batches.push(MetricBatch::one_point(metric, val, timestamp));
    }

    Ok(batches)
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::I64(n) => Some(*n as f64),
        Value::F64(f) => Some(*f),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_pickle::SerOptions;

    #[test]
    fn decodes_rows_into_batches() {
        let rows: Vec<(String, (i64, f64))> = vec![
            ("a.b".to_string(), (10, 42.0)),
            ("c.d".to_string(), (12, 15.5)),
        ];
        let payload = serde_pickle::to_vec(&rows, SerOptions::new()).unwrap();

        let batches = parse_pickle_points(&payload).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].metric, "a.b");
        assert_eq!(batches[0].data[0].timestamp, 10);
        assert_eq!(batches[1].data[0].value, 15.5);
    }

    #[test]
    fn accepts_float_timestamps() {
        let rows: Vec<(String, (f64, f64))> = vec![("a".to_string(), (10.7, 1.0))];
        let payload = serde_pickle::to_vec(&rows, SerOptions::new()).unwrap();
        let batches = parse_pickle_points(&payload).unwrap();
        assert_eq!(batches[0].data[0].timestamp, 11);
    }

    #[test]
    fn rejects_wrong_shapes() {
        for bad in [
            serde_pickle::to_vec(&42i64, SerOptions::new()).unwrap(),
            serde_pickle::to_vec(&vec![1i64, 2, 3], SerOptions::new()).unwrap(),
            b"not a pickle at all".to_vec(),
        ] {
            assert!(parse_pickle_points(&bad).is_err());
        }
    }
}
