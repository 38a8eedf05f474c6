use crate::errors::ServerError;
use crate::push::PushKind;

/// A single decoded protocol element.
///
/// Aggregate variants own their children, so a `Value` is always a complete
/// reply (or a complete element of an enclosing reply). Error elements that
/// arrive nested inside an aggregate are kept as typed [`Value::ServerError`]
/// values instead of failing the whole command.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A null value (`_\r\n`, or a negative declared length).
    Nil,
    /// The `+OK` status reply, special-cased because it is so common.
    Okay,
    /// A simple (line) string.
    SimpleString(String),
    /// An integer reply.
    Int(i64),
    /// A length-prefixed binary-safe string.
    BulkString(Vec<u8>),
    /// An ordered sequence of elements.
    Array(Vec<Value>),
    /// Key-value pairs, preserving server order.
    Map(Vec<(Value, Value)>),
    /// A double-precision float.
    Double(f64),
    /// A boolean.
    Boolean(bool),
    /// An error element nested inside an aggregate reply.
    ServerError(ServerError),
    /// An out-of-band push message.
    Push {
        /// Kind of the push message.
        kind: PushKind,
        /// Payload elements following the kind marker.
        data: Vec<Value>,
    },
}

impl Value {
    /// Views the value as a flat sequence of elements, if it is one.
    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Converts the value into key-value pairs.
    ///
    /// Accepts a map reply directly, or a flat even-length array of
    /// alternating keys and values (the older wire format for map-shaped
    /// data). `Nil` converts to an empty pair list.
    pub fn into_map_pairs(self) -> Option<Vec<(Value, Value)>> {
        match self {
            Value::Map(pairs) => Some(pairs),
            Value::Nil => Some(Vec::new()),
            Value::Array(items) if items.len() % 2 == 0 => {
                let mut it = items.into_iter();
                let mut pairs = Vec::with_capacity(it.len() / 2);
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    pairs.push((k, v));
                }
                Some(pairs)
            }
            _ => None,
        }
    }

    /// Returns true for aggregate-shaped values.
    pub fn is_aggregate(&self) -> bool {
        matches!(
            self,
            Value::Array(_) | Value::Map(_) | Value::Push { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_array_pairs_up() {
        let value = Value::Array(vec![
            Value::SimpleString("k1".into()),
            Value::Int(1),
            Value::SimpleString("k2".into()),
            Value::Int(2),
        ]);
        let pairs = value.into_map_pairs().unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1], (Value::SimpleString("k2".into()), Value::Int(2)));
    }

    #[test]
    fn odd_array_is_not_a_map() {
        let value = Value::Array(vec![Value::Int(1)]);
        assert_eq!(value.into_map_pairs(), None);
    }
}
