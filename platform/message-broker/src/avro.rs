//! Avro binary encoding for the schema path
//!
//! Payload trees are converted into Avro values by walking the writer
//! schema, so the output only ever contains value kinds the schema accepts.
//! Encoded datums are framed the way registry-aware serializers expect:
//!
//! ```text
//! [0x00][schema_id: u32 big-endian][avro datum]
//! ```
//!
//! The schema itself is never embedded; readers fetch it by id.

use apache_avro::types::Value;
use apache_avro::Schema;
use std::collections::{BTreeMap, HashMap};

use crate::error::{BrokerError, BrokerResult};
use crate::payload::Payload;

/// Leading byte of a registry-framed datum
pub const MAGIC_BYTE: u8 = 0;

const HEADER_LEN: usize = 5;

/// Prefix an encoded datum with the registry header
pub fn frame(schema_id: u32, datum: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + datum.len());
    out.push(MAGIC_BYTE);
    out.extend_from_slice(&schema_id.to_be_bytes());
    out.extend_from_slice(datum);
    out
}

/// Split a framed payload into schema id and datum
pub fn unframe(bytes: &[u8]) -> BrokerResult<(u32, &[u8])> {
    if bytes.len() < HEADER_LEN {
        return Err(BrokerError::Decode(format!(
            "framed avro payload too short: {} bytes",
            bytes.len()
        )));
    }
    if bytes[0] != MAGIC_BYTE {
        return Err(BrokerError::Decode(format!(
            "unknown magic byte {:#04x}",
            bytes[0]
        )));
    }
    let id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    Ok((id, &bytes[HEADER_LEN..]))
}

/// Encode a payload tree as an Avro datum (unframed)
pub fn encode_datum(schema: &Schema, payload: &Payload) -> BrokerResult<Vec<u8>> {
    let names = NamedSchemas::collect(schema);
    let value = to_avro(payload, schema, &names)?;
    apache_avro::to_avro_datum(schema, value).map_err(|e| BrokerError::Encode(e.to_string()))
}

/// Decode an Avro datum (unframed) back into a payload tree
pub fn decode_datum(schema: &Schema, mut datum: &[u8]) -> BrokerResult<Payload> {
    let value = apache_avro::from_avro_datum(schema, &mut datum, None)
        .map_err(|e| BrokerError::Decode(e.to_string()))?;
    denormalize(value)
}

/// Named types reachable from a root schema, keyed by full name
struct NamedSchemas<'a> {
    by_name: HashMap<String, &'a Schema>,
}

impl<'a> NamedSchemas<'a> {
    fn collect(root: &'a Schema) -> Self {
        let mut names = Self {
            by_name: HashMap::new(),
        };
        names.visit(root);
        names
    }

    fn visit(&mut self, schema: &'a Schema) {
        match schema {
            Schema::Record(record) => {
                self.by_name.insert(record.name.fullname(None), schema);
                for field in &record.fields {
                    self.visit(&field.schema);
                }
            }
            Schema::Enum(e) => {
                self.by_name.insert(e.name.fullname(None), schema);
            }
            Schema::Fixed(f) => {
                self.by_name.insert(f.name.fullname(None), schema);
            }
            Schema::Array(items) => self.visit(items),
            Schema::Map(values) => self.visit(values),
            Schema::Union(union) => {
                for variant in union.variants() {
                    self.visit(variant);
                }
            }
            _ => {}
        }
    }

    fn get(&self, name: &str) -> BrokerResult<&'a Schema> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| BrokerError::Encode(format!("unresolved schema reference '{name}'")))
    }
}

fn mismatch(payload: &Payload, expected: &str) -> BrokerError {
    BrokerError::Encode(format!(
        "cannot write {} value as avro {}",
        payload.kind(),
        expected
    ))
}

fn lossy(payload: &Payload, expected: &str) -> BrokerError {
    let shown = match payload {
        Payload::Int(i) => i.to_string(),
        Payload::Float(f) => f.to_string(),
        other => other.kind().to_string(),
    };
    BrokerError::Encode(format!("{shown} is not exactly representable as avro {expected}"))
}

/// Text as UTF-8, or a list of octets as produced by `denormalize` for non-UTF-8 data
fn byte_payload(payload: &Payload, expected: &str) -> BrokerResult<Vec<u8>> {
    match payload {
        Payload::String(s) => Ok(s.as_bytes().to_vec()),
        Payload::List(items) => items
            .iter()
            .map(|item| match item {
                Payload::Int(b) => u8::try_from(*b)
                    .map_err(|_| BrokerError::Encode(format!("{b} is not a byte"))),
                other => Err(mismatch(other, expected)),
            })
            .collect(),
        other => Err(mismatch(other, expected)),
    }
}

/// Whether a payload's own kind lines up with a schema without widening
fn same_kind(payload: &Payload, schema: &Schema) -> bool {
    matches!(
        (payload, schema),
        (Payload::Null, Schema::Null)
            | (Payload::Bool(_), Schema::Boolean)
            | (Payload::Int(_), Schema::Int | Schema::Long)
            | (Payload::Float(_), Schema::Float | Schema::Double)
            | (Payload::String(_), Schema::String | Schema::Enum(_))
            | (Payload::List(_), Schema::Array(_))
            | (Payload::Map(_), Schema::Map(_) | Schema::Record(_))
    )
}

fn to_avro(payload: &Payload, schema: &Schema, names: &NamedSchemas<'_>) -> BrokerResult<Value> {
    match schema {
        Schema::Null => match payload {
            Payload::Null => Ok(Value::Null),
            other => Err(mismatch(other, "null")),
        },
        Schema::Boolean => match payload {
            Payload::Bool(b) => Ok(Value::Boolean(*b)),
            other => Err(mismatch(other, "boolean")),
        },
        Schema::Int => match payload {
            Payload::Int(i) => i32::try_from(*i)
                .map(Value::Int)
                .map_err(|_| BrokerError::Encode(format!("{i} does not fit avro int"))),
            other => Err(mismatch(other, "int")),
        },
        Schema::Long => match payload {
            Payload::Int(i) => Ok(Value::Long(*i)),
            other => Err(mismatch(other, "long")),
        },
        Schema::Float => match payload {
            Payload::Int(i) => {
                let narrowed = *i as f32;
                if narrowed as i128 == i128::from(*i) {
                    Ok(Value::Float(narrowed))
                } else {
                    Err(lossy(payload, "float"))
                }
            }
            Payload::Float(f) => {
                let narrowed = *f as f32;
                if f64::from(narrowed) == *f || f.is_nan() {
                    Ok(Value::Float(narrowed))
                } else {
                    Err(lossy(payload, "float"))
                }
            }
            other => Err(mismatch(other, "float")),
        },
        Schema::Double => match payload {
            Payload::Int(i) => {
                let widened = *i as f64;
                if widened as i128 == i128::from(*i) {
                    Ok(Value::Double(widened))
                } else {
                    Err(lossy(payload, "double"))
                }
            }
            Payload::Float(f) => Ok(Value::Double(*f)),
            other => Err(mismatch(other, "double")),
        },
        Schema::String => match payload {
            Payload::String(s) => Ok(Value::String(s.clone())),
            other => Err(mismatch(other, "string")),
        },
        Schema::Bytes => byte_payload(payload, "bytes").map(Value::Bytes),
        Schema::Fixed(fixed) => {
            let bytes = byte_payload(payload, "fixed")?;
            if bytes.len() != fixed.size {
                return Err(BrokerError::Encode(format!(
                    "fixed '{}' needs {} bytes, got {}",
                    fixed.name.name,
                    fixed.size,
                    bytes.len()
                )));
            }
            Ok(Value::Fixed(fixed.size, bytes))
        }
        Schema::Enum(e) => match payload {
            Payload::String(s) => e
                .symbols
                .iter()
                .position(|symbol| symbol == s)
                .map(|idx| Value::Enum(idx as u32, s.clone()))
                .ok_or_else(|| BrokerError::Encode(format!("'{s}' is not an enum symbol"))),
            other => Err(mismatch(other, "enum")),
        },
        Schema::Array(items) => match payload {
            Payload::List(list) => list
                .iter()
                .map(|item| to_avro(item, items, names))
                .collect::<BrokerResult<Vec<_>>>()
                .map(Value::Array),
            other => Err(mismatch(other, "array")),
        },
        Schema::Map(values) => match payload {
            Payload::Map(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), to_avro(v, values, names)?)))
                .collect::<BrokerResult<HashMap<_, _>>>()
                .map(Value::Map),
            other => Err(mismatch(other, "map")),
        },
        Schema::Record(record) => match payload {
            Payload::Map(map) => {
                let mut fields = Vec::with_capacity(record.fields.len());
                for field in &record.fields {
                    let value = match lookup_field(map, &field.name) {
                        Some(v) => to_avro(v, &field.schema, names)?,
                        None => missing_field(&field.name, field.default.as_ref(), &field.schema, names)?,
                    };
                    fields.push((field.name.clone(), value));
                }
                Ok(Value::Record(fields))
            }
            other => Err(mismatch(other, "record")),
        },
        Schema::Union(union) => {
            let variants = union.variants();
            // Exact kind first so 3 lands in "long" rather than "double"
            let exact = variants
                .iter()
                .enumerate()
                .filter(|(_, v)| same_kind(payload, resolve_ref(v, names)));
            let widened = variants.iter().enumerate();
            for (idx, variant) in exact.chain(widened) {
                if let Ok(value) = to_avro(payload, variant, names) {
                    return Ok(Value::Union(idx as u32, Box::new(value)));
                }
            }
            Err(mismatch(payload, "union"))
        }
        Schema::Ref { name } => to_avro(payload, names.get(&name.fullname(None))?, names),
        Schema::Date => match payload {
            Payload::Int(i) => i32::try_from(*i)
                .map(Value::Date)
                .map_err(|_| BrokerError::Encode(format!("{i} does not fit avro date"))),
            other => Err(mismatch(other, "date")),
        },
        Schema::TimeMillis => match payload {
            Payload::Int(i) => i32::try_from(*i)
                .map(Value::TimeMillis)
                .map_err(|_| BrokerError::Encode(format!("{i} does not fit avro time-millis"))),
            other => Err(mismatch(other, "time-millis")),
        },
        Schema::TimeMicros => match payload {
            Payload::Int(i) => Ok(Value::TimeMicros(*i)),
            other => Err(mismatch(other, "time-micros")),
        },
        Schema::TimestampMillis => match payload {
            Payload::Int(i) => Ok(Value::TimestampMillis(*i)),
            other => Err(mismatch(other, "timestamp-millis")),
        },
        Schema::TimestampMicros => match payload {
            Payload::Int(i) => Ok(Value::TimestampMicros(*i)),
            other => Err(mismatch(other, "timestamp-micros")),
        },
        Schema::Uuid => match payload {
            Payload::String(s) => uuid::Uuid::parse_str(s)
                .map(Value::Uuid)
                .map_err(|e| BrokerError::Encode(format!("invalid uuid '{s}': {e}"))),
            other => Err(mismatch(other, "uuid")),
        },
        other => Err(BrokerError::Encode(format!(
            "unsupported avro schema type {other:?}"
        ))),
    }
}

fn resolve_ref<'a>(schema: &'a Schema, names: &NamedSchemas<'a>) -> &'a Schema {
    match schema {
        Schema::Ref { name } => names.get(&name.fullname(None)).unwrap_or(schema),
        other => other,
    }
}

/// Field lookup: exact name first, then ASCII case-insensitive
fn lookup_field<'p>(map: &'p BTreeMap<String, Payload>, name: &str) -> Option<&'p Payload> {
    map.get(name).or_else(|| {
        map.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    })
}

fn missing_field(
    name: &str,
    default: Option<&serde_json::Value>,
    schema: &Schema,
    names: &NamedSchemas<'_>,
) -> BrokerResult<Value> {
    if let Some(default) = default {
        return to_avro(&Payload::normalize(default.clone()), schema, names);
    }
    match schema {
        Schema::Null => Ok(Value::Null),
        Schema::Union(union) => union
            .variants()
            .iter()
            .position(|v| matches!(v, Schema::Null))
            .map(|idx| Value::Union(idx as u32, Box::new(Value::Null)))
            .ok_or_else(|| BrokerError::Encode(format!("missing required field '{name}'"))),
        _ => Err(BrokerError::Encode(format!("missing required field '{name}'"))),
    }
}

/// Convert a decoded Avro value into a plain payload tree
///
/// Records become maps, unions and enums are unwrapped, logical types fall
/// back to their underlying primitive.
pub fn denormalize(value: Value) -> BrokerResult<Payload> {
    Ok(match value {
        Value::Null => Payload::Null,
        Value::Boolean(b) => Payload::Bool(b),
        Value::Int(i) | Value::Date(i) | Value::TimeMillis(i) => Payload::Int(i64::from(i)),
        Value::Long(i)
        | Value::TimeMicros(i)
        | Value::TimestampMillis(i)
        | Value::TimestampMicros(i) => Payload::Int(i),
        Value::Float(f) => number(f64::from(f)),
        Value::Double(f) => number(f),
        Value::String(s) => Payload::String(s),
        Value::Enum(_, symbol) => Payload::String(symbol),
        Value::Uuid(u) => Payload::String(u.to_string()),
        Value::Bytes(bytes) | Value::Fixed(_, bytes) => match String::from_utf8(bytes) {
            Ok(s) => Payload::String(s),
            Err(e) => Payload::List(
                e.into_bytes()
                    .into_iter()
                    .map(|b| Payload::Int(i64::from(b)))
                    .collect(),
            ),
        },
        Value::Union(_, inner) => denormalize(*inner)?,
        Value::Array(items) => Payload::List(
            items
                .into_iter()
                .map(denormalize)
                .collect::<BrokerResult<Vec<_>>>()?,
        ),
        Value::Map(map) => Payload::Map(
            map.into_iter()
                .map(|(k, v)| Ok((k, denormalize(v)?)))
                .collect::<BrokerResult<BTreeMap<_, _>>>()?,
        ),
        Value::Record(fields) => Payload::Map(
            fields
                .into_iter()
                .map(|(k, v)| Ok((k, denormalize(v)?)))
                .collect::<BrokerResult<BTreeMap<_, _>>>()?,
        ),
        other => {
            return Err(BrokerError::Decode(format!(
                "unsupported avro value {other:?}"
            )))
        }
    })
}

/// Same integer preference as JSON normalization
fn number(f: f64) -> Payload {
    Payload::normalize(
        serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const INVOICE_SCHEMA: &str = r#"
    {
        "type": "record",
        "name": "InvoiceCreated",
        "namespace": "billing",
        "fields": [
            {"name": "invoiceId", "type": "string"},
            {"name": "amount", "type": "double"},
            {"name": "quantity", "type": "int"},
            {"name": "paid", "type": "boolean"},
            {"name": "note", "type": ["null", "string"], "default": null},
            {"name": "status", "type": {"type": "enum", "name": "Status", "symbols": ["OPEN", "CLOSED"]}},
            {"name": "tags", "type": {"type": "array", "items": "string"}},
            {"name": "attributes", "type": {"type": "map", "values": "long"}},
            {"name": "customer", "type": {
                "type": "record",
                "name": "Customer",
                "fields": [
                    {"name": "id", "type": "long"},
                    {"name": "name", "type": "string"}
                ]
            }},
            {"name": "billTo", "type": ["null", "Customer"], "default": null},
            {"name": "currency", "type": "string", "default": "USD"}
        ]
    }
    "#;

    fn schema() -> Schema {
        Schema::parse_str(INVOICE_SCHEMA).unwrap()
    }

    fn sample() -> serde_json::Value {
        json!({
            "invoiceId": "X",
            "amount": 150.75,
            "quantity": 3,
            "paid": false,
            "note": "first",
            "status": "OPEN",
            "tags": ["eu", "b2b"],
            "attributes": {"priority": 2},
            "customer": {"id": 7, "name": "ACME"},
            "billTo": {"id": 8, "name": "ACME Billing"},
            "currency": "EUR"
        })
    }

    #[test]
    fn test_frame_and_unframe() {
        let framed = frame(42, b"datum");
        assert_eq!(framed[0], MAGIC_BYTE);
        let (id, datum) = unframe(&framed).unwrap();
        assert_eq!(id, 42);
        assert_eq!(datum, b"datum");
    }

    #[test]
    fn test_unframe_rejects_short_or_unknown_payloads() {
        assert!(unframe(&[0, 0, 1]).is_err());
        assert!(unframe(&[1, 0, 0, 0, 1, 9]).is_err());
    }

    #[test]
    fn test_round_trip_reconstructs_payload() {
        let schema = schema();
        let payload = Payload::normalize(sample());

        let datum = encode_datum(&schema, &payload).unwrap();
        let decoded = decode_datum(&schema, &datum).unwrap();

        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_whole_double_round_trips_as_same_payload() {
        let schema = schema();
        let mut value = sample();
        value["amount"] = json!(100.0);
        let payload = Payload::normalize(value);

        let decoded = decode_datum(&schema, &encode_datum(&schema, &payload).unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_missing_optional_fields_use_defaults() {
        let schema = schema();
        let mut value = sample();
        let obj = value.as_object_mut().unwrap();
        obj.remove("note");
        obj.remove("billTo");
        obj.remove("currency");

        let decoded =
            decode_datum(&schema, &encode_datum(&schema, &Payload::normalize(value)).unwrap())
                .unwrap();
        let Payload::Map(fields) = decoded else {
            panic!("expected map");
        };
        assert_eq!(fields["note"], Payload::Null);
        assert_eq!(fields["billTo"], Payload::Null);
        assert_eq!(fields["currency"], Payload::String("USD".to_string()));
    }

    #[test]
    fn test_field_names_match_case_insensitively() {
        let schema = schema();
        let mut value = sample();
        let obj = value.as_object_mut().unwrap();
        let id = obj.remove("invoiceId").unwrap();
        obj.insert("InvoiceId".to_string(), id);

        let decoded =
            decode_datum(&schema, &encode_datum(&schema, &Payload::normalize(value)).unwrap())
                .unwrap();
        let Payload::Map(fields) = decoded else {
            panic!("expected map");
        };
        assert_eq!(fields["invoiceId"], Payload::String("X".to_string()));
    }

    #[test]
    fn test_missing_required_field_fails() {
        let schema = schema();
        let mut value = sample();
        value.as_object_mut().unwrap().remove("invoiceId");

        let err = encode_datum(&schema, &Payload::normalize(value)).unwrap_err();
        assert!(matches!(err, BrokerError::Encode(msg) if msg.contains("invoiceId")));
    }

    #[test]
    fn test_fractional_value_rejected_for_integer_field() {
        let schema = schema();
        let mut value = sample();
        value["quantity"] = json!(2.5);

        assert!(encode_datum(&schema, &Payload::normalize(value)).is_err());
    }

    #[test]
    fn test_int_overflow_rejected() {
        let schema = schema();
        let mut value = sample();
        value["quantity"] = json!(i64::from(i32::MAX) + 1);

        assert!(encode_datum(&schema, &Payload::normalize(value)).is_err());
    }

    #[test]
    fn test_unknown_enum_symbol_rejected() {
        let schema = schema();
        let mut value = sample();
        value["status"] = json!("VOID");

        assert!(encode_datum(&schema, &Payload::normalize(value)).is_err());
    }

    #[test]
    fn test_union_prefers_exact_numeric_kind() {
        let schema = Schema::parse_str(r#"["double", "long"]"#).unwrap();
        let names = NamedSchemas::collect(&schema);

        let value = to_avro(&Payload::Int(3), &schema, &names).unwrap();
        assert_eq!(value, Value::Union(1, Box::new(Value::Long(3))));

        let value = to_avro(&Payload::Float(0.5), &schema, &names).unwrap();
        assert_eq!(value, Value::Union(0, Box::new(Value::Double(0.5))));
    }

    #[test]
    fn test_denormalize_unwraps_nested_wrappers() {
        let value = Value::Record(vec![
            ("status".to_string(), Value::Enum(1, "CLOSED".to_string())),
            (
                "maybe".to_string(),
                Value::Union(1, Box::new(Value::String("x".to_string()))),
            ),
            (
                "items".to_string(),
                Value::Array(vec![Value::Record(vec![(
                    "qty".to_string(),
                    Value::Int(2),
                )])]),
            ),
        ]);

        let payload = denormalize(value).unwrap();
        assert_eq!(
            payload.into_json(),
            json!({"status": "CLOSED", "maybe": "x", "items": [{"qty": 2}]})
        );
    }

    #[test]
    fn test_double_accepts_only_exact_integers() {
        let schema = Schema::parse_str(r#""double""#).unwrap();

        let exact = Payload::Int(1 << 53);
        let decoded = decode_datum(&schema, &encode_datum(&schema, &exact).unwrap()).unwrap();
        assert_eq!(decoded, exact);

        let err = encode_datum(&schema, &Payload::Int((1 << 53) + 1)).unwrap_err();
        assert!(matches!(err, BrokerError::Encode(msg) if msg.contains("9007199254740993")));
    }

    #[test]
    fn test_float_rejects_values_that_lose_precision() {
        let schema = Schema::parse_str(r#""float""#).unwrap();

        let half = Payload::Float(0.5);
        let decoded = decode_datum(&schema, &encode_datum(&schema, &half).unwrap()).unwrap();
        assert_eq!(decoded, half);

        assert!(encode_datum(&schema, &Payload::Float(0.1)).is_err());
        assert!(encode_datum(&schema, &Payload::Int((1 << 24) + 1)).is_err());
    }

    #[test]
    fn test_binary_bytes_round_trip_as_octet_list() {
        let schema = Schema::parse_str(r#""bytes""#).unwrap();
        let octets = Payload::List(vec![Payload::Int(0xff), Payload::Int(0), Payload::Int(0x10)]);

        let decoded = decode_datum(&schema, &encode_datum(&schema, &octets).unwrap()).unwrap();
        assert_eq!(decoded, octets);

        let out_of_range = Payload::List(vec![Payload::Int(256)]);
        assert!(encode_datum(&schema, &out_of_range).is_err());
    }

    #[test]
    fn test_fixed_requires_declared_length() {
        let schema =
            Schema::parse_str(r#"{"type": "fixed", "name": "Digest", "size": 2}"#).unwrap();

        let ok = Payload::List(vec![Payload::Int(0xff), Payload::Int(0x01)]);
        let decoded = decode_datum(&schema, &encode_datum(&schema, &ok).unwrap()).unwrap();
        assert_eq!(decoded, ok);

        let err = encode_datum(&schema, &Payload::List(vec![Payload::Int(1)])).unwrap_err();
        assert!(matches!(err, BrokerError::Encode(msg) if msg.contains("Digest")));
    }
}
