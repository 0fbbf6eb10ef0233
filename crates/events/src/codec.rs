//! JSON wire codec for integration events.
//!
//! Events are written as UTF-8 JSON objects with camelCase field names. Reading is
//! case-insensitive on field names, so `ProductId`, `productId` and `productid`
//! all land in the same field. Folding happens against the field list the target
//! type declares, at every nesting level.

use serde::de::value::StringDeserializer;
use serde::de::{self, DeserializeOwned, DeserializeSeed, IntoDeserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to serialize event: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to deserialize event: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// Serialize an event (or any payload) to its UTF-8 JSON body.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(CodecError::Serialize)
}

/// Deserialize a UTF-8 JSON body, matching field names case-insensitively.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, CodecError> {
    let value: Value = serde_json::from_slice(body).map_err(CodecError::Deserialize)?;
    T::deserialize(CaseInsensitive(value)).map_err(CodecError::Deserialize)
}

/// `serde_json::Value` deserializer that renames object keys to the declared
/// field names of the struct being built.
struct CaseInsensitive(Value);

fn fold_keys(map: Map<String, Value>, fields: &[&str]) -> Map<String, Value> {
    map.into_iter()
        .map(|(key, value)| {
            let canonical = fields
                .iter()
                .find(|field| field.eq_ignore_ascii_case(&key))
                .map(|field| (*field).to_string())
                .unwrap_or(key);
            (canonical, value)
        })
        .collect()
}

impl<'de> Deserializer<'de> for CaseInsensitive {
    type Error = serde_json::Error;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        match self.0 {
            Value::Array(items) => visitor.visit_seq(FoldedSeq(items.into_iter())),
            Value::Object(map) => visitor.visit_map(FoldedMap::new(map)),
            other => other.deserialize_any(visitor),
        }
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        match self.0 {
            Value::Null => visitor.visit_none(),
            _ => visitor.visit_some(self),
        }
    }

    fn deserialize_newtype_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_struct<V>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        match self.0 {
            Value::Object(map) => visitor.visit_map(FoldedMap::new(fold_keys(map, fields))),
            other => other.deserialize_struct(name, fields, visitor),
        }
    }

    fn deserialize_enum<V>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        self.0.deserialize_enum(name, variants, visitor)
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct seq tuple tuple_struct map identifier
        ignored_any
    }
}

struct FoldedMap {
    entries: serde_json::map::IntoIter,
    pending: Option<Value>,
}

impl FoldedMap {
    fn new(map: Map<String, Value>) -> Self {
        Self {
            entries: map.into_iter(),
            pending: None,
        }
    }
}

impl<'de> MapAccess<'de> for FoldedMap {
    type Error = serde_json::Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>, Self::Error>
    where
        K: DeserializeSeed<'de>,
    {
        match self.entries.next() {
            Some((key, value)) => {
                self.pending = Some(value);
                let key: StringDeserializer<serde_json::Error> = key.into_deserializer();
                seed.deserialize(key).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value, Self::Error>
    where
        V: DeserializeSeed<'de>,
    {
        match self.pending.take() {
            Some(value) => seed.deserialize(CaseInsensitive(value)),
            None => Err(de::Error::custom("map value requested before its key")),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.entries.len())
    }
}

struct FoldedSeq(std::vec::IntoIter<Value>);

impl<'de> SeqAccess<'de> for FoldedSeq {
    type Error = serde_json::Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>, Self::Error>
    where
        T: DeserializeSeed<'de>,
    {
        match self.0.next() {
            Some(value) => seed.deserialize(CaseInsensitive(value)).map(Some),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Line {
        product_name: String,
        quantity: u32,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Checkout {
        customer_name: String,
        total_price: u64,
        note: Option<String>,
        items: Vec<Line>,
    }

    fn sample() -> Checkout {
        Checkout {
            customer_name: "Ada".into(),
            total_price: 2500,
            note: None,
            items: vec![Line {
                product_name: "Lamp".into(),
                quantity: 2,
            }],
        }
    }

    #[test]
    fn encode_writes_camel_case_json() {
        let body = encode(&sample()).unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["customerName"], "Ada");
        assert_eq!(json["items"][0]["productName"], "Lamp");
    }

    #[test]
    fn decode_accepts_pascal_case_at_every_level() {
        let body = br#"{
            "CustomerName": "Ada",
            "TotalPrice": 2500,
            "Note": null,
            "Items": [{ "ProductName": "Lamp", "Quantity": 2 }]
        }"#;

        let decoded: Checkout = decode(body).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn decode_accepts_lowercase_keys() {
        let body = br#"{"customername":"Ada","totalprice":2500,"items":[{"productname":"Lamp","quantity":2}]}"#;

        let decoded: Checkout = decode(body).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let body = br#"{"customerName":"Ada","totalPrice":2500,"items":[],"Extra":{"Nested":1}}"#;

        let decoded: Checkout = decode(body).unwrap();
        assert!(decoded.items.is_empty());
    }

    #[test]
    fn decode_reports_missing_fields() {
        let err = decode::<Checkout>(br#"{"customerName":"Ada"}"#).unwrap_err();
        assert!(matches!(err, CodecError::Deserialize(_)));
    }

    #[test]
    fn decode_rejects_malformed_json() {
        let err = decode::<Checkout>(b"{not json").unwrap_err();
        assert!(matches!(err, CodecError::Deserialize(_)));
    }
}
