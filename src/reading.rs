use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Decoded fields of one poll cycle, keyed by field name
pub type Fields = BTreeMap<String, Value>;

/// A single decoded value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Text(String),
}

impl Value {
    /// The numeric value, if this is a number
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(_) => None,
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<u16> for Value {
    fn from(n: u16) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

/// The result of one completed poll cycle of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Alias of the device the fields were read from
    #[serde(rename = "__device")]
    pub device: String,
    /// Name of the protocol client that produced the fields
    #[serde(rename = "__client")]
    pub client: String,
    #[serde(flatten)]
    pub fields: Fields,
}

impl Reading {
    pub fn get(&self, field: &str) -> Option<f64> {
        self.fields.get(field).and_then(Value::as_f64)
    }

    /// Keep only the named fields. An empty list keeps everything.
    pub fn retain_fields(&mut self, keep: &[String]) {
        if keep.is_empty() {
            return;
        }
        self.fields.retain(|name, _| keep.iter().any(|k| k == name));
    }
}

#[test]
fn test_reading_serializes_flat_with_tags() {
    let mut fields = Fields::new();
    fields.insert("voltage".into(), Value::Number(12.6));
    fields.insert("model".into(), Value::Text("RNG".into()));
    let reading = Reading {
        device: "BT-TH-1".into(),
        client: "register_map".into(),
        fields,
    };
    let json = serde_json::to_value(&reading).unwrap();
    assert_eq!(json["__device"], "BT-TH-1");
    assert_eq!(json["__client"], "register_map");
    assert_eq!(json["voltage"], 12.6);
    assert_eq!(json["model"], "RNG");
}

#[test]
fn test_retain_fields() {
    let mut fields = Fields::new();
    fields.insert("voltage".into(), Value::Number(12.6));
    fields.insert("current".into(), Value::Number(1.0));
    let mut reading = Reading {
        device: "a".into(),
        client: "b".into(),
        fields,
    };
    reading.retain_fields(&[]);
    assert_eq!(reading.fields.len(), 2);
    reading.retain_fields(&["current".to_string()]);
    assert_eq!(reading.get("current"), Some(1.0));
    assert_eq!(reading.get("voltage"), None);
}
