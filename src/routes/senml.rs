//! SenML (RFC 8428) records in JSON and CBOR representations.

use crate::routes::error::{RouteError, RouteResult};
use ciborium::value::Value as CborValue;
use serde::{Deserialize, Serialize};

/// SenML representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Cbor,
}

/// One SenML record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "bn", default, skip_serializing_if = "String::is_empty")]
    pub base_name: String,

    #[serde(rename = "bt", default, skip_serializing_if = "is_zero")]
    pub base_time: f64,

    #[serde(rename = "bu", default, skip_serializing_if = "String::is_empty")]
    pub base_unit: String,

    #[serde(rename = "bver", default, skip_serializing_if = "is_zero_u64")]
    pub base_version: u64,

    #[serde(rename = "bv", default, skip_serializing_if = "is_zero")]
    pub base_value: f64,

    #[serde(rename = "bs", default, skip_serializing_if = "is_zero")]
    pub base_sum: f64,

    #[serde(rename = "n", default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(rename = "u", default, skip_serializing_if = "String::is_empty")]
    pub unit: String,

    #[serde(rename = "t", default, skip_serializing_if = "is_zero")]
    pub time: f64,

    #[serde(rename = "ut", default, skip_serializing_if = "is_zero")]
    pub update_time: f64,

    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,

    #[serde(rename = "vs", default, skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,

    #[serde(rename = "vd", default, skip_serializing_if = "Option::is_none")]
    pub data_value: Option<String>,

    #[serde(rename = "vb", default, skip_serializing_if = "Option::is_none")]
    pub bool_value: Option<bool>,

    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

/// Decode a SenML pack
pub fn decode(payload: &[u8], format: Format) -> RouteResult<Vec<Record>> {
    match format {
        Format::Json => serde_json::from_slice(payload)
            .map_err(|e| RouteError::Decode(format!("invalid SenML JSON: {}", e))),
        Format::Cbor => decode_cbor(payload),
    }
}

/// Encode a SenML pack as JSON
pub fn encode_json(records: &[Record]) -> RouteResult<Vec<u8>> {
    serde_json::to_vec(records).map_err(|e| RouteError::Encode(e.to_string()))
}

// CBOR SenML uses integer labels instead of the JSON names.
fn decode_cbor(payload: &[u8]) -> RouteResult<Vec<Record>> {
    let value: CborValue = ciborium::de::from_reader(payload)
        .map_err(|e| RouteError::Decode(format!("invalid SenML CBOR: {}", e)))?;

    let CborValue::Array(items) = value else {
        return Err(RouteError::Decode("SenML CBOR pack is not an array".to_string()));
    };

    items.into_iter().map(cbor_record).collect()
}

fn cbor_record(item: CborValue) -> RouteResult<Record> {
    let CborValue::Map(fields) = item else {
        return Err(RouteError::Decode("SenML CBOR record is not a map".to_string()));
    };

    let mut record = Record::default();
    for (key, value) in fields {
        let label = match key {
            CborValue::Integer(i) => i128::from(i),
            CborValue::Text(name) => json_label(&name).ok_or_else(|| {
                RouteError::Decode(format!("unknown SenML label '{}'", name))
            })?,
            other => {
                return Err(RouteError::Decode(format!("unsupported SenML key {:?}", other)))
            }
        };

        match label {
            -1 => record.base_version = as_f64(&value, "bver")? as u64,
            -2 => record.base_name = as_text(value, "bn")?,
            -3 => record.base_time = as_f64(&value, "bt")?,
            -4 => record.base_unit = as_text(value, "bu")?,
            -5 => record.base_value = as_f64(&value, "bv")?,
            -6 => record.base_sum = as_f64(&value, "bs")?,
            0 => record.name = as_text(value, "n")?,
            1 => record.unit = as_text(value, "u")?,
            2 => record.value = Some(as_f64(&value, "v")?),
            3 => record.string_value = Some(as_text(value, "vs")?),
            4 => match value {
                CborValue::Bool(b) => record.bool_value = Some(b),
                _ => return Err(RouteError::Decode("'vb' is not a boolean".to_string())),
            },
            5 => record.sum = Some(as_f64(&value, "s")?),
            6 => record.time = as_f64(&value, "t")?,
            7 => record.update_time = as_f64(&value, "ut")?,
            8 => record.data_value = Some(as_text(value, "vd")?),
            // Unknown labels are extensions and ignored.
            _ => {}
        }
    }

    Ok(record)
}

fn json_label(name: &str) -> Option<i128> {
    let label = match name {
        "bver" => -1,
        "bn" => -2,
        "bt" => -3,
        "bu" => -4,
        "bv" => -5,
        "bs" => -6,
        "n" => 0,
        "u" => 1,
        "v" => 2,
        "vs" => 3,
        "vb" => 4,
        "s" => 5,
        "t" => 6,
        "ut" => 7,
        "vd" => 8,
        _ => return None,
    };
    Some(label)
}

fn as_f64(value: &CborValue, field: &str) -> RouteResult<f64> {
    match value {
        CborValue::Float(f) => Ok(*f),
        CborValue::Integer(i) => Ok(i128::from(*i) as f64),
        _ => Err(RouteError::Decode(format!("'{}' is not a number", field))),
    }
}

fn as_text(value: CborValue, field: &str) -> RouteResult<String> {
    match value {
        CborValue::Text(s) => Ok(s),
        CborValue::Bytes(b) => String::from_utf8(b)
            .map_err(|_| RouteError::Decode(format!("'{}' is not UTF-8", field))),
        _ => Err(RouteError::Decode(format!("'{}' is not a string", field))),
    }
}
