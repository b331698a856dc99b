use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

/// One decoded forward-channel batch, normalized across both encodings.
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardInput {
    /// `count=0` body or JSON `null`: the client had nothing to say.
    Empty,
    /// URL-encoded map batch.
    Maps {
        offset: u64,
        maps: Vec<HashMap<String, String>>,
    },
    /// `application/json` batch.
    Json { offset: u64, items: Vec<Value> },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("bad forward-channel data: {0}")]
pub struct BadData(pub &'static str);

/// Decode a forward-channel POST body. The client advertises the JSON
/// encoding via our `X-Accept` header on `/test?MODE=init`; everything else
/// arrives as the classic `count`/`ofs`/`reqN_key` form encoding.
pub fn decode(content_type: Option<&str>, body: &[u8]) -> Result<ForwardInput, BadData> {
    if content_type
        .map(|ct| ct.starts_with("application/json"))
        .unwrap_or(false)
    {
        decode_json(body)
    } else {
        decode_maps(body)
    }
}

fn decode_json(body: &[u8]) -> Result<ForwardInput, BadData> {
    let value: Value = serde_json::from_slice(body).map_err(|_| BadData("invalid JSON body"))?;
    if value.is_null() {
        return Ok(ForwardInput::Empty);
    }
    let obj = value.as_object().ok_or(BadData("expected JSON object"))?;
    let offset = obj
        .get("ofs")
        .and_then(Value::as_u64)
        .ok_or(BadData("ofs missing or not an integer"))?;
    let items = obj
        .get("data")
        .and_then(Value::as_array)
        .ok_or(BadData("data missing or not an array"))?
        .clone();
    Ok(ForwardInput::Json { offset, items })
}

fn decode_maps(body: &[u8]) -> Result<ForwardInput, BadData> {
    let pairs: Vec<(String, String)> =
        serde_urlencoded::from_bytes(body).map_err(|_| BadData("invalid form encoding"))?;

    let field = |name: &str| {
        pairs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    };

    let count: usize = field("count")
        .ok_or(BadData("count missing"))?
        .parse()
        .map_err(|_| BadData("count is not an integer"))?;
    if count == 0 {
        return Ok(ForwardInput::Empty);
    }

    let offset: u64 = field("ofs")
        .ok_or(BadData("ofs missing"))?
        .parse()
        .map_err(|_| BadData("ofs is not an integer"))?;

    let mut maps: Vec<HashMap<String, String>> = vec![HashMap::new(); count];
    for (key, value) in &pairs {
        let Some(rest) = key.strip_prefix("req") else {
            continue;
        };
        let Some((index, map_key)) = rest.split_once('_') else {
            continue;
        };
        // The client reports a map it failed to encode as `reqtype__badmap`;
        // there is nothing to deliver for it.
        if index == "type" && map_key == "_badmap" {
            continue;
        }
        let index: usize = index.parse().map_err(|_| BadData("bad map index"))?;
        if index >= count {
            return Err(BadData("map index out of range"));
        }
        maps[index].insert(map_key.to_string(), value.clone());
    }

    Ok(ForwardInput::Maps { offset, maps })
}

impl ForwardInput {
    /// Number of maps or items in the batch.
    pub fn len(&self) -> usize {
        match self {
            ForwardInput::Empty => 0,
            ForwardInput::Maps { maps, .. } => maps.len(),
            ForwardInput::Json { items, .. } => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
