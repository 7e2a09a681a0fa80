//! # Configuration
//!
//! Breakpoint requests as they come out of patch configuration:
//!
//! ```json
//! {
//!     "file_size#music": { "addr": "Rx1f4c0", "cavesize": 6, "file_size": "[ebp-8]" },
//!     "file_load": { "addr": "0x41c2a0", "cavesize": 5, "cave_exec": false }
//! }
//! ```
//!
//! Every key besides `addr` and `cavesize` is up to the breakpoint's callback, which receives the whole object.
//! Callbacks that honor `cave_exec` read it with [`crate::json::cave_exec_flag`].

use serde::Deserialize;
use serde_json::Value;
use tracing::error;

/// One breakpoint to be applied
#[derive(Debug, Clone, PartialEq)]
pub struct BreakpointRequest {
    /// Name, optionally with a `#slot` suffix. The part before `#` selects the callback.
    pub name: String,
    /// Address expression, resolved against the target module
    pub addr: String,
    /// Number of original bytes displaced into the relay cave
    pub cavesize: usize,
    /// Entire configuration object, handed to the callback
    pub params: Value,
}

/// Fields the engine itself reads from a breakpoint's object
#[derive(Debug, Deserialize)]
struct RequestFields {
    /// See [`BreakpointRequest::addr`]
    addr: String,
    /// See [`BreakpointRequest::cavesize`]
    cavesize: usize,
}

impl BreakpointRequest {
    /// Creates a request with an empty parameter object
    pub fn new(name: impl Into<String>, addr: impl Into<String>, cavesize: usize) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            cavesize,
            params: Value::Object(Default::default()),
        }
    }

    /// Builds a request from a breakpoint's configuration object
    pub fn from_json(name: &str, params: &Value) -> Result<Self, serde_json::Error> {
        let fields = RequestFields::deserialize(params)?;
        Ok(Self {
            name: name.to_owned(),
            addr: fields.addr,
            cavesize: fields.cavesize,
            params: params.clone(),
        })
    }
}

/// Reads every breakpoint from a `{ "name": { ... } }` object, logging and skipping malformed entries
pub fn requests_from_json(breakpoints: &Value) -> Vec<BreakpointRequest> {
    let Some(breakpoints) = breakpoints.as_object() else {
        error!("breakpoint definitions must be a JSON object");
        return Vec::new();
    };
    breakpoints
        .iter()
        .filter_map(|(name, params)| {
            BreakpointRequest::from_json(name, params)
                .map_err(|e| error!("invalid breakpoint {name}: {e}"))
                .ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::requests_from_json;

    #[test]
    /// Requests keep their full object, unknown keys included
    fn test_requests() {
        let defs = json!({
            "file_size#music": { "addr": "Rx1f4c0", "cavesize": 6, "file_size": "[ebp-8]" },
            "file_load": { "addr": "0x41c2a0", "cavesize": 5, "cave_exec": false },
            "broken": { "cavesize": 5 },
        });
        let mut requests = requests_from_json(&defs);
        requests.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(requests.len(), 2);

        assert_eq!(requests[0].name, "file_load");
        assert_eq!(requests[0].params["cave_exec"], false);

        assert_eq!(requests[1].name, "file_size#music");
        assert_eq!(requests[1].addr, "Rx1f4c0");
        assert_eq!(requests[1].cavesize, 6);
        assert_eq!(requests[1].params["file_size"], "[ebp-8]");
    }

    #[test]
    /// Non-objects produce nothing
    fn test_not_object() {
        assert!(requests_from_json(&json!([1, 2])).is_empty());
    }
}
