// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// A streamed tool call finished with argument JSON that does not parse to
/// an object.
///
/// The call cannot be executed without arguments, so this is fatal for the
/// iteration and propagates out of the stream.  Tool *handler* failures,
/// in contrast, are fed back to the model as data.
#[derive(Debug, Error)]
#[error("tool call {name:?} carried malformed argument JSON ({reason}); buffer: {buffer:?}")]
pub struct ToolArgumentParseError {
    /// Tool name from the call, possibly empty when the stream never
    /// delivered one.
    pub name: String,
    /// The accumulated argument buffer that failed to parse.
    pub buffer: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_names_tool_and_buffer() {
        let e = ToolArgumentParseError {
            name: "weather".into(),
            buffer: "{\"zip\": oops".into(),
            reason: "expected value at line 1 column 9".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("weather"));
        assert!(msg.contains("oops"));
    }

    #[test]
    fn survives_anyhow_downcast() {
        let e: anyhow::Error = ToolArgumentParseError {
            name: "t".into(),
            buffer: "[1]".into(),
            reason: "arguments must be a JSON object".into(),
        }
        .into();
        assert!(e.downcast_ref::<ToolArgumentParseError>().is_some());
    }
}
