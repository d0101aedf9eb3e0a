//! Handlers: dispatch endpoints for processed events.

use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;

/// Dispatch mechanism of a handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerType {
    /// Spawn a subprocess and write the event payload to its stdin.
    #[default]
    Pipe,
    /// Connect to `host:port` and write the payload over TCP.
    Tcp,
    /// Send the payload as a UDP datagram to `host:port`.
    Udp,
    /// An ordered list of other handlers, evaluated as fan-out.
    Set,
}

/// Socket address for `tcp`/`udp` handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerSocket {
    /// Remote host.
    pub host: String,
    /// Remote port.
    pub port: u16,
}

/// A dispatch target for events leaving the pipeline.
///
/// `set` handlers reference other handlers by name; the transitive
/// expansion must be acyclic. Cycles are broken during normalisation with
/// a warning, never at dispatch time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Handler {
    /// Namespace, name, labels, annotations.
    pub metadata: ObjectMeta,

    /// Dispatch mechanism.
    #[serde(rename = "type", default)]
    pub type_: HandlerType,

    /// Command line for `pipe` handlers.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,

    /// Remote endpoint for `tcp`/`udp` handlers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<HandlerSocket>,

    /// Wall-clock timeout in seconds (0 = default).
    #[serde(default)]
    pub timeout: u32,

    /// Event filters gating dispatch, by name.
    #[serde(default)]
    pub filters: Vec<String>,

    /// Mutator applied before dispatch, by name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mutator: String,

    /// Member handlers for `set` handlers.
    #[serde(default)]
    pub handlers: Vec<String>,

    /// Dispatch silenced events anyway.
    #[serde(default)]
    pub handle_silenced: bool,
}
