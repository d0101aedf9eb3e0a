//! Mutator invocation: building the payload a handler receives.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use argus_core::event::Event;
use argus_core::mutator::builtin;
use argus_core::store::{MutatorStore, Store};

use super::exec::{self, ExecError};

/// Default wall-clock timeout for pipe mutators without one configured.
const DEFAULT_MUTATOR_TIMEOUT: Duration = Duration::from_secs(10);

/// Mutation failure; drops the event for the requesting handler only.
#[derive(Debug, Error)]
pub enum MutateError {
    /// The named mutator does not exist.
    #[error("mutator {0} not found")]
    NotFound(String),

    /// The mutator could not be loaded from the store.
    #[error("mutator {name} lookup failed: {source}")]
    Store {
        /// Mutator name.
        name: String,
        /// Store failure.
        source: argus_core::StoreError,
    },

    /// The event could not be serialized.
    #[error("event serialization failed: {0}")]
    Serialize(String),

    /// The pipe mutator failed or timed out.
    #[error("mutator {name} execution failed: {source}")]
    Exec {
        /// Mutator name.
        name: String,
        /// Execution failure.
        source: ExecError,
    },

    /// The pipe mutator exited non-zero.
    #[error("mutator {name} exited with status {code}")]
    NonZeroExit {
        /// Mutator name.
        name: String,
        /// Exit code.
        code: i32,
    },
}

/// Produces the handler payload for `event`.
///
/// An empty name or [`builtin::JSON`] serializes the whole event;
/// [`builtin::ONLY_CHECK_OUTPUT`] passes the raw check output through.
/// Any other name loads a pipe mutator from the store: the event JSON
/// goes to its stdin and its stdout replaces the payload.
///
/// # Errors
///
/// Returns a [`MutateError`]; the caller drops the event for the
/// affected handler and leaves the rest of the pipeline alone.
pub async fn mutate(
    event: &Arc<Event>,
    mutator_name: &str,
    store: &dyn Store,
    backend_host: &str,
) -> Result<Bytes, MutateError> {
    match mutator_name {
        "" | builtin::JSON => {
            let bytes =
                serde_json::to_vec(&**event).map_err(|e| MutateError::Serialize(e.to_string()))?;
            Ok(Bytes::from(bytes))
        }
        builtin::ONLY_CHECK_OUTPUT => Ok(Bytes::from(event.check.output.clone().into_bytes())),
        name => {
            let namespace = &event.entity.metadata.namespace;
            let mutator = store
                .get_mutator(namespace, name)
                .await
                .map_err(|source| MutateError::Store {
                    name: name.to_string(),
                    source,
                })?
                .ok_or_else(|| MutateError::NotFound(name.to_string()))?;

            let input =
                serde_json::to_vec(&**event).map_err(|e| MutateError::Serialize(e.to_string()))?;
            let timeout = if mutator.timeout == 0 {
                DEFAULT_MUTATOR_TIMEOUT
            } else {
                Duration::from_secs(u64::from(mutator.timeout))
            };
            let output =
                exec::run_piped_command(&mutator.command, backend_host, &input, timeout)
                    .await
                    .map_err(|source| MutateError::Exec {
                        name: name.to_string(),
                        source,
                    })?;
            if output.code != 0 {
                return Err(MutateError::NonZeroExit {
                    name: name.to_string(),
                    code: output.code,
                });
            }
            Ok(Bytes::from(output.stdout))
        }
    }
}
