//! Decodes raw bus payloads into typed [`Event`]s.
//!
//! Mirrors `yadtreceiver.events.Event`: construction is pure, synchronous and
//! total on well-formed input, and fails with one of three taxonomy errors
//! otherwise.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

const ATTRIBUTE_TYPE: &str = "id";
const ATTRIBUTE_COMMAND: &str = "cmd";
const ATTRIBUTE_ARGUMENTS: &str = "args";
const ATTRIBUTE_STATE: &str = "state";
const ATTRIBUTE_MESSAGE: &str = "message";
const ATTRIBUTE_PAYLOAD: &str = "payload";
const ATTRIBUTE_TRACKING_ID: &str = "tracking_id";
const ATTRIBUTE_VOTE_VALUE: &str = "vote_value";

const PAYLOAD_ATTRIBUTE_URI: &str = "uri";
const PAYLOAD_ATTRIBUTE_STATE: &str = "state";

const TYPE_REQUEST: &str = "request";
const TYPE_COMMAND: &str = "cmd";
const TYPE_SERVICE_CHANGE: &str = "service-change";
const TYPE_FULL_UPDATE: &str = "full-update";
const TYPE_VOTE: &str = "vote";
const TYPE_HEARTBEAT: &str = "heartbeat";
const TYPE_ERROR_INFO: &str = "error";

/// State carried by a published `Command` event, per spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
    Started,
    Finished,
    Failed,
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandState::Started => "started",
            CommandState::Finished => "finished",
            CommandState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One `(uri, state)` pair from a `ServiceChange` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    pub uri: String,
    pub state: String,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is {}", self.uri, self.state)
    }
}

/// A decoded bus event. Every variant carries the `target` it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Request {
        target: String,
        command: String,
        arguments: Vec<String>,
        tracking_id: Option<String>,
    },
    Command {
        target: String,
        command: String,
        state: String,
        message: Option<String>,
    },
    ServiceChange {
        target: String,
        payload: Vec<ServiceState>,
    },
    FullUpdate {
        target: String,
    },
    Vote {
        target: String,
        tracking_id: String,
        vote_value: String,
    },
    Heartbeat {
        target: String,
    },
    ErrorInfo {
        target: String,
    },
}

impl Event {
    pub fn target(&self) -> &str {
        match self {
            Event::Request { target, .. }
            | Event::Command { target, .. }
            | Event::ServiceChange { target, .. }
            | Event::FullUpdate { target }
            | Event::Vote { target, .. }
            | Event::Heartbeat { target }
            | Event::ErrorInfo { target } => target,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Request { .. } => TYPE_REQUEST,
            Event::Command { .. } => TYPE_COMMAND,
            Event::ServiceChange { .. } => TYPE_SERVICE_CHANGE,
            Event::FullUpdate { .. } => TYPE_FULL_UPDATE,
            Event::Vote { .. } => TYPE_VOTE,
            Event::Heartbeat { .. } => TYPE_HEARTBEAT,
            Event::ErrorInfo { .. } => TYPE_ERROR_INFO,
        }
    }

    pub fn is_a_request(&self) -> bool {
        matches!(self, Event::Request { .. })
    }

    pub fn is_a_vote(&self) -> bool {
        matches!(self, Event::Vote { .. })
    }

    /// Decodes a target name plus a JSON-object-shaped payload into an
    /// [`Event`]. The `id` attribute selects the variant; every other
    /// attribute is read only once the variant is known, matching the
    /// source's `_initialize_*` helpers.
    pub fn decode(target: impl Into<String>, data: &Value) -> Result<Event, EventError> {
        let target = target.into();

        let id = data.get(ATTRIBUTE_TYPE).and_then(Value::as_str);
        let id = match id {
            Some(id) => id,
            None => {
                return Err(EventError::InvalidEventType {
                    target,
                    found: None,
                })
            }
        };

        match id {
            TYPE_REQUEST => {
                let command = required_string(data, &target, TYPE_REQUEST, ATTRIBUTE_COMMAND)?;
                let arguments = required_string_array(
                    data,
                    &target,
                    TYPE_REQUEST,
                    ATTRIBUTE_ARGUMENTS,
                )?;
                let tracking_id = determine_tracking_id(&arguments);
                Ok(Event::Request {
                    target,
                    command,
                    arguments,
                    tracking_id,
                })
            }
            TYPE_COMMAND => {
                let command = required_string(data, &target, TYPE_COMMAND, ATTRIBUTE_COMMAND)?;
                let state = required_string(data, &target, TYPE_COMMAND, ATTRIBUTE_STATE)?;
                let message = data
                    .get(ATTRIBUTE_MESSAGE)
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                Ok(Event::Command {
                    target,
                    command,
                    state,
                    message,
                })
            }
            TYPE_SERVICE_CHANGE => {
                let payload = data.get(ATTRIBUTE_PAYLOAD).ok_or_else(|| {
                    EventError::IncompleteEventData {
                        target: target.clone(),
                        kind: TYPE_SERVICE_CHANGE.to_string(),
                        attribute: ATTRIBUTE_PAYLOAD.to_string(),
                    }
                })?;
                let payload = payload.as_array().ok_or_else(|| {
                    EventError::IncompleteEventData {
                        target: target.clone(),
                        kind: TYPE_SERVICE_CHANGE.to_string(),
                        attribute: ATTRIBUTE_PAYLOAD.to_string(),
                    }
                })?;

                let mut service_states = Vec::with_capacity(payload.len());
                for entry in payload {
                    let uri = entry
                        .get(PAYLOAD_ATTRIBUTE_URI)
                        .and_then(Value::as_str)
                        .ok_or_else(|| EventError::PayloadIntegrity {
                            target: target.clone(),
                            kind: TYPE_SERVICE_CHANGE.to_string(),
                            attribute: PAYLOAD_ATTRIBUTE_URI.to_string(),
                        })?
                        .to_owned();
                    let state = entry
                        .get(PAYLOAD_ATTRIBUTE_STATE)
                        .and_then(Value::as_str)
                        .ok_or_else(|| EventError::PayloadIntegrity {
                            target: target.clone(),
                            kind: TYPE_SERVICE_CHANGE.to_string(),
                            attribute: PAYLOAD_ATTRIBUTE_STATE.to_string(),
                        })?
                        .to_owned();
                    service_states.push(ServiceState { uri, state });
                }

                Ok(Event::ServiceChange {
                    target,
                    payload: service_states,
                })
            }
            TYPE_FULL_UPDATE => Ok(Event::FullUpdate { target }),
            TYPE_VOTE => {
                let tracking_id =
                    required_string(data, &target, TYPE_VOTE, ATTRIBUTE_TRACKING_ID)?;
                let vote_value =
                    required_string(data, &target, TYPE_VOTE, ATTRIBUTE_VOTE_VALUE)?;
                Ok(Event::Vote {
                    target,
                    tracking_id,
                    vote_value,
                })
            }
            TYPE_HEARTBEAT => Ok(Event::Heartbeat { target }),
            TYPE_ERROR_INFO => Ok(Event::ErrorInfo { target }),
            other => Err(EventError::InvalidEventType {
                target,
                found: Some(other.to_string()),
            }),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Request {
                target,
                command,
                arguments,
                ..
            } => write!(
                f,
                "target[{target}] requested command \"{command}\" using arguments \"{arguments:?}\""
            ),
            Event::FullUpdate { target } => {
                write!(f, "target[{target}] full update of status information.")
            }
            Event::ServiceChange { target, payload } => {
                let changes = payload
                    .iter()
                    .map(ServiceState::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "target[{target}] services changed: {changes}")
            }
            Event::Command {
                target,
                command,
                state,
                message,
            } => match message {
                Some(message) => write!(
                    f,
                    "(broadcaster) target[{target}] command \"{command}\" {state}: {message}"
                ),
                None => write!(
                    f,
                    "(broadcaster) target[{target}] command \"{command}\" {state}."
                ),
            },
            Event::Vote { target, .. } => write!(f, "target[{target}] vote"),
            Event::Heartbeat { target } => write!(f, "target[{target}] heartbeat"),
            Event::ErrorInfo { target } => write!(f, "target[{target}] error-info"),
        }
    }
}

fn required_string(
    data: &Value,
    target: &str,
    kind: &str,
    attribute: &str,
) -> Result<String, EventError> {
    data.get(attribute)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| EventError::IncompleteEventData {
            target: target.to_string(),
            kind: kind.to_string(),
            attribute: attribute.to_string(),
        })
}

fn required_string_array(
    data: &Value,
    target: &str,
    kind: &str,
    attribute: &str,
) -> Result<Vec<String>, EventError> {
    let array = data
        .get(attribute)
        .and_then(Value::as_array)
        .ok_or_else(|| EventError::IncompleteEventData {
            target: target.to_string(),
            kind: kind.to_string(),
            attribute: attribute.to_string(),
        })?;

    Ok(array
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_owned)
        .collect())
}

/// Finds the first `--tracking-id=<value>` argument, per spec.md §6.
pub fn determine_tracking_id(arguments: &[String]) -> Option<String> {
    arguments.iter().find_map(|arg| {
        arg.strip_prefix("--tracking-id=")
            .map(str::to_owned)
    })
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("event on target {target} has invalid or missing type: {found:?}")]
    InvalidEventType {
        target: String,
        found: Option<String>,
    },

    #[error("event \"{kind}\" on target {target} is missing attribute \"{attribute}\"")]
    IncompleteEventData {
        target: String,
        kind: String,
        attribute: String,
    },

    #[error(
        "event \"{kind}\" on target {target} is missing attribute \"{attribute}\" in payload"
    )]
    PayloadIntegrity {
        target: String,
        kind: String,
        attribute: String,
    },
}
