//! Message types and enums

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A named command sent by the controller.
///
/// Only `name` has a fixed meaning; every other field is carried through
/// untouched so that commands can be forwarded to the worker verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command name
    pub name: String,
    /// Remaining payload fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Command {
    /// Create a command without payload fields
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Map::new(),
        }
    }

    /// Add a payload field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Whether this command requires a fresh worker before it runs.
    ///
    /// Toplevel commands are named with an uppercase first letter.
    pub fn is_restart_trigger(&self) -> bool {
        self.name.chars().next().is_some_and(char::is_uppercase)
    }

    /// Working directory the controller expects the worker to run in
    pub fn expected_cwd(&self) -> Option<&str> {
        self.fields.get("expected_cwd").and_then(Value::as_str)
    }

    /// Correlation id chosen by the controller, if any
    pub fn command_id(&self) -> Option<&Value> {
        self.fields.get("id")
    }

    /// Get a payload field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Get a payload field as a string
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }
}

/// Everything the controller can send to the mediator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Incoming {
    /// Regular command, processed in order
    Command(Command),
    /// Out-of-band command that bypasses the normal queue
    Immediate(Command),
    /// Raw text typed by the user for the running program
    Input {
        /// Submitted text
        data: String,
    },
    /// End of user input
    Eof,
}

impl Incoming {
    /// Name used in logs
    pub fn label(&self) -> &str {
        match self {
            Self::Command(cmd) | Self::Immediate(cmd) => &cmd.name,
            Self::Input { .. } => "<input>",
            Self::Eof => "<eof>",
        }
    }
}

/// Keys of the response envelope; payload fields may not use them
pub const RESERVED_RESPONSE_FIELDS: [&str; 3] = ["kind", "command_name", "command_id"];

/// Reply to a single command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Name of the command this answers
    pub command_name: String,
    /// Id of the command this answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<Value>,
    /// Response payload
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Response {
    /// Build a response to `cmd` carrying `fields`.
    ///
    /// Payload fields named like an envelope key are dropped.
    pub fn for_command(cmd: &Command, mut fields: Map<String, Value>) -> Self {
        for key in RESERVED_RESPONSE_FIELDS {
            fields.remove(key);
        }

        Self {
            command_name: cmd.name.clone(),
            command_id: cmd.command_id().cloned(),
            fields,
        }
    }

    /// Build an error-shaped response to `cmd`
    pub fn error(cmd: &Command, message: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("error".to_string(), Value::String(message.into()));
        Self::for_command(cmd, fields)
    }

    /// Error description, if this is an error-shaped response
    pub fn error_message(&self) -> Option<&str> {
        self.fields.get("error").and_then(Value::as_str)
    }
}

/// Everything the mediator itself can send to the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// Reply to a command
    Response(Response),
    /// Chunk of program output
    Output {
        /// Stream name, e.g. "stdout"
        stream: String,
        /// Output text
        data: String,
    },
    /// Mediator-level failure not tied to a single command
    Error {
        /// Error description
        message: String,
    },
}

impl Message {
    /// Create a response message
    pub fn response(resp: Response) -> Self {
        Self::Response(resp)
    }

    /// Create an error message
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_restart_trigger_classification() {
        assert!(Command::new("Execute").is_restart_trigger());
        assert!(Command::new("Run").is_restart_trigger());
        assert!(!Command::new("run_id_123").is_restart_trigger());
        assert!(!Command::new("stat_path").is_restart_trigger());
        assert!(!Command::new("").is_restart_trigger());
        assert!(!Command::new("_Private").is_restart_trigger());
    }

    #[test]
    fn test_expected_cwd() {
        let cmd = Command::new("Execute").with_field("expected_cwd", "/proj");
        assert_eq!(cmd.expected_cwd(), Some("/proj"));

        let cmd = Command::new("Execute").with_field("expected_cwd", 42);
        assert_eq!(cmd.expected_cwd(), None);

        assert_eq!(Command::new("Execute").expected_cwd(), None);
    }

    #[test]
    fn test_incoming_command_keeps_payload_fields() {
        let value = json!({
            "kind": "command",
            "name": "Execute",
            "expected_cwd": "/proj",
            "source": "print(1)",
            "id": 7
        });

        let incoming: Incoming = serde_json::from_value(value).unwrap();
        let Incoming::Command(cmd) = incoming else {
            panic!("expected a command");
        };

        assert_eq!(cmd.name, "Execute");
        assert_eq!(cmd.get_str("source"), Some("print(1)"));
        assert_eq!(cmd.command_id(), Some(&json!(7)));
        assert!(!cmd.fields.contains_key("kind"));
    }

    #[test]
    fn test_incoming_variants() {
        let eof: Incoming = serde_json::from_value(json!({"kind": "eof"})).unwrap();
        assert_eq!(eof, Incoming::Eof);

        let input: Incoming =
            serde_json::from_value(json!({"kind": "input", "data": "42\n"})).unwrap();
        assert_eq!(input, Incoming::Input { data: "42\n".to_string() });

        let immediate: Incoming =
            serde_json::from_value(json!({"kind": "immediate", "name": "interrupt"})).unwrap();
        assert_eq!(immediate, Incoming::Immediate(Command::new("interrupt")));
        assert_eq!(immediate.label(), "interrupt");
    }

    #[test]
    fn test_incoming_serializes_with_kind_tag() {
        let cmd = Incoming::Command(Command::new("run_id_123").with_field("x", 1));
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value, json!({"kind": "command", "name": "run_id_123", "x": 1}));
    }

    #[test]
    fn test_error_response_shape() {
        let cmd = Command::new("stat_path").with_field("id", "c-1");
        let resp = Response::error(&cmd, "No such file");

        assert_eq!(resp.error_message(), Some("No such file"));

        let value = serde_json::to_value(Message::response(resp)).unwrap();
        assert_eq!(
            value,
            json!({
                "kind": "response",
                "command_name": "stat_path",
                "command_id": "c-1",
                "error": "No such file"
            })
        );
    }

    #[test]
    fn test_payload_cannot_shadow_envelope_keys() {
        let mut fields = Map::new();
        fields.insert("kind".to_string(), json!("file"));
        fields.insert("command_name".to_string(), json!("other"));
        fields.insert("size".to_string(), json!(12));

        let cmd = Command::new("stat_path").with_field("id", 4);
        let msg = Message::response(Response::for_command(&cmd, fields));

        let text = serde_json::to_string(&msg).unwrap();
        let decoded: Message = serde_json::from_str(&text).unwrap();
        let Message::Response(resp) = decoded else {
            panic!("expected a response");
        };
        assert_eq!(resp.command_name, "stat_path");
        assert_eq!(resp.command_id, Some(json!(4)));
        assert_eq!(resp.fields.get("size"), Some(&json!(12)));
        assert!(!resp.fields.contains_key("kind"));
    }

    #[test]
    fn test_response_without_id_omits_field() {
        let resp = Response::for_command(&Command::new("list_dir"), Map::new());
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value, json!({"command_name": "list_dir"}));
    }
}
