//! Tools the model can call
//!
//! The set of tools is closed: [`ToolKind`] names every one of them and the
//! executor matches on it exhaustively. Every tool answers with a JSON
//! envelope whose `status` is `"success"` or `"error"`.

pub mod exec_code;
pub mod executor;
pub mod filesystem;
pub mod install;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::llm::Tool;

pub use executor::{ToolContext, ToolExecutor};
pub use filesystem::Workspace;

/// Every built-in tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    ReadDirectory,
    ReadFiles,
    ExecCode,
    InstallPackage,
}

impl ToolKind {
    pub const ALL: [ToolKind; 4] = [
        ToolKind::ReadDirectory,
        ToolKind::ReadFiles,
        ToolKind::ExecCode,
        ToolKind::InstallPackage,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::ReadDirectory => "read_directory",
            ToolKind::ReadFiles => "read_files",
            ToolKind::ExecCode => "exec_code",
            ToolKind::InstallPackage => "install_package",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolKind::ReadDirectory => {
                "List files in the workspace with name, kind, size and modification time. \
                 Use it to discover which data files are available."
            }
            ToolKind::ReadFiles => {
                "Read one or more files from the workspace. Text files return their first \
                 5000 characters; binary files are reported as such."
            }
            ToolKind::ExecCode => {
                "Execute Python code in a persistent interpreter. Variables survive between \
                 calls. pandas and matplotlib figures are supported; figures are captured \
                 automatically."
            }
            ToolKind::InstallPackage => {
                "Install a Python package into the interpreter with pip."
            }
        }
    }

    pub fn parameters(self) -> Value {
        match self {
            ToolKind::ReadDirectory => json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Optional subdirectory relative to the workspace root"
                    }
                },
                "required": []
            }),
            ToolKind::ReadFiles => json!({
                "type": "object",
                "properties": {
                    "filenames": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "File paths relative to the workspace, e.g. [\"data/sales.csv\"]"
                    }
                },
                "required": ["filenames"]
            }),
            ToolKind::ExecCode => json!({
                "type": "object",
                "properties": {
                    "code": {
                        "type": "string",
                        "description": "Python code to execute"
                    }
                },
                "required": ["code"]
            }),
            ToolKind::InstallPackage => json!({
                "type": "object",
                "properties": {
                    "package_name": {
                        "type": "string",
                        "description": "Package name as understood by pip, e.g. \"openpyxl\""
                    }
                },
                "required": ["package_name"]
            }),
        }
    }

    pub fn definition(self) -> Tool {
        Tool::function(self.name(), self.description(), self.parameters())
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Schemas for every tool, in a stable order
pub fn tool_definitions() -> Vec<Tool> {
    ToolKind::ALL.into_iter().map(ToolKind::definition).collect()
}

/// A validated tool call
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    ReadDirectory { path: Option<String> },
    ReadFiles { filenames: Vec<String> },
    ExecCode { code: String },
    InstallPackage { package_name: String },
}

#[derive(Deserialize)]
struct ReadDirectoryArgs {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Deserialize)]
struct ReadFilesArgs {
    filenames: Vec<String>,
}

#[derive(Deserialize)]
struct ExecCodeArgs {
    code: String,
}

#[derive(Deserialize)]
struct InstallPackageArgs {
    package_name: String,
}

fn parse_args<T: serde::de::DeserializeOwned>(kind: ToolKind, args: &Value) -> Result<T, ToolError> {
    // Models sometimes send `null` for tools without required arguments
    let args = if args.is_null() { json!({}) } else { args.clone() };
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments {
        tool: kind.name().to_string(),
        reason: e.to_string(),
    })
}

impl ToolInvocation {
    pub fn parse(kind: ToolKind, args: &Value) -> Result<Self, ToolError> {
        Ok(match kind {
            ToolKind::ReadDirectory => {
                let a: ReadDirectoryArgs = parse_args(kind, args)?;
                ToolInvocation::ReadDirectory {
                    path: a.path.filter(|p| !p.trim().is_empty()),
                }
            }
            ToolKind::ReadFiles => {
                let a: ReadFilesArgs = parse_args(kind, args)?;
                ToolInvocation::ReadFiles {
                    filenames: a.filenames,
                }
            }
            ToolKind::ExecCode => {
                let a: ExecCodeArgs = parse_args(kind, args)?;
                if a.code.trim().is_empty() {
                    return Err(ToolError::InvalidArguments {
                        tool: kind.name().to_string(),
                        reason: "code is empty".to_string(),
                    });
                }
                ToolInvocation::ExecCode { code: a.code }
            }
            ToolKind::InstallPackage => {
                let a: InstallPackageArgs = parse_args(kind, args)?;
                ToolInvocation::InstallPackage {
                    package_name: a.package_name,
                }
            }
        })
    }

    pub fn kind(&self) -> ToolKind {
        match self {
            ToolInvocation::ReadDirectory { .. } => ToolKind::ReadDirectory,
            ToolInvocation::ReadFiles { .. } => ToolKind::ReadFiles,
            ToolInvocation::ExecCode { .. } => ToolKind::ExecCode,
            ToolInvocation::InstallPackage { .. } => ToolKind::InstallPackage,
        }
    }
}

/// Error type for tool dispatch
#[derive(Debug, Error)]
pub enum ToolError {
    /// The model asked for a tool that does not exist
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },
}

/// `{"status": "error", "message": ...}`
pub fn error_envelope(message: impl std::fmt::Display) -> Value {
    json!({ "status": "error", "message": message.to_string() })
}

/// Merge `fields` into `{"status": "success"}`
pub fn success_envelope(fields: Value) -> Value {
    let mut envelope = serde_json::Map::new();
    envelope.insert("status".to_string(), json!("success"));
    if let Value::Object(map) = fields {
        for (key, value) in map {
            if key != "status" {
                envelope.insert(key, value);
            }
        }
    }
    Value::Object(envelope)
}

/// `status` of an envelope, or of every envelope in a list
pub fn envelope_status(result: &Value) -> &'static str {
    let is_error = |v: &Value| v.get("status").and_then(Value::as_str) == Some("error");
    let failed = match result {
        Value::Array(items) => !items.is_empty() && items.iter().all(is_error),
        other => is_error(other),
    };
    if failed {
        "error"
    } else {
        "success"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for kind in ToolKind::ALL {
            assert_eq!(ToolKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ToolKind::from_name("rm_rf"), None);
    }

    #[test]
    fn test_definitions_shape() {
        let defs = tool_definitions();
        let names: Vec<_> = defs.iter().map(|t| t.function.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["read_directory", "read_files", "exec_code", "install_package"]
        );
        let value = serde_json::to_value(&defs[1]).unwrap();
        assert_eq!(value["type"], "function");
        assert_eq!(value["function"]["parameters"]["required"][0], "filenames");
    }

    #[test]
    fn test_parse_invocations() {
        assert_eq!(
            ToolInvocation::parse(ToolKind::ReadDirectory, &Value::Null).unwrap(),
            ToolInvocation::ReadDirectory { path: None }
        );
        assert_eq!(
            ToolInvocation::parse(ToolKind::ReadDirectory, &json!({"path": ""})).unwrap(),
            ToolInvocation::ReadDirectory { path: None }
        );
        assert_eq!(
            ToolInvocation::parse(ToolKind::ReadFiles, &json!({"filenames": ["a.csv"]}))
                .unwrap()
                .kind(),
            ToolKind::ReadFiles
        );
        assert!(matches!(
            ToolInvocation::parse(ToolKind::ExecCode, &json!({"code": "  "})),
            Err(ToolError::InvalidArguments { .. })
        ));
        assert!(matches!(
            ToolInvocation::parse(ToolKind::ReadFiles, &json!({"filenames": "a.csv"})),
            Err(ToolError::InvalidArguments { .. })
        ));
    }

    #[test]
    fn test_envelopes() {
        let ok = success_envelope(json!({"status": "ignored", "n": 1}));
        assert_eq!(ok, json!({"status": "success", "n": 1}));
        assert_eq!(envelope_status(&ok), "success");
        assert_eq!(envelope_status(&error_envelope("boom")), "error");
        assert_eq!(
            envelope_status(&json!([{"status": "error"}, {"status": "success"}])),
            "success"
        );
        assert_eq!(envelope_status(&json!([{"status": "error"}])), "error");
    }
}
