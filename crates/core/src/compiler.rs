use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::job::WorkerTypeKey;

/// Result of compiling one job payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileOutput {
    pub succeeded: bool,
    pub output: Option<Value>,
    pub errors: Vec<String>,
}

impl CompileOutput {
    pub fn success(output: Value) -> Self {
        Self {
            succeeded: true,
            output: Some(output),
            errors: Vec::new(),
        }
    }

    pub fn failure(errors: Vec<String>) -> Self {
        Self {
            succeeded: false,
            output: None,
            errors,
        }
    }
}

/// Turns a job payload into a result.
///
/// Runs inside worker processes, and on the dispatch thread when
/// out-of-process workers are disabled.
pub trait Compiler: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    fn compile(&self, worker_type: &WorkerTypeKey, input: &Value) -> CompileOutput;
}

/// Reference compiler shipped with the worker executable.
///
/// Reads `input.source` as text. A line starting with `#error` fails the
/// job, lines starting with `#warning` are reported as diagnostics, and
/// anything else is hashed.
#[derive(Debug, Default, Clone)]
pub struct DigestCompiler;

impl Compiler for DigestCompiler {
    fn name(&self) -> &str {
        "digest"
    }

    fn compile(&self, worker_type: &WorkerTypeKey, input: &Value) -> CompileOutput {
        let Some(source) = input.get("source").and_then(Value::as_str) else {
            return CompileOutput::failure(vec!["input has no string `source` field".into()]);
        };

        let mut warnings = Vec::new();
        for line in source.lines() {
            let line = line.trim_start();
            if let Some(msg) = line.strip_prefix("#error") {
                return CompileOutput::failure(vec![msg.trim().to_string()]);
            }
            if let Some(msg) = line.strip_prefix("#warning") {
                warnings.push(msg.trim().to_string());
            }
        }

        let digest = Sha256::digest(source.as_bytes());
        let mut out = CompileOutput::success(json!({
            "digest": format!("{digest:x}"),
            "bytes": source.len(),
            "worker_type": worker_type.as_str(),
        }));
        out.errors = warnings;
        out
    }
}

/// Text of a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
