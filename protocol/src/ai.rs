//! Pluggable strategies behind the AI and execution endpoints.
//!
//! The mesh core only maintains conversation state and routes requests;
//! how text, code, or execution output is actually produced is injected.
//! The template implementations below keep a node fully functional with
//! no model or runtime attached — production deployments plug a real
//! provider in behind the same traits.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::ChatTurn;

/// What the surrounding mesh looks like at response time.
pub struct MeshView {
    pub services: Vec<String>,
    pub peer_count: usize,
}

pub trait ChatResponder: Send + Sync {
    fn respond(&self, message: &str, history: &[ChatTurn], model: &str, view: &MeshView)
        -> String;
}

pub trait CodeGenerator: Send + Sync {
    fn generate(&self, prompt: &str, language: &str, context: &str) -> String;
}

/// Outcome of running a snippet, before it is framed as a wire response.
pub struct ExecutionOutcome {
    pub output: String,
    pub error: String,
    pub duration_ms: f64,
}

pub trait CodeExecutor: Send + Sync {
    fn execute(&self, code: &str, language: &str) -> ExecutionOutcome;
}

/// A registered model descriptor, reported through `/mesh/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub version: String,
    pub capabilities: Vec<String>,
}

/// The models every node registers out of the box.
pub fn default_models() -> HashMap<String, ModelInfo> {
    let mut models = HashMap::new();
    models.insert(
        "default".to_string(),
        ModelInfo {
            name: "weft-chat".into(),
            version: "1.0".into(),
            capabilities: vec!["chat".into(), "code-generation".into(), "analysis".into()],
        },
    );
    models.insert(
        "code".to_string(),
        ModelInfo {
            name: "weft-codegen".into(),
            version: "1.0".into(),
            capabilities: vec![
                "code-generation".into(),
                "debugging".into(),
                "optimization".into(),
            ],
        },
    );
    models
}

/// Canned chat responses with light context awareness.
pub struct TemplateResponder;

impl ChatResponder for TemplateResponder {
    fn respond(
        &self,
        message: &str,
        _history: &[ChatTurn],
        _model: &str,
        view: &MeshView,
    ) -> String {
        let templates = [
            format!("I understand you're asking about: \"{message}\". Here's my analysis..."),
            format!("Based on your message, I can help you with: {message}"),
            format!("Let me process that request: \"{message}\" and provide you with a solution."),
            format!("Great question! Regarding \"{message}\", here's what I think..."),
            format!("I see you need help with: {message}. Let me break this down for you."),
        ];
        let base = {
            use rand::Rng;
            templates[rand::thread_rng().gen_range(0..templates.len())].clone()
        };

        let lower = message.to_lowercase();
        if lower.contains("code") {
            return format!(
                "{base}\n\nFor code-related tasks, I can help you generate, debug, or explain \
                 code in multiple languages including: {}.",
                view.services.join(", ")
            );
        }
        if lower.contains("container") {
            return format!(
                "{base}\n\nI can see {} active containers in the mesh: {}.",
                view.peer_count,
                view.services.join(", ")
            );
        }
        base
    }
}

/// Per-language starter templates.
pub struct TemplateGenerator;

impl CodeGenerator for TemplateGenerator {
    fn generate(&self, prompt: &str, language: &str, context: &str) -> String {
        match language {
            "javascript" => format!(
                "// Generated code for: {prompt}\nfunction solution() {{\n    \
                 console.log(\"Hello from {language}!\");\n}}\n\nsolution();"
            ),
            "python" => format!(
                "# Generated code for: {prompt}\ndef solution():\n    \
                 print(\"Hello from {language}!\")\n\nif __name__ == \"__main__\":\n    solution()"
            ),
            "java" => format!(
                "// Generated code for: {prompt}\npublic class Solution {{\n    \
                 public static void main(String[] args) {{\n        \
                 System.out.println(\"Hello from {language}!\");\n    }}\n}}"
            ),
            "go" => format!(
                "// Generated code for: {prompt}\npackage main\n\nimport \"fmt\"\n\n\
                 func main() {{\n    fmt.Println(\"Hello from {language}!\")\n}}"
            ),
            "rust" => format!(
                "// Generated code for: {prompt}\nfn main() {{\n    \
                 println!(\"Hello from {{}}!\", \"{language}\");\n}}"
            ),
            _ => format!(
                "// Generated code for: {prompt}\n// Language: {language}\n// Context: {context}"
            ),
        }
    }
}

/// Stand-in executor: reports what it would have run. The production
/// implementation shells into the container runtime instead.
pub struct MockExecutor;

impl CodeExecutor for MockExecutor {
    fn execute(&self, code: &str, language: &str) -> ExecutionOutcome {
        use rand::Rng;
        ExecutionOutcome {
            output: format!(
                "Executing {language} code...\nCode length: {} characters\n\
                 Execution completed successfully!",
                code.len()
            ),
            error: String::new(),
            duration_ms: rand::thread_rng().gen_range(100.0..1100.0),
        }
    }
}
