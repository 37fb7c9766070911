//! 内存中的模拟编辑器
//!
//! 实现 ToolExecutor：跟踪文件、场景节点树与已打开的场景。节点级工具要求目标场景已打开，否则返回
//! NO_SCENE。支持故障注入（让某工具接下来 N 次调用失败）与按工具的人为延迟，用于测试超时与重试。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::state::NodeRecord;
use crate::tools::{catalog, ToolCall, ToolExecutor, ToolResult};

#[derive(Debug, Clone)]
struct Fault {
    remaining: u32,
    code: String,
    message: String,
}

#[derive(Debug, Clone, Default)]
struct SimScene {
    root_type: String,
    nodes: Vec<NodeRecord>,
}

impl SimScene {
    fn new(root_type: &str) -> Self {
        Self {
            root_type: root_type.to_string(),
            nodes: Vec::new(),
        }
    }

    fn has_node(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n.name == name)
    }
}

#[derive(Default)]
struct Editor {
    files: BTreeSet<String>,
    scenes: BTreeMap<String, SimScene>,
    open: BTreeSet<String>,
    project_errors: Vec<String>,
    runtime_errors: Vec<String>,
    faults: HashMap<String, Fault>,
    delays: HashMap<String, Duration>,
    calls: Vec<ToolCall>,
}

/// 模拟编辑器
#[derive(Default)]
pub struct SimulatedEditor {
    inner: Mutex<Editor>,
}

fn validate_path(path: &str) -> Result<(), ToolResult> {
    let Some(rest) = path.strip_prefix("res://") else {
        return Err(ToolResult::failure(
            "INVALID_PATH",
            format!("Path must start with res://: {path}"),
        ));
    };
    if rest.is_empty() || rest.contains('\\') || rest.contains("//") {
        return Err(ToolResult::failure(
            "INVALID_PATH",
            format!("Malformed path: {path}"),
        ));
    }
    Ok(())
}

fn required<'a>(params: &'a Value, key: &str) -> Result<&'a str, ToolResult> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolResult::failure("INVALID_PARAMS", format!("Missing param: {key}")))
}

fn path_param<'a>(params: &'a Value, key: &str) -> Result<&'a str, ToolResult> {
    let path = required(params, key)?;
    validate_path(path)?;
    Ok(path)
}

impl SimulatedEditor {
    pub fn new() -> Self {
        Self::default()
    }

    fn editor(&self) -> MutexGuard<'_, Editor> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 预置一个已存在（未打开）的场景
    pub fn with_scene(self, path: &str, root_type: &str) -> Self {
        {
            let mut ed = self.editor();
            ed.files.insert(path.to_string());
            ed.scenes.insert(path.to_string(), SimScene::new(root_type));
        }
        self
    }

    /// 预置一个资源文件
    pub fn with_file(self, path: &str) -> Self {
        self.editor().files.insert(path.to_string());
        self
    }

    /// 让 tool 接下来 times 次调用失败
    pub fn fail_next(&self, tool: &str, times: u32, code: &str, message: &str) {
        self.editor().faults.insert(
            tool.to_string(),
            Fault {
                remaining: times,
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    pub fn set_delay(&self, tool: &str, delay: Duration) {
        self.editor().delays.insert(tool.to_string(), delay);
    }

    pub fn push_project_error(&self, message: &str) {
        self.editor().project_errors.push(message.to_string());
    }

    pub fn push_runtime_error(&self, message: &str) {
        self.editor().runtime_errors.push(message.to_string());
    }

    pub fn open_scenes(&self) -> Vec<String> {
        self.editor().open.iter().cloned().collect()
    }

    pub fn close_all(&self) {
        self.editor().open.clear();
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.editor().files.contains(path)
    }

    pub fn scene_nodes(&self, path: &str) -> Vec<NodeRecord> {
        self.editor()
            .scenes
            .get(path)
            .map(|s| s.nodes.clone())
            .unwrap_or_default()
    }

    /// 所有收到的调用（按顺序）
    pub fn calls(&self) -> Vec<ToolCall> {
        self.editor().calls.clone()
    }

    pub fn call_count(&self, tool: &str) -> usize {
        self.editor().calls.iter().filter(|c| c.name == tool).count()
    }

    fn take_fault(ed: &mut Editor, tool: &str) -> Option<ToolResult> {
        let fault = ed.faults.get_mut(tool)?;
        if fault.remaining == 0 {
            return None;
        }
        fault.remaining -= 1;
        Some(ToolResult::failure(fault.code.clone(), fault.message.clone()))
    }

    fn open_scene_mut<'a>(ed: &'a mut Editor, scene_path: &str) -> Result<&'a mut SimScene, ToolResult> {
        if !ed.open.contains(scene_path) {
            return Err(ToolResult::failure(
                "NO_SCENE",
                format!("No scene open: {scene_path} is not open"),
            ));
        }
        ed.scenes
            .get_mut(scene_path)
            .ok_or_else(|| ToolResult::failure("NOT_FOUND", format!("Scene not found: {scene_path}")))
    }

    fn dispatch(ed: &mut Editor, tool: &str, p: &Value) -> Result<Value, ToolResult> {
        match tool {
            "get_scene_tree" => match p.get("path").and_then(Value::as_str) {
                Some(path) => {
                    let scene = ed
                        .scenes
                        .get(path)
                        .ok_or_else(|| ToolResult::failure("NOT_FOUND", format!("Scene not found: {path}")))?;
                    Ok(json!({ "path": path, "rootType": scene.root_type, "nodes": scene.nodes }))
                }
                None => Ok(json!({ "open": ed.open })),
            },
            "get_node_info" => {
                let scene_path = path_param(p, "scene_path")?;
                let name = required(p, "name")?;
                let node = ed
                    .scenes
                    .get(scene_path)
                    .and_then(|s| s.nodes.iter().find(|n| n.name == name))
                    .ok_or_else(|| ToolResult::failure("NOT_FOUND", format!("Node not found: {name}")))?;
                Ok(json!(node))
            }
            "list_scenes" => Ok(json!(ed.scenes.keys().collect::<Vec<_>>())),
            "get_open_scenes" => Ok(json!(ed.open)),
            "open_scene" => {
                let path = path_param(p, "path")?;
                if !ed.scenes.contains_key(path) {
                    return Err(ToolResult::failure("NOT_FOUND", format!("Scene not found: {path}")));
                }
                ed.open.insert(path.to_string());
                Ok(json!({ "path": path }))
            }
            "read_file" => {
                let path = path_param(p, "path")?;
                if !ed.files.contains(path) {
                    return Err(ToolResult::failure("NOT_FOUND", format!("File not found: {path}")));
                }
                Ok(json!({ "path": path }))
            }
            "list_files" => {
                let dir = p.get("dir").and_then(Value::as_str).unwrap_or("res://");
                let files: Vec<&String> = ed.files.iter().filter(|f| f.starts_with(dir)).collect();
                Ok(json!(files))
            }
            "create_scene" => {
                let path = path_param(p, "path")?;
                let root_type = p.get("root_type").and_then(Value::as_str).unwrap_or("Node2D");
                let created = !ed.scenes.contains_key(path);
                if created {
                    ed.scenes.insert(path.to_string(), SimScene::new(root_type));
                    ed.files.insert(path.to_string());
                }
                ed.open.insert(path.to_string());
                Ok(json!({ "path": path, "created": created }))
            }
            "save_scene" => {
                let path = path_param(p, "path")?;
                if !ed.scenes.contains_key(path) {
                    return Err(ToolResult::failure("NOT_FOUND", format!("Scene not found: {path}")));
                }
                Ok(json!({ "path": path, "saved": true }))
            }
            "delete_scene" => {
                let path = path_param(p, "path")?;
                let existed = ed.scenes.remove(path).is_some();
                ed.files.remove(path);
                ed.open.remove(path);
                Ok(json!({ "path": path, "deleted": existed }))
            }
            "add_node" | "place_entity" | "create_tilemap" => {
                let scene_path = path_param(p, "scene_path")?;
                let Some(name) = catalog::node_name(tool, p) else {
                    return Err(ToolResult::failure("INVALID_PARAMS", "Missing param: name"));
                };
                let name = name.to_string();
                let node_type = catalog::node_type(tool, p).to_string();
                let parent = p.get("parent").and_then(Value::as_str).map(str::to_string);
                let scene = Self::open_scene_mut(ed, scene_path)?;
                if let Some(parent) = &parent {
                    if !scene.has_node(parent) {
                        return Err(ToolResult::failure(
                            "INVALID_PARAMS",
                            format!("Parent node does not exist: {parent}"),
                        ));
                    }
                }
                if !scene.has_node(&name) {
                    scene.nodes.push(NodeRecord {
                        name: name.clone(),
                        node_type: node_type.clone(),
                        parent,
                    });
                }
                Ok(json!({ "scene_path": scene_path, "name": name, "type": node_type }))
            }
            "remove_node" => {
                let scene_path = path_param(p, "scene_path")?;
                let name = required(p, "name")?.to_string();
                let scene = Self::open_scene_mut(ed, scene_path)?;
                scene.nodes.retain(|n| n.name != name && n.parent.as_deref() != Some(name.as_str()));
                Ok(json!({ "scene_path": scene_path, "removed": name }))
            }
            "rename_node" => {
                let scene_path = path_param(p, "scene_path")?;
                let name = required(p, "name")?.to_string();
                let new_name = required(p, "new_name")?.to_string();
                let scene = Self::open_scene_mut(ed, scene_path)?;
                if !scene.has_node(&name) {
                    return Err(ToolResult::failure("INVALID_PARAMS", format!("Node does not exist: {name}")));
                }
                for node in scene.nodes.iter_mut() {
                    if node.name == name {
                        node.name = new_name.clone();
                    }
                    if node.parent.as_deref() == Some(name.as_str()) {
                        node.parent = Some(new_name.clone());
                    }
                }
                Ok(json!({ "scene_path": scene_path, "name": new_name }))
            }
            "reparent_node" => {
                let scene_path = path_param(p, "scene_path")?;
                let name = required(p, "name")?.to_string();
                let parent = required(p, "parent")?.to_string();
                let scene = Self::open_scene_mut(ed, scene_path)?;
                if !scene.has_node(&name) || !scene.has_node(&parent) {
                    return Err(ToolResult::failure("INVALID_PARAMS", "Node or parent does not exist"));
                }
                for node in scene.nodes.iter_mut().filter(|n| n.name == name) {
                    node.parent = Some(parent.clone());
                }
                Ok(json!({ "scene_path": scene_path, "name": name, "parent": parent }))
            }
            "attach_script" | "set_collision_shape" | "set_tiles" | "paint_terrain" => {
                let scene_path = path_param(p, "scene_path")?;
                Self::open_scene_mut(ed, scene_path)?;
                Ok(json!({ "scene_path": scene_path, "applied": tool }))
            }
            "import_asset" | "create_sprite_frames" | "create_animation" | "create_tileset" => {
                let path = path_param(p, "path")?;
                ed.files.insert(path.to_string());
                Ok(json!({ "path": path }))
            }
            "get_project_errors" => Ok(json!({ "errors": ed.project_errors })),
            "get_runtime_errors" => Ok(json!({ "errors": ed.runtime_errors })),
            "validate_resource" => {
                let path = path_param(p, "path")?;
                Ok(json!({ "path": path, "exists": ed.files.contains(path) }))
            }
            other => Err(ToolResult::failure("UNKNOWN_TOOL", format!("Unknown tool: {other}")).unrecoverable()),
        }
    }
}

#[async_trait]
impl ToolExecutor for SimulatedEditor {
    async fn execute(&self, tool_name: &str, params: Value) -> ToolResult {
        let delay = {
            let mut ed = self.editor();
            ed.calls.push(ToolCall::new(tool_name, params.clone()));
            ed.delays.get(tool_name).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut ed = self.editor();
        if let Some(fault) = Self::take_fault(&mut ed, tool_name) {
            return fault;
        }
        match Self::dispatch(&mut ed, tool_name, &params) {
            Ok(data) => ToolResult::ok(data),
            Err(failure) => failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_node_tools_need_open_scene() {
        let editor = SimulatedEditor::new().with_scene("res://main.tscn", "Node2D");
        let add = json!({ "scene_path": "res://main.tscn", "name": "Player" });

        let result = editor.execute("add_node", add.clone()).await;
        assert_eq!(result.code, "NO_SCENE");

        assert!(editor.execute("open_scene", json!({ "path": "res://main.tscn" })).await.success);
        assert!(editor.execute("add_node", add).await.success);
        assert_eq!(editor.scene_nodes("res://main.tscn").len(), 1);
    }

    #[tokio::test]
    async fn test_create_scene_is_idempotent() {
        let editor = SimulatedEditor::new();
        let first = editor.execute("create_scene", json!({ "path": "res://a.tscn" })).await;
        let second = editor.execute("create_scene", json!({ "path": "res://a.tscn" })).await;
        assert_eq!(first.data.unwrap()["created"], true);
        assert_eq!(second.data.unwrap()["created"], false);
        assert_eq!(editor.open_scenes(), vec!["res://a.tscn"]);
    }

    #[tokio::test]
    async fn test_malformed_path_rejected() {
        let editor = SimulatedEditor::new();
        let result = editor.execute("create_scene", json!({ "path": "scenes\\a.tscn" })).await;
        assert_eq!(result.code, "INVALID_PATH");
        assert!(!editor.file_exists("scenes\\a.tscn"));
    }

    #[tokio::test]
    async fn test_fault_injection_counts_down() {
        let editor = SimulatedEditor::new();
        editor.fail_next("import_asset", 2, "ERROR", "disk busy");
        let params = json!({ "path": "res://hero.png" });

        assert!(!editor.execute("import_asset", params.clone()).await.success);
        assert!(!editor.execute("import_asset", params.clone()).await.success);
        assert!(editor.execute("import_asset", params).await.success);
        assert_eq!(editor.call_count("import_asset"), 3);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_unrecoverable() {
        let result = SimulatedEditor::new().execute("format_disk", json!({})).await;
        assert!(!result.success);
        assert!(!result.recoverable);
    }
}
