//! 工具目录
//!
//! 每个已知工具的访问类型（只读 / 修改）、被加锁资源所在参数、是否破坏性（需审批）以及对 ProjectState 的影响。
//! 各 Agent 的独占工具表与共享只读工具表也在此声明。

use serde_json::Value;

use crate::tools::ToolCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolAccess {
    ReadOnly,
    Mutating,
}

/// 成功调用后需要同步到 ProjectState 的变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEffect {
    None,
    CreateScene,
    DeleteScene,
    TouchScene,
    AddNode,
    RemoveNode,
    RenameNode,
    ReparentNode,
    WriteAsset,
}

#[derive(Debug, Clone, Copy)]
pub struct ToolSpec {
    pub name: &'static str,
    pub access: ToolAccess,
    /// 存放资源路径的参数名（加锁对象）
    pub resource_param: Option<&'static str>,
    /// 破坏性操作需经过审批
    pub destructive: bool,
    pub effect: StateEffect,
}

const fn read(name: &'static str) -> ToolSpec {
    ToolSpec {
        name,
        access: ToolAccess::ReadOnly,
        resource_param: None,
        destructive: false,
        effect: StateEffect::None,
    }
}

const fn write(name: &'static str, param: &'static str, effect: StateEffect) -> ToolSpec {
    ToolSpec {
        name,
        access: ToolAccess::Mutating,
        resource_param: Some(param),
        destructive: false,
        effect,
    }
}

const fn destroy(name: &'static str, param: &'static str, effect: StateEffect) -> ToolSpec {
    ToolSpec {
        name,
        access: ToolAccess::Mutating,
        resource_param: Some(param),
        destructive: true,
        effect,
    }
}

pub const CATALOG: &[ToolSpec] = &[
    // 共享只读
    read("get_scene_tree"),
    read("get_node_info"),
    read("list_scenes"),
    read("get_open_scenes"),
    read("open_scene"),
    read("read_file"),
    read("list_files"),
    // 场景结构
    write("create_scene", "path", StateEffect::CreateScene),
    write("save_scene", "path", StateEffect::TouchScene),
    destroy("delete_scene", "path", StateEffect::DeleteScene),
    write("add_node", "scene_path", StateEffect::AddNode),
    destroy("remove_node", "scene_path", StateEffect::RemoveNode),
    write("rename_node", "scene_path", StateEffect::RenameNode),
    write("reparent_node", "scene_path", StateEffect::ReparentNode),
    // 角色与资源
    write("import_asset", "path", StateEffect::WriteAsset),
    write("create_sprite_frames", "path", StateEffect::WriteAsset),
    write("create_animation", "path", StateEffect::WriteAsset),
    write("attach_script", "scene_path", StateEffect::TouchScene),
    write("set_collision_shape", "scene_path", StateEffect::TouchScene),
    // 关卡
    write("create_tileset", "path", StateEffect::WriteAsset),
    write("create_tilemap", "scene_path", StateEffect::AddNode),
    write("set_tiles", "scene_path", StateEffect::TouchScene),
    write("paint_terrain", "scene_path", StateEffect::TouchScene),
    write("place_entity", "scene_path", StateEffect::AddNode),
    // 质量检查
    read("get_project_errors"),
    read("get_runtime_errors"),
    read("validate_resource"),
];

pub const SHARED_READ_TOOLS: &[&str] = &[
    "get_scene_tree",
    "get_node_info",
    "list_scenes",
    "get_open_scenes",
    "open_scene",
    "read_file",
    "list_files",
];

pub const ARCHITECT_TOOLS: &[&str] = &[
    "create_scene",
    "save_scene",
    "delete_scene",
    "add_node",
    "remove_node",
    "rename_node",
    "reparent_node",
];

pub const CHARACTER_TOOLS: &[&str] = &[
    "import_asset",
    "create_sprite_frames",
    "create_animation",
    "attach_script",
    "set_collision_shape",
];

pub const LEVEL_TOOLS: &[&str] = &[
    "create_tileset",
    "create_tilemap",
    "set_tiles",
    "paint_terrain",
    "place_entity",
];

pub const QA_TOOLS: &[&str] = &["get_project_errors", "get_runtime_errors", "validate_resource"];

pub fn lookup(name: &str) -> Option<&'static ToolSpec> {
    CATALOG.iter().find(|spec| spec.name == name)
}

/// 未登记的工具按「修改、无资源」保守处理
pub fn is_mutating(name: &str) -> bool {
    lookup(name).map_or(true, |spec| spec.access == ToolAccess::Mutating)
}

/// 调用所作用的资源路径（需加锁的对象）
pub fn resource_path(call: &ToolCall) -> Option<String> {
    let spec = lookup(&call.name)?;
    if spec.access != ToolAccess::Mutating {
        return None;
    }
    spec.resource_param
        .and_then(|p| call.params.get(p))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// 新增节点的名称：create_tilemap 缺省为 "TileMap"，其余工具必须显式给出
pub fn node_name<'a>(tool: &str, params: &'a Value) -> Option<&'a str> {
    match params.get("name").and_then(Value::as_str) {
        Some(name) if !name.is_empty() => Some(name),
        _ if tool == "create_tilemap" => Some("TileMap"),
        _ => None,
    }
}

/// 新增节点的类型：参数 type 优先，否则按工具取默认值
pub fn node_type<'a>(tool: &str, params: &'a Value) -> &'a str {
    params
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or(match tool {
            "create_tilemap" => "TileMap",
            "place_entity" => "Node2D",
            _ => "Node",
        })
}

pub fn to_strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}
