//! Hive 演示入口
//!
//! 初始化日志与配置，在模拟编辑器 + Mock 推理客户端上构建编排器，执行命令行给出的请求，
//! 打印汇总结果（JSON）与检查点历史。

use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use tokio::sync::mpsc;

use hive::config::load_config_or_default;
use hive::llm::MockReasoningClient;
use hive::tools::{SimulatedEditor, ToolCall};
use hive::workflow::TaskType;
use hive::CoordinatorBuilder;

const DEFAULT_REQUEST: &str = "Create a main scene with a player character and a tile level";
const MAIN_SCENE: &str = "res://scenes/main.tscn";

fn demo_reasoning() -> MockReasoningClient {
    MockReasoningClient::new()
        .with_script(
            TaskType::SceneLayout,
            vec![
                ToolCall::new("create_scene", json!({ "path": MAIN_SCENE, "root_type": "Node2D" })),
                ToolCall::new(
                    "add_node",
                    json!({ "scene_path": MAIN_SCENE, "name": "Player", "type": "CharacterBody2D" }),
                ),
                ToolCall::new("save_scene", json!({ "path": MAIN_SCENE })),
            ],
        )
        .with_script(
            TaskType::AssetImport,
            vec![ToolCall::new("import_asset", json!({ "path": "res://art/hero.png" }))],
        )
        .with_script(
            TaskType::CharacterSetup,
            vec![
                ToolCall::new(
                    "create_sprite_frames",
                    json!({ "path": "res://art/hero_frames.tres", "texture": "res://art/hero.png" }),
                ),
                ToolCall::new(
                    "attach_script",
                    json!({ "scene_path": MAIN_SCENE, "node": "Player", "script": "res://scripts/player.gd" }),
                ),
                ToolCall::new(
                    "set_collision_shape",
                    json!({ "scene_path": MAIN_SCENE, "node": "Player", "shape": "capsule" }),
                ),
            ],
        )
        .with_script(
            TaskType::LevelLayout,
            vec![
                ToolCall::new("create_tileset", json!({ "path": "res://tiles/ground.tres" })),
                ToolCall::new(
                    "create_tilemap",
                    json!({ "scene_path": MAIN_SCENE, "tileset": "res://tiles/ground.tres" }),
                ),
                ToolCall::new(
                    "paint_terrain",
                    json!({ "scene_path": MAIN_SCENE, "terrain": "grass", "rect": [0, 10, 40, 2] }),
                ),
            ],
        )
        .with_script(TaskType::Analysis, vec![ToolCall::new("get_scene_tree", json!({}))])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let request = if args.is_empty() {
        DEFAULT_REQUEST.to_string()
    } else {
        args.join(" ")
    };

    let cfg = load_config_or_default(None);
    let editor = Arc::new(
        SimulatedEditor::new()
            .with_file("res://art/hero.png")
            .with_file("res://scripts/player.gd"),
    );

    // 事件出口：以 JSON 行写入日志
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                tracing::info!(event = %line, "coordinator");
            }
        }
    });

    let mut orchestrator = CoordinatorBuilder::new(cfg)
        .with_tool_executor(editor)
        .with_reasoning(Arc::new(demo_reasoning()))
        .with_event_sender(tx)
        .with_default_agents()
        .build()
        .await
        .context("Failed to build coordinator")?;

    let result = orchestrator.process_request(&request).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to serialize result")?
    );

    println!("\nCheckpoints:");
    for checkpoint in orchestrator.get_checkpoint_history(10).await {
        println!("  {}  {}  {}", checkpoint.id, checkpoint.timestamp, checkpoint.label);
    }

    orchestrator.shutdown().await;
    Ok(())
}
