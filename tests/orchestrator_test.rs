//! 编排器集成测试：依赖排序、恢复、重试上限、取消、暂停、审批、回滚

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use hive::agents::{Agent, AgentConfig, AgentRole, ChannelApproval};
use hive::config::{AgentsSection, AppConfig};
use hive::core::{CoordinatorContext, CoordinatorEvent, ErrorCode, Orchestrator, OrchestratorPhase};
use hive::llm::MockReasoningClient;
use hive::state::AgentState;
use hive::tools::{SimulatedEditor, ToolCall};
use hive::workflow::{AgentResult, AgentTask, PlanRequest, PlanStatus, SubGoal, TaskType};
use hive::CoordinatorBuilder;

const MAIN_SCENE: &str = "res://scenes/main.tscn";

/// 记录开始 / 结束顺序的测试 Agent
struct RecordingAgent {
    config: AgentConfig,
    types: Vec<TaskType>,
    delay: Duration,
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingAgent {
    fn new(types: &[TaskType], delay: Duration, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            config: AgentConfig::new("recorder", "Recorder", AgentRole::Coordinator, &AgentsSection::default()),
            types: types.to_vec(),
            delay,
            log,
        }
    }
}

#[async_trait]
impl Agent for RecordingAgent {
    fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn handled_task_types(&self) -> &[TaskType] {
        &self.types
    }

    async fn execute(&self, task: &AgentTask, _ctx: &CoordinatorContext) -> AgentResult {
        self.log.lock().unwrap().push(format!("start {}", task.id));
        tokio::time::sleep(self.delay).await;
        self.log.lock().unwrap().push(format!("end {}", task.id));
        AgentResult::success(task.id.clone(), self.config.id.clone())
    }

    async fn status(&self) -> AgentState {
        AgentState::default()
    }
}

fn position(log: &[String], entry: &str) -> usize {
    log.iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("{entry} not in {log:?}"))
}

async fn recording_orchestrator(delay: Duration) -> (Orchestrator, Arc<Mutex<Vec<String>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let agent = RecordingAgent::new(
        &[TaskType::SceneLayout, TaskType::AssetImport, TaskType::CharacterSetup],
        delay,
        log.clone(),
    );
    let orchestrator = CoordinatorBuilder::new(AppConfig::default())
        .with_agent(Arc::new(agent))
        .with_lock_reaper(false)
        .build()
        .await
        .unwrap();
    (orchestrator, log)
}

/// A、B 无依赖，C 依赖 A 与 B
fn diamond_request() -> PlanRequest {
    PlanRequest::new("diamond")
        .with_hint(SubGoal::new("a", TaskType::SceneLayout, "task a"))
        .with_hint(SubGoal::new("b", TaskType::AssetImport, "task b"))
        .with_hint(SubGoal::new("c", TaskType::CharacterSetup, "task c").after(&["a", "b"]))
}

fn scripted_reasoning() -> MockReasoningClient {
    MockReasoningClient::new()
        .with_script(
            TaskType::SceneLayout,
            vec![
                ToolCall::new("create_scene", json!({ "path": MAIN_SCENE, "root_type": "Node2D" })),
                ToolCall::new("add_node", json!({ "scene_path": MAIN_SCENE, "name": "Player", "type": "CharacterBody2D" })),
            ],
        )
        .with_script(
            TaskType::CharacterSetup,
            vec![ToolCall::new(
                "attach_script",
                json!({ "scene_path": MAIN_SCENE, "node": "Player", "script": "res://scripts/player.gd" }),
            )],
        )
        .with_script(
            TaskType::LevelLayout,
            vec![
                ToolCall::new("create_tileset", json!({ "path": "res://tiles/ground.tres" })),
                ToolCall::new("create_tilemap", json!({ "scene_path": MAIN_SCENE, "tileset": "res://tiles/ground.tres" })),
            ],
        )
}

async fn default_orchestrator(editor: Arc<SimulatedEditor>, cfg: AppConfig) -> Orchestrator {
    CoordinatorBuilder::new(cfg)
        .with_tool_executor(editor)
        .with_reasoning(Arc::new(scripted_reasoning()))
        .with_default_agents()
        .with_lock_reaper(false)
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_group_runs_together_and_dependent_waits() {
    let (orchestrator, log) = recording_orchestrator(Duration::from_millis(40)).await;

    let result = orchestrator.process_plan_request(diamond_request()).await;

    assert!(result.success, "{:?}", result.error);
    let log = log.lock().unwrap().clone();
    let (a, b, c) = ("task_1_a", "task_2_b", "task_3_c");
    let first_end = position(&log, &format!("end {a}")).min(position(&log, &format!("end {b}")));
    assert!(position(&log, &format!("start {a}")) < first_end);
    assert!(position(&log, &format!("start {b}")) < first_end);
    let c_start = position(&log, &format!("start {c}"));
    assert!(c_start > position(&log, &format!("end {a}")));
    assert!(c_start > position(&log, &format!("end {b}")));
    assert_eq!(orchestrator.phase(), OrchestratorPhase::Completed);
}

#[tokio::test]
async fn test_end_to_end_with_builtin_agents() {
    let editor = Arc::new(SimulatedEditor::new().with_file("res://scripts/player.gd"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let orchestrator = CoordinatorBuilder::new(AppConfig::default())
        .with_tool_executor(editor.clone())
        .with_reasoning(Arc::new(scripted_reasoning()))
        .with_event_sender(tx)
        .with_default_agents()
        .with_lock_reaper(false)
        .build()
        .await
        .unwrap();

    let result = orchestrator
        .process_request("Create a main scene with a player character and a tile level")
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.agent_id, "orchestrator");
    assert!(result.artifacts.contains(&MAIN_SCENE.to_string()));
    assert!(result.artifacts.contains(&"res://tiles/ground.tres".to_string()));
    assert_eq!(result.output["tasks"].as_object().unwrap().len(), 4);

    let state = orchestrator.get_state().await;
    let scene = &state.scenes[MAIN_SCENE];
    assert!(scene.node("Player").is_some());
    assert!(scene.node("TileMap").is_some());
    assert!(scene.dependencies.contains(&"res://scripts/player.gd".to_string()));
    assert!(state.locks.is_empty());
    let plan = state.current_plan.unwrap();
    assert_eq!(plan.status, PlanStatus::Completed);
    assert!(plan.checkpoint_id.is_some());

    drop(orchestrator);
    let mut saw_plan = false;
    let mut saw_qa_complete = false;
    while let Some(event) = rx.recv().await {
        match event {
            CoordinatorEvent::PlanCreated(summary) => saw_plan = summary.task_count == 4,
            CoordinatorEvent::AgentStatus { role: AgentRole::Qa, state, .. } => {
                saw_qa_complete |= state == hive::state::AgentStatus::Complete
            }
            _ => {}
        }
    }
    assert!(saw_plan);
    assert!(saw_qa_complete);
}

#[tokio::test]
async fn test_missing_open_scene_recovered_through_plan() {
    let editor = Arc::new(SimulatedEditor::new().with_scene("res://level.tscn", "Node2D"));
    let orchestrator = default_orchestrator(editor.clone(), AppConfig::default()).await;

    let request = PlanRequest::new("add a spawn point").with_hint(
        SubGoal::new("scene", TaskType::SceneLayout, "add a spawn point").with_input(
            "tool_calls",
            json!([{ "name": "add_node", "params": { "scene_path": "res://level.tscn", "name": "Spawn" } }]),
        ),
    );
    let result = orchestrator.process_plan_request(request).await;

    assert!(result.success, "{:?}", result.error);
    let calls: Vec<String> = editor.calls().into_iter().map(|c| c.name).collect();
    let open = calls.iter().position(|n| n == "open_scene").unwrap();
    let last_add = calls.iter().rposition(|n| n == "add_node").unwrap();
    assert!(open < last_add);
    assert_eq!(editor.call_count("add_node"), 2);
}

#[tokio::test]
async fn test_exhausted_retries_fail_plan_and_keep_artifacts() {
    let editor = Arc::new(SimulatedEditor::new());
    editor.fail_next("import_asset", 10, "ERROR", "disk busy");
    let orchestrator = default_orchestrator(editor.clone(), AppConfig::default()).await;

    let request = PlanRequest::new("scene then asset then character")
        .with_hint(SubGoal::new("scene", TaskType::SceneLayout, "lay out the main scene"))
        .with_hint(
            SubGoal::new("asset", TaskType::AssetImport, "import the hero")
                .after(&["scene"])
                .with_input("tool_calls", json!([{ "name": "import_asset", "params": { "path": "res://hero.png" } }])),
        )
        .with_hint(SubGoal::new("character", TaskType::CharacterSetup, "wire the player").after(&["asset"]));
    let result = orchestrator.process_plan_request(request).await;

    assert!(!result.success);
    let error = result.error.unwrap();
    assert_eq!(error.code, ErrorCode::ToolFailure);
    assert!(error.message.contains("task_2_asset"));
    // 1 次初始尝试 + 2 次重试
    assert_eq!(editor.call_count("import_asset"), 3);
    assert_eq!(editor.call_count("attach_script"), 0);
    assert_eq!(result.artifacts, vec![MAIN_SCENE]);
    assert_eq!(result.output["tasks"].as_object().unwrap().len(), 2);

    assert_eq!(orchestrator.phase(), OrchestratorPhase::Failed);
    let state = orchestrator.get_state().await;
    assert_eq!(state.current_plan.unwrap().status, PlanStatus::Failed);
    assert!(state.scenes.contains_key(MAIN_SCENE));
}

#[tokio::test]
async fn test_rollback_to_pre_plan_checkpoint() {
    let editor = Arc::new(SimulatedEditor::new());
    let orchestrator = default_orchestrator(editor, AppConfig::default()).await;
    let before = orchestrator.create_checkpoint("manual").await.unwrap();

    let request = PlanRequest::new("import the hero").with_hint(
        SubGoal::new("asset", TaskType::AssetImport, "import the hero")
            .with_input("tool_calls", json!([{ "name": "import_asset", "params": { "path": "res://hero.png" } }])),
    );
    let result = orchestrator.process_plan_request(request).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(orchestrator.get_state().await.assets["res://hero.png"].revision, 1);

    let checkpoint = result.output["checkpointId"].as_str().unwrap().to_string();
    assert!(orchestrator.rollback_to_checkpoint(&checkpoint).await);
    let state = orchestrator.get_state().await;
    assert!(state.assets.is_empty());
    assert_eq!(state.current_plan.unwrap().status, PlanStatus::RolledBack);

    let history = orchestrator.get_checkpoint_history(10).await;
    assert_eq!(history.first().unwrap().id, before);
    assert!(!orchestrator.rollback_to_checkpoint("cp_missing").await);
}

#[tokio::test]
async fn test_cancel_stops_before_next_group() {
    let (orchestrator, log) = recording_orchestrator(Duration::from_millis(80)).await;
    let orchestrator = Arc::new(orchestrator);

    let running = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.process_plan_request(diamond_request()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    orchestrator.cancel();
    let result = running.await.unwrap();

    assert_eq!(result.error.unwrap().code, ErrorCode::Cancelled);
    let log = log.lock().unwrap().clone();
    // 在途任务跑完，后续组不再派发
    assert!(log.contains(&"end task_1_a".to_string()));
    assert!(log.contains(&"end task_2_b".to_string()));
    assert!(!log.iter().any(|e| e.contains("task_3_c")));
    assert_eq!(orchestrator.phase(), OrchestratorPhase::Cancelled);
}

#[tokio::test]
async fn test_pause_holds_dispatch_until_resume() {
    let (orchestrator, log) = recording_orchestrator(Duration::from_millis(5)).await;
    let orchestrator = Arc::new(orchestrator);
    orchestrator.pause().await;

    let running = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.process_plan_request(diamond_request()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(log.lock().unwrap().is_empty());
    let plan = orchestrator.state().current_plan().await.unwrap();
    assert_eq!(plan.status, PlanStatus::Paused);

    orchestrator.resume().await;
    let result = running.await.unwrap();
    assert!(result.success);
    assert_eq!(log.lock().unwrap().len(), 6);
}

#[tokio::test]
async fn test_denied_destructive_operation_fails_plan() {
    let editor = Arc::new(SimulatedEditor::new().with_scene("res://old.tscn", "Node"));
    let (approval, mut requests) = ChannelApproval::channel();
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            let _ = request.respond.send(false);
        }
    });
    let orchestrator = CoordinatorBuilder::new(AppConfig::default())
        .with_tool_executor(editor.clone())
        .with_approval_channel(Arc::new(approval))
        .with_default_agents()
        .with_lock_reaper(false)
        .build()
        .await
        .unwrap();

    let request = PlanRequest::new("remove the old scene").with_hint(
        SubGoal::new("scene", TaskType::SceneLayout, "remove the old scene")
            .with_input("tool_calls", json!([{ "name": "delete_scene", "params": { "path": "res://old.tscn" } }])),
    );
    let result = orchestrator.process_plan_request(request).await;

    assert_eq!(result.error.unwrap().code, ErrorCode::Cancelled);
    assert!(editor.file_exists("res://old.tscn"));
    assert_eq!(editor.call_count("delete_scene"), 0);
}

#[tokio::test]
async fn test_disabled_coordinator_runs_single_analysis() {
    let mut cfg = AppConfig::default();
    cfg.coordinator.enabled = false;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let orchestrator = CoordinatorBuilder::new(cfg)
        .with_event_sender(tx)
        .with_default_agents()
        .with_lock_reaper(false)
        .build()
        .await
        .unwrap();

    let result = orchestrator
        .process_request("Create a main scene with a player character")
        .await;

    assert!(result.success, "{:?}", result.error);
    let plan = orchestrator.state().current_plan().await.unwrap();
    assert_eq!(plan.tasks.len(), 1);
    assert_eq!(plan.tasks[0].task_type, TaskType::Analysis);
    assert_eq!(plan.tasks[0].assigned_agent, "coordinator");
    assert_eq!(
        rx.recv().await,
        Some(CoordinatorEvent::MultiAgentEnabled { enabled: false })
    );
}

#[tokio::test]
async fn test_plan_without_capable_agent_fails_fast() {
    let (orchestrator, log) = recording_orchestrator(Duration::from_millis(1)).await;

    let request = PlanRequest::new("paint")
        .with_hint(SubGoal::new("a", TaskType::SceneLayout, "task a"))
        .with_hint(SubGoal::new("level", TaskType::LevelLayout, "paint tiles"));
    let result = orchestrator.process_plan_request(request).await;

    assert_eq!(result.error.unwrap().code, ErrorCode::PreconditionFailed);
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(orchestrator.phase(), OrchestratorPhase::Failed);
}

#[tokio::test]
async fn test_messages_between_orchestrator_and_agents() {
    let editor = Arc::new(SimulatedEditor::new());
    let orchestrator = default_orchestrator(editor, AppConfig::default()).await;

    orchestrator.send_message("architect", "status?").await;
    let result = orchestrator
        .process_plan_request(
            PlanRequest::new("lay out").with_hint(SubGoal::new("scene", TaskType::SceneLayout, "lay out")),
        )
        .await;
    assert!(result.success, "{:?}", result.error);

    let history = orchestrator.get_message_history("architect", 100).await;
    assert_eq!(history[0].content, "status?");
    assert!(history.iter().any(|m| m.from == "orchestrator" && m.content == "lay out"));
    assert!(history.iter().any(|m| m.from == "architect"));
    assert_eq!(
        orchestrator.agent_status("architect").await.unwrap().status,
        hive::state::AgentStatus::Complete
    );
}

#[tokio::test]
async fn test_same_agent_tasks_in_one_group_keep_their_locks() {
    let editor = Arc::new(SimulatedEditor::new().with_scene("res://shared.tscn", "Node2D"));
    editor.set_delay("save_scene", Duration::from_millis(400));
    let orchestrator = default_orchestrator(editor.clone(), AppConfig::default()).await;

    let request = PlanRequest::new("save and create")
        .with_hint(
            SubGoal::new("save", TaskType::SceneLayout, "save the shared scene").with_input(
                "tool_calls",
                json!([{ "name": "save_scene", "params": { "path": "res://shared.tscn" } }]),
            ),
        )
        .with_hint(
            SubGoal::new("create", TaskType::SceneLayout, "create another scene").with_input(
                "tool_calls",
                json!([{ "name": "create_scene", "params": { "path": "res://b.tscn" } }]),
            ),
        );
    let observe = async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        (
            editor.call_count("save_scene"),
            orchestrator.context().locks.get_lock("res://shared.tscn").await,
        )
    };
    let (result, (saves, lock)) = tokio::join!(orchestrator.process_plan_request(request), observe);

    assert!(result.success, "{:?}", result.error);
    assert_eq!(saves, 1);
    let lock = lock.expect("shared scene must stay locked while it is being saved");
    assert_eq!(lock.agent_id, "architect");
    assert_eq!(editor.call_count("create_scene"), 1);
    assert!(orchestrator.context().locks.locks_held_by("architect").await.is_empty());
}

#[tokio::test]
async fn test_tool_timeout_is_retried_once_then_fails() {
    let editor = Arc::new(SimulatedEditor::new());
    editor.set_delay("create_scene", Duration::from_millis(200));
    let mut cfg = AppConfig::default();
    cfg.tools.tool_timeout_ms = 30;
    let orchestrator = default_orchestrator(editor.clone(), cfg).await;

    let request = PlanRequest::new("slow scene").with_hint(
        SubGoal::new("scene", TaskType::SceneLayout, "create a slow scene").with_input(
            "tool_calls",
            json!([{ "name": "create_scene", "params": { "path": "res://slow.tscn" } }]),
        ),
    );
    let result = orchestrator.process_plan_request(request).await;

    assert!(!result.success);
    assert_eq!(result.error.unwrap().code, ErrorCode::Timeout);
    // 1 次初始尝试 + 1 次重试
    assert_eq!(editor.call_count("create_scene"), 2);
    assert!(!editor.file_exists("res://slow.tscn"));
    assert_eq!(orchestrator.phase(), OrchestratorPhase::Failed);
}
