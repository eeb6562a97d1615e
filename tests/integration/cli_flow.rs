//! Integration tests for the CLI route table against a temporary workspace

use cadence::cli::{map_error, Commands, RunContext};
use cadence::error::EngineError;
use serde_json::json;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write_plan(dir: &Path, name: &str, plan: serde_json::Value) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_string_pretty(&plan).unwrap()).unwrap();
    path
}

fn two_step_plan() -> serde_json::Value {
    json!({
        "uuid": "cli-plan",
        "start_node_id": "build",
        "nodes": {
            "build": {
                "uuid": "build",
                "identifier": "build",
                "step_type": { "type": "ECHO" },
                "step_parameters": { "outputs": { "image": "app:2" } },
                "facilitator_obtainments": [{ "type": "SYNC" }],
                "adviser_obtainments": [
                    { "type": "NEXT_STEP", "parameters": { "next_node_id": "deploy" } }
                ]
            },
            "deploy": {
                "uuid": "deploy",
                "identifier": "deploy",
                "step_type": { "type": "NOOP" },
                "facilitator_obtainments": [{ "type": "SYNC" }]
            }
        }
    })
}

fn context(workspace: &TempDir) -> RunContext {
    RunContext::new(workspace.path().to_path_buf(), None).unwrap()
}

#[tokio::test]
async fn test_config_defaults_render_as_toml() {
    let workspace = TempDir::new().unwrap();
    let out = context(&workspace)
        .execute(&Commands::Config { defaults: true })
        .await
        .unwrap();

    let parsed: toml::Value = toml::from_str(&out).unwrap();
    assert!(parsed.get("engine").is_some());
    assert!(parsed.get("storage").is_some());
}

#[tokio::test]
async fn test_workspace_config_is_picked_up() {
    let workspace = TempDir::new().unwrap();
    std::fs::create_dir_all(workspace.path().join("config")).unwrap();
    std::fs::write(
        workspace.path().join("config").join("config.toml"),
        "[restraints.env-prod]\ncapacity = 3\n",
    )
    .unwrap();

    let ctx = context(&workspace);
    assert_eq!(ctx.config().restraints["env-prod"].capacity, 3);
}

#[tokio::test]
async fn test_validate_accepts_a_good_plan() {
    let workspace = TempDir::new().unwrap();
    let plan = write_plan(workspace.path(), "plan.json", two_step_plan());

    let out = context(&workspace)
        .execute(&Commands::Validate { plan })
        .await
        .unwrap();
    assert!(out.contains("cli-plan is valid"));
    assert!(out.contains("2 nodes"));
}

#[tokio::test]
async fn test_validate_rejects_unknown_step() {
    let workspace = TempDir::new().unwrap();
    let mut raw = two_step_plan();
    raw["nodes"]["deploy"]["step_type"]["type"] = json!("DEPLOY_K8S");
    let plan = write_plan(workspace.path(), "plan.json", raw);

    let err = context(&workspace)
        .execute(&Commands::Validate { plan })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StepNotRegistered(_)));
    assert!(map_error(&err).contains("DEPLOY_K8S"));
}

#[tokio::test]
async fn test_missing_plan_file_is_a_config_error() {
    let workspace = TempDir::new().unwrap();
    let err = context(&workspace)
        .execute(&Commands::Validate {
            plan: workspace.path().join("nope.json"),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ConfigError(_)));
}

#[tokio::test]
async fn test_run_drives_the_plan_to_completion() {
    let workspace = TempDir::new().unwrap();
    let plan = write_plan(workspace.path(), "plan.json", two_step_plan());

    let out = context(&workspace)
        .execute(&Commands::Run {
            plan,
            setup: vec![("project".to_string(), "web".to_string())],
            timeout_secs: 10,
        })
        .await
        .unwrap();

    assert!(out.contains("SUCCEEDED"));
    assert!(out.contains("build"));
    assert!(out.contains("deploy"));
    assert!(!out.contains("Still busy"));
    assert!(workspace.path().join(".cadence").join("store").exists());
}

#[tokio::test]
async fn test_bad_interrupt_type_is_rejected() {
    let workspace = TempDir::new().unwrap();
    let err = context(&workspace)
        .execute(&Commands::Interrupt {
            plan_execution_id: "pe-1".to_string(),
            interrupt_type: "explode".to_string(),
            node: None,
            reason: None,
            metadata: None,
            timeout_secs: 1,
        })
        .await
        .unwrap_err();
    assert!(map_error(&err).starts_with("Interrupt rejected"));
}

#[tokio::test]
async fn test_bad_notify_payload_is_rejected() {
    let workspace = TempDir::new().unwrap();
    let err = context(&workspace)
        .execute(&Commands::Notify {
            correlation_id: "c-1".to_string(),
            error: false,
            payload: Some("{not json".to_string()),
            timeout_secs: 1,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Invalid payload JSON"));
}
