use super::*;
use crate::allocator::{AllocationRequest, ResourceAllocator};
use crate::config::{AllocatorConfig, LifecycleConfig, PoolSpec};
use crate::error::FleetError;
use crate::models::{Dimension, QosClass, ResourceVector};
use crate::optimizer::{ActionParams, ActionType, PlanAction};
use crate::test_support::ScriptedRuntime;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Harness {
    manager: Arc<AgentManager>,
    runtime: Arc<ScriptedRuntime>,
    allocator: Arc<ResourceAllocator>,
}

impl Harness {
    fn free_cpu(&self, pool: &str) -> u64 {
        self.allocator.pool(pool).unwrap().free.cpu
    }

    fn occupy(&self, cpu: u64) -> String {
        self.allocator
            .allocate(&AllocationRequest::new("external", ResourceVector::new(cpu, 0)))
            .unwrap()
            .id
    }

    async fn running(&self, agent_type: &str) -> String {
        let id = self.manager.create_agent(agent_type, None).unwrap().id;
        self.manager.start_agent(&id).await.unwrap();
        id
    }
}

fn test_config() -> LifecycleConfig {
    LifecycleConfig {
        health_check: HealthCheckPolicy {
            interval_ms: 50,
            timeout_ms: 20,
            failure_threshold: 2,
            success_threshold: 1,
        },
        scale_max_retries: 0,
        scale_backoff_ms: 1,
        ready_timeout_ms: 200,
        ..Default::default()
    }
}

fn harness_with(pools: &[&str]) -> Harness {
    let allocator = Arc::new(
        ResourceAllocator::new(&AllocatorConfig {
            pools: pools
                .iter()
                .map(|id| PoolSpec {
                    id: id.to_string(),
                    capacity: ResourceVector::new(800, 16_384),
                    labels: vec![],
                })
                .collect(),
            ..Default::default()
        })
        .unwrap(),
    );
    let runtime = Arc::new(ScriptedRuntime::healthy());
    let manager = AgentManager::new(test_config(), allocator.clone(), runtime.clone());
    manager
        .register_spec(AgentSpec::new("worker", ResourceVector::new(100, 1_024)))
        .unwrap();
    Harness {
        manager: Arc::new(manager),
        runtime,
        allocator,
    }
}

fn harness() -> Harness {
    harness_with(&["local"])
}

#[test]
fn test_create_agent_allocates_and_stays_pending() {
    let h = harness();
    let agent = h.manager.create_agent("worker", None).unwrap();

    assert_eq!(agent.status, AgentStatus::Pending);
    assert!(agent.id.starts_with("worker-"));
    assert_eq!(agent.pool.as_deref(), Some("local"));
    assert!(agent.allocation_id.is_some());
    assert_eq!(agent.qos_class, QosClass::Guaranteed);
    assert_eq!(agent.replicas.current, 1);
    assert_eq!(agent.replicas.healthy, 0);
    assert_eq!(h.free_cpu("local"), 700);
    assert!(h.runtime.launched().is_empty());
}

#[test]
fn test_unknown_type_lists_known_types() {
    let h = harness();
    match h.manager.create_agent("ghost", None) {
        Err(FleetError::UnknownAgentType { agent_type, known }) => {
            assert_eq!(agent_type, "ghost");
            assert_eq!(known, vec!["worker".to_string()]);
        }
        other => panic!("expected UnknownAgentType, got {:?}", other),
    }
}

#[test]
fn test_create_returns_allocator_shortage_unchanged() {
    let h = harness();
    let overrides = AgentOverrides {
        requirements: Some(ResourceVector::new(900, 1_024)),
        ..Default::default()
    };
    let err = h.manager.create_agent("worker", Some(&overrides)).unwrap_err();

    let shortage = err.shortage().expect("shortage");
    assert_eq!(shortage.get(Dimension::Cpu), Some(100));
    assert_eq!(shortage.get(Dimension::Memory), None);
    assert!(h.manager.list_agents().is_empty());
    assert_eq!(h.free_cpu("local"), 800);
}

#[tokio::test]
async fn test_start_stop_restart() {
    let h = harness();
    let id = h.manager.create_agent("worker", None).unwrap().id;

    let started = h.manager.start_agent(&id).await.unwrap();
    assert_eq!(started.status, AgentStatus::Ready);
    assert_eq!(h.runtime.launched(), vec![id.clone()]);

    let stopped = h.manager.stop_agent(&id).await.unwrap();
    assert_eq!(stopped.status, AgentStatus::Stopped);
    assert!(stopped.allocation_id.is_none());
    assert_eq!(h.free_cpu("local"), 800);
    assert_eq!(h.runtime.terminated(), vec![id.clone()]);

    // Stopping twice is a no-op
    h.manager.stop_agent(&id).await.unwrap();
    assert_eq!(h.runtime.terminated().len(), 1);

    let restarted = h.manager.start_agent(&id).await.unwrap();
    assert_eq!(restarted.status, AgentStatus::Ready);
    assert!(restarted.allocation_id.is_some());
    assert_eq!(h.free_cpu("local"), 700);
}

#[tokio::test]
async fn test_launch_failure_marks_unhealthy() {
    let h = harness();
    h.runtime.fail_launches(true);
    let id = h.manager.create_agent("worker", None).unwrap().id;

    let err = h.manager.start_agent(&id).await.unwrap_err();
    assert!(matches!(err, FleetError::AgentUnhealthy { .. }));
    assert_eq!(h.manager.get_agent(&id).unwrap().status, AgentStatus::Unhealthy);
}

#[tokio::test]
async fn test_agent_that_never_gets_ready() {
    let h = harness();
    h.runtime.set_default(ProbeResult::unhealthy("still booting"));
    let id = h.manager.create_agent("worker", None).unwrap().id;

    match h.manager.start_agent(&id).await {
        Err(FleetError::AgentUnhealthy { reason, .. }) => {
            assert!(reason.contains("still booting"), "{}", reason);
        }
        other => panic!("expected AgentUnhealthy, got {:?}", other),
    }
    assert_eq!(h.manager.get_agent(&id).unwrap().status, AgentStatus::Unhealthy);
}

#[tokio::test]
async fn test_health_transitions() {
    let h = harness();
    let id = h.running("worker").await;

    assert_eq!(h.manager.run_health_check(&id).await.unwrap(), AgentStatus::Active);

    h.runtime.script(
        &id,
        vec![ProbeResult::unhealthy("slow"), ProbeResult::unhealthy("slower")],
    );
    assert_eq!(h.manager.run_health_check(&id).await.unwrap(), AgentStatus::Degraded);
    assert_eq!(h.manager.run_health_check(&id).await.unwrap(), AgentStatus::Unhealthy);
    // Scripted probes exhausted, back to healthy
    assert_eq!(h.manager.run_health_check(&id).await.unwrap(), AgentStatus::Active);
}

#[tokio::test]
async fn test_probe_utilization_is_recorded() {
    let h = harness();
    let id = h.running("worker").await;
    h.runtime.script(
        &id,
        vec![ProbeResult {
            healthy: true,
            cpu_percent: Some(42.0),
            memory_percent: Some(17.0),
            message: None,
        }],
    );
    h.manager.run_health_check(&id).await.unwrap();

    let latest = h.manager.get_agent(&id).unwrap().utilization.unwrap();
    assert_eq!(latest.cpu_percent, 42.0);
    assert_eq!(latest.memory_percent, 17.0);
    assert_eq!(h.manager.utilization_history(&id, None).unwrap().len(), 1);
}

#[tokio::test]
async fn test_sweep_replaces_unhealthy_agent() {
    let h = harness();
    let old = h.running("worker").await;
    h.manager
        .configure_health_check(
            &old,
            HealthCheckPolicy {
                interval_ms: 50,
                timeout_ms: 20,
                failure_threshold: 1,
                success_threshold: 1,
            },
        )
        .unwrap();
    h.runtime.script(&old, vec![ProbeResult::unhealthy("wedged")]);
    tokio::time::sleep(Duration::from_millis(60)).await;

    let sweep = h.manager.check_health().await;
    assert_eq!(sweep.checked, 1);
    assert_eq!(sweep.replaced.len(), 1);
    let (from, to) = &sweep.replaced[0];
    assert_eq!(from, &old);
    assert_ne!(to, &old);

    let agents = h.manager.list_agents();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].id, *to);
    assert_eq!(agents[0].group_id, old);
    assert_eq!(agents[0].status, AgentStatus::Ready);
    assert!(h.runtime.terminated().contains(&old));
    assert_eq!(h.free_cpu("local"), 700);
}

#[tokio::test]
async fn test_replacement_reuses_capacity_of_full_pool() {
    let h = harness();
    let old = h.running("worker").await;
    h.occupy(700);
    assert_eq!(h.free_cpu("local"), 0);

    let new = h.manager.replace_unhealthy(&old).await.unwrap();
    assert_ne!(new.id, old);
    assert_eq!(new.status, AgentStatus::Ready);
    assert!(matches!(
        h.manager.get_agent(&old),
        Err(FleetError::AgentNotFound(_))
    ));
}

#[tokio::test]
async fn test_scale_up_and_shortage_leaves_count_unchanged() {
    let h = harness();
    let id = h.running("worker").await;
    h.manager.scale_agent(&id, ScaleRequest::to(2)).await.unwrap();

    let result = h.manager.scale_agent(&id, ScaleRequest::to(3)).await.unwrap();
    assert!(result.success);
    assert_eq!((result.from_replicas, result.to_replicas), (2, 3));
    assert_eq!(result.added.len(), 1);
    assert_eq!(h.manager.group_members(&id).len(), 3);
    assert_eq!(h.manager.get_agent(&id).unwrap().replicas.desired, 3);

    h.manager.scale_agent(&id, ScaleRequest::down(1)).await.unwrap();
    // The group keeps the original id even if that replica was removed
    let group = id;
    let members = h.manager.group_members(&group);
    assert_eq!(members.len(), 2);
    let member = members[0].clone();

    h.occupy(600);
    let result = h.manager.scale_agent(&member, ScaleRequest::to(3)).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.from_replicas, 2);
    assert_eq!(result.to_replicas, 2);
    assert_eq!(result.requested_replicas, 3);
    let shortage = result.shortage.expect("shortage");
    assert_eq!(shortage.get(Dimension::Cpu), Some(100));
    assert_eq!(h.manager.group_members(&group).len(), 2);
    assert_eq!(h.manager.get_agent(&member).unwrap().replicas.desired, 2);
}

#[tokio::test]
async fn test_partial_scale_up_is_rolled_back() {
    let h = harness();
    let id = h.running("worker").await;
    h.occupy(550);
    assert_eq!(h.free_cpu("local"), 150);

    let result = h.manager.scale_agent(&id, ScaleRequest::up(2)).await.unwrap();
    assert!(!result.success);
    assert!(result.added.is_empty());
    assert_eq!(result.shortage.unwrap().get(Dimension::Cpu), Some(50));
    assert_eq!(h.manager.group_members(&id), vec![id.clone()]);
    assert_eq!(h.free_cpu("local"), 150);
}

#[tokio::test]
async fn test_scale_to_zero_is_rejected() {
    let h = harness();
    let id = h.running("worker").await;
    let err = h.manager.scale_agent(&id, ScaleRequest::to(0)).await.unwrap_err();
    assert!(matches!(err, FleetError::InvalidRequest { .. }));
    assert_eq!(h.manager.group_members(&id).len(), 1);
}

#[tokio::test]
async fn test_scale_down_removes_least_healthy_replica() {
    let h = harness();
    let id = h.running("worker").await;
    let result = h.manager.scale_agent(&id, ScaleRequest::to(3)).await.unwrap();
    let sick = result.added[0].clone();

    h.runtime.script(&sick, vec![ProbeResult::unhealthy("lagging")]);
    assert_eq!(
        h.manager.run_health_check(&sick).await.unwrap(),
        AgentStatus::Degraded
    );

    let result = h.manager.scale_agent(&id, ScaleRequest::down(1)).await.unwrap();
    assert_eq!(result.removed, vec![sick]);
    assert_eq!(result.to_replicas, 2);
}

#[tokio::test]
async fn test_scale_down_skips_busy_replicas_and_reports_partial_result() {
    let h = harness();
    let id = h.running("worker").await;
    h.manager.scale_agent(&id, ScaleRequest::to(3)).await.unwrap();
    let members = h.manager.group_members(&id);
    assert_eq!(members.len(), 3);

    // A busy replica is passed over in favour of an idle one
    let busy = h.manager.claim(&members[0], &members[0]).unwrap();
    let result = h.manager.scale_agent(&id, ScaleRequest::down(1)).await.unwrap();
    assert!(result.success);
    assert_eq!(result.removed.len(), 1);
    assert_ne!(result.removed[0], members[0]);
    assert!(h.manager.get_agent(&members[0]).is_ok());

    // Every remaining replica busy: nothing removed, failure reported
    let remaining = h.manager.group_members(&id);
    let _slots: Vec<_> = remaining
        .iter()
        .filter(|m| **m != members[0])
        .map(|m| h.manager.claim(m, m).unwrap())
        .collect();
    let result = h.manager.scale_agent(&id, ScaleRequest::to(1)).await.unwrap();
    assert!(!result.success);
    assert_eq!((result.from_replicas, result.to_replicas), (2, 2));
    assert!(result.reason.unwrap().contains("operation in progress"));
    assert_eq!(h.manager.group_members(&id).len(), 2);
    drop(busy);
}

#[tokio::test]
async fn test_concurrent_operation_is_refused() {
    let h = harness();
    let id = h.running("worker").await;

    let _group = h.manager.claim(&format!("group:{}", id), &id).unwrap();
    let err = h.manager.scale_agent(&id, ScaleRequest::up(1)).await.unwrap_err();
    assert!(matches!(err, FleetError::OperationInProgress(ref a) if a == &id));

    let _agent = h.manager.claim(&id, &id).unwrap();
    let err = h.manager.stop_agent(&id).await.unwrap_err();
    assert!(matches!(err, FleetError::OperationInProgress(_)));
}

#[tokio::test]
async fn test_deploy_is_all_or_nothing() {
    let h = harness();
    let specs = vec![
        AgentSpec::new("planner", ResourceVector::new(400, 1_024)),
        AgentSpec::new("coder", ResourceVector::new(300, 1_024)),
        AgentSpec::new("reviewer", ResourceVector::new(200, 1_024)),
    ];
    let err = h.manager.deploy_agents(specs).await.unwrap_err();
    assert_eq!(err.shortage().unwrap().get(Dimension::Cpu), Some(100));
    assert!(h.manager.list_agents().is_empty());
    assert_eq!(h.free_cpu("local"), 800);

    let deployed = h
        .manager
        .deploy_and_start(vec![
            AgentSpec::new("planner", ResourceVector::new(400, 1_024)),
            AgentSpec::new("coder", ResourceVector::new(300, 1_024)),
        ])
        .await
        .unwrap();
    assert_eq!(deployed.len(), 2);
    assert!(deployed.iter().all(|a| a.status == AgentStatus::Ready));
    assert_eq!(h.free_cpu("local"), 100);
}

#[tokio::test]
async fn test_preempt_in_qos_order() {
    let h = harness();
    h.manager
        .register_spec(
            AgentSpec::new("batch", ResourceVector::new(300, 1_024)).with_qos(QosClass::BestEffort),
        )
        .unwrap();
    h.manager
        .register_spec(
            AgentSpec::new("burst", ResourceVector::new(300, 1_024))
                .with_limits(ResourceVector::new(600, 2_048)),
        )
        .unwrap();
    let guaranteed = h.manager.create_agent("worker", None).unwrap().id;
    let burst = h.manager.create_agent("burst", None).unwrap().id;
    let batch = h.manager.create_agent("batch", None).unwrap().id;
    assert_eq!(h.manager.qos_of(&burst).unwrap(), QosClass::Burstable);
    assert_eq!(h.free_cpu("local"), 100);

    let result = h.manager.preempt(&ResourceVector::new(350, 0)).await;
    assert!(result.satisfied);
    assert_eq!(result.stopped, vec![batch]);
    assert_eq!(result.freed.cpu, 300);

    let result = h.manager.preempt(&ResourceVector::new(700, 0)).await;
    assert!(result.satisfied);
    assert_eq!(result.stopped, vec![burst]);
    assert_eq!(
        h.manager.get_agent(&guaranteed).unwrap().status,
        AgentStatus::Pending
    );

    // Already fits: nothing stopped
    let result = h.manager.preempt(&ResourceVector::new(100, 0)).await;
    assert!(result.satisfied);
    assert!(result.stopped.is_empty());
}

#[tokio::test]
async fn test_preempt_reports_throttled_size() {
    let h = harness();
    h.manager
        .register_spec(
            AgentSpec::new("burst", ResourceVector::new(400, 1_024))
                .with_limits(ResourceVector::new(800, 2_048)),
        )
        .unwrap();
    let burst = h.manager.create_agent("burst", None).unwrap().id;
    h.allocator.throttle(0.25).unwrap();
    assert_eq!(h.free_cpu("local"), 500);

    let result = h.manager.preempt(&ResourceVector::new(600, 0)).await;
    assert!(result.satisfied);
    assert_eq!(result.stopped, vec![burst]);
    assert_eq!(result.freed.cpu, 300);
    assert_eq!(h.free_cpu("local"), 800);
}

#[tokio::test]
async fn test_recommendations_from_recorded_utilization() {
    let h = harness();
    let id = h.running("worker").await;
    for _ in 0..12 {
        h.manager
            .record_utilization(
                &id,
                UtilizationSample {
                    timestamp: Utc::now(),
                    cpu_percent: 85.0,
                    memory_percent: 80.0,
                },
            )
            .unwrap();
    }

    let recs = h.manager.get_agent_recommendations(&id).unwrap();
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].kind, RecommendationType::ResourceAdjustment);
    assert_eq!(recs[0].dimension, Some(Dimension::Cpu));
    assert_eq!(recs[0].confidence, 0.8);
    assert_eq!(recs[0].suggested.unwrap().cpu, 122);
}

#[tokio::test]
async fn test_reconcile_repairs_allocations() {
    let h = harness();
    let id = h.running("worker").await;
    let ghost = h
        .allocator
        .allocate(&AllocationRequest::new("agent:ghost", ResourceVector::new(100, 0)))
        .unwrap()
        .id;
    let external = h.occupy(100);

    // Allocation vanished behind the manager's back
    let lost = h.manager.get_agent(&id).unwrap().allocation_id.unwrap();
    h.allocator.release(&lost);

    let summary = h.manager.reconcile().await;
    assert_eq!(summary.orphans_released, 1);
    assert!(h.allocator.get(&ghost).is_none());
    assert!(h.allocator.get(&external).is_some());

    let agent = h.manager.get_agent(&id).unwrap();
    let reacquired = agent.allocation_id.unwrap();
    assert_ne!(reacquired, lost);
    assert!(h.allocator.get(&reacquired).is_some());
    assert_eq!(agent.status, AgentStatus::Ready);
    assert_eq!(h.free_cpu("local"), 600);
}

#[tokio::test]
async fn test_execute_scale_and_consolidate_actions() {
    let h = harness();
    let id = h.running("worker").await;

    let scale = PlanAction::new(ActionType::Scale, id.clone(), "add capacity").with_params(
        ActionParams {
            direction: Some(ScaleDirection::Up),
            replicas: Some(1),
            pool: None,
        },
    );
    let outcome = h.manager.execute_action(&scale).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.scale.unwrap().to_replicas, 2);

    let consolidate = PlanAction::new(ActionType::Consolidate, id.clone(), "idle");
    let outcome = h.manager.execute_action(&consolidate).await.unwrap();
    assert!(outcome.success);
    assert_eq!(h.manager.group_members(&id).len(), 1);

    let survivor = h.manager.group_members(&id)[0].clone();
    let outcome = h
        .manager
        .execute_action(&PlanAction::new(ActionType::Consolidate, survivor.clone(), "idle"))
        .await
        .unwrap();
    assert!(outcome.scale.is_none());
    assert_eq!(h.manager.get_agent(&survivor).unwrap().status, AgentStatus::Stopped);
    assert_eq!(h.free_cpu("local"), 800);
}

#[tokio::test]
async fn test_execute_migrate_action() {
    let h = harness_with(&["east", "west"]);
    let id = h.running("worker").await;
    assert_eq!(h.manager.get_agent(&id).unwrap().pool.as_deref(), Some("east"));

    let missing_pool = PlanAction::new(ActionType::Migrate, id.clone(), "move");
    assert!(h.manager.execute_action(&missing_pool).await.is_err());

    let migrate = PlanAction::new(ActionType::Migrate, id.clone(), "move").with_params(
        ActionParams {
            pool: Some("west".to_string()),
            ..Default::default()
        },
    );
    let outcome = h.manager.execute_action(&migrate).await.unwrap();
    assert!(outcome.success);

    let agents = h.manager.list_agents();
    assert_eq!(agents.len(), 1);
    assert_ne!(agents[0].id, id);
    assert_eq!(agents[0].pool.as_deref(), Some("west"));
    assert_eq!(h.free_cpu("east"), 800);
    assert_eq!(h.free_cpu("west"), 700);
}

#[tokio::test]
async fn test_channels_between_agents() {
    let h = harness();
    let a = h.running("worker").await;
    let b = h.running("worker").await;
    h.manager.create_channel("ops").unwrap();
    let mut inbox_a = h.manager.on_message("ops", &a).unwrap();
    let mut inbox_b = h.manager.on_message("ops", &b).unwrap();

    let report = h
        .manager
        .broadcast("ops", Some(&a), json!({"task": "rebuild"}))
        .unwrap();
    assert_eq!(report.delivered, 1);
    let message = inbox_b.try_recv().unwrap();
    assert_eq!(message.from.as_deref(), Some(a.as_str()));
    assert_eq!(message.payload["task"], "rebuild");
    assert!(inbox_a.try_recv().is_err());

    let report = h.manager.send_message("ops", &b, &a, json!("done")).unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(inbox_a.try_recv().unwrap().payload, json!("done"));

    assert!(matches!(
        h.manager.on_message("ops", "nobody"),
        Err(FleetError::AgentNotFound(_))
    ));

    h.manager.destroy_agent(&b).await.unwrap();
    assert_eq!(h.manager.channels().subscribers("ops"), vec![a]);
}

#[tokio::test]
async fn test_destroy_releases_everything() {
    let h = harness();
    let id = h.running("worker").await;
    h.manager.destroy_agent(&id).await.unwrap();

    assert!(matches!(
        h.manager.get_agent(&id),
        Err(FleetError::AgentNotFound(_))
    ));
    assert!(h.manager.group_members(&id).is_empty());
    assert!(h.runtime.terminated().contains(&id));
    assert_eq!(h.free_cpu("local"), 800);
    assert!(h.manager.status_counts().values().all(|n| *n == 0));
}

#[tokio::test]
async fn test_health_monitor_stops_on_shutdown() {
    let h = harness();
    let (tx, rx) = broadcast::channel(1);
    let handle = h.manager.spawn_health_monitor(rx);
    tokio::time::sleep(Duration::from_millis(20)).await;
    tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("monitor did not stop")
        .unwrap();
}
