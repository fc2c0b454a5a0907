use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use opizontas_discovery::services::circuit::CircuitState;
use opizontas_discovery::services::client::{DiscoveryClient, DiscoveryConfig, InvokeOptions};
use opizontas_discovery::services::error::DiscoveryError;
use opizontas_discovery::services::health::{HealthProbe, ProbeError};
use opizontas_discovery::services::registry::{HealthState, ServiceInstance, ServiceRegistration};

fn test_config() -> DiscoveryConfig {
    let mut config = DiscoveryConfig::default();
    config.client.retry_backoff_ms = 0;
    config
}

fn register_healthy(client: &DiscoveryClient, service: &str, address: &str) -> String {
    let id = client
        .register(ServiceRegistration::new(service, address))
        .expect("Failed to register instance");
    client
        .registry()
        .record_success(&id, Instant::now())
        .expect("Instance should exist");
    id
}

fn io_error(message: &str) -> std::io::Error {
    std::io::Error::other(message.to_string())
}

// 按地址决定探测结果
#[derive(Debug, Default)]
struct AddressProbe {
    failing: Mutex<HashSet<String>>,
}

#[tonic::async_trait]
impl HealthProbe for AddressProbe {
    async fn probe(&self, instance: &ServiceInstance) -> Result<(), ProbeError> {
        if self.failing.lock().unwrap().contains(&instance.address) {
            Err(ProbeError::NotServing(instance.address.clone()))
        } else {
            Ok(())
        }
    }
}

// 每次探测耗时 50ms
#[derive(Debug, Default)]
struct SlowProbe {
    calls: AtomicUsize,
}

#[tonic::async_trait]
impl HealthProbe for SlowProbe {
    async fn probe(&self, _instance: &ServiceInstance) -> Result<(), ProbeError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_invalid_config_is_rejected_at_construction() {
    let mut config = test_config();
    config.health.probe_interval_ms = 0;
    assert!(matches!(
        DiscoveryClient::new(config),
        Err(DiscoveryError::Config(_))
    ));

    let mut config = test_config();
    config.registry.ttl_check_interval_ms = 0;
    assert!(matches!(
        DiscoveryClient::with_probe(config, Arc::new(SlowProbe::default())),
        Err(DiscoveryError::Config(_))
    ));

    let mut config = test_config();
    config.health.probe_timeout_ms = 0;
    assert!(DiscoveryClient::new(config).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_started_client_probes_every_interval() {
    let probe = Arc::new(SlowProbe::default());
    let client = DiscoveryClient::with_probe(test_config(), probe.clone()).unwrap();
    let id = client
        .register(ServiceRegistration::new("catalog", "10.0.0.9:80").with_health_endpoint("tcp://10.0.0.9:80"))
        .unwrap();

    client.start();
    // 默认 5s 间隔：t = 0, 5, 10, 15, 20
    tokio::time::sleep(Duration::from_millis(20_500)).await;
    client.stop().await;

    assert_eq!(probe.calls.load(Ordering::SeqCst), 5);
    assert_eq!(client.registry().get(&id).unwrap().state, HealthState::Healthy);
}

#[tokio::test]
async fn test_drained_instance_receives_no_calls() {
    let client = DiscoveryClient::new(test_config()).unwrap();
    let a = register_healthy(&client, "inventory", "10.0.2.1:80");
    let b = register_healthy(&client, "inventory", "10.0.2.2:80");

    assert!(client.drain(&a));
    for _ in 0..6 {
        let address = client
            .invoke(
                "inventory",
                |instance| async move { Ok::<_, std::io::Error>(instance.address) },
                InvokeOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(address, "10.0.2.2:80");
    }

    client.drain(&b);
    let err = client
        .invoke(
            "inventory",
            |instance| async move { Ok::<_, std::io::Error>(instance.address) },
            InvokeOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::NoHealthyInstance { .. }));

    assert!(client.undrain(&a));
    let address = client
        .invoke(
            "inventory",
            |instance| async move { Ok::<_, std::io::Error>(instance.address) },
            InvokeOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(address, "10.0.2.1:80");
}

#[tokio::test]
async fn test_round_robin_distribution() {
    let client = DiscoveryClient::new(test_config()).unwrap();
    let ids: Vec<String> = ["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]
        .iter()
        .map(|address| register_healthy(&client, "catalog", address))
        .collect();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..300 {
        let instance = client.load_balancer().select("catalog").unwrap();
        *counts.entry(instance.id).or_default() += 1;
    }

    for id in &ids {
        assert_eq!(counts.get(id), Some(&100));
    }
}

#[tokio::test(start_paused = true)]
async fn test_failed_probes_remove_instance_from_selection() {
    let probe = Arc::new(AddressProbe::default());
    let client = DiscoveryClient::with_probe(test_config(), probe.clone()).unwrap();
    let probe_interval = client.health_checker().config().probe_interval();

    let mut ids = HashMap::new();
    for address in ["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"] {
        let id = client
            .register(
                ServiceRegistration::new("catalog", address)
                    .with_health_endpoint(format!("tcp://{address}")),
            )
            .unwrap();
        ids.insert(address, id);
    }
    let b = ids["10.0.0.2:80"].clone();

    client.health_checker().run_probe_round().await;
    assert_eq!(client.service_health("catalog").healthy, 3);

    probe.failing.lock().unwrap().insert("10.0.0.2:80".to_string());
    for round in 1..=3 {
        tokio::time::advance(probe_interval).await;
        client.health_checker().run_probe_round().await;
        let state = client.registry().get(&b).unwrap().state;
        if round < 3 {
            assert_eq!(state, HealthState::Healthy);
        } else {
            assert_eq!(state, HealthState::Unhealthy);
        }
    }

    for _ in 0..30 {
        let instance = client.load_balancer().select("catalog").unwrap();
        assert_ne!(instance.id, b);
    }
}

#[tokio::test(start_paused = true)]
async fn test_circuit_opens_and_rejects_without_calling() {
    let client = DiscoveryClient::new(test_config()).unwrap();
    let id = register_healthy(&client, "payments", "10.0.1.1:80");

    // 6 次失败、4 次成功，连续失败不超过 2 次，实例保持健康
    let pattern = [false, true, false, true, false, true, false, false, true, false];
    for succeed in pattern {
        let _ = client
            .invoke(
                "payments",
                move |_instance| async move {
                    if succeed { Ok(()) } else { Err(io_error("declined")) }
                },
                InvokeOptions::new(),
            )
            .await;
    }

    assert_eq!(client.registry().get(&id).unwrap().state, HealthState::Healthy);
    assert_eq!(client.circuit_breaker().state("payments", &id), CircuitState::Open);

    let mut called = false;
    let err = client
        .invoke(
            "payments",
            |_instance| {
                called = true;
                async { Ok::<_, std::io::Error>(()) }
            },
            InvokeOptions::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DiscoveryError::CircuitOpen { .. }));
    assert!(err.is_capacity());
    assert!(!called);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_admits_single_probe() {
    let client = Arc::new(DiscoveryClient::new(test_config()).unwrap());
    let id = register_healthy(&client, "payments", "10.0.1.1:80");

    // 交替失败，凑满 10 次调用、5 次失败
    for i in 0..10 {
        let _ = client
            .invoke(
                "payments",
                move |_instance| async move {
                    if i % 2 == 0 { Err(io_error("declined")) } else { Ok(()) }
                },
                InvokeOptions::new(),
            )
            .await;
    }
    assert_eq!(client.circuit_breaker().state("payments", &id), CircuitState::Open);

    let cooldown = client.circuit_breaker().config().cooldown_base();
    tokio::time::advance(cooldown + Duration::from_millis(1)).await;

    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let probe_client = Arc::clone(&client);
    let probe_call = tokio::spawn(async move {
        let mut signals = Some((started_tx, release_rx));
        probe_client
            .invoke(
                "payments",
                move |_instance| {
                    let signals = signals.take();
                    async move {
                        if let Some((started, release)) = signals {
                            let _ = started.send(());
                            let _ = release.await;
                        }
                        Ok::<_, std::io::Error>("probe")
                    }
                },
                InvokeOptions::new().with_timeout(Duration::from_secs(60)),
            )
            .await
    });

    started_rx.await.unwrap();
    assert_eq!(client.circuit_breaker().state("payments", &id), CircuitState::HalfOpen);

    let mut called = false;
    let err = client
        .invoke(
            "payments",
            |_instance| {
                called = true;
                async { Ok::<_, std::io::Error>("second") }
            },
            InvokeOptions::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::CircuitOpen { .. }));
    assert!(!called);

    release_tx.send(()).unwrap();
    assert_eq!(probe_call.await.unwrap().unwrap(), "probe");
    assert_eq!(client.circuit_breaker().state("payments", &id), CircuitState::Closed);
}

#[tokio::test]
async fn test_idempotent_retry_uses_different_instance() {
    let client = DiscoveryClient::new(test_config()).unwrap();
    register_healthy(&client, "inventory", "10.0.2.1:80");
    register_healthy(&client, "inventory", "10.0.2.2:80");

    let attempts = Mutex::new(Vec::new());
    let result = client
        .invoke(
            "inventory",
            |instance: ServiceInstance| {
                let first = {
                    let mut attempts = attempts.lock().unwrap();
                    attempts.push(instance.id.clone());
                    attempts.len() == 1
                };
                async move {
                    if first {
                        Err(io_error("connection reset"))
                    } else {
                        Ok(instance.address)
                    }
                }
            },
            InvokeOptions::new().idempotent().with_max_retries(1),
        )
        .await;

    let attempts = attempts.into_inner().unwrap();
    assert!(result.is_ok());
    assert_eq!(attempts.len(), 2);
    assert_ne!(attempts[0], attempts[1]);
}

#[tokio::test]
async fn test_non_idempotent_call_is_attempted_once() {
    let client = DiscoveryClient::new(test_config()).unwrap();
    register_healthy(&client, "orders", "10.0.3.1:80");
    register_healthy(&client, "orders", "10.0.3.2:80");

    let mut attempts = 0;
    let err = client
        .invoke(
            "orders",
            |_instance| {
                attempts += 1;
                async { Err::<(), _>(io_error("rejected")) }
            },
            InvokeOptions::new().with_max_retries(3),
        )
        .await
        .unwrap_err();

    assert_eq!(attempts, 1);
    assert!(matches!(err, DiscoveryError::Request { .. }));
}

#[tokio::test]
async fn test_retry_without_alternative_returns_call_error() {
    let client = DiscoveryClient::new(test_config()).unwrap();
    register_healthy(&client, "orders", "10.0.3.1:80");

    let mut attempts = 0;
    let err = client
        .invoke(
            "orders",
            |_instance| {
                attempts += 1;
                async { Err::<(), _>(io_error("rejected")) }
            },
            InvokeOptions::new().idempotent().with_max_retries(2),
        )
        .await
        .unwrap_err();

    assert_eq!(attempts, 1);
    assert!(err.is_call_failure());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_recorded_as_failure() {
    let client = DiscoveryClient::new(test_config()).unwrap();
    let id = register_healthy(&client, "reports", "10.0.4.1:80");

    let err = client
        .invoke(
            "reports",
            |_instance| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, std::io::Error>(())
            },
            InvokeOptions::new().with_timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DiscoveryError::Timeout(timeout) if timeout == Duration::from_millis(200)));
    let snapshot = client.circuit_snapshot("reports", &id).unwrap();
    assert_eq!(snapshot.window_failures, 1);
    assert_eq!(client.registry().get(&id).unwrap().consecutive_failures, 1);
    assert_eq!(client.load_balancer().outstanding(&id), 0);
}

#[tokio::test]
async fn test_deregistered_instance_is_never_selected() {
    let client = DiscoveryClient::new(test_config()).unwrap();
    let a = register_healthy(&client, "search", "10.0.5.1:80");
    let b = register_healthy(&client, "search", "10.0.5.2:80");

    assert!(client.deregister(&a).is_some());
    assert!(client.list("search").iter().all(|instance| instance.id != a));

    for _ in 0..20 {
        let address = client
            .invoke(
                "search",
                |instance: ServiceInstance| async move { Ok::<_, std::io::Error>(instance.id) },
                InvokeOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(address, b);
    }

    // 注销是幂等的
    assert!(client.deregister(&a).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_background_sweep_removes_expired_instances() {
    let mut config = test_config();
    config.registry.ttl_ms = 1_000;
    config.registry.ttl_check_interval_ms = 500;
    let client = DiscoveryClient::new(config).unwrap();
    let stale = register_healthy(&client, "search", "10.0.5.1:80");
    let live = register_healthy(&client, "search", "10.0.5.2:80");

    client.start();
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(400)).await;
        client.heartbeat(&live).unwrap();
    }

    assert!(client.registry().get(&stale).is_none());
    assert!(client.registry().get(&live).is_some());
    assert!(matches!(
        client.heartbeat(&stale),
        Err(DiscoveryError::NotFound(_))
    ));

    client.stop().await;
    assert!(!client.is_running());
}

#[tokio::test]
async fn test_clients_are_independent() {
    let first = DiscoveryClient::new(test_config()).unwrap();
    let second = DiscoveryClient::new(test_config()).unwrap();

    register_healthy(&first, "search", "10.0.6.1:80");

    assert_eq!(first.list("search").len(), 1);
    assert!(second.list("search").is_empty());
    let err = second
        .invoke(
            "search",
            |_instance| async { Ok::<_, std::io::Error>(()) },
            InvokeOptions::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::NotFound(_)));
}
