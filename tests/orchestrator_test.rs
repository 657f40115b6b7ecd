//! Project up/down against the in-memory engine

mod common;

use berth::compose::labels;
use berth::compose::ProjectManager;
use berth::error::BerthError;
use common::{orchestrator, FakeEngine};
use std::sync::Arc;

const SHOP: &str = r#"
services:
  web:
    image: nginx:1.25
    ports:
      - "8080:80"
    volumes:
      - data:/usr/share/nginx/html
  worker:
    image: busybox:1.36
    command: ["sleep", "infinity"]
    deploy:
      replicas: 2
volumes:
  data: {}
"#;

fn shop_with(from: &str, to: &str) -> String {
    SHOP.replace(from, to)
}

#[tokio::test]
async fn test_up_creates_project() {
    let engine = Arc::new(FakeEngine::new());
    let orch = orchestrator(engine.clone(), &[("shop", SHOP)]);

    let report = orch.project_up("shop").await.unwrap();
    assert_eq!(
        report.created,
        vec!["shop-web-1", "shop-worker-1", "shop-worker-2"]
    );
    assert!(report.replaced.is_empty());
    assert_eq!(report.networks_created, vec!["shop_default"]);
    assert_eq!(report.volumes_created, vec!["shop_data"]);

    let web = engine.container("shop-web-1").unwrap();
    assert!(web.running);
    let web_labels = web.params.labels.as_ref().unwrap();
    assert_eq!(web_labels[labels::PROJECT], "shop");
    assert_eq!(web_labels[labels::SERVICE], "web");
    assert_eq!(web_labels[labels::CONTAINER_NUMBER], "1");
    assert_eq!(web_labels[labels::IMAGE], "sha256:nginx:1.25");
    assert!(web_labels.contains_key(labels::CONFIG_HASH));

    let aliases = web.params.networking_config.as_ref().unwrap().endpoints_config["shop_default"]
        .aliases
        .clone()
        .unwrap();
    assert!(aliases.contains(&"web".to_string()));
    assert!(aliases.contains(&"shop-web-1".to_string()));

    let network = engine.state.lock().unwrap().networks["shop_default"].clone();
    assert_eq!(network.labels[labels::PROJECT], "shop");
    assert_eq!(network.labels[labels::NETWORK], "default");
}

#[tokio::test]
async fn test_second_up_is_idempotent() {
    let engine = Arc::new(FakeEngine::new());
    let orch = orchestrator(engine.clone(), &[("shop", SHOP)]);
    orch.project_up("shop").await.unwrap();
    engine.clear_calls();

    let report = orch.project_up("shop").await.unwrap();
    assert!(report.created.is_empty());
    assert!(report.replaced.is_empty());
    assert!(report.removed.is_empty());
    assert_eq!(report.unchanged.len(), 3);
    assert!(report.networks_created.is_empty());
    assert!(report.volumes_created.is_empty());

    assert_eq!(engine.count("create_container"), 0);
    assert_eq!(engine.count("delete_container"), 0);
    assert_eq!(engine.count("create_network"), 0);
    assert_eq!(engine.count("create_image"), 0);
}

#[tokio::test]
async fn test_changed_service_is_replaced() {
    let engine = Arc::new(FakeEngine::new());
    orchestrator(engine.clone(), &[("shop", SHOP)])
        .project_up("shop")
        .await
        .unwrap();
    let old_id = engine.container("shop-web-1").unwrap().id;
    engine.clear_calls();

    let changed = shop_with("nginx:1.25", "nginx:1.26");
    let report = orchestrator(engine.clone(), &[("shop", &changed)])
        .project_up("shop")
        .await
        .unwrap();

    assert_eq!(report.replaced, vec!["shop-web-1"]);
    assert_eq!(report.unchanged, vec!["shop-worker-1", "shop-worker-2"]);
    assert_eq!(engine.count("stop_container"), 1);
    assert_eq!(engine.count("delete_container"), 1);

    let web = engine.container("shop-web-1").unwrap();
    assert_ne!(web.id, old_id);
    assert_eq!(web.params.image.as_deref(), Some("nginx:1.26"));
    assert!(web.running);
}

#[tokio::test]
async fn test_scale_down_removes_surplus_replicas() {
    let engine = Arc::new(FakeEngine::new());
    orchestrator(engine.clone(), &[("shop", SHOP)])
        .project_up("shop")
        .await
        .unwrap();

    let smaller = shop_with("replicas: 2", "replicas: 1");
    let report = orchestrator(engine.clone(), &[("shop", &smaller)])
        .project_up("shop")
        .await
        .unwrap();

    assert_eq!(report.removed, vec!["shop-worker-2"]);
    assert!(engine.container("shop-worker-2").is_none());
    assert!(engine.container("shop-worker-1").is_some());
}

#[tokio::test]
async fn test_down_removes_containers_by_label_and_keeps_volumes() {
    let engine = Arc::new(FakeEngine::new());
    let orch = orchestrator(engine.clone(), &[("shop", SHOP)]);
    orch.project_up("shop").await.unwrap();

    // a container of a service that has since left the definition
    let mut orphan = engine.container("shop-worker-1").unwrap();
    orphan.id = "orphan".to_string();
    orphan.name = "legacy-cron".to_string();
    orphan
        .params
        .labels
        .as_mut()
        .unwrap()
        .insert(labels::SERVICE.to_string(), "cron".to_string());
    engine
        .state
        .lock()
        .unwrap()
        .containers
        .insert(orphan.name.clone(), orphan);

    // unrelated container survives
    let mut other = engine.container("shop-web-1").unwrap();
    other.id = "other".to_string();
    other.name = "blog-web-1".to_string();
    other
        .params
        .labels
        .as_mut()
        .unwrap()
        .insert(labels::PROJECT.to_string(), "blog".to_string());
    engine
        .state
        .lock()
        .unwrap()
        .containers
        .insert(other.name.clone(), other);

    let mut report = orch.project_down("shop").await.unwrap();
    report.removed.sort();
    assert_eq!(
        report.removed,
        vec!["legacy-cron", "shop-web-1", "shop-worker-1", "shop-worker-2"]
    );
    assert_eq!(report.networks_removed, vec!["shop_default"]);

    assert_eq!(engine.container_names(), vec!["blog-web-1"]);
    assert!(engine.network_names().is_empty());
    assert_eq!(engine.volume_names(), vec!["shop_data"]);
}

#[tokio::test]
async fn test_down_then_up_recreates() {
    let engine = Arc::new(FakeEngine::new());
    let orch = orchestrator(engine.clone(), &[("shop", SHOP)]);
    orch.project_up("shop").await.unwrap();
    orch.project_down("shop").await.unwrap();

    let report = orch.project_up("shop").await.unwrap();
    assert_eq!(report.created.len(), 3);
    assert_eq!(report.networks_created, vec!["shop_default"]);
    // the volume was kept
    assert!(report.volumes_created.is_empty());
}

#[tokio::test]
async fn test_missing_external_network() {
    let def = r#"
services:
  app:
    image: alpine:3.19
    networks: [corp]
networks:
  corp:
    external: true
    name: corp-net
"#;
    let engine = Arc::new(FakeEngine::new());
    let orch = orchestrator(engine.clone(), &[("app", def)]);

    let err = orch.project_up("app").await.unwrap_err();
    match err {
        BerthError::ExternalResourceMissing { kind, name } => {
            assert_eq!(kind, "network");
            assert_eq!(name, "corp-net");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(engine.count("create_network"), 0);
    assert!(engine.container_names().is_empty());

    engine.add_network("corp-net");
    let report = orch.project_up("app").await.unwrap();
    assert_eq!(report.created, vec!["app-app-1"]);
    assert!(report.networks_created.is_empty());

    // external networks outlive the project
    orch.project_down("app").await.unwrap();
    assert_eq!(engine.network_names(), vec!["corp-net"]);
}

#[tokio::test]
async fn test_missing_external_volume() {
    let def = r#"
services:
  db:
    image: postgres:16
    volumes:
      - pgdata:/var/lib/postgresql/data
volumes:
  pgdata:
    external: true
    name: shared-pgdata
"#;
    let engine = Arc::new(FakeEngine::new());
    let orch = orchestrator(engine.clone(), &[("db", def)]);

    let err = orch.project_up("db").await.unwrap_err();
    assert!(matches!(
        err,
        BerthError::ExternalResourceMissing { kind: "volume", ref name } if name == "shared-pgdata"
    ));

    engine.add_volume("shared-pgdata");
    orch.project_up("db").await.unwrap();
    assert_eq!(engine.count("create_volume"), 0);
}

#[tokio::test]
async fn test_failed_pull_creates_nothing() {
    let engine = Arc::new(FakeEngine::new());
    engine.hide_remote("nginx:1.25");
    let orch = orchestrator(engine.clone(), &[("shop", SHOP)]);

    let err = orch.project_up("shop").await.unwrap_err();
    assert!(matches!(err, BerthError::PullAborted { ref image, .. } if image == "nginx:1.25"));
    assert!(engine.container_names().is_empty());
    assert!(engine.network_names().is_empty());
}

#[tokio::test]
async fn test_unknown_and_invalid_projects() {
    let engine = Arc::new(FakeEngine::new());
    let orch = orchestrator(engine.clone(), &[("broken", "services: {}\n")]);

    assert!(matches!(
        orch.project_up("missing").await,
        Err(BerthError::NotFound(_))
    ));
    assert!(matches!(
        orch.project_up("broken").await,
        Err(BerthError::InvalidDefinition { .. })
    ));
    assert!(engine.state.lock().unwrap().calls.is_empty());
}

#[tokio::test]
async fn test_project_status() {
    let engine = Arc::new(FakeEngine::new());
    let orch = orchestrator(engine.clone(), &[("shop", SHOP)]);
    orch.project_up("shop").await.unwrap();

    let statuses = orch.project_status("shop").await.unwrap();
    let names: Vec<&str> = statuses.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["shop-web-1", "shop-worker-1", "shop-worker-2"]);

    let worker = &statuses[2];
    assert_eq!(worker.service.as_deref(), Some("worker"));
    assert_eq!(worker.replica, Some(2));
    assert_eq!(worker.state, "running");
    assert!(worker.aliases["shop_default"].contains(&"shop-worker-2".to_string()));
    assert!(worker.config_hash.is_some());
}

#[tokio::test]
async fn test_manager_runs_requests_one_at_a_time() {
    let engine = Arc::new(FakeEngine::new());
    let blog = SHOP.replace("nginx:1.25", "httpd:2.4");
    let orch = orchestrator(engine.clone(), &[("shop", SHOP), ("blog", &blog)]);
    let (manager, handle) = ProjectManager::new(orch);
    tokio::spawn(manager.run());

    let (shop, blog) = tokio::join!(handle.project_up("shop"), handle.project_up("blog"));
    assert_eq!(shop.unwrap().created.len(), 3);
    assert_eq!(blog.unwrap().created.len(), 3);

    let calls = engine.state.lock().unwrap().calls.clone();
    let positions = |project: &str| -> Vec<usize> {
        let prefix = format!("create_container {}-", project);
        calls
            .iter()
            .enumerate()
            .filter(|(_, c)| c.starts_with(&prefix))
            .map(|(i, _)| i)
            .collect()
    };
    let (shop_calls, blog_calls) = (positions("shop"), positions("blog"));
    let shop_range = (shop_calls[0], shop_calls[shop_calls.len() - 1]);
    let blog_range = (blog_calls[0], blog_calls[blog_calls.len() - 1]);
    assert!(shop_range.1 < blog_range.0 || blog_range.1 < shop_range.0);

    let report = handle.project_down("shop").await.unwrap();
    assert_eq!(report.removed.len(), 3);
    assert_eq!(engine.container_names().len(), 3);
}
