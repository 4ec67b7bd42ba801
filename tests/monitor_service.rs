use field_monitor::schedule::{Day, TimeWindow};
use field_monitor::store::{ConfigStore, JsonFileStore};
use field_monitor::{Config, FieldIndex, InstanceConfig, InstanceId, MonitorService};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ID: InstanceId = InstanceId(7);

fn always_active_config() -> InstanceConfig {
    let mut config = InstanceConfig::new("12345", FieldIndex::new(1).unwrap());
    config.upper_limit = Some(30.0);
    for day in Day::ALL {
        config.active_windows.insert(day, TimeWindow::new(0, 0, 24, 0));
    }
    config
}

async fn wait_for_view(surface: &Path, id: InstanceId, state: &str) -> Value {
    let file = surface.join(format!("view-{}.json", id));
    for _ in 0..100 {
        if let Ok(bytes) = tokio::fs::read(&file).await {
            if let Ok(view) = serde_json::from_slice::<Value>(&bytes) {
                if view["state"] == state {
                    return view;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("view {} never reached state {}", id, state);
}

async fn latest_value_requests(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == "/channels/12345/fields/1/last.json")
        .count()
}

#[tokio::test]
async fn test_service_rearms_stored_instances_and_alerts() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/channels/12345/fields/1/last.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "created_at": "2026-10-19T10:00:00Z",
            "entry_id": 12,
            "field1": "35"
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_partial_json(json!({ "message": "High: 35 > 30" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = JsonFileStore::open(dir.path().join("store")).await.unwrap();
    store.save(ID, &always_active_config()).await.unwrap();

    let config = Config {
        store_dir: dir.path().join("store"),
        surface_dir: Some(dir.path().join("surface")),
        thingspeak_url: server.uri(),
        alert_webhook_url: Some(format!("{}/hook", server.uri())),
        ..Config::default()
    };

    let service = Arc::new(MonitorService::new(config).await.unwrap());
    let (stop, stopped) = oneshot::channel::<()>();
    let running = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .run_until(async {
                    let _ = stopped.await;
                })
                .await
        })
    };

    let view = wait_for_view(&dir.path().join("surface"), ID, "data").await;
    assert_eq!(view["title"], "Channel 12345 (F1)");
    assert_eq!(view["display_value"], "35");
    assert_eq!(view["alarm_active"], true);

    stop.send(()).unwrap();
    running.await.unwrap().unwrap();

    assert!(service.controller().pending_token(ID).await.is_none());
    assert!(service.run_until(async {}).await.is_err());
}

#[tokio::test]
async fn test_service_renders_error_when_channel_missing() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let store = JsonFileStore::open(dir.path().join("store")).await.unwrap();
    store.save(ID, &always_active_config()).await.unwrap();

    let config = Config {
        store_dir: dir.path().join("store"),
        surface_dir: Some(dir.path().join("surface")),
        thingspeak_url: server.uri(),
        ..Config::default()
    };

    let service = Arc::new(MonitorService::new(config).await.unwrap());
    let (stop, stopped) = oneshot::channel::<()>();
    let running = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .run_until(async {
                    let _ = stopped.await;
                })
                .await
        })
    };

    let view = wait_for_view(&dir.path().join("surface"), ID, "error").await;
    assert_eq!(view["message"], "Error: 404");

    stop.send(()).unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_service_rejects_invalid_config() {
    let config = Config {
        thingspeak_url: String::new(),
        ..Config::default()
    };
    assert!(MonitorService::new(config).await.is_err());
}

#[tokio::test]
async fn test_service_follows_store_changes_and_refresh_requests() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/channels/12345/fields/1/last.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "created_at": "2026-10-19T10:00:00Z",
            "entry_id": 3,
            "field1": "21"
        })))
        .mount(&server)
        .await;

    let config = Config {
        store_dir: dir.path().join("store"),
        surface_dir: Some(dir.path().join("surface")),
        thingspeak_url: server.uri(),
        store_poll_interval: Duration::from_millis(50),
        ..Config::default()
    };

    let service = Arc::new(MonitorService::new(config).await.unwrap());
    let (stop, stopped) = oneshot::channel::<()>();
    let running = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .run_until(async {
                    let _ = stopped.await;
                })
                .await
        })
    };

    // Saved while the daemon runs, as the CLI does.
    let store = JsonFileStore::open(dir.path().join("store")).await.unwrap();
    store.save(ID, &always_active_config()).await.unwrap();

    let view = wait_for_view(&dir.path().join("surface"), ID, "data").await;
    assert_eq!(view["display_value"], "21");
    let fetched = latest_value_requests(&server).await;

    store.request_refresh(ID).await.unwrap();
    let mut refreshed = false;
    for _ in 0..100 {
        if latest_value_requests(&server).await > fetched {
            refreshed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(refreshed, "requested refresh never ran");

    store.delete(ID).await.unwrap();
    let mut retired = false;
    for _ in 0..100 {
        if service.controller().status(ID).await.is_none() {
            retired = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(retired, "deleted instance is still tracked");
    assert!(service.controller().pending_token(ID).await.is_none());

    stop.send(()).unwrap();
    running.await.unwrap().unwrap();
}
