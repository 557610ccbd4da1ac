//! Integration tests for the file configuration provider

use gateway::{FileConfigProvider, ProxyConfigProvider};
use std::path::PathBuf;
use tokio_test::task;
use tokio_test::{assert_err, assert_ok, assert_pending, assert_ready};

const INITIAL: &str = r#"
routes:
  - route_id: api
    cluster_id: backend
    match:
      path: /api
clusters:
  - cluster_id: backend
    destinations:
      d1:
        address: http://10.0.0.1:8080/
"#;

const UPDATED: &str = r#"
routes:
  - route_id: api
    cluster_id: backend
    match:
      path: /api
  - route_id: web
    cluster_id: backend
    order: -1
    match:
      hosts: [www.example.com]
clusters:
  - cluster_id: backend
    destinations:
      d1:
        address: http://10.0.0.1:8080/
      d2:
        address: http://10.0.0.2:8080/
"#;

/// Removes the file when dropped
struct TempFile(PathBuf);

impl TempFile {
    fn new(name: &str, contents: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "gateway-provider-{}-{}.yaml",
            std::process::id(),
            name
        ));
        std::fs::write(&path, contents).unwrap();
        Self(path)
    }

    fn write(&self, contents: &str) {
        std::fs::write(&self.0, contents).unwrap();
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

#[test]
fn test_missing_file_fails() {
    let path = std::env::temp_dir().join("gateway-provider-does-not-exist.yaml");
    assert_err!(FileConfigProvider::new(path));
}

#[test]
fn test_initial_snapshot() {
    let file = TempFile::new("initial", INITIAL);
    let provider = assert_ok!(FileConfigProvider::new(&file.0));

    assert!(provider.name().starts_with("file:"));
    assert_eq!(provider.path(), file.0.as_path());

    let snapshot = assert_ok!(provider.get_config());
    assert_eq!(snapshot.routes.len(), 1);
    assert_eq!(snapshot.clusters[0].cluster_id, "backend");
    assert_eq!(snapshot.clusters[0].destinations.len(), 1);
}

#[test]
fn test_reload_fires_change_token() {
    let file = TempFile::new("reload", INITIAL);
    let provider = assert_ok!(FileConfigProvider::new(&file.0));
    let first = assert_ok!(provider.get_config());

    let mut changed = task::spawn(first.change_token.clone().cancelled_owned());
    assert_pending!(changed.poll());

    file.write(UPDATED);
    assert_ok!(provider.reload());

    assert!(changed.is_woken());
    assert_ready!(changed.poll());

    let second = assert_ok!(provider.get_config());
    assert!(!second.change_token.is_cancelled());
    assert_eq!(second.routes.len(), 2);
    assert_eq!(second.routes[1].order, Some(-1));
    assert_eq!(second.clusters[0].destinations.len(), 2);
}

#[test]
fn test_broken_file_keeps_previous_snapshot() {
    let file = TempFile::new("broken", INITIAL);
    let provider = assert_ok!(FileConfigProvider::new(&file.0));
    let first = assert_ok!(provider.get_config());

    file.write("routes: [");
    assert_err!(provider.reload());

    let current = assert_ok!(provider.get_config());
    assert!(std::sync::Arc::ptr_eq(&first, &current));
    assert!(!first.change_token.is_cancelled());
}
