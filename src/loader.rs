//! Builds routing tables from the route file

use crate::config::{parse_routes, RouteConfig};
use crate::error::LoadError;
use crate::route::Route;
use crate::table::RoutingTable;
use std::path::Path;
use std::time::SystemTime;
use tracing::{debug, error};

/// Result of a load attempt
#[derive(Debug)]
pub enum LoadOutcome {
    /// The file has not been modified since the installed table was built
    Unchanged,
    /// A freshly built table
    Loaded(RoutingTable),
}

/// Load `path` unless it is no newer than `installed`.
///
/// `installed` is the version of the table currently in effect, or `None` if
/// there is none yet. Change detection only looks at the modification time, so
/// touching the file forces a reparse.
pub fn load(path: &Path, installed: Option<SystemTime>) -> Result<LoadOutcome, LoadError> {
    let modified = source_version(path)?;

    if let Some(installed) = installed {
        if modified <= installed {
            debug!(path = %path.display(), "Route file unchanged");
            return Ok(LoadOutcome::Unchanged);
        }
    }

    build_table(path, modified).map(LoadOutcome::Loaded)
}

/// Unconditionally build a table from `path`
pub fn load_table(path: &Path) -> Result<RoutingTable, LoadError> {
    let modified = source_version(path)?;
    build_table(path, modified)
}

fn source_version(path: &Path) -> Result<SystemTime, LoadError> {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|source| LoadError::SourceUnavailable {
            path: path.to_path_buf(),
            source,
        })
}

fn build_table(path: &Path, version: SystemTime) -> Result<RoutingTable, LoadError> {
    let content = std::fs::read_to_string(path).map_err(|source| LoadError::SourceUnavailable {
        path: path.to_path_buf(),
        source,
    })?;

    let records = parse_routes(path, &content).map_err(|reason| {
        LoadError::MalformedConfiguration {
            path: path.to_path_buf(),
            reason,
        }
    })?;

    let routes = records.iter().map(build_route).collect();
    Ok(RoutingTable::new(routes, version))
}

fn build_route(record: &RouteConfig) -> Route {
    let route = Route::from_config(record);

    if !route.is_routable() {
        error!(
            host = %record.host,
            forward = ?record.forward,
            serve = ?record.serve,
            "Bad route configuration, requests for this host will get 404"
        );
    }

    route
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Backend;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn route_file(content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_builds_routes_in_order() {
        let file = route_file(
            r#"[
                {"host": "a.com", "forward": "10.0.0.1:8080"},
                {"host": "b.com", "serve": "/srv/b"},
                {"host": "c.com"}
            ]"#,
        );

        let table = match load(file.path(), None).unwrap() {
            LoadOutcome::Loaded(table) => table,
            LoadOutcome::Unchanged => panic!("expected a table"),
        };

        let hosts: Vec<&str> = table.routes().iter().map(|r| r.host()).collect();
        assert_eq!(hosts, vec!["a.com", "b.com", "c.com"]);
        assert_eq!(table.routes()[1].backend(), &Backend::StaticDir(PathBuf::from("/srv/b")));
        assert_eq!(table.routes()[2].backend(), &Backend::Invalid);
        assert_eq!(table.routable_count(), 2);

        let modified = std::fs::metadata(file.path()).unwrap().modified().unwrap();
        assert_eq!(table.version(), modified);
    }

    #[test]
    fn test_unchanged_file_is_not_reparsed() {
        let file = route_file(r#"[{"host": "a.com", "forward": "10.0.0.1:8080"}]"#);
        let version = load_table(file.path()).unwrap().version();

        // Corrupt the file but restore the old mtime; a reparse would fail
        std::fs::write(file.path(), "not json").unwrap();
        let f = std::fs::File::options().write(true).open(file.path()).unwrap();
        f.set_modified(version).unwrap();

        assert!(matches!(
            load(file.path(), Some(version)).unwrap(),
            LoadOutcome::Unchanged
        ));
    }

    #[test]
    fn test_newer_file_is_loaded() {
        let file = route_file(r#"[{"host": "a.com", "forward": "10.0.0.1:8080"}]"#);
        let version = load_table(file.path()).unwrap().version();
        let older = version - Duration::from_secs(60);

        assert!(matches!(
            load(file.path(), Some(older)).unwrap(),
            LoadOutcome::Loaded(_)
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");

        let err = load(&path, None).unwrap_err();
        assert!(matches!(err, LoadError::SourceUnavailable { .. }));

        let err = load(&path, Some(SystemTime::now())).unwrap_err();
        assert!(matches!(err, LoadError::SourceUnavailable { .. }));
    }

    #[test]
    fn test_malformed_file() {
        let file = route_file(r#"[{"host": "a.com", "#);

        let err = load(file.path(), None).unwrap_err();
        match err {
            LoadError::MalformedConfiguration { path, .. } => assert_eq!(path, file.path()),
            other => panic!("unexpected error: {}", other),
        }
    }
}
