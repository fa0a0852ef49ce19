use futures::StreamExt;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, SqliteConnection};
use std::ops::Deref;
use std::path::Path;
use supabazarr_source::error::ErrorKind;
use supabazarr_source::{Extracted, Kind, Layout, Record, SourceAdapter, SourceOptions, default_adapters};

async fn database(path: &Path, statements: &[&str]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
    let mut conn = SqliteConnection::connect_with(&options).await.unwrap();
    for statement in statements {
        sqlx::query(statement).execute(&mut conn).await.unwrap();
    }
    conn.close().await.unwrap();
}

/// Every item of one extraction, errors flattened to their kind's message.
async fn drain(adapter: &dyn SourceAdapter) -> Vec<Result<Extracted, String>> {
    adapter.extract().map(|item| item.map_err(|e| e.deref().to_string())).collect().await
}

#[tokio::test]
async fn test_partially_installed_stack() {
    let dir = tempfile::tempdir().unwrap();
    let layout = Layout::under(dir.path());
    database(&layout.radarr_db(), &[
        "CREATE TABLE Movies (Id INTEGER PRIMARY KEY, Title TEXT, Year INTEGER, TmdbId INTEGER, Monitored INTEGER)",
        "INSERT INTO Movies VALUES (1, 'Alien', 1979, 348, 1)",
        "INSERT INTO Movies VALUES (2, 'Heat', 1995, 949, 0)",
    ])
    .await;
    std::fs::write(layout.radarr.join("config.xml"), "<Config><Port>7878</Port><UrlBase></UrlBase></Config>").unwrap();

    let adapters = default_adapters(&layout, SourceOptions::default());
    let adapter = |kind: Kind| adapters.iter().find(|a| a.kind() == kind).unwrap().as_ref();

    let movies = drain(adapter(Kind::Movies)).await;
    assert_eq!(movies.len(), 2);
    assert!(movies.iter().all(|m| matches!(m, Ok(Extracted::Record(record)) if record.kind() == Kind::Movies)));

    // Sonarr is not installed: the first and only item says so.
    let series = drain(adapter(Kind::Series)).await;
    assert_eq!(series.len(), 1);
    assert!(series[0].as_ref().is_err_and(|e| e.starts_with("source unavailable")));

    let configs = drain(adapter(Kind::ServiceConfigs)).await;
    let [Ok(Extracted::Record(Record::ServiceConfig(radarr)))] = configs.as_slice() else {
        panic!("unexpected configs: {configs:?}");
    };
    assert_eq!((radarr.service_name.as_str(), radarr.config_type.as_str()), ("radarr", "config"));
}

#[tokio::test]
async fn test_extraction_is_restartable_and_stable() {
    let dir = tempfile::tempdir().unwrap();
    let layout = Layout::under(dir.path());
    std::fs::create_dir_all(&layout.sonarr).unwrap();
    std::fs::write(layout.sonarr.join("config.xml"), "<Config><Port>8989</Port><Branch>main</Branch></Config>").unwrap();

    let adapters = default_adapters(&layout, SourceOptions::default());
    let configs = adapters.iter().find(|a| a.kind() == Kind::ServiceConfigs).unwrap();
    let first = drain(configs.as_ref()).await;
    let second = drain(configs.as_ref()).await;
    assert_eq!(first, second);
    assert_eq!(first.len(), 1);
}

#[tokio::test]
async fn test_nothing_installed() {
    let dir = tempfile::tempdir().unwrap();
    let adapters = default_adapters(&Layout::under(dir.path()), SourceOptions::default());
    for adapter in &adapters {
        let mut stream = adapter.extract();
        let first = stream.next().await.unwrap();
        let err = first.unwrap_err();
        assert!(matches!(err.deref(), ErrorKind::Unavailable(_)), "{}: {}", adapter.kind(), err.deref());
        assert!(stream.next().await.is_none(), "{} kept going", adapter.kind());
    }
}
