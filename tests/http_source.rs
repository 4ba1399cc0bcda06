mod support;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use support::{data, Origin, DATA_LEN, DATA_MIME};
use video_proxy_server::source::{
    http_client, EmptyHeaderInjector, HeaderInjector, HttpSource, MemorySourceInfoStorage,
    NoSourceInfoStorage, RemoteSource, SourceInfoStorage, StaticHeaderInjector,
};
use video_proxy_server::ProxyCacheError;

async fn read_to_end(source: &mut dyn RemoteSource) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = source.read(&mut buf).await.unwrap();
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}

#[tokio::test]
async fn test_read_whole_resource() {
    let origin = Origin::start().await;
    let mut source = HttpSource::new(origin.url("/data/a.jpg")).unwrap();

    source.open(0).await.unwrap();
    assert_eq!(source.length().await.unwrap(), Some(DATA_LEN as u64));
    assert_eq!(source.mime().await.unwrap().as_deref(), Some(DATA_MIME));
    assert_eq!(read_to_end(&mut source).await, data());
    assert_eq!(origin.heads(), 0);
    assert_eq!(origin.get_ranges(), vec![None]);
}

#[tokio::test]
async fn test_open_at_offset() {
    let origin = Origin::start().await;
    let mut source = HttpSource::new(origin.url("/data/a.jpg")).unwrap();

    source.open(15_000).await.unwrap();
    assert_eq!(source.length().await.unwrap(), Some(DATA_LEN as u64));
    assert_eq!(read_to_end(&mut source).await, &data()[15_000..]);
    assert_eq!(origin.get_ranges(), vec![Some("bytes=15000-".to_owned())]);
}

#[tokio::test]
async fn test_length_lookup_uses_head() {
    let origin = Origin::start().await;
    let mut source = HttpSource::new(origin.url("/data/a.jpg")).unwrap();

    assert_eq!(source.length().await.unwrap(), Some(DATA_LEN as u64));
    assert_eq!(source.mime().await.unwrap().as_deref(), Some(DATA_MIME));
    assert_eq!(origin.heads(), 1);
    assert_eq!(origin.gets(), 0);
}

#[tokio::test]
async fn test_rejected_head_leaves_length_to_get() {
    let origin = Origin::start().await;
    let mut source = HttpSource::new(origin.url("/nohead/a.jpg")).unwrap();

    assert_eq!(source.length().await.unwrap(), None);
    assert_eq!(source.mime().await.unwrap().as_deref(), Some(DATA_MIME));
    // The failed HEAD is not repeated.
    assert_eq!(origin.heads(), 1);

    source.open(0).await.unwrap();
    assert_eq!(source.length().await.unwrap(), Some(DATA_LEN as u64));
    assert_eq!(read_to_end(&mut source).await, data());
    assert_eq!(origin.heads(), 1);
    assert_eq!(origin.gets(), 1);
}

#[tokio::test]
async fn test_redirects_are_transparent() {
    let origin = Origin::start().await;
    for hops in [1, 3] {
        let mut source =
            HttpSource::new(origin.url(&format!("/redirect/{hops}/r.jpg"))).unwrap();
        source.open(0).await.unwrap();
        assert_eq!(read_to_end(&mut source).await, data());
        assert!(source.info().url.ends_with("/data/r.jpg"));
        assert_eq!(source.length().await.unwrap(), Some(DATA_LEN as u64));
    }
}

#[tokio::test]
async fn test_too_many_redirects() {
    let origin = Origin::start().await;
    let mut source = HttpSource::new(origin.url("/redirect/6/r.jpg")).unwrap();
    let err = source.open(0).await.unwrap_err();
    assert!(matches!(err, ProxyCacheError::TooManyRedirects { max: 5, .. }));

    let mut source = HttpSource::new(origin.url("/redirect/1/r.jpg"))
        .unwrap()
        .with_max_redirects(0);
    let err = source.open(0).await.unwrap_err();
    assert!(matches!(err, ProxyCacheError::TooManyRedirects { max: 0, .. }));
}

#[tokio::test]
async fn test_ignored_range_fails() {
    let origin = Origin::start().await;
    let mut source = HttpSource::new(origin.url("/norange/a.jpg")).unwrap();
    let err = source.open(100).await.unwrap_err();
    assert!(matches!(err, ProxyCacheError::RangeNotSupported { offset: 100, .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_missing_resource_fails() {
    let origin = Origin::start().await;
    let mut source = HttpSource::new(origin.url("/missing")).unwrap();
    let err = source.open(0).await.unwrap_err();
    assert!(matches!(err, ProxyCacheError::BadStatus { .. }));
}

#[tokio::test]
async fn test_injected_headers_are_sent() {
    let origin = Origin::start().await;
    let injector = StaticHeaderInjector::default()
        .with_header("X-Token", "secret")
        .with_header("Range", "bytes=5-");
    let mut source = HttpSource::with_collaborators(
        origin.url("/data/a.jpg"),
        http_client().unwrap(),
        Arc::new(NoSourceInfoStorage),
        Arc::new(injector),
    );

    source.open(0).await.unwrap();
    let headers = origin.last_headers().unwrap();
    assert_eq!(headers["x-token"], "secret");
    // The source owns the Range header.
    assert!(headers.get("range").is_none());
    assert_eq!(read_to_end(&mut source).await.len(), DATA_LEN);
}

struct CountingInjector(AtomicUsize);

impl HeaderInjector for CountingInjector {
    fn add_headers(&self, _url: &str) -> Option<HashMap<String, String>> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Some(HashMap::new())
    }
}

#[tokio::test]
async fn test_injector_consulted_per_request() {
    let origin = Origin::start().await;
    let injector = Arc::new(CountingInjector(AtomicUsize::new(0)));
    let mut source = HttpSource::with_collaborators(
        origin.url("/redirect/2/a.jpg"),
        http_client().unwrap(),
        Arc::new(NoSourceInfoStorage),
        injector.clone(),
    );

    source.open(0).await.unwrap();
    // Every hop of the redirect chain is a request of its own.
    assert_eq!(injector.0.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_storage_remembers_info() {
    let origin = Origin::start().await;
    let storage: Arc<dyn SourceInfoStorage> = Arc::new(MemorySourceInfoStorage::new());
    let url = origin.url("/redirect/1/a.jpg");

    let mut first = HttpSource::with_collaborators(
        url.clone(),
        http_client().unwrap(),
        storage.clone(),
        Arc::new(EmptyHeaderInjector),
    );
    assert_eq!(first.length().await.unwrap(), Some(DATA_LEN as u64));
    assert_eq!(origin.heads(), 2);

    let stored = storage.get(&url).unwrap();
    assert_eq!(stored.length, Some(DATA_LEN as u64));
    assert!(stored.url.ends_with("/data/a.jpg"));

    let mut second = HttpSource::with_collaborators(
        url,
        http_client().unwrap(),
        storage,
        Arc::new(EmptyHeaderInjector),
    );
    assert_eq!(second.length().await.unwrap(), Some(DATA_LEN as u64));
    assert_eq!(second.mime().await.unwrap().as_deref(), Some(DATA_MIME));
    assert_eq!(origin.heads(), 2);

    // Opening starts from the resolved url, skipping the redirect.
    second.open(0).await.unwrap();
    assert_eq!(read_to_end(&mut second).await, data());
    assert_eq!(origin.gets(), 1);
}
