/*!
Export cache integration tests: get-or-render through the engine and LRU
eviction at capacity.
*/

mod common;

use async_trait::async_trait;
use common::sample_document;
use drafthold_core::{
    DiagramStore, Document, EngineConfig, ExportFormat, ExportRequest, MemoryStore,
    RenderSource, Result,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct CountingRenderer {
    calls: AtomicUsize,
}

impl CountingRenderer {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenderSource for CountingRenderer {
    async fn render(&self, document: &Document, request: &ExportRequest) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!(
            "{}:{}x{}:{}",
            document.id,
            request.width,
            request.height,
            document.components.len()
        )
        .into_bytes())
    }
}

fn engine_with_capacity(capacity: usize) -> DiagramStore {
    let mut config = EngineConfig::memory();
    config.cache_capacity = capacity;
    DiagramStore::with_config(Arc::new(MemoryStore::new()), config).unwrap()
}

#[tokio::test]
async fn test_export_renders_once_per_fingerprint() {
    let engine = DiagramStore::new(MemoryStore::new());
    let renderer = CountingRenderer::default();
    let document = sample_document("d1");
    let png = ExportRequest::new(800, 600, ExportFormat::Png);

    let first = engine.export_image(&document, png, &renderer).await.unwrap();
    let second = engine.export_image(&document, png, &renderer).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(renderer.calls(), 1);

    // different dimensions and changed content both miss
    let thumb = ExportRequest::new(200, 150, ExportFormat::Png);
    engine.export_image(&document, thumb, &renderer).await.unwrap();
    let edited = document.clone().with_component(drafthold_core::Component::new(
        "cache",
        "service",
        5.0,
        5.0,
    ));
    engine.export_image(&edited, png, &renderer).await.unwrap();
    assert_eq!(renderer.calls(), 3);
}

#[tokio::test]
async fn test_capacity_plus_one_evicts_least_recently_used() {
    let engine = engine_with_capacity(3);
    let renderer = CountingRenderer::default();
    let document = sample_document("d1");
    let request = |w| ExportRequest::new(w, w, ExportFormat::Jpeg);

    for width in [100, 200, 300] {
        engine
            .export_image(&document, request(width), &renderer)
            .await
            .unwrap();
    }
    // touch the oldest so 200 becomes least recently used
    engine
        .export_image(&document, request(100), &renderer)
        .await
        .unwrap();
    engine
        .export_image(&document, request(400), &renderer)
        .await
        .unwrap();
    assert_eq!(engine.cache().len(), 3);
    assert_eq!(renderer.calls(), 4);

    engine
        .export_image(&document, request(100), &renderer)
        .await
        .unwrap();
    assert_eq!(renderer.calls(), 4);
    engine
        .export_image(&document, request(200), &renderer)
        .await
        .unwrap();
    assert_eq!(renderer.calls(), 5);
}

#[tokio::test]
async fn test_json_export_round_trips() {
    let engine = DiagramStore::new(MemoryStore::new());
    let document = sample_document("d1");

    let exported = engine.export_json(&document).unwrap();
    assert!(std::str::from_utf8(&exported).unwrap().contains('\n'));
    let parsed: Document = serde_json::from_slice(&exported).unwrap();
    assert_eq!(parsed, document);
}
