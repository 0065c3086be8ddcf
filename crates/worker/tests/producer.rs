mod common;

use common::{caption, Harness};
use medialib_core::clock::Clock;
use medialib_events::AuditEvent;
use medialib_worker::producer;
use serde_json::json;

#[tokio::test]
async fn only_new_rows_are_audited() {
    let h = Harness::new().await;

    let first = producer::enqueue(&h.pool, h.audit.as_ref(), &caption(7), h.clock.now())
        .await
        .unwrap();
    let twin = producer::enqueue(&h.pool, h.audit.as_ref(), &caption(7), h.clock.now())
        .await
        .unwrap();

    assert!(twin.deduped);
    assert_eq!(twin.id, first.id);
    assert_eq!(h.audit.events_for(first.id), vec![AuditEvent::Enqueue]);

    let record = &h.audit.records()[0];
    assert_eq!(record.entity.as_deref(), Some("media:7"));
    assert_eq!(record.detail, Some(json!({"dedup_key": "media:7"})));
    assert_eq!(record.payload_preview, Some(json!({"media_id": 7})));
}
