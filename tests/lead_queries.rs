//! Integration tests for counts, unique values and lead pages

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use leadline::services::PageSpec;
use leadline::{FilterCriteria, FilterField, FilterStore, LeadError};

fn district(name: &str) -> FilterCriteria {
    let mut criteria = FilterCriteria::default();
    criteria
        .equality_fields
        .insert(FilterField::District, BTreeSet::from([name.to_string()]));
    criteria
}

#[tokio::test]
async fn test_offset_pages_and_infinite_scroll_cover_the_same_rows() {
    let store = Arc::new(InstrumentedStore::new(database()));
    seed(&store, (0..237).map(|i| lead(i, "Springfield", None)).collect()).await;
    let services = services_for(&store, Some(admin()), &test_config());
    let criteria = FilterCriteria::default();

    let mut offset_ids = Vec::new();
    for (page, expected_len, expected_more) in [(0, 100, true), (1, 100, true), (2, 37, false)] {
        let result = services
            .query
            .query_leads(&criteria, PageSpec::Offset { page, page_size: 100 })
            .await
            .unwrap();
        assert_eq!(result.rows.len(), expected_len);
        assert_eq!(result.total, Some(237));
        assert_eq!(result.has_more, expected_more);
        offset_ids.extend(result.rows.into_iter().map(|l| l.id));
    }

    let mut infinite = services.query.infinite(criteria.clone(), 100);
    infinite.fetch_all().await.unwrap();
    assert_eq!(infinite.rows().len(), 237);
    assert!(!infinite.has_next_page());

    let infinite_ids: Vec<String> = infinite.rows().iter().map(|l| l.id.clone()).collect();
    assert_eq!(offset_ids, infinite_ids);
    // Newest first
    assert_eq!(infinite_ids.first().map(String::as_str), Some("lead-0000"));
    assert_eq!(infinite_ids.last().map(String::as_str), Some("lead-0236"));
}

#[tokio::test]
async fn test_filtered_modes_agree() {
    let store = Arc::new(InstrumentedStore::new(database()));
    let rows = (0..90)
        .map(|i| lead(i, if i % 3 == 0 { "Ogdenville" } else { "Springfield" }, None))
        .collect();
    seed(&store, rows).await;
    let services = services_for(&store, Some(admin()), &test_config());
    let criteria = district("Ogdenville");

    let page = services
        .query
        .query_leads(&criteria, PageSpec::Offset { page: 0, page_size: 1000 })
        .await
        .unwrap();
    assert_eq!(page.total, Some(30));

    let mut infinite = services.query.infinite(criteria, 7);
    infinite.fetch_all().await.unwrap();
    assert_eq!(infinite.pages_fetched(), 5);
    let a: Vec<_> = page.rows.iter().map(|l| &l.id).collect();
    let b: Vec<_> = infinite.rows().iter().map(|l| &l.id).collect();
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_non_admin_reads_are_scoped_to_assignments() {
    let store = Arc::new(InstrumentedStore::new(database()));
    let mut rows: Vec<_> = (0..8).map(|i| lead(i, "Springfield", Some("rep-1"))).collect();
    rows.extend((8..20).map(|i| lead(i, "Shelbyville", Some("rep-2"))));
    rows.extend((20..25).map(|i| lead(i, "Ogdenville", None)));
    seed(&store, rows).await;

    let config = test_config();
    let rep_services = services_for(&store, Some(rep("rep-1")), &config);
    let admin_services = services_for(&store, Some(admin()), &config);
    let everything = FilterCriteria::default();

    let counts = rep_services.counts.get_counts(&everything).await.unwrap();
    assert_eq!(counts.filtered_count, 8);
    assert_eq!(counts.total_count, 8);
    assert_eq!(counts.per_field[&FilterField::District].get("Springfield"), Some(&8));
    assert!(counts.per_field[&FilterField::District].get("Shelbyville").is_none());

    let page = rep_services
        .query
        .query_leads(&everything, PageSpec::Offset { page: 0, page_size: 100 })
        .await
        .unwrap();
    assert_eq!(page.total, Some(8));
    assert!(page.rows.iter().all(|l| l.assigned_to.as_deref() == Some("rep-1")));

    let values = rep_services.unique.get_unique_values().await.unwrap();
    assert_eq!(values.fields[&FilterField::District], vec!["Springfield".to_string()]);

    // Filtering on another rep's district yields nothing rather than leaking rows
    let elsewhere = rep_services.counts.get_counts(&district("Shelbyville")).await.unwrap();
    assert_eq!(elsewhere.filtered_count, 0);

    let admin_counts = admin_services.counts.get_counts(&everything).await.unwrap();
    assert_eq!(admin_counts.total_count, 25);
    assert_eq!(admin_counts.per_field[&FilterField::District].len(), 3);
}

#[tokio::test]
async fn test_missing_identity_is_unauthorized_everywhere() {
    let store = Arc::new(InstrumentedStore::new(database()));
    seed(&store, vec![lead(1, "Springfield", None)]).await;
    let services = services_for(&store, None, &test_config());
    let criteria = FilterCriteria::default();

    let err = services.counts.get_counts(&criteria).await.unwrap_err();
    assert!(matches!(err, LeadError::Unauthorized(_)));
    let err = services.unique.get_unique_values().await.unwrap_err();
    assert!(matches!(err, LeadError::Unauthorized(_)));
    let err = services
        .query
        .query_leads(&criteria, PageSpec::Cursor { after: None, page_size: 10 })
        .await
        .unwrap_err();
    assert!(matches!(err, LeadError::Unauthorized(_)));
    assert_eq!(store.aggregate_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_identical_count_requests_share_one_query() {
    let store = Arc::new(InstrumentedStore::new(database()));
    seed(&store, (0..10).map(|i| lead(i, "Springfield", None)).collect()).await;
    let services = services_for(&store, Some(admin()), &test_config());
    let criteria = district("Springfield");

    let (a, b) = tokio::join!(
        services.counts.get_counts(&criteria),
        services.counts.get_counts(&criteria)
    );
    assert_eq!(a.unwrap().filtered_count, 10);
    assert_eq!(b.unwrap().filtered_count, 10);
    assert_eq!(store.aggregate_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_empty_counts_are_not_kept() {
    let store = Arc::new(InstrumentedStore::new(database()));
    let services = services_for(&store, Some(admin()), &test_config());
    let criteria = FilterCriteria::default();

    let counts = services.counts.get_counts(&criteria).await.unwrap();
    assert!(counts.is_empty());
    assert!(!counts.is_degraded());

    seed(&store, vec![lead(1, "Springfield", None)]).await;
    let counts = services.counts.get_counts(&criteria).await.unwrap();
    assert_eq!(counts.filtered_count, 1);
    assert_eq!(store.aggregate_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_backend_failure_degrades_counts_without_caching() {
    let store = Arc::new(InstrumentedStore::new(database()));
    seed(&store, (0..3).map(|i| lead(i, "Springfield", None)).collect()).await;
    let services = services_for(&store, Some(admin()), &test_config());
    let criteria = district("Springfield");

    store.fail_aggregates(true);
    let counts = services.counts.get_counts(&criteria).await.unwrap();
    assert!(counts.is_degraded());
    assert_eq!(counts.filtered_count, 0);
    assert!(counts.has_active_filters);

    store.fail_aggregates(false);
    let counts = services.counts.get_counts(&criteria).await.unwrap();
    assert!(!counts.is_degraded());
    assert_eq!(counts.filtered_count, 3);
}

#[tokio::test(start_paused = true)]
async fn test_slow_pages_time_out() {
    let store = Arc::new(InstrumentedStore::new(database()));
    store.delay_lists(Duration::from_secs(20));
    let services = services_for(&store, Some(admin()), &test_config());

    let err = services
        .query
        .query_leads(&FilterCriteria::default(), PageSpec::Offset { page: 0, page_size: 10 })
        .await
        .unwrap_err();
    match err {
        LeadError::QueryTimeout(limit) => assert_eq!(limit, Duration::from_secs(15)),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_custom_field_counts_and_values() {
    let store = Arc::new(InstrumentedStore::new(database()));
    let mut rows: Vec<_> = (0..4).map(|i| lead(i, "Springfield", None)).collect();
    rows[0].custom_fields.insert("grade".into(), serde_json::json!(10));
    rows[1].custom_fields.insert("grade".into(), serde_json::json!(10));
    rows[2].custom_fields.insert("grade".into(), serde_json::json!(11));
    seed(&store, rows).await;
    let services = services_for(&store, Some(admin()), &test_config());

    let counts = services.counts.get_counts(&FilterCriteria::default()).await.unwrap();
    assert_eq!(counts.custom_fields["grade"].get("10"), Some(&2));
    assert_eq!(counts.custom_fields["grade"].get("11"), Some(&1));

    let values = services.unique.get_unique_values().await.unwrap();
    assert_eq!(values.custom_fields["grade"], vec!["10".to_string(), "11".to_string()]);
}

#[tokio::test]
async fn test_custom_keys_follow_caller_scope() {
    let store = Arc::new(InstrumentedStore::new(database()));
    let mut rows: Vec<_> = (0..3).map(|i| lead(i, "Springfield", Some("rep-1"))).collect();
    let mut hidden = lead(3, "Shelbyville", Some("rep-2"));
    hidden.custom_fields.insert("scholarship".into(), serde_json::json!("full"));
    rows.push(hidden);
    seed(&store, rows).await;

    let config = test_config();
    let rep_services = services_for(&store, Some(rep("rep-1")), &config);
    let values = rep_services.unique.get_unique_values().await.unwrap();
    assert!(!values.custom_fields.contains_key("scholarship"));
    let counts = rep_services.counts.get_counts(&FilterCriteria::default()).await.unwrap();
    assert!(!counts.custom_fields.contains_key("scholarship"));

    let owner_services = services_for(&store, Some(rep("rep-2")), &config);
    let values = owner_services.unique.get_unique_values().await.unwrap();
    assert_eq!(values.custom_fields["scholarship"], vec!["full".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_slow_key_discovery_counts_against_the_deadline() {
    let store = Arc::new(InstrumentedStore::new(database()));
    store.delay_key_discovery(Duration::from_secs(20));
    let services = services_for(&store, Some(admin()), &test_config());

    let err = services.unique.get_unique_values().await.unwrap_err();
    assert!(matches!(err, LeadError::QueryTimeout(_)));
    let err = services.counts.get_counts(&FilterCriteria::default()).await.unwrap_err();
    assert!(matches!(err, LeadError::QueryTimeout(_)));
    assert_eq!(store.aggregate_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_first_and_last_offset_pages_of_237_rows() {
    let store = Arc::new(InstrumentedStore::new(database()));
    seed(&store, (0..237).map(|i| lead(i, "Springfield", None)).collect()).await;
    let services = services_for(&store, Some(admin()), &test_config());
    let criteria = FilterCriteria::default();

    let first = services
        .query
        .query_leads(&criteria, PageSpec::Offset { page: 0, page_size: 100 })
        .await
        .unwrap();
    assert_eq!(first.rows.len(), 100);
    assert_eq!(first.total, Some(237));
    assert_eq!(first.rows[0].id, "lead-0000");

    let last = services
        .query
        .query_leads(&criteria, PageSpec::Offset { page: 2, page_size: 100 })
        .await
        .unwrap();
    assert_eq!(last.rows.len(), 37);
    assert!(!last.has_more);
    assert_eq!(last.rows[0].id, "lead-0200");
}

#[tokio::test]
async fn test_filter_store_pagination_selects_the_same_window() {
    let store = Arc::new(InstrumentedStore::new(database()));
    seed(&store, (0..237).map(|i| lead(i, "Springfield", None)).collect()).await;
    let services = services_for(&store, Some(admin()), &test_config());

    let filters = FilterStore::new(Duration::from_millis(800));
    assert_eq!(filters.pagination().page, 0);
    filters.set_page(1);

    let page = services
        .query
        .query_leads(filters.committed().criteria(), filters.pagination().into())
        .await
        .unwrap();
    assert_eq!(page.rows.len(), 100);
    assert_eq!(page.rows[0].id, "lead-0100");
}
