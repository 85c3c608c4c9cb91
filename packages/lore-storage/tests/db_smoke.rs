use serde_json::json;
use time::{Duration, OffsetDateTime};

use lore_config::Postgres;
use lore_storage::{
	db::Db,
	insights, jobs,
	memories::{self, EmbeddingColumn, SimilarityQuery},
	models::{
		JOB_COMPLETED, JOB_FAILED, JOB_PENDING, JOB_PROCESSING, NewInsight, NewMemory,
		PROCESSING_MARKER_TYPE, TASK_BATCH_MEMORY_PROCESSING,
	},
};
use lore_testkit::TestDatabase;

const VECTOR_DIM: u32 = 3;

async fn setup(base_dsn: &str) -> (TestDatabase, Db) {
	let test_db = TestDatabase::new(base_dsn).await.expect("Failed to create test database.");
	let cfg = Postgres { dsn: test_db.dsn().to_string(), pool_max_conns: 2 };
	let db = Db::connect(&cfg).await.expect("Failed to connect to Postgres.");

	db.ensure_schema(VECTOR_DIM).await.expect("Failed to ensure schema.");

	(test_db, db)
}

fn new_memory(content: &str, memory_type: &str) -> NewMemory {
	NewMemory {
		project_id: 7,
		session_id: None,
		content: content.to_string(),
		summary: None,
		smart_tags: vec!["db".to_string()],
		memory_type: memory_type.to_string(),
		importance_score: 0.5,
		created_at: OffsetDateTime::now_utc(),
	}
}

fn new_insight(insight_type: &str, source_ids: Vec<i64>) -> NewInsight {
	NewInsight {
		project_id: Some(7),
		insight_type: insight_type.to_string(),
		title: "Locking pattern".to_string(),
		content: "Row locks are taken in id order.".to_string(),
		confidence: 0.8,
		tags: vec!["db".to_string()],
		source_memory_ids: source_ids,
		cluster_key: None,
	}
}

async fn insert_ready(db: &Db, content: &str, vector: &str) -> i64 {
	let id = memories::insert_memory(db, &new_memory(content, "note"))
		.await
		.expect("Failed to insert memory.");

	memories::mark_embedded(db, id, vector, Some(vector), OffsetDateTime::now_utc())
		.await
		.expect("Failed to mark memory embedded.");

	id
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set LORE_PG_DSN to run."]
async fn schema_bootstrap_is_idempotent() {
	let Some(base_dsn) = lore_testkit::env_dsn() else {
		eprintln!("Skipping schema_bootstrap_is_idempotent; set LORE_PG_DSN to run this test.");

		return;
	};
	let (test_db, db) = setup(&base_dsn).await;

	db.ensure_schema(VECTOR_DIM).await.expect("Second schema bootstrap failed.");

	let count: i64 = sqlx::query_scalar(
		"SELECT count(*) FROM information_schema.tables WHERE table_name IN ('memories', 'processing_jobs', 'insights', 'search_analytics')",
	)
	.fetch_one(&db.pool)
	.await
	.expect("Failed to query schema tables.");

	assert_eq!(count, 4);

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set LORE_PG_DSN to run."]
async fn similarity_search_orders_and_filters() {
	let Some(base_dsn) = lore_testkit::env_dsn() else {
		eprintln!("Skipping similarity_search_orders_and_filters; set LORE_PG_DSN to run this test.");

		return;
	};
	let (test_db, db) = setup(&base_dsn).await;
	let close = insert_ready(&db, "close", "[1,0,0]").await;
	let near = insert_ready(&db, "near", "[0.8,0.6,0]").await;
	let _far = insert_ready(&db, "far", "[0,0,1]").await;
	let rows = memories::search_by_embedding(
		&db,
		&SimilarityQuery {
			column: EmbeddingColumn::Content,
			vector_text: "[1,0,0]",
			project_id: Some(7),
			session_id: None,
			memory_type: None,
			created_after: None,
			exclude_failed: true,
			threshold: 0.5,
			limit: 10,
		},
	)
	.await
	.expect("Similarity search failed.");
	let ids: Vec<i64> = rows.iter().map(|row| row.memory.id).collect();

	assert_eq!(ids, vec![close, near]);
	assert!((rows[0].similarity - 1.0).abs() < 1e-4);
	assert!((rows[1].similarity - 0.8).abs() < 1e-4);

	let err = memories::search_by_embedding(
		&db,
		&SimilarityQuery {
			column: EmbeddingColumn::Tags,
			vector_text: "[1,0,0]",
			project_id: None,
			session_id: None,
			memory_type: None,
			created_after: None,
			exclude_failed: false,
			threshold: 0.0,
			limit: 0,
		},
	)
	.await
	.expect_err("Zero limit must be rejected.");

	assert!(matches!(err, lore_storage::Error::InvalidArgument(_)));

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set LORE_PG_DSN to run."]
async fn processing_marker_hides_memory_from_unprocessed() {
	let Some(base_dsn) = lore_testkit::env_dsn() else {
		eprintln!(
			"Skipping processing_marker_hides_memory_from_unprocessed; set LORE_PG_DSN to run."
		);

		return;
	};
	let (test_db, db) = setup(&base_dsn).await;
	let first = insert_ready(&db, "first", "[1,0,0]").await;
	let second = insert_ready(&db, "second", "[0,1,0]").await;
	let pending = memories::insert_memory(&db, &new_memory("pending", "note"))
		.await
		.expect("Failed to insert pending memory.");
	let now = OffsetDateTime::now_utc();
	let unprocessed = memories::fetch_unprocessed(&db, 10).await.expect("Fetch failed.");
	let mut ids: Vec<i64> = unprocessed.iter().map(|row| row.id).collect();

	ids.sort_unstable();

	assert_eq!(ids, vec![first, second]);
	assert!(!ids.contains(&pending));
	assert!(
		insights::insert_processing_marker(&db.pool, first, 7, now).await.expect("Insert failed.")
	);
	assert!(
		!insights::insert_processing_marker(&db.pool, first, 7, now).await.expect("Insert failed.")
	);
	assert!(insights::has_processing_marker(&db, first).await.expect("Lookup failed."));

	let unprocessed = memories::fetch_unprocessed(&db, 10).await.expect("Fetch failed.");
	let ids: Vec<i64> = unprocessed.iter().map(|row| row.id).collect();

	assert_eq!(ids, vec![second]);

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set LORE_PG_DSN to run."]
async fn embedding_failures_become_permanent_after_max_attempts() {
	let Some(base_dsn) = lore_testkit::env_dsn() else {
		eprintln!(
			"Skipping embedding_failures_become_permanent_after_max_attempts; set LORE_PG_DSN to run."
		);

		return;
	};
	let (test_db, db) = setup(&base_dsn).await;
	let id = memories::insert_memory(&db, &new_memory("flaky", "bug"))
		.await
		.expect("Failed to insert memory.");
	let now = OffsetDateTime::now_utc();
	let claimed = memories::claim_for_embedding(&db, 10, 2, Duration::minutes(5), now)
		.await
		.expect("Claim failed.");

	assert_eq!(claimed.len(), 1);

	memories::mark_embedding_failed(&db, id, "timeout", 2, now).await.expect("Mark failed.");

	let row = memories::fetch_memory(&db, id).await.expect("Fetch failed.").expect("Missing row.");

	assert_eq!(row.processing_status, "failed");

	memories::mark_embedding_failed(&db, id, "timeout", 2, now).await.expect("Mark failed.");

	let row = memories::fetch_memory(&db, id).await.expect("Fetch failed.").expect("Missing row.");

	assert_eq!(row.processing_status, "failed_permanent");
	assert_eq!(row.embedding_attempts, 2);

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set LORE_PG_DSN to run."]
async fn jobs_track_progress_and_retries() {
	let Some(base_dsn) = lore_testkit::env_dsn() else {
		eprintln!("Skipping jobs_track_progress_and_retries; set LORE_PG_DSN to run this test.");

		return;
	};
	let (test_db, db) = setup(&base_dsn).await;
	let now = OffsetDateTime::now_utc();
	let job_id = jobs::create_job(
		&db,
		TASK_BATCH_MEMORY_PROCESSING,
		&[],
		JOB_PROCESSING,
		&json!({ "total": 0 }),
		now,
	)
	.await
	.expect("Create failed.");

	jobs::update_progress(&db, job_id, Some(&[1, 2]), &json!({ "total": 2 }))
		.await
		.expect("Progress update failed.");
	jobs::finish_job(&db, job_id, JOB_COMPLETED, &json!({ "total": 2 }), None, now)
		.await
		.expect("Finish failed.");

	let job = jobs::fetch_job(&db, job_id).await.expect("Fetch failed.").expect("Missing job.");

	assert_eq!(job.status, JOB_COMPLETED);
	assert_eq!(job.source_ids, vec![1, 2]);
	assert!(job.completed_at.is_some());

	let err = jobs::finish_job(&db, job_id, JOB_PENDING, &json!({}), None, now)
		.await
		.expect_err("Non-terminal status must be rejected.");

	assert!(matches!(err, lore_storage::Error::InvalidArgument(_)));

	let retry_id = jobs::enqueue_retry(&db, 42, "provider down", now).await.expect("Enqueue failed.");
	let claimed = jobs::claim_retry_jobs(&db, 10, Duration::minutes(1), now)
		.await
		.expect("Claim failed.");

	assert_eq!(claimed.len(), 1);
	assert_eq!(claimed[0].id, retry_id);
	assert_eq!(claimed[0].source_ids, vec![42]);

	let again = jobs::claim_retry_jobs(&db, 10, Duration::minutes(1), now)
		.await
		.expect("Claim failed.");

	assert!(again.is_empty());

	jobs::reschedule_retry(&db, retry_id, "still down", now, false, now)
		.await
		.expect("Reschedule failed.");

	let job = jobs::fetch_job(&db, retry_id).await.expect("Fetch failed.").expect("Missing job.");

	assert_eq!(job.status, JOB_PENDING);
	assert_eq!(job.attempts, 1);

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set LORE_PG_DSN to run."]
async fn insights_and_markers_are_written_together() {
	let Some(base_dsn) = lore_testkit::env_dsn() else {
		eprintln!("Skipping insights_and_markers_are_written_together; set LORE_PG_DSN to run.");

		return;
	};
	let (test_db, db) = setup(&base_dsn).await;
	let first = insert_ready(&db, "first", "[1,0,0]").await;
	let second = insert_ready(&db, "second", "[0,1,0]").await;
	let now = OffsetDateTime::now_utc();
	let broken = vec![
		new_insight("pattern", vec![first, second]),
		new_insight(PROCESSING_MARKER_TYPE, vec![first, second]),
	];
	let err = insights::insert_insights_and_mark(&db, &broken, &[(first, 7), (second, 7)], now)
		.await
		.expect_err("Marker-typed insight must be rejected.");

	assert!(matches!(err, lore_storage::Error::InvalidArgument(_)));

	let count: i64 = sqlx::query_scalar("SELECT count(*) FROM insights")
		.fetch_one(&db.pool)
		.await
		.expect("Failed to count insights.");

	assert_eq!(count, 0);
	assert!(!insights::has_processing_marker(&db, first).await.expect("Lookup failed."));

	let ids = insights::insert_insights_and_mark(
		&db,
		&[new_insight("pattern", vec![first, second])],
		&[(first, 7), (second, 7)],
		now,
	)
	.await
	.expect("Insert failed.");

	assert_eq!(ids.len(), 1);
	assert!(insights::has_processing_marker(&db, first).await.expect("Lookup failed."));
	assert!(insights::has_processing_marker(&db, second).await.expect("Lookup failed."));

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set LORE_PG_DSN to run."]
async fn open_retry_is_reused_for_the_same_memory() {
	let Some(base_dsn) = lore_testkit::env_dsn() else {
		eprintln!("Skipping open_retry_is_reused_for_the_same_memory; set LORE_PG_DSN to run.");

		return;
	};
	let (test_db, db) = setup(&base_dsn).await;
	let now = OffsetDateTime::now_utc();
	let first = jobs::enqueue_retry(&db, 42, "provider down", now).await.expect("Enqueue failed.");
	let again = jobs::enqueue_retry(&db, 42, "provider down", now).await.expect("Enqueue failed.");
	let other = jobs::enqueue_retry(&db, 43, "provider down", now).await.expect("Enqueue failed.");

	assert_eq!(first, again);
	assert_ne!(first, other);

	let claimed = jobs::claim_retry_jobs(&db, 10, Duration::minutes(1), now)
		.await
		.expect("Claim failed.");

	assert_eq!(claimed.len(), 2);
	assert_eq!(
		jobs::enqueue_retry(&db, 42, "still down", now).await.expect("Enqueue failed."),
		first
	);

	jobs::reschedule_retry(&db, first, "gave up", now, true, now)
		.await
		.expect("Reschedule failed.");

	let job = jobs::fetch_job(&db, first).await.expect("Fetch failed.").expect("Missing job.");

	assert_eq!(job.status, JOB_FAILED);

	let fresh = jobs::enqueue_retry(&db, 42, "down again", now).await.expect("Enqueue failed.");

	assert_ne!(fresh, first);

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}
